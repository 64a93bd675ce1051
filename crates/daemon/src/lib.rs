//! easy-transcoder
//!
//! Task orchestration for transcoding media files with an external encoder:
//! a bounded queue of tasks, a worker driving each task through its lifecycle,
//! progress reporting from the encoder, cancellation, and a safe keep/replace
//! step once a result is ready.

pub mod api_server;
pub mod auto_reject;
pub mod encode;
pub mod error;
pub mod probe;
pub mod processor;
pub mod progress;
pub mod registry;
pub mod replace;
pub mod resolver;
pub mod scan;
pub mod scheduler;
pub mod size_gate;
pub mod startup;
pub mod task;

pub use easy_transcoder_config as config;
pub use easy_transcoder_config::Config;
pub use api_server::{create_router, run_server, ServerError};
pub use auto_reject::{AutoReject, PolicyRunner, ResolutionPolicy};
pub use encode::{build_ffmpeg_command, spawn_encoder, EncodeError, EncodeParams, ProcessHandle};
pub use error::TaskError;
pub use probe::{parse_probe_output, probe_media, MediaProbe, ProbeError, StreamInfo};
pub use processor::{BatchFailure, BatchReport, Processor};
pub use progress::{ProgressChannel, ProgressParser};
pub use registry::{RegistryError, SubmitError, TaskQueue, TaskRegistry};
pub use replace::{atomic_replace, ReplaceError};
pub use resolver::{ResolveError, Resolver};
pub use scan::{scan_directory, VIDEO_EXTENSIONS};
pub use scheduler::Worker;
pub use size_gate::{check_size_gate, SizeGateResult};
pub use startup::{check_tool_available, parse_ffmpeg_version, run_startup_checks, StartupError};
pub use task::{Cancellation, Task, TaskId, TaskStatus, TransitionError};
