//! External encoder invocation

pub mod ffmpeg;

pub use ffmpeg::{
    build_ffmpeg_args, build_ffmpeg_command, spawn_encoder, EncodeError, EncodeParams,
    EncoderProcess, ProcessHandle,
};
