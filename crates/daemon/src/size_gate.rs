//! Output size gate
//!
//! Post-encode check deciding whether a transcoded result is worth keeping
//! compared to the original it would replace.

use serde::{Deserialize, Serialize};

/// Result of the size gate check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SizeGateResult {
    /// Output size is acceptable
    Accept,
    /// Output is larger than the allowed share of the original
    Reject {
        original_bytes: u64,
        output_bytes: u64,
        ratio: f64,
    },
}

/// Check if the output file size passes the size gate.
///
/// Returns `Reject` if `output_bytes > original_bytes * max_ratio`, otherwise
/// `Accept`. With `max_ratio = 1.0` an output of exactly the original size is
/// accepted.
pub fn check_size_gate(original_bytes: u64, output_bytes: u64, max_ratio: f64) -> SizeGateResult {
    let threshold = original_bytes as f64 * max_ratio;

    if output_bytes as f64 > threshold {
        let actual_ratio = if original_bytes > 0 {
            output_bytes as f64 / original_bytes as f64
        } else {
            f64::INFINITY
        };
        SizeGateResult::Reject {
            original_bytes,
            output_bytes,
            ratio: actual_ratio,
        }
    } else {
        SizeGateResult::Accept
    }
}
