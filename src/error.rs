//! Fatal error classification. Silent, per-packet faults never reach this
//! type — by definition they are handled inline and do not propagate.

use thiserror::Error;

/// Top-level error returned by `main`. Distinguishes the two fatal
/// severities of SPEC_FULL §7: errors before the loop starts, and errors
/// that end an already-running loop.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("startup failed: {0}")]
    Startup(#[from] anyhow::Error),

    #[error("fatal runtime error: {0}")]
    Runtime(anyhow::Error),
}

impl TunnelError {
    pub fn runtime(err: impl Into<anyhow::Error>) -> Self {
        TunnelError::Runtime(err.into())
    }

    /// Process exit code for this error. Both variants are fatal and exit
    /// non-zero; only the diagnostic message differs.
    pub fn exit_code(&self) -> i32 {
        1
    }
}
