//! Exit codes for keelctl
//!
//! 0 success, 1 recoverable or non-critical failure, 2 critical failure,
//! 3 invalid invocation.

use keel_common::KeelError;

/// Exit code for success
pub const EXIT_SUCCESS: i32 = 0;

/// Exit code for recoverable failures (lock held, fetch exhausted, rolled back)
pub const EXIT_RECOVERABLE: i32 = 1;

/// Exit code for critical failures (stack unhealthy, corrupt archive)
pub const EXIT_CRITICAL: i32 = 2;

/// Exit code for invalid invocation
pub const EXIT_INVALID: i32 = 3;

/// Exit code after SIGINT/SIGTERM
pub const EXIT_INTERRUPTED: i32 = 130;

/// Exit code for an error escaping a command handler
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<KeelError>() {
        Some(keel) => keel.exit_code(),
        None => EXIT_CRITICAL,
    }
}

/// Operator remediation attached to the error, if any
pub fn remediation_for(err: &anyhow::Error) -> Option<String> {
    err.downcast_ref::<KeelError>()
        .and_then(|keel| keel.remediation())
        .map(str::to_string)
}
