//! Termination enforcement: platform signal capabilities, the session-wide
//! timeout controller and postmortem thread dumps.

mod process_control;
mod session;
mod stack_dump;

pub use process_control::{ProcessControl, UnixProcessControl};
pub use session::{
    SESSION_TIMEOUT_EXIT_CODE, SessionState, SessionTimeoutConfig, SessionTimeoutController,
    SessionTimeoutHandle, SessionTimeoutReport,
};
pub use stack_dump::capture_thread_dump;
