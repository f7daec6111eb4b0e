//! Process startup: logging and signal handling.

mod logging;
mod shutdown;

pub use logging::{LogRotation, LoggingConfig, LoggingGuard, ROOT_LOG_FILE, init_logging};
pub use shutdown::wait_for_shutdown_signal;
