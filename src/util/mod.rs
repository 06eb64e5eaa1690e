//! Utility functions and helpers.

mod logging;
mod session_id;
mod shutdown;

pub use logging::{init_logging, log_state_change};
pub use session_id::SessionId;
pub use shutdown::ShutdownSignal;
