//! Utility functions and helpers.

mod clock;
mod logging;
mod request_id;
mod shutdown;

pub use clock::{unix_millis, Clock, ManualClock, SystemClock};
pub use logging::init_logging;
pub use request_id::RequestId;
pub use shutdown::ShutdownSignal;
