pub mod progress;
pub mod retry;

pub use progress::{ProgressEstimate, format_bytes, format_speed, format_duration};
pub use retry::{IntegrityFailurePolicy, RetryPolicy, RetryStrategy};
