pub mod progress;
pub mod retry;

pub use progress::{format_bytes, format_duration, format_eta, format_speed};
pub use retry::RetryPolicy;
