pub mod backpressure;
pub mod latency_window;

pub use backpressure::*;
pub use latency_window::*;
