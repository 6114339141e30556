pub mod drain;
pub mod metrics;
pub mod strng;
pub mod telemetry;

pub use strng::Strng;
