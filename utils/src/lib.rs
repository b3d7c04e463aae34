#![warn(rust_2018_idioms)]
pub mod clock;
pub mod config;
pub mod log;

pub use clock::{Clock, FakeClock, SystemClock};
pub use config::ControllerConfig;
