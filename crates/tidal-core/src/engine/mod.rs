//! Pipeline orchestration.

mod driver;

pub use driver::{DriverOptions, DriverReport, DriverState, StreamDriver};
