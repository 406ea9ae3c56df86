pub mod catalog;
pub mod std_adapters;

pub use catalog::ConfigCatalog;
pub use std_adapters::{ManualClock, StdTimeAdapter};
