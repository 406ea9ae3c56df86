pub mod catalog;
pub mod time;

pub use catalog::CatalogPort;
pub use time::TimePort;
