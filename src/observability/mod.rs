pub mod logger;

pub use logger::{AccessLogger, AccessRecord};
