mod rt;
pub mod logger;
pub mod time;

pub use rt::*;
