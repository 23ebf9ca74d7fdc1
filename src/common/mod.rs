pub mod banner;
pub mod errors;
pub mod logger;

pub use errors::*;
