pub mod base;
pub mod demo;
pub mod encoder;
pub mod logging;

pub use base::*;
pub use demo::*;
pub use encoder::*;
pub use logging::*;
