pub mod common;
pub mod configs;
pub mod encoder;
pub mod omx;
