#![forbid(unsafe_code)]

pub use error::Error;

pub mod error;

pub type Result<T, E = Error> = std::result::Result<T, E>;
