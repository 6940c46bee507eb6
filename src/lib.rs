#![doc = include_str!("../README.md")]

mod error;

pub mod codec;
pub mod config;
pub mod decoder;
pub mod dispatch;
pub mod framing;
pub mod pipeline;
pub mod record;
pub mod runner;
pub mod timesync;

pub use error::{BoxError, Error, Result};

pub(crate) mod prelude {
    pub use crate::error::{Error, Result};
}
