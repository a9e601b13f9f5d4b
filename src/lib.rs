pub mod cluster;
pub mod controller;
pub mod error;
pub mod expectations;
pub mod hasher;
pub mod hook;
pub mod inplace;
pub mod metrics;
pub mod queue;
pub mod resources;
pub mod revision;
pub mod serve;
pub mod utils;

pub use error::{Error, Result};
