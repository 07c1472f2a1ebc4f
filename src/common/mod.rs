//! Shared infrastructure

pub mod error;

pub use error::{CovaultError, Result};
