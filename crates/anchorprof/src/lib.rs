pub mod cli;
pub mod commands;
pub mod error;
pub mod parser;
pub mod stats;

pub use error::{Error, Result};
