pub mod app;
pub mod cli;
pub mod error;
pub mod models;
pub mod orchestration;
pub mod resilience;
pub mod workflow;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
