// src/lib.rs
//
// Twoine agent: turns site, service, domain and database records into OS
// resources and keeps both sides consistent when a step fails halfway.

pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod store;
pub mod sys;
pub mod validate;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use orchestrator::ControlPlane;
