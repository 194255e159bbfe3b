//! Serverless text-generation worker for MedGemma.
//!
//! Jobs arrive from a queue one at a time, are validated, run through a
//! model loaded once per process, and answered with a JSON result.

pub mod cli;
pub mod config;
pub mod error;
pub mod job;
pub mod runtime;
pub mod service;
pub mod worker;

// Re-export commonly used types
pub use error::{Error, Result};
pub use job::{Job, JobInput, JobResult};
pub use service::InferenceService;
pub use worker::{JobSource, Worker};
