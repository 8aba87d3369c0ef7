//! Infrastructure layer: the durable job queue, its stores and configuration.

pub mod config;
pub mod jobs;
