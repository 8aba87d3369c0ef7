//! HTTP surface over the job subsystem: submission, inspection, manual and
//! scheduler-triggered batch runs, and the live status stream.

pub mod app;
pub mod config;
pub mod context;
pub mod middleware;
