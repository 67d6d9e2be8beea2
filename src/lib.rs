//! Outreach — campaign scheduling and response handling for a small
//! lead-management CRM.

pub mod ai;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ingest;
pub mod limiter;
pub mod model;
pub mod respond;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod template;
pub mod transport;

pub use error::{Error, Result};
