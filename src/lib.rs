//! Inbox triage: redaction, analysis, prioritization and gated reply
//! drafting for an insurance customer inbox.

pub mod analysis;
pub mod api;
pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod privacy;
pub mod review;
pub mod store;
