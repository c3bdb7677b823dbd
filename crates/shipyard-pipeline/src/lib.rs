//! Build → scan gate → publish pipeline for Shipyard.
//!
//! A [`Pipeline`] fans a build out over its platforms, optionally gates the
//! result on a vulnerability scan, and publishes it to a registry.

mod event;
mod fanout;
pub mod pipeline;

pub use event::PipelineEvent;
pub use pipeline::Pipeline;
