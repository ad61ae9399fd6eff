pub mod cache;
pub mod cleanup;
pub mod config;
pub mod content;
pub mod error;
pub mod export;
pub mod image_processing;
pub mod manifest;
pub mod mcp_server;
pub mod migration;
pub mod pipeline;
pub mod processor;
pub mod registry;
pub mod singleflight;
pub mod storage;
pub mod tools;
pub mod web;

pub use error::{PipelineError, PipelineResult};
pub use pipeline::MediaPipeline;
