//! local-translate: offline translation and text-to-speech
//!
//! Inference runs in isolated worker subprocesses, one per model family,
//! each holding its own GPU context. This crate supervises those workers:
//! it speaks their line-delimited JSON protocol, tracks each model's
//! lifecycle from download through ready, recovers from crashes and hangs,
//! and reports download progress.

pub mod catalog;
pub mod commands;
pub mod config;
pub mod download;
pub mod error;
pub mod lifecycle;
pub mod speech;
pub mod store;
pub mod translation;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use error::{CommandError, ModelError, Result};
