//! Backend-agnostic orchestration of suite / experiment / simulation runs
//!
//! Build a hierarchy of [`entities`], open a [`session::Session`] on a
//! [`platform::Platform`], commission items individually or in batches, and
//! harvest their outputs with the [`analysis`] pipeline.

pub mod analysis;
pub mod config;
pub mod coordination;
pub mod entities;
pub mod error;
pub mod platform;
pub mod session;
pub mod status;
pub mod telemetry;

pub use error::{OrchestrationError, Result};

#[cfg(test)]
pub(crate) mod test_support;
