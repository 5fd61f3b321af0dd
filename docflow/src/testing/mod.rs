//! Testing utilities for docflow deployments.
//!
//! This module provides:
//! - Scripted stage capabilities
//! - A recording webhook transport
//! - An in-memory deployment harness driven by a manual clock

mod fixtures;
mod mocks;

pub use fixtures::{new_document, TestHarness};
pub use mocks::{
    AwaitingCapability, CallCounter, CancellingCapability, RecordingTransport, ScriptedCapability, StaticCapability,
};
