//! Testing utilities
//!
//! In-memory logger and tracer backends for asserting on emitted records and
//! span trees without installing a subscriber or exporter.

pub mod mocks;

pub use mocks::*;
