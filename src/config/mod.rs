//! # arenadb Configuration Module
//!
//! This module centralizes all configuration constants for arenadb. Constants
//! are grouped by their functional area and interdependencies are documented
//! and enforced through compile-time assertions.
//!
//! ## Why Centralization?
//!
//! Allocation granularity, file granule, section size and slab sizes feed into
//! each other: a slab that is not granule sized leaves the committed file size
//! unaligned, and a section smaller than the mapping granularity cannot be
//! mapped at its own offset. Co-locating these values with compile-time checks
//! keeps them consistent.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency documentation
//!
//! Runtime options (read-only, no-create, encryption key, session initiator,
//! section size) live in [`crate::Config`].

pub mod constants;
pub use constants::*;
