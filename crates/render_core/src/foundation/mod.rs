//! Foundation module - Core utilities and types
//!
//! This module provides fundamental utilities used throughout the pipeline:
//! - Math types and operations
//! - Generation-checked handle collections
//! - Frame and wall-clock time sources
//! - Logging utilities

pub mod math;
pub mod collections;
pub mod time;
pub mod logging;
