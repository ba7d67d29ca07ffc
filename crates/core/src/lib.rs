//! Shared building blocks for the digital-human generator.
//!
//! Domain types, the error type, media classification, character folder
//! discovery, character configuration merging, and artifact naming.

pub mod character;
pub mod config;
pub mod error;
pub mod media;
pub mod naming;
pub mod types;
