//! Disk overflow tier.
//!
//! This module owns the on-disk data file, the asynchronous write pipeline,
//! and marker-based retrieval:
//!
//! - [`substitute`]: Placeholder/Marker stand-ins for elements moving to disk
//! - [`region`]: free-region accounting for the append-structured data file
//! - [`factory`]: the overflow factory and its writer thread
//!
//! # Data file format
//!
//! The data file is a bag of serialized element records. Each live record
//! is indexed only by its in-memory marker (position + length); there is no
//! on-disk index or header, so the file is not recoverable across restarts
//! and is deleted on shutdown.

pub(crate) mod factory;
pub(crate) mod region;
pub(crate) mod substitute;
