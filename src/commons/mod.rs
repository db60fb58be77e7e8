//! Common types used by the various service components.

pub mod error;
