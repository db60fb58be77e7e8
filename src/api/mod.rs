//! Data structures for the HTTP API.

pub mod status;
