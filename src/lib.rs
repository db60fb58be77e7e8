//! The _tokensign_ library crate.
//!
//! An HTTP service that signs uploaded binaries with a key held on a
//! PKCS#11 hardware token.

pub mod api;
pub mod commons;
pub mod config;
pub mod constants;
pub mod daemon;
