//! CryptoVersus Backend Library
//!
//! Exposes core modules for use by the binary and integration tests.

pub mod allocator;
pub mod api;
pub mod models;
pub mod rules;
pub mod scrapers;
pub mod store;
pub mod worker;
