//! Card-issuing provider adapter for the Lithic REST API.

pub mod client;
pub mod types;

pub use client::LithicClient;
