//! Bitget spot exchange binding (REST API v2)

pub mod auth;
pub mod client;
pub mod types;

pub use auth::Credentials;
pub use client::{BitgetSpot, ClientConfig, API_BASE_URL};
