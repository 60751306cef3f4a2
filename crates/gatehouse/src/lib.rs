//! Gatehouse: an authenticating reverse proxy.
//!
//! Requests pass an identity layer and an allow-list gate before they are
//! relayed, streaming and upgrade-capable, to a single upstream service.

pub mod access;
pub mod auth;
pub mod config;
pub mod gateway;
pub mod oidc;
pub mod proxy;
