//! Shared foundation for the ShopStream media engine: configuration,
//! error taxonomy, logging bootstrap, Prometheus metrics, and access-token
//! validation.

pub mod auth;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

pub use config::Config;
pub use error::{Error, Result};
