//! Digital key records and the backend boundary.
//!
//! This crate provides:
//! - [`DigitalKeyInfo`], [`Permission`], [`DeviceInfo`] - records as the
//!   backend delivers them
//! - [`KeyStore`] - installed keys with their [`KeyMaterial`] and the
//!   current-key selection
//! - [`KeyLifecycleService`] - the request/response surface of the key
//!   lifecycle backend, with [`MemoryKeyService`] for simulation

mod error;
mod model;
mod service;
mod store;

pub use error::*;
pub use model::*;
pub use service::*;
pub use store::*;
