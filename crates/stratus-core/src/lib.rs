//! Stratus Core - Shared types and traits
//!
//! This crate defines the abstractions the provisioner works through:
//! - stratus-provisioner (lifecycle engine, pool, CLI)
//! - provider adapters (Hetzner Cloud, test doubles)
//!
//! Key types:
//! - ProviderClient trait (interface for the cloud server API)
//! - Connector trait (remote shell bootstrap once a server is reachable)
//! - Server descriptions and error taxonomy

pub mod types;
pub mod traits;
pub mod error;

pub use types::*;
pub use traits::*;
pub use error::*;
