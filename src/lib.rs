#![deny(missing_docs)]

//! This crate provides an in-memory multi-model data store
//! speaking a RESP-style protocol over TCP, with a server
//! and client built on top of it

mod config;
mod error;
mod network;
mod protocol;
mod pubsub;
mod storage;

#[macro_use]
extern crate failure;
pub use config::{Config, MasterAddr};
pub use error::StoreError;
pub use error::StoreErrorKind;
pub use network::{Client, Server};
pub use protocol::Frame;

/// Result type used by this crate
pub type Result<T> = core::result::Result<T, StoreError>;
