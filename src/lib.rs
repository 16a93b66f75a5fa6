//! Kubernetes controller that publishes pods' secondary-network addresses
//! as Service endpoints and recovers NetworkAttachmentDefinitions that are
//! deleted while still referenced by pods.

pub mod controller;
pub mod crd;
pub mod error;
pub mod rest_api;

pub use error::{Error, Result};
