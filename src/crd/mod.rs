//! Custom Resource Definitions and annotation types
//!
//! The NetworkAttachmentDefinition CRD is owned externally; it is modelled here
//! so it can be watched, read and recreated.

mod network_attachment_definition;
mod types;

pub use network_attachment_definition::{
    NetworkAttachmentDefinition, NetworkAttachmentDefinitionSpec,
};
pub use types::*;
