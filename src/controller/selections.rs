//! Network selection annotation parser
//!
//! The `k8s.v1.cni.cncf.io/networks` annotation comes in two shapes:
//!
//! - a JSON array: `[{"name":"br0","namespace":"net","interface":"eth1"}]`
//! - a comma separated list of `[namespace/]name[@interface]` units
//!
//! The JSON form is tried first. Elements without a namespace get the
//! namespace of the annotated object.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::crd::NetworkSelectionElement;
use crate::error::{Error, Result};

/// DNS-1123 label
static VALID_UNIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex is valid")
});

/// Parse a network selection annotation into normalized selection elements
pub fn parse_network_selections(
    raw: &str,
    default_namespace: &str,
) -> Result<Vec<NetworkSelectionElement>> {
    if raw.is_empty() {
        return Err(Error::InvalidSelection(
            "empty selection list".to_string(),
        ));
    }

    let mut selections = match serde_json::from_str::<Option<Vec<NetworkSelectionElement>>>(raw) {
        Ok(selections) => selections.unwrap_or_default(),
        // A comma separated unit can never start with '[', so this was meant as JSON.
        Err(e) if raw.trim_start().starts_with('[') => {
            return Err(Error::InvalidSelection(format!(
                "malformed JSON selection list: {}",
                e
            )));
        }
        Err(e) => {
            debug!(
                "'{}' is not in JSON format: {}, parsing as comma separated list",
                raw, e
            );
            raw.split(',')
                .map(|unit| parse_selection_element(unit.trim(), default_namespace))
                .collect::<Result<Vec<_>>>()?
        }
    };

    for selection in selections.iter_mut() {
        if selection.namespace.is_empty() {
            selection.namespace = default_namespace.to_string();
        }
    }

    Ok(selections)
}

/// Parse one `[namespace/]name[@interface]` unit
fn parse_selection_element(
    selection: &str,
    default_namespace: &str,
) -> Result<NetworkSelectionElement> {
    let (namespace, rest) = match selection.split('/').collect::<Vec<_>>().as_slice() {
        [name] => (default_namespace, *name),
        [namespace, name] => (*namespace, *name),
        _ => {
            return Err(Error::InvalidSelection(format!(
                "more than one '/' in '{}'",
                selection
            )))
        }
    };

    let (name, interface) = match rest.split('@').collect::<Vec<_>>().as_slice() {
        [name] => (*name, ""),
        [name, interface] => (*name, *interface),
        _ => {
            return Err(Error::InvalidSelection(format!(
                "more than one '@' in '{}'",
                selection
            )))
        }
    };

    for unit in [namespace, name, interface] {
        if !unit.is_empty() && !VALID_UNIT.is_match(unit) {
            return Err(Error::InvalidSelection(format!(
                "invalid unit '{}' in '{}'",
                unit, selection
            )));
        }
    }

    Ok(NetworkSelectionElement {
        namespace: namespace.to_string(),
        name: name.to_string(),
        interface_request: interface.to_string(),
    })
}
