//! Prometheus metrics for the net-attach-def controller

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

/// Outcome label shared by the sync and recovery counters
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabels {
    pub result: String,
}

/// Service syncs by outcome
pub static SYNCS: Lazy<Family<ResultLabels, Counter>> = Lazy::new(Family::default);

/// NetworkAttachmentDefinition recovery attempts by outcome
pub static RECOVERIES: Lazy<Family<ResultLabels, Counter>> = Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();
    registry.register(
        "net_attach_def_controller_syncs",
        "Service endpoint syncs by result",
        SYNCS.clone(),
    );
    registry.register(
        "net_attach_def_controller_recoveries",
        "NetworkAttachmentDefinition recovery attempts by result",
        RECOVERIES.clone(),
    );
    registry
});

pub fn record_sync(result: &str) {
    SYNCS
        .get_or_create(&ResultLabels {
            result: result.to_string(),
        })
        .inc();
}

pub fn record_recovery(result: &str) {
    RECOVERIES
        .get_or_create(&ResultLabels {
            result: result.to_string(),
        })
        .inc();
}
