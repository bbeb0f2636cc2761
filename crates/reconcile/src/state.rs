//! Point-in-time snapshot of every object the engine tracks.
//!
//! Built fresh at pass start, owned by that pass, never mutated by the
//! sync phase. Absence is a valid slot state; any read failure other than
//! not-found aborts the pass, because reconciling against partial data is
//! worse than retrying the whole pass.

use std::collections::BTreeSet;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use tracing::debug;

use promstack_crd::{Alertmanager, MetricsExporter, MonitoringStack, Prometheus};
use promstack_model as model;

use crate::error::{Error, StoreError, ValidationError};
use crate::store::Store;

/// One `Option` slot per tracked managed object.
#[derive(Debug, Clone, Default)]
pub struct ClusterState {
    pub monitoring_secret: Option<Secret>,
    pub client_secret: Option<Secret>,
    pub scrape_targets_secret: Option<Secret>,
    pub alertmanager_config_secret: Option<Secret>,
    pub router_entry_cm: Option<ConfigMap>,
    pub prom_router_cm: Option<ConfigMap>,
    pub prom_lua_cm: Option<ConfigMap>,
    pub prom_lua_utils_cm: Option<ConfigMap>,
    pub alert_router_cm: Option<ConfigMap>,
    pub prometheus: Option<Prometheus>,
    pub prometheus_svc: Option<Service>,
    pub prometheus_ingress: Option<Ingress>,
    pub alertmanager: Option<Alertmanager>,
    pub alertmanager_svc: Option<Service>,
    pub alertmanager_ingress: Option<Ingress>,
    pub operator_deployment: Option<Deployment>,
    pub hub_deployment: Option<Deployment>,
    pub exporter: Option<MetricsExporter>,
    /// Default rule objects already present, by name.
    pub present_rules: BTreeSet<String>,
}

pub(crate) fn namespace_of(cr: &MonitoringStack) -> Result<String, Error> {
    cr.metadata
        .namespace
        .clone()
        .ok_or_else(|| Error::Validation(ValidationError::new("metadata.namespace", "missing")))
}

/// Read every tracked slot with point reads.
pub async fn read_cluster_state<S: Store>(
    store: &S,
    cr: &MonitoringStack,
) -> Result<ClusterState, Error> {
    let ns = namespace_of(cr)?;
    let mut state = ClusterState::default();

    state.monitoring_secret = store.get(&ns, &cr.spec.certs.monitoring_secret).await?;
    state.client_secret = store.get(&ns, &cr.spec.certs.monitoring_client_secret).await?;
    state.scrape_targets_secret =
        store.get(&ns, &model::scrape_targets_secret_name(cr)).await?;
    state.alertmanager_config_secret =
        store.get(&ns, &model::alertmanager_config_secret_name(cr)).await?;

    state.router_entry_cm = store.get(&ns, &model::router_entry_cm_name(cr)).await?;
    state.prom_router_cm = store.get(&ns, &model::prom_router_cm_name(cr)).await?;
    state.prom_lua_cm = store.get(&ns, &model::prom_lua_cm_name(cr)).await?;
    state.prom_lua_utils_cm = store.get(&ns, &model::prom_lua_utils_cm_name(cr)).await?;
    state.alert_router_cm = store.get(&ns, &model::alert_router_cm_name(cr)).await?;

    state.prometheus = store.get(&ns, &model::prometheus_name(cr)).await?;
    state.prometheus_svc = store.get(&ns, &model::prometheus_name(cr)).await?;
    state.prometheus_ingress = store.get(&ns, &model::prometheus_name(cr)).await?;

    state.alertmanager = store.get(&ns, &model::alertmanager_name(cr)).await?;
    state.alertmanager_svc = store.get(&ns, &model::alertmanager_name(cr)).await?;
    state.alertmanager_ingress = store.get(&ns, &model::alertmanager_name(cr)).await?;

    state.operator_deployment = store.get(&ns, &model::operator_name(cr)).await?;
    state.hub_deployment = store.get(&ns, &model::hub_ctl_name(cr)).await?;

    // The exporter CR belongs to a sibling operator; an uninstalled CRD
    // reads as absent, not as a failure.
    state.exporter = match store.list::<MetricsExporter>(&ns).await {
        Ok(mut exporters) => {
            if exporters.is_empty() {
                None
            } else {
                Some(exporters.remove(0))
            }
        }
        Err(StoreError::NotFound { .. }) => None,
        Err(e) => return Err(Error::Store(e)),
    };

    for name in model::DEFAULT_RULE_NAMES {
        if store.get::<promstack_crd::PrometheusRule>(&ns, name).await?.is_some() {
            state.present_rules.insert((*name).to_string());
        }
    }

    debug!(
        prometheus = state.prometheus.is_some(),
        alertmanager = state.alertmanager.is_some(),
        operator = state.operator_deployment.is_some(),
        "snapshot read"
    );
    Ok(state)
}
