//! Desired-state resolver for the MonitoringStack CRD.
//!
//! Everything in this crate is a pure function of the Specification: no
//! cluster reads, no randomness. `new_*` builders produce creation payloads;
//! `updated_*` builders clone the observed object and overlay every field
//! this operator controls, so server-managed metadata survives untouched.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::LocalObjectReference;
use promstack_crd::MonitoringStack;

mod alertmanager;
mod cert;
mod hub;
mod operator_deploy;
mod prometheus;
pub mod quantity;
mod router;
mod rules;
mod templates;

pub use alertmanager::*;
pub use cert::*;
pub use hub::*;
pub use operator_deploy::*;
pub use prometheus::*;
pub use router::*;
pub use rules::*;
pub use templates::*;

/// Label carrying the owning stack's name on every managed object.
pub const MANAGED_LABEL_KEY: &str = "monitoring.promstack.io/stack";
pub const APP_LABEL_KEY: &str = "app.kubernetes.io/name";
pub const APP_LABEL_VALUE: &str = "promstack";
pub const COMPONENT_LABEL_KEY: &str = "app.kubernetes.io/component";

pub const LOOPBACK_HOST: &str = "127.0.0.1";
/// External port for Prometheus and Alertmanager when the spec is silent.
pub const EXTERNAL_PORT: &str = "8443";
pub const DEFAULT_PV_SIZE: &str = "10Gi";
pub const DEFAULT_RETENTION: &str = "24h";
pub const DEFAULT_SCRAPE_INTERVAL: &str = "1m";
pub const DEFAULT_EVALUATION_INTERVAL: &str = "1m";
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
pub const DEFAULT_CLUSTER_NAME: &str = "mycluster";
pub const DEFAULT_HELM_PORT: i32 = 3000;
pub const DEFAULT_NODE_MEMORY_THRESHOLD: i32 = 80;
pub const DEFAULT_NODE_CPU_THRESHOLD: i32 = 85;

pub const ROUTER_IMAGE_ENV: &str = "PROMSTACK_ROUTER_IMAGE";
pub const OPERATOR_IMAGE_ENV: &str = "PROMSTACK_OPERATOR_IMAGE";
pub const RELOADER_IMAGE_ENV: &str = "PROMSTACK_RELOADER_IMAGE";
pub const CONFIG_RELOADER_IMAGE_ENV: &str = "PROMSTACK_CONFIG_RELOADER_IMAGE";

/// Malformed user input in the Specification. The only fatal,
/// non-retryable error the resolver produces.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self { field, reason: reason.into() }
    }
}

pub(crate) fn stack_name(cr: &MonitoringStack) -> &str {
    cr.metadata.name.as_deref().unwrap_or_default()
}

pub(crate) fn stack_namespace(cr: &MonitoringStack) -> Option<String> {
    cr.metadata.namespace.clone()
}

/// Managed object names are pure functions of the stack name, so repeated
/// passes always target the same objects.
pub fn prometheus_name(cr: &MonitoringStack) -> String {
    format!("{}-prometheus", stack_name(cr))
}

pub fn alertmanager_name(cr: &MonitoringStack) -> String {
    format!("{}-alertmanager", stack_name(cr))
}

pub fn operator_name(cr: &MonitoringStack) -> String {
    format!("{}-prometheus-operator", stack_name(cr))
}

pub fn hub_ctl_name(cr: &MonitoringStack) -> String {
    format!("{}-hub-ctl", stack_name(cr))
}

pub fn scrape_targets_secret_name(cr: &MonitoringStack) -> String {
    format!("{}-scrape-targets", stack_name(cr))
}

pub fn router_entry_cm_name(cr: &MonitoringStack) -> String {
    format!("{}-prometheus-router-entry", stack_name(cr))
}

pub fn prom_router_cm_name(cr: &MonitoringStack) -> String {
    format!("{}-prometheus-router-ng", stack_name(cr))
}

pub fn prom_lua_cm_name(cr: &MonitoringStack) -> String {
    format!("{}-prometheus-lua", stack_name(cr))
}

pub fn prom_lua_utils_cm_name(cr: &MonitoringStack) -> String {
    format!("{}-prometheus-lua-utils", stack_name(cr))
}

pub fn alert_router_cm_name(cr: &MonitoringStack) -> String {
    format!("{}-alertmanager-router-ng", stack_name(cr))
}

pub fn alertmanager_config_secret_name(cr: &MonitoringStack) -> String {
    format!("alertmanager-{}", alertmanager_name(cr))
}

/// Base labels for a managed object of the given component, merged with
/// the stack's own labels.
pub fn managed_labels(cr: &MonitoringStack, component: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL_KEY.to_string(), APP_LABEL_VALUE.to_string());
    labels.insert(COMPONENT_LABEL_KEY.to_string(), component.to_string());
    labels.insert(MANAGED_LABEL_KEY.to_string(), stack_name(cr).to_string());
    if let Some(extra) = &cr.metadata.labels {
        for (k, v) in extra {
            labels.insert(k.clone(), v.clone());
        }
    }
    labels
}

pub fn cluster_domain(cr: &MonitoringStack) -> String {
    match cr.spec.cluster_domain.as_deref() {
        Some(d) if !d.is_empty() => d.to_string(),
        _ => DEFAULT_CLUSTER_DOMAIN.to_string(),
    }
}

pub fn cluster_name(cr: &MonitoringStack) -> String {
    match cr.spec.cluster_name.as_deref() {
        Some(n) if !n.is_empty() => n.to_string(),
        _ => DEFAULT_CLUSTER_NAME.to_string(),
    }
}

/// Host and port the stack is reached at from outside the cluster.
pub fn external_host_port(cr: &MonitoringStack) -> (String, String) {
    let host = match cr.spec.cluster_address.as_deref() {
        Some(h) if !h.is_empty() => h.to_string(),
        _ => LOOPBACK_HOST.to_string(),
    };
    let port = match cr.spec.cluster_port {
        Some(p) if p != 0 => p.to_string(),
        _ => EXTERNAL_PORT.to_string(),
    };
    (host, port)
}

pub fn external_url(cr: &MonitoringStack, route_prefix: &str) -> String {
    let (host, port) = external_host_port(cr);
    format!("https://{host}:{port}{route_prefix}")
}

/// True when this stack monitors only its own cluster; hub clusters
/// aggregate managed clusters and label system metrics accordingly.
pub fn is_standalone(cr: &MonitoringStack) -> bool {
    !cr.spec.hub.as_ref().map(|h| h.is_hub_cluster).unwrap_or(false)
}

pub(crate) fn image_pull_secret_refs(cr: &MonitoringStack) -> Option<Vec<LocalObjectReference>> {
    let names = cr.spec.image_pull_secrets.as_ref()?;
    if names.is_empty() {
        return None;
    }
    Some(
        names
            .iter()
            .map(|n| LocalObjectReference { name: Some(n.clone()) })
            .collect(),
    )
}

pub(crate) fn common_pod_annotations() -> BTreeMap<String, String> {
    let mut ann = BTreeMap::new();
    ann.insert(
        "monitoring.promstack.io/dependencies".to_string(),
        "cert-manager, management-ingress, auth-idp".to_string(),
    );
    ann
}

pub(crate) fn ingress_annotations(cr: &MonitoringStack) -> BTreeMap<String, String> {
    let mut ann = BTreeMap::new();
    ann.insert("kubernetes.io/ingress.class".to_string(), "management-ingress".to_string());
    ann.insert("ingress.promstack.io/authz-type".to_string(), "rbac".to_string());
    ann.insert("ingress.promstack.io/secure-backends".to_string(), "true".to_string());
    ann.insert(
        "ingress.promstack.io/secure-client-ca-secret".to_string(),
        cr.spec.certs.monitoring_client_secret.clone(),
    );
    ann.insert("ingress.promstack.io/rewrite-target".to_string(), "/".to_string());
    ann
}

/// Env override beats the spec value; the spec value beats nothing.
pub fn image_or_env(env_var: &str, spec_value: &str) -> String {
    match std::env::var(env_var) {
        Ok(v) if !v.is_empty() => v,
        _ => spec_value.to_string(),
    }
}

pub(crate) fn validate_port(field: &'static str, port: i32) -> Result<(), ValidationError> {
    if !(1..=65535).contains(&port) {
        return Err(ValidationError::new(field, format!("port {port} out of range")));
    }
    Ok(())
}

pub(crate) fn iam_namespace(cr: &MonitoringStack) -> String {
    cr.spec
        .iam
        .as_ref()
        .and_then(|i| i.namespace.clone())
        .filter(|ns| !ns.is_empty())
        .or_else(|| stack_namespace(cr))
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use promstack_crd::{
        CertSettings, IamSettings, MonitoringStack, MonitoringStackSpec,
    };

    pub fn stack(name: &str) -> MonitoringStack {
        let mut cr = MonitoringStack::new(
            name,
            MonitoringStackSpec {
                router_image: "registry.example.com/router:4".into(),
                storage_class_name: "standard".into(),
                certs: CertSettings {
                    monitoring_secret: "monitoring-certs".into(),
                    monitoring_client_secret: "monitoring-client-certs".into(),
                    issuer: "stack-ca-issuer".into(),
                    auto_clean: false,
                },
                iam: Some(IamSettings {
                    namespace: None,
                    id_provider_svc: "platform-identity-provider".into(),
                    id_provider_port: 4300,
                    id_management_svc: "platform-identity-management".into(),
                    id_management_port: 4500,
                }),
                grafana_svc_name: Some("grafana".into()),
                grafana_svc_port: Some(3000),
                ..Default::default()
            },
        );
        cr.metadata.namespace = Some("monitoring".into());
        cr.metadata.uid = Some("e2f3a1d0-0000-4000-8000-000000000001".into());
        cr.spec.prometheus.image_repo = "quay.io/prometheus/prometheus".into();
        cr.spec.prometheus.image_tag = "v2.44.0".into();
        cr.spec.prometheus.service_port = 9090;
        cr.spec.alertmanager.image_repo = "quay.io/prometheus/alertmanager".into();
        cr.spec.alertmanager.image_tag = "v0.25.0".into();
        cr.spec.alertmanager.service_port = 9093;
        cr
    }
}
