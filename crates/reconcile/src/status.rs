//! Status projection: a pure summary of the snapshot, written back once
//! per pass.

use kube::ResourceExt;

use promstack_crd::{MonitoringStack, MonitoringStackStatus};
use promstack_model as model;

use crate::state::ClusterState;

pub const NOT_READY: &str = "NotReady";
const NONE: &str = "none";

/// Render `Ready: ..., NotReady: ...` with both name lists sorted, so
/// consecutive status diffs are meaningful to an operator.
fn readiness_summary(entries: &[(String, bool)]) -> String {
    let mut ready: Vec<&str> = Vec::new();
    let mut not_ready: Vec<&str> = Vec::new();
    for (name, present) in entries {
        if *present {
            ready.push(name);
        } else {
            not_ready.push(name);
        }
    }
    ready.sort_unstable();
    not_ready.sort_unstable();
    let join = |names: &[&str]| {
        if names.is_empty() {
            NONE.to_string()
        } else {
            names.join(" ")
        }
    };
    format!("Ready: {}, NotReady: {}", join(&ready), join(&not_ready))
}

/// Derive the observed status from the snapshot alone. Never reads the
/// previous status; desired state must not depend on it.
pub fn project_status(cr: &MonitoringStack, state: &ClusterState) -> MonitoringStackStatus {
    let mut status = MonitoringStackStatus::default();

    if let Some(deployment) = &state.operator_deployment {
        let s = deployment.status.clone().unwrap_or_default();
        status.prometheus_operator = Some(format!(
            "{} desired | {} updated | {} ready | {} available | {} unavailable",
            s.replicas.unwrap_or(0),
            s.updated_replicas.unwrap_or(0),
            s.ready_replicas.unwrap_or(0),
            s.available_replicas.unwrap_or(0),
            s.unavailable_replicas.unwrap_or(0),
        ));
    }

    status.prometheus =
        Some(state.prometheus.as_ref().map(|p| p.name_any()).unwrap_or_else(|| NOT_READY.into()));
    status.alertmanager = Some(
        state.alertmanager.as_ref().map(|a| a.name_any()).unwrap_or_else(|| NOT_READY.into()),
    );
    status.exporter =
        Some(state.exporter.as_ref().map(|e| e.name_any()).unwrap_or_else(|| NOT_READY.into()));

    status.configmaps = Some(readiness_summary(&[
        (model::prom_router_cm_name(cr), state.prom_router_cm.is_some()),
        (model::router_entry_cm_name(cr), state.router_entry_cm.is_some()),
        (model::prom_lua_utils_cm_name(cr), state.prom_lua_utils_cm.is_some()),
        (model::prom_lua_cm_name(cr), state.prom_lua_cm.is_some()),
        (model::alert_router_cm_name(cr), state.alert_router_cm.is_some()),
    ]));
    status.secrets = Some(readiness_summary(&[
        (cr.spec.certs.monitoring_secret.clone(), state.monitoring_secret.is_some()),
        (cr.spec.certs.monitoring_client_secret.clone(), state.client_secret.is_some()),
        (model::scrape_targets_secret_name(cr), state.scrape_targets_secret.is_some()),
    ]));

    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use promstack_crd::{CertSettings, MonitoringStackSpec, Prometheus, PrometheusSpec};

    fn cr() -> MonitoringStack {
        let mut cr = MonitoringStack::new(
            "demo",
            MonitoringStackSpec {
                certs: CertSettings {
                    monitoring_secret: "monitoring-certs".into(),
                    monitoring_client_secret: "monitoring-client-certs".into(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        cr.metadata.namespace = Some("monitoring".into());
        cr
    }

    #[test]
    fn empty_snapshot_reports_everything_not_ready() {
        let status = project_status(&cr(), &ClusterState::default());
        assert_eq!(status.prometheus.as_deref(), Some(NOT_READY));
        assert_eq!(status.alertmanager.as_deref(), Some(NOT_READY));
        assert!(status.prometheus_operator.is_none());
        let cms = status.configmaps.unwrap();
        assert!(cms.starts_with("Ready: none, NotReady: "));
        let secrets = status.secrets.unwrap();
        assert!(secrets.contains("monitoring-certs"));
        assert!(secrets.contains("demo-scrape-targets"));
    }

    #[test]
    fn readiness_lists_are_sorted() {
        let summary = readiness_summary(&[
            ("zeta".into(), true),
            ("alpha".into(), true),
            ("mid".into(), false),
            ("beta".into(), false),
        ]);
        assert_eq!(summary, "Ready: alpha zeta, NotReady: beta mid");
    }

    #[test]
    fn projection_is_deterministic() {
        let mut state = ClusterState::default();
        state.monitoring_secret = Some(Secret {
            metadata: ObjectMeta { name: Some("monitoring-certs".into()), ..Default::default() },
            ..Default::default()
        });
        let cr = cr();
        assert_eq!(project_status(&cr, &state), project_status(&cr, &state));
    }

    #[test]
    fn operator_replicas_summarized() {
        let mut state = ClusterState::default();
        state.operator_deployment = Some(Deployment {
            metadata: ObjectMeta { name: Some("demo-prometheus-operator".into()), ..Default::default() },
            status: Some(DeploymentStatus {
                replicas: Some(1),
                updated_replicas: Some(1),
                ready_replicas: Some(1),
                available_replicas: Some(1),
                unavailable_replicas: None,
                ..Default::default()
            }),
            ..Default::default()
        });
        let status = project_status(&cr(), &state);
        assert_eq!(
            status.prometheus_operator.as_deref(),
            Some("1 desired | 1 updated | 1 ready | 1 available | 0 unavailable")
        );
    }

    #[test]
    fn present_workloads_report_their_names() {
        let mut state = ClusterState::default();
        state.prometheus = Some(Prometheus::new("demo-prometheus", PrometheusSpec::default()));
        let status = project_status(&cr(), &state);
        assert_eq!(status.prometheus.as_deref(), Some("demo-prometheus"));
    }
}
