//! Hub monitoring controller: a secondary controller that federates
//! managed-cluster metrics. Its configuration is the resolved Prometheus
//! shape, derived purely from the Specification.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, PodSpec, PodTemplateSpec, SecretVolumeSource,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use promstack_crd::{HubSettings, MonitoringStack};

use crate::{
    common_pod_annotations, hub_ctl_name, image_pull_secret_refs, managed_labels,
    new_prometheus, stack_namespace, ValidationError, COMPONENT_LABEL_KEY,
};

const HUB_PROMETHEUS_NAME: &str = "hub-prometheus";

fn hub_labels(cr: &MonitoringStack) -> BTreeMap<String, String> {
    managed_labels(cr, "hub-ctl")
}

/// Whether the hub controller is part of the desired state at all.
pub fn hub_enabled(cr: &MonitoringStack) -> bool {
    match &cr.spec.hub {
        Some(HubSettings { is_hub_cluster: true, .. }) => true,
        Some(h) => h.image.as_deref().map(|i| !i.is_empty()).unwrap_or(false),
        None => false,
    }
}

/// The hub Prometheus the controller deploys onto managed clusters:
/// the resolved primary shape minus local storage and scrape targets,
/// re-labeled so hub rules select it.
fn hub_prometheus_json(cr: &MonitoringStack) -> Result<String, ValidationError> {
    let mut prometheus = new_prometheus(cr)?;
    prometheus.metadata.name = Some(HUB_PROMETHEUS_NAME.to_string());
    if let Some(labels) = prometheus.metadata.labels.as_mut() {
        labels.insert(COMPONENT_LABEL_KEY.to_string(), HUB_PROMETHEUS_NAME.to_string());
    }
    prometheus.spec.storage = None;
    prometheus.spec.additional_scrape_configs = None;
    prometheus.spec.rule_selector = Some(LabelSelector {
        match_labels: Some(BTreeMap::from([(
            COMPONENT_LABEL_KEY.to_string(),
            HUB_PROMETHEUS_NAME.to_string(),
        )])),
        ..Default::default()
    });
    serde_json::to_string(&prometheus)
        .map_err(|e| ValidationError::new("hub", format!("serializing hub prometheus: {e}")))
}

fn hub_container(cr: &MonitoringStack) -> Result<Container, ValidationError> {
    let hub = cr.spec.hub.clone().unwrap_or_default();
    let namespace = stack_namespace(cr).unwrap_or_default();
    let grafana_url = format!(
        "https://{}:{}/",
        cr.spec.grafana_svc_name.clone().unwrap_or_default(),
        cr.spec.grafana_svc_port.unwrap_or_default()
    );
    Ok(Container {
        name: "hub-ctl".to_string(),
        image: hub.image.clone(),
        image_pull_policy: cr.spec.image_policy.clone(),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            privileged: Some(false),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        resources: hub.resources.clone(),
        env: Some(vec![
            EnvVar { name: "NAMESPACE".to_string(), value: Some(namespace.clone()), ..Default::default() },
            EnvVar { name: "NAMESPACES".to_string(), value: Some(namespace), ..Default::default() },
            EnvVar {
                name: "IS_HUB_CLUSTER".to_string(),
                value: Some(hub.is_hub_cluster.to_string()),
                ..Default::default()
            },
            EnvVar { name: "GRAFANA_BASE_URL".to_string(), value: Some(grafana_url), ..Default::default() },
            EnvVar {
                name: "PROMETHEUS_JSON".to_string(),
                value: Some(hub_prometheus_json(cr)?),
                ..Default::default()
            },
        ]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "monitoring-ca-certs".to_string(),
                mount_path: "/opt/monitoring/caCerts".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "monitoring-client-certs".to_string(),
                mount_path: "/opt/monitoring/certs".to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    })
}

fn hub_deployment_spec(cr: &MonitoringStack) -> Result<DeploymentSpec, ValidationError> {
    let hub = cr.spec.hub.clone().unwrap_or_default();
    Ok(DeploymentSpec {
        replicas: Some(1),
        selector: LabelSelector {
            match_labels: Some(hub_labels(cr)),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                name: Some(hub_ctl_name(cr)),
                labels: Some(hub_labels(cr)),
                annotations: Some(common_pod_annotations()),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                host_pid: Some(false),
                host_ipc: Some(false),
                host_network: Some(false),
                service_account_name: hub.service_account.clone().filter(|s| !s.is_empty()),
                image_pull_secrets: image_pull_secret_refs(cr),
                volumes: Some(vec![
                    Volume {
                        name: "monitoring-ca-certs".to_string(),
                        secret: Some(SecretVolumeSource {
                            secret_name: Some(cr.spec.certs.monitoring_secret.clone()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Volume {
                        name: "monitoring-client-certs".to_string(),
                        secret: Some(SecretVolumeSource {
                            secret_name: Some(cr.spec.certs.monitoring_client_secret.clone()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ]),
                containers: vec![hub_container(cr)?],
                ..Default::default()
            }),
        },
        ..Default::default()
    })
}

pub fn new_hub_deployment(cr: &MonitoringStack) -> Result<Deployment, ValidationError> {
    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(hub_ctl_name(cr)),
            namespace: stack_namespace(cr),
            labels: Some(hub_labels(cr)),
            ..Default::default()
        },
        spec: Some(hub_deployment_spec(cr)?),
        ..Default::default()
    })
}

pub fn updated_hub_deployment(
    cr: &MonitoringStack,
    current: &Deployment,
) -> Result<Deployment, ValidationError> {
    let mut deployment = current.clone();
    deployment.metadata.labels = Some(hub_labels(cr));
    let desired = hub_deployment_spec(cr)?;
    let spec = deployment.spec.get_or_insert_with(Default::default);
    spec.selector = desired.selector.clone();
    spec.template.metadata = desired.template.metadata.clone();
    if let Some(pod) = spec.template.spec.as_mut() {
        let desired_pod = desired.template.spec.unwrap_or_default();
        pod.containers = desired_pod.containers;
        pod.volumes = desired_pod.volumes;
        pod.image_pull_secrets = desired_pod.image_pull_secrets;
        pod.service_account_name = desired_pod.service_account_name;
    } else {
        spec.template.spec = desired.template.spec;
    }
    Ok(deployment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::stack;

    fn hub_stack() -> MonitoringStack {
        let mut cr = stack("demo");
        cr.spec.hub = Some(HubSettings {
            is_hub_cluster: true,
            image: Some("registry.example.com/hub-ctl:2".into()),
            ..Default::default()
        });
        cr
    }

    #[test]
    fn gating_requires_hub_cluster_or_image() {
        let cr = stack("demo");
        assert!(!hub_enabled(&cr));
        assert!(hub_enabled(&hub_stack()));
        let mut image_only = stack("demo");
        image_only.spec.hub = Some(HubSettings {
            image: Some("img".into()),
            ..Default::default()
        });
        assert!(hub_enabled(&image_only));
    }

    #[test]
    fn embedded_prometheus_is_storage_free() {
        let cr = hub_stack();
        let deployment = new_hub_deployment(&cr).unwrap();
        let container = &deployment.spec.unwrap().template.spec.unwrap().containers[0];
        let env = container.env.as_ref().unwrap();
        let prometheus_json = env
            .iter()
            .find(|e| e.name == "PROMETHEUS_JSON")
            .and_then(|e| e.value.as_ref())
            .unwrap();
        assert!(prometheus_json.contains("hub-prometheus"));
        assert!(!prometheus_json.contains("volumeClaimTemplate"));
        assert!(!prometheus_json.contains("additionalScrapeConfigs"));
    }

    #[test]
    fn cert_volumes_reference_spec_secrets() {
        let cr = hub_stack();
        let deployment = new_hub_deployment(&cr).unwrap();
        let volumes = deployment.spec.unwrap().template.spec.unwrap().volumes.unwrap();
        let names: Vec<_> = volumes
            .iter()
            .filter_map(|v| v.secret.as_ref().and_then(|s| s.secret_name.clone()))
            .collect();
        assert_eq!(names, vec!["monitoring-certs", "monitoring-client-certs"]);
    }
}
