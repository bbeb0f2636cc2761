//! Alertmanager workload: the Alertmanager object, its seed config
//! secret, service and ingress.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Secret, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use promstack_crd::{
    Alertmanager, AlertmanagerSpec, EmbeddedMetadata, MonitoringStack, StorageSpec,
};

use crate::{
    alert_router_cm_name, alertmanager_config_secret_name, alertmanager_ingress_spec,
    alertmanager_name, external_url, image_pull_secret_refs, ingress_annotations,
    managed_labels, new_router_container, prometheus::volume_claim, router_entry_cm_name,
    stack_namespace, RouterFlavor, ValidationError,
};

/// Seed Alertmanager configuration; users tune routing in place, so this
/// is only ever created, never overwritten.
const ALERTMANAGER_SEED_CONFIG: &str = r#"global:
receivers:
  - name: default-receiver
route:
  group_wait: 10s
  group_interval: 5m
  receiver: default-receiver
  repeat_interval: 3h
"#;

pub fn alertmanager_labels(cr: &MonitoringStack) -> BTreeMap<String, String> {
    managed_labels(cr, "alertmanager")
}

/// The secret the prometheus-operator expects at
/// `alertmanager-{instance}`, holding `alertmanager.yaml`.
pub fn new_alertmanager_config_secret(cr: &MonitoringStack) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(alertmanager_config_secret_name(cr)),
            namespace: stack_namespace(cr),
            labels: Some(alertmanager_labels(cr)),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "alertmanager.yaml".to_string(),
            ByteString(ALERTMANAGER_SEED_CONFIG.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

pub fn alertmanager_spec(cr: &MonitoringStack) -> Result<AlertmanagerSpec, ValidationError> {
    crate::validate_port("alertmanager.servicePort", cr.spec.alertmanager.service_port)?;
    let claim = volume_claim(cr, cr.spec.alertmanager.pv_size.as_deref(), "alertmanager.pvSize")?;
    let settings = &cr.spec.alertmanager;

    Ok(AlertmanagerSpec {
        pod_metadata: Some(EmbeddedMetadata {
            labels: Some(alertmanager_labels(cr)),
            annotations: Some(BTreeMap::from([("pvJob".to_string(), "true".to_string())])),
        }),
        base_image: Some(settings.image_repo.clone()),
        version: Some(settings.image_tag.clone()),
        replicas: Some(1),
        log_level: settings.log_level.clone().filter(|l| !l.is_empty()),
        resources: settings.resources.clone(),
        route_prefix: Some("/alertmanager".to_string()),
        external_url: Some(external_url(cr, "/alertmanager")),
        secrets: vec![
            cr.spec.certs.monitoring_secret.clone(),
            cr.spec.certs.monitoring_client_secret.clone(),
        ],
        config_maps: vec![router_entry_cm_name(cr), alert_router_cm_name(cr)],
        containers: vec![new_router_container(cr, RouterFlavor::Alertmanager)],
        storage: Some(StorageSpec { volume_claim_template: Some(claim) }),
        image_pull_secrets: image_pull_secret_refs(cr),
        service_account_name: settings.service_account.clone().filter(|s| !s.is_empty()),
    })
}

pub fn new_alertmanager(cr: &MonitoringStack) -> Result<Alertmanager, ValidationError> {
    let mut am = Alertmanager::new(&alertmanager_name(cr), alertmanager_spec(cr)?);
    am.metadata.namespace = stack_namespace(cr);
    am.metadata.labels = Some(alertmanager_labels(cr));
    Ok(am)
}

pub fn updated_alertmanager(
    cr: &MonitoringStack,
    current: &Alertmanager,
) -> Result<Alertmanager, ValidationError> {
    let mut am = current.clone();
    am.metadata.labels = Some(alertmanager_labels(cr));
    am.spec = alertmanager_spec(cr)?;
    Ok(am)
}

pub fn new_alertmanager_svc(cr: &MonitoringStack) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(alertmanager_name(cr)),
            namespace: stack_namespace(cr),
            labels: Some(alertmanager_labels(cr)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some("web".to_string()),
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::Int(8443)),
                port: cr.spec.alertmanager.service_port,
                ..Default::default()
            }]),
            selector: Some(alertmanager_labels(cr)),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn updated_alertmanager_svc(cr: &MonitoringStack, current: &Service) -> Service {
    let mut svc = current.clone();
    svc.metadata.labels = Some(alertmanager_labels(cr));
    if let Some(spec) = svc.spec.as_mut() {
        spec.selector = Some(alertmanager_labels(cr));
        if let Some(ports) = spec.ports.as_mut() {
            if let Some(port) = ports.first_mut() {
                port.port = cr.spec.alertmanager.service_port;
            }
        }
    }
    svc
}

pub fn new_alertmanager_ingress(cr: &MonitoringStack) -> Ingress {
    Ingress {
        metadata: ObjectMeta {
            name: Some(alertmanager_name(cr)),
            namespace: stack_namespace(cr),
            labels: Some(alertmanager_labels(cr)),
            annotations: Some(ingress_annotations(cr)),
            ..Default::default()
        },
        spec: Some(alertmanager_ingress_spec(cr)),
        ..Default::default()
    }
}

pub fn updated_alertmanager_ingress(cr: &MonitoringStack, current: &Ingress) -> Ingress {
    let mut ingress = current.clone();
    ingress.metadata.labels = Some(alertmanager_labels(cr));
    ingress.metadata.annotations = Some(ingress_annotations(cr));
    ingress.spec = Some(alertmanager_ingress_spec(cr));
    ingress
}
