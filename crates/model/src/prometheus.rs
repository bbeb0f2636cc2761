//! Prometheus workload: the Prometheus object, its service, ingress and
//! the scrape-targets secret.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, Secret,
    SecretKeySelector, Service, ServicePort, ServiceSpec, VolumeResourceRequirements,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use promstack_crd::{
    AlertingSpec, AlertmanagerEndpoints, EmbeddedMetadata, MonitoringStack, Prometheus,
    PrometheusSpec, StorageSpec, TlsConfig,
};

use crate::{
    alertmanager_name, common_pod_annotations, external_url, image_pull_secret_refs,
    ingress_annotations, managed_labels, new_router_container, prom_lua_cm_name,
    prom_lua_utils_cm_name, prom_router_cm_name, prometheus_name, quantity,
    router_entry_cm_name, scrape_targets_secret_name, stack_namespace, RouterFlavor,
    ScrapeTargetParams, TemplateRegistry, ValidationError, APP_LABEL_KEY, APP_LABEL_VALUE,
    DEFAULT_EVALUATION_INTERVAL, DEFAULT_PV_SIZE, DEFAULT_RETENTION, DEFAULT_SCRAPE_INTERVAL,
};

pub(crate) const SCRAPE_TARGETS_KEY: &str = "scrape-targets.yml";

pub fn prometheus_labels(cr: &MonitoringStack) -> BTreeMap<String, String> {
    managed_labels(cr, "prometheus")
}

pub(crate) fn volume_claim(
    cr: &MonitoringStack,
    pv_size: Option<&str>,
    field: &'static str,
) -> Result<PersistentVolumeClaim, ValidationError> {
    let size = match pv_size {
        Some(s) if !s.is_empty() => s,
        _ => DEFAULT_PV_SIZE,
    };
    quantity::validate(size).map_err(|reason| ValidationError::new(field, reason))?;
    Ok(PersistentVolumeClaim {
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: Some(cr.spec.storage_class_name.clone()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// The full desired Prometheus spec. Every optional Specification field is
/// resolved to its default here; downstream consumers never see an unset
/// interval or size.
pub fn prometheus_spec(cr: &MonitoringStack) -> Result<PrometheusSpec, ValidationError> {
    crate::validate_port("prometheus.servicePort", cr.spec.prometheus.service_port)?;
    let claim = volume_claim(cr, cr.spec.prometheus.pv_size.as_deref(), "prometheus.pvSize")?;
    let settings = &cr.spec.prometheus;

    let pick = |v: &Option<String>, default: &str| -> String {
        match v.as_deref() {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => default.to_string(),
        }
    };

    Ok(PrometheusSpec {
        pod_metadata: Some(EmbeddedMetadata {
            labels: Some(prometheus_labels(cr)),
            annotations: Some(common_pod_annotations()),
        }),
        base_image: Some(settings.image_repo.clone()),
        version: Some(settings.image_tag.clone()),
        replicas: Some(1),
        retention: Some(pick(&settings.retention, DEFAULT_RETENTION)),
        scrape_interval: Some(pick(&settings.scrape_interval, DEFAULT_SCRAPE_INTERVAL)),
        evaluation_interval: Some(pick(&settings.evaluation_interval, DEFAULT_EVALUATION_INTERVAL)),
        log_level: settings.log_level.clone().filter(|l| !l.is_empty()),
        enable_admin_api: Some(true),
        resources: settings.resources.clone(),
        route_prefix: Some("/prometheus".to_string()),
        external_url: Some(external_url(cr, "/prometheus")),
        secrets: vec![
            cr.spec.certs.monitoring_secret.clone(),
            cr.spec.certs.monitoring_client_secret.clone(),
        ],
        config_maps: vec![
            prom_router_cm_name(cr),
            router_entry_cm_name(cr),
            prom_lua_cm_name(cr),
            prom_lua_utils_cm_name(cr),
        ],
        service_monitor_selector: Some(LabelSelector {
            match_labels: Some(BTreeMap::from([(
                APP_LABEL_KEY.to_string(),
                APP_LABEL_VALUE.to_string(),
            )])),
            ..Default::default()
        }),
        // Select every rule in the namespace.
        rule_selector: Some(LabelSelector::default()),
        additional_scrape_configs: Some(SecretKeySelector {
            name: Some(scrape_targets_secret_name(cr)),
            key: SCRAPE_TARGETS_KEY.to_string(),
            ..Default::default()
        }),
        containers: vec![new_router_container(cr, RouterFlavor::Prometheus)],
        storage: Some(StorageSpec { volume_claim_template: Some(claim) }),
        alerting: Some(AlertingSpec {
            alertmanagers: vec![AlertmanagerEndpoints {
                namespace: stack_namespace(cr).unwrap_or_default(),
                name: alertmanager_name(cr),
                port: "web".to_string(),
                scheme: Some("https".to_string()),
                tls_config: Some(TlsConfig {
                    cert_file: Some(format!(
                        "/etc/prometheus/secrets/{}/tls.crt",
                        cr.spec.certs.monitoring_client_secret
                    )),
                    key_file: Some(format!(
                        "/etc/prometheus/secrets/{}/tls.key",
                        cr.spec.certs.monitoring_client_secret
                    )),
                    insecure_skip_verify: Some(true),
                    ..Default::default()
                }),
            }],
        }),
        image_pull_secrets: image_pull_secret_refs(cr),
        service_account_name: settings.service_account.clone().filter(|s| !s.is_empty()),
    })
}

pub fn new_prometheus(cr: &MonitoringStack) -> Result<Prometheus, ValidationError> {
    let mut prometheus = Prometheus::new(&prometheus_name(cr), prometheus_spec(cr)?);
    prometheus.metadata.namespace = stack_namespace(cr);
    prometheus.metadata.labels = Some(prometheus_labels(cr));
    Ok(prometheus)
}

pub fn updated_prometheus(
    cr: &MonitoringStack,
    current: &Prometheus,
) -> Result<Prometheus, ValidationError> {
    let mut prometheus = current.clone();
    prometheus.metadata.labels = Some(prometheus_labels(cr));
    prometheus.spec = prometheus_spec(cr)?;
    Ok(prometheus)
}

pub fn new_prometheus_svc(cr: &MonitoringStack) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(prometheus_name(cr)),
            namespace: stack_namespace(cr),
            labels: Some(prometheus_labels(cr)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::Int(8443)),
                port: cr.spec.prometheus.service_port,
                ..Default::default()
            }]),
            selector: Some(prometheus_labels(cr)),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn updated_prometheus_svc(cr: &MonitoringStack, current: &Service) -> Service {
    let mut svc = current.clone();
    svc.metadata.labels = Some(prometheus_labels(cr));
    if let Some(spec) = svc.spec.as_mut() {
        if let Some(ports) = spec.ports.as_mut() {
            if let Some(port) = ports.first_mut() {
                port.port = cr.spec.prometheus.service_port;
            }
        }
        spec.selector = Some(prometheus_labels(cr));
    }
    svc
}

fn ingress_spec(path: &str, svc: String, port: i32) -> IngressSpec {
    IngressSpec {
        rules: Some(vec![IngressRule {
            http: Some(HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    path: Some(path.to_string()),
                    path_type: "Prefix".to_string(),
                    backend: IngressBackend {
                        service: Some(IngressServiceBackend {
                            name: svc,
                            port: Some(ServiceBackendPort {
                                number: Some(port),
                                ..Default::default()
                            }),
                        }),
                        ..Default::default()
                    },
                }],
            }),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

pub fn new_prometheus_ingress(cr: &MonitoringStack) -> Ingress {
    Ingress {
        metadata: ObjectMeta {
            name: Some(prometheus_name(cr)),
            namespace: stack_namespace(cr),
            labels: Some(prometheus_labels(cr)),
            annotations: Some(ingress_annotations(cr)),
            ..Default::default()
        },
        spec: Some(ingress_spec(
            "/prometheus",
            prometheus_name(cr),
            cr.spec.prometheus.service_port,
        )),
        ..Default::default()
    }
}

pub fn updated_prometheus_ingress(cr: &MonitoringStack, current: &Ingress) -> Ingress {
    let mut ingress = current.clone();
    ingress.metadata.labels = Some(prometheus_labels(cr));
    ingress.metadata.annotations = Some(ingress_annotations(cr));
    ingress.spec = Some(ingress_spec(
        "/prometheus",
        prometheus_name(cr),
        cr.spec.prometheus.service_port,
    ));
    ingress
}

pub(crate) fn alertmanager_ingress_spec(cr: &MonitoringStack) -> IngressSpec {
    ingress_spec("/alertmanager", alertmanager_name(cr), cr.spec.alertmanager.service_port)
}

/// Scrape-targets secret consumed by the Prometheus via
/// `additionalScrapeConfigs`. `node_exporter` reflects the observed
/// exporter object, passed in by the caller so this stays a pure function.
pub fn new_scrape_targets_secret(
    cr: &MonitoringStack,
    templates: &TemplateRegistry,
    node_exporter: bool,
) -> Secret {
    let rendered =
        templates.render_scrape_targets(&ScrapeTargetParams::from_stack(cr, node_exporter));
    Secret {
        metadata: ObjectMeta {
            name: Some(scrape_targets_secret_name(cr)),
            namespace: stack_namespace(cr),
            labels: Some(prometheus_labels(cr)),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            SCRAPE_TARGETS_KEY.to_string(),
            ByteString(rendered.into_bytes()),
        )])),
        ..Default::default()
    }
}

pub fn updated_scrape_targets_secret(
    cr: &MonitoringStack,
    templates: &TemplateRegistry,
    node_exporter: bool,
    current: &Secret,
) -> Secret {
    let desired = new_scrape_targets_secret(cr, templates, node_exporter);
    let mut secret = current.clone();
    secret.metadata.labels = desired.metadata.labels.clone();
    secret.data = desired.data.clone();
    secret
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::stack;

    #[test]
    fn unset_optionals_resolve_to_defaults() {
        let cr = stack("demo");
        let spec = prometheus_spec(&cr).unwrap();
        assert_eq!(spec.retention.as_deref(), Some("24h"));
        assert_eq!(spec.scrape_interval.as_deref(), Some("1m"));
        assert_eq!(spec.evaluation_interval.as_deref(), Some("1m"));
        let claim = spec.storage.unwrap().volume_claim_template.unwrap();
        let requests = claim.spec.unwrap().resources.unwrap().requests.unwrap();
        assert_eq!(requests["storage"].0, "10Gi");
    }

    #[test]
    fn spec_values_override_defaults() {
        let mut cr = stack("demo");
        cr.spec.prometheus.retention = Some("7d".into());
        cr.spec.prometheus.pv_size = Some("100Gi".into());
        let spec = prometheus_spec(&cr).unwrap();
        assert_eq!(spec.retention.as_deref(), Some("7d"));
        let claim = spec.storage.unwrap().volume_claim_template.unwrap();
        let requests = claim.spec.unwrap().resources.unwrap().requests.unwrap();
        assert_eq!(requests["storage"].0, "100Gi");
    }

    #[test]
    fn resolve_is_idempotent() {
        let cr = stack("demo");
        assert_eq!(prometheus_spec(&cr).unwrap(), prometheus_spec(&cr).unwrap());
        assert_eq!(new_prometheus(&cr).unwrap().spec, new_prometheus(&cr).unwrap().spec);
    }

    #[test]
    fn alerting_endpoint_names_the_sibling_alertmanager() {
        let cr = stack("demo");
        let spec = prometheus_spec(&cr).unwrap();
        let am = &spec.alerting.unwrap().alertmanagers[0];
        assert_eq!(am.name, "demo-alertmanager");
        assert_eq!(am.namespace, "monitoring");
        assert_eq!(am.scheme.as_deref(), Some("https"));
    }

    #[test]
    fn malformed_pv_size_is_a_validation_error() {
        let mut cr = stack("demo");
        cr.spec.prometheus.pv_size = Some("10Gl".into());
        let err = prometheus_spec(&cr).unwrap_err();
        assert_eq!(err.field, "prometheus.pvSize");
    }

    #[test]
    fn bad_service_port_is_a_validation_error() {
        let mut cr = stack("demo");
        cr.spec.prometheus.service_port = 0;
        assert!(prometheus_spec(&cr).is_err());
    }

    #[test]
    fn updated_prometheus_preserves_server_metadata() {
        let cr = stack("demo");
        let mut current = new_prometheus(&cr).unwrap();
        current.metadata.resource_version = Some("7".into());
        current.metadata.uid = Some("u-1".into());
        current.metadata.creation_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(fixed_time()));
        let updated = updated_prometheus(&cr, &current).unwrap();
        assert_eq!(updated.metadata.resource_version.as_deref(), Some("7"));
        assert_eq!(updated.metadata.uid.as_deref(), Some("u-1"));
        assert!(updated.metadata.creation_timestamp.is_some());
        assert_eq!(updated.spec, prometheus_spec(&cr).unwrap());
    }

    fn fixed_time() -> chrono::DateTime<chrono::Utc> {
        use chrono::TimeZone;
        chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn service_updates_in_place() {
        let cr = stack("demo");
        let mut current = new_prometheus_svc(&cr);
        current.metadata.uid = Some("svc-uid".into());
        current.spec.as_mut().unwrap().cluster_ip = Some("10.0.0.7".into());
        let mut changed = stack("demo");
        changed.spec.prometheus.service_port = 9099;
        let updated = updated_prometheus_svc(&changed, &current);
        assert_eq!(updated.metadata.uid.as_deref(), Some("svc-uid"));
        // server-assigned cluster IP survives the overlay
        assert_eq!(updated.spec.as_ref().unwrap().cluster_ip.as_deref(), Some("10.0.0.7"));
        assert_eq!(updated.spec.unwrap().ports.unwrap()[0].port, 9099);
    }

    #[test]
    fn ingress_targets_prometheus_service() {
        let cr = stack("demo");
        let ingress = new_prometheus_ingress(&cr);
        let rules = ingress.spec.unwrap().rules.unwrap();
        let path = &rules[0].http.as_ref().unwrap().paths[0];
        assert_eq!(path.path.as_deref(), Some("/prometheus"));
        let backend = path.backend.service.as_ref().unwrap();
        assert_eq!(backend.name, "demo-prometheus");
        assert_eq!(backend.port.as_ref().unwrap().number, Some(9090));
    }

    #[test]
    fn scrape_secret_tracks_node_exporter_flag() {
        let cr = stack("demo");
        let reg = TemplateRegistry::new();
        let without = new_scrape_targets_secret(&cr, &reg, false);
        let with = new_scrape_targets_secret(&cr, &reg, true);
        let body = |s: &Secret| {
            String::from_utf8(s.data.as_ref().unwrap()[SCRAPE_TARGETS_KEY].0.clone()).unwrap()
        };
        assert!(!body(&without).contains("node-exporter"));
        assert!(body(&with).contains("node-exporter"));
    }
}
