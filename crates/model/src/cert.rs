//! Certificate requests for the stack's TLS material.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use promstack_crd::{Certificate, CertificateSpec, IssuerRef, MonitoringStack};

use crate::{
    alertmanager_name, prometheus_name, stack_namespace, APP_LABEL_KEY, APP_LABEL_VALUE,
};

fn cert_labels(cr: &MonitoringStack) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL_KEY.to_string(), APP_LABEL_VALUE.to_string());
    if let Some(extra) = &cr.metadata.labels {
        for (k, v) in extra {
            labels.insert(k.clone(), v.clone());
        }
    }
    labels
}

/// Certificate object named after the secret it materializes. The external
/// certificate authority controller issues the secret; this operator only
/// requests it.
pub fn new_certificate(cr: &MonitoringStack, secret_name: &str, dns_names: Vec<String>) -> Certificate {
    let mut cert = Certificate::new(
        secret_name,
        CertificateSpec {
            secret_name: secret_name.to_string(),
            issuer_ref: IssuerRef {
                name: cr.spec.certs.issuer.clone(),
                kind: Some("Issuer".to_string()),
            },
            common_name: Some(APP_LABEL_VALUE.to_string()),
            dns_names,
        },
    );
    cert.metadata = ObjectMeta {
        name: Some(secret_name.to_string()),
        namespace: stack_namespace(cr),
        labels: Some(cert_labels(cr)),
        ..Default::default()
    };
    cert
}

/// DNS names covered by the server certificate: both workloads, grafana,
/// and their namespaced forms.
pub fn monitoring_dns_names(cr: &MonitoringStack) -> Vec<String> {
    let ns = stack_namespace(cr).unwrap_or_default();
    let grafana = cr.spec.grafana_svc_name.clone().unwrap_or_default();
    vec![
        prometheus_name(cr),
        alertmanager_name(cr),
        grafana.clone(),
        format!("{}.{ns}", prometheus_name(cr)),
        format!("{}.{ns}", alertmanager_name(cr)),
        format!("{grafana}.{ns}"),
        format!("*.{ns}"),
        format!("*.{ns}.svc"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::stack;

    #[test]
    fn certificate_targets_the_named_secret() {
        let cr = stack("demo");
        let cert = new_certificate(&cr, "monitoring-certs", monitoring_dns_names(&cr));
        assert_eq!(cert.metadata.name.as_deref(), Some("monitoring-certs"));
        assert_eq!(cert.metadata.namespace.as_deref(), Some("monitoring"));
        assert_eq!(cert.spec.secret_name, "monitoring-certs");
        assert_eq!(cert.spec.issuer_ref.name, "stack-ca-issuer");
    }

    #[test]
    fn dns_names_cover_both_workloads() {
        let cr = stack("demo");
        let names = monitoring_dns_names(&cr);
        assert!(names.contains(&"demo-prometheus".to_string()));
        assert!(names.contains(&"demo-alertmanager.monitoring".to_string()));
        assert!(names.contains(&"*.monitoring.svc".to_string()));
    }
}
