//! End-to-end passes over the in-memory store: convergence, merge-forward
//! updates, optimistic-concurrency conflicts and auto-clean gating.

#![forbid(unsafe_code)]

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use promstack_crd::{
    Alertmanager, CertSettings, Certificate, HubSettings, IamSettings, MonitoringStack,
    MonitoringStackSpec, Prometheus, PrometheusRule,
};
use promstack_model::TemplateRegistry;
use promstack_reconcile::{
    memory::MemoryStore, read_cluster_state, Component, Disposition, Error, Reconciler, Store,
};

const NS: &str = "monitoring";

fn stack(name: &str) -> MonitoringStack {
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
    cr.metadata.namespace = Some(NS.into());
    cr.metadata.uid = Some("e2f3a1d0-0000-4000-8000-000000000001".into());
    cr.spec.prometheus.image_repo = "quay.io/prometheus/prometheus".into();
    cr.spec.prometheus.image_tag = "v2.44.0".into();
    cr.spec.prometheus.service_port = 9090;
    cr.spec.alertmanager.image_repo = "quay.io/prometheus/alertmanager".into();
    cr.spec.alertmanager.image_tag = "v0.25.0".into();
    cr.spec.alertmanager.service_port = 9093;
    cr
}

fn secret(name: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(NS.into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn seed_cert_secrets(store: &MemoryStore) {
    store.create(&secret("monitoring-certs")).await.unwrap();
    store.create(&secret("monitoring-client-certs")).await.unwrap();
}

async fn run_pass(
    store: &MemoryStore,
    templates: &TemplateRegistry,
    cr: &MonitoringStack,
) -> Result<(), Error> {
    let state = read_cluster_state(store, cr).await?;
    Reconciler::new(store, templates, cr, state).sync().await
}

#[tokio::test]
async fn second_pass_produces_no_further_creates() {
    let store = MemoryStore::new();
    let templates = TemplateRegistry::new();
    let cr = stack("demo");
    seed_cert_secrets(&store).await;

    run_pass(&store, &templates, &cr).await.unwrap();
    assert!(store.contains::<Deployment>(NS, "demo-prometheus-operator"));
    assert!(store.contains::<ConfigMap>(NS, "demo-prometheus-router-ng"));
    assert!(store.contains::<Secret>(NS, "demo-scrape-targets"));
    assert!(store.contains::<Prometheus>(NS, "demo-prometheus"));
    assert!(store.contains::<Service>(NS, "demo-prometheus"));
    assert!(store.contains::<Ingress>(NS, "demo-prometheus"));
    assert!(store.contains::<PrometheusRule>(NS, "node-memory-usage"));
    assert!(store.contains::<Secret>(NS, "alertmanager-demo-alertmanager"));
    assert!(store.contains::<Alertmanager>(NS, "demo-alertmanager"));
    assert!(store.contains::<Service>(NS, "demo-alertmanager"));
    assert!(store.contains::<Ingress>(NS, "demo-alertmanager"));
    // hub not enabled in this spec
    assert!(!store.contains::<Deployment>(NS, "demo-hub-ctl"));

    let creates_after_first = store.creates();
    run_pass(&store, &templates, &cr).await.unwrap();
    assert_eq!(store.creates(), creates_after_first);
    assert!(store.updates() > 0);
}

#[tokio::test]
async fn managed_objects_carry_the_ownership_link() {
    let store = MemoryStore::new();
    let templates = TemplateRegistry::new();
    let cr = stack("demo");
    seed_cert_secrets(&store).await;
    run_pass(&store, &templates, &cr).await.unwrap();

    let prometheus: Prometheus = store.get(NS, "demo-prometheus").await.unwrap().unwrap();
    let owners = prometheus.metadata.owner_references.unwrap();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].kind, "MonitoringStack");
    assert_eq!(owners[0].name, "demo");
    assert_eq!(owners[0].controller, Some(true));
}

#[tokio::test]
async fn missing_cert_secret_requeues_and_stops_the_pass() {
    let store = MemoryStore::new();
    let templates = TemplateRegistry::new();
    let cr = stack("demo");

    let err = run_pass(&store, &templates, &cr).await.unwrap_err();
    assert!(err.is_requeue());
    match err {
        Error::Requeue { component, .. } => assert_eq!(component, "certificates"),
        other => panic!("expected requeue, got {other:?}"),
    }
    // the request went out, the pipeline stopped before the workloads
    assert!(store.contains::<Certificate>(NS, "monitoring-certs"));
    assert!(!store.contains::<Prometheus>(NS, "demo-prometheus"));
    // the operator deployment syncs before credentials and was created
    assert!(store.contains::<Deployment>(NS, "demo-prometheus-operator"));
}

#[tokio::test]
async fn auto_clean_disabled_never_touches_foreign_secrets() {
    let store = MemoryStore::new();
    let templates = TemplateRegistry::new();
    let cr = stack("demo");
    seed_cert_secrets(&store).await;

    let state = read_cluster_state(&store, &cr).await.unwrap();
    let reconciler = Reconciler::new(&store, &templates, &cr, state);
    reconciler.sync_component(Component::Certificates).await.unwrap();

    assert_eq!(store.deletes(), 0);
    assert!(store.contains::<Secret>(NS, "monitoring-certs"));
    assert!(!store.contains::<Certificate>(NS, "monitoring-certs"));
}

#[tokio::test]
async fn auto_clean_reissues_secrets_without_provenance() {
    let store = MemoryStore::new();
    let templates = TemplateRegistry::new();
    let mut cr = stack("demo");
    cr.spec.certs.auto_clean = true;
    seed_cert_secrets(&store).await;

    let state = read_cluster_state(&store, &cr).await.unwrap();
    let reconciler = Reconciler::new(&store, &templates, &cr, state);
    let err = reconciler.sync_component(Component::Certificates).await.unwrap_err();
    assert!(err.is_requeue());

    assert!(!store.contains::<Secret>(NS, "monitoring-certs"));
    assert!(store.contains::<Certificate>(NS, "monitoring-certs"));
}

#[tokio::test]
async fn auto_clean_keeps_secrets_with_backing_certificates() {
    let store = MemoryStore::new();
    let templates = TemplateRegistry::new();
    let mut cr = stack("demo");
    cr.spec.certs.auto_clean = true;
    seed_cert_secrets(&store).await;
    // provenance exists for both secrets
    store
        .create(&promstack_model::new_certificate(
            &cr,
            "monitoring-certs",
            promstack_model::monitoring_dns_names(&cr),
        ))
        .await
        .unwrap();
    store
        .create(&promstack_model::new_certificate(&cr, "monitoring-client-certs", vec![]))
        .await
        .unwrap();

    let state = read_cluster_state(&store, &cr).await.unwrap();
    let reconciler = Reconciler::new(&store, &templates, &cr, state);
    reconciler.sync_component(Component::Certificates).await.unwrap();
    assert_eq!(store.deletes(), 0);
    assert!(store.contains::<Secret>(NS, "monitoring-certs"));
}

#[tokio::test]
async fn existing_service_is_updated_not_recreated() {
    let store = MemoryStore::new();
    let templates = TemplateRegistry::new();
    let cr = stack("demo");
    seed_cert_secrets(&store).await;
    store.create(&promstack_model::new_prometheus_svc(&cr)).await.unwrap();
    let before: Service = store.get(NS, "demo-prometheus").await.unwrap().unwrap();
    let uid_before = before.metadata.uid.clone();
    let created_before = before.metadata.creation_timestamp.clone();

    run_pass(&store, &templates, &cr).await.unwrap();

    assert!(store.contains::<Prometheus>(NS, "demo-prometheus"));
    let after: Service = store.get(NS, "demo-prometheus").await.unwrap().unwrap();
    assert_eq!(after.metadata.uid, uid_before);
    assert_eq!(after.metadata.creation_timestamp, created_before);
    assert_eq!(after.metadata.resource_version.as_deref(), Some("2"));
}

#[tokio::test]
async fn concurrent_mutation_surfaces_as_requeue() {
    let store = MemoryStore::new();
    let templates = TemplateRegistry::new();
    let cr = stack("demo");
    seed_cert_secrets(&store).await;
    run_pass(&store, &templates, &cr).await.unwrap();

    // snapshot now, then another writer bumps the service underneath us
    let state = read_cluster_state(&store, &cr).await.unwrap();
    let live: Service = store.get(NS, "demo-prometheus").await.unwrap().unwrap();
    store.update(&live).await.unwrap();

    let am_before: Alertmanager = store.get(NS, "demo-alertmanager").await.unwrap().unwrap();
    let reconciler = Reconciler::new(&store, &templates, &cr, state);
    let err = reconciler.sync().await.unwrap_err();
    assert!(matches!(err.disposition(), Disposition::RetryAfter(_)));
    match &err {
        Error::Requeue { component, .. } => assert_eq!(*component, "prometheus-service"),
        other => panic!("expected requeue, got {other:?}"),
    }
    // the pass ended at the conflicting component; later components were
    // not touched this pass
    let am_after: Alertmanager = store.get(NS, "demo-alertmanager").await.unwrap().unwrap();
    assert_eq!(am_before.metadata.resource_version, am_after.metadata.resource_version);
}

#[tokio::test]
async fn status_reflects_the_previous_pass() {
    let store = MemoryStore::new();
    let templates = TemplateRegistry::new();
    let cr = stack("demo");
    seed_cert_secrets(&store).await;

    run_pass(&store, &templates, &cr).await.unwrap();
    let first = store.status_of(NS, "demo").unwrap();
    // first pass projected from an empty snapshot
    assert_eq!(first.prometheus.as_deref(), Some("NotReady"));

    run_pass(&store, &templates, &cr).await.unwrap();
    let second = store.status_of(NS, "demo").unwrap();
    assert_eq!(second.prometheus.as_deref(), Some("demo-prometheus"));
    assert_eq!(second.alertmanager.as_deref(), Some("demo-alertmanager"));
    let secrets = second.secrets.unwrap();
    assert!(secrets.contains("Ready:"));
    assert!(secrets.contains("monitoring-certs"));
    assert_eq!(store.status_writes(), 2);
}

#[tokio::test]
async fn seeded_rules_and_config_are_never_overwritten() {
    let store = MemoryStore::new();
    let templates = TemplateRegistry::new();
    let cr = stack("demo");
    seed_cert_secrets(&store).await;
    run_pass(&store, &templates, &cr).await.unwrap();

    let rule_before: PrometheusRule =
        store.get(NS, "node-memory-usage").await.unwrap().unwrap();
    let config_before: Secret =
        store.get(NS, "alertmanager-demo-alertmanager").await.unwrap().unwrap();

    run_pass(&store, &templates, &cr).await.unwrap();
    let rule_after: PrometheusRule = store.get(NS, "node-memory-usage").await.unwrap().unwrap();
    let config_after: Secret =
        store.get(NS, "alertmanager-demo-alertmanager").await.unwrap().unwrap();
    assert_eq!(rule_before.metadata.resource_version, rule_after.metadata.resource_version);
    assert_eq!(config_before.metadata.resource_version, config_after.metadata.resource_version);
}

#[tokio::test]
async fn hub_controller_syncs_only_when_enabled() {
    let store = MemoryStore::new();
    let templates = TemplateRegistry::new();
    let mut cr = stack("demo");
    cr.spec.hub = Some(HubSettings {
        is_hub_cluster: true,
        image: Some("registry.example.com/hub-ctl:2".into()),
        ..Default::default()
    });
    seed_cert_secrets(&store).await;
    run_pass(&store, &templates, &cr).await.unwrap();
    assert!(store.contains::<Deployment>(NS, "demo-hub-ctl"));
}

#[tokio::test]
async fn malformed_storage_size_is_terminal() {
    let store = MemoryStore::new();
    let templates = TemplateRegistry::new();
    let mut cr = stack("demo");
    cr.spec.prometheus.pv_size = Some("lots".into());
    seed_cert_secrets(&store).await;

    let err = run_pass(&store, &templates, &cr).await.unwrap_err();
    assert_eq!(err.disposition(), Disposition::Terminal);
    assert!(matches!(err, Error::Validation(_)));
}
