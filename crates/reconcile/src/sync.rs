//! The object sync pipeline.
//!
//! One reconciliation pass walks `SYNC_ORDER` and, per component, chooses
//! create vs. update by presence in the snapshot. Updates always start
//! from the observed object (merge-forward); the snapshot itself is never
//! mutated. Create races and write conflicts become requeue signals; the
//! pass is re-run in full rather than retried in place.

use k8s_openapi::api::core::v1::Secret;
use metrics::{counter, histogram};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use promstack_crd::{Certificate, MonitoringStack};
use promstack_model as model;
use promstack_model::TemplateRegistry;

use crate::error::{Error, StoreError};
use crate::state::{namespace_of, ClusterState};
use crate::status::project_status;
use crate::store::{Store, StoredObject};

/// A managed component, the unit of sync granularity and failure
/// attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    OperatorDeployment,
    Certificates,
    RouterConfig,
    ScrapeTargets,
    Prometheus,
    PrometheusService,
    PrometheusIngress,
    AlertingRules,
    AlertmanagerConfig,
    Alertmanager,
    AlertmanagerService,
    AlertmanagerIngress,
    HubController,
}

impl Component {
    pub fn as_str(self) -> &'static str {
        match self {
            Component::OperatorDeployment => "operator-deployment",
            Component::Certificates => "certificates",
            Component::RouterConfig => "router-config",
            Component::ScrapeTargets => "scrape-targets",
            Component::Prometheus => "prometheus",
            Component::PrometheusService => "prometheus-service",
            Component::PrometheusIngress => "prometheus-ingress",
            Component::AlertingRules => "alerting-rules",
            Component::AlertmanagerConfig => "alertmanager-config",
            Component::Alertmanager => "alertmanager",
            Component::AlertmanagerService => "alertmanager-service",
            Component::AlertmanagerIngress => "alertmanager-ingress",
            Component::HubController => "hub-controller",
        }
    }
}

/// Fixed dependency order: the operator and shared config/credential
/// artifacts first, then the stateful workloads, then the networking
/// objects exposing them, and the dependent hub controller last.
pub const SYNC_ORDER: &[Component] = &[
    Component::OperatorDeployment,
    Component::Certificates,
    Component::RouterConfig,
    Component::ScrapeTargets,
    Component::Prometheus,
    Component::PrometheusService,
    Component::PrometheusIngress,
    Component::AlertingRules,
    Component::AlertmanagerConfig,
    Component::Alertmanager,
    Component::AlertmanagerService,
    Component::AlertmanagerIngress,
    Component::HubController,
];

/// Stamp the ownership link so the store's garbage collector cascades
/// deletion of the stack to every managed object. Invoked uniformly on
/// every create and update.
pub fn attach_owner<K: StoredObject>(cr: &MonitoringStack, obj: &mut K) {
    use kube::Resource;
    if let Some(owner) = cr.controller_owner_ref(&()) {
        let owners = obj.meta_mut().owner_references.get_or_insert_with(Vec::new);
        owners.retain(|r| r.controller != Some(true));
        owners.push(owner);
    }
}

/// Drives one pass for one Specification against one snapshot.
pub struct Reconciler<'a, S> {
    store: &'a S,
    templates: &'a TemplateRegistry,
    cr: &'a MonitoringStack,
    state: ClusterState,
}

impl<'a, S: Store> Reconciler<'a, S> {
    pub fn new(
        store: &'a S,
        templates: &'a TemplateRegistry,
        cr: &'a MonitoringStack,
        state: ClusterState,
    ) -> Self {
        Self { store, templates, cr, state }
    }

    /// Run the full pipeline. Status is written first, from the snapshot,
    /// so it always describes the world as the last completed pass left
    /// it, never a torn mid-pass view.
    pub async fn sync(&self) -> Result<(), Error> {
        let t0 = Instant::now();
        counter!("reconcile_passes", 1u64);
        self.write_status().await;
        for component in SYNC_ORDER {
            if let Err(e) = self.sync_component(*component).await {
                counter!("reconcile_errors", 1u64);
                error!(component = component.as_str(), error = %e, "component sync failed");
                return Err(e);
            }
        }
        histogram!("reconcile_pass_duration_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    pub async fn sync_component(&self, component: Component) -> Result<(), Error> {
        match component {
            Component::OperatorDeployment => self.sync_operator_deployment().await,
            Component::Certificates => self.sync_certificates().await,
            Component::RouterConfig => self.sync_router_config().await,
            Component::ScrapeTargets => self.sync_scrape_targets().await,
            Component::Prometheus => self.sync_prometheus().await,
            Component::PrometheusService => self.sync_prometheus_service().await,
            Component::PrometheusIngress => self.sync_prometheus_ingress().await,
            Component::AlertingRules => self.sync_alerting_rules().await,
            Component::AlertmanagerConfig => self.sync_alertmanager_config().await,
            Component::Alertmanager => self.sync_alertmanager().await,
            Component::AlertmanagerService => self.sync_alertmanager_service().await,
            Component::AlertmanagerIngress => self.sync_alertmanager_ingress().await,
            Component::HubController => self.sync_hub_controller().await,
        }
    }

    async fn write_status(&self) {
        let status = project_status(self.cr, &self.state);
        let ns = match namespace_of(self.cr) {
            Ok(ns) => ns,
            Err(_) => return,
        };
        let name = self.cr.metadata.name.as_deref().unwrap_or_default();
        if let Err(e) = self.store.patch_status(&ns, name, &status).await {
            warn!(error = %e, "failed to update status");
        }
    }

    async fn create_object<K: StoredObject>(
        &self,
        component: Component,
        mut obj: K,
    ) -> Result<(), Error> {
        attach_owner(self.cr, &mut obj);
        match self.store.create(&obj).await {
            Ok(()) => {
                counter!("objects_created", 1u64);
                Ok(())
            }
            Err(StoreError::AlreadyExists { kind, name }) => {
                debug!(kind = %kind, name = %name, "create raced another writer");
                Err(Error::Requeue {
                    component: component.as_str(),
                    reason: format!("{kind}/{name} already exists; retry once it settles"),
                })
            }
            Err(e) => Err(Error::Store(e)),
        }
    }

    async fn update_object<K: StoredObject>(
        &self,
        component: Component,
        mut obj: K,
    ) -> Result<(), Error> {
        attach_owner(self.cr, &mut obj);
        match self.store.update(&obj).await {
            Ok(()) => {
                counter!("objects_updated", 1u64);
                Ok(())
            }
            Err(StoreError::Conflict { kind, name }) => {
                debug!(kind = %kind, name = %name, "write conflicted; deferring to next pass");
                Err(Error::Requeue {
                    component: component.as_str(),
                    reason: format!("version conflict updating {kind}/{name}"),
                })
            }
            Err(e) => Err(Error::Store(e)),
        }
    }

    async fn sync_operator_deployment(&self) -> Result<(), Error> {
        let component = Component::OperatorDeployment;
        match &self.state.operator_deployment {
            None => {
                self.create_object(component, model::new_operator_deployment(self.cr)).await?
            }
            Some(current) => {
                self.update_object(component, model::updated_operator_deployment(self.cr, current))
                    .await?
            }
        }
        info!("prometheus operator deployment in sync");
        Ok(())
    }

    async fn sync_certificates(&self) -> Result<(), Error> {
        let monitoring = self.cr.spec.certs.monitoring_secret.clone();
        self.sync_certificate(
            self.state.monitoring_secret.as_ref(),
            &monitoring,
            model::monitoring_dns_names(self.cr),
        )
        .await?;
        info!("monitoring certificate in sync");
        let client = self.cr.spec.certs.monitoring_client_secret.clone();
        self.sync_certificate(self.state.client_secret.as_ref(), &client, Vec::new()).await?;
        info!("monitoring client certificate in sync");
        Ok(())
    }

    /// Trust material has caller-controlled retention: with auto-clean
    /// set, a secret without a backing Certificate is deleted and
    /// re-issued; without it, pre-existing secrets are never touched,
    /// whoever created them.
    async fn sync_certificate(
        &self,
        current_secret: Option<&Secret>,
        secret_name: &str,
        dns_names: Vec<String>,
    ) -> Result<(), Error> {
        let component = Component::Certificates;
        let ns = namespace_of(self.cr)?;
        if current_secret.is_some() {
            if !self.cr.spec.certs.auto_clean {
                debug!(secret = secret_name, "tls secret exists; keeping it as-is");
                return Ok(());
            }
            match self.store.get::<Certificate>(&ns, secret_name).await? {
                Some(_) => return Ok(()),
                None => {
                    info!(secret = secret_name, "deleting tls secret with no backing certificate");
                    match self.store.delete::<Secret>(&ns, secret_name).await {
                        Ok(()) | Err(StoreError::NotFound { .. }) => {}
                        Err(e) => return Err(Error::Store(e)),
                    }
                }
            }
        }
        let cert = model::new_certificate(self.cr, secret_name, dns_names);
        self.create_object(component, cert).await?;
        // The issued secret cannot be observed in this pass.
        Err(Error::Requeue {
            component: component.as_str(),
            reason: format!("waiting for cert secret {secret_name} to be issued"),
        })
    }

    async fn sync_router_config(&self) -> Result<(), Error> {
        let component = Component::RouterConfig;
        match &self.state.router_entry_cm {
            None => {
                self.create_object(component, model::new_router_entry_cm(self.cr, self.templates))
                    .await?
            }
            Some(current) => {
                self.update_object(
                    component,
                    model::updated_router_entry_cm(self.cr, self.templates, current),
                )
                .await?
            }
        }
        info!("router entrypoint configmap in sync");
        match &self.state.prom_router_cm {
            None => {
                self.create_object(component, model::new_prom_router_cm(self.cr, self.templates))
                    .await?
            }
            Some(current) => {
                self.update_object(
                    component,
                    model::updated_prom_router_cm(self.cr, self.templates, current),
                )
                .await?
            }
        }
        info!("prometheus router nginx configmap in sync");
        match &self.state.prom_lua_utils_cm {
            None => {
                self.create_object(
                    component,
                    model::new_prom_lua_utils_cm(self.cr, self.templates),
                )
                .await?
            }
            Some(current) => {
                self.update_object(
                    component,
                    model::updated_prom_lua_utils_cm(self.cr, self.templates, current),
                )
                .await?
            }
        }
        info!("prometheus lua utils configmap in sync");
        match &self.state.prom_lua_cm {
            None => {
                self.create_object(component, model::new_prom_lua_cm(self.cr, self.templates))
                    .await?
            }
            Some(current) => {
                self.update_object(
                    component,
                    model::updated_prom_lua_cm(self.cr, self.templates, current),
                )
                .await?
            }
        }
        info!("prometheus lua configmap in sync");
        match &self.state.alert_router_cm {
            None => {
                self.create_object(component, model::new_alert_router_cm(self.cr, self.templates))
                    .await?
            }
            Some(current) => {
                self.update_object(
                    component,
                    model::updated_alert_router_cm(self.cr, self.templates, current),
                )
                .await?
            }
        }
        info!("alertmanager router nginx configmap in sync");
        Ok(())
    }

    fn node_exporter_enabled(&self) -> bool {
        self.state
            .exporter
            .as_ref()
            .and_then(|e| e.spec.node_exporter.as_ref())
            .map(|n| n.enable)
            .unwrap_or(false)
    }

    async fn sync_scrape_targets(&self) -> Result<(), Error> {
        let component = Component::ScrapeTargets;
        let node_exporter = self.node_exporter_enabled();
        match &self.state.scrape_targets_secret {
            None => {
                self.create_object(
                    component,
                    model::new_scrape_targets_secret(self.cr, self.templates, node_exporter),
                )
                .await?
            }
            Some(current) => {
                self.update_object(
                    component,
                    model::updated_scrape_targets_secret(
                        self.cr,
                        self.templates,
                        node_exporter,
                        current,
                    ),
                )
                .await?
            }
        }
        info!("prometheus scrape targets secret in sync");
        Ok(())
    }

    async fn sync_prometheus(&self) -> Result<(), Error> {
        let component = Component::Prometheus;
        match &self.state.prometheus {
            None => self.create_object(component, model::new_prometheus(self.cr)?).await?,
            Some(current) => {
                self.update_object(component, model::updated_prometheus(self.cr, current)?).await?
            }
        }
        info!("prometheus object in sync");
        Ok(())
    }

    async fn sync_prometheus_service(&self) -> Result<(), Error> {
        let component = Component::PrometheusService;
        match &self.state.prometheus_svc {
            None => self.create_object(component, model::new_prometheus_svc(self.cr)).await?,
            Some(current) => {
                self.update_object(component, model::updated_prometheus_svc(self.cr, current))
                    .await?
            }
        }
        info!("prometheus service in sync");
        Ok(())
    }

    async fn sync_prometheus_ingress(&self) -> Result<(), Error> {
        let component = Component::PrometheusIngress;
        match &self.state.prometheus_ingress {
            None => self.create_object(component, model::new_prometheus_ingress(self.cr)).await?,
            Some(current) => {
                self.update_object(component, model::updated_prometheus_ingress(self.cr, current))
                    .await?
            }
        }
        info!("prometheus ingress in sync");
        Ok(())
    }

    /// Seed rules are created when absent and never overwritten, so
    /// operator-tuned rules survive.
    async fn sync_alerting_rules(&self) -> Result<(), Error> {
        let component = Component::AlertingRules;
        for (name, rule) in model::default_rules(self.cr) {
            if self.state.present_rules.contains(name) {
                continue;
            }
            self.create_object(component, rule).await?;
        }
        info!("default alerting rules in sync");
        Ok(())
    }

    async fn sync_alertmanager_config(&self) -> Result<(), Error> {
        let component = Component::AlertmanagerConfig;
        if self.state.alertmanager_config_secret.is_none() {
            self.create_object(component, model::new_alertmanager_config_secret(self.cr))
                .await?;
        }
        info!("alertmanager configuration secret in sync");
        Ok(())
    }

    async fn sync_alertmanager(&self) -> Result<(), Error> {
        let component = Component::Alertmanager;
        match &self.state.alertmanager {
            None => self.create_object(component, model::new_alertmanager(self.cr)?).await?,
            Some(current) => {
                self.update_object(component, model::updated_alertmanager(self.cr, current)?)
                    .await?
            }
        }
        info!("alertmanager object in sync");
        Ok(())
    }

    async fn sync_alertmanager_service(&self) -> Result<(), Error> {
        let component = Component::AlertmanagerService;
        match &self.state.alertmanager_svc {
            None => self.create_object(component, model::new_alertmanager_svc(self.cr)).await?,
            Some(current) => {
                self.update_object(component, model::updated_alertmanager_svc(self.cr, current))
                    .await?
            }
        }
        info!("alertmanager service in sync");
        Ok(())
    }

    async fn sync_alertmanager_ingress(&self) -> Result<(), Error> {
        let component = Component::AlertmanagerIngress;
        match &self.state.alertmanager_ingress {
            None => {
                self.create_object(component, model::new_alertmanager_ingress(self.cr)).await?
            }
            Some(current) => {
                self.update_object(component, model::updated_alertmanager_ingress(self.cr, current))
                    .await?
            }
        }
        info!("alertmanager ingress in sync");
        Ok(())
    }

    async fn sync_hub_controller(&self) -> Result<(), Error> {
        let component = Component::HubController;
        if !model::hub_enabled(self.cr) {
            debug!("hub monitoring not enabled; skipping");
            return Ok(());
        }
        match &self.state.hub_deployment {
            None => self.create_object(component, model::new_hub_deployment(self.cr)?).await?,
            Some(current) => {
                self.update_object(component, model::updated_hub_deployment(self.cr, current)?)
                    .await?
            }
        }
        info!("hub controller deployment in sync");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_starts_with_shared_artifacts() {
        assert_eq!(SYNC_ORDER[0], Component::OperatorDeployment);
        assert_eq!(SYNC_ORDER[1], Component::Certificates);
        assert_eq!(SYNC_ORDER[2], Component::RouterConfig);
    }

    #[test]
    fn workloads_precede_their_networking() {
        let pos = |c: Component| SYNC_ORDER.iter().position(|x| *x == c).unwrap();
        assert!(pos(Component::Prometheus) < pos(Component::PrometheusService));
        assert!(pos(Component::PrometheusService) < pos(Component::PrometheusIngress));
        assert!(pos(Component::Alertmanager) < pos(Component::AlertmanagerService));
        assert!(pos(Component::AlertmanagerService) < pos(Component::AlertmanagerIngress));
    }

    #[test]
    fn config_artifacts_precede_workloads_and_hub_is_last() {
        let pos = |c: Component| SYNC_ORDER.iter().position(|x| *x == c).unwrap();
        assert!(pos(Component::Certificates) < pos(Component::Prometheus));
        assert!(pos(Component::RouterConfig) < pos(Component::Prometheus));
        assert!(pos(Component::ScrapeTargets) < pos(Component::Prometheus));
        assert_eq!(*SYNC_ORDER.last().unwrap(), Component::HubController);
    }

    #[test]
    fn component_tags_are_unique() {
        let mut tags: Vec<_> = SYNC_ORDER.iter().map(|c| c.as_str()).collect();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), SYNC_ORDER.len());
    }
}
