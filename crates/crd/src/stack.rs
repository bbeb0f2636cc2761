use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired state of one managed monitoring stack.
///
/// Every optional field has a well-defined default applied by the resolver
/// in `promstack-model`; nothing downstream of it sees an ambiguous value.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "monitoring.promstack.io",
    version = "v1alpha1",
    kind = "MonitoringStack",
    plural = "monitoringstacks",
    status = "MonitoringStackStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringStackSpec {
    /// Externally reachable address of the cluster; loopback when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_domain: Option<String>,
    /// Image pull policy applied to every managed container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secrets: Option<Vec<String>>,
    /// Auth router sidecar image (env override: PROMSTACK_ROUTER_IMAGE).
    #[serde(default)]
    pub router_image: String,
    /// Storage class used by both workloads' volume claims.
    #[serde(default)]
    pub storage_class_name: String,
    #[serde(default)]
    pub prometheus: PrometheusSettings,
    #[serde(default)]
    pub alertmanager: AlertmanagerSettings,
    #[serde(default)]
    pub certs: CertSettings,
    #[serde(default)]
    pub operator_images: OperatorImages,
    /// Hub (multi-cluster) monitoring controller; absent means not a hub.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub: Option<HubSettings>,
    /// Identity provider the router authenticates against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iam: Option<IamSettings>,
    /// Grafana service integrated with this stack (cross-reference only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grafana_svc_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grafana_svc_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_releases: Option<HelmReleaseSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    #[serde(default)]
    pub image_repo: String,
    #[serde(default)]
    pub image_tag: String,
    /// Metrics retention period, e.g. "24h".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scrape_interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_resources: Option<ResourceRequirements>,
    /// Persistent volume size, e.g. "10Gi".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pv_size: Option<String>,
    #[serde(default)]
    pub service_port: i32,
    /// Node memory alert threshold in percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_memory_threshold: Option<i32>,
    /// Node CPU alert threshold in percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_cpu_threshold: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    #[serde(default)]
    pub image_repo: String,
    #[serde(default)]
    pub image_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pv_size: Option<String>,
    #[serde(default)]
    pub service_port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

/// TLS material for the stack. The named secrets are issued by the external
/// certificate authority controller from Certificate objects this operator
/// creates; it never writes the secrets itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertSettings {
    /// Server certificate secret for Prometheus and Alertmanager.
    #[serde(default)]
    pub monitoring_secret: String,
    /// Client certificate secret used by scrapers and the router.
    #[serde(default)]
    pub monitoring_client_secret: String,
    /// Issuer name all stack certificates are requested from.
    #[serde(default)]
    pub issuer: String,
    /// When true, a pre-existing secret without a backing Certificate is
    /// deleted and re-issued. When false, user-supplied secrets are kept
    /// untouched no matter who created them.
    #[serde(default)]
    pub auto_clean: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HubSettings {
    #[serde(default)]
    pub is_hub_cluster: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helper_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IamSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub id_provider_svc: String,
    #[serde(default)]
    pub id_provider_port: i32,
    #[serde(default)]
    pub id_management_svc: String,
    #[serde(default)]
    pub id_management_port: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

/// Images for the prometheus-operator deployment (env overrides:
/// PROMSTACK_OPERATOR_IMAGE, PROMSTACK_RELOADER_IMAGE,
/// PROMSTACK_CONFIG_RELOADER_IMAGE).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperatorImages {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub config_reloader_image: String,
    #[serde(default)]
    pub prometheus_config_reloader_image: String,
}

/// Observed state, written once per reconciliation pass from the snapshot.
/// Never read back by the resolver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringStackStatus {
    /// Replica summary of the prometheus-operator deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus_operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alertmanager: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exporter: Option<String>,
    /// "Ready: a b, NotReady: c" with sorted name lists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configmaps: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<String>,
}
