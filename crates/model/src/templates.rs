//! Rendered config artifacts.
//!
//! Each payload is an opaque `render(params) -> String` over a static
//! template with `%{VAR}` slots; conditional sections are assembled here
//! rather than in a template language. The registry is built once at
//! process start and passed by reference into the builders that render.

use promstack_crd::MonitoringStack;

use crate::{
    alertmanager_name, cluster_domain, cluster_name, iam_namespace, is_standalone,
    prometheus_name, stack_namespace, DEFAULT_HELM_PORT,
};

fn fill(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("%{{{key}}}"), value);
    }
    out
}

/// Flags for the Prometheus router nginx config. `managed` wires the auth
/// lua scripts in; `openshift` picks the resolver discovered by the
/// entrypoint over the cluster DNS service.
#[derive(Debug, Clone, Copy)]
pub struct RouterNginxParams {
    pub managed: bool,
    pub openshift: bool,
    pub standalone: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct EntrypointParams {
    pub managed: bool,
    pub openshift: bool,
}

#[derive(Debug, Clone)]
pub struct ScrapeTargetParams {
    pub standalone: bool,
    pub ca_secret: String,
    pub client_secret: String,
    pub node_exporter: bool,
    pub cluster_domain: String,
}

#[derive(Debug, Clone)]
pub struct LuaParams {
    pub standalone: bool,
    pub alertmanager_svc: String,
    pub alertmanager_port: String,
    pub helm_namespace: String,
    pub helm_port: i32,
    pub cluster_domain: String,
}

#[derive(Debug, Clone)]
pub struct LuaUtilsParams {
    pub cluster_name: String,
    pub cluster_domain: String,
    pub namespace: String,
    pub prometheus_svc: String,
    pub prometheus_port: String,
    pub grafana_svc: String,
    pub grafana_port: String,
    pub iam_namespace: String,
    pub iam_provider_svc: String,
    pub iam_provider_port: String,
    pub iam_management_svc: String,
    pub iam_management_port: String,
}

const LUA_INIT_BLOCK: &str = r#"    lua_package_path '$prefix/conf/?.lua;;';
    lua_shared_dict router_state_cache 100m;
    lua_shared_dict shmlocks 1m;

    init_by_lua '
        prom = require "prom"
        util = require "monitoring-util"
    ';
"#;

const STATUS_FILTER_BLOCK: &str = r#"          header_filter_by_lua_block {
              ngx.header["Cache-control"] = "no-cache, no-store, must-revalidate"
              ngx.header["Pragma"] = "no-cache"
              ngx.header["Access-Control-Allow-Credentials"] = "false"
              util.remove_content_len_header()
          }
          body_filter_by_lua 'prom.filter_alertmanager_url()';
"#;

const DATASOURCE_INFO_BLOCK: &str = r#"          if ($arg_query = "cluster_datasource_info") {
             content_by_lua 'prom.write_cluster_datasource_response()';
          }
"#;

const REWRITE_LINE: &str = "          rewrite_by_lua 'prom.rewrite_query()';\n";

const OPENSHIFT_RESOLVER_BLOCK: &str = r#"
export OPENSHIFT_RESOLVER=$(cat /etc/resolv.conf |grep nameserver|awk '{split($0, a, " "); print a[2]}')
sed -i "s/{OPENSHIFT_RESOLVER}/${OPENSHIFT_RESOLVER}/g" /opt/router/nginx/conf/nginx.conf.monitoring
"#;

const LUA_COPY_BLOCK: &str = r#"
if [ -d /opt/router/lua-scripts ]; then
  cp -f /opt/router/lua-scripts/*.lua /opt/router/nginx/conf/
fi
"#;

const HUB_JOB_LABELS: &str = r#"        labels:
          metrics_type: system"#;

const HUB_SECTION: &str = r#"
    metric_relabel_configs:
      - source_labels: [__name__]
        regex: (.*)
        replacement: system
        target_label: metrics_type
"#;

const HUB_ENTRIES: &str = r#"      - source_labels: ['kubernetes_namespace']
        regex: (.*)
        target_label: hub_kubernetes_namespace
      - source_labels: ['kubernetes_namespace']
        regex: ""
        replacement: system
        target_label: metrics_type
"#;

const NODE_EXPORTER_JOB: &str = r#"
  # Node exporter endpoints deployed by the exporter operator.
  - job_name: 'node-exporter-endpoints-with-tls'

    kubernetes_sd_configs:
      - role: endpoints

    relabel_configs:
      - source_labels: [__meta_kubernetes_service_annotation_prometheus_io_scrape]
        action: keep
        regex: true
      - source_labels: [__meta_kubernetes_service_annotation_skip_verify]
        action: keep
        regex: true
      - source_labels: [__meta_kubernetes_service_annotation_prometheus_io_scheme]
        action: keep
        regex: https
      - source_labels: [__meta_kubernetes_service_annotation_prometheus_io_path]
        action: replace
        target_label: __metrics_path__
        regex: (.+)
      - source_labels: [__address__, __meta_kubernetes_service_annotation_prometheus_io_port]
        action: replace
        target_label: __address__
        regex: ([^:]+)(?::\d+)?;(\d+)
        replacement: $1:$2
      - action: labelmap
        regex: __meta_kubernetes_service_label_(.+)
      - source_labels: [__meta_kubernetes_namespace]
        action: replace
        target_label: kubernetes_namespace
      - source_labels: [__meta_kubernetes_service_name]
        action: replace
        target_label: kubernetes_name
%{NODE_HUB_SECTION}
    scheme: https

    tls_config:
      ca_file: /etc/prometheus/secrets/%{CA_SECRET}/ca.crt
      cert_file: /etc/prometheus/secrets/%{CLIENT_SECRET}/tls.crt
      key_file: /etc/prometheus/secrets/%{CLIENT_SECRET}/tls.key
      insecure_skip_verify: true
"#;

/// Immutable registry of the five payload templates.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    prometheus_nginx: &'static str,
    alertmanager_nginx: &'static str,
    entrypoint: &'static str,
    scrape_targets: &'static str,
    prom_lua: &'static str,
    lua_utils: &'static str,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self {
            prometheus_nginx: include_str!("payloads/prometheus-nginx.conf"),
            alertmanager_nginx: include_str!("payloads/alertmanager-nginx.conf"),
            entrypoint: include_str!("payloads/entrypoint.sh"),
            scrape_targets: include_str!("payloads/scrape-targets.yaml"),
            prom_lua: include_str!("payloads/prom.lua"),
            lua_utils: include_str!("payloads/monitoring-util.lua"),
        }
    }

    pub fn render_prometheus_nginx(&self, p: &RouterNginxParams) -> String {
        let resolver = if p.openshift { "{OPENSHIFT_RESOLVER}" } else { "kube-dns" };
        fill(
            self.prometheus_nginx,
            &[
                ("LUA_INIT", if p.managed { LUA_INIT_BLOCK } else { "" }),
                ("RESOLVER", resolver),
                ("SERIES_REWRITE", if p.managed { REWRITE_LINE } else { "" }),
                ("STATUS_FILTER", if p.managed { STATUS_FILTER_BLOCK } else { "" }),
                ("DATASOURCE_INFO", if p.standalone { DATASOURCE_INFO_BLOCK } else { "" }),
                ("ROOT_REWRITE", if p.managed { REWRITE_LINE } else { "" }),
            ],
        )
    }

    pub fn render_alertmanager_nginx(&self) -> String {
        self.alertmanager_nginx.to_string()
    }

    pub fn render_entrypoint(&self, p: &EntrypointParams) -> String {
        fill(
            self.entrypoint,
            &[
                ("RESOLVER_BLOCK", if p.openshift { OPENSHIFT_RESOLVER_BLOCK } else { "" }),
                ("LUA_BLOCK", if p.managed { LUA_COPY_BLOCK } else { "" }),
            ],
        )
    }

    pub fn render_scrape_targets(&self, p: &ScrapeTargetParams) -> String {
        let node_job = if p.node_exporter {
            fill(
                NODE_EXPORTER_JOB,
                &[("NODE_HUB_SECTION", if p.standalone { "" } else { HUB_SECTION })],
            )
        } else {
            String::new()
        };
        fill(
            self.scrape_targets,
            &[
                ("HUB_JOB_LABELS", if p.standalone { "" } else { HUB_JOB_LABELS }),
                ("HUB_SECTION", if p.standalone { "" } else { HUB_SECTION }),
                ("HUB_ENTRIES", if p.standalone { "" } else { HUB_ENTRIES }),
                ("NODE_EXPORTER_JOB", &node_job),
                ("CLUSTER_DOMAIN", &p.cluster_domain),
                ("CA_SECRET", &p.ca_secret),
                ("CLIENT_SECRET", &p.client_secret),
            ],
        )
    }

    pub fn render_prometheus_lua(&self, p: &LuaParams) -> String {
        fill(
            self.prom_lua,
            &[
                ("STANDALONE", if p.standalone { "true" } else { "false" }),
                ("ALERTMANAGER_SVC", &p.alertmanager_svc),
                ("ALERTMANAGER_PORT", &p.alertmanager_port),
                ("HELM_NAMESPACE", &p.helm_namespace),
                ("HELM_PORT", &p.helm_port.to_string()),
                ("CLUSTER_DOMAIN", &p.cluster_domain),
            ],
        )
    }

    pub fn render_lua_utils(&self, p: &LuaUtilsParams) -> String {
        fill(
            self.lua_utils,
            &[
                ("CLUSTER_NAME", &p.cluster_name),
                ("CLUSTER_DOMAIN", &p.cluster_domain),
                ("NAMESPACE", &p.namespace),
                ("PROMETHEUS_SVC", &p.prometheus_svc),
                ("PROMETHEUS_PORT", &p.prometheus_port),
                ("GRAFANA_SVC", &p.grafana_svc),
                ("GRAFANA_PORT", &p.grafana_port),
                ("IAM_NAMESPACE", &p.iam_namespace),
                ("IAM_PROVIDER_SVC", &p.iam_provider_svc),
                ("IAM_PROVIDER_PORT", &p.iam_provider_port),
                ("IAM_MANAGEMENT_SVC", &p.iam_management_svc),
                ("IAM_MANAGEMENT_PORT", &p.iam_management_port),
            ],
        )
    }
}

impl LuaParams {
    pub fn from_stack(cr: &MonitoringStack) -> Self {
        let helm = cr.spec.helm_releases.as_ref();
        Self {
            standalone: is_standalone(cr),
            alertmanager_svc: alertmanager_name(cr),
            alertmanager_port: cr.spec.alertmanager.service_port.to_string(),
            helm_namespace: helm
                .and_then(|h| h.namespace.clone())
                .filter(|ns| !ns.is_empty())
                .or_else(|| stack_namespace(cr))
                .unwrap_or_default(),
            helm_port: helm.and_then(|h| h.port).filter(|p| *p != 0).unwrap_or(DEFAULT_HELM_PORT),
            cluster_domain: cluster_domain(cr),
        }
    }
}

impl LuaUtilsParams {
    pub fn from_stack(cr: &MonitoringStack) -> Self {
        let iam = cr.spec.iam.as_ref();
        Self {
            cluster_name: cluster_name(cr),
            cluster_domain: cluster_domain(cr),
            namespace: stack_namespace(cr).unwrap_or_default(),
            prometheus_svc: prometheus_name(cr),
            prometheus_port: cr.spec.prometheus.service_port.to_string(),
            grafana_svc: cr.spec.grafana_svc_name.clone().unwrap_or_default(),
            grafana_port: cr.spec.grafana_svc_port.unwrap_or_default().to_string(),
            iam_namespace: iam_namespace(cr),
            iam_provider_svc: iam.map(|i| i.id_provider_svc.clone()).unwrap_or_default(),
            iam_provider_port: iam.map(|i| i.id_provider_port).unwrap_or_default().to_string(),
            iam_management_svc: iam.map(|i| i.id_management_svc.clone()).unwrap_or_default(),
            iam_management_port: iam.map(|i| i.id_management_port).unwrap_or_default().to_string(),
        }
    }
}

impl ScrapeTargetParams {
    pub fn from_stack(cr: &MonitoringStack, node_exporter: bool) -> Self {
        Self {
            standalone: is_standalone(cr),
            ca_secret: cr.spec.certs.monitoring_secret.clone(),
            client_secret: cr.spec.certs.monitoring_client_secret.clone(),
            node_exporter,
            cluster_domain: cluster_domain(cr),
        }
    }
}

// The router runs managed, on openshift, in every supported topology.
pub(crate) fn router_nginx_params(cr: &MonitoringStack) -> RouterNginxParams {
    RouterNginxParams { managed: true, openshift: true, standalone: is_standalone(cr) }
}

pub(crate) fn entrypoint_params(_cr: &MonitoringStack) -> EntrypointParams {
    EntrypointParams { managed: true, openshift: true }
}
