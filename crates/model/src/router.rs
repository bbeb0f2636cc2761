//! Auth router sidecar: rendered ConfigMaps and the container itself.
//!
//! The router fronts both workloads with TLS, token auth and namespace
//! scoping; everything it loads at runtime comes from the ConfigMaps
//! built here.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, Container, ContainerPort, ExecAction, Probe, SecurityContext,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use promstack_crd::MonitoringStack;

use crate::templates::{entrypoint_params, router_nginx_params};
use crate::{
    alert_router_cm_name, alertmanager_name, cluster_domain, iam_namespace, image_or_env,
    managed_labels, prom_lua_cm_name, prom_lua_utils_cm_name, prom_router_cm_name,
    router_entry_cm_name, stack_namespace, LuaParams, LuaUtilsParams, TemplateRegistry,
    ROUTER_IMAGE_ENV,
};

/// Which workload a router artifact belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterFlavor {
    Prometheus,
    Alertmanager,
}

fn config_map(cr: &MonitoringStack, name: String, component: &str, key: &str, data: String) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: stack_namespace(cr),
            labels: Some(managed_labels(cr, component)),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(key.to_string(), data)])),
        ..Default::default()
    }
}

/// Clone the observed ConfigMap and overlay labels and data.
fn overlay_config_map(current: &ConfigMap, desired: &ConfigMap) -> ConfigMap {
    let mut cm = current.clone();
    cm.metadata.labels = desired.metadata.labels.clone();
    cm.data = desired.data.clone();
    cm
}

pub fn new_router_entry_cm(cr: &MonitoringStack, templates: &TemplateRegistry) -> ConfigMap {
    let data = templates.render_entrypoint(&entrypoint_params(cr));
    config_map(cr, router_entry_cm_name(cr), "prometheus", "entrypoint.sh", data)
}

pub fn updated_router_entry_cm(
    cr: &MonitoringStack,
    templates: &TemplateRegistry,
    current: &ConfigMap,
) -> ConfigMap {
    overlay_config_map(current, &new_router_entry_cm(cr, templates))
}

pub fn new_prom_router_cm(cr: &MonitoringStack, templates: &TemplateRegistry) -> ConfigMap {
    let data = templates.render_prometheus_nginx(&router_nginx_params(cr));
    config_map(cr, prom_router_cm_name(cr), "prometheus", "nginx.conf", data)
}

pub fn updated_prom_router_cm(
    cr: &MonitoringStack,
    templates: &TemplateRegistry,
    current: &ConfigMap,
) -> ConfigMap {
    overlay_config_map(current, &new_prom_router_cm(cr, templates))
}

pub fn new_prom_lua_cm(cr: &MonitoringStack, templates: &TemplateRegistry) -> ConfigMap {
    let data = templates.render_prometheus_lua(&LuaParams::from_stack(cr));
    config_map(cr, prom_lua_cm_name(cr), "prometheus", "prom.lua", data)
}

pub fn updated_prom_lua_cm(
    cr: &MonitoringStack,
    templates: &TemplateRegistry,
    current: &ConfigMap,
) -> ConfigMap {
    overlay_config_map(current, &new_prom_lua_cm(cr, templates))
}

pub fn new_prom_lua_utils_cm(cr: &MonitoringStack, templates: &TemplateRegistry) -> ConfigMap {
    let data = templates.render_lua_utils(&LuaUtilsParams::from_stack(cr));
    config_map(cr, prom_lua_utils_cm_name(cr), "prometheus", "monitoring-util.lua", data)
}

pub fn updated_prom_lua_utils_cm(
    cr: &MonitoringStack,
    templates: &TemplateRegistry,
    current: &ConfigMap,
) -> ConfigMap {
    overlay_config_map(current, &new_prom_lua_utils_cm(cr, templates))
}

pub fn new_alert_router_cm(cr: &MonitoringStack, templates: &TemplateRegistry) -> ConfigMap {
    let data = templates.render_alertmanager_nginx();
    config_map(cr, alert_router_cm_name(cr), "alertmanager", "nginx.conf", data)
}

pub fn updated_alert_router_cm(
    cr: &MonitoringStack,
    templates: &TemplateRegistry,
    current: &ConfigMap,
) -> ConfigMap {
    overlay_config_map(current, &new_alert_router_cm(cr, templates))
}

/// Router sidecar container injected into the Prometheus and Alertmanager
/// pods. Volume names follow the prometheus-operator convention of
/// `secret-`/`configmap-` prefixes for mounted spec entries.
pub fn new_router_container(cr: &MonitoringStack, flavor: RouterFlavor) -> Container {
    let mut container = Container {
        name: "router".to_string(),
        image: Some(image_or_env(ROUTER_IMAGE_ENV, &cr.spec.router_image)),
        image_pull_policy: cr.spec.image_policy.clone(),
        security_context: Some(SecurityContext {
            read_only_root_filesystem: Some(false),
            capabilities: Some(Capabilities {
                add: Some(
                    ["CHOWN", "NET_ADMIN", "NET_RAW", "LEASE", "SETGID", "SETUID"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }),
        resources: cr.spec.prometheus.router_resources.clone(),
        ports: Some(vec![ContainerPort {
            name: Some("router".to_string()),
            container_port: 8080,
            ..Default::default()
        }]),
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "cp /opt/router/entry/entrypoint.sh /opt/router/; \
             chmod 744 /opt/router/entrypoint.sh; \
             exec /opt/router/entrypoint.sh"
                .to_string(),
        ]),
        ..Default::default()
    };

    // Probes gate on the identity provider; only the prometheus flavor
    // authenticates requests.
    if flavor == RouterFlavor::Prometheus {
        if let Some(iam) = &cr.spec.iam {
            let command = format!(
                "wget --spider --no-check-certificate -S 'https://{}.{}.svc.{}:{}/v1/info'",
                iam.id_provider_svc,
                iam_namespace(cr),
                cluster_domain(cr),
                iam.id_provider_port,
            );
            let readiness = Probe {
                exec: Some(ExecAction {
                    command: Some(vec!["sh".to_string(), "-c".to_string(), command]),
                }),
                initial_delay_seconds: Some(30),
                period_seconds: Some(10),
                ..Default::default()
            };
            let mut liveness = readiness.clone();
            liveness.period_seconds = Some(20);
            container.readiness_probe = Some(readiness);
            container.liveness_probe = Some(liveness);
        }
    }

    let mut mounts = vec![
        VolumeMount {
            name: format!("secret-{}", cr.spec.certs.monitoring_secret),
            mount_path: "/opt/router/caCerts".to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: format!("secret-{}", cr.spec.certs.monitoring_secret),
            mount_path: "/opt/router/certs".to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: format!("configmap-{}", router_entry_cm_name(cr)),
            mount_path: "/opt/router/entry".to_string(),
            ..Default::default()
        },
    ];
    match flavor {
        RouterFlavor::Prometheus => {
            mounts.push(VolumeMount {
                name: format!("configmap-{}", prom_router_cm_name(cr)),
                mount_path: "/opt/router/conf".to_string(),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: format!("configmap-{}", prom_lua_utils_cm_name(cr)),
                mount_path: "/opt/router/nginx/conf/monitoring-util.lua".to_string(),
                sub_path: Some("monitoring-util.lua".to_string()),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: format!("configmap-{}", prom_lua_cm_name(cr)),
                mount_path: "/opt/router/nginx/conf/prom.lua".to_string(),
                sub_path: Some("prom.lua".to_string()),
                ..Default::default()
            });
        }
        RouterFlavor::Alertmanager => {
            mounts.push(VolumeMount {
                name: format!("configmap-{}", alert_router_cm_name(cr)),
                mount_path: "/opt/router/conf".to_string(),
                ..Default::default()
            });
        }
    }
    container.volume_mounts = Some(mounts);
    container
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::stack;

    #[test]
    fn router_cm_names_derive_from_stack_name() {
        let cr = stack("demo");
        let reg = TemplateRegistry::new();
        let cm = new_prom_router_cm(&cr, &reg);
        assert_eq!(cm.metadata.name.as_deref(), Some("demo-prometheus-router-ng"));
        assert!(cm.data.unwrap().contains_key("nginx.conf"));
        let entry = new_router_entry_cm(&cr, &reg);
        assert_eq!(entry.metadata.name.as_deref(), Some("demo-prometheus-router-entry"));
        assert!(entry.data.unwrap().contains_key("entrypoint.sh"));
    }

    #[test]
    fn updated_cm_keeps_server_metadata() {
        let cr = stack("demo");
        let reg = TemplateRegistry::new();
        let mut current = new_prom_lua_cm(&cr, &reg);
        current.metadata.resource_version = Some("42".to_string());
        current.metadata.uid = Some("aaaa".to_string());
        current.data = Some(BTreeMap::from([("prom.lua".to_string(), "stale".to_string())]));
        let updated = updated_prom_lua_cm(&cr, &reg, &current);
        assert_eq!(updated.metadata.resource_version.as_deref(), Some("42"));
        assert_eq!(updated.metadata.uid.as_deref(), Some("aaaa"));
        assert_ne!(updated.data.as_ref().unwrap()["prom.lua"], "stale");
    }

    #[test]
    fn prometheus_router_mounts_lua_scripts() {
        let cr = stack("demo");
        let container = new_router_container(&cr, RouterFlavor::Prometheus);
        let mounts = container.volume_mounts.unwrap();
        let names: Vec<_> = mounts.iter().map(|m| m.name.as_str()).collect();
        assert!(names.contains(&"configmap-demo-prometheus-lua"));
        assert!(names.contains(&"configmap-demo-prometheus-lua-utils"));
        assert!(names.contains(&"secret-monitoring-certs"));
        assert!(container.readiness_probe.is_some());
    }

    #[test]
    fn alertmanager_router_has_no_auth_probe() {
        let cr = stack("demo");
        let container = new_router_container(&cr, RouterFlavor::Alertmanager);
        assert!(container.readiness_probe.is_none());
        let mounts = container.volume_mounts.unwrap();
        assert!(mounts.iter().any(|m| m.name == "configmap-demo-alertmanager-router-ng"));
    }

    #[test]
    fn router_image_comes_from_spec() {
        let cr = stack("demo");
        let container = new_router_container(&cr, RouterFlavor::Prometheus);
        assert_eq!(container.image.as_deref(), Some("registry.example.com/router:4"));
    }
}
