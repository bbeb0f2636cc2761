//! prometheus-operator Deployment: the sub-controller that turns the
//! Prometheus/Alertmanager objects into running pods.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements,
    SecurityContext,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use promstack_crd::MonitoringStack;

use crate::{
    common_pod_annotations, image_or_env, image_pull_secret_refs, managed_labels, operator_name,
    stack_namespace, CONFIG_RELOADER_IMAGE_ENV, OPERATOR_IMAGE_ENV, RELOADER_IMAGE_ENV,
};

fn operator_labels(cr: &MonitoringStack) -> BTreeMap<String, String> {
    managed_labels(cr, "prometheus-operator")
}

fn operator_container(cr: &MonitoringStack) -> Container {
    let namespace = stack_namespace(cr).unwrap_or_default();
    let quantities = |cpu: &str, mem: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(mem.to_string())),
        ])
    };
    Container {
        name: "prometheus-operator".to_string(),
        image: Some(image_or_env(OPERATOR_IMAGE_ENV, &cr.spec.operator_images.image)),
        image_pull_policy: cr.spec.image_policy.clone(),
        args: Some(vec![
            format!("-namespaces={namespace}"),
            "-manage-crds=false".to_string(),
            "-logtostderr=true".to_string(),
            format!(
                "--config-reloader-image={}",
                image_or_env(RELOADER_IMAGE_ENV, &cr.spec.operator_images.config_reloader_image)
            ),
            format!(
                "--prometheus-config-reloader={}",
                image_or_env(
                    CONFIG_RELOADER_IMAGE_ENV,
                    &cr.spec.operator_images.prometheus_config_reloader_image
                )
            ),
        ]),
        env: Some(vec![EnvVar {
            name: "NAMESPACE".to_string(),
            value: Some(namespace),
            ..Default::default()
        }]),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: 8080,
            ..Default::default()
        }]),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            privileged: Some(false),
            ..Default::default()
        }),
        resources: Some(ResourceRequirements {
            limits: Some(quantities("200m", "256Mi")),
            requests: Some(quantities("100m", "50Mi")),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn operator_deployment_spec(cr: &MonitoringStack) -> DeploymentSpec {
    DeploymentSpec {
        selector: LabelSelector {
            match_labels: Some(operator_labels(cr)),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                name: Some(operator_name(cr)),
                labels: Some(operator_labels(cr)),
                annotations: Some(common_pod_annotations()),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                host_pid: Some(false),
                host_ipc: Some(false),
                host_network: Some(false),
                service_account_name: Some("prometheus-operator".to_string()),
                image_pull_secrets: image_pull_secret_refs(cr),
                containers: vec![operator_container(cr)],
                ..Default::default()
            }),
        },
        ..Default::default()
    }
}

pub fn new_operator_deployment(cr: &MonitoringStack) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(operator_name(cr)),
            namespace: stack_namespace(cr),
            labels: Some(operator_labels(cr)),
            ..Default::default()
        },
        spec: Some(operator_deployment_spec(cr)),
        ..Default::default()
    }
}

/// Overlay only the pod template and labels; replica counts and other
/// knobs someone tuned on the live object survive.
pub fn updated_operator_deployment(cr: &MonitoringStack, current: &Deployment) -> Deployment {
    let mut deployment = current.clone();
    deployment.metadata.labels = Some(operator_labels(cr));
    let desired = operator_deployment_spec(cr);
    let spec = deployment.spec.get_or_insert_with(Default::default);
    spec.template.metadata = desired.template.metadata.clone();
    if let Some(pod) = spec.template.spec.as_mut() {
        let desired_pod = desired.template.spec.unwrap_or_default();
        pod.containers = desired_pod.containers;
        pod.image_pull_secrets = desired_pod.image_pull_secrets;
        pod.service_account_name = desired_pod.service_account_name;
    } else {
        spec.template.spec = desired.template.spec;
    }
    deployment
}
