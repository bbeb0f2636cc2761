//! Default alerting rules seeded next to the managed Prometheus.
//!
//! Rules are created when absent and never overwritten, so operators can
//! tune them in place without the controller reverting the change.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use promstack_crd::{AlertRule, MonitoringStack, PrometheusRule, PrometheusRuleSpec, RuleGroup};

use crate::{
    prometheus_labels, stack_namespace, DEFAULT_NODE_CPU_THRESHOLD,
    DEFAULT_NODE_MEMORY_THRESHOLD,
};

pub const NODE_MEMORY_RULE: &str = "node-memory-usage";
pub const NODE_CPU_RULE: &str = "high-cpu-usage";
pub const PODS_TERMINATED_RULE: &str = "pods-terminated";
pub const PODS_RESTARTING_RULE: &str = "pods-restarting";
pub const FAILED_JOBS_RULE: &str = "failed-jobs";

/// Names of all seeded rules, in creation order.
pub const DEFAULT_RULE_NAMES: &[&str] = &[
    NODE_MEMORY_RULE,
    NODE_CPU_RULE,
    PODS_TERMINATED_RULE,
    PODS_RESTARTING_RULE,
    FAILED_JOBS_RULE,
];

fn annotations(summary: &str, description: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("summary".to_string(), summary.to_string()),
        ("description".to_string(), description.to_string()),
    ])
}

fn rule(cr: &MonitoringStack, name: &str, group: RuleGroup) -> PrometheusRule {
    PrometheusRule {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: stack_namespace(cr),
            labels: Some(prometheus_labels(cr)),
            ..Default::default()
        },
        spec: PrometheusRuleSpec { groups: vec![group] },
    }
}

fn node_memory_rule(cr: &MonitoringStack) -> PrometheusRule {
    let threshold = cr
        .spec
        .prometheus
        .node_memory_threshold
        .filter(|t| *t != 0)
        .unwrap_or(DEFAULT_NODE_MEMORY_THRESHOLD);
    rule(
        cr,
        NODE_MEMORY_RULE,
        RuleGroup {
            name: "NodeMemoryUsage".to_string(),
            rules: vec![AlertRule {
                alert: "NodeMemoryUsage".to_string(),
                expr: format!(
                    "((node_memory_MemTotal_bytes - (node_memory_MemFree_bytes \
                     + node_memory_Buffers_bytes + node_memory_Cached_bytes)) \
                     / node_memory_MemTotal_bytes) * 100 > {threshold}"
                ),
                for_: Some("5m".to_string()),
                labels: None,
                annotations: Some(annotations(
                    "{{ $labels.instance }}: High memory usage detected",
                    &format!(
                        "{{{{ $labels.instance }}}}: Memory usage is above the \
                         {threshold}% threshold. The current value is: {{{{ $value }}}}."
                    ),
                )),
            }],
        },
    )
}

fn node_cpu_rule(cr: &MonitoringStack) -> PrometheusRule {
    let threshold = cr
        .spec
        .prometheus
        .node_cpu_threshold
        .filter(|t| *t != 0)
        .unwrap_or(DEFAULT_NODE_CPU_THRESHOLD);
    rule(
        cr,
        NODE_CPU_RULE,
        RuleGroup {
            name: "HighCPUUsage".to_string(),
            rules: vec![AlertRule {
                alert: "HighCPUUsage".to_string(),
                expr: format!(
                    "(100 - (avg by (instance) \
                     (irate(node_cpu_seconds_total{{mode=\"idle\"}}[5m])) * 100)) > {threshold}"
                ),
                for_: Some("5m".to_string()),
                labels: None,
                annotations: Some(annotations(
                    "High CPU Usage",
                    &format!(
                        "{{{{ $labels.instance }}}}: CPU usage is above the \
                         {threshold}% threshold. The current value is: {{{{ $value }}}}."
                    ),
                )),
            }],
        },
    )
}

fn pods_terminated_rule(cr: &MonitoringStack) -> PrometheusRule {
    rule(
        cr,
        PODS_TERMINATED_RULE,
        RuleGroup {
            name: "podsTerminated".to_string(),
            rules: vec![AlertRule {
                alert: "podsTerminated".to_string(),
                expr: "sum_over_time(kube_pod_container_status_terminated_reason\
                       {reason!=\"Completed\"}[1h]) > 0"
                    .to_string(),
                for_: None,
                labels: None,
                annotations: Some(annotations(
                    "Pod was terminated",
                    "Pod {{ $labels.pod }} in namespace {{ $labels.namespace }} \
                     has a termination status other than completed.",
                )),
            }],
        },
    )
}

fn pods_restarting_rule(cr: &MonitoringStack) -> PrometheusRule {
    rule(
        cr,
        PODS_RESTARTING_RULE,
        RuleGroup {
            name: "podsRestarting".to_string(),
            rules: vec![AlertRule {
                alert: "podsRestarting".to_string(),
                expr: "increase(kube_pod_container_status_restarts_total[1h]) > 5".to_string(),
                for_: None,
                labels: None,
                annotations: Some(annotations(
                    "Pod restarting a lot",
                    "Pod {{ $labels.pod }} in namespace {{ $labels.namespace }} \
                     is restarting a lot",
                )),
            }],
        },
    )
}

fn failed_jobs_rule(cr: &MonitoringStack) -> PrometheusRule {
    rule(
        cr,
        FAILED_JOBS_RULE,
        RuleGroup {
            name: "failedJobs".to_string(),
            rules: vec![AlertRule {
                alert: "failedJobs".to_string(),
                expr: "kube_job_failed != 0".to_string(),
                for_: None,
                labels: None,
                annotations: Some(annotations(
                    "Failed job",
                    "Job {{ $labels.exported_job }} in namespace \
                     {{ $labels.namespace }} failed for some reason.",
                )),
            }],
        },
    )
}

/// All default rules for this stack, keyed by object name.
pub fn default_rules(cr: &MonitoringStack) -> Vec<(&'static str, PrometheusRule)> {
    vec![
        (NODE_MEMORY_RULE, node_memory_rule(cr)),
        (NODE_CPU_RULE, node_cpu_rule(cr)),
        (PODS_TERMINATED_RULE, pods_terminated_rule(cr)),
        (PODS_RESTARTING_RULE, pods_restarting_rule(cr)),
        (FAILED_JOBS_RULE, failed_jobs_rule(cr)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::stack;

    #[test]
    fn five_rules_in_stable_order() {
        let cr = stack("demo");
        let rules = default_rules(&cr);
        let names: Vec<_> = rules.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, DEFAULT_RULE_NAMES);
    }

    #[test]
    fn thresholds_come_from_the_spec() {
        let mut cr = stack("demo");
        cr.spec.prometheus.node_memory_threshold = Some(90);
        let rules = default_rules(&cr);
        let (_, mem) = &rules[0];
        assert!(mem.spec.groups[0].rules[0].expr.ends_with("> 90"));
    }

    #[test]
    fn thresholds_default_when_unset() {
        let cr = stack("demo");
        let rules = default_rules(&cr);
        assert!(rules[0].1.spec.groups[0].rules[0].expr.ends_with("> 80"));
        assert!(rules[1].1.spec.groups[0].rules[0].expr.ends_with("> 85"));
    }

    #[test]
    fn rules_carry_stack_labels_and_namespace() {
        let cr = stack("demo");
        for (_, rule) in default_rules(&cr) {
            assert_eq!(rule.metadata.namespace.as_deref(), Some("monitoring"));
            assert!(rule.metadata.labels.is_some());
        }
    }
}
