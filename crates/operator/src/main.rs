//! MonitoringStack operator: controller wiring around the reconcile
//! engine. Watches the stack CRD plus the managed object kinds it owns
//! and re-runs a pass whenever any of them change.

#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tracing::{error, info, warn};

use promstack_crd::{Alertmanager, MonitoringStack, Prometheus};
use promstack_model::TemplateRegistry;
use promstack_reconcile::{read_cluster_state, Disposition, Error, KubeStore, Reconciler};

#[derive(Parser, Debug)]
#[command(name = "promstack-operator", version, about = "MonitoringStack reconciliation operator")]
struct Cli {
    /// Namespace to watch (default: all namespaces)
    #[arg(long = "ns")]
    namespace: Option<String>,

    /// Terminal-error backoff in seconds
    #[arg(long = "error-backoff-secs", default_value_t = 300)]
    error_backoff_secs: u64,
}

struct Context {
    client: Client,
    templates: TemplateRegistry,
    error_backoff: Duration,
}

fn init_tracing() {
    let env = std::env::var("PROMSTACK_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PROMSTACK_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid PROMSTACK_METRICS_ADDR; expected host:port");
        }
    }
}

async fn reconcile(stack: Arc<MonitoringStack>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = stack.name_any();
    info!(stack = %name, "reconciling");
    let store = KubeStore::new(ctx.client.clone());
    let state = read_cluster_state(&store, &stack).await?;
    let reconciler = Reconciler::new(&store, &ctx.templates, &stack, state);
    match reconciler.sync().await {
        Ok(()) => Ok(Action::await_change()),
        Err(e) => match e.disposition() {
            Disposition::RetryAfter(delay) => {
                info!(stack = %name, reason = %e, "pass requeued");
                Ok(Action::requeue(delay))
            }
            Disposition::Terminal => Err(e),
        },
    }
}

fn error_policy(stack: Arc<MonitoringStack>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(stack = %stack.name_any(), error = %error, "reconcile failed");
    Action::requeue(ctx.error_backoff)
}

fn scoped_api<K>(client: &Client, ns: Option<&str>) -> Api<K>
where
    K: kube::Resource<DynamicType = (), Scope = kube::core::NamespaceResourceScope>,
{
    match ns {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let client = Client::try_default().await?;
    let ns = cli.namespace.as_deref();
    let stacks: Api<MonitoringStack> = scoped_api(&client, ns);
    let deployments: Api<Deployment> = scoped_api(&client, ns);
    let prometheuses: Api<Prometheus> = scoped_api(&client, ns);
    let alertmanagers: Api<Alertmanager> = scoped_api(&client, ns);

    let ctx = Arc::new(Context {
        client,
        templates: TemplateRegistry::new(),
        error_backoff: Duration::from_secs(cli.error_backoff_secs),
    });

    info!(ns = ?cli.namespace, "starting monitoring stack controller");
    Controller::new(stacks, watcher::Config::default())
        .owns(deployments, watcher::Config::default())
        .owns(prometheuses, watcher::Config::default())
        .owns(alertmanagers, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => info!(stack = %obj.name, "reconciled"),
                Err(e) => warn!(error = %e, "controller stream error"),
            }
        })
        .await;

    Ok(())
}
