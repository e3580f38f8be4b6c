use std::{sync::Arc, time::Duration};

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1::StatefulSet,
    core::v1::{Pod, Service},
};
use kube::{
    runtime::{
        controller::{Config as ControllerConfig, Controller},
        events::{Recorder, Reporter},
        reflector::ObjectRef,
        watcher,
    },
    Api, Client, CustomResourceExt, ResourceExt,
};
use mkube_crd::{Cluster, Zone, CONTROLLER_LABEL};
use tracing_subscriber::EnvFilter;

mod command;
mod controller;
mod registry;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[derive(Parser)]
#[command(author, version, about = "mkube zone operator")]
struct Opts {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(clap::Subcommand)]
enum Cmd {
    /// Print the CustomResourceDefinition manifests and exit
    Crd,
    /// Run the zone controller
    Run(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Namespace to watch; all namespaces when unset
    #[arg(long, env = "MKUBE_WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Number of zones reconciled concurrently
    #[arg(long, env = "MKUBE_WORKERS", default_value_t = 2)]
    workers: u16,

    /// Interval in seconds between full resyncs of all observed zones
    #[arg(long, env = "MKUBE_RESYNC_SECONDS", default_value_t = 30)]
    resync_seconds: u64,

    /// Initial delay in seconds of the storage container's liveness probe
    #[arg(long, env = "MKUBE_PROBE_INITIAL_DELAY_SECONDS", default_value_t = 120)]
    probe_initial_delay_seconds: i32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Opts::parse().cmd {
        Cmd::Crd => {
            print!(
                "{}---\n{}",
                serde_yaml::to_string(&Zone::crd())?,
                serde_yaml::to_string(&Cluster::crd())?
            );
            Ok(())
        }
        Cmd::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("MKUBE_OPERATOR_LOG")
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    tracing::info!(
        pkg = built_info::PKG_NAME,
        version = built_info::PKG_VERSION,
        target = built_info::TARGET,
        rustc = built_info::RUSTC_VERSION,
        "starting zone operator"
    );

    let client = Client::try_default().await?;
    registry::ensure_crds(&client).await?;

    let namespace = args.watch_namespace.as_deref();
    let zones = namespaced_api::<Zone>(&client, namespace);
    let clusters = namespaced_api::<Cluster>(&client, namespace);
    let services = namespaced_api::<Service>(&client, namespace);
    let statefulsets = namespaced_api::<StatefulSet>(&client, namespace);
    let pods = namespaced_api::<Pod>(&client, namespace);

    let zone_controller = Controller::new(zones, watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(args.workers));
    let store = zone_controller.store();

    let ctx = Arc::new(controller::Ctx {
        client: client.clone(),
        zones: store,
        recorder: Recorder::new(
            client,
            Reporter {
                controller: controller::FULL_CONTROLLER_NAME.to_string(),
                instance: None,
            },
        ),
        probe_initial_delay_seconds: args.probe_initial_delay_seconds,
    });

    // Periodic resync backstops missed watch events: every observed zone is
    // requeued even when nothing changed.
    let mut interval = tokio::time::interval(Duration::from_secs(args.resync_seconds));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let resync = futures::stream::unfold(interval, |mut interval| async move {
        interval.tick().await;
        Some(((), interval))
    });

    zone_controller
        .owns(services, watcher::Config::default())
        .owns(statefulsets, watcher::Config::default())
        // A Cluster edit changes the launch command of every listed zone.
        .watches(clusters, watcher::Config::default(), |cluster: Cluster| {
            let namespace = cluster.namespace();
            cluster
                .spec
                .zones
                .into_iter()
                .map(move |zone| match &namespace {
                    Some(namespace) => ObjectRef::new(&zone).within(namespace),
                    None => ObjectRef::new(&zone),
                })
                .collect::<Vec<ObjectRef<Zone>>>()
        })
        // Pods are owned by their StatefulSet, not the zone, so route pod
        // churn back through the controller label.
        .watches(pods, watcher::Config::default(), |pod: Pod| {
            let namespace = pod.namespace()?;
            let zone = pod.labels().get(CONTROLLER_LABEL)?.clone();
            Some(ObjectRef::new(&zone).within(&namespace))
        })
        .reconcile_all_on(resync)
        .shutdown_on_signal()
        .run(controller::reconcile_zone, controller::error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((zone, _)) => tracing::debug!(zone = %zone, "reconciled"),
                Err(error) => tracing::warn!(%error, "controller error"),
            }
        })
        .await;

    Ok(())
}

fn namespaced_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}
