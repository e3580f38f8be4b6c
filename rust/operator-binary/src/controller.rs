//! Zone reconciliation.
//!
//! Each reconcile converges the whole namespace, not just the triggering
//! zone: membership is recorded in the Cluster singleton, the launch command
//! is derived from the full ordered zone list, and every member's workload
//! is brought up to date. Running the loop for any member therefore reaches
//! the same fixed point, which is what makes crash recovery a plain rerun.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use k8s_openapi::{
    api::{
        apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy},
        core::v1::{
            Container, ContainerPort, EnvVar, PersistentVolumeClaim, Pod, PodDNSConfig, PodSpec,
            PodTemplateSpec, Probe, Service, ServicePort, ServiceSpec, TCPSocketAction,
            VolumeMount,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::{LabelSelector, ObjectMeta},
        util::intstr::IntOrString,
    },
};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    runtime::{
        controller::Action,
        events::{Event, EventType, Recorder},
        reflector::{ObjectRef, Store},
    },
    Client, Resource, ResourceExt,
};
use mkube_crd::{
    Cluster, ClusterSpec, Zone, APP_LABEL, APP_NAME, CLUSTER_NAME, CONTROLLER_LABEL, HTTP_PORT,
    HTTP_PORT_NAME,
};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::command::{launch_plan, LaunchPlan, ZoneTopology};

pub const FULL_CONTROLLER_NAME: &str = "zone.mkube.min.io";

const ERR_RESOURCE_EXISTS: &str = "ErrResourceExists";
const ERR_IMMUTABLE_FIELD: &str = "ErrImmutableField";
const ERR_INVALID_SPEC: &str = "ErrInvalidSpec";

pub struct Ctx {
    pub client: Client,
    pub zones: Store<Zone>,
    pub recorder: Recorder,
    pub probe_initial_delay_seconds: i32,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("object defines no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("object has no uid to build an owner reference from"))]
    NoOwnerRef,

    #[snafu(display("failed to retrieve StatefulSet for zone {zone:?}"))]
    GetStatefulSet { source: kube::Error, zone: String },

    #[snafu(display("failed to create StatefulSet for zone {zone:?}"))]
    CreateStatefulSet { source: kube::Error, zone: String },

    #[snafu(display("failed to update StatefulSet for zone {zone:?}"))]
    UpdateStatefulSet { source: kube::Error, zone: String },

    #[snafu(display("failed to retrieve Cluster {CLUSTER_NAME:?}"))]
    GetCluster { source: kube::Error },

    #[snafu(display("failed to create Cluster {CLUSTER_NAME:?}"))]
    CreateCluster { source: kube::Error },

    #[snafu(display("failed to update Cluster {CLUSTER_NAME:?}"))]
    UpdateCluster { source: kube::Error },

    #[snafu(display("conflicting write to Cluster {CLUSTER_NAME:?}"))]
    ClusterConflict,

    #[snafu(display("failed to retrieve Service for zone {zone:?}"))]
    GetService { source: kube::Error, zone: String },

    #[snafu(display("failed to create Service for zone {zone:?}"))]
    CreateService { source: kube::Error, zone: String },

    #[snafu(display("failed to list pods of zone {zone:?}"))]
    ListPods { source: kube::Error, zone: String },

    #[snafu(display("failed to delete outdated pod {pod:?}"))]
    DeletePod { source: kube::Error, pod: String },

    #[snafu(display("failed to update status of zone {zone:?}"))]
    UpdateStatus { source: kube::Error, zone: String },

    #[snafu(display("failed to publish event for zone {zone:?}"))]
    PublishEvent { source: kube::Error, zone: String },
}

impl Error {
    pub fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

pub async fn reconcile_zone(zone: Arc<Zone>, ctx: Arc<Ctx>) -> Result<Action> {
    let name = zone.name_any();
    let namespace = zone.namespace().context(ObjectHasNoNamespaceSnafu)?;
    tracing::debug!(zone = %name, "reconciling");

    // Spec problems are user errors, not transient failures. Surface them as
    // events and wait for the next edit instead of hot-looping the requeue.
    if let Err(reason) = validate_spec(&zone) {
        publish_warning(&ctx, &zone, ERR_INVALID_SPEC, reason).await?;
        return Ok(Action::await_change());
    }

    let statefulsets: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &namespace);
    if let Some(observed) = statefulsets
        .get_opt(&name)
        .await
        .context(GetStatefulSetSnafu { zone: name.clone() })?
    {
        if !is_controlled_by(&observed.metadata, &zone) {
            let note = format!("StatefulSet {name:?} exists but is not managed by this zone");
            publish_warning(&ctx, &zone, ERR_RESOURCE_EXISTS, note).await?;
            return Ok(Action::await_change());
        }
        if let Err(reason) = validate_against_existing(&zone, &observed) {
            publish_warning(&ctx, &zone, ERR_IMMUTABLE_FIELD, reason).await?;
            return Ok(Action::await_change());
        }
    }

    let cluster = ensure_cluster_membership(&ctx.client, &zone, &namespace).await?;
    let members = resolve_members(&cluster, &zone, &ctx.zones, &namespace);

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    converge_workloads(&ctx, &statefulsets, &pods, &members, &name, &namespace).await?;

    if !ensure_service(&ctx.client, &zone, &namespace).await? {
        let note = format!("Service {name:?} exists but is not managed by this zone");
        publish_warning(&ctx, &zone, ERR_RESOURCE_EXISTS, note).await?;
        return Ok(Action::await_change());
    }

    update_status(&ctx.client, &zone, &namespace).await?;

    ctx.recorder
        .publish(
            &Event {
                type_: EventType::Normal,
                reason: "Synced".to_string(),
                note: Some(format!(
                    "Zone {name:?} synced as part of a {} zone cluster",
                    members.len()
                )),
                action: "Reconcile".to_string(),
                secondary: None,
            },
            &zone.object_ref(&()),
        )
        .await
        .context(PublishEventSnafu { zone: name })?;

    Ok(Action::await_change())
}

pub fn error_policy(zone: Arc<Zone>, error: &Error, _ctx: Arc<Ctx>) -> Action {
    tracing::warn!(
        zone = %zone.name_any(),
        category = error.category(),
        %error,
        "reconcile failed, requeueing"
    );
    Action::requeue(Duration::from_secs(5))
}

fn validate_spec(zone: &Zone) -> Result<(), String> {
    if zone.spec.image.trim().is_empty() {
        return Err("spec.image must not be empty".to_string());
    }
    if zone.spec.replicas < 1 {
        return Err(format!(
            "spec.replicas must be at least 1, got {}",
            zone.spec.replicas
        ));
    }
    if zone.spec.node_template.volumes.is_empty() {
        return Err("spec.nodeTemplate.volumes must declare at least one volume".to_string());
    }
    Ok(())
}

/// Rejects edits that the storage engine cannot absorb. Volume count decides
/// the on-disk erasure layout, and removing ordinals would orphan data.
fn validate_against_existing(zone: &Zone, observed: &StatefulSet) -> Result<(), String> {
    let declared = zone.spec.node_template.volumes.len();
    let provisioned = observed
        .spec
        .as_ref()
        .and_then(|spec| spec.volume_claim_templates.as_ref())
        .map_or(0, Vec::len);
    if declared != provisioned {
        return Err(format!(
            "spec.nodeTemplate.volumes is immutable once provisioned: {provisioned} volumes exist, {declared} declared"
        ));
    }
    if let Some(current) = observed.spec.as_ref().and_then(|spec| spec.replicas) {
        if zone.spec.replicas < current {
            return Err(format!(
                "spec.replicas cannot shrink below the provisioned count: {current} exist, {} declared",
                zone.spec.replicas
            ));
        }
    }
    Ok(())
}

/// Fetches or creates the per-namespace Cluster singleton and appends the
/// zone to its ordered list. Both writes go through optimistic concurrency;
/// losing the race surfaces as [`Error::ClusterConflict`] and the requeue
/// retries against the winner's revision.
async fn ensure_cluster_membership(
    client: &Client,
    zone: &Zone,
    namespace: &str,
) -> Result<Cluster> {
    let clusters: Api<Cluster> = Api::namespaced(client.clone(), namespace);
    let name = zone.name_any();
    match clusters.get_opt(CLUSTER_NAME).await.context(GetClusterSnafu)? {
        Some(mut cluster) => {
            if cluster.register_zone(&name) {
                tracing::info!(zone = %name, "joining existing cluster");
                cluster = clusters
                    .replace(CLUSTER_NAME, &PostParams::default(), &cluster)
                    .await
                    .map_err(|source| match source {
                        kube::Error::Api(ref response) if response.code == 409 => {
                            Error::ClusterConflict
                        }
                        source => Error::UpdateCluster { source },
                    })?;
            }
            Ok(cluster)
        }
        None => {
            let mut cluster = Cluster::new(CLUSTER_NAME, ClusterSpec::default());
            cluster.metadata.namespace = Some(namespace.to_string());
            cluster.metadata.owner_references =
                Some(vec![zone.controller_owner_ref(&()).context(NoOwnerRefSnafu)?]);
            cluster.register_zone(&name);
            tracing::info!(zone = %name, "creating cluster singleton");
            clusters
                .create(&PostParams::default(), &cluster)
                .await
                .map_err(|source| match source {
                    kube::Error::Api(ref response) if response.code == 409 => Error::ClusterConflict,
                    source => Error::CreateCluster { source },
                })
        }
    }
}

/// Resolves the Cluster's ordered zone names against the informer cache,
/// substituting the freshly observed object for the zone being reconciled.
/// Names without a live Zone are skipped, as are zones whose spec fails
/// validation: an unreconcilable spec must not leak a corrupt range like
/// `{0..-1}` into every member's command. Their workloads stay untouched
/// until the zone is fixed, reappears, or the Cluster is edited.
fn resolve_members(
    cluster: &Cluster,
    zone: &Arc<Zone>,
    store: &Store<Zone>,
    namespace: &str,
) -> Vec<Arc<Zone>> {
    let reconciled = zone.name_any();
    cluster
        .spec
        .zones
        .iter()
        .filter_map(|member| {
            let found = if *member == reconciled {
                Some(Arc::clone(zone))
            } else {
                store.get(&ObjectRef::new(member).within(namespace))
            };
            let Some(found) = found else {
                tracing::warn!(zone = %member, "zone listed in cluster but not observed, skipping");
                return None;
            };
            if let Err(reason) = validate_spec(&found) {
                tracing::warn!(zone = %member, %reason, "zone spec invalid, leaving its workload out of the cascade");
                return None;
            }
            Some(found)
        })
        .collect()
}

struct MemberState {
    zone: Arc<Zone>,
    observed: Option<StatefulSet>,
    /// Set when the zone's edit violates its provisioned workload; the
    /// workload is left untouched and its topology comes from what exists.
    rejected: bool,
}

/// Brings every member's StatefulSet up to the current topology, in Cluster
/// order. Member edits are validated against their provisioned workloads
/// first: a rejected edit (volume-count change, replica shrink) is parked by
/// that zone's own reconcile, and the cascade must not apply it by the back
/// door, so such a member contributes the topology of its existing
/// StatefulSet and is otherwise skipped. Only the reconciled zone's workload
/// is created here; a missing peer workload belongs to that peer's own
/// reconcile. Updates leave the immutable StatefulSet fields untouched and
/// recycle only pods whose args no longer match the derived command, so an
/// already converged namespace results in no writes at all.
async fn converge_workloads(
    ctx: &Ctx,
    statefulsets: &Api<StatefulSet>,
    pods: &Api<Pod>,
    members: &[Arc<Zone>],
    reconciled: &str,
    namespace: &str,
) -> Result<()> {
    let mut states = Vec::with_capacity(members.len());
    let mut topologies = Vec::with_capacity(members.len());
    for member in members {
        let member_name = member.name_any();
        let observed = statefulsets
            .get_opt(&member_name)
            .await
            .context(GetStatefulSetSnafu {
                zone: member_name.clone(),
            })?;
        let rejected = match &observed {
            Some(observed) => match validate_against_existing(member, observed) {
                Ok(()) => false,
                Err(reason) => {
                    tracing::warn!(
                        zone = %member_name,
                        %reason,
                        "zone edit rejected, keeping its provisioned topology"
                    );
                    topologies.push(provisioned_topology(&member_name, namespace, observed));
                    true
                }
            },
            None => false,
        };
        if !rejected {
            if let Some(topology) = ZoneTopology::from_zone(member) {
                topologies.push(topology);
            }
        }
        states.push(MemberState {
            zone: Arc::clone(member),
            observed,
            rejected,
        });
    }
    let plan = launch_plan(&topologies);

    for state in states {
        let member_name = state.zone.name_any();
        if state.rejected {
            continue;
        }
        let desired = desired_statefulset(&state.zone, &plan, ctx.probe_initial_delay_seconds)?;
        match state.observed {
            None if member_name == reconciled => {
                statefulsets
                    .create(&PostParams::default(), &desired)
                    .await
                    .context(CreateStatefulSetSnafu {
                        zone: member_name.clone(),
                    })?;
                tracing::info!(zone = %member_name, "created StatefulSet");
            }
            None => {
                tracing::debug!(zone = %member_name, "peer workload missing, left to its own reconcile");
            }
            Some(observed) => {
                if !is_controlled_by(&observed.metadata, &state.zone) {
                    tracing::warn!(zone = %member_name, "peer StatefulSet not managed by its zone, skipping");
                    continue;
                }
                if workload_outdated(&observed, &desired) {
                    let mut updated = observed;
                    if let (Some(updated_spec), Some(desired_spec)) =
                        (updated.spec.as_mut(), desired.spec.as_ref())
                    {
                        updated_spec.replicas = desired_spec.replicas;
                        updated_spec.template = desired_spec.template.clone();
                    }
                    statefulsets
                        .replace(&member_name, &PostParams::default(), &updated)
                        .await
                        .context(UpdateStatefulSetSnafu {
                            zone: member_name.clone(),
                        })?;
                    tracing::info!(zone = %member_name, "updated StatefulSet to current topology");
                }
                let recycled = recycle_stale_pods(pods, &member_name, &plan.command).await?;
                if !recycled.is_empty() {
                    tracing::info!(
                        zone = %member_name,
                        pods = recycled.len(),
                        "recycled pods running an outdated command"
                    );
                }
            }
        }
    }
    Ok(())
}

/// Topology of a workload as it actually exists, read back from the
/// StatefulSet instead of the zone's spec.
fn provisioned_topology(name: &str, namespace: &str, observed: &StatefulSet) -> ZoneTopology {
    let spec = observed.spec.as_ref();
    ZoneTopology {
        name: name.to_string(),
        namespace: namespace.to_string(),
        replicas: spec.and_then(|spec| spec.replicas).unwrap_or_default(),
        volumes: spec
            .and_then(|spec| spec.volume_claim_templates.as_ref())
            .map_or(0, Vec::len) as i32,
    }
}

/// The update strategy is OnDelete, so rewriting the pod template alone
/// changes nothing running. Deleting a stale pod hands it back to the
/// StatefulSet controller, which recreates it from the rewritten template
/// with the same ordinal and volumes.
async fn recycle_stale_pods(pods: &Api<Pod>, zone: &str, command: &str) -> Result<Vec<String>> {
    let params = ListParams::default().labels(&format!("{CONTROLLER_LABEL}={zone}"));
    let list = pods.list(&params).await.context(ListPodsSnafu {
        zone: zone.to_string(),
    })?;
    let mut recycled = Vec::new();
    for pod in list {
        if pod_runs_command(&pod, command) {
            continue;
        }
        let pod_name = pod.name_any();
        pods.delete(&pod_name, &DeleteParams::default())
            .await
            .context(DeletePodSnafu {
                pod: pod_name.clone(),
            })?;
        recycled.push(pod_name);
    }
    Ok(recycled)
}

/// `true` when the only service a foreign object check can trust passed:
/// create the headless Service if missing, otherwise require ownership.
async fn ensure_service(client: &Client, zone: &Zone, namespace: &str) -> Result<bool> {
    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    let name = zone.name_any();
    match services.get_opt(&name).await.context(GetServiceSnafu {
        zone: name.clone(),
    })? {
        Some(existing) => Ok(is_controlled_by(&existing.metadata, zone)),
        None => {
            let service = headless_service(zone)?;
            services
                .create(&PostParams::default(), &service)
                .await
                .context(CreateServiceSnafu { zone: name })?;
            Ok(true)
        }
    }
}

async fn update_status(client: &Client, zone: &Zone, namespace: &str) -> Result<()> {
    let name = zone.name_any();
    if zone
        .status
        .as_ref()
        .and_then(|status| status.stateful_set.as_deref())
        == Some(name.as_str())
    {
        return Ok(());
    }
    let zones: Api<Zone> = Api::namespaced(client.clone(), namespace);
    let status = Patch::Merge(serde_json::json!({
        "status": { "statefulSet": name.as_str() }
    }));
    zones
        .patch_status(&name, &PatchParams::default(), &status)
        .await
        .context(UpdateStatusSnafu { zone: name })?;
    Ok(())
}

async fn publish_warning(ctx: &Ctx, zone: &Zone, reason: &str, note: String) -> Result<()> {
    tracing::warn!(zone = %zone.name_any(), reason, note = %note, "rejecting zone");
    ctx.recorder
        .publish(
            &Event {
                type_: EventType::Warning,
                reason: reason.to_string(),
                note: Some(note),
                action: "Reconcile".to_string(),
                secondary: None,
            },
            &zone.object_ref(&()),
        )
        .await
        .context(PublishEventSnafu {
            zone: zone.name_any(),
        })
}

fn desired_statefulset(
    zone: &Zone,
    plan: &LaunchPlan,
    probe_initial_delay_seconds: i32,
) -> Result<StatefulSet> {
    let name = zone.name_any();
    let labels = zone_labels(&name);
    let volumes = &zone.spec.node_template.volumes;

    let env: Vec<EnvVar> = zone
        .spec
        .node_template
        .env
        .iter()
        .map(|var| EnvVar {
            name: var.name.clone(),
            value: var.value.clone(),
            ..Default::default()
        })
        .collect();
    let volume_mounts: Vec<VolumeMount> = volumes
        .iter()
        .enumerate()
        .map(|(ordinal, template)| VolumeMount {
            name: template.claim_name(ordinal),
            mount_path: template.mount_path(ordinal),
            ..Default::default()
        })
        .collect();
    let claims: Vec<PersistentVolumeClaim> = volumes
        .iter()
        .enumerate()
        .map(|(ordinal, template)| template.build_pvc(ordinal))
        .collect();

    let container = Container {
        name: APP_NAME.to_string(),
        image: Some(zone.spec.image.clone()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
        args: Some(vec![plan.command.clone()]),
        env: Some(env),
        ports: Some(vec![ContainerPort {
            name: Some(HTTP_PORT_NAME.to_string()),
            container_port: HTTP_PORT.into(),
            ..Default::default()
        }]),
        // The warmup loop blocks startup until peers resolve, so liveness
        // must not fire before a realistic cluster formation time.
        liveness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::String(HTTP_PORT_NAME.to_string()),
                host: None,
            }),
            initial_delay_seconds: Some(probe_initial_delay_seconds),
            period_seconds: Some(20),
            ..Default::default()
        }),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    };

    Ok(StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: zone.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![zone
                .controller_owner_ref(&())
                .context(NoOwnerRefSnafu)?]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            pod_management_policy: Some("Parallel".to_string()),
            replicas: Some(zone.spec.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            service_name: Some(name),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    dns_config: Some(PodDNSConfig {
                        searches: Some(plan.search_domains.clone()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
            },
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("OnDelete".to_string()),
                rolling_update: None,
            }),
            volume_claim_templates: Some(claims),
            ..Default::default()
        }),
        status: None,
    })
}

fn headless_service(zone: &Zone) -> Result<Service> {
    let name = zone.name_any();
    let labels = zone_labels(&name);
    Ok(Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: zone.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![zone
                .controller_owner_ref(&())
                .context(NoOwnerRefSnafu)?]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            // Peers must resolve each other during warmup, before any pod
            // can possibly report ready.
            publish_not_ready_addresses: Some(true),
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some(HTTP_PORT_NAME.to_string()),
                port: HTTP_PORT.into(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    })
}

fn zone_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), APP_NAME.to_string()),
        (CONTROLLER_LABEL.to_string(), name.to_string()),
    ])
}

fn is_controlled_by(metadata: &ObjectMeta, zone: &Zone) -> bool {
    let Some(uid) = &zone.metadata.uid else {
        return false;
    };
    metadata
        .owner_references
        .iter()
        .flatten()
        .any(|reference| reference.controller == Some(true) && reference.uid == *uid)
}

fn workload_outdated(observed: &StatefulSet, desired: &StatefulSet) -> bool {
    container_args(observed) != container_args(desired)
        || dns_searches(observed) != dns_searches(desired)
        || replicas(observed) != replicas(desired)
}

fn container_args(statefulset: &StatefulSet) -> Option<&[String]> {
    statefulset
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .args
        .as_deref()
}

fn dns_searches(statefulset: &StatefulSet) -> Option<&[String]> {
    statefulset
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .dns_config
        .as_ref()?
        .searches
        .as_deref()
}

fn replicas(statefulset: &StatefulSet) -> Option<i32> {
    statefulset.spec.as_ref()?.replicas
}

fn pod_runs_command(pod: &Pod, command: &str) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.containers.first())
        .and_then(|container| container.args.as_ref())
        .is_some_and(|args| args.len() == 1 && args[0] == command)
}
