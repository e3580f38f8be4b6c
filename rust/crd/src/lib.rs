//! Custom resource definitions for the mkube zone operator.
//!
//! A [`Zone`] declares one ordered group of storage pods with attached
//! persistent volumes. The [`Cluster`] singleton records the authoritative
//! order in which zones joined; that order defines every peer's position in
//! the generated storage-server launch command and must never be rewritten.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements},
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::ObjectMeta},
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "mkube";

/// Fixed name of the per-namespace [`Cluster`] singleton.
pub const CLUSTER_NAME: &str = "mkube";

pub const APP_LABEL: &str = "app";
/// Label carrying the owning zone's name on every managed pod.
pub const CONTROLLER_LABEL: &str = "controller";

pub const HTTP_PORT_NAME: &str = "http";
pub const HTTP_PORT: u16 = 9000;

/// A user-declared unit of storage capacity: `replicas` pods, each carrying
/// one disk per entry in `nodeTemplate.volumes`.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "mkube.min.io",
    version = "v1",
    kind = "Zone",
    plural = "zones",
    status = "ZoneStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ZoneSpec {
    /// Container image for the storage engine
    pub image: String,
    /// Number of storage pods in this zone
    pub replicas: i32,
    /// Per-pod template: persistent volumes and environment
    #[serde(default)]
    #[schemars(schema_with = "node_template_schema")]
    pub node_template: NodeTemplate,
}

/// Unknown fields under `nodeTemplate` are preserved by the API server so
/// user manifests survive round-trips through older controller versions.
fn node_template_schema(generator: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    let mut schema: schemars::schema::SchemaObject =
        <NodeTemplate as JsonSchema>::json_schema(generator).into();
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_owned(),
        serde_json::Value::Bool(true),
    );
    schema.into()
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeTemplate {
    /// Ordered persistent-volume templates; each becomes a disk inside every
    /// pod of the zone. The length of this list is fixed once the zone's
    /// workload exists.
    pub volumes: Vec<VolumeTemplate>,
    /// Environment to inject into each storage container
    pub env: Vec<EnvVarTemplate>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarTemplate {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Template for one persistent-volume claim stamped into every pod.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeTemplate {
    /// Claim name; defaults to `data<N>` for the N-th volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Requested capacity, e.g. `10Gi`
    #[serde(default = "VolumeTemplate::default_capacity")]
    pub capacity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

impl VolumeTemplate {
    fn default_capacity() -> String {
        "1Gi".to_string()
    }

    pub fn claim_name(&self, ordinal: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("data{}", ordinal + 1))
    }

    /// Where the claim is mounted inside the storage container. The launch
    /// command's `/data{1..V}` expansion relies on this numbering.
    pub fn mount_path(&self, ordinal: usize) -> String {
        format!("/data{}", ordinal + 1)
    }

    pub fn build_pvc(&self, ordinal: usize) -> PersistentVolumeClaim {
        let mut requests = BTreeMap::new();
        requests.insert("storage".to_string(), Quantity(self.capacity.clone()));
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(self.claim_name(ordinal)),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: self.storage_class_name.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneStatus {
    /// Name of the managed StatefulSet once the zone is provisioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stateful_set: Option<String>,
}

/// Per-namespace singleton listing all zones in join order.
///
/// Created by the first zone's reconcile and appended to by each later one,
/// carrying an owner reference to the zone whose reconcile created it.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "mkube.min.io",
    version = "v1",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Ordered zone names; a zone's position here is its position in every
    /// generated peer list
    #[serde(default)]
    pub zones: Vec<String>,
}

// Reserved.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {}

impl Cluster {
    /// Records a zone in the ordered list, returning `true` when the list
    /// changed. Registration is idempotent: re-reconciling a zone whose
    /// workload was deleted by hand must not append a duplicate.
    pub fn register_zone(&mut self, name: &str) -> bool {
        if self.spec.zones.iter().any(|zone| zone == name) {
            return false;
        }
        self.spec.zones.push(name.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const ZONE_MANIFEST: &str = r#"
apiVersion: mkube.min.io/v1
kind: Zone
metadata:
  name: z1
  namespace: default
spec:
  image: minio/minio:RELEASE.2020-01-03T19-12-21Z
  replicas: 2
  nodeTemplate:
    volumes:
      - capacity: 10Gi
      - capacity: 10Gi
        storageClassName: ssd
    env:
      - name: MINIO_ACCESS_KEY
        value: mkube
    unknownKnob: true
"#;

    #[test]
    fn zone_manifest_round_trip() {
        let zone: Zone = serde_yaml::from_str(ZONE_MANIFEST).expect("manifest must parse");
        assert_eq!(zone.spec.replicas, 2);
        assert_eq!(zone.spec.node_template.volumes.len(), 2);
        assert_eq!(
            zone.spec.node_template.volumes[1].storage_class_name.as_deref(),
            Some("ssd")
        );
        assert_eq!(zone.spec.node_template.env[0].name, "MINIO_ACCESS_KEY");
    }

    #[test]
    fn node_template_defaults_to_empty() {
        let zone: Zone = serde_yaml::from_str(
            r#"
apiVersion: mkube.min.io/v1
kind: Zone
metadata:
  name: z1
spec:
  image: minio/minio:latest
  replicas: 1
"#,
        )
        .expect("manifest must parse");
        assert!(zone.spec.node_template.volumes.is_empty());
        assert!(zone.spec.node_template.env.is_empty());
    }

    #[rstest]
    #[case(None, 0, "data1")]
    #[case(None, 3, "data4")]
    #[case(Some("scratch"), 1, "scratch")]
    fn claim_names(#[case] name: Option<&str>, #[case] ordinal: usize, #[case] expected: &str) {
        let template = VolumeTemplate {
            name: name.map(str::to_string),
            capacity: "1Gi".to_string(),
            storage_class_name: None,
        };
        assert_eq!(template.claim_name(ordinal), expected);
        assert_eq!(template.mount_path(ordinal), format!("/data{}", ordinal + 1));
    }

    #[test]
    fn pvc_requests_declared_capacity() {
        let template = VolumeTemplate {
            name: None,
            capacity: "10Gi".to_string(),
            storage_class_name: Some("ssd".to_string()),
        };
        let pvc = template.build_pvc(0);
        assert_eq!(pvc.metadata.name.as_deref(), Some("data1"));
        let spec = pvc.spec.expect("pvc must have a spec");
        assert_eq!(spec.storage_class_name.as_deref(), Some("ssd"));
        let requests = spec
            .resources
            .and_then(|resources| resources.requests)
            .expect("pvc must request storage");
        assert_eq!(requests["storage"], Quantity("10Gi".to_string()));
    }

    #[test]
    fn register_zone_appends_once() {
        let mut cluster = Cluster::new(CLUSTER_NAME, ClusterSpec::default());
        assert!(cluster.register_zone("z1"));
        assert!(cluster.register_zone("z2"));
        assert!(!cluster.register_zone("z1"));
        assert_eq!(cluster.spec.zones, vec!["z1", "z2"]);
    }

    #[test]
    fn register_zone_preserves_order() {
        let mut cluster = Cluster::new(CLUSTER_NAME, ClusterSpec::default());
        for zone in ["z3", "z1", "z2"] {
            cluster.register_zone(zone);
        }
        // Join order, not lexical order, is authoritative.
        assert_eq!(cluster.spec.zones, vec!["z3", "z1", "z2"]);
    }
}
