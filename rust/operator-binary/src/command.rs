//! Launch-command generation.
//!
//! Turns the Cluster's ordered zone list into the storage server's peer URL
//! patterns, the pod DNS search domains, and the shell wrapper every pod
//! boots with. The builder is a pure function: for a given topology the
//! output is byte-identical on every invocation, which is what makes
//! "all workloads run the same command" checkable without running pods.

use kube::ResourceExt;
use mkube_crd::Zone;

/// One zone's contribution to the cluster topology.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoneTopology {
    pub name: String,
    pub namespace: String,
    pub replicas: i32,
    pub volumes: i32,
}

impl ZoneTopology {
    /// `None` when the zone carries no namespace, which cannot happen for
    /// objects observed through a namespaced watch.
    pub fn from_zone(zone: &Zone) -> Option<Self> {
        Some(Self {
            name: zone.name_any(),
            namespace: zone.namespace()?,
            replicas: zone.spec.replicas,
            volumes: zone.spec.node_template.volumes.len() as i32,
        })
    }

    /// Compact peer URL pattern handed to the storage engine, e.g.
    /// `http://z1-{0..1}.z1.default.svc.cluster.local/data{1..2}`.
    fn pattern(&self) -> String {
        format!(
            "http://{name}-{{0..{last}}}.{name}.{namespace}.svc.cluster.local/data{{1..{volumes}}}",
            name = self.name,
            last = self.replicas - 1,
            namespace = self.namespace,
            volumes = self.volumes,
        )
    }

    fn search_domain(&self) -> String {
        format!("{}.{}.svc.cluster.local", self.name, self.namespace)
    }

    /// Every hostname reachable from [`ZoneTopology::pattern`], expanding
    /// both the ordinal and the volume range: R·V probes per zone.
    fn warmup_hosts(&self) -> impl Iterator<Item = String> + '_ {
        (0..self.replicas).flat_map(move |ordinal| {
            (0..self.volumes).map(move |_| {
                format!(
                    "{name}-{ordinal}.{name}.{namespace}.svc.cluster.local",
                    name = self.name,
                    namespace = self.namespace,
                )
            })
        })
    }
}

/// Everything derived from one Cluster revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchPlan {
    /// Per-zone peer URL patterns, in Cluster order
    pub patterns: Vec<String>,
    /// Per-zone DNS search domains, in Cluster order
    pub search_domains: Vec<String>,
    /// Fully expanded hostnames probed by the readiness gate
    pub warmup_hosts: Vec<String>,
    /// The complete `sh -c` line every pod runs
    pub command: String,
}

pub fn launch_plan(zones: &[ZoneTopology]) -> LaunchPlan {
    let patterns: Vec<String> = zones.iter().map(ZoneTopology::pattern).collect();
    let search_domains: Vec<String> = zones.iter().map(ZoneTopology::search_domain).collect();
    let warmup_hosts: Vec<String> = zones
        .iter()
        .flat_map(ZoneTopology::warmup_hosts)
        .collect();

    // The warmup block runs twice before the exec. Pods have always shipped
    // with the doubled loop and peers key on byte-identical args, so it
    // stays until a coordinated cluster-wide roll changes it.
    let warmup = warmup_block(&warmup_hosts);
    let command = format!(
        "echo \"warmup\"; {warmup}; {warmup}; /usr/bin/docker-entrypoint.sh minio server {patterns}",
        patterns = patterns.join(" "),
    );

    LaunchPlan {
        patterns,
        search_domains,
        warmup_hosts,
        command,
    }
}

/// The readiness gate: block until every peer hostname answers a ping, so a
/// freshly scheduled pod cannot race the erasure-coding quorum handshake
/// against DNS propagation for zones that are still coming up.
fn warmup_block(hosts: &[String]) -> String {
    format!(
        "for i in {} ; do while true; do ping -c 1 $i 2>/dev/null && break || sleep 0.5; done; echo \"$i reachable\"; done",
        hosts.join(" "),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use rstest::rstest;

    use super::*;

    fn zone(name: &str, replicas: i32, volumes: i32) -> ZoneTopology {
        ZoneTopology {
            name: name.to_string(),
            namespace: "default".to_string(),
            replicas,
            volumes,
        }
    }

    #[test]
    fn single_zone_boundary() {
        let plan = launch_plan(&[ZoneTopology {
            name: "z".to_string(),
            namespace: "ns".to_string(),
            replicas: 1,
            volumes: 1,
        }]);
        assert_eq!(
            plan.patterns,
            vec!["http://z-{0..0}.z.ns.svc.cluster.local/data{1..1}"]
        );
        assert_eq!(plan.search_domains, vec!["z.ns.svc.cluster.local"]);
        assert_eq!(plan.warmup_hosts, vec!["z-0.z.ns.svc.cluster.local"]);
    }

    #[rstest]
    #[case(1, 1, "{0..0}", "{1..1}")]
    #[case(2, 2, "{0..1}", "{1..2}")]
    #[case(4, 8, "{0..3}", "{1..8}")]
    fn pattern_ranges(
        #[case] replicas: i32,
        #[case] volumes: i32,
        #[case] ordinals: &str,
        #[case] data: &str,
    ) {
        let plan = launch_plan(&[zone("z1", replicas, volumes)]);
        assert_eq!(
            plan.patterns[0],
            format!("http://z1-{ordinals}.z1.default.svc.cluster.local/data{data}")
        );
    }

    #[test]
    fn patterns_keep_cluster_order() {
        let plan = launch_plan(&[zone("z2", 2, 2), zone("z1", 2, 2)]);
        assert_eq!(
            plan.patterns,
            vec![
                "http://z2-{0..1}.z2.default.svc.cluster.local/data{1..2}",
                "http://z1-{0..1}.z1.default.svc.cluster.local/data{1..2}",
            ]
        );
        assert_eq!(
            plan.search_domains,
            vec![
                "z2.default.svc.cluster.local",
                "z1.default.svc.cluster.local",
            ]
        );
    }

    #[test]
    fn warmup_expands_both_ranges() {
        let plan = launch_plan(&[zone("z1", 3, 2), zone("z2", 2, 2)]);
        // R·V probes per zone.
        assert_eq!(plan.warmup_hosts.len(), 3 * 2 + 2 * 2);
        let unique: BTreeSet<_> = plan.warmup_hosts.iter().collect();
        assert_eq!(unique.len(), 3 + 2);
        assert!(unique.contains(&"z1-2.z1.default.svc.cluster.local".to_string()));
        assert!(unique.contains(&"z2-1.z2.default.svc.cluster.local".to_string()));
    }

    #[test]
    fn command_is_deterministic() {
        let zones = [zone("z1", 2, 2), zone("z2", 4, 1)];
        assert_eq!(launch_plan(&zones), launch_plan(&zones));
        assert_eq!(launch_plan(&zones).command, launch_plan(&zones).command);
    }

    #[test]
    fn command_runs_warmup_twice() {
        let plan = launch_plan(&[zone("z1", 2, 2)]);
        let block = warmup_block(&plan.warmup_hosts);
        assert_eq!(plan.command.matches(&block).count(), 2);
    }

    #[test]
    fn first_zone_command_is_bit_exact() {
        let plan = launch_plan(&[zone("z1", 2, 2)]);
        let host_0 = "z1-0.z1.default.svc.cluster.local";
        let host_1 = "z1-1.z1.default.svc.cluster.local";
        let warmup = format!(
            "for i in {host_0} {host_0} {host_1} {host_1} ; do while true; do \
             ping -c 1 $i 2>/dev/null && break || sleep 0.5; done; echo \"$i reachable\"; done"
        );
        assert_eq!(
            plan.command,
            format!(
                "echo \"warmup\"; {warmup}; {warmup}; /usr/bin/docker-entrypoint.sh minio server \
                 http://z1-{{0..1}}.z1.default.svc.cluster.local/data{{1..2}}"
            )
        );
    }
}
