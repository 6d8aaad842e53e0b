//! Data structures used throughout the generator daemon.
//!
//! A [`ContainerRecord`] is the normalised, hashable view of one running
//! container as kept in the snapshot store.  Field names serialise in
//! camelCase because templates and store queries address them by path
//! (`env.VIRTUAL_HOST`, `network.address`, `daemonId`).

use std::collections::BTreeMap;
use std::sync::Arc;

use bollard::models::ContainerInspectResponse;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;

/// Length of the stable short id derived from the daemon identifier.
pub const SHORT_ID_LEN: usize = 24;

/// Event statuses that trigger a reconciliation pass.
pub const RELEVANT_STATUSES: [&str; 3] = ["start", "stop", "destroy"];

/// Synthetic status reported by the first pass of the process lifetime.
pub const INITIALIZED_STATUS: &str = "initialized";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub address: String,
    /// Exposed container ports without protocol suffix, UDP-only bindings excluded.
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecord {
    pub id: String,
    pub daemon_id: String,
    pub network: Option<NetworkInfo>,
    pub name: String,
    pub env: BTreeMap<String, String>,
    pub content_hash: String,
}

#[derive(Serialize)]
struct HashedFields<'a> {
    network: &'a Option<NetworkInfo>,
    name: &'a str,
    env: &'a BTreeMap<String, String>,
}

impl ContainerRecord {
    /// Builds a record and computes its content hash.
    pub fn new(
        daemon_id: impl Into<String>,
        name: impl Into<String>,
        network: Option<NetworkInfo>,
        env: BTreeMap<String, String>,
    ) -> Self {
        let daemon_id = daemon_id.into();
        let mut record = Self {
            id: short_id(&daemon_id),
            daemon_id,
            network,
            name: name.into(),
            env,
            content_hash: String::new(),
        };
        record.content_hash = record.compute_hash();
        record
    }

    /// Normalises the daemon's inspect document into a record.
    pub fn compose(detail: &ContainerInspectResponse) -> Self {
        let daemon_id = detail.id.clone().unwrap_or_default();
        let name = detail.name.clone().unwrap_or_default();

        let env = detail
            .config
            .as_ref()
            .and_then(|c| c.env.as_ref())
            .map(|entries| parse_env(entries.as_slice()))
            .unwrap_or_default();

        Self::new(daemon_id, name, network_info(detail), env)
    }

    /// Digest over the observable fields. Used for change detection only.
    pub fn compute_hash(&self) -> String {
        let fields = HashedFields {
            network: &self.network,
            name: &self.name,
            env: &self.env,
        };
        // Serialising plain strings and sorted maps cannot fail.
        let bytes = serde_json::to_vec(&fields).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

pub fn short_id(daemon_id: &str) -> String {
    daemon_id.chars().take(SHORT_ID_LEN).collect()
}

/// Parses `KEY=VALUE` entries. The value keeps any further `=` characters.
pub fn parse_env<S: AsRef<str>>(entries: &[S]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|entry| match entry.as_ref().split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (entry.as_ref().to_string(), String::new()),
        })
        .collect()
}

fn network_info(detail: &ContainerInspectResponse) -> Option<NetworkInfo> {
    let settings = detail.network_settings.as_ref()?;

    // Networks are visited in name order so "first" is stable across passes.
    let networks: BTreeMap<_, _> = settings.networks.as_ref()?.iter().collect();
    let address = networks
        .values()
        .filter_map(|net| net.ip_address.as_deref())
        .find(|ip| !ip.is_empty())?
        .to_string();

    let mut ports: Vec<String> = settings
        .ports
        .as_ref()
        .map(|map| {
            map.keys()
                .filter(|port| !port.contains("udp"))
                .map(|port| port.split('/').next().unwrap_or_default().to_string())
                .collect()
        })
        .unwrap_or_default();
    ports.sort();
    ports.dedup();

    Some(NetworkInfo { address, ports })
}

/// A lifecycle event received from the daemon event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonEvent {
    pub daemon_id: String,
    pub status: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub actor_name: Option<String>,
}

impl DaemonEvent {
    /// Only container start/stop/destroy events are acted upon.
    pub fn is_relevant(&self) -> bool {
        self.kind == "container" && RELEVANT_STATUSES.contains(&self.status.as_str())
    }
}

/// Emitted by the registry after a pass that changed something, and after
/// the very first pass regardless of changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub trigger: Option<DaemonEvent>,
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    pub is_initialization: bool,
}

impl ChangeEvent {
    /// Status as seen by consumers: the synthetic `initialized` on the first
    /// pass, otherwise the triggering event's status.
    pub fn status(&self) -> Option<&str> {
        if self.is_initialization {
            Some(INITIALIZED_STATUS)
        } else {
            self.trigger.as_ref().map(|e| e.status.as_str())
        }
    }

    pub fn daemon_id(&self) -> Option<&str> {
        self.trigger
            .as_ref()
            .map(|e| e.daemon_id.as_str())
            .filter(|id| !id.is_empty())
    }
}

/// Notifications published by the container registry.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Change(ChangeEvent),
    Error(Arc<Error>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerConfig, EndpointSettings, NetworkSettings};
    use std::collections::HashMap;

    fn detail(ports: &[&str], networks: &[(&str, &str)]) -> ContainerInspectResponse {
        ContainerInspectResponse {
            id: Some("0123456789abcdef0123456789abcdef".into()),
            name: Some("/web".into()),
            config: Some(ContainerConfig {
                env: Some(vec!["VIRTUAL_HOST=example.org".into(), "OPTS=a=b".into()]),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                ports: Some(ports.iter().map(|p| (p.to_string(), None)).collect()),
                networks: Some(
                    networks
                        .iter()
                        .map(|(name, ip)| {
                            (
                                name.to_string(),
                                EndpointSettings {
                                    ip_address: Some(ip.to_string()),
                                    ..Default::default()
                                },
                            )
                        })
                        .collect::<HashMap<_, _>>(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn compose_normalises_inspect_document() {
        let record = ContainerRecord::compose(&detail(
            &["443/tcp", "80/tcp", "53/udp"],
            &[("bridge", "172.17.0.2")],
        ));

        assert_eq!(record.id, "0123456789abcdef01234567");
        assert_eq!(record.daemon_id, "0123456789abcdef0123456789abcdef");
        assert_eq!(record.name, "/web");
        assert_eq!(record.env["VIRTUAL_HOST"], "example.org");
        assert_eq!(record.env["OPTS"], "a=b");
        let network = record.network.unwrap();
        assert_eq!(network.address, "172.17.0.2");
        assert_eq!(network.ports, vec!["443", "80"]);
    }

    #[test]
    fn udp_only_container_has_empty_ports() {
        let record = ContainerRecord::compose(&detail(&["53/udp"], &[("bridge", "10.0.0.3")]));
        assert_eq!(record.network.unwrap().ports, Vec::<String>::new());
    }

    #[test]
    fn container_without_address_has_no_network() {
        let record = ContainerRecord::compose(&detail(&["80/tcp"], &[("none", "")]));
        assert!(record.network.is_none());
    }

    #[test]
    fn hash_ignores_insertion_order() {
        let first = detail(&["80/tcp", "443/tcp"], &[("a", "10.0.0.1"), ("b", "10.0.0.2")]);
        let second = detail(&["443/tcp", "80/tcp"], &[("b", "10.0.0.2"), ("a", "10.0.0.1")]);

        let a = ContainerRecord::compose(&first);
        let b = ContainerRecord::compose(&second);
        assert_eq!(a.content_hash, b.content_hash);

        let env_a = parse_env(&["A=1", "B=2"]);
        let env_b = parse_env(&["B=2", "A=1"]);
        let x = ContainerRecord::new("x".repeat(64), "/n", None, env_a);
        let y = ContainerRecord::new("y".repeat(64), "/n", None, env_b);
        assert_eq!(x.content_hash, y.content_hash);
    }

    #[test]
    fn hash_changes_with_any_observable_field() {
        let base = ContainerRecord::new("c".repeat(64), "/app", None, parse_env(&["A=1"]));
        let renamed = ContainerRecord::new("c".repeat(64), "/app2", None, parse_env(&["A=1"]));
        let env = ContainerRecord::new("c".repeat(64), "/app", None, parse_env(&["A=2"]));
        let net = ContainerRecord::new(
            "c".repeat(64),
            "/app",
            Some(NetworkInfo {
                address: "10.0.0.1".into(),
                ports: vec![],
            }),
            parse_env(&["A=1"]),
        );

        assert_ne!(base.content_hash, renamed.content_hash);
        assert_ne!(base.content_hash, env.content_hash);
        assert_ne!(base.content_hash, net.content_hash);
    }

    #[test]
    fn change_event_status_reports_initialization() {
        let event = ChangeEvent {
            trigger: Some(DaemonEvent {
                daemon_id: "abc".into(),
                status: "start".into(),
                kind: "container".into(),
                actor_name: None,
            }),
            created: 1,
            updated: 0,
            removed: 0,
            is_initialization: true,
        };
        assert_eq!(event.status(), Some(INITIALIZED_STATUS));
        assert_eq!(event.daemon_id(), Some("abc"));
    }
}
