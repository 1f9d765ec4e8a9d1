//! The submitted job definition.
//!
//! A `DagSpec` is the immutable document a client submits: the participating
//! parties, the named tasks with their component references, and the input/
//! output artifact channels. It is stored verbatim on every party and parsed
//! into a [`crate::graph::TaskGraph`] whenever a scheduling pass needs the
//! dependency structure.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One organizational participant, addressed by `(role, party_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartyAddr {
    pub role: String,
    pub party_id: String,
}

impl PartyAddr {
    pub fn new(role: impl Into<String>, party_id: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            party_id: party_id.into(),
        }
    }
}

impl std::fmt::Display for PartyAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.role, self.party_id)
    }
}

/// Declares the parties filling one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyDecl {
    pub role: String,
    pub party_ids: Vec<String>,
}

impl PartyDecl {
    pub fn addrs(&self) -> impl Iterator<Item = PartyAddr> + '_ {
        self.party_ids
            .iter()
            .map(|id| PartyAddr::new(self.role.clone(), id.clone()))
    }
}

/// How task statuses reach the scheduler: active polling or pushed
/// callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    #[default]
    Poll,
    Callback,
}

impl SyncKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncKind::Poll => "poll",
            SyncKind::Callback => "callback",
        }
    }
}

impl std::str::FromStr for SyncKind {
    type Err = crate::status::UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "poll" => Ok(SyncKind::Poll),
            "callback" => Ok(SyncKind::Callback),
            other => Err(crate::status::UnknownStatus(other.to_string())),
        }
    }
}

/// An input artifact channel.
///
/// Only `TaskOutput` creates a dependency edge; warehouse channels reference
/// pre-existing data or models and carry no scheduling dependency, but do
/// inherit job-level default identifiers when left unspecified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelSpec {
    TaskOutput {
        producer_task: String,
        output_key: String,
        /// Restrict the channel to a subset of roles. Unset means every
        /// role the consumer runs on.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        roles: Option<Vec<String>>,
    },
    DataWarehouse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        namespace: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dataset_id: Option<String>,
    },
    ModelWarehouse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_version: Option<i64>,
    },
}

impl ChannelSpec {
    pub fn is_task_output(&self) -> bool {
        matches!(self, ChannelSpec::TaskOutput { .. })
    }
}

/// A declared output artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Artifact type hint ("data", "model", "metric").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
}

/// One named task in the DAG.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Name of the component the task runs; must resolve against the
    /// component registry.
    pub component_ref: String,
    /// Override of the job-level party declarations for this task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parties: Option<Vec<PartyDecl>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Task-level common parameters, merged below role/party overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conf: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, ChannelSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, OutputSpec>,
}

/// Three-layer runtime parameters: common, overridden per role, overridden
/// per specific party, in that priority order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayeredParams {
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub common: Map<String, Value>,
    /// role -> overrides applied to every party of that role.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub role: BTreeMap<String, Map<String, Value>>,
    /// role -> party_id -> overrides for one specific party.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub party: BTreeMap<String, BTreeMap<String, Map<String, Value>>>,
}

impl LayeredParams {
    /// Merge the layers for one `(role, party_id)`; later layers win.
    pub fn resolve(&self, addr: &PartyAddr) -> Map<String, Value> {
        let mut merged = self.common.clone();
        if let Some(overrides) = self.role.get(&addr.role) {
            merge_into(&mut merged, overrides);
        }
        if let Some(parties) = self.party.get(&addr.role) {
            if let Some(overrides) = parties.get(&addr.party_id) {
                merge_into(&mut merged, overrides);
            }
        }
        merged
    }
}

/// Merge `overrides` into `base`, recursing into objects so a party-level
/// override of one nested key keeps the other keys of the layer below.
pub fn merge_into(base: &mut Map<String, Value>, overrides: &Map<String, Value>) {
    for (key, value) in overrides {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_into(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Job-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConf {
    #[serde(default)]
    pub priority: i32,
    /// Automatic rerun budget per task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_retries: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_retry_delay_ms: Option<i64>,
    #[serde(default)]
    pub sync_type: SyncKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<i64>,
    /// Concurrent task slots the job's resource quota is sized for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_parallelism: Option<i64>,
    /// Cores requested per task slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_cores: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_memory: Option<i64>,
    /// Default identifiers inherited by unset model-warehouse channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<i64>,
    /// Job-level defaults merged beneath every task's own `conf`.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub task_conf: Map<String, Value>,
    #[serde(default)]
    pub params: LayeredParams,
}

/// The immutable job definition a client submits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DagSpec {
    pub parties: Vec<PartyDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub tasks: BTreeMap<String, TaskSpec>,
    #[serde(default)]
    pub conf: JobConf,
}

impl DagSpec {
    /// Every declared `(role, party_id)` pair, in declaration order.
    pub fn all_parties(&self) -> Vec<PartyAddr> {
        self.parties.iter().flat_map(|decl| decl.addrs()).collect()
    }

    pub fn party_ids_for_role(&self, role: &str) -> Option<&[String]> {
        self.parties
            .iter()
            .find(|decl| decl.role == role)
            .map(|decl| decl.party_ids.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn layered_params_priority_order() {
        let params = LayeredParams {
            common: obj(json!({"lr": 0.1, "epochs": 10, "opt": {"kind": "sgd", "momentum": 0.9}})),
            role: [(
                "guest".to_string(),
                obj(json!({"lr": 0.05, "opt": {"kind": "adam"}})),
            )]
            .into_iter()
            .collect(),
            party: [(
                "guest".to_string(),
                [("9999".to_string(), obj(json!({"lr": 0.01})))]
                    .into_iter()
                    .collect(),
            )]
            .into_iter()
            .collect(),
        };

        let merged = params.resolve(&PartyAddr::new("guest", "9999"));
        assert_eq!(merged["lr"], json!(0.01));
        assert_eq!(merged["epochs"], json!(10));
        // Role layer replaced the kind but kept the common layer's nested
        // sibling.
        assert_eq!(merged["opt"], json!({"kind": "adam", "momentum": 0.9}));

        let other = params.resolve(&PartyAddr::new("guest", "10000"));
        assert_eq!(other["lr"], json!(0.05));

        let host = params.resolve(&PartyAddr::new("host", "9999"));
        assert_eq!(host["lr"], json!(0.1));
    }

    #[test]
    fn channel_spec_round_trips_through_json() {
        let channel = ChannelSpec::TaskOutput {
            producer_task: "reader".into(),
            output_key: "train_data".into(),
            roles: None,
        };
        let encoded = serde_json::to_value(&channel).unwrap();
        assert_eq!(
            encoded,
            json!({"task_output": {"producer_task": "reader", "output_key": "train_data"}})
        );
        let decoded: ChannelSpec = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, channel);
    }

    #[test]
    fn dag_spec_lists_all_parties() {
        let spec = DagSpec {
            parties: vec![
                PartyDecl {
                    role: "guest".into(),
                    party_ids: vec!["9999".into()],
                },
                PartyDecl {
                    role: "host".into(),
                    party_ids: vec!["10000".into(), "10001".into()],
                },
            ],
            ..Default::default()
        };
        let addrs = spec.all_parties();
        assert_eq!(addrs.len(), 3);
        assert_eq!(addrs[0], PartyAddr::new("guest", "9999"));
        assert_eq!(addrs[2], PartyAddr::new("host", "10001"));
    }
}
