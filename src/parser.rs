//! DAG parser: turns a submitted [`DagSpec`] into a [`TaskGraph`].
//!
//! Parsing determines, for every task, the `(role, party_id)` pairs it
//! applies to; merges the three runtime-parameter layers per pair; resolves
//! input channels (adding dependency edges for intra-job channels and
//! filling job-level defaults into warehouse channels); and rejects
//! structurally broken definitions before any job state exists.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde_json::Map;

use crate::components::ComponentRegistry;
use crate::dag::{merge_into, ChannelSpec, DagSpec, PartyAddr, TaskSpec};
use crate::graph::{GraphError, PartyView, ResolvedChannel, TaskGraph, TaskNode};

pub const DEFAULT_STAGE: &str = "default";

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("job declares no parties")]
    NoParties,
    #[error("role {0:?} is declared more than once")]
    DuplicateRole(String),
    #[error("role {0:?} declares no party ids")]
    EmptyRole(String),
    #[error("task {task:?}: component {component:?} has no registered capability descriptor")]
    UnknownComponent { task: String, component: String },
    #[error("task {task:?} names party {party} which the job does not declare")]
    UndeclaredParty { task: String, party: PartyAddr },
    #[error("task {task:?} is applicable to no declared party")]
    NoApplicableParty { task: String },
    #[error("task {task:?} input {input:?}: producer task {producer:?} is not part of the job")]
    UnknownProducer {
        task: String,
        input: String,
        producer: String,
    },
    #[error("task {task:?} input {input:?}: producer {producer:?} declares no output {output:?}")]
    UnknownProducerOutput {
        task: String,
        input: String,
        producer: String,
        output: String,
    },
    #[error("task {task:?} input {input:?} is not declared by component {component:?}")]
    UndeclaredInput {
        task: String,
        input: String,
        component: String,
    },
    #[error("task {task:?} input {input:?}: data-warehouse reference is empty")]
    EmptyDataReference { task: String, input: String },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Stateless parser over a component registry.
pub struct DagParser<'a> {
    registry: &'a ComponentRegistry,
}

impl<'a> DagParser<'a> {
    pub fn new(registry: &'a ComponentRegistry) -> Self {
        Self { registry }
    }

    /// Parse and validate a job definition.
    ///
    /// `job_id` is only used to derive the job's own default model
    /// identifier for unset model-warehouse channels.
    pub fn parse(&self, job_id: &str, spec: &DagSpec) -> Result<TaskGraph, ParseError> {
        let declared = self.validate_parties(spec)?;

        // Resolve applicability and channels once per task.
        let mut runtime_parties: BTreeMap<String, Vec<PartyAddr>> = BTreeMap::new();
        let mut resolved_inputs: BTreeMap<String, BTreeMap<String, ResolvedChannel>> =
            BTreeMap::new();
        let mut role_filters: BTreeMap<String, BTreeMap<String, Vec<String>>> = BTreeMap::new();
        let mut global_edges: BTreeSet<(String, String)> = BTreeSet::new();

        for (name, task) in &spec.tasks {
            let meta = self.registry.meta(&task.component_ref).ok_or_else(|| {
                ParseError::UnknownComponent {
                    task: name.clone(),
                    component: task.component_ref.clone(),
                }
            })?;

            let parties = applicable_parties(name, task, spec, &declared, |role| {
                meta.supports_role(role)
            })?;
            runtime_parties.insert(name.clone(), parties);

            let mut inputs = BTreeMap::new();
            let mut filters = BTreeMap::new();
            for (input_name, channel) in &task.inputs {
                if !meta.input_artifacts.is_empty()
                    && !meta.input_artifacts.iter().any(|a| a == input_name)
                {
                    return Err(ParseError::UndeclaredInput {
                        task: name.clone(),
                        input: input_name.clone(),
                        component: task.component_ref.clone(),
                    });
                }
                let resolved =
                    self.resolve_channel(job_id, spec, name, input_name, channel)?;
                if let ChannelSpec::TaskOutput {
                    producer_task,
                    roles: Some(roles),
                    ..
                } = channel
                {
                    filters.insert(input_name.clone(), roles.clone());
                    global_edges.insert((producer_task.clone(), name.clone()));
                } else if let Some(producer) = resolved.producer() {
                    global_edges.insert((producer.to_string(), name.clone()));
                }
                inputs.insert(input_name.clone(), resolved);
            }
            resolved_inputs.insert(name.clone(), inputs);
            role_filters.insert(name.clone(), filters);
        }

        // Instantiate the per-party views.
        let mut views: BTreeMap<PartyAddr, PartyView> = spec
            .all_parties()
            .into_iter()
            .map(|addr| (addr, PartyView::default()))
            .collect();

        for (name, task) in &spec.tasks {
            let parties = &runtime_parties[name];
            for addr in parties {
                let view = views.get_mut(addr).expect("declared party has a view");
                let filters = &role_filters[name];
                let inputs: BTreeMap<String, ResolvedChannel> = resolved_inputs[name]
                    .iter()
                    .filter(|(input_name, _)| match filters.get(*input_name) {
                        Some(roles) => roles.iter().any(|r| r == &addr.role),
                        None => true,
                    })
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();

                let node = TaskNode {
                    name: name.clone(),
                    component_ref: task.component_ref.clone(),
                    stage: task
                        .stage
                        .clone()
                        .or_else(|| spec.stage.clone())
                        .unwrap_or_else(|| DEFAULT_STAGE.to_string()),
                    parameters: merged_parameters(spec, task, addr),
                    conf: merged_conf(spec, task),
                    inputs,
                    outputs: task.outputs.clone(),
                    runtime_parties: parties.clone(),
                };
                view.nodes.insert(name.clone(), node);
            }
        }

        // Edges restricted to each view: both endpoints must run there and
        // the consumer must keep the channel after role filtering.
        for (addr, view) in views.iter_mut() {
            let consumers: Vec<String> = view.nodes.keys().cloned().collect();
            for consumer in consumers {
                let producers: BTreeSet<String> = view.nodes[&consumer].upstream();
                for producer in producers {
                    if view.nodes.contains_key(&producer) {
                        view.edges.insert((producer, consumer.clone()));
                    }
                }
            }
            debug_assert!(view.edges.iter().all(|(p, c)| {
                view.nodes.contains_key(p) && view.nodes.contains_key(c)
            }), "view edges closed over nodes for {addr}");
        }

        let tasks: BTreeSet<String> = spec.tasks.keys().cloned().collect();
        let graph = TaskGraph::new(views, tasks, global_edges, runtime_parties);

        // Structural check: a schedulable order must exist.
        graph.global_topological_order()?;
        Ok(graph)
    }

    fn validate_parties(&self, spec: &DagSpec) -> Result<HashSet<PartyAddr>, ParseError> {
        if spec.parties.is_empty() {
            return Err(ParseError::NoParties);
        }
        let mut roles = HashSet::new();
        for decl in &spec.parties {
            if !roles.insert(decl.role.clone()) {
                return Err(ParseError::DuplicateRole(decl.role.clone()));
            }
            if decl.party_ids.is_empty() {
                return Err(ParseError::EmptyRole(decl.role.clone()));
            }
        }
        Ok(spec.all_parties().into_iter().collect())
    }

    fn resolve_channel(
        &self,
        job_id: &str,
        spec: &DagSpec,
        task: &str,
        input: &str,
        channel: &ChannelSpec,
    ) -> Result<ResolvedChannel, ParseError> {
        match channel {
            ChannelSpec::TaskOutput {
                producer_task,
                output_key,
                ..
            } => {
                let producer = spec.tasks.get(producer_task).ok_or_else(|| {
                    ParseError::UnknownProducer {
                        task: task.to_string(),
                        input: input.to_string(),
                        producer: producer_task.clone(),
                    }
                })?;
                if !producer_declares_output(self.registry, producer, output_key) {
                    return Err(ParseError::UnknownProducerOutput {
                        task: task.to_string(),
                        input: input.to_string(),
                        producer: producer_task.clone(),
                        output: output_key.clone(),
                    });
                }
                Ok(ResolvedChannel::TaskOutput {
                    producer_task: producer_task.clone(),
                    output_key: output_key.clone(),
                })
            }
            ChannelSpec::DataWarehouse {
                namespace,
                name,
                dataset_id,
            } => {
                if namespace.is_none() && name.is_none() && dataset_id.is_none() {
                    return Err(ParseError::EmptyDataReference {
                        task: task.to_string(),
                        input: input.to_string(),
                    });
                }
                Ok(ResolvedChannel::Data {
                    namespace: namespace.clone(),
                    name: name.clone(),
                    dataset_id: dataset_id.clone(),
                })
            }
            ChannelSpec::ModelWarehouse {
                model_id,
                model_version,
            } => Ok(ResolvedChannel::Model {
                // Unset references default to the job's own model.
                model_id: model_id
                    .clone()
                    .or_else(|| spec.conf.model_id.clone())
                    .unwrap_or_else(|| format!("{job_id}_model")),
                model_version: model_version
                    .or(spec.conf.model_version)
                    .unwrap_or(0),
            }),
        }
    }
}

/// Task-level party override (else job-level declarations) intersected with
/// the component's supported roles.
fn applicable_parties(
    task_name: &str,
    task: &TaskSpec,
    spec: &DagSpec,
    declared: &HashSet<PartyAddr>,
    supports_role: impl Fn(&str) -> bool,
) -> Result<Vec<PartyAddr>, ParseError> {
    let candidates: Vec<PartyAddr> = match &task.parties {
        Some(decls) => {
            let addrs: Vec<PartyAddr> = decls.iter().flat_map(|d| d.addrs()).collect();
            for addr in &addrs {
                if !declared.contains(addr) {
                    return Err(ParseError::UndeclaredParty {
                        task: task_name.to_string(),
                        party: addr.clone(),
                    });
                }
            }
            addrs
        }
        None => spec.all_parties(),
    };
    let parties: Vec<PartyAddr> = candidates
        .into_iter()
        .filter(|addr| supports_role(&addr.role))
        .collect();
    if parties.is_empty() {
        return Err(ParseError::NoApplicableParty {
            task: task_name.to_string(),
        });
    }
    Ok(parties)
}

fn producer_declares_output(
    registry: &ComponentRegistry,
    producer: &TaskSpec,
    output_key: &str,
) -> bool {
    if !producer.outputs.is_empty() {
        return producer.outputs.contains_key(output_key);
    }
    registry
        .meta(&producer.component_ref)
        .map(|meta| meta.output_artifacts.iter().any(|a| a == output_key))
        .unwrap_or(false)
}

fn merged_parameters(
    spec: &DagSpec,
    task: &TaskSpec,
    addr: &PartyAddr,
) -> Map<String, serde_json::Value> {
    let mut merged = spec.conf.params.resolve(addr);
    if let Some(parameters) = &task.parameters {
        merge_into(&mut merged, parameters);
    }
    merged
}

fn merged_conf(spec: &DagSpec, task: &TaskSpec) -> Map<String, serde_json::Value> {
    let mut merged = spec.conf.task_conf.clone();
    if let Some(conf) = &task.conf {
        merge_into(&mut merged, conf);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::ComponentMeta;
    use crate::dag::{OutputSpec, PartyDecl};
    use serde_json::json;

    fn registry() -> ComponentRegistry {
        let mut registry = ComponentRegistry::new();
        registry.register_meta(ComponentMeta {
            name: "reader".into(),
            supported_roles: vec!["guest".into(), "host".into()],
            input_artifacts: vec![],
            output_artifacts: vec!["output_data".into()],
        });
        registry.register_meta(ComponentMeta {
            name: "psi".into(),
            supported_roles: vec!["guest".into(), "host".into()],
            input_artifacts: vec!["input_data".into()],
            output_artifacts: vec!["output_data".into()],
        });
        registry.register_meta(ComponentMeta {
            name: "lr_train".into(),
            supported_roles: vec!["guest".into(), "host".into(), "arbiter".into()],
            input_artifacts: vec!["train_data".into(), "warm_model".into()],
            output_artifacts: vec!["model".into(), "metrics".into()],
        });
        registry
    }

    fn two_party_spec() -> DagSpec {
        serde_json::from_value(json!({
            "parties": [
                {"role": "guest", "party_ids": ["9999"]},
                {"role": "host", "party_ids": ["10000"]}
            ],
            "tasks": {
                "reader_0": {
                    "component_ref": "reader",
                    "inputs": {}
                },
                "psi_0": {
                    "component_ref": "psi",
                    "inputs": {
                        "input_data": {"task_output": {
                            "producer_task": "reader_0",
                            "output_key": "output_data"
                        }}
                    }
                },
                "train_0": {
                    "component_ref": "lr_train",
                    "inputs": {
                        "train_data": {"task_output": {
                            "producer_task": "psi_0",
                            "output_key": "output_data"
                        }},
                        "warm_model": {"model_warehouse": {}}
                    }
                }
            },
            "conf": {
                "model_id": "pearl_202401",
                "model_version": 3
            }
        }))
        .unwrap()
    }

    #[test]
    fn parses_chain_and_orders_every_view() {
        let registry = registry();
        let graph = DagParser::new(&registry)
            .parse("j-1", &two_party_spec())
            .unwrap();

        let guest = PartyAddr::new("guest", "9999");
        let order = graph.topological_order(&guest).unwrap();
        assert_eq!(order, vec!["reader_0", "psi_0", "train_0"]);
        assert_eq!(
            graph.global_topological_order().unwrap(),
            vec!["reader_0", "psi_0", "train_0"]
        );
    }

    #[test]
    fn warehouse_channels_create_no_dependency() {
        let registry = registry();
        let graph = DagParser::new(&registry)
            .parse("j-1", &two_party_spec())
            .unwrap();
        let deps = graph.dependent_tasks("train_0").unwrap();
        assert_eq!(deps.into_iter().collect::<Vec<_>>(), vec!["psi_0"]);
        assert!(graph.dependent_tasks("reader_0").unwrap().is_empty());
    }

    #[test]
    fn model_channel_inherits_job_defaults() {
        let registry = registry();
        let graph = DagParser::new(&registry)
            .parse("j-1", &two_party_spec())
            .unwrap();
        let guest = PartyAddr::new("guest", "9999");
        let node = graph.view(&guest).unwrap().node("train_0").unwrap();
        match &node.inputs["warm_model"] {
            ResolvedChannel::Model {
                model_id,
                model_version,
            } => {
                assert_eq!(model_id, "pearl_202401");
                assert_eq!(*model_version, 3);
            }
            other => panic!("expected model channel, got {other:?}"),
        }
    }

    #[test]
    fn model_channel_falls_back_to_job_id() {
        let registry = registry();
        let mut spec = two_party_spec();
        spec.conf.model_id = None;
        spec.conf.model_version = None;
        let graph = DagParser::new(&registry).parse("j-7", &spec).unwrap();
        let guest = PartyAddr::new("guest", "9999");
        let node = graph.view(&guest).unwrap().node("train_0").unwrap();
        match &node.inputs["warm_model"] {
            ResolvedChannel::Model {
                model_id,
                model_version,
            } => {
                assert_eq!(model_id, "j-7_model");
                assert_eq!(*model_version, 0);
            }
            other => panic!("expected model channel, got {other:?}"),
        }
    }

    #[test]
    fn unknown_producer_is_a_structural_error() {
        let registry = registry();
        let mut spec = two_party_spec();
        spec.tasks.get_mut("psi_0").unwrap().inputs.insert(
            "input_data".into(),
            ChannelSpec::TaskOutput {
                producer_task: "missing".into(),
                output_key: "output_data".into(),
                roles: None,
            },
        );
        assert!(matches!(
            DagParser::new(&registry).parse("j-1", &spec),
            Err(ParseError::UnknownProducer { .. })
        ));
    }

    #[test]
    fn unknown_component_is_a_structural_error() {
        let registry = registry();
        let mut spec = two_party_spec();
        spec.tasks.get_mut("psi_0").unwrap().component_ref = "nope".into();
        assert!(matches!(
            DagParser::new(&registry).parse("j-1", &spec),
            Err(ParseError::UnknownComponent { .. })
        ));
    }

    #[test]
    fn cycle_is_a_structural_error() {
        let registry = registry();
        let mut spec = two_party_spec();
        spec.tasks.get_mut("reader_0").unwrap().inputs.insert(
            "loop_back".into(),
            ChannelSpec::TaskOutput {
                producer_task: "train_0".into(),
                output_key: "model".into(),
                roles: None,
            },
        );
        assert!(matches!(
            DagParser::new(&registry).parse("j-1", &spec),
            Err(ParseError::Graph(GraphError::Cycle(_)))
        ));
    }

    #[test]
    fn task_party_override_narrows_applicability() {
        let registry = registry();
        let mut spec = two_party_spec();
        spec.tasks.get_mut("reader_0").unwrap().parties = Some(vec![PartyDecl {
            role: "guest".into(),
            party_ids: vec!["9999".into()],
        }]);
        let graph = DagParser::new(&registry).parse("j-1", &spec).unwrap();
        assert_eq!(
            graph.parties_of("reader_0").unwrap(),
            &[PartyAddr::new("guest", "9999")]
        );
        // The host view has no reader node and no reader edge.
        let host = PartyAddr::new("host", "10000");
        let host_view = graph.view(&host).unwrap();
        assert!(host_view.node("reader_0").is_none());
        assert!(host_view
            .edges
            .iter()
            .all(|(producer, _)| producer != "reader_0"));
    }

    #[test]
    fn role_restricted_channel_drops_edge_for_other_roles() {
        let registry = registry();
        let mut spec = two_party_spec();
        if let Some(task) = spec.tasks.get_mut("psi_0") {
            task.inputs.insert(
                "input_data".into(),
                ChannelSpec::TaskOutput {
                    producer_task: "reader_0".into(),
                    output_key: "output_data".into(),
                    roles: Some(vec!["guest".into()]),
                },
            );
        }
        let graph = DagParser::new(&registry).parse("j-1", &spec).unwrap();

        let guest = PartyAddr::new("guest", "9999");
        let host = PartyAddr::new("host", "10000");
        assert!(graph
            .view(&guest)
            .unwrap()
            .edges
            .contains(&("reader_0".into(), "psi_0".into())));
        assert!(!graph
            .view(&host)
            .unwrap()
            .edges
            .contains(&("reader_0".into(), "psi_0".into())));
        // Readiness still honors the producer globally.
        assert!(graph.dependent_tasks("psi_0").unwrap().contains("reader_0"));
    }

    #[test]
    fn undeclared_task_party_is_rejected() {
        let registry = registry();
        let mut spec = two_party_spec();
        spec.tasks.get_mut("reader_0").unwrap().parties = Some(vec![PartyDecl {
            role: "guest".into(),
            party_ids: vec!["1234".into()],
        }]);
        assert!(matches!(
            DagParser::new(&registry).parse("j-1", &spec),
            Err(ParseError::UndeclaredParty { .. })
        ));
    }

    #[test]
    fn unsupported_role_everywhere_is_rejected() {
        let mut registry = ComponentRegistry::new();
        registry.register_meta(ComponentMeta {
            name: "reader".into(),
            supported_roles: vec!["arbiter".into()],
            input_artifacts: vec![],
            output_artifacts: vec!["output_data".into()],
        });
        let spec: DagSpec = serde_json::from_value(json!({
            "parties": [{"role": "guest", "party_ids": ["9999"]}],
            "tasks": {"reader_0": {"component_ref": "reader"}}
        }))
        .unwrap();
        assert!(matches!(
            DagParser::new(&registry).parse("j-1", &spec),
            Err(ParseError::NoApplicableParty { .. })
        ));
    }

    #[test]
    fn empty_data_reference_is_rejected() {
        let registry = registry();
        let mut spec = two_party_spec();
        spec.tasks.get_mut("train_0").unwrap().inputs.insert(
            "train_data".into(),
            ChannelSpec::DataWarehouse {
                namespace: None,
                name: None,
                dataset_id: None,
            },
        );
        assert!(matches!(
            DagParser::new(&registry).parse("j-1", &spec),
            Err(ParseError::EmptyDataReference { .. })
        ));
    }

    #[test]
    fn producer_outputs_validated_against_explicit_declarations() {
        let registry = registry();
        let mut spec = two_party_spec();
        // reader_0 now declares its outputs explicitly, without the key
        // psi_0 consumes.
        spec.tasks
            .get_mut("reader_0")
            .unwrap()
            .outputs
            .insert("something_else".into(), OutputSpec::default());
        assert!(matches!(
            DagParser::new(&registry).parse("j-1", &spec),
            Err(ParseError::UnknownProducerOutput { .. })
        ));
    }
}
