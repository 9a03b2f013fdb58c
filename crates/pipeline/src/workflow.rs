//! Workflow payload preparation.
//!
//! Turns a [`Job`] into the node graph submitted to the rendering service.
//! A job whose parameters already are a node graph (every key a numeric
//! node id) is sent verbatim. Otherwise the prompt and parameters are
//! injected into a [`WorkflowTemplate`] if one is configured, or sent as a
//! flat map with the prompt added.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use genqueue_core::job::{FailureReason, Job};

/// Where a named parameter lands inside the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInput {
    pub node_id: String,
    pub input_name: String,
}

impl NodeInput {
    pub fn new(node_id: impl Into<String>, input_name: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            input_name: input_name.into(),
        }
    }
}

/// Node classes whose inputs are mapped automatically by
/// [`WorkflowTemplate::from_graph`].
const AUTO_MAPPED: &[(&str, &[&str])] = &[
    ("KSampler", &["seed", "steps", "cfg", "sampler_name", "scheduler", "denoise"]),
    ("EmptyLatentImage", &["width", "height", "batch_size"]),
    ("SaveImage", &["filename_prefix"]),
    ("CheckpointLoaderSimple", &["ckpt_name"]),
];

/// A node graph plus the mapping from parameter names to node inputs.
///
/// The `prompt` mapping receives the job's prompt text. A `seed` of `-1`
/// is replaced by a time-derived seed, and `filename_prefix` always starts
/// with the job id so output files can be matched back to their job.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    graph: Map<String, Value>,
    mappings: BTreeMap<String, NodeInput>,
}

impl WorkflowTemplate {
    /// Template with explicit mappings.
    pub fn new(graph: Map<String, Value>, mappings: BTreeMap<String, NodeInput>) -> Self {
        Self { graph, mappings }
    }

    /// Build a template from a graph, mapping well-known node inputs.
    ///
    /// The lowest-numbered `CLIPTextEncode` node receives the prompt.
    /// Parameter names of sampler, latent, save and checkpoint nodes are
    /// taken from their input names.
    pub fn from_graph(graph: Value) -> Result<Self, String> {
        let Value::Object(graph) = graph else {
            return Err("workflow template must be a JSON object".to_string());
        };

        let mut nodes: Vec<(&String, &Value)> = graph.iter().collect();
        nodes.sort_by_key(|(id, _)| id.parse::<u64>().unwrap_or(u64::MAX));

        let mut mappings = BTreeMap::new();
        for (node_id, node) in nodes {
            let class_type = node.get("class_type").and_then(Value::as_str).unwrap_or_default();

            if class_type == "CLIPTextEncode" && !mappings.contains_key("prompt") {
                mappings.insert("prompt".to_string(), NodeInput::new(node_id.as_str(), "text"));
                continue;
            }
            let inputs = AUTO_MAPPED
                .iter()
                .find(|(class, _)| *class == class_type)
                .map(|(_, inputs)| *inputs)
                .unwrap_or_default();
            for input in inputs {
                mappings
                    .entry(input.to_string())
                    .or_insert_with(|| NodeInput::new(node_id.as_str(), *input));
            }
        }

        if !mappings.contains_key("prompt") {
            return Err("workflow template has no CLIPTextEncode node for the prompt".to_string());
        }
        Ok(Self { graph, mappings })
    }

    pub fn mappings(&self) -> &BTreeMap<String, NodeInput> {
        &self.mappings
    }

    /// A copy of the graph with the job's prompt and parameters applied.
    fn render(&self, job: &Job) -> Result<Value, String> {
        let mut graph = self.graph.clone();

        let mut values: Vec<(&str, Value)> = job
            .workflow_params()
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        values.push(("prompt", Value::String(job.prompt().to_string())));

        for (name, value) in values {
            let Some(target) = self.mappings.get(name) else {
                tracing::debug!(job_id = %job.id(), param = name, "Unmapped parameter ignored");
                continue;
            };
            set_input(&mut graph, target, value)?;
        }

        if let Some(target) = self.mappings.get("seed") {
            if input_value(&graph, target).and_then(Value::as_i64) == Some(-1) {
                set_input(&mut graph, target, Value::from(time_seed()))?;
            }
        }
        if let Some(target) = self.mappings.get("filename_prefix") {
            let prefix = match input_value(&graph, target).and_then(Value::as_str) {
                Some(existing) if existing.starts_with(job.id()) => existing.to_string(),
                _ => job.id().to_string(),
            };
            set_input(&mut graph, target, Value::String(prefix))?;
        }

        Ok(Value::Object(graph))
    }
}

fn input_value<'a>(graph: &'a Map<String, Value>, target: &NodeInput) -> Option<&'a Value> {
    graph.get(&target.node_id)?.get("inputs")?.get(&target.input_name)
}

fn set_input(graph: &mut Map<String, Value>, target: &NodeInput, value: Value) -> Result<(), String> {
    let node = graph
        .get_mut(&target.node_id)
        .and_then(Value::as_object_mut)
        .ok_or_else(|| format!("template has no node {}", target.node_id))?;
    let inputs = node
        .entry("inputs")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| format!("node {} has non-object inputs", target.node_id))?;
    inputs.insert(target.input_name.clone(), value);
    Ok(())
}

/// Seed derived from the wall clock, within the positive `i32` range.
fn time_seed() -> i64 {
    chrono::Utc::now().timestamp_millis() % i64::from(i32::MAX)
}

/// Whether `params` already is a complete node graph.
pub fn is_node_graph(params: &Map<String, Value>) -> bool {
    !params.is_empty() && params.keys().all(|k| k.chars().all(|c| c.is_ascii_digit()))
}

/// Build the payload to submit for `job`.
pub fn prepare_payload(job: &Job, template: Option<&WorkflowTemplate>) -> Result<Value, FailureReason> {
    let params = job.workflow_params();

    if is_node_graph(params) {
        tracing::debug!(job_id = %job.id(), "Submitting prebuilt node graph");
        return Ok(Value::Object(params.clone()));
    }

    match template {
        Some(template) => template
            .render(job)
            .map_err(|message| FailureReason::Preparation { message }),
        None => {
            let mut payload = params.clone();
            payload.insert("prompt".to_string(), Value::String(job.prompt().to_string()));
            Ok(Value::Object(payload))
        }
    }
}
