use crate::capabilities::{CapabilityHandle, CapabilityProvider};
use crate::graph::NodeDefinition;
use crate::sink::SharedObjectStore;
use crate::tool::SharedTransformTool;
use crate::{PipelineError, RuntimeEventSink};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use strata_store::{
    Materialization, MemoryMaterializationStore, MetadataMap, MetadataValue, NodeFailure,
    NodeRunRecord, NodeStatus, OutputRef, RunRecord, RunStatus, SharedMaterializationStore,
};
use tokio_util::sync::CancellationToken;

/// What a compute function hands back on success.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeOutput {
    pub output: OutputRef,
    pub metadata: MetadataMap,
}

impl NodeOutput {
    pub fn new(output: OutputRef) -> Self {
        Self {
            output,
            metadata: MetadataMap::new(),
        }
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Self::new(OutputRef::value(value))
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self, PipelineError> {
        let encoded = serde_json::to_value(value)
            .map_err(|err| PipelineError::compute(format!("output serialization failed: {err}")))?;
        Ok(Self::value(encoded))
    }

    pub fn location(locator: impl Into<String>) -> Self {
        Self::new(OutputRef::location(locator))
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Outputs of the node's input-bound dependencies, keyed by dependency name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeInputs {
    outputs: BTreeMap<String, OutputRef>,
}

impl NodeInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dependency: impl Into<String>, output: OutputRef) {
        self.outputs.insert(dependency.into(), output);
    }

    pub fn get(&self, dependency: &str) -> Option<&OutputRef> {
        self.outputs.get(dependency)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn value(&self, dependency: &str) -> Result<&Value, PipelineError> {
        self.require(dependency)?.as_value().ok_or_else(|| {
            PipelineError::compute(format!("input '{dependency}' is a location, not a value"))
        })
    }

    pub fn location(&self, dependency: &str) -> Result<&str, PipelineError> {
        self.require(dependency)?.as_location().ok_or_else(|| {
            PipelineError::compute(format!("input '{dependency}' is a value, not a location"))
        })
    }

    pub fn decode<T: DeserializeOwned>(&self, dependency: &str) -> Result<T, PipelineError> {
        let value = self.value(dependency)?;
        T::deserialize(value).map_err(|err| {
            PipelineError::compute(format!("input '{dependency}' could not be decoded: {err}"))
        })
    }

    fn require(&self, dependency: &str) -> Result<&OutputRef, PipelineError> {
        self.outputs
            .get(dependency)
            .ok_or_else(|| PipelineError::compute(format!("input '{dependency}' is not bound")))
    }
}

/// Per-invocation view a compute function gets: run identity plus the
/// capabilities the node declared, nothing else.
pub struct NodeContext<'a> {
    run_id: &'a str,
    node: &'a NodeDefinition,
    capabilities: &'a CapabilityProvider,
}

impl<'a> NodeContext<'a> {
    pub(crate) fn new(
        run_id: &'a str,
        node: &'a NodeDefinition,
        capabilities: &'a CapabilityProvider,
    ) -> Self {
        Self {
            run_id,
            node,
            capabilities,
        }
    }

    pub fn run_id(&self) -> &str {
        self.run_id
    }

    pub fn node_name(&self) -> &str {
        self.node.name()
    }

    pub fn resolve(&self, capability: &str) -> Result<&'a CapabilityHandle, PipelineError> {
        if !self.node.capabilities().contains(capability) {
            return Err(PipelineError::MissingCapability(capability.to_string()));
        }
        self.capabilities.resolve(capability)
    }

    pub fn storage(&self, capability: &str) -> Result<SharedObjectStore, PipelineError> {
        match self.resolve(capability)? {
            CapabilityHandle::Storage(store) => Ok(Arc::clone(store)),
            CapabilityHandle::TransformTool(_) => {
                Err(PipelineError::MissingCapability(format!("{capability} (storage)")))
            }
        }
    }

    pub fn transform_tool(&self, capability: &str) -> Result<SharedTransformTool, PipelineError> {
        match self.resolve(capability)? {
            CapabilityHandle::TransformTool(tool) => Ok(Arc::clone(tool)),
            CapabilityHandle::Storage(_) => Err(PipelineError::MissingCapability(format!(
                "{capability} (transform tool)"
            ))),
        }
    }
}

#[async_trait]
pub trait NodeCompute: Send + Sync {
    async fn compute(
        &self,
        inputs: &NodeInputs,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, PipelineError>;
}

pub type SharedNodeCompute = Arc<dyn NodeCompute>;

/// Adapts a synchronous closure to [`NodeCompute`].
pub struct FnCompute<F> {
    compute: F,
}

impl<F> FnCompute<F> {
    pub fn new(compute: F) -> Self {
        Self { compute }
    }
}

#[async_trait]
impl<F> NodeCompute for FnCompute<F>
where
    F: Fn(&NodeInputs, &NodeContext<'_>) -> Result<NodeOutput, PipelineError> + Send + Sync,
{
    async fn compute(
        &self,
        inputs: &NodeInputs,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, PipelineError> {
        (self.compute)(inputs, ctx)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Selection {
    #[default]
    All,
    /// Exactly these nodes. Dependencies outside the set are read from the
    /// store for the same run id.
    Only(Vec<String>),
    /// These nodes plus everything downstream of them.
    Downstream(Vec<String>),
    /// These nodes plus everything they transitively depend on.
    Upstream(Vec<String>),
}

impl Selection {
    pub fn names(&self) -> &[String] {
        match self {
            Self::All => &[],
            Self::Only(names) | Self::Downstream(names) | Self::Upstream(names) => names,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Concurrent { max_concurrency: usize },
}

pub struct RunConfig {
    pub run_id: Option<String>,
    pub selection: Selection,
    pub mode: ExecutionMode,
    pub capabilities: CapabilityProvider,
    pub store: SharedMaterializationStore,
    pub events: RuntimeEventSink,
    pub cancellation: CancellationToken,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            selection: Selection::All,
            mode: ExecutionMode::Sequential,
            capabilities: CapabilityProvider::default(),
            store: Arc::new(MemoryMaterializationStore::new()),
            events: RuntimeEventSink::default(),
            cancellation: CancellationToken::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeOutcome {
    pub status: NodeStatus,
    pub output: Option<OutputRef>,
    pub metadata: MetadataMap,
    pub failure: Option<NodeFailure>,
    pub skip_reason: Option<String>,
}

impl NodeOutcome {
    pub fn succeeded(output: NodeOutput) -> Self {
        Self {
            status: NodeStatus::Succeeded,
            output: Some(output.output),
            metadata: output.metadata,
            failure: None,
            skip_reason: None,
        }
    }

    pub fn failed(failure: NodeFailure) -> Self {
        Self {
            status: NodeStatus::Failed,
            output: None,
            metadata: MetadataMap::new(),
            failure: Some(failure),
            skip_reason: None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Skipped,
            output: None,
            metadata: MetadataMap::new(),
            failure: None,
            skip_reason: Some(reason.into()),
        }
    }

    /// Outcome of a node whose success was already recorded for this run.
    pub fn reused(materialization: Materialization) -> Self {
        Self {
            status: NodeStatus::Succeeded,
            output: materialization.output,
            metadata: materialization.metadata,
            failure: None,
            skip_reason: None,
        }
    }

    pub fn run_record(&self) -> NodeRunRecord {
        NodeRunRecord {
            status: self.status,
            reason: self.reason().map(str::to_string),
            error_kind: self.failure.as_ref().map(|f| f.kind.clone()),
        }
    }

    pub fn reason(&self) -> Option<&str> {
        self.failure
            .as_ref()
            .map(|failure| failure.message.as_str())
            .or(self.skip_reason.as_deref())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: String,
    pub finished_at: String,
    pub selection: Vec<String>,
    /// Execution order of the nodes in scope.
    pub order: Vec<String>,
    pub nodes: BTreeMap<String, NodeOutcome>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn status_of(&self, node: &str) -> Option<NodeStatus> {
        self.nodes.get(node).map(|outcome| outcome.status)
    }

    pub fn outcome(&self, node: &str) -> Option<&NodeOutcome> {
        self.nodes.get(node)
    }

    pub fn failed_nodes(&self) -> Vec<&str> {
        self.nodes_with(NodeStatus::Failed)
    }

    pub fn skipped_nodes(&self) -> Vec<&str> {
        self.nodes_with(NodeStatus::Skipped)
    }

    pub fn to_record(&self) -> RunRecord {
        RunRecord {
            run_id: self.run_id.clone(),
            started_at: self.started_at.clone(),
            finished_at: Some(self.finished_at.clone()),
            status: self.status,
            selection: self.selection.clone(),
            nodes: self
                .nodes
                .iter()
                .map(|(name, outcome)| (name.clone(), outcome.run_record()))
                .collect(),
        }
    }

    fn nodes_with(&self, status: NodeStatus) -> Vec<&str> {
        self.order
            .iter()
            .filter(|name| self.status_of(name) == Some(status))
            .map(String::as_str)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_inputs_decode_expected_typed_value() {
        let mut inputs = NodeInputs::new();
        inputs.insert("a", OutputRef::value(json!([1, 2, 3])));
        inputs.insert("b", OutputRef::location("memory://lake/silver/b.parquet"));

        let decoded: Vec<i64> = inputs.decode("a").expect("decode should succeed");
        assert_eq!(decoded, vec![1, 2, 3]);
        assert_eq!(
            inputs.location("b").expect("location should resolve"),
            "memory://lake/silver/b.parquet"
        );
        assert!(inputs.value("b").is_err());
        assert!(inputs.value("missing").is_err());
    }

    #[test]
    fn run_summary_to_record_expected_reasons_and_kinds() {
        let summary = RunSummary {
            run_id: "run-1".to_string(),
            status: RunStatus::Failed,
            started_at: "1.000Z".to_string(),
            finished_at: "2.000Z".to_string(),
            selection: Vec::new(),
            order: vec!["a".to_string(), "b".to_string()],
            nodes: BTreeMap::from([
                (
                    "a".to_string(),
                    NodeOutcome::failed(NodeFailure::new("node_compute", "boom")),
                ),
                (
                    "b".to_string(),
                    NodeOutcome::skipped("dependency 'a' did not succeed"),
                ),
            ]),
        };

        let record = summary.to_record();
        assert_eq!(record.nodes["a"].error_kind.as_deref(), Some("node_compute"));
        assert_eq!(record.nodes["a"].reason.as_deref(), Some("boom"));
        assert_eq!(record.nodes["b"].status, NodeStatus::Skipped);
        assert_eq!(summary.failed_nodes(), vec!["a"]);
        assert_eq!(summary.skipped_nodes(), vec!["b"]);
    }

    #[test]
    fn node_output_with_metadata_expected_entries() {
        let output = NodeOutput::value(json!("ok"))
            .with_metadata("row_count", 3_i64)
            .with_metadata("preview", MetadataValue::Markdown("| a |".to_string()));
        assert_eq!(output.metadata["row_count"].as_i64(), Some(3));
        assert_eq!(output.metadata["preview"].as_str(), Some("| a |"));
    }
}
