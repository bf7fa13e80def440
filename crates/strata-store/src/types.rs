use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub type RunId = String;
pub type NodeName = String;
pub type MetadataMap = BTreeMap<String, MetadataValue>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque pointer to a node's output: either the value itself or a locator
/// into durable storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OutputRef {
    Value(Value),
    Location(String),
}

impl OutputRef {
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    pub fn location(locator: impl Into<String>) -> Self {
        Self::Location(locator.into())
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Location(_) => None,
        }
    }

    pub fn as_location(&self) -> Option<&str> {
        match self {
            Self::Value(_) => None,
            Self::Location(locator) => Some(locator),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MetadataValue {
    Int(i64),
    Float(f64),
    Text(String),
    Markdown(String),
    Url(String),
    Json(Value),
}

impl MetadataValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) | Self::Markdown(value) | Self::Url(value) => Some(value),
            _ => None,
        }
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<usize> for MetadataValue {
    fn from(value: usize) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub kind: String,
    pub message: String,
}

impl NodeFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// What a caller hands to [`crate::MaterializationStore::put`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaterializationRecord {
    pub status: NodeStatus,
    pub output: Option<OutputRef>,
    pub metadata: MetadataMap,
    pub failure: Option<NodeFailure>,
}

impl MaterializationRecord {
    pub fn succeeded(output: OutputRef, metadata: MetadataMap) -> Self {
        Self {
            status: NodeStatus::Succeeded,
            output: Some(output),
            metadata,
            failure: None,
        }
    }

    pub fn failed(failure: NodeFailure) -> Self {
        Self {
            status: NodeStatus::Failed,
            output: None,
            metadata: MetadataMap::new(),
            failure: Some(failure),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Materialization {
    pub run_id: RunId,
    pub node: NodeName,
    pub status: NodeStatus,
    pub output: Option<OutputRef>,
    pub metadata: MetadataMap,
    pub failure: Option<NodeFailure>,
    pub content_hash: Option<String>,
    pub recorded_at: String,
}

impl Materialization {
    pub fn is_succeeded(&self) -> bool {
        self.status == NodeStatus::Succeeded && self.output.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRunRecord {
    pub status: NodeStatus,
    pub reason: Option<String>,
    pub error_kind: Option<String>,
}

impl NodeRunRecord {
    pub fn pending() -> Self {
        Self {
            status: NodeStatus::Pending,
            reason: None,
            error_kind: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub selection: Vec<NodeName>,
    pub nodes: BTreeMap<NodeName, NodeRunRecord>,
}

impl RunRecord {
    pub fn failed_nodes(&self) -> impl Iterator<Item = (&NodeName, &NodeRunRecord)> {
        self.nodes
            .iter()
            .filter(|(_, record)| record.status == NodeStatus::Failed)
    }
}

pub fn timestamp_now() -> String {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!(
        "{}.{:03}Z",
        since_epoch.as_secs(),
        since_epoch.subsec_millis()
    )
}

pub(crate) fn content_hash(output: &OutputRef) -> Result<String, serde_json::Error> {
    let encoded = serde_json::to_vec(output)?;
    Ok(blake3::hash(&encoded).to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn output_ref_serialized_expected_tagged_shape() {
        let encoded = serde_json::to_value(OutputRef::location("memory://bucket/silver/a.parquet"))
            .expect("output ref should serialize");
        assert_eq!(
            encoded,
            json!({"kind": "location", "value": "memory://bucket/silver/a.parquet"})
        );
    }

    #[test]
    fn content_hash_same_output_expected_stable() {
        let first = content_hash(&OutputRef::value(json!({"rows": 3}))).expect("hash");
        let second = content_hash(&OutputRef::value(json!({"rows": 3}))).expect("hash");
        let other = content_hash(&OutputRef::value(json!({"rows": 4}))).expect("hash");

        assert_eq!(first, second);
        assert_ne!(first, other);
    }

    #[test]
    fn node_status_terminal_states_expected_three() {
        let terminal: Vec<_> = [
            NodeStatus::Pending,
            NodeStatus::Running,
            NodeStatus::Succeeded,
            NodeStatus::Failed,
            NodeStatus::Skipped,
        ]
        .into_iter()
        .filter(|status| status.is_terminal())
        .collect();

        assert_eq!(
            terminal,
            vec![NodeStatus::Succeeded, NodeStatus::Failed, NodeStatus::Skipped]
        );
    }
}
