use crate::PipelineError;
use crate::sink::SharedObjectStore;
use crate::tool::SharedTransformTool;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tokio::sync::{Mutex, MutexGuard};

pub const STORAGE: &str = "storage";
pub const TRANSFORM_TOOL: &str = "transform_tool";

#[derive(Clone)]
pub enum CapabilityHandle {
    Storage(SharedObjectStore),
    TransformTool(SharedTransformTool),
}

impl CapabilityHandle {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Storage(_) => "storage",
            Self::TransformTool(_) => "transform_tool",
        }
    }

    /// The transformation tool shares project state on disk, so at most one
    /// node may use it at a time within a run.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Self::TransformTool(_))
    }
}

impl fmt::Debug for CapabilityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Owns every external-resource handle for one run. Nodes borrow handles
/// through [`crate::NodeContext`] and never keep them past their compute call.
#[derive(Default)]
pub struct CapabilityProvider {
    handles: BTreeMap<String, CapabilityHandle>,
    locks: BTreeMap<String, Mutex<()>>,
}

impl CapabilityProvider {
    pub fn builder() -> CapabilityProviderBuilder {
        CapabilityProviderBuilder::default()
    }

    pub fn resolve(&self, name: &str) -> Result<&CapabilityHandle, PipelineError> {
        self.handles
            .get(name)
            .ok_or_else(|| PipelineError::MissingCapability(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handles.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.handles.keys().map(String::as_str)
    }

    /// Locks every exclusive capability among `names`. Guards are taken in
    /// sorted name order so concurrent nodes cannot deadlock.
    pub(crate) async fn acquire_exclusive<'a>(
        &'a self,
        names: &BTreeSet<String>,
    ) -> Vec<MutexGuard<'a, ()>> {
        let mut guards = Vec::new();
        for name in names {
            if let Some(lock) = self.locks.get(name) {
                tracing::trace!(capability = %name, "waiting for exclusive capability");
                guards.push(lock.lock().await);
            }
        }
        guards
    }
}

impl fmt::Debug for CapabilityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.handles.iter()).finish()
    }
}

impl Drop for CapabilityProvider {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            tracing::debug!(
                capabilities = ?self.handles.keys().collect::<Vec<_>>(),
                "released capability handles"
            );
        }
    }
}

#[derive(Default)]
pub struct CapabilityProviderBuilder {
    handles: BTreeMap<String, CapabilityHandle>,
}

impl CapabilityProviderBuilder {
    pub fn storage(self, name: impl Into<String>, store: SharedObjectStore) -> Self {
        self.handle(name, CapabilityHandle::Storage(store))
    }

    pub fn transform_tool(self, name: impl Into<String>, tool: SharedTransformTool) -> Self {
        self.handle(name, CapabilityHandle::TransformTool(tool))
    }

    /// Registering a name twice replaces the earlier handle.
    pub fn handle(mut self, name: impl Into<String>, handle: CapabilityHandle) -> Self {
        self.handles.insert(name.into(), handle);
        self
    }

    pub fn build(self) -> CapabilityProvider {
        let locks = self
            .handles
            .iter()
            .filter(|(_, handle)| handle.is_exclusive())
            .map(|(name, _)| (name.clone(), Mutex::new(())))
            .collect();
        CapabilityProvider {
            handles: self.handles,
            locks,
        }
    }
}
