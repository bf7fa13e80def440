use crate::capabilities::CapabilityProvider;
use crate::events::{NodeEvent, RunEvent, RuntimeEvent, RuntimeEventKind};
use crate::graph::{DependencyBinding, Graph, NodeDefinition};
use crate::runtime::{
    ExecutionMode, NodeContext, NodeInputs, NodeOutcome, NodeOutput, RunConfig, RunSummary,
    Selection,
};
use crate::{PipelineError, RuntimeEventSink};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use strata_store::{
    Materialization, MaterializationRecord, NodeFailure, NodeRunRecord, NodeStatus, OutputRef,
    RunRecord, RunStatus, SharedMaterializationStore, StoreError, timestamp_now,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

pub const CANCELLED_REASON: &str = "run cancelled";

#[derive(Debug, Default)]
pub struct PipelineRunner;

impl PipelineRunner {
    /// Executes the selected nodes of `graph` in dependency order.
    ///
    /// Node failures never abort the run: they are recorded and their
    /// dependents are skipped. The call itself only fails for an unknown
    /// selection or when the run record cannot be written.
    ///
    /// Reusing a run id continues that run: its record is extended rather
    /// than replaced, and nodes that already succeeded under the id are not
    /// computed again.
    pub async fn run(&self, graph: &Graph, config: RunConfig) -> Result<RunSummary, PipelineError> {
        let RunConfig {
            run_id,
            selection,
            mode,
            capabilities,
            store,
            events,
            cancellation,
        } = config;

        let scope = resolve_scope(graph, &selection)?;
        let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let order: Vec<&NodeDefinition> = graph
            .nodes()
            .filter(|node| scope.contains(node.name()))
            .collect();

        let prior = store.get_run(&run_id).await?;
        let ledger = opening_record(&run_id, prior, &selection, &order);

        let state = RunState {
            run_id: run_id.clone(),
            ledger: Mutex::new(ledger),
            scope,
            capabilities,
            store,
            events,
            sequence: AtomicU64::new(0),
        };
        let span = tracing::info_span!("pipeline_run", run_id = %run_id);
        state
            .execute(order, selection, mode, cancellation)
            .instrument(span)
            .await
    }
}

fn resolve_scope(graph: &Graph, selection: &Selection) -> Result<BTreeSet<String>, PipelineError> {
    match selection {
        Selection::All => Ok(graph
            .registered()
            .map(|node| node.name().to_string())
            .collect()),
        Selection::Only(names) => names
            .iter()
            .map(|name| {
                if graph.contains(name) {
                    Ok(name.clone())
                } else {
                    Err(PipelineError::UnknownSelection(name.clone()))
                }
            })
            .collect(),
        Selection::Downstream(names) => graph.downstream_closure(names.as_slice()),
        Selection::Upstream(names) => graph.upstream_closure(names.as_slice()),
    }
}

/// Record saved when a run starts. Nodes from an earlier invocation under the
/// same run id are kept; the ones about to run go back to pending.
fn opening_record(
    run_id: &str,
    prior: Option<RunRecord>,
    selection: &Selection,
    order: &[&NodeDefinition],
) -> RunRecord {
    let (started_at, mut nodes) = match prior {
        Some(prior) => (prior.started_at, prior.nodes),
        None => (timestamp_now(), BTreeMap::new()),
    };
    for node in order {
        nodes.insert(node.name().to_string(), NodeRunRecord::pending());
    }
    RunRecord {
        run_id: run_id.to_string(),
        started_at,
        finished_at: None,
        status: RunStatus::Running,
        selection: selection.names().to_vec(),
        nodes,
    }
}

enum Readiness {
    Ready,
    Waiting,
    Blocked(String),
}

struct RunState {
    run_id: String,
    /// The run record as last written; every save goes through this lock so
    /// node transitions reach the store in order.
    ledger: Mutex<RunRecord>,
    scope: BTreeSet<String>,
    capabilities: CapabilityProvider,
    store: SharedMaterializationStore,
    events: RuntimeEventSink,
    sequence: AtomicU64,
}

/// Per-run bookkeeping owned by the scheduling loop.
#[derive(Default)]
struct Progress {
    outcomes: BTreeMap<String, NodeOutcome>,
    cancelled: bool,
}

impl RunState {
    async fn execute(
        self,
        order: Vec<&NodeDefinition>,
        selection: Selection,
        mode: ExecutionMode,
        cancellation: CancellationToken,
    ) -> Result<RunSummary, PipelineError> {
        let started_at = timestamp_now();
        let order_names: Vec<String> = order.iter().map(|node| node.name().to_string()).collect();

        {
            let ledger = self.ledger.lock().await;
            self.store.save_run(ledger.clone()).await?;
        }
        self.emit(RuntimeEventKind::Run(RunEvent::Started {
            run_id: self.run_id.clone(),
            node_count: order.len(),
            selection: selection.names().to_vec(),
        }));
        tracing::info!(nodes = order.len(), ?mode, "run started");

        let mut progress = Progress::default();
        match mode {
            ExecutionMode::Sequential => {
                self.run_sequential(&order, &cancellation, &mut progress)
                    .await
            }
            ExecutionMode::Concurrent { max_concurrency } => {
                self.run_concurrent(&order, max_concurrency.max(1), &cancellation, &mut progress)
                    .await
            }
        }

        let status = if progress
            .outcomes
            .values()
            .any(|outcome| outcome.status == NodeStatus::Failed)
        {
            RunStatus::Failed
        } else if progress.cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Succeeded
        };

        let summary = RunSummary {
            run_id: self.run_id.clone(),
            status,
            started_at,
            finished_at: timestamp_now(),
            selection: selection.names().to_vec(),
            order: order_names,
            nodes: progress.outcomes,
        };
        self.close_ledger(&summary).await?;

        let failed = summary.failed_nodes().len();
        let skipped = summary.skipped_nodes().len();
        self.emit(RuntimeEventKind::Run(RunEvent::Finished {
            run_id: self.run_id.clone(),
            status: status.as_str().to_string(),
            failed,
            skipped,
        }));
        tracing::info!(status = %status, failed, skipped, "run finished");
        Ok(summary)
    }

    async fn run_sequential(
        &self,
        order: &[&NodeDefinition],
        cancellation: &CancellationToken,
        progress: &mut Progress,
    ) {
        for node in order {
            if cancellation.is_cancelled() {
                self.skip(node, CANCELLED_REASON.to_string(), progress);
                progress.cancelled = true;
                continue;
            }
            match self.readiness(node, &progress.outcomes) {
                Readiness::Blocked(reason) => self.skip(node, reason, progress),
                Readiness::Ready => {
                    let upstream = self.upstream_outputs(node, &progress.outcomes);
                    let outcome = self.execute_node(node, upstream).await;
                    progress.outcomes.insert(node.name().to_string(), outcome);
                }
                Readiness::Waiting => self.skip(
                    node,
                    "dependency has not finished".to_string(),
                    progress,
                ),
            }
        }
    }

    /// Same gating as the sequential loop, with up to `max_concurrency`
    /// compute calls in flight. Nodes are considered in topological order so
    /// a node is always examined after everything it depends on.
    async fn run_concurrent(
        &self,
        order: &[&NodeDefinition],
        max_concurrency: usize,
        cancellation: &CancellationToken,
        progress: &mut Progress,
    ) {
        let mut pending: Vec<&NodeDefinition> = order.to_vec();
        let mut running = FuturesUnordered::new();

        loop {
            if cancellation.is_cancelled() {
                if !pending.is_empty() {
                    progress.cancelled = true;
                }
                for node in pending.drain(..) {
                    self.skip(node, CANCELLED_REASON.to_string(), progress);
                }
            }

            let mut index = 0;
            while index < pending.len() && running.len() < max_concurrency {
                let node = pending[index];
                match self.readiness(node, &progress.outcomes) {
                    Readiness::Waiting => index += 1,
                    Readiness::Blocked(reason) => {
                        pending.remove(index);
                        self.skip(node, reason, progress);
                    }
                    Readiness::Ready => {
                        pending.remove(index);
                        let upstream = self.upstream_outputs(node, &progress.outcomes);
                        running.push(async move {
                            let outcome = self.execute_node(node, upstream).await;
                            (node.name().to_string(), outcome)
                        });
                    }
                }
            }

            if running.is_empty() {
                // Nothing in flight and nothing launchable: every pending
                // node is waiting on a node outside this loop, which a
                // validated graph cannot produce.
                for node in pending.drain(..) {
                    self.skip(node, "dependency has not finished".to_string(), progress);
                }
                break;
            }

            tokio::select! {
                finished = running.next() => {
                    if let Some((name, outcome)) = finished {
                        progress.outcomes.insert(name, outcome);
                    }
                }
                _ = cancellation.cancelled(), if !pending.is_empty() => {}
            }
        }
    }

    fn readiness(&self, node: &NodeDefinition, outcomes: &BTreeMap<String, NodeOutcome>) -> Readiness {
        let mut waiting = false;
        for dependency in node.dependencies() {
            if !self.scope.contains(&dependency.name) {
                continue;
            }
            match outcomes.get(&dependency.name).map(|outcome| outcome.status) {
                Some(NodeStatus::Succeeded) => {}
                Some(status) if status.is_terminal() => {
                    return Readiness::Blocked(format!(
                        "dependency '{}' {}",
                        dependency.name,
                        match status {
                            NodeStatus::Failed => "failed",
                            _ => "was skipped",
                        }
                    ));
                }
                _ => waiting = true,
            }
        }
        if waiting {
            Readiness::Waiting
        } else {
            Readiness::Ready
        }
    }

    fn upstream_outputs(
        &self,
        node: &NodeDefinition,
        outcomes: &BTreeMap<String, NodeOutcome>,
    ) -> BTreeMap<String, OutputRef> {
        node.dependencies()
            .iter()
            .filter(|dependency| dependency.binding == DependencyBinding::Input)
            .filter_map(|dependency| {
                outcomes
                    .get(&dependency.name)
                    .and_then(|outcome| outcome.output.clone())
                    .map(|output| (dependency.name.clone(), output))
            })
            .collect()
    }

    /// Folds this invocation's outcomes into the run record and writes it.
    /// A node that failed in any invocation keeps the run failed until it
    /// succeeds.
    async fn close_ledger(&self, summary: &RunSummary) -> Result<(), PipelineError> {
        let mut ledger = self.ledger.lock().await;
        for (name, outcome) in &summary.nodes {
            ledger.nodes.insert(name.clone(), outcome.run_record());
        }
        ledger.finished_at = Some(summary.finished_at.clone());
        ledger.selection = summary.selection.clone();
        ledger.status = if ledger.failed_nodes().next().is_some() {
            RunStatus::Failed
        } else {
            summary.status
        };
        self.store.save_run(ledger.clone()).await?;
        Ok(())
    }

    /// Writes one node's transition to the run record. Failing to save
    /// progress does not fail the node; the closing save reports it.
    async fn mark(&self, node: &str, record: NodeRunRecord) {
        let mut ledger = self.ledger.lock().await;
        ledger.nodes.insert(node.to_string(), record);
        if let Err(error) = self.store.save_run(ledger.clone()).await {
            tracing::warn!(node, error = %error, "failed to save run progress");
        }
    }

    /// A success already stored under this run id, if any.
    async fn earlier_success(
        &self,
        node: &NodeDefinition,
    ) -> Result<Option<Materialization>, StoreError> {
        match self.store.get(&self.run_id, node.name()).await {
            Ok(materialization) if materialization.is_succeeded() => Ok(Some(materialization)),
            Ok(_) | Err(StoreError::NotMaterialized { .. }) => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn skip(&self, node: &NodeDefinition, reason: String, progress: &mut Progress) {
        tracing::info!(node = node.name(), reason = %reason, "node skipped");
        self.emit(RuntimeEventKind::Node(NodeEvent::Skipped {
            run_id: self.run_id.clone(),
            node: node.name().to_string(),
            reason: reason.clone(),
        }));
        progress
            .outcomes
            .insert(node.name().to_string(), NodeOutcome::skipped(reason));
    }

    async fn execute_node(
        &self,
        node: &NodeDefinition,
        upstream: BTreeMap<String, OutputRef>,
    ) -> NodeOutcome {
        let span = tracing::info_span!("node", node = node.name());
        async {
            match self.earlier_success(node).await {
                Ok(Some(materialization)) => {
                    tracing::info!("node reused");
                    self.emit(RuntimeEventKind::Node(NodeEvent::Reused {
                        run_id: self.run_id.clone(),
                        node: node.name().to_string(),
                    }));
                    let outcome = NodeOutcome::reused(materialization);
                    self.mark(node.name(), outcome.run_record()).await;
                    return outcome;
                }
                Ok(None) => {}
                Err(error) => {
                    let outcome = NodeOutcome::failed(store_failure(&error));
                    self.mark(node.name(), outcome.run_record()).await;
                    return outcome;
                }
            }

            self.emit(RuntimeEventKind::Node(NodeEvent::Started {
                run_id: self.run_id.clone(),
                node: node.name().to_string(),
            }));
            self.mark(
                node.name(),
                NodeRunRecord {
                    status: NodeStatus::Running,
                    reason: None,
                    error_kind: None,
                },
            )
            .await;
            tracing::debug!("node started");

            let outcome = match self.compute_node(node, upstream).await {
                Ok(output) => NodeOutcome::succeeded(output),
                Err(error) => NodeOutcome::failed(NodeFailure::new(error.kind(), error.to_string())),
            };
            let outcome = self.record(node, outcome).await;
            self.mark(node.name(), outcome.run_record()).await;

            match outcome.failure.as_ref() {
                None => {
                    tracing::info!("node succeeded");
                    self.emit(RuntimeEventKind::Node(NodeEvent::Succeeded {
                        run_id: self.run_id.clone(),
                        node: node.name().to_string(),
                    }));
                }
                Some(failure) => {
                    tracing::warn!(error_kind = %failure.kind, reason = %failure.message, "node failed");
                    self.emit(RuntimeEventKind::Node(NodeEvent::Failed {
                        run_id: self.run_id.clone(),
                        node: node.name().to_string(),
                        error_kind: failure.kind.clone(),
                        reason: failure.message.clone(),
                    }));
                }
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn compute_node(
        &self,
        node: &NodeDefinition,
        mut upstream: BTreeMap<String, OutputRef>,
    ) -> Result<NodeOutput, PipelineError> {
        for capability in node.capabilities() {
            self.capabilities.resolve(capability)?;
        }

        let mut inputs = NodeInputs::new();
        for dependency in node.dependencies() {
            let output = if self.scope.contains(&dependency.name) {
                upstream.remove(&dependency.name)
            } else {
                Some(self.materialized_output(&dependency.name).await?)
            };
            if dependency.binding == DependencyBinding::Input {
                let output = output.ok_or_else(|| PipelineError::NotMaterialized {
                    run_id: self.run_id.clone(),
                    node: dependency.name.clone(),
                })?;
                inputs.insert(dependency.name.clone(), output);
            }
        }

        let _guards = self.capabilities.acquire_exclusive(node.capabilities()).await;
        let ctx = NodeContext::new(&self.run_id, node, &self.capabilities);
        node.compute().compute(&inputs, &ctx).await
    }

    /// Output of a dependency outside the selection, read from this run's
    /// materializations.
    async fn materialized_output(&self, dependency: &str) -> Result<OutputRef, PipelineError> {
        let materialization = self.store.get(&self.run_id, dependency).await?;
        match materialization.output {
            Some(output) if materialization.status == NodeStatus::Succeeded => Ok(output),
            _ => Err(PipelineError::NotMaterialized {
                run_id: self.run_id.clone(),
                node: dependency.to_string(),
            }),
        }
    }

    /// Writes the node's materialization. A success that cannot be stored
    /// turns into a failure.
    async fn record(&self, node: &NodeDefinition, outcome: NodeOutcome) -> NodeOutcome {
        let record = match (&outcome.output, &outcome.failure) {
            (Some(output), None) => {
                MaterializationRecord::succeeded(output.clone(), outcome.metadata.clone())
            }
            (_, Some(failure)) => MaterializationRecord::failed(failure.clone()),
            (None, None) => return outcome,
        };

        match self.store.put(&self.run_id, node.name(), record).await {
            Ok(materialization) => {
                self.emit(RuntimeEventKind::Node(NodeEvent::Materialized {
                    run_id: self.run_id.clone(),
                    node: node.name().to_string(),
                    status: materialization.status.as_str().to_string(),
                    content_hash: materialization.content_hash,
                }));
                outcome
            }
            Err(error) if outcome.status == NodeStatus::Succeeded => {
                NodeOutcome::failed(store_failure(&error))
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to record node failure");
                outcome
            }
        }
    }

    fn emit(&self, kind: RuntimeEventKind) {
        if !self.events.is_enabled() {
            return;
        }
        let sequence_no = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        self.events.emit(RuntimeEvent {
            sequence_no,
            timestamp: timestamp_now(),
            kind,
        });
    }
}

fn store_failure(error: &StoreError) -> NodeFailure {
    NodeFailure::new(
        "store",
        format!("materialization could not be recorded: {error}"),
    )
}
