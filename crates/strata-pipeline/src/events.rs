use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub sequence_no: u64,
    pub timestamp: String,
    pub kind: RuntimeEventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum RuntimeEventKind {
    Run(RunEvent),
    Node(NodeEvent),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEvent {
    Started {
        run_id: String,
        node_count: usize,
        selection: Vec<String>,
    },
    Finished {
        run_id: String,
        status: String,
        failed: usize,
        skipped: usize,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeEvent {
    Started {
        run_id: String,
        node: String,
    },
    Succeeded {
        run_id: String,
        node: String,
    },
    Failed {
        run_id: String,
        node: String,
        error_kind: String,
        reason: String,
    },
    Skipped {
        run_id: String,
        node: String,
        reason: String,
    },
    Materialized {
        run_id: String,
        node: String,
        status: String,
        content_hash: Option<String>,
    },
    /// An earlier invocation with the same run id already materialized the
    /// node; its output is used without recomputing.
    Reused {
        run_id: String,
        node: String,
    },
}

impl RuntimeEventKind {
    pub fn run_id(&self) -> &str {
        match self {
            Self::Run(RunEvent::Started { run_id, .. } | RunEvent::Finished { run_id, .. }) => {
                run_id
            }
            Self::Node(
                NodeEvent::Started { run_id, .. }
                | NodeEvent::Succeeded { run_id, .. }
                | NodeEvent::Failed { run_id, .. }
                | NodeEvent::Skipped { run_id, .. }
                | NodeEvent::Materialized { run_id, .. }
                | NodeEvent::Reused { run_id, .. },
            ) => run_id,
        }
    }
}

pub trait RuntimeEventObserver: Send + Sync {
    fn on_event(&self, event: &RuntimeEvent);
}

impl<F> RuntimeEventObserver for F
where
    F: Fn(&RuntimeEvent) + Send + Sync,
{
    fn on_event(&self, event: &RuntimeEvent) {
        self(event);
    }
}

pub type SharedRuntimeEventObserver = Arc<dyn RuntimeEventObserver>;
pub type RuntimeEventSender = mpsc::UnboundedSender<RuntimeEvent>;
pub type RuntimeEventReceiver = mpsc::UnboundedReceiver<RuntimeEvent>;

#[derive(Clone, Default)]
pub struct RuntimeEventSink {
    observer: Option<SharedRuntimeEventObserver>,
    sender: Option<RuntimeEventSender>,
}

impl RuntimeEventSink {
    pub fn with_observer(observer: SharedRuntimeEventObserver) -> Self {
        Self::default().observer(observer)
    }

    pub fn with_sender(sender: RuntimeEventSender) -> Self {
        Self::default().sender(sender)
    }

    pub fn observer(mut self, observer: SharedRuntimeEventObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn sender(mut self, sender: RuntimeEventSender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.observer.is_some() || self.sender.is_some()
    }

    pub fn emit(&self, event: RuntimeEvent) {
        if let Some(observer) = self.observer.as_ref() {
            observer.on_event(&event);
        }
        if let Some(sender) = self.sender.as_ref() {
            // A dropped receiver only means nobody is listening anymore.
            let _ = sender.send(event);
        }
    }
}

pub fn runtime_event_channel() -> (RuntimeEventSender, RuntimeEventReceiver) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn runtime_event_sink_observer_and_sender_expected_both_receive_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer_seen = Arc::clone(&seen);
        let observer: SharedRuntimeEventObserver = Arc::new(move |event: &RuntimeEvent| {
            observer_seen
                .lock()
                .expect("observer mutex should lock")
                .push(event.sequence_no);
        });
        let (tx, mut rx) = runtime_event_channel();
        let sink = RuntimeEventSink::with_observer(observer).sender(tx);
        sink.emit(RuntimeEvent {
            sequence_no: 3,
            timestamp: "1.000Z".to_string(),
            kind: RuntimeEventKind::Node(NodeEvent::Skipped {
                run_id: "run-1".to_string(),
                node: "dbt_sites_unions".to_string(),
                reason: "dependency 'dbt_stg_sites' did not succeed".to_string(),
            }),
        });

        let streamed = rx.try_recv().expect("channel should receive one event");
        assert_eq!(streamed.kind.run_id(), "run-1");
        assert_eq!(
            seen.lock().expect("observer mutex should lock").as_slice(),
            &[3]
        );
    }

    #[test]
    fn runtime_event_serialized_expected_category_and_kind_tags() {
        let event = RuntimeEvent {
            sequence_no: 1,
            timestamp: "1.000Z".to_string(),
            kind: RuntimeEventKind::Run(RunEvent::Finished {
                run_id: "run-1".to_string(),
                status: "failed".to_string(),
                failed: 1,
                skipped: 2,
            }),
        };
        let encoded = serde_json::to_value(&event).expect("event should serialize");
        assert_eq!(encoded["kind"]["category"], "run");
        assert_eq!(encoded["kind"]["kind"], "finished");
        assert_eq!(encoded["kind"]["skipped"], 2);
    }

    #[test]
    fn emit_after_receiver_dropped_expected_no_panic() {
        let (tx, rx) = runtime_event_channel();
        drop(rx);
        let sink = RuntimeEventSink::with_sender(tx);
        assert!(sink.is_enabled());
        sink.emit(RuntimeEvent {
            sequence_no: 1,
            timestamp: "1.000Z".to_string(),
            kind: RuntimeEventKind::Node(NodeEvent::Started {
                run_id: "run-1".to_string(),
                node: "a".to_string(),
            }),
        });
    }
}
