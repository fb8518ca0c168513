//! Event pump connecting the channel, the upload aggregator and the
//! orchestrator.
//!
//! Each user gets a worker task fed through its own queue, so one user's
//! events are handled in arrival order while different users proceed in
//! parallel.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::Orchestrator;
use crate::channels::{Channel, InboundEvent, InboundKind};
use crate::error::ChannelError;
use crate::upload::FlushedBatch;

/// A worker exits after this long without work.
const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug)]
enum Work {
    Event(InboundEvent),
    Batch(FlushedBatch),
}

/// Queue and task of one user's worker.
struct WorkerHandle {
    tx: mpsc::UnboundedSender<Work>,
    task: JoinHandle<()>,
}

/// Drives the orchestrator from a live channel.
pub struct Runtime {
    orchestrator: Arc<Orchestrator>,
    channel: Arc<dyn Channel>,
}

impl Runtime {
    pub fn new(orchestrator: Arc<Orchestrator>, channel: Arc<dyn Channel>) -> Self {
        Self {
            orchestrator,
            channel,
        }
    }

    /// Pump events until `shutdown` resolves or the channel stream ends.
    ///
    /// Batches still waiting for their quiet period are dropped on exit.
    pub async fn run<S>(
        self,
        mut flushes: mpsc::UnboundedReceiver<FlushedBatch>,
        shutdown: S,
    ) -> Result<(), ChannelError>
    where
        S: Future<Output = ()>,
    {
        let mut stream = self.channel.start().await?;
        let mut workers: HashMap<String, WorkerHandle> = HashMap::new();
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        tokio::pin!(shutdown);

        info!(channel = self.channel.name(), "Event pump started");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping event pump");
                    break;
                }
                event = stream.next() => match event {
                    Some(event) => {
                        let user_id = event.user_id.clone();
                        self.dispatch(&mut workers, user_id, Work::Event(event));
                    }
                    None => {
                        warn!(channel = self.channel.name(), "Inbound stream ended");
                        break;
                    }
                },
                Some(batch) = flushes.recv() => {
                    let user_id = batch.user_id.clone();
                    self.dispatch(&mut workers, user_id, Work::Batch(batch));
                }
                _ = housekeeping.tick() => {
                    workers.retain(|_, w| !w.tx.is_closed());
                    let pruned = self.orchestrator.prune_idle_locks().await;
                    debug!(workers = workers.len(), pruned, "Housekeeping");
                }
            }
        }

        // Workers finish what is already queued, then exit.
        workers.clear();
        Ok(())
    }

    fn dispatch(&self, workers: &mut HashMap<String, WorkerHandle>, user_id: String, work: Work) {
        let (work, previous) = match workers.remove(&user_id) {
            Some(handle) => match handle.tx.send(work) {
                Ok(()) => {
                    workers.insert(user_id, handle);
                    return;
                }
                // The old worker went idle and may still be draining.
                Err(SendError(work)) => (work, Some(handle.task)),
            },
            None => (work, None),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // A fresh receiver cannot be closed yet.
        let _ = tx.send(work);
        let task = tokio::spawn(worker(
            user_id.clone(),
            rx,
            previous,
            self.orchestrator.clone(),
            self.channel.clone(),
        ));
        workers.insert(user_id, WorkerHandle { tx, task });
    }
}

async fn worker(
    user_id: String,
    mut rx: mpsc::UnboundedReceiver<Work>,
    previous: Option<JoinHandle<()>>,
    orchestrator: Arc<Orchestrator>,
    channel: Arc<dyn Channel>,
) {
    if let Some(previous) = previous {
        // Events queued on the old worker come first.
        if let Err(e) = previous.await {
            warn!(user_id = %user_id, error = %e, "Previous user worker failed");
        }
    }
    debug!(user_id = %user_id, "User worker started");
    loop {
        match tokio::time::timeout(WORKER_IDLE_TIMEOUT, rx.recv()).await {
            Ok(Some(work)) => process(work, &orchestrator, channel.as_ref()).await,
            Ok(None) => break,
            Err(_) => {
                rx.close();
                while let Ok(work) = rx.try_recv() {
                    process(work, &orchestrator, channel.as_ref()).await;
                }
                break;
            }
        }
    }
    debug!(user_id = %user_id, "User worker stopped");
}

async fn process(work: Work, orchestrator: &Orchestrator, channel: &dyn Channel) {
    let result = match work {
        Work::Event(event) => {
            if !matches!(event.kind, InboundKind::Attachment(_)) {
                if let Err(e) = channel.send_typing(&event.user_id).await {
                    debug!(user_id = %event.user_id, error = %e, "Typing indicator failed");
                }
            }
            orchestrator.handle_event(event).await
        }
        Work::Batch(batch) => orchestrator.handle_batch(batch).await,
    };

    match result {
        Ok(Some(reply)) => {
            let user_id = reply.user_id.clone();
            if let Err(e) = channel.send(reply).await {
                warn!(user_id = %user_id, error = %e, "Failed to send reply");
            }
        }
        Ok(None) => {}
        Err(e) => {
            error!(error = %e, "Event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::channels::{Attachment, MessageStream, OutgoingContent, OutgoingMessage};
    use crate::config::OrchestratorConfig;
    use crate::documents::DocumentExtractor;
    use crate::error::CollaboratorError;
    use crate::flow::{Intent, prompts};
    use crate::llm::{Classification, ReasoningAgent};
    use crate::orchestrator::Collaborators;
    use crate::policy::{PolicyDelivery, PolicyDocument};
    use crate::session::{HistoryEntry, LibSqlSessionStore, Stage};
    use crate::upload::UploadAggregator;

    struct ScriptedChannel {
        events: Mutex<Option<Vec<InboundEvent>>>,
        sent: Mutex<Vec<OutgoingMessage>>,
    }

    #[async_trait]
    impl Channel for ScriptedChannel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn start(&self) -> Result<MessageStream, ChannelError> {
            let events = self.events.lock().unwrap().take().unwrap_or_default();
            // Keep the stream open so the pump only stops on shutdown.
            let stream = futures::stream::iter(events).chain(futures::stream::pending());
            Ok(Box::pin(stream))
        }

        async fn send(&self, message: OutgoingMessage) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }

    struct KeywordAgent;

    #[async_trait]
    impl ReasoningAgent for KeywordAgent {
        async fn classify(
            &self,
            _stage: Stage,
            history: &[HistoryEntry],
        ) -> Result<Classification, CollaboratorError> {
            let last = history.last().map(|e| e.content.as_str()).unwrap_or("");
            let intent = if last.contains("insurance") {
                Intent::Proceed
            } else {
                Intent::Unrecognized
            };
            Ok(Classification::new(intent))
        }
    }

    struct NoExtractor;

    #[async_trait]
    impl DocumentExtractor for NoExtractor {
        async fn extract(
            &self,
            _items: &[Attachment],
        ) -> Result<BTreeMap<String, String>, CollaboratorError> {
            Err(CollaboratorError::transient("test", "unused"))
        }
    }

    struct NoDelivery;

    #[async_trait]
    impl PolicyDelivery for NoDelivery {
        async fn deliver(&self, _user_id: &str, _policy: &PolicyDocument) -> Result<(), CollaboratorError> {
            Ok(())
        }
    }

    async fn test_orchestrator() -> (Arc<Orchestrator>, mpsc::UnboundedReceiver<FlushedBatch>) {
        let store = Arc::new(LibSqlSessionStore::new_memory(64).await.unwrap());
        let config = OrchestratorConfig::default();
        let (aggregator, flushes) = UploadAggregator::new(config.quiet_period);
        let orchestrator = Arc::new(Orchestrator::new(
            store,
            aggregator,
            Collaborators {
                reasoning: Arc::new(KeywordAgent),
                extractor: Arc::new(NoExtractor),
                delivery: Arc::new(NoDelivery),
            },
            config,
        ));
        (orchestrator, flushes)
    }

    fn scripted(events: Vec<InboundEvent>) -> Arc<ScriptedChannel> {
        Arc::new(ScriptedChannel {
            events: Mutex::new(Some(events)),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn texts(channel: &ScriptedChannel) -> Vec<String> {
        channel
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| match &m.content {
                OutgoingContent::Text(t) => t.clone(),
                OutgoingContent::Document { .. } => "<document>".to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn pump_answers_in_order_and_stops_on_shutdown() {
        let (orchestrator, flushes) = test_orchestrator().await;
        let channel = scripted(vec![
            InboundEvent::text("1", "42", "hello"),
            InboundEvent::text("2", "42", "I need car insurance"),
        ]);

        let runtime = Runtime::new(orchestrator, channel.clone());
        let watched = channel.clone();
        let shutdown = async move {
            for _ in 0..500 {
                if watched.sent.lock().unwrap().len() >= 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        runtime.run(flushes, shutdown).await.unwrap();

        assert_eq!(texts(&channel), vec![prompts::GREETING, prompts::REQUEST_DOCUMENTS]);
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_worker_waits_for_draining_worker() {
        let (orchestrator, _flushes) = test_orchestrator().await;
        let channel = scripted(Vec::new());
        let runtime = Runtime::new(orchestrator, channel.clone());

        // A worker that has closed its queue but is still working through it.
        let (tx, rx) = mpsc::unbounded_channel::<Work>();
        drop(rx);
        let draining = channel.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            draining.send(OutgoingMessage::text("42", "drained")).await.unwrap();
        });
        let mut workers = HashMap::new();
        workers.insert("42".to_string(), WorkerHandle { tx, task });

        runtime.dispatch(
            &mut workers,
            "42".to_string(),
            Work::Event(InboundEvent::text("1", "42", "hello")),
        );
        let replacement = workers.remove("42").unwrap();
        drop(replacement.tx);
        replacement.task.await.unwrap();

        assert_eq!(texts(&channel), vec!["drained", prompts::GREETING]);
    }
}
