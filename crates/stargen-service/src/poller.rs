//! Job polling for asynchronous provider tasks.
//!
//! Each in-flight generation gets its own monitor task. A monitor sleeps
//! for the configured interval, asks the provider for the task status and
//! stops at the first terminal status or when the attempt budget runs out.
//! A status pushed by the provider (a callback) wakes the monitor early and
//! is used in place of that round's poll. Status changes are broadcast as
//! [`StatusEvent`]s.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinHandle;

use stargen_core::{GenerationError, GenerationId, GenerationStatus, JobHandle, OutputRef, UserId};
use stargen_providers::{PollResult, ProviderRegistry};

use crate::config::PollerConfig;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const PUSHED_STATUS_CAPACITY: usize = 4;

/// A status change of one generation.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    /// Generation that changed.
    pub generation_id: GenerationId,
    /// Owner of the generation.
    pub user_id: UserId,
    /// New status.
    pub status: GenerationStatus,
    /// Outputs, once completed.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputRef>,
    /// Failure reason, once failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the change was observed.
    pub at: DateTime<Utc>,
}

impl StatusEvent {
    /// An event stamped with the current time.
    #[must_use]
    pub fn now(generation_id: GenerationId, user_id: UserId, status: GenerationStatus) -> Self {
        Self {
            generation_id,
            user_id,
            status,
            outputs: Vec::new(),
            error: None,
            at: Utc::now(),
        }
    }
}

/// How a monitored job ended.
#[derive(Debug)]
pub enum PollOutcome {
    /// The provider produced outputs.
    Completed(Vec<OutputRef>),
    /// The provider failed the task, or the attempt budget ran out.
    Failed(GenerationError),
}

/// Polls provider tasks and tracks the monitors doing it.
pub struct JobPoller {
    registry: ProviderRegistry,
    config: PollerConfig,
    permits: Option<Arc<Semaphore>>,
    events: broadcast::Sender<StatusEvent>,
    monitors: Mutex<HashMap<GenerationId, JoinHandle<()>>>,
    pushed: Mutex<HashMap<GenerationId, mpsc::Sender<PollResult>>>,
}

impl JobPoller {
    /// Create a poller.
    #[must_use]
    pub fn new(registry: ProviderRegistry, config: PollerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let permits = (config.max_concurrent > 0)
            .then(|| Arc::new(Semaphore::new(config.max_concurrent)));
        Self {
            registry,
            config,
            permits,
            events,
            monitors: Mutex::new(HashMap::new()),
            pushed: Mutex::new(HashMap::new()),
        }
    }

    /// Receive status events from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Broadcast a status event. Having no subscribers is fine.
    pub fn publish(&self, event: StatusEvent) {
        let _ = self.events.send(event);
    }

    /// Poll `job` until it ends or the attempt budget runs out.
    pub async fn run(
        &self,
        generation_id: GenerationId,
        user_id: UserId,
        job: &JobHandle,
    ) -> PollOutcome {
        let (sender, mut pushed) = mpsc::channel(PUSHED_STATUS_CAPACITY);
        self.pushed.lock().await.insert(generation_id, sender);
        let outcome = self.poll_until_done(generation_id, user_id, job, &mut pushed).await;
        self.pushed.lock().await.remove(&generation_id);
        outcome
    }

    /// Hand a provider-pushed status to the monitor watching `generation_id`.
    ///
    /// Returns `false` when no monitor is running for it; the caller then
    /// has to finalize the record itself.
    pub async fn deliver(&self, generation_id: &GenerationId, result: PollResult) -> bool {
        let Some(sender) = self.pushed.lock().await.get(generation_id).cloned() else {
            return false;
        };
        match sender.try_send(result) {
            Ok(()) => true,
            // The monitor is alive and will read the provider itself.
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        }
    }

    async fn poll_until_done(
        &self,
        generation_id: GenerationId,
        user_id: UserId,
        job: &JobHandle,
        pushed: &mut mpsc::Receiver<PollResult>,
    ) -> PollOutcome {
        let client = match self.registry.get(job.provider) {
            Ok(client) => client,
            Err(err) => return PollOutcome::Failed(GenerationError::Configuration(err.to_string())),
        };

        let mut last = GenerationStatus::Generating;
        for attempt in 1..=self.config.max_attempts {
            let early = tokio::select! {
                () = tokio::time::sleep(self.config.interval) => None,
                Some(result) = pushed.recv() => Some(result),
            };

            let result = if let Some(result) = early {
                tracing::debug!(
                    generation_id = %generation_id,
                    status = %result.status,
                    "Using pushed task status"
                );
                result
            } else {
                let polled = {
                    let _permit = match &self.permits {
                        Some(permits) => permits.acquire().await.ok(),
                        None => None,
                    };
                    client.poll_status(&job.task_id).await
                };

                match polled {
                    Ok(result) => result,
                    Err(err) if err.is_transient() => {
                        tracing::warn!(
                            generation_id = %generation_id,
                            task_id = %job.task_id,
                            attempt,
                            error = %err,
                            "Transient poll failure"
                        );
                        continue;
                    }
                    Err(err) => {
                        return PollOutcome::Failed(GenerationError::ProviderTerminalFailure {
                            message: err.to_string(),
                        });
                    }
                }
            };

            if result.status != last && !result.is_terminal() {
                self.publish(StatusEvent::now(generation_id, user_id, result.status));
            }
            last = result.status;

            match result.status {
                GenerationStatus::Completed if result.outputs.is_empty() => {
                    return PollOutcome::Failed(GenerationError::ProviderTerminalFailure {
                        message: "provider reported success without outputs".into(),
                    });
                }
                GenerationStatus::Completed => return PollOutcome::Completed(result.outputs),
                GenerationStatus::Failed => {
                    return PollOutcome::Failed(GenerationError::ProviderTerminalFailure {
                        message: result
                            .error
                            .unwrap_or_else(|| "provider reported failure".into()),
                    });
                }
                GenerationStatus::Queued | GenerationStatus::Generating => {
                    tracing::debug!(
                        generation_id = %generation_id,
                        attempt,
                        status = %result.status,
                        "Job still running"
                    );
                }
            }
        }

        tracing::warn!(
            generation_id = %generation_id,
            task_id = %job.task_id,
            attempts = self.config.max_attempts,
            "Job timed out"
        );
        PollOutcome::Failed(GenerationError::Timeout {
            attempts: self.config.max_attempts,
        })
    }

    /// Run `monitor` as a tracked task for `generation_id`.
    ///
    /// The task removes itself from the registry when it finishes.
    pub async fn spawn_monitor<F>(self: &Arc<Self>, generation_id: GenerationId, monitor: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut monitors = self.monitors.lock().await;
        let poller = Arc::clone(self);
        let handle = tokio::spawn(async move {
            monitor.await;
            poller.monitors.lock().await.remove(&generation_id);
        });
        monitors.insert(generation_id, handle);
    }

    /// Number of monitors still running.
    pub async fn active(&self) -> usize {
        self.monitors.lock().await.len()
    }

    /// Whether a monitor is running for `generation_id`.
    pub async fn is_monitoring(&self, generation_id: &GenerationId) -> bool {
        self.monitors.lock().await.contains_key(generation_id)
    }

    /// Abort every monitor and wait for them to stop.
    pub async fn shutdown(&self) {
        self.pushed.lock().await.clear();
        let handles: Vec<_> = self.monitors.lock().await.drain().map(|(_, h)| h).collect();
        if handles.is_empty() {
            return;
        }
        tracing::info!(monitors = handles.len(), "Stopping job monitors");
        for handle in &handles {
            handle.abort();
        }
        futures::future::join_all(handles).await;
    }
}
