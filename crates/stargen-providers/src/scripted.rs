//! Scripted provider.
//!
//! Plays back queued outcomes in order. With nothing queued it behaves like
//! a well-mannered asynchronous backend: dispatch hands out a task id and
//! the task completes after a fixed number of polls. The service runs this
//! in mock mode; tests queue exact sequences.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use stargen_core::{OutputRef, ProviderKind};
use tokio::sync::Mutex;

use crate::client::ProviderClient;
use crate::error::{ProviderError, Result};
use crate::types::{DispatchOutcome, GenerateRequest, PollResult};

/// Polls a default task takes before it completes.
pub const DEFAULT_POLLS_TO_COMPLETE: u32 = 2;

#[derive(Default)]
struct Script {
    dispatches: VecDeque<Result<DispatchOutcome>>,
    polls: VecDeque<Result<PollResult>>,
    requests: Vec<GenerateRequest>,
    poll_calls: HashMap<String, u32>,
}

/// A provider that plays back programmed outcomes.
pub struct ScriptedProvider {
    kind: ProviderKind,
    polls_to_complete: u32,
    next_task: AtomicU64,
    script: Mutex<Script>,
}

impl ScriptedProvider {
    /// A scripted stand-in for `kind`.
    #[must_use]
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            polls_to_complete: DEFAULT_POLLS_TO_COMPLETE,
            next_task: AtomicU64::new(1),
            script: Mutex::new(Script::default()),
        }
    }

    /// Change how many polls an unscripted task takes.
    #[must_use]
    pub fn with_polls_to_complete(mut self, polls: u32) -> Self {
        self.polls_to_complete = polls;
        self
    }

    /// Queue the result of the next `generate` call.
    pub async fn push_dispatch(&self, outcome: Result<DispatchOutcome>) {
        self.script.lock().await.dispatches.push_back(outcome);
    }

    /// Queue the result of the next `poll_status` call.
    pub async fn push_poll(&self, result: Result<PollResult>) {
        self.script.lock().await.polls.push_back(result);
    }

    /// Queue several poll results.
    pub async fn push_polls(&self, results: impl IntoIterator<Item = PollResult>) {
        self.script
            .lock()
            .await
            .polls
            .extend(results.into_iter().map(Ok));
    }

    /// Requests received so far.
    pub async fn requests(&self) -> Vec<GenerateRequest> {
        self.script.lock().await.requests.clone()
    }

    /// Total `poll_status` calls for a task.
    pub async fn poll_count(&self, task_id: &str) -> u32 {
        self.script
            .lock()
            .await
            .poll_calls
            .get(task_id)
            .copied()
            .unwrap_or(0)
    }

    fn placeholder_output(task_id: &str) -> OutputRef {
        OutputRef::new(format!("https://mock.stargen.invalid/{task_id}.png"))
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<DispatchOutcome> {
        let mut script = self.script.lock().await;
        script.requests.push(request.clone());

        if let Some(outcome) = script.dispatches.pop_front() {
            if let Ok(DispatchOutcome::Submitted { task_id }) = &outcome {
                script.poll_calls.insert(task_id.clone(), 0);
            }
            return outcome;
        }

        let task_id = format!(
            "mock-{}-{}",
            self.kind.as_str(),
            self.next_task.fetch_add(1, Ordering::Relaxed)
        );
        script.poll_calls.insert(task_id.clone(), 0);
        tracing::debug!(task_id = %task_id, model = %request.api_model_id, "scripted task created");
        Ok(DispatchOutcome::Submitted { task_id })
    }

    async fn poll_status(&self, task_id: &str) -> Result<PollResult> {
        let mut script = self.script.lock().await;
        let Some(calls) = script.poll_calls.get_mut(task_id) else {
            return Err(ProviderError::UnknownTask {
                task_id: task_id.to_string(),
            });
        };
        *calls += 1;
        let calls = *calls;

        if let Some(result) = script.polls.pop_front() {
            return result;
        }

        Ok(if calls >= self.polls_to_complete {
            PollResult::completed(vec![Self::placeholder_output(task_id)])
        } else {
            PollResult::generating()
        })
    }
}
