//! Remote task observation.
//!
//! [`TaskMonitor`] polls a task until it reaches a terminal state, logs
//! progress changes, and answers blocking VM questions through an
//! injected [`QuestionResolver`]. A failed remote task is a
//! [`TaskOutcome::Failed`], never an `Err`; errors are reserved for the
//! transport and for invalid answers.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{VctError, VctResult};
use crate::remote::RemoteSession;
use crate::types::{ManagedObjectRef, Question, TaskRef, TaskState, VimConfig};

/// Report line printed when a task succeeds.
pub const SUCCESS_MESSAGE: &str = "task successfully completed.";

// ─── Question resolvers ──────────────────────────────────────────────────────

/// Picks an answer for a question raised by a running task.
#[async_trait::async_trait]
pub trait QuestionResolver: Send + Sync {
    /// Return the key of the chosen answer.
    async fn resolve(&self, question: &Question) -> VctResult<i32>;
}

/// The question's default choice, else its first choice.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultChoiceResolver;

#[async_trait::async_trait]
impl QuestionResolver for DefaultChoiceResolver {
    async fn resolve(&self, question: &Question) -> VctResult<i32> {
        question
            .default_key
            .or_else(|| question.choices.first().map(|c| c.key))
            .ok_or_else(|| {
                VctError::invalid_answer(format!("Question '{}' offers no choices", question.id))
            })
    }
}

/// Always answers with the same key.
#[derive(Debug, Clone, Copy)]
pub struct FixedChoiceResolver(pub i32);

#[async_trait::async_trait]
impl QuestionResolver for FixedChoiceResolver {
    async fn resolve(&self, _question: &Question) -> VctResult<i32> {
        Ok(self.0)
    }
}

/// Wraps a closure, e.g. one that prompts on a terminal.
pub struct FnResolver<F>(pub F);

#[async_trait::async_trait]
impl<F> QuestionResolver for FnResolver<F>
where
    F: Fn(&Question) -> VctResult<i32> + Send + Sync,
{
    async fn resolve(&self, question: &Question) -> VctResult<i32> {
        (self.0)(question)
    }
}

// ─── Options / outcome ───────────────────────────────────────────────────────

/// Polling behaviour of a [`TaskMonitor`].
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub poll_interval: Duration,
    /// Stop watching (not the task) after this long.
    pub timeout: Option<Duration>,
    /// Stop watching once this flips to `true`.
    pub cancel: Option<watch::Receiver<bool>>,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: None,
            cancel: None,
        }
    }
}

impl MonitorOptions {
    pub fn from_config(config: &VimConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            timeout: config.task_timeout_secs.map(Duration::from_secs),
            cancel: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    /// Remote error message, verbatim
    Failed(String),
    TimedOut,
    Cancelled,
}

impl TaskOutcome {
    fn tag(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed(_) => "error",
            Self::TimedOut => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// What the monitor saw while watching one task.
#[derive(Debug, Clone)]
pub struct TaskReport {
    /// `None` for operations that complete without a remote task.
    pub task: Option<TaskRef>,
    pub outcome: TaskOutcome,
    /// Distinct progress percentages, in the order they were reported
    pub progress_updates: Vec<u8>,
    pub questions_answered: usize,
    pub elapsed: Duration,
}

impl TaskReport {
    /// Report for an operation that finished synchronously.
    pub fn immediate_success() -> Self {
        Self {
            task: None,
            outcome: TaskOutcome::Success,
            progress_updates: Vec::new(),
            questions_answered: 0,
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == TaskOutcome::Success
    }

    pub fn message(&self) -> String {
        match &self.outcome {
            TaskOutcome::Success => SUCCESS_MESSAGE.to_string(),
            TaskOutcome::Failed(msg) => msg.clone(),
            TaskOutcome::TimedOut => {
                format!("stopped watching after {:.1}s; task may still be running", self.elapsed.as_secs_f64())
            }
            TaskOutcome::Cancelled => "stopped watching on request; task may still be running".to_string(),
        }
    }
}

impl fmt::Display for TaskReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] | {}", self.outcome.tag(), self.message())
    }
}

// ─── Monitor ─────────────────────────────────────────────────────────────────

pub struct TaskMonitor<'a> {
    session: &'a dyn RemoteSession,
    resolver: &'a dyn QuestionResolver,
    options: MonitorOptions,
}

impl<'a> TaskMonitor<'a> {
    pub fn new(
        session: &'a dyn RemoteSession,
        resolver: &'a dyn QuestionResolver,
        options: MonitorOptions,
    ) -> Self {
        Self { session, resolver, options }
    }

    /// Watch `task` until it leaves the running state.
    ///
    /// With `question_handling` on, questions pending on `target` are
    /// answered once each. Without a target there is nothing to answer,
    /// so pending questions are only logged.
    pub async fn monitor(
        &self,
        task: &TaskRef,
        question_handling: bool,
        target: Option<&ManagedObjectRef>,
    ) -> VctResult<TaskReport> {
        let started = Instant::now();
        let deadline = self.options.timeout.map(|t| started + t);
        let mut cancel = self.options.cancel.clone();

        let mut progress_updates = Vec::new();
        let mut last_progress: Option<u8> = None;
        let mut answered: HashSet<String> = HashSet::new();
        let mut reraised: HashSet<String> = HashSet::new();
        let mut warned_no_target = false;

        let poll_target = if question_handling { target } else { None };

        let outcome = loop {
            if cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false) {
                break TaskOutcome::Cancelled;
            }

            let snap = self.session.task_snapshot(task, poll_target).await?;
            match snap.state {
                TaskState::Success => break TaskOutcome::Success,
                TaskState::Error => {
                    let msg = snap
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "task failed without an error message".to_string());
                    break TaskOutcome::Failed(msg);
                }
                TaskState::Running => {}
            }

            if let Some(pct) = snap.progress_pct() {
                if last_progress != Some(pct) {
                    log::info!("[{}] {task} {pct}%", TaskState::Running.as_str());
                    progress_updates.push(pct);
                    last_progress = Some(pct);
                }
            }

            if let Some(question) = snap.pending_question.as_ref() {
                match (question_handling, target) {
                    (true, Some(vm)) if !answered.contains(&question.id) => {
                        self.answer(vm, question).await?;
                        answered.insert(question.id.clone());
                    }
                    (true, Some(vm)) => {
                        if reraised.insert(question.id.clone()) {
                            log::warn!(
                                "Question '{}' on {} is still pending after it was answered; not answering again",
                                question.id,
                                vm.value
                            );
                        }
                    }
                    (true, None) => {
                        if !warned_no_target {
                            log::warn!("Question '{}' pending on {task} but no target VM to answer it", question.id);
                            warned_no_target = true;
                        }
                    }
                    (false, _) => {
                        log::debug!("Question '{}' pending on {task}; answering disabled", question.id);
                    }
                }
            }

            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                break TaskOutcome::TimedOut;
            }
            let wake = match deadline {
                Some(d) => d.min(now + self.options.poll_interval),
                None => now + self.options.poll_interval,
            };

            if let Some(rx) = cancel.as_mut() {
                let mut sender_gone = false;
                tokio::select! {
                    biased;

                    result = rx.changed() => {
                        if result.is_err() {
                            sender_gone = true;
                        }
                    }

                    _ = tokio::time::sleep_until(wake) => {}
                }
                if sender_gone {
                    // Nobody can cancel any more; finish the interval and stop watching the channel.
                    cancel = None;
                    tokio::time::sleep_until(wake).await;
                }
            } else {
                tokio::time::sleep_until(wake).await;
            }
        };

        let report = TaskReport {
            task: Some(task.clone()),
            outcome,
            progress_updates,
            questions_answered: answered.len(),
            elapsed: started.elapsed(),
        };
        match report.outcome {
            TaskOutcome::Success | TaskOutcome::Failed(_) => log::info!("{report}"),
            TaskOutcome::TimedOut | TaskOutcome::Cancelled => log::warn!("{task}: {report}"),
        }
        Ok(report)
    }

    async fn answer(&self, vm: &ManagedObjectRef, question: &Question) -> VctResult<()> {
        log::info!("Question '{}' on {vm}: {}", question.id, question.text);
        let key = self.resolver.resolve(question).await?;
        let label = question.label_of(key).ok_or_else(|| {
            VctError::invalid_answer(format!(
                "Answer {key} is not one of the choices offered by question '{}'",
                question.id
            ))
        })?;
        log::info!("Answering question '{}' with {key} ({label})", question.id);
        self.session.answer_question(vm, &question.id, key).await
    }
}
