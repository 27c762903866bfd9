use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use forge::*;
use parking_lot::Mutex;

/// How a scripted submission answers.
#[derive(Clone, Debug, PartialEq)]
pub enum SubmitStep {
    Accept,
    /// Accept and report an explicit output key.
    AcceptWithKey(String),
    Reject(String),
    Transport(String),
}

/// One scripted answer to a status poll.
#[derive(Clone, Debug, PartialEq)]
pub enum PollStep {
    Pending,
    Succeeded,
    /// Terminal status `failed` carrying one error title.
    Failed(String),
    Transient(String),
    Fatal(String),
}

impl PollStep {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            PollStep::Succeeded | PollStep::Failed(_) | PollStep::Fatal(_)
        )
    }

    fn answer(&self) -> Result<PollStatus, PollError> {
        match self {
            PollStep::Pending => Ok(PollStatus::new(PollStatus::RUNNING)),
            PollStep::Succeeded => Ok(PollStatus::new(PollStatus::SUCCEEDED)),
            PollStep::Failed(title) => {
                Ok(PollStatus::new("failed").with_error(title.clone()))
            }
            PollStep::Transient(message) => {
                Err(PollError::Transient(message.clone()))
            }
            PollStep::Fatal(message) => Err(PollError::Fatal(message.clone())),
        }
    }
}

/// Script of a single submit-and-poll attempt.
///
/// The last poll step repeats once the script runs out.
#[derive(Clone, Debug, PartialEq)]
pub struct ScriptedAttempt {
    pub submit: SubmitStep,
    pub polls: Vec<PollStep>,
}

impl ScriptedAttempt {
    pub fn accepted(polls: impl IntoIterator<Item = PollStep>) -> Self {
        Self {
            submit: SubmitStep::Accept,
            polls: polls.into_iter().collect(),
        }
    }

    pub fn succeeding() -> Self {
        Self::accepted([PollStep::Pending, PollStep::Succeeded])
    }

    pub fn failing(title: impl Into<String>) -> Self {
        Self::accepted([PollStep::Failed(title.into())])
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            submit: SubmitStep::Reject(reason.into()),
            polls: Vec::new(),
        }
    }
}

#[derive(Default)]
struct ClientState {
    /// Attempts not yet submitted, per sku.
    scripts: HashMap<String, VecDeque<ScriptedAttempt>>,
    /// Remaining polls per job status url.
    live: HashMap<String, VecDeque<PollStep>>,
    submits: HashMap<String, usize>,
    polls: usize,
    in_flight: usize,
    max_in_flight: usize,
}

/// Render API double driven by per-sku scripts.
///
/// A sku without a script accepts its submission and succeeds on the first
/// poll. In-flight counts submissions whose polling has not yet reached a
/// terminal answer.
#[derive(Clone, Default)]
pub struct ScriptedRenderClient {
    state: Arc<Mutex<ClientState>>,
}

impl ScriptedRenderClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an attempt script for `sku`. Attempts are consumed in order,
    /// one per submission.
    pub fn push_attempt(&self, sku: impl Into<String>, attempt: ScriptedAttempt) -> &Self {
        self.state
            .lock()
            .scripts
            .entry(sku.into())
            .or_default()
            .push_back(attempt);
        self
    }

    pub fn submit_count(&self, sku: &str) -> usize {
        self.state.lock().submits.get(sku).copied().unwrap_or_default()
    }

    pub fn total_submits(&self) -> usize {
        self.state.lock().submits.values().sum()
    }

    pub fn poll_count(&self) -> usize {
        self.state.lock().polls
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    pub fn assert_max_in_flight_le(&self, limit: usize) {
        let observed = self.max_in_flight();
        assert!(
            observed <= limit,
            "Expected at most {} jobs in flight, observed {}",
            limit,
            observed
        );
    }
}

#[async_trait]
impl RenderClient for ScriptedRenderClient {
    async fn submit(&self, request: &JobRequest) -> Result<Submission, SubmitError> {
        let mut state = self.state.lock();
        let attempt = state
            .scripts
            .get_mut(&request.sku)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| ScriptedAttempt::accepted([PollStep::Succeeded]));

        let count = state.submits.entry(request.sku.clone()).or_default();
        *count += 1;
        let job_status_url = format!(
            "scripted://render/{}/{}/{}",
            request.run_id, request.sku, count
        );

        let output_key = match attempt.submit {
            SubmitStep::Accept => None,
            SubmitStep::AcceptWithKey(key) => Some(key),
            SubmitStep::Reject(reason) => return Err(SubmitError::Rejected(reason)),
            SubmitStep::Transport(reason) => return Err(SubmitError::Transport(reason)),
        };

        state.live.insert(job_status_url.clone(), attempt.polls.into());
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);

        Ok(Submission {
            job_status_url,
            output_key,
        })
    }

    async fn poll(&self, job_status_url: &str) -> Result<PollStatus, PollError> {
        let mut state = self.state.lock();
        state.polls += 1;

        let Some(remaining) = state.live.get_mut(job_status_url) else {
            return Err(PollError::Fatal(format!("unknown job {}", job_status_url)));
        };
        let step = if remaining.len() > 1 {
            remaining.pop_front()
        } else {
            remaining.front().cloned()
        }
        .unwrap_or(PollStep::Succeeded);

        if step.is_terminal() {
            state.live.remove(job_status_url);
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        step.answer()
    }
}
