//! Single-slot question arbitration.
//!
//! An external publisher posts at most one pending question at a time. Many
//! inference tasks run concurrently, and exactly one of them must answer it.
//! The slot moves through four states:
//!
//! ```text
//!   publish         try_pre_assign      acquire(task)
//! Empty ──► Available ───────► PreAssigned ───────► Claimed(task)
//!   ▲           ▲                                     │
//!   │           └──────── release(task, false) ───────┤
//!   └──────────────────── release(task, true) ────────┘
//! ```
//!
//! `try_pre_assign` commits the question to the next task before that task
//! has an id, and hands back a single-use [`PreAssignment`] ticket. Only the
//! holder of the current ticket can `acquire`, so two tasks can never both
//! claim the question. `Available` and `PreAssigned` questions that sit longer
//! than the configured timeout are expired back to `Empty`.
//!
//! Every transition runs under one mutex and performs no I/O.

pub mod poll;

use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::TaskId;

pub use poll::QuestionPoller;

/// Default time an unclaimed question may wait before it is abandoned.
pub const DEFAULT_QUESTION_TIMEOUT_SECS: u64 = 30;

/// Observable registry state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AssignmentState {
    Empty,
    Available,
    PreAssigned,
    Claimed { task_id: TaskId },
}

/// Read-only diagnostic snapshot.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QuestionStatus {
    pub has_question: bool,
    #[serde(flatten)]
    pub state: AssignmentState,
    pub age_secs: f64,
    pub text: Option<String>,
}

/// Commitment of the pending question to the next task that asks.
///
/// Consumed by [`QuestionRegistry::acquire`]. A ticket whose pre-assignment
/// expired, or was superseded, acquires nothing.
#[must_use = "an unused pre-assignment holds the question until it expires"]
#[derive(Debug, PartialEq, Eq)]
pub struct PreAssignment {
    ticket: u64,
}

/// A question successfully claimed by a task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimedQuestion {
    pub task_id: TaskId,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishRejected {
    /// The slot already holds a question; the publisher must wait.
    SlotBusy(AssignmentState),
    BlankQuestion,
}

impl std::fmt::Display for PublishRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishRejected::SlotBusy(state) => {
                write!(f, "question slot busy ({})", describe(*state))
            }
            PublishRejected::BlankQuestion => write!(f, "question text is blank"),
        }
    }
}

impl std::error::Error for PublishRejected {}

/// Protocol violations. These indicate a bug in the caller, never a
/// recoverable runtime condition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// Release by a task that does not own the claim.
    NotOwner { task_id: TaskId, owner: TaskId },
    /// Release while no claim is outstanding (including double release).
    NotClaimed {
        task_id: TaskId,
        state: AssignmentState,
    },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::NotOwner { task_id, owner } => write!(
                f,
                "task {} released a question claimed by task {}",
                task_id, owner
            ),
            RegistryError::NotClaimed { task_id, state } => write!(
                f,
                "task {} released a question that is not claimed ({})",
                task_id,
                describe(*state)
            ),
        }
    }
}

impl std::error::Error for RegistryError {}

fn describe(state: AssignmentState) -> String {
    match state {
        AssignmentState::Empty => "empty".to_string(),
        AssignmentState::Available => "available".to_string(),
        AssignmentState::PreAssigned => "pre-assigned".to_string(),
        AssignmentState::Claimed { task_id } => format!("claimed by task {}", task_id),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Holder {
    Available,
    PreAssigned { ticket: u64 },
    Claimed { task_id: TaskId },
}

#[derive(Debug)]
struct QuestionRecord {
    text: String,
    created_at: Instant,
    holder: Holder,
    /// When `holder` last changed. Expiry is measured from here.
    since: Instant,
}

impl QuestionRecord {
    fn state(&self) -> AssignmentState {
        match self.holder {
            Holder::Available => AssignmentState::Available,
            Holder::PreAssigned { .. } => AssignmentState::PreAssigned,
            Holder::Claimed { task_id } => AssignmentState::Claimed { task_id },
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    record: Option<QuestionRecord>,
    next_ticket: u64,
}

impl Slot {
    fn state(&self) -> AssignmentState {
        self.record
            .as_ref()
            .map_or(AssignmentState::Empty, QuestionRecord::state)
    }
}

#[derive(Debug)]
pub struct QuestionRegistry {
    slot: Mutex<Slot>,
    timeout: Duration,
}

impl QuestionRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Every transition leaves the slot consistent, so a poisoned lock is
    /// still safe to reuse.
    fn lock(&self) -> MutexGuard<'_, Slot> {
        let mut slot = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.expire_locked(&mut slot, Instant::now());
        slot
    }

    fn expire_locked(&self, slot: &mut Slot, now: Instant) -> bool {
        let stale = match slot.record.as_ref() {
            Some(record) => {
                !matches!(record.holder, Holder::Claimed { .. })
                    && now.saturating_duration_since(record.since) >= self.timeout
            }
            None => false,
        };
        if stale {
            if let Some(record) = slot.record.take() {
                log::warn!(
                    "question expired unclaimed after {:.1}s ({}): {:?}",
                    now.saturating_duration_since(record.since).as_secs_f64(),
                    describe(record.state()),
                    record.text
                );
            }
        }
        stale
    }

    /// Post a new question. Only accepted while the slot is empty.
    pub fn publish(&self, text: impl Into<String>) -> Result<(), PublishRejected> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(PublishRejected::BlankQuestion);
        }
        let mut slot = self.lock();
        if slot.record.is_some() {
            return Err(PublishRejected::SlotBusy(slot.state()));
        }
        log::info!("question published: {:?}", text);
        let now = Instant::now();
        slot.record = Some(QuestionRecord {
            text,
            created_at: now,
            holder: Holder::Available,
            since: now,
        });
        Ok(())
    }

    /// Commit the available question to the next task that asks.
    pub fn try_pre_assign(&self) -> Option<PreAssignment> {
        let mut slot = self.lock();
        let ticket = slot.next_ticket;
        let record = slot.record.as_mut()?;
        if record.holder != Holder::Available {
            return None;
        }
        record.holder = Holder::PreAssigned { ticket };
        record.since = Instant::now();
        slot.next_ticket += 1;
        Some(PreAssignment { ticket })
    }

    /// Confirm a pre-assignment for a concrete task.
    pub fn acquire(&self, assignment: PreAssignment, task_id: TaskId) -> Option<ClaimedQuestion> {
        let mut slot = self.lock();
        let Some(record) = slot.record.as_mut() else {
            log::debug!("task {} pre-assignment lapsed: slot empty", task_id);
            return None;
        };
        if record.holder != (Holder::PreAssigned { ticket: assignment.ticket }) {
            log::debug!(
                "task {} pre-assignment lapsed: slot is {}",
                task_id,
                describe(record.state())
            );
            return None;
        }
        record.holder = Holder::Claimed { task_id };
        record.since = Instant::now();
        log::info!("task {} claimed question {:?}", task_id, record.text);
        Some(ClaimedQuestion {
            task_id,
            text: record.text.clone(),
        })
    }

    /// Pre-assign and acquire in one step for a task that already has an id.
    pub fn claim(&self, task_id: TaskId) -> Option<ClaimedQuestion> {
        let assignment = self.try_pre_assign()?;
        self.acquire(assignment, task_id)
    }

    /// Finish a claim. Success consumes the question; failure makes it
    /// claimable again by a later task.
    pub fn release(&self, task_id: TaskId, success: bool) -> Result<(), RegistryError> {
        let mut slot = self.lock();
        let state = slot.state();
        let result = match slot.record.as_ref().map(|record| record.holder) {
            Some(Holder::Claimed { task_id: owner }) if owner == task_id => {
                if success {
                    if let Some(record) = slot.record.take() {
                        log::info!("task {} answered question {:?}", task_id, record.text);
                    }
                } else if let Some(record) = slot.record.as_mut() {
                    log::warn!(
                        "task {} failed; question {:?} is available again",
                        task_id,
                        record.text
                    );
                    record.holder = Holder::Available;
                    record.since = Instant::now();
                }
                Ok(())
            }
            Some(Holder::Claimed { task_id: owner }) => {
                Err(RegistryError::NotOwner { task_id, owner })
            }
            _ => Err(RegistryError::NotClaimed { task_id, state }),
        };
        if let Err(err) = &result {
            log::error!("question registry protocol violation: {}", err);
        }
        result
    }

    /// Drop an abandoned question. Returns true if one was expired.
    pub fn expire_stale(&self) -> bool {
        let mut slot = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.expire_locked(&mut slot, Instant::now())
    }

    /// Forcibly empty the slot, returning the discarded question text.
    pub fn clear(&self) -> Option<String> {
        let mut slot = self.lock();
        slot.record.take().map(|record| record.text)
    }

    pub fn state(&self) -> AssignmentState {
        self.lock().state()
    }

    pub fn status(&self) -> QuestionStatus {
        let slot = self.lock();
        match slot.record.as_ref() {
            Some(record) => QuestionStatus {
                has_question: true,
                state: record.state(),
                age_secs: record.created_at.elapsed().as_secs_f64(),
                text: Some(record.text.clone()),
            },
            None => QuestionStatus {
                has_question: false,
                state: AssignmentState::Empty,
                age_secs: 0.0,
                text: None,
            },
        }
    }
}

impl Default for QuestionRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_QUESTION_TIMEOUT_SECS))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
