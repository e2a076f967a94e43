//! Run and task state vocabulary plus the aggregate run-state machine.
//!
//! A run's state is always derivable from the multiset of its computational
//! task states — the aggregation is deterministic and order-independent, so
//! every scheduling pass can recompute it from stored rows alone.
//!
//! Typical task lifecycle:
//! NotStarted (authoring) -> Published (run requested) -> Pending (submitted)
//! -> Started (worker picked it up) -> Success/Failed, or Aborted (cancelled).
//! WaitingForCluster is only entered while an on-demand cluster is being
//! provisioned.

use serde::{Deserialize, Serialize};

/// Aggregate state of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Published,
    Pending,
    WaitingForCluster,
    Started,
    Success,
    Failed,
    Aborted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Published => "PUBLISHED",
            Self::Pending => "PENDING",
            Self::WaitingForCluster => "WAITING_FOR_CLUSTER",
            Self::Started => "STARTED",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PUBLISHED" => Ok(Self::Published),
            "PENDING" => Ok(Self::Pending),
            "WAITING_FOR_CLUSTER" => Ok(Self::WaitingForCluster),
            "STARTED" => Ok(Self::Started),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "ABORTED" => Ok(Self::Aborted),
            other => Err(format!("unknown run state: {other}")),
        }
    }
}

/// State of one task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Authoring-time state, before any run was requested.
    NotStarted,
    Published,
    Pending,
    WaitingForCluster,
    Started,
    Success,
    Failed,
    Aborted,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Aborted)
    }

    /// Task has been handed to the backend and needs a status poll.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Pending | Self::WaitingForCluster | Self::Started)
    }

    /// Task still counts toward the run's outcome (submitted or submittable).
    pub fn is_unsettled(self) -> bool {
        matches!(
            self,
            Self::Published | Self::Pending | Self::WaitingForCluster | Self::Started
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Published => "PUBLISHED",
            Self::Pending => "PENDING",
            Self::WaitingForCluster => "WAITING_FOR_CLUSTER",
            Self::Started => "STARTED",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_STARTED" => Ok(Self::NotStarted),
            "PUBLISHED" => Ok(Self::Published),
            "PENDING" => Ok(Self::Pending),
            "WAITING_FOR_CLUSTER" => Ok(Self::WaitingForCluster),
            "STARTED" => Ok(Self::Started),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "ABORTED" => Ok(Self::Aborted),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

/// Raw status vocabulary of the remote execution backend.
///
/// `PendingOrStarted` exists because the backend cannot distinguish a queued
/// task from one a worker already accepted; the first progress event is what
/// settles the question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendTaskState {
    Pending,
    PendingOrStarted,
    Success,
    Erred,
    Aborted,
    Lost,
}

/// Tally of task states used by the aggregation rule.
#[derive(Debug, Default, Clone, Copy)]
struct StateTally {
    total: usize,
    published: usize,
    pending: usize,
    waiting_for_cluster: usize,
    started: usize,
    success: usize,
    failed: usize,
    aborted: usize,
}

impl StateTally {
    fn count(states: &[TaskState]) -> Self {
        let mut tally = Self {
            total: states.len(),
            ..Self::default()
        };
        for state in states {
            match state {
                TaskState::NotStarted | TaskState::Published => tally.published += 1,
                TaskState::Pending => tally.pending += 1,
                TaskState::WaitingForCluster => tally.waiting_for_cluster += 1,
                TaskState::Started => tally.started += 1,
                TaskState::Success => tally.success += 1,
                TaskState::Failed => tally.failed += 1,
                TaskState::Aborted => tally.aborted += 1,
            }
        }
        tally
    }

    fn unsettled(&self) -> usize {
        self.published + self.pending + self.waiting_for_cluster + self.started
    }
}

/// Compute the run's aggregate state from its computational task states.
///
/// A `Failed` task does not finalize the run while sibling tasks are still
/// unsettled; the run keeps reflecting the most progressed task until
/// everything settles.
pub fn aggregate_run_state(states: &[TaskState], cancellation_requested: bool) -> RunState {
    let tally = StateTally::count(states);

    // A pipeline with no computational tasks can never progress.
    if tally.total == 0 {
        return RunState::Aborted;
    }
    if tally.failed > 0 && tally.unsettled() == 0 {
        return RunState::Failed;
    }
    if cancellation_requested && tally.started == 0 {
        return RunState::Aborted;
    }
    if tally.success == tally.total {
        return RunState::Success;
    }
    if tally.aborted > 0 && tally.unsettled() == 0 {
        return RunState::Aborted;
    }
    if tally.started > 0 {
        return RunState::Started;
    }
    if tally.waiting_for_cluster > 0 {
        return RunState::WaitingForCluster;
    }
    if tally.pending > 0 {
        return RunState::Pending;
    }
    RunState::Published
}

fn readiness_rank(state: RunState) -> u8 {
    match state {
        RunState::Published => 0,
        RunState::Pending => 1,
        RunState::WaitingForCluster => 2,
        RunState::Started => 3,
        RunState::Success | RunState::Failed | RunState::Aborted => 4,
    }
}

/// Aggregate the task states and keep the run from regressing: once a run
/// advanced along the readiness order it only moves forward, except that a
/// terminal aggregate always wins.
pub fn advance_run_state(
    current: RunState,
    states: &[TaskState],
    cancellation_requested: bool,
) -> RunState {
    let aggregated = aggregate_run_state(states, cancellation_requested);
    if aggregated.is_terminal() || current.is_terminal() {
        return aggregated;
    }
    if readiness_rank(aggregated) >= readiness_rank(current) {
        aggregated
    } else {
        current
    }
}
