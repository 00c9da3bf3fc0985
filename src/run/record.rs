//! The durable run record and its status state machine.

use chrono::{DateTime, Duration, Utc};

use crate::params::Params;

/// Unique identifier for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(pub i64);

/// Status of a run.
///
/// `Pausing` and `Cancelling` are operator requests recorded on the row
/// and honored by the executor at the next batch boundary. `Interrupted`
/// marks a run whose host process shut down mid-batch; it is re-enqueued
/// automatically at worker startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStatus {
    Enqueued,
    Running,
    Pausing,
    Paused,
    Interrupted,
    Cancelling,
    Cancelled,
    Succeeded,
    Errored,
}

impl RunStatus {
    /// Stable string form stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Running => "running",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Interrupted => "interrupted",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Succeeded => "succeeded",
            Self::Errored => "errored",
        }
    }

    /// Parse the stored string form.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "enqueued" => Some(Self::Enqueued),
            "running" => Some(Self::Running),
            "pausing" => Some(Self::Pausing),
            "paused" => Some(Self::Paused),
            "interrupted" => Some(Self::Interrupted),
            "cancelling" => Some(Self::Cancelling),
            "cancelled" => Some(Self::Cancelled),
            "succeeded" => Some(Self::Succeeded),
            "errored" => Some(Self::Errored),
            _ => None,
        }
    }

    /// True for statuses that count toward the one-active-run-per-task
    /// invariant.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Enqueued
                | Self::Running
                | Self::Pausing
                | Self::Paused
                | Self::Interrupted
                | Self::Cancelling
        )
    }

    /// True for final statuses that never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Cancelled | Self::Errored)
    }

    /// Whether moving from `self` to `to` is a legal transition.
    pub fn can_transition_to(&self, to: RunStatus) -> bool {
        use RunStatus::*;
        match self {
            Enqueued => matches!(to, Running | Pausing | Paused | Cancelling | Cancelled),
            // Running may return to Enqueued: a budget-exceeded
            // invocation hands the run back to the queue.
            Running => {
                matches!(to, Succeeded | Errored | Interrupted | Pausing | Cancelling | Enqueued)
            }
            Pausing => matches!(to, Paused | Succeeded | Errored | Cancelling | Interrupted),
            Paused => matches!(to, Enqueued | Cancelled),
            Interrupted => matches!(to, Enqueued | Cancelled),
            Cancelling => matches!(to, Cancelled | Errored),
            Succeeded | Cancelled | Errored => false,
        }
    }
}

/// Diagnostic detail captured when a run errors.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorInfo {
    /// Root cause description (Rust has no exception classes; the chain
    /// root is the closest analogue).
    pub class: String,
    /// Full error chain.
    pub message: String,
    /// Captured backtrace lines, possibly empty.
    pub backtrace: Vec<String>,
}

impl ErrorInfo {
    /// Capture class/message/backtrace from an error.
    pub fn capture(err: &anyhow::Error) -> Self {
        Self {
            class: err.root_cause().to_string(),
            message: format!("{err:#}"),
            backtrace: err
                .backtrace()
                .to_string()
                .lines()
                .map(str::to_string)
                .collect(),
        }
    }
}

/// One durable execution attempt of a task.
#[derive(Debug, Clone)]
pub struct Run {
    pub id: RunId,
    pub task_name: String,
    pub status: RunStatus,
    /// Encoded resume position; `None` before the first persisted tick.
    pub cursor: Option<String>,
    /// Items processed so far.
    pub tick_count: i64,
    /// Estimated total, when the task provides one.
    pub tick_total: Option<i64>,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    pub backtrace: Option<String>,
    /// Parameters frozen for this attempt.
    pub params: Params,
    /// Identifier of the most recently scheduled unit of work.
    pub job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Fraction complete, when a total estimate exists.
    pub fn progress(&self) -> Option<f64> {
        match self.tick_total {
            Some(total) if total > 0 => Some((self.tick_count as f64 / total as f64).min(1.0)),
            _ => None,
        }
    }

    /// True when a cancelling run has not been touched within `grace`,
    /// meaning its worker likely died without honoring the request. Such
    /// runs may be force-cancelled by a second cancel call.
    pub fn is_stuck(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.status == RunStatus::Cancelling && now - self.updated_at > grace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in [
            RunStatus::Enqueued,
            RunStatus::Running,
            RunStatus::Pausing,
            RunStatus::Paused,
            RunStatus::Interrupted,
            RunStatus::Cancelling,
            RunStatus::Cancelled,
            RunStatus::Succeeded,
            RunStatus::Errored,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_statuses_have_no_exits() {
        for terminal in [RunStatus::Succeeded, RunStatus::Cancelled, RunStatus::Errored] {
            assert!(terminal.is_terminal());
            for target in [
                RunStatus::Enqueued,
                RunStatus::Running,
                RunStatus::Paused,
                RunStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn test_lifecycle_paths() {
        assert!(RunStatus::Enqueued.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Pausing));
        assert!(RunStatus::Pausing.can_transition_to(RunStatus::Paused));
        assert!(RunStatus::Paused.can_transition_to(RunStatus::Enqueued));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Interrupted));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Enqueued));
        assert!(RunStatus::Interrupted.can_transition_to(RunStatus::Enqueued));
        assert!(RunStatus::Cancelling.can_transition_to(RunStatus::Cancelled));

        assert!(!RunStatus::Paused.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Enqueued.can_transition_to(RunStatus::Succeeded));
    }

    #[test]
    fn test_progress_fraction() {
        let mut run = sample_run();
        assert_eq!(run.progress(), None);

        run.tick_total = Some(200);
        run.tick_count = 50;
        assert_eq!(run.progress(), Some(0.25));

        // Estimates can undershoot; progress is clamped.
        run.tick_count = 300;
        assert_eq!(run.progress(), Some(1.0));
    }

    #[test]
    fn test_stuck_detection() {
        let mut run = sample_run();
        run.status = RunStatus::Cancelling;
        run.updated_at = Utc::now() - Duration::minutes(10);

        assert!(run.is_stuck(Utc::now(), Duration::minutes(5)));
        assert!(!run.is_stuck(Utc::now(), Duration::minutes(30)));

        run.status = RunStatus::Running;
        assert!(!run.is_stuck(Utc::now(), Duration::minutes(5)));
    }

    fn sample_run() -> Run {
        Run {
            id: RunId(1),
            task_name: "sample".to_string(),
            status: RunStatus::Enqueued,
            cursor: None,
            tick_count: 0,
            tick_total: None,
            error_class: None,
            error_message: None,
            backtrace: None,
            params: Params::new(),
            job_id: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            updated_at: Utc::now(),
        }
    }
}
