use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a task in its lifecycle.
///
/// ```text
/// NEW ──▶ RUNNING ──▶ FINISHED_OK | FINISHED_ERROR | CANCELED
///  │        │  ▲
///  │        ▼  │
///  │      FAILOVER ──▶ CANCELED
///  └──▶ CANCELED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    New,
    Running,
    Failover,
    Canceled,
    FinishedOk,
    FinishedError,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::New,
        TaskStatus::Running,
        TaskStatus::Failover,
        TaskStatus::Canceled,
        TaskStatus::FinishedOk,
        TaskStatus::FinishedError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::New => "NEW",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Failover => "FAILOVER",
            TaskStatus::Canceled => "CANCELED",
            TaskStatus::FinishedOk => "FINISHED_OK",
            TaskStatus::FinishedError => "FINISHED_ERROR",
        }
    }

    /// No transition leads out of a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Canceled | TaskStatus::FinishedOk | TaskStatus::FinishedError
        )
    }

    /// Statuses a task may be claimed from.
    pub fn is_runnable(&self) -> bool {
        matches!(self, TaskStatus::New | TaskStatus::Failover)
    }

    /// Statuses cancellation may be requested in.
    pub fn is_cancelable(&self) -> bool {
        matches!(
            self,
            TaskStatus::New | TaskStatus::Running | TaskStatus::Failover
        )
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (_, New) => false,
            (New, Running | Canceled) => true,
            (Running, Canceled | Failover | FinishedError | FinishedOk) => true,
            (Failover, Running | Canceled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown task status: {0}")]
pub struct ParseTaskStatusError(pub String);

impl FromStr for TaskStatus {
    type Err = ParseTaskStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| ParseTaskStatusError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskStatus::*;

    #[test]
    fn allowed_transitions() {
        let allowed = [
            (New, Running),
            (New, Canceled),
            (Running, Canceled),
            (Running, Failover),
            (Running, FinishedError),
            (Running, FinishedOk),
            (Failover, Running),
            (Failover, Canceled),
        ];

        for from in TaskStatus::ALL {
            for to in TaskStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn terminal_statuses_have_no_way_out() {
        for status in [Canceled, FinishedOk, FinishedError] {
            assert!(status.is_terminal());
            assert!(TaskStatus::ALL
                .iter()
                .all(|next| !status.can_transition_to(*next)));
        }
        assert!(!New.is_terminal());
        assert!(!Running.is_terminal());
        assert!(!Failover.is_terminal());
    }

    #[test]
    fn nothing_goes_back_to_new() {
        for status in TaskStatus::ALL {
            assert!(!status.can_transition_to(New));
        }
    }

    #[test]
    fn parse_and_display() {
        for status in TaskStatus::ALL {
            assert_eq!(status.to_string().parse::<TaskStatus>(), Ok(status));
        }
        assert_eq!("finished_ok".parse::<TaskStatus>(), Ok(FinishedOk));
        assert_eq!(" failover ".parse::<TaskStatus>(), Ok(Failover));
        assert!("DONE".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn serde_uses_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&FinishedError).unwrap(),
            "\"FINISHED_ERROR\""
        );
        let status: TaskStatus = serde_json::from_str("\"CANCELED\"").unwrap();
        assert_eq!(status, Canceled);
    }
}
