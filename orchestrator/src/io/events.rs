//! Progress events for observers (UI bridges, CLI) plus a tracing mirror.
//!
//! Publishing never blocks: a subscriber that falls behind the channel
//! capacity loses the oldest events and sees `RecvError::Lagged`.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::core::types::{FailureCategory, StoryStatus, VerificationFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Sprint,
    Breakdown,
    Contract,
    Coding,
    TestWriting,
    Verification,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Sprint => "sprint",
            Stage::Breakdown => "breakdown",
            Stage::Contract => "contract",
            Stage::Coding => "coding",
            Stage::TestWriting => "test_writing",
            Stage::Verification => "verification",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    SprintStarted {
        stories: usize,
        backup_id: Option<String>,
    },
    StoryStarted,
    StageCompleted {
        outcome: String,
        attempts: u32,
    },
    ConflictFlagged {
        explanation: String,
    },
    ContractViolation {
        task_id: String,
        violations: Vec<String>,
    },
    TaskFailed {
        task_id: String,
        category: FailureCategory,
        diagnostic: String,
    },
    VerificationResult {
        attempted: u32,
        passed: u32,
        failed: u32,
        reason: Option<VerificationFailure>,
    },
    StoryFinished {
        status: StoryStatus,
        category: Option<FailureCategory>,
    },
    SprintFinished {
        done: usize,
        failed: usize,
        cancelled: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub sprint_id: u32,
    pub story_id: Option<String>,
    pub stage: Stage,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Broadcast channel of [`ProgressEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ProgressEvent) {
        mirror(&event);
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

fn mirror(event: &ProgressEvent) {
    let story = event.story_id.as_deref().unwrap_or("-");
    let stage = event.stage.as_str();
    match &event.kind {
        EventKind::SprintStarted { stories, backup_id } => {
            info!(sprint = event.sprint_id, stories, backup_id = ?backup_id, "sprint started");
        }
        EventKind::StoryStarted => info!(sprint = event.sprint_id, story, "story started"),
        EventKind::StageCompleted { outcome, attempts } => {
            info!(sprint = event.sprint_id, story, stage, outcome, attempts, "stage completed");
        }
        EventKind::ConflictFlagged { explanation } => {
            warn!(sprint = event.sprint_id, story, explanation, "architectural conflict flagged");
        }
        EventKind::ContractViolation {
            task_id,
            violations,
        } => {
            warn!(sprint = event.sprint_id, story, task_id, violations = ?violations, "contract violation");
        }
        EventKind::TaskFailed {
            task_id,
            category,
            diagnostic,
        } => {
            warn!(sprint = event.sprint_id, story, task_id, category = category.as_str(), diagnostic, "task failed");
        }
        EventKind::VerificationResult {
            attempted,
            passed,
            failed,
            reason,
        } => {
            info!(sprint = event.sprint_id, story, attempted, passed, failed, reason = ?reason, "verification result");
        }
        EventKind::StoryFinished { status, category } => {
            info!(sprint = event.sprint_id, story, status = status.as_str(), category = ?category, "story finished");
        }
        EventKind::SprintFinished {
            done,
            failed,
            cancelled,
        } => {
            info!(sprint = event.sprint_id, done, failed, cancelled, "sprint finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn event(n: usize) -> ProgressEvent {
        ProgressEvent {
            sprint_id: 1,
            story_id: None,
            stage: Stage::Sprint,
            kind: EventKind::SprintStarted {
                stories: n,
                backup_id: None,
            },
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        EventBus::new(4).publish(event(0));
    }

    #[test]
    fn slow_subscriber_loses_oldest_events() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for n in 0..4 {
            bus.publish(event(n));
        }
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Lagged(2))));
        assert_eq!(rx.try_recv().expect("third"), event(2));
        assert_eq!(rx.try_recv().expect("fourth"), event(3));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let value = serde_json::to_value(ProgressEvent {
            sprint_id: 2,
            story_id: Some("S-1".to_string()),
            stage: Stage::Verification,
            kind: EventKind::StoryFinished {
                status: StoryStatus::Done,
                category: None,
            },
        })
        .expect("serialize");
        assert_eq!(value["kind"], "story_finished");
        assert_eq!(value["stage"], "verification");
        assert_eq!(value["status"], "done");
    }
}
