use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::{Student, StudentId, StudentStatus};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RosterEvent {
    #[serde(rename_all = "camelCase")]
    Promoted {
        student_id: StudentId,
        class_label: String,
    },
    #[serde(rename_all = "camelCase")]
    Reactivated {
        student_id: StudentId,
        class_label: String,
    },
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        student_id: StudentId,
        class_label: String,
        status: StudentStatus,
    },
    #[serde(rename_all = "camelCase")]
    PromotionUndone {
        student_id: StudentId,
        class_label: String,
        status: StudentStatus,
    },
    Edited {
        student: Student,
        row: Option<usize>,
    },
    #[serde(rename_all = "camelCase")]
    EditedDetached {
        student_id: StudentId,
        name: String,
        class_label: String,
    },
}

/// Fire-and-forget fan-out. Publishing with no subscriber is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RosterEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: RosterEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RosterEvent> {
        self.tx.subscribe()
    }
}

/// Takes everything currently queued on `rx` without waiting.
pub fn drain(rx: &mut broadcast::Receiver<RosterEvent>) -> Vec<RosterEvent> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(ev) => out.push(ev),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event receiver lagged");
            }
            Err(_) => break,
        }
    }
    out
}
