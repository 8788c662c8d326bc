// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Async operation manager.
//!
//! Every mutating stack call returns an operation id synchronously and runs
//! to completion on its own task. The manager owns the operation records,
//! drives the state machine, and fans progress events out to subscribers.
//!
//! State machine (terminal states absorb all further transitions):
//!
//! ```text
//!    pending ──▶ running ──▶ completed
//!       │          ├──▶ failed
//!       └──────────┴──▶ cancelled
//! ```
//!
//! Event publication is non-blocking: each subscriber has a bounded buffer
//! and a full buffer drops the event for that subscriber only. A subscriber
//! leaves by dropping its receiver; closed channels are pruned on the next
//! emission.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Buffered events per subscriber before drops begin.
const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    StackApply,
    StackRemove,
    ImagePull,
    ContainerExec,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::StackApply => "stack.apply",
            OperationType::StackRemove => "stack.remove",
            OperationType::ImagePull => "image.pull",
            OperationType::ContainerExec => "container.exec",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Failed | OperationState::Cancelled
        )
    }
}

/// Snapshot of one operation record.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: String,
    pub op_type: OperationType,
    pub state: OperationState,
    pub progress: i32,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Snapshot emitted to subscribers on every transition, progress update, or
/// message.
#[derive(Debug, Clone)]
pub struct Event {
    pub operation_id: String,
    pub state: OperationState,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub progress: i32,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("operation not found: {0}")]
    NotFound(String),

    #[error("operation already finished: {0}")]
    AlreadyFinished(String),
}

#[derive(Debug)]
struct Record {
    op: Operation,
    cancel: CancellationToken,
    listeners: Vec<mpsc::Sender<Event>>,
}

/// Owns all operations and their subscribers for the process lifetime.
#[derive(Default, Debug)]
pub struct Manager {
    records: Mutex<HashMap<String, Record>>,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh operation in `pending` state and return its id.
    pub fn create(&self, op_type: OperationType, metadata: HashMap<String, String>) -> String {
        let id = Uuid::new_v4().to_string();
        let record = Record {
            op: Operation {
                id: id.clone(),
                op_type,
                state: OperationState::Pending,
                progress: 0,
                metadata,
                created_at: Utc::now(),
                completed_at: None,
                error: None,
            },
            cancel: CancellationToken::new(),
            listeners: Vec::new(),
        };
        self.records
            .lock()
            .expect("operation map poisoned")
            .insert(id.clone(), record);
        id
    }

    /// Snapshot an operation.
    pub fn get(&self, op_id: &str) -> Option<Operation> {
        self.records
            .lock()
            .expect("operation map poisoned")
            .get(op_id)
            .map(|r| r.op.clone())
    }

    /// Snapshot all operations, optionally filtered.
    pub fn list<F>(&self, mut filter: F) -> Vec<Operation>
    where
        F: FnMut(&Operation) -> bool,
    {
        self.records
            .lock()
            .expect("operation map poisoned")
            .values()
            .filter(|r| filter(&r.op))
            .map(|r| r.op.clone())
            .collect()
    }

    /// The cancellation token workers watch. `None` for unknown ids.
    pub fn cancellation(&self, op_id: &str) -> Option<CancellationToken> {
        self.records
            .lock()
            .expect("operation map poisoned")
            .get(op_id)
            .map(|r| r.cancel.clone())
    }

    /// Attach a subscriber. Events emitted after this call are delivered in
    /// emission order; a full buffer drops events for this subscriber only.
    /// Unsubscribing is dropping the receiver.
    pub fn subscribe(&self, op_id: &str) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        if let Some(record) = self
            .records
            .lock()
            .expect("operation map poisoned")
            .get_mut(op_id)
        {
            record.listeners.push(tx);
        }
        // For an unknown op the sender is dropped here and the receiver
        // yields end-of-stream immediately.
        rx
    }

    /// pending -> running. No-op for unknown or already-advanced operations.
    pub fn set_running(&self, op_id: &str) {
        self.with_record(op_id, |record| {
            if record.op.state != OperationState::Pending {
                return None;
            }
            record.op.state = OperationState::Running;
            Some(Event {
                operation_id: record.op.id.clone(),
                state: record.op.state,
                timestamp: Utc::now(),
                message: String::new(),
                progress: record.op.progress,
                error: None,
            })
        });
    }

    /// Emit a message event carrying the current state.
    pub fn emit_message(&self, op_id: &str, message: impl Into<String>) {
        let message = message.into();
        self.with_record(op_id, |record| {
            if record.op.state.is_terminal() {
                return None;
            }
            Some(Event {
                operation_id: record.op.id.clone(),
                state: record.op.state,
                timestamp: Utc::now(),
                message,
                progress: record.op.progress,
                error: None,
            })
        });
    }

    /// Update progress. Values are clamped into `[0, 100]` and regressions
    /// are ignored, so every observed progress sequence is monotone
    /// non-decreasing.
    pub fn set_progress(&self, op_id: &str, progress: i32) {
        let clamped = progress.clamp(0, 100);
        self.with_record(op_id, |record| {
            if record.op.state.is_terminal() || clamped < record.op.progress {
                return None;
            }
            record.op.progress = clamped;
            Some(Event {
                operation_id: record.op.id.clone(),
                state: record.op.state,
                timestamp: Utc::now(),
                message: String::new(),
                progress: clamped,
                error: None,
            })
        });
    }

    /// running -> completed, progress pinned to 100.
    pub fn set_completed(&self, op_id: &str) {
        self.with_record(op_id, |record| {
            if record.op.state.is_terminal() {
                return None;
            }
            record.op.state = OperationState::Completed;
            record.op.progress = 100;
            record.op.completed_at = Some(Utc::now());
            Some(Event {
                operation_id: record.op.id.clone(),
                state: record.op.state,
                timestamp: Utc::now(),
                message: String::new(),
                progress: 100,
                error: None,
            })
        });
    }

    /// running -> failed with the terminal error.
    pub fn set_failed(&self, op_id: &str, error: impl Into<String>) {
        let error = error.into();
        self.with_record(op_id, |record| {
            if record.op.state.is_terminal() {
                return None;
            }
            record.op.state = OperationState::Failed;
            record.op.error = Some(error.clone());
            record.op.completed_at = Some(Utc::now());
            Some(Event {
                operation_id: record.op.id.clone(),
                state: record.op.state,
                timestamp: Utc::now(),
                message: String::new(),
                progress: record.op.progress,
                error: Some(error),
            })
        });
    }

    /// Cancel a non-terminal operation: trigger its token, transition, stamp
    /// the completion time, and emit one final event. Cancelling a terminal
    /// operation is an error.
    pub fn cancel(&self, op_id: &str) -> Result<(), OperationError> {
        let mut records = self.records.lock().expect("operation map poisoned");
        let record = records
            .get_mut(op_id)
            .ok_or_else(|| OperationError::NotFound(op_id.to_string()))?;

        if record.op.state.is_terminal() {
            return Err(OperationError::AlreadyFinished(op_id.to_string()));
        }

        record.cancel.cancel();
        record.op.state = OperationState::Cancelled;
        record.op.completed_at = Some(Utc::now());
        let event = Event {
            operation_id: record.op.id.clone(),
            state: record.op.state,
            timestamp: Utc::now(),
            message: "operation cancelled".to_string(),
            progress: record.op.progress,
            error: None,
        };
        Self::publish(record, event);
        Ok(())
    }

    /// Mutate one record under the lock; if the closure produces an event,
    /// publish it to the record's subscribers. Unknown ids are a no-op.
    fn with_record<F>(&self, op_id: &str, f: F)
    where
        F: FnOnce(&mut Record) -> Option<Event>,
    {
        let mut records = self.records.lock().expect("operation map poisoned");
        if let Some(record) = records.get_mut(op_id) {
            if let Some(event) = f(record) {
                Self::publish(record, event);
            }
        }
    }

    fn publish(record: &mut Record, event: Event) {
        record.listeners.retain(|tx| {
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                // Buffer full: drop this event for this subscriber only.
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_op() -> (Manager, String) {
        let manager = Manager::new();
        let id = manager.create(
            OperationType::StackApply,
            HashMap::from([("stack".to_string(), "web".to_string())]),
        );
        (manager, id)
    }

    #[tokio::test]
    async fn lifecycle_events_arrive_in_emission_order() {
        let (manager, id) = manager_with_op();
        let mut rx = manager.subscribe(&id);

        manager.set_running(&id);
        manager.emit_message(&id, "Parsing compose file...");
        manager.set_progress(&id, 50);
        manager.set_completed(&id);

        let states: Vec<_> = {
            let mut out = Vec::new();
            while let Ok(event) = rx.try_recv() {
                out.push(event);
            }
            out
        };

        assert_eq!(states.len(), 4);
        assert_eq!(states[0].state, OperationState::Running);
        assert_eq!(states[1].message, "Parsing compose file...");
        assert_eq!(states[2].progress, 50);
        assert_eq!(states[3].state, OperationState::Completed);
        assert_eq!(states[3].progress, 100);
    }

    #[tokio::test]
    async fn terminal_state_absorbs_further_transitions() {
        let (manager, id) = manager_with_op();
        manager.set_running(&id);
        manager.set_completed(&id);

        let mut rx = manager.subscribe(&id);
        manager.set_failed(&id, "too late");
        manager.set_progress(&id, 10);
        manager.emit_message(&id, "ignored");

        assert!(rx.try_recv().is_err());
        let op = manager.get(&id).unwrap();
        assert_eq!(op.state, OperationState::Completed);
        assert!(op.error.is_none());
    }

    #[tokio::test]
    async fn progress_is_clamped_and_monotone() {
        let (manager, id) = manager_with_op();
        manager.set_running(&id);

        manager.set_progress(&id, 150);
        assert_eq!(manager.get(&id).unwrap().progress, 100);

        manager.set_progress(&id, -5);
        assert_eq!(manager.get(&id).unwrap().progress, 100);

        let mut rx = manager.subscribe(&id);
        manager.set_progress(&id, 40);
        // The regression emitted nothing.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_terminal_operation_is_an_error() {
        let (manager, id) = manager_with_op();
        manager.set_running(&id);
        manager.set_completed(&id);

        let err = manager.cancel(&id).unwrap_err();
        assert!(matches!(err, OperationError::AlreadyFinished(_)));
    }

    #[tokio::test]
    async fn cancel_triggers_token_and_emits_final_event() {
        let (manager, id) = manager_with_op();
        manager.set_running(&id);
        let token = manager.cancellation(&id).unwrap();
        let mut rx = manager.subscribe(&id);

        manager.cancel(&id).unwrap();

        assert!(token.is_cancelled());
        let event = rx.try_recv().unwrap();
        assert_eq!(event.state, OperationState::Cancelled);
        let op = manager.get(&id).unwrap();
        assert!(op.completed_at.is_some());
    }

    #[tokio::test]
    async fn full_subscriber_buffer_drops_without_blocking_others() {
        let (manager, id) = manager_with_op();
        let mut slow = manager.subscribe(&id);
        let mut fast = manager.subscribe(&id);

        manager.set_running(&id);
        for i in 0..(SUBSCRIBER_BUFFER as i32 + 16) {
            manager.emit_message(&id, format!("tick {i}"));
        }

        // The slow subscriber saw at most its buffer's worth; the fast one
        // drains as it goes and still receives the tail.
        let mut slow_count = 0;
        while slow.try_recv().is_ok() {
            slow_count += 1;
        }
        assert!(slow_count <= SUBSCRIBER_BUFFER);

        let mut fast_count = 0;
        while fast.try_recv().is_ok() {
            fast_count += 1;
        }
        assert!(fast_count <= SUBSCRIBER_BUFFER);

        // Producer was never blocked: the operation can still complete.
        manager.set_completed(&id);
        assert_eq!(
            manager.get(&id).unwrap().state,
            OperationState::Completed
        );
    }

    #[tokio::test]
    async fn events_for_unknown_operations_are_dropped() {
        let manager = Manager::new();
        manager.set_running("nope");
        manager.emit_message("nope", "hello");
        assert!(manager.get("nope").is_none());

        let mut rx = manager.subscribe("nope");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn subscriber_sequence_is_a_prefix_of_the_legal_path() {
        let (manager, id) = manager_with_op();
        let mut rx = manager.subscribe(&id);

        manager.set_running(&id);
        manager.set_failed(&id, "compose up: exit status 1");

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.state, OperationState::Running);
        assert_eq!(second.state, OperationState::Failed);
        assert_eq!(second.error.as_deref(), Some("compose up: exit status 1"));
        assert!(rx.try_recv().is_err());
    }
}
