//! Consumer-side view of a run.
//!
//! [`StatusRegistry`] keeps one row per batch and folds dispatch events into
//! it. It is seeded when data is loaded, so rows exist (as "Not sent")
//! before any run starts.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{interval, MissedTickBehavior};

use crate::types::{Batch, BatchKey, Event, SendStatus};

/// Label of a row that has not been part of a run yet.
pub const NOT_SENT_LABEL: &str = "Not sent";

/// One batch as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusRow {
    /// Batch identity.
    pub key: BatchKey,
    /// Number of records in the batch.
    pub size: usize,
    /// Latest status; `None` until the first event for this batch.
    pub status: Option<SendStatus>,
}

impl StatusRow {
    /// Display label for the status column.
    pub fn label(&self) -> String {
        self.status
            .as_ref()
            .map(SendStatus::label)
            .unwrap_or_else(|| NOT_SENT_LABEL.to_string())
    }
}

/// Completed batches out of the total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    /// Batches finished.
    pub completed: usize,
    /// Batches in the run.
    pub total: usize,
}

impl Progress {
    /// Finished share in `0.0..=1.0`; 1.0 for an empty run.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }
}

/// Status table folded from dispatch events.
#[derive(Debug, Clone, Default)]
pub struct StatusRegistry {
    rows: Vec<StatusRow>,
    index: HashMap<BatchKey, usize>,
    progress: usize,
    completed: bool,
}

impl StatusRegistry {
    /// Creates a registry with one "Not sent" row per batch, in order.
    pub fn seed(batches: &[Batch]) -> Self {
        let rows: Vec<StatusRow> = batches
            .iter()
            .map(|batch| StatusRow {
                key: batch.key().clone(),
                size: batch.size(),
                status: None,
            })
            .collect();
        let index = rows
            .iter()
            .enumerate()
            .map(|(i, row)| (row.key.clone(), i))
            .collect();

        Self {
            rows,
            index,
            progress: 0,
            completed: false,
        }
    }

    /// Applies one event. Status changes for unknown batches are ignored.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::StatusChanged { key, status } => match self.index.get(key) {
                Some(&i) => self.rows[i].status = Some(status.clone()),
                None => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(recipient = %key, "Status for unknown batch ignored");
                }
            },
            Event::ProgressTick { completed } => self.progress = *completed,
            Event::Completed => self.completed = true,
        }
    }

    /// Applies every event already waiting on `events` without blocking.
    ///
    /// Returns the number of events applied.
    pub fn drain(&mut self, events: &mut UnboundedReceiver<Event>) -> usize {
        self.drain_inner(events).0
    }

    fn drain_inner(&mut self, events: &mut UnboundedReceiver<Event>) -> (usize, bool) {
        let mut applied = 0;
        loop {
            match events.try_recv() {
                Ok(event) => {
                    self.apply(&event);
                    applied += 1;
                }
                Err(TryRecvError::Empty) => return (applied, false),
                Err(TryRecvError::Disconnected) => return (applied, true),
            }
        }
    }

    /// Polls `events` every `poll_interval` until `Completed` arrives or the
    /// sender goes away. `on_update` runs after each poll that applied
    /// something.
    pub async fn follow<F>(
        &mut self,
        events: &mut UnboundedReceiver<Event>,
        poll_interval: Duration,
        mut on_update: F,
    ) where
        F: FnMut(&StatusRegistry),
    {
        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let (applied, disconnected) = self.drain_inner(events);
            if applied > 0 {
                on_update(self);
            }
            if self.completed || disconnected {
                return;
            }
        }
    }

    /// Rows in batch order.
    pub fn rows(&self) -> &[StatusRow] {
        &self.rows
    }

    /// Row for `key`.
    pub fn row(&self, key: &BatchKey) -> Option<&StatusRow> {
        self.index.get(key).map(|&i| &self.rows[i])
    }

    /// Display labels in batch order.
    pub fn labels(&self) -> Vec<String> {
        self.rows.iter().map(StatusRow::label).collect()
    }

    /// Progress of the current run.
    pub fn progress(&self) -> Progress {
        Progress {
            completed: self.progress,
            total: self.rows.len(),
        }
    }

    /// Returns true once `Completed` has been seen.
    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{FailureReason, MailerErrorKind};
    use crate::grouper::group;
    use crate::mocks::sample_records;
    use tokio::sync::mpsc;

    fn alice() -> BatchKey {
        BatchKey::new("a@x.com", "Alice")
    }

    #[test]
    fn test_seeded_rows_are_not_sent() {
        let registry = StatusRegistry::seed(&group(sample_records()));

        assert_eq!(registry.rows().len(), 2);
        assert_eq!(registry.row(&alice()).map(|r| r.size), Some(2));
        assert_eq!(registry.labels(), vec![NOT_SENT_LABEL, NOT_SENT_LABEL]);
        assert_eq!(registry.progress(), Progress { completed: 0, total: 2 });
        assert!(!registry.is_completed());
    }

    #[test]
    fn test_apply_events() {
        let mut registry = StatusRegistry::seed(&group(sample_records()));
        let bob = BatchKey::new("bad-address", "Bob");

        registry.apply(&Event::status(&alice(), SendStatus::Pending));
        registry.apply(&Event::status(&bob, SendStatus::Pending));
        assert_eq!(registry.labels(), vec!["Pending", "Pending"]);

        registry.apply(&Event::status(&alice(), SendStatus::Sending));
        registry.apply(&Event::status(&alice(), SendStatus::Success));
        registry.apply(&Event::ProgressTick { completed: 1 });
        registry.apply(&Event::status(
            &bob,
            SendStatus::Failed(FailureReason::new(MailerErrorKind::InvalidAddress, "bad-address")),
        ));
        registry.apply(&Event::ProgressTick { completed: 2 });
        registry.apply(&Event::status(&BatchKey::new("x@y.com", "Nobody"), SendStatus::Success));
        registry.apply(&Event::Completed);

        let labels = registry.labels();
        assert_eq!(labels[0], "Sent");
        assert!(labels[1].starts_with("Error: "));
        assert_eq!(registry.progress().fraction(), 1.0);
        assert!(registry.is_completed());
    }

    #[tokio::test]
    async fn test_drain_is_non_blocking() {
        let mut registry = StatusRegistry::seed(&group(sample_records()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert_eq!(registry.drain(&mut rx), 0);

        tx.send(Event::status(&alice(), SendStatus::Sending)).unwrap();
        tx.send(Event::ProgressTick { completed: 1 }).unwrap();
        assert_eq!(registry.drain(&mut rx), 2);
        assert_eq!(registry.row(&alice()).unwrap().status, Some(SendStatus::Sending));
    }

    #[tokio::test]
    async fn test_follow_stops_on_completed() {
        let mut registry = StatusRegistry::seed(&group(sample_records()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            tx.send(Event::status(&alice(), SendStatus::Success)).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(Event::Completed).unwrap();
            // keep the sender alive past Completed
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut updates = 0;
        tokio::time::timeout(
            Duration::from_secs(2),
            registry.follow(&mut rx, Duration::from_millis(5), |_| updates += 1),
        )
        .await
        .unwrap();

        assert!(registry.is_completed());
        assert!(updates >= 1);
    }

    #[tokio::test]
    async fn test_follow_stops_when_sender_dropped() {
        let mut registry = StatusRegistry::default();
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        drop(tx);

        tokio::time::timeout(
            Duration::from_secs(1),
            registry.follow(&mut rx, Duration::from_millis(5), |_| {}),
        )
        .await
        .unwrap();
        assert!(!registry.is_completed());
    }
}
