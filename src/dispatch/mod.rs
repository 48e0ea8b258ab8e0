//! Serial dispatch of batches with a live event stream.
//!
//! The dispatcher walks batches in order, one at a time. For each batch it
//! reads the current templates, renders, checks the address and hands the
//! message to a [`MailTransport`]. Every step is reported on an unbounded
//! channel so the worker never waits on the consumer.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errors::{MailerError, MailerErrorKind, MailerResult};
use crate::mailer::MailTransport;
use crate::observability::{DispatchMetrics, Timer};
use crate::render::{Renderer, TemplateSource};
use crate::types::{is_valid_address, Batch, Event, SendStatus};

/// Outcome of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Batches in the run.
    pub total: usize,
    /// Batches accepted by the relay.
    pub succeeded: usize,
    /// Batches that failed, including cancelled ones.
    pub failed: usize,
    /// Wall time of the run.
    pub duration: Duration,
}

impl DispatchReport {
    /// Returns true if every batch was sent.
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.succeeded == self.total
    }
}

/// Runs batches through rendering and delivery.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn MailTransport>,
    templates: Arc<dyn TemplateSource>,
    renderer: Renderer,
    metrics: Arc<DispatchMetrics>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("transport", &self.transport)
            .field("renderer", &self.renderer)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(transport: Arc<dyn MailTransport>, templates: Arc<dyn TemplateSource>) -> Self {
        Self {
            transport,
            templates,
            renderer: Renderer::default(),
            metrics: Arc::new(DispatchMetrics::new()),
        }
    }

    /// Replaces the renderer.
    pub fn with_renderer(mut self, renderer: Renderer) -> Self {
        self.renderer = renderer;
        self
    }

    /// Shares a metrics registry with this dispatcher.
    pub fn with_metrics(mut self, metrics: Arc<DispatchMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Returns the metrics registry.
    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }

    /// Runs every batch and reports progress on `events`.
    ///
    /// Emits `Pending` for all batches, then per batch `Sending`, the
    /// resolution and a `ProgressTick`, and finally `Completed`. Once
    /// `cancel` fires, remaining batches resolve to `Failed(Cancelled)`
    /// without being sent. A closed receiver does not stop the run.
    pub async fn run(
        &self,
        batches: &[Batch],
        events: &UnboundedSender<Event>,
        cancel: &CancellationToken,
    ) -> DispatchReport {
        let timer = Timer::start("dispatch_run");
        let mut report = DispatchReport {
            total: batches.len(),
            ..DispatchReport::default()
        };

        #[cfg(feature = "tracing")]
        tracing::info!(batches = batches.len(), "Dispatch run started");

        for batch in batches {
            emit(events, Event::status(batch.key(), SendStatus::Pending));
        }

        for (index, batch) in batches.iter().enumerate() {
            emit(events, Event::status(batch.key(), SendStatus::Sending));

            let outcome = if cancel.is_cancelled() {
                Err(MailerError::cancelled())
            } else {
                self.send_batch(batch).await
            };

            self.metrics.record_outcome(&outcome);
            match &outcome {
                Ok(()) => {
                    report.succeeded += 1;

                    #[cfg(feature = "tracing")]
                    tracing::debug!(recipient = %batch.key(), rows = batch.size(), "Batch sent");
                }
                Err(_e) => {
                    report.failed += 1;

                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        recipient = %batch.key(),
                        severity = ?_e.severity(),
                        error = %_e,
                        "Batch failed"
                    );
                }
            }

            emit(events, Event::status(batch.key(), SendStatus::from(outcome)));
            emit(events, Event::ProgressTick { completed: index + 1 });
        }

        emit(events, Event::Completed);
        self.metrics.record_run_completed();
        report.duration = timer.stop();

        #[cfg(feature = "tracing")]
        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed,
            duration_ms = report.duration.as_millis() as u64,
            "Dispatch run finished"
        );

        report
    }

    /// Starts a run on a background task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(&self, batches: Vec<Batch>) -> DispatchHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let total = batches.len();

        let dispatcher = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { dispatcher.run(&batches, &tx, &token).await });

        DispatchHandle {
            events: rx,
            cancel,
            task,
            total,
        }
    }

    async fn send_batch(&self, batch: &Batch) -> MailerResult<()> {
        let templates = self.templates.current();
        let message = self.renderer.render_templates(batch, &templates);

        let to = batch.address().trim();
        if !is_valid_address(to) {
            return Err(MailerError::invalid_address(to));
        }

        self.transport.send(to, &message).await
    }
}

fn emit(events: &UnboundedSender<Event>, event: Event) {
    // a gone consumer only loses the display
    let _ = events.send(event);
}

/// Handle to a run started with [`Dispatcher::spawn`].
#[derive(Debug)]
pub struct DispatchHandle {
    events: UnboundedReceiver<Event>,
    cancel: CancellationToken,
    task: JoinHandle<DispatchReport>,
    total: usize,
}

impl DispatchHandle {
    /// Returns the event receiver.
    pub fn events(&mut self) -> &mut UnboundedReceiver<Event> {
        &mut self.events
    }

    /// Number of batches in the run.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Returns true if the run has no batches.
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Requests cancellation. Takes effect before the next batch; a send in
    /// flight finishes normally.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns a token that cancels this run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the worker and returns its report.
    ///
    /// Fails with `Cancelled` if the worker task was aborted or panicked.
    pub async fn join(self) -> MailerResult<DispatchReport> {
        self.task.await.map_err(|e| {
            MailerError::new(MailerErrorKind::Cancelled, format!("Dispatch worker stopped: {}", e))
                .with_cause(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouper::group;
    use crate::mailer::MockMailTransport;
    use crate::mocks::{self, sample_records};
    use crate::render::{live_templates, Templates};
    use crate::types::BatchKey;
    use std::sync::Mutex;

    fn templates() -> Arc<dyn TemplateSource> {
        Arc::new(Templates::new("Schedule - {GV}", "<p>{GV}</p>{TABLE}"))
    }

    fn collect(rx: &mut UnboundedReceiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn statuses_for(events: &[Event], key: &BatchKey) -> Vec<SendStatus> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::StatusChanged { key: k, status } if k == key => Some(status.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_sample_run() {
        let mut transport = MockMailTransport::new();
        transport
            .expect_send()
            .withf(|to, msg| to.to_string() == "a@x.com" && msg.subject == "Schedule - Alice")
            .times(1)
            .returning(|_, _| Ok(()));

        let dispatcher = Dispatcher::new(Arc::new(transport), templates());
        let batches = group(sample_records());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let report = dispatcher.run(&batches, &tx, &CancellationToken::new()).await;
        assert_eq!(report.total, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);

        let events = collect(&mut rx);
        assert_eq!(events.len(), 2 + 2 * 3 + 1);
        assert!(matches!(events[0], Event::StatusChanged { status: SendStatus::Pending, .. }));
        assert!(matches!(events[1], Event::StatusChanged { status: SendStatus::Pending, .. }));
        assert_eq!(events.last(), Some(&Event::Completed));

        let bob = BatchKey::new("bad-address", "Bob");
        let path = statuses_for(&events, &bob);
        assert_eq!(path.len(), 3);
        match &path[2] {
            SendStatus::Failed(reason) => assert_eq!(reason.kind, MailerErrorKind::InvalidAddress),
            other => panic!("unexpected status {:?}", other),
        }

        let ticks: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                Event::ProgressTick { completed } => Some(*completed),
                _ => None,
            })
            .collect();
        assert_eq!(ticks, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_later_batches() {
        let transport = mocks::MockMailTransport::new();
        transport.fail_recipient("a@x.com", MailerErrorKind::AuthFailure);
        let records = vec![
            mocks::schedule_record("a@x.com", "Alice", "Databases", "CS101", "2024-06-15"),
            mocks::schedule_record("c@x.com", "Carol", "Networks", "CS201", "2024-06-16"),
        ];

        let dispatcher = Dispatcher::new(Arc::new(transport.clone()), templates());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let report = dispatcher
            .run(&group(records), &tx, &CancellationToken::new())
            .await;

        assert_eq!(report.succeeded, 1);
        assert_eq!(transport.deliveries()[0].0, "c@x.com");

        let events = collect(&mut rx);
        let carol = statuses_for(&events, &BatchKey::new("c@x.com", "Carol"));
        assert_eq!(carol, vec![SendStatus::Pending, SendStatus::Sending, SendStatus::Success]);

        let snapshot = dispatcher.metrics().snapshot();
        assert_eq!(snapshot.auth_failures, 1);
        assert_eq!(snapshot.batches_sent, 1);
        assert_eq!(snapshot.runs_completed, 1);
    }

    #[tokio::test]
    async fn test_padded_address_is_trimmed() {
        let transport = mocks::MockMailTransport::new();
        let records = vec![mocks::schedule_record(" a@x.com ", "Alice", "Databases", "CS101", "")];

        let dispatcher = Dispatcher::new(Arc::new(transport.clone()), templates());
        let (tx, _rx) = mpsc::unbounded_channel();
        dispatcher.run(&group(records), &tx, &CancellationToken::new()).await;

        assert_eq!(transport.attempts(), vec!["a@x.com".to_string()]);
    }

    #[tokio::test]
    async fn test_templates_are_read_per_batch() {
        let (editor, receiver) = live_templates(Templates::new("First {GV}", "{TABLE}"));
        let editor = Arc::new(editor);
        let subjects = Arc::new(Mutex::new(Vec::new()));

        let mut transport = MockMailTransport::new();
        let seen = subjects.clone();
        transport.expect_send().times(2).returning(move |_, msg| {
            seen.lock().unwrap().push(msg.subject.clone());
            editor.send_replace(Templates::new("Second {GV}", "{TABLE}"));
            Ok(())
        });

        let records = vec![
            mocks::schedule_record("a@x.com", "Alice", "Databases", "CS101", ""),
            mocks::schedule_record("c@x.com", "Carol", "Networks", "CS201", ""),
        ];
        let dispatcher = Dispatcher::new(Arc::new(transport), Arc::new(receiver));
        let (tx, _rx) = mpsc::unbounded_channel();
        dispatcher.run(&group(records), &tx, &CancellationToken::new()).await;

        assert_eq!(*subjects.lock().unwrap(), vec!["First Alice", "Second Carol"]);
    }

    #[tokio::test]
    async fn test_cancelled_run_still_completes() {
        let mut transport = MockMailTransport::new();
        transport.expect_send().never();

        let dispatcher = Dispatcher::new(Arc::new(transport), templates());
        let batches = group(sample_records());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = dispatcher.run(&batches, &tx, &cancel).await;
        assert_eq!(report.failed, 2);

        let events = collect(&mut rx);
        let alice = statuses_for(&events, &BatchKey::new("a@x.com", "Alice"));
        assert_eq!(alice.len(), 3);
        assert!(matches!(
            &alice[2],
            SendStatus::Failed(reason) if reason.kind == MailerErrorKind::Cancelled
        ));
        assert_eq!(events.last(), Some(&Event::Completed));
    }

    #[tokio::test]
    async fn test_empty_run_emits_only_completed() {
        let dispatcher = Dispatcher::new(Arc::new(mocks::MockMailTransport::new()), templates());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let report = dispatcher.run(&[], &tx, &CancellationToken::new()).await;
        assert_eq!(report.total, 0);
        assert!(report.all_succeeded());
        assert_eq!(collect(&mut rx), vec![Event::Completed]);
    }

    #[tokio::test]
    async fn test_dropped_consumer_does_not_stop_run() {
        let transport = mocks::MockMailTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()), templates());
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        let report = dispatcher
            .run(&group(sample_records()), &tx, &CancellationToken::new())
            .await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(transport.deliveries().len(), 1);
    }

    #[tokio::test]
    async fn test_spawned_run() {
        let transport = mocks::MockMailTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport), templates());

        let mut handle = dispatcher.spawn(group(sample_records()));
        assert_eq!(handle.total(), 2);
        assert!(!handle.is_empty());

        let mut last = None;
        while let Some(event) = handle.events().recv().await {
            last = Some(event);
        }
        assert_eq!(last, Some(Event::Completed));

        let report = handle.join().await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
    }
}
