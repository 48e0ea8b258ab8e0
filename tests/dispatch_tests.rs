//! Integration tests for full dispatch runs.

use integrations_schedule_mailer::mocks::{
    sample_records, schedule_record, FakeServerBehavior, FakeSmtpServer, MockMailTransport,
};
use integrations_schedule_mailer::types::fields;
use integrations_schedule_mailer::{
    group, live_templates, BatchKey, Dispatcher, Event, MailTransport, MailerErrorKind, Record,
    RenderedMessage, SendStatus, SmtpConfig, SmtpMailer, StatusRegistry, Templates,
};
use std::sync::Arc;
use std::time::Duration;

fn subject_templates() -> Arc<Templates> {
    Arc::new(Templates::new("Schedule - {GV}", "<p>Dear {GV}</p>{TABLE}"))
}

fn message() -> RenderedMessage {
    RenderedMessage {
        subject: "Schedule - Alice".to_string(),
        body_html: "<p>Dear Alice</p>".to_string(),
    }
}

#[tokio::test]
async fn test_sample_run_end_to_end() {
    let transport = MockMailTransport::new();
    let dispatcher = Dispatcher::new(Arc::new(transport.clone()), subject_templates());

    let batches = group(sample_records());
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].size(), 2);

    let mut registry = StatusRegistry::seed(&batches);
    let mut handle = dispatcher.spawn(batches);

    let mut events = Vec::new();
    while let Some(event) = handle.events().recv().await {
        registry.apply(&event);
        events.push(event);
    }
    let report = handle.join().await.unwrap();

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert!(registry.is_completed());
    assert_eq!(registry.labels()[0], "Sent");
    assert!(registry.labels()[1].starts_with("Error: Invalid address"));

    // Bob never reached the transport
    assert_eq!(transport.attempts(), vec!["a@x.com".to_string()]);

    let (to, sent) = &transport.deliveries()[0];
    assert_eq!(to, "a@x.com");
    assert_eq!(sent.subject, "Schedule - Alice");
    assert_eq!(sent.body_html.matches("<td>CS10").count(), 2);

    // Pending for all batches comes before any Sending
    let first_sending = events
        .iter()
        .position(|e| matches!(e, Event::StatusChanged { status: SendStatus::Sending, .. }))
        .unwrap();
    let pendings = events
        .iter()
        .filter(|e| matches!(e, Event::StatusChanged { status: SendStatus::Pending, .. }))
        .count();
    assert_eq!(first_sending, 2);
    assert_eq!(pendings, 2);

    let ticks: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            Event::ProgressTick { completed } => Some(*completed),
            _ => None,
        })
        .collect();
    assert_eq!(ticks, vec![1, 2]);
    assert_eq!(events[events.len() - 2], Event::ProgressTick { completed: 2 });
    assert_eq!(events.last(), Some(&Event::Completed));
}

#[tokio::test]
async fn test_missing_exam_date_renders_empty_cell() {
    let transport = MockMailTransport::new();
    let dispatcher = Dispatcher::new(Arc::new(transport.clone()), subject_templates());
    let record = Record::new()
        .with(fields::EMAIL, "a@x.com")
        .with(fields::RECIPIENT_NAME, "Alice")
        .with(fields::SUBJECT, "Databases")
        .with(fields::EXAM_TIME, "08:00");

    let mut handle = dispatcher.spawn(group(vec![record]));
    while handle.events().recv().await.is_some() {}
    handle.join().await.unwrap();

    let (_, sent) = &transport.deliveries()[0];
    assert!(sent.body_html.contains("<td>Databases</td>"));
    assert!(sent.body_html.contains("<td></td>"));
}

#[tokio::test]
async fn test_exam_dates_in_delivered_table() {
    let transport = MockMailTransport::new();
    let dispatcher = Dispatcher::new(Arc::new(transport.clone()), subject_templates());
    let records = vec![
        schedule_record("a@x.com", "Alice", "Databases", "CS101", "12/05/24"),
        schedule_record("a@x.com", "Alice", "Databases", "CS102", "2024-12-05 07:30"),
        schedule_record("a@x.com", "Alice", "Databases", "CS103", "TBA"),
    ];

    let mut handle = dispatcher.spawn(group(records));
    while handle.events().recv().await.is_some() {}
    handle.join().await.unwrap();

    let (_, sent) = &transport.deliveries()[0];
    assert!(sent.body_html.contains("<td>12/05/2024</td>"));
    assert!(sent.body_html.contains("<td>05/12/2024</td>"));
    assert!(sent.body_html.contains("<td>TBA</td>"));
    assert!(!sent.body_html.contains("/0012"));
}

#[tokio::test]
async fn test_control_characters_in_address_fail_before_sending() {
    let transport = MockMailTransport::new();
    let dispatcher = Dispatcher::new(Arc::new(transport.clone()), subject_templates());
    let records = vec![schedule_record("a\nb@x.com", "Eve", "Databases", "CS101", "")];

    let mut handle = dispatcher.spawn(group(records));
    let mut last_status = None;
    while let Some(event) = handle.events().recv().await {
        if let Event::StatusChanged { status, .. } = event {
            last_status = Some(status);
        }
    }
    handle.join().await.unwrap();

    assert!(transport.attempts().is_empty());
    assert!(matches!(
        last_status,
        Some(SendStatus::Failed(reason)) if reason.kind == MailerErrorKind::InvalidAddress
    ));
}

#[tokio::test]
async fn test_template_edits_apply_to_unsent_batches() {
    let transport = MockMailTransport::new().with_delay(Duration::from_millis(100));
    let (editor, templates) = live_templates(Templates::new("Before {GV}", "{TABLE}"));
    let dispatcher = Dispatcher::new(Arc::new(transport.clone()), Arc::new(templates));

    let records = vec![
        schedule_record("a@x.com", "Alice", "Databases", "CS101", ""),
        schedule_record("c@x.com", "Carol", "Networks", "CS201", ""),
    ];
    let mut handle = dispatcher.spawn(group(records));

    // edit while the first batch is in flight
    loop {
        match handle.events().recv().await {
            Some(Event::StatusChanged { status: SendStatus::Sending, .. }) => break,
            Some(_) => continue,
            None => panic!("run ended early"),
        }
    }
    editor.send_replace(Templates::new("After {GV}", "{TABLE}"));

    while handle.events().recv().await.is_some() {}
    handle.join().await.unwrap();

    let subjects: Vec<String> = transport
        .deliveries()
        .into_iter()
        .map(|(_, m)| m.subject)
        .collect();
    assert_eq!(subjects, vec!["Before Alice", "After Carol"]);
}

#[tokio::test]
async fn test_cancel_mid_run() {
    let transport = MockMailTransport::new().with_delay(Duration::from_millis(100));
    let dispatcher = Dispatcher::new(Arc::new(transport.clone()), subject_templates());
    let records = vec![
        schedule_record("a@x.com", "Alice", "Databases", "CS101", ""),
        schedule_record("c@x.com", "Carol", "Networks", "CS201", ""),
        schedule_record("d@x.com", "Dan", "Compilers", "CS301", ""),
    ];
    let batches = group(records);
    let mut registry = StatusRegistry::seed(&batches);
    let mut handle = dispatcher.spawn(batches);

    loop {
        let event = handle.events().recv().await.unwrap();
        registry.apply(&event);
        if matches!(event, Event::StatusChanged { status: SendStatus::Sending, .. }) {
            break;
        }
    }
    handle.cancel();

    while let Some(event) = handle.events().recv().await {
        registry.apply(&event);
    }
    let report = handle.join().await.unwrap();

    // the in-flight send finishes; the rest are skipped
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 2);
    assert_eq!(transport.deliveries().len(), 1);
    assert_eq!(registry.progress().completed, 3);
    assert!(registry.is_completed());

    let dan = registry.row(&BatchKey::new("d@x.com", "Dan")).unwrap();
    assert!(matches!(
        &dan.status,
        Some(SendStatus::Failed(reason)) if reason.kind == MailerErrorKind::Cancelled
    ));
}

#[tokio::test]
async fn test_smtp_mailer_delivers_to_fake_server() {
    let server = FakeSmtpServer::start(FakeServerBehavior::default()).await.unwrap();
    let mailer = SmtpMailer::new(server.config_builder().build().unwrap()).unwrap();

    mailer.send("a@x.com", &message()).await.unwrap();

    let deliveries = server.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].from, "office@example.com");
    assert_eq!(deliveries[0].to, "a@x.com");
    assert!(deliveries[0].data.contains("Subject: Schedule - Alice\r\n"));
    assert!(deliveries[0].data.contains("To: a@x.com\r\n"));
    assert!(deliveries[0].data.contains("Content-Type: text/html; charset=utf-8\r\n"));
}

#[tokio::test]
async fn test_smtp_mailer_failure_kinds() {
    let server = FakeSmtpServer::start(FakeServerBehavior {
        reject_recipients: vec!["gone@x.com".to_string()],
        ..FakeServerBehavior::default()
    })
    .await
    .unwrap();
    let mailer = SmtpMailer::new(server.config_builder().build().unwrap()).unwrap();
    let err = mailer.send("gone@x.com", &message()).await.unwrap_err();
    assert_eq!(err.kind(), MailerErrorKind::TransmitFailure);
    assert_eq!(err.smtp_code(), Some(550));

    let server = FakeSmtpServer::start(FakeServerBehavior {
        reject_auth: true,
        ..FakeServerBehavior::default()
    })
    .await
    .unwrap();
    let mailer = SmtpMailer::new(server.config_builder().build().unwrap()).unwrap();
    let err = mailer.send("a@x.com", &message()).await.unwrap_err();
    assert_eq!(err.kind(), MailerErrorKind::AuthFailure);
    assert!(server.deliveries().is_empty());
}

#[tokio::test]
async fn test_smtp_mailer_times_out() {
    let server = FakeSmtpServer::start(FakeServerBehavior {
        stall: true,
        ..FakeServerBehavior::default()
    })
    .await
    .unwrap();
    let config = server
        .config_builder()
        .timeout(Duration::from_millis(300))
        .build()
        .unwrap();
    let mailer = SmtpMailer::new(config).unwrap();

    let err = mailer.send("a@x.com", &message()).await.unwrap_err();
    assert_eq!(err.kind(), MailerErrorKind::Timeout);
}

#[tokio::test]
async fn test_smtp_mailer_connection_refused() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = SmtpConfig::builder()
        .host("127.0.0.1")
        .port(port)
        .no_tls()
        .credentials("office@example.com", "app-password")
        .build()
        .unwrap();
    let mailer = SmtpMailer::new(config).unwrap();

    let err = mailer.send("a@x.com", &message()).await.unwrap_err();
    assert_eq!(err.kind(), MailerErrorKind::ConnectFailure);
}

#[tokio::test]
async fn test_dispatch_over_smtp() {
    let server = FakeSmtpServer::start(FakeServerBehavior::default()).await.unwrap();
    let mailer = SmtpMailer::new(server.config_builder().build().unwrap()).unwrap();
    let dispatcher = Dispatcher::new(Arc::new(mailer), subject_templates());

    let batches = group(sample_records());
    let mut registry = StatusRegistry::seed(&batches);
    let mut handle = dispatcher.spawn(batches);
    registry
        .follow(handle.events(), Duration::from_millis(10), |_| {})
        .await;
    let report = handle.join().await.unwrap();

    assert_eq!(report.succeeded, 1);
    assert_eq!(registry.labels()[0], "Sent");
    assert_eq!(server.deliveries().len(), 1);
    assert_eq!(dispatcher.metrics().snapshot().invalid_addresses, 1);
}
