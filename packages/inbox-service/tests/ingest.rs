use std::sync::Arc;

use time::{Duration, OffsetDateTime, macros::datetime};

use inbox_service::{IngestError, IngestionPipeline, StoreRole, UserIdentity};
use inbox_storage::models::{DedupKey, EventKind, EventPayload, Notification, RawSourceRow};
use inbox_testkit::{MemoryInbox, MemorySource};

const BASE: OffsetDateTime = datetime!(2024-03-01 09:00 UTC);

fn pipeline(source: &MemorySource, inbox: &MemoryInbox, batch_limit: u32) -> IngestionPipeline {
	IngestionPipeline::new(Arc::new(source.clone()), Arc::new(inbox.clone()), batch_limit)
}

fn user(user_id: i64, email: &str) -> UserIdentity {
	UserIdentity { user_id, email: email.to_string() }
}

fn at(minutes: i64) -> OffsetDateTime {
	BASE + Duration::minutes(minutes)
}

#[tokio::test]
async fn status_changes_move_into_the_inbox() {
	let source = MemorySource::new();
	let inbox = MemoryInbox::new();

	for (minute, issue) in [(0, 101), (1, 102), (2, 103)] {
		let (old, new) = (Some("open"), Some("closed"));

		source.push_status_change("u1@example.com", issue, at(minute), old, new);
	}

	let report = pipeline(&source, &inbox, 50).sync_user(&user(1, "u1@example.com")).await;
	let status = report.kind(EventKind::StatusChange).expect("status change report");

	assert_eq!(status.processed, 3);
	assert_eq!(status.duplicates, 0);
	assert_eq!(status.consumed_ids.len(), 3);
	assert_eq!(report.errors().count(), 0);
	assert_eq!(inbox.notifications_for(1).len(), 3);
	assert!(source.remaining(EventKind::StatusChange).is_empty());
	assert_eq!(source.sessions_outstanding(), 0);
	assert_eq!(inbox.sessions_outstanding(), 0);

	let notification = inbox
		.notifications_for(1)
		.into_iter()
		.find(|n| n.issue_id == 102)
		.expect("notification for issue 102");

	assert_eq!(notification.source_created_at, at(1));
	assert_eq!(notification.read_at, None);
	assert_eq!(
		notification.payload,
		EventPayload::StatusChange {
			old_value: Some("open".to_string()),
			new_value: Some("closed".to_string()),
		}
	);
}

#[tokio::test]
async fn both_event_kinds_run_in_one_tick() {
	let source = MemorySource::new();
	let inbox = MemoryInbox::new();

	source.push_status_change("u1@example.com", 1, at(0), None, Some("triaged"));
	source.push_note("u1@example.com", 1, at(1), "Looking into it.");

	let report = pipeline(&source, &inbox, 50).sync_user(&user(1, "u1@example.com")).await;

	assert_eq!(report.processed(), 2);
	assert_eq!(report.kind(EventKind::NoteAdded).map(|kind| kind.processed), Some(1));
	assert_eq!(source.total_remaining(), 0);
	assert!(
		inbox
			.notifications_for(1)
			.iter()
			.any(|n| n.payload == EventPayload::NoteAdded { note: "Looking into it.".to_string() })
	);
}

#[tokio::test]
async fn second_tick_without_new_rows_creates_nothing() {
	let source = MemorySource::new();
	let inbox = MemoryInbox::new();
	let pipeline = pipeline(&source, &inbox, 50);
	let user = user(1, "u1@example.com");

	source.push_status_change("u1@example.com", 7, at(0), Some("open"), Some("closed"));

	assert_eq!(pipeline.sync_user(&user).await.processed(), 1);

	let second = pipeline.sync_user(&user).await;

	assert_eq!(second.processed(), 0);
	assert_eq!(second.kinds.iter().map(|kind| kind.fetched).sum::<usize>(), 0);
	assert_eq!(inbox.len(), 1);
}

#[tokio::test]
async fn identical_events_yield_one_notification() {
	let source = MemorySource::new();
	let inbox = MemoryInbox::new();

	source.push_status_change("u1@example.com", 9, at(0), Some("open"), Some("closed"));
	source.push_status_change("u1@example.com", 9, at(0), Some("open"), Some("closed"));

	let report = pipeline(&source, &inbox, 50).sync_user(&user(1, "u1@example.com")).await;
	let status = report.kind(EventKind::StatusChange).expect("status change report");

	assert_eq!(status.processed, 1);
	assert_eq!(status.duplicates, 1);
	assert_eq!(status.consumed_ids.len(), 2);
	assert_eq!(inbox.notifications_for(1).len(), 1);
	assert!(source.remaining(EventKind::StatusChange).is_empty());
}

#[tokio::test]
async fn already_delivered_events_are_consumed_as_duplicates() {
	let source = MemorySource::new();
	let inbox = MemoryInbox::new();
	let delivered = Notification {
		read_at: Some(at(30)),
		..Notification::new(
			DedupKey {
				user_id: 1,
				issue_id: 9,
				source_created_at: at(0),
				payload: EventPayload::NoteAdded { note: "Shipped.".to_string() },
			},
			at(1),
		)
	};

	inbox.seed(delivered.clone());
	source.push_note("u1@example.com", 9, at(0), "Shipped.");

	let report = pipeline(&source, &inbox, 50).sync_user(&user(1, "u1@example.com")).await;
	let notes = report.kind(EventKind::NoteAdded).expect("note report");

	assert_eq!(notes.processed, 0);
	assert_eq!(notes.duplicates, 1);
	assert_eq!(notes.consumed_ids.len(), 1);
	assert!(source.remaining(EventKind::NoteAdded).is_empty());
	// The stored notification keeps its id and read state.
	assert_eq!(inbox.all(), vec![delivered]);
}

#[tokio::test]
async fn concurrent_users_only_receive_their_own_rows() {
	let source = MemorySource::new();
	let inbox = MemoryInbox::new();
	let pipeline = pipeline(&source, &inbox, 50);

	for minute in 0..10 {
		source.push_status_change("alice@example.com", 100 + minute, at(minute), None, Some("a"));
		source.push_note("bob@example.com", 200 + minute, at(minute), "b");
	}

	let alice = user(1, "alice@example.com");
	let bob = user(2, "bob@example.com");
	let (alice_report, bob_report) =
		tokio::join!(pipeline.sync_user(&alice), pipeline.sync_user(&bob));

	assert_eq!(alice_report.processed(), 10);
	assert_eq!(bob_report.processed(), 10);
	assert!(inbox.notifications_for(1).iter().all(|n| (100..110).contains(&n.issue_id)));
	assert!(inbox.notifications_for(2).iter().all(|n| (200..210).contains(&n.issue_id)));
	assert_eq!(source.total_remaining(), 0);
}

#[tokio::test]
async fn failed_delete_is_recovered_next_tick_without_duplicates() {
	let source = MemorySource::new();
	let inbox = MemoryInbox::new();
	let pipeline = pipeline(&source, &inbox, 50);
	let user = user(1, "u1@example.com");

	for minute in 0..3 {
		source.push_status_change("u1@example.com", 50 + minute, at(minute), None, Some("closed"));
	}

	source.fail_deletes(1);

	let first = pipeline.sync_user(&user).await;
	let status = first.kind(EventKind::StatusChange).expect("status change report");

	assert_eq!(status.processed, 3);
	assert!(status.consumed_ids.is_empty());
	assert!(matches!(status.errors.as_slice(), [IngestError::Delete { count: 3, .. }]));
	assert_eq!(source.remaining(EventKind::StatusChange).len(), 3);
	assert_eq!(inbox.len(), 3);

	let second = pipeline.sync_user(&user).await;
	let status = second.kind(EventKind::StatusChange).expect("status change report");

	assert_eq!(status.processed, 0);
	assert_eq!(status.duplicates, 3);
	assert!(status.is_clean());
	assert!(source.remaining(EventKind::StatusChange).is_empty());
	assert_eq!(inbox.len(), 3);
}

#[tokio::test]
async fn batch_limit_caps_each_tick() {
	let source = MemorySource::new();
	let inbox = MemoryInbox::new();
	let pipeline = pipeline(&source, &inbox, 50);
	let user = user(1, "u1@example.com");
	let ids: Vec<i64> = (0..80)
		.map(|minute| {
			source.push_status_change("u1@example.com", 1_000 + minute, at(minute), None, Some("x"))
		})
		.collect();

	assert_eq!(pipeline.sync_user(&user).await.processed(), 50);
	// Newest rows go first.
	assert_eq!(source.remaining(EventKind::StatusChange), ids[..30].to_vec());
	assert_eq!(pipeline.sync_user(&user).await.processed(), 30);
	assert!(source.remaining(EventKind::StatusChange).is_empty());
	assert_eq!(inbox.len(), 80);
}

#[tokio::test]
async fn incomplete_rows_are_never_fetched_and_stay_in_place() {
	let source = MemorySource::new();
	let inbox = MemoryInbox::new();
	let good = source.push_status_change("u1@example.com", 1, at(0), Some("open"), Some("closed"));
	let missing_issue = source.push_raw(
		EventKind::StatusChange,
		RawSourceRow {
			created_at: Some(at(1)),
			author: Some("u1@example.com".to_string()),
			new_value: Some("closed".to_string()),
			..RawSourceRow::default()
		},
	);
	let empty_change = source.push_raw(
		EventKind::StatusChange,
		RawSourceRow {
			issue_id: Some(3),
			created_at: Some(at(2)),
			author: Some("u1@example.com".to_string()),
			..RawSourceRow::default()
		},
	);
	let report = pipeline(&source, &inbox, 50).sync_user(&user(1, "u1@example.com")).await;
	let status = report.kind(EventKind::StatusChange).expect("status change report");

	assert_eq!(status.fetched, 1);
	assert_eq!(status.processed, 1);
	assert_eq!(status.consumed_ids, vec![good]);
	assert!(status.errors.is_empty());

	let mut remaining = source.remaining(EventKind::StatusChange);

	remaining.sort_unstable();

	assert_eq!(remaining, vec![missing_issue, empty_change]);
}

#[tokio::test]
async fn rows_without_timestamps_cannot_starve_the_batch() {
	let source = MemorySource::new();
	let inbox = MemoryInbox::new();
	let good = source.push_note("u1@example.com", 1, at(0), "Deployed.");

	for issue in 0..50 {
		source.push_raw(
			EventKind::NoteAdded,
			RawSourceRow {
				issue_id: Some(100 + issue),
				author: Some("u1@example.com".to_string()),
				note: Some("No timestamp.".to_string()),
				..RawSourceRow::default()
			},
		);
	}

	let report = pipeline(&source, &inbox, 50).sync_user(&user(1, "u1@example.com")).await;
	let notes = report.kind(EventKind::NoteAdded).expect("note report");

	assert_eq!(notes.processed, 1);
	assert_eq!(notes.consumed_ids, vec![good]);
	assert_eq!(inbox.notifications_for(1).len(), 1);
	assert_eq!(source.remaining(EventKind::NoteAdded).len(), 50);
}

#[tokio::test]
async fn undecodable_rows_are_reported_and_left_in_place() {
	let source = MemorySource::new();
	let inbox = MemoryInbox::new();
	let good = source.push_status_change("u1@example.com", 1, at(0), Some("open"), Some("closed"));
	let broken = source.push_status_change("u1@example.com", 2, at(1), None, Some("closed"));

	source.mark_undecodable(broken);

	let report = pipeline(&source, &inbox, 50).sync_user(&user(1, "u1@example.com")).await;
	let status = report.kind(EventKind::StatusChange).expect("status change report");

	assert_eq!(status.fetched, 2);
	assert_eq!(status.processed, 1);
	assert_eq!(status.consumed_ids, vec![good]);
	assert!(matches!(
		status.errors.as_slice(),
		[IngestError::MalformedRow { source_id: Some(id), .. }] if *id == broken
	));
	assert_eq!(source.remaining(EventKind::StatusChange), vec![broken]);
}

#[tokio::test]
async fn author_match_ignores_case_and_whitespace() {
	let source = MemorySource::new();
	let inbox = MemoryInbox::new();

	source.push_note("U1@Example.COM", 5, at(0), "Case does not matter.");

	let report = pipeline(&source, &inbox, 50).sync_user(&user(1, " u1@example.com ")).await;

	assert_eq!(report.processed(), 1);
	assert_eq!(inbox.notifications_for(1).len(), 1);
}

#[tokio::test]
async fn unreachable_source_is_reported_without_side_effects() {
	let source = MemorySource::new();
	let inbox = MemoryInbox::new();

	source.push_status_change("u1@example.com", 1, at(0), None, Some("closed"));
	source.fail_open("connection refused");

	let report = pipeline(&source, &inbox, 50).sync_user(&user(1, "u1@example.com")).await;

	assert_eq!(report.processed(), 0);
	assert_eq!(report.errors().count(), 2);
	assert!(
		report
			.errors()
			.all(|err| matches!(err, IngestError::Connect { store: StoreRole::Source, .. }))
	);
	assert_eq!(source.remaining(EventKind::StatusChange).len(), 1);
	assert!(inbox.is_empty());
}

#[tokio::test]
async fn query_failure_releases_the_source_session() {
	let source = MemorySource::new();
	let inbox = MemoryInbox::new();

	source.push_status_change("u1@example.com", 1, at(0), None, Some("closed"));
	source.fail_queries("relation does not exist");

	let report = pipeline(&source, &inbox, 50)
		.run_kind(&user(1, "u1@example.com"), EventKind::StatusChange)
		.await;

	assert_eq!(report.processed, 0);
	assert!(matches!(report.errors.as_slice(), [IngestError::Query { .. }]));
	assert_eq!(source.sessions_opened(), 1);
	assert_eq!(source.sessions_outstanding(), 0);
	assert_eq!(source.remaining(EventKind::StatusChange).len(), 1);
}

#[tokio::test]
async fn unreachable_inbox_leaves_source_rows() {
	let source = MemorySource::new();
	let inbox = MemoryInbox::new();

	source.push_status_change("u1@example.com", 1, at(0), None, Some("closed"));
	inbox.fail_open("too many connections");

	let report = pipeline(&source, &inbox, 50)
		.run_kind(&user(1, "u1@example.com"), EventKind::StatusChange)
		.await;

	assert!(matches!(
		report.errors.as_slice(),
		[IngestError::Connect { store: StoreRole::Inbox, .. }]
	));
	assert_eq!(source.remaining(EventKind::StatusChange).len(), 1);
	assert_eq!(source.sessions_outstanding(), 0);
	assert_eq!(source.delete_calls(), 0);
}

#[tokio::test]
async fn failed_inserts_are_not_deleted_from_the_source() {
	let source = MemorySource::new();
	let inbox = MemoryInbox::new();

	source.push_status_change("u1@example.com", 1, at(0), None, Some("closed"));
	source.push_status_change("u1@example.com", 2, at(1), None, Some("closed"));
	inbox.fail_inserts("disk full");

	let report = pipeline(&source, &inbox, 50)
		.run_kind(&user(1, "u1@example.com"), EventKind::StatusChange)
		.await;

	assert_eq!(report.processed, 0);
	assert_eq!(report.errors.len(), 2);
	assert!(report.errors.iter().all(|err| matches!(err, IngestError::Insert { .. })));
	assert_eq!(source.delete_calls(), 0);
	assert_eq!(source.remaining(EventKind::StatusChange).len(), 2);

	inbox.clear_failures();

	let retry = pipeline(&source, &inbox, 50)
		.run_kind(&user(1, "u1@example.com"), EventKind::StatusChange)
		.await;

	assert_eq!(retry.processed, 2);
	assert!(source.remaining(EventKind::StatusChange).is_empty());
}

#[tokio::test]
async fn failed_lookup_skips_the_row() {
	let source = MemorySource::new();
	let inbox = MemoryInbox::new();

	source.push_note("u1@example.com", 1, at(0), "hello");
	inbox.fail_lookups("statement timeout");

	let report = pipeline(&source, &inbox, 50)
		.run_kind(&user(1, "u1@example.com"), EventKind::NoteAdded)
		.await;

	assert!(matches!(report.errors.as_slice(), [IngestError::Lookup { .. }]));
	assert!(inbox.is_empty());
	assert_eq!(source.remaining(EventKind::NoteAdded).len(), 1);
}
