use std::sync::Arc;

use time::{OffsetDateTime, macros::datetime};

use inbox_config::{Ingest, Pool as PoolSettings};
use inbox_storage::{
	Error,
	models::{DedupKey, EventKind, EventPayload, Notification},
	notifications::PgNotificationStore,
	pool::PoolManager,
	source::{PgSourceStore, SourceTables},
	store::{NotificationStore, SourceStore},
};
use inbox_testkit::TestDatabase;

fn pools(settings: PoolSettings) -> Arc<PoolManager> {
	Arc::new(PoolManager::new(settings))
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set INBOX_PG_DSN to run."]
async fn schema_bootstrap_is_idempotent() {
	let Some(base_dsn) = inbox_testkit::env_dsn() else {
		eprintln!("Skipping schema_bootstrap_is_idempotent; set INBOX_PG_DSN to run this test.");

		return;
	};
	let test_db = TestDatabase::new(&base_dsn).await.expect("Failed to create test database.");
	let pools = pools(PoolSettings::default());
	let store = PgNotificationStore::new(pools.clone(), test_db.endpoint());

	store.ensure_schema().await.expect("Failed to ensure schema.");
	store.ensure_schema().await.expect("Failed to ensure schema twice.");

	let mut conn = test_db.connect().await.expect("Failed to connect to test database.");
	let count: i64 = sqlx::query_scalar(
		"SELECT count(*) FROM information_schema.tables WHERE table_name = 'notifications'",
	)
	.fetch_one(&mut conn)
	.await
	.expect("Failed to query schema tables.");

	assert_eq!(count, 1);

	drop(conn);
	pools.close_all().await;
	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set INBOX_PG_DSN to run."]
async fn source_rows_are_read_newest_first_and_deleted_in_batch() {
	let Some(base_dsn) = inbox_testkit::env_dsn() else {
		eprintln!(
			"Skipping source_rows_are_read_newest_first_and_deleted_in_batch; set INBOX_PG_DSN \
			 to run."
		);

		return;
	};
	let test_db = TestDatabase::new(&base_dsn).await.expect("Failed to create test database.");

	test_db.install_source_tables().await.expect("Failed to install source tables.");

	let mut conn = test_db.connect().await.expect("Failed to connect to test database.");

	sqlx::query(
		"\
INSERT INTO status_change_events (issue_id, created_at, old_value, new_value, author)
VALUES
	(1, '2024-03-01 09:00:00+00', 'open', 'triaged', 'Reporter@Example.com'),
	(2, '2024-03-01 10:00:00+00', 'open', 'closed', 'reporter@example.com'),
	(3, NULL, 'open', 'closed', 'reporter@example.com'),
	(4, '2024-03-01 11:00:00+00', 'open', 'closed', 'someone@example.com')",
	)
	.execute(&mut conn)
	.await
	.expect("Failed to seed source rows.");

	drop(conn);

	let pools = pools(PoolSettings::default());
	let tables = SourceTables::from_config(&Ingest::default());
	let store = PgSourceStore::new(pools.clone(), test_db.endpoint(), tables);
	let mut session = store.open().await.expect("Failed to open source session.");
	let rows = session
		.recent_events(EventKind::StatusChange, "REPORTER@example.com ", 10)
		.await
		.expect("Failed to read source rows.");

	// The row without a timestamp is filtered out by the query and never takes a batch slot.
	assert_eq!(rows.len(), 2);

	let valid: Vec<_> =
		rows.into_iter().collect::<Result<_, _>>().expect("Only complete rows are fetched.");

	assert_eq!(valid.iter().map(|event| event.issue_id).collect::<Vec<_>>(), vec![2, 1]);
	assert_eq!(valid[0].created_at, datetime!(2024-03-01 10:00 UTC));

	let ids: Vec<i64> = valid.iter().map(|event| event.id).collect();
	let deleted =
		session.delete_events(EventKind::StatusChange, &ids).await.expect("Failed to delete.");

	assert_eq!(deleted, 2);

	let leftover = session
		.recent_events(EventKind::StatusChange, "reporter@example.com", 10)
		.await
		.expect("Failed to read source rows.");

	assert!(leftover.is_empty());

	session.release().await;
	pools.close_all().await;
	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set INBOX_PG_DSN to run."]
async fn notifications_round_trip_with_dedup_and_read_state() {
	let Some(base_dsn) = inbox_testkit::env_dsn() else {
		eprintln!(
			"Skipping notifications_round_trip_with_dedup_and_read_state; set INBOX_PG_DSN to run."
		);

		return;
	};
	let test_db = TestDatabase::new(&base_dsn).await.expect("Failed to create test database.");
	let pools = pools(PoolSettings::default());
	let store = PgNotificationStore::new(pools.clone(), test_db.endpoint());

	store.ensure_schema().await.expect("Failed to ensure schema.");

	let key = DedupKey {
		user_id: 7,
		issue_id: 4_021,
		source_created_at: datetime!(2024-03-01 09:30 UTC),
		payload: EventPayload::StatusChange {
			old_value: None,
			new_value: Some("resolved".to_string()),
		},
	};
	let notification = Notification::new(key.clone(), OffsetDateTime::now_utc());
	let mut session = store.open().await.expect("Failed to open inbox session.");

	assert!(!session.exists(&key).await.expect("Failed to check existence."));

	session.insert(&notification).await.expect("Failed to insert notification.");

	assert!(session.exists(&key).await.expect("Failed to check existence."));
	assert!(!session.exists(&DedupKey { user_id: 8, ..key.clone() }).await.expect("lookup"));
	assert_eq!(session.count_unread(7).await.expect("Failed to count."), 1);

	let page = session.recent(7, 10).await.expect("Failed to read page.");

	assert_eq!(page.len(), 1);
	assert_eq!(page[0].notification_id, notification.notification_id);
	assert_eq!(page[0].payload, notification.payload);

	let updated = session
		.mark_read(7, &[notification.notification_id], OffsetDateTime::now_utc())
		.await
		.expect("Failed to mark read.");

	assert_eq!(updated, 1);
	assert_eq!(session.count_unread(7).await.expect("Failed to count."), 0);

	session.release().await;
	pools.close_all().await;
	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set INBOX_PG_DSN to run."]
async fn saturated_pool_reports_exhaustion_without_direct_fallback() {
	let Some(base_dsn) = inbox_testkit::env_dsn() else {
		eprintln!(
			"Skipping saturated_pool_reports_exhaustion_without_direct_fallback; set INBOX_PG_DSN \
			 to run."
		);

		return;
	};
	let test_db = TestDatabase::new(&base_dsn).await.expect("Failed to create test database.");
	let pools = pools(PoolSettings {
		pool_size: 1,
		max_connections: 1,
		acquire_timeout_ms: 200,
		block_when_exhausted: false,
		..PoolSettings::default()
	});
	let endpoint = test_db.endpoint();
	let held = pools.acquire(&endpoint).await.expect("Failed to acquire the only connection.");

	assert!(!held.is_direct());

	let err = pools
		.acquire(&endpoint)
		.await
		.expect_err("Saturated pool must not hand out a connection.");

	assert!(matches!(err, Error::PoolExhausted { .. }), "unexpected error: {err}");
	assert!(err.is_transient());

	held.release().await;

	let again = pools.acquire(&endpoint).await.expect("Released connection should be reusable.");

	assert!(!again.is_direct());
	assert_eq!(pools.pool_count(), 1);

	again.release().await;
	pools.close_all().await;
	test_db.cleanup().await.expect("Failed to cleanup test database.");
}
