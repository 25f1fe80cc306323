use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
	Result,
	models::{DedupKey, Notification, NotificationRow},
	pool::{Conn, PoolManager},
	schema,
	store::{BoxFuture, NotificationSession, NotificationStore},
};
use inbox_config::Endpoint;

/// Postgres-backed notification inbox owned by this system.
pub struct PgNotificationStore {
	pools: Arc<PoolManager>,
	endpoint: Endpoint,
}
impl PgNotificationStore {
	pub fn new(pools: Arc<PoolManager>, endpoint: Endpoint) -> Self {
		Self { pools, endpoint }
	}

	pub async fn ensure_schema(&self) -> Result<()> {
		let mut conn = self.pools.acquire(&self.endpoint).await?;
		let result = schema::ensure_schema(&mut conn).await;

		conn.release().await;

		result
	}
}
impl NotificationStore for PgNotificationStore {
	fn open(&self) -> BoxFuture<'_, Result<Box<dyn NotificationSession>>> {
		Box::pin(async move {
			let conn = self.pools.acquire(&self.endpoint).await?;
			let session: Box<dyn NotificationSession> = Box::new(PgNotificationSession { conn });

			Ok(session)
		})
	}
}

struct PgNotificationSession {
	conn: Conn,
}
impl NotificationSession for PgNotificationSession {
	fn exists<'a>(&'a mut self, key: &'a DedupKey) -> BoxFuture<'a, Result<bool>> {
		Box::pin(async move {
			let (old_value, new_value, note) = key.payload.columns();
			let found: bool = sqlx::query_scalar(
				"\
SELECT EXISTS (
	SELECT 1
	FROM notifications
	WHERE user_id = $1
		AND issue_id = $2
		AND source_created_at = $3
		AND kind = $4
		AND old_value IS NOT DISTINCT FROM $5
		AND new_value IS NOT DISTINCT FROM $6
		AND note IS NOT DISTINCT FROM $7
)",
			)
			.bind(key.user_id)
			.bind(key.issue_id)
			.bind(key.source_created_at)
			.bind(key.payload.kind().as_str())
			.bind(old_value)
			.bind(new_value)
			.bind(note)
			.fetch_one(&mut *self.conn)
			.await?;

			Ok(found)
		})
	}

	fn insert<'a>(&'a mut self, notification: &'a Notification) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let (old_value, new_value, note) = notification.payload.columns();

			sqlx::query(
				"\
INSERT INTO notifications (
	notification_id,
	user_id,
	issue_id,
	kind,
	source_created_at,
	old_value,
	new_value,
	note,
	created_at,
	read_at
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
			)
			.bind(notification.notification_id)
			.bind(notification.user_id)
			.bind(notification.issue_id)
			.bind(notification.kind().as_str())
			.bind(notification.source_created_at)
			.bind(old_value)
			.bind(new_value)
			.bind(note)
			.bind(notification.created_at)
			.bind(notification.read_at)
			.execute(&mut *self.conn)
			.await?;

			Ok(())
		})
	}

	fn count_unread(&mut self, user_id: i64) -> BoxFuture<'_, Result<i64>> {
		Box::pin(async move {
			let count: i64 = sqlx::query_scalar(
				"SELECT count(*) FROM notifications WHERE user_id = $1 AND read_at IS NULL",
			)
			.bind(user_id)
			.fetch_one(&mut *self.conn)
			.await?;

			Ok(count)
		})
	}

	fn recent(&mut self, user_id: i64, limit: u32) -> BoxFuture<'_, Result<Vec<Notification>>> {
		Box::pin(async move {
			let rows: Vec<NotificationRow> = sqlx::query_as(
				"\
SELECT
	notification_id,
	user_id,
	issue_id,
	kind,
	source_created_at,
	old_value,
	new_value,
	note,
	created_at,
	read_at
FROM notifications
WHERE user_id = $1
ORDER BY source_created_at DESC, created_at DESC
LIMIT $2",
			)
			.bind(user_id)
			.bind(i64::from(limit))
			.fetch_all(&mut *self.conn)
			.await?;

			rows.into_iter().map(Notification::try_from).collect()
		})
	}

	fn mark_read<'a>(
		&'a mut self,
		user_id: i64,
		notification_ids: &'a [Uuid],
		read_at: OffsetDateTime,
	) -> BoxFuture<'a, Result<u64>> {
		Box::pin(async move {
			if notification_ids.is_empty() {
				return Ok(0);
			}

			let result = sqlx::query(
				"\
UPDATE notifications
SET read_at = $3
WHERE user_id = $1
	AND notification_id = ANY($2)
	AND read_at IS NULL",
			)
			.bind(user_id)
			.bind(notification_ids)
			.bind(read_at)
			.execute(&mut *self.conn)
			.await?;

			Ok(result.rows_affected())
		})
	}

	fn release(self: Box<Self>) -> BoxFuture<'static, ()> {
		let session = *self;

		Box::pin(session.conn.release())
	}
}
