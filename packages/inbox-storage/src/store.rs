//! Store seams used by the ingestion pipeline and the inbox reader.
//!
//! A store hands out sessions; a session owns one checked-out connection for one unit of work
//! and must be released when that work is done.

use std::{future::Future, pin::Pin};

use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
	Result,
	models::{DedupKey, EventKind, FetchedRow, Notification},
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The shared, externally owned event tables.
pub trait SourceStore
where
	Self: Send + Sync,
{
	fn open(&self) -> BoxFuture<'_, Result<Box<dyn SourceSession>>>;
}

pub trait SourceSession
where
	Self: Send,
{
	/// Newest-first rows whose author matches `author` case-insensitively, at most `limit`. Rows
	/// missing their issue, timestamp or payload are never returned.
	fn recent_events<'a>(
		&'a mut self,
		kind: EventKind,
		author: &'a str,
		limit: u32,
	) -> BoxFuture<'a, Result<Vec<FetchedRow>>>;

	/// Deletes the given ids in one committed batch. Returns the number of rows removed.
	fn delete_events<'a>(
		&'a mut self,
		kind: EventKind,
		ids: &'a [i64],
	) -> BoxFuture<'a, Result<u64>>;

	fn release(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// The owned notification table.
pub trait NotificationStore
where
	Self: Send + Sync,
{
	fn open(&self) -> BoxFuture<'_, Result<Box<dyn NotificationSession>>>;
}

pub trait NotificationSession
where
	Self: Send,
{
	fn exists<'a>(&'a mut self, key: &'a DedupKey) -> BoxFuture<'a, Result<bool>>;

	/// Inserts and commits one notification.
	fn insert<'a>(&'a mut self, notification: &'a Notification) -> BoxFuture<'a, Result<()>>;

	fn count_unread(&mut self, user_id: i64) -> BoxFuture<'_, Result<i64>>;

	fn recent(&mut self, user_id: i64, limit: u32) -> BoxFuture<'_, Result<Vec<Notification>>>;

	fn mark_read<'a>(
		&'a mut self,
		user_id: i64,
		notification_ids: &'a [Uuid],
		read_at: OffsetDateTime,
	) -> BoxFuture<'a, Result<u64>>;

	fn release(self: Box<Self>) -> BoxFuture<'static, ()>;
}
