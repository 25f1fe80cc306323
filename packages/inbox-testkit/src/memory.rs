//! In-memory stand-ins for the Postgres stores, with failure injection.
//!
//! Both doubles are cheap handles over shared state: clone one into the code under test and keep
//! another to seed rows, inject failures and inspect what happened.

use std::{
	cmp::Reverse,
	collections::{HashMap, HashSet},
	sync::{Arc, Mutex, MutexGuard},
};

use time::OffsetDateTime;
use uuid::Uuid;

use inbox_storage::{
	Error as StorageError, Result as StorageResult,
	models::{DedupKey, EventKind, FetchedRow, MalformedRow, Notification, RawSourceRow},
	store::{BoxFuture, NotificationSession, NotificationStore, SourceSession, SourceStore},
};

fn connect_error(store: &str, message: &str) -> StorageError {
	StorageError::RetriesExhausted {
		pool: store.to_string(),
		attempts: 1,
		last_error: message.to_string(),
	}
}

fn query_error(message: &str) -> StorageError {
	StorageError::Sqlx(sqlx::Error::Protocol(message.to_string()))
}

#[derive(Default)]
struct SourceState {
	next_id: i64,
	rows: HashMap<EventKind, Vec<RawSourceRow>>,
	undecodable: HashSet<i64>,
	fail_open: Option<String>,
	fail_query: Option<String>,
	delete_failures: u32,
	opened: u32,
	released: u32,
	delete_calls: u32,
}

/// Shared event tables held in memory.
#[derive(Clone, Default)]
pub struct MemorySource {
	state: Arc<Mutex<SourceState>>,
}
impl MemorySource {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push_status_change(
		&self,
		author: &str,
		issue_id: i64,
		created_at: OffsetDateTime,
		old_value: Option<&str>,
		new_value: Option<&str>,
	) -> i64 {
		self.push_raw(
			EventKind::StatusChange,
			RawSourceRow {
				issue_id: Some(issue_id),
				created_at: Some(created_at),
				author: Some(author.to_string()),
				old_value: old_value.map(str::to_string),
				new_value: new_value.map(str::to_string),
				..RawSourceRow::default()
			},
		)
	}

	pub fn push_note(
		&self,
		author: &str,
		issue_id: i64,
		created_at: OffsetDateTime,
		note: &str,
	) -> i64 {
		self.push_raw(
			EventKind::NoteAdded,
			RawSourceRow {
				issue_id: Some(issue_id),
				created_at: Some(created_at),
				author: Some(author.to_string()),
				note: Some(note.to_string()),
				..RawSourceRow::default()
			},
		)
	}

	/// Appends a row as-is, assigning the next id. Returns that id.
	pub fn push_raw(&self, kind: EventKind, mut row: RawSourceRow) -> i64 {
		let mut state = self.lock();

		state.next_id += 1;
		row.id = state.next_id;

		state.rows.entry(kind).or_default().push(row);

		state.next_id
	}

	/// Makes the row come back as a decode failure, the way a column of an unexpected type would.
	pub fn mark_undecodable(&self, id: i64) {
		self.lock().undecodable.insert(id);
	}

	/// Ids still present in the table for `kind`, in insertion order.
	pub fn remaining(&self, kind: EventKind) -> Vec<i64> {
		self.lock()
			.rows
			.get(&kind)
			.map(|rows| rows.iter().map(|row| row.id).collect())
			.unwrap_or_default()
	}

	pub fn total_remaining(&self) -> usize {
		self.lock().rows.values().map(Vec::len).sum()
	}

	pub fn fail_open(&self, message: &str) {
		self.lock().fail_open = Some(message.to_string());
	}

	pub fn fail_queries(&self, message: &str) {
		self.lock().fail_query = Some(message.to_string());
	}

	/// Makes the next `times` delete batches fail without removing anything.
	pub fn fail_deletes(&self, times: u32) {
		self.lock().delete_failures = times;
	}

	pub fn clear_failures(&self) {
		let mut state = self.lock();

		state.fail_open = None;
		state.fail_query = None;
		state.delete_failures = 0;
	}

	pub fn sessions_opened(&self) -> u32 {
		self.lock().opened
	}

	/// Sessions opened but not yet released.
	pub fn sessions_outstanding(&self) -> u32 {
		let state = self.lock();

		state.opened - state.released
	}

	pub fn delete_calls(&self) -> u32 {
		self.lock().delete_calls
	}

	fn lock(&self) -> MutexGuard<'_, SourceState> {
		self.state.lock().unwrap_or_else(|err| err.into_inner())
	}
}
impl SourceStore for MemorySource {
	fn open(&self) -> BoxFuture<'_, StorageResult<Box<dyn SourceSession>>> {
		Box::pin(async move {
			let mut state = self.lock();

			if let Some(message) = &state.fail_open {
				return Err(connect_error("memory-source", message));
			}

			state.opened += 1;

			let session: Box<dyn SourceSession> =
				Box::new(MemorySourceSession { source: self.clone() });

			Ok(session)
		})
	}
}

struct MemorySourceSession {
	source: MemorySource,
}
impl SourceSession for MemorySourceSession {
	fn recent_events<'a>(
		&'a mut self,
		kind: EventKind,
		author: &'a str,
		limit: u32,
	) -> BoxFuture<'a, StorageResult<Vec<FetchedRow>>> {
		Box::pin(async move {
			let state = self.source.lock();

			if let Some(message) = &state.fail_query {
				return Err(query_error(message));
			}

			let wanted = author.trim().to_lowercase();
			let mut rows: Vec<RawSourceRow> = state
				.rows
				.get(&kind)
				.into_iter()
				.flatten()
				.filter(|row| row.author.as_deref().is_some_and(|a| a.to_lowercase() == wanted))
				.filter(|row| row.has_required_columns(kind))
				.cloned()
				.collect();

			rows.sort_by_key(|row| (Reverse(row.created_at), Reverse(row.id)));
			rows.truncate(limit as usize);

			Ok(rows
				.into_iter()
				.map(|row| {
					if state.undecodable.contains(&row.id) {
						return Err(MalformedRow {
							source_id: Some(row.id),
							message: "column decode failed".to_string(),
						});
					}

					row.into_event(kind)
				})
				.collect())
		})
	}

	fn delete_events<'a>(
		&'a mut self,
		kind: EventKind,
		ids: &'a [i64],
	) -> BoxFuture<'a, StorageResult<u64>> {
		Box::pin(async move {
			let mut state = self.source.lock();

			state.delete_calls += 1;

			if state.delete_failures > 0 {
				state.delete_failures -= 1;

				return Err(query_error("injected delete failure"));
			}

			let Some(rows) = state.rows.get_mut(&kind) else {
				return Ok(0);
			};
			let before = rows.len();

			rows.retain(|row| !ids.contains(&row.id));

			Ok((before - rows.len()) as u64)
		})
	}

	fn release(self: Box<Self>) -> BoxFuture<'static, ()> {
		self.source.lock().released += 1;

		Box::pin(async {})
	}
}

#[derive(Default)]
struct InboxState {
	notifications: Vec<Notification>,
	fail_open: Option<String>,
	fail_lookup: Option<String>,
	fail_insert: Option<String>,
	opened: u32,
	released: u32,
	reads: u32,
}

/// The notification table held in memory.
#[derive(Clone, Default)]
pub struct MemoryInbox {
	state: Arc<Mutex<InboxState>>,
}
impl MemoryInbox {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn seed(&self, notification: Notification) {
		self.lock().notifications.push(notification);
	}

	pub fn all(&self) -> Vec<Notification> {
		self.lock().notifications.clone()
	}

	pub fn notifications_for(&self, user_id: i64) -> Vec<Notification> {
		self.lock().notifications.iter().filter(|n| n.user_id == user_id).cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.lock().notifications.len()
	}

	pub fn is_empty(&self) -> bool {
		self.lock().notifications.is_empty()
	}

	pub fn fail_open(&self, message: &str) {
		self.lock().fail_open = Some(message.to_string());
	}

	pub fn fail_lookups(&self, message: &str) {
		self.lock().fail_lookup = Some(message.to_string());
	}

	pub fn fail_inserts(&self, message: &str) {
		self.lock().fail_insert = Some(message.to_string());
	}

	pub fn clear_failures(&self) {
		let mut state = self.lock();

		state.fail_open = None;
		state.fail_lookup = None;
		state.fail_insert = None;
	}

	pub fn sessions_outstanding(&self) -> u32 {
		let state = self.lock();

		state.opened - state.released
	}

	/// Number of unread-count and recent-page queries served.
	pub fn reads(&self) -> u32 {
		self.lock().reads
	}

	fn lock(&self) -> MutexGuard<'_, InboxState> {
		self.state.lock().unwrap_or_else(|err| err.into_inner())
	}
}
impl NotificationStore for MemoryInbox {
	fn open(&self) -> BoxFuture<'_, StorageResult<Box<dyn NotificationSession>>> {
		Box::pin(async move {
			let mut state = self.lock();

			if let Some(message) = &state.fail_open {
				return Err(connect_error("memory-inbox", message));
			}

			state.opened += 1;

			let session: Box<dyn NotificationSession> =
				Box::new(MemoryInboxSession { inbox: self.clone() });

			Ok(session)
		})
	}
}

struct MemoryInboxSession {
	inbox: MemoryInbox,
}
impl NotificationSession for MemoryInboxSession {
	fn exists<'a>(&'a mut self, key: &'a DedupKey) -> BoxFuture<'a, StorageResult<bool>> {
		Box::pin(async move {
			let state = self.inbox.lock();

			if let Some(message) = &state.fail_lookup {
				return Err(query_error(message));
			}

			Ok(state.notifications.iter().any(|n| &n.dedup_key() == key))
		})
	}

	fn insert<'a>(
		&'a mut self,
		notification: &'a Notification,
	) -> BoxFuture<'a, StorageResult<()>> {
		Box::pin(async move {
			let mut state = self.inbox.lock();

			if let Some(message) = &state.fail_insert {
				return Err(query_error(message));
			}

			let taken = notification.notification_id;

			if state.notifications.iter().any(|n| n.notification_id == taken) {
				return Err(StorageError::InvalidArgument(format!(
					"duplicate notification_id {taken}"
				)));
			}

			state.notifications.push(notification.clone());

			Ok(())
		})
	}

	fn count_unread(&mut self, user_id: i64) -> BoxFuture<'_, StorageResult<i64>> {
		Box::pin(async move {
			let mut state = self.inbox.lock();

			state.reads += 1;

			let count = state
				.notifications
				.iter()
				.filter(|n| n.user_id == user_id && n.read_at.is_none())
				.count();

			Ok(count as i64)
		})
	}

	fn recent(
		&mut self,
		user_id: i64,
		limit: u32,
	) -> BoxFuture<'_, StorageResult<Vec<Notification>>> {
		Box::pin(async move {
			let mut state = self.inbox.lock();

			state.reads += 1;

			let mut page: Vec<Notification> =
				state.notifications.iter().filter(|n| n.user_id == user_id).cloned().collect();

			page.sort_by_key(|n| (Reverse(n.source_created_at), Reverse(n.created_at)));
			page.truncate(limit as usize);

			Ok(page)
		})
	}

	fn mark_read<'a>(
		&'a mut self,
		user_id: i64,
		notification_ids: &'a [Uuid],
		read_at: OffsetDateTime,
	) -> BoxFuture<'a, StorageResult<u64>> {
		Box::pin(async move {
			let mut state = self.inbox.lock();
			let mut updated = 0;

			let unread_and_listed = |n: &&mut Notification| {
				n.user_id == user_id
					&& n.read_at.is_none()
					&& notification_ids.contains(&n.notification_id)
			};

			for notification in state.notifications.iter_mut().filter(unread_and_listed) {
				notification.read_at = Some(read_at);
				updated += 1;
			}

			Ok(updated)
		})
	}

	fn release(self: Box<Self>) -> BoxFuture<'static, ()> {
		self.inbox.lock().released += 1;

		Box::pin(async {})
	}
}
