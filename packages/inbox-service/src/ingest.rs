//! Moves a user's events from the shared source tables into the owned inbox.
//!
//! One run per event kind: read the newest rows authored by the user, create a notification for
//! every row whose dedup key is new, then delete every row that now has a notification, in one
//! batch. Inserts commit before the delete is issued, so a failed delete leaves rows that the next
//! run recognises as duplicates and deletes.

use std::{
	fmt::{Display, Formatter, Result as FmtResult},
	sync::Arc,
};

use time::OffsetDateTime;

use crate::scheduler::{TickRunner, UserIdentity};
use inbox_storage::{
	models::{EventKind, Notification},
	store::{BoxFuture, NotificationStore, SourceStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRole {
	Source,
	Inbox,
}
impl Display for StoreRole {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		match self {
			Self::Source => f.write_str("source"),
			Self::Inbox => f.write_str("inbox"),
		}
	}
}

/// A failure recorded during one run. Never propagated past the run that produced it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
	#[error("Could not open the {store} store: {message}")]
	Connect { store: StoreRole, message: String },
	#[error("Reading source events failed: {message}")]
	Query { message: String },
	#[error("Skipped malformed source row {source_id:?}: {message}")]
	MalformedRow { source_id: Option<i64>, message: String },
	#[error("Duplicate lookup for source row {source_id} failed: {message}")]
	Lookup { source_id: i64, message: String },
	#[error("Inserting a notification for source row {source_id} failed: {message}")]
	Insert { source_id: i64, message: String },
	#[error("Deleting {count} consumed source rows failed: {message}")]
	Delete { count: usize, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindReport {
	pub kind: EventKind,
	/// Rows returned by the source query, malformed ones included.
	pub fetched: usize,
	/// Notifications created.
	pub processed: usize,
	/// Rows whose notification already existed.
	pub duplicates: usize,
	/// Source ids deleted by this run.
	pub consumed_ids: Vec<i64>,
	pub errors: Vec<IngestError>,
}
impl KindReport {
	pub fn new(kind: EventKind) -> Self {
		Self {
			kind,
			fetched: 0,
			processed: 0,
			duplicates: 0,
			consumed_ids: Vec::new(),
			errors: Vec::new(),
		}
	}

	pub fn is_clean(&self) -> bool {
		self.errors.is_empty()
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
	pub user_id: i64,
	pub kinds: Vec<KindReport>,
}
impl TickReport {
	pub fn processed(&self) -> usize {
		self.kinds.iter().map(|kind| kind.processed).sum()
	}

	pub fn duplicates(&self) -> usize {
		self.kinds.iter().map(|kind| kind.duplicates).sum()
	}

	pub fn consumed(&self) -> usize {
		self.kinds.iter().map(|kind| kind.consumed_ids.len()).sum()
	}

	pub fn errors(&self) -> impl Iterator<Item = &IngestError> {
		self.kinds.iter().flat_map(|kind| kind.errors.iter())
	}

	pub fn kind(&self, kind: EventKind) -> Option<&KindReport> {
		self.kinds.iter().find(|report| report.kind == kind)
	}

	pub fn log(&self) {
		let errors = self.errors().count();

		if errors == 0 {
			tracing::info!(
				user_id = self.user_id,
				processed = self.processed(),
				duplicates = self.duplicates(),
				consumed = self.consumed(),
				"Inbox sync tick finished."
			);
		} else {
			tracing::warn!(
				user_id = self.user_id,
				processed = self.processed(),
				duplicates = self.duplicates(),
				consumed = self.consumed(),
				errors,
				"Inbox sync tick finished with errors."
			);
		}
	}
}

pub struct IngestionPipeline {
	source: Arc<dyn SourceStore>,
	inbox: Arc<dyn NotificationStore>,
	batch_limit: u32,
}
impl IngestionPipeline {
	pub fn new(
		source: Arc<dyn SourceStore>,
		inbox: Arc<dyn NotificationStore>,
		batch_limit: u32,
	) -> Self {
		Self { source, inbox, batch_limit: batch_limit.max(1) }
	}

	pub fn batch_limit(&self) -> u32 {
		self.batch_limit
	}

	/// Runs every event kind for one user.
	pub async fn sync_user(&self, user: &UserIdentity) -> TickReport {
		let mut kinds = Vec::with_capacity(EventKind::ALL.len());

		for kind in EventKind::ALL {
			kinds.push(self.run_kind(user, kind).await);
		}

		TickReport { user_id: user.user_id, kinds }
	}

	pub async fn run_kind(&self, user: &UserIdentity, kind: EventKind) -> KindReport {
		let mut report = KindReport::new(kind);
		let mut source = match self.source.open().await {
			Ok(session) => session,
			Err(err) => {
				tracing::error!(
					user_id = user.user_id,
					%kind,
					error = %err,
					"Failed to open the source store."
				);

				report.errors.push(IngestError::Connect {
					store: StoreRole::Source,
					message: err.to_string(),
				});

				return report;
			},
		};
		let rows = match source.recent_events(kind, &user.email, self.batch_limit).await {
			Ok(rows) => rows,
			Err(err) => {
				tracing::error!(
					user_id = user.user_id,
					%kind,
					error = %err,
					"Failed to read source events."
				);

				report.errors.push(IngestError::Query { message: err.to_string() });
				source.release().await;

				return report;
			},
		};

		report.fetched = rows.len();

		if rows.is_empty() {
			source.release().await;

			return report;
		}

		let mut inbox = match self.inbox.open().await {
			Ok(session) => session,
			Err(err) => {
				tracing::error!(
					user_id = user.user_id,
					%kind,
					error = %err,
					"Failed to open the inbox store."
				);

				report.errors.push(IngestError::Connect {
					store: StoreRole::Inbox,
					message: err.to_string(),
				});
				source.release().await;

				return report;
			},
		};
		let now = OffsetDateTime::now_utc();
		let mut queued = Vec::with_capacity(rows.len());

		for row in rows {
			let event = match row {
				Ok(event) => event,
				Err(malformed) => {
					tracing::warn!(
						user_id = user.user_id,
						%kind,
						source_id = ?malformed.source_id,
						reason = %malformed.message,
						"Skipping malformed source row."
					);

					report.errors.push(IngestError::MalformedRow {
						source_id: malformed.source_id,
						message: malformed.message,
					});

					continue;
				},
			};

			// The query already filters by author. A mismatch here means another user's row.
			if !event.is_authored_by(&user.email) {
				tracing::warn!(
					user_id = user.user_id,
					%kind,
					source_id = event.id,
					"Source row author does not match the user. Leaving it in place."
				);

				report.errors.push(IngestError::MalformedRow {
					source_id: Some(event.id),
					message: "author does not match the user".to_string(),
				});

				continue;
			}

			let key = event.dedup_key(user.user_id);

			match inbox.exists(&key).await {
				Ok(true) => {
					tracing::debug!(
						user_id = user.user_id,
						%kind,
						source_id = event.id,
						"Notification already exists."
					);

					report.duplicates += 1;
					queued.push(event.id);
				},
				Ok(false) => match inbox.insert(&Notification::new(key, now)).await {
					Ok(()) => {
						report.processed += 1;
						queued.push(event.id);
					},
					Err(err) => {
						tracing::error!(
							user_id = user.user_id,
							%kind,
							source_id = event.id,
							error = %err,
							"Failed to insert notification."
						);

						report.errors.push(IngestError::Insert {
							source_id: event.id,
							message: err.to_string(),
						});
					},
				},
				Err(err) => {
					tracing::error!(
						user_id = user.user_id,
						%kind,
						source_id = event.id,
						error = %err,
						"Failed to look up an existing notification."
					);

					report.errors.push(IngestError::Lookup {
						source_id: event.id,
						message: err.to_string(),
					});
				},
			}
		}

		inbox.release().await;

		if !queued.is_empty() {
			match source.delete_events(kind, &queued).await {
				Ok(deleted) => {
					if deleted != queued.len() as u64 {
						tracing::debug!(
							user_id = user.user_id,
							%kind,
							queued = queued.len(),
							deleted,
							"Some consumed source rows were already gone."
						);
					}

					report.consumed_ids = queued;
				},
				Err(err) => {
					tracing::error!(
						user_id = user.user_id,
						%kind,
						count = queued.len(),
						error = %err,
						"Failed to delete consumed source rows. They will be retried next tick."
					);

					report.errors.push(IngestError::Delete {
						count: queued.len(),
						message: err.to_string(),
					});
				},
			}
		}

		source.release().await;

		report
	}
}
impl TickRunner for IngestionPipeline {
	fn run_tick<'a>(&'a self, user: &'a UserIdentity) -> BoxFuture<'a, TickReport> {
		Box::pin(self.sync_user(user))
	}
}
