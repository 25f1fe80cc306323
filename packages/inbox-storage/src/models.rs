use std::fmt::{Display, Formatter, Result as FmtResult};

use time::OffsetDateTime;
use uuid::Uuid;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
	StatusChange,
	NoteAdded,
}
impl EventKind {
	pub const ALL: [Self; 2] = [Self::StatusChange, Self::NoteAdded];

	pub fn as_str(self) -> &'static str {
		match self {
			Self::StatusChange => "status_change",
			Self::NoteAdded => "note_added",
		}
	}

	pub fn parse(raw: &str) -> Result<Self> {
		match raw {
			"status_change" => Ok(Self::StatusChange),
			"note_added" => Ok(Self::NoteAdded),
			other => Err(Error::Malformed(format!("unknown event kind {other:?}"))),
		}
	}
}
impl Display for EventKind {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventPayload {
	StatusChange { old_value: Option<String>, new_value: Option<String> },
	NoteAdded { note: String },
}
impl EventPayload {
	pub fn kind(&self) -> EventKind {
		match self {
			Self::StatusChange { .. } => EventKind::StatusChange,
			Self::NoteAdded { .. } => EventKind::NoteAdded,
		}
	}

	/// Column values as stored in the notification table: `(old_value, new_value, note)`.
	pub fn columns(&self) -> (Option<&str>, Option<&str>, Option<&str>) {
		match self {
			Self::StatusChange { old_value, new_value } =>
				(old_value.as_deref(), new_value.as_deref(), None),
			Self::NoteAdded { note } => (None, None, Some(note.as_str())),
		}
	}

	pub fn from_columns(
		kind: EventKind,
		old_value: Option<String>,
		new_value: Option<String>,
		note: Option<String>,
	) -> Result<Self> {
		match kind {
			EventKind::StatusChange => Ok(Self::StatusChange { old_value, new_value }),
			EventKind::NoteAdded => note.map(|note| Self::NoteAdded { note }).ok_or_else(|| {
				Error::Malformed("note_added notification without note".to_string())
			}),
		}
	}
}

/// One row of a shared source event table, validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEvent {
	pub id: i64,
	pub issue_id: i64,
	pub created_at: OffsetDateTime,
	pub author: String,
	pub payload: EventPayload,
}
impl SourceEvent {
	pub fn dedup_key(&self, user_id: i64) -> DedupKey {
		DedupKey {
			user_id,
			issue_id: self.issue_id,
			source_created_at: self.created_at,
			payload: self.payload.clone(),
		}
	}

	pub fn is_authored_by(&self, email: &str) -> bool {
		self.author.trim().to_lowercase() == email.trim().to_lowercase()
	}
}

/// A source row exactly as read, before validation. Every column except the id may be NULL
/// because the tables are owned by another system.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSourceRow {
	pub id: i64,
	pub issue_id: Option<i64>,
	pub created_at: Option<OffsetDateTime>,
	pub author: Option<String>,
	pub old_value: Option<String>,
	pub new_value: Option<String>,
	pub note: Option<String>,
}
impl RawSourceRow {
	/// Whether the columns every notification needs are present. Mirrors the source query filter.
	pub fn has_required_columns(&self, kind: EventKind) -> bool {
		let payload_present = match kind {
			EventKind::StatusChange => self.old_value.is_some() || self.new_value.is_some(),
			EventKind::NoteAdded => self.note.is_some(),
		};

		self.issue_id.is_some() && self.created_at.is_some() && payload_present
	}

	pub fn into_event(self, kind: EventKind) -> FetchedRow {
		let id = self.id;
		let malformed =
			|message: &str| MalformedRow { source_id: Some(id), message: message.to_string() };
		let issue_id = self.issue_id.ok_or_else(|| malformed("issue_id is NULL"))?;
		let created_at = self.created_at.ok_or_else(|| malformed("created_at is NULL"))?;
		let author = match self.author {
			Some(author) if !author.trim().is_empty() => author,
			_ => return Err(malformed("author is empty")),
		};
		let payload = match kind {
			EventKind::StatusChange => {
				if self.old_value.is_none() && self.new_value.is_none() {
					return Err(malformed("old_value and new_value are both NULL"));
				}

				EventPayload::StatusChange { old_value: self.old_value, new_value: self.new_value }
			},
			EventKind::NoteAdded => match self.note {
				Some(note) => EventPayload::NoteAdded { note },
				None => return Err(malformed("note is NULL")),
			},
		};

		Ok(SourceEvent { id, issue_id, created_at, author, payload })
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRow {
	pub source_id: Option<i64>,
	pub message: String,
}

pub type FetchedRow = std::result::Result<SourceEvent, MalformedRow>;

/// Identifies one event for one owner. Two notifications with equal keys are duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
	pub user_id: i64,
	pub issue_id: i64,
	pub source_created_at: OffsetDateTime,
	pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
	pub notification_id: Uuid,
	pub user_id: i64,
	pub issue_id: i64,
	pub source_created_at: OffsetDateTime,
	pub payload: EventPayload,
	pub created_at: OffsetDateTime,
	pub read_at: Option<OffsetDateTime>,
}
impl Notification {
	pub fn new(key: DedupKey, created_at: OffsetDateTime) -> Self {
		Self {
			notification_id: Uuid::new_v4(),
			user_id: key.user_id,
			issue_id: key.issue_id,
			source_created_at: key.source_created_at,
			payload: key.payload,
			created_at,
			read_at: None,
		}
	}

	pub fn kind(&self) -> EventKind {
		self.payload.kind()
	}

	pub fn dedup_key(&self) -> DedupKey {
		DedupKey {
			user_id: self.user_id,
			issue_id: self.issue_id,
			source_created_at: self.source_created_at,
			payload: self.payload.clone(),
		}
	}
}

#[derive(Debug, sqlx::FromRow)]
pub struct NotificationRow {
	pub notification_id: Uuid,
	pub user_id: i64,
	pub issue_id: i64,
	pub kind: String,
	pub source_created_at: OffsetDateTime,
	pub old_value: Option<String>,
	pub new_value: Option<String>,
	pub note: Option<String>,
	pub created_at: OffsetDateTime,
	pub read_at: Option<OffsetDateTime>,
}
impl TryFrom<NotificationRow> for Notification {
	type Error = Error;

	fn try_from(row: NotificationRow) -> Result<Self> {
		let kind = EventKind::parse(&row.kind)?;
		let payload = EventPayload::from_columns(kind, row.old_value, row.new_value, row.note)?;

		Ok(Self {
			notification_id: row.notification_id,
			user_id: row.user_id,
			issue_id: row.issue_id,
			source_created_at: row.source_created_at,
			payload,
			created_at: row.created_at,
			read_at: row.read_at,
		})
	}
}
