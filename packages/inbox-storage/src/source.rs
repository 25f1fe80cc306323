use std::sync::Arc;

use sqlx::{Connection, Row, postgres::PgRow};
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::{
	Result,
	models::{EventKind, FetchedRow, MalformedRow, RawSourceRow},
	pool::{Conn, PoolManager},
	store::{BoxFuture, SourceSession, SourceStore},
};
use inbox_config::{Endpoint, Ingest};

#[derive(Debug, Clone)]
pub struct SourceTables {
	pub status_change: String,
	pub note_added: String,
}
impl SourceTables {
	pub fn from_config(cfg: &Ingest) -> Self {
		Self {
			status_change: cfg.status_change_table.clone(),
			note_added: cfg.note_added_table.clone(),
		}
	}

	pub fn table(&self, kind: EventKind) -> &str {
		match kind {
			EventKind::StatusChange => &self.status_change,
			EventKind::NoteAdded => &self.note_added,
		}
	}
}

/// Postgres-backed access to the ticketing system's event tables.
pub struct PgSourceStore {
	pools: Arc<PoolManager>,
	endpoint: Endpoint,
	tables: SourceTables,
}
impl PgSourceStore {
	pub fn new(pools: Arc<PoolManager>, endpoint: Endpoint, tables: SourceTables) -> Self {
		Self { pools, endpoint, tables }
	}
}
impl SourceStore for PgSourceStore {
	fn open(&self) -> BoxFuture<'_, Result<Box<dyn SourceSession>>> {
		Box::pin(async move {
			let conn = self.pools.acquire(&self.endpoint).await?;
			let session: Box<dyn SourceSession> =
				Box::new(PgSourceSession { conn, tables: self.tables.clone() });

			Ok(session)
		})
	}
}

struct PgSourceSession {
	conn: Conn,
	tables: SourceTables,
}
impl SourceSession for PgSourceSession {
	fn recent_events<'a>(
		&'a mut self,
		kind: EventKind,
		author: &'a str,
		limit: u32,
	) -> BoxFuture<'a, Result<Vec<FetchedRow>>> {
		Box::pin(async move {
			let table = self.tables.table(kind);
			let (payload_columns, payload_present) = match kind {
				EventKind::StatusChange =>
					("old_value, new_value", "(old_value IS NOT NULL OR new_value IS NOT NULL)"),
				EventKind::NoteAdded => ("note", "note IS NOT NULL"),
			};
			// Rows that can never become a notification stay out of the batch, so they cannot
			// take its capacity on every tick.
			let sql = format!(
				"\
SELECT id, issue_id, created_at, author, {payload_columns}
FROM {table}
WHERE lower(author) = lower($1)
	AND issue_id IS NOT NULL
	AND created_at IS NOT NULL
	AND {payload_present}
ORDER BY created_at DESC NULLS LAST, id DESC
LIMIT $2"
			);
			let rows = sqlx::query(&sql)
				.bind(author.trim())
				.bind(i64::from(limit))
				.fetch_all(&mut *self.conn)
				.await?;

			Ok(rows.iter().map(|row| decode_row(kind, row)).collect())
		})
	}

	fn delete_events<'a>(
		&'a mut self,
		kind: EventKind,
		ids: &'a [i64],
	) -> BoxFuture<'a, Result<u64>> {
		Box::pin(async move {
			if ids.is_empty() {
				return Ok(0);
			}

			let sql = format!("DELETE FROM {} WHERE id = ANY($1)", self.tables.table(kind));
			let mut tx = self.conn.begin().await?;
			let result = sqlx::query(&sql).bind(ids).execute(&mut *tx).await?;

			tx.commit().await?;

			Ok(result.rows_affected())
		})
	}

	fn release(self: Box<Self>) -> BoxFuture<'static, ()> {
		let session = *self;

		Box::pin(session.conn.release())
	}
}

fn decode_row(kind: EventKind, row: &PgRow) -> FetchedRow {
	let id: i64 = row
		.try_get("id")
		.map_err(|err| MalformedRow { source_id: None, message: format!("unreadable id: {err}") })?;
	let malformed =
		|err: sqlx::Error| MalformedRow { source_id: Some(id), message: err.to_string() };
	let mut raw = RawSourceRow {
		id,
		issue_id: row.try_get("issue_id").map_err(malformed)?,
		created_at: decode_timestamp(row, "created_at").map_err(malformed)?,
		author: row.try_get("author").map_err(malformed)?,
		..RawSourceRow::default()
	};

	match kind {
		EventKind::StatusChange => {
			raw.old_value = row.try_get("old_value").map_err(malformed)?;
			raw.new_value = row.try_get("new_value").map_err(malformed)?;
		},
		EventKind::NoteAdded => {
			raw.note = row.try_get("note").map_err(malformed)?;
		},
	}

	raw.into_event(kind)
}

// The ticketing system may store naive timestamps; those are taken as UTC.
fn decode_timestamp(row: &PgRow, column: &str) -> sqlx::Result<Option<OffsetDateTime>> {
	match row.try_get::<Option<OffsetDateTime>, _>(column) {
		Ok(value) => Ok(value),
		Err(sqlx::Error::ColumnDecode { .. }) => row
			.try_get::<Option<PrimitiveDateTime>, _>(column)
			.map(|value| value.map(PrimitiveDateTime::assume_utc)),
		Err(err) => Err(err),
	}
}
