use sqlx::{Connection, PgConnection};

use crate::Result;

const SCHEMA_LOCK_ID: i64 = 4_104_207;

pub fn render_schema() -> String {
	expand_includes(include_str!("../../../sql/init.sql"))
}

/// Creates the owned notification table and its indexes. Safe to run concurrently from several
/// processes; the source event tables are never touched.
pub async fn ensure_schema(conn: &mut PgConnection) -> Result<()> {
	let sql = render_schema();
	// Transaction-scoped lock: concurrent bootstraps run one at a time and nothing leaks on error.
	let mut tx = conn.begin().await?;

	sqlx::query("SELECT pg_advisory_xact_lock($1)").bind(SCHEMA_LOCK_ID).execute(&mut *tx).await?;

	for statement in sql.split(';') {
		let trimmed = statement.trim();

		if trimmed.is_empty() {
			continue;
		}

		sqlx::query(trimmed).execute(&mut *tx).await?;
	}

	tx.commit().await?;

	tracing::info!("Notification schema is up to date.");

	Ok(())
}

fn expand_includes(sql: &str) -> String {
	let mut out = String::new();

	for line in sql.lines() {
		let trimmed = line.trim();

		if let Some(path) = trimmed.strip_prefix("\\ir ") {
			match path.trim() {
				"tables/001_notifications.sql" =>
					out.push_str(include_str!("../../../sql/tables/001_notifications.sql")),
				_ => out.push_str(line),
			}
		} else {
			out.push_str(line);
		}

		out.push('\n');
	}

	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn includes_are_expanded() {
		let sql = render_schema();

		assert!(!sql.contains("\\ir "));
		assert!(sql.contains("CREATE TABLE IF NOT EXISTS notifications"));
		assert!(sql.contains("idx_notifications_dedup"));
	}

	#[test]
	fn dedup_index_is_not_unique() {
		let sql = render_schema();

		assert!(!sql.contains("UNIQUE INDEX"));
	}
}
