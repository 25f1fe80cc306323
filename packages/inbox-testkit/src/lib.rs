mod error;
mod memory;

pub use error::{Error, Result};
pub use memory::{MemoryInbox, MemorySource};

use std::{env, future::Future, str::FromStr, thread};

use sqlx::{
	ConnectOptions, Connection, Executor,
	postgres::{PgConnectOptions, PgConnection},
};
use tokio::runtime::Builder;
use uuid::Uuid;

use inbox_config::Endpoint;

const ADMIN_DATABASES: [&str; 2] = ["postgres", "template1"];
const SOURCE_TABLES_SQL: &str = include_str!("../../../sql/testing/source_tables.sql");

/// A throwaway database created on the server named by `INBOX_PG_DSN`, dropped on cleanup.
pub struct TestDatabase {
	name: String,
	dsn: String,
	options: PgConnectOptions,
	password: Option<String>,
	admin_options: PgConnectOptions,
	cleaned: bool,
}
impl TestDatabase {
	pub async fn new(base_dsn: &str) -> Result<Self> {
		let base_options: PgConnectOptions = PgConnectOptions::from_str(base_dsn)
			.map_err(|err| Error::Message(format!("Failed to parse INBOX_PG_DSN: {err}.")))?;
		let (admin_options, mut admin_conn) = connect_admin(&base_options).await?;
		let name = format!("inbox_test_{}", Uuid::new_v4().simple());
		let create_sql = format!(r#"CREATE DATABASE "{}""#, name);

		admin_conn
			.execute(create_sql.as_str())
			.await
			.map_err(|err| Error::Message(format!("Failed to create test database: {err}.")))?;

		let options = base_options.database(&name);
		let dsn = options.to_url_lossy().to_string();

		Ok(Self {
			name,
			dsn,
			options,
			password: dsn_password(base_dsn),
			admin_options,
			cleaned: false,
		})
	}

	pub fn dsn(&self) -> &str {
		&self.dsn
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// The test database as a configured endpoint, for pool-managed access.
	pub fn endpoint(&self) -> Endpoint {
		Endpoint {
			host: self.options.get_host().to_string(),
			port: self.options.get_port(),
			database: self.name.clone(),
			user: self.options.get_username().to_string(),
			password: self.password.clone().unwrap_or_default(),
		}
	}

	pub async fn connect(&self) -> Result<PgConnection> {
		Ok(PgConnection::connect_with(&self.options).await?)
	}

	/// Creates the externally owned event tables the ingestion pipeline reads from.
	pub async fn install_source_tables(&self) -> Result<()> {
		let mut conn = self.connect().await?;

		for statement in SOURCE_TABLES_SQL.split(';').map(str::trim).filter(|s| !s.is_empty()) {
			conn.execute(statement).await?;
		}

		conn.close().await?;

		Ok(())
	}

	pub async fn cleanup(mut self) -> Result<()> {
		self.cleanup_inner().await
	}

	async fn cleanup_inner(&mut self) -> Result<()> {
		if self.cleaned {
			return Ok(());
		}

		cleanup_database(&self.name, &self.admin_options).await?;

		self.cleaned = true;

		Ok(())
	}
}
impl Drop for TestDatabase {
	fn drop(&mut self) {
		if self.cleaned {
			return;
		}

		let name = self.name.clone();
		let admin_options = self.admin_options.clone();
		let cleanup_thread = thread::spawn(move || {
			let runtime = match Builder::new_current_thread().enable_all().build() {
				Ok(runtime) => runtime,
				Err(err) => {
					eprintln!("Test database cleanup failed: {err}.");

					return;
				},
			};

			if let Err(err) = runtime.block_on(cleanup_database(&name, &admin_options)) {
				eprintln!("Test database cleanup failed: {err}.");
			}
		});
		let _ = cleanup_thread.join();
	}
}

pub fn env_dsn() -> Option<String> {
	env::var("INBOX_PG_DSN").ok()
}

pub async fn with_test_db<F, Fut, T>(base_dsn: &str, f: F) -> Result<T>
where
	F: FnOnce(&TestDatabase) -> Fut,
	Fut: Future<Output = Result<T>>,
{
	let db = TestDatabase::new(base_dsn).await?;
	let result = f(&db).await;
	let mut db = db;

	if let Err(err) = db.cleanup_inner().await {
		eprintln!("Test database cleanup warning: {err}.");

		if result.is_ok() {
			return Err(err);
		}
	}

	result
}

async fn connect_admin(
	base_options: &PgConnectOptions,
) -> Result<(PgConnectOptions, PgConnection)> {
	let mut last_err = None;

	for database in ADMIN_DATABASES {
		let options = base_options.clone().database(database);

		match PgConnection::connect_with(&options).await {
			Ok(conn) => return Ok((options, conn)),
			Err(err) => {
				last_err = Some(err);
			},
		}
	}

	Err(Error::Message(format!("Failed to connect to an admin database: {last_err:?}.")))
}

async fn cleanup_database(name: &str, admin_options: &PgConnectOptions) -> Result<()> {
	let mut conn = PgConnection::connect_with(admin_options).await.map_err(|err| {
		Error::Message(format!("Failed to connect to admin database for cleanup: {err}."))
	})?;
	let drop_sql = format!(r#"DROP DATABASE IF EXISTS "{}""#, name);
	let _ = sqlx::query(
		"\
SELECT pg_terminate_backend(pid)
FROM pg_stat_activity
WHERE datname = $1 AND pid <> pg_backend_pid()",
	)
	.bind(name)
	.fetch_all(&mut conn)
	.await;

	sqlx::query(drop_sql.as_str())
		.execute(&mut conn)
		.await
		.map_err(|err| Error::Message(format!("Failed to drop test database: {err}.")))?;

	Ok(())
}

// `PgConnectOptions` does not expose the password, so it is read back from the URL.
fn dsn_password(dsn: &str) -> Option<String> {
	let parsed = url::Url::parse(dsn).ok()?;
	let password = parsed.password()?;

	let decoded = urlencoding::decode(password)
		.map(|p| p.into_owned())
		.unwrap_or_else(|_| password.to_string());

	Some(decoded)
}
