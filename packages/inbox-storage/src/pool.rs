//! Lazily created, keyed connection pools with a retried direct-connect fallback.
//!
//! One pool exists per [`PoolKey`]. Pools are created without network I/O, so the map lock is
//! only ever held for a lookup or an insert. Saturation is reported as back-pressure, never as a
//! reason to open connections outside the pool.

use std::{
	collections::HashMap,
	fmt::{Display, Formatter, Result as FmtResult},
	ops::{Deref, DerefMut},
	sync::Mutex,
	time::Duration,
};

use sqlx::{
	Connection, PgConnection, PgPool, Postgres,
	pool::PoolConnection,
	postgres::{PgConnectOptions, PgPoolOptions},
};
use tokio::time;

use crate::{Error, Result};
use inbox_config::{Backoff, Endpoint, Pool as PoolSettings};

const MAX_BACKOFF_EXPONENT: u32 = 6;
const APPLICATION_NAME: &str = "inbox-sync";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
	pub host: String,
	pub port: u16,
	pub database: String,
	pub user: String,
}
impl From<&Endpoint> for PoolKey {
	fn from(endpoint: &Endpoint) -> Self {
		Self {
			host: endpoint.host.clone(),
			port: endpoint.port,
			database: endpoint.database.clone(),
			user: endpoint.user.clone(),
		}
	}
}
impl Display for PoolKey {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		write!(f, "{}@{}:{}/{}", self.user, self.host, self.port, self.database)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
	Transient,
	NonTransient,
}
impl FailureClass {
	pub fn is_transient(self) -> bool {
		matches!(self, Self::Transient)
	}
}

/// A checked-out connection. Never shared between callers.
#[derive(Debug)]
pub enum Conn {
	Pooled(PoolConnection<Postgres>),
	Direct(PgConnection),
}
impl Conn {
	pub fn is_direct(&self) -> bool {
		matches!(self, Self::Direct(_))
	}

	/// Returns a pooled connection to its pool, or closes a direct one gracefully.
	pub async fn release(self) {
		match self {
			Self::Pooled(conn) => drop(conn),
			Self::Direct(conn) =>
				if let Err(err) = conn.close().await {
					tracing::debug!(error = %err, "Closing direct connection failed.");
				},
		}
	}
}
impl Deref for Conn {
	type Target = PgConnection;

	fn deref(&self) -> &PgConnection {
		match self {
			Self::Pooled(conn) => &**conn,
			Self::Direct(conn) => conn,
		}
	}
}
impl DerefMut for Conn {
	fn deref_mut(&mut self) -> &mut PgConnection {
		match self {
			Self::Pooled(conn) => &mut **conn,
			Self::Direct(conn) => conn,
		}
	}
}

pub struct PoolManager {
	settings: PoolSettings,
	pools: Mutex<HashMap<PoolKey, PgPool>>,
}
impl PoolManager {
	pub fn new(settings: PoolSettings) -> Self {
		Self { settings, pools: Mutex::new(HashMap::new()) }
	}

	pub fn settings(&self) -> &PoolSettings {
		&self.settings
	}

	pub fn pool_count(&self) -> usize {
		self.pools.lock().unwrap_or_else(|err| err.into_inner()).len()
	}

	pub async fn acquire(&self, endpoint: &Endpoint) -> Result<Conn> {
		let key = PoolKey::from(endpoint);
		let options = connect_options(endpoint);
		let pool = self.pool_for(&key, &options);

		loop {
			let err = match pool.acquire().await {
				Ok(conn) => return Ok(Conn::Pooled(conn)),
				Err(err) => err,
			};

			if matches!(err, sqlx::Error::PoolTimedOut) && is_saturated(&pool) {
				if self.settings.block_when_exhausted {
					tracing::debug!(
						pool = %key,
						"Pool saturated. Waiting for a connection to free up."
					);

					continue;
				}

				tracing::warn!(pool = %key, "Pool saturated. Giving up on acquisition.");

				return Err(Error::PoolExhausted {
					pool: key.to_string(),
					waited_ms: self.settings.acquire_timeout_ms,
				});
			}
			if !classify(&err).is_transient() {
				return Err(Error::NonTransient { pool: key.to_string(), source: err });
			}

			tracing::warn!(
				pool = %key,
				error = %err,
				"Pooled acquisition failed. Falling back to a direct connection."
			);

			break;
		}

		self.connect_direct(&key, &options).await.map(Conn::Direct)
	}

	/// Closes every pool. Connections already checked out are closed when they are returned.
	pub async fn close_all(&self) {
		let pools: Vec<(PoolKey, PgPool)> =
			self.pools.lock().unwrap_or_else(|err| err.into_inner()).drain().collect();

		for (key, pool) in pools {
			pool.close().await;

			tracing::info!(pool = %key, "Closed connection pool.");
		}
	}

	fn pool_for(&self, key: &PoolKey, options: &PgConnectOptions) -> PgPool {
		let mut pools = self.pools.lock().unwrap_or_else(|err| err.into_inner());

		pools
			.entry(key.clone())
			.or_insert_with(|| {
				tracing::info!(
					pool = %key,
					min_idle = self.settings.pool_size,
					max_connections = self.settings.max_connections,
					"Creating connection pool."
				);

				self.pool_options().connect_lazy_with(options.clone())
			})
			.clone()
	}

	fn pool_options(&self) -> PgPoolOptions {
		PgPoolOptions::new()
			.min_connections(self.settings.pool_size)
			.max_connections(self.settings.max_connections)
			.acquire_timeout(Duration::from_millis(self.settings.acquire_timeout_ms))
			.test_before_acquire(true)
			.max_lifetime(Duration::from_secs(self.settings.max_lifetime_secs))
			.idle_timeout(Duration::from_secs(self.settings.idle_timeout_secs))
	}

	async fn connect_direct(
		&self,
		key: &PoolKey,
		options: &PgConnectOptions,
	) -> Result<PgConnection> {
		let max_attempts = self.settings.max_attempts.max(1);
		let connect_timeout = Duration::from_millis(self.settings.connect_timeout_ms);
		let mut last_error = String::new();

		for attempt in 1..=max_attempts {
			let connecting = time::timeout(connect_timeout, PgConnection::connect_with(options));
			let message = match connecting.await {
				Ok(Ok(conn)) => {
					tracing::info!(pool = %key, attempt, "Direct connection established.");

					return Ok(conn);
				},
				Ok(Err(err)) => {
					if !classify(&err).is_transient() {
						return Err(Error::NonTransient { pool: key.to_string(), source: err });
					}

					err.to_string()
				},
				Err(_) =>
					format!("connect timed out after {} ms", self.settings.connect_timeout_ms),
			};

			tracing::warn!(
				pool = %key,
				attempt,
				max_attempts,
				error = %message,
				"Direct connection attempt failed."
			);

			last_error = message;

			if attempt < max_attempts {
				time::sleep(retry_delay(&self.settings, attempt)).await;
			}
		}

		Err(Error::RetriesExhausted { pool: key.to_string(), attempts: max_attempts, last_error })
	}
}

pub fn connect_options(endpoint: &Endpoint) -> PgConnectOptions {
	PgConnectOptions::new()
		.host(&endpoint.host)
		.port(endpoint.port)
		.database(&endpoint.database)
		.username(&endpoint.user)
		.password(&endpoint.password)
		.application_name(APPLICATION_NAME)
}

/// Delay before the attempt following `attempt` (1-based).
pub fn retry_delay(settings: &PoolSettings, attempt: u32) -> Duration {
	let base = settings.retry_delay_ms;
	let millis = match settings.backoff {
		Backoff::Fixed => base,
		Backoff::Exponential => {
			let exp = attempt.max(1).saturating_sub(1).min(MAX_BACKOFF_EXPONENT);

			base.saturating_mul(1 << exp).min(settings.max_retry_delay_ms)
		},
	};

	Duration::from_millis(millis)
}

pub fn classify(err: &sqlx::Error) -> FailureClass {
	match err {
		sqlx::Error::Io(_)
		| sqlx::Error::Tls(_)
		| sqlx::Error::Protocol(_)
		| sqlx::Error::PoolTimedOut
		| sqlx::Error::WorkerCrashed => FailureClass::Transient,
		sqlx::Error::Database(db) => match db.code() {
			Some(code) => classify_sqlstate(&code),
			None => FailureClass::Transient,
		},
		_ => FailureClass::NonTransient,
	}
}

pub fn classify_sqlstate(code: &str) -> FailureClass {
	// Class 08 is connection exceptions; the rest are overload, shutdown and conflict retries.
	if code.starts_with("08")
		|| matches!(code, "53300" | "57P01" | "57P02" | "57P03" | "40001" | "40P01")
	{
		FailureClass::Transient
	} else {
		FailureClass::NonTransient
	}
}

fn is_saturated(pool: &PgPool) -> bool {
	pool.size() >= pool.options().get_max_connections() && pool.num_idle() == 0
}
