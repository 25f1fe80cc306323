use std::fmt::{Debug, Formatter, Result as FmtResult};

use serde::{Deserialize, Deserializer, de::Error as _};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	pub service: Service,
	pub storage: Storage,
	pub pool: Pool,
	pub ingest: Ingest,
	pub cache: Cache,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Service {
	#[serde(default = "default_log_level")]
	pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Storage {
	/// Shared ticketing store that owns the source event tables.
	pub source: Endpoint,
	/// Store that owns the notification table.
	pub inbox: Endpoint,
}

#[derive(Clone, Deserialize)]
pub struct Endpoint {
	pub host: String,
	#[serde(deserialize_with = "deserialize_port")]
	pub port: u16,
	pub database: String,
	pub user: String,
	#[serde(default)]
	pub password: String,
}
impl Debug for Endpoint {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("Endpoint")
			.field("host", &self.host)
			.field("port", &self.port)
			.field("database", &self.database)
			.field("user", &self.user)
			.field("password", &"[REDACTED]")
			.finish()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pool {
	/// Minimum number of idle connections each pool keeps open.
	#[serde(default = "default_pool_size")]
	pub pool_size: u32,
	#[serde(default = "default_max_connections")]
	pub max_connections: u32,
	#[serde(default = "default_timeout_ms")]
	pub connect_timeout_ms: u64,
	#[serde(default = "default_timeout_ms")]
	pub acquire_timeout_ms: u64,
	/// Wait for a free connection instead of failing when the pool is saturated.
	#[serde(default)]
	pub block_when_exhausted: bool,
	#[serde(default = "default_max_attempts")]
	pub max_attempts: u32,
	#[serde(default = "default_retry_delay_ms")]
	pub retry_delay_ms: u64,
	#[serde(default)]
	pub backoff: Backoff,
	#[serde(default = "default_max_retry_delay_ms")]
	pub max_retry_delay_ms: u64,
	#[serde(default = "default_max_lifetime_secs")]
	pub max_lifetime_secs: u64,
	#[serde(default = "default_idle_timeout_secs")]
	pub idle_timeout_secs: u64,
}
impl Default for Pool {
	fn default() -> Self {
		Self {
			pool_size: default_pool_size(),
			max_connections: default_max_connections(),
			connect_timeout_ms: default_timeout_ms(),
			acquire_timeout_ms: default_timeout_ms(),
			block_when_exhausted: false,
			max_attempts: default_max_attempts(),
			retry_delay_ms: default_retry_delay_ms(),
			backoff: Backoff::default(),
			max_retry_delay_ms: default_max_retry_delay_ms(),
			max_lifetime_secs: default_max_lifetime_secs(),
			idle_timeout_secs: default_idle_timeout_secs(),
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
	Fixed,
	#[default]
	Exponential,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ingest {
	#[serde(default = "default_interval_secs")]
	pub interval_secs: u64,
	/// Maximum number of source rows consumed per tick and event kind.
	#[serde(default = "default_batch_limit")]
	pub batch_limit: u32,
	#[serde(default = "default_status_change_table")]
	pub status_change_table: String,
	#[serde(default = "default_note_added_table")]
	pub note_added_table: String,
}
impl Default for Ingest {
	fn default() -> Self {
		Self {
			interval_secs: default_interval_secs(),
			batch_limit: default_batch_limit(),
			status_change_table: default_status_change_table(),
			note_added_table: default_note_added_table(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct Cache {
	#[serde(default = "default_cache_ttl_secs")]
	pub default_ttl_secs: u64,
	#[serde(default = "default_cache_max_entries")]
	pub max_entries: usize,
	#[serde(default = "default_sweep_interval_secs")]
	pub sweep_interval_secs: u64,
}
impl Default for Cache {
	fn default() -> Self {
		Self {
			default_ttl_secs: default_cache_ttl_secs(),
			max_entries: default_cache_max_entries(),
			sweep_interval_secs: default_sweep_interval_secs(),
		}
	}
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortValue {
	Number(i64),
	Text(String),
}

fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
	D: Deserializer<'de>,
{
	let number = match PortValue::deserialize(deserializer)? {
		PortValue::Number(number) => number,
		PortValue::Text(text) => text
			.trim()
			.parse::<i64>()
			.map_err(|_| D::Error::custom(format!("port {text:?} is not an integer")))?,
	};

	u16::try_from(number).map_err(|_| D::Error::custom(format!("port {number} is out of range")))
}

fn default_log_level() -> String {
	"info".to_string()
}

fn default_pool_size() -> u32 {
	2
}

fn default_max_connections() -> u32 {
	10
}

fn default_timeout_ms() -> u64 {
	5_000
}

fn default_max_attempts() -> u32 {
	3
}

fn default_retry_delay_ms() -> u64 {
	500
}

fn default_max_retry_delay_ms() -> u64 {
	30_000
}

fn default_max_lifetime_secs() -> u64 {
	1_800
}

fn default_idle_timeout_secs() -> u64 {
	600
}

fn default_interval_secs() -> u64 {
	60
}

fn default_batch_limit() -> u32 {
	50
}

fn default_status_change_table() -> String {
	"status_change_events".to_string()
}

fn default_note_added_table() -> String {
	"note_added_events".to_string()
}

fn default_cache_ttl_secs() -> u64 {
	30
}

fn default_cache_max_entries() -> usize {
	1_024
}

fn default_sweep_interval_secs() -> u64 {
	60
}
