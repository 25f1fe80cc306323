mod error;
mod types;

pub use error::{Error, Result};
pub use types::{Backoff, Cache, Config, Endpoint, Ingest, Pool, Service, Storage};

use std::{fs, path::Path};

pub fn load(path: &Path) -> Result<Config> {
	let raw = fs::read_to_string(path)
		.map_err(|err| Error::ReadConfig { path: path.to_path_buf(), source: err })?;

	let mut cfg: Config = toml::from_str(&raw)
		.map_err(|err| Error::ParseConfig { path: path.to_path_buf(), source: err })?;

	normalize(&mut cfg);

	validate(&cfg)?;

	Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<()> {
	let endpoints =
		[("storage.source", &cfg.storage.source), ("storage.inbox", &cfg.storage.inbox)];

	for (label, endpoint) in endpoints {
		for (field, value) in [
			("host", &endpoint.host),
			("database", &endpoint.database),
			("user", &endpoint.user),
		] {
			if value.trim().is_empty() {
				return Err(Error::Validation {
					message: format!("{label}.{field} must be non-empty."),
				});
			}
		}

		if endpoint.port == 0 {
			return Err(Error::Validation {
				message: format!("{label}.port must be greater than zero."),
			});
		}
	}

	validate_pool(&cfg.pool)?;

	if cfg.ingest.interval_secs == 0 {
		return Err(Error::Validation {
			message: "ingest.interval_secs must be greater than zero.".to_string(),
		});
	}
	if cfg.ingest.batch_limit == 0 {
		return Err(Error::Validation {
			message: "ingest.batch_limit must be greater than zero.".to_string(),
		});
	}

	for (label, table) in [
		("ingest.status_change_table", &cfg.ingest.status_change_table),
		("ingest.note_added_table", &cfg.ingest.note_added_table),
	] {
		if !is_table_identifier(table) {
			return Err(Error::Validation {
				message: format!("{label} must be a plain or schema-qualified SQL identifier."),
			});
		}
	}

	if cfg.ingest.status_change_table == cfg.ingest.note_added_table {
		return Err(Error::Validation {
			message: "ingest.status_change_table and ingest.note_added_table must differ."
				.to_string(),
		});
	}
	if cfg.cache.default_ttl_secs == 0 {
		return Err(Error::Validation {
			message: "cache.default_ttl_secs must be greater than zero.".to_string(),
		});
	}
	if cfg.cache.max_entries == 0 {
		return Err(Error::Validation {
			message: "cache.max_entries must be greater than zero.".to_string(),
		});
	}
	if cfg.cache.sweep_interval_secs == 0 {
		return Err(Error::Validation {
			message: "cache.sweep_interval_secs must be greater than zero.".to_string(),
		});
	}

	Ok(())
}

fn validate_pool(pool: &Pool) -> Result<()> {
	if pool.max_connections == 0 {
		return Err(Error::Validation {
			message: "pool.max_connections must be greater than zero.".to_string(),
		});
	}
	if pool.pool_size > pool.max_connections {
		return Err(Error::Validation {
			message: "pool.pool_size must not exceed pool.max_connections.".to_string(),
		});
	}
	if pool.max_attempts == 0 {
		return Err(Error::Validation {
			message: "pool.max_attempts must be greater than zero.".to_string(),
		});
	}

	for (label, value) in [
		("pool.connect_timeout_ms", pool.connect_timeout_ms),
		("pool.acquire_timeout_ms", pool.acquire_timeout_ms),
		("pool.max_lifetime_secs", pool.max_lifetime_secs),
		("pool.idle_timeout_secs", pool.idle_timeout_secs),
	] {
		if value == 0 {
			return Err(Error::Validation {
				message: format!("{label} must be greater than zero."),
			});
		}
	}

	if pool.max_retry_delay_ms < pool.retry_delay_ms {
		return Err(Error::Validation {
			message: "pool.max_retry_delay_ms must be at least pool.retry_delay_ms.".to_string(),
		});
	}

	Ok(())
}

fn normalize(cfg: &mut Config) {
	for endpoint in [&mut cfg.storage.source, &mut cfg.storage.inbox] {
		endpoint.host = endpoint.host.trim().to_string();
		endpoint.database = endpoint.database.trim().to_string();
		endpoint.user = endpoint.user.trim().to_string();
	}

	cfg.ingest.status_change_table = cfg.ingest.status_change_table.trim().to_string();
	cfg.ingest.note_added_table = cfg.ingest.note_added_table.trim().to_string();

	if cfg.service.log_level.trim().is_empty() {
		cfg.service.log_level = "info".to_string();
	}
}

fn is_table_identifier(name: &str) -> bool {
	let parts: Vec<&str> = name.split('.').collect();

	if parts.len() > 2 {
		return false;
	}

	parts.iter().all(|part| {
		let mut chars = part.chars();

		match chars.next() {
			Some(first) if first.is_ascii_alphabetic() || first == '_' =>
				chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
			_ => false,
		}
	})
}
