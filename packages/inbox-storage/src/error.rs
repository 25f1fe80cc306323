#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Sqlx(#[from] sqlx::Error),
	#[error("Invalid argument: {0}")]
	InvalidArgument(String),
	#[error("Malformed row: {0}")]
	Malformed(String),
	#[error("Connection pool {pool} is exhausted; no connection freed within {waited_ms} ms.")]
	PoolExhausted { pool: String, waited_ms: u64 },
	#[error("Gave up connecting to {pool} after {attempts} attempts: {last_error}")]
	RetriesExhausted { pool: String, attempts: u32, last_error: String },
	#[error("Non-retryable failure connecting to {pool}: {source}")]
	NonTransient { pool: String, source: sqlx::Error },
}
impl Error {
	/// Whether a later attempt could plausibly succeed without operator intervention.
	pub fn is_transient(&self) -> bool {
		match self {
			Self::Sqlx(err) => crate::pool::classify(err).is_transient(),
			Self::PoolExhausted { .. } | Self::RetriesExhausted { .. } => true,
			Self::InvalidArgument(_) | Self::Malformed(_) | Self::NonTransient { .. } => false,
		}
	}
}
