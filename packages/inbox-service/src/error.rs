pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Invalid argument: {message}")]
	InvalidArgument { message: String },
	#[error("No async runtime is available. Schedule jobs from within a Tokio runtime.")]
	NoRuntime,
	#[error(transparent)]
	Storage(#[from] inbox_storage::Error),
}
