pub mod models;
pub mod notifications;
pub mod pool;
pub mod schema;
pub mod source;
pub mod store;

mod error;

pub use error::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;
