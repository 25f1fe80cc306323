pub mod inbox;
pub mod ingest;
pub mod scheduler;

mod error;

pub use error::{Error, Result};
pub use inbox::InboxReader;
pub use ingest::{IngestError, IngestionPipeline, KindReport, StoreRole, TickReport};
pub use scheduler::{JobInfo, TickRunner, UserIdentity, UserJobScheduler};

use std::{
	sync::{Arc, Mutex},
	time::Duration,
};

use tokio::{runtime::Handle, task::JoinHandle};

use inbox_config::Config;
use inbox_storage::{
	notifications::PgNotificationStore,
	pool::PoolManager,
	source::{PgSourceStore, SourceTables},
	store::{BoxFuture, NotificationStore, SourceStore},
};

/// Runs the pipeline and drops cached inbox views that new notifications made stale.
struct SyncRunner {
	pipeline: IngestionPipeline,
	reader: Arc<InboxReader>,
}
impl TickRunner for SyncRunner {
	fn run_tick<'a>(&'a self, user: &'a UserIdentity) -> BoxFuture<'a, TickReport> {
		Box::pin(async move {
			let report = self.pipeline.sync_user(user).await;

			if report.processed() > 0 {
				self.reader.invalidate(user.user_id);
			}

			report
		})
	}
}

/// Owns everything the background sync needs. Build one per process and share it by reference.
pub struct SyncEngine {
	cfg: Config,
	pools: Option<Arc<PoolManager>>,
	runner: Arc<SyncRunner>,
	reader: Arc<InboxReader>,
	scheduler: UserJobScheduler,
	maintenance: Mutex<Vec<JoinHandle<()>>>,
}
impl SyncEngine {
	pub fn new(
		cfg: Config,
		source: Arc<dyn SourceStore>,
		inbox: Arc<dyn NotificationStore>,
	) -> Self {
		let reader = Arc::new(InboxReader::new(inbox.clone(), &cfg.cache));
		let pipeline = IngestionPipeline::new(source, inbox, cfg.ingest.batch_limit);
		let runner = Arc::new(SyncRunner { pipeline, reader: reader.clone() });
		let scheduler = UserJobScheduler::new(runner.clone());

		Self { cfg, pools: None, runner, reader, scheduler, maintenance: Mutex::new(Vec::new()) }
	}

	/// Wires the Postgres stores behind one pool manager and bootstraps the inbox schema.
	pub async fn connect(cfg: Config) -> Result<Self> {
		let pools = Arc::new(PoolManager::new(cfg.pool.clone()));
		let inbox = PgNotificationStore::new(pools.clone(), cfg.storage.inbox.clone());

		inbox.ensure_schema().await?;

		let source = PgSourceStore::new(
			pools.clone(),
			cfg.storage.source.clone(),
			SourceTables::from_config(&cfg.ingest),
		);
		let mut engine = Self::new(cfg, Arc::new(source), Arc::new(inbox));

		engine.pools = Some(pools);

		tracing::info!("Sync engine connected.");

		Ok(engine)
	}

	pub fn config(&self) -> &Config {
		&self.cfg
	}

	pub fn scheduler(&self) -> &UserJobScheduler {
		&self.scheduler
	}

	pub fn reader(&self) -> &InboxReader {
		&self.reader
	}

	pub fn pools(&self) -> Option<&PoolManager> {
		self.pools.as_deref()
	}

	/// Starts or restarts the user's sync job at the configured interval.
	pub fn start(&self, user_id: i64, email: &str) -> Result<u64> {
		self.start_with_interval(user_id, email, Duration::from_secs(self.cfg.ingest.interval_secs))
	}

	pub fn start_with_interval(
		&self,
		user_id: i64,
		email: &str,
		interval: Duration,
	) -> Result<u64> {
		self.scheduler.schedule_user_job(user_id, email, interval)
	}

	pub fn stop(&self, user_id: i64) -> bool {
		self.scheduler.cancel_user_job(user_id)
	}

	/// Runs one sync tick for the user now, outside the scheduler.
	pub async fn run_once(&self, user_id: i64, email: &str) -> Result<TickReport> {
		let email = email.trim();

		if email.is_empty() {
			return Err(Error::InvalidArgument { message: "email must be non-empty.".to_string() });
		}

		let user = UserIdentity { user_id, email: email.to_string() };
		let report = self.runner.run_tick(&user).await;

		report.log();

		Ok(report)
	}

	/// Spawns the periodic cache sweepers.
	pub fn start_maintenance(&self) -> Result<()> {
		Handle::try_current().map_err(|_| Error::NoRuntime)?;

		let interval = Duration::from_secs(self.cfg.cache.sweep_interval_secs);
		let handles = self.reader.spawn_sweepers(interval);

		self.maintenance.lock().unwrap_or_else(|err| err.into_inner()).extend(handles);

		tracing::info!(
			interval_secs = self.cfg.cache.sweep_interval_secs,
			"Cache sweepers started."
		);

		Ok(())
	}

	/// Cancels every job, stops maintenance and closes the pools.
	pub async fn shutdown(&self) {
		let cancelled = self.scheduler.shutdown();
		let maintenance: Vec<JoinHandle<()>> =
			self.maintenance.lock().unwrap_or_else(|err| err.into_inner()).drain(..).collect();

		for handle in maintenance {
			handle.abort();
		}

		if let Some(pools) = &self.pools {
			pools.close_all().await;
		}

		tracing::info!(cancelled_jobs = cancelled, "Sync engine shut down.");
	}
}
