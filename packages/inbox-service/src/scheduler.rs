//! At most one recurring sync job per user.
//!
//! The scheduler binds to the Tokio runtime of its first registration and spawns one task per job.
//! Every firing runs in a task of its own, so a panicking tick is contained and the job keeps its
//! timer. Cancelling a job stops future firings only.

use std::{
	collections::HashMap,
	sync::{
		Arc, Mutex, MutexGuard, OnceLock,
		atomic::{AtomicU64, Ordering},
	},
	time::Duration,
};

use tokio::{
	runtime::Handle,
	time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result, ingest::TickReport};
use inbox_storage::store::BoxFuture;

/// The identity a job captures when it is scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
	pub user_id: i64,
	pub email: String,
}

/// Work performed on every firing of a user's job.
pub trait TickRunner
where
	Self: Send + Sync,
{
	fn run_tick<'a>(&'a self, user: &'a UserIdentity) -> BoxFuture<'a, TickReport>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
	pub user_id: i64,
	pub email: String,
	pub interval: Duration,
	/// Increases on every registration, so a replacement is distinguishable from the job it
	/// replaced.
	pub generation: u64,
}

struct UserJob {
	email: String,
	interval: Duration,
	generation: u64,
	cancel: CancellationToken,
}

pub struct UserJobScheduler {
	runner: Arc<dyn TickRunner>,
	runtime: OnceLock<Handle>,
	jobs: Mutex<HashMap<i64, UserJob>>,
	generations: AtomicU64,
}
impl UserJobScheduler {
	pub fn new(runner: Arc<dyn TickRunner>) -> Self {
		Self {
			runner,
			runtime: OnceLock::new(),
			jobs: Mutex::new(HashMap::new()),
			generations: AtomicU64::new(0),
		}
	}

	/// Registers a job for `user_id`, replacing any existing one. Returns the new job's generation.
	///
	/// The first firing happens one `interval` after registration.
	pub fn schedule_user_job(&self, user_id: i64, email: &str, interval: Duration) -> Result<u64> {
		if interval.is_zero() {
			return Err(Error::InvalidArgument {
				message: "interval must be greater than zero.".to_string(),
			});
		}

		let email = email.trim();

		if email.is_empty() {
			return Err(Error::InvalidArgument { message: "email must be non-empty.".to_string() });
		}

		let runtime = self.runtime()?;
		let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
		let cancel = CancellationToken::new();
		let user = UserIdentity { user_id, email: email.to_string() };
		let previous = self.lock().insert(
			user_id,
			UserJob { email: user.email.clone(), interval, generation, cancel: cancel.clone() },
		);

		if let Some(previous) = previous {
			previous.cancel.cancel();

			tracing::info!(
				user_id,
				replaced_generation = previous.generation,
				"Replacing existing user job."
			);
		}

		runtime.spawn(run_job(self.runner.clone(), user, interval, cancel));

		tracing::info!(
			user_id,
			interval_ms = interval.as_millis() as u64,
			generation,
			"Scheduled user job."
		);

		Ok(generation)
	}

	/// Removes the job for `user_id`. Returns whether one existed.
	pub fn cancel_user_job(&self, user_id: i64) -> bool {
		let Some(job) = self.lock().remove(&user_id) else {
			tracing::warn!(user_id, "No job scheduled for user. Nothing to cancel.");

			return false;
		};

		job.cancel.cancel();

		tracing::info!(user_id, generation = job.generation, "Cancelled user job.");

		true
	}

	pub fn is_scheduled(&self, user_id: i64) -> bool {
		self.lock().contains_key(&user_id)
	}

	pub fn job_count(&self) -> usize {
		self.lock().len()
	}

	pub fn scheduled_users(&self) -> Vec<i64> {
		let mut users: Vec<i64> = self.lock().keys().copied().collect();

		users.sort_unstable();

		users
	}

	pub fn job(&self, user_id: i64) -> Option<JobInfo> {
		self.lock().get(&user_id).map(|job| JobInfo {
			user_id,
			email: job.email.clone(),
			interval: job.interval,
			generation: job.generation,
		})
	}

	/// Cancels every job. Returns how many were cancelled.
	pub fn shutdown(&self) -> usize {
		let jobs: Vec<(i64, UserJob)> = self.lock().drain().collect();

		for (_, job) in &jobs {
			job.cancel.cancel();
		}

		if !jobs.is_empty() {
			tracing::info!(cancelled = jobs.len(), "User job scheduler shut down.");
		}

		jobs.len()
	}

	fn runtime(&self) -> Result<&Handle> {
		if let Some(handle) = self.runtime.get() {
			return Ok(handle);
		}

		let current = Handle::try_current().map_err(|_| Error::NoRuntime)?;
		let mut bound = false;
		let handle = self.runtime.get_or_init(|| {
			bound = true;

			current
		});

		if bound {
			tracing::info!("User job scheduler started.");
		}

		Ok(handle)
	}

	fn lock(&self) -> MutexGuard<'_, HashMap<i64, UserJob>> {
		self.jobs.lock().unwrap_or_else(|err| err.into_inner())
	}
}
impl Drop for UserJobScheduler {
	fn drop(&mut self) {
		for job in self.jobs.get_mut().unwrap_or_else(|err| err.into_inner()).values() {
			job.cancel.cancel();
		}
	}
}

async fn run_job(
	runner: Arc<dyn TickRunner>,
	user: UserIdentity,
	interval: Duration,
	cancel: CancellationToken,
) {
	let mut ticker = time::interval_at(time::Instant::now() + interval, interval);

	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			biased;
			_ = cancel.cancelled() => break,
			_ = ticker.tick() => {},
		}

		let tick_runner = runner.clone();
		let tick_user = user.clone();
		let tick = tokio::spawn(async move { tick_runner.run_tick(&tick_user).await });

		match tick.await {
			Ok(report) => report.log(),
			Err(err) if err.is_panic() => {
				tracing::error!(
					user_id = user.user_id,
					"User job tick panicked. The job keeps running."
				);
			},
			Err(err) => {
				tracing::warn!(
					user_id = user.user_id,
					error = %err,
					"User job tick did not complete."
				);
			},
		}
	}

	tracing::debug!(user_id = user.user_id, "User job stopped.");
}
