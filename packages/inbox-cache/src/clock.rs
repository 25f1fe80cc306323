use std::{
	sync::{Arc, Mutex},
	time::{Duration, Instant},
};

pub trait Clock
where
	Self: Send + Sync,
{
	fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;
impl Clock for SystemClock {
	fn now(&self) -> Instant {
		Instant::now()
	}
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
	base: Instant,
	offset: Arc<Mutex<Duration>>,
}
impl ManualClock {
	pub fn new() -> Self {
		Self { base: Instant::now(), offset: Arc::new(Mutex::new(Duration::ZERO)) }
	}

	pub fn advance(&self, by: Duration) {
		let mut offset = self.offset.lock().unwrap_or_else(|err| err.into_inner());

		*offset += by;
	}
}
impl Default for ManualClock {
	fn default() -> Self {
		Self::new()
	}
}
impl Clock for ManualClock {
	fn now(&self) -> Instant {
		self.base + *self.offset.lock().unwrap_or_else(|err| err.into_inner())
	}
}
