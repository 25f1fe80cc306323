//! In-process TTL cache with write-ordered eviction.
//!
//! Expired entries are misses on read but stay resident until [`TtlCache::sweep`] finds them
//! older than twice their ttl, or until write pressure evicts them. Eviction always removes the
//! entries written longest ago; reads never change that order.

mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

use std::{
	borrow::Borrow,
	future::Future,
	hash::Hash,
	sync::{Arc, Mutex, MutexGuard},
	time::{Duration, Instant},
};

use lru::LruCache;
use tokio::{task::JoinHandle, time};

struct Entry<V> {
	value: V,
	written_at: Instant,
	ttl: Duration,
}
impl<V> Entry<V> {
	fn age(&self, now: Instant) -> Duration {
		now.saturating_duration_since(self.written_at)
	}
}

pub struct TtlCache<K, V>
where
	K: Hash + Eq,
{
	// Recency order of the LRU list is write order: only `put` promotes.
	entries: Mutex<LruCache<K, Entry<V>>>,
	clock: Arc<dyn Clock>,
	default_ttl: Duration,
	max_entries: usize,
}
impl<K, V> TtlCache<K, V>
where
	K: Hash + Eq,
	V: Clone,
{
	pub fn new(default_ttl: Duration, max_entries: usize) -> Self {
		Self::with_clock(default_ttl, max_entries, Arc::new(SystemClock))
	}

	pub fn with_clock(default_ttl: Duration, max_entries: usize, clock: Arc<dyn Clock>) -> Self {
		Self {
			entries: Mutex::new(LruCache::unbounded()),
			clock,
			default_ttl,
			max_entries: max_entries.max(1),
		}
	}

	pub fn default_ttl(&self) -> Duration {
		self.default_ttl
	}

	pub fn max_entries(&self) -> usize {
		self.max_entries
	}

	pub fn get<Q>(&self, key: &Q) -> Option<V>
	where
		K: Borrow<Q>,
		Q: Hash + Eq + ?Sized,
	{
		let now = self.clock.now();
		let entries = self.lock();
		let entry = entries.peek(key)?;

		if entry.age(now) >= entry.ttl {
			return None;
		}

		Some(entry.value.clone())
	}

	pub fn set(&self, key: K, value: V, ttl: Duration) {
		let now = self.clock.now();
		let mut entries = self.lock();

		entries.put(key, Entry { value, written_at: now, ttl });

		let evicted = evict_overflow(&mut entries, self.max_entries);

		if evicted > 0 {
			tracing::debug!(evicted, remaining = entries.len(), "Evicted oldest cache entries.");
		}
	}

	pub fn insert(&self, key: K, value: V) {
		self.set(key, value, self.default_ttl);
	}

	pub fn delete<Q>(&self, key: &Q) -> Option<V>
	where
		K: Borrow<Q>,
		Q: Hash + Eq + ?Sized,
	{
		self.lock().pop(key).map(|entry| entry.value)
	}

	/// Removes every entry whose key matches `predicate`. Returns how many were removed.
	pub fn delete_matching<F>(&self, predicate: F) -> usize
	where
		K: Clone,
		F: Fn(&K) -> bool,
	{
		let mut entries = self.lock();
		let keys: Vec<K> =
			entries.iter().filter(|(key, _)| predicate(key)).map(|(key, _)| key.clone()).collect();

		for key in &keys {
			entries.pop(key);
		}

		keys.len()
	}

	pub fn clear(&self) {
		self.lock().clear();
	}

	/// Drops entries older than twice their ttl. Returns how many were removed.
	pub fn sweep(&self) -> usize
	where
		K: Clone,
	{
		let now = self.clock.now();
		let mut entries = self.lock();
		let stale: Vec<K> = entries
			.iter()
			.filter(|(_, entry)| entry.age(now) > entry.ttl.saturating_mul(2))
			.map(|(key, _)| key.clone())
			.collect();

		for key in &stale {
			entries.pop(key);
		}

		if !stale.is_empty() {
			tracing::debug!(
				removed = stale.len(),
				remaining = entries.len(),
				"Swept stale cache entries."
			);
		}

		stale.len()
	}

	pub fn len(&self) -> usize {
		self.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.lock().is_empty()
	}

	/// Returns the cached value or computes, stores and returns a fresh one. The computation runs
	/// without holding the lock, so concurrent misses for one key may compute twice.
	pub async fn get_or_try_insert_with<F, Fut, E>(
		&self,
		key: K,
		ttl: Duration,
		compute: F,
	) -> Result<V, E>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<V, E>>,
	{
		if let Some(value) = self.get(&key) {
			return Ok(value);
		}

		let value = compute().await?;

		self.set(key, value.clone(), ttl);

		Ok(value)
	}

	fn lock(&self) -> MutexGuard<'_, LruCache<K, Entry<V>>> {
		self.entries.lock().unwrap_or_else(|err| err.into_inner())
	}
}
impl<K, V> TtlCache<K, V>
where
	K: Hash + Eq + Clone + Send + Sync + 'static,
	V: Clone + Send + Sync + 'static,
{
	/// Runs [`TtlCache::sweep`] every `interval` until the cache is dropped.
	pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
		let cache = Arc::downgrade(self);

		tokio::spawn(async move {
			let mut ticker = time::interval_at(time::Instant::now() + interval, interval);

			ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

			loop {
				ticker.tick().await;

				let Some(cache) = cache.upgrade() else {
					break;
				};

				cache.sweep();
			}
		})
	}
}

// Removes the overage plus a tenth of the ceiling so a full cache does not evict on every write.
fn evict_overflow<K, V>(entries: &mut LruCache<K, Entry<V>>, max_entries: usize) -> usize
where
	K: Hash + Eq,
{
	if entries.len() <= max_entries {
		return 0;
	}

	let target = entries.len() - max_entries + (max_entries / 10).max(1);
	let mut evicted = 0;

	while evicted < target && entries.pop_lru().is_some() {
		evicted += 1;
	}

	evicted
}
