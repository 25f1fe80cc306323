use std::{sync::Arc, time::Duration};

use time::OffsetDateTime;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{Error, Result};
use inbox_cache::{Clock, SystemClock, TtlCache};
use inbox_config::Cache as CacheSettings;
use inbox_storage::{models::Notification, store::NotificationStore};

/// Read side of the owned notification table, shielded by short-lived caches.
pub struct InboxReader {
	store: Arc<dyn NotificationStore>,
	counts: Arc<TtlCache<i64, i64>>,
	pages: Arc<TtlCache<(i64, u32), Arc<Vec<Notification>>>>,
}
impl InboxReader {
	pub fn new(store: Arc<dyn NotificationStore>, settings: &CacheSettings) -> Self {
		Self::with_clock(store, settings, Arc::new(SystemClock))
	}

	pub fn with_clock(
		store: Arc<dyn NotificationStore>,
		settings: &CacheSettings,
		clock: Arc<dyn Clock>,
	) -> Self {
		let ttl = Duration::from_secs(settings.default_ttl_secs);

		Self {
			store,
			counts: Arc::new(TtlCache::with_clock(ttl, settings.max_entries, clock.clone())),
			pages: Arc::new(TtlCache::with_clock(ttl, settings.max_entries, clock)),
		}
	}

	pub async fn unread_count(&self, user_id: i64) -> Result<i64> {
		let ttl = self.counts.default_ttl();
		let count = self
			.counts
			.get_or_try_insert_with(user_id, ttl, move || async move {
				let mut session = self.store.open().await?;
				let count = session.count_unread(user_id).await;

				session.release().await;

				count
			})
			.await?;

		Ok(count)
	}

	/// Newest notifications first, at most `limit`.
	pub async fn recent(&self, user_id: i64, limit: u32) -> Result<Arc<Vec<Notification>>> {
		if limit == 0 {
			return Err(Error::InvalidArgument {
				message: "limit must be greater than zero.".to_string(),
			});
		}

		let ttl = self.pages.default_ttl();
		let page = self
			.pages
			.get_or_try_insert_with((user_id, limit), ttl, move || async move {
				let mut session = self.store.open().await?;
				let page = session.recent(user_id, limit).await;

				session.release().await;

				page.map(Arc::new)
			})
			.await?;

		Ok(page)
	}

	/// Marks the user's notifications read. Ids owned by other users are ignored.
	pub async fn mark_read(&self, user_id: i64, notification_ids: &[Uuid]) -> Result<u64> {
		if notification_ids.is_empty() {
			return Ok(0);
		}

		let mut session = self.store.open().await?;
		let updated = session.mark_read(user_id, notification_ids, OffsetDateTime::now_utc()).await;

		session.release().await;

		let updated = updated?;

		self.invalidate(user_id);

		tracing::debug!(user_id, updated, "Marked notifications read.");

		Ok(updated)
	}

	/// Drops every cached view of the user's inbox.
	pub fn invalidate(&self, user_id: i64) {
		self.counts.delete(&user_id);
		self.pages.delete_matching(|(owner, _)| *owner == user_id);
	}

	pub fn spawn_sweepers(&self, interval: Duration) -> Vec<JoinHandle<()>> {
		vec![self.counts.spawn_sweeper(interval), self.pages.spawn_sweeper(interval)]
	}
}
