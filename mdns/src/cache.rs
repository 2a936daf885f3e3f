//! Per-interface cache of records learned from the network
//! (`avahi-core/cache.c`). Every cached record carries its own staged-TTL
//! expiry timer; `Cache` owns the timer queue so the interface driving it
//! only has to call [`Cache::process_due`] once per tick.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use collections::arena::{Arena, Index};
use rand::Rng;
use wire::{ResourceKey, ResourceRecord};

use crate::time_event::{Handle, TimeEventQueue};

/// `AVAHI_MAX_CACHE_ENTRIES` — the documented cap from the newer
/// `avahi_*` path (see Design Notes' Open Questions).
pub const MAX_CACHE_ENTRIES: usize = 200;

/// The percentages of TTL at which a cache entry re-queries (if
/// subscribed) or, at 100%, expires for good (RFC 6762 §5.2).
const REFRESH_STAGES: [f64; 5] = [0.80, 0.85, 0.90, 0.95, 1.00];

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RefreshState {
	Valid,
	Expiry1,
	Expiry2,
	Expiry3,
	Final,
}

impl RefreshState {
	fn for_stage(stage: usize) -> Self {
		match stage {
			0 => Self::Valid,
			1 => Self::Expiry1,
			2 => Self::Expiry2,
			_ => Self::Expiry3,
		}
	}
}

pub struct CacheEntry {
	pub record: ResourceRecord,
	pub origin: IpAddr,
	pub timestamp: Instant,
	pub cache_flush: bool,
	pub state: RefreshState,
	stage: usize,
	/// Set right after the entry is inserted (the timer needs the
	/// entry's own arena index as its payload, so it can only be created
	/// once the entry already exists).
	timer: Option<Handle<Index<CacheEntry>>>,
}

impl CacheEntry {
	/// True once the entry has lived past half its original TTL — the
	/// scheduler excludes such records from known-answer packing since a
	/// peer relying on them is about to see them disappear anyway.
	pub fn is_half_expired(&self, now: Instant) -> bool {
		now.saturating_duration_since(self.timestamp) >= Duration::from_secs_f64(self.record.ttl as f64 * 0.5)
	}
}

pub enum CacheUpdate {
	New,
	Refreshed,
	ScheduledFinalExpiry,
	Dropped,
}

#[derive(Default)]
pub struct CacheTick {
	/// Keys to re-query because a subscriber exists and the entry is
	/// approaching expiry.
	pub requeries: Vec<ResourceKey>,
	pub removed: Vec<ResourceRecord>,
}

pub struct Cache {
	entries: Arena<CacheEntry>,
	chains: HashMap<ResourceKey, Vec<Index<CacheEntry>>>,
	timers: TimeEventQueue<Index<CacheEntry>>,
}

impl Default for Cache {
	fn default() -> Self {
		Self { entries: Arena::new(), chains: HashMap::new(), timers: TimeEventQueue::new() }
	}
}

impl Cache {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn get(&self, idx: Index<CacheEntry>) -> Option<&CacheEntry> {
		self.entries.get(idx)
	}

	pub fn next_wakeup(&mut self) -> Option<Instant> {
		self.timers.next_wakeup()
	}

	/// Iterate entries matching `pattern`: the whole cache if the pattern's
	/// type is ANY, otherwise just the matching key's chain
	/// (`avahi_cache_walk`).
	pub fn walk(&self, pattern: &ResourceKey, mut cb: impl FnMut(&CacheEntry)) {
		if pattern.is_pattern() {
			for (_, entry) in self.entries.iter() {
				if entry.record.key.matches(pattern) {
					cb(entry);
				}
			}
			return;
		}

		if let Some(chain) = self.chains.get(pattern) {
			for &idx in chain {
				if let Some(entry) = self.entries.get(idx) {
					cb(entry);
				}
			}
		}
	}

	pub fn lookup_record(&self, record: &ResourceRecord) -> Option<Index<CacheEntry>> {
		let chain = self.chains.get(&record.key)?;
		chain.iter().copied().find(|&idx| self.entries.get(idx).map(|e| e.record.equal_no_ttl(record)).unwrap_or(false))
	}

	/// All records currently cached, as when an interface goes
	/// non-relevant and drops everything it learned (`avahi_cache_flush`).
	pub fn flush(&mut self) -> Vec<ResourceRecord> {
		let removed: Vec<ResourceRecord> = self.entries.iter().map(|(_, e)| e.record.clone()).collect();
		self.entries = Arena::new();
		self.chains.clear();
		self.timers = TimeEventQueue::new();
		removed
	}

	/// `avahi_cache_update`'s contract.
	pub fn cache_update(&mut self, record: ResourceRecord, cache_flush: bool, origin: IpAddr, now: Instant) -> CacheUpdate {
		if record.is_goodbye() {
			let Some(idx) = self.lookup_record(&record) else { return CacheUpdate::Dropped };
			if let Some(timer) = self.entries.get(idx).and_then(|e| e.timer) {
				self.timers.reschedule(timer, now + Duration::from_secs(1));
			}
			return CacheUpdate::ScheduledFinalExpiry;
		}

		if cache_flush {
			if let Some(chain) = self.chains.get(&record.key).cloned() {
				for idx in chain {
					let Some(entry) = self.entries.get(idx) else { continue };
					if let Some(timer) = entry.timer {
						if now.saturating_duration_since(entry.timestamp) >= Duration::from_secs(1) {
							self.timers.reschedule(timer, now + Duration::from_secs(1));
						}
					}
				}
			}
		}

		if let Some(idx) = self.lookup_record(&record) {
			let ttl = record.ttl;
			let timer = self.entries.get(idx).and_then(|e| e.timer);

			let Some(entry) = self.entries.get_mut(idx) else { return CacheUpdate::Dropped };
			entry.record = record;
			entry.origin = origin;
			entry.timestamp = now;
			entry.cache_flush = cache_flush;
			entry.state = RefreshState::Valid;
			entry.stage = 0;

			let first = self.next_stage_deadline(now, ttl, 0);
			if let Some(timer) = timer {
				self.timers.reschedule(timer, first);
			}
			return CacheUpdate::Refreshed;
		}

		if self.entries.len() >= MAX_CACHE_ENTRIES {
			return CacheUpdate::Dropped;
		}

		let key = record.key.clone();
		let ttl = record.ttl;
		let first_deadline = self.next_stage_deadline(now, ttl, 0);
		let idx = self.entries.insert(CacheEntry { record, origin, timestamp: now, cache_flush, state: RefreshState::Valid, stage: 0, timer: None });
		let timer = self.timers.insert(first_deadline, idx);
		if let Some(entry) = self.entries.get_mut(idx) {
			entry.timer = Some(timer);
		}
		self.chains.entry(key).or_default().push(idx);
		CacheUpdate::New
	}

	fn next_stage_deadline(&self, now: Instant, ttl: u32, stage: usize) -> Instant {
		let pct = REFRESH_STAGES[stage.min(REFRESH_STAGES.len() - 1)];
		let jitter_pct = rand::thread_rng().gen_range(0.0..0.02);
		let secs = ttl as f64 * (pct + jitter_pct).min(1.0);
		now + Duration::from_secs_f64(secs.max(0.0))
	}

	/// Drain every timer due by `now`, advancing refresh stages and
	/// collecting re-query/removal notifications for the caller.
	pub fn process_due(&mut self, now: Instant) -> CacheTick {
		let mut tick = CacheTick::default();

		while let Some(timer_handle) = self.timers.pop_ready(now) {
			let Some(&idx) = self.timers.get(timer_handle) else { continue };
			let Some(entry) = self.entries.get_mut(idx) else { continue };

			entry.stage += 1;

			if entry.stage >= REFRESH_STAGES.len() {
				entry.state = RefreshState::Final;
				let key = entry.record.key.clone();
				if let Some(removed) = self.remove_entry(idx) {
					tick.removed.push(removed);
				}
				if let Some(chain) = self.chains.get_mut(&key) {
					chain.retain(|&i| i != idx);
				}
				continue;
			}

			entry.state = RefreshState::for_stage(entry.stage);
			tick.requeries.push(entry.record.key.clone());
			let ttl = entry.record.ttl;
			let stage = entry.stage;
			let next = self.next_stage_deadline(now, ttl, stage);
			self.timers.reschedule(timer_handle, next);
		}

		tick
	}

	fn remove_entry(&mut self, idx: Index<CacheEntry>) -> Option<ResourceRecord> {
		let entry = self.entries.remove(idx)?;
		if let Some(timer) = entry.timer {
			self.timers.remove(timer);
		}
		Some(entry.record)
	}
}
