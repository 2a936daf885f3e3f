//! Per-interface outgoing traffic scheduler (`avahi-core/dns-srv-rr.c`,
//! `dns-srv-rr.c`'s companion `query-sched.c`/`response-sched.c`). Three job
//! lists — queries, responses, probes — each backed by its own
//! [`TimeEventQueue`], plus the duplicate-suppression and truncation rules
//! that keep a noisy multicast segment from turning into a broadcast storm.
//!
//! The scheduler only tracks *intent* (which keys/records are due, and
//! when); assembling the actual packets is the driving interface's job,
//! since only it holds the cache and the wire writer.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use wire::{ResourceKey, ResourceRecord};

use crate::time_event::{Handle, TimeEventQueue};

pub const QUERY_DEFER: Duration = Duration::from_millis(100);
pub const QUERY_HISTORY: Duration = Duration::from_millis(100);
pub const RESPONSE_DEFER: Duration = Duration::from_millis(20);
pub const RESPONSE_JITTER: Duration = Duration::from_millis(100);
pub const RESPONSE_HISTORY: Duration = Duration::from_millis(700);
pub const PROBE_DEFER: Duration = Duration::from_millis(70);
pub const PROBE_INTERVAL: Duration = Duration::from_millis(250);
pub const PROBE_JITTER: Duration = Duration::from_millis(250);
pub const ANNOUNCEMENT_JITTER: Duration = Duration::from_millis(250);
pub const RR_HOLDOFF: Duration = Duration::from_millis(1000);
pub const RR_HOLDOFF_RATE_LIMIT: Duration = Duration::from_millis(60_000);
pub const RR_RATE_LIMIT_COUNT: u32 = 15;

/// The packet size a scheduler starts an outgoing response at; grown up to
/// [`MAX_PACKET_SIZE`] when a single record doesn't fit an empty packet.
pub const DEFAULT_PACKET_SIZE: usize = 1232;
pub const MAX_PACKET_SIZE: usize = 8192;
pub const LEGACY_UNICAST_SIZE: usize = 512;

fn jitter(max: Duration) -> Duration {
	if max.is_zero() {
		return Duration::ZERO;
	}
	Duration::from_nanos(rand::random::<u64>() % (max.as_nanos() as u64 + 1))
}

pub struct QueryJob {
	pub key: ResourceKey,
	pub done: bool,
}

pub struct ResponseJob {
	pub record: ResourceRecord,
	pub flush: bool,
	/// `None` once the job has become broadcast-relevant (sent to more
	/// than one asker, or posted with no specific querier to begin with).
	pub querier: Option<IpAddr>,
	pub auxiliary: bool,
	pub done: bool,
}

pub struct ProbeJob {
	pub key: ResourceKey,
	pub records: Vec<ResourceRecord>,
}

pub enum PostResult {
	Posted(Handle<QueryJob>),
	Suppressed,
}

pub enum PostResponseResult {
	Posted(Handle<ResponseJob>),
	Merged,
}

#[derive(Default)]
pub struct Scheduler {
	queries: TimeEventQueue<QueryJob>,
	responses: TimeEventQueue<ResponseJob>,
	probes: TimeEventQueue<ProbeJob>,
}

impl Scheduler {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn next_wakeup(&mut self) -> Option<Instant> {
		[self.queries.next_wakeup(), self.responses.next_wakeup(), self.probes.next_wakeup()].into_iter().flatten().min()
	}

	/// `avahi_interface_post_query`. Returns `Suppressed` if a job for `key`
	/// already fired within [`QUERY_HISTORY`] of `now` (a peer's question,
	/// or our own, covers ours).
	pub fn post_query(&mut self, key: ResourceKey, now: Instant, immediately: bool) -> PostResult {
		let recently_fired = self.queries.slots_matching(|j| j.key.matches(&key)).into_iter().any(|h| {
			self.queries.last_run(h).map(|t| now.saturating_duration_since(t) <= QUERY_HISTORY).unwrap_or(false)
		});
		if recently_fired {
			return PostResult::Suppressed;
		}

		let delay = if immediately { Duration::ZERO } else { QUERY_DEFER };
		let handle = self.queries.insert(now + delay, QueryJob { key, done: false });
		PostResult::Posted(handle)
	}

	/// A peer's question suppresses our own pending identical one
	/// (`avahi_interface_scheduler_incoming_query`).
	pub fn incoming_query(&mut self, key: &ResourceKey, now: Instant) {
		for handle in self.queries.slots_matching(|j| !j.done && j.key.matches(key)) {
			if let Some(job) = self.queries.get_mut(handle) {
				job.done = true;
			}
			self.queries.reschedule(handle, now + QUERY_HISTORY);
		}
	}

	/// Drain every query job due by `now`, each returned once.
	pub fn pop_due_query(&mut self, now: Instant) -> Option<Handle<QueryJob>> {
		self.queries.pop_ready(now)
	}

	pub fn query_job(&self, handle: Handle<QueryJob>) -> Option<&QueryJob> {
		self.queries.get(handle)
	}

	/// Mark a fired query job done and retain it as history for
	/// [`QUERY_HISTORY`] before it is freed.
	pub fn finish_query(&mut self, handle: Handle<QueryJob>, now: Instant) {
		if let Some(job) = self.queries.get_mut(handle) {
			job.done = true;
		}
		self.queries.reschedule(handle, now + QUERY_HISTORY);
	}

	pub fn expire_query_history(&mut self, handle: Handle<QueryJob>) {
		self.queries.remove(handle);
	}

	/// `avahi_interface_post_response`.
	pub fn post_response(&mut self, record: ResourceRecord, flush: bool, querier: Option<IpAddr>, now: Instant, immediately: bool) -> PostResponseResult {
		if let Some(handle) = self.find_response_within_history(&record, now) {
			let record_is_goodbye = record.is_goodbye();
			let existing_is_goodbye = self.responses.get(handle).map(|j| j.record.is_goodbye()).unwrap_or(false);

			if record_is_goodbye == existing_is_goodbye {
				if let Some(job) = self.responses.get_mut(handle) {
					if job.querier != querier || querier.is_none() {
						job.querier = None;
					}
					job.flush = flush;
				}
				return PostResponseResult::Merged;
			}

			self.responses.remove(handle);
		}

		let delay = if immediately { Duration::ZERO } else { RESPONSE_DEFER + jitter(RESPONSE_JITTER) };
		let handle = self.responses.insert(now + delay, ResponseJob { record, flush, querier, auxiliary: false, done: false });
		PostResponseResult::Posted(handle)
	}

	/// Same contract as [`post_response`](Self::post_response) but the job is
	/// tagged `auxiliary` (an SRV/TXT/A/AAAA pulled in for rrset
	/// completeness) so it never forces immediate delivery on its own.
	pub fn post_auxiliary_response(&mut self, record: ResourceRecord, flush: bool, now: Instant) {
		if self.find_response_within_history(&record, now).is_some() {
			return;
		}
		let delay = RESPONSE_DEFER + jitter(RESPONSE_JITTER);
		self.responses.insert(now + delay, ResponseJob { record, flush, querier: None, auxiliary: true, done: false });
	}

	fn find_response_within_history(&self, record: &ResourceRecord, now: Instant) -> Option<Handle<ResponseJob>> {
		self.responses.slots_matching(|j| j.record.equal_no_ttl(record)).into_iter().find(|&h| match self.responses.last_run(h) {
			Some(fired_at) => now.saturating_duration_since(fired_at) <= RESPONSE_HISTORY,
			None => true,
		})
	}

	/// `avahi_interface_scheduler_incoming_response`.
	pub fn incoming_response(&mut self, record: &ResourceRecord, now: Instant) {
		let Some(handle) = self.responses.slots_matching(|j| j.record.equal_no_ttl(record)).into_iter().next() else { return };

		let existing_is_goodbye = self.responses.get(handle).map(|j| j.record.is_goodbye()).unwrap_or(false);
		if existing_is_goodbye == record.is_goodbye() {
			if let Some(job) = self.responses.get_mut(handle) {
				job.done = true;
			}
			self.responses.reschedule(handle, now + RESPONSE_HISTORY);
		} else {
			self.responses.remove(handle);
		}
	}

	/// Known-answer suppression: a querier already holding a known answer
	/// whose TTL is at least half ours makes our pending response moot.
	pub fn suppress_known_answer(&mut self, key: &ResourceKey, known_ttl: u32) {
		for handle in self.responses.slots_matching(|j| !j.done && j.record.key.matches(key)) {
			let Some(job) = self.responses.get(handle) else { continue };
			if known_ttl as u64 * 2 >= job.record.ttl as u64 {
				self.responses.remove(handle);
			}
		}
	}

	pub fn pop_due_response(&mut self, now: Instant) -> Option<Handle<ResponseJob>> {
		self.responses.pop_ready(now)
	}

	pub fn response_job(&self, handle: Handle<ResponseJob>) -> Option<&ResponseJob> {
		self.responses.get(handle)
	}

	pub fn finish_response(&mut self, handle: Handle<ResponseJob>, now: Instant) {
		if let Some(job) = self.responses.get_mut(handle) {
			job.done = true;
		}
		self.responses.reschedule(handle, now + RESPONSE_HISTORY);
	}

	pub fn expire_response_history(&mut self, handle: Handle<ResponseJob>) {
		self.responses.remove(handle);
	}

	/// Force-send every not-yet-fired response job, e.g. on interface-down
	/// or shutdown. Returns the records in schedule order.
	pub fn flush_responses(&mut self) -> Vec<ResourceRecord> {
		let mut out = Vec::new();
		for handle in self.responses.slots_matching(|j| !j.done) {
			if let Some(job) = self.responses.remove(handle) {
				out.push(job.record);
			}
		}
		out
	}

	pub fn post_probe(&mut self, key: ResourceKey, records: Vec<ResourceRecord>, now: Instant, first: bool) -> Handle<ProbeJob> {
		let delay = if first { PROBE_DEFER + jitter(PROBE_JITTER) } else { PROBE_INTERVAL };
		self.probes.insert(now + delay, ProbeJob { key, records })
	}

	pub fn pop_due_probe(&mut self, now: Instant) -> Option<Handle<ProbeJob>> {
		self.probes.pop_ready(now)
	}

	pub fn probe_job(&self, handle: Handle<ProbeJob>) -> Option<&ProbeJob> {
		self.probes.get(handle)
	}

	pub fn remove_probe(&mut self, handle: Handle<ProbeJob>) -> Option<ProbeJob> {
		self.probes.remove(handle)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::Ipv4Addr;
	use wire::{Class, Name, RecordData, RrType};

	fn key() -> ResourceKey {
		ResourceKey::new(Name::parse("host.local").unwrap(), Class::In, RrType::A)
	}

	fn record() -> ResourceRecord {
		ResourceRecord::new(key(), 120, RecordData::A(Ipv4Addr::new(10, 0, 0, 1)))
	}

	#[test]
	fn duplicate_query_within_history_is_suppressed() {
		let mut s = Scheduler::new();
		let now = Instant::now();
		let handle = match s.post_query(key(), now, true) {
			PostResult::Posted(h) => h,
			PostResult::Suppressed => panic!("expected first post to succeed"),
		};
		s.pop_due_query(now).unwrap();
		s.finish_query(handle, now);

		match s.post_query(key(), now + Duration::from_millis(50), true) {
			PostResult::Suppressed => {}
			PostResult::Posted(_) => panic!("expected suppression within QUERY_HISTORY"),
		}
	}

	#[test]
	fn incoming_query_suppresses_our_pending_question() {
		let mut s = Scheduler::new();
		let now = Instant::now();
		s.post_query(key(), now, false);
		s.incoming_query(&key(), now + Duration::from_millis(10));
		// Our own job was rescheduled out to history by the peer's
		// question, so it never fires at its original QUERY_DEFER mark.
		assert!(s.pop_due_query(now + QUERY_DEFER).is_none());
	}

	#[test]
	fn repeated_post_response_to_same_broadcast_merges_instead_of_duplicating() {
		let mut s = Scheduler::new();
		let now = Instant::now();
		s.post_response(record(), true, None, now, false);
		let merged = s.post_response(record(), false, None, now + Duration::from_millis(10), false);
		assert!(matches!(merged, PostResponseResult::Merged));
	}

	#[test]
	fn goodbye_replaces_pending_non_goodbye_response() {
		let mut s = Scheduler::new();
		let now = Instant::now();
		s.post_response(record(), true, None, now, false);
		let mut goodbye = record();
		goodbye.ttl = 0;
		let result = s.post_response(goodbye, true, None, now, false);
		assert!(matches!(result, PostResponseResult::Posted(_)));
	}

	#[test]
	fn known_answer_with_half_ttl_suppresses_pending_response() {
		let mut s = Scheduler::new();
		let now = Instant::now();
		s.post_response(record(), false, None, now, false);
		s.suppress_known_answer(&key(), 60);
		assert!(s.pop_due_response(now + Duration::from_secs(1)).is_none());
	}
}
