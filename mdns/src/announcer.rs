//! Drives a committed entry through probe → announce → established on one
//! interface (`avahi-core/announce.c`). An [`Announcement`] is the
//! per-(interface, entry) state machine; [`Announcement::tick`] is called
//! whenever its owning time event fires.

use std::time::{Duration, Instant};

use wire::ResourceRecord;

use crate::entry::{EntryId, PublishFlags};
use crate::scheduler::{ANNOUNCEMENT_JITTER, PROBE_INTERVAL};

const PROBE_COUNT: u32 = 4;
/// Announce iterations 1..=ANNOUNCE_COUNT before settling at ESTABLISHED
/// (`avahi_s_entry_group_commit`'s `n_iteration >= 4` check).
const ANNOUNCE_COUNT: u32 = 4;
const INITIAL_ANNOUNCE_DELAY: Duration = Duration::from_secs(1);
const MAX_ANNOUNCE_DOUBLINGS: u32 = 10;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AnnounceState {
	Probing,
	Waiting,
	Announcing,
	Established,
}

pub struct Announcement {
	pub entry: EntryId,
	pub state: AnnounceState,
	probes_sent: u32,
	announce_iteration: u32,
	next_delay: Duration,
	next_fire: Option<Instant>,
}

/// What the driving interface should actually do in response to a tick.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AnnounceAction {
	/// Send a probe (type ANY query, this record as an authority).
	SendProbe,
	/// Send a response for the record (and, if UNIQUE, its whole rrset).
	SendAnnouncement,
	/// Nothing to send; state changed (e.g. WAITING → ANNOUNCING) or the
	/// announcement has settled.
	None,
}

impl Announcement {
	/// `avahi_announcement_new`. Initial state depends on the entry's
	/// flags and its owning group's state, per RFC 6762 §8.
	pub fn new(entry: EntryId, flags: PublishFlags, group_registering: bool, group_established_or_absent: bool, now: Instant) -> Self {
		let state = if flags.unique && !flags.no_probe {
			AnnounceState::Probing
		} else if flags.no_announce {
			AnnounceState::Established
		} else if group_established_or_absent {
			AnnounceState::Announcing
		} else if group_registering {
			AnnounceState::Waiting
		} else {
			AnnounceState::Announcing
		};

		let next_fire = match state {
			AnnounceState::Probing | AnnounceState::Announcing => Some(now),
			AnnounceState::Waiting | AnnounceState::Established => None,
		};

		Self { entry, state, probes_sent: 0, announce_iteration: 0, next_delay: INITIAL_ANNOUNCE_DELAY, next_fire }
	}

	pub fn is_probing(&self) -> bool {
		self.state == AnnounceState::Probing
	}

	/// The probe scheduler reports each probe-interval tick; returns
	/// `true` once the fourth probe has gone out and the state should
	/// advance (caller must then call
	/// [`finish_probing`](Self::finish_probing)).
	pub fn record_probe_sent(&mut self) -> bool {
		self.probes_sent += 1;
		self.probes_sent >= PROBE_COUNT
	}

	/// Probing is done for this announcement: move to WAITING if the
	/// group is still registering (other members may still be probing),
	/// else straight to ANNOUNCING.
	pub fn finish_probing(&mut self, group_still_registering: bool) {
		self.state = if group_still_registering { AnnounceState::Waiting } else { AnnounceState::Announcing };
	}

	/// The owning group just reached ESTABLISHED (its `n_probing` hit
	/// zero); every WAITING announcement advances. `with_jitter` chooses
	/// between starting immediately at iteration 1, or after
	/// ANNOUNCEMENT_JITTER starting at iteration 0.
	pub fn group_established(&mut self, now: Instant, with_jitter: bool) -> Option<Duration> {
		if self.state != AnnounceState::Waiting {
			return None;
		}
		self.state = AnnounceState::Announcing;
		let delay = if with_jitter {
			self.announce_iteration = 0;
			ANNOUNCEMENT_JITTER
		} else {
			self.announce_iteration = 1;
			Duration::ZERO
		};
		self.next_fire = Some(now + delay);
		Some(delay)
	}

	/// One announcement fired; returns the delay until the next one, or
	/// `None` once ESTABLISHED (state already flipped).
	pub fn record_announcement_sent(&mut self) -> Option<Duration> {
		self.announce_iteration += 1;
		if self.announce_iteration >= ANNOUNCE_COUNT {
			self.state = AnnounceState::Established;
			return None;
		}

		let delay = self.next_delay;
		if self.announce_iteration < MAX_ANNOUNCE_DOUBLINGS {
			self.next_delay = self.next_delay * 2;
		}
		Some(delay)
	}

	pub fn probe_deadline(&self) -> Duration {
		PROBE_INTERVAL
	}

	pub fn is_due(&self, now: Instant) -> bool {
		self.next_fire.map(|t| now >= t).unwrap_or(false)
	}

	/// Drives this announcement's own timer: called whenever its next
	/// fire instant has passed. `group_still_registering` only matters
	/// while PROBING (whether the fourth probe settles straight into
	/// ANNOUNCING or waits for the rest of the group). Returns what the
	/// driving interface loop should actually transmit, if anything.
	pub fn tick(&mut self, now: Instant, group_still_registering: bool) -> AnnounceAction {
		if !self.is_due(now) {
			return AnnounceAction::None;
		}

		match self.state {
			AnnounceState::Probing => {
				if self.record_probe_sent() {
					self.finish_probing(group_still_registering);
					self.next_fire = match self.state {
						AnnounceState::Announcing => Some(now),
						_ => None,
					};
				} else {
					self.next_fire = Some(now + PROBE_INTERVAL);
				}
				AnnounceAction::SendProbe
			}
			AnnounceState::Waiting => AnnounceAction::None,
			AnnounceState::Announcing => {
				self.next_fire = self.record_announcement_sent().map(|delay| now + delay);
				AnnounceAction::SendAnnouncement
			}
			AnnounceState::Established => AnnounceAction::None,
		}
	}
}

/// `goodbye_entry`: one TTL=0 response per relevant, announce-capable
/// interface the entry is registered on. The caller still owns actually
/// transmitting; this just describes the record to send.
pub fn goodbye_record(record: &ResourceRecord) -> ResourceRecord {
	let mut goodbye = record.clone();
	goodbye.ttl = 0;
	goodbye
}
