//! Local records and their group-level commit state machine
//! (`avahi-core/entry.c`, `entry.h`). An `Entry` binds a record to a single
//! (ifIndex, protocol) scope with publish flags; an `EntryGroup` is the
//! transactional unit clients commit together.

use std::time::{Duration, Instant};

use wire::ResourceRecord;

use crate::scheduler::{RR_HOLDOFF, RR_HOLDOFF_RATE_LIMIT, RR_RATE_LIMIT_COUNT};

pub type InterfaceIndex = i32;

/// `AVAHI_IF_UNSPEC` — matches every interface in scope checks.
pub const IF_UNSPEC: InterfaceIndex = -1;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Protocol {
	Inet,
	Inet6,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct PublishFlags {
	pub unique: bool,
	pub no_probe: bool,
	pub no_announce: bool,
	pub allow_multiple: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EntryId(pub usize);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct GroupId(pub usize);

pub struct Entry {
	pub group: Option<GroupId>,
	pub interface: InterfaceIndex,
	pub protocol: Option<Protocol>,
	pub flags: PublishFlags,
	pub record: ResourceRecord,
	pub dead: bool,
}

impl Entry {
	/// Two entries are in scope for the same local-collision check iff
	/// their (interface, protocol) pairs overlap, where `IF_UNSPEC`/`None`
	/// are wildcards.
	fn scope_overlaps(&self, other: &Entry) -> bool {
		let iface_overlap = self.interface == IF_UNSPEC || other.interface == IF_UNSPEC || self.interface == other.interface;
		let proto_overlap = self.protocol.is_none() || other.protocol.is_none() || self.protocol == other.protocol;
		iface_overlap && proto_overlap
	}

	/// Whether this entry is in scope for a packet seen on the given
	/// (interface, protocol), `IF_UNSPEC`/`None` acting as wildcards on the
	/// entry's side.
	pub fn applies_to(&self, interface: InterfaceIndex, protocol: Protocol) -> bool {
		(self.interface == IF_UNSPEC || self.interface == interface) && (self.protocol.is_none() || self.protocol == Some(protocol))
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GroupState {
	Uncommitted,
	Registering,
	Established,
	Collision,
}

pub struct EntryGroup {
	pub state: GroupState,
	pub entries: Vec<EntryId>,
	/// Live probing announcements still outstanding; the group becomes
	/// ESTABLISHED the moment this reaches zero while REGISTERING.
	pub n_probing: u32,
	register_time: Option<Instant>,
	n_register_try: u32,
}

impl Default for EntryGroup {
	fn default() -> Self {
		Self { state: GroupState::Uncommitted, entries: Vec::new(), n_probing: 0, register_time: None, n_register_try: 0 }
	}
}

impl EntryGroup {
	pub fn new() -> Self {
		Self::default()
	}

	/// `avahi_s_entry_group_commit`. Returns the instant registration may
	/// actually begin, rate-limited by repeated commit attempts.
	pub fn commit(&mut self, now: Instant) -> Instant {
		debug_assert!(matches!(self.state, GroupState::Uncommitted | GroupState::Collision));
		self.state = GroupState::Registering;

		let holdoff = if self.n_register_try >= RR_RATE_LIMIT_COUNT { RR_HOLDOFF_RATE_LIMIT } else { RR_HOLDOFF };
		self.n_register_try += 1;

		let earliest = self.register_time.map(|t| t + holdoff).unwrap_or(now);
		let start = earliest.max(now);
		self.register_time = Some(start);
		start
	}

	/// `avahi_s_entry_group_reset`: every member goes dead (callers issue
	/// goodbyes), state returns to UNCOMMITTED, any pending register time
	/// event is cancelled.
	pub fn reset(&mut self) {
		self.state = GroupState::Uncommitted;
		self.n_probing = 0;
	}

	/// A probing announcement finished; if this drains the last probe
	/// while REGISTERING, the group is established.
	pub fn probe_completed(&mut self) -> bool {
		self.n_probing = self.n_probing.saturating_sub(1);
		if self.n_probing == 0 && self.state == GroupState::Registering {
			self.state = GroupState::Established;
			return true;
		}
		false
	}

	pub fn mark_collision(&mut self) {
		self.state = GroupState::Collision;
	}
}

#[derive(Debug, PartialEq, Eq)]
pub enum AddError {
	InvalidTtl,
	IsPattern,
	InvalidRecord,
	LocalCollision,
	InvalidFlags,
}

/// The local entry/group table (`avahi-core/entry.c`'s globals, made
/// explicit as an owned arena-backed structure rather than intrusive
/// linked lists).
#[derive(Default)]
pub struct EntryTable {
	entries: Vec<Option<Entry>>,
	groups: Vec<Option<EntryGroup>>,
}

impl EntryTable {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn create_group(&mut self) -> GroupId {
		self.groups.push(Some(EntryGroup::new()));
		GroupId(self.groups.len() - 1)
	}

	pub fn group(&self, id: GroupId) -> Option<&EntryGroup> {
		self.groups.get(id.0).and_then(|g| g.as_ref())
	}

	pub fn group_mut(&mut self, id: GroupId) -> Option<&mut EntryGroup> {
		self.groups.get_mut(id.0).and_then(|g| g.as_mut())
	}

	pub fn entry(&self, id: EntryId) -> Option<&Entry> {
		self.entries.get(id.0).and_then(|e| e.as_ref())
	}

	pub fn entry_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
		self.entries.get_mut(id.0).and_then(|e| e.as_mut())
	}

	/// Every live entry, for callers dispatching an incoming packet against
	/// the whole local table rather than one key at a time.
	pub fn iter(&self) -> impl Iterator<Item = (EntryId, &Entry)> {
		self.entries.iter().enumerate().filter_map(|(i, e)| e.as_ref().map(|e| (EntryId(i), e)))
	}

	/// Every live group, used to re-announce already-committed groups onto
	/// an interface that just became relevant.
	pub fn iter_groups(&self) -> impl Iterator<Item = (GroupId, &EntryGroup)> {
		self.groups.iter().enumerate().filter_map(|(i, g)| g.as_ref().map(|g| (GroupId(i), g)))
	}

	/// `avahi_entry_new`/`avahi_s_add`. Validates, checks local collision
	/// for UNIQUE records, and appends to the entry/group lists. Returns
	/// the new entry's id, or the specific validation failure.
	pub fn add(&mut self, group: Option<GroupId>, interface: InterfaceIndex, protocol: Option<Protocol>, flags: PublishFlags, record: ResourceRecord) -> Result<EntryId, AddError> {
		if record.ttl == 0 {
			return Err(AddError::InvalidTtl);
		}
		if record.key.is_pattern() {
			return Err(AddError::IsPattern);
		}
		if flags.no_probe && flags.unique && flags.allow_multiple {
			// ALLOW_MULTIPLE only makes sense alongside UNIQUE (it
			// relaxes the local-collision check), but combining it with
			// NO_PROBE + UNIQUE is contradictory: nothing would ever
			// detect the very collision ALLOW_MULTIPLE claims to permit.
			return Err(AddError::InvalidFlags);
		}

		if flags.unique && !flags.allow_multiple {
			let candidate = Entry { group, interface, protocol, flags, record: record.clone(), dead: false };
			let collides = self.entries.iter().flatten().any(|existing| {
				!existing.dead && existing.flags.unique && !existing.flags.allow_multiple && existing.record.key == candidate.record.key && candidate.scope_overlaps(existing)
			});
			if collides {
				return Err(AddError::LocalCollision);
			}
		}

		let entry = Entry { group, interface, protocol, flags, record, dead: false };
		self.entries.push(Some(entry));
		let id = EntryId(self.entries.len() - 1);

		if let Some(gid) = group {
			if let Some(g) = self.group_mut(gid) {
				g.entries.push(id);
			}
		}

		Ok(id)
	}

	/// `avahi_entry_new` with the UPDATE flag: replace the rdata of the
	/// first live entry matching (group, interface, protocol) with the
	/// same key. Returns whether a re-announce is owed (rdata actually
	/// changed and the group is past UNCOMMITTED) and whether the
	/// re-announce should skip the goodbye step (UNIQUE records do).
	pub fn update(&mut self, group: Option<GroupId>, interface: InterfaceIndex, protocol: Option<Protocol>, record: ResourceRecord) -> Option<(EntryId, bool, bool)> {
		let target = self.entries.iter().enumerate().find_map(|(i, e)| {
			let e = e.as_ref()?;
			if !e.dead && e.group == group && e.interface == interface && e.protocol == protocol && e.record.key == record.key { Some(i) } else { None }
		})?;

		let id = EntryId(target);
		let entry = self.entries[target].as_mut()?;
		let changed = !entry.record.equal_no_ttl(&record);
		let unique = entry.flags.unique;
		entry.record = record;

		let past_uncommitted = group.and_then(|g| self.group(g)).map(|g| g.state != GroupState::Uncommitted).unwrap_or(true);
		let should_reannounce = changed && past_uncommitted;
		Some((id, should_reannounce, unique))
	}

	pub fn mark_dead(&mut self, id: EntryId) {
		if let Some(entry) = self.entry_mut(id) {
			entry.dead = true;
		}
	}

	/// Mark every entry belonging to `group` dead — the first half of
	/// `group_reset`; callers issue goodbyes for each before the deferred
	/// sweep actually unlinks them.
	pub fn mark_group_dead(&mut self, group: GroupId) -> Vec<EntryId> {
		let Some(g) = self.group(group) else { return Vec::new() };
		let ids = g.entries.clone();
		for &id in &ids {
			self.mark_dead(id);
		}
		ids
	}

	/// Deferred sweep: drop dead entries and empty groups. Safe to call
	/// any time no iterator over `entries`/`groups` is live.
	pub fn sweep(&mut self) {
		for slot in &mut self.entries {
			if slot.as_ref().map(|e| e.dead).unwrap_or(false) {
				*slot = None;
			}
		}
	}
}

/// Time since the RR_HOLDOFF window closed, for callers that want to log
/// how long a commit was delayed.
pub fn holdoff_remaining(start: Instant, now: Instant) -> Duration {
	start.saturating_duration_since(now)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::Ipv4Addr;
	use wire::{Class, Name, RecordData, ResourceKey, RrType};

	fn a_record(name: &str) -> ResourceRecord {
		let key = ResourceKey::new(Name::parse(name).unwrap(), Class::In, RrType::A);
		ResourceRecord::new(key, 120, RecordData::A(Ipv4Addr::new(10, 0, 0, 1)))
	}

	#[test]
	fn second_unique_entry_for_same_key_and_scope_is_a_local_collision() {
		let mut table = EntryTable::new();
		let unique = PublishFlags { unique: true, ..Default::default() };
		table.add(None, IF_UNSPEC, None, unique, a_record("host.local")).unwrap();
		let result = table.add(None, IF_UNSPEC, None, unique, a_record("host.local"));
		assert_eq!(result, Err(AddError::LocalCollision));
	}

	#[test]
	fn allow_multiple_permits_duplicate_unique_entries() {
		let mut table = EntryTable::new();
		let unique_multi = PublishFlags { unique: true, allow_multiple: true, ..Default::default() };
		table.add(None, IF_UNSPEC, None, unique_multi, a_record("host.local")).unwrap();
		let result = table.add(None, IF_UNSPEC, None, unique_multi, a_record("host.local"));
		assert!(result.is_ok());
	}

	#[test]
	fn disjoint_interfaces_do_not_collide() {
		let mut table = EntryTable::new();
		let unique = PublishFlags { unique: true, ..Default::default() };
		table.add(None, 2, None, unique, a_record("host.local")).unwrap();
		let result = table.add(None, 3, None, unique, a_record("host.local"));
		assert!(result.is_ok());
	}

	#[test]
	fn group_becomes_established_only_once_probing_count_drains_to_zero() {
		let mut group = EntryGroup::new();
		group.n_probing = 2;
		group.state = GroupState::Registering;
		assert!(!group.probe_completed());
		assert_eq!(group.state, GroupState::Registering);
		assert!(group.probe_completed());
		assert_eq!(group.state, GroupState::Established);
	}

	#[test]
	fn repeated_commits_past_rate_limit_count_use_the_longer_holdoff() {
		let mut group = EntryGroup::new();
		let base = Instant::now();
		let mut t = base;
		for _ in 0..RR_RATE_LIMIT_COUNT {
			t = group.commit(t);
			group.state = GroupState::Uncommitted;
		}
		let before = t;
		let after = group.commit(t);
		assert!(after >= before + RR_HOLDOFF_RATE_LIMIT || after == before);
	}
}
