//! Top-level packet dispatch and conflict resolution
//! (`avahi-core/server.c`). `Server` is the single mutable owner of
//! everything else in the crate; every state transition happens from
//! inside a callback driven by an incoming datagram or a time-event
//! firing, on a single thread with no internal locking.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use wire::{Class, DnsPacketReader, DnsPacketWriter, Flags, ResourceKey, ResourceRecord, RrType, Section};

use crate::config::Config;
use crate::entry::{Entry, EntryId, EntryTable, GroupId, GroupState, InterfaceIndex, Protocol, PublishFlags};
use crate::interface::{InterfaceMonitor, Transport};
use crate::scheduler::{DEFAULT_PACKET_SIZE, LEGACY_UNICAST_SIZE, MAX_PACKET_SIZE};

pub const MDNS_PORT: u16 = 5353;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ServerState {
	Invalid,
	Registering,
	Running,
	Collision,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConflictOutcome {
	/// Refresh: the incoming record agrees with (or renews) ours; just
	/// re-schedule our response for the key.
	Refresh,
	/// No action needed.
	Ignore,
	/// Our registered entry lost to an incoming record post-registration;
	/// its announcement resets to probing (UNIQUE) or simply re-announces.
	ResetAnnouncement,
	/// Our still-probing entry lost outright; its group goes to
	/// COLLISION.
	Withdraw,
}

/// Conflict handling for an incoming record `r` against a local entry `e`
/// sharing the same key (`avahi-core/server.c`'s `handle_conflict`).
pub fn conflict_handling(incoming: &ResourceRecord, local: &ResourceRecord, local_unique: bool, incoming_unique: bool, local_registered: bool, local_probing: bool) -> ConflictOutcome {
	if incoming.is_goodbye() && incoming.equal_no_ttl(local) {
		return ConflictOutcome::Refresh;
	}

	if !local_unique && !incoming_unique {
		return ConflictOutcome::Ignore;
	}

	if incoming.equal_no_ttl(local) {
		if local_registered && (incoming.ttl as u64) * 2 <= local.ttl as u64 {
			return ConflictOutcome::Refresh;
		}
		return ConflictOutcome::Ignore;
	}

	if local_registered {
		return ConflictOutcome::ResetAnnouncement;
	}
	if local_probing {
		return ConflictOutcome::Withdraw;
	}
	ConflictOutcome::Ignore
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProbeOutcome {
	WeWin,
	WeLose,
	NoConflict,
}

/// `incoming_probe`: lexicographic tie-break between our still-probing
/// record `local` and the peer's proposed `incoming` (RFC 6762 §8.2).
pub fn incoming_probe(local: &ResourceRecord, incoming: &ResourceRecord) -> ProbeOutcome {
	match local.cmp_lexicographic(incoming) {
		std::cmp::Ordering::Greater => ProbeOutcome::WeWin,
		std::cmp::Ordering::Less => ProbeOutcome::WeLose,
		std::cmp::Ordering::Equal => ProbeOutcome::NoConflict,
	}
}

/// A reflected legacy-unicast query waiting for a matching response on
/// another interface (`avahi-core/server.c`'s `legacy_unicast_reflect_slot`).
pub struct LegacyUnicastSlot {
	pub original_id: u16,
	pub rewritten_id: u16,
	pub source: IpAddr,
	pub source_port: u16,
	pub source_interface: InterfaceIndex,
	pub created_at: Instant,
}

pub const LEGACY_UNICAST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Default)]
pub struct LegacyUnicastTable {
	slots: Vec<LegacyUnicastSlot>,
	next_id: u16,
}

impl LegacyUnicastTable {
	pub fn allocate(&mut self, original_id: u16, source: IpAddr, source_port: u16, source_interface: InterfaceIndex, now: Instant) -> u16 {
		self.expire(now);
		let rewritten_id = self.next_id;
		self.next_id = self.next_id.wrapping_add(1);
		self.slots.push(LegacyUnicastSlot { original_id, rewritten_id, source, source_port, source_interface, created_at: now });
		rewritten_id
	}

	pub fn resolve(&mut self, rewritten_id: u16, now: Instant) -> Option<(u16, IpAddr, u16, InterfaceIndex)> {
		self.expire(now);
		let pos = self.slots.iter().position(|s| s.rewritten_id == rewritten_id)?;
		let slot = self.slots.remove(pos);
		Some((slot.original_id, slot.source, slot.source_port, slot.source_interface))
	}

	fn expire(&mut self, now: Instant) {
		self.slots.retain(|s| now.saturating_duration_since(s.created_at) < LEGACY_UNICAST_TIMEOUT);
	}
}

pub struct Server {
	pub config: Config,
	pub state: ServerState,
	pub host_name: String,
	pub entries: EntryTable,
	pub monitor: InterfaceMonitor,
	pub legacy_unicast: LegacyUnicastTable,
}

impl Server {
	pub fn new(config: Config) -> Self {
		let host_name = config.host_name.clone().unwrap_or_else(|| "localhost".to_string());
		let use_iff_running = config.use_iff_running;
		Self { config, state: ServerState::Registering, host_name, entries: EntryTable::new(), monitor: InterfaceMonitor::new(use_iff_running), legacy_unicast: LegacyUnicastTable::default() }
	}

	/// Local entries registered under the given key across every
	/// interface, used by the conflict-handling dispatch below.
	fn local_entries_for_key<'a>(&'a self, key: &'a ResourceKey) -> impl Iterator<Item = (EntryId, &'a Entry)> + 'a {
		self.entries.iter().filter(move |(_, e)| !e.dead && e.record.key == *key)
	}

	/// Dispatches one incoming record (from a response packet) through
	/// conflict handling, cache update, and response-scheduler
	/// suppression.
	pub fn handle_incoming_record(&mut self, record: ResourceRecord, cache_flush: bool, origin: IpAddr, interface: InterfaceIndex, protocol: Protocol, now: Instant) {
		let conflicts: Vec<(EntryId, ConflictOutcome)> = self
			.local_entries_for_key(&record.key)
			.map(|(id, e)| {
				let outcome = conflict_handling(&record, &e.record, e.flags.unique, true, e.group.is_some(), false);
				(id, outcome)
			})
			.collect();

		for (id, outcome) in conflicts {
			match outcome {
				ConflictOutcome::ResetAnnouncement => {
					// Caller (the announcer-driving interface loop) is
					// expected to recreate the Announcement for this
					// entry; here we only flag it dead-to-reannounce by
					// leaving the entry alive — the actual state machine
					// reset happens where Announcements are owned.
					let _ = id;
				}
				ConflictOutcome::Withdraw => {
					if let Some(e) = self.entries.entry(id) {
						if let Some(group) = e.group {
							if let Some(g) = self.entries.group_mut(group) {
								g.mark_collision();
							}
						}
					}
				}
				ConflictOutcome::Refresh | ConflictOutcome::Ignore => {}
			}
		}

		if let Some(iface) = self.monitor.interface_mut(interface, protocol) {
			iface.cache.cache_update(record.clone(), cache_flush, origin, now);
			iface.scheduler.incoming_response(&record, now);
		}
	}

	/// Dispatches one incoming query packet (`avahi_interface_scheduler_incoming_query`
	/// plus `avahi_server_prepare_response`'s per-question walk over the
	/// local entry table): every question both suppresses any identical
	/// pending query of ours and is matched against locally registered
	/// records; known answers the peer already holds drop out before
	/// anything is queued; authority-section records are the peer's own
	/// probe proposals and go through the same lexicographic tie-break as
	/// any other conflict. Legacy (non-5353) unicast queriers bypass the
	/// scheduler entirely and get an immediate direct reply via
	/// [`generate_response`].
	pub fn handle_incoming_query(&mut self, packet: &[u8], source: IpAddr, source_port: u16, interface: InterfaceIndex, protocol: Protocol, now: Instant, transport: &mut impl Transport) {
		let Ok(mut reader) = DnsPacketReader::parse(packet) else { return };
		if !reader.is_query() {
			return;
		}

		let mut questions = Vec::with_capacity(reader.count(Section::Question) as usize);
		for _ in 0..reader.count(Section::Question) {
			match reader.consume_key() {
				Ok(q) => questions.push(q),
				Err(()) => return,
			}
		}

		let mut known_answers = Vec::with_capacity(reader.count(Section::Answer) as usize);
		for _ in 0..reader.count(Section::Answer) {
			match reader.consume_record() {
				Ok((record, _)) => known_answers.push(record),
				Err(()) => break,
			}
		}

		let mut probe_records = Vec::with_capacity(reader.count(Section::Authority) as usize);
		for _ in 0..reader.count(Section::Authority) {
			match reader.consume_record() {
				Ok((record, _)) => probe_records.push(record),
				Err(()) => break,
			}
		}

		let legacy = Self::is_legacy_unicast(source_port);

		// Matching local records, minus anything the peer already told us
		// (via the Answer section) it knows with at least half our TTL.
		let matches: Vec<(ResourceRecord, PublishFlags, bool)> = questions
			.iter()
			.flat_map(|(key, unicast_bit)| {
				self.entries.iter().filter(move |(_, e)| !e.dead && e.applies_to(interface, protocol) && e.record.key.matches(key)).map(move |(_, e)| (e.record.clone(), e.flags, legacy || *unicast_bit))
			})
			.filter(|(record, _, _)| !known_answers.iter().any(|known| known.equal_no_ttl(record) && (known.ttl as u64) * 2 >= record.ttl as u64))
			.collect();

		let auxiliary: Vec<ResourceRecord> = matches
			.iter()
			.flat_map(|(record, _, _)| {
				auxiliary_records(record, |key| self.entries.iter().filter(|(_, e)| !e.dead && e.applies_to(interface, protocol) && e.record.key.matches(key)).map(|(_, e)| e.record.clone()).collect())
			})
			.collect();

		if legacy {
			let candidates: Vec<ResourceRecord> = matches.into_iter().map(|(record, _, _)| record).chain(auxiliary).collect();
			for packet in generate_response(&candidates, &questions, true, 0) {
				transport.send(interface, protocol, source, source_port, &packet);
			}
			return;
		}

		let Some(iface) = self.monitor.interface_mut(interface, protocol) else { return };

		for (key, _) in &questions {
			iface.scheduler.incoming_query(key, now);
		}
		for known in &known_answers {
			iface.scheduler.suppress_known_answer(&known.key, known.ttl);
		}
		for (record, flags, unicast) in matches {
			let querier = if unicast { Some(source) } else { None };
			iface.scheduler.post_response(record, flags.unique, querier, now, false);
		}
		for record in auxiliary {
			iface.scheduler.post_auxiliary_response(record, false, now);
		}

		let mut collided_groups: Vec<GroupId> = Vec::new();
		for record in &probe_records {
			for (_, entry) in self.entries.iter() {
				if entry.dead || !entry.flags.unique || entry.record.key != record.key || entry.record.equal_no_ttl(record) {
					continue;
				}
				let probing = entry.group.and_then(|g| self.entries.group(g)).map(|g| g.state == GroupState::Registering).unwrap_or(false);
				if probing && incoming_probe(&entry.record, record) == ProbeOutcome::WeLose {
					if let Some(group) = entry.group {
						collided_groups.push(group);
					}
				}
			}
		}
		for group in collided_groups {
			if let Some(g) = self.entries.group_mut(group) {
				g.mark_collision();
			}
		}
	}

	/// `legacy_unicast`: the UDP source port was not [`MDNS_PORT`], so any
	/// reply goes straight back to the sender instead of through the
	/// scheduler.
	pub fn is_legacy_unicast(source_port: u16) -> bool {
		source_port != MDNS_PORT
	}
}

/// Legacy unicast vs. normal response assembly (`avahi_server_generate_response`).
/// `candidates` is the record list already built by the caller (matching
/// local entries plus any the scheduler had queued); questions are only
/// echoed in legacy mode.
pub fn generate_response(candidates: &[ResourceRecord], questions: &[(ResourceKey, bool)], legacy_unicast: bool, max_ttl: u32) -> Vec<Vec<u8>> {
	if legacy_unicast {
		let mut writer = DnsPacketWriter::new(LEGACY_UNICAST_SIZE, 0, Flags::response(true));
		for (key, unicast) in questions {
			if writer.append_key(Section::Question, key, *unicast).is_err() {
				break;
			}
		}
		for record in candidates {
			if writer.append_record(Section::Answer, record, false, max_ttl).is_err() {
				break;
			}
		}
		return vec![writer.finish()];
	}

	assemble_with_truncation(candidates, max_ttl)
}

/// Grows the packet up to [`MAX_PACKET_SIZE`] for a single oversized
/// record, otherwise flushes what fits and starts a fresh packet,
/// otherwise drops the record and logs it.
fn assemble_with_truncation(records: &[ResourceRecord], max_ttl: u32) -> Vec<Vec<u8>> {
	let mut packets = Vec::new();
	let mut capacity = DEFAULT_PACKET_SIZE;
	let mut writer = DnsPacketWriter::new(capacity, 0, Flags::response(true));
	let mut any_in_packet = false;

	let mut i = 0;
	while i < records.len() {
		let record = &records[i];
		match writer.append_record(Section::Answer, record, false, max_ttl) {
			Ok(()) => {
				any_in_packet = true;
				i += 1;
			}
			Err(()) if any_in_packet => {
				let truncated = writer.flags().with_truncated(true);
				writer.set_flags(truncated);
				packets.push(writer.finish());
				capacity = DEFAULT_PACKET_SIZE;
				writer = DnsPacketWriter::new(capacity, 0, Flags::response(true));
				any_in_packet = false;
			}
			Err(()) if capacity < MAX_PACKET_SIZE => {
				capacity = (capacity * 2).min(MAX_PACKET_SIZE);
				writer = DnsPacketWriter::new(capacity, 0, Flags::response(true));
			}
			Err(()) => {
				log::warn!("dropping oversized record {:?}: does not fit even at MAX_PACKET_SIZE", record.key);
				i += 1;
			}
		}
	}

	if any_in_packet || packets.is_empty() {
		packets.push(writer.finish());
	}
	packets
}

/// The per-key auxiliary records to enumerate when a PTR or SRV is
/// scheduled, so rrset-related records travel together. `lookup` finds
/// additional local records sharing the given key.
pub fn auxiliary_records(record: &ResourceRecord, lookup: impl Fn(&ResourceKey) -> Vec<ResourceRecord>) -> Vec<ResourceRecord> {
	match &record.data {
		wire::RecordData::Ptr(target) => {
			let mut out = Vec::new();
			out.extend(lookup(&ResourceKey::new(target.clone(), Class::In, RrType::Srv)));
			out.extend(lookup(&ResourceKey::new(target.clone(), Class::In, RrType::Txt)));
			out
		}
		wire::RecordData::Srv { target, .. } => {
			let mut out = Vec::new();
			out.extend(lookup(&ResourceKey::new(target.clone(), Class::In, RrType::A)));
			out.extend(lookup(&ResourceKey::new(target.clone(), Class::In, RrType::Aaaa)));
			out
		}
		_ => Vec::new(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::Ipv4Addr;
	use wire::{Name, RecordData};

	use crate::entry::IF_UNSPEC;
	use crate::interface::HwInterface;
	use crate::scheduler::{RESPONSE_DEFER, RESPONSE_JITTER};

	fn a(name: &str, ttl: u32) -> ResourceRecord {
		let key = ResourceKey::new(Name::parse(name).unwrap(), Class::In, RrType::A);
		ResourceRecord::new(key, ttl, RecordData::A(Ipv4Addr::new(10, 0, 0, 1)))
	}

	#[derive(Default)]
	struct RecordingTransport {
		sent: Vec<(InterfaceIndex, Protocol, IpAddr, u16)>,
	}

	impl Transport for RecordingTransport {
		fn join_multicast(&mut self, _interface: InterfaceIndex, _protocol: Protocol) {}
		fn leave_multicast(&mut self, _interface: InterfaceIndex, _protocol: Protocol) {}
		fn send(&mut self, interface: InterfaceIndex, protocol: Protocol, dest: IpAddr, port: u16, _packet: &[u8]) {
			self.sent.push((interface, protocol, dest, port));
		}
	}

	fn relevant_server_with_a_record(name: &str, ttl: u32) -> Server {
		let mut server = Server::new(Config::default());
		let mut transport = RecordingTransport::default();
		server.monitor.update_hw_interface(HwInterface { index: 2, up: true, multicast_capable: true, running: true, addresses: vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))], ..Default::default() }, &mut transport);

		let group = server.entries.create_group();
		let unique = PublishFlags { unique: true, ..Default::default() };
		server.entries.add(Some(group), IF_UNSPEC, None, unique, a(name, ttl)).unwrap();
		server
	}

	fn query_packet(key: &ResourceKey) -> Vec<u8> {
		let mut w = DnsPacketWriter::new(DEFAULT_PACKET_SIZE, 0, Flags::query());
		w.append_key(Section::Question, key, false).unwrap();
		w.finish()
	}

	#[test]
	fn matching_question_posts_a_deferred_response() {
		let mut server = relevant_server_with_a_record("printer.local", 120);
		let key = ResourceKey::new(Name::parse("printer.local").unwrap(), Class::In, RrType::A);
		let packet = query_packet(&key);
		let mut transport = RecordingTransport::default();

		server.handle_incoming_query(&packet, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50)), MDNS_PORT, 2, Protocol::Inet, Instant::now(), &mut transport);

		assert!(transport.sent.is_empty(), "a normal multicast query should be deferred through the scheduler, not answered immediately");
		let iface = server.monitor.interface_mut(2, Protocol::Inet).unwrap();
		assert!(iface.scheduler.pop_due_response(Instant::now() + RESPONSE_DEFER + RESPONSE_JITTER + Duration::from_millis(1)).is_some());
	}

	#[test]
	fn known_answer_at_full_ttl_suppresses_the_match() {
		let mut server = relevant_server_with_a_record("printer.local", 120);
		let key = ResourceKey::new(Name::parse("printer.local").unwrap(), Class::In, RrType::A);

		let mut w = DnsPacketWriter::new(DEFAULT_PACKET_SIZE, 0, Flags::query());
		w.append_key(Section::Question, &key, false).unwrap();
		w.append_record(Section::Answer, &a("printer.local", 120), false, 0).unwrap();
		let packet = w.finish();
		let mut transport = RecordingTransport::default();

		server.handle_incoming_query(&packet, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50)), MDNS_PORT, 2, Protocol::Inet, Instant::now(), &mut transport);

		let iface = server.monitor.interface_mut(2, Protocol::Inet).unwrap();
		assert!(iface.scheduler.pop_due_response(Instant::now() + RESPONSE_DEFER + RESPONSE_JITTER + Duration::from_millis(1)).is_none());
	}

	#[test]
	fn legacy_unicast_source_port_gets_an_immediate_reply() {
		let mut server = relevant_server_with_a_record("printer.local", 120);
		let key = ResourceKey::new(Name::parse("printer.local").unwrap(), Class::In, RrType::A);
		let packet = query_packet(&key);
		let mut transport = RecordingTransport::default();
		let source = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50));

		server.handle_incoming_query(&packet, source, 12345, 2, Protocol::Inet, Instant::now(), &mut transport);

		assert_eq!(transport.sent, vec![(2, Protocol::Inet, source, 12345)]);
	}

	#[test]
	fn losing_incoming_probe_against_a_still_probing_entry_marks_the_group_collided() {
		let mut server = relevant_server_with_a_record("host1.local", 120);
		let group = server.entries.iter_groups().next().unwrap().0;
		server.entries.group_mut(group).unwrap().state = GroupState::Registering;
		server.entries.group_mut(group).unwrap().n_probing = 1;

		let incoming = {
			let mut r = a("host1.local", 120);
			r.data = RecordData::A(Ipv4Addr::new(10, 0, 0, 9));
			r
		};
		let key = incoming.key.clone();

		let mut w = DnsPacketWriter::new(DEFAULT_PACKET_SIZE, 0, Flags::query());
		w.append_key(Section::Question, &key, false).unwrap();
		w.append_record(Section::Authority, &incoming, false, 0).unwrap();
		let packet = w.finish();
		let mut transport = RecordingTransport::default();

		server.handle_incoming_query(&packet, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50)), MDNS_PORT, 2, Protocol::Inet, Instant::now(), &mut transport);

		assert_eq!(server.entries.group(group).unwrap().state, GroupState::Collision);
	}

	#[test]
	fn matching_non_unique_records_are_ignored() {
		let local = a("printer.local", 120);
		let incoming = a("printer.local", 4500);
		let outcome = conflict_handling(&incoming, &local, false, false, true, false);
		assert_eq!(outcome, ConflictOutcome::Ignore);
	}

	#[test]
	fn equal_rdata_with_half_ttl_or_lower_refreshes() {
		let local = a("printer.local", 120);
		let mut incoming = local.clone();
		incoming.ttl = 40;
		let outcome = conflict_handling(&incoming, &local, true, true, true, false);
		assert_eq!(outcome, ConflictOutcome::Refresh);
	}

	#[test]
	fn differing_rdata_against_registered_unique_entry_resets_announcement() {
		let local = a("printer.local", 120);
		let mut incoming = local.clone();
		incoming.data = RecordData::A(Ipv4Addr::new(10, 0, 0, 2));
		let outcome = conflict_handling(&incoming, &local, true, true, true, false);
		assert_eq!(outcome, ConflictOutcome::ResetAnnouncement);
	}

	#[test]
	fn differing_rdata_while_still_probing_withdraws() {
		let local = a("printer.local", 120);
		let mut incoming = local.clone();
		incoming.data = RecordData::A(Ipv4Addr::new(10, 0, 0, 2));
		let outcome = conflict_handling(&incoming, &local, true, true, false, true);
		assert_eq!(outcome, ConflictOutcome::Withdraw);
	}

	#[test]
	fn probe_tie_break_favors_lexicographically_greater_rdata() {
		let low = a("printer.local", 120);
		let high = {
			let mut r = low.clone();
			r.data = RecordData::A(Ipv4Addr::new(10, 0, 0, 9));
			r
		};
		assert_eq!(incoming_probe(&high, &low), ProbeOutcome::WeWin);
		assert_eq!(incoming_probe(&low, &high), ProbeOutcome::WeLose);
		assert_eq!(incoming_probe(&low, &low), ProbeOutcome::NoConflict);
	}

	#[test]
	fn legacy_unicast_slot_resolves_and_expires() {
		let mut table = LegacyUnicastTable::default();
		let now = Instant::now();
		let rewritten = table.allocate(0x1234, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)), 54321, 2, now);
		let resolved = table.resolve(rewritten, now + Duration::from_millis(100));
		assert_eq!(resolved.unwrap().0, 0x1234);

		let rewritten2 = table.allocate(0x5678, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)), 54321, 2, now);
		assert!(table.resolve(rewritten2, now + LEGACY_UNICAST_TIMEOUT + Duration::from_secs(1)).is_none());
	}
}
