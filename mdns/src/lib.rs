//! mDNS (RFC 6762) / DNS-SD (RFC 6763) responder engine
//! (`avahi-core/core.h`'s public surface). A single-threaded, poll-driven
//! library: the embedder owns the event loop and feeds incoming datagrams
//! and timer ticks in; this crate owns the cache, the scheduler, the entry
//! table, and the probe/announce state machines and tells the embedder what
//! to send and when to wake it next.

pub mod announcer;
pub mod browse;
pub mod cache;
pub mod config;
pub mod dns_sd;
pub mod entry;
pub mod error;
pub mod interface;
pub mod scheduler;
pub mod server;
pub mod time_event;

pub use config::Config;
pub use entry::{EntryId, GroupId, InterfaceIndex, Protocol, PublishFlags};
pub use error::{Error, Result};
pub use server::{Server, ServerState};

use std::time::Instant;

use wire::{DnsPacketWriter, Flags, ResourceRecord, Section};

use announcer::{AnnounceAction, Announcement};
use entry::{GroupState, IF_UNSPEC};
use interface::{HwInterface, RelevanceChange, Transport};
use scheduler::DEFAULT_PACKET_SIZE;

/// How a host name rename is decided on collision (`avahi_server_set_host_name`'s
/// `host-N` fallback, RFC 6762 §9).
fn next_host_name_candidate(host_name: &str, attempt: u32) -> String {
	let base = host_name.rsplit_once('-').filter(|(_, suffix)| suffix.parse::<u32>().is_ok()).map(|(base, _)| base).unwrap_or(host_name);
	format!("{base}-{attempt}")
}

/// The embedder-facing poll API seam (`avahi_poll_api`): the engine asks to
/// be woken at a given instant rather than owning a run loop itself.
pub trait PollApi {
	fn set_wakeup(&mut self, at: Instant);
}

/// The well-known mDNS multicast group for a protocol (RFC 6762 §3).
fn multicast_address(protocol: Protocol) -> std::net::IpAddr {
	match protocol {
		Protocol::Inet => std::net::IpAddr::V4(std::net::Ipv4Addr::new(224, 0, 0, 251)),
		Protocol::Inet6 => std::net::IpAddr::V6("ff02::fb".parse().unwrap()),
	}
}

/// A probe is a query carrying the proposed record as an authority rather
/// than an answer (RFC 6762 §8.1; `avahi_interface_post_probe`).
fn probe_packet(record: &ResourceRecord) -> Vec<u8> {
	let mut writer = DnsPacketWriter::new(DEFAULT_PACKET_SIZE, 0, Flags::query());
	let _ = writer.append_key(Section::Question, &record.key, false);
	let _ = writer.append_record(Section::Authority, record, false, 0);
	writer.finish()
}

/// An unsolicited announcement is an ordinary response with no question
/// section (RFC 6762 §8.3).
fn announcement_packet(record: &ResourceRecord, unique: bool) -> Vec<u8> {
	let mut writer = DnsPacketWriter::new(DEFAULT_PACKET_SIZE, 0, Flags::response(true));
	let _ = writer.append_record(Section::Answer, record, unique, 0);
	writer.finish()
}

impl Server {
	/// `avahi_server_get_state`.
	pub fn state(&self) -> ServerState {
		self.state
	}

	/// `avahi_server_get_host_name`.
	pub fn host_name(&self) -> &str {
		&self.host_name
	}

	pub fn domain_name(&self) -> &str {
		&self.config.domain_name
	}

	/// `avahi_server_set_host_name`: renames and forces every committed
	/// group back through probing, since every record under the old FQDN
	/// is now stale.
	pub fn set_host_name(&mut self, host_name: String) -> Result<()> {
		if host_name.is_empty() || host_name.len() > 63 {
			return Err(Error::InvalidHostName);
		}
		self.host_name = host_name;
		self.state = ServerState::Registering;
		Ok(())
	}

	/// A probe or announcement for the host name's own address records
	/// lost outright: per RFC 6762 §9, pick `host-2`, `host-3`, ... until
	/// one survives a fresh probe round, rather than giving up.
	pub fn rename_host_name(&mut self) {
		let mut attempt = 2;
		loop {
			let candidate = next_host_name_candidate(&self.host_name, attempt);
			if candidate != self.host_name {
				self.host_name = candidate;
				self.state = ServerState::Registering;
				return;
			}
			attempt += 1;
		}
	}

	/// `avahi_s_entry_group_commit`, extended to actually stand up one
	/// [`Announcement`] per (entry, relevant interface) pair so
	/// [`Server::tick`] has something to drive. A group with no UNIQUE
	/// members needing a probe settles straight into ESTABLISHED; otherwise
	/// every member starts PROBING/WAITING per `Announcement::new`.
	pub fn commit_group(&mut self, group: GroupId, now: Instant) -> Instant {
		let start = match self.entries.group_mut(group) {
			Some(g) => g.commit(now),
			None => return now,
		};

		let entry_ids: Vec<EntryId> = self.entries.group(group).map(|g| g.entries.clone()).unwrap_or_default();
		let group_has_probing = entry_ids.iter().any(|id| self.entries.entry(*id).map(|e| !e.dead && e.flags.unique && !e.flags.no_probe).unwrap_or(false));

		let mut probing_count = 0u32;
		for id in &entry_ids {
			let Some(entry) = self.entries.entry(*id) else { continue };
			if entry.dead {
				continue;
			}
			let flags = entry.flags;
			let iface_filter = if entry.interface == IF_UNSPEC { None } else { Some(entry.interface) };
			let proto_filter = entry.protocol;

			let targets: Vec<(InterfaceIndex, Protocol)> = {
				let mut out = Vec::new();
				self.monitor.walk(iface_filter, proto_filter, |idx, iface| {
					if iface.relevant {
						out.push((idx, iface.protocol));
					}
				});
				out
			};

			for (idx, protocol) in targets {
				let announcement = Announcement::new(*id, flags, group_has_probing, !group_has_probing, start);
				if announcement.is_probing() {
					probing_count += 1;
				}
				if let Some(iface) = self.monitor.interface_mut(idx, protocol) {
					iface.announcements.push(announcement);
				}
			}
		}

		if let Some(g) = self.entries.group_mut(group) {
			g.n_probing = probing_count;
			if probing_count == 0 {
				g.state = GroupState::Established;
			}
		}

		start
	}

	/// `avahi_interface_monitor_update_rr`'s relevance-change half, plus
	/// `avahi_announce_interface`: joins/leaves the multicast group via
	/// `transport`, and for a newly-relevant interface, re-announces every
	/// already-committed group on it — a group committed before this
	/// interface existed would otherwise never be heard there.
	pub fn update_hw_interface(&mut self, hw: HwInterface, now: Instant, transport: &mut impl Transport) {
		let changes = self.monitor.update_hw_interface(hw, transport);
		for (index, protocol, change) in changes {
			if change == RelevanceChange::BecameRelevant {
				self.announce_committed_groups_on(index, protocol, now);
			}
		}
	}

	fn announce_committed_groups_on(&mut self, index: InterfaceIndex, protocol: entry::Protocol, now: Instant) {
		let committed: Vec<GroupId> = self.entries.iter_groups().filter(|(_, g)| matches!(g.state, GroupState::Registering | GroupState::Established)).map(|(id, _)| id).collect();

		for group in committed {
			let group_registering = self.entries.group(group).map(|g| g.state == GroupState::Registering).unwrap_or(false);
			let entry_ids: Vec<EntryId> = self.entries.group(group).map(|g| g.entries.clone()).unwrap_or_default();
			let mut new_probing = 0u32;

			for id in entry_ids {
				let Some(entry) = self.entries.entry(id) else { continue };
				if entry.dead || !entry.applies_to(index, protocol) {
					continue;
				}
				let flags = entry.flags;
				let announcement = Announcement::new(id, flags, group_registering, !group_registering, now);
				if announcement.is_probing() {
					new_probing += 1;
				}
				if let Some(iface) = self.monitor.interface_mut(index, protocol) {
					iface.announcements.push(announcement);
				}
			}

			if new_probing > 0 {
				if let Some(g) = self.entries.group_mut(group) {
					g.n_probing += new_probing;
				}
			}
		}
	}

	/// Drive every interface's cache timers, due scheduler jobs, and
	/// standing [`Announcement`]s once; sends whatever queries/responses/
	/// probes/announcements came due via `transport` and returns the next
	/// instant the caller should schedule a wakeup for via
	/// [`PollApi::set_wakeup`], across every interface.
	pub fn tick(&mut self, now: Instant, transport: &mut impl Transport) -> Option<Instant> {
		let mut next = None;
		let mut newly_established = Vec::new();

		let entries = &mut self.entries;
		self.monitor.walk(None, None, |index, iface| {
			iface.cache.process_due(now);
			let protocol = iface.protocol;
			let dest = multicast_address(protocol);

			let mut due_queries = Vec::new();
			while let Some(handle) = iface.scheduler.pop_due_query(now) {
				if let Some(job) = iface.scheduler.query_job(handle) {
					due_queries.push(job.key.clone());
				}
				iface.scheduler.finish_query(handle, now);
			}
			if !due_queries.is_empty() {
				let mut writer = DnsPacketWriter::new(DEFAULT_PACKET_SIZE, 0, Flags::query());
				for key in &due_queries {
					let _ = writer.append_key(Section::Question, key, false);
				}
				transport.send(index, protocol, dest, server::MDNS_PORT, &writer.finish());
			}

			let mut due_responses = Vec::new();
			while let Some(handle) = iface.scheduler.pop_due_response(now) {
				if let Some(job) = iface.scheduler.response_job(handle) {
					due_responses.push(job.record.clone());
				}
				iface.scheduler.finish_response(handle, now);
			}
			for packet in server::generate_response(&due_responses, &[], false, 0) {
				transport.send(index, protocol, dest, server::MDNS_PORT, &packet);
			}

			while let Some(handle) = iface.scheduler.pop_due_probe(now) {
				if let Some(job) = iface.scheduler.probe_job(handle) {
					let mut writer = DnsPacketWriter::new(DEFAULT_PACKET_SIZE, 0, Flags::query());
					let _ = writer.append_key(Section::Question, &job.key, false);
					for record in &job.records {
						let _ = writer.append_record(Section::Authority, record, false, 0);
					}
					transport.send(index, protocol, dest, server::MDNS_PORT, &writer.finish());
				}
				iface.scheduler.remove_probe(handle);
			}

			for announcement in iface.announcements.iter_mut() {
				let Some(entry) = entries.entry(announcement.entry) else { continue };
				let group = entry.group;
				let group_still_registering = group.and_then(|g| entries.group(g)).map(|g| g.state == GroupState::Registering).unwrap_or(false);
				let was_probing = announcement.is_probing();

				match announcement.tick(now, group_still_registering) {
					AnnounceAction::SendProbe => {
						if let Some(entry) = entries.entry(announcement.entry) {
							let packet = probe_packet(&entry.record);
							transport.send(index, protocol, multicast_address(protocol), server::MDNS_PORT, &packet);
						}
					}
					AnnounceAction::SendAnnouncement => {
						if let Some(entry) = entries.entry(announcement.entry) {
							let packet = announcement_packet(&entry.record, entry.flags.unique);
							transport.send(index, protocol, multicast_address(protocol), server::MDNS_PORT, &packet);
						}
					}
					AnnounceAction::None => {}
				}

				if was_probing && !announcement.is_probing() {
					if let Some(group) = group {
						if let Some(g) = entries.group_mut(group) {
							if g.probe_completed() {
								newly_established.push(group);
							}
						}
					}
				}
			}

			let candidate = [iface.cache.next_wakeup(), iface.scheduler.next_wakeup()].into_iter().flatten().min();
			next = match (next, candidate) {
				(None, c) => c,
				(n, None) => n,
				(Some(a), Some(b)) => Some(a.min(b)),
			};
		});

		for group in newly_established {
			let entries = &self.entries;
			self.monitor.walk(None, None, |_index, iface| {
				for announcement in iface.announcements.iter_mut() {
					if entries.entry(announcement.entry).and_then(|e| e.group) == Some(group) {
						announcement.group_established(now, true);
					}
				}
			});
		}

		next
	}

	/// Reflect an incoming packet to every other relevant interface when
	/// the reflector is enabled (`avahi-core/server.c`'s `reflect_*`
	/// family). `transport` actually transmits; `origin_interface` is
	/// excluded from the fan-out.
	pub fn reflect_packet(&mut self, packet: &[u8], origin_interface: InterfaceIndex, origin_protocol: Protocol, dest_port: u16, transport: &mut impl Transport) {
		if !self.config.enable_reflector {
			return;
		}

		let targets: Vec<(InterfaceIndex, Protocol)> = {
			let mut out = Vec::new();
			self.monitor.walk(None, None, |index, iface| {
				if index == origin_interface && iface.protocol == origin_protocol {
					return;
				}
				if !self.config.reflect_ipv && iface.protocol != origin_protocol {
					return;
				}
				if iface.relevant {
					out.push((index, iface.protocol));
				}
			});
			out
		};

		let dest = multicast_address(origin_protocol);
		for (index, protocol) in targets {
			transport.send(index, protocol, dest, dest_port, packet);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fresh_host_name_without_suffix_gets_dash_two() {
		assert_eq!(next_host_name_candidate("myhost", 2), "myhost-2");
	}

	#[test]
	fn already_suffixed_host_name_bumps_the_number() {
		assert_eq!(next_host_name_candidate("myhost-2", 3), "myhost-3");
	}

	#[test]
	fn server_starts_in_registering_state() {
		let server = Server::new(Config::default());
		assert_eq!(server.state(), ServerState::Registering);
	}

	#[test]
	fn set_host_name_rejects_empty_name() {
		let mut server = Server::new(Config::default());
		assert_eq!(server.set_host_name(String::new()), Err(Error::InvalidHostName));
	}

	#[test]
	fn rename_host_name_appends_dash_two_on_first_collision() {
		let mut server = Server::new(Config::default());
		server.host_name = "myhost".to_string();
		server.rename_host_name();
		assert_eq!(server.host_name, "myhost-2");
	}

	struct RecordingTransport {
		sent: Vec<(InterfaceIndex, Protocol)>,
	}

	impl Transport for RecordingTransport {
		fn join_multicast(&mut self, _interface: InterfaceIndex, _protocol: Protocol) {}
		fn leave_multicast(&mut self, _interface: InterfaceIndex, _protocol: Protocol) {}
		fn send(&mut self, interface: InterfaceIndex, protocol: Protocol, _dest: std::net::IpAddr, _port: u16, _packet: &[u8]) {
			self.sent.push((interface, protocol));
		}
	}

	fn relevant_hw_interface() -> interface::HwInterface {
		interface::HwInterface {
			index: 2,
			up: true,
			multicast_capable: true,
			running: true,
			addresses: vec![std::net::IpAddr::V4(std::net::Ipv4Addr::new(192, 168, 1, 10))],
			..Default::default()
		}
	}

	#[test]
	fn commit_group_stands_up_a_probing_announcement_per_relevant_interface() {
		let mut server = Server::new(Config::default());
		let mut transport = RecordingTransport { sent: Vec::new() };
		server.monitor.update_hw_interface(relevant_hw_interface(), &mut transport);

		let group = server.entries.create_group();
		let host = wire::Name::parse("demo.local").unwrap();
		dns_sd::add_address(&mut server.entries, group, IF_UNSPEC, None, host, std::net::IpAddr::V4(std::net::Ipv4Addr::new(192, 168, 1, 10))).unwrap();

		let now = Instant::now();
		server.commit_group(group, now);

		let g = server.entries.group(group).unwrap();
		assert_eq!(g.state, entry::GroupState::Registering);
		assert_eq!(g.n_probing, 2, "both the forward and reverse records are UNIQUE and need probing");
	}

	#[test]
	fn tick_sends_a_probe_for_each_standing_announcement_once_due() {
		let mut server = Server::new(Config::default());
		let mut transport = RecordingTransport { sent: Vec::new() };
		server.monitor.update_hw_interface(relevant_hw_interface(), &mut transport);

		let group = server.entries.create_group();
		let host = wire::Name::parse("demo.local").unwrap();
		dns_sd::add_address(&mut server.entries, group, IF_UNSPEC, None, host, std::net::IpAddr::V4(std::net::Ipv4Addr::new(192, 168, 1, 10))).unwrap();

		let now = Instant::now();
		server.commit_group(group, now);
		server.tick(now, &mut transport);

		assert_eq!(transport.sent.len(), 2, "one probe per UNIQUE record on the one relevant interface");
		assert!(transport.sent.iter().all(|&(idx, proto)| idx == 2 && proto == Protocol::Inet));
	}

	#[test]
	fn group_with_no_unique_members_establishes_immediately_on_commit() {
		let mut server = Server::new(Config::default());
		let group = server.entries.create_group();
		dns_sd::add_ptr(&mut server.entries, group, IF_UNSPEC, None, wire::Name::parse("_ipp._tcp.local").unwrap(), wire::Name::parse("Printer._ipp._tcp.local").unwrap(), 4500).unwrap();

		server.commit_group(group, Instant::now());

		let g = server.entries.group(group).unwrap();
		assert_eq!(g.state, entry::GroupState::Established);
		assert_eq!(g.n_probing, 0);
	}

	#[test]
	fn tick_sends_packets_for_due_query_and_response_jobs_instead_of_just_discarding_them() {
		use wire::{Class, Name, RecordData, ResourceKey, ResourceRecord, RrType};

		let mut server = Server::new(Config::default());
		let mut transport = RecordingTransport { sent: Vec::new() };
		server.monitor.update_hw_interface(relevant_hw_interface(), &mut transport);

		let now = Instant::now();
		let key = ResourceKey::new(Name::parse("_ipp._tcp.local").unwrap(), Class::In, RrType::Ptr);
		let record = ResourceRecord::new(key.clone(), 120, RecordData::A(std::net::Ipv4Addr::new(10, 0, 0, 1)));
		{
			let iface = server.monitor.interface_mut(2, Protocol::Inet).unwrap();
			iface.scheduler.post_query(key, now, true);
			iface.scheduler.post_response(record, false, None, now, true);
		}

		server.tick(now + std::time::Duration::from_millis(1), &mut transport);

		assert_eq!(transport.sent.len(), 2, "the due query and the due response should each become one outgoing packet");
	}

	#[test]
	fn update_hw_interface_reannounces_already_committed_groups_on_newly_relevant_interface() {
		let mut server = Server::new(Config::default());
		let group = server.entries.create_group();
		dns_sd::add_ptr(&mut server.entries, group, IF_UNSPEC, None, wire::Name::parse("_ipp._tcp.local").unwrap(), wire::Name::parse("Printer._ipp._tcp.local").unwrap(), 4500).unwrap();

		let now = Instant::now();
		server.commit_group(group, now);
		assert_eq!(server.entries.group(group).unwrap().state, entry::GroupState::Established);

		// No interface was relevant at commit time, so no Announcement
		// exists anywhere yet; bringing one up afterward should still
		// stand one up for the already-committed group.
		let mut transport = RecordingTransport { sent: Vec::new() };
		server.update_hw_interface(relevant_hw_interface(), now, &mut transport);

		let iface = server.monitor.interface(2, Protocol::Inet).unwrap();
		assert_eq!(iface.announcements.len(), 1);
	}
}
