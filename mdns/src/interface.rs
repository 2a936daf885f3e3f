//! Multi-interface dispatch (`avahi-core/iface.c`, `iface-linux.c`). The
//! actual netlink/route-socket feed and multicast group membership are
//! external collaborators reached through [`Transport`]; this module only
//! tracks which (ifIndex, protocol) pairs exist, whether each is
//! *relevant*, and owns the per-protocol cache/scheduler/announcement set.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::announcer::Announcement;
use crate::cache::Cache;
use crate::entry::{InterfaceIndex, Protocol};
use crate::scheduler::Scheduler;

/// External collaborator seam for joining/leaving the mDNS multicast
/// group and actually writing datagrams; the engine never touches a
/// socket directly; real multicast/UDP I/O is plugged in externally.
pub trait Transport {
	fn join_multicast(&mut self, interface: InterfaceIndex, protocol: Protocol);
	fn leave_multicast(&mut self, interface: InterfaceIndex, protocol: Protocol);
	fn send(&mut self, interface: InterfaceIndex, protocol: Protocol, dest: IpAddr, port: u16, packet: &[u8]);
}

#[derive(Clone, Debug, Default)]
pub struct HwInterface {
	pub name: String,
	pub index: InterfaceIndex,
	pub up: bool,
	pub loopback: bool,
	pub multicast_capable: bool,
	pub point_to_point: bool,
	pub running: bool,
	pub mtu: usize,
	pub mac_address: [u8; 6],
	pub addresses: Vec<IpAddr>,
}

impl HwInterface {
	/// Has at least one address of global (non-link-local-only,
	/// non-loopback) scope.
	fn has_global_address(&self) -> bool {
		self.addresses.iter().any(|addr| match addr {
			IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_unspecified(),
			IpAddr::V6(v6) => !v6.is_loopback() && !v6.is_unspecified(),
		})
	}
}

pub struct Interface {
	pub protocol: Protocol,
	pub cache: Cache,
	pub scheduler: Scheduler,
	pub announcements: Vec<Announcement>,
	pub relevant: bool,
}

impl Interface {
	fn new(protocol: Protocol) -> Self {
		Self { protocol, cache: Cache::new(), scheduler: Scheduler::new(), announcements: Vec::new(), relevant: false }
	}
}

pub struct InterfaceMonitor {
	hw: HashMap<InterfaceIndex, HwInterface>,
	protocols: HashMap<(InterfaceIndex, Protocol), Interface>,
	use_iff_running: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RelevanceChange {
	BecameRelevant,
	BecameIrrelevant,
	Unchanged,
}

impl InterfaceMonitor {
	pub fn new(use_iff_running: bool) -> Self {
		Self { hw: HashMap::new(), protocols: HashMap::new(), use_iff_running }
	}

	/// `avahi_interface_relevant`.
	fn is_relevant(&self, hw: &HwInterface) -> bool {
		hw.up && !hw.loopback && hw.multicast_capable && !hw.point_to_point && hw.has_global_address() && (!self.use_iff_running || hw.running)
	}

	/// The OS link-event feed reports a hardware interface's current
	/// state (`avahi_interface_monitor_update_rr`'s netlink-driven half,
	/// here given directly by the external collaborator).
	pub fn update_hw_interface(&mut self, hw: HwInterface, transport: &mut impl Transport) -> Vec<(InterfaceIndex, Protocol, RelevanceChange)> {
		let index = hw.index;
		let was_relevant = self.hw.get(&index).map(|old| self.is_relevant(old)).unwrap_or(false);
		let now_relevant = self.is_relevant(&hw);
		self.hw.insert(index, hw.clone());

		let mut changes = Vec::new();
		for protocol in [Protocol::Inet, Protocol::Inet6] {
			if !hw.addresses.iter().any(|a| matches!((a, protocol), (IpAddr::V4(_), Protocol::Inet) | (IpAddr::V6(_), Protocol::Inet6))) {
				continue;
			}
			let change = self.transition(index, protocol, was_relevant, now_relevant, transport);
			changes.push((index, protocol, change));
		}
		changes
	}

	fn transition(&mut self, index: InterfaceIndex, protocol: Protocol, was_relevant: bool, now_relevant: bool, transport: &mut impl Transport) -> RelevanceChange {
		let entry = self.protocols.entry((index, protocol)).or_insert_with(|| Interface::new(protocol));

		if !was_relevant && now_relevant {
			entry.relevant = true;
			transport.join_multicast(index, protocol);
			RelevanceChange::BecameRelevant
		} else if was_relevant && !now_relevant {
			entry.relevant = false;
			transport.leave_multicast(index, protocol);
			entry.cache.flush();
			entry.announcements.clear();
			RelevanceChange::BecameIrrelevant
		} else {
			RelevanceChange::Unchanged
		}
	}

	pub fn interface(&self, index: InterfaceIndex, protocol: Protocol) -> Option<&Interface> {
		self.protocols.get(&(index, protocol))
	}

	pub fn interface_mut(&mut self, index: InterfaceIndex, protocol: Protocol) -> Option<&mut Interface> {
		self.protocols.get_mut(&(index, protocol))
	}

	pub fn hw_interface(&self, index: InterfaceIndex) -> Option<&HwInterface> {
		self.hw.get(&index)
	}

	/// `avahi_interface_monitor_walk`: visit every (interface, protocol)
	/// matching the given filters, `IF_UNSPEC`/`None` acting as wildcards.
	pub fn walk(&mut self, interface_filter: Option<InterfaceIndex>, protocol_filter: Option<Protocol>, mut cb: impl FnMut(InterfaceIndex, &mut Interface)) {
		for (&(index, protocol), iface) in self.protocols.iter_mut() {
			if let Some(want) = interface_filter {
				if want != index {
					continue;
				}
			}
			if let Some(want) = protocol_filter {
				if want != protocol {
					continue;
				}
			}
			cb(index, iface);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::Ipv4Addr;

	#[derive(Default)]
	struct FakeTransport {
		joins: Vec<(InterfaceIndex, Protocol)>,
		leaves: Vec<(InterfaceIndex, Protocol)>,
	}

	impl Transport for FakeTransport {
		fn join_multicast(&mut self, interface: InterfaceIndex, protocol: Protocol) {
			self.joins.push((interface, protocol));
		}
		fn leave_multicast(&mut self, interface: InterfaceIndex, protocol: Protocol) {
			self.leaves.push((interface, protocol));
		}
		fn send(&mut self, _interface: InterfaceIndex, _protocol: Protocol, _dest: IpAddr, _port: u16, _packet: &[u8]) {}
	}

	fn up_interface() -> HwInterface {
		HwInterface {
			name: "eth0".into(),
			index: 2,
			up: true,
			loopback: false,
			multicast_capable: true,
			point_to_point: false,
			running: true,
			mtu: 1500,
			mac_address: [0; 6],
			addresses: vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))],
		}
	}

	#[test]
	fn up_multicast_interface_with_address_becomes_relevant_and_joins() {
		let mut monitor = InterfaceMonitor::new(false);
		let mut transport = FakeTransport::default();
		let changes = monitor.update_hw_interface(up_interface(), &mut transport);
		assert!(changes.iter().any(|&(_, p, c)| p == Protocol::Inet && c == RelevanceChange::BecameRelevant));
		assert_eq!(transport.joins, vec![(2, Protocol::Inet)]);
	}

	#[test]
	fn going_down_leaves_multicast_and_flushes_cache() {
		let mut monitor = InterfaceMonitor::new(false);
		let mut transport = FakeTransport::default();
		monitor.update_hw_interface(up_interface(), &mut transport);

		let mut down = up_interface();
		down.up = false;
		monitor.update_hw_interface(down, &mut transport);

		assert_eq!(transport.leaves, vec![(2, Protocol::Inet)]);
	}

	#[test]
	fn loopback_never_becomes_relevant() {
		let mut monitor = InterfaceMonitor::new(false);
		let mut transport = FakeTransport::default();
		let mut lo = up_interface();
		lo.loopback = true;
		lo.addresses = vec![IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))];
		let changes = monitor.update_hw_interface(lo, &mut transport);
		assert!(changes.iter().all(|&(_, _, c)| c == RelevanceChange::Unchanged));
	}
}
