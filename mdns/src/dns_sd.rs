//! DNS-SD (RFC 6763) naming conventions and convenience publish helpers
//! (`avahi-core/publish.h`'s documented surface: `avahi_server_add_service`,
//! `avahi_server_add_address`, and friends).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use wire::{Class, Name, RecordData, ResourceKey, ResourceRecord, RrType};

use crate::entry::{EntryTable, GroupId, InterfaceIndex, Protocol, PublishFlags};
use crate::error::{Error, Result};

/// `_services._dns-sd._udp.<domain>` — the meta-query a `ServiceTypeBrowser`
/// watches to enumerate every service type advertised on the link.
pub fn service_type_enumerator_name(domain: &str) -> Result<Name> {
	Name::parse(&format!("_services._dns-sd._udp.{domain}")).map_err(|_| Error::InvalidDomainName)
}

/// `<type>.<domain>`, e.g. `_ipp._tcp.local` — the name a PTR record for a
/// service type lives at; `avahi_service_browser_new` queries this.
pub fn service_type_name(service_type: &str, domain: &str) -> Result<Name> {
	validate_service_type(service_type)?;
	Name::parse(&format!("{service_type}.{domain}")).map_err(|_| Error::InvalidDomainName)
}

/// `<instance>.<type>.<domain>`, e.g. `My Printer._ipp._tcp.local` — the
/// name a service instance's SRV/TXT records live at.
pub fn service_instance_name(instance: &str, service_type: &str, domain: &str) -> Result<Name> {
	if instance.is_empty() || instance.len() > 63 {
		return Err(Error::InvalidServiceName);
	}
	validate_service_type(service_type)?;
	Name::parse(&format!("{}.{service_type}.{domain}", escape_instance(instance))).map_err(|_| Error::InvalidServiceName)
}

fn escape_instance(instance: &str) -> String {
	instance.replace('\\', "\\\\").replace('.', "\\.")
}

fn validate_service_type(service_type: &str) -> Result<()> {
	let labels: Vec<&str> = service_type.split('.').collect();
	if labels.len() != 2 {
		return Err(Error::InvalidServiceType);
	}
	for label in &labels {
		if !label.starts_with('_') || label.len() < 2 {
			return Err(Error::InvalidServiceType);
		}
	}
	match labels[1] {
		"_tcp" | "_udp" => Ok(()),
		_ => Err(Error::InvalidServiceType),
	}
}

/// `<subtype>._sub.<type>.<domain>` — the PTR name a service subtype is
/// advertised under (RFC 6763 §7.1).
pub fn service_subtype_name(subtype: &str, service_type: &str, domain: &str) -> Result<Name> {
	if subtype.is_empty() {
		return Err(Error::InvalidServiceSubtype);
	}
	validate_service_type(service_type)?;
	Name::parse(&format!("{subtype}._sub.{service_type}.{domain}")).map_err(|_| Error::InvalidServiceSubtype)
}

/// The reverse-lookup name for an address: `<reversed-octets>.in-addr.arpa`
/// for IPv4, `<reversed-nibbles>.ip6.arpa` for IPv6.
pub fn reverse_address_name(addr: IpAddr) -> Name {
	match addr {
		IpAddr::V4(v4) => reverse_ipv4_name(v4),
		IpAddr::V6(v6) => reverse_ipv6_name(v6),
	}
}

fn reverse_ipv4_name(addr: Ipv4Addr) -> Name {
	let octets = addr.octets();
	let labels = format!("{}.{}.{}.{}.in-addr.arpa", octets[3], octets[2], octets[1], octets[0]);
	Name::parse(&labels).expect("reverse ipv4 name is always well-formed")
}

fn reverse_ipv6_name(addr: Ipv6Addr) -> Name {
	let mut labels = String::new();
	for byte in addr.octets().iter().rev() {
		labels.push_str(&format!("{:x}.{:x}.", byte & 0x0F, byte >> 4));
	}
	labels.push_str("ip6.arpa");
	Name::parse(&labels).expect("reverse ipv6 name is always well-formed")
}

/// Arguments for [`add_service`]; mirrors `avahi_server_add_service`'s
/// parameter list.
pub struct ServiceParams<'a> {
	pub instance: &'a str,
	pub service_type: &'a str,
	pub domain: &'a str,
	pub host: Name,
	pub port: u16,
	pub txt: Vec<Vec<u8>>,
}

/// `avahi_server_add_service`: publishes the PTR (type→instance), SRV, and
/// TXT records for one service instance as three entries in `group`.
pub fn add_service(table: &mut EntryTable, group: GroupId, interface: InterfaceIndex, protocol: Option<Protocol>, params: ServiceParams) -> Result<()> {
	if params.port == 0 {
		return Err(Error::InvalidPort);
	}

	let type_name = service_type_name(params.service_type, params.domain)?;
	let instance_name = service_instance_name(params.instance, params.service_type, params.domain)?;

	let ptr_key = ResourceKey::new(type_name, Class::In, RrType::Ptr);
	let ptr_flags = PublishFlags::default();
	table.add(Some(group), interface, protocol, ptr_flags, ResourceRecord::new(ptr_key, 4500, RecordData::Ptr(instance_name.clone()))).map_err(|_| Error::InvalidRecord)?;

	let srv_key = ResourceKey::new(instance_name.clone(), Class::In, RrType::Srv);
	let srv_flags = PublishFlags { unique: true, ..Default::default() };
	let srv_data = RecordData::Srv { priority: 0, weight: 0, port: params.port, target: params.host };
	table.add(Some(group), interface, protocol, srv_flags, ResourceRecord::new(srv_key, 120, srv_data)).map_err(|_| Error::InvalidRecord)?;

	let txt_key = ResourceKey::new(instance_name, Class::In, RrType::Txt);
	let txt_flags = PublishFlags { unique: true, ..Default::default() };
	table.add(Some(group), interface, protocol, txt_flags, ResourceRecord::new(txt_key, 4500, RecordData::Txt(params.txt))).map_err(|_| Error::InvalidRecord)?;

	Ok(())
}

/// `avahi_server_add_service_subtype`: one extra PTR, `<subtype>._sub.<type>
/// → <instance>.<type>`, alongside an already-published service.
pub fn add_service_subtype(table: &mut EntryTable, group: GroupId, interface: InterfaceIndex, protocol: Option<Protocol>, subtype: &str, service_type: &str, domain: &str, instance: &str) -> Result<()> {
	let subtype_name = service_subtype_name(subtype, service_type, domain)?;
	let instance_name = service_instance_name(instance, service_type, domain)?;
	let key = ResourceKey::new(subtype_name, Class::In, RrType::Ptr);
	table.add(Some(group), interface, protocol, PublishFlags::default(), ResourceRecord::new(key, 4500, RecordData::Ptr(instance_name))).map_err(|_| Error::InvalidRecord)?;
	Ok(())
}

/// `avahi_server_add_ptr`.
pub fn add_ptr(table: &mut EntryTable, group: GroupId, interface: InterfaceIndex, protocol: Option<Protocol>, name: Name, target: Name, ttl: u32) -> Result<()> {
	let key = ResourceKey::new(name, Class::In, RrType::Ptr);
	table.add(Some(group), interface, protocol, PublishFlags::default(), ResourceRecord::new(key, ttl, RecordData::Ptr(target))).map_err(|_| Error::InvalidRecord)?;
	Ok(())
}

/// `avahi_server_add_address`: forward A/AAAA plus the matching reverse
/// PTR under `in-addr.arpa`/`ip6.arpa`.
pub fn add_address(table: &mut EntryTable, group: GroupId, interface: InterfaceIndex, protocol: Option<Protocol>, host: Name, addr: IpAddr) -> Result<()> {
	let flags = PublishFlags { unique: true, ..Default::default() };

	let (fwd_type, fwd_data) = match addr {
		IpAddr::V4(v4) => (RrType::A, RecordData::A(v4)),
		IpAddr::V6(v6) => (RrType::Aaaa, RecordData::Aaaa(v6)),
	};
	let fwd_key = ResourceKey::new(host.clone(), Class::In, fwd_type);
	table.add(Some(group), interface, protocol, flags, ResourceRecord::new(fwd_key, 120, fwd_data)).map_err(|_| Error::InvalidRecord)?;

	let reverse_key = ResourceKey::new(reverse_address_name(addr), Class::In, RrType::Ptr);
	table.add(Some(group), interface, protocol, flags, ResourceRecord::new(reverse_key, 120, RecordData::Ptr(host))).map_err(|_| Error::InvalidRecord)?;

	Ok(())
}

/// `avahi_server_add_text`/`add_text_strlst` — a bare TXT record, for
/// publishing metadata under a name not already covered by
/// [`add_service`].
pub fn add_txt(table: &mut EntryTable, group: GroupId, interface: InterfaceIndex, protocol: Option<Protocol>, name: Name, strings: Vec<Vec<u8>>, ttl: u32) -> Result<()> {
	let key = ResourceKey::new(name, Class::In, RrType::Txt);
	table.add(Some(group), interface, protocol, PublishFlags::default(), ResourceRecord::new(key, ttl, RecordData::Txt(strings))).map_err(|_| Error::InvalidRecord)?;
	Ok(())
}
