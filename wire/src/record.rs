//! The record model: keys, typed records, and the ordering used for probe
//! tie-breaking. Grounded on `avahi-core/rr.h`/`rr.c` for the field layout
//! and on `dylnuge-montague`'s `DnsRRType`/`DnsClass` for the enum shape,
//! adapted so that unknown values round-trip instead of being rejected
//! (mDNS responders must forward/cache record types they don't understand).

use core::cmp::Ordering;
use core::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::name::Name;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum RrType {
	A,
	Aaaa,
	Cname,
	Ptr,
	Hinfo,
	Txt,
	Srv,
	Any,
	Other(u16),
}

impl RrType {
	pub fn from_u16(v: u16) -> Self {
		match v {
			1 => Self::A,
			5 => Self::Cname,
			12 => Self::Ptr,
			13 => Self::Hinfo,
			16 => Self::Txt,
			28 => Self::Aaaa,
			33 => Self::Srv,
			255 => Self::Any,
			other => Self::Other(other),
		}
	}

	pub fn to_u16(self) -> u16 {
		match self {
			Self::A => 1,
			Self::Cname => 5,
			Self::Ptr => 12,
			Self::Hinfo => 13,
			Self::Txt => 16,
			Self::Aaaa => 28,
			Self::Srv => 33,
			Self::Any => 255,
			Self::Other(v) => v,
		}
	}

	pub fn is_pattern(self) -> bool {
		matches!(self, Self::Any)
	}
}

/// DNS class, with the cache-flush/unicast-response top bit already
/// stripped (see [`crate::packet`]); only the 15-bit class value lives
/// here.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Class {
	In,
	Any,
	Other(u16),
}

impl Class {
	pub fn from_u16(v: u16) -> Self {
		match v {
			1 => Self::In,
			255 => Self::Any,
			other => Self::Other(other),
		}
	}

	pub fn to_u16(self) -> u16 {
		match self {
			Self::In => 1,
			Self::Any => 255,
			Self::Other(v) => v,
		}
	}

	pub fn is_pattern(self) -> bool {
		matches!(self, Self::Any)
	}
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
	pub name: Name,
	pub class: Class,
	pub rr_type: RrType,
}

impl ResourceKey {
	pub fn new(name: Name, class: Class, rr_type: RrType) -> Self {
		Self { name, class, rr_type }
	}

	/// A key matches any type (and, per `avahi_key_is_pattern`, any class)
	/// in that name — used by `Cache::walk` and by incoming questions.
	pub fn is_pattern(&self) -> bool {
		self.rr_type.is_pattern() || self.class.is_pattern()
	}

	/// Name-insensitive, type/class-exact equality, used as the cache and
	/// entry index key.
	pub fn matches(&self, other: &ResourceKey) -> bool {
		if self.name != other.name {
			return false;
		}

		let class_ok = self.class.is_pattern() || other.class.is_pattern() || self.class == other.class;
		let type_ok = self.rr_type.is_pattern() || other.rr_type.is_pattern() || self.rr_type == other.rr_type;
		class_ok && type_ok
	}
}

impl fmt::Debug for ResourceKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} {:?} {:?}", self.name, self.class, self.rr_type)
	}
}

#[derive(Clone, PartialEq, Eq)]
pub enum RecordData {
	A(Ipv4Addr),
	Aaaa(Ipv6Addr),
	Ptr(Name),
	Cname(Name),
	Srv { priority: u16, weight: u16, port: u16, target: Name },
	Txt(Vec<Vec<u8>>),
	Hinfo { cpu: Vec<u8>, os: Vec<u8> },
	Generic { rr_type: u16, rdata: Vec<u8> },
}

impl RecordData {
	/// The canonical rdata bytes used for lexicographic comparison
	/// (the probe tie-break in RFC 6762 §8.2) and for rdata-equality
	/// tests that must not depend on name compression choices made when
	/// serializing.
	pub fn canonical_bytes(&self) -> Vec<u8> {
		match self {
			Self::A(addr) => addr.octets().to_vec(),
			Self::Aaaa(addr) => addr.octets().to_vec(),
			Self::Ptr(name) | Self::Cname(name) => canonical_name_bytes(name),
			Self::Srv { priority, weight, port, target } => {
				let mut out = Vec::with_capacity(6 + target.wire_len());
				out.extend_from_slice(&priority.to_be_bytes());
				out.extend_from_slice(&weight.to_be_bytes());
				out.extend_from_slice(&port.to_be_bytes());
				out.extend_from_slice(&canonical_name_bytes(target));
				out
			}
			Self::Txt(strings) => {
				let mut out = Vec::new();
				for s in strings {
					out.push(s.len() as u8);
					out.extend_from_slice(s);
				}
				out
			}
			Self::Hinfo { cpu, os } => {
				let mut out = Vec::with_capacity(cpu.len() + os.len() + 2);
				out.push(cpu.len() as u8);
				out.extend_from_slice(cpu);
				out.push(os.len() as u8);
				out.extend_from_slice(os);
				out
			}
			Self::Generic { rdata, .. } => rdata.clone(),
		}
	}
}

/// Names inside rdata are compared/canonicalized case-insensitively but
/// without compression, matching `avahi_rdata_compare`'s normalized form.
fn canonical_name_bytes(name: &Name) -> Vec<u8> {
	let mut out = Vec::new();
	for label in name.normalized_labels() {
		out.push(label.len() as u8);
		out.extend_from_slice(&label);
	}
	out.push(0);
	out
}

impl fmt::Debug for RecordData {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::A(a) => write!(f, "A {a}"),
			Self::Aaaa(a) => write!(f, "AAAA {a}"),
			Self::Ptr(n) => write!(f, "PTR {n}"),
			Self::Cname(n) => write!(f, "CNAME {n}"),
			Self::Srv { priority, weight, port, target } => write!(f, "SRV {priority} {weight} {port} {target}"),
			Self::Txt(strings) => write!(f, "TXT ({} strings)", strings.len()),
			Self::Hinfo { cpu, os } => write!(f, "HINFO {} {}", String::from_utf8_lossy(cpu), String::from_utf8_lossy(os)),
			Self::Generic { rr_type, rdata } => write!(f, "TYPE{rr_type} ({} bytes)", rdata.len()),
		}
	}
}

#[derive(Clone, PartialEq, Eq)]
pub struct ResourceRecord {
	pub key: ResourceKey,
	pub ttl: u32,
	pub data: RecordData,
}

impl ResourceRecord {
	pub fn new(key: ResourceKey, ttl: u32, data: RecordData) -> Self {
		Self { key, ttl, data }
	}

	/// A goodbye announces its own removal with TTL 0 (RFC 6762 §10.1).
	pub fn is_goodbye(&self) -> bool {
		self.ttl == 0
	}

	/// Key and rdata equal, TTL ignored — the comparison `cache_update`
	/// and the scheduler's job-matching logic use throughout.
	pub fn equal_no_ttl(&self, other: &ResourceRecord) -> bool {
		self.key == other.key && self.data == other.data
	}

	/// (class, type, canonical rdata) ordering used for RFC 6762 §8.2
	/// probe conflict tie-breaking: lexicographically greater record wins.
	pub fn cmp_lexicographic(&self, other: &ResourceRecord) -> Ordering {
		self.key
			.class
			.to_u16()
			.cmp(&other.key.class.to_u16())
			.then_with(|| self.key.rr_type.to_u16().cmp(&other.key.rr_type.to_u16()))
			.then_with(|| self.data.canonical_bytes().cmp(&other.data.canonical_bytes()))
	}
}

impl fmt::Debug for ResourceRecord {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:?} ttl={} {:?}", self.key, self.ttl, self.data)
	}
}
