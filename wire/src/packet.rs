//! DNS packet assembly and parsing (`avahi-core/dns.c`'s
//! `avahi_dns_packet_*` family, minus TCP length-prefix framing — mDNS is
//! UDP-only).
//!
//! `DnsPacketWriter` owns a [`Cursor`] plus a by-suffix name compression
//! index; `DnsPacketReader` wraps a [`Slice`] and decodes against the same
//! compression rules, following pointers through an independent sub-cursor
//! so the caller's own read position is untouched.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use collections::bytes::{Cursor, Slice};
use utils::error::Result;

use crate::name::{Name, MAX_NAME_LEN};
use crate::record::{Class, RecordData, ResourceKey, ResourceRecord, RrType};

pub const HEADER_LEN: usize = 12;
const MAX_POINTER_HOPS: usize = 128;
const POINTER_FLAG: u16 = 0xC000;
const POINTER_OFFSET_MASK: u16 = 0x3FFF;
const MAX_COMPRESSIBLE_OFFSET: u16 = 0x3FFF;

/// The 16-bit header flags word: QR, OPCODE(4), AA, TC, RD, RA, Z, AD, CD,
/// RCODE(4).
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Flags(u16);

impl Flags {
	const QR: u16 = 0x8000;
	const OPCODE_SHIFT: u32 = 11;
	const OPCODE_MASK: u16 = 0x7800;
	const AA: u16 = 0x0400;
	const TC: u16 = 0x0200;
	const RD: u16 = 0x0100;
	const RA: u16 = 0x0080;
	const Z: u16 = 0x0040;
	const AD: u16 = 0x0020;
	const CD: u16 = 0x0010;
	const RCODE_MASK: u16 = 0x000F;

	pub fn new() -> Self {
		Self(0)
	}

	pub fn from_u16(v: u16) -> Self {
		Self(v)
	}

	pub fn to_u16(self) -> u16 {
		self.0
	}

	pub fn query() -> Self {
		Self(0)
	}

	pub fn response(authoritative: bool) -> Self {
		let mut f = Self(Self::QR);
		if authoritative {
			f.0 |= Self::AA;
		}
		f
	}

	pub fn qr(self) -> bool {
		self.0 & Self::QR != 0
	}

	pub fn opcode(self) -> u8 {
		((self.0 & Self::OPCODE_MASK) >> Self::OPCODE_SHIFT) as u8
	}

	pub fn truncated(self) -> bool {
		self.0 & Self::TC != 0
	}

	pub fn with_truncated(mut self, v: bool) -> Self {
		self.set(Self::TC, v);
		self
	}

	pub fn authoritative(self) -> bool {
		self.0 & Self::AA != 0
	}

	pub fn rcode(self) -> u8 {
		(self.0 & Self::RCODE_MASK) as u8
	}

	fn set(&mut self, mask: u16, v: bool) {
		if v {
			self.0 |= mask;
		} else {
			self.0 &= !mask;
		}
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Section {
	Question,
	Answer,
	Authority,
	Additional,
}

/// `cache_flush`/`unicast_response` share the class field's top bit
/// (0x8000): cache-flush in responses, unicast-response-requested in
/// queries. Stripped before storage, set only at serialization time.
const CLASS_TOP_BIT: u16 = 0x8000;

pub struct DnsPacketWriter {
	cursor: Cursor,
	compression: HashMap<Vec<Vec<u8>>, u16>,
	id: u16,
	flags: Flags,
	qdcount: u16,
	ancount: u16,
	nscount: u16,
	arcount: u16,
}

impl DnsPacketWriter {
	pub fn new(max_size: usize, id: u16, flags: Flags) -> Self {
		let mut cursor = Cursor::with_capacity(max_size);
		// Reserve the 12-byte header with zero counts; `finish` backfills
		// them once every section has been written, since the counts are
		// only known after aggregation packs as many jobs as fit.
		let _ = cursor.push_u16(id);
		let _ = cursor.push_u16(flags.to_u16());
		for _ in 0..4 {
			let _ = cursor.push_u16(0);
		}

		Self { cursor, compression: HashMap::new(), id, flags, qdcount: 0, ancount: 0, nscount: 0, arcount: 0 }
	}

	pub fn id(&self) -> u16 {
		self.id
	}

	pub fn flags(&self) -> Flags {
		self.flags
	}

	pub fn set_flags(&mut self, flags: Flags) {
		self.flags = flags;
	}

	pub fn len(&self) -> usize {
		self.cursor.len()
	}

	pub fn remaining(&self) -> usize {
		self.cursor.remaining()
	}

	pub fn is_empty_of_records(&self) -> bool {
		self.qdcount == 0 && self.ancount == 0 && self.nscount == 0 && self.arcount == 0
	}

	pub fn set_max(&mut self, max: usize) {
		self.cursor.set_max(max);
	}

	pub fn count(&self, section: Section) -> u16 {
		match section {
			Section::Question => self.qdcount,
			Section::Answer => self.ancount,
			Section::Authority => self.nscount,
			Section::Additional => self.arcount,
		}
	}

	fn bump(&mut self, section: Section) {
		match section {
			Section::Question => self.qdcount += 1,
			Section::Answer => self.ancount += 1,
			Section::Authority => self.nscount += 1,
			Section::Additional => self.arcount += 1,
		}
	}

	/// Write `name`'s labels, using (and extending) the compression index.
	/// Any inserted compression entries are recorded into `inserted` so a
	/// failed caller can undo them alongside the cursor rewind.
	fn append_name_inner(&mut self, name: &Name, inserted: &mut Vec<Vec<Vec<u8>>>) -> Result<()> {
		let labels = name.normalized_labels();
		let raw_labels = name.labels();

		for i in 0..labels.len() {
			let suffix = &labels[i..];

			if let Some(&offset) = self.compression.get(suffix) {
				for label in &raw_labels[..i] {
					self.cursor.push_u8(label.len() as u8)?;
					self.cursor.push_bytes(label)?;
				}
				self.cursor.push_u16(POINTER_FLAG | offset)?;
				return Ok(());
			}
		}

		for i in 0..labels.len() {
			let pos = self.cursor.len();
			if pos <= MAX_COMPRESSIBLE_OFFSET as usize {
				let key = labels[i..].to_vec();
				self.compression.insert(key.clone(), pos as u16);
				inserted.push(key);
			}

			self.cursor.push_u8(raw_labels[i].len() as u8)?;
			self.cursor.push_bytes(&raw_labels[i])?;
		}

		self.cursor.push_u8(0)
	}

	pub fn append_name(&mut self, name: &Name) -> Result<()> {
		let mark = self.cursor.mark();
		let mut inserted = Vec::new();

		match self.append_name_inner(name, &mut inserted) {
			Ok(()) => Ok(()),
			Err(()) => {
				for key in inserted {
					self.compression.remove(&key);
				}
				self.cursor.rewind(mark);
				Err(())
			}
		}
	}

	pub fn append_key(&mut self, section: Section, key: &ResourceKey, unicast_response_bit: bool) -> Result<()> {
		let mark = self.cursor.mark();
		let mut inserted = Vec::new();

		let result = (|| {
			self.append_name_inner(&key.name, &mut inserted)?;
			self.cursor.push_u16(key.rr_type.to_u16())?;
			let class = key.class.to_u16() | if unicast_response_bit { CLASS_TOP_BIT } else { 0 };
			self.cursor.push_u16(class)
		})();

		match result {
			Ok(()) => {
				self.bump(section);
				Ok(())
			}
			Err(()) => {
				for key in inserted {
					self.compression.remove(&key);
				}
				self.cursor.rewind(mark);
				Err(())
			}
		}
	}

	pub fn append_record(&mut self, section: Section, record: &ResourceRecord, cache_flush_bit: bool, max_ttl: u32) -> Result<()> {
		let mark = self.cursor.mark();
		let mut inserted = Vec::new();

		let result = (|| {
			self.append_name_inner(&record.key.name, &mut inserted)?;
			self.cursor.push_u16(record.key.rr_type.to_u16())?;
			let class = record.key.class.to_u16() | if cache_flush_bit { CLASS_TOP_BIT } else { 0 };
			self.cursor.push_u16(class)?;
			let ttl = if max_ttl > 0 { record.ttl.min(max_ttl) } else { record.ttl };
			self.cursor.push_u32(ttl)?;
			let rdlen_at = self.cursor.reserve_u16()?;
			let rdata_start = self.cursor.len();
			self.append_rdata(&record.data, &mut inserted)?;
			let rdlen = self.cursor.len() - rdata_start;
			if rdlen > u16::MAX as usize {
				return Err(());
			}
			self.cursor.backfill_u16(rdlen_at, rdlen as u16);
			Ok(())
		})();

		match result {
			Ok(()) => {
				self.bump(section);
				Ok(())
			}
			Err(()) => {
				for key in inserted {
					self.compression.remove(&key);
				}
				self.cursor.rewind(mark);
				Err(())
			}
		}
	}

	fn append_rdata(&mut self, data: &RecordData, inserted: &mut Vec<Vec<Vec<u8>>>) -> Result<()> {
		match data {
			RecordData::A(addr) => self.cursor.push_bytes(&addr.octets()),
			RecordData::Aaaa(addr) => self.cursor.push_bytes(&addr.octets()),
			RecordData::Ptr(name) | RecordData::Cname(name) => self.append_name_inner(name, inserted),
			RecordData::Srv { priority, weight, port, target } => {
				self.cursor.push_u16(*priority)?;
				self.cursor.push_u16(*weight)?;
				self.cursor.push_u16(*port)?;
				// SRV targets are conventionally written uncompressed in
				// mDNS (RFC 6762 §18.14) but compression doesn't corrupt
				// a conformant reader, so we reuse the same name writer.
				self.append_name_inner(target, inserted)
			}
			RecordData::Txt(strings) => {
				if strings.is_empty() {
					return self.cursor.push_u8(0);
				}
				for s in strings {
					if s.len() > 255 {
						return Err(());
					}
					self.cursor.push_u8(s.len() as u8)?;
					self.cursor.push_bytes(s)?;
				}
				Ok(())
			}
			RecordData::Hinfo { cpu, os } => {
				if cpu.len() > 255 || os.len() > 255 {
					return Err(());
				}
				self.cursor.push_u8(cpu.len() as u8)?;
				self.cursor.push_bytes(cpu)?;
				self.cursor.push_u8(os.len() as u8)?;
				self.cursor.push_bytes(os)
			}
			RecordData::Generic { rdata, .. } => self.cursor.push_bytes(rdata),
		}
	}

	/// Backfill the header counts and return the finished packet bytes.
	pub fn finish(mut self) -> Vec<u8> {
		self.cursor.backfill_u16(4, self.qdcount);
		self.cursor.backfill_u16(6, self.ancount);
		self.cursor.backfill_u16(8, self.nscount);
		self.cursor.backfill_u16(10, self.arcount);
		self.cursor.into_vec()
	}
}

pub struct DnsPacketReader<'a> {
	slice: Slice<'a>,
	id: u16,
	flags: Flags,
	qdcount: u16,
	ancount: u16,
	nscount: u16,
	arcount: u16,
}

impl<'a> DnsPacketReader<'a> {
	pub fn parse(buf: &'a [u8]) -> Result<Self> {
		if buf.len() < HEADER_LEN {
			return Err(());
		}

		let mut slice = Slice::new(buf);
		let id = slice.read_u16()?;
		let flags = Flags::from_u16(slice.read_u16()?);

		if flags.opcode() != 0 || flags.rcode() != 0 {
			return Err(());
		}

		let qdcount = slice.read_u16()?;
		let ancount = slice.read_u16()?;
		let nscount = slice.read_u16()?;
		let arcount = slice.read_u16()?;

		Ok(Self { slice, id, flags, qdcount, ancount, nscount, arcount })
	}

	pub fn id(&self) -> u16 {
		self.id
	}

	pub fn flags(&self) -> Flags {
		self.flags
	}

	pub fn is_query(&self) -> bool {
		!self.flags.qr()
	}

	pub fn count(&self, section: Section) -> u16 {
		match section {
			Section::Question => self.qdcount,
			Section::Answer => self.ancount,
			Section::Authority => self.nscount,
			Section::Additional => self.arcount,
		}
	}

	/// Decode a name starting at the reader's current position, following
	/// compression pointers. Every hop's target must be strictly less than
	/// the previous one, which rules out both forward references and
	/// cycles with a single check and bounds the loop without relying on
	/// [`MAX_POINTER_HOPS`] alone.
	pub fn consume_name(&mut self) -> Result<Name> {
		use crate::name::MAX_LABEL_LEN;

		let mut labels: Vec<Vec<u8>> = Vec::new();
		let mut cursor = self.slice;
		let mut hops = 0;
		let mut jumped = false;
		let mut resume_at = 0usize;
		let mut upper_bound = usize::MAX;
		let mut wire_len = 1usize; // root terminator

		loop {
			let len = cursor.peek_u8()?;

			if len & 0xC0 == 0xC0 {
				hops += 1;
				if hops > MAX_POINTER_HOPS {
					return Err(());
				}

				let hi = cursor.read_u8()? as u16;
				let lo = cursor.read_u8()? as u16;
				let offset = (((hi << 8) | lo) & POINTER_OFFSET_MASK) as usize;

				if offset >= upper_bound {
					// Not a strictly backward reference: reject to block
					// cycles and forward jumps alike.
					return Err(());
				}

				if !jumped {
					resume_at = cursor.pos();
					jumped = true;
				}

				upper_bound = offset;
				cursor = self.slice.at(offset)?;
				continue;
			}

			if len & 0xC0 != 0 {
				return Err(());
			}

			if len == 0 {
				cursor.read_u8()?;
				break;
			}

			let len = len as usize;
			if len > MAX_LABEL_LEN {
				return Err(());
			}

			cursor.read_u8()?;
			let label = cursor.read_bytes(len)?.to_vec();
			wire_len += label.len() + 1;
			if wire_len > MAX_NAME_LEN {
				return Err(());
			}
			labels.push(label);
		}

		if jumped {
			self.slice.set_pos(resume_at)?;
		} else {
			self.slice.set_pos(cursor.pos())?;
		}

		Name::from_labels(labels)
	}

	/// Decode name + type + class, splitting the class's cache-flush /
	/// unicast-response top bit out as a separate flag.
	pub fn consume_key(&mut self) -> Result<(ResourceKey, bool)> {
		let name = self.consume_name()?;
		let rr_type = RrType::from_u16(self.slice.read_u16()?);
		let raw_class = self.slice.read_u16()?;
		let top_bit = raw_class & CLASS_TOP_BIT != 0;
		let class = Class::from_u16(raw_class & !CLASS_TOP_BIT);
		Ok((ResourceKey::new(name, class, rr_type), top_bit))
	}

	/// Decode a full resource record: key, TTL, and rdata parsed according
	/// to the record's type. Unknown types fall back to
	/// [`RecordData::Generic`] so the engine can still cache and forward
	/// them.
	pub fn consume_record(&mut self) -> Result<(ResourceRecord, bool)> {
		let (key, cache_flush) = self.consume_key()?;
		let ttl = self.slice.read_u32()?;
		let rdlength = self.slice.read_u16()? as usize;
		let rdata_start = self.slice.pos();

		let data = self.consume_rdata(key.rr_type, rdlength)?;

		// Whatever the variant-specific parser actually consumed, trust
		// RDLENGTH for where the next record starts: a malformed rdata
		// body should not desynchronize the rest of the packet.
		self.slice.set_pos(rdata_start + rdlength)?;

		let record = ResourceRecord::new(key, ttl, data);
		Ok((record, cache_flush))
	}

	fn consume_rdata(&mut self, rr_type: RrType, rdlength: usize) -> Result<RecordData> {
		let rdata_start = self.slice.pos();

		let data = match rr_type {
			RrType::A => {
				let bytes = self.slice.read_bytes(4)?;
				RecordData::A(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
			}
			RrType::Aaaa => {
				let bytes = self.slice.read_bytes(16)?;
				let mut octets = [0u8; 16];
				octets.copy_from_slice(bytes);
				RecordData::Aaaa(Ipv6Addr::from(octets))
			}
			RrType::Ptr => RecordData::Ptr(self.consume_name()?),
			RrType::Cname => RecordData::Cname(self.consume_name()?),
			RrType::Srv => {
				let priority = self.slice.read_u16()?;
				let weight = self.slice.read_u16()?;
				let port = self.slice.read_u16()?;
				let target = self.consume_name()?;
				RecordData::Srv { priority, weight, port, target }
			}
			RrType::Txt => {
				let end = rdata_start + rdlength;
				let mut strings = Vec::new();
				while self.slice.pos() < end {
					let len = self.slice.read_u8()? as usize;
					strings.push(self.slice.read_bytes(len)?.to_vec());
				}
				RecordData::Txt(strings)
			}
			RrType::Hinfo => {
				let cpu_len = self.slice.read_u8()? as usize;
				let cpu = self.slice.read_bytes(cpu_len)?.to_vec();
				let os_len = self.slice.read_u8()? as usize;
				let os = self.slice.read_bytes(os_len)?.to_vec();
				RecordData::Hinfo { cpu, os }
			}
			RrType::Any => return Err(()),
			RrType::Other(v) => RecordData::Generic { rr_type: v, rdata: self.slice.read_bytes(rdlength)?.to_vec() },
		};

		Ok(data)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn header_round_trips_id_and_flags() {
		let w = DnsPacketWriter::new(512, 0x1234, Flags::response(true));
		let bytes = w.finish();
		let r = DnsPacketReader::parse(&bytes).unwrap();
		assert_eq!(r.id(), 0x1234);
		assert!(!r.is_query());
		assert!(r.flags().authoritative());
	}

	#[test]
	fn rejects_packet_shorter_than_header() {
		assert!(DnsPacketReader::parse(&[0u8; 4]).is_err());
	}

	#[test]
	fn name_round_trips_without_compression() {
		let mut w = DnsPacketWriter::new(512, 0, Flags::query());
		let name = Name::parse("host.local").unwrap();
		w.append_name(&name).unwrap();
		let bytes = w.finish();
		let mut r = DnsPacketReader::parse(&bytes).unwrap();
		assert_eq!(r.consume_name().unwrap(), name);
	}

	#[test]
	fn repeated_suffix_is_compressed_and_decodes_back_identically() {
		let mut w = DnsPacketWriter::new(512, 0, Flags::query());
		let a = Name::parse("one.local").unwrap();
		let b = Name::parse("two.local").unwrap();
		w.append_name(&a).unwrap();
		let mark_before_b = w.len();
		w.append_name(&b).unwrap();
		// "local" was already indexed by the first name, so the second
		// name should be shorter than label+len would otherwise require.
		assert!(w.len() - mark_before_b < b.wire_len());

		let bytes = w.finish();
		let mut r = DnsPacketReader::parse(&bytes).unwrap();
		assert_eq!(r.consume_name().unwrap(), a);
		assert_eq!(r.consume_name().unwrap(), b);
	}

	#[test]
	fn append_key_sets_top_bit_for_unicast_response_request() {
		let mut w = DnsPacketWriter::new(512, 0, Flags::query());
		let key = ResourceKey::new(Name::parse("host.local").unwrap(), Class::In, RrType::A);
		w.append_key(Section::Question, &key, true).unwrap();
		let bytes = w.finish();
		let mut r = DnsPacketReader::parse(&bytes).unwrap();
		let (decoded, unicast_bit) = r.consume_key().unwrap();
		assert_eq!(decoded, key);
		assert!(unicast_bit);
	}

	#[test]
	fn append_record_round_trips_srv_and_sets_cache_flush_bit() {
		let mut w = DnsPacketWriter::new(512, 0, Flags::response(false));
		let key = ResourceKey::new(Name::parse("_ipp._tcp.local").unwrap(), Class::In, RrType::Srv);
		let record = ResourceRecord::new(key, 120, RecordData::Srv { priority: 0, weight: 0, port: 631, target: Name::parse("host.local").unwrap() });
		w.append_record(Section::Answer, &record, true, 0).unwrap();
		let bytes = w.finish();

		let mut r = DnsPacketReader::parse(&bytes).unwrap();
		assert_eq!(r.count(Section::Answer), 1);
		let (decoded, flush) = r.consume_record().unwrap();
		assert!(flush);
		assert_eq!(decoded.ttl, 120);
		assert_eq!(decoded.data, record.data);
	}

	#[test]
	fn append_record_clamps_ttl_to_max_ttl_when_positive() {
		let mut w = DnsPacketWriter::new(512, 0, Flags::response(false));
		let key = ResourceKey::new(Name::parse("host.local").unwrap(), Class::In, RrType::A);
		let record = ResourceRecord::new(key, 4500, RecordData::A(Ipv4Addr::new(10, 0, 0, 1)));
		w.append_record(Section::Answer, &record, false, 10).unwrap();
		let bytes = w.finish();
		let mut r = DnsPacketReader::parse(&bytes).unwrap();
		let (decoded, _) = r.consume_record().unwrap();
		assert_eq!(decoded.ttl, 10);
	}

	#[test]
	fn overflow_append_leaves_packet_valid_and_counts_unchanged() {
		let mut w = DnsPacketWriter::new(HEADER_LEN + 4, 0, Flags::query());
		let key = ResourceKey::new(Name::parse("very.long.host.local").unwrap(), Class::In, RrType::A);
		assert!(w.append_key(Section::Question, &key, false).is_err());
		assert_eq!(w.count(Section::Question), 0);
		assert_eq!(w.len(), HEADER_LEN);
	}

	#[test]
	fn unknown_rr_type_decodes_as_generic() {
		let mut w = DnsPacketWriter::new(512, 0, Flags::response(false));
		let key = ResourceKey::new(Name::parse("host.local").unwrap(), Class::In, RrType::Other(999));
		let record = ResourceRecord::new(key, 60, RecordData::Generic { rr_type: 999, rdata: vec![1, 2, 3] });
		w.append_record(Section::Answer, &record, false, 0).unwrap();
		let bytes = w.finish();
		let mut r = DnsPacketReader::parse(&bytes).unwrap();
		let (decoded, _) = r.consume_record().unwrap();
		assert_eq!(decoded.data, RecordData::Generic { rr_type: 999, rdata: vec![1, 2, 3] });
	}

	#[test]
	fn rejects_compression_pointer_that_does_not_point_backward() {
		// Hand-built packet: header, then at offset 12 a pointer to offset
		// 12 itself (a self-cycle), used as the sole question name.
		let mut bytes = vec![0u8; HEADER_LEN];
		bytes.extend_from_slice(&[0xC0, 0x0C]);
		bytes[4..6].copy_from_slice(&1u16.to_be_bytes());
		let mut r = DnsPacketReader::parse(&bytes).unwrap();
		assert!(r.consume_name().is_err());
	}
}
