//! Browse/resolve observers (`avahi-core/browse.c`,
//! `browse-service-type.c`, `resolve-host-name.c`, `resolve.c`). The engine
//! is poll-driven rather than callback-fired: each observer below is
//! diffed against the cache on every call to its `poll` method, and the
//! driving interface loop is expected to call it once per tick and forward
//! whatever events come back to the embedder.

use std::time::{Duration, Instant};

use wire::{Class, Name, ResourceKey, ResourceRecord, RrType};

use crate::cache::Cache;
use crate::dns_sd::{reverse_address_name, service_type_enumerator_name};

#[derive(Clone, Debug)]
pub enum BrowserEvent {
	New(ResourceRecord),
	Remove(ResourceRecord),
	/// The cache had nothing more to report at subscription time
	/// (`AVAHI_BROWSER_CACHE_EXHAUSTED`).
	CacheExhausted,
	/// All known responders have answered at least once
	/// (`AVAHI_BROWSER_ALL_FOR_NOW`).
	AllForNow,
	Failure,
}

#[derive(Clone, Debug)]
pub enum ResolverEvent<T> {
	Found(T),
	NotFound,
	Failure,
	Timeout,
}

/// A standing watch over every cached record matching one key
/// (`avahi_s_record_browser`): diffing the cache's current chain against
/// what was reported last time yields New/Remove events, with no
/// protocol-level state of its own — the cache's staged expiry already
/// drives removal.
pub struct RecordBrowser {
	key: ResourceKey,
	seen: Vec<ResourceRecord>,
	exhausted_once: bool,
}

impl RecordBrowser {
	pub fn new(key: ResourceKey) -> Self {
		Self { key, seen: Vec::new(), exhausted_once: false }
	}

	/// `avahi_s_record_browser_cb`'s steady-state diffing half.
	pub fn poll(&mut self, cache: &Cache) -> Vec<BrowserEvent> {
		let mut current = Vec::new();
		cache.walk(&self.key, |entry| current.push(entry.record.clone()));

		let mut events = Vec::new();
		for record in &current {
			if !self.seen.iter().any(|r| r.equal_no_ttl(record)) {
				events.push(BrowserEvent::New(record.clone()));
			}
		}
		for record in &self.seen {
			if !current.iter().any(|r| r.equal_no_ttl(record)) {
				events.push(BrowserEvent::Remove(record.clone()));
			}
		}

		self.seen = current;
		if !self.exhausted_once {
			self.exhausted_once = true;
			events.push(BrowserEvent::CacheExhausted);
		}
		events
	}
}

/// Watches `_services._dns-sd._udp.<domain>` for PTR records, each
/// naming one advertised service type (`avahi-core/browse-service-type.c`).
pub struct ServiceTypeBrowser {
	browser: RecordBrowser,
	domain: String,
}

#[derive(Clone, Debug)]
pub struct ServiceType {
	pub service_type: String,
	pub domain: String,
}

impl ServiceTypeBrowser {
	pub fn new(domain: &str) -> Option<Self> {
		let name = service_type_enumerator_name(domain).ok()?;
		let key = ResourceKey::new(name, Class::In, RrType::Ptr);
		Some(Self { browser: RecordBrowser::new(key), domain: domain.to_string() })
	}

	pub fn poll(&mut self, cache: &Cache) -> Vec<ResolverEvent<ServiceType>> {
		self.browser
			.poll(cache)
			.into_iter()
			.filter_map(|event| match event {
				BrowserEvent::New(record) => match record.data {
					wire::RecordData::Ptr(target) => {
						let labels = target.labels();
						// "<_type>.<_proto>.<domain...>" — the first two
						// labels are the service type, the rest the domain.
						if labels.len() < 2 {
							return None;
						}
						let service_type = format!("{}.{}", Name::from_labels(vec![labels[0].clone()]).ok()?, Name::from_labels(vec![labels[1].clone()]).ok()?);
						Some(ResolverEvent::Found(ServiceType { service_type, domain: self.domain.clone() }))
					}
					_ => None,
				},
				BrowserEvent::Failure => Some(ResolverEvent::Failure),
				_ => None,
			})
			.collect()
	}
}

#[derive(Clone, Debug)]
pub struct HostNameResolution {
	pub host_name: Name,
	pub address: std::net::IpAddr,
}

/// A one-shot lookup for a host name's A/AAAA record, timing out after
/// `timeout` with no answer (`avahi-core/resolve-host-name.c`).
pub struct HostNameResolver {
	host_name: Name,
	rr_type: RrType,
	started: Instant,
	timeout: Duration,
	done: bool,
}

impl HostNameResolver {
	pub fn new(host_name: Name, use_ipv6: bool, now: Instant, timeout: Duration) -> Self {
		Self { host_name, rr_type: if use_ipv6 { RrType::Aaaa } else { RrType::A }, started: now, timeout, done: false }
	}

	pub fn poll(&mut self, cache: &Cache, now: Instant) -> Option<ResolverEvent<HostNameResolution>> {
		if self.done {
			return None;
		}

		let key = ResourceKey::new(self.host_name.clone(), Class::In, self.rr_type);
		let mut found = None;
		cache.walk(&key, |entry| {
			if found.is_none() {
				found = match &entry.record.data {
					wire::RecordData::A(addr) => Some(std::net::IpAddr::V4(*addr)),
					wire::RecordData::Aaaa(addr) => Some(std::net::IpAddr::V6(*addr)),
					_ => None,
				};
			}
		});

		if let Some(address) = found {
			self.done = true;
			return Some(ResolverEvent::Found(HostNameResolution { host_name: self.host_name.clone(), address }));
		}

		if now.saturating_duration_since(self.started) >= self.timeout {
			self.done = true;
			return Some(ResolverEvent::Timeout);
		}

		None
	}
}

#[derive(Clone, Debug)]
pub struct AddressResolution {
	pub address: std::net::IpAddr,
	pub host_name: Name,
}

/// The inverse of [`HostNameResolver`]: resolves an address to a host name
/// via its reverse PTR (`avahi-core/resolve.c`).
pub struct AddressResolver {
	address: std::net::IpAddr,
	reverse_name: Name,
	started: Instant,
	timeout: Duration,
	done: bool,
}

impl AddressResolver {
	pub fn new(address: std::net::IpAddr, now: Instant, timeout: Duration) -> Self {
		Self { address, reverse_name: reverse_address_name(address), started: now, timeout, done: false }
	}

	pub fn poll(&mut self, cache: &Cache, now: Instant) -> Option<ResolverEvent<AddressResolution>> {
		if self.done {
			return None;
		}

		let key = ResourceKey::new(self.reverse_name.clone(), Class::In, RrType::Ptr);
		let mut found = None;
		cache.walk(&key, |entry| {
			if found.is_none() {
				if let wire::RecordData::Ptr(target) = &entry.record.data {
					found = Some(target.clone());
				}
			}
		});

		if let Some(host_name) = found {
			self.done = true;
			return Some(ResolverEvent::Found(AddressResolution { address: self.address, host_name }));
		}

		if now.saturating_duration_since(self.started) >= self.timeout {
			self.done = true;
			return Some(ResolverEvent::Timeout);
		}

		None
	}
}

#[derive(Clone, Debug)]
pub struct ServiceResolution {
	pub instance: String,
	pub service_type: String,
	pub domain: String,
	pub host_name: Name,
	pub address: std::net::IpAddr,
	pub port: u16,
	pub txt: Vec<Vec<u8>>,
}

/// Resolves one service instance to its SRV target, TXT record, and
/// address in sequence (`avahi-core/resolve.c`'s `AvahiServiceResolver`):
/// SRV/TXT come straight from the cache once present, the address lookup
/// is then delegated to a nested [`HostNameResolver`].
pub struct ServiceResolver {
	instance: String,
	service_type: String,
	domain: String,
	srv_key: ResourceKey,
	txt_key: ResourceKey,
	use_ipv6: bool,
	timeout: Duration,
	host_resolver: Option<HostNameResolver>,
	done: bool,
}

impl ServiceResolver {
	pub fn new(instance_name: Name, instance: &str, service_type: &str, domain: &str, use_ipv6: bool, timeout: Duration) -> Self {
		let srv_key = ResourceKey::new(instance_name.clone(), Class::In, RrType::Srv);
		let txt_key = ResourceKey::new(instance_name, Class::In, RrType::Txt);
		Self { instance: instance.to_string(), service_type: service_type.to_string(), domain: domain.to_string(), srv_key, txt_key, use_ipv6, timeout, host_resolver: None, done: false }
	}

	pub fn poll(&mut self, cache: &Cache, now: Instant) -> Option<ResolverEvent<ServiceResolution>> {
		if self.done {
			return None;
		}

		if let Some(resolver) = &mut self.host_resolver {
			return match resolver.poll(cache, now) {
				Some(ResolverEvent::Found(host_resolution)) => {
					self.done = true;

					let mut port = 0;
					cache.walk(&self.srv_key, |entry| {
						if let wire::RecordData::Srv { port: p, .. } = &entry.record.data {
							port = *p;
						}
					});
					let mut txt = Vec::new();
					cache.walk(&self.txt_key, |entry| {
						if let wire::RecordData::Txt(strings) = &entry.record.data {
							txt = strings.clone();
						}
					});

					Some(ResolverEvent::Found(ServiceResolution {
						instance: self.instance.clone(),
						service_type: self.service_type.clone(),
						domain: self.domain.clone(),
						host_name: host_resolution.host_name,
						address: host_resolution.address,
						port,
						txt,
					}))
				}
				Some(other) => {
					self.done = true;
					Some(other)
				}
				None => None,
			};
		}

		let mut target = None;
		cache.walk(&self.srv_key, |entry| {
			if let wire::RecordData::Srv { target: t, .. } = &entry.record.data {
				target = Some(t.clone());
			}
		});

		if let Some(target) = target {
			self.host_resolver = Some(HostNameResolver::new(target, self.use_ipv6, now, self.timeout));
			return None;
		}

		None
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::Ipv4Addr;
	use wire::RecordData;

	fn origin() -> std::net::IpAddr {
		std::net::IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))
	}

	#[test]
	fn record_browser_reports_new_then_nothing_on_unchanged_poll() {
		let mut cache = Cache::new();
		let now = Instant::now();
		let key = ResourceKey::new(Name::parse("_ipp._tcp.local").unwrap(), Class::In, RrType::Ptr);
		let record = ResourceRecord::new(key.clone(), 4500, RecordData::Ptr(Name::parse("Printer._ipp._tcp.local").unwrap()));
		cache.cache_update(record, false, origin(), now);

		let mut browser = RecordBrowser::new(key);
		let first = browser.poll(&cache);
		assert!(first.iter().any(|e| matches!(e, BrowserEvent::New(_))));
		assert!(first.iter().any(|e| matches!(e, BrowserEvent::CacheExhausted)));

		let second = browser.poll(&cache);
		assert!(second.is_empty());
	}

	#[test]
	fn host_name_resolver_times_out_with_no_answer() {
		let cache = Cache::new();
		let now = Instant::now();
		let mut resolver = HostNameResolver::new(Name::parse("printer.local").unwrap(), false, now, Duration::from_secs(5));
		assert!(resolver.poll(&cache, now + Duration::from_secs(1)).is_none());
		let event = resolver.poll(&cache, now + Duration::from_secs(6)).unwrap();
		assert!(matches!(event, ResolverEvent::Timeout));
	}

	#[test]
	fn host_name_resolver_finds_cached_address() {
		let mut cache = Cache::new();
		let now = Instant::now();
		let key = ResourceKey::new(Name::parse("printer.local").unwrap(), Class::In, RrType::A);
		let record = ResourceRecord::new(key, 120, RecordData::A(Ipv4Addr::new(10, 0, 0, 5)));
		cache.cache_update(record, false, origin(), now);

		let mut resolver = HostNameResolver::new(Name::parse("printer.local").unwrap(), false, now, Duration::from_secs(5));
		let event = resolver.poll(&cache, now).unwrap();
		match event {
			ResolverEvent::Found(resolution) => assert_eq!(resolution.address, std::net::IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))),
			_ => panic!("expected Found"),
		}
	}

	#[test]
	fn address_resolver_finds_reverse_ptr() {
		let mut cache = Cache::new();
		let now = Instant::now();
		let addr = std::net::IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5));
		let key = ResourceKey::new(reverse_address_name(addr), Class::In, RrType::Ptr);
		let record = ResourceRecord::new(key, 120, RecordData::Ptr(Name::parse("printer.local").unwrap()));
		cache.cache_update(record, false, origin(), now);

		let mut resolver = AddressResolver::new(addr, now, Duration::from_secs(5));
		let event = resolver.poll(&cache, now).unwrap();
		match event {
			ResolverEvent::Found(resolution) => assert_eq!(resolution.host_name, Name::parse("printer.local").unwrap()),
			_ => panic!("expected Found"),
		}
	}

	#[test]
	fn service_resolver_chains_srv_txt_and_address_lookup() {
		let mut cache = Cache::new();
		let now = Instant::now();
		let instance_name = Name::parse("Printer._ipp._tcp.local").unwrap();

		let srv_key = ResourceKey::new(instance_name.clone(), Class::In, RrType::Srv);
		let srv = ResourceRecord::new(srv_key, 120, RecordData::Srv { priority: 0, weight: 0, port: 631, target: Name::parse("printer-host.local").unwrap() });
		cache.cache_update(srv, true, origin(), now);

		let txt_key = ResourceKey::new(instance_name.clone(), Class::In, RrType::Txt);
		let txt = ResourceRecord::new(txt_key, 4500, RecordData::Txt(vec![b"txtvers=1".to_vec()]));
		cache.cache_update(txt, true, origin(), now);

		let addr_key = ResourceKey::new(Name::parse("printer-host.local").unwrap(), Class::In, RrType::A);
		let addr_record = ResourceRecord::new(addr_key, 120, RecordData::A(Ipv4Addr::new(10, 0, 0, 9)));
		cache.cache_update(addr_record, true, origin(), now);

		let mut resolver = ServiceResolver::new(instance_name, "Printer", "_ipp._tcp", "local", false, Duration::from_secs(5));
		assert!(resolver.poll(&cache, now).is_none(), "first poll only discovers the SRV target");

		let event = resolver.poll(&cache, now).unwrap();
		match event {
			ResolverEvent::Found(resolution) => {
				assert_eq!(resolution.port, 631);
				assert_eq!(resolution.address, std::net::IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)));
				assert_eq!(resolution.txt, vec![b"txtvers=1".to_vec()]);
			}
			_ => panic!("expected Found"),
		}
	}
}
