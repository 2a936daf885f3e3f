//! The error taxonomy surfaced across the engine's API boundary. Internal
//! helpers that cannot fail in a caller-visible way keep using
//! `utils::error::Result<T, E = ()>` paired with a `log::warn!`/`error!`
//! call at the failure site; `Error` is reserved for `Server`/`EntryGroup`
//! entry points.

use core::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
	NoMemory,
	InvalidHostName,
	InvalidDomainName,
	InvalidTtl,
	IsPattern,
	InvalidRecord,
	InvalidInterface,
	InvalidProtocol,
	InvalidFlags,
	InvalidServiceName,
	InvalidServiceType,
	InvalidServiceSubtype,
	InvalidPort,
	InvalidKey,
	LocalCollision,
	BadState,
	NotFound,
	Timeout,
	NoNetwork,
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::NoMemory => "no memory",
			Self::InvalidHostName => "invalid host name",
			Self::InvalidDomainName => "invalid domain name",
			Self::InvalidTtl => "invalid ttl",
			Self::IsPattern => "key is a pattern",
			Self::InvalidRecord => "invalid record",
			Self::InvalidInterface => "invalid interface",
			Self::InvalidProtocol => "invalid protocol",
			Self::InvalidFlags => "invalid flags",
			Self::InvalidServiceName => "invalid service name",
			Self::InvalidServiceType => "invalid service type",
			Self::InvalidServiceSubtype => "invalid service subtype",
			Self::InvalidPort => "invalid port",
			Self::InvalidKey => "invalid key",
			Self::LocalCollision => "local collision",
			Self::BadState => "bad state",
			Self::NotFound => "not found",
			Self::Timeout => "timeout",
			Self::NoNetwork => "no network",
		};
		f.write_str(s)
	}
}

pub type Result<T> = core::result::Result<T, Error>;
