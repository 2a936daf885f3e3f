//! Domain names as a sequence of raw label octets.
//!
//! Labels are kept as raw bytes rather than escaped text: escaping only
//! matters at the human-facing edges (parsing user input, formatting for
//! logs), and going through an escaped `String` internally is exactly the
//! kind of lossy round-trip that makes label bytes containing `.` or `\`
//! ambiguous. `avahi_normalize_name` (`avahi-core/util.c`) folds case and
//! rejects empty labels; we do the same in [`Name::normalize`].

use core::fmt;

use utils::error::Result;

/// The on-the-wire limit for a fully decoded domain name (RFC 1035 §3.1):
/// label length octets plus label bytes plus the terminating root label.
pub const MAX_NAME_LEN: usize = 255;
pub const MAX_LABEL_LEN: usize = 63;

#[derive(Clone, Eq)]
pub struct Name {
	labels: Vec<Vec<u8>>,
}

impl Name {
	pub fn root() -> Self {
		Self { labels: Vec::new() }
	}

	pub fn from_labels(labels: Vec<Vec<u8>>) -> Result<Self> {
		let name = Self { labels };
		name.validate()?;
		Ok(name)
	}

	/// Parse dot-separated text, unescaping `\.` and `\\`. This is the
	/// human-facing constructor: service instance names and CLI-supplied
	/// host names come in through here.
	pub fn parse(text: &str) -> Result<Self> {
		let bytes = text.as_bytes();
		let mut labels = Vec::new();
		let mut cur = Vec::new();
		let mut i = 0;

		while i < bytes.len() {
			match bytes[i] {
				b'\\' => {
					let next = *bytes.get(i + 1).ok_or(())?;
					cur.push(next);
					i += 2;
				}
				b'.' => {
					labels.push(core::mem::take(&mut cur));
					i += 1;
				}
				b => {
					cur.push(b);
					i += 1;
				}
			}
		}

		if !cur.is_empty() || labels.is_empty() {
			labels.push(cur);
		}

		Self::from_labels(labels)
	}

	pub fn labels(&self) -> &[Vec<u8>] {
		&self.labels
	}

	pub fn is_root(&self) -> bool {
		self.labels.is_empty()
	}

	/// Labels lowercased per `avahi_normalize_name`, used as the comparison
	/// and hash key everywhere a name participates in a `ResourceKey`.
	pub fn normalized_labels(&self) -> Vec<Vec<u8>> {
		self.labels.iter().map(|l| l.to_ascii_lowercase()).collect()
	}

	/// Append `suffix`'s labels after this name's labels (e.g. joining an
	/// instance label onto `_service._proto.local`).
	pub fn join(&self, suffix: &Name) -> Result<Self> {
		let mut labels = self.labels.clone();
		labels.extend(suffix.labels.iter().cloned());
		Self::from_labels(labels)
	}

	pub fn prepend_label(&self, label: &[u8]) -> Result<Self> {
		let mut labels = Vec::with_capacity(self.labels.len() + 1);
		labels.push(label.to_vec());
		labels.extend(self.labels.iter().cloned());
		Self::from_labels(labels)
	}

	/// Wire-encoded length: one length octet plus payload per label, plus
	/// the terminating root octet. Used to enforce [`MAX_NAME_LEN`].
	pub fn wire_len(&self) -> usize {
		self.labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1
	}

	fn validate(&self) -> Result<()> {
		if self.wire_len() > MAX_NAME_LEN {
			return Err(());
		}

		for label in &self.labels {
			if label.is_empty() || label.len() > MAX_LABEL_LEN {
				return Err(());
			}
		}

		Ok(())
	}
}

impl PartialEq for Name {
	fn eq(&self, other: &Self) -> bool {
		self.normalized_labels() == other.normalized_labels()
	}
}

impl core::hash::Hash for Name {
	fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
		self.normalized_labels().hash(state);
	}
}

impl fmt::Display for Name {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.labels.is_empty() {
			return write!(f, ".");
		}

		for (i, label) in self.labels.iter().enumerate() {
			if i > 0 {
				write!(f, ".")?;
			}

			for &b in label {
				if b == b'.' || b == b'\\' {
					write!(f, "\\{}", b as char)?;
				} else {
					write!(f, "{}", b as char)?;
				}
			}
		}

		Ok(())
	}
}

impl fmt::Debug for Name {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Name({})", self)
	}
}
