/// A growable write cursor bounded by a fixed maximum size.
///
/// Every push either succeeds or leaves the cursor exactly as it was
/// (callers that need "try to append, undo on failure" semantics — as the
/// mDNS packet writer does for truncation handling — use [`Cursor::mark`]
/// and [`Cursor::rewind`] around a group of pushes).
pub struct Cursor {
	buf: Vec<u8>,
	max: usize,
}

impl Cursor {
	pub fn with_capacity(max: usize) -> Self {
		Self { buf: Vec::with_capacity(max.min(4096)), max }
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.buf.len()
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.buf.is_empty()
	}

	#[inline]
	pub fn max(&self) -> usize {
		self.max
	}

	#[inline]
	pub fn remaining(&self) -> usize {
		self.max.saturating_sub(self.buf.len())
	}

	/// Grow the maximum size. Used when a record doesn't fit an MTU-sized
	/// packet and the caller decides to retry with a bigger buffer.
	pub fn set_max(&mut self, max: usize) {
		self.max = max;
	}

	/// Snapshot the current length, to later [`rewind`](Self::rewind) to.
	#[inline]
	pub fn mark(&self) -> usize {
		self.buf.len()
	}

	/// Truncate back to a previously taken [`mark`](Self::mark).
	#[inline]
	pub fn rewind(&mut self, mark: usize) {
		self.buf.truncate(mark);
	}

	pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<(), ()> {
		if bytes.len() > self.remaining() {
			return Err(());
		}

		self.buf.extend_from_slice(bytes);
		Ok(())
	}

	pub fn push_u8(&mut self, v: u8) -> Result<(), ()> {
		self.push_bytes(&[v])
	}

	pub fn push_u16(&mut self, v: u16) -> Result<(), ()> {
		self.push_bytes(&v.to_be_bytes())
	}

	pub fn push_u32(&mut self, v: u32) -> Result<(), ()> {
		self.push_bytes(&v.to_be_bytes())
	}

	/// Reserve two bytes for a length field that will be known only after
	/// writing the content that follows (e.g. RDLENGTH). Returns the offset
	/// to pass to [`backfill_u16`](Self::backfill_u16).
	pub fn reserve_u16(&mut self) -> Result<usize, ()> {
		let at = self.buf.len();
		self.push_u16(0)?;
		Ok(at)
	}

	pub fn backfill_u16(&mut self, at: usize, v: u16) {
		self.buf[at..at + 2].copy_from_slice(&v.to_be_bytes());
	}

	pub fn as_slice(&self) -> &[u8] {
		&self.buf
	}

	pub fn into_vec(self) -> Vec<u8> {
		self.buf
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn push_rejects_overflow_and_leaves_cursor_untouched() {
		let mut c = Cursor::with_capacity(4);
		assert_eq!(c.push_bytes(&[1, 2, 3]), Ok(()));
		let mark = c.mark();
		assert_eq!(c.push_bytes(&[4, 5]), Err(()));
		assert_eq!(c.len(), mark);
		assert_eq!(c.as_slice(), &[1, 2, 3]);
	}

	#[test]
	fn backfill_patches_reserved_length() {
		let mut c = Cursor::with_capacity(16);
		let at = c.reserve_u16().unwrap();
		c.push_bytes(b"hello").unwrap();
		c.backfill_u16(at, 5);
		assert_eq!(&c.as_slice()[at..at + 2], &5u16.to_be_bytes());
	}

	#[test]
	fn mark_and_rewind_undoes_partial_writes() {
		let mut c = Cursor::with_capacity(8);
		c.push_u16(1).unwrap();
		let mark = c.mark();
		c.push_u16(2).unwrap();
		c.rewind(mark);
		assert_eq!(c.len(), 2);
	}
}
