//! A min-heap of scheduled callbacks keyed by expiry, underlying every
//! timed mechanism in the engine (cache staged expiry, the scheduler's
//! deferred jobs, probing/announcing).
//!
//! `std::collections::BinaryHeap` has no decrease-key operation, so
//! rescheduling an event doesn't mutate its heap entry in place; instead
//! each reschedule bumps a per-slot sequence number and pushes a fresh
//! heap entry. Popped entries whose sequence number doesn't match the
//! slot's current one are stale leftovers from an earlier schedule and
//! are silently discarded — the same lazy-deletion trick any
//! indexed-priority-queue-over-a-binary-heap uses.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use collections::arena::{Arena, Index};

struct Slot<T> {
	expiry: Instant,
	last_run: Option<Instant>,
	seq: u64,
	scheduled: bool,
	data: T,
}

pub type Handle<T> = Index<Slot<T>>;

struct HeapKey<T> {
	expiry: Instant,
	seq: u64,
	handle: Handle<T>,
}

impl<T> PartialEq for HeapKey<T> {
	fn eq(&self, other: &Self) -> bool {
		self.expiry == other.expiry && self.seq == other.seq
	}
}

impl<T> Eq for HeapKey<T> {}

impl<T> PartialOrd for HeapKey<T> {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl<T> Ord for HeapKey<T> {
	fn cmp(&self, other: &Self) -> Ordering {
		// Reversed: `BinaryHeap` is a max-heap, but we want the earliest
		// expiry (then the lowest seq, i.e. the oldest schedule) on top.
		other.expiry.cmp(&self.expiry).then_with(|| other.seq.cmp(&self.seq))
	}
}

pub struct TimeEventQueue<T> {
	slots: Arena<Slot<T>>,
	heap: BinaryHeap<HeapKey<T>>,
	next_seq: u64,
}

impl<T> Default for TimeEventQueue<T> {
	fn default() -> Self {
		Self { slots: Arena::new(), heap: BinaryHeap::new(), next_seq: 0 }
	}
}

impl<T> TimeEventQueue<T> {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&mut self, expiry: Instant, data: T) -> Handle<T> {
		let seq = self.next_seq;
		self.next_seq += 1;
		let handle = self.slots.insert(Slot { expiry, last_run: None, seq, scheduled: true, data });
		self.heap.push(HeapKey { expiry, seq, handle });
		handle
	}

	pub fn get(&self, handle: Handle<T>) -> Option<&T> {
		self.slots.get(handle).map(|s| &s.data)
	}

	pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
		self.slots.get_mut(handle).map(|s| &mut s.data)
	}

	pub fn expiry(&self, handle: Handle<T>) -> Option<Instant> {
		self.slots.get(handle).map(|s| s.expiry)
	}

	pub fn last_run(&self, handle: Handle<T>) -> Option<Instant> {
		self.slots.get(handle).and_then(|s| s.last_run)
	}

	/// Move `handle`'s expiry forward (or backward) in time, bumping its
	/// sequence number so the old heap entry becomes stale. A no-op on an
	/// already-removed handle.
	pub fn reschedule(&mut self, handle: Handle<T>, expiry: Instant) {
		let Some(slot) = self.slots.get_mut(handle) else { return };
		slot.expiry = expiry;
		slot.seq = self.next_seq;
		slot.scheduled = true;
		self.next_seq += 1;
		self.heap.push(HeapKey { expiry, seq: slot.seq, handle });
	}

	/// Drop the event and free its slot. Safe to call on a handle already
	/// popped by [`pop_ready`](Self::pop_ready) and not rescheduled.
	pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
		self.slots.remove(handle).map(|s| s.data)
	}

	pub fn is_empty(&self) -> bool {
		self.slots.is_empty()
	}

	/// Handles of every slot (scheduled or kept as history) whose data
	/// matches `pred`, in arbitrary order. Used by job-list lookups that
	/// need to scan for a duplicate or a suppressible entry rather than
	/// strictly in expiry order.
	pub fn slots_matching(&self, pred: impl Fn(&T) -> bool) -> Vec<Handle<T>> {
		self.slots.iter().filter(|(_, slot)| pred(&slot.data)).map(|(idx, _)| idx).collect()
	}

	/// Pop the earliest event whose expiry is `<= now`, marking its
	/// `last_run` and leaving it un-scheduled in the heap (the caller,
	/// having handled it, is expected to call [`reschedule`](Self::reschedule)
	/// or [`remove`](Self::remove)). Returns `None` once nothing is due.
	pub fn pop_ready(&mut self, now: Instant) -> Option<Handle<T>> {
		loop {
			let top = self.heap.peek()?;
			if top.expiry > now {
				return None;
			}

			let key = self.heap.pop().expect("just peeked Some");
			let Some(slot) = self.slots.get_mut(key.handle) else { continue };

			// Stale: this slot has since been rescheduled or already
			// popped at this (expiry, seq); ignore the leftover entry.
			if slot.seq != key.seq || !slot.scheduled {
				continue;
			}

			slot.last_run = Some(now);
			slot.scheduled = false;
			return Some(key.handle);
		}
	}

	/// The earliest live expiry, for the embedder's `set_wakeup` seam.
	pub fn next_wakeup(&mut self) -> Option<Instant> {
		loop {
			let top = self.heap.peek()?;
			match self.slots.get(top.handle) {
				Some(slot) if slot.seq == top.seq && slot.scheduled => return Some(top.expiry),
				_ => {
					self.heap.pop();
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[test]
	fn pop_ready_returns_events_in_expiry_order() {
		let base = Instant::now();
		let mut q: TimeEventQueue<&str> = TimeEventQueue::new();
		let late = q.insert(base + Duration::from_secs(10), "late");
		let early = q.insert(base + Duration::from_secs(1), "early");

		let first = q.pop_ready(base + Duration::from_secs(20)).unwrap();
		assert_eq!(first, early);
		let second = q.pop_ready(base + Duration::from_secs(20)).unwrap();
		assert_eq!(second, late);
	}

	#[test]
	fn not_yet_due_events_are_not_returned() {
		let base = Instant::now();
		let mut q: TimeEventQueue<u32> = TimeEventQueue::new();
		q.insert(base + Duration::from_secs(5), 1);
		assert!(q.pop_ready(base).is_none());
		assert!(q.pop_ready(base + Duration::from_secs(5)).is_some());
	}

	#[test]
	fn rescheduling_from_within_dispatch_does_not_lose_the_event() {
		let base = Instant::now();
		let mut q: TimeEventQueue<u32> = TimeEventQueue::new();
		let h = q.insert(base, 1);

		let popped = q.pop_ready(base).unwrap();
		assert_eq!(popped, h);
		// Simulate the callback deciding to run again later.
		q.reschedule(h, base + Duration::from_secs(1));

		assert!(q.pop_ready(base).is_none());
		assert_eq!(q.pop_ready(base + Duration::from_secs(1)), Some(h));
	}

	#[test]
	fn removed_handle_never_fires_again() {
		let base = Instant::now();
		let mut q: TimeEventQueue<u32> = TimeEventQueue::new();
		let h = q.insert(base, 7);
		assert_eq!(q.pop_ready(base), Some(h));
		q.remove(h);
		assert!(q.pop_ready(base + Duration::from_secs(100)).is_none());
	}

	#[test]
	fn next_wakeup_skips_stale_rescheduled_entries() {
		let base = Instant::now();
		let mut q: TimeEventQueue<u32> = TimeEventQueue::new();
		let h = q.insert(base + Duration::from_secs(1), 1);
		q.reschedule(h, base + Duration::from_secs(5));
		assert_eq!(q.next_wakeup(), Some(base + Duration::from_secs(5)));
	}
}
