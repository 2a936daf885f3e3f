use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use stakker::Stakker;
use utils::error::Result;

static EXIT: AtomicBool = AtomicBool::new(false);

pub fn init() -> Stakker {
	// Get both a monotonic and an absolute representation of the time.
	let now = Instant::now();
	let now_sys = SystemTime::now();
	// Initialise Stakker with the monotonic time.
	let mut s = Stakker::new(now);
	// Set the Stakker systime to the start time.
	s.set_systime(Some(now_sys));
	s
}

/// Drive the actor scheduler until shutdown or Ctrl+C.
///
/// Real mDNS deployments wake this loop from socket readiness as well as
/// timers (see the `PollApi` seam `mdns` exposes for that); this runtime
/// has no socket polling of its own — it only ever sleeps until the next
/// scheduled timer — so embedders that need socket-driven wakeups provide
/// their own `watch_new`/`set_wakeup` adapter around the engine instead of
/// going through this loop directly.
pub fn exec(stakker: &mut Stakker, exit_fn: impl FnOnce()) -> Result {
	ctrlc::set_handler(|| EXIT.store(true, Ordering::Relaxed)).map_err(|err| log::error!("Error occurred while setting Ctrl+C handler: {err}"))?;

	let mut t = Instant::now();
	let mut idle_pending = stakker.run(t, false);

	while stakker.not_shutdown() {
		if EXIT.load(Ordering::Relaxed) {
			// Call the exit function, which should defer the cleanup of remaining objects.
			exit_fn();
			// Execute the deferral queue to cleanup the application state.
			stakker.run(t, false);
			break;
		}

		let timeout = if idle_pending {
			Some(Duration::ZERO)
		} else {
			stakker.next_wait(t)
		};

		let Some(timeout) = timeout else {
			// No pending idle work and no timer scheduled: nothing left to do.
			break;
		};

		log::trace!("idle_pending: {}, timeout: {:?}", idle_pending, timeout);

		if !timeout.is_zero() {
			thread::sleep(timeout);
		}

		t = Instant::now();
		idle_pending = stakker.run(t, false);
	}

	Ok(())
}
