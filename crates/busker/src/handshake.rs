//! Client-release handshake.
//!
//! Lets a non-realtime thread prove that the realtime callback has observed
//! a state change (typically: the shared port slot going empty) before the
//! underlying resource is destroyed. The callback's share of the work is a
//! single relaxed load per cycle; the kernel is only involved in the rare
//! cycle where a release is actually pending.
//!
//! Protocol:
//! 1. the closing thread performs its mutation (store-release),
//! 2. calls [`ReleaseHandshake::prepare_release`] and blocks,
//! 3. the callback calls [`ReleaseHandshake::acknowledge_release`] at the
//!    end of every cycle; when a release is pending it acknowledges it,
//! 4. `prepare_release` returns and the resource can be destroyed.
//!
//! At most one thread may be mid-handshake at a time; backends guarantee
//! this by running teardown under `&mut self`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct ReleaseHandshake {
    requested: AtomicBool,
    acked: Mutex<bool>,
    signal: Condvar,
}

impl ReleaseHandshake {
    pub fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            acked: Mutex::new(false),
            signal: Condvar::new(),
        }
    }

    /// Announce a pending release and wait for the callback to acknowledge.
    ///
    /// Returns `true` once the callback has run a full cycle after the
    /// caller's mutation. Returns `false` when `timeout` expires: the
    /// callback is not being invoked (client dead or never activated) and
    /// the caller may proceed; waiting forever on a dead client is the one
    /// thing this must not do.
    pub fn prepare_release(&self, timeout: Duration) -> bool {
        {
            let mut acked = self.acked.lock().expect("release handshake poisoned");
            *acked = false;
        }
        self.requested.store(true, Ordering::Release);

        let guard = self.acked.lock().expect("release handshake poisoned");
        let (mut acked, result) = self
            .signal
            .wait_timeout_while(guard, timeout, |acked| !*acked)
            .expect("release handshake poisoned");

        if result.timed_out() && !*acked {
            // Withdraw the request so a later revival of the callback does
            // not acknowledge into thin air.
            self.requested.store(false, Ordering::Release);
            return false;
        }
        *acked = false;
        true
    }

    /// Realtime side, called once per cycle after all other cycle work.
    ///
    /// Costs one relaxed load when nothing is pending.
    pub fn acknowledge_release(&self) {
        if !self.requested.load(Ordering::Relaxed) {
            return;
        }
        if self.requested.swap(false, Ordering::AcqRel) {
            let mut acked = self.acked.lock().expect("release handshake poisoned");
            *acked = true;
            self.signal.notify_one();
        }
    }

    /// Whether a release announcement is currently outstanding.
    pub fn release_pending(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

impl Default for ReleaseHandshake {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acknowledged_by_running_callback() {
        let handshake = Arc::new(ReleaseHandshake::new());
        let callback_side = Arc::clone(&handshake);
        let running = Arc::new(AtomicBool::new(true));
        let run_flag = Arc::clone(&running);

        let callback = thread::spawn(move || {
            while run_flag.load(Ordering::Acquire) {
                // One "cycle".
                callback_side.acknowledge_release();
                thread::yield_now();
            }
        });

        assert!(handshake.prepare_release(Duration::from_secs(5)));
        running.store(false, Ordering::Release);
        callback.join().unwrap();
    }

    #[test]
    fn test_times_out_without_callback() {
        let handshake = ReleaseHandshake::new();
        assert!(!handshake.prepare_release(Duration::from_millis(20)));
        // The request was withdrawn; a late callback cycle is a no-op.
        handshake.acknowledge_release();
        assert!(!handshake.release_pending());
    }

    #[test]
    fn test_idle_cycles_cost_nothing_observable() {
        let handshake = ReleaseHandshake::new();
        for _ in 0..1000 {
            handshake.acknowledge_release();
        }
        assert!(!handshake.release_pending());
    }

    #[test]
    fn test_resource_freed_only_after_callback_observed_slot() {
        // S6 shape: a synthetic process loop reads a shared port slot while
        // another thread closes it. The port must never be freed while a
        // cycle that saw it live is still running.
        struct FakePort {
            in_cycle: AtomicBool,
            freed: AtomicBool,
        }

        let port = Arc::new(FakePort {
            in_cycle: AtomicBool::new(false),
            freed: AtomicBool::new(false),
        });
        let slot: Arc<Mutex<Option<Arc<FakePort>>>> = Arc::new(Mutex::new(Some(Arc::clone(&port))));
        let handshake = Arc::new(ReleaseHandshake::new());
        let running = Arc::new(AtomicBool::new(true));
        let violations = Arc::new(AtomicUsize::new(0));

        let cb_slot = Arc::clone(&slot);
        let cb_handshake = Arc::clone(&handshake);
        let cb_running = Arc::clone(&running);
        let cb_violations = Arc::clone(&violations);
        let callback = thread::spawn(move || {
            while cb_running.load(Ordering::Acquire) {
                if let Ok(guard) = cb_slot.try_lock() {
                    if let Some(port) = guard.as_ref() {
                        port.in_cycle.store(true, Ordering::SeqCst);
                        if port.freed.load(Ordering::SeqCst) {
                            cb_violations.fetch_add(1, Ordering::Relaxed);
                        }
                        port.in_cycle.store(false, Ordering::SeqCst);
                    }
                }
                cb_handshake.acknowledge_release();
                thread::yield_now();
            }
        });

        // Let some cycles run, then close.
        thread::sleep(Duration::from_millis(10));
        let taken = slot.lock().unwrap().take().expect("port was open");
        assert!(handshake.prepare_release(Duration::from_secs(5)));
        // The callback has finished any cycle that could still see the port.
        taken.freed.store(true, Ordering::SeqCst);
        assert!(!taken.in_cycle.load(Ordering::SeqCst));

        thread::sleep(Duration::from_millis(5));
        running.store(false, Ordering::Release);
        callback.join().unwrap();
        assert_eq!(violations.load(Ordering::Relaxed), 0);
    }
}
