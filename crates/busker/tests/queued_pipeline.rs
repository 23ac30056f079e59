//! End-to-end exercise of the queued send machinery: the framed ring and
//! the release handshake wired together the way the JACK and PipeWire
//! backends wire them, with a synthetic process thread standing in for the
//! host's realtime callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use busker::{midi_ring, validate_message, MidiError, ReleaseHandshake};

/// A stand-in for a host cycle buffer: accepts events until full.
#[derive(Default)]
struct CycleBuffer {
    events: Vec<Vec<u8>>,
    capacity_bytes: usize,
    used: usize,
}

impl CycleBuffer {
    fn new(capacity_bytes: usize) -> Self {
        Self {
            events: Vec::new(),
            capacity_bytes,
            used: 0,
        }
    }

    fn reserve(&mut self, bytes: &[u8]) -> bool {
        if self.used + bytes.len() > self.capacity_bytes {
            return false;
        }
        self.used += bytes.len();
        self.events.push(bytes.to_vec());
        true
    }
}

#[test]
fn queued_send_reaches_the_cycle_buffer_in_order() {
    let (mut producer, mut consumer) = midi_ring(1024);
    let delivered: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let running = Arc::new(AtomicBool::new(true));

    let sink = Arc::clone(&delivered);
    let run = Arc::clone(&running);
    let callback = thread::spawn(move || {
        while run.load(Ordering::Acquire) {
            let mut cycle = CycleBuffer::new(4096);
            consumer.drain(|bytes| cycle.reserve(bytes));
            sink.lock().unwrap().extend(cycle.events);
            thread::yield_now();
        }
    });

    let note_on = [0x90, 0x3C, 0x7F];
    let note_off = [0x80, 0x3C, 0x00];
    validate_message(&note_on).unwrap();
    producer.write(&note_on).unwrap();
    producer.write(&note_off).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        {
            let seen = delivered.lock().unwrap();
            if seen.len() >= 2 {
                assert_eq!(seen[0], note_on);
                assert_eq!(seen[1], note_off);
                break;
            }
        }
        assert!(Instant::now() < deadline, "messages never arrived");
        thread::yield_now();
    }

    running.store(false, Ordering::Release);
    callback.join().unwrap();
}

#[test]
fn close_under_callback_never_touches_a_released_port() {
    // The backends' close sequence: empty the shared slot, run the
    // handshake, then release the resource. The synthetic callback checks
    // it never sees the resource after the handshake completed.
    struct Port {
        released: AtomicBool,
    }

    let slot: Arc<Mutex<Option<Arc<Port>>>> = Arc::new(Mutex::new(Some(Arc::new(Port {
        released: AtomicBool::new(false),
    }))));
    let handshake = Arc::new(ReleaseHandshake::new());
    let running = Arc::new(AtomicBool::new(true));
    let (mut producer, mut consumer) = midi_ring(256);

    let cb_slot = Arc::clone(&slot);
    let cb_handshake = Arc::clone(&handshake);
    let cb_running = Arc::clone(&running);
    let callback = thread::spawn(move || {
        let mut violations = 0u32;
        while cb_running.load(Ordering::Acquire) {
            if let Ok(guard) = cb_slot.try_lock() {
                if let Some(port) = guard.as_ref() {
                    if port.released.load(Ordering::SeqCst) {
                        violations += 1;
                    }
                    consumer.drain(|_| true);
                }
            }
            cb_handshake.acknowledge_release();
            thread::yield_now();
        }
        violations
    });

    // Traffic while the callback runs.
    for _ in 0..64 {
        producer.write(&[0xF8]).unwrap();
        thread::yield_now();
    }

    // Close: slot first, then the handshake, then the release.
    let port = slot.lock().unwrap().take().expect("port open");
    assert!(handshake.prepare_release(Duration::from_secs(5)));
    port.released.store(true, Ordering::SeqCst);

    // Sends after close fail the way backends report it: the slot gate
    // comes before the ring.
    let mut send = |bytes: &[u8]| -> Result<(), MidiError> {
        if slot.lock().unwrap().is_none() {
            return Err(MidiError::NotConnected);
        }
        producer.write(bytes)
    };
    assert_eq!(send(&[0xF8]), Err(MidiError::NotConnected));

    thread::sleep(Duration::from_millis(10));
    running.store(false, Ordering::Release);
    let violations = callback.join().unwrap();
    assert_eq!(violations, 0, "callback used the port after release");
}

#[test]
fn overflow_surfaces_as_no_buffer_space() {
    let (mut producer, _consumer) = midi_ring(64);
    producer.write(&[0u8; 40]).unwrap();
    assert_eq!(producer.write(&[0u8; 40]), Err(MidiError::NoBufferSpace));
}
