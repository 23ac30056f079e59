//! Framed SPSC ring for realtime MIDI handoff.
//!
//! One thread (the sender) calls [`MidiRingProducer::write`]; one thread
//! (the host's process callback) calls [`MidiRingConsumer::drain`]. Frames
//! are `⟨u32 little-endian length⟩⟨payload⟩` and are committed atomically:
//! the consumer never observes a partial frame, and a reader that peeks a
//! length is guaranteed the payload will follow.
//!
//! The consumer side never sleeps, allocates or locks. The producer side may
//! spin-yield briefly when the ring is momentarily full; it gives up with
//! `NoBufferSpace` rather than stalling forever when nothing is draining.

use rtrb::{Consumer, Producer, RingBuffer};

use crate::error::{MidiError, Result};

/// Bytes of length prefix in front of every frame.
const LEN_PREFIX: usize = 4;

/// How many times `write` yields to the consumer before giving up on a
/// frame that would fit in an empty ring but currently has no space.
const SPIN_BUDGET: usize = 1 << 16;

/// Create a framed ring with the given capacity in bytes.
///
/// Usable capacity is `capacity - 1`; a power of two is recommended. The
/// producer belongs to the sending thread, the consumer to the realtime
/// callback.
pub fn midi_ring(capacity: usize) -> (MidiRingProducer, MidiRingConsumer) {
    let (tx, rx) = RingBuffer::<u8>::new(capacity);
    (
        MidiRingProducer {
            tx,
            usable: capacity.saturating_sub(1),
        },
        MidiRingConsumer {
            scratch: vec![0; capacity],
            rx,
        },
    )
}

/// Sending half. Not realtime; may yield while the consumer drains.
pub struct MidiRingProducer {
    tx: Producer<u8>,
    usable: usize,
}

impl MidiRingProducer {
    /// Enqueue one message as a single frame.
    ///
    /// Returns `NoBufferSpace` immediately when the frame could never fit,
    /// and after the spin budget runs out when the ring stays full (no
    /// consumer is making progress). The frame is committed in one
    /// transaction: the consumer sees all of it or none of it.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let framed = bytes.len() + LEN_PREFIX;
        if framed > self.usable {
            return Err(MidiError::NoBufferSpace);
        }

        let mut budget = SPIN_BUDGET;
        while self.tx.slots() < framed {
            if budget == 0 {
                return Err(MidiError::NoBufferSpace);
            }
            budget -= 1;
            std::thread::yield_now();
        }

        let chunk = self
            .tx
            .write_chunk_uninit(framed)
            .map_err(|_| MidiError::NoBufferSpace)?;
        let len = (bytes.len() as u32).to_le_bytes();
        let written = chunk.fill_from_iter(len.iter().copied().chain(bytes.iter().copied()));
        debug_assert_eq!(written, framed);
        Ok(())
    }
}

/// Draining half. Owned by the realtime callback.
pub struct MidiRingConsumer {
    rx: Consumer<u8>,
    // Frames can wrap around the ring edge; they are made contiguous here
    // before being offered to the sink. Allocated once, never grown.
    scratch: Vec<u8>,
}

impl MidiRingConsumer {
    /// Drain every complete frame into `sink`, in order.
    ///
    /// `sink` returns whether it accepted the payload (for a host MIDI
    /// buffer: whether the reservation succeeded). A refused payload is
    /// discarded; the frame is consumed either way, so one oversized or
    /// unlucky frame cannot stall the queue head across cycles. A frame
    /// whose payload has not fully arrived yet is left in place; the
    /// producer's commit ordering guarantees it will complete.
    pub fn drain(&mut self, mut sink: impl FnMut(&[u8]) -> bool) {
        loop {
            let Some(len) = self.peek_len() else { return };
            if self.rx.slots() < LEN_PREFIX + len {
                // Frame still in flight.
                return;
            }

            let Ok(prefix) = self.rx.read_chunk(LEN_PREFIX) else {
                return;
            };
            prefix.commit_all();

            let Ok(chunk) = self.rx.read_chunk(len) else {
                return;
            };
            let (head, tail) = chunk.as_slices();
            let scratch = &mut self.scratch[..len];
            scratch[..head.len()].copy_from_slice(head);
            scratch[head.len()..].copy_from_slice(tail);
            chunk.commit_all();

            let _ = sink(&self.scratch[..len]);
        }
    }

    /// Read the next frame's length without consuming it.
    fn peek_len(&mut self) -> Option<usize> {
        let chunk = self.rx.read_chunk(LEN_PREFIX).ok()?;
        let (head, tail) = chunk.as_slices();
        let mut prefix = [0u8; LEN_PREFIX];
        prefix[..head.len()].copy_from_slice(head);
        prefix[head.len()..].copy_from_slice(tail);
        // Dropping the chunk without committing leaves the bytes in place.
        Some(u32::from_le_bytes(prefix) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(consumer: &mut MidiRingConsumer) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        consumer.drain(|bytes| {
            frames.push(bytes.to_vec());
            true
        });
        frames
    }

    #[test]
    fn test_roundtrip_single_frame() {
        let (mut tx, mut rx) = midi_ring(64);
        tx.write(&[0x90, 0x3C, 0x7F]).unwrap();
        assert_eq!(collect(&mut rx), vec![vec![0x90, 0x3C, 0x7F]]);
        assert!(collect(&mut rx).is_empty());
    }

    #[test]
    fn test_roundtrip_preserves_order_and_bytes() {
        let (mut tx, mut rx) = midi_ring(256);
        let frames: Vec<Vec<u8>> = vec![
            vec![0x90, 0x3C, 0x7F],
            vec![0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7],
            vec![0x80, 0x3C, 0x00],
            vec![0xB0, 0x07, 0x64],
        ];
        for f in &frames {
            tx.write(f).unwrap();
        }
        assert_eq!(collect(&mut rx), frames);
    }

    #[test]
    fn test_oversized_frame_rejected_and_ring_unchanged() {
        let (mut tx, mut rx) = midi_ring(64);
        // 60 + 4 = 64 > usable 63
        let too_big = vec![0xF0; 60];
        assert_eq!(tx.write(&too_big), Err(MidiError::NoBufferSpace));
        // Ring untouched: a following write drains cleanly.
        tx.write(&[0xFE]).unwrap();
        assert_eq!(collect(&mut rx), vec![vec![0xFE]]);
    }

    #[test]
    fn test_full_ring_gives_up_without_consumer() {
        let (mut tx, _rx) = midi_ring(64);
        tx.write(&[0u8; 40]).unwrap();
        // 44 more bytes would fit an empty ring but not this one, and
        // nothing is draining; the bounded spin must end in an error.
        assert_eq!(tx.write(&[0u8; 40]), Err(MidiError::NoBufferSpace));
    }

    #[test]
    fn test_spin_resolves_when_consumer_drains() {
        let (mut tx, mut rx) = midi_ring(64);
        tx.write(&[1u8; 40]).unwrap();

        let drainer = std::thread::spawn(move || {
            let mut frames = Vec::new();
            while frames.len() < 2 {
                rx.drain(|bytes| {
                    frames.push(bytes.to_vec());
                    true
                });
                std::thread::yield_now();
            }
            frames
        });

        // Spins until the drainer frees space, then succeeds.
        tx.write(&[2u8; 40]).unwrap();
        let frames = drainer.join().unwrap();
        assert_eq!(frames[0], vec![1u8; 40]);
        assert_eq!(frames[1], vec![2u8; 40]);
    }

    #[test]
    fn test_refused_payload_is_discarded_not_stuck() {
        let (mut tx, mut rx) = midi_ring(128);
        tx.write(&[0x90, 0x3C, 0x7F]).unwrap();
        tx.write(&[0x80, 0x3C, 0x00]).unwrap();

        // Sink full this cycle: refuse everything.
        let mut refused = 0;
        rx.drain(|_| {
            refused += 1;
            false
        });
        assert_eq!(refused, 2);

        // Next cycle starts clean; nothing re-delivered.
        assert!(collect(&mut rx).is_empty());
        tx.write(&[0xFE]).unwrap();
        assert_eq!(collect(&mut rx), vec![vec![0xFE]]);
    }

    #[test]
    fn test_wrapped_frame_made_contiguous() {
        let (mut tx, mut rx) = midi_ring(32);
        // Advance the ring position so a later frame wraps the edge.
        for _ in 0..3 {
            tx.write(&[0xF8; 6]).unwrap();
            let _ = collect(&mut rx);
        }
        let payload: Vec<u8> = (0u8..20).collect();
        tx.write(&payload).unwrap();
        assert_eq!(collect(&mut rx), vec![payload]);
    }

    #[test]
    fn test_empty_payload_frame() {
        let (mut tx, mut rx) = midi_ring(16);
        tx.write(&[]).unwrap();
        assert_eq!(collect(&mut rx), vec![Vec::<u8>::new()]);
    }
}
