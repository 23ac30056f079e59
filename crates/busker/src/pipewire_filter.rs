//! Our participant in the PipeWire graph: a MIDI filter node.
//!
//! The filter API is not bound by the safe `pipewire` crate, so this module
//! talks to `pipewire-sys`/`libspa-sys` directly. The surface is kept
//! small: create the filter with the properties that keep it from idling,
//! add/rename/remove one local MIDI port, and drain the framed ring into
//! SPA control sequences from the realtime process callback.
//!
//! The port handle lives in an atomic slot: the user thread swaps it out on
//! removal, the realtime callback loads it each cycle and skips the cycle
//! when it is gone.

use std::cell::UnsafeCell;
use std::ffi::{c_char, c_void, CString};
use std::mem::{size_of, MaybeUninit};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use libspa_sys as spa_sys;
use pipewire_sys as pw_sys;
use tracing::warn;

use crate::error::{MidiError, Result};
use crate::pipewire_context::PwContext;
use crate::ring::MidiRingConsumer;

/// Overhead of one control event in a sequence pod, before the payload.
const CONTROL_HEADER_BYTES: u32 = 16;

/// State shared with the realtime process callback. The consumer is only
/// ever touched from the callback (SPSC contract); the port slot is the
/// cross-thread signal.
struct FilterState {
    consumer: UnsafeCell<MidiRingConsumer>,
    port: AtomicPtr<c_void>,
}

/// A filter node plus its single local port and realtime drain.
pub struct PwFilter {
    filter: *mut pw_sys::pw_filter,
    state: Box<FilterState>,
    // The events struct is referenced by the filter for its whole life.
    _events: Box<pw_sys::pw_filter_events>,
}

impl PwFilter {
    /// Create the filter node. Properties mirror what peers expect from a
    /// MIDI participant and keep the node from being suspended while idle.
    pub fn new(ctx: &PwContext, filter_name: &str, consumer: MidiRingConsumer) -> Result<Self> {
        let state = Box::new(FilterState {
            consumer: UnsafeCell::new(consumer),
            port: AtomicPtr::new(ptr::null_mut()),
        });

        let mut events: Box<pw_sys::pw_filter_events> =
            Box::new(unsafe { MaybeUninit::zeroed().assume_init() });
        events.version = pw_sys::PW_VERSION_FILTER_EVENTS;
        events.process = Some(on_process);

        let name = CString::new(filter_name).map_err(|_| MidiError::InvalidArgument)?;

        let filter = unsafe {
            let props = pw_sys::pw_properties_new(
                c_str(b"media.type\0"),
                c_str(b"Midi\0"),
                c_str(b"media.category\0"),
                c_str(b"Filter\0"),
                c_str(b"media.role\0"),
                c_str(b"DSP\0"),
                c_str(b"media.name\0"),
                c_str(b"busker\0"),
                c_str(b"node.lock-rate\0"),
                c_str(b"true\0"),
                c_str(b"node.always-process\0"),
                c_str(b"true\0"),
                c_str(b"node.pause-on-idle\0"),
                c_str(b"false\0"),
                c_str(b"node.suspend-on-idle\0"),
                c_str(b"false\0"),
                ptr::null::<c_char>(),
            );
            pw_sys::pw_filter_new_simple(
                ctx.raw_loop(),
                name.as_ptr(),
                props,
                &*events,
                &*state as *const FilterState as *mut c_void,
            )
        };
        if filter.is_null() {
            warn!("PipeWire: could not create filter node");
            return Err(MidiError::NotConnected);
        }

        Ok(Self {
            filter,
            state,
            _events: events,
        })
    }

    /// Connect the filter for realtime processing.
    pub fn connect(&self) -> Result<()> {
        let res = unsafe {
            pw_sys::pw_filter_connect(
                self.filter,
                pw_sys::PW_FILTER_FLAG_RT_PROCESS,
                ptr::null_mut(),
                0,
            )
        };
        if res < 0 {
            warn!("PipeWire: filter connect failed: {res}");
            return Err(MidiError::BackendStatus(res));
        }
        Ok(())
    }

    /// The node id the daemon assigned, or `u32::MAX` while unresolved.
    pub fn node_id(&self) -> u32 {
        unsafe { pw_sys::pw_filter_get_node_id(self.filter) }
    }

    pub fn has_port(&self) -> bool {
        !self.state.port.load(Ordering::Acquire).is_null()
    }

    /// Add the local MIDI port.
    pub fn add_port(&mut self, port_name: &str, direction: spa_sys::spa_direction) -> Result<()> {
        if self.has_port() {
            return Ok(());
        }
        let name = CString::new(port_name).map_err(|_| MidiError::InvalidArgument)?;
        let port = unsafe {
            let props = pw_sys::pw_properties_new(
                c_str(b"format.dsp\0"),
                c_str(b"8 bit raw midi\0"),
                c_str(b"port.name\0"),
                name.as_ptr(),
                ptr::null::<c_char>(),
            );
            pw_sys::pw_filter_add_port(
                self.filter,
                direction,
                pw_sys::PW_FILTER_PORT_FLAG_MAP_BUFFERS,
                size_of::<*mut c_void>(),
                props,
                ptr::null_mut(),
                0,
            )
        };
        if port.is_null() {
            warn!("PipeWire: could not add filter port");
            return Err(MidiError::OperationNotSupported);
        }
        self.state.port.store(port, Ordering::Release);
        Ok(())
    }

    /// Remove the local port. The callback observes the emptied slot before
    /// the filter forgets the port.
    pub fn remove_port(&mut self) {
        let port = self.state.port.swap(ptr::null_mut(), Ordering::AcqRel);
        if !port.is_null() {
            unsafe { pw_sys::pw_filter_remove_port(port) };
        }
    }

    /// Rename the local port in place.
    pub fn rename_port(&mut self, port_name: &str) -> Result<()> {
        let port = self.state.port.load(Ordering::Acquire);
        if port.is_null() {
            return Err(MidiError::NotConnected);
        }
        let name = CString::new(port_name).map_err(|_| MidiError::InvalidArgument)?;
        let item = spa_sys::spa_dict_item {
            key: c_str(b"port.name\0"),
            value: name.as_ptr(),
        };
        let dict = spa_sys::spa_dict {
            flags: 0,
            n_items: 1,
            items: &item,
        };
        let res = unsafe { pw_sys::pw_filter_update_properties(self.filter, port, &dict) };
        if res < 0 {
            return Err(MidiError::BackendStatus(res));
        }
        Ok(())
    }
}

impl Drop for PwFilter {
    fn drop(&mut self) {
        self.remove_port();
        if !self.filter.is_null() {
            unsafe { pw_sys::pw_filter_destroy(self.filter) };
        }
    }
}

fn c_str(bytes: &'static [u8]) -> *const c_char {
    debug_assert_eq!(bytes.last(), Some(&0));
    bytes.as_ptr() as *const c_char
}

/// Realtime process callback: build one SPA control sequence out of the
/// frames queued since last cycle. No allocation, no locks.
unsafe extern "C" fn on_process(data: *mut c_void, _position: *mut spa_sys::spa_io_position) {
    let state = &*(data as *const FilterState);
    let port = state.port.load(Ordering::Acquire);
    if port.is_null() {
        return;
    }

    let buffer = pw_sys::pw_filter_dequeue_buffer(port);
    if buffer.is_null() {
        return;
    }
    let spa_buffer = (*buffer).buffer;
    if spa_buffer.is_null() || (*spa_buffer).n_datas < 1 {
        pw_sys::pw_filter_queue_buffer(port, buffer);
        return;
    }
    let data0 = &mut *(*spa_buffer).datas;
    if data0.data.is_null() {
        pw_sys::pw_filter_queue_buffer(port, buffer);
        return;
    }

    let mut builder: spa_sys::spa_pod_builder = MaybeUninit::zeroed().assume_init();
    spa_sys::spa_pod_builder_init(&mut builder, data0.data, data0.maxsize);
    let mut frame: MaybeUninit<spa_sys::spa_pod_frame> = MaybeUninit::uninit();
    spa_sys::spa_pod_builder_push_sequence(&mut builder, frame.as_mut_ptr(), 0);

    let consumer = &mut *state.consumer.get();
    let maxsize = data0.maxsize;
    consumer.drain(|bytes| {
        // Reserve before writing: a control header plus the payload padded
        // to pod alignment. Refusing here drops the frame, which keeps the
        // queue head moving when the cycle's buffer is full.
        let padded = (bytes.len() as u32 + 7) & !7;
        if builder.state.offset + CONTROL_HEADER_BYTES + padded > maxsize {
            return false;
        }
        spa_sys::spa_pod_builder_control(&mut builder, 0, spa_sys::SPA_CONTROL_Midi);
        spa_sys::spa_pod_builder_bytes(
            &mut builder,
            bytes.as_ptr() as *const c_void,
            bytes.len() as u32,
        ) >= 0
    });

    spa_sys::spa_pod_builder_pop(&mut builder, frame.as_mut_ptr());

    if !data0.chunk.is_null() {
        let chunk = &mut *data0.chunk;
        chunk.offset = 0;
        chunk.stride = 1;
        chunk.size = builder.state.offset.min(maxsize);
    }

    pw_sys::pw_filter_queue_buffer(port, buffer);
}
