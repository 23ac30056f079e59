//! JACK MIDI output.
//!
//! Two variants share the same client plumbing:
//!
//! - **queued** (default): `send_message` pushes frames into the lock-free
//!   ring; the process callback drains them into the cycle's MIDI buffer at
//!   frame 0.
//! - **direct**: `send_message`/`schedule_message` write straight into the
//!   currently active cycle's buffer. Only meaningful from a thread
//!   synchronised with the process cycle; `schedule_message` maps
//!   `AudioFrame` timestamps verbatim and everything else to frame 0.
//!
//! The registered port lives behind a shared slot the process callback
//! observes with a try-lock; `close_port` empties the slot, runs the
//! release handshake, and only then unregisters the port with the server.
//! The client is either self-created (`NO_START_SERVER`, activated here) or
//! owned by the host application, which installs our per-instance process
//! hook and lends us its client for registration work.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jack::PortSpec;
use tracing::debug;

use crate::config::{OutputConfig, TimestampMode};
use crate::error::{MidiError, Result};
use crate::handshake::ReleaseHandshake;
use crate::output::{validate_message, MidiApi, MidiOutput};
use crate::port::PortDescriptor;
use crate::ring::{midi_ring, MidiRingConsumer, MidiRingProducer};

/// Process hook signature a hosting application dispatches to.
pub type JackProcessFn =
    Box<dyn FnMut(&jack::Client, &jack::ProcessScope) -> jack::Control + Send>;

/// Hooks supplied by an application that owns the JACK client itself.
///
/// `set_process`/`clear_process` install and remove a per-instance process
/// hook keyed by token; `with_client` lends the host's client for
/// non-realtime work (port registration, connections, teardown).
pub struct JackHostContext {
    pub set_process: Box<dyn Fn(i64, JackProcessFn) + Send + Sync>,
    pub clear_process: Box<dyn Fn(i64) + Send + Sync>,
    pub with_client: Box<dyn Fn(&mut dyn FnMut(&jack::Client)) + Send + Sync>,
}

/// JACK-specific output options.
pub struct JackOutputConfig {
    /// Bypass the ring and write into the live cycle buffer.
    pub direct: bool,
    /// Ring capacity in bytes (queued variant).
    pub ringbuffer_size: usize,
    /// Host-owned client, if any. When absent a client is created with
    /// `NO_START_SERVER` and activated here.
    pub context: Option<JackHostContext>,
}

impl Default for JackOutputConfig {
    fn default() -> Self {
        Self {
            direct: false,
            ringbuffer_size: 16384,
            context: None,
        }
    }
}

/// How long `close_port` waits for the process callback to acknowledge the
/// emptied port slot before concluding the callback is not running.
const RELEASE_TIMEOUT: Duration = Duration::from_millis(500);

/// Tokens for process hooks installed into host-owned clients. Process-wide
/// so several outputs can share one host.
static NEXT_INSTANCE: AtomicI64 = AtomicI64::new(0);

fn next_instance_token() -> i64 {
    NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed) + 1
}

type PortSlot = Arc<Mutex<Option<jack::Port<jack::MidiOut>>>>;

/// Per-cycle work, shared verbatim between the self-hosted process handler
/// and the hook handed to a host context.
struct ProcessState {
    port: PortSlot,
    /// Present in the queued variant only.
    consumer: Option<MidiRingConsumer>,
    handshake: Arc<ReleaseHandshake>,
}

impl ProcessState {
    fn run_cycle(&mut self, ps: &jack::ProcessScope) {
        // try_lock: the slot is only ever contended while close_port or a
        // direct-mode send briefly holds it; skipping a cycle is fine.
        if let Ok(mut slot) = self.port.try_lock() {
            if let Some(port) = slot.as_mut() {
                // Creating the writer clears the cycle's MIDI buffer.
                let mut writer = port.writer(ps);
                if let Some(consumer) = self.consumer.as_mut() {
                    consumer.drain(|bytes| {
                        writer.write(&jack::RawMidi { time: 0, bytes }).is_ok()
                    });
                }
            }
        }
        // Last, so an acknowledged release means a full cycle completed
        // after the slot was emptied.
        self.handshake.acknowledge_release();
    }
}

struct OutputProcessHandler {
    state: ProcessState,
}

impl jack::ProcessHandler for OutputProcessHandler {
    fn process(&mut self, _client: &jack::Client, ps: &jack::ProcessScope) -> jack::Control {
        self.state.run_cycle(ps);
        jack::Control::Continue
    }
}

enum Connection {
    /// Self-created client, activated with our process handler.
    Owned(jack::AsyncClient<(), OutputProcessHandler>),
    /// Host-owned client; we only hold the hook token.
    Hosted(i64),
}

/// A JACK MIDI output (queued or direct, per [`JackOutputConfig::direct`]).
pub struct JackMidiOutput {
    config: OutputConfig,
    host: Option<JackHostContext>,
    connection: Connection,
    port: PortSlot,
    handshake: Arc<ReleaseHandshake>,
    /// Sending half of the ring (queued variant).
    producer: Option<MidiRingProducer>,
    direct: bool,
    buffer_size: jack::Frames,
    client_name: String,
    open_destination: Option<String>,
}

impl JackMidiOutput {
    pub fn new(config: OutputConfig, jack_config: JackOutputConfig) -> Result<Self> {
        let port: PortSlot = Arc::new(Mutex::new(None));
        let handshake = Arc::new(ReleaseHandshake::new());

        let (producer, consumer) = if jack_config.direct {
            (None, None)
        } else {
            let (tx, rx) = midi_ring(jack_config.ringbuffer_size.max(64));
            (Some(tx), Some(rx))
        };

        let state = ProcessState {
            port: Arc::clone(&port),
            consumer,
            handshake: Arc::clone(&handshake),
        };

        let (connection, buffer_size, client_name) = match &jack_config.context {
            Some(host) => {
                let token = next_instance_token();
                let mut state = state;
                (host.set_process)(
                    token,
                    Box::new(move |_client, ps| {
                        state.run_cycle(ps);
                        jack::Control::Continue
                    }),
                );

                let mut info = None;
                (host.with_client)(&mut |client| {
                    info = Some((client.buffer_size(), client.name().to_string()));
                });
                let Some((buffer_size, name)) = info else {
                    (host.clear_process)(token);
                    return Err(MidiError::NotConnected);
                };
                (Connection::Hosted(token), buffer_size, name)
            }
            None => {
                let (client, _status) =
                    jack::Client::new(&config.client_name, jack::ClientOptions::NO_START_SERVER)
                        .map_err(|e| {
                            config.error(&format!("JACK: could not open client: {e}"));
                            MidiError::NotConnected
                        })?;
                let buffer_size = client.buffer_size();
                let name = client.name().to_string();
                let async_client = client
                    .activate_async((), OutputProcessHandler { state })
                    .map_err(|e| {
                        config.error(&format!("JACK: could not activate client: {e}"));
                        MidiError::NotConnected
                    })?;
                (Connection::Owned(async_client), buffer_size, name)
            }
        };

        Ok(Self {
            config,
            host: jack_config.context,
            connection,
            port,
            handshake,
            producer,
            direct: jack_config.direct,
            buffer_size,
            client_name,
            open_destination: None,
        })
    }

    /// Run `f` with a `&jack::Client`, whichever side owns it.
    fn with_client<R>(&self, f: impl FnOnce(&jack::Client) -> R) -> Result<R> {
        match &self.connection {
            Connection::Owned(async_client) => Ok(f(async_client.as_client())),
            Connection::Hosted(_) => {
                let host = self.host.as_ref().ok_or(MidiError::NotConnected)?;
                let mut f = Some(f);
                let mut out = None;
                (host.with_client)(&mut |client| {
                    if let Some(f) = f.take() {
                        out = Some(f(client));
                    }
                });
                out.ok_or(MidiError::NotConnected)
            }
        }
    }

    /// Register our local port if it does not exist yet.
    fn create_local_port(&self, port_name: &str) -> Result<()> {
        let port_name = if port_name.is_empty() { "o" } else { port_name };

        // Full names are "client:port" plus the terminator.
        if self.client_name.len() + port_name.len() + 2 >= jack::PORT_NAME_SIZE {
            self.config.error("JACK: port name length limit exceeded");
            return Err(MidiError::InvalidArgument);
        }

        let mut slot = self.port.lock().expect("port slot poisoned");
        if slot.is_some() {
            return Ok(());
        }

        let port = self
            .with_client(|client| client.register_port(port_name, jack::MidiOut::default()))?
            .map_err(|e| {
                self.config.error(&format!("JACK: error creating port: {e}"));
                MidiError::OperationNotSupported
            })?;
        *slot = Some(port);
        Ok(())
    }

    fn local_port_name(&self) -> Result<String> {
        let slot = self.port.lock().expect("port slot poisoned");
        let port = slot.as_ref().ok_or(MidiError::NotConnected)?;
        port.name().map_err(|_| MidiError::NotConnected)
    }

    fn port_open(&self) -> bool {
        self.port.lock().expect("port slot poisoned").is_some()
    }

    fn convert_timestamp(&self, timestamp: i64) -> jack::Frames {
        match self.config.timestamp_mode {
            TimestampMode::AudioFrame => timestamp.max(0) as jack::Frames,
            // The other domains have no mapping onto cycle frames.
            _ => 0,
        }
    }

    /// Write into the live cycle buffer (direct variant).
    ///
    /// The caller must be on a thread synchronised with the process cycle;
    /// the safe `jack` API scopes buffers to the callback, so this reaches
    /// through the raw port handle the way the C API allows.
    fn write_direct(&self, frame: jack::Frames, bytes: &[u8]) -> Result<()> {
        let slot = self.port.lock().expect("port slot poisoned");
        let port = slot.as_ref().ok_or(MidiError::NotConnected)?;
        let ret = unsafe {
            let buffer = jack_sys::jack_port_get_buffer(port.raw(), self.buffer_size);
            if buffer.is_null() {
                return Err(MidiError::NotConnected);
            }
            jack_sys::jack_midi_event_write(buffer, frame, bytes.as_ptr(), bytes.len())
        };
        if ret == 0 {
            Ok(())
        } else {
            Err(MidiError::NoBufferSpace)
        }
    }
}

impl MidiOutput for JackMidiOutput {
    fn open_port(&mut self, port: &PortDescriptor, local_name: &str) -> Result<()> {
        if self.port_open() && self.open_destination.as_deref() == Some(port.port_name.as_str()) {
            return Ok(());
        }

        // The descriptor must still exist in the server's graph.
        let midi_type = jack::MidiOut::default();
        let known = self.with_client(|client| {
            client.ports(
                None,
                Some(midi_type.jack_port_type()),
                jack::PortFlags::IS_INPUT,
            )
        })?;
        if !known.iter().any(|name| name == &port.port_name) {
            return Err(MidiError::InvalidArgument);
        }

        self.create_local_port(local_name)?;
        let our_name = self.local_port_name()?;
        self.with_client(|client| client.connect_ports_by_name(&our_name, &port.port_name))?
            .map_err(|e| {
                self.config
                    .error(&format!("JACK: could not connect to port {}: {e}", port.port_name));
                MidiError::IoError
            })?;

        self.open_destination = Some(port.port_name.clone());
        Ok(())
    }

    fn open_virtual_port(&mut self, local_name: &str) -> Result<()> {
        self.create_local_port(local_name)
    }

    fn close_port(&mut self) -> Result<()> {
        let taken = self.port.lock().expect("port slot poisoned").take();
        let Some(port) = taken else {
            return Ok(());
        };
        self.open_destination = None;

        // The callback must observe the emptied slot before the server
        // forgets the port; a timeout means no callback is running.
        if !self.handshake.prepare_release(RELEASE_TIMEOUT) {
            debug!("release handshake timed out; process callback inactive");
        }

        if let Ok(result) = self.with_client(|client| client.unregister_port(port)) {
            if let Err(e) = result {
                self.config
                    .warning(&format!("JACK: error unregistering port: {e}"));
            }
        }
        Ok(())
    }

    fn send_message(&mut self, bytes: &[u8]) -> Result<()> {
        validate_message(bytes)?;
        if self.direct {
            return self.write_direct(0, bytes);
        }
        if !self.port_open() {
            return Err(MidiError::NotConnected);
        }
        self.producer
            .as_mut()
            .ok_or(MidiError::NotConnected)?
            .write(bytes)
    }

    fn schedule_message(&mut self, timestamp: i64, bytes: &[u8]) -> Result<()> {
        validate_message(bytes)?;
        if !self.direct {
            // Timing would be lost crossing the ring.
            return Err(MidiError::OperationNotSupported);
        }
        self.write_direct(self.convert_timestamp(timestamp), bytes)
    }

    fn set_port_name(&mut self, name: &str) -> Result<()> {
        let mut slot = self.port.lock().expect("port slot poisoned");
        let port = slot.as_mut().ok_or(MidiError::NotConnected)?;
        port.set_name(name).map_err(|e| {
            self.config
                .error(&format!("JACK: could not rename port: {e}"));
            MidiError::IoError
        })
    }

    fn current_api(&self) -> MidiApi {
        MidiApi::Jack
    }
}

impl Drop for JackMidiOutput {
    fn drop(&mut self) {
        let _ = self.close_port();
        if let (Connection::Hosted(token), Some(host)) = (&self.connection, &self.host) {
            (host.clear_process)(*token);
        }
        // An owned AsyncClient deactivates and closes on drop.
    }
}

/// Enumerate MIDI destinations via a short-lived scan client.
pub fn output_ports() -> Result<Vec<PortDescriptor>> {
    let (client, _status) = jack::Client::new("busker-scan", jack::ClientOptions::NO_START_SERVER)
        .map_err(|_| MidiError::NotConnected)?;

    let midi_type = jack::MidiOut::default();
    let names = client.ports(
        None,
        Some(midi_type.jack_port_type()),
        jack::PortFlags::IS_INPUT,
    );

    let client_handle = client.raw() as u64;
    let mut ports = Vec::with_capacity(names.len());
    for name in names {
        let Some(port) = client.port_by_name(&name) else {
            continue;
        };
        ports.push(PortDescriptor {
            client: client_handle,
            port: 0,
            manufacturer: String::new(),
            device_name: String::new(),
            display_name: port_display_name(&port),
            port_name: name,
        });
    }
    Ok(ports)
}

/// Best human-readable name for a port: the second alias when present, the
/// first alias with any `alsa_pcm:` prefix stripped, the short name, then
/// the full name.
fn port_display_name<PS: jack::PortSpec>(port: &jack::Port<PS>) -> String {
    let aliases = port.aliases().unwrap_or_default();
    if aliases.len() > 1 {
        return aliases[1].clone();
    }
    if let Some(alias) = aliases.first() {
        return alias.strip_prefix("alsa_pcm:").unwrap_or(alias).to_string();
    }
    match port.short_name() {
        Ok(short) if !short.is_empty() => short,
        _ => port.name().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_tokens_are_unique_and_increasing() {
        let a = next_instance_token();
        let b = next_instance_token();
        assert!(b > a);
        assert!(a > 0);
    }

    // Anything past construction needs a running JACK server; construction
    // failure is exercised to keep the degenerate path honest.
    #[test]
    fn test_constructor_without_server_reports_not_connected() {
        if std::env::var_os("JACK_DEFAULT_SERVER").is_some() {
            return;
        }
        match JackMidiOutput::new(OutputConfig::default(), JackOutputConfig::default()) {
            Ok(_) => {} // a server happens to be running
            Err(e) => assert_eq!(e, MidiError::NotConnected),
        }
    }
}
