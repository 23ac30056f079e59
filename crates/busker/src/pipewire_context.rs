//! Long-lived PipeWire connection: main loop, registry, graph, sync.
//!
//! The daemon pushes unsolicited events; every operation that needs a
//! consistent snapshot (enumeration, link creation, first open after
//! startup) runs a sync barrier: a `sync` request whose `done(PW_ID_CORE,
//! seq)` echo quits the main loop. The loop is driven inline on the calling
//! thread, so the whole context is single-threaded (`!Send`) and the graph
//! is only ever mutated while the loop runs here.

use std::cell::{Cell, Ref, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Once;
use std::time::Duration;

use pipewire::context::ContextRc;
use pipewire::core::{CoreRc, PW_ID_CORE};
use pipewire::main_loop::MainLoopRc;
use pipewire::registry::RegistryRc;
use pipewire::spa::utils::result::AsyncSeq;
use pipewire::types::ObjectType;
use tracing::{debug, warn};

use crate::error::{MidiError, Result};
use crate::pipewire_graph::{Graph, PortInfo};

static PIPEWIRE_INIT: Once = Once::new();

/// A bound port proxy plus the listener feeding the graph.
struct PortWatch {
    _proxy: pipewire::port::Port,
    _listener: pipewire::port::PortListener,
}

/// Shared flags for the sync barrier.
struct SyncState {
    pending: Cell<Option<AsyncSeq>>,
    done: Cell<bool>,
}

pub struct PwContext {
    // Listeners first: they must drop before the proxies they hook.
    _core_listener: pipewire::core::Listener,
    _registry_listener: pipewire::registry::Listener,
    watches: Rc<RefCell<HashMap<u32, PortWatch>>>,
    graph: Rc<RefCell<Graph>>,
    sync: Rc<SyncState>,
    // Kept alive for the registry listener's sake; never used directly
    // after construction.
    _registry: RegistryRc,
    core: CoreRc,
    _context: ContextRc,
    mainloop: MainLoopRc,
}

impl PwContext {
    /// Connect to the daemon and start mirroring its port graph.
    ///
    /// Ends with one sync barrier plus a short settling run so synchronous
    /// callers see the startup graph immediately.
    pub fn new() -> Result<Self> {
        PIPEWIRE_INIT.call_once(|| {
            pipewire::init();
        });

        let mainloop = MainLoopRc::new(None).map_err(|e| {
            warn!("PipeWire: could not create main loop: {e}");
            MidiError::NotConnected
        })?;
        let context = ContextRc::new(&mainloop, None).map_err(|e| {
            warn!("PipeWire: could not create context: {e}");
            MidiError::NotConnected
        })?;
        let core = context.connect_rc(None).map_err(|e| {
            warn!("PipeWire: could not connect to the daemon: {e}");
            MidiError::NotConnected
        })?;
        let registry = core.get_registry_rc().map_err(|e| {
            warn!("PipeWire: could not get the registry: {e}");
            MidiError::NotConnected
        })?;

        let graph = Rc::new(RefCell::new(Graph::default()));
        let watches: Rc<RefCell<HashMap<u32, PortWatch>>> = Rc::new(RefCell::new(HashMap::new()));

        let registry_bind = registry.clone();
        let graph_add = Rc::clone(&graph);
        let watches_add = Rc::clone(&watches);
        let graph_remove = Rc::clone(&graph);
        let watches_remove = Rc::clone(&watches);

        let registry_listener = registry
            .add_listener_local()
            .global(move |global| {
                if global.type_ != ObjectType::Port {
                    return;
                }
                let port: pipewire::port::Port = match registry_bind.bind(global) {
                    Ok(port) => port,
                    Err(e) => {
                        debug!("PipeWire: could not bind port {}: {e}", global.id);
                        return;
                    }
                };
                let graph = Rc::clone(&graph_add);
                let listener = port
                    .add_listener_local()
                    .info(move |info| {
                        let Some(props) = info.props() else { return };
                        if let Some(parsed) = PortInfo::from_props(info.id(), props.iter()) {
                            graph.borrow_mut().insert(parsed);
                        }
                    })
                    .register();
                watches_add.borrow_mut().insert(
                    global.id,
                    PortWatch {
                        _proxy: port,
                        _listener: listener,
                    },
                );
            })
            .global_remove(move |id| {
                graph_remove.borrow_mut().remove_port(id);
                watches_remove.borrow_mut().remove(&id);
            })
            .register();

        let sync = Rc::new(SyncState {
            pending: Cell::new(None),
            done: Cell::new(false),
        });
        let sync_done = Rc::clone(&sync);
        let mainloop_weak = mainloop.downgrade();
        let core_listener = core
            .add_listener_local()
            .done(move |id, seq| {
                if id == PW_ID_CORE && sync_done.pending.get() == Some(seq) {
                    sync_done.done.set(true);
                    if let Some(mainloop) = mainloop_weak.upgrade() {
                        mainloop.quit();
                    }
                }
            })
            .register();

        let ctx = Self {
            _core_listener: core_listener,
            _registry_listener: registry_listener,
            watches,
            graph,
            sync,
            _registry: registry,
            core,
            _context: context,
            mainloop,
        };

        ctx.synchronize();
        // One bounded settling run so stragglers from the initial sync are
        // delivered before the constructor returns.
        ctx.run_for(Duration::from_millis(1));
        Ok(ctx)
    }

    /// Block until every notification sent before this call has arrived.
    pub fn synchronize(&self) {
        self.sync.done.set(false);
        match self.core.sync(0) {
            Ok(seq) => self.sync.pending.set(Some(seq)),
            Err(e) => {
                warn!("PipeWire: sync request failed: {e}");
                return;
            }
        }
        while !self.sync.done.get() {
            self.mainloop.run();
        }
    }

    /// Run the loop for roughly `timeout`, then quit it.
    fn run_for(&self, timeout: Duration) {
        let mainloop_weak = self.mainloop.downgrade();
        let timer = self.mainloop.loop_().add_timer(move |_| {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        });
        if timer.update_timer(Some(timeout), None).into_result().is_ok() {
            self.mainloop.run();
        }
    }

    /// The mirrored daemon graph. Release the borrow before calling
    /// anything that re-enters the loop.
    pub fn graph(&self) -> Ref<'_, Graph> {
        self.graph.borrow()
    }

    /// Create a link between two global port ids, synchronised so the link
    /// is visible once this returns. Dropping the returned proxy unlinks.
    pub fn link_ports(&self, out_port: u32, in_port: u32) -> Result<pipewire::link::Link> {
        let props = pipewire::properties::properties! {
            *pipewire::keys::LINK_OUTPUT_PORT => out_port.to_string(),
            *pipewire::keys::LINK_INPUT_PORT => in_port.to_string()
        };
        let link: pipewire::link::Link =
            self.core.create_object("link-factory", &props).map_err(|e| {
                warn!("PipeWire: could not allocate link: {e}");
                MidiError::IoError
            })?;
        self.synchronize();
        Ok(link)
    }

    /// Raw loop handle for APIs the safe crate does not cover.
    pub(crate) fn raw_loop(&self) -> *mut pipewire_sys::pw_loop {
        // LoopRef is a transparent wrapper over pw_loop.
        self.mainloop.loop_() as *const pipewire::loop_::LoopRef as *mut pipewire_sys::pw_loop
    }

    /// How many port proxies are currently watched (diagnostics).
    pub fn watched_ports(&self) -> usize {
        self.watches.borrow().len()
    }
}
