//! Node core: identity, shared state, and the two worker threads.
//!
//! `Core` wires the registry, the action queue, and the bound socket
//! together, and owns the cooperative stop flag. Exactly two long-lived
//! threads are spawned: the datagram loop and the action worker; the caller
//! (normally `kapuad`'s main thread) is the third.

use crate::actions::{Action, ActionQueue, POP_TIMEOUT};
use crate::config::Config;
use crate::crypto::KeyPair;
use crate::net::{NetError, PeerInfo, PeerRegistry, UdpNetwork};
use crate::types::{fmt_id, NodeId};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

pub struct Core {
    my_id: NodeId,
    registry: Arc<PeerRegistry>,
    actions: Arc<ActionQueue>,
    running: Arc<AtomicBool>,
    network: Arc<UdpNetwork>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Core {
    /// Assemble a node: pick (or adopt) the id, bind the socket, and wire
    /// the shared state. No threads run until [`Core::start`].
    pub fn new(config: Config, keys: KeyPair) -> Result<Self, NetError> {
        let my_id = config.node_id.unwrap_or_else(rand::random);
        info!("Node ID: {}", fmt_id(my_id));

        let registry = Arc::new(PeerRegistry::new());
        let actions = Arc::new(ActionQueue::new());
        let running = Arc::new(AtomicBool::new(false));
        let keys = Arc::new(keys);

        let network = Arc::new(UdpNetwork::bind(
            &config,
            my_id,
            keys,
            registry.clone(),
            actions.clone(),
            running.clone(),
        )?);

        Ok(Self {
            my_id,
            registry,
            actions,
            running,
            network,
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the datagram thread and the action worker.
    pub fn start(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("start called, but node already running");
            return false;
        }
        debug!("Starting...");

        let mut threads = self.threads.lock().unwrap();

        let network = self.network.clone();
        threads.push(
            std::thread::Builder::new()
                .name("kapua-datagram".into())
                .spawn(move || network.run())
                .expect("spawn datagram thread"),
        );

        let network = self.network.clone();
        let actions = self.actions.clone();
        let running = self.running.clone();
        threads.push(
            std::thread::Builder::new()
                .name("kapua-actions".into())
                .spawn(move || action_worker(network, actions, running))
                .expect("spawn action worker"),
        );

        info!("Started");
        true
    }

    /// Cooperative shutdown: clear the flag, wake the worker, join the
    /// threads in reverse start order.
    pub fn stop(&self) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("stop called, but node not running");
            return false;
        }
        debug!("Stopping...");
        self.actions.interrupt();

        let mut threads = self.threads.lock().unwrap();
        while let Some(handle) = threads.pop() {
            let _ = handle.join();
        }

        info!("Stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn my_id(&self) -> NodeId {
        self.my_id
    }

    /// Address the node's socket bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        self.network.local_addr()
    }

    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    pub fn peer(&self, id: NodeId) -> Option<PeerInfo> {
        self.registry.info(id)
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.registry.infos()
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

/// Worker thread: drain the action queue, re-checking the stop flag on
/// every timed-out wait.
fn action_worker(network: Arc<UdpNetwork>, actions: Arc<ActionQueue>, running: Arc<AtomicBool>) {
    debug!("Action worker started");
    while running.load(Ordering::SeqCst) {
        match actions.pop_timeout(POP_TIMEOUT) {
            Some(Action::RequestPublicKey { node_id }) => {
                network.request_public_key(node_id);
            }
            None => {}
        }
    }
    debug!("Action worker stopped");
}
