//! OpenFlow 1.0 virtualization proxy.
//!
//! Sits between physical OpenFlow switches and OpenFlow controllers: each
//! controller is shown a single virtual switch assembled from the fabric,
//! each switch is driven by a virtual controller multiplexing everyone's
//! commands. The [`engine`] module does all translation; this module wires
//! it to TCP sessions and exposes the management surface (listen for
//! switches, dial out to slice controllers).

pub mod config;
pub mod engine;
mod session;
pub mod topology;
pub mod wire;

use crate::engine::{Engine, SessionHandle, SliceId, SWEEP_INTERVAL};
use crate::topology::Topology;
use crate::wire::{DatapathId, Match};
use anyhow::Context;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct FlowVisor {
    engine: Arc<Mutex<Engine>>,
}

impl FlowVisor {
    pub fn new(topology: Arc<dyn Topology>) -> Self {
        FlowVisor {
            engine: Arc::new(Mutex::new(Engine::new(topology))),
        }
    }

    /// Shared engine handle, for embedding the proxy in a larger runtime.
    pub fn engine(&self) -> Arc<Mutex<Engine>> {
        Arc::clone(&self.engine)
    }

    /// Register a slice and dial out to its controller. The returned id is
    /// also what [`FlowVisor::remove_slice`] takes; the registration is torn
    /// down automatically when the controller hangs up.
    pub async fn add_slice(
        &self,
        filter: Match,
        controller: SocketAddr,
        dpid: DatapathId,
    ) -> anyhow::Result<SliceId> {
        let stream = tokio::net::TcpStream::connect(controller)
            .await
            .with_context(|| format!("connecting to controller {controller}"))?;
        let _ = stream.set_nodelay(true);
        let (handle, rx) = SessionHandle::channel();
        let id = self.engine.lock().add_slice(dpid, filter, handle.clone());
        let engine = Arc::clone(&self.engine);
        tokio::spawn(session::run_controller_session(
            engine, id, stream, handle, rx,
        ));
        Ok(id)
    }

    pub fn remove_slice(&self, id: SliceId) {
        self.engine.lock().remove_slice(id);
    }

    /// Accept physical switch connections on `addr`. Each accepted socket
    /// gets its own session task; the listener itself runs until aborted.
    pub async fn listen(&self, addr: SocketAddr) -> anyhow::Result<JoinHandle<()>> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding switch listener on {addr}"))?;
        info!(%addr, "listening for switch connections");
        let engine = Arc::clone(&self.engine);
        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        info!(%peer, "switch connected");
                        tokio::spawn(session::run_switch_session(Arc::clone(&engine), stream));
                    }
                    Err(err) => warn!(%err, "accept failed"),
                }
            }
        }))
    }

    /// Periodic xid maintenance; see [`engine::XidTracker`].
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await; // the first tick is immediate
            loop {
                ticker.tick().await;
                engine.lock().sweep_stats();
            }
        })
    }
}
