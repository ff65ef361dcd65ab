use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::handlers;
use super::node::NodeState;
use super::types::{Address, NodeId, PeerLink};
use crate::config::NodeConfig;
use crate::error::{OverlayError, OverlayResult};
use crate::protocol::connection::Connection;
use crate::protocol::description::NodeDescription;
use crate::protocol::message::{Request, Tag, ACK_MARKER};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// One running overlay node: its state, the server loop accepting
/// connections, and one worker task per accepted connection.
pub struct OverlayService {
    address: Address,
    dims: usize,
    receive_timeout: Duration,
    pub(crate) state: Mutex<NodeState>,
    workers: DashMap<u64, JoinHandle<()>>,
    next_worker: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl OverlayService {
    /// Binds the listening socket, then either creates the root node or
    /// joins the overlay through the configured remote peer.
    ///
    /// The returned listener must be handed to [`OverlayService::serve`].
    pub async fn start(config: &NodeConfig) -> OverlayResult<(Arc<Self>, TcpListener)> {
        config.validate()?;
        let requested = config.listen_address();
        let listener = TcpListener::bind(requested.socket_string()).await?;
        let address = Address::new(requested.host.clone(), listener.local_addr()?.port());
        let receive_timeout = config.receive_timeout();

        let (state, handshake) = match config.remote_address() {
            None => {
                let (lo, hi) = config.bounds();
                tracing::info!("Starting root node at {} owning [({}), ({}))", address, lo, hi);
                (NodeState::root(address.clone(), lo, hi)?, None)
            }
            Some(remote) => {
                tracing::info!("Joining overlay through {}", remote);
                let mut conn = Connection::open(&remote, receive_timeout).await?;
                let block = conn
                    .request(&Request::Join {
                        joiner: address.clone(),
                    }
                    .to_string())
                    .await
                    .map(|first| format!("{}\n", first))?;
                let rest = conn.recv_block().await?;
                let description = NodeDescription::parse(&(block + &rest), config.dims)?;
                let mut state = NodeState::from_description(description)?;
                state.set_address(address.clone());
                (state, Some(conn))
            }
        };

        let (shutdown_tx, _) = watch::channel(false);
        let service = Arc::new(Self {
            address,
            dims: config.dims,
            receive_timeout,
            state: Mutex::new(state),
            workers: DashMap::new(),
            next_worker: AtomicU64::new(0),
            shutdown_tx,
        });

        if let Some(mut conn) = handshake {
            service.link_unlinked().await;
            conn.send(&Tag::Join.ok()).await?;
            conn.close().await;
            let (id, lo, hi) = service
                .with_state(|s| (s.id(), s.region().lo().clone(), s.region().hi().clone()))
                .await;
            tracing::info!("Joined as node {:?} owning [({}), ({}))", id.0, lo, hi);
        }

        Ok((service, listener))
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn receive_timeout(&self) -> Duration {
        self.receive_timeout
    }

    pub async fn id(&self) -> NodeId {
        self.state.lock().await.id()
    }

    /// Runs `f` against the node state under its lock.
    pub async fn with_state<R>(&self, f: impl FnOnce(&NodeState) -> R) -> R {
        let state = self.state.lock().await;
        f(&state)
    }

    pub async fn describe(&self, with_data: bool) -> NodeDescription {
        self.state.lock().await.describe(with_data)
    }

    /// Accepts connections until shutdown is requested, then waits for
    /// every worker and closes the links.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tracing::info!("Node listening on {}", self.address);

        while !*shutdown_rx.borrow() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!("Accepted connection from {}", peer);
                        let _ = stream.set_nodelay(true);
                        self.spawn_worker(Connection::new(stream, self.receive_timeout));
                    }
                    Err(e) => {
                        tracing::warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                _ = shutdown_rx.changed() => {}
            }
        }

        drop(listener);
        tracing::info!("Stopped accepting connections, waiting for workers");
        self.drain_workers().await;
        self.unlink().await;
        tracing::info!("Node {} stopped", self.address);
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Hands the region to the merge partner, then stops the node.
    pub async fn leave(&self) {
        if let Err(e) = self.depart().await {
            tracing::error!("Departure of {} failed: {}", self.address, e);
        }
        self.shutdown();
    }

    fn spawn_worker(self: &Arc<Self>, conn: Connection) {
        let service = self.clone();
        self.spawn_tracked(async move { service.worker(conn).await });
    }

    /// Spawns `task` as a worker that shutdown waits for. Its entry leaves
    /// the registry when the task ends, panics included.
    pub(crate) fn spawn_tracked<F>(self: &Arc<Self>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let slot = WorkerSlot {
            service: self.clone(),
            id,
        };
        let handle = tokio::spawn(async move {
            let _slot = slot;
            task.await;
        });
        self.workers.insert(id, handle);
        // The task may have ended before its handle was registered.
        self.workers.remove_if(&id, |_, handle| handle.is_finished());
    }

    /// Number of connection workers currently registered.
    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    async fn drain_workers(&self) {
        loop {
            let ids: Vec<u64> = self.workers.iter().map(|entry| *entry.key()).collect();
            if ids.is_empty() {
                return;
            }
            for id in ids {
                if let Some((_, handle)) = self.workers.remove(&id) {
                    if let Err(e) = handle.await {
                        tracing::error!("Worker {} panicked: {}", id, e);
                    }
                }
            }
        }
    }

    async fn worker(self: Arc<Self>, mut conn: Connection) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let peer = conn.peer().to_string();

        let outcome: OverlayResult<()> = loop {
            if *shutdown_rx.borrow() {
                break Ok(());
            }
            let line = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break Ok(()),
                line = conn.recv_line() => line,
            };
            match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    if let Err(e) = self.process(&mut conn, &line).await {
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e.into()),
            }
        };

        if let Err(e) = outcome {
            tracing::warn!("Connection from {} ended abnormally: {}", peer, e);
            self.refresh_links().await;
        }
        conn.close().await;
    }

    async fn process(self: &Arc<Self>, conn: &mut Connection, line: &str) -> OverlayResult<()> {
        if line.starts_with(ACK_MARKER) {
            let rest = conn.recv_block().await?;
            tracing::info!("Answer received from {}:\n{}\n{}", conn.peer(), line, rest);
            return Ok(());
        }

        let tag = Tag::from_line(line)?;
        let body = if tag.carries_description() {
            Some(conn.recv_block().await?)
        } else {
            None
        };
        let request = Request::parse(line, body.as_deref(), self.dims)?;
        tracing::debug!("{} handling {}", self.address, line);
        handlers::dispatch(self, conn, request).await
    }

    /// Sends `message` over the link at `level` and checks the reply.
    /// A transport failure marks the link dead.
    pub(crate) async fn forward(
        &self,
        level: usize,
        link: PeerLink,
        message: &str,
        tag: Tag,
    ) -> OverlayResult<()> {
        let (peer, reply) = {
            let mut conn = link.lock().await;
            (conn.peer().to_string(), conn.request(message).await)
        };
        match reply {
            Ok(reply) if tag.is_ok_reply(&reply) => Ok(()),
            Ok(reply) => Err(OverlayError::Rejected { peer, reply }),
            Err(e) => {
                self.mark_dead(level, &link).await;
                self.relink(level).await;
                Err(OverlayError::link(level, peer, e))
            }
        }
    }

    /// Opens a fresh connection for `level` if it has none. A late reply
    /// left on a timed-out connection makes it unusable, but the sibling
    /// itself may be healthy.
    async fn relink(&self, level: usize) {
        let sibling = {
            let state = self.state.lock().await;
            match state.splits().get(level) {
                Some(split) if split.link.is_none() => split.sibling.clone(),
                _ => return,
            }
        };
        match Connection::open(&sibling, self.receive_timeout).await {
            Ok(conn) => {
                let mut state = self.state.lock().await;
                let still_wanted = state
                    .splits()
                    .get(level)
                    .is_some_and(|s| s.sibling == sibling && s.link.is_none());
                if still_wanted {
                    tracing::info!("{} relinked level {} to {}", self.address, level, sibling);
                    state.set_link(level, Some(Arc::new(Mutex::new(conn))));
                }
            }
            Err(e) => {
                tracing::warn!("{} cannot relink level {} to {}: {}", self.address, level, sibling, e);
            }
        }
    }

    pub(crate) async fn mark_dead(&self, level: usize, link: &PeerLink) {
        let mut state = self.state.lock().await;
        if state.link(level).is_some_and(|current| Arc::ptr_eq(&current, link)) {
            tracing::warn!("{} lost its link at level {}", self.address, level);
            state.set_link(level, None);
        }
    }

    /// Opens connections for every split level that has none.
    pub(crate) async fn link_unlinked(&self) {
        let pending = self.state.lock().await.unlinked_levels();
        for (level, sibling) in pending {
            match Connection::open(&sibling, self.receive_timeout).await {
                Ok(conn) => {
                    let mut state = self.state.lock().await;
                    let still_wanted = state
                        .splits()
                        .get(level)
                        .is_some_and(|s| s.sibling == sibling && s.link.is_none());
                    if still_wanted {
                        tracing::debug!("Linked level {} to {}", level, sibling);
                        state.set_link(level, Some(Arc::new(Mutex::new(conn))));
                    }
                }
                Err(e) => {
                    tracing::warn!("Unable to link level {} to {}: {}", level, sibling, e);
                }
            }
        }
    }

    /// Probes every live link with a `W` request and drops those that fail.
    async fn refresh_links(&self) {
        let links = self.state.lock().await.live_links();
        let probe = Request::Whois.to_string();
        for (level, link) in links {
            let result = {
                let mut conn = link.lock().await;
                match conn.send(&probe).await {
                    Ok(()) => conn.recv_block().await.map(|_| ()),
                    Err(e) => Err(e),
                }
            };
            if let Err(e) = result {
                tracing::debug!("Probe of level {} failed: {}", level, e);
                self.mark_dead(level, &link).await;
            }
        }
    }

    async fn unlink(&self) {
        let links = self.state.lock().await.take_links();
        for link in links {
            link.lock().await.close().await;
        }
    }

    /// Sends this node's description, and those of any cached orphans, to
    /// the sibling of the newest split as merge requests.
    pub async fn depart(&self) -> OverlayResult<()> {
        let (partner, messages) = {
            let mut state = self.state.lock().await;
            let partner = match state.splits().last() {
                Some(last) => last.sibling.clone(),
                None => {
                    tracing::info!("Root node {} departs without a merge partner", self.address);
                    return Ok(());
                }
            };
            let mut messages = Vec::new();
            if let Some(target) = state.id().sibling() {
                messages.push(
                    Request::Merge {
                        target,
                        description: state.describe(true),
                    }
                    .to_string(),
                );
            }
            for orphan in state.take_orphans() {
                if let Some(target) = orphan.id().sibling() {
                    messages.push(
                        Request::Merge {
                            target,
                            description: orphan.describe(true),
                        }
                        .to_string(),
                    );
                }
            }
            (partner, messages)
        };

        tracing::info!("{} departing, handing region to {}", self.address, partner);
        let mut conn = Connection::open(&partner, self.receive_timeout).await?;
        for message in messages {
            let reply = conn.request(&message).await?;
            if !Tag::Merge.is_ok_reply(&reply) {
                conn.close().await;
                return Err(OverlayError::Rejected {
                    peer: partner.to_string(),
                    reply,
                });
            }
        }
        conn.close().await;
        Ok(())
    }
}

/// Removes a worker's registry entry when its task finishes or unwinds.
struct WorkerSlot {
    service: Arc<OverlayService>,
    id: u64,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.service.workers.remove(&self.id);
    }
}
