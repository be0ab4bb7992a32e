//! Peer mesh connection fabric. Mirrors a one-sided remote-write device:
//! posting returns as soon as the frame is handed to the peer's messenger
//! task, optional completions are acked by the remote side per work ID, and
//! a completion with non-success status marks the connection failed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::time::Duration as StdDuration;

use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry,
    tcp_connect_with_retry, Deadline, SquallError,
};
use crate::transport::endpoint::{
    QpEndpoint, QpState, QP_EXCHANGE_BLOB_SIZE,
};
use crate::NodeId;

use bytes::BytesMut;

use get_size::GetSize;

use rand::prelude::*;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Work request ID type, unique per posted completion-tracked write.
pub(crate) type WorkId = u64;

/// Events surfaced by the fabric outside the normal message stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FabricEvent {
    /// The connection to a peer errored; it is now marked failed.
    PeerFailed(NodeId),
}

/// Frame wrapper exchanged between peer messengers.
#[derive(Debug, Clone, Serialize, Deserialize, GetSize)]
enum PeerFrame<Msg> {
    /// Normal payload message; `work` non-null requests a completion ack.
    Msg { msg: Msg, work: Option<WorkId> },

    /// Completion ack for a work ID.
    Ack { work: WorkId },

    /// Barrier-sync marker.
    Barrier { tag: u64 },
}

/// Tracks outstanding completion-requested posts.
struct CompletionTable {
    pending: StdMutex<HashMap<WorkId, PendingCompletion>>,
    cond: Condvar,
}

struct PendingCompletion {
    remaining: HashSet<NodeId>,
    failed: Vec<NodeId>,
}

impl CompletionTable {
    fn new() -> Self {
        CompletionTable {
            pending: StdMutex::new(HashMap::new()),
            cond: Condvar::new(),
        }
    }

    fn register(&self, work: WorkId, peers: &[NodeId]) {
        let mut pending = self.pending.lock().unwrap();
        pending.insert(
            work,
            PendingCompletion {
                remaining: peers.iter().copied().collect(),
                failed: Vec::new(),
            },
        );
    }

    fn complete(&self, peer: NodeId, work: WorkId) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(entry) = pending.get_mut(&work) {
            entry.remaining.remove(&peer);
        }
        self.cond.notify_all();
    }

    /// Marks the peer failed in every outstanding entry.
    fn fail_peer(&self, peer: NodeId) {
        let mut pending = self.pending.lock().unwrap();
        for entry in pending.values_mut() {
            if entry.remaining.remove(&peer) {
                entry.failed.push(peer);
            }
        }
        self.cond.notify_all();
    }

    /// Blocks until all acks for `work` arrived, a peer failed, or timeout.
    /// Peers that did not ack in time are returned as failed.
    fn wait(
        &self,
        work: WorkId,
        timeout: StdDuration,
    ) -> Result<(), Vec<NodeId>> {
        let deadline = Deadline::after(timeout);
        let mut pending = self.pending.lock().unwrap();
        loop {
            let entry = match pending.get(&work) {
                Some(e) => e,
                None => return Ok(()), // unknown work ID: treat as done
            };
            if !entry.failed.is_empty() {
                let failed = pending.remove(&work).unwrap().failed;
                return Err(failed);
            }
            if entry.remaining.is_empty() {
                pending.remove(&work);
                return Ok(());
            }

            if deadline.expired() {
                let silent: Vec<NodeId> = pending
                    .remove(&work)
                    .unwrap()
                    .remaining
                    .into_iter()
                    .collect();
                return Err(silent);
            }
            let (guard, _) = self
                .cond
                .wait_timeout(pending, deadline.remaining())
                .unwrap();
            pending = guard;
        }
    }
}

/// Tracks barrier markers received per tag.
struct BarrierTable {
    arrived: StdMutex<HashMap<u64, HashSet<NodeId>>>,
    cond: Condvar,
}

impl BarrierTable {
    fn new() -> Self {
        BarrierTable {
            arrived: StdMutex::new(HashMap::new()),
            cond: Condvar::new(),
        }
    }

    fn deposit(&self, peer: NodeId, tag: u64) {
        let mut arrived = self.arrived.lock().unwrap();
        arrived.entry(tag).or_default().insert(peer);
        self.cond.notify_all();
    }

    fn wait(
        &self,
        tag: u64,
        peers: &[NodeId],
        failed: &StdMutex<HashSet<NodeId>>,
        timeout: StdDuration,
    ) -> Result<(), SquallError> {
        let deadline = Deadline::after(timeout);
        let mut arrived = self.arrived.lock().unwrap();
        loop {
            {
                let failed = failed.lock().unwrap();
                let seen = arrived.entry(tag).or_default();
                if peers
                    .iter()
                    .all(|p| seen.contains(p) || failed.contains(p))
                {
                    arrived.remove(&tag);
                    return Ok(());
                }
            }
            if deadline.expired() {
                return Err(SquallError(format!(
                    "barrier {} timed out",
                    tag
                )));
            }
            let (guard, _) = self
                .cond
                .wait_timeout(arrived, deadline.remaining())
                .unwrap();
            arrived = guard;
        }
    }
}

/// State shared between the fabric handle, acceptor, and messenger tasks.
struct FabricShared<Msg> {
    me: NodeId,
    endpoint: QpEndpoint,
    tx_recv: mpsc::UnboundedSender<(NodeId, Msg)>,
    tx_event: mpsc::UnboundedSender<FabricEvent>,
    completions: CompletionTable,
    barriers: BarrierTable,
    failed: StdMutex<HashSet<NodeId>>,
}

impl<Msg> FabricShared<Msg> {
    /// Marks a peer failed: pending completions resolve failed, the GMS
    /// gets a failure event, future posts error synchronously.
    fn mark_failed(&self, peer: NodeId) {
        let newly = self.failed.lock().unwrap().insert(peer);
        if newly {
            pf_warn!(self.me; "fabric connection to {} marked failed", peer);
            self.completions.fail_peer(peer);
            // barrier waiters re-check the failed set on every wakeup
            self.barriers.cond.notify_all();
            let _ = self.tx_event.send(FabricEvent::PeerFailed(peer));
        }
    }
}

/// Connection fabric between group members.
pub(crate) struct Fabric<Msg> {
    shared: Arc<FabricShared<Msg>>,

    /// Map from peer ID -> sender side of its messenger's send channel,
    /// shared with the peer acceptor task.
    tx_sends: flashmap::ReadHandle<
        NodeId,
        mpsc::UnboundedSender<PeerFrame<Msg>>,
    >,

    /// Receiver side of the recv channel; taken once by the frame router.
    rx_recv: StdMutex<Option<mpsc::UnboundedReceiver<(NodeId, Msg)>>>,

    /// Receiver side of the failure-event channel; taken once by the GMS.
    rx_event: StdMutex<Option<mpsc::UnboundedReceiver<FabricEvent>>>,

    /// Sender side of the connect channel, used when proactively
    /// connecting to some peer.
    tx_connect: mpsc::UnboundedSender<(
        NodeId,
        SocketAddr,
        oneshot::Sender<Result<QpEndpoint, SquallError>>,
    )>,

    /// Next work request ID to assign.
    next_work: AtomicU64,

    /// Join handle of the peer acceptor task.
    _acceptor_handle: JoinHandle<()>,
}

impl<Msg> Fabric<Msg>
where
    Msg: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + GetSize
        + Send
        + Sync
        + 'static,
{
    /// Creates a new connection fabric listening on the given address.
    /// Spawns the peer acceptor task. Must be called within a runtime.
    pub(crate) async fn new_and_setup(
        me: NodeId,
        listen_addr: SocketAddr,
    ) -> Result<Self, SquallError> {
        let listener = tcp_bind_with_retry(listen_addr, 10).await?;
        let endpoint = QpEndpoint::from_listener(
            listener.local_addr()?,
            me,
            0,
            thread_rng().gen(),
        );

        let (tx_recv, rx_recv) = mpsc::unbounded_channel();
        let (tx_event, rx_event) = mpsc::unbounded_channel();
        let (tx_connect, rx_connect) = mpsc::unbounded_channel();

        let (tx_sends_write, tx_sends_read) = flashmap::new::<
            NodeId,
            mpsc::UnboundedSender<PeerFrame<Msg>>,
        >();

        let shared = Arc::new(FabricShared {
            me,
            endpoint,
            tx_recv,
            tx_event,
            completions: CompletionTable::new(),
            barriers: BarrierTable::new(),
            failed: StdMutex::new(HashSet::new()),
        });

        let mut acceptor = FabricAcceptorTask::new(
            shared.clone(),
            listener,
            tx_sends_write,
            rx_connect,
        );
        let acceptor_handle =
            tokio::spawn(async move { acceptor.run().await });

        Ok(Fabric {
            shared,
            tx_sends: tx_sends_read,
            rx_recv: StdMutex::new(Some(rx_recv)),
            rx_event: StdMutex::new(Some(rx_event)),
            tx_connect,
            next_work: AtomicU64::new(1),
            _acceptor_handle: acceptor_handle,
        })
    }

    /// My own endpoint info as exchanged with peers.
    pub(crate) fn local_endpoint(&self) -> &QpEndpoint {
        &self.shared.endpoint
    }

    /// The listen address peers should connect to.
    pub(crate) fn listen_addr(&self) -> SocketAddr {
        let ep = &self.shared.endpoint;
        let ip6 = std::net::Ipv6Addr::from(ep.gid);
        match ip6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(v4.into(), ep.lid),
            None => SocketAddr::new(ip6.into(), ep.lid),
        }
    }

    /// Connects to a peer proactively; returns its endpoint info once the
    /// exchange and pair setup completed.
    pub(crate) async fn connect_to_peer(
        &self,
        id: NodeId,
        peer_addr: SocketAddr,
    ) -> Result<QpEndpoint, SquallError> {
        let (tx_done, rx_done) = oneshot::channel();
        self.tx_connect
            .send((id, peer_addr, tx_done))
            .map_err(SquallError::msg)?;
        rx_done.await?
    }

    /// Gets the set of currently connected, non-failed peers.
    pub(crate) fn connected_peers(&self) -> Vec<NodeId> {
        let failed = self.shared.failed.lock().unwrap();
        let guard = self.tx_sends.guard();
        guard
            .keys()
            .copied()
            .filter(|p| !failed.contains(p))
            .collect()
    }

    /// Waits until connections to at least the given peers exist.
    pub(crate) async fn wait_for_peers(
        &self,
        peers: &[NodeId],
    ) -> Result<(), SquallError> {
        loop {
            {
                let guard = self.tx_sends.guard();
                if peers
                    .iter()
                    .all(|p| *p == self.shared.me || guard.contains_key(p))
                {
                    return Ok(());
                }
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Takes the receiver side of the message channel. Panics if taken
    /// twice; exactly one frame router owns it.
    pub(crate) fn take_receiver(
        &self,
    ) -> mpsc::UnboundedReceiver<(NodeId, Msg)> {
        self.rx_recv
            .lock()
            .unwrap()
            .take()
            .expect("fabric receiver already taken")
    }

    /// Takes the receiver side of the failure-event channel.
    pub(crate) fn take_event_rx(
        &self,
    ) -> mpsc::UnboundedReceiver<FabricEvent> {
        self.rx_event
            .lock()
            .unwrap()
            .take()
            .expect("fabric event receiver already taken")
    }

    /// Posts a message to a peer. Returns once the frame is handed to the
    /// peer's messenger; posts to a failed peer error synchronously.
    pub(crate) fn post(
        &self,
        peer: NodeId,
        msg: Msg,
    ) -> Result<(), SquallError> {
        self.post_inner(peer, PeerFrame::Msg { msg, work: None })
    }

    /// Posts a message to each given peer with a shared work ID; acks are
    /// collected by `wait_completion`.
    pub(crate) fn post_with_completion(
        &self,
        peers: &[NodeId],
        msg: Msg,
    ) -> Result<WorkId, SquallError> {
        let work = self.next_work.fetch_add(1, Ordering::Relaxed);
        self.shared.completions.register(work, peers);
        for &peer in peers {
            if let Err(e) = self.post_inner(
                peer,
                PeerFrame::Msg {
                    msg: msg.clone(),
                    work: Some(work),
                },
            ) {
                if self.is_failed(peer) {
                    pf_debug!(self.shared.me;
                              "post to {} failed eagerly: {}", peer, e);
                    self.shared.completions.fail_peer(peer);
                } else {
                    // not connected yet: excuse rather than condemn
                    self.shared.completions.complete(peer, work);
                }
            }
        }
        Ok(work)
    }

    /// Blocks the calling (OS) thread until all acks for `work` arrived.
    /// Not to be called from async context.
    pub(crate) fn wait_completion(
        &self,
        work: WorkId,
        timeout: StdDuration,
    ) -> Result<(), Vec<NodeId>> {
        self.shared.completions.wait(work, timeout)
    }

    /// Runs a barrier round with the given peers: posts a marker to each
    /// and blocks until everyone's marker with the same tag arrived (failed
    /// peers are excused). Not to be called from async context.
    pub(crate) fn barrier(
        &self,
        tag: u64,
        peers: &[NodeId],
        timeout: StdDuration,
    ) -> Result<(), SquallError> {
        for &peer in peers {
            if peer == self.shared.me {
                continue;
            }
            // a failed peer cannot hold up the barrier
            let _ = self.post_inner(peer, PeerFrame::Barrier { tag });
        }
        let others: Vec<NodeId> = peers
            .iter()
            .copied()
            .filter(|&p| p != self.shared.me)
            .collect();
        self.shared.barriers.wait(
            tag,
            &others,
            &self.shared.failed,
            timeout,
        )
    }

    /// Marks a peer's connection failed; all of its pending completions
    /// resolve as failed and future posts error synchronously.
    pub(crate) fn mark_failed(&self, peer: NodeId) {
        self.shared.mark_failed(peer);
    }

    /// True if this peer has been marked failed.
    pub(crate) fn is_failed(&self, peer: NodeId) -> bool {
        self.shared.failed.lock().unwrap().contains(&peer)
    }

    fn post_inner(
        &self,
        peer: NodeId,
        frame: PeerFrame<Msg>,
    ) -> Result<(), SquallError> {
        if self.shared.failed.lock().unwrap().contains(&peer) {
            return Err(SquallError(format!(
                "peer {} connection has failed",
                peer
            )));
        }
        let guard = self.tx_sends.guard();
        match guard.get(&peer) {
            Some(tx_send) => {
                tx_send.send(frame).map_err(SquallError::msg)
            }
            None => {
                Err(SquallError(format!("peer {} not connected", peer)))
            }
        }
    }
}

/// Fabric peer acceptor task.
struct FabricAcceptorTask<Msg> {
    shared: Arc<FabricShared<Msg>>,

    listener: TcpListener,
    tx_sends: flashmap::WriteHandle<
        NodeId,
        mpsc::UnboundedSender<PeerFrame<Msg>>,
    >,
    messenger_handles: HashMap<NodeId, JoinHandle<()>>,

    rx_connect: mpsc::UnboundedReceiver<(
        NodeId,
        SocketAddr,
        oneshot::Sender<Result<QpEndpoint, SquallError>>,
    )>,

    tx_exit: mpsc::UnboundedSender<NodeId>,
    rx_exit: mpsc::UnboundedReceiver<NodeId>,
}

impl<Msg> FabricAcceptorTask<Msg>
where
    Msg: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + GetSize
        + Send
        + Sync
        + 'static,
{
    fn new(
        shared: Arc<FabricShared<Msg>>,
        listener: TcpListener,
        tx_sends: flashmap::WriteHandle<
            NodeId,
            mpsc::UnboundedSender<PeerFrame<Msg>>,
        >,
        rx_connect: mpsc::UnboundedReceiver<(
            NodeId,
            SocketAddr,
            oneshot::Sender<Result<QpEndpoint, SquallError>>,
        )>,
    ) -> Self {
        // exit channel notifies about terminated peer messenger tasks
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();

        FabricAcceptorTask {
            shared,
            listener,
            tx_sends,
            messenger_handles: HashMap::new(),
            rx_connect,
            tx_exit,
            rx_exit,
        }
    }

    /// Walks a fresh pair through its setup states; pure bookkeeping here
    /// but keeps the setup order explicit.
    fn bring_up_pair(me: NodeId, peer: NodeId) -> Result<(), SquallError> {
        let mut state = QpState::Reset;
        while state != QpState::ReadyToSend {
            state = state.advance()?;
        }
        pf_trace!(me; "pair to {} ready to send", peer);
        Ok(())
    }

    /// Connects to a peer proactively and performs the endpoint exchange.
    async fn connect_new_peer(
        &mut self,
        id: NodeId,
        conn_addr: SocketAddr,
    ) -> Result<QpEndpoint, SquallError> {
        pf_debug!(self.shared.me;
                  "connecting to peer {} '{}'...", id, conn_addr);
        let mut stream = tcp_connect_with_retry(conn_addr, 10).await?;
        stream.write_u32(self.shared.me).await?; // send my ID
        stream.write_all(&self.shared.endpoint.to_blob()).await?;

        let mut peer_blob = [0u8; QP_EXCHANGE_BLOB_SIZE];
        stream.read_exact(&mut peer_blob).await?;
        let peer_endpoint = QpEndpoint::from_blob(&peer_blob)?;

        // dummy sync byte exchange so both sides finish setup together
        stream.write_u8(b'B').await?;
        stream.read_u8().await?;

        Self::bring_up_pair(self.shared.me, id)?;
        self.register_peer(id, stream)?;
        pf_debug!(self.shared.me; "connected to peer {}", id);
        Ok(peer_endpoint)
    }

    /// Accepts a new peer connection and performs the endpoint exchange.
    async fn accept_new_peer(
        &mut self,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), SquallError> {
        let id = stream.read_u32().await?; // receive peer's ID
        let mut peer_blob = [0u8; QP_EXCHANGE_BLOB_SIZE];
        stream.read_exact(&mut peer_blob).await?;
        let _peer_endpoint = QpEndpoint::from_blob(&peer_blob)?;

        stream.write_all(&self.shared.endpoint.to_blob()).await?;
        stream.read_u8().await?;
        stream.write_u8(b'B').await?;

        Self::bring_up_pair(self.shared.me, id)?;
        self.register_peer(id, stream)?;
        pf_debug!(self.shared.me; "accepted peer {} '{}'", id, addr);
        Ok(())
    }

    fn register_peer(
        &mut self,
        id: NodeId,
        stream: TcpStream,
    ) -> Result<(), SquallError> {
        if self.messenger_handles.contains_key(&id) {
            return logged_err!(self.shared.me;
                               "duplicate peer ID: {}", id);
        }
        // a reconnecting peer clears its failed mark
        self.shared.failed.lock().unwrap().remove(&id);

        let (tx_send, rx_send) = mpsc::unbounded_channel();
        let mut tx_sends_guard = self.tx_sends.guard();
        tx_sends_guard.insert(id, tx_send);
        drop(tx_sends_guard);

        let mut messenger = FabricMessengerTask::new(
            self.shared.clone(),
            id,
            stream,
            rx_send,
            self.tx_exit.clone(),
        );
        let handle = tokio::spawn(async move { messenger.run().await });
        self.messenger_handles.insert(id, handle);
        Ok(())
    }

    /// Removes a peer whose messenger task has exited.
    fn remove_peer(&mut self, id: NodeId) {
        let mut tx_sends_guard = self.tx_sends.guard();
        tx_sends_guard.remove(id);
        drop(tx_sends_guard);
        self.messenger_handles.remove(&id);
        self.shared.mark_failed(id);
    }

    /// Starts the peer acceptor task loop.
    async fn run(&mut self) {
        pf_debug!(self.shared.me; "fabric acceptor task spawned");

        loop {
            tokio::select! {
                // receives a peer connection
                accepted = self.listener.accept() => {
                    if let Err(e) = accepted {
                        pf_error!(self.shared.me; "error accepting: {}", e);
                        continue;
                    }
                    let (stream, addr) = accepted.unwrap();
                    if let Err(e) = self.accept_new_peer(stream, addr).await {
                        pf_error!(self.shared.me;
                                  "error accepting peer '{}': {}", addr, e);
                    }
                },

                // proactive connect request
                to_connect = self.rx_connect.recv() => {
                    match to_connect {
                        Some((id, addr, tx_done)) => {
                            let result =
                                self.connect_new_peer(id, addr).await;
                            let _ = tx_done.send(result);
                        },
                        None => break, // fabric handle dropped
                    }
                },

                // a peer messenger task exited
                exited = self.rx_exit.recv() => {
                    if let Some(id) = exited {
                        self.remove_peer(id);
                    }
                },
            }
        }

        pf_debug!(self.shared.me; "fabric acceptor task exited");
    }
}

/// Fabric per-peer messenger task.
struct FabricMessengerTask<Msg> {
    shared: Arc<FabricShared<Msg>>,
    peer: NodeId,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,
    read_buf: BytesMut,
    write_buf: BytesMut,
    write_buf_cursor: usize,

    /// Frames awaiting the socket (sends from the owner plus our acks).
    write_queue: VecDeque<PeerFrame<Msg>>,

    rx_send: mpsc::UnboundedReceiver<PeerFrame<Msg>>,
    tx_exit: mpsc::UnboundedSender<NodeId>,
}

impl<Msg> FabricMessengerTask<Msg>
where
    Msg: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + GetSize
        + Send
        + Sync
        + 'static,
{
    fn new(
        shared: Arc<FabricShared<Msg>>,
        peer: NodeId,
        stream: TcpStream,
        rx_send: mpsc::UnboundedReceiver<PeerFrame<Msg>>,
        tx_exit: mpsc::UnboundedSender<NodeId>,
    ) -> Self {
        let (conn_read, conn_write) = stream.into_split();
        FabricMessengerTask {
            shared,
            peer,
            conn_read,
            conn_write,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            write_buf_cursor: 0,
            write_queue: VecDeque::new(),
            rx_send,
            tx_exit,
        }
    }

    /// Pushes queued frames into the socket until it would block or the
    /// queue drains.
    fn flush_writes(&mut self) -> Result<(), SquallError> {
        loop {
            if !self.write_buf.is_empty() {
                // partial frame pending from an earlier would-block
                if !safe_tcp_write::<PeerFrame<Msg>, _>(
                    &mut self.write_buf,
                    &mut self.write_buf_cursor,
                    &self.conn_write,
                    None,
                )? {
                    return Ok(()); // still would block
                }
            }
            match self.write_queue.pop_front() {
                Some(frame) => {
                    if !safe_tcp_write(
                        &mut self.write_buf,
                        &mut self.write_buf_cursor,
                        &self.conn_write,
                        Some(&frame),
                    )? {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            }
        }
    }

    /// Handles an incoming frame from the peer.
    fn handle_frame(
        &mut self,
        frame: PeerFrame<Msg>,
    ) -> Result<(), SquallError> {
        match frame {
            PeerFrame::Msg { msg, work } => {
                self.shared
                    .tx_recv
                    .send((self.peer, msg))
                    .map_err(SquallError::msg)?;
                if let Some(work) = work {
                    // ack only after handing the frame upward
                    self.write_queue.push_back(PeerFrame::Ack { work });
                }
            }
            PeerFrame::Ack { work } => {
                self.shared.completions.complete(self.peer, work);
            }
            PeerFrame::Barrier { tag } => {
                self.shared.barriers.deposit(self.peer, tag);
            }
        }
        Ok(())
    }

    /// Starts the per-peer messenger task loop.
    async fn run(&mut self) {
        pf_debug!(self.shared.me;
                  "messenger task for peer {} spawned", self.peer);

        loop {
            let write_pending = !self.write_queue.is_empty()
                || !self.write_buf.is_empty();

            let result: Result<(), SquallError> = tokio::select! {
                // a frame to send to this peer
                to_send = self.rx_send.recv() => {
                    match to_send {
                        Some(frame) => {
                            self.write_queue.push_back(frame);
                            self.flush_writes()
                        },
                        None => break, // fabric dropped, exit quietly
                    }
                },

                // an incoming frame from this peer
                frame = safe_tcp_read(
                    &mut self.read_buf, &mut self.conn_read
                ) => {
                    frame.and_then(|frame| {
                        self.handle_frame(frame)?;
                        self.flush_writes()
                    })
                },

                // retry a would-blocked write after a short pause
                () = time::sleep(Duration::from_millis(1)),
                        if write_pending => {
                    self.flush_writes()
                },
            };

            if let Err(e) = result {
                pf_warn!(self.shared.me;
                         "messenger for peer {} erroring out: {}",
                         self.peer, e);
                let _ = self.tx_exit.send(self.peer);
                break;
            }
        }

        pf_debug!(self.shared.me;
                  "messenger task for peer {} exited", self.peer);
    }
}

#[cfg(test)]
mod fabric_tests {
    use super::*;

    #[derive(
        Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize,
    )]
    struct TestMsg(u64, Vec<u8>);

    async fn linked_pair(
    ) -> Result<(Fabric<TestMsg>, Fabric<TestMsg>), SquallError> {
        let fab_a =
            Fabric::new_and_setup(1, "127.0.0.1:0".parse()?).await?;
        let fab_b =
            Fabric::new_and_setup(2, "127.0.0.1:0".parse()?).await?;
        fab_a.connect_to_peer(2, fab_b.listen_addr()).await?;
        fab_b.wait_for_peers(&[1]).await?;
        Ok((fab_a, fab_b))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn post_and_receive() -> Result<(), SquallError> {
        let (fab_a, fab_b) = linked_pair().await?;
        let mut rx_b = fab_b.take_receiver();

        fab_a.post(2, TestMsg(7, vec![1, 2, 3]))?;
        let (from, msg) = rx_b.recv().await.unwrap();
        assert_eq!(from, 1);
        assert_eq!(msg, TestMsg(7, vec![1, 2, 3]));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn completion_acked() -> Result<(), SquallError> {
        let (fab_a, fab_b) = linked_pair().await?;
        let mut rx_b = fab_b.take_receiver();
        // keep draining b's messages so acks get generated
        tokio::spawn(async move { while rx_b.recv().await.is_some() {} });

        let work =
            fab_a.post_with_completion(&[2], TestMsg(1, vec![9]))?;
        let fab_a = Arc::new(fab_a);
        let waiter = {
            let fab_a = fab_a.clone();
            tokio::task::spawn_blocking(move || {
                fab_a.wait_completion(work, StdDuration::from_secs(5))
            })
        };
        assert!(waiter.await.unwrap().is_ok());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn barrier_two_sided() -> Result<(), SquallError> {
        let (fab_a, fab_b) = linked_pair().await?;
        let fab_a = Arc::new(fab_a);
        let fab_b = Arc::new(fab_b);

        let a = {
            let fab_a = fab_a.clone();
            tokio::task::spawn_blocking(move || {
                fab_a.barrier(42, &[2], StdDuration::from_secs(5))
            })
        };
        let b = {
            let fab_b = fab_b.clone();
            tokio::task::spawn_blocking(move || {
                fab_b.barrier(42, &[1], StdDuration::from_secs(5))
            })
        };
        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn failed_peer_posts_error() -> Result<(), SquallError> {
        let (fab_a, _fab_b) = linked_pair().await?;
        fab_a.mark_failed(2);
        assert!(fab_a.post(2, TestMsg(0, vec![])).is_err());
        assert!(fab_a.is_failed(2));
        Ok(())
    }
}
