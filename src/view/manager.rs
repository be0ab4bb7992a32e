//! The membership service: proposes joins, turns suspicions into
//! membership changes, runs the view-change protocol with ragged-edge
//! cleanup, and installs new views. All protocol state machines live in
//! trigger predicates over the GMS columns of the shared-state table.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::{
    SocketAddr, TcpListener as StdTcpListener,
    TcpStream as StdTcpStream,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex, RwLock};
use std::thread;
use std::time::Duration;

use crate::multicast::{
    CallbackSet, Carryover, McastParams, MulticastGroup, SendBuffer,
};
use crate::persist::{save_view, PersistHub};
use crate::rdmc::RdmcEngine;
use crate::sst::{
    ChangeKind, ChangeProposal, MemberRank, PredicateKind, RowRange,
    RowShape, SharedStateTable, PredicateEngine,
};
use crate::transport::{Fabric, FabricEvent, WireMsg};
use crate::utils::{Bitmap, Deadline, SquallError};
use crate::view::{MemberAddrs, SubgroupSpec, View};
use crate::{NodeId, SubgroupId};

use serde::{Deserialize, Serialize};

use tokio::runtime::Handle;

/// How long the view-change protocol waits on any single peer step.
const VIEW_CHANGE_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// First message on a join socket: who wants in, and where to reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct JoinRequest {
    pub(crate) node_id: NodeId,
    pub(crate) addrs: MemberAddrs,
}

/// Leader's answer once the join committed: the view including the
/// joiner, the group parameters, and replicated-object state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct JoinCommit {
    pub(crate) view: View,
    pub(crate) params: McastParams,
    pub(crate) rdmc_offset: u16,
    pub(crate) state_blobs: Vec<(String, Vec<u8>)>,
}

/// Writes a length-prefixed serialized blob to a blocking socket.
pub(crate) fn write_blob<T: Serialize>(
    stream: &mut StdTcpStream,
    obj: &T,
) -> Result<(), SquallError> {
    let bytes = rmp_serde::encode::to_vec(obj)?;
    stream.write_all(&(bytes.len() as u64).to_be_bytes())?;
    stream.write_all(&bytes)?;
    Ok(())
}

/// Reads a length-prefixed serialized blob from a blocking socket.
pub(crate) fn read_blob<T: serde::de::DeserializeOwned>(
    stream: &mut StdTcpStream,
) -> Result<T, SquallError> {
    let mut len_buf = [0u8; 8];
    stream.read_exact(&mut len_buf)?;
    let len = u64::from_be_bytes(len_buf) as usize;
    if len > 256 * 1024 * 1024 {
        return Err(SquallError(format!(
            "unreasonable blob length {}",
            len
        )));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(rmp_serde::decode::from_slice(&buf)?)
}

/// Joiner-side handshake: contacts the group leader and blocks until the
/// join has committed and the new view arrives.
pub(crate) fn request_join(
    leader_gms: SocketAddr,
    my_id: NodeId,
    my_addrs: MemberAddrs,
) -> Result<JoinCommit, SquallError> {
    let mut stream = StdTcpStream::connect(leader_gms)?;
    write_blob(
        &mut stream,
        &JoinRequest {
            node_id: my_id,
            addrs: my_addrs,
        },
    )?;
    read_blob(&mut stream)
}

/// A join connection waiting to be proposed.
struct PendingJoin {
    stream: StdTcpStream,
    req: JoinRequest,
}

/// Provides serialized replicated-object state for joiners, keyed by
/// subgroup type name.
pub(crate) type StateProvider =
    Box<dyn Fn() -> Vec<(String, Vec<u8>)> + Send + Sync>;

/// Installs serialized replicated-object state on a joiner.
pub(crate) type StateInstaller =
    Box<dyn Fn(&str, &[u8]) + Send + Sync>;

/// The view manager. Shared as `Arc`; trigger closures capture the
/// `Arc` directly and the manager never holds back-references into the
/// tables it registers with.
pub(crate) struct ViewManager {
    my_id: NodeId,
    my_addrs: MemberAddrs,
    spec: SubgroupSpec,
    params: McastParams,
    view_file: Option<PathBuf>,
    callbacks: CallbackSet,
    persist: Option<Arc<PersistHub>>,

    fabric: Arc<Fabric<WireMsg>>,
    rdmc: Arc<RdmcEngine>,
    handle: Handle,

    /// The current view; replaced wholesale on suspicion and install.
    curr_view: RwLock<Option<Arc<View>>>,

    /// The current view's table and multicast engine.
    curr_sst: RwLock<Option<Arc<SharedStateTable>>>,
    curr_mcast: RwLock<Option<Arc<MulticastGroup>>>,

    /// Frame-router registry: tables by view ID.
    sst_tables: Arc<StdMutex<HashMap<i32, Arc<SharedStateTable>>>>,

    /// Join sockets accepted but not yet proposed.
    pending_joins: StdMutex<VecDeque<PendingJoin>>,
    pending_join_cv: Condvar,

    /// The one join currently in flight, if any.
    proposed_join: StdMutex<Option<PendingJoin>>,

    /// Member ranks whose suspicion was already processed, so the
    /// suspicion predicate can spot row deltas.
    last_suspected: StdMutex<Bitmap>,

    /// True while a view change is executing.
    transition_in_progress: AtomicBool,

    /// Global shutdown flag.
    shutdown: AtomicBool,

    /// Latest installed vid, paired with `view_cv` for waiting.
    installed_vid: StdMutex<i32>,
    view_cv: Condvar,

    /// Evaluator threads of all tables spawned so far.
    evaluator_handles: StdMutex<Vec<thread::JoinHandle<()>>>,

    /// Replicated-object state transfer seams.
    state_provider: Option<StateProvider>,
    state_installer: Option<StateInstaller>,
}

impl ViewManager {
    /// Creates the view manager and spawns the frame router, the
    /// failure-event forwarder, and the join listener thread.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        my_id: NodeId,
        gms_listener: StdTcpListener,
        fabric_addr: SocketAddr,
        spec: SubgroupSpec,
        params: McastParams,
        view_file: Option<PathBuf>,
        callbacks: CallbackSet,
        persist: Option<Arc<PersistHub>>,
        fabric: Arc<Fabric<WireMsg>>,
        rdmc: Arc<RdmcEngine>,
        handle: Handle,
        state_provider: Option<StateProvider>,
        state_installer: Option<StateInstaller>,
    ) -> Result<Arc<ViewManager>, SquallError> {
        let my_addrs = MemberAddrs {
            fabric: fabric_addr,
            gms: gms_listener.local_addr()?,
        };
        let vm = Arc::new(ViewManager {
            my_id,
            my_addrs,
            spec,
            params,
            view_file,
            callbacks,
            persist,
            fabric,
            rdmc,
            handle,
            curr_view: RwLock::new(None),
            curr_sst: RwLock::new(None),
            curr_mcast: RwLock::new(None),
            sst_tables: Arc::new(StdMutex::new(HashMap::new())),
            pending_joins: StdMutex::new(VecDeque::new()),
            pending_join_cv: Condvar::new(),
            proposed_join: StdMutex::new(None),
            last_suspected: StdMutex::new(Bitmap::new(1)),
            transition_in_progress: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            installed_vid: StdMutex::new(-1),
            view_cv: Condvar::new(),
            evaluator_handles: StdMutex::new(Vec::new()),
            state_provider,
            state_installer,
        });

        vm.spawn_frame_router();
        vm.spawn_event_forwarder();
        vm.spawn_join_listener(gms_listener)?;
        Ok(vm)
    }

    /// The membership-service listen address (join requests go here).
    pub(crate) fn gms_addr(&self) -> SocketAddr {
        self.my_addrs.gms
    }

    /// This node's listen addresses.
    pub(crate) fn my_addrs(&self) -> MemberAddrs {
        self.my_addrs
    }

    /// Routes incoming fabric frames: row writes to the table of the
    /// matching view, blocks to the block-multicast engine.
    fn spawn_frame_router(self: &Arc<Self>) {
        let mut rx = self.fabric.take_receiver();
        let tables = self.sst_tables.clone();
        let rdmc = self.rdmc.clone();
        self.handle.spawn(async move {
            while let Some((_from, msg)) = rx.recv().await {
                match msg {
                    WireMsg::Row(update) => {
                        let table = tables
                            .lock()
                            .unwrap()
                            .get(&update.vid)
                            .cloned();
                        if let Some(table) = table {
                            table.apply_update(update);
                        }
                    }
                    WireMsg::Block(frame) => {
                        rdmc.on_block(frame);
                    }
                }
            }
        });
    }

    /// Forwards fabric connection failures into failure suspicion.
    fn spawn_event_forwarder(self: &Arc<Self>) {
        let mut rx = self.fabric.take_event_rx();
        let vm = self.clone();
        self.handle.spawn(async move {
            while let Some(event) = rx.recv().await {
                let FabricEvent::PeerFailed(peer) = event;
                let vm = vm.clone();
                tokio::task::spawn_blocking(move || {
                    vm.report_failure(peer);
                });
            }
        });
    }

    /// Join listener thread: accepts connections on the membership
    /// port, reads the join request, and queues the socket.
    fn spawn_join_listener(
        self: &Arc<Self>,
        listener: StdTcpListener,
    ) -> Result<(), SquallError> {
        listener.set_nonblocking(true)?;
        let vm = self.clone();
        thread::Builder::new()
            .name("gms-listener".into())
            .spawn(move || {
                pf_debug!(vm.my_id; "join listener thread spawned");
                while !vm.shutdown.load(Ordering::Acquire) {
                    match listener.accept() {
                        Ok((stream, addr)) => {
                            if let Err(e) =
                                vm.accept_join_conn(stream, addr)
                            {
                                pf_warn!(vm.my_id;
                                         "bad join connection: {}", e);
                            }
                        }
                        Err(ref e)
                            if e.kind()
                                == std::io::ErrorKind::WouldBlock =>
                        {
                            thread::sleep(Duration::from_millis(50));
                        }
                        Err(e) => {
                            pf_error!(vm.my_id;
                                      "join listener error: {}", e);
                            break;
                        }
                    }
                }
                pf_debug!(vm.my_id; "join listener thread exited");
            })
            .expect("spawning join listener should succeed");
        Ok(())
    }

    fn accept_join_conn(
        &self,
        mut stream: StdTcpStream,
        addr: SocketAddr,
    ) -> Result<(), SquallError> {
        stream.set_nonblocking(false)?;
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))?;
        let req: JoinRequest = read_blob(&mut stream)?;
        pf_info!(self.my_id;
                 "join request from node {} at '{}'", req.node_id, addr);
        stream.set_read_timeout(None)?;
        let mut pending = self.pending_joins.lock().unwrap();
        pending.push_back(PendingJoin { stream, req });
        self.pending_join_cv.notify_all();
        Ok(())
    }

    // ------------------------- startup paths -------------------------

    /// Fresh-start leader: waits for the first member to join, then
    /// installs the initial two-member view.
    pub(crate) fn start_fresh(
        self: &Arc<Self>,
    ) -> Result<(), SquallError> {
        pf_info!(self.my_id; "fresh start, awaiting second member...");
        let first_join = {
            let mut pending = self.pending_joins.lock().unwrap();
            loop {
                if let Some(pj) = pending.pop_front() {
                    break pj;
                }
                pending = self
                    .pending_join_cv
                    .wait(pending)
                    .unwrap();
            }
        };

        let view = View::new(
            0,
            vec![self.my_id, first_join.req.node_id],
            vec![self.my_addrs, first_join.req.addrs],
            self.my_id,
            vec![first_join.req.node_id],
            vec![],
            &self.spec,
        )?;
        self.commit_join(first_join, &view, 0)?;
        self.install_view(view, None, 0)
    }

    /// Joiner: installs the view received from the leader's commit.
    pub(crate) fn start_joined(
        self: &Arc<Self>,
        commit: JoinCommit,
    ) -> Result<(), SquallError> {
        let mut view = commit.view;
        view.my_rank =
            view.rank_of(self.my_id).ok_or_else(|| {
                SquallError(
                    "joined view does not contain me".into(),
                )
            })?;
        if let Some(installer) = &self.state_installer {
            for (type_name, blob) in &commit.state_blobs {
                installer(type_name, blob);
            }
        }
        self.install_view(view, None, commit.rdmc_offset)
    }

    /// Restart from logs: the saved view seeds the member identity and
    /// vid; the node comes back as the sole member of a successor view
    /// and accepts joins from there.
    pub(crate) fn start_restarted(
        self: &Arc<Self>,
        saved: View,
    ) -> Result<(), SquallError> {
        let departed: Vec<NodeId> = saved
            .members
            .iter()
            .copied()
            .filter(|&m| m != self.my_id)
            .collect();
        let view = View::new(
            saved.vid + 1,
            vec![self.my_id],
            vec![self.my_addrs],
            self.my_id,
            vec![],
            departed,
            &self.spec,
        )?;
        self.install_view(view, None, 0)
    }

    // ----------------------- public operations -----------------------

    /// The current view.
    pub(crate) fn current_view(&self) -> Option<Arc<View>> {
        self.curr_view.read().unwrap().clone()
    }

    /// Node IDs of the current view's members.
    pub(crate) fn get_members(&self) -> Vec<NodeId> {
        self.current_view()
            .map(|v| v.members.clone())
            .unwrap_or_default()
    }

    /// Reports to the membership service that a node has failed.
    pub(crate) fn report_failure(&self, node: NodeId) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        let view = match self.current_view() {
            Some(view) => view,
            None => return,
        };
        let rank = match view.rank_of(node) {
            Some(rank) => rank,
            None => return,
        };
        pf_warn!(self.my_id; "reporting failure of node {}", node);
        if node != self.my_id {
            self.fabric.mark_failed(node);
        }
        if let Some(sst) = self.curr_sst.read().unwrap().clone() {
            sst.update_local(|row| row.suspected[rank] = true);
            let _ = sst.put(None, RowRange::Gms);
        }
    }

    /// Cleanly departs: report myself failed, give the group a moment
    /// to absorb it, then shut everything down.
    pub(crate) fn leave(&self) {
        self.report_failure(self.my_id);
        thread::sleep(Duration::from_millis(200));
        self.shut_down();
    }

    /// Barrier with all live members of the current view.
    pub(crate) fn barrier_sync(&self) -> Result<(), SquallError> {
        let (sst, view) = match (
            self.curr_sst.read().unwrap().clone(),
            self.current_view(),
        ) {
            (Some(sst), Some(view)) => (sst, view),
            _ => return Err(SquallError("no view installed".into())),
        };
        sst.sync_with_members(
            Some(&view.live_ranks()),
            VIEW_CHANGE_STEP_TIMEOUT,
        )
    }

    /// Hands out a send buffer from the current multicast engine.
    pub(crate) fn get_send_buffer(
        &self,
        subgroup: SubgroupId,
        payload_size: usize,
        pause_sending_turns: u32,
        cooked_send: bool,
        null_send: bool,
    ) -> Option<SendBuffer> {
        let mcast = self.curr_mcast.read().unwrap().clone()?;
        mcast.get_send_buffer(
            subgroup,
            payload_size,
            pause_sending_turns,
            cooked_send,
            null_send,
        )
    }

    /// Schedules a prepared message for sending.
    pub(crate) fn send(&self, buffer: SendBuffer) -> bool {
        match self.curr_mcast.read().unwrap().clone() {
            Some(mcast) => mcast.send(buffer),
            None => false,
        }
    }

    /// Blocks until a view with at least the given vid is installed.
    pub(crate) fn wait_for_vid(
        &self,
        vid: i32,
        timeout: Duration,
    ) -> Result<(), SquallError> {
        let deadline = Deadline::after(timeout);
        let mut installed = self.installed_vid.lock().unwrap();
        while *installed < vid {
            if deadline.expired() {
                return Err(SquallError(format!(
                    "timed out waiting for view {}",
                    vid
                )));
            }
            let (guard, _) = self
                .view_cv
                .wait_timeout(installed, deadline.remaining())
                .unwrap();
            installed = guard;
        }
        Ok(())
    }

    /// Stops every engine; used by `leave` and drop of the group.
    pub(crate) fn shut_down(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mcast) = self.curr_mcast.read().unwrap().clone() {
            mcast.shut_down();
        }
        if let Some(sst) = self.curr_sst.read().unwrap().clone() {
            sst.predicates.shut_down();
        }
        let handles: Vec<thread::JoinHandle<()>> = self
            .evaluator_handles
            .lock()
            .unwrap()
            .drain(..)
            .collect();
        let me = thread::current().id();
        for handle in handles {
            // shutdown may run on an evaluator thread itself
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
    }

    // ------------------------ GMS predicates ------------------------

    fn leader_rank_now(&self) -> MemberRank {
        self.current_view()
            .map(|v| v.leader_rank())
            .unwrap_or(0)
    }

    fn i_am_leader_now(&self) -> bool {
        self.current_view()
            .map(|v| v.i_am_leader())
            .unwrap_or(false)
    }

    /// Registers the membership predicates on a freshly built table.
    fn register_gms_predicates(
        self: &Arc<Self>,
        sst: &Arc<SharedStateTable>,
    ) {
        // 1. suspicion: some row shows a suspicion I have not processed
        let vm = self.clone();
        let pred_vm = vm.clone();
        sst.predicates.insert(
            move |t| {
                let last = pred_vm.last_suspected.lock().unwrap();
                for r in 0..t.num_rows() {
                    let row = t.row(r);
                    for (k, &s) in row.suspected.iter().enumerate() {
                        if s && !last.contains(k) {
                            return true;
                        }
                    }
                }
                false
            },
            move |t| vm.handle_suspicions(t),
            PredicateKind::Recurrent,
        );

        // 2. join proposal (leader only, one join in flight)
        let vm = self.clone();
        let pred_vm = vm.clone();
        sst.predicates.insert(
            move |_t| {
                pred_vm.i_am_leader_now()
                    && !pred_vm.transition_in_progress.load(Ordering::Acquire)
                    && pred_vm.proposed_join.lock().unwrap().is_none()
                    && !pred_vm
                        .pending_joins
                        .lock()
                        .unwrap()
                        .is_empty()
            },
            move |t| vm.handle_join_proposal(t),
            PredicateKind::Recurrent,
        );

        // 3. proposal propagation (non-leaders copy and ack)
        let vm = self.clone();
        let pred_vm = vm.clone();
        sst.predicates.insert(
            move |t| {
                let leader = pred_vm.leader_rank_now();
                leader != t.my_rank()
                    && t.row(leader).num_changes
                        > t.row(t.my_rank()).num_acked
            },
            move |t| vm.handle_copy_proposals(t),
            PredicateKind::Recurrent,
        );

        // 4. commit (leader, once everyone acked)
        let vm = self.clone();
        let pred_vm = vm.clone();
        sst.predicates.insert(
            move |t| {
                if !pred_vm.i_am_leader_now() {
                    return false;
                }
                let my_row = t.row(t.my_rank());
                if my_row.num_committed >= my_row.num_changes {
                    return false;
                }
                let num_changes = my_row.num_changes;
                drop(my_row);
                let view = match pred_vm.current_view() {
                    Some(view) => view,
                    None => return false,
                };
                view.live_ranks()
                    .iter()
                    .all(|&r| t.row(r).num_acked >= num_changes)
            },
            move |t| vm.handle_commit(t),
            PredicateKind::Recurrent,
        );

        // 5. view change (everyone, once the leader committed)
        let vm = self.clone();
        let pred_vm = vm.clone();
        sst.predicates.insert(
            move |t| {
                !pred_vm
                    .transition_in_progress
                    .load(Ordering::Acquire)
                    && t.row(pred_vm.leader_rank_now()).num_committed
                        > 0
            },
            move |t| vm.execute_view_change(t),
            PredicateKind::Recurrent,
        );
    }

    /// Suspicion trigger: absorb newly suspected members into the view,
    /// freeze their connections, and (as leader) propose their removal.
    fn handle_suspicions(
        self: &Arc<Self>,
        t: &SharedStateTable,
    ) {
        // union of all suspicions not yet processed
        let mut newly: Vec<MemberRank> = Vec::new();
        {
            let mut last = self.last_suspected.lock().unwrap();
            for r in 0..t.num_rows() {
                let row = t.row(r);
                for (k, &s) in row.suspected.iter().enumerate() {
                    // stale tables can show ranks past this view's size
                    if s && k < last.capacity() && last.insert(k) {
                        newly.push(k);
                    }
                }
            }
        }
        if newly.is_empty() {
            return;
        }

        // mark failed in the view (copy-on-write swap)
        let mut view = match self.current_view() {
            Some(view) => (*view).clone(),
            None => return,
        };
        for &rank in &newly {
            if view.mark_failed(rank) {
                let failed_id = view.members[rank];
                pf_warn!(self.my_id;
                         "member {} (rank {}) now suspected",
                         failed_id, rank);
                if failed_id != self.my_id {
                    self.fabric.mark_failed(failed_id);
                }
            }
        }
        if 2 * view.num_failed >= view.members.len() {
            // a majority is gone: we may be on the minority side of a
            // partition, so halt this node rather than risk a split
            pf_error!(self.my_id;
                      "potential partitioning: {} of {} members failed; \
                       halting",
                      view.num_failed, view.members.len());
            *self.curr_view.write().unwrap() = Some(Arc::new(view));
            self.shut_down();
            return;
        }
        let i_lead = view.leader_rank() == view.my_rank;
        let failed_ids: Vec<NodeId> =
            newly.iter().map(|&r| view.members[r]).collect();
        *self.curr_view.write().unwrap() = Some(Arc::new(view));

        // adopt the suspicions into my row; leaders also propose the
        // departure changes
        t.update_local(|row| {
            for &rank in &newly {
                row.suspected[rank] = true;
            }
            if i_lead {
                for &id in &failed_ids {
                    let already = row
                        .changes
                        .iter()
                        .any(|c| c.node_id == id);
                    if !already {
                        row.changes.push(ChangeProposal {
                            node_id: id,
                            kind: ChangeKind::Depart,
                            joiner_fabric_addr: None,
                            joiner_gms_addr: None,
                        });
                        row.num_changes += 1;
                    }
                }
                // the leader's own proposals count as acked by itself
                row.num_acked = row.num_changes;
            }
        });
        let _ = t.put(None, RowRange::Gms);
    }

    /// Join-proposal trigger (leader): move one pending join into the
    /// change list.
    fn handle_join_proposal(
        self: &Arc<Self>,
        t: &SharedStateTable,
    ) {
        let pj = {
            let mut pending = self.pending_joins.lock().unwrap();
            match pending.pop_front() {
                Some(pj) => pj,
                None => return,
            }
        };
        let view = match self.current_view() {
            Some(view) => view,
            None => return,
        };
        if view.rank_of(pj.req.node_id).is_some() {
            pf_warn!(self.my_id;
                     "rejecting join of duplicate node {}",
                     pj.req.node_id);
            return; // socket dropped; joiner sees a closed connection
        }
        pf_info!(self.my_id;
                 "proposing join of node {}", pj.req.node_id);
        t.update_local(|row| {
            row.changes.push(ChangeProposal {
                node_id: pj.req.node_id,
                kind: ChangeKind::Join,
                joiner_fabric_addr: Some(pj.req.addrs.fabric),
                joiner_gms_addr: Some(pj.req.addrs.gms),
            });
            row.num_changes += 1;
            row.num_acked = row.num_changes;
        });
        *self.proposed_join.lock().unwrap() = Some(pj);
        let _ = t.put(None, RowRange::Gms);
    }

    /// Proposal-propagation trigger (non-leader): copy the leader's
    /// change list and acknowledge it.
    fn handle_copy_proposals(
        self: &Arc<Self>,
        t: &SharedStateTable,
    ) {
        let leader = self.leader_rank_now();
        let (changes, num_changes) = {
            let row = t.row(leader);
            (row.changes.clone(), row.num_changes)
        };
        pf_debug!(self.my_id;
                  "acking {} proposed changes from leader", num_changes);
        t.update_local(|row| {
            row.changes = changes;
            row.num_changes = num_changes;
            row.num_acked = num_changes;
        });
        let _ = t.put(None, RowRange::Gms);
    }

    /// Commit trigger (leader): everyone acked, raise the commit line.
    fn handle_commit(self: &Arc<Self>, t: &SharedStateTable) {
        // a row acking more changes than proposed has broken protocol
        for r in 0..t.num_rows() {
            let (acked, changes, peer) = {
                let row = t.row(r);
                (row.num_acked, row.num_changes, t.members()[r])
            };
            if acked > changes {
                pf_error!(self.my_id;
                          "protocol violation by {}: acked {} > \
                           proposed {}", peer, acked, changes);
                self.report_failure(peer);
                return;
            }
        }

        let num_changes = t.row(t.my_rank()).num_changes;
        pf_info!(self.my_id;
                 "committing {} membership changes", num_changes);
        t.update_local(|row| row.num_committed = num_changes);
        let _ = t.put(None, RowRange::Gms);
    }

    // ------------------------- view change --------------------------

    /// The view-change trigger: wedge, ragged-edge cleanup, and
    /// installation of the deterministically constructed next view.
    /// Runs on the old table's evaluator thread; failures along the way
    /// mark additional members suspected rather than erroring out.
    fn execute_view_change(
        self: &Arc<Self>,
        t: &SharedStateTable,
    ) {
        if self
            .transition_in_progress
            .swap(true, Ordering::AcqRel)
        {
            return;
        }

        let old_view = match self.current_view() {
            Some(view) => view,
            None => {
                self.transition_in_progress
                    .store(false, Ordering::Release);
                return;
            }
        };
        let old_mcast = self.curr_mcast.read().unwrap().clone();

        // adopt the committed prefix of the leader's change list
        let leader = old_view.leader_rank();
        let (changes, num_committed) = {
            let row = t.row(leader);
            (row.changes.clone(), row.num_committed)
        };
        let committed: Vec<ChangeProposal> =
            changes[..num_committed as usize].to_vec();
        pf_info!(self.my_id;
                 "view change from vid {} with {} committed changes",
                 old_view.vid, committed.len());
        t.update_local(|row| {
            row.changes = changes.clone();
            if row.num_changes < num_committed {
                row.num_changes = num_committed;
            }
            if row.num_acked < num_committed {
                row.num_acked = num_committed;
            }
            row.num_committed = num_committed;
            row.num_installed += committed.len() as i32;
        });
        let _ = t.put(None, RowRange::Gms);

        // wedge: no new sends; receives keep flowing underneath
        if let Some(mcast) = &old_mcast {
            mcast.wedge();
        }

        // ragged-edge cleanup equalizes delivered prefixes
        if let Some(mcast) = &old_mcast {
            self.ragged_edge_cleanup(t, &old_view, mcast);
        }

        // everyone finished trimming before the cut-over
        let _ = t.sync_with_members(
            Some(&old_view.live_ranks()),
            VIEW_CHANGE_STEP_TIMEOUT,
        );

        // deterministic next view
        let departing_me = committed.iter().any(|c| {
            c.kind == ChangeKind::Depart && c.node_id == self.my_id
        });
        if departing_me {
            pf_info!(self.my_id;
                     "I have been removed from the group; shutting down");
            self.shut_down();
            return;
        }
        let next_view = match old_view.apply_changes(
            &committed,
            self.my_id,
            &self.spec,
        ) {
            Ok(next) => next,
            Err(e) => {
                pf_error!(self.my_id;
                          "cannot construct next view: {}", e);
                self.transition_in_progress
                    .store(false, Ordering::Release);
                return;
            }
        };

        let offset = old_mcast
            .as_ref()
            .map(|m| m.next_rdmc_group_num_offset)
            .unwrap_or(0);

        // answer the joiner whose join committed; re-queue one that
        // did not make this view
        let proposed = self.proposed_join.lock().unwrap().take();
        if let Some(pj) = proposed {
            if next_view.joined.contains(&pj.req.node_id)
                && next_view.rank_of(self.my_id)
                    == Some(next_view.leader_rank())
            {
                if let Err(e) =
                    self.commit_join(pj, &next_view, offset)
                {
                    pf_error!(self.my_id;
                              "sending join commit failed: {}", e);
                }
            } else if !next_view.joined.contains(&pj.req.node_id) {
                self.pending_joins.lock().unwrap().push_front(pj);
            }
        }

        // sender re-attempts its own unfinished sends in the new view
        let carryover: Option<Carryover> =
            old_mcast.as_ref().map(|m| m.extract_carryover());

        if let Err(e) =
            self.install_view(next_view.clone(), carryover, offset)
        {
            pf_error!(self.my_id; "view installation failed: {}", e);
            self.transition_in_progress
                .store(false, Ordering::Release);
            return;
        }

        // retire the old engines; stale row writes are dropped by the
        // router once the table is deregistered
        self.sst_tables.lock().unwrap().remove(&old_view.vid);
        t.predicates.shut_down();
        if let Some(mcast) = &old_mcast {
            mcast.shut_down();
        }

        // suspicions that did not commit this round carry forward
        for (rank, &failed) in old_view.failed.iter().enumerate() {
            let id = old_view.members[rank];
            if failed && next_view.members.contains(&id) {
                self.report_failure(id);
            }
        }

        self.transition_in_progress
            .store(false, Ordering::Release);
    }

    /// Per-subgroup ragged-edge cleanup: the shard leader publishes the
    /// per-sender commit points computed from the live rows; followers
    /// copy them; everyone delivers up to them in sequence order.
    fn ragged_edge_cleanup(
        &self,
        t: &SharedStateTable,
        old_view: &View,
        mcast: &MulticastGroup,
    ) {
        let view = self
            .current_view()
            .unwrap_or_else(|| Arc::new(old_view.clone()));
        let (settings, _) = view.subgroup_settings();

        for (sg, s) in settings.iter().enumerate() {
            if s.my_shard_rank.is_none() || s.num_senders == 0 {
                continue;
            }
            if s.mode == crate::view::Mode::Raw {
                continue;
            }
            let subgroup = sg as SubgroupId;
            let offset = s.num_received_offset as usize;

            // shard leader: lowest-ranked live shard member
            let shard_leader_rank = match s
                .member_ranks
                .iter()
                .copied()
                .find(|&r| !view.failed[r])
            {
                Some(rank) => rank,
                None => continue,
            };

            let mins: Vec<i64> = if shard_leader_rank == t.my_rank()
            {
                // compute commit points from the live rows
                let mins: Vec<i64> = (0..s.num_senders)
                    .map(|j| {
                        s.member_ranks
                            .iter()
                            .copied()
                            .filter(|&r| !view.failed[r])
                            .map(|r| t.row(r).num_received[offset + j])
                            .min()
                            .unwrap_or(-1)
                    })
                    .collect();
                pf_debug!(self.my_id;
                          "subgroup {} ragged edge (leading): {:?}",
                          subgroup, mins);
                t.update_local(|row| {
                    for (j, &m) in mins.iter().enumerate() {
                        row.global_min[offset + j] = m;
                    }
                    row.global_min_ready[sg] = true;
                });
                let _ = t.put(
                    Some(&s.member_ranks),
                    RowRange::GlobalMin,
                );
                mins
            } else {
                // follower: wait for the shard leader's publication
                let deadline =
                    Deadline::after(VIEW_CHANGE_STEP_TIMEOUT);
                let mins = loop {
                    {
                        let row = t.row(shard_leader_rank);
                        if row.global_min_ready[sg] {
                            break Some(
                                row.global_min
                                    [offset..offset + s.num_senders]
                                    .to_vec(),
                            );
                        }
                    }
                    if deadline.expired() {
                        break None;
                    }
                    thread::sleep(Duration::from_micros(200));
                };
                let mins = match mins {
                    Some(mins) => mins,
                    None => {
                        // shard leader went quiet mid-protocol: suspect
                        // it and fall back to my own receive vector
                        pf_error!(self.my_id;
                                  "shard leader of subgroup {} silent \
                                   during cleanup", subgroup);
                        self.report_failure(
                            view.members[shard_leader_rank],
                        );
                        (0..s.num_senders)
                            .map(|j| {
                                t.row(t.my_rank()).num_received
                                    [offset + j]
                            })
                            .collect()
                    }
                };
                pf_debug!(self.my_id;
                          "subgroup {} ragged edge (following): {:?}",
                          subgroup, mins);
                t.update_local(|row| {
                    for (j, &m) in mins.iter().enumerate() {
                        row.global_min[offset + j] = m;
                    }
                    row.global_min_ready[sg] = true;
                });
                let _ = t.put(
                    Some(&s.member_ranks),
                    RowRange::GlobalMin,
                );
                mins
            };

            mcast.deliver_messages_upto(subgroup, &mins);
        }
    }

    /// Sends the joiner its commit: the new view, parameters, and
    /// replicated-object state.
    fn commit_join(
        &self,
        mut pj: PendingJoin,
        next_view: &View,
        rdmc_offset: u16,
    ) -> Result<(), SquallError> {
        let state_blobs = self
            .state_provider
            .as_ref()
            .map(|p| p())
            .unwrap_or_default();
        write_blob(
            &mut pj.stream,
            &JoinCommit {
                view: next_view.clone(),
                params: self.params.clone(),
                rdmc_offset,
                state_blobs,
            },
        )?;
        pf_info!(self.my_id;
                 "sent view {} to joiner {}",
                 next_view.vid, pj.req.node_id);
        Ok(())
    }

    /// Builds and activates all engines of a view: table, evaluator,
    /// membership predicates, multicast group; then syncs with the
    /// other members and persists the view.
    fn install_view(
        self: &Arc<Self>,
        view: View,
        carryover: Option<Carryover>,
        rdmc_offset: u16,
    ) -> Result<(), SquallError> {
        let (settings, cols) = view.subgroup_settings();
        let shape = RowShape {
            num_members: view.members.len(),
            num_subgroups: settings.len(),
            num_received_cols: cols as usize,
            window_size: self.params.window_size,
        };
        let sst = Arc::new(SharedStateTable::new(
            view.vid,
            view.members.clone(),
            view.my_rank,
            shape,
            self.fabric.clone(),
        ));
        self.sst_tables
            .lock()
            .unwrap()
            .insert(view.vid, sst.clone());

        // a joiner dials every other member's fabric listener
        if view.joined.contains(&self.my_id) {
            for (rank, &member) in view.members.iter().enumerate() {
                if member == self.my_id {
                    continue;
                }
                let addr = view.member_addrs[rank].fabric;
                if let Err(e) = self.handle.block_on(
                    self.fabric.connect_to_peer(member, addr),
                ) {
                    pf_error!(self.my_id;
                              "connecting to member {} failed: {}",
                              member, e);
                }
            }
        }

        // everyone must be reachable before the first row write
        let live_ids: Vec<NodeId> = view
            .live_ranks()
            .iter()
            .map(|&r| view.members[r])
            .collect();
        let connected = self.handle.block_on(async {
            tokio::time::timeout(
                VIEW_CHANGE_STEP_TIMEOUT,
                self.fabric.wait_for_peers(&live_ids),
            )
            .await
        });
        if connected.is_err() {
            pf_warn!(self.my_id;
                     "not all members reachable; proceeding anyway");
        }

        let view = Arc::new(view);
        *self.curr_view.write().unwrap() = Some(view.clone());
        *self.last_suspected.lock().unwrap() =
            Bitmap::new(view.members.len());

        // engines: evaluator thread, membership predicates, multicast
        self.evaluator_handles
            .lock()
            .unwrap()
            .push(PredicateEngine::spawn_evaluator(sst.clone()));
        self.register_gms_predicates(&sst);

        let vm = self.clone();
        let failure_upcall =
            Arc::new(move |peer| vm.report_failure(peer));
        let mcast = MulticastGroup::new(
            &view,
            sst.clone(),
            self.rdmc.clone(),
            self.params.clone(),
            self.callbacks.clone(),
            self.persist.clone(),
            failure_upcall,
            rdmc_offset,
            carryover,
        )?;
        *self.curr_mcast.write().unwrap() = Some(Arc::new(mcast));
        *self.curr_sst.write().unwrap() = Some(sst.clone());

        // all members ready before anyone sends in the new view
        if let Err(e) = sst.sync_with_members(
            Some(&view.live_ranks()),
            VIEW_CHANGE_STEP_TIMEOUT,
        ) {
            pf_warn!(self.my_id; "view startup barrier failed: {}", e);
        }

        if let Some(path) = &self.view_file {
            if let Err(e) = save_view(path, &view) {
                pf_error!(self.my_id;
                          "persisting view {} failed: {}", view.vid, e);
            }
        }

        pf_info!(self.my_id;
                 "installed view {} with members {:?}",
                 view.vid, view.members);
        let mut installed = self.installed_vid.lock().unwrap();
        *installed = view.vid;
        self.view_cv.notify_all();
        Ok(())
    }
}
