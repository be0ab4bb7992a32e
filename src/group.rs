//! The top-level group object: owns the runtime and the process-scoped
//! engines (fabric, block multicast, persistence), wires them into the
//! view manager, and exposes the application-facing surface.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::multicast::{CallbackSet, McastParams, SendBuffer};
use crate::persist::{load_view, replay_log, PersistHub};
use crate::rdmc::{Algorithm, RdmcEngine};
use crate::transport::{Fabric, WireMsg};
use crate::utils::SquallError;
use crate::view::manager::{
    request_join, StateInstaller, StateProvider, ViewManager,
};
use crate::view::{ReplicatedState, SubgroupSpec};
use crate::{NodeId, SubgroupId};

use serde::Deserialize;

use tokio::runtime::{Builder as RuntimeBuilder, Runtime};

/// Default ports, published in one place.
pub const DEFAULT_GMS_PORT: u16 = 23580;
pub const DEFAULT_RDMC_PORT: u16 = 28366;
pub const DEFAULT_SST_PORT: u16 = 37683;
pub const DEFAULT_RPC_PORT: u16 = 31415;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    /// Largest payload of a single multicast message, in bytes.
    pub max_payload_size: usize,

    /// Block-transport slicing unit in bytes; the maximum message size
    /// is rounded up to a multiple of this.
    pub block_size: usize,

    /// Per-sender outstanding message budget per subgroup.
    pub window_size: usize,

    /// Heartbeat/suspicion interval in millisecs.
    pub timeout_ms: u64,

    /// Block relay schedule: `binomial_send` or `chain_send`.
    pub algorithm: String,

    /// If non-empty, persist delivered messages to this file.
    pub filename: String,

    /// Largest message (header included) the in-row slot path carries.
    pub slot_size: usize,

    /// IP to bind all listeners on.
    pub bind_ip: String,

    /// Membership-service port.
    pub gms_port: u16,

    /// Block-transport port (shares the row-write fabric).
    pub rdmc_port: u16,

    /// Row-write fabric port.
    pub sst_port: u16,

    /// RPC-layer port (reserved for the layer above).
    pub rpc_port: u16,
}

impl Default for GroupConfig {
    fn default() -> Self {
        GroupConfig {
            max_payload_size: 10240,
            block_size: 1024,
            window_size: 3,
            timeout_ms: 1,
            algorithm: "binomial_send".into(),
            filename: String::new(),
            slot_size: 256,
            bind_ip: "127.0.0.1".into(),
            gms_port: DEFAULT_GMS_PORT,
            rdmc_port: DEFAULT_RDMC_PORT,
            sst_port: DEFAULT_SST_PORT,
            rpc_port: DEFAULT_RPC_PORT,
        }
    }
}

impl GroupConfig {
    /// Parses a config from an optional TOML string overlaying the
    /// defaults, then validates it.
    pub fn from_str(
        config_str: Option<&str>,
    ) -> Result<GroupConfig, SquallError> {
        let config = parsed_config!(config_str => GroupConfig;
                                    max_payload_size, block_size,
                                    window_size, timeout_ms, algorithm,
                                    filename, slot_size, bind_ip,
                                    gms_port, rdmc_port, sst_port,
                                    rpc_port)?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity checks on parameter ranges.
    pub fn validate(&self) -> Result<(), SquallError> {
        if self.max_payload_size == 0 {
            return logged_err!("cfg"; "invalid max_payload_size 0");
        }
        if self.block_size == 0 {
            return logged_err!("cfg"; "invalid block_size 0");
        }
        if self.window_size == 0 || self.window_size > 64 {
            // the fabric queues in user space, but keep the posted-send
            // depth within what any device could take
            return logged_err!("cfg";
                               "window_size {} out of range [1, 64]",
                               self.window_size);
        }
        if self.timeout_ms == 0 {
            return logged_err!("cfg"; "invalid timeout_ms 0");
        }
        Algorithm::from_config(&self.algorithm)?;
        Ok(())
    }

    fn mcast_params(&self) -> Result<McastParams, SquallError> {
        Ok(McastParams {
            max_payload_size: self.max_payload_size,
            block_size: self.block_size,
            slot_capacity: self.slot_size,
            window_size: self.window_size,
            algorithm: Algorithm::from_config(&self.algorithm)?,
            sender_timeout_ms: self.timeout_ms,
        })
    }
}

/// Registry of replicated objects for typed subgroups, keyed by
/// subgroup type name; state moves between members as opaque bytes.
#[derive(Default)]
pub struct StateRegistry {
    objects:
        HashMap<String, Arc<StdMutex<Box<dyn ReplicatedState>>>>,
}

impl StateRegistry {
    pub fn new() -> StateRegistry {
        StateRegistry::default()
    }

    /// Registers the replicated object backing one subgroup type.
    pub fn register(
        &mut self,
        type_name: impl Into<String>,
        object: Box<dyn ReplicatedState>,
    ) {
        self.objects
            .insert(type_name.into(), Arc::new(StdMutex::new(object)));
    }

    fn into_seams(
        self,
    ) -> (Option<StateProvider>, Option<StateInstaller>) {
        if self.objects.is_empty() {
            return (None, None);
        }
        let objects = Arc::new(self.objects);
        let provider_objects = objects.clone();
        let provider: StateProvider = Box::new(move || {
            provider_objects
                .iter()
                .filter_map(|(name, obj)| {
                    match obj.lock().unwrap().serialize() {
                        Ok(bytes) => Some((name.clone(), bytes)),
                        Err(e) => {
                            pf_error!("state";
                                      "serializing '{}' failed: {}",
                                      name, e);
                            None
                        }
                    }
                })
                .collect()
        });
        let installer: StateInstaller =
            Box::new(move |name, bytes| {
                if let Some(obj) = objects.get(name) {
                    if let Err(e) =
                        obj.lock().unwrap().deserialize(bytes)
                    {
                        pf_error!("state";
                                  "installing '{}' failed: {}",
                                  name, e);
                    }
                }
            });
        (Some(provider), Some(installer))
    }
}

/// Everything process-scoped the view manager runs on.
struct Engines {
    runtime: Runtime,
    fabric: Arc<Fabric<WireMsg>>,
    rdmc: Arc<RdmcEngine>,
    persist: Option<Arc<PersistHub>>,
    view_file: Option<PathBuf>,
    gms_listener: StdTcpListener,
    params: McastParams,
}

fn build_engines(
    my_id: NodeId,
    config: &GroupConfig,
) -> Result<Engines, SquallError> {
    config.validate()?;
    let runtime = RuntimeBuilder::new_multi_thread()
        .enable_all()
        .thread_name("squall-io")
        .build()?;

    let fabric_bind: SocketAddr =
        format!("{}:{}", config.bind_ip, config.sst_port).parse()?;
    let fabric = Arc::new(runtime.block_on(Fabric::new_and_setup(
        my_id,
        fabric_bind,
    ))?);
    let rdmc = Arc::new(RdmcEngine::new(my_id, fabric.clone()));

    let gms_bind: SocketAddr =
        format!("{}:{}", config.bind_ip, config.gms_port).parse()?;
    let gms_listener = StdTcpListener::bind(gms_bind)?;

    let (persist, view_file) = if config.filename.is_empty() {
        (None, None)
    } else {
        let log_path = PathBuf::from(&config.filename);
        let hub = runtime.block_on(PersistHub::new_and_setup(
            my_id,
            &log_path,
        ))?;
        let view_file = log_path.with_extension("view");
        (Some(Arc::new(hub)), Some(view_file))
    };

    let params = config.mcast_params()?;
    Ok(Engines {
        runtime,
        fabric,
        rdmc,
        persist,
        view_file,
        gms_listener,
        params,
    })
}

/// A running group membership on this node.
pub struct Group {
    /// The owned runtime; all socket and file tasks live on it.
    runtime: StdMutex<Option<Runtime>>,

    vm: Arc<ViewManager>,
    my_id: NodeId,
    left: AtomicBool,
}

impl Group {
    /// Starts a brand-new group with this node as the leader. Blocks
    /// until the second member has joined (a group of one is only
    /// reachable through `restart_from_logs`).
    pub fn start_new_group(
        my_id: NodeId,
        config: &GroupConfig,
        callbacks: CallbackSet,
        spec: SubgroupSpec,
        registry: StateRegistry,
    ) -> Result<Group, SquallError> {
        let engines = build_engines(my_id, config)?;
        let (provider, installer) = registry.into_seams();
        let vm = ViewManager::new(
            my_id,
            engines.gms_listener,
            engines.fabric.listen_addr(),
            spec,
            engines.params,
            engines.view_file,
            callbacks,
            engines.persist,
            engines.fabric,
            engines.rdmc,
            engines.runtime.handle().clone(),
            provider,
            installer,
        )?;
        vm.start_fresh()?;
        Ok(Group {
            runtime: StdMutex::new(Some(engines.runtime)),
            vm,
            my_id,
            left: AtomicBool::new(false),
        })
    }

    /// Joins an existing group through its leader's membership port.
    /// Multicast parameters are adopted from the leader; only the local
    /// settings (ports, persistence file) of `config` apply.
    pub fn join_group(
        my_id: NodeId,
        leader_gms: SocketAddr,
        config: &GroupConfig,
        callbacks: CallbackSet,
        spec: SubgroupSpec,
        registry: StateRegistry,
    ) -> Result<Group, SquallError> {
        let engines = build_engines(my_id, config)?;
        let my_addrs = crate::view::MemberAddrs {
            fabric: engines.fabric.listen_addr(),
            gms: engines.gms_listener.local_addr()?,
        };
        let commit = request_join(leader_gms, my_id, my_addrs)?;

        let (provider, installer) = registry.into_seams();
        let vm = ViewManager::new(
            my_id,
            engines.gms_listener,
            engines.fabric.listen_addr(),
            spec,
            commit.params.clone(),
            engines.view_file,
            callbacks,
            engines.persist,
            engines.fabric,
            engines.rdmc,
            engines.runtime.handle().clone(),
            provider,
            installer,
        )?;
        vm.start_joined(commit)?;
        Ok(Group {
            runtime: StdMutex::new(Some(engines.runtime)),
            vm,
            my_id,
            left: AtomicBool::new(false),
        })
    }

    /// Restarts a failed member from its persisted log: re-delivers the
    /// logged messages through the delivery callback, then comes back
    /// as the sole member of a successor view, accepting joins.
    pub fn restart_from_logs(
        my_id: NodeId,
        config: &GroupConfig,
        callbacks: CallbackSet,
        spec: SubgroupSpec,
        registry: StateRegistry,
    ) -> Result<Group, SquallError> {
        if config.filename.is_empty() {
            return logged_err!(my_id;
                               "restart requires a persistence file");
        }
        let log_path = PathBuf::from(&config.filename);
        let saved_view =
            load_view(&log_path.with_extension("view"))?;
        let records = replay_log(&log_path)?;
        pf_info!(my_id;
                 "replaying {} persisted records from '{}'",
                 records.len(), config.filename);
        for record in &records {
            (callbacks.delivery)(
                record.subgroup,
                record.sender,
                record.index as i64,
                &record.data,
            );
        }

        let engines = build_engines(my_id, config)?;
        let (provider, installer) = registry.into_seams();
        let vm = ViewManager::new(
            my_id,
            engines.gms_listener,
            engines.fabric.listen_addr(),
            spec,
            engines.params,
            engines.view_file,
            callbacks,
            engines.persist,
            engines.fabric,
            engines.rdmc,
            engines.runtime.handle().clone(),
            provider,
            installer,
        )?;
        vm.start_restarted(saved_view)?;
        Ok(Group {
            runtime: StdMutex::new(Some(engines.runtime)),
            vm,
            my_id,
            left: AtomicBool::new(false),
        })
    }

    /// My node ID.
    pub fn my_id(&self) -> NodeId {
        self.my_id
    }

    /// The membership-service address other nodes join through.
    pub fn gms_addr(&self) -> SocketAddr {
        self.vm.gms_addr()
    }

    /// Node IDs of the current view's members.
    pub fn get_members(&self) -> Vec<NodeId> {
        self.vm.get_members()
    }

    /// Handle for the shard of a subgroup type, resolved against the
    /// current view's layout.
    pub fn subgroup(
        &self,
        type_name: &str,
        shard_index: usize,
    ) -> Option<SubgroupHandle> {
        let view = self.vm.current_view()?;
        let subgroup = view
            .subgroup_shards
            .iter()
            .position(|s| {
                s.type_name == type_name
                    && s.shard_index == shard_index
            })? as SubgroupId;
        Some(SubgroupHandle {
            vm: self.vm.clone(),
            subgroup,
        })
    }

    /// Reports to the membership service that a node has failed.
    pub fn report_failure(&self, node: NodeId) {
        self.vm.report_failure(node);
    }

    /// Waits until all live members of the view have entered a barrier.
    pub fn barrier_sync(&self) -> Result<(), SquallError> {
        self.vm.barrier_sync()
    }

    /// Blocks until a view with at least the given number installed.
    pub fn wait_for_view(
        &self,
        vid: i32,
        timeout: Duration,
    ) -> Result<(), SquallError> {
        self.vm.wait_for_vid(vid, timeout)
    }

    /// Cleanly leaves the group and shuts all engines down.
    pub fn leave(&self) {
        if self.left.swap(true, Ordering::AcqRel) {
            return;
        }
        self.vm.leave();
        if let Some(runtime) = self.runtime.lock().unwrap().take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        if !self.left.load(Ordering::Acquire) {
            self.vm.shut_down();
            if let Some(runtime) =
                self.runtime.lock().unwrap().take()
            {
                runtime.shutdown_timeout(Duration::from_secs(1));
            }
        }
    }
}

/// Per-subgroup sending handle.
pub struct SubgroupHandle {
    vm: Arc<ViewManager>,
    subgroup: SubgroupId,
}

impl SubgroupHandle {
    /// The subgroup's flat ID in the current view.
    pub fn subgroup_id(&self) -> SubgroupId {
        self.subgroup
    }

    /// Acquires a send buffer for a payload of the given size. Returns
    /// `None` when the flow-control window is full, the engine is
    /// wedged mid-view-change, or the payload oversteps the maximum.
    pub fn get_send_buffer(
        &self,
        payload_size: usize,
    ) -> Option<SendBuffer> {
        self.vm
            .get_send_buffer(self.subgroup, payload_size, 0, false, false)
    }

    /// Like `get_send_buffer`, declaring that this sender will skip the
    /// next `pause_sending_turns` of its sequence slots.
    pub fn get_send_buffer_with_pause(
        &self,
        payload_size: usize,
        pause_sending_turns: u32,
    ) -> Option<SendBuffer> {
        self.vm.get_send_buffer(
            self.subgroup,
            payload_size,
            pause_sending_turns,
            false,
            false,
        )
    }

    /// Acquires a buffer for a cooked (RPC-bound) send.
    pub fn get_cooked_send_buffer(
        &self,
        payload_size: usize,
    ) -> Option<SendBuffer> {
        self.vm
            .get_send_buffer(self.subgroup, payload_size, 0, true, false)
    }

    /// Schedules a prepared message for transmission. The send happens
    /// some time in the future; delivery order follows sequence
    /// numbers, not call timing.
    pub fn send(&self, buffer: SendBuffer) -> bool {
        self.vm.send(buffer)
    }

    /// Node IDs of this shard's members in the current view.
    pub fn members(&self) -> Vec<NodeId> {
        self.vm
            .current_view()
            .map(|v| {
                v.shard(self.subgroup).members.clone()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod group_tests {
    use super::*;
    use crate::view::Mode;
    use crate::persist::{encode_record, save_view, PersistedRecord};
    use crate::view::{MemberAddrs, View};

    use std::io::Write as IoWrite;
    use std::thread;

    type Deliveries =
        Arc<StdMutex<Vec<(SubgroupId, NodeId, i64, Vec<u8>)>>>;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn collector() -> (Deliveries, CallbackSet) {
        let delivered: Deliveries =
            Arc::new(StdMutex::new(Vec::new()));
        let delivered_ref = delivered.clone();
        let callbacks = CallbackSet {
            delivery: Arc::new(move |sg, sender, index, bytes| {
                delivered_ref.lock().unwrap().push((
                    sg,
                    sender,
                    index,
                    bytes.to_vec(),
                ));
            }),
            rpc: None,
            persistence: None,
        };
        (delivered, callbacks)
    }

    /// Grabs a currently-free TCP port for a leader's membership
    /// listener (tests must know it before the leader finishes
    /// constructing).
    fn free_port() -> u16 {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn test_config(gms_port: u16) -> GroupConfig {
        GroupConfig {
            gms_port,
            sst_port: 0,
            rdmc_port: 0,
            rpc_port: 0,
            timeout_ms: 50,
            window_size: 3,
            ..GroupConfig::default()
        }
    }

    fn wait_until(
        secs: u64,
        mut cond: impl FnMut() -> bool,
    ) -> bool {
        let deadline =
            crate::utils::Deadline::after(Duration::from_secs(secs));
        while !deadline.expired() {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(50));
        }
        false
    }

    fn join_with_retry(
        my_id: NodeId,
        leader_gms: SocketAddr,
        config: &GroupConfig,
        callbacks: CallbackSet,
        spec: SubgroupSpec,
    ) -> Group {
        let deadline =
            crate::utils::Deadline::after(Duration::from_secs(30));
        loop {
            match Group::join_group(
                my_id,
                leader_gms,
                config,
                callbacks.clone(),
                spec.clone(),
                StateRegistry::new(),
            ) {
                Ok(group) => return group,
                Err(e) => {
                    if deadline.expired() {
                        panic!("joining never succeeded: {}", e);
                    }
                    thread::sleep(Duration::from_millis(200));
                }
            }
        }
    }

    /// Scenario: three nodes, one shard, Ordered, two allowed senders.
    /// Delivery order on every member follows sequence numbers, a late
    /// joiner sees none of the earlier view's messages, and new
    /// messages reach all members identically.
    #[test]
    fn three_node_total_order_and_late_join() {
        init_logger();
        let spec = SubgroupSpec {
            types: vec![crate::view::SubgroupTypeSpec {
                name: "chat".into(),
                shards: vec![crate::view::ShardSpec {
                    members: vec![1, 2, 3],
                    senders: vec![true, true, false],
                    mode: Mode::Ordered,
                }],
            }],
        };
        let leader_gms = free_port();
        let leader_addr: SocketAddr =
            format!("127.0.0.1:{}", leader_gms).parse().unwrap();

        let (delivered_a, callbacks_a) = collector();
        let spec_a = spec.clone();
        let leader_thread = thread::spawn(move || {
            Group::start_new_group(
                1,
                &test_config(leader_gms),
                callbacks_a,
                spec_a,
                StateRegistry::new(),
            )
            .expect("leader startup should succeed")
        });

        let (delivered_b, callbacks_b) = collector();
        let group_b = join_with_retry(
            2,
            leader_addr,
            &test_config(0),
            callbacks_b,
            spec.clone(),
        );
        let group_a = leader_thread.join().unwrap();
        group_a.wait_for_view(0, Duration::from_secs(30)).unwrap();
        group_b.wait_for_view(0, Duration::from_secs(30)).unwrap();

        // one message in the first view, before the late joiner
        let chat_a = group_a.subgroup("chat", 0).unwrap();
        let mut buf = chat_a.get_send_buffer(3).unwrap();
        buf.payload_mut().copy_from_slice(b"pre");
        assert!(chat_a.send(buf));
        assert!(wait_until(30, || {
            delivered_a.lock().unwrap().len() == 1
                && delivered_b.lock().unwrap().len() == 1
        }));

        // node 3 joins; everyone reaches the next view
        let (delivered_c, callbacks_c) = collector();
        let group_c = join_with_retry(
            3,
            leader_addr,
            &test_config(0),
            callbacks_c,
            spec.clone(),
        );
        for group in [&group_a, &group_b, &group_c] {
            group.wait_for_view(1, Duration::from_secs(30)).unwrap();
            assert_eq!(group.get_members(), vec![1, 2, 3]);
        }
        // the joiner was delivered nothing from the previous view
        assert!(delivered_c.lock().unwrap().is_empty());

        // interleaved sends from both senders; total order must hold
        let chat_b = group_b.subgroup("chat", 0).unwrap();
        let mut buf = chat_a.get_send_buffer(1).unwrap();
        buf.payload_mut().copy_from_slice(b"x");
        assert!(chat_a.send(buf));
        let mut buf = chat_b.get_send_buffer(1).unwrap();
        buf.payload_mut().copy_from_slice(b"y");
        assert!(chat_b.send(buf));
        let mut buf = chat_a.get_send_buffer(1).unwrap();
        buf.payload_mut().copy_from_slice(b"z");
        assert!(chat_a.send(buf));

        let expect_tail = vec![
            (1u32, 0i64, b"x".to_vec()),
            (2u32, 0i64, b"y".to_vec()),
            (1u32, 1i64, b"z".to_vec()),
        ];
        for delivered in [&delivered_a, &delivered_b] {
            assert!(wait_until(30, || {
                delivered.lock().unwrap().len() == 4
            }));
            let tail: Vec<(NodeId, i64, Vec<u8>)> = delivered
                .lock()
                .unwrap()
                .iter()
                .skip(1)
                .map(|(_, sender, index, bytes)| {
                    (*sender, *index, bytes.clone())
                })
                .collect();
            assert_eq!(tail, expect_tail);
        }
        assert!(wait_until(30, || {
            delivered_c.lock().unwrap().len() == 3
        }));
        let c_msgs: Vec<(NodeId, i64, Vec<u8>)> = delivered_c
            .lock()
            .unwrap()
            .iter()
            .map(|(_, sender, index, bytes)| {
                (*sender, *index, bytes.clone())
            })
            .collect();
        assert_eq!(c_msgs, expect_tail);

        group_c.leave();
        group_b.leave();
        group_a.leave();
    }

    /// Scenario: a payload under the slot size travels in-row, a bulk
    /// one through the block transport; both are delivered in order on
    /// both members, and (with persistence on) both logs replay the
    /// same sequence.
    #[test]
    fn slot_and_block_routing_with_persistence() {
        init_logger();
        let spec = SubgroupSpec::one_shard_of_everyone(
            "blob",
            Mode::Ordered,
        );
        let leader_gms = free_port();
        let leader_addr: SocketAddr =
            format!("127.0.0.1:{}", leader_gms).parse().unwrap();
        let log_a = "/tmp/test-squall-routing-a.log";
        let log_b = "/tmp/test-squall-routing-b.log";
        for path in [log_a, log_b] {
            let _ = std::fs::remove_file(path);
            let _ = std::fs::remove_file(format!("{}.view", path));
        }

        let (delivered_a, callbacks_a) = collector();
        let spec_a = spec.clone();
        let leader_thread = thread::spawn(move || {
            let mut config = test_config(leader_gms);
            config.filename = log_a.into();
            Group::start_new_group(
                10,
                &config,
                callbacks_a,
                spec_a,
                StateRegistry::new(),
            )
            .expect("leader startup should succeed")
        });

        let (delivered_b, callbacks_b) = collector();
        let mut config_b = test_config(0);
        config_b.filename = log_b.into();
        let group_b = join_with_retry(
            20,
            leader_addr,
            &config_b,
            callbacks_b,
            spec.clone(),
        );
        let group_a = leader_thread.join().unwrap();
        group_a.wait_for_view(0, Duration::from_secs(30)).unwrap();
        group_b.wait_for_view(0, Duration::from_secs(30)).unwrap();

        let blob_a = group_a.subgroup("blob", 0).unwrap();
        let small: Vec<u8> = vec![0x11; 100];
        let bulk: Vec<u8> = (0..10240u32)
            .map(|i| (i % 251) as u8)
            .collect();

        let mut buf = blob_a.get_send_buffer(small.len()).unwrap();
        buf.payload_mut().copy_from_slice(&small);
        assert!(blob_a.send(buf));
        let mut buf = blob_a.get_send_buffer(bulk.len()).unwrap();
        buf.payload_mut().copy_from_slice(&bulk);
        assert!(blob_a.send(buf));

        for delivered in [&delivered_a, &delivered_b] {
            assert!(wait_until(30, || {
                delivered.lock().unwrap().len() == 2
            }));
            let msgs = delivered.lock().unwrap().clone();
            assert_eq!(msgs[0].3, small);
            assert_eq!(msgs[1].3, bulk);
        }

        // both logs replay the identical delivered sequence
        assert!(wait_until(30, || {
            let rec_a = crate::persist::replay_log(
                std::path::Path::new(log_a),
            );
            let rec_b = crate::persist::replay_log(
                std::path::Path::new(log_b),
            );
            matches!((&rec_a, &rec_b), (Ok(a), Ok(b))
                     if a.len() == 2 && b.len() == 2)
        }));
        let rec_a = crate::persist::replay_log(
            std::path::Path::new(log_a),
        )
        .unwrap();
        let rec_b = crate::persist::replay_log(
            std::path::Path::new(log_b),
        )
        .unwrap();
        assert_eq!(rec_a, rec_b);
        assert_eq!(rec_a[0].data, small);
        assert_eq!(rec_a[1].data, bulk);

        group_b.leave();
        group_a.leave();
    }

    /// Scenario: a member is reported failed; survivors install the
    /// next view without it.
    #[test]
    fn failure_triggers_view_change() {
        init_logger();
        let spec = SubgroupSpec::one_shard_of_everyone(
            "chat",
            Mode::Ordered,
        );
        let leader_gms = free_port();
        let leader_addr: SocketAddr =
            format!("127.0.0.1:{}", leader_gms).parse().unwrap();

        let (_delivered_a, callbacks_a) = collector();
        let spec_a = spec.clone();
        let leader_thread = thread::spawn(move || {
            Group::start_new_group(
                1,
                &test_config(leader_gms),
                callbacks_a,
                spec_a,
                StateRegistry::new(),
            )
            .expect("leader startup should succeed")
        });

        let (_delivered_b, callbacks_b) = collector();
        let group_b = join_with_retry(
            2,
            leader_addr,
            &test_config(0),
            callbacks_b,
            spec.clone(),
        );
        let group_a = leader_thread.join().unwrap();

        let (_delivered_c, callbacks_c) = collector();
        let group_c = join_with_retry(
            3,
            leader_addr,
            &test_config(0),
            callbacks_c,
            spec.clone(),
        );
        for group in [&group_a, &group_b, &group_c] {
            group.wait_for_view(1, Duration::from_secs(30)).unwrap();
        }

        group_a.report_failure(3);
        group_a.wait_for_view(2, Duration::from_secs(30)).unwrap();
        group_b.wait_for_view(2, Duration::from_secs(30)).unwrap();
        assert_eq!(group_a.get_members(), vec![1, 2]);
        assert_eq!(group_b.get_members(), vec![1, 2]);

        drop(group_c); // was expelled; just tear its engines down
        group_b.leave();
        group_a.leave();
    }

    /// Restarting from a crafted log re-delivers the logged messages in
    /// order before the group comes back up.
    #[test]
    fn restart_replays_persisted_log() {
        init_logger();
        let log_path = "/tmp/test-squall-restart.log";
        let view_path = "/tmp/test-squall-restart.view";
        let _ = std::fs::remove_file(log_path);

        // craft a log of three records and a saved view
        let mut file =
            std::fs::File::create(log_path).unwrap();
        for i in 0..3u64 {
            let record = PersistedRecord {
                vid: 4,
                subgroup: 0,
                sender: 7,
                index: i,
                cooked: false,
                data: vec![i as u8; 8],
            };
            file.write_all(&encode_record(&record)).unwrap();
        }
        drop(file);
        let spec = SubgroupSpec::one_shard_of_everyone(
            "chat",
            Mode::Ordered,
        );
        let saved = View::new(
            4,
            vec![7, 8],
            vec![
                MemberAddrs {
                    fabric: "127.0.0.1:9201".parse().unwrap(),
                    gms: "127.0.0.1:9301".parse().unwrap(),
                },
                MemberAddrs {
                    fabric: "127.0.0.1:9202".parse().unwrap(),
                    gms: "127.0.0.1:9302".parse().unwrap(),
                },
            ],
            7,
            vec![],
            vec![],
            &spec,
        )
        .unwrap();
        save_view(std::path::Path::new(view_path), &saved).unwrap();

        let (delivered, callbacks) = collector();
        let mut config = test_config(0);
        config.filename = log_path.into();
        let group = Group::restart_from_logs(
            7,
            &config,
            callbacks,
            spec,
            StateRegistry::new(),
        )
        .unwrap();

        let msgs = delivered.lock().unwrap().clone();
        assert_eq!(msgs.len(), 3);
        for (i, (sg, sender, index, data)) in
            msgs.iter().enumerate()
        {
            assert_eq!(*sg, 0);
            assert_eq!(*sender, 7);
            assert_eq!(*index, i as i64);
            assert_eq!(data, &vec![i as u8; 8]);
        }
        // came back as the sole member of the successor view
        assert_eq!(group.get_members(), vec![7]);
        group.leave();
    }
}
