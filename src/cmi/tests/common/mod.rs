#![allow(dead_code)]
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use fnv::FnvHashMap;

use cmi::config::{CmiConfig, PoolConfig};
use cmi::io::{
    BlockOpcode, BlockOperation, BlockStatus, Completion, ControlStatus, IoConsumer, OpStatus,
    Operation, OperationKind, PendingOperation, SgList, StatusCode, StatusDetail,
};
use cmi::registry::{ClientCallback, ClientEvent};
use cmi::transport::{LoopbackTransport, Transport};
use cmi::{ClientId, CmiService, Role, SpId};

pub const BLOCK: u32 = 512;
pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Block store that executes every operation it gets, unless paused.
#[derive(Default)]
pub struct Volume {
    blocks: Mutex<FnvHashMap<u64, Vec<u8>>>,
    /// `Some` while paused.
    parked: Mutex<Option<Vec<Operation>>>,
    /// First payload byte of every executed write, in execution order.
    writes: Mutex<Vec<u8>>,
    executed: AtomicUsize,
}

impl Volume {
    pub fn new() -> Arc<Self> {
        Arc::new(Volume::default())
    }

    pub fn pause(&self) {
        let mut parked = self.parked.lock().unwrap();
        if parked.is_none() {
            *parked = Some(Vec::new());
        }
    }

    /// Executes the parked operations in arrival order.
    pub fn resume(&self) {
        let parked = self.parked.lock().unwrap().take();
        for op in parked.unwrap_or_default() {
            self.execute(op);
        }
    }

    pub fn parked(&self) -> usize {
        self.parked.lock().unwrap().as_ref().map_or(0, Vec::len)
    }

    pub fn parked_cancelled(&self) -> usize {
        self.parked
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, |ops| ops.iter().filter(|op| op.is_cancelled()).count())
    }

    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::Acquire)
    }

    pub fn writes(&self) -> Vec<u8> {
        self.writes.lock().unwrap().clone()
    }

    pub fn block(&self, lba: u64) -> Option<Vec<u8>> {
        self.blocks.lock().unwrap().get(&lba).cloned()
    }

    fn execute(&self, mut op: Operation) {
        self.executed.fetch_add(1, Ordering::AcqRel);
        if op.is_cancelled() {
            op.complete_with(StatusCode::Cancelled);
            return;
        }
        match *op.kind() {
            OperationKind::Block(block) => {
                let bs = block.block_size as usize;
                let mut blocks = self.blocks.lock().unwrap();
                match block.opcode {
                    BlockOpcode::Write | BlockOpcode::WriteVerify => {
                        let data = op.payload().gather();
                        self.writes.lock().unwrap().extend(data.first().copied());
                        for (i, chunk) in data.chunks(bs).enumerate() {
                            blocks.insert(block.lba + i as u64, chunk.to_vec());
                        }
                    }
                    BlockOpcode::WriteSame => {
                        let pattern = op.payload().gather();
                        for i in 0..block.block_count {
                            blocks.insert(block.lba + i, pattern.clone());
                        }
                    }
                    BlockOpcode::Zero => {
                        for i in 0..block.block_count {
                            blocks.insert(block.lba + i, vec![0; bs]);
                        }
                    }
                    BlockOpcode::Verify => {}
                    BlockOpcode::Read => {
                        let mut data = Vec::with_capacity(bs * block.block_count as usize);
                        for i in 0..block.block_count {
                            match blocks.get(&(block.lba + i)) {
                                Some(b) => data.extend_from_slice(b),
                                None => data.resize(data.len() + bs, 0),
                            }
                        }
                        op.payload_mut().scatter(&data);
                    }
                }
                drop(blocks);
                let detail = StatusDetail::Block(BlockStatus {
                    service_time_ms: 1,
                    ..Default::default()
                });
                op.complete(OpStatus::ok(), detail);
            }
            OperationKind::Control(control) => {
                let mut data = op.payload().gather();
                data.reverse();
                op.payload_mut().scatter(&data);
                let detail = StatusDetail::Control(ControlStatus {
                    status: control.opcode,
                    qualifier: data.len() as u32,
                });
                op.complete(OpStatus::ok(), detail);
            }
        }
    }
}

impl IoConsumer for Volume {
    fn submit(&self, op: Operation) {
        let mut parked = self.parked.lock().unwrap();
        match parked.as_mut() {
            Some(ops) => ops.push(op),
            None => {
                drop(parked);
                self.execute(op);
            }
        }
    }
}

/// Client callback that records events as strings.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<String>>,
    pub messages: Mutex<Vec<Vec<u8>>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Recorder::default())
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

impl ClientCallback for Recorder {
    fn on_event(&self, _client: ClientId, event: ClientEvent<'_>) {
        if let ClientEvent::Received { message, .. } = &event {
            self.messages.lock().unwrap().push(message.to_vec());
        }
        self.events.lock().unwrap().push(format!("{:?}", event));
    }
}

pub struct Node {
    pub service: Arc<CmiService>,
    pub transport: Arc<LoopbackTransport>,
    pub volume: Arc<Volume>,
}

pub struct Pair {
    pub a: Node,
    pub b: Node,
}

pub fn config(sp: SpId) -> CmiConfig {
    let mut config = CmiConfig {
        sp,
        io_conduits: 2,
        pools: PoolConfig {
            large_slot_len: 64 * 1024,
            large_slots: 4,
            small_slot_len: 4096,
            small_slots: 8,
        },
        open_retry_ms: 20,
        drain_timeout_ms: 2_000,
        ..Default::default()
    };
    config.negotiation.handshake_retry_ms = 20;
    config.negotiation.settle_timeout_ms = 5_000;
    config
}

pub fn node(sp: SpId, transport: Arc<LoopbackTransport>, tweak: &dyn Fn(&mut CmiConfig)) -> Node {
    let mut config = config(sp);
    tweak(&mut config);
    let volume = Volume::new();
    let service = CmiService::new(
        config,
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::clone(&volume) as Arc<dyn IoConsumer>,
    )
    .unwrap();
    Node {
        service,
        transport,
        volume,
    }
}

/// Builds both nodes without starting them.
pub fn build(tweak: &dyn Fn(&mut CmiConfig)) -> Pair {
    init_logging();
    let (ta, tb) = LoopbackTransport::pair();
    Pair {
        a: node(SpId::A, ta, tweak),
        b: node(SpId::B, tb, tweak),
    }
}

pub fn start_both(pair: &Pair) -> (Role, Role) {
    crossbeam::thread::scope(|s| {
        let a = s.spawn(|_| pair.a.service.start());
        let b = s.spawn(|_| pair.b.service.start());
        (a.join().unwrap().unwrap(), b.join().unwrap().unwrap())
    })
    .unwrap()
}

pub fn wait_io_ready(pair: &Pair) {
    assert!(
        wait_until(WAIT, || pair.a.service.engine().has_peer_table()
            && pair.b.service.engine().has_peer_table()),
        "translation tables were not exchanged"
    );
}

pub fn pair_with(tweak: &dyn Fn(&mut CmiConfig)) -> Pair {
    let pair = build(tweak);
    start_both(&pair);
    wait_io_ready(&pair);
    pair
}

pub fn pair() -> Pair {
    pair_with(&|_| {})
}

impl Drop for Pair {
    fn drop(&mut self) {
        self.a.volume.resume();
        self.b.volume.resume();
        self.a.service.destroy();
        self.b.service.destroy();
    }
}

pub fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if f() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

pub fn write(lba: u64, data: Vec<u8>) -> (Operation, PendingOperation) {
    let blocks = (data.len() / BLOCK as usize) as u64;
    Operation::block(
        BlockOperation::new(BlockOpcode::Write, lba, blocks, BLOCK),
        SgList::single(data),
    )
}

pub fn read(lba: u64, blocks: u64, segments: usize) -> (Operation, PendingOperation) {
    Operation::block(
        BlockOperation::new(BlockOpcode::Read, lba, blocks, BLOCK),
        SgList::zeroed(blocks as usize * BLOCK as usize, segments),
    )
}

pub fn done(pending: PendingOperation) -> Completion {
    pending
        .wait_timeout(WAIT)
        .unwrap_or_else(|| panic!("{} did not complete", pending.id()))
}
