//! In-memory block volume, the local consumer of operations forwarded by the peer.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{self, Receiver, Sender};
use fnv::FnvHashMap;

use cmi::io::{
    BlockOpcode, BlockOperation, BlockStatus, ControlStatus, IoConsumer, OpStatus, Operation,
    OperationKind, StatusCode, StatusDetail,
};

use crate::config::VolumeConfig;

/// Control opcode returning `block_size: u32 LE | blocks: u64 LE`.
pub const CONTROL_GEOMETRY: u32 = 0x10;
/// Control opcode returning `reads: u64 LE | writes: u64 LE`.
pub const CONTROL_COUNTERS: u32 = 0x11;

const BAD_LBA: u32 = 1;
const MISCOMPARE: u32 = 2;
const BAD_BLOCK_SIZE: u32 = 3;

struct Store {
    geometry: VolumeConfig,
    blocks: spin::Mutex<FnvHashMap<u64, Vec<u8>>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

fn failed(status: u32, bad_lba: u64) -> (OpStatus, StatusDetail) {
    (
        OpStatus {
            code: StatusCode::GenericFailure,
            qualifier: status,
        },
        StatusDetail::Block(BlockStatus {
            status,
            bad_lba,
            ..Default::default()
        }),
    )
}

impl Store {
    fn check(&self, block: &BlockOperation) -> Result<(), (OpStatus, StatusDetail)> {
        if block.block_size != self.geometry.block_size {
            return Err(failed(BAD_BLOCK_SIZE, block.lba));
        }
        let end = block.lba.checked_add(block.block_count);
        match end {
            Some(end) if end <= self.geometry.blocks => Ok(()),
            _ => Err(failed(BAD_LBA, block.lba)),
        }
    }

    fn block_io(&self, block: BlockOperation, op: &mut Operation) -> (OpStatus, StatusDetail) {
        if let Err(failure) = self.check(&block) {
            return failure;
        }
        let started = Instant::now();
        let bs = block.block_size as usize;
        let mut blocks = self.blocks.lock();
        match block.opcode {
            BlockOpcode::Read => {
                let mut data = Vec::with_capacity(bs * block.block_count as usize);
                for lba in block.lba..block.lba + block.block_count {
                    match blocks.get(&lba) {
                        Some(b) => data.extend_from_slice(b),
                        None => data.resize(data.len() + bs, 0),
                    }
                }
                op.payload_mut().scatter(&data);
                self.reads.fetch_add(1, Ordering::Relaxed);
            }
            BlockOpcode::Write | BlockOpcode::WriteVerify => {
                let data = op.payload().gather();
                for (lba, chunk) in (block.lba..).zip(data.chunks(bs)) {
                    blocks.insert(lba, chunk.to_vec());
                }
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
            BlockOpcode::WriteSame => {
                let mut pattern = op.payload().gather();
                pattern.resize(bs, 0);
                for lba in block.lba..block.lba + block.block_count {
                    blocks.insert(lba, pattern.clone());
                }
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
            BlockOpcode::Zero => {
                for lba in block.lba..block.lba + block.block_count {
                    blocks.remove(&lba);
                }
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
            BlockOpcode::Verify => {
                let data = op.payload().gather();
                let zero = vec![0; bs];
                for (lba, chunk) in (block.lba..).zip(data.chunks(bs)) {
                    let stored = blocks.get(&lba).map_or(zero.as_slice(), Vec::as_slice);
                    if stored != chunk {
                        return failed(MISCOMPARE, lba);
                    }
                }
            }
        }
        let detail = StatusDetail::Block(BlockStatus {
            service_time_ms: started.elapsed().as_millis() as u32,
            ..Default::default()
        });
        (OpStatus::ok(), detail)
    }

    fn control(&self, opcode: u32, op: &mut Operation) -> (OpStatus, StatusDetail) {
        let mut reply = Vec::with_capacity(16);
        match opcode {
            CONTROL_GEOMETRY => {
                reply.extend_from_slice(&self.geometry.block_size.to_le_bytes());
                reply.extend_from_slice(&self.geometry.blocks.to_le_bytes());
            }
            CONTROL_COUNTERS => {
                reply.extend_from_slice(&self.reads.load(Ordering::Relaxed).to_le_bytes());
                reply.extend_from_slice(&self.writes.load(Ordering::Relaxed).to_le_bytes());
            }
            _ => {
                tracing::debug!("volume: unknown control opcode {:#x}", opcode);
                return (
                    OpStatus {
                        code: StatusCode::GenericFailure,
                        qualifier: opcode,
                    },
                    StatusDetail::None,
                );
            }
        }
        let copied = op.payload_mut().scatter(&reply);
        let detail = StatusDetail::Control(ControlStatus {
            status: opcode,
            qualifier: copied as u32,
        });
        (OpStatus::ok(), detail)
    }

    fn execute(&self, mut op: Operation) {
        if op.is_cancelled() {
            op.complete_with(StatusCode::Cancelled);
            return;
        }
        let (status, detail) = match *op.kind() {
            OperationKind::Block(block) => self.block_io(block, &mut op),
            OperationKind::Control(control) => self.control(control.opcode, &mut op),
        };
        op.complete(status, detail);
    }
}

/// Executes submitted operations on a few worker threads.
pub struct Volume {
    store: Arc<Store>,
    queue: spin::Mutex<Option<Sender<Operation>>>,
    workers: spin::Mutex<Vec<JoinHandle<()>>>,
}

impl Volume {
    pub fn new(geometry: VolumeConfig) -> anyhow::Result<Arc<Self>> {
        let store = Arc::new(Store {
            geometry: geometry.clone(),
            blocks: spin::Mutex::new(FnvHashMap::default()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        });
        let (tx, rx) = channel::unbounded();
        let mut workers = Vec::with_capacity(geometry.workers);
        for i in 0..geometry.workers {
            let store = Arc::clone(&store);
            let rx: Receiver<Operation> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("cmi-volume-{}", i))
                .spawn(move || {
                    while let Ok(op) = rx.recv() {
                        store.execute(op);
                    }
                })?;
            workers.push(handle);
        }
        tracing::info!(
            "volume: {} blocks of {} bytes, {} workers",
            geometry.blocks,
            geometry.block_size,
            geometry.workers
        );
        Ok(Arc::new(Volume {
            store,
            queue: spin::Mutex::new(Some(tx)),
            workers: spin::Mutex::new(workers),
        }))
    }

    pub fn blocks_in_use(&self) -> usize {
        self.store.blocks.lock().len()
    }

    /// Finishes queued operations and stops the workers.
    pub fn shutdown(&self) {
        self.queue.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!("volume: worker panicked");
            }
        }
    }
}

impl IoConsumer for Volume {
    fn submit(&self, op: Operation) {
        let queue = self.queue.lock().clone();
        match queue {
            Some(queue) => {
                if let Err(e) = queue.send(op) {
                    e.into_inner().complete_with(StatusCode::NoDevice);
                }
            }
            None => op.complete_with(StatusCode::NoDevice),
        }
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cmi::io::SgList;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn volume() -> Arc<Volume> {
        Volume::new(VolumeConfig {
            block_size: 512,
            blocks: 64,
            workers: 2,
        })
        .unwrap()
    }

    fn block(opcode: BlockOpcode, lba: u64, count: u64, payload: SgList) -> cmi::io::Completion {
        let v = volume();
        run(&v, opcode, lba, count, payload)
    }

    fn run(
        v: &Volume,
        opcode: BlockOpcode,
        lba: u64,
        count: u64,
        payload: SgList,
    ) -> cmi::io::Completion {
        let (op, pending) = Operation::block(BlockOperation::new(opcode, lba, count, 512), payload);
        v.submit(op);
        pending.wait_timeout(WAIT).unwrap()
    }

    #[test]
    fn write_verify_read() {
        let v = volume();
        let data: Vec<u8> = (0..1024).map(|i| i as u8).collect();
        assert!(run(&v, BlockOpcode::Write, 4, 2, SgList::single(data.clone()))
            .status
            .is_ok());
        assert!(run(&v, BlockOpcode::Verify, 4, 2, SgList::single(data.clone()))
            .status
            .is_ok());

        let c = run(&v, BlockOpcode::Read, 4, 2, SgList::zeroed(1024, 4));
        assert!(c.status.is_ok());
        assert_eq!(c.payload.gather(), data);

        let c = run(&v, BlockOpcode::Verify, 4, 1, SgList::single(vec![0xff; 512]));
        assert_eq!(c.status.code, StatusCode::GenericFailure);
        assert!(matches!(c.detail, StatusDetail::Block(b) if b.status == MISCOMPARE && b.bad_lba == 4));

        assert!(run(&v, BlockOpcode::Zero, 4, 2, SgList::new()).status.is_ok());
        assert_eq!(v.blocks_in_use(), 0);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let c = block(BlockOpcode::Read, 63, 2, SgList::zeroed(512, 2));
        assert_eq!(c.status.code, StatusCode::GenericFailure);
        assert!(matches!(c.detail, StatusDetail::Block(b) if b.status == BAD_LBA));
    }

    #[test]
    fn geometry_control() {
        let v = volume();
        let (op, pending) = Operation::control(CONTROL_GEOMETRY, SgList::zeroed(12, 1));
        v.submit(op);
        let c = pending.wait_timeout(WAIT).unwrap();
        assert!(c.status.is_ok());
        let reply = c.payload.gather();
        assert_eq!(&reply[..4], &512u32.to_le_bytes());
        assert_eq!(&reply[4..], &64u64.to_le_bytes());

        let (op, pending) = Operation::control(0xdead, SgList::zeroed(4, 1));
        v.submit(op);
        assert_eq!(
            pending.wait_timeout(WAIT).unwrap().status.code,
            StatusCode::GenericFailure
        );
    }

    #[test]
    fn shut_down_volume_refuses() {
        let v = volume();
        v.shutdown();
        let (op, pending) = Operation::control(CONTROL_GEOMETRY, SgList::zeroed(12, 1));
        v.submit(op);
        assert_eq!(
            pending.wait_timeout(WAIT).unwrap().status.code,
            StatusCode::NoDevice
        );
    }
}
