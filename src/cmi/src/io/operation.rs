//! Block and control operations as seen by the local I/O consumer.
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};

static NEXT_OP_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique handle of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId(pub u64);

impl OpId {
    fn next() -> Self {
        OpId(NEXT_OP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    /// The peer could not be reached; the caller may retry.
    Failed,
    Cancelled,
    PeerBusy,
    NoDevice,
    GenericFailure,
}

impl StatusCode {
    #[inline]
    pub fn is_retryable(self) -> bool {
        matches!(self, StatusCode::Failed | StatusCode::PeerBusy | StatusCode::NoDevice)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpStatus {
    pub code: StatusCode,
    pub qualifier: u32,
}

impl OpStatus {
    #[inline]
    pub const fn new(code: StatusCode) -> Self {
        OpStatus { code, qualifier: 0 }
    }

    #[inline]
    pub const fn ok() -> Self {
        Self::new(StatusCode::Ok)
    }

    #[inline]
    pub const fn with_qualifier(code: StatusCode, qualifier: u32) -> Self {
        OpStatus { code, qualifier }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStatus {
    pub status: u32,
    pub qualifier: u32,
    pub retry_msecs: u32,
    pub bad_lba: u64,
    pub service_time_ms: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlStatus {
    pub status: u32,
    pub qualifier: u32,
}

/// Kind-specific status the consumer attaches to a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusDetail {
    None,
    Block(BlockStatus),
    Control(ControlStatus),
}

impl Default for StatusDetail {
    fn default() -> Self {
        StatusDetail::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockOpcode {
    Read,
    Write,
    WriteVerify,
    Verify,
    Zero,
    /// Writes one block repeated `block_count` times.
    WriteSame,
}

impl BlockOpcode {
    #[inline]
    pub fn returns_data(self) -> bool {
        self == BlockOpcode::Read
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockOperation {
    pub opcode: BlockOpcode,
    pub flags: u32,
    pub lba: u64,
    pub block_count: u64,
    pub block_size: u32,
    pub optimum_block_size: u32,
    pub repeat_count: u32,
}

impl BlockOperation {
    pub fn new(opcode: BlockOpcode, lba: u64, block_count: u64, block_size: u32) -> Self {
        BlockOperation {
            opcode,
            flags: 0,
            lba,
            block_count,
            block_size,
            optimum_block_size: block_size,
            repeat_count: 1,
        }
    }

    /// Length of the addressed range, or `None` when it does not fit 32 bits.
    pub fn range_len(&self) -> Option<u32> {
        self.block_count
            .checked_mul(self.block_size as u64)
            .and_then(|len| u32::try_from(len).ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlOperation {
    pub opcode: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Block(BlockOperation),
    Control(ControlOperation),
}

bitflags! {
    #[derive(Default, Serialize, Deserialize)]
    pub struct OpAttrs: u32 {
        /// Reconstructed from a request of the peer.
        const REDIRECTED = 0b0001;
        const NO_RETRY = 0b0010;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationHeader {
    pub object_id: u64,
    pub cpu_id: u32,
    pub attributes: OpAttrs,
    pub priority: u8,
    pub traffic_priority: u8,
    pub service_time_ms: u32,
}

/// Scatter/gather list of owned segments.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SgList {
    segments: Vec<Vec<u8>>,
}

impl fmt::Debug for SgList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SgList({} segments, {} bytes)", self.segments.len(), self.len())
    }
}

impl SgList {
    pub fn new() -> Self {
        SgList::default()
    }

    pub fn from_segments(segments: Vec<Vec<u8>>) -> Self {
        SgList { segments }
    }

    pub fn single(data: Vec<u8>) -> Self {
        SgList {
            segments: vec![data],
        }
    }

    /// `count` zeroed segments covering `len` bytes.
    pub fn zeroed(len: usize, count: usize) -> Self {
        let count = count.max(1);
        let chunk = (len + count - 1) / count;
        let mut segments = Vec::with_capacity(count);
        let mut left = len;
        while left > 0 {
            let n = chunk.min(left);
            segments.push(vec![0; n]);
            left -= n;
        }
        SgList { segments }
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segments
    }

    pub fn into_segments(self) -> Vec<Vec<u8>> {
        self.segments
    }

    /// Copies every segment, in order, into `dst`. Returns the number of bytes copied.
    pub fn gather_into(&self, dst: &mut [u8]) -> usize {
        let mut off = 0;
        for seg in &self.segments {
            let n = seg.len().min(dst.len() - off);
            dst[off..off + n].copy_from_slice(&seg[..n]);
            off += n;
            if off == dst.len() {
                break;
            }
        }
        off
    }

    pub fn gather(&self) -> Vec<u8> {
        let mut buf = vec![0; self.len()];
        self.gather_into(&mut buf);
        buf
    }

    /// Spreads `src` over the existing segments. Returns the number of bytes copied.
    pub fn scatter(&mut self, src: &[u8]) -> usize {
        let mut off = 0;
        for seg in &mut self.segments {
            if off == src.len() {
                break;
            }
            let n = seg.len().min(src.len() - off);
            seg[..n].copy_from_slice(&src[off..off + n]);
            off += n;
        }
        off
    }
}

/// Shared cancellation flag with an optional wake-up hook.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    hook: spin::Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Marks the token cancelled. The hook runs on the first call only.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            let hook = self.inner.hook.lock().clone();
            if let Some(hook) = hook {
                hook();
            }
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Installs `hook`, running it right away if the token is already cancelled.
    pub fn on_cancel(&self, hook: Arc<dyn Fn() + Send + Sync>) {
        *self.inner.hook.lock() = Some(Arc::clone(&hook));
        if self.is_cancelled() {
            hook();
        }
    }

    pub fn clear_hook(&self) {
        self.inner.hook.lock().take();
    }
}

/// Terminal result of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub status: OpStatus,
    pub detail: StatusDetail,
    pub payload: SgList,
}

enum CompletionSink {
    Channel(Sender<Completion>),
    Hook(Box<dyn FnOnce(Completion) + Send>),
}

/// One block or control request. Completing it consumes it.
pub struct Operation {
    id: OpId,
    header: OperationHeader,
    kind: OperationKind,
    payload: SgList,
    cancel: CancelToken,
    sink: Option<CompletionSink>,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("payload", &self.payload)
            .finish()
    }
}

impl Operation {
    pub fn new(
        header: OperationHeader,
        kind: OperationKind,
        payload: SgList,
    ) -> (Operation, PendingOperation) {
        let (tx, rx) = channel::bounded(1);
        let cancel = CancelToken::new();
        let id = OpId::next();
        let op = Operation {
            id,
            header,
            kind,
            payload,
            cancel: cancel.clone(),
            sink: Some(CompletionSink::Channel(tx)),
        };
        (op, PendingOperation { id, cancel, rx })
    }

    pub fn block(block: BlockOperation, payload: SgList) -> (Operation, PendingOperation) {
        Self::new(
            OperationHeader::default(),
            OperationKind::Block(block),
            payload,
        )
    }

    pub fn control(opcode: u32, payload: SgList) -> (Operation, PendingOperation) {
        Self::new(
            OperationHeader::default(),
            OperationKind::Control(ControlOperation { opcode }),
            payload,
        )
    }

    pub(crate) fn with_hook(
        header: OperationHeader,
        kind: OperationKind,
        payload: SgList,
        cancel: CancelToken,
        hook: Box<dyn FnOnce(Completion) + Send>,
    ) -> Operation {
        Operation {
            id: OpId::next(),
            header,
            kind,
            payload,
            cancel,
            sink: Some(CompletionSink::Hook(hook)),
        }
    }

    #[inline]
    pub fn id(&self) -> OpId {
        self.id
    }

    #[inline]
    pub fn header(&self) -> &OperationHeader {
        &self.header
    }

    #[inline]
    pub fn header_mut(&mut self) -> &mut OperationHeader {
        &mut self.header
    }

    #[inline]
    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    #[inline]
    pub fn payload(&self) -> &SgList {
        &self.payload
    }

    #[inline]
    pub fn payload_mut(&mut self) -> &mut SgList {
        &mut self.payload
    }

    #[inline]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the peer sends data back in the response.
    pub fn returns_data(&self) -> bool {
        match &self.kind {
            OperationKind::Block(block) => block.opcode.returns_data(),
            OperationKind::Control(_) => true,
        }
    }

    /// Bytes this operation puts in its request.
    pub fn request_len(&self) -> usize {
        match &self.kind {
            OperationKind::Block(block) if block.opcode.returns_data() => 0,
            _ => self.payload.len(),
        }
    }

    /// Bytes that travel through one slot in either direction.
    pub fn transfer_len(&self) -> usize {
        match &self.kind {
            OperationKind::Block(block) => match block.opcode {
                BlockOpcode::Read => block.range_len().unwrap_or(u32::MAX) as usize,
                _ => self.payload.len(),
            },
            OperationKind::Control(_) => self.payload.len(),
        }
    }

    /// Checks that the geometry and the payload agree.
    pub fn validate(&self) -> Result<(), String> {
        let block = match &self.kind {
            OperationKind::Block(block) => block,
            OperationKind::Control(_) => return Ok(()),
        };
        if block.block_size == 0 {
            return Err("zero block size".to_owned());
        }
        let range = block.range_len().ok_or_else(|| {
            format!(
                "{} blocks of {} bytes exceed 32 bits",
                block.block_count, block.block_size
            )
        })? as usize;
        let payload = self.payload.len();
        let expected = match block.opcode {
            BlockOpcode::Read => {
                if payload != 0 && payload != range {
                    return Err(format!("read buffer of {} bytes for {} bytes", payload, range));
                }
                return Ok(());
            }
            BlockOpcode::Write | BlockOpcode::WriteVerify => range,
            BlockOpcode::WriteSame => block.block_size as usize,
            BlockOpcode::Verify | BlockOpcode::Zero => 0,
        };
        if payload != expected {
            return Err(format!(
                "{:?} carries {} bytes, expected {}",
                block.opcode, payload, expected
            ));
        }
        Ok(())
    }

    pub fn complete(self, status: OpStatus, detail: StatusDetail) {
        self.finish(status, detail, None);
    }

    pub fn complete_with(self, status: StatusCode) {
        self.finish(OpStatus::new(status), StatusDetail::None, None);
    }

    /// Completes with `data` scattered into the payload, or set as the payload if empty.
    pub(crate) fn complete_with_data(self, status: OpStatus, detail: StatusDetail, data: &[u8]) {
        self.finish(status, detail, Some(data));
    }

    fn finish(mut self, status: OpStatus, detail: StatusDetail, data: Option<&[u8]>) {
        if let Some(data) = data {
            if self.payload.is_empty() {
                self.payload = SgList::single(data.to_vec());
            } else {
                self.payload.scatter(data);
            }
        }
        self.deliver(status, detail);
    }

    fn deliver(&mut self, status: OpStatus, detail: StatusDetail) {
        self.cancel.clear_hook();
        let completion = Completion {
            status,
            detail,
            payload: mem::take(&mut self.payload),
        };
        match self.sink.take() {
            Some(CompletionSink::Channel(tx)) => {
                if tx.send(completion).is_err() {
                    tracing::trace!("{} completed after its submitter went away", self.id);
                }
            }
            Some(CompletionSink::Hook(hook)) => hook(completion),
            None => {}
        }
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        if self.sink.is_some() {
            tracing::error!("{} dropped without completion", self.id);
            self.deliver(OpStatus::new(StatusCode::GenericFailure), StatusDetail::None);
        }
    }
}

/// Submitter side of an [`Operation`].
pub struct PendingOperation {
    id: OpId,
    cancel: CancelToken,
    rx: Receiver<Completion>,
}

impl PendingOperation {
    #[inline]
    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn wait(self) -> Completion {
        self.rx.recv().unwrap_or_else(|_| Self::lost())
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Completion> {
        match self.rx.recv_timeout(timeout) {
            Ok(c) => Some(c),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Self::lost()),
        }
    }

    pub fn try_result(&self) -> Option<Completion> {
        self.rx.try_recv().ok()
    }

    fn lost() -> Completion {
        Completion {
            status: OpStatus::new(StatusCode::GenericFailure),
            detail: StatusDetail::None,
            payload: SgList::new(),
        }
    }
}

/// The local I/O stack that executes operations, including those redirected by the peer.
pub trait IoConsumer: Send + Sync {
    fn submit(&self, operation: Operation);
}
