//! # Buffer Pool
//!
//! Per-descriptor pooling of [`Segment`]s and chains. A pool owns a fixed
//! arena and four index-linked queues:
//!
//! - **free segments** and **free chains** — the allocation side, guarded
//!   by thresholds that keep headroom in reserve,
//! - **pending RX** and **pending TX** — chains parked between a driver
//!   and the protocol layer above it.
//!
//! One [`Condition`] is embedded in the pool, and every exhaustion wait
//! and replenishment wake flows through it: an allocation that cannot be
//! satisfied parks the caller (when asked to) with the level it needs,
//! and every release resumes exactly the waiters whose recorded level is
//! now available. That is the backpressure path: a producer pushing into
//! a drained pool suspends until a consumer returns segments.
//!
//! ## Zero-copy shape
//!
//! Chains span segments; bytes are only copied between caller memory and
//! segment storage. Prepending a header reuses head room when a previous
//! pull left any, growing the chain frontwards otherwise; [`divide`]
//! cuts a chain at a byte offset without touching the completed part;
//! [`merge`] splices whole chains by relinking.
//!
//! [`divide`]: BufferPool::divide
//! [`merge`]: BufferPool::merge

use bitflags::bitflags;
use core::cell::RefCell;

use crate::buffer::{ChainId, SegId, Segment};
use crate::condition::{
    Condition, ConditionFlags, ConditionOps, LevelKind, Resume, Suspend, SuspendEngine, WaitParam,
    WakeStatus,
};
use crate::config::{POOL_CHAINS, POOL_SEGMENTS, SEGMENT_SIZE};
use crate::error::Error;
use crate::scheduler::Scheduler;

// ---------------------------------------------------------------------------
// Flags and configuration
// ---------------------------------------------------------------------------

bitflags! {
    /// Buffer operation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferFlags: u8 {
        /// Push at the chain head (prepend). Push default is the tail.
        const HEAD = 0b0_0001;
        /// Pull from the chain tail. Pull default is the head.
        const TAIL = 0b0_0010;
        /// Network byte order: reverse the bytes during the copy on
        /// little-endian targets.
        const PACKED = 0b0_0100;
        /// Park on the pool condition when the free lists cannot satisfy
        /// the request. Without it, exhaustion is an immediate
        /// [`Error::NoSpace`].
        const SUSPEND = 0b0_1000;
        /// Honor the configured threshold headroom. Callers without this
        /// flag are privileged and may dig into the reserve.
        const THRESHOLD = 0b1_0000;
    }
}

/// Run-time pool tuning. The thresholds reserve free-list headroom so the
/// privileged paths (typically the receive side that must drain a device)
/// cannot be starved by ordinary allocations.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolConfig {
    pub threshold_segments: usize,
    pub threshold_chains: usize,
}

/// Which pending-traffic queue an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDir {
    Receive,
    Transmit,
}

// ---------------------------------------------------------------------------
// Arena internals
// ---------------------------------------------------------------------------

/// An ordered sequence of segments holding one logical message.
struct Chain {
    head: Option<SegId>,
    tail: Option<SegId>,
    total_length: usize,
    /// Queue link; a chain sits in at most one queue at a time.
    next: Option<ChainId>,
}

impl Chain {
    const EMPTY: Chain = Chain { head: None, tail: None, total_length: 0, next: None };
}

struct SegQueue {
    head: Option<SegId>,
    tail: Option<SegId>,
    count: usize,
}

struct ChainQueue {
    head: Option<ChainId>,
    tail: Option<ChainId>,
    count: usize,
}

struct PoolInner {
    segments: [Segment; POOL_SEGMENTS],
    chains: [Chain; POOL_CHAINS],
    free_segments: SegQueue,
    free_chains: ChainQueue,
    rx: ChainQueue,
    tx: ChainQueue,
    config: PoolConfig,
}

fn chain_queue_push(chains: &mut [Chain; POOL_CHAINS], queue: &mut ChainQueue, id: ChainId, at_head: bool) {
    debug_assert!(chains[id.index()].next.is_none());
    if at_head {
        chains[id.index()].next = queue.head;
        queue.head = Some(id);
        if queue.tail.is_none() {
            queue.tail = Some(id);
        }
    } else {
        chains[id.index()].next = None;
        match queue.tail {
            Some(tail) => chains[tail.index()].next = Some(id),
            None => queue.head = Some(id),
        }
        queue.tail = Some(id);
    }
    queue.count += 1;
}

fn chain_queue_pop(chains: &mut [Chain; POOL_CHAINS], queue: &mut ChainQueue) -> Option<ChainId> {
    let id = queue.head?;
    queue.head = chains[id.index()].next.take();
    if queue.head.is_none() {
        queue.tail = None;
    }
    queue.count -= 1;
    Some(id)
}

impl PoolInner {
    fn push_free_segment(&mut self, id: SegId) {
        self.segments[id.index()].reset();
        match self.free_segments.tail {
            Some(tail) => self.segments[tail.index()].next = Some(id),
            None => self.free_segments.head = Some(id),
        }
        self.free_segments.tail = Some(id);
        self.free_segments.count += 1;
    }

    fn pop_free_segment(&mut self) -> Option<SegId> {
        let id = self.free_segments.head?;
        self.free_segments.head = self.segments[id.index()].next.take();
        if self.free_segments.head.is_none() {
            self.free_segments.tail = None;
        }
        self.free_segments.count -= 1;
        Some(id)
    }

    fn push_free_chain(&mut self, id: ChainId) {
        {
            let chain = &mut self.chains[id.index()];
            debug_assert!(chain.head.is_none() && chain.tail.is_none());
            chain.total_length = 0;
            chain.next = None;
        }
        let PoolInner { chains, free_chains, .. } = self;
        chain_queue_push(chains, free_chains, id, false);
    }

    fn pop_free_chain(&mut self) -> Option<ChainId> {
        let PoolInner { chains, free_chains, .. } = self;
        chain_queue_pop(chains, free_chains)
    }

    fn chain_push_front(&mut self, chain: ChainId, seg: SegId) {
        self.segments[seg.index()].next = self.chains[chain.index()].head;
        let chain = &mut self.chains[chain.index()];
        chain.head = Some(seg);
        if chain.tail.is_none() {
            chain.tail = Some(seg);
        }
    }

    fn chain_push_back(&mut self, chain: ChainId, seg: SegId) {
        self.segments[seg.index()].next = None;
        match self.chains[chain.index()].tail {
            Some(tail) => self.segments[tail.index()].next = Some(seg),
            None => self.chains[chain.index()].head = Some(seg),
        }
        self.chains[chain.index()].tail = Some(seg);
    }

    fn chain_pop_front(&mut self, chain: ChainId) -> Option<SegId> {
        let id = self.chains[chain.index()].head?;
        let next = self.segments[id.index()].next.take();
        let chain = &mut self.chains[chain.index()];
        chain.head = next;
        if next.is_none() {
            chain.tail = None;
        }
        Some(id)
    }

    fn chain_pop_back(&mut self, chain: ChainId) -> Option<SegId> {
        let tail = self.chains[chain.index()].tail?;
        let mut prev: Option<SegId> = None;
        let mut cursor = self.chains[chain.index()].head;
        while let Some(id) = cursor {
            if id == tail {
                break;
            }
            prev = Some(id);
            cursor = self.segments[id.index()].next;
        }
        match prev {
            Some(prev) => {
                self.segments[prev.index()].next = None;
                self.chains[chain.index()].tail = Some(prev);
            }
            None => {
                let chain = &mut self.chains[chain.index()];
                chain.head = None;
                chain.tail = None;
            }
        }
        Some(tail)
    }

    /// Fresh segments a push of `len` bytes will consume, beyond the room
    /// the edge segment already offers.
    fn segments_needed(&self, chain: ChainId, len: usize, at_head: bool) -> usize {
        let chain = &self.chains[chain.index()];
        let room = if at_head {
            chain.head.map_or(0, |id| self.segments[id.index()].space())
        } else {
            chain.tail.map_or(0, |id| self.segments[id.index()].tail_room())
        };
        len.saturating_sub(room).div_ceil(SEGMENT_SIZE)
    }

    /// Append the region `v` (the source, possibly byte-reversed) to the
    /// chain tail, chunked across segments.
    fn copy_in_back(&mut self, chain: ChainId, src: &[u8], rev: bool) {
        let mut pos = 0;
        while pos < src.len() {
            let has_room = self.chains[chain.index()]
                .tail
                .map_or(false, |id| self.segments[id.index()].tail_room() > 0);
            if !has_room {
                let Some(id) = self.pop_free_segment() else {
                    unreachable!("reserved segments missing from the free list")
                };
                self.chain_push_back(chain, id);
            }
            let Some(tail) = self.chains[chain.index()].tail else {
                unreachable!("chain lost its tail during a push")
            };
            let n = {
                let seg = &mut self.segments[tail.index()];
                let n = seg.tail_room().min(src.len() - pos);
                copy_from_view(seg.append_slot(n), src, pos, rev);
                n
            };
            self.chains[chain.index()].total_length += n;
            pos += n;
        }
    }

    /// Prepend the region `v` to the chain head. The existing head
    /// segment absorbs the final chunk of the new region (zero-copy when
    /// it has head room); earlier chunks go into fresh segments chained
    /// in front, filled backwards.
    fn copy_in_front(&mut self, chain: ChainId, src: &[u8], rev: bool) {
        let mut remaining = src.len();
        if let Some(head) = self.chains[chain.index()].head {
            let n = {
                let seg = &mut self.segments[head.index()];
                let n = seg.space().min(remaining);
                if n > 0 {
                    copy_from_view(seg.prepend_slot(n), src, remaining - n, rev);
                }
                n
            };
            remaining -= n;
            self.chains[chain.index()].total_length += n;
        }
        while remaining > 0 {
            let Some(id) = self.pop_free_segment() else {
                unreachable!("reserved segments missing from the free list")
            };
            let n = {
                let seg = &mut self.segments[id.index()];
                seg.reserve_head();
                let n = SEGMENT_SIZE.min(remaining);
                copy_from_view(seg.prepend_slot(n), src, remaining - n, rev);
                n
            };
            self.chain_push_front(chain, id);
            self.chains[chain.index()].total_length += n;
            remaining -= n;
        }
    }
}

/// Copy out of the logical source region `v`, where `v` is `src` itself
/// or, for network-order pushes on a little-endian target, `src`
/// reversed. `pos` indexes into `v`.
fn copy_from_view(dst: &mut [u8], src: &[u8], pos: usize, rev: bool) {
    if rev {
        for (j, byte) in dst.iter_mut().enumerate() {
            *byte = src[src.len() - 1 - (pos + j)];
        }
    } else {
        dst.copy_from_slice(&src[pos..pos + dst.len()]);
    }
}

fn reversed(flags: BufferFlags) -> bool {
    flags.contains(BufferFlags::PACKED) && cfg!(target_endian = "little")
}

/// Where a chain cut lands.
enum Cut {
    /// `at` coincides with the end of this segment.
    Boundary(SegId),
    /// `at` falls inside this segment, `keep` bytes in.
    Straddle(SegId, usize),
}

// ---------------------------------------------------------------------------
// The pool
// ---------------------------------------------------------------------------

/// A buffer pool: segment/chain arena, free lists, pending-traffic
/// queues, and the embedded backpressure condition.
pub struct BufferPool {
    inner: RefCell<PoolInner>,
    condition: Condition,
}

impl BufferPool {
    /// Build a pool with every segment and chain on its free list.
    pub fn new(config: PoolConfig) -> Self {
        let mut inner = PoolInner {
            segments: [Segment::EMPTY; POOL_SEGMENTS],
            chains: [Chain::EMPTY; POOL_CHAINS],
            free_segments: SegQueue { head: None, tail: None, count: 0 },
            free_chains: ChainQueue { head: None, tail: None, count: 0 },
            rx: ChainQueue { head: None, tail: None, count: 0 },
            tx: ChainQueue { head: None, tail: None, count: 0 },
            config,
        };
        for i in 0..POOL_SEGMENTS {
            inner.push_free_segment(SegId(i as u16));
        }
        for i in 0..POOL_CHAINS {
            inner.push_free_chain(ChainId(i as u16));
        }
        BufferPool { inner: RefCell::new(inner), condition: Condition::new(ConditionFlags::empty()) }
    }

    /// The pool's backpressure condition. Exposed so an owner tearing the
    /// pool down can kick the remaining waiters (stamping
    /// [`WakeStatus::Deleted`]).
    pub fn condition(&self) -> &Condition {
        &self.condition
    }

    pub fn free_segments(&self) -> usize {
        self.inner.borrow().free_segments.count
    }

    pub fn free_chains(&self) -> usize {
        self.inner.borrow().free_chains.count
    }

    pub fn queued(&self, dir: QueueDir) -> usize {
        let inner = self.inner.borrow();
        match dir {
            QueueDir::Receive => inner.rx.count,
            QueueDir::Transmit => inner.tx.count,
        }
    }

    /// True once either free list has fallen to its threshold; feeding
    /// more data upward now risks complete starvation of the reserve.
    pub fn threshold_reached(&self) -> bool {
        let inner = self.inner.borrow();
        inner.free_segments.count <= inner.config.threshold_segments
            || inner.free_chains.count <= inner.config.threshold_chains
    }

    pub fn chain_len(&self, chain: ChainId) -> usize {
        self.inner.borrow().chains[chain.index()].total_length
    }

    /// Number of segments currently linked into a chain.
    pub fn chain_segments(&self, chain: ChainId) -> usize {
        let inner = self.inner.borrow();
        let mut count = 0;
        let mut cursor = inner.chains[chain.index()].head;
        while let Some(id) = cursor {
            count += 1;
            cursor = inner.segments[id.index()].next;
        }
        count
    }

    // -- allocation ---------------------------------------------------------

    /// Take a segment from the free list, honoring threshold and suspend
    /// policy per `flags`.
    pub fn alloc_segment(
        &self,
        engine: &SuspendEngine,
        sched: &dyn Scheduler,
        flags: BufferFlags,
    ) -> Result<SegId, Error> {
        self.reserve(engine, sched, LevelKind::Items, 1, flags)?;
        match self.inner.borrow_mut().pop_free_segment() {
            Some(id) => Ok(id),
            None => unreachable!("free list empty after reservation"),
        }
    }

    /// Take an empty chain from the free list.
    pub fn alloc_chain(
        &self,
        engine: &SuspendEngine,
        sched: &dyn Scheduler,
        flags: BufferFlags,
    ) -> Result<ChainId, Error> {
        self.reserve(engine, sched, LevelKind::Lists, 1, flags)?;
        match self.inner.borrow_mut().pop_free_chain() {
            Some(id) => Ok(id),
            None => unreachable!("free chain list empty after reservation"),
        }
    }

    /// Return a segment and wake the waiters its arrival satisfies.
    pub fn free_segment(&self, engine: &SuspendEngine, sched: &dyn Scheduler, id: SegId) {
        let available = {
            let mut inner = self.inner.borrow_mut();
            inner.push_free_segment(id);
            inner.free_segments.count
        };
        self.notify(engine, sched, LevelKind::Items, available);
    }

    /// Return a chain, recursively freeing its member segments first.
    pub fn free_chain(&self, engine: &SuspendEngine, sched: &dyn Scheduler, id: ChainId) {
        loop {
            let seg = self.inner.borrow_mut().chain_pop_front(id);
            match seg {
                Some(seg) => self.free_segment(engine, sched, seg),
                None => break,
            }
        }
        let available = {
            let mut inner = self.inner.borrow_mut();
            inner.chains[id.index()].total_length = 0;
            inner.push_free_chain(id);
            inner.free_chains.count
        };
        self.notify(engine, sched, LevelKind::Lists, available);
    }

    /// Block (or fail) until the free list of `kind` holds `need` items
    /// plus, with [`BufferFlags::THRESHOLD`], the configured headroom.
    fn reserve(
        &self,
        engine: &SuspendEngine,
        sched: &dyn Scheduler,
        kind: LevelKind,
        need: usize,
        flags: BufferFlags,
    ) -> Result<(), Error> {
        loop {
            let (available, threshold) = {
                let inner = self.inner.borrow();
                match kind {
                    LevelKind::Items => (inner.free_segments.count, inner.config.threshold_segments),
                    LevelKind::Lists => (inner.free_chains.count, inner.config.threshold_chains),
                }
            };
            let want = if flags.contains(BufferFlags::THRESHOLD) { threshold + need } else { need };
            if available >= want {
                return Ok(());
            }
            if !flags.contains(BufferFlags::SUSPEND) {
                log::debug!("pool exhausted: want {} {:?}, have {}", want, kind, available);
                return Err(Error::NoSpace);
            }
            engine.wait(
                sched,
                &self.condition,
                self,
                Suspend::new(WaitParam::Level { kind, amount: want }),
            )?;
        }
    }

    /// Wake the waiters whose recorded level the free list now covers.
    fn notify(&self, engine: &SuspendEngine, sched: &dyn Scheduler, kind: LevelKind, available: usize) {
        let matcher = move |param: &WaitParam| match *param {
            WaitParam::Level { kind: wanted, amount } => wanted == kind && available >= amount,
            _ => false,
        };
        engine.resume(sched, &self.condition, self, &Resume::matching(&matcher, WakeStatus::Resumed));
    }

    // -- pending-traffic queues --------------------------------------------

    /// Park a chain on the RX or TX queue, at the back by default.
    pub fn enqueue(&self, dir: QueueDir, chain: ChainId, at_head: bool) {
        let mut inner = self.inner.borrow_mut();
        let PoolInner { chains, rx, tx, .. } = &mut *inner;
        let queue = match dir {
            QueueDir::Receive => rx,
            QueueDir::Transmit => tx,
        };
        chain_queue_push(chains, queue, chain, at_head);
    }

    pub fn dequeue(&self, dir: QueueDir) -> Option<ChainId> {
        let mut inner = self.inner.borrow_mut();
        let PoolInner { chains, rx, tx, .. } = &mut *inner;
        let queue = match dir {
            QueueDir::Receive => rx,
            QueueDir::Transmit => tx,
        };
        chain_queue_pop(chains, queue)
    }

    /// Front of the queue without removing it.
    pub fn peek(&self, dir: QueueDir) -> Option<ChainId> {
        let inner = self.inner.borrow();
        match dir {
            QueueDir::Receive => inner.rx.head,
            QueueDir::Transmit => inner.tx.head,
        }
    }

    // -- data movement ------------------------------------------------------

    /// Add bytes at the tail (default) or head ([`BufferFlags::HEAD`]) of
    /// a chain, spanning segments and allocating fresh ones as needed
    /// under the threshold/suspend policy. The whole requirement is
    /// reserved before any byte moves, so a push never suspends halfway.
    pub fn push(
        &self,
        engine: &SuspendEngine,
        sched: &dyn Scheduler,
        chain: ChainId,
        data: &[u8],
        flags: BufferFlags,
    ) -> Result<(), Error> {
        assert!(!flags.contains(BufferFlags::TAIL), "push takes HEAD or the default tail");
        if data.is_empty() {
            return Ok(());
        }
        let at_head = flags.contains(BufferFlags::HEAD);
        let need = self.inner.borrow().segments_needed(chain, data.len(), at_head);
        if need > 0 {
            self.reserve(engine, sched, LevelKind::Items, need, flags)?;
        }
        let rev = reversed(flags);
        let mut inner = self.inner.borrow_mut();
        if at_head {
            inner.copy_in_front(chain, data, rev);
        } else {
            inner.copy_in_back(chain, data, rev);
        }
        Ok(())
    }

    /// Remove `out.len()` bytes from the head (default) or tail
    /// ([`BufferFlags::TAIL`]) of a chain into `out`. Emptied segments go
    /// back to the free list, waking pool waiters.
    pub fn pull(
        &self,
        engine: &SuspendEngine,
        sched: &dyn Scheduler,
        chain: ChainId,
        out: &mut [u8],
        flags: BufferFlags,
    ) -> Result<(), Error> {
        let size = out.len();
        self.pull_impl(engine, sched, chain, Some(out), size, flags)
    }

    /// Remove and discard `len` bytes.
    pub fn pull_discard(
        &self,
        engine: &SuspendEngine,
        sched: &dyn Scheduler,
        chain: ChainId,
        len: usize,
        flags: BufferFlags,
    ) -> Result<(), Error> {
        self.pull_impl(engine, sched, chain, None, len, flags)
    }

    fn pull_impl(
        &self,
        engine: &SuspendEngine,
        sched: &dyn Scheduler,
        chain: ChainId,
        mut out: Option<&mut [u8]>,
        size: usize,
        flags: BufferFlags,
    ) -> Result<(), Error> {
        assert!(!flags.contains(BufferFlags::HEAD), "pull takes TAIL or the default head");
        let from_tail = flags.contains(BufferFlags::TAIL);
        let rev = reversed(flags);

        if self.inner.borrow().chains[chain.index()].total_length < size {
            return Err(Error::NoSpace);
        }

        let mut freed: [Option<SegId>; POOL_SEGMENTS] = [None; POOL_SEGMENTS];
        let mut freed_count = 0;
        {
            let mut inner = self.inner.borrow_mut();
            let mut done = 0;
            while done < size {
                let edge = if from_tail {
                    inner.chains[chain.index()].tail
                } else {
                    inner.chains[chain.index()].head
                };
                let Some(seg_id) = edge else {
                    unreachable!("chain shorter than its recorded length")
                };
                let (n, emptied) = {
                    let seg = &mut inner.segments[seg_id.index()];
                    let n = seg.len().min(size - done);
                    if let Some(out) = out.as_deref_mut() {
                        let bytes =
                            if from_tail { seg.slice(seg.len() - n, n) } else { seg.slice(0, n) };
                        if rev {
                            for (j, &byte) in bytes.iter().enumerate() {
                                out[size - 1 - (done + j)] = byte;
                            }
                        } else {
                            out[done..done + n].copy_from_slice(bytes);
                        }
                    }
                    if from_tail {
                        seg.drop_tail(n);
                    } else {
                        seg.drop_head(n);
                    }
                    (n, seg.is_empty())
                };
                if emptied {
                    if from_tail {
                        inner.chain_pop_back(chain);
                    } else {
                        inner.chain_pop_front(chain);
                    }
                    freed[freed_count] = Some(seg_id);
                    freed_count += 1;
                }
                inner.chains[chain.index()].total_length -= n;
                done += n;
            }
        }
        for id in freed.iter().flatten() {
            self.free_segment(engine, sched, *id);
        }
        Ok(())
    }

    /// Non-destructive read of `out.len()` bytes at a byte offset from
    /// the head (default) or from the tail ([`BufferFlags::TAIL`]).
    pub fn peek_at(
        &self,
        chain: ChainId,
        out: &mut [u8],
        offset: usize,
        flags: BufferFlags,
    ) -> Result<(), Error> {
        assert!(!flags.contains(BufferFlags::HEAD), "peek takes TAIL or the default head");
        let inner = self.inner.borrow();
        let total = inner.chains[chain.index()].total_length;
        let size = out.len();
        if total < size + offset {
            return Err(Error::NoSpace);
        }
        // A tail-side offset is the same read at the mirrored head offset.
        let mut offset =
            if flags.contains(BufferFlags::TAIL) { total - (offset + size) } else { offset };
        let rev = reversed(flags);

        let mut cursor = inner.chains[chain.index()].head;
        while let Some(id) = cursor {
            let seg = &inner.segments[id.index()];
            if offset < seg.len() {
                break;
            }
            offset -= seg.len();
            cursor = seg.next;
        }
        let mut done = 0;
        while done < size {
            let Some(id) = cursor else {
                unreachable!("chain shorter than its recorded length")
            };
            let seg = &inner.segments[id.index()];
            let n = (seg.len() - offset).min(size - done);
            let bytes = seg.slice(offset, n);
            if rev {
                for (j, &byte) in bytes.iter().enumerate() {
                    out[size - 1 - (done + j)] = byte;
                }
            } else {
                out[done..done + n].copy_from_slice(bytes);
            }
            done += n;
            offset = 0;
            cursor = seg.next;
        }
        Ok(())
    }

    /// Overwrite bytes in place at a byte offset from the head
    /// ([`BufferFlags::HEAD`]) or from the tail (default). This is the
    /// fix-up path for checksums and length fields after a frame is built.
    pub fn update(
        &self,
        chain: ChainId,
        data: &[u8],
        offset: usize,
        flags: BufferFlags,
    ) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        let total = inner.chains[chain.index()].total_length;
        if total < data.len() + offset {
            return Err(Error::NoSpace);
        }
        let mut offset =
            if flags.contains(BufferFlags::HEAD) { offset } else { total - (data.len() + offset) };
        let rev = reversed(flags);

        let mut cursor = inner.chains[chain.index()].head;
        while let Some(id) = cursor {
            let seg = &inner.segments[id.index()];
            if offset < seg.len() {
                break;
            }
            offset -= seg.len();
            cursor = seg.next;
        }
        let mut done = 0;
        while done < data.len() {
            let Some(id) = cursor else {
                unreachable!("chain shorter than its recorded length")
            };
            let n = {
                let seg = &mut inner.segments[id.index()];
                let n = (seg.len() - offset).min(data.len() - done);
                copy_from_view(seg.slice_mut(offset, n), data, done, rev);
                n
            };
            done += n;
            offset = 0;
            cursor = inner.segments[id.index()].next;
        }
        Ok(())
    }

    /// Split a chain at byte offset `at` (`0 < at < total_length`) into
    /// two. A cut at a segment boundary only relinks; a cut inside a
    /// segment copies the remainder into a freshly allocated one, leaving
    /// the completed head portion untouched. Returns the new chain
    /// holding the tail portion.
    pub fn divide(
        &self,
        engine: &SuspendEngine,
        sched: &dyn Scheduler,
        chain: ChainId,
        at: usize,
        flags: BufferFlags,
    ) -> Result<ChainId, Error> {
        let total = self.chain_len(chain);
        assert!(at > 0 && at < total, "divide offset {} outside 1..{}", at, total);

        let new_chain = self.alloc_chain(engine, sched, flags)?;
        let cut = {
            let inner = self.inner.borrow();
            let mut remaining = at;
            let mut cursor = inner.chains[chain.index()].head;
            loop {
                let Some(id) = cursor else {
                    unreachable!("chain shorter than its recorded length")
                };
                let seg = &inner.segments[id.index()];
                if remaining < seg.len() {
                    break Cut::Straddle(id, remaining);
                }
                remaining -= seg.len();
                if remaining == 0 {
                    break Cut::Boundary(id);
                }
                cursor = seg.next;
            }
        };
        let spare = match cut {
            Cut::Straddle(..) => match self.alloc_segment(engine, sched, flags) {
                Ok(id) => Some(id),
                Err(error) => {
                    self.free_chain(engine, sched, new_chain);
                    return Err(error);
                }
            },
            Cut::Boundary(_) => None,
        };

        let mut inner = self.inner.borrow_mut();
        let old_tail = inner.chains[chain.index()].tail;
        match cut {
            Cut::Boundary(last) => {
                let rest = inner.segments[last.index()].next.take();
                let new = &mut inner.chains[new_chain.index()];
                new.head = rest;
                new.tail = old_tail;
                inner.chains[chain.index()].tail = Some(last);
            }
            Cut::Straddle(split, keep) => {
                let Some(spare) = spare else {
                    unreachable!("straddling divide without a spare segment")
                };
                let rest = {
                    let (src, dst) = two_mut(&mut inner.segments, split, spare);
                    let moved = src.len() - keep;
                    dst.reset();
                    dst.append_slot(moved).copy_from_slice(src.slice(keep, moved));
                    src.drop_tail(moved);
                    src.next.take()
                };
                inner.segments[spare.index()].next = rest;
                let new = &mut inner.chains[new_chain.index()];
                new.head = Some(spare);
                new.tail = if old_tail == Some(split) { Some(spare) } else { old_tail };
                inner.chains[chain.index()].tail = Some(split);
            }
        }
        inner.chains[new_chain.index()].total_length = total - at;
        inner.chains[chain.index()].total_length = at;
        Ok(new_chain)
    }

    /// Splice every segment of `src` onto `dst` without copying, at the
    /// head or the tail. `src` stays allocated, empty, for its owner to
    /// reuse or free.
    pub fn merge(&self, dst: ChainId, src: ChainId, at_head: bool) {
        let mut inner = self.inner.borrow_mut();
        let PoolInner { chains, segments, .. } = &mut *inner;
        let src_head = chains[src.index()].head.take();
        let src_tail = chains[src.index()].tail.take();
        let src_total = core::mem::take(&mut chains[src.index()].total_length);
        let Some(src_head) = src_head else {
            return;
        };
        let Some(src_tail) = src_tail else {
            unreachable!("chain with a head but no tail")
        };
        if at_head {
            segments[src_tail.index()].next = chains[dst.index()].head;
            chains[dst.index()].head = Some(src_head);
            if chains[dst.index()].tail.is_none() {
                chains[dst.index()].tail = Some(src_tail);
            }
        } else {
            match chains[dst.index()].tail {
                Some(tail) => segments[tail.index()].next = Some(src_head),
                None => chains[dst.index()].head = Some(src_head),
            }
            chains[dst.index()].tail = Some(src_tail);
        }
        chains[dst.index()].total_length += src_total;
    }
}

impl ConditionOps for BufferPool {
    fn lock(&self, sched: &dyn Scheduler) {
        sched.lock_scheduler();
    }

    fn unlock(&self, sched: &dyn Scheduler) {
        sched.unlock_scheduler();
    }

    fn should_suspend(&self, param: &WaitParam) -> bool {
        let inner = self.inner.borrow();
        match *param {
            WaitParam::Level { kind: LevelKind::Items, amount } => inner.free_segments.count < amount,
            WaitParam::Level { kind: LevelKind::Lists, amount } => inner.free_chains.count < amount,
            _ => true,
        }
    }
}

/// Distinct mutable references to two arena segments.
fn two_mut(segments: &mut [Segment; POOL_SEGMENTS], a: SegId, b: SegId) -> (&mut Segment, &mut Segment) {
    let (a, b) = (a.index(), b.index());
    assert!(a != b);
    if a < b {
        let (low, high) = segments.split_at_mut(b);
        (&mut low[a], &mut high[0])
    } else {
        let (low, high) = segments.split_at_mut(a);
        (&mut high[0], &mut low[b])
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
