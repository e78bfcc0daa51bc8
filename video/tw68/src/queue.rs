// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Capture queue and chain scheduler
//!
//! Buffers owned by the queue move between three lists:
//!
//! - `stream`: every buffer handed to [`CaptureQueue::queue`], in order,
//!   until [`CaptureQueue::dequeue`] returns it.
//! - `active`: buffers whose programs are linked into the chain the engine
//!   is executing. Each program's tail jumps to the next one; the last
//!   jumps to the stopper.
//! - `queued`: buffers waiting for the active chain to drain, because their
//!   geometry cannot be spliced onto it or earlier buffers are waiting.
//!
//! Locking: `control` (a sleeping mutex) serializes the caller-side state
//! transitions. `inner` is a spinlock shared with the interrupt and timer
//! paths; it is never held across an allocation, a mapping call or a
//! wait. Order is always `control` then `inner`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use log::{debug, error, trace, warn};
use parking_lot::{Condvar, Mutex};
use spin::Mutex as SpinMutex;

use crate::buffer::{BufferHandle, BufferState, CaptureBuffer};
use crate::config::DriverConfig;
use crate::dma::DmaOps;
use crate::engine::DmaEngine;
use crate::error::{Error, Result};
use crate::format::{Geometry, Norm};
use crate::program::DmaProgram;
use crate::regs::{self, IntStatus, Registers};
use crate::risc::LineOffset;
use crate::stats::{QueueStats, QueueStatsSnapshot};

/// Fault reports kept for the service path before new ones are dropped
const FAULT_BACKLOG: usize = 16;

/// A buffer handed back by [`CaptureQueue::dequeue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedFrame {
    pub handle: BufferHandle,
    /// `Done` or `Error`
    pub state: BufferState,
    pub sequence: u32,
    pub timestamp: Option<Instant>,
    pub bytes_used: usize,
}

/// Point-in-time view of one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub state: BufferState,
    pub program_address: Option<u32>,
    pub tail_target: Option<u32>,
    pub hw_count: u32,
    pub sequence: u32,
}

struct QueueInner {
    buffers: Vec<Option<CaptureBuffer>>,
    stream: VecDeque<BufferHandle>,
    queued: VecDeque<BufferHandle>,
    active: VecDeque<BufferHandle>,
    stopper: DmaProgram,
    /// Next hardware position in the current run
    count: u32,
    /// Next frame sequence number
    sequence: u32,
    deadline: Option<Instant>,
    streaming: bool,
    fault: Option<IntStatus>,
}

impl QueueInner {
    fn buf(&self, h: BufferHandle) -> &CaptureBuffer {
        match self.buffers.get(h.0 as usize) {
            Some(Some(b)) => b,
            _ => panic!("tw68: buffer {} not resident", h.0),
        }
    }

    fn buf_mut(&mut self, h: BufferHandle) -> &mut CaptureBuffer {
        match self.buffers.get_mut(h.0 as usize) {
            Some(Some(b)) => b,
            _ => panic!("tw68: buffer {} not resident", h.0),
        }
    }

    fn compatible(&self, a: BufferHandle, b: BufferHandle) -> bool {
        self.buf(a).geometry().chain_compatible(&self.buf(b).geometry())
    }

    fn set_state(&mut self, h: BufferHandle, state: BufferState) {
        self.buf_mut(h).state = state;
    }
}

/// Longest a waiter sleeps before rechecking the generation
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Generation counter plus condvar, so a wakeup between checking the
/// queue and going to sleep is never lost
///
/// `notify` runs in interrupt context and never takes the sleeping lock. A
/// bump that lands between a waiter's check and its sleep is picked up
/// when the bounded wait expires.
struct Waiter {
    generation: AtomicU64,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Waiter {
    fn new() -> Self {
        Self { generation: AtomicU64::new(0), lock: Mutex::new(()), cond: Condvar::new() }
    }

    fn ticket(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn wait(&self, ticket: u64) {
        let mut guard = self.lock.lock();
        while self.generation.load(Ordering::Acquire) == ticket {
            self.cond.wait_for(&mut guard, WAIT_SLICE);
        }
    }

    fn notify(&self) {
        self.generation.fetch_add(1, Ordering::Release);
        self.cond.notify_all();
    }
}

pub struct CaptureQueue {
    name: String,
    ops: Arc<dyn DmaOps>,
    engine: DmaEngine,
    control: Mutex<()>,
    inner: SpinMutex<QueueInner>,
    waiter: Waiter,
    stats: QueueStats,
    faults: ArrayQueue<IntStatus>,
    timeout: Duration,
    line_offset: LineOffset,
}

impl CaptureQueue {
    /// Create an empty queue and its stopper program
    pub fn new(name: &str, regs: Arc<dyn Registers>, ops: Arc<dyn DmaOps>, config: &DriverConfig) -> Result<Self> {
        let stopper = DmaProgram::stopper(&*ops)?;
        debug!("{}: stopper at {:#x}", name, stopper.bus_address());
        Ok(Self {
            name: name.to_string(),
            ops,
            engine: DmaEngine::new(regs),
            control: Mutex::new(()),
            inner: SpinMutex::new(QueueInner {
                buffers: Vec::new(),
                stream: VecDeque::new(),
                queued: VecDeque::new(),
                active: VecDeque::new(),
                stopper,
                count: 0,
                sequence: 0,
                deadline: None,
                streaming: false,
                fault: None,
            }),
            waiter: Waiter::new(),
            stats: QueueStats::default(),
            faults: ArrayQueue::new(FAULT_BACKLOG),
            timeout: config.buffer_timeout,
            line_offset: config.line_offset,
        })
    }

    pub fn engine(&self) -> &DmaEngine {
        &self.engine
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn stopper_address(&self) -> u32 {
        self.inner.lock().stopper.bus_address()
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.lock().streaming
    }

    pub fn buffer_count(&self) -> u32 {
        self.inner.lock().buffers.len() as u32
    }

    /// When the running chain is declared stalled, if it is running
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.lock().deadline
    }

    pub fn handle(&self, index: u32) -> Result<BufferHandle> {
        if index < self.buffer_count() {
            Ok(BufferHandle(index))
        } else {
            Err(Error::InvalidArgument)
        }
    }

    pub fn buffer_info(&self, h: BufferHandle) -> Option<BufferInfo> {
        let inner = self.inner.lock();
        let buf = inner.buffers.get(h.0 as usize)?.as_ref()?;
        Some(BufferInfo {
            state: buf.state,
            program_address: buf.program.as_ref().map(DmaProgram::bus_address),
            tail_target: buf.program.as_ref().map(DmaProgram::tail_target),
            hw_count: buf.hw_count,
            sequence: buf.sequence,
        })
    }

    /// Disassembly of a buffer's current program
    pub fn dump_program(&self, h: BufferHandle) -> Option<String> {
        let inner = self.inner.lock();
        let buf = inner.buffers.get(h.0 as usize)?.as_ref()?;
        buf.program.as_ref().map(DmaProgram::disassemble)
    }

    /// Replace the buffer set with `count` buffers of `capacity` bytes
    ///
    /// A count of zero frees every buffer.
    pub fn request_buffers(&self, count: u32, capacity: usize) -> Result<u32> {
        let _control = self.control.lock();
        let old = {
            let mut inner = self.inner.lock();
            if inner.streaming {
                return Err(Error::Busy);
            }
            inner.stream.clear();
            let old = std::mem::take(&mut inner.buffers);
            inner.buffers = (0..count).map(|i| Some(CaptureBuffer::new(i, capacity))).collect();
            old
        };
        for mut buf in old.into_iter().flatten() {
            buf.release(&*self.ops);
        }
        debug!("{}: {} buffers of {} bytes", self.name, count, capacity);
        Ok(count)
    }

    /// Map the buffer and build its program for `geometry`
    pub fn prepare(&self, h: BufferHandle, geometry: Geometry, norm: &'static Norm) -> Result<()> {
        let _control = self.control.lock();
        let mut buf = self.take(h)?;
        let result = buf.prepare(&*self.ops, geometry, norm, self.line_offset);
        self.put(buf);
        result
    }

    /// Check a buffer out of the arena so it can be worked on without the
    /// spinlock held
    fn take(&self, h: BufferHandle) -> Result<CaptureBuffer> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.stream.contains(&h) {
            return Err(Error::Busy);
        }
        let slot = inner.buffers.get_mut(h.0 as usize).ok_or(Error::InvalidArgument)?;
        match slot.as_ref().map(|b| b.state) {
            None | Some(BufferState::Queued | BufferState::Active) => Err(Error::Busy),
            Some(_) => slot.take().ok_or(Error::Busy),
        }
    }

    fn put(&self, buf: CaptureBuffer) {
        let mut inner = self.inner.lock();
        let index = buf.index as usize;
        inner.buffers[index] = Some(buf);
    }

    /// Hand a prepared buffer to the capture stream
    ///
    /// While streaming it is placed on the chain immediately; otherwise it
    /// waits for [`CaptureQueue::stream_on`].
    pub fn queue(&self, h: BufferHandle) -> Result<()> {
        let _control = self.control.lock();
        let mut inner = self.inner.lock();
        match inner.buffers.get(h.0 as usize) {
            Some(Some(b)) if b.state == BufferState::Prepared => {}
            Some(Some(b)) if b.state == BufferState::NeedsInit => return Err(Error::InvalidArgument),
            Some(_) => return Err(Error::Busy),
            None => return Err(Error::InvalidArgument),
        }
        if inner.stream.contains(&h) {
            return Err(Error::Busy);
        }

        inner.stream.push_back(h);
        if inner.streaming {
            self.place(&mut inner, h, Instant::now());
        }
        Ok(())
    }

    /// Placement of a newly queued buffer
    fn place(&self, inner: &mut QueueInner, h: BufferHandle, now: Instant) {
        let stopper = inner.stopper.bus_address();
        inner.buf(h).program().set_tail_target(stopper, true);

        if !inner.queued.is_empty() || inner.fault.is_some() {
            inner.queued.push_back(h);
            inner.set_state(h, BufferState::Queued);
            trace!("{}: [{}] queued behind {} others", self.name, h.0, inner.queued.len() - 1);
            return;
        }

        match inner.active.back().copied() {
            None => {
                inner.active.push_back(h);
                self.start_head(inner, now);
                debug!("{}: [{}] started fresh chain", self.name, h.0);
            }
            Some(prev) if inner.compatible(prev, h) => {
                let count = inner.count;
                inner.count += 1;
                inner.active.push_back(h);
                let buf = inner.buf_mut(h);
                buf.state = BufferState::Active;
                buf.hw_count = count;
                let target = buf.program().bus_address();
                inner.buf(prev).program().set_tail_target(target, true);
                QueueStats::bump(&self.stats.chained);
                trace!("{}: [{}] chained after [{}], count {}", self.name, h.0, prev.0, count);
            }
            Some(prev) => {
                inner.queued.push_back(h);
                inner.set_state(h, BufferState::Queued);
                debug!("{}: [{}] geometry differs from [{}], queued", self.name, h.0, prev.0);
            }
        }
    }

    /// Start the engine at the head of `active`, renumbering the chain
    fn start_head(&self, inner: &mut QueueInner, now: Instant) {
        let Some(&head) = inner.active.front() else {
            inner.deadline = None;
            return;
        };

        inner.count = 1;
        for i in 0..inner.active.len() {
            let h = inner.active[i];
            let count = inner.count;
            inner.count += 1;
            let buf = inner.buf_mut(h);
            buf.state = BufferState::Active;
            buf.hw_count = count;
        }

        let buf = inner.buf(head);
        self.engine.start(buf.program(), &buf.geometry(), buf.norm());
        inner.deadline = Some(now + self.timeout);
        QueueStats::bump(&self.stats.starts);
    }

    /// Rebuild a running chain after a drain, a timeout or a fault
    ///
    /// A non-empty `active` list is restarted from its head. Otherwise the
    /// leading run of mutually compatible `queued` buffers is linked and
    /// started.
    fn restart(&self, inner: &mut QueueInner, now: Instant) {
        if inner.active.is_empty() {
            while let Some(&h) = inner.queued.front() {
                if let Some(&prev) = inner.active.back() {
                    if !inner.compatible(prev, h) {
                        break;
                    }
                    let target = inner.buf(h).program().bus_address();
                    inner.buf(prev).program().set_tail_target(target, true);
                }
                inner.queued.pop_front();
                inner.active.push_back(h);
            }
        }
        if !inner.active.is_empty() {
            debug!(
                "{}: restart with {} active, {} queued",
                self.name,
                inner.active.len(),
                inner.queued.len()
            );
        }
        self.start_head(inner, now);
    }

    /// Retire the head of `active` as `Done`
    fn complete_head(&self, inner: &mut QueueInner, now: Instant) -> Option<BufferHandle> {
        let h = inner.active.pop_front()?;
        let sequence = inner.sequence;
        inner.sequence = inner.sequence.wrapping_add(1);

        let buf = inner.buf_mut(h);
        buf.state = BufferState::Done;
        buf.timestamp = Some(now);
        buf.sequence = sequence;
        let bytes = buf.geometry().size_image() as u64;
        trace!("{}: [{}] done, count {} seq {}", self.name, h.0, buf.hw_count, sequence);

        inner.deadline = if inner.active.is_empty() { None } else { Some(now + self.timeout) };
        QueueStats::bump(&self.stats.frames_completed);
        self.stats.bytes_captured.fetch_add(bytes, Ordering::Relaxed);
        Some(h)
    }

    /// Interrupt-path entry: act on the video bits of `status`
    ///
    /// Returns whether any bit belonged to this queue. Status arriving
    /// while the queue is not streaming is acknowledged and dropped.
    pub fn handle_status(&self, status: IntStatus) -> bool {
        let status = status & IntStatus::VIDEO;
        if status.is_empty() {
            return false;
        }
        self.engine.regs().write32(regs::INTSTAT, IntStatus::VIDEO.bits());

        let mut inner = self.inner.lock();
        if !inner.streaming {
            trace!("{}: video status {:#x} while stopped", self.name, status.bits());
            return true;
        }

        let fault = status & IntStatus::FAULT;
        if !fault.is_empty() {
            self.fail_stop(&mut inner, fault);
            drop(inner);

            QueueStats::bump(&self.stats.faults);
            // reported from service context; a full backlog keeps the oldest
            let _ = self.faults.push(fault);
            self.waiter.notify();
            return true;
        }

        if status.contains(IntStatus::DMAPI) {
            let now = Instant::now();
            let pp = self.engine.program_pointer();
            // status raised before a restart says nothing about the new head
            if let Some(&h) = inner.active.front() {
                if inner.buf(h).program().contains(pp) {
                    trace!("{}: [{}] still running at {:#x}", self.name, h.0, pp);
                    return true;
                }
            }
            self.complete_head(&mut inner, now);

            if inner.stopper.contains(pp) {
                self.engine.stop();
                inner.deadline = None;
                QueueStats::bump(&self.stats.stopper_hits);
                trace!("{}: engine idle in stopper", self.name);
                if inner.streaming && (!inner.active.is_empty() || !inner.queued.is_empty()) {
                    self.restart(&mut inner, now);
                }
            }
            drop(inner);
            self.waiter.notify();
        }
        true
    }

    fn fail_stop(&self, inner: &mut QueueInner, fault: IntStatus) {
        self.engine.stop();
        inner.deadline = None;
        inner.fault = Some(fault);
        while let Some(h) = inner.active.pop_front() {
            inner.set_state(h, BufferState::Error);
            QueueStats::bump(&self.stats.frames_failed);
        }
    }

    /// Pop one pending fault report
    pub fn take_fault(&self) -> Option<IntStatus> {
        self.faults.pop()
    }

    /// Timer-path entry: recover a stalled chain whose deadline has passed
    ///
    /// Returns whether recovery ran.
    pub fn check_timeout(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        match inner.deadline {
            Some(deadline) if now >= deadline => {}
            _ => return false,
        }
        inner.deadline = None;
        if inner.active.is_empty() {
            return false;
        }

        self.engine.stop();
        while let Some(h) = inner.active.pop_front() {
            let buf = inner.buf_mut(h);
            buf.state = BufferState::Error;
            warn!(
                "{}: [{}] timeout - dma={:#010x} count {}",
                self.name,
                h.0,
                buf.program().bus_address(),
                buf.hw_count
            );
            QueueStats::bump(&self.stats.frames_failed);
        }
        QueueStats::bump(&self.stats.timeouts);
        self.restart(&mut inner, now);
        drop(inner);

        self.waiter.notify();
        true
    }

    /// Take the oldest buffer in the stream once it has finished
    ///
    /// Blocks until it does unless `blocking` is false. A fault that left
    /// the stream unable to progress is returned as an error.
    pub fn dequeue(&self, blocking: bool) -> Result<CompletedFrame> {
        loop {
            let ticket = self.waiter.ticket();
            {
                let mut inner = self.inner.lock();
                let Some(&h) = inner.stream.front() else {
                    return Err(Error::NotStreaming);
                };
                let buf = inner.buf(h);
                if matches!(buf.state, BufferState::Done | BufferState::Error) {
                    let frame = CompletedFrame {
                        handle: h,
                        state: buf.state,
                        sequence: buf.sequence,
                        timestamp: buf.timestamp,
                        bytes_used: if buf.state == BufferState::Done { buf.geometry().size_image() } else { 0 },
                    };
                    inner.stream.pop_front();
                    return Ok(frame);
                }
                if let Some(fault) = inner.fault {
                    return Err(Error::HardwareFault(fault));
                }
                if !inner.streaming {
                    return Err(Error::NotStreaming);
                }
            }
            if !blocking {
                return Err(Error::WouldBlock);
            }
            self.waiter.wait(ticket);
        }
    }

    /// Start capturing, or resume after a fault
    pub fn stream_on(&self) -> Result<()> {
        let _control = self.control.lock();
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if inner.streaming {
            let Some(fault) = inner.fault.take() else {
                return Err(Error::Busy);
            };
            warn!("{}: resuming after fault {:#x}", self.name, fault.bits());
            // drop whatever the faulted run latched since
            self.engine.stop();
            self.restart(&mut inner, now);
            return Ok(());
        }
        inner.fault = None;

        inner.streaming = true;
        for i in 0..inner.stream.len() {
            let h = inner.stream[i];
            if inner.buf(h).state == BufferState::Prepared {
                self.place(&mut inner, h, now);
            }
        }
        debug!("{}: streaming, {} buffers in stream", self.name, inner.stream.len());
        Ok(())
    }

    /// Stop capturing and release every buffer back to `NeedsInit`
    ///
    /// The engine is stopped before any program or mapping is freed.
    pub fn stream_off(&self) -> Result<()> {
        let _control = self.control.lock();
        let taken: Vec<CaptureBuffer> = {
            let mut inner = self.inner.lock();
            if !inner.streaming {
                return Err(Error::NotStreaming);
            }
            self.engine.stop();
            inner.streaming = false;
            inner.deadline = None;
            inner.fault = None;
            inner.active.clear();
            inner.queued.clear();
            inner.stream.clear();
            inner.sequence = 0;
            inner
                .buffers
                .iter_mut()
                .filter_map(Option::take)
                .map(|mut b| {
                    // the engine no longer references any program
                    b.state = BufferState::Error;
                    b
                })
                .collect()
        };
        self.waiter.notify();

        let released = taken.len();
        for mut buf in taken {
            buf.release(&*self.ops);
            self.put(buf);
        }
        debug!("{}: stream off, {} buffers released", self.name, released);
        Ok(())
    }

    /// Free everything; used when the owning handle goes away
    pub fn shutdown(&self) {
        if self.is_streaming() {
            let _ = self.stream_off();
        }
        if let Err(e) = self.request_buffers(0, 0) {
            error!("{}: buffer teardown failed: {}", self.name, e);
        }
    }
}

impl Drop for CaptureQueue {
    fn drop(&mut self) {
        self.engine.stop();
    }
}
