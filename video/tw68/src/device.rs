// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Chip core, video device and per-open capture handles
//!
//! A [`Tw68Core`] is the decoder side of one chip: norm, input and picture
//! controls. A [`VideoDevice`] adds the capture queue, the interrupt entry
//! point and the timeout watchdog. Each [`CaptureHandle`] is one opener;
//! only the handle holding [`Resources::VIDEO`] may allocate buffers and
//! stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use bitflags::bitflags;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;

use crate::buffer::BufferState;
use crate::cards::{self, Board, BoardInput, BOARDS};
use crate::config::DriverConfig;
use crate::decoder::{self, ControlId, ControlQuery, CONTROLS, NUM_CONTROLS};
use crate::dma::DmaOps;
use crate::error::{Error, Result};
use crate::format::{self, fourcc, FieldMode, Geometry, Norm, PixFormat, StdId};
use crate::queue::{BufferInfo, CaptureQueue, CompletedFrame};
use crate::regs::{self, IntStatus, Registers};
use crate::registry::{DeviceRegistry, PciLocation};
use crate::PAGE_SIZE;

/// Buffers handed out when a request asks for zero
pub const DEFAULT_BUFFER_COUNT: u32 = 32;

bitflags! {
    /// Exclusive capabilities a handle can hold
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Resources: u32 {
        const VIDEO = 1 << 0;
    }
}

struct CoreState {
    norm: &'static Norm,
    input: u32,
    controls: [i32; NUM_CONTROLS],
    resources: Resources,
}

pub struct Tw68Core {
    nr: usize,
    name: String,
    location: PciLocation,
    board_nr: usize,
    regs: Arc<dyn Registers>,
    state: Mutex<CoreState>,
}

impl Tw68Core {
    /// Reset the chip and program the configured norm, input 0 and the
    /// control defaults
    pub(crate) fn new(nr: usize, location: PciLocation, regs: Arc<dyn Registers>, config: &DriverConfig) -> Self {
        let name = format!("tw68[{}]", nr);
        let board_nr = cards::identify(&name, location.subsystem_vendor, location.subsystem_device, config.card);
        decoder::reset(&*regs, config.reset_settle);

        let core = Self {
            nr,
            name,
            location,
            board_nr,
            regs,
            state: Mutex::new(CoreState {
                norm: config.norm,
                input: 0,
                controls: [0; NUM_CONTROLS],
                resources: Resources::empty(),
            }),
        };

        {
            let mut state = core.state.lock();
            decoder::set_norm(&*core.regs, state.norm);
            for c in CONTROLS.iter() {
                // AGC may be refused under SECAM; the cache then keeps off
                let applied = decoder::set_control(&*core.regs, state.norm, c.id, c.default).unwrap_or(0);
                state.controls[c.id as usize] = applied;
            }
            if let Some(first) = core.board().inputs.first() {
                if decoder::select_input(&*core.regs, first.vmux).is_err() {
                    warn!("{}: input 0 mux {} not selectable", core.name, first.vmux);
                }
            }
        }
        core
    }

    pub fn nr(&self) -> usize {
        self.nr
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> &PciLocation {
        &self.location
    }

    pub fn board_nr(&self) -> usize {
        self.board_nr
    }

    pub fn board(&self) -> &'static Board {
        &BOARDS[self.board_nr]
    }

    pub fn regs(&self) -> Arc<dyn Registers> {
        self.regs.clone()
    }

    pub fn norm(&self) -> &'static Norm {
        self.state.lock().norm
    }

    /// Switch to the first norm matching `std`
    ///
    /// Saturation is reprogrammed because its U/V coupling depends on the
    /// norm, and chroma AGC is forced off under SECAM.
    pub fn set_norm(&self, std: StdId) -> Result<&'static Norm> {
        let norm = format::norm_for(std).ok_or(Error::InvalidArgument)?;
        let mut state = self.state.lock();
        decoder::set_norm(&*self.regs, norm);
        state.norm = norm;

        let sat = state.controls[ControlId::Saturation as usize];
        state.controls[ControlId::Saturation as usize] =
            decoder::set_control(&*self.regs, norm, ControlId::Saturation, sat)?;
        if norm.is_secam() {
            state.controls[ControlId::ChromaAgc as usize] =
                decoder::set_control(&*self.regs, norm, ControlId::ChromaAgc, 0)?;
        }
        info!("{}: norm {}", self.name, norm.name);
        Ok(norm)
    }

    /// Connector `index` on this board
    pub fn enum_input(&self, index: u32) -> Result<&'static BoardInput> {
        cards::input(self.board(), index)
    }

    pub fn select_input(&self, index: u32) -> Result<()> {
        let input = self.enum_input(index)?;
        let mut state = self.state.lock();
        decoder::select_input(&*self.regs, input.vmux)?;
        state.input = index;
        debug!("{}: input {} ({})", self.name, index, input.kind.name());
        Ok(())
    }

    pub fn input(&self) -> u32 {
        self.state.lock().input
    }

    pub fn query_control(&self, id: ControlId) -> ControlQuery {
        decoder::query_control(id, self.state.lock().norm)
    }

    pub fn get_control(&self, id: ControlId) -> i32 {
        self.state.lock().controls[id as usize]
    }

    /// Returns the value applied after clamping
    pub fn set_control(&self, id: ControlId, value: i32) -> Result<i32> {
        let mut state = self.state.lock();
        let applied = decoder::set_control(&*self.regs, state.norm, id, value)?;
        state.controls[id as usize] = applied;
        Ok(applied)
    }

    pub fn try_format(&self, req: &PixFormat) -> Result<Geometry> {
        format::try_format(req, self.state.lock().norm)
    }

    fn claim(&self, wanted: Resources) -> bool {
        let mut state = self.state.lock();
        if state.resources.intersects(wanted) {
            return false;
        }
        state.resources |= wanted;
        true
    }

    fn release(&self, held: Resources) {
        self.state.lock().resources.remove(held);
    }
}

struct Watchdog {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// One capture function of a chip
pub struct VideoDevice {
    core: Arc<Tw68Core>,
    queue: CaptureQueue,
    registry: Arc<DeviceRegistry>,
    config: DriverConfig,
    watchdog: Mutex<Option<Watchdog>>,
}

impl VideoDevice {
    /// Bring up the chip at `location` and create its capture queue
    pub fn probe(
        registry: &Arc<DeviceRegistry>,
        location: PciLocation,
        regs: Arc<dyn Registers>,
        ops: Arc<dyn DmaOps>,
        config: DriverConfig,
    ) -> Result<Arc<Self>> {
        let core = registry.get(location, regs.clone(), &config)?;
        let queue = match CaptureQueue::new(core.name(), regs, ops, &config) {
            Ok(queue) => queue,
            Err(e) => {
                error!("{}: capture queue setup failed: {}", core.name(), e);
                registry.put(&core);
                return Err(e);
            }
        };
        info!("{}: video device ready, norm {}", core.name(), core.norm().name);

        Ok(Arc::new(Self {
            core,
            queue,
            registry: registry.clone(),
            config,
            watchdog: Mutex::new(None),
        }))
    }

    pub fn core(&self) -> &Tw68Core {
        &self.core
    }

    pub fn queue(&self) -> &CaptureQueue {
        &self.queue
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn open(self: &Arc<Self>) -> CaptureHandle {
        CaptureHandle::new(self.clone())
    }

    /// Interrupt entry point
    ///
    /// Re-reads the status until no enabled bit remains, up to the
    /// configured loop limit; past it every source is masked. Returns
    /// whether the interrupt was ours.
    pub fn interrupt(&self) -> bool {
        let mmio = self.core.regs();
        let mut handled = false;

        for _ in 0..self.config.irq_loop_limit {
            let status = IntStatus::from_bits_retain(mmio.read32(regs::INTSTAT));
            let pending = status & self.queue.engine().irq_mask();
            if pending.is_empty() {
                return handled;
            }
            trace!("{}: intstat {:#010x} pending {:#x}", self.core.name(), status.bits(), pending.bits());
            handled |= self.queue.handle_status(pending);
        }

        warn!(
            "{}: irq loop limit {} reached, masking all sources",
            self.core.name(),
            self.config.irq_loop_limit
        );
        self.queue.engine().mask_all();
        handled
    }

    /// Log faults handed off by the interrupt path; returns how many
    pub fn service(&self) -> usize {
        let mut n = 0;
        while let Some(fault) = self.queue.take_fault() {
            error!("{}: dma fault {:?} ({:#x}), capture stopped", self.core.name(), fault, fault.bits());
            n += 1;
        }
        n
    }

    /// Start the thread that runs timeout recovery and fault service
    pub fn spawn_watchdog(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.watchdog.lock();
        if slot.is_some() {
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let weak = Arc::downgrade(self);
        let interval = self.config.watchdog_interval;
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-timeout", self.core.name()))
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    thread::sleep(interval);
                    let Some(dev) = weak.upgrade() else {
                        break;
                    };
                    dev.queue.check_timeout(Instant::now());
                    dev.service();
                }
            })
            .map_err(|e| {
                error!("{}: failed to spawn watchdog: {}", self.core.name(), e);
                Error::Io
            })?;

        *slot = Some(Watchdog { stop, handle });
        Ok(())
    }

    fn stop_watchdog(&self) {
        let Some(watchdog) = self.watchdog.lock().take() else {
            return;
        };
        watchdog.stop.store(true, Ordering::Release);
        // the watchdog may hold the last reference and be dropping us
        if watchdog.handle.thread().id() != thread::current().id() && watchdog.handle.join().is_err() {
            error!("{}: watchdog panicked", self.core.name());
        }
    }
}

impl Drop for VideoDevice {
    fn drop(&mut self) {
        self.stop_watchdog();
        self.queue.engine().stop();
        self.registry.put(&self.core);
        debug!("{}: video device removed", self.core.name());
    }
}

struct HandleState {
    geometry: Geometry,
    resources: Resources,
}

/// One opener of a [`VideoDevice`]
pub struct CaptureHandle {
    dev: Arc<VideoDevice>,
    state: Mutex<HandleState>,
}

impl CaptureHandle {
    fn new(dev: Arc<VideoDevice>) -> Self {
        let req = PixFormat {
            width: 320,
            height: 240,
            pixel_format: fourcc(b"BGR3"),
            field: FieldMode::Interlaced,
            bytes_per_line: 0,
            size_image: 0,
        };
        let geometry = match dev.core.try_format(&req) {
            Ok(g) => g,
            Err(_) => Geometry {
                width: 320,
                height: 240,
                format: &format::FORMATS[2],
                field: FieldMode::Interlaced,
            },
        };
        Self { dev, state: Mutex::new(HandleState { geometry, resources: Resources::empty() }) }
    }

    pub fn device(&self) -> &Arc<VideoDevice> {
        &self.dev
    }

    pub fn format(&self) -> PixFormat {
        self.state.lock().geometry.into()
    }

    /// Nearest format the current norm can deliver, without applying it
    pub fn try_format(&self, req: &PixFormat) -> Result<PixFormat> {
        self.dev.core.try_format(req).map(PixFormat::from)
    }

    pub fn set_format(&self, req: &PixFormat) -> Result<PixFormat> {
        let geometry = self.dev.core.try_format(req)?;
        let mut state = self.state.lock();
        if state.resources.contains(Resources::VIDEO) && self.dev.queue.is_streaming() {
            return Err(Error::Busy);
        }
        state.geometry = geometry;
        Ok(geometry.into())
    }

    fn ensure_video(&self, state: &mut HandleState) -> Result<()> {
        if state.resources.contains(Resources::VIDEO) {
            return Ok(());
        }
        if !self.dev.core.claim(Resources::VIDEO) {
            return Err(Error::Busy);
        }
        state.resources |= Resources::VIDEO;
        Ok(())
    }

    /// Allocate `count` buffers for the current format
    ///
    /// Zero asks for the default count. The count is reduced until the
    /// total fits in the configured memory limit.
    pub fn request_buffers(&self, count: u32) -> Result<u32> {
        let mut state = self.state.lock();
        self.ensure_video(&mut state)?;

        let size = state.geometry.size_image();
        let capacity = size.div_ceil(PAGE_SIZE as usize) * PAGE_SIZE as usize;
        let limit = self.dev.config.vid_limit_mb * 1024 * 1024;
        let mut count = if count == 0 { DEFAULT_BUFFER_COUNT } else { count };
        while count > 0 && size * count as usize > limit {
            count -= 1;
        }
        if count == 0 {
            return Err(Error::OutOfMemory);
        }
        self.dev.queue.request_buffers(count, capacity)
    }

    /// Map buffer `index` and build its program for the current format
    pub fn prepare(&self, index: u32) -> Result<()> {
        let state = self.state.lock();
        if !state.resources.contains(Resources::VIDEO) {
            return Err(Error::Busy);
        }
        let h = self.dev.queue.handle(index)?;
        self.dev.queue.prepare(h, state.geometry, self.dev.core.norm())
    }

    /// Prepare buffer `index` if needed and add it to the stream
    pub fn queue_buffer(&self, index: u32) -> Result<()> {
        let h = self.dev.queue.handle(index)?;
        let prepared = matches!(self.dev.queue.buffer_info(h), Some(i) if i.state == BufferState::Prepared);
        if !prepared {
            self.prepare(index)?;
        }
        self.dev.queue.queue(h)
    }

    pub fn dequeue(&self, blocking: bool) -> Result<CompletedFrame> {
        if !self.state.lock().resources.contains(Resources::VIDEO) {
            return Err(Error::Busy);
        }
        self.dev.queue.dequeue(blocking)
    }

    pub fn buffer_info(&self, index: u32) -> Result<BufferInfo> {
        let h = self.dev.queue.handle(index)?;
        self.dev.queue.buffer_info(h).ok_or(Error::InvalidArgument)
    }

    pub fn stream_on(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_video(&mut state)?;
        self.dev.queue.stream_on()
    }

    pub fn stream_off(&self) -> Result<()> {
        if !self.state.lock().resources.contains(Resources::VIDEO) {
            return Err(Error::Busy);
        }
        self.dev.queue.stream_off()
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        let held = self.state.get_mut().resources;
        if held.contains(Resources::VIDEO) {
            self.dev.queue.shutdown();
            self.dev.core.release(held);
        }
    }
}
