// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tw68::dma::HostDma;
use tw68::format::fourcc;
use tw68::regs::{self, MemRegs};
use tw68::{
    BufferState, CaptureHandle, DeviceRegistry, DriverConfig, Error, FieldMode, IntStatus, PciLocation, PixFormat,
    Registers, VideoDevice,
};

fn config() -> DriverConfig {
    DriverConfig { reset_settle: Duration::ZERO, ..DriverConfig::default() }
}

fn location() -> PciLocation {
    PciLocation { bus: 2, slot: 0, subsystem_vendor: 0, subsystem_device: 0 }
}

fn probe_with(regs: Arc<dyn Registers>, config: DriverConfig) -> Arc<VideoDevice> {
    let registry = Arc::new(DeviceRegistry::new());
    VideoDevice::probe(&registry, location(), regs, Arc::new(HostDma::new()), config).expect("probe failed")
}

fn yuyv(width: u32, height: u32) -> PixFormat {
    PixFormat {
        width,
        height,
        pixel_format: fourcc(b"YUYV"),
        field: FieldMode::Interlaced,
        bytes_per_line: 0,
        size_image: 0,
    }
}

fn streaming(handle: &CaptureHandle, count: u32) {
    handle.set_format(&yuyv(320, 240)).unwrap();
    assert_eq!(handle.request_buffers(count), Ok(count));
    for i in 0..count {
        handle.queue_buffer(i).unwrap();
    }
    handle.stream_on().unwrap();
}

fn program_of(handle: &CaptureHandle, index: u32) -> u32 {
    handle.buffer_info(index).unwrap().program_address.unwrap()
}

/// Pretend the engine finished the current buffer and moved to `pp`
fn complete(regs: &MemRegs, dev: &VideoDevice, pp: u32) -> bool {
    regs.write32(regs::DMAP_PP, pp);
    regs.raise(IntStatus::DMAPI);
    dev.interrupt()
}

#[test]
fn test_capture_round_trip() {
    let regs = Arc::new(MemRegs::new());
    let dev = probe_with(regs.clone(), config());
    let handle = dev.open();
    streaming(&handle, 4);

    assert_eq!(regs.read32(regs::DMAP_SA), program_of(&handle, 0));
    for i in 0..3 {
        assert_eq!(handle.buffer_info(i).unwrap().tail_target, Some(program_of(&handle, i + 1)));
    }
    assert_eq!(handle.buffer_info(3).unwrap().tail_target, Some(dev.queue().stopper_address()));

    assert!(complete(&regs, &dev, program_of(&handle, 1)));
    let frame = handle.dequeue(false).unwrap();
    assert_eq!((frame.handle.index(), frame.state, frame.sequence), (0, BufferState::Done, 0));
    assert_eq!(frame.bytes_used, 320 * 240 * 2);

    // recycled buffer goes to the end of the running chain
    handle.queue_buffer(0).unwrap();
    assert_eq!(handle.buffer_info(3).unwrap().tail_target, Some(program_of(&handle, 0)));
    assert_eq!(handle.buffer_info(0).unwrap().state, BufferState::Active);
    assert_eq!(handle.buffer_info(0).unwrap().hw_count, 5);

    assert!(complete(&regs, &dev, program_of(&handle, 2)));
    assert_eq!(handle.dequeue(false).unwrap().sequence, 1);
    assert_eq!(dev.queue().stats().frames_completed, 2);
    assert_eq!(dev.queue().stats().chained, 4);
}

#[test]
fn test_interrupt_not_ours() {
    let regs = Arc::new(MemRegs::new());
    let dev = probe_with(regs.clone(), config());
    assert!(!dev.interrupt());

    // status the driver never enabled is left alone
    regs.raise(IntStatus::VLOCK);
    assert!(!dev.interrupt());
    assert_eq!(regs.read32(regs::INTSTAT), IntStatus::VLOCK.bits());
}

#[test]
fn test_drain_to_stopper() {
    let regs = Arc::new(MemRegs::new());
    let dev = probe_with(regs.clone(), config());
    let handle = dev.open();
    streaming(&handle, 2);

    assert!(complete(&regs, &dev, program_of(&handle, 1)));
    assert!(complete(&regs, &dev, dev.queue().stopper_address()));
    assert!(!dev.queue().engine().running());
    assert_eq!(dev.queue().stats().stopper_hits, 1);

    // a buffer queued onto an idle stream starts a fresh chain
    handle.dequeue(false).unwrap();
    handle.queue_buffer(0).unwrap();
    assert!(dev.queue().engine().running());
    assert_eq!(regs.read32(regs::DMAP_SA), program_of(&handle, 0));
    assert_eq!(handle.buffer_info(0).unwrap().hw_count, 1);
}

#[test]
fn test_blocking_dequeue_wakes_on_completion() {
    let regs = Arc::new(MemRegs::new());
    let dev = probe_with(regs.clone(), config());
    let handle = dev.open();
    streaming(&handle, 2);

    thread::scope(|s| {
        let waiter = s.spawn(|| handle.dequeue(true));
        thread::sleep(Duration::from_millis(20));
        complete(&regs, &dev, program_of(&handle, 1));
        let frame = waiter.join().unwrap().unwrap();
        assert_eq!(frame.handle.index(), 0);
    });
}

#[test]
fn test_watchdog_recovers_stalled_chain() {
    let regs = Arc::new(MemRegs::new());
    let config = DriverConfig {
        buffer_timeout: Duration::from_millis(30),
        watchdog_interval: Duration::from_millis(5),
        ..config()
    };
    let dev = probe_with(regs.clone(), config);
    dev.spawn_watchdog().unwrap();
    let handle = dev.open();
    streaming(&handle, 1);

    let frame = handle.dequeue(true).unwrap();
    assert_eq!(frame.state, BufferState::Error);
    assert_eq!(dev.queue().stats().timeouts, 1);
    assert!(!dev.queue().engine().running());
}

#[test]
fn test_fault_stops_until_stream_on() {
    let regs = Arc::new(MemRegs::new());
    let dev = probe_with(regs.clone(), config());
    let handle = dev.open();
    streaming(&handle, 2);

    regs.raise(IntStatus::PABORT);
    assert!(dev.interrupt());
    assert!(!dev.queue().engine().running());
    assert_eq!(dev.service(), 1);
    assert_eq!(dev.service(), 0);

    assert_eq!(handle.dequeue(false).unwrap().state, BufferState::Error);
    assert_eq!(handle.dequeue(false).unwrap().state, BufferState::Error);
    handle.queue_buffer(0).unwrap();
    assert_eq!(handle.dequeue(false), Err(Error::HardwareFault(IntStatus::PABORT)));
    assert_eq!(handle.buffer_info(0).unwrap().state, BufferState::Queued);

    handle.stream_on().unwrap();
    assert!(dev.queue().engine().running());
    assert_eq!(handle.buffer_info(0).unwrap().state, BufferState::Active);
}

/// Register file whose DMAPI status never clears
struct StuckIrq(MemRegs);

impl Registers for StuckIrq {
    fn read32(&self, offset: usize) -> u32 {
        let value = self.0.read32(offset);
        if offset == regs::INTSTAT {
            value | IntStatus::DMAPI.bits()
        } else {
            value
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        self.0.write32(offset, value)
    }

    fn read8(&self, offset: usize) -> u8 {
        self.0.read8(offset)
    }

    fn write8(&self, offset: usize, value: u8) {
        self.0.write8(offset, value)
    }
}

#[test]
fn test_interrupt_storm_masks_everything() {
    let regs = Arc::new(StuckIrq(MemRegs::new()));
    let dev = probe_with(regs.clone(), DriverConfig { irq_loop_limit: 3, ..config() });
    let handle = dev.open();
    streaming(&handle, 2);

    assert!(dev.interrupt());
    assert_eq!(regs.read32(regs::INTMASK), 0);
    assert!(dev.queue().engine().irq_mask().is_empty());
    assert!(!dev.interrupt());
}

#[test]
fn test_stream_off_and_close_release_memory() {
    let regs = Arc::new(MemRegs::new());
    let dma = Arc::new(HostDma::new());
    let registry = Arc::new(DeviceRegistry::new());
    let dev = VideoDevice::probe(&registry, location(), regs.clone(), dma.clone(), config()).unwrap();
    let handle = dev.open();
    streaming(&handle, 3);
    assert_eq!(dma.live_allocations(), 4);

    handle.stream_off().unwrap();
    assert_eq!(dma.live_allocations(), 1);
    assert_eq!(dma.mapped_buffers(), 0);
    assert_eq!(handle.buffer_info(0).unwrap().state, BufferState::NeedsInit);

    drop(handle);
    assert_eq!(dev.queue().buffer_count(), 0);
    drop(dev);
    assert!(registry.is_empty());
    assert_eq!(dma.live_allocations(), 0);
}
