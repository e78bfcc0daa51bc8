// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! TW6800 register map and register access
//!
//! The chip exposes one 4 KiB memory BAR. Offsets below 0x100 are the
//! 32-bit DMA controller registers; the video decoder block at 0x200 uses
//! one byte per 32-bit slot.

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

// DMA controller (32-bit)
pub const DMAC: usize = 0x000;
pub const DMAP_SA: usize = 0x004;
pub const DMAP_EXE: usize = 0x008;
pub const DMAP_PP: usize = 0x00c;
pub const VBIC: usize = 0x010;
pub const SBUSC: usize = 0x014;
pub const SBUSD: usize = 0x018;
pub const INTSTAT: usize = 0x01c;
pub const INTMASK: usize = 0x020;
pub const GPIOC: usize = 0x024;
pub const GPOE: usize = 0x028;
pub const TESTREG: usize = 0x02c;
pub const VBIINST: usize = 0x06c;
pub const GPDATA: usize = 0x100;

// Video decoder (8-bit)
pub const DSTATUS: usize = 0x204;
pub const INFORM: usize = 0x208;
pub const HSYNC: usize = 0x210;
pub const ACNTL: usize = 0x218;
pub const CROP_HI: usize = 0x21c;
pub const VDELAY_LO: usize = 0x220;
pub const VACTIVE_LO: usize = 0x224;
pub const HDELAY_LO: usize = 0x228;
pub const HACTIVE_LO: usize = 0x22c;
pub const CNTRL1: usize = 0x230;
pub const VSCALE_LO: usize = 0x234;
pub const SCALE_HI: usize = 0x238;
pub const HSCALE_LO: usize = 0x23c;
pub const BRIGHT: usize = 0x240;
pub const CONTRAST: usize = 0x244;
pub const SHARPNESS: usize = 0x248;
pub const SAT_U: usize = 0x24c;
pub const SAT_V: usize = 0x250;
pub const HUE: usize = 0x254;
pub const SHARP2: usize = 0x258;
pub const RESERV2: usize = 0x25c;
pub const CORING: usize = 0x260;
pub const CC_STATUS: usize = 0x268;
pub const SDT: usize = 0x270;
pub const SDTR: usize = 0x274;
pub const RESERV3: usize = 0x278;
pub const CLMPG: usize = 0x280;
pub const IAGC: usize = 0x284;
pub const AGCGAIN: usize = 0x288;
pub const PEAKWT: usize = 0x28c;
pub const CLMPL: usize = 0x290;
pub const SYNCT: usize = 0x294;
pub const MISSCNT: usize = 0x298;
pub const PCLAMP: usize = 0x29c;
pub const VERTCTL: usize = 0x2a0;
pub const VERTCTL2: usize = 0x2a4;
pub const COLORKILL: usize = 0x2a8;
pub const MISC1: usize = 0x2b4;
pub const MISC2: usize = 0x2b8;
pub const MACROVISION: usize = 0x2c0;
pub const CLMPCTL2: usize = 0x2c4;
pub const FILLDATA: usize = 0x2c8;
pub const SLICELEVEL: usize = 0x2d8;
pub const HFREF: usize = 0x2e8;

/// Size of the register window
pub const REGISTER_SPACE: usize = 0x300;

/// DMAC bits owned by the capture path (format field plus enables)
pub const DMAC_FORMAT_MASK: u32 = 0x7f;

bitflags! {
    /// DMA controller enables in DMAC
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DmaCtrl: u32 {
        const DMAP_EN = 1 << 0;
        const FIFO_EN = 1 << 1;
    }
}

bitflags! {
    /// INTSTAT / INTMASK bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IntStatus: u32 {
        const SBDONE = 1 << 0;
        const DMAPI = 1 << 1;
        const GPINT = 1 << 2;
        const FFOF = 1 << 3;
        const FDMIS = 1 << 4;
        const DMAPERR = 1 << 5;
        const PABORT = 1 << 6;
        const PPERR = 1 << 14;
        const FFERR = 1 << 15;
        const DET50 = 1 << 16;
        const FLOCK = 1 << 17;
        const CCVALID = 1 << 18;
        const VLOCK = 1 << 19;
        const FIELD = 1 << 20;
        const SLOCK = 1 << 21;
        const HLOCK = 1 << 22;
        const VDLOSS = 1 << 23;
        const SBERR = 1 << 24;

        /// Everything the video path enables and acknowledges
        const VIDEO = Self::PABORT.bits()
            | Self::DMAPERR.bits()
            | Self::FDMIS.bits()
            | Self::FFOF.bits()
            | Self::DMAPI.bits();

        /// Conditions that stop the engine
        const FAULT = Self::PABORT.bits()
            | Self::DMAPERR.bits()
            | Self::FDMIS.bits()
            | Self::FFOF.bits();
    }
}

/// Register access to one TW6800 function
///
/// Implemented by [`Mmio`] for a mapped BAR and by [`MemRegs`] for tests
/// and bring-up without hardware.
pub trait Registers: Send + Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
    fn read8(&self, offset: usize) -> u8;
    fn write8(&self, offset: usize, value: u8);

    /// Replace the bits selected by `mask` with the matching bits of `value`
    fn andor32(&self, offset: usize, mask: u32, value: u32) {
        let old = self.read32(offset);
        self.write32(offset, (old & !mask) | (value & mask));
    }

    fn set32(&self, offset: usize, bits: u32) {
        self.andor32(offset, bits, bits);
    }

    fn clear32(&self, offset: usize, bits: u32) {
        self.andor32(offset, bits, 0);
    }

    fn andor8(&self, offset: usize, mask: u8, value: u8) {
        let old = self.read8(offset);
        self.write8(offset, (old & !mask) | (value & mask));
    }
}

/// Memory-mapped register window
pub struct Mmio {
    base: *mut u8,
    len: usize,
}

impl Mmio {
    /// # Safety
    ///
    /// `base` must point to a mapping of the device BAR that stays valid
    /// for `len` bytes for the lifetime of this value.
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    fn ptr(&self, offset: usize, width: usize) -> *mut u8 {
        assert!(offset + width <= self.len, "tw68: register {offset:#x} outside BAR");
        // SAFETY: bounds checked against the mapping length above
        unsafe { self.base.add(offset) }
    }
}

impl Registers for Mmio {
    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: in-bounds, aligned device register
        unsafe { core::ptr::read_volatile(self.ptr(offset, 4) as *const u32) }
    }

    fn write32(&self, offset: usize, value: u32) {
        // SAFETY: in-bounds, aligned device register
        unsafe { core::ptr::write_volatile(self.ptr(offset, 4) as *mut u32, value) }
    }

    fn read8(&self, offset: usize) -> u8 {
        // SAFETY: in-bounds device register
        unsafe { core::ptr::read_volatile(self.ptr(offset, 1)) }
    }

    fn write8(&self, offset: usize, value: u8) {
        // SAFETY: in-bounds device register
        unsafe { core::ptr::write_volatile(self.ptr(offset, 1), value) }
    }
}

unsafe impl Send for Mmio {}
unsafe impl Sync for Mmio {}

/// Register file backed by plain memory
///
/// Behaves like the chip where it matters to the driver: INTSTAT is
/// write-one-to-clear and [`MemRegs::raise`] latches status bits the way
/// the DMA engine would.
pub struct MemRegs {
    slots: Box<[AtomicU32]>,
}

impl MemRegs {
    pub fn new() -> Self {
        let slots = (0..REGISTER_SPACE / 4).map(|_| AtomicU32::new(0)).collect();
        Self { slots }
    }

    /// Latch interrupt status bits
    pub fn raise(&self, status: IntStatus) {
        self.slots[INTSTAT / 4].fetch_or(status.bits(), Ordering::SeqCst);
    }

    fn slot(&self, offset: usize) -> &AtomicU32 {
        &self.slots[offset / 4]
    }
}

impl Default for MemRegs {
    fn default() -> Self {
        Self::new()
    }
}

impl Registers for MemRegs {
    fn read32(&self, offset: usize) -> u32 {
        self.slot(offset).load(Ordering::SeqCst)
    }

    fn write32(&self, offset: usize, value: u32) {
        if offset == INTSTAT {
            self.slot(offset).fetch_and(!value, Ordering::SeqCst);
        } else {
            self.slot(offset).store(value, Ordering::SeqCst);
        }
    }

    fn read8(&self, offset: usize) -> u8 {
        let shift = (offset % 4) * 8;
        (self.slot(offset).load(Ordering::SeqCst) >> shift) as u8
    }

    fn write8(&self, offset: usize, value: u8) {
        let shift = (offset % 4) * 8;
        let lane = 0xffu32 << shift;
        let _ = self.slot(offset).fetch_update(Ordering::SeqCst, Ordering::SeqCst, |old| {
            Some((old & !lane) | ((value as u32) << shift))
        });
    }
}
