// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! DMA engine start/stop and the shared interrupt mask

use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;

use crate::decoder;
use crate::format::{Geometry, Norm};
use crate::program::DmaProgram;
use crate::regs::{self, DmaCtrl, IntStatus, Registers};

pub struct DmaEngine {
    regs: Arc<dyn Registers>,
    /// Interrupt sources the driver currently wants; mirrors INTMASK
    irq_mask: AtomicU32,
}

impl DmaEngine {
    pub fn new(regs: Arc<dyn Registers>) -> Self {
        Self { regs, irq_mask: AtomicU32::new(0) }
    }

    pub fn regs(&self) -> &dyn Registers {
        &*self.regs
    }

    pub fn irq_mask(&self) -> IntStatus {
        IntStatus::from_bits_retain(self.irq_mask.load(Ordering::Acquire))
    }

    /// Program the scaler for `geometry` and start executing `program`
    pub fn start(&self, program: &DmaProgram, geometry: &Geometry, norm: &Norm) {
        decoder::set_scale(&*self.regs, norm, geometry.width, geometry.height, geometry.field);

        // program words must reach memory before the engine fetches them
        fence(Ordering::Release);
        self.regs.write32(regs::DMAP_SA, program.bus_address());
        self.regs.andor32(
            regs::DMAC,
            regs::DMAC_FORMAT_MASK,
            geometry.format.tw_format | DmaCtrl::DMAP_EN.bits() | DmaCtrl::FIFO_EN.bits(),
        );

        let mask = self.irq_mask.fetch_or(IntStatus::VIDEO.bits(), Ordering::AcqRel) | IntStatus::VIDEO.bits();
        self.regs.set32(regs::INTMASK, mask);
        debug!("tw68: dma start at {:#x} ({})", program.bus_address(), geometry.format.name);
    }

    /// Disable the engine and its interrupts
    ///
    /// Video status latched before the engine went down is acknowledged
    /// too, so it cannot be charged to the next program started.
    pub fn stop(&self) {
        self.regs.clear32(regs::DMAC, DmaCtrl::all().bits());
        self.irq_mask.fetch_and(!IntStatus::VIDEO.bits(), Ordering::AcqRel);
        self.regs.clear32(regs::INTMASK, IntStatus::VIDEO.bits());
        self.regs.write32(regs::INTSTAT, IntStatus::VIDEO.bits());
    }

    /// Bus address the engine is currently fetching from
    pub fn program_pointer(&self) -> u32 {
        self.regs.read32(regs::DMAP_PP)
    }

    pub fn running(&self) -> bool {
        self.regs.read32(regs::DMAC) & DmaCtrl::DMAP_EN.bits() != 0
    }

    /// Mask everything after an interrupt storm
    pub fn mask_all(&self) {
        self.irq_mask.store(0, Ordering::Release);
        self.regs.write32(regs::INTMASK, 0);
    }
}
