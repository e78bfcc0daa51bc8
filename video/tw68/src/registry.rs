// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Shared per-chip state, keyed by PCI location
//!
//! A chip is brought up once, on the first [`DeviceRegistry::get`] for its
//! bus and slot, and shut down when the last reference is returned.

use std::sync::Arc;

use log::info;
use parking_lot::Mutex;

use crate::config::DriverConfig;
use crate::decoder;
use crate::device::Tw68Core;
use crate::error::{Error, Result};
use crate::regs::Registers;

/// Chips a single registry will bring up
pub const MAX_DEVICES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciLocation {
    pub bus: u8,
    pub slot: u8,
    pub subsystem_vendor: u16,
    pub subsystem_device: u16,
}

impl PciLocation {
    fn same_slot(&self, other: &PciLocation) -> bool {
        self.bus == other.bus && self.slot == other.slot
    }
}

struct Entry {
    core: Arc<Tw68Core>,
    refs: usize,
}

#[derive(Default)]
struct RegistryInner {
    entries: Vec<Entry>,
    /// Next core number; never reused
    count: usize,
}

#[derive(Default)]
pub struct DeviceRegistry {
    inner: Mutex<RegistryInner>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference to the core at `location`, bringing it up if needed
    pub fn get(&self, location: PciLocation, regs: Arc<dyn Registers>, config: &DriverConfig) -> Result<Arc<Tw68Core>> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.core.location().same_slot(&location)) {
            entry.refs += 1;
            return Ok(entry.core.clone());
        }
        if inner.entries.len() >= MAX_DEVICES {
            return Err(Error::NoDevice);
        }

        let nr = inner.count;
        inner.count += 1;
        let core = Arc::new(Tw68Core::new(nr, location, regs, config));
        info!(
            "{}: found at {:02x}:{:02x}, {}",
            core.name(),
            location.bus,
            location.slot,
            core.board().name
        );
        inner.entries.push(Entry { core: core.clone(), refs: 1 });
        Ok(core)
    }

    /// Return a reference taken with [`DeviceRegistry::get`]
    pub fn put(&self, core: &Arc<Tw68Core>) {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.entries.iter().position(|e| Arc::ptr_eq(&e.core, core)) else {
            panic!("tw68: put of unregistered core {}", core.name());
        };
        inner.entries[pos].refs -= 1;
        if inner.entries[pos].refs == 0 {
            let entry = inner.entries.remove(pos);
            decoder::shutdown(&*entry.core.regs());
            info!("{}: released", entry.core.name());
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cards::BOARD_TW6801;
    use crate::regs::{self, MemRegs, Registers};
    use std::time::Duration;

    fn config() -> DriverConfig {
        DriverConfig { reset_settle: Duration::ZERO, ..DriverConfig::default() }
    }

    fn location(slot: u8) -> PciLocation {
        PciLocation { bus: 1, slot, subsystem_vendor: 0, subsystem_device: 0 }
    }

    #[test]
    fn test_same_slot_shares_core() {
        let registry = DeviceRegistry::new();
        let regs = Arc::new(MemRegs::new());
        let a = registry.get(location(4), regs.clone(), &config()).unwrap();
        let b = registry.get(location(4), regs.clone(), &config()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(a.board_nr(), BOARD_TW6801);

        registry.put(&a);
        assert_eq!(registry.len(), 1);
        registry.put(&b);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_numbers_are_not_reused() {
        let registry = DeviceRegistry::new();
        let a = registry.get(location(1), Arc::new(MemRegs::new()), &config()).unwrap();
        let b = registry.get(location(2), Arc::new(MemRegs::new()), &config()).unwrap();
        assert_eq!((a.name(), b.name()), ("tw68[0]", "tw68[1]"));
        registry.put(&a);
        let c = registry.get(location(3), Arc::new(MemRegs::new()), &config()).unwrap();
        assert_eq!(c.name(), "tw68[2]");
    }

    #[test]
    fn test_bring_up_resets_chip() {
        let registry = DeviceRegistry::new();
        let regs = Arc::new(MemRegs::new());
        regs.write32(regs::DMAC, 0xffff);
        let core = registry.get(location(1), regs.clone(), &config()).unwrap();
        assert_eq!(regs.read32(regs::DMAC), 0x2000);
        assert_eq!(regs.read32(regs::INTMASK), 0);

        regs.write32(regs::INTMASK, 0x7a);
        registry.put(&core);
        assert_eq!(regs.read32(regs::INTMASK), 0);
    }

    #[test]
    fn test_registry_full() {
        let registry = DeviceRegistry::new();
        for slot in 0..MAX_DEVICES as u8 {
            registry.get(location(slot), Arc::new(MemRegs::new()), &config()).unwrap();
        }
        let err = registry.get(location(99), Arc::new(MemRegs::new()), &config());
        assert_eq!(err.err(), Some(Error::NoDevice));
    }
}
