// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! DMA memory services
//!
//! The capture core never touches physical memory directly. It asks a
//! [`DmaOps`] implementation for coherent memory to hold RISC programs and
//! for scatter lists describing capture buffers, and hands both back when
//! done. [`HostDma`] is a self-contained implementation that hands out
//! fake 32-bit bus addresses from a recycling window allocator.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use log::trace;
use spin::Mutex as SpinMutex;

use crate::error::{Error, Result};
use crate::risc::ScatterEntry;
use crate::PAGE_SIZE;

/// A coherent allocation visible to both CPU and device
///
/// Freed when dropped.
pub trait DmaMemory: Send + Sync {
    /// Device-visible address of the first byte
    fn bus_address(&self) -> u32;

    /// CPU view as 32-bit words
    fn words(&self) -> &[AtomicU32];

    fn size(&self) -> usize {
        self.words().len() * 4
    }
}

pub trait DmaOps: Send + Sync {
    /// Allocate zeroed coherent memory of at least `size` bytes
    fn alloc_coherent(&self, size: usize) -> Result<Box<dyn DmaMemory>>;

    /// Pin and map the user buffer behind `index`, returning its chunks in
    /// buffer order
    fn map_buffer(&self, index: u32, size: usize) -> Result<Vec<ScatterEntry>>;

    fn unmap_buffer(&self, index: u32);
}

const HOST_BUS_BASE: u64 = 0x1000_0000;
const HOST_BUS_SIZE: u64 = 0xe000_0000;

/// Bus address space handed out by [`HostDma`]
///
/// Freed ranges are kept per size and handed out again before the bump
/// pointer moves, so map/unmap cycles do not exhaust the window.
struct BusWindow {
    base: u64,
    size: u64,
    next: u64,
    free: BTreeMap<u64, Vec<u64>>,
}

impl BusWindow {
    fn new(base: u64, size: u64) -> Self {
        Self { base, size, next: 0, free: BTreeMap::new() }
    }

    fn aligned(size: usize) -> u64 {
        ((size as u64) + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
    }

    fn alloc(&mut self, size: usize) -> Result<u64> {
        let aligned = Self::aligned(size);
        if let Some(addr) = self.free.get_mut(&aligned).and_then(Vec::pop) {
            return Ok(addr);
        }
        if self.next + aligned > self.size {
            return Err(Error::OutOfMemory);
        }
        let addr = self.base + self.next;
        self.next += aligned;
        Ok(addr)
    }

    fn free(&mut self, addr: u64, size: usize) {
        self.free.entry(Self::aligned(size)).or_default().push(addr);
    }
}

struct HostMemory {
    bus: u32,
    words: Box<[AtomicU32]>,
    window: Arc<SpinMutex<BusWindow>>,
    live: Arc<AtomicUsize>,
}

impl DmaMemory for HostMemory {
    fn bus_address(&self) -> u32 {
        self.bus
    }

    fn words(&self) -> &[AtomicU32] {
        &self.words
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        self.window.lock().free(self.bus as u64, self.words.len() * 4);
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Host-memory DMA backend
///
/// Scatter lists are split at page boundaries and consecutive pages are
/// deliberately not bus-contiguous, so every line layout path gets used.
/// Nothing is ever written to the mapped pages; captures made through it
/// only exercise the programs and the queue.
pub struct HostDma {
    window: Arc<SpinMutex<BusWindow>>,
    /// Chunk addresses of each mapped buffer
    mapped: SpinMutex<BTreeMap<u32, Vec<u64>>>,
    live: Arc<AtomicUsize>,
    coherent_limit: Option<usize>,
}

impl HostDma {
    pub fn new() -> Self {
        Self::with_window(HOST_BUS_SIZE)
    }

    /// Backend with `size` bytes of bus address space
    pub fn with_window(size: u64) -> Self {
        Self {
            window: Arc::new(SpinMutex::new(BusWindow::new(HOST_BUS_BASE, size))),
            mapped: SpinMutex::new(BTreeMap::new()),
            live: Arc::new(AtomicUsize::new(0)),
            coherent_limit: None,
        }
    }

    /// Fail coherent allocations once `limit` are outstanding
    pub fn with_coherent_limit(mut self, limit: usize) -> Self {
        self.coherent_limit = Some(limit);
        self
    }

    /// Outstanding coherent allocations
    pub fn live_allocations(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Buffers currently mapped
    pub fn mapped_buffers(&self) -> usize {
        self.mapped.lock().len()
    }
}

impl Default for HostDma {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaOps for HostDma {
    fn alloc_coherent(&self, size: usize) -> Result<Box<dyn DmaMemory>> {
        if let Some(limit) = self.coherent_limit {
            if self.live.load(Ordering::SeqCst) >= limit {
                return Err(Error::OutOfMemory);
            }
        }
        let bus = self.window.lock().alloc(size)?;
        let words = (0..size.div_ceil(4)).map(|_| AtomicU32::new(0)).collect();
        self.live.fetch_add(1, Ordering::SeqCst);
        trace!("tw68: coherent {size} bytes at {bus:#x}");
        Ok(Box::new(HostMemory { bus: bus as u32, words, window: self.window.clone(), live: self.live.clone() }))
    }

    fn map_buffer(&self, index: u32, size: usize) -> Result<Vec<ScatterEntry>> {
        let page = PAGE_SIZE as usize;
        let chunks = size.div_ceil(page);
        let mut sglist: Vec<ScatterEntry> = Vec::with_capacity(chunks);
        {
            let mut window = self.window.lock();
            for i in 0..chunks {
                // one page of data followed by an unused guard page
                let addr = match window.alloc(2 * page) {
                    Ok(addr) => addr,
                    Err(e) => {
                        for chunk in &sglist {
                            window.free(chunk.physical_address, 2 * page);
                        }
                        return Err(e);
                    }
                };
                let len = if i + 1 == chunks { size - i * page } else { page };
                sglist.push(ScatterEntry::new(addr, len as u32));
            }
        }
        let addrs = sglist.iter().map(|e| e.physical_address).collect();
        if let Some(stale) = self.mapped.lock().insert(index, addrs) {
            let mut window = self.window.lock();
            for addr in stale {
                window.free(addr, 2 * page);
            }
        }
        Ok(sglist)
    }

    fn unmap_buffer(&self, index: u32) {
        let Some(addrs) = self.mapped.lock().remove(&index) else {
            return;
        };
        let mut window = self.window.lock();
        for addr in addrs {
            window.free(addr, 2 * PAGE_SIZE as usize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coherent_is_page_aligned_and_zeroed() {
        let dma = HostDma::new();
        let a = dma.alloc_coherent(16).unwrap();
        let b = dma.alloc_coherent(16).unwrap();
        assert_eq!(a.bus_address() % PAGE_SIZE, 0);
        assert_eq!(b.bus_address(), a.bus_address() + PAGE_SIZE);
        assert_eq!(a.size(), 16);
        assert!(a.words().iter().all(|w| w.load(Ordering::Relaxed) == 0));
        assert_eq!(dma.live_allocations(), 2);
        drop(a);
        assert_eq!(dma.live_allocations(), 1);
    }

    #[test]
    fn test_coherent_limit() {
        let dma = HostDma::new().with_coherent_limit(1);
        let _keep = dma.alloc_coherent(64).unwrap();
        assert_eq!(dma.alloc_coherent(64).err(), Some(Error::OutOfMemory));
    }

    #[test]
    fn test_map_splits_at_pages() {
        let dma = HostDma::new();
        let sg = dma.map_buffer(3, 10_000).unwrap();
        let lens: Vec<_> = sg.iter().map(|e| e.length).collect();
        assert_eq!(lens, [4096, 4096, 1808]);
        assert_ne!(sg[0].physical_address + 4096, sg[1].physical_address);
        assert_eq!(dma.mapped_buffers(), 1);
        dma.unmap_buffer(3);
        assert_eq!(dma.mapped_buffers(), 0);
    }

    #[test]
    fn test_unmapped_ranges_are_reused() {
        // room for exactly one 3-page buffer
        let dma = HostDma::with_window(6 * PAGE_SIZE as u64);
        for _ in 0..4 {
            let sg = dma.map_buffer(0, 3 * PAGE_SIZE as usize).unwrap();
            assert_eq!(sg.len(), 3);
            dma.unmap_buffer(0);
        }
        assert_eq!(dma.map_buffer(1, PAGE_SIZE as usize * 3).map(|sg| sg.len()), Ok(3));
        assert_eq!(dma.map_buffer(2, 1).err(), Some(Error::OutOfMemory));
        assert_eq!(dma.mapped_buffers(), 1);
    }

    #[test]
    fn test_freed_coherent_memory_is_reused() {
        let dma = HostDma::with_window(PAGE_SIZE as u64);
        let first = dma.alloc_coherent(64).unwrap().bus_address();
        let again = dma.alloc_coherent(64).unwrap();
        assert_eq!(again.bus_address(), first);
        assert_eq!(dma.alloc_coherent(64).err(), Some(Error::OutOfMemory));
    }
}
