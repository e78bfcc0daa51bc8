// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Capture buffer lifecycle
//!
//! ```text
//! NeedsInit --prepare--> Prepared --queue--> Queued --promote--> Active
//!     ^                     ^                  |                   |
//!     |                     |                  +------ start ------+
//!     |                     |                                      |
//!     +---- release --------+---- prepare ----- Done / Error <-----+
//! ```

use std::time::Instant;

use log::trace;

use crate::dma::DmaOps;
use crate::error::{Error, Result};
use crate::format::{FieldMode, Geometry, Norm};
use crate::program::{DmaProgram, ProgramLayout};
use crate::risc::{LineOffset, ScatterEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    NeedsInit,
    Prepared,
    Queued,
    Active,
    Done,
    Error,
}

/// Index of a buffer in its queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub(crate) u32);

impl BufferHandle {
    pub fn index(&self) -> u32 {
        self.0
    }
}

/// Where each field lands in a buffer of `height` lines of `bpl` bytes
pub fn program_layout(field: FieldMode, bpl: u32, height: u32) -> ProgramLayout {
    let half = bpl * (height / 2);
    let (top, bottom, padding, lines) = match field {
        FieldMode::Top => (Some(0), None, 0, height),
        FieldMode::Bottom => (None, Some(0), 0, height),
        FieldMode::Interlaced => (Some(0), Some(bpl), bpl, height / 2),
        FieldMode::SeqTopBottom => (Some(0), Some(half), 0, height / 2),
        FieldMode::SeqBottomTop => (Some(half), Some(0), 0, height / 2),
        FieldMode::Any => panic!("tw68: field mode must be resolved before programming"),
    };
    ProgramLayout { top, bottom, bpl, padding, lines }
}

pub(crate) struct CaptureBuffer {
    pub(crate) index: u32,
    /// Bytes reserved for this buffer when it was requested
    pub(crate) capacity: usize,
    pub(crate) state: BufferState,
    pub(crate) geometry: Option<Geometry>,
    pub(crate) norm: Option<&'static Norm>,
    pub(crate) sglist: Option<Vec<ScatterEntry>>,
    pub(crate) program: Option<DmaProgram>,
    /// Position in the current hardware run
    pub(crate) hw_count: u32,
    pub(crate) sequence: u32,
    pub(crate) timestamp: Option<Instant>,
}

impl CaptureBuffer {
    pub(crate) fn new(index: u32, capacity: usize) -> Self {
        Self {
            index,
            capacity,
            state: BufferState::NeedsInit,
            geometry: None,
            norm: None,
            sglist: None,
            program: None,
            hw_count: 0,
            sequence: 0,
            timestamp: None,
        }
    }

    pub(crate) fn program(&self) -> &DmaProgram {
        match &self.program {
            Some(p) => p,
            None => panic!("tw68: buffer {} scheduled without a program", self.index),
        }
    }

    pub(crate) fn geometry(&self) -> Geometry {
        match self.geometry {
            Some(g) => g,
            None => panic!("tw68: buffer {} scheduled without geometry", self.index),
        }
    }

    pub(crate) fn norm(&self) -> &'static Norm {
        match self.norm {
            Some(n) => n,
            None => panic!("tw68: buffer {} scheduled without a norm", self.index),
        }
    }

    /// Bring the buffer to `Prepared` for `geometry`
    ///
    /// Maps the buffer on first use and builds a new program only when the
    /// geometry changed since the last prepare; otherwise the existing
    /// program is kept as is. On failure every resource the buffer held is
    /// released and it returns to `NeedsInit`.
    pub(crate) fn prepare(
        &mut self,
        ops: &dyn DmaOps,
        geometry: Geometry,
        norm: &'static Norm,
        line_offset: LineOffset,
    ) -> Result<()> {
        assert!(
            !matches!(self.state, BufferState::Queued | BufferState::Active),
            "tw68: prepare of in-flight buffer {}",
            self.index
        );

        if !norm.accepts(geometry.width, geometry.height) || geometry.size_image() > self.capacity {
            self.release(ops);
            return Err(Error::InvalidArgument);
        }

        let mut rebuild = self.geometry != Some(geometry) || self.program.is_none();
        if self.state == BufferState::NeedsInit || self.sglist.is_none() {
            match ops.map_buffer(self.index, self.capacity) {
                Ok(sg) => self.sglist = Some(sg),
                Err(e) => {
                    self.release(ops);
                    return Err(e);
                }
            }
            rebuild = true;
        }

        if rebuild {
            if let Err(e) = self.build(ops, &geometry, line_offset) {
                self.release(ops);
                return Err(e);
            }
        }

        self.geometry = Some(geometry);
        self.norm = Some(norm);
        self.state = BufferState::Prepared;
        Ok(())
    }

    fn build(&mut self, ops: &dyn DmaOps, geometry: &Geometry, line_offset: LineOffset) -> Result<()> {
        let Some(sglist) = self.sglist.as_deref() else {
            return Err(Error::InvalidArgument);
        };
        if sglist.iter().any(|e| e.physical_address + e.length as u64 > 1 << 32) {
            return Err(Error::AddressRange);
        }
        let mapped: usize = sglist.iter().map(|e| e.length as usize).sum();
        if mapped < geometry.size_image() {
            return Err(Error::InvalidArgument);
        }

        let layout = program_layout(geometry.field, geometry.bytes_per_line(), geometry.height);
        // drop the old program only once the new one exists
        let program = DmaProgram::build(ops, sglist, &layout, line_offset)?;
        trace!(
            "tw68: buffer {} {}x{} {:?} program at {:#x}",
            self.index,
            geometry.width,
            geometry.height,
            geometry.field,
            program.bus_address()
        );
        self.program = Some(program);
        Ok(())
    }

    /// Free the program and the mapping, back to `NeedsInit`
    pub(crate) fn release(&mut self, ops: &dyn DmaOps) {
        assert!(
            !matches!(self.state, BufferState::Queued | BufferState::Active),
            "tw68: release of in-flight buffer {}",
            self.index
        );
        self.program = None;
        if self.sglist.take().is_some() {
            ops.unmap_buffer(self.index);
        }
        self.geometry = None;
        self.norm = None;
        self.state = BufferState::NeedsInit;
    }
}
