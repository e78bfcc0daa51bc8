// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Owned RISC programs
//!
//! A [`DmaProgram`] is a coherent allocation holding a complete RISC
//! program whose last instruction is always a `JUMP`. The queue chains
//! buffers by rewriting that jump's target while the engine may be
//! executing; see [`DmaProgram::set_tail_target`].

use std::fmt::Write as _;
use std::sync::atomic::{fence, Ordering};

use log::trace;

use crate::dma::{DmaMemory, DmaOps};
use crate::error::Result;
use crate::risc::{
    self, FieldLayout, Instruction, LineOffset, Opcode, Parity, RiscWriter, ScatterEntry, INSTRUCTION_BYTES,
    INT_BIT,
};

/// Stopper allocation: one jump plus one spare instruction
const STOPPER_BYTES: usize = 16;

/// Shape of a buffer program
///
/// `top` and `bottom` are byte offsets of the first line of each field in
/// the buffer; a missing field is not captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramLayout {
    pub top: Option<u32>,
    pub bottom: Option<u32>,
    pub bpl: u32,
    pub padding: u32,
    pub lines: u32,
}

impl ProgramLayout {
    fn fields(&self) -> u32 {
        self.top.is_some() as u32 + self.bottom.is_some() as u32
    }
}

pub struct DmaProgram {
    mem: Box<dyn DmaMemory>,
    /// Word index of the tail jump
    jump: usize,
}

impl DmaProgram {
    /// Allocate and fill a program capturing `layout` into `sglist`
    ///
    /// The tail jump initially loops on itself; the queue points it at the
    /// next program or the stopper before the engine can reach it.
    pub fn build(
        ops: &dyn DmaOps,
        sglist: &[ScatterEntry],
        layout: &ProgramLayout,
        line_offset: LineOffset,
    ) -> Result<Self> {
        let fields = layout.fields();
        assert!(fields > 0, "tw68: program without fields");

        let instructions = risc::estimate_instructions(fields, layout.bpl, layout.padding, layout.lines);
        let mem = ops.alloc_coherent(instructions * INSTRUCTION_BYTES)?;

        let jump = {
            let mut writer = RiscWriter::new(mem.words());
            for (parity, offset) in [(Parity::Odd, layout.top), (Parity::Even, layout.bottom)] {
                let Some(offset) = offset else { continue };
                let field = FieldLayout {
                    sync: Some(parity),
                    offset,
                    bpl: layout.bpl,
                    padding: layout.padding,
                    lines: layout.lines,
                    lines_per_irq: 0,
                };
                writer.field(sglist, &field, line_offset);
            }
            writer.position()
        };
        assert!(
            (jump + 2) * 4 <= mem.size(),
            "tw68: risc program overflow ({} of {} bytes)",
            (jump + 2) * 4,
            mem.size()
        );

        let program = Self { mem, jump };
        program.set_tail_target(program.jump_address(), false);
        trace!(
            "tw68: program {:#x}: {} instructions, estimate {}",
            program.bus_address(),
            jump / 2 + 1,
            instructions
        );
        Ok(program)
    }

    /// The idle program: a single jump to itself
    pub fn stopper(ops: &dyn DmaOps) -> Result<Self> {
        let mem = ops.alloc_coherent(STOPPER_BYTES)?;
        let program = Self { mem, jump: 0 };
        program.set_tail_target(program.bus_address(), false);
        Ok(program)
    }

    pub fn bus_address(&self) -> u32 {
        self.mem.bus_address()
    }

    pub fn size(&self) -> usize {
        self.mem.size()
    }

    /// Bus address of the tail jump instruction
    pub fn jump_address(&self) -> u32 {
        self.bus_address() + (self.jump * 4) as u32
    }

    /// Whether `addr` falls inside this allocation
    pub fn contains(&self, addr: u32) -> bool {
        let start = self.bus_address() as u64;
        (start..start + self.size() as u64).contains(&(addr as u64))
    }

    /// Point the tail jump at `target`
    ///
    /// The engine may be running this program. Everything written before
    /// this call, including the program at `target`, is made visible before
    /// the new target is.
    pub fn set_tail_target(&self, target: u32, irq: bool) {
        let words = self.mem.words();
        let op = Opcode::Jump as u32 | if irq { INT_BIT } else { 0 };
        words[self.jump].store(op, Ordering::Relaxed);
        fence(Ordering::Release);
        words[self.jump + 1].store(target, Ordering::Release);
    }

    pub fn tail_target(&self) -> u32 {
        self.mem.words()[self.jump + 1].load(Ordering::Acquire)
    }

    /// Whether the tail jump raises DMAPI
    pub fn tail_irq(&self) -> bool {
        self.mem.words()[self.jump].load(Ordering::Acquire) & INT_BIT != 0
    }

    /// Raw words up to and including the tail jump
    pub fn snapshot(&self) -> Vec<u32> {
        self.mem.words()[..self.jump + 2].iter().map(|w| w.load(Ordering::Acquire)).collect()
    }

    /// Decoded instructions up to and including the tail jump
    pub fn instructions(&self) -> Vec<Instruction> {
        self.snapshot()
            .chunks_exact(2)
            .filter_map(|w| Instruction::decode(w[0], w[1]))
            .collect()
    }

    /// One line per instruction, prefixed with its bus address
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let base = self.bus_address();
        for (i, ins) in self.instructions().iter().enumerate() {
            let _ = writeln!(out, "{:#010x}: {}", base + (i * INSTRUCTION_BYTES) as u32, ins);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::HostDma;

    #[test]
    fn test_stopper_jumps_to_itself() {
        let dma = HostDma::new();
        let stopper = DmaProgram::stopper(&dma).unwrap();
        let ins = stopper.instructions();
        assert_eq!(ins.len(), 1);
        assert_eq!(ins[0].opcode, Opcode::Jump);
        assert_eq!(ins[0].address, stopper.bus_address());
        assert!(!ins[0].irq);
        assert_eq!(stopper.size(), 16);
        assert!(stopper.contains(stopper.bus_address() + 8));
        assert!(!stopper.contains(stopper.bus_address() + 16));
    }

    #[test]
    fn test_interlaced_program_shape() {
        let dma = HostDma::new();
        let bpl = 640 * 2;
        let sg = dma.map_buffer(0, (bpl * 8) as usize).unwrap();
        let layout = ProgramLayout { top: Some(0), bottom: Some(bpl), bpl, padding: bpl, lines: 4 };
        let program = DmaProgram::build(&dma, &sg, &layout, LineOffset::Omit).unwrap();

        let ins = program.instructions();
        assert_eq!(ins.first().map(|i| i.opcode), Some(Opcode::SyncOdd));
        assert_eq!(ins.iter().filter(|i| i.opcode == Opcode::SyncEven).count(), 1);
        assert_eq!(ins.last().map(|i| i.opcode), Some(Opcode::Jump));
        let bytes: u32 = ins
            .iter()
            .filter(|i| matches!(i.opcode, Opcode::LineStart | Opcode::Inline))
            .map(|i| i.count as u32)
            .sum();
        assert_eq!(bytes, bpl * 8);
    }

    #[test]
    fn test_tail_retarget() {
        let dma = HostDma::new();
        let sg = [ScatterEntry::new(0x20_0000, 4096)];
        let layout = ProgramLayout { top: Some(0), bottom: None, bpl: 512, padding: 0, lines: 8 };
        let program = DmaProgram::build(&dma, &sg, &layout, LineOffset::Omit).unwrap();
        assert_eq!(program.tail_target(), program.jump_address());
        assert!(!program.tail_irq());

        program.set_tail_target(0xdead_0000, true);
        assert_eq!(program.tail_target(), 0xdead_0000);
        assert!(program.tail_irq());
        assert!(program.disassemble().lines().last().unwrap().contains("JUMP      INT -> 0xdead0000"));
    }

    #[test]
    fn test_build_releases_nothing_on_success() {
        let dma = HostDma::new();
        let sg = [ScatterEntry::new(0x20_0000, 4096)];
        let layout = ProgramLayout { top: None, bottom: Some(0), bpl: 256, padding: 0, lines: 4 };
        let program = DmaProgram::build(&dma, &sg, &layout, LineOffset::Omit).unwrap();
        assert_eq!(dma.live_allocations(), 1);
        drop(program);
        assert_eq!(dma.live_allocations(), 0);
    }
}
