// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! RISC instruction encoding and field program builder
//!
//! The TW6800 DMA engine executes a list of 8-byte instructions from host
//! memory. Word 0 carries the opcode, the IRQ flag, a 3-bit data type, a
//! 12-bit start offset and a 12-bit byte count; word 1 carries a 32-bit
//! bus address.
//!
//! A field is described as `lines` rows of `bpl` bytes, each followed by
//! `padding` bytes that are skipped, laid out over a scatter list of
//! physically discontiguous chunks. A row that fits inside the current
//! chunk becomes one `LINE_START`; a row that straddles chunks becomes a
//! `LINE_START` for the first fragment followed by one `INLINE` per
//! further fragment, each tagged with the number of bytes of the row
//! already written.

use core::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::PAGE_SIZE;

/// Bytes per RISC instruction
pub const INSTRUCTION_BYTES: usize = 8;

/// Raise DMAPI when this instruction completes
pub const INT_BIT: u32 = 0x0800_0000;

/// Largest byte count (and start offset) an instruction can encode
pub const COUNT_MASK: u32 = 0xfff;

const START_SHIFT: u32 = 12;
const TYPE_SHIFT: u32 = 24;
const TYPE_MASK: u32 = 0x7;
const OPCODE_MASK: u32 = 0xf000_0000;

/// Data type tagging the first fragment of a split line
const SPLIT_LINE_TYPE: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    /// Wait for the start of the odd (top) field
    SyncOdd = 0xc000_0000,
    /// Wait for the start of the even (bottom) field
    SyncEven = 0xd000_0000,
    Jump = 0xb000_0000,
    LineStart = 0x9000_0000,
    Inline = 0xa000_0000,
}

impl Opcode {
    pub fn from_word(word: u32) -> Option<Self> {
        match word & OPCODE_MASK {
            0xc000_0000 => Some(Opcode::SyncOdd),
            0xd000_0000 => Some(Opcode::SyncEven),
            0xb000_0000 => Some(Opcode::Jump),
            0x9000_0000 => Some(Opcode::LineStart),
            0xa000_0000 => Some(Opcode::Inline),
            _ => None,
        }
    }

    fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::SyncOdd => "SYNCO",
            Opcode::SyncEven => "SYNCE",
            Opcode::Jump => "JUMP",
            Opcode::LineStart => "LINESTART",
            Opcode::Inline => "INLINE",
        }
    }
}

/// Field parity for the leading sync instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    Odd,
    Even,
}

impl Parity {
    fn opcode(self) -> Opcode {
        match self {
            Parity::Odd => Opcode::SyncOdd,
            Parity::Even => Opcode::SyncEven,
        }
    }
}

/// How a `LINE_START` that fits its chunk reports its offset in that chunk
///
/// The address word already points at the right byte, so the hardware
/// does not need the start field. `Encode` fills it anyway for chips
/// that want it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LineOffset {
    #[default]
    Omit,
    Encode,
}

/// One physically contiguous chunk of a capture buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScatterEntry {
    pub physical_address: u64,
    pub length: u32,
}

impl ScatterEntry {
    pub fn new(physical_address: u64, length: u32) -> Self {
        Self { physical_address, length }
    }

    fn bus_address(&self, offset: u32) -> u32 {
        let addr = self.physical_address + offset as u64;
        assert!(addr <= u32::MAX as u64, "tw68: bus address {addr:#x} beyond 32 bits");
        addr as u32
    }
}

/// Decoded form of one instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub irq: bool,
    pub data_type: u8,
    pub start: u16,
    pub count: u16,
    pub address: u32,
}

impl Instruction {
    pub fn encode(&self) -> [u32; 2] {
        let mut word = self.opcode as u32;
        if self.irq {
            word |= INT_BIT;
        }
        word |= (self.data_type as u32 & TYPE_MASK) << TYPE_SHIFT;
        word |= (self.start as u32 & COUNT_MASK) << START_SHIFT;
        word |= self.count as u32 & COUNT_MASK;
        [word, self.address]
    }

    pub fn decode(word: u32, address: u32) -> Option<Self> {
        Some(Self {
            opcode: Opcode::from_word(word)?,
            irq: word & INT_BIT != 0,
            data_type: ((word >> TYPE_SHIFT) & TYPE_MASK) as u8,
            start: ((word >> START_SHIFT) & COUNT_MASK) as u16,
            count: (word & COUNT_MASK) as u16,
            address,
        })
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<9}", self.opcode.mnemonic())?;
        if self.irq {
            write!(f, " INT")?;
        }
        match self.opcode {
            Opcode::SyncOdd | Opcode::SyncEven => Ok(()),
            Opcode::Jump => write!(f, " -> {:#010x}", self.address),
            Opcode::LineStart | Opcode::Inline => write!(
                f,
                " type={} start={} count={} addr={:#010x}",
                self.data_type, self.start, self.count, self.address
            ),
        }
    }
}

/// Geometry of one field inside a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLayout {
    /// Leading sync instruction, if any
    pub sync: Option<Parity>,
    /// Byte offset of the first line in the buffer
    pub offset: u32,
    pub bpl: u32,
    pub padding: u32,
    pub lines: u32,
    /// Raise an interrupt every this many lines; zero disables
    pub lines_per_irq: u32,
}

/// Upper bound on instructions needed for `fields` fields of the given
/// shape, plus room for the trailing jump
///
/// Each line is at least one instruction, and crosses into a new chunk at
/// most once per page of span; each field adds one sync.
pub fn estimate_instructions(fields: u32, bpl: u32, padding: u32, lines: u32) -> usize {
    let span = (bpl as u64 + padding as u64) * lines as u64;
    let crossings = span.div_ceil(PAGE_SIZE as u64) as usize;
    fields as usize * (1 + crossings + lines as usize) + 2
}

/// Sequential writer over a pre-sized instruction region
pub struct RiscWriter<'a> {
    words: &'a [AtomicU32],
    pos: usize,
}

impl<'a> RiscWriter<'a> {
    pub fn new(words: &'a [AtomicU32]) -> Self {
        Self { words, pos: 0 }
    }

    /// Current position in 32-bit words
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn emit(&mut self, word: u32, address: u32) {
        assert!(
            self.pos + 2 <= self.words.len(),
            "tw68: risc program overflow at word {} of {}",
            self.pos,
            self.words.len()
        );
        self.words[self.pos].store(word, Ordering::Relaxed);
        self.words[self.pos + 1].store(address, Ordering::Relaxed);
        self.pos += 2;
    }

    fn flag_last(&mut self) {
        if self.pos >= 2 {
            self.words[self.pos - 2].fetch_or(INT_BIT, Ordering::Relaxed);
        }
    }

    /// Emit the instructions for one field
    ///
    /// Panics if `bpl` does not fit the 12-bit count field, or if the
    /// scatter list runs out before `lines` lines are covered.
    pub fn field(&mut self, sglist: &[ScatterEntry], layout: &FieldLayout, line_offset: LineOffset) {
        let bpl = layout.bpl;
        assert!(bpl > 0 && bpl <= COUNT_MASK, "tw68: bytes per line {bpl} not encodable");

        if let Some(parity) = layout.sync {
            self.emit(parity.opcode() as u32, 0);
        }

        let mut idx = 0usize;
        let mut offset = layout.offset;
        for line in 0..layout.lines {
            while offset > 0 && offset >= entry(sglist, idx).length {
                offset -= entry(sglist, idx).length;
                idx += 1;
            }

            let sg = entry(sglist, idx);
            if bpl <= sg.length - offset {
                let start = match line_offset {
                    LineOffset::Omit => 0,
                    LineOffset::Encode => (offset & COUNT_MASK) << START_SHIFT,
                };
                self.emit(Opcode::LineStart as u32 | start | bpl, sg.bus_address(offset));
                offset += bpl;
            } else {
                let mut done = sg.length - offset;
                self.emit(
                    Opcode::LineStart as u32 | (SPLIT_LINE_TYPE << TYPE_SHIFT) | done,
                    sg.bus_address(offset),
                );
                let mut todo = bpl - done;
                idx += 1;
                while todo > entry(sglist, idx).length {
                    let sg = entry(sglist, idx);
                    self.emit(Opcode::Inline as u32 | (done << START_SHIFT) | sg.length, sg.bus_address(0));
                    todo -= sg.length;
                    done += sg.length;
                    idx += 1;
                }
                let sg = entry(sglist, idx);
                self.emit(Opcode::Inline as u32 | (done << START_SHIFT) | todo, sg.bus_address(0));
                offset = todo;
            }
            offset += layout.padding;

            if layout.lines_per_irq > 0 && line > 0 && line % layout.lines_per_irq == 0 {
                self.flag_last();
            }
        }
    }
}

fn entry(sglist: &[ScatterEntry], idx: usize) -> &ScatterEntry {
    sglist
        .get(idx)
        .unwrap_or_else(|| panic!("tw68: scatter list exhausted at entry {idx}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(words: usize) -> Vec<AtomicU32> {
        (0..words).map(|_| AtomicU32::new(0)).collect()
    }

    fn decode_all(words: &[AtomicU32], end: usize) -> Vec<Instruction> {
        words[..end]
            .chunks(2)
            .map(|w| Instruction::decode(w[0].load(Ordering::Relaxed), w[1].load(Ordering::Relaxed)).unwrap())
            .collect()
    }

    fn layout(bpl: u32, lines: u32) -> FieldLayout {
        FieldLayout { sync: None, offset: 0, bpl, padding: 0, lines, lines_per_irq: 0 }
    }

    #[test]
    fn test_lines_inside_one_page() {
        let sg = [ScatterEntry::new(0x1000, 4096)];
        let mem = region(16);
        let mut w = RiscWriter::new(&mem);
        w.field(&sg, &layout(720, 2), LineOffset::Omit);

        let ins = decode_all(&mem, w.position());
        assert_eq!(ins.len(), 2);
        assert!(ins.iter().all(|i| i.opcode == Opcode::LineStart && i.count == 720));
        assert_eq!(ins[0].address, 0x1000);
        assert_eq!(ins[1].address, 0x1000 + 720);
    }

    #[test]
    fn test_line_split_across_chunks() {
        let sg = [ScatterEntry::new(0x10000, 2048), ScatterEntry::new(0x40000, 2048)];
        let mem = region(16);
        let mut w = RiscWriter::new(&mem);
        w.field(&sg, &layout(3000, 1), LineOffset::Omit);

        let ins = decode_all(&mem, w.position());
        assert_eq!(ins.len(), 2);
        assert_eq!(ins[0].opcode, Opcode::LineStart);
        assert_eq!(ins[0].data_type, 7);
        assert_eq!(ins[0].count, 2048);
        assert_eq!(ins[0].address, 0x10000);
        assert_eq!(ins[1].opcode, Opcode::Inline);
        assert_eq!(ins[1].count, 952);
        assert_eq!(ins[1].start, 2048);
        assert_eq!(ins[1].address, 0x40000);
    }

    #[test]
    fn test_split_line_spanning_three_chunks() {
        let sg = [
            ScatterEntry::new(0x10000, 1000),
            ScatterEntry::new(0x20000, 1000),
            ScatterEntry::new(0x30000, 4096),
        ];
        let mem = region(32);
        let mut w = RiscWriter::new(&mem);
        w.field(&sg, &layout(2500, 2), LineOffset::Omit);

        let ins = decode_all(&mem, w.position());
        assert_eq!(ins.len(), 4);
        assert_eq!((ins[0].count, ins[0].start), (1000, 0));
        assert_eq!((ins[1].opcode, ins[1].start, ins[1].count), (Opcode::Inline, 1000, 1000));
        assert_eq!((ins[2].opcode, ins[2].start, ins[2].count), (Opcode::Inline, 2000, 500));
        assert_eq!(ins[3].opcode, Opcode::LineStart);
        assert_eq!(ins[3].address, 0x30000 + 500);
    }

    #[test]
    fn test_counts_cover_every_line() {
        let sg: Vec<_> = (0..64u64).map(|i| ScatterEntry::new(0x100000 + i * 0x2000, 4096)).collect();
        let (bpl, lines) = (1440, 120);
        let fields = 1;
        let cap = estimate_instructions(fields, bpl, 0, lines) * 2;
        let mem = region(cap);
        let mut w = RiscWriter::new(&mem);
        w.field(&sg, &layout(bpl, lines), LineOffset::Omit);

        let ins = decode_all(&mem, w.position());
        let total: u32 = ins.iter().map(|i| i.count as u32).sum();
        assert_eq!(total, bpl * lines);
        assert!(ins.len() + 1 <= estimate_instructions(fields, bpl, 0, lines));
    }

    #[test]
    fn test_padding_and_offset_skip_bytes() {
        let sg = [ScatterEntry::new(0x8000, 4096), ScatterEntry::new(0x20000, 4096)];
        let mem = region(32);
        let mut w = RiscWriter::new(&mem);
        let l = FieldLayout { sync: Some(Parity::Even), offset: 1000, bpl: 1000, padding: 1000, lines: 3, lines_per_irq: 0 };
        w.field(&sg, &l, LineOffset::Omit);

        let ins = decode_all(&mem, w.position());
        assert_eq!(ins[0].opcode, Opcode::SyncEven);
        assert_eq!(ins[1].address, 0x8000 + 1000);
        assert_eq!(ins[2].address, 0x8000 + 3000);
        // third line starts at byte 5000, inside the second chunk
        assert_eq!(ins[3].address, 0x20000 + 904);
    }

    #[test]
    fn test_line_offset_encoding() {
        let sg = [ScatterEntry::new(0x1000, 4096)];
        let mem = region(16);
        let mut w = RiscWriter::new(&mem);
        w.field(&sg, &layout(720, 2), LineOffset::Encode);

        let ins = decode_all(&mem, w.position());
        assert_eq!(ins[0].start, 0);
        assert_eq!(ins[1].start, 720);
    }

    #[test]
    fn test_interrupt_every_n_lines() {
        let sg = [ScatterEntry::new(0x1000, 4096)];
        let mem = region(32);
        let mut w = RiscWriter::new(&mem);
        let l = FieldLayout { sync: None, offset: 0, bpl: 100, padding: 0, lines: 7, lines_per_irq: 3 };
        w.field(&sg, &l, LineOffset::Omit);

        let flagged: Vec<_> = decode_all(&mem, w.position()).iter().map(|i| i.irq).collect();
        assert_eq!(flagged, [false, false, false, true, false, false, true]);
    }

    #[test]
    #[should_panic(expected = "not encodable")]
    fn test_oversized_line_rejected() {
        let sg = [ScatterEntry::new(0x1000, 8192)];
        let mem = region(16);
        RiscWriter::new(&mem).field(&sg, &layout(4096, 1), LineOffset::Omit);
    }

    #[test]
    #[should_panic(expected = "overflow")]
    fn test_writer_overflow_panics() {
        let sg = [ScatterEntry::new(0x1000, 4096)];
        let mem = region(2);
        RiscWriter::new(&mem).field(&sg, &layout(100, 2), LineOffset::Omit);
    }

    #[test]
    fn test_instruction_display() {
        let jump = Instruction { opcode: Opcode::Jump, irq: true, data_type: 0, start: 0, count: 0, address: 0x1234 };
        assert_eq!(jump.to_string(), "JUMP      INT -> 0x00001234");
        assert_eq!(Instruction::decode(jump.encode()[0], 0x1234), Some(jump));
    }
}
