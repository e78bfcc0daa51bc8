// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Board table and subsystem-ID detection

use log::{error, info, warn};

use crate::error::{Error, Result};

pub const PCI_VENDOR_TECHWELL: u16 = 0x1797;
pub const PCI_DEVICE_TW6801_VIDEO: u16 = 0x6801;

pub const BOARD_UNKNOWN: usize = 0;
pub const BOARD_TW6801: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Composite1,
    Composite2,
    Composite3,
    Composite4,
}

impl InputKind {
    pub fn name(&self) -> &'static str {
        match self {
            InputKind::Composite1 => "Composite1",
            InputKind::Composite2 => "Composite2",
            InputKind::Composite3 => "Composite3",
            InputKind::Composite4 => "Composite4",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardInput {
    pub kind: InputKind,
    /// Decoder mux setting for this connector
    pub vmux: u32,
}

#[derive(Debug)]
pub struct Board {
    pub name: &'static str,
    pub inputs: &'static [BoardInput],
}

const COMPOSITE_X4: [BoardInput; 4] = [
    BoardInput { kind: InputKind::Composite1, vmux: 0 },
    BoardInput { kind: InputKind::Composite2, vmux: 1 },
    BoardInput { kind: InputKind::Composite3, vmux: 2 },
    BoardInput { kind: InputKind::Composite4, vmux: 3 },
];

pub static BOARDS: [Board; 2] = [
    Board { name: "UNKNOWN/GENERIC", inputs: &COMPOSITE_X4 },
    Board { name: "TW6801/GENERIC", inputs: &COMPOSITE_X4 },
];

struct SubId {
    subvendor: u16,
    subdevice: u16,
    board: usize,
}

static SUBIDS: [SubId; 1] = [SubId { subvendor: 0x0000, subdevice: 0x0000, board: BOARD_TW6801 }];

/// Pick the board for a device
///
/// An explicit `forced` board number wins when valid; otherwise the PCI
/// subsystem IDs are matched against known boards.
pub fn identify(name: &str, subvendor: u16, subdevice: u16, forced: Option<usize>) -> usize {
    if let Some(nr) = forced {
        if nr < BOARDS.len() {
            info!("{}: board forced to {}", name, BOARDS[nr].name);
            return nr;
        }
        warn!("{}: card={} out of range, autodetecting", name, nr);
    }

    if let Some(id) = SUBIDS.iter().find(|s| s.subvendor == subvendor && s.subdevice == subdevice) {
        info!("{}: subsystem {:04x}:{:04x} -> {}", name, subvendor, subdevice, BOARDS[id.board].name);
        return id.board;
    }

    error!("{}: board {:04x}:{:04x} not recognised, pass a card number to override", name, subvendor, subdevice);
    for (i, b) in BOARDS.iter().enumerate() {
        error!("{}:    card={} -> {}", name, i, b.name);
    }
    BOARD_UNKNOWN
}

/// Connector at position `index` on `board`
pub fn input(board: &Board, index: u32) -> Result<&'static BoardInput> {
    board.inputs.get(index as usize).ok_or(Error::InvalidArgument)
}
