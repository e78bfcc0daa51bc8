// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Error types for capture operations

use core::fmt;

use crate::regs::IntStatus;

/// Capture result type
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Capture error type
///
/// Precondition violations (builder overflow, a buffer listed twice,
/// unknown field mode reaching the program builder) are not errors; they
/// panic at the point of detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// DMA program, scatter mapping or stopper allocation failed
    OutOfMemory,
    /// Geometry, format, index or control value rejected
    InvalidArgument,
    /// Resource held by another handle, or buffer already in flight
    Busy,
    /// Non-blocking dequeue found no finished buffer
    WouldBlock,
    /// Capture is not streaming
    NotStreaming,
    /// Engine was stopped by a fault interrupt
    HardwareFault(IntStatus),
    /// No such device
    NoDevice,
    /// Bus address outside the 32-bit window of the DMA engine
    AddressRange,
    /// Generic I/O failure
    Io,
}

impl Error {
    /// POSIX errno equivalent, for scheme-level replies
    pub fn errno(&self) -> i32 {
        match self {
            Error::OutOfMemory => 12,
            Error::InvalidArgument => 22,
            Error::Busy => 16,
            Error::WouldBlock => 11,
            Error::NotStreaming => 22,
            Error::HardwareFault(_) => 5,
            Error::NoDevice => 19,
            Error::AddressRange => 14,
            Error::Io => 5,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "Out of DMA memory"),
            Error::InvalidArgument => write!(f, "Invalid argument"),
            Error::Busy => write!(f, "Resource busy"),
            Error::WouldBlock => write!(f, "No buffer ready"),
            Error::NotStreaming => write!(f, "Capture not streaming"),
            Error::HardwareFault(status) => write!(f, "Hardware fault (status {:#x})", status.bits()),
            Error::NoDevice => write!(f, "No such device"),
            Error::AddressRange => write!(f, "Bus address out of range"),
            Error::Io => write!(f, "I/O error"),
        }
    }
}

impl std::error::Error for Error {}
