// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Techwell TW6800 video capture driver core
//!
//! The TW6800 captures analog video by executing small RISC programs from
//! host memory. Each capture buffer gets its own program describing where
//! every line of every field lands; the programs of consecutive buffers are
//! linked by rewriting the final jump of one to point at the next, and a
//! shared stopper program parks the engine when nothing is left.
//!
//! # Architecture
//!
//! ```text
//!  CaptureHandle ──► VideoDevice ──► CaptureQueue ──► DmaEngine ──► Registers
//!                        │               │    │
//!                        ▼               │    └──► CaptureBuffer ──► DmaProgram ──► risc
//!                    Tw68Core            │                               │
//!                   (decoder, norm,      └──► DmaOps (coherent memory,   │
//!                    input, controls)         scatter lists) ◄───────────┘
//! ```
//!
//! Register access goes through [`regs::Registers`] and memory through
//! [`dma::DmaOps`], so the whole core runs against [`regs::MemRegs`] and
//! [`dma::HostDma`] without hardware.

pub mod buffer;
pub mod cards;
pub mod config;
pub mod decoder;
pub mod device;
pub mod dma;
pub mod engine;
pub mod error;
pub mod format;
pub mod program;
pub mod queue;
pub mod regs;
pub mod registry;
pub mod risc;
pub mod stats;

/// Granularity of capture buffer mappings and program allocations
pub const PAGE_SIZE: u32 = 4096;

pub use buffer::{BufferHandle, BufferState};
pub use config::DriverConfig;
pub use device::{CaptureHandle, Tw68Core, VideoDevice};
pub use error::{Error, Result};
pub use format::{FieldMode, Geometry, PixFormat, StdId};
pub use program::DmaProgram;
pub use queue::{CaptureQueue, CompletedFrame};
pub use regs::{IntStatus, Registers};
pub use registry::{DeviceRegistry, PciLocation};
pub use stats::QueueStatsSnapshot;
