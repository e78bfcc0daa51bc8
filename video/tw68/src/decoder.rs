// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Analog video decoder programming
//!
//! Standard selection, cropping and scaling, input mux, picture controls
//! and the power-on register defaults.

use std::thread;
use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};
use crate::format::{FieldMode, Norm};
use crate::regs::{self, DmaCtrl, Registers};

/// Number of selectable video inputs
pub const MAX_INPUTS: u32 = 4;

/// Decoder registers written after reset, in order
const POWER_ON_DEFAULTS: [(usize, u8); 42] = [
    (regs::INFORM, 0x40),
    (regs::HSYNC, 0x00),
    (regs::ACNTL, 0x42),
    (regs::CNTRL1, 0xcc),
    (regs::CROP_HI, 0x02),
    (regs::VDELAY_LO, 0x18),
    (regs::VACTIVE_LO, 0xf0),
    (regs::HDELAY_LO, 0x0f),
    (regs::HACTIVE_LO, 0xd0),
    (regs::VSCALE_LO, 0x00),
    (regs::SCALE_HI, 0x11),
    (regs::HSCALE_LO, 0x00),
    (regs::BRIGHT, 0x00),
    (regs::CONTRAST, 0x5c),
    (regs::SHARPNESS, 0x98),
    (regs::SAT_U, 0x80),
    (regs::SAT_V, 0x80),
    (regs::HUE, 0x00),
    (regs::SHARP2, 0xc6),
    (regs::CORING, 0x44),
    (regs::CC_STATUS, 0x0a),
    (regs::SDT, 0x07),
    (regs::SDTR, 0x7f),
    (regs::RESERV2, 0x07),
    (regs::RESERV3, 0x7f),
    (regs::CLMPG, 0x50),
    (regs::IAGC, 0x42),
    (regs::AGCGAIN, 0xf0),
    (regs::PEAKWT, 0xd8),
    (regs::CLMPL, 0xbc),
    (regs::SYNCT, 0xb8),
    (regs::MISSCNT, 0x44),
    (regs::PCLAMP, 0x2a),
    (regs::VERTCTL, 0x00),
    (regs::VERTCTL2, 0x00),
    (regs::COLORKILL, 0x78),
    (regs::MISC1, 0x14),
    (regs::MISC2, 0xe0),
    (regs::MACROVISION, 0x00),
    (regs::CLMPCTL2, 0x00),
    (regs::FILLDATA, 0xa0),
    (regs::SLICELEVEL, 0x00),
];

/// Stop DMA and mask every interrupt
pub fn shutdown(regs: &dyn Registers) {
    regs.clear32(regs::DMAC, DmaCtrl::all().bits());
    regs.write32(regs::INTMASK, 0);
}

/// Full chip reset followed by the power-on defaults
pub fn reset(regs: &dyn Registers, settle: Duration) {
    shutdown(regs);
    regs.write32(regs::INTSTAT, u32::MAX);
    regs.write8(regs::ACNTL, 0x80);
    if !settle.is_zero() {
        thread::sleep(settle);
    }

    for (offset, value) in POWER_ON_DEFAULTS {
        regs.write8(offset, value);
    }
    regs.write32(regs::VBIC, 0x03);
    regs.write32(regs::DMAC, 0x2000);
    regs.write32(regs::TESTREG, 0);
}

/// Select the decoder standard
pub fn set_norm(regs: &dyn Registers, norm: &Norm) {
    debug!("tw68: norm {} (format {})", norm.name, norm.format);
    regs.andor8(regs::SDT, 0x07, norm.format);
    regs.andor8(regs::RESERV2, 0x07, norm.format);
}

/// Route one of the composite inputs to the decoder
pub fn select_input(regs: &dyn Registers, input: u32) -> Result<()> {
    if input >= MAX_INPUTS {
        return Err(Error::InvalidArgument);
    }
    regs.andor8(regs::INFORM, 0x03 << 2, (input as u8) << 2);
    Ok(())
}

/// Crop and scale values derived from a norm and a target size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scaling {
    pub hactive: u32,
    pub hdelay: u32,
    pub hscale: u32,
    pub vactive: u32,
    pub vdelay: u32,
    pub vscale: u32,
}

impl Scaling {
    /// Scale factors are 8.8 fixed point ratios of source to target.
    /// Single-field captures scale against a full frame of twice the height.
    pub fn compute(norm: &Norm, width: u32, height: u32, field: FieldMode) -> Self {
        let height = if field.has_both() { height } else { height * 2 };
        Self {
            hactive: norm.swidth,
            hdelay: norm.hdelay,
            hscale: norm.swidth * 256 / width,
            vactive: norm.sheight,
            vdelay: norm.vdelay,
            vscale: norm.sheight * 256 / height,
        }
    }

    /// High bits of the four crop values packed into CROP_HI
    pub fn crop_hi(&self) -> u8 {
        (((self.vdelay & 0x300) >> 2)
            | ((self.vactive & 0x300) >> 4)
            | ((self.hdelay & 0x300) >> 6)
            | ((self.hactive & 0x300) >> 8)) as u8
    }

    pub fn scale_hi(&self) -> u8 {
        (((self.vscale & 0xf00) >> 4) | ((self.hscale & 0xf00) >> 8)) as u8
    }
}

pub fn set_scale(regs: &dyn Registers, norm: &Norm, width: u32, height: u32, field: FieldMode) -> Scaling {
    let s = Scaling::compute(norm, width, height, field);
    debug!(
        "tw68: scale {}x{} {:?}: hscale={:#x} vscale={:#x}",
        width, height, field, s.hscale, s.vscale
    );

    regs.write8(regs::CROP_HI, s.crop_hi());
    regs.write8(regs::VDELAY_LO, s.vdelay as u8);
    regs.write8(regs::VACTIVE_LO, s.vactive as u8);
    regs.write8(regs::HDELAY_LO, s.hdelay as u8);
    regs.write8(regs::HACTIVE_LO, s.hactive as u8);
    regs.write8(regs::SCALE_HI, s.scale_hi());
    regs.write8(regs::VSCALE_LO, s.vscale as u8);
    regs.write8(regs::HSCALE_LO, s.hscale as u8);
    s
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlId {
    Brightness,
    Contrast,
    Hue,
    Saturation,
    ChromaAgc,
    ColorKiller,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Integer,
    Boolean,
}

#[derive(Debug)]
pub struct Control {
    pub id: ControlId,
    pub name: &'static str,
    pub kind: ControlKind,
    pub minimum: i32,
    pub maximum: i32,
    pub step: i32,
    pub default: i32,
    reg: usize,
    mask: u32,
    shift: u32,
    offset: i32,
}

impl Control {
    fn raw(&self, value: i32) -> u32 {
        (((value - self.offset) as u32) << self.shift) & self.mask
    }
}

pub const NUM_CONTROLS: usize = 6;

pub static CONTROLS: [Control; NUM_CONTROLS] = [
    Control {
        id: ControlId::Brightness,
        name: "Brightness",
        kind: ControlKind::Integer,
        minimum: -128,
        maximum: 127,
        step: 2,
        default: 0,
        reg: regs::BRIGHT,
        mask: !0,
        shift: 0,
        offset: 0,
    },
    Control {
        id: ControlId::Contrast,
        name: "Contrast",
        kind: ControlKind::Integer,
        minimum: 0,
        maximum: 0xff,
        step: 2,
        default: 84,
        reg: regs::CONTRAST,
        mask: 0xff,
        shift: 0,
        offset: 0,
    },
    Control {
        id: ControlId::Hue,
        name: "Hue",
        kind: ControlKind::Integer,
        minimum: -90,
        maximum: 90,
        step: 1,
        default: 0,
        reg: regs::HUE,
        mask: 0xff,
        shift: 0,
        offset: 128,
    },
    Control {
        id: ControlId::Saturation,
        name: "Saturation",
        kind: ControlKind::Integer,
        minimum: 0,
        maximum: 0xff,
        step: 1,
        default: 0x7f,
        reg: regs::SAT_U,
        mask: 0xff,
        shift: 0,
        offset: 0,
    },
    Control {
        id: ControlId::ChromaAgc,
        name: "Chroma AGC",
        kind: ControlKind::Boolean,
        minimum: 0,
        maximum: 1,
        step: 1,
        default: 1,
        reg: regs::ACNTL,
        mask: 0x10,
        shift: 4,
        offset: 0,
    },
    Control {
        id: ControlId::ColorKiller,
        name: "Color killer",
        kind: ControlKind::Boolean,
        minimum: 0,
        maximum: 1,
        step: 1,
        default: 1,
        reg: regs::COLORKILL,
        mask: 0xe0,
        shift: 0,
        offset: 0,
    },
];

pub fn control(id: ControlId) -> &'static Control {
    match id {
        ControlId::Brightness => &CONTROLS[0],
        ControlId::Contrast => &CONTROLS[1],
        ControlId::Hue => &CONTROLS[2],
        ControlId::Saturation => &CONTROLS[3],
        ControlId::ChromaAgc => &CONTROLS[4],
        ControlId::ColorKiller => &CONTROLS[5],
    }
}

/// A control as currently applicable
#[derive(Debug, Clone, Copy)]
pub struct ControlQuery {
    pub control: &'static Control,
    /// Present but without effect under the current norm
    pub inactive: bool,
}

pub fn query_control(id: ControlId, norm: &Norm) -> ControlQuery {
    ControlQuery { control: control(id), inactive: id == ControlId::ChromaAgc && norm.is_secam() }
}

/// Program a picture control, clamping `value` to its range
///
/// Returns the value actually applied.
pub fn set_control(regs: &dyn Registers, norm: &Norm, id: ControlId, value: i32) -> Result<i32> {
    let c = control(id);
    let value = value.clamp(c.minimum, c.maximum);

    match id {
        ControlId::Saturation => {
            let u = c.raw(value);
            // V tracks U at the ratio of their reset defaults, except SECAM
            let v = if norm.is_secam() { u } else { u * 0x5a / 0x7f };
            regs.write8(regs::SAT_V, v as u8);
            regs.write8(regs::SAT_U, u as u8);
        }
        ControlId::ChromaAgc => {
            let raw = c.raw(value);
            if norm.is_secam() && raw != 0 {
                return Err(Error::InvalidArgument);
            }
            regs.andor8(c.reg, c.mask as u8, raw as u8);
        }
        ControlId::ColorKiller => {
            regs.andor8(c.reg, c.mask as u8, if value != 0 { 0xe0 } else { 0 });
        }
        _ => regs.write8(c.reg, c.raw(value) as u8),
    }
    debug!("tw68: control {} = {}", c.name, value);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{norm_for, StdId};
    use crate::regs::MemRegs;

    #[test]
    fn test_pal_full_frame_scaling() {
        let regs = MemRegs::new();
        let pal = norm_for(StdId::PAL_I).unwrap();
        let s = set_scale(&regs, pal, 720, 576, FieldMode::Interlaced);
        assert_eq!((s.hscale, s.vscale), (256, 256));
        assert_eq!(regs.read8(regs::SCALE_HI), 0x11);
        assert_eq!(regs.read8(regs::HACTIVE_LO), 0xd0);
        // vactive 576 = 0x240, hactive 720 = 0x2d0
        assert_eq!(regs.read8(regs::CROP_HI), 0x22);
    }

    #[test]
    fn test_single_field_scales_against_frame() {
        let pal = norm_for(StdId::PAL_I).unwrap();
        let s = Scaling::compute(pal, 360, 288, FieldMode::Top);
        assert_eq!((s.hscale, s.vscale), (512, 256));
        assert_eq!(s.scale_hi(), 0x12);
    }

    #[test]
    fn test_select_input() {
        let regs = MemRegs::new();
        regs.write8(regs::INFORM, 0x40);
        select_input(&regs, 3).unwrap();
        assert_eq!(regs.read8(regs::INFORM), 0x4c);
        assert_eq!(select_input(&regs, 4), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_reset_writes_defaults_and_masks() {
        let regs = MemRegs::new();
        regs.write32(regs::INTMASK, 0xffff);
        regs.raise(crate::regs::IntStatus::DMAPI);
        reset(&regs, Duration::ZERO);
        assert_eq!(regs.read32(regs::INTMASK), 0);
        assert_eq!(regs.read32(regs::INTSTAT), 0);
        assert_eq!(regs.read32(regs::DMAC), 0x2000);
        assert_eq!(regs.read8(regs::CONTRAST), 0x5c);
        assert_eq!(regs.read8(regs::ACNTL), 0x42);
    }

    #[test]
    fn test_norm_programs_standard_code() {
        let regs = MemRegs::new();
        regs.write8(regs::SDT, 0x07);
        set_norm(&regs, norm_for(StdId::PAL_M).unwrap());
        assert_eq!(regs.read8(regs::SDT), 0x04);
        assert_eq!(regs.read8(regs::RESERV2), 0x04);
    }

    #[test]
    fn test_saturation_tracks_v() {
        let regs = MemRegs::new();
        let pal = norm_for(StdId::PAL_B).unwrap();
        assert_eq!(set_control(&regs, pal, ControlId::Saturation, 0x7f), Ok(0x7f));
        assert_eq!(regs.read8(regs::SAT_U), 0x7f);
        assert_eq!(regs.read8(regs::SAT_V), 0x5a);

        let secam = norm_for(StdId::SECAM_L).unwrap();
        set_control(&regs, secam, ControlId::Saturation, 0x40).unwrap();
        assert_eq!(regs.read8(regs::SAT_V), 0x40);
    }

    #[test]
    fn test_control_clamps_and_offsets() {
        let regs = MemRegs::new();
        let pal = norm_for(StdId::PAL_B).unwrap();
        assert_eq!(set_control(&regs, pal, ControlId::Hue, 200), Ok(90));
        assert_eq!(regs.read8(regs::HUE), (90 - 128) as u8);
        set_control(&regs, pal, ControlId::Brightness, -20).unwrap();
        assert_eq!(regs.read8(regs::BRIGHT), (-20i32) as u8);
    }

    #[test]
    fn test_query_marks_agc_inactive_for_secam() {
        let secam = norm_for(StdId::SECAM_K).unwrap();
        assert!(query_control(ControlId::ChromaAgc, secam).inactive);
        assert!(!query_control(ControlId::Contrast, secam).inactive);
        let q = query_control(ControlId::ChromaAgc, norm_for(StdId::NTSC_M).unwrap());
        assert!(!q.inactive);
        assert_eq!(q.control.kind, ControlKind::Boolean);
    }

    #[test]
    fn test_chroma_agc_refused_under_secam() {
        let regs = MemRegs::new();
        let secam = norm_for(StdId::SECAM_B).unwrap();
        assert_eq!(set_control(&regs, secam, ControlId::ChromaAgc, 1), Err(Error::InvalidArgument));
        assert_eq!(set_control(&regs, secam, ControlId::ChromaAgc, 0), Ok(0));

        let pal = norm_for(StdId::PAL_B).unwrap();
        set_control(&regs, pal, ControlId::ChromaAgc, 1).unwrap();
        assert_eq!(regs.read8(regs::ACNTL) & 0x10, 0x10);
    }
}
