// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Pixel formats, field modes and analog TV norms

use bitflags::bitflags;

use crate::error::{Error, Result};

pub const MIN_WIDTH: u32 = 48;
pub const MIN_HEIGHT: u32 = 32;

/// Colour format codes for DMAC bits 6:4, with byte/word swap in 3:2
mod color {
    pub const RGB32: u32 = 0x00;
    pub const RGB24: u32 = 0x10;
    pub const RGB16: u32 = 0x20;
    pub const RGB15: u32 = 0x30;
    pub const YUY2: u32 = 0x40;
    pub const BSWAP: u32 = 0x04;
    pub const WSWAP: u32 = 0x08;
}

pub const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

#[derive(Debug, PartialEq, Eq)]
pub struct PixelFormat {
    pub name: &'static str,
    pub fourcc: u32,
    /// Value for the DMAC colour format field
    pub tw_format: u32,
    /// Bits per pixel
    pub depth: u32,
}

pub static FORMATS: [PixelFormat; 9] = [
    PixelFormat { name: "32 bpp RGB, le", fourcc: fourcc(b"BGR4"), tw_format: color::RGB32, depth: 32 },
    PixelFormat {
        name: "32 bpp RGB, be",
        fourcc: fourcc(b"RGB4"),
        tw_format: color::RGB32 | color::BSWAP | color::WSWAP,
        depth: 32,
    },
    PixelFormat { name: "24 bpp RGB, le", fourcc: fourcc(b"BGR3"), tw_format: color::RGB24, depth: 24 },
    PixelFormat { name: "16 bpp RGB, le", fourcc: fourcc(b"RGBP"), tw_format: color::RGB16, depth: 16 },
    PixelFormat {
        name: "16 bpp RGB, be",
        fourcc: fourcc(b"RGBR"),
        tw_format: color::RGB16 | color::BSWAP,
        depth: 16,
    },
    PixelFormat { name: "15 bpp RGB, le", fourcc: fourcc(b"RGBO"), tw_format: color::RGB15, depth: 16 },
    PixelFormat {
        name: "15 bpp RGB, be",
        fourcc: fourcc(b"RGBQ"),
        tw_format: color::RGB15 | color::BSWAP,
        depth: 16,
    },
    PixelFormat { name: "4:2:2, packed, YUYV", fourcc: fourcc(b"YUYV"), tw_format: color::YUY2, depth: 16 },
    PixelFormat {
        name: "4:2:2, packed, UYVY",
        fourcc: fourcc(b"UYVY"),
        tw_format: color::YUY2 | color::BSWAP,
        depth: 16,
    },
];

pub fn format_by_fourcc(fourcc: u32) -> Option<&'static PixelFormat> {
    FORMATS.iter().find(|f| f.fourcc == fourcc)
}

/// Which fields a buffer receives and how they are arranged in it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldMode {
    /// Let the driver choose; resolved by [`try_format`]
    Any,
    Top,
    Bottom,
    /// Both fields, lines alternating
    Interlaced,
    /// Both fields, top field in the first half of the buffer
    SeqTopBottom,
    /// Both fields, bottom field in the first half of the buffer
    SeqBottomTop,
}

impl FieldMode {
    /// Whether a frame contains both fields
    pub fn has_both(&self) -> bool {
        matches!(self, FieldMode::Interlaced | FieldMode::SeqTopBottom | FieldMode::SeqBottomTop)
    }
}

bitflags! {
    /// Analog video standard set
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StdId: u64 {
        const PAL_B = 0x0000_0001;
        const PAL_B1 = 0x0000_0002;
        const PAL_G = 0x0000_0004;
        const PAL_H = 0x0000_0008;
        const PAL_I = 0x0000_0010;
        const PAL_D = 0x0000_0020;
        const PAL_D1 = 0x0000_0040;
        const PAL_K = 0x0000_0080;
        const PAL_M = 0x0000_0100;
        const PAL_N = 0x0000_0200;
        const PAL_NC = 0x0000_0400;
        const PAL_60 = 0x0000_0800;
        const NTSC_M = 0x0000_1000;
        const NTSC_M_JP = 0x0000_2000;
        const NTSC_443 = 0x0000_4000;
        const NTSC_M_KR = 0x0000_8000;
        const SECAM_B = 0x0001_0000;
        const SECAM_D = 0x0002_0000;
        const SECAM_G = 0x0004_0000;
        const SECAM_H = 0x0008_0000;
        const SECAM_K = 0x0010_0000;
        const SECAM_K1 = 0x0020_0000;
        const SECAM_L = 0x0040_0000;
        const SECAM_LC = 0x0080_0000;

        const NTSC = Self::NTSC_M.bits() | Self::NTSC_M_JP.bits() | Self::NTSC_M_KR.bits();
        const PAL = Self::PAL_B.bits()
            | Self::PAL_B1.bits()
            | Self::PAL_G.bits()
            | Self::PAL_H.bits()
            | Self::PAL_I.bits()
            | Self::PAL_D.bits()
            | Self::PAL_D1.bits()
            | Self::PAL_K.bits();
        const SECAM = Self::SECAM_B.bits()
            | Self::SECAM_D.bits()
            | Self::SECAM_G.bits()
            | Self::SECAM_H.bits()
            | Self::SECAM_K.bits()
            | Self::SECAM_K1.bits()
            | Self::SECAM_L.bits()
            | Self::SECAM_LC.bits();
    }
}

/// Decoder timing for one family of standards
#[derive(Debug, PartialEq, Eq)]
pub struct Norm {
    pub name: &'static str,
    pub std: StdId,
    /// SDT register standard code
    pub format: u8,
    /// Active width in pixels
    pub swidth: u32,
    /// Active height in lines, both fields
    pub sheight: u32,
    pub hdelay: u32,
    pub vdelay: u32,
}

impl Norm {
    pub fn is_secam(&self) -> bool {
        self.std.intersects(StdId::SECAM)
    }

    /// Whether a buffer of this size can be captured under this norm
    pub fn accepts(&self, width: u32, height: u32) -> bool {
        (MIN_WIDTH..=self.swidth).contains(&width) && (MIN_HEIGHT..=self.sheight).contains(&height)
    }
}

/// Searched in order; the first entry whose set intersects the request wins
pub static NORMS: [Norm; 8] = [
    Norm { name: "NTSC-JP", std: StdId::NTSC_M_JP, format: 0, swidth: 640, sheight: 480, hdelay: 135, vdelay: 0x16 },
    Norm { name: "NTSC", std: StdId::NTSC, format: 0, swidth: 768, sheight: 480, hdelay: 128, vdelay: 0x1a },
    Norm { name: "PAL-M", std: StdId::PAL_M, format: 4, swidth: 640, sheight: 480, hdelay: 135, vdelay: 0x1a },
    Norm { name: "PAL-N", std: StdId::PAL_N, format: 5, swidth: 720, sheight: 576, hdelay: 15, vdelay: 23 },
    Norm { name: "PAL-Nc", std: StdId::PAL_NC, format: 5, swidth: 640, sheight: 576, hdelay: 130, vdelay: 0x1a },
    Norm { name: "PAL-60", std: StdId::PAL_60, format: 6, swidth: 924, sheight: 480, hdelay: 186, vdelay: 0x1a },
    Norm { name: "PAL", std: StdId::PAL, format: 1, swidth: 720, sheight: 576, hdelay: 15, vdelay: 0x17 },
    Norm { name: "SECAM", std: StdId::SECAM, format: 2, swidth: 924, sheight: 576, hdelay: 186, vdelay: 0x20 },
];

pub fn norm_for(std: StdId) -> Option<&'static Norm> {
    NORMS.iter().find(|n| n.std.intersects(std))
}

pub fn norm_by_name(name: &str) -> Option<&'static Norm> {
    NORMS.iter().find(|n| n.name.eq_ignore_ascii_case(name))
}

/// Negotiated capture geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub format: &'static PixelFormat,
    pub field: FieldMode,
}

impl Geometry {
    pub fn bytes_per_line(&self) -> u32 {
        self.width * self.format.depth / 8
    }

    pub fn size_image(&self) -> usize {
        self.bytes_per_line() as usize * self.height as usize
    }

    /// Whether a program for `other` may be chained directly behind one
    /// for `self` without reprogramming the decoder
    pub fn chain_compatible(&self, other: &Geometry) -> bool {
        self.width == other.width && self.height == other.height && self.format.fourcc == other.format.fourcc
    }
}

/// A format request as seen at the device interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    pub field: FieldMode,
    pub bytes_per_line: u32,
    pub size_image: usize,
}

impl From<Geometry> for PixFormat {
    fn from(g: Geometry) -> Self {
        Self {
            width: g.width,
            height: g.height,
            pixel_format: g.format.fourcc,
            field: g.field,
            bytes_per_line: g.bytes_per_line(),
            size_image: g.size_image(),
        }
    }
}

/// Adjust a request to the nearest geometry the norm can capture
pub fn try_format(req: &PixFormat, norm: &Norm) -> Result<Geometry> {
    let format = format_by_fourcc(req.pixel_format).ok_or(Error::InvalidArgument)?;

    let field = match req.field {
        FieldMode::Any if req.height > norm.sheight / 2 => FieldMode::Interlaced,
        FieldMode::Any => FieldMode::Bottom,
        f => f,
    };
    let max_h = if field.has_both() { norm.sheight } else { norm.sheight / 2 };

    let height = req.height.clamp(MIN_HEIGHT, max_h);
    let width = req.width.clamp(MIN_WIDTH, norm.swidth) & !3;

    Ok(Geometry { width, height, format, field })
}
