// Copyright 2025 the ltsm-remote authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! RFB protocol constants and wire structures.
//!
//! The fundamental building blocks of the wire engine: protocol versions,
//! message type bytes, security and VeNCrypt sub-type codes, encoding ids
//! (standard plus the LTSM proprietary range), pixel format and screen
//! geometry structures. All RFB integers are big-endian on the wire.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{LtsmError, Result};

/// The RFB protocol banner advertised by the server. Exactly 12 bytes
/// including the newline.
pub const PROTOCOL_VERSION: &str = "RFB 003.008\n";

/// RFB protocol versions the engine recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfbVersion {
    /// 3.3: no security list, the server dictates a single u32 type.
    V33,
    /// 3.7: security list, but no SecurityResult after `None`.
    V37,
    /// 3.8: the baseline for this engine.
    V38,
}

impl RfbVersion {
    /// Parses a 12-byte version banner. Unknown minor versions downgrade
    /// to 3.3 semantics; a non-RFB banner is a protocol error.
    pub fn from_banner(banner: &[u8]) -> Result<Self> {
        if banner.len() != 12 || &banner[..4] != b"RFB " || banner[11] != b'\n' {
            return Err(LtsmError::Protocol("bad version banner".into()));
        }
        match &banner[4..11] {
            b"003.008" => Ok(RfbVersion::V38),
            b"003.007" => Ok(RfbVersion::V37),
            _ => Ok(RfbVersion::V33),
        }
    }
}

// Client-to-server message types.

pub const CLIENT_SET_PIXEL_FORMAT: u8 = 0;
pub const CLIENT_SET_ENCODINGS: u8 = 2;
pub const CLIENT_FB_UPDATE_REQUEST: u8 = 3;
pub const CLIENT_KEY_EVENT: u8 = 4;
pub const CLIENT_POINTER_EVENT: u8 = 5;
pub const CLIENT_CUT_TEXT: u8 = 6;
pub const CLIENT_ENABLE_CONTINUOUS_UPDATES: u8 = 150;
pub const CLIENT_SET_DESKTOP_SIZE: u8 = 251;

// Server-to-client message types.

pub const SERVER_FB_UPDATE: u8 = 0;
pub const SERVER_SET_COLOUR_MAP: u8 = 1;
pub const SERVER_BELL: u8 = 2;
pub const SERVER_CUT_TEXT: u8 = 3;
pub const SERVER_END_CONTINUOUS_UPDATES: u8 = 150;

// LTSM extension message types. Both directions use the same framing:
// `{u8 type, u8 channelId (0 = system), u32 len BE, payload}`.

/// JSON control plane: channel open/close/error, client variables.
pub const LTSM_SYSTEM: u8 = 0xF0;
/// Opaque blob addressed to one channel.
pub const LTSM_CHANNEL_DATA: u8 = 0xF1;
/// Channel open request.
pub const LTSM_CHANNEL_CONNECT: u8 = 0xF2;
/// Channel open acknowledgement.
pub const LTSM_CHANNEL_ACK: u8 = 0xF3;
/// Channel close with reason.
pub const LTSM_CHANNEL_CLOSE: u8 = 0xF4;

/// First byte of the engine-reserved LTSM message range.
pub const LTSM_RANGE_FIRST: u8 = 0xF0;
/// Last byte of the engine-reserved LTSM message range.
pub const LTSM_RANGE_LAST: u8 = 0xFE;

// Security types.

pub const SECURITY_TYPE_NONE: u8 = 1;
pub const SECURITY_TYPE_VNC: u8 = 2;
pub const SECURITY_TYPE_VENCRYPT: u8 = 19;

pub const SECURITY_RESULT_OK: u32 = 0;
pub const SECURITY_RESULT_ERR: u32 = 1;

// VeNCrypt sub-types. Version 0.1 uses one-byte codes, 0.2 uses u32 BE.

pub const VENCRYPT01_TLSNONE: u8 = 19;
pub const VENCRYPT01_TLSVNC: u8 = 20;
pub const VENCRYPT01_X509NONE: u8 = 22;
pub const VENCRYPT01_X509VNC: u8 = 23;

pub const VENCRYPT02_TLSNONE: u32 = 257;
pub const VENCRYPT02_TLSVNC: u32 = 258;
pub const VENCRYPT02_X509NONE: u32 = 260;
pub const VENCRYPT02_X509VNC: u32 = 261;

// Standard encoding types.

pub const ENCODING_RAW: i32 = 0;
pub const ENCODING_COPYRECT: i32 = 1;
pub const ENCODING_RRE: i32 = 2;
pub const ENCODING_CORRE: i32 = 4;
pub const ENCODING_HEXTILE: i32 = 5;
pub const ENCODING_ZLIB: i32 = 6;
pub const ENCODING_TIGHT: i32 = 7;
pub const ENCODING_ZLIBHEX: i32 = 8;
pub const ENCODING_TRLE: i32 = 15;
pub const ENCODING_ZRLE: i32 = 16;

// Pseudo-encodings.

pub const ENCODING_CURSOR: i32 = -239;
pub const ENCODING_DESKTOP_SIZE: i32 = -223;
pub const ENCODING_LAST_RECT: i32 = -224;
pub const ENCODING_EXT_DESKTOP_SIZE: i32 = -308;
pub const ENCODING_CONTINUOUS_UPDATES: i32 = -313;
#[allow(clippy::unreadable_literal)]
pub const ENCODING_EXT_CLIPBOARD: i32 = 0xC0A1E5CEu32 as i32;

// LTSM proprietary encodings. The high bytes spell "LTM" to keep the
// range clear of registered encodings.

/// Pseudo-encoding a client advertises to enable the LTSM channel
/// extension ("LTSM" as a fourcc).
pub const ENCODING_LTSM: i32 = 0x4C54_534D;
pub const ENCODING_LTSM_QOI: i32 = 0x4C544D01;
pub const ENCODING_LTSM_LZ4: i32 = 0x4C544D02;
pub const ENCODING_LTSM_TJPG: i32 = 0x4C544D03;
pub const ENCODING_LTSM_CURSOR: i32 = 0x4C544D10;

// Video encodings, emitted only by video-tagged encoders: a keyframe on
// first use and on resize, dirty regions otherwise.

pub const ENCODING_FFMPEG_H264: i32 = 0x48323634;
pub const ENCODING_FFMPEG_AV1: i32 = 0x41563120;
pub const ENCODING_FFMPEG_VP8: i32 = 0x56503820;

/// Human-readable encoding name for logs and the operator pref/blacklist
/// matching, which is case-insensitive on these names.
pub fn encoding_name(encoding: i32) -> &'static str {
    match encoding {
        ENCODING_RAW => "raw",
        ENCODING_COPYRECT => "copyrect",
        ENCODING_RRE => "rre",
        ENCODING_CORRE => "corre",
        ENCODING_HEXTILE => "hextile",
        ENCODING_ZLIB => "zlib",
        ENCODING_TIGHT => "tight",
        ENCODING_ZLIBHEX => "zlibhex",
        ENCODING_TRLE => "trle",
        ENCODING_ZRLE => "zrle",
        ENCODING_LTSM_QOI => "ltsm_qoi",
        ENCODING_LTSM_LZ4 => "ltsm_lz4",
        ENCODING_LTSM_TJPG => "ltsm_tjpg",
        ENCODING_FFMPEG_H264 => "ffmpeg_h264",
        ENCODING_FFMPEG_AV1 => "ffmpeg_av1",
        ENCODING_FFMPEG_VP8 => "ffmpeg_vp8",
        ENCODING_CURSOR => "cursor",
        ENCODING_DESKTOP_SIZE => "desktopsize",
        ENCODING_LAST_RECT => "lastrect",
        ENCODING_EXT_DESKTOP_SIZE => "extendeddesktopsize",
        ENCODING_CONTINUOUS_UPDATES => "continuousupdates",
        ENCODING_EXT_CLIPBOARD => "extclipboard",
        ENCODING_LTSM => "ltsm",
        ENCODING_LTSM_CURSOR => "ltsm_cursor",
        _ => "unknown",
    }
}

/// True for encodings that carry pixel payloads (candidates for the
/// preferred-encoding selection); pseudo-encodings toggle features instead.
pub fn is_frame_encoding(encoding: i32) -> bool {
    matches!(
        encoding,
        ENCODING_RAW
            | ENCODING_RRE
            | ENCODING_CORRE
            | ENCODING_HEXTILE
            | ENCODING_ZLIB
            | ENCODING_ZLIBHEX
            | ENCODING_TRLE
            | ENCODING_ZRLE
            | ENCODING_LTSM_QOI
            | ENCODING_LTSM_LZ4
            | ENCODING_LTSM_TJPG
            | ENCODING_FFMPEG_H264
            | ENCODING_FFMPEG_AV1
            | ENCODING_FFMPEG_VP8
    )
}

/// True for the video family, which requires true-colour clients and a
/// keyframe discipline.
pub fn is_video_encoding(encoding: i32) -> bool {
    matches!(
        encoding,
        ENCODING_FFMPEG_H264 | ENCODING_FFMPEG_AV1 | ENCODING_FFMPEG_VP8
    )
}

// Extended clipboard capability flags (u32, negotiated via the
// ExtClipboard pseudo-encoding; three-step Provide/Notify/Request flow).

pub const CLIPBOARD_TYPE_TEXT: u32 = 1 << 0;
pub const CLIPBOARD_TYPE_RTF: u32 = 1 << 1;
pub const CLIPBOARD_TYPE_HTML: u32 = 1 << 2;
pub const CLIPBOARD_OP_CAPS: u32 = 1 << 31;
pub const CLIPBOARD_OP_REQUEST: u32 = 1 << 25;
pub const CLIPBOARD_OP_PEEK: u32 = 1 << 26;
pub const CLIPBOARD_OP_NOTIFY: u32 = 1 << 27;
pub const CLIPBOARD_OP_PROVIDE: u32 = 1 << 28;

/// Pixel layout of framebuffer data, as carried in the 16-byte RFB wire
/// structure.
///
/// Invariants for true-colour formats: each `(max + 1)` is a power of two
/// and `shift + log2(max + 1)` never exceeds `bits_per_pixel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    /// Bits per pixel on the wire: 8, 16 or 32.
    pub bits_per_pixel: u8,
    /// Useful colour depth in bits.
    pub depth: u8,
    /// Non-zero when multi-byte pixels are big-endian.
    pub big_endian: u8,
    /// Non-zero for true colour; zero means colour-mapped.
    pub true_colour: u8,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl PixelFormat {
    /// 32bpp true colour, red in the low byte. The server-side default
    /// when the display adapter does not dictate another layout.
    #[must_use]
    pub fn rgb888() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian: 0,
            true_colour: 1,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 0,
            green_shift: 8,
            blue_shift: 16,
        }
    }

    /// 16bpp RGB565.
    #[must_use]
    pub fn rgb565() -> Self {
        Self {
            bits_per_pixel: 16,
            depth: 16,
            big_endian: 0,
            true_colour: 1,
            red_max: 31,
            green_max: 63,
            blue_max: 31,
            red_shift: 11,
            green_shift: 5,
            blue_shift: 0,
        }
    }

    /// 8bpp BGR233.
    #[must_use]
    pub fn bgr233() -> Self {
        Self {
            bits_per_pixel: 8,
            depth: 8,
            big_endian: 0,
            true_colour: 1,
            red_max: 7,
            green_max: 7,
            blue_max: 3,
            red_shift: 0,
            green_shift: 3,
            blue_shift: 6,
        }
    }

    /// Whole bytes per pixel.
    #[must_use]
    pub fn bytes_per_pixel(&self) -> usize {
        (self.bits_per_pixel as usize) / 8
    }

    /// Validates the structural invariants: supported bpp, sane depth,
    /// power-of-two component ranges that fit inside the pixel.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if !matches!(self.bits_per_pixel, 8 | 16 | 32) {
            return false;
        }
        if self.depth == 0 || self.depth > 32 {
            return false;
        }
        if self.true_colour == 0 {
            // Colour-mapped only makes sense at 8bpp.
            return self.bits_per_pixel == 8;
        }
        for (max, shift) in [
            (self.red_max, self.red_shift),
            (self.green_max, self.green_shift),
            (self.blue_max, self.blue_shift),
        ] {
            if max == 0 || !(max as u32 + 1).is_power_of_two() {
                return false;
            }
            let bits = 16 - max.leading_zeros() as u8;
            if shift + bits > self.bits_per_pixel {
                return false;
            }
        }
        true
    }

    /// Serializes into the 16-byte RFB wire layout (3 trailing padding
    /// bytes).
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.bits_per_pixel);
        buf.put_u8(self.depth);
        buf.put_u8(self.big_endian);
        buf.put_u8(self.true_colour);
        buf.put_u16(self.red_max);
        buf.put_u16(self.green_max);
        buf.put_u16(self.blue_max);
        buf.put_u8(self.red_shift);
        buf.put_u8(self.green_shift);
        buf.put_u8(self.blue_shift);
        buf.put_bytes(0, 3);
    }

    /// Deserializes from the 16-byte RFB wire layout.
    pub fn from_bytes(buf: &mut BytesMut) -> Result<Self> {
        if buf.len() < 16 {
            return Err(LtsmError::Underflow);
        }
        let pf = Self {
            bits_per_pixel: buf.get_u8(),
            depth: buf.get_u8(),
            big_endian: buf.get_u8(),
            true_colour: buf.get_u8(),
            red_max: buf.get_u16(),
            green_max: buf.get_u16(),
            blue_max: buf.get_u16(),
            red_shift: buf.get_u8(),
            green_shift: buf.get_u8(),
            blue_shift: buf.get_u8(),
        };
        buf.advance(3);
        Ok(pf)
    }
}

/// One screen of an ExtendedDesktopSize layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Screen {
    pub id: u32,
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub flags: u32,
}

impl Screen {
    /// Serializes the 16-byte screen entry.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.id);
        buf.put_u16(self.x);
        buf.put_u16(self.y);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_u32(self.flags);
    }
}

/// Rectangle header inside a FramebufferUpdate message.
#[derive(Debug, Clone, Copy)]
pub struct Rectangle {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub encoding: i32,
}

impl Rectangle {
    /// Writes the 12-byte rectangle header.
    pub fn write_header(&self, buf: &mut BytesMut) {
        buf.put_u16(self.x);
        buf.put_u16(self.y);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_i32(self.encoding);
    }
}

/// The ServerInit message sent after security negotiation: framebuffer
/// geometry, server pixel format and desktop name.
#[derive(Debug, Clone)]
pub struct ServerInit {
    pub width: u16,
    pub height: u16,
    pub pixel_format: PixelFormat,
    pub name: String,
}

impl ServerInit {
    /// Serializes width, height, the 16-byte pixel format, then the
    /// u32-length-prefixed desktop name.
    #[allow(clippy::cast_possible_truncation)] // name length bounded by protocol
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        self.pixel_format.write_to(buf);
        let name = self.name.as_bytes();
        buf.put_u32(name.len() as u32);
        buf.put_slice(name);
    }
}

/// Desktop-resize transaction state, driven from both ends: the client by
/// SetDesktopSize, the server by a local resolution change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesktopResizeMode {
    Undefined,
    Disabled,
    ServerInform,
    ClientRequest,
    Success,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_banner_parsing() {
        assert_eq!(
            RfbVersion::from_banner(b"RFB 003.008\n").unwrap(),
            RfbVersion::V38
        );
        assert_eq!(
            RfbVersion::from_banner(b"RFB 003.007\n").unwrap(),
            RfbVersion::V37
        );
        // Unknown minor downgrades to 3.3 semantics.
        assert_eq!(
            RfbVersion::from_banner(b"RFB 003.005\n").unwrap(),
            RfbVersion::V33
        );
        assert!(RfbVersion::from_banner(b"HTTP/1.1 200").is_err());
    }

    #[test]
    fn pixel_format_wire_round_trip() {
        let pf = PixelFormat::rgb565();
        let mut buf = BytesMut::new();
        pf.write_to(&mut buf);
        assert_eq!(buf.len(), 16);
        let back = PixelFormat::from_bytes(&mut buf).unwrap();
        assert_eq!(pf, back);
    }

    #[test]
    fn pixel_format_invariants() {
        assert!(PixelFormat::rgb888().is_valid());
        assert!(PixelFormat::rgb565().is_valid());
        assert!(PixelFormat::bgr233().is_valid());

        let mut bad = PixelFormat::rgb888();
        bad.red_max = 254; // not 2^n - 1
        assert!(!bad.is_valid());

        let mut overflow = PixelFormat::rgb565();
        overflow.red_shift = 12; // 12 + 5 > 16
        assert!(!overflow.is_valid());
    }

    #[test]
    fn frame_encoding_classification() {
        assert!(is_frame_encoding(ENCODING_ZRLE));
        assert!(is_frame_encoding(ENCODING_LTSM_QOI));
        assert!(!is_frame_encoding(ENCODING_EXT_DESKTOP_SIZE));
        assert!(is_video_encoding(ENCODING_FFMPEG_H264));
        assert!(!is_video_encoding(ENCODING_ZRLE));
    }
}
