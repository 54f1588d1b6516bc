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

//! Framebuffer encoding pipeline.
//!
//! A damage region is split into horizontal strips and prepared on a pool
//! of worker tasks; the session task then finishes each strip in slot
//! order and writes it to the wire. Preparation is the parallel half
//! (pixel translation, tiling, palette analysis); the deflate-family
//! encoders (Zlib, ZlibHex, ZRLE) keep one persistent compression stream
//! per session, so their compression step runs in the serial finish half
//! with an explicit sync-flush between rectangles.
//!
//! Every implemented encoder has a paired decoder used by the viewer and
//! the round-trip tests.

use bytes::BytesMut;

use crate::error::{LtsmError, Result};
use crate::framebuffer::{FrameView, Region};
use crate::protocol::{self, PixelFormat};

pub mod hextile;
pub mod qoi;
pub mod raw;
pub mod rre;
pub mod zlib;
pub mod zrle;

pub use zlib::ZlibStreams;

/// Per-update encoding parameters.
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    /// The client's negotiated pixel format; encoders emit pixels in it.
    pub client_format: PixelFormat,
    /// Deflate level 0-9 for the zlib-family encoders.
    pub compression: u8,
    /// Quality 0-100 for lossy encoders.
    pub quality: u8,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            client_format: PixelFormat::rgb888(),
            compression: 6,
            quality: 80,
        }
    }
}

/// Worker output for one strip: either the final rectangle payload, or
/// client-format pixels awaiting the serial compression step.
pub enum Prepared {
    /// Payload is complete; write as-is after the rectangle header.
    Final(BytesMut),
    /// Translated pixels for a deflate-family encoder.
    Translated {
        data: BytesMut,
        width: u16,
        height: u16,
    },
}

/// True when this build can actually produce the encoding. The LZ4, TJPG
/// and video ids are recognized in negotiation but not built in; selection
/// skips them and logs once.
pub fn is_available(encoding: i32) -> bool {
    matches!(
        encoding,
        protocol::ENCODING_RAW
            | protocol::ENCODING_RRE
            | protocol::ENCODING_CORRE
            | protocol::ENCODING_HEXTILE
            | protocol::ENCODING_ZLIB
            | protocol::ENCODING_ZLIBHEX
            | protocol::ENCODING_TRLE
            | protocol::ENCODING_ZRLE
            | protocol::ENCODING_LTSM_QOI
    )
}

/// Picks the encoding to use after a SetEncodings message.
///
/// Preference order:
/// 1. the operator's preferred list, in that list's order, when the client
///    offers the encoding and it is not blacklisted;
/// 2. the first client-offered, non-blacklisted, non-Raw frame encoding;
/// 3. Raw.
///
/// An empty client list leaves the previous choice unchanged. Matching
/// against the operator lists is by lower-case encoding name.
pub fn select_encoding(
    client_encodings: &[i32],
    preferred: &[String],
    blacklist: &[String],
    previous: i32,
    client_true_colour: bool,
) -> i32 {
    if client_encodings.is_empty() {
        return previous;
    }

    let blacklisted = |enc: i32| {
        let name = protocol::encoding_name(enc);
        blacklist.iter().any(|b| b.eq_ignore_ascii_case(name))
    };
    let usable = |enc: i32| {
        if !protocol::is_frame_encoding(enc) || blacklisted(enc) {
            return false;
        }
        // Video encoders require true colour; none are built in anyway.
        if protocol::is_video_encoding(enc) && !client_true_colour {
            return false;
        }
        if !is_available(enc) {
            log::warn!(
                "client offered {}, not built in, skipping",
                protocol::encoding_name(enc)
            );
            return false;
        }
        true
    };

    for wanted in preferred {
        if let Some(enc) = client_encodings.iter().copied().find(|&enc| {
            protocol::encoding_name(enc).eq_ignore_ascii_case(wanted) && usable(enc)
        }) {
            return enc;
        }
    }

    client_encodings
        .iter()
        .copied()
        .find(|&enc| enc != protocol::ENCODING_RAW && usable(enc))
        .unwrap_or(protocol::ENCODING_RAW)
}

/// Reads every pixel of a view converted to the client format, as raw
/// pixel values. Shared by the palette/subrect analysers.
pub(crate) fn client_pixels(view: &FrameView<'_>, client_format: &PixelFormat) -> Vec<u32> {
    let mut out = Vec::with_capacity(view.width() as usize * view.height() as usize);
    for y in 0..view.height() {
        for x in 0..view.width() {
            out.push(crate::translate::convert_pixel(
                view.pixel(x, y),
                view.format,
                client_format,
            ));
        }
    }
    out
}

/// Hard per-rectangle size limit an encoding imposes, if any. CoRRE packs
/// coordinates into u8, so its rectangles cannot exceed 255 a side.
fn max_rect(encoding: i32) -> Option<u16> {
    match encoding {
        protocol::ENCODING_CORRE => Some(255),
        _ => None,
    }
}

/// Splits a region into strips for the worker pool. Strip heights land on
/// multiples of 16 so the tile encoders never see a torn tile row; the
/// last strip takes the remainder. Encodings with a hard rectangle limit
/// (CoRRE) additionally split horizontally.
pub fn split_strips(region: Region, workers: usize, encoding: i32) -> Vec<Region> {
    if region.is_empty() {
        return Vec::new();
    }
    let limit = max_rect(encoding);
    let workers = workers.max(1) as u16;
    let base = (region.height / workers).max(16) as u32;
    let mut rows_per = (base.div_ceil(16) * 16).min(0xFFF0) as u16;
    if let Some(limit) = limit {
        rows_per = rows_per.min(limit / 16 * 16);
    }

    let mut strips = Vec::new();
    let mut y = 0u16;
    while y < region.height {
        let h = rows_per.min(region.height - y);
        match limit {
            Some(limit) => {
                let mut x = 0u16;
                while x < region.width {
                    let w = limit.min(region.width - x);
                    strips.push(Region::new(region.x + x, region.y + y, w, h));
                    x += w;
                }
            }
            None => strips.push(Region::new(region.x, region.y + y, region.width, h)),
        }
        y += h;
    }
    strips
}

/// Parallel half: produce the strip payload, or the translated pixels for
/// the serial compression step.
pub fn prepare_rect(encoding: i32, view: &FrameView<'_>, opts: &EncodeOptions) -> Result<Prepared> {
    match encoding {
        protocol::ENCODING_RAW => Ok(Prepared::Final(raw::encode(view, opts))),
        protocol::ENCODING_RRE => Ok(Prepared::Final(rre::encode_rre(view, opts))),
        protocol::ENCODING_CORRE => Ok(Prepared::Final(rre::encode_corre(view, opts))),
        protocol::ENCODING_HEXTILE => Ok(Prepared::Final(hextile::encode(view, opts))),
        protocol::ENCODING_TRLE => Ok(Prepared::Final(zrle::encode_trle(view, opts))),
        protocol::ENCODING_LTSM_QOI => Ok(Prepared::Final(qoi::encode(view, opts)?)),
        protocol::ENCODING_ZLIB | protocol::ENCODING_ZLIBHEX | protocol::ENCODING_ZRLE => {
            Ok(Prepared::Translated {
                data: crate::translate::translate_view(view, &opts.client_format),
                width: view.width(),
                height: view.height(),
            })
        }
        _ => Err(LtsmError::Unsupported(protocol::encoding_name(encoding))),
    }
}

/// Serial half: run the persistent compression stream for the deflate
/// family; pass completed payloads through.
pub fn finish_rect(
    encoding: i32,
    prepared: Prepared,
    streams: &mut ZlibStreams,
    opts: &EncodeOptions,
) -> Result<BytesMut> {
    match prepared {
        Prepared::Final(payload) => Ok(payload),
        Prepared::Translated {
            data,
            width,
            height,
        } => match encoding {
            protocol::ENCODING_ZLIB => zlib::encode_zlib(&data, streams, opts.compression),
            protocol::ENCODING_ZLIBHEX => {
                zlib::encode_zlibhex(&data, width, height, streams, opts)
            }
            protocol::ENCODING_ZRLE => {
                zrle::encode_zrle(&data, width, height, streams, opts)
            }
            _ => Err(LtsmError::Unsupported(protocol::encoding_name(encoding))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::*;

    #[test]
    fn selection_prefers_operator_list() {
        let offered = vec![ENCODING_HEXTILE, ENCODING_ZRLE, ENCODING_RAW];
        let preferred = vec!["zrle".to_string()];
        let got = select_encoding(&offered, &preferred, &[], ENCODING_RAW, true);
        assert_eq!(got, ENCODING_ZRLE);
    }

    #[test]
    fn selection_skips_blacklisted() {
        let offered = vec![ENCODING_ZRLE, ENCODING_HEXTILE];
        let blacklist = vec!["zrle".to_string()];
        let got = select_encoding(&offered, &[], &blacklist, ENCODING_RAW, true);
        assert_eq!(got, ENCODING_HEXTILE);
    }

    #[test]
    fn selection_empty_list_keeps_previous() {
        let got = select_encoding(&[], &[], &[], ENCODING_HEXTILE, true);
        assert_eq!(got, ENCODING_HEXTILE);
    }

    #[test]
    fn selection_falls_back_to_raw() {
        // Only pseudo-encodings and unavailable encoders offered.
        let offered = vec![ENCODING_EXT_DESKTOP_SIZE, ENCODING_LTSM_LZ4];
        let got = select_encoding(&offered, &[], &[], ENCODING_RAW, true);
        assert_eq!(got, ENCODING_RAW);
    }

    #[test]
    fn strips_cover_region_in_tile_rows() {
        let region = Region::new(0, 0, 640, 100);
        let strips = split_strips(region, 2, ENCODING_ZRLE);
        assert!(!strips.is_empty());
        let mut total = 0;
        for (i, s) in strips.iter().enumerate() {
            assert_eq!(s.width, 640);
            if i + 1 != strips.len() {
                assert_eq!(s.height % 16, 0);
            }
            total += s.height;
        }
        assert_eq!(total, 100);
    }

    #[test]
    fn corre_strips_respect_coordinate_limit() {
        let region = Region::new(0, 0, 640, 300);
        for strip in split_strips(region, 2, ENCODING_CORRE) {
            assert!(strip.width <= 255);
            assert!(strip.height <= 255);
        }
    }
}
