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

//! Hextile encoding: 16x16 tiles, each raw, solid, monochrome-subrect or
//! coloured-subrect. Background and foreground colours are inherited from
//! the previous tile when the corresponding bit is clear.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use super::{client_pixels, EncodeOptions};
use crate::error::{LtsmError, Result};
use crate::framebuffer::{FrameView, Region};
use crate::protocol::PixelFormat;
use crate::stream::FramedStream;
use crate::translate;

// Tile subencoding mask bits.
pub const HEXTILE_RAW: u8 = 1 << 0;
pub const HEXTILE_BACKGROUND: u8 = 1 << 1;
pub const HEXTILE_FOREGROUND: u8 = 1 << 2;
pub const HEXTILE_SUBRECTS: u8 = 1 << 3;
pub const HEXTILE_COLOURED: u8 = 1 << 4;
/// ZlibHex extension bit: the raw tile body is deflate-compressed and
/// prefixed with a u16 BE length.
pub const HEXTILE_ZLIB_RAW: u8 = 1 << 5;

/// How raw tile bodies are written: plain pixels (Hextile) or through the
/// session's persistent deflate stream (ZlibHex).
pub enum RawTileMode<'z> {
    Plain,
    Deflate(&'z mut flate2::Compress),
}

struct TileRect {
    color: u32,
    x: u8,
    y: u8,
    w: u8,
    h: u8,
}

/// Classifies a tile: solid, two-colour, or multicolour; returns the
/// background (most common) and, for two-colour tiles, the foreground.
fn analyze(pixels: &[u32]) -> (bool, bool, u32, u32) {
    let mut counts = std::collections::HashMap::new();
    for &px in pixels {
        *counts.entry(px).or_insert(0usize) += 1;
    }
    match counts.len() {
        0 | 1 => (true, true, pixels.first().copied().unwrap_or(0), 0),
        2 => {
            let mut sorted: Vec<_> = counts.into_iter().collect();
            sorted.sort_by_key(|(_, count)| std::cmp::Reverse(*count));
            (false, true, sorted[0].0, sorted[1].0)
        }
        _ => {
            let bg = counts
                .into_iter()
                .max_by_key(|(_, count)| *count)
                .map(|(color, _)| color)
                .unwrap_or(0);
            (false, false, bg, 0)
        }
    }
}

/// Greedy cover of non-background pixels, tile-local u8 coordinates.
#[allow(clippy::cast_possible_truncation)] // tiles are at most 16x16
fn tile_subrects(pixels: &[u32], w: usize, h: usize, bg: u32) -> Vec<TileRect> {
    let mut out = Vec::new();
    let mut marked = vec![false; pixels.len()];
    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;
            if marked[idx] || pixels[idx] == bg {
                continue;
            }
            let color = pixels[idx];
            let mut rw = 0;
            for tx in x..w {
                if marked[y * w + tx] || pixels[y * w + tx] != color {
                    break;
                }
                rw = tx - x + 1;
            }
            let mut rh = 1;
            'rows: for ty in (y + 1)..h {
                for tx in x..(x + rw) {
                    if marked[ty * w + tx] || pixels[ty * w + tx] != color {
                        break 'rows;
                    }
                }
                rh = ty - y + 1;
            }
            for dy in 0..rh {
                for dx in 0..rw {
                    marked[(y + dy) * w + (x + dx)] = true;
                }
            }
            out.push(TileRect {
                color,
                x: x as u8,
                y: y as u8,
                w: rw as u8,
                h: rh as u8,
            });
        }
    }
    out
}

/// Encodes a rectangle as a stream of 16x16 hextiles.
pub fn encode(view: &FrameView<'_>, opts: &EncodeOptions) -> BytesMut {
    // Plain raw tiles cannot fail.
    encode_with(view, opts, RawTileMode::Plain).expect("plain hextile encode")
}

/// Encodes hextiles with the given raw-tile mode. Only the deflate mode
/// can fail.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_with(
    view: &FrameView<'_>,
    opts: &EncodeOptions,
    mut raw_mode: RawTileMode<'_>,
) -> Result<BytesMut> {
    let fmt = &opts.client_format;
    let bpp = fmt.bytes_per_pixel();
    let mut buf = BytesMut::new();

    let mut last_bg: Option<u32> = None;
    let mut last_fg: Option<u32> = None;

    for tile_y in (0..view.height()).step_by(16) {
        for tile_x in (0..view.width()).step_by(16) {
            let tw = 16.min(view.width() - tile_x);
            let th = 16.min(view.height() - tile_y);
            let tile = view.sub_view(Region::new(tile_x, tile_y, tw, th));
            let pixels = client_pixels(&tile, fmt);

            let (solid, mono, bg, fg) = analyze(&pixels);
            let tile_start = buf.len();
            buf.put_u8(0); // subencoding placeholder
            let mut sub: u8 = 0;

            if solid {
                if last_bg != Some(bg) {
                    sub |= HEXTILE_BACKGROUND;
                    translate::put_pixel(&mut buf, bg, fmt);
                    last_bg = Some(bg);
                }
            } else {
                let subrects = tile_subrects(&pixels, tw as usize, th as usize, bg);

                let bg_cost = if last_bg == Some(bg) { 0 } else { bpp };
                let fg_cost = if mono && last_fg != Some(fg) { bpp } else { 0 };
                let body = subrects.len() * if mono { 2 } else { 2 + bpp };
                let raw_cost = tw as usize * th as usize * bpp;

                if subrects.is_empty() || subrects.len() > 255 || bg_cost + fg_cost + 1 + body >= raw_cost {
                    buf.truncate(tile_start);
                    let mut body = BytesMut::with_capacity(raw_cost);
                    for &px in &pixels {
                        translate::put_pixel(&mut body, px, fmt);
                    }
                    match raw_mode {
                        RawTileMode::Plain => {
                            buf.put_u8(HEXTILE_RAW);
                            buf.put_slice(&body);
                        }
                        RawTileMode::Deflate(ref mut comp) => {
                            let packed = super::zlib::deflate_sync(comp, &body)?;
                            buf.put_u8(HEXTILE_RAW | HEXTILE_ZLIB_RAW);
                            buf.put_u16(packed.len() as u16);
                            buf.put_slice(&packed);
                        }
                    }
                    // Raw tiles invalidate the inherited colours.
                    last_bg = None;
                    last_fg = None;
                    continue;
                }

                if last_bg != Some(bg) {
                    sub |= HEXTILE_BACKGROUND;
                    translate::put_pixel(&mut buf, bg, fmt);
                    last_bg = Some(bg);
                }
                sub |= HEXTILE_SUBRECTS;

                if mono {
                    if last_fg != Some(fg) {
                        sub |= HEXTILE_FOREGROUND;
                        translate::put_pixel(&mut buf, fg, fmt);
                        last_fg = Some(fg);
                    }
                    buf.put_u8(subrects.len() as u8);
                    for sr in subrects {
                        buf.put_u8((sr.x << 4) | sr.y);
                        buf.put_u8(((sr.w - 1) << 4) | (sr.h - 1));
                    }
                } else {
                    sub |= HEXTILE_COLOURED;
                    last_fg = None;
                    buf.put_u8(subrects.len() as u8);
                    for sr in subrects {
                        translate::put_pixel(&mut buf, sr.color, fmt);
                        buf.put_u8((sr.x << 4) | sr.y);
                        buf.put_u8(((sr.w - 1) << 4) | (sr.h - 1));
                    }
                }
            }
            buf[tile_start] = sub;
        }
    }
    Ok(buf)
}

async fn recv_pixel<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut FramedStream<S>,
    format: &PixelFormat,
) -> Result<u32> {
    let bytes = stream.recv_exact(format.bytes_per_pixel()).await?;
    Ok(translate::read_pixel(&bytes, format))
}

/// Decodes a hextile rectangle into client-format pixels.
pub async fn decode<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut FramedStream<S>,
    width: u16,
    height: u16,
    format: &PixelFormat,
) -> Result<Vec<u8>> {
    decode_with(stream, width, height, format, None).await
}

/// Decodes hextiles, inflating ZlibHex raw tiles through the persistent
/// stream when one is supplied.
pub async fn decode_with<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut FramedStream<S>,
    width: u16,
    height: u16,
    format: &PixelFormat,
    mut inflater: Option<&mut flate2::Decompress>,
) -> Result<Vec<u8>> {
    let bpp = format.bytes_per_pixel();
    let w = width as usize;
    let mut out = vec![0u8; w * height as usize * bpp];

    let mut bg = 0u32;
    let mut fg = 0u32;

    let mut put = |out: &mut Vec<u8>, x: usize, y: usize, rw: usize, rh: usize, color: u32| {
        let mut px = BytesMut::with_capacity(bpp);
        translate::put_pixel(&mut px, color, format);
        for dy in 0..rh {
            for dx in 0..rw {
                let off = ((y + dy) * w + x + dx) * bpp;
                out[off..off + bpp].copy_from_slice(&px);
            }
        }
    };

    for tile_y in (0..height as usize).step_by(16) {
        for tile_x in (0..w).step_by(16) {
            let tw = 16.min(w - tile_x);
            let th = 16.min(height as usize - tile_y);
            let sub = stream.recv_u8().await?;

            if sub & HEXTILE_RAW != 0 {
                let body_len = tw * th * bpp;
                let bytes = if sub & HEXTILE_ZLIB_RAW != 0 {
                    let inflater = inflater
                        .as_deref_mut()
                        .ok_or_else(|| LtsmError::Protocol("zlib tile without stream".into()))?;
                    let packed_len = stream.recv_u16_be().await? as usize;
                    let packed = stream.recv_exact(packed_len).await?;
                    bytes::Bytes::from(super::zlib::inflate_sync(inflater, &packed, body_len)?)
                } else {
                    stream.recv_exact(body_len).await?
                };
                if bytes.len() != body_len {
                    return Err(LtsmError::Protocol("hextile raw tile truncated".into()));
                }
                for row in 0..th {
                    let dst = ((tile_y + row) * w + tile_x) * bpp;
                    let src = row * tw * bpp;
                    out[dst..dst + tw * bpp].copy_from_slice(&bytes[src..src + tw * bpp]);
                }
                continue;
            }

            if sub & HEXTILE_BACKGROUND != 0 {
                bg = recv_pixel(stream, format).await?;
            }
            put(&mut out, tile_x, tile_y, tw, th, bg);

            if sub & HEXTILE_FOREGROUND != 0 {
                fg = recv_pixel(stream, format).await?;
            }
            if sub & HEXTILE_SUBRECTS != 0 {
                let count = stream.recv_u8().await?;
                for _ in 0..count {
                    let color = if sub & HEXTILE_COLOURED != 0 {
                        recv_pixel(stream, format).await?
                    } else {
                        fg
                    };
                    let xy = stream.recv_u8().await?;
                    let wh = stream.recv_u8().await?;
                    let sx = (xy >> 4) as usize;
                    let sy = (xy & 0x0F) as usize;
                    let sw = ((wh >> 4) + 1) as usize;
                    let sh = ((wh & 0x0F) + 1) as usize;
                    if sx + sw > tw || sy + sh > th {
                        return Err(LtsmError::Protocol("hextile subrect out of tile".into()));
                    }
                    put(&mut out, tile_x + sx, tile_y + sy, sw, sh, color);
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::Framebuffer;

    fn noisy_frame(width: u16, height: u16, seed: u64, colors: u64) -> Vec<u8> {
        let mut state = seed | 1;
        let mut out = Vec::with_capacity(width as usize * height as usize * 4);
        for _ in 0..width as usize * height as usize {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let c = state % colors;
            out.extend_from_slice(&[(c * 37) as u8, (c * 11) as u8, (c * 5) as u8, 0]);
        }
        out
    }

    async fn round_trip(width: u16, height: u16, seed: u64, colors: u64) {
        let format = PixelFormat::rgb888();
        let mut fb = Framebuffer::new(width, height, format.clone());
        let pixels = noisy_frame(width, height, seed, colors);
        fb.put_region(Region::new(0, 0, width, height), &pixels);
        let view = fb.view(fb.bounds()).unwrap();
        let opts = EncodeOptions {
            client_format: format.clone(),
            ..Default::default()
        };
        let encoded = encode(&view, &opts);

        let (a, b) = tokio::io::duplex(1 << 20);
        let mut tx = FramedStream::new(a);
        let mut rx = FramedStream::new(b);
        tx.send_all(&encoded);
        tx.flush().await.unwrap();
        let decoded = decode(&mut rx, width, height, &format).await.unwrap();
        assert_eq!(decoded, pixels);
    }

    #[tokio::test]
    async fn round_trip_16x16_tiles() {
        for seed in [1, 31337, 424242] {
            round_trip(16, 16, seed, 3).await;
        }
    }

    #[tokio::test]
    async fn round_trip_unaligned_edges() {
        round_trip(41, 23, 7, 4).await;
    }

    #[tokio::test]
    async fn round_trip_high_entropy_falls_back_to_raw_tiles() {
        // Many colours force the raw-tile path.
        round_trip(32, 32, 9091, 1000).await;
    }

    #[tokio::test]
    async fn round_trip_rgb565_client() {
        let server = PixelFormat::rgb888();
        let client = PixelFormat::rgb565();
        let mut fb = Framebuffer::new(16, 16, server);
        let pixels = noisy_frame(16, 16, 77, 3);
        fb.put_region(Region::new(0, 0, 16, 16), &pixels);
        let view = fb.view(fb.bounds()).unwrap();
        let opts = EncodeOptions {
            client_format: client.clone(),
            ..Default::default()
        };
        let encoded = encode(&view, &opts);

        let (a, b) = tokio::io::duplex(1 << 16);
        let mut tx = FramedStream::new(a);
        let mut rx = FramedStream::new(b);
        tx.send_all(&encoded);
        tx.flush().await.unwrap();
        let decoded = decode(&mut rx, 16, 16, &client).await.unwrap();
        // Compare against the straight translation of the source.
        let expected = crate::translate::translate_pixels(&pixels, view.format, &client);
        assert_eq!(decoded, expected.to_vec());
    }
}
