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

//! TRLE and ZRLE encodings.
//!
//! Both tile the rectangle into 16x16 cells; each tile is raw, solid,
//! packed-palette, plain-RLE or palette-RLE, chosen per tile. ZRLE is the
//! same tile stream wrapped in the session's persistent deflate stream
//! with a u32 length prefix. Pixels use the compressed CPIXEL form (three
//! bytes) when a 32bpp format's colour bits fit in 24.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use super::{client_pixels, EncodeOptions};
use crate::error::{LtsmError, Result};
use crate::framebuffer::{FrameView, Region};
use crate::protocol::PixelFormat;
use crate::stream::FramedStream;

const TILE: u16 = 16;

// Tile subencoding values.
const TILE_RAW: u8 = 0;
const TILE_SOLID: u8 = 1;
// 2..=16: packed palette of that size.
const TILE_PLAIN_RLE: u8 = 128;
// 130..=255: palette RLE, palette size = value - 128.

/// CPIXEL width for a format: 3 bytes when a 32bpp format's colour bits
/// all live in the low 24, else the full pixel.
fn cpixel_len(format: &PixelFormat) -> usize {
    let fits24 = |max: u16, shift: u8| {
        let bits = 16 - max.leading_zeros() as u8;
        shift + bits <= 24
    };
    if format.bytes_per_pixel() == 4
        && format.depth <= 24
        && fits24(format.red_max, format.red_shift)
        && fits24(format.green_max, format.green_shift)
        && fits24(format.blue_max, format.blue_shift)
    {
        3
    } else {
        format.bytes_per_pixel()
    }
}

#[allow(clippy::cast_possible_truncation)] // masked to the cpixel width
fn put_cpixel(buf: &mut BytesMut, px: u32, format: &PixelFormat, clen: usize) {
    match clen {
        3 => {
            if format.big_endian != 0 {
                buf.put_u8((px >> 16) as u8);
                buf.put_u8((px >> 8) as u8);
                buf.put_u8(px as u8);
            } else {
                buf.put_u8(px as u8);
                buf.put_u8((px >> 8) as u8);
                buf.put_u8((px >> 16) as u8);
            }
        }
        _ => crate::translate::put_pixel(buf, px, format),
    }
}

fn get_cpixel(bytes: &[u8], format: &PixelFormat, clen: usize) -> u32 {
    match clen {
        3 => {
            if format.big_endian != 0 {
                (bytes[0] as u32) << 16 | (bytes[1] as u32) << 8 | bytes[2] as u32
            } else {
                bytes[0] as u32 | (bytes[1] as u32) << 8 | (bytes[2] as u32) << 16
            }
        }
        _ => crate::translate::read_pixel(bytes, format),
    }
}

/// RLE run length: value - 1 in base-255 continuation bytes.
fn put_run_length(buf: &mut BytesMut, mut len: usize) {
    len -= 1;
    while len >= 255 {
        buf.put_u8(255);
        len -= 255;
    }
    buf.put_u8(len as u8);
}

/// RLE-encodes a tile with more than 16 colours: palette RLE when the
/// palette stays within 127 entries, plain RLE otherwise.
#[allow(clippy::cast_possible_truncation)]
fn encode_tile_rle(buf: &mut BytesMut, pixels: &[u32], palette: &[u32], format: &PixelFormat) {
    let clen = cpixel_len(format);

    if palette.len() <= 127 {
        buf.put_u8(128 + palette.len() as u8);
        for &color in palette {
            put_cpixel(buf, color, format, clen);
        }
        let mut i = 0usize;
        while i < pixels.len() {
            let color = pixels[i];
            let mut run = 1;
            while i + run < pixels.len() && pixels[i + run] == color {
                run += 1;
            }
            let index = palette.iter().position(|&c| c == color).unwrap() as u8;
            if run == 1 {
                buf.put_u8(index);
            } else {
                buf.put_u8(index | 128);
                put_run_length(buf, run);
            }
            i += run;
        }
    } else {
        buf.put_u8(TILE_PLAIN_RLE);
        let mut i = 0usize;
        while i < pixels.len() {
            let color = pixels[i];
            let mut run = 1;
            while i + run < pixels.len() && pixels[i + run] == color {
                run += 1;
            }
            put_cpixel(buf, color, format, clen);
            put_run_length(buf, run);
            i += run;
        }
    }
}

/// Full tile encoder; needs the tile width for packed-palette rows.
#[allow(clippy::cast_possible_truncation)]
fn encode_tile_rows(buf: &mut BytesMut, pixels: &[u32], tw: usize, format: &PixelFormat) {
    let clen = cpixel_len(format);

    let mut palette: Vec<u32> = Vec::new();
    for &px in pixels {
        if !palette.contains(&px) {
            palette.push(px);
            if palette.len() > 127 {
                break;
            }
        }
    }

    if palette.len() == 1 {
        buf.put_u8(TILE_SOLID);
        put_cpixel(buf, palette[0], format, clen);
        return;
    }

    if (2..=16).contains(&palette.len()) {
        buf.put_u8(palette.len() as u8);
        for &color in &palette {
            put_cpixel(buf, color, format, clen);
        }
        let bits: u32 = match palette.len() {
            2 => 1,
            3..=4 => 2,
            _ => 4,
        };
        for row in pixels.chunks(tw) {
            let mut acc: u32 = 0;
            let mut nbits: u32 = 0;
            for &px in row {
                let index = palette.iter().position(|&c| c == px).unwrap() as u32;
                acc = (acc << bits) | index;
                nbits += bits;
                if nbits == 8 {
                    buf.put_u8(acc as u8);
                    acc = 0;
                    nbits = 0;
                }
            }
            if nbits > 0 {
                buf.put_u8((acc << (8 - nbits)) as u8);
            }
        }
        return;
    }

    // Raw is the backstop when RLE cannot win.
    let raw_cost = 1 + pixels.len() * clen;
    let mut rle = BytesMut::new();
    encode_tile_rle(&mut rle, pixels, &palette, format);
    if rle.len() < raw_cost {
        buf.put_slice(&rle);
    } else {
        buf.put_u8(TILE_RAW);
        for &px in pixels {
            put_cpixel(buf, px, format, clen);
        }
    }
}

/// Encodes the shared TRLE/ZRLE tile stream for a view.
fn encode_tiles(view: &FrameView<'_>, format: &PixelFormat) -> BytesMut {
    let mut buf = BytesMut::new();
    for ty in (0..view.height()).step_by(TILE as usize) {
        for tx in (0..view.width()).step_by(TILE as usize) {
            let tw = TILE.min(view.width() - tx);
            let th = TILE.min(view.height() - ty);
            let tile = view.sub_view(Region::new(tx, ty, tw, th));
            let pixels = client_pixels(&tile, format);
            encode_tile_rows(&mut buf, &pixels, tw as usize, format);
        }
    }
    buf
}

/// TRLE: the tile stream, uncompressed.
pub fn encode_trle(view: &FrameView<'_>, opts: &EncodeOptions) -> BytesMut {
    encode_tiles(view, &opts.client_format)
}

/// ZRLE: `{u32 BE length, deflate(tile stream)}` on the persistent
/// session stream. Input is pre-translated client-format pixels.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_zrle(
    translated: &[u8],
    width: u16,
    height: u16,
    streams: &mut super::zlib::ZlibStreams,
    opts: &EncodeOptions,
) -> Result<BytesMut> {
    let fmt = opts.client_format.clone();
    let pitch = width as usize * fmt.bytes_per_pixel();
    let view = FrameView::new(Region::with_size(width, height), &fmt, translated, pitch)?;
    let tiles = encode_tiles(&view, &fmt);
    let packed = super::zlib::deflate_sync(streams.zrle(opts.compression), &tiles)?;
    let mut buf = BytesMut::with_capacity(4 + packed.len());
    buf.put_u32(packed.len() as u32);
    buf.put_slice(&packed);
    Ok(buf)
}

/// Decodes the tile stream from any framed source into client-format
/// pixels.
async fn decode_tiles<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut FramedStream<S>,
    width: u16,
    height: u16,
    format: &PixelFormat,
) -> Result<Vec<u8>> {
    let clen = cpixel_len(format);
    let bpp = format.bytes_per_pixel();
    let w = width as usize;
    let mut out = vec![0u8; w * height as usize * bpp];

    let mut write_px = |out: &mut Vec<u8>, x: usize, y: usize, px: u32| {
        let mut tmp = BytesMut::with_capacity(bpp);
        crate::translate::put_pixel(&mut tmp, px, format);
        let off = (y * w + x) * bpp;
        out[off..off + bpp].copy_from_slice(&tmp);
    };

    for ty in (0..height as usize).step_by(TILE as usize) {
        for tx in (0..w).step_by(TILE as usize) {
            let tw = (TILE as usize).min(w - tx);
            let th = (TILE as usize).min(height as usize - ty);
            let area = tw * th;
            let sub = stream.recv_u8().await?;

            match sub {
                TILE_RAW => {
                    let bytes = stream.recv_exact(area * clen).await?;
                    for (i, chunk) in bytes.chunks(clen).enumerate() {
                        let px = get_cpixel(chunk, format, clen);
                        write_px(&mut out, tx + i % tw, ty + i / tw, px);
                    }
                }
                TILE_SOLID => {
                    let bytes = stream.recv_exact(clen).await?;
                    let px = get_cpixel(&bytes, format, clen);
                    for i in 0..area {
                        write_px(&mut out, tx + i % tw, ty + i / tw, px);
                    }
                }
                2..=16 => {
                    let psize = sub as usize;
                    let pal = stream.recv_exact(psize * clen).await?;
                    let palette: Vec<u32> = pal
                        .chunks(clen)
                        .map(|c| get_cpixel(c, format, clen))
                        .collect();
                    let bits: usize = match psize {
                        2 => 1,
                        3..=4 => 2,
                        _ => 4,
                    };
                    let row_bytes = (tw * bits + 7) / 8;
                    for row in 0..th {
                        let packed = stream.recv_exact(row_bytes).await?;
                        for col in 0..tw {
                            let bit_off = col * bits;
                            let byte = packed[bit_off / 8];
                            let shift = 8 - bits - (bit_off % 8);
                            let index = ((byte >> shift) as usize) & ((1 << bits) - 1);
                            let px = *palette
                                .get(index)
                                .ok_or_else(|| LtsmError::Protocol("palette index".into()))?;
                            write_px(&mut out, tx + col, ty + row, px);
                        }
                    }
                }
                TILE_PLAIN_RLE => {
                    let mut filled = 0usize;
                    while filled < area {
                        let cp = stream.recv_exact(clen).await?;
                        let px = get_cpixel(&cp, format, clen);
                        let mut run = 1usize;
                        loop {
                            let b = stream.recv_u8().await?;
                            run += b as usize;
                            if b != 255 {
                                break;
                            }
                        }
                        if filled + run > area {
                            return Err(LtsmError::Protocol("RLE run overflows tile".into()));
                        }
                        for i in 0..run {
                            let idx = filled + i;
                            write_px(&mut out, tx + idx % tw, ty + idx / tw, px);
                        }
                        filled += run;
                    }
                }
                130..=255 => {
                    let psize = (sub - 128) as usize;
                    let pal = stream.recv_exact(psize * clen).await?;
                    let palette: Vec<u32> = pal
                        .chunks(clen)
                        .map(|c| get_cpixel(c, format, clen))
                        .collect();
                    let mut filled = 0usize;
                    while filled < area {
                        let b = stream.recv_u8().await?;
                        let index = (b & 127) as usize;
                        let px = *palette
                            .get(index)
                            .ok_or_else(|| LtsmError::Protocol("palette index".into()))?;
                        let mut run = 1usize;
                        if b & 128 != 0 {
                            loop {
                                let c = stream.recv_u8().await?;
                                run += c as usize;
                                if c != 255 {
                                    break;
                                }
                            }
                        }
                        if filled + run > area {
                            return Err(LtsmError::Protocol("RLE run overflows tile".into()));
                        }
                        for i in 0..run {
                            let idx = filled + i;
                            write_px(&mut out, tx + idx % tw, ty + idx / tw, px);
                        }
                        filled += run;
                    }
                }
                other => {
                    return Err(LtsmError::Protocol(format!(
                        "unsupported tile subencoding {other}"
                    )));
                }
            }
        }
    }
    Ok(out)
}

/// Decodes a TRLE rectangle straight off the socket.
pub async fn decode_trle<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut FramedStream<S>,
    width: u16,
    height: u16,
    format: &PixelFormat,
) -> Result<Vec<u8>> {
    decode_tiles(stream, width, height, format).await
}

/// Decodes a ZRLE rectangle: inflate on the persistent stream, then run
/// the tile decoder over the inflated bytes.
pub async fn decode_zrle<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut FramedStream<S>,
    width: u16,
    height: u16,
    format: &PixelFormat,
    inflate: &mut super::zlib::InflateStreams,
) -> Result<Vec<u8>> {
    let len = stream.recv_u32_be().await? as usize;
    let packed = stream.recv_exact(len).await?;
    let tiles = super::zlib::inflate_sync(inflate.zrle(), &packed, len * 4)?;

    let (a, b) = tokio::io::duplex(tiles.len().max(64));
    let mut tx = FramedStream::new(a);
    let mut rx = FramedStream::new(b);
    tx.send_all(&tiles);
    tx.flush().await?;
    drop(tx);
    decode_tiles(&mut rx, width, height, format).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::Framebuffer;

    fn frame(width: u16, height: u16, seed: u64, colors: u64) -> Vec<u8> {
        let mut state = seed | 1;
        let mut out = Vec::with_capacity(width as usize * height as usize * 4);
        for _ in 0..width as usize * height as usize {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let c = state % colors;
            out.extend_from_slice(&[(c * 29) as u8, (c * 13) as u8, (c * 3) as u8, 0]);
        }
        out
    }

    async fn trle_round_trip(width: u16, height: u16, seed: u64, colors: u64) {
        let format = PixelFormat::rgb888();
        let mut fb = Framebuffer::new(width, height, format.clone());
        let pixels = frame(width, height, seed, colors);
        fb.put_region(Region::new(0, 0, width, height), &pixels);
        let view = fb.view(fb.bounds()).unwrap();
        let opts = EncodeOptions {
            client_format: format.clone(),
            ..Default::default()
        };
        let encoded = encode_trle(&view, &opts);

        let (a, b) = tokio::io::duplex(1 << 20);
        let mut tx = FramedStream::new(a);
        let mut rx = FramedStream::new(b);
        tx.send_all(&encoded);
        tx.flush().await.unwrap();
        let decoded = decode_trle(&mut rx, width, height, &format).await.unwrap();
        assert_eq!(decoded, pixels);
    }

    #[tokio::test]
    async fn trle_round_trip_16x16_palettes() {
        // 2 colours: packed 1-bit; 4: 2-bit; 12: 4-bit; 40: palette RLE.
        for colors in [2u64, 4, 12, 40] {
            trle_round_trip(16, 16, 0x5EED ^ colors, colors).await;
        }
    }

    #[tokio::test]
    async fn trle_round_trip_solid_and_edges() {
        trle_round_trip(16, 16, 1, 1).await;
        trle_round_trip(33, 17, 123, 5).await;
    }

    #[tokio::test]
    async fn trle_round_trip_high_entropy() {
        // > 127 colours forces plain RLE or raw tiles.
        trle_round_trip(32, 32, 0xFACE, 100_000).await;
    }

    #[tokio::test]
    async fn zrle_round_trip_persistent_stream() {
        let format = PixelFormat::rgb888();
        let mut streams = super::super::zlib::ZlibStreams::default();
        let mut inflate = super::super::zlib::InflateStreams::default();
        let opts = EncodeOptions {
            client_format: format.clone(),
            ..Default::default()
        };

        for seed in [21u64, 42, 63] {
            let pixels = frame(48, 48, seed, 9);
            let payload = encode_zrle(&pixels, 48, 48, &mut streams, &opts).unwrap();

            let (a, b) = tokio::io::duplex(1 << 20);
            let mut tx = FramedStream::new(a);
            let mut rx = FramedStream::new(b);
            tx.send_all(&payload);
            tx.flush().await.unwrap();

            let decoded = decode_zrle(&mut rx, 48, 48, &format, &mut inflate)
                .await
                .unwrap();
            assert_eq!(decoded, pixels);
        }
    }

    #[test]
    fn cpixel_is_three_bytes_for_depth24() {
        assert_eq!(cpixel_len(&PixelFormat::rgb888()), 3);
        assert_eq!(cpixel_len(&PixelFormat::rgb565()), 2);
    }
}
