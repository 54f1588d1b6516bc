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

//! Zlib-family encodings and the per-session persistent deflate streams.
//!
//! RFB requires one compression stream per connection per encoding, with
//! an explicit sync-flush between rectangles so every rectangle is
//! independently decodable on arrival while history is preserved for
//! ratio. Streams live for the session; they are created lazily at the
//! first rectangle that needs them.

use bytes::{BufMut, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tokio::io::{AsyncRead, AsyncWrite};

use super::hextile;
use super::EncodeOptions;
use crate::error::{LtsmError, Result};
use crate::framebuffer::{FrameView, Region};
use crate::protocol::PixelFormat;
use crate::stream::FramedStream;

/// Per-session persistent compression streams, one per encoding that
/// needs one (created lazily).
#[derive(Default)]
pub struct ZlibStreams {
    pub zlib: Option<Compress>,
    pub hex: Option<Compress>,
    pub zrle: Option<Compress>,
}

impl ZlibStreams {
    fn stream(slot: &mut Option<Compress>, level: u8) -> &mut Compress {
        slot.get_or_insert_with(|| Compress::new(Compression::new(level.min(9) as u32), true))
    }

    pub fn zlib(&mut self, level: u8) -> &mut Compress {
        Self::stream(&mut self.zlib, level)
    }

    pub fn hex(&mut self, level: u8) -> &mut Compress {
        Self::stream(&mut self.hex, level)
    }

    pub fn zrle(&mut self, level: u8) -> &mut Compress {
        Self::stream(&mut self.zrle, level)
    }
}

/// Viewer-side persistent decompression streams.
#[derive(Default)]
pub struct InflateStreams {
    pub zlib: Option<Decompress>,
    pub hex: Option<Decompress>,
    pub zrle: Option<Decompress>,
}

impl InflateStreams {
    fn stream(slot: &mut Option<Decompress>) -> &mut Decompress {
        slot.get_or_insert_with(|| Decompress::new(true))
    }

    pub fn zlib(&mut self) -> &mut Decompress {
        Self::stream(&mut self.zlib)
    }

    pub fn hex(&mut self) -> &mut Decompress {
        Self::stream(&mut self.hex)
    }

    pub fn zrle(&mut self) -> &mut Decompress {
        Self::stream(&mut self.zrle)
    }
}

/// Runs `input` through the persistent stream with a trailing sync flush,
/// so the peer can inflate the rectangle without waiting for more data.
pub fn deflate_sync(comp: &mut Compress, input: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() / 2 + 64);
    let mut chunk = vec![0u8; 64 * 1024];
    let mut pos = 0usize;

    loop {
        let before_in = comp.total_in();
        let before_out = comp.total_out();
        let status = comp
            .compress(&input[pos..], &mut chunk, FlushCompress::Sync)
            .map_err(|e| LtsmError::Encoding(format!("deflate: {e}")))?;
        let consumed = (comp.total_in() - before_in) as usize;
        let produced = (comp.total_out() - before_out) as usize;
        out.extend_from_slice(&chunk[..produced]);
        pos += consumed;

        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                // Flush complete once everything is consumed and the
                // stream stops producing.
                if pos >= input.len() && produced == 0 {
                    break;
                }
            }
        }
    }
    Ok(out)
}

/// Inflates `input` through the persistent stream. `expected` is the
/// decoded size implied by the rectangle geometry.
pub fn inflate_sync(dec: &mut Decompress, input: &[u8], expected: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected);
    let mut chunk = vec![0u8; expected.max(4096)];
    let mut pos = 0usize;

    loop {
        let before_in = dec.total_in();
        let before_out = dec.total_out();
        let status = dec
            .decompress(&input[pos..], &mut chunk, FlushDecompress::Sync)
            .map_err(|e| LtsmError::Encoding(format!("inflate: {e}")))?;
        let consumed = (dec.total_in() - before_in) as usize;
        let produced = (dec.total_out() - before_out) as usize;
        out.extend_from_slice(&chunk[..produced]);
        pos += consumed;

        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                if pos >= input.len() && produced == 0 {
                    break;
                }
            }
        }
    }
    Ok(out)
}

/// Zlib encoding: `{u32 BE compressed length, deflate bytes}` over the
/// already-translated raw pixels.
#[allow(clippy::cast_possible_truncation)] // compressed size bounded by u32 per protocol
pub fn encode_zlib(translated: &[u8], streams: &mut ZlibStreams, level: u8) -> Result<BytesMut> {
    let packed = deflate_sync(streams.zlib(level), translated)?;
    let mut buf = BytesMut::with_capacity(4 + packed.len());
    buf.put_u32(packed.len() as u32);
    buf.put_slice(&packed);
    Ok(buf)
}

/// Decodes a Zlib rectangle into client-format pixels.
pub async fn decode_zlib<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut FramedStream<S>,
    width: u16,
    height: u16,
    format: &PixelFormat,
    inflate: &mut InflateStreams,
) -> Result<Vec<u8>> {
    let len = stream.recv_u32_be().await? as usize;
    let packed = stream.recv_exact(len).await?;
    let expected = width as usize * height as usize * format.bytes_per_pixel();
    let out = inflate_sync(inflate.zlib(), &packed, expected)?;
    if out.len() != expected {
        return Err(LtsmError::Protocol("zlib rectangle size mismatch".into()));
    }
    Ok(out)
}

/// ZlibHex: hextile tiling where raw tile bodies run through the
/// persistent deflate stream.
pub fn encode_zlibhex(
    translated: &[u8],
    width: u16,
    height: u16,
    streams: &mut ZlibStreams,
    opts: &EncodeOptions,
) -> Result<BytesMut> {
    let fmt = opts.client_format.clone();
    let pitch = width as usize * fmt.bytes_per_pixel();
    let view = FrameView::new(Region::with_size(width, height), &fmt, translated, pitch)?;
    hextile::encode_with(
        &view,
        opts,
        hextile::RawTileMode::Deflate(streams.hex(opts.compression)),
    )
}

/// Decodes a ZlibHex rectangle into client-format pixels.
pub async fn decode_zlibhex<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut FramedStream<S>,
    width: u16,
    height: u16,
    format: &PixelFormat,
    inflate: &mut InflateStreams,
) -> Result<Vec<u8>> {
    hextile::decode_with(stream, width, height, format, Some(inflate.hex())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::Framebuffer;
    use crate::translate;

    fn frame(width: u16, height: u16, seed: u64) -> Vec<u8> {
        let mut state = seed | 1;
        let mut out = Vec::with_capacity(width as usize * height as usize * 4);
        for _ in 0..width as usize * height as usize {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            out.extend_from_slice(&[(state % 5) as u8 * 50, (state % 7) as u8 * 36, 0, 0]);
        }
        out
    }

    #[test]
    fn deflate_inflate_sync_round_trip() {
        let mut comp = Compress::new(Compression::new(6), true);
        let mut dec = Decompress::new(true);
        for seed in [1u64, 2, 3] {
            let data = frame(32, 8, seed);
            let packed = deflate_sync(&mut comp, &data).unwrap();
            let back = inflate_sync(&mut dec, &packed, data.len()).unwrap();
            assert_eq!(back, data);
        }
    }

    #[tokio::test]
    async fn zlib_round_trip_persistent_across_rects() {
        let format = PixelFormat::rgb888();
        let mut streams = ZlibStreams::default();
        let mut inflate = InflateStreams::default();

        for seed in [11u64, 22, 33] {
            let pixels = frame(16, 16, seed);
            let payload = encode_zlib(&pixels, &mut streams, 6).unwrap();

            let (a, b) = tokio::io::duplex(1 << 20);
            let mut tx = FramedStream::new(a);
            let mut rx = FramedStream::new(b);
            tx.send_all(&payload);
            tx.flush().await.unwrap();

            let decoded = decode_zlib(&mut rx, 16, 16, &format, &mut inflate)
                .await
                .unwrap();
            assert_eq!(decoded, pixels);
        }
    }

    #[tokio::test]
    async fn zlibhex_round_trip() {
        let server = PixelFormat::rgb888();
        let client = PixelFormat::rgb888();
        let mut streams = ZlibStreams::default();
        let mut inflate = InflateStreams::default();
        let opts = EncodeOptions {
            client_format: client.clone(),
            ..Default::default()
        };

        for seed in [5u64, 1234, 99999] {
            let mut fb = Framebuffer::new(48, 32, server.clone());
            let pixels = frame(48, 32, seed);
            fb.put_region(Region::new(0, 0, 48, 32), &pixels);
            let view = fb.view(fb.bounds()).unwrap();
            let translated = translate::translate_view(&view, &client);

            let payload = encode_zlibhex(&translated, 48, 32, &mut streams, &opts).unwrap();

            let (a, b) = tokio::io::duplex(1 << 20);
            let mut tx = FramedStream::new(a);
            let mut rx = FramedStream::new(b);
            tx.send_all(&payload);
            tx.flush().await.unwrap();

            let decoded = decode_zlibhex(&mut rx, 48, 32, &client, &mut inflate)
                .await
                .unwrap();
            assert_eq!(decoded, pixels);
        }
    }
}
