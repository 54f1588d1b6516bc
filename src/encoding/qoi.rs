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

//! LTSM QOI encoding: the "Quite OK Image" format over a dirty region,
//! length-prefixed so the rectangle is self-delimiting on the wire.
//!
//! QOI works in 8-bit RGB space; components are rescaled from the source
//! pixel format on encode and deposited into the client format on decode,
//! so 888-class formats round-trip exactly.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use super::EncodeOptions;
use crate::error::{LtsmError, Result};
use crate::framebuffer::FrameView;
use crate::protocol::PixelFormat;
use crate::stream::FramedStream;
use crate::translate;

const QOI_MAGIC: &[u8; 4] = b"qoif";
const QOI_OP_INDEX: u8 = 0x00;
const QOI_OP_DIFF: u8 = 0x40;
const QOI_OP_LUMA: u8 = 0x80;
const QOI_OP_RUN: u8 = 0xC0;
const QOI_OP_RGB: u8 = 0xFE;
const QOI_END: [u8; 8] = [0, 0, 0, 0, 0, 0, 0, 1];

#[derive(Clone, Copy, PartialEq, Eq, Default)]
struct Rgb {
    r: u8,
    g: u8,
    b: u8,
}

fn hash(px: Rgb) -> usize {
    (px.r as usize * 3 + px.g as usize * 5 + px.b as usize * 7 + 255 * 11) % 64
}

fn scale_to_8(value: u32, max: u16) -> u8 {
    if max == 255 {
        value as u8
    } else if max == 0 {
        0
    } else {
        ((value as u64 * 255) / max as u64) as u8
    }
}

fn pixel_rgb(px: u32, format: &PixelFormat) -> Rgb {
    Rgb {
        r: scale_to_8((px >> format.red_shift) & format.red_max as u32, format.red_max),
        g: scale_to_8(
            (px >> format.green_shift) & format.green_max as u32,
            format.green_max,
        ),
        b: scale_to_8(
            (px >> format.blue_shift) & format.blue_max as u32,
            format.blue_max,
        ),
    }
}

fn rgb_pixel(rgb: Rgb, format: &PixelFormat) -> u32 {
    let scale = |value: u8, max: u16| -> u32 {
        if max == 255 {
            value as u32
        } else {
            (value as u32 * max as u32) / 255
        }
    };
    (scale(rgb.r, format.red_max) << format.red_shift)
        | (scale(rgb.g, format.green_max) << format.green_shift)
        | (scale(rgb.b, format.blue_max) << format.blue_shift)
}

/// Encodes a view as `{u32 BE length, QOI image}`.
#[allow(clippy::cast_possible_truncation)]
pub fn encode(view: &FrameView<'_>, _opts: &EncodeOptions) -> Result<BytesMut> {
    let mut img = BytesMut::with_capacity(
        14 + view.width() as usize * view.height() as usize + QOI_END.len(),
    );
    img.put_slice(QOI_MAGIC);
    img.put_u32(view.width() as u32);
    img.put_u32(view.height() as u32);
    img.put_u8(3); // channels
    img.put_u8(0); // sRGB

    let mut index = [Rgb::default(); 64];
    let mut prev = Rgb::default();
    let mut run = 0u8;

    for y in 0..view.height() {
        for x in 0..view.width() {
            let px = pixel_rgb(view.pixel(x, y), view.format);

            if px == prev {
                run += 1;
                if run == 62 {
                    img.put_u8(QOI_OP_RUN | (run - 1));
                    run = 0;
                }
                continue;
            }
            if run > 0 {
                img.put_u8(QOI_OP_RUN | (run - 1));
                run = 0;
            }

            let slot = hash(px);
            if index[slot] == px {
                img.put_u8(QOI_OP_INDEX | slot as u8);
            } else {
                index[slot] = px;
                let dr = px.r.wrapping_sub(prev.r) as i16;
                let dg = px.g.wrapping_sub(prev.g) as i16;
                let db = px.b.wrapping_sub(prev.b) as i16;
                // Wrapped differences as small signed values.
                let s = |d: i16| if d > 127 { d - 256 } else { d };
                let (dr, dg, db) = (s(dr), s(dg), s(db));
                let dr_dg = dr - dg;
                let db_dg = db - dg;

                if (-2..=1).contains(&dr) && (-2..=1).contains(&dg) && (-2..=1).contains(&db) {
                    img.put_u8(
                        QOI_OP_DIFF
                            | (((dr + 2) as u8) << 4)
                            | (((dg + 2) as u8) << 2)
                            | ((db + 2) as u8),
                    );
                } else if (-32..=31).contains(&dg)
                    && (-8..=7).contains(&dr_dg)
                    && (-8..=7).contains(&db_dg)
                {
                    img.put_u8(QOI_OP_LUMA | ((dg + 32) as u8));
                    img.put_u8((((dr_dg + 8) as u8) << 4) | ((db_dg + 8) as u8));
                } else {
                    img.put_u8(QOI_OP_RGB);
                    img.put_u8(px.r);
                    img.put_u8(px.g);
                    img.put_u8(px.b);
                }
            }
            prev = px;
        }
    }
    if run > 0 {
        img.put_u8(QOI_OP_RUN | (run - 1));
    }
    img.put_slice(&QOI_END);

    let mut out = BytesMut::with_capacity(4 + img.len());
    out.put_u32(img.len() as u32);
    out.put_slice(&img);
    Ok(out)
}

/// Decodes a QOI rectangle into client-format pixels.
pub async fn decode<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut FramedStream<S>,
    width: u16,
    height: u16,
    format: &PixelFormat,
) -> Result<Vec<u8>> {
    let len = stream.recv_u32_be().await? as usize;
    let img = stream.recv_exact(len).await?;
    if img.len() < 14 + QOI_END.len() || &img[..4] != QOI_MAGIC {
        return Err(LtsmError::Protocol("bad QOI image".into()));
    }
    let img_w = u32::from_be_bytes([img[4], img[5], img[6], img[7]]);
    let img_h = u32::from_be_bytes([img[8], img[9], img[10], img[11]]);
    if img_w != width as u32 || img_h != height as u32 {
        return Err(LtsmError::Protocol("QOI geometry mismatch".into()));
    }

    let mut index = [Rgb::default(); 64];
    let mut px = Rgb::default();
    let area = width as usize * height as usize;
    let bpp = format.bytes_per_pixel();
    let mut out = BytesMut::with_capacity(area * bpp);

    let mut pos = 14usize;
    let mut emitted = 0usize;
    let data = &img[..img.len() - QOI_END.len()];

    while emitted < area {
        if pos >= data.len() {
            return Err(LtsmError::Protocol("QOI stream truncated".into()));
        }
        let byte = data[pos];
        pos += 1;
        let mut run = 1usize;

        if byte == QOI_OP_RGB {
            if pos + 3 > data.len() {
                return Err(LtsmError::Protocol("QOI stream truncated".into()));
            }
            px = Rgb {
                r: data[pos],
                g: data[pos + 1],
                b: data[pos + 2],
            };
            pos += 3;
            index[hash(px)] = px;
        } else {
            match byte & 0xC0 {
                QOI_OP_INDEX => {
                    px = index[(byte & 0x3F) as usize];
                }
                QOI_OP_DIFF => {
                    let dr = ((byte >> 4) & 0x03) as i16 - 2;
                    let dg = ((byte >> 2) & 0x03) as i16 - 2;
                    let db = (byte & 0x03) as i16 - 2;
                    px = Rgb {
                        r: px.r.wrapping_add(dr as u8),
                        g: px.g.wrapping_add(dg as u8),
                        b: px.b.wrapping_add(db as u8),
                    };
                    index[hash(px)] = px;
                }
                QOI_OP_LUMA => {
                    if pos >= data.len() {
                        return Err(LtsmError::Protocol("QOI stream truncated".into()));
                    }
                    let dg = (byte & 0x3F) as i16 - 32;
                    let second = data[pos];
                    pos += 1;
                    let dr_dg = ((second >> 4) & 0x0F) as i16 - 8;
                    let db_dg = (second & 0x0F) as i16 - 8;
                    px = Rgb {
                        r: px.r.wrapping_add((dg + dr_dg) as u8),
                        g: px.g.wrapping_add(dg as u8),
                        b: px.b.wrapping_add((dg + db_dg) as u8),
                    };
                    index[hash(px)] = px;
                }
                _ => {
                    run = ((byte & 0x3F) + 1) as usize;
                }
            }
        }

        if emitted + run > area {
            return Err(LtsmError::Protocol("QOI run overflows image".into()));
        }
        let value = rgb_pixel(px, format);
        for _ in 0..run {
            translate::put_pixel(&mut out, value, format);
        }
        emitted += run;
    }
    Ok(out.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::{Framebuffer, Region};

    fn frame(width: u16, height: u16, seed: u64, colors: u64) -> Vec<u8> {
        let mut state = seed | 1;
        let mut out = Vec::with_capacity(width as usize * height as usize * 4);
        for _ in 0..width as usize * height as usize {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let c = state % colors;
            out.extend_from_slice(&[(c * 53) as u8, (c * 19) as u8, (c * 7) as u8, 0]);
        }
        out
    }

    async fn round_trip(width: u16, height: u16, seed: u64, colors: u64) {
        let format = PixelFormat::rgb888();
        let mut fb = Framebuffer::new(width, height, format.clone());
        let pixels = frame(width, height, seed, colors);
        fb.put_region(Region::new(0, 0, width, height), &pixels);
        let view = fb.view(fb.bounds()).unwrap();
        let encoded = encode(&view, &EncodeOptions::default()).unwrap();

        let (a, b) = tokio::io::duplex(1 << 20);
        let mut tx = FramedStream::new(a);
        let mut rx = FramedStream::new(b);
        tx.send_all(&encoded);
        tx.flush().await.unwrap();
        let decoded = decode(&mut rx, width, height, &format).await.unwrap();
        assert_eq!(decoded, pixels);
    }

    #[tokio::test]
    async fn qoi_round_trip_random_tiles() {
        for (seed, colors) in [(17, 2), (99, 30), (12345, 100_000)] {
            round_trip(16, 16, seed, colors).await;
        }
    }

    #[tokio::test]
    async fn qoi_round_trip_solid_run() {
        round_trip(64, 64, 1, 1).await;
    }

    #[tokio::test]
    async fn qoi_rejects_geometry_mismatch() {
        let format = PixelFormat::rgb888();
        let fb = Framebuffer::new(16, 16, format.clone());
        let view = fb.view(fb.bounds()).unwrap();
        let encoded = encode(&view, &EncodeOptions::default()).unwrap();

        let (a, b) = tokio::io::duplex(1 << 16);
        let mut tx = FramedStream::new(a);
        let mut rx = FramedStream::new(b);
        tx.send_all(&encoded);
        tx.flush().await.unwrap();
        assert!(decode(&mut rx, 8, 8, &format).await.is_err());
    }
}
