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

//! Raw encoding: pixels converted to the client format, row-major.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};

use super::EncodeOptions;
use crate::error::Result;
use crate::framebuffer::FrameView;
use crate::protocol::PixelFormat;
use crate::stream::FramedStream;
use crate::translate;

/// Translation is the whole encoding.
pub fn encode(view: &FrameView<'_>, opts: &EncodeOptions) -> BytesMut {
    translate::translate_view(view, &opts.client_format)
}

/// Reads a raw rectangle off the stream: `width * height * bpp` bytes in
/// the client format.
pub async fn decode<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut FramedStream<S>,
    width: u16,
    height: u16,
    format: &PixelFormat,
) -> Result<Vec<u8>> {
    let len = width as usize * height as usize * format.bytes_per_pixel();
    Ok(stream.recv_exact(len).await?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::{Framebuffer, Region};

    #[tokio::test]
    async fn round_trip_identity_format() {
        let format = PixelFormat::rgb888();
        let mut fb = Framebuffer::new(16, 16, format.clone());
        let pixels: Vec<u8> = (0..16usize * 16 * 4).map(|i| (i * 13 % 251) as u8).collect();
        fb.put_region(Region::new(0, 0, 16, 16), &pixels);

        let view = fb.view(fb.bounds()).unwrap();
        let opts = EncodeOptions {
            client_format: format.clone(),
            ..Default::default()
        };
        let encoded = encode(&view, &opts);

        let (a, b) = tokio::io::duplex(16384);
        let mut tx = FramedStream::new(a);
        let mut rx = FramedStream::new(b);
        tx.send_all(&encoded);
        tx.flush().await.unwrap();

        let decoded = decode(&mut rx, 16, 16, &format).await.unwrap();
        assert_eq!(decoded, pixels);
    }
}
