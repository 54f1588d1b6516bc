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

//! Byte-stream framing over an async transport.
//!
//! This module provides the lowest layer of the wire stack: buffered,
//! integer-aware reads and writes over any async byte stream. RFB framing
//! is big-endian; LTSM channel payloads are little-endian, so both variants
//! of every accessor exist. Reads buffer internally and writes accumulate
//! until an explicit [`FramedStream::flush`].
//!
//! [`StreamBuf`] and [`StreamRef`] do the same job for in-memory channel
//! payloads; reading past the end of a `StreamRef` fails with
//! [`LtsmError::Underflow`], which channel demuxers treat as "keep the
//! residue and wait for more bytes", not as a failure.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

use crate::error::{LtsmError, Result};

/// Initial capacity of the internal read buffer.
const READ_BUF_CAPACITY: usize = 8192;

/// The concrete transport a server or viewer session runs over.
///
/// A session starts on `Plain` and is switched to a TLS variant exactly
/// once, during the VeNCrypt sub-handshake. After the switch every byte
/// routes through the TLS record layer transparently.
pub enum Transport {
    /// Raw TCP stream.
    Plain(TcpStream),
    /// Server-side TLS over the original TCP stream.
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    /// Client-side TLS over the original TCP stream.
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Transport::TlsClient(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Transport::TlsClient(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Transport::TlsClient(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Transport::TlsClient(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Buffered integer-framing wrapper over an async byte stream.
pub struct FramedStream<S> {
    inner: S,
    rbuf: BytesMut,
    wbuf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedStream<S> {
    /// Wraps a transport with empty read/write buffers.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            rbuf: BytesMut::with_capacity(READ_BUF_CAPACITY),
            wbuf: BytesMut::with_capacity(READ_BUF_CAPACITY),
        }
    }

    /// Consumes the wrapper, returning the transport and any bytes that
    /// were read ahead but not yet consumed. Used for the mid-session TLS
    /// switch, where the handshake is lockstep and the residue is empty.
    pub fn into_parts(self) -> (S, BytesMut) {
        (self.inner, self.rbuf)
    }

    /// True when bytes are already buffered from a previous read. The
    /// session loop pairs this with `select!` on the socket rather than
    /// polling the descriptor.
    pub fn has_input(&self) -> bool {
        !self.rbuf.is_empty()
    }

    /// Fills the read buffer until at least `need` bytes are available.
    async fn fill(&mut self, need: usize) -> Result<()> {
        while self.rbuf.len() < need {
            let n = self
                .inner
                .read_buf(&mut self.rbuf)
                .await
                .map_err(LtsmError::from_io)?;
            if n == 0 {
                return Err(LtsmError::Closed);
            }
        }
        Ok(())
    }

    /// Reads one byte.
    pub async fn recv_u8(&mut self) -> Result<u8> {
        self.fill(1).await?;
        Ok(self.rbuf.get_u8())
    }

    /// Returns the next byte without consuming it.
    pub async fn peek_u8(&mut self) -> Result<u8> {
        self.fill(1).await?;
        Ok(self.rbuf[0])
    }

    /// Reads a big-endian u16.
    pub async fn recv_u16_be(&mut self) -> Result<u16> {
        self.fill(2).await?;
        Ok(self.rbuf.get_u16())
    }

    /// Reads a little-endian u16.
    pub async fn recv_u16_le(&mut self) -> Result<u16> {
        self.fill(2).await?;
        Ok(self.rbuf.get_u16_le())
    }

    /// Reads a big-endian u32.
    pub async fn recv_u32_be(&mut self) -> Result<u32> {
        self.fill(4).await?;
        Ok(self.rbuf.get_u32())
    }

    /// Reads a little-endian u32.
    pub async fn recv_u32_le(&mut self) -> Result<u32> {
        self.fill(4).await?;
        Ok(self.rbuf.get_u32_le())
    }

    /// Reads a big-endian i32 (RFB encoding ids are signed).
    pub async fn recv_i32_be(&mut self) -> Result<i32> {
        self.fill(4).await?;
        Ok(self.rbuf.get_i32())
    }

    /// Reads a little-endian u64.
    pub async fn recv_u64_le(&mut self) -> Result<u64> {
        self.fill(8).await?;
        Ok(self.rbuf.get_u64_le())
    }

    /// Reads exactly `n` bytes.
    pub async fn recv_exact(&mut self, n: usize) -> Result<Bytes> {
        self.fill(n).await?;
        Ok(self.rbuf.split_to(n).freeze())
    }

    /// Discards exactly `n` bytes.
    pub async fn recv_skip(&mut self, n: usize) -> Result<()> {
        self.fill(n).await?;
        self.rbuf.advance(n);
        Ok(())
    }

    /// Queues one byte for sending.
    pub fn send_u8(&mut self, v: u8) -> &mut Self {
        self.wbuf.put_u8(v);
        self
    }

    /// Queues a big-endian u16.
    pub fn send_u16_be(&mut self, v: u16) -> &mut Self {
        self.wbuf.put_u16(v);
        self
    }

    /// Queues a little-endian u16.
    pub fn send_u16_le(&mut self, v: u16) -> &mut Self {
        self.wbuf.put_u16_le(v);
        self
    }

    /// Queues a big-endian u32.
    pub fn send_u32_be(&mut self, v: u32) -> &mut Self {
        self.wbuf.put_u32(v);
        self
    }

    /// Queues a little-endian u32.
    pub fn send_u32_le(&mut self, v: u32) -> &mut Self {
        self.wbuf.put_u32_le(v);
        self
    }

    /// Queues a big-endian i32.
    pub fn send_i32_be(&mut self, v: i32) -> &mut Self {
        self.wbuf.put_i32(v);
        self
    }

    /// Queues a little-endian u64.
    pub fn send_u64_le(&mut self, v: u64) -> &mut Self {
        self.wbuf.put_u64_le(v);
        self
    }

    /// Queues a byte slice.
    pub fn send_all(&mut self, bytes: &[u8]) -> &mut Self {
        self.wbuf.put_slice(bytes);
        self
    }

    /// Queues `n` zero bytes (protocol padding).
    pub fn send_zeros(&mut self, n: usize) -> &mut Self {
        self.wbuf.put_bytes(0, n);
        self
    }

    /// Writes the pending output buffer to the transport and flushes it.
    pub async fn flush(&mut self) -> Result<()> {
        if !self.wbuf.is_empty() {
            let out = self.wbuf.split();
            self.inner
                .write_all(&out)
                .await
                .map_err(LtsmError::from_io)?;
        }
        self.inner.flush().await.map_err(LtsmError::from_io)?;
        Ok(())
    }

    /// Bytes currently queued but not yet flushed.
    pub fn pending(&self) -> usize {
        self.wbuf.len()
    }
}

/// Growable little/big-endian payload builder for channel messages.
#[derive(Default)]
pub struct StreamBuf {
    buf: BytesMut,
}

impl StreamBuf {
    /// Creates an empty builder with the given capacity hint.
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(cap),
        }
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn write_u16_le(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16_le(v);
        self
    }

    pub fn write_u16_be(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16(v);
        self
    }

    pub fn write_u32_le(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn write_u32_be(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    pub fn write_u64_le(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64_le(v);
        self
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Writes `n` zero bytes.
    pub fn write_zeros(&mut self, n: usize) -> &mut Self {
        self.buf.put_bytes(0, n);
        self
    }

    /// Finishes the payload.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    /// Current payload length.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Read cursor over a received channel payload.
///
/// Every accessor fails with [`LtsmError::Underflow`] when the payload is
/// shorter than requested; callers either treat that as a malformed frame
/// or, for streaming demuxers, keep the bytes and resume later.
pub struct StreamRef<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> StreamRef<'a> {
    /// Wraps a payload slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(LtsmError::Underflow);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u32_be(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64_le(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    /// Reads exactly `n` bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Discards `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_buf_round_trip() {
        let mut buf = StreamBuf::with_capacity(32);
        buf.write_u16_le(0xFD01)
            .write_u32_le(0xDEADBEEF)
            .write_u64_le(0x0123_4567_89AB_CDEF)
            .write_bytes(b"Reader0");
        let bytes = buf.into_bytes();

        let mut cur = StreamRef::new(&bytes);
        assert_eq!(cur.read_u16_le().unwrap(), 0xFD01);
        assert_eq!(cur.read_u32_le().unwrap(), 0xDEADBEEF);
        assert_eq!(cur.read_u64_le().unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(cur.read_bytes(7).unwrap(), b"Reader0");
        assert_eq!(cur.remaining(), 0);
    }

    #[test]
    fn stream_ref_underflow_is_recoverable() {
        let bytes = [0x01u8, 0x02];
        let mut cur = StreamRef::new(&bytes);
        assert!(matches!(cur.read_u32_le(), Err(LtsmError::Underflow)));
        // Cursor did not advance past the failed read.
        assert_eq!(cur.remaining(), 2);
        assert_eq!(cur.read_u16_le().unwrap(), 0x0201);
    }

    #[tokio::test]
    async fn framed_stream_integers() {
        let (a, b) = tokio::io::duplex(256);
        let mut tx = FramedStream::new(a);
        let mut rx = FramedStream::new(b);

        tx.send_u8(0x7F)
            .send_u16_be(0x0102)
            .send_u32_be(0xA1B2C3D4)
            .send_u16_le(0x0304)
            .send_u64_le(42)
            .send_all(b"RFB ");
        tx.flush().await.unwrap();

        assert_eq!(rx.recv_u8().await.unwrap(), 0x7F);
        assert_eq!(rx.recv_u16_be().await.unwrap(), 0x0102);
        assert_eq!(rx.recv_u32_be().await.unwrap(), 0xA1B2C3D4);
        assert_eq!(rx.recv_u16_le().await.unwrap(), 0x0304);
        assert_eq!(rx.recv_u64_le().await.unwrap(), 42);
        assert_eq!(&rx.recv_exact(4).await.unwrap()[..], b"RFB ");
    }

    #[tokio::test]
    async fn framed_stream_peek_and_skip() {
        let (a, b) = tokio::io::duplex(64);
        let mut tx = FramedStream::new(a);
        let mut rx = FramedStream::new(b);

        tx.send_all(&[9, 1, 2, 3, 4]);
        tx.flush().await.unwrap();

        assert_eq!(rx.peek_u8().await.unwrap(), 9);
        assert_eq!(rx.recv_u8().await.unwrap(), 9);
        rx.recv_skip(3).await.unwrap();
        assert_eq!(rx.recv_u8().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn framed_stream_reports_close() {
        let (a, b) = tokio::io::duplex(64);
        let mut rx = FramedStream::new(b);
        drop(a);
        assert!(matches!(rx.recv_u8().await, Err(LtsmError::Closed)));
    }
}
