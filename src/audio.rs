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

//! Audio redirection: capture on the session host, playback at the
//! viewer.
//!
//! The handshake and stream ride a dedicated LTSM channel, all integers
//! little-endian. The server offers its encodings; the client answers
//! with an error string or its choice (OPUS preferred over PCM over
//! AAC). Silent frames (every byte zero) travel as a bare length, which
//! is the whole bandwidth story for an idle desktop. Codec and sink
//! errors drop the frame and keep the channel alive.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::channel::ChannelWriter;
use crate::error::{LtsmError, Result};
use crate::stream::{StreamBuf, StreamRef};

/// Audio channel message words.
pub const AUDIO_OP_INIT: u16 = 0xFE01;
pub const AUDIO_OP_DATA: u16 = 0xFE02;
pub const AUDIO_OP_SILENT: u16 = 0xFE03;

/// Wire protocol version of the audio channel.
pub const AUDIO_PROTO_VERSION: u16 = 1;

/// Stream encodings.
pub const ENCODING_PCM: u16 = 0;
pub const ENCODING_OPUS: u16 = 1;
pub const ENCODING_AAC: u16 = 2;

/// OPUS frame sizes legal at 48 kHz.
pub const OPUS_FRAMES: [u32; 4] = [120, 240, 480, 960];
/// The frame size this implementation captures with.
pub const OPUS_FRAME_SAMPLES: u32 = 480;

/// A negotiated stream format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub encoding: u16,
    pub channels: u16,
    pub samples_per_sec: u32,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    pub fn pcm_cd() -> Self {
        Self {
            encoding: ENCODING_PCM,
            channels: 2,
            samples_per_sec: 44100,
            bits_per_sample: 16,
        }
    }

    pub fn opus_48k() -> Self {
        Self {
            encoding: ENCODING_OPUS,
            channels: 2,
            samples_per_sec: 48000,
            bits_per_sample: 16,
        }
    }

    pub fn aac() -> Self {
        Self {
            encoding: ENCODING_AAC,
            channels: 2,
            samples_per_sec: 44100,
            bits_per_sample: 16,
        }
    }

    /// Bytes of one sample across all channels.
    pub fn sample_bytes(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }

    /// Capture fragment size in bytes: one OPUS frame for OPUS, a fixed
    /// kilobyte-ish fragment for PCM.
    pub fn fragment_bytes(&self) -> usize {
        if self.encoding == ENCODING_OPUS {
            OPUS_FRAME_SAMPLES as usize * self.sample_bytes()
        } else {
            1024
        }
    }
}

/// Playback endpoint on the viewer.
pub trait AudioSink: Send {
    fn open(&mut self, format: &AudioFormat) -> Result<()>;
    fn write(&mut self, bytes: &[u8]) -> Result<()>;
    fn drain(&mut self) -> Result<()>;
    fn close(&mut self);
}

impl AudioSink for Box<dyn AudioSink> {
    fn open(&mut self, format: &AudioFormat) -> Result<()> {
        (**self).open(format)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).write(bytes)
    }

    fn drain(&mut self) -> Result<()> {
        (**self).drain()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Capture endpoint on the session host.
pub trait AudioSource: Send {
    fn open(&mut self, format: &AudioFormat) -> Result<()>;
    /// Fills `buf` with captured bytes; 0 means the stream ended.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn close(&mut self);
}

impl AudioSource for Box<dyn AudioSource> {
    fn open(&mut self, format: &AudioFormat) -> Result<()> {
        (**self).open(format)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// In-memory sink recording everything; tests assert against it.
#[derive(Default)]
pub struct MemorySink {
    pub format: Option<AudioFormat>,
    pub data: Vec<u8>,
    pub drains: usize,
}

impl AudioSink for MemorySink {
    fn open(&mut self, format: &AudioFormat) -> Result<()> {
        self.format = Some(*format);
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        self.drains += 1;
        Ok(())
    }

    fn close(&mut self) {}
}

/// In-memory source: hands out queued frames, then reports end of
/// stream.
pub struct MemorySource {
    frames: std::collections::VecDeque<Vec<u8>>,
}

impl MemorySource {
    pub fn new(frames: Vec<Vec<u8>>) -> Self {
        Self {
            frames: frames.into(),
        }
    }
}

impl AudioSource for MemorySource {
    fn open(&mut self, _format: &AudioFormat) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.frames.pop_front() {
            Some(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    fn close(&mut self) {}
}

/// A frame is silent when every byte is zero.
pub fn is_silent(frame: &[u8]) -> bool {
    frame.iter().all(|&b| b == 0)
}

/// Client-side preference: OPUS over PCM over AAC.
pub fn choose_encoding(offered: &[AudioFormat]) -> Option<AudioFormat> {
    for wanted in [ENCODING_OPUS, ENCODING_PCM, ENCODING_AAC] {
        if wanted == ENCODING_OPUS && !opus_available() {
            continue;
        }
        if let Some(format) = offered.iter().find(|f| f.encoding == wanted) {
            return Some(*format);
        }
    }
    None
}

/// Whether this build carries the OPUS codec.
pub fn opus_available() -> bool {
    cfg!(feature = "opus")
}

/// The encodings this server offers, best last per the original order
/// (PCM first, OPUS appended when built in).
pub fn server_offers() -> Vec<AudioFormat> {
    let mut offers = vec![AudioFormat::pcm_cd()];
    if opus_available() {
        offers.push(AudioFormat::opus_48k());
    }
    offers
}

/// Builds the server's Init message.
pub fn encode_init(offers: &[AudioFormat]) -> Bytes {
    let mut buf = StreamBuf::with_capacity(8 + offers.len() * 10);
    buf.write_u16_le(AUDIO_OP_INIT);
    buf.write_u16_le(AUDIO_PROTO_VERSION);
    buf.write_u16_le(offers.len() as u16);
    for offer in offers {
        buf.write_u16_le(offer.encoding);
        buf.write_u16_le(offer.channels);
        buf.write_u32_le(offer.samples_per_sec);
        buf.write_u16_le(offer.bits_per_sample);
    }
    buf.into_bytes()
}

/// Parses the server's Init message into the offered formats.
pub fn decode_init(payload: &[u8]) -> Result<Vec<AudioFormat>> {
    let mut cur = StreamRef::new(payload);
    let op = cur.read_u16_le()?;
    if op != AUDIO_OP_INIT {
        return Err(LtsmError::Protocol(format!("bad audio init op 0x{op:04x}")));
    }
    let version = cur.read_u16_le()?;
    if version != AUDIO_PROTO_VERSION {
        return Err(LtsmError::Protocol(format!(
            "unsupported audio protocol version {version}"
        )));
    }
    let count = cur.read_u16_le()?;
    let mut offers = Vec::with_capacity(count as usize);
    for _ in 0..count {
        offers.push(AudioFormat {
            encoding: cur.read_u16_le()?,
            channels: cur.read_u16_le()?,
            samples_per_sec: cur.read_u32_le()?,
            bits_per_sample: cur.read_u16_le()?,
        });
    }
    Ok(offers)
}

/// Builds the client's Init reply: `{Init, 0, ver, chosen}` on success,
/// `{Init, errLen, errBytes}` on failure.
pub fn encode_init_reply(choice: std::result::Result<u16, &str>) -> Bytes {
    let mut buf = StreamBuf::with_capacity(16);
    buf.write_u16_le(AUDIO_OP_INIT);
    match choice {
        Ok(encoding) => {
            buf.write_u16_le(0);
            buf.write_u16_le(AUDIO_PROTO_VERSION);
            buf.write_u16_le(encoding);
        }
        Err(reason) => {
            buf.write_u16_le(reason.len() as u16);
            buf.write_bytes(reason.as_bytes());
        }
    }
    buf.into_bytes()
}

/// Parses the client reply; `Ok(encoding)` or the peer's error text.
pub fn decode_init_reply(payload: &[u8]) -> Result<u16> {
    let mut cur = StreamRef::new(payload);
    let op = cur.read_u16_le()?;
    if op != AUDIO_OP_INIT {
        return Err(LtsmError::Protocol(format!("bad audio reply op 0x{op:04x}")));
    }
    let err_len = cur.read_u16_le()?;
    if err_len != 0 {
        let text = String::from_utf8_lossy(cur.read_bytes(err_len as usize)?).into_owned();
        return Err(LtsmError::Audio(text));
    }
    let _version = cur.read_u16_le()?;
    cur.read_u16_le()
}

/// One parsed stream message.
#[derive(Debug, PartialEq, Eq)]
pub enum AudioMessage {
    Data(Vec<u8>),
    /// That many bytes of zeros on the sink.
    Silent(u32),
}

/// Parses a Data/Silent stream message.
pub fn decode_message(payload: &[u8]) -> Result<AudioMessage> {
    let mut cur = StreamRef::new(payload);
    let op = cur.read_u16_le()?;
    let len = cur.read_u32_le()?;
    match op {
        AUDIO_OP_DATA => Ok(AudioMessage::Data(cur.read_bytes(len as usize)?.to_vec())),
        AUDIO_OP_SILENT => Ok(AudioMessage::Silent(len)),
        other => Err(LtsmError::Protocol(format!("bad audio op 0x{other:04x}"))),
    }
}

fn encode_data(data: &[u8]) -> Bytes {
    let mut buf = StreamBuf::with_capacity(6 + data.len());
    buf.write_u16_le(AUDIO_OP_DATA);
    buf.write_u32_le(data.len() as u32);
    buf.write_bytes(data);
    buf.into_bytes()
}

fn encode_silent(len: u32) -> Bytes {
    let mut buf = StreamBuf::with_capacity(6);
    buf.write_u16_le(AUDIO_OP_SILENT);
    buf.write_u32_le(len);
    buf.into_bytes()
}

/// OPUS encoder wrapper carrying a residue buffer so arbitrary capture
/// lengths realign to legal frame sizes.
#[cfg(feature = "opus")]
pub struct OpusEncoder {
    encoder: opus::Encoder,
    residue: Vec<u8>,
    frame_bytes: usize,
    out: Vec<u8>,
}

#[cfg(feature = "opus")]
impl OpusEncoder {
    pub fn new(format: &AudioFormat) -> Result<Self> {
        let channels = match format.channels {
            1 => opus::Channels::Mono,
            2 => opus::Channels::Stereo,
            n => return Err(LtsmError::Audio(format!("unsupported channel count {n}"))),
        };
        let encoder = opus::Encoder::new(
            format.samples_per_sec,
            channels,
            opus::Application::Audio,
        )
        .map_err(|e| LtsmError::Audio(format!("opus encoder: {e}")))?;
        Ok(Self {
            encoder,
            residue: Vec::with_capacity(16 * 1024),
            frame_bytes: OPUS_FRAME_SAMPLES as usize * format.sample_bytes(),
            out: vec![0u8; 4096],
        })
    }

    /// Buffers input; returns one encoded packet per complete frame.
    pub fn encode(&mut self, input: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.residue.extend_from_slice(input);
        let mut packets = Vec::new();
        while self.residue.len() >= self.frame_bytes {
            let frame: Vec<i16> = self.residue[..self.frame_bytes]
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect();
            let n = self
                .encoder
                .encode(&frame, &mut self.out)
                .map_err(|e| LtsmError::Audio(format!("opus encode: {e}")))?;
            packets.push(self.out[..n].to_vec());
            self.residue.drain(..self.frame_bytes);
        }
        Ok(packets)
    }
}

/// Server-side handshake over an open audio channel: offer, await the
/// client's pick, return the negotiated format.
pub async fn server_negotiate(
    writer: &ChannelWriter,
    inbound: &mut mpsc::Receiver<Bytes>,
) -> Result<AudioFormat> {
    let offers = server_offers();
    writer.push(encode_init(&offers)).await?;
    let reply = inbound.recv().await.ok_or(LtsmError::Closed)?;
    let encoding = decode_init_reply(&reply)?;
    offers
        .into_iter()
        .find(|offer| offer.encoding == encoding)
        .ok_or_else(|| LtsmError::Audio(format!("client chose unoffered encoding {encoding}")))
}

/// Capture loop: read fragments from the source, emit Silent for silent
/// frames and Data (codec-wrapped when OPUS) otherwise. Returns when the
/// source ends or the channel closes.
pub async fn run_capture<Src: AudioSource>(
    mut source: Src,
    writer: ChannelWriter,
    format: AudioFormat,
) -> Result<()> {
    source.open(&format)?;

    #[cfg(feature = "opus")]
    let mut opus = if format.encoding == ENCODING_OPUS {
        Some(OpusEncoder::new(&format)?)
    } else {
        None
    };
    #[cfg(not(feature = "opus"))]
    if format.encoding == ENCODING_OPUS {
        return Err(LtsmError::Unsupported("opus codec"));
    }

    let mut frame = vec![0u8; format.fragment_bytes()];
    loop {
        let n = match source.read(&mut frame) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                // Frame-local failure: drop and carry on.
                log::warn!("audio capture: {err}, frame dropped");
                continue;
            }
        };
        let chunk = &frame[..n];

        if is_silent(chunk) {
            writer.push(encode_silent(n as u32)).await?;
            continue;
        }

        #[cfg(feature = "opus")]
        if let Some(codec) = opus.as_mut() {
            match codec.encode(chunk) {
                Ok(packets) => {
                    for packet in packets {
                        writer.push(encode_data(&packet)).await?;
                    }
                }
                Err(err) => log::warn!("audio capture: {err}, frame dropped"),
            }
            continue;
        }

        writer.push(encode_data(chunk)).await?;
    }

    source.close();
    Ok(())
}

/// Playback loop on the viewer: append Data to the sink, synthesize
/// zeros for Silent. Sink errors drop the frame and keep going.
pub async fn run_playback<S: AudioSink>(
    mut sink: S,
    format: AudioFormat,
    mut inbound: mpsc::Receiver<Bytes>,
) -> Result<()> {
    sink.open(&format)?;
    while let Some(payload) = inbound.recv().await {
        match decode_message(&payload) {
            Ok(AudioMessage::Data(data)) => {
                if let Err(err) = sink.write(&data) {
                    log::warn!("audio playback: {err}, frame dropped");
                }
            }
            Ok(AudioMessage::Silent(len)) => {
                let zeros = vec![0u8; len as usize];
                if let Err(err) = sink.write(&zeros) {
                    log::warn!("audio playback: {err}, frame dropped");
                }
            }
            Err(err) => {
                log::warn!("audio playback: bad message ({err}), dropped");
            }
        }
    }
    sink.drain()?;
    sink.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_round_trip() {
        let offers = vec![AudioFormat::pcm_cd(), AudioFormat::opus_48k()];
        let wire = encode_init(&offers);
        assert_eq!(decode_init(&wire).unwrap(), offers);
    }

    #[test]
    fn init_reply_shapes() {
        let ok = encode_init_reply(Ok(ENCODING_PCM));
        assert_eq!(decode_init_reply(&ok).unwrap(), ENCODING_PCM);

        let err = encode_init_reply(Err("no common encoding"));
        match decode_init_reply(&err) {
            Err(LtsmError::Audio(text)) => assert_eq!(text, "no common encoding"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn preference_order_prefers_pcm_without_opus_build() {
        let offered = vec![AudioFormat::aac(), AudioFormat::pcm_cd(), AudioFormat::opus_48k()];
        let chosen = choose_encoding(&offered).unwrap();
        if opus_available() {
            assert_eq!(chosen.encoding, ENCODING_OPUS);
        } else {
            assert_eq!(chosen.encoding, ENCODING_PCM);
        }
    }

    #[test]
    fn silence_detection() {
        assert!(is_silent(&[0u8; 1920]));
        let mut noisy = [0u8; 1920];
        noisy[7] = 1;
        assert!(!is_silent(&noisy));
    }

    fn test_writer() -> (ChannelWriter, mpsc::Receiver<crate::channel::ChannelFrame>) {
        let (tx, rx) = mpsc::channel(1024);
        (ChannelWriter::new(1, tx), rx)
    }

    #[tokio::test]
    async fn hundred_silent_frames_yield_silent_messages_only() {
        let format = AudioFormat::pcm_cd();
        let frames: Vec<Vec<u8>> = (0..100).map(|_| vec![0u8; 1920]).collect();
        let source = MemorySource::new(frames);

        let (writer, mut out) = test_writer();
        run_capture(source, writer, format).await.unwrap();

        let mut silents = 0;
        let mut datas = 0;
        let mut wire_bytes = 0;
        while let Ok(frame) = out.try_recv() {
            wire_bytes += frame.payload.len();
            match decode_message(&frame.payload).unwrap() {
                AudioMessage::Silent(len) => {
                    assert_eq!(len, 1920);
                    silents += 1;
                }
                AudioMessage::Data(_) => datas += 1,
            }
        }
        assert_eq!(silents, 100);
        assert_eq!(datas, 0);
        // The silence optimization keeps at least 95% off the wire.
        assert!(wire_bytes * 20 <= 100 * 1920);
    }

    #[tokio::test]
    async fn nonsilent_frames_yield_data_messages() {
        let format = AudioFormat::pcm_cd();
        let mut state = 0x1234_5678_9ABC_DEF0u64;
        let frames: Vec<Vec<u8>> = (0..100)
            .map(|_| {
                (0..1024)
                    .map(|_| {
                        state ^= state << 13;
                        state ^= state >> 7;
                        state ^= state << 17;
                        (state & 0xFF) as u8 | 1
                    })
                    .collect()
            })
            .collect();
        let source = MemorySource::new(frames);

        let (writer, mut out) = test_writer();
        run_capture(source, writer, format).await.unwrap();

        let mut datas = 0;
        while let Ok(frame) = out.try_recv() {
            match decode_message(&frame.payload).unwrap() {
                AudioMessage::Data(data) => {
                    assert_eq!(data.len(), 1024);
                    datas += 1;
                }
                AudioMessage::Silent(_) => panic!("no silent frames expected"),
            }
        }
        assert_eq!(datas, 100);
    }

    #[tokio::test]
    async fn playback_expands_silent_frames() {
        let format = AudioFormat::pcm_cd();
        let (tx, rx) = mpsc::channel(8);
        tx.send(encode_data(&[1, 2, 3, 4])).await.unwrap();
        tx.send(encode_silent(8)).await.unwrap();
        drop(tx);

        let mut sink = MemorySink::default();
        // Run to completion, then inspect the sink.
        let sink_ref = &mut sink;
        run_playback_collect(sink_ref, format, rx).await;
        assert_eq!(sink.data, vec![1, 2, 3, 4, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    async fn run_playback_collect(sink: &mut MemorySink, format: AudioFormat, mut rx: mpsc::Receiver<Bytes>) {
        sink.open(&format).unwrap();
        while let Some(payload) = rx.recv().await {
            match decode_message(&payload).unwrap() {
                AudioMessage::Data(data) => sink.write(&data).unwrap(),
                AudioMessage::Silent(len) => sink.write(&vec![0u8; len as usize]).unwrap(),
            }
        }
    }

    #[cfg(feature = "opus")]
    #[tokio::test]
    async fn opus_residue_realignment() {
        let format = AudioFormat::opus_48k();
        let mut codec = OpusEncoder::new(&format).unwrap();
        // 1000 bytes is not a legal frame; no packet yet.
        assert!(codec.encode(&vec![1u8; 1000]).unwrap().is_empty());
        // Completing the 1920-byte frame yields exactly one packet.
        let packets = codec.encode(&vec![1u8; 920]).unwrap();
        assert_eq!(packets.len(), 1);
        assert!(!packets[0].is_empty());
    }
}
