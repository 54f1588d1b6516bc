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

//! Server-side RFB session: handshake, security (including the VeNCrypt
//! TLS switch), the ready loop, framebuffer updates and input handling.
//!
//! # Protocol flow
//!
//! 1. Version banner exchange (3.3 / 3.7 / 3.8).
//! 2. Security negotiation; VeNCrypt upgrades the transport to TLS
//!    exactly once mid-handshake.
//! 3. ClientInit / ServerInit.
//! 4. Ready loop: client messages, display polling, channel traffic.
//!
//! The session task is the sole socket writer. Encoder workers prepare
//! strips concurrently; payloads are finished and written here in slot
//! order, so at most one FramebufferUpdate is ever on the wire.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::audio;
use crate::auth;
use crate::channel::{ChannelFrame, ChannelKind, ChannelMux, ChannelSpeed, MuxEvent};
use crate::display::DisplayAdapter;
use crate::encoding::{self, EncodeOptions, ZlibStreams};
use crate::error::{LtsmError, Result};
use crate::framebuffer::{FrameView, Region};
use crate::keymap::Keymap;
use crate::pcsc;
use crate::protocol::*;
use crate::stream::{FramedStream, Transport};
use crate::tls::{self, SecurityInfo};

/// Display poll cadence in the ready loop.
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Upper bound on clipboard payloads, guarding allocation.
const MAX_CUT_TEXT: usize = 10 * 1024 * 1024;

/// Per-session configuration, handed down by the supervisor.
#[derive(Default)]
pub struct SessionConfig {
    pub desktop_name: String,
    pub security: SecurityInfo,
    /// Operator's encoding preference list (lower-case names).
    pub preferred_encodings: Vec<String>,
    /// Operator's encoding blacklist (`raw` is stripped: it must remain
    /// as the fallback).
    pub blacklist_encodings: Vec<String>,
    /// Encoder worker pool size; clamped to 1..=available parallelism.
    pub encoding_threads: usize,
    pub keymap: Keymap,
    /// Offer LTSM channels when the client advertises the extension.
    pub enable_channels: bool,
    /// Redirect host audio to the viewer over a channel.
    pub audio_source: Option<Box<dyn audio::AudioSource>>,
    /// Serve a PC/SC stub at this socket path over a channel.
    pub pcsc_socket: Option<std::path::PathBuf>,
}

impl SessionConfig {
    fn sanitize(&mut self) {
        self.blacklist_encodings
            .retain(|name| !name.eq_ignore_ascii_case("raw"));
        let max = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        if self.encoding_threads == 0 {
            self.encoding_threads = 2;
        }
        if self.encoding_threads > max {
            log::warn!("encoding threads clamped to hardware concurrency {max}");
            self.encoding_threads = max;
        }
    }
}

/// Pseudo-encoding driven feature switches.
#[derive(Debug, Default, Clone, Copy)]
struct Features {
    desktop_size: bool,
    ext_desktop_size: bool,
    continuous_updates: bool,
    cursor: bool,
    ext_clipboard: bool,
    last_rect: bool,
    ltsm: bool,
}

/// One connected viewer.
pub struct Session<D: DisplayAdapter> {
    id: usize,
    stream: FramedStream<Transport>,
    display: D,
    config: SessionConfig,
    version: RfbVersion,

    server_format: PixelFormat,
    client_format: PixelFormat,
    client_encodings: Vec<i32>,
    selected_encoding: i32,
    features: Features,

    client_region: Region,
    update_requested: bool,
    full_update_sent: bool,
    in_flight: bool,
    continuous_region: Option<Region>,
    resize_mode: DesktopResizeMode,
    resize_initiator: u16,
    screens: Vec<Screen>,

    pressed_buttons: u8,
    quality: u8,
    compression: u8,
    zstreams: ZlibStreams,

    mux: ChannelMux,
    mux_rx: mpsc::Receiver<ChannelFrame>,
    pending_audio: Option<(u8, mpsc::Receiver<Bytes>)>,
    pending_pcsc: Option<(u8, mpsc::Receiver<Bytes>)>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    running: bool,
}

impl<D: DisplayAdapter> Session<D> {
    /// Performs the complete RFB bootstrap on a fresh TCP connection and
    /// returns the session in READY state.
    pub async fn handshake(
        id: usize,
        tcp: TcpStream,
        display: D,
        mut config: SessionConfig,
    ) -> Result<Self> {
        config.sanitize();
        tcp.set_nodelay(true)?;
        let mut stream = FramedStream::new(Transport::Plain(tcp));

        // Version exchange.
        stream.send_all(PROTOCOL_VERSION.as_bytes());
        stream.flush().await?;
        let banner = stream.recv_exact(12).await?;
        let version = RfbVersion::from_banner(&banner)?;
        log::debug!("session {id}: client version {:?}", version);

        // Security negotiation; may switch the transport to TLS.
        let mut stream = negotiate_security(id, stream, version, &config.security).await?;

        // ClientInit: the shared flag is advisory here, every session is
        // its own connection.
        let shared = stream.recv_u8().await?;
        log::debug!("session {id}: client shared flag {shared}");

        let server_format = display.pixel_format();
        let (width, height) = display.size();
        let init = ServerInit {
            width,
            height,
            pixel_format: server_format.clone(),
            name: config.desktop_name.clone(),
        };
        let mut buf = BytesMut::new();
        init.write_to(&mut buf);
        stream.send_all(&buf);
        stream.flush().await?;
        log::info!("session {id}: handshake complete, {width}x{height}");

        let (mux, mux_rx) = ChannelMux::new();
        Ok(Self {
            id,
            stream,
            display,
            config,
            version,
            client_format: server_format.clone(),
            server_format,
            client_encodings: Vec::new(),
            selected_encoding: ENCODING_RAW,
            features: Features::default(),
            client_region: Region::with_size(width, height),
            update_requested: false,
            full_update_sent: false,
            in_flight: false,
            continuous_region: None,
            resize_mode: DesktopResizeMode::Undefined,
            resize_initiator: 0,
            screens: vec![Screen {
                id: 0,
                x: 0,
                y: 0,
                width,
                height,
                flags: 0,
            }],
            pressed_buttons: 0,
            quality: 80,
            compression: 6,
            zstreams: ZlibStreams::default(),
            mux,
            mux_rx,
            pending_audio: None,
            pending_pcsc: None,
            tasks: Vec::new(),
            running: true,
        })
    }

    /// Session id assigned by the supervisor.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The peer's negotiated protocol version.
    pub fn version(&self) -> RfbVersion {
        self.version
    }

    /// The ready loop: runs until the peer disconnects or a fatal
    /// protocol error occurs.
    pub async fn run(&mut self) -> Result<()> {
        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut damage = Region::default();

        let result = loop {
            if !self.running {
                break Ok(());
            }
            tokio::select! {
                byte = self.stream.recv_u8() => {
                    match byte {
                        Ok(msg) => {
                            if let Err(err) = self.handle_message(msg).await {
                                break Err(err);
                            }
                        }
                        Err(err) => break Err(err),
                    }
                }
                frame = self.mux_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if let Err(err) = self.write_channel_frame(&frame).await {
                                break Err(err);
                            }
                        }
                        None => break Ok(()),
                    }
                }
                _ = poll.tick() => {
                    if let Err(err) = self.poll_display(&mut damage).await {
                        break Err(err);
                    }
                }
            }
        };

        self.shutdown().await;
        match result {
            Err(LtsmError::Closed) => {
                log::info!("session {}: peer disconnected", self.id);
                Ok(())
            }
            other => other,
        }
    }

    /// Drains channel state and worker tasks at session end.
    async fn shutdown(&mut self) {
        self.mux.shutdown();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    async fn handle_message(&mut self, msg_type: u8) -> Result<()> {
        match msg_type {
            CLIENT_SET_PIXEL_FORMAT => self.on_set_pixel_format().await,
            CLIENT_SET_ENCODINGS => self.on_set_encodings().await,
            CLIENT_FB_UPDATE_REQUEST => self.on_update_request().await,
            CLIENT_KEY_EVENT => self.on_key_event().await,
            CLIENT_POINTER_EVENT => self.on_pointer_event().await,
            CLIENT_CUT_TEXT => self.on_cut_text().await,
            CLIENT_ENABLE_CONTINUOUS_UPDATES => self.on_continuous_updates().await,
            CLIENT_SET_DESKTOP_SIZE => self.on_set_desktop_size().await,
            LTSM_RANGE_FIRST..=LTSM_RANGE_LAST => self.on_ltsm_message(msg_type).await,
            other => Err(LtsmError::Protocol(format!(
                "unknown client message 0x{other:02x}"
            ))),
        }
    }

    async fn on_set_pixel_format(&mut self) -> Result<()> {
        self.stream.recv_skip(3).await?;
        let raw = self.stream.recv_exact(16).await?;
        let mut buf = BytesMut::from(&raw[..]);
        let format = PixelFormat::from_bytes(&mut buf)?;

        if !format.is_valid() || format.true_colour == 0 {
            return Err(LtsmError::Protocol(format!(
                "unsupported pixel format: bpp {}, depth {}, truecolour {}",
                format.bits_per_pixel, format.depth, format.true_colour
            )));
        }
        log::info!(
            "session {}: client format {}bpp depth {} R{}<<{} G{}<<{} B{}<<{}",
            self.id,
            format.bits_per_pixel,
            format.depth,
            format.red_max,
            format.red_shift,
            format.green_max,
            format.green_shift,
            format.blue_max,
            format.blue_shift
        );
        self.client_format = format;
        // Format change invalidates what the client has on screen.
        self.full_update_sent = false;
        Ok(())
    }

    async fn on_set_encodings(&mut self) -> Result<()> {
        self.stream.recv_skip(1).await?;
        let count = self.stream.recv_u16_be().await? as usize;
        let mut encodings = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            encodings.push(self.stream.recv_i32_be().await?);
        }
        log::info!("session {}: {count} encodings offered", self.id);

        for &enc in &encodings {
            match enc {
                ENCODING_DESKTOP_SIZE => self.features.desktop_size = true,
                ENCODING_EXT_DESKTOP_SIZE => self.features.ext_desktop_size = true,
                ENCODING_CONTINUOUS_UPDATES => self.features.continuous_updates = true,
                ENCODING_CURSOR | ENCODING_LTSM_CURSOR => self.features.cursor = true,
                ENCODING_EXT_CLIPBOARD => self.features.ext_clipboard = true,
                ENCODING_LAST_RECT => self.features.last_rect = true,
                ENCODING_LTSM => self.features.ltsm = true,
                _ => {}
            }
        }

        if !encodings.is_empty() {
            self.client_encodings = encodings;
        }
        self.selected_encoding = encoding::select_encoding(
            &self.client_encodings,
            &self.config.preferred_encodings,
            &self.config.blacklist_encodings,
            self.selected_encoding,
            self.client_format.true_colour != 0,
        );
        log::info!(
            "session {}: selected encoding {}",
            self.id,
            encoding_name(self.selected_encoding)
        );
        if self.features.cursor {
            log::debug!("session {}: client accepts cursor shapes", self.id);
        }

        if self.features.ext_clipboard {
            self.send_clipboard_caps().await?;
        }
        if self.features.ltsm && self.config.enable_channels {
            self.open_channels().await?;
        }
        Ok(())
    }

    async fn on_update_request(&mut self) -> Result<()> {
        let incremental = self.stream.recv_u8().await? != 0;
        let x = self.stream.recv_u16_be().await?;
        let y = self.stream.recv_u16_be().await?;
        let width = self.stream.recv_u16_be().await?;
        let height = self.stream.recv_u16_be().await?;

        let server_region = self.display.region();
        let requested = Region::new(x, y, width, height);

        if !incremental || !self.full_update_sent {
            // Full refresh; also the fallback before any full update.
            self.client_region = server_region;
            if self.resize_mode == DesktopResizeMode::Undefined && self.features.ext_desktop_size {
                // Advertise the current geometry once the extension is
                // negotiated.
                self.resize_initiator = 0;
                self.resize_mode = DesktopResizeMode::Success;
                self.send_resize_ack(0, self.display.size()).await?;
            }
            self.update_requested = true;
            self.send_update(server_region).await?;
        } else {
            self.client_region = requested
                .intersect(&server_region)
                .unwrap_or(server_region);
            self.update_requested = true;
        }
        Ok(())
    }

    async fn on_key_event(&mut self) -> Result<()> {
        let pressed = self.stream.recv_u8().await? != 0;
        self.stream.recv_skip(2).await?;
        let keysym = self.stream.recv_u32_be().await?;
        for keycode in self.config.keymap.translate(keysym) {
            self.display.inject_key(keycode, pressed);
        }
        Ok(())
    }

    async fn on_pointer_event(&mut self) -> Result<()> {
        let mask = self.stream.recv_u8().await?;
        let x = self.stream.recv_u16_be().await?;
        let y = self.stream.recv_u16_be().await?;

        if self.pressed_buttons ^ mask != 0 {
            for button in 0..8u8 {
                let bit = 1 << button;
                if mask & bit != 0 && self.pressed_buttons & bit == 0 {
                    self.display.inject_button(button + 1, x, y, true);
                    self.pressed_buttons |= bit;
                } else if mask & bit == 0 && self.pressed_buttons & bit != 0 {
                    self.display.inject_button(button + 1, x, y, false);
                    self.pressed_buttons &= !bit;
                }
            }
        } else {
            self.display.inject_motion(x, y);
        }
        Ok(())
    }

    async fn on_cut_text(&mut self) -> Result<()> {
        self.stream.recv_skip(3).await?;
        let length = self.stream.recv_i32_be().await?;

        if length >= 0 {
            // Plain UTF-8 buffer, the pre-extension fallback.
            let length = length as usize;
            if length > MAX_CUT_TEXT {
                return Err(LtsmError::Protocol(format!(
                    "cut text of {length} bytes exceeds limit"
                )));
            }
            let text = self.stream.recv_exact(length).await?;
            self.display.set_clipboard(&text);
            return Ok(());
        }

        // Negative length marks an extended clipboard message.
        let length = length.unsigned_abs() as usize;
        if length < 4 || length > MAX_CUT_TEXT {
            return Err(LtsmError::Protocol("bad extended clipboard length".into()));
        }
        let payload = self.stream.recv_exact(length).await?;
        let flags = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let body = &payload[4..];
        self.on_ext_clipboard(flags, body).await
    }

    async fn on_ext_clipboard(&mut self, flags: u32, body: &[u8]) -> Result<()> {
        if flags & CLIPBOARD_OP_CAPS != 0 {
            log::debug!("session {}: client clipboard caps 0x{flags:08x}", self.id);
            return Ok(());
        }
        if flags & CLIPBOARD_OP_NOTIFY != 0 {
            // Peer announces new content; pull it instead of trusting a
            // push.
            return self
                .send_ext_clipboard(CLIPBOARD_OP_REQUEST | CLIPBOARD_TYPE_TEXT, &[])
                .await;
        }
        if flags & CLIPBOARD_OP_REQUEST != 0 {
            let text = self.display.get_clipboard().unwrap_or_default();
            let provided = compress_clipboard(&text)?;
            return self
                .send_ext_clipboard(CLIPBOARD_OP_PROVIDE | CLIPBOARD_TYPE_TEXT, &provided)
                .await;
        }
        if flags & CLIPBOARD_OP_PROVIDE != 0 {
            let text = decompress_clipboard(body)?;
            self.display.set_clipboard(&text);
            return Ok(());
        }
        log::debug!("session {}: clipboard flags 0x{flags:08x} ignored", self.id);
        Ok(())
    }

    async fn send_clipboard_caps(&mut self) -> Result<()> {
        // Text only, with request/notify/provide operations.
        let caps = CLIPBOARD_OP_CAPS
            | CLIPBOARD_TYPE_TEXT
            | CLIPBOARD_OP_REQUEST
            | CLIPBOARD_OP_NOTIFY
            | CLIPBOARD_OP_PROVIDE;
        let limit = (MAX_CUT_TEXT as u32).to_be_bytes();
        self.send_ext_clipboard(caps, &limit).await
    }

    async fn send_ext_clipboard(&mut self, flags: u32, body: &[u8]) -> Result<()> {
        let total = 4 + body.len();
        self.stream.send_u8(SERVER_CUT_TEXT).send_zeros(3);
        self.stream.send_i32_be(-(total as i32));
        self.stream.send_u32_be(flags);
        self.stream.send_all(body);
        self.stream.flush().await
    }

    async fn on_continuous_updates(&mut self) -> Result<()> {
        let enable = self.stream.recv_u8().await? != 0;
        let x = self.stream.recv_u16_be().await?;
        let y = self.stream.recv_u16_be().await?;
        let width = self.stream.recv_u16_be().await?;
        let height = self.stream.recv_u16_be().await?;

        if !self.features.continuous_updates {
            return Err(LtsmError::Protocol(
                "continuous updates without negotiation".into(),
            ));
        }
        if enable {
            self.continuous_region = Some(Region::new(x, y, width, height));
            log::info!(
                "session {}: continuous updates on [{x},{y} {width}x{height}]",
                self.id
            );
        } else {
            self.continuous_region = None;
            // Confirm the extension is understood.
            self.stream.send_u8(SERVER_END_CONTINUOUS_UPDATES);
            self.stream.flush().await?;
        }
        Ok(())
    }

    async fn on_set_desktop_size(&mut self) -> Result<()> {
        self.stream.recv_skip(1).await?;
        let width = self.stream.recv_u16_be().await?;
        let height = self.stream.recv_u16_be().await?;
        let screen_count = self.stream.recv_u8().await?;
        self.stream.recv_skip(1).await?;

        let mut screens = Vec::with_capacity(screen_count as usize);
        for _ in 0..screen_count {
            screens.push(Screen {
                id: self.stream.recv_u32_be().await?,
                x: self.stream.recv_u16_be().await?,
                y: self.stream.recv_u16_be().await?,
                width: self.stream.recv_u16_be().await?,
                height: self.stream.recv_u16_be().await?,
                flags: self.stream.recv_u32_be().await?,
            });
        }
        log::info!(
            "session {}: set desktop size {width}x{height}, {screen_count} screens",
            self.id
        );

        self.resize_initiator = 1;
        if width == 0 || height == 0 {
            // Invalid geometry: status rectangle with error=1, no
            // geometry change.
            return self.send_resize_ack(1, self.display.size()).await;
        }
        if !self.display.apply_resize(width, height) {
            return self.send_resize_ack(3, self.display.size()).await;
        }

        self.screens = screens;
        self.client_region = Region::with_size(width, height);
        self.resize_mode = DesktopResizeMode::Success;
        self.send_resize_ack(0, (width, height)).await?;
        // The next update must cover the whole new region.
        self.full_update_sent = false;
        self.update_requested = true;
        self.send_update(Region::with_size(width, height)).await
    }

    /// ExtendedDesktopSize status rectangle: x carries the initiator,
    /// y the error code, the rectangle size is the (new) geometry. Peers
    /// with only the legacy DesktopSize pseudo-encoding get the bare
    /// geometry rectangle instead.
    async fn send_resize_ack(&mut self, error: u16, size: (u16, u16)) -> Result<()> {
        if !self.features.ext_desktop_size {
            if self.features.desktop_size && error == 0 {
                let mut buf = BytesMut::new();
                buf.extend_from_slice(&[SERVER_FB_UPDATE, 0]);
                buf.extend_from_slice(&1u16.to_be_bytes());
                Rectangle {
                    x: 0,
                    y: 0,
                    width: size.0,
                    height: size.1,
                    encoding: ENCODING_DESKTOP_SIZE,
                }
                .write_header(&mut buf);
                self.stream.send_all(&buf);
                self.stream.flush().await?;
            }
            return Ok(());
        }
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[SERVER_FB_UPDATE, 0]);
        buf.extend_from_slice(&1u16.to_be_bytes());
        let rect = Rectangle {
            x: self.resize_initiator,
            y: error,
            width: size.0,
            height: size.1,
            encoding: ENCODING_EXT_DESKTOP_SIZE,
        };
        rect.write_header(&mut buf);
        buf.extend_from_slice(&[self.screens.len() as u8, 0, 0, 0]);
        for screen in &self.screens {
            screen.write_to(&mut buf);
        }
        self.stream.send_all(&buf);
        self.stream.flush().await
    }

    async fn on_ltsm_message(&mut self, msg_type: u8) -> Result<()> {
        let channel_id = self.stream.recv_u8().await?;
        let length = self.stream.recv_u32_be().await? as usize;
        let payload = self.stream.recv_exact(length).await?;

        match self.mux.dispatch(msg_type, channel_id, payload).await? {
            Some(MuxEvent::Opened { id }) => self.on_channel_opened(id).await,
            Some(MuxEvent::OpenRequested { id, kind, .. }) => {
                // The server initiates every channel in this deployment.
                self.mux
                    .refuse(id, &format!("unsolicited {kind:?} channel"))
                    .await
            }
            Some(MuxEvent::Closed { id, reason }) => {
                log::info!("session {}: channel {id} closed: {reason}", self.id);
                Ok(())
            }
            Some(MuxEvent::System(message)) => {
                log::debug!("session {}: system message {message:?}", self.id);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Opens the redirection channels once the client negotiated LTSM.
    async fn open_channels(&mut self) -> Result<()> {
        if self.config.audio_source.is_some() && self.pending_audio.is_none() {
            let (id, inbound) = self.mux.open(ChannelKind::Audio, ChannelSpeed::Normal).await?;
            self.pending_audio = Some((id, inbound));
            log::info!("session {}: audio channel {id} offered", self.id);
        }
        if self.config.pcsc_socket.is_some() && self.pending_pcsc.is_none() {
            let (id, inbound) = self.mux.open(ChannelKind::Pcsc, ChannelSpeed::Fast).await?;
            self.pending_pcsc = Some((id, inbound));
            log::info!("session {}: pcsc channel {id} offered", self.id);
        }
        Ok(())
    }

    async fn on_channel_opened(&mut self, id: u8) -> Result<()> {
        if let Some((audio_id, inbound)) = self.pending_audio.take() {
            if audio_id == id {
                let writer = self
                    .mux
                    .writer(id)
                    .ok_or_else(|| LtsmError::Protocol("audio channel vanished".into()))?;
                let source = self
                    .config
                    .audio_source
                    .take()
                    .ok_or(LtsmError::Unsupported("audio source"))?;
                let session = self.id;
                self.tasks.push(tokio::spawn(async move {
                    let mut inbound = inbound;
                    match audio::server_negotiate(&writer, &mut inbound).await {
                        Ok(format) => {
                            log::info!(
                                "session {session}: audio format {:?} at {} Hz",
                                format.encoding,
                                format.samples_per_sec
                            );
                            if let Err(err) = audio::run_capture(source, writer, format).await {
                                log::warn!("session {session}: audio capture ended: {err}");
                            }
                        }
                        Err(err) => log::warn!("session {session}: audio negotiation: {err}"),
                    }
                }));
                return Ok(());
            }
            self.pending_audio = Some((audio_id, inbound));
        }

        if let Some((pcsc_id, inbound)) = self.pending_pcsc.take() {
            if pcsc_id == id {
                let writer = self
                    .mux
                    .writer(id)
                    .ok_or_else(|| LtsmError::Protocol("pcsc channel vanished".into()))?;
                let path = self
                    .config
                    .pcsc_socket
                    .clone()
                    .ok_or(LtsmError::Unsupported("pcsc socket"))?;
                let remote = std::sync::Arc::new(pcsc::remote::PcscRemote::new(writer, inbound));
                let shared = pcsc::PcscShared::new();
                let stub = std::sync::Arc::new(pcsc::stub::PcscStub::new(path, shared, remote));
                let session = self.id;
                self.tasks.push(tokio::spawn(async move {
                    if let Err(err) = stub.run().await {
                        log::warn!("session {session}: pcsc stub ended: {err}");
                    }
                }));
                return Ok(());
            }
            self.pending_pcsc = Some((pcsc_id, inbound));
        }

        log::debug!("session {}: ack for unknown channel {id}", self.id);
        Ok(())
    }

    async fn write_channel_frame(&mut self, frame: &ChannelFrame) -> Result<()> {
        self.stream
            .send_u8(frame.msg_type)
            .send_u8(frame.channel_id)
            .send_u32_be(frame.payload.len() as u32)
            .send_all(&frame.payload);
        self.stream.flush().await
    }

    /// Display poll: damage, resolution changes, bell, clipboard.
    async fn poll_display(&mut self, damage: &mut Region) -> Result<()> {
        if let Some((width, height)) = self.display.poll_resize() {
            if self.features.ext_desktop_size && self.resize_mode != DesktopResizeMode::Disabled {
                log::info!("session {}: host resized to {width}x{height}", self.id);
                self.resize_initiator = 0;
                self.screens = vec![Screen {
                    id: 0,
                    x: 0,
                    y: 0,
                    width,
                    height,
                    flags: 0,
                }];
                self.client_region = Region::with_size(width, height);
                self.resize_mode = DesktopResizeMode::Success;
                self.send_resize_ack(0, (width, height)).await?;
                self.full_update_sent = false;
                self.update_requested = true;
                *damage = Region::with_size(width, height);
            }
        }

        if self.display.ring() {
            self.stream.send_u8(SERVER_BELL);
            self.stream.flush().await?;
        }

        if let Some(text) = self.display.get_clipboard() {
            self.send_server_clipboard(&text).await?;
        }

        if let Some(fresh) = self.display.poll_damage() {
            *damage = damage.join(&fresh);
        }

        let continuous = self
            .continuous_region
            .and_then(|region| damage.intersect(&region));
        let wants_update = (self.update_requested && !damage.is_empty()) || continuous.is_some();

        if wants_update && !self.in_flight {
            let target = if self.update_requested {
                damage.intersect(&self.client_region)
            } else {
                continuous
            };
            if let Some(region) = target {
                self.send_update(region).await?;
                *damage = Region::default();
                self.update_requested = false;
            }
        }
        Ok(())
    }

    async fn send_server_clipboard(&mut self, text: &[u8]) -> Result<()> {
        if self.features.ext_clipboard {
            // Three-step flow: notify, let the client request.
            return self
                .send_ext_clipboard(CLIPBOARD_OP_NOTIFY | CLIPBOARD_TYPE_TEXT, &[])
                .await;
        }
        self.stream.send_u8(SERVER_CUT_TEXT).send_zeros(3);
        self.stream.send_u32_be(text.len() as u32);
        self.stream.send_all(text);
        self.stream.flush().await
    }

    /// Encodes and writes one FramebufferUpdate for the damage region.
    async fn send_update(&mut self, region: Region) -> Result<()> {
        let bounds = self.display.region();
        let Some(clipped) = region.align(4).intersect(&bounds) else {
            return Ok(());
        };

        self.in_flight = true;
        let result = self.send_update_inner(clipped).await;
        self.in_flight = false;
        if result.is_ok() {
            self.full_update_sent = true;
        }
        result
    }

    async fn send_update_inner(&mut self, region: Region) -> Result<()> {
        let strips = encoding::split_strips(region, self.config.encoding_threads, self.selected_encoding);
        if strips.is_empty() {
            return Ok(());
        }

        let opts = EncodeOptions {
            client_format: self.client_format.clone(),
            compression: self.compression,
            quality: self.quality,
        };

        // Parallel half: copy each strip out of the display and prepare
        // it on the worker pool. Results land in slot order.
        let mut workers = Vec::with_capacity(strips.len());
        for strip in &strips {
            let mut pixels = Vec::new();
            self.display.copy_region(*strip, &mut pixels)?;
            let format = self.server_format.clone();
            let opts = opts.clone();
            let strip = *strip;
            let encoding = self.selected_encoding;
            workers.push(tokio::task::spawn_blocking(move || {
                let pitch = strip.width as usize * format.bytes_per_pixel();
                let view = FrameView::new(Region::with_size(strip.width, strip.height), &format, &pixels, pitch)?;
                encoding::prepare_rect(encoding, &view, &opts)
            }));
        }

        // A LastRect terminator joins the count when negotiated.
        let rect_count = strips.len() + usize::from(self.features.last_rect);
        let mut header = BytesMut::new();
        header.extend_from_slice(&[SERVER_FB_UPDATE, 0]);
        header.extend_from_slice(&(rect_count as u16).to_be_bytes());
        self.stream.send_all(&header);

        // Serial half: finish and write strip payloads in order.
        for (strip, worker) in strips.iter().zip(workers) {
            let prepared = worker
                .await
                .map_err(|e| LtsmError::Encoding(format!("encoder worker: {e}")))??;
            let payload =
                encoding::finish_rect(self.selected_encoding, prepared, &mut self.zstreams, &opts)?;
            let mut rect_buf = BytesMut::with_capacity(12 + payload.len());
            Rectangle {
                x: strip.x,
                y: strip.y,
                width: strip.width,
                height: strip.height,
                encoding: self.selected_encoding,
            }
            .write_header(&mut rect_buf);
            rect_buf.extend_from_slice(&payload);
            self.stream.send_all(&rect_buf);
        }
        if self.features.last_rect {
            let mut rect_buf = BytesMut::with_capacity(12);
            Rectangle {
                x: 0,
                y: 0,
                width: 0,
                height: 0,
                encoding: ENCODING_LAST_RECT,
            }
            .write_header(&mut rect_buf);
            self.stream.send_all(&rect_buf);
        }
        self.stream.flush().await?;

        log::debug!(
            "session {}: update [{},{} {}x{}] in {} rects as {}",
            self.id,
            region.x,
            region.y,
            region.width,
            region.height,
            strips.len(),
            encoding_name(self.selected_encoding)
        );
        Ok(())
    }
}

/// Compresses clipboard text for an extended Provide message:
/// a fresh deflate stream over `{u32 BE length, bytes}`.
pub(crate) fn compress_clipboard(text: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(&(text.len() as u32).to_be_bytes())
        .and_then(|()| encoder.write_all(text))
        .and_then(|()| encoder.finish())
        .map_err(LtsmError::Io)
}

/// Inflates an extended Provide payload back to the text.
pub(crate) fn decompress_clipboard(body: &[u8]) -> Result<Vec<u8>> {
    use flate2::read::ZlibDecoder;
    use std::io::Read;

    let mut decoder = ZlibDecoder::new(body);
    let mut length = [0u8; 4];
    decoder.read_exact(&mut length).map_err(LtsmError::Io)?;
    let length = u32::from_be_bytes(length) as usize;
    if length > MAX_CUT_TEXT {
        return Err(LtsmError::Protocol("provided clipboard too large".into()));
    }
    let mut text = vec![0u8; length];
    decoder.read_exact(&mut text).map_err(LtsmError::Io)?;
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::{HeadlessDisplay, NullSurface};
    use crate::viewer::{Viewer, ViewerConfig};
    use tokio::net::TcpListener;

    async fn start_server(config: SessionConfig) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let display = HeadlessDisplay::new(1024, 768);
            match Session::handshake(1, tcp, display, config).await {
                Ok(mut session) => {
                    let _ = session.run().await;
                }
                Err(err) => log::debug!("test server handshake: {err}"),
            }
        });
        addr
    }

    fn open_config() -> SessionConfig {
        SessionConfig {
            desktop_name: "LTSM".into(),
            security: SecurityInfo {
                auth_none: true,
                auth_vencrypt: true,
                tls_anon: true,
                ..SecurityInfo::default()
            },
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn vencrypt_tls_handshake_reaches_ready() {
        // Scenario: banner, security 19, VeNCrypt 0.2, TLSNone=257, TLS,
        // SecurityResult 0, ClientInit, ServerInit.
        let addr = start_server(open_config()).await;

        let tcp = TcpStream::connect(addr).await.unwrap();
        let mut stream = FramedStream::new(Transport::Plain(tcp));

        let banner = stream.recv_exact(12).await.unwrap();
        assert_eq!(&banner[..], PROTOCOL_VERSION.as_bytes());
        stream.send_all(PROTOCOL_VERSION.as_bytes());
        stream.flush().await.unwrap();

        let count = stream.recv_u8().await.unwrap();
        let types = stream.recv_exact(count as usize).await.unwrap();
        assert!(types.contains(&SECURITY_TYPE_VENCRYPT));
        assert!(types.contains(&SECURITY_TYPE_NONE));
        stream.send_u8(SECURITY_TYPE_VENCRYPT);
        stream.flush().await.unwrap();

        // VeNCrypt version 0.2 both ways, then the accept byte.
        assert_eq!(stream.recv_u8().await.unwrap(), 0);
        assert_eq!(stream.recv_u8().await.unwrap(), 2);
        stream.send_u8(0).send_u8(2);
        stream.flush().await.unwrap();
        assert_eq!(stream.recv_u8().await.unwrap(), 0);

        // Sub-type list: one entry, TLSNone = 257.
        assert_eq!(stream.recv_u8().await.unwrap(), 1);
        assert_eq!(stream.recv_u32_be().await.unwrap(), VENCRYPT02_TLSNONE);
        stream.send_u32_be(VENCRYPT02_TLSNONE);
        stream.flush().await.unwrap();
        assert_eq!(stream.recv_u8().await.unwrap(), 1);

        // TLS switch.
        let connector = tls::make_connector(&SecurityInfo::default()).unwrap();
        let (transport, residue) = stream.into_parts();
        assert!(residue.is_empty());
        let transport = tls::connect(&connector, "127.0.0.1", transport)
            .await
            .unwrap();
        let mut stream = FramedStream::new(transport);

        assert_eq!(stream.recv_u32_be().await.unwrap(), SECURITY_RESULT_OK);

        stream.send_u8(1); // shared
        stream.flush().await.unwrap();
        let width = stream.recv_u16_be().await.unwrap();
        let height = stream.recv_u16_be().await.unwrap();
        assert_eq!((width, height), (1024, 768));
        let raw = stream.recv_exact(16).await.unwrap();
        let mut pf = BytesMut::from(&raw[..]);
        assert!(PixelFormat::from_bytes(&mut pf).unwrap().is_valid());
        let name_len = stream.recv_u32_be().await.unwrap() as usize;
        let name = stream.recv_exact(name_len).await.unwrap();
        assert_eq!(&name[..], b"LTSM");
    }

    #[tokio::test]
    async fn version_33_downgrade_dictates_security() {
        let addr = start_server(open_config()).await;

        let tcp = TcpStream::connect(addr).await.unwrap();
        let mut stream = FramedStream::new(Transport::Plain(tcp));
        let _banner = stream.recv_exact(12).await.unwrap();
        stream.send_all(b"RFB 003.003\n");
        stream.flush().await.unwrap();

        // 3.3: the server dictates one u32 type, no list, no result.
        assert_eq!(stream.recv_u32_be().await.unwrap(), SECURITY_TYPE_NONE as u32);
        stream.send_u8(1);
        stream.flush().await.unwrap();
        assert_eq!(stream.recv_u16_be().await.unwrap(), 1024);
    }

    #[tokio::test]
    async fn viewer_receives_initial_full_update() {
        let addr = start_server(open_config()).await;

        let config = ViewerConfig {
            host: "127.0.0.1".into(),
            port: addr.port(),
            enable_ltsm: false,
            ..ViewerConfig::default()
        };
        let mut viewer = Viewer::connect(config, NullSurface::default()).await.unwrap();
        assert_eq!(viewer.geometry(), (1024, 768));

        // The non-incremental request from connect() yields a full
        // update; clipboard caps and the geometry advert may precede it.
        while viewer.surface().presents == 0 {
            tokio::time::timeout(Duration::from_secs(2), viewer.step())
                .await
                .expect("no initial update")
                .unwrap();
        }
        assert!(viewer.surface().fb.is_some());
    }

    #[tokio::test]
    async fn desktop_resize_acks_then_full_update() {
        let addr = start_server(open_config()).await;

        let config = ViewerConfig {
            host: "127.0.0.1".into(),
            port: addr.port(),
            enable_ltsm: false,
            ..ViewerConfig::default()
        };
        let mut viewer = Viewer::connect(config, NullSurface::default()).await.unwrap();
        while viewer.surface().presents == 0 {
            tokio::time::timeout(Duration::from_secs(2), viewer.step())
                .await
                .expect("no initial update")
                .unwrap();
        }

        viewer.send_desktop_size(1280, 720).await.unwrap();
        // Ack rectangle with the new geometry, then the full update.
        while viewer.geometry() != (1280, 720) {
            tokio::time::timeout(Duration::from_secs(2), viewer.step())
                .await
                .expect("resize not acked")
                .unwrap();
        }
        tokio::time::timeout(Duration::from_secs(2), viewer.step())
            .await
            .expect("no full update after resize")
            .unwrap();
        assert!(viewer.surface().presents >= 2);
    }

    #[tokio::test]
    async fn vnc_auth_accepts_any_password_file_line() {
        let dir = std::env::temp_dir().join("ltsm-session-auth");
        std::fs::create_dir_all(&dir).unwrap();
        let passwd = dir.join("passwd");
        std::fs::write(&passwd, "alpha\nbeta\n").unwrap();

        let config = SessionConfig {
            desktop_name: "LTSM".into(),
            security: SecurityInfo {
                auth_vnc: true,
                passwd_file: Some(passwd.clone()),
                auth_vencrypt: false,
                ..SecurityInfo::default()
            },
            ..SessionConfig::default()
        };
        let addr = start_server(config).await;

        let viewer_config = ViewerConfig {
            host: "127.0.0.1".into(),
            port: addr.port(),
            password: Some("beta".into()),
            no_tls: true,
            enable_ltsm: false,
            ..ViewerConfig::default()
        };
        let viewer = Viewer::connect(viewer_config, NullSurface::default()).await;
        assert!(viewer.is_ok());
    }

    #[tokio::test]
    async fn vnc_auth_rejects_wrong_password() {
        let dir = std::env::temp_dir().join("ltsm-session-auth-bad");
        std::fs::create_dir_all(&dir).unwrap();
        let passwd = dir.join("passwd");
        std::fs::write(&passwd, "alpha\n").unwrap();

        let config = SessionConfig {
            desktop_name: "LTSM".into(),
            security: SecurityInfo {
                auth_vnc: true,
                passwd_file: Some(passwd.clone()),
                auth_vencrypt: false,
                ..SecurityInfo::default()
            },
            ..SessionConfig::default()
        };
        let addr = start_server(config).await;

        let viewer_config = ViewerConfig {
            host: "127.0.0.1".into(),
            port: addr.port(),
            password: Some("wrong".into()),
            no_tls: true,
            enable_ltsm: false,
            ..ViewerConfig::default()
        };
        match Viewer::connect(viewer_config, NullSurface::default()).await {
            Err(LtsmError::Protocol(reason)) => assert!(reason.contains("password")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connect should have failed"),
        }
    }

    #[test]
    fn clipboard_compression_round_trip() {
        let text = b"the quick brown fox".repeat(20);
        let packed = compress_clipboard(&text).unwrap();
        assert!(packed.len() < text.len());
        assert_eq!(decompress_clipboard(&packed).unwrap(), text);
    }
}

/// Runs the security phase, upgrading to TLS for VeNCrypt. Returns the
/// (possibly re-wrapped) stream ready for ClientInit.
async fn negotiate_security(
    id: usize,
    mut stream: FramedStream<Transport>,
    version: RfbVersion,
    security: &SecurityInfo,
) -> Result<FramedStream<Transport>> {
    let offer_vnc = security.passwd_file.is_some();
    let offer_vencrypt = security.auth_vencrypt;

    let chosen = match version {
        RfbVersion::V33 => {
            // 3.3: no list, the server dictates one u32 type.
            let dictated = if offer_vnc {
                SECURITY_TYPE_VNC
            } else {
                SECURITY_TYPE_NONE
            };
            stream.send_u32_be(dictated as u32);
            stream.flush().await?;
            dictated
        }
        _ => {
            let mut types = Vec::new();
            if offer_vencrypt {
                types.push(SECURITY_TYPE_VENCRYPT);
            }
            if offer_vnc {
                types.push(SECURITY_TYPE_VNC);
            }
            if security.auth_none || !offer_vnc {
                types.push(SECURITY_TYPE_NONE);
            }
            stream.send_u8(types.len() as u8);
            for t in &types {
                stream.send_u8(*t);
            }
            stream.flush().await?;

            let choice = stream.recv_u8().await?;
            if !types.contains(&choice) {
                let reason = "no matching security types";
                stream.send_u32_be(SECURITY_RESULT_ERR);
                stream.send_u32_be(reason.len() as u32).send_all(reason.as_bytes());
                stream.flush().await?;
                return Err(LtsmError::AuthFailed);
            }
            choice
        }
    };

    match chosen {
        SECURITY_TYPE_NONE => {
            if version == RfbVersion::V38 {
                stream.send_u32_be(SECURITY_RESULT_OK);
                stream.flush().await?;
            }
            Ok(stream)
        }
        SECURITY_TYPE_VNC => {
            vnc_auth(id, &mut stream, security).await?;
            stream.send_u32_be(SECURITY_RESULT_OK);
            stream.flush().await?;
            Ok(stream)
        }
        SECURITY_TYPE_VENCRYPT => {
            let mut stream = vencrypt_handshake(id, stream, security).await?;
            stream.send_u32_be(SECURITY_RESULT_OK);
            stream.flush().await?;
            Ok(stream)
        }
        _ => unreachable!("filtered above"),
    }
}

/// Classic VNC auth: random challenge, DES response, password file scan.
async fn vnc_auth(
    id: usize,
    stream: &mut FramedStream<Transport>,
    security: &SecurityInfo,
) -> Result<()> {
    let challenge = auth::generate_challenge();
    stream.send_all(&challenge);
    stream.flush().await?;

    let response_bytes = stream.recv_exact(16).await?;
    let mut response = [0u8; 16];
    response.copy_from_slice(&response_bytes);

    let Some(passwd_file) = &security.passwd_file else {
        return Err(LtsmError::AuthFailed);
    };
    if auth::verify_against_file(passwd_file, &challenge, &response)? {
        log::info!("session {id}: vnc auth ok");
        return Ok(());
    }

    let reason = "password mismatch";
    stream.send_u32_be(SECURITY_RESULT_ERR);
    stream.send_u32_be(reason.len() as u32).send_all(reason.as_bytes());
    stream.flush().await?;
    log::warn!("session {id}: vnc auth failed");
    Err(LtsmError::AuthFailed)
}

/// VeNCrypt sub-handshake: version agreement, sub-type selection, the
/// one-time TLS switch, then the residual auth in the clear over TLS.
async fn vencrypt_handshake(
    id: usize,
    mut stream: FramedStream<Transport>,
    security: &SecurityInfo,
) -> Result<FramedStream<Transport>> {
    // Our VeNCrypt version is 0.2.
    stream.send_u8(0).send_u8(2);
    stream.flush().await?;

    let major = stream.recv_u8().await?;
    let minor = stream.recv_u8().await?;
    log::debug!("session {id}: client vencrypt {major}.{minor}");
    if major != 0 || !(1..=2).contains(&minor) {
        stream.send_u8(255);
        stream.flush().await?;
        return Err(LtsmError::Protocol(format!(
            "unsupported vencrypt version {major}.{minor}"
        )));
    }
    // Version accepted.
    stream.send_u8(0);

    let vnc_inner = security.passwd_file.is_some();
    let x509 = !security.tls_anon && security.cert_file.is_some();

    let selected = if minor == 1 {
        let subtype = match (x509, vnc_inner) {
            (true, true) => VENCRYPT01_X509VNC,
            (true, false) => VENCRYPT01_X509NONE,
            (false, true) => VENCRYPT01_TLSVNC,
            (false, false) => VENCRYPT01_TLSNONE,
        };
        stream.send_u8(1).send_u8(subtype);
        stream.flush().await?;
        let choice = stream.recv_u8().await?;
        if choice != subtype {
            return Err(LtsmError::Protocol(format!(
                "unsupported vencrypt security 0x{choice:02x}"
            )));
        }
        choice as u32
    } else {
        let subtype = match (x509, vnc_inner) {
            (true, true) => VENCRYPT02_X509VNC,
            (true, false) => VENCRYPT02_X509NONE,
            (false, true) => VENCRYPT02_TLSVNC,
            (false, false) => VENCRYPT02_TLSNONE,
        };
        stream.send_u8(1).send_u32_be(subtype);
        stream.flush().await?;
        let choice = stream.recv_u32_be().await?;
        if choice != subtype {
            return Err(LtsmError::Protocol(format!(
                "unsupported vencrypt security 0x{choice:08x}"
            )));
        }
        choice
    };

    // Accept and switch to TLS.
    stream.send_u8(1);
    stream.flush().await?;

    let acceptor = tls::make_acceptor(security)?;
    let (transport, residue) = stream.into_parts();
    if !residue.is_empty() {
        return Err(LtsmError::Protocol("bytes before TLS handshake".into()));
    }
    let transport = tls::accept(&acceptor, transport).await.map_err(|err| {
        log::error!("session {id}: TLS handshake failed: {err}");
        err
    })?;
    let mut stream = FramedStream::new(transport);
    log::info!("session {id}: TLS established (vencrypt 0.{minor}, subtype {selected})");

    let needs_vnc = matches!(
        selected,
        x if x == VENCRYPT01_TLSVNC as u32
            || x == VENCRYPT01_X509VNC as u32
            || x == VENCRYPT02_TLSVNC
            || x == VENCRYPT02_X509VNC
    );
    if needs_vnc {
        vnc_auth(id, &mut stream, security).await?;
    }
    Ok(stream)
}
