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

//! Client-side engine: connects, negotiates, decodes updates into a
//! [`ClientSurface`] and services the redirection channels.

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::audio::{self, AudioSink};
use crate::auth;
use crate::channel::{ChannelFrame, ChannelKind, ChannelMux, MuxEvent};
use crate::display::ClientSurface;
use crate::encoding::{self, zlib::InflateStreams};
use crate::error::{LtsmError, Result};
use crate::framebuffer::{ColorCursor, Region};
use crate::pcsc::service::{self, PcscBackend};
use crate::protocol::*;
use crate::stream::{FramedStream, Transport};
use crate::tls::{self, SecurityInfo};

/// Viewer-side configuration.
pub struct ViewerConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub security: SecurityInfo,
    /// Disable VeNCrypt even when the server offers it.
    pub no_tls: bool,
    /// Preferred frame encoding, by name.
    pub encoding: Option<String>,
    /// Advertise the LTSM channel extension.
    pub enable_ltsm: bool,
    /// Serve smart-card requests from this backend.
    pub pcsc_backend: Option<Box<dyn PcscBackend>>,
    /// Play redirected audio into this sink.
    pub audio_sink: Option<Box<dyn AudioSink>>,
    pub fullscreen: bool,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5900,
            password: None,
            security: SecurityInfo::default(),
            no_tls: false,
            encoding: None,
            enable_ltsm: true,
            pcsc_backend: None,
            audio_sink: None,
            fullscreen: false,
        }
    }
}

/// A connected viewer session.
pub struct Viewer<S: ClientSurface> {
    stream: FramedStream<Transport>,
    surface: S,
    config: ViewerConfig,
    format: PixelFormat,
    width: u16,
    height: u16,
    inflate: InflateStreams,
    mux: ChannelMux,
    mux_rx: mpsc::Receiver<ChannelFrame>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    running: bool,
}

impl<S: ClientSurface> Viewer<S> {
    /// Connects and completes the full handshake; the surface window is
    /// created at the negotiated geometry.
    pub async fn connect(mut config: ViewerConfig, mut surface: S) -> Result<Self> {
        let tcp = TcpStream::connect((config.host.as_str(), config.port)).await?;
        tcp.set_nodelay(true)?;
        let mut stream = FramedStream::new(Transport::Plain(tcp));

        // Version: meet the server at 3.8.
        let banner = stream.recv_exact(12).await?;
        let version = RfbVersion::from_banner(&banner)?;
        stream.send_all(PROTOCOL_VERSION.as_bytes());
        stream.flush().await?;

        let mut stream = client_security(&mut config, stream, version).await?;

        // ClientInit: request a shared session.
        stream.send_u8(1);
        stream.flush().await?;

        // ServerInit.
        let width = stream.recv_u16_be().await?;
        let height = stream.recv_u16_be().await?;
        let raw = stream.recv_exact(16).await?;
        let mut pf_buf = bytes::BytesMut::from(&raw[..]);
        let format = PixelFormat::from_bytes(&mut pf_buf)?;
        let name_len = stream.recv_u32_be().await? as usize;
        if name_len > 4096 {
            return Err(LtsmError::Protocol("desktop name too long".into()));
        }
        let name = stream.recv_exact(name_len).await?;
        log::info!(
            "connected to `{}', {width}x{height}",
            String::from_utf8_lossy(&name)
        );
        if !format.is_valid() {
            return Err(LtsmError::Protocol("invalid server pixel format".into()));
        }

        surface.create_window(width, height, config.fullscreen)?;

        let (mux, mux_rx) = ChannelMux::new();
        let mut viewer = Self {
            stream,
            surface,
            config,
            format,
            width,
            height,
            inflate: InflateStreams::default(),
            mux,
            mux_rx,
            tasks: Vec::new(),
            running: true,
        };
        viewer.send_encodings().await?;
        viewer.request_update(false).await?;
        Ok(viewer)
    }

    /// The encodings this viewer advertises, most preferred first.
    fn encoding_list(&self) -> Vec<i32> {
        let mut list = Vec::new();
        if let Some(name) = &self.config.encoding {
            for enc in [
                ENCODING_LTSM_QOI,
                ENCODING_ZRLE,
                ENCODING_TRLE,
                ENCODING_ZLIBHEX,
                ENCODING_ZLIB,
                ENCODING_HEXTILE,
                ENCODING_CORRE,
                ENCODING_RRE,
            ] {
                if encoding_name(enc).eq_ignore_ascii_case(name) {
                    list.push(enc);
                }
            }
        }
        for enc in [
            ENCODING_ZRLE,
            ENCODING_ZLIBHEX,
            ENCODING_HEXTILE,
            ENCODING_ZLIB,
            ENCODING_CORRE,
            ENCODING_RRE,
            ENCODING_RAW,
        ] {
            if !list.contains(&enc) {
                list.push(enc);
            }
        }
        // Pseudo-encodings: features this viewer understands.
        list.extend_from_slice(&[
            ENCODING_EXT_DESKTOP_SIZE,
            ENCODING_DESKTOP_SIZE,
            ENCODING_CONTINUOUS_UPDATES,
            ENCODING_EXT_CLIPBOARD,
            ENCODING_LAST_RECT,
            ENCODING_CURSOR,
        ]);
        if self.config.enable_ltsm {
            list.push(ENCODING_LTSM);
        }
        list
    }

    async fn send_encodings(&mut self) -> Result<()> {
        let list = self.encoding_list();
        self.stream.send_u8(CLIENT_SET_ENCODINGS).send_u8(0);
        self.stream.send_u16_be(list.len() as u16);
        for enc in list {
            self.stream.send_i32_be(enc);
        }
        self.stream.flush().await
    }

    async fn request_update(&mut self, incremental: bool) -> Result<()> {
        self.stream
            .send_u8(CLIENT_FB_UPDATE_REQUEST)
            .send_u8(incremental as u8)
            .send_u16_be(0)
            .send_u16_be(0)
            .send_u16_be(self.width)
            .send_u16_be(self.height);
        self.stream.flush().await
    }

    /// Sends a key event.
    pub async fn send_key(&mut self, keysym: u32, pressed: bool) -> Result<()> {
        self.stream
            .send_u8(CLIENT_KEY_EVENT)
            .send_u8(pressed as u8)
            .send_u16_be(0)
            .send_u32_be(keysym);
        self.stream.flush().await
    }

    /// Sends a pointer event.
    pub async fn send_pointer(&mut self, button_mask: u8, x: u16, y: u16) -> Result<()> {
        self.stream
            .send_u8(CLIENT_POINTER_EVENT)
            .send_u8(button_mask)
            .send_u16_be(x)
            .send_u16_be(y);
        self.stream.flush().await
    }

    /// Sends clipboard text to the server (plain form).
    pub async fn send_cut_text(&mut self, text: &[u8]) -> Result<()> {
        self.stream.send_u8(CLIENT_CUT_TEXT).send_zeros(3);
        self.stream.send_u32_be(text.len() as u32);
        self.stream.send_all(text);
        self.stream.flush().await
    }

    /// Requests a desktop resize.
    pub async fn send_desktop_size(&mut self, width: u16, height: u16) -> Result<()> {
        self.stream.send_u8(CLIENT_SET_DESKTOP_SIZE).send_u8(0);
        self.stream.send_u16_be(width).send_u16_be(height);
        self.stream.send_u8(1).send_u8(0);
        self.stream
            .send_u32_be(0)
            .send_u16_be(0)
            .send_u16_be(0)
            .send_u16_be(width)
            .send_u16_be(height)
            .send_u32_be(0);
        self.stream.flush().await
    }

    /// Message loop: runs until disconnect. Each completed framebuffer
    /// update triggers `present` and the next incremental request.
    pub async fn run(&mut self) -> Result<()> {
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
            }
        };
        for task in self.tasks.drain(..) {
            task.abort();
        }
        result
    }

    /// Processes exactly one server message; exposed for tests that
    /// drive the loop by hand.
    pub async fn step(&mut self) -> Result<()> {
        let msg = self.stream.recv_u8().await?;
        self.handle_message(msg).await
    }

    /// Read access for assertions.
    pub fn surface(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn geometry(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    async fn handle_message(&mut self, msg_type: u8) -> Result<()> {
        match msg_type {
            SERVER_FB_UPDATE => self.on_update().await,
            SERVER_SET_COLOUR_MAP => self.on_colour_map().await,
            SERVER_BELL => {
                self.surface.bell();
                Ok(())
            }
            SERVER_CUT_TEXT => self.on_cut_text().await,
            SERVER_END_CONTINUOUS_UPDATES => Ok(()),
            LTSM_RANGE_FIRST..=LTSM_RANGE_LAST => self.on_ltsm_message(msg_type).await,
            other => Err(LtsmError::Protocol(format!(
                "unknown server message 0x{other:02x}"
            ))),
        }
    }

    async fn on_update(&mut self) -> Result<()> {
        self.stream.recv_skip(1).await?;
        let rects = self.stream.recv_u16_be().await?;

        for _ in 0..rects {
            let x = self.stream.recv_u16_be().await?;
            let y = self.stream.recv_u16_be().await?;
            let width = self.stream.recv_u16_be().await?;
            let height = self.stream.recv_u16_be().await?;
            let enc = self.stream.recv_i32_be().await?;
            let region = Region::new(x, y, width, height);

            match enc {
                ENCODING_LAST_RECT => break,
                ENCODING_EXT_DESKTOP_SIZE => {
                    self.on_ext_desktop_size(x, y, width, height).await?;
                }
                ENCODING_DESKTOP_SIZE => {
                    self.apply_geometry(width, height);
                }
                ENCODING_CURSOR => {
                    let bpp = self.format.bytes_per_pixel();
                    let pixels = self
                        .stream
                        .recv_exact(width as usize * height as usize * bpp)
                        .await?;
                    let mask_row = (width as usize + 7) / 8;
                    let mask = self.stream.recv_exact(mask_row * height as usize).await?;
                    self.surface.set_cursor(ColorCursor {
                        hot_x: x,
                        hot_y: y,
                        width,
                        height,
                        pixels: pixels.to_vec(),
                        mask: Some(mask.to_vec()),
                    });
                }
                _ => {
                    let pixels = self.decode_rect(enc, width, height).await?;
                    self.surface.upload_region(region, &pixels, &self.format);
                }
            }
        }
        self.surface.present();
        self.request_update(true).await
    }

    async fn decode_rect(&mut self, enc: i32, width: u16, height: u16) -> Result<Vec<u8>> {
        match enc {
            ENCODING_RAW => {
                encoding::raw::decode(&mut self.stream, width, height, &self.format).await
            }
            ENCODING_RRE => {
                encoding::rre::decode_rre(&mut self.stream, width, height, &self.format).await
            }
            ENCODING_CORRE => {
                encoding::rre::decode_corre(&mut self.stream, width, height, &self.format).await
            }
            ENCODING_HEXTILE => {
                encoding::hextile::decode(&mut self.stream, width, height, &self.format).await
            }
            ENCODING_ZLIB => {
                encoding::zlib::decode_zlib(
                    &mut self.stream,
                    width,
                    height,
                    &self.format,
                    &mut self.inflate,
                )
                .await
            }
            ENCODING_ZLIBHEX => {
                encoding::zlib::decode_zlibhex(
                    &mut self.stream,
                    width,
                    height,
                    &self.format,
                    &mut self.inflate,
                )
                .await
            }
            ENCODING_TRLE => {
                encoding::zrle::decode_trle(&mut self.stream, width, height, &self.format).await
            }
            ENCODING_ZRLE => {
                encoding::zrle::decode_zrle(
                    &mut self.stream,
                    width,
                    height,
                    &self.format,
                    &mut self.inflate,
                )
                .await
            }
            ENCODING_LTSM_QOI => {
                encoding::qoi::decode(&mut self.stream, width, height, &self.format).await
            }
            other => Err(LtsmError::Unsupported(encoding_name(other))),
        }
    }

    async fn on_ext_desktop_size(&mut self, initiator: u16, error: u16, width: u16, height: u16) -> Result<()> {
        let screen_count = self.stream.recv_u8().await?;
        self.stream.recv_skip(3).await?;
        self.stream.recv_skip(screen_count as usize * 16).await?;

        if error != 0 {
            log::warn!("desktop resize refused: initiator {initiator}, error {error}");
            return Ok(());
        }
        self.apply_geometry(width, height);
        Ok(())
    }

    fn apply_geometry(&mut self, width: u16, height: u16) {
        if (width, height) != (self.width, self.height) {
            log::info!("desktop resized to {width}x{height}");
            self.width = width;
            self.height = height;
            self.surface.resize(width, height);
        }
    }

    async fn on_colour_map(&mut self) -> Result<()> {
        // True colour throughout; consume and ignore the palette.
        self.stream.recv_skip(1).await?;
        let _first = self.stream.recv_u16_be().await?;
        let count = self.stream.recv_u16_be().await? as usize;
        self.stream.recv_skip(count * 6).await?;
        Ok(())
    }

    async fn on_cut_text(&mut self) -> Result<()> {
        self.stream.recv_skip(3).await?;
        let length = self.stream.recv_i32_be().await?;

        if length >= 0 {
            let text = self.stream.recv_exact(length as usize).await?;
            self.surface.set_clipboard(&text);
            return Ok(());
        }

        let length = length.unsigned_abs() as usize;
        if length < 4 {
            return Err(LtsmError::Protocol("bad extended clipboard length".into()));
        }
        let payload = self.stream.recv_exact(length).await?;
        let flags = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let body = payload.slice(4..);

        if flags & CLIPBOARD_OP_CAPS != 0 {
            log::debug!("server clipboard caps 0x{flags:08x}");
            return Ok(());
        }
        if flags & CLIPBOARD_OP_NOTIFY != 0 {
            return self
                .send_ext_clipboard(CLIPBOARD_OP_REQUEST | CLIPBOARD_TYPE_TEXT, &[])
                .await;
        }
        if flags & CLIPBOARD_OP_REQUEST != 0 {
            let text = self.surface.get_clipboard().unwrap_or_default();
            let provided = crate::session::compress_clipboard(&text)?;
            return self
                .send_ext_clipboard(CLIPBOARD_OP_PROVIDE | CLIPBOARD_TYPE_TEXT, &provided)
                .await;
        }
        if flags & CLIPBOARD_OP_PROVIDE != 0 {
            let text = crate::session::decompress_clipboard(&body)?;
            self.surface.set_clipboard(&text);
        }
        Ok(())
    }

    async fn send_ext_clipboard(&mut self, flags: u32, body: &[u8]) -> Result<()> {
        let total = 4 + body.len();
        self.stream.send_u8(CLIENT_CUT_TEXT).send_zeros(3);
        self.stream.send_i32_be(-(total as i32));
        self.stream.send_u32_be(flags);
        self.stream.send_all(body);
        self.stream.flush().await
    }

    async fn write_channel_frame(&mut self, frame: &ChannelFrame) -> Result<()> {
        self.stream
            .send_u8(frame.msg_type)
            .send_u8(frame.channel_id)
            .send_u32_be(frame.payload.len() as u32)
            .send_all(&frame.payload);
        self.stream.flush().await
    }

    async fn on_ltsm_message(&mut self, msg_type: u8) -> Result<()> {
        let channel_id = self.stream.recv_u8().await?;
        let length = self.stream.recv_u32_be().await? as usize;
        let payload = self.stream.recv_exact(length).await?;

        match self.mux.dispatch(msg_type, channel_id, payload).await? {
            Some(MuxEvent::OpenRequested { id, kind, speed }) => {
                self.on_channel_offer(id, kind, speed).await
            }
            Some(MuxEvent::Closed { id, reason }) => {
                log::info!("channel {id} closed: {reason}");
                Ok(())
            }
            Some(MuxEvent::Opened { id }) => {
                log::debug!("channel {id} opened");
                Ok(())
            }
            Some(MuxEvent::System(message)) => {
                log::debug!("system message: {message:?}");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Server offered a channel; attach the matching local endpoint.
    async fn on_channel_offer(
        &mut self,
        id: u8,
        kind: ChannelKind,
        speed: crate::channel::ChannelSpeed,
    ) -> Result<()> {
        match kind {
            ChannelKind::Audio if self.config.audio_sink.is_some() => {
                let inbound = self.mux.accept(id, kind, speed).await?;
                let writer = self
                    .mux
                    .writer(id)
                    .ok_or_else(|| LtsmError::Protocol("audio channel vanished".into()))?;
                let sink = self
                    .config
                    .audio_sink
                    .take()
                    .ok_or(LtsmError::Unsupported("audio sink"))?;
                self.tasks.push(tokio::spawn(async move {
                    if let Err(err) = audio_client(writer, inbound, sink).await {
                        log::warn!("audio channel ended: {err}");
                    }
                }));
                Ok(())
            }
            ChannelKind::Pcsc if self.config.pcsc_backend.is_some() => {
                let inbound = self.mux.accept(id, kind, speed).await?;
                let writer = self
                    .mux
                    .writer(id)
                    .ok_or_else(|| LtsmError::Protocol("pcsc channel vanished".into()))?;
                let backend = self
                    .config
                    .pcsc_backend
                    .take()
                    .ok_or(LtsmError::Unsupported("pcsc backend"))?;
                self.tasks.push(tokio::spawn(async move {
                    if let Err(err) = service::serve(backend, writer, inbound).await {
                        log::warn!("pcsc channel ended: {err}");
                    }
                }));
                Ok(())
            }
            other => self.mux.refuse(id, &format!("{other:?} not enabled")).await,
        }
    }
}

/// Audio channel client half: negotiate, then play.
async fn audio_client(
    writer: crate::channel::ChannelWriter,
    mut inbound: mpsc::Receiver<Bytes>,
    sink: Box<dyn AudioSink>,
) -> Result<()> {
    let init = inbound.recv().await.ok_or(LtsmError::Closed)?;
    let offers = audio::decode_init(&init)?;

    let Some(format) = audio::choose_encoding(&offers) else {
        writer
            .push(audio::encode_init_reply(Err("no common encoding")))
            .await?;
        return Err(LtsmError::Audio("no common encoding".into()));
    };
    writer
        .push(audio::encode_init_reply(Ok(format.encoding)))
        .await?;
    log::info!(
        "audio: encoding {} at {} Hz",
        format.encoding,
        format.samples_per_sec
    );
    audio::run_playback(sink, format, inbound).await
}

/// Client half of the security phase.
async fn client_security(
    config: &mut ViewerConfig,
    mut stream: FramedStream<Transport>,
    version: RfbVersion,
) -> Result<FramedStream<Transport>> {
    let chosen = match version {
        RfbVersion::V33 => {
            let dictated = stream.recv_u32_be().await?;
            if dictated == 0 {
                return Err(read_security_failure(&mut stream).await);
            }
            dictated as u8
        }
        _ => {
            let count = stream.recv_u8().await?;
            if count == 0 {
                return Err(read_security_failure(&mut stream).await);
            }
            let types = stream.recv_exact(count as usize).await?;
            let pick = |wanted: u8| types.contains(&wanted);

            let choice = if !config.no_tls && pick(SECURITY_TYPE_VENCRYPT) {
                SECURITY_TYPE_VENCRYPT
            } else if config.password.is_some() && pick(SECURITY_TYPE_VNC) {
                SECURITY_TYPE_VNC
            } else if pick(SECURITY_TYPE_NONE) {
                SECURITY_TYPE_NONE
            } else if pick(SECURITY_TYPE_VNC) {
                SECURITY_TYPE_VNC
            } else {
                return Err(LtsmError::Protocol("no usable security type".into()));
            };
            stream.send_u8(choice);
            stream.flush().await?;
            choice
        }
    };

    let mut stream = match chosen {
        SECURITY_TYPE_NONE => stream,
        SECURITY_TYPE_VNC => {
            client_vnc_auth(config, &mut stream).await?;
            stream
        }
        SECURITY_TYPE_VENCRYPT => client_vencrypt(config, stream).await?,
        other => {
            return Err(LtsmError::Protocol(format!(
                "server dictated unsupported security {other}"
            )))
        }
    };

    // SecurityResult (3.8 always; earlier versions after VNC auth).
    let expect_result =
        version == RfbVersion::V38 || chosen == SECURITY_TYPE_VNC || chosen == SECURITY_TYPE_VENCRYPT;
    if expect_result {
        let result = stream.recv_u32_be().await?;
        if result != SECURITY_RESULT_OK {
            return Err(read_security_failure(&mut stream).await);
        }
    }
    Ok(stream)
}

/// Reads the `{len, reason}` trailer of a failed handshake.
async fn read_security_failure(stream: &mut FramedStream<Transport>) -> LtsmError {
    let reason = async {
        let len = stream.recv_u32_be().await? as usize;
        if len > 4096 {
            return Err(LtsmError::Protocol("oversized failure reason".into()));
        }
        let text = stream.recv_exact(len).await?;
        Ok::<_, LtsmError>(String::from_utf8_lossy(&text).into_owned())
    }
    .await
    .unwrap_or_else(|_| "connection failed".into());
    LtsmError::Protocol(reason)
}

async fn client_vnc_auth(
    config: &ViewerConfig,
    stream: &mut FramedStream<Transport>,
) -> Result<()> {
    let password = config
        .password
        .clone()
        .or_else(|| std::env::var("LTSM_PASSWORD").ok())
        .ok_or(LtsmError::AuthFailed)?;
    let challenge_bytes = stream.recv_exact(16).await?;
    let mut challenge = [0u8; 16];
    challenge.copy_from_slice(&challenge_bytes);
    let response = auth::encrypt_challenge(&password, &challenge);
    stream.send_all(&response);
    stream.flush().await
}

/// Client half of VeNCrypt: version, sub-type, TLS connect, inner auth.
async fn client_vencrypt(
    config: &mut ViewerConfig,
    mut stream: FramedStream<Transport>,
) -> Result<FramedStream<Transport>> {
    let major = stream.recv_u8().await?;
    let minor = stream.recv_u8().await?;
    if major != 0 || !(1..=2).contains(&minor) {
        return Err(LtsmError::Protocol(format!(
            "server vencrypt version {major}.{minor}"
        )));
    }
    stream.send_u8(0).send_u8(minor);
    stream.flush().await?;

    let ack = stream.recv_u8().await?;
    if ack != 0 {
        return Err(LtsmError::Protocol("vencrypt version refused".into()));
    }

    let count = stream.recv_u8().await? as usize;
    if count == 0 {
        return Err(LtsmError::Protocol("empty vencrypt subtype list".into()));
    }

    let subtype: u32 = if minor == 1 {
        let subtypes = stream.recv_exact(count).await?;
        let choice = *subtypes
            .iter()
            .find(|&&s| {
                s == VENCRYPT01_TLSNONE
                    || s == VENCRYPT01_TLSVNC
                    || s == VENCRYPT01_X509NONE
                    || s == VENCRYPT01_X509VNC
            })
            .ok_or_else(|| LtsmError::Protocol("no usable vencrypt subtype".into()))?;
        stream.send_u8(choice);
        stream.flush().await?;
        choice as u32
    } else {
        let mut subtypes = Vec::with_capacity(count);
        for _ in 0..count {
            subtypes.push(stream.recv_u32_be().await?);
        }
        let choice = *subtypes
            .iter()
            .find(|&&s| {
                s == VENCRYPT02_TLSNONE
                    || s == VENCRYPT02_TLSVNC
                    || s == VENCRYPT02_X509NONE
                    || s == VENCRYPT02_X509VNC
            })
            .ok_or_else(|| LtsmError::Protocol("no usable vencrypt subtype".into()))?;
        stream.send_u32_be(choice);
        stream.flush().await?;
        choice
    };

    let ok = stream.recv_u8().await?;
    if ok != 1 {
        return Err(LtsmError::Protocol("vencrypt subtype refused".into()));
    }

    let connector = tls::make_connector(&config.security)?;
    let (transport, residue) = stream.into_parts();
    if !residue.is_empty() {
        return Err(LtsmError::Protocol("bytes before TLS handshake".into()));
    }
    let host = config.host.clone();
    let transport = tls::connect(&connector, &host, transport).await?;
    let mut stream = FramedStream::new(transport);
    log::info!("TLS established (vencrypt subtype {subtype})");

    let needs_vnc = subtype == VENCRYPT01_TLSVNC as u32
        || subtype == VENCRYPT01_X509VNC as u32
        || subtype == VENCRYPT02_TLSVNC
        || subtype == VENCRYPT02_X509VNC;
    if needs_vnc {
        client_vnc_auth(config, &mut stream).await?;
    }
    Ok(stream)
}
