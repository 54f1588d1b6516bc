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

//! LTSM virtual channels over the RFB link.
//!
//! Channel traffic rides inside reserved RFB message types without
//! breaking RFB framing: `{u8 type, u8 channelId, u32 len BE, payload}`.
//! Channel id 0 is the system control plane (JSON messages); ids 1..=255
//! carry opaque, ordered payloads with preserved message boundaries.
//!
//! The session task is the only socket writer, so channel writers enqueue
//! frames into a bounded per-session queue; a full queue exerts
//! backpressure on the channel worker. Channels are kept in an id-indexed
//! table owned by the session; workers hold only an id and a sender
//! handle, never a back-reference.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{LtsmError, Result};
use crate::protocol;

/// Default per-channel backpressure threshold, in queued frames.
pub const CHANNEL_QUEUE_DEPTH: usize = 64;

/// Channel throughput hint; the codec layer picks heavier compression on
/// slow channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelSpeed {
    Slow,
    #[default]
    Normal,
    Fast,
    UltraFast,
}

/// What is attached to the far end of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Null,
    Pcsc,
    Audio,
    Fuse,
    TransferFiles,
}

/// Control-plane messages carried on channel id 0 as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum SystemMessage {
    /// Request to open a channel with the given id, kind and speed.
    ChannelOpen {
        id: u8,
        kind: ChannelKind,
        speed: ChannelSpeed,
    },
    /// Open acknowledgement; `ok: false` releases the id.
    ChannelAck { id: u8, ok: bool },
    /// Channel-level failure that does not kill the session.
    ChannelError { id: u8, reason: String },
    /// Client environment variables published at session start.
    ClientVariables { variables: serde_json::Value },
    /// Operator-visible notification text.
    Notification { text: String },
}

/// One outbound frame queued for the session writer.
#[derive(Debug, Clone)]
pub struct ChannelFrame {
    pub msg_type: u8,
    pub channel_id: u8,
    pub payload: Bytes,
}

impl ChannelFrame {
    pub fn data(channel_id: u8, payload: Bytes) -> Self {
        Self {
            msg_type: protocol::LTSM_CHANNEL_DATA,
            channel_id,
            payload,
        }
    }

    pub fn system(message: &SystemMessage) -> Self {
        let payload = serde_json::to_vec(message).unwrap_or_default();
        Self {
            msg_type: protocol::LTSM_SYSTEM,
            channel_id: 0,
            payload: payload.into(),
        }
    }

    pub fn close(channel_id: u8, reason: &str) -> Self {
        Self {
            msg_type: protocol::LTSM_CHANNEL_CLOSE,
            channel_id,
            payload: Bytes::copy_from_slice(reason.as_bytes()),
        }
    }
}

/// Writer handle held by a channel worker: enqueues data frames for its
/// channel, blocking when the session queue is saturated.
#[derive(Clone)]
pub struct ChannelWriter {
    id: u8,
    out: mpsc::Sender<ChannelFrame>,
}

impl ChannelWriter {
    /// Direct construction for wiring outside the mux (tests, helper
    /// processes feeding a session queue).
    pub(crate) fn new(id: u8, out: mpsc::Sender<ChannelFrame>) -> Self {
        Self { id, out }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Queues one data frame. Awaits while the queue is above the
    /// backpressure threshold; fails with `Closed` once the session sink
    /// is gone.
    pub async fn push(&self, payload: Bytes) -> Result<()> {
        self.out
            .send(ChannelFrame::data(self.id, payload))
            .await
            .map_err(|_| LtsmError::Closed)
    }

    /// Queues a close frame after pending writes.
    pub async fn close(&self, reason: &str) -> Result<()> {
        self.out
            .send(ChannelFrame::close(self.id, reason))
            .await
            .map_err(|_| LtsmError::Closed)
    }
}

struct ChannelEntry {
    kind: ChannelKind,
    speed: ChannelSpeed,
    /// Inbound payloads are handed to the channel worker through this
    /// bounded queue; `None` until the peer acks the open.
    inbound: Option<mpsc::Sender<Bytes>>,
    acked: bool,
}

/// Events the mux surfaces to the session for protocol-level handling.
#[derive(Debug)]
pub enum MuxEvent {
    /// Peer asked to open a channel; the session decides whether to
    /// attach a handler and ack.
    OpenRequested {
        id: u8,
        kind: ChannelKind,
        speed: ChannelSpeed,
    },
    /// Peer acked a channel this side opened.
    Opened { id: u8 },
    /// Peer refused or closed; the id is released.
    Closed { id: u8, reason: String },
    /// Non-channel system message for the session to act on.
    System(SystemMessage),
}

/// Per-session channel table and demultiplexer.
pub struct ChannelMux {
    channels: HashMap<u8, ChannelEntry>,
    out: mpsc::Sender<ChannelFrame>,
    next_id: u8,
}

impl ChannelMux {
    /// Creates the mux plus the receiving end of the outbound frame
    /// queue, which the session writer drains.
    pub fn new() -> (Self, mpsc::Receiver<ChannelFrame>) {
        let (out, rx) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
        (
            Self {
                channels: HashMap::new(),
                out,
                next_id: 1,
            },
            rx,
        )
    }

    /// A writer handle for an open, acknowledged channel.
    pub fn writer(&self, id: u8) -> Option<ChannelWriter> {
        self.channels
            .get(&id)
            .filter(|entry| entry.acked)
            .map(|_| ChannelWriter {
                id,
                out: self.out.clone(),
            })
    }

    /// Sender for system messages (shares the outbound queue).
    pub fn system_sender(&self) -> mpsc::Sender<ChannelFrame> {
        self.out.clone()
    }

    fn allocate_id(&mut self) -> Result<u8> {
        for _ in 0..255 {
            let id = self.next_id;
            self.next_id = if self.next_id == 255 { 1 } else { self.next_id + 1 };
            if !self.channels.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(LtsmError::Protocol("channel ids exhausted".into()))
    }

    /// Initiates a channel open towards the peer. Returns the id and the
    /// receiver the future worker will consume payloads from.
    pub async fn open(
        &mut self,
        kind: ChannelKind,
        speed: ChannelSpeed,
    ) -> Result<(u8, mpsc::Receiver<Bytes>)> {
        let id = self.allocate_id()?;
        let (tx, rx) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
        self.channels.insert(
            id,
            ChannelEntry {
                kind,
                speed,
                inbound: Some(tx),
                acked: false,
            },
        );
        let open = SystemMessage::ChannelOpen { id, kind, speed };
        let payload = serde_json::to_vec(&open)
            .map_err(|e| LtsmError::Protocol(format!("channel open encode: {e}")))?;
        self.out
            .send(ChannelFrame {
                msg_type: protocol::LTSM_CHANNEL_CONNECT,
                channel_id: id,
                payload: payload.into(),
            })
            .await
            .map_err(|_| LtsmError::Closed)?;
        Ok((id, rx))
    }

    /// Accepts a peer-initiated open: registers the worker queue and acks.
    pub async fn accept(
        &mut self,
        id: u8,
        kind: ChannelKind,
        speed: ChannelSpeed,
    ) -> Result<mpsc::Receiver<Bytes>> {
        if id == 0 || self.channels.contains_key(&id) {
            return Err(LtsmError::Protocol(format!("channel id {id} unusable")));
        }
        let (tx, rx) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
        self.channels.insert(
            id,
            ChannelEntry {
                kind,
                speed,
                inbound: Some(tx),
                acked: true,
            },
        );
        let ack = SystemMessage::ChannelAck { id, ok: true };
        let payload = serde_json::to_vec(&ack)
            .map_err(|e| LtsmError::Protocol(format!("channel ack encode: {e}")))?;
        self.out
            .send(ChannelFrame {
                msg_type: protocol::LTSM_CHANNEL_ACK,
                channel_id: id,
                payload: payload.into(),
            })
            .await
            .map_err(|_| LtsmError::Closed)?;
        Ok(rx)
    }

    /// Refuses a peer-initiated open.
    pub async fn refuse(&mut self, id: u8, reason: &str) -> Result<()> {
        let ack = SystemMessage::ChannelAck { id, ok: false };
        let payload = serde_json::to_vec(&ack)
            .map_err(|e| LtsmError::Protocol(format!("channel ack encode: {e}")))?;
        self.out
            .send(ChannelFrame {
                msg_type: protocol::LTSM_CHANNEL_ACK,
                channel_id: id,
                payload: payload.into(),
            })
            .await
            .map_err(|_| LtsmError::Closed)?;
        log::warn!("channel {id} refused: {reason}");
        Ok(())
    }

    /// Closes a channel locally: pending writes are already ordered ahead
    /// of the close frame in the queue, then the id is released.
    pub async fn close(&mut self, id: u8, reason: &str) -> Result<()> {
        if self.channels.remove(&id).is_some() {
            self.out
                .send(ChannelFrame::close(id, reason))
                .await
                .map_err(|_| LtsmError::Closed)?;
        }
        Ok(())
    }

    /// Releases every channel without notifying the peer (session end).
    pub fn shutdown(&mut self) {
        self.channels.clear();
    }

    pub fn kind(&self, id: u8) -> Option<ChannelKind> {
        self.channels.get(&id).map(|entry| entry.kind)
    }

    pub fn speed(&self, id: u8) -> Option<ChannelSpeed> {
        self.channels.get(&id).map(|entry| entry.speed)
    }

    /// Routes one received LTSM frame. Data frames go to the channel
    /// worker (awaiting exerts backpressure on the reader); control
    /// frames surface as [`MuxEvent`]s.
    pub async fn dispatch(
        &mut self,
        msg_type: u8,
        channel_id: u8,
        payload: Bytes,
    ) -> Result<Option<MuxEvent>> {
        match msg_type {
            protocol::LTSM_CHANNEL_DATA => {
                let inbound = self
                    .channels
                    .get(&channel_id)
                    .and_then(|entry| entry.inbound.clone());
                let Some(tx) = inbound else {
                    log::warn!("data for unknown channel {channel_id}, dropped");
                    return Ok(None);
                };
                if tx.send(payload).await.is_err() {
                    // Worker is gone; release the channel.
                    self.channels.remove(&channel_id);
                    return Ok(Some(MuxEvent::Closed {
                        id: channel_id,
                        reason: "worker terminated".into(),
                    }));
                }
                Ok(None)
            }
            protocol::LTSM_CHANNEL_CONNECT => {
                let open: SystemMessage = serde_json::from_slice(&payload)
                    .map_err(|e| LtsmError::Protocol(format!("channel connect: {e}")))?;
                match open {
                    SystemMessage::ChannelOpen { id, kind, speed } => {
                        Ok(Some(MuxEvent::OpenRequested { id, kind, speed }))
                    }
                    other => Err(LtsmError::Protocol(format!(
                        "unexpected connect payload: {other:?}"
                    ))),
                }
            }
            protocol::LTSM_CHANNEL_ACK => {
                let ack: SystemMessage = serde_json::from_slice(&payload)
                    .map_err(|e| LtsmError::Protocol(format!("channel ack: {e}")))?;
                match ack {
                    SystemMessage::ChannelAck { id, ok: true } => {
                        if let Some(entry) = self.channels.get_mut(&id) {
                            entry.acked = true;
                        }
                        Ok(Some(MuxEvent::Opened { id }))
                    }
                    SystemMessage::ChannelAck { id, ok: false } => {
                        self.channels.remove(&id);
                        Ok(Some(MuxEvent::Closed {
                            id,
                            reason: "refused".into(),
                        }))
                    }
                    other => Err(LtsmError::Protocol(format!(
                        "unexpected ack payload: {other:?}"
                    ))),
                }
            }
            protocol::LTSM_CHANNEL_CLOSE => {
                self.channels.remove(&channel_id);
                Ok(Some(MuxEvent::Closed {
                    id: channel_id,
                    reason: String::from_utf8_lossy(&payload).into_owned(),
                }))
            }
            protocol::LTSM_SYSTEM => {
                let message: SystemMessage = serde_json::from_slice(&payload)
                    .map_err(|e| LtsmError::Protocol(format!("system message: {e}")))?;
                Ok(Some(MuxEvent::System(message)))
            }
            other => Err(LtsmError::Protocol(format!(
                "unknown LTSM message type 0x{other:02x}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_ack_data_close_lifecycle() {
        let (mut mux, mut out_rx) = ChannelMux::new();

        let (id, mut inbound) = mux
            .open(ChannelKind::Pcsc, ChannelSpeed::Fast)
            .await
            .unwrap();
        assert_eq!(id, 1);
        let frame = out_rx.recv().await.unwrap();
        assert_eq!(frame.msg_type, protocol::LTSM_CHANNEL_CONNECT);

        // Peer acks.
        let ack = serde_json::to_vec(&SystemMessage::ChannelAck { id, ok: true }).unwrap();
        let event = mux
            .dispatch(protocol::LTSM_CHANNEL_ACK, id, ack.into())
            .await
            .unwrap();
        assert!(matches!(event, Some(MuxEvent::Opened { id: 1 })));

        // Inbound data reaches the worker queue.
        mux.dispatch(
            protocol::LTSM_CHANNEL_DATA,
            id,
            Bytes::from_static(b"apdu"),
        )
        .await
        .unwrap();
        assert_eq!(inbound.recv().await.unwrap(), Bytes::from_static(b"apdu"));

        // Close releases the id and emits the frame.
        mux.close(id, "done").await.unwrap();
        let frame = out_rx.recv().await.unwrap();
        assert_eq!(frame.msg_type, protocol::LTSM_CHANNEL_CLOSE);
        assert_eq!(&frame.payload[..], b"done");
        assert!(mux.kind(id).is_none());
    }

    #[tokio::test]
    async fn peer_initiated_open_is_surfaced_then_accepted() {
        let (mut mux, mut out_rx) = ChannelMux::new();

        let open = serde_json::to_vec(&SystemMessage::ChannelOpen {
            id: 7,
            kind: ChannelKind::Audio,
            speed: ChannelSpeed::Normal,
        })
        .unwrap();
        let event = mux
            .dispatch(protocol::LTSM_CHANNEL_CONNECT, 7, open.into())
            .await
            .unwrap();
        let Some(MuxEvent::OpenRequested { id, kind, .. }) = event else {
            panic!("expected open request");
        };
        assert_eq!((id, kind), (7, ChannelKind::Audio));

        let mut inbound = mux.accept(id, kind, ChannelSpeed::Normal).await.unwrap();
        let frame = out_rx.recv().await.unwrap();
        assert_eq!(frame.msg_type, protocol::LTSM_CHANNEL_ACK);

        mux.dispatch(protocol::LTSM_CHANNEL_DATA, 7, Bytes::from_static(b"pcm"))
            .await
            .unwrap();
        assert_eq!(inbound.recv().await.unwrap(), Bytes::from_static(b"pcm"));
    }

    #[tokio::test]
    async fn data_for_unknown_channel_is_dropped() {
        let (mut mux, _out_rx) = ChannelMux::new();
        let event = mux
            .dispatch(protocol::LTSM_CHANNEL_DATA, 9, Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(event.is_none());
    }

    #[test]
    fn system_message_json_shape() {
        let json = serde_json::to_string(&SystemMessage::ChannelOpen {
            id: 3,
            kind: ChannelKind::Pcsc,
            speed: ChannelSpeed::UltraFast,
        })
        .unwrap();
        assert!(json.contains("\"cmd\":\"channel_open\""));
        assert!(json.contains("\"kind\":\"pcsc\""));
        assert!(json.contains("\"speed\":\"ultrafast\""));
    }
}
