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

//! Channel RPC to the viewer-attached smart-card reader.
//!
//! Every request is `{u16 0xFD01, u16 cmd, little-endian args}` in one
//! channel message; the reply comes back as one message with the shapes
//! in the module-level table. Calls are serialized by an internal lock so
//! request/reply pairs never interleave on the channel.

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use super::{cmd, ReaderState, MAX_ATR_SIZE, MAX_READER_NAME, PCSC_OP_INIT};
use crate::channel::ChannelWriter;
use crate::error::{LtsmError, Result};
use crate::stream::{StreamBuf, StreamRef};

/// A reader slot passed to GetStatusChange.
#[derive(Debug, Clone, Default)]
pub struct StatusQuery {
    pub reader: String,
    pub current_state: u32,
    pub event_state: u32,
    pub atr: Vec<u8>,
}

/// RPC peer handle: the channel writer plus the inbound reply queue.
pub struct PcscRemote {
    writer: ChannelWriter,
    replies: Mutex<mpsc::Receiver<Bytes>>,
    call_lock: Mutex<()>,
}

impl PcscRemote {
    pub fn new(writer: ChannelWriter, replies: mpsc::Receiver<Bytes>) -> Self {
        Self {
            writer,
            replies: Mutex::new(replies),
            call_lock: Mutex::new(()),
        }
    }

    fn request(command: u32) -> StreamBuf {
        let mut buf = StreamBuf::with_capacity(64);
        buf.write_u16_le(PCSC_OP_INIT);
        buf.write_u16_le(command as u16);
        buf
    }

    /// Sends one request and blocks for its reply. The call lock keeps
    /// concurrent stub clients from interleaving pairs.
    async fn call(&self, buf: StreamBuf) -> Result<Bytes> {
        let _guard = self.call_lock.lock().await;
        self.writer.push(buf.into_bytes()).await?;
        let mut replies = self.replies.lock().await;
        replies.recv().await.ok_or(LtsmError::Closed)
    }

    pub async fn establish_context(&self, client: i32, scope: u32) -> Result<(u64, u32)> {
        log::debug!("pcsc rpc: client {client}, establish context, scope {scope}");
        let mut buf = Self::request(cmd::ESTABLISH_CONTEXT);
        buf.write_u32_le(scope);
        let reply = self.call(buf).await?;
        let mut cur = StreamRef::new(&reply);
        Ok((cur.read_u64_le()?, cur.read_u32_le()?))
    }

    pub async fn release_context(&self, client: i32, context: u64) -> Result<u32> {
        log::debug!("pcsc rpc: client {client}, release context 0x{context:016x}");
        let mut buf = Self::request(cmd::RELEASE_CONTEXT);
        buf.write_u64_le(context);
        let reply = self.call(buf).await?;
        StreamRef::new(&reply).read_u32_le()
    }

    pub async fn list_readers(&self, client: i32, context: u64) -> Result<Vec<String>> {
        log::debug!("pcsc rpc: client {client}, list readers");
        let mut buf = Self::request(cmd::LIST_READERS);
        buf.write_u64_le(context);
        let reply = self.call(buf).await?;
        let mut cur = StreamRef::new(&reply);
        let count = cur.read_u32_le()?;
        let mut readers = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            let len = cur.read_u32_le()? as usize;
            if len > MAX_READER_NAME {
                return Err(LtsmError::Protocol("reader name too long".into()));
            }
            let name = cur.read_bytes(len)?;
            readers.push(String::from_utf8_lossy(name).into_owned());
        }
        Ok(readers)
    }

    pub async fn connect(
        &self,
        client: i32,
        context: u64,
        share_mode: u32,
        preferred_protocols: u32,
        reader_name: &str,
    ) -> Result<(u64, u32, u32)> {
        log::debug!("pcsc rpc: client {client}, connect `{reader_name}'");
        let mut buf = Self::request(cmd::CONNECT);
        buf.write_u64_le(context)
            .write_u32_le(share_mode)
            .write_u32_le(preferred_protocols)
            .write_u32_le(reader_name.len() as u32)
            .write_bytes(reader_name.as_bytes());
        let reply = self.call(buf).await?;
        let mut cur = StreamRef::new(&reply);
        Ok((cur.read_u64_le()?, cur.read_u32_le()?, cur.read_u32_le()?))
    }

    pub async fn reconnect(
        &self,
        client: i32,
        handle: u64,
        share_mode: u32,
        preferred_protocols: u32,
        initialization: u32,
    ) -> Result<(u32, u32)> {
        log::debug!("pcsc rpc: client {client}, reconnect 0x{handle:016x}");
        let mut buf = Self::request(cmd::RECONNECT);
        buf.write_u64_le(handle)
            .write_u32_le(share_mode)
            .write_u32_le(preferred_protocols)
            .write_u32_le(initialization);
        let reply = self.call(buf).await?;
        let mut cur = StreamRef::new(&reply);
        Ok((cur.read_u32_le()?, cur.read_u32_le()?))
    }

    pub async fn disconnect(&self, client: i32, handle: u64, disposition: u32) -> Result<u32> {
        log::debug!("pcsc rpc: client {client}, disconnect 0x{handle:016x}");
        let mut buf = Self::request(cmd::DISCONNECT);
        buf.write_u64_le(handle).write_u32_le(disposition);
        let reply = self.call(buf).await?;
        StreamRef::new(&reply).read_u32_le()
    }

    pub async fn begin_transaction(&self, client: i32, handle: u64) -> Result<u32> {
        log::debug!("pcsc rpc: client {client}, begin transaction");
        let mut buf = Self::request(cmd::BEGIN_TRANSACTION);
        buf.write_u64_le(handle);
        let reply = self.call(buf).await?;
        StreamRef::new(&reply).read_u32_le()
    }

    pub async fn end_transaction(&self, client: i32, handle: u64, disposition: u32) -> Result<u32> {
        log::debug!("pcsc rpc: client {client}, end transaction");
        let mut buf = Self::request(cmd::END_TRANSACTION);
        buf.write_u64_le(handle).write_u32_le(disposition);
        let reply = self.call(buf).await?;
        StreamRef::new(&reply).read_u32_le()
    }

    /// Transmit an APDU. Returns `(recv_protocol, recv_pci_len, data,
    /// status)`.
    pub async fn transmit(
        &self,
        client: i32,
        handle: u64,
        send_pci_protocol: u32,
        send_pci_length: u32,
        recv_length: u32,
        data: &[u8],
    ) -> Result<(u32, u32, Vec<u8>, u32)> {
        log::debug!("pcsc rpc: client {client}, transmit {} bytes", data.len());
        let mut buf = Self::request(cmd::TRANSMIT);
        buf.write_u64_le(handle)
            .write_u32_le(send_pci_protocol)
            .write_u32_le(send_pci_length)
            .write_u32_le(recv_length)
            .write_u32_le(data.len() as u32)
            .write_bytes(data);
        let reply = self.call(buf).await?;
        let mut cur = StreamRef::new(&reply);
        let recv_protocol = cur.read_u32_le()?;
        let recv_pci_len = cur.read_u32_le()?;
        let data_len = cur.read_u32_le()? as usize;
        let status = cur.read_u32_le()?;
        let payload = cur.read_bytes(data_len)?.to_vec();
        Ok((recv_protocol, recv_pci_len, payload, status))
    }

    /// Card status: `(reader name, state, protocol, atr, status)`.
    pub async fn status(&self, client: i32, handle: u64) -> Result<(String, u32, u32, Vec<u8>, u32)> {
        log::debug!("pcsc rpc: client {client}, status");
        let mut buf = Self::request(cmd::STATUS);
        buf.write_u64_le(handle);
        let reply = self.call(buf).await?;
        let mut cur = StreamRef::new(&reply);
        let name_len = cur.read_u32_le()? as usize;
        if name_len > MAX_READER_NAME {
            return Err(LtsmError::Protocol("reader name too long".into()));
        }
        let name = String::from_utf8_lossy(cur.read_bytes(name_len)?).into_owned();
        let state = cur.read_u32_le()?;
        let protocol = cur.read_u32_le()?;
        let atr_len = cur.read_u32_le()? as usize;
        if atr_len > MAX_ATR_SIZE {
            return Err(LtsmError::Protocol(format!("ATR length {atr_len} exceeds 33")));
        }
        let atr = cur.read_bytes(atr_len)?.to_vec();
        let status = cur.read_u32_le()?;
        Ok((name, state, protocol, atr, status))
    }

    /// Queries state changes for the given readers; updates `states` in
    /// place and returns the call status.
    pub async fn get_status_change(
        &self,
        client: i32,
        context: u64,
        timeout_ms: u32,
        states: &mut [StatusQuery],
    ) -> Result<u32> {
        log::debug!(
            "pcsc rpc: client {client}, get status change, {} readers, timeout {timeout_ms}",
            states.len()
        );
        let mut buf = Self::request(cmd::GET_STATUS_CHANGE);
        buf.write_u64_le(context)
            .write_u32_le(timeout_ms)
            .write_u32_le(states.len() as u32);
        for query in states.iter() {
            buf.write_u32_le(query.current_state)
                .write_u32_le(query.reader.len() as u32)
                .write_bytes(query.reader.as_bytes());
        }
        let reply = self.call(buf).await?;
        let mut cur = StreamRef::new(&reply);
        let count = cur.read_u32_le()? as usize;
        let status = cur.read_u32_le()?;
        for i in 0..count {
            let current = cur.read_u32_le()?;
            let event = cur.read_u32_le()?;
            let name_len = cur.read_u32_le()? as usize;
            let atr_len = cur.read_u32_le()? as usize;
            if name_len > MAX_READER_NAME {
                return Err(LtsmError::Protocol("reader name too long".into()));
            }
            if atr_len > MAX_ATR_SIZE {
                return Err(LtsmError::Protocol(format!("ATR length {atr_len} exceeds 33")));
            }
            let name = String::from_utf8_lossy(cur.read_bytes(name_len)?).into_owned();
            let atr = cur.read_bytes(atr_len)?.to_vec();
            if let Some(slot) = states.get_mut(i) {
                slot.current_state = current;
                slot.event_state = event;
                slot.atr = atr;
                if slot.reader.is_empty() {
                    slot.reader = name;
                }
            }
        }
        Ok(status)
    }

    /// Device control: `(returned bytes, status)`.
    pub async fn control(
        &self,
        client: i32,
        handle: u64,
        control_code: u32,
        recv_length: u32,
        data: &[u8],
    ) -> Result<(Vec<u8>, u32)> {
        log::debug!("pcsc rpc: client {client}, control 0x{control_code:08x}");
        let mut buf = Self::request(cmd::CONTROL);
        buf.write_u64_le(handle)
            .write_u32_le(control_code)
            .write_u32_le(data.len() as u32)
            .write_u32_le(recv_length)
            .write_bytes(data);
        let reply = self.call(buf).await?;
        let mut cur = StreamRef::new(&reply);
        let returned = cur.read_u32_le()? as usize;
        let status = cur.read_u32_le()?;
        let payload = cur.read_bytes(returned)?.to_vec();
        Ok((payload, status))
    }

    pub async fn get_attrib(&self, client: i32, handle: u64, attr_id: u32) -> Result<(Vec<u8>, u32)> {
        log::debug!("pcsc rpc: client {client}, get attrib 0x{attr_id:08x}");
        let mut buf = Self::request(cmd::GET_ATTRIB);
        buf.write_u64_le(handle).write_u32_le(attr_id);
        let reply = self.call(buf).await?;
        let mut cur = StreamRef::new(&reply);
        let len = cur.read_u32_le()? as usize;
        let status = cur.read_u32_le()?;
        let payload = cur.read_bytes(len)?.to_vec();
        Ok((payload, status))
    }

    pub async fn set_attrib(
        &self,
        client: i32,
        handle: u64,
        attr_id: u32,
        attr: &[u8],
    ) -> Result<u32> {
        log::debug!("pcsc rpc: client {client}, set attrib 0x{attr_id:08x}");
        let mut buf = Self::request(cmd::SET_ATTRIB);
        buf.write_u64_le(handle)
            .write_u32_le(attr_id)
            .write_u32_le(attr.len() as u32)
            .write_bytes(attr);
        let reply = self.call(buf).await?;
        StreamRef::new(&reply).read_u32_le()
    }

    pub async fn cancel(&self, client: i32, context: u64) -> Result<u32> {
        log::debug!("pcsc rpc: client {client}, cancel");
        let mut buf = Self::request(cmd::CANCEL);
        buf.write_u64_le(context);
        let reply = self.call(buf).await?;
        StreamRef::new(&reply).read_u32_le()
    }

    /// Silent table refresh: list the readers and poll each one once
    /// with a zero timeout.
    pub async fn sync_readers(&self, client: i32, context: u64) -> Result<Vec<ReaderState>> {
        let names = self.list_readers(client, context).await?;
        let mut fresh = Vec::with_capacity(names.len());
        for name in names {
            let mut query = [StatusQuery {
                reader: name.clone(),
                ..StatusQuery::default()
            }];
            let status = self.get_status_change(client, context, 0, &mut query).await?;
            let mut reader = ReaderState {
                name,
                ..ReaderState::default()
            };
            if status == super::scard::S_SUCCESS {
                reader.state = query[0].event_state;
                reader.atr = query[0].atr.clone();
            }
            fresh.push(reader);
        }
        Ok(fresh)
    }
}
