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

//! Viewer-side smart-card service: answers the channel RPC against the
//! platform PC/SC backend that owns the physically attached reader.
//!
//! The platform surface is abstracted behind [`PcscBackend`];
//! [`MockCardBackend`] implements a virtual reader with a virtual card
//! for tests and the `--smartcard` demo path.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{cmd, scard, state, MAX_ATR_SIZE, PCSC_OP_INIT};
use crate::channel::ChannelWriter;
use crate::error::{LtsmError, Result};
use crate::stream::{StreamBuf, StreamRef};

/// Outcome of a GetStatusChange query for one reader.
#[derive(Debug, Clone, Default)]
pub struct ReaderEvent {
    pub current_state: u32,
    pub event_state: u32,
    pub name: String,
    pub atr: Vec<u8>,
}

/// The platform PC/SC surface the service calls into. Status codes are
/// returned in-band, matching the wire contract, so a failing call is
/// not a transport error.
pub trait PcscBackend: Send {
    fn establish_context(&mut self, scope: u32) -> (u64, u32);
    fn release_context(&mut self, context: u64) -> u32;
    fn list_readers(&mut self, context: u64) -> Vec<String>;
    /// `(handle, active_protocol, status)`.
    fn connect(&mut self, context: u64, reader: &str, share_mode: u32, protocols: u32)
        -> (u64, u32, u32);
    /// `(active_protocol, status)`.
    fn reconnect(&mut self, handle: u64, share_mode: u32, protocols: u32, initialization: u32)
        -> (u32, u32);
    fn disconnect(&mut self, handle: u64, disposition: u32) -> u32;
    fn begin_transaction(&mut self, handle: u64) -> u32;
    fn end_transaction(&mut self, handle: u64, disposition: u32) -> u32;
    /// `(recv_protocol, recv_pci_len, response, status)`.
    fn transmit(&mut self, handle: u64, protocol: u32, pci_len: u32, recv_len: u32, apdu: &[u8])
        -> (u32, u32, Vec<u8>, u32);
    /// `(reader name, state, protocol, atr, status)`.
    fn status(&mut self, handle: u64) -> (String, u32, u32, Vec<u8>, u32);
    /// Fills `events`; returns the call status.
    fn get_status_change(&mut self, context: u64, timeout_ms: u32, events: &mut [ReaderEvent])
        -> u32;
    /// `(returned bytes, status)`.
    fn control(&mut self, handle: u64, code: u32, data: &[u8], recv_len: u32) -> (Vec<u8>, u32);
    fn get_attrib(&mut self, handle: u64, attr_id: u32) -> (Vec<u8>, u32);
    fn set_attrib(&mut self, handle: u64, attr_id: u32, attr: &[u8]) -> u32;
    fn cancel(&mut self, context: u64) -> u32;
}

impl PcscBackend for Box<dyn PcscBackend> {
    fn establish_context(&mut self, scope: u32) -> (u64, u32) {
        (**self).establish_context(scope)
    }

    fn release_context(&mut self, context: u64) -> u32 {
        (**self).release_context(context)
    }

    fn list_readers(&mut self, context: u64) -> Vec<String> {
        (**self).list_readers(context)
    }

    fn connect(&mut self, context: u64, reader: &str, share_mode: u32, protocols: u32)
        -> (u64, u32, u32) {
        (**self).connect(context, reader, share_mode, protocols)
    }

    fn reconnect(&mut self, handle: u64, share_mode: u32, protocols: u32, initialization: u32)
        -> (u32, u32) {
        (**self).reconnect(handle, share_mode, protocols, initialization)
    }

    fn disconnect(&mut self, handle: u64, disposition: u32) -> u32 {
        (**self).disconnect(handle, disposition)
    }

    fn begin_transaction(&mut self, handle: u64) -> u32 {
        (**self).begin_transaction(handle)
    }

    fn end_transaction(&mut self, handle: u64, disposition: u32) -> u32 {
        (**self).end_transaction(handle, disposition)
    }

    fn transmit(&mut self, handle: u64, protocol: u32, pci_len: u32, recv_len: u32, apdu: &[u8])
        -> (u32, u32, Vec<u8>, u32) {
        (**self).transmit(handle, protocol, pci_len, recv_len, apdu)
    }

    fn status(&mut self, handle: u64) -> (String, u32, u32, Vec<u8>, u32) {
        (**self).status(handle)
    }

    fn get_status_change(&mut self, context: u64, timeout_ms: u32, events: &mut [ReaderEvent])
        -> u32 {
        (**self).get_status_change(context, timeout_ms, events)
    }

    fn control(&mut self, handle: u64, code: u32, data: &[u8], recv_len: u32) -> (Vec<u8>, u32) {
        (**self).control(handle, code, data, recv_len)
    }

    fn get_attrib(&mut self, handle: u64, attr_id: u32) -> (Vec<u8>, u32) {
        (**self).get_attrib(handle, attr_id)
    }

    fn set_attrib(&mut self, handle: u64, attr_id: u32, attr: &[u8]) -> u32 {
        (**self).set_attrib(handle, attr_id, attr)
    }

    fn cancel(&mut self, context: u64) -> u32 {
        (**self).cancel(context)
    }
}

/// Serves RPC requests from the channel until it closes.
pub async fn serve<B: PcscBackend>(
    mut backend: B,
    writer: ChannelWriter,
    mut inbound: mpsc::Receiver<Bytes>,
) -> Result<()> {
    while let Some(frame) = inbound.recv().await {
        let reply = match handle_request(&mut backend, &frame) {
            Ok(reply) => reply,
            Err(LtsmError::Underflow) => {
                log::warn!("pcsc service: truncated request, channel closing");
                return Err(LtsmError::Protocol("truncated pcsc request".into()));
            }
            Err(err) => return Err(err),
        };
        writer.push(reply.into_bytes()).await?;
    }
    Ok(())
}

fn handle_request<B: PcscBackend>(backend: &mut B, frame: &[u8]) -> Result<StreamBuf> {
    let mut cur = StreamRef::new(frame);
    let marker = cur.read_u16_le()?;
    if marker != PCSC_OP_INIT {
        return Err(LtsmError::Protocol(format!(
            "bad pcsc request marker 0x{marker:04x}"
        )));
    }
    let command = cur.read_u16_le()? as u32;
    let mut reply = StreamBuf::with_capacity(64);

    match command {
        cmd::ESTABLISH_CONTEXT => {
            let scope = cur.read_u32_le()?;
            let (context, status) = backend.establish_context(scope);
            reply.write_u64_le(context).write_u32_le(status);
        }
        cmd::RELEASE_CONTEXT => {
            let context = cur.read_u64_le()?;
            reply.write_u32_le(backend.release_context(context));
        }
        cmd::LIST_READERS => {
            let context = cur.read_u64_le()?;
            let readers = backend.list_readers(context);
            reply.write_u32_le(readers.len() as u32);
            for name in readers {
                reply
                    .write_u32_le(name.len() as u32)
                    .write_bytes(name.as_bytes());
            }
        }
        cmd::CONNECT => {
            let context = cur.read_u64_le()?;
            let share_mode = cur.read_u32_le()?;
            let protocols = cur.read_u32_le()?;
            let name_len = cur.read_u32_le()? as usize;
            let name = String::from_utf8_lossy(cur.read_bytes(name_len)?).into_owned();
            let (handle, protocol, status) =
                backend.connect(context, &name, share_mode, protocols);
            reply
                .write_u64_le(handle)
                .write_u32_le(protocol)
                .write_u32_le(status);
        }
        cmd::RECONNECT => {
            let handle = cur.read_u64_le()?;
            let share_mode = cur.read_u32_le()?;
            let protocols = cur.read_u32_le()?;
            let initialization = cur.read_u32_le()?;
            let (protocol, status) =
                backend.reconnect(handle, share_mode, protocols, initialization);
            reply.write_u32_le(protocol).write_u32_le(status);
        }
        cmd::DISCONNECT => {
            let handle = cur.read_u64_le()?;
            let disposition = cur.read_u32_le()?;
            reply.write_u32_le(backend.disconnect(handle, disposition));
        }
        cmd::BEGIN_TRANSACTION => {
            let handle = cur.read_u64_le()?;
            reply.write_u32_le(backend.begin_transaction(handle));
        }
        cmd::END_TRANSACTION => {
            let handle = cur.read_u64_le()?;
            let disposition = cur.read_u32_le()?;
            reply.write_u32_le(backend.end_transaction(handle, disposition));
        }
        cmd::TRANSMIT => {
            let handle = cur.read_u64_le()?;
            let protocol = cur.read_u32_le()?;
            let pci_len = cur.read_u32_le()?;
            let recv_len = cur.read_u32_le()?;
            let data_len = cur.read_u32_le()? as usize;
            let apdu = cur.read_bytes(data_len)?;
            let (recv_protocol, recv_pci_len, response, status) =
                backend.transmit(handle, protocol, pci_len, recv_len, apdu);
            reply
                .write_u32_le(recv_protocol)
                .write_u32_le(recv_pci_len)
                .write_u32_le(response.len() as u32)
                .write_u32_le(status)
                .write_bytes(&response);
        }
        cmd::STATUS => {
            let handle = cur.read_u64_le()?;
            let (name, reader_state, protocol, atr, status) = backend.status(handle);
            let atr = &atr[..atr.len().min(MAX_ATR_SIZE)];
            reply
                .write_u32_le(name.len() as u32)
                .write_bytes(name.as_bytes())
                .write_u32_le(reader_state)
                .write_u32_le(protocol)
                .write_u32_le(atr.len() as u32)
                .write_bytes(atr)
                .write_u32_le(status);
        }
        cmd::GET_STATUS_CHANGE => {
            let context = cur.read_u64_le()?;
            let timeout = cur.read_u32_le()?;
            let count = cur.read_u32_le()? as usize;
            let mut events = Vec::with_capacity(count);
            for _ in 0..count {
                let current_state = cur.read_u32_le()?;
                let name_len = cur.read_u32_le()? as usize;
                let name = String::from_utf8_lossy(cur.read_bytes(name_len)?).into_owned();
                events.push(ReaderEvent {
                    current_state,
                    name,
                    ..ReaderEvent::default()
                });
            }
            let status = backend.get_status_change(context, timeout, &mut events);
            reply.write_u32_le(events.len() as u32).write_u32_le(status);
            for event in &events {
                let atr = &event.atr[..event.atr.len().min(MAX_ATR_SIZE)];
                reply
                    .write_u32_le(event.current_state)
                    .write_u32_le(event.event_state)
                    .write_u32_le(event.name.len() as u32)
                    .write_u32_le(atr.len() as u32)
                    .write_bytes(event.name.as_bytes())
                    .write_bytes(atr);
            }
        }
        cmd::CONTROL => {
            let handle = cur.read_u64_le()?;
            let code = cur.read_u32_le()?;
            let data_len = cur.read_u32_le()? as usize;
            let recv_len = cur.read_u32_le()?;
            let data = cur.read_bytes(data_len)?;
            let (out, status) = backend.control(handle, code, data, recv_len);
            reply
                .write_u32_le(out.len() as u32)
                .write_u32_le(status)
                .write_bytes(&out);
        }
        cmd::GET_ATTRIB => {
            let handle = cur.read_u64_le()?;
            let attr_id = cur.read_u32_le()?;
            let (out, status) = backend.get_attrib(handle, attr_id);
            reply
                .write_u32_le(out.len() as u32)
                .write_u32_le(status)
                .write_bytes(&out);
        }
        cmd::SET_ATTRIB => {
            let handle = cur.read_u64_le()?;
            let attr_id = cur.read_u32_le()?;
            let len = cur.read_u32_le()? as usize;
            let attr = cur.read_bytes(len)?;
            reply.write_u32_le(backend.set_attrib(handle, attr_id, attr));
        }
        cmd::CANCEL => {
            let context = cur.read_u64_le()?;
            reply.write_u32_le(backend.cancel(context));
        }
        other => {
            return Err(LtsmError::Protocol(format!(
                "unknown pcsc command 0x{other:02x}"
            )));
        }
    }
    Ok(reply)
}

/// A virtual reader with a permanently inserted virtual card. ATRs and
/// APDUs are synthetic; the state machine (contexts, handles, the
/// transaction flag) is real.
pub struct MockCardBackend {
    reader_name: String,
    atr: Vec<u8>,
    next_context: u64,
    next_handle: u64,
    contexts: HashMap<u64, Vec<u64>>,
    handles: HashMap<u64, bool>, // handle -> in transaction
}

impl Default for MockCardBackend {
    fn default() -> Self {
        Self::new("Virtual Reader 00 00")
    }
}

impl MockCardBackend {
    pub fn new(reader_name: &str) -> Self {
        Self {
            reader_name: reader_name.into(),
            atr: vec![0x3B, 0x9F, 0x96, 0x80, 0x1F, 0xC7, 0x80, 0x31, 0xA0, 0x73],
            next_context: 0x0010_0000_0000_0001,
            next_handle: 0x0020_0000_0000_0001,
            contexts: HashMap::new(),
            handles: HashMap::new(),
        }
    }
}

impl PcscBackend for MockCardBackend {
    fn establish_context(&mut self, _scope: u32) -> (u64, u32) {
        let context = self.next_context;
        self.next_context += 1;
        self.contexts.insert(context, Vec::new());
        (context, scard::S_SUCCESS)
    }

    fn release_context(&mut self, context: u64) -> u32 {
        match self.contexts.remove(&context) {
            Some(handles) => {
                for handle in handles {
                    self.handles.remove(&handle);
                }
                scard::S_SUCCESS
            }
            None => scard::E_INVALID_HANDLE,
        }
    }

    fn list_readers(&mut self, _context: u64) -> Vec<String> {
        vec![self.reader_name.clone()]
    }

    fn connect(
        &mut self,
        context: u64,
        reader: &str,
        _share_mode: u32,
        protocols: u32,
    ) -> (u64, u32, u32) {
        if reader != self.reader_name {
            return (0, 0, scard::E_UNKNOWN_READER);
        }
        let Some(owned) = self.contexts.get_mut(&context) else {
            return (0, 0, scard::E_INVALID_HANDLE);
        };
        let handle = self.next_handle;
        self.next_handle += 1;
        owned.push(handle);
        self.handles.insert(handle, false);
        // T=1 preferred, else T=0.
        let protocol = if protocols & 2 != 0 { 2 } else { 1 };
        (handle, protocol, scard::S_SUCCESS)
    }

    fn reconnect(&mut self, handle: u64, _share: u32, protocols: u32, _init: u32) -> (u32, u32) {
        if self.handles.contains_key(&handle) {
            (if protocols & 2 != 0 { 2 } else { 1 }, scard::S_SUCCESS)
        } else {
            (0, scard::E_INVALID_HANDLE)
        }
    }

    fn disconnect(&mut self, handle: u64, _disposition: u32) -> u32 {
        match self.handles.remove(&handle) {
            Some(_) => scard::S_SUCCESS,
            None => scard::E_INVALID_HANDLE,
        }
    }

    fn begin_transaction(&mut self, handle: u64) -> u32 {
        match self.handles.get_mut(&handle) {
            Some(flag) if !*flag => {
                *flag = true;
                scard::S_SUCCESS
            }
            Some(_) => scard::E_SHARING_VIOLATION,
            None => scard::E_INVALID_HANDLE,
        }
    }

    fn end_transaction(&mut self, handle: u64, _disposition: u32) -> u32 {
        match self.handles.get_mut(&handle) {
            Some(flag) if *flag => {
                *flag = false;
                scard::S_SUCCESS
            }
            Some(_) => scard::E_INVALID_VALUE,
            None => scard::E_INVALID_HANDLE,
        }
    }

    fn transmit(
        &mut self,
        handle: u64,
        protocol: u32,
        _pci_len: u32,
        recv_len: u32,
        apdu: &[u8],
    ) -> (u32, u32, Vec<u8>, u32) {
        if !self.handles.contains_key(&handle) {
            return (0, 0, Vec::new(), scard::E_INVALID_HANDLE);
        }
        // Echo the APDU back with a 90 00 status word.
        let mut response = apdu.to_vec();
        response.truncate(recv_len.saturating_sub(2) as usize);
        response.extend_from_slice(&[0x90, 0x00]);
        (protocol, 8, response, scard::S_SUCCESS)
    }

    fn status(&mut self, handle: u64) -> (String, u32, u32, Vec<u8>, u32) {
        if self.handles.contains_key(&handle) {
            (
                self.reader_name.clone(),
                state::PRESENT | state::POWERED,
                1,
                self.atr.clone(),
                scard::S_SUCCESS,
            )
        } else {
            (String::new(), 0, 0, Vec::new(), scard::E_INVALID_HANDLE)
        }
    }

    fn get_status_change(&mut self, _context: u64, _timeout: u32, events: &mut [ReaderEvent]) -> u32 {
        for event in events.iter_mut() {
            if event.name == self.reader_name {
                event.event_state = state::PRESENT;
                event.atr = self.atr.clone();
            } else {
                event.event_state = state::UNKNOWN;
            }
        }
        scard::S_SUCCESS
    }

    fn control(&mut self, handle: u64, _code: u32, _data: &[u8], _recv: u32) -> (Vec<u8>, u32) {
        if self.handles.contains_key(&handle) {
            (Vec::new(), scard::S_SUCCESS)
        } else {
            (Vec::new(), scard::E_INVALID_HANDLE)
        }
    }

    fn get_attrib(&mut self, handle: u64, _attr_id: u32) -> (Vec<u8>, u32) {
        if self.handles.contains_key(&handle) {
            (self.atr.clone(), scard::S_SUCCESS)
        } else {
            (Vec::new(), scard::E_INVALID_HANDLE)
        }
    }

    fn set_attrib(&mut self, handle: u64, _attr_id: u32, _attr: &[u8]) -> u32 {
        if self.handles.contains_key(&handle) {
            scard::S_SUCCESS
        } else {
            scard::E_INVALID_HANDLE
        }
    }

    fn cancel(&mut self, context: u64) -> u32 {
        if self.contexts.contains_key(&context) {
            scard::S_SUCCESS
        } else {
            scard::E_INVALID_HANDLE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(backend: &mut MockCardBackend, buf: StreamBuf) -> StreamBuf {
        handle_request(backend, &buf.into_bytes()).unwrap()
    }

    #[test]
    fn establish_then_connect_round_trip() {
        let mut backend = MockCardBackend::default();

        let mut req = StreamBuf::with_capacity(16);
        req.write_u16_le(PCSC_OP_INIT)
            .write_u16_le(cmd::ESTABLISH_CONTEXT as u16)
            .write_u32_le(2);
        let reply = call(&mut backend, req).into_bytes();
        let mut cur = StreamRef::new(&reply);
        let context = cur.read_u64_le().unwrap();
        assert_eq!(cur.read_u32_le().unwrap(), scard::S_SUCCESS);
        assert_ne!(context, 0);

        let name = "Virtual Reader 00 00";
        let mut req = StreamBuf::with_capacity(64);
        req.write_u16_le(PCSC_OP_INIT)
            .write_u16_le(cmd::CONNECT as u16)
            .write_u64_le(context)
            .write_u32_le(2)
            .write_u32_le(3)
            .write_u32_le(name.len() as u32)
            .write_bytes(name.as_bytes());
        let reply = call(&mut backend, req).into_bytes();
        let mut cur = StreamRef::new(&reply);
        let handle = cur.read_u64_le().unwrap();
        let protocol = cur.read_u32_le().unwrap();
        assert_eq!(cur.read_u32_le().unwrap(), scard::S_SUCCESS);
        assert_ne!(handle, 0);
        assert!(protocol == 1 || protocol == 2);
    }

    #[test]
    fn transmit_echoes_with_status_word() {
        let mut backend = MockCardBackend::default();
        let (context, _) = backend.establish_context(2);
        let (handle, _, _) = backend.connect(context, "Virtual Reader 00 00", 2, 3);

        let mut req = StreamBuf::with_capacity(64);
        req.write_u16_le(PCSC_OP_INIT)
            .write_u16_le(cmd::TRANSMIT as u16)
            .write_u64_le(handle)
            .write_u32_le(1)
            .write_u32_le(8)
            .write_u32_le(258)
            .write_u32_le(4)
            .write_bytes(&[0x00, 0xA4, 0x04, 0x00]);
        let reply = call(&mut backend, req).into_bytes();
        let mut cur = StreamRef::new(&reply);
        let _recv_protocol = cur.read_u32_le().unwrap();
        let _recv_pci = cur.read_u32_le().unwrap();
        let data_len = cur.read_u32_le().unwrap() as usize;
        assert_eq!(cur.read_u32_le().unwrap(), scard::S_SUCCESS);
        let data = cur.read_bytes(data_len).unwrap();
        assert_eq!(&data[data_len - 2..], &[0x90, 0x00]);
    }

    #[test]
    fn bad_marker_is_a_protocol_error() {
        let mut backend = MockCardBackend::default();
        let mut req = StreamBuf::with_capacity(8);
        req.write_u16_le(0xBEEF).write_u16_le(1);
        assert!(handle_request(&mut backend, &req.into_bytes()).is_err());
    }

    #[test]
    fn release_context_frees_handles() {
        let mut backend = MockCardBackend::default();
        let (context, _) = backend.establish_context(2);
        let (handle, _, status) = backend.connect(context, "Virtual Reader 00 00", 2, 1);
        assert_eq!(status, scard::S_SUCCESS);
        assert_eq!(backend.release_context(context), scard::S_SUCCESS);
        // Handle is gone with its context.
        assert_eq!(backend.disconnect(handle, 0), scard::E_INVALID_HANDLE);
    }

    #[test]
    fn mock_transaction_flag() {
        let mut backend = MockCardBackend::default();
        let (context, _) = backend.establish_context(2);
        let (handle, _, _) = backend.connect(context, "Virtual Reader 00 00", 2, 1);
        assert_eq!(backend.begin_transaction(handle), scard::S_SUCCESS);
        assert_eq!(backend.begin_transaction(handle), scard::E_SHARING_VIOLATION);
        assert_eq!(backend.end_transaction(handle, 0), scard::S_SUCCESS);
    }
}
