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

//! Smart-card (PC/SC) redirection.
//!
//! Applications inside the session speak the PC/SC-Lite domain-socket
//! protocol to the local stub ([`stub`]); the stub translates each call
//! into the channel RPC ([`remote`]) answered on the viewer by the
//! backend service ([`service`]), which owns the physically attached
//! reader. Local 31-bit context/handle ids are derived from the 64-bit
//! remote values by CRC-32, so the application never sees raw remote
//! handles.
//!
//! Shared mutable state is confined to [`PcscShared`]: the reader-state
//! table and the process-wide transaction lock. Both are created once per
//! redirection helper and torn down with it.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use crate::stream::StreamBuf;

pub mod remote;
pub mod service;
pub mod stub;

/// PC/SC-Lite command codes, shared by the local stub protocol and the
/// channel RPC.
pub mod cmd {
    pub const ESTABLISH_CONTEXT: u32 = 0x01;
    pub const RELEASE_CONTEXT: u32 = 0x02;
    pub const LIST_READERS: u32 = 0x03;
    pub const CONNECT: u32 = 0x04;
    pub const RECONNECT: u32 = 0x05;
    pub const DISCONNECT: u32 = 0x06;
    pub const BEGIN_TRANSACTION: u32 = 0x07;
    pub const END_TRANSACTION: u32 = 0x08;
    pub const TRANSMIT: u32 = 0x09;
    pub const CONTROL: u32 = 0x0A;
    pub const STATUS: u32 = 0x0B;
    pub const GET_STATUS_CHANGE: u32 = 0x0C;
    pub const CANCEL: u32 = 0x0D;
    pub const CANCEL_TRANSACTION: u32 = 0x0E;
    pub const GET_ATTRIB: u32 = 0x0F;
    pub const SET_ATTRIB: u32 = 0x10;
    pub const GET_VERSION: u32 = 0x11;
    pub const GET_READER_STATE: u32 = 0x12;
    pub const WAIT_READER_STATE_CHANGE_START: u32 = 0x13;
    pub const WAIT_READER_STATE_CHANGE_STOP: u32 = 0x14;
}

/// Channel RPC marker word prefixing every request.
pub const PCSC_OP_INIT: u16 = 0xFD01;

/// PC/SC status codes (PC/SC-Lite superset).
pub mod scard {
    pub const S_SUCCESS: u32 = 0x0000_0000;
    pub const F_INTERNAL_ERROR: u32 = 0x8010_0001;
    pub const E_CANCELLED: u32 = 0x8010_0002;
    pub const E_INVALID_HANDLE: u32 = 0x8010_0003;
    pub const E_INVALID_PARAMETER: u32 = 0x8010_0004;
    pub const E_TIMEOUT: u32 = 0x8010_000A;
    pub const E_SHARING_VIOLATION: u32 = 0x8010_000B;
    pub const E_INVALID_VALUE: u32 = 0x8010_0011;
    pub const E_READER_UNAVAILABLE: u32 = 0x8010_0017;
    pub const E_NO_SERVICE: u32 = 0x8010_001D;
    pub const E_NO_READERS_AVAILABLE: u32 = 0x8010_002E;
    pub const E_UNKNOWN_READER: u32 = 0x8010_0009;
}

/// Reader state bit field (`SCARD_STATE_*` family).
pub mod state {
    pub const UNKNOWN: u32 = 0x0001;
    pub const ABSENT: u32 = 0x0002;
    pub const PRESENT: u32 = 0x0004;
    pub const SWALLOWED: u32 = 0x0008;
    pub const POWERED: u32 = 0x0010;
    pub const NEGOTIABLE: u32 = 0x0020;
    pub const SPECIFIC: u32 = 0x0040;
}

/// Longest reader name carried in the table, NUL included.
pub const MAX_READER_NAME: usize = 128;
/// Longest legal ATR; frames claiming more are rejected outright.
pub const MAX_ATR_SIZE: usize = 33;
/// Fixed slot count of the shared reader table.
pub const READER_SLOTS: usize = 128;
/// Serialized size of one reader slot on the local stub wire.
pub const READER_STATE_WIRE_SIZE: usize = MAX_READER_NAME + 4 + 4 + 4 + 36 + 4 + 4;

/// One slot of the shared reader table, mirroring the PC/SC-Lite event
/// handler layout.
#[derive(Debug, Clone)]
pub struct ReaderState {
    pub name: String,
    /// Card event counter.
    pub event: u32,
    /// `SCARD_STATE_*` bit field.
    pub state: u32,
    /// Sharing status.
    pub share: i32,
    pub atr: Vec<u8>,
    pub protocol: u32,
}

impl Default for ReaderState {
    fn default() -> Self {
        Self {
            name: String::new(),
            event: 0,
            state: 0,
            share: 0,
            atr: Vec::new(),
            protocol: 0,
        }
    }
}

impl ReaderState {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Serializes the fixed-size wire shape: name[128], event, state,
    /// share, atr[33]+pad[3], atrLen, protocol; integers little-endian.
    pub fn write_to(&self, buf: &mut StreamBuf) {
        let mut name = [0u8; MAX_READER_NAME];
        let take = self.name.len().min(MAX_READER_NAME - 1);
        name[..take].copy_from_slice(&self.name.as_bytes()[..take]);
        buf.write_bytes(&name);
        buf.write_u32_le(self.event);
        buf.write_u32_le(self.state);
        buf.write_u32_le(self.share as u32);
        let mut atr = [0u8; MAX_ATR_SIZE + 3];
        let atr_len = self.atr.len().min(MAX_ATR_SIZE);
        atr[..atr_len].copy_from_slice(&self.atr[..atr_len]);
        buf.write_bytes(&atr);
        buf.write_u32_le(atr_len as u32);
        buf.write_u32_le(self.protocol);
    }
}

/// Derives the 31-bit positive local id from a 64-bit remote value.
pub fn local_id(remote: u64) -> u32 {
    crc32fast::hash(&remote.to_le_bytes()) & 0x7FFF_FFFF
}

/// The two legitimate shared structures of the redirection helper: the
/// reader table and the transaction lock. Create one per helper process;
/// dropping it tears both down.
pub struct PcscShared {
    readers: Mutex<Vec<ReaderState>>,
    /// Process-wide transaction mutex; the owning guard lives in the
    /// holding client's state so a disconnect releases it.
    transaction: Arc<tokio::sync::Mutex<()>>,
    /// Stub client id currently holding the transaction, 0 when free.
    transaction_owner: AtomicI32,
}

impl PcscShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            readers: Mutex::new(vec![ReaderState::default(); READER_SLOTS]),
            transaction: Arc::new(tokio::sync::Mutex::new(())),
            transaction_owner: AtomicI32::new(0),
        })
    }

    /// Copy-out snapshot of the reader table.
    pub fn snapshot(&self) -> Vec<ReaderState> {
        self.readers.lock().expect("reader table lock").clone()
    }

    /// Serializes every slot for the local GetReaderState reply.
    pub fn serialize_table(&self) -> StreamBuf {
        let readers = self.readers.lock().expect("reader table lock");
        let mut buf = StreamBuf::with_capacity(readers.len() * READER_STATE_WIRE_SIZE);
        for slot in readers.iter() {
            slot.write_to(&mut buf);
        }
        buf
    }

    /// Replaces the table contents with the given readers, clearing the
    /// remaining slots. Returns true when anything changed.
    pub fn update_readers(&self, fresh: &[ReaderState]) -> bool {
        let mut readers = self.readers.lock().expect("reader table lock");
        let mut changed = false;
        for (i, slot) in readers.iter_mut().enumerate() {
            match fresh.get(i) {
                Some(new) => {
                    if slot.name != new.name
                        || slot.state != new.state
                        || slot.atr != new.atr
                        || slot.protocol != new.protocol
                    {
                        let event = slot.event.wrapping_add(1);
                        *slot = new.clone();
                        slot.event = event;
                        changed = true;
                    }
                }
                None => {
                    if !slot.is_empty() {
                        slot.reset();
                        changed = true;
                    }
                }
            }
        }
        changed
    }

    /// Clones the transaction mutex for an owned acquisition.
    pub fn transaction_handle(&self) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.transaction)
    }

    pub fn set_transaction_owner(&self, client: i32) {
        self.transaction_owner.store(client, Ordering::SeqCst);
    }

    pub fn transaction_owner(&self) -> i32 {
        self.transaction_owner.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_id_is_positive_and_stable() {
        let a = local_id(0xDEAD_BEEF_0123_4567);
        let b = local_id(0xDEAD_BEEF_0123_4567);
        assert_eq!(a, b);
        assert_eq!(a & 0x8000_0000, 0);
        assert_ne!(local_id(1), local_id(2));
    }

    #[test]
    fn reader_state_wire_size_is_fixed() {
        let mut buf = StreamBuf::with_capacity(256);
        let mut reader = ReaderState::default();
        reader.name = "Virtual Reader 0".into();
        reader.atr = vec![0x3B, 0x9F];
        reader.write_to(&mut buf);
        assert_eq!(buf.len(), READER_STATE_WIRE_SIZE);
    }

    #[test]
    fn update_readers_detects_change_and_bumps_event() {
        let shared = PcscShared::new();
        let mut reader = ReaderState::default();
        reader.name = "Reader0".into();
        reader.state = state::PRESENT;

        assert!(shared.update_readers(std::slice::from_ref(&reader)));
        // Unchanged content reports no change.
        assert!(!shared.update_readers(std::slice::from_ref(&reader)));

        reader.state = state::PRESENT | state::POWERED;
        assert!(shared.update_readers(std::slice::from_ref(&reader)));
        assert_eq!(shared.snapshot()[0].event, 2);
        // Removal clears the slot.
        assert!(shared.update_readers(&[]));
        assert!(shared.snapshot()[0].is_empty());
    }

    #[test]
    fn long_names_truncate_to_127_bytes() {
        let mut buf = StreamBuf::with_capacity(256);
        let mut reader = ReaderState::default();
        reader.name = "x".repeat(200);
        reader.write_to(&mut buf);
        let bytes = buf.into_bytes();
        // Byte 127 is the terminating NUL.
        assert_eq!(bytes[126], b'x');
        assert_eq!(bytes[127], 0);
    }
}
