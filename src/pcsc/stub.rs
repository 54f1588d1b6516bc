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

//! Local PC/SC stub: the Unix-socket server applications connect to in
//! place of pcscd.
//!
//! Each local client speaks the PC/SC-Lite-style request/reply protocol
//! (`{u32 len, u32 cmd}` little-endian, then a fixed per-command body;
//! replies echo the body with outputs filled and the status last). State-
//! mutating commands are forwarded over the channel RPC; `GetVersion`,
//! `GetReaderState` and the `WaitReaderStateChange*` pair are answered
//! locally from the shared reader table.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;

use super::remote::PcscRemote;
use super::{cmd, local_id, scard, PcscShared, MAX_READER_NAME};
use crate::error::{LtsmError, Result};
use crate::stream::FramedStream;

/// Attribute buffer bytes carried inline by Get/SetAttrib bodies.
const MAX_BUFFER_SIZE: usize = 264;

/// Cancellation/stop poll granularity of the wait job.
const WAIT_POLL: Duration = Duration::from_millis(100);
/// How often a pending wait re-syncs the table against the remote.
const WAIT_RESYNC: Duration = Duration::from_secs(1);

/// Resolves the stub socket path: `$PCSCLITE_CSOCK_NAME`, else
/// `$XDG_RUNTIME_DIR/pcsc_csock`, else a /tmp fallback.
pub fn socket_path() -> PathBuf {
    if let Ok(path) = std::env::var("PCSCLITE_CSOCK_NAME") {
        return PathBuf::from(path);
    }
    if let Ok(runtime) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime).join("pcsc_csock");
    }
    PathBuf::from("/tmp/pcsc_csock")
}

/// Expected body length for a command at the given protocol version.
/// `None` means unknown command.
fn body_length(command: u32, api_version: u32) -> Option<usize> {
    Some(match command {
        cmd::ESTABLISH_CONTEXT => 12,
        cmd::RELEASE_CONTEXT => 8,
        cmd::CONNECT => 24 + MAX_READER_NAME,
        cmd::RECONNECT => 24,
        cmd::DISCONNECT => 12,
        cmd::BEGIN_TRANSACTION => 8,
        cmd::END_TRANSACTION => 12,
        cmd::TRANSMIT => 32,
        cmd::STATUS => 8,
        cmd::CONTROL => 24,
        cmd::GET_ATTRIB | cmd::SET_ATTRIB => 16 + MAX_BUFFER_SIZE,
        cmd::CANCEL => 8,
        cmd::GET_VERSION => 12,
        cmd::GET_READER_STATE => 0,
        cmd::WAIT_READER_STATE_CHANGE_START | cmd::WAIT_READER_STATE_CHANGE_STOP => {
            if api_version < 43 {
                8
            } else {
                0
            }
        }
        _ => return None,
    })
}

/// Stop/cancel flags shared between the client loop and its wait job.
#[derive(Default)]
struct WaitFlags {
    stopped: AtomicBool,
    canceled: AtomicBool,
}

/// The stub server: accept loop over the Unix socket.
pub struct PcscStub {
    path: PathBuf,
    shared: Arc<PcscShared>,
    remote: Arc<PcscRemote>,
    client_seq: AtomicI32,
}

impl PcscStub {
    pub fn new(path: PathBuf, shared: Arc<PcscShared>, remote: Arc<PcscRemote>) -> Self {
        Self {
            path,
            shared,
            remote,
            client_seq: AtomicI32::new(1),
        }
    }

    /// Binds and serves until the task is aborted. A stale socket file
    /// from a previous run is removed first.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let _ = std::fs::remove_file(&self.path);
        let listener = UnixListener::bind(&self.path)?;
        log::info!("pcsc stub listening on {}", self.path.display());

        loop {
            let (stream, _) = listener.accept().await?;
            let id = self.client_seq.fetch_add(1, Ordering::SeqCst);
            let shared = Arc::clone(&self.shared);
            let remote = Arc::clone(&self.remote);
            tokio::spawn(async move {
                let mut client = LocalClient::new(id, stream, shared, remote);
                if let Err(err) = client.run().await {
                    if !matches!(err, LtsmError::Closed) {
                        log::error!("pcsc client {id}: {err}");
                    }
                }
                client.release_on_exit().await;
            });
        }
    }
}

/// Per-connection stub state.
struct LocalClient {
    id: i32,
    sock: FramedStream<UnixStream>,
    shared: Arc<PcscShared>,
    remote: Arc<PcscRemote>,
    api_version: u32,
    context: u32,
    remote_context: u64,
    handle: u32,
    remote_handle: u64,
    transaction: Option<tokio::sync::OwnedMutexGuard<()>>,
    wait_flags: Arc<WaitFlags>,
    wait_done: Option<oneshot::Receiver<(u32, u32)>>,
}

impl LocalClient {
    fn new(id: i32, stream: UnixStream, shared: Arc<PcscShared>, remote: Arc<PcscRemote>) -> Self {
        Self {
            id,
            sock: FramedStream::new(stream),
            shared,
            remote,
            api_version: 42,
            context: 0,
            remote_context: 0,
            handle: 0,
            remote_handle: 0,
            transaction: None,
            wait_flags: Arc::new(WaitFlags::default()),
            wait_done: None,
        }
    }

    /// Releases the transaction lock and the remote context this client
    /// still holds, so nothing leaks on the reader side.
    async fn release_on_exit(&mut self) {
        self.wait_flags.canceled.store(true, Ordering::SeqCst);
        if self.transaction.take().is_some() {
            self.shared.set_transaction_owner(0);
            log::debug!("pcsc client {}: transaction released on exit", self.id);
        }
        if self.remote_context != 0 {
            // Releasing the context implicitly releases its handles.
            let _ = self
                .remote
                .release_context(self.id, self.remote_context)
                .await;
            self.remote_context = 0;
            self.context = 0;
        }
    }

    async fn run(&mut self) -> Result<()> {
        loop {
            // The wait job's deferred reply races with new commands; the
            // same socket carries both.
            if let Some(mut done) = self.wait_done.take() {
                tokio::select! {
                    finished = &mut done => {
                        if let Ok((timeout, status)) = finished {
                            self.sock.send_u32_le(timeout).send_u32_le(status);
                            self.sock.flush().await?;
                        }
                        continue;
                    }
                    header = Self::read_header(&mut self.sock) => {
                        self.wait_done = Some(done);
                        let (len, command) = header?;
                        self.dispatch(len, command).await?;
                    }
                }
            } else {
                let (len, command) = Self::read_header(&mut self.sock).await?;
                self.dispatch(len, command).await?;
            }
        }
    }

    async fn read_header(sock: &mut FramedStream<UnixStream>) -> Result<(usize, u32)> {
        let len = sock.recv_u32_le().await? as usize;
        let command = sock.recv_u32_le().await?;
        Ok((len, command))
    }

    /// Echo-shaped error reply: body-minus-status zeros, then the code.
    async fn reply_error(&mut self, command: u32, status: u32) -> Result<()> {
        if let Some(len) = body_length(command, self.api_version) {
            if len >= 4 {
                self.sock.send_zeros(len - 4).send_u32_le(status);
                self.sock.flush().await?;
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, len: usize, command: u32) -> Result<()> {
        let Some(expected) = body_length(command, self.api_version) else {
            return Err(LtsmError::Protocol(format!(
                "pcsc client {}: unknown command 0x{command:08x}",
                self.id
            )));
        };
        // Transmit and Control carry variable data after the fixed body.
        let variable = matches!(command, cmd::TRANSMIT | cmd::CONTROL);
        if (variable && len < expected) || (!variable && len != expected) {
            return Err(LtsmError::Protocol(format!(
                "pcsc client {}: bad length {len} for command 0x{command:02x}",
                self.id
            )));
        }

        log::debug!("pcsc client {}: command 0x{command:02x}, len {len}", self.id);

        match command {
            cmd::ESTABLISH_CONTEXT => self.on_establish_context().await,
            cmd::RELEASE_CONTEXT => self.on_release_context().await,
            cmd::CONNECT => self.on_connect().await,
            cmd::RECONNECT => self.on_reconnect().await,
            cmd::DISCONNECT => self.on_disconnect().await,
            cmd::BEGIN_TRANSACTION => self.on_begin_transaction().await,
            cmd::END_TRANSACTION => self.on_end_transaction().await,
            cmd::TRANSMIT => self.on_transmit().await,
            cmd::STATUS => self.on_status().await,
            cmd::CONTROL => self.on_control().await,
            cmd::GET_ATTRIB => self.on_get_attrib().await,
            cmd::SET_ATTRIB => self.on_set_attrib().await,
            cmd::CANCEL => self.on_cancel().await,
            cmd::GET_VERSION => self.on_get_version().await,
            cmd::GET_READER_STATE => self.on_get_reader_state().await,
            cmd::WAIT_READER_STATE_CHANGE_START => self.on_wait_start().await,
            cmd::WAIT_READER_STATE_CHANGE_STOP => self.on_wait_stop().await,
            _ => unreachable!("filtered by body_length"),
        }
    }

    async fn sync_readers(&mut self) -> u32 {
        match self
            .remote
            .sync_readers(self.id, self.remote_context)
            .await
        {
            Ok(fresh) => {
                self.shared.update_readers(&fresh);
                scard::S_SUCCESS
            }
            Err(err) => {
                log::warn!("pcsc client {}: reader sync failed: {err}", self.id);
                scard::E_NO_SERVICE
            }
        }
    }

    async fn on_establish_context(&mut self) -> Result<()> {
        let scope = self.sock.recv_u32_le().await?;
        self.sock.recv_skip(8).await?; // context, rv placeholders

        if self.context != 0 {
            log::error!("pcsc client {}: context already established", self.id);
            return self.reply_error(cmd::ESTABLISH_CONTEXT, scard::E_INVALID_PARAMETER).await;
        }

        let (remote_context, status) = self.remote.establish_context(self.id, scope).await?;
        if status == scard::S_SUCCESS {
            self.remote_context = remote_context;
            self.context = local_id(remote_context);
            self.sync_readers().await;
            log::debug!(
                "pcsc client {}: remote context 0x{remote_context:016x} -> local 0x{:08x}",
                self.id,
                self.context
            );
        }
        self.sock
            .send_u32_le(scope)
            .send_u32_le(self.context)
            .send_u32_le(status);
        self.sock.flush().await
    }

    async fn on_release_context(&mut self) -> Result<()> {
        let context = self.sock.recv_u32_le().await?;
        self.sock.recv_skip(4).await?;

        if context != self.context || self.context == 0 {
            return self.reply_error(cmd::RELEASE_CONTEXT, scard::E_INVALID_HANDLE).await;
        }
        let status = self.remote.release_context(self.id, self.remote_context).await?;
        if status == scard::S_SUCCESS {
            self.context = 0;
            self.remote_context = 0;
            self.handle = 0;
            self.remote_handle = 0;
        }
        self.sock.send_u32_le(context).send_u32_le(status);
        self.sock.flush().await
    }

    async fn on_connect(&mut self) -> Result<()> {
        let context = self.sock.recv_u32_le().await?;
        let share_mode = self.sock.recv_u32_le().await?;
        let protocols = self.sock.recv_u32_le().await?;
        let name_raw = self.sock.recv_exact(MAX_READER_NAME).await?;
        self.sock.recv_skip(12).await?; // handle, protocol, rv

        if context != self.context || self.context == 0 {
            return self.reply_error(cmd::CONNECT, scard::E_INVALID_HANDLE).await;
        }
        let name_end = name_raw.iter().position(|&b| b == 0).unwrap_or(name_raw.len());
        let reader = String::from_utf8_lossy(&name_raw[..name_end]).into_owned();
        if reader.is_empty() {
            return self.reply_error(cmd::CONNECT, scard::E_INVALID_VALUE).await;
        }

        let (remote_handle, protocol, status) = self
            .remote
            .connect(self.id, self.remote_context, share_mode, protocols, &reader)
            .await?;
        if status == scard::S_SUCCESS {
            self.remote_handle = remote_handle;
            self.handle = local_id(remote_handle);
        }
        self.sock
            .send_u32_le(context)
            .send_u32_le(share_mode)
            .send_u32_le(protocols)
            .send_all(&name_raw)
            .send_u32_le(self.handle)
            .send_u32_le(protocol)
            .send_u32_le(status);
        self.sock.flush().await
    }

    async fn on_reconnect(&mut self) -> Result<()> {
        let handle = self.sock.recv_u32_le().await?;
        let share_mode = self.sock.recv_u32_le().await?;
        let protocols = self.sock.recv_u32_le().await?;
        let initialization = self.sock.recv_u32_le().await?;
        self.sock.recv_skip(8).await?; // protocol, rv

        if handle != self.handle || self.handle == 0 {
            return self.reply_error(cmd::RECONNECT, scard::E_INVALID_HANDLE).await;
        }
        let (protocol, status) = self
            .remote
            .reconnect(self.id, self.remote_handle, share_mode, protocols, initialization)
            .await?;
        self.sock
            .send_u32_le(handle)
            .send_u32_le(share_mode)
            .send_u32_le(protocols)
            .send_u32_le(initialization)
            .send_u32_le(protocol)
            .send_u32_le(status);
        self.sock.flush().await
    }

    async fn on_disconnect(&mut self) -> Result<()> {
        let handle = self.sock.recv_u32_le().await?;
        let disposition = self.sock.recv_u32_le().await?;
        self.sock.recv_skip(4).await?;

        if handle != self.handle || self.handle == 0 {
            return self.reply_error(cmd::DISCONNECT, scard::E_INVALID_HANDLE).await;
        }
        let status = self
            .remote
            .disconnect(self.id, self.remote_handle, disposition)
            .await?;
        if status == scard::S_SUCCESS {
            self.handle = 0;
            self.remote_handle = 0;
        }
        self.sock
            .send_u32_le(handle)
            .send_u32_le(disposition)
            .send_u32_le(status);
        self.sock.flush().await
    }

    async fn on_begin_transaction(&mut self) -> Result<()> {
        let handle = self.sock.recv_u32_le().await?;
        self.sock.recv_skip(4).await?;

        if handle != self.handle || self.handle == 0 {
            return self.reply_error(cmd::BEGIN_TRANSACTION, scard::E_INVALID_HANDLE).await;
        }

        // Strict process-wide mutual exclusion: block until the current
        // owner ends its transaction or disconnects.
        let guard = self.shared.transaction_handle().lock_owned().await;
        let status = self.remote.begin_transaction(self.id, self.remote_handle).await?;
        if status == scard::S_SUCCESS {
            self.shared.set_transaction_owner(self.id);
            self.transaction = Some(guard);
        }
        self.sock.send_u32_le(handle).send_u32_le(status);
        self.sock.flush().await
    }

    async fn on_end_transaction(&mut self) -> Result<()> {
        let handle = self.sock.recv_u32_le().await?;
        let disposition = self.sock.recv_u32_le().await?;
        self.sock.recv_skip(4).await?;

        if handle != self.handle || self.handle == 0 {
            return self.reply_error(cmd::END_TRANSACTION, scard::E_INVALID_HANDLE).await;
        }
        if self.shared.transaction_owner() != self.id || self.transaction.is_none() {
            return self.reply_error(cmd::END_TRANSACTION, scard::E_SHARING_VIOLATION).await;
        }
        let status = self
            .remote
            .end_transaction(self.id, self.remote_handle, disposition)
            .await?;
        self.shared.set_transaction_owner(0);
        self.transaction = None;
        self.sock
            .send_u32_le(handle)
            .send_u32_le(disposition)
            .send_u32_le(status);
        self.sock.flush().await
    }

    async fn on_transmit(&mut self) -> Result<()> {
        let handle = self.sock.recv_u32_le().await?;
        let send_pci_protocol = self.sock.recv_u32_le().await?;
        let send_pci_length = self.sock.recv_u32_le().await?;
        let send_length = self.sock.recv_u32_le().await? as usize;
        let _recv_pci_protocol = self.sock.recv_u32_le().await?;
        let _recv_pci_length = self.sock.recv_u32_le().await?;
        let recv_length = self.sock.recv_u32_le().await?;
        self.sock.recv_skip(4).await?;
        let apdu = self.sock.recv_exact(send_length).await?;

        if handle != self.handle || self.handle == 0 {
            return self.reply_error(cmd::TRANSMIT, scard::E_INVALID_HANDLE).await;
        }
        let (recv_protocol, recv_pci_len, data, status) = self
            .remote
            .transmit(
                self.id,
                self.remote_handle,
                send_pci_protocol,
                send_pci_length,
                recv_length,
                &apdu,
            )
            .await?;
        self.sock
            .send_u32_le(handle)
            .send_u32_le(send_pci_protocol)
            .send_u32_le(send_pci_length)
            .send_u32_le(send_length as u32)
            .send_u32_le(recv_protocol)
            .send_u32_le(recv_pci_len)
            .send_u32_le(data.len() as u32)
            .send_u32_le(status)
            .send_all(&data);
        self.sock.flush().await
    }

    async fn on_status(&mut self) -> Result<()> {
        let handle = self.sock.recv_u32_le().await?;
        self.sock.recv_skip(4).await?;

        if handle != self.handle || self.handle == 0 {
            return self.reply_error(cmd::STATUS, scard::E_INVALID_HANDLE).await;
        }
        // The reply itself is minimal; the reader details land in the
        // shared table for GetReaderState.
        let (name, state, protocol, atr, status) =
            self.remote.status(self.id, self.remote_handle).await?;
        if status == scard::S_SUCCESS {
            let mut fresh = self.shared.snapshot();
            if let Some(slot) = fresh.iter_mut().find(|slot| slot.name == name) {
                slot.state = state;
                slot.protocol = protocol;
                slot.atr = atr;
                self.shared.update_readers(&fresh);
            }
        }
        self.sock.send_u32_le(handle).send_u32_le(status);
        self.sock.flush().await
    }

    async fn on_control(&mut self) -> Result<()> {
        let handle = self.sock.recv_u32_le().await?;
        let code = self.sock.recv_u32_le().await?;
        let send_length = self.sock.recv_u32_le().await? as usize;
        let recv_length = self.sock.recv_u32_le().await?;
        self.sock.recv_skip(8).await?; // bytesReturned, rv
        let data = self.sock.recv_exact(send_length).await?;

        if handle != self.handle || self.handle == 0 {
            return self.reply_error(cmd::CONTROL, scard::E_INVALID_HANDLE).await;
        }
        let (out, status) = self
            .remote
            .control(self.id, self.remote_handle, code, recv_length, &data)
            .await?;
        self.sock
            .send_u32_le(handle)
            .send_u32_le(code)
            .send_u32_le(send_length as u32)
            .send_u32_le(recv_length)
            .send_u32_le(out.len() as u32)
            .send_u32_le(status)
            .send_all(&out);
        self.sock.flush().await
    }

    async fn on_get_attrib(&mut self) -> Result<()> {
        let handle = self.sock.recv_u32_le().await?;
        let attr_id = self.sock.recv_u32_le().await?;
        let _len = self.sock.recv_u32_le().await?;
        self.sock.recv_skip(MAX_BUFFER_SIZE + 4).await?;

        if handle != self.handle || self.handle == 0 {
            return self.reply_error(cmd::GET_ATTRIB, scard::E_INVALID_HANDLE).await;
        }
        let (attr, status) = self
            .remote
            .get_attrib(self.id, self.remote_handle, attr_id)
            .await?;
        let mut padded = [0u8; MAX_BUFFER_SIZE];
        let take = attr.len().min(MAX_BUFFER_SIZE);
        padded[..take].copy_from_slice(&attr[..take]);
        self.sock
            .send_u32_le(handle)
            .send_u32_le(attr_id)
            .send_u32_le(take as u32)
            .send_all(&padded)
            .send_u32_le(status);
        self.sock.flush().await
    }

    async fn on_set_attrib(&mut self) -> Result<()> {
        let handle = self.sock.recv_u32_le().await?;
        let attr_id = self.sock.recv_u32_le().await?;
        let len = (self.sock.recv_u32_le().await? as usize).min(MAX_BUFFER_SIZE);
        let buffer = self.sock.recv_exact(MAX_BUFFER_SIZE).await?;
        self.sock.recv_skip(4).await?;

        if handle != self.handle || self.handle == 0 {
            return self.reply_error(cmd::SET_ATTRIB, scard::E_INVALID_HANDLE).await;
        }
        let status = self
            .remote
            .set_attrib(self.id, self.remote_handle, attr_id, &buffer[..len])
            .await?;
        self.sock
            .send_u32_le(handle)
            .send_u32_le(attr_id)
            .send_u32_le(len as u32)
            .send_all(&buffer)
            .send_u32_le(status);
        self.sock.flush().await
    }

    async fn on_cancel(&mut self) -> Result<()> {
        let context = self.sock.recv_u32_le().await?;
        self.sock.recv_skip(4).await?;

        if context != self.context || self.context == 0 {
            return self.reply_error(cmd::CANCEL, scard::E_INVALID_HANDLE).await;
        }
        self.wait_flags.canceled.store(true, Ordering::SeqCst);
        let status = self.remote.cancel(self.id, self.remote_context).await?;
        self.sock.send_u32_le(context).send_u32_le(status);
        self.sock.flush().await
    }

    async fn on_get_version(&mut self) -> Result<()> {
        let major = self.sock.recv_u32_le().await?;
        let minor = self.sock.recv_u32_le().await?;
        self.sock.recv_skip(4).await?;

        self.api_version = major * 10 + minor;
        log::debug!("pcsc client {}: protocol version {major}.{minor}", self.id);
        self.sock
            .send_u32_le(major)
            .send_u32_le(minor)
            .send_u32_le(scard::S_SUCCESS);
        self.sock.flush().await
    }

    async fn on_get_reader_state(&mut self) -> Result<()> {
        let table = self.shared.serialize_table();
        self.sock.send_all(&table.into_bytes());
        self.sock.flush().await
    }

    async fn on_wait_start(&mut self) -> Result<()> {
        if self.api_version < 43 {
            let timeout = self.sock.recv_u32_le().await?;
            self.sock.recv_skip(4).await?;

            self.wait_flags.stopped.store(false, Ordering::SeqCst);
            self.wait_flags.canceled.store(false, Ordering::SeqCst);

            let flags = Arc::clone(&self.wait_flags);
            let remote = Arc::clone(&self.remote);
            let shared = Arc::clone(&self.shared);
            let (tx, rx) = oneshot::channel();
            let id = self.id;
            let context = self.remote_context;
            tokio::spawn(async move {
                let status = wait_readers_changed(remote, shared, id, context, timeout, flags).await;
                let _ = tx.send((timeout, status));
            });
            self.wait_done = Some(rx);
            Ok(())
        } else {
            // 4.3+: synchronous snapshot after one silent refresh.
            let status = self.sync_readers().await;
            if status != scard::S_SUCCESS && status != scard::E_NO_READERS_AVAILABLE {
                log::warn!("pcsc client {}: wait snapshot sync: 0x{status:08x}", self.id);
            }
            let table = self.shared.serialize_table();
            self.sock.send_all(&table.into_bytes());
            self.sock.flush().await
        }
    }

    async fn on_wait_stop(&mut self) -> Result<()> {
        if self.api_version < 43 {
            let _timeout = self.sock.recv_u32_le().await?;
            self.sock.recv_skip(4).await?;
        }
        self.wait_flags.stopped.store(true, Ordering::SeqCst);
        self.sock.send_u32_le(0).send_u32_le(scard::S_SUCCESS);
        self.sock.flush().await
    }
}

/// The pre-4.3 asynchronous wait: resolves on a reader-state difference,
/// stop, cancel, or timeout. Stop and cancel are observed at 100 ms
/// granularity; the table re-syncs against the remote every second.
async fn wait_readers_changed(
    remote: Arc<PcscRemote>,
    shared: Arc<PcscShared>,
    client: i32,
    context: u64,
    timeout_ms: u32,
    flags: Arc<WaitFlags>,
) -> u32 {
    if timeout_ms == 0 {
        return match remote.sync_readers(client, context).await {
            Ok(fresh) => {
                shared.update_readers(&fresh);
                scard::S_SUCCESS
            }
            Err(_) => scard::E_NO_SERVICE,
        };
    }

    tokio::time::sleep(WAIT_POLL).await;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms as u64);
    let mut last_sync = tokio::time::Instant::now();

    loop {
        if flags.canceled.load(Ordering::SeqCst) {
            return scard::E_CANCELLED;
        }
        if flags.stopped.load(Ordering::SeqCst) {
            return scard::S_SUCCESS;
        }
        if tokio::time::Instant::now() >= deadline {
            return scard::E_TIMEOUT;
        }
        if last_sync.elapsed() >= WAIT_RESYNC {
            last_sync = tokio::time::Instant::now();
            match remote.sync_readers(client, context).await {
                Ok(fresh) => {
                    if shared.update_readers(&fresh) {
                        return scard::S_SUCCESS;
                    }
                }
                Err(_) => return scard::E_NO_SERVICE,
            }
        }
        tokio::time::sleep(WAIT_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelKind, ChannelMux, ChannelSpeed};
    use crate::pcsc::service::{self, MockCardBackend};
    use crate::protocol;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Wires a PcscRemote to a MockCardBackend service through two muxes,
    /// pumping frames both ways, and returns the remote.
    async fn wired_remote() -> Arc<PcscRemote> {
        use crate::channel::SystemMessage;

        let (mut smux, mut s_out) = ChannelMux::new();
        let (id, replies) = smux.open(ChannelKind::Pcsc, ChannelSpeed::Normal).await.unwrap();
        // Feed the peer's ack in so the channel counts as open.
        let ack = serde_json::to_vec(&SystemMessage::ChannelAck { id, ok: true }).unwrap();
        smux.dispatch(crate::protocol::LTSM_CHANNEL_ACK, id, ack.into())
            .await
            .unwrap();
        let remote = Arc::new(PcscRemote::new(smux.writer(id).unwrap(), replies));

        let (mut vmux, mut v_out) = ChannelMux::new();
        let inbound = vmux.accept(id, ChannelKind::Pcsc, ChannelSpeed::Normal).await.unwrap();
        let writer = vmux.writer(id).unwrap();
        tokio::spawn(service::serve(MockCardBackend::default(), writer, inbound));

        // Server -> viewer frames.
        tokio::spawn(async move {
            while let Some(frame) = s_out.recv().await {
                if frame.msg_type == protocol::LTSM_CHANNEL_DATA {
                    let _ = vmux.dispatch(frame.msg_type, frame.channel_id, frame.payload).await;
                }
            }
        });
        // Viewer -> server frames.
        tokio::spawn(async move {
            while let Some(frame) = v_out.recv().await {
                if frame.msg_type == protocol::LTSM_CHANNEL_DATA {
                    let _ = smux.dispatch(frame.msg_type, frame.channel_id, frame.payload).await;
                }
            }
        });
        remote
    }

    fn temp_socket(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ltsm-pcsc-test-{tag}-{}", std::process::id()))
    }

    async fn start_stub(tag: &str) -> (PathBuf, Arc<PcscShared>) {
        let remote = wired_remote().await;
        let shared = PcscShared::new();
        let path = temp_socket(tag);
        let stub = Arc::new(PcscStub::new(path.clone(), Arc::clone(&shared), remote));
        tokio::spawn(stub.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        (path, shared)
    }

    async fn send_request(sock: &mut UnixStream, command: u32, body: &[u8]) {
        sock.write_all(&(body.len() as u32).to_le_bytes()).await.unwrap();
        sock.write_all(&command.to_le_bytes()).await.unwrap();
        sock.write_all(body).await.unwrap();
    }

    async fn read_reply(sock: &mut UnixStream, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        sock.read_exact(&mut out).await.unwrap();
        out
    }

    fn u32_at(bytes: &[u8], off: usize) -> u32 {
        u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
    }

    async fn establish(sock: &mut UnixStream) -> u32 {
        let mut body = Vec::new();
        body.extend_from_slice(&2u32.to_le_bytes()); // scope = system
        body.extend_from_slice(&[0u8; 8]);
        send_request(sock, cmd::ESTABLISH_CONTEXT, &body).await;
        let reply = read_reply(sock, 12).await;
        assert_eq!(u32_at(&reply, 8), scard::S_SUCCESS);
        u32_at(&reply, 4)
    }

    async fn connect_reader(sock: &mut UnixStream, context: u32) -> u32 {
        let mut body = Vec::new();
        body.extend_from_slice(&context.to_le_bytes());
        body.extend_from_slice(&2u32.to_le_bytes()); // share
        body.extend_from_slice(&3u32.to_le_bytes()); // protocols
        let mut name = [0u8; MAX_READER_NAME];
        let reader = b"Virtual Reader 00 00";
        name[..reader.len()].copy_from_slice(reader);
        body.extend_from_slice(&name);
        body.extend_from_slice(&[0u8; 12]);
        send_request(sock, cmd::CONNECT, &body).await;
        let reply = read_reply(sock, 24 + MAX_READER_NAME).await;
        let handle = u32_at(&reply, 12 + MAX_READER_NAME);
        let protocol = u32_at(&reply, 16 + MAX_READER_NAME);
        assert_eq!(u32_at(&reply, 20 + MAX_READER_NAME), scard::S_SUCCESS);
        assert!(protocol == 1 || protocol == 2);
        handle
    }

    async fn begin_transaction(sock: &mut UnixStream, handle: u32) -> u32 {
        let mut body = Vec::new();
        body.extend_from_slice(&handle.to_le_bytes());
        body.extend_from_slice(&[0u8; 4]);
        send_request(sock, cmd::BEGIN_TRANSACTION, &body).await;
        let reply = read_reply(sock, 8).await;
        u32_at(&reply, 4)
    }

    #[tokio::test]
    async fn establish_populates_reader_table_and_connect_works() {
        let (path, shared) = start_stub("list").await;
        let mut sock = UnixStream::connect(&path).await.unwrap();

        let context = establish(&mut sock).await;
        assert_ne!(context, 0);
        assert_eq!(context & 0x8000_0000, 0);

        // The silent ListReaders + GetStatusChange populated slot 0.
        let snapshot = shared.snapshot();
        assert_eq!(snapshot[0].name, "Virtual Reader 00 00");
        assert!(!snapshot[0].atr.is_empty());

        let handle = connect_reader(&mut sock, context).await;
        assert_ne!(handle, 0);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn transaction_hands_over_on_disconnect() {
        let (path, shared) = start_stub("trans").await;

        let mut v1 = UnixStream::connect(&path).await.unwrap();
        let context1 = establish(&mut v1).await;
        let handle1 = connect_reader(&mut v1, context1).await;
        assert_eq!(begin_transaction(&mut v1, handle1).await, scard::S_SUCCESS);
        assert_ne!(shared.transaction_owner(), 0);

        let mut v2 = UnixStream::connect(&path).await.unwrap();
        let context2 = establish(&mut v2).await;
        let handle2 = connect_reader(&mut v2, context2).await;

        // V2 blocks; V1 disconnecting must release the lock.
        let v2_begin = tokio::spawn(async move {
            let status = begin_transaction(&mut v2, handle2).await;
            (status, v2)
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!v2_begin.is_finished());

        drop(v1);
        let (status, _v2) = tokio::time::timeout(Duration::from_secs(2), v2_begin)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, scard::S_SUCCESS);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn wait_stop_returns_success() {
        let (path, _shared) = start_stub("wait").await;
        let mut sock = UnixStream::connect(&path).await.unwrap();
        let _context = establish(&mut sock).await;

        // Old protocol: start a 5 s wait, then stop it.
        let mut body = Vec::new();
        body.extend_from_slice(&5000u32.to_le_bytes());
        body.extend_from_slice(&[0u8; 4]);
        send_request(&mut sock, cmd::WAIT_READER_STATE_CHANGE_START, &body).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        send_request(&mut sock, cmd::WAIT_READER_STATE_CHANGE_STOP, &body).await;

        // Stop ack arrives first, then the wait reply.
        let stop_reply = read_reply(&mut sock, 8).await;
        assert_eq!(u32_at(&stop_reply, 4), scard::S_SUCCESS);
        let wait_reply = tokio::time::timeout(Duration::from_secs(1), read_reply(&mut sock, 8))
            .await
            .unwrap();
        assert_eq!(u32_at(&wait_reply, 0), 5000);
        assert_eq!(u32_at(&wait_reply, 4), scard::S_SUCCESS);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn get_version_switches_wait_shape() {
        let (path, _shared) = start_stub("ver").await;
        let mut sock = UnixStream::connect(&path).await.unwrap();
        let _context = establish(&mut sock).await;

        let mut body = Vec::new();
        body.extend_from_slice(&4u32.to_le_bytes());
        body.extend_from_slice(&3u32.to_le_bytes());
        body.extend_from_slice(&[0u8; 4]);
        send_request(&mut sock, cmd::GET_VERSION, &body).await;
        let reply = read_reply(&mut sock, 12).await;
        assert_eq!(u32_at(&reply, 0), 4);
        assert_eq!(u32_at(&reply, 1 * 4), 3);

        // 4.3+: Start returns the whole table synchronously.
        send_request(&mut sock, cmd::WAIT_READER_STATE_CHANGE_START, &[]).await;
        let table = read_reply(
            &mut sock,
            crate::pcsc::READER_SLOTS * crate::pcsc::READER_STATE_WIRE_SIZE,
        )
        .await;
        // Slot 0 carries the virtual reader's name.
        assert_eq!(&table[..7], b"Virtual");
        let _ = std::fs::remove_file(&path);
    }
}
