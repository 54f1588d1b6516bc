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

//! Supervisor: the listening socket and the session table.
//!
//! The accept loop bootstraps one session task per connection and keeps
//! accepting. A session failure never takes the supervisor down; SIGTERM
//! or SIGINT stops accepting and winds the sessions down, which drains
//! in-flight updates and releases any held PC/SC transaction lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};

use crate::display::DisplayAdapter;
use crate::error::{LtsmError, Result};
use crate::keymap::Keymap;
use crate::session::{Session, SessionConfig};
use crate::tls::SecurityInfo;

/// Server configuration, loadable from a JSON file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub desktop_name: String,
    pub passwdfile: Option<std::path::PathBuf>,
    pub noauth: bool,
    pub notls: bool,
    pub tls_priority: Option<String>,
    pub tls_ca_file: Option<std::path::PathBuf>,
    pub tls_cert_file: Option<std::path::PathBuf>,
    pub tls_key_file: Option<std::path::PathBuf>,
    /// Encoding preference list, strongest first.
    pub encoding_preflist: Vec<String>,
    pub encoding_blacklist: Vec<String>,
    pub encoding_threads: usize,
    pub keymapfile: Option<std::path::PathBuf>,
    pub channels: bool,
    /// Socket path of the PC/SC stub; defaults from the environment.
    pub pcsc_socket: Option<std::path::PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".into(),
            port: 5900,
            desktop_name: "LTSM".into(),
            passwdfile: None,
            noauth: false,
            notls: false,
            tls_priority: None,
            tls_ca_file: None,
            tls_cert_file: None,
            tls_key_file: None,
            encoding_preflist: Vec::new(),
            encoding_blacklist: Vec::new(),
            encoding_threads: 2,
            keymapfile: None,
            channels: true,
            pcsc_socket: None,
        }
    }
}

impl ServerConfig {
    /// Loads the JSON config file.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| LtsmError::Protocol(format!("config {}: {e}", path.display())))
    }

    fn security(&self) -> SecurityInfo {
        SecurityInfo {
            auth_none: self.noauth || self.passwdfile.is_none(),
            auth_vnc: self.passwdfile.is_some(),
            passwd_file: self.passwdfile.clone(),
            auth_vencrypt: !self.notls,
            tls_anon: self.tls_cert_file.is_none(),
            tls_priority: self.tls_priority.clone(),
            ca_file: self.tls_ca_file.clone(),
            cert_file: self.tls_cert_file.clone(),
            key_file: self.tls_key_file.clone(),
        }
    }

    /// Builds the per-session configuration.
    pub fn session_config(&self) -> SessionConfig {
        let keymap = match &self.keymapfile {
            Some(path) => match Keymap::load(path) {
                Ok(map) => map,
                Err(err) => {
                    log::error!("keymap {} unusable: {err}", path.display());
                    Keymap::default()
                }
            },
            None => Keymap::default(),
        };
        SessionConfig {
            desktop_name: self.desktop_name.clone(),
            security: self.security(),
            preferred_encodings: self
                .encoding_preflist
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            blacklist_encodings: self
                .encoding_blacklist
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            encoding_threads: self.encoding_threads,
            keymap,
            enable_channels: self.channels,
            audio_source: None,
            pcsc_socket: self
                .pcsc_socket
                .clone()
                .or_else(|| Some(crate::pcsc::stub::socket_path())),
        }
    }
}

/// The accept loop. `displays` builds one display adapter per accepted
/// connection.
pub struct Supervisor<D, F>
where
    D: DisplayAdapter + 'static,
    F: Fn() -> D + Send + Sync + 'static,
{
    config: ServerConfig,
    displays: F,
    session_seq: AtomicUsize,
    sessions: Arc<Mutex<HashMap<usize, tokio::task::JoinHandle<()>>>>,
}

impl<D, F> Supervisor<D, F>
where
    D: DisplayAdapter + 'static,
    F: Fn() -> D + Send + Sync + 'static,
{
    pub fn new(config: ServerConfig, displays: F) -> Self {
        Self {
            config,
            displays,
            session_seq: AtomicUsize::new(1),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Binds and serves until SIGTERM/SIGINT.
    pub async fn run(&self) -> Result<()> {
        let listener =
            TcpListener::bind((self.config.address.as_str(), self.config.port)).await?;
        log::info!(
            "listening on {}:{}",
            self.config.address,
            self.config.port
        );

        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (tcp, peer) = accepted?;
                    log::info!("connection from {peer}");
                    self.spawn_session(tcp);
                }
                _ = tokio::signal::ctrl_c() => {
                    log::info!("interrupt, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    log::info!("terminated, shutting down");
                    break;
                }
            }
        }

        // Wind down every session; dropping the tasks releases their
        // channel state and any held transaction guard.
        let mut sessions = self.sessions.lock().expect("session table lock");
        for (id, task) in sessions.drain() {
            log::debug!("stopping session {id}");
            task.abort();
        }
        Ok(())
    }

    /// Serves exactly one already-accepted connection (inetd mode).
    pub async fn serve_one(&self, tcp: TcpStream) -> Result<()> {
        let display = (self.displays)();
        let config = self.config.session_config();
        let mut session = Session::handshake(0, tcp, display, config).await?;
        session.run().await
    }

    fn spawn_session(&self, tcp: TcpStream) {
        let id = self.session_seq.fetch_add(1, Ordering::SeqCst);
        let display = (self.displays)();
        let config = self.config.session_config();
        let sessions = Arc::clone(&self.sessions);

        let task = tokio::spawn(async move {
            match Session::handshake(id, tcp, display, config).await {
                Ok(mut session) => {
                    if let Err(err) = session.run().await {
                        log::error!("session {id}: {err}");
                    }
                }
                Err(err) => log::error!("session {id}: handshake failed: {err}"),
            }
            sessions.lock().expect("session table lock").remove(&id);
        });
        self.sessions
            .lock()
            .expect("session table lock")
            .insert(id, task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_sane() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 5900);
        assert!(config.channels);
        let security = config.security();
        assert!(security.auth_none);
        assert!(security.auth_vencrypt);
        assert!(security.tls_anon);
    }

    #[test]
    fn config_loads_from_json() {
        let dir = std::env::temp_dir().join("ltsm-server-config");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(
            &path,
            r#"{
                "port": 5901,
                "desktop-name": "test desktop",
                "notls": true,
                "encoding-preflist": ["zrle", "hextile"],
                "encoding-threads": 4
            }"#,
        )
        .unwrap();

        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.port, 5901);
        assert_eq!(config.desktop_name, "test desktop");
        assert!(config.notls);
        assert_eq!(config.encoding_preflist, vec!["zrle", "hextile"]);
        assert_eq!(config.encoding_threads, 4);
        // Unlisted keys keep their defaults.
        assert_eq!(config.address, "0.0.0.0");
        std::fs::remove_file(&path).unwrap();
    }
}
