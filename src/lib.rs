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

//! # ltsm-remote
//!
//! The remote-desktop channel core of a Linux terminal service: an RFB
//! wire engine carrying a graphical session plus an extensible set of
//! device-redirection channels, multiplexed over one authenticated and
//! optionally TLS-protected TCP connection.
//!
//! ## Layers
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  Supervisor (accept loop, session table)      │
//! ├───────────────┬───────────────┬───────────────┤
//! │  RFB session  │  PC/SC proxy  │  Audio        │
//! │  (handshake,  │  (stub + RPC) │  redirect     │
//! │  encodings,   ├───────────────┴───────────────┤
//! │  input)       │  LTSM channel multiplexer     │
//! ├───────────────┴───────────────────────────────┤
//! │  TLS layer (VeNCrypt mid-handshake switch)    │
//! ├───────────────────────────────────────────────┤
//! │  Net/framing (buffered BE/LE integer streams) │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! The on-host display, the viewer window, platform audio and the
//! smart-card reader are collaborators behind traits ([`display`],
//! [`audio`], [`pcsc::service::PcscBackend`]); the core only moves bytes
//! between them under the protocol contract.
//!
//! ## Quick start (server)
//!
//! ```no_run
//! use ltsm_remote::display::HeadlessDisplay;
//! use ltsm_remote::server::{ServerConfig, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> ltsm_remote::Result<()> {
//!     let supervisor = Supervisor::new(ServerConfig::default(), || {
//!         HeadlessDisplay::new(1024, 768)
//!     });
//!     supervisor.run().await
//! }
//! ```

#![warn(clippy::all)]

pub mod audio;
pub mod auth;
pub mod channel;
pub mod display;
pub mod encoding;
pub mod error;
pub mod framebuffer;
pub mod keymap;
pub mod pcsc;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stream;
pub mod tls;
pub mod translate;
pub mod viewer;

pub use error::{LtsmError, Result};
pub use framebuffer::{Framebuffer, Region};
pub use protocol::{PixelFormat, PROTOCOL_VERSION};
pub use server::{ServerConfig, Supervisor};
pub use session::{Session, SessionConfig};
pub use viewer::{Viewer, ViewerConfig};

/// Default RFB port.
pub const DEFAULT_PORT: u16 = 5900;
