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

//! `ltsm-viewer`: the client CLI. Rendering, audio playback and the
//! smart-card reader live behind the library traits; this binary wires
//! headless endpoints, which is enough for protocol work, automation and
//! the redirection channels.
//!
//! Configuration layering: `/etc/ltsm/client.cfg`, then
//! `$HOME/.config/ltsm/client.cfg`, then the command line, one
//! `--long-arg [value]` per config line, later layers overriding.

use clap::Parser;

use ltsm_remote::audio::{AudioFormat, AudioSink};
use ltsm_remote::display::NullSurface;
use ltsm_remote::error::Result;
use ltsm_remote::pcsc::service::MockCardBackend;
use ltsm_remote::tls::SecurityInfo;
use ltsm_remote::viewer::{Viewer, ViewerConfig};

#[derive(Parser, Debug, Clone)]
#[command(name = "ltsm-viewer", about = "LTSM remote-desktop viewer")]
struct Args {
    /// Server host.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port.
    #[arg(long, default_value_t = 5900)]
    port: u16,

    /// Session user name (recorded; used by PKCS#11 login flows).
    #[arg(long)]
    username: Option<String>,

    /// VNC password. `LTSM_PASSWORD` is the fallback source.
    #[arg(long)]
    password: Option<String>,

    /// Read the password from the first line of this file.
    #[arg(long)]
    password_file: Option<std::path::PathBuf>,

    /// Open the window fullscreen.
    #[arg(long)]
    fullscreen: bool,

    /// Window geometry, `WxH`.
    #[arg(long)]
    geometry: Option<String>,

    /// Keep the window size fixed.
    #[arg(long)]
    fixed: bool,

    /// Preferred encoding name, with optional suffix options.
    #[arg(long)]
    encoding: Option<String>,

    /// Shortcut for `--encoding ltsm_qoi`.
    #[arg(long)]
    qoi: bool,
    /// Shortcut for `--encoding ltsm_lz4`.
    #[arg(long)]
    lz4: bool,
    /// Shortcut for `--encoding ltsm_tjpg`.
    #[arg(long)]
    tjpg: bool,
    /// Shortcut for `--encoding ffmpeg_h264`.
    #[arg(long)]
    h264: bool,
    /// Shortcut for `--encoding ffmpeg_av1`.
    #[arg(long)]
    av1: bool,
    /// Shortcut for `--encoding ffmpeg_vp8`.
    #[arg(long)]
    vp8: bool,

    /// Refuse VeNCrypt/TLS.
    #[arg(long)]
    notls: bool,

    /// TLS priority string (recorded; cipher policy is library-fixed).
    #[arg(long)]
    tls_priority: Option<String>,

    #[arg(long)]
    tls_ca_file: Option<std::path::PathBuf>,
    #[arg(long)]
    tls_cert_file: Option<std::path::PathBuf>,
    #[arg(long)]
    tls_key_file: Option<std::path::PathBuf>,

    /// Disable the LTSM channel extension.
    #[arg(long)]
    noltsm: bool,

    /// Reconnect after a lost connection instead of exiting.
    #[arg(long = "loop")]
    loop_: bool,

    /// Seamless mode anchor path (not built in; accepted and refused).
    #[arg(long)]
    seamless: Option<String>,

    /// Shared folder redirection (not built in; accepted and refused).
    #[arg(long)]
    share_folder: Option<std::path::PathBuf>,

    /// Printer redirection URL (not built in; accepted and refused).
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    printer: Option<String>,

    /// Scanner redirection URL (not built in; accepted and refused).
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    sane: Option<String>,

    /// Redirect the local smart-card reader.
    #[arg(long)]
    smartcard: bool,

    /// Accept redirected audio; optional codec preference.
    #[arg(long, num_args = 0..=1, default_missing_value = "pcm")]
    audio: Option<String>,

    /// PKCS#11 login module (recorded only).
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    pkcs11_auth: Option<String>,

    /// Extra config file to merge before the command line.
    #[arg(long)]
    load: Option<std::path::PathBuf>,

    /// Save the effective arguments to a config file and exit.
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    save: Option<String>,

    /// Debug log types (`all` when empty).
    #[arg(long, num_args = 0..=1, default_missing_value = "all")]
    debug: Option<String>,

    /// Trace-level logging.
    #[arg(long)]
    trace: bool,

    /// Log to syslog or the given file instead of stderr.
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    syslog: Option<String>,
}

/// Reads one layered config file: one `--long-arg [value]` per line.
fn config_file_args(path: &std::path::Path) -> Vec<String> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let mut args = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once(char::is_whitespace) {
            Some((flag, value)) => {
                args.push(flag.to_string());
                args.push(value.trim().to_string());
            }
            None => args.push(line.to_string()),
        }
    }
    args
}

/// Command line layered over the config files, later layers winning.
fn layered_args() -> Vec<String> {
    let mut layered = vec!["ltsm-viewer".to_string()];
    layered.extend(config_file_args(std::path::Path::new("/etc/ltsm/client.cfg")));
    if let Ok(home) = std::env::var("HOME") {
        layered.extend(config_file_args(
            &std::path::Path::new(&home).join(".config/ltsm/client.cfg"),
        ));
    }
    layered.extend(std::env::args().skip(1));
    layered
}

fn effective_encoding(args: &Args) -> Option<String> {
    if args.qoi {
        return Some("ltsm_qoi".into());
    }
    if args.lz4 {
        return Some("ltsm_lz4".into());
    }
    if args.tjpg {
        return Some("ltsm_tjpg".into());
    }
    if args.h264 {
        return Some("ffmpeg_h264".into());
    }
    if args.av1 {
        return Some("ffmpeg_av1".into());
    }
    if args.vp8 {
        return Some("ffmpeg_vp8".into());
    }
    args.encoding
        .as_ref()
        .map(|enc| enc.split(',').next().unwrap_or(enc).to_string())
}

/// Sink that counts what it plays and throws the samples away.
#[derive(Default)]
struct DiscardSink {
    bytes: usize,
}

impl AudioSink for DiscardSink {
    fn open(&mut self, format: &AudioFormat) -> Result<()> {
        log::info!(
            "audio open: encoding {}, {} ch, {} Hz",
            format.encoding,
            format.channels,
            format.samples_per_sec
        );
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.bytes += bytes.len();
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {
        log::info!("audio closed after {} bytes", self.bytes);
    }
}

fn build_config(args: &Args) -> ViewerConfig {
    let password = args.password.clone().or_else(|| {
        args.password_file.as_ref().and_then(|path| {
            std::fs::read_to_string(path)
                .ok()
                .and_then(|text| text.lines().next().map(str::to_string))
        })
    });

    ViewerConfig {
        host: args.host.clone(),
        port: args.port,
        password,
        security: SecurityInfo {
            tls_priority: args.tls_priority.clone(),
            ca_file: args.tls_ca_file.clone(),
            cert_file: args.tls_cert_file.clone(),
            key_file: args.tls_key_file.clone(),
            ..SecurityInfo::default()
        },
        no_tls: args.notls,
        encoding: effective_encoding(args),
        enable_ltsm: !args.noltsm,
        pcsc_backend: args
            .smartcard
            .then(|| Box::new(MockCardBackend::default()) as _),
        audio_sink: args
            .audio
            .is_some()
            .then(|| Box::new(DiscardSink::default()) as _),
        fullscreen: args.fullscreen,
    }
}

fn save_config(args: &Args, target: &str) -> std::io::Result<()> {
    let path = if target.is_empty() {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        std::path::Path::new(&home).join(".config/ltsm/client.cfg")
    } else {
        std::path::PathBuf::from(target)
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = String::new();
    out.push_str(&format!("--host {}\n--port {}\n", args.host, args.port));
    if let Some(enc) = effective_encoding(args) {
        out.push_str(&format!("--encoding {enc}\n"));
    }
    if args.notls {
        out.push_str("--notls\n");
    }
    if args.fullscreen {
        out.push_str("--fullscreen\n");
    }
    if args.smartcard {
        out.push_str("--smartcard\n");
    }
    if let Some(audio) = &args.audio {
        out.push_str(&format!("--audio {audio}\n"));
    }
    std::fs::write(&path, out)?;
    println!("saved: {}", path.display());
    Ok(())
}

fn main() -> std::process::ExitCode {
    let mut argv = layered_args();
    // --load merges one more file before the command line wins.
    if let Some(pos) = argv.iter().position(|a| a == "--load") {
        if let Some(path) = argv.get(pos + 1).cloned() {
            let extra = config_file_args(std::path::Path::new(&path));
            argv.splice(pos..pos + 2, extra);
        }
    }

    let args = match Args::try_parse_from(&argv) {
        Ok(args) => args,
        Err(err) => {
            // Unknown arguments print themselves and exit non-zero.
            let _ = err.print();
            return std::process::ExitCode::FAILURE;
        }
    };

    let filter = if args.trace {
        "trace"
    } else if args.debug.is_some() {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();
    if args.syslog.is_some() {
        log::info!("syslog output not built in; logging to stderr");
    }
    for (flag, set) in [
        ("--seamless", args.seamless.is_some()),
        ("--share-folder", args.share_folder.is_some()),
        ("--printer", args.printer.is_some()),
        ("--sane", args.sane.is_some()),
        ("--pkcs11-auth", args.pkcs11_auth.is_some()),
    ] {
        if set {
            log::warn!("{flag}: channel type not built in, ignored");
        }
    }

    if let Some(target) = &args.save {
        return match save_config(&args, target) {
            Ok(()) => std::process::ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("ltsm-viewer: save: {err}");
                std::process::ExitCode::FAILURE
            }
        };
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("ltsm-viewer: runtime: {err}");
            return std::process::ExitCode::FAILURE;
        }
    };

    if let Some(user) = &args.username {
        log::info!("session user: {user}");
    }
    let geometry = args.geometry.as_ref().and_then(|spec| {
        let (w, h) = spec.split_once('x')?;
        Some((w.parse::<u16>().ok()?, h.parse::<u16>().ok()?))
    });
    if args.geometry.is_some() && geometry.is_none() {
        eprintln!("ltsm-viewer: bad --geometry, expected WxH");
        return std::process::ExitCode::FAILURE;
    }

    loop {
        let config = build_config(&args);
        let result = runtime.block_on(async {
            let mut viewer = Viewer::connect(config, NullSurface::default()).await?;
            if let Some((width, height)) = geometry {
                if args.fixed {
                    log::info!("fixed geometry {width}x{height}");
                }
                viewer.send_desktop_size(width, height).await?;
            }
            viewer.run().await
        });

        match result {
            Ok(()) => return std::process::ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("ltsm-viewer: {err}");
                if !args.loop_ {
                    return std::process::ExitCode::FAILURE;
                }
                log::info!("reconnecting shortly");
                std::thread::sleep(std::time::Duration::from_secs(2));
            }
        }
    }
}
