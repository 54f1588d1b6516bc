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

//! `ltsm-server`: per-connection RFB connector behind a supervisor
//! accept loop. The display adapter wired here is the in-memory one; an
//! integration against a real windowing service plugs its own
//! `DisplayAdapter` through the library API.

use clap::Parser;

use ltsm_remote::display::HeadlessDisplay;
use ltsm_remote::server::{ServerConfig, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "ltsm-server", about = "LTSM remote-desktop channel server")]
struct Args {
    /// JSON configuration file.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Run detached; daemonization itself is delegated to the init
    /// system, the flag only silences the console.
    #[arg(long)]
    background: bool,

    /// Serve exactly one session on the socket inherited as stdin.
    #[arg(long)]
    inetd: bool,

    /// Listen port (overrides the config file).
    #[arg(long)]
    port: Option<u16>,

    /// Newline-delimited VNC password file.
    #[arg(long)]
    passwdfile: Option<std::path::PathBuf>,

    /// Xauthority file handed to the display adapter environment.
    #[arg(long)]
    authfile: Option<std::path::PathBuf>,
}

fn main() -> std::process::ExitCode {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = match &args.config {
        Some(path) => match ServerConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("ltsm-server: {err}");
                return std::process::ExitCode::FAILURE;
            }
        },
        None => ServerConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(passwdfile) = &args.passwdfile {
        config.passwdfile = Some(passwdfile.clone());
    }
    if let Some(authfile) = &args.authfile {
        std::env::set_var("XAUTHORITY", authfile);
    }
    if args.background {
        log::info!("background requested; relying on the service manager");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("ltsm-server: runtime: {err}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        let supervisor = Supervisor::new(config, || HeadlessDisplay::new(1024, 768));
        if args.inetd {
            serve_inetd(&supervisor).await
        } else {
            supervisor.run().await
        }
    });

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("ltsm-server: {err}");
            std::process::ExitCode::FAILURE
        }
    }
}

/// Serves the single connection inherited on stdin.
async fn serve_inetd<D, F>(supervisor: &Supervisor<D, F>) -> ltsm_remote::Result<()>
where
    D: ltsm_remote::display::DisplayAdapter + 'static,
    F: Fn() -> D + Send + Sync + 'static,
{
    use std::os::fd::FromRawFd;

    // fd 0 is the accepted socket under inetd; this process owns it.
    let std_stream = unsafe { std::net::TcpStream::from_raw_fd(0) };
    std_stream.set_nonblocking(true)?;
    let tcp = tokio::net::TcpStream::from_std(std_stream)?;
    supervisor.serve_one(tcp).await
}
