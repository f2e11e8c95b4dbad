// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

mod clock;
mod compositor;
mod config;
mod device;
mod error;
mod server;
mod session;
mod shm;
mod state;
mod timing;
mod waking_sender;

#[cfg(test)]
mod e2e;

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tracing::{debug, error, info};
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, Layer};

use crate::{
    compositor::{
        native::HeadlessCompositor,
        render::{RenderControl, RenderLoop},
    },
    config::{Config, DebugConfig},
    device::{DeviceTable, SimulatedProvider},
    server::Server,
    shm::ShmRegion,
    state::ServerState,
};

#[derive(Debug, Parser)]
#[command(name = "xrd")]
#[command(about = "The xrd OpenXR runtime service", long_about = None)]
struct Cli {
    /// The path to a config file. By default, /etc/xrd/xrd.toml is used
    /// (if present).
    #[arg(short = 'C', long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the service.
    Service {
        /// The control socket path. Overrides the config file.
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,
        /// Take the listening socket from the init system (LISTEN_FDS).
        #[arg(long)]
        socket_systemd: bool,
    },
    /// Print the device table and exit.
    Test,
}

enum Failure {
    Init(anyhow::Error),
    Runtime(anyhow::Error),
}

fn main() -> ExitCode {
    let args = Cli::parse();

    let debug_cfg = DebugConfig::from_env();
    if let Err(e) = init_logging(&debug_cfg) {
        eprintln!("failed to initialize logging: {e:#}");
        return ExitCode::from(1);
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(Failure::Init(e)) => {
            error!("initialization failed: {:#}", e);
            ExitCode::from(1)
        }
        Err(Failure::Runtime(e)) => {
            error!("runtime failure: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn run(args: Cli) -> Result<(), Failure> {
    let cfg = Config::new(args.config.as_ref())
        .context("failed to read config")
        .map_err(Failure::Init)?;

    match args.command {
        Command::Test => {
            let table = DeviceTable::simulated(&cfg);
            println!("{table}");
            Ok(())
        }
        Command::Service {
            socket,
            socket_systemd,
        } => run_service(cfg, socket, socket_systemd),
    }
}

fn run_service(
    mut cfg: Config,
    socket: Option<PathBuf>,
    socket_systemd: bool,
) -> Result<(), Failure> {
    // Override with command line flags.
    if let Some(socket) = socket {
        cfg.service.socket = Some(socket);
    } else if socket_systemd {
        cfg.service.socket_systemd = true;
    }

    debug!("starting up");

    let devices = DeviceTable::simulated(&cfg);
    let shm = ShmRegion::create(
        &devices,
        cfg.service.max_clients.get(),
        clock::now_ns() as u64,
    )
    .context("creating shared memory region")
    .map_err(Failure::Init)?;

    let (listener, socket_path) = bind_socket(&cfg).map_err(Failure::Init)?;

    let state = Arc::new(Mutex::new(ServerState::new(
        cfg.clone(),
        devices,
        shm,
        Box::new(SimulatedProvider::default()),
    )));

    let (gc_send, gc_recv) = crossbeam_channel::unbounded();
    let (render_send, render_recv) = crossbeam_channel::bounded(1);
    let (ready_send, ready_recv) = oneshot::channel();

    let native = HeadlessCompositor::new(cfg.display.frame_period_ns(), true);
    let render = RenderLoop::spawn(
        state.clone(),
        Box::new(native),
        gc_recv,
        render_recv,
        ready_send,
    );

    if ready_recv.recv().is_err() {
        return match render.join() {
            Ok(Err(e)) => Err(Failure::Init(e.context("render loop failed to start"))),
            _ => Err(Failure::Init(anyhow::anyhow!("render loop exited early"))),
        };
    }

    let mut srv = Server::new(listener, state, gc_send).map_err(Failure::Init)?;

    let closer = srv.closer();
    ctrlc::set_handler(move || {
        debug!("received SIGINT");
        closer.send(()).ok();
    })
    .context("installing signal handler")
    .map_err(Failure::Init)?;

    match &socket_path {
        Some(path) => info!(socket = %path.display(), "service running"),
        None => info!("service running on inherited socket"),
    }

    let run_res = srv.run().context("server exited").map_err(Failure::Runtime);

    // Stop the render loop regardless of how the server ended.
    render_send.send(RenderControl::Shutdown).ok();
    let render_res = match render.join() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Failure::Runtime(e.context("render loop failed"))),
        Err(_) => Err(Failure::Runtime(anyhow::anyhow!("render loop panicked"))),
    };

    if let Some(path) = socket_path {
        let _ = std::fs::remove_file(path);
    }

    run_res.and(render_res)
}

/// Binds the control socket, or adopts one passed in by the supervisor.
fn bind_socket(cfg: &Config) -> anyhow::Result<(uds::UnixSeqpacketListener, Option<PathBuf>)> {
    use std::os::fd::{FromRawFd, IntoRawFd};

    if cfg.service.socket_systemd {
        let mut listenfd = listenfd::ListenFd::from_env();
        for i in 0..listenfd.len() {
            if let Ok(Some(listener)) = listenfd.take_unix_listener(i) {
                debug!("using inherited socket {}", i);
                let listener =
                    unsafe { uds::UnixSeqpacketListener::from_raw_fd(listener.into_raw_fd()) };
                return Ok((listener, None));
            }
        }

        bail!("no inherited unix socket found");
    }

    let path = cfg.socket_path()?;

    // A stale socket from a crashed instance would block the bind.
    if path.exists() {
        std::fs::remove_file(&path)
            .context(format!("removing stale socket {}", path.display()))?;
    }

    let listener = uds::UnixSeqpacketListener::bind(&path)
        .context(format!("binding {}", path.display()))?;

    Ok((listener, Some(path)))
}

fn init_logging(debug_cfg: &DebugConfig) -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;

    let default_directive = if debug_cfg.trace {
        "xrd=trace"
    } else {
        "xrd=info"
    };

    let printed_log = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(default_directive.parse()?)
            .from_env_lossy(),
    );

    tracing_subscriber::registry().with(printed_log).init();

    Ok(())
}
