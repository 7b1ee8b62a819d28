// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::sync::Arc;
use std::time::Duration;

use signal_hook::consts::signal::*;
use signal_hook::iterator::Signals;
use slog::info;
use slog::warn;
use structopt::StructOpt;
use tokio::sync::mpsc;

use common::LogFormat;
use discovery::daemon::AnnounceConfig;
use discovery::daemon::AnnounceMode;
use discovery::daemon::Daemon;
use discovery::link::SystemLinks;
use discovery::plat_linux as plat;
use discovery::session::Session;
use discovery::session::SessionConfig;
use discovery::watcher::InterfaceWatcher;
use discovery::DiscoveryError;
use discovery::DiscoveryResult;
use protocol::MacAddr;

#[derive(Debug, StructOpt)]
#[structopt(name = "lldp-discovery", about = "LLDP neighbor discovery")]
enum Args {
    /// Listen for neighbors and print what was found as JSON.
    Discover(DiscoverOpt),
    /// Announce this host on the network until interrupted.
    Announce(AnnounceOpt),
}

#[derive(Clone, Debug, StructOpt)]
struct LogOpt {
    #[structopt(long, help = "log file")]
    log_file: Option<String>,

    #[structopt(
        long,
        short = "l",
        default_value = "json",
        help = "format logs for 'human' or 'json' consumption"
    )]
    log_format: LogFormat,
}

#[derive(Clone, Debug, StructOpt)]
struct DiscoverOpt {
    #[structopt(
        long,
        short = "i",
        help = "interface to listen on; defaults to every physical interface"
    )]
    iface: Vec<String>,

    #[structopt(
        long,
        default_value = "1",
        help = "interfaces that must hear a neighbor"
    )]
    min_interfaces: usize,

    #[structopt(
        long,
        default_value = "1",
        help = "distinct MAC-identified switches that must be heard"
    )]
    min_neighbors: usize,

    #[structopt(
        long,
        default_value = "0",
        help = "seconds to wait for convergence; 0 picks the default"
    )]
    timeout: u64,

    #[structopt(long, help = "announce this host while discovering")]
    announce: bool,

    #[structopt(long, help = "exit successfully even if discovery timed out")]
    allow_partial: bool,

    #[structopt(flatten)]
    log: LogOpt,
}

#[derive(Clone, Debug, StructOpt)]
struct AnnounceOpt {
    #[structopt(
        long,
        short = "i",
        help = "interface to announce on; omit to follow link changes"
    )]
    iface: Vec<String>,

    #[structopt(long, help = "only answer advertisements we receive")]
    passive: bool,

    #[structopt(long, help = "answer the sender directly in passive mode")]
    unicast: bool,

    #[structopt(
        long,
        default_value = "5",
        help = "seconds between announcements"
    )]
    interval: u64,

    #[structopt(long = "name", short = "n", help = "SystemName to advertise")]
    system_name: Option<String>,

    #[structopt(
        long = "desc",
        short = "d",
        help = "SystemDescription to advertise"
    )]
    system_description: Option<String>,

    #[structopt(long, help = "advertised TTL in seconds")]
    ttl: Option<u64>,

    #[structopt(long, help = "advertise this MAC address instead")]
    source_mac: Option<MacAddr>,

    #[structopt(flatten)]
    log: LogOpt,
}

fn log_init(opts: &LogOpt) -> DiscoveryResult<slog::Logger> {
    Ok(common::logging::init(
        "lldp-discovery",
        &opts.log_file,
        opts.log_format,
    )?)
}

fn signals() -> DiscoveryResult<Signals> {
    const SIGNALS: &[std::ffi::c_int] = &[SIGTERM, SIGQUIT, SIGINT];
    Ok(Signals::new(SIGNALS)?)
}

async fn signal_handler(
    log: &slog::Logger,
    mut sigs: Signals,
) -> DiscoveryResult<()> {
    let log = log.new(slog::o!("unit" => "signal-handler"));
    let signal = tokio::task::spawn_blocking(move || sigs.forever().next())
        .await
        .map_err(|e| DiscoveryError::Other(format!("signal handler: {e}")))?;
    if let Some(signal) = signal {
        info!(&log, "caught signal {signal} - exiting");
    }
    Ok(())
}

async fn run_discover(opts: DiscoverOpt) -> DiscoveryResult<()> {
    let log = log_init(&opts.log)?;

    let interfaces = if opts.iface.is_empty() {
        plat::physical_interfaces()?
    } else {
        opts.iface.clone()
    };
    info!(log, "starting discovery"; "interfaces" => ?interfaces);

    let daemon = if opts.announce {
        let daemon = Daemon::new(&log, AnnounceConfig::default());
        daemon.run_static(&interfaces);
        Some(daemon)
    } else {
        None
    };

    let session = Session::start(
        &log,
        &SessionConfig {
            interfaces,
            min_interfaces: opts.min_interfaces,
            min_neighbors: opts.min_neighbors,
            timeout: Duration::from_secs(opts.timeout),
        },
    );
    let result = session.wait_for_convergence().await;
    if let Err(e) = &result {
        warn!(log, "discovery incomplete"; "error" => %e);
    }

    let report = serde_json::to_string_pretty(&session.registry().snapshot())
        .map_err(|e| format!("failed to serialize neighbors: {e}"))?;
    println!("{report}");

    if let Some(daemon) = daemon {
        daemon.shutdown_all().await;
    }
    session.shutdown().await;

    match result {
        Err(e) if !opts.allow_partial => Err(e),
        _ => Ok(()),
    }
}

fn announce_config(opts: &AnnounceOpt) -> DiscoveryResult<AnnounceConfig> {
    let mode = if opts.passive {
        AnnounceMode::PassiveReply
    } else {
        AnnounceMode::Broadcast {
            interval: Duration::from_secs(opts.interval),
        }
    };
    let mut config = AnnounceConfig {
        mode,
        reply_unicast: opts.unicast,
        source_address: opts.source_mac,
        ..Default::default()
    };
    if let Some(name) = &opts.system_name {
        config.system_name = name.clone();
    }
    if let Some(desc) = &opts.system_description {
        config.system_description = desc.clone();
    }
    if let Some(ttl) = opts.ttl {
        config.ttl = Duration::from_secs(ttl);
    }
    config.validate()?;
    Ok(config)
}

async fn announce_dynamic(
    log: &slog::Logger,
    daemon: &Arc<Daemon<SystemLinks>>,
) -> DiscoveryResult<()> {
    let sigs = signals()?;
    let sig_handle = sigs.handle();
    let watcher = InterfaceWatcher::new(log)?;
    let (event_tx, event_rx) = mpsc::channel(16);
    let (stop_tx, stop_rx) = mpsc::channel(1);

    let result = daemon
        .run_watched(
            event_rx,
            watcher.run(event_tx, stop_rx),
            stop_tx,
            signal_handler(log, sigs),
        )
        .await;
    // Release the blocked signal thread if the watcher went first.
    sig_handle.close();
    result
}

async fn run_announce(opts: AnnounceOpt) -> DiscoveryResult<()> {
    let log = log_init(&opts.log)?;
    let config = announce_config(&opts)?;
    info!(log, "starting announcements"; "config" => ?config);
    let daemon = Arc::new(Daemon::new(&log, config));

    let result = if opts.iface.is_empty() {
        announce_dynamic(&log, &daemon).await
    } else {
        if daemon.run_static(&opts.iface) == 0 {
            warn!(log, "no usable interfaces");
        }
        match signals() {
            Ok(sigs) => signal_handler(&log, sigs).await,
            Err(e) => Err(e),
        }
    };
    daemon.shutdown_all().await;

    info!(log, "exiting");
    result
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> DiscoveryResult<()> {
    let args = Args::from_args();

    match args {
        Args::Discover(opt) => run_discover(opt).await,
        Args::Announce(opt) => run_announce(opt).await,
    }
}
