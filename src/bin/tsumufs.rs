//! `tsumufs mount <source> <mountpoint>` — bring up the caching core.
//!
//! The kernel bridge is a separate concern; this binary wires the core
//! together, supervises the replay worker and the journal checkpointer,
//! and tears everything down cleanly on SIGINT/SIGTERM.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tsumufs::config::{Cli, Command, FileConfig, MountArgs, Settings};
use tsumufs::context::CoreContext;
use tsumufs::fs::TsumuFs;
use tsumufs::sync::SyncWorker;
use tsumufs::upstream::{LoopbackMountHelper, MountHelper, ShellMountHelper};

const EXIT_BAD_ARGS: u8 = 1;
const EXIT_SETUP_FAILED: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(EXIT_BAD_ARGS);
        }
    };

    match cli.command {
        Command::Mount(args) => mount(args).await,
    }
}

fn init_logging(debug: bool) {
    let default = if debug { "tsumufs=debug" } else { "tsumufs=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn mount(args: MountArgs) -> ExitCode {
    init_logging(args.debug);

    let file_config = match &args.config {
        Some(path) => match FileConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("tsumufs: {err}");
                return ExitCode::from(EXIT_BAD_ARGS);
            }
        },
        None => FileConfig::default(),
    };

    let settings = match Settings::resolve(&args, &file_config) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("tsumufs: {err}");
            return ExitCode::from(EXIT_BAD_ARGS);
        }
    };

    if !settings.foreground {
        // Daemonization is left to the service manager; note it and stay.
        info!("running in the foreground; use a service manager to background");
    }

    let helper: Box<dyn MountHelper> = if settings.source_is_remote() {
        Box::new(ShellMountHelper::new(
            settings.source.clone(),
            settings.upstream_mount_point.clone(),
            settings.mount_options.clone(),
        ))
    } else {
        Box::new(LoopbackMountHelper::new())
    };

    let ctx = match CoreContext::new(settings.layout(), helper, CoreContext::no_groups()).await {
        Ok(ctx) => ctx,
        Err(err) => {
            error!("setup failed: {err:?}");
            return ExitCode::from(EXIT_SETUP_FAILED);
        }
    };

    info!(
        source = %settings.source,
        mountpoint = %settings.mount_point.display(),
        cache = %settings.cache_point.display(),
        "tsumufs core ready"
    );

    // The front-end is the host bridge's integration point; it stays
    // alive for the life of the process.
    let frontend = TsumuFs::new(ctx.clone());

    let checkpointer = ctx.sync_log.spawn_checkpointer(ctx.signals.clone());
    let worker = SyncWorker::new(ctx.clone()).spawn();

    wait_for_shutdown().await;
    info!("shutdown requested");
    ctx.signals.request_shutdown();

    if worker.await.is_err() {
        error!("sync worker ended abnormally");
    }
    let _ = checkpointer.await;
    drop(frontend);

    ExitCode::SUCCESS
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
