// PEBL monitor: status coordinator and dashboard for the USB-to-cloud backup appliance

mod coordinator;
mod dashboard;
mod decision;
mod device;
mod display_power;
mod notifications;
mod os_ops;
mod quota_refresh;
mod scheduler;
mod status_channel;
mod sync_control;
mod transfer;

use anyhow::{Context, Result};
use chrono::Local;
use coordinator::{Coordinator, OperatorCommand};
use dashboard::DashboardState;
use display_power::SysfsBacklight;
use os_ops::SystemOps;
use pebl_common::PeblConfig;
use quota_refresh::QuotaRefresher;
use scheduler::{Tick, TickSchedule};
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, watch};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("Starting PEBL monitor v{}", env!("CARGO_PKG_VERSION"));

    if !nix::unistd::geteuid().is_root() {
        log::warn!("Not running as root; mount and backlight operations will likely fail");
    }

    let config = PeblConfig::new();

    let backlight = SysfsBacklight::detect(&config.backlight_root);
    let ops = SystemOps::new(config.timing.command_timeout());
    let mut coordinator = Coordinator::new(&config, ops, Box::new(backlight), Instant::now());
    coordinator.startup();

    let (view_tx, view_rx) = watch::channel(coordinator.view(Instant::now(), Local::now()));
    let (command_tx, mut command_rx) = mpsc::channel(16);

    let listener = TcpListener::bind(&config.dashboard_addr)
        .await
        .with_context(|| format!("Failed to bind dashboard to {}", config.dashboard_addr))?;
    let state = DashboardState::new(view_rx, command_tx, config.notifications_file.clone());
    tokio::spawn(async move {
        if let Err(e) = dashboard::serve(listener, state).await {
            log::error!("Dashboard server stopped: {:#}", e);
        }
    });

    let refresher = QuotaRefresher::new(&config);
    let mut ticks = TickSchedule::new(&config.timing);

    // Wait for termination signal
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    log::info!("PEBL monitor is ready");

    loop {
        tokio::select! {
            tick = ticks.next() => match tick {
                Tick::Status => coordinator.on_status_tick(),
                Tick::DeviceRemoval => coordinator.on_removal_tick(),
                Tick::IdleCheck => coordinator.on_idle_tick(Instant::now()),
                Tick::QuotaRefresh => {
                    refresher.trigger();
                }
            },
            Some(envelope) = command_rx.recv() => {
                let remount = envelope.command == OperatorCommand::Remount;
                let result = coordinator.handle(
                    envelope.command,
                    Instant::now(),
                    Local::now().naive_local(),
                );
                if remount {
                    refresher.trigger();
                }
                // the requester may have gone away
                let _ = envelope.reply.send(result);
            }
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM, shutting down...");
                break;
            }
            _ = sigint.recv() => {
                log::info!("Received SIGINT, shutting down...");
                break;
            }
        }

        view_tx.send_replace(coordinator.view(Instant::now(), Local::now()));
    }

    Ok(())
}
