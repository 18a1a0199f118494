pub mod core;

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::config::{load_config, ConfigError};
use crate::core::room::DirectoryError;
use crate::core::server::{self, ServerError};
use crate::core::sync::{ListenerSession, SessionEvent, SimulatedEngine};
use crate::core::ServerCore;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to seed rooms: {0}")]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("failed to start runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

pub fn run() -> Result<(), StartupError> {
    init_logging();
    let loaded = load_config()?;
    if loaded.is_dev_override {
        log::info!("using dev config {}", loaded.path.display());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let core = Arc::new(ServerCore::new(loaded.config.server)?);
        let listener = server::bind(&core.config().bind_addr).await?;
        let shutdown = shutdown_on_ctrl_c();
        server::serve(listener, core, shutdown.cancelled_owned()).await?;
        log::info!("server stopped");
        Ok::<(), StartupError>(())
    })
}

pub fn run_listener() -> Result<(), StartupError> {
    init_logging();
    let loaded = load_config()?;
    let config = loaded.config.listener;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let shutdown = shutdown_on_ctrl_c();
        let mut session = ListenerSession::new();
        let mut events = session
            .connect(config, Box::new(SimulatedEngine::new()))
            .await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    log_session_event(&event);
                }
            }
        }

        session.disconnect().await;
        Ok::<(), StartupError>(())
    })
}

fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("info");
    let _ = env_logger::Builder::from_env(env).try_init();
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::warn!("failed to listen for ctrl-c: {err}");
            return;
        }
        log::info!("shutting down");
        trigger.cancel();
    });
    token
}

fn log_session_event(event: &SessionEvent) {
    match event {
        SessionEvent::Connection { state, reason } => match reason {
            Some(reason) => log::info!("connection {state:?}: {reason}"),
            None => log::info!("connection {state:?}"),
        },
        SessionEvent::RoomState(snapshot) => log::info!(
            "room {} is {} at {}ms",
            snapshot.room_id,
            snapshot.phase,
            snapshot.elapsed_ms
        ),
        SessionEvent::ClockEstimate(estimate) => log::info!(
            "clock offset {:.1}ms, latency {:.1}ms, jitter {:.1}ms",
            estimate.offset_ms,
            estimate.network_latency_ms,
            estimate.jitter_ms
        ),
        SessionEvent::Correction(report) => log::debug!("{report:?}"),
        SessionEvent::SyncFailed { message } | SessionEvent::ServerError { message } => {
            log::error!("{message}")
        }
        other => log::debug!("{other:?}"),
    }
}
