//! Runtime assembly: turns a loaded [`Config`] into a running [`Engine`],
//! the single place dependency wiring happens so nothing in `engine`/`risk`/
//! `execution` reaches for a global singleton (Design Notes' "no global
//! singletons" redesign flag).

use crate::config::{self, Config};
use crate::core::event::EventEmitter;
use crate::core::event_loop::EventLoop;
use crate::engine::{Engine, EngineState, MarkBook};
use crate::execution::simulated::{FillSimulator, SimulationParams};
use crate::execution::Executor;
use crate::risk::CircuitBreakerConfig;
use crate::wal::replication::{ChannelReceiver, ReplicationMode as WalReplicationMode, ReplicationSender};
use crate::wal::{FsyncMode as WalFsyncMode, Wal};
use anyhow::{Context, Result};
use crossbeam::channel;
use std::io::Stdout;
use std::sync::Arc;
use std::time::Duration;

fn to_wal_fsync_mode(mode: config::FsyncMode) -> WalFsyncMode {
    match mode {
        config::FsyncMode::Every => WalFsyncMode::Every,
        config::FsyncMode::Interval => WalFsyncMode::Interval,
        config::FsyncMode::Off => WalFsyncMode::Off,
    }
}

fn to_wal_replication_mode(mode: config::ReplicationMode) -> WalReplicationMode {
    match mode {
        config::ReplicationMode::Sync => WalReplicationMode::Sync,
        config::ReplicationMode::Async => WalReplicationMode::Async,
        config::ReplicationMode::Disabled => WalReplicationMode::Disabled,
    }
}

fn breaker_config(cfg: &config::BreakerConfig) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: cfg.failure_threshold,
        success_threshold: cfg.success_threshold,
        timeout: Duration::from_millis(cfg.cooldown_ms),
    }
}

/// Everything `main` needs to pump commands and market data through the
/// engine and eventually shut it down cleanly.
pub struct Runtime {
    pub engine: Arc<Engine<Stdout>>,
    pub event_loop: Arc<EventLoop>,
}

impl Runtime {
    /// Assemble a `Runtime` from a loaded config. Opens the WAL file at
    /// `config.wal.path`, replaying any existing log into a fresh
    /// `EngineState` before returning — callers that need the prior-crash
    /// recovery path get it for free here rather than as a separate step.
    pub fn build(account: impl Into<String>, cfg: &Config) -> Result<Self> {
        let marks = Arc::new(MarkBook::new());

        let wal = Wal::open(
            &cfg.wal.path,
            to_wal_fsync_mode(cfg.wal.fsync_mode),
            cfg.wal.segment_bytes,
        )
        .with_context(|| format!("opening WAL at {}", cfg.wal.path))?;

        let replication = match to_wal_replication_mode(cfg.replication.mode) {
            WalReplicationMode::Disabled => ReplicationSender::disabled(),
            mode => {
                // No network transport is wired up yet; replicated frames
                // are drained into a channel receiver that discards them,
                // giving the ack/back-pressure contract a real peer without
                // a live standby process.
                let (tx, _rx) = channel::unbounded();
                ReplicationSender::spawn(
                    mode,
                    cfg.replication.max_pending,
                    Duration::from_millis(cfg.replication.ack_timeout_ms),
                    ChannelReceiver::new(tx),
                )
            }
        };

        let emitter = EventEmitter::new(std::io::stdout(), 0);

        let mut state = EngineState::new(
            account,
            cfg.risk.clone(),
            breaker_config(&cfg.breaker),
            Arc::clone(&marks),
            wal,
            replication,
            emitter,
        );

        let wal_path = cfg.wal.path.clone();
        if std::path::Path::new(&wal_path).exists() {
            state.restore_from_wal(&wal_path).context("replaying WAL on startup")?;
        }

        let event_loop = Arc::new(EventLoop::new());

        let executor: Arc<dyn Executor> = Arc::new(FillSimulator::new(
            Arc::clone(&event_loop),
            marks as Arc<dyn crate::execution::MarkPriceSource>,
            SimulationParams {
                latency_ms: cfg.simulation.latency_ms,
                slippage_bps: cfg.simulation.slippage_bps,
                partial_fill_count: 1,
            },
        ));

        let engine = Engine::new(state, Arc::clone(&event_loop), executor);

        Ok(Self { engine, event_loop })
    }
}

/// Initializes the global tracing subscriber from config, the one place
/// allowed to touch process-wide logging state.
pub fn init_logging(cfg: &config::EngineConfig) {
    crate::utils::init_logger(&cfg.log_level, cfg.json_logs);
}
