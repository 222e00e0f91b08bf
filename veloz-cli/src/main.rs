//! `veloz` — the stdio host for `engine.mode = stdio`: reads command lines
//! from stdin, posts each onto the engine's dispatcher thread at `High`
//! priority (per the Command Bus contract), and writes the JSON response to
//! stdout. `engine.mode = service` loads and validates config the same way
//! but binds no listener — the REST/SSE gateway is out of scope here.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use veloz_core::config::{Config, EngineMode};
use veloz_core::core::event_loop::Priority;
use veloz_core::runtime::{self, Runtime};

#[derive(Parser, Debug)]
#[command(name = "veloz", about = "VeloZ trading engine core host")]
struct Args {
    /// Path to the engine's TOML config file.
    #[arg(long, default_value = "veloz.toml")]
    config: String,

    /// Account identifier this process serves.
    #[arg(long, default_value = "default")]
    account: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = Config::load(&args.config).with_context(|| format!("loading config from {}", args.config))?;
    runtime::init_logging(&cfg.engine);

    match cfg.engine.mode {
        EngineMode::Stdio => run_stdio(&args.account, &cfg),
        EngineMode::Service => {
            tracing::warn!("engine.mode = service accepted but not implemented: no listener bound");
            Ok(())
        }
    }
}

fn run_stdio(account: &str, cfg: &Config) -> Result<()> {
    let rt = Runtime::build(account.to_string(), cfg).context("assembling runtime")?;

    let event_loop_handle = {
        let event_loop = Arc::clone(&rt.event_loop);
        std::thread::Builder::new()
            .name("veloz-dispatcher".into())
            .spawn(move || event_loop.run())
            .context("spawning dispatcher thread")?
    };

    {
        let event_loop = Arc::clone(&rt.event_loop);
        let engine = Arc::clone(&rt.engine);
        ctrlc::set_handler(move || {
            tracing::info!("shutdown signal received, checkpointing and stopping");
            if let Err(e) = engine.checkpoint(now_ns()) {
                tracing::error!(error = %e, "checkpoint on shutdown failed");
            }
            event_loop.stop();
        })
        .context("installing signal handler")?;
    }

    let stdin = io::stdin();
    let stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = line.context("reading stdin")?;
        if line.trim().is_empty() {
            continue;
        }

        let (tx, rx) = std::sync::mpsc::channel();
        let engine = Arc::clone(&rt.engine);
        let line_owned = line;
        rt.event_loop.post(
            Box::new(move || {
                let response = engine.dispatch_command(&line_owned, now_ns());
                let _ = tx.send(response);
            }),
            Priority::High,
            vec!["command".to_string()],
        );

        match rx.recv() {
            Ok(response) => {
                let mut out = stdout.lock();
                writeln!(out, "{}", response)?;
                out.flush()?;
            }
            Err(_) => break, // dispatcher stopped before processing this command
        }
    }

    rt.event_loop.stop();
    let _ = event_loop_handle.join();
    Ok(())
}

fn now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
