//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p plaza_server -- [--config plaza.json] [--addr 127.0.0.1:2567] [--tick-hz 20]
//!
//! Console commands:
//!   status  - List live sessions
//!   quit    - Shutdown server

use std::env;
use std::io::{BufRead, Write};
use std::path::Path;

use anyhow::Context;
use plaza_server::{server::ServerControl, GameServer};
use plaza_shared::config::PlazaConfig;
use tokio::sync::mpsc;
use tracing::{info, warn};

fn parse_args() -> anyhow::Result<PlazaConfig> {
    let args: Vec<String> = env::args().collect();

    // `--config` first so explicit flags override the file.
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => PlazaConfig::load(Path::new(&args[i + 1]))?,
        _ => PlazaConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(cfg.tick_hz);
                i += 2;
            }
            "--max-participants" if i + 1 < args.len() => {
                cfg.max_participants = args[i + 1].parse().unwrap_or(cfg.max_participants);
                i += 2;
            }
            "--config" => i += 2,
            _ => i += 1,
        }
    }
    Ok(cfg)
}

async fn exec_console(control: &ServerControl, line: &str) -> bool {
    match line.split_whitespace().next() {
        Some("status") => {
            let sessions = control.status().await;
            println!("Sessions: {}", sessions.len());
            for s in sessions {
                println!("  {}: participants={} tick={}", s.key, s.participants, s.tick);
            }
            true
        }
        Some("quit") | Some("exit") => false,
        Some(other) => {
            println!("Unknown command '{other}'");
            true
        }
        None => true,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(
        addr = %cfg.server_addr,
        tick_hz = cfg.tick_hz,
        max_participants = cfg.max_participants,
        "Starting server"
    );

    let server = GameServer::bind(cfg).await.context("create server")?;
    let local = server.local_addr()?;
    info!(%local, "Server listening");
    let control = server.control();

    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Server ready. Type 'status' for info, 'quit' to exit.");
    println!();

    let mut accept = tokio::spawn(server.run());
    loop {
        tokio::select! {
            result = &mut accept => {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "Server stopped"),
                    Err(e) => warn!(error = %e, "Server task failed"),
                }
                break;
            }
            line = console_rx.recv() => {
                // Stdin closed: keep serving.
                let Some(line) = line else {
                    let _ = (&mut accept).await;
                    break;
                };
                if !exec_console(&control, &line).await {
                    info!("Server shutting down");
                    accept.abort();
                    break;
                }
            }
        }
    }
    Ok(())
}
