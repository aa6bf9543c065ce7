//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p plaza_client -- [--config plaza.json] [--addr 127.0.0.1:2567]
//!       [--session my_room] [--name Ann] [--color '#ff0000'] [--appearance female]
//!
//! Headless: stdin lines drive a scripted walk instead of a window.
//!
//! Console commands:
//!   w|a|s|d [secs] - Walk in that direction
//!   jump | dance | wave
//!   turn <pixels>  - Pointer movement (yaw)
//!   say <message>  - Send chat message
//!   status         - Show client status
//!   quit           - Leave and exit

use std::env;
use std::io::{BufRead, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use plaza_client::client::{ClientState, GameClient};
use plaza_client::input::{InputState, Keys};
use plaza_shared::config::PlazaConfig;
use tokio::sync::mpsc;
use tracing::info;

const FRAME: Duration = Duration::from_millis(16);

fn parse_args() -> anyhow::Result<PlazaConfig> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => PlazaConfig::load(Path::new(&args[i + 1]))?,
        _ => PlazaConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1).cloned();
        match (args[i].as_str(), value) {
            ("--addr", Some(v)) => cfg.server_addr = v,
            ("--session", Some(v)) => cfg.session_key = v,
            ("--name", Some(v)) => cfg.display_name = v,
            ("--color", Some(v)) => cfg.color = v,
            ("--appearance", Some(v)) => cfg.appearance = v,
            ("--config", Some(_)) => {}
            _ => {
                i += 1;
                continue;
            }
        }
        i += 2;
    }
    Ok(cfg)
}

/// Scripted input queued from the console.
#[derive(Default)]
struct Script {
    keys: Keys,
    frames_left: u32,
    pointer_dx: f32,
}

impl Script {
    fn next(&mut self) -> InputState {
        let keys = if self.frames_left > 0 {
            self.frames_left -= 1;
            self.keys
        } else {
            Keys::empty()
        };
        InputState {
            keys,
            pointer_dx: std::mem::take(&mut self.pointer_dx),
            pointer_captured: true,
        }
    }

    fn hold(&mut self, keys: Keys, secs: f32) {
        self.keys = keys;
        self.frames_left = (secs / FRAME.as_secs_f32()).ceil().max(1.0) as u32;
    }
}

fn print_status(client: &GameClient) {
    println!("State: {:?}", client.state);
    println!("Id: {}", client.id);
    let p = client.pipeline.position();
    println!(
        "Position: ({:.2}, {:.2}, {:.2}) facing {:.2} activity {}",
        p.x,
        p.y,
        p.z,
        client.pipeline.facing(),
        client.pipeline.activity()
    );
    println!("Participants: {}", client.store.len());
    for (id, s) in client.reconciler.iter() {
        let activity = client
            .store
            .effective_activity(id)
            .map(|a| a.as_str())
            .unwrap_or("?");
        println!(
            "  {}: ({:.2}, {:.2}) {}",
            id, s.position.x, s.position.z, activity
        );
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
    info!(server = %cfg.server_addr, session = %cfg.session_key, name = %cfg.display_name, "Starting client");

    let mut client = GameClient::connect(&cfg).await.context("connect")?;
    info!(player = %client.id, "Connected to server");

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

    println!("Client connected. Type 'status' for info, 'quit' to exit.");
    println!();

    let mut script = Script::default();
    let mut ticker = tokio::time::interval(FRAME);

    loop {
        while let Ok(line) = console_rx.try_recv() {
            let mut tokens = line.split_whitespace();
            let cmd = tokens.next().unwrap_or_default();
            let arg = tokens.next();
            let secs = arg.and_then(|s| s.parse().ok()).unwrap_or(1.0);
            match cmd {
                "w" => script.hold(Keys::W, secs),
                "a" => script.hold(Keys::A, secs),
                "s" => script.hold(Keys::S, secs),
                "d" => script.hold(Keys::D, secs),
                "jump" => script.hold(Keys::JUMP, 0.0),
                "dance" => script.hold(Keys::DANCE, 0.0),
                "wave" => script.hold(Keys::WAVE, 0.0),
                "turn" => script.pointer_dx += arg.and_then(|s| s.parse().ok()).unwrap_or(100.0),
                "say" => {
                    let text = line.trim_start_matches("say").trim();
                    client.say(text).await?;
                }
                "status" => print_status(&client),
                "quit" | "exit" => {
                    client.leave().await?;
                    return Ok(());
                }
                other => println!("Unknown command '{other}'"),
            }
        }

        ticker.tick().await;
        client.frame(&script.next(), FRAME.as_secs_f32()).await?;

        for line in client.take_unread_chat() {
            println!(
                "[{}] {}: {}",
                line.received_at.format("%H:%M:%S"),
                line.sender_name,
                line.text
            );
        }

        if client.state == ClientState::Disconnected {
            println!("Disconnected from server.");
            break;
        }
    }

    Ok(())
}
