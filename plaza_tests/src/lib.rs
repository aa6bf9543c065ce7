//! Helpers shared by the socket-level tests.

use std::time::Duration;

use plaza_client::{input::InputState, GameClient};
use plaza_server::server::{bind_ephemeral_with, ServerControl};
use plaza_shared::config::PlazaConfig;
use tokio::task::JoinHandle;

/// Frame length used by test clients.
pub const FRAME_DT: f32 = 1.0 / 60.0;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// A server running in the background on an ephemeral port.
pub struct TestServer {
    pub cfg: PlazaConfig,
    pub control: ServerControl,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    pub async fn start(cfg: PlazaConfig) -> anyhow::Result<Self> {
        let (server, cfg) = bind_ephemeral_with(cfg).await?;
        let control = server.control();
        let task = tokio::spawn(server.run());
        Ok(Self { cfg, control, task })
    }

    /// Client config pointing at this server.
    pub fn client_cfg(&self, name: &str, color: &str) -> PlazaConfig {
        PlazaConfig {
            display_name: name.to_string(),
            color: color.to_string(),
            ..self.cfg.clone()
        }
    }

    pub async fn connect(&self, name: &str, color: &str) -> anyhow::Result<GameClient> {
        GameClient::connect(&self.client_cfg(name, color)).await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Runs client frames with `input` until `done` holds or `timeout` passes.
pub async fn frames_until<F>(
    client: &mut GameClient,
    input: InputState,
    timeout: Duration,
    mut done: F,
) -> anyhow::Result<()>
where
    F: FnMut(&GameClient) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        client.frame(&input, FRAME_DT).await?;
        if done(client) {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("condition not reached within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Runs exactly `n` frames with `input`.
pub async fn run_frames(client: &mut GameClient, input: InputState, n: usize) -> anyhow::Result<()> {
    for _ in 0..n {
        client.frame(&input, FRAME_DT).await?;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    Ok(())
}
