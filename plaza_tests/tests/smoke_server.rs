use std::time::Duration;

use plaza_server::server::bind_ephemeral;
use plaza_shared::codec::{decode_server, encode_client, ClientMsg, ServerMsg};
use plaza_shared::entity::JoinOptions;
use plaza_shared::net::ReliableConn;

/// Smoke test: a session appears on first join and goes away on last leave.
#[tokio::test]
async fn session_lifecycle_follows_participants() -> anyhow::Result<()> {
    let (server, cfg) = bind_ephemeral(20).await?;
    let control = server.control();
    assert_eq!(control.session_count(), 0);
    let task = tokio::spawn(server.run());

    let mut conn = ReliableConn::connect(cfg.server_addr.parse()?).await?;
    conn.send(&encode_client(&ClientMsg::Join {
        session: "smoke".to_string(),
        options: JoinOptions::new("Smoke", "#abcdef", "female"),
    }))
    .await?;

    let welcome = decode_server(&conn.recv().await?.expect("welcome"))?;
    let ServerMsg::Welcome { id } = welcome else {
        anyhow::bail!("expected welcome, got {}", welcome.kind());
    };
    let snapshot = decode_server(&conn.recv().await?.expect("snapshot"))?;
    assert!(matches!(&snapshot, ServerMsg::Snapshot(es) if es.len() == 1 && es[0].id == id));

    let status = control.status().await;
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].key, "smoke");
    assert_eq!(status[0].participants, 1);

    conn.send(&encode_client(&ClientMsg::Leave)).await?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while control.session_count() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "session never disposed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    task.abort();
    Ok(())
}
