//! Faults on one connection must not disturb the others.

use std::time::Duration;

use crate::*;

use parley_client::SendError;
use parley_server::{LeaveReason, SessionSettings};

#[tokio::test]
async fn abrupt_disconnect_is_announced_once() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = TestClient::join(&server, "Alice").await?;

    let mut raw = RawPeer::connect(&server).await?;
    assert_eq!(raw.line().await?.as_deref(), Some("ENTER_USERNAME"));
    raw.say("Mallory").await?;
    let ack = raw.line().await?.context("expected an acknowledgement")?;
    assert!(ack.starts_with("SUCCESS:"), "got {ack:?}");
    alice.line_containing(&["Mallory", "joined"]).await?;
    wait_for_count(&server.registry, 2).await?;

    drop(raw);

    alice.line_containing(&["Mallory", "left"]).await?;
    wait_for_count(&server.registry, 1).await?;
    alice.assert_quiet().await;

    // The survivor still chats normally.
    alice.say("still here").await?;
    alice.line_containing(&["Alice: still here"]).await?;
    server.stop().await
}

#[tokio::test]
async fn empty_message_is_rejected_to_sender_only() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = TestClient::join(&server, "Alice").await?;
    let mut bob = TestClient::join(&server, "Bob").await?;
    alice.line_containing(&["Bob", "joined"]).await?;

    // The client library refuses locally.
    assert!(matches!(
        alice.client.send("   ").await,
        Err(SendError::EmptyMessage)
    ));

    // A raw peer gets the server-side rejection.
    let mut raw = RawPeer::connect(&server).await?;
    raw.line().await?;
    raw.say("Eve").await?;
    raw.line().await?;
    raw.say("").await?;
    let reply = raw.line().await?.context("expected an error line")?;
    assert!(reply.starts_with("ERROR:"), "got {reply:?}");

    // Eve is still connected; only her join reached the others.
    alice.line_containing(&["Eve", "joined"]).await?;
    bob.line_containing(&["Eve", "joined"]).await?;
    alice.assert_quiet().await;
    bob.assert_quiet().await;
    assert_eq!(server.registry.count(), 3);

    server.stop().await
}

#[tokio::test]
async fn silent_connection_times_out_during_handshake() -> Result<()> {
    let mut settings = DispatcherSettings::default();
    settings.session = SessionSettings {
        handshake_timeout: Some(Duration::from_millis(200)),
        ..SessionSettings::default()
    };
    let server = TestServer::start_with(settings).await?;

    let mut raw = RawPeer::connect(&server).await?;
    assert_eq!(raw.line().await?.as_deref(), Some("ENTER_USERNAME"));
    let reply = raw.line().await?.context("expected a timeout notice")?;
    assert!(reply.starts_with("ERROR:"), "got {reply:?}");
    assert_eq!(raw.line().await?, None);
    assert_eq!(server.registry.count(), 0);

    // A well-behaved client is unaffected.
    let _alice = TestClient::join(&server, "Alice").await?;
    wait_for_count(&server.registry, 1).await?;
    server.stop().await
}

#[tokio::test]
async fn shutdown_notifies_and_disconnects_clients() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = TestClient::join(&server, "Alice").await?;
    wait_for_count(&server.registry, 1).await?;

    // Stop runs concurrently so the client can observe the notice.
    let registry = server.registry.clone();
    let stopping = tokio::spawn(server.stop());

    alice.line_containing(&["SERVER", "shutting down"]).await?;
    assert_eq!(alice.disconnected().await?, DisconnectReason::ServerClosed);
    stopping.await??;

    assert_eq!(registry.count(), 0);
    assert!(!alice.client.is_connected());
    assert!(matches!(
        alice.client.send("anyone?").await,
        Err(SendError::NotConnected)
    ));
    Ok(())
}

#[tokio::test]
async fn client_disconnect_is_idempotent() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = TestClient::join(&server, "Alice").await?;
    let mut bob = TestClient::join(&server, "Bob").await?;
    alice.line_containing(&["Bob", "joined"]).await?;

    bob.client.disconnect().await;
    bob.client.disconnect().await;
    assert_eq!(bob.disconnected().await?, DisconnectReason::Local);
    bob.assert_quiet().await;

    alice.line_containing(&["Bob", "left"]).await?;
    alice.assert_quiet().await;
    wait_for_count(&server.registry, 1).await?;
    server.stop().await
}

#[tokio::test]
async fn membership_feed_tracks_joins_and_departures() -> Result<()> {
    let mut server = TestServer::start().await?;
    let alice = TestClient::join(&server, "Alice").await?;
    match server.next_membership().await? {
        MembershipEvent::Joined { name, .. } => assert_eq!(name, "Alice"),
        other => bail!("expected Alice to join, got {other:?}"),
    }

    // A rejected handshake never shows up in the feed.
    let mut raw = RawPeer::connect(&server).await?;
    raw.line().await?;
    raw.say("").await?;
    raw.line().await?;

    let bob = TestClient::join(&server, "Bob").await?;
    let bob_id = match server.next_membership().await? {
        MembershipEvent::Joined { id, name, .. } if name == "Bob" => id,
        other => bail!("expected Bob to join, got {other:?}"),
    };

    bob.say("exit").await?;
    assert_eq!(
        server.next_membership().await?,
        MembershipEvent::Left {
            id: bob_id,
            name: "Bob".into(),
            reason: LeaveReason::Exit,
        }
    );

    alice.client.disconnect().await;
    assert!(matches!(
        server.next_membership().await?,
        MembershipEvent::Left { ref name, reason: LeaveReason::Disconnected, .. } if name == "Alice"
    ));
    server.stop().await
}
