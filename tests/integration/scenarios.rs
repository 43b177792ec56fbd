//! The end-to-end chat walkthrough: join, announce, relay, exit, plus the
//! startup and connect failures.

use crate::*;

use parley_client::ConnectError;
use parley_server::DispatcherSettings;

#[tokio::test]
async fn walkthrough_join_announce_relay_exit() -> Result<()> {
    // Server up, one client in.
    let server = TestServer::start().await?;
    let mut alice = TestClient::join(&server, "Alice").await?;
    assert!(alice.client.welcome().contains("Alice"));
    wait_for_count(&server.registry, 1).await?;

    // A second client is announced to the first, not to itself.
    let mut bob = TestClient::join(&server, "Bob").await?;
    let notice = alice.line_containing(&["Bob", "joined"]).await?;
    assert!(notice.contains("SERVER"));
    wait_for_count(&server.registry, 2).await?;

    // A chat line reaches everyone, sender included.
    alice.say("Hi").await?;
    let seen_by_bob = bob.next_line().await?;
    assert!(
        seen_by_bob.contains("Alice: Hi"),
        "Bob's first line should be the message, got {seen_by_bob:?}"
    );
    let echo = alice.next_line().await?;
    assert!(echo.contains("Alice: Hi"));

    // Exit leaves exactly one notice behind and closes Bob's side.
    bob.say("exit").await?;
    let leave = alice.line_containing(&["Bob", "left"]).await?;
    assert!(leave.contains("SERVER"));
    assert_eq!(bob.disconnected().await?, DisconnectReason::ServerClosed);
    wait_for_count(&server.registry, 1).await?;
    alice.assert_quiet().await;

    alice.client.disconnect().await;
    wait_for_count(&server.registry, 0).await?;
    server.stop().await
}

#[tokio::test]
async fn round_trip_reaches_every_other_client_once() -> Result<()> {
    let server = TestServer::start().await?;
    let mut a = TestClient::join(&server, "A").await?;
    let mut b = TestClient::join(&server, "B").await?;
    let mut c = TestClient::join(&server, "C").await?;
    wait_for_count(&server.registry, 3).await?;

    // Drain the join notices before the message under test.
    a.line_containing(&["C", "joined"]).await?;
    b.line_containing(&["C", "joined"]).await?;

    a.say("hello").await?;
    for peer in [&mut b, &mut c] {
        let line = peer.line_containing(&["A: hello"]).await?;
        assert!(line.starts_with('['), "timestamp prefix missing: {line:?}");
        peer.assert_quiet().await;
    }
    a.line_containing(&["A: hello"]).await?;

    server.stop().await
}

#[tokio::test]
async fn second_bind_on_same_port_fails() -> Result<()> {
    let server = TestServer::start().await?;

    let err = Dispatcher::bind(server.addr, Registry::shared(), DispatcherSettings::default())
        .await
        .err()
        .context("second bind should fail")?;
    assert!(err.is_addr_in_use(), "unexpected error: {err}");
    assert!(err.to_string().contains(&server.port().to_string()));

    // The running server is unaffected.
    let _alice = TestClient::join(&server, "Alice").await?;
    wait_for_count(&server.registry, 1).await?;
    server.stop().await
}

#[tokio::test]
async fn connect_with_no_server_is_refused() -> Result<()> {
    let server = TestServer::start().await?;
    let port = server.port();
    server.stop().await?;

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel::<ClientEvent>();
    let err = ChatClient::connect("127.0.0.1", port, "Alice", ConnectOptions::default(), tx)
        .await
        .err()
        .context("connect should fail")?;
    assert!(
        matches!(err, ConnectError::ConnectionRefused { .. }),
        "unexpected error: {err}"
    );
    Ok(())
}
