//! Session behaviour over real sockets.

use keel_net::ConnectionError;
use keel_protocol::{NodeRole, SessionState};

use crate::helpers::{ServerOptions, TestServer};

#[tokio::test]
async fn empty_list_sends_one_stop() {
    let server = TestServer::start().await;

    let mut raw = server.raw().await;
    raw.send("list").await;
    raw.expect("list stop").await;
    // nothing else follows: the next reply belongs to the next request
    raw.send("cpu info request").await;
    let reply = raw.recv().await.unwrap();
    assert!(reply.starts_with("cpu info "), "{reply}");

    let mut client = server.client().await;
    assert!(client.list(false).await.unwrap().is_empty());
    assert!(client.history().ends_with(&[
        SessionState::AwaitCommand,
        SessionState::Dispatching,
        SessionState::RespondingStream,
        SessionState::AwaitCommand,
    ]));
}

#[tokio::test]
async fn client_walks_single_reply_states() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    client.identify(NodeRole::Client).await.unwrap();
    let cpus = client.cpu_info().await.unwrap();
    assert!(cpus.cpu_count >= 1);

    assert_eq!(
        client.history(),
        &[
            SessionState::Connecting,
            SessionState::Established,
            SessionState::AwaitCommand,
            SessionState::Dispatching,
            SessionState::RespondingSingle,
            SessionState::AwaitCommand,
            SessionState::Dispatching,
            SessionState::RespondingSingle,
            SessionState::AwaitCommand,
        ]
    );
}

#[tokio::test]
async fn unknown_directive_closes_without_reply() {
    let server = TestServer::start().await;
    let mut raw = server.raw().await;

    raw.send("bogus request").await;
    assert_eq!(raw.recv().await, None);
}

#[tokio::test]
async fn malformed_argument_closes_without_reply() {
    let server = TestServer::start().await;
    let mut raw = server.raw().await;

    raw.send("get config seven").await;
    assert_eq!(raw.recv().await, None);
}

#[tokio::test]
async fn crlf_requests_are_accepted() {
    let server = TestServer::start().await;
    let mut raw = server.raw().await;

    raw.send("cpu info request\r").await;
    let reply = raw.recv().await.unwrap();
    assert!(reply.starts_with("cpu info "), "{reply}");
}

#[tokio::test]
async fn remote_errors_keep_the_session() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    let err = client.get_config(42).await.unwrap_err();
    assert!(matches!(err, ConnectionError::Remote(_)), "{err}");
    assert_eq!(client.state(), SessionState::AwaitCommand);

    let err = client
        .disk_info("/definitely/not/a/dir")
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectionError::Remote(_)), "{err}");

    assert!(client.clusters().await.unwrap().is_empty());
}

#[tokio::test]
async fn connection_limit_drops_extra_clients() {
    let server = TestServer::start_with(ServerOptions {
        max_connections: Some(1),
        ..Default::default()
    })
    .await;

    let mut first = server.raw().await;
    first.send("cpu info request").await;
    assert!(first.recv().await.is_some());

    let mut second = server.raw().await;
    second.send("cpu info request").await;
    assert_eq!(second.recv().await, None);

    drop(first);
    server.stop().await;
}

#[tokio::test]
async fn shutdown_drains_open_sessions() {
    let server = TestServer::start().await;
    let mut raw = server.raw().await;
    raw.send("cpu info request").await;
    assert!(raw.recv().await.is_some());

    // the idle session ends on shutdown instead of holding the drain
    server.stop().await;
    assert_eq!(raw.recv().await, None);
}
