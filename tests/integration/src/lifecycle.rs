//! Node lifecycle requests against real child processes.

use keel_net::{ConnectionError, ListControl, StartOutcome};
use keel_protocol::NodeKey;

use crate::helpers::{ServerOptions, TestServer};

fn sleepers() -> ServerOptions {
    ServerOptions {
        sleeper_nodes: true,
        ..Default::default()
    }
}

#[cfg(unix)]
#[tokio::test]
async fn start_then_unknown_directive_closes() {
    let server = TestServer::start_with(sleepers()).await;
    let mut raw = server.raw().await;

    raw.send("start node gridA clusterB node3").await;
    let reply = raw.recv().await.unwrap();
    let pid: u32 = reply
        .strip_prefix("ok ")
        .and_then(|rest| rest.parse().ok())
        .unwrap_or_else(|| panic!("unexpected reply {reply:?}"));
    assert!(pid > 0);

    raw.send("start node gridA clusterB node3").await;
    raw.expect(&format!("ok {pid} started")).await;

    raw.send("reboot node gridA clusterB node3").await;
    assert_eq!(raw.recv().await, None);

    let mut client = server.client().await;
    client.kill(NodeKey::new("gridA", "clusterB", "node3")).await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn list_pages_through_nodes() {
    let server = TestServer::start_with(sleepers()).await;
    let mut client = server.client().await;

    for node in ["n1", "n2", "n3"] {
        let outcome = client.start(NodeKey::new("g", "c", node)).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Launched(_)));
    }

    let all = client.list(true).await.unwrap();
    let names: Vec<&str> = all.iter().map(|r| r.key.node.as_str()).collect();
    assert_eq!(names, vec!["n1", "n2", "n3"]);
    assert!(all.iter().all(|r| r.details.as_ref().is_some_and(|d| d.pid > 0)));

    let brief = client.list(false).await.unwrap();
    assert!(brief.iter().all(|r| r.details.is_none()));

    // stopping after the first record leaves the session usable
    let mut seen = 0;
    client
        .list_with(false, |_| {
            seen += 1;
            ListControl::Stop
        })
        .await
        .unwrap();
    assert_eq!(seen, 1);

    client.stop(NodeKey::new("g", "c", "n2")).await.unwrap();
    let left: Vec<String> = client
        .list(false)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.key.node)
        .collect();
    assert_eq!(left, vec!["n1".to_string(), "n3".to_string()]);

    for node in ["n1", "n3"] {
        client.kill(NodeKey::new("g", "c", node)).await.unwrap();
    }
    assert!(client.list(false).await.unwrap().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn stopping_an_unknown_node_is_an_error_reply() {
    let server = TestServer::start_with(sleepers()).await;
    let mut client = server.client().await;

    let err = client
        .stop(NodeKey::new("g", "c", "ghost"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectionError::Remote(ref msg) if msg.contains("not running")));
    assert!(client.list(false).await.unwrap().is_empty());
}

#[tokio::test]
async fn lifecycle_is_refused_without_a_program() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    let err = client
        .start(NodeKey::new("g", "c", "n"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectionError::Remote(ref msg) if msg.contains("no node program")));
    assert!(client.list(true).await.unwrap().is_empty());
}
