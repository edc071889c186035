//! Configuration serving, commits and restart recovery end to end.

use bytes::Bytes;
use keel_net::ConnectionError;
use keel_persistence::{bootstrap, ConfigStore, FileConfigStore, RecoveryPolicy};

use crate::helpers::{ServerOptions, TestServer};

const PAYLOAD: &[u8] = b"# alpha\nnodes=4\n\nreplicas=2\n";

fn bootstrapped_dir() -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("alpha.conf");
    std::fs::write(&file, PAYLOAD).unwrap();
    let store = dir.path().join("store");
    bootstrap(&file, &store, 7, "alpha", false).unwrap();
    (dir, store)
}

#[tokio::test]
async fn serves_bootstrapped_configuration() {
    let (_dir, store) = bootstrapped_dir();
    let server = TestServer::start_with(ServerOptions {
        config_dir: Some(store),
        ..Default::default()
    })
    .await;

    let mut client = server.client().await;
    let clusters = client.clusters().await.unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].cluster_id, 7);
    assert_eq!(clusters[0].version, 1);
    assert_eq!(clusters[0].name, "alpha");

    let cfg = client.get_config(7).await.unwrap();
    assert_eq!(cfg.version, 1);
    assert_eq!(&cfg.payload[..], PAYLOAD);

    let mut raw = server.raw().await;
    raw.send("get config 7").await;
    raw.expect("config 7 1 4").await;
    raw.expect("# alpha").await;
    raw.expect("nodes=4").await;
    raw.expect("").await;
    raw.expect("replicas=2").await;
}

#[tokio::test]
async fn file_without_final_newline_is_served_as_stored() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("beta.conf");
    std::fs::write(&file, b"a=1\nb=2").unwrap();
    let store = dir.path().join("store");
    bootstrap(&file, &store, 8, "beta", false).unwrap();

    let stored = {
        let (store, _) = FileConfigStore::open(&store, RecoveryPolicy::Strict).unwrap();
        store.get_configuration(8).unwrap().payload.clone()
    };
    assert_eq!(&stored[..], b"a=1\nb=2\n");

    let server = TestServer::start_with(ServerOptions {
        config_dir: Some(store),
        ..Default::default()
    })
    .await;
    let mut client = server.client().await;
    let cfg = client.get_config(8).await.unwrap();
    assert_eq!(cfg.payload, stored);

    let mut raw = server.raw().await;
    raw.send("get config 8").await;
    raw.expect("config 8 1 2").await;
    raw.expect("a=1").await;
    raw.expect("b=2").await;
}

#[tokio::test]
async fn committed_update_survives_restart() {
    let (_dir, store) = bootstrapped_dir();

    let server = TestServer::start_with(ServerOptions {
        config_dir: Some(store.clone()),
        ..Default::default()
    })
    .await;
    let mut client = server.client().await;
    assert_eq!(client.update_config(7, b"nodes=5\n").await.unwrap(), 2);
    assert_eq!(client.update_config(7, b"nodes=6\n").await.unwrap(), 3);
    client.close().await;
    server.stop().await;

    let server = TestServer::start_with(ServerOptions {
        config_dir: Some(store.clone()),
        ..Default::default()
    })
    .await;
    let mut client = server.client().await;
    let cfg = client.get_config(7).await.unwrap();
    assert_eq!(cfg.version, 3);
    assert_eq!(&cfg.payload[..], b"nodes=6\n");
    client.close().await;
    server.stop().await;

    // older versions stay on disk untouched
    let (reopened, _) = FileConfigStore::open(&store, RecoveryPolicy::Strict).unwrap();
    let history = reopened.history(7).unwrap();
    let versions: Vec<u32> = history.iter().map(|v| v.version).collect();
    assert_eq!(versions, vec![1, 2, 3]);
    assert!(history.iter().all(|v| v.committed));
}

#[tokio::test]
async fn update_of_unknown_cluster_is_an_error_reply() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    let err = client.update_config(99, b"a=1\n").await.unwrap_err();
    assert!(matches!(err, ConnectionError::Remote(_)), "{err}");
    assert!(client.clusters().await.unwrap().is_empty());
}

#[tokio::test]
async fn store_directory_is_exclusive() {
    let (_dir, store) = bootstrapped_dir();
    let server = TestServer::start_with(ServerOptions {
        config_dir: Some(store.clone()),
        ..Default::default()
    })
    .await;

    assert!(FileConfigStore::open(&store, RecoveryPolicy::Strict).is_err());
    server.stop().await;

    let (reopened, _) = FileConfigStore::open(&store, RecoveryPolicy::Strict).unwrap();
    assert_eq!(reopened.get_configuration(7).unwrap().version, 1);
}

#[tokio::test]
async fn concurrent_sessions_commit_in_order() {
    let (_dir, store) = bootstrapped_dir();
    let server = TestServer::start_with(ServerOptions {
        config_dir: Some(store),
        ..Default::default()
    })
    .await;

    let mut tasks = Vec::new();
    for i in 0..4 {
        let mut client = server.client().await;
        tasks.push(tokio::spawn(async move {
            let payload = Bytes::from(format!("writer={i}\n"));
            client.update_config(7, &payload).await.unwrap()
        }));
    }
    let mut versions = Vec::new();
    for task in tasks {
        versions.push(task.await.unwrap());
    }
    versions.sort_unstable();
    assert_eq!(versions, vec![2, 3, 4, 5]);

    let mut client = server.client().await;
    assert_eq!(client.get_config(7).await.unwrap().version, 5);
}
