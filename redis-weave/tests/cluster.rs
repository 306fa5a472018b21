mod common;

use common::{cluster_slots, is_cluster_slots, MockServer};
use redis_weave::{calculate_slot, Client, ClientConfig, Command, Message, RedisError, TopologyMode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn key_for_slot(slot: u16) -> String {
    (0..)
        .map(|i| format!("key:{}", i))
        .find(|k| calculate_slot(k.as_bytes()) == slot)
        .unwrap()
}

fn key_in(range: std::ops::Range<u16>) -> String {
    (0..)
        .map(|i| format!("key:{}", i))
        .find(|k| range.contains(&calculate_slot(k.as_bytes())))
        .unwrap()
}

async fn connect(seed: &MockServer) -> Client {
    let config = ClientConfig::new([seed.addr()])
        .with_keep_alive_interval(None)
        .with_topology_mode(TopologyMode::Cluster);
    Client::connect(config).await.unwrap()
}

/// Two nodes; every slot starts on `first`
async fn two_nodes() -> (MockServer, MockServer, Arc<AtomicBool>) {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    let migrated = Arc::new(AtomicBool::new(false));
    for server in [&first, &second] {
        let (a, b, flag) = (first.port(), second.port(), migrated.clone());
        server.handle(move |args| {
            is_cluster_slots(args).then(|| {
                if flag.load(Ordering::SeqCst) {
                    cluster_slots(&[(0, 16383, &[b])])
                } else {
                    cluster_slots(&[(0, 16383, &[a])])
                }
            })
        });
    }
    (first, second, migrated)
}

#[tokio::test]
async fn test_moved_slot_is_retargeted() {
    common::init_tracing();
    let (first, second, migrated) = two_nodes().await;
    let key = key_for_slot(500);
    let moved_to = second.addr().to_string();
    let (a, b, flag) = (first.port(), second.port(), migrated.clone());
    first.handle(move |args| {
        if is_cluster_slots(args) {
            let owner = if flag.load(Ordering::SeqCst) { b } else { a };
            return Some(cluster_slots(&[(0, 16383, &[owner])]));
        }
        (args[0] == "GET").then(|| {
            flag.store(true, Ordering::SeqCst);
            vec![Message::error_line(format!("MOVED 500 {}", moved_to))]
        })
    });
    second.set(&key, "bar", -1);
    let client = connect(&first).await;
    assert!(client.is_cluster());

    let get = || Command::builder("GET").key(key.as_str()).build();
    assert_eq!(client.execute(get()).await.unwrap().as_str().unwrap(), "bar");
    assert_eq!(client.execute(get()).await.unwrap().as_str().unwrap(), "bar");

    let line = format!("GET {}", key);
    assert_eq!(first.count(&line), 1);
    assert_eq!(second.count(&line), 2);
    assert!(migrated.load(Ordering::SeqCst));
    client.close().await;
}

#[tokio::test]
async fn test_ask_is_followed_once() {
    let (first, second, _) = two_nodes().await;
    let key = key_for_slot(700);
    let ask_to = second.addr().to_string();
    let a = first.port();
    first.handle(move |args| {
        if is_cluster_slots(args) {
            return Some(cluster_slots(&[(0, 16383, &[a])]));
        }
        (args[0] == "GET").then(|| vec![Message::error_line(format!("ASK 700 {}", ask_to))])
    });
    second.set(&key, "migrating", -1);
    let client = connect(&first).await;

    for _ in 0..2 {
        let reply = client
            .execute(Command::builder("GET").key(key.as_str()).build())
            .await
            .unwrap();
        assert_eq!(reply.as_str().unwrap(), "migrating");
    }
    let line = format!("GET {}", key);
    assert_eq!(first.count(&line), 2);
    assert_eq!(second.commands(), vec!["ASKING".to_string(), line.clone(), "ASKING".into(), line]);
    client.close().await;
}

#[tokio::test]
async fn test_batches_span_nodes() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    for server in [&first, &second] {
        let (a, b) = (first.port(), second.port());
        server.handle(move |args| {
            is_cluster_slots(args).then(|| cluster_slots(&[(0, 8191, &[a]), (8192, 16383, &[b])]))
        });
    }
    let client = connect(&first).await;
    let mut nodes = vec![first.addr().to_string(), second.addr().to_string()];
    nodes.sort();
    assert_eq!(client.nodes(), nodes);
    assert_eq!(client.shards().len(), 2);

    let (low, high) = (key_in(0..8192), key_in(8192..16384));
    let replies = client
        .execute_multi(vec![
            Command::builder("SET").key(low.as_str()).arg("l").build(),
            Command::builder("SET").key(high.as_str()).arg("h").build(),
            Command::builder("GET").key(high.as_str()).build(),
            Command::builder("GET").key(low.as_str()).build(),
        ])
        .await;
    let replies: Vec<String> = replies.into_iter().map(|r| r.unwrap().to_string_lossy()).collect();
    assert_eq!(replies, vec!["OK", "OK", "h", "l"]);
    assert_eq!(first.count(&format!("GET {}", low)), 1);
    assert_eq!(second.count(&format!("GET {}", high)), 1);

    let replies = client
        .execute_multi(vec![
            Command::from_args(["PING"]),
            Command::builder("GET").key(low.as_str()).build(),
            Command::builder("GET").key(high.as_str()).build(),
        ])
        .await;
    assert!(replies.iter().all(|r| matches!(r, Err(RedisError::CrossSlot))));
    client.close().await;
}

#[tokio::test]
async fn test_dedicated_transaction_follows_slot_owner() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    for server in [&first, &second] {
        let (a, b) = (first.port(), second.port());
        server.handle(move |args| {
            is_cluster_slots(args).then(|| cluster_slots(&[(0, 8191, &[a]), (8192, 16383, &[b])]))
        });
    }
    let client = connect(&first).await;
    let key = key_in(8192..16384);

    let dedicated = client.dedicate();
    let replies = dedicated
        .execute_multi(vec![
            Command::from_args(["MULTI"]),
            Command::builder("SET").key(key.as_str()).arg("v").build(),
            Command::from_args(["EXEC"]),
        ])
        .await;
    assert!(replies.iter().all(Result::is_ok));
    assert!(second.commands().contains(&format!("SET {} v", key)));
    dedicated.release().await;
    client.close().await;
}
