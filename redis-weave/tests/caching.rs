mod common;

use common::MockServer;
use redis_weave::{CacheableTtl, Client, ClientConfig, Command, Message};
use std::time::Duration;

async fn connect(server: &MockServer) -> Client {
    let config = ClientConfig::new([server.addr()])
        .with_keep_alive_interval(None)
        .with_pipeline_multiplex(0);
    Client::connect(config).await.unwrap()
}

fn cached_get(key: &str) -> redis_weave::Cacheable {
    Command::builder("GET").key(key).build_cacheable().unwrap()
}

#[tokio::test]
async fn test_server_ttl_caps_client_ttl() {
    let server = MockServer::start().await;
    server.set("foo", "bar", 3000);
    let client = connect(&server).await;

    let first = client
        .execute_cached(&cached_get("foo"), Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(first.as_str().unwrap(), "bar");
    let ttl = first.cache_ttl().unwrap();
    assert!(ttl <= Duration::from_secs(3), "ttl {:?}", ttl);
    assert!(ttl > Duration::from_secs(2), "ttl {:?}", ttl);

    let second = client
        .execute_cached(&cached_get("foo"), Duration::from_secs(10))
        .await
        .unwrap();
    assert!(second.is_cache_hit());
    assert_eq!(server.count("GET foo"), 1);
    client.close().await;
}

#[tokio::test]
async fn test_concurrent_misses_share_one_round_trip() {
    let server = MockServer::start().await;
    server.set("bar", "v", -1);
    let client = connect(&server).await;

    let cmd = cached_get("bar");
    let (a, b) = tokio::join!(
        client.execute_cached(&cmd, Duration::from_secs(10)),
        client.execute_cached(&cmd, Duration::from_secs(10)),
    );
    assert_eq!(a.unwrap().as_bytes().unwrap(), b.unwrap().as_bytes().unwrap());
    assert_eq!(server.count("GET bar"), 1);
    assert_eq!(server.count("PTTL bar"), 1);
    client.close().await;
}

#[tokio::test]
async fn test_invalidation_evicts_cached_key() {
    let server = MockServer::start().await;
    server.set("foo", "bar", -1);
    let client = connect(&server).await;

    client
        .execute_cached(&cached_get("foo"), Duration::from_secs(10))
        .await
        .unwrap();
    server.set("foo", "baz", -1);
    server.push(Message::push(vec![
        Message::blob("invalidate"),
        Message::array(vec![Message::blob("foo")]),
    ]));
    // the invalidation is read before this reply
    client.execute(Command::from_args(["PING"])).await.unwrap();

    let again = client
        .execute_cached(&cached_get("foo"), Duration::from_secs(10))
        .await
        .unwrap();
    assert!(!again.is_cache_hit());
    assert_eq!(again.as_str().unwrap(), "baz");
    assert_eq!(server.count("GET foo"), 2);
    client.close().await;
}

#[tokio::test]
async fn test_multi_cached_fetches_only_misses() {
    let server = MockServer::start().await;
    server.set("a", "1", -1);
    server.set("b", "2", -1);
    let client = connect(&server).await;

    client
        .execute_cached(&cached_get("a"), Duration::from_secs(10))
        .await
        .unwrap();
    let replies = client
        .execute_multi_cached(&[
            CacheableTtl::new(cached_get("a"), Duration::from_secs(10)),
            CacheableTtl::new(cached_get("b"), Duration::from_secs(10)),
        ])
        .await;
    let replies: Vec<Message> = replies.into_iter().map(Result::unwrap).collect();
    assert!(replies[0].is_cache_hit());
    assert_eq!(replies[0].as_str().unwrap(), "1");
    assert!(!replies[1].is_cache_hit());
    assert_eq!(replies[1].as_str().unwrap(), "2");
    assert_eq!(server.count("GET a"), 1);
    assert_eq!(server.count("GET b"), 1);
    client.close().await;
}

#[tokio::test]
async fn test_cache_can_be_disabled() {
    let server = MockServer::start().await;
    server.set("foo", "bar", -1);
    let config = ClientConfig::new([server.addr()])
        .with_keep_alive_interval(None)
        .without_cache();
    let client = Client::connect(config).await.unwrap();

    for _ in 0..2 {
        let reply = client
            .execute_cached(&cached_get("foo"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(reply.as_str().unwrap(), "bar");
    }
    assert_eq!(server.count("GET foo"), 2);
    client.close().await;
}
