//! # Command Integration Tests
//!
//! End-to-end command behaviour through the TCP server: keyspace commands,
//! expiry, watch pushes, INFO, and recovery from the durability log.

mod common;

use std::time::Duration;

use skv_engine::WalConfig;
use tokio::time::{sleep, timeout};

use common::{spawn_server, spawn_server_with, Value};

#[tokio::test]
async fn del_behaves_like_redis() {
    let server = spawn_server().await;
    let mut client = server.client().await;

    let cases: &[(&str, &[&str], &[Value])] = &[
        (
            "DEL with set key",
            &["SET k1 v1", "DEL k1", "GET k1"],
            &[Value::ok(), Value::Int(1), Value::Nil],
        ),
        (
            "DEL with multiple keys",
            &["SET k1 v1", "SET k2 v2", "DEL k1 k2", "GET k1", "GET k2"],
            &[Value::ok(), Value::ok(), Value::Int(2), Value::Nil, Value::Nil],
        ),
        (
            "DEL with key not set",
            &["GET k3", "DEL k3"],
            &[Value::Nil, Value::Int(0)],
        ),
        (
            "DEL with no keys or arguments",
            &["DEL"],
            &[Value::Error(
                "ERR wrong number of arguments for 'del' command".to_string(),
            )],
        ),
    ];

    for (name, commands, expected) in cases {
        for (command, want) in commands.iter().zip(expected.iter()) {
            assert_eq!(&client.fire(command).await, want, "{name}: {command}");
        }
    }

    let (_, result) = server.shutdown().await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn keys_expire() {
    let server = spawn_server().await;
    let mut client = server.client().await;

    assert_eq!(client.fire("SET key value PX 100").await, Value::ok());
    assert_eq!(client.fire("EXISTS key").await, Value::Int(1));
    sleep(Duration::from_millis(200)).await;
    assert_eq!(client.fire("GET key").await, Value::Nil);
    assert_eq!(client.fire("TTL key").await, Value::Int(-2));

    assert_eq!(client.fire("SET key value").await, Value::ok());
    assert_eq!(client.fire("TTL key").await, Value::Int(-1));
    assert_eq!(client.fire("EXPIRE key 100").await, Value::Int(1));
    match client.fire("TTL key").await {
        Value::Int(ttl) => assert!((99..=100).contains(&ttl)),
        other => panic!("unexpected TTL reply {other:?}"),
    }

    let (_, result) = server.shutdown().await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn unknown_command_and_bad_arity() {
    let server = spawn_server().await;
    let mut client = server.client().await;

    assert_eq!(
        client.fire("NOPE a b").await,
        Value::Error("ERR unknown command 'nope'".to_string())
    );
    assert_eq!(
        client.fire("GET").await,
        Value::Error("ERR wrong number of arguments for 'get' command".to_string())
    );
    assert_eq!(client.fire("PING hello").await, Value::bulk("hello"));

    let (_, result) = server.shutdown().await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn watch_pushes_current_value_then_changes() {
    let server = spawn_server().await;
    let mut watcher = server.client().await;
    let mut writer = server.client().await;

    watcher.send(&["GET.WATCH", "score"]).await;
    let first = watcher.read().await;
    let fingerprint = match &first {
        Value::Array(items) => {
            assert_eq!(items.len(), 3);
            assert_eq!(items[0], Value::bulk("GET.WATCH"));
            assert_eq!(items[2], Value::Nil);
            items[1].clone()
        }
        other => panic!("expected a watch push, got {other:?}"),
    };

    assert_eq!(writer.fire("SET score 10").await, Value::ok());
    assert_eq!(
        watcher.read().await,
        Value::Array(vec![
            Value::bulk("GET.WATCH"),
            fingerprint.clone(),
            Value::bulk("10"),
        ])
    );

    assert_eq!(writer.fire("DEL score").await, Value::Int(1));
    assert_eq!(
        watcher.read().await,
        Value::Array(vec![Value::bulk("GET.WATCH"), fingerprint.clone(), Value::Nil])
    );

    // Unrelated keys produce nothing.
    assert_eq!(writer.fire("SET other 1").await, Value::ok());

    let Value::Bulk(raw) = fingerprint else {
        unreachable!()
    };
    let fingerprint = String::from_utf8(raw).unwrap();
    assert_eq!(
        watcher.fire(&format!("GET.UNWATCH {fingerprint}")).await,
        Value::ok()
    );

    // Give the watch manager time to process the unsubscribe.
    sleep(Duration::from_millis(50)).await;
    assert_eq!(writer.fire("SET score 11").await, Value::ok());
    assert_eq!(watcher.fire("PING").await, Value::Simple("PONG".to_string()));

    let (_, result) = server.shutdown().await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn watchers_of_one_key_each_get_one_push() {
    let server = spawn_server().await;
    let mut a = server.client().await;
    let mut b = server.client().await;
    let mut writer = server.client().await;

    a.send(&["GET.WATCH", "shared"]).await;
    b.send(&["GET.WATCH", "shared"]).await;
    assert!(matches!(a.read().await, Value::Array(_)));
    assert!(matches!(b.read().await, Value::Array(_)));

    assert_eq!(writer.fire("SET shared x").await, Value::ok());
    for watcher in [&mut a, &mut b] {
        match watcher.read().await {
            Value::Array(items) => assert_eq!(items[2], Value::bulk("x")),
            other => panic!("expected a watch push, got {other:?}"),
        }
    }

    // Exactly one push each: the next reply on each socket is the PING.
    assert_eq!(a.fire("PING").await, Value::Simple("PONG".to_string()));
    assert_eq!(b.fire("PING").await, Value::Simple("PONG".to_string()));

    // A watcher that disconnected is dropped without disturbing the other.
    drop(a);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(writer.fire("SET shared y").await, Value::ok());
    match timeout(Duration::from_secs(2), b.read()).await.unwrap() {
        Value::Array(items) => assert_eq!(items[2], Value::bulk("y")),
        other => panic!("expected a watch push, got {other:?}"),
    }

    let (_, result) = server.shutdown().await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn info_reports_engine_and_clients() {
    let server = spawn_server().await;
    let mut client = server.client().await;
    assert_eq!(client.fire("SET k v").await, Value::ok());

    let Value::Bulk(info) = client.fire("INFO").await else {
        panic!("INFO must reply with a bulk string");
    };
    let info = String::from_utf8(info).unwrap();
    assert!(info.contains("engine:shardkv"));
    assert!(info.contains("shards:4"));
    assert!(info.contains("registered_clients:1"));
    assert!(info.contains("total_commands_processed:"));

    let (_, result) = server.shutdown().await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn mutations_survive_restart_through_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let wal = WalConfig {
        enabled: true,
        path: dir.path().join("skv.wal"),
        sync_on_append: false,
    };

    let server = spawn_server_with(&wal).await;
    let mut client = server.client().await;
    assert_eq!(client.fire("SET kept 1").await, Value::ok());
    assert_eq!(client.fire("SET dropped 2").await, Value::ok());
    assert_eq!(client.fire("DEL dropped").await, Value::Int(1));
    assert_eq!(client.fire("GET kept").await, Value::bulk("1"));
    drop(client);
    let (_, result) = server.shutdown().await;
    assert!(result.is_ok());

    let server = spawn_server_with(&wal).await;
    let mut client = server.client().await;
    assert_eq!(client.fire("GET kept").await, Value::bulk("1"));
    assert_eq!(client.fire("GET dropped").await, Value::Nil);
    let (_, result) = server.shutdown().await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn huge_expiry_is_rejected_and_not_logged() {
    let dir = tempfile::tempdir().unwrap();
    let wal = WalConfig {
        enabled: true,
        path: dir.path().join("skv.wal"),
        sync_on_append: false,
    };

    let server = spawn_server_with(&wal).await;
    let mut client = server.client().await;
    let invalid = Value::Error("ERR invalid expire time".to_string());
    assert_eq!(client.fire("SET k v EX 9223372036854775807").await, invalid);
    assert_eq!(client.fire("SET k v PX 9223372036854775807").await, invalid);
    assert_eq!(client.fire("SET k v").await, Value::ok());
    assert_eq!(client.fire("EXPIRE k 9223372036854775807").await, invalid);
    assert_eq!(client.fire("GET k").await, Value::bulk("v"));
    assert_eq!(client.fire("TTL k").await, Value::Int(-1));
    drop(client);
    let (_, result) = server.shutdown().await;
    assert!(result.is_ok());

    let server = spawn_server_with(&wal).await;
    let mut client = server.client().await;
    assert_eq!(client.fire("GET k").await, Value::bulk("v"));
    let (_, result) = server.shutdown().await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn watch_reports_expiry() {
    let server = spawn_server().await;
    let mut watcher = server.client().await;
    let mut writer = server.client().await;

    assert_eq!(writer.fire("SET session token PX 100").await, Value::ok());
    watcher.send(&["GET.WATCH", "session"]).await;
    match watcher.read().await {
        Value::Array(items) => assert_eq!(items[2], Value::bulk("token")),
        other => panic!("expected a watch push, got {other:?}"),
    }

    // The sweep removes the key and the watcher sees it go.
    match watcher.read().await {
        Value::Array(items) => assert_eq!(items[2], Value::Nil),
        other => panic!("expected a watch push, got {other:?}"),
    }

    let (_, result) = server.shutdown().await;
    assert!(result.is_ok());
}
