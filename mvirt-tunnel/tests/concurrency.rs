//! Locking behavior of the reconciliation engine.

mod common;

use std::sync::Arc;
use std::time::Duration;

use mvirt_tunnel::config::EngineConfig;
use mvirt_tunnel::store::MemoryStore;
use mvirt_tunnel::test_util::{FakeHost, HostEvent};
use mvirt_tunnel::{TargetStatus, TunnelError, TunnelFields};

use common::{Harness, gre, partial, sit1};

/// Commands never overlap: every start is followed by its own finish.
fn assert_serialized(events: &[HostEvent]) {
    for pair in events.chunks(2) {
        match pair {
            [HostEvent::Started(a), HostEvent::Finished(b)] => assert_eq!(a, b),
            other => panic!("interleaved commands: {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_same_interface_operations_do_not_interleave() {
    let h = Harness::slow(Duration::from_millis(20));
    let tunnel = h.engine.create(sit1()).await.unwrap();

    let update = {
        let engine = Arc::clone(&h.engine);
        let id = tunnel.id.clone();
        tokio::spawn(async move {
            let fields = TunnelFields {
                mtu: Some("1400".to_string()),
                ..partial()
            };
            engine.update(&id, fields).await
        })
    };
    let toggle = {
        let engine = Arc::clone(&h.engine);
        let id = tunnel.id.clone();
        tokio::spawn(async move { engine.set_status(&id, TargetStatus::Inactive).await })
    };
    let delete = {
        let engine = Arc::clone(&h.engine);
        let id = tunnel.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            engine.delete(&id).await
        })
    };

    update.await.unwrap().unwrap();
    toggle.await.unwrap().unwrap();
    delete.await.unwrap().unwrap();

    assert_eq!(h.host.max_in_flight(), 1);
    assert_serialized(&h.host.events());
    assert!(h.engine.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_update_runs_as_one_block() {
    let h = Harness::slow(Duration::from_millis(10));
    let tunnel = h.engine.create(sit1()).await.unwrap();
    let before = h.host.commands().len();

    let update = {
        let engine = Arc::clone(&h.engine);
        let id = tunnel.id.clone();
        tokio::spawn(async move { engine.update(&id, partial()).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    h.engine
        .set_status(&tunnel.id, TargetStatus::Inactive)
        .await
        .unwrap();
    update.await.unwrap().unwrap();

    // The toggle waited for the whole recreate.
    let lines: Vec<String> = h.host.command_lines().into_iter().skip(before).collect();
    assert_eq!(lines.first().map(String::as_str), Some("ip link delete dev sit1"));
    assert_eq!(lines[lines.len() - 2], "ip link set dev sit1 up");
    assert_eq!(lines[lines.len() - 1], "ip link set dev sit1 down");
}

#[tokio::test]
async fn test_different_interfaces_run_in_parallel() {
    let h = Harness::slow(Duration::from_millis(50));

    let (a, b) = tokio::join!(h.engine.create(sit1()), h.engine.create(gre("gre1")));
    a.unwrap();
    b.unwrap();

    assert!(h.host.max_in_flight() >= 2);
}

#[tokio::test]
async fn test_concurrent_creates_on_one_name() {
    let h = Harness::slow(Duration::from_millis(10));

    let (a, b) = tokio::join!(h.engine.create(sit1()), h.engine.create(sit1()));

    let conflicts = [&a, &b]
        .iter()
        .filter(|r| matches!(r, Err(TunnelError::Conflict(_))))
        .count();
    assert_eq!(conflicts, 1);
    assert!(a.is_ok() || b.is_ok());
    assert_eq!(h.host.commands().len(), 3);
    assert_eq!(h.engine.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_lock_timeout_is_busy() {
    let h = Harness::build(
        FakeHost::with_delay(Duration::from_millis(200)),
        Arc::new(MemoryStore::new()),
        EngineConfig {
            lock_timeout: Duration::from_millis(20),
        },
    );
    let tunnel = h.engine.create(sit1()).await.unwrap();

    let slow = {
        let engine = Arc::clone(&h.engine);
        let id = tunnel.id.clone();
        tokio::spawn(async move { engine.set_status(&id, TargetStatus::Active).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = h
        .engine
        .set_status(&tunnel.id, TargetStatus::Inactive)
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::Busy(ref name) if name == "sit1"));

    slow.await.unwrap().unwrap();
    assert_eq!(
        h.host.command_lines().last().map(String::as_str),
        Some("ip link set dev sit1 up")
    );
}
