//! Client integration tests against a scripted coordinator.
//!
//! The client talks through the in-memory channel transport; each test plays
//! the coordinator side by hand through the `ChannelPeer`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{Duration as ChronoDuration, Utc};
use progress_sync::model::{ErrorPayload, RestoreRequest};
use progress_sync::protocol::{MessageType, Origin, SyncMessage};
use progress_sync::storage::{LocalStorage, MemoryStorage};
use progress_sync::transport::{ChannelConnector, ChannelPeer};
use progress_sync::{
    ClientConfig, ConnectionState, EventKind, JoinAck, OfflineProgressUpdate, OfflineSyncSummary,
    ProgressState, ProgressSyncClient, ProgressUpdate, SyncError, SyncEvent,
};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout, Duration};

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct Harness {
    client: ProgressSyncClient,
    peers: UnboundedReceiver<ChannelPeer>,
    storage: Arc<MemoryStorage>,
}

fn harness() -> Harness {
    harness_with_capacity(256)
}

/// Harness whose transport buffers at most `capacity` outgoing frames.
fn harness_with_capacity(capacity: usize) -> Harness {
    let storage = Arc::new(MemoryStorage::new());
    let (connector, peers) = ChannelConnector::with_capacity(capacity);
    let client = ProgressSyncClient::new(
        ClientConfig::for_testing(),
        Arc::new(connector),
        storage.clone(),
    );
    Harness {
        client,
        peers,
        storage,
    }
}

/// Poll a condition until it holds, failing after two seconds.
async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("Timed out waiting for {what}");
}

fn record(client: &ProgressSyncClient, kind: EventKind) -> Arc<Mutex<Vec<SyncEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    client.on(kind, move |event| sink.lock().unwrap().push(event.clone()));
    seen
}

async fn next_message(peer: &mut ChannelPeer) -> SyncMessage {
    timeout(Duration::from_secs(2), peer.recv_message())
        .await
        .expect("peer receive timed out")
        .expect("client hung up")
        .expect("undecodable frame")
}

/// Accept the next connection, acknowledge the join and send a snapshot.
async fn accept_join(
    peers: &mut UnboundedReceiver<ChannelPeer>,
    snapshot: &[ProgressState],
) -> ChannelPeer {
    let mut peer = timeout(Duration::from_secs(2), peers.recv())
        .await
        .expect("no connection attempt")
        .expect("connector dropped");
    let join = next_message(&mut peer).await;
    assert_eq!(join.msg_type, MessageType::JoinRoom);

    let ack = JoinAck {
        child_id: join.origin.child_id.clone(),
        device_id: join.origin.device_id.clone(),
        session_id: join.origin.session_id.clone(),
        connected_devices: 1,
    };
    peer.send_message(&SyncMessage::joined(&ack).unwrap())
        .await
        .unwrap();
    peer.send_message(
        &SyncMessage::progress_state(Origin::coordinator(&join.origin.child_id), snapshot)
            .unwrap(),
    )
    .await
    .unwrap();
    peer
}

/// Connect to room `c1` and wait until the join snapshot has been applied.
async fn connect(h: &mut Harness, snapshot: &[ProgressState]) -> ChannelPeer {
    let applied = Arc::new(AtomicBool::new(false));
    let flag = applied.clone();
    let listener = h.client.on(EventKind::ProgressStateUpdated, move |_| {
        flag.store(true, Ordering::SeqCst);
    });

    let client = h.client.clone();
    let task = tokio::spawn(async move { client.connect("c1").await });
    let peer = accept_join(&mut h.peers, snapshot).await;
    task.await.unwrap().unwrap();

    wait_until("join snapshot", || {
        let applied = applied.clone();
        async move { applied.load(Ordering::SeqCst) }
    })
    .await;
    h.client.off(EventKind::ProgressStateUpdated, listener);
    peer
}

fn remote_update(activity_id: &str, progress: f64, device: &str) -> ProgressUpdate {
    ProgressUpdate {
        child_id: "c1".into(),
        activity_id: activity_id.into(),
        progress,
        timestamp: Utc::now(),
        device_id: device.into(),
        session_id: format!("{device}-session"),
        metadata: None,
    }
}

fn snapshot_state(activity_id: &str, progress: f64) -> ProgressState {
    ProgressState {
        activity_id: activity_id.into(),
        progress,
        last_accessed: Utc::now() - ChronoDuration::minutes(10),
        session_data: Default::default(),
        activity: None,
    }
}

// ─── Room lifecycle ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_joins_room_and_loads_snapshot() {
    let mut h = harness();
    let connected = record(&h.client, EventKind::Connected);
    let snapshots = record(&h.client, EventKind::ProgressStateUpdated);

    let _peer = connect(
        &mut h,
        &[snapshot_state("A", 50.0), snapshot_state("B", 70.0)],
    )
    .await;

    assert_eq!(h.client.connection_state().await, ConnectionState::Connected);
    assert_eq!(connected.lock().unwrap().len(), 1);

    let client = h.client.clone();
    wait_until("snapshot", || {
        let client = client.clone();
        async move { client.all_progress_state().await.len() == 2 }
    })
    .await;
    assert_eq!(h.client.progress_state("A").await.unwrap().progress, 50.0);
    assert_eq!(snapshots.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_snapshot_removes_activities_it_does_not_contain() {
    let mut h = harness();
    let peer = connect(&mut h, &[snapshot_state("old", 10.0)]).await;
    let client = h.client.clone();
    wait_until("first snapshot", || {
        let client = client.clone();
        async move { client.progress_state("old").await.is_some() }
    })
    .await;

    peer.send_message(
        &SyncMessage::progress_state(
            Origin::coordinator("c1"),
            &[snapshot_state("A", 50.0), snapshot_state("B", 70.0)],
        )
        .unwrap(),
    )
    .await
    .unwrap();

    wait_until("second snapshot", || {
        let client = client.clone();
        async move { client.progress_state("old").await.is_none() }
    })
    .await;
    let ids: Vec<_> = h
        .client
        .all_progress_state()
        .await
        .into_iter()
        .map(|s| s.activity_id)
        .collect();
    assert_eq!(ids, vec!["A", "B"]);
}

#[tokio::test]
async fn test_connect_times_out_without_ack() {
    let mut h = harness();
    let client = h.client.clone();
    let task = tokio::spawn(async move { client.connect("c1").await });

    // Accept the transport but never acknowledge the join
    let mut peer = h.peers.recv().await.unwrap();
    let join = next_message(&mut peer).await;
    assert_eq!(join.msg_type, MessageType::JoinRoom);

    let result = task.await.unwrap();
    assert_eq!(result, Err(SyncError::ConnectionTimeout));
    assert_eq!(h.client.connection_state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_connect_fails_when_transport_errors_before_ack() {
    let mut h = harness();
    let client = h.client.clone();
    let task = tokio::spawn(async move { client.connect("c1").await });

    let mut peer = h.peers.recv().await.unwrap();
    let _join = next_message(&mut peer).await;
    peer.fail("handshake rejected").await;

    let result = task.await.unwrap();
    assert!(matches!(result, Err(SyncError::ConnectionError(_))));
}

#[tokio::test]
async fn test_join_rejection_fails_connect_without_waiting_for_timeout() {
    let mut h = harness();
    let errors = record(&h.client, EventKind::Error);
    let client = h.client.clone();
    let task = tokio::spawn(async move { client.connect("c1").await });

    let mut peer = h.peers.recv().await.unwrap();
    let _join = next_message(&mut peer).await;
    peer.send_message(
        &SyncMessage::error(MessageType::Error, Origin::coordinator("c1"), None, "room is full")
            .unwrap(),
    )
    .await
    .unwrap();

    // connect_timeout is 500ms in the test config
    let result = timeout(Duration::from_millis(300), task)
        .await
        .expect("connect waited for its timeout")
        .unwrap();
    assert_eq!(result, Err(SyncError::ConnectionError("room is full".into())));
    assert_eq!(h.client.connection_state().await, ConnectionState::Disconnected);
    assert_eq!(*errors.lock().unwrap(), vec![SyncEvent::Error("room is full".into())]);
}

#[tokio::test]
async fn test_connect_to_another_child_switches_rooms() {
    let mut h = harness();
    let _first = connect(&mut h, &[snapshot_state("A", 50.0)]).await;
    let client = h.client.clone();
    wait_until("snapshot", || {
        let client = client.clone();
        async move { client.progress_state("A").await.is_some() }
    })
    .await;

    let client = h.client.clone();
    let task = tokio::spawn(async move { client.connect("c2").await });
    let mut peer = h.peers.recv().await.unwrap();
    let join = next_message(&mut peer).await;
    assert_eq!(join.origin.child_id, "c2");
    let ack = JoinAck {
        child_id: "c2".into(),
        device_id: join.origin.device_id.clone(),
        session_id: join.origin.session_id.clone(),
        connected_devices: 1,
    };
    peer.send_message(&SyncMessage::joined(&ack).unwrap()).await.unwrap();
    peer.send_message(&SyncMessage::progress_state(Origin::coordinator("c2"), &[]).unwrap())
        .await
        .unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(h.client.child_id().await.as_deref(), Some("c2"));
    let client = h.client.clone();
    wait_until("empty snapshot for c2", || {
        let client = client.clone();
        async move { client.all_progress_state().await.is_empty() }
    })
    .await;
}

#[tokio::test]
async fn test_disconnect_clears_state_and_listeners() {
    let mut h = harness();
    let errors = record(&h.client, EventKind::Error);
    let _peer = connect(&mut h, &[]).await;
    h.client.update_progress("act-1", 20.0, None).await.unwrap();

    h.client.disconnect().await;
    h.client.disconnect().await;

    assert_eq!(h.client.connection_state().await, ConnectionState::Disconnected);
    assert_eq!(h.client.child_id().await, None);
    assert!(h.client.all_progress_state().await.is_empty());
    assert_eq!(
        h.client.update_progress("act-1", 30.0, None).await,
        Err(SyncError::NotConnected)
    );
    assert!(errors.lock().unwrap().is_empty());
}

// ─── Progress updates ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_update_is_applied_locally_and_sent() {
    let mut h = harness();
    let mut peer = connect(&mut h, &[]).await;

    h.client
        .update_progress("act-1", 45.0, Some(json!({"clicks": 3})))
        .await
        .unwrap();

    // Optimistic: visible before any reply
    let local = h.client.progress_state("act-1").await.unwrap();
    assert_eq!(local.progress, 45.0);
    assert_eq!(local.session_data["clicks"], json!(3));

    let sent = next_message(&mut peer).await;
    assert_eq!(sent.msg_type, MessageType::ProgressUpdate);
    let update: ProgressUpdate = sent.body().unwrap();
    assert_eq!(update.child_id, "c1");
    assert_eq!(update.activity_id, "act-1");
    assert_eq!(update.progress, 45.0);
    assert_eq!(update.device_id, h.client.device_id());
    assert_eq!(update.session_id, h.client.session_id());
    assert_eq!(h.client.offline_queue_len().await, 0);
}

#[tokio::test]
async fn test_update_without_child_is_rejected() {
    let h = harness();
    let result = h.client.update_progress("act-1", 10.0, None).await;
    assert_eq!(result, Err(SyncError::NotConnected));
    assert_eq!(h.client.offline_queue_len().await, 0);
}

#[tokio::test]
async fn test_remote_update_applied_and_emitted() {
    let mut h = harness();
    let updates = record(&h.client, EventKind::ProgressUpdated);
    let peer = connect(&mut h, &[]).await;

    let remote = remote_update("act-1", 80.0, "phone");
    peer.send_message(&SyncMessage::progress_updated(&remote).unwrap())
        .await
        .unwrap();

    let client = h.client.clone();
    wait_until("remote update", || {
        let client = client.clone();
        async move { client.progress_state("act-1").await.is_some() }
    })
    .await;
    assert_eq!(h.client.progress_state("act-1").await.unwrap().progress, 80.0);
    assert_eq!(
        *updates.lock().unwrap(),
        vec![SyncEvent::ProgressUpdated(remote)]
    );
}

#[tokio::test]
async fn test_own_echo_is_not_reapplied() {
    let mut h = harness();
    let updates = record(&h.client, EventKind::ProgressUpdated);
    let mut peer = connect(&mut h, &[]).await;

    h.client.update_progress("act-1", 45.0, None).await.unwrap();
    let sent: ProgressUpdate = next_message(&mut peer).await.body().unwrap();

    // Echo of our own update, then a marker from another device
    peer.send_message(&SyncMessage::progress_broadcast(&sent).unwrap())
        .await
        .unwrap();
    let marker = remote_update("marker", 1.0, "phone");
    peer.send_message(&SyncMessage::progress_updated(&marker).unwrap())
        .await
        .unwrap();

    let client = h.client.clone();
    wait_until("marker", || {
        let client = client.clone();
        async move { client.progress_state("marker").await.is_some() }
    })
    .await;
    assert_eq!(*updates.lock().unwrap(), vec![SyncEvent::ProgressUpdated(marker)]);
}

#[tokio::test]
async fn test_resolution_from_own_device_is_applied() {
    let mut h = harness();
    let resolved = record(&h.client, EventKind::ProgressResolved);
    let mut peer = connect(&mut h, &[]).await;

    h.client.update_progress("act-1", 30.0, None).await.unwrap();
    let sent: ProgressUpdate = next_message(&mut peer).await.body().unwrap();

    // Coordinator kept an older value from this same session
    let mut surviving = sent.clone();
    surviving.progress = 80.0;
    peer.send_message(&SyncMessage::progress_resolved(&surviving).unwrap())
        .await
        .unwrap();

    let client = h.client.clone();
    wait_until("resolution", || {
        let client = client.clone();
        async move { client.progress_state("act-1").await.map(|s| s.progress) == Some(80.0) }
    })
    .await;
    assert_eq!(resolved.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_fresher_local_write_survives_stale_snapshot() {
    let mut h = harness();
    let peer = connect(&mut h, &[]).await;

    h.client.update_progress("act-1", 75.0, None).await.unwrap();
    // Snapshot computed before the write reached the coordinator
    peer.send_message(
        &SyncMessage::progress_state(Origin::coordinator("c1"), &[snapshot_state("act-1", 30.0)])
            .unwrap(),
    )
    .await
    .unwrap();
    let marker = remote_update("marker", 1.0, "phone");
    peer.send_message(&SyncMessage::progress_updated(&marker).unwrap())
        .await
        .unwrap();

    let client = h.client.clone();
    wait_until("marker", || {
        let client = client.clone();
        async move { client.progress_state("marker").await.is_some() }
    })
    .await;
    assert_eq!(h.client.progress_state("act-1").await.unwrap().progress, 75.0);
}

#[tokio::test]
async fn test_coordinator_error_is_emitted() {
    let mut h = harness();
    let errors = record(&h.client, EventKind::Error);
    let peer = connect(&mut h, &[]).await;

    peer.send_message(
        &SyncMessage::error(
            MessageType::ProgressError,
            Origin::coordinator("c1"),
            None,
            "invalid progress",
        )
        .unwrap(),
    )
    .await
    .unwrap();

    wait_until("error event", || {
        let errors = errors.clone();
        async move { !errors.lock().unwrap().is_empty() }
    })
    .await;
    assert_eq!(
        errors.lock().unwrap()[0],
        SyncEvent::Error("invalid progress".into())
    );
}

#[tokio::test]
async fn test_panicking_listener_does_not_stop_delivery() {
    let mut h = harness();
    h.client.on(EventKind::ProgressUpdated, |_| panic!("bad listener"));
    let updates = record(&h.client, EventKind::ProgressUpdated);
    let peer = connect(&mut h, &[]).await;

    peer.send_message(&SyncMessage::progress_updated(&remote_update("a", 5.0, "phone")).unwrap())
        .await
        .unwrap();

    wait_until("second listener", || {
        let updates = updates.clone();
        async move { updates.lock().unwrap().len() == 1 }
    })
    .await;
    assert!(h.client.is_connected().await);
}

// ─── Offline queue ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_offline_updates_are_queued_without_coalescing() {
    let mut h = harness();
    let queued = record(&h.client, EventKind::ProgressQueued);
    let disconnected = record(&h.client, EventKind::Disconnected);
    let peer = connect(&mut h, &[]).await;

    peer.close().await;
    let client = h.client.clone();
    wait_until("disconnect", || {
        let client = client.clone();
        async move { client.connection_state().await == ConnectionState::Disconnected }
    })
    .await;
    assert_eq!(disconnected.lock().unwrap().len(), 1);

    h.client.update_progress("act-math-1", 40.0, None).await.unwrap();
    h.client.update_progress("act-math-1", 60.0, None).await.unwrap();

    let pending = h.client.queued_updates().await;
    assert_eq!(pending.len(), 2);
    assert_ne!(pending[0].id, pending[1].id);
    assert_eq!(pending[0].update.progress, 40.0);
    assert_eq!(pending[1].update.progress, 60.0);
    assert!(pending.iter().all(|e| !e.synced));
    assert_eq!(queued.lock().unwrap().len(), 2);

    // Offline updates are still applied optimistically
    assert_eq!(
        h.client.progress_state("act-math-1").await.unwrap().progress,
        60.0
    );
}

#[tokio::test]
async fn test_reconnect_replays_queue_in_order_and_clears_it() {
    let mut h = harness();
    let completed = record(&h.client, EventKind::OfflineSyncComplete);
    let _peer = connect(&mut h, &[]).await;

    h.client.set_online(false).await.unwrap();
    assert_eq!(h.client.connection_state().await, ConnectionState::Disconnected);
    for (activity, progress) in [("a", 10.0), ("b", 20.0), ("a", 30.0)] {
        h.client.update_progress(activity, progress, None).await.unwrap();
    }
    assert_eq!(h.client.offline_queue_len().await, 3);

    let client = h.client.clone();
    let task = tokio::spawn(async move { client.set_online(true).await });
    let mut peer = accept_join(&mut h.peers, &[]).await;
    task.await.unwrap().unwrap();

    let replay = next_message(&mut peer).await;
    assert_eq!(replay.msg_type, MessageType::OfflineSync);
    let entries: Vec<OfflineProgressUpdate> = replay.body().unwrap();
    let order: Vec<_> = entries
        .iter()
        .map(|e| (e.update.activity_id.as_str(), e.update.progress))
        .collect();
    assert_eq!(order, vec![("a", 10.0), ("b", 20.0), ("a", 30.0)]);

    // Entries stay queued until the coordinator confirms them
    assert_eq!(h.client.offline_queue_len().await, 3);

    let summary = OfflineSyncSummary {
        synced_ids: entries.iter().map(|e| e.id.clone()).collect(),
        applied: 3,
        conflicts: 0,
    };
    peer.send_message(
        &SyncMessage::offline_sync_complete(Origin::coordinator("c1"), &summary).unwrap(),
    )
    .await
    .unwrap();

    let client = h.client.clone();
    wait_until("queue drained", || {
        let client = client.clone();
        async move { client.offline_queue_len().await == 0 }
    })
    .await;
    assert_eq!(completed.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_partial_confirmation_keeps_remaining_entries() {
    let mut h = harness();
    let _peer = connect(&mut h, &[]).await;
    h.client.set_online(false).await.unwrap();
    h.client.update_progress("a", 10.0, None).await.unwrap();
    h.client.update_progress("b", 20.0, None).await.unwrap();

    let client = h.client.clone();
    let task = tokio::spawn(async move { client.set_online(true).await });
    let mut peer = accept_join(&mut h.peers, &[]).await;
    task.await.unwrap().unwrap();

    let entries: Vec<OfflineProgressUpdate> = next_message(&mut peer).await.body().unwrap();
    let summary = OfflineSyncSummary {
        synced_ids: vec![entries[0].id.clone()],
        applied: 1,
        conflicts: 0,
    };
    peer.send_message(
        &SyncMessage::offline_sync_complete(Origin::coordinator("c1"), &summary).unwrap(),
    )
    .await
    .unwrap();

    let client = h.client.clone();
    wait_until("first entry confirmed", || {
        let client = client.clone();
        async move { client.offline_queue_len().await == 1 }
    })
    .await;
    assert_eq!(h.client.queued_updates().await[0].update.activity_id, "b");
}

#[tokio::test]
async fn test_unsent_frames_are_requeued_on_drop() {
    let mut h = harness();
    let peer = connect(&mut h, &[]).await;

    // Handed to the transport, but the peer never reads it
    h.client.update_progress("act-1", 55.0, None).await.unwrap();
    assert_eq!(h.client.offline_queue_len().await, 0);
    peer.close().await;

    let client = h.client.clone();
    wait_until("requeue", || {
        let client = client.clone();
        async move { client.offline_queue_len().await == 1 }
    })
    .await;
    let pending = h.client.queued_updates().await;
    assert_eq!(pending[0].update.activity_id, "act-1");
    assert_eq!(pending[0].update.progress, 55.0);
}

#[tokio::test]
async fn test_unsent_frames_are_requeued_after_transport_error() {
    let mut h = harness();
    let disconnected = record(&h.client, EventKind::Disconnected);
    let peer = connect(&mut h, &[]).await;

    h.client.update_progress("act-1", 35.0, None).await.unwrap();
    // Error first, then the close that hands back the unread frame
    peer.fail("connection reset").await;

    let client = h.client.clone();
    wait_until("requeue after error", || {
        let client = client.clone();
        async move { client.offline_queue_len().await == 1 }
    })
    .await;
    assert_eq!(h.client.queued_updates().await[0].update.progress, 35.0);
    assert_eq!(disconnected.lock().unwrap().len(), 1);
    assert_eq!(h.client.connection_state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_updates_stay_ordered_behind_a_backlog() {
    let mut h = harness_with_capacity(1);
    let mut peer = connect(&mut h, &[]).await;

    // Takes the only transport slot
    h.client.update_progress("act-1", 10.0, None).await.unwrap();
    // Slot still taken: queued, and its flush waits for room
    let client = h.client.clone();
    let second = tokio::spawn(async move { client.update_progress("act-1", 20.0, None).await });
    let client = h.client.clone();
    wait_until("second update queued", || {
        let client = client.clone();
        async move { client.offline_queue_len().await == 1 }
    })
    .await;

    let mut frames = vec![next_message(&mut peer).await];
    second.await.unwrap().unwrap();

    // Transport has room again, but the backlog is not confirmed yet
    let client = h.client.clone();
    let third = tokio::spawn(async move { client.update_progress("act-1", 30.0, None).await });
    frames.push(next_message(&mut peer).await);
    frames.push(next_message(&mut peer).await);
    third.await.unwrap().unwrap();

    let types: Vec<_> = frames.iter().map(|m| m.msg_type).collect();
    assert_eq!(
        types,
        vec![
            MessageType::ProgressUpdate,
            MessageType::OfflineSync,
            MessageType::OfflineSync
        ]
    );
    let mut order: Vec<f64> = Vec::new();
    for frame in &frames {
        let values: Vec<f64> = match frame.msg_type {
            MessageType::ProgressUpdate => vec![frame.body::<ProgressUpdate>().unwrap().progress],
            _ => frame
                .body::<Vec<OfflineProgressUpdate>>()
                .unwrap()
                .iter()
                .map(|e| e.update.progress)
                .collect(),
        };
        for value in values {
            if !order.contains(&value) {
                order.push(value);
            }
        }
    }
    assert_eq!(order, vec![10.0, 20.0, 30.0]);

    let batch: Vec<OfflineProgressUpdate> = frames[2].body().unwrap();
    let summary = OfflineSyncSummary {
        synced_ids: batch.iter().map(|e| e.id.clone()).collect(),
        applied: 2,
        conflicts: 0,
    };
    peer.send_message(
        &SyncMessage::offline_sync_complete(Origin::coordinator("c1"), &summary).unwrap(),
    )
    .await
    .unwrap();
    let client = h.client.clone();
    wait_until("backlog confirmed", || {
        let client = client.clone();
        async move { client.offline_queue_len().await == 0 }
    })
    .await;

    // No backlog left: straight to the transport again
    h.client.update_progress("act-1", 40.0, None).await.unwrap();
    let direct = next_message(&mut peer).await;
    assert_eq!(direct.msg_type, MessageType::ProgressUpdate);
    assert_eq!(direct.body::<ProgressUpdate>().unwrap().progress, 40.0);
}

#[tokio::test]
async fn test_echo_of_update_queued_by_previous_run_is_not_remote() {
    let mut h = harness();
    let _peer = connect(&mut h, &[]).await;
    h.client.set_online(false).await.unwrap();
    h.client.update_progress("act-1", 10.0, None).await.unwrap();
    let old_session = h.client.session_id().to_string();

    // Same device storage, new process
    let (connector, peers) = ChannelConnector::new();
    let mut restarted = Harness {
        client: ProgressSyncClient::new(
            ClientConfig::for_testing(),
            Arc::new(connector),
            h.storage.clone(),
        ),
        peers,
        storage: h.storage.clone(),
    };
    let updates = record(&restarted.client, EventKind::ProgressUpdated);
    let mut peer = connect(&mut restarted, &[]).await;

    let replay = next_message(&mut peer).await;
    assert_eq!(replay.msg_type, MessageType::OfflineSync);
    let entries: Vec<OfflineProgressUpdate> = replay.body().unwrap();
    assert_eq!(entries[0].update.session_id, old_session);
    assert_eq!(entries[0].update.device_id, restarted.client.device_id());

    // Coordinator echoes the replayed entry, then a change from another device
    peer.send_message(&SyncMessage::progress_updated(&entries[0].update).unwrap())
        .await
        .unwrap();
    let marker = remote_update("marker", 1.0, "phone");
    peer.send_message(&SyncMessage::progress_updated(&marker).unwrap())
        .await
        .unwrap();

    let client = restarted.client.clone();
    wait_until("marker", || {
        let client = client.clone();
        async move { client.progress_state("marker").await.is_some() }
    })
    .await;
    assert_eq!(*updates.lock().unwrap(), vec![SyncEvent::ProgressUpdated(marker)]);
}

#[tokio::test]
async fn test_queue_and_device_id_survive_restart() {
    let mut h = harness();
    let _peer = connect(&mut h, &[]).await;
    h.client.set_online(false).await.unwrap();
    h.client.update_progress("act-1", 10.0, None).await.unwrap();
    let device_id = h.client.device_id().to_string();
    let session_id = h.client.session_id().to_string();

    let (connector, _peers) = ChannelConnector::new();
    let storage: Arc<dyn LocalStorage> = h.storage.clone();
    let restarted = ProgressSyncClient::new(ClientConfig::for_testing(), Arc::new(connector), storage);

    assert_eq!(restarted.device_id(), device_id);
    assert_ne!(restarted.session_id(), session_id);
    assert_eq!(restarted.offline_queue_len().await, 1);
}

#[tokio::test]
async fn test_watch_connectivity_drives_reconnect() {
    let mut h = harness();
    let _peer = connect(&mut h, &[]).await;

    let (online_tx, online_rx) = tokio::sync::watch::channel(true);
    let watcher = h.client.watch_connectivity(online_rx);

    online_tx.send(false).unwrap();
    let client = h.client.clone();
    wait_until("offline", || {
        let client = client.clone();
        async move { client.connection_state().await == ConnectionState::Disconnected }
    })
    .await;

    online_tx.send(true).unwrap();
    let _peer = accept_join(&mut h.peers, &[]).await;
    let client = h.client.clone();
    wait_until("reconnected", || {
        let client = client.clone();
        async move { client.is_connected().await }
    })
    .await;

    watcher.abort();
}

// ─── Backups ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_backup_returns_none_when_disconnected() {
    let h = harness();
    assert_eq!(h.client.create_backup().await, Ok(None));
    assert_eq!(h.client.restore_backup("backup_x").await, Ok(false));
}

#[tokio::test]
async fn test_create_backup_correlates_reply() {
    let mut h = harness();
    let mut peer = connect(&mut h, &[]).await;

    let client = h.client.clone();
    let task = tokio::spawn(async move { client.create_backup().await });

    let request = next_message(&mut peer).await;
    assert_eq!(request.msg_type, MessageType::CreateBackup);
    let request_id = request.request_id.expect("backup request carries an id");

    // A reply for some other request is ignored
    peer.send_message(
        &SyncMessage::backup_created(Origin::coordinator("c1"), Some(uuid::Uuid::new_v4()), "backup_other")
            .unwrap(),
    )
    .await
    .unwrap();
    peer.send_message(
        &SyncMessage::backup_created(Origin::coordinator("c1"), Some(request_id), "backup_1").unwrap(),
    )
    .await
    .unwrap();

    assert_eq!(task.await.unwrap(), Ok(Some("backup_1".to_string())));
}

#[tokio::test]
async fn test_create_backup_times_out() {
    let mut h = harness();
    let mut peer = connect(&mut h, &[]).await;

    let client = h.client.clone();
    let task = tokio::spawn(async move { client.create_backup().await });
    let _request = next_message(&mut peer).await;

    assert_eq!(task.await.unwrap(), Err(SyncError::BackupTimeout));
}

#[tokio::test]
async fn test_create_backup_error_reply() {
    let mut h = harness();
    let mut peer = connect(&mut h, &[]).await;

    let client = h.client.clone();
    let task = tokio::spawn(async move { client.create_backup().await });
    let request = next_message(&mut peer).await;
    peer.send_message(
        &SyncMessage::error(
            MessageType::BackupError,
            Origin::coordinator("c1"),
            request.request_id,
            "disk full",
        )
        .unwrap(),
    )
    .await
    .unwrap();

    assert_eq!(
        task.await.unwrap(),
        Err(SyncError::Backup("disk full".to_string()))
    );
}

#[tokio::test]
async fn test_restore_success_requests_fresh_state() {
    let mut h = harness();
    let mut peer = connect(&mut h, &[]).await;

    let client = h.client.clone();
    let task = tokio::spawn(async move { client.restore_backup("backup_1").await });

    let request = next_message(&mut peer).await;
    assert_eq!(request.msg_type, MessageType::RestoreBackup);
    let body: RestoreRequest = request.body().unwrap();
    assert_eq!(body.backup_id, "backup_1");
    peer.send_message(
        &SyncMessage::backup_restored(Origin::coordinator("c1"), request.request_id, "backup_1", true)
            .unwrap(),
    )
    .await
    .unwrap();

    assert_eq!(task.await.unwrap(), Ok(true));
    let follow_up = next_message(&mut peer).await;
    assert_eq!(follow_up.msg_type, MessageType::RequestSync);
}

#[tokio::test]
async fn test_restore_failure_and_timeout() {
    let mut h = harness();
    let mut peer = connect(&mut h, &[]).await;

    let client = h.client.clone();
    let task = tokio::spawn(async move { client.restore_backup("backup_missing").await });
    let request = next_message(&mut peer).await;
    peer.send_message(
        &SyncMessage::backup_restored(
            Origin::coordinator("c1"),
            request.request_id,
            "backup_missing",
            false,
        )
        .unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(task.await.unwrap(), Ok(false));

    let client = h.client.clone();
    let task = tokio::spawn(async move { client.restore_backup("backup_slow").await });
    let _request = next_message(&mut peer).await;
    assert_eq!(task.await.unwrap(), Err(SyncError::RestoreTimeout));
}

#[tokio::test]
async fn test_pending_backup_resolves_when_connection_drops() {
    let mut h = harness();
    let mut peer = connect(&mut h, &[]).await;

    let client = h.client.clone();
    let task = tokio::spawn(async move { client.create_backup().await });
    let _request = next_message(&mut peer).await;
    peer.fail("connection reset").await;

    assert_eq!(task.await.unwrap(), Ok(None));
}

#[tokio::test]
async fn test_error_payload_shape() {
    let msg = SyncMessage::error(MessageType::SyncError, Origin::coordinator("c1"), None, "boom")
        .unwrap();
    let body: ErrorPayload = msg.body().unwrap();
    assert_eq!(body.message, "boom");
}
