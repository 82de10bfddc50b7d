//! End-to-end properties of the queue daemon's IPC server driven over real
//! Unix sockets: at most one connection plays at a time, a mid-play
//! disconnect advances the queue, and a speaker change honors the
//! configured minimum gap between plays.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use voxd::config::VqdConfig;
use voxd::ipc::protocol::write_line;
use voxd::ipc::{ClientMessage, DaemonMessage, Server};
use voxd::queue::EnqueueRequest;

static SOCKET_COUNTER: AtomicU64 = AtomicU64::new(0);

fn unique_socket_path() -> PathBuf {
    let n = SOCKET_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("voxd-test-{}-{}.sock", std::process::id(), n))
}

fn enqueue_req(text: &str, priority: i32, agent_id: Option<&str>) -> EnqueueRequest {
    EnqueueRequest {
        text: text.to_string(),
        priority,
        voice_config: serde_json::Value::Null,
        session_id: None,
        agent_id: agent_id.map(str::to_string),
        timeout: None,
    }
}

async fn spawn_server(mut config: VqdConfig) -> (PathBuf, mpsc::Sender<()>) {
    let socket_path = unique_socket_path();
    config.socket_path = socket_path.clone();
    let listener = Server::bind(&socket_path).await.expect("bind socket");
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let server = Server::new(config);
    let run_path = socket_path.clone();
    tokio::spawn(async move {
        server.run(listener, run_path, shutdown_rx).await;
    });
    (socket_path, shutdown_tx)
}

async fn connect(socket_path: &PathBuf) -> (OwnedReadHalf, OwnedWriteHalf) {
    // The listener may not have been polled into existence yet on a slow
    // CI box; a short retry loop is cheaper than a fixed sleep.
    for _ in 0..50 {
        if let Ok(stream) = UnixStream::connect(socket_path).await {
            return stream.into_split();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("could not connect to {socket_path:?}");
}

async fn send(write_half: &mut OwnedWriteHalf, msg: &ClientMessage) {
    write_line(write_half, msg).await.expect("write client message");
}

async fn recv(lines: &mut tokio::io::Lines<BufReader<OwnedReadHalf>>) -> DaemonMessage {
    let line = lines
        .next_line()
        .await
        .expect("read daemon line")
        .expect("daemon closed the connection");
    serde_json::from_str(&line).expect("parse daemon message")
}

/// Across any interleaving of enqueue/complete, at most one connection ever
/// holds `play_now` at a time.
#[tokio::test]
async fn at_most_one_item_plays_at_a_time() {
    let (socket_path, shutdown_tx) = spawn_server(VqdConfig::default()).await;

    let (r1, mut w1) = connect(&socket_path).await;
    let mut lines1 = BufReader::new(r1).lines();
    let (r2, mut w2) = connect(&socket_path).await;
    let mut lines2 = BufReader::new(r2).lines();

    send(&mut w1, &ClientMessage::Enqueue { payload: enqueue_req("from conn1", 50, None), request_id: None }).await;
    assert!(matches!(recv(&mut lines1).await, DaemonMessage::Queued { .. }));

    send(&mut w2, &ClientMessage::Enqueue { payload: enqueue_req("from conn2", 50, None), request_id: None }).await;
    assert!(matches!(recv(&mut lines2).await, DaemonMessage::Queued { .. }));

    let id1 = match recv(&mut lines1).await {
        DaemonMessage::PlayNow { id, item } => {
            assert_eq!(item.text, "from conn1");
            id
        }
        other => panic!("expected play_now on conn1, got {other:?}"),
    };

    // conn2 must stay silent while conn1 is playing.
    let premature = tokio::time::timeout(Duration::from_millis(200), lines2.next_line()).await;
    assert!(premature.is_err(), "conn2 received a message while conn1 was still playing");

    send(&mut w1, &ClientMessage::PlaybackComplete { id: id1, duration_ms: 10 }).await;

    match recv(&mut lines2).await {
        DaemonMessage::PlayNow { item, .. } => assert_eq!(item.text, "from conn2"),
        other => panic!("expected play_now on conn2, got {other:?}"),
    }

    let _ = shutdown_tx.send(()).await;
}

/// A connection dropping mid-play is treated as a playback failure and the
/// queue advances to the next waiting connection.
#[tokio::test]
async fn disconnect_marks_failed_and_advances_queue() {
    let (socket_path, shutdown_tx) = spawn_server(VqdConfig::default()).await;

    let (r1, mut w1) = connect(&socket_path).await;
    let mut lines1 = BufReader::new(r1).lines();
    send(&mut w1, &ClientMessage::Enqueue { payload: enqueue_req("first", 50, None), request_id: None }).await;
    assert!(matches!(recv(&mut lines1).await, DaemonMessage::Queued { .. }));
    assert!(matches!(recv(&mut lines1).await, DaemonMessage::PlayNow { .. }));

    let (r2, mut w2) = connect(&socket_path).await;
    let mut lines2 = BufReader::new(r2).lines();
    send(&mut w2, &ClientMessage::Enqueue { payload: enqueue_req("second", 50, None), request_id: None }).await;
    assert!(matches!(recv(&mut lines2).await, DaemonMessage::Queued { .. }));

    // conn1 vanishes without ever reporting completion.
    drop(w1);
    drop(lines1);

    let advanced = tokio::time::timeout(Duration::from_secs(2), recv(&mut lines2))
        .await
        .expect("queue should advance once the disconnect is observed");
    match advanced {
        DaemonMessage::PlayNow { item, .. } => assert_eq!(item.text, "second"),
        other => panic!("expected play_now on conn2, got {other:?}"),
    }

    let _ = shutdown_tx.send(()).await;
}

/// A speaker change enforces the configured minimum gap between two
/// `play_now` sends.
#[tokio::test]
async fn speaker_transition_enforces_minimum_gap() {
    let mut config = VqdConfig::default();
    config.speaker_transition_ms = 300;
    let (socket_path, shutdown_tx) = spawn_server(config).await;

    let (r1, mut w1) = connect(&socket_path).await;
    let mut lines1 = BufReader::new(r1).lines();

    send(
        &mut w1,
        &ClientMessage::Enqueue { payload: enqueue_req("agent a's turn", 50, Some("agent-a")), request_id: None },
    )
    .await;
    assert!(matches!(recv(&mut lines1).await, DaemonMessage::Queued { .. }));
    let id1 = match recv(&mut lines1).await {
        DaemonMessage::PlayNow { id, .. } => id,
        other => panic!("expected play_now, got {other:?}"),
    };

    send(&mut w1, &ClientMessage::PlaybackComplete { id: id1, duration_ms: 5 }).await;
    send(
        &mut w1,
        &ClientMessage::Enqueue { payload: enqueue_req("agent b's turn", 50, Some("agent-b")), request_id: None },
    )
    .await;
    assert!(matches!(recv(&mut lines1).await, DaemonMessage::Queued { .. }));

    let started = std::time::Instant::now();
    let second_play = recv(&mut lines1).await;
    let elapsed = started.elapsed();

    assert!(matches!(second_play, DaemonMessage::PlayNow { .. }));
    assert!(
        elapsed >= Duration::from_millis(280),
        "expected at least the configured speaker-transition gap, got {elapsed:?}"
    );

    let _ = shutdown_tx.send(()).await;
}
