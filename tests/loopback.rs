//! Full stack against the bundled echo server: HTTP signaling, a real str0m
//! peer on each side and the control channel in between.

use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc;

use rover_session::{
    loopback, ConnectionStatus, ControlEvent, EventBus, HttpSignaling, RecoveryConfig,
    RtcTransport, SessionManager, SignalingConfig, SilenceDevice, TransportConfig,
};

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Starts the echo server and waits for it to accept connections. `None`
/// when the host has no interface to put media on.
fn start_server() -> Option<u16> {
    let port = free_port();
    let server = thread::spawn(move || loopback::serve(port));

    for _ in 0..100 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return Some(port);
        }
        if server.is_finished() {
            let result = server.join().unwrap();
            eprintln!("echo server did not start: {result:?}");
            return None;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("echo server never started listening on {port}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_is_echoed_over_the_control_channel() {
    let Some(port) = start_server() else {
        return;
    };

    let signaling = HttpSignaling::new(&SignalingConfig {
        url: format!("http://127.0.0.1:{port}/session"),
        timeout_ms: 5_000,
        bearer_token: None,
    });
    let transport = RtcTransport::new(TransportConfig {
        ice_servers: vec![],
        ..TransportConfig::default()
    });
    let session = SessionManager::spawn(
        RecoveryConfig::default(),
        transport,
        signaling,
        SilenceDevice,
        EventBus::new(),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = session.subscribe(move |event| {
        let _ = tx.send(event.clone());
    });

    session.connect().await.unwrap();
    let snapshot = tokio::time::timeout(
        Duration::from_secs(20),
        session.wait_for(|s| s.status != ConnectionStatus::Connecting),
    )
    .await
    .expect("session did not settle")
    .unwrap();
    assert_eq!(snapshot.status, ConnectionStatus::Connected, "{snapshot:?}");

    // The channel can report open on our side slightly before the far end
    // is ready to answer, so keep asking until an echo comes back.
    let ping = ControlEvent::new("ping").with("n", 1);
    let echo = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            session.send_event(ping.clone());
            match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Some(event)) if event.kind == "echo" => return event,
                Ok(Some(_)) | Err(_) => continue,
                Ok(None) => panic!("listener dropped"),
            }
        }
    })
    .await
    .expect("no echo received");

    let original = echo.get("event").expect("echo carries the event");
    assert_eq!(original["type"], "ping");
    assert_eq!(original["n"], 1);
    assert!(echo.get("received_at").and_then(|v| v.as_str()).is_some());

    assert!(subscription.unsubscribe());
    session.shutdown().await;
}
