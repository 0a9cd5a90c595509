//! Relay behavior over real WebSocket connections.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tessera_common::{Certificate, ClientFrame, RelayFrame};
use tessera_relay::{serve, RelayConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, RelayConfig::default()));
    format!("ws://{addr}/")
}

async fn connect(url: &str) -> Ws {
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, frame: &ClientFrame) {
    let json = serde_json::to_string(frame).unwrap();
    ws.send(Message::Text(json.into())).await.unwrap();
}

async fn recv(ws: &mut Ws) -> RelayFrame {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for relay")
            .expect("relay closed the connection")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Skip frames (typically presence broadcasts) until one matches.
async fn recv_until(ws: &mut Ws, pred: impl Fn(&RelayFrame) -> bool) -> RelayFrame {
    loop {
        let frame = recv(ws).await;
        if pred(&frame) {
            return frame;
        }
    }
}

fn is_error(frame: &RelayFrame) -> bool {
    matches!(frame, RelayFrame::Error { .. })
}

async fn register(ws: &mut Ws, id: &str) {
    send(
        ws,
        &ClientFrame::Register {
            id: id.into(),
            public_key: format!("KEY-{id}"),
        },
    )
    .await;
    recv_until(ws, |frame| match frame {
        RelayFrame::UserList { users } => users.iter().any(|u| u.id == id),
        _ => false,
    })
    .await;
}

#[tokio::test]
async fn test_direct_is_forwarded_untouched() {
    let url = start_relay().await;
    let mut alice = connect(&url).await;
    let mut bob = connect(&url).await;
    register(&mut alice, "alice").await;
    register(&mut bob, "bob").await;

    let payload = json!({"type": "key_exchange", "encryptedKey": "b3BhcXVl", "extra": [1, 2]});
    send(
        &mut alice,
        &ClientFrame::Direct {
            target_id: "bob".into(),
            payload: payload.clone(),
        },
    )
    .await;

    let frame = recv_until(&mut bob, |f| matches!(f, RelayFrame::Direct { .. })).await;
    assert_eq!(
        frame,
        RelayFrame::Direct {
            sender_id: "alice".into(),
            payload,
        }
    );
}

#[tokio::test]
async fn test_list_reports_public_keys() {
    let url = start_relay().await;
    let mut alice = connect(&url).await;
    let mut bob = connect(&url).await;
    register(&mut alice, "alice").await;
    register(&mut bob, "bob").await;

    send(&mut alice, &ClientFrame::List).await;
    let frame = recv_until(&mut alice, |f| match f {
        RelayFrame::UserList { users } => users.len() == 2,
        _ => false,
    })
    .await;
    let RelayFrame::UserList { users } = frame else {
        unreachable!()
    };
    assert_eq!(users[0].id, "alice");
    assert_eq!(users[1].public_key.as_deref(), Some("KEY-bob"));
}

#[tokio::test]
async fn test_unknown_target_and_unregistered_sender() {
    let url = start_relay().await;
    let mut anonymous = connect(&url).await;
    send(
        &mut anonymous,
        &ClientFrame::Direct {
            target_id: "bob".into(),
            payload: json!({}),
        },
    )
    .await;
    assert_eq!(
        recv(&mut anonymous).await,
        RelayFrame::error("Register before sending")
    );

    let mut alice = connect(&url).await;
    register(&mut alice, "alice").await;
    send(
        &mut alice,
        &ClientFrame::Direct {
            target_id: "carol".into(),
            payload: json!({}),
        },
    )
    .await;
    assert_eq!(
        recv_until(&mut alice, is_error).await,
        RelayFrame::unknown_target("carol", "User carol not found")
    );
}

#[tokio::test]
async fn test_malformed_frames_get_error_and_connection_survives() {
    let url = start_relay().await;
    let mut ws = connect(&url).await;

    ws.send(Message::Text("not json".to_string().into())).await.unwrap();
    assert!(is_error(&recv(&mut ws).await));

    ws.send(Message::Text(r#"{"type":"teleport"}"#.to_string().into()))
        .await
        .unwrap();
    assert!(is_error(&recv(&mut ws).await));

    send(&mut ws, &ClientFrame::List).await;
    assert!(matches!(recv(&mut ws).await, RelayFrame::UserList { .. }));
}

#[tokio::test]
async fn test_certificates_are_served_on_request() {
    let url = start_relay().await;
    let certificate = Certificate {
        user_id: "alice".into(),
        public_key: "-----BEGIN PUBLIC KEY-----".into(),
        issuer: "Tessera Trust Authority".into(),
        signature: "c2lnbmF0dXJl".into(),
    };

    let mut alice = connect(&url).await;
    send(
        &mut alice,
        &ClientFrame::RegisterWithCert {
            certificate: certificate.clone(),
        },
    )
    .await;
    let frame = recv(&mut alice).await;
    let RelayFrame::UserList { users } = frame else {
        panic!("expected user list, got {frame:?}")
    };
    assert!(users[0].has_cert);
    assert_eq!(users[0].public_key, None);

    let mut bob = connect(&url).await;
    register(&mut bob, "bob").await;
    send(
        &mut bob,
        &ClientFrame::GetCert {
            target_id: "alice".into(),
        },
    )
    .await;
    assert_eq!(
        recv_until(&mut bob, |f| matches!(f, RelayFrame::CertResponse { .. })).await,
        RelayFrame::CertResponse {
            target_id: "alice".into(),
            certificate,
        }
    );

    send(
        &mut alice,
        &ClientFrame::GetCert {
            target_id: "bob".into(),
        },
    )
    .await;
    assert!(is_error(&recv_until(&mut alice, is_error).await));
}

#[tokio::test]
async fn test_disconnect_is_broadcast() {
    let url = start_relay().await;
    let mut alice = connect(&url).await;
    let mut bob = connect(&url).await;
    register(&mut alice, "alice").await;
    register(&mut bob, "bob").await;

    bob.close(None).await.unwrap();

    recv_until(&mut alice, |f| match f {
        RelayFrame::UserList { users } => users.iter().all(|u| u.id != "bob"),
        _ => false,
    })
    .await;
}

#[tokio::test]
async fn test_newer_registration_replaces_older() {
    let url = start_relay().await;
    let mut first = connect(&url).await;
    let mut second = connect(&url).await;
    register(&mut first, "alice").await;
    register(&mut second, "alice").await;

    assert_eq!(
        recv_until(&mut first, is_error).await,
        RelayFrame::error("Session replaced by a newer connection")
    );

    // The displaced connection can no longer speak as alice.
    send(
        &mut first,
        &ClientFrame::Direct {
            target_id: "alice".into(),
            payload: json!({}),
        },
    )
    .await;
    assert_eq!(
        recv_until(&mut first, is_error).await,
        RelayFrame::error("Register before sending")
    );
}
