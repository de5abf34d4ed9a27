//! Connection kernel behaviour against a scripted MQTT 3.1.1 peer on loopback.
//!
//! The peer speaks just enough of the protocol to drive the handshake:
//! CONNECT/CONNACK, SUBSCRIBE/SUBACK under test control, PINGREQ and
//! outbound QoS 0 PUBLISH.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use mqtt_transport::{
    ConnectionState, HandlerResult, InboundMessage, MessageHandler, MqttTransport, Qos, Transport,
    TransportConfig, TransportError,
};

const CONNECT: u8 = 0x10;
const SUBSCRIBE: u8 = 0x80;
const PINGREQ: u8 = 0xC0;
const STEP: Duration = Duration::from_secs(5);

struct ScriptedPeer {
    stream: TcpStream,
}

impl ScriptedPeer {
    /// Accept one client and answer its CONNECT with `return_code`.
    async fn accept_with(listener: &TcpListener, return_code: u8) -> Self {
        let (stream, _) = timeout(STEP, listener.accept())
            .await
            .expect("client should connect")
            .unwrap();
        let mut peer = Self { stream };

        let (header, _) = peer.read_packet().await;
        assert_eq!(header & 0xF0, CONNECT);
        peer.write(&[0x20, 0x02, 0x00, return_code]).await;
        peer
    }

    async fn accept(listener: &TcpListener) -> Self {
        Self::accept_with(listener, 0x00).await
    }

    async fn read_packet(&mut self) -> (u8, Vec<u8>) {
        loop {
            let header = timeout(STEP, self.stream.read_u8())
                .await
                .expect("client should send a packet")
                .unwrap();

            let mut length = 0usize;
            let mut shift = 0;
            loop {
                let byte = self.stream.read_u8().await.unwrap();
                length |= usize::from(byte & 0x7F) << shift;
                if byte & 0x80 == 0 {
                    break;
                }
                shift += 7;
            }

            let mut body = vec![0; length];
            self.stream.read_exact(&mut body).await.unwrap();

            if header & 0xF0 == PINGREQ {
                self.write(&[0xD0, 0x00]).await;
                continue;
            }
            return (header, body);
        }
    }

    /// Next SUBSCRIBE as (packet id, filter).
    async fn expect_subscribe(&mut self) -> (u16, String) {
        let (header, body) = self.read_packet().await;
        assert_eq!(header & 0xF0, SUBSCRIBE, "expected SUBSCRIBE, got {header:#04x}");

        let pkid = u16::from_be_bytes([body[0], body[1]]);
        let len = usize::from(u16::from_be_bytes([body[2], body[3]]));
        let filter = String::from_utf8(body[4..4 + len].to_vec()).unwrap();
        (pkid, filter)
    }

    async fn suback(&mut self, pkid: u16) {
        let [hi, lo] = pkid.to_be_bytes();
        self.write(&[0x90, 0x03, hi, lo, 0x01]).await;
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) {
        let topic_len = u16::try_from(topic.len()).unwrap().to_be_bytes();
        let mut packet = vec![0x30, u8::try_from(2 + topic.len() + payload.len()).unwrap()];
        packet.extend_from_slice(&topic_len);
        packet.extend_from_slice(topic.as_bytes());
        packet.extend_from_slice(payload);
        self.write(&packet).await;
    }

    async fn write(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }
}

fn noop() -> Arc<dyn MessageHandler> {
    Arc::new(|_: &InboundMessage| -> HandlerResult { Ok(()) })
}

async fn connect_to(listener: &TcpListener) -> (MqttTransport, ScriptedPeer) {
    let port = listener.local_addr().unwrap().port();
    let config = TransportConfig::new("127.0.0.1", port)
        .with_client_id("locker-kernel-test")
        .with_connect_timeout(STEP)
        .with_reconnect(Duration::from_millis(50), Duration::from_millis(200), None);

    let (transport, peer) = tokio::join!(MqttTransport::connect(config), ScriptedPeer::accept(listener));
    (transport.unwrap(), peer)
}

#[tokio::test]
async fn test_connected_is_reported_before_connect_returns() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let (transport, mut peer) = connect_to(&listener).await;
    assert_eq!(transport.current_state(), ConnectionState::Connected);

    // Subscribing straight after connect reaches the broker.
    transport
        .subscribe("device/+/status", Qos::AtLeastOnce, noop())
        .await
        .unwrap();
    let (pkid, filter) = peer.expect_subscribe().await;
    assert_eq!(filter, "device/+/status");
    peer.suback(pkid).await;

    transport.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_waits_for_every_suback() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let (transport, mut peer) = connect_to(&listener).await;
    let mut state = transport.state();

    for filter in ["device/+/status", "device/+/heartbeat"] {
        transport.subscribe(filter, Qos::AtLeastOnce, noop()).await.unwrap();
        let (pkid, sent) = peer.expect_subscribe().await;
        assert_eq!(sent, filter);
        peer.suback(pkid).await;
    }

    drop(peer);
    timeout(
        STEP,
        state.wait_for(|s| matches!(s, ConnectionState::Reconnecting { .. })),
    )
    .await
    .expect("lost connection should back off")
    .unwrap();

    let mut peer = ScriptedPeer::accept(&listener).await;
    let first = peer.expect_subscribe().await;
    let second = peer.expect_subscribe().await;
    let mut resent = vec![first.1.clone(), second.1.clone()];
    resent.sort();
    assert_eq!(resent, vec!["device/+/heartbeat", "device/+/status"]);
    assert_eq!(*state.borrow(), ConnectionState::Connecting);

    // Registered after the re-subscribe snapshot, still part of the handshake.
    transport
        .subscribe("device/+/alert", Qos::AtLeastOnce, noop())
        .await
        .unwrap();
    let late = peer.expect_subscribe().await;
    assert_eq!(late.1, "device/+/alert");

    peer.suback(first.0).await;
    peer.suback(second.0).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*state.borrow(), ConnectionState::Connecting);

    peer.suback(late.0).await;
    timeout(STEP, state.wait_for(|s| s.is_connected()))
        .await
        .expect("all SUBACKs received")
        .unwrap();

    transport.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_inbound_publish_reaches_handler() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (transport, mut peer) = connect_to(&listener).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    transport
        .subscribe(
            "device/+/status",
            Qos::AtLeastOnce,
            Arc::new(move |msg: &InboundMessage| -> HandlerResult {
                let _ = tx.send((msg.topic.clone(), msg.payload.to_vec()));
                Ok(())
            }),
        )
        .await
        .unwrap();
    let (pkid, _) = peer.expect_subscribe().await;
    peer.suback(pkid).await;

    peer.publish("device/CAB001/status", br#"{"lockState":"locked"}"#).await;

    let (topic, payload) = timeout(STEP, rx.recv()).await.unwrap().unwrap();
    assert_eq!(topic, "device/CAB001/status");
    assert_eq!(payload, br#"{"lockState":"locked"}"#.to_vec());

    transport.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_refused_connect_fails_fast() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = TransportConfig::new("127.0.0.1", port)
        .with_credentials("backend", "wrong")
        .with_connect_timeout(STEP);

    // 0x04: bad user name or password
    let (result, _peer) = tokio::join!(
        MqttTransport::connect(config),
        ScriptedPeer::accept_with(&listener, 0x04)
    );
    assert!(matches!(result, Err(TransportError::Connection(_))));
}
