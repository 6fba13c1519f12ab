//! MQTT Client Integration Tests
//!
//! Drives `MqttConnector` against a scripted broker that speaks the wire
//! protocol through the crate's own codec.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use vibegate::broker::{
    Backoff, BrokerAddress, BrokerConnection, BrokerError, BrokerEvent, ClientOptions, Connector,
    EventStream, InboundMessage, MqttConnector, MqttSettings, PublishOptions,
    SUBSCRIPTION_REFUSED,
};
use vibegate::codec::{Decoder, Encoder};
use vibegate::protocol::{ConnAck, ConnectReturnCode, Packet, Publish, QoS, SubAck};

const WAIT: Duration = Duration::from_secs(5);

/// One accepted client connection on the scripted broker
struct Peer {
    stream: TcpStream,
    decoder: Decoder,
    buf: BytesMut,
}

impl Peer {
    async fn accept(listener: &TcpListener) -> Peer {
        let (stream, _) = timeout(WAIT, listener.accept())
            .await
            .expect("timeout waiting for client")
            .unwrap();
        Peer {
            stream,
            decoder: Decoder::new(),
            buf: BytesMut::with_capacity(1024),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let mut out = BytesMut::new();
        Encoder::new().encode(packet, &mut out).unwrap();
        self.stream.write_all(&out).await.unwrap();
    }

    /// Write a packet one byte at a time
    async fn send_fragmented(&mut self, packet: &Packet) {
        let mut out = BytesMut::new();
        Encoder::new().encode(packet, &mut out).unwrap();
        for byte in out.iter() {
            self.stream.write_all(&[*byte]).await.unwrap();
            self.stream.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    async fn recv(&mut self) -> Option<Packet> {
        loop {
            if let Some((packet, used)) = self.decoder.decode(&self.buf).unwrap() {
                self.buf.advance(used);
                return Some(packet);
            }
            let n = timeout(WAIT, self.stream.read_buf(&mut self.buf))
                .await
                .expect("timeout waiting for packet")
                .unwrap();
            if n == 0 {
                return None;
            }
        }
    }

    async fn accept_connect(&mut self) -> vibegate::protocol::Connect {
        let connect = match self.recv().await {
            Some(Packet::Connect(connect)) => *connect,
            other => panic!("expected CONNECT, got {:?}", other),
        };
        self.send(&Packet::ConnAck(ConnAck {
            session_present: false,
            return_code: ConnectReturnCode::Accepted,
        }))
        .await;
        connect
    }
}

async fn listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn connector(addr: SocketAddr) -> MqttConnector {
    let address = BrokerAddress::parse(&format!("mqtt://user:pass@{}", addr)).unwrap();
    let mut settings = MqttSettings::new(address);
    settings.keep_alive = 30;
    settings.connect_timeout = Duration::from_secs(2);
    MqttConnector::new(settings)
}

async fn next_event(events: &mut EventStream) -> Option<BrokerEvent> {
    timeout(WAIT, events.recv()).await.expect("timeout waiting for event")
}

#[tokio::test]
async fn test_handshake_subscribe_and_deliver() {
    let (listener, addr) = listener().await;
    let (conn, mut events) = connector(addr).connect(ClientOptions::new(Some("gw-test")));

    let mut peer = Peer::accept(&listener).await;
    let connect = peer.accept_connect().await;
    assert_eq!(connect.client_id, "gw-test");
    assert!(connect.clean_session);
    assert_eq!(connect.keep_alive, 30);
    assert_eq!(connect.username.as_deref(), Some("user"));
    assert_eq!(connect.password, Some(Bytes::from_static(b"pass")));

    assert_eq!(next_event(&mut events).await, Some(BrokerEvent::Connected));
    assert!(conn.is_connected());

    let subscribing = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.subscribe("sensors/+", QoS::AtLeastOnce).await })
    };
    let subscribe = match peer.recv().await {
        Some(Packet::Subscribe(subscribe)) => subscribe,
        other => panic!("expected SUBSCRIBE, got {:?}", other),
    };
    assert_eq!(
        subscribe.filters,
        vec![("sensors/+".to_string(), QoS::AtLeastOnce)]
    );
    peer.send(&Packet::SubAck(SubAck {
        packet_id: subscribe.packet_id,
        return_codes: vec![Some(QoS::AtLeastOnce)],
    }))
    .await;
    timeout(WAIT, subscribing)
        .await
        .expect("subscribe not acknowledged")
        .unwrap()
        .unwrap();

    peer.send(&Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtLeastOnce,
        retain: false,
        topic: "sensors/t1".to_string(),
        packet_id: Some(7),
        payload: Bytes::from_static(b"21.5"),
    }))
    .await;

    assert_eq!(
        next_event(&mut events).await,
        Some(BrokerEvent::Message(InboundMessage {
            topic: "sensors/t1".to_string(),
            payload: Bytes::from_static(b"21.5"),
            qos: QoS::AtLeastOnce,
            retain: false,
        }))
    );
    assert_eq!(peer.recv().await, Some(Packet::PubAck(7)));

    conn.end();
    assert_eq!(peer.recv().await, Some(Packet::Disconnect));
    assert_eq!(peer.recv().await, None);
    assert_eq!(next_event(&mut events).await, None);
}

#[tokio::test]
async fn test_publish_reaches_broker() {
    let (listener, addr) = listener().await;
    let (conn, mut events) = connector(addr).connect(ClientOptions::new(None));

    let mut peer = Peer::accept(&listener).await;
    let connect = peer.accept_connect().await;
    assert!(connect.client_id.starts_with("vibegate_"));
    assert_eq!(next_event(&mut events).await, Some(BrokerEvent::Connected));

    conn.publish(
        "a/b",
        Bytes::from_static(b"hi"),
        PublishOptions::new(QoS::AtMostOnce, true),
    )
    .await
    .unwrap();
    match peer.recv().await {
        Some(Packet::Publish(publish)) => {
            assert_eq!(publish.topic, "a/b");
            assert_eq!(publish.payload, Bytes::from_static(b"hi"));
            assert!(publish.retain);
            assert_eq!(publish.packet_id, None);
        }
        other => panic!("expected PUBLISH, got {:?}", other),
    }

    // Outbound QoS 2 flow
    conn.publish(
        "a/b",
        Bytes::from_static(b"once"),
        PublishOptions::new(QoS::ExactlyOnce, false),
    )
    .await
    .unwrap();
    let packet_id = match peer.recv().await {
        Some(Packet::Publish(publish)) => publish.packet_id.unwrap(),
        other => panic!("expected PUBLISH, got {:?}", other),
    };
    peer.send(&Packet::PubRec(packet_id)).await;
    assert_eq!(peer.recv().await, Some(Packet::PubRel(packet_id)));
    peer.send(&Packet::PubComp(packet_id)).await;

    conn.end();
}

#[tokio::test]
async fn test_inbound_qos2_and_fragmented_frames() {
    let (listener, addr) = listener().await;
    let (conn, mut events) = connector(addr).connect(ClientOptions::new(Some("frag")));

    let mut peer = Peer::accept(&listener).await;
    peer.accept_connect().await;
    assert_eq!(next_event(&mut events).await, Some(BrokerEvent::Connected));

    peer.send_fragmented(&Packet::Publish(Publish {
        dup: false,
        qos: QoS::ExactlyOnce,
        retain: false,
        topic: "x".to_string(),
        packet_id: Some(9),
        payload: Bytes::from_static(b"split across many reads"),
    }))
    .await;

    match next_event(&mut events).await {
        Some(BrokerEvent::Message(message)) => {
            assert_eq!(message.payload, Bytes::from_static(b"split across many reads"));
        }
        other => panic!("expected message, got {:?}", other),
    }
    assert_eq!(peer.recv().await, Some(Packet::PubRec(9)));
    peer.send(&Packet::PubRel(9)).await;
    assert_eq!(peer.recv().await, Some(Packet::PubComp(9)));

    conn.end();
}

#[tokio::test]
async fn test_refused_connack_surfaces_error() {
    let (listener, addr) = listener().await;
    let (conn, mut events) = connector(addr).connect(ClientOptions::new(Some("refused")));

    let mut peer = Peer::accept(&listener).await;
    assert!(matches!(peer.recv().await, Some(Packet::Connect(_))));
    peer.send(&Packet::ConnAck(ConnAck {
        session_present: false,
        return_code: ConnectReturnCode::NotAuthorized,
    }))
    .await;

    assert_eq!(
        next_event(&mut events).await,
        Some(BrokerEvent::Error(BrokerError::Rejected(
            "not authorized".to_string()
        )))
    );
    // Without a reconnect policy the connection is done
    assert_eq!(next_event(&mut events).await, None);
    assert!(!conn.is_connected());
}

#[tokio::test]
async fn test_unreachable_broker() {
    let (listener, addr) = listener().await;
    drop(listener);

    let (_conn, mut events) = connector(addr).connect(ClientOptions::new(None));
    match next_event(&mut events).await {
        Some(BrokerEvent::Error(BrokerError::ConnectionLost(_))) => {}
        Some(BrokerEvent::Error(BrokerError::Timeout)) => {}
        other => panic!("expected connection error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_reconnects_after_connection_loss() {
    let (listener, addr) = listener().await;
    let options = ClientOptions::new(Some("shared")).with_reconnect(Backoff {
        initial: Duration::from_millis(20),
        max: Duration::from_millis(100),
    });
    let connector: Arc<dyn Connector> = Arc::new(connector(addr));
    let (conn, mut events) = connector.connect(options);

    let mut peer = Peer::accept(&listener).await;
    peer.accept_connect().await;
    assert_eq!(next_event(&mut events).await, Some(BrokerEvent::Connected));

    drop(peer);
    assert!(matches!(
        next_event(&mut events).await,
        Some(BrokerEvent::Error(BrokerError::ConnectionLost(_)))
    ));

    let mut peer = Peer::accept(&listener).await;
    let connect = peer.accept_connect().await;
    assert_eq!(connect.client_id, "shared");
    assert_eq!(next_event(&mut events).await, Some(BrokerEvent::Connected));

    conn.end();
    assert_eq!(peer.recv().await, Some(Packet::Disconnect));
}

#[tokio::test]
async fn test_refused_suback_fails_subscribe() {
    let (listener, addr) = listener().await;
    let (conn, mut events) = connector(addr).connect(ClientOptions::new(Some("acl")));

    let mut peer = Peer::accept(&listener).await;
    peer.accept_connect().await;
    assert_eq!(next_event(&mut events).await, Some(BrokerEvent::Connected));

    let subscribing = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.subscribe("secret/#", QoS::AtMostOnce).await })
    };
    let packet_id = match peer.recv().await {
        Some(Packet::Subscribe(subscribe)) => subscribe.packet_id,
        other => panic!("expected SUBSCRIBE, got {:?}", other),
    };
    peer.send(&Packet::SubAck(SubAck {
        packet_id,
        return_codes: vec![None],
    }))
    .await;

    let result = timeout(WAIT, subscribing).await.unwrap().unwrap();
    assert_eq!(
        result,
        Err(BrokerError::Rejected(SUBSCRIPTION_REFUSED.to_string()))
    );
    // The connection itself stays up
    assert!(conn.is_connected());
    conn.end();
}

#[tokio::test]
async fn test_unsubscribe_waits_for_unsuback() {
    let (listener, addr) = listener().await;
    let (conn, mut events) = connector(addr).connect(ClientOptions::new(Some("unsub")));

    let mut peer = Peer::accept(&listener).await;
    peer.accept_connect().await;
    assert_eq!(next_event(&mut events).await, Some(BrokerEvent::Connected));

    let unsubscribing = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.unsubscribe("sensors/+").await })
    };
    let unsubscribe = match peer.recv().await {
        Some(Packet::Unsubscribe(unsubscribe)) => unsubscribe,
        other => panic!("expected UNSUBSCRIBE, got {:?}", other),
    };
    assert_eq!(unsubscribe.filters, vec!["sensors/+".to_string()]);
    assert!(!unsubscribing.is_finished());

    peer.send(&Packet::UnsubAck(unsubscribe.packet_id)).await;
    assert_eq!(timeout(WAIT, unsubscribing).await.unwrap().unwrap(), Ok(()));
    conn.end();
}

#[tokio::test]
async fn test_invalid_topic_never_reaches_the_wire() {
    let (listener, addr) = listener().await;
    let (conn, mut events) = connector(addr).connect(ClientOptions::new(Some("shared")));

    let mut peer = Peer::accept(&listener).await;
    peer.accept_connect().await;
    assert_eq!(next_event(&mut events).await, Some(BrokerEvent::Connected));

    for topic in ["", "a/+", "a/#"] {
        let result = conn
            .publish(topic, Bytes::from_static(b"x"), PublishOptions::default())
            .await;
        assert!(
            matches!(result, Err(BrokerError::InvalidTopic(_))),
            "{:?}: {:?}",
            topic,
            result
        );
    }
    assert!(matches!(
        conn.subscribe("a/#/b", QoS::AtMostOnce).await,
        Err(BrokerError::InvalidTopic(_))
    ));

    conn.publish("a/b", Bytes::from_static(b"ok"), PublishOptions::default())
        .await
        .unwrap();
    match peer.recv().await {
        Some(Packet::Publish(publish)) => assert_eq!(publish.topic, "a/b"),
        other => panic!("expected PUBLISH, got {:?}", other),
    }
    assert!(conn.is_connected());
    conn.end();
}
