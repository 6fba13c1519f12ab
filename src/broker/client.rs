//! MQTT v3.1.1 Client
//!
//! A small asynchronous MQTT client. Each connection runs in its own task;
//! the [`MqttConnection`] handle talks to that task over a command channel
//! and the task reports back through the connection's [`EventStream`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    check_topic_filter, check_topic_name, BrokerAddress, BrokerConnection, BrokerError,
    BrokerEvent, ClientOptions, ConnectionStatus, Connector, EventStream, InboundMessage,
    PublishOptions, EVENT_CHANNEL_CAPACITY, SUBSCRIPTION_REFUSED,
};
use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    Connect, ConnectReturnCode, Packet, Publish, QoS, Subscribe, Unsubscribe,
};

/// Capacity of the per-connection command channel
const COMMAND_CHANNEL_CAPACITY: usize = 1000;

/// Completes a SUBSCRIBE or UNSUBSCRIBE once the broker answered
type AckSender = oneshot::Sender<Result<(), BrokerError>>;

/// Operations sent to the connection task
#[derive(Debug)]
enum ClientCommand {
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    Subscribe {
        filter: String,
        qos: QoS,
        ack: AckSender,
    },
    Unsubscribe {
        filter: String,
        ack: AckSender,
    },
}

/// Broker-wide settings shared by every connection
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub address: BrokerAddress,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Keep alive in seconds (0 disables PINGREQ)
    pub keep_alive: u16,
    pub connect_timeout: Duration,
    pub max_packet_size: usize,
}

impl MqttSettings {
    pub fn new(address: BrokerAddress) -> Self {
        Self {
            username: address.username.clone(),
            password: address.password.clone(),
            address,
            keep_alive: 60,
            connect_timeout: Duration::from_secs(30),
            max_packet_size: 1024 * 1024,
        }
    }
}

/// Opens MQTT connections over TCP
#[derive(Debug, Clone)]
pub struct MqttConnector {
    settings: Arc<MqttSettings>,
}

impl MqttConnector {
    pub fn new(settings: MqttSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &MqttSettings {
        &self.settings
    }
}

impl Connector for MqttConnector {
    fn connect(&self, options: ClientOptions) -> (Arc<dyn BrokerConnection>, EventStream) {
        let (connection, events) = MqttConnection::spawn(self.settings.clone(), options);
        (connection, events)
    }
}

/// Handle to one MQTT connection task
pub struct MqttConnection {
    client_id: String,
    ack_timeout: Duration,
    status: Arc<RwLock<ConnectionStatus>>,
    command_tx: mpsc::Sender<ClientCommand>,
    shutdown: CancellationToken,
}

impl MqttConnection {
    /// Spawn the connection task and return its handle and events
    pub fn spawn(
        settings: Arc<MqttSettings>,
        options: ClientOptions,
    ) -> (Arc<MqttConnection>, EventStream) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let status = Arc::new(RwLock::new(ConnectionStatus::Connecting));
        let shutdown = CancellationToken::new();

        let connection = Arc::new(MqttConnection {
            client_id: options.client_id.clone(),
            ack_timeout: settings.connect_timeout,
            status: status.clone(),
            command_tx,
            shutdown: shutdown.clone(),
        });

        let task = ConnectionTask {
            settings,
            options,
            status,
            event_tx,
            shutdown,
        };
        tokio::spawn(task.run(command_rx));

        (connection, event_rx)
    }

    fn enqueue(&self, command: ClientCommand) -> Result<(), BrokerError> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        self.command_tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BrokerError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => BrokerError::Closed,
        })
    }

    /// Wait for the broker's answer to a queued SUBSCRIBE or UNSUBSCRIBE
    async fn acknowledged(
        &self,
        acked: oneshot::Receiver<Result<(), BrokerError>>,
    ) -> Result<(), BrokerError> {
        match timeout(self.ack_timeout, acked).await {
            Ok(Ok(result)) => result,
            // The connection task dropped the request with the connection
            Ok(Err(_)) => Err(BrokerError::Closed),
            Err(_) => Err(BrokerError::Timeout),
        }
    }
}

#[async_trait]
impl BrokerConnection for MqttConnection {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        check_topic_name(topic)?;
        self.enqueue(ClientCommand::Publish {
            topic: topic.to_string(),
            payload,
            qos: options.qos,
            retain: options.retain,
        })
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), BrokerError> {
        check_topic_filter(filter)?;
        let (ack, acked) = oneshot::channel();
        self.enqueue(ClientCommand::Subscribe {
            filter: filter.to_string(),
            qos,
            ack,
        })?;
        self.acknowledged(acked).await
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), BrokerError> {
        check_topic_filter(filter)?;
        let (ack, acked) = oneshot::channel();
        self.enqueue(ClientCommand::Unsubscribe {
            filter: filter.to_string(),
            ack,
        })?;
        self.acknowledged(acked).await
    }

    fn end(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("Client '{}': end requested", self.client_id);
            self.shutdown.cancel();
        }
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        // The task would otherwise keep the socket open with nobody listening
        self.shutdown.cancel();
    }
}

/// State owned by the spawned connection task
struct ConnectionTask {
    settings: Arc<MqttSettings>,
    options: ClientOptions,
    status: Arc<RwLock<ConnectionStatus>>,
    event_tx: mpsc::Sender<BrokerEvent>,
    shutdown: CancellationToken,
}

impl ConnectionTask {
    /// Run the connection loop
    async fn run(self, mut command_rx: mpsc::Receiver<ClientCommand>) {
        let client_id = self.options.client_id.clone();
        let mut retry_interval = self.options.reconnect.map(|b| b.initial);

        loop {
            *self.status.write() = ConnectionStatus::Connecting;
            debug!(
                "Client '{}': Connecting to {}",
                client_id, self.settings.address
            );

            match self.connect_and_run(&mut command_rx).await {
                Ok(()) => {
                    debug!("Client '{}': Disconnected gracefully", client_id);
                    *self.status.write() = ConnectionStatus::Ended;
                    return;
                }
                Err(e) => {
                    let was_connected = *self.status.read() == ConnectionStatus::Connected;
                    let _ = self.event_tx.send(BrokerEvent::Error(e.clone())).await;

                    let (backoff, interval) = match (self.options.reconnect, retry_interval) {
                        (Some(backoff), Some(interval)) => (backoff, interval),
                        _ => {
                            debug!("Client '{}': Connection failed: {}", client_id, e);
                            *self.status.write() = ConnectionStatus::Failed;
                            return;
                        }
                    };

                    warn!("Client '{}': Connection failed: {}", client_id, e);
                    *self.status.write() = ConnectionStatus::Backoff;

                    // A connection that made it to CONNACK starts over from the
                    // initial interval
                    let delay = if was_connected { backoff.initial } else { interval };
                    debug!("Client '{}': Reconnecting in {:?}", client_id, delay);

                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            *self.status.write() = ConnectionStatus::Ended;
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    retry_interval = Some(std::cmp::min(delay * 2, backoff.max));
                }
            }
        }
    }

    /// Connect to the broker and run the message loop
    async fn connect_and_run(
        &self,
        command_rx: &mut mpsc::Receiver<ClientCommand>,
    ) -> Result<(), BrokerError> {
        let settings = &self.settings;
        let client_id = &self.options.client_id;

        let stream = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            result = timeout(settings.connect_timeout, TcpStream::connect(settings.address.socket_addr())) => {
                result
                    .map_err(|_| BrokerError::Timeout)?
                    .map_err(|e| BrokerError::ConnectionLost(e.to_string()))?
            }
        };
        let _ = stream.set_nodelay(true);

        debug!("Client '{}': TCP connected", client_id);

        let encoder = Encoder::new();
        let decoder = Decoder::new().with_max_packet_size(settings.max_packet_size);
        let (read_half, write_half) = stream.into_split();
        let mut io = PacketIo {
            read_half,
            write_half,
            encoder,
            decoder,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            saw_traffic: false,
        };

        let connect = Packet::Connect(Box::new(Connect {
            client_id: client_id.clone(),
            clean_session: true,
            keep_alive: settings.keep_alive,
            username: settings.username.clone(),
            password: settings
                .password
                .as_ref()
                .map(|p| Bytes::from(p.clone().into_bytes())),
        }));
        io.send(&connect).await?;

        debug!("Client '{}': CONNECT sent", client_id);

        let connack = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            result = timeout(settings.connect_timeout, io.recv()) => {
                result.map_err(|_| BrokerError::Timeout)??
            }
        };

        match connack {
            Packet::ConnAck(connack) if connack.return_code == ConnectReturnCode::Accepted => {
                info!(
                    "Client '{}': Connected to {} (session_present={})",
                    client_id, settings.address, connack.session_present
                );
            }
            Packet::ConnAck(connack) => {
                return Err(BrokerError::Rejected(connack.return_code.to_string()));
            }
            other => {
                return Err(BrokerError::Protocol(format!(
                    "expected CONNACK, got {:?}",
                    other.packet_type()
                )));
            }
        }

        *self.status.write() = ConnectionStatus::Connected;
        if self.event_tx.send(BrokerEvent::Connected).await.is_err() {
            // Nobody is listening anymore
            io.send(&Packet::Disconnect).await?;
            return Ok(());
        }

        self.message_loop(&mut io, command_rx).await
    }

    async fn message_loop(
        &self,
        io: &mut PacketIo,
        command_rx: &mut mpsc::Receiver<ClientCommand>,
    ) -> Result<(), BrokerError> {
        let client_id = &self.options.client_id;
        let keep_alive = self.settings.keep_alive;
        let keepalive_interval = Duration::from_secs(keep_alive.max(1) as u64);
        let mut keepalive_timer = tokio::time::interval(keepalive_interval);
        keepalive_timer.reset();
        let mut awaiting_pingresp = false;
        let mut packet_ids = PacketIds::default();
        // SUBSCRIBE and UNSUBSCRIBE waiting for their acknowledgement
        let mut pending: HashMap<u16, AckSender> = HashMap::new();

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    let _ = io.send(&Packet::Disconnect).await;
                    let _ = io.write_half.shutdown().await;
                    return Ok(());
                }

                Some(cmd) = command_rx.recv() => {
                    let packet = match cmd {
                        ClientCommand::Publish { topic, payload, qos, retain } => {
                            let packet_id = (qos != QoS::AtMostOnce).then(|| packet_ids.next());
                            Packet::Publish(Publish {
                                dup: false,
                                qos,
                                retain,
                                topic,
                                packet_id,
                                payload,
                            })
                        }
                        ClientCommand::Subscribe { filter, qos, ack } => {
                            debug!("Client '{}': SUBSCRIBE {}", client_id, filter);
                            let packet_id = packet_ids.next();
                            pending.insert(packet_id, ack);
                            Packet::Subscribe(Subscribe {
                                packet_id,
                                filters: vec![(filter, qos)],
                            })
                        }
                        ClientCommand::Unsubscribe { filter, ack } => {
                            debug!("Client '{}': UNSUBSCRIBE {}", client_id, filter);
                            let packet_id = packet_ids.next();
                            pending.insert(packet_id, ack);
                            Packet::Unsubscribe(Unsubscribe {
                                packet_id,
                                filters: vec![filter],
                            })
                        }
                    };
                    io.send(&packet).await?;
                }

                result = io.read_more() => {
                    result?;
                    while let Some(packet) = io.next_buffered()? {
                        self.handle_packet(io, &mut pending, packet).await?;
                    }
                }

                _ = keepalive_timer.tick(), if keep_alive > 0 => {
                    if awaiting_pingresp {
                        return Err(BrokerError::ConnectionLost("keep alive timeout".to_string()));
                    }
                    io.send(&Packet::PingReq).await?;
                    awaiting_pingresp = true;
                    continue;
                }
            }

            // Any traffic from the broker proves liveness
            if io.saw_traffic {
                io.saw_traffic = false;
                awaiting_pingresp = false;
            }
        }
    }

    async fn handle_packet(
        &self,
        io: &mut PacketIo,
        pending: &mut HashMap<u16, AckSender>,
        packet: Packet,
    ) -> Result<(), BrokerError> {
        let client_id = &self.options.client_id;
        match packet {
            Packet::Publish(publish) => {
                match (publish.qos, publish.packet_id) {
                    (QoS::AtLeastOnce, Some(id)) => io.send(&Packet::PubAck(id)).await?,
                    (QoS::ExactlyOnce, Some(id)) => io.send(&Packet::PubRec(id)).await?,
                    _ => {}
                }
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                    qos: publish.qos,
                    retain: publish.retain,
                };
                if self.event_tx.send(BrokerEvent::Message(message)).await.is_err() {
                    debug!("Client '{}': event receiver dropped", client_id);
                }
            }
            Packet::PubRec(id) => io.send(&Packet::PubRel(id)).await?,
            Packet::PubRel(id) => io.send(&Packet::PubComp(id)).await?,
            Packet::SubAck(suback) => {
                let result = if suback.return_codes.iter().any(Option::is_none) {
                    warn!(
                        "Client '{}': Broker refused subscription (packet {})",
                        client_id, suback.packet_id
                    );
                    Err(BrokerError::Rejected(SUBSCRIPTION_REFUSED.to_string()))
                } else {
                    debug!("Client '{}': SUBACK received", client_id);
                    Ok(())
                };
                if let Some(ack) = pending.remove(&suback.packet_id) {
                    let _ = ack.send(result);
                }
            }
            Packet::UnsubAck(id) => {
                if let Some(ack) = pending.remove(&id) {
                    let _ = ack.send(Ok(()));
                }
            }
            Packet::PubAck(_) | Packet::PubComp(_) | Packet::PingResp => {}
            other => {
                return Err(BrokerError::Protocol(format!(
                    "unexpected {:?} from broker",
                    other.packet_type()
                )));
            }
        }
        Ok(())
    }
}

/// Framed packet I/O over a split TCP stream
struct PacketIo {
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
    encoder: Encoder,
    decoder: Decoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    saw_traffic: bool,
}

impl PacketIo {
    async fn send(&mut self, packet: &Packet) -> Result<(), BrokerError> {
        self.write_buf.clear();
        self.encoder
            .encode(packet, &mut self.write_buf)
            .map_err(|e| BrokerError::Protocol(format!("encode error: {}", e)))?;
        self.write_half
            .write_all(&self.write_buf)
            .await
            .map_err(|e| BrokerError::ConnectionLost(e.to_string()))
    }

    /// Read at least one more chunk from the socket
    async fn read_more(&mut self) -> Result<(), BrokerError> {
        let n = self
            .read_half
            .read_buf(&mut self.read_buf)
            .await
            .map_err(|e| BrokerError::ConnectionLost(e.to_string()))?;
        if n == 0 {
            return Err(BrokerError::ConnectionLost("Connection closed".to_string()));
        }
        self.saw_traffic = true;
        Ok(())
    }

    /// Pop one complete packet from the read buffer, if any
    fn next_buffered(&mut self) -> Result<Option<Packet>, BrokerError> {
        let decoded = self
            .decoder
            .decode(&self.read_buf)
            .map_err(|e| BrokerError::Protocol(format!("decode error: {}", e)))?;
        Ok(decoded.map(|(packet, used)| {
            self.read_buf.advance(used);
            packet
        }))
    }

    /// Wait for the next complete packet
    async fn recv(&mut self) -> Result<Packet, BrokerError> {
        loop {
            if let Some(packet) = self.next_buffered()? {
                return Ok(packet);
            }
            self.read_more().await?;
        }
    }
}

/// Packet identifier allocator cycling through 1..=65535
#[derive(Debug)]
struct PacketIds {
    next: u16,
}

impl Default for PacketIds {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl PacketIds {
    fn next(&mut self) -> u16 {
        let id = self.next;
        self.next = if self.next == u16::MAX { 1 } else { self.next + 1 };
        id
    }
}
