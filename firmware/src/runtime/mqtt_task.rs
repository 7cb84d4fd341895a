use button_core::connectivity::InboundMessage;
use button_core::publish::{Payload, Topic};
use button_core::state::Preferences;
use defmt::{Debug2Format, info, warn};
use embassy_futures::select::{Either3, select3};
use embassy_net::dns::DnsQueryType;
use embassy_net::tcp::{self, TcpSocket};
use embassy_net::{IpAddress, Stack};
use embassy_time::{Duration, Instant, Timer, WithTimeout};
use embedded_io_async::{Read, Write};
use rust_mqtt::client::client::MqttClient;
use rust_mqtt::client::client_config::{ClientConfig, MqttVersion};
use rust_mqtt::packet::v5::publish_packet::QualityOfService;
use rust_mqtt::packet::v5::reason_codes::ReasonCode;
use rust_mqtt::utils::rng_generator::CountingRng;

use super::BROKER;
use crate::mailbox::BrokerCommand;
use crate::mqtt::{ClientId, KEEP_ALIVE_SECS, MAX_PACKET_LEN, SessionSettings};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);
const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);
const SOCKET_BUFFER_LEN: usize = 1024;
const MAX_PROPERTIES: usize = 5;

enum SessionError {
    NoServer,
    Dns,
    Connect(tcp::ConnectError),
    Mqtt(ReasonCode),
    Timeout,
}

impl From<ReasonCode> for SessionError {
    fn from(code: ReasonCode) -> Self {
        Self::Mqtt(code)
    }
}

impl defmt::Format for SessionError {
    fn format(&self, f: defmt::Formatter<'_>) {
        match self {
            Self::NoServer => defmt::write!(f, "no broker configured"),
            Self::Dns => defmt::write!(f, "broker lookup failed"),
            Self::Connect(err) => defmt::write!(f, "connect: {}", err),
            Self::Mqtt(code) => defmt::write!(f, "mqtt: {}", Debug2Format(code)),
            Self::Timeout => defmt::write!(f, "timed out"),
        }
    }
}

enum SessionEnd {
    Closed,
    Reconnect,
}

/// Runs broker sessions on request from the connectivity machine.
#[embassy_executor::task]
pub async fn run(stack: Stack<'static>, prefs: Preferences, client_id: ClientId) -> ! {
    let mut rx_buffer = [0u8; SOCKET_BUFFER_LEN];
    let mut tx_buffer = [0u8; SOCKET_BUFFER_LEN];
    let mut recv_packet = [0u8; MAX_PACKET_LEN as usize];
    let mut send_packet = [0u8; MAX_PACKET_LEN as usize];
    let settings = SessionSettings::from_prefs(&prefs);
    let mut reconnect = false;

    loop {
        if !reconnect {
            // Without a session anything but a connect request is stale.
            while !matches!(BROKER.next_command().await, BrokerCommand::Connect) {}
        }
        reconnect = false;

        let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);
        socket.set_timeout(Some(SOCKET_TIMEOUT));
        match session(
            stack,
            &mut socket,
            &settings,
            &client_id,
            &mut send_packet,
            &mut recv_packet,
        )
        .await
        {
            Ok(SessionEnd::Reconnect) => reconnect = true,
            Ok(SessionEnd::Closed) => info!("mqtt: session closed"),
            Err(err) => warn!("mqtt: session failed: {}", err),
        }
        BROKER.set_connected(false);
        socket.abort();
    }
}

async fn session<'a, 's>(
    stack: Stack<'static>,
    socket: &'a mut TcpSocket<'s>,
    settings: &'a SessionSettings<'a>,
    client_id: &'a ClientId,
    send_packet: &'a mut [u8],
    recv_packet: &'a mut [u8],
) -> Result<SessionEnd, SessionError> {
    if !settings.has_server() {
        return Err(SessionError::NoServer);
    }
    let address = resolve(stack, settings.server).await?;
    socket
        .connect((address, settings.port))
        .await
        .map_err(SessionError::Connect)?;

    let mut client = connect(socket, settings, client_id, send_packet, recv_packet);
    client
        .connect_to_broker()
        .with_timeout(CONNACK_TIMEOUT)
        .await
        .map_err(|_| SessionError::Timeout)??;

    BROKER.set_connected(true);
    info!("mqtt: connected as {=str}", client_id.as_str());

    let mut last_tx = Instant::now();
    loop {
        // A command or ping tick can cut a half-read packet short; the next
        // receive then fails and the session ends.
        let event = select3(
            BROKER.next_command(),
            client.receive_message(),
            Timer::at(last_tx + PING_INTERVAL),
        )
        .await;
        match event {
            Either3::First(BrokerCommand::Connect) => return Ok(SessionEnd::Reconnect),
            Either3::First(BrokerCommand::Publish(item)) => {
                client
                    .send_message(
                        item.topic.as_str(),
                        &item.payload,
                        QualityOfService::QoS0,
                        item.retained,
                    )
                    .await?;
                last_tx = Instant::now();
            }
            Either3::First(BrokerCommand::Subscribe(filter)) => {
                if let Err(code) = client.subscribe_to_topic(filter.as_str()).await {
                    warn!(
                        "mqtt: subscription {=str} rejected: {}",
                        filter.as_str(),
                        Debug2Format(&code)
                    );
                }
                last_tx = Instant::now();
            }
            Either3::First(BrokerCommand::Disconnect) => {
                client.disconnect().await?;
                return Ok(SessionEnd::Closed);
            }
            Either3::Second(received) => {
                let (topic, payload) = received?;
                deliver(topic, payload);
            }
            Either3::Third(()) => {
                client.send_ping().await?;
                last_tx = Instant::now();
            }
        }
    }
}

/// Configures a client over any async byte stream.
fn connect<'a, T: Read + Write>(
    transport: T,
    settings: &'a SessionSettings<'a>,
    client_id: &'a ClientId,
    send_packet: &'a mut [u8],
    recv_packet: &'a mut [u8],
) -> MqttClient<'a, T, MAX_PROPERTIES, CountingRng> {
    let mut config = ClientConfig::new(MqttVersion::MQTTv5, CountingRng(20_000));
    config.add_client_id(client_id.as_str());
    config.add_max_subscribe_qos(QualityOfService::QoS1);
    config.add_will(settings.will_topic.as_str(), settings.will_payload, true);
    if let Some(credentials) = &settings.credentials {
        config.add_username(credentials.user);
        config.add_password(credentials.password);
    }
    config.keep_alive = KEEP_ALIVE_SECS;
    config.max_packet_size = MAX_PACKET_LEN;

    let send_len = send_packet.len();
    let recv_len = recv_packet.len();
    MqttClient::new(transport, send_packet, send_len, recv_packet, recv_len, config)
}

async fn resolve(stack: Stack<'static>, host: &str) -> Result<IpAddress, SessionError> {
    if let Ok(address) = host.parse::<core::net::Ipv4Addr>() {
        return Ok(IpAddress::Ipv4(address));
    }
    stack
        .dns_query(host, DnsQueryType::A)
        .await
        .ok()
        .and_then(|addresses| addresses.first().copied())
        .ok_or(SessionError::Dns)
}

fn deliver(topic: &str, payload: &[u8]) {
    let mut owned = Topic::new();
    if owned.push_str(topic).is_err() {
        warn!("mqtt: dropping message on oversized topic");
        return;
    }
    let Ok(payload) = Payload::from_slice(payload) else {
        warn!("mqtt: dropping oversized payload on {=str}", topic);
        return;
    };
    BROKER.deliver(InboundMessage {
        topic: owned,
        payload,
    });
}
