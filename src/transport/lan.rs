use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::{self, Instant};
use tracing::{debug, info, instrument, trace, warn};

use super::Transport;
use crate::color::Rgb;
use crate::command::{clamp_percent, Command};
use crate::config::LanConfig;
use crate::device::{Device, TransportKind};
use crate::mapping::ChannelMapping;
use crate::{ConnectError, Error, Result};

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    msg: Message<T>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message<T> {
    cmd: String,
    data: T,
}

#[derive(Debug, Serialize)]
struct ScanRequest {
    account_topic: &'static str,
}

#[derive(Debug, Serialize)]
struct Value {
    value: u8,
}

#[derive(Debug, Serialize)]
struct ColorValue {
    r: u8,
    g: u8,
    b: u8,
}

#[derive(Debug, Serialize)]
struct ColorWc {
    color: ColorValue,
    #[serde(rename = "colorTemInKelvin")]
    color_tem_in_kelvin: u16,
}

/// Payload of a device's answer to a scan request
#[derive(Debug, Default, Deserialize)]
struct ScanReply {
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    device: Option<String>,
    #[serde(default)]
    sku: Option<String>,
}

fn envelope<T: Serialize>(cmd: &str, data: T) -> Result<String> {
    Ok(serde_json::to_string(&Envelope {
        msg: Message {
            cmd: cmd.to_string(),
            data,
        },
    })?)
}

/// The discovery datagram sent to the scan group
pub fn scan_request() -> Result<String> {
    envelope(
        "scan",
        ScanRequest {
            account_topic: "reserve",
        },
    )
}

/// JSON equivalent of a [`Command`]
pub fn command_json(command: &Command, mapping: &ChannelMapping) -> Result<String> {
    match *command {
        Command::PowerOn => envelope("turn", Value { value: 1 }),
        Command::PowerOff => envelope("turn", Value { value: 0 }),
        Command::Brightness(percent) => envelope(
            "brightness",
            Value {
                value: clamp_percent(percent),
            },
        ),
        Command::Color(rgb) => {
            let wire = mapping.forward(rgb);
            envelope(
                "colorwc",
                ColorWc {
                    color: ColorValue {
                        r: wire.r,
                        g: wire.g,
                        b: wire.b,
                    },
                    color_tem_in_kelvin: 0,
                },
            )
        }
        Command::ColorTemperature(kelvin) => {
            let white = Rgb::new(0xFF, 0xFF, 0xFF);
            envelope(
                "colorwc",
                ColorWc {
                    color: ColorValue {
                        r: white.r,
                        g: white.g,
                        b: white.b,
                    },
                    color_tem_in_kelvin: kelvin,
                },
            )
        }
    }
}

/// Parses a scan reply into a device, falling back to the sender address
fn parse_scan_reply(datagram: &[u8], from: SocketAddr) -> Result<Device> {
    let reply: Envelope<ScanReply> = serde_json::from_slice(datagram)?;
    let data = reply.msg.data;

    let ip = match data.ip.as_deref().map(str::parse::<IpAddr>) {
        Some(Ok(ip)) => ip,
        Some(Err(_)) | None => from.ip(),
    };
    let address = data.device.unwrap_or_else(|| ip.to_string());

    Ok(Device::lan(address, ip, data.sku))
}

/// Govee LAN API transport for a single bulb
pub struct LanTransport {
    device: Device,
    config: LanConfig,
    socket: Option<UdpSocket>,
}

impl LanTransport {
    pub fn new(device: Device, config: LanConfig) -> Self {
        Self {
            device,
            config,
            socket: None,
        }
    }

    /// Runs one discovery round and returns the devices that answered.
    ///
    /// The scan goes to the multicast group first; if nobody has answered
    /// halfway through `timeout`, or the multicast send itself fails, it is
    /// repeated on the broadcast address. Only a failure of both sends is an
    /// error. Malformed replies are dropped. Every call starts from scratch.
    #[instrument(skip(config))]
    pub async fn discover(config: &LanConfig, timeout: Duration) -> Result<Vec<Device>> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.listen_port)).await?;
        socket.set_broadcast(true)?;

        let request = scan_request()?;
        let start = Instant::now();
        let deadline = start + timeout;
        let mut found = Vec::new();

        info!("Scanning for Govee devices on LAN...");
        let multicast_sent = match socket.send_to(request.as_bytes(), config.multicast_addr).await {
            Ok(_) => {
                collect_replies(&socket, config, start + timeout / 2, &mut found).await;
                true
            }
            Err(e) => {
                warn!("Multicast scan to {} failed: {}", config.multicast_addr, e);
                false
            }
        };

        if found.is_empty() {
            debug!("No multicast replies, trying broadcast");
            if let Err(e) = socket.send_to(request.as_bytes(), config.broadcast_addr).await {
                if !multicast_sent {
                    return Err(e.into());
                }
                warn!("Broadcast scan to {} failed: {}", config.broadcast_addr, e);
            }
        }
        collect_replies(&socket, config, deadline, &mut found).await;

        info!("LAN scan finished, {} device(s) found", found.len());
        Ok(found)
    }
}

/// Pause after a transient receive error
const RECV_BACKOFF: Duration = Duration::from_millis(50);

/// Errors a UDP socket can report for one datagram without being broken
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// Reads datagrams until `deadline`, appending each new device to `found`
async fn collect_replies(
    socket: &UdpSocket,
    config: &LanConfig,
    deadline: Instant,
    found: &mut Vec<Device>,
) {
    let mut buf = vec![0u8; config.max_datagram];
    loop {
        let (len, from) = match time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) if is_transient(&e) => {
                debug!("Transient error receiving scan reply: {}", e);
                time::sleep_until(deadline.min(Instant::now() + RECV_BACKOFF)).await;
                continue;
            }
            Ok(Err(e)) => {
                warn!("Giving up on scan replies: {}", e);
                return;
            }
            Err(_) => return,
        };

        match parse_scan_reply(&buf[..len], from) {
            Ok(device) if found.iter().any(|d: &Device| d.ip() == device.ip()) => {
                trace!("Duplicate reply from {}", from);
            }
            Ok(device) => {
                info!("Found device: {}", device);
                found.push(device);
            }
            Err(e) => warn!("Dropping malformed scan reply from {}: {}", from, e),
        }
    }
}

#[async_trait]
impl Transport for LanTransport {
    fn device(&self) -> &Device {
        &self.device
    }

    #[instrument(skip(self), fields(device = %self.device))]
    async fn connect(&mut self, timeout: Duration) -> Result<()> {
        if self.device.kind() != TransportKind::Lan || self.device.ip().is_none() {
            return Err(ConnectError::WrongTransport(self.device.address().to_string()).into());
        }
        if self.socket.is_some() {
            return Err(ConnectError::AlreadyConnected(self.device.address().to_string()).into());
        }

        let socket = time::timeout(timeout, UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)))
            .await
            .map_err(|_| ConnectError::Timeout(timeout))??;
        self.socket = Some(socket);

        debug!("LAN socket ready for {}", self.device);
        Ok(())
    }

    #[instrument(skip(self, mapping), fields(device = %self.device))]
    async fn send(&mut self, command: &Command, mapping: ChannelMapping) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(Error::NotConnected)?;
        let ip = self.device.ip().ok_or(Error::NotConnected)?;
        let json = command_json(command, &mapping)?;

        debug!("Sending {} as {}", command, json);
        socket
            .send_to(json.as_bytes(), (ip, self.config.command_port))
            .await
            .map_err(|e| {
                warn!("Send failed: {}", e);
                Error::Send(e.to_string())
            })?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.socket = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Channel;

    fn loopback_config(scan_port: u16) -> LanConfig {
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, scan_port));
        LanConfig {
            multicast_addr: target,
            broadcast_addr: target,
            listen_port: 0,
            ..LanConfig::default()
        }
    }

    #[test]
    fn json_payloads() {
        let identity = ChannelMapping::identity();
        assert_eq!(
            scan_request().unwrap(),
            r#"{"msg":{"cmd":"scan","data":{"account_topic":"reserve"}}}"#
        );
        assert_eq!(
            command_json(&Command::PowerOn, &identity).unwrap(),
            r#"{"msg":{"cmd":"turn","data":{"value":1}}}"#
        );
        assert_eq!(
            command_json(&Command::PowerOff, &identity).unwrap(),
            r#"{"msg":{"cmd":"turn","data":{"value":0}}}"#
        );
        assert_eq!(
            command_json(&Command::Brightness(250), &identity).unwrap(),
            r#"{"msg":{"cmd":"brightness","data":{"value":100}}}"#
        );
        assert_eq!(
            command_json(&Command::Color(Rgb::new(0, 255, 0)), &identity).unwrap(),
            r#"{"msg":{"cmd":"colorwc","data":{"color":{"r":0,"g":255,"b":0},"colorTemInKelvin":0}}}"#
        );
        assert_eq!(
            command_json(&Command::ColorTemperature(2700), &identity).unwrap(),
            r#"{"msg":{"cmd":"colorwc","data":{"color":{"r":255,"g":255,"b":255},"colorTemInKelvin":2700}}}"#
        );
    }

    #[test]
    fn color_json_honors_mapping() {
        let json = command_json(
            &Command::Color(Rgb::GREEN),
            &ChannelMapping::swap(Channel::Green, Channel::Blue),
        )
        .unwrap();
        assert!(json.contains(r#""color":{"r":0,"g":0,"b":255}"#));
    }

    #[test]
    fn scan_reply_parsing() {
        let from: SocketAddr = "10.0.0.9:4001".parse().unwrap();

        let device = parse_scan_reply(
            br#"{"msg":{"cmd":"scan","data":{"ip":"192.168.1.50","device":"1F:80:C5:32:32:36:72:4E","sku":"H6008","bleVersionHard":"3.01.01"}}}"#,
            from,
        )
        .unwrap();
        assert_eq!(device.ip(), Some("192.168.1.50".parse().unwrap()));
        assert_eq!(device.address(), "1F:80:C5:32:32:36:72:4E");
        assert_eq!(device.model(), Some("H6008"));

        let device = parse_scan_reply(br#"{"msg":{"cmd":"scan","data":{}}}"#, from).unwrap();
        assert_eq!(device.ip(), Some(from.ip()));

        assert!(parse_scan_reply(b"{\"msg\":", from).is_err());
    }

    #[tokio::test]
    async fn discovery_skips_malformed_replies() {
        let fake = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let config = loopback_config(fake.local_addr().unwrap().port());

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, from) = fake.recv_from(&mut buf).await.unwrap();
            assert!(std::str::from_utf8(&buf[..len]).unwrap().contains(r#""cmd":"scan""#));

            fake.send_to(b"not json", from).await.unwrap();
            let reply = r#"{"msg":{"cmd":"scan","data":{"ip":"192.168.1.50","device":"AA:BB","sku":"H6008"}}}"#;
            fake.send_to(reply.as_bytes(), from).await.unwrap();
            fake.send_to(reply.as_bytes(), from).await.unwrap();
        });

        let devices = LanTransport::discover(&config, Duration::from_millis(400))
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].ip(), Some("192.168.1.50".parse().unwrap()));
        assert_eq!(devices[0].kind(), TransportKind::Lan);
    }

    #[tokio::test]
    async fn discovery_without_replies_is_empty() {
        let silent = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let config = loopback_config(silent.local_addr().unwrap().port());

        let devices = LanTransport::discover(&config, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(devices.is_empty());
    }

    /// Answers one scan request on `socket` with a fixed device
    fn answer_scan(socket: UdpSocket) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (_, from) = socket.recv_from(&mut buf).await.unwrap();
            let reply = r#"{"msg":{"cmd":"scan","data":{"ip":"192.168.1.51","device":"CC:DD","sku":"H6008"}}}"#;
            socket.send_to(reply.as_bytes(), from).await.unwrap();
        })
    }

    #[tokio::test]
    async fn broadcast_round_runs_when_multicast_is_silent() {
        let silent = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let bulb = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let config = LanConfig {
            multicast_addr: silent.local_addr().unwrap(),
            broadcast_addr: bulb.local_addr().unwrap(),
            listen_port: 0,
            ..LanConfig::default()
        };
        let responder = answer_scan(bulb);

        let devices = LanTransport::discover(&config, Duration::from_millis(600))
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].ip(), Some("192.168.1.51".parse().unwrap()));

        // The multicast round went out first
        let mut buf = [0u8; 512];
        let received = time::timeout(Duration::from_millis(100), silent.recv_from(&mut buf)).await;
        assert!(matches!(received, Ok(Ok(_))));
    }

    #[tokio::test]
    async fn multicast_send_failure_falls_back_to_broadcast() {
        let bulb = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let config = LanConfig {
            // Port 0 is not a valid destination
            multicast_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            broadcast_addr: bulb.local_addr().unwrap(),
            listen_port: 0,
            ..LanConfig::default()
        };
        let responder = answer_scan(bulb);

        let devices = LanTransport::discover(&config, Duration::from_millis(400))
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].model(), Some("H6008"));
    }

    #[tokio::test]
    async fn discovery_fails_when_no_scan_can_be_sent() {
        let unsendable = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let config = LanConfig {
            multicast_addr: unsendable,
            broadcast_addr: unsendable,
            listen_port: 0,
            ..LanConfig::default()
        };
        assert!(matches!(
            LanTransport::discover(&config, Duration::from_millis(100)).await,
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn receive_errors_are_classified() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidInput)));
    }

    #[tokio::test]
    async fn send_requires_connect() {
        let device = Device::lan("x", IpAddr::V4(Ipv4Addr::LOCALHOST), None);
        let mut transport = LanTransport::new(device, LanConfig::default());
        assert!(matches!(
            transport.send(&Command::PowerOn, ChannelMapping::identity()).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            transport.send_raw(0x05, &[0x02]).await,
            Err(Error::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn rejects_ble_descriptor() {
        let mut transport = LanTransport::new(Device::ble("aa", "Govee"), LanConfig::default());
        assert!(matches!(
            transport.connect(Duration::from_secs(1)).await,
            Err(Error::Connect(ConnectError::WrongTransport(_)))
        ));
    }
}
