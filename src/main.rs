use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{eyre, Result};
use govee_bulb::*;
use futures::FutureExt;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{debug, info, instrument, trace, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    target: Target,

    /// Delay between commands in milliseconds
    #[arg(long, default_value_t = 500)]
    pacing_ms: u64,

    /// Connection timeout in seconds
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Channel mapping as the destinations of R, G and B (e.g. "gbr")
    #[arg(long, default_value = "rgb")]
    mapping: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
#[group(multiple = false)]
struct Target {
    /// BLE MAC address or peripheral id
    #[arg(long)]
    ble: Option<String>,

    /// LAN IP address
    #[arg(long)]
    lan: Option<IpAddr>,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for BLE devices
    ScanBle {
        /// Scan duration in seconds
        #[arg(short, long, default_value_t = 10)]
        duration: u64,
    },
    /// Scan for LAN devices
    ScanLan {
        /// Scan duration in seconds
        #[arg(short, long, default_value_t = 5)]
        duration: u64,
    },
    /// Turn the bulb on
    On,
    /// Turn the bulb off
    Off,
    /// Set brightness
    Brightness {
        /// Brightness level (0-100)
        #[arg(short, long, default_value_t = 100)]
        level: i32,
    },
    /// Set color by name (red, yellow, ...) or as r,g,b
    Color {
        color: String,
        /// How many times to send the color
        #[arg(short, long, default_value_t = 1)]
        repeat: u8,
    },
    /// Set color temperature
    ColorTemp {
        /// Color temperature in Kelvin
        #[arg(short, long, default_value_t = 4000)]
        kelvin: u16,
    },
    /// Discover the bulb's channel order by asking what it shows
    Calibrate {
        /// Seconds to wait for each answer
        #[arg(short, long, default_value_t = 30)]
        window: u64,
        /// Which candidates to send
        #[arg(short, long, value_enum, default_value_t = Sweep::Primaries)]
        sweep: Sweep,
        /// Color carried by every candidate of the format sweep
        #[arg(short, long, default_value = "green")]
        color: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Sweep {
    /// Red, green and blue in manual RGB mode; solves for the channel mapping
    Primaries,
    /// One color in every known encoding; shows which ones the bulb accepts
    Formats,
}

/// Reads observations typed on stdin, one line per candidate
struct StdinFeed {
    lines: Lines<BufReader<Stdin>>,
}

impl StdinFeed {
    fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

#[async_trait]
impl ObservationSource for StdinFeed {
    async fn observe(&mut self, candidate: &Candidate) -> Option<String> {
        println!("Sent {candidate}. What color does the bulb show? (name or r,g,b)");
        match self.lines.next_line().await {
            Ok(Some(line)) if !line.trim().is_empty() => Some(line.trim().to_string()),
            _ => None,
        }
    }

    fn drain(&mut self) -> usize {
        let mut stale = 0;
        while let Some(Ok(Some(line))) = self.lines.next_line().now_or_never() {
            debug!("Discarding answer typed too late: '{}'", line.trim());
            stale += 1;
        }
        stale
    }
}

/// Parses strings like "gbr": red goes to green, green to blue, blue to red
fn parse_mapping(s: &str) -> Result<ChannelMapping> {
    let targets: Vec<Channel> = s
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'r' => Ok(Channel::Red),
            'g' => Ok(Channel::Green),
            'b' => Ok(Channel::Blue),
            other => Err(eyre!("invalid channel '{other}' in mapping")),
        })
        .collect::<Result<_>>()?;
    let targets: [Channel; 3] = targets
        .try_into()
        .map_err(|_| eyre!("mapping must name exactly three channels"))?;
    ChannelMapping::from_targets(targets).ok_or_else(|| eyre!("mapping '{s}' is not a permutation"))
}

fn letters(mapping: &ChannelMapping) -> String {
    Channel::ALL
        .iter()
        .map(|&c| match mapping.target(c) {
            Channel::Red => 'r',
            Channel::Green => 'g',
            Channel::Blue => 'b',
        })
        .collect()
}

#[tokio::main]
#[instrument]
async fn main() -> Result<()> {
    // Initialize tracing with pretty colors
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("govee_bulb=info,goveectl=info")),
        )
        .compact()
        .init();

    // Initialize color-eyre for pretty error reporting
    color_eyre::install()?;

    let cli = Cli::parse();
    debug!("Parsed command line arguments");

    match cli.command {
        Commands::ScanBle { duration } => {
            let devices = BleTransport::scan(&BleConfig::default(), Duration::from_secs(duration)).await?;
            print_devices(&devices);
            return Ok(());
        }
        Commands::ScanLan { duration } => {
            let devices =
                LanTransport::discover(&LanConfig::default(), Duration::from_secs(duration)).await?;
            print_devices(&devices);
            return Ok(());
        }
        _ => {}
    }

    let mapping = parse_mapping(&cli.mapping)?;
    let config = SessionConfig {
        pacing: Duration::from_millis(cli.pacing_ms),
        deadline: None,
    };
    let timeout = Duration::from_secs(cli.timeout);

    match (cli.target.ble, cli.target.lan) {
        (Some(address), _) => {
            let device = Device::ble(address.clone(), address);
            let mut session =
                DeviceSession::with_config(BleTransport::new(device, BleConfig::default()), config);
            session.open(timeout).await?;

            let notifications = if matches!(cli.command, Commands::Calibrate { .. }) {
                let (frames, feed) = NotificationFeed::channel();
                let subscribed = session
                    .transport_mut()
                    .subscribe(move |frame| {
                        debug!("Device notified opcode {:#04x}", frame.opcode);
                        if frames.send(frame).is_err() {
                            trace!("Calibration finished, notification dropped");
                        }
                    })
                    .await;
                match subscribed {
                    Ok(()) => Some(feed),
                    Err(Error::NotSupported(reason)) => {
                        warn!("Notifications unavailable: {}", reason);
                        None
                    }
                    Err(e) => return session.close_with(Err(e.into())).await,
                }
            } else {
                None
            };

            let result = run(&mut session, cli.command, mapping, notifications).await;
            session.close_with(result).await
        }
        (None, Some(ip)) => {
            let device = Device::lan(ip.to_string(), ip, None);
            let mut session =
                DeviceSession::with_config(LanTransport::new(device, LanConfig::default()), config);
            session.open(timeout).await?;
            let result = run(&mut session, cli.command, mapping, None).await;
            session.close_with(result).await
        }
        (None, None) => Err(eyre!("choose a device with --ble <ADDR> or --lan <IP>")),
    }
}

fn print_devices(devices: &[Device]) {
    if devices.is_empty() {
        println!("No Govee devices found.");
    }
    for device in devices {
        println!("{device}");
    }
}

/// Executes one command against an open session
#[instrument(skip(session, command, notifications))]
async fn run<T: Transport>(
    session: &mut DeviceSession<T>,
    command: Commands,
    mapping: ChannelMapping,
    notifications: Option<NotificationFeed>,
) -> Result<()> {
    let steps = match command {
        Commands::On => Intent::new().power(true).into_steps(),
        Commands::Off => Intent::new().power(false).into_steps(),
        Commands::Brightness { level } => Intent::new().power(true).brightness(level).into_steps(),
        Commands::Color { color, repeat } => {
            let rgb: Rgb = color.parse()?;
            Intent::new()
                .power(true)
                .color(rgb)
                .color_repeat(repeat)
                .into_steps()
        }
        Commands::ColorTemp { kelvin } => Intent::new()
            .power(true)
            .color_temperature(kelvin)
            .into_steps(),
        Commands::Calibrate {
            window,
            sweep,
            color,
        } => {
            let config = CalibrationConfig {
                observation_window: Duration::from_secs(window),
                ..CalibrationConfig::default()
            };
            let candidates = match sweep {
                Sweep::Primaries => Candidate::primaries(),
                Sweep::Formats => Candidate::format_variants(color.parse()?),
            };
            return match notifications {
                Some(feed) => {
                    let source = FirstOf::new(StdinFeed::new(), feed);
                    calibrate(session, source, config, &candidates, sweep).await
                }
                None => calibrate(session, StdinFeed::new(), config, &candidates, sweep).await,
            };
        }
        Commands::ScanBle { .. } | Commands::ScanLan { .. } => return Ok(()),
    };

    session.apply(&steps, mapping).await?;
    info!("Done");
    Ok(())
}

/// Runs one calibration sweep and prints what was seen
async fn calibrate<T: Transport, S: ObservationSource>(
    session: &mut DeviceSession<T>,
    source: S,
    config: CalibrationConfig,
    candidates: &[Candidate],
    sweep: Sweep,
) -> Result<()> {
    let mut probe = CalibrationProbe::new(source, config);
    let outcome = probe.run(session, candidates).await;

    for observation in probe.observations() {
        println!(
            "{} -> {}",
            observation.candidate,
            observation.report.as_deref().unwrap_or("(no answer)")
        );
    }

    match outcome {
        Ok(report) => {
            println!("Device mapping: {}", report.mapping);
            println!(
                "Use --mapping {} to send colors as they should appear",
                letters(&report.correction())
            );
            Ok(())
        }
        // A single color in many encodings cannot pin down a mapping
        Err(Error::CalibrationInconclusive(reason)) if sweep == Sweep::Formats => {
            info!("Format sweep finished: {}", reason);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
