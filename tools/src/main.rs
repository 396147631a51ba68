use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use glob::Pattern;
use proto::{Delivery, Event, Host, HostConfig, PeerHandle, UdpTransport};
use ricochet_tools::{format_pretty, inspect_datagram, simulate, SimulationConfig};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "ricochet-tools",
    version,
    about = "ricochet inspection, simulation and test endpoints"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode captured datagrams and print their commands.
    Inspect {
        /// Path to a datagram file, or a directory of them.
        packet_path: PathBuf,
        /// Optional glob filter when inspecting a directory.
        #[arg(long)]
        glob: Option<String>,
        /// Sort inspected datagrams.
        #[arg(long, value_enum)]
        sort: Option<InspectSort>,
        /// Limit the number of inspected datagrams (after sorting).
        #[arg(long)]
        limit: Option<usize>,
        /// Output format.
        #[arg(long, value_enum, default_value_t = OutputFormat::Pretty)]
        format: OutputFormat,
    },
    /// Run two hosts over a simulated lossy network.
    Simulate {
        /// Simulation config JSON; flags override its fields.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        messages: Option<usize>,
        #[arg(long)]
        payload_len: Option<usize>,
        /// Probability that a datagram is lost.
        #[arg(long)]
        loss: Option<f64>,
        #[arg(long)]
        latency_ms: Option<u64>,
        #[arg(long, value_enum)]
        delivery: Option<DeliveryArg>,
        /// Fail unless every guarantee of the delivery mode held.
        #[arg(long)]
        check: bool,
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
    /// Echo every received payload back to its sender.
    Serve {
        #[arg(long, default_value = "0.0.0.0:7777")]
        bind: SocketAddr,
        /// Host config JSON.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Connect to a server, send messages and print the replies.
    Connect {
        #[arg(long)]
        remote: SocketAddr,
        #[arg(long, default_value_t = 1)]
        channels: u8,
        #[arg(long, value_enum, default_value_t = DeliveryArg::ReliableOrdered)]
        delivery: DeliveryArg,
        /// Seconds to wait for the connection and the replies.
        #[arg(long, default_value_t = 5)]
        wait: u64,
        /// Host config JSON.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Messages to send, spread across the channels.
        messages: Vec<String>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum InspectSort {
    Size,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DeliveryArg {
    ReliableOrdered,
    ReliableUnordered,
    UnreliableSequenced,
    UnreliableUnordered,
}

impl From<DeliveryArg> for Delivery {
    fn from(arg: DeliveryArg) -> Self {
        match arg {
            DeliveryArg::ReliableOrdered => Self::ReliableOrdered,
            DeliveryArg::ReliableUnordered => Self::ReliableUnordered,
            DeliveryArg::UnreliableSequenced => Self::UnreliableSequenced,
            DeliveryArg::UnreliableUnordered => Self::UnreliableUnordered,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Inspect {
            packet_path,
            glob,
            sort,
            limit,
            format,
        } => {
            if packet_path.is_dir() {
                let entries = collect_packet_entries(&packet_path, glob.as_deref())?;
                let mut entries = maybe_sort_entries(entries, sort);
                let limit = limit.or(sort.map(|InspectSort::Size| 10));
                if let Some(limit) = limit {
                    entries.truncate(limit);
                }
                for entry in entries {
                    if matches!(format, OutputFormat::Pretty) {
                        println!("== {} ({} bytes) ==", entry.path.display(), entry.size);
                    }
                    inspect_file(&entry.path, format)?;
                }
            } else {
                inspect_file(&packet_path, format)?;
            }
        }
        Command::Simulate {
            config,
            seed,
            messages,
            payload_len,
            loss,
            latency_ms,
            delivery,
            check,
            format,
        } => {
            let mut config = match config {
                Some(path) => {
                    load_json::<SimulationConfig>(&path).context("load simulation config")?
                }
                None => SimulationConfig::default(),
            };
            config.host.validate().context("invalid host config")?;
            if let Some(seed) = seed {
                config.seed = seed;
            }
            if let Some(messages) = messages {
                config.messages = messages;
            }
            if let Some(payload_len) = payload_len {
                config.payload_len = payload_len;
            }
            if let Some(loss) = loss {
                config.link.loss = loss;
            }
            if let Some(latency_ms) = latency_ms {
                config.link.latency_ms = latency_ms;
            }
            if let Some(delivery) = delivery {
                config.delivery = delivery.into();
            }

            let report = simulate(&config)?;
            match format {
                OutputFormat::Json => {
                    let json = serde_json::to_string_pretty(&report).context("serialize json")?;
                    println!("{json}");
                }
                OutputFormat::Pretty => {
                    println!(
                        "delivered {}/{} ({} duplicates, {} out of order) in {} ms",
                        report.delivered,
                        report.sent,
                        report.duplicates,
                        report.out_of_order,
                        report.elapsed_ms
                    );
                    println!(
                        "network: {} sent, {} dropped, {} duplicated",
                        report.network.sent, report.network.dropped, report.network.duplicated
                    );
                    if let Some(stats) = &report.sender {
                        println!(
                            "sender: rtt {} ms, window {} bytes, {} lost of {} sent",
                            stats.rtt_ms, stats.window_size, stats.packets_lost, stats.packets_sent
                        );
                    }
                }
            }
            if check && !report.is_healthy(config.delivery) {
                bail!("simulation violated {:?} guarantees", config.delivery);
            }
        }
        Command::Serve { bind, config } => {
            let config = load_host_config(config.as_deref())?;
            serve(bind, config)?;
        }
        Command::Connect {
            remote,
            channels,
            delivery,
            wait,
            config,
            messages,
        } => {
            let config = load_host_config(config.as_deref())?;
            connect(
                remote,
                channels,
                delivery.into(),
                Duration::from_secs(wait),
                config,
                &messages,
            )?;
        }
    }
    Ok(())
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse json {}", path.display()))
}

fn load_host_config(path: Option<&Path>) -> Result<HostConfig> {
    let config = match path {
        Some(path) => load_json::<HostConfig>(path).context("load host config")?,
        None => HostConfig::default(),
    };
    config.validate().context("invalid host config")?;
    Ok(config)
}

fn inspect_file(path: &Path, format: OutputFormat) -> Result<()> {
    let bytes = fs::read(path).with_context(|| format!("read datagram {}", path.display()))?;
    let report = inspect_datagram(&bytes, &wire::Limits::default())
        .with_context(|| format!("decode datagram {}", path.display()))?;
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&report).context("serialize json")?;
            println!("{json}");
        }
        OutputFormat::Pretty => print!("{}", format_pretty(&report)),
    }
    Ok(())
}

struct PacketEntry {
    path: PathBuf,
    size: u64,
}

fn collect_packet_entries(dir: &Path, glob: Option<&str>) -> Result<Vec<PacketEntry>> {
    let mut entries = Vec::new();
    let pattern = match glob {
        Some(value) => Some(Pattern::new(value).context("invalid glob pattern")?),
        None => None,
    };

    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Some(pattern) = &pattern {
            let matches_path = pattern.matches_path(&path);
            let matches_name = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| pattern.matches(name));
            if !matches_path && !matches_name {
                continue;
            }
        }
        let size = entry.metadata()?.len();
        entries.push(PacketEntry { path, size });
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

fn maybe_sort_entries(
    mut entries: Vec<PacketEntry>,
    sort: Option<InspectSort>,
) -> Vec<PacketEntry> {
    match sort {
        Some(InspectSort::Size) => {
            entries.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(&b.path)));
        }
        None => {}
    }
    entries
}

fn serve(bind: SocketAddr, config: HostConfig) -> Result<()> {
    let mut host = Host::bind(bind, config).with_context(|| format!("bind {bind}"))?;
    info!(address = %host.transport().local_addr()?, "serving");
    loop {
        let events: Vec<Event> = host.service(Duration::from_millis(100))?.collect();
        for event in events {
            match event {
                Event::Connect { peer, data } => {
                    let address = host.peer_address(peer)?;
                    info!(?peer, %address, data, "peer connected");
                }
                Event::Receive {
                    peer,
                    channel,
                    delivery,
                    payload,
                } => {
                    debug!(?peer, channel, ?delivery, len = payload.len(), "echo");
                    if let Err(err) = host.send(peer, channel, &payload, delivery) {
                        warn!(?peer, %err, "echo failed");
                    }
                }
                Event::Disconnect { peer, data } => info!(?peer, data, "peer disconnected"),
                Event::Timeout { peer } => warn!(?peer, "peer timed out"),
                Event::ConnectFailed { peer } => warn!(?peer, "handshake failed"),
            }
        }
    }
}

fn connect(
    remote: SocketAddr,
    channels: u8,
    delivery: Delivery,
    wait: Duration,
    config: HostConfig,
    messages: &[String],
) -> Result<()> {
    let local: SocketAddr = if remote.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let mut host = Host::bind(local, config).context("bind local socket")?;
    let peer = host.connect(remote, channels, 0)?;
    let deadline = Instant::now() + wait;
    let expected = if delivery.is_reliable() {
        messages.len()
    } else {
        usize::MAX
    };

    let mut connected = false;
    let mut replies = 0;
    while Instant::now() < deadline {
        let events: Vec<Event> = host.service(Duration::from_millis(50))?.collect();
        for event in events {
            match event {
                Event::Connect { .. } => {
                    connected = true;
                    info!(%remote, "connected");
                    send_all(&mut host, peer, channels, delivery, messages)?;
                }
                Event::Receive {
                    channel, payload, ..
                } => {
                    println!("[{channel}] {}", String::from_utf8_lossy(&payload));
                    replies += 1;
                }
                Event::Disconnect { data, .. } => {
                    info!(data, "server disconnected");
                    return Ok(());
                }
                Event::Timeout { .. } => bail!("connection to {remote} timed out"),
                Event::ConnectFailed { .. } => bail!("connection to {remote} failed"),
            }
        }
        if connected && replies >= expected {
            break;
        }
    }
    if !connected {
        bail!("no answer from {remote} within {wait:?}");
    }

    host.disconnect(peer, 0)?;
    let grace = Instant::now() + Duration::from_secs(1);
    while Instant::now() < grace {
        let done = host
            .service(Duration::from_millis(50))?
            .any(|event| matches!(event, Event::Disconnect { .. }));
        if done {
            break;
        }
    }
    Ok(())
}

fn send_all(
    host: &mut Host<UdpTransport>,
    peer: PeerHandle,
    channels: u8,
    delivery: Delivery,
    messages: &[String],
) -> Result<()> {
    for (index, message) in messages.iter().enumerate() {
        let channel = u8::try_from(index % usize::from(channels))?;
        host.send(peer, channel, message.as_bytes(), delivery)
            .with_context(|| format!("send message {index}"))?;
    }
    Ok(())
}
