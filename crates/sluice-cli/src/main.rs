//! SLUICE CLI
//!
//! Replays hex-encoded frames through a software interface running a rule
//! program, and reports the action taken on every frame.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sluice_core::RxAction;
use sluice_datapath::interface::HookId;
use sluice_datapath::soft::SoftInterface;
use sluice_datapath::stats::{RxQueueStatsSnapshot, XskStatistics};
use sluice_datapath::{
    Privilege, Program, ProgramFlags, State, UmemReg, Xsk, XskBindFlags, XskBufferDescriptor,
    XskRingKind,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::{ReplayConfig, parse_frames};

/// UMEM chunk size of the replay socket
const SOCKET_CHUNK_SIZE: u32 = 2048;

/// Most chunks the replay socket allocates
const SOCKET_MAX_CHUNKS: u32 = 4096;

/// SLUICE - replay frames through rule programs
#[derive(Parser)]
#[command(name = "sluice")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output (implies --verbose)
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay frames through the configured rules
    Replay {
        /// Configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Frames file, one hex frame per line
        #[arg(short, long)]
        frames: PathBuf,

        /// Interface queue to inject on
        #[arg(short, long, default_value_t = 0)]
        queue: u32,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a configuration file
    Check {
        /// Configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

/// Verdict on one replayed frame
#[derive(Debug, Serialize)]
struct FrameReport {
    index: usize,
    action: RxAction,
    length: usize,
}

/// Outcome of a replay
#[derive(Debug, Serialize)]
struct ReplayReport {
    frames: Vec<FrameReport>,
    /// Frames the replay socket received, in order
    delivered: Vec<usize>,
    rx: RxQueueStatsSnapshot,
    socket: Option<XskStatistics>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };

    tracing_subscriber::fmt().with_env_filter(log_level).init();

    match cli.command {
        Commands::Replay {
            config,
            frames,
            queue,
            json,
        } => {
            let report = replay(&config, &frames, queue)?;
            print_report(&report, json)?;
        }
        Commands::Check { config } => {
            let config = ReplayConfig::load(&config)?;
            // Redirect targets only need to exist here, not be bound.
            let state = State::new(config.datapath.clone())?;
            let socket = Xsk::create(&state);
            config.build_rules(Some(&socket))?;
            println!(
                "configuration OK: {} rules, interface {} with {} queues",
                config.rules.len(),
                config.interface.if_index,
                config.interface.queue_count
            );
        }
    }

    Ok(())
}

fn replay(config_path: &Path, frames_path: &Path, queue: u32) -> Result<ReplayReport> {
    let config = ReplayConfig::load(config_path)?;
    let content = std::fs::read_to_string(frames_path)
        .with_context(|| format!("failed to read {}", frames_path.display()))?;
    let frames = parse_frames(&content)
        .with_context(|| format!("invalid frames in {}", frames_path.display()))?;

    let state = State::new(config.datapath.clone())?;
    let soft = SoftInterface::new(config.interface.clone());
    state
        .register_interface(soft.clone())
        .context("failed to register interface")?;
    let if_index = config.interface.if_index;

    let socket = if config.needs_socket() {
        Some(open_socket(&state, if_index, queue, frames.len())?)
    } else {
        None
    };

    let rules = config.build_rules(socket.as_ref())?;
    let _program = Program::create(
        &state,
        if_index,
        HookId::RX_INSPECT,
        queue,
        ProgramFlags::empty(),
        rules,
        Privilege::User,
    )
    .context("failed to attach program")?;
    tracing::info!(if_index, queue, frames = frames.len(), "replaying");

    let buffers: Vec<Vec<&[u8]>> = frames
        .iter()
        .map(|frame| frame.iter().map(Vec::as_slice).collect())
        .collect();
    let outcomes = soft
        .inject_fragmented(queue, &buffers)
        .context("replay failed")?;

    let delivered = match &socket {
        Some(socket) => drain_socket(socket)?,
        None => Vec::new(),
    };
    let rx = state
        .binding(if_index)?
        .rx_queue(queue)
        .map(|queue| queue.statistics())
        .unwrap_or_default();

    Ok(ReplayReport {
        frames: outcomes
            .into_iter()
            .enumerate()
            .map(|(index, outcome)| FrameReport {
                index,
                action: outcome.action,
                length: outcome.data.len(),
            })
            .collect(),
        delivered,
        rx,
        socket: socket.map(|socket| socket.statistics()),
    })
}

/// Socket bound to `queue` with a fill ring stocked with every chunk
fn open_socket(state: &Arc<State>, if_index: u32, queue: u32, frames: usize) -> Result<Arc<Xsk>> {
    let chunks = u32::try_from(frames.max(1))
        .unwrap_or(SOCKET_MAX_CHUNKS)
        .next_power_of_two()
        .clamp(8, SOCKET_MAX_CHUNKS);

    let socket = Xsk::create(state);
    socket.set_umem(UmemReg::new(
        u64::from(chunks) * u64::from(SOCKET_CHUNK_SIZE),
        SOCKET_CHUNK_SIZE,
        0,
    ))?;
    socket.set_ring_size(XskRingKind::Rx, chunks)?;
    socket.set_ring_size(XskRingKind::RxFill, chunks)?;
    socket
        .bind(if_index, queue, XskBindFlags::RX)
        .context("failed to bind replay socket")?;
    socket.activate().context("failed to activate replay socket")?;

    let fill = socket
        .ring(XskRingKind::RxFill)
        .context("fill ring missing")?;
    let addresses: Vec<u64> = (0..u64::from(chunks))
        .map(|chunk| chunk * u64::from(SOCKET_CHUNK_SIZE))
        .collect();
    fill.produce(&addresses);
    tracing::debug!(xsk = socket.id(), chunks, "replay socket ready");
    Ok(socket)
}

/// Lengths of the frames waiting in the socket's RX ring
fn drain_socket(socket: &Arc<Xsk>) -> Result<Vec<usize>> {
    let rx = socket.ring(XskRingKind::Rx).context("RX ring missing")?;
    let umem = socket.umem().context("UMEM missing")?;
    rx.consume::<XskBufferDescriptor>(usize::MAX)
        .into_iter()
        .map(|descriptor| {
            let offset = descriptor.address.base() + u64::from(descriptor.address.offset());
            let data = umem.read(offset, descriptor.length as usize)?;
            Ok(data.len())
        })
        .collect()
}

fn print_report(report: &ReplayReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    for frame in &report.frames {
        println!("{:>5}  {:<5}  {} bytes", frame.index, format!("{:?}", frame.action), frame.length);
    }
    println!();
    println!(
        "passed {}  dropped {}  redirected {}  forwarded {}  header copies {}",
        report.rx.inspect_frames_passed,
        report.rx.inspect_frames_dropped,
        report.rx.inspect_frames_redirected,
        report.rx.inspect_frames_forwarded,
        report.rx.header_copies
    );
    if let Some(socket) = &report.socket {
        println!(
            "socket received {}  dropped {}  truncated {}",
            report.delivered.len(),
            socket.rx_dropped,
            socket.rx_truncated
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write;
    use tempfile::NamedTempFile;

    // Ethernet + IPv4 + UDP 10.0.0.1:4000 -> 10.0.0.2:<port>, 4-byte payload
    fn udp_frame(port: u16) -> String {
        let port = format!("{port:04x}");
        format!(
            "020000000002020000000001 0800 \
             4500002000000000401100000a0000010a000002 \
             0fa0{port}000c0000 70696e67"
        )
    }

    fn write(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_cli_structure() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_replay() {
        let cli = Cli::parse_from(["sluice", "--verbose", "replay", "-c", "rules.toml", "-f", "frames.hex"]);
        assert!(cli.verbose);
        assert!(!cli.debug);
        match cli.command {
            Commands::Replay {
                config,
                frames,
                queue,
                json,
            } => {
                assert_eq!(config, PathBuf::from("rules.toml"));
                assert_eq!(frames, PathBuf::from("frames.hex"));
                assert_eq!(queue, 0);
                assert!(!json);
            }
            _ => panic!("Expected Replay command"),
        }
    }

    #[test]
    fn test_replay_drop_and_pass() {
        let config = write(
            "[[rule]]\nmatch = { type = \"udp_dst\", port = 53 }\naction = \"drop\"\n",
        );
        let frames = write(&format!("{}\n{}\n", udp_frame(53), udp_frame(80)));

        let report = replay(config.path(), frames.path(), 0).unwrap();
        assert_eq!(report.frames.len(), 2);
        assert_eq!(report.frames[0].action, RxAction::Drop);
        assert_eq!(report.frames[1].action, RxAction::Pass);
        assert_eq!(report.rx.inspect_frames_dropped, 1);
        assert!(report.socket.is_none());
    }

    #[test]
    fn test_replay_redirect_to_socket() {
        let config = write(
            "[[rule]]\nmatch = { type = \"udp_dst\", port = 53 }\naction = \"redirect\"\n",
        );
        let frames = write(&format!("{}\n{}\n{}\n", udp_frame(53), udp_frame(80), udp_frame(53)));

        let report = replay(config.path(), frames.path(), 0).unwrap();
        assert_eq!(report.frames[0].action, RxAction::Drop);
        assert_eq!(report.frames[1].action, RxAction::Pass);
        assert_eq!(report.delivered, vec![46, 46]);
        assert_eq!(report.rx.inspect_frames_redirected, 2);
    }

    #[test]
    fn test_replay_missing_file() {
        let frames = write("");
        let err = replay(Path::new("/nonexistent/sluice.toml"), frames.path(), 0).unwrap_err();
        assert!(format!("{err:#}").contains("failed to read"));
    }
}
