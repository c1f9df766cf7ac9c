//! `neon-cli`: operator CLI for the NEON knob surface and diagnosis dump
//! Talks to `neond` the same way `neond` talks back to it:
//! small JSON files, no socket or RPC stack. `status` reads the snapshot
//! `neond` writes every second; `set` appends a knob update to the inbox
//! `neond` drains once per polling tick.

use std::io;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use colored::Colorize;
use neon_proto::{KnobUpdate, PolicyKind, StatusSnapshot};

#[derive(Parser, Debug)]
#[command(name = "neon-cli")]
#[command(about = "Operator CLI for the NEON GPU channel scheduler")]
struct Args {
    /// Path to neond's status snapshot file.
    #[arg(long, global = true, value_name = "PATH", env = "NEON_STATUS_PATH", default_value = "/run/neon/status.json")]
    status_path: PathBuf,
    /// Path to neond's knob control inbox.
    #[arg(long, global = true, value_name = "PATH", env = "NEON_CONTROL_PATH", default_value = "/run/neon/control.json")]
    control_path: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print device/channel/task diagnosis from the last status snapshot.
    Status {
        /// Print the raw JSON snapshot instead of the formatted table.
        #[arg(long)]
        json: bool,
    },
    /// Queue a knob write for neond to pick up at the next safe checkpoint.
    Set {
        #[command(subcommand)]
        knob: SetKnob,
    },
}

#[derive(Subcommand, Debug)]
enum SetKnob {
    /// Polling worker period in milliseconds (1-1000).
    PollingT { ms: u32 },
    /// Liveness timeout before a stuck channel's owner is killed; 0 disables it.
    MaliciousT { ms: u32 },
    /// Active scheduling discipline.
    Policy { kind: PolicyKindArg },
    /// Timeslice length in milliseconds (1-1000).
    TimesliceT { ms: u32 },
    /// Whether non-holder tasks' pages are forcibly re-armed on hand-off.
    Disengage { enabled: bool },
    /// Per-task sampling window in milliseconds.
    SamplingT { ms: u32 },
    /// Free-run/sampling duration ratio (>= 1).
    SamplingX { x: u32 },
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
enum PolicyKindArg {
    Fcfs,
    Timeslice,
    Sampling,
}

impl From<PolicyKindArg> for PolicyKind {
    fn from(v: PolicyKindArg) -> Self {
        match v {
            PolicyKindArg::Fcfs => PolicyKind::Fcfs,
            PolicyKindArg::Timeslice => PolicyKind::Timeslice,
            PolicyKindArg::Sampling => PolicyKind::Sampling,
        }
    }
}

impl SetKnob {
    fn into_update(self) -> KnobUpdate {
        match self {
            SetKnob::PollingT { ms } => KnobUpdate::PollingT(ms),
            SetKnob::MaliciousT { ms } => KnobUpdate::MaliciousT(ms),
            SetKnob::Policy { kind } => KnobUpdate::Policy(kind.into()),
            SetKnob::TimesliceT { ms } => KnobUpdate::TimesliceT(ms),
            SetKnob::Disengage { enabled } => KnobUpdate::Disengage(enabled),
            SetKnob::SamplingT { ms } => KnobUpdate::SamplingT(ms),
            SetKnob::SamplingX { x } => KnobUpdate::SamplingX(x),
        }
    }
}

fn read_status(path: &Path) -> io::Result<StatusSnapshot> {
    let body = std::fs::read(path)?;
    serde_json::from_slice(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn enqueue_update(path: &Path, update: KnobUpdate) -> io::Result<()> {
    let mut updates: Vec<KnobUpdate> = match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e),
    };
    updates.push(update);
    let body = serde_json::to_vec(&updates)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(".{}.tmp", path.file_name().and_then(|n| n.to_str()).unwrap_or("control")));
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn print_status_table(snapshot: &StatusSnapshot) {
    println!("{} {}", "neond pid:".bold(), snapshot.pid);
    println!(
        "{} submit={} issue={} complete={} polls={} (avg {}us) malicious_kills={} uptime={}s",
        "metrics:".bold(),
        snapshot.metrics.submit_total,
        snapshot.metrics.issue_total,
        snapshot.metrics.complete_total,
        snapshot.metrics.poll_ticks_total,
        snapshot.metrics.avg_poll_tick_micros,
        snapshot.metrics.malicious_kills_total,
        snapshot.metrics.uptime_seconds,
    );
    if snapshot.devices.is_empty() {
        println!("{}", "no devices configured".yellow());
        return;
    }
    for (i, dev) in snapshot.devices.iter().enumerate() {
        println!();
        println!("{} {} ({})", format!("device[{i}]").bold(), dev.name, dev.policy.cyan());
        println!("  channels: {} total, {} live", dev.channel_count, dev.live_channels);
        println!("  tasks: {}", dev.task_count);
        if let Some(holder) = dev.holder {
            println!("  token holder: {holder}");
        }
        if let Some(season) = &dev.season {
            let vtime = dev.device_vtime_ms.map(|v| format!("{v}ms")).unwrap_or_else(|| "-".to_string());
            println!("  season: {} device_vtime={}", season.magenta(), vtime);
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Status { json } => {
            let snapshot = read_status(&args.status_path).map_err(|e| {
                anyhow::anyhow!("reading {}: {e} (is neond running?)", args.status_path.display())
            })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_status_table(&snapshot);
            }
        }
        Command::Set { knob } => {
            let update = knob.into_update();
            enqueue_update(&args.control_path, update.clone())
                .map_err(|e| anyhow::anyhow!("writing {}: {e}", args.control_path.display()))?;
            println!("{} queued {:?}, applies at the next neond safe checkpoint", "ok:".green().bold(), update);
        }
    }
    Ok(())
}
