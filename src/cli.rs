use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use regex::Regex;
use tracing::{error, info};

use cilscope::capture::{FragmentSource, PcapFragmentSource};
use cilscope::check::{AllClientsCheck, AllLinksCheck, ValidationWindow};
use cilscope::cil::CilReader;
use cilscope::config::Config;
use cilscope::flow::FrameReader;

#[derive(Parser)]
#[command(name = "cilscope")]
#[command(author, version, about = "Offline analysis of CIL collaboration traffic captures")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to analysis configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Dump raw TCP payload fragments as JSON lines
    TcpReader {
        /// PCAP file to read
        filename: PathBuf,
    },

    /// Dump decoded ZMQ frames as JSON lines
    ZmqReader {
        /// PCAP file to read
        filename: PathBuf,

        /// Treat streams to this destination port as valid even when the
        /// capture missed the connection greeting
        #[arg(long = "force-port", value_name = "PORT")]
        force_ports: Vec<u16>,
    },

    /// Dump decoded CIL and registration messages as JSON lines
    CilReader {
        /// PCAP files to read
        filenames: Vec<PathBuf>,

        /// Filter by source IPv4 address
        #[arg(long, value_name = "IP")]
        src: Option<IpAddr>,

        /// Filter by destination IPv4 address
        #[arg(long, value_name = "IP")]
        dst: Option<IpAddr>,

        /// Print registration messages too
        #[arg(long)]
        reg: bool,
    },

    /// Check each link against the CIL protocol rules
    CilChecker {
        /// PCAP file to read
        filename: PathBuf,

        /// Filter by source IPv4 address
        #[arg(long, value_name = "IP")]
        src: Option<IpAddr>,

        /// Derive the source filter address from the capture filename
        #[arg(long)]
        src_auto: bool,

        /// Filter by destination IPv4 address
        #[arg(long, value_name = "IP")]
        dst: Option<IpAddr>,

        #[command(flatten)]
        timing: MatchTiming,
    },

    /// Check each registration client against the protocol rules
    RegChecker {
        /// PCAP file to read
        filename: PathBuf,

        #[command(flatten)]
        timing: MatchTiming,
    },
}

/// Match timing flags shared by the checker commands.
#[derive(Args)]
pub struct MatchTiming {
    /// Unix epoch seconds of the start of the match
    #[arg(long, default_value_t = 0)]
    pub match_start_time: i64,

    /// Duration of the match in seconds
    #[arg(long)]
    pub match_duration: Option<i64>,

    /// Seconds after match start before compliance is evaluated
    #[arg(long, default_value_t = 0)]
    pub startup_grace_period: i64,
}

impl MatchTiming {
    fn window(&self) -> ValidationWindow {
        let window = ValidationWindow::from_match(
            self.match_start_time,
            self.match_duration,
            self.startup_grace_period,
        );
        if window.end < window.start {
            error!(
                "bad validation time window: check that the startup grace period \
                 is less than the match duration"
            );
        }
        window
    }
}

pub fn run_command(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::TcpReader { filename } => tcp_reader(&filename),
        Commands::ZmqReader { filename, force_ports } => {
            zmq_reader(&filename, force_ports, &config)
        }
        Commands::CilReader { filenames, src, dst, reg } => {
            cil_reader(&filenames, src, dst, reg, &config)
        }
        Commands::CilChecker { filename, src, src_auto, dst, timing } => {
            cil_checker(&filename, src, src_auto, dst, &timing, &config)
        }
        Commands::RegChecker { filename, timing } => reg_checker(&filename, &timing, &config),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            info!("loading config from {}", path.display());
            Ok(Config::from_file(path)?)
        }
        None => {
            if Path::new("cilscope.toml").exists() {
                Ok(Config::from_file("cilscope.toml")?)
            } else {
                Ok(Config::default())
            }
        }
    }
}

fn open_capture(filename: &Path) -> Result<PcapFragmentSource> {
    PcapFragmentSource::open(filename)
        .with_context(|| format!("failed to open capture {}", filename.display()))
}

fn tcp_reader(filename: &Path) -> Result<()> {
    let mut source = open_capture(filename)?;
    while let Some(fragment) = source.read()? {
        println!("{}", serde_json::to_string(&fragment)?);
    }
    let stats = source.stats();
    info!(
        "{} records, {} fragments, {} skipped, {} malformed",
        stats.records, stats.fragments, stats.skipped, stats.malformed
    );
    Ok(())
}

fn zmq_reader(filename: &Path, force_ports: Vec<u16>, config: &Config) -> Result<()> {
    let mut settings = config.decoder.clone();
    for port in force_ports {
        if !settings.force_ports.contains(&port) {
            settings.force_ports.push(port);
        }
    }

    let mut reader = FrameReader::new(open_capture(filename)?, settings);
    while let Some(frame) = reader.read()? {
        println!("{}", serde_json::to_string(&frame)?);
    }
    let stats = reader.stats();
    info!(
        "{} fragments over {} flows, {} frames, {} flows skipped",
        stats.fragments, stats.flows, stats.frames, stats.flows_errored
    );
    Ok(())
}

fn cil_reader(
    filenames: &[PathBuf],
    src: Option<IpAddr>,
    dst: Option<IpAddr>,
    reg: bool,
    config: &Config,
) -> Result<()> {
    for filename in filenames {
        let mut reader = CilReader::new(open_capture(filename)?, config.decoder.clone(), reg);
        while let Some(record) = reader.read()? {
            if src.is_some_and(|src| src != record.src_ip) {
                continue;
            }
            if dst.is_some_and(|dst| dst != record.dst_ip) {
                continue;
            }
            println!("{}", serde_json::to_string(&record)?);
        }
    }
    Ok(())
}

fn cil_checker(
    filename: &Path,
    src: Option<IpAddr>,
    src_auto: bool,
    dst: Option<IpAddr>,
    timing: &MatchTiming,
    config: &Config,
) -> Result<()> {
    let src = match (src, src_auto) {
        (None, true) => src_from_filename(filename),
        (src, _) => src,
    };

    let mut checks = AllLinksCheck::new(src, dst, timing.window(), config.checker.clone());
    let mut reader = CilReader::new(open_capture(filename)?, config.decoder.clone(), true);
    while let Some(record) = reader.read()? {
        checks.process(&record);
    }

    let reports = checks.reports();
    let passed = !reports.is_empty() && reports.iter().all(|r| r.cil_check_passed);
    for report in &reports {
        if let (Some(first), Some(last)) = (report.timestamp_first, report.timestamp_last) {
            info!(
                "link {} -> {}: {} messages from {} to {}",
                report.sender_ip_address,
                report.receiver_ip_address,
                report.total_messages,
                format_epoch(first),
                format_epoch(last)
            );
        }
    }
    println!("{}", serde_json::to_string_pretty(&reports)?);

    if passed {
        eprintln!("{}", "CIL checks passed".green());
        Ok(())
    } else {
        eprintln!("{}", "CIL checks failed".red());
        std::process::exit(1);
    }
}

fn format_epoch(epoch: f64) -> String {
    Utc.timestamp_opt(epoch as i64, 0)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| format!("{:.3}", epoch))
}

fn reg_checker(filename: &Path, timing: &MatchTiming, config: &Config) -> Result<()> {
    let mut checks = AllClientsCheck::new(timing.window(), config.checker.clone());
    let mut reader = CilReader::new(open_capture(filename)?, config.decoder.clone(), true);
    while let Some(record) = reader.read()? {
        checks.process(&record);
    }

    let reports = checks.reports();
    let passed = !reports.is_empty() && reports.iter().all(|r| r.reg_check_passed);
    println!("{}", serde_json::to_string_pretty(&reports)?);

    if passed {
        eprintln!("{}", "registration checks passed".green());
        Ok(())
    } else {
        eprintln!("{}", "registration checks failed".red());
        std::process::exit(1);
    }
}

/// Recover the source gateway address from the conventional capture file
/// name, `...-srn<NN>-RES<N>-colbr<N>-...pcap`.
fn src_from_filename(filename: &Path) -> Option<IpAddr> {
    let basename = filename.file_name()?.to_str()?;
    let re = Regex::new(r"^[-a-zA-Z0-9_]*-srn(\d+)-RES\d+-colbr(\d+)-\d+-\d+\.pcap$")
        .expect("valid filename pattern");

    match re.captures(basename) {
        Some(caps) => {
            let srn: u8 = caps[1].parse().ok()?;
            let colbr: u8 = caps[2].parse().ok()?;
            let src = IpAddr::V4(Ipv4Addr::new(172, 30, 100 + colbr, 100 + srn));
            info!("discovered source filter address is {}", src);
            Some(src)
        }
        None => {
            error!("invalid PCAP filename format, cannot derive source address");
            None
        }
    }
}
