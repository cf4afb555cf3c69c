use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::debug;
use vpnlens::capture::Capture;
use vpnlens::fields;
use vpnlens::fingerprint::{self, Check, FingerprintError, OpenvpnSample};

/// Checks a captured flow against the OpenVPN fingerprints
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// The pcap file to check
    input: PathBuf,
    /// Which fingerprint to run
    #[arg(value_enum)]
    check: CheckArg,
    /// Enable verbose output
    #[arg(long, short)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum CheckArg {
    Opcode,
    Ack,
}

fn collect(path: &Path) -> Result<Vec<OpenvpnSample>, FingerprintError> {
    let mut capture = Capture::open(path)?;
    let link_type = capture.link_type();
    fingerprint::collect_samples(&mut capture, link_type)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let log_filter = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::new().parse_filters(log_filter).init();

    let samples = match collect(&args.input) {
        Ok(samples) => samples,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    for (i, sample) in samples.iter().enumerate() {
        debug!(
            "[{i}] {:?} len={} opcode={} {}",
            sample.direction,
            sample.fields.length_hint,
            sample.fields.opcode,
            fields::opcode_to_string(sample.fields.opcode).unwrap_or("?"),
        );
    }

    let check = match args.check {
        CheckArg::Opcode => Check::Opcode,
        CheckArg::Ack => Check::Ack,
    };
    if check.run(&samples) {
        println!("openvpn");
    } else {
        println!("not openvpn");
    }
    ExitCode::SUCCESS
}
