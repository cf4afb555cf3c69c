use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use vpnlens::filter::FilterConfig;
use vpnlens::pipeline::{self, PipelineConfig};

/// Classifies the payload byte columns of a captured flow
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// The pcap file holding the flow to analyse
    #[arg(long)]
    input: PathBuf,
    /// Skip the single-endpoint-pair precondition
    #[arg(long)]
    skip_check: bool,
    /// Usable packets required per direction
    #[arg(long, default_value_t = 50)]
    nb_packet: usize,
    /// Payload byte columns to classify
    #[arg(long, default_value_t = 24)]
    nb_byte: usize,
    /// Filters to run plus the vote threshold, e.g. "latency,zero,2"
    #[arg(long, default_value = "latency,zero,length,2", value_parser = parse_filter_spec)]
    filter: FilterSpec,
    /// Percentage of lowest-gap packets to discard
    #[arg(long, default_value_t = 40.0, value_parser = parse_latency)]
    latency: f64,
    /// Consecutive zero bits the zero filter looks for
    #[arg(long, default_value_t = 16)]
    zero: usize,
    /// Enable verbose output
    #[arg(long, short)]
    verbose: bool,
}

#[derive(Clone)]
struct FilterSpec {
    latency: bool,
    zero: bool,
    length: bool,
    votes: u8,
}

fn parse_filter_spec(value: &str) -> Result<FilterSpec, String> {
    let mut spec = FilterSpec {
        latency: false,
        zero: false,
        length: false,
        votes: 0,
    };
    let tokens: Vec<&str> = value.split(',').collect();
    let (votes_token, names) = tokens.split_last().expect("split always yields a token");
    let votes: u8 = votes_token
        .parse()
        .map_err(|_| format!("invalid vote count: '{votes_token}'"))?;
    if votes > 3 {
        return Err(format!("vote count must be 0..=3, got {votes}"));
    }
    for name in names {
        match *name {
            "latency" => spec.latency = true,
            "zero" => spec.zero = true,
            "length" => spec.length = true,
            other => return Err(format!("unknown filter type: '{other}'")),
        }
    }
    let enabled = [spec.latency, spec.zero, spec.length]
        .iter()
        .filter(|&&on| on)
        .count() as u8;
    if votes > enabled {
        return Err(format!(
            "vote count ({votes}) exceeds the number of enabled filters ({enabled})"
        ));
    }
    spec.votes = votes;
    Ok(spec)
}

fn parse_latency(value: &str) -> Result<f64, String> {
    let latency: f64 = value
        .parse()
        .map_err(|_| format!("'{value}' isn't a number"))?;
    if !(0.0..=100.0).contains(&latency) {
        return Err(format!("must be between 0 and 100, got {latency}"));
    }
    Ok(latency)
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialise the logger
    let log_filter = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::new().parse_filters(log_filter).init();

    let config = PipelineConfig {
        nb_packets_needed: args.nb_packet,
        nb_bytes_needed: args.nb_byte,
        skip_pair_check: args.skip_check,
        filter: FilterConfig {
            latency: args.filter.latency,
            length: args.filter.length,
            zero: args.filter.zero,
            votes_needed: args.filter.votes,
            latency_percentage: args.latency,
            zero_run_bits: args.zero,
        },
    };

    match pipeline::run(&args.input, &config) {
        Ok(result) => {
            println!("{}", result.token_line());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
