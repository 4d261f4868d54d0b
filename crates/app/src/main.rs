mod run;

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "red-kite")]
#[command(about = "Channel inspector: symbol recovery and baud estimation over IQ streams")]
struct Cli {
    /// IQ file input
    #[arg(short = 'f', long)]
    file: Option<PathBuf>,

    /// Sample format for file input: ci8, ci16, cf32
    #[arg(long, default_value = "ci16")]
    format: String,

    /// Input sample rate in Hz
    #[arg(short = 'r', long, default_value = "1000000")]
    rate: f32,

    /// Synthetic BPSK input (instead of a file)
    #[arg(long)]
    synth: bool,

    /// Symbol rate of the synthetic signal
    #[arg(long, default_value = "9600")]
    synth_baud: f32,

    /// Carrier offset of the synthetic signal in Hz
    #[arg(long, default_value = "0")]
    synth_offset: f32,

    /// Channel center frequency in Hz
    #[arg(short = 'c', long, default_value = "0")]
    frequency: f32,

    /// Channel bandwidth in Hz
    #[arg(short = 'b', long, default_value = "20000")]
    bandwidth: f32,

    /// Expected baud rate for the symbol sampler (0 = sampler off)
    #[arg(long, default_value = "0")]
    baud: f32,

    /// Carrier recovery: manual, costas2, costas4
    #[arg(long, default_value = "manual")]
    carrier: String,

    /// Sampling phase within a symbol, 0..1
    #[arg(long, default_value = "0")]
    sym_phase: f32,

    /// Worker threads
    #[arg(long, default_value = "2")]
    workers: usize,

    /// Write recovered symbols to this file as cf32
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Print statistics
    #[arg(long)]
    stats: bool,

    /// Verbose output
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let carrier = match cli.carrier.as_str() {
        "manual" => rk_engine::CarrierControl::Manual,
        "costas2" => rk_engine::CarrierControl::Costas2,
        "costas4" => rk_engine::CarrierControl::Costas4,
        other => {
            eprintln!("unknown carrier control: {} (use manual, costas2 or costas4)", other);
            std::process::exit(1);
        }
    };

    if cli.verbose {
        log::info!("red-kite starting");
        log::info!("channel: {} Hz wide at {} Hz", cli.bandwidth, cli.frequency);
    }

    let options = run::Options {
        file: cli.file,
        format: cli.format,
        rate: cli.rate,
        synth: cli.synth,
        synth_baud: cli.synth_baud,
        synth_offset: cli.synth_offset,
        frequency: cli.frequency,
        bandwidth: cli.bandwidth,
        baud: cli.baud,
        carrier,
        sym_phase: cli.sym_phase,
        workers: cli.workers,
        output: cli.output,
        stats: cli.stats,
    };

    if let Err(e) = run::run(options) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
