mod report;
mod scenario;
mod sim;

use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use mutt_core::MuttConfig;
use rand::rngs::StdRng;
use rand::SeedableRng;

use report::Report;
use sim::Sim;

#[derive(Parser)]
#[command(name = "mutt-sim", about = "Simulated Scuttlemutt devices on an in-memory nearby network")]
struct Cli {
    /// RNG seed for message text and pairings (random if omitted).
    #[arg(long)]
    seed: Option<u64>,

    /// Print the summary as one JSON line.
    #[arg(long)]
    json: bool,

    /// Seconds to wait for each scenario step.
    #[arg(long, default_value = "10")]
    timeout: u64,

    /// Do not forward barks addressed to other devices.
    #[arg(long)]
    no_mesh: bool,

    /// Seconds between retries of undelivered barks.
    #[arg(long, default_value = "1")]
    retry: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Everyone in range of everyone; random pairs chat.
    Chat {
        #[arg(long, default_value = "4")]
        devices: usize,
        #[arg(long, default_value = "20")]
        messages: usize,
    },

    /// Devices in a line; the ends talk through relays.
    Chain {
        #[arg(long, default_value = "4")]
        devices: usize,
        #[arg(long, default_value = "5")]
        messages: usize,
    },

    /// Two devices part, queue messages, and meet again.
    Reconnect {
        #[arg(long, default_value = "5")]
        messages: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let seed = cli.seed.unwrap_or_else(rand::random);
    let mut rng = StdRng::seed_from_u64(seed);

    let config = MuttConfig::new()
        .in_memory()
        .mesh_relay(!cli.no_mesh)
        .retry_interval(Duration::from_secs(cli.retry.max(1)));
    let mut sim = Sim::new(config, Duration::from_secs(cli.timeout));

    if !cli.json {
        eprintln!("mutt-sim v{}", env!("CARGO_PKG_VERSION"));
    }
    let start = Instant::now();

    let (name, result) = match cli.command {
        Command::Chat { devices, messages } => {
            ("chat", scenario::chat(&mut sim, devices, messages, &mut rng).await)
        }
        Command::Chain { devices, messages } => {
            ("chain", scenario::chain(&mut sim, devices, messages, &mut rng).await)
        }
        Command::Reconnect { messages } => {
            ("reconnect", scenario::reconnect(&mut sim, messages, &mut rng).await)
        }
    };

    let elapsed_ms = start.elapsed().as_millis() as u64;
    sim.shutdown().await;
    let sent = result?;

    let report = Report::new(name, seed, sent, elapsed_ms, &sim);
    if cli.json {
        report.print_json();
    } else {
        report.print_human();
    }
    Ok(())
}
