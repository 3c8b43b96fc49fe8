//! Command-line configuration for the cgm-link demo driver.
//!
//! Every subcommand runs with zero arguments. Radio impairments left unset
//! are drawn from a seeded generator, and the resolved values are printable
//! so any run can be repeated with `--seed`.

use cgm_link_core::relay::{RelayConfig, DEFAULT_BASE_URL};
use cgm_link_core::sim::LinkConditions;
use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "cgm-link", version, about = "Pair with, stream from and follow glucose sensors")]
pub struct Cli {
    /// Seed for every simulated source (default: time based)
    #[arg(long, global = true, env = "CGM_LINK_SEED")]
    pub seed: Option<u64>,

    /// JSON file holding the unlock counter, last peripheral and relay session
    /// (default: in memory, forgotten on exit)
    #[arg(long, global = true, env = "CGM_LINK_STORE")]
    pub store: Option<PathBuf>,

    /// Print the resolved configuration
    #[arg(long, global = true)]
    pub print_config: bool,

    /// Don't print the link summary
    #[arg(long, global = true)]
    pub no_metrics: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Pair with a simulated sensor over NFC and print its memory
    Pair(PairArgs),
    /// Pair, then stream readings over a simulated BLE link
    Stream(StreamArgs),
    /// Follow a relay account (simulated unless --live)
    Relay(RelayArgs),
}

#[derive(Debug, Clone, Args)]
pub struct PairArgs {
    /// Sensor age in minutes
    #[arg(long, default_value_t = 1440)]
    pub age: u32,

    /// Simulate a sensor that was never started and activate it
    #[arg(long)]
    pub activate: bool,

    /// Also enable BLE streaming
    #[arg(long)]
    pub enable_streaming: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProfileKind {
    /// The sensor itself
    Direct,
    /// A clip-on bridge transmitter
    Bridge,
}

#[derive(Debug, Clone, Args)]
pub struct StreamArgs {
    #[arg(long, value_enum, default_value_t = ProfileKind::Direct, env = "CGM_LINK_PROFILE")]
    pub profile: ProfileKind,

    /// Sensor age in minutes when pairing
    #[arg(long, default_value_t = 1440)]
    pub age: u32,

    /// Frames to stream
    #[arg(long, default_value_t = 20)]
    pub frames: usize,

    /// Wall time standing in for one sensor minute, in milliseconds
    #[arg(long, default_value_t = 250)]
    pub frame_period_ms: u64,

    /// Fragment loss rate 0.0-1.0 (default: random 0-0.05)
    #[arg(long)]
    pub loss: Option<f64>,

    /// Fragment reorder rate 0.0-1.0 (default: random 0-0.2)
    #[arg(long)]
    pub reorder: Option<f64>,

    /// Payload corruption rate 0.0-1.0 (default: random 0-0.05)
    #[arg(long)]
    pub corrupt: Option<f64>,

    /// Perfect radio (same as --loss 0 --reorder 0 --corrupt 0)
    #[arg(long)]
    pub clean: bool,

    /// Drop the first connection after this many frames
    #[arg(long)]
    pub disconnect_after: Option<usize>,

    /// Minutes of sensor age between emitted batches
    #[arg(long, default_value_t = 1)]
    pub sampling_interval: u32,

    /// Partial frame timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub fragment_timeout_ms: u64,
}

#[derive(Debug, Clone, Args)]
pub struct RelayArgs {
    #[arg(long, env = "CGM_LINK_RELAY_EMAIL", default_value = "follower@example.com")]
    pub email: String,

    #[arg(long, env = "CGM_LINK_RELAY_PASSWORD", default_value = "demo", hide_env_values = true)]
    pub password: String,

    #[arg(long, env = "CGM_LINK_RELAY_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Talk to the real service instead of the simulated one
    #[arg(long)]
    pub live: bool,

    /// Polls before exiting
    #[arg(long, default_value_t = 5)]
    pub polls: u32,

    /// Poll interval in milliseconds
    #[arg(long, default_value_t = 1000, env = "CGM_LINK_RELAY_INTERVAL_MS")]
    pub interval_ms: u64,
}

/// Everything a run needs, with defaults resolved.
#[derive(Debug, Clone)]
pub struct Config {
    pub seed: u64,
    pub store: Option<PathBuf>,
    pub print_config: bool,
    pub print_metrics: bool,
    pub command: Command,
    /// Radio conditions for `stream`
    pub conditions: LinkConditions,
}

impl Config {
    /// Resolve defaults.
    ///
    /// Without `--seed` the seed comes from the clock; with it, every
    /// impairment left unset is reproducible.
    pub fn resolve(cli: Cli) -> Self {
        let seed = cli.seed.unwrap_or_else(|| {
            use std::time::{SystemTime, UNIX_EPOCH};
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|t| t.as_millis() as u64)
                .unwrap_or_default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let conditions = match &cli.command {
            Command::Stream(args) if args.clean => LinkConditions::perfect(seed),
            Command::Stream(args) => LinkConditions {
                drop_rate: args.loss.unwrap_or_else(|| {
                    // biased toward small loss rates
                    let r: f64 = rng.gen();
                    r * r * 0.05
                }),
                reorder_rate: args.reorder.unwrap_or_else(|| rng.gen_range(0.0..=0.2)),
                corrupt_rate: args.corrupt.unwrap_or_else(|| rng.gen_range(0.0..=0.05)),
                seed,
            },
            _ => LinkConditions::perfect(seed),
        };

        Self {
            seed,
            store: cli.store,
            print_config: cli.print_config,
            print_metrics: !cli.no_metrics,
            command: cli.command,
            conditions,
        }
    }

    /// Relay client settings for `relay`.
    pub fn relay_config(args: &RelayArgs) -> RelayConfig {
        RelayConfig {
            base_url: args.base_url.clone(),
            poll_interval: Duration::from_millis(args.interval_ms),
            ..RelayConfig::default()
        }
    }

    /// Print the configuration in human-readable form.
    pub fn print(&self) {
        println!("=== Configuration ===");
        println!("Seed: {}", self.seed);
        match &self.store {
            Some(path) => println!("Store: {}", path.display()),
            None => println!("Store: (in memory)"),
        }
        println!();

        match &self.command {
            Command::Pair(args) => {
                println!("=== Pairing ===");
                println!("Sensor age: {} min", args.age);
                println!("Activate: {}", args.activate);
                println!("Enable streaming: {}", args.enable_streaming);
            }
            Command::Stream(args) => {
                println!("=== Stream ===");
                println!("Profile: {:?}", args.profile);
                println!("Sensor age: {} min", args.age);
                println!("Frames: {} every {} ms", args.frames, args.frame_period_ms);
                println!("Sampling interval: {} min", args.sampling_interval);
                println!("Fragment timeout: {} ms", args.fragment_timeout_ms);
                if let Some(after) = args.disconnect_after {
                    println!("Link loss after: {after} frames");
                }
                println!();
                println!("=== Radio Simulation ===");
                println!("Loss rate: {:.2}%", self.conditions.drop_rate * 100.0);
                println!("Reorder rate: {:.2}%", self.conditions.reorder_rate * 100.0);
                println!("Corruption rate: {:.2}%", self.conditions.corrupt_rate * 100.0);
            }
            Command::Relay(args) => {
                println!("=== Relay ===");
                println!("Server: {}", if args.live { args.base_url.as_str() } else { "(simulated)" });
                println!("Account: {}", args.email);
                println!("Polls: {} every {} ms", args.polls, args.interval_ms);
            }
        }
        println!();
    }
}
