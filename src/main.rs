use std::sync::atomic::Ordering;
use std::time::Duration;

use clap::Parser;
use soroban_client::{
    keypair::{Keypair, KeypairBehavior},
    network::{NetworkPassphrase, Networks},
    server::Options,
};

use farm::{farm_cycle, Miner};
use kale::KaleClient;
use types::{CycleConfig, MinerConfig};

mod farm;
mod kale;
mod proof;
mod types;
mod ui;

#[derive(Parser)]
#[command(version, long_about = None)]
struct Cli {
    /// Farmer secret key
    #[arg(long)]
    farmer: String,

    /// Amount of KALE to stake (in stroops)
    #[arg(long, default_value_t = 0)]
    stake: i128,

    /// Leading zero hex digits required of a proof
    #[arg(long, default_value_t = 2)]
    difficulty: u32,

    /// Attempt cap per search
    #[arg(long, default_value_t = 100_000)]
    max_attempts: u64,

    /// Number of threads used during the search
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Run the continuous mining loop instead of a single cycle
    #[arg(long)]
    mine: bool,

    /// Seconds to wait between mining iterations
    #[arg(long, default_value_t = 10)]
    interval: u64,

    /// Farming index (read from the contract when omitted)
    #[arg(long)]
    index: Option<u32>,

    /// The farming contract
    #[arg(long)]
    contract: Option<String>,

    /// The RPC Url
    #[arg(long)]
    rpc_url: Option<String>,
}

// Search retries once at this difficulty before the cycle gives up.
const FALLBACK_DIFFICULTY: u32 = 1;
const DEFAULT_INDEX: u32 = 1;
const SETTLE_DELAY: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let contract_id = cli
        .contract
        .unwrap_or("CDL74RF5BLYR2YBLCCI7F5FB6TPSCLKEJUBSD2RSVWZ4YHF3VMFAIGWA".to_string());
    let rpc_url = cli
        .rpc_url
        .unwrap_or("https://mainnet.sorobanrpc.com".to_string());
    let keypair = Keypair::from_secret(&cli.farmer).expect("Farmer is not a valid secret key");
    let farmer = keypair.public_key();

    ui::banner("Kale Farmhand", farmer.as_str());

    let client = KaleClient::new(
        contract_id.as_str(),
        keypair,
        Networks::public().to_string(),
        rpc_url.as_str(),
        Options {
            allow_http: None,
            timeout: None,
            headers: None,
        },
    )
    .expect("Contract is not a valid contract id");

    if cli.threads > 1 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(cli.threads)
            .build_global()
            .unwrap();
    }

    let index = match cli.index {
        Some(i) => i,
        None => match client.farm_index().await {
            Ok(0) | Err(_) => DEFAULT_INDEX,
            Ok(i) => i,
        },
    };

    if cli.mine {
        let cfg = MinerConfig {
            index,
            difficulty: cli.difficulty,
            max_attempts: cli.max_attempts,
            threads: cli.threads,
            interval: Duration::from_secs(cli.interval),
        };
        let mut miner = Miner::new(client, farmer, cfg);

        let flag = miner.run_flag();
        ctrlc::set_handler(move || {
            flag.store(false, Ordering::SeqCst);
            println!("Stopping after the current iteration...");
        })
        .expect("Error setting Ctrl-C handler");

        miner.run().await;
    } else {
        let cfg = CycleConfig {
            index,
            amount: cli.stake,
            difficulty: cli.difficulty,
            fallback_difficulty: FALLBACK_DIFFICULTY,
            max_attempts: cli.max_attempts,
            threads: cli.threads,
            settle: SETTLE_DELAY,
        };

        match farm_cycle(&client, &farmer, &cfg).await {
            Ok(report) => {
                let harvested = match report.failed_step() {
                    None => match &report.harvest {
                        Some(h) => format!("a: {:.2}", ui::normalize_amount(h.value)),
                        None => "a: 0".to_string(),
                    },
                    Some(step) => format!(
                        "{step} failed: {}",
                        report.harvest_error.as_deref().unwrap_or("unknown")
                    ),
                };
                ui::print_line(vec![
                    format!("Cycle({})", report.proof.index),
                    format!("z: {}", report.proof.zeros),
                    harvested,
                ]);
            }
            Err(e) => {
                ui::print_line(vec![format!("Failed({})", e.step()), e.to_string()]);
            }
        }
    }
}
