use anyhow::{bail, Context};
use log::{info, warn};

use std::env;

use pow_ledger::{
    Address, Blockchain, CancellationToken, LedgerConfig, LedgerSecret, MiningResult, Transaction,
};

/// Path of an optional TOML config file
const CONFIG_ENV: &str = "LEDGER_CONFIG";

/// Hex-encoded ledger secret; a random one is generated when unset
const SECRET_ENV: &str = "LEDGER_SECRET";

// Load configuration from the file named in LEDGER_CONFIG, or use defaults
fn load_config() -> anyhow::Result<LedgerConfig> {
    match env::var(CONFIG_ENV) {
        Ok(path) => {
            let config = LedgerConfig::from_file(&path)
                .with_context(|| format!("loading ledger config from {}", path))?;
            info!("Loaded ledger config from {}", path);
            Ok(config)
        }
        Err(_) => {
            info!("{} not set, using default ledger config", CONFIG_ENV);
            Ok(LedgerConfig::default())
        }
    }
}

fn initialize_ledger(config: &LedgerConfig) -> anyhow::Result<Blockchain> {
    let hasher = config.hash_algorithm.provider();
    let ledger = match env::var(SECRET_ENV) {
        Ok(encoded) => {
            let secret = LedgerSecret::from_hex(&encoded)
                .with_context(|| format!("decoding {}", SECRET_ENV))?;
            Blockchain::with_components(config, hasher, secret)?
        }
        Err(_) => Blockchain::with_hash_provider(config, hasher)?,
    };
    Ok(ledger)
}

// Mining is CPU-bound, so it runs on the blocking pool and hands the ledger back
async fn mine(
    ledger: Blockchain,
    miner: Address,
    cancel: CancellationToken,
) -> anyhow::Result<(Blockchain, MiningResult)> {
    let (ledger, outcome) = tokio::task::spawn_blocking(move || {
        let mut ledger = ledger;
        let outcome = ledger.mine_pending_transactions_with(&miner, &cancel);
        (ledger, outcome)
    })
    .await
    .context("mining task panicked")?;

    let result = outcome?;
    Ok((ledger, result))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = load_config()?;
    let mut ledger = initialize_ledger(&config)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling mining");
            on_interrupt.cancel();
        }
    });

    let alice = Address::from("alice");
    let bob = Address::from("bob");

    ledger.create_transaction(Transaction::coinbase(alice.clone(), 100))?;
    let (next, first) = mine(ledger, alice.clone(), cancel.clone()).await?;
    ledger = next;
    info!("First block mined with nonce {}", first.nonce);

    ledger.create_transaction(Transaction::new(alice.clone(), bob.clone(), 40))?;
    let (next, second) = mine(ledger, alice.clone(), cancel.clone()).await?;
    ledger = next;
    info!("Second block mined with nonce {}", second.nonce);

    for address in ledger.get_all_addresses() {
        info!("Balance of {}: {}", address, ledger.get_balance(&address));
    }

    if !ledger.is_chain_valid() {
        bail!("ledger failed its own audit");
    }

    let snapshot = serde_json::to_string_pretty(&ledger.export_chain())?;
    println!("{}", snapshot);

    Ok(())
}
