//! tron-custody CLI
//!
//!   tron-custody init [--mnemonic <words>]   → Create the encrypted seed vault
//!   tron-custody address <index>             → Derive the address at an index
//!   tron-custody validate <address>          → Check a Tron address
//!   tron-custody config                      → Effective configuration
//!   tron-custody run                         → Start every poller until SIGINT/SIGTERM
//!
//! Settings come from `TRON_CUSTODY_*` variables, a `.env` file in the working
//! directory, and the flags below (flags win).

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use std::env;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use tron_custody::logging::init_logging;
use tron_custody::{
    install_signal_handlers, is_valid_address, Engine, EngineConfig, KeyRing, MemoryKv, MemoryStore, SeedVault,
    StaticUsers, TracingAudit, TracingNotifier, TronAddress,
};

const PASSPHRASE_ENV: &str = "TRON_CUSTODY_SEED_PASSPHRASE";

fn main() {
    let args: Vec<String> = env::args().collect();
    let opts = ParsedArgs::parse(&args[1..]);
    init_logging();

    if opts.help {
        print_usage();
        return;
    }

    if opts.version {
        println!("tron-custody {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let result = match opts.command.as_deref() {
        Some("init") => cmd_init(&opts),
        Some("address") => cmd_address(&opts),
        Some("validate") => cmd_validate(&opts),
        Some("config") => cmd_config(),
        Some("run") => cmd_run(&opts),
        Some(cmd) => Err(anyhow!("unknown command: {}", cmd)),
        None => {
            print_usage();
            return;
        }
    };

    let pretty = opts.pretty || std::io::stdout().is_terminal();
    match result {
        Ok(output) => println!("{}", render(&output, pretty)),
        Err(e) => {
            eprintln!("{}", render(&json!({ "error": format!("{:#}", e) }), pretty));
            std::process::exit(1);
        }
    }
}

fn render(value: &Value, pretty: bool) -> String {
    let rendered = if pretty { serde_json::to_string_pretty(value) } else { serde_json::to_string(value) };
    rendered.unwrap_or_else(|_| value.to_string())
}

#[derive(Default)]
struct ParsedArgs {
    command: Option<String>,
    arg: Option<String>,
    mnemonic: Option<String>,
    seed_path: Option<PathBuf>,
    passphrase: Option<String>,
    pretty: bool,
    help: bool,
    version: bool,
}

impl ParsedArgs {
    fn parse(args: &[String]) -> Self {
        load_dotenv(".env");

        let mut opts = ParsedArgs::default();
        let mut positional = Vec::new();
        let mut i = 0;

        while i < args.len() {
            let arg = &args[i];
            match arg.as_str() {
                "--help" | "-h" => opts.help = true,
                "--version" | "-V" => opts.version = true,
                "--pretty" => opts.pretty = true,
                "--mnemonic" | "-m" => {
                    if i + 1 < args.len() {
                        opts.mnemonic = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--seed" | "-s" => {
                    if i + 1 < args.len() {
                        opts.seed_path = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--passphrase" => {
                    if i + 1 < args.len() {
                        opts.passphrase = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                _ if !arg.starts_with('-') => positional.push(arg.clone()),
                _ => {}
            }
            i += 1;
        }

        let mut positional = positional.into_iter();
        opts.command = positional.next();
        opts.arg = positional.next();

        if opts.passphrase.is_none() {
            opts.passphrase = env::var(PASSPHRASE_ENV).ok().filter(|s| !s.is_empty());
        }
        if opts.seed_path.is_none() {
            opts.seed_path = env::var("TRON_CUSTODY_SEED_PATH").ok().filter(|s| !s.is_empty()).map(PathBuf::from);
        }
        opts
    }

    fn seed_path(&self) -> Result<PathBuf> {
        self.seed_path
            .clone()
            .or_else(SeedVault::default_path)
            .ok_or_else(|| anyhow!("no data directory, pass --seed <path>"))
    }

    fn passphrase(&self) -> Result<&str> {
        self.passphrase
            .as_deref()
            .ok_or_else(|| anyhow!("seed passphrase required: --passphrase or {}", PASSPHRASE_ENV))
    }

    fn key_ring(&self) -> Result<KeyRing> {
        let path = self.seed_path()?;
        let seed = SeedVault::open(&path, self.passphrase()?).with_context(|| format!("opening {}", path.display()))?;
        Ok(KeyRing::new(seed)?)
    }
}

/// Set variables from a dotenv file without overriding the environment.
fn load_dotenv(path: &str) {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"');
            if !value.is_empty() && env::var(key.trim()).is_err() {
                env::set_var(key.trim(), value);
            }
        }
    }
}

fn print_usage() {
    println!(
        r#"tron-custody - USDT custody engine for Tron

USAGE:
    tron-custody <command> [arg] [options]

COMMANDS:
    init                    Create the encrypted seed vault
    address <index>         Derive the deposit address at an index (0 = master)
    validate <address>      Check a base58 or hex Tron address
    config                  Print the effective configuration
    run                     Run every poller until interrupted

OPTIONS:
    --seed, -s <path>       Seed vault file (env: TRON_CUSTODY_SEED_PATH)
    --passphrase <pass>     Vault passphrase (env: {PASSPHRASE_ENV})
    --mnemonic, -m <words>  Import an existing mnemonic on init
    --pretty                Pretty-print JSON
    --help, -h              Show this help
    --version, -V           Show version

ENVIRONMENT:
    TRON_CUSTODY_NETWORK    mainnet | shasta | nile
    TRON_CUSTODY_API_KEY    TronGrid API key
    RUST_LOG                Log filter (default: info)"#
    );
}

fn cmd_init(opts: &ParsedArgs) -> Result<Value> {
    let path = opts.seed_path()?;
    let passphrase = opts.passphrase()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let seed = match opts.mnemonic.as_deref() {
        Some(words) => SeedVault::import(&path, passphrase, words)?,
        None => SeedVault::create(&path, passphrase)?,
    };
    let ring = KeyRing::new(seed)?;
    info!(path = %path.display(), master = %ring.master_address(), "seed vault created");
    Ok(json!({
        "seed_path": path.display().to_string(),
        "master_address": ring.master_address().to_string(),
        "imported": opts.mnemonic.is_some(),
    }))
}

fn cmd_address(opts: &ParsedArgs) -> Result<Value> {
    let raw = opts.arg.as_deref().unwrap_or("0");
    let index: u32 = raw.parse().with_context(|| format!("index {:?}", raw))?;
    let address = opts.key_ring()?.address(index)?;
    Ok(json!({ "index": index, "address": address.to_string(), "hex": address.to_hex() }))
}

fn cmd_validate(opts: &ParsedArgs) -> Result<Value> {
    let Some(raw) = opts.arg.as_deref() else {
        bail!("usage: tron-custody validate <address>");
    };
    let parsed = TronAddress::parse_any(raw).ok();
    Ok(json!({
        "input": raw,
        "valid": parsed.is_some(),
        "base58": is_valid_address(raw),
        "address": parsed.map(|a| a.to_string()),
    }))
}

fn cmd_config() -> Result<Value> {
    Ok(serde_json::to_value(EngineConfig::from_env()?)?)
}

fn cmd_run(opts: &ParsedArgs) -> Result<Value> {
    let config = EngineConfig::from_env()?;
    let keys = opts.key_ring()?;

    let rt = tokio::runtime::Runtime::new().context("creating runtime")?;
    rt.block_on(async {
        let shutdown = install_signal_handlers();

        let chain = Arc::new(tron_custody::TronGridGateway::new(&config.chain)?);
        let kv = Arc::new(MemoryKv::new());
        let engine = Engine::new(
            config,
            keys,
            chain,
            Arc::new(MemoryStore::new()),
            kv,
            Arc::new(StaticUsers::new()),
            Arc::new(TracingNotifier),
            Arc::new(TracingAudit),
        )?;

        let derived = engine.start().await?;
        info!(derived, master = %engine.master_address(), "address pool ready");

        let handles = engine.scheduler().spawn(&shutdown);
        info!(pollers = handles.len(), "custody engine running");

        let mut shutdown_rx = shutdown.subscribe();
        let _ = shutdown_rx.recv().await;
        info!("Shutdown signal received, waiting for pollers...");
        for handle in handles {
            let _ = handle.await;
        }

        let health = engine.health().await?;
        Ok::<Value, anyhow::Error>(serde_json::to_value(health)?)
    })
}
