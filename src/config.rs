//! Engine configuration - built by the binary or the embedding service.
//!
//! Every sub-config has working defaults; `from_env` overlays `TRON_CUSTODY_*`.

use rust_decimal::Decimal;
use serde::Serialize;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CustodyError, CustodyResult};
use crate::keys::TronAddress;
use crate::units::USDT_DECIMALS;

pub const ENV_PREFIX: &str = "TRON_CUSTODY_";

const MAINNET_USDT: TronAddress = TronAddress::from_raw([
    0x41, 0xa6, 0x14, 0xf8, 0x03, 0xb6, 0xfd, 0x78, 0x09, 0x86, 0xa4, 0x2c, 0x78, 0xec, 0x9c, 0x7f, 0x77, 0xe6, 0xde,
    0xd1, 0x3c,
]);
const SHASTA_USDT: TronAddress = TronAddress::from_raw([
    0x41, 0x42, 0xa1, 0xe3, 0x9a, 0xef, 0xa4, 0x92, 0x90, 0xf2, 0xb3, 0xf9, 0xed, 0x68, 0x8d, 0x7c, 0xec, 0xf8, 0x6c,
    0xd6, 0xe0,
]);
const NILE_USDT: TronAddress = TronAddress::from_raw([
    0x41, 0xec, 0xa9, 0xbc, 0x82, 0x8a, 0x30, 0x05, 0xb9, 0xa3, 0xb9, 0x09, 0xf2, 0xcc, 0x5c, 0x2a, 0x54, 0x79, 0x4d,
    0xe0, 0x5f,
]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Shasta,
    Nile,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Shasta => "shasta",
            Network::Nile => "nile",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Some(Network::Mainnet),
            "shasta" => Some(Network::Shasta),
            "nile" | "testnet" => Some(Network::Nile),
            _ => None,
        }
    }

    pub fn api_url(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://api.trongrid.io",
            Network::Shasta => "https://api.shasta.trongrid.io",
            Network::Nile => "https://nile.trongrid.io",
        }
    }

    /// USDT TRC-20 contract on this network.
    pub fn usdt_contract(&self) -> TronAddress {
        match self {
            Network::Mainnet => MAINNET_USDT,
            Network::Shasta => SHASTA_USDT,
            Network::Nile => NILE_USDT,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainConfig {
    pub network: Network,
    pub api_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub asset_contract: TronAddress,
    pub asset_decimals: u32,
    pub request_timeout: Duration,
    /// Upper clamp for TRC-20 fee_limit, in TRX.
    pub max_fee_limit: Decimal,
}

impl ChainConfig {
    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            api_url: network.api_url().to_string(),
            api_key: None,
            asset_contract: network.usdt_contract(),
            asset_decimals: USDT_DECIMALS,
            request_timeout: Duration::from_secs(30),
            max_fee_limit: Decimal::from(15),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self { Self::for_network(Network::Mainnet) }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolConfig {
    pub initial_size: u32,
    /// Replenish when FREE addresses drop below this.
    pub min_threshold: u32,
    pub batch_size: u32,
    pub assign_lock_ttl: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { initial_size: 1000, min_threshold: 200, batch_size: 500, assign_lock_ttl: Duration::from_secs(30) }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScannerConfig {
    pub required_confirmations: u64,
    /// Blocks per pass.
    pub batch_blocks: u64,
    /// First run starts this far behind the tip.
    pub first_run_margin: u64,
    pub min_deposit: Decimal,
    pub lock_ttl: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            required_confirmations: 3,
            batch_blocks: 50,
            first_run_margin: 10,
            min_deposit: Decimal::new(1, 1),
            lock_ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepConfig {
    pub enabled: bool,
    pub min_sweep_amount: Decimal,
    /// TRX sent to a deposit address that is short on gas.
    pub gas_amount: Decimal,
    /// Minimum TRX on a deposit address before a sweep is signed.
    pub gas_threshold: Decimal,
    pub batch_size: usize,
    /// Sweep attempts per deposit before it is parked as FAILED.
    pub max_attempts: u32,
    pub gas_poll_attempts: u32,
    pub gas_poll_interval: Duration,
    pub confirm_timeout: Duration,
    pub gas_confirm_timeout: Duration,
    pub lock_ttl: Duration,
    pub address_lock_ttl: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_sweep_amount: Decimal::from(5),
            gas_amount: Decimal::from(15),
            gas_threshold: Decimal::from(15),
            batch_size: 10,
            max_attempts: 5,
            gas_poll_attempts: 12,
            gas_poll_interval: Duration::from_secs(5),
            confirm_timeout: Duration::from_secs(60 * 60),
            gas_confirm_timeout: Duration::from_secs(30 * 60),
            lock_ttl: Duration::from_secs(600),
            address_lock_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WithdrawalConfig {
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    pub daily_limit: Decimal,
    pub fixed_fee: Decimal,
    /// Percent of the amount, 0.1 means 0.1%.
    pub fee_percentage: Decimal,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub required_confirmations: u64,
    pub confirm_timeout: Duration,
    /// TRX the master keeps for payout gas.
    pub master_trx_reserve: Decimal,
    pub processing_ttl: Duration,
    pub create_lock_ttl: Duration,
    /// PENDING rows older than this and absent from both queues are re-enqueued.
    pub stuck_after: Duration,
    /// A payout the chain still does not know this long after signing has expired
    /// and can never land.
    pub tx_expiry: Duration,
}

impl Default for WithdrawalConfig {
    fn default() -> Self {
        Self {
            min_amount: Decimal::ONE,
            max_amount: Decimal::from(100_000),
            daily_limit: Decimal::from(50_000),
            fixed_fee: Decimal::ONE,
            fee_percentage: Decimal::new(1, 1),
            max_retries: 3,
            retry_delay: Duration::from_secs(60),
            required_confirmations: 20,
            confirm_timeout: Duration::from_secs(60 * 60),
            master_trx_reserve: Decimal::from(20),
            processing_ttl: Duration::from_secs(600),
            create_lock_ttl: Duration::from_secs(30),
            stuck_after: Duration::from_secs(10 * 60),
            tx_expiry: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerConfig {
    /// Percent kept from P2P transfers, 0 by default.
    pub p2p_fee_percentage: Decimal,
    pub transfer_lock_ttl: Duration,
    pub commit_retries: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { p2p_fee_percentage: Decimal::ZERO, transfer_lock_ttl: Duration::from_secs(30), commit_retries: 3 }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerConfig {
    pub scan: Duration,
    pub sweep: Duration,
    pub sweep_confirm: Duration,
    pub gas_confirm: Duration,
    pub queue_drain: Duration,
    pub delayed_promotion: Duration,
    pub withdrawal_confirm: Duration,
    pub pool_replenish: Duration,
    pub stuck_recovery: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan: Duration::from_secs(15),
            sweep: Duration::from_secs(300),
            sweep_confirm: Duration::from_secs(45),
            gas_confirm: Duration::from_secs(30),
            queue_drain: Duration::from_secs(10),
            delayed_promotion: Duration::from_secs(30),
            withdrawal_confirm: Duration::from_secs(60),
            pool_replenish: Duration::from_secs(600),
            stuck_recovery: Duration::from_secs(300),
        }
    }
}

/// Full engine configuration. Higher layers construct this.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineConfig {
    pub chain: ChainConfig,
    pub pool: PoolConfig,
    pub scanner: ScannerConfig,
    pub sweep: SweepConfig,
    pub withdrawal: WithdrawalConfig,
    pub ledger: LedgerConfig,
    pub scheduler: SchedulerConfig,
}

impl EngineConfig {
    pub fn new(network: Network) -> Self {
        Self { chain: ChainConfig::for_network(network), ..Default::default() }
    }
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self { self.chain.api_url = url.into(); self }
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self { self.chain.api_key = Some(key.into()); self }
    pub fn with_asset_contract(mut self, contract: TronAddress) -> Self { self.chain.asset_contract = contract; self }
    pub fn with_pool(mut self, c: PoolConfig) -> Self { self.pool = c; self }
    pub fn with_scanner(mut self, c: ScannerConfig) -> Self { self.scanner = c; self }
    pub fn with_sweep(mut self, c: SweepConfig) -> Self { self.sweep = c; self }
    pub fn with_withdrawal(mut self, c: WithdrawalConfig) -> Self { self.withdrawal = c; self }
    pub fn with_ledger(mut self, c: LedgerConfig) -> Self { self.ledger = c; self }
    pub fn with_scheduler(mut self, c: SchedulerConfig) -> Self { self.scheduler = c; self }

    /// Defaults overlaid with `TRON_CUSTODY_*` from the process environment.
    pub fn from_env() -> CustodyResult<Self> { Self::from_lookup(|key| std::env::var(key).ok()) }

    /// Same as [`EngineConfig::from_env`] against an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> CustodyResult<Self> {
        let vars = Vars(&lookup);
        let network = match vars.raw("NETWORK") {
            Some(value) => Network::from_str(&value)
                .ok_or_else(|| CustodyError::Config(format!("{}NETWORK: unknown network {}", ENV_PREFIX, value)))?,
            None => Network::Mainnet,
        };
        let mut config = Self::new(network);

        if let Some(url) = vars.raw("API_URL") {
            config.chain.api_url = url;
        }
        config.chain.api_key = vars.raw("API_KEY").filter(|k| !k.is_empty());
        if let Some(contract) = vars.raw("ASSET_CONTRACT") {
            config.chain.asset_contract = TronAddress::parse_any(&contract)
                .map_err(|e| CustodyError::Config(format!("{}ASSET_CONTRACT: {}", ENV_PREFIX, e)))?;
        }
        vars.set(&mut config.chain.asset_decimals, "ASSET_DECIMALS")?;
        vars.set_secs(&mut config.chain.request_timeout, "REQUEST_TIMEOUT_SECS")?;

        vars.set(&mut config.pool.initial_size, "POOL_INITIAL_SIZE")?;
        vars.set(&mut config.pool.min_threshold, "POOL_MIN_THRESHOLD")?;
        vars.set(&mut config.pool.batch_size, "POOL_BATCH_SIZE")?;

        vars.set(&mut config.scanner.required_confirmations, "SCAN_CONFIRMATIONS")?;
        vars.set(&mut config.scanner.batch_blocks, "SCAN_BATCH_BLOCKS")?;
        vars.set(&mut config.scanner.min_deposit, "MIN_DEPOSIT")?;

        vars.set(&mut config.sweep.enabled, "SWEEP_ENABLED")?;
        vars.set(&mut config.sweep.min_sweep_amount, "MIN_SWEEP_AMOUNT")?;
        vars.set(&mut config.sweep.gas_amount, "GAS_AMOUNT")?;
        vars.set(&mut config.sweep.gas_threshold, "GAS_THRESHOLD")?;
        vars.set(&mut config.sweep.batch_size, "SWEEP_BATCH_SIZE")?;
        vars.set(&mut config.sweep.max_attempts, "SWEEP_MAX_ATTEMPTS")?;

        vars.set(&mut config.withdrawal.min_amount, "WITHDRAWAL_MIN")?;
        vars.set(&mut config.withdrawal.max_amount, "WITHDRAWAL_MAX")?;
        vars.set(&mut config.withdrawal.daily_limit, "WITHDRAWAL_DAILY_LIMIT")?;
        vars.set(&mut config.withdrawal.fixed_fee, "WITHDRAWAL_FIXED_FEE")?;
        vars.set(&mut config.withdrawal.fee_percentage, "WITHDRAWAL_FEE_PERCENTAGE")?;
        vars.set(&mut config.withdrawal.max_retries, "WITHDRAWAL_MAX_RETRIES")?;
        vars.set_secs(&mut config.withdrawal.retry_delay, "WITHDRAWAL_RETRY_DELAY_SECS")?;
        vars.set(&mut config.withdrawal.required_confirmations, "WITHDRAWAL_CONFIRMATIONS")?;
        vars.set_secs(&mut config.withdrawal.tx_expiry, "WITHDRAWAL_TX_EXPIRY_SECS")?;

        vars.set(&mut config.ledger.p2p_fee_percentage, "P2P_FEE_PERCENTAGE")?;

        vars.set_secs(&mut config.scheduler.scan, "SCAN_INTERVAL_SECS")?;
        vars.set_secs(&mut config.scheduler.sweep, "SWEEP_INTERVAL_SECS")?;
        vars.set_secs(&mut config.scheduler.queue_drain, "QUEUE_POLL_SECS")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CustodyResult<()> {
        let w = &self.withdrawal;
        let check = |ok: bool, msg: &str| if ok { Ok(()) } else { Err(CustodyError::Config(msg.to_string())) };
        check(w.min_amount > Decimal::ZERO, "withdrawal min must be positive")?;
        check(w.min_amount <= w.max_amount, "withdrawal min exceeds max")?;
        check(w.daily_limit >= w.min_amount, "daily limit is below the withdrawal minimum")?;
        check(w.fixed_fee >= Decimal::ZERO, "fixed fee is negative")?;
        check(
            w.fee_percentage >= Decimal::ZERO && w.fee_percentage < Decimal::ONE_HUNDRED,
            "fee percentage must be in [0, 100)",
        )?;
        check(
            self.ledger.p2p_fee_percentage >= Decimal::ZERO && self.ledger.p2p_fee_percentage < Decimal::ONE_HUNDRED,
            "p2p fee percentage must be in [0, 100)",
        )?;
        check(self.pool.batch_size > 0, "pool batch size must be positive")?;
        check(self.scanner.batch_blocks > 0, "scanner batch must be positive")?;
        check(self.sweep.batch_size > 0, "sweep batch size must be positive")?;
        check(self.sweep.gas_poll_attempts > 0, "gas poll attempts must be positive")?;
        check(self.sweep.max_attempts > 0, "sweep attempts must be positive")?;
        check(self.scanner.min_deposit >= Decimal::ZERO, "minimum deposit is negative")?;
        Ok(())
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn raw(&self, name: &str) -> Option<String> {
        (self.0)(&format!("{}{}", ENV_PREFIX, name)).map(|v| v.trim().to_string())
    }

    fn set<T>(&self, slot: &mut T, name: &str) -> CustodyResult<()>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(value) = self.raw(name) {
            *slot = value
                .parse()
                .map_err(|e| CustodyError::Config(format!("{}{}={}: {}", ENV_PREFIX, name, value, e)))?;
        }
        Ok(())
    }

    fn set_secs(&self, slot: &mut Duration, name: &str) -> CustodyResult<()> {
        let mut secs = slot.as_secs();
        self.set(&mut secs, name)?;
        *slot = Duration::from_secs(secs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::collections::HashMap;
    use std::sync::Mutex;

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn network_contracts_match_published_addresses() {
        assert_eq!(Network::Mainnet.usdt_contract().to_string(), "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t");
        assert_eq!(Network::Shasta.usdt_contract().to_string(), "TG3XXyExBkPp9nzdajDZsozEu4BkaSJozs");
        assert_eq!(Network::Nile.usdt_contract().to_string(), "TXYZopYRdj2D9XRtbG411XZZ3kM5VkAeBf");
    }

    #[test]
    fn defaults_validate() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.scanner.required_confirmations, 3);
        assert_eq!(config.withdrawal.required_confirmations, 20);
        assert_eq!(config.pool.batch_size, 500);
    }

    #[test]
    fn lookup_overrides_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("TRON_CUSTODY_NETWORK", "nile"),
            ("TRON_CUSTODY_WITHDRAWAL_MIN", "2.5"),
            ("TRON_CUSTODY_SCAN_CONFIRMATIONS", "19"),
            ("TRON_CUSTODY_SWEEP_ENABLED", "false"),
            ("TRON_CUSTODY_QUEUE_POLL_SECS", "3"),
        ]))
        .unwrap();
        assert_eq!(config.chain.network, Network::Nile);
        assert_eq!(config.chain.api_url, "https://nile.trongrid.io");
        assert_eq!(config.withdrawal.min_amount, Decimal::new(25, 1));
        assert_eq!(config.scanner.required_confirmations, 19);
        assert!(!config.sweep.enabled);
        assert_eq!(config.scheduler.queue_drain, Duration::from_secs(3));
    }

    #[test]
    fn bad_values_are_config_errors() {
        let bad = EngineConfig::from_lookup(lookup(&[("TRON_CUSTODY_WITHDRAWAL_MAX", "lots")]));
        assert!(matches!(bad, Err(CustodyError::Config(_))));
        let inverted = EngineConfig::from_lookup(lookup(&[("TRON_CUSTODY_WITHDRAWAL_MIN", "500000")]));
        assert!(matches!(inverted, Err(CustodyError::Config(_))));
        let network = EngineConfig::from_lookup(lookup(&[("TRON_CUSTODY_NETWORK", "ropsten")]));
        assert!(matches!(network, Err(CustodyError::Config(_))));
    }

    #[test]
    fn reads_process_environment() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("TRON_CUSTODY_API_KEY", "secret-key");
        let config = EngineConfig::from_env().unwrap();
        std::env::remove_var("TRON_CUSTODY_API_KEY");
        assert_eq!(config.chain.api_key.as_deref(), Some("secret-key"));
        let json = serde_json::to_value(&config).unwrap();
        assert!(json["chain"].get("api_key").is_none());
    }
}
