//! TronGrid / full-node HTTP gateway.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{Asset, ChainGateway, SignedTransaction, TransferEvent, TxOutcome, UnsignedTransaction};
use crate::config::ChainConfig;
use crate::error::{CustodyError, CustodyResult};
use crate::keys::TronAddress;
use crate::units::{from_base_units, parse_raw_amount, to_base_units, TRX_DECIMALS};

const API_KEY_HEADER: &str = "TRON-PRO-API-KEY";
const EVENTS_PAGE_LIMIT: usize = 200;
const MAX_EVENT_PAGES: usize = 50;
const TRANSFER_SELECTOR: &str = "transfer(address,uint256)";
const BALANCE_OF_SELECTOR: &str = "balanceOf(address)";

pub struct TronGridGateway {
    client: Client,
    api_url: String,
    api_key: Option<String>,
    token_decimals: u32,
    max_fee_limit: Decimal,
}

impl TronGridGateway {
    pub fn new(config: &ChainConfig) -> CustodyResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(CustodyError::rpc)?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            token_decimals: config.asset_decimals,
            max_fee_limit: config.max_fee_limit,
        })
    }

    async fn post(&self, path: &str, body: Value) -> CustodyResult<Value> {
        let mut req = self.client.post(format!("{}{}", self.api_url, path)).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header(API_KEY_HEADER, key);
        }
        let resp = req.send().await.map_err(CustodyError::rpc)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CustodyError::Rpc(format!("{} returned {}", path, status)));
        }
        resp.json::<Value>().await.map_err(CustodyError::rpc)
    }

    async fn get(&self, url: &str) -> CustodyResult<Value> {
        let mut req = self.client.get(url);
        if let Some(key) = &self.api_key {
            req = req.header(API_KEY_HEADER, key);
        }
        let resp = req.send().await.map_err(CustodyError::rpc)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CustodyError::Rpc(format!("GET {} returned {}", url, status)));
        }
        resp.json::<Value>().await.map_err(CustodyError::rpc)
    }

    /// 80% of the sender's TRX, clamped to 1..=max_fee_limit TRX, in sun.
    async fn fee_limit_sun(&self, from: &TronAddress) -> u128 {
        let default = Decimal::from(8);
        let trx = match self.native_balance(from).await {
            Ok(balance) => (balance * Decimal::new(8, 1)).clamp(Decimal::ONE, self.max_fee_limit),
            Err(e) => {
                warn!(address = %from, error = %e, "fee limit falls back to default");
                default
            }
        };
        to_base_units(trx, TRX_DECIMALS).unwrap_or(8_000_000)
    }
}

#[async_trait]
impl ChainGateway for TronGridGateway {
    async fn latest_block_height(&self) -> CustodyResult<u64> {
        let block = self.post("/wallet/getnowblock", json!({})).await?;
        block["block_header"]["raw_data"]["number"]
            .as_u64()
            .ok_or_else(|| CustodyError::Rpc("getnowblock: missing block number".into()))
    }

    async fn native_balance(&self, address: &TronAddress) -> CustodyResult<Decimal> {
        let account = self
            .post("/wallet/getaccount", json!({"address": address.to_string(), "visible": true}))
            .await?;
        // Unactivated accounts come back as {}.
        let sun = account["balance"].as_u64().unwrap_or(0);
        from_base_units(sun as u128, TRX_DECIMALS)
    }

    async fn asset_balance(&self, address: &TronAddress, asset: &TronAddress) -> CustodyResult<Decimal> {
        let resp = self
            .post(
                "/wallet/triggerconstantcontract",
                json!({
                    "owner_address": address.to_string(),
                    "contract_address": asset.to_string(),
                    "function_selector": BALANCE_OF_SELECTOR,
                    "parameter": address.abi_word(),
                    "visible": true,
                }),
            )
            .await?;
        let word = resp["constant_result"][0]
            .as_str()
            .ok_or_else(|| CustodyError::Rpc(format!("balanceOf: no constant_result: {}", resp)))?;
        let raw = parse_raw_amount(&format!("0x{}", word.trim_start_matches('0')))?;
        from_base_units(raw, self.token_decimals)
    }

    async fn transfer_events_in_range(
        &self,
        asset: &TronAddress,
        from_block: u64,
        to_block: u64,
    ) -> CustodyResult<Vec<TransferEvent>> {
        let base = format!(
            "{}/v1/contracts/{}/events?event_name=Transfer&only_confirmed=true&min_block_number={}&max_block_number={}&limit={}",
            self.api_url, asset, from_block, to_block, EVENTS_PAGE_LIMIT
        );
        let mut events = Vec::new();
        let mut fingerprint: Option<String> = None;

        for _ in 0..MAX_EVENT_PAGES {
            let url = match &fingerprint {
                Some(fp) => format!("{}&fingerprint={}", base, fp),
                None => base.clone(),
            };
            let page = self.get(&url).await?;
            for event in page["data"].as_array().into_iter().flatten() {
                match parse_event(asset, event) {
                    Some(e) if e.block >= from_block && e.block <= to_block => events.push(e),
                    Some(_) => {}
                    None => debug!(event = %event, "skipping malformed transfer event"),
                }
            }
            fingerprint = page["meta"]["fingerprint"].as_str().map(str::to_string);
            if fingerprint.is_none() {
                return Ok(events);
            }
        }
        Err(CustodyError::Rpc(format!("events {}..{} exceeded {} pages", from_block, to_block, MAX_EVENT_PAGES)))
    }

    async fn transaction_result(&self, tx_hash: &str) -> CustodyResult<TxOutcome> {
        let info = self.post("/wallet/gettransactioninfobyid", json!({"value": tx_hash})).await?;
        Ok(classify_info(&info))
    }

    async fn build_unsigned_transfer(
        &self,
        from: &TronAddress,
        to: &TronAddress,
        amount: Decimal,
        asset: &Asset,
    ) -> CustodyResult<UnsignedTransaction> {
        let tx = match asset {
            Asset::Native => {
                let sun = to_base_units(amount, TRX_DECIMALS)?;
                let resp = self
                    .post(
                        "/wallet/createtransaction",
                        json!({
                            "owner_address": from.to_string(),
                            "to_address": to.to_string(),
                            "amount": sun as u64,
                            "visible": true,
                        }),
                    )
                    .await?;
                if let Some(err) = resp["Error"].as_str() {
                    return Err(CustodyError::BroadcastRejected(err.to_string()));
                }
                resp
            }
            Asset::Token(contract) => {
                let raw = to_base_units(amount, self.token_decimals)?;
                let parameter = format!("{}{:064x}", to.abi_word(), raw);
                let fee_limit = self.fee_limit_sun(from).await;
                let resp = self
                    .post(
                        "/wallet/triggersmartcontract",
                        json!({
                            "owner_address": from.to_string(),
                            "contract_address": contract.to_string(),
                            "function_selector": TRANSFER_SELECTOR,
                            "parameter": parameter,
                            "fee_limit": fee_limit as u64,
                            "call_value": 0,
                            "visible": true,
                        }),
                    )
                    .await?;
                if resp["result"]["result"].as_bool() != Some(true) {
                    let message = decode_message(resp["result"]["message"].as_str().unwrap_or("trigger failed"));
                    return Err(CustodyError::BroadcastRejected(message));
                }
                resp["transaction"].clone()
            }
        };
        if tx["raw_data_hex"].as_str().is_none() {
            return Err(CustodyError::Rpc(format!("node returned no raw_data_hex: {}", tx)));
        }
        let unsigned: UnsignedTransaction = serde_json::from_value(tx).map_err(CustodyError::rpc)?;
        Ok(unsigned)
    }

    async fn broadcast(&self, signed: &SignedTransaction) -> CustodyResult<String> {
        let body = serde_json::to_value(signed)?;
        let resp = self.post("/wallet/broadcasttransaction", body).await?;
        if resp["result"].as_bool() == Some(true) {
            return Ok(resp["txid"].as_str().unwrap_or(&signed.tx_id).to_string());
        }
        let code = resp["code"].as_str().unwrap_or("UNKNOWN");
        let message = decode_message(resp["message"].as_str().unwrap_or(""));
        Err(CustodyError::BroadcastRejected(format!("{}: {}", code, message)))
    }
}

fn parse_event(asset: &TronAddress, event: &Value) -> Option<TransferEvent> {
    let result = &event["result"];
    let raw_amount = parse_raw_amount(result["value"].as_str()?).ok()?;
    Some(TransferEvent {
        tx_hash: event["transaction_id"].as_str()?.to_string(),
        token: *asset,
        from: TronAddress::parse_any(result["from"].as_str()?).ok()?,
        to: TronAddress::parse_any(result["to"].as_str()?).ok()?,
        raw_amount,
        block: event["block_number"].as_u64()?,
    })
}

/// Map `gettransactioninfobyid` onto an outcome.
pub(crate) fn classify_info(info: &Value) -> TxOutcome {
    let Some(obj) = info.as_object() else { return TxOutcome::Pending };
    if obj.is_empty() {
        return TxOutcome::Pending;
    }
    let block = info["blockNumber"].as_u64();
    let reason = || {
        info["resMessage"]
            .as_str()
            .map(decode_message)
            .or_else(|| info["receipt"]["result"].as_str().map(str::to_string))
            .unwrap_or_else(|| "FAILED".to_string())
    };

    if info["result"].as_str() == Some("FAILED") {
        return TxOutcome::Failed { reason: reason() };
    }
    match info["receipt"]["result"].as_str() {
        Some("SUCCESS") => return TxOutcome::Success { block },
        Some(_) => return TxOutcome::Failed { reason: reason() },
        None => {}
    }
    if info["result"].as_str() == Some("SUCCESS") {
        return TxOutcome::Success { block };
    }
    // Native transfers carry a receipt without `result`; errors show up in contractResult.
    if info.get("receipt").is_some() && block.is_some() {
        let has_errors = info["contractResult"]
            .as_array()
            .map(|items| items.iter().any(|i| i.as_str().map(|s| !s.trim().is_empty()).unwrap_or(!i.is_null())))
            .unwrap_or(false);
        return if has_errors { TxOutcome::Failed { reason: reason() } } else { TxOutcome::Success { block } };
    }
    TxOutcome::Pending
}

/// Node messages arrive hex-encoded more often than not.
fn decode_message(message: &str) -> String {
    hex::decode(message)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const USDT: &str = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t";

    #[test]
    fn classify_pending_and_success() {
        assert_eq!(classify_info(&json!({})), TxOutcome::Pending);
        assert_eq!(
            classify_info(&json!({"id": "ab", "blockNumber": 77, "receipt": {"result": "SUCCESS"}})),
            TxOutcome::Success { block: Some(77) }
        );
        assert_eq!(
            classify_info(&json!({"id": "ab", "blockNumber": 78, "receipt": {"net_usage": 268}, "contractResult": [""]})),
            TxOutcome::Success { block: Some(78) }
        );
    }

    #[test]
    fn classify_failures_decode_reason() {
        let info = json!({
            "id": "ab",
            "blockNumber": 79,
            "result": "FAILED",
            "resMessage": hex::encode("REVERT opcode executed"),
            "receipt": {"result": "REVERT"}
        });
        assert_eq!(classify_info(&info), TxOutcome::Failed { reason: "REVERT opcode executed".into() });
        assert!(matches!(
            classify_info(&json!({"blockNumber": 80, "receipt": {"result": "OUT_OF_ENERGY"}})),
            TxOutcome::Failed { .. }
        ));
    }

    #[test]
    fn parses_hex_and_base58_events() {
        let asset = TronAddress::parse(USDT).unwrap();
        let event = json!({
            "transaction_id": "deadbeef",
            "block_number": 123,
            "result": {
                "from": "0xa614f803b6fd780986a42c78ec9c7f77e6ded13c",
                "to": USDT,
                "value": "2500000"
            }
        });
        let parsed = parse_event(&asset, &event).unwrap();
        assert_eq!(parsed.raw_amount, 2_500_000);
        assert_eq!(parsed.from, asset);
        assert_eq!(parsed.block, 123);
        assert!(parse_event(&asset, &json!({"transaction_id": "x"})).is_none());
    }

    #[test]
    fn decode_message_passthrough() {
        assert_eq!(decode_message("not hex!"), "not hex!");
        assert_eq!(decode_message(&hex::encode("Contract validate error")), "Contract validate error");
    }
}
