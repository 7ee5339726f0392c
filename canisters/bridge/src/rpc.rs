//! EVM JSON-RPC client over HTTPS outcalls: endpoint pool with weighted
//! failover and cooldown, plus a bounded read-through cache for the hot
//! read methods. Writes are never cached.

use std::cell::RefCell;
use std::collections::BTreeMap;

use candid::CandidType;
use ic_cdk::api::management_canister::http_request::{
    http_request, CanisterHttpRequestArgument, HttpHeader, HttpMethod,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::ChainConfig;
use crate::error::{BridgeError, BridgeResult};

const HTTP_CYCLES: u128 = 30_000_000_000;
const MAX_RESPONSE_BYTES: u64 = 16 * 1024;
const MAX_CACHE_ENTRIES: usize = 4096;
const COOLDOWN_BASE_SECONDS: u64 = 30;
const COOLDOWN_CAP_SECONDS: u64 = 600;

/// Methods worth caching, with their TTLs (seconds).
fn cache_ttl(method: &str) -> Option<u64> {
    match method {
        "eth_chainId" => Some(u64::MAX),
        "eth_gasPrice" | "eth_feeHistory" | "eth_blockNumber" => Some(15),
        "eth_getTransactionCount" => Some(2),
        _ => None,
    }
}

#[derive(Clone, Debug)]
pub struct EndpointState {
    pub url: String,
    pub weight: u8,
    pub healthy: bool,
    pub last_latency_ms: u64,
    pub failure_count: u32,
    pub cooldown_until: u64,
}

impl EndpointState {
    fn new(url: String, weight: u8) -> Self {
        EndpointState {
            url,
            weight,
            healthy: true,
            last_latency_ms: 0,
            failure_count: 0,
            cooldown_until: 0,
        }
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    value: String,
    stored_at: u64,
    ttl: u64,
    last_used: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: u64) -> bool {
        self.ttl != u64::MAX && now > self.stored_at.saturating_add(self.ttl)
    }
}

/// Per-chain runtime state. Heap-only; rebuilt from config after upgrade.
pub struct ChainRuntime {
    chain_id: u64,
    endpoints: Vec<EndpointState>,
    cache: BTreeMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    last_seen_block: u64,
}

impl ChainRuntime {
    pub fn new(chain: &ChainConfig) -> Self {
        ChainRuntime {
            chain_id: chain.chain_id,
            endpoints: chain
                .rpc_endpoints
                .iter()
                .map(|e| EndpointState::new(e.url.clone(), e.weight))
                .collect(),
            cache: BTreeMap::new(),
            hits: 0,
            misses: 0,
            last_seen_block: 0,
        }
    }

    fn cache_get(&mut self, key: &str, now: u64) -> Option<String> {
        match self.cache.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.last_used = now;
                self.hits += 1;
                Some(entry.value.clone())
            }
            Some(_) => {
                self.cache.remove(key);
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    fn cache_put(&mut self, key: String, value: String, ttl: u64, now: u64) {
        if self.cache.len() >= MAX_CACHE_ENTRIES && !self.cache.contains_key(&key) {
            if let Some(oldest) = self
                .cache
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                self.cache.remove(&oldest);
            }
        }
        self.cache.insert(
            key,
            CacheEntry {
                value,
                stored_at: now,
                ttl,
                last_used: now,
            },
        );
    }

    /// Dispatch order: not cooling down, healthy first, then weight, then
    /// observed latency.
    fn dispatch_order(&self, now: u64) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.endpoints.len())
            .filter(|&i| self.endpoints[i].cooldown_until <= now)
            .collect();
        order.sort_by_key(|&i| {
            let e = &self.endpoints[i];
            (!e.healthy, std::cmp::Reverse(e.weight), e.last_latency_ms)
        });
        order
    }

    fn record_success(&mut self, index: usize, latency_ms: u64) {
        let endpoint = &mut self.endpoints[index];
        endpoint.healthy = true;
        endpoint.failure_count = 0;
        endpoint.cooldown_until = 0;
        endpoint.last_latency_ms = latency_ms;
    }

    fn record_failure(&mut self, index: usize, now: u64) {
        let endpoint = &mut self.endpoints[index];
        endpoint.healthy = false;
        endpoint.failure_count += 1;
        let exponent = endpoint.failure_count.saturating_sub(1).min(5);
        let cooldown = (COOLDOWN_BASE_SECONDS << exponent).min(COOLDOWN_CAP_SECONDS);
        endpoint.cooldown_until = now + cooldown;
    }

    fn invalidate_prefix(&mut self, prefix: &str) {
        self.cache.retain(|key, _| !key.starts_with(prefix));
    }
}

thread_local! {
    static RUNTIMES: RefCell<BTreeMap<u64, ChainRuntime>> = RefCell::new(BTreeMap::new());
}

fn with_runtime<T>(chain: &ChainConfig, f: impl FnOnce(&mut ChainRuntime) -> T) -> T {
    RUNTIMES.with(|cell| {
        let mut runtimes = cell.borrow_mut();
        let runtime = runtimes
            .entry(chain.chain_id)
            .or_insert_with(|| ChainRuntime::new(chain));
        f(runtime)
    })
}

fn now_sec() -> u64 {
    ic_cdk::api::time() / 1_000_000_000
}

fn now_ms() -> u64 {
    ic_cdk::api::time() / 1_000_000
}

fn cache_key(method: &str, params: &Value) -> String {
    format!("{}:{}", method, params)
}

async fn http_post(url: &str, body: String) -> BridgeResult<String> {
    let request = CanisterHttpRequestArgument {
        url: url.to_string(),
        method: HttpMethod::POST,
        body: Some(body.into_bytes()),
        max_response_bytes: Some(MAX_RESPONSE_BYTES),
        transform: None,
        headers: vec![
            HttpHeader {
                name: "Content-Type".to_string(),
                value: "application/json".to_string(),
            },
            HttpHeader {
                name: "Accept".to_string(),
                value: "application/json".to_string(),
            },
        ],
    };

    match http_request(request, HTTP_CYCLES).await {
        Ok((response,)) => {
            if response.status == 200u32 {
                String::from_utf8(response.body).map_err(|_| BridgeError::BadRpcResponse {
                    expected: "utf-8 body".to_string(),
                })
            } else {
                Err(BridgeError::RpcError {
                    code: -32000,
                    message: format!("http status {}", response.status),
                })
            }
        }
        Err((code, message)) => {
            let timed_out = message.contains("imed out") || message.contains("imeout");
            if timed_out {
                Err(BridgeError::RpcTimeout {
                    endpoint: url.to_string(),
                })
            } else {
                Err(BridgeError::RpcError {
                    code: code as i64,
                    message,
                })
            }
        }
    }
}

/// Extract the JSON-RPC `result`, classifying `error` members.
fn extract_result(body: &str) -> BridgeResult<Value> {
    let value: Value = serde_json::from_str(body).map_err(|_| BridgeError::BadRpcResponse {
        expected: "json body".to_string(),
    })?;
    if let Some(error) = value.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32_000);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(BridgeError::RpcError { code, message });
    }
    value
        .get("result")
        .cloned()
        .ok_or(BridgeError::BadRpcResponse {
            expected: "result".to_string(),
        })
}

/// One JSON-RPC call with failover across the chain's endpoint pool.
pub async fn call(chain: &ChainConfig, method: &str, params: Value) -> BridgeResult<Value> {
    let key = cache_key(method, &params);
    let ttl = cache_ttl(method);

    if ttl.is_some() {
        let now = now_sec();
        if let Some(cached) = with_runtime(chain, |rt| rt.cache_get(&key, now)) {
            if let Ok(value) = serde_json::from_str::<Value>(&cached) {
                return Ok(value);
            }
        }
    }

    let body = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    })
    .to_string();

    let order = with_runtime(chain, |rt| rt.dispatch_order(now_sec()));
    if order.is_empty() {
        return Err(BridgeError::AllEndpointsDown {
            chain: chain.name.clone(),
        });
    }

    let mut last_error = BridgeError::AllEndpointsDown {
        chain: chain.name.clone(),
    };

    for index in order {
        let url = with_runtime(chain, |rt| rt.endpoints[index].url.clone());
        let started = now_ms();
        let outcome = http_post(&url, body.clone()).await;
        let latency = now_ms().saturating_sub(started);

        let result = outcome.and_then(|response_body| extract_result(&response_body));
        match result {
            Ok(value) => {
                // Chain-id mismatch counts as an endpoint failure.
                if method == "eth_chainId" {
                    match u64_from_hex_value(&value) {
                        Ok(id) if id == chain.chain_id => {}
                        Ok(_) | Err(_) => {
                            with_runtime(chain, |rt| rt.record_failure(index, now_sec()));
                            last_error = BridgeError::BadRpcResponse {
                                expected: "matching chain id".to_string(),
                            };
                            continue;
                        }
                    }
                }
                let now = now_sec();
                with_runtime(chain, |rt| {
                    rt.record_success(index, latency);
                    if let Some(ttl_secs) = ttl {
                        rt.cache_put(key.clone(), value.to_string(), ttl_secs, now);
                    }
                });
                return Ok(value);
            }
            Err(err) => {
                with_runtime(chain, |rt| rt.record_failure(index, now_sec()));
                last_error = err;
            }
        }
    }

    Err(last_error)
}

// --- typed operations ---

#[derive(Clone, Debug, CandidType, Deserialize, Serialize)]
pub struct Receipt {
    pub transaction_hash: String,
    pub block_number: u64,
    pub gas_used: u64,
    pub effective_gas_price: u64,
    pub status: u64,
}

pub async fn chain_id(chain: &ChainConfig) -> BridgeResult<u64> {
    let value = call(chain, "eth_chainId", json!([])).await?;
    u64_from_hex_value(&value)
}

pub async fn fee_history(chain: &ChainConfig, blocks: u64) -> BridgeResult<Value> {
    call(
        chain,
        "eth_feeHistory",
        json!([format!("0x{:x}", blocks), "latest", [60]]),
    )
    .await
}

pub async fn gas_price(chain: &ChainConfig) -> BridgeResult<u64> {
    let value = call(chain, "eth_gasPrice", json!([])).await?;
    u64_from_hex_value(&value)
}

pub async fn block_number(chain: &ChainConfig) -> BridgeResult<u64> {
    let value = call(chain, "eth_blockNumber", json!([])).await?;
    let number = u64_from_hex_value(&value)?;
    with_runtime(chain, |rt| rt.last_seen_block = number);
    Ok(number)
}

pub async fn nonce(chain: &ChainConfig, address: &str) -> BridgeResult<u64> {
    let value = call(
        chain,
        "eth_getTransactionCount",
        json!([address, "latest"]),
    )
    .await?;
    u64_from_hex_value(&value)
}

pub async fn get_balance(chain: &ChainConfig, address: &str) -> BridgeResult<u128> {
    let value = call(chain, "eth_getBalance", json!([address, "latest"])).await?;
    u128_from_hex_value(&value)
}

pub async fn send_raw(chain: &ChainConfig, raw_tx: &[u8]) -> BridgeResult<String> {
    let value = call(
        chain,
        "eth_sendRawTransaction",
        json!([format!("0x{}", hex::encode(raw_tx))]),
    )
    .await?;
    value
        .as_str()
        .map(str::to_string)
        .ok_or(BridgeError::BadRpcResponse {
            expected: "transaction hash".to_string(),
        })
}

/// Fetch a receipt; `None` until the transaction is mined. Receipts are only
/// cached once a final status has been observed.
pub async fn receipt(chain: &ChainConfig, tx_hash: &str) -> BridgeResult<Option<Receipt>> {
    let key = cache_key("eth_getTransactionReceipt", &json!([tx_hash]));
    let now = now_sec();
    if let Some(cached) = with_runtime(chain, |rt| rt.cache_get(&key, now)) {
        if let Ok(value) = serde_json::from_str::<Value>(&cached) {
            return parse_receipt(&value).map(Some);
        }
    }

    let value = call(chain, "eth_getTransactionReceipt", json!([tx_hash])).await?;
    if value.is_null() {
        return Ok(None);
    }
    let parsed = parse_receipt(&value)?;
    let now = now_sec();
    with_runtime(chain, |rt| {
        rt.cache_put(key, value.to_string(), u64::MAX, now);
        rt.last_seen_block = rt.last_seen_block.max(parsed.block_number);
    });
    Ok(Some(parsed))
}

fn parse_receipt(value: &Value) -> BridgeResult<Receipt> {
    let field = |name: &str| -> BridgeResult<u64> {
        value
            .get(name)
            .and_then(Value::as_str)
            .ok_or(BridgeError::BadRpcResponse {
                expected: "receipt field".to_string(),
            })
            .and_then(u64_from_hex)
    };
    Ok(Receipt {
        transaction_hash: value
            .get("transactionHash")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        block_number: field("blockNumber")?,
        gas_used: field("gasUsed")?,
        effective_gas_price: field("effectiveGasPrice").unwrap_or(0),
        status: field("status")?,
    })
}

// --- hex helpers ---

pub fn u64_from_hex(value: &str) -> BridgeResult<u64> {
    let digits = value.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(digits, 16).map_err(|_| BridgeError::BadRpcResponse {
        expected: "hex quantity".to_string(),
    })
}

pub fn u128_from_hex(value: &str) -> BridgeResult<u128> {
    let digits = value.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16).map_err(|_| BridgeError::BadRpcResponse {
        expected: "hex quantity".to_string(),
    })
}

fn u64_from_hex_value(value: &Value) -> BridgeResult<u64> {
    value
        .as_str()
        .ok_or(BridgeError::BadRpcResponse {
            expected: "hex string".to_string(),
        })
        .and_then(u64_from_hex)
}

fn u128_from_hex_value(value: &Value) -> BridgeResult<u128> {
    value
        .as_str()
        .ok_or(BridgeError::BadRpcResponse {
            expected: "hex string".to_string(),
        })
        .and_then(u128_from_hex)
}

// --- observability / maintenance ---

#[derive(Clone, Debug, CandidType, Deserialize, Serialize)]
pub struct EndpointStats {
    pub url: String,
    pub healthy: bool,
    pub failure_count: u32,
    pub last_latency_ms: u64,
    pub cooldown_until: u64,
}

#[derive(Clone, Debug, CandidType, Deserialize, Serialize)]
pub struct RpcStats {
    pub chain_id: u64,
    pub cache_entries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hit_rate_percent: f64,
    pub last_seen_block: u64,
    pub endpoints: Vec<EndpointStats>,
}

pub fn stats(chain: &ChainConfig) -> RpcStats {
    with_runtime(chain, |rt| {
        let total = rt.hits + rt.misses;
        RpcStats {
            chain_id: rt.chain_id,
            cache_entries: rt.cache.len() as u64,
            cache_hits: rt.hits,
            cache_misses: rt.misses,
            hit_rate_percent: if total > 0 {
                rt.hits as f64 * 100.0 / total as f64
            } else {
                0.0
            },
            last_seen_block: rt.last_seen_block,
            endpoints: rt
                .endpoints
                .iter()
                .map(|e| EndpointStats {
                    url: e.url.clone(),
                    healthy: e.healthy,
                    failure_count: e.failure_count,
                    last_latency_ms: e.last_latency_ms,
                    cooldown_until: e.cooldown_until,
                })
                .collect(),
        }
    })
}

/// Drop every cached entry and drain the hit/miss counters so the caller
/// can roll them into the lifetime totals.
pub fn clear_cache(chain: &ChainConfig) -> (u64, u64) {
    with_runtime(chain, |rt| {
        rt.cache.clear();
        let drained = (rt.hits, rt.misses);
        rt.hits = 0;
        rt.misses = 0;
        drained
    })
}

pub fn invalidate_gas_cache(chain: &ChainConfig) {
    with_runtime(chain, |rt| {
        rt.invalidate_prefix("eth_feeHistory");
        rt.invalidate_prefix("eth_gasPrice");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RpcEndpointConfig;

    fn test_chain() -> ChainConfig {
        ChainConfig {
            name: "Base Sepolia".to_string(),
            chain_id: 84532,
            rpc_endpoints: vec![
                RpcEndpointConfig {
                    url: "https://a.example".to_string(),
                    weight: 3,
                },
                RpcEndpointConfig {
                    url: "https://b.example".to_string(),
                    weight: 2,
                },
                RpcEndpointConfig {
                    url: "https://c.example".to_string(),
                    weight: 1,
                },
            ],
        }
    }

    #[test]
    fn dispatch_prefers_weight_then_skips_cooling_endpoints() {
        let chain = test_chain();
        let mut rt = ChainRuntime::new(&chain);
        assert_eq!(rt.dispatch_order(100), vec![0, 1, 2]);

        rt.record_failure(0, 100);
        // Endpoint 0 cools down for 30 s and sorts as unhealthy afterwards.
        assert_eq!(rt.dispatch_order(101), vec![1, 2]);
        assert_eq!(rt.dispatch_order(131), vec![1, 2, 0]);
    }

    #[test]
    fn cooldown_grows_exponentially_up_to_cap() {
        let chain = test_chain();
        let mut rt = ChainRuntime::new(&chain);
        let mut previous = 0;
        for expected in [30, 60, 120, 240, 480, 600, 600] {
            rt.record_failure(1, 1_000);
            let cooldown = rt.endpoints[1].cooldown_until - 1_000;
            assert_eq!(cooldown, expected);
            assert!(cooldown >= previous);
            previous = cooldown;
        }
        rt.record_success(1, 12);
        assert_eq!(rt.endpoints[1].failure_count, 0);
        assert!(rt.endpoints[1].healthy);
    }

    #[test]
    fn cache_honours_ttl() {
        let chain = test_chain();
        let mut rt = ChainRuntime::new(&chain);
        rt.cache_put("k".to_string(), "v".to_string(), 15, 1_000);
        assert_eq!(rt.cache_get("k", 1_010), Some("v".to_string()));
        assert_eq!(rt.cache_get("k", 1_016), None);
        assert_eq!(rt.hits, 1);
        assert_eq!(rt.misses, 1);
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let chain = test_chain();
        let mut rt = ChainRuntime::new(&chain);
        for i in 0..MAX_CACHE_ENTRIES {
            rt.cache_put(format!("k{}", i), "v".to_string(), u64::MAX, i as u64);
        }
        // Touch k0 so k1 becomes the coldest entry.
        assert!(rt.cache_get("k0", 1_000_000).is_some());
        rt.cache_put("fresh".to_string(), "v".to_string(), u64::MAX, 1_000_001);
        assert_eq!(rt.cache.len(), MAX_CACHE_ENTRIES);
        assert!(rt.cache.contains_key("k0"));
        assert!(!rt.cache.contains_key("k1"));
        assert!(rt.cache.contains_key("fresh"));
    }

    #[test]
    fn json_rpc_error_classification() {
        let err = extract_result(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32005,"message":"limit exceeded"}}"#)
            .unwrap_err();
        assert_eq!(
            err,
            BridgeError::RpcError {
                code: -32005,
                message: "limit exceeded".to_string()
            }
        );
        assert!(err.is_transient());

        let ok = extract_result(r#"{"jsonrpc":"2.0","id":1,"result":"0x14a34"}"#).unwrap();
        assert_eq!(u64_from_hex_value(&ok).unwrap(), 84532);

        assert!(extract_result("not json").is_err());
        assert!(extract_result(r#"{"jsonrpc":"2.0","id":1}"#).is_err());
    }

    #[test]
    fn hex_quantity_parsing() {
        assert_eq!(u64_from_hex("0x0").unwrap(), 0);
        assert_eq!(u64_from_hex("0x").unwrap(), 0);
        assert_eq!(u64_from_hex("0x14a34").unwrap(), 84532);
        assert!(u64_from_hex("0xzz").is_err());
        assert_eq!(
            u128_from_hex("0xde0b6b3a7640000").unwrap(),
            1_000_000_000_000_000_000
        );
    }

    #[test]
    fn receipt_parsing() {
        let value: Value = serde_json::from_str(
            r#"{"transactionHash":"0xabc","blockNumber":"0x10","gasUsed":"0x5208",
                "effectiveGasPrice":"0x3b9aca00","status":"0x1"}"#,
        )
        .unwrap();
        let receipt = parse_receipt(&value).unwrap();
        assert_eq!(receipt.block_number, 16);
        assert_eq!(receipt.gas_used, 21_000);
        assert_eq!(receipt.effective_gas_price, 1_000_000_000);
        assert_eq!(receipt.status, 1);
    }
}
