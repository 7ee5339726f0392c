//! USD price aggregation for the source token (ICP) and ETH. Two public
//! sources per asset, fetched concurrently; the freshest highest-confidence
//! sample wins, and quotes are refused on stale data.

use std::cell::RefCell;
use std::collections::BTreeMap;

use candid::CandidType;
use ic_cdk::api::management_canister::http_request::{
    http_request, CanisterHttpRequestArgument, HttpHeader, HttpMethod, HttpResponse,
    TransformArgs, TransformContext,
};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

pub const ASSET_ICP: &str = "ICP";
pub const ASSET_ETH: &str = "ETH";

/// Samples older than this never back a quote.
const FRESH_WINDOW_SECONDS: u64 = 60;
/// Feed-internal cache: no refetch while the best sample is younger.
const CACHE_TTL_SECONDS: u64 = 30;
const HTTP_CYCLES: u128 = 30_000_000_000;
const MAX_RESPONSE_BYTES: u64 = 8 * 1024;

#[derive(Clone, Debug, CandidType, Deserialize, Serialize)]
pub struct PriceSample {
    pub asset: String,
    pub source_name: String,
    pub price_usd: f64,
    pub confidence: f64,
    pub fetched_at: u64,
}

#[derive(Clone, Debug, CandidType, Deserialize, Serialize)]
pub struct PriceData {
    pub asset: String,
    pub price_usd: f64,
    pub source_name: String,
    pub fetched_at: u64,
    pub stale: bool,
}

#[derive(Clone, Debug, CandidType, Deserialize, Serialize)]
pub struct PriceFeedStatus {
    pub icp: Option<PriceData>,
    pub eth: Option<PriceData>,
    pub samples: Vec<PriceSample>,
}

thread_local! {
    // (asset, source) -> latest sample
    static SAMPLES: RefCell<BTreeMap<(String, String), PriceSample>> =
        RefCell::new(BTreeMap::new());
}

/// Pick the best sample for an asset: max confidence among samples fresher
/// than 60 s, latest fetch breaking ties; otherwise the newest sample of any
/// age, flagged stale.
pub fn best_sample(samples: &[PriceSample], asset: &str, now: u64) -> Option<PriceData> {
    let of_asset: Vec<&PriceSample> = samples.iter().filter(|s| s.asset == asset).collect();
    let fresh = of_asset
        .iter()
        .filter(|s| now.saturating_sub(s.fetched_at) < FRESH_WINDOW_SECONDS)
        .max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.fetched_at.cmp(&b.fetched_at))
        });
    if let Some(sample) = fresh {
        return Some(PriceData {
            asset: sample.asset.clone(),
            price_usd: sample.price_usd,
            source_name: sample.source_name.clone(),
            fetched_at: sample.fetched_at,
            stale: false,
        });
    }
    of_asset
        .iter()
        .max_by_key(|s| s.fetched_at)
        .map(|sample| PriceData {
            asset: sample.asset.clone(),
            price_usd: sample.price_usd,
            source_name: sample.source_name.clone(),
            fetched_at: sample.fetched_at,
            stale: true,
        })
}

fn all_samples() -> Vec<PriceSample> {
    SAMPLES.with(|cell| cell.borrow().values().cloned().collect())
}

fn store_sample(sample: PriceSample) {
    SAMPLES.with(|cell| {
        cell.borrow_mut()
            .insert((sample.asset.clone(), sample.source_name.clone()), sample);
    });
}

fn needs_refresh(now: u64) -> bool {
    let samples = all_samples();
    for asset in [ASSET_ICP, ASSET_ETH] {
        let youngest = samples
            .iter()
            .filter(|s| s.asset == asset)
            .map(|s| now.saturating_sub(s.fetched_at))
            .min();
        match youngest {
            Some(age) if age < CACHE_TTL_SECONDS => {}
            _ => return true,
        }
    }
    false
}

fn now_sec() -> u64 {
    ic_cdk::api::time() / 1_000_000_000
}

/// Strip response headers so HTTPS-outcall consensus only sees the body.
#[ic_cdk::query]
fn price_transform(raw: TransformArgs) -> HttpResponse {
    HttpResponse {
        status: raw.response.status,
        headers: Vec::new(),
        body: raw.response.body,
    }
}

async fn http_get(url: &str) -> BridgeResult<String> {
    let request = CanisterHttpRequestArgument {
        url: url.to_string(),
        method: HttpMethod::GET,
        body: None,
        max_response_bytes: Some(MAX_RESPONSE_BYTES),
        transform: Some(TransformContext::from_name(
            "price_transform".to_string(),
            vec![],
        )),
        headers: vec![HttpHeader {
            name: "Accept".to_string(),
            value: "application/json".to_string(),
        }],
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
                    message: format!("price source http {}", response.status),
                })
            }
        }
        Err((_, message)) => Err(BridgeError::RpcError {
            code: -32000,
            message,
        }),
    }
}

#[derive(Debug, Deserialize)]
struct CoinGeckoResponse {
    #[serde(rename = "internet-computer")]
    internet_computer: CoinGeckoPrice,
    ethereum: CoinGeckoPrice,
}

#[derive(Debug, Deserialize)]
struct CoinGeckoPrice {
    usd: f64,
}

pub fn parse_coingecko(body: &str) -> BridgeResult<(f64, f64)> {
    let parsed: CoinGeckoResponse =
        serde_json::from_str(body).map_err(|_| BridgeError::BadRpcResponse {
            expected: "coingecko price body".to_string(),
        })?;
    Ok((parsed.internet_computer.usd, parsed.ethereum.usd))
}

#[derive(Debug, Deserialize)]
struct CoinPaprikaResponse {
    quotes: CoinPaprikaQuotes,
}

#[derive(Debug, Deserialize)]
struct CoinPaprikaQuotes {
    #[serde(rename = "USD")]
    usd: CoinPaprikaPrice,
}

#[derive(Debug, Deserialize)]
struct CoinPaprikaPrice {
    price: f64,
}

pub fn parse_coinpaprika(body: &str) -> BridgeResult<f64> {
    let parsed: CoinPaprikaResponse =
        serde_json::from_str(body).map_err(|_| BridgeError::BadRpcResponse {
            expected: "coinpaprika ticker body".to_string(),
        })?;
    Ok(parsed.quotes.usd.price)
}

async fn fetch_coingecko() -> BridgeResult<(f64, f64)> {
    let body = http_get(
        "https://api.coingecko.com/api/v3/simple/price?ids=internet-computer,ethereum&vs_currencies=usd",
    )
    .await?;
    parse_coingecko(&body)
}

async fn fetch_coinpaprika(ticker: &str) -> BridgeResult<f64> {
    let body = http_get(&format!(
        "https://api.coinpaprika.com/v1/tickers/{}?quotes=USD",
        ticker
    ))
    .await?;
    parse_coinpaprika(&body)
}

/// Refresh all sources concurrently when the cache has gone cold. Individual
/// source failures are tolerated; aggregation copes with what arrived.
pub async fn refresh() {
    let now = now_sec();
    if !needs_refresh(now) {
        return;
    }

    let (gecko, paprika_icp, paprika_eth) = futures::join!(
        fetch_coingecko(),
        fetch_coinpaprika("icp-internet-computer"),
        fetch_coinpaprika("eth-ethereum"),
    );
    let fetched_at = now_sec();

    match gecko {
        Ok((icp_usd, eth_usd)) => {
            store_sample(PriceSample {
                asset: ASSET_ICP.to_string(),
                source_name: "CoinGecko".to_string(),
                price_usd: icp_usd,
                confidence: 0.9,
                fetched_at,
            });
            store_sample(PriceSample {
                asset: ASSET_ETH.to_string(),
                source_name: "CoinGecko".to_string(),
                price_usd: eth_usd,
                confidence: 0.9,
                fetched_at,
            });
        }
        Err(err) => ic_cdk::println!("price: coingecko fetch failed: {}", err),
    }
    match paprika_icp {
        Ok(price_usd) => store_sample(PriceSample {
            asset: ASSET_ICP.to_string(),
            source_name: "CoinPaprika".to_string(),
            price_usd,
            confidence: 0.8,
            fetched_at,
        }),
        Err(err) => ic_cdk::println!("price: coinpaprika ICP fetch failed: {}", err),
    }
    match paprika_eth {
        Ok(price_usd) => store_sample(PriceSample {
            asset: ASSET_ETH.to_string(),
            source_name: "CoinPaprika".to_string(),
            price_usd,
            confidence: 0.8,
            fetched_at,
        }),
        Err(err) => ic_cdk::println!("price: coinpaprika ETH fetch failed: {}", err),
    }
}

/// Fresh (ICP, ETH) USD prices for quoting. Stale or missing samples refuse
/// the quote; settlements already in flight are unaffected.
pub async fn fresh_pair() -> BridgeResult<(f64, f64)> {
    refresh().await;
    let now = now_sec();
    let samples = all_samples();
    let icp = require_fresh(&samples, ASSET_ICP, now)?;
    let eth = require_fresh(&samples, ASSET_ETH, now)?;
    Ok((icp.price_usd, eth.price_usd))
}

pub fn require_fresh(
    samples: &[PriceSample],
    asset: &str,
    now: u64,
) -> BridgeResult<PriceData> {
    match best_sample(samples, asset, now) {
        Some(data) if !data.stale => Ok(data),
        Some(data) => Err(BridgeError::PriceStale {
            asset: asset.to_string(),
            age_seconds: now.saturating_sub(data.fetched_at),
        }),
        None => Err(BridgeError::PriceUnavailable {
            asset: asset.to_string(),
        }),
    }
}

pub fn feed_status() -> PriceFeedStatus {
    let samples = all_samples();
    let now = now_sec();
    PriceFeedStatus {
        icp: best_sample(&samples, ASSET_ICP, now),
        eth: best_sample(&samples, ASSET_ETH, now),
        samples,
    }
}
