//! Polymarket CLOB (Central Limit Order Book) access.
//!
//! [`OrderBookClient`] reads public order books and is enough to price
//! positions. [`ClobGateway`] adds an EIP-712 order signer on top of it and
//! exits positions with fill-or-kill sells.

use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alloy_primitives::{keccak256, Address, B256, U256};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::models::Side;

use super::{upstream_error, ExecutionGateway, SellFill, SellOrder};

type HmacSha256 = Hmac<Sha256>;

pub const CLOB_URL: &str = "https://clob.polymarket.com";

/// Polymarket CTF Exchange contract on Polygon
const CTF_EXCHANGE: &str = "0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Limit prices are rounded down to the default 0.01 tick.
const PRICE_DECIMALS: u32 = 2;

/// Orders expire an hour after signing.
const ORDER_TTL_SECS: u64 = 3600;

/// Order book level. Prices and sizes arrive as strings.
#[derive(Debug, Clone, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderBook {
    #[serde(default)]
    pub bids: Vec<BookLevel>,
    #[serde(default)]
    pub asks: Vec<BookLevel>,
}

impl OrderBook {
    /// Executable price for `side`: best bid when selling, best ask when buying.
    pub fn best_price(&self, side: Side) -> Option<Decimal> {
        let levels = self.levels(side).filter(|l| l.size > Decimal::ZERO);
        match side {
            Side::Sell => levels.map(|l| l.price).max(),
            Side::Buy => levels.map(|l| l.price).min(),
        }
    }

    fn levels(&self, side: Side) -> std::slice::Iter<'_, BookLevel> {
        match side {
            Side::Sell => self.bids.iter(),
            Side::Buy => self.asks.iter(),
        }
    }
}

/// Read-only client for public CLOB order books.
#[derive(Clone)]
pub struct OrderBookClient {
    http: Client,
    base_url: String,
}

impl OrderBookClient {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_base_url(CLOB_URL.to_string())
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(base_url: String) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { http, base_url })
    }

    pub async fn get_order_book(&self, token_id: &str) -> Result<OrderBook> {
        let url = format!("{}/book?token_id={}", self.base_url, token_id);
        debug!(token_id = %token_id, "Fetching order book");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Provider(format!("order book request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(upstream_error(status, &body));
        }

        Ok(response.json().await?)
    }

    pub async fn best_price(&self, token_id: &str, side: Side) -> Result<Option<Decimal>> {
        Ok(self.get_order_book(token_id).await?.best_price(side))
    }
}

/// CLOB API credentials.
#[derive(Clone)]
pub struct ClobCredentials {
    pub private_key: String,
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
    /// 137 for Polygon mainnet, 80002 for Amoy testnet
    pub chain_id: u64,
}

impl ClobCredentials {
    /// Read from environment variables:
    /// - POLYMARKET_PRIVATE_KEY
    /// - POLYMARKET_API_KEY
    /// - POLYMARKET_API_SECRET
    /// - POLYMARKET_API_PASSPHRASE
    /// - POLYMARKET_CHAIN_ID (defaults to 137)
    pub fn from_env() -> anyhow::Result<Self> {
        let var = |key: &str| std::env::var(key).with_context(|| format!("{} not set", key));

        Ok(Self {
            private_key: var("POLYMARKET_PRIVATE_KEY")?,
            api_key: var("POLYMARKET_API_KEY")?,
            api_secret: var("POLYMARKET_API_SECRET")?,
            api_passphrase: var("POLYMARKET_API_PASSPHRASE")?,
            chain_id: std::env::var("POLYMARKET_CHAIN_ID")
                .unwrap_or_else(|_| "137".to_string())
                .parse()
                .context("Invalid POLYMARKET_CHAIN_ID")?,
        })
    }
}

/// Order fields covered by the EIP-712 signature.
#[derive(Debug, Clone)]
struct OrderTerms {
    salt: U256,
    maker: Address,
    signer: Address,
    taker: Address,
    token_id: U256,
    maker_amount: U256,
    taker_amount: U256,
    expiration: U256,
    nonce: U256,
    fee_rate_bps: U256,
    side: u8,
    signature_type: u8,
}

impl OrderTerms {
    fn struct_hash(&self) -> B256 {
        let type_hash = keccak256(
            b"Order(uint256 salt,address maker,address signer,address taker,uint256 tokenId,uint256 makerAmount,uint256 takerAmount,uint256 expiration,uint256 nonce,uint256 feeRateBps,uint8 side,uint8 signatureType)",
        );

        let words: [B256; 13] = [
            type_hash,
            word(self.salt),
            self.maker.into_word(),
            self.signer.into_word(),
            self.taker.into_word(),
            word(self.token_id),
            word(self.maker_amount),
            word(self.taker_amount),
            word(self.expiration),
            word(self.nonce),
            word(self.fee_rate_bps),
            word(U256::from(self.side)),
            word(U256::from(self.signature_type)),
        ];
        hash_words(&words)
    }
}

fn domain_separator(chain_id: u64, exchange: Address) -> B256 {
    let words: [B256; 5] = [
        keccak256(b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)"),
        keccak256(b"Polymarket CTF Exchange"),
        keccak256(b"1"),
        word(U256::from(chain_id)),
        exchange.into_word(),
    ];
    hash_words(&words)
}

fn word(value: U256) -> B256 {
    B256::from(value.to_be_bytes::<32>())
}

fn hash_words(words: &[B256]) -> B256 {
    let encoded: Vec<u8> = words.iter().flat_map(|w| w.as_slice().iter().copied()).collect();
    keccak256(encoded)
}

/// Amount in 6-decimal base units (USDC and outcome shares), truncated.
fn to_base_units(amount: Decimal) -> U256 {
    let units = (amount * Decimal::from(1_000_000u64)).trunc();
    U256::from(units.to_u128().unwrap_or(0))
}

fn random_u256() -> U256 {
    U256::from(uuid::Uuid::new_v4().as_u128())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignedOrder {
    salt: String,
    maker: String,
    signer: String,
    taker: String,
    token_id: String,
    maker_amount: String,
    taker_amount: String,
    side: &'static str,
    expiration: String,
    nonce: String,
    fee_rate_bps: String,
    signature_type: u8,
    signature: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderPayload {
    order: SignedOrder,
    owner: String,
    order_type: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    #[serde(default)]
    success: bool,
    #[serde(default, alias = "orderID")]
    order_id: Option<String>,
    #[serde(default)]
    error_msg: String,
}

/// Live execution gateway: order-book prices and signed FOK sells.
pub struct ClobGateway {
    book: OrderBookClient,
    http: Client,
    signer: PrivateKeySigner,
    credentials: ClobCredentials,
    exchange: Address,
}

impl ClobGateway {
    pub fn new(book: OrderBookClient, credentials: ClobCredentials) -> anyhow::Result<Self> {
        let key = credentials
            .private_key
            .strip_prefix("0x")
            .unwrap_or(&credentials.private_key);
        let signer = PrivateKeySigner::from_str(key).context("Invalid private key")?;
        let exchange = Address::from_str(CTF_EXCHANGE).context("Invalid exchange address")?;

        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        info!(address = %signer.address(), chain_id = credentials.chain_id, "CLOB gateway ready");

        Ok(Self {
            book,
            http,
            signer,
            credentials,
            exchange,
        })
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Sign a sell of `shares` at `price` per share.
    async fn sign_sell(&self, token_id: &str, shares: Decimal, price: Decimal) -> Result<SignedOrder> {
        let token = U256::from_str(token_id)
            .map_err(|_| EngineError::DataInconsistency(format!("token id {} is not numeric", token_id)))?;
        let expiration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() + ORDER_TTL_SECS)
            .unwrap_or(ORDER_TTL_SECS);

        // Selling: we give shares and receive USDC.
        let terms = OrderTerms {
            salt: random_u256(),
            maker: self.address(),
            signer: self.address(),
            taker: Address::ZERO,
            token_id: token,
            maker_amount: to_base_units(shares),
            taker_amount: to_base_units(shares * price),
            expiration: U256::from(expiration),
            nonce: U256::ZERO,
            fee_rate_bps: U256::ZERO,
            side: 1,
            signature_type: 0,
        };

        let domain = domain_separator(self.credentials.chain_id, self.exchange);
        let digest = keccak256([&[0x19, 0x01][..], domain.as_slice(), terms.struct_hash().as_slice()].concat());
        let signature = self
            .signer
            .sign_hash(&digest)
            .await
            .map_err(|e| EngineError::Execution(format!("failed to sign order: {}", e)))?;

        Ok(SignedOrder {
            salt: terms.salt.to_string(),
            maker: terms.maker.to_string(),
            signer: terms.signer.to_string(),
            taker: terms.taker.to_string(),
            token_id: token_id.to_string(),
            maker_amount: terms.maker_amount.to_string(),
            taker_amount: terms.taker_amount.to_string(),
            side: "SELL",
            expiration: terms.expiration.to_string(),
            nonce: terms.nonce.to_string(),
            fee_rate_bps: terms.fee_rate_bps.to_string(),
            signature_type: terms.signature_type,
            signature: format!("0x{}", hex::encode(signature.as_bytes())),
        })
    }

    fn auth_headers(&self, method: &str, path: &str, body: &str) -> Result<HeaderMap> {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = l2_signature(&self.credentials.api_secret, &timestamp, method, path, body)?;

        let mut headers = HeaderMap::new();
        for (name, value) in [
            ("poly-address", self.address().to_string()),
            ("poly-signature", signature),
            ("poly-timestamp", timestamp),
            ("poly-api-key", self.credentials.api_key.clone()),
            ("poly-passphrase", self.credentials.api_passphrase.clone()),
        ] {
            let value = HeaderValue::from_str(&value)
                .map_err(|_| EngineError::Execution(format!("invalid {} header", name)))?;
            headers.insert(HeaderName::from_static(name), value);
        }
        Ok(headers)
    }
}

/// FOK limit for a sell, from the bid the risk engine already read through the
/// shared limiter. Rounded down to the tick.
fn order_price(order: &SellOrder) -> Result<Decimal> {
    let price = order
        .limit_price()
        .round_dp_with_strategy(PRICE_DECIMALS, RoundingStrategy::ToZero);
    if price <= Decimal::ZERO {
        return Err(EngineError::Execution(format!("limit price {} is not tradable", price)));
    }
    Ok(price)
}

/// L2 request signature: base64url HMAC-SHA256 of timestamp, method, path and
/// body, keyed with the base64url-decoded API secret.
fn l2_signature(secret: &str, timestamp: &str, method: &str, path: &str, body: &str) -> Result<String> {
    let key = URL_SAFE
        .decode(secret)
        .map_err(|e| EngineError::Execution(format!("API secret is not base64: {}", e)))?;
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| EngineError::Execution(format!("HMAC error: {}", e)))?;
    mac.update(timestamp.as_bytes());
    mac.update(method.as_bytes());
    mac.update(path.as_bytes());
    mac.update(body.as_bytes());
    Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
}

#[async_trait]
impl ExecutionGateway for ClobGateway {
    async fn get_price(&self, instrument_id: &str, side: Side) -> Result<Option<Decimal>> {
        self.book.best_price(instrument_id, side).await
    }

    async fn sell(&self, order: &SellOrder) -> Result<SellFill> {
        let price = order_price(order)?;

        let payload = OrderPayload {
            order: self.sign_sell(&order.instrument_id, order.shares, price).await?,
            owner: self.credentials.api_key.clone(),
            order_type: "FOK",
        };
        // The body is signed, so it goes out byte for byte as serialized here.
        let body = serde_json::to_string(&payload)?;

        let response = self
            .http
            .post(format!("{}/order", self.book.base_url))
            .headers(self.auth_headers("POST", "/order", &body)?)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| EngineError::Execution(format!("order submission failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(EngineError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Execution(format!("order rejected: {} - {}", status, body)));
        }

        let placed: OrderResponse = response.json().await?;
        if !placed.success {
            return Err(EngineError::Execution(placed.error_msg));
        }

        info!(
            position_id = order.position_id,
            order_id = ?placed.order_id,
            shares = %order.shares,
            price = %price,
            "Sell order filled"
        );

        Ok(SellFill {
            realized_pnl: (price - order.entry_price) * order.shares,
            fill_price: price,
            order_id: placed.order_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn level(price: Decimal, size: Decimal) -> BookLevel {
        BookLevel { price, size }
    }

    #[test]
    fn test_best_price_ignores_ordering_and_empty_levels() {
        let book = OrderBook {
            bids: vec![level(dec!(0.40), dec!(10)), level(dec!(0.45), dec!(5)), level(dec!(0.47), dec!(0))],
            asks: vec![level(dec!(0.52), dec!(10)), level(dec!(0.50), dec!(3))],
        };
        assert_eq!(book.best_price(Side::Sell), Some(dec!(0.45)));
        assert_eq!(book.best_price(Side::Buy), Some(dec!(0.50)));
        assert_eq!(OrderBook::default().best_price(Side::Sell), None);
    }

    #[test]
    fn test_order_book_parses_string_levels() {
        let book: OrderBook = serde_json::from_str(
            r#"{"market":"0x1","bids":[{"price":"0.48","size":"120.5"}],"asks":[],"hash":"h"}"#,
        )
        .unwrap();
        assert_eq!(book.best_price(Side::Sell), Some(dec!(0.48)));
        assert_eq!(book.best_price(Side::Buy), None);
    }

    #[test]
    fn test_to_base_units_truncates() {
        assert_eq!(to_base_units(dec!(100.5)), U256::from(100_500_000u64));
        assert_eq!(to_base_units(dec!(0.0000019)), U256::from(1u64));
    }

    #[test]
    fn test_struct_hash_depends_on_every_amount() {
        let terms = OrderTerms {
            salt: U256::from(1u64),
            maker: Address::ZERO,
            signer: Address::ZERO,
            taker: Address::ZERO,
            token_id: U256::from(42u64),
            maker_amount: U256::from(1_000_000u64),
            taker_amount: U256::from(500_000u64),
            expiration: U256::ZERO,
            nonce: U256::ZERO,
            fee_rate_bps: U256::ZERO,
            side: 1,
            signature_type: 0,
        };
        let mut cheaper = terms.clone();
        cheaper.taker_amount = U256::from(400_000u64);

        assert_eq!(terms.struct_hash(), terms.clone().struct_hash());
        assert_ne!(terms.struct_hash(), cheaper.struct_hash());
    }

    fn sell_order(reference_price: Decimal, max_slippage: Decimal) -> SellOrder {
        SellOrder {
            position_id: 1,
            instrument_id: "12345".to_string(),
            market: "mkt".to_string(),
            shares: dec!(10),
            entry_price: dec!(0.40),
            reference_price,
            slippage: crate::trading::SlippageClass::Aggressive,
            max_slippage,
        }
    }

    #[test]
    fn test_order_price_from_reference_bid() {
        assert_eq!(order_price(&sell_order(dec!(0.57), dec!(0.01))).unwrap(), dec!(0.56));
        assert_eq!(order_price(&sell_order(dec!(0.50), dec!(0.002))).unwrap(), dec!(0.49));
        assert!(matches!(
            order_price(&sell_order(dec!(0.005), dec!(0.01))),
            Err(EngineError::Execution(_))
        ));
    }

    #[test]
    fn test_l2_signature_matches_reference_hmac() {
        let secret = "cG9seWd1YXJkLXRlc3Qtc2VjcmV0LTAxMjM0NTY3ODk=";
        assert_eq!(
            l2_signature(secret, "1700000000", "POST", "/order", r#"{"orderType":"FOK"}"#).unwrap(),
            "ee4X-TIllZtDYm89SVRPAg2kUGi6BesI3J6JFHiro_k="
        );
        assert_eq!(
            l2_signature(secret, "1700000000", "GET", "/orders", "").unwrap(),
            "JH9FX5lFzWoXfEXoxfMLAoeP8Ikvh_yb19StbdngWDo="
        );
        assert!(matches!(
            l2_signature("not base64!", "1", "GET", "/", ""),
            Err(EngineError::Execution(_))
        ));
    }

    #[test]
    fn test_domain_separator_is_chain_specific() {
        let exchange = Address::from_str(CTF_EXCHANGE).unwrap();
        assert_ne!(domain_separator(137, exchange), domain_separator(80002, exchange));
    }

    #[tokio::test]
    async fn test_sign_sell_produces_full_signature() {
        let gateway = ClobGateway::new(
            OrderBookClient::new().unwrap(),
            ClobCredentials {
                private_key: format!("0x{}", "11".repeat(32)),
                api_key: "key".to_string(),
                api_secret: "secret".to_string(),
                api_passphrase: "pass".to_string(),
                chain_id: 137,
            },
        )
        .unwrap();

        let signed = gateway.sign_sell("12345", dec!(10), dec!(0.45)).await.unwrap();
        assert_eq!(signed.maker_amount, "10000000");
        assert_eq!(signed.taker_amount, "4500000");
        assert_eq!(signed.side, "SELL");
        assert_eq!(signed.signature.len(), 2 + 65 * 2);

        assert!(matches!(
            gateway.sign_sell("not-a-token", dec!(1), dec!(0.5)).await,
            Err(EngineError::DataInconsistency(_))
        ));
    }
}
