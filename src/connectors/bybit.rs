// src/connectors/bybit.rs
use crate::config::ExchangeConfig;
use crate::connectors::rate_limiter::RequestQueue;
use crate::connectors::retry::{with_retry, RetryPolicy};
use crate::connectors::signing::{self, CanonicalParams};
use crate::connectors::traits::ExchangeAdapter;
use crate::error::{ExchangeError, ExchangeResult};
use crate::types::{
    InstrumentRules, MarketOrder, OrderResponse, Protection, RemotePosition, Side,
};
use crate::utils::precision::{normalize_price, normalize_quantity};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

const CATEGORY: &str = "linear";
const SETTLE_COIN: &str = "USDT";

/// retCodes meaning "already in the requested state".
const NOT_MODIFIED_CODES: [i64; 2] = [34040, 110043];

/// orderLinkId already used: an earlier attempt of the same order was accepted.
const DUPLICATE_LINK_ID: i64 = 110072;

/// Bybit v5 unified-account client for USDT linear perpetuals.
pub struct BybitClient {
    api_key: String,
    secret_key: String,
    http_client: Client,
    base_rest_url: Url,
    recv_window: u64,
    queue: RequestQueue,
    retry: RetryPolicy,
    rules: RwLock<HashMap<String, InstrumentRules>>,
}

impl BybitClient {
    pub fn new(cfg: &ExchangeConfig) -> ExchangeResult<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| ExchangeError::Network(format!("failed to build HTTP client: {e}")))?;
        let base_rest_url = Url::parse(&cfg.base_url).map_err(|e| {
            ExchangeError::InvalidParameters(format!("bad base url {}: {e}", cfg.base_url))
        })?;

        Ok(Self {
            api_key: cfg.api_key.clone(),
            secret_key: cfg.secret_key.clone(),
            http_client,
            base_rest_url,
            recv_window: cfg.recv_window_ms,
            queue: RequestQueue::new(cfg.max_concurrent, Duration::from_millis(cfg.min_interval_ms)),
            retry: RetryPolicy::from(&cfg.retry),
            rules: RwLock::new(HashMap::new()),
        })
    }

    /// Signs, rate-limits and retries one call. Returns the `result` object of the envelope.
    pub async fn sign_and_send(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(&str, Value)],
    ) -> ExchangeResult<Value> {
        let params = signing::canonicalize(params);
        let label = format!("{method} {endpoint}");
        with_retry(&self.retry, &label, || self.send_once(&method, endpoint, &params)).await
    }

    async fn send_once(
        &self,
        method: &Method,
        endpoint: &str,
        params: &CanonicalParams,
    ) -> ExchangeResult<Value> {
        let _permit = self.queue.acquire().await?;

        let is_get = *method == Method::GET;
        let payload = if is_get {
            signing::query_string(params)
                .map_err(|e| ExchangeError::InvalidParameters(e.to_string()))?
        } else {
            signing::json_body(params)?
        };

        let timestamp = Utc::now().timestamp_millis();
        let signature = signing::sign(
            &self.secret_key,
            timestamp,
            &self.api_key,
            self.recv_window,
            &payload,
        )
        .map_err(|_| ExchangeError::Authentication("invalid secret key length".to_string()))?;

        let mut url = self
            .base_rest_url
            .join(endpoint)
            .map_err(|e| ExchangeError::InvalidParameters(format!("bad endpoint {endpoint}: {e}")))?;
        if is_get && !payload.is_empty() {
            url.set_query(Some(&payload));
        }

        debug!("{} {}", method, url);

        let mut request = self
            .http_client
            .request(method.clone(), url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", self.recv_window.to_string())
            .header("X-BAPI-SIGN", signature);
        if !is_get {
            request = request
                .header("Content-Type", "application/json")
                .body(payload);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ExchangeError::from_status(status.as_u16(), text));
        }

        let body: Value = response.json().await?;
        let code = body.get("retCode").and_then(Value::as_i64).unwrap_or(-1);
        let message = body
            .get("retMsg")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if code == 0 || NOT_MODIFIED_CODES.contains(&code) {
            Ok(body.get("result").cloned().unwrap_or(Value::Null))
        } else {
            Err(ExchangeError::from_ret_code(code, message))
        }
    }

    fn first_entry(result: &Value, what: &str) -> ExchangeResult<Value> {
        result
            .get("list")
            .and_then(Value::as_array)
            .and_then(|l| l.first())
            .cloned()
            .ok_or_else(|| ExchangeError::Unexpected(format!("empty list in {what} response")))
    }
}

fn is_duplicate_link(err: &ExchangeError) -> bool {
    match err {
        ExchangeError::Rejected { code, .. } => *code == DUPLICATE_LINK_ID,
        ExchangeError::Exhausted { last, .. } => is_duplicate_link(last),
        _ => false,
    }
}

fn decimal_field(v: &Value, key: &str) -> Option<Decimal> {
    v.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .and_then(|s| Decimal::from_str(s).ok())
}

fn parse_position(v: &Value) -> Option<RemotePosition> {
    let side = match v.get("side").and_then(Value::as_str)? {
        "Buy" => Side::Long,
        "Sell" => Side::Short,
        _ => return None,
    };
    let size = decimal_field(v, "size")?;
    if size.is_zero() {
        return None;
    }
    let non_zero = |d: Option<Decimal>| d.filter(|p| !p.is_zero());

    Some(RemotePosition {
        symbol: v.get("symbol").and_then(Value::as_str)?.to_string(),
        side,
        size,
        entry_price: decimal_field(v, "avgPrice").unwrap_or_default(),
        mark_price: decimal_field(v, "markPrice").unwrap_or_default(),
        unrealized_pnl: decimal_field(v, "unrealisedPnl").unwrap_or_default(),
        leverage: decimal_field(v, "leverage")
            .and_then(|l| l.trunc().to_u32())
            .unwrap_or(1),
        stop_loss: non_zero(decimal_field(v, "stopLoss")),
        take_profit: non_zero(decimal_field(v, "takeProfit")),
    })
}

#[async_trait]
impl ExchangeAdapter for BybitClient {
    fn name(&self) -> &str {
        "bybit"
    }

    async fn positions(&self) -> ExchangeResult<Vec<RemotePosition>> {
        let result = self
            .sign_and_send(
                Method::GET,
                "/v5/position/list",
                &[("category", json!(CATEGORY)), ("settleCoin", json!(SETTLE_COIN))],
            )
            .await?;

        let list = result
            .get("list")
            .and_then(Value::as_array)
            .ok_or_else(|| ExchangeError::Unexpected("position list missing".to_string()))?;

        Ok(list.iter().filter_map(parse_position).collect())
    }

    async fn last_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        let result = self
            .sign_and_send(
                Method::GET,
                "/v5/market/tickers",
                &[("category", json!(CATEGORY)), ("symbol", json!(symbol))],
            )
            .await?;
        let ticker = Self::first_entry(&result, "ticker")?;
        decimal_field(&ticker, "lastPrice")
            .ok_or_else(|| ExchangeError::Unexpected(format!("no lastPrice for {symbol}")))
    }

    async fn instrument_rules(&self, symbol: &str) -> ExchangeResult<InstrumentRules> {
        if let Some(rules) = self.rules.read().await.get(symbol) {
            return Ok(rules.clone());
        }

        let result = self
            .sign_and_send(
                Method::GET,
                "/v5/market/instruments-info",
                &[("category", json!(CATEGORY)), ("symbol", json!(symbol))],
            )
            .await?;
        let info = Self::first_entry(&result, "instrument")?;
        let lot = info.get("lotSizeFilter").cloned().unwrap_or(Value::Null);
        let price = info.get("priceFilter").cloned().unwrap_or(Value::Null);

        let rules = InstrumentRules {
            symbol: symbol.to_string(),
            qty_step: decimal_field(&lot, "qtyStep")
                .ok_or_else(|| ExchangeError::Unexpected(format!("no qtyStep for {symbol}")))?,
            tick_size: decimal_field(&price, "tickSize")
                .ok_or_else(|| ExchangeError::Unexpected(format!("no tickSize for {symbol}")))?,
            min_qty: decimal_field(&lot, "minOrderQty").unwrap_or_default(),
        };

        self.rules
            .write()
            .await
            .insert(symbol.to_string(), rules.clone());
        Ok(rules)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        self.sign_and_send(
            Method::POST,
            "/v5/position/set-leverage",
            &[
                ("category", json!(CATEGORY)),
                ("symbol", json!(symbol)),
                ("buyLeverage", json!(leverage.to_string())),
                ("sellLeverage", json!(leverage.to_string())),
            ],
        )
        .await?;
        Ok(())
    }

    async fn place_market_order(&self, order: &MarketOrder) -> ExchangeResult<OrderResponse> {
        let rules = self.instrument_rules(&order.symbol).await?;
        let qty = normalize_quantity(order.quantity, rules.qty_step);
        if qty.is_zero() || qty < rules.min_qty {
            return Err(ExchangeError::InstrumentRule(format!(
                "quantity {} rounds below minimum {} for {}",
                order.quantity, rules.min_qty, order.symbol
            )));
        }

        // one link id for every retry of this order so the exchange drops replays
        let link_id = Uuid::new_v4().simple().to_string();
        info!(
            "🚀 Sending Order: {} {} {} (reduce_only={}, link={})",
            order.side.as_str(),
            qty,
            order.symbol,
            order.reduce_only,
            link_id
        );

        let sent = self
            .sign_and_send(
                Method::POST,
                "/v5/order/create",
                &[
                    ("category", json!(CATEGORY)),
                    ("symbol", json!(order.symbol)),
                    ("side", json!(order.side.as_str())),
                    ("orderType", json!("Market")),
                    ("qty", json!(qty.to_string())),
                    ("reduceOnly", json!(order.reduce_only)),
                    ("orderLinkId", json!(link_id)),
                ],
            )
            .await;

        let id = match sent {
            Ok(result) => result
                .get("orderId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            Err(e) if is_duplicate_link(&e) => {
                warn!("Order {} already accepted on an earlier attempt", link_id);
                link_id
            }
            Err(e) => return Err(e),
        };

        Ok(OrderResponse {
            id,
            symbol: order.symbol.clone(),
            status: "submitted".to_string(),
        })
    }

    async fn set_protection(
        &self,
        symbol: &str,
        side: Side,
        protection: Protection,
    ) -> ExchangeResult<()> {
        let rules = self.instrument_rules(symbol).await?;
        let mut params = vec![
            ("category", json!(CATEGORY)),
            ("symbol", json!(symbol)),
            ("positionIdx", json!(0)),
            ("tpslMode", json!("Full")),
        ];
        if let Some(sl) = protection.stop_loss {
            params.push(("stopLoss", json!(normalize_price(sl, rules.tick_size).to_string())));
        }
        if let Some(tp) = protection.take_profit {
            params.push(("takeProfit", json!(normalize_price(tp, rules.tick_size).to_string())));
        }

        info!(
            "🛡️ Setting protection on {} {}: sl={:?} tp={:?}",
            side, symbol, protection.stop_loss, protection.take_profit
        );

        self.sign_and_send(Method::POST, "/v5/position/trading-stop", &params)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> BybitClient {
        let cfg = ExchangeConfig {
            api_key: "key".to_string(),
            secret_key: "secret".to_string(),
            base_url: server.uri(),
            min_interval_ms: 0,
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 5,
                unknown_delay_multiplier: 1,
            },
            ..ExchangeConfig::default()
        };
        BybitClient::new(&cfg).unwrap()
    }

    fn ok(result: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "retCode": 0,
            "retMsg": "OK",
            "result": result,
        }))
    }

    fn instruments() -> Value {
        json!({"list": [{
            "symbol": "BTCUSDT",
            "lotSizeFilter": {"qtyStep": "0.001", "minOrderQty": "0.001"},
            "priceFilter": {"tickSize": "0.10"}
        }]})
    }

    #[tokio::test]
    async fn positions_are_signed_and_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v5/position/list"))
            .and(query_param("category", "linear"))
            .and(header_exists("X-BAPI-SIGN"))
            .and(header_exists("X-BAPI-TIMESTAMP"))
            .respond_with(ok(json!({"list": [
                {"symbol": "BTCUSDT", "side": "Buy", "size": "0.010", "avgPrice": "50000",
                 "markPrice": "50500", "unrealisedPnl": "5", "leverage": "10",
                 "stopLoss": "49000", "takeProfit": ""},
                {"symbol": "ETHUSDT", "side": "", "size": "0", "avgPrice": "0",
                 "markPrice": "3000", "unrealisedPnl": "0", "leverage": "10",
                 "stopLoss": "", "takeProfit": ""}
            ]})))
            .expect(1)
            .mount(&server)
            .await;

        let positions = client(&server).positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        let p = &positions[0];
        assert_eq!(p.side, Side::Long);
        assert_eq!(p.size, dec!(0.01));
        assert_eq!(p.leverage, 10);
        assert!(p.has_stop_loss());
        assert!(!p.has_take_profit());
    }

    #[tokio::test]
    async fn rate_limited_calls_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v5/market/tickers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "retCode": 10006, "retMsg": "Too many visits!", "result": {}
            })))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v5/market/tickers"))
            .respond_with(ok(json!({"list": [{"symbol": "BTCUSDT", "lastPrice": "50123.5"}]})))
            .with_priority(2)
            .mount(&server)
            .await;

        let price = client(&server).last_price("BTCUSDT").await.unwrap();
        assert_eq!(price, dec!(50123.5));
    }

    #[tokio::test]
    async fn trade_faults_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v5/market/instruments-info"))
            .respond_with(ok(instruments()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v5/order/create"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "retCode": 110007, "retMsg": "ab not enough for new order", "result": {}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let order = MarketOrder {
            symbol: "BTCUSDT".to_string(),
            side: crate::types::OrderSide::Buy,
            quantity: dec!(0.0105),
            reduce_only: false,
        };
        let err = client(&server).place_market_order(&order).await.unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientBalance(_)));
    }

    fn link_id(request: &wiremock::Request) -> String {
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        body["orderLinkId"].as_str().unwrap().to_string()
    }

    fn btc_buy() -> MarketOrder {
        MarketOrder {
            symbol: "BTCUSDT".to_string(),
            side: crate::types::OrderSide::Buy,
            quantity: dec!(0.01),
            reduce_only: false,
        }
    }

    #[tokio::test]
    async fn order_retries_reuse_the_link_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v5/market/instruments-info"))
            .respond_with(ok(instruments()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v5/order/create"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v5/order/create"))
            .respond_with(ok(json!({"orderId": "abc-1"})))
            .with_priority(2)
            .mount(&server)
            .await;

        let c = client(&server);
        let response = c.place_market_order(&btc_buy()).await.unwrap();
        assert_eq!(response.id, "abc-1");

        let orders: Vec<_> = server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.url.path() == "/v5/order/create")
            .collect();
        assert_eq!(orders.len(), 2);
        assert_eq!(link_id(&orders[0]), link_id(&orders[1]));

        // a new order gets a fresh id
        c.place_market_order(&btc_buy()).await.unwrap();
        let last = server.received_requests().await.unwrap().pop().unwrap();
        assert_ne!(link_id(&last), link_id(&orders[0]));
    }

    #[tokio::test]
    async fn duplicate_link_id_means_already_placed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v5/market/instruments-info"))
            .respond_with(ok(instruments()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v5/order/create"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "retCode": 110072, "retMsg": "OrderLinkedID is duplicate", "result": {}
            })))
            .mount(&server)
            .await;

        let response = client(&server).place_market_order(&btc_buy()).await.unwrap();
        assert_eq!(response.status, "submitted");
    }

    #[tokio::test]
    async fn server_errors_exhaust_the_budget() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v5/position/list"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let err = client(&server).positions().await.unwrap_err();
        assert!(matches!(err, ExchangeError::Exhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn unchanged_protection_counts_as_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v5/market/instruments-info"))
            .respond_with(ok(instruments()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v5/position/trading-stop"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "retCode": 34040, "retMsg": "not modified", "result": {}
            })))
            .expect(2)
            .mount(&server)
            .await;

        let c = client(&server);
        let protection = Protection {
            stop_loss: Some(dec!(49000.04)),
            take_profit: Some(dec!(52000)),
        };
        c.set_protection("BTCUSDT", Side::Long, protection).await.unwrap();
        // second call hits the cached instrument rules
        c.set_protection("BTCUSDT", Side::Long, protection).await.unwrap();
    }
}
