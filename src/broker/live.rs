// =============================================================================
// LiveBroker — HTTP/WebSocket adapter skeleton
// =============================================================================
//
// The concrete broker SDK is out of scope (spec §1) — this is the narrow
// shape a real Longbridge-style integration would fill in, following the
// reference engine's `BinanceClient` (reqwest::Client + a configured
// base_url) for the HTTP side and its auto-reconnect WebSocket loop for
// pushes. Unlike `BinanceClient`, there is no HMAC request signing here:
// Longbridge-style session auth is token-based, not per-request query
// signing, so `hmac`/`sha2`/`hex` have no remaining use and are dropped
// (noted in DESIGN.md).
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures_util::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{error, info, instrument, warn};

use super::{
    AccountBalance, Candlestick, OpenOrder, OrderChanged, OrderPayload, Quote, QuoteContext,
    ReplacePayload, StockPosition, SubmittedOrder, TradeContext, WarrantListing,
};

pub struct LiveBroker {
    http: Client,
    base_url: String,
    token: String,
    push_tx: mpsc::Sender<OrderChanged>,
    push_rx: parking_lot::Mutex<Option<mpsc::Receiver<OrderChanged>>>,
}

impl LiveBroker {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let (push_tx, push_rx) = mpsc::channel(1024);
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            token: token.into(),
            push_tx,
            push_rx: parking_lot::Mutex::new(Some(push_rx)),
        }
    }

    /// Spawn the push-handler loop: connects to the broker's private
    /// WebSocket feed and forwards `OrderChanged` events, reconnecting after
    /// a delay on any disconnect, matching the reference engine's
    /// per-symbol market-data reconnect loop in `main.rs`.
    pub fn spawn_push_loop(self: &Arc<Self>) {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(err) = broker.run_push_loop_once().await {
                    warn!(error = %err, "push loop disconnected, reconnecting in 5s");
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }

    async fn run_push_loop_once(&self) -> anyhow::Result<()> {
        let ws_url = format!("{}/ws/orders?token={}", self.base_url, self.token);
        let (ws_stream, _) = connect_async(&ws_url).await?;
        let (_, mut read) = ws_stream.split();

        info!("push loop connected");
        while let Some(msg) = read.next().await {
            let msg = msg?;
            if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                match serde_json::from_str::<WirePushEvent>(&text) {
                    Ok(event) => {
                        if self.push_tx.send(event.into()).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "failed to decode push event"),
                }
            }
        }
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[derive(serde::Deserialize)]
struct WirePushEvent {
    order_id: String,
    status: crate::types::OrderStatus,
    executed_price: Option<rust_decimal::Decimal>,
    executed_quantity: u64,
    updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<WirePushEvent> for OrderChanged {
    fn from(w: WirePushEvent) -> Self {
        OrderChanged {
            order_id: w.order_id,
            status: w.status,
            executed_price: w.executed_price,
            executed_quantity: w.executed_quantity,
            updated_at: w.updated_at,
        }
    }
}

#[async_trait]
impl QuoteContext for LiveBroker {
    #[instrument(skip(self), name = "broker::subscribe_symbols")]
    async fn subscribe_symbols(&self, symbols: &[String]) -> anyhow::Result<()> {
        self.http
            .post(self.url("/quote/subscribe"))
            .bearer_auth(&self.token)
            .json(&symbols)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    #[instrument(skip(self), name = "broker::unsubscribe_symbols")]
    async fn unsubscribe_symbols(&self, symbols: &[String]) -> anyhow::Result<()> {
        self.http
            .post(self.url("/quote/unsubscribe"))
            .bearer_auth(&self.token)
            .json(&symbols)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    #[instrument(skip(self), name = "broker::get_quotes")]
    async fn get_quotes(&self, symbols: &[String]) -> anyhow::Result<Vec<(String, Quote)>> {
        let resp: Vec<(String, Quote)> = self
            .http
            .get(self.url("/quote"))
            .bearer_auth(&self.token)
            .query(&[("symbols", symbols.join(","))])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp)
    }

    async fn subscribe_candlesticks(&self, symbol: &str) -> anyhow::Result<()> {
        self.http
            .post(self.url("/quote/candlesticks/subscribe"))
            .bearer_auth(&self.token)
            .json(&[symbol])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn get_realtime_candlesticks(&self, symbol: &str, count: u32) -> anyhow::Result<Vec<Candlestick>> {
        let resp = self
            .http
            .get(self.url("/quote/candlesticks"))
            .bearer_auth(&self.token)
            .query(&[("symbol", symbol), ("count", &count.to_string())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp)
    }

    async fn warrant_list(&self, underlying: &str, is_long: bool) -> anyhow::Result<Vec<WarrantListing>> {
        let resp = self
            .http
            .get(self.url("/quote/warrants"))
            .bearer_auth(&self.token)
            .query(&[("underlying", underlying), ("is_long", &is_long.to_string())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp)
    }

    async fn is_trading_day(&self, date: NaiveDate) -> anyhow::Result<bool> {
        let resp: bool = self
            .http
            .get(self.url("/quote/trading-day"))
            .bearer_auth(&self.token)
            .query(&[("date", date.to_string())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp)
    }

    async fn get_trading_days(&self, from: NaiveDate, to: NaiveDate) -> anyhow::Result<Vec<NaiveDate>> {
        let resp = self
            .http
            .get(self.url("/quote/trading-days"))
            .bearer_auth(&self.token)
            .query(&[("from", from.to_string()), ("to", to.to_string())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp)
    }
}

#[async_trait]
impl TradeContext for LiveBroker {
    #[instrument(skip(self), name = "broker::submit_order")]
    async fn submit_order(&self, payload: OrderPayload) -> anyhow::Result<SubmittedOrder> {
        let resp = self
            .http
            .post(self.url("/trade/order"))
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await?
            .error_for_status()
            .map_err(|err| {
                error!(symbol = %payload.symbol, error = %err, "submit_order failed");
                err
            })?
            .json()
            .await?;
        Ok(resp)
    }

    #[instrument(skip(self), name = "broker::cancel_order")]
    async fn cancel_order(&self, order_id: &str) -> anyhow::Result<()> {
        self.http
            .delete(self.url(&format!("/trade/order/{order_id}")))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    #[instrument(skip(self), name = "broker::replace_order")]
    async fn replace_order(&self, payload: ReplacePayload) -> anyhow::Result<()> {
        self.http
            .put(self.url(&format!("/trade/order/{}", payload.order_id)))
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn account_balance(&self) -> anyhow::Result<AccountBalance> {
        let resp = self
            .http
            .get(self.url("/trade/account"))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp)
    }

    async fn stock_positions(&self, symbols: Option<&[String]>) -> anyhow::Result<Vec<StockPosition>> {
        let mut req = self.http.get(self.url("/trade/positions")).bearer_auth(&self.token);
        if let Some(symbols) = symbols {
            req = req.query(&[("symbols", symbols.join(","))]);
        }
        let resp = req.send().await?.error_for_status()?.json().await?;
        Ok(resp)
    }

    async fn today_orders(&self, symbol: Option<&str>) -> anyhow::Result<Vec<OpenOrder>> {
        let mut req = self.http.get(self.url("/trade/orders/today")).bearer_auth(&self.token);
        if let Some(symbol) = symbol {
            req = req.query(&[("symbol", symbol)]);
        }
        let resp = req.send().await?.error_for_status()?.json().await?;
        Ok(resp)
    }

    fn subscribe_order_changed(&self) -> mpsc::Receiver<OrderChanged> {
        self.push_rx
            .lock()
            .take()
            .expect("LiveBroker::subscribe_order_changed called more than once")
    }
}
