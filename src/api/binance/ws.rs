//! Binance all-market ticker ingestion.
//!
//! One long-lived connection to the aggregated `!ticker@arr` stream. Each
//! frame is a JSON array of 24h ticker entries; entries are decoded one by
//! one so a malformed entry is skipped without dropping its batch. Decoded
//! ticks go to the price cache and, for subscribed symbols, to the registry.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::FeedConfig;
use crate::engine::cache::PriceCache;
use crate::engine::registry::SubscriberRegistry;
use crate::error::AlertflowError;
use crate::metrics::Metrics;
use crate::model::{FeedStatus, PriceTick};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Deserialize)]
#[allow(non_snake_case)]
struct RawTicker {
    /// Symbol
    s: String,
    /// Last price
    c: String,
    /// 24h price change percent
    P: String,
    /// 24h quote volume
    q: String,
    /// 24h high
    h: String,
    /// 24h low
    l: String,
    /// 24h open
    o: String,
    /// Event time, epoch milliseconds
    E: i64,
}

impl RawTicker {
    fn into_tick(self) -> Result<PriceTick, AlertflowError> {
        let parse = |field: &str, value: &str| -> Result<f64, AlertflowError> {
            value.parse::<f64>().map_err(|_| {
                AlertflowError::Evaluation(format!("unparseable {} field: {:?}", field, value))
            })
        };
        Ok(PriceTick {
            price: parse("price", &self.c)?,
            change_24h: parse("change", &self.P)?,
            volume_24h: parse("volume", &self.q)?,
            high_24h: parse("high", &self.h)?,
            low_24h: parse("low", &self.l)?,
            open_24h: parse("open", &self.o)?,
            symbol: self.s,
            timestamp: self.E,
        })
    }
}

/// Decodes one ticker batch. Malformed entries are logged and skipped; only
/// a frame that is not a JSON array at all is an error.
pub fn parse_batch(text: &str) -> Result<Vec<PriceTick>, AlertflowError> {
    let entries: Vec<serde_json::Value> = serde_json::from_str(text)?;
    let mut ticks = Vec::with_capacity(entries.len());
    for entry in entries {
        match serde_json::from_value::<RawTicker>(entry).map_err(AlertflowError::from) {
            Ok(raw) => match raw.into_tick() {
                Ok(tick) => ticks.push(tick),
                Err(e) => warn!("skipping malformed ticker entry: {}", e),
            },
            Err(e) => warn!("skipping malformed ticker entry: {}", e),
        }
    }
    Ok(ticks)
}

pub struct FeedGateway {
    config: FeedConfig,
    cache: Arc<PriceCache>,
    registry: Arc<SubscriberRegistry>,
    metrics: Arc<Metrics>,
    shutdown: watch::Sender<bool>,
}

impl FeedGateway {
    pub fn new(
        config: FeedConfig,
        cache: Arc<PriceCache>,
        registry: Arc<SubscriberRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            cache,
            registry,
            metrics,
            shutdown,
        }
    }

    /// Runs the connect/read/reconnect loop until `stop` or until reconnect
    /// attempts are exhausted, at which point the feed is reported
    /// unavailable and the task ends; a fresh `start` is the manual restart.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let gateway = Arc::clone(self);
        let _ = gateway.shutdown.send(false);
        tokio::spawn(async move { gateway.run().await })
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn run(self: Arc<Self>) {
        let reconnect = self.config.reconnect.clone();
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt: u32 = 0;
        let mut delay = Duration::from_millis(reconnect.initial_delay_ms);

        loop {
            match connect_async(&self.config.url).await {
                Ok((stream, _)) => {
                    info!("connected to ticker feed at {}", self.config.url);
                    self.metrics.set_feed_status(FeedStatus::Connected);
                    attempt = 0;
                    delay = Duration::from_millis(reconnect.initial_delay_ms);
                    match self.read_loop(stream, &mut shutdown).await {
                        Ok(()) => {
                            info!("feed gateway stopped");
                            self.metrics.set_feed_status(FeedStatus::Disconnected);
                            return;
                        }
                        Err(e) => error!("feed connection lost: {}", e),
                    }
                }
                Err(e) => error!("feed connection failed: {}", e),
            }

            attempt += 1;
            if attempt > reconnect.max_attempts {
                error!(
                    "{}",
                    AlertflowError::FeedUnavailable(reconnect.max_attempts)
                );
                self.metrics.set_feed_status(FeedStatus::Unavailable);
                return;
            }
            self.metrics.set_feed_status(FeedStatus::Reconnecting);
            warn!(
                "reconnecting in {}ms (attempt {}/{})",
                delay.as_millis(),
                attempt,
                reconnect.max_attempts
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    self.metrics.set_feed_status(FeedStatus::Disconnected);
                    return;
                }
            }
            delay = (delay * 2).min(Duration::from_millis(reconnect.max_delay_ms));
        }
    }

    /// Reads frames until the connection fails or `stop` is requested.
    /// Ok means deliberate shutdown; Err means the caller should reconnect.
    async fn read_loop(
        &self,
        stream: WsStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), AlertflowError> {
        let (mut sink, mut stream) = stream.split();
        let mut ping = tokio::time::interval(Duration::from_millis(self.config.ping_interval_ms));
        ping.tick().await; // the first tick is immediate
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                    Some(Ok(Message::Ping(payload))) => sink.send(Message::Pong(payload)).await?,
                    Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                    Some(Ok(Message::Close(frame))) => {
                        return Err(AlertflowError::IoError(std::io::Error::new(
                            std::io::ErrorKind::ConnectionReset,
                            format!("server closed the stream: {:?}", frame),
                        )));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        return Err(AlertflowError::IoError(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "ticker stream ended",
                        )));
                    }
                },
                _ = ping.tick() => {
                    if awaiting_pong {
                        return Err(AlertflowError::IoError(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "keepalive pong not received",
                        )));
                    }
                    sink.send(Message::Ping(Vec::new())).await?;
                    awaiting_pong = true;
                }
                _ = shutdown.changed() => {
                    let _ = sink.close().await;
                    return Ok(());
                }
            }
        }
    }

    /// Parse, cache, and forward one batch. No blocking I/O here.
    fn handle_frame(&self, text: &str) {
        let ticks = match parse_batch(text) {
            Ok(ticks) => ticks,
            Err(e) => {
                warn!("unparseable feed frame: {}", e);
                return;
            }
        };
        for tick in ticks {
            if !self.cache.insert(tick.clone()) {
                continue; // stale, monotonic-timestamp rule
            }
            self.metrics.record_tick();
            if self.registry.has_subscribers(&tick.symbol) {
                self.registry.publish(tick);
            } else {
                debug!("no subscribers for {}, not forwarding", tick.symbol);
            }
        }
    }
}
