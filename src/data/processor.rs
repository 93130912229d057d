//! Data processor: drains the ingest queues into latest-snapshot maps.
//!
//! Two cooperative loops (order books, tickers) each work within a ~5 ms
//! budget per iteration so neither can starve the other. Snapshots are
//! published whole through `arc-swap`, so readers always observe a
//! consistent (book, timestamps) tuple; the drain loop is the only
//! writer of its map.
//!
//! `get_orderbook` is the freshness gate of the whole engine: a snapshot
//! is served only when BOTH the exchange timestamp and the local receive
//! timestamp are younger than the caller's budget.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use metrics::gauge;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::logging::{LogLevel, ThrottledLogger};
use crate::models::{OrderBookSnapshot, TickerSnapshot};

use super::receiver::{BoundedQueue, OrderBookEnvelope, TickerEnvelope};

const DRAIN_BUDGET: Duration = Duration::from_millis(5);
const IDLE_SLEEP: Duration = Duration::from_millis(1);
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(3600);
const STALE_LOG_INTERVAL: Duration = Duration::from_secs(120);

type BookMap = HashMap<(String, String), Arc<OrderBookSnapshot>>;
type TickerMap = HashMap<(String, String), Arc<TickerSnapshot>>;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DataProcessorStats {
    pub orderbook_processed_1h: usize,
    pub ticker_processed_1h: usize,
    pub orderbook_queue_size: usize,
    pub ticker_queue_size: usize,
    pub orderbook_queue_peak: u64,
    pub ticker_queue_peak: u64,
    pub orderbook_count: usize,
    pub ticker_count: usize,
    pub processing_errors: u64,
}

pub struct DataProcessor {
    orderbook_queue: Arc<BoundedQueue<OrderBookEnvelope>>,
    ticker_queue: Arc<BoundedQueue<TickerEnvelope>>,
    books: ArcSwap<BookMap>,
    tickers: ArcSwap<TickerMap>,
    orderbook_processed: Mutex<VecDeque<Instant>>,
    ticker_processed: Mutex<VecDeque<Instant>>,
    processing_errors: AtomicU64,
    stale_log: ThrottledLogger,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DataProcessor {
    pub fn new(
        orderbook_queue: Arc<BoundedQueue<OrderBookEnvelope>>,
        ticker_queue: Arc<BoundedQueue<TickerEnvelope>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            orderbook_queue,
            ticker_queue,
            books: ArcSwap::from_pointee(HashMap::new()),
            tickers: ArcSwap::from_pointee(HashMap::new()),
            orderbook_processed: Mutex::new(VecDeque::new()),
            ticker_processed: Mutex::new(VecDeque::new()),
            processing_errors: AtomicU64::new(0),
            stale_log: ThrottledLogger::new(),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let book_loop = {
            let processor = self.clone();
            tokio::spawn(async move { processor.orderbook_loop().await })
        };
        let ticker_loop = {
            let processor = self.clone();
            tokio::spawn(async move { processor.ticker_loop().await })
        };
        self.tasks.lock().extend([book_loop, ticker_loop]);
        info!("✅ 数据处理器已启动");
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("🛑 数据处理器已停止");
    }

    async fn orderbook_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            let processed = self.drain_orderbooks();
            if processed == 0 {
                tokio::time::sleep(IDLE_SLEEP).await;
            } else {
                // Budget exhausted or queue drained; yield either way.
                tokio::task::yield_now().await;
            }
        }
    }

    async fn ticker_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            let processed = self.drain_tickers();
            if processed == 0 {
                tokio::time::sleep(IDLE_SLEEP).await;
            } else {
                tokio::task::yield_now().await;
            }
        }
    }

    /// Drain within the time budget; returns number of events applied.
    pub fn drain_orderbooks(&self) -> usize {
        if self.orderbook_queue.is_empty() {
            return 0;
        }
        let start = Instant::now();
        let mut processed = 0;
        let mut map = (**self.books.load()).clone();
        while start.elapsed() < DRAIN_BUDGET {
            let Some(envelope) = self.orderbook_queue.pop() else {
                break;
            };
            self.apply_orderbook(&mut map, envelope);
            processed += 1;
        }
        if processed > 0 {
            self.books.store(Arc::new(map));
            let mut window = self.orderbook_processed.lock();
            let now = Instant::now();
            for _ in 0..processed {
                window.push_back(now);
            }
            prune_window(&mut window, now);
            gauge!(
                "gridarb_orderbook_queue_depth",
                self.orderbook_queue.len() as f64
            );
        }
        processed
    }

    pub fn drain_tickers(&self) -> usize {
        if self.ticker_queue.is_empty() {
            return 0;
        }
        let start = Instant::now();
        let mut processed = 0;
        let mut map = (**self.tickers.load()).clone();
        while start.elapsed() < DRAIN_BUDGET {
            let Some(envelope) = self.ticker_queue.pop() else {
                break;
            };
            let key = (envelope.venue.clone(), envelope.symbol.clone());
            let mut ticker = envelope.ticker;
            ticker.symbol = envelope.symbol;
            ticker.received_timestamp = Some(envelope.received_at);
            map.insert(key, Arc::new(ticker));
            processed += 1;
        }
        if processed > 0 {
            self.tickers.store(Arc::new(map));
            let mut window = self.ticker_processed.lock();
            let now = Instant::now();
            for _ in 0..processed {
                window.push_back(now);
            }
            prune_window(&mut window, now);
        }
        processed
    }

    fn apply_orderbook(&self, map: &mut BookMap, envelope: OrderBookEnvelope) {
        let OrderBookEnvelope {
            venue,
            symbol,
            mut book,
            exchange_timestamp,
            received_at,
        } = envelope;
        book.symbol = symbol.clone();
        book.venue = venue.clone();
        if exchange_timestamp.is_some() {
            book.exchange_timestamp = exchange_timestamp;
        }
        book.received_timestamp = Some(received_at);
        book.processed_timestamp = Some(Utc::now());
        if !book.has_both_sides() {
            self.processing_errors.fetch_add(1, Ordering::Relaxed);
            debug!("⚠️ [数据处理] {venue} {symbol} 订单簿不完整，已丢弃");
            return;
        }
        map.insert((venue, symbol), Arc::new(book));
    }

    /// Latest snapshot, served only when both timestamps are fresh.
    pub fn get_orderbook(
        &self,
        venue: &str,
        symbol: &str,
        max_age_seconds: f64,
    ) -> Option<Arc<OrderBookSnapshot>> {
        let key = (venue.to_lowercase(), symbol.to_uppercase());
        let book = self.books.load().get(&key)?.clone();
        let now = Utc::now();
        let max_age = max_age_seconds;

        if let Some(exchange_ts) = book.exchange_timestamp {
            let age = (now - exchange_ts).num_milliseconds() as f64 / 1000.0;
            if age > max_age {
                self.log_stale(venue, symbol, "交易所时间戳过期", age, max_age);
                return None;
            }
        }

        match book.received_timestamp {
            Some(received_ts) => {
                let age = (now - received_ts).num_milliseconds() as f64 / 1000.0;
                if age > max_age {
                    self.log_stale(venue, symbol, "订单簿接收时间过期", age, max_age);
                    return None;
                }
            }
            None => {
                self.log_stale(venue, symbol, "订单簿缺少接收时间", -1.0, max_age);
                return None;
            }
        }

        Some(book)
    }

    fn log_stale(&self, venue: &str, symbol: &str, reason: &str, age: f64, max_age: f64) {
        let key = format!("{venue}:{symbol}:{reason}");
        let message = if age >= 0.0 {
            format!(
                "⚠️ [数据过期] {venue} {symbol} {reason} (年龄: {age:.2}秒 > 阈值: {max_age:.2}秒)，拒绝返回"
            )
        } else {
            format!("❌ [时间戳缺失] {venue} {symbol} {reason}，拒绝返回")
        };
        self.stale_log
            .log(&key, &message, LogLevel::Info, STALE_LOG_INTERVAL);
    }

    pub fn get_last_orderbook_received_timestamp(
        &self,
        venue: &str,
        symbol: &str,
    ) -> Option<DateTime<Utc>> {
        let key = (venue.to_lowercase(), symbol.to_uppercase());
        self.books.load().get(&key)?.received_timestamp
    }

    pub fn get_ticker(&self, venue: &str, symbol: &str) -> Option<Arc<TickerSnapshot>> {
        let key = (venue.to_lowercase(), symbol.to_uppercase());
        self.tickers.load().get(&key).cloned()
    }

    /// symbol → venue → funding rate, from the latest tickers.
    pub fn latest_funding_rates(&self) -> HashMap<String, HashMap<String, Decimal>> {
        let mut rates: HashMap<String, HashMap<String, Decimal>> = HashMap::new();
        for ((venue, symbol), ticker) in self.tickers.load().iter() {
            if let Some(rate) = ticker.funding_rate {
                rates
                    .entry(symbol.clone())
                    .or_default()
                    .insert(venue.clone(), rate);
            }
        }
        rates
    }

    pub fn stats(&self) -> DataProcessorStats {
        let now = Instant::now();
        let orderbook_processed_1h = {
            let mut window = self.orderbook_processed.lock();
            prune_window(&mut window, now);
            window.len()
        };
        let ticker_processed_1h = {
            let mut window = self.ticker_processed.lock();
            prune_window(&mut window, now);
            window.len()
        };
        DataProcessorStats {
            orderbook_processed_1h,
            ticker_processed_1h,
            orderbook_queue_size: self.orderbook_queue.len(),
            ticker_queue_size: self.ticker_queue.len(),
            orderbook_queue_peak: self.orderbook_queue.peak(),
            ticker_queue_peak: self.ticker_queue.peak(),
            orderbook_count: self.books.load().len(),
            ticker_count: self.tickers.load().len(),
            processing_errors: self.processing_errors.load(Ordering::Relaxed),
        }
    }
}

fn prune_window(window: &mut VecDeque<Instant>, now: Instant) {
    while let Some(front) = window.front() {
        if now.duration_since(*front) > THROUGHPUT_WINDOW {
            window.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderBookLevel;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    fn envelope(venue: &str, symbol: &str, age_secs: i64) -> OrderBookEnvelope {
        let ts = Utc::now() - ChronoDuration::seconds(age_secs);
        OrderBookEnvelope {
            venue: venue.to_string(),
            symbol: symbol.to_string(),
            book: OrderBookSnapshot {
                symbol: symbol.to_string(),
                venue: venue.to_string(),
                bids: vec![OrderBookLevel::new(dec!(99.9), dec!(1))],
                asks: vec![OrderBookLevel::new(dec!(100.0), dec!(1))],
                exchange_timestamp: Some(ts),
                received_timestamp: None,
                processed_timestamp: None,
            },
            exchange_timestamp: Some(ts),
            received_at: ts,
        }
    }

    fn processor() -> Arc<DataProcessor> {
        DataProcessor::new(BoundedQueue::new(256), BoundedQueue::new(256))
    }

    #[test]
    fn fresh_snapshot_is_served() {
        let processor = processor();
        processor.orderbook_queue.push(envelope("lighter", "BTC-USDC-PERP", 0));
        assert_eq!(processor.drain_orderbooks(), 1);
        let book = processor.get_orderbook("lighter", "BTC-USDC-PERP", 3.0);
        assert!(book.is_some());
        let book = book.unwrap();
        assert!(book.received_timestamp.is_some());
        assert!(book.processed_timestamp.is_some());
    }

    #[test]
    fn stale_snapshot_is_refused() {
        let processor = processor();
        processor.orderbook_queue.push(envelope("lighter", "BTC-USDC-PERP", 5));
        processor.drain_orderbooks();
        // 5 s old against a 3 s budget: refused on the received stamp.
        assert!(processor.get_orderbook("lighter", "BTC-USDC-PERP", 3.0).is_none());
        // A wider budget serves the same snapshot.
        assert!(processor.get_orderbook("lighter", "BTC-USDC-PERP", 10.0).is_some());
    }

    #[test]
    fn one_sided_book_is_dropped() {
        let processor = processor();
        let mut bad = envelope("lighter", "BTC-USDC-PERP", 0);
        bad.book.asks.clear();
        processor.orderbook_queue.push(bad);
        processor.drain_orderbooks();
        assert!(processor.get_orderbook("lighter", "BTC-USDC-PERP", 3.0).is_none());
        assert_eq!(processor.stats().processing_errors, 1);
    }

    #[test]
    fn funding_rates_come_from_tickers() {
        let processor = processor();
        processor.ticker_queue.push(TickerEnvelope {
            venue: "lighter".to_string(),
            symbol: "BTC-USDC-PERP".to_string(),
            ticker: TickerSnapshot {
                symbol: "BTC".to_string(),
                venue: "lighter".to_string(),
                bid: None,
                ask: None,
                last: None,
                mark_price: None,
                index_price: None,
                funding_rate: Some(dec!(0.0001)),
                next_funding_time: None,
                received_timestamp: None,
            },
            received_at: Utc::now(),
        });
        processor.drain_tickers();
        let rates = processor.latest_funding_rates();
        assert_eq!(
            rates.get("BTC-USDC-PERP").unwrap().get("lighter"),
            Some(&dec!(0.0001))
        );
    }

    #[test]
    fn last_received_timestamp_exposed_for_diagnostics() {
        let processor = processor();
        assert!(processor
            .get_last_orderbook_received_timestamp("lighter", "BTC-USDC-PERP")
            .is_none());
        processor.orderbook_queue.push(envelope("lighter", "BTC-USDC-PERP", 1));
        processor.drain_orderbooks();
        assert!(processor
            .get_last_orderbook_received_timestamp("lighter", "BTC-USDC-PERP")
            .is_some());
    }
}
