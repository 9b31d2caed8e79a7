// =============================================================================
// Candle Stream Manager: one live, shared candle window per key
// =============================================================================
//
// Each (symbol, interval, limit) key owns a single `LiveStream`:
//
//   1. The first subscriber resolves the initial snapshot through the
//      `CandleCache` (single-flight: concurrent subscribers wait on the same
//      initialisation instead of fetching again).
//   2. The stream then opens the upstream kline feed and upserts every tick
//      into its buffer, pushes the buffer back into the cache, and fans the
//      candle out to every subscriber channel.
//   3. When the upstream socket closes or errors, one reconnect is scheduled
//      after the configured delay.
//   4. When the last subscriber leaves, the stream is torn down: the upstream
//      task is aborted and the key is removed. Cached candles stay behind for
//      the next subscriber.
//
// Every subscriber gets its own channel. The snapshot is queued on that
// channel before the subscriber is registered for updates, under the same
// lock that serialises updates, so no update can overtake it.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::MarketError;
use crate::market_data::candle_cache::CandleCache;
use crate::market_data::kline::parse_kline_event;
use crate::market_data::{MarketMessage, MarketSource};
use crate::runtime_config::ReconnectPolicy;
use crate::types::{CacheKey, UnifiedCandle};

// ---------------------------------------------------------------------------
// Buffer upsert
// ---------------------------------------------------------------------------

/// What an upsert did to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// A candle with the same `open_time` was replaced in place.
    Replaced,
    /// A new candle was inserted; `evicted` oldest candles were dropped to
    /// stay within the limit.
    Inserted { evicted: usize },
}

/// Insert `candle` into an ascending-by-`open_time` buffer, replacing any
/// candle with the same `open_time`, then trim the oldest entries down to
/// `limit`.
pub fn upsert_candle(buffer: &mut VecDeque<UnifiedCandle>, candle: UnifiedCandle, limit: usize) -> Upsert {
    match buffer.binary_search_by_key(&candle.open_time, |c| c.open_time) {
        Ok(idx) => {
            buffer[idx] = candle;
            Upsert::Replaced
        }
        Err(idx) => {
            buffer.insert(idx, candle);
            let mut evicted = 0;
            while buffer.len() > limit {
                buffer.pop_front();
                evicted += 1;
            }
            Upsert::Inserted { evicted }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-key state
// ---------------------------------------------------------------------------

/// Lifecycle of a live stream. Torn-down streams are removed from the manager
/// and therefore have no status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    /// Snapshot resolved, upstream not opened yet.
    Idle,
    Connecting,
    Connected,
    /// Waiting out the reconnect delay after a close or error.
    Reconnecting,
}

struct StreamState {
    buffer: VecDeque<UnifiedCandle>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<MarketMessage>>,
    status: StreamStatus,
    upstream: Option<JoinHandle<()>>,
    /// Callers between looking the stream up and attaching to it.
    waiters: usize,
    torn_down: bool,
}

struct LiveStream {
    key: CacheKey,
    ready: OnceCell<()>,
    state: Mutex<StreamState>,
}

impl LiveStream {
    fn new(key: CacheKey) -> Self {
        Self {
            key,
            ready: OnceCell::new(),
            state: Mutex::new(StreamState {
                buffer: VecDeque::new(),
                subscribers: HashMap::new(),
                status: StreamStatus::Idle,
                upstream: None,
                waiters: 0,
                torn_down: false,
            }),
        }
    }

    /// Record a status transition. Returns `false` once the stream has been
    /// torn down, telling the upstream task to stop.
    fn set_status(&self, status: StreamStatus) -> bool {
        let mut state = self.state.lock();
        if state.torn_down {
            return false;
        }
        state.status = status;
        true
    }

    fn has_subscribers(&self) -> bool {
        let state = self.state.lock();
        !state.torn_down && !state.subscribers.is_empty()
    }

    /// Normalise one raw upstream tick and apply it. Malformed ticks are
    /// logged and dropped.
    fn apply_tick(&self, text: &str, cache: &CandleCache) {
        let (source, candle) = match parse_kline_event(text) {
            Ok(parsed) => parsed,
            Err(e) => {
                let err = MarketError::MalformedUpstreamMessage(format!("{e:#}"));
                warn!(key = %self.key, error = %err, "dropping kline message");
                return;
            }
        };

        if !source.symbol.eq_ignore_ascii_case(&self.key.symbol) || source.interval != self.key.interval {
            debug!(
                key = %self.key,
                symbol = %source.symbol,
                interval = %source.interval,
                "ignoring kline for a different series"
            );
            return;
        }

        self.apply_candle(candle, cache);
    }

    fn apply_candle(&self, candle: UnifiedCandle, cache: &CandleCache) {
        let mut state = self.state.lock();
        if state.torn_down {
            return;
        }

        let outcome = upsert_candle(&mut state.buffer, candle, self.key.limit);
        debug!(key = %self.key, open_time = candle.open_time, close = candle.close, ?outcome, "candle upsert");

        let series = Arc::new(state.buffer.iter().copied().collect::<Vec<_>>());
        cache.update(&self.key, series);

        let message = MarketMessage::Update {
            symbol: self.key.symbol.clone(),
            interval: self.key.interval.clone(),
            candle,
        };
        for tx in state.subscribers.values() {
            let _ = tx.send(message.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// StreamManager
// ---------------------------------------------------------------------------

/// Owns every live stream. Construct once and share behind an `Arc`.
pub struct StreamManager {
    source: Arc<dyn MarketSource>,
    cache: Arc<CandleCache>,
    reconnect: ReconnectPolicy,
    streams: Mutex<HashMap<CacheKey, Arc<LiveStream>>>,
    next_subscriber: AtomicU64,
}

impl StreamManager {
    pub fn new(source: Arc<dyn MarketSource>, cache: Arc<CandleCache>, reconnect: ReconnectPolicy) -> Self {
        Self {
            source,
            cache,
            reconnect,
            streams: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
        }
    }

    /// Subscribe to the live candle window for `key`.
    ///
    /// The returned subscription's first message is always a snapshot of the
    /// current buffer, followed by one update per upstream tick. Dropping the
    /// subscription (or calling [`Subscription::unsubscribe`]) detaches it.
    pub async fn subscribe(self: &Arc<Self>, key: CacheKey) -> Result<Subscription, MarketError> {
        loop {
            let waiter = self.enter(&key);
            waiter
                .stream
                .ready
                .get_or_try_init(|| self.load_snapshot(&waiter.stream))
                .await?;

            if let Some(subscription) = self.attach(&waiter.stream) {
                return Ok(subscription);
            }
            debug!(key = %key, "stream torn down while attaching, retrying");
        }
    }

    /// Keys with a live stream.
    pub fn live_keys(&self) -> Vec<CacheKey> {
        self.streams.lock().keys().cloned().collect()
    }

    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.stream(key).map_or(0, |s| s.state.lock().subscribers.len())
    }

    pub fn status(&self, key: &CacheKey) -> Option<StreamStatus> {
        self.stream(key).map(|s| s.state.lock().status)
    }

    fn stream(&self, key: &CacheKey) -> Option<Arc<LiveStream>> {
        self.streams.lock().get(key).cloned()
    }

    /// Look up (or create) the stream for `key` and register as a waiter so
    /// it cannot be torn down before we attach.
    fn enter(self: &Arc<Self>, key: &CacheKey) -> Waiter {
        let mut map = self.streams.lock();
        let stream = map
            .entry(key.clone())
            .or_insert_with(|| Arc::new(LiveStream::new(key.clone())))
            .clone();
        stream.state.lock().waiters += 1;
        Waiter {
            manager: Arc::clone(self),
            stream,
        }
    }

    /// Resolve the initial snapshot through the cache. Runs at most once
    /// concurrently per stream.
    async fn load_snapshot(&self, stream: &LiveStream) -> Result<(), MarketError> {
        let key = &stream.key;
        let candles = self
            .cache
            .resolve(key, || self.source.fetch_candles(&key.symbol, &key.interval, key.limit))
            .await
            .map_err(|e| {
                warn!(key = %key, error = %e, "initial candle fetch failed");
                MarketError::fetch(key, &e)
            })?;

        let mut state = stream.state.lock();
        for candle in candles.iter() {
            upsert_candle(&mut state.buffer, *candle, key.limit);
        }
        info!(key = %key, candles = state.buffer.len(), "candle snapshot loaded");
        Ok(())
    }

    /// Register a subscriber channel, queueing its snapshot first. Starts the
    /// upstream task for the first subscriber. Returns `None` if the stream
    /// was torn down in the meantime.
    fn attach(self: &Arc<Self>, stream: &Arc<LiveStream>) -> Option<Subscription> {
        let mut state = stream.state.lock();
        if state.torn_down {
            return None;
        }

        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let snapshot = MarketMessage::Snapshot {
            symbol: stream.key.symbol.clone(),
            interval: stream.key.interval.clone(),
            candles: state.buffer.iter().copied().collect(),
        };
        let _ = tx.send(snapshot);
        state.subscribers.insert(id, tx);

        if state.upstream.is_none() {
            state.status = StreamStatus::Connecting;
            state.upstream = Some(tokio::spawn(run_upstream(
                Arc::clone(&self.source),
                Arc::clone(&self.cache),
                self.reconnect,
                Arc::clone(stream),
            )));
        }

        info!(
            key = %stream.key,
            subscriber = id,
            subscribers = state.subscribers.len(),
            "subscriber attached"
        );

        Some(Subscription {
            id,
            key: stream.key.clone(),
            receiver: rx,
            manager: Arc::downgrade(self),
            stream: Arc::clone(stream),
            active: true,
        })
    }

    fn detach(&self, stream: &Arc<LiveStream>, id: u64) {
        let mut map = self.streams.lock();
        let mut state = stream.state.lock();
        if state.subscribers.remove(&id).is_none() {
            return;
        }
        debug!(key = %stream.key, subscriber = id, remaining = state.subscribers.len(), "subscriber detached");
        if state.subscribers.is_empty() && state.waiters == 0 {
            Self::teardown(&mut map, stream, &mut state);
        }
    }

    fn leave(&self, stream: &Arc<LiveStream>) {
        let mut map = self.streams.lock();
        let mut state = stream.state.lock();
        state.waiters = state.waiters.saturating_sub(1);
        if state.waiters == 0 && state.subscribers.is_empty() {
            Self::teardown(&mut map, stream, &mut state);
        }
    }

    /// Release the upstream subscription and drop the key. Caller holds both
    /// the key table and the stream state locks.
    fn teardown(map: &mut HashMap<CacheKey, Arc<LiveStream>>, stream: &Arc<LiveStream>, state: &mut StreamState) {
        if state.torn_down {
            return;
        }
        state.torn_down = true;
        if let Some(handle) = state.upstream.take() {
            handle.abort();
        }
        if map.get(&stream.key).is_some_and(|current| Arc::ptr_eq(current, stream)) {
            map.remove(&stream.key);
        }
        info!(key = %stream.key, "live stream torn down");
    }
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("live_streams", &self.streams.lock().len())
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

/// Keeps a stream alive between lookup and attach.
struct Waiter {
    manager: Arc<StreamManager>,
    stream: Arc<LiveStream>,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.manager.leave(&self.stream);
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A subscriber's end of a live stream. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    key: CacheKey,
    receiver: mpsc::UnboundedReceiver<MarketMessage>,
    manager: Weak<StreamManager>,
    stream: Arc<LiveStream>,
    active: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Next message, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<MarketMessage> {
        self.receiver.recv().await
    }

    /// Detach from the stream. Synchronous and idempotent; never waits on the
    /// upstream connection to close.
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(manager) = self.manager.upgrade() {
            manager.detach(&self.stream, self.id);
        }
        self.receiver.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("active", &self.active)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Upstream task
// ---------------------------------------------------------------------------

/// Keep the upstream kline feed for one stream open until the stream is torn
/// down, reconnecting after each close or error.
async fn run_upstream(
    source: Arc<dyn MarketSource>,
    cache: Arc<CandleCache>,
    policy: ReconnectPolicy,
    stream: Arc<LiveStream>,
) {
    let key = stream.key.clone();
    let mut failures: u32 = 0;

    loop {
        if !stream.set_status(StreamStatus::Connecting) {
            return;
        }
        info!(key = %key, "connecting to kline stream");

        let reason = match source.subscribe_kline(&key.symbol, &key.interval).await {
            Ok(mut ticks) => {
                if !stream.set_status(StreamStatus::Connected) {
                    return;
                }
                failures = 0;
                info!(key = %key, "kline stream connected");

                let outcome = loop {
                    match ticks.next().await {
                        Some(Ok(text)) => stream.apply_tick(&text, &cache),
                        Some(Err(e)) => break format!("{e:#}"),
                        None => break "stream closed by upstream".to_string(),
                    }
                };
                // Close the socket before the reconnect is scheduled.
                drop(ticks);
                outcome
            }
            Err(e) => format!("{e:#}"),
        };

        let err = MarketError::UpstreamStream {
            key: key.clone(),
            reason,
        };
        warn!(error = %err, "kline stream interrupted");

        if !stream.set_status(StreamStatus::Reconnecting) {
            return;
        }
        let delay = policy.delay(failures);
        failures = failures.saturating_add(1);
        info!(key = %key, delay_ms = delay.as_millis() as u64, "kline reconnect scheduled");
        tokio::time::sleep(delay).await;

        if !stream.has_subscribers() {
            info!(key = %key, "no subscribers left, skipping reconnect");
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
