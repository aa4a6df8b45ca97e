//! The streaming WebSocket client (component L): connects, authenticates,
//! resubscribes, parses frames, and reconnects with exponential backoff.

use crate::protocol::{
    aggressor_from_conditions, exchange_name, OutboundFrame, RawAggregate, RawEvent, RawQuote,
    RawStatus, RawTrade, StatusValue,
};
use crate::subscription::{FrameAction, SubscriptionId, SubscriptionKind, SubscriptionManager};
use futures_util::{SinkExt, StreamExt};
use qm_instrument::{from_epoch_millis, Feed, Provider, Symbol};
use qm_integration::QualityError;
use qm_quality::orchestrator::QualityOrchestrator;
use qm_quality::types::{AggregateBar, QuoteEvent, Timeframe, TradeEvent};
use rand::Rng;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection lifecycle (spec.md §4.L).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    ReceivingUpdates,
    Reconnecting,
    Disposed,
}

#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub endpoint: url::Url,
    pub api_key: String,
    pub feed: Feed,
    pub provider: Provider,
    pub keepalive_interval: Duration,
    pub base_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl StreamingConfig {
    pub fn new(endpoint: url::Url, api_key: impl Into<String>, feed: Feed, provider: Provider) -> Self {
        Self {
            endpoint,
            api_key: api_key.into(),
            feed,
            provider,
            keepalive_interval: Duration::from_secs(30),
            base_reconnect_delay: Duration::from_secs(2),
            max_reconnect_delay: Duration::from_secs(60),
            max_reconnect_attempts: 10,
        }
    }
}

/// WebSocket streaming client for a single provider connection. Owns the
/// socket handle and reconnect state; borrows the [`SubscriptionManager`]
/// (component K) and publishes normalized events into the
/// [`QualityOrchestrator`] (component J) (spec.md §3 "Ownership").
pub struct StreamingClient {
    config: StreamingConfig,
    subscriptions: Arc<SubscriptionManager>,
    orchestrator: Arc<QualityOrchestrator>,
    state: AsyncMutex<ClientState>,
    sink: AsyncMutex<Option<futures_util::stream::SplitSink<WsStream, Message>>>,
    read_stream: parking_lot::Mutex<Option<futures_util::stream::SplitStream<WsStream>>>,
    reconnecting: AtomicBool,
    disposing: AtomicBool,
    session_sequence: AtomicU64,
}

impl StreamingClient {
    pub fn new(
        config: StreamingConfig,
        subscriptions: Arc<SubscriptionManager>,
        orchestrator: Arc<QualityOrchestrator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            subscriptions,
            orchestrator,
            state: AsyncMutex::new(ClientState::Disconnected),
            sink: AsyncMutex::new(None),
            read_stream: parking_lot::Mutex::new(None),
            reconnecting: AtomicBool::new(false),
            disposing: AtomicBool::new(false),
            session_sequence: AtomicU64::new(0),
        })
    }

    pub async fn state(&self) -> ClientState {
        *self.state.lock().await
    }

    /// Subscribes to `(symbol, kind)`, sending a protocol subscribe frame
    /// only on the first reference (spec.md §4.L "idempotent").
    pub async fn subscribe(&self, symbol: Symbol, kind: SubscriptionKind) -> Result<SubscriptionId, QualityError> {
        let (id, action) = self.subscriptions.subscribe(symbol.clone(), kind);
        if action == FrameAction::SendSubscribe {
            self.send_subscribe_frames(&[(symbol, kind)]).await?;
        }
        Ok(id)
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), QualityError> {
        if let Some((symbol, kind, action)) = self.subscriptions.unsubscribe(id) {
            if action == FrameAction::SendUnsubscribe {
                self.send_frame(&OutboundFrame::unsubscribe(&channel_string(&symbol, kind))).await?;
            }
        }
        Ok(())
    }

    /// Runs the connect-then-receive loop until `dispose()` is called or the
    /// reconnect budget is exhausted (spec.md §4.L reconnect policy).
    ///
    /// The initial connect happens exactly once, outside the loop; on every
    /// subsequent iteration only `receive_loop()` runs until it errors, and
    /// `reconnect()` (which performs its own single connect per successful
    /// attempt) is the only thing that reconnects. Looping back to a second,
    /// independent `connect()` call here would dial a second socket and
    /// re-send every auth/subscribe frame on top of the one `reconnect()`
    /// already completed (spec.md §8 scenario 5: exactly one `subscribe`
    /// frame per symbol after a reconnect).
    pub async fn run(self: &Arc<Self>) -> Result<(), QualityError> {
        if let Err(err) = self.connect().await {
            if self.disposing.load(Ordering::SeqCst) {
                return Ok(());
            }
            *self.state.lock().await = ClientState::Disposed;
            return Err(err);
        }

        loop {
            match self.receive_loop().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if self.disposing.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    if !err.is_recoverable() {
                        *self.state.lock().await = ClientState::Disposed;
                        return Err(err);
                    }
                    self.reconnect().await?;
                }
            }
        }
    }

    pub fn dispose(&self) {
        self.disposing.store(true, Ordering::SeqCst);
    }

    /// Steps 1-7 of spec.md §4.L's connect sequence.
    async fn connect(self: &Arc<Self>) -> Result<(), QualityError> {
        *self.state.lock().await = ClientState::Connecting;

        let (ws, _response) = connect_async(self.config.endpoint.as_str())
            .await
            .map_err(|e| QualityError::Connection(e.to_string()))?;
        let (sink, mut stream) = ws.split();
        *self.sink.lock().await = Some(sink);

        // Step 3: wait for {ev: "status", status: "connected"}, ignoring
        // unrelated frames in the meantime.
        wait_for_status(&mut stream, StatusValue::Connected).await?;
        *self.state.lock().await = ClientState::Connected;

        // Step 4: authenticate and wait for auth_success/auth_failed.
        self.send_frame(&OutboundFrame::auth(&self.config.api_key)).await?;
        match wait_for_status(&mut stream, StatusValue::AuthSuccess).await {
            Ok(()) => {}
            Err(_) => {
                return Err(QualityError::Authentication(
                    "provider returned auth_failed or closed before authenticating".to_string(),
                ))
            }
        }

        // Step 5.
        *self.state.lock().await = ClientState::Authenticated;

        // Step 6: hand the receive half to the caller's receive loop; the
        // read-stream is driven by `receive_loop`, so nothing to spawn here
        // beyond recording it.
        self.set_stream(stream);

        // Step 7: resubscribe, grouped into T./Q./A.+AM. frames.
        self.resubscribe_all().await?;

        *self.state.lock().await = ClientState::ReceivingUpdates;
        self.reconnecting.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_stream(self: &Arc<Self>, stream: futures_util::stream::SplitStream<WsStream>) {
        // Stored via a side channel so `receive_loop` can take ownership;
        // modeled as an Option swapped in under the same task since only
        // one receive loop runs per connection.
        let mut guard = self.read_stream.lock();
        *guard = Some(stream);
    }

    async fn resubscribe_all(&self) -> Result<(), QualityError> {
        let active = self.subscriptions.active();
        if active.is_empty() {
            return Ok(());
        }

        for kind in [
            SubscriptionKind::Trades,
            SubscriptionKind::Quotes,
            SubscriptionKind::Aggregates,
        ] {
            let symbols: Vec<_> = active.iter().filter(|(_, k)| *k == kind).cloned().collect();
            if !symbols.is_empty() {
                self.send_subscribe_frames(&symbols).await?;
            }
        }
        Ok(())
    }

    async fn send_subscribe_frames(&self, pairs: &[(Symbol, SubscriptionKind)]) -> Result<(), QualityError> {
        let channels: Vec<String> = pairs
            .iter()
            .map(|(symbol, kind)| channel_string(symbol, *kind))
            .collect();
        self.send_frame(&OutboundFrame::subscribe(&channels.join(","))).await
    }

    /// All outbound frames serialize through this single exclusive lock so
    /// auth/subscribe/unsubscribe frames never interleave (spec.md §4.L
    /// "Writes ... serialize through a single exclusive send lock").
    async fn send_frame(&self, frame: &OutboundFrame) -> Result<(), QualityError> {
        let mut sink_guard = self.sink.lock().await;
        let Some(sink) = sink_guard.as_mut() else {
            return Err(QualityError::Connection("no active socket to send on".to_string()));
        };
        sink.send(Message::Text(frame.to_json().into()))
            .await
            .map_err(|e| QualityError::Connection(e.to_string()))
    }

    async fn receive_loop(self: &Arc<Self>) -> Result<(), QualityError> {
        loop {
            let message = {
                let mut guard = self.read_stream.lock();
                let Some(stream) = guard.as_mut() else {
                    return Err(QualityError::Internal("receive loop started without a stream".to_string()));
                };
                // Dropping the lock across `.next().await` would require an
                // async mutex; the stream is only ever touched here, so a
                // blocking lock held across this poll is fine in practice,
                // but parking_lot's guard isn't `Send` across await points -
                // so take the stream out, poll it, then put it back.
                let mut taken = guard.take().unwrap();
                drop(guard);
                let next = taken.next().await;
                *self.read_stream.lock() = Some(taken);
                next
            };

            match message {
                Some(Ok(Message::Text(text))) => {
                    self.dispatch_frame(&text);
                }
                Some(Ok(Message::Close(_))) => {
                    return Err(QualityError::Connection("server closed the connection".to_string()));
                }
                Some(Ok(_)) => {
                    // Ping/Pong/Binary frames carry no application payload.
                }
                Some(Err(err)) => {
                    return Err(QualityError::Connection(err.to_string()));
                }
                None => {
                    return Err(QualityError::Connection("stream ended".to_string()));
                }
            }

            if self.disposing.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
    }

    fn dispatch_frame(&self, text: &str) {
        let elements: Vec<RawEvent> = match serde_json::from_str(text) {
            Ok(elements) => elements,
            Err(err) => {
                let preview: String = text.chars().take(200).collect();
                tracing::warn!(error = %err, preview = %preview, "dropping malformed frame");
                return;
            }
        };

        for element in elements {
            self.dispatch_element(element);
        }
    }

    fn dispatch_element(&self, element: RawEvent) {
        match element.ev.as_str() {
            "T" => self.dispatch_trade(element),
            "Q" => self.dispatch_quote(element),
            "A" => self.dispatch_aggregate(element, Timeframe::Second),
            "AM" => self.dispatch_aggregate(element, Timeframe::Minute),
            "status" => {
                if let Ok(status) = serde_json::from_value::<RawStatus>(element.fields) {
                    tracing::info!(status = %status.status, "provider status frame");
                }
            }
            other => {
                tracing::debug!(ev = %other, "dropping unrecognised frame kind");
            }
        }
    }

    fn dispatch_trade(&self, element: RawEvent) {
        let Ok(raw) = serde_json::from_value::<RawTrade>(element.fields) else {
            tracing::warn!("dropping malformed trade element");
            return;
        };
        let symbol = Symbol::from(raw.sym.as_str());
        if !self.subscriptions.has_subscription(&symbol, SubscriptionKind::Trades) {
            return;
        }

        if raw.p <= Decimal::ZERO {
            return;
        }

        let sequence = self.session_sequence.fetch_add(1, Ordering::Relaxed) as i64;
        let trade = TradeEvent {
            symbol,
            timestamp: from_epoch_millis(raw.t),
            price: raw.p,
            volume: raw.s,
            sequence: Some(sequence),
            provider: Some(self.config.provider),
            latency_ms: None,
            venue: raw.x.map(|code| exchange_name(code)),
            aggressor: aggressor_from_conditions(&raw.c),
        };
        self.orchestrator.process_trade(trade);
    }

    fn dispatch_quote(&self, element: RawEvent) {
        let Ok(raw) = serde_json::from_value::<RawQuote>(element.fields) else {
            tracing::warn!("dropping malformed quote element");
            return;
        };
        let symbol = Symbol::from(raw.sym.as_str());
        if !self.subscriptions.has_subscription(&symbol, SubscriptionKind::Quotes) {
            return;
        }

        let Some(quote) = QuoteEvent::new(
            symbol,
            from_epoch_millis(raw.t),
            raw.bp,
            raw.bs,
            raw.ap,
            raw.ask_size,
            Some(self.config.provider),
            None,
        ) else {
            return;
        };
        self.orchestrator.process_quote(quote);
    }

    fn dispatch_aggregate(&self, element: RawEvent, timeframe: Timeframe) {
        let Ok(raw) = serde_json::from_value::<RawAggregate>(element.fields) else {
            tracing::warn!("dropping malformed aggregate element");
            return;
        };
        let symbol = Symbol::from(raw.sym.as_str());
        if !self.subscriptions.has_subscription(&symbol, SubscriptionKind::Aggregates) {
            return;
        }

        let start = from_epoch_millis(raw.s);
        let default_span = match timeframe {
            Timeframe::Second => chrono::Duration::seconds(1),
            Timeframe::Minute => chrono::Duration::seconds(60),
        };
        let end = raw.e.map(from_epoch_millis).unwrap_or(start + default_span);
        let vwap = raw.vw.unwrap_or(raw.c);
        let Some(bar) = AggregateBar::new(
            symbol,
            start,
            end,
            raw.o,
            raw.h,
            raw.l,
            raw.c,
            raw.v,
            vwap,
            raw.n.unwrap_or(0),
            timeframe,
            self.config.provider,
            self.session_sequence.fetch_add(1, Ordering::Relaxed) as i64,
        ) else {
            return;
        };
        self.orchestrator.process_aggregate(bar);
    }

    /// Single-slot non-blocking reconnect gate: concurrent reconnect
    /// attempts are refused, and up to `max_reconnect_attempts` full
    /// connect-sequence retries run with exponential backoff plus 20%
    /// jitter (spec.md §4.L "Reconnect policy").
    async fn reconnect(self: &Arc<Self>) -> Result<(), QualityError> {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        *self.state.lock().await = ClientState::Reconnecting;
        *self.sink.lock().await = None;
        *self.read_stream.lock() = None;

        for attempt in 1..=self.config.max_reconnect_attempts {
            let delay = backoff_delay(
                attempt,
                self.config.base_reconnect_delay,
                self.config.max_reconnect_delay,
            );
            tokio::time::sleep(delay).await;

            match self.connect().await {
                Ok(()) => {
                    self.reconnecting.store(false, Ordering::SeqCst);
                    return Ok(());
                }
                Err(err) if !err.is_recoverable() => {
                    self.reconnecting.store(false, Ordering::SeqCst);
                    *self.state.lock().await = ClientState::Disposed;
                    return Err(err);
                }
                Err(_) => continue,
            }
        }

        self.reconnecting.store(false, Ordering::SeqCst);
        *self.state.lock().await = ClientState::Disposed;
        Err(QualityError::Connection(format!(
            "exhausted {} reconnect attempts",
            self.config.max_reconnect_attempts
        )))
    }
}

/// `min(baseDelay * 2^(k-1), maxDelay) +/- 20% jitter` (spec.md §4.L).
fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponential = base.saturating_mul(1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX));
    let capped = exponential.min(max);
    let jitter_fraction = rand::thread_rng().gen_range(-0.2..=0.2);
    let jittered_ms = (capped.as_millis() as f64) * (1.0 + jitter_fraction);
    Duration::from_millis(jittered_ms.max(0.0) as u64)
}

fn channel_string(symbol: &Symbol, kind: SubscriptionKind) -> String {
    format!("{}.{}", kind.channel_prefix(), symbol)
}

async fn wait_for_status(
    stream: &mut futures_util::stream::SplitStream<WsStream>,
    expected: StatusValue,
) -> Result<(), QualityError> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                let Ok(elements) = serde_json::from_str::<Vec<RawEvent>>(&text) else {
                    continue;
                };
                for element in elements {
                    if element.ev != "status" {
                        continue;
                    }
                    let Ok(status) = serde_json::from_value::<RawStatus>(element.fields) else {
                        continue;
                    };
                    let value = StatusValue::from(status.status.as_str());
                    if value == expected {
                        return Ok(());
                    }
                    if value == StatusValue::AuthFailed {
                        return Err(QualityError::Authentication(status.status));
                    }
                }
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(QualityError::Connection(err.to_string())),
            None => return Err(QualityError::Connection("stream closed during handshake".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay_caps_at_max() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(60);
        for attempt in 1..=10 {
            let delay = backoff_delay(attempt, base, max);
            // Allow for the 20% jitter headroom above the cap.
            assert!(delay <= max + max / 5, "attempt {attempt} exceeded jittered cap: {delay:?}");
        }
    }

    #[test]
    fn test_backoff_delay_grows_until_capped() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(60);
        // attempt 1 -> ~2s, attempt 5 -> ~32s, both well under the 60s cap.
        let early = backoff_delay(1, base, max);
        assert!(early >= Duration::from_millis(1600) && early <= Duration::from_millis(2400));
    }

    #[test]
    fn test_channel_string_format() {
        assert_eq!(
            channel_string(&Symbol::from("AAPL"), SubscriptionKind::Trades),
            "T.AAPL"
        );
    }
}
