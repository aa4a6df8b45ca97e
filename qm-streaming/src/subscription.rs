use parking_lot::Mutex;
use qm_instrument::Symbol;
use std::collections::HashMap;

/// Which event stream a subscription tracks (spec.md §3 `Subscription.kind`).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SubscriptionKind {
    Trades,
    Quotes,
    Aggregates,
}

impl SubscriptionKind {
    /// Wire channel prefix used to build `T.<sym>` / `Q.<sym>` / `A.<sym>`
    /// subscribe frames (spec.md §6).
    pub fn channel_prefix(self) -> &'static str {
        match self {
            SubscriptionKind::Trades => "T",
            SubscriptionKind::Quotes => "Q",
            SubscriptionKind::Aggregates => "A",
        }
    }
}

/// Opaque, provider-scoped subscription id (spec.md §3 `Subscription.id`).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SubscriptionId(u64);

type Key = (Symbol, SubscriptionKind);

/// Whether the caller must emit a protocol-level subscribe/unsubscribe frame
/// as a result of a [`SubscriptionManager`] call (spec.md §4.K: "an outbound
/// subscribe/unsubscribe protocol frame is sent only when refCount goes
/// 0->1 or 1->0").
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameAction {
    SendSubscribe,
    SendUnsubscribe,
    None,
}

/// ID-allocated multiset of (symbol, kind) subscriptions shared by the
/// streaming client (component K). Safe under concurrent call from the
/// ingest and control paths (spec.md §4.K).
pub struct SubscriptionManager {
    id_base: u64,
    next_id: Mutex<u64>,
    by_id: Mutex<HashMap<SubscriptionId, Key>>,
    by_key: Mutex<HashMap<Key, (SubscriptionId, u32)>>,
}

impl SubscriptionManager {
    /// `id_base` lets distinct providers allocate from disjoint ranges so
    /// subscription ids never collide across providers (spec.md §4.K).
    pub fn new(id_base: u64) -> Self {
        Self {
            id_base,
            next_id: Mutex::new(id_base),
            by_id: Mutex::new(HashMap::new()),
            by_key: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to `(symbol, kind)`. Returns the subscription id and
    /// whether the caller must send a protocol subscribe frame (only true
    /// on the first subscriber, i.e. refCount 0->1).
    pub fn subscribe(&self, symbol: Symbol, kind: SubscriptionKind) -> (SubscriptionId, FrameAction) {
        let key = (symbol, kind);
        let mut by_key = self.by_key.lock();
        if let Some((id, ref_count)) = by_key.get_mut(&key) {
            *ref_count += 1;
            return (*id, FrameAction::None);
        }

        let id = {
            let mut next_id = self.next_id.lock();
            let id = SubscriptionId(*next_id);
            *next_id += 1;
            id
        };
        by_key.insert(key.clone(), (id, 1));
        self.by_id.lock().insert(id, key);
        (id, FrameAction::SendSubscribe)
    }

    /// Unsubscribe the given id, decrementing its refCount. Returns the
    /// (symbol, kind) pair and whether the caller must send a protocol
    /// unsubscribe frame (true only once refCount reaches 0), or `None` if
    /// the id is not (or no longer) tracked.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Option<(Symbol, SubscriptionKind, FrameAction)> {
        let key = self.by_id.lock().get(&id).cloned()?;
        let mut by_key = self.by_key.lock();
        let (_, ref_count) = by_key.get_mut(&key)?;
        *ref_count -= 1;

        if *ref_count == 0 {
            by_key.remove(&key);
            self.by_id.lock().remove(&id);
            Some((key.0, key.1, FrameAction::SendUnsubscribe))
        } else {
            Some((key.0, key.1, FrameAction::None))
        }
    }

    pub fn has_subscription(&self, symbol: &Symbol, kind: SubscriptionKind) -> bool {
        self.by_key.lock().contains_key(&(symbol.clone(), kind))
    }

    pub fn symbols_by_kind(&self, kind: SubscriptionKind) -> Vec<Symbol> {
        self.by_key
            .lock()
            .keys()
            .filter(|(_, k)| *k == kind)
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }

    /// All currently active (symbol, kind) pairs, used to rebuild subscribe
    /// frames after a reconnect (spec.md §4.L step 7).
    pub fn active(&self) -> Vec<(Symbol, SubscriptionKind)> {
        self.by_key.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_key.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_idempotence_roundtrip() {
        // spec.md §8: N subscribes followed by N unsubscribes of the
        // returned ids leaves the active set identical to its initial
        // (empty) state; exactly one subscribe frame and one unsubscribe
        // frame are produced.
        let manager = SubscriptionManager::new(1000);
        let symbol = Symbol::from("AAPL");

        let (id1, action1) = manager.subscribe(symbol.clone(), SubscriptionKind::Trades);
        assert_eq!(action1, FrameAction::SendSubscribe);
        let (id2, action2) = manager.subscribe(symbol.clone(), SubscriptionKind::Trades);
        assert_eq!(action2, FrameAction::None);
        assert_eq!(id1, id2);

        let (id3, action3) = manager.subscribe(symbol.clone(), SubscriptionKind::Trades);
        assert_eq!(action3, FrameAction::None);
        assert_eq!(id1, id3);

        assert!(manager.has_subscription(&symbol, SubscriptionKind::Trades));

        let (_, _, a) = manager.unsubscribe(id1).unwrap();
        assert_eq!(a, FrameAction::None);
        let (_, _, a) = manager.unsubscribe(id2).unwrap();
        assert_eq!(a, FrameAction::None);
        let (_, _, a) = manager.unsubscribe(id3).unwrap();
        assert_eq!(a, FrameAction::SendUnsubscribe);

        assert!(!manager.has_subscription(&symbol, SubscriptionKind::Trades));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_distinct_symbol_kind_pairs_independent() {
        let manager = SubscriptionManager::new(0);
        let (id_trades, _) = manager.subscribe(Symbol::from("AAPL"), SubscriptionKind::Trades);
        let (id_quotes, _) = manager.subscribe(Symbol::from("AAPL"), SubscriptionKind::Quotes);
        assert_ne!(id_trades, id_quotes);
        assert_eq!(manager.symbols_by_kind(SubscriptionKind::Trades).len(), 1);
        assert_eq!(manager.symbols_by_kind(SubscriptionKind::Quotes).len(), 1);
    }

    #[test]
    fn test_id_base_avoids_cross_provider_collisions() {
        let polygon = SubscriptionManager::new(0);
        let tiingo = SubscriptionManager::new(1_000_000);
        let (id_a, _) = polygon.subscribe(Symbol::from("AAPL"), SubscriptionKind::Trades);
        let (id_b, _) = tiingo.subscribe(Symbol::from("AAPL"), SubscriptionKind::Trades);
        assert_ne!(id_a, id_b);
    }

    #[test]
    fn test_unsubscribe_unknown_id_returns_none() {
        let manager = SubscriptionManager::new(0);
        assert!(manager.unsubscribe(SubscriptionId(999)).is_none());
    }
}
