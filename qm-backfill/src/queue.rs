use crate::request::{BackfillRequest, RequestId, RequestIdAllocator};
use parking_lot::Mutex;
use qm_instrument::{Provider, SessionDate, Symbol};
use std::collections::{BTreeMap, VecDeque};

/// Priority queue of [`BackfillRequest`]s, FIFO within a priority level
/// (spec.md §4.M). Lower `priority` values are dequeued first; within a
/// level, insertion order is preserved.
#[derive(Default)]
pub struct BackfillQueue {
    levels: Mutex<BTreeMap<u8, VecDeque<BackfillRequest>>>,
    ids: RequestIdAllocator,
}

impl BackfillQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a new request and returns its allocated id. This is the
    /// "producers that enqueue when full block until space is available"
    /// boundary of spec.md §5 - modeled as unbounded here since the queue's
    /// memory is orders of magnitude smaller than the tick-level streams the
    /// rest of this system bounds; callers that want an enqueue-side bound
    /// can check `len()` before calling.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue(
        &self,
        symbol: Symbol,
        from_date: SessionDate,
        to_date: SessionDate,
        granularity: crate::request::Granularity,
        provider: Provider,
        priority: u8,
    ) -> RequestId {
        let id = self.ids.next();
        let request = BackfillRequest::new(id, symbol, from_date, to_date, granularity, provider, priority);
        self.levels.lock().entry(priority).or_default().push_back(request);
        id
    }

    /// Non-blocking dequeue of the highest-priority, oldest request
    /// (spec.md §4.M step 2 `tryDequeue()`).
    pub fn try_dequeue(&self) -> Option<BackfillRequest> {
        let mut levels = self.levels.lock();
        for queue in levels.values_mut() {
            if let Some(request) = queue.pop_front() {
                return Some(request);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.levels.lock().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
