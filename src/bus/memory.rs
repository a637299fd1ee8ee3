//! In-process bus with at-least-once semantics.
//!
//! `MemoryBus` behaves like the brokers the relay is deployed against, minus
//! the network:
//! - messages published with a key seen within the idempotency window are
//!   discarded,
//! - a delivered message that is never acknowledged comes back on the next
//!   fetch,
//! - delivery order can be shuffled with a fixed seed and every n-th message
//!   can be enqueued twice, to exercise reordering and redelivery.

use super::{BusError, Delivery, OutboundMessage, Publisher, Subscriber};
use crate::fragment::Headers;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// Knobs for [`MemoryBus`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryBusOptions {
    /// Number of recent keys remembered for idempotency. `0` disables it.
    pub idempotency_window: usize,
    /// Shuffle ready messages before every fetch.
    pub shuffle_seed: Option<u64>,
    /// Enqueue every n-th accepted message twice.
    pub duplicate_every: Option<usize>,
}

impl Default for MemoryBusOptions {
    fn default() -> Self {
        Self {
            idempotency_window: 1024,
            shuffle_seed: None,
            duplicate_every: None,
        }
    }
}

#[derive(Debug)]
struct Stored {
    id: u64,
    key: String,
    payload: Vec<u8>,
    headers: Headers,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    pub(crate) const fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    #[inline]
    pub(crate) const fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = (self.next_u64() % (i as u64 + 1)) as usize;
            items.swap(i, j);
        }
    }
}

struct BusState {
    options: MemoryBusOptions,
    next_id: u64,
    accepted: usize,
    ready: VecDeque<Arc<Stored>>,
    unacked: HashMap<u64, Arc<Stored>>,
    acked: usize,
    discarded: usize,
    recent_keys: VecDeque<String>,
    recent_set: HashSet<String>,
    rng: Option<SplitMix64>,
    connected: bool,
}

impl BusState {
    fn remember_key(&mut self, key: &str) -> bool {
        if self.options.idempotency_window == 0 {
            return true;
        }
        if self.recent_set.contains(key) {
            return false;
        }
        self.recent_keys.push_back(key.to_string());
        self.recent_set.insert(key.to_string());
        while self.recent_keys.len() > self.options.idempotency_window {
            if let Some(old) = self.recent_keys.pop_front() {
                self.recent_set.remove(&old);
            }
        }
        true
    }

    fn enqueue(&mut self, message: &OutboundMessage) {
        let stored = Stored {
            id: self.next_id,
            key: message.key.clone(),
            payload: message.payload.clone(),
            headers: message.headers.clone(),
        };
        self.next_id += 1;
        self.ready.push_back(Arc::new(stored));
    }
}

/// An in-process, cloneable at-least-once bus.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Mutex<BusState>>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(MemoryBusOptions::default())
    }
}

impl MemoryBus {
    #[must_use]
    pub fn new(options: MemoryBusOptions) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusState {
                options,
                next_id: 0,
                accepted: 0,
                ready: VecDeque::new(),
                unacked: HashMap::new(),
                acked: 0,
                discarded: 0,
                recent_keys: VecDeque::new(),
                recent_set: HashSet::new(),
                rng: options.shuffle_seed.map(SplitMix64::new),
                connected: true,
            })),
        }
    }

    /// A consumer handle on this bus.
    #[must_use]
    pub fn subscriber(&self) -> MemorySubscriber {
        MemorySubscriber {
            bus: Arc::clone(&self.inner),
            closed: false,
        }
    }

    /// Simulate losing the broker: every later publish and fetch fails.
    pub fn disconnect(&self) {
        self.inner.lock().unwrap().connected = false;
    }

    /// Messages not yet acknowledged, delivered or not.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        let g = self.inner.lock().unwrap();
        g.ready.len() + g.unacked.len()
    }

    /// Number of acknowledged deliveries.
    #[must_use]
    pub fn acked(&self) -> usize {
        self.inner.lock().unwrap().acked
    }

    /// Publishes dropped by the idempotency window.
    #[must_use]
    pub fn discarded(&self) -> usize {
        self.inner.lock().unwrap().discarded
    }

    /// Keys of every message not yet acknowledged, in queue order.
    #[must_use]
    pub fn outstanding_keys(&self) -> Vec<String> {
        let g = self.inner.lock().unwrap();
        g.ready
            .iter()
            .chain(g.unacked.values())
            .map(|s| s.key.clone())
            .collect()
    }
}

impl Publisher for MemoryBus {
    fn publish(&self, message: OutboundMessage) -> Result<(), BusError> {
        let mut g = self.inner.lock().unwrap();
        if !g.connected {
            return Err(BusError::Disconnected("memory bus".into()));
        }
        if !g.remember_key(&message.key) {
            g.discarded += 1;
            return Ok(());
        }
        g.accepted += 1;
        g.enqueue(&message);
        if let Some(n) = g.options.duplicate_every
            && n > 0
            && g.accepted % n == 0
        {
            g.enqueue(&message);
        }
        Ok(())
    }
}

/// Consumer handle returned by [`MemoryBus::subscriber`].
pub struct MemorySubscriber {
    bus: Arc<Mutex<BusState>>,
    closed: bool,
}

impl Subscriber for MemorySubscriber {
    fn fetch(&mut self, max: usize) -> Result<Vec<Box<dyn Delivery>>, BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }
        let mut g = self.bus.lock().unwrap();
        if !g.connected {
            return Err(BusError::Disconnected("memory bus".into()));
        }

        // Anything handed out earlier and never acked is due again.
        let mut redeliver: Vec<Arc<Stored>> = g.unacked.drain().map(|(_, s)| s).collect();
        redeliver.sort_by_key(|s| s.id);
        g.ready.extend(redeliver);

        let state = &mut *g;
        if let Some(rng) = state.rng.as_mut() {
            rng.shuffle(state.ready.make_contiguous());
        }

        let mut out: Vec<Box<dyn Delivery>> = Vec::with_capacity(max.min(g.ready.len()));
        while out.len() < max {
            let Some(stored) = g.ready.pop_front() else {
                break;
            };
            g.unacked.insert(stored.id, Arc::clone(&stored));
            out.push(Box::new(MemoryDelivery {
                stored,
                bus: Arc::clone(&self.bus),
            }));
        }
        Ok(out)
    }

    fn close(&mut self) -> Result<(), BusError> {
        self.closed = true;
        Ok(())
    }
}

struct MemoryDelivery {
    stored: Arc<Stored>,
    bus: Arc<Mutex<BusState>>,
}

impl Delivery for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.stored.payload
    }

    fn headers(&self) -> &Headers {
        &self.stored.headers
    }

    fn ack(&self) -> Result<(), BusError> {
        let mut g = self.bus.lock().unwrap();
        if g.unacked.remove(&self.stored.id).is_some() {
            g.acked += 1;
        }
        Ok(())
    }
}
