//! Callback registry and the merged log query that serves all of it.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use alloy_primitives::{Address, B256};
use futures::future::BoxFuture;
use futures::FutureExt;

use chainplace_core::{BlockNumber, FilterQuery, Header, Log};

pub type HeaderCallback = Arc<dyn Fn(Header) -> BoxFuture<'static, ()> + Send + Sync>;
pub type BlockCallback = Arc<dyn Fn(BlockNumber) -> BoxFuture<'static, ()> + Send + Sync>;
pub type BlockWithLogsCallback =
    Arc<dyn Fn(BlockNumber, Vec<Log>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type LogCallback = Arc<dyn Fn(Log) -> BoxFuture<'static, ()> + Send + Sync>;
pub type StoppedCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub(crate) fn header_callback<F, Fut>(cb: F) -> HeaderCallback
where
    F: Fn(Header) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |header| cb(header).boxed())
}

pub(crate) fn block_callback<F, Fut>(cb: F) -> BlockCallback
where
    F: Fn(BlockNumber) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |block| cb(block).boxed())
}

pub(crate) fn block_with_logs_callback<F, Fut>(cb: F) -> BlockWithLogsCallback
where
    F: Fn(BlockNumber, Vec<Log>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |block, logs| cb(block, logs).boxed())
}

pub(crate) fn log_callback<F, Fut>(cb: F) -> LogCallback
where
    F: Fn(Log) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |log| cb(log).boxed())
}

pub(crate) fn stopped_callback<F, Fut>(cb: F) -> StoppedCallback
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || cb().boxed())
}

// ─── Subscriptions ───────────────────────────────────────────────────────────

/// A callback plus the first block it has not seen yet.
///
/// Only the dispatch task that owns the subscription for an iteration moves
/// `next_block`, and only forward.
pub struct Subscription<C> {
    pub callback: C,
    next_block: AtomicU64,
}

impl<C> Subscription<C> {
    pub(crate) fn new(callback: C, from: BlockNumber) -> Arc<Self> {
        Arc::new(Self {
            callback,
            next_block: AtomicU64::new(from.as_u64()),
        })
    }

    pub fn next_block(&self) -> BlockNumber {
        BlockNumber(self.next_block.load(Ordering::Acquire))
    }

    /// Returns `true` if `block` has not been delivered to this subscription.
    pub fn wants(&self, block: BlockNumber) -> bool {
        block >= self.next_block()
    }

    /// Move `next_block` back to `block` if it is further ahead.
    pub(crate) fn rewind_to(&self, block: BlockNumber) {
        self.next_block.fetch_min(block.as_u64(), Ordering::AcqRel);
    }

    /// Mark everything up to and including `block` as delivered.
    pub(crate) fn delivered_through(&self, block: BlockNumber) {
        self.next_block
            .fetch_max(block.next().as_u64(), Ordering::AcqRel);
    }
}

/// A log subscription with its own address/topic filter.
pub struct LogSubscription {
    pub sub: Arc<Subscription<LogCallback>>,
    pub filter: FilterQuery,
}

// ─── Builder ─────────────────────────────────────────────────────────────────

/// Registry of everything the monitor has to deliver.
#[derive(Default)]
pub struct EventSubscriptionBuilder {
    headers: Vec<HeaderCallback>,
    blocks: Vec<Arc<Subscription<BlockCallback>>>,
    blocks_with_logs: Vec<Arc<Subscription<BlockWithLogsCallback>>>,
    events: Vec<Arc<LogSubscription>>,
    stopped: Vec<StoppedCallback>,
    /// Cached merged query, rebuilt on the next `query()` after a log registration.
    query: Option<FilterQuery>,
}

/// Copy of the builder taken at the start of a poll iteration.
#[derive(Clone)]
pub struct DispatchSet {
    pub headers: Vec<HeaderCallback>,
    pub blocks: Vec<Arc<Subscription<BlockCallback>>>,
    pub blocks_with_logs: Vec<Arc<Subscription<BlockWithLogsCallback>>>,
    pub events: Vec<Arc<LogSubscription>>,
    pub query: FilterQuery,
}

impl DispatchSet {
    /// Returns `true` if logs must be fetched for this iteration.
    pub fn needs_logs(&self) -> bool {
        !self.events.is_empty() || !self.blocks_with_logs.is_empty()
    }
}

impl EventSubscriptionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_header(&mut self, cb: HeaderCallback) {
        self.headers.push(cb);
    }

    /// Block subscribers start at `from`, usually the monitor cursor at
    /// registration time.
    pub fn on_block(&mut self, from: BlockNumber, cb: BlockCallback) {
        self.blocks.push(Subscription::new(cb, from));
    }

    /// Block subscribers registered before the loop starts begin at the
    /// start block, not at a cursor left by earlier log subscriptions.
    pub(crate) fn rewind_block_subscriptions(&self, start: BlockNumber) {
        for sub in &self.blocks {
            sub.rewind_to(start);
        }
    }

    pub fn on_block_with_logs(&mut self, from: BlockNumber, cb: BlockWithLogsCallback) {
        self.blocks_with_logs.push(Subscription::new(cb, from));
        self.query = None;
    }

    pub fn on_all_events(&mut self, from: BlockNumber, cb: LogCallback) {
        self.add_log_subscription(from, FilterQuery::default(), cb);
    }

    pub fn on_contract_event(&mut self, from: BlockNumber, address: Address, cb: LogCallback) {
        let filter = FilterQuery {
            addresses: vec![address],
            ..Default::default()
        };
        self.add_log_subscription(from, filter, cb);
    }

    pub fn on_contract_with_topics_event(
        &mut self,
        from: BlockNumber,
        address: Address,
        topics: Vec<Vec<B256>>,
        cb: LogCallback,
    ) {
        let filter = FilterQuery {
            addresses: vec![address],
            topics,
            ..Default::default()
        };
        self.add_log_subscription(from, filter, cb);
    }

    pub fn on_stopped(&mut self, cb: StoppedCallback) {
        self.stopped.push(cb);
    }

    fn add_log_subscription(&mut self, from: BlockNumber, filter: FilterQuery, cb: LogCallback) {
        self.events.push(Arc::new(LogSubscription {
            sub: Subscription::new(cb, from),
            filter,
        }));
        self.query = None;
    }

    pub fn stopped_callbacks(&self) -> Vec<StoppedCallback> {
        self.stopped.clone()
    }

    pub fn has_log_subscribers(&self) -> bool {
        !self.events.is_empty() || !self.blocks_with_logs.is_empty()
    }

    /// The narrowest single query whose result contains every log any
    /// subscription wants. The block range is left unset.
    pub fn query(&mut self) -> FilterQuery {
        if let Some(query) = &self.query {
            return query.clone();
        }
        let query = self.merge_filters();
        self.query = Some(query.clone());
        query
    }

    fn merge_filters(&self) -> FilterQuery {
        let match_all = !self.blocks_with_logs.is_empty()
            || self.events.iter().any(|e| e.filter.addresses.is_empty());
        if match_all || self.events.is_empty() {
            return FilterQuery::default();
        }

        let mut addresses: Vec<Address> = Vec::new();
        for event in &self.events {
            for address in &event.filter.addresses {
                if !addresses.contains(address) {
                    addresses.push(*address);
                }
            }
        }

        // Only positions constrained by every subscription can be narrowed.
        let depth = self
            .events
            .iter()
            .map(|e| e.filter.topics.len())
            .min()
            .unwrap_or(0);
        let mut topics: Vec<Vec<B256>> = vec![Vec::new(); depth];
        for (position, merged) in topics.iter_mut().enumerate() {
            if self.events.iter().any(|e| e.filter.topics[position].is_empty()) {
                continue;
            }
            for event in &self.events {
                for topic in &event.filter.topics[position] {
                    if !merged.contains(topic) {
                        merged.push(*topic);
                    }
                }
            }
        }
        while topics.last().is_some_and(|t| t.is_empty()) {
            topics.pop();
        }

        FilterQuery {
            addresses,
            topics,
            ..Default::default()
        }
    }

    /// Everything one poll iteration needs, detached from the builder.
    pub fn dispatch_set(&mut self) -> DispatchSet {
        DispatchSet {
            headers: self.headers.clone(),
            blocks: self.blocks.clone(),
            blocks_with_logs: self.blocks_with_logs.clone(),
            events: self.events.clone(),
            query: self.query(),
        }
    }
}
