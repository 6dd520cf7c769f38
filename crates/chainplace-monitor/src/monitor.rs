//! The chain monitor poll loop.
//!
//! # Iteration
//! 1. Fetch the latest header. On failure back off and retry.
//! 2. Nothing to do while the cursor is ahead of the head.
//! 3. Scan `[cursor, min(head, cursor + max_block_range)]`.
//! 4. Fetch logs for the range when any log subscriber exists. On failure the
//!    whole range is retried next iteration.
//! 5. Dispatch per callback class on a `JoinSet` and wait for all of it.
//! 6. Advance the cursor past the range.
//!
//! Registrations may happen at any time, including from inside callbacks.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use alloy_primitives::{Address, B256};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use chainplace_core::{BlockNumber, Header, LedgerClient, Log};

use crate::builder::{
    block_callback, block_with_logs_callback, header_callback, log_callback, stopped_callback,
    DispatchSet, EventSubscriptionBuilder,
};
use crate::config::MonitorConfig;
use crate::error::MonitorError;
use crate::metrics::{MonitorMetrics, MonitorMetricsSnapshot};
use crate::poll::{DefaultPollInterval, PollInterval};

/// Segments at least this long are logged when blocks are slow enough that
/// it indicates falling behind.
const SEGMENT_LOG_MIN_BLOCKS: u64 = 3;
const SEGMENT_LOG_MIN_PERIOD: Duration = Duration::from_millis(750);

/// Lifecycle of a [`ChainMonitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Created,
    Running,
    Stopped,
}

impl std::fmt::Display for MonitorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

enum Outcome {
    Failed,
    NoNewBlock,
    Processed { hit_block_range_limit: bool },
}

struct Shared {
    builder: EventSubscriptionBuilder,
    /// Next block the loop scans. `None` until the first subscription or start.
    from_block: Option<BlockNumber>,
    state: MonitorState,
    /// Set while an iteration dispatches outside the lock.
    dispatching: bool,
    /// Start blocks of subscriptions registered during dispatch.
    deferred: Vec<BlockNumber>,
}

impl Shared {
    /// `on_subscribe` may pull the cursor back but never forward; the loop
    /// only ever moves it forward.
    fn set_from_block(&mut self, from: BlockNumber, on_subscribe: bool) {
        match self.from_block {
            None => self.from_block = Some(from),
            Some(current) if on_subscribe && current > from => self.from_block = Some(from),
            Some(current) if !on_subscribe && current < from => self.from_block = Some(from),
            Some(_) => {}
        }
    }

    fn subscribed_from(&mut self, from: BlockNumber) {
        if self.dispatching {
            self.deferred.push(from);
        } else {
            self.set_from_block(from, true);
        }
    }

    fn finish_iteration(&mut self, processed_to: Option<BlockNumber>) {
        self.dispatching = false;
        if let Some(to) = processed_to {
            self.set_from_block(to.next(), false);
        }
        for from in std::mem::take(&mut self.deferred) {
            self.set_from_block(from, true);
        }
    }
}

struct Inner {
    config: MonitorConfig,
    shared: Mutex<Shared>,
    metrics: MonitorMetrics,
}

/// Polls a ledger and delivers headers, blocks and logs to subscribers.
///
/// Cheap to clone; clones share subscriptions and the cursor.
#[derive(Clone)]
pub struct ChainMonitor {
    inner: Arc<Inner>,
}

impl ChainMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                shared: Mutex::new(Shared {
                    builder: EventSubscriptionBuilder::new(),
                    from_block: None,
                    state: MonitorState::Created,
                    dispatching: false,
                    deferred: Vec::new(),
                }),
                metrics: MonitorMetrics::default(),
            }),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    pub fn state(&self) -> MonitorState {
        self.inner.shared.lock().unwrap().state
    }

    /// Next block the poll loop will scan.
    pub fn from_block(&self) -> Option<BlockNumber> {
        self.inner.shared.lock().unwrap().from_block
    }

    pub fn metrics(&self) -> MonitorMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Called with the latest header once per iteration that saw new blocks.
    /// Intermediate headers are skipped.
    pub fn on_header<F, Fut>(&self, cb: F)
    where
        F: Fn(Header) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner
            .shared
            .lock()
            .unwrap()
            .builder
            .on_header(header_callback(cb));
    }

    /// Called for every block from the current cursor on, in order, without gaps.
    pub fn on_block<F, Fut>(&self, cb: F)
    where
        F: Fn(BlockNumber) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shared = self.inner.shared.lock().unwrap();
        let from = shared.from_block.unwrap_or_default();
        shared.builder.on_block(from, block_callback(cb));
    }

    /// Called for every block from `from` on with the logs of that block,
    /// possibly none.
    pub fn on_block_with_logs<F, Fut>(&self, from: BlockNumber, cb: F)
    where
        F: Fn(BlockNumber, Vec<Log>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shared = self.inner.shared.lock().unwrap();
        shared
            .builder
            .on_block_with_logs(from, block_with_logs_callback(cb));
        shared.subscribed_from(from);
    }

    /// Called for every log from `from` on.
    pub fn on_all_events<F, Fut>(&self, from: BlockNumber, cb: F)
    where
        F: Fn(Log) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shared = self.inner.shared.lock().unwrap();
        shared.builder.on_all_events(from, log_callback(cb));
        shared.subscribed_from(from);
    }

    /// Called for every log emitted by `address` from `from` on.
    pub fn on_contract_event<F, Fut>(&self, from: BlockNumber, address: Address, cb: F)
    where
        F: Fn(Log) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shared = self.inner.shared.lock().unwrap();
        shared
            .builder
            .on_contract_event(from, address, log_callback(cb));
        shared.subscribed_from(from);
    }

    /// Like [`on_contract_event`](Self::on_contract_event), restricted to logs
    /// whose topic at position `i` is one of `topics[i]`.
    pub fn on_contract_with_topics_event<F, Fut>(
        &self,
        from: BlockNumber,
        address: Address,
        topics: Vec<Vec<B256>>,
        cb: F,
    ) where
        F: Fn(Log) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shared = self.inner.shared.lock().unwrap();
        shared
            .builder
            .on_contract_with_topics_event(from, address, topics, log_callback(cb));
        shared.subscribed_from(from);
    }

    /// Called once after the monitor stopped.
    pub fn on_stopped<F, Fut>(&self, cb: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner
            .shared
            .lock()
            .unwrap()
            .builder
            .on_stopped(stopped_callback(cb));
    }

    /// Start the poll loop in the background, scanning from `initial_block`
    /// unless a subscription asked for an earlier block. Runs until `cancel`
    /// fires. Only the first call starts anything.
    pub fn start(
        &self,
        client: Arc<dyn LedgerClient>,
        initial_block: BlockNumber,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, MonitorError> {
        {
            let mut shared = self.inner.shared.lock().unwrap();
            if shared.state != MonitorState::Created {
                tracing::error!(state = %shared.state, "chain monitor already started");
                return Err(MonitorError::AlreadyStarted);
            }
            shared.state = MonitorState::Running;
        }

        let inner = Arc::clone(&self.inner);
        Ok(tokio::spawn(async move {
            inner.run(client, initial_block, cancel).await
        }))
    }
}

impl Inner {
    async fn run(
        self: Arc<Self>,
        client: Arc<dyn LedgerClient>,
        initial_block: BlockNumber,
        cancel: CancellationToken,
    ) {
        let mut poll =
            DefaultPollInterval::new(self.config.block_period, self.config.err_slowdown_limit);

        let Some(chain_id) = self.resolve_chain_id(client.as_ref(), &mut poll, &cancel).await
        else {
            self.shutdown().await;
            return;
        };
        self.metrics.set_chain_id(chain_id);

        {
            let mut shared = self.shared.lock().unwrap();
            shared.set_from_block(initial_block, true);
            shared.builder.rewind_block_subscriptions(initial_block);
        }

        tracing::debug!(
            chain = %self.config.chain,
            chain_id,
            block_period_ms = self.config.block_period.as_millis() as u64,
            from_block = %initial_block,
            "chain monitor started"
        );

        let mut poll_interval = Duration::ZERO;
        loop {
            self.metrics.inc_poll();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.shutdown().await;
                    return;
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }

            let start = Instant::now();
            poll_interval = match self.iterate(client.as_ref()).await {
                Outcome::Failed => poll.interval(start.elapsed(), false, false, true),
                Outcome::NoNewBlock => poll.interval(start.elapsed(), false, false, false),
                Outcome::Processed {
                    hit_block_range_limit,
                } => poll.interval(start.elapsed(), true, hit_block_range_limit, false),
            };
        }
    }

    async fn resolve_chain_id(
        &self,
        client: &dyn LedgerClient,
        poll: &mut DefaultPollInterval,
        cancel: &CancellationToken,
    ) -> Option<u64> {
        loop {
            let start = Instant::now();
            match client.chain_id().await {
                Ok(id) => return Some(id),
                Err(e) => {
                    let wait = poll.interval(start.elapsed(), false, false, true);
                    tracing::warn!(error = %e, retry_ms = wait.as_millis() as u64, "unable to load chain id");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    async fn iterate(&self, client: &dyn LedgerClient) -> Outcome {
        let head = match client.latest_header().await {
            Ok(head) => head,
            Err(e) => {
                tracing::warn!(error = %e, "chain monitor is unable to retrieve chain head");
                return Outcome::Failed;
            }
        };
        self.metrics.set_head(head.number.as_u64(), head.base_fee);

        let (from, dispatch) = {
            let mut shared = self.shared.lock().unwrap();
            match shared.from_block {
                Some(from) if from <= head.number => {
                    shared.dispatching = true;
                    (from, shared.builder.dispatch_set())
                }
                _ => return Outcome::NoNewBlock,
            }
        };

        let mut to = head.number;
        let mut hit_block_range_limit = false;
        if head.number.as_u64() - from.as_u64() > self.config.max_block_range {
            to = BlockNumber(from.as_u64() + self.config.max_block_range);
            hit_block_range_limit = true;
        }

        if to.as_u64() - from.as_u64() >= SEGMENT_LOG_MIN_BLOCKS
            && self.config.block_period >= SEGMENT_LOG_MIN_PERIOD
        {
            tracing::info!(from = %from, to = %to, "process chain segment");
        }

        let logs = if dispatch.needs_logs() {
            let query = dispatch.query.clone().with_range(from, to);
            match client.filter_logs(&query).await {
                Ok(logs) => {
                    self.metrics.add_received_events(logs.len());
                    logs.into_iter().filter(|log| !log.removed).collect()
                }
                Err(e) => {
                    tracing::warn!(error = %e, from = %from, to = %to, "unable to retrieve logs");
                    self.shared.lock().unwrap().finish_iteration(None);
                    return Outcome::Failed;
                }
            }
        } else {
            Vec::new()
        };

        dispatch_range(dispatch, head, from, to, logs).await;

        self.shared.lock().unwrap().finish_iteration(Some(to));
        self.metrics.set_processed(to.as_u64());

        Outcome::Processed {
            hit_block_range_limit,
        }
    }

    async fn shutdown(&self) {
        tracing::debug!(chain = %self.config.chain, "initiate chain monitor shutdown");
        let stopped = {
            let mut shared = self.shared.lock().unwrap();
            shared.state = MonitorState::Stopped;
            shared.builder.stopped_callbacks()
        };

        let run_all = async {
            for cb in stopped {
                cb().await;
            }
        };
        if tokio::time::timeout(self.config.shutdown_grace, run_all)
            .await
            .is_err()
        {
            tracing::warn!(
                grace_ms = self.config.shutdown_grace.as_millis() as u64,
                "stopped callbacks did not finish within the grace period"
            );
        }
        tracing::debug!(chain = %self.config.chain, "chain monitor stopped");
    }
}

/// Fan out one iteration over `[from, to]` and wait for every callback.
async fn dispatch_range(
    dispatch: DispatchSet,
    head: Header,
    from: BlockNumber,
    to: BlockNumber,
    logs: Vec<Log>,
) {
    let logs = Arc::new(logs);
    let mut tasks = JoinSet::new();

    if !dispatch.headers.is_empty() {
        let callbacks = dispatch.headers;
        tasks.spawn(async move {
            for cb in callbacks {
                cb(head.clone()).await;
            }
        });
    }

    if !dispatch.blocks.is_empty() {
        let subs = dispatch.blocks;
        tasks.spawn(async move {
            for n in from.as_u64()..=to.as_u64() {
                let block = BlockNumber(n);
                for sub in subs.iter().filter(|s| s.wants(block)) {
                    (sub.callback)(block).await;
                }
            }
            for sub in &subs {
                sub.delivered_through(to);
            }
        });
    }

    for sub in dispatch.blocks_with_logs {
        let logs = Arc::clone(&logs);
        tasks.spawn(async move {
            let first = from.max(sub.next_block()).as_u64();
            for n in first..=to.as_u64() {
                let block = BlockNumber(n);
                let block_logs: Vec<Log> = logs
                    .iter()
                    .filter(|log| log.block_number == block)
                    .cloned()
                    .collect();
                (sub.callback)(block, block_logs).await;
            }
            sub.delivered_through(to);
        });
    }

    if !dispatch.events.is_empty() {
        let subs = dispatch.events;
        let logs = Arc::clone(&logs);
        tasks.spawn(async move {
            for log in logs.iter() {
                for event in &subs {
                    if event.sub.wants(log.block_number) && event.filter.matches(log) {
                        (event.sub.callback)(log.clone()).await;
                    }
                }
            }
            for event in &subs {
                event.sub.delivered_through(to);
            }
        });
    }

    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            tracing::error!(error = %e, from = %from, to = %to, "chain monitor callback task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chainplace_core::MemoryChain;

    fn shared() -> Shared {
        Shared {
            builder: EventSubscriptionBuilder::new(),
            from_block: None,
            state: MonitorState::Created,
            dispatching: false,
            deferred: Vec::new(),
        }
    }

    fn fast_config() -> MonitorConfig {
        MonitorConfig::builder()
            .block_period(Duration::from_millis(20))
            .shutdown_grace(Duration::from_millis(200))
            .build()
    }

    #[test]
    fn cursor_rules() {
        let mut s = shared();
        s.set_from_block(BlockNumber(10), false);
        assert_eq!(s.from_block, Some(BlockNumber(10)));

        // subscribe can move back, not forward
        s.set_from_block(BlockNumber(15), true);
        assert_eq!(s.from_block, Some(BlockNumber(10)));
        s.set_from_block(BlockNumber(5), true);
        assert_eq!(s.from_block, Some(BlockNumber(5)));

        // loop can move forward, not back
        s.set_from_block(BlockNumber(3), false);
        assert_eq!(s.from_block, Some(BlockNumber(5)));
        s.set_from_block(BlockNumber(8), false);
        assert_eq!(s.from_block, Some(BlockNumber(8)));
    }

    #[test]
    fn subscription_during_dispatch_applies_after_advance() {
        let mut s = shared();
        s.set_from_block(BlockNumber(10), true);
        s.dispatching = true;
        s.subscribed_from(BlockNumber(4));
        assert_eq!(s.from_block, Some(BlockNumber(10)));

        s.finish_iteration(Some(BlockNumber(12)));
        assert_eq!(s.from_block, Some(BlockNumber(4)));
        assert!(s.deferred.is_empty());
        assert!(!s.dispatching);
    }

    #[test]
    fn failed_iteration_keeps_cursor() {
        let mut s = shared();
        s.set_from_block(BlockNumber(10), true);
        s.dispatching = true;
        s.finish_iteration(None);
        assert_eq!(s.from_block, Some(BlockNumber(10)));
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let chain = Arc::new(MemoryChain::new(1, Address::ZERO));
        let monitor = ChainMonitor::new(fast_config());
        let cancel = CancellationToken::new();

        let handle = monitor
            .start(chain.clone(), BlockNumber(0), cancel.clone())
            .unwrap();
        assert_eq!(monitor.state(), MonitorState::Running);
        assert_eq!(
            monitor.start(chain, BlockNumber(0), cancel.clone()).unwrap_err(),
            MonitorError::AlreadyStarted
        );

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(monitor.state(), MonitorState::Stopped);
    }

    #[tokio::test]
    async fn header_callbacks_see_latest_head() {
        let chain = Arc::new(MemoryChain::new(1, Address::ZERO));
        chain.commit_blocks(5);

        let monitor = ChainMonitor::new(fast_config());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        monitor.on_header(move |header| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(header.number);
            }
        });

        let cancel = CancellationToken::new();
        let handle = monitor.start(chain, BlockNumber(0), cancel.clone()).unwrap();
        let head = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head, BlockNumber(5));

        cancel.cancel();
        handle.await.unwrap();
        assert!(monitor.metrics().poll_iterations >= 1);
        assert_eq!(monitor.metrics().chain_id, 1);
    }

    #[tokio::test]
    async fn slow_stopped_callback_is_cut_off() {
        let chain = Arc::new(MemoryChain::new(1, Address::ZERO));
        let monitor = ChainMonitor::new(fast_config());
        let finished = Arc::new(AtomicUsize::new(0));
        let f = finished.clone();
        monitor.on_stopped(move || {
            let f = f.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                f.fetch_add(1, Ordering::SeqCst);
            }
        });

        let cancel = CancellationToken::new();
        let handle = monitor.start(chain, BlockNumber(0), cancel.clone()).unwrap();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }
}
