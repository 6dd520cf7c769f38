//! Next-poll delay calculation.

use std::time::Duration;

const MAX_ERR_COUNTER: u32 = 10_000;
const STALE_RETRY: Duration = Duration::from_millis(250);
const STALE_FAST_POLLS: u32 = 2;

/// Decides how long the poll loop sleeps before the next iteration.
pub trait PollInterval: Send {
    /// `took` is the duration of the iteration that just finished.
    fn interval(
        &mut self,
        took: Duration,
        got_block: bool,
        hit_block_range_limit: bool,
        got_err: bool,
    ) -> Duration;
}

/// Backs off linearly on errors, drains backlogs immediately and otherwise
/// tries to poll just after the next block is produced.
#[derive(Debug, Clone)]
pub struct DefaultPollInterval {
    block_period: Duration,
    /// Shaved off each caught-up poll to creep towards the block production moment.
    close_down: Duration,
    err_slowdown_limit: Duration,
    err_counter: u32,
    no_block_counter: u32,
}

impl DefaultPollInterval {
    pub fn new(block_period: Duration, err_slowdown_limit: Duration) -> Self {
        Self {
            block_period,
            close_down: (block_period / 50).max(Duration::from_millis(25)),
            err_slowdown_limit: err_slowdown_limit.max(Duration::from_secs(1)),
            err_counter: 0,
            no_block_counter: 0,
        }
    }
}

impl PollInterval for DefaultPollInterval {
    fn interval(
        &mut self,
        took: Duration,
        got_block: bool,
        hit_block_range_limit: bool,
        got_err: bool,
    ) -> Duration {
        if got_err {
            self.err_counter = (self.err_counter + 1).min(MAX_ERR_COUNTER);
            return (self.block_period * self.err_counter).min(self.err_slowdown_limit);
        }
        self.err_counter = 0;

        if hit_block_range_limit {
            self.no_block_counter = 0;
            return Duration::ZERO;
        }

        if got_block {
            self.no_block_counter = 0;
            return self
                .block_period
                .saturating_sub(took)
                .saturating_sub(self.close_down);
        }

        self.no_block_counter = self.no_block_counter.saturating_add(1);
        if self.no_block_counter <= STALE_FAST_POLLS {
            STALE_RETRY
        } else {
            // chain or rpc node stalled
            self.block_period
        }
    }
}
