//! RateLimiter - category ごとのスライディングウィンドウ
//!
//! # アルゴリズム
//! 1. window より古い timestamp を捨てる
//! 2. block 中（`blocked_until > now`）なら拒否
//! 3. window 内の件数が `max_actions` 以上なら拒否し、`block_duration` が
//!    設定されていれば `blocked_until = now + block_duration`
//! 4. それ以外は許可して `now` を記録
//!
//! 拒否はエラーではなく `false` / `0` で返します。フィードバックの出し方は
//! 呼び出し側が決めます。
//!
//! actor ごとの window は `SWEEP_INTERVAL` おきに掃除し、空になったものは捨てます。

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::{RateLimitConfig, SyncConfig};
use crate::domain::Category;
use crate::ports::Clock;
use crate::ports::clock::{add_std, until};

/// Admission state of one category (and actor) at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub remaining: u32,
    pub blocked_for_ms: u64,
}

impl RateLimitStatus {
    pub const UNLIMITED: RateLimitStatus = RateLimitStatus {
        remaining: u32::MAX,
        blocked_for_ms: 0,
    };
}

type LimitKey = (Category, Option<String>);

const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Debug, Default)]
struct WindowState {
    recent: VecDeque<DateTime<Utc>>,
    blocked_until: Option<DateTime<Utc>>,
}

impl WindowState {
    fn purge(&mut self, now: DateTime<Utc>, limit: &RateLimitConfig) {
        let window = limit.window();
        while let Some(&oldest) = self.recent.front() {
            if until(oldest, now) >= window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        if self.blocked_until.is_some_and(|at| at <= now) {
            self.blocked_until = None;
        }
    }

    /// Entries still inside the window at `now`, without mutating.
    fn live(&self, now: DateTime<Utc>, limit: &RateLimitConfig) -> usize {
        let window = limit.window();
        self.recent
            .iter()
            .filter(|&&t| until(t, now) < window)
            .count()
    }

    fn blocked_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.blocked_until.filter(|&at| at > now)
    }

    fn is_idle(&self) -> bool {
        self.recent.is_empty() && self.blocked_until.is_none()
    }
}

/// Sliding-window admission control keyed by category and optional actor.
///
/// Categories without a configured limit (and no default) are unlimited.
pub struct RateLimiter<C> {
    clock: C,
    limits: HashMap<Category, RateLimitConfig>,
    default_limit: Option<RateLimitConfig>,
    states: HashMap<LimitKey, WindowState>,
    next_sweep: Option<DateTime<Utc>>,
}

impl<C: Clock> RateLimiter<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            limits: HashMap::new(),
            default_limit: None,
            states: HashMap::new(),
            next_sweep: None,
        }
    }

    pub fn from_config(config: &SyncConfig, clock: C) -> Self {
        let mut limiter = Self::new(clock);
        for (category, limit) in &config.rate_limits {
            limiter = limiter.with_limit(Category::new(category.as_str()), *limit);
        }
        limiter.default_limit = config.default_rate_limit;
        limiter
    }

    pub fn with_limit(mut self, category: impl Into<Category>, limit: RateLimitConfig) -> Self {
        self.limits.insert(category.into(), limit);
        self
    }

    pub fn with_default(mut self, limit: RateLimitConfig) -> Self {
        self.default_limit = Some(limit);
        self
    }

    fn limit_for(&self, category: &Category) -> Option<RateLimitConfig> {
        self.limits.get(category).copied().or(self.default_limit)
    }

    fn state(&self, category: &Category, actor: Option<&str>) -> Option<&WindowState> {
        self.states
            .get(&(category.clone(), actor.map(str::to_string)))
    }

    /// Check and record in one step.
    pub fn try_admit(&mut self, category: &Category) -> bool {
        self.try_admit_for(category, None)
    }

    pub fn try_admit_for(&mut self, category: &Category, actor: Option<&str>) -> bool {
        let Some(limit) = self.limit_for(category) else {
            return true;
        };
        let now = self.clock.now();
        self.maybe_sweep(now);
        let state = self
            .states
            .entry((category.clone(), actor.map(str::to_string)))
            .or_default();
        state.purge(now, &limit);

        if let Some(blocked_until) = state.blocked_until {
            debug!(%category, ?actor, %blocked_until, "rate limit: blocked");
            return false;
        }

        if state.recent.len() >= limit.max_actions as usize {
            if let Some(block) = limit.block_duration() {
                state.blocked_until = Some(add_std(now, block));
            }
            debug!(
                %category,
                ?actor,
                max_actions = limit.max_actions,
                window_ms = limit.window_ms,
                "rate limit: window full"
            );
            return false;
        }

        state.recent.push_back(now);
        true
    }

    /// Check only; never records and never starts a block.
    pub fn can_admit(&self, category: &Category) -> bool {
        self.can_admit_for(category, None)
    }

    pub fn can_admit_for(&self, category: &Category, actor: Option<&str>) -> bool {
        self.remaining_for(category, actor) > 0
    }

    pub fn remaining(&self, category: &Category) -> u32 {
        self.remaining_for(category, None)
    }

    pub fn remaining_for(&self, category: &Category, actor: Option<&str>) -> u32 {
        let Some(limit) = self.limit_for(category) else {
            return u32::MAX;
        };
        let Some(state) = self.state(category, actor) else {
            return limit.max_actions;
        };
        let now = self.clock.now();
        if state.blocked_at(now).is_some() {
            return 0;
        }
        let live = u32::try_from(state.live(now, &limit)).unwrap_or(u32::MAX);
        limit.max_actions.saturating_sub(live)
    }

    /// Milliseconds until the next admission can succeed: the remaining
    /// block if one is active, otherwise the time until the oldest recorded
    /// action leaves a full window. Zero when admission is possible now.
    pub fn blocked_for_ms(&self, category: &Category) -> u64 {
        self.blocked_for_ms_for(category, None)
    }

    pub fn blocked_for_ms_for(&self, category: &Category, actor: Option<&str>) -> u64 {
        let (Some(limit), Some(state)) = (self.limit_for(category), self.state(category, actor))
        else {
            return 0;
        };
        let now = self.clock.now();
        if let Some(blocked_until) = state.blocked_at(now) {
            return millis(until(now, blocked_until));
        }
        if state.live(now, &limit) < limit.max_actions as usize {
            return 0;
        }
        let window = limit.window();
        state
            .recent
            .iter()
            .find(|&&t| until(t, now) < window)
            .map_or(0, |&oldest| {
                millis(window.saturating_sub(until(oldest, now)))
            })
    }

    pub fn status(&self, category: &Category) -> RateLimitStatus {
        self.status_for(category, None)
    }

    pub fn status_for(&self, category: &Category, actor: Option<&str>) -> RateLimitStatus {
        if self.limit_for(category).is_none() {
            return RateLimitStatus::UNLIMITED;
        }
        RateLimitStatus {
            remaining: self.remaining_for(category, actor),
            blocked_for_ms: self.blocked_for_ms_for(category, actor),
        }
    }

    fn maybe_sweep(&mut self, now: DateTime<Utc>) {
        if self.next_sweep.is_some_and(|at| now < at) {
            return;
        }
        let limits = &self.limits;
        let default_limit = self.default_limit;
        let before = self.states.len();
        self.states.retain(|(category, _), state| {
            match limits.get(category).copied().or(default_limit) {
                Some(limit) => {
                    state.purge(now, &limit);
                    !state.is_idle()
                }
                None => false,
            }
        });
        let swept = before - self.states.len();
        if swept > 0 {
            debug!(swept, tracked = self.states.len(), "rate limit: idle windows swept");
        }
        self.next_sweep = Some(add_std(now, SWEEP_INTERVAL));
    }

    /// Forget all recorded actions and blocks of `category`, for every actor.
    pub fn reset(&mut self, category: &Category) {
        self.states.retain(|(c, _), _| c != category);
    }
}

fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
