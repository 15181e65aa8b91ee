//! Per-category call spacing for outbound service requests.
//!
//! Each category is serialized: at most one [`RateSlot`] is live per category,
//! and a new slot is only granted once the category's minimum interval has
//! passed since the previous slot was released. A category counts as released
//! when its state is created, so even the first slot is spaced. Categories are
//! independent and each one sits behind its own lock.

use std::{
    collections::HashMap,
    fmt,
    hash::Hash,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{error::ChatError, types::DEFAULT_RATE_INTERVAL_MS};

/// Re-check delay while another holder owns the category.
pub const BUSY_RECHECK_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug)]
struct RateState {
    min_interval: Duration,
    last_release: Instant,
    busy: bool,
}

impl RateState {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_release: Instant::now(),
            busy: false,
        }
    }

    fn remaining_spacing(&self, now: Instant) -> Duration {
        self.min_interval
            .saturating_sub(now.saturating_duration_since(self.last_release))
    }
}

/// Serializing, spacing rate limiter keyed by category.
pub struct RateLimiter<K> {
    states: RwLock<HashMap<K, Arc<Mutex<RateState>>>>,
    default_interval_ms: AtomicU64,
}

impl<K> fmt::Debug for RateLimiter<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field(
                "default_interval_ms",
                &self.default_interval_ms.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl<K> Default for RateLimiter<K>
where
    K: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

impl<K> RateLimiter<K>
where
    K: Copy + Eq + Hash,
{
    /// Create a limiter from category → minimum interval in milliseconds.
    pub fn new(intervals_ms: HashMap<K, u64>) -> Self {
        let states = intervals_ms
            .into_iter()
            .map(|(category, interval_ms)| {
                let state = RateState::new(Duration::from_millis(interval_ms));
                (category, Arc::new(Mutex::new(state)))
            })
            .collect();

        Self {
            states: RwLock::new(states),
            default_interval_ms: AtomicU64::new(DEFAULT_RATE_INTERVAL_MS),
        }
    }

    pub fn with_default_interval_ms(self, interval_ms: u64) -> Self {
        self.set_default_interval_ms(interval_ms);
        self
    }

    /// Interval given to categories first used after this call.
    pub fn default_interval_ms(&self) -> u64 {
        self.default_interval_ms.load(Ordering::Relaxed)
    }

    pub fn set_default_interval_ms(&self, interval_ms: u64) {
        self.default_interval_ms
            .store(interval_ms, Ordering::Relaxed);
    }

    /// Minimum spacing applied to `category`.
    pub fn interval(&self, category: K) -> Duration {
        lock_state(&self.state_for(category)).min_interval
    }

    /// Whether a slot for `category` is currently held or reserved.
    pub fn is_busy(&self, category: K) -> bool {
        self.existing_state(category)
            .is_some_and(|state| lock_state(&state).busy)
    }

    /// Wait for exclusive use of `category`.
    ///
    /// Resolves once no other slot for the category is live and the minimum
    /// interval has elapsed since the last release, or since the category was
    /// first configured or used. Fails with
    /// [`ChatError::cancelled`] if `cancel` fires first; the category is then
    /// left free and its release time untouched.
    pub async fn acquire(
        &self,
        category: K,
        cancel: &CancellationToken,
    ) -> Result<RateSlot, ChatError> {
        let state = self.state_for(category);

        let spacing = loop {
            if cancel.is_cancelled() {
                return Err(ChatError::cancelled());
            }

            let reserved = {
                let mut guard = lock_state(&state);
                if guard.busy {
                    None
                } else {
                    guard.busy = true;
                    Some(guard.remaining_spacing(Instant::now()))
                }
            };

            match reserved {
                Some(spacing) => break spacing,
                None => sleep_cancellable(BUSY_RECHECK_DELAY, cancel).await?,
            }
        };

        let mut slot = RateSlot {
            state,
            granted: false,
        };
        if !spacing.is_zero() {
            trace!(spacing_ms = spacing.as_millis() as u64, "waiting out rate spacing");
            sleep_cancellable(spacing, cancel).await?;
        }
        slot.granted = true;
        Ok(slot)
    }

    fn existing_state(&self, category: K) -> Option<Arc<Mutex<RateState>>> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&category)
            .cloned()
    }

    fn state_for(&self, category: K) -> Arc<Mutex<RateState>> {
        if let Some(state) = self.existing_state(category) {
            return state;
        }

        let interval = Duration::from_millis(self.default_interval_ms());
        self.states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(category)
            .or_insert_with(|| Arc::new(Mutex::new(RateState::new(interval))))
            .clone()
    }
}

/// Exclusive use of one rate category. Dropping the slot releases it.
pub struct RateSlot {
    state: Arc<Mutex<RateState>>,
    granted: bool,
}

impl RateSlot {
    /// Release explicitly; equivalent to dropping the slot.
    pub fn release(self) {}
}

impl fmt::Debug for RateSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateSlot")
            .field("granted", &self.granted)
            .finish_non_exhaustive()
    }
}

impl Drop for RateSlot {
    fn drop(&mut self) {
        let mut state = lock_state(&self.state);
        // An abandoned reservation never reached the service.
        if self.granted {
            state.last_release = Instant::now();
        }
        state.busy = false;
    }
}

/// Sleep for `duration` unless `cancel` fires first.
pub async fn sleep_cancellable(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), ChatError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ChatError::cancelled()),
        _ = time::sleep(duration) => Ok(()),
    }
}

fn lock_state(state: &Mutex<RateState>) -> MutexGuard<'_, RateState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
