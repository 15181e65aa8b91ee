use std::{
    collections::HashSet,
    sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use chat_core::{AccountData, ChatError, ChatMap, CycleOutcome, fold_cycle};
use tokio::time::Instant;

/// Per-engine session state. Every field has its own lock so metadata reads
/// never wait on an in-flight poll and vice versa; readers get copies.
#[derive(Debug, Default)]
pub(crate) struct Session {
    token: RwLock<Option<String>>,
    watermark: Mutex<f64>,
    last_refresh: Mutex<Option<Instant>>,
    known_ids: Mutex<HashSet<String>>,
    users: RwLock<AccountData>,
}

impl Session {
    pub(crate) fn token(&self) -> Option<String> {
        read(&self.token).clone()
    }

    pub(crate) fn require_token(&self) -> Result<String, ChatError> {
        self.token().ok_or_else(ChatError::not_authenticated)
    }

    pub(crate) fn set_token(&self, token: Option<String>) {
        *write(&self.token) = token;
    }

    pub(crate) fn watermark(&self) -> f64 {
        *lock(&self.watermark)
    }

    pub(crate) fn set_watermark(&self, watermark: f64) {
        *lock(&self.watermark) = watermark;
    }

    /// Start the watermark at `now` unless one was set before.
    pub(crate) fn init_watermark(&self, now: f64) {
        let mut watermark = lock(&self.watermark);
        if *watermark == 0.0 {
            *watermark = now;
        }
    }

    pub(crate) fn known_ids(&self) -> HashSet<String> {
        lock(&self.known_ids).clone()
    }

    /// Fold a poll response against the current known-ID set.
    pub(crate) fn fold(&self, chats: ChatMap, watermark: f64) -> CycleOutcome {
        let known = lock(&self.known_ids);
        fold_cycle(&known, chats, watermark)
    }

    pub(crate) fn replace_known_ids(&self, ids: HashSet<String>) {
        *lock(&self.known_ids) = ids;
    }

    /// Sorted snapshot of the account's user names.
    pub(crate) fn user_keys(&self) -> Vec<String> {
        let mut users: Vec<String> = read(&self.users).keys().cloned().collect();
        users.sort_unstable();
        users
    }

    pub(crate) fn account_data(&self) -> AccountData {
        read(&self.users).clone()
    }

    /// Overwrite the users present in `fresh`, keep everyone else.
    pub(crate) fn merge_account_data(&self, fresh: AccountData) -> AccountData {
        let mut users = write(&self.users);
        users.extend(fresh);
        users.clone()
    }

    pub(crate) fn mark_refreshed(&self, at: Instant) {
        *lock(&self.last_refresh) = Some(at);
    }

    pub(crate) fn refresh_due(&self, now: Instant, interval: Duration) -> bool {
        lock(&self.last_refresh)
            .is_none_or(|refreshed| now.saturating_duration_since(refreshed) >= interval)
    }

    /// Drop the token and everything learned under it. The watermark stays.
    pub(crate) fn clear(&self) {
        self.set_token(None);
        lock(&self.known_ids).clear();
        write(&self.users).clear();
        *lock(&self.last_refresh) = None;
    }
}

// Every guarded value is replaced whole, so a poisoned lock still holds a
// consistent value.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
