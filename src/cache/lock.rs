//! Per-key exclusive locks with expiry and a FIFO wait queue.
//!
//! Every `(namespace, key)` pair has at most one live holder. A holder is
//! identified by an opaque [`LockToken`]; only that token can release it, and
//! the grant lapses by itself after the configured lock lifetime so a crashed
//! or forgetful holder cannot wedge a key.
//!
//! Contended acquirers queue behind the holder. On release (or when the holder
//! is found to have lapsed) the lock is handed directly to the oldest waiter
//! that is still listening, so waiters are served strictly in arrival order.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, trace};
use uuid::Uuid;

use super::config::LockMode;
use super::error::{DataServerError, Result, key_label};

/// Opaque credential proving ownership of a key's lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(String);

impl LockToken {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for LockToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

#[derive(Debug)]
struct Held {
    token: LockToken,
    acquired_at: Instant,
    expires_at: Instant,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    grant: oneshot::Sender<LockToken>,
}

#[derive(Debug, Default)]
struct Slot {
    held: Option<Held>,
    waiters: VecDeque<Waiter>,
}

impl Slot {
    // Drops a lapsed holder and passes the lock on. Returns the live deadline, if any.
    fn reap(&mut self, now: Instant, ttl: Duration) -> Option<Instant> {
        if self.held.as_ref().is_some_and(|held| held.expires_at <= now) {
            self.held = None;
        }
        if self.held.is_none() {
            self.promote(now, ttl);
        }
        self.held.as_ref().map(|held| held.expires_at)
    }

    // Grants the free lock to the first waiter whose receiver is still alive.
    fn promote(&mut self, now: Instant, ttl: Duration) {
        while let Some(waiter) = self.waiters.pop_front() {
            let token = LockToken::generate();
            if waiter.grant.send(token.clone()).is_ok() {
                self.held = Some(Held {
                    token,
                    acquired_at: now,
                    expires_at: now + ttl,
                });
                return;
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.held.is_none() && self.waiters.is_empty()
    }
}

type SlotKey = (String, String);

/// Table of key locks owned by one data server.
#[derive(Debug)]
pub struct LockTable {
    slots: Mutex<HashMap<SlotKey, Slot>>,
    next_waiter: AtomicU64,
    mode: LockMode,
    ttl: Duration,
}

impl LockTable {
    /// Creates an empty table whose grants last `ttl`.
    pub fn new(mode: LockMode, ttl: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_waiter: AtomicU64::new(0),
            mode,
            ttl,
        }
    }

    /// Acquires the lock on `namespace/key`, waiting at most `wait`.
    ///
    /// # Errors
    ///
    /// - [`DataServerError::Locked`] when the key is held and the table is in
    ///   fail-fast mode or `wait` is zero.
    /// - [`DataServerError::LockTimeout`] when `wait` elapses first.
    pub async fn acquire(&self, namespace: &str, key: &str, wait: Duration) -> Result<LockToken> {
        let slot_key = (namespace.to_owned(), key.to_owned());
        let started = Instant::now();
        let deadline = started + wait;

        let (id, mut granted) = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(slot_key.clone()).or_default();
            if slot.reap(started, self.ttl).is_none() {
                let token = LockToken::generate();
                slot.held = Some(Held {
                    token: token.clone(),
                    acquired_at: started,
                    expires_at: started + self.ttl,
                });
                trace!(namespace, key, "lock granted");
                return Ok(token);
            }

            if self.mode == LockMode::FailFast || wait.is_zero() {
                return Err(DataServerError::Locked(key_label(namespace, key)));
            }

            let id = self.next_id();
            let (tx, rx) = oneshot::channel();
            slot.waiters.push_back(Waiter { id, grant: tx });
            debug!(namespace, key, waiters = slot.waiters.len(), "waiting for lock");
            (id, rx)
        };

        loop {
            // wake either at our own deadline or when the holder lapses
            let wake = {
                let slots = self.slots.lock();
                slots
                    .get(&slot_key)
                    .and_then(|slot| slot.held.as_ref())
                    .map_or(deadline, |held| held.expires_at.min(deadline))
            };

            tokio::select! {
                token = &mut granted => {
                    return token.map_err(|_| {
                        DataServerError::LockTimeout(key_label(namespace, key))
                    });
                }
                _ = sleep_until(wake) => {}
            }

            let now = Instant::now();
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(&slot_key) {
                slot.reap(now, self.ttl);
            }
            if let Ok(token) = granted.try_recv() {
                return Ok(token);
            }
            if now >= deadline {
                if let Some(slot) = slots.get_mut(&slot_key) {
                    slot.waiters.retain(|waiter| waiter.id != id);
                    if slot.is_idle() {
                        slots.remove(&slot_key);
                    }
                }
                debug!(namespace, key, waited_ms = wait.as_millis() as u64, "lock wait timed out");
                return Err(DataServerError::LockTimeout(key_label(namespace, key)));
            }
        }
    }

    /// Releases the lock on `namespace/key` held under `token`.
    ///
    /// # Errors
    ///
    /// [`DataServerError::InvalidToken`] when `token` is not the live holder's
    /// token (wrong, already released, or lapsed). The lock state is untouched.
    pub fn release(&self, namespace: &str, key: &str, token: &LockToken) -> Result<()> {
        let slot_key = (namespace.to_owned(), key.to_owned());
        let now = Instant::now();
        let mut slots = self.slots.lock();

        let Some(slot) = slots.get_mut(&slot_key) else {
            return Err(DataServerError::InvalidToken(key_label(namespace, key)));
        };
        slot.reap(now, self.ttl);

        if slot.held.as_ref().is_none_or(|held| &held.token != token) {
            return Err(DataServerError::InvalidToken(key_label(namespace, key)));
        }

        let held_for = slot
            .held
            .take()
            .map(|held| now.saturating_duration_since(held.acquired_at));
        slot.promote(now, self.ttl);
        if slot.is_idle() {
            slots.remove(&slot_key);
        }
        trace!(namespace, key, held_for = ?held_for, "lock released");
        Ok(())
    }

    /// `true` when a live holder exists for `namespace/key`.
    pub fn is_locked(&self, namespace: &str, key: &str) -> bool {
        let now = Instant::now();
        let slots = self.slots.lock();
        slots
            .get(&(namespace.to_owned(), key.to_owned()))
            .and_then(|slot| slot.held.as_ref())
            .is_some_and(|held| held.expires_at > now)
    }

    /// How long the live holder of `namespace/key` has held it.
    pub fn held_for(&self, namespace: &str, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let slots = self.slots.lock();
        slots
            .get(&(namespace.to_owned(), key.to_owned()))
            .and_then(|slot| slot.held.as_ref())
            .filter(|held| held.expires_at > now)
            .map(|held| now.saturating_duration_since(held.acquired_at))
    }

    /// Drops every lapsed holder with no queue behind it.
    pub fn purge(&self) {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        slots.retain(|_, slot| {
            slot.reap(now, self.ttl);
            !slot.is_idle()
        });
    }

    fn next_id(&self) -> u64 {
        self.next_waiter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn table() -> Arc<LockTable> {
        Arc::new(LockTable::new(LockMode::Wait, Duration::from_secs(10)))
    }

    #[tokio::test(start_paused = true)]
    async fn held_for_tracks_the_live_grant() {
        let locks = table();
        assert_eq!(locks.held_for("ns", "a"), None);

        let token = locks.acquire("ns", "a", Duration::ZERO).await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(locks.held_for("ns", "a"), Some(Duration::from_secs(3)));

        // lapsed grants no longer count as held
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(locks.held_for("ns", "a"), None);
        assert!(locks.release("ns", "a", &token).is_err());
    }

    #[test]
    fn waiter_ids_are_unique_and_increasing() {
        let locks = LockTable::new(LockMode::Wait, Duration::from_secs(1));
        let first = locks.next_id();
        let second = locks.next_id();
        assert!(second > first);
    }

    #[tokio::test(start_paused = true)]
    async fn second_acquire_times_out() {
        let locks = table();
        let token = locks.acquire("ns", "a", Duration::ZERO).await.unwrap();

        let err = locks
            .acquire("ns", "a", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, DataServerError::LockTimeout(_)));

        locks.release("ns", "a", &token).unwrap();
        locks.acquire("ns", "a", Duration::ZERO).await.unwrap();
    }

    #[tokio::test]
    async fn zero_wait_reports_locked() {
        let locks = table();
        let _token = locks.acquire("ns", "a", Duration::ZERO).await.unwrap();
        let err = locks.acquire("ns", "a", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, DataServerError::Locked(_)));
    }

    #[tokio::test]
    async fn fail_fast_ignores_wait() {
        let locks = LockTable::new(LockMode::FailFast, Duration::from_secs(10));
        let _token = locks.acquire("ns", "a", Duration::ZERO).await.unwrap();
        let err = locks
            .acquire("ns", "a", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DataServerError::Locked(_)));
    }

    #[tokio::test]
    async fn keys_lock_independently() {
        let locks = table();
        locks.acquire("ns", "a", Duration::ZERO).await.unwrap();
        locks.acquire("ns", "b", Duration::ZERO).await.unwrap();
        locks.acquire("other", "a", Duration::ZERO).await.unwrap();
    }

    #[tokio::test]
    async fn wrong_token_leaves_lock_alone() {
        let locks = table();
        let token = locks.acquire("ns", "a", Duration::ZERO).await.unwrap();
        let bogus = LockToken::from("not-a-token".to_owned());

        let err = locks.release("ns", "a", &bogus).unwrap_err();
        assert!(matches!(err, DataServerError::InvalidToken(_)));
        assert!(locks.is_locked("ns", "a"));

        locks.release("ns", "a", &token).unwrap();
        assert!(!locks.is_locked("ns", "a"));
        // releasing twice is a stale token
        assert!(locks.release("ns", "a", &token).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn release_hands_off_to_waiter() {
        let locks = table();
        let token = locks.acquire("ns", "a", Duration::ZERO).await.unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire("ns", "a", Duration::from_secs(1)).await })
        };
        tokio::task::yield_now().await;

        locks.release("ns", "a", &token).unwrap();
        let handed = waiter.await.unwrap().unwrap();
        assert_ne!(handed, token);
        assert!(locks.is_locked("ns", "a"));
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_served_in_arrival_order() {
        let locks = table();
        let first = locks.acquire("ns", "a", Duration::ZERO).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let locks = Arc::clone(&locks);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let token = locks.acquire("ns", "a", Duration::from_secs(5)).await.unwrap();
                order.lock().push(i);
                locks.release("ns", "a", &token).unwrap();
            }));
            // let each waiter enqueue before spawning the next
            tokio::task::yield_now().await;
        }

        locks.release("ns", "a", &first).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_lock_lapses() {
        let locks = Arc::new(LockTable::new(LockMode::Wait, Duration::from_millis(100)));
        let stale = locks.acquire("ns", "a", Duration::ZERO).await.unwrap();

        // the waiter outlives the holder's grant
        let fresh = locks
            .acquire("ns", "a", Duration::from_secs(1))
            .await
            .unwrap();
        assert_ne!(fresh, stale);

        let err = locks.release("ns", "a", &stale).unwrap_err();
        assert!(matches!(err, DataServerError::InvalidToken(_)));
        locks.release("ns", "a", &fresh).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_waiter_is_skipped_on_handoff() {
        let locks = table();
        let token = locks.acquire("ns", "a", Duration::ZERO).await.unwrap();

        let impatient = locks.acquire("ns", "a", Duration::from_millis(10)).await;
        assert!(impatient.is_err());

        locks.release("ns", "a", &token).unwrap();
        assert!(!locks.is_locked("ns", "a"));
        locks.purge();
        assert!(locks.slots.lock().is_empty());
    }
}
