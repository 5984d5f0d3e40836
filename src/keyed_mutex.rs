// ABOUTME: Reference-counted per-key mutual exclusion, used to serialize writes per connection
// ABOUTME: Entries are created on first acquire and reclaimed once their last waiter releases

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Semaphore;

struct Entry {
    semaphore: Arc<Semaphore>,
    waiters: usize,
}

/// A map from key to binary semaphore, with entries torn down once nobody still holds or
/// awaits them.
///
/// Acquiring the same key twice concurrently serializes the two callers; acquiring
/// different keys never blocks on each other. The per-key entry is removed from the map
/// as soon as its waiter count returns to zero, so long-lived processes juggling many
/// short-lived keys (one per connection id, here) don't accumulate dead entries.
pub struct KeyedMutex<K> {
    entries: StdMutex<HashMap<K, Entry>>,
}

impl<K> Default for KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        KeyedMutex {
            entries: StdMutex::new(HashMap::new()),
        }
    }

    /// Acquire the lock for `key`, awaiting any current holder. Returns a guard that
    /// releases on drop.
    pub async fn acquire(&self, key: K) -> KeyedMutexGuard<'_, K> {
        let semaphore = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                semaphore: Arc::new(Semaphore::new(1)),
                waiters: 0,
            });
            entry.waiters += 1;
            entry.semaphore.clone()
        };

        // The permit borrows `semaphore`, so we must keep `semaphore` alive inside the
        // guard rather than letting it drop here.
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed");

        KeyedMutexGuard {
            owner: self,
            key,
            _permit: permit,
        }
    }

    /// Attempt to acquire the lock for `key` without waiting. Returns `None` if another
    /// caller currently holds it. No call site in this crate needs the non-blocking
    /// form today; kept for API completeness alongside the awaited `acquire`.
    pub fn try_acquire(&self, key: K) -> Option<KeyedMutexGuard<'_, K>> {
        let semaphore = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                semaphore: Arc::new(Semaphore::new(1)),
                waiters: 0,
            });
            entry.semaphore.clone()
        };

        let permit = semaphore.try_acquire_owned().ok()?;

        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&key) {
            entry.waiters += 1;
        }
        drop(entries);

        Some(KeyedMutexGuard {
            owner: self,
            key,
            _permit: permit,
        })
    }

    fn release(&self, key: &K) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(key) {
            entry.waiters -= 1;
            if entry.waiters == 0 {
                entries.remove(key);
            }
        } else {
            tracing::trace!("release() called for a key with no live entry");
        }
    }
}

/// RAII guard returned by [`KeyedMutex::acquire`]. Releasing happens automatically on drop.
pub struct KeyedMutexGuard<'a, K>
where
    K: Eq + Hash + Clone,
{
    owner: &'a KeyedMutex<K>,
    key: K,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl<K> Drop for KeyedMutexGuard<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        self.owner.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_serializes() {
        let mutex: Arc<KeyedMutex<u32>> = Arc::new(KeyedMutex::new());
        let counter = Arc::new(AtomicU32::new(0));
        let max_concurrent = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let mutex = mutex.clone();
            let counter = counter.clone();
            let max_concurrent = max_concurrent.clone();
            handles.push(tokio::spawn(async move {
                let _guard = mutex.acquire(1u32).await;
                let cur = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(cur, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let mutex: Arc<KeyedMutex<u32>> = Arc::new(KeyedMutex::new());
        let g1 = mutex.acquire(1u32).await;
        let g2 = tokio::time::timeout(Duration::from_millis(50), mutex.acquire(2u32))
            .await
            .expect("different key must not block");
        drop(g1);
        drop(g2);
    }

    #[tokio::test]
    async fn try_acquire_fails_while_held_and_succeeds_after_release() {
        let mutex: KeyedMutex<u32> = KeyedMutex::new();
        let guard = mutex.acquire(9u32).await;
        assert!(mutex.try_acquire(9u32).is_none());
        drop(guard);
        assert!(mutex.try_acquire(9u32).is_some());
    }

    #[tokio::test]
    async fn entry_is_reclaimed_after_release() {
        let mutex: KeyedMutex<u32> = KeyedMutex::new();
        {
            let _guard = mutex.acquire(42u32).await;
        }
        assert!(mutex.entries.lock().unwrap().is_empty());
    }
}
