use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

/// Issues and consumes single-use `Replay-Nonce` values.
///
/// Nonces live only in memory; a restart invalidates every outstanding nonce and
/// clients recover by fetching a new one.
#[derive(Debug)]
pub struct NonceManager {
    nonces: Mutex<HashMap<String, Instant>>,
    num_bytes: usize,
    lifetime: Duration,
    housekeeping: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl NonceManager {
    pub fn new(num_bytes: usize, lifetime: Duration) -> Self {
        NonceManager {
            nonces: Mutex::new(HashMap::new()),
            num_bytes,
            lifetime,
            housekeeping: Mutex::new(None),
        }
    }

    pub fn issue(&self) -> Result<String, openssl::error::ErrorStack> {
        let nonce = crate::util::random_token(self.num_bytes)?;
        self.nonces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(nonce.clone(), Instant::now() + self.lifetime);
        Ok(nonce)
    }

    /// Removes the nonce from the live set, returning whether it was live.
    pub fn consume(&self, nonce: &str) -> bool {
        let expires = self.nonces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(nonce);
        match expires {
            Some(expires) => expires > Instant::now(),
            None => false,
        }
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut nonces = self.nonces.lock().unwrap_or_else(PoisonError::into_inner);
        let before = nonces.len();
        nonces.retain(|_, expires| *expires > now);
        before - nonces.len()
    }

    #[cfg(test)]
    fn live_count(&self) -> usize {
        self.nonces.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Spawns the periodic purge of expired nonces. Must be called within a tokio runtime.
    pub fn start_housekeeping(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = (self.lifetime / 4).max(Duration::from_secs(1));
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let manager = match weak.upgrade() {
                    Some(m) => m,
                    None => break,
                };
                let purged = manager.purge_expired();
                if purged > 0 {
                    debug!("Purged {} expired nonces", purged);
                }
            }
        });
        let previous = self.housekeeping
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.housekeeping.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_is_single_use() {
        let manager = NonceManager::new(16, Duration::from_secs(60));
        let nonce = manager.issue().unwrap();
        assert!(manager.consume(&nonce));
        assert!(!manager.consume(&nonce));
    }

    #[test]
    fn unknown_nonce_is_rejected() {
        let manager = NonceManager::new(16, Duration::from_secs(60));
        assert!(!manager.consume("not-a-nonce"));
        assert!(!manager.consume(""));
    }

    #[test]
    fn expired_nonce_is_rejected() {
        let manager = NonceManager::new(16, Duration::from_secs(0));
        let nonce = manager.issue().unwrap();
        assert!(!manager.consume(&nonce));
    }

    #[test]
    fn purge_removes_only_expired() {
        let manager = NonceManager::new(8, Duration::from_secs(0));
        manager.issue().unwrap();
        manager.issue().unwrap();
        assert_eq!(manager.purge_expired(), 2);
        assert_eq!(manager.live_count(), 0);

        let manager = NonceManager::new(8, Duration::from_secs(60));
        manager.issue().unwrap();
        assert_eq!(manager.purge_expired(), 0);
        assert_eq!(manager.live_count(), 1);
    }

    #[tokio::test]
    async fn housekeeping_stops_on_shutdown() {
        let manager = Arc::new(NonceManager::new(8, Duration::from_secs(60)));
        manager.start_housekeeping();
        manager.shutdown();
        assert!(manager.housekeeping.lock().unwrap().is_none());
    }
}
