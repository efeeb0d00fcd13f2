use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use chrono::prelude::*;
use super::models::{Account, Authorization, Order};
use crate::types;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error("unable to generate id: {0}")]
    Random(#[from] openssl::error::ErrorStack),
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}

/// Durable storage behind the [`Repository`]. Every write must be durable before it returns.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    async fn load_accounts(&self) -> Result<Vec<Account>, StoreError>;
    async fn load_orders(&self) -> Result<Vec<Order>, StoreError>;
    async fn save_account(&self, account: &Account) -> Result<(), StoreError>;
    async fn save_order(&self, order: &Order) -> Result<(), StoreError>;
    async fn delete_order(&self, id: u64) -> Result<(), StoreError>;
}

/// Keeps everything in process memory, lost on restart.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    accounts: std::sync::Mutex<HashMap<u64, Account>>,
    orders: std::sync::Mutex<HashMap<u64, Order>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn load_accounts(&self) -> Result<Vec<Account>, StoreError> {
        Ok(self.accounts.lock().unwrap_or_else(PoisonError::into_inner).values().cloned().collect())
    }

    async fn load_orders(&self) -> Result<Vec<Order>, StoreError> {
        Ok(self.orders.lock().unwrap_or_else(PoisonError::into_inner).values().cloned().collect())
    }

    async fn save_account(&self, account: &Account) -> Result<(), StoreError> {
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner).insert(account.id, account.clone());
        Ok(())
    }

    async fn save_order(&self, order: &Order) -> Result<(), StoreError> {
        self.orders.lock().unwrap_or_else(PoisonError::into_inner).insert(order.id, order.clone());
        Ok(())
    }

    async fn delete_order(&self, id: u64) -> Result<(), StoreError> {
        self.orders.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
        Ok(())
    }
}

type AccountEntry = Arc<tokio::sync::Mutex<Account>>;
/// `None` once the order has been removed by cleanup.
type OrderEntry = Arc<tokio::sync::Mutex<Option<Order>>>;

#[derive(Default)]
struct Indexes {
    accounts: HashMap<u64, AccountEntry>,
    by_thumbprint: HashMap<String, u64>,
    orders: HashMap<u64, OrderEntry>,
    orders_by_account: HashMap<u64, BTreeSet<u64>>,
    order_by_authz: HashMap<u64, u64>,
    order_by_cert: HashMap<String, u64>,
    to_validate: HashSet<u64>,
    to_enroll: HashSet<u64>,
}

impl Indexes {
    fn index_order(&mut self, order: &Order) {
        self.orders_by_account.entry(order.account_id).or_default().insert(order.id);
        for authz in &order.authorizations {
            self.order_by_authz.insert(authz.id, order.id);
        }
        if let Some(cert) = &order.certificate {
            self.order_by_cert.insert(cert_key(cert), order.id);
        }
        if order.needs_validation() {
            self.to_validate.insert(order.id);
        } else {
            self.to_validate.remove(&order.id);
        }
        if order.needs_enrollment() {
            self.to_enroll.insert(order.id);
        } else {
            self.to_enroll.remove(&order.id);
        }
    }

    fn unindex_order(&mut self, order: &Order) {
        self.orders.remove(&order.id);
        if let Some(ids) = self.orders_by_account.get_mut(&order.account_id) {
            ids.remove(&order.id);
        }
        for authz in &order.authorizations {
            self.order_by_authz.remove(&authz.id);
        }
        if let Some(cert) = &order.certificate {
            self.order_by_cert.remove(&cert_key(cert));
        }
        self.to_validate.remove(&order.id);
        self.to_enroll.remove(&order.id);
    }
}

fn cert_key(der: &[u8]) -> String {
    hex::encode(openssl::sha::sha256(der))
}

#[derive(Debug)]
pub enum AccountInsert {
    Created(Account),
    /// An account already holds this key.
    Existing(Account),
}

#[derive(Debug)]
pub enum KeyChangeOutcome {
    Changed(Account),
    /// The new key already belongs to an account.
    Conflict(Account),
    NotFound,
}

/// An item owned by an order, together with its owners.
#[derive(Debug, Clone)]
pub struct Owned<T> {
    pub order_id: u64,
    pub account_id: u64,
    pub item: T,
}

/// A `processing` challenge handed to the validator.
#[derive(Debug, Clone)]
pub struct PendingChallenge {
    pub order_id: u64,
    pub id: super::models::ChallengeId,
    pub challenge_type: types::challenge::Type,
    pub identifier: types::identifier::Identifier,
    pub token: String,
    pub expected_authorization: String,
    pub authz_expires: DateTime<Utc>,
}

/// Account and order state shared by the dispatcher and the background workers.
///
/// Each account and order sits behind its own async mutex and is only changed by a
/// read-modify-write closure under that mutex. A change is written to the backend
/// before the cached copy is replaced.
pub struct Repository {
    backend: Arc<dyn Backend>,
    indexes: RwLock<Indexes>,
    account_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository").finish_non_exhaustive()
    }
}

impl Repository {
    /// Loads all stored state and rebuilds the indexes and work queues.
    pub async fn load(backend: Arc<dyn Backend>) -> Result<Self, StoreError> {
        let accounts = backend.load_accounts().await?;
        let orders = backend.load_orders().await?;
        let mut indexes = Indexes::default();
        for account in accounts {
            indexes.by_thumbprint.insert(account.thumbprint(), account.id);
            indexes.accounts.insert(account.id, Arc::new(tokio::sync::Mutex::new(account)));
        }
        for order in orders {
            indexes.index_order(&order);
            indexes.orders.insert(order.id, Arc::new(tokio::sync::Mutex::new(Some(order))));
        }
        info!(
            "Loaded {} accounts and {} orders ({} awaiting validation, {} awaiting enrollment)",
            indexes.accounts.len(), indexes.orders.len(), indexes.to_validate.len(), indexes.to_enroll.len()
        );
        Ok(Repository {
            backend,
            indexes: RwLock::new(indexes),
            account_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Indexes> {
        self.indexes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Indexes> {
        self.indexes.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn account_entry(&self, id: u64) -> Option<AccountEntry> {
        self.read().accounts.get(&id).cloned()
    }

    fn order_entry(&self, id: u64) -> Option<OrderEntry> {
        self.read().orders.get(&id).cloned()
    }

    /// Stores a new account under a fresh id, unless one already exists for its key.
    pub async fn add_account(&self, mut account: Account) -> Result<AccountInsert, StoreError> {
        let _guard = self.account_lock.lock().await;
        let thumbprint = account.thumbprint();
        let existing = self.read().by_thumbprint.get(&thumbprint).copied();
        if let Some(id) = existing {
            if let Some(existing) = self.get_account(id).await {
                return Ok(AccountInsert::Existing(existing));
            }
        }

        account.id = loop {
            let id = crate::util::random_u64()?;
            if id != 0 && !self.read().accounts.contains_key(&id) {
                break id;
            }
        };
        self.backend.save_account(&account).await?;

        let mut indexes = self.write();
        indexes.by_thumbprint.insert(thumbprint, account.id);
        indexes.accounts.insert(account.id, Arc::new(tokio::sync::Mutex::new(account.clone())));
        Ok(AccountInsert::Created(account))
    }

    pub async fn get_account(&self, id: u64) -> Option<Account> {
        let entry = self.account_entry(id)?;
        let account = entry.lock().await;
        Some(account.clone())
    }

    pub async fn get_account_by_jwk(&self, jwk: &BTreeMap<String, String>) -> Option<Account> {
        let id = self.read().by_thumbprint.get(&types::jose::thumbprint(jwk)).copied()?;
        self.get_account(id).await
    }

    /// Applies `f` to the account; returns `None` if it does not exist.
    pub async fn update_account<R, F: FnOnce(&mut Account) -> R>(
        &self, id: u64, f: F,
    ) -> Result<Option<R>, StoreError> {
        let entry = match self.account_entry(id) {
            Some(e) => e,
            None => return Ok(None),
        };
        let mut account = entry.lock().await;
        let mut updated = account.clone();
        let res = f(&mut updated);
        updated.id = account.id;
        updated.jwk = account.jwk.clone();
        if updated != *account {
            self.backend.save_account(&updated).await?;
            *account = updated;
        }
        Ok(Some(res))
    }

    /// Replaces the account key, keeping the one-account-per-key mapping intact.
    pub async fn key_change(
        &self, id: u64, new_jwk: BTreeMap<String, String>,
    ) -> Result<KeyChangeOutcome, StoreError> {
        let _guard = self.account_lock.lock().await;
        let new_thumbprint = types::jose::thumbprint(&new_jwk);
        let holder = self.read().by_thumbprint.get(&new_thumbprint).copied();
        if let Some(holder) = holder {
            if let Some(existing) = self.get_account(holder).await {
                return Ok(KeyChangeOutcome::Conflict(existing));
            }
        }

        let entry = match self.account_entry(id) {
            Some(e) => e,
            None => return Ok(KeyChangeOutcome::NotFound),
        };
        let mut account = entry.lock().await;
        let old_thumbprint = account.thumbprint();
        let mut updated = account.clone();
        updated.jwk = new_jwk;
        self.backend.save_account(&updated).await?;
        *account = updated.clone();

        let mut indexes = self.write();
        indexes.by_thumbprint.remove(&old_thumbprint);
        indexes.by_thumbprint.insert(new_thumbprint, id);
        Ok(KeyChangeOutcome::Changed(updated))
    }

    /// Stores a new order, assigning fresh ids to it and its authorizations.
    pub async fn add_order(&self, account_id: u64, mut order: Order) -> Result<Order, StoreError> {
        order.account_id = account_id;
        let entry: OrderEntry = Arc::new(tokio::sync::Mutex::new(None));
        let mut slot = match entry.clone().try_lock_owned() {
            Ok(s) => s,
            Err(_) => return Err(StoreError::Backend("fresh order entry already locked".to_string())),
        };

        {
            let mut indexes = self.write();
            order.id = loop {
                let id = crate::util::random_u64()?;
                if id != 0 && !indexes.orders.contains_key(&id) {
                    break id;
                }
            };
            let mut used = HashSet::new();
            for authz in order.authorizations.iter_mut() {
                authz.id = loop {
                    let id = crate::util::random_u64()?;
                    if id != 0 && !indexes.order_by_authz.contains_key(&id) && used.insert(id) {
                        break id;
                    }
                };
            }
            indexes.orders.insert(order.id, entry);
            for authz in &order.authorizations {
                indexes.order_by_authz.insert(authz.id, order.id);
            }
        }

        if let Err(err) = self.backend.save_order(&order).await {
            self.write().unindex_order(&order);
            return Err(err);
        }

        self.write().index_order(&order);
        *slot = Some(order.clone());
        Ok(order)
    }

    pub async fn get_order(&self, id: u64) -> Option<Order> {
        let entry = self.order_entry(id)?;
        let order = entry.lock().await;
        order.clone()
    }

    /// Applies `f` to the order under its lock; returns `None` if it does not exist.
    ///
    /// The order is persisted and reindexed only if `f` changed it.
    pub async fn update_order<R, F: FnOnce(&mut Order) -> R>(
        &self, id: u64, f: F,
    ) -> Result<Option<R>, StoreError> {
        let entry = match self.order_entry(id) {
            Some(e) => e,
            None => return Ok(None),
        };
        let mut slot = entry.lock().await;
        let current = match slot.as_ref() {
            Some(o) => o,
            None => return Ok(None),
        };
        let mut updated = current.clone();
        let res = f(&mut updated);
        updated.id = current.id;
        updated.account_id = current.account_id;
        if current.certificate.is_some() {
            updated.certificate = current.certificate.clone();
        }
        if updated != *current {
            self.backend.save_order(&updated).await?;
            self.write().index_order(&updated);
            *slot = Some(updated);
        }
        Ok(Some(res))
    }

    pub fn get_orders_for_account(&self, account_id: u64) -> Vec<u64> {
        self.read().orders_by_account.get(&account_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn get_order_for_certificate(&self, cert_der: &[u8]) -> Option<Order> {
        let id = self.read().order_by_cert.get(&cert_key(cert_der)).copied()?;
        self.get_order(id).await
    }

    pub fn order_id_for_authz(&self, authz_id: u64) -> Option<u64> {
        self.read().order_by_authz.get(&authz_id).copied()
    }

    pub async fn get_authorization(&self, authz_id: u64) -> Option<Owned<Authorization>> {
        let order = self.get_order(self.order_id_for_authz(authz_id)?).await?;
        let authz = order.authorization(authz_id)?.clone();
        Some(Owned { order_id: order.id, account_id: order.account_id, item: authz })
    }

    pub async fn get_challenge(&self, id: super::models::ChallengeId) -> Option<Owned<super::models::Challenge>> {
        let authz = self.get_authorization(id.authz_id).await?;
        let chall = authz.item.challenge(id.sub_id)?.clone();
        Some(Owned { order_id: authz.order_id, account_id: authz.account_id, item: chall })
    }

    /// Drains the validation queue, returning every `processing` challenge of a pending
    /// authorization in the drained orders.
    pub async fn take_pending_validation(&self) -> Vec<PendingChallenge> {
        let ids: Vec<u64> = self.write().to_validate.drain().collect();
        let mut pending = vec![];
        for id in ids {
            let order = match self.get_order(id).await {
                Some(o) => o,
                None => continue,
            };
            for authz in &order.authorizations {
                if authz.status != types::authorization::Status::Pending {
                    continue;
                }
                for chall in &authz.challenges {
                    if chall.status == types::challenge::Status::Processing {
                        pending.push(PendingChallenge {
                            order_id: order.id,
                            id: super::models::ChallengeId { authz_id: authz.id, sub_id: chall.sub_id },
                            challenge_type: chall.challenge_type,
                            identifier: authz.identifier.clone(),
                            token: chall.token.clone(),
                            expected_authorization: chall.expected_authorization.clone(),
                            authz_expires: authz.expires,
                        });
                    }
                }
            }
        }
        pending
    }

    pub fn requeue_validation(&self, order_id: u64) {
        let mut indexes = self.write();
        if indexes.orders.contains_key(&order_id) {
            indexes.to_validate.insert(order_id);
        }
    }

    /// Drains the enrollment queue, returning the orders that still await a certificate.
    pub async fn take_pending_enrollment(&self) -> Vec<Order> {
        let ids: Vec<u64> = self.write().to_enroll.drain().collect();
        let mut pending = vec![];
        for id in ids {
            if let Some(order) = self.get_order(id).await {
                if order.needs_enrollment() {
                    pending.push(order);
                }
            }
        }
        pending
    }

    pub fn requeue_enrollment(&self, order_id: u64) {
        let mut indexes = self.write();
        if indexes.orders.contains_key(&order_id) {
            indexes.to_enroll.insert(order_id);
        }
    }

    /// Removes orders whose certificate expired before `cert_before`, and unfinished
    /// orders that expired before `order_before`.
    pub async fn cleanup(
        &self, cert_before: DateTime<Utc>, order_before: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let entries: Vec<OrderEntry> = self.read().orders.values().cloned().collect();
        let mut removed = 0;
        for entry in entries {
            let mut slot = entry.lock().await;
            let remove = match slot.as_ref() {
                None => false,
                Some(order) => {
                    let cert_expired = order.cert_not_after.map_or(false, |t| t < cert_before);
                    let stale = order.status != types::order::Status::Valid && order.expires < order_before;
                    cert_expired || stale
                }
            };
            if !remove {
                continue;
            }
            if let Some(order) = slot.take() {
                if let Err(err) = self.backend.delete_order(order.id).await {
                    *slot = Some(order);
                    return Err(err);
                }
                self.write().unindex_order(&order);
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Throttles the order cleanup sweep to one run per interval, with at most one running.
#[derive(Debug)]
pub struct OrderCleaner {
    last_cleaned: AtomicI64,
    running: AtomicBool,
    interval: chrono::Duration,
}

/// Held while a sweep runs; releases the single-flight flag on drop.
#[derive(Debug)]
pub struct CleanupPermit {
    cleaner: Arc<OrderCleaner>,
}

impl Drop for CleanupPermit {
    fn drop(&mut self) {
        self.cleaner.running.store(false, Ordering::Release);
    }
}

impl OrderCleaner {
    pub fn new(interval: chrono::Duration) -> Self {
        OrderCleaner {
            last_cleaned: AtomicI64::new(i64::MIN),
            running: AtomicBool::new(false),
            interval,
        }
    }

    pub fn try_begin(self: &Arc<Self>, now: DateTime<Utc>) -> Option<CleanupPermit> {
        let due = |last: i64| last == i64::MIN || now.timestamp() - last >= self.interval.num_seconds();
        if !due(self.last_cleaned.load(Ordering::Acquire)) {
            return None;
        }
        if self.running.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return None;
        }
        let permit = CleanupPermit { cleaner: self.clone() };
        if !due(self.last_cleaned.load(Ordering::Acquire)) {
            return None;
        }
        self.last_cleaned.store(now.timestamp(), Ordering::Release);
        Some(permit)
    }
}

/// Starts a cleanup sweep on its own task if one is due.
pub fn spawn_cleanup(
    repo: &Arc<Repository>, cleaner: &Arc<OrderCleaner>,
    cert_age: chrono::Duration, order_age: chrono::Duration,
) {
    let now = Utc::now();
    let permit = match cleaner.try_begin(now) {
        Some(p) => p,
        None => return,
    };
    let repo = repo.clone();
    tokio::spawn(async move {
        let _permit = permit;
        match repo.cleanup(now - cert_age, now - order_age).await {
            Ok(0) => {}
            Ok(n) => info!("Removed {} expired orders", n),
            Err(err) => error!("Unable to clean up expired orders: {}", err),
        }
    });
}
