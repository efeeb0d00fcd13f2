use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness};
use super::schema::{accounts, orders};
use super::models::{Account, Order};
use super::repo::StoreError;
use crate::types;

pub const MIGRATIONS: EmbeddedMigrations = diesel_migrations::embed_migrations!("migrations");

type PgPool = Pool<ConnectionManager<PgConnection>>;

#[derive(Insertable, Queryable, AsChangeset, Debug, PartialEq)]
#[diesel(table_name = accounts, treat_none_as_null = true)]
struct AccountRow {
    id: i64,
    status: String,
    jwk: String,
    contacts: String,
    eab: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Insertable, Queryable, AsChangeset, Debug, PartialEq)]
#[diesel(table_name = orders, treat_none_as_null = true)]
struct OrderRow {
    id: i64,
    account_id: i64,
    status: String,
    expires: chrono::DateTime<chrono::Utc>,
    authorizations: String,
    cert_req_meta: Option<String>,
    csr: Option<Vec<u8>>,
    certificate: Option<Vec<u8>>,
    cert_not_after: Option<chrono::DateTime<chrono::Utc>>,
    error: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: &str) -> Result<T, StoreError> {
    serde_json::from_str(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

impl AccountRow {
    fn from_model(account: &Account) -> Result<Self, StoreError> {
        Ok(AccountRow {
            id: account.id as i64,
            status: account.status.as_str().to_string(),
            jwk: to_json(&account.jwk)?,
            contacts: to_json(&account.contacts)?,
            eab: account.eab.as_ref().map(to_json).transpose()?,
            created_at: account.created_at,
        })
    }

    fn into_model(self) -> Result<Account, StoreError> {
        Ok(Account {
            id: self.id as u64,
            status: types::account::Status::from_str(&self.status)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown account status '{}'", self.status)))?,
            jwk: from_json(&self.jwk)?,
            contacts: from_json(&self.contacts)?,
            eab: self.eab.as_deref().map(from_json).transpose()?,
            created_at: self.created_at,
        })
    }
}

impl OrderRow {
    fn from_model(order: &Order) -> Result<Self, StoreError> {
        Ok(OrderRow {
            id: order.id as i64,
            account_id: order.account_id as i64,
            status: order.status.as_str().to_string(),
            expires: order.expires,
            authorizations: to_json(&order.authorizations)?,
            cert_req_meta: order.cert_req_meta.as_ref().map(to_json).transpose()?,
            csr: order.csr.clone(),
            certificate: order.certificate.clone(),
            cert_not_after: order.cert_not_after,
            error: order.error.as_ref().map(to_json).transpose()?,
            created_at: order.created_at,
        })
    }

    fn into_model(self) -> Result<Order, StoreError> {
        Ok(Order {
            id: self.id as u64,
            account_id: self.account_id as u64,
            status: types::order::Status::from_str(&self.status)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown order status '{}'", self.status)))?,
            expires: self.expires,
            created_at: self.created_at,
            authorizations: from_json(&self.authorizations)?,
            cert_req_meta: self.cert_req_meta.as_deref().map(from_json).transpose()?,
            csr: self.csr,
            certificate: self.certificate,
            cert_not_after: self.cert_not_after,
            error: self.error.as_deref().map(from_json).transpose()?,
        })
    }
}

/// PostgreSQL storage through an r2d2 pool, blocking calls moved off the async workers.
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    /// Opens the pool and applies any pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let database_url = database_url.to_string();
        let pool = tokio::task::spawn_blocking(move || -> Result<PgPool, StoreError> {
            let manager = ConnectionManager::<PgConnection>::new(database_url);
            let pool = Pool::builder()
                .build(manager)
                .map_err(|e| StoreError::Backend(format!("unable to open pool: {}", e)))?;
            let mut conn = pool.get().map_err(|e| StoreError::Backend(e.to_string()))?;
            let applied = conn.run_pending_migrations(MIGRATIONS)
                .map_err(|e| StoreError::Backend(format!("unable to run migrations: {}", e)))?;
            if !applied.is_empty() {
                info!("Applied {} database migrations", applied.len());
            }
            Ok(pool)
        }).await.map_err(|e| StoreError::Backend(e.to_string()))??;
        Ok(PgBackend { pool })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
        where T: Send + 'static, F: FnOnce(&mut PgConnection) -> Result<T, StoreError> + Send + 'static {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| StoreError::Backend(e.to_string()))?;
            f(&mut conn)
        }).await.map_err(|e| StoreError::Backend(e.to_string()))?
    }
}

fn db_err(err: diesel::result::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[async_trait::async_trait]
impl super::repo::Backend for PgBackend {
    async fn load_accounts(&self) -> Result<Vec<Account>, StoreError> {
        self.run(|c| {
            let rows = accounts::table.load::<AccountRow>(c).map_err(db_err)?;
            rows.into_iter().map(AccountRow::into_model).collect()
        }).await
    }

    async fn load_orders(&self) -> Result<Vec<Order>, StoreError> {
        self.run(|c| {
            let rows = orders::table.load::<OrderRow>(c).map_err(db_err)?;
            rows.into_iter().map(OrderRow::into_model).collect()
        }).await
    }

    async fn save_account(&self, account: &Account) -> Result<(), StoreError> {
        let row = AccountRow::from_model(account)?;
        self.run(move |c| {
            diesel::insert_into(accounts::table)
                .values(&row)
                .on_conflict(accounts::id)
                .do_update()
                .set(&row)
                .execute(c)
                .map_err(db_err)?;
            Ok(())
        }).await
    }

    async fn save_order(&self, order: &Order) -> Result<(), StoreError> {
        let row = OrderRow::from_model(order)?;
        self.run(move |c| {
            diesel::insert_into(orders::table)
                .values(&row)
                .on_conflict(orders::id)
                .do_update()
                .set(&row)
                .execute(c)
                .map_err(db_err)?;
            Ok(())
        }).await
    }

    async fn delete_order(&self, id: u64) -> Result<(), StoreError> {
        self.run(move |c| {
            diesel::delete(orders::table.find(id as i64)).execute(c).map_err(db_err)?;
            Ok(())
        }).await
    }
}
