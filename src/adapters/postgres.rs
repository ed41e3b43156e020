use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::domain::{
    Balances, EntryKind, EntryRef, EntryStatus, LedgerEntry, TraderIndex, Wallet, WalletKey,
};
use crate::error::{CustodyError, Result};
use crate::persistence::{dedup_conflict, IndexStore, LedgerStore, WalletMutation, WalletStore};

const ENTRY_COLUMNS: &str =
    "id, trader_id, currency, kind, amount, status, order_id, tx_hash, metadata, created_at";

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }
}

/// A confirm that touched no row names an entry that does not exist
fn require_confirmed(entry_id: Uuid, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        return Err(CustodyError::NotFound(format!("ledger entry {entry_id}")));
    }
    Ok(())
}

fn wallet_from_row(row: &PgRow) -> Wallet {
    Wallet {
        trader_id: row.get("trader_id"),
        currency: row.get("currency"),
        address: row.get("address"),
        balance: row.get("balance"),
        frozen: row.get("frozen"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn entry_from_row(row: &PgRow) -> Result<LedgerEntry> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");

    Ok(LedgerEntry {
        id: row.get("id"),
        trader_id: row.get("trader_id"),
        currency: row.get("currency"),
        kind: EntryKind::try_from(kind.as_str()).map_err(CustodyError::Internal)?,
        amount: row.get("amount"),
        status: EntryStatus::try_from(status.as_str()).map_err(CustodyError::Internal)?,
        order_id: row.get("order_id"),
        tx_hash: row.get("tx_hash"),
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
    })
}

fn hd_index_from_row(row: &PgRow) -> Result<u32> {
    let raw: i32 = row.get("hd_index");
    u32::try_from(raw).map_err(|_| CustodyError::Internal(format!("negative hd_index {raw}")))
}

/// Translate a unique-index violation on an appended entry into the ledger's dedup error
fn map_insert_error(err: sqlx::Error, entry: &LedgerEntry) -> CustodyError {
    if let sqlx::Error::Database(ref db) = err {
        if db.is_unique_violation() {
            if let Some(dedup) = dedup_conflict(entry, entry) {
                return dedup;
            }
        }
    }
    CustodyError::Database(err)
}

// ==================== Trader index ====================

#[async_trait]
impl IndexStore for PostgresStore {
    async fn get_index(&self, trader_id: &str) -> Result<Option<TraderIndex>> {
        let row = sqlx::query("SELECT hd_index FROM trader_wallet_index WHERE trader_id = $1")
            .bind(trader_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| {
            Ok(TraderIndex {
                trader_id: trader_id.to_string(),
                hd_index: hd_index_from_row(&r)?,
            })
        })
        .transpose()
    }

    #[instrument(skip(self))]
    async fn allocate_index(&self, trader_id: &str) -> Result<TraderIndex> {
        // The no-op update makes RETURNING yield the existing row on conflict,
        // so concurrent first calls for one trader all see the same index.
        let row = sqlx::query(
            r#"
            INSERT INTO trader_wallet_index (trader_id)
            VALUES ($1)
            ON CONFLICT (trader_id) DO UPDATE SET trader_id = EXCLUDED.trader_id
            RETURNING hd_index
            "#,
        )
        .bind(trader_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(TraderIndex {
            trader_id: trader_id.to_string(),
            hd_index: hd_index_from_row(&row)?,
        })
    }
}

// ==================== Wallets ====================

#[async_trait]
impl WalletStore for PostgresStore {
    async fn get_wallet(&self, key: &WalletKey) -> Result<Option<Wallet>> {
        let row = sqlx::query(
            r#"
            SELECT trader_id, currency, address, balance, frozen, created_at, updated_at
            FROM wallets WHERE trader_id = $1 AND currency = $2
            "#,
        )
        .bind(&key.trader_id)
        .bind(&key.currency)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(wallet_from_row))
    }

    #[instrument(skip(self, wallet), fields(wallet = %wallet.key()))]
    async fn insert_wallet(&self, wallet: &Wallet) -> Result<Wallet> {
        let row = sqlx::query(
            r#"
            INSERT INTO wallets (trader_id, currency, address, balance, frozen, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (trader_id, currency) DO NOTHING
            RETURNING trader_id, currency, address, balance, frozen, created_at, updated_at
            "#,
        )
        .bind(&wallet.trader_id)
        .bind(&wallet.currency)
        .bind(&wallet.address)
        .bind(wallet.balance)
        .bind(wallet.frozen)
        .bind(wallet.created_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(wallet_from_row(&row)),
            None => self
                .get_wallet(&wallet.key())
                .await?
                .ok_or_else(|| CustodyError::NotFound(format!("wallet {}", wallet.key()))),
        }
    }

    async fn list_wallets(&self, currency: &str) -> Result<Vec<Wallet>> {
        let rows = sqlx::query(
            r#"
            SELECT trader_id, currency, address, balance, frozen, created_at, updated_at
            FROM wallets WHERE currency = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(currency)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(wallet_from_row).collect())
    }
}

// ==================== Ledger entries ====================

#[async_trait]
impl LedgerStore for PostgresStore {
    async fn find_entry(
        &self,
        key: &WalletKey,
        kind: EntryKind,
        reference: EntryRef<'_>,
    ) -> Result<Option<LedgerEntry>> {
        let (column, value) = match reference {
            EntryRef::Order(order_id) => ("order_id", order_id),
            EntryRef::Tx(tx_hash) => ("tx_hash", tx_hash),
        };

        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM wallet_transactions \
             WHERE trader_id = $1 AND currency = $2 AND kind = $3 AND {column} = $4 \
             ORDER BY created_at ASC LIMIT 1"
        );

        let row = sqlx::query(&sql)
            .bind(&key.trader_id)
            .bind(&key.currency)
            .bind(kind.as_str())
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(entry_from_row).transpose()
    }

    async fn list_entries(&self, key: &WalletKey) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM wallet_transactions \
             WHERE trader_id = $1 AND currency = $2 ORDER BY created_at ASC"
        );

        let rows = sqlx::query(&sql)
            .bind(&key.trader_id)
            .bind(&key.currency)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn pending_withdrawals(&self, limit: u32) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM wallet_transactions \
             WHERE kind = 'withdraw' AND status = 'pending' \
             ORDER BY created_at ASC LIMIT $1"
        );

        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(entry_from_row).collect()
    }

    #[instrument(skip(self, mutation), fields(wallet = %mutation.key))]
    async fn apply(&self, mutation: WalletMutation) -> Result<Wallet> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes writers of this wallet across processes
        let row = sqlx::query(
            "SELECT balance, frozen FROM wallets WHERE trader_id = $1 AND currency = $2 FOR UPDATE",
        )
        .bind(&mutation.key.trader_id)
        .bind(&mutation.key.currency)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CustodyError::NotFound(format!("wallet {}", mutation.key)))?;

        let current = Balances::new(
            row.get::<Decimal, _>("balance"),
            row.get::<Decimal, _>("frozen"),
        );
        if current != mutation.expected {
            return Err(CustodyError::ConcurrentModification(mutation.key.to_string()));
        }
        if !mutation.next.is_valid() {
            return Err(CustodyError::InsufficientFunds(format!(
                "wallet {} would go negative",
                mutation.key
            )));
        }

        if let Some(entry_id) = mutation.confirm {
            let updated = sqlx::query(
                r#"
                UPDATE wallet_transactions
                SET status = 'confirmed', updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(entry_id)
            .execute(&mut *tx)
            .await?;
            // Dropping `tx` on error rolls the whole mutation back
            require_confirmed(entry_id, updated.rows_affected())?;
            debug!("Confirmed entry {}", entry_id);
        }

        for entry in &mutation.append {
            sqlx::query(
                r#"
                INSERT INTO wallet_transactions
                (id, trader_id, currency, kind, amount, status, order_id, tx_hash, metadata, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
                "#,
            )
            .bind(entry.id)
            .bind(&entry.trader_id)
            .bind(&entry.currency)
            .bind(entry.kind.as_str())
            .bind(entry.amount)
            .bind(entry.status.as_str())
            .bind(&entry.order_id)
            .bind(&entry.tx_hash)
            .bind(&entry.metadata)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_insert_error(e, entry))?;
        }

        let row = sqlx::query(
            r#"
            UPDATE wallets
            SET balance = $3, frozen = $4, updated_at = NOW()
            WHERE trader_id = $1 AND currency = $2
            RETURNING trader_id, currency, address, balance, frozen, created_at, updated_at
            "#,
        )
        .bind(&mutation.key.trader_id)
        .bind(&mutation.key.currency)
        .bind(mutation.next.balance)
        .bind(mutation.next.frozen)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(
            "Applied mutation to {}: {} entries appended",
            mutation.key,
            mutation.append.len()
        );
        Ok(wallet_from_row(&row))
    }

    #[instrument(skip(self))]
    async fn confirm_withdraw(&self, tx_hash: &str) -> Result<Option<bool>> {
        let result = sqlx::query(
            r#"
            UPDATE wallet_transactions
            SET status = 'confirmed', updated_at = NOW()
            WHERE kind = 'withdraw' AND tx_hash = $1 AND status = 'pending'
            "#,
        )
        .bind(tx_hash)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(Some(true));
        }

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM wallet_transactions WHERE kind = 'withdraw' AND tx_hash = $1)",
        )
        .bind(tx_hash)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists.then_some(false))
    }
}
