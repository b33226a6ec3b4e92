//! SQLite-backed [`BatcherStore`].

use async_trait::async_trait;
use bitcoin::{Amount, OutPoint, ScriptBuf, Txid};
use sqlx::{sqlite::SqliteRow, Pool, Row, Sqlite};
use sweepbatcher_primitives::types::{BatchState, SwapHash};
use tracing::debug;

use crate::{
    errors::{DbError, DbResult},
    store::{BatcherStore, DbBatch, DbSweep},
};

/// Store implementation over a SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Initializes the store, creating the schema if it does not exist.
    pub async fn new(pool: Pool<Sqlite>) -> DbResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sweep_batches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                state TEXT NOT NULL,
                batch_txid TEXT,
                batch_pk_script BLOB NOT NULL,
                last_rbf_height INTEGER NOT NULL,
                last_rbf_sat_per_kw INTEGER NOT NULL,
                max_timeout_distance INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sweeps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                swap_hash BLOB NOT NULL UNIQUE,
                batch_id INTEGER NOT NULL REFERENCES sweep_batches (id),
                outpoint_txid TEXT NOT NULL,
                outpoint_index INTEGER NOT NULL,
                amt INTEGER NOT NULL,
                completed INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(SqliteStore { pool })
    }
}

fn batch_from_row(row: &SqliteRow) -> DbResult<DbBatch> {
    let state: String = row.try_get("state")?;
    let state: BatchState = state
        .parse()
        .map_err(|e: sweepbatcher_primitives::types::UnknownBatchState| {
            DbError::InvalidData(e.to_string())
        })?;

    let batch_txid: Option<String> = row.try_get("batch_txid")?;
    let batch_txid = batch_txid
        .map(|txid| {
            txid.parse::<Txid>()
                .map_err(|e| DbError::InvalidData(format!("batch txid: {e}")))
        })
        .transpose()?;

    let pk_script: Vec<u8> = row.try_get("batch_pk_script")?;

    Ok(DbBatch {
        id: row.try_get::<i64, _>("id")? as i32,
        state,
        batch_txid,
        batch_pk_script: ScriptBuf::from_bytes(pk_script),
        last_rbf_height: row.try_get::<i64, _>("last_rbf_height")? as u32,
        last_rbf_sat_per_kw: row.try_get::<i64, _>("last_rbf_sat_per_kw")? as u64,
        max_timeout_distance: row.try_get::<i64, _>("max_timeout_distance")? as u32,
    })
}

fn sweep_from_row(row: &SqliteRow) -> DbResult<DbSweep> {
    let swap_hash: Vec<u8> = row.try_get("swap_hash")?;
    let swap_hash: [u8; 32] = swap_hash
        .try_into()
        .map_err(|_| DbError::InvalidData("swap hash is not 32 bytes".to_string()))?;

    let outpoint_txid: String = row.try_get("outpoint_txid")?;
    let outpoint_txid = outpoint_txid
        .parse::<Txid>()
        .map_err(|e| DbError::InvalidData(format!("outpoint txid: {e}")))?;

    Ok(DbSweep {
        swap_hash: SwapHash(swap_hash),
        batch_id: row.try_get::<i64, _>("batch_id")? as i32,
        outpoint: OutPoint {
            txid: outpoint_txid,
            vout: row.try_get::<i64, _>("outpoint_index")? as u32,
        },
        amount: Amount::from_sat(row.try_get::<i64, _>("amt")? as u64),
        completed: row.try_get::<i64, _>("completed")? != 0,
    })
}

#[async_trait]
impl BatcherStore for SqliteStore {
    async fn fetch_unconfirmed_sweep_batches(&self) -> DbResult<Vec<DbBatch>> {
        let rows = sqlx::query(
            r#"
            SELECT id, state, batch_txid, batch_pk_script, last_rbf_height,
                   last_rbf_sat_per_kw, max_timeout_distance
            FROM sweep_batches WHERE state != 'confirmed'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(batch_from_row).collect()
    }

    async fn insert_sweep_batch(&self, batch: &DbBatch) -> DbResult<i32> {
        let result = sqlx::query(
            r#"
            INSERT INTO sweep_batches (
                state, batch_txid, batch_pk_script, last_rbf_height,
                last_rbf_sat_per_kw, max_timeout_distance
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(batch.state.as_str())
        .bind(batch.batch_txid.map(|txid| txid.to_string()))
        .bind(batch.batch_pk_script.as_bytes())
        .bind(batch.last_rbf_height as i64)
        .bind(batch.last_rbf_sat_per_kw as i64)
        .bind(batch.max_timeout_distance as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid() as i32)
    }

    async fn drop_batch(&self, id: i32) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let sweeps: i64 = sqlx::query("SELECT COUNT(*) AS n FROM sweeps WHERE batch_id = ?")
            .bind(id as i64)
            .fetch_one(&mut *tx)
            .await?
            .try_get("n")?;

        if sweeps != 0 {
            return Err(DbError::Contract(format!(
                "refusing to drop batch {id} with {sweeps} sweeps"
            )));
        }

        sqlx::query("DELETE FROM sweep_batches WHERE id = ?")
            .bind(id as i64)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(batch_id = %id, "dropped empty batch");
        Ok(())
    }

    async fn update_sweep_batch(&self, batch: &DbBatch) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE sweep_batches SET
                state = ?, batch_txid = ?, batch_pk_script = ?,
                last_rbf_height = ?, last_rbf_sat_per_kw = ?,
                max_timeout_distance = ?
            WHERE id = ?
            "#,
        )
        .bind(batch.state.as_str())
        .bind(batch.batch_txid.map(|txid| txid.to_string()))
        .bind(batch.batch_pk_script.as_bytes())
        .bind(batch.last_rbf_height as i64)
        .bind(batch.last_rbf_sat_per_kw as i64)
        .bind(batch.max_timeout_distance as i64)
        .bind(batch.id as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn confirm_batch(&self, id: i32) -> DbResult<()> {
        sqlx::query("UPDATE sweep_batches SET state = 'confirmed' WHERE id = ?")
            .bind(id as i64)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn fetch_batch_sweeps(&self, id: i32) -> DbResult<Vec<DbSweep>> {
        let rows = sqlx::query(
            r#"
            SELECT swap_hash, batch_id, outpoint_txid, outpoint_index, amt, completed
            FROM sweeps WHERE batch_id = ? ORDER BY id
            "#,
        )
        .bind(id as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(sweep_from_row).collect()
    }

    async fn upsert_sweep(&self, sweep: &DbSweep) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sweeps (
                swap_hash, batch_id, outpoint_txid, outpoint_index, amt, completed
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (swap_hash) DO UPDATE SET
                batch_id = excluded.batch_id,
                outpoint_txid = excluded.outpoint_txid,
                outpoint_index = excluded.outpoint_index,
                amt = excluded.amt,
                completed = excluded.completed
            "#,
        )
        .bind(sweep.swap_hash.0.as_slice())
        .bind(sweep.batch_id as i64)
        .bind(sweep.outpoint.txid.to_string())
        .bind(sweep.outpoint.vout as i64)
        .bind(sweep.amount.to_sat() as i64)
        .bind(sweep.completed as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_sweep_status(&self, swap_hash: SwapHash) -> DbResult<bool> {
        let row = sqlx::query("SELECT completed FROM sweeps WHERE swap_hash = ?")
            .bind(swap_hash.0.as_slice())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(row.try_get::<i64, _>("completed")? != 0),
            None => Ok(false),
        }
    }

    async fn get_parent_batch(&self, swap_hash: SwapHash) -> DbResult<DbBatch> {
        let row = sqlx::query(
            r#"
            SELECT b.id, b.state, b.batch_txid, b.batch_pk_script,
                   b.last_rbf_height, b.last_rbf_sat_per_kw,
                   b.max_timeout_distance
            FROM sweep_batches b
            JOIN sweeps s ON s.batch_id = b.id
            WHERE s.swap_hash = ?
            "#,
        )
        .bind(swap_hash.0.as_slice())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => batch_from_row(&row),
            None => Err(DbError::NotFound(format!(
                "parent batch of sweep {}",
                swap_hash.short()
            ))),
        }
    }

    async fn total_swept_amount(&self, id: i32) -> DbResult<Amount> {
        let total: i64 =
            sqlx::query("SELECT COALESCE(SUM(amt), 0) AS total FROM sweeps WHERE batch_id = ?")
                .bind(id as i64)
                .fetch_one(&self.pool)
                .await?
                .try_get("total")?;

        Ok(Amount::from_sat(total as u64))
    }
}
