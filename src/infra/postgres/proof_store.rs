//! PostgreSQL proof store.
//!
//! Owns the `proofs` table and read access to the batch tables written by the
//! synchronizer. Selection queries here are plain reads; the coordinator's
//! process-wide mutex serializes each selection with its `generating = true`
//! stamp, so two sessions can never claim the same row.

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

use crate::domain::{Batch, Proof, VerifiedBatch};
use crate::infra::{AggregatorError, ProofStore, Result, StoreTx};

/// PostgreSQL-backed [`ProofStore`].
pub struct PgProofStore {
    pool: PgPool,
}

impl PgProofStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn b256_from_column(bytes: &[u8], column: &str) -> Result<B256> {
    B256::try_from(bytes).map_err(|_| {
        AggregatorError::Internal(format!(
            "column {column} holds {} bytes, expected 32",
            bytes.len()
        ))
    })
}

fn address_from_column(value: &str, column: &str) -> Result<Address> {
    value
        .parse::<Address>()
        .map_err(|e| AggregatorError::Internal(format!("column {column} is not an address: {e}")))
}

fn proof_from_row(row: &PgRow, prefix: &str) -> Result<Proof> {
    let col = |name: &str| format!("{prefix}{name}");
    Ok(Proof {
        batch_number: row.try_get::<i64, _>(col("batch_num").as_str())? as u64,
        batch_number_final: row.try_get::<i64, _>(col("batch_num_final").as_str())? as u64,
        proof_id: row.try_get(col("proof_id").as_str())?,
        proof: row.try_get(col("proof").as_str())?,
        input_prover: row.try_get(col("input_prover").as_str())?,
        prover: row.try_get(col("prover").as_str())?,
        generating: row.try_get(col("generating").as_str())?,
        created_at: row.try_get(col("created_at").as_str())?,
        updated_at: row.try_get(col("updated_at").as_str())?,
    })
}

fn batch_from_row(row: &PgRow) -> Result<Batch> {
    let state_root: Vec<u8> = row.try_get("state_root")?;
    let local_exit_root: Vec<u8> = row.try_get("local_exit_root")?;
    let acc_input_hash: Vec<u8> = row.try_get("acc_input_hash")?;
    let global_exit_root: Vec<u8> = row.try_get("global_exit_root")?;
    let coinbase: String = row.try_get("coinbase")?;

    Ok(Batch {
        batch_number: row.try_get::<i64, _>("batch_num")? as u64,
        coinbase: address_from_column(&coinbase, "coinbase")?,
        batch_l2_data: row.try_get("raw_txs_data")?,
        state_root: b256_from_column(&state_root, "state_root")?,
        local_exit_root: b256_from_column(&local_exit_root, "local_exit_root")?,
        acc_input_hash: b256_from_column(&acc_input_hash, "acc_input_hash")?,
        global_exit_root: b256_from_column(&global_exit_root, "global_exit_root")?,
        timestamp: row.try_get::<DateTime<Utc>, _>("timestamp")?,
    })
}

const PROOF_COLUMNS: &str =
    "batch_num, batch_num_final, proof_id, proof, input_prover, prover, generating, \
     created_at, updated_at";

const BATCH_COLUMNS: &str =
    "b.batch_num, b.coinbase, b.raw_txs_data, b.state_root, b.local_exit_root, \
     b.acc_input_hash, b.global_exit_root, b.timestamp";

#[async_trait]
impl ProofStore for PgProofStore {
    async fn begin_transaction(&self) -> Result<StoreTx> {
        let tx = self.pool.begin().await?;
        Ok(StoreTx::postgres(tx))
    }

    async fn delete_ungenerated_proofs<'a>(&self, dbtx: Option<&'a mut StoreTx>) -> Result<()> {
        let query = sqlx::query("DELETE FROM proofs WHERE proof IS NULL");
        match dbtx {
            Some(tx) => query.execute(tx.pg()?).await?,
            None => query.execute(&self.pool).await?,
        };
        Ok(())
    }

    async fn get_last_verified_batch<'a>(&self, dbtx: Option<&'a mut StoreTx>) -> Result<VerifiedBatch> {
        let query = sqlx::query(
            r#"
            SELECT batch_num, tx_hash, aggregator, block_num
            FROM verified_batches
            ORDER BY batch_num DESC
            LIMIT 1
            "#,
        );
        let row = match dbtx {
            Some(tx) => query.fetch_optional(tx.pg()?).await?,
            None => query.fetch_optional(&self.pool).await?,
        };
        let row = row.ok_or(AggregatorError::NotFound)?;

        let tx_hash: Option<Vec<u8>> = row.try_get("tx_hash")?;
        let aggregator: Option<String> = row.try_get("aggregator")?;

        Ok(VerifiedBatch {
            batch_number: row.try_get::<i64, _>("batch_num")? as u64,
            tx_hash: match tx_hash {
                Some(bytes) => b256_from_column(&bytes, "tx_hash")?,
                None => B256::ZERO,
            },
            aggregator: match aggregator {
                Some(addr) => address_from_column(&addr, "aggregator")?,
                None => Address::ZERO,
            },
            block_number: row.try_get::<i64, _>("block_num")? as u64,
        })
    }

    async fn get_virtual_batch_to_prove<'a>(
        &self,
        last_verified_batch_number: u64,
        dbtx: Option<&'a mut StoreTx>,
    ) -> Result<Batch> {
        let sql = format!(
            r#"
            SELECT {BATCH_COLUMNS}
            FROM batches b
            INNER JOIN virtual_batches v ON v.batch_num = b.batch_num
            WHERE b.batch_num > $1
              AND NOT EXISTS (
                  SELECT 1 FROM proofs p
                  WHERE b.batch_num BETWEEN p.batch_num AND p.batch_num_final
              )
            ORDER BY b.batch_num ASC
            LIMIT 1
            "#
        );
        let query = sqlx::query(&sql).bind(last_verified_batch_number as i64);
        let row = match dbtx {
            Some(tx) => query.fetch_optional(tx.pg()?).await?,
            None => query.fetch_optional(&self.pool).await?,
        };
        batch_from_row(&row.ok_or(AggregatorError::NotFound)?)
    }

    async fn get_batch_by_number<'a>(
        &self,
        batch_number: u64,
        dbtx: Option<&'a mut StoreTx>,
    ) -> Result<Batch> {
        let sql = format!("SELECT {BATCH_COLUMNS} FROM batches b WHERE b.batch_num = $1");
        let query = sqlx::query(&sql).bind(batch_number as i64);
        let row = match dbtx {
            Some(tx) => query.fetch_optional(tx.pg()?).await?,
            None => query.fetch_optional(&self.pool).await?,
        };
        batch_from_row(&row.ok_or(AggregatorError::NotFound)?)
    }

    async fn get_proof_ready_to_verify<'a>(
        &self,
        last_verified_batch_number: u64,
        dbtx: Option<&'a mut StoreTx>,
    ) -> Result<Proof> {
        let sql = format!(
            r#"
            SELECT {PROOF_COLUMNS}
            FROM proofs p
            WHERE p.batch_num = $1
              AND p.generating = FALSE
              AND EXISTS (SELECT 1 FROM sequences s WHERE s.from_batch_num = p.batch_num)
              AND EXISTS (SELECT 1 FROM sequences s WHERE s.to_batch_num = p.batch_num_final)
            LIMIT 1
            "#
        );
        let query = sqlx::query(&sql).bind((last_verified_batch_number + 1) as i64);
        let row = match dbtx {
            Some(tx) => query.fetch_optional(tx.pg()?).await?,
            None => query.fetch_optional(&self.pool).await?,
        };
        proof_from_row(&row.ok_or(AggregatorError::NotFound)?, "")
    }

    async fn get_proofs_to_aggregate<'a>(&self, dbtx: Option<&'a mut StoreTx>) -> Result<(Proof, Proof)> {
        let query = sqlx::query(
            r#"
            SELECT p1.batch_num       AS p1_batch_num,
                   p1.batch_num_final AS p1_batch_num_final,
                   p1.proof_id        AS p1_proof_id,
                   p1.proof           AS p1_proof,
                   p1.input_prover    AS p1_input_prover,
                   p1.prover          AS p1_prover,
                   p1.generating      AS p1_generating,
                   p1.created_at      AS p1_created_at,
                   p1.updated_at      AS p1_updated_at,
                   p2.batch_num       AS p2_batch_num,
                   p2.batch_num_final AS p2_batch_num_final,
                   p2.proof_id        AS p2_proof_id,
                   p2.proof           AS p2_proof,
                   p2.input_prover    AS p2_input_prover,
                   p2.prover          AS p2_prover,
                   p2.generating      AS p2_generating,
                   p2.created_at      AS p2_created_at,
                   p2.updated_at      AS p2_updated_at
            FROM proofs p1
            INNER JOIN proofs p2 ON p1.batch_num_final + 1 = p2.batch_num
            WHERE p1.generating = FALSE AND p2.generating = FALSE
            ORDER BY p1.batch_num ASC
            LIMIT 1
            "#,
        );
        let row = match dbtx {
            Some(tx) => query.fetch_optional(tx.pg()?).await?,
            None => query.fetch_optional(&self.pool).await?,
        };
        let row = row.ok_or(AggregatorError::NotFound)?;
        Ok((proof_from_row(&row, "p1_")?, proof_from_row(&row, "p2_")?))
    }

    async fn check_proof_contains_complete_sequences<'a>(
        &self,
        proof: &Proof,
        dbtx: Option<&'a mut StoreTx>,
    ) -> Result<bool> {
        let query = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (SELECT 1 FROM sequences WHERE from_batch_num = $1)
               AND EXISTS (SELECT 1 FROM sequences WHERE to_batch_num = $2)
            "#,
        )
        .bind(proof.batch_number as i64)
        .bind(proof.batch_number_final as i64);
        let complete = match dbtx {
            Some(tx) => query.fetch_one(tx.pg()?).await?,
            None => query.fetch_one(&self.pool).await?,
        };
        Ok(complete)
    }

    async fn add_generated_proof<'a>(&self, proof: &Proof, dbtx: Option<&'a mut StoreTx>) -> Result<()> {
        let query = sqlx::query(
            r#"
            INSERT INTO proofs
                (batch_num, batch_num_final, proof_id, proof, input_prover, prover,
                 generating, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(proof.batch_number as i64)
        .bind(proof.batch_number_final as i64)
        .bind(&proof.proof_id)
        .bind(&proof.proof)
        .bind(&proof.input_prover)
        .bind(&proof.prover)
        .bind(proof.generating)
        .bind(proof.created_at)
        .bind(proof.updated_at);
        match dbtx {
            Some(tx) => query.execute(tx.pg()?).await?,
            None => query.execute(&self.pool).await?,
        };
        Ok(())
    }

    async fn update_generated_proof<'a>(
        &self,
        proof: &Proof,
        dbtx: Option<&'a mut StoreTx>,
    ) -> Result<()> {
        let query = sqlx::query(
            r#"
            UPDATE proofs
            SET proof_id = $3,
                proof = $4,
                input_prover = $5,
                prover = $6,
                generating = $7,
                updated_at = $8
            WHERE batch_num = $1 AND batch_num_final = $2
            "#,
        )
        .bind(proof.batch_number as i64)
        .bind(proof.batch_number_final as i64)
        .bind(&proof.proof_id)
        .bind(&proof.proof)
        .bind(&proof.input_prover)
        .bind(&proof.prover)
        .bind(proof.generating)
        .bind(Utc::now());
        match dbtx {
            Some(tx) => query.execute(tx.pg()?).await?,
            None => query.execute(&self.pool).await?,
        };
        Ok(())
    }

    async fn delete_generated_proofs<'a>(
        &self,
        batch_number: u64,
        batch_number_final: u64,
        dbtx: Option<&'a mut StoreTx>,
    ) -> Result<()> {
        let query = sqlx::query(
            "DELETE FROM proofs WHERE batch_num >= $1 AND batch_num_final <= $2",
        )
        .bind(batch_number as i64)
        .bind(batch_number_final as i64);
        match dbtx {
            Some(tx) => query.execute(tx.pg()?).await?,
            None => query.execute(&self.pool).await?,
        };
        Ok(())
    }
}
