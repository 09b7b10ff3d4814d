//! Load transaction with scoped foreign key relaxation.
//!
//! Foreign keys on a fact table are dropped inside the load transaction and
//! re-added (fully validated) before commit. Postgres DDL is transactional,
//! so a rollback or a dropped transaction restores every constraint.

use crate::ingestion::error::{LoadError, LoadResult};
use crate::ingestion::utils::quote_ident;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tracing::{debug, info, warn};

/// A foreign key dropped for the duration of a load
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct RelaxedForeignKey {
    pub table: String,
    pub name: String,
    /// As reported by `pg_get_constraintdef`, e.g. `FOREIGN KEY (listing_id) REFERENCES dim_listings(listing_id)`
    pub definition: String,
}

impl RelaxedForeignKey {
    fn drop_sql(&self) -> String {
        format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            self.table,
            quote_ident(&self.name)
        )
    }

    fn restore_sql(&self) -> String {
        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} {}",
            self.table,
            quote_ident(&self.name),
            self.definition
        )
    }
}

pub struct LoadTransaction {
    tx: Transaction<'static, Postgres>,
    relaxed: Vec<RelaxedForeignKey>,
    failed: bool,
}

impl LoadTransaction {
    pub async fn begin(pool: &PgPool) -> LoadResult<Self> {
        let tx = pool.begin().await?;
        debug!("Load transaction opened");

        Ok(Self {
            tx,
            relaxed: Vec::new(),
            failed: false,
        })
    }

    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    /// Drop every foreign key declared on `table` until revalidation
    pub async fn relax_foreign_keys(&mut self, table: &str) -> LoadResult<usize> {
        if self.failed {
            return Err(LoadError::Poisoned);
        }

        let found = sqlx::query_as::<_, RelaxedForeignKey>(
            "SELECT $1::text AS table, conname::text AS name, pg_get_constraintdef(oid) AS definition \
             FROM pg_constraint \
             WHERE contype = 'f' AND conrelid = $1::text::regclass \
             ORDER BY conname",
        )
        .bind(table)
        .fetch_all(&mut *self.tx)
        .await?;

        let mut dropped = 0;
        for fk in found {
            if self.relaxed.contains(&fk) {
                continue;
            }
            sqlx::query(&fk.drop_sql()).execute(&mut *self.tx).await?;
            debug!("Relaxed {} on {}", fk.name, fk.table);
            self.relaxed.push(fk);
            dropped += 1;
        }

        info!("Relaxed {} foreign keys on {}", dropped, table);
        Ok(dropped)
    }

    /// Re-add every relaxed constraint, validating all existing rows.
    /// A violation leaves the transaction unable to commit.
    pub async fn revalidate_foreign_keys(&mut self) -> LoadResult<usize> {
        if self.failed {
            return Err(LoadError::Poisoned);
        }

        let mut restored = 0;
        while let Some(fk) = self.relaxed.first() {
            if let Err(source) = sqlx::query(&fk.restore_sql()).execute(&mut *self.tx).await {
                warn!("Foreign key {} on {} failed revalidation", fk.name, fk.table);
                self.failed = true;
                return Err(LoadError::ConstraintRevalidation {
                    table: fk.table.clone(),
                    constraint: fk.name.clone(),
                    source,
                });
            }
            debug!("Revalidated {} on {}", fk.name, fk.table);
            self.relaxed.remove(0);
            restored += 1;
        }

        if restored > 0 {
            info!("Revalidated {} foreign keys", restored);
        }
        Ok(restored)
    }

    /// Revalidate anything still relaxed, then commit
    pub async fn commit(mut self) -> LoadResult<()> {
        self.revalidate_foreign_keys().await?;
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> LoadResult<()> {
        if !self.relaxed.is_empty() {
            info!(
                "Rolling back; {} relaxed foreign keys restored by rollback",
                self.relaxed.len()
            );
        }
        self.tx.rollback().await?;
        Ok(())
    }
}
