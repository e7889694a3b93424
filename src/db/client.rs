use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Transaction};
use std::sync::Arc;
use tracing::debug;

use crate::config::AppConfig;
use crate::db::database;
use crate::db::store::{StoreError, UnitOfWork, WithdrawalStore};
use crate::models::{Approval, Withdrawal};

pub type DbPool = PgPool;

/// Database client wrapper
#[derive(Clone)]
pub struct DBClient {
    pub pool: Arc<DbPool>,
}

impl DBClient {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect(&config.database.get_db_url()?)
            .await?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&*self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl WithdrawalStore for DBClient {
    async fn create_withdrawal(&self, amount: Decimal) -> Result<Withdrawal, StoreError> {
        Ok(database::insert_withdrawal(&self.pool, amount).await?)
    }

    async fn find_withdrawals(&self, id: Option<i64>) -> Result<Vec<Withdrawal>, StoreError> {
        Ok(database::fetch_withdrawals(&self.pool, id).await?)
    }

    async fn find_approvals(&self, withdrawal_id: i64) -> Result<Vec<Approval>, StoreError> {
        Ok(database::fetch_approvals(&self.pool, withdrawal_id).await?)
    }

    async fn lock_withdrawal(
        &self,
        id: i64,
    ) -> Result<(Withdrawal, Box<dyn UnitOfWork>), StoreError> {
        let mut tx = self.pool.begin().await?;

        let withdrawal = database::lock_withdrawal(&mut tx, id)
            .await?
            .ok_or(StoreError::WithdrawalNotFound(id))?;
        debug!("Locked withdrawal {} for update", id);

        Ok((
            withdrawal,
            Box::new(PgUnitOfWork {
                tx,
                withdrawal_id: id,
            }),
        ))
    }
}

/// Open Postgres transaction holding `FOR UPDATE` on one withdrawal row.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
    withdrawal_id: i64,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    fn withdrawal_id(&self) -> i64 {
        self.withdrawal_id
    }

    async fn insert_approval(&mut self, approver_id: i64) -> Result<bool, StoreError> {
        Ok(database::insert_approval(&mut self.tx, self.withdrawal_id, approver_id).await?)
    }

    async fn count_approvers(&mut self) -> Result<i64, StoreError> {
        Ok(database::count_distinct_approvers(&mut self.tx, self.withdrawal_id).await?)
    }

    async fn save_withdrawal(&mut self, withdrawal: &mut Withdrawal) -> Result<(), StoreError> {
        if withdrawal.id != self.withdrawal_id {
            return Err(StoreError::NotLocked(withdrawal.id));
        }

        let updated_at = database::update_withdrawal(&mut self.tx, withdrawal)
            .await?
            .ok_or(StoreError::Settled(withdrawal.id))?;
        withdrawal.updated_at = updated_at;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
