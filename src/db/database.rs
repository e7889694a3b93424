use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};

use crate::models::{Approval, Withdrawal, WithdrawalStatus};

const WITHDRAWAL_COLUMNS: &str = "id, amount, ledger_tx_ref, status, created_at, updated_at";

pub async fn insert_withdrawal(pool: &PgPool, amount: Decimal) -> Result<Withdrawal, sqlx::Error> {
    let withdrawal = sqlx::query_as::<_, Withdrawal>(&format!(
        r#"
        INSERT INTO withdrawals (amount, status)
        VALUES ($1, $2)
        RETURNING {WITHDRAWAL_COLUMNS}
        "#
    ))
    .bind(amount)
    .bind(WithdrawalStatus::Unchained)
    .fetch_one(pool)
    .await?;

    Ok(withdrawal)
}

pub async fn fetch_withdrawals(
    pool: &PgPool,
    id: Option<i64>,
) -> Result<Vec<Withdrawal>, sqlx::Error> {
    let withdrawals = match id {
        Some(id) => {
            sqlx::query_as::<_, Withdrawal>(&format!(
                "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawals WHERE id = $1"
            ))
            .bind(id)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Withdrawal>(&format!(
                "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawals ORDER BY id ASC"
            ))
            .fetch_all(pool)
            .await?
        }
    };

    Ok(withdrawals)
}

pub async fn fetch_approvals(
    pool: &PgPool,
    withdrawal_id: i64,
) -> Result<Vec<Approval>, sqlx::Error> {
    let approvals = sqlx::query_as::<_, Approval>(
        r#"
        SELECT id, withdrawal_id, approver_id, created_at
        FROM withdrawal_approvals
        WHERE withdrawal_id = $1
        ORDER BY id ASC
        "#,
    )
    .bind(withdrawal_id)
    .fetch_all(pool)
    .await?;

    Ok(approvals)
}

/// Reads the withdrawal and takes its row lock for the rest of the transaction.
///
/// Runs under READ COMMITTED: a caller that had to wait gets the row as committed by
/// the previous holder instead of a serialization failure.
pub async fn lock_withdrawal(
    conn: &mut PgConnection,
    id: i64,
) -> Result<Option<Withdrawal>, sqlx::Error> {
    let withdrawal = sqlx::query_as::<_, Withdrawal>(&format!(
        "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawals WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await?;

    Ok(withdrawal)
}

/// Returns whether a new approval row was written.
pub async fn insert_approval(
    conn: &mut PgConnection,
    withdrawal_id: i64,
    approver_id: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO withdrawal_approvals (withdrawal_id, approver_id)
        VALUES ($1, $2)
        ON CONFLICT (withdrawal_id, approver_id) DO NOTHING
        "#,
    )
    .bind(withdrawal_id)
    .bind(approver_id)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn count_distinct_approvers(
    conn: &mut PgConnection,
    withdrawal_id: i64,
) -> Result<i64, sqlx::Error> {
    let count = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COUNT(DISTINCT approver_id)
        FROM withdrawal_approvals
        WHERE withdrawal_id = $1
        "#,
    )
    .bind(withdrawal_id)
    .fetch_one(conn)
    .await?;

    Ok(count)
}

/// Updates status and ledger reference in one statement. A settled row is never
/// touched, `None` is returned in that case.
pub async fn update_withdrawal(
    conn: &mut PgConnection,
    withdrawal: &Withdrawal,
) -> Result<Option<chrono::DateTime<chrono::Utc>>, sqlx::Error> {
    let updated_at = sqlx::query_scalar::<_, chrono::DateTime<chrono::Utc>>(
        r#"
        UPDATE withdrawals
        SET status = $2, ledger_tx_ref = $3, updated_at = NOW()
        WHERE id = $1 AND status <> $4
        RETURNING updated_at
        "#,
    )
    .bind(withdrawal.id)
    .bind(withdrawal.status)
    .bind(withdrawal.ledger_tx_ref.as_deref())
    .bind(WithdrawalStatus::Success)
    .fetch_optional(conn)
    .await?;

    Ok(updated_at)
}
