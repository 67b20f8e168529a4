//! Quota balance persistence: ingestion inserts and read projections.
//! Balance mutation lives in [`crate::orders::emit`] only.

use anyhow::{Context, Result};
use sqlx::{PgPool, Row};

use tql_core::{QuotaBalance, QuotaKey};

/// Register the adjudicated maximum for one key (ingestion boundary;
/// values are assumed already validated upstream). Maxima are set once;
/// a second insert for the same key fails on the unique index.
pub async fn insert_quota_balance(pool: &PgPool, key: &QuotaKey, max_quantity: i64) -> Result<()> {
    sqlx::query(
        r#"
        insert into quota_balances (
          tender_id, lot, item, beneficiary_service, max_quantity, emitted_quantity
        ) values (
          $1, $2, $3, $4, $5, 0
        )
        "#,
    )
    .bind(&key.tender_id)
    .bind(key.lot as i32)
    .bind(key.item as i32)
    .bind(&key.service)
    .bind(max_quantity)
    .execute(pool)
    .await
    .context("insert_quota_balance failed")?;

    Ok(())
}

/// Register (or replace) a tender's call number for order-number composition.
pub async fn register_tender_call(pool: &PgPool, tender_id: &str, call_number: &str) -> Result<()> {
    sqlx::query(
        r#"
        insert into tender_calls (tender_id, call_number)
        values ($1, $2)
        on conflict (tender_id) do update set call_number = excluded.call_number
        "#,
    )
    .bind(tender_id)
    .bind(call_number)
    .execute(pool)
    .await
    .context("register_tender_call failed")?;

    Ok(())
}

/// Balance row for one key, if loaded.
pub async fn fetch_balance(pool: &PgPool, key: &QuotaKey) -> Result<Option<QuotaBalance>> {
    let row = sqlx::query(
        r#"
        select max_quantity, emitted_quantity
        from quota_balances
        where tender_id = $1
          and lot = $2
          and item = $3
          and beneficiary_service is not distinct from $4
        "#,
    )
    .bind(&key.tender_id)
    .bind(key.lot as i32)
    .bind(key.item as i32)
    .bind(&key.service)
    .fetch_optional(pool)
    .await
    .context("fetch_balance failed")?;

    match row {
        None => Ok(None),
        Some(row) => {
            let max: i64 = row.try_get("max_quantity")?;
            let emitted: i64 = row.try_get("emitted_quantity")?;
            let balance = QuotaBalance::with_emitted(max, emitted)
                .context("quota_balances row violates balance bounds")?;
            Ok(Some(balance))
        }
    }
}

/// Remaining balance for one key. `None` when the key is not loaded.
pub async fn remaining(pool: &PgPool, key: &QuotaKey) -> Result<Option<i64>> {
    Ok(fetch_balance(pool, key).await?.map(|b| b.remaining()))
}

/// Per-service rows of one tender with quantity left: the item-picker view.
/// Optionally narrowed to one beneficiary service.
pub async fn list_open_balances(
    pool: &PgPool,
    tender_id: &str,
    service: Option<&str>,
) -> Result<Vec<(QuotaKey, QuotaBalance)>> {
    let rows = sqlx::query(
        r#"
        select lot, item, beneficiary_service, max_quantity, emitted_quantity
        from quota_balances
        where tender_id = $1
          and beneficiary_service is not null
          and ($2::text is null or beneficiary_service = $2)
          and emitted_quantity < max_quantity
        order by beneficiary_service, lot, item
        "#,
    )
    .bind(tender_id)
    .bind(service)
    .fetch_all(pool)
    .await
    .context("list_open_balances failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let lot: i32 = row.try_get("lot")?;
        let item: i32 = row.try_get("item")?;
        let service: String = row.try_get("beneficiary_service")?;
        let max: i64 = row.try_get("max_quantity")?;
        let emitted: i64 = row.try_get("emitted_quantity")?;
        let balance = QuotaBalance::with_emitted(max, emitted)
            .context("quota_balances row violates balance bounds")?;
        out.push((
            QuotaKey::scoped(tender_id, lot as u32, item as u32, service),
            balance,
        ));
    }
    Ok(out)
}
