//! Order persistence: the emission transaction, status changes, and the
//! listing/detail projections.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use tql_core::{
    check_transition, compose_number, fallback_number, validate_lines, EmissionError, EmitRequest,
    InvalidTransition, Order, OrderLine, OrderRecord, OrderStatus, OrderSummary, Period,
    QuotaError, QuotaKey, ValidationError,
};

use crate::is_unique_constraint_violation;

fn storage(err: sqlx::Error) -> EmissionError {
    EmissionError::Storage {
        detail: err.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Emission
// ---------------------------------------------------------------------------

/// Emit one purchase order inside a single transaction.
///
/// The balance decrements are guarded UPDATEs: the predicate re-checks
/// `emitted_quantity + q <= max_quantity` under the row lock, so two
/// emissions racing for the same key serialize inside PostgreSQL and the
/// loser sees the already-decremented balance. Any failure rolls the whole
/// transaction back; no partial order or partial decrement ever commits.
pub async fn emit(pool: &PgPool, request: &EmitRequest) -> Result<Uuid, EmissionError> {
    // Reject bad input before opening a transaction.
    validate_lines(&request.lines)?;

    let explicit_number = match &request.order_number {
        Some(n) if !n.trim().is_empty() => Some(n.clone()),
        _ => None,
    };
    if let Some(number) = &explicit_number {
        if order_number_exists(pool, number).await? {
            return Err(ValidationError::DuplicateOrderNumber {
                order_number: number.clone(),
            }
            .into());
        }
    }

    let mut tx = pool.begin().await.map_err(storage)?;

    // Bounded blocking: a row lock held past this window fails the emission
    // with a retryable error instead of hanging the caller.
    sqlx::query("set local lock_timeout = '2s'")
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

    let order_number = match explicit_number {
        Some(n) => n,
        None => {
            allocate_order_number(
                &mut tx,
                &request.tender_id,
                Period::from_date(request.issue_date),
            )
            .await?
        }
    };

    // Sorted demand order gives every emission the same lock acquisition
    // sequence, so overlapping transactions cannot deadlock.
    let mut demands = request.demands();
    demands.sort();
    for (key, quantity) in &demands {
        reserve_row(&mut tx, key, *quantity).await?;
    }

    let order_id = Uuid::new_v4();
    let header_insert = sqlx::query(
        r#"
        insert into orders (
          id, order_number, tender_id, issue_date, beneficiary_service,
          external_reference, issuing_user, status
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8
        )
        "#,
    )
    .bind(order_id)
    .bind(&order_number)
    .bind(&request.tender_id)
    .bind(request.issue_date)
    .bind(&request.beneficiary_service)
    .bind(&request.external_reference)
    .bind(&request.issuing_user)
    .bind(OrderStatus::Issued.as_str())
    .execute(&mut *tx)
    .await;

    if let Err(err) = header_insert {
        // Lost the allocation race for an explicit number; the transaction
        // rolls back, so no balance decrement survives.
        if is_unique_constraint_violation(&err, "orders_order_number_key") {
            warn!(%order_number, "order number allocated concurrently");
            return Err(EmissionError::NumberingConflict { order_number });
        }
        return Err(storage(err));
    }

    for line in &request.lines {
        let line_total = line.quantity * line.unit_price_micros;
        sqlx::query(
            r#"
            insert into order_lines (
              order_id, lot, item, product_code, description, quantity,
              unit_of_measure, unit_price_micros, line_total_micros, notes
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
            )
            "#,
        )
        .bind(order_id)
        .bind(line.lot as i32)
        .bind(line.item as i32)
        .bind(&line.product_code)
        .bind(&line.description)
        .bind(line.quantity)
        .bind(&line.unit_of_measure)
        .bind(line.unit_price_micros)
        .bind(line_total)
        .bind(&line.notes)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;
    }

    tx.commit().await.map_err(storage)?;

    info!(
        %order_number,
        tender_id = %request.tender_id,
        lines = request.lines.len(),
        "order emitted"
    );
    Ok(order_id)
}

/// Guarded decrement of one balance row. Zero rows affected means either
/// the key is unknown or the remaining balance is insufficient; a follow-up
/// read tells the two apart for the error detail.
async fn reserve_row(
    tx: &mut Transaction<'_, Postgres>,
    key: &QuotaKey,
    quantity: i64,
) -> Result<(), EmissionError> {
    let result = sqlx::query(
        r#"
        update quota_balances
        set emitted_quantity = emitted_quantity + $1
        where tender_id = $2
          and lot = $3
          and item = $4
          and beneficiary_service is not distinct from $5
          and emitted_quantity + $1 <= max_quantity
        "#,
    )
    .bind(quantity)
    .bind(&key.tender_id)
    .bind(key.lot as i32)
    .bind(key.item as i32)
    .bind(&key.service)
    .execute(&mut **tx)
    .await
    .map_err(storage)?;

    if result.rows_affected() > 0 {
        return Ok(());
    }

    let row = sqlx::query(
        r#"
        select max_quantity - emitted_quantity as available
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
    .fetch_optional(&mut **tx)
    .await
    .map_err(storage)?;

    Err(match row {
        None => QuotaError::UnknownKey {
            lot: key.lot,
            item: key.item,
        }
        .into(),
        Some(row) => {
            let available: i64 = row.try_get("available").map_err(storage)?;
            warn!(
                lot = key.lot,
                item = key.item,
                requested = quantity,
                available,
                "insufficient quota"
            );
            QuotaError::InsufficientQuota {
                lot: key.lot,
                item: key.item,
                requested: quantity,
                available,
            }
            .into()
        }
    })
}

// ---------------------------------------------------------------------------
// Numbering
// ---------------------------------------------------------------------------

/// Advance the counter row for (tender, period) and compose the number.
/// The upsert takes the counter's row lock, so concurrent allocations for
/// the same tender/period serialize and come out gapless.
async fn allocate_order_number(
    tx: &mut Transaction<'_, Postgres>,
    tender_id: &str,
    period: Period,
) -> Result<String, EmissionError> {
    let (seq,): (i32,) = sqlx::query_as(
        r#"
        insert into order_number_counters (tender_id, year, month, last_seq)
        values ($1, $2, $3, 1)
        on conflict (tender_id, year, month)
        do update set last_seq = order_number_counters.last_seq + 1
        returning last_seq
        "#,
    )
    .bind(tender_id)
    .bind(period.year)
    .bind(period.month as i32)
    .fetch_one(&mut **tx)
    .await
    .map_err(storage)?;

    let call: Option<(String,)> =
        sqlx::query_as("select call_number from tender_calls where tender_id = $1")
            .bind(tender_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(storage)?;

    Ok(compose_number(
        seq as u32,
        period,
        call.as_ref().map(|(c,)| c.as_str()),
    ))
}

/// Non-allocating preview of the next order number for display purposes.
/// Never fails: any lookup problem falls back to a timestamp-based number
/// so order entry is never blocked.
pub async fn suggest_order_number(pool: &PgPool, tender_id: &str, issue_date: NaiveDate) -> String {
    let period = Period::from_date(issue_date);

    let looked_up: Result<String> = async {
        let seq: Option<(i32,)> = sqlx::query_as(
            r#"
            select last_seq from order_number_counters
            where tender_id = $1 and year = $2 and month = $3
            "#,
        )
        .bind(tender_id)
        .bind(period.year)
        .bind(period.month as i32)
        .fetch_optional(pool)
        .await
        .context("counter lookup failed")?;

        let call: Option<(String,)> =
            sqlx::query_as("select call_number from tender_calls where tender_id = $1")
                .bind(tender_id)
                .fetch_optional(pool)
                .await
                .context("tender_calls lookup failed")?;

        let next = seq.map(|(s,)| s as u32 + 1).unwrap_or(1);
        Ok(compose_number(
            next,
            period,
            call.as_ref().map(|(c,)| c.as_str()),
        ))
    }
    .await;

    match looked_up {
        Ok(number) => number,
        Err(err) => {
            warn!(tender_id, error = %err, "number suggestion fell back to timestamp");
            fallback_number(Utc::now())
        }
    }
}

async fn order_number_exists(pool: &PgPool, order_number: &str) -> Result<bool, EmissionError> {
    let (exists,): (bool,) =
        sqlx::query_as("select exists (select 1 from orders where order_number = $1)")
            .bind(order_number)
            .fetch_one(pool)
            .await
            .map_err(storage)?;
    Ok(exists)
}

// ---------------------------------------------------------------------------
// Status changes
// ---------------------------------------------------------------------------

/// Failures of a persisted status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdateError {
    UnknownOrder { id: Uuid },
    Invalid(InvalidTransition),
    /// The status changed under us between read and update. Retryable.
    Conflict { id: Uuid },
    Storage { detail: String },
}

impl std::fmt::Display for StatusUpdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownOrder { id } => write!(f, "no order with id {id}"),
            Self::Invalid(e) => e.fmt(f),
            Self::Conflict { id } => {
                write!(f, "order {id} changed status concurrently; retry")
            }
            Self::Storage { detail } => write!(f, "status not changed: {detail}"),
        }
    }
}

impl std::error::Error for StatusUpdateError {}

/// Change an order's status, enforcing the state machine.
///
/// The UPDATE is guarded by the status we validated against, so a
/// concurrent change cannot be silently overwritten; the caller gets a
/// retryable [`StatusUpdateError::Conflict`] instead.
pub async fn set_status(pool: &PgPool, id: Uuid, to: OrderStatus) -> Result<(), StatusUpdateError> {
    let db_err = |e: sqlx::Error| StatusUpdateError::Storage {
        detail: e.to_string(),
    };

    let row: Option<(String,)> = sqlx::query_as("select status from orders where id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?;

    let current = match row {
        None => return Err(StatusUpdateError::UnknownOrder { id }),
        Some((s,)) => OrderStatus::parse(&s).map_err(|e| StatusUpdateError::Storage {
            detail: e.to_string(),
        })?,
    };

    check_transition(current, to).map_err(StatusUpdateError::Invalid)?;

    let result = sqlx::query("update orders set status = $1 where id = $2 and status = $3")
        .bind(to.as_str())
        .bind(id)
        .bind(current.as_str())
        .execute(pool)
        .await
        .map_err(db_err)?;

    if result.rows_affected() == 0 {
        return Err(StatusUpdateError::Conflict { id });
    }

    info!(order_id = %id, from = current.as_str(), to = to.as_str(), "order status changed");
    Ok(())
}

// ---------------------------------------------------------------------------
// Projections
// ---------------------------------------------------------------------------

/// Order summaries with line counts and totals, newest-first within a
/// tender filter (or across all tenders when `tender_id` is `None`).
pub async fn list_orders(pool: &PgPool, tender_id: Option<&str>) -> Result<Vec<OrderSummary>> {
    let rows = sqlx::query(
        r#"
        select
          o.id, o.order_number, o.tender_id, o.issue_date, o.beneficiary_service,
          o.issuing_user, o.status, o.created_at,
          count(l.id) as line_count,
          coalesce(sum(l.line_total_micros), 0)::bigint as total_micros
        from orders o
        left join order_lines l on l.order_id = o.id
        where $1::text is null or o.tender_id = $1
        group by o.id
        order by o.created_at desc
        "#,
    )
    .bind(tender_id)
    .fetch_all(pool)
    .await
    .context("list_orders failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let status: String = row.try_get("status")?;
        out.push(OrderSummary {
            id: row.try_get("id")?,
            order_number: row.try_get("order_number")?,
            tender_id: row.try_get("tender_id")?,
            issue_date: row.try_get("issue_date")?,
            beneficiary_service: row.try_get("beneficiary_service")?,
            issuing_user: row.try_get("issuing_user")?,
            status: OrderStatus::parse(&status)?,
            line_count: row.try_get::<i64, _>("line_count")? as usize,
            total_micros: row.try_get("total_micros")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        });
    }
    Ok(out)
}

/// Full header + lines for one order.
pub async fn fetch_order(pool: &PgPool, id: Uuid) -> Result<Option<OrderRecord>> {
    let header = sqlx::query(
        r#"
        select id, order_number, tender_id, issue_date, beneficiary_service,
               external_reference, issuing_user, status, created_at
        from orders
        where id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("fetch_order header query failed")?;

    let header = match header {
        None => return Ok(None),
        Some(row) => {
            let status: String = row.try_get("status")?;
            Order {
                id: row.try_get("id")?,
                order_number: row.try_get("order_number")?,
                tender_id: row.try_get("tender_id")?,
                issue_date: row.try_get("issue_date")?,
                beneficiary_service: row.try_get("beneficiary_service")?,
                external_reference: row.try_get("external_reference")?,
                issuing_user: row.try_get("issuing_user")?,
                status: OrderStatus::parse(&status)?,
                created_at: row.try_get("created_at")?,
            }
        }
    };

    let line_rows = sqlx::query(
        r#"
        select lot, item, product_code, description, quantity,
               unit_of_measure, unit_price_micros, line_total_micros, notes
        from order_lines
        where order_id = $1
        order by lot, item
        "#,
    )
    .bind(id)
    .fetch_all(pool)
    .await
    .context("fetch_order lines query failed")?;

    let mut lines = Vec::with_capacity(line_rows.len());
    for row in line_rows {
        lines.push(OrderLine {
            lot: row.try_get::<i32, _>("lot")? as u32,
            item: row.try_get::<i32, _>("item")? as u32,
            product_code: row.try_get("product_code")?,
            description: row.try_get("description")?,
            quantity: row.try_get("quantity")?,
            unit_of_measure: row.try_get("unit_of_measure")?,
            unit_price_micros: row.try_get("unit_price_micros")?,
            line_total_micros: row.try_get("line_total_micros")?,
            notes: row.try_get("notes")?,
        });
    }

    Ok(Some(OrderRecord { header, lines }))
}
