//! tql-db
//!
//! PostgreSQL persistence for the order–quota ledger. The schema keeps the
//! same invariants the in-memory stores enforce (balance CHECK constraints,
//! unique order numbers, unique `(order_id, lot, item)` lines) so nothing
//! depends on every writer being well behaved.
//!
//! Emission runs as a single transaction whose guarded balance UPDATEs take
//! row locks; concurrent emissions against the same key serialize inside
//! PostgreSQL and re-check the remaining balance after the lock, so a stale
//! read can never over-commit. See [`orders::emit`].

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

pub mod orders;
pub mod quota;

pub use orders::{emit, fetch_order, list_orders, set_status, suggest_order_number, StatusUpdateError};
pub use quota::{fetch_balance, insert_quota_balance, list_open_balances, register_tender_call, remaining};

pub const ENV_DB_URL: &str = "TQL_DATABASE_URL";

/// Connect to Postgres using TQL_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url =
        std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_orders_table: bool,
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='orders'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_orders_table: exists,
    })
}

/// Detect a Postgres unique constraint violation by name.
pub(crate) fn is_unique_constraint_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.constraint() == Some(constraint)
                || db_err.code().as_deref() == Some("23505")
                    && db_err.constraint() == Some(constraint)
        }
        _ => false,
    }
}
