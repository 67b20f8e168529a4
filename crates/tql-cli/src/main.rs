use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::fs;
use uuid::Uuid;

use tql_core::{EmitRequest, OrderStatus, QuotaKey};

#[derive(Parser)]
#[command(name = "tql")]
#[command(about = "Tender order–quota ledger CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Quota balance commands
    Quota {
        #[command(subcommand)]
        cmd: QuotaCmd,
    },

    /// Purchase-order commands
    Order {
        #[command(subcommand)]
        cmd: OrderCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,

    /// Apply SQL migrations.
    Migrate,
}

#[derive(Subcommand)]
enum QuotaCmd {
    /// Register the adjudicated maximum for one key. Omit --service to
    /// create the tender-wide aggregate row.
    Load {
        #[arg(long)]
        tender: String,
        #[arg(long)]
        lot: u32,
        #[arg(long)]
        item: u32,
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        max: i64,
    },

    /// Print the remaining balance for one key.
    Remaining {
        #[arg(long)]
        tender: String,
        #[arg(long)]
        lot: u32,
        #[arg(long)]
        item: u32,
        #[arg(long)]
        service: Option<String>,
    },

    /// List per-service balances of a tender that still have quantity left.
    List {
        #[arg(long)]
        tender: String,
        #[arg(long)]
        service: Option<String>,
    },

    /// Register a tender's call number for order-number composition.
    RegisterCall {
        #[arg(long)]
        tender: String,
        #[arg(long)]
        call: String,
    },
}

#[derive(Subcommand)]
enum OrderCmd {
    /// Emit an order from a JSON request file.
    Emit {
        /// Path to an EmitRequest JSON document.
        #[arg(long)]
        file: String,
    },

    /// List orders (optionally for one tender).
    List {
        #[arg(long)]
        tender: Option<String>,
    },

    /// Print header + lines of one order.
    Detail {
        #[arg(long)]
        id: String,
    },

    /// Change an order's status (Issued -> Delivered -> Cancelled).
    SetStatus {
        #[arg(long)]
        id: String,
        /// One of: Issued, Delivered, Cancelled
        #[arg(long)]
        status: String,
    },

    /// Preview the next order number for a tender.
    NextNumber {
        #[arg(long)]
        tender: String,
        /// Issue date (YYYY-MM-DD); defaults to today.
        #[arg(long)]
        date: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = tql_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = tql_db::status(&pool).await?;
                    println!("db_ok={} has_orders_table={}", s.ok, s.has_orders_table);
                }
                DbCmd::Migrate => {
                    tql_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::Quota { cmd } => {
            let pool = tql_db::connect_from_env().await?;
            match cmd {
                QuotaCmd::Load {
                    tender,
                    lot,
                    item,
                    service,
                    max,
                } => {
                    let key = match service {
                        Some(s) => QuotaKey::scoped(tender, lot, item, s),
                        None => QuotaKey::global(tender, lot, item),
                    };
                    tql_db::insert_quota_balance(&pool, &key, max).await?;
                    println!("loaded lot={} item={} max={}", key.lot, key.item, max);
                }
                QuotaCmd::Remaining {
                    tender,
                    lot,
                    item,
                    service,
                } => {
                    let key = match service {
                        Some(s) => QuotaKey::scoped(tender, lot, item, s),
                        None => QuotaKey::global(tender, lot, item),
                    };
                    match tql_db::remaining(&pool, &key).await? {
                        Some(remaining) => println!("remaining={remaining}"),
                        None => anyhow::bail!("no balance loaded for lot {lot} item {item}"),
                    }
                }
                QuotaCmd::List { tender, service } => {
                    let rows =
                        tql_db::list_open_balances(&pool, &tender, service.as_deref()).await?;
                    for (key, balance) in rows {
                        println!(
                            "lot={} item={} service={} max={} emitted={} remaining={} pct={:.1}",
                            key.lot,
                            key.item,
                            key.service.as_deref().unwrap_or("-"),
                            balance.max_quantity(),
                            balance.emitted_quantity(),
                            balance.remaining(),
                            balance.percent_emitted(),
                        );
                    }
                }
                QuotaCmd::RegisterCall { tender, call } => {
                    tql_db::register_tender_call(&pool, &tender, &call).await?;
                    println!("call_registered={call}");
                }
            }
        }

        Commands::Order { cmd } => {
            let pool = tql_db::connect_from_env().await?;
            match cmd {
                OrderCmd::Emit { file } => {
                    let raw = fs::read_to_string(&file)
                        .with_context(|| format!("cannot read {file}"))?;
                    let request: EmitRequest = serde_json::from_str(&raw)
                        .with_context(|| format!("{file} is not a valid emission request"))?;

                    match tql_db::emit(&pool, &request).await {
                        Ok(id) => println!("order_id={id}"),
                        Err(err) => anyhow::bail!("emission rejected: {err}"),
                    }
                }
                OrderCmd::List { tender } => {
                    let orders = tql_db::list_orders(&pool, tender.as_deref()).await?;
                    for o in orders {
                        println!(
                            "{} id={} tender={} service={} status={} lines={} total_micros={}",
                            o.order_number,
                            o.id,
                            o.tender_id,
                            o.beneficiary_service,
                            o.status,
                            o.line_count,
                            o.total_micros,
                        );
                    }
                }
                OrderCmd::Detail { id } => {
                    let id: Uuid = id.parse().context("invalid order id")?;
                    match tql_db::fetch_order(&pool, id).await? {
                        None => anyhow::bail!("no order with id {id}"),
                        Some(record) => {
                            println!("{}", serde_json::to_string_pretty(&record)?);
                        }
                    }
                }
                OrderCmd::SetStatus { id, status } => {
                    let id: Uuid = id.parse().context("invalid order id")?;
                    let status = OrderStatus::parse(&status)?;
                    match tql_db::set_status(&pool, id, status).await {
                        Ok(()) => println!("status={}", status.as_str()),
                        Err(err) => anyhow::bail!("status change rejected: {err}"),
                    }
                }
                OrderCmd::NextNumber { tender, date } => {
                    let date = match date {
                        Some(d) => d
                            .parse::<NaiveDate>()
                            .context("invalid date, expected YYYY-MM-DD")?,
                        None => Utc::now().date_naive(),
                    };
                    let number = tql_db::suggest_order_number(&pool, &tender, date).await;
                    println!("next_number={number}");
                }
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
