//! pgbridge - connect with the chosen driver, ping, optionally run one
//! statement and print pool statistics.

use pgbridge::config::CliArgs;
use pgbridge::db::{Context, new_provider};
use pgbridge::error::{DatabaseError, DbResult};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(args: &CliArgs) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if args.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

async fn run(args: &CliArgs) -> DbResult<()> {
    let config = args.to_config();
    let provider = new_provider(config)?;

    let mut ctx = Context::background();
    if let Some(tenant) = &args.tenant {
        ctx = ctx.with_tenant(tenant.clone());
    }

    provider.connect(&ctx).await?;
    let Some(pool) = provider.pool().await else {
        provider.close().await?;
        return Ok(());
    };

    let mut conn = pool.acquire(&ctx).await?;
    let result = async {
        conn.ping(&ctx).await?;
        info!(driver = %conn.driver(), "Ping succeeded");

        if let Some(sql) = &args.exec {
            let rows_affected = conn.exec(&ctx, sql, &[]).await?;
            info!(rows_affected, "Statement executed");
            println!("rows affected: {rows_affected}");
        }
        Ok::<_, DatabaseError>(())
    }
    .await;
    conn.release(&ctx).await;

    match serde_json::to_string_pretty(&pool.stats()) {
        Ok(stats) => println!("{stats}"),
        Err(e) => error!(error = %e, "Failed to render pool statistics"),
    }

    provider.close().await?;
    result
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse_args();
    init_tracing(&args);

    info!(
        driver = %args.driver,
        "Starting pgbridge v{}",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = run(&args).await {
        error!(kind = %e.kind(), error = %e, "pgbridge failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
