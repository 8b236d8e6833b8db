// src/main.rs
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use finance_rpc::config::{self, RpcConfig};
use finance_rpc::env::EnvConfig;
use finance_rpc::message::{AggregationReply, AggregationRequest, ReportRequest};
use finance_rpc::models::{Currency, IncomeRecord};
use finance_rpc::rabbitmq::{
    AmqpConnector, ConnectionManager, InMemoryBroker, RpcClient, RpcError, RpcWorker,
    WorkerHandle,
};
use finance_rpc::supervisor::connect_with_retry;
use finance_rpc::{FinanceGateway, TimeoutPolicy};

#[derive(Parser, Debug)]
#[command(name = "finance-rpc", about = "RPC over RabbitMQ for the finance backend")]
struct Cli {
    /// JSON configuration file. Falls back to the usual locations, then to
    /// RABBITMQ_* environment variables.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run both workers and a few calls against an in-process broker.
    Demo,
    /// Send a list of incomes to the currency aggregator.
    Aggregate {
        incomes: PathBuf,
        #[arg(default_value = "EUR")]
        currency: Currency,
        #[arg(long, default_value_t = false)]
        degrade: bool,
    },
    /// Ask the report worker for a PDF and write it to `output`.
    Report { request: PathBuf, output: PathBuf },
    /// Write a default configuration file.
    InitConfig {
        #[arg(default_value = config::CONFIG_FILE_NAME)]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!(error = %format!("{:#}", e), "finance-rpc failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::InitConfig { path } => config::create_default_config_file(&path),
        Command::Demo => run_demo().await,
        Command::Aggregate {
            incomes,
            currency,
            degrade,
        } => {
            let settings = resolve_config(cli.config.as_deref())?;
            let incomes: Vec<IncomeRecord> = read_json(&incomes)?;
            let policy = if degrade {
                TimeoutPolicy::Degrade
            } else {
                settings.rpc.timeout_policy
            };
            with_gateway(&settings, |gateway| async move {
                let summary = gateway.income_summary(incomes, currency, policy).await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
                Ok::<_, anyhow::Error>(())
            })
            .await
        }
        Command::Report { request, output } => {
            let settings = resolve_config(cli.config.as_deref())?;
            let request: ReportRequest = read_json(&request)?;
            with_gateway(&settings, |gateway| async move {
                let pdf = gateway.build_report(&request).await?;
                fs::write(&output, &pdf)
                    .with_context(|| format!("Failed to write report to {}", output.display()))?;
                info!(path = %output.display(), bytes = pdf.len(), "Report written");
                Ok::<_, anyhow::Error>(())
            })
            .await
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("{} is not valid input", path.display()))
}

/// An explicit `--config` must load. Otherwise try the usual locations and
/// fall back to the environment.
fn resolve_config(explicit: Option<&Path>) -> Result<RpcConfig> {
    if let Some(path) = explicit {
        return config::load_config_from(path);
    }

    match config::load_config() {
        Ok(settings) => Ok(settings),
        Err(e) => {
            info!(reason = %e, "No configuration file, reading RABBITMQ_* variables");
            let env = EnvConfig::load()?;
            let mut settings = RpcConfig::with_uri(env.amqp_uri());
            settings.connection.prefetch_count = env.prefetch_count;
            settings.connection.connection_timeout_ms = env.connect_timeout().as_millis() as u64;
            settings.rpc.aggregation_timeout_ms = env.rpc_timeout().as_millis() as u64;
            settings.rpc.report_timeout_ms = env.rpc_timeout().as_millis() as u64;
            settings.validate()?;
            Ok(settings)
        }
    }
}

/// Connect, run `job` with a gateway, and close everything whatever the
/// outcome. Ctrl-C aborts the job.
async fn with_gateway<F, Fut>(settings: &RpcConfig, job: F) -> Result<()>
where
    F: FnOnce(FinanceGateway) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let connector = AmqpConnector::new(settings.connection.uri.clone())
        .with_connect_timeout(settings.connect_timeout());
    let connections = Arc::new(ConnectionManager::new(
        Arc::new(connector),
        settings.channel_config(),
    ));

    let result = async {
        connect_with_retry(&connections, &settings.reconnect).await?;

        let client = RpcClient::with_options(connections.clone(), settings.rpc_options());
        let gateway = FinanceGateway::new(client.clone())
            .with_topics(
                settings.topics.currency_aggregator.clone(),
                settings.topics.report_builder.clone(),
            )
            .with_timeouts(settings.aggregation_timeout(), settings.report_timeout());

        let outcome = tokio::select! {
            outcome = job(gateway) => outcome,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, shutting down");
                Ok(())
            }
        };
        client.close().await;
        outcome
    }
    .await;

    if let Err(e) = connections.close().await {
        warn!(error = %e, "Error while closing RabbitMQ connection");
    }
    result
}

/// Rates used by the demo aggregator, per one EUR.
fn demo_rate(currency: Currency) -> f64 {
    match currency {
        Currency::Eur => 1.0,
        Currency::Rub => 100.0,
        Currency::Rsd => 117.0,
    }
}

fn demo_aggregate(request: AggregationRequest) -> AggregationReply {
    let amounts: Vec<(f64, Currency)> = match &request {
        AggregationRequest::Incomes { incomes, .. } => {
            incomes.iter().map(|i| (i.quantity, i.currency)).collect()
        }
        AggregationRequest::Purchases { purchases, .. } => {
            purchases.iter().map(|p| (p.price, p.currency)).collect()
        }
    };
    let euro: f64 = amounts
        .iter()
        .map(|(amount, currency)| amount / demo_rate(*currency))
        .sum();

    AggregationReply {
        euro,
        rub: euro * demo_rate(Currency::Rub),
        rsd: euro * demo_rate(Currency::Rsd),
        answer: euro * demo_rate(request.current_currency()),
    }
}

async fn start_demo_workers(connections: &ConnectionManager, settings: &RpcConfig) -> Result<Vec<WorkerHandle>> {
    let aggregator = RpcWorker::bind(
        connections,
        "demo-aggregator",
        &settings.topics.currency_aggregator.request_queue,
    )
    .await?
    .serve_json(|request: AggregationRequest| async move { Ok::<_, RpcError>(demo_aggregate(request)) })
    .await?;

    let reports = RpcWorker::bind(
        connections,
        "demo-reports",
        &settings.topics.report_builder.request_queue,
    )
    .await?
    .serve(|body: Vec<u8>| async move {
        let request: ReportRequest = serde_json::from_slice(&body)?;
        Ok::<_, RpcError>(format!(
            "%PDF-1.4\n% report {} .. {}: {} purchases, {} incomes\n%%EOF\n",
            request.start_date,
            request.end_date,
            request.purchases.len(),
            request.incomes.len()
        )
        .into_bytes())
    })
    .await?;

    Ok(vec![aggregator, reports])
}

async fn run_demo() -> Result<()> {
    let broker = InMemoryBroker::new();
    let settings = RpcConfig::with_uri("memory://demo");
    let connections = Arc::new(ConnectionManager::new(
        Arc::new(broker.clone()),
        settings.channel_config(),
    ));
    connect_with_retry(&connections, &settings.reconnect).await?;

    let workers = start_demo_workers(&connections, &settings).await?;
    let client = RpcClient::with_options(connections.clone(), settings.rpc_options());
    let gateway = FinanceGateway::new(client.clone())
        .with_timeouts(Duration::from_secs(2), Duration::from_secs(2));

    let day = NaiveDate::from_ymd_opt(2025, 8, 21).context("invalid demo date")?;
    let incomes = vec![
        IncomeRecord {
            id: 1,
            owner_id: 123,
            description: "Salary".to_string(),
            quantity: 1000.0,
            currency: Currency::Eur,
            created_at: day,
        },
        IncomeRecord {
            id: 2,
            owner_id: 123,
            description: "Freelance".to_string(),
            quantity: 23400.0,
            currency: Currency::Rsd,
            created_at: day,
        },
    ];

    let summary = gateway
        .income_summary(incomes.clone(), Currency::Rub, TimeoutPolicy::Fail)
        .await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    let report = gateway
        .build_report(&ReportRequest {
            purchases: vec![],
            incomes: incomes.clone(),
            categories: vec![],
            start_date: day,
            end_date: day,
            current_currency: Currency::Eur,
        })
        .await?;
    info!(bytes = report.len(), "Report received");

    // with the aggregator gone the summary degrades instead of failing
    for worker in workers {
        worker.stop().await?;
    }
    let degraded = FinanceGateway::new(client.clone())
        .with_timeouts(Duration::from_millis(300), Duration::from_millis(300))
        .income_summary(incomes, Currency::Eur, TimeoutPolicy::Degrade)
        .await?;
    println!("{}", serde_json::to_string_pretty(&degraded)?);

    info!(
        stats = ?client.stats(&settings.topics.currency_aggregator.name),
        pending = client.pending_calls(),
        "Demo finished"
    );

    client.close().await;
    connections.close().await?;
    Ok(())
}
