use alerts::policy::{ConfiguredDonations, FixedDonations, HttpDonationStatus};
use alerts::search::HttpSearchIndex;
use alerts::{DonationGate, EmailNotifier, Engine, SchedulerConfig, Sender, Server};
use anyhow::Context;
use clap::Parser;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;

/// Alert-agent is a daemon which evaluates saved search alerts on their
/// cadences, and notifies their owners of newly matching documents.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// URL of the SQLite database of alerts.
    #[clap(
        long = "database",
        env = "DATABASE_URL",
        default_value = "sqlite://alerts.db"
    )]
    database_url: String,
    /// Maximum number of database connections.
    #[clap(long = "max-connections", env = "MAX_CONNECTIONS", default_value = "8")]
    max_connections: u32,
    /// Endpoint of the search index's query API.
    #[clap(long = "search-url", env = "SEARCH_URL")]
    search_url: url::Url,
    /// Maximum number of result pages fetched for a single alert run.
    #[clap(long = "search-max-pages", env = "SEARCH_MAX_PAGES", default_value = "10")]
    search_max_pages: usize,
    /// Base URL of the donations service, which decides whether an owner
    /// qualifies for real-time alerts.
    #[clap(long = "donations-url", env = "DONATIONS_URL")]
    donations_url: Option<url::Url>,
    /// Allow real-time alerts for every owner, without consulting donations.
    #[clap(long = "real-time-for-all", conflicts_with = "donations_url")]
    real_time_for_all: bool,
    /// Base URL of the dashboard, used for links within emails.
    #[clap(
        long = "dashboard-url",
        env = "DASHBOARD_URL",
        default_value = "http://localhost:3000/"
    )]
    dashboard_url: url::Url,
    /// Webhook to which rendered emails are posted for delivery.
    /// If not set, emails are logged and discarded.
    #[clap(long = "email-webhook", env = "EMAIL_WEBHOOK_URL")]
    email_webhook: Option<url::Url>,
    /// Interval between scheduler passes.
    #[clap(long = "poll-interval", env = "POLL_INTERVAL", default_value = "60s")]
    #[arg(value_parser = humantime::parse_duration)]
    poll_interval: Duration,
    /// Duration of alert leases. Leases are renewed at half this interval.
    #[clap(long = "lease-ttl", env = "LEASE_TTL", default_value = "2m")]
    #[arg(value_parser = humantime::parse_duration)]
    lease_ttl: Duration,
    /// Number of alerts which may be processed concurrently.
    #[clap(long = "permits", env = "PERMITS", default_value = "8")]
    permits: u32,
    /// UTC hour of day at which daily, weekly and monthly alerts become due.
    #[clap(long = "checkpoint-hour", env = "CHECKPOINT_HOUR", default_value = "0")]
    #[arg(value_parser = clap::value_parser!(u32).range(0..24))]
    checkpoint_hour: u32,
    /// Timeout of a single alert query.
    #[clap(long = "search-timeout", env = "SEARCH_TIMEOUT", default_value = "30s")]
    #[arg(value_parser = humantime::parse_duration)]
    search_timeout: Duration,
    /// Timeout of a single email delivery.
    #[clap(long = "notify-timeout", env = "NOTIFY_TIMEOUT", default_value = "30s")]
    #[arg(value_parser = humantime::parse_duration)]
    notify_timeout: Duration,
    /// Notification records older than this are pruned.
    #[clap(long = "retention", env = "RETENTION", default_value = "365days")]
    #[arg(value_parser = humantime::parse_duration)]
    retention: Duration,
    /// Print logs as JSON lines rather than plain text.
    #[clap(long = "log-json", env = "LOG_JSON")]
    log_json: bool,
    /// Run a single scheduler pass and exit.
    #[clap(long = "once")]
    once: bool,
}

impl Args {
    fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: self.poll_interval,
            lease_ttl: self.lease_ttl,
            permits: self.permits,
            checkpoint_hour: self.checkpoint_hour,
            search_timeout: self.search_timeout,
            notify_timeout: self.notify_timeout,
            retention: self.retention,
            ..Default::default()
        }
    }
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    // Use reasonable defaults for printing structured logs to stderr.
    let builder = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr);
    if args.log_json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    }
    .context("setting tracing default failed")?;

    tracing::info!(?args, "started!");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let task = runtime.spawn(async move { async_main(args).await });
    let result = runtime.block_on(task);

    tracing::info!(?result, "main function completed, shutting down runtime");
    runtime.shutdown_timeout(Duration::from_secs(5));
    result?
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let config = args.scheduler_config();

    let pool = alerts_sql::connect(&args.database_url, args.max_connections)
        .await
        .context("opening alerts database")?;

    let client = reqwest::Client::builder()
        .user_agent(concat!("alert-agent/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("building HTTP client")?;

    let donations = match (&args.donations_url, args.real_time_for_all) {
        (Some(url), _) => ConfiguredDonations::Http(HttpDonationStatus::new(client.clone(), url.clone())),
        (None, allow_all) => {
            if !allow_all {
                tracing::warn!("no --donations-url is configured, and real-time alerts are denied to every owner");
            }
            ConfiguredDonations::Fixed(FixedDonations(allow_all))
        }
    };

    let sender = match args.email_webhook {
        Some(url) => Sender::webhook(url, client.clone()),
        None => Sender::Disabled,
    };

    let engine = Engine::new(
        pool,
        HttpSearchIndex::new(client, args.search_url, args.search_max_pages),
        EmailNotifier::new(&args.dashboard_url, sender)?,
        DonationGate::new(donations),
        config,
    );
    let server = Server::new(Arc::new(engine));

    if args.once {
        let summary = server.run_pass(chrono::Utc::now()).await?;
        tracing::info!(?summary, "completed single scheduler pass");
        return Ok(());
    }

    // Future which completes when the agent should exit.
    let shutdown = tokio::signal::ctrl_c().map(|_| ());
    server.serve(shutdown).await;

    Ok(())
}
