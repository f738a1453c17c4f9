use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use medmon_core::{Frequency, ReportJob, SavedSearch, SearchIds, SendTime, SourceConfig};
use medmon_sync::{
    default_report_filename, export_report_html, parse_source_lines, parse_sources_yaml,
    render_report, resolve_range, Monitor, MonitorConfig, SearchQuery, SmtpSettings,
};

#[derive(Debug, Parser)]
#[command(name = "medmon")]
#[command(about = "Media monitor: feed ingestion, term search and scheduled reports")]
struct Cli {
    /// SQLite database file (overrides MEDMON_DATABASE_PATH).
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create or upgrade the database schema.
    Migrate,
    /// Fetch every enabled source into the article cache.
    Refresh,
    /// Run an ad-hoc search over the cache.
    Search {
        #[arg(long, default_value = "")]
        include: String,
        #[arg(long, default_value = "")]
        exclude: String,
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
        #[arg(long)]
        last_days: Option<u32>,
        /// Search the cache as-is without fetching sources first.
        #[arg(long)]
        no_refresh: bool,
        /// Write the results as an HTML report (a directory gets a timestamped file).
        #[arg(long)]
        export: Option<PathBuf>,
    },
    #[command(subcommand)]
    Sources(SourceCommands),
    #[command(subcommand)]
    Searches(SearchCommands),
    #[command(subcommand)]
    Reports(ReportCommands),
    #[command(subcommand)]
    Smtp(SmtpCommands),
    /// Run the report ticker until Ctrl-C.
    Schedule,
}

#[derive(Debug, Subcommand)]
enum SourceCommands {
    List,
    Add {
        name: String,
        url: String,
        #[arg(long)]
        disabled: bool,
    },
    Enable {
        name: String,
    },
    Disable {
        name: String,
    },
    Remove {
        name: String,
    },
    /// Import `name|url|enabled` lines, or a YAML `sources:` list for .yaml/.yml files.
    Import {
        file: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum SearchCommands {
    List,
    Save {
        /// Update this saved search instead of creating one.
        #[arg(long)]
        id: Option<i64>,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        include: String,
        #[arg(long, default_value = "")]
        exclude: String,
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
        #[arg(long)]
        last_days: Option<u32>,
    },
    Delete {
        id: i64,
    },
}

#[derive(Debug, Subcommand)]
enum ReportCommands {
    List,
    Save {
        #[arg(long)]
        id: Option<i64>,
        #[arg(long)]
        name: String,
        /// Comma-separated saved search ids.
        #[arg(long)]
        searches: String,
        #[arg(long, default_value = "Daily")]
        frequency: Frequency,
        /// Send time as HH:MM (24h).
        #[arg(long, default_value = "08:00")]
        time: SendTime,
        #[arg(long)]
        recipient: String,
        #[arg(long)]
        disabled: bool,
    },
    Delete {
        id: i64,
    },
    /// Evaluate every enabled job once against the current time.
    RunDue,
    /// Run one job now regardless of its schedule.
    Run {
        id: i64,
    },
    TestEmail {
        recipient: String,
    },
}

#[derive(Debug, Subcommand)]
enum SmtpCommands {
    Set {
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = SmtpSettings::DEFAULT_PORT)]
        port: u16,
        #[arg(long, default_value = "")]
        user: String,
        #[arg(long, env = "MEDMON_SMTP_PASSWORD", default_value = "", hide_env_values = true)]
        password: String,
        #[arg(long, default_value = "")]
        from: String,
    },
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = MonitorConfig::from_env();
    if let Some(path) = cli.database {
        config.database_path = path;
    }
    let monitor = Monitor::open(config).await?;

    let result = run(&monitor, cli.command.unwrap_or(Commands::Refresh)).await;
    monitor.store.close().await;
    result
}

async fn run(monitor: &Monitor, command: Commands) -> Result<()> {
    match command {
        Commands::Migrate => {
            monitor.store.migrate().await.context("running migrations")?;
            println!("database ready: {}", monitor.config.database_path.display());
        }
        Commands::Refresh => {
            let summary = monitor.fetcher.refresh_and_cache().await?;
            println!(
                "refresh complete: run_id={} sources={} failed={} fetched={} new={} duplicates={}",
                summary.run_id,
                summary.sources,
                summary.failed_sources.len(),
                summary.fetched,
                summary.inserted,
                summary.duplicates
            );
            for name in &summary.failed_sources {
                println!("  failed: {name}");
            }
        }
        Commands::Search {
            include,
            exclude,
            from,
            to,
            last_days,
            no_refresh,
            export,
        } => {
            let query = SearchQuery {
                include_text: include,
                exclude_text: exclude,
                date_from: from,
                date_to: to,
                last_x_days: last_days,
            };
            let articles = monitor.search.run_search(&query, !no_refresh).await?;
            for a in &articles {
                println!(
                    "{} | {} | {} | {}",
                    a.published_at.format("%Y-%m-%d %H:%M"),
                    a.source,
                    a.title,
                    a.url
                );
            }
            println!("{} match(es)", articles.len());

            if let Some(target) = export {
                let clock = monitor.scheduler.clock();
                let window = resolve_range(clock.now_utc(), from, to, last_days);
                let label = format!(
                    "{} to {}",
                    window.start.format("%Y-%m-%d"),
                    window.end.format("%Y-%m-%d")
                );
                let path = export_target(&target, clock.now());
                let html = render_report("Search results", &label, &[], &articles)?;
                export_report_html(&path, &html).await?;
                println!("exported {}", path.display());
            }
        }
        Commands::Sources(cmd) => run_sources(monitor, cmd).await?,
        Commands::Searches(cmd) => run_searches(monitor, cmd).await?,
        Commands::Reports(cmd) => run_reports(monitor, cmd).await?,
        Commands::Smtp(cmd) => run_smtp(monitor, cmd).await?,
        Commands::Schedule => {
            let Some(mut sched) = monitor.maybe_build_ticker().await? else {
                tracing::warn!("scheduler disabled (MEDMON_SCHEDULER_ENABLED); nothing to run");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            tracing::info!(cron = %monitor.config.tick_cron, "report scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }
    Ok(())
}

fn export_target(target: &Path, now: chrono::DateTime<chrono::FixedOffset>) -> PathBuf {
    if target.is_dir() {
        target.join(default_report_filename("search", now))
    } else {
        target.to_path_buf()
    }
}

async fn run_sources(monitor: &Monitor, cmd: SourceCommands) -> Result<()> {
    let registry = monitor.registry();
    match cmd {
        SourceCommands::List => {
            for s in registry.sources().await? {
                let state = if s.enabled { "on " } else { "off" };
                println!("[{state}] {} | {}", s.name, s.url);
            }
        }
        SourceCommands::Add { name, url, disabled } => {
            registry.add(SourceConfig::new(name, url, !disabled)).await?;
            println!("source saved");
        }
        SourceCommands::Enable { name } => set_enabled(monitor, &name, true).await?,
        SourceCommands::Disable { name } => set_enabled(monitor, &name, false).await?,
        SourceCommands::Remove { name } => {
            if !registry.remove(&name).await? {
                bail!("no source named {name:?}");
            }
            println!("source removed");
        }
        SourceCommands::Import { file } => {
            let text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let is_yaml = matches!(
                file.extension().and_then(|e| e.to_str()),
                Some("yaml" | "yml")
            );
            let sources = if is_yaml {
                parse_sources_yaml(&text)?
            } else {
                parse_source_lines(&text)
            };
            let count = registry.merge(sources).await?;
            println!("imported {count} source(s)");
        }
    }
    Ok(())
}

async fn set_enabled(monitor: &Monitor, name: &str, enabled: bool) -> Result<()> {
    if !monitor.registry().set_enabled(name, enabled).await? {
        bail!("no source named {name:?}");
    }
    println!("source {}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}

async fn run_searches(monitor: &Monitor, cmd: SearchCommands) -> Result<()> {
    match cmd {
        SearchCommands::List => {
            for s in monitor.store.list_searches().await? {
                let window = match s.effective_last_x_days() {
                    Some(days) => format!("last {days} day(s)"),
                    None => format!(
                        "{} .. {}",
                        s.date_from.map(|d| d.to_string()).unwrap_or_else(|| "-".into()),
                        s.date_to.map(|d| d.to_string()).unwrap_or_else(|| "-".into())
                    ),
                };
                println!(
                    "#{} {} | include [{}] | exclude [{}] | {}",
                    s.id.unwrap_or_default(),
                    s.name,
                    s.include_terms,
                    s.exclude_terms,
                    window
                );
            }
        }
        SearchCommands::Save {
            id,
            name,
            include,
            exclude,
            from,
            to,
            last_days,
        } => {
            let saved = SavedSearch {
                id,
                name,
                include_terms: include,
                exclude_terms: exclude,
                date_from: from,
                date_to: to,
                last_x_days: last_days,
            };
            let id = monitor.store.save_search(&saved).await?;
            println!("saved search #{id}");
        }
        SearchCommands::Delete { id } => {
            if !monitor.store.delete_search(id).await? {
                bail!("saved search {id} not found");
            }
            println!("saved search #{id} deleted");
        }
    }
    Ok(())
}

async fn run_reports(monitor: &Monitor, cmd: ReportCommands) -> Result<()> {
    let scheduler = &monitor.scheduler;
    match cmd {
        ReportCommands::List => {
            for job in monitor.store.list_report_jobs().await? {
                println!(
                    "#{} {} | {} {} | searches [{}] | to {} | {} | last {} {}",
                    job.id.unwrap_or_default(),
                    job.name,
                    job.frequency,
                    job.send_time,
                    job.search_ids.to_csv(),
                    job.recipient,
                    if job.enabled { "enabled" } else { "disabled" },
                    job.last_run_at
                        .map(|ts| ts.to_rfc3339())
                        .unwrap_or_else(|| "never".into()),
                    job.last_status.unwrap_or_default()
                );
            }
        }
        ReportCommands::Save {
            id,
            name,
            searches,
            frequency,
            time,
            recipient,
            disabled,
        } => {
            let job = ReportJob {
                id,
                name,
                search_ids: SearchIds::from_csv(&searches),
                frequency,
                send_time: time,
                recipient,
                enabled: !disabled,
                last_run_at: None,
                last_status: None,
            };
            let id = monitor.store.save_report_job(&job).await?;
            println!("report job #{id} saved");
        }
        ReportCommands::Delete { id } => {
            if !monitor.store.delete_report_job(id).await? {
                bail!("report job {id} not found");
            }
            println!("report job #{id} deleted");
        }
        ReportCommands::RunDue => {
            let summary = scheduler.run_due_reports(scheduler.clock().now()).await;
            println!(
                "evaluated={} fired={} failed={}",
                summary.evaluated,
                summary.outcomes.len(),
                summary.failed()
            );
            for outcome in &summary.outcomes {
                println!("  {}: {}", outcome.job_name, outcome.status);
            }
        }
        ReportCommands::Run { id } => {
            let outcome = scheduler.run_job_now(id, scheduler.clock().now()).await?;
            println!(
                "{}: {} ({} article(s))",
                outcome.job_name, outcome.status, outcome.articles
            );
        }
        ReportCommands::TestEmail { recipient } => {
            scheduler.send_test_email(&recipient).await?;
            println!("test email sent to {recipient}");
        }
    }
    Ok(())
}

async fn run_smtp(monitor: &Monitor, cmd: SmtpCommands) -> Result<()> {
    match cmd {
        SmtpCommands::Set {
            host,
            port,
            user,
            password,
            from,
        } => {
            SmtpSettings {
                host,
                port,
                user,
                password,
                from,
            }
            .save(&monitor.store)
            .await?;
            println!("smtp settings saved");
        }
        SmtpCommands::Show => {
            let settings = SmtpSettings::load(&monitor.store).await?;
            println!("host:     {}", settings.host);
            println!("port:     {}", settings.port);
            println!("user:     {}", settings.user);
            println!(
                "password: {}",
                if settings.password.is_empty() { "(unset)" } else { "********" }
            );
            println!("from:     {}", settings.sender());
        }
    }
    Ok(())
}
