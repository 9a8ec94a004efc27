use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use page_analyzer_api::{FetchConfig, PageAnalyzerApi, PageFetcher, DEFAULT_PAGE_SIZE};
use page_analyzer_core::UrlId;
use page_analyzer_store_sqlite::SqliteStore;
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "pa")]
#[command(about = "Page Analyzer CLI")]
struct Cli {
    #[arg(long, env = "PAGE_ANALYZER_DB", default_value = "./page_analyzer.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Url {
        #[command(subcommand)]
        command: UrlCommand,
    },
    Check {
        #[command(subcommand)]
        command: CheckCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum UrlCommand {
    Add(UrlAddArgs),
    List(UrlListArgs),
    Show(UrlIdArgs),
    Delete(UrlIdArgs),
}

#[derive(Debug, Args)]
struct UrlAddArgs {
    #[arg(long)]
    url: String,
}

#[derive(Debug, Args)]
struct UrlListArgs {
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    per_page: u32,
}

#[derive(Debug, Args)]
struct UrlIdArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Subcommand)]
enum CheckCommand {
    Run(CheckRunArgs),
}

#[derive(Debug, Args)]
struct CheckRunArgs {
    #[arg(long)]
    id: i64,
    #[arg(long)]
    timeout_ms: Option<u64>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn build_api(db: PathBuf, timeout_ms: Option<u64>) -> Result<PageAnalyzerApi> {
    let config = FetchConfig { timeout: timeout_ms.map(Duration::from_millis), ..FetchConfig::default() };
    let fetcher = PageFetcher::new(&config)?;
    Ok(PageAnalyzerApi::new(db, fetcher))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => run_db(command, cli.db),
        Command::Url { command } => run_url(command, &build_api(cli.db, None)?),
        Command::Check { command } => run_check(command, cli.db),
    }
}

fn run_db(command: DbCommand, db: PathBuf) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = build_api(db, None)?.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = build_api(db, None)?.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(result)?)
        }
        DbCommand::IntegrityCheck => {
            let report = build_api(db, None)?.integrity_check()?;
            emit_json(serde_json::to_value(report)?)
        }
        DbCommand::Backup(args) => {
            let mut store = SqliteStore::open(&db)?;
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_written": true,
                "out": args.out.display().to_string()
            }))
        }
        DbCommand::Restore(args) => {
            let mut store = SqliteStore::open(&db)?;
            store.restore_database(&args.input)?;
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "restored": true,
                "in": args.input.display().to_string(),
                "schema_version": status.current_version
            }))
        }
    }
}

fn run_url(command: UrlCommand, api: &PageAnalyzerApi) -> Result<()> {
    match command {
        UrlCommand::Add(args) => {
            let outcome = api
                .add_url(&args.url)
                .map_err(|err| anyhow!("{}: {err}", err.notice().message))?;
            let notice = outcome.notice();
            let mut value = serde_json::to_value(outcome)?;
            if let Value::Object(object) = &mut value {
                object.insert("notice".to_string(), serde_json::to_value(notice)?);
            }
            emit_json(value)
        }
        UrlCommand::List(args) => {
            let listing = api.list_urls(args.page, args.per_page)?;
            emit_json(serde_json::to_value(listing)?)
        }
        UrlCommand::Show(args) => {
            let url_id = UrlId(args.id);
            let detail = api.url_detail(url_id)?.ok_or_else(|| anyhow!("url {url_id} not found"))?;
            emit_json(serde_json::to_value(detail)?)
        }
        UrlCommand::Delete(args) => {
            let url_id = UrlId(args.id);
            if !api.delete_url(url_id)? {
                return Err(anyhow!("url {url_id} not found"));
            }
            emit_json(serde_json::json!({ "deleted": true, "id": url_id }))
        }
    }
}

fn run_check(command: CheckCommand, db: PathBuf) -> Result<()> {
    match command {
        CheckCommand::Run(args) => {
            let api = build_api(db, args.timeout_ms)?;
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to start async runtime")?;
            let outcome = runtime
                .block_on(api.perform_check(UrlId(args.id)))
                .map_err(|err| anyhow!("{}: {err}", err.notice().message))?;
            emit_json(serde_json::to_value(outcome)?)
        }
    }
}
