use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use services::{AppServices, Clock, PersistenceConfig, SessionConfig};
use storage::memory::InMemoryKeyValueStore;
use storage::repository::Storage;
use tracing::{info, warn};
use tutor_core::model::{ActivityState, AiFeedback, ClientMetadata, DocumentId, SessionPhase, UserId};

const DEFAULT_FILTER: &str = "services=info,storage=info,app=info";

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    UnknownArg(String),
    InvalidUserId { raw: String },
    InvalidDbUrl { raw: String },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidUserId { raw } => write!(f, "invalid --user value: {raw:?}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
        }
    }
}

impl std::error::Error for ArgsError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

struct Args {
    db_url: String,
    user_id: UserId,
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p app -- demo    [--db <sqlite_url>] [--user <id>]");
    eprintln!("  cargo run -p app -- inspect [--db <sqlite_url>]");
    eprintln!("  cargo run -p app -- prune   [--db <sqlite_url>]");
    eprintln!();
    eprintln!("Defaults:");
    eprintln!("  --db sqlite:tutor.sqlite3");
    eprintln!("  --user demo-student");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  TUTOR_DB_URL, TUTOR_USER_ID, TUTOR_HEARTBEAT_SECS,");
    eprintln!("  TUTOR_RETENTION_CAPACITY, TUTOR_RETENTION_DAYS,");
    eprintln!("  TUTOR_DEBOUNCE_MS, TUTOR_PERIODIC_SAVE_SECS, RUST_LOG");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Demo,
    Inspect,
    Prune,
}

impl Command {
    fn from_arg(arg: &str) -> Option<Self> {
        match arg {
            "demo" => Some(Self::Demo),
            "inspect" => Some(Self::Inspect),
            "prune" => Some(Self::Prune),
            _ => None,
        }
    }
}

impl Args {
    fn parse(args: &mut impl Iterator<Item = String>) -> Result<Self, ArgsError> {
        let mut db_url = std::env::var("TUTOR_DB_URL")
            .ok()
            .map_or_else(|| normalize_sqlite_url("tutor.sqlite3".into()), normalize_sqlite_url);
        let raw_user = std::env::var("TUTOR_USER_ID").unwrap_or_else(|_| "demo-student".into());
        let mut user_id = UserId::new(raw_user.clone())
            .map_err(|_| ArgsError::InvalidUserId { raw: raw_user })?;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    db_url = normalize_sqlite_url(value);
                }
                "--user" => {
                    let value = require_value(args, "--user")?;
                    user_id = UserId::new(value.clone())
                        .map_err(|_| ArgsError::InvalidUserId { raw: value })?;
                }
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        Ok(Self { db_url, user_id })
    }
}

fn normalize_sqlite_url(raw: String) -> String {
    if raw == "sqlite::memory:" || raw.starts_with("sqlite://") {
        return raw;
    }

    let trimmed = raw.trim().to_string();
    let path_str = trimmed
        .strip_prefix("sqlite:")
        .unwrap_or(trimmed.as_str())
        .to_string();
    let path = std::path::Path::new(&path_str);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| std::path::PathBuf::from("."))
            .join(path)
    };
    format!("sqlite://{}", absolute.display())
}

fn prepare_sqlite_file(db_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    if db_url == "sqlite::memory:" {
        return Ok(());
    }

    let path = db_url
        .strip_prefix("sqlite://")
        .ok_or_else(|| ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        })?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        return Err(ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        }
        .into());
    }

    let path = std::path::Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if !path.exists() {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
    }

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn sample_state() -> ActivityState {
    let mut state = ActivityState::default();
    state.student_answers.insert(0, "The narrator is the grandmother.".into());
    state.student_answers.insert(1, String::new());
    state.student_answers.insert(2, "It takes place in winter.".into());
    state.ai_feedbacks.insert(0, AiFeedback::evaluated("alta"));
    state.ai_feedbacks.insert(2, AiFeedback::evaluated("media"));
    state.current_index = 2;
    state
}

/// Two client contexts share one registry: the second login evicts the first,
/// then the new owner saves reading progress and logs out.
async fn run_demo(
    storage: &Storage,
    user_id: &UserId,
    session_config: SessionConfig,
    persistence_config: PersistenceConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let clock = Clock::system();
    let first_context = AppServices::new(
        storage,
        clock.clone(),
        session_config.clone(),
        persistence_config.clone(),
    );
    let second_storage = Storage {
        ephemeral: Arc::new(InMemoryKeyValueStore::new()),
        ..storage.clone()
    };
    let second_context =
        AppServices::new(&second_storage, clock, session_config, persistence_config);

    let mut first = first_context.lifecycle();
    let mut first_phase = first.subscribe_phase();
    let first_token = first
        .login(user_id, ClientMetadata::new("cli-first").with_field("role", "student"))
        .await?;
    println!("first context active: {first_token}");

    let mut second = second_context.lifecycle();
    let second_token = second
        .login(user_id, ClientMetadata::new("cli-second").with_field("role", "student"))
        .await?;
    println!("second context active: {second_token}");

    match tokio::time::timeout(
        Duration::from_secs(5),
        first_phase.wait_for(|phase| *phase == SessionPhase::Evicted),
    )
    .await
    {
        Ok(Ok(_)) => {
            let by = first
                .evicted_by()
                .map(|record| record.browser().to_string())
                .unwrap_or_default();
            println!("first context evicted by {by}");
        }
        _ => warn!(user_id = %user_id, "first context was not evicted in time"),
    }
    first.logout().await;

    let document_id = DocumentId::new("demo-reading")?;
    let mut tracker = second_context.tracker();
    tracker.set_document(Some(document_id.clone()), |_| {}).await;
    if tracker.save_now(&sample_state()).await {
        if let Some(snapshot) = second_context.persistence().load_snapshot(&document_id).await {
            let metrics = &snapshot.metrics;
            println!(
                "saved {document_id}: {}/{} answered ({}%), distribution {:?}",
                metrics.answered_count,
                metrics.total_questions,
                metrics.completion_percentage,
                metrics.evaluation_distribution
            );
        }
    } else {
        warn!(document_id = %document_id, "demo progress was not saved");
    }

    second.logout().await;
    println!("second context closed: {:?}", second.phase());
    Ok(())
}

async fn run_inspect(services: &AppServices) {
    let index = services.persistence().index().await;
    if index.is_empty() {
        println!("no saved activity");
        return;
    }
    let mut entries: Vec<_> = index.iter().collect();
    entries.sort_by_key(|(_, entry)| std::cmp::Reverse(entry.last_modified));
    for (document_id, entry) in entries {
        let when = tutor_core::time::from_millis(entry.last_modified)
            .map_or_else(|| entry.last_modified.to_string(), |at| at.to_rfc3339());
        println!(
            "{document_id}\t{when}\t{}% complete\t{} answered",
            entry.completion, entry.answered_count
        );
    }
}

async fn run_prune(services: &AppServices) {
    let report = services.persistence().prune().await;
    if report.is_empty() {
        println!("nothing to prune");
        return;
    }
    println!(
        "pruned {} document(s): {} expired, {} over capacity, {} failed",
        report.evicted(),
        report.expired.len(),
        report.overflow.len(),
        report.failed.len()
    );
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut argv: Vec<String> = std::env::args().skip(1).collect();

    let cmd = match argv.first().map(String::as_str) {
        None | Some("--help" | "-h") => {
            print_usage();
            return Ok(());
        }
        Some(first) if first.starts_with("--") => Command::Demo,
        Some(first) => Command::from_arg(first).ok_or_else(|| {
            eprintln!("unknown subcommand: {first}");
            print_usage();
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "unknown subcommand")
        })?,
    };
    if !argv[0].starts_with("--") {
        argv.remove(0);
    }

    let mut iter = argv.into_iter();
    let parsed = Args::parse(&mut iter).map_err(|e| {
        eprintln!("{e}");
        print_usage();
        e
    })?;

    let session_config = SessionConfig::from_env();
    let persistence_config = PersistenceConfig::from_env();

    prepare_sqlite_file(&parsed.db_url)?;
    let storage = Storage::sqlite(&parsed.db_url).await?;
    info!(db_url = %parsed.db_url, command = ?cmd, "storage ready");

    match cmd {
        Command::Demo => {
            run_demo(&storage, &parsed.user_id, session_config, persistence_config).await?;
        }
        Command::Inspect => {
            let services =
                AppServices::new(&storage, Clock::system(), session_config, persistence_config);
            run_inspect(&services).await;
        }
        Command::Prune => {
            let services =
                AppServices::new(&storage, Clock::system(), session_config, persistence_config);
            run_prune(&services).await;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(2);
    }
}
