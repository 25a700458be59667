//! Purpose: `mpsclog` CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Every stdout line is one JSON value.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: All log access goes through `api::Pool` (locks + mmap safety).
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::io::{self, BufRead, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;

use clap::{Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use mpsclog::api::{
    DurableLog, Error, ErrorKind, Pool, PoolInfo, PoolOptions, Queue, to_exit_code,
};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

const DEFAULT_CAPACITY: u64 = 1024 * 1024;

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `mpsclog --help`."));
            }
        },
    };

    match cli.command {
        Command::Create { path, capacity } => {
            let pool = Pool::create(&path, PoolOptions::new(capacity))?;
            emit_json(&pool.info());
        }
        Command::Info { path } => {
            let log = DurableLog::open(Pool::open(&path)?)?;
            let report = InfoReport {
                consumed_offset: log.consumed_offset(),
                pool: log.store().info(),
            };
            emit_json(&report);
        }
        Command::Feed {
            path,
            messages,
            workers,
        } => {
            let queue = open_queue(&path, workers)?;
            let delivered = drain_pending(&queue)?;
            let messages = if messages.is_empty() {
                read_stdin_lines()?
            } else {
                messages
            };
            let appended = append(&queue, &messages, workers).map_err(add_full_hint)?;
            emit_json(&json!({ "appended": appended, "delivered": delivered }));
        }
        Command::Drain { path } => {
            let queue = open_queue(&path, 1)?;
            let delivered = drain_pending(&queue)?;
            emit_json(&json!({ "delivered": delivered }));
        }
    }
    Ok(RunOutcome::ok())
}

#[derive(Parser)]
#[command(
    name = "mpsclog",
    version,
    about = "Durable multi-producer/single-consumer log files",
    long_about = None,
    after_help = r#"EXAMPLES
  $ mpsclog create events.log --capacity 65536
  $ mpsclog feed events.log 'first' 'second'
  $ printf 'a\nb\n' | mpsclog feed events.log --workers 2
  $ mpsclog drain events.log
  {"record":"first"}
  {"record":"second"}
  ...

Logging goes to stderr; set RUST_LOG=debug for consume passes."#,
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new log file
    Create {
        #[arg(value_hint = ValueHint::FilePath)]
        path: PathBuf,
        #[arg(long, default_value_t = DEFAULT_CAPACITY, help = "Log buffer size in bytes (multiple of 64)")]
        capacity: u64,
    },
    /// Show geometry and checkpoint of a log file
    Info {
        #[arg(value_hint = ValueHint::FilePath)]
        path: PathBuf,
    },
    /// Deliver pending records, then append messages (stdin lines when none given)
    Feed {
        #[arg(value_hint = ValueHint::FilePath)]
        path: PathBuf,
        messages: Vec<String>,
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
        workers: u16,
    },
    /// Deliver every pending record and commit
    Drain {
        #[arg(value_hint = ValueHint::FilePath)]
        path: PathBuf,
    },
}

#[derive(Serialize)]
struct InfoReport {
    #[serde(flatten)]
    pool: PoolInfo,
    consumed_offset: usize,
}

fn open_queue(path: &Path, workers: u16) -> Result<Queue<Pool>, Error> {
    let log = DurableLog::open(Pool::open(path)?).map_err(|err| err.with_path(path))?;
    Queue::new(log, usize::from(workers))
}

/// Consume until nothing is ready. Records are printed once their pass commits.
fn drain_pending(queue: &Queue<Pool>) -> Result<usize, Error> {
    let mut delivered = 0;
    loop {
        let mut records = Vec::new();
        let more = queue.try_consume_batch(|batch| {
            records.extend(
                batch
                    .entries()
                    .map(|payload| String::from_utf8_lossy(payload).into_owned()),
            );
            Ok(())
        })?;
        for record in &records {
            emit_json(&json!({ "record": record }));
        }
        delivered += records.len();
        if !more {
            return Ok(delivered);
        }
    }
}

/// Append `messages` from `workers` threads. Worker `i` takes every
/// `workers`-th message starting at `i`, so order holds per worker only.
fn append(queue: &Queue<Pool>, messages: &[String], workers: u16) -> Result<usize, Error> {
    let workers = usize::from(workers);
    let appended = AtomicUsize::new(0);
    let failure: Mutex<Option<Error>> = Mutex::new(None);

    thread::scope(|scope| {
        for start in 0..workers.min(messages.len()) {
            let appended = &appended;
            let failure = &failure;
            scope.spawn(move || {
                let result = queue.register_worker().and_then(|mut worker| {
                    for message in messages.iter().skip(start).step_by(workers) {
                        if !worker.try_produce(message.as_bytes())? {
                            return Err(Error::new(ErrorKind::Busy).with_message("log is full"));
                        }
                        appended.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(())
                });
                if let Err(err) = result {
                    let mut slot = failure.lock().unwrap_or_else(PoisonError::into_inner);
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                }
            });
        }
    });

    let appended = appended.into_inner();
    match failure.into_inner().unwrap_or_else(PoisonError::into_inner) {
        Some(err) => {
            let reason = err.message().unwrap_or("append failed").to_string();
            Err(err.with_message(format!(
                "{reason} after appending {appended} of {} messages",
                messages.len()
            )))
        }
        None => Ok(appended),
    }
}

fn read_stdin_lines() -> Result<Vec<String>, Error> {
    io::stdin()
        .lock()
        .lines()
        .filter(|line| !matches!(line, Ok(line) if line.is_empty()))
        .collect::<Result<Vec<_>, io::Error>>()
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read stdin")
                .with_source(err)
        })
}

fn add_full_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Busy || err.hint().is_some() {
        return err;
    }
    err.with_hint("Run `mpsclog drain` to free space, then feed the remaining messages.")
}

fn emit_json<T: Serialize>(value: &T) {
    let pretty = io::stdout().is_terminal();
    let json = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    let json = json.unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::AlreadyExists => "already exists".to_string(),
        ErrorKind::Busy => "resource is busy".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::Aborted => "aborted".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(offset) = err.offset() {
        lines.push(format!("offset: {offset}"));
    }
    for cause in error_causes(err) {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
