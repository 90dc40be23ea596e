//! Command-line front end: argument parsing, account and credential
//! resolution, and console progress.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand, ValueEnum};
use secrecy::{ExposeSecret, SecretString};

use crate::config::{AccountRef, ChannelKind, DispatchConfig, SmtpSettings, resolve_credential};
use crate::dispatch::{
    CapDecision, DispatchObserver, Dispatcher, RunInput, RunSummary, StopReason, Templates,
};
use crate::error::ConfigError;
use crate::source::{Row, RowCount, RowSource, SourceOptions};
use crate::store::{HistoryGate, LibSqlHistory, NoHistory};
use crate::template::{Dialect, Template};
use crate::transport::{HttpGateway, SmtpMailer, Transport};

/// Environment variable consulted for the gateway token.
pub const GATEWAY_TOKEN_ENV: &str = "BULKSEND_GATEWAY_TOKEN";
/// Environment variable consulted for the SMTP password.
pub const SMTP_PASSWORD_ENV: &str = "BULKSEND_SMTP_PASSWORD";

#[derive(Debug, Parser)]
#[command(
    name = "bulksend",
    version,
    about = "Templated bulk SMS and email from CSV and spreadsheet files"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// History database path
    #[arg(
        long,
        global = true,
        env = "BULKSEND_DB_PATH",
        default_value = "./data/bulksend.db"
    )]
    pub db: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send SMS through an HTTP gateway
    Sms(SmsArgs),
    /// Send email over SMTP
    Email(EmailArgs),
    /// Manage stored gateway accounts
    #[command(subcommand)]
    Accounts(AccountsCommand),
    /// List the template variables available for a file
    Columns {
        /// Recipient file (csv, tsv, xlsx, xls, ods)
        #[arg(long)]
        file: PathBuf,
        #[arg(long, value_enum, default_value = "sms")]
        channel: ChannelArg,
    },
    /// Count data rows in a file
    Count {
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ChannelArg {
    Sms,
    Email,
}

impl From<ChannelArg> for ChannelKind {
    fn from(arg: ChannelArg) -> Self {
        match arg {
            ChannelArg::Sms => ChannelKind::Sms,
            ChannelArg::Email => ChannelKind::Email,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum AccountsCommand {
    /// Register a gateway account
    Add {
        name: String,
        /// Gateway endpoint URL
        #[arg(long)]
        endpoint: String,
        /// Gateway token; falls back to BULKSEND_GATEWAY_TOKEN, then a prompt
        #[arg(long)]
        token: Option<String>,
    },
    /// List registered accounts
    List,
}

/// Options shared by `sms` and `email`.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Extra attempts after a failed send
    #[arg(long, default_value_t = 2)]
    pub retries: u32,

    /// Per-attempt timeout in seconds (default 10 for SMS, 60 for email)
    #[arg(long)]
    pub timeout: Option<f64>,

    /// Pause after each sent row, in seconds
    #[arg(long, default_value_t = 0.2)]
    pub delay: f64,

    /// Maximum rows to process (0 = all)
    #[arg(long, default_value_t = 0)]
    pub limit: usize,

    /// First data row to process (1-based)
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    pub start_row: u64,

    /// Render and log without sending
    #[arg(long)]
    pub dry_run: bool,

    /// Output log path
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Skip recipients already sent to today
    #[arg(long)]
    pub skip_duplicates: bool,

    /// Do not read or write send history
    #[arg(long)]
    pub no_history: bool,

    /// Successful sends per account per day before asking (0 = no cap)
    #[arg(long, default_value_t = crate::config::DEFAULT_DAILY_CAP)]
    pub daily_cap: u64,

    /// Keep sending past the daily cap without asking
    #[arg(long)]
    pub continue_past_cap: bool,

    /// Column holding the recipient
    #[arg(long)]
    pub recipient_field: Option<String>,

    /// Template dialect: safe ({name}) or escaped ({{name}})
    #[arg(long)]
    pub dialect: Option<Dialect>,
}

#[derive(Debug, Args)]
pub struct SmsArgs {
    /// Recipient file (csv, tsv, xlsx, xls, ods)
    #[arg(long)]
    pub file: PathBuf,

    /// Message template: a file path or inline text
    #[arg(long)]
    pub template: String,

    /// Gateway endpoint URL
    #[arg(long, required_unless_present = "account")]
    pub gateway: Option<String>,

    /// Stored account name
    #[arg(long)]
    pub account: Option<String>,

    /// Gateway token; falls back to the stored account, BULKSEND_GATEWAY_TOKEN, then a prompt
    #[arg(long)]
    pub token: Option<String>,

    /// Country prefix for local numbers, e.g. +254
    #[arg(long)]
    pub prefix: Option<String>,

    /// Ensure every number starts with +
    #[arg(long)]
    pub force_plus: bool,

    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Debug, Args)]
pub struct EmailArgs {
    /// Recipient file (csv, tsv, xlsx, xls, ods)
    #[arg(long, required_unless_present = "to", conflicts_with = "to")]
    pub file: Option<PathBuf>,

    /// Send a single email to this address instead of a file
    #[arg(long)]
    pub to: Option<String>,

    /// Template variable for --to, as key=value (repeatable)
    #[arg(long = "var", requires = "to", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,

    /// HTML body template: a file path or inline text
    #[arg(long)]
    pub template: String,

    /// Subject template (inline text only)
    #[arg(long, default_value = "No Subject")]
    pub subject: String,

    /// SMTP password; falls back to BULKSEND_SMTP_PASSWORD, then a prompt
    #[arg(long)]
    pub password: Option<String>,

    #[command(flatten)]
    pub run: RunArgs,
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

// ── Entry point ─────────────────────────────────────────────────────

pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Sms(args) => send_sms(&cli.db, args).await,
        Command::Email(args) => send_email(&cli.db, args).await,
        Command::Accounts(cmd) => accounts(&cli.db, cmd).await,
        Command::Columns { file, channel } => columns(&file, channel.into()),
        Command::Count { file } => {
            match RowSource::count(&file) {
                RowCount::Known(n) => println!("{n}"),
                RowCount::Unknown => println!("unknown"),
            }
            Ok(())
        }
    }
}

async fn send_sms(db: &Path, args: SmsArgs) -> anyhow::Result<()> {
    let store = open_store(db, args.run.no_history).await?;

    let stored = match (&args.account, &store) {
        (Some(name), Some(store)) => Some(
            store
                .account_by_name(name)
                .await?
                .ok_or_else(|| ConfigError::UnknownAccount(name.clone()))?,
        ),
        (Some(_), None) => bail!("--account needs the history database; drop --no-history"),
        (None, _) => None,
    };

    let endpoint = match (&args.gateway, &stored) {
        (Some(url), _) => url.trim().to_string(),
        (None, Some(account)) => account.endpoint.clone(),
        (None, None) => {
            return Err(ConfigError::MissingRequired {
                key: "gateway".into(),
                hint: "Pass --gateway URL or --account NAME".into(),
            }
            .into());
        }
    };

    let account = match (&stored, &store) {
        (Some(account), _) => AccountRef {
            id: account.id,
            name: account.name.clone(),
        },
        (None, Some(store)) => {
            let account = store.ensure_account(&endpoint, &endpoint).await?;
            AccountRef {
                id: account.id,
                name: account.name,
            }
        }
        (None, None) => AccountRef {
            id: 0,
            name: endpoint.clone(),
        },
    };

    let explicit = args.token.clone().or_else(|| {
        stored
            .as_ref()
            .map(|a| a.credential.expose_secret().to_string())
            .filter(|t| !t.is_empty())
    });
    let credential = resolve_credential(explicit, Some(GATEWAY_TOKEN_ENV), || {
        prompt_line("Gateway token (empty for none)")
    })?;

    let mut config = DispatchConfig {
        account,
        endpoint: endpoint.clone(),
        credential,
        recipient_prefix: args.prefix.clone(),
        force_plus: args.force_plus,
        ..DispatchConfig::for_channel(ChannelKind::Sms)
    };
    apply_run_args(&mut config, &args.run);

    let transport = HttpGateway::new(&endpoint)?;
    let templates = Templates::body(Template::load(&args.template)?);
    let history = history_gate(store);

    let summary = dispatch(
        config,
        transport,
        history,
        Source::File(args.file),
        templates,
        args.run.continue_past_cap,
    )
    .await?;
    print_summary(&summary);
    Ok(())
}

async fn send_email(db: &Path, args: EmailArgs) -> anyhow::Result<()> {
    let store = open_store(db, args.run.no_history).await?;

    let mut settings = SmtpSettings::from_env();
    if let Some(timeout) = args.run.timeout {
        settings.timeout = seconds(timeout);
    }
    if settings.from_address.trim().is_empty() {
        return Err(ConfigError::MissingRequired {
            key: "BULKSEND_SMTP_FROM_ADDRESS".into(),
            hint: "Set BULKSEND_SMTP_USERNAME or BULKSEND_SMTP_FROM_ADDRESS".into(),
        }
        .into());
    }

    let credential = resolve_credential(args.password.clone(), Some(SMTP_PASSWORD_ENV), || {
        prompt_line(&format!("SMTP password for {}", settings.username))
    })?;
    settings.password = SecretString::from(credential.expose_secret().to_string());

    let endpoint = format!("smtp://{}:{}", settings.host, settings.port);
    let account = match &store {
        Some(store) => {
            let account = store.ensure_account(&settings.from_address, &endpoint).await?;
            AccountRef {
                id: account.id,
                name: account.name,
            }
        }
        None => AccountRef {
            id: 0,
            name: settings.from_address.clone(),
        },
    };

    let mut config = DispatchConfig {
        account,
        endpoint,
        credential,
        ..DispatchConfig::for_channel(ChannelKind::Email)
    };
    apply_run_args(&mut config, &args.run);

    let templates = email_templates(&args)?;

    let source = match (&args.file, &args.to) {
        (Some(file), _) => Source::File(file.clone()),
        (None, Some(to)) => Source::Single(single_row(
            &config.recipient_field,
            to,
            &args.vars,
        )),
        (None, None) => bail!("pass --file or --to"),
    };

    let mailer = SmtpMailer::new(settings)?;
    if !config.dry_run {
        mailer
            .verify()
            .await
            .context("SMTP connection check failed")?;
    }

    let history = history_gate(store);
    let summary = dispatch(
        config,
        mailer,
        history,
        source,
        templates,
        args.run.continue_past_cap,
    )
    .await?;
    print_summary(&summary);
    Ok(())
}

async fn accounts(db: &Path, cmd: AccountsCommand) -> anyhow::Result<()> {
    let store = LibSqlHistory::new_local(db)
        .await
        .with_context(|| format!("Failed to open history database at {}", db.display()))?;

    match cmd {
        AccountsCommand::Add {
            name,
            endpoint,
            token,
        } => {
            HttpGateway::new(&endpoint)?;
            let credential = resolve_credential(token, Some(GATEWAY_TOKEN_ENV), || {
                prompt_line("Gateway token (empty for none)")
            })?;
            let account = store.add_account(&name, &endpoint, &credential).await?;
            println!("Added account '{}' (id {})", account.name, account.id);
        }
        AccountsCommand::List => {
            let accounts = store.list_accounts().await?;
            if accounts.is_empty() {
                println!("No accounts registered.");
            }
            for account in accounts {
                let token = if account.credential.expose_secret().is_empty() {
                    "no token"
                } else {
                    "token set"
                };
                println!(
                    "{:<20} {:<40} {} ({token})",
                    account.name,
                    account.endpoint,
                    account.created_at.format("%Y-%m-%d")
                );
            }
        }
    }
    Ok(())
}

fn columns(file: &Path, channel: ChannelKind) -> anyhow::Result<()> {
    let source = RowSource::open(file, SourceOptions::for_channel(channel))?;
    let dialect = channel.dialect();

    let mut names: Vec<String> = source.headers().to_vec();
    for (name, _) in channel.canonical_fields() {
        if !names.iter().any(|h| h.eq_ignore_ascii_case(name)) {
            names.push(name.to_string());
        }
    }

    println!("Template variables for {}:", file.display());
    for name in names.iter().filter(|n| !n.is_empty()) {
        println!(
            "  {:<24} {:<28} {}",
            dialect.placeholder(name),
            dialect.placeholder(&format!("{name}_upper")),
            dialect.placeholder(&format!("{name}_lower"))
        );
    }
    Ok(())
}

// ── Helpers ─────────────────────────────────────────────────────────

enum Source {
    File(PathBuf),
    Single(Row),
}

async fn dispatch<T: Transport>(
    config: DispatchConfig,
    transport: T,
    history: Arc<dyn HistoryGate>,
    source: Source,
    templates: Templates,
    continue_past_cap: bool,
) -> anyhow::Result<RunSummary> {
    let renderer = config.dialect.renderer();
    let engine = Dispatcher::new(config, transport, history, renderer)
        .with_observer(Arc::new(ConsoleObserver { continue_past_cap }));

    let cancel = engine.cancel_handle();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStopping after the current row...");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let result = match source {
        Source::File(path) => engine.run_file(&path, templates).await,
        Source::Single(row) => {
            let headers: Vec<String> = row.keys().map(str::to_string).collect();
            engine
                .run(RunInput {
                    headers,
                    rows: Box::new(std::iter::once(Ok(row))),
                    total: RowCount::Known(1),
                    templates,
                })
                .await
        }
    };
    watcher.abort();
    Ok(result?)
}

async fn open_store(db: &Path, no_history: bool) -> anyhow::Result<Option<Arc<LibSqlHistory>>> {
    if no_history {
        return Ok(None);
    }
    let store = LibSqlHistory::new_local(db)
        .await
        .with_context(|| format!("Failed to open history database at {}", db.display()))?;
    Ok(Some(Arc::new(store)))
}

fn history_gate(store: Option<Arc<LibSqlHistory>>) -> Arc<dyn HistoryGate> {
    match store {
        Some(store) => store,
        None => Arc::new(NoHistory),
    }
}

fn apply_run_args(config: &mut DispatchConfig, run: &RunArgs) {
    config.retries = run.retries;
    if let Some(timeout) = run.timeout {
        config.timeout = seconds(timeout);
    }
    config.delay = seconds(run.delay);
    config.limit = run.limit;
    config.start_row = usize::try_from(run.start_row).unwrap_or(usize::MAX);
    config.dry_run = run.dry_run;
    if let Some(out) = &run.out {
        config.output = out.clone();
    }
    config.skip_duplicates = run.skip_duplicates;
    config.daily_cap = run.daily_cap;
    if let Some(field) = &run.recipient_field {
        config.recipient_field = field.clone();
    }
    if let Some(dialect) = run.dialect {
        config.dialect = dialect;
    }
}

/// Body from a file or inline text; the subject is always inline.
fn email_templates(args: &EmailArgs) -> anyhow::Result<Templates> {
    Ok(Templates::body(Template::load(&args.template)?)
        .with_subject(Template::inline(args.subject.as_str())))
}

/// One row for a single-recipient send: the variables plus the address.
fn single_row(recipient_field: &str, to: &str, vars: &[(String, String)]) -> Row {
    let mut row = Row::new();
    row.insert(recipient_field, to.trim());
    for (key, value) in vars {
        row.insert(key.as_str(), value.as_str());
    }
    row
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

fn prompt_line(label: &str) -> std::io::Result<String> {
    let mut stderr = std::io::stderr();
    write!(stderr, "{label}: ")?;
    stderr.flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line)
}

fn print_summary(summary: &RunSummary) {
    let outcome = match summary.stop {
        StopReason::Exhausted => "completed",
        StopReason::LimitReached => "stopped at row limit",
        StopReason::Cancelled => "cancelled",
        StopReason::CapDeclined => "stopped at daily cap",
    };
    println!(
        "Run {outcome}: {} processed, {} sent, {} failed, {} skipped, {} dry-run. Log: {}",
        summary.processed,
        summary.sent,
        summary.failed,
        summary.skipped,
        summary.dry_run,
        summary.output.display()
    );
}

/// Progress on stderr; the daily-cap question on stdin.
struct ConsoleObserver {
    continue_past_cap: bool,
}

#[async_trait]
impl DispatchObserver for ConsoleObserver {
    fn on_start(&self, total: RowCount) {
        eprintln!("Dispatching {total} rows");
    }

    fn on_progress(&self, message: &str, processed: usize) {
        eprintln!("[{processed}] {message}");
    }

    async fn on_daily_cap(&self, sent_today: u64, cap: u64) -> CapDecision {
        if self.continue_past_cap {
            tracing::warn!(sent_today, cap, "Daily cap reached, continuing");
            return CapDecision::Continue;
        }

        let label = format!("Daily cap of {cap} reached ({sent_today} sent today). Continue? [y/N]");
        let answer = tokio::task::spawn_blocking(move || prompt_line(&label)).await;
        match answer {
            Ok(Ok(line)) if is_yes(&line) => CapDecision::Continue,
            _ => CapDecision::Stop,
        }
    }

    fn on_complete(&self, summary: &RunSummary) {
        tracing::debug!(run_id = %summary.run_id, "Run complete");
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
