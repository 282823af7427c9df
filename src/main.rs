//! CLI entry point for `incoming-registry`.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use clap::{Args, CommandFactory, Parser, Subcommand};

use incoming_registry::config::{self, Config};
use incoming_registry::ingest::{IngestOptions, RunReport};
use incoming_registry::mailbox::{ImapConnector, MailboxConnector, MemoryMailbox};
use incoming_registry::model::record::default_deadline;
use incoming_registry::model::{
    Attachment, AttachmentPart, IncomingRecord, NewRecord, RecordUpdate,
};
use incoming_registry::store::{self, blob, RecordFilter, Repository, SqliteRepository};
use incoming_registry::summary::Summarizer;

#[derive(Parser)]
#[command(
    name = "incoming-registry",
    version,
    about = "Registry of incoming correspondence, fed by hand or from a mailbox"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Register unread mailbox messages once
    Ingest {
        /// Decode and summarize without storing or flagging anything
        #[arg(long)]
        dry_run: bool,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
        /// Read `.eml` files from a directory instead of the mailbox
        #[arg(long, value_name = "DIR")]
        eml_dir: Option<PathBuf>,
    },
    /// Ingest repeatedly, sleeping between runs
    Watch {
        /// Seconds between runs (default from config, 300)
        #[arg(long, value_name = "SECONDS")]
        interval: Option<u64>,
    },
    /// List records, newest number first
    List {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long)]
        json: bool,
    },
    /// Show one record and its attachments
    Show {
        /// Registration number
        number: i64,
        #[arg(long)]
        json: bool,
        /// Copy the attachments into this directory
        #[arg(long, value_name = "DIR")]
        save_attachments: Option<PathBuf>,
    },
    /// Register a record by hand
    Add {
        /// Registration number (default: next free)
        #[arg(long)]
        number: Option<i64>,
        /// Received date, YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        applicant: String,
        #[arg(long)]
        summary: String,
        /// Person in charge (default from config)
        #[arg(long)]
        responsible: Option<String>,
        /// Reply due date, YYYY-MM-DD (default: date + 10 days)
        #[arg(long)]
        deadline: Option<NaiveDate>,
        /// File to attach; repeatable
        #[arg(long = "attach", value_name = "FILE")]
        attachments: Vec<PathBuf>,
    },
    /// Change fields of a record
    Update {
        /// Registration number of the record to change
        number: i64,
        #[arg(long, value_name = "NUMBER")]
        new_number: Option<i64>,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        applicant: Option<String>,
        #[arg(long)]
        summary: Option<String>,
        #[arg(long)]
        responsible: Option<String>,
        #[arg(long)]
        deadline: Option<NaiveDate>,
        /// File to attach; repeatable
        #[arg(long = "attach", value_name = "FILE")]
        attachments: Vec<PathBuf>,
    },
    /// Delete a record and its attachments
    Delete {
        /// Registration number
        number: i64,
    },
    /// Write a default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

#[derive(Args, Debug, Default)]
struct FilterArgs {
    /// Applicant contains
    #[arg(long)]
    applicant: Option<String>,
    /// Received on or after (YYYY-MM-DD)
    #[arg(long, value_name = "DATE")]
    from: Option<NaiveDate>,
    /// Received on or before (YYYY-MM-DD)
    #[arg(long, value_name = "DATE")]
    to: Option<NaiveDate>,
    /// Responsible contains
    #[arg(long)]
    responsible: Option<String>,
    /// Exact registration number
    #[arg(long)]
    number: Option<i64>,
    /// Summary contains
    #[arg(long)]
    summary: Option<String>,
    /// Deadline on or after (YYYY-MM-DD)
    #[arg(long, value_name = "DATE")]
    deadline_from: Option<NaiveDate>,
    /// Deadline on or before (YYYY-MM-DD)
    #[arg(long, value_name = "DATE")]
    deadline_to: Option<NaiveDate>,
    /// Only records with (yes) or without (no) attachments
    #[arg(long, value_name = "yes|no", value_parser = parse_yes_no)]
    attachments: Option<bool>,
}

impl From<FilterArgs> for RecordFilter {
    fn from(args: FilterArgs) -> Self {
        Self {
            applicant: args.applicant,
            date_from: args.from,
            date_to: args.to,
            responsible: args.responsible,
            number: args.number,
            summary: args.summary,
            deadline_from: args.deadline_from,
            deadline_to: args.deadline_to,
            has_attachments: args.attachments,
        }
    }
}

fn parse_yes_no(s: &str) -> Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "yes" | "y" | "true" => Ok(true),
        "no" | "n" | "false" => Ok(false),
        other => Err(format!("expected yes or no, got '{other}'")),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = config::load_config();

    // Configure logging: stderr + log file in the data dir
    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    match cli.command {
        Commands::Ingest {
            dry_run,
            json,
            eml_dir,
        } => cmd_ingest(&config, dry_run, json, eml_dir.as_deref()),
        Commands::Watch { interval } => cmd_watch(&config, interval),
        Commands::List { filter, json } => cmd_list(&config, filter.into(), json),
        Commands::Show {
            number,
            json,
            save_attachments,
        } => cmd_show(&config, number, json, save_attachments.as_deref()),
        Commands::Add {
            number,
            date,
            applicant,
            summary,
            responsible,
            deadline,
            attachments,
        } => {
            let date = date.unwrap_or_else(|| chrono::Local::now().date_naive());
            let record = NewRecord {
                number,
                date,
                applicant,
                summary,
                responsible: responsible
                    .unwrap_or_else(|| config.ingest.default_responsible.clone()),
                deadline: deadline
                    .unwrap_or_else(|| default_deadline(date, config.ingest.deadline_days)),
            };
            cmd_add(&config, record, &attachments)
        }
        Commands::Update {
            number,
            new_number,
            date,
            applicant,
            summary,
            responsible,
            deadline,
            attachments,
        } => {
            let update = RecordUpdate {
                number: new_number,
                date,
                applicant,
                summary,
                responsible,
                deadline,
            };
            cmd_update(&config, number, &update, &attachments)
        }
        Commands::Delete { number } => cmd_delete(&config, number),
        Commands::InitConfig { force } => cmd_init_config(&config, force),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_dir = config::data_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "registry.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        // Fall back to stderr only
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

/// Run one ingestion pass against the mailbox or an `.eml` directory.
fn cmd_ingest(
    config: &Config,
    dry_run: bool,
    json: bool,
    eml_dir: Option<&Path>,
) -> anyhow::Result<()> {
    let connector: Box<dyn MailboxConnector> = match eml_dir {
        Some(dir) => Box::new(MemoryMailbox::from_eml_dir(dir)?),
        None => Box::new(ImapConnector::from_config(&config.mailbox)?),
    };
    let mut repo = SqliteRepository::open_from_config(config)?;
    let summarizer = Summarizer::from_config(&config.summarizer);
    let options = IngestOptions {
        dry_run,
        ..IngestOptions::from(config)
    };

    let start = Instant::now();
    let report = incoming_registry::ingest::run_ingestion(
        connector.as_ref(),
        &mut repo,
        &summarizer,
        options,
    )?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, start.elapsed());
    }
    Ok(())
}

/// Ingest forever. Failed runs are logged and retried on the next tick.
fn cmd_watch(config: &Config, interval: Option<u64>) -> anyhow::Result<()> {
    let interval = Duration::from_secs(interval.unwrap_or(config.ingest.interval_secs).max(1));
    let connector = ImapConnector::from_config(&config.mailbox)?;
    let summarizer = Summarizer::from_config(&config.summarizer);
    let mut repo = SqliteRepository::open_from_config(config)?;

    tracing::info!(interval_secs = interval.as_secs(), "Watching mailbox");
    loop {
        let start = Instant::now();
        match incoming_registry::ingest::run_ingestion(
            &connector,
            &mut repo,
            &summarizer,
            IngestOptions::from(config),
        ) {
            Ok(report) => {
                if report.listed > 0 {
                    print_report(&report, start.elapsed());
                }
            }
            Err(e) => tracing::error!(error = %e, "Ingestion run failed"),
        }
        std::thread::sleep(interval);
    }
}

fn cmd_list(config: &Config, filter: RecordFilter, json: bool) -> anyhow::Result<()> {
    let repo = SqliteRepository::open_from_config(config)?;
    let records = repo.list(&filter)?;

    if json {
        let items = records
            .iter()
            .map(|r| {
                let attachments = repo.attachments(r.id)?;
                Ok(record_json(r, &attachments))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let output = serde_json::json!({
            "record_count": records.len(),
            "records": items,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_records_table(&records);
    }
    Ok(())
}

fn cmd_show(
    config: &Config,
    number: i64,
    json: bool,
    save_to: Option<&Path>,
) -> anyhow::Result<()> {
    let repo = SqliteRepository::open_from_config(config)?;
    let record = repo.get_by_number(number)?;
    let attachments = repo.attachments(record.id)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&record_json(&record, &attachments))?
        );
    } else {
        print_record(&record, &attachments);
    }

    if let Some(dir) = save_to {
        for att in &attachments {
            match repo
                .attachment_content(att)
                .and_then(|content| blob::export_to(dir, &att.filename, &content))
            {
                Ok(path) => println!("  Saved {}", path.display()),
                Err(e) => tracing::warn!(
                    filename = %att.filename,
                    error = %e,
                    "Failed to export attachment"
                ),
            }
        }
    }
    Ok(())
}

fn cmd_add(config: &Config, record: NewRecord, files: &[PathBuf]) -> anyhow::Result<()> {
    let mut repo = SqliteRepository::open_from_config(config)?;
    let record = store::register_with_files(&mut repo, record, files)?;
    println!("  Registered {record}");
    Ok(())
}

fn cmd_update(
    config: &Config,
    number: i64,
    update: &RecordUpdate,
    files: &[PathBuf],
) -> anyhow::Result<()> {
    let parts = load_files(files)?;
    let mut repo = SqliteRepository::open_from_config(config)?;
    let record = repo.get_by_number(number)?;
    let record = repo.update(record.id, update)?;
    for part in &parts {
        repo.add_attachment(record.id, &part.filename, &part.content)?;
    }
    println!("  Updated {record}");
    Ok(())
}

fn cmd_delete(config: &Config, number: i64) -> anyhow::Result<()> {
    let mut repo = SqliteRepository::open_from_config(config)?;
    let record = repo.get_by_number(number)?;
    repo.delete(record.id)?;
    println!("  Deleted {record}");
    Ok(())
}

fn load_files(files: &[PathBuf]) -> anyhow::Result<Vec<AttachmentPart>> {
    Ok(files
        .iter()
        .map(|path| blob::load_file(path))
        .collect::<incoming_registry::error::Result<Vec<_>>>()?)
}

fn cmd_init_config(config: &Config, force: bool) -> anyhow::Result<()> {
    let path = config::config_file_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config file path"))?;
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    // Secrets from the environment are not written back
    let mut to_save = config.clone();
    to_save.mailbox.password.clear();
    to_save.summarizer.api_key = None;
    config::save_config(&to_save)?;
    println!("  Wrote {}", path.display());
    Ok(())
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "incoming-registry", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}

fn print_report(report: &RunReport, elapsed: Duration) {
    println!();
    if report.dry_run {
        println!("  Dry run: nothing was stored or marked read");
    }
    println!("  {:<22} {}", "Unread messages", report.listed);
    println!("  {:<22} {}", "Records created", report.created);
    println!("  {:<22} {}", "Duplicates", report.duplicates);
    println!("  {:<22} {}", "Failed", report.failed);
    println!("  {:<22} {}", "Attachments saved", report.attachments_saved);
    if report.attachments_skipped > 0 {
        println!("  {:<22} {}", "Attachments skipped", report.attachments_skipped);
    }
    if report.mark_read_failures > 0 {
        println!("  {:<22} {}", "Not marked read", report.mark_read_failures);
    }
    if !report.created_numbers.is_empty() {
        let numbers: Vec<String> = report.created_numbers.iter().map(i64::to_string).collect();
        println!("  {:<22} {}", "New numbers", numbers.join(", "));
    }
    println!("  {:<22} {:.2?}", "Time", elapsed);
    println!();
}

fn print_records_table(records: &[IncomingRecord]) {
    println!();
    println!("  {} record(s)", records.len());
    println!();

    if records.is_empty() {
        return;
    }

    println!(
        "  {:>6} {:<10} {:<25} {:<40} {:<20} {:<10}",
        "No.", "Date", "Applicant", "Summary", "Responsible", "Deadline"
    );
    println!("  {}", "-".repeat(116));

    for r in records {
        let applicant: String = r.applicant.chars().take(24).collect();
        let summary: String = r
            .summary
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .take(39)
            .collect();
        let responsible: String = r.responsible.chars().take(19).collect();
        println!(
            "  {:>6} {:<10} {:<25} {:<40} {:<20} {:<10}",
            r.number,
            r.date.format("%Y-%m-%d"),
            applicant,
            summary,
            responsible,
            r.deadline.format("%Y-%m-%d")
        );
    }
    println!();
}

fn print_record(record: &IncomingRecord, attachments: &[Attachment]) {
    use humansize::{format_size, BINARY};

    println!();
    println!("  {:<14} {}", "No.", record.number);
    println!("  {:<14} {}", "Date", record.date.format("%Y-%m-%d"));
    println!("  {:<14} {}", "Applicant", record.applicant);
    println!("  {:<14} {}", "Responsible", record.responsible);
    println!("  {:<14} {}", "Deadline", record.deadline.format("%Y-%m-%d"));
    println!("  {:<14} {}", "Summary", record.summary.trim());

    if !attachments.is_empty() {
        println!();
        println!("  Attachments:");
        for att in attachments {
            println!("    {:>10}  {}", format_size(att.size, BINARY), att.filename);
        }
    }
    println!();
}

fn record_json(record: &IncomingRecord, attachments: &[Attachment]) -> serde_json::Value {
    serde_json::json!({
        "id": record.id,
        "number": record.number,
        "date": record.date.to_string(),
        "applicant": record.applicant,
        "summary": record.summary,
        "responsible": record.responsible,
        "deadline": record.deadline.to_string(),
        "attachments": attachments.iter().map(|a| serde_json::json!({
            "filename": a.filename,
            "size": a.size,
        })).collect::<Vec<_>>(),
    })
}
