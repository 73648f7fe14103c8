// bin/trustctl.rs - Trust Repository CLI
//
//! Administration tool for a peer-trust repository.
//!
//! # Usage
//!
//! ```bash
//! # Create the master key and repository
//! trustctl --data-dir ./data init
//!
//! # List subjects with trust level and degree
//! trustctl list
//!
//! # Show aliases, certificates and sub-keys of one subject
//! trustctl inspect 3f9a...
//!
//! # Reload the repository and report what survived
//! trustctl verify
//!
//! # Same, with the subject and purge counters on stderr
//! trustctl verify --metrics
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;

use peer_trust::config::NodeConfig;
use peer_trust::observability::{init_metrics, init_tracing, MetricsConfig, TracingConfig};
use peer_trust::trust::{
    ExportedKey, Fingerprint, KeyManager, SoftwareKeyManager, Subject, TrustLevel, TrustManager,
    TrustStore,
};

/// Peer trust CLI
#[derive(Parser, Debug)]
#[command(name = "trustctl")]
#[command(version)]
#[command(about = "Inspect and maintain a peer-trust certificate repository")]
#[command(long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory, overrides the configuration
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log filter, overrides the configuration
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text", global = true)]
    format: OutputFormat,

    /// Print Prometheus metrics gathered during the command to stderr
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the master key and an empty repository
    Init,

    /// Print the local fingerprint
    Fingerprint,

    /// List known subjects
    List,

    /// Show one subject in detail
    Inspect {
        /// Subject fingerprint (hex)
        fingerprint: String,
    },

    /// Reload the repository from disk and report the result
    Verify,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = NodeConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(level) = &args.log_level {
        config.log.filter = level.clone();
    }
    init_tracing(TracingConfig::from_log_config(&config.log)).context("Failed to initialize logging")?;

    let metrics = if args.metrics {
        Some(init_metrics(MetricsConfig::default()).context("Failed to install metrics recorder")?)
    } else {
        None
    };

    let result = match &args.command {
        Commands::Init => cmd_init(&args, &config),
        Commands::Fingerprint => cmd_fingerprint(&args, &config),
        Commands::List => cmd_list(&args, &config),
        Commands::Inspect { fingerprint } => cmd_inspect(&args, &config, fingerprint),
        Commands::Verify => cmd_verify(&args, &config),
    };

    if let Some(handle) = metrics {
        eprint!("{}", handle.render());
    }
    result
}

// =============================================================================
// Repository Access
// =============================================================================

fn load_keys(config: &NodeConfig) -> Result<SoftwareKeyManager> {
    let path = config.key_path();
    if !path.exists() {
        bail!("No master key at {:?}, run `trustctl init` first", path);
    }
    let exported = ExportedKey::load(&path)
        .with_context(|| format!("Failed to read master key {:?}", path))?;
    Ok(SoftwareKeyManager::import(&exported)?)
}

fn open_manager(config: &NodeConfig, keys: &SoftwareKeyManager) -> Result<TrustManager> {
    let store = TrustStore::open(config.trust_path(), config.trust.strict_integrity)
        .context("Failed to open repository")?;
    TrustManager::open(store, keys, config.trust.clone()).context("Failed to load repository")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn level_colored(level: TrustLevel) -> colored::ColoredString {
    match level {
        TrustLevel::Ultimate => level.as_str().green().bold(),
        TrustLevel::Trusted => level.as_str().green(),
        TrustLevel::Known => level.as_str().yellow(),
        TrustLevel::Unknown => level.as_str().red(),
    }
}

// =============================================================================
// Views
// =============================================================================

#[derive(Serialize)]
struct SubjectRow {
    fingerprint: String,
    level: &'static str,
    #[serde(skip)]
    trust_level: TrustLevel,
    degree: i32,
    alias: Option<String>,
}

#[derive(Serialize)]
struct IssuerView {
    issuer: String,
    alias: Option<String>,
    time: i64,
}

#[derive(Serialize)]
struct SubKeyView {
    key_id: String,
    package: String,
    bound_to: Option<String>,
    tag: Option<String>,
    time: i64,
}

#[derive(Serialize)]
struct SubjectDetail {
    fingerprint: String,
    level: &'static str,
    degree: i32,
    aliases: Vec<String>,
    last_sync: i64,
    issuers: Vec<IssuerView>,
    issued: Vec<String>,
    subkeys: Vec<SubKeyView>,
}

#[derive(Serialize)]
struct VerifyReport {
    owner: String,
    strict_integrity: bool,
    on_disk: usize,
    loaded: usize,
    purged: Vec<String>,
    by_level: Vec<(&'static str, usize)>,
}

fn detail(manager: &TrustManager, subject: &Subject) -> SubjectDetail {
    let meta = manager.meta_information(&subject.fingerprint).unwrap_or_default();

    let mut issuers: Vec<IssuerView> = subject
        .issuers
        .values()
        .map(|sig| IssuerView {
            issuer: sig.issuer.to_string(),
            alias: sig.alias.clone(),
            time: sig.time,
        })
        .collect();
    issuers.sort_by(|a, b| a.issuer.cmp(&b.issuer));

    let mut issued: Vec<String> = subject.issued.iter().map(Fingerprint::to_string).collect();
    issued.sort();

    let mut subkeys: Vec<SubKeyView> = subject
        .subkeys
        .iter()
        .map(|(id, entry)| SubKeyView {
            key_id: id.to_string(),
            package: entry.signature.app.package_name.clone(),
            bound_to: entry.signature.app.signature_fingerprint.as_ref().map(Fingerprint::to_string),
            tag: entry.signature.tag.clone(),
            time: entry.signature.time,
        })
        .collect();
    subkeys.sort_by(|a, b| a.key_id.cmp(&b.key_id));

    SubjectDetail {
        fingerprint: subject.fingerprint.to_string(),
        level: subject.trust_info.level.as_str(),
        degree: subject.trust_info.degree,
        aliases: meta.aliases,
        last_sync: meta.last_sync,
        issuers,
        issued,
        subkeys,
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

fn cmd_init(args: &Args, config: &NodeConfig) -> Result<()> {
    let existed = config.key_path().exists();
    let keys = SoftwareKeyManager::load_or_generate(&config.key_path())
        .with_context(|| format!("Failed to create master key in {:?}", config.data_dir))?;
    let manager = open_manager(config, &keys)?;

    if args.format == OutputFormat::Json {
        return print_json(&serde_json::json!({
            "fingerprint": keys.fingerprint().to_string(),
            "created": !existed,
            "subjects": manager.len(),
        }));
    }

    if existed {
        println!("{}", "Repository already initialized".yellow());
    } else {
        println!("{}", "Repository initialized".green().bold());
    }
    println!("  {} {}", "Fingerprint:".bold(), keys.fingerprint());
    println!("  {} {:?}", "Repository:".bold(), config.trust_path());
    println!("  {} {}", "Subjects:".bold(), manager.len());
    Ok(())
}

fn cmd_fingerprint(args: &Args, config: &NodeConfig) -> Result<()> {
    let keys = load_keys(config)?;

    match args.format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "fingerprint": keys.fingerprint().to_string(),
            "created_at": keys.created_at(),
        })),
        OutputFormat::Text => {
            println!("{}", keys.fingerprint());
            Ok(())
        }
    }
}

fn cmd_list(args: &Args, config: &NodeConfig) -> Result<()> {
    let keys = load_keys(config)?;
    let manager = open_manager(config, &keys)?;

    let mut rows: Vec<SubjectRow> = manager
        .subjects()
        .map(|subject| SubjectRow {
            fingerprint: subject.fingerprint.to_string(),
            level: subject.trust_info.level.as_str(),
            trust_level: subject.trust_info.level,
            degree: subject.trust_info.degree,
            alias: manager
                .meta_information(&subject.fingerprint)
                .and_then(|meta| meta.aliases.into_iter().next()),
        })
        .collect();
    rows.sort_by(|a, b| a.degree.cmp(&b.degree).then_with(|| a.fingerprint.cmp(&b.fingerprint)));

    if args.format == OutputFormat::Json {
        return print_json(&rows);
    }

    println!("{}", format!("Subjects ({})", rows.len()).bold().cyan());
    println!("{}", "─".repeat(60));
    for row in &rows {
        println!(
            "  {}  {:<9} {:>2}  {}",
            &row.fingerprint[..16],
            level_colored(row.trust_level),
            row.degree,
            row.alias.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn cmd_inspect(args: &Args, config: &NodeConfig, fingerprint: &str) -> Result<()> {
    let fingerprint: Fingerprint = fingerprint
        .parse()
        .with_context(|| format!("Invalid fingerprint: {}", fingerprint))?;
    let keys = load_keys(config)?;
    let manager = open_manager(config, &keys)?;

    let Some(subject) = manager.subject(&fingerprint) else {
        bail!("Unknown subject {}", fingerprint.short());
    };
    let detail = detail(&manager, subject);

    if args.format == OutputFormat::Json {
        return print_json(&detail);
    }

    println!("{}", format!("Subject {}", detail.fingerprint).bold().cyan());
    println!("{}", "─".repeat(60));
    println!(
        "  {} {} (degree {})",
        "Trust:".bold(),
        level_colored(subject.trust_info.level),
        detail.degree
    );
    if !detail.aliases.is_empty() {
        println!("  {} {}", "Aliases:".bold(), detail.aliases.join(", "));
    }
    if detail.last_sync > 0 {
        println!("  {} {}", "Last sync:".bold(), format_millis(detail.last_sync));
    }

    println!("  {}", "Certified by:".bold());
    for issuer in &detail.issuers {
        println!(
            "    {}  {}  {}",
            &issuer.issuer[..16],
            format_millis(issuer.time),
            issuer.alias.as_deref().unwrap_or("")
        );
    }

    println!("  {}", "Certifies:".bold());
    for issued in &detail.issued {
        println!("    {}", &issued[..16]);
    }

    if !detail.subkeys.is_empty() {
        println!("  {}", "Sub-keys:".bold());
        for subkey in &detail.subkeys {
            println!(
                "    {}  {}{}{}",
                subkey.key_id,
                subkey.package,
                subkey
                    .bound_to
                    .as_deref()
                    .map(|fp| format!(" (bound to {})", &fp[..16]))
                    .unwrap_or_default(),
                subkey.tag.as_deref().map(|t| format!(" [{}]", t)).unwrap_or_default(),
            );
        }
    }
    Ok(())
}

fn cmd_verify(args: &Args, config: &NodeConfig) -> Result<()> {
    let keys = load_keys(config)?;
    let store = TrustStore::open(config.trust_path(), config.trust.strict_integrity)
        .context("Failed to open repository")?;
    let on_disk = store.subjects()?.len();

    let mut manager =
        TrustManager::new(store, &keys.fingerprint(), config.trust.clone()).context("Failed to load owner")?;
    let outcome = manager.initialize().context("Repository deduction failed")?;

    let by_level = [
        TrustLevel::Ultimate,
        TrustLevel::Trusted,
        TrustLevel::Known,
    ]
    .into_iter()
    .map(|level| {
        let count = manager.subjects().filter(|s| s.trust_info.level == level).count();
        (level.as_str(), count)
    })
    .collect();

    let report = VerifyReport {
        owner: keys.fingerprint().to_string(),
        strict_integrity: config.trust.strict_integrity,
        on_disk,
        loaded: manager.len(),
        purged: outcome.purged.iter().map(Fingerprint::to_string).collect(),
        by_level,
    };

    if args.format == OutputFormat::Json {
        return print_json(&report);
    }

    println!("{}", "Repository Verification".bold().cyan());
    println!("{}", "─".repeat(40));
    println!("  {} {}", "Owner:".bold(), &report.owner[..16]);
    if !report.strict_integrity {
        println!("  {}", "Signature checks on load are disabled".yellow());
    }
    println!("  {} {}", "On disk:".bold(), report.on_disk);
    println!("  {} {}", "Loaded:".bold(), report.loaded);
    for (level, count) in &report.by_level {
        println!("    {:<9} {}", level, count);
    }

    let rejected = report.on_disk.saturating_sub(report.loaded + report.purged.len());
    if report.purged.is_empty() && rejected == 0 {
        println!("  {}", "Repository consistent".green());
    } else {
        for fp in &report.purged {
            println!("  {} {}", "Purged:".red(), &fp[..16]);
        }
        if rejected > 0 {
            println!("  {} {} subject(s) failed integrity checks", "Rejected:".red(), rejected);
        }
    }
    Ok(())
}

fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}
