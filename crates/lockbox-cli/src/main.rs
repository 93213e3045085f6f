//! lockbox: encrypted personal data vault CLI
//!
//! Everyday commands:
//!   init, categories, get, add, update, delete, convert
//!   doc put | get | rm
//!
//! Maintenance commands:
//!   backup create | inspect | restore
//!   import-legacy, check, orphan view | delete, detach, purge, passwd, recover

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use lockbox_backup::{
    create_backup, get_reconciliation_report, import_legacy_backup, reconcile_with_vault,
    restore_backup, ArchiveKey, ArchiveProblem, BackupOptions, ProgressFn, ReconciliationReport,
    RestoreOptions, RestoreSelection,
};
use lockbox_core::{DocumentReference, LockboxConfig, Record, RecordLayout, VaultError};
use lockbox_crypto::{KdfParams, VaultSession};
use lockbox_integrity::{
    delete_orphan, detach_missing_reference, run_integrity_check, view_orphan,
    view_orphan_with_password, IntegrityReport, OrphanView,
};
use lockbox_store::Vault;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "lockbox",
    version,
    about = "Encrypted personal data vault",
    long_about = "lockbox: encrypted records and documents, verbatim backups, integrity checks"
)]
struct Cli {
    /// Path to lockbox.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "LOCKBOX_CONFIG",
        default_value = "~/.config/lockbox/lockbox.toml"
    )]
    config: PathBuf,

    /// Vault root directory (overrides config)
    #[arg(long, env = "LOCKBOX_VAULT")]
    vault: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides config
    #[arg(long, env = "LOCKBOX_LOG")]
    log: Option<String>,

    /// Log format (json, text); overrides config
    #[arg(long, env = "LOCKBOX_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Answer yes to every confirmation prompt
    #[arg(long, short = 'y', global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LayoutArg {
    Container,
    PerRecord,
}

impl From<LayoutArg> for RecordLayout {
    fn from(arg: LayoutArg) -> Self {
        match arg {
            LayoutArg::Container => RecordLayout::Container,
            LayoutArg::PerRecord => RecordLayout::PerRecord,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new vault
    Init {
        /// Layout for new categories (overrides config)
        #[arg(long, value_enum)]
        layout: Option<LayoutArg>,
    },

    /// List categories on disk
    Categories,

    /// Print the records of a category as JSON
    Get {
        category: String,
        /// Only the record with this id
        #[arg(long)]
        id: Option<String>,
    },

    /// Add a record; FIELDS is a JSON value
    Add {
        category: String,
        id: String,
        fields: String,
    },

    /// Replace a record's fields; FIELDS is a JSON value
    Update {
        category: String,
        id: String,
        fields: String,
    },

    /// Delete a record (no error if it does not exist)
    Delete { category: String, id: String },

    /// Move a category to another on-disk layout
    Convert {
        category: String,
        #[arg(value_enum)]
        layout: LayoutArg,
    },

    /// Document attachments
    Doc {
        #[command(subcommand)]
        action: DocAction,
    },

    /// Backup archives
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// Import a legacy single-file JSON export
    #[command(name = "import-legacy")]
    ImportLegacy { file: PathBuf },

    /// Cross-check document references against document files
    Check {
        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect or remove documents no record refers to
    Orphan {
        #[command(subcommand)]
        action: OrphanAction,
    },

    /// Remove a reference to a missing document from its record
    Detach {
        category: String,
        id: String,
        /// Reference path as shown by `lockbox check`
        path: String,
    },

    /// Permanently remove records of a category that cannot be decrypted
    Purge { category: String },

    /// Change the vault password and re-encrypt everything
    Passwd,

    /// Re-encrypt items still sealed under an earlier password
    Recover,
}

#[derive(Subcommand, Debug)]
enum DocAction {
    /// Encrypt a file into the vault and print its reference JSON
    Put { category: String, file: PathBuf },
    /// Decrypt a document to a file or stdout
    Get {
        category: String,
        path: String,
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
    },
    /// Delete a document file (remove its reference from the record first)
    Rm { category: String, path: String },
}

#[derive(Subcommand, Debug)]
enum BackupAction {
    /// Copy the vault's ciphertext into a new archive directory
    Create {
        target: PathBuf,
        /// Leave keyfile.json out of the archive
        #[arg(long)]
        no_key: bool,
    },
    /// Show what an archive holds without touching the vault
    Inspect { archive: PathBuf },
    /// Restore an archive. Without --category the whole vault is replaced.
    ///
    /// On a new machine run `lockbox init` first; a full restore replaces
    /// its key file with the archived one.
    Restore {
        archive: PathBuf,
        /// Restore only this category (repeatable)
        #[arg(long = "category")]
        categories: Vec<String>,
        /// Do not offer a safety backup before a full restore
        #[arg(long)]
        no_safety_backup: bool,
    },
}

#[derive(Subcommand, Debug)]
enum OrphanAction {
    /// Decrypt an orphan, asking for an older password if needed
    View {
        path: String,
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
    },
    /// Delete an orphaned document file
    Delete { path: String },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let (config, config_found) = load_config(&config_path).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.clone().unwrap_or(if config.log.format == "json" {
        LogFormat::Json
    } else {
        LogFormat::Text
    });
    init_logging(&level, &format);
    if !config_found {
        warn!(
            "config file not found: {}  (using defaults)",
            config_path.display()
        );
    }

    let root = expand_tilde(cli.vault.as_deref().unwrap_or(&config.vault.root));
    let ctx = Ctx {
        config,
        root,
        yes: cli.yes,
    };

    match cli.command {
        Commands::Init { layout } => cmd_init(&ctx, layout).await,
        Commands::Categories => cmd_categories(&ctx).await,
        Commands::Get { category, id } => cmd_get(&ctx, &category, id.as_deref()).await,
        Commands::Add {
            category,
            id,
            fields,
        } => cmd_add(&ctx, &category, &id, &fields).await,
        Commands::Update {
            category,
            id,
            fields,
        } => cmd_update(&ctx, &category, &id, &fields).await,
        Commands::Delete { category, id } => cmd_delete(&ctx, &category, &id).await,
        Commands::Convert { category, layout } => cmd_convert(&ctx, &category, layout).await,
        Commands::Doc { action } => match action {
            DocAction::Put { category, file } => cmd_doc_put(&ctx, &category, &file).await,
            DocAction::Get {
                category,
                path,
                out,
            } => cmd_doc_get(&ctx, &category, &path, out.as_deref()).await,
            DocAction::Rm { category, path } => cmd_doc_rm(&ctx, &category, &path).await,
        },
        Commands::Backup { action } => match action {
            BackupAction::Create { target, no_key } => cmd_backup_create(&ctx, &target, no_key).await,
            BackupAction::Inspect { archive } => cmd_backup_inspect(&archive).await,
            BackupAction::Restore {
                archive,
                categories,
                no_safety_backup,
            } => cmd_backup_restore(&ctx, &archive, categories, no_safety_backup).await,
        },
        Commands::ImportLegacy { file } => cmd_import_legacy(&ctx, &file).await,
        Commands::Check { json } => cmd_check(&ctx, json).await,
        Commands::Orphan { action } => match action {
            OrphanAction::View { path, out } => cmd_orphan_view(&ctx, &path, out.as_deref()).await,
            OrphanAction::Delete { path } => cmd_orphan_delete(&ctx, &path).await,
        },
        Commands::Detach { category, id, path } => cmd_detach(&ctx, &category, &id, &path).await,
        Commands::Purge { category } => cmd_purge(&ctx, &category).await,
        Commands::Passwd => cmd_passwd(&ctx).await,
        Commands::Recover => cmd_recover(&ctx).await,
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

/// Returns the config and whether the file existed.
async fn load_config(path: &Path) -> Result<(LockboxConfig, bool)> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config = LockboxConfig::from_toml_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((LockboxConfig::default(), false))
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

// ── Session helpers ───────────────────────────────────────────────────────────

struct Ctx {
    config: LockboxConfig,
    root: PathBuf,
    yes: bool,
}

impl Ctx {
    fn kdf_params(&self) -> KdfParams {
        KdfParams::from(&self.config.crypto)
    }

    async fn open(&self) -> Result<Vault> {
        Vault::open(&self.root, self.config.vault.default_layout)
            .await
            .with_context(|| format!("opening vault at {}", self.root.display()))
    }

    async fn unlock(&self) -> Result<(Vault, VaultSession)> {
        let vault = self.open().await?;
        let secret = read_password("LOCKBOX_PASSWORD", "Vault password: ")?;
        let session = vault.unlock(&secret).map_err(|e| match e {
            VaultError::Decryption(_) => anyhow!("wrong password"),
            other => other.into(),
        })?;
        Ok((vault, session))
    }

    fn confirm(&self, prompt: &str, default: bool) -> Result<bool> {
        if self.yes {
            return Ok(true);
        }
        Ok(Confirm::new()
            .with_prompt(prompt)
            .default(default)
            .interact()?)
    }
}

/// Read a secret from `env_var`, or prompt for it on the terminal.
fn read_password(env_var: &str, prompt: &str) -> Result<SecretString> {
    if let Ok(value) = std::env::var(env_var) {
        return Ok(SecretString::from(value));
    }
    let value = rpassword::prompt_password(prompt).context("reading password")?;
    Ok(SecretString::from(value))
}

/// Read a new secret, prompting twice unless it comes from `env_var`.
fn read_new_password(env_var: &str) -> Result<SecretString> {
    if let Ok(value) = std::env::var(env_var) {
        return Ok(SecretString::from(value));
    }
    let first = rpassword::prompt_password("New password: ").context("reading password")?;
    let second = rpassword::prompt_password("Repeat new password: ").context("reading password")?;
    if first != second {
        bail!("passwords do not match");
    }
    Ok(SecretString::from(first))
}

fn parse_fields(json: &str) -> Result<Value> {
    serde_json::from_str(json).context("FIELDS must be valid JSON")
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    let style = ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map(|s| s.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn progress_callback(pb: &ProgressBar) -> ProgressFn {
    let pb = pb.clone();
    Box::new(move |done, total, path| {
        pb.set_length(total);
        pb.set_position(done);
        pb.set_message(path.to_string());
    })
}

/// Token cancelled on Ctrl-C. Long operations stop between files.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current file");
            child.cancel();
        }
    });
    token
}

// ── Records ───────────────────────────────────────────────────────────────────

async fn cmd_init(ctx: &Ctx, layout: Option<LayoutArg>) -> Result<()> {
    let layout = layout.map_or(ctx.config.vault.default_layout, RecordLayout::from);
    let secret = read_new_password("LOCKBOX_PASSWORD")?;
    Vault::init(&ctx.root, &secret, &ctx.kdf_params(), layout)
        .await
        .with_context(|| format!("creating vault at {}", ctx.root.display()))?;
    println!("Vault created at {}", ctx.root.display());
    println!("  new categories use the {layout} layout");
    Ok(())
}

async fn cmd_categories(ctx: &Ctx) -> Result<()> {
    let vault = ctx.open().await?;
    for category in vault.records().categories().await? {
        let layout = vault
            .records()
            .layout_of(&category)
            .await?
            .map(|l| l.to_string())
            .unwrap_or_default();
        println!("{category:<32} {layout}");
    }
    Ok(())
}

async fn cmd_get(ctx: &Ctx, category: &str, id: Option<&str>) -> Result<()> {
    let (vault, session) = ctx.unlock().await?;
    let records: Vec<Record> = vault.records().get(&session, category).await?;
    let selected: Vec<&Record> = records
        .iter()
        .filter(|r| id.map_or(true, |id| r.id == id))
        .collect();
    if let Some(id) = id {
        if selected.is_empty() {
            bail!("no record {id:?} in {category:?}");
        }
    }
    println!("{}", serde_json::to_string_pretty(&selected)?);
    Ok(())
}

async fn cmd_add(ctx: &Ctx, category: &str, id: &str, fields: &str) -> Result<()> {
    let record = Record::new(id, category, parse_fields(fields)?);
    let (vault, session) = ctx.unlock().await?;
    vault.records().add(&session, category, &record).await?;
    println!("Added {category}/{id}");
    Ok(())
}

async fn cmd_update(ctx: &Ctx, category: &str, id: &str, fields: &str) -> Result<()> {
    let record = Record::new(id, category, parse_fields(fields)?);
    let (vault, session) = ctx.unlock().await?;
    vault.records().update(&session, category, id, &record).await?;
    println!("Updated {category}/{id}");
    Ok(())
}

async fn cmd_delete(ctx: &Ctx, category: &str, id: &str) -> Result<()> {
    let (vault, session) = ctx.unlock().await?;
    if vault.records().delete(&session, category, id).await? {
        println!("Deleted {category}/{id}");
    } else {
        println!("No record {category}/{id} (nothing to do)");
    }
    Ok(())
}

async fn cmd_convert(ctx: &Ctx, category: &str, layout: LayoutArg) -> Result<()> {
    let (vault, session) = ctx.unlock().await?;
    let layout = RecordLayout::from(layout);
    vault
        .records()
        .convert_layout(&session, category, layout)
        .await?;
    println!("{category} now uses the {layout} layout");
    Ok(())
}

// ── Documents ─────────────────────────────────────────────────────────────────

/// Reference for a path given on the command line. Only `path` and
/// `mimeType` matter for loading.
fn reference_for(path: &str) -> DocumentReference {
    DocumentReference {
        id: String::new(),
        path: path.to_string(),
        filename: path.rsplit('/').next().unwrap_or(path).to_string(),
        mime_type: "application/octet-stream".into(),
        uploaded_at: Utc::now(),
    }
}

async fn cmd_doc_put(ctx: &Ctx, category: &str, file: &Path) -> Result<()> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".into());

    let (vault, session) = ctx.unlock().await?;
    let reference = vault
        .documents()
        .save_document(&session, category, &filename, &STANDARD.encode(&bytes), Utc::now())
        .await?;
    eprintln!("Embed this reference in a record's fields:");
    println!("{}", serde_json::to_string_pretty(&reference)?);
    Ok(())
}

async fn cmd_doc_get(ctx: &Ctx, category: &str, path: &str, out: Option<&Path>) -> Result<()> {
    let (vault, session) = ctx.unlock().await?;
    let bytes = vault
        .documents()
        .load_document_bytes(&session, category, &reference_for(path))
        .await?;
    write_output(out, &bytes).await
}

async fn cmd_doc_rm(ctx: &Ctx, category: &str, path: &str) -> Result<()> {
    let vault = ctx.open().await?;
    if !ctx.confirm(
        &format!("Delete {path}? Records still pointing at it will have a missing file"),
        false,
    )? {
        println!("Aborted.");
        return Ok(());
    }
    if vault.documents().delete_document(category, &reference_for(path)).await? {
        println!("Deleted {path}");
    } else {
        println!("{path} was already gone");
    }
    Ok(())
}

async fn write_output(out: Option<&Path>, bytes: &[u8]) -> Result<()> {
    match out {
        Some(path) => {
            tokio::fs::write(path, bytes)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            eprintln!("Wrote {} to {}", fmt_bytes(bytes.len() as u64), path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(bytes)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

// ── Backup and restore ────────────────────────────────────────────────────────

async fn cmd_backup_create(ctx: &Ctx, target: &Path, no_key: bool) -> Result<()> {
    let vault = ctx.open().await?;
    let pb = make_progress_bar("backup");
    let progress = progress_callback(&pb);
    let cancel = cancel_on_ctrl_c();

    let result = create_backup(
        &vault,
        target,
        BackupOptions {
            include_master_key: ctx.config.backup.include_master_key && !no_key,
            progress: Some(&progress),
            cancel: Some(&cancel),
        },
    )
    .await;
    pb.finish_and_clear();
    let manifest = result?;

    println!("Backup written to {}", target.display());
    println!("  data files:     {}", manifest.data_files.len());
    println!("  document files: {}", manifest.document_files.len());
    println!("  size:           {}", fmt_bytes(manifest.total_bytes()));
    println!(
        "  key file:       {}",
        if manifest.has_master_key { "included" } else { "not included" }
    );
    Ok(())
}

fn print_reconciliation(archive: &Path, report: &ReconciliationReport) {
    println!("Backup {}", archive.display());
    println!("  taken:          {}", report.timestamp.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  data files:     {}", report.data_file_count);
    println!("  document files: {}", report.document_file_count);
    println!("  size:           {}", fmt_bytes(report.total_bytes));
    println!("  categories:     {}", report.categories.join(", "));
    println!(
        "  key file:       {}",
        if report.has_master_key { "included" } else { "not included" }
    );
    if let Some(key) = report.key_match {
        let shown = match key {
            ArchiveKey::Current => "matches this vault",
            ArchiveKey::Retired => "from before a password change",
            ArchiveKey::Foreign => "from a different vault",
            ArchiveKey::NotIncluded => "unknown",
        };
        println!("  vault key:      {shown}");
    }
    for problem in &report.problems {
        match problem {
            ArchiveProblem::Missing { path } => println!("  MISSING         {path}"),
            ArchiveProblem::SizeMismatch {
                path,
                expected,
                actual,
            } => println!("  SIZE MISMATCH   {path} (manifest {expected}, found {actual})"),
        }
    }
}

async fn cmd_backup_inspect(archive: &Path) -> Result<()> {
    let report = get_reconciliation_report(archive).await?;
    print_reconciliation(archive, &report);
    if !report.is_complete() {
        bail!("archive does not match its manifest");
    }
    Ok(())
}

async fn cmd_backup_restore(
    ctx: &Ctx,
    archive: &Path,
    categories: Vec<String>,
    no_safety_backup: bool,
) -> Result<()> {
    let vault = ctx.open().await?;
    let report = reconcile_with_vault(&vault, archive).await?;
    print_reconciliation(archive, &report);
    if !categories.is_empty() && report.key_match.is_some_and(ArchiveKey::blocks_category_restore) {
        bail!("this backup's records would not open with the current password; restore it in full instead");
    }
    if !report.is_complete()
        && !ctx.confirm("The archive does not match its manifest. Restore anyway?", false)?
    {
        println!("Aborted.");
        return Ok(());
    }

    let (selection, safety_backup) = if categories.is_empty() {
        if !ctx.confirm(
            &format!(
                "Delete ALL records and documents in {} and replace them with this backup?",
                ctx.root.display()
            ),
            false,
        )? {
            println!("Aborted. Nothing was changed.");
            return Ok(());
        }
        let safety = if !no_safety_backup && ctx.confirm("Take a safety backup first?", true)? {
            let dir = expand_tilde(&ctx.config.backup.safety_backup_dir)
                .join(format!("safety-{}", Utc::now().format("%Y%m%dT%H%M%SZ")));
            Some(dir)
        } else {
            None
        };
        (RestoreSelection::Full { acknowledged: true }, safety)
    } else {
        if !ctx.confirm(
            &format!("Replace {} with the backup's copy?", categories.join(", ")),
            false,
        )? {
            println!("Aborted. Nothing was changed.");
            return Ok(());
        }
        (RestoreSelection::Categories(categories), None)
    };

    let pb = make_progress_bar("restore");
    let progress = progress_callback(&pb);
    let cancel = cancel_on_ctrl_c();
    let result = restore_backup(
        &vault,
        archive,
        selection,
        RestoreOptions {
            safety_backup,
            progress: Some(&progress),
            cancel: Some(&cancel),
        },
    )
    .await;
    pb.finish_and_clear();
    let outcome = result?;

    if let Some(dir) = &outcome.safety_backup {
        println!("Safety backup: {}", dir.display());
    }
    println!("Restored {} file(s)", outcome.restored_count);
    for failure in &outcome.errors {
        println!("  FAILED {}: {}", failure.path, failure.message);
    }
    if outcome.requires_restart {
        println!("Restart lockbox (and any app using this vault) before using the vault again.");
    }
    if !outcome.errors.is_empty() {
        bail!("{} file(s) could not be restored", outcome.errors.len());
    }
    Ok(())
}

async fn cmd_import_legacy(ctx: &Ctx, file: &Path) -> Result<()> {
    let (vault, session) = ctx.unlock().await?;
    let report = import_legacy_backup(file, vault.records(), &session).await?;
    println!(
        "Imported {} record(s) into {} categor{}: {}",
        report.records,
        report.keys.len(),
        if report.keys.len() == 1 { "y" } else { "ies" },
        report.keys.join(", ")
    );
    if report.had_password_hash {
        println!("  the export carried a master password hash; it was not imported");
    }
    for failure in &report.failures {
        println!("  FAILED {}: {}", failure.category, failure.message);
    }
    Ok(())
}

// ── Integrity ─────────────────────────────────────────────────────────────────

async fn integrity_report(vault: &Vault, session: &VaultSession) -> Result<IntegrityReport> {
    Ok(run_integrity_check(vault.records(), vault.documents(), session).await?)
}

async fn cmd_check(ctx: &Ctx, json: bool) -> Result<()> {
    let (vault, session) = ctx.unlock().await?;
    let report = integrity_report(&vault, &session).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Records:         {}", report.total_data_records);
    println!("Data files:      {}", report.data_files.len());
    println!("Matched:         {}", report.matched.len());
    println!("Missing files:   {}", report.missing_files.len());
    for missing in &report.missing_files {
        println!(
            "  {}/{} -> {} ({})",
            missing.category, missing.record_id, missing.file.path, missing.filename
        );
    }
    println!("Orphaned files:  {}", report.orphaned_files.len());
    for orphan in &report.orphaned_files {
        println!("  {} ({})", orphan.file.path, fmt_bytes(orphan.file.size));
    }
    if report.unreadable_records > 0 {
        println!("Unreadable records: {}", report.unreadable_records);
    }
    for category in &report.unreadable_categories {
        println!("Unreadable category: {category}");
    }
    if report.is_clean() {
        println!("No problems found.");
    } else {
        println!("Repair with `lockbox detach` and `lockbox orphan view|delete`. Nothing is changed automatically.");
    }
    Ok(())
}

async fn cmd_orphan_view(ctx: &Ctx, path: &str, out: Option<&Path>) -> Result<()> {
    let (vault, session) = ctx.unlock().await?;
    let report = integrity_report(&vault, &session).await?;
    let orphan = report
        .orphaned_files
        .iter()
        .find(|o| o.file.path == path)
        .ok_or_else(|| anyhow!("{path} is not an orphaned document"))?;

    let view = match view_orphan(vault.documents(), &session, orphan).await? {
        OrphanView::NeedsAlternatePassword => {
            eprintln!("The current password cannot open {path}; it may predate a password change.");
            let old = read_password("LOCKBOX_OLD_PASSWORD", "Previous password: ")?;
            if old.expose_secret().is_empty() {
                bail!("no password given");
            }
            view_orphan_with_password(vault.documents(), vault.keyfile(), &old, orphan).await?
        }
        view => view,
    };

    match view {
        OrphanView::Readable(bytes) => write_output(out, &bytes).await,
        _ => {
            println!("{path} could not be decrypted. It can still be removed with `lockbox orphan delete`.");
            Ok(())
        }
    }
}

async fn cmd_orphan_delete(ctx: &Ctx, path: &str) -> Result<()> {
    let (vault, session) = ctx.unlock().await?;
    let report = integrity_report(&vault, &session).await?;
    let orphan = report
        .orphaned_files
        .iter()
        .find(|o| o.file.path == path)
        .ok_or_else(|| anyhow!("{path} is not an orphaned document"))?;

    if !ctx.confirm(&format!("Permanently delete {path}?"), false)? {
        println!("Aborted.");
        return Ok(());
    }
    delete_orphan(vault.documents(), orphan).await?;
    println!("Deleted {path}");
    Ok(())
}

async fn cmd_detach(ctx: &Ctx, category: &str, id: &str, path: &str) -> Result<()> {
    let (vault, session) = ctx.unlock().await?;
    let report = integrity_report(&vault, &session).await?;
    let Some(missing) = report
        .missing_files
        .iter()
        .find(|m| m.category == category && m.record_id == id && m.file.path == path)
    else {
        println!("No missing reference {path} on {category}/{id} (nothing to do)");
        return Ok(());
    };

    if !ctx.confirm(
        &format!("Remove the reference to {path} from {category}/{id}?"),
        false,
    )? {
        println!("Aborted.");
        return Ok(());
    }
    let removed = detach_missing_reference(vault.records(), &session, missing).await?;
    println!("Removed {removed} reference(s) from {category}/{id}");
    Ok(())
}

// ── Unreadable records ────────────────────────────────────────────────────────

async fn cmd_purge(ctx: &Ctx, category: &str) -> Result<()> {
    let vault = ctx.open().await?;
    let secret = read_password("LOCKBOX_PASSWORD", "Vault password: ")?;
    let session = vault.unlock(&secret).map_err(|e| match e {
        VaultError::Decryption(_) => anyhow!("wrong password"),
        other => other.into(),
    })?;

    let scan = vault.records().scan(&session, category).await?;
    if scan.unreadable.is_empty() {
        println!("Every record in {category} can be decrypted. Nothing to purge.");
        return Ok(());
    }

    // Entries an earlier password still opens are kept
    let mut keys = vault.candidate_keys(&secret)?;
    let earlier = read_password("LOCKBOX_OLD_PASSWORD", "Earlier password (blank to skip): ")?;
    if !earlier.expose_secret().is_empty() {
        keys.extend(vault.candidate_keys(&earlier)?);
    }

    println!("{} unreadable record(s) in {category}:", scan.unreadable.len());
    for name in &scan.unreadable {
        println!("  {name}");
    }
    if !ctx.confirm(
        "Permanently delete those that no known password opens? This cannot be undone.",
        false,
    )? {
        println!("Aborted. Nothing was changed.");
        return Ok(());
    }

    let purged = vault.records().purge_unreadable(&session, category, &keys).await?;
    println!("Purged {} record(s) from {category}", purged.len());
    let kept = scan.unreadable.len().saturating_sub(purged.len());
    if kept > 0 {
        println!("{kept} record(s) open with an earlier password; run `lockbox recover` for them.");
    }
    Ok(())
}

// ── Password change ───────────────────────────────────────────────────────────

async fn cmd_passwd(ctx: &Ctx) -> Result<()> {
    let (mut vault, session) = ctx.unlock().await?;
    let new_secret = read_new_password("LOCKBOX_NEW_PASSWORD")?;
    let (_next, change) = vault
        .change_password(&session, &new_secret, &ctx.kdf_params())
        .await?;

    println!("Password changed.");
    println!("  records re-encrypted:   {}", change.records.resealed);
    println!("  documents re-encrypted: {}", change.documents.resealed);
    let skipped: Vec<&String> = change
        .records
        .skipped
        .iter()
        .chain(&change.documents.skipped)
        .collect();
    if !skipped.is_empty() {
        println!("  left under an older key ({}):", skipped.len());
        for item in skipped {
            println!("    {item}");
        }
    }
    Ok(())
}

async fn cmd_recover(ctx: &Ctx) -> Result<()> {
    let (mut vault, session) = ctx.unlock().await?;
    if vault.has_pending_change() {
        println!("An earlier password change did not finish.");
    }
    let earlier = read_password("LOCKBOX_OLD_PASSWORD", "Earlier password: ")?;
    let change = vault.recover_with_password(&session, &earlier).await?;

    println!("  records re-encrypted:   {}", change.records.resealed);
    println!("  documents re-encrypted: {}", change.documents.resealed);
    let skipped = change.records.skipped.len() + change.documents.skipped.len();
    if skipped > 0 {
        println!("  still unreadable:       {skipped} (see `lockbox check` and `lockbox purge`)");
    }
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_restore_categories_parse() {
        let cli = Cli::try_parse_from([
            "lockbox",
            "--yes",
            "backup",
            "restore",
            "/tmp/archive",
            "--category",
            "contacts",
            "--category",
            "pets",
        ])
        .unwrap();
        assert!(cli.yes);
        match cli.command {
            Commands::Backup {
                action: BackupAction::Restore { categories, .. },
            } => assert_eq!(categories, vec!["contacts", "pets"]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_purge_and_recover_parse() {
        let cli = Cli::try_parse_from(["lockbox", "purge", "finance_items"]).unwrap();
        assert!(!cli.yes);
        match cli.command {
            Commands::Purge { category } => assert_eq!(category, "finance_items"),
            other => panic!("unexpected command: {other:?}"),
        }
        let cli = Cli::try_parse_from(["lockbox", "recover"]).unwrap();
        assert!(matches!(cli.command, Commands::Recover));
    }

    #[test]
    fn test_expand_tilde() {
        let home = std::env::var("HOME").unwrap_or_default();
        assert_eq!(
            expand_tilde(Path::new("~/.local/share/lockbox")),
            PathBuf::from(home).join(".local/share/lockbox")
        );
        assert_eq!(expand_tilde(Path::new("/srv/vault")), PathBuf::from("/srv/vault"));
    }

    #[test]
    fn test_reference_for_path() {
        let reference = reference_for("pets/abc.enc");
        assert_eq!(reference.filename, "abc.enc");
        assert_eq!(reference.path, "pets/abc.enc");
    }

    #[test]
    fn test_fmt_bytes() {
        assert_eq!(fmt_bytes(512), "512 B");
        assert_eq!(fmt_bytes(2048), "2.0 KB");
    }
}
