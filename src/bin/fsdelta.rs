//! # fsdelta CLI
//!
//! Thin command-line front-end over the fsdelta library.
//!
//! ## Usage
//! ```bash
//! # Record a baseline index of /etc and /srv
//! fsdelta index /var/lib/fsdelta/profile/dirindex /etc /srv -/etc/.git
//!
//! # What changed since?
//! fsdelta whatchanged /var/lib/fsdelta/profile/dirindex /etc /srv
//!
//! # Merge users and groups of a backup into this system's
//! fsdelta merge-users ./extras/etc /etc ./merged
//!
//! # Restore a backup, then undo it
//! fsdelta restore ./extras ./overlay
//! fsdelta rollback
//! ```

use clap::{Parser, Subcommand};
use colored::*;
use fsdelta::{
    apply_overlay, merge_etc, whatchanged, Config, DirIndex, Dpkg, Extras, Limits, PackageManager,
    Restore, Result, Rollback,
};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// fsdelta - incremental system snapshots
#[derive(Parser)]
#[command(name = "fsdelta")]
#[command(version)]
#[command(about = "Detect, replay and roll back changes to a system relative to a baseline")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a directory index of everything the limits include
    Index {
        /// Output file
        output: PathBuf,

        /// Limits (absolute paths, `-` to exclude)
        #[arg(required = true, allow_hyphen_values = true)]
        limits: Vec<String>,
    },

    /// Print the changes since a baseline index
    Whatchanged {
        /// Baseline index
        dirindex: PathBuf,

        /// Limits (absolute paths, `-` to exclude)
        #[arg(required = true, allow_hyphen_values = true)]
        limits: Vec<String>,

        /// Write the change log here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also write the change log and overlay path list into an extras bundle
        #[arg(long)]
        extras: Option<PathBuf>,
    },

    /// Merge passwd and group of a backup into a system's
    MergeUsers {
        /// Directory with the backup's passwd and group
        old_etc: PathBuf,

        /// Directory with this system's passwd and group
        new_etc: PathBuf,

        /// Where to write the merged files
        output: PathBuf,
    },

    /// Move an overlay tree onto a root directory
    ApplyOverlay {
        /// Overlay directory
        overlay: PathBuf,

        /// Root the overlay mirrors
        root: PathBuf,

        /// Limits (defaults to the configured limits)
        #[arg(allow_hyphen_values = true)]
        limits: Vec<String>,
    },

    /// Restore a backup from its extras bundle and overlay
    Restore {
        /// Extras bundle
        extras: PathBuf,

        /// Overlay directory
        overlay: PathBuf,

        /// Do not install packages
        #[arg(long)]
        no_packages: bool,
    },

    /// Undo the last restore
    Rollback {
        /// Do not purge packages
        #[arg(long)]
        no_packages: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    // Set up logging
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".red().bold(), e.user_message());
        std::process::exit(1);
    }
}

/// Main command runner
fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Index { output, limits } => cmd_index(&output, &limits),
        Commands::Whatchanged {
            dirindex,
            limits,
            output,
            extras,
        } => cmd_whatchanged(&dirindex, &limits, output.as_deref(), extras),
        Commands::MergeUsers {
            old_etc,
            new_etc,
            output,
        } => cmd_merge_users(&old_etc, &new_etc, &output),
        Commands::ApplyOverlay {
            overlay,
            root,
            limits,
        } => cmd_apply_overlay(&config, &overlay, &root, limits),
        Commands::Restore {
            extras,
            overlay,
            no_packages,
        } => cmd_restore(&config, extras, overlay, no_packages),
        Commands::Rollback { no_packages } => cmd_rollback(&config, no_packages),
    }
}

fn cmd_index(output: &Path, limits: &[String]) -> Result<()> {
    let start = Instant::now();
    let index = DirIndex::walk(&Limits::from_tokens(limits)?.pathmap()?)?;
    index.save(output)?;

    println!("{} Indexed {} paths", "✓".green().bold(), index.len().to_string().cyan());
    println!("  Output: {}", output.display().to_string().cyan());
    println!("  Time: {:?}", start.elapsed());
    Ok(())
}

fn cmd_whatchanged(dirindex: &Path, limits: &[String], output: Option<&Path>, extras: Option<PathBuf>) -> Result<()> {
    let limits = Limits::from_tokens(limits)?;
    let changes = whatchanged(dirindex, &limits.fs)?;

    match output {
        Some(path) => changes.save(path)?,
        None => changes.write_to(std::io::stdout().lock())?,
    }
    if let Some(extras) = extras {
        Extras::new(extras).save_changes(&changes)?;
    }

    let stats = changes.summary();
    eprintln!(
        "{} {} changes ({} overwritten, {} stat, {} deleted)",
        "✓".green().bold(),
        stats.total().to_string().cyan(),
        stats.overwrites.to_string().green(),
        stats.stats.to_string().yellow(),
        stats.deletions.to_string().red()
    );
    Ok(())
}

fn cmd_merge_users(old_etc: &Path, new_etc: &Path, output: &Path) -> Result<()> {
    let merged = merge_etc(
        &fs::read_to_string(old_etc.join("passwd"))?,
        &fs::read_to_string(old_etc.join("group"))?,
        &fs::read_to_string(new_etc.join("passwd"))?,
        &fs::read_to_string(new_etc.join("group"))?,
    )?;

    fs::create_dir_all(output)?;
    fs::write(output.join("passwd"), merged.passwd.to_string())?;
    fs::write(output.join("group"), merged.group.to_string())?;

    println!(
        "{} Merged {} users and {} groups",
        "✓".green().bold(),
        merged.passwd.len().to_string().cyan(),
        merged.group.len().to_string().cyan()
    );
    for (kind, map) in [("uid", &merged.uidmap), ("gid", &merged.gidmap)] {
        for (old, new) in map.iter() {
            println!("  {} {} -> {}", kind, old.to_string().yellow(), new.to_string().green());
        }
    }
    Ok(())
}

fn cmd_apply_overlay(config: &Config, overlay: &Path, root: &Path, limits: Vec<String>) -> Result<()> {
    let limits = if limits.is_empty() {
        config.parsed_limits()?
    } else {
        Limits::from_tokens(&limits)?
    };
    let pathmap = limits.pathmap()?;

    let mut applied = 0;
    let mut failed = 0;
    for (path, outcome) in apply_overlay(overlay, root, &pathmap) {
        match outcome {
            Ok(()) => applied += 1,
            Err(e) => {
                failed += 1;
                eprintln!("  {} {}: {}", "✗".red(), path.display(), e);
            }
        }
    }

    println!("{} Applied {} files", "✓".green().bold(), applied.to_string().cyan());
    if failed > 0 {
        println!("  Failed: {}", failed.to_string().red());
    }
    Ok(())
}

fn cmd_restore(config: &Config, extras: PathBuf, overlay: PathBuf, no_packages: bool) -> Result<()> {
    let limits = config.parsed_limits()?;
    let restore = Restore::new(config, Extras::new(extras), overlay, &limits)?;

    println!("{}", "Restoring...".blue().bold());
    let packages: Option<&dyn PackageManager> = if no_packages { None } else { Some(&Dpkg) };
    let report = restore.run(None, packages)?;

    println!("{} Restore complete", "✓".green().bold());
    println!("  Packages installed: {}", report.packages_installed.len().to_string().cyan());
    println!("  Files applied: {}", report.files_applied.to_string().cyan());
    println!("  Files deleted: {}", report.files_deleted.to_string().yellow());
    println!("  Fixes applied: {}", report.statfixes_applied.to_string().cyan());
    println!("  Time: {} ms", report.duration_ms);
    if let Some(rollback) = restore.rollback() {
        println!("  Rollback: {}", rollback.path().display().to_string().cyan());
    }
    print_warnings(&report.warnings);
    Ok(())
}

fn cmd_rollback(config: &Config, no_packages: bool) -> Result<()> {
    let rollback = Rollback::open(config)?;
    if let Ok(metadata) = rollback.metadata() {
        println!(
            "{} restore of {}",
            "Rolling back".blue().bold(),
            metadata.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string().yellow()
        );
    }

    let packages: Option<&dyn PackageManager> = if no_packages { None } else { Some(&Dpkg) };
    let report = rollback.rollback(None, packages)?;

    println!("{} Rollback complete", "✓".green().bold());
    println!("  Files restored: {}", report.files_restored.to_string().cyan());
    println!("  Files removed: {}", report.files_removed.to_string().yellow());
    println!("  Packages purged: {}", report.packages_purged.len().to_string().yellow());
    print_warnings(&report.warnings);
    Ok(())
}

fn print_warnings(warnings: &[String]) {
    if warnings.is_empty() {
        return;
    }
    println!("\n{} {} warnings:", "⚠".yellow().bold(), warnings.len());
    for warning in warnings {
        println!("  - {}", warning);
    }
    let _ = std::io::stdout().flush();
}
