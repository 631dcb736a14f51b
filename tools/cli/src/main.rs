//! Lockbox CLI - Command line interface for vault operations.
//!
//! This tool creates and unlocks credential vaults, edits their records
//! and manages the users and backups of a vault.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;
use zeroize::Zeroizing;

use lockbox_storage::FormatVersion;
use lockbox_vault::{Factor, SecretRecord, SlotRole, VaultManager, VaultSession, VaultSettings};

#[derive(Parser)]
#[command(name = "lockbox")]
#[command(about = "Lockbox - Encrypted credential vault")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file (default: the user config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Vault file and the user unlocking it.
#[derive(Args)]
struct VaultArgs {
    /// Path to the vault file.
    #[arg(short, long)]
    path: PathBuf,

    /// Username of the unlocking slot (ignored for version 1 vaults).
    #[arg(short, long, default_value = "admin")]
    user: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new vault with one administrator.
    Create {
        #[command(flatten)]
        vault: VaultArgs,
    },

    /// Show vault information.
    Info {
        #[command(flatten)]
        vault: VaultArgs,
    },

    /// List records, optionally filtered by title.
    List {
        #[command(flatten)]
        vault: VaultArgs,

        /// Case-insensitive title filter.
        #[arg(short, long)]
        query: Option<String>,
    },

    /// Add a record. The secret is prompted for.
    Add {
        #[command(flatten)]
        vault: VaultArgs,

        /// Record title.
        #[arg(short, long)]
        title: String,

        /// Account name.
        #[arg(long)]
        login: Option<String>,

        /// Associated URL.
        #[arg(long)]
        url: Option<String>,

        /// Free-form notes.
        #[arg(long)]
        notes: Option<String>,
    },

    /// Print one record including its secret.
    Show {
        #[command(flatten)]
        vault: VaultArgs,

        /// Record id.
        id: Uuid,
    },

    /// Delete a record.
    Remove {
        #[command(flatten)]
        vault: VaultArgs,

        /// Record id.
        id: Uuid,
    },

    /// Change the password of the unlocking user.
    Passwd {
        #[command(flatten)]
        vault: VaultArgs,
    },

    /// Enroll another user.
    AddUser {
        #[command(flatten)]
        vault: VaultArgs,

        /// Username to enroll.
        #[arg(long)]
        name: String,

        /// Grant administrator rights.
        #[arg(long)]
        admin: bool,
    },

    /// Revoke a key slot.
    RemoveUser {
        #[command(flatten)]
        vault: VaultArgs,

        /// Slot id (see `info`).
        #[arg(long)]
        slot: String,

        /// Also rotate the data key; prompts for every remaining slot.
        #[arg(long)]
        rotate: bool,
    },

    /// Convert a version 1 vault to version 2.
    Upgrade {
        #[command(flatten)]
        vault: VaultArgs,
    },

    /// Manage backups of a vault file.
    Backups {
        #[command(subcommand)]
        action: BackupCommand,
    },
}

#[derive(Subcommand)]
enum BackupCommand {
    /// List backups, newest first.
    List {
        /// Path to the vault file.
        #[arg(short, long)]
        path: PathBuf,
    },

    /// Restore the newest backup, or a specific one.
    Restore {
        /// Path to the vault file.
        #[arg(short, long)]
        path: PathBuf,

        /// Backup file to restore.
        #[arg(long)]
        from: Option<PathBuf>,
    },

    /// Delete all but the newest backups.
    Prune {
        /// Path to the vault file.
        #[arg(short, long)]
        path: PathBuf,

        /// Backups to keep (default: the configured maximum).
        #[arg(short, long)]
        keep: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_filter = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = load_settings(cli.config.as_deref())?;
    let manager = VaultManager::new(settings).context("Invalid settings")?;

    match cli.command {
        Commands::Create { vault } => cmd_create(&manager, &vault).await,
        Commands::Info { vault } => cmd_info(&manager, &vault).await,
        Commands::List { vault, query } => cmd_list(&manager, &vault, query.as_deref()).await,
        Commands::Add {
            vault,
            title,
            login,
            url,
            notes,
        } => {
            let mut record = SecretRecord::new(title);
            if let Some(login) = login {
                record = record.with_username(login);
            }
            if let Some(url) = url {
                record = record.with_url(url);
            }
            if let Some(notes) = notes {
                record = record.with_notes(notes);
            }
            cmd_add(&manager, &vault, record).await
        }
        Commands::Show { vault, id } => cmd_show(&manager, &vault, id).await,
        Commands::Remove { vault, id } => cmd_remove(&manager, &vault, id).await,
        Commands::Passwd { vault } => cmd_passwd(&manager, &vault).await,
        Commands::AddUser { vault, name, admin } => {
            let role = if admin {
                SlotRole::Administrator
            } else {
                SlotRole::Standard
            };
            cmd_add_user(&manager, &vault, &name, role).await
        }
        Commands::RemoveUser {
            vault,
            slot,
            rotate,
        } => cmd_remove_user(&manager, &vault, &slot, rotate).await,
        Commands::Upgrade { vault } => cmd_upgrade(&manager, &vault).await,
        Commands::Backups { action } => cmd_backups(&manager, action).await,
    }
}

fn load_settings(explicit: Option<&Path>) -> Result<VaultSettings> {
    match explicit {
        Some(path) => VaultSettings::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display())),
        None => match VaultSettings::default_path() {
            Some(path) => VaultSettings::load_or_default(&path)
                .with_context(|| format!("Failed to load settings from {}", path.display())),
            None => Ok(VaultSettings::default()),
        },
    }
}

/// Prompt for a secret without echo.
fn prompt_secret(prompt: &str) -> Result<Zeroizing<String>> {
    let secret = rpassword::prompt_password(prompt).context("Failed to read password")?;
    Ok(Zeroizing::new(secret))
}

/// Prompt twice for a new password.
fn prompt_new_password(prompt: &str) -> Result<Factor> {
    let password = prompt_secret(prompt)?;
    let confirm = prompt_secret("Confirm password: ")?;

    if *password != *confirm {
        anyhow::bail!("Passwords do not match");
    }
    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }
    Ok(Factor::password(password.as_bytes()))
}

async fn unlock(manager: &VaultManager, vault: &VaultArgs) -> Result<VaultSession> {
    let password = prompt_secret(&format!("Password for {}: ", vault.user))?;
    manager
        .open_vault(&vault.path, &vault.user, &Factor::password(password.as_bytes()))
        .await
        .context("Failed to open vault")
}

async fn cmd_create(manager: &VaultManager, vault: &VaultArgs) -> Result<()> {
    info!(path = %vault.path.display(), "Creating new vault");

    let factor = prompt_new_password(&format!("New password for {}: ", vault.user))?;
    let session = manager
        .create_vault(&vault.path, &vault.user, &factor)
        .await
        .context("Failed to create vault")?;

    println!("Vault created successfully!");
    println!("  Location: {}", session.path().display());
    println!("  Administrator: {}", vault.user);
    Ok(())
}

async fn cmd_info(manager: &VaultManager, vault: &VaultArgs) -> Result<()> {
    let session = unlock(manager, vault).await?;

    println!("Vault Information:");
    println!("  Location: {}", session.path().display());
    println!("  Version: {}", session.version().number());
    println!("  Cipher: {:?}", session.payload_cipher());
    println!("  Records: {}", session.records()?.len());
    match session.fec_redundancy() {
        Some(0) | None => println!("  Error correction: off"),
        Some(redundancy) => println!("  Error correction: {}%", redundancy),
    }

    if let Some(policy) = session.security_policy() {
        println!("  Policy:");
        println!("    Minimum password length: {}", policy.min_password_length);
        println!("    Hardware key required: {}", policy.require_hardware);
    }
    if let Some(role) = session.current_role() {
        println!("  Unlocked as: {} ({})", vault.user, role);
    }

    if !session.slots().is_empty() {
        println!("  Key slots:");
        for slot in session.slots() {
            let hardware = slot
                .hardware()
                .map(|h| format!(", hardware key {}", h.device_serial))
                .unwrap_or_default();
            println!(
                "    {}  {} ({}{})",
                slot.id,
                slot.role(),
                slot.kdf.label(),
                hardware
            );
        }
    }
    Ok(())
}

async fn cmd_list(manager: &VaultManager, vault: &VaultArgs, query: Option<&str>) -> Result<()> {
    let session = unlock(manager, vault).await?;
    let records = session.records()?;

    let matches: Vec<&SecretRecord> = match query {
        Some(query) => records.search(query).collect(),
        None => records.iter().collect(),
    };

    if matches.is_empty() {
        println!("No records.");
    } else {
        for record in matches {
            println!("  {}  {}  {}", record.id(), record.title, record.username);
        }
    }
    Ok(())
}

async fn cmd_add(manager: &VaultManager, vault: &VaultArgs, record: SecretRecord) -> Result<()> {
    let mut session = unlock(manager, vault).await?;
    let secret = prompt_secret("Secret to store: ")?;

    let id = session
        .add_record(record.with_password(secret.as_str()))
        .context("Failed to add record")?;
    manager.save(&mut session).await.context("Failed to save vault")?;

    println!("Record added: {}", id);
    Ok(())
}

async fn cmd_show(manager: &VaultManager, vault: &VaultArgs, id: Uuid) -> Result<()> {
    let session = unlock(manager, vault).await?;
    let record = session
        .records()?
        .get(id)
        .with_context(|| format!("No record with id {}", id))?;

    println!("Title: {}", record.title);
    println!("Username: {}", record.username);
    println!("Password: {}", record.password);
    println!("URL: {}", record.url);
    println!("Notes: {}", record.notes);
    println!("Modified: {}", record.modified_at());
    Ok(())
}

async fn cmd_remove(manager: &VaultManager, vault: &VaultArgs, id: Uuid) -> Result<()> {
    let mut session = unlock(manager, vault).await?;
    session.delete_record(id).context("Failed to remove record")?;
    manager.save(&mut session).await.context("Failed to save vault")?;

    println!("Record removed: {}", id);
    Ok(())
}

async fn cmd_passwd(manager: &VaultManager, vault: &VaultArgs) -> Result<()> {
    let current = prompt_secret(&format!("Current password for {}: ", vault.user))?;
    let old = Factor::password(current.as_bytes());
    let mut session = manager
        .open_vault(&vault.path, &vault.user, &old)
        .await
        .context("Failed to open vault")?;

    if session.version() == FormatVersion::V1 {
        anyhow::bail!("Version 1 vaults must be upgraded before changing the password");
    }
    let slot = session
        .unlocked_slot()
        .cloned()
        .context("Session has no unlocked slot")?;

    let new = prompt_new_password("New password: ")?;
    manager
        .change_password(&mut session, &slot, &old, &new)
        .await
        .context("Failed to change password")?;
    manager.save(&mut session).await.context("Failed to save vault")?;

    println!("Password changed successfully!");
    Ok(())
}

async fn cmd_add_user(
    manager: &VaultManager,
    vault: &VaultArgs,
    name: &str,
    role: SlotRole,
) -> Result<()> {
    let mut session = unlock(manager, vault).await?;
    let factor = prompt_new_password(&format!("New password for {}: ", name))?;

    let slot = manager
        .add_factor(&mut session, name, &factor, role)
        .await
        .context("Failed to add user")?;
    manager.save(&mut session).await.context("Failed to save vault")?;

    println!("User {} added as {} (slot {})", name, role, slot);
    Ok(())
}

async fn cmd_remove_user(
    manager: &VaultManager,
    vault: &VaultArgs,
    slot: &str,
    rotate: bool,
) -> Result<()> {
    let mut session = unlock(manager, vault).await?;
    let target = lockbox_common::SlotId::new(slot).context("Invalid slot id")?;

    let factors = if rotate {
        let mut factors = Vec::new();
        for remaining in session.slots().iter().filter(|s| s.id != target) {
            let prompt = format!("Password for slot {} ({}): ", remaining.id, remaining.role());
            let password = prompt_secret(&prompt)?;
            factors.push((remaining.id.clone(), Factor::password(password.as_bytes())));
        }
        Some(factors)
    } else {
        None
    };

    manager
        .remove_factor(&mut session, &target, factors.as_deref())
        .await
        .context("Failed to remove user")?;
    manager.save(&mut session).await.context("Failed to save vault")?;

    println!("Slot {} removed{}", target, if rotate { " and data key rotated" } else { "" });
    Ok(())
}

async fn cmd_upgrade(manager: &VaultManager, vault: &VaultArgs) -> Result<()> {
    let password = prompt_secret("Vault password: ")?;
    let factor = Factor::password(password.as_bytes());
    let mut session = manager
        .open_vault(&vault.path, &vault.user, &factor)
        .await
        .context("Failed to open vault")?;

    manager
        .upgrade_to_v2(&mut session, &vault.user, &factor)
        .await
        .context("Failed to upgrade vault")?;
    manager.save(&mut session).await.context("Failed to save vault")?;

    println!("Vault upgraded to version 2; {} is the administrator.", vault.user);
    Ok(())
}

async fn cmd_backups(manager: &VaultManager, action: BackupCommand) -> Result<()> {
    let files = manager.files();
    match action {
        BackupCommand::List { path } => {
            let backups = files
                .list_backups(&path)
                .await
                .context("Failed to list backups")?;
            if backups.is_empty() {
                println!("No backups.");
            }
            for backup in backups {
                println!(
                    "  {}  {} bytes  {}",
                    backup.created_at.format("%Y-%m-%d %H:%M:%S%.6f UTC"),
                    backup.size,
                    backup.path.display()
                );
            }
        }
        BackupCommand::Restore { path, from } => {
            let restored = files
                .restore_from_backup(&path, from.as_deref())
                .await
                .context("Failed to restore backup")?;
            println!("Restored {} from {}", path.display(), restored.display());
        }
        BackupCommand::Prune { path, keep } => {
            let keep = keep.unwrap_or(manager.settings().backups.max_backups);
            let removed = files
                .cleanup_old_backups(&path, keep)
                .await
                .context("Failed to prune backups")?;
            println!("Removed {} backup(s)", removed);
        }
    }
    Ok(())
}
