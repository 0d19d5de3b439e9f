//! CLI harness for exercising at-rest encryption end to end
//!
//! This tool allows testing:
//! - Encrypting an existing plaintext store
//! - Viewing the recovery phrase
//! - Unlocking a store whose key was lost
//! - Discarding a locked store

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use taskfree_storage_sqlite::{
    format_mnemonic, Category, EncryptionService, Repository, StorageConfig, Task,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "vault-harness")]
#[command(about = "TaskFree encrypted storage harness", long_about = None)]
struct Cli {
    /// Data directory (defaults to TASKFREE_DATA_DIR or the platform data dir)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON storage config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show encryption and store status
    Status,

    /// Insert demo rows into the store
    Seed {
        /// Number of categories
        #[arg(long, default_value = "3")]
        categories: u32,

        /// Tasks per category
        #[arg(long, default_value = "5")]
        tasks: u32,
    },

    /// Encrypt the store with the stored (or a new) recovery phrase
    Encrypt,

    /// Print the recovery phrase
    ShowPhrase {
        /// Words per row
        #[arg(long, default_value = "2")]
        per_row: usize,
    },

    /// Unlock a locked store by re-entering the phrase
    Recover {
        /// The eight words, space separated
        #[arg(short, long)]
        words: String,
    },

    /// Discard a locked store and start fresh without encryption
    Reset {
        /// Confirm the wipe
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config, cli.data_dir)?;
    info!("Data directory: {}", config.data_dir.display());
    let service = EncryptionService::open(config).context("Failed to open encrypted storage")?;

    match cli.command {
        Commands::Status => run_status(&service)?,
        Commands::Seed { categories, tasks } => run_seed(&service, categories, tasks)?,
        Commands::Encrypt => run_encrypt(&service).await?,
        Commands::ShowPhrase { per_row } => run_show_phrase(&service, per_row)?,
        Commands::Recover { words } => run_recover(&service, words).await?,
        Commands::Reset { yes } => run_reset(&service, yes)?,
    }

    service.close()?;
    Ok(())
}

fn load_config(path: Option<PathBuf>, data_dir: Option<PathBuf>) -> anyhow::Result<StorageConfig> {
    let mut config = match path {
        Some(path) => StorageConfig::load(&path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => StorageConfig::from_env(),
    };
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    Ok(config)
}

fn run_status(service: &EncryptionService) -> anyhow::Result<()> {
    let encrypted = service.is_encrypted()?;
    let locked = service.needs_key_recovery()?;

    info!("Encrypted: {}", encrypted);
    info!("Key available: {}", service.has_key()?);
    info!("Needs recovery: {}", locked);

    if locked {
        warn!("Store is locked; run `recover --words ...` or `reset --yes`");
        return Ok(());
    }

    let breakdown = service.with_database(|db| {
        let repo = Repository::new(db);
        let mut rows = Vec::new();
        for category in repo.all_categories()? {
            let tasks = repo.tasks_in_category(category.id)?;
            rows.push((category.title, tasks.len()));
        }
        Ok(rows)
    })?;

    let total: usize = breakdown.iter().map(|(_, tasks)| tasks).sum();
    info!("Categories: {} | Tasks: {}", breakdown.len(), total);
    for (title, tasks) in &breakdown {
        info!("  {}: {} tasks", title, tasks);
    }
    Ok(())
}

fn run_seed(service: &EncryptionService, categories: u32, tasks: u32) -> anyhow::Result<()> {
    service.with_database(|db| {
        let tx = db.transaction()?;
        {
            let repo = Repository::from_conn(&tx);
            for c in 0..categories {
                let category_id = repo.insert_category(&Category {
                    id: 0,
                    title: format!("Category {}", c + 1),
                    color: 0xFF3F_51B5,
                    category_page_order: i64::from(c),
                })?;
                for t in 0..tasks {
                    repo.insert_task(&Task::new(
                        category_id,
                        format!("Task {}.{}", c + 1, t + 1),
                        i64::from(t),
                    ))?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    })?;

    info!("Inserted {} categories with {} tasks each", categories, tasks);
    Ok(())
}

async fn run_encrypt(service: &EncryptionService) -> anyhow::Result<()> {
    if service.is_encrypted()? {
        bail!("Store is already encrypted");
    }

    let phrase = service.get_or_create_phrase()?;
    println!("Recovery phrase (write it down):\n{}", format_mnemonic(phrase.words(), 2));

    // Progress bar
    let mut progress = service.progress();
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {percent}% {msg}")?
            .progress_chars("=>-"),
    );

    // Spawn progress updater
    let pb_clone = pb.clone();
    let progress_task = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let value = *progress.borrow_and_update();
            if let Some(percent) = value {
                pb_clone.set_position(u64::from(percent));
            }
        }
    });

    let result = service.begin_encryption(phrase).await;
    progress_task.abort();

    match result {
        Ok(()) => {
            pb.finish_with_message("Encrypted");
            info!("Encryption completed successfully");
            Ok(())
        }
        Err(e) => {
            pb.abandon_with_message("Failed");
            let message = service.error().borrow().clone();
            warn!("{}", message.unwrap_or_else(|| e.to_string()));
            Err(e.into())
        }
    }
}

fn run_show_phrase(service: &EncryptionService, per_row: usize) -> anyhow::Result<()> {
    match service.view_phrase()? {
        Some(phrase) => println!("{}", format_mnemonic(phrase.words(), per_row)),
        None => warn!("No recovery phrase stored"),
    }
    Ok(())
}

async fn run_recover(service: &EncryptionService, words: String) -> anyhow::Result<()> {
    if !service.needs_key_recovery()? {
        info!("Store is not locked; nothing to recover");
        return Ok(());
    }

    service.restore()?;
    let words: Vec<String> = words.split_whitespace().map(str::to_string).collect();
    if service.submit_recovery_phrase(words).await? {
        info!("Store unlocked");
        Ok(())
    } else {
        service.cancel_entry()?;
        bail!("Recovery phrase is incorrect")
    }
}

fn run_reset(service: &EncryptionService, yes: bool) -> anyhow::Result<()> {
    if !service.needs_key_recovery()? {
        info!("Store is not locked; refusing to wipe");
        return Ok(());
    }
    if !yes {
        bail!("This deletes all tasks permanently; pass --yes to confirm");
    }

    service.skip_recovery()?;
    warn!("Store wiped; starting fresh without encryption");
    Ok(())
}
