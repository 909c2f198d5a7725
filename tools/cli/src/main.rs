//! UniDrive CLI - mount cloud drives and operate on them by path.
//!
//! Mounts and their saved state live in a SQLite database; every file
//! command goes through the same dispatcher a service front end would use.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use unidrive_common::DrivePath;
use unidrive_mount::{
    Action, Dispatcher, FileRequest, MountManager, MountResolver, MountStore, Reply,
    ServiceConfig, SqliteStore,
};
use unidrive_storage::{create_default_registry, FileLink, Listing, UploadPayload};

#[derive(Parser)]
#[command(name = "unidrive")]
#[command(about = "UniDrive - one path space over many cloud drives")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Service config file (JSON).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Mount database (default: <data dir>/unidrive/mounts.db).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage mounts.
    Mount {
        #[command(subcommand)]
        command: MountCommands,
    },

    /// List a directory.
    Ls {
        /// Directory path (default: root).
        #[arg(default_value = "/")]
        path: String,
    },

    /// Print download links for a file.
    Link { path: String },

    /// Copy within one mount.
    Cp { source: String, target: String },

    /// Move or rename within one mount.
    Mv { source: String, target: String },

    /// Create a folder.
    Mkdir {
        path: String,

        /// Vendor options as JSON.
        #[arg(long)]
        options: Option<String>,
    },

    /// Remove a file or folder.
    Rm { path: String },

    /// Upload a local file into a directory.
    Upload {
        /// Local file to upload.
        file: PathBuf,

        /// Destination directory.
        dir: String,
    },

    /// Print shell completions.
    Completions { shell: Shell },
}

#[derive(Subcommand)]
enum MountCommands {
    /// Mount a drive at a path.
    Add {
        path: String,

        /// Drive type: memory, local, gdrive or baidu.
        #[arg(short = 't', long = "type")]
        drive_type: String,

        /// Drive config as JSON.
        #[arg(long, default_value = "{}")]
        conf: String,
    },

    /// List mounts.
    List,

    /// Unmount a path.
    Remove { path: String },

    /// Enable a mount.
    Enable { path: String },

    /// Disable a mount without removing it.
    Disable { path: String },

    /// Re-run drive initialization.
    Reinit { path: String },
}

struct App {
    manager: MountManager,
    dispatcher: Dispatcher,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "unidrive", &mut std::io::stdout());
        return Ok(());
    }

    let app = open_app(cli.config.as_deref(), cli.db).await?;

    match cli.command {
        Commands::Mount { command } => cmd_mount(&app, command).await,

        Commands::Ls { path } => {
            let reply = run(&app, FileRequest::new(Action::List, &path)).await?;
            print_listing(&path, reply)
        }

        Commands::Link { path } => {
            let reply = run(&app, FileRequest::new(Action::Link, &path)).await?;
            print_links(reply)
        }

        Commands::Cp { source, target } => {
            let reply = run(&app, FileRequest::new(Action::Copy, &source).with_target(&target)).await?;
            println!("{}: {} -> {}", reply.text, source, target);
            Ok(())
        }

        Commands::Mv { source, target } => {
            let reply = run(&app, FileRequest::new(Action::Move, &source).with_target(&target)).await?;
            println!("{}: {} -> {}", reply.text, source, target);
            Ok(())
        }

        Commands::Mkdir { path, options } => {
            let mut request = FileRequest::new(Action::Create, &path);
            if let Some(raw) = options {
                let options = serde_json::from_str(&raw).context("Invalid --options JSON")?;
                request = request.with_config(options);
            }
            run(&app, request).await?;
            println!("Directory created: {}", path);
            Ok(())
        }

        Commands::Rm { path } => {
            run(&app, FileRequest::new(Action::Remove, &path)).await?;
            println!("Removed: {}", path);
            Ok(())
        }

        Commands::Upload { file, dir } => cmd_upload(&app, &file, &dir).await,

        Commands::Completions { .. } => Ok(()),
    }
}

/// Wire the mount store, resolver and dispatcher together.
async fn open_app(config_path: Option<&Path>, db: Option<PathBuf>) -> Result<App> {
    let config = match config_path {
        Some(path) => ServiceConfig::load(path)
            .await
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ServiceConfig::default(),
    };

    let db_path = match db {
        Some(path) => path,
        None => dirs::data_dir()
            .context("No data directory on this platform; pass --db")?
            .join("unidrive")
            .join("mounts.db"),
    };
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create data directory")?;
    }
    debug!("Using mount database {}", db_path.display());

    let store = SqliteStore::open(&db_path).context("Failed to open mount database")?;
    let mounts = MountStore::new(Arc::new(store));
    let resolver = Arc::new(
        MountResolver::new(Arc::new(create_default_registry()), mounts, &config)
            .context("Failed to build resolver")?,
    );

    Ok(App {
        manager: MountManager::new(resolver.clone()),
        dispatcher: Dispatcher::new(resolver, &config),
    })
}

/// Dispatch a request, turning a failed reply into an error.
async fn run(app: &App, request: FileRequest) -> Result<Reply> {
    let reply = app.dispatcher.dispatch(request).await;
    if !reply.flag {
        anyhow::bail!("{}", reply.text);
    }
    Ok(reply)
}

fn parse_path(raw: &str) -> Result<DrivePath> {
    DrivePath::parse(raw).with_context(|| format!("Invalid path '{}'", raw))
}

async fn cmd_mount(app: &App, command: MountCommands) -> Result<()> {
    match command {
        MountCommands::Add {
            path,
            drive_type,
            conf,
        } => {
            let config = serde_json::from_str(&conf).context("Invalid --conf JSON")?;
            let entry = app
                .manager
                .create(&parse_path(&path)?, &drive_type, config)
                .await
                .context("Failed to mount drive")?;
            println!("Mounted {} drive at {}", entry.adapter_type, entry.path);
        }

        MountCommands::List => {
            let mounts = app.manager.list().await.context("Failed to read mounts")?;
            if mounts.is_empty() {
                println!("No mounts.");
            }
            for mount in mounts {
                let status = if mount.enabled { "enabled" } else { "disabled" };
                println!("  {:<24} {:<8} {}", mount.path, mount.adapter_type, status);
                if let Some(log) = mount.last_log {
                    println!("    {}", log);
                }
            }
        }

        MountCommands::Remove { path } => {
            app.manager
                .remove(&parse_path(&path)?)
                .await
                .context("Failed to remove mount")?;
            println!("Unmounted {}", path);
        }

        MountCommands::Enable { path } => {
            app.manager.set_enabled(&parse_path(&path)?, true).await?;
            println!("Enabled {}", path);
        }

        MountCommands::Disable { path } => {
            app.manager.set_enabled(&parse_path(&path)?, false).await?;
            println!("Disabled {}", path);
        }

        MountCommands::Reinit { path } => {
            app.manager
                .reinit(&parse_path(&path)?)
                .await
                .context("Reinitialization failed")?;
            println!("Reinitialized {}", path);
        }
    }
    Ok(())
}

async fn cmd_upload(app: &App, file: &Path, dir: &str) -> Result<()> {
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .context("Source file has no usable name")?
        .to_string();
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let size = data.len();
    info!("Uploading {} ({} bytes) to {}", name, size, dir);

    let request = FileRequest::new(Action::Upload, dir).with_upload(UploadPayload::new(name.clone(), data));
    run(app, request).await?;
    println!("Uploaded {} ({} bytes) into {}", name, size, dir);
    Ok(())
}

fn print_listing(dir: &str, reply: Reply) -> Result<()> {
    let listing: Listing = serde_json::from_value(reply.data.unwrap_or_default())
        .context("Malformed listing")?;
    if listing.entries.is_empty() {
        println!("Directory is empty.");
        return Ok(());
    }
    println!("Contents of {} ({} entries):", dir, listing.total);
    for entry in listing.entries {
        if entry.is_folder() {
            println!("  [DIR]  {}/", entry.name);
        } else {
            let modified = entry
                .modified_at
                .map(|t| t.format(" %Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            println!("  [FILE] {} ({} bytes){}", entry.name, entry.size, modified);
        }
    }
    Ok(())
}

fn print_links(reply: Reply) -> Result<()> {
    let links: Vec<FileLink> =
        serde_json::from_value(reply.data.unwrap_or_default()).context("Malformed link list")?;
    for link in links {
        println!("{}", link.url);
        for (name, value) in &link.headers {
            println!("  {}: {}", name, value);
        }
        if let Some(expires) = link.expires_at {
            println!("  expires {}", expires.to_rfc3339());
        }
    }
    Ok(())
}
