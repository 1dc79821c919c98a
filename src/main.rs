use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use growth_album::config::{AppPaths, DEFAULT_THUMBNAIL_SIZE};
use growth_album::media::scanner::FsCaptureProbe;
use growth_album::media::thumbnail::ThumbnailCache;
use growth_album::state::library::Library;
use growth_album::{Controller, ControllerEvent, ControllerOptions, Settings, Snapshot};

/// Growth album: photos and videos sorted by how old your child was
#[derive(Parser)]
#[command(name = "growth-album", version)]
struct Cli {
    /// Directory for the catalog and thumbnail cache (defaults to the
    /// platform data/cache directories)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show or change the birth date and photo folder
    Config {
        /// Birth date, YYYY-MM-DD
        #[arg(long)]
        birth_date: Option<NaiveDate>,
        #[arg(long)]
        folder: Option<PathBuf>,
    },
    /// Rescan the folder, derive thumbnails and list the age groups
    Scan {
        /// Thumbnail edge length in pixels
        #[arg(long, default_value_t = DEFAULT_THUMBNAIL_SIZE)]
        thumbnail_size: u32,
        /// Print the grouped files as JSON
        #[arg(long)]
        json: bool,
    },
    /// List age groups from the catalog without scanning
    Groups {
        #[arg(long)]
        json: bool,
    },
    /// Show everything known about one file
    Show { path: PathBuf },
    /// Read or write the note attached to a file
    Note {
        #[command(subcommand)]
        action: NoteAction,
    },
}

#[derive(Subcommand)]
enum NoteAction {
    Set { path: PathBuf, text: String },
    Get { path: PathBuf },
    Clear { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "growth_album=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let paths = match &cli.data_dir {
        Some(dir) => AppPaths::rooted_at(dir),
        None => AppPaths::platform_default(),
    };
    let library = Arc::new(Library::open(&paths.database())?);

    match cli.command {
        Command::Config { birth_date, folder } => {
            library.save_settings(&Settings {
                reference_date: birth_date,
                folder_path: folder,
            })?;
            let settings = library.settings()?;
            println!(
                "Birth date: {}",
                settings
                    .reference_date
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "(not set)".into())
            );
            println!(
                "Folder:     {}",
                settings
                    .folder_path
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".into())
            );
        }
        Command::Scan {
            thumbnail_size,
            json,
        } => {
            let settings = library.settings()?;
            if settings.folder_path.is_none() {
                return Err("no folder configured; run `growth-album config --folder <dir>`".into());
            }

            let thumbnails = ThumbnailCache::new(paths.thumbnails()).with_size(thumbnail_size);
            let controller = Controller::start(
                Arc::clone(&library),
                thumbnails,
                Arc::new(FsCaptureProbe::default()),
                ControllerOptions::default(),
            )?;
            let snapshot = run_cycle(&controller).await?;
            print_groups(&snapshot, json)?;
            controller.shutdown().await;
        }
        Command::Groups { json } => {
            let controller = Controller::start(
                Arc::clone(&library),
                ThumbnailCache::new(paths.thumbnails()),
                Arc::new(FsCaptureProbe::default()),
                ControllerOptions {
                    initial_load: false,
                    ..ControllerOptions::default()
                },
            )?;
            print_groups(&controller.snapshot(), json)?;
        }
        Command::Show { path } => {
            let records = library.load_records()?;
            let settings = library.settings()?;
            let Some(mut file) = records.into_iter().find(|f| f.path == path) else {
                return Err(format!("{} is not in the catalog", path.display()).into());
            };
            file.reclassify(settings.reference_date);
            file.note = library.get_note(&path)?;
            println!("{}", serde_json::to_string_pretty(&file)?);
        }
        Command::Note { action } => match action {
            NoteAction::Set { path, text } => {
                library.set_note(&path, &text)?;
                println!("📝 Note saved for {}", path.display());
            }
            NoteAction::Get { path } => match library.get_note(&path)? {
                Some(note) => println!("{}", note),
                None => println!("(no note)"),
            },
            NoteAction::Clear { path } => {
                if library.clear_note(&path)? {
                    println!("🗑️  Note removed for {}", path.display());
                } else {
                    println!("(no note)");
                }
            }
        },
    }

    Ok(())
}

/// Trigger a rescan, wait for it to publish and for its thumbnails to settle
async fn run_cycle(controller: &Controller) -> Result<Arc<Snapshot>, Box<dyn Error>> {
    let mut events = controller.events();
    controller.rescan()?;

    let (generation, pending) = loop {
        match events.recv().await? {
            ControllerEvent::Published {
                generation,
                pending_thumbnails,
                ..
            } => break (generation, pending_thumbnails),
            ControllerEvent::ScanFailed { message, .. } => return Err(message.into()),
            _ => {}
        }
    };
    info!(generation, outstanding = pending.len(), "waiting for thumbnails");

    let mut outstanding: HashSet<PathBuf> = pending.into_iter().collect();
    while !outstanding.is_empty() {
        match events.recv().await {
            Ok(event) => settle(&mut outstanding, event),
            Err(RecvError::Lagged(missed)) => {
                // The settling events may be among the missed ones
                warn!(missed, "event stream lagged, not waiting for remaining thumbnails");
                break;
            }
            Err(RecvError::Closed) => break,
        }
    }

    Ok(controller.snapshot())
}

/// Cross off a thumbnail this cycle is waiting for. Events for paths of
/// other generations are ignored.
fn settle(outstanding: &mut HashSet<PathBuf>, event: ControllerEvent) {
    match event {
        ControllerEvent::ThumbnailReady { path, .. } | ControllerEvent::ThumbnailDiscarded { path } => {
            outstanding.remove(&path);
        }
        ControllerEvent::ThumbnailFailed { path, message } => {
            if outstanding.remove(&path) {
                eprintln!("⚠️  No thumbnail for {}: {}", path.display(), message);
            }
        }
        _ => {}
    }
}

fn print_groups(snapshot: &Snapshot, json: bool) -> Result<(), Box<dyn Error>> {
    let grouped = snapshot.grouped();
    if json {
        println!("{}", serde_json::to_string_pretty(&grouped)?);
        return Ok(());
    }

    if grouped.is_empty() {
        println!("No photos or videos in the catalog.");
        return Ok(());
    }

    for (group, files) in grouped.iter() {
        println!("📁 {} ({} files)", group, files.len());
        for file in files {
            let marker = match (&file.thumbnail_path, &file.note) {
                (_, Some(_)) => "📝",
                (Some(_), None) => "🖼️ ",
                (None, None) => "  ",
            };
            println!("   {} {}", marker, file.name);
        }
    }
    println!("✅ {} files in {} age groups", grouped.file_count(), grouped.len());
    Ok(())
}
