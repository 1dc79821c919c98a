/// Reconciliation controller
///
/// Owns the published snapshot and the scan configuration. Triggers
/// (initial load, folder change, reference-date change, manual rescan) are
/// queued to a single worker task which scans, merges the fresh records
/// with previously derived thumbnails and notes, and publishes the result
/// as a new generation. Thumbnails are derived afterwards, one task per
/// photo, and land in the published snapshot as targeted updates.
///
/// Coalescing: the worker folds every queued trigger into the config
/// before scanning. A trigger arriving while a scan runs supersedes that
/// scan; its result is dropped and a new scan starts.
use chrono::NaiveDate;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::age::{AgeGroup, GroupedCollection};
use crate::config::{ScanConfig, ScanOptions, DEFAULT_THUMBNAIL_WORKERS};
use crate::error::{ControllerError, ScanError, ThumbnailError};
use crate::media::scanner::{self, CaptureProbe};
use crate::media::thumbnail::ThumbnailCache;
use crate::state::data::{MediaFile, Settings, Snapshot};
use crate::state::library::Library;

const EVENT_CAPACITY: usize = 256;

/// Something that asks for a new reconciliation cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Folder and reference date both known at startup
    InitialLoad,
    FolderChanged(PathBuf),
    ReferenceDateChanged(NaiveDate),
    Rescan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Scanning,
    Merging,
}

/// Progress notifications for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    Published {
        generation: u64,
        files: usize,
        /// Images this generation will derive thumbnails for
        pending_thumbnails: Vec<PathBuf>,
    },
    ScanFailed { config_version: u64, message: String },
    /// A newer trigger arrived before the scan finished
    Superseded { config_version: u64 },
    ThumbnailReady { generation: u64, path: PathBuf, thumbnail: PathBuf },
    ThumbnailFailed { path: PathBuf, message: String },
    /// The file left the snapshot, or was already thumbnailed, before its
    /// derivation finished
    ThumbnailDiscarded { path: PathBuf },
    NoteChanged { path: PathBuf },
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerOptions {
    pub scan: ScanOptions,
    /// Thumbnails derived at the same time
    pub thumbnail_workers: usize,
    /// Queue a scan at startup when folder and reference date are known
    pub initial_load: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            scan: ScanOptions::default(),
            thumbnail_workers: DEFAULT_THUMBNAIL_WORKERS,
            initial_load: true,
        }
    }
}

/// Merge freshly scanned records with the previous snapshot.
///
/// Thumbnails carry forward by path. Notes come from the annotation store,
/// falling back to the previous snapshot. Age groups are always recomputed
/// against `reference_date`.
pub fn merge(
    previous: &Snapshot,
    fresh: Vec<MediaFile>,
    notes: &HashMap<PathBuf, String>,
    reference_date: Option<NaiveDate>,
) -> Vec<MediaFile> {
    fresh
        .into_iter()
        .map(|mut file| {
            let prior = previous.get(&file.path);
            if file.thumbnail_path.is_none() {
                file.thumbnail_path = prior.and_then(|p| p.thumbnail_path.clone());
            }
            file.note = notes
                .get(&file.path)
                .cloned()
                .or_else(|| prior.and_then(|p| p.note.clone()));
            file.reclassify(reference_date);
            file
        })
        .collect()
}

struct Shared {
    library: Arc<Library>,
    thumbnails: ThumbnailCache,
    probe: Arc<dyn CaptureProbe>,
    scan_options: ScanOptions,
    snapshot: watch::Sender<Arc<Snapshot>>,
    state: watch::Sender<CycleState>,
    events: broadcast::Sender<ControllerEvent>,
    thumbnail_slots: Arc<Semaphore>,
}

/// Handle to the reconciliation worker. Dropping it stops the worker once
/// the current cycle ends.
pub struct Controller {
    shared: Arc<Shared>,
    triggers: mpsc::UnboundedSender<Trigger>,
    worker: JoinHandle<()>,
}

impl Controller {
    /// Load the persisted catalog as generation 0 and start the worker.
    /// Queues an initial load when both folder and reference date are set.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        library: Arc<Library>,
        thumbnails: ThumbnailCache,
        probe: Arc<dyn CaptureProbe>,
        options: ControllerOptions,
    ) -> Result<Self, ControllerError> {
        let settings = library.settings()?;
        library.verify_thumbnails()?;
        let notes = library.all_notes()?;

        let mut records = library.load_records()?;
        for record in &mut records {
            record.reclassify(settings.reference_date);
            record.note = notes.get(&record.path).cloned();
        }
        info!(files = records.len(), "loaded catalog");

        let initial = Snapshot::new(
            0,
            settings.reference_date,
            settings.folder_path.clone(),
            records,
        );
        let config = ScanConfig::from_settings(&settings);

        let (snapshot, _) = watch::channel(Arc::new(initial));
        let (state, _) = watch::channel(CycleState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let shared = Arc::new(Shared {
            library,
            thumbnails,
            probe,
            scan_options: options.scan,
            snapshot,
            state,
            events,
            thumbnail_slots: Arc::new(Semaphore::new(options.thumbnail_workers.max(1))),
        });

        let (triggers, rx) = mpsc::unbounded_channel();
        if options.initial_load && config.is_complete() {
            // The receiver is alive, this cannot fail
            let _ = triggers.send(Trigger::InitialLoad);
        }
        let worker = tokio::spawn(run_worker(Arc::clone(&shared), rx, config));

        Ok(Self {
            shared,
            triggers,
            worker,
        })
    }

    /// The currently published snapshot
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.shared.snapshot.borrow())
    }

    /// Watch published snapshots, including per-thumbnail updates
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.shared.snapshot.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ControllerEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> CycleState {
        *self.shared.state.borrow()
    }

    pub fn grouped(&self) -> GroupedCollection {
        self.snapshot().grouped()
    }

    pub fn age_groups(&self) -> Vec<AgeGroup> {
        self.snapshot().age_groups()
    }

    /// Current record for a path
    pub fn file(&self, path: &Path) -> Option<MediaFile> {
        self.snapshot().get(path).cloned()
    }

    /// Persist a new folder and rescan it
    pub fn set_folder(&self, folder: PathBuf) -> Result<(), ControllerError> {
        self.shared.library.save_settings(&Settings {
            reference_date: None,
            folder_path: Some(folder.clone()),
        })?;
        self.trigger(Trigger::FolderChanged(folder))
    }

    /// Persist a new reference date and reclassify everything
    pub fn set_reference_date(&self, date: NaiveDate) -> Result<(), ControllerError> {
        self.shared.library.save_settings(&Settings {
            reference_date: Some(date),
            folder_path: None,
        })?;
        self.trigger(Trigger::ReferenceDateChanged(date))
    }

    pub fn rescan(&self) -> Result<(), ControllerError> {
        self.trigger(Trigger::Rescan)
    }

    fn trigger(&self, trigger: Trigger) -> Result<(), ControllerError> {
        debug!(?trigger, "queueing trigger");
        self.triggers.send(trigger).map_err(|_| ControllerError::Stopped)
    }

    /// Store a note for `path`. The path does not have to be in the
    /// current snapshot.
    pub fn set_note(&self, path: &Path, text: &str) -> Result<(), ControllerError> {
        self.shared.library.set_note(path, text)?;
        self.shared.update_note(path, Some(text.to_string()));
        Ok(())
    }

    /// Returns whether a note existed
    pub fn clear_note(&self, path: &Path) -> Result<bool, ControllerError> {
        let removed = self.shared.library.clear_note(path)?;
        if removed {
            self.shared.update_note(path, None);
        }
        Ok(removed)
    }

    pub fn note(&self, path: &Path) -> Result<Option<String>, ControllerError> {
        Ok(self.shared.library.get_note(path)?)
    }

    /// Stop accepting triggers and wait for the worker to finish its cycle
    pub async fn shutdown(self) {
        drop(self.triggers);
        if let Err(e) = self.worker.await {
            warn!(error = %e, "reconciliation worker ended abnormally");
        }
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    mut triggers: mpsc::UnboundedReceiver<Trigger>,
    mut config: ScanConfig,
) {
    let mut generation = shared.snapshot.borrow().generation;
    let mut next = triggers.recv().await;

    while let Some(trigger) = next.take() {
        config.apply(&trigger);
        while let Ok(queued) = triggers.try_recv() {
            config.apply(&queued);
        }

        let Some(folder) = config.folder.clone() else {
            debug!("no folder configured, skipping scan");
            shared.set_state(CycleState::Idle);
            next = triggers.recv().await;
            continue;
        };

        shared.set_state(CycleState::Scanning);
        let result = shared.scan(folder, config.reference_date).await;

        if let Ok(queued) = triggers.try_recv() {
            info!(config_version = config.version, "scan superseded by newer trigger");
            shared.emit(ControllerEvent::Superseded {
                config_version: config.version,
            });
            next = Some(queued);
            continue;
        }

        match result {
            Ok(fresh) => {
                shared.set_state(CycleState::Merging);
                generation += 1;
                let pending = shared.publish(generation, &config, fresh);
                shared.set_state(CycleState::Idle);
                shared.spawn_thumbnails(generation, pending);
            }
            Err(e) => {
                // The previous snapshot stays visible
                warn!(error = %e, "scan failed");
                shared.emit(ControllerEvent::ScanFailed {
                    config_version: config.version,
                    message: e.to_string(),
                });
                shared.set_state(CycleState::Idle);
            }
        }

        next = triggers.recv().await;
    }

    debug!("reconciliation worker stopped");
}

impl Shared {
    fn emit(&self, event: ControllerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: CycleState) {
        self.state.send_replace(state);
    }

    async fn scan(
        &self,
        folder: PathBuf,
        reference_date: Option<NaiveDate>,
    ) -> Result<Vec<MediaFile>, ScanError> {
        let probe = Arc::clone(&self.probe);
        let options = self.scan_options;
        let root = folder.clone();
        tokio::task::spawn_blocking(move || {
            scanner::scan(&folder, reference_date, &options, probe.as_ref())
        })
        .await
        .unwrap_or_else(|e| {
            Err(ScanError::Io {
                path: root,
                source: std::io::Error::other(format!("scan task failed: {}", e)),
            })
        })
    }

    /// Merge and publish a new generation, then persist it. Returns the
    /// images that still need a thumbnail.
    ///
    /// Notes are read and merged while the snapshot is held for writing, so
    /// a concurrent `set_note` either lands in the store before the read or
    /// waits and patches the new snapshot.
    fn publish(&self, generation: u64, config: &ScanConfig, fresh: Vec<MediaFile>) -> Vec<PathBuf> {
        let mut pending = Vec::new();
        let mut files = 0;
        self.snapshot.send_modify(|current| {
            let notes = self.library.all_notes().unwrap_or_else(|e| {
                warn!(error = %e, "cannot read notes, keeping notes from previous snapshot");
                HashMap::new()
            });
            let merged = merge(current, fresh, &notes, config.reference_date);
            let mut snapshot = Snapshot::new(
                generation,
                config.reference_date,
                config.folder.clone(),
                merged,
            );
            snapshot.continue_presence(current);
            pending = snapshot.pending_thumbnails();
            files = snapshot.len();
            *current = Arc::new(snapshot);
        });

        let published = Arc::clone(&self.snapshot.borrow());
        if let Err(e) = self.library.replace_records(published.files()) {
            warn!(error = %e, "failed to persist catalog");
        }

        info!(generation, files, pending = pending.len(), "published snapshot");
        self.emit(ControllerEvent::Published {
            generation,
            files,
            pending_thumbnails: pending.clone(),
        });
        pending
    }

    fn spawn_thumbnails(self: &Arc<Self>, generation: u64, paths: Vec<PathBuf>) {
        for path in paths {
            let shared = Arc::clone(self);
            tokio::spawn(async move {
                let Ok(_permit) = Arc::clone(&shared.thumbnail_slots).acquire_owned().await else {
                    return;
                };
                let still_needed = {
                    let current = shared.snapshot.borrow();
                    current.accepts_thumbnail_from(&path, generation)
                        && current.get(&path).is_some_and(MediaFile::needs_thumbnail)
                };
                if !still_needed {
                    shared.emit(ControllerEvent::ThumbnailDiscarded { path });
                    return;
                }
                let result = shared.thumbnails.derive_async(path.clone()).await;
                shared.apply_thumbnail(generation, path, result);
            });
        }
    }

    /// Targeted update of one record. `generation` is the one whose publish
    /// spawned the derivation; the result is dropped unless the path has
    /// stayed in every snapshot published since then.
    fn apply_thumbnail(
        &self,
        generation: u64,
        path: PathBuf,
        result: Result<PathBuf, ThumbnailError>,
    ) {
        let thumbnail = match result {
            Ok(thumbnail) => thumbnail,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "thumbnail failed");
                self.emit(ControllerEvent::ThumbnailFailed {
                    path,
                    message: e.to_string(),
                });
                return;
            }
        };

        let mut published_generation = generation;
        let applied = self.snapshot.send_if_modified(|current| {
            published_generation = current.generation;
            if !current.accepts_thumbnail_from(&path, generation) {
                return false;
            }
            match Arc::make_mut(current).get_mut(&path) {
                Some(file) => {
                    file.thumbnail_path = Some(thumbnail.clone());
                    true
                }
                None => false,
            }
        });

        if !applied {
            debug!(
                path = %path.display(),
                generation,
                published_generation,
                "discarding thumbnail for superseded file"
            );
            self.emit(ControllerEvent::ThumbnailDiscarded { path });
            return;
        }

        if let Err(e) = self.library.set_thumbnail(&path, &thumbnail) {
            warn!(path = %path.display(), error = %e, "failed to persist thumbnail path");
        }
        self.emit(ControllerEvent::ThumbnailReady {
            generation: published_generation,
            path,
            thumbnail,
        });
    }

    fn update_note(&self, path: &Path, note: Option<String>) {
        self.snapshot.send_if_modified(|current| {
            if !current.contains(path) {
                return false;
            }
            match Arc::make_mut(current).get_mut(path) {
                Some(file) => {
                    file.note = note;
                    true
                }
                None => false,
            }
        });
        self.emit(ControllerEvent::NoteChanged {
            path: path.to_path_buf(),
        });
    }
}
