//! Sort a folder of family photos and videos into age groups relative to a
//! child's birth date, and keep that classification current as the folder,
//! the birth date or per-file notes change.
//!
//! The pieces, leaf to root:
//! - [`media::scanner`] walks the folder and reads capture times
//! - [`age`] turns a capture time into an [`age::AgeGroup`] and orders groups
//! - [`media::thumbnail`] derives cached JPEG thumbnails for photos
//! - [`state::library`] persists file records, notes and settings
//! - [`reconcile`] runs scan cycles and publishes generation-stamped snapshots

pub mod age;
pub mod config;
pub mod error;
pub mod media;
pub mod reconcile;
pub mod state;

pub use age::{AgeGroup, GroupedCollection};
pub use error::{ControllerError, MetadataError, PersistenceError, ScanError, ThumbnailError};
pub use reconcile::{Controller, ControllerEvent, ControllerOptions, CycleState, Trigger};
pub use state::data::{MediaFile, MediaKind, Settings, Snapshot};
