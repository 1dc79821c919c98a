/// Media file handling
///
/// This module handles:
/// - Finding photos and videos in a folder and reading their capture times
/// - Generating thumbnails
/// - Caching thumbnails to disk

pub mod scanner;
pub mod thumbnail;
