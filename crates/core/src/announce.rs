//! SDP publication outside RTSP.
//!
//! Receivers of a static (non-RTSP) output need the SDP from somewhere.
//! [`FileAnnouncer`] keeps it in a file that players can open directly;
//! other channels such as SAP implement [`SdpAnnouncer`] externally.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// A channel the current SDP is published on.
pub trait SdpAnnouncer: Send + Sync {
    /// Publish `sdp`, replacing any previous announcement.
    fn announce(&self, sdp: &str) -> Result<()>;

    /// Stop announcing.
    fn withdraw(&self) -> Result<()> {
        Ok(())
    }
}

/// Writes the SDP to a file. Readers never see a partial file: the text
/// goes to `<path>.tmp` first and is renamed over `path`.
#[derive(Debug, Clone)]
pub struct FileAnnouncer {
    path: PathBuf,
}

impl FileAnnouncer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl SdpAnnouncer for FileAnnouncer {
    fn announce(&self, sdp: &str) -> Result<()> {
        let temp = self.temp_path();
        fs::write(&temp, sdp)?;
        if let Err(e) = fs::rename(&temp, &self.path) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        tracing::debug!(path = %self.path.display(), bytes = sdp.len(), "SDP written");
        Ok(())
    }

    fn withdraw(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "SDP file removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
