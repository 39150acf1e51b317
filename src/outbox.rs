//! Outgoing message queue on disk
//!
//! The unload phase stages messages here; the transport phase drains it.
//! Messages stay until a broker confirms them, so a failed send is picked
//! up again by the next run.
//!
//! Layout: one JSON envelope per message, named `<stamp>-<seq>.msg` where
//! `stamp` is a strictly increasing batch stamp (microseconds) and `seq` the
//! position within the batch. Lexical order of names is delivery order.
//! Writes go to a dot-prefixed temp file first and are renamed into place.
//! Entries that cannot be decoded are moved to `rejected/`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use crate::unload::batcher::OutboundMessage;

const MESSAGE_EXT: &str = "msg";
const REJECTED_DIR: &str = "rejected";

/// A message read back from the outbox together with its location.
#[derive(Debug, Clone)]
pub struct StagedMessage {
    path: PathBuf,
    message: OutboundMessage,
}

impl StagedMessage {
    pub fn message(&self) -> &OutboundMessage {
        &self.message
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Directory-backed FIFO of outbound messages.
#[derive(Debug)]
pub struct Outbox {
    dir: PathBuf,
}

impl Outbox {
    /// Open the outbox at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stage a batch. Either every message lands or none does. Returns the
    /// staged paths so the caller can [`Outbox::discard`] them.
    pub fn stage_all(&self, messages: &[OutboundMessage]) -> io::Result<Vec<PathBuf>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let stamp = self.next_stamp()?;
        let mut written: Vec<PathBuf> = Vec::with_capacity(messages.len());

        for (seq, message) in messages.iter().enumerate() {
            let name = format!("{:020}-{:06}.{}", stamp, seq, MESSAGE_EXT);
            match self.write_atomic(&name, message) {
                Ok(path) => written.push(path),
                Err(e) => {
                    warn!(
                        "Staging failed at message {} of {}, rolling back: {}",
                        seq + 1,
                        messages.len(),
                        e
                    );
                    self.discard(&written);
                    return Err(e);
                }
            }
        }

        debug!("Staged {} messages in {}", written.len(), self.dir.display());
        Ok(written)
    }

    /// Withdraw staged files, e.g. when the pass that wrote them failed
    /// afterwards. Best effort: failures are logged.
    pub fn discard(&self, paths: &[PathBuf]) {
        for path in paths {
            if let Err(e) = fs::remove_file(path) {
                warn!("Could not remove {}: {}", path.display(), e);
            }
        }
    }

    /// Staged messages in delivery order. Entries that do not decode are
    /// moved to `rejected/`; unreadable ones are skipped for this pass.
    pub fn pending(&self) -> io::Result<Vec<StagedMessage>> {
        let mut staged = Vec::new();
        for path in self.message_paths()? {
            let raw = match fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("Skipping unreadable staged message {}: {}", path.display(), e);
                    continue;
                }
            };
            match serde_json::from_str::<OutboundMessage>(&raw) {
                Ok(message) => staged.push(StagedMessage { path, message }),
                Err(e) => {
                    warn!("Rejecting malformed staged message {}: {}", path.display(), e);
                    if let Err(mv) = self.reject(&path) {
                        warn!("Could not move {} aside: {}", path.display(), mv);
                    }
                }
            }
        }
        Ok(staged)
    }

    /// Directory holding entries that could not be decoded.
    pub fn rejected_dir(&self) -> PathBuf {
        self.dir.join(REJECTED_DIR)
    }

    fn reject(&self, path: &Path) -> io::Result<()> {
        let dir = self.rejected_dir();
        fs::create_dir_all(&dir)?;
        let name = path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no file name"))?;
        fs::rename(path, dir.join(name))
    }

    /// Drop a message after the broker confirmed it.
    pub fn remove(&self, staged: &StagedMessage) -> io::Result<()> {
        fs::remove_file(&staged.path)
    }

    pub fn len(&self) -> io::Result<usize> {
        Ok(self.message_paths()?.len())
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    fn message_paths(&self) -> io::Result<Vec<PathBuf>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && p.extension().is_some_and(|ext| ext == MESSAGE_EXT)
                    && !is_hidden(p)
            })
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Current time in microseconds, bumped past anything already staged so
    /// a new batch always sorts after older ones.
    fn next_stamp(&self) -> io::Result<u64> {
        let now = Utc::now().timestamp_micros().max(0) as u64;
        let newest = self
            .message_paths()?
            .iter()
            .filter_map(|p| p.file_name()?.to_str()?.split('-').next()?.parse::<u64>().ok())
            .max();
        Ok(match newest {
            Some(newest) if newest >= now => newest + 1,
            _ => now,
        })
    }

    fn write_atomic(&self, name: &str, message: &OutboundMessage) -> io::Result<PathBuf> {
        let json = serde_json::to_string(message)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = self.dir.join(format!(".{}.tmp", name));
        let path = self.dir.join(name);
        fs::write(&tmp, json)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(path)
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}
