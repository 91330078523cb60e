//! Optional durable backing for sessions.
//!
//! The store works fully in memory; a [`SessionPersistence`] only lets
//! conversations survive a restart. History is not safety-critical, so an
//! unreadable record is discarded and the session starts empty.

use super::types::{Message, SessionSnapshot};
use crate::util::write_atomic;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use tracing::warn;

const FORMAT_VERSION: u32 = 1;
const MAX_STEM_LEN: usize = 64;

pub trait SessionPersistence: Send + Sync {
    /// Replace the stored record with `session`.
    fn save(&self, session: &SessionSnapshot) -> Result<()>;

    /// Add one message to the stored record, creating it when missing.
    fn append(
        &self,
        session_id: &str,
        created_at: DateTime<Utc>,
        message: &Message,
    ) -> Result<()>;

    /// `Ok(None)` when nothing usable is stored for the id.
    fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>>;

    fn remove(&self, session_id: &str) -> Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("unreadable session record {}: {reason}", path.display())]
    Corrupted { path: PathBuf, reason: String },
}

/// First JSONL line of every session file.
#[derive(Debug, Serialize, Deserialize)]
struct SessionHeader {
    version: u32,
    session_id: String,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
}

/// One JSONL file per session: a header line, then one line per message.
/// `save` replaces the file atomically; `append` adds a single line. Lines
/// beyond the session bounds are trimmed on load.
pub struct JsonlSessionPersistence {
    dir: PathBuf,
}

impl JsonlSessionPersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create session directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", file_stem(session_id)))
    }

    fn read_snapshot(
        path: &Path,
        session_id: &str,
    ) -> std::result::Result<Option<SessionSnapshot>, StorageError> {
        let corrupted = |reason: String| StorageError::Corrupted {
            path: path.to_path_buf(),
            reason,
        };

        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(corrupted(e.to_string())),
        };

        let mut lines = raw.lines().filter(|line| !line.trim().is_empty());
        let header_line = lines
            .next()
            .ok_or_else(|| corrupted("empty file".into()))?;
        let header: SessionHeader = serde_json::from_str(header_line)
            .map_err(|e| corrupted(format!("bad header: {e}")))?;
        if header.version != FORMAT_VERSION {
            return Err(corrupted(format!("unsupported version {}", header.version)));
        }
        if header.session_id != session_id {
            return Err(corrupted(format!(
                "header names session '{}'",
                header.session_id
            )));
        }

        let messages = lines
            .enumerate()
            .map(|(i, line)| {
                serde_json::from_str::<Message>(line)
                    .map_err(|e| corrupted(format!("bad message on line {}: {e}", i + 2)))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // Appends never touch the header, so the newest message wins.
        let last_activity_at = messages
            .last()
            .map_or(header.last_activity_at, |m| m.timestamp.max(header.last_activity_at));

        Ok(Some(SessionSnapshot {
            id: header.session_id,
            created_at: header.created_at,
            last_activity_at,
            messages,
        }))
    }
}

impl SessionPersistence for JsonlSessionPersistence {
    fn save(&self, session: &SessionSnapshot) -> Result<()> {
        let mut out = header_line(&session.id, session.created_at, session.last_activity_at)?;
        for message in &session.messages {
            out.push_str(&serde_json::to_string(message).context("serializing session message")?);
            out.push('\n');
        }
        write_atomic(&self.path_for(&session.id), out.as_bytes())
    }

    fn append(
        &self,
        session_id: &str,
        created_at: DateTime<Utc>,
        message: &Message,
    ) -> Result<()> {
        let path = self.path_for(session_id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening session file {}", path.display()))?;

        let is_new = file
            .metadata()
            .with_context(|| format!("reading session file {}", path.display()))?
            .len()
            == 0;
        let mut out = if is_new {
            header_line(session_id, created_at, message.timestamp)?
        } else {
            String::new()
        };
        out.push_str(&serde_json::to_string(message).context("serializing session message")?);
        out.push('\n');

        // Header and message go out in a single write.
        file.write_all(out.as_bytes())
            .with_context(|| format!("appending to session file {}", path.display()))?;
        file.sync_data().context("fsync session file")
    }

    fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        let path = self.path_for(session_id);
        match Self::read_snapshot(&path, session_id) {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => {
                warn!(session_id, error = %err, "Discarding corrupted session record");
                match fs::remove_file(&path) {
                    Err(e) if e.kind() != ErrorKind::NotFound => {
                        warn!(path = %path.display(), error = %e, "Failed to remove corrupted session record");
                    }
                    _ => {}
                }
                Ok(None)
            }
        }
    }

    fn remove(&self, session_id: &str) -> Result<()> {
        let path = self.path_for(session_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to remove session file {}", path.display()))
            }
        }
    }
}

fn header_line(
    session_id: &str,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
) -> Result<String> {
    let header = SessionHeader {
        version: FORMAT_VERSION,
        session_id: session_id.to_string(),
        created_at,
        last_activity_at,
    };
    let mut line = serde_json::to_string(&header).context("serializing session header")?;
    line.push('\n');
    Ok(line)
}

/// Map a session id onto a file name. Ids that are not plain
/// `[A-Za-z0-9_-]` (or are too long) get a hash suffix so distinct ids never
/// collide.
fn file_stem(session_id: &str) -> String {
    let mut stem: String = session_id
        .chars()
        .take(MAX_STEM_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if stem.is_empty() || stem != session_id {
        let _ = write!(stem, "-{:016x}", fnv1a(session_id.as_bytes()));
    }
    stem
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}
