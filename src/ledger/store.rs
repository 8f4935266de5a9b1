//! Persistence seam for the evidence ledger
//!
//! The persisted layout is JSONL: one header line naming the format and its
//! version, then one [`StoredRecord`] per line in sequence order. A reader
//! refuses any format name or version it does not know instead of guessing.
//!
//! A write that fails part way leaves no fragment behind: the file is cut
//! back to its last complete line before the error is returned, and again
//! before the next write or on open if that cut could not be made.

use crate::error::{RelinkError, Result};
use crate::ledger::record::StoredRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const FORMAT_NAME: &str = "relink-evidence";
pub const FORMAT_VERSION: u32 = 1;

/// First line of a persisted ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerHeader {
    pub format: String,
    pub version: u32,
    pub ledger_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl LedgerHeader {
    pub fn new() -> Self {
        Self {
            format: FORMAT_NAME.to_string(),
            version: FORMAT_VERSION,
            ledger_id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    fn check(&self) -> Result<()> {
        if self.format != FORMAT_NAME {
            return Err(RelinkError::UnsupportedLedgerFormat(format!(
                "unknown format '{}'",
                self.format
            )));
        }
        if self.version != FORMAT_VERSION {
            return Err(RelinkError::UnsupportedLedgerFormat(format!(
                "{} version {} (this build reads version {})",
                self.format, self.version, FORMAT_VERSION
            )));
        }
        Ok(())
    }
}

impl Default for LedgerHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Durable backing for ledger records
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// All records persisted so far, in order
    async fn load(&self) -> Result<Vec<StoredRecord>>;

    /// Persist one record after the current tail
    async fn append(&self, record: &StoredRecord) -> Result<()>;
}

/// Store that keeps nothing beyond the ledger's own memory
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryStore;

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn load(&self) -> Result<Vec<StoredRecord>> {
        Ok(Vec::new())
    }

    async fn append(&self, _record: &StoredRecord) -> Result<()> {
        Ok(())
    }
}

/// Append-only JSONL file
pub struct JsonlStore {
    path: PathBuf,
    header: LedgerHeader,
    tail: Mutex<Tail>,
}

/// Open handle plus the length of the file up to its last complete line
struct Tail {
    file: tokio::fs::File,
    len: u64,
}

impl Tail {
    /// Cut off anything written past the last complete line
    async fn discard_partial(&mut self, path: &Path) -> Result<()> {
        let on_disk = self.file.metadata().await?.len();
        if on_disk > self.len {
            warn!(
                "Discarding {} bytes of an incomplete record at the end of {}",
                on_disk - self.len,
                path.display()
            );
            self.file.set_len(self.len).await?;
        }
        Ok(())
    }

    async fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.file.write_all(line).await?;
        self.file.flush().await
    }
}

impl JsonlStore {
    /// Open an existing ledger file or create one with a fresh header
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let header = if tokio::fs::try_exists(&path).await? {
            trim_incomplete_line(&path).await?;
            let header = read_header(&path).await?;
            debug!("Opened ledger {} at {}", header.ledger_id, path.display());
            header
        } else {
            let header = LedgerHeader::new();
            let mut line = serde_json::to_vec(&header)?;
            line.push(b'\n');
            tokio::fs::write(&path, line).await?;
            info!("Created ledger {} at {}", header.ledger_id, path.display());
            header
        };

        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await?;
        let len = file.metadata().await?.len();

        Ok(Self {
            path,
            header,
            tail: Mutex::new(Tail { file, len }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &LedgerHeader {
        &self.header
    }
}

#[async_trait]
impl LedgerStore for JsonlStore {
    async fn load(&self) -> Result<Vec<StoredRecord>> {
        let (_, records) = read_ledger_file(&self.path).await?;
        Ok(records)
    }

    async fn append(&self, record: &StoredRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut tail = self.tail.lock().await;
        tail.discard_partial(&self.path).await?;

        if let Err(e) = tail.write_line(&line).await {
            let len = tail.len;
            if let Err(rollback) = tail.file.set_len(len).await {
                warn!(
                    "Could not roll back failed write to {}: {}",
                    self.path.display(),
                    rollback
                );
            }
            return Err(e.into());
        }
        tail.len += line.len() as u64;
        Ok(())
    }
}

/// Drop bytes after the last newline, left by a write that never completed
async fn trim_incomplete_line(path: &Path) -> Result<()> {
    let contents = tokio::fs::read(path).await?;
    let Some(last_newline) = contents.iter().rposition(|b| *b == b'\n') else {
        return Ok(());
    };
    let complete = last_newline as u64 + 1;
    if complete < contents.len() as u64 {
        warn!(
            "Discarding {} bytes of an incomplete record at the end of {}",
            contents.len() as u64 - complete,
            path.display()
        );
        let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
        file.set_len(complete).await?;
    }
    Ok(())
}

/// Parse a persisted ledger without verifying its chain
///
/// A record line that is not exactly the encoding this build would write
/// (bad UTF-8, unparseable JSON, or an equivalent but different spelling) is
/// reported as an integrity failure at the sequence number its position
/// implies.
pub async fn read_ledger_file(path: &Path) -> Result<(LedgerHeader, Vec<StoredRecord>)> {
    let contents = tokio::fs::read(path).await?;
    parse_ledger(&contents)
}

/// Read and check only the header line
pub async fn read_header(path: &Path) -> Result<LedgerHeader> {
    let file = tokio::fs::File::open(path).await?;
    let mut first = Vec::new();
    BufReader::new(file).read_until(b'\n', &mut first).await?;
    parse_header(&first)
}

fn parse_header(line: &[u8]) -> Result<LedgerHeader> {
    let header: LedgerHeader = serde_json::from_slice(line)
        .map_err(|e| RelinkError::UnsupportedLedgerFormat(format!("bad header: {}", e)))?;
    header.check()?;
    Ok(header)
}

pub fn parse_ledger(contents: &[u8]) -> Result<(LedgerHeader, Vec<StoredRecord>)> {
    let mut lines = contents
        .split(|b| *b == b'\n')
        .filter(|l| !l.iter().all(u8::is_ascii_whitespace));

    let header_line = lines
        .next()
        .ok_or_else(|| RelinkError::UnsupportedLedgerFormat("missing header".to_string()))?;
    let header = parse_header(header_line)?;

    let mut records = Vec::new();
    for (index, line) in lines.enumerate() {
        let broken = |reason: String| RelinkError::LedgerIntegrity {
            sequence_number: index as u64,
            reason,
        };

        let record: StoredRecord = serde_json::from_slice(line)
            .map_err(|e| broken(format!("unparseable record: {}", e)))?;
        if serde_json::to_vec(&record)? != line {
            return Err(broken("record is not in canonical encoding".to_string()));
        }
        records.push(record);
    }

    Ok((header, records))
}

/// Serialize a header and records into the persisted layout
pub fn render_ledger(header: &LedgerHeader, records: &[StoredRecord]) -> Result<String> {
    let mut out = serde_json::to_string(header)?;
    out.push('\n');
    for record in records {
        out.push_str(&serde_json::to_string(record)?);
        out.push('\n');
    }
    Ok(out)
}
