//! Line-delimited JSON backup and restore.
//!
//! One record per line, `{"path": ..., "data": ..., "meta": ...}`, meta
//! omitted when absent. Readers tolerate records split across chunks, blank
//! lines, malformed lines and a final line without a trailing newline.

use crate::error::Result;
use crate::store::Store;
use crate::types::{Meta, MetaPatch};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

const READ_CHUNK: usize = 8 * 1024;

/// A single backup line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub path: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

/// Splits a byte stream into JSON values, one per line.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the values of every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);
        let mut values = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            values.extend(parse_line(&line[..end]));
        }
        values
    }

    /// End of stream: decode whatever is left as the last line.
    pub fn finish(&mut self) -> Option<Value> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }
}

fn parse_line(line: &[u8]) -> Option<Value> {
    let start = line.iter().position(|b| !b.is_ascii_whitespace())?;
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace())?;
    match serde_json::from_slice(&line[start..=end]) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, "skipping malformed backup line");
            None
        }
    }
}

/// Read line records from `reader` until end of stream, handing each to
/// `on_record`. Returns the number of records read.
///
/// A read error aborts with that error; records already handed out stay
/// handed out.
pub async fn read_records<R, F>(reader: &mut R, mut on_record: F) -> Result<usize>
where
    R: AsyncRead + Unpin,
    F: FnMut(Value),
{
    let mut decoder = LineDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut count = 0;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        for value in decoder.push(&chunk[..n]) {
            on_record(value);
            count += 1;
        }
    }
    if let Some(value) = decoder.finish() {
        on_record(value);
        count += 1;
    }
    Ok(count)
}

/// Write `records` one line at a time, each write completing before the
/// next starts. The writer is shut down whether or not writing succeeded.
/// A record that cannot be serialized is written as an empty line.
pub async fn write_records<W, I>(writer: &mut W, records: I) -> Result<usize>
where
    W: AsyncWrite + Unpin,
    I: IntoIterator<Item = BackupRecord>,
{
    let written = write_lines(writer, records).await;
    let closed = writer.shutdown().await;
    let written = written?;
    closed?;
    Ok(written)
}

async fn write_lines<W, I>(writer: &mut W, records: I) -> Result<usize>
where
    W: AsyncWrite + Unpin,
    I: IntoIterator<Item = BackupRecord>,
{
    let mut count = 0;
    for record in records {
        let mut line = serde_json::to_vec(&record).unwrap_or_else(|e| {
            warn!(path = %record.path, error = %e, "backup record not serializable");
            Vec::new()
        });
        line.push(b'\n');
        writer.write_all(&line).await?;
        count += 1;
    }
    writer.flush().await?;
    Ok(count)
}

/// Pull `(path, data, patch)` out of a restored line; `None` when the line
/// is not a record.
fn record_parts(value: Value) -> Option<(String, Value, MetaPatch)> {
    let Value::Object(mut record) = value else {
        return None;
    };
    let path = match record.remove("path") {
        Some(Value::String(path)) => path,
        _ => return None,
    };
    let data = record.remove("data").unwrap_or(Value::Null);
    let patch = record
        .get("meta")
        .and_then(MetaPatch::from_value)
        .unwrap_or_default();
    Some((path, data, patch))
}

impl Store {
    /// Sweep, then write one record per metadata path in insertion order.
    pub async fn backup<W>(&self, writer: &mut W) -> Result<usize>
    where
        W: AsyncWrite + Unpin,
    {
        self.sweep();
        let records: Vec<BackupRecord> = self
            .snapshot()
            .meta
            .into_iter()
            .map(|(path, meta)| BackupRecord {
                data: self.get(&path).unwrap_or(Value::Null),
                path,
                meta: Some(meta),
            })
            .collect();
        let written = write_records(writer, records).await?;
        debug!(records = written, "backup written");
        Ok(written)
    }

    /// Replace the store's contents with the records read from `reader`.
    ///
    /// All top-level data is deleted first. Lines that are not records are
    /// skipped. On a stream error the records applied so far are kept.
    /// Returns the number of records applied.
    pub async fn restore<R>(&self, reader: &mut R) -> Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        let top_level: Vec<String> = self.inner.state.read().data.keys().cloned().collect();
        self.del(top_level);

        let mut applied = 0;
        let read = read_records(reader, |value| match record_parts(value) {
            Some((path, data, patch)) => {
                self.set_with_meta(&path, data, patch);
                applied += 1;
            }
            None => warn!("skipping backup line without a path"),
        })
        .await?;
        debug!(read, applied, "restore finished");
        Ok(applied)
    }

    /// [`Store::backup`] into a file, created or truncated.
    pub async fn backup_to_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let mut file = tokio::fs::File::create(path).await?;
        self.backup(&mut file).await
    }

    /// [`Store::restore`] from a file.
    pub async fn restore_from_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let mut file = tokio::fs::File::open(path).await?;
        self.restore(&mut file).await
    }
}
