//! Per-member log lists and replay cursors kept in the coordination service.
//!
//! A member's list is the replay order: position in the list is the only
//! ordering of ledgers, never their numeric id or commit timestamp.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::coord::{Coordinator, Paths};
use crate::error::{Error, Result};
use crate::types::{LedgerId, LogRecord, MemberId, Versioned};

pub fn encode_records(records: &[LogRecord]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(records.len() * LogRecord::ENCODED_LEN);
    for record in records {
        buf.extend_from_slice(&record.ledger_id.to_be_bytes());
        buf.extend_from_slice(&record.timestamp.to_be_bytes());
    }
    buf
}

pub fn decode_records(path: &str, bytes: &[u8]) -> Result<Vec<LogRecord>> {
    if bytes.len() % LogRecord::ENCODED_LEN != 0 {
        return Err(Error::MalformedLog {
            path: path.to_string(),
            len: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(LogRecord::ENCODED_LEN)
        .map(|chunk| {
            let (id, ts) = chunk.split_at(8);
            LogRecord::new(be_i64(id), be_i64(ts))
        })
        .collect())
}

fn be_i64(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    i64::from_be_bytes(buf)
}

fn decode_cursor(path: &str, bytes: &[u8]) -> Result<Option<LedgerId>> {
    match bytes.len() {
        0 => Ok(None),
        8 => Ok(Some(be_i64(bytes))),
        len => Err(Error::MalformedLog {
            path: path.to_string(),
            len,
        }),
    }
}

/// Ids strictly after `cursor` in list order; the whole list when the cursor
/// is absent or not in the list.
pub fn ids_after(records: &[LogRecord], cursor: Option<LedgerId>) -> Vec<LedgerId> {
    let start = match cursor {
        None => 0,
        Some(cursor) => match position(records, cursor) {
            Some(pos) => pos + 1,
            None => {
                warn!(cursor, "Cursor not found in log list, replaying from start");
                0
            }
        },
    };
    records[start..].iter().map(|r| r.ledger_id).collect()
}

fn position(records: &[LogRecord], ledger_id: LedgerId) -> Option<usize> {
    records.iter().position(|r| r.ledger_id == ledger_id)
}

pub struct LogIndex<C> {
    coord: Arc<C>,
    paths: Paths,
}

impl<C: Coordinator> LogIndex<C> {
    pub fn new(coord: Arc<C>, paths: Paths) -> Self {
        Self { coord, paths }
    }

    async fn read_node(&self, path: &str) -> Result<Versioned> {
        self.coord
            .get(path)
            .await?
            .ok_or_else(|| Error::NoSuchNode(path.to_string()))
    }

    /// Append one record to `member`'s list, conditioned on the version read.
    /// A concurrent writer makes this fail with `VersionConflict`.
    pub async fn append(&self, member: MemberId, ledger_id: LedgerId, timestamp: i64) -> Result<()> {
        let path = self.paths.log(member);
        let node = self.read_node(&path).await?;
        // validate what is there before extending it
        decode_records(&path, &node.data)?;

        let mut data = node.data;
        data.extend_from_slice(&encode_records(&[LogRecord::new(ledger_id, timestamp)]));
        let version = self.coord.set(&path, data, node.version).await?;
        trace!(member, ledger_id, version, "Appended to log list");
        Ok(())
    }

    pub async fn entries(&self, member: MemberId) -> Result<Vec<LogRecord>> {
        let path = self.paths.log(member);
        let node = self.read_node(&path).await?;
        decode_records(&path, &node.data)
    }

    pub async fn list_from(&self, member: MemberId, cursor: Option<LedgerId>) -> Result<Vec<LedgerId>> {
        let records = self.entries(member).await?;
        Ok(ids_after(&records, cursor))
    }

    pub async fn cursor(&self, member: MemberId) -> Result<Option<LedgerId>> {
        let path = self.paths.cursor(member);
        let node = self.read_node(&path).await?;
        decode_cursor(&path, &node.data)
    }

    /// Persist `ledger_id` as `member`'s last applied ledger. Refuses to move
    /// the cursor to an earlier list position.
    pub async fn advance_cursor(&self, member: MemberId, ledger_id: LedgerId) -> Result<()> {
        let path = self.paths.cursor(member);
        let node = self.read_node(&path).await?;
        let current = decode_cursor(&path, &node.data)?;

        if let Some(current) = current {
            if current == ledger_id {
                return Ok(());
            }
            let records = self.entries(member).await?;
            if let (Some(from), Some(to)) = (position(&records, current), position(&records, ledger_id)) {
                if to < from {
                    warn!(member, current, ledger_id, "Refusing to move cursor backwards");
                    return Ok(());
                }
            }
        }

        self.coord
            .set(&path, ledger_id.to_be_bytes().to_vec(), node.version)
            .await?;
        debug!(member, ledger_id, "Advanced cursor");
        Ok(())
    }

    pub async fn gc_mark(&self) -> Result<Option<LedgerId>> {
        let path = self.paths.gc_mark();
        let node = self.read_node(&path).await?;
        decode_cursor(&path, &node.data)
    }

    /// Record `ledger_id` as the last collected ledger. Conditioned on the
    /// version read, so two concurrent sweeps cannot both move it.
    pub async fn set_gc_mark(&self, ledger_id: LedgerId) -> Result<()> {
        let path = self.paths.gc_mark();
        let node = self.read_node(&path).await?;
        self.coord
            .set(&path, ledger_id.to_be_bytes().to_vec(), node.version)
            .await?;
        trace!(ledger_id, "Moved garbage collection mark");
        Ok(())
    }

    /// Ledgers every member has applied: those before each member's cursor in
    /// that member's own list. Empty while any member has no cursor yet.
    pub async fn collectible(&self, members: &[MemberId]) -> Result<Vec<LedgerId>> {
        let mut common: Option<HashSet<LedgerId>> = None;
        let mut order: Option<Vec<LedgerId>> = None;

        for &member in members {
            let Some(cursor) = self.cursor(member).await? else {
                return Ok(Vec::new());
            };
            let records = self.entries(member).await?;
            let Some(pos) = position(&records, cursor) else {
                return Ok(Vec::new());
            };
            let applied: HashSet<LedgerId> = records[..pos].iter().map(|r| r.ledger_id).collect();
            order.get_or_insert_with(|| records[..pos].iter().map(|r| r.ledger_id).collect());
            common = Some(match common {
                None => applied,
                Some(prev) => prev.intersection(&applied).copied().collect(),
            });
        }

        let common = common.unwrap_or_default();
        Ok(order
            .unwrap_or_default()
            .into_iter()
            .filter(|id| common.contains(id))
            .collect())
    }
}
