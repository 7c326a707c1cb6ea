//! Write-ahead log of the local store.
//!
//! The file is a sequence of frames `len (u32 LE) | crc32 (u32 LE) | payload`.
//! The first frame holds a [`WalHeader`], every later one a [`WalBatch`]: one
//! committed local transaction, so recovery sees either all of it or none.
//! A torn or corrupted tail frame ends recovery; everything before it is kept.

use crate::ops::StoreOp;
use crate::types::MemberId;
use anyhow::{bail, Context as _, Result};
use fs_err::{File, OpenOptions};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, trace, warn};

const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub member: MemberId,
    /// Unix millis at creation
    pub created_at: i64,
}

impl WalHeader {
    const MAGIC: [u8; 4] = *b"LKVW";
    const VERSION: u32 = 2;

    fn new(member: MemberId) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            member,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn check(&self, member: MemberId) -> Result<()> {
        if self.magic != Self::MAGIC || self.version != Self::VERSION {
            bail!("Invalid WAL header");
        }
        if self.member != member {
            bail!(
                "WAL member mismatch: expected {member}, found {}",
                self.member
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalBatch {
    pub sequence: u64,
    pub ops: Vec<StoreOp>,
}

fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(value, bincode::config::standard())?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Frames of a WAL file in order.
struct FrameReader<R> {
    reader: R,
    offset: u64,
    file_len: u64,
}

impl<R: Read> FrameReader<R> {
    fn new(reader: R, file_len: u64) -> Self {
        Self {
            reader,
            offset: 0,
            file_len,
        }
    }

    /// Next intact frame payload. `None` at the end of the file or at the
    /// first torn or corrupted frame.
    fn next_payload(&mut self) -> Result<Option<Vec<u8>>> {
        let mut head = [0u8; FRAME_HEADER_LEN];
        match self.reader.read_exact(&mut head) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).context("Failed to read WAL frame"),
        }
        let len = u32::from_le_bytes([head[0], head[1], head[2], head[3]]) as usize;
        let crc = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);

        let remaining = self.file_len.saturating_sub(self.offset + FRAME_HEADER_LEN as u64);
        if len as u64 > remaining {
            warn!(
                offset = self.offset,
                len,
                remaining,
                "WAL frame runs past the end of file, ignoring the tail"
            );
            return Ok(None);
        }
        let mut payload = vec![0u8; len];
        match self.reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                warn!(offset = self.offset, len, "Torn WAL frame, ignoring the tail");
                return Ok(None);
            }
            Err(e) => return Err(e).context("Failed to read WAL frame"),
        }
        if crc32fast::hash(&payload) != crc {
            warn!(offset = self.offset, len, "WAL frame checksum mismatch, ignoring the tail");
            return Ok(None);
        }
        self.offset += (FRAME_HEADER_LEN + len) as u64;
        Ok(Some(payload))
    }

    fn next_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let Some(payload) = self.next_payload()? else {
            return Ok(None);
        };
        let (value, _) = bincode::serde::decode_from_slice(&payload, bincode::config::standard())
            .context("Failed to decode WAL frame")?;
        Ok(Some(value))
    }
}

pub struct WriteAheadLog {
    path: PathBuf,
    writer: BufWriter<File>,
    member: MemberId,
    sequence: u64,
}

impl WriteAheadLog {
    /// Open the WAL at `path`, creating it with a fresh header if missing.
    pub fn new<P: AsRef<Path>>(path: P, member: MemberId) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let existed = path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        let mut wal = Self {
            path,
            writer: BufWriter::new(file),
            member,
            sequence: 0,
        };

        let scanned = if existed { wal.scan()? } else { None };
        match scanned {
            Some((sequence, batches, valid_len)) => {
                wal.sequence = sequence;
                let file_len = wal.writer.get_ref().metadata()?.len();
                if file_len > valid_len {
                    warn!("Truncating {} bytes of WAL tail", file_len - valid_len);
                    wal.writer.get_ref().set_len(valid_len)?;
                }
                info!(
                    "Opened WAL {:?}: {} batches, last sequence {}",
                    wal.path,
                    batches.len(),
                    sequence
                );
            }
            None => {
                if existed {
                    // A batch is only ever written after an intact header.
                    warn!("WAL {:?} has no intact header, starting it afresh", wal.path);
                    wal.writer.get_ref().set_len(0)?;
                }
                wal.write_header()?;
                info!("Created WAL {:?}", wal.path);
            }
        }
        Ok(wal)
    }

    fn write_header(&mut self) -> Result<()> {
        let frame = encode_frame(&WalHeader::new(self.member))?;
        self.append_frame(&frame)
    }

    fn append_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.writer.write_all(frame)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Header check, then every intact batch with the highest sequence seen
    /// and the length of the intact prefix. `None` if the header frame itself
    /// is missing or torn.
    fn scan(&self) -> Result<Option<(u64, Vec<Vec<StoreOp>>, u64)>> {
        let file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();
        let mut frames = FrameReader::new(BufReader::new(file), file_len);
        let Some(header) = frames.next_frame::<WalHeader>()? else {
            return Ok(None);
        };
        header.check(self.member)?;

        let mut valid_len = frames.offset;
        let mut sequence = 0;
        let mut batches = Vec::new();
        while let Some(batch) = frames.next_frame::<WalBatch>()? {
            if batch.sequence <= sequence {
                warn!(
                    "Out of order WAL batch {} after {}, stopping",
                    batch.sequence, sequence
                );
                break;
            }
            sequence = batch.sequence;
            batches.push(batch.ops);
            valid_len = frames.offset;
        }
        Ok(Some((sequence, batches, valid_len)))
    }

    /// Durably append one local transaction.
    pub fn write_batch(&mut self, ops: &[StoreOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let batch = WalBatch {
            sequence: self.sequence + 1,
            ops: ops.to_vec(),
        };
        let frame = encode_frame(&batch)?;
        self.append_frame(&frame)?;
        self.sequence = batch.sequence;
        trace!(sequence = self.sequence, n_ops = ops.len(), "Wrote WAL batch");
        Ok(())
    }

    /// Every committed batch, oldest first, for recovery.
    pub fn read_all_batches(&self) -> Result<Vec<Vec<StoreOp>>> {
        Ok(self
            .scan()?
            .map(|(_, batches, _)| batches)
            .unwrap_or_default())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Drop every batch, leaving only a fresh header. Called once a snapshot
    /// covers the logged batches.
    pub fn reset(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().set_len(0)?;
        self.sequence = 0;
        self.write_header()?;
        info!("Reset WAL {:?}", self.path);
        Ok(())
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WriteAheadLog {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!("Error flushing WAL {:?} on drop: {e:#}", self.path);
        }
    }
}
