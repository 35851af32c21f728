//! WAL Reader
//!
//! Reads frames from the WAL region in LSN order.
//!
//! ## End-of-log rules
//! - A frame whose LSN is not the expected next LSN ends the log (it is a
//!   leftover from before the last truncation, or zeroed space)
//! - A frame with the expected LSN but a bad CRC is a torn tail, unless a
//!   valid frame with the following LSN comes right after it; that is
//!   corruption inside the log and fails with `ReplayFailure`
//! - A frame that passes its CRC but cannot be decoded is a `ReplayFailure`

use tracing::warn;

use crate::error::{Result, VaultError};
use crate::io::PagedFile;

use super::entry::FrameHeader;
use super::{WalEntry, WalRegion, HEADER_SIZE};

/// Sequential frame reader
pub struct WalReader<'a> {
    file: &'a PagedFile,
    wal: WalRegion,
    /// Position relative to the first frame
    pos: u64,
    expected_lsn: u64,
    torn_tail: bool,
    done: bool,
}

impl<'a> WalReader<'a> {
    /// Start reading at the first frame, expecting `first_lsn`
    pub fn new(file: &'a PagedFile, wal: WalRegion, first_lsn: u64) -> Self {
        Self {
            file,
            wal,
            pos: 0,
            expected_lsn: first_lsn,
            torn_tail: false,
            done: false,
        }
    }

    /// Next valid entry, or `None` at the end of the log
    pub fn next_entry(&mut self) -> Result<Option<WalEntry>> {
        if self.done {
            return Ok(None);
        }

        let Some((header, body)) = self.read_frame(self.pos, self.expected_lsn)? else {
            self.done = true;
            return Ok(None);
        };

        if !header.matches(&body) {
            let next_pos = self.pos + (HEADER_SIZE + body.len()) as u64;
            if self.valid_frame_at(next_pos, self.expected_lsn + 1)? {
                return Err(VaultError::ReplayFailure(format!(
                    "CRC mismatch at LSN {} with valid entries after it",
                    header.lsn
                )));
            }
            warn!(lsn = header.lsn, position = self.pos, "torn WAL tail discarded");
            self.torn_tail = true;
            self.done = true;
            return Ok(None);
        }

        let entry: WalEntry = bincode::deserialize(&body).map_err(|e| {
            VaultError::ReplayFailure(format!("undecodable entry at LSN {}: {}", header.lsn, e))
        })?;
        if entry.lsn != header.lsn {
            return Err(VaultError::ReplayFailure(format!(
                "frame LSN {} holds entry LSN {}",
                header.lsn, entry.lsn
            )));
        }

        self.pos += (HEADER_SIZE + body.len()) as u64;
        self.expected_lsn += 1;
        Ok(Some(entry))
    }

    /// Read every remaining entry
    pub fn read_all(&mut self) -> Result<Vec<WalEntry>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Whether reading stopped at a damaged final frame
    pub fn torn_tail(&self) -> bool {
        self.torn_tail
    }

    /// Bytes of valid frames consumed
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// LSN of the next frame that would be accepted
    pub fn expected_lsn(&self) -> u64 {
        self.expected_lsn
    }

    /// Header and body at `pos`, if a frame with `lsn` plausibly starts there
    fn read_frame(&mut self, pos: u64, lsn: u64) -> Result<Option<(FrameHeader, Vec<u8>)>> {
        let capacity = self.wal.capacity();
        if pos + HEADER_SIZE as u64 > capacity {
            return Ok(None);
        }

        let mut header_bytes = [0u8; HEADER_SIZE];
        self.file
            .read_exact_at(&mut header_bytes, self.wal.entries_offset() + pos)?;
        let header = FrameHeader::parse(&header_bytes)?;
        if header.lsn != lsn {
            return Ok(None);
        }

        let end = pos + HEADER_SIZE as u64 + header.len as u64;
        if header.len == 0 || end > capacity {
            warn!(lsn, position = pos, len = header.len, "WAL frame length out of range; treating as tail");
            self.torn_tail = true;
            return Ok(None);
        }

        let mut body = vec![0u8; header.len as usize];
        self.file
            .read_exact_at(&mut body, self.wal.entries_offset() + pos + HEADER_SIZE as u64)?;
        Ok(Some((header, body)))
    }

    fn valid_frame_at(&mut self, pos: u64, lsn: u64) -> Result<bool> {
        let torn = self.torn_tail;
        let found = self.read_frame(pos, lsn)?;
        self.torn_tail = torn;
        Ok(found.is_some_and(|(header, body)| header.matches(&body)))
    }
}
