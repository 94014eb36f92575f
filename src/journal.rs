//! Iteration over a stream of consecutive USN records.
//!
//! [`UsnJournal`] walks an in-memory buffer, [`JournalReader`] pulls the same stream from any
//! [`std::io::Read`] source such as an extracted `$UsnJrnl:$J` file. Both yield records lazily,
//! stop at the end of the data or at a zero-length record, and stop for good after reporting
//! the first decode error instead of resynchronizing past it.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};
use std::{
    fs::File,
    io::{ErrorKind, Read},
    path::Path,
};

use crate::{
    DEFAULT_BLOCK_SIZE, DEFAULT_BUFFER_SIZE, Usn, UsnResult,
    reason::UsnReason,
    record::{self, MAX_RECORD_LENGTH, MIN_HEADER_SIZE, UsnRecord},
};

const LENGTH_FIELD_SIZE: usize = 4;

/// Options for enumerating a journal stream.
///
/// Allows filtering by starting USN and reason, and controls how zero padding and
/// read buffering are handled.
#[derive(Debug, Clone)]
pub struct JournalOptions {
    pub start_usn: Usn,
    /// [`UsnReason::ALL`] disables reason filtering, so records without any reason bit
    /// are kept too.
    pub reason_mask: UsnReason,
    pub only_on_close: bool,
    /// Treat a zero record length as page padding and continue at the next `block_size`
    /// boundary instead of ending the iteration.
    pub skip_padding: bool,
    pub block_size: usize,
    pub buffer_size: usize,
}

impl Default for JournalOptions {
    fn default() -> Self {
        JournalOptions {
            start_usn: 0,
            reason_mask: UsnReason::ALL,
            only_on_close: false,
            skip_padding: false,
            block_size: DEFAULT_BLOCK_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl JournalOptions {
    fn accepts(&self, record: &UsnRecord) -> bool {
        record.usn >= self.start_usn
            && (self.reason_mask == UsnReason::ALL
                || record.reason.intersects(self.reason_mask))
            && (!self.only_on_close || record.is_close())
    }

    /// First block boundary strictly after `offset`.
    fn next_block(&self, offset: u64) -> u64 {
        let block_size = self.block_size.max(8) as u64;
        (offset / block_size + 1) * block_size
    }
}

/// Logs a USN that goes backwards. The record itself is still yielded.
fn track_usn(last_usn: &mut Option<Usn>, record: &UsnRecord, offset: u64) {
    if let Some(previous) = *last_usn {
        if record.usn < previous {
            warn!(
                "USN went backwards at offset {}: {} after {}",
                offset, record.usn, previous
            );
        }
    }
    *last_usn = Some(record.usn);
}

/// A journal stream held in memory.
#[derive(Debug, Clone)]
pub struct UsnJournal<'a> {
    data: &'a [u8],
    options: JournalOptions,
}

impl<'a> UsnJournal<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        UsnJournal {
            data,
            options: JournalOptions::default(),
        }
    }

    pub fn with_options(data: &'a [u8], options: JournalOptions) -> Self {
        UsnJournal { data, options }
    }

    /// Returns an iterator over the records, starting at the first byte.
    pub fn iter(&self) -> UsnJournalIter<'a> {
        UsnJournalIter {
            data: self.data,
            offset: 0,
            options: self.options.clone(),
            last_usn: None,
            finished: false,
        }
    }
}

impl<'a> IntoIterator for &UsnJournal<'a> {
    type Item = UsnResult<UsnRecord>;
    type IntoIter = UsnJournalIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterate over the records of an in-memory journal.
pub struct UsnJournalIter<'a> {
    data: &'a [u8],
    offset: usize,
    options: JournalOptions,
    last_usn: Option<Usn>,
    finished: bool,
}

impl UsnJournalIter<'_> {
    /// Offset of the next unread byte.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Find the next accepted record.
    ///
    /// Returns `Ok(Some(record))` if one is found, `Ok(None)` at the end of the stream.
    fn find_next_entry(&mut self) -> UsnResult<Option<UsnRecord>> {
        loop {
            let remaining = self.data.get(self.offset..).unwrap_or_default();
            if remaining.is_empty() {
                return Ok(None);
            }

            if remaining.len() < LENGTH_FIELD_SIZE {
                if remaining.iter().all(|b| *b == 0) {
                    return Ok(None);
                }
                return record::decode_record(remaining, self.offset as u64).map(Some);
            }

            if LittleEndian::read_u32(remaining) == 0 {
                if !self.options.skip_padding {
                    return Ok(None);
                }
                let next = self.options.next_block(self.offset as u64) as usize;
                debug!("Skipping padding from offset {} to {}", self.offset, next);
                self.offset = next.min(self.data.len());
                continue;
            }

            let record = record::decode_record(remaining, self.offset as u64)?;
            let offset = self.offset as u64;
            self.offset += record.record_length as usize;

            track_usn(&mut self.last_usn, &record, offset);
            if self.options.accepts(&record) {
                return Ok(Some(record));
            }
        }
    }
}

impl Iterator for UsnJournalIter<'_> {
    type Item = UsnResult<UsnRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.find_next_entry() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                warn!("Error decoding USN record: {}", err);
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

impl std::iter::FusedIterator for UsnJournalIter<'_> {}

/// Reads a journal stream from a [`Read`] source in fixed-size chunks.
///
/// Records may straddle chunk boundaries. Data ending in the middle of a record is
/// reported as a truncated record.
pub struct JournalReader<R> {
    source: R,
    options: JournalOptions,
    buffer: Vec<u8>,
    start: usize,
    end: usize,
    stream_offset: u64,
    eof: bool,
    last_usn: Option<Usn>,
    finished: bool,
}

impl JournalReader<File> {
    /// Opens an extracted `$UsnJrnl:$J` stream.
    pub fn open(path: impl AsRef<Path>) -> UsnResult<Self> {
        JournalReader::open_with_options(path, JournalOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: JournalOptions) -> UsnResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        debug!("Opened journal stream {}", path.display());
        Ok(JournalReader::with_options(file, options))
    }
}

impl<R: Read> JournalReader<R> {
    pub fn new(source: R) -> Self {
        JournalReader::with_options(source, JournalOptions::default())
    }

    pub fn with_options(source: R, options: JournalOptions) -> Self {
        let buffer = vec![0u8; options.buffer_size.max(1)];
        JournalReader {
            source,
            options,
            buffer,
            start: 0,
            end: 0,
            stream_offset: 0,
            eof: false,
            last_usn: None,
            finished: false,
        }
    }

    /// Stream offset of the next unread record.
    pub fn offset(&self) -> u64 {
        self.stream_offset
    }

    pub fn into_inner(self) -> R {
        self.source
    }

    fn buffered(&self) -> &[u8] {
        &self.buffer[self.start..self.end]
    }

    /// Makes at least `wanted` bytes available unless the source ends first.
    ///
    /// Returns the number of buffered bytes.
    fn fill(&mut self, wanted: usize) -> UsnResult<usize> {
        if self.end - self.start >= wanted || self.eof {
            return Ok(self.end - self.start);
        }

        if self.start > 0 {
            self.buffer.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        if self.buffer.len() < wanted {
            self.buffer.resize(wanted, 0);
        }

        while self.end < wanted && !self.eof {
            match self.source.read(&mut self.buffer[self.end..]) {
                Ok(0) => self.eof = true,
                Ok(n) => self.end += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Ok(self.end)
    }

    fn consume(&mut self, count: usize) {
        self.start += count;
        self.stream_offset += count as u64;
    }

    /// Discards input up to `target`. Returns false if the source ends first.
    fn skip_to(&mut self, target: u64) -> UsnResult<bool> {
        while self.stream_offset < target {
            if self.start == self.end && self.fill(1)? == 0 {
                return Ok(false);
            }
            let buffered = (self.end - self.start) as u64;
            let count = buffered.min(target - self.stream_offset) as usize;
            self.consume(count);
        }
        Ok(true)
    }

    fn find_next_entry(&mut self) -> UsnResult<Option<UsnRecord>> {
        loop {
            let available = self.fill(LENGTH_FIELD_SIZE)?;
            if available == 0 {
                return Ok(None);
            }

            if available < LENGTH_FIELD_SIZE {
                if self.buffered().iter().all(|b| *b == 0) {
                    return Ok(None);
                }
                return record::decode_record(self.buffered(), self.stream_offset).map(Some);
            }

            let length = LittleEndian::read_u32(self.buffered()) as usize;
            if length == 0 {
                if !self.options.skip_padding {
                    return Ok(None);
                }
                let next = self.options.next_block(self.stream_offset);
                debug!(
                    "Skipping padding from offset {} to {}",
                    self.stream_offset, next
                );
                if !self.skip_to(next)? {
                    return Ok(None);
                }
                continue;
            }

            // The decoder reports implausible lengths itself; only bound what gets buffered.
            self.fill(length.clamp(MIN_HEADER_SIZE, MAX_RECORD_LENGTH))?;
            let record = record::decode_record(self.buffered(), self.stream_offset)?;
            let offset = self.stream_offset;
            self.consume(record.record_length as usize);

            track_usn(&mut self.last_usn, &record, offset);
            if self.options.accepts(&record) {
                return Ok(Some(record));
            }
        }
    }
}

impl<R: Read> Iterator for JournalReader<R> {
    type Item = UsnResult<UsnRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.find_next_entry() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                warn!("Error reading USN record: {}", err);
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

impl<R: Read> std::iter::FusedIterator for JournalReader<R> {}
