//! Decoding and encoding of single USN records (`USN_RECORD_V2` / `USN_RECORD_V3`).

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};
use std::fmt;

use crate::{
    Usn, UsnResult,
    errors::UsnError,
    reader::ByteReader,
    reason::{FileAttributes, SourceInfo, UsnReason},
    time,
};

/// Size of the smallest supported record header (version 2).
pub const MIN_HEADER_SIZE: usize = 60;

/// Upper bound on a plausible record length. A maximal NTFS name (255 UTF-16 units)
/// in a version 3 record stays far below this.
pub const MAX_RECORD_LENGTH: usize = 64 * 1024; // 64KB

const RECORD_LENGTH_OFFSET: usize = 0;
const MAJOR_VERSION_OFFSET: usize = 4;
const MINOR_VERSION_OFFSET: usize = 6;
const FILE_REFERENCE_OFFSET: usize = 8;

/// Record layouts understood by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordVersion {
    /// 64-bit file references, 60-byte header.
    V2,
    /// 128-bit file identifiers, 76-byte header.
    V3,
}

impl RecordVersion {
    pub fn from_raw(major: u16, minor: u16) -> Option<Self> {
        match (major, minor) {
            (2, 0) => Some(RecordVersion::V2),
            (3, 0) => Some(RecordVersion::V3),
            _ => None,
        }
    }

    pub const fn major(self) -> u16 {
        match self {
            RecordVersion::V2 => 2,
            RecordVersion::V3 => 3,
        }
    }

    const fn reference_size(self) -> usize {
        match self {
            RecordVersion::V2 => 8,
            RecordVersion::V3 => 16,
        }
    }

    /// Offset of the fields that follow the two file references.
    const fn tail_offset(self) -> usize {
        FILE_REFERENCE_OFFSET + 2 * self.reference_size()
    }

    pub const fn header_size(self) -> usize {
        self.tail_offset() + 36
    }
}

/// An NTFS file reference: MFT segment number in the low 48 bits, sequence number in
/// the next 16. Version 3 records widen the field to 128 bits; NTFS still only fills
/// the low 64, other file systems (ReFS) use the full width as an opaque id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FileReference(pub u128);

impl FileReference {
    /// MFT segment number of the volume root directory.
    pub const ROOT_SEGMENT_NUMBER: u64 = 5;

    pub const fn segment_number(self) -> u64 {
        (self.0 as u64) & 0x0000_FFFF_FFFF_FFFF
    }

    pub const fn sequence_number(self) -> u16 {
        ((self.0 as u64) >> 48) as u16
    }

    /// Returns true if the reference does not fit the 64-bit NTFS form.
    pub const fn is_extended(self) -> bool {
        self.0 >> 64 != 0
    }

    pub const fn is_root(self) -> bool {
        !self.is_extended() && self.segment_number() == Self::ROOT_SEGMENT_NUMBER
    }
}

impl From<u64> for FileReference {
    fn from(value: u64) -> Self {
        FileReference(u128::from(value))
    }
}

impl fmt::Display for FileReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_extended() {
            write!(f, "0x{:032x}", self.0)
        } else {
            write!(f, "{}-{}", self.segment_number(), self.sequence_number())
        }
    }
}

/// One decoded change journal entry.
///
/// Owns all of its data, so it outlives the buffer it was decoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsnRecord {
    pub record_length: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub file_reference: FileReference,
    pub parent_file_reference: FileReference,
    pub usn: Usn,
    pub timestamp: DateTime<Utc>,
    pub reason: UsnReason,
    pub source_info: SourceInfo,
    pub security_id: u32,
    pub file_attributes: FileAttributes,
    /// Offset of the name relative to the record start.
    pub file_name_offset: u16,
    /// Decoded from UTF-16LE; unpaired surrogates become U+FFFD.
    pub file_name: String,
}

impl UsnRecord {
    pub fn version(&self) -> Option<RecordVersion> {
        RecordVersion::from_raw(self.major_version, self.minor_version)
    }

    /// Returns true if this entry represents a directory.
    pub fn is_dir(&self) -> bool {
        self.file_attributes.contains(FileAttributes::DIRECTORY)
    }

    /// Returns true if this entry represents a hidden file or directory.
    pub fn is_hidden(&self) -> bool {
        self.file_attributes.contains(FileAttributes::HIDDEN)
    }

    /// Returns true if the record was written when the last handle to the file closed.
    pub fn is_close(&self) -> bool {
        self.reason.contains(UsnReason::CLOSE)
    }

    /// Encodes the record in the layout of its own version.
    ///
    /// The buffer is `record_length` bytes long with the name at `file_name_offset`
    /// and every other byte zero.
    pub fn to_bytes(&self) -> UsnResult<Vec<u8>> {
        let version = self.version().ok_or(UsnError::UnsupportedVersion {
            offset: 0,
            major: self.major_version,
            minor: self.minor_version,
        })?;

        let record_length = self.record_length as usize;
        let header_size = version.header_size();
        if record_length < header_size || record_length > MAX_RECORD_LENGTH {
            return Err(UsnError::InvalidRecordLength {
                offset: 0,
                length: self.record_length,
            });
        }

        let name: Vec<u16> = self.file_name.encode_utf16().collect();
        let name_offset = self.file_name_offset as usize;
        let name_bytes = name.len() * 2;
        let name_length = u16::try_from(name_bytes).map_err(|_| UsnError::InvalidFileName {
            offset: 0,
            name_offset: self.file_name_offset,
            name_length: u16::MAX,
        })?;
        if name_offset < header_size || name_offset + name_bytes > record_length {
            return Err(UsnError::InvalidFileName {
                offset: 0,
                name_offset: self.file_name_offset,
                name_length,
            });
        }

        let filetime =
            time::datetime_to_filetime(self.timestamp).ok_or(UsnError::InvalidTimestamp)?;

        let mut buffer = vec![0u8; record_length];
        LittleEndian::write_u32(&mut buffer[RECORD_LENGTH_OFFSET..], self.record_length);
        LittleEndian::write_u16(&mut buffer[MAJOR_VERSION_OFFSET..], self.major_version);
        LittleEndian::write_u16(&mut buffer[MINOR_VERSION_OFFSET..], self.minor_version);

        match version {
            RecordVersion::V2 => {
                if self.file_reference.is_extended() || self.parent_file_reference.is_extended()
                {
                    return Err(UsnError::OtherError(
                        "128-bit file reference does not fit a version 2 record".to_string(),
                    ));
                }
                LittleEndian::write_u64(
                    &mut buffer[FILE_REFERENCE_OFFSET..],
                    self.file_reference.0 as u64,
                );
                LittleEndian::write_u64(
                    &mut buffer[FILE_REFERENCE_OFFSET + 8..],
                    self.parent_file_reference.0 as u64,
                );
            }
            RecordVersion::V3 => {
                LittleEndian::write_u128(
                    &mut buffer[FILE_REFERENCE_OFFSET..],
                    self.file_reference.0,
                );
                LittleEndian::write_u128(
                    &mut buffer[FILE_REFERENCE_OFFSET + 16..],
                    self.parent_file_reference.0,
                );
            }
        }

        let tail = version.tail_offset();
        LittleEndian::write_i64(&mut buffer[tail..], self.usn);
        LittleEndian::write_u64(&mut buffer[tail + 8..], filetime);
        LittleEndian::write_u32(&mut buffer[tail + 16..], self.reason.bits());
        LittleEndian::write_u32(&mut buffer[tail + 20..], self.source_info.bits());
        LittleEndian::write_u32(&mut buffer[tail + 24..], self.security_id);
        LittleEndian::write_u32(&mut buffer[tail + 28..], self.file_attributes.bits());
        LittleEndian::write_u16(&mut buffer[tail + 32..], name_length);
        LittleEndian::write_u16(&mut buffer[tail + 34..], self.file_name_offset);

        for (i, unit) in name.iter().enumerate() {
            LittleEndian::write_u16(&mut buffer[name_offset + i * 2..], *unit);
        }

        Ok(buffer)
    }
}

/// Decodes the record starting at `offset` in `buffer`.
///
/// Only the bytes the record declares are looked at; whatever follows it is left
/// to the caller.
pub fn decode(buffer: &[u8], offset: usize) -> UsnResult<UsnRecord> {
    let data = buffer.get(offset..).ok_or(UsnError::OutOfBounds {
        offset,
        size: 0,
        len: buffer.len(),
    })?;
    decode_record(data, offset as u64)
}

/// Decodes the record at the start of `data`. `stream_offset` is where `data` begins
/// in the journal stream and is only used for error reporting.
pub(crate) fn decode_record(data: &[u8], stream_offset: u64) -> UsnResult<UsnRecord> {
    let reader = ByteReader::new(data);
    let available = data.len();

    if available < MIN_HEADER_SIZE {
        let declared = reader
            .read_u32(RECORD_LENGTH_OFFSET)
            .map_or(MIN_HEADER_SIZE, |length| {
                (length as usize).max(MIN_HEADER_SIZE)
            });
        return Err(UsnError::TruncatedRecord {
            offset: stream_offset,
            declared,
            available,
        });
    }

    let record_length = reader.read_u32(RECORD_LENGTH_OFFSET)?;
    let major_version = reader.read_u16(MAJOR_VERSION_OFFSET)?;
    let minor_version = reader.read_u16(MINOR_VERSION_OFFSET)?;

    let version = RecordVersion::from_raw(major_version, minor_version).ok_or(
        UsnError::UnsupportedVersion {
            offset: stream_offset,
            major: major_version,
            minor: minor_version,
        },
    )?;

    let header_size = version.header_size();
    let length = record_length as usize;
    if length < header_size || length > MAX_RECORD_LENGTH {
        return Err(UsnError::InvalidRecordLength {
            offset: stream_offset,
            length: record_length,
        });
    }

    if length > available {
        return Err(UsnError::TruncatedRecord {
            offset: stream_offset,
            declared: length,
            available,
        });
    }

    // From here on nothing past the declared length is visible.
    let record = ByteReader::new(reader.read_bytes(0, length)?);

    let (file_reference, parent_file_reference) = match version {
        RecordVersion::V2 => (
            FileReference::from(record.read_u64(FILE_REFERENCE_OFFSET)?),
            FileReference::from(record.read_u64(FILE_REFERENCE_OFFSET + 8)?),
        ),
        RecordVersion::V3 => (
            FileReference(record.read_u128(FILE_REFERENCE_OFFSET)?),
            FileReference(record.read_u128(FILE_REFERENCE_OFFSET + 16)?),
        ),
    };

    let tail = version.tail_offset();
    let usn = record.read_i64(tail)?;
    let filetime = record.read_u64(tail + 8)?;
    let reason = UsnReason::from_bits_retain(record.read_u32(tail + 16)?);
    let source_info = SourceInfo::from_bits_retain(record.read_u32(tail + 20)?);
    let security_id = record.read_u32(tail + 24)?;
    let file_attributes = FileAttributes::from_bits_retain(record.read_u32(tail + 28)?);
    let file_name_length = record.read_u16(tail + 32)?;
    let file_name_offset = record.read_u16(tail + 34)?;

    // Do not count on a terminating NUL; the length field is authoritative.
    let name_start = file_name_offset as usize;
    let name_end = name_start + file_name_length as usize;
    if name_start < header_size || name_end > length || file_name_length % 2 != 0 {
        return Err(UsnError::InvalidFileName {
            offset: stream_offset,
            name_offset: file_name_offset,
            name_length: file_name_length,
        });
    }

    let name_data = record.read_bytes(name_start, file_name_length as usize)?;
    let name_units: Vec<u16> = name_data
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect();
    let file_name = String::from_utf16_lossy(&name_units);

    Ok(UsnRecord {
        record_length,
        major_version,
        minor_version,
        file_reference,
        parent_file_reference,
        usn,
        timestamp: time::filetime_to_datetime(filetime),
        reason,
        source_info,
        security_id,
        file_attributes,
        file_name_offset,
        file_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{RecordBuilder, UNIX_EPOCH_FILETIME};
    use chrono::TimeZone;
    use test_case::test_case;

    #[test]
    fn decode_v2_record() -> UsnResult<()> {
        let bytes = RecordBuilder::v2("report.docx")
            .file_reference(0x0003_0000_0000_1234)
            .parent_file_reference(0x0001_0000_0000_0005)
            .usn(0x1_0000)
            .filetime(UNIX_EPOCH_FILETIME)
            .reason(UsnReason::FILE_CREATE | UsnReason::CLOSE)
            .source_info(SourceInfo::DATA_MANAGEMENT)
            .security_id(0x10c)
            .file_attributes(FileAttributes::ARCHIVE)
            .build();

        let record = decode(&bytes, 0)?;
        assert_eq!(record.record_length as usize, bytes.len());
        assert_eq!(record.record_length % 8, 0);
        assert_eq!(record.version(), Some(RecordVersion::V2));
        assert_eq!(record.file_reference.segment_number(), 0x1234);
        assert_eq!(record.file_reference.sequence_number(), 3);
        assert!(record.parent_file_reference.is_root());
        assert_eq!(record.usn, 0x1_0000);
        assert_eq!(record.timestamp, Utc.timestamp_opt(0, 0).unwrap());
        assert_eq!(record.reason, UsnReason::FILE_CREATE | UsnReason::CLOSE);
        assert!(record.is_close());
        assert_eq!(record.source_info, SourceInfo::DATA_MANAGEMENT);
        assert_eq!(record.security_id, 0x10c);
        assert!(!record.is_dir());
        assert!(!record.is_hidden());
        assert_eq!(record.file_name_offset as usize, MIN_HEADER_SIZE);
        assert_eq!(record.file_name, "report.docx");
        Ok(())
    }

    #[test]
    fn decode_v3_record() -> UsnResult<()> {
        let wide = (0xDEAD_BEEFu128 << 64) | 0x42;
        let bytes = RecordBuilder::v3("Ünïcødé ☃")
            .file_reference_u128(wide)
            .parent_file_reference(5)
            .usn(77)
            .file_attributes(FileAttributes::DIRECTORY | FileAttributes::HIDDEN)
            .build();

        let record = decode(&bytes, 0)?;
        assert_eq!(record.version(), Some(RecordVersion::V3));
        assert_eq!(record.file_reference, FileReference(wide));
        assert!(record.file_reference.is_extended());
        assert_eq!(record.parent_file_reference.segment_number(), 5);
        assert_eq!(record.usn, 77);
        assert!(record.is_dir());
        assert!(record.is_hidden());
        assert_eq!(record.file_name_offset as usize, RecordVersion::V3.header_size());
        assert_eq!(record.file_name, "Ünïcødé ☃");
        Ok(())
    }

    #[test]
    fn decode_at_offset_ignores_trailing_bytes() -> UsnResult<()> {
        let first = RecordBuilder::v2("a.txt").usn(8).build();
        let second = RecordBuilder::v2("b.txt").usn(16).build();
        let mut buffer = first.clone();
        buffer.extend_from_slice(&second);
        buffer.extend_from_slice(&[0xFF; 3]);

        let record = decode(&buffer, first.len())?;
        assert_eq!(record.file_name, "b.txt");
        assert_eq!(record.usn, 16);
        Ok(())
    }

    #[test]
    fn round_trip_reproduces_bytes() -> UsnResult<()> {
        for bytes in [
            RecordBuilder::v2("$MFT").usn(1).reason(UsnReason::CLOSE).build(),
            RecordBuilder::v2("padding-check.tmp")
                .usn(i64::MAX)
                .filetime(133_338_978_450_000_001)
                .record_length(160)
                .build(),
            RecordBuilder::v3("Documents")
                .file_reference_u128(u128::MAX)
                .parent_file_reference(5)
                .build(),
        ] {
            let record = decode(&bytes, 0)?;
            assert_eq!(record.to_bytes()?, bytes);
        }
        Ok(())
    }

    #[test_case(0 ; "empty buffer")]
    #[test_case(3 ; "shorter than the length field")]
    #[test_case(8 ; "length and version only")]
    #[test_case(59 ; "one byte short of a header")]
    fn short_buffer_is_truncated(len: usize) {
        let bytes = RecordBuilder::v2("x").build();
        let result = decode(&bytes[..len], 0);
        assert!(
            matches!(result, Err(UsnError::TruncatedRecord { available, .. }) if available == len),
            "unexpected result {:?}",
            result
        );
    }

    #[test]
    fn declared_length_past_buffer_is_truncated() {
        let mut bytes = RecordBuilder::v2("short.txt").build();
        let len = bytes.len();
        LittleEndian::write_u32(&mut bytes[0..4], (len + 64) as u32);

        match decode(&bytes, 0) {
            Err(UsnError::TruncatedRecord {
                offset,
                declared,
                available,
            }) => {
                assert_eq!(offset, 0);
                assert_eq!(declared, len + 64);
                assert_eq!(available, len);
            }
            other => panic!("expected TruncatedRecord, got {:?}", other),
        }
    }

    #[test_case(1, 0 ; "version 1")]
    #[test_case(2, 1 ; "version 2.1")]
    #[test_case(4, 0 ; "range tracking version 4")]
    fn unknown_version_is_rejected(major: u16, minor: u16) {
        let mut bytes = RecordBuilder::v2("v.txt").build();
        LittleEndian::write_u16(&mut bytes[4..6], major);
        LittleEndian::write_u16(&mut bytes[6..8], minor);

        match decode(&bytes, 0) {
            Err(UsnError::UnsupportedVersion {
                major: m, minor: n, ..
            }) => assert_eq!((m, n), (major, minor)),
            other => panic!("expected UnsupportedVersion, got {:?}", other),
        }
    }

    #[test_case(0 ; "zero")]
    #[test_case(59 ; "below the v2 header")]
    #[test_case(0x0001_0008 ; "beyond the sanity limit")]
    fn implausible_record_length(length: u32) {
        let mut bytes = RecordBuilder::v2("len.txt").build();
        LittleEndian::write_u32(&mut bytes[0..4], length);
        assert!(matches!(
            decode(&bytes, 0),
            Err(UsnError::InvalidRecordLength { length: l, .. }) if l == length
        ));
    }

    #[test]
    fn v3_length_must_cover_v3_header() {
        let mut bytes = RecordBuilder::v3("wide").build();
        LittleEndian::write_u32(&mut bytes[0..4], 72);
        assert!(matches!(
            decode(&bytes, 0),
            Err(UsnError::InvalidRecordLength { length: 72, .. })
        ));
    }

    #[test_case(40, 2 ; "name inside the header")]
    #[test_case(60, 200 ; "name past the record")]
    #[test_case(60, 3 ; "odd name length")]
    fn bad_file_name_bounds(name_offset: u16, name_length: u16) {
        let mut bytes = RecordBuilder::v2("name.txt").build();
        LittleEndian::write_u16(&mut bytes[56..58], name_length);
        LittleEndian::write_u16(&mut bytes[58..60], name_offset);
        assert!(matches!(
            decode(&bytes, 0),
            Err(UsnError::InvalidFileName { name_offset: o, name_length: l, .. })
                if o == name_offset && l == name_length
        ));
    }

    #[test]
    fn decode_past_end_is_out_of_bounds() {
        let bytes = RecordBuilder::v2("x").build();
        assert!(matches!(
            decode(&bytes, bytes.len() + 1),
            Err(UsnError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn unpaired_surrogate_is_replaced() -> UsnResult<()> {
        let bytes = RecordBuilder::v2_utf16(&[0x0061, 0xD800, 0x0062]).build();
        let record = decode(&bytes, 0)?;
        assert_eq!(record.file_name, "a\u{FFFD}b");
        Ok(())
    }

    #[test]
    fn encode_rejects_extended_reference_in_v2() {
        let bytes = RecordBuilder::v2("x").build();
        let mut record = decode(&bytes, 0).unwrap();
        record.file_reference = FileReference(1u128 << 100);
        assert!(matches!(record.to_bytes(), Err(UsnError::OtherError(_))));
    }

    #[test]
    fn encode_rejects_pre_1601_timestamp() {
        let bytes = RecordBuilder::v2("x").build();
        let mut record = decode(&bytes, 0).unwrap();
        record.timestamp = Utc.with_ymd_and_hms(1500, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(record.to_bytes(), Err(UsnError::InvalidTimestamp)));
    }

    #[test]
    fn file_reference_display() {
        assert_eq!(FileReference::from(0x0002_0000_0000_0010).to_string(), "16-2");
        assert_eq!(
            FileReference(1u128 << 64).to_string(),
            "0x00000000000000010000000000000000"
        );
    }
}
