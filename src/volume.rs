//! Live change journal access on a mounted NTFS/ReFS volume.
//!
//! Raw journal buffers come from `FSCTL_READ_USN_JOURNAL` and are decoded with the same
//! byte-level decoder used for extracted `$UsnJrnl:$J` streams.

use crate::{
    Usn, UsnResult,
    errors::UsnError,
    journal::{JournalOptions, UsnJournal},
    reader::ByteReader,
    record::UsnRecord,
};
use log::{debug, warn};
use std::{collections::VecDeque, ffi::c_void, mem::size_of, path::Path};
use windows::{
    Win32::{
        Foundation::{CloseHandle, ERROR_ACCESS_DENIED, ERROR_HANDLE_EOF, HANDLE},
        Storage::FileSystem::{
            CreateFileW, FILE_FLAGS_AND_ATTRIBUTES, FILE_GENERIC_READ, FILE_SHARE_READ,
            FILE_SHARE_WRITE, GetVolumeNameForVolumeMountPointW, OPEN_EXISTING,
        },
        System::{
            IO::DeviceIoControl,
            Ioctl::{
                FSCTL_QUERY_USN_JOURNAL, FSCTL_READ_USN_JOURNAL, READ_USN_JOURNAL_DATA_V1,
                USN_JOURNAL_DATA_V0,
            },
        },
    },
    core::HSTRING,
};

#[derive(Debug)]
/// An open NTFS/ReFS volume handle and its associated drive letter or mount point.
pub struct Volume {
    handle: HANDLE,
    pub drive_letter: Option<char>,
    pub mount_point: Option<String>,
}

impl Volume {
    /// Opens the volume behind a drive letter.
    pub fn from_drive_letter(drive_letter: char) -> UsnResult<Self> {
        // https://learn.microsoft.com/en-us/windows/win32/fileio/obtaining-a-volume-handle-for-change-journal-operations
        let volume_root = format!(r"\\.\{}:", drive_letter);
        let handle = open_volume(&volume_root)?;
        Ok(Volume {
            handle,
            drive_letter: Some(drive_letter),
            mount_point: None,
        })
    }

    /// Opens the volume mounted at `mount_point`.
    pub fn from_mount_point(mount_point: &Path) -> UsnResult<Self> {
        // GetVolumeNameForVolumeMountPointW requires trailing backslash
        let mount_path = format!("{}\\", mount_point.to_string_lossy());

        let mut volume_name = [0u16; 64]; // Enough space for volume GUID path
        if let Err(err) = unsafe {
            GetVolumeNameForVolumeMountPointW(&HSTRING::from(&mount_path), &mut volume_name)
        } {
            warn!(
                "GetVolumeNameForVolumeMountPointW failed, mount_point={}, error={:?}",
                mount_path, err
            );
            return Err(err.into());
        }

        let end = volume_name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(volume_name.len());
        let volume_guid = String::from_utf16_lossy(&volume_name[..end]);
        debug!("Volume GUID: {}", volume_guid);

        // CreateFileW wants the GUID path without the trailing backslash.
        let handle = open_volume(volume_guid.trim_end_matches('\\'))?;
        Ok(Volume {
            handle,
            drive_letter: None,
            mount_point: Some(mount_point.to_string_lossy().to_string()),
        })
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        if let Err(err) = unsafe { CloseHandle(self.handle) } {
            warn!("Error closing volume handle: {}", err);
        }
    }
}

fn open_volume(path: &str) -> UsnResult<HANDLE> {
    match unsafe {
        CreateFileW(
            &HSTRING::from(path),
            FILE_GENERIC_READ.0,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            None,
            OPEN_EXISTING,
            FILE_FLAGS_AND_ATTRIBUTES::default(),
            None,
        )
    } {
        Ok(handle) => Ok(handle),
        Err(err) if err.code() == ERROR_ACCESS_DENIED.to_hresult() => {
            Err(UsnError::PermissionError)
        }
        Err(err) => Err(UsnError::WinApiError(err)),
    }
}

/// State of the active change journal on a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalInfo {
    pub journal_id: u64,
    pub first_usn: Usn,
    pub next_usn: Usn,
    pub lowest_valid_usn: Usn,
    pub max_usn: Usn,
    pub maximum_size: u64,
    pub allocation_delta: u64,
}

/// Query the active change journal of a volume.
///
/// Fails with the Windows error `ERROR_JOURNAL_NOT_ACTIVE` if journaling is disabled;
/// this crate never creates or alters a journal.
pub fn query(volume: &Volume) -> UsnResult<JournalInfo> {
    let mut journal_data = USN_JOURNAL_DATA_V0::default();
    let mut bytes_returned = 0u32;

    if let Err(err) = unsafe {
        DeviceIoControl(
            volume.handle,
            FSCTL_QUERY_USN_JOURNAL,
            None,
            0,
            Some(&mut journal_data as *mut _ as *mut c_void),
            size_of::<USN_JOURNAL_DATA_V0>() as u32,
            Some(&mut bytes_returned),
            None,
        )
    } {
        warn!("Error querying USN journal: {}", err);
        if err.code() == ERROR_ACCESS_DENIED.to_hresult() {
            return Err(UsnError::PermissionError);
        }
        return Err(err.into());
    }

    debug!("USN journal data: {:#?}", journal_data);
    Ok(JournalInfo {
        journal_id: journal_data.UsnJournalID,
        first_usn: journal_data.FirstUsn,
        next_usn: journal_data.NextUsn,
        lowest_valid_usn: journal_data.LowestValidUsn,
        max_usn: journal_data.MaxUsn,
        maximum_size: journal_data.MaximumSize,
        allocation_delta: journal_data.AllocationDelta,
    })
}

/// The change journal of an open volume.
#[derive(Debug)]
pub struct VolumeJournal<'a> {
    volume: &'a Volume,
    info: JournalInfo,
}

impl<'a> VolumeJournal<'a> {
    pub fn new(volume: &'a Volume) -> UsnResult<Self> {
        let info = query(volume)?;
        Ok(VolumeJournal { volume, info })
    }

    pub fn info(&self) -> &JournalInfo {
        &self.info
    }

    /// Returns an iterator over every record still held by the journal.
    pub fn iter(&self) -> VolumeJournalIter<'_> {
        self.iter_with_options(JournalOptions::default())
    }

    /// `start_usn`, `reason_mask` and `only_on_close` are handed to the file system;
    /// `buffer_size` sizes each read.
    pub fn iter_with_options(&self, options: JournalOptions) -> VolumeJournalIter<'_> {
        VolumeJournalIter {
            journal: self,
            buffer: vec![0u8; options.buffer_size.max(size_of::<Usn>() + 1)],
            pending: VecDeque::new(),
            next_start_usn: options.start_usn,
            options,
            finished: false,
        }
    }
}

/// Iterate over live journal records.
pub struct VolumeJournalIter<'a> {
    journal: &'a VolumeJournal<'a>,
    buffer: Vec<u8>,
    pending: VecDeque<UsnResult<UsnRecord>>,
    next_start_usn: Usn,
    options: JournalOptions,
    finished: bool,
}

impl VolumeJournalIter<'_> {
    /// Read the next chunk of journal data into the buffer.
    ///
    /// Returns the number of bytes read, or `None` at the end of the journal.
    fn get_data(&mut self) -> UsnResult<Option<usize>> {
        let read_data = READ_USN_JOURNAL_DATA_V1 {
            StartUsn: self.next_start_usn,
            ReasonMask: self.options.reason_mask.bits(),
            ReturnOnlyOnClose: self.options.only_on_close as u32,
            Timeout: 0,
            BytesToWaitFor: 0,
            UsnJournalID: self.journal.info.journal_id,
            MinMajorVersion: 2,
            MaxMajorVersion: 3,
        };
        let mut bytes_read = 0u32;

        if let Err(err) = unsafe {
            DeviceIoControl(
                self.journal.volume.handle,
                FSCTL_READ_USN_JOURNAL,
                Some(&read_data as *const _ as *const c_void),
                size_of::<READ_USN_JOURNAL_DATA_V1>() as u32,
                Some(self.buffer.as_mut_ptr() as *mut c_void),
                self.buffer.len() as u32,
                Some(&mut bytes_read),
                None,
            )
        } {
            if err.code() == ERROR_HANDLE_EOF.to_hresult() {
                return Ok(None);
            }

            warn!("Error reading USN data: {}", err);
            return Err(err.into());
        }

        Ok(Some(bytes_read as usize))
    }

    /// Decode the next buffer of records. Returns false when the journal has no more.
    fn refill(&mut self) -> UsnResult<bool> {
        let Some(bytes_read) = self.get_data()? else {
            return Ok(false);
        };

        // https://learn.microsoft.com/en-us/windows/win32/fileio/walking-a-buffer-of-change-journal-records
        // The buffer starts with the USN to continue reading from.
        let data = self.buffer.get(..bytes_read).unwrap_or_default();
        self.next_start_usn = ByteReader::new(data).read_i64(0)?;

        let records = data.get(size_of::<Usn>()..).unwrap_or_default();
        if records.is_empty() {
            return Ok(false);
        }

        self.pending.extend(UsnJournal::new(records).iter());
        Ok(true)
    }
}

impl Iterator for VolumeJournalIter<'_> {
    type Item = UsnResult<UsnRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        while self.pending.is_empty() {
            match self.refill() {
                Ok(true) => {}
                Ok(false) => {
                    self.finished = true;
                    return None;
                }
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }

        let item = self.pending.pop_front()?;
        if item.is_err() {
            self.finished = true;
            self.pending.clear();
        }
        Some(item)
    }
}
