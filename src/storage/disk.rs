//! Whole-page file I/O.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::storage::page::{PageNo, PAGE_SIZE};

/// File name suffix for the page file.
pub const DB_SUFFIX: &str = ".db";

/// Random-access page storage over a single file.
///
/// Pages are numbered from 1; page n lives at byte offset (n-1) * 8192.
pub struct PageFile {
    file: Mutex<File>,
}

impl PageFile {
    pub fn create(path: &Path) -> Result<PageFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(db_path(path))?;
        Ok(PageFile {
            file: Mutex::new(file),
        })
    }

    pub fn open(path: &Path) -> Result<PageFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(db_path(path))?;
        Ok(PageFile {
            file: Mutex::new(file),
        })
    }

    /// Reads page `no` into `buf`. Reading past the end of the file is a
    /// caller addressing error, reported as `NotFound`.
    pub fn read_page(&self, no: PageNo, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        let mut file = self.file.lock();
        let offset = page_offset(no);
        if offset + PAGE_SIZE as u64 > file.metadata()?.len() {
            return Err(Error::NotFound);
        }
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Writes page `no` synchronously, extending the file if needed.
    pub fn write_page(&self, no: PageNo, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_offset(no)))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    /// Number of whole pages currently in the file.
    pub fn page_count(&self) -> Result<u32> {
        let file = self.file.lock();
        Ok((file.metadata()?.len() / PAGE_SIZE as u64) as u32)
    }

    /// Shrinks (or grows) the file to exactly `count` pages.
    pub fn truncate(&self, count: u32) -> Result<()> {
        let file = self.file.lock();
        file.set_len(count as u64 * PAGE_SIZE as u64)?;
        file.sync_data()?;
        Ok(())
    }
}

fn db_path(path: &Path) -> std::path::PathBuf {
    let mut p = path.as_os_str().to_os_string();
    p.push(DB_SUFFIX);
    p.into()
}

fn page_offset(no: PageNo) -> u64 {
    (no.0 as u64 - 1) * PAGE_SIZE as u64
}
