//! The forensic pager.
//!
//! Unlike an engine pager there is no cache, no journal, and no write path:
//! every `read_page` call returns a fresh buffer so that recursive walkers
//! can hold a parent's page across a child read. The page bound is derived
//! from the file size, never from the header's page count, which on a
//! damaged database is exactly the kind of field that lies.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use pagesleuth_error::{Result, SleuthError};
use pagesleuth_types::{DATABASE_HEADER_SIZE, DatabaseHeader, HeaderError, PageNumber, PageSize};
use tracing::debug;

/// Read-only access to the database file, with the parsed header and the
/// file-size-derived page bound.
#[derive(Debug)]
pub struct Pager {
    file: File,
    path: PathBuf,
    header: DatabaseHeader,
    max_page: u32,
}

impl Pager {
    /// Open a database file read-only and parse its header.
    ///
    /// Fails when the file cannot be opened, is shorter than the 100-byte
    /// header, does not carry the SQLite magic, or declares a page size
    /// that is not a power of two in \[512, 65536\].
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).map_err(|_| SleuthError::CannotOpen {
            path: path.clone(),
        })?;

        let file_size = file.metadata()?.len();
        if file_size < DATABASE_HEADER_SIZE as u64 {
            return Err(SleuthError::InvalidHeader {
                detail: format!("file is only {file_size} bytes, header needs 100"),
            });
        }

        let mut header_buf = [0u8; DATABASE_HEADER_SIZE];
        file.read_exact(&mut header_buf)?;

        let header = DatabaseHeader::from_bytes(&header_buf).map_err(|e| match e {
            HeaderError::InvalidMagic => SleuthError::NotSqlite { path: path.clone() },
            other => SleuthError::InvalidHeader {
                detail: other.to_string(),
            },
        })?;

        let page_size = u64::from(header.page_size.get());
        let max_page = u32::try_from(file_size.div_ceil(page_size)).map_err(|_| {
            SleuthError::InvalidHeader {
                detail: format!("file size {file_size} implies more than u32::MAX pages"),
            }
        })?;

        debug!(
            path = %path.display(),
            page_size = header.page_size.get(),
            max_page,
            header_page_count = header.page_count,
            "opened database"
        );

        Ok(Self {
            file,
            path,
            header,
            max_page,
        })
    }

    /// The parsed database header.
    pub const fn header(&self) -> &DatabaseHeader {
        &self.header
    }

    /// Path this pager reads from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Page size in bytes.
    pub const fn page_size(&self) -> PageSize {
        self.header.page_size
    }

    /// Usable bytes per page (page size minus reserved space).
    pub const fn usable_size(&self) -> u32 {
        self.header.usable_size()
    }

    /// Highest valid page number, computed as `ceil(file_size / page_size)`.
    pub const fn max_page(&self) -> u32 {
        self.max_page
    }

    /// Whether a raw page number falls in `1..=max_page`.
    pub const fn in_range(&self, pgno: u32) -> bool {
        pgno >= 1 && pgno <= self.max_page
    }

    /// Read one page into a freshly allocated buffer.
    ///
    /// Rejects pages outside `1..=max_page`; a page that exists in range but
    /// is cut short by a truncated file is a [`SleuthError::ShortRead`].
    pub fn read_page(&mut self, pgno: PageNumber) -> Result<Vec<u8>> {
        if pgno.get() > self.max_page {
            return Err(SleuthError::PageOutOfRange {
                page: pgno.get(),
                max_page: self.max_page,
            });
        }

        let page_size = self.header.page_size.as_usize();
        let offset = u64::from(pgno.get() - 1) * page_size as u64;
        self.file.seek(SeekFrom::Start(offset))?;

        let mut buf = vec![0u8; page_size];
        let mut filled = 0usize;
        while filled < page_size {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(SleuthError::ShortRead {
                    page: pgno.get(),
                    expected: page_size,
                    actual: filled,
                });
            }
            filled += n;
        }

        Ok(buf)
    }

    /// Read a page addressed by a raw (untrusted) u32, range-checking first.
    pub fn read_raw_page(&mut self, pgno: u32) -> Result<Vec<u8>> {
        let pgno = PageNumber::new(pgno).ok_or(SleuthError::PageOutOfRange {
            page: 0,
            max_page: self.max_page,
        })?;
        self.read_page(pgno)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use pagesleuth_types::DATABASE_HEADER_MAGIC;

    fn minimal_db(page_size: u16, pages: u32) -> Vec<u8> {
        let ps = if page_size == 1 {
            65_536
        } else {
            usize::from(page_size)
        };
        let mut data = vec![0u8; ps * pages as usize];
        data[..16].copy_from_slice(DATABASE_HEADER_MAGIC);
        data[16..18].copy_from_slice(&page_size.to_be_bytes());
        data[21] = 64;
        data[22] = 32;
        data[23] = 32;
        data[28..32].copy_from_slice(&pages.to_be_bytes());
        data
    }

    fn write_temp(data: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mut f = File::create(&path).unwrap();
        f.write_all(data).unwrap();
        (dir, path)
    }

    #[test]
    fn open_and_read_pages() {
        let mut data = minimal_db(512, 3);
        data[512] = 0xAB; // first byte of page 2
        let (_dir, path) = write_temp(&data);

        let mut pager = Pager::open(&path).unwrap();
        assert_eq!(pager.page_size().get(), 512);
        assert_eq!(pager.max_page(), 3);

        let page2 = pager.read_page(PageNumber::new(2).unwrap()).unwrap();
        assert_eq!(page2.len(), 512);
        assert_eq!(page2[0], 0xAB);
    }

    #[test]
    fn rejects_out_of_range_page() {
        let (_dir, path) = write_temp(&minimal_db(512, 2));
        let mut pager = Pager::open(&path).unwrap();
        let err = pager.read_page(PageNumber::new(3).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            SleuthError::PageOutOfRange {
                page: 3,
                max_page: 2
            }
        ));
        assert!(matches!(
            pager.read_raw_page(0).unwrap_err(),
            SleuthError::PageOutOfRange { .. }
        ));
    }

    #[test]
    fn truncated_trailing_page_is_short_read() {
        let mut data = minimal_db(512, 3);
        data.truncate(512 * 2 + 100); // page 3 physically incomplete
        let (_dir, path) = write_temp(&data);

        let mut pager = Pager::open(&path).unwrap();
        // ceil still counts the partial page ...
        assert_eq!(pager.max_page(), 3);
        // ... but reading it reports the truncation.
        let err = pager.read_page(PageNumber::new(3).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            SleuthError::ShortRead {
                page: 3,
                expected: 512,
                actual: 100
            }
        ));
    }

    #[test]
    fn rejects_non_sqlite_file() {
        let (_dir, path) = write_temp(&[0x42u8; 4096]);
        assert!(matches!(
            Pager::open(&path).unwrap_err(),
            SleuthError::NotSqlite { .. }
        ));
    }

    #[test]
    fn rejects_tiny_file() {
        let (_dir, path) = write_temp(&[0u8; 40]);
        assert!(matches!(
            Pager::open(&path).unwrap_err(),
            SleuthError::InvalidHeader { .. }
        ));
    }

    #[test]
    fn rejects_missing_file() {
        assert!(matches!(
            Pager::open("/nonexistent/sleuth-test.db").unwrap_err(),
            SleuthError::CannotOpen { .. }
        ));
    }

    #[test]
    fn page_size_encoding_one_means_65536() {
        let (_dir, path) = write_temp(&minimal_db(1, 1));
        let pager = Pager::open(&path).unwrap();
        assert_eq!(pager.page_size().get(), 65_536);
        assert_eq!(pager.max_page(), 1);
    }
}
