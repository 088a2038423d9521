//! The write-ahead log.
//!
//! File layout: `[running checksum:4][frame][frame]...`, where each frame is
//! `[size:4][checksum:4][payload]`. The per-frame checksum covers the
//! payload; the running header checksum folds every whole frame appended so
//! far and is rewritten (and synced) after each append, so an append that
//! has returned is durable.
//!
//! On open the log is scanned front to back. A torn tail from an unclean
//! shutdown (a partial trailing frame, or a final complete frame the header
//! never acknowledged) is truncated away; at most one appended record is
//! lost. Any other mismatch is corruption and refuses to open.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// File name suffix for the log file.
pub const LOG_SUFFIX: &str = ".log";

const SEED: u32 = 13331;
const HEADER_LEN: u64 = 4;
const FRAME_HEADER_LEN: u64 = 8;

/// Folds `data` into a rolling checksum.
pub fn checksum(mut acc: u32, data: &[u8]) -> u32 {
    for &b in data {
        acc = acc.wrapping_mul(SEED).wrapping_add(b as u32);
    }
    acc
}

struct WalInner {
    file: File,
    header: u32,
    size: u64,
    // Sequential read cursor used by recovery.
    position: u64,
}

/// Append-only checksummed log over a single file.
pub struct Wal {
    inner: Mutex<WalInner>,
}

enum ScanStop {
    CleanEof,
    TruncatedFrame,
    BadChecksum,
}

impl Wal {
    /// Creates a fresh log at `<path>.log` with a zeroed header.
    pub fn create(path: &Path) -> Result<Wal> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(log_path(path))?;

        file.write_u32::<LittleEndian>(0)?;
        file.sync_all()?;

        Ok(Wal {
            inner: Mutex::new(WalInner {
                file,
                header: 0,
                size: HEADER_LEN,
                position: HEADER_LEN,
            }),
        })
    }

    /// Opens an existing log, dropping a torn tail if one is present.
    pub fn open(path: &Path) -> Result<Wal> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(log_path(path))?;

        let size = file.metadata()?.len();
        if size < HEADER_LEN {
            return Err(Error::CorruptLog);
        }
        file.seek(SeekFrom::Start(0))?;
        let header = file.read_u32::<LittleEndian>()?;

        let (acc, acc_prev, end, end_prev, stop) = scan(&mut file, size)?;

        let (keep_end, new_header) = if header == acc {
            (end, header)
        } else if let (Some(prev_acc), Some(prev_end)) = (acc_prev, end_prev) {
            if header == prev_acc {
                // The final frame was appended but its header write was lost;
                // the append never returned, so the record was never owed.
                (prev_end, header)
            } else if matches!(stop, ScanStop::TruncatedFrame) {
                // Header ran ahead of a torn final frame.
                (end, acc)
            } else {
                return Err(Error::CorruptLog);
            }
        } else if matches!(stop, ScanStop::TruncatedFrame) {
            (end, acc)
        } else {
            return Err(Error::CorruptLog);
        };

        if keep_end < size {
            log::info!(
                "dropping {} bytes of torn log tail",
                size - keep_end
            );
            file.set_len(keep_end)?;
        }
        if new_header != header {
            file.seek(SeekFrom::Start(0))?;
            file.write_u32::<LittleEndian>(new_header)?;
        }
        file.sync_data()?;

        Ok(Wal {
            inner: Mutex::new(WalInner {
                file,
                header: new_header,
                size: keep_end,
                position: HEADER_LEN,
            }),
        })
    }

    /// Appends one record; durable (frame and header synced) on return.
    pub fn append(&self, payload: &[u8]) -> Result<()> {
        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN as usize + payload.len());
        frame.put_u32_le(payload.len() as u32);
        frame.put_u32_le(checksum(0, payload));
        frame.put_slice(payload);

        let mut inner = self.inner.lock();
        let end = inner.size;
        inner.file.seek(SeekFrom::Start(end))?;
        inner.file.write_all(&frame)?;
        inner.size += frame.len() as u64;

        inner.header = checksum(inner.header, &frame);
        let header = inner.header;
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_u32::<LittleEndian>(header)?;
        inner.file.sync_data()?;

        Ok(())
    }

    /// Resets the sequential cursor to the first record.
    pub fn rewind(&self) {
        self.inner.lock().position = HEADER_LEN;
    }

    /// Returns the next record payload, or `None` at end of log.
    pub fn next(&self) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        let pos = inner.position;
        let size = inner.size;
        match read_frame(&mut inner.file, pos, size)? {
            Some((payload, frame_len)) => {
                inner.position += frame_len;
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }
}

/// Reads and validates the frame at `pos`, returning its payload and total
/// length. `None` if no complete valid frame starts there.
fn read_frame(file: &mut File, pos: u64, size: u64) -> Result<Option<(Vec<u8>, u64)>> {
    if pos + FRAME_HEADER_LEN > size {
        return Ok(None);
    }

    let mut head = [0u8; FRAME_HEADER_LEN as usize];
    file.seek(SeekFrom::Start(pos))?;
    file.read_exact(&mut head)?;
    let mut buf = &head[..];
    let len = buf.get_u32_le() as u64;
    let expected = buf.get_u32_le();

    if pos + FRAME_HEADER_LEN + len > size {
        return Ok(None);
    }

    let mut payload = vec![0u8; len as usize];
    file.read_exact(&mut payload)?;
    if checksum(0, &payload) != expected {
        return Ok(None);
    }

    Ok(Some((payload, FRAME_HEADER_LEN + len)))
}

/// Walks all structurally valid frames, folding whole frames into the
/// running checksum. Returns the checksum and end offset after the last
/// valid frame, the same pair one frame earlier, and why the walk stopped.
fn scan(
    file: &mut File,
    size: u64,
) -> Result<(u32, Option<u32>, u64, Option<u64>, ScanStop)> {
    let mut acc = 0u32;
    let mut acc_prev = None;
    let mut pos = HEADER_LEN;
    let mut pos_prev = None;

    loop {
        match read_frame(file, pos, size)? {
            Some((payload, frame_len)) => {
                let mut frame = BytesMut::with_capacity(frame_len as usize);
                frame.put_u32_le(payload.len() as u32);
                frame.put_u32_le(checksum(0, &payload));
                frame.put_slice(&payload);

                acc_prev = Some(acc);
                pos_prev = Some(pos);
                acc = checksum(acc, &frame);
                pos += frame_len;
            }
            None => {
                let stop = if pos == size {
                    ScanStop::CleanEof
                } else if pos + FRAME_HEADER_LEN > size {
                    ScanStop::TruncatedFrame
                } else {
                    // Re-read the declared length to classify the stop.
                    let mut head = [0u8; 4];
                    file.seek(SeekFrom::Start(pos))?;
                    file.read_exact(&mut head)?;
                    let len = u32::from_le_bytes(head) as u64;
                    if pos + FRAME_HEADER_LEN + len > size {
                        ScanStop::TruncatedFrame
                    } else {
                        ScanStop::BadChecksum
                    }
                };
                return Ok((acc, acc_prev, pos, pos_prev, stop));
            }
        }
    }
}

fn log_path(path: &Path) -> std::path::PathBuf {
    let mut p = path.as_os_str().to_os_string();
    p.push(LOG_SUFFIX);
    p.into()
}
