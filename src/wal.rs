use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Outcome of reading a log back from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// A truncated or corrupt tail was found and ignored.
    pub discarded_tail: bool,
    /// Byte length of the intact prefix.
    pub valid_len: u64,
}

/// Append-only reservation log.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`. A crash can
/// only leave a partial last entry; replay drops it via the length prefix
/// and CRC check.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Cut the log back to its intact prefix so new appends are not stranded
    /// behind a torn frame.
    pub fn truncate_tail(path: &Path, valid_len: u64) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(valid_len)?;
        file.sync_all()
    }

    /// Append and fsync one event. Production code batches through
    /// `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write a snapshot to `<wal>.tmp` and fsync it. Slow phase.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(tmp_path(path))?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the log and reopen for appends. Fast phase.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Read every intact entry. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();

        loop {
            let mut len_buf = [0u8; 4];
            match read_frame_part(&mut reader, &mut len_buf)? {
                FramePart::Complete => {}
                FramePart::CleanEof => break,
                FramePart::Truncated => {
                    replay.discarded_tail = true;
                    break;
                }
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            let mut crc_buf = [0u8; 4];
            let complete = matches!(read_frame_part(&mut reader, &mut payload)?, FramePart::Complete)
                && matches!(read_frame_part(&mut reader, &mut crc_buf)?, FramePart::Complete);
            if !complete || u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                replay.discarded_tail = true;
                break;
            }

            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => {
                    replay.events.push(event);
                    replay.valid_len += (len + 8) as u64;
                }
                Err(_) => {
                    replay.discarded_tail = true;
                    break;
                }
            }
        }

        Ok(replay)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    path.with_extension("wal.tmp")
}

enum FramePart {
    Complete,
    CleanEof,
    Truncated,
}

fn read_frame_part(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<FramePart> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(FramePart::CleanEof),
            Ok(0) => return Ok(FramePart::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(FramePart::Complete)
}
