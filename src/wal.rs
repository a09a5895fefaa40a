use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// File header; a log without it is rejected rather than misread.
const MAGIC: &[u8; 8] = b"SHELFWL1";

/// Encode a single event to `[len][bincode][crc32]`.
fn encode_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read one record. `Ok(None)` on a clean end of file or a torn/corrupt tail.
fn decode_record(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Some((event, (len + 8) as u64))),
        Err(_) => Ok(None),
    }
}

/// `read_exact` that reports EOF as `false` instead of an error.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn write_header(writer: &mut impl Write) -> io::Result<()> {
    writer.write_all(MAGIC)
}

/// Events recovered from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Bytes of intact log, header included.
    pub valid_len: u64,
    /// Bytes dropped after the last intact record.
    pub discarded: u64,
}

/// Append-only write-ahead log of circulation events.
///
/// Layout: `MAGIC` then records of `[u32 len][bincode Event][u32 crc32]`.
/// A torn last record (crash mid-write) is cut off when the log is reopened,
/// so new appends never land behind garbage.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Replay the log at `path`, trim any torn tail, and open it for appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let replay = Self::replay(path)?;
        if replay.discarded > 0 {
            tracing::warn!(
                "{}: discarding {} bytes of torn or corrupt log tail",
                path.display(),
                replay.discarded
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        let wal = Self::open(path)?;
        Ok((wal, replay.events))
    }

    /// Open (or create) the log at `path` for appending.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let fresh = file.metadata()?.len() == 0;
        let mut writer = BufWriter::new(file);
        if fresh {
            write_header(&mut writer)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync one event. Tests only; the engine batches through
    /// `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_record(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Rewrite the log as `snapshot` and swap it in atomically.
    pub fn compact(&mut self, snapshot: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            write_header(&mut writer)?;
            for event in snapshot {
                encode_record(&mut writer, event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        // Buffered appends belong to the old file; push them out before it is replaced.
        self.writer.flush()?;
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Read every intact event from `path` without modifying the file.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        if file_len == 0 {
            return Ok(Replay::default());
        }
        let mut reader = BufReader::new(file);

        let mut header = [0u8; 8];
        if !read_full(&mut reader, &mut header)? || &header != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a shelfd log", path.display()),
            ));
        }

        let mut replay = Replay {
            valid_len: MAGIC.len() as u64,
            ..Replay::default()
        };
        while let Some((event, record_len)) = decode_record(&mut reader)? {
            replay.events.push(event);
            replay.valid_len += record_len;
        }
        replay.discarded = file_len - replay.valid_len;
        Ok(replay)
    }
}
