use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::model::Event;

/// Ledger of one tenant: an append-only file of framed events.
///
/// Frame layout: `[u32 le: len][bincode: Event][u32 le: crc32 of payload]`.
/// A frame cut short by a crash, or one whose checksum does not match, ends
/// replay; everything before it is kept.
pub struct Wal {
    writer: BufWriter<File>,
}

/// A length prefix above this is garbage, not a frame.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

fn frame(event: &Event) -> io::Result<Vec<u8>> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut buf = Vec::with_capacity(payload.len() + 8);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(buf)
}

/// Fill `buf` completely, or report `false` at a clean or torn end of file.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact payload, if any.
fn next_payload(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut word = [0u8; 4];
    if !fill(reader, &mut word)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !fill(reader, &mut payload)? || !fill(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(Some(payload))
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    /// Durable once this returns: the frame is flushed and fsynced.
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.writer.write_all(&frame(event)?)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Every intact event in `path`, in append order. A missing file is an
    /// empty ledger.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(scan(path)?.0)
    }

    /// Replay `path`, cut off any torn or corrupt tail, then open it for
    /// appending. New frames land directly after the last intact one, so a
    /// later replay never stops short of them.
    pub fn recover(path: &Path) -> io::Result<(Vec<Event>, Self)> {
        let (events, intact) = scan(path)?;
        if let Ok(meta) = std::fs::metadata(path)
            && meta.len() > intact
        {
            tracing::warn!(
                path = %path.display(),
                discarded_bytes = meta.len() - intact,
                "truncating torn wal tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(intact)?;
            file.sync_all()?;
        }
        Ok((events, Self::open(path)?))
    }
}

/// Intact events and the byte length they occupy.
fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let mut reader = match File::open(path) {
        Ok(f) => BufReader::new(f),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut events = Vec::new();
    let mut intact = 0u64;
    while let Some(payload) = next_payload(&mut reader)? {
        match bincode::deserialize::<Event>(&payload) {
            Ok(event) => events.push(event),
            Err(_) => break,
        }
        intact += payload.len() as u64 + 8;
    }
    Ok((events, intact))
}
