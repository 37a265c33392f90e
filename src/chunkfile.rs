//! The chunk-file binary container.
//!
//! A chunk file packs any number of typed payloads behind a fixed header
//! and a table of contents. The same container is used for intermediate
//! artifacts on disk and for compiler outputs in flight. All fields are
//! little-endian; offsets and sizes are 32-bit, so a single file cannot
//! exceed 4 GiB.

use crate::{
    error::{AssetError, Result},
    utils, VersionInfo,
};
use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

/// `"XLE~"` as a little-endian u32.
pub const MAGIC: u32 = 0x7E45_4C58;
pub const FILE_VERSION: u32 = 0;

/// Type id marking an unused table slot.
pub const TYPE_ID_UNKNOWN: u64 = 0;

/// The main artifact bundle of a compile request.
pub const CHUNK_TYPE_MULTI: u64 = utils::hash64(b"MultiChunk");
/// Metrics reports are stored as side files next to the main bundle.
pub const CHUNK_TYPE_METRICS: u64 = utils::hash64(b"Metrics");
/// Compiler log output, also a side file.
pub const CHUNK_TYPE_LOG: u64 = utils::hash64(b"Log");

pub const NAME_LEN: usize = 32;
const VERSION_FIELD_LEN: usize = 64;

/// Size of the file header on disk.
pub const FILE_HEADER_SIZE: u64 = 4 + 4 + 64 + 64 + 4;
/// Size of one table record on disk.
pub const CHUNK_HEADER_SIZE: u64 = 8 + 4 + 32 + 4 + 4;

/// One chunk produced by a compile operation, ready to be written into a
/// chunk file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedArtifact {
    pub type_id: u64,
    pub version: u32,
    pub name: String,
    pub data: Vec<u8>,
}

/// One table record of a chunk file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    pub type_id: u64,
    pub chunk_version: u32,
    pub name: [u8; NAME_LEN],
    pub file_offset: u32,
    pub size: u32,
}

impl ChunkHeader {
    pub fn name(&self) -> String {
        utils::from_padded(&self.name)
    }

    fn write_to(&self, out: &mut impl Write) -> io::Result<()> {
        out.write_all(&self.type_id.to_le_bytes())?;
        out.write_all(&self.chunk_version.to_le_bytes())?;
        out.write_all(&self.name)?;
        out.write_all(&self.file_offset.to_le_bytes())?;
        out.write_all(&self.size.to_le_bytes())
    }

    fn read_from(reader: &mut impl Read) -> io::Result<Self> {
        Ok(Self {
            type_id: read_u64(reader)?,
            chunk_version: read_u32(reader)?,
            name: read_array(reader)?,
            file_offset: read_u32(reader)?,
            size: read_u32(reader)?,
        })
    }
}

/// A parsed table of contents plus the build info recorded by the writer.
#[derive(Clone, Debug)]
pub struct ChunkTable {
    pub build_version: String,
    pub build_date: String,
    pub chunks: Vec<ChunkHeader>,
}

fn write_file_header(
    out: &mut impl Write,
    chunk_count: u32,
    version: &VersionInfo,
) -> io::Result<()> {
    out.write_all(&MAGIC.to_le_bytes())?;
    out.write_all(&FILE_VERSION.to_le_bytes())?;
    out.write_all(&utils::copy_padded::<VERSION_FIELD_LEN>(&version.version))?;
    out.write_all(&utils::copy_padded::<VERSION_FIELD_LEN>(&version.build_date))?;
    out.write_all(&chunk_count.to_le_bytes())
}

/// Writes a complete chunk file in one pass: header, table, then every
/// payload in table order. Chunks failing the predicate are left out
/// entirely. Offsets are computed while the table is emitted.
pub fn build_chunk_file<W: Write>(
    out: &mut W,
    chunks: &[SerializedArtifact],
    version: &VersionInfo,
    predicate: impl Fn(&SerializedArtifact) -> bool,
) -> io::Result<()> {
    let selected = chunks.iter().filter(|c| predicate(c)).collect::<Vec<_>>();
    let count = u32::try_from(selected.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many chunks"))?;
    write_file_header(out, count, version)?;

    let mut tracking_offset = FILE_HEADER_SIZE + CHUNK_HEADER_SIZE * count as u64;
    for chunk in &selected {
        let size = chunk_size(&chunk.data)?;
        let header = ChunkHeader {
            type_id: chunk.type_id,
            chunk_version: chunk.version,
            name: utils::copy_padded(&chunk.name),
            file_offset: file_offset(tracking_offset)?,
            size,
        };
        header.write_to(out)?;
        tracking_offset += size as u64;
    }

    for chunk in &selected {
        out.write_all(&chunk.data)?;
    }
    Ok(())
}

/// Reads and verifies the file header, then the whole table of contents.
pub fn load_chunk_table<R: Read>(reader: &mut R, path: &Path) -> Result<ChunkTable> {
    let wrap = |err: io::Error| match err.kind() {
        io::ErrorKind::UnexpectedEof => AssetError::Format {
            path: path.to_path_buf(),
            message: "incomplete chunk file header".into(),
        },
        _ => AssetError::io(err, path),
    };

    let magic = read_u32(reader).map_err(wrap)?;
    if magic != MAGIC {
        return Err(AssetError::Format {
            path: path.to_path_buf(),
            message: "unrecognised format".into(),
        });
    }
    let file_version = read_u32(reader).map_err(wrap)?;
    if file_version != FILE_VERSION {
        return Err(AssetError::UnsupportedVersion {
            path: path.to_path_buf(),
            expected: FILE_VERSION,
            actual: file_version,
        });
    }

    let build_version: [u8; VERSION_FIELD_LEN] = read_array(reader).map_err(wrap)?;
    let build_date: [u8; VERSION_FIELD_LEN] = read_array(reader).map_err(wrap)?;
    let chunk_count = read_u32(reader).map_err(wrap)?;

    let mut chunks = Vec::with_capacity(chunk_count.min(1024) as usize);
    for _ in 0..chunk_count {
        chunks.push(ChunkHeader::read_from(reader).map_err(wrap)?);
    }

    Ok(ChunkTable {
        build_version: utils::from_padded(&build_version),
        build_date: utils::from_padded(&build_date),
        chunks,
    })
}

/// Finds the first chunk of the given type. A version mismatch is reported
/// as `UnsupportedVersion` so callers can rebuild instead of aborting.
pub fn find_chunk<'a>(
    path: &Path,
    table: &'a ChunkTable,
    type_id: u64,
    expected_version: u32,
) -> Result<&'a ChunkHeader> {
    let chunk = table
        .chunks
        .iter()
        .find(|c| c.type_id == type_id)
        .ok_or_else(|| AssetError::MissingChunk { path: path.to_path_buf(), type_id })?;
    if chunk.chunk_version != expected_version {
        return Err(AssetError::UnsupportedVersion {
            path: path.to_path_buf(),
            expected: expected_version,
            actual: chunk.chunk_version,
        });
    }
    Ok(chunk)
}

/// Reads a single chunk's payload straight from a chunk file on disk.
pub fn read_chunk(path: &Path, type_id: u64, expected_version: u32) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => AssetError::FileNotFound(path.to_path_buf()),
        _ => AssetError::io(err, path),
    })?;
    let table = load_chunk_table(&mut file, path)?;
    let header = find_chunk(path, &table, type_id, expected_version)?.clone();

    let mut buffer = vec![0u8; header.size as usize];
    file.seek(SeekFrom::Start(header.file_offset as u64))
        .map_err(|err| AssetError::io(err, path))?;
    file.read_exact(&mut buffer).map_err(|err| AssetError::io(err, path))?;
    Ok(buffer)
}

struct ActiveChunk {
    header: ChunkHeader,
    start: u64,
}

/// Streaming chunk-file writer for compilers that produce output
/// incrementally. The full table is reserved up front; `begin_chunk`
/// starts the next payload and `finish_current_chunk` seeks back to patch
/// the reserved slot. The sink must therefore be seekable.
pub struct ChunkFileWriter<W: Write + Seek> {
    sink: W,
    chunk_count: u32,
    next_index: u32,
    active: Option<ActiveChunk>,
    /// Set when an I/O error left the table in an unknown state; disables
    /// the completeness assertion on drop.
    poisoned: bool,
}

impl<W: Write + Seek> ChunkFileWriter<W> {
    /// Writes the file header and a zeroed table sized for `chunk_count`
    /// chunks.
    pub fn new(mut sink: W, chunk_count: u32, version: &VersionInfo) -> io::Result<Self> {
        write_file_header(&mut sink, chunk_count, version)?;
        let empty = ChunkHeader {
            type_id: TYPE_ID_UNKNOWN,
            chunk_version: 0,
            name: [0; NAME_LEN],
            file_offset: 0,
            size: 0,
        };
        for _ in 0..chunk_count {
            empty.write_to(&mut sink)?;
        }
        Ok(Self { sink, chunk_count, next_index: 0, active: None, poisoned: false })
    }

    pub fn begin_chunk(&mut self, type_id: u64, version: u32, name: &str) -> io::Result<()> {
        if self.active.is_some() {
            self.finish_current_chunk()?;
        }
        if self.next_index >= self.chunk_count {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "more chunks begun than table slots reserved",
            ));
        }
        let start = match self.sink.stream_position() {
            Ok(start) => start,
            Err(err) => {
                self.poisoned = true;
                return Err(err);
            }
        };
        self.active = Some(ActiveChunk {
            header: ChunkHeader {
                type_id,
                chunk_version: version,
                name: utils::copy_padded(name),
                file_offset: file_offset(start)?,
                size: 0,
            },
            start,
        });
        Ok(())
    }

    pub fn finish_current_chunk(&mut self) -> io::Result<()> {
        let Some(mut active) = self.active.take() else {
            return Ok(());
        };
        match self.patch_reserved_slot(&mut active) {
            Ok(()) => {
                self.next_index += 1;
                Ok(())
            }
            Err(err) => {
                self.poisoned = true;
                Err(err)
            }
        }
    }

    fn patch_reserved_slot(&mut self, active: &mut ActiveChunk) -> io::Result<()> {
        let end = self.sink.stream_position()?;
        active.header.size = u32::try_from(end.saturating_sub(active.start))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "chunk exceeds 4 GiB"))?;
        let slot = FILE_HEADER_SIZE + self.next_index as u64 * CHUNK_HEADER_SIZE;
        self.sink.seek(SeekFrom::Start(slot))?;
        active.header.write_to(&mut self.sink)?;
        self.sink.seek(SeekFrom::Start(end))?;
        Ok(())
    }

    /// Finishes any active chunk and flushes the sink. Every reserved
    /// table slot must have been used.
    pub fn finish(mut self) -> io::Result<()> {
        self.finish_current_chunk()?;
        self.sink.flush()?;
        debug_assert_eq!(
            self.next_index, self.chunk_count,
            "chunk file finished with unused table slots"
        );
        Ok(())
    }
}

impl<W: Write + Seek> Write for ChunkFileWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

impl<W: Write + Seek> Drop for ChunkFileWriter<W> {
    fn drop(&mut self) {
        if !std::thread::panicking() && !self.poisoned {
            if self.active.is_some() {
                let _ = self.finish_current_chunk();
            }
            debug_assert_eq!(
                self.next_index, self.chunk_count,
                "chunk file writer dropped with unfinished table slots"
            );
        }
    }
}

fn chunk_size(data: &[u8]) -> io::Result<u32> {
    u32::try_from(data.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "chunk exceeds 4 GiB"))
}

fn file_offset(offset: u64) -> io::Result<u32> {
    u32::try_from(offset)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "chunk file exceeds 4 GiB"))
}

fn read_u32(reader: &mut impl Read) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_array(reader)?))
}

fn read_u64(reader: &mut impl Read) -> io::Result<u64> {
    Ok(u64::from_le_bytes(read_array(reader)?))
}

fn read_array<const N: usize>(reader: &mut impl Read) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn version() -> VersionInfo {
        VersionInfo { version: "test-build".into(), build_date: "today".into() }
    }

    fn sample_chunks() -> Vec<SerializedArtifact> {
        vec![
            SerializedArtifact {
                type_id: 0x10,
                version: 1,
                name: "skin".into(),
                data: b"payload one".to_vec(),
            },
            SerializedArtifact {
                type_id: 0x20,
                version: 3,
                name: "skeleton".into(),
                data: b"p2".to_vec(),
            },
        ]
    }

    fn read_payload(bytes: &[u8], header: &ChunkHeader) -> Vec<u8> {
        bytes[header.file_offset as usize..(header.file_offset + header.size) as usize].to_vec()
    }

    #[test]
    fn batch_round_trip() {
        let chunks = sample_chunks();
        let mut bytes = Vec::new();
        build_chunk_file(&mut bytes, &chunks, &version(), |_| true).unwrap();

        let table = load_chunk_table(&mut Cursor::new(&bytes), Path::new("t.chunk")).unwrap();
        assert_eq!(table.build_version, "test-build");
        assert_eq!(table.chunks.len(), 2);
        for (chunk, header) in chunks.iter().zip(&table.chunks) {
            assert_eq!(header.type_id, chunk.type_id);
            assert_eq!(header.chunk_version, chunk.version);
            assert_eq!(header.name(), chunk.name);
            assert_eq!(read_payload(&bytes, header), chunk.data);
        }
    }

    #[test]
    fn offsets_are_contiguous() {
        let chunks = sample_chunks();
        let mut bytes = Vec::new();
        build_chunk_file(&mut bytes, &chunks, &version(), |_| true).unwrap();
        let table = load_chunk_table(&mut Cursor::new(&bytes), Path::new("t.chunk")).unwrap();

        let table_end = (FILE_HEADER_SIZE + 2 * CHUNK_HEADER_SIZE) as u32;
        assert_eq!(table.chunks[0].file_offset, table_end);
        assert_eq!(
            table.chunks[1].file_offset,
            table.chunks[0].file_offset + table.chunks[0].size
        );
        assert_eq!(bytes.len() as u32, table.chunks[1].file_offset + table.chunks[1].size);
    }

    #[test]
    fn predicate_filters_chunks() {
        let chunks = sample_chunks();
        let mut bytes = Vec::new();
        build_chunk_file(&mut bytes, &chunks, &version(), |c| c.type_id == 0x20).unwrap();
        let table = load_chunk_table(&mut Cursor::new(&bytes), Path::new("t.chunk")).unwrap();
        assert_eq!(table.chunks.len(), 1);
        assert_eq!(table.chunks[0].type_id, 0x20);
    }

    #[test]
    fn bad_magic_is_a_format_error() {
        let mut bytes = Vec::new();
        build_chunk_file(&mut bytes, &sample_chunks(), &version(), |_| true).unwrap();
        bytes[0] ^= 0xff;
        let err = load_chunk_table(&mut Cursor::new(&bytes), Path::new("t.chunk")).unwrap_err();
        assert!(matches!(err, AssetError::Format { .. }), "{err}");
    }

    #[test]
    fn version_mismatch_is_distinct() {
        let chunks = sample_chunks();
        let mut bytes = Vec::new();
        build_chunk_file(&mut bytes, &chunks, &version(), |_| true).unwrap();
        let table = load_chunk_table(&mut Cursor::new(&bytes), Path::new("t.chunk")).unwrap();

        assert!(find_chunk(Path::new("t.chunk"), &table, 0x10, 1).is_ok());
        let err = find_chunk(Path::new("t.chunk"), &table, 0x10, 2).unwrap_err();
        assert!(matches!(err, AssetError::UnsupportedVersion { expected: 2, actual: 1, .. }));
        let err = find_chunk(Path::new("t.chunk"), &table, 0x99, 1).unwrap_err();
        assert!(matches!(err, AssetError::MissingChunk { type_id: 0x99, .. }));
    }

    #[test]
    fn read_chunk_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.chunk");
        let chunks = sample_chunks();
        let mut file = std::fs::File::create(&path).unwrap();
        build_chunk_file(&mut file, &chunks, &version(), |_| true).unwrap();
        drop(file);

        assert_eq!(read_chunk(&path, 0x10, 1).unwrap(), b"payload one");
        let err = read_chunk(&dir.path().join("absent.chunk"), 0x10, 1).unwrap_err();
        assert!(matches!(err, AssetError::FileNotFound(_)));
    }

    #[test]
    fn long_names_are_truncated() {
        let chunks = vec![SerializedArtifact {
            type_id: 1,
            version: 0,
            name: "x".repeat(NAME_LEN + 10),
            data: Vec::new(),
        }];
        let mut bytes = Vec::new();
        build_chunk_file(&mut bytes, &chunks, &version(), |_| true).unwrap();
        let table = load_chunk_table(&mut Cursor::new(&bytes), Path::new("t.chunk")).unwrap();
        assert_eq!(table.chunks[0].name(), "x".repeat(NAME_LEN));
    }

    #[test]
    fn streaming_writer_matches_batch_output() {
        let chunks = sample_chunks();
        let mut batch = Vec::new();
        build_chunk_file(&mut batch, &chunks, &version(), |_| true).unwrap();

        let mut streamed = Cursor::new(Vec::new());
        let mut writer = ChunkFileWriter::new(&mut streamed, 2, &version()).unwrap();
        for chunk in &chunks {
            writer.begin_chunk(chunk.type_id, chunk.version, &chunk.name).unwrap();
            // split the payload to exercise incremental writes
            let (a, b) = chunk.data.split_at(chunk.data.len() / 2);
            writer.write_all(a).unwrap();
            writer.write_all(b).unwrap();
        }
        writer.finish().unwrap();
        assert_eq!(streamed.into_inner(), batch);
    }

    #[test]
    #[should_panic(expected = "unfinished table slots")]
    fn dropping_with_unused_slots_asserts() {
        let mut sink = Cursor::new(Vec::new());
        let writer = ChunkFileWriter::new(&mut sink, 2, &version()).unwrap();
        drop(writer);
    }
}
