// ========================================================================================
//
//                         FILE-BACKED MEMORY ARENA
//
// ========================================================================================
//
// Every persisted matrix lives inside one arena file. The arena starts with a fixed
// identifier and a watermark recording how many data bytes have been allocated. Data
// bytes are addressed by `u64` offsets relative to the end of that preamble, so an
// arena can be grown, sealed and later re-opened memory-mapped without any pointer
// fix-ups.

use log::debug;
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Identifier written at the start of every arena file.
pub const IDENT: &[u8; 10] = b"KINCBINDAT";

/// Bytes occupied by the identifier plus the little-endian `u64` watermark.
pub const PREAMBLE_SIZE: u64 = IDENT.len() as u64 + 8;

#[derive(Debug, Error)]
pub enum FileMemError {
    #[error("{path}: not a KINC binary file")]
    InvalidFile { path: PathBuf },
    #[error("segmentation fault: access of {len} bytes at offset {addr} exceeds allocated size {head}")]
    SegFault { addr: u64, len: u64, head: u64 },
    #[error("out of memory: requested {requested} bytes with {available} available")]
    OutOfMemory { requested: u64, available: u64 },
    #[error("arena {path} is mapped read-only")]
    ReadOnly { path: PathBuf },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

enum Backing {
    File(File),
    Map(Mmap),
}

/// A growable region of a file, allocated front to back.
pub struct FileMem {
    path: PathBuf,
    backing: Backing,
    capacity: u64,
    next: u64,
}

impl FileMem {
    /// Creates (or truncates) an arena at `path` with zero capacity.
    pub fn create(path: &Path) -> Result<Self, FileMemError> {
        let io_err = io_context(path);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(&io_err)?;
        file.write_all(IDENT).map_err(&io_err)?;
        file.write_all(&0u64.to_le_bytes()).map_err(&io_err)?;
        debug!("created arena {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            backing: Backing::File(file),
            capacity: 0,
            next: 0,
        })
    }

    /// Opens an existing arena for reading and appending.
    pub fn open(path: &Path) -> Result<Self, FileMemError> {
        let io_err = io_context(path);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(&io_err)?;
        let len = file.metadata().map_err(&io_err)?.len();
        let mut preamble = [0u8; PREAMBLE_SIZE as usize];
        if len < PREAMBLE_SIZE {
            return Err(FileMemError::InvalidFile {
                path: path.to_path_buf(),
            });
        }
        file.read_exact(&mut preamble).map_err(&io_err)?;
        let next = parse_preamble(path, &preamble)?;
        Ok(Self {
            path: path.to_path_buf(),
            backing: Backing::File(file),
            capacity: len - PREAMBLE_SIZE,
            next,
        })
    }

    /// Opens an existing arena as a read-only memory map.
    pub fn open_mapped(path: &Path) -> Result<Self, FileMemError> {
        let io_err = io_context(path);
        let file = File::open(path).map_err(&io_err)?;
        // The file is only ever appended by the process that sealed it.
        let map = unsafe { Mmap::map(&file) }.map_err(&io_err)?;
        if (map.len() as u64) < PREAMBLE_SIZE {
            return Err(FileMemError::InvalidFile {
                path: path.to_path_buf(),
            });
        }
        let next = parse_preamble(path, &map[..PREAMBLE_SIZE as usize])?;
        let capacity = map.len() as u64 - PREAMBLE_SIZE;
        if next > capacity {
            return Err(FileMemError::InvalidFile {
                path: path.to_path_buf(),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            backing: Backing::Map(map),
            capacity,
            next,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total data bytes backed by the file.
    pub fn size(&self) -> u64 {
        self.capacity
    }

    /// Data bytes reserved but not yet allocated.
    pub fn available(&self) -> u64 {
        self.capacity - self.next
    }

    /// Offset the next allocation will receive.
    pub fn head(&self) -> u64 {
        self.next
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.backing, Backing::Map(_))
    }

    /// Grows the backing file by `bytes`.
    pub fn reserve(&mut self, bytes: u64) -> Result<(), FileMemError> {
        let file = self.writable()?;
        let new_capacity = self.capacity + bytes;
        file.set_len(PREAMBLE_SIZE + new_capacity)
            .map_err(io_context(&self.path))?;
        self.capacity = new_capacity;
        Ok(())
    }

    /// Claims `bytes` from the reserved space and returns their offset.
    pub fn allocate(&mut self, bytes: u64) -> Result<u64, FileMemError> {
        if bytes > self.available() {
            return Err(FileMemError::OutOfMemory {
                requested: bytes,
                available: self.available(),
            });
        }
        let addr = self.next;
        self.next += bytes;
        Ok(addr)
    }

    /// Claims `bytes`, growing the file by at least `grow_by` when space runs out.
    pub fn allocate_growing(&mut self, bytes: u64, grow_by: u64) -> Result<u64, FileMemError> {
        if bytes > self.available() {
            self.reserve(bytes.max(grow_by))?;
        }
        self.allocate(bytes)
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), FileMemError> {
        self.check_bounds(addr, data.len() as u64)?;
        let io_err = io_context(&self.path);
        let mut file = self.writable()?;
        file.seek(SeekFrom::Start(PREAMBLE_SIZE + addr))
            .map_err(&io_err)?;
        file.write_all(data).map_err(&io_err)
    }

    pub fn read(&self, addr: u64, out: &mut [u8]) -> Result<(), FileMemError> {
        self.check_bounds(addr, out.len() as u64)?;
        match &self.backing {
            Backing::Map(map) => {
                let start = (PREAMBLE_SIZE + addr) as usize;
                out.copy_from_slice(&map[start..start + out.len()]);
                Ok(())
            }
            Backing::File(file) => {
                let io_err = io_context(&self.path);
                let mut file = file;
                file.seek(SeekFrom::Start(PREAMBLE_SIZE + addr))
                    .map_err(&io_err)?;
                file.read_exact(out).map_err(&io_err)
            }
        }
    }

    /// Reads `len` bytes at `addr` into a fresh buffer.
    pub fn read_vec(&self, addr: u64, len: usize) -> Result<Vec<u8>, FileMemError> {
        let mut buf = vec![0u8; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }

    /// Discards every allocation and shrinks the file back to its preamble.
    pub fn clear(&mut self) -> Result<(), FileMemError> {
        let file = self.writable()?;
        file.set_len(PREAMBLE_SIZE).map_err(io_context(&self.path))?;
        self.capacity = 0;
        self.next = 0;
        self.sync()
    }

    /// Persists the watermark and flushes file contents.
    pub fn sync(&mut self) -> Result<(), FileMemError> {
        let io_err = io_context(&self.path);
        let next = self.next;
        let mut file = self.writable()?;
        file.seek(SeekFrom::Start(IDENT.len() as u64))
            .map_err(&io_err)?;
        file.write_all(&next.to_le_bytes()).map_err(&io_err)?;
        file.flush().map_err(&io_err)?;
        file.sync_data().map_err(&io_err)
    }

    fn writable(&self) -> Result<&File, FileMemError> {
        match &self.backing {
            Backing::File(file) => Ok(file),
            Backing::Map(_) => Err(FileMemError::ReadOnly {
                path: self.path.clone(),
            }),
        }
    }

    fn check_bounds(&self, addr: u64, len: u64) -> Result<(), FileMemError> {
        match addr.checked_add(len) {
            Some(end) if end <= self.next => Ok(()),
            _ => Err(FileMemError::SegFault {
                addr,
                len,
                head: self.next,
            }),
        }
    }
}

fn parse_preamble(path: &Path, preamble: &[u8]) -> Result<u64, FileMemError> {
    if &preamble[..IDENT.len()] != IDENT {
        return Err(FileMemError::InvalidFile {
            path: path.to_path_buf(),
        });
    }
    let mut watermark = [0u8; 8];
    watermark.copy_from_slice(&preamble[IDENT.len()..PREAMBLE_SIZE as usize]);
    Ok(u64::from_le_bytes(watermark))
}

fn io_context(path: &Path) -> impl Fn(io::Error) -> FileMemError + '_ {
    move |source| FileMemError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ========================================================================================
//                              Fixed-width records
// ========================================================================================

/// A value with a fixed little-endian encoding inside the arena.
pub trait Record: Copy {
    const SIZE: usize;

    fn encode(self, out: &mut Vec<u8>);

    /// Decodes from the first `SIZE` bytes of `bytes`.
    fn decode(bytes: &[u8]) -> Self;
}

macro_rules! impl_record {
    ($($ty:ty),*) => {
        $(
            impl Record for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn encode(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn decode(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_record!(i8, u8, u16, i32, u32, i64, u64, f32);

/// A typed offset into a [`FileMem`] arena.
#[derive(Debug)]
pub struct FilePtr<T: Record> {
    addr: u64,
    _marker: PhantomData<T>,
}

impl<T: Record> Clone for FilePtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Record> Copy for FilePtr<T> {}

impl<T: Record> FilePtr<T> {
    pub fn new(addr: u64) -> Self {
        Self {
            addr,
            _marker: PhantomData,
        }
    }

    pub fn addr(self) -> u64 {
        self.addr
    }

    /// Pointer to the `n`th element after this one.
    pub fn offset(self, n: u64) -> Self {
        Self::new(self.addr + n * T::SIZE as u64)
    }

    pub fn get(self, mem: &FileMem) -> Result<T, FileMemError> {
        let mut raw = [0u8; 16];
        mem.read(self.addr, &mut raw[..T::SIZE])?;
        Ok(T::decode(&raw[..T::SIZE]))
    }

    pub fn set(self, mem: &mut FileMem, value: T) -> Result<(), FileMemError> {
        let mut raw = Vec::with_capacity(T::SIZE);
        value.encode(&mut raw);
        mem.write(self.addr, &raw)
    }
}

/// Sequential decoder over a byte slice read from an arena.
pub struct RecordReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    /// Decodes the next value, or `None` when too few bytes remain.
    pub fn take<T: Record>(&mut self) -> Option<T> {
        if self.remaining() < T::SIZE {
            return None;
        }
        let value = T::decode(&self.bytes[self.pos..]);
        self.pos += T::SIZE;
        Some(value)
    }

    pub fn take_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let out = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use tempfile::tempdir;

    #[test]
    fn allocations_are_bounded_by_reserved_space() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let mut mem = FileMem::create(&dir.path().join("arena.bin"))?;
        assert_eq!(mem.size(), 0);
        assert!(matches!(
            mem.allocate(8),
            Err(FileMemError::OutOfMemory { requested: 8, .. })
        ));

        mem.reserve(16)?;
        let first = mem.allocate(8)?;
        let second = mem.allocate(8)?;
        assert_eq!((first, second), (0, 8));
        assert_eq!(mem.available(), 0);
        assert_eq!(mem.head(), 16);
        Ok(())
    }

    #[test]
    fn access_beyond_the_watermark_is_a_segfault() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let mut mem = FileMem::create(&dir.path().join("arena.bin"))?;
        mem.reserve(32)?;
        let addr = mem.allocate(4)?;
        mem.write(addr, &[1, 2, 3, 4])?;

        let mut buf = [0u8; 8];
        assert!(matches!(
            mem.read(addr, &mut buf),
            Err(FileMemError::SegFault { head: 4, .. })
        ));
        assert!(mem.write(2, &[0; 4]).is_err());
        Ok(())
    }

    #[test]
    fn sealed_arena_reopens_mapped_with_identical_contents() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("arena.bin");
        {
            let mut mem = FileMem::create(&path)?;
            let ptr = FilePtr::<i32>::new(mem.allocate_growing(12, 1024)?);
            ptr.set(&mut mem, -7)?;
            ptr.offset(1).set(&mut mem, 42)?;
            FilePtr::<f32>::new(ptr.offset(2).addr()).set(&mut mem, 0.25)?;
            mem.sync()?;
        }

        let mem = FileMem::open_mapped(&path)?;
        assert!(mem.is_read_only());
        assert_eq!(mem.head(), 12);
        let ptr = FilePtr::<i32>::new(0);
        assert_eq!(ptr.get(&mem)?, -7);
        assert_eq!(ptr.offset(1).get(&mem)?, 42);
        assert_eq!(FilePtr::<f32>::new(8).get(&mem)?, 0.25);
        Ok(())
    }

    #[test]
    fn rejects_foreign_files() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("not_an_arena.txt");
        std::fs::write(&path, b"gene\tsample\n1.0\t2.0\n")?;
        assert!(matches!(
            FileMem::open(&path),
            Err(FileMemError::InvalidFile { .. })
        ));
        Ok(())
    }

    #[test]
    fn clear_resets_the_arena() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let mut mem = FileMem::create(&dir.path().join("arena.bin"))?;
        mem.allocate_growing(100, 0)?;
        mem.clear()?;
        assert_eq!((mem.size(), mem.head()), (0, 0));
        Ok(())
    }
}
