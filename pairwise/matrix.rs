// ========================================================================================
//
//                         SPARSE, APPEND-ONLY PAIRWISE STORE
//
// ========================================================================================
//
// Layout inside the arena (all integers little-endian):
//
//   header     kind[4] version:u16 genes:i32 max_clusters:i32 width:i32
//              total_pairs:i64 total_clusters:i64 meta_addr:u64 meta_len:u64
//              body_addr:u64
//   subheader  matrix-kind specific, fixed size
//   metadata   JSON object (gene names plus the kind's secondary names)
//   body       repeated (x:i32, y:i32, clusters:i8, clusters * width * element)
//
// Pairs are appended in strictly increasing `PairIndex` order and only pairs with at
// least one cluster are stored.

use super::index::{MAX_CLUSTER_SIZE, PairIndex};
use super::PairwiseError;
use crate::shared::files::{FileMem, FilePtr, Record, RecordReader};
use ahash::AHashMap;
use log::debug;
use serde_json::{Map, Value};
use std::cell::OnceCell;
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;

const FORMAT_VERSION: u16 = 1;
const HEADER_SIZE: u64 = 4 + 2 + 4 + 4 + 4 + 8 + 8 + 8 + 8 + 8;
const TOTAL_PAIRS_OFFSET: u64 = 4 + 2 + 4 + 4 + 4;
const PAIR_PREFIX_SIZE: u64 = 4 + 4 + 1;
/// Growth step for the arena while pairs are appended.
const GROW_BYTES: u64 = 4 * 1024 * 1024;

pub const GENES_KEY: &str = "genes";

/// Element type of one cluster record. Each element type maps onto one on-disk
/// matrix kind.
pub trait ClusterElement: Record + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Tag identifying the matrix kind in the header.
    const KIND: [u8; 4];
    /// Value a freshly added cluster is filled with.
    const BLANK: Self;
}

impl ClusterElement for f32 {
    const KIND: [u8; 4] = *b"CMX\0";
    const BLANK: Self = f32::NAN;
}

impl ClusterElement for i8 {
    const KIND: [u8; 4] = *b"CCM\0";
    const BLANK: Self = 0;
}

#[derive(Clone, Copy, Debug, Default)]
struct Header {
    gene_size: i32,
    max_cluster_size: i32,
    width: i32,
    total_pairs: i64,
    total_clusters: i64,
    meta_addr: u64,
    meta_len: u64,
    body_addr: u64,
}

impl Header {
    fn encode<E: ClusterElement>(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE as usize);
        out.extend_from_slice(&E::KIND);
        FORMAT_VERSION.encode(&mut out);
        self.gene_size.encode(&mut out);
        self.max_cluster_size.encode(&mut out);
        self.width.encode(&mut out);
        self.total_pairs.encode(&mut out);
        self.total_clusters.encode(&mut out);
        self.meta_addr.encode(&mut out);
        self.meta_len.encode(&mut out);
        self.body_addr.encode(&mut out);
        out
    }

    fn decode<E: ClusterElement>(bytes: &[u8]) -> Option<Self> {
        let mut reader = RecordReader::new(bytes);
        if reader.take_bytes(4)? != E::KIND || reader.take::<u16>()? != FORMAT_VERSION {
            return None;
        }
        Some(Self {
            gene_size: reader.take()?,
            max_cluster_size: reader.take()?,
            width: reader.take()?,
            total_pairs: reader.take()?,
            total_clusters: reader.take()?,
            meta_addr: reader.take()?,
            meta_len: reader.take()?,
            body_addr: reader.take()?,
        })
    }
}

// ========================================================================================
//                                      Pair
// ========================================================================================

/// One pair and its ordered list of cluster records, held in memory.
///
/// Cluster data is stored flat: cluster `k` occupies `values[k * width..(k + 1) * width]`.
/// Accessing a cluster slot that does not exist reads as `None` and writes are ignored.
#[derive(Clone, Debug, PartialEq)]
pub struct Pair<E> {
    index: PairIndex,
    width: usize,
    max_clusters: usize,
    values: Vec<E>,
}

impl<E: ClusterElement> Pair<E> {
    pub fn new(index: PairIndex, width: usize, max_clusters: usize) -> Self {
        Self {
            index,
            width,
            max_clusters,
            values: Vec::new(),
        }
    }

    #[inline]
    pub fn index(&self) -> PairIndex {
        self.index
    }

    pub fn set_index(&mut self, index: PairIndex) {
        self.index = index;
    }

    /// Elements per cluster record.
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn cluster_size(&self) -> usize {
        if self.width == 0 {
            0
        } else {
            self.values.len() / self.width
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Appends `amount` clusters filled with the element's blank value.
    pub fn add_cluster(&mut self, amount: usize) -> Result<(), PairwiseError> {
        let total = self.cluster_size() + amount;
        if total > self.max_clusters {
            return Err(PairwiseError::ClusterSlot {
                slot: total as i64 - 1,
                max: self.max_clusters as i64,
            });
        }
        self.values
            .resize(self.values.len() + amount * self.width, E::BLANK);
        Ok(())
    }

    pub fn clear_clusters(&mut self) {
        self.values.clear();
    }

    pub fn cluster(&self, k: usize) -> Option<&[E]> {
        let start = k.checked_mul(self.width)?;
        self.values.get(start..start + self.width)
    }

    pub fn cluster_mut(&mut self, k: usize) -> Option<&mut [E]> {
        let start = k.checked_mul(self.width)?;
        self.values.get_mut(start..start + self.width)
    }

    pub fn clusters(&self) -> impl Iterator<Item = &[E]> {
        self.values.chunks_exact(self.width.max(1))
    }

    pub fn get(&self, k: usize, i: usize) -> Option<E> {
        self.cluster(k)?.get(i).copied()
    }

    pub fn set(&mut self, k: usize, i: usize, value: E) {
        if let Some(slot) = self.cluster_mut(k).and_then(|c| c.get_mut(i)) {
            *slot = value;
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        self.index.x().encode(out);
        self.index.y().encode(out);
        (self.cluster_size() as i8).encode(out);
        for &value in &self.values {
            value.encode(out);
        }
    }
}

// ========================================================================================
//                                     Matrix
// ========================================================================================

/// Sparse matrix over all gene pairs, backed by a [`FileMem`] arena.
pub struct PairwiseMatrix<E: ClusterElement> {
    mem: FileMem,
    header: Header,
    metadata: Value,
    subheader: Vec<u8>,
    initialized: bool,
    sealed: bool,
    last_written: Option<PairIndex>,
    offsets: OnceCell<AHashMap<PairIndex, u64>>,
    _marker: PhantomData<E>,
}

impl<E: ClusterElement> PairwiseMatrix<E> {
    /// Creates an empty, uninitialized matrix file.
    pub fn create(path: &Path) -> Result<Self, PairwiseError> {
        Ok(Self {
            mem: FileMem::create(path)?,
            header: Header::default(),
            metadata: Value::Null,
            subheader: Vec::new(),
            initialized: false,
            sealed: false,
            last_written: None,
            offsets: OnceCell::new(),
            _marker: PhantomData,
        })
    }

    /// Opens a finished matrix for reading. `subheader_size` is the kind-specific
    /// subheader length.
    pub fn open(path: &Path, subheader_size: usize) -> Result<Self, PairwiseError> {
        let mem = FileMem::open_mapped(path)?;
        let format_err = |detail: &str| PairwiseError::Format {
            path: path.display().to_string(),
            detail: detail.to_string(),
        };

        let raw = mem.read_vec(0, HEADER_SIZE as usize)?;
        let header = Header::decode::<E>(&raw).ok_or_else(|| {
            format_err(&format!(
                "expected a {} matrix header",
                String::from_utf8_lossy(&E::KIND).trim_end_matches('\0')
            ))
        })?;
        let subheader = mem.read_vec(HEADER_SIZE, subheader_size)?;
        let meta_bytes = mem.read_vec(header.meta_addr, header.meta_len as usize)?;
        let metadata: Value = serde_json::from_slice(&meta_bytes)?;
        if header.width < 0 || header.max_cluster_size > MAX_CLUSTER_SIZE {
            return Err(format_err("corrupt header dimensions"));
        }

        debug!(
            "opened {} with {} genes, {} pairs, {} clusters",
            path.display(),
            header.gene_size,
            header.total_pairs,
            header.total_clusters
        );

        Ok(Self {
            mem,
            header,
            metadata,
            subheader,
            initialized: true,
            sealed: true,
            last_written: None,
            offsets: OnceCell::new(),
            _marker: PhantomData,
        })
    }

    /// Writes the header, subheader and metadata. `gene_names` must be a non-empty
    /// JSON array; `extra` adds the kind-specific metadata entries.
    pub fn initialize(
        &mut self,
        gene_names: &Value,
        max_cluster_size: i32,
        width: i32,
        subheader: Vec<u8>,
        extra: Map<String, Value>,
    ) -> Result<(), PairwiseError> {
        if self.sealed {
            return Err(PairwiseError::Sealed);
        }
        let gene_size = match gene_names {
            Value::Array(names) if !names.is_empty() => names.len(),
            _ => {
                return Err(PairwiseError::domain(
                    "gene names metadata is not a non-empty array",
                ));
            }
        };
        if !(1..=MAX_CLUSTER_SIZE).contains(&max_cluster_size) {
            return Err(PairwiseError::domain(format!(
                "max cluster size {max_cluster_size} is outside [1, {MAX_CLUSTER_SIZE}]"
            )));
        }
        let gene_size = i32::try_from(gene_size)
            .map_err(|_| PairwiseError::domain(format!("{gene_size} genes exceed i32 range")))?;

        let mut metadata = Map::new();
        metadata.insert(GENES_KEY.to_string(), gene_names.clone());
        metadata.extend(extra);
        let metadata = Value::Object(metadata);
        let meta_bytes = serde_json::to_vec(&metadata)?;

        self.mem.clear()?;
        let header_addr = self.mem.allocate_growing(HEADER_SIZE, GROW_BYTES)?;
        let sub_addr = self
            .mem
            .allocate_growing(subheader.len() as u64, GROW_BYTES)?;
        let meta_addr = self
            .mem
            .allocate_growing(meta_bytes.len() as u64, GROW_BYTES)?;

        self.header = Header {
            gene_size,
            max_cluster_size,
            width,
            total_pairs: 0,
            total_clusters: 0,
            meta_addr,
            meta_len: meta_bytes.len() as u64,
            body_addr: meta_addr + meta_bytes.len() as u64,
        };
        self.mem.write(header_addr, &self.header.encode::<E>())?;
        self.mem.write(sub_addr, &subheader)?;
        self.mem.write(meta_addr, &meta_bytes)?;

        self.metadata = metadata;
        self.subheader = subheader;
        self.initialized = true;
        self.last_written = None;
        self.offsets.take();
        Ok(())
    }

    #[inline]
    pub fn gene_size(&self) -> i32 {
        self.header.gene_size
    }

    #[inline]
    pub fn max_cluster_size(&self) -> i32 {
        self.header.max_cluster_size
    }

    /// Elements per cluster record.
    #[inline]
    pub fn width(&self) -> usize {
        self.header.width.max(0) as usize
    }

    pub fn total_pairs(&self) -> i64 {
        self.header.total_pairs
    }

    pub fn total_clusters(&self) -> i64 {
        self.header.total_clusters
    }

    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    pub fn subheader(&self) -> &[u8] {
        &self.subheader
    }

    pub fn gene_names(&self) -> Option<&Vec<Value>> {
        self.metadata.get(GENES_KEY)?.as_array()
    }

    pub fn gene_name(&self, gene: usize) -> Option<String> {
        self.gene_names()?.get(gene).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.sealed
    }

    /// An empty pair sized for this matrix.
    pub fn new_pair(&self, index: PairIndex) -> Pair<E> {
        Pair::new(index, self.width(), self.max_cluster_size().max(0) as usize)
    }

    /// Appends `pair`. Empty pairs are skipped; non-empty pairs must arrive in strictly
    /// increasing index order.
    pub fn write(&mut self, pair: &Pair<E>) -> Result<(), PairwiseError> {
        if !self.initialized {
            return Err(PairwiseError::Uninitialized);
        }
        if self.sealed {
            return Err(PairwiseError::Sealed);
        }
        if pair.is_empty() {
            return Ok(());
        }
        if let Some(last) = self.last_written {
            if pair.index() <= last {
                return Err(PairwiseError::OutOfOrder {
                    last,
                    attempted: pair.index(),
                });
            }
        }
        if pair.cluster_size() > self.max_cluster_size().max(0) as usize {
            return Err(PairwiseError::ClusterSlot {
                slot: pair.cluster_size() as i64 - 1,
                max: self.max_cluster_size().into(),
            });
        }
        if pair.width() != self.width() {
            return Err(PairwiseError::domain(format!(
                "pair record width {} does not match matrix width {}",
                pair.width(),
                self.width()
            )));
        }

        let mut buf = Vec::with_capacity(
            PAIR_PREFIX_SIZE as usize + pair.values.len() * E::SIZE,
        );
        pair.encode(&mut buf);
        let addr = self.mem.allocate_growing(buf.len() as u64, GROW_BYTES)?;
        self.mem.write(addr, &buf)?;

        self.header.total_pairs += 1;
        self.header.total_clusters += pair.cluster_size() as i64;
        self.last_written = Some(pair.index());
        if let Some(offsets) = self.offsets.get_mut() {
            offsets.insert(pair.index(), addr);
        }
        Ok(())
    }

    /// Persists the pair counters and seals the matrix against further writes.
    pub fn finish(&mut self) -> Result<(), PairwiseError> {
        if !self.initialized {
            return Err(PairwiseError::Uninitialized);
        }
        if self.sealed {
            return Ok(());
        }
        let counters = FilePtr::<i64>::new(TOTAL_PAIRS_OFFSET);
        counters.set(&mut self.mem, self.header.total_pairs)?;
        counters
            .offset(1)
            .set(&mut self.mem, self.header.total_clusters)?;
        self.mem.sync()?;
        self.sealed = true;
        debug!(
            "finished {}: {} pairs, {} clusters",
            self.mem.path().display(),
            self.header.total_pairs,
            self.header.total_clusters
        );
        Ok(())
    }

    /// A forward cursor positioned at the first stored pair.
    pub fn cursor(&self) -> PairCursor<'_, E> {
        PairCursor {
            matrix: self,
            pos: self.header.body_addr,
        }
    }

    /// Positioned read. Pairs that were never stored come back empty.
    pub fn read(&self, index: PairIndex) -> Result<Pair<E>, PairwiseError> {
        if !self.initialized {
            return Err(PairwiseError::Uninitialized);
        }
        let offsets = match self.offsets.get() {
            Some(offsets) => offsets,
            None => {
                let built = self.scan_offsets()?;
                self.offsets.get_or_init(|| built)
            }
        };
        match offsets.get(&index) {
            Some(&addr) => Ok(self.read_at(addr)?.0),
            None => Ok(self.new_pair(index)),
        }
    }

    fn scan_offsets(&self) -> Result<AHashMap<PairIndex, u64>, PairwiseError> {
        let mut offsets = AHashMap::with_capacity(self.header.total_pairs.max(0) as usize);
        let mut pos = self.header.body_addr;
        while pos < self.mem.head() {
            let (pair, len) = self.read_at(pos)?;
            offsets.insert(pair.index(), pos);
            pos += len;
        }
        Ok(offsets)
    }

    /// Decodes the pair stored at `addr`, returning it with its encoded length.
    fn read_at(&self, addr: u64) -> Result<(Pair<E>, u64), PairwiseError> {
        let prefix = self.mem.read_vec(addr, PAIR_PREFIX_SIZE as usize)?;
        let mut reader = RecordReader::new(&prefix);
        let (x, y, clusters) = match (reader.take::<i32>(), reader.take::<i32>(), reader.take::<i8>()) {
            (Some(x), Some(y), Some(c)) => (x, y, c),
            _ => return Err(self.corrupt(addr, "truncated pair prefix")),
        };
        if clusters < 0 || i32::from(clusters) > self.max_cluster_size() {
            return Err(self.corrupt(addr, "cluster count out of range"));
        }

        let width = self.width();
        let count = clusters as usize * width;
        let data = self.mem.read_vec(addr + PAIR_PREFIX_SIZE, count * E::SIZE)?;
        let values = data.chunks_exact(E::SIZE).map(E::decode).collect();
        let pair = Pair {
            index: PairIndex::new(x, y)?,
            width,
            max_clusters: self.max_cluster_size() as usize,
            values,
        };
        Ok((pair, PAIR_PREFIX_SIZE + (count * E::SIZE) as u64))
    }

    fn corrupt(&self, addr: u64, detail: &str) -> PairwiseError {
        PairwiseError::Format {
            path: self.mem.path().display().to_string(),
            detail: format!("{detail} at offset {addr}"),
        }
    }
}

// ========================================================================================
//                                     Cursor
// ========================================================================================

/// Forward-only reader over the stored pairs of one matrix.
pub struct PairCursor<'m, E: ClusterElement> {
    matrix: &'m PairwiseMatrix<E>,
    pos: u64,
}

impl<E: ClusterElement> PairCursor<'_, E> {
    /// Rewinds to the first stored pair.
    pub fn reset(&mut self) {
        self.pos = self.matrix.header.body_addr;
    }

    pub fn has_next(&self) -> bool {
        self.matrix.initialized && self.pos < self.matrix.mem.head()
    }

    pub fn read_next(&mut self) -> Result<Pair<E>, PairwiseError> {
        if !self.has_next() {
            return Err(PairwiseError::Data {
                title: "Read Error".to_string(),
                detail: "cursor is past the last stored pair".to_string(),
            });
        }
        let (pair, len) = self.matrix.read_at(self.pos)?;
        self.pos += len;
        Ok(pair)
    }
}

impl<E: ClusterElement> Iterator for PairCursor<'_, E> {
    type Item = Result<Pair<E>, PairwiseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.has_next() {
            Some(self.read_next())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::error::Error;
    use tempfile::tempdir;

    fn pair(x: i32, y: i32, clusters: &[&[i8]]) -> Pair<i8> {
        let mut pair = Pair::new(PairIndex::new(x, y).unwrap(), 3, 8);
        for (k, values) in clusters.iter().enumerate() {
            pair.add_cluster(1).unwrap();
            for (i, &v) in values.iter().enumerate() {
                pair.set(k, i, v);
            }
        }
        pair
    }

    #[test]
    fn out_of_range_cluster_access_is_ignored() {
        let mut p = pair(2, 1, &[&[1, 0, 1]]);
        p.set(5, 0, 9);
        p.set(0, 3, 9);
        assert_eq!(p.get(5, 0), None);
        assert_eq!(p.get(0, 3), None);
        assert_eq!(p.cluster(0), Some(&[1i8, 0, 1][..]));
        assert!(p.add_cluster(8).is_err());
    }

    #[test]
    fn writes_must_be_strictly_increasing() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let mut m = PairwiseMatrix::<i8>::create(&dir.path().join("m.ccm"))?;
        m.initialize(&json!(["a", "b", "c", "d"]), 8, 3, vec![], Map::new())?;

        m.write(&pair(2, 0, &[&[1, 1, 0]]))?;
        assert!(matches!(
            m.write(&pair(1, 0, &[&[1, 1, 0]])),
            Err(PairwiseError::OutOfOrder { .. })
        ));
        assert!(m.write(&pair(2, 0, &[&[1, 1, 0]])).is_err());
        // Empty pairs never reach the store, so their order is irrelevant.
        m.write(&pair(1, 0, &[]))?;
        m.write(&pair(3, 2, &[&[0, 1, 1], &[1, 0, 0]]))?;
        assert_eq!((m.total_pairs(), m.total_clusters()), (2, 3));
        Ok(())
    }

    #[test]
    fn pairs_with_more_clusters_than_the_matrix_allows_are_rejected() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let mut m = PairwiseMatrix::<i8>::create(&dir.path().join("m.ccm"))?;
        m.initialize(&json!(["a", "b", "c"]), 2, 3, vec![], Map::new())?;

        let mut wide = Pair::new(PairIndex::new(1, 0)?, 3, 200);
        wide.add_cluster(130)?;
        assert!(matches!(m.write(&wide), Err(PairwiseError::ClusterSlot { .. })));
        assert_eq!(m.total_pairs(), 0);

        m.write(&pair(2, 0, &[&[1, 0, 1], &[0, 1, 0]]))?;
        assert_eq!(m.total_clusters(), 2);
        Ok(())
    }

    #[test]
    fn cursor_and_positioned_reads_agree_after_reopen() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("m.ccm");
        let written = vec![
            pair(1, 0, &[&[1, 0, 1]]),
            pair(3, 1, &[&[0, 0, 1], &[1, 1, 0]]),
            pair(3, 2, &[&[7, 8, 9]]),
        ];
        {
            let mut m = PairwiseMatrix::<i8>::create(&path)?;
            m.initialize(&json!(["a", "b", "c", "d"]), 8, 3, vec![0xAB], Map::new())?;
            for p in &written {
                m.write(p)?;
            }
            m.finish()?;
            assert!(m.write(&pair(3, 2, &[&[0, 0, 0]])).is_err());
        }

        let m = PairwiseMatrix::<i8>::open(&path, 1)?;
        assert_eq!(m.subheader(), &[0xAB]);
        assert_eq!(m.gene_name(2).as_deref(), Some("c"));
        let mut cursor = m.cursor();
        let mut read = Vec::new();
        while cursor.has_next() {
            read.push(cursor.read_next()?);
        }
        assert_eq!(read, written);

        cursor.reset();
        assert_eq!(cursor.count(), 3);

        assert_eq!(m.read(PairIndex::new(3, 1)?)?, written[1]);
        assert!(m.read(PairIndex::new(2, 0)?)?.is_empty());
        Ok(())
    }

    #[test]
    fn rejects_empty_gene_names() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let mut m = PairwiseMatrix::<f32>::create(&dir.path().join("m.cmx"))?;
        for names in [json!([]), json!("genes"), Value::Null] {
            let err = m.initialize(&names, 4, 1, vec![], Map::new()).unwrap_err();
            assert!(err.to_string().starts_with("Domain Error"));
        }
        Ok(())
    }

    #[test]
    fn open_rejects_a_different_matrix_kind() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("m.cmx");
        let mut m = PairwiseMatrix::<f32>::create(&path)?;
        m.initialize(&json!(["a", "b"]), 4, 1, vec![1], Map::new())?;
        m.finish()?;
        assert!(matches!(
            PairwiseMatrix::<i8>::open(&path, 4),
            Err(PairwiseError::Format { .. })
        ));
        Ok(())
    }
}
