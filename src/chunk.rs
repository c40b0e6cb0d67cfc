// src/chunk.rs

//! Handles to data living on workers.
//!
//! A [`Chunk`] names a single materialized datum in one worker's store. A
//! [`View`] is a declared slice of another chunk; the core only carries its
//! identity, owner and domain; slicing semantics belong to the partitioning
//! layer. A [`Cat`] is an N-dimensional aggregate of chunks with layout
//! metadata; its cells may still be deferred (thunks), in which case the
//! whole aggregate is deferred and gets fused by the stager before running.

use std::sync::Arc;

use crate::thunk::Thunk;

pub type ChunkId = u64;
pub type WorkerId = usize;

/// A handle to a materialized datum owned by a specific worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chunk {
    pub id: ChunkId,
    pub worker: WorkerId,
}

/// Extent of a value along each axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Domain {
    pub shape: Vec<usize>,
}

impl Domain {
    pub fn new(shape: Vec<usize>) -> Self {
        Self { shape }
    }

    pub fn ndims(&self) -> usize {
        self.shape.len()
    }
}

/// A slice of another chunk. Gathering a view fetches the parent datum; the
/// domain records which part of it the view denotes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct View {
    pub parent: Chunk,
    pub domain: Domain,
}

/// One cell of a [`Cat`] grid.
#[derive(Debug, Clone)]
pub enum CatCell {
    Chunk(Chunk),
    View(View),
    /// A deferred cell. A Cat containing any of these is itself deferred.
    Thunk(Arc<Thunk>),
}

impl CatCell {
    pub fn is_deferred(&self) -> bool {
        matches!(self, CatCell::Thunk(_))
    }
}

/// An N-dimensional aggregate of chunks arranged in a grid.
///
/// `grid` gives the number of cells per axis; `cells` is row-major and must
/// have `grid.iter().product()` entries. `chunk_sizes` records the per-axis
/// extents of the cells, `chunk_type` the declared element kind.
#[derive(Debug, Clone)]
pub struct Cat {
    pub chunk_type: String,
    pub domain: Domain,
    pub grid: Vec<usize>,
    pub chunk_sizes: Vec<Vec<usize>>,
    pub cells: Vec<CatCell>,
}

impl Cat {
    pub fn new(
        chunk_type: impl Into<String>,
        domain: Domain,
        grid: Vec<usize>,
        chunk_sizes: Vec<Vec<usize>>,
        cells: Vec<CatCell>,
    ) -> Self {
        Self {
            chunk_type: chunk_type.into(),
            domain,
            grid,
            chunk_sizes,
            cells,
        }
    }

    /// True if any cell is still a thunk.
    pub fn is_deferred(&self) -> bool {
        self.cells.iter().any(CatCell::is_deferred)
    }
}

/// The polymorphic chunk handle.
#[derive(Debug, Clone)]
pub enum AbstractChunk {
    Chunk(Chunk),
    View(View),
    Cat(Cat),
}

impl AbstractChunk {
    pub fn is_deferred(&self) -> bool {
        match self {
            AbstractChunk::Chunk(_) | AbstractChunk::View(_) => false,
            AbstractChunk::Cat(cat) => cat.is_deferred(),
        }
    }

    /// Workers that own parts of this handle, as `(worker, weight)` pairs.
    ///
    /// Weights are a placeholder for datum sizes; the current selector only
    /// looks at the worker ids.
    pub fn affinity(&self) -> Vec<(WorkerId, u64)> {
        match self {
            AbstractChunk::Chunk(c) => vec![(c.worker, 1)],
            AbstractChunk::View(v) => vec![(v.parent.worker, 1)],
            AbstractChunk::Cat(cat) => cat
                .cells
                .iter()
                .filter_map(|cell| match cell {
                    CatCell::Chunk(c) => Some((c.worker, 1)),
                    CatCell::View(v) => Some((v.parent.worker, 1)),
                    CatCell::Thunk(_) => None,
                })
                .collect(),
        }
    }
}

impl From<Chunk> for AbstractChunk {
    fn from(c: Chunk) -> Self {
        AbstractChunk::Chunk(c)
    }
}

impl From<Cat> for AbstractChunk {
    fn from(c: Cat) -> Self {
        AbstractChunk::Cat(c)
    }
}
