//! Fixed pool of position blocks with an index-linked LRU list.
//!
//! Blocks are created once per pool slot and handed from cell to cell; the pool never
//! allocates a block after construction or `resize`.

use crate::position::{Position, PositionRef};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockPoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub in_use: usize,
}

/// Cached candidate positions of exactly one cell.
#[derive(Debug, Default)]
pub struct PositionBlock {
    prev: Option<BlockId>,
    next: Option<BlockId>,
    cell: Option<usize>,
    pub positions: Vec<Position>,
}

impl PositionBlock {
    /// Owning cell index, `None` while the block sits in the free list.
    #[inline]
    pub fn cell(&self) -> Option<usize> {
        self.cell
    }
}

#[derive(Debug)]
pub struct BlockPool {
    blocks: Vec<PositionBlock>,
    free: Vec<BlockId>,
    // most recently used end
    head: Option<BlockId>,
    // least recently used end
    tail: Option<BlockId>,
    in_use: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl BlockPool {
    pub fn new(capacity: usize) -> Self {
        let blocks = (0..capacity).map(|_| PositionBlock::default()).collect();
        // Reverse so that `pop` hands out slot 0 first.
        let free = (0..capacity).rev().map(BlockId).collect();
        Self {
            blocks,
            free,
            head: None,
            tail: None,
            in_use: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn in_use_count(&self) -> usize {
        self.in_use
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> &PositionBlock {
        &self.blocks[id.0]
    }

    #[inline]
    pub fn block_mut(&mut self, id: BlockId) -> &mut PositionBlock {
        &mut self.blocks[id.0]
    }

    #[inline]
    pub fn position(&self, at: PositionRef) -> &Position {
        &self.blocks[at.block.0].positions[at.slot]
    }

    #[inline]
    pub fn position_mut(&mut self, at: PositionRef) -> &mut Position {
        &mut self.blocks[at.block.0].positions[at.slot]
    }

    /// Move an in-use block to the most recently used end.
    pub fn touch(&mut self, id: BlockId) {
        debug_assert!(self.blocks[id.0].cell.is_some(), "touching a free block");
        self.hits += 1;
        if self.head == Some(id) {
            return;
        }
        self.unlink(id);
        self.push_front(id);
    }

    /// Take a block from the free list and assign it to `cell`.
    pub fn acquire_free(&mut self, cell: usize) -> Option<BlockId> {
        let id = self.free.pop()?;
        self.misses += 1;
        let block = &mut self.blocks[id.0];
        block.cell = Some(cell);
        block.positions.clear();
        self.push_front(id);
        self.in_use += 1;
        Some(id)
    }

    /// Least recently used in-use block; the next victim of `reassign`.
    #[inline]
    pub fn lru(&self) -> Option<BlockId> {
        self.tail
    }

    /// Hand an in-use block to another cell without passing it through the free list.
    /// Returns the cell that owned it before. Positions are left in place for the caller.
    pub fn reassign(&mut self, id: BlockId, cell: usize) -> Option<usize> {
        self.misses += 1;
        self.evictions += 1;
        let previous = self.blocks[id.0].cell.replace(cell);
        debug_assert!(previous.is_some(), "reassigning a free block");
        if self.head != Some(id) {
            self.unlink(id);
            self.push_front(id);
        }
        previous
    }

    /// Return an in-use block to the free list. The caller frees live instances first.
    pub fn release(&mut self, id: BlockId) {
        let block = &mut self.blocks[id.0];
        if block.cell.take().is_none() {
            return;
        }
        block.positions.clear();
        self.unlink(id);
        self.free.push(id);
        self.in_use -= 1;
    }

    pub fn release_all(&mut self) {
        while let Some(id) = self.head {
            self.release(id);
        }
    }

    /// Rebuild the pool with a new capacity. Every block must already be released.
    pub fn resize(&mut self, capacity: usize) {
        debug_assert_eq!(self.in_use, 0, "resizing a pool with blocks in use");
        let stats = (self.hits, self.misses, self.evictions);
        *self = Self::new(capacity);
        (self.hits, self.misses, self.evictions) = stats;
    }

    /// In-use blocks from most to least recently used.
    pub fn iter_in_use(&self) -> impl Iterator<Item = BlockId> + '_ {
        std::iter::successors(self.head, move |id| self.blocks[id.0].next)
    }

    pub fn stats(&self) -> BlockPoolStats {
        BlockPoolStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            in_use: self.in_use,
        }
    }

    fn unlink(&mut self, id: BlockId) {
        let (prev, next) = {
            let b = &mut self.blocks[id.0];
            (b.prev.take(), b.next.take())
        };
        match prev {
            Some(p) => self.blocks[p.0].next = next,
            None => {
                if self.head == Some(id) {
                    self.head = next;
                }
            }
        }
        match next {
            Some(n) => self.blocks[n.0].prev = prev,
            None => {
                if self.tail == Some(id) {
                    self.tail = prev;
                }
            }
        }
    }

    fn push_front(&mut self, id: BlockId) {
        let old_head = self.head;
        {
            let b = &mut self.blocks[id.0];
            b.prev = None;
            b.next = old_head;
        }
        if let Some(h) = old_head {
            self.blocks[h.0].prev = Some(id);
        }
        self.head = Some(id);
        if self.tail.is_none() {
            self.tail = Some(id);
        }
    }
}
