//! Fixed-size block buffer with a fill cursor.
//!
//! The read path fills it from the data socket; the write path drains it
//! into the data socket. Either way the cursor wraps to zero once a whole
//! block has moved.

pub struct BlockBuffer {
    data: Vec<u8>,
    cursor: usize,
}

impl BlockBuffer {
    /// Allocate a zeroed block of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size],
            cursor: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// True when no byte of the current block has moved yet.
    pub fn is_fresh(&self) -> bool {
        self.cursor == 0
    }

    /// Bytes still to fill or send in the current block.
    pub fn pending(&self) -> &[u8] {
        &self.data[self.cursor..]
    }

    pub fn pending_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.cursor..]
    }

    /// Move the cursor by `n` bytes. Returns true when the block is complete.
    pub fn advance(&mut self, n: usize) -> bool {
        debug_assert!(self.cursor + n <= self.data.len(), "advanced past block end");
        self.cursor = (self.cursor + n).min(self.data.len());
        self.cursor == self.data.len()
    }

    /// Start a new block.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn block_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}
