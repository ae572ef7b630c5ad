//! Write cursor over the block sequence of one chunk

use crate::voxel::chunk::{CHUNK_VOLUME, block_position};
use crate::voxel::material::{EMPTY_MATERIAL, MaterialId};

/// Handed to each stage while a chunk is generated.
///
/// Blocks are visited in storage order (x fastest, then y, then z). The
/// cursor is rewound before every stage; content written by earlier stages
/// stays unless overwritten.
#[derive(Debug)]
pub struct GeneratorControl {
    blocks: Vec<MaterialId>,
    cursor: usize,
    ended: bool,
}

impl Default for GeneratorControl {
    fn default() -> Self {
        Self::new()
    }
}

impl GeneratorControl {
    /// A fresh chunk full of the empty material
    pub fn new() -> Self {
        Self {
            blocks: vec![EMPTY_MATERIAL; CHUNK_VOLUME],
            cursor: 0,
            ended: false,
        }
    }

    /// Set the block under the cursor. Ignored once the cursor is past the end.
    pub fn write(&mut self, material: MaterialId) {
        if let Some(block) = self.blocks.get_mut(self.cursor) {
            *block = material;
        }
    }

    /// Advance the cursor by one block. Returns `false` once it is past the
    /// last block.
    pub fn next(&mut self) -> bool {
        self.cursor = (self.cursor + 1).min(CHUNK_VOLUME);
        self.cursor < CHUNK_VOLUME
    }

    /// Advance without writing.
    pub fn skip(&mut self, count: usize) {
        self.cursor = self.cursor.saturating_add(count).min(CHUNK_VOLUME);
    }

    /// Write `material` from the cursor to the end of the chunk.
    pub fn fill(&mut self, material: MaterialId) {
        self.blocks[self.cursor..].fill(material);
        self.cursor = CHUNK_VOLUME;
    }

    pub fn index(&self) -> usize {
        self.cursor
    }

    /// Block position (x, y, z) of the cursor inside the chunk
    pub fn position(&self) -> (usize, usize, usize) {
        block_position(self.cursor.min(CHUNK_VOLUME - 1))
    }

    pub fn remaining(&self) -> usize {
        CHUNK_VOLUME - self.cursor
    }

    pub fn is_done(&self) -> bool {
        self.cursor >= CHUNK_VOLUME
    }

    /// Stop the pipeline after the current stage.
    pub fn end_pipeline(&mut self) {
        self.ended = true;
    }

    pub fn pipeline_ended(&self) -> bool {
        self.ended
    }

    pub(crate) fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn blocks(&self) -> &[MaterialId] {
        &self.blocks
    }

    pub fn into_blocks(self) -> Vec<MaterialId> {
        self.blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_next_sequence() {
        let mut control = GeneratorControl::new();
        control.write(3);
        assert!(control.next());
        control.write(4);
        assert_eq!(&control.blocks()[..3], &[3, 4, EMPTY_MATERIAL]);
        assert_eq!(control.position(), (1, 0, 0));
    }

    #[test]
    fn test_skip_and_fill() {
        let mut control = GeneratorControl::new();
        control.skip(CHUNK_VOLUME / 2);
        control.fill(9);
        assert!(control.is_done());
        assert_eq!(control.blocks()[CHUNK_VOLUME / 2 - 1], EMPTY_MATERIAL);
        assert_eq!(control.blocks()[CHUNK_VOLUME / 2], 9);
        assert_eq!(control.remaining(), 0);
    }

    #[test]
    fn test_cursor_saturates_at_end() {
        let mut control = GeneratorControl::new();
        control.skip(CHUNK_VOLUME - 1);
        assert!(!control.next());
        assert!(!control.next());
        control.write(5);
        assert!(control.blocks().iter().all(|&b| b == EMPTY_MATERIAL));

        control.rewind();
        assert_eq!(control.index(), 0);
    }
}
