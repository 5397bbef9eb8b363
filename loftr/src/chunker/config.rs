use crate::chunker::RollingHashChunker;
use crate::rolling_hash::BuzHash;

/// Configuration to use while scanning for chunk boundaries.
///
/// The bit mask given by `filter_bits` is matched against the rolling hash
/// sum. When `sum | mask == sum` we have found a chunk boundary, so with
/// `filter_bits` set to 16 a boundary is found every 2^16 bytes on average.
#[derive(Clone, Debug)]
pub struct FilterConfig {
    /// Number of bits in the boundary filter mask.
    pub filter_bits: u32,
    /// No chunks smaller than `min_chunk_size`.
    pub min_chunk_size: usize,
    /// No chunks bigger than `max_chunk_size`.
    pub max_chunk_size: usize,
    /// Number of bytes kept in the rolling hash window while scanning.
    pub window_size: usize,
    /// Per key seed mixed into the rolling hash table.
    pub seed: u32,
}

impl FilterConfig {
    /// Get the bit mask value of the filter.
    pub fn mask(&self) -> u32 {
        !0u32 >> (32 - self.filter_bits)
    }
    /// Build a chunker for this configuration.
    pub fn new_chunker(&self) -> RollingHashChunker<BuzHash> {
        RollingHashChunker::new(BuzHash::new(self.window_size, self.seed), self)
    }
}
