//! LZ4 compression engine for stored patches and content
//!
//! Every payload the version manager persists passes through this engine.
//! The result is a [`CompressedDiff`] carrying an explicit algorithm tag, so
//! a reader never has to guess the format from the bytes.
//!
//! ## Compression Strategies
//!
//! - **None**: store everything as-is
//! - **Fast**: LZ4 for every payload of at least 64 bytes (default)
//! - **Adaptive**: LZ4 only for payloads of at least `min_size` bytes
//!
//! Whatever the strategy, a payload LZ4 does not shrink is stored raw with
//! the `none` tag.
//!
//! ## Examples
//!
//! ```rust
//! use palimpsest::compression::{CompressionEngine, CompressionStrategy};
//! use palimpsest::Logger;
//!
//! let mut engine = CompressionEngine::new(CompressionStrategy::Fast, Logger::disabled());
//!
//! let text = "It was a dark and stormy night. ".repeat(20);
//! let compressed = engine.compress(text.as_bytes()).unwrap();
//! assert!(compressed.compressed_size < compressed.original_size);
//!
//! let restored = engine.decompress(&compressed).unwrap();
//! assert_eq!(restored, text.as_bytes());
//! ```

use crate::error::{Result, VersioningError};
use crate::logging::Logger;
use crate::types::{CompressedDiff, CompressionAlgorithm};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Payloads smaller than this are never worth an LZ4 attempt
const MIN_COMPRESSIBLE: usize = 64;

/// When and how payloads are compressed
///
/// # Examples
///
/// ```rust
/// use palimpsest::compression::CompressionStrategy;
///
/// let none = CompressionStrategy::None;
/// let fast = CompressionStrategy::Fast;
/// let adaptive = CompressionStrategy::Adaptive { min_size: 4096 };
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum CompressionStrategy {
    /// No compression
    None,

    /// LZ4 for every payload of at least 64 bytes (default)
    #[default]
    Fast,

    /// LZ4 only for payloads of at least `min_size` bytes
    Adaptive {
        /// Skip compression below this size
        min_size: usize,
    },
}

/// Compression statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionStats {
    /// Payloads stored LZ4-compressed
    pub payloads_compressed: usize,
    /// Payloads stored raw
    pub payloads_stored_raw: usize,
    /// Total bytes saved by compression
    pub bytes_saved: usize,
    /// Time spent compressing, in milliseconds
    pub compression_time_ms: u64,
    /// Time spent decompressing, in milliseconds
    pub decompression_time_ms: u64,
}

impl CompressionStats {
    /// Share of payloads that were compressed
    pub fn compression_ratio(&self) -> f64 {
        let total = self.payloads_compressed + self.payloads_stored_raw;
        if total == 0 {
            0.0
        } else {
            self.payloads_compressed as f64 / total as f64
        }
    }

    /// Average bytes saved per compressed payload
    pub fn avg_bytes_saved_per_payload(&self) -> usize {
        if self.payloads_compressed == 0 {
            0
        } else {
            self.bytes_saved / self.payloads_compressed
        }
    }
}

/// Compression engine
///
/// Applies the configured [`CompressionStrategy`] and keeps running
/// statistics.
#[derive(Debug)]
pub struct CompressionEngine {
    strategy: CompressionStrategy,
    stats: CompressionStats,
    logger: Logger,
}

impl CompressionEngine {
    /// Create a new compression engine with the specified strategy
    pub fn new(strategy: CompressionStrategy, logger: Logger) -> Self {
        Self {
            strategy,
            stats: CompressionStats::default(),
            logger,
        }
    }

    /// Strategy in use
    pub fn strategy(&self) -> &CompressionStrategy {
        &self.strategy
    }

    /// Get current compression statistics
    pub fn stats(&self) -> &CompressionStats {
        &self.stats
    }

    /// Reset statistics
    pub fn reset_stats(&mut self) {
        self.stats = CompressionStats::default();
    }

    /// Compress a payload according to the strategy
    ///
    /// Falls back to the `none` tag when the strategy skips the payload or
    /// LZ4 would not make it smaller.
    pub fn compress(&mut self, content: &[u8]) -> Result<CompressedDiff> {
        if !self.should_compress(content.len()) {
            self.logger
                .trace(format!("Storing {} byte payload raw (strategy)", content.len()));
            return Ok(self.store_raw(content));
        }

        let start = Instant::now();
        let compressed = compress_prepend_size(content);

        if compressed.len() < content.len() {
            let saved = content.len() - compressed.len();
            self.stats.bytes_saved += saved;
            self.stats.payloads_compressed += 1;
            self.stats.compression_time_ms += start.elapsed().as_millis() as u64;

            self.logger.debug(format!(
                "Compressed payload: {} -> {} bytes (saved {} bytes, {:.1}%)",
                content.len(),
                compressed.len(),
                saved,
                (saved as f64 / content.len() as f64) * 100.0
            ));

            Ok(CompressedDiff {
                algorithm: CompressionAlgorithm::Lz4,
                compressed_size: compressed.len(),
                original_size: content.len(),
                data: compressed,
            })
        } else {
            self.logger.trace(format!(
                "Compression not beneficial for {} byte payload, storing raw",
                content.len()
            ));
            Ok(self.store_raw(content))
        }
    }

    /// Compress with an explicit algorithm, ignoring the strategy
    pub fn compress_with(&mut self, algorithm: CompressionAlgorithm, content: &[u8]) -> Result<CompressedDiff> {
        match algorithm {
            CompressionAlgorithm::None => Ok(self.store_raw(content)),
            CompressionAlgorithm::Lz4 => {
                let start = Instant::now();
                let compressed = compress_prepend_size(content);
                self.stats.payloads_compressed += 1;
                self.stats.bytes_saved += content.len().saturating_sub(compressed.len());
                self.stats.compression_time_ms += start.elapsed().as_millis() as u64;
                Ok(CompressedDiff {
                    algorithm,
                    compressed_size: compressed.len(),
                    original_size: content.len(),
                    data: compressed,
                })
            }
        }
    }

    /// Restore the original bytes of a payload
    ///
    /// # Errors
    ///
    /// Returns [`VersioningError::Decompression`] if the LZ4 stream is
    /// corrupt or the restored size disagrees with `original_size`.
    pub fn decompress(&mut self, payload: &CompressedDiff) -> Result<Vec<u8>> {
        let start = Instant::now();

        let restored = match payload.algorithm {
            CompressionAlgorithm::None => payload.data.clone(),
            CompressionAlgorithm::Lz4 => decompress_size_prepended(&payload.data).map_err(|e| {
                VersioningError::decompression(format!("LZ4 decompression failed: {}", e))
            })?,
        };

        if restored.len() != payload.original_size {
            return Err(VersioningError::decompression(format!(
                "expected {} bytes after decompression, got {}",
                payload.original_size,
                restored.len()
            )));
        }

        self.stats.decompression_time_ms += start.elapsed().as_millis() as u64;
        self.logger
            .trace(format!("Decompressed {} bytes to {} bytes", payload.data.len(), restored.len()));
        Ok(restored)
    }

    /// Compress UTF-8 text
    pub fn compress_text(&mut self, text: &str) -> Result<CompressedDiff> {
        self.compress(text.as_bytes())
    }

    /// Decompress a payload that must hold UTF-8 text
    pub fn decompress_text(&mut self, payload: &CompressedDiff) -> Result<String> {
        let bytes = self.decompress(payload)?;
        String::from_utf8(bytes).map_err(|e| VersioningError::decompression(format!("payload is not UTF-8: {}", e)))
    }

    fn store_raw(&mut self, content: &[u8]) -> CompressedDiff {
        self.stats.payloads_stored_raw += 1;
        CompressedDiff {
            algorithm: CompressionAlgorithm::None,
            data: content.to_vec(),
            original_size: content.len(),
            compressed_size: content.len(),
        }
    }

    /// Determine if compression should be applied
    fn should_compress(&self, size: usize) -> bool {
        match &self.strategy {
            CompressionStrategy::None => false,
            CompressionStrategy::Fast => size >= MIN_COMPRESSIBLE,
            CompressionStrategy::Adaptive { min_size } => size >= (*min_size).max(MIN_COMPRESSIBLE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_compression_fast_strategy() {
        let mut engine = CompressionEngine::new(CompressionStrategy::Fast, Logger::disabled());

        // Small payload is stored raw
        let small = engine.compress(b"hello").unwrap();
        assert_eq!(small.algorithm, CompressionAlgorithm::None);
        assert_eq!(small.data, b"hello");
        assert_eq!(engine.stats().payloads_stored_raw, 1);
        assert_eq!(engine.decompress(&small).unwrap(), b"hello");

        // Repetitive payload is compressed
        let large = "a".repeat(10_000).into_bytes();
        let compressed = engine.compress(&large).unwrap();
        assert_eq!(compressed.algorithm, CompressionAlgorithm::Lz4);
        assert!(compressed.compressed_size < large.len());
        assert_eq!(engine.stats().payloads_compressed, 1);
        assert_eq!(engine.decompress(&compressed).unwrap(), large);
    }

    #[test]
    fn test_compression_none_strategy() {
        let mut engine = CompressionEngine::new(CompressionStrategy::None, Logger::disabled());
        let payload = "x".repeat(5_000);
        let stored = engine.compress_text(&payload).unwrap();
        assert_eq!(stored.algorithm, CompressionAlgorithm::None);
        assert_eq!(engine.decompress_text(&stored).unwrap(), payload);
    }

    #[test]
    fn test_compression_adaptive_strategy() {
        let mut engine =
            CompressionEngine::new(CompressionStrategy::Adaptive { min_size: 1_000 }, Logger::disabled());

        let below = "y".repeat(500);
        assert_eq!(engine.compress_text(&below).unwrap().algorithm, CompressionAlgorithm::None);

        let above = "y".repeat(2_000);
        assert_eq!(engine.compress_text(&above).unwrap().algorithm, CompressionAlgorithm::Lz4);
    }

    #[test]
    fn test_incompressible_payload_stored_raw() {
        let mut engine = CompressionEngine::new(CompressionStrategy::Fast, Logger::disabled());
        // Pseudo-random bytes from a linear congruential sequence
        let mut state = 12_345u32;
        let noise: Vec<u8> = (0..256)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            })
            .collect();
        let stored = engine.compress(&noise).unwrap();
        assert_eq!(engine.decompress(&stored).unwrap(), noise);
    }

    #[test]
    fn test_unicode_and_empty_round_trip() {
        let mut engine = CompressionEngine::new(CompressionStrategy::Fast, Logger::disabled());
        let greek = "ελληνικά ".repeat(50);
        for text in ["", "ä", "日本語のテキスト 🚀", greek.as_str()] {
            let stored = engine.compress_text(text).unwrap();
            assert_eq!(engine.decompress_text(&stored).unwrap(), text);
        }
    }

    #[test]
    fn test_explicit_algorithm() {
        let mut engine = CompressionEngine::new(CompressionStrategy::None, Logger::disabled());
        let stored = engine.compress_with(CompressionAlgorithm::Lz4, b"tiny").unwrap();
        assert_eq!(stored.algorithm, CompressionAlgorithm::Lz4);
        assert_eq!(engine.decompress(&stored).unwrap(), b"tiny");
    }

    #[test]
    fn test_corrupt_payload_is_rejected() {
        let mut engine = CompressionEngine::new(CompressionStrategy::Fast, Logger::disabled());
        let mut stored = engine.compress_text(&"z".repeat(1_000)).unwrap();
        stored.original_size += 1;
        assert!(matches!(
            engine.decompress(&stored),
            Err(VersioningError::Decompression(_))
        ));
    }

    #[test]
    fn test_compression_stats() {
        let stats = CompressionStats {
            payloads_compressed: 8,
            payloads_stored_raw: 2,
            bytes_saved: 1000,
            ..Default::default()
        };

        assert_eq!(stats.compression_ratio(), 0.8);
        assert_eq!(stats.avg_bytes_saved_per_payload(), 125);
    }

    #[test]
    #[traced_test]
    fn test_logs_through_injected_logger() {
        let text = "Rain again, and the lamps along the quay. ".repeat(30);
        CompressionEngine::new(CompressionStrategy::Fast, Logger::disabled())
            .compress(text.as_bytes())
            .unwrap();
        assert!(!logs_contain("Compressed payload"));

        CompressionEngine::new(CompressionStrategy::Fast, Logger::new("compression"))
            .compress(text.as_bytes())
            .unwrap();
        assert!(logs_contain("Compressed payload"));
        assert!(logs_contain("compression"));
    }
}
