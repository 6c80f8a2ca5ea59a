//! 消息载荷压缩
//!
//! 小于阈值的载荷不压缩；压缩后没有变小则保留原文。
//! 解压失败时返回原内容，不向调用方抛错。

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::config::DedupConfig;

/// 压缩结果，只在编码过程中短暂存在
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionResult {
    pub content: Vec<u8>,
    pub is_compressed: bool,
    pub original_size: usize,
    pub compressed_size: usize,
}

impl CompressionResult {
    fn uncompressed(content: &[u8]) -> Self {
        Self {
            content: content.to_vec(),
            is_compressed: false,
            original_size: content.len(),
            compressed_size: content.len(),
        }
    }

    /// 压缩率（压缩后 / 压缩前）
    pub fn ratio(&self) -> f64 {
        if self.original_size == 0 {
            return 1.0;
        }
        self.compressed_size as f64 / self.original_size as f64
    }
}

/// 压缩统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompressionStats {
    pub compressed_count: u64,
    pub skipped_count: u64,
    pub bytes_saved: u64,
    pub decompress_failures: u64,
}

#[derive(Debug)]
pub struct Compressor {
    threshold: usize,
    level: i32,
    enabled: bool,
    compressed_count: AtomicU64,
    skipped_count: AtomicU64,
    bytes_saved: AtomicU64,
    decompress_failures: AtomicU64,
}

impl Compressor {
    pub fn new(threshold: usize, level: i32) -> Self {
        Self {
            threshold,
            level,
            enabled: true,
            compressed_count: AtomicU64::new(0),
            skipped_count: AtomicU64::new(0),
            bytes_saved: AtomicU64::new(0),
            decompress_failures: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &DedupConfig) -> Self {
        let mut compressor = Self::new(config.compression_threshold, config.compression_level);
        compressor.enabled = config.compression_enabled;
        compressor
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// 压缩载荷
    pub fn compress(&self, content: &[u8]) -> CompressionResult {
        if !self.enabled || content.len() < self.threshold {
            self.skipped_count.fetch_add(1, Ordering::Relaxed);
            return CompressionResult::uncompressed(content);
        }

        let compressed = match zstd::encode_all(content, self.level) {
            Ok(data) => data,
            Err(e) => {
                warn!("⚠️ 压缩失败，保留原文: {}", e);
                self.skipped_count.fetch_add(1, Ordering::Relaxed);
                return CompressionResult::uncompressed(content);
            }
        };

        if compressed.len() >= content.len() {
            debug!(
                "压缩无收益，保留原文: {} -> {} bytes",
                content.len(),
                compressed.len()
            );
            self.skipped_count.fetch_add(1, Ordering::Relaxed);
            return CompressionResult::uncompressed(content);
        }

        self.compressed_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_saved
            .fetch_add((content.len() - compressed.len()) as u64, Ordering::Relaxed);
        debug!("🗜️ 载荷已压缩: {} -> {} bytes", content.len(), compressed.len());

        CompressionResult {
            original_size: content.len(),
            compressed_size: compressed.len(),
            content: compressed,
            is_compressed: true,
        }
    }

    /// 解压载荷，`is_compressed` 为 false 时原样返回
    pub fn decompress(&self, content: &[u8], is_compressed: bool) -> Vec<u8> {
        if !is_compressed {
            return content.to_vec();
        }
        match zstd::decode_all(content) {
            Ok(data) => data,
            Err(e) => {
                warn!("⚠️ 解压失败，返回原内容: {}", e);
                self.decompress_failures.fetch_add(1, Ordering::Relaxed);
                content.to_vec()
            }
        }
    }

    pub fn stats(&self) -> CompressionStats {
        CompressionStats {
            compressed_count: self.compressed_count.load(Ordering::Relaxed),
            skipped_count: self.skipped_count.load(Ordering::Relaxed),
            bytes_saved: self.bytes_saved.load(Ordering::Relaxed),
            decompress_failures: self.decompress_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::from_config(&DedupConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_below_threshold_not_compressed() {
        let compressor = Compressor::new(1024, 3);
        let payload = b"hi";
        let result = compressor.compress(payload);
        assert!(!result.is_compressed);
        assert_eq!(result.content, payload.to_vec());
        assert_eq!(result.original_size, 2);

        let almost = vec![b'a'; 1023];
        assert!(!compressor.compress(&almost).is_compressed);
    }

    #[test]
    fn test_compress_decompress_roundtrip() {
        let compressor = Compressor::new(1024, 3);
        let payload = "重复的聊天内容 repeated chat content ".repeat(200).into_bytes();
        let result = compressor.compress(&payload);
        assert!(result.is_compressed);
        assert!(result.compressed_size < result.original_size);
        assert!(result.ratio() < 1.0);

        let restored = compressor.decompress(&result.content, result.is_compressed);
        assert_eq!(restored, payload);

        let stats = compressor.stats();
        assert_eq!(stats.compressed_count, 1);
        assert!(stats.bytes_saved > 0);
    }

    #[test]
    fn test_incompressible_payload_kept() {
        use rand::RngCore;
        let compressor = Compressor::new(16, 3);
        let mut payload = vec![0u8; 4096];
        rand::thread_rng().fill_bytes(&mut payload);

        let result = compressor.compress(&payload);
        assert!(!result.is_compressed);
        assert_eq!(result.content, payload);
    }

    #[test]
    fn test_decompress_garbage_returns_input() {
        let compressor = Compressor::new(16, 3);
        let garbage = b"definitely not zstd".to_vec();
        assert_eq!(compressor.decompress(&garbage, true), garbage);
        assert_eq!(compressor.stats().decompress_failures, 1);
    }

    #[test]
    fn test_disabled_compressor() {
        let config = DedupConfig {
            compression_enabled: false,
            ..DedupConfig::default()
        };
        let compressor = Compressor::from_config(&config);
        let payload = vec![b'x'; 8192];
        assert!(!compressor.compress(&payload).is_compressed);
    }
}
