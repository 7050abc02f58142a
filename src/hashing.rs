use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::{AnalysisError, PipelineResult};

/// 读取块大小
const CHUNK_SIZE: usize = 64 * 1024;

/// 计算视频文件完整字节内容的 SHA-256（十六进制小写）
///
/// 相同字节内容始终得到相同哈希，后续的逐帧曲线和热力图位置都以它为种子。
pub fn content_hash(path: impl AsRef<Path>) -> PipelineResult<String> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| AnalysisError::video_open(path, e))?;
    let mut reader = BufReader::with_capacity(CHUNK_SIZE, file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| AnalysisError::video_open(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// 内存字节的内容哈希（测试与已读入内存的调用方使用）
pub fn content_hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// 无状态的哈希到浮点映射，返回 [0, 1) 内的值
///
/// 只依赖 `(content_hash, label, index)`，并发调用之间不存在共享的随机状态。
pub fn unit_float(content_hash: &str, label: &str, index: u64) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(content_hash.as_bytes());
    hasher.update([0u8]);
    hasher.update(label.as_bytes());
    hasher.update([0u8]);
    hasher.update(index.to_le_bytes());
    let digest = hasher.finalize();

    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    // 取高 53 位，保证精确落在 f64 尾数范围内
    (u64::from_le_bytes(word) >> 11) as f64 / (1u64 << 53) as f64
}

/// 以十六进制解析哈希的一段作为整数；不是合法十六进制时退化为该段的摘要
pub fn hex_segment(content_hash: &str, start: usize, end: usize) -> u64 {
    content_hash
        .get(start..end)
        .and_then(|s| u64::from_str_radix(s, 16).ok())
        .unwrap_or_else(|| (unit_float(content_hash, "segment", start as u64) * u32::MAX as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_and_bytes_hash_agree() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not really a video").unwrap();
        let from_file = content_hash(file.path()).unwrap();
        assert_eq!(from_file, content_hash_bytes(b"not really a video"));
        assert_eq!(from_file.len(), 64);
    }

    #[test]
    fn missing_file_is_video_open_error() {
        let err = content_hash("/definitely/not/here.mp4").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::VideoOpen);
    }

    #[test]
    fn unit_float_is_stable_and_bounded() {
        let hash = content_hash_bytes(b"abc");
        for i in 0..200 {
            let a = unit_float(&hash, "noise", i);
            let b = unit_float(&hash, "noise", i);
            assert_eq!(a.to_bits(), b.to_bits());
            assert!((0.0..1.0).contains(&a));
        }
        assert_ne!(unit_float(&hash, "noise", 0), unit_float(&hash, "center_x", 0));
    }

    #[test]
    fn hex_segment_parses_hex() {
        assert_eq!(hex_segment("00000000000000ff", 8, 16), 0xff);
        let fallback = hex_segment("zz", 8, 16);
        assert!(fallback <= u32::MAX as u64);
    }
}
