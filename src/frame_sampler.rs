use image::RgbImage;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::error::{AnalysisError, PipelineResult};
use crate::video_processor::FrameSource;

/// 一次调用范围内的临时帧目录
///
/// 在采样开始时创建，`close` 或 drop 时删除；删除失败只记录警告。
pub struct FrameStore {
    dir: Option<TempDir>,
}

impl FrameStore {
    /// 在 `parent` 下（未指定时在系统临时目录下）创建 `temp_frames_*` 目录
    pub fn new(parent: Option<&Path>) -> PipelineResult<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("temp_frames_");
        let dir = match parent {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };
        debug!("📁 [帧采样] 临时帧目录: {}", dir.path().display());
        Ok(Self { dir: Some(dir) })
    }

    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(|d| d.path())
    }

    /// 保存一帧，返回文件路径
    pub fn save(&self, saved: usize, image: &RgbImage) -> PipelineResult<PathBuf> {
        let dir = self
            .dir
            .as_ref()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "临时帧目录已关闭"))?;
        let path = dir.path().join(format!("frame_{:05}.jpg", saved));
        image.save(&path).map_err(|e| match e {
            image::ImageError::IoError(io) => AnalysisError::Io(io),
            other => AnalysisError::Io(std::io::Error::new(std::io::ErrorKind::Other, other)),
        })?;
        Ok(path)
    }

    /// 删除临时目录；失败时记录 CleanupWarning，不向调用方返回错误
    pub fn close(mut self) {
        self.cleanup();
    }

    fn cleanup(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => debug!("🧹 [帧采样] 已清理临时帧目录: {}", path.display()),
                Err(e) => warn!("⚠️  [帧采样] CleanupWarning: 清理临时帧目录失败 {}: {}", path.display(), e),
            }
        }
    }
}

impl Drop for FrameStore {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// 重采样后序列中的一帧
#[derive(Debug, Clone, PartialEq)]
pub struct SampledFrame {
    /// 在定长序列中的位置
    pub index: usize,
    /// 对应的原始视频帧序号
    pub source_frame: u64,
    /// 临时帧文件
    pub path: PathBuf,
}

/// 采样结果：定长、保持时间顺序
#[derive(Debug, Clone)]
pub struct SampledSequence {
    pub frames: Vec<SampledFrame>,
    /// 重采样前实际提取的帧数
    pub extracted: usize,
}

/// 提取阶段保留下来的帧
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFrame {
    pub source_frame: u64,
    pub path: PathBuf,
}

/// 帧采样器：每隔 `frame_skip` 帧保留一帧，再重采样到 `seq_length`
#[derive(Debug, Clone, Copy)]
pub struct FrameSampler {
    frame_skip: usize,
    seq_length: usize,
}

impl FrameSampler {
    pub fn new(frame_skip: usize, seq_length: usize) -> Self {
        Self {
            frame_skip: frame_skip.max(1),
            seq_length: seq_length.max(1),
        }
    }

    /// 提取并重采样，输出恰好 `seq_length` 帧
    pub fn sample(
        &self,
        source: &mut dyn FrameSource,
        store: &FrameStore,
    ) -> PipelineResult<SampledSequence> {
        let extracted = self.extract(source, store, Some(self.seq_length))?;
        Ok(self.resample(extracted))
    }

    /// 顺序解码，每 `frame_skip` 帧保留该组的最后一帧（第 skip-1, 2·skip-1, … 帧），
    /// 直到流结束或达到 `max_frames`。不足一组的视频一帧也不保留。
    pub fn extract(
        &self,
        source: &mut dyn FrameSource,
        store: &FrameStore,
        max_frames: Option<usize>,
    ) -> PipelineResult<Vec<ExtractedFrame>> {
        let start = Instant::now();
        let total_frames = source.info().total_frames;
        let mut kept = Vec::new();
        let mut seen: u64 = 0;

        loop {
            if max_frames.is_some_and(|max| kept.len() >= max) {
                break;
            }
            let keep = (seen + 1) % self.frame_skip as u64 == 0;
            let Some(frame) = source.next_frame(keep)? else {
                break;
            };
            seen += 1;

            if let (true, Some(image)) = (keep, frame.image.as_ref()) {
                let path = store.save(kept.len(), image)?;
                kept.push(ExtractedFrame {
                    source_frame: frame.number,
                    path,
                });
            }
        }

        if kept.is_empty() {
            return Err(AnalysisError::NoFramesExtracted {
                frame_skip: self.frame_skip,
                total_frames: total_frames.max(seen),
            });
        }

        info!(
            "✅ [帧采样] 提取 {} 帧（已解码 {} 帧，间隔 {}），耗时: {:.2}秒",
            kept.len(),
            seen,
            self.frame_skip,
            start.elapsed().as_secs_f64()
        );
        Ok(kept)
    }

    /// 将提取结果补齐或均匀抽取到 `seq_length`
    pub fn resample(&self, extracted: Vec<ExtractedFrame>) -> SampledSequence {
        let count = extracted.len();
        let frames = resample_indices(count, self.seq_length)
            .into_iter()
            .enumerate()
            .map(|(index, src)| SampledFrame {
                index,
                source_frame: extracted[src].source_frame,
                path: extracted[src].path.clone(),
            })
            .collect::<Vec<_>>();

        if count < self.seq_length {
            debug!(
                "➕ [帧采样] 提取帧不足，重复最后一帧补齐 {} 帧",
                self.seq_length - count
            );
        } else if count > self.seq_length {
            debug!("➖ [帧采样] 从 {} 帧中均匀抽取 {} 帧", count, self.seq_length);
        }

        SampledSequence {
            frames,
            extracted: count,
        }
    }
}

/// 重采样下标
///
/// - `kept < target`：原序补齐，不足部分重复最后一个下标
/// - `kept > target`：在 `[0, kept-1]` 上等距取 `target` 个点，四舍五入
/// - `kept == 0`：返回空
pub fn resample_indices(kept: usize, target: usize) -> Vec<usize> {
    if kept == 0 || target == 0 {
        return Vec::new();
    }
    if kept <= target {
        return (0..target).map(|i| i.min(kept - 1)).collect();
    }
    if target == 1 {
        return vec![0];
    }

    let last = (kept - 1) as f64;
    let step = last / (target - 1) as f64;
    (0..target)
        .map(|i| ((i as f64 * step).round() as usize).min(kept - 1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_by_repeating_last_index() {
        let indices = resample_indices(5, 20);
        assert_eq!(indices.len(), 20);
        assert_eq!(&indices[..5], &[0, 1, 2, 3, 4]);
        assert_eq!(indices.iter().filter(|&&i| i == 4).count(), 16);
    }

    #[test]
    fn downsamples_evenly_with_endpoints() {
        let indices = resample_indices(60, 20);
        assert_eq!(indices.len(), 20);
        assert_eq!(indices[0], 0);
        assert_eq!(indices[19], 59);
        assert!(indices.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn exact_length_is_identity() {
        assert_eq!(resample_indices(4, 4), vec![0, 1, 2, 3]);
    }

    #[test]
    fn single_target_picks_first() {
        assert_eq!(resample_indices(10, 1), vec![0]);
        assert!(resample_indices(0, 5).is_empty());
    }

    #[test]
    fn frame_store_removes_directory_on_close() {
        let parent = tempfile::tempdir().unwrap();
        let store = FrameStore::new(Some(parent.path())).unwrap();
        let path = store.save(0, &RgbImage::new(8, 8)).unwrap();
        let dir = store.path().unwrap().to_path_buf();
        assert!(path.exists());
        store.close();
        assert!(!dir.exists());
    }

    #[test]
    fn frame_store_removes_directory_on_drop() {
        let parent = tempfile::tempdir().unwrap();
        let dir = {
            let store = FrameStore::new(Some(parent.path())).unwrap();
            store.save(0, &RgbImage::new(4, 4)).unwrap();
            store.path().unwrap().to_path_buf()
        };
        assert!(!dir.exists());
    }
}
