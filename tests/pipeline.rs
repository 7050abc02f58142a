use image::{Rgb, RgbImage};
use ndarray::{Array2, Array4, Axis};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use vision_shield::hashing::content_hash_bytes;
use vision_shield::model::HeadWeights;
use vision_shield::nn::{BiLstmLayerWeights, LinearWeights, LstmDirectionWeights};
use vision_shield::{
    AnalysisConfig, AnalysisError, AnalysisResult, CancelToken, ClassifierCheckpoint, DecodedFrame, ErrorKind,
    FrameSampler, FrameSource, FrameStore, ModelHandle, PipelineResult, Prediction, SpatialBackbone, VideoAnalyzer,
    VideoInfo,
};

const EMBED_DIM: usize = 4;

/// 内存中的合成视频：每帧颜色随帧号变化
struct SyntheticVideo {
    info: VideoInfo,
    next: u64,
}

impl SyntheticVideo {
    fn new(total_frames: u64) -> Self {
        Self {
            info: VideoInfo {
                fps: 30.0,
                width: 48,
                height: 32,
                total_frames,
            },
            next: 0,
        }
    }
}

impl FrameSource for SyntheticVideo {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn next_frame(&mut self, convert: bool) -> PipelineResult<Option<DecodedFrame>> {
        if self.next >= self.info.total_frames {
            return Ok(None);
        }
        let number = self.next;
        self.next += 1;
        let image = convert.then(|| {
            RgbImage::from_fn(self.info.width, self.info.height, |x, y| {
                let shade = (number * 7 % 256) as u8;
                Rgb([shade, (x * 5) as u8, (y * 7) as u8])
            })
        });
        Ok(Some(DecodedFrame { number, image }))
    }
}

/// 每个通道的均值加上整体均值作为嵌入
struct MeanBackbone;

impl SpatialBackbone for MeanBackbone {
    fn feature_dim(&self) -> usize {
        EMBED_DIM
    }

    fn input_size(&self) -> u32 {
        16
    }

    fn embed_batch(&self, batch: &Array4<f32>) -> PipelineResult<Array2<f32>> {
        let mut out = Array2::zeros((batch.shape()[0], EMBED_DIM));
        for (n, sample) in batch.axis_iter(Axis(0)).enumerate() {
            for c in 0..3 {
                out[[n, c]] = sample.index_axis(Axis(0), c).mean().unwrap_or(0.0);
            }
            out[[n, 3]] = sample.mean().unwrap_or(0.0);
        }
        Ok(out)
    }
}

struct FailingBackbone;

impl SpatialBackbone for FailingBackbone {
    fn feature_dim(&self) -> usize {
        EMBED_DIM
    }

    fn input_size(&self) -> u32 {
        16
    }

    fn embed_batch(&self, _batch: &Array4<f32>) -> PipelineResult<Array2<f32>> {
        Err(AnalysisError::inference("backbone", "device lost"))
    }
}

fn matrix(rows: usize, cols: usize, seed: usize) -> Vec<Vec<f32>> {
    (0..rows)
        .map(|r| {
            (0..cols)
                .map(|c| ((r * 7 + c * 3 + seed) % 11) as f32 * 0.05 - 0.25)
                .collect()
        })
        .collect()
}

fn direction(input: usize, hidden: usize, seed: usize) -> LstmDirectionWeights {
    LstmDirectionWeights {
        w_ih: matrix(4 * hidden, input, seed),
        w_hh: matrix(4 * hidden, hidden, seed + 1),
        b_ih: vec![0.01; 4 * hidden],
        b_hh: vec![-0.02; 4 * hidden],
    }
}

fn models(backbone: Box<dyn SpatialBackbone>) -> ModelHandle {
    let (fused, hidden) = (3, 2);
    let checkpoint = ClassifierCheckpoint {
        fusion: LinearWeights {
            weight: matrix(fused, EMBED_DIM, 1),
            bias: vec![0.1; fused],
        },
        lstm: vec![BiLstmLayerWeights {
            forward: direction(fused, hidden, 2),
            backward: direction(fused, hidden, 5),
        }],
        head: HeadWeights {
            hidden: LinearWeights {
                weight: matrix(hidden, 2 * hidden, 3),
                bias: vec![0.05; hidden],
            },
            output: LinearWeights {
                weight: matrix(2, hidden, 4),
                bias: vec![0.0, 0.2],
            },
        },
    };
    let (fusion, classifier) = checkpoint.build().unwrap();
    ModelHandle::new(backbone, fusion, classifier).unwrap()
}

fn config(frame_skip: usize, seq_length: usize, heatmap_top_k: usize) -> AnalysisConfig {
    AnalysisConfig {
        frame_skip,
        seq_length,
        heatmap_top_k,
        max_pipeline_secs: None,
    }
}

fn dir_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path).unwrap().next().is_none()
}

fn run(
    models: &ModelHandle,
    config: &AnalysisConfig,
    total_frames: u64,
    hash: &str,
    output: &Path,
    temp_parent: &Path,
    cancel: &CancelToken,
) -> PipelineResult<AnalysisResult> {
    let mut video = SyntheticVideo::new(total_frames);
    VideoAnalyzer::new(models, config)
        .with_temp_parent(Some(temp_parent))
        .analyze_source(&mut video, hash, output, cancel)
}

#[test]
fn short_video_yields_full_result() {
    let models = models(Box::new(MeanBackbone));
    let config = config(30, 20, 5);
    let output = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    let hash = content_hash_bytes(b"short clip");

    let result = run(&models, &config, 150, &hash, output.path(), temp.path(), &CancelToken::new()).unwrap();

    assert_eq!(result.frames_analyzed, 20);
    assert_eq!(result.frame_analysis.len(), 20);
    let indices: Vec<usize> = result.frame_analysis.iter().map(|r| r.index).collect();
    assert_eq!(indices, (0..20).collect::<Vec<_>>());

    let probs = result.classification.probabilities;
    assert!((probs.real + probs.fake - 1.0).abs() < 1e-9);
    assert!((result.classification.confidence - probs.real.max(probs.fake)).abs() < 1e-12);
    let expected = if probs.fake > probs.real {
        Prediction::Deepfake
    } else {
        Prediction::Real
    };
    assert_eq!(result.classification.prediction, expected);

    let scores: Vec<f64> = result.frame_analysis.iter().map(|r| r.probability_fake).collect();
    assert!(scores.iter().all(|p| (0.0..=1.0).contains(p)));
    let max = scores.iter().cloned().fold(f64::MIN, f64::max);
    let avg = scores.iter().sum::<f64>() / scores.len() as f64;
    assert!((result.max_fake_probability - max).abs() < 1e-12);
    assert!((result.avg_fake_probability - avg).abs() < 1e-12);

    assert_eq!(result.heatmaps.len(), 5);
    let frames: Vec<usize> = result.heatmaps.iter().map(|h| h.frame_index).collect();
    assert!(frames.windows(2).all(|w| w[0] < w[1]));
    for heatmap in &result.heatmaps {
        assert_eq!(heatmap.image_reference, format!("heatmap_frame_{:03}.jpg", heatmap.frame_index));
        assert!(output.path().join(&heatmap.image_reference).exists());
        let curve_value = result.frame_analysis[heatmap.frame_index].probability_fake;
        assert_eq!(heatmap.probability_fake, curve_value);
    }

    assert_eq!(result.video_hash, hash);
    assert_eq!(result.resolution, "48x32");
    assert_eq!(result.frame_rate, "30.00 fps");
    assert_eq!(result.duration, 5);
    assert!(dir_is_empty(temp.path()));
}

#[test]
fn short_video_pads_with_last_extracted_frame() {
    let temp = tempfile::tempdir().unwrap();
    let store = FrameStore::new(Some(temp.path())).unwrap();
    let sequence = FrameSampler::new(30, 20)
        .sample(&mut SyntheticVideo::new(150), &store)
        .unwrap();

    assert_eq!(sequence.extracted, 5);
    assert_eq!(sequence.frames.len(), 20);
    let sources: Vec<u64> = sequence.frames.iter().map(|f| f.source_frame).collect();
    assert_eq!(&sources[..5], &[29, 59, 89, 119, 149]);
    assert_eq!(sources.iter().filter(|&&s| s == 149).count(), 16);
    store.close();
}

#[test]
fn long_video_resamples_across_all_extracted_frames() {
    let temp = tempfile::tempdir().unwrap();
    let store = FrameStore::new(Some(temp.path())).unwrap();
    let sampler = FrameSampler::new(30, 20);
    let extracted = sampler
        .extract(&mut SyntheticVideo::new(1800), &store, None)
        .unwrap();
    assert_eq!(extracted.len(), 60);

    let sequence = sampler.resample(extracted);
    assert_eq!(sequence.frames.len(), 20);
    assert_eq!(sequence.frames[0].source_frame, 29);
    assert_eq!(sequence.frames[19].source_frame, 1799);
    assert!(sequence
        .frames
        .windows(2)
        .all(|w| w[0].source_frame < w[1].source_frame));
    store.close();
}

#[test]
fn frame_skip_beyond_video_length_extracts_nothing() {
    let models = models(Box::new(MeanBackbone));
    let output = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();

    let err = run(
        &models,
        &config(30, 20, 5),
        20,
        "hash",
        output.path(),
        temp.path(),
        &CancelToken::new(),
    )
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NoFramesExtracted);
    assert!(dir_is_empty(temp.path()));
    assert!(dir_is_empty(output.path()));
}

#[test]
fn same_content_gives_same_analysis() {
    let models = models(Box::new(MeanBackbone));
    let config = config(10, 8, 3);
    let hash = content_hash_bytes(b"replayed bytes");
    let temp = tempfile::tempdir().unwrap();
    let (out_a, out_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());

    let a = run(&models, &config, 120, &hash, out_a.path(), temp.path(), &CancelToken::new()).unwrap();
    let b = run(&models, &config, 120, &hash, out_b.path(), temp.path(), &CancelToken::new()).unwrap();

    assert_eq!(a.classification, b.classification);
    assert_eq!(a.frame_analysis, b.frame_analysis);
    assert_eq!(a.heatmaps, b.heatmaps);
    assert_eq!(a.max_fake_probability.to_bits(), b.max_fake_probability.to_bits());
    assert_ne!(a.video_id, b.video_id);
}

#[test]
fn heatmap_count_is_bounded_by_sequence_length() {
    let models = models(Box::new(MeanBackbone));
    let temp = tempfile::tempdir().unwrap();

    let output = tempfile::tempdir().unwrap();
    let result = run(&models, &config(5, 3, 10), 60, "abc", output.path(), temp.path(), &CancelToken::new()).unwrap();
    assert_eq!(result.heatmaps.len(), 3);
    let unique: HashSet<usize> = result.heatmaps.iter().map(|h| h.frame_index).collect();
    assert_eq!(unique.len(), 3);

    let output = tempfile::tempdir().unwrap();
    let result = run(&models, &config(5, 3, 0), 60, "abc", output.path(), temp.path(), &CancelToken::new()).unwrap();
    assert!(result.heatmaps.is_empty());
    assert_eq!(result.frames_analyzed, 3);
}

#[test]
fn backbone_failure_is_fatal_and_cleans_up() {
    let models = models(Box::new(FailingBackbone));
    let output = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();

    let err = run(&models, &config(30, 20, 5), 150, "h", output.path(), temp.path(), &CancelToken::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModelInference);
    assert!(err.is_fatal());
    assert!(dir_is_empty(temp.path()));
}

#[test]
fn cancelled_token_stops_before_sampling() {
    let models = models(Box::new(MeanBackbone));
    let output = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = run(&models, &config(30, 20, 5), 150, "h", output.path(), temp.path(), &cancel).unwrap_err();
    assert!(matches!(err, AnalysisError::Cancelled { stage: "sampling" }));
    assert!(dir_is_empty(temp.path()));
}

#[test]
fn expired_deadline_cancels_analysis() {
    let models = models(Box::new(MeanBackbone));
    let output = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    let cancel = CancelToken::with_timeout(Duration::ZERO);

    let err = run(&models, &config(30, 20, 5), 150, "h", output.path(), temp.path(), &cancel).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(dir_is_empty(temp.path()));
}
