use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, Rgb, RgbImage};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{AnalysisError, PipelineResult};
use crate::frame_sampler::SampledFrame;
use crate::hashing::unit_float;
use crate::metadata::{FrameRecord, HeatmapRecord};

/// 默认渲染的帧数
pub const DEFAULT_TOP_K: usize = 5;
const JPEG_QUALITY: u8 = 95;
const OVERLAY_COLOR: [u8; 3] = [255, 0, 0];
const MAX_ALPHA: f64 = 0.7;
const TEXT_COLOR: [u8; 3] = [255, 255, 255];
const SHADOW_COLOR: [u8; 3] = [0, 0, 0];

/// 可疑度分级：> 0.7 High，> 0.4 Medium，其余 Low
pub fn confidence_bucket(probability: f64) -> &'static str {
    if probability > 0.7 {
        "High"
    } else if probability > 0.4 {
        "Medium"
    } else {
        "Low"
    }
}

/// 合成的椭圆高亮区域
///
/// 位置由 `(内容哈希, 帧序号)` 决定，尺寸与透明度随该帧可疑度变化。
/// 它和逐帧曲线一样是合成的可视化，不是模型学到的注意力区域。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HighlightRegion {
    pub center_x: i64,
    pub center_y: i64,
    pub radius_x: i64,
    pub radius_y: i64,
    pub alpha: f64,
}

impl HighlightRegion {
    /// 由内容哈希和帧序号确定位置，由可疑度确定大小与透明度
    pub fn synthesize(
        content_hash: &str,
        frame_index: usize,
        probability: f64,
        width: u32,
        height: u32,
    ) -> Self {
        let (w, h) = (width as f64, height as f64);
        let ux = unit_float(content_hash, "heatmap_center_x", frame_index as u64);
        let uy = unit_float(content_hash, "heatmap_center_y", frame_index as u64);
        Self {
            center_x: (w * (0.3 + ux * 0.4)) as i64,
            center_y: (h * (0.2 + uy * 0.6)) as i64,
            radius_x: (w * (0.1 + probability * 0.2)) as i64,
            radius_y: (h * (0.1 + probability * 0.2)) as i64,
            alpha: (probability * 0.8).min(MAX_ALPHA),
        }
    }

    pub fn contains(&self, x: i64, y: i64) -> bool {
        let dx = (x - self.center_x) as f64;
        let dy = (y - self.center_y) as f64;
        let rx2 = (self.radius_x * self.radius_x) as f64 + 1.0;
        let ry2 = (self.radius_y * self.radius_y) as f64 + 1.0;
        dx * dx / rx2 + dy * dy / ry2 <= 1.0
    }
}

/// 可疑度降序取前 K 帧；相同分数时序号小的优先
pub fn select_top_k(curve: &[FrameRecord], k: usize) -> Vec<FrameRecord> {
    let mut sorted = curve.to_vec();
    sorted.sort_by(|a, b| {
        b.probability_fake
            .total_cmp(&a.probability_fake)
            .then(a.index.cmp(&b.index))
    });
    sorted.truncate(k);
    sorted
}

/// 热力图定位器：对可疑度最高的 K 帧渲染标注图像
#[derive(Debug, Clone, Copy)]
pub struct HeatmapLocalizer {
    top_k: usize,
}

impl HeatmapLocalizer {
    pub fn new(top_k: usize) -> Self {
        Self { top_k }
    }

    /// 渲染前 K 帧的热力图；单帧失败只跳过该帧，结果按 frame_index 升序
    pub fn localize(
        &self,
        content_hash: &str,
        curve: &[FrameRecord],
        frames: &[SampledFrame],
        output_dir: &Path,
    ) -> Vec<HeatmapRecord> {
        let start = Instant::now();
        let selected = select_top_k(curve, self.top_k);
        if selected.is_empty() {
            return Vec::new();
        }

        if let Err(e) = std::fs::create_dir_all(output_dir) {
            warn!(
                "⚠️  [热力图] 无法创建输出目录 {}，跳过全部热力图: {}",
                output_dir.display(),
                e
            );
            return Vec::new();
        }

        let mut records = Vec::with_capacity(selected.len());
        for record in &selected {
            match self.render_one(content_hash, record, frames, output_dir) {
                Ok(heatmap) => records.push(heatmap),
                Err(e) => warn!("⚠️  [热力图] {}，已跳过", e),
            }
        }
        records.sort_by_key(|r| r.frame_index);

        info!(
            "✅ [热力图] 生成 {}/{} 张，耗时: {:.2}秒",
            records.len(),
            selected.len(),
            start.elapsed().as_secs_f64()
        );
        records
    }

    fn render_one(
        &self,
        content_hash: &str,
        record: &FrameRecord,
        frames: &[SampledFrame],
        output_dir: &Path,
    ) -> PipelineResult<HeatmapRecord> {
        let frame = frames
            .get(record.index)
            .ok_or_else(|| AnalysisError::heatmap(record.index, "序列中没有该帧"))?;
        let mut image = image::open(&frame.path)
            .map_err(|e| AnalysisError::heatmap(record.index, format!("无法解码帧图像: {e}")))?
            .to_rgb8();

        let p = record.probability_fake;
        let region =
            HighlightRegion::synthesize(content_hash, record.index, p, image.width(), image.height());
        blend_region(&mut image, &region);

        let scale = (image.width() / 320).max(1);
        let line1 = format!("Frame {} - Manipulation: {:.1}%", frame.source_frame, p * 100.0);
        let line2 = format!("Confidence: {}", confidence_bucket(p));
        draw_text(&mut image, 20, 20, &line1, scale);
        draw_text(&mut image, 20, 20 + 12 * scale, &line2, scale);

        let file_name = format!("heatmap_frame_{:03}.jpg", record.index);
        let path = output_dir.join(&file_name);
        save_jpeg(&image, &path).map_err(|e| AnalysisError::heatmap(record.index, e))?;

        debug!(
            "🔥 [热力图] 帧 {} (原始帧 {}) 可疑度 {:.2}% → {}",
            record.index,
            frame.source_frame,
            p * 100.0,
            path.display()
        );

        Ok(HeatmapRecord {
            frame_index: record.index,
            probability_fake: p,
            image_reference: file_name,
        })
    }
}

/// 将纯色按 alpha 混合进椭圆区域
pub fn blend_region(image: &mut RgbImage, region: &HighlightRegion) {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let x0 = (region.center_x - region.radius_x - 1).max(0);
    let x1 = (region.center_x + region.radius_x + 1).min(w - 1);
    let y0 = (region.center_y - region.radius_y - 1).max(0);
    let y1 = (region.center_y + region.radius_y + 1).min(h - 1);
    let a = region.alpha;

    for y in y0..=y1 {
        for x in x0..=x1 {
            if !region.contains(x, y) {
                continue;
            }
            let px = image.get_pixel_mut(x as u32, y as u32);
            for c in 0..3 {
                let blended = px[c] as f64 * (1.0 - a) + OVERLAY_COLOR[c] as f64 * a;
                px[c] = blended.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

/// 用 8x8 点阵字体绘制文字（带 1 像素阴影），超出图像的部分直接裁掉
fn draw_text(image: &mut RgbImage, x: u32, y: u32, text: &str, scale: u32) {
    draw_glyphs(image, x + 1, y + 1, text, scale, SHADOW_COLOR);
    draw_glyphs(image, x, y, text, scale, TEXT_COLOR);
}

fn draw_glyphs(image: &mut RgbImage, x: u32, y: u32, text: &str, scale: u32, color: [u8; 3]) {
    let (w, h) = image.dimensions();
    for (n, ch) in text.chars().enumerate() {
        let Some(glyph) = BASIC_FONTS.get(ch) else {
            continue;
        };
        let gx = x + n as u32 * 8 * scale;
        for (row, bits) in glyph.iter().enumerate() {
            for col in 0..8u32 {
                if bits & (1 << col) == 0 {
                    continue;
                }
                for dy in 0..scale {
                    for dx in 0..scale {
                        let px = gx + col * scale + dx;
                        let py = y + row as u32 * scale + dy;
                        if px < w && py < h {
                            image.put_pixel(px, py, Rgb(color));
                        }
                    }
                }
            }
        }
    }
}

fn save_jpeg(image: &RgbImage, path: &Path) -> Result<(), String> {
    let file = File::create(path).map_err(|e| format!("无法创建 {}: {}", path.display(), e))?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY)
        .encode(image.as_raw(), image.width(), image.height(), ColorType::Rgb8)
        .map_err(|e| format!("写入 {} 失败: {}", path.display(), e))
}
