use ffmpeg_next as ffmpeg;
use image::RgbImage;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{AnalysisError, PipelineResult};

/// 视频基本信息
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    /// 帧率；无法获取时为 0
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// 原始总帧数（容器未记录时按时长估算）
    pub total_frames: u64,
}

impl VideoInfo {
    /// 时长（秒，取整）；帧率未知时为 0
    pub fn duration_secs(&self) -> u64 {
        if self.fps > 0.0 {
            (self.total_frames as f64 / self.fps) as u64
        } else {
            0
        }
    }

    /// 例如 "29.97 fps"
    pub fn frame_rate_label(&self) -> String {
        format!("{:.2} fps", self.fps)
    }

    /// 例如 "1920x1080"
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// 解码出的一帧
#[derive(Debug)]
pub struct DecodedFrame {
    /// 原始视频中的帧序号（从 0 开始）
    pub number: u64,
    /// 仅在调用方要求转换时才有 RGB 图像
    pub image: Option<RgbImage>,
}

/// 顺序帧来源
///
/// 帧采样只需要按时间顺序逐帧读取，因此这里不提供随机访问。
pub trait FrameSource {
    fn info(&self) -> &VideoInfo;

    /// 读取下一帧；`convert` 为 false 时跳过像素格式转换。流结束返回 `None`。
    fn next_frame(&mut self, convert: bool) -> PipelineResult<Option<DecodedFrame>>;
}

/// 基于 FFmpeg 的视频解码器
pub struct VideoProcessor {
    input_path: PathBuf,
    input: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Video,
    scaler: Option<ffmpeg::software::scaling::Context>,
    stream_index: usize,
    info: VideoInfo,
    decoded: u64,
    eof_sent: bool,
}

/// 初始化 FFmpeg 并把日志级别压到 ERROR，抑制警告和信息消息
fn init_ffmpeg() -> Result<(), ffmpeg::Error> {
    ffmpeg::init()?;
    unsafe {
        ffmpeg::sys::av_log_set_level(ffmpeg::sys::AV_LOG_ERROR as i32);
    }
    Ok(())
}

impl VideoProcessor {
    /// 打开视频并创建解码器；文件不可读或编码不受支持时返回 `VideoOpen`
    pub fn open(input_path: impl AsRef<Path>) -> PipelineResult<Self> {
        let input_path = input_path.as_ref().to_path_buf();
        let open_err = |e: &dyn std::fmt::Display| AnalysisError::video_open(&input_path, e);

        init_ffmpeg().map_err(|e| open_err(&format!("初始化 FFmpeg 失败: {}", e)))?;

        let input = ffmpeg::format::input(&input_path).map_err(|e| open_err(&e))?;

        let (stream_index, fps, params, stream_frames) = {
            let stream = input
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or_else(|| open_err(&"未找到视频流"))?;
            let fps = rational_to_fps(stream.avg_frame_rate())
                .or_else(|| rational_to_fps(stream.rate()))
                .unwrap_or(0.0);
            (stream.index(), fps, stream.parameters(), stream.frames())
        };

        let decoder = ffmpeg::codec::context::Context::from_parameters(params)
            .map_err(|e| open_err(&format!("无法创建解码器上下文: {}", e)))?
            .decoder()
            .video()
            .map_err(|e| open_err(&format!("无法创建视频解码器: {}", e)))?;

        let total_frames = if stream_frames > 0 {
            stream_frames as u64
        } else {
            // 容器没有记录帧数时按时长估算
            let duration = input.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64;
            if duration > 0.0 && fps > 0.0 {
                (duration * fps).round() as u64
            } else {
                0
            }
        };

        let info = VideoInfo {
            fps,
            width: decoder.width(),
            height: decoder.height(),
            total_frames,
        };
        debug!(
            "🎞️  [视频解码] {}: {}, {}, 原始帧数 {}",
            input_path.display(),
            info.resolution(),
            info.frame_rate_label(),
            info.total_frames
        );

        Ok(Self {
            input_path,
            input,
            decoder,
            scaler: None,
            stream_index,
            info,
            decoded: 0,
            eof_sent: false,
        })
    }

    /// 将解码帧转换为 RGB24 图像
    fn convert(&mut self, frame: &ffmpeg::frame::Video) -> PipelineResult<RgbImage> {
        let (width, height) = (frame.width(), frame.height());
        let needs_new_scaler = match &self.scaler {
            Some(scaler) => {
                scaler.input().width != width
                    || scaler.input().height != height
                    || scaler.input().format != frame.format()
            }
            None => true,
        };
        if needs_new_scaler {
            let scaler = ffmpeg::software::scaling::Context::get(
                frame.format(),
                width,
                height,
                ffmpeg::format::Pixel::RGB24,
                width,
                height,
                ffmpeg::software::scaling::Flags::BILINEAR,
            )
            .map_err(|e| AnalysisError::video_open(&self.input_path, format!("无法创建缩放器: {}", e)))?;
            self.scaler = Some(scaler);
        }

        let mut rgb_frame = ffmpeg::frame::Video::empty();
        if let Some(scaler) = self.scaler.as_mut() {
            scaler
                .run(frame, &mut rgb_frame)
                .map_err(|e| AnalysisError::video_open(&self.input_path, format!("像素格式转换失败: {}", e)))?;
        }
        frame_to_image(&rgb_frame).ok_or_else(|| {
            warn!(
                "⚠️  [视频解码] 帧 {} 的 RGB 数据不完整 ({}x{}, stride {})",
                self.decoded,
                rgb_frame.width(),
                rgb_frame.height(),
                rgb_frame.stride(0)
            );
            AnalysisError::video_open(&self.input_path, "转换后的帧数据不完整")
        })
    }
}

impl FrameSource for VideoProcessor {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn next_frame(&mut self, convert: bool) -> PipelineResult<Option<DecodedFrame>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                let number = self.decoded;
                self.decoded += 1;
                let image = if convert {
                    Some(self.convert(&decoded)?)
                } else {
                    None
                };
                return Ok(Some(DecodedFrame { number, image }));
            }

            if self.eof_sent {
                return Ok(None);
            }

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {
                    if packet.stream() != self.stream_index {
                        continue;
                    }
                    if let Err(e) = self.decoder.send_packet(&packet) {
                        // 发送数据包失败，跳过这个数据包
                        debug!("⚠️  [视频解码] 跳过无法解码的数据包: {}", e);
                    }
                }
                Err(ffmpeg::Error::Eof) => {
                    self.decoder.send_eof().ok();
                    self.eof_sent = true;
                }
                Err(e) => {
                    warn!(
                        "⚠️  [视频解码] 读取数据包失败，按流结束处理: {} ({})",
                        e,
                        self.input_path.display()
                    );
                    self.decoder.send_eof().ok();
                    self.eof_sent = true;
                }
            }
        }
    }
}

fn rational_to_fps(rate: ffmpeg::Rational) -> Option<f64> {
    if rate.numerator() > 0 && rate.denominator() > 0 {
        Some(rate.numerator() as f64 / rate.denominator() as f64)
    } else {
        None
    }
}

/// 将 RGB24 的 FFmpeg 帧转换为图像
fn frame_to_image(frame: &ffmpeg::frame::Video) -> Option<RgbImage> {
    rows_to_image(frame.data(0), frame.stride(0), frame.width(), frame.height())
}

/// 按行拷贝，跳过每行末尾的对齐填充；数据不足时返回 `None`
fn rows_to_image(data: &[u8], stride: usize, width: u32, height: u32) -> Option<RgbImage> {
    let row_bytes = width as usize * 3;
    if stride < row_bytes {
        return None;
    }

    let mut buf = Vec::with_capacity(row_bytes * height as usize);
    for y in 0..height as usize {
        let start = y * stride;
        buf.extend_from_slice(data.get(start..start + row_bytes)?);
    }
    RgbImage::from_raw(width, height, buf)
}
