use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

/// 允许分析的视频容器扩展名
pub const ALLOWED_EXTENSIONS: [&str; 5] = ["mp4", "avi", "mov", "webm", "mkv"];

/// 默认配置文件名
const CONFIG_FILE_NAME: &str = "vision-shield.ini";

/// 分析配置
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisConfig {
    /// 采样间隔：每隔多少原始帧保留一帧
    pub frame_skip: usize,
    /// 送入序列分类器的定长帧数
    pub seq_length: usize,
    /// 渲染热力图的帧数
    pub heatmap_top_k: usize,
    /// 整条流水线的超时（秒），未设置表示不限制
    pub max_pipeline_secs: Option<u64>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            frame_skip: 30,
            seq_length: 20,
            heatmap_top_k: 5,
            max_pipeline_secs: None,
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<()> {
        if self.frame_skip == 0 {
            anyhow::bail!("frame_skip 必须大于 0");
        }
        if self.seq_length == 0 {
            anyhow::bail!("seq_length 必须大于 0");
        }
        Ok(())
    }
}

/// 模型配置
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    /// 空间骨干网络（ONNX）
    pub backbone_path: PathBuf,
    /// 时序权重（JSON）
    pub classifier_path: PathBuf,
    /// 骨干网络输入边长
    pub input_size: u32,
    /// 骨干网络输出维度
    pub feature_dim: usize,
    /// ONNX Runtime 线程数，未设置时由运行时决定
    pub intra_threads: Option<usize>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backbone_path: PathBuf::from("models/weights/resnet50_backbone.onnx"),
            classifier_path: PathBuf::from("models/weights/visionshield_classifier.json"),
            input_size: crate::feature_extractor::DEFAULT_INPUT_SIZE,
            feature_dim: crate::feature_extractor::RESNET50_FEATURE_DIM,
            intra_threads: None,
        }
    }
}

/// 完整配置（分析参数、模型路径、输出目录、日志级别）
#[derive(Debug, Clone, PartialEq)]
pub struct ExtendedConfig {
    pub analysis: AnalysisConfig,
    pub model: ModelConfig,
    /// 热力图与结果 JSON 的输出目录
    pub output_dir: PathBuf,
    /// 临时帧目录的父目录，未设置时使用系统临时目录
    pub temp_dir: Option<PathBuf>,
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
}

impl Default for ExtendedConfig {
    fn default() -> Self {
        Self {
            analysis: AnalysisConfig::default(),
            model: ModelConfig::default(),
            output_dir: PathBuf::from("./output"),
            temp_dir: None,
            log_level: "info".to_string(),
        }
    }
}

/// 单个配置来源中出现的值（配置文件、环境变量、命令行都用它表示）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub frame_skip: Option<usize>,
    pub seq_length: Option<usize>,
    pub heatmap_top_k: Option<usize>,
    pub max_pipeline_secs: Option<u64>,
    pub backbone_path: Option<PathBuf>,
    pub classifier_path: Option<PathBuf>,
    pub input_size: Option<u32>,
    pub feature_dim: Option<usize>,
    pub intra_threads: Option<usize>,
    pub output_dir: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl ConfigOverrides {
    /// 以 `self` 为高优先级，缺失的项从 `lower` 补齐
    fn or(self, lower: ConfigOverrides) -> ConfigOverrides {
        ConfigOverrides {
            frame_skip: self.frame_skip.or(lower.frame_skip),
            seq_length: self.seq_length.or(lower.seq_length),
            heatmap_top_k: self.heatmap_top_k.or(lower.heatmap_top_k),
            max_pipeline_secs: self.max_pipeline_secs.or(lower.max_pipeline_secs),
            backbone_path: self.backbone_path.or(lower.backbone_path),
            classifier_path: self.classifier_path.or(lower.classifier_path),
            input_size: self.input_size.or(lower.input_size),
            feature_dim: self.feature_dim.or(lower.feature_dim),
            intra_threads: self.intra_threads.or(lower.intra_threads),
            output_dir: self.output_dir.or(lower.output_dir),
            temp_dir: self.temp_dir.or(lower.temp_dir),
            log_level: self.log_level.or(lower.log_level),
        }
    }

    fn resolve(self) -> ExtendedConfig {
        let defaults = ExtendedConfig::default();
        ExtendedConfig {
            analysis: AnalysisConfig {
                frame_skip: self.frame_skip.unwrap_or(defaults.analysis.frame_skip),
                seq_length: self.seq_length.unwrap_or(defaults.analysis.seq_length),
                heatmap_top_k: self.heatmap_top_k.unwrap_or(defaults.analysis.heatmap_top_k),
                max_pipeline_secs: self.max_pipeline_secs.or(defaults.analysis.max_pipeline_secs),
            },
            model: ModelConfig {
                backbone_path: self.backbone_path.unwrap_or(defaults.model.backbone_path),
                classifier_path: self.classifier_path.unwrap_or(defaults.model.classifier_path),
                input_size: self.input_size.unwrap_or(defaults.model.input_size),
                feature_dim: self.feature_dim.unwrap_or(defaults.model.feature_dim),
                intra_threads: self.intra_threads.or(defaults.model.intra_threads),
            },
            output_dir: self.output_dir.unwrap_or(defaults.output_dir),
            temp_dir: self.temp_dir.or(defaults.temp_dir),
            log_level: self.log_level.unwrap_or(defaults.log_level),
        }
    }
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    ///
    /// 显式指定的配置文件读取失败会返回错误；默认位置找不到配置文件则忽略。
    pub fn load(config_file: Option<&Path>, cli: ConfigOverrides) -> Result<ExtendedConfig> {
        // 1. 配置文件
        let file_config = match config_file {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load_from_default_locations().unwrap_or_default(),
        };

        // 2. 环境变量
        let env_config = Self::load_from_env();

        // 3. 合并
        let config = cli.or(env_config).or(file_config).resolve();
        config.analysis.validate()?;
        Ok(config)
    }

    /// 从环境变量加载配置
    pub fn load_from_env() -> ConfigOverrides {
        fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
            env::var(key).ok().and_then(|v| v.trim().parse().ok())
        }
        fn path(key: &str) -> Option<PathBuf> {
            env::var(key).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
        }

        ConfigOverrides {
            frame_skip: parsed("VISION_SHIELD_FRAME_SKIP"),
            seq_length: parsed("VISION_SHIELD_SEQ_LENGTH"),
            heatmap_top_k: parsed("VISION_SHIELD_HEATMAP_TOP_K"),
            max_pipeline_secs: parsed("VISION_SHIELD_MAX_PIPELINE_SECS"),
            backbone_path: path("VISION_SHIELD_BACKBONE"),
            classifier_path: path("VISION_SHIELD_CLASSIFIER"),
            input_size: parsed("VISION_SHIELD_INPUT_SIZE"),
            feature_dim: parsed("VISION_SHIELD_FEATURE_DIM"),
            intra_threads: parsed("VISION_SHIELD_INTRA_THREADS"),
            output_dir: path("VISION_SHIELD_OUTPUT"),
            temp_dir: path("VISION_SHIELD_TEMP_DIR"),
            log_level: env::var("LOG_LEVEL").ok().filter(|v| !v.is_empty()),
        }
    }

    /// 从 INI 配置文件加载配置
    pub fn load_from_file(config_path: &Path) -> Result<ConfigOverrides> {
        if !config_path.exists() {
            return Err(anyhow::anyhow!("配置文件不存在: {}", config_path.display()));
        }

        let mut ini = configparser::ini::Ini::new();
        ini.load(config_path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;

        // 先查对应节，没有则使用 [DEFAULT] 节
        let get = |section: &str, key: &str| {
            ini.get(section, key)
                .or_else(|| ini.get("DEFAULT", key))
                .filter(|v| !v.trim().is_empty())
        };
        let parse = |section: &str, key: &str| -> Result<Option<u64>> {
            get(section, key)
                .map(|v| {
                    v.trim()
                        .parse::<u64>()
                        .with_context(|| format!("配置项 [{}] {} 不是合法整数: {}", section, key, v))
                })
                .transpose()
        };

        Ok(ConfigOverrides {
            frame_skip: parse("analysis", "frame_skip")?.map(|v| v as usize),
            seq_length: parse("analysis", "seq_length")?.map(|v| v as usize),
            heatmap_top_k: parse("analysis", "heatmap_top_k")?.map(|v| v as usize),
            max_pipeline_secs: parse("analysis", "max_pipeline_secs")?,
            backbone_path: get("model", "backbone_path").map(PathBuf::from),
            classifier_path: get("model", "classifier_path").map(PathBuf::from),
            input_size: parse("model", "input_size")?.map(|v| v as u32),
            feature_dim: parse("model", "feature_dim")?.map(|v| v as usize),
            intra_threads: parse("model", "intra_threads")?.map(|v| v as usize),
            output_dir: get("output", "output_dir").map(PathBuf::from),
            temp_dir: get("output", "temp_dir").map(PathBuf::from),
            log_level: get("logging", "level"),
        })
    }

    /// 从默认位置加载配置文件
    fn load_from_default_locations() -> Result<ConfigOverrides> {
        let mut candidates = vec![
            PathBuf::from(CONFIG_FILE_NAME),
            PathBuf::from(format!(".{}", CONFIG_FILE_NAME)),
        ];
        if let Some(home) = env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(format!(".{}", CONFIG_FILE_NAME)));
        }
        candidates.push(PathBuf::from("/etc").join(CONFIG_FILE_NAME));

        for candidate in candidates {
            if candidate.exists() {
                return Self::load_from_file(&candidate);
            }
        }
        Err(anyhow::anyhow!("未找到配置文件"))
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let defaults = ExtendedConfig::default();
        let mut ini = configparser::ini::Ini::new();
        ini.set("analysis", "frame_skip", Some(defaults.analysis.frame_skip.to_string()));
        ini.set("analysis", "seq_length", Some(defaults.analysis.seq_length.to_string()));
        ini.set("analysis", "heatmap_top_k", Some(defaults.analysis.heatmap_top_k.to_string()));
        ini.set("analysis", "max_pipeline_secs", Some(String::new()));
        ini.set("model", "backbone_path", Some(defaults.model.backbone_path.display().to_string()));
        ini.set("model", "classifier_path", Some(defaults.model.classifier_path.display().to_string()));
        ini.set("model", "input_size", Some(defaults.model.input_size.to_string()));
        ini.set("model", "feature_dim", Some(defaults.model.feature_dim.to_string()));
        ini.set("model", "intra_threads", Some(String::new()));
        ini.set("output", "output_dir", Some(defaults.output_dir.display().to_string()));
        ini.set("output", "temp_dir", Some(String::new()));
        ini.set("logging", "level", Some(defaults.log_level));

        ini.write(config_path)
            .map_err(|e| anyhow::anyhow!("写入配置文件失败: {}: {}", config_path.display(), e))?;
        Ok(())
    }
}

/// 扩展名是否在允许的视频格式内（不区分大小写）
pub fn is_allowed_video(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| ALLOWED_EXTENSIONS.iter().any(|a| a.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}
