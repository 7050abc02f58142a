use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vision_shield::{
    is_allowed_video, AnalysisResult, CancelToken, ConfigLoader, ConfigOverrides, ExtendedConfig, ModelHandle,
    VideoAnalyzer,
};

/// 深度伪造视频检测工具
#[derive(Parser, Debug)]
#[command(name = "vision-shield")]
#[command(about = "深度伪造视频检测：序列分类、逐帧可疑度曲线、热力图", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// 覆盖配置文件和环境变量的命令行参数
#[derive(Args, Debug, Clone, Default)]
struct OverrideArgs {
    /// 配置文件路径（可选，支持 .ini 格式）
    /// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    #[arg(long)]
    config: Option<PathBuf>,

    /// 输出目录（热力图与结果 JSON）
    /// 可通过环境变量 VISION_SHIELD_OUTPUT 或配置文件设置
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// 采样间隔：每隔多少帧保留一帧
    #[arg(long)]
    frame_skip: Option<usize>,

    /// 序列长度
    #[arg(long)]
    seq_length: Option<usize>,

    /// 渲染热力图的帧数，0 表示不渲染
    #[arg(long)]
    heatmap_top_k: Option<usize>,

    /// 单个视频的分析超时（秒）
    #[arg(long)]
    max_pipeline_secs: Option<u64>,

    /// 空间骨干网络 ONNX 文件
    #[arg(long)]
    backbone: Option<PathBuf>,

    /// 时序权重 JSON 文件
    #[arg(long)]
    classifier: Option<PathBuf>,

    /// 临时帧目录的父目录
    #[arg(long)]
    temp_dir: Option<PathBuf>,
}

impl OverrideArgs {
    fn load(&self) -> Result<ExtendedConfig> {
        let cli = ConfigOverrides {
            frame_skip: self.frame_skip,
            seq_length: self.seq_length,
            heatmap_top_k: self.heatmap_top_k,
            max_pipeline_secs: self.max_pipeline_secs,
            backbone_path: self.backbone.clone(),
            classifier_path: self.classifier.clone(),
            output_dir: self.output.clone(),
            temp_dir: self.temp_dir.clone(),
            ..Default::default()
        };
        ConfigLoader::load(self.config.as_deref(), cli).context("加载配置失败")
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 分析单个视频文件
    Analyze {
        /// 输入视频文件路径
        #[arg(short, long)]
        input: PathBuf,

        #[command(flatten)]
        overrides: OverrideArgs,
    },
    /// 并发分析多个视频文件，共享同一份模型
    Batch {
        /// 输入视频文件路径
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// 同时分析的视频数
        #[arg(short, long, default_value_t = 2)]
        jobs: usize,

        #[command(flatten)]
        overrides: OverrideArgs,
    },
    /// 生成默认配置文件
    InitConfig {
        /// 配置文件路径
        #[arg(default_value = "vision-shield.ini")]
        path: PathBuf,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze { input, overrides } => {
            let config = overrides.load()?;
            init_tracing(&config.log_level);
            analyze(input, config).await
        }
        Commands::Batch {
            inputs,
            jobs,
            overrides,
        } => {
            let config = overrides.load()?;
            init_tracing(&config.log_level);
            batch(inputs, jobs, config).await
        }
        Commands::InitConfig { path } => {
            init_tracing("info");
            if path.exists() {
                anyhow::bail!("配置文件已存在: {}", path.display());
            }
            ConfigLoader::create_default_config(&path)?;
            info!("✅ 已生成默认配置文件: {}", path.display());
            Ok(())
        }
    }
}

async fn load_models(config: &ExtendedConfig) -> Result<Arc<ModelHandle>> {
    let model_config = config.model.clone();
    let models = tokio::task::spawn_blocking(move || ModelHandle::load(&model_config))
        .await
        .context("模型加载任务异常退出")??;
    Ok(Arc::new(models))
}

async fn analyze(input: PathBuf, config: ExtendedConfig) -> Result<()> {
    if !is_allowed_video(&input) {
        anyhow::bail!("不支持的视频格式: {}", input.display());
    }
    info!(
        "使用配置: frame_skip={}, seq_length={}, heatmap_top_k={}",
        config.analysis.frame_skip, config.analysis.seq_length, config.analysis.heatmap_top_k
    );

    let models = load_models(&config).await?;
    let output_dir = config.output_dir.clone();
    let result = run_one(models, Arc::new(config), input, output_dir.clone()).await?;
    let results_path = write_results(&result, &output_dir)?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    info!("📁 [视频分析] 结果文件: {}", results_path.display());
    Ok(())
}

async fn batch(inputs: Vec<PathBuf>, jobs: usize, config: ExtendedConfig) -> Result<()> {
    let (accepted, rejected): (Vec<_>, Vec<_>) = inputs.into_iter().partition(|p| is_allowed_video(p));
    for path in &rejected {
        warn!("⚠️  [批量分析] 跳过不支持的格式: {}", path.display());
    }
    if accepted.is_empty() {
        anyhow::bail!("没有可分析的视频文件");
    }

    let start = Instant::now();
    let models = load_models(&config).await?;
    let config = Arc::new(config);
    let permits = Arc::new(Semaphore::new(jobs.max(1)));
    info!("⏳ [批量分析] 共 {} 个视频，并发数 {}", accepted.len(), jobs.max(1));

    let mut handles = Vec::with_capacity(accepted.len());
    for (index, input) in accepted.into_iter().enumerate() {
        let models = Arc::clone(&models);
        let config = Arc::clone(&config);
        let permits = Arc::clone(&permits);
        let output_dir = batch_output_dir(&config.output_dir, index, &input);
        handles.push(tokio::spawn(async move {
            let _permit = permits.acquire_owned().await?;
            let result = run_one(models, config, input.clone(), output_dir.clone()).await;
            let saved = result.and_then(|r| write_results(&r, &output_dir).map(|p| (r, p)));
            anyhow::Ok((input, saved))
        }));
    }

    let mut failed = 0usize;
    for handle in handles {
        let (input, saved) = handle.await.context("分析任务异常退出")??;
        match saved {
            Ok((result, path)) => println!(
                "{}\t{}\t{:.4}\t{}",
                input.display(),
                result.classification.prediction,
                result.classification.confidence,
                path.display()
            ),
            Err(e) => {
                failed += 1;
                error!("❌ [批量分析] {} 分析失败: {:#}", input.display(), e);
            }
        }
    }

    info!(
        "🎉 [批量分析] 完成，失败 {} 个，总耗时: {:.2}秒",
        failed,
        start.elapsed().as_secs_f64()
    );
    if failed > 0 {
        anyhow::bail!("{} 个视频分析失败", failed);
    }
    Ok(())
}

async fn run_one(
    models: Arc<ModelHandle>,
    config: Arc<ExtendedConfig>,
    input: PathBuf,
    output_dir: PathBuf,
) -> Result<AnalysisResult> {
    tokio::task::spawn_blocking(move || {
        let cancel = CancelToken::from_config(&config.analysis);
        VideoAnalyzer::new(&models, &config.analysis)
            .with_temp_parent(config.temp_dir.as_deref())
            .analyze_video(&input, &output_dir, &cancel)
            .map_err(|e| anyhow::anyhow!("{}: {}", e.kind(), e))
    })
    .await
    .context("分析任务异常退出")?
}

/// 每个视频单独一个子目录；带序号前缀，同名文件来自不同目录时也不会互相覆盖热力图
fn batch_output_dir(root: &Path, index: usize, input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    root.join(format!("{:03}_{}", index, stem))
}

fn write_results(result: &AnalysisResult, output_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir).context("创建输出目录失败")?;
    let path = output_dir.join(format!("{}_results.json", result.video_id));
    let json = serde_json::to_string_pretty(result).context("序列化分析结果失败")?;
    std::fs::write(&path, json).with_context(|| format!("写入结果文件失败: {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_stem_from_different_dirs_gets_distinct_outputs() {
        let root = Path::new("/out");
        let a = batch_output_dir(root, 0, Path::new("a/clip.mp4"));
        let b = batch_output_dir(root, 1, Path::new("b/clip.mp4"));
        assert_ne!(a, b);
        assert_eq!(a, Path::new("/out/000_clip"));
        assert_eq!(b, Path::new("/out/001_clip"));
    }
}
