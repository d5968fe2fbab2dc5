/// 数字卫兵 (Digital Sentinel)
///
/// 视频分析流水线
///
/// 系统架构:
/// 1. 采集线程: 视频解码与抽帧 (独立工作线程)
/// 2. 分析线程: 检测 / 区域 / 跟踪 / 截图 / 滑动窗口 (独立工作线程)
/// 3. 显示线程: 调试渲染 (可选)
use clap::Parser;
use sentinel_rs::{init_tracing, Args, CapabilityRegistry, Pipeline, PipelineConfig};
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    let mut config = PipelineConfig::load(&args.config)?;
    args.apply(&mut config);

    info!("🚀 数字卫兵系统启动");
    config.print_summary();

    let registry = CapabilityRegistry::with_builtins();
    info!("🧩 可用视频源: {:?}", registry.source_keys());
    let mut pipeline = Pipeline::from_registry(config, &registry)?;

    info!("✅ 系统就绪, 开始分析...");
    let summary = pipeline.run()?;
    info!("👋 数字卫兵退出 (分析 {} 帧)", summary.frames_analyzed);
    Ok(())
}
