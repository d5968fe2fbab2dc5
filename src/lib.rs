#![allow(clippy::type_complexity)]
// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod config; // 流水线配置参数
pub mod detection; // 检测 / 区域 / 跟踪
pub mod error; // 流水线错误类型
pub mod handlers; // 分析处理器
pub mod input; // 视频输入系统
pub mod pipeline; // 采集 → 分析 → 显示
pub mod queue; // 有界丢旧队列
pub mod registry; // 组件注册表
pub mod snapshot; // 目标截图缓存
pub mod window; // 时间滑动窗口
pub mod xbus; // 进程内消息总线

use once_cell::sync::OnceCell;

pub use crate::config::{Args, PipelineConfig};
pub use crate::detection::{BBox, DetectedObject, Frame, FrameKey};
pub use crate::error::{PipelineError, PipelineResult};
pub use crate::input::{SourceSpecs, VideoSource};
pub use crate::pipeline::{
    Collaborators, FrameSink, Pipeline, PipelineState, RunSummary, StopHandle,
};
pub use crate::queue::BoundedQueue;
pub use crate::registry::CapabilityRegistry;
pub use crate::snapshot::{ArtifactStore, SnapshotCache};
pub use crate::window::{FrameExpired, ObjectExpired, SlideWindow};
pub use crate::xbus::{Subscription, XBus};

static TRACING: OnceCell<()> = OnceCell::new();

/// 安装全局 tracing 订阅者, 多次调用只生效一次
///
/// 日志级别由 `RUST_LOG` 控制, 缺省为 `info`
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_names(true)
            .finish();
        // 宿主程序可能已安装了自己的订阅者
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

pub fn gen_time_string(delimiter: &str) -> String {
    let t_now = chrono::Local::now();
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S{}%f",
        delimiter, delimiter, delimiter, delimiter, delimiter, delimiter
    );
    t_now.format(&fmt).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_string_layout() {
        let plain = gen_time_string("");
        assert!(plain.chars().all(|c| c.is_ascii_digit()));
        // %f 为纳秒, 固定9位
        assert_eq!(plain.len(), 14 + 9);
        assert_eq!(gen_time_string("-").matches('-').count(), 6);
    }

    #[test]
    fn test_init_tracing_twice() {
        init_tracing();
        init_tracing();
    }
}
