/// 分析处理器 (Analysis Handlers)
///
/// 每帧在区域分类、跟踪和快照之后依次调用, 结果写入帧的属性表.
/// 处理器可以独立订阅帧/目标过期事件释放内部状态.
pub mod dwell;
pub mod lane_count;

use crate::detection::Frame;
use crate::input::SourceSpecs;
use crate::xbus::{Subscription, XBus};

pub use dwell::DwellTimeHandler;
pub use lane_count::LaneCountHandler;

pub trait AnalysisHandler: Send {
    fn name(&self) -> &str;

    /// 视频源打开后调用; 失败属于致命错误
    fn init(&mut self, _specs: &SourceSpecs) -> anyhow::Result<()> {
        Ok(())
    }

    /// 单帧分析. 失败只记录日志, 不影响后续处理器.
    fn analyze(&mut self, frame: &mut Frame) -> anyhow::Result<()>;

    fn on_attach(&mut self, _bus: &XBus) -> Vec<Subscription> {
        Vec::new()
    }
}
