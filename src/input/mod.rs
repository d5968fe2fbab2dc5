/// 视频输入系统 (Video Input System)
///
/// 采集线程通过 [`VideoSource`] 拉取解码后的 RGB 图像
/// - SyntheticSource: 生成纯色测试帧
/// - ImageDirSource:  按文件名顺序读取目录中的图片
/// - FfmpegSource:    FFmpeg 软件解码 (需要 `ffmpeg` feature)
pub mod image_dir;
pub mod synthetic;

#[cfg(feature = "ffmpeg")]
pub mod decode_filter;
#[cfg(feature = "ffmpeg")]
pub mod decoder;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use image::RgbImage;
use serde::{Deserialize, Serialize};

pub use image_dir::{ImageDirConfig, ImageDirSource};
pub use synthetic::{SyntheticConfig, SyntheticSource};

#[cfg(feature = "ffmpeg")]
pub use decode_filter::RgbDecodeFilter;
#[cfg(feature = "ffmpeg")]
pub use decoder::{FfmpegConfig, FfmpegSource};

/// 视频源参数, `open` 成功后返回
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceSpecs {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    /// 直播流未知
    pub frame_count: Option<u64>,
}

impl SourceSpecs {
    /// 源帧序号 (从1开始) 对应的时间偏移
    pub fn offset_ms(&self, frame_index: u64) -> u64 {
        if self.frame_rate <= 0.0 {
            return 0;
        }
        (frame_index.saturating_sub(1) as f64 * 1000.0 / self.frame_rate).round() as u64
    }
}

/// 视频源 Trait
///
/// 采集线程独占调用 `open` / `decode_next`; `stop` 可能在任意时刻被调用.
pub trait VideoSource: Send {
    /// 打开视频源; 失败对本次运行是致命的
    fn open(&mut self, uri: &str) -> anyhow::Result<SourceSpecs>;

    /// 解码下一帧. `Ok(None)` 表示流结束, `Err` 为单帧失败.
    fn decode_next(&mut self) -> anyhow::Result<Option<RgbImage>>;

    /// 停止解码, 之后 `decode_next` 返回 `Ok(None)`
    fn stop(&mut self);

    /// 接收流水线的停止信号. `decode_next` 可能长时间阻塞的源 (直播流)
    /// 应在等待期间轮询该信号, 置位后返回 `Ok(None)`.
    fn watch_stop(&mut self, _signal: Arc<AtomicBool>) {}
}

/// 阻塞等待时检查停止信号的间隔
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 从通道接收, 每隔 `poll` 检查一次停止信号. 停止或发送端关闭时返回 `None`.
pub fn recv_until_stopped<T>(rx: &Receiver<T>, stop: &AtomicBool, poll: Duration) -> Option<T> {
    loop {
        if stop.load(Ordering::Acquire) {
            return None;
        }
        match rx.recv_timeout(poll) {
            Ok(item) => return Some(item),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_from_frame_index() {
        let specs = SourceSpecs {
            width: 640,
            height: 480,
            frame_rate: 25.0,
            frame_count: None,
        };
        assert_eq!(specs.offset_ms(1), 0);
        assert_eq!(specs.offset_ms(26), 1000);
        assert_eq!(SourceSpecs::default().offset_ms(10), 0);
    }

    #[test]
    fn test_recv_returns_when_stopped_on_idle_channel() {
        let (tx, rx) = crossbeam_channel::bounded::<u32>(1);
        let stop = Arc::new(AtomicBool::new(false));
        let signal = Arc::clone(&stop);
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            signal.store(true, Ordering::Release);
        });

        // 发送端仍然存活, 只有停止信号能让接收返回
        let started = std::time::Instant::now();
        assert_eq!(recv_until_stopped(&rx, &stop, Duration::from_millis(10)), None);
        assert!(started.elapsed() < Duration::from_secs(2));
        stopper.join().unwrap();
        drop(tx);
    }

    #[test]
    fn test_recv_delivers_until_disconnect() {
        let (tx, rx) = crossbeam_channel::bounded(2);
        let stop = AtomicBool::new(false);
        tx.send(7u32).unwrap();
        drop(tx);
        assert_eq!(recv_until_stopped(&rx, &stop, STOP_POLL_INTERVAL), Some(7));
        assert_eq!(recv_until_stopped(&rx, &stop, STOP_POLL_INTERVAL), None);
    }
}
