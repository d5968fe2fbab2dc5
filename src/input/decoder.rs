/// FFmpeg 视频源
/// Software-decoded video source (file, RTSP, device) backed by ez-ffmpeg.
///
/// 解码在独立线程中运行, 帧通过有界通道交给采集线程; 通道满时解码线程阻塞,
/// 由此把采集阶段的背压传递给 FFmpeg.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Input};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::decode_filter::RgbDecodeFilter;
use super::{recv_until_stopped, SourceSpecs, VideoSource, STOP_POLL_INTERVAL};

/// 停止时等待解码线程退出的最长时间; 流卡住时调度器可能不再返回
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FfmpegConfig {
    /// 容器不提供帧率时使用
    pub fps: f64,
    /// 解码线程与采集线程之间的缓冲帧数
    pub buffer_frames: usize,
    /// 等待首帧的最长时间 (毫秒), 超时视为打开失败
    pub open_timeout_ms: u64,
    /// RTSP 使用 TCP 传输
    pub rtsp_tcp: bool,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            fps: 25.0,
            buffer_frames: 8,
            open_timeout_ms: 10_000,
            rtsp_tcp: true,
        }
    }
}

pub struct FfmpegSource {
    config: FfmpegConfig,
    rx: Option<Receiver<RgbImage>>,
    /// 打开时为探测尺寸已取出的首帧
    pending: Option<RgbImage>,
    worker: Option<JoinHandle<()>>,
    stop_signal: Arc<AtomicBool>,
}

impl FfmpegSource {
    pub fn new(config: FfmpegConfig) -> Self {
        Self {
            config,
            rx: None,
            pending: None,
            worker: None,
            stop_signal: Arc::new(AtomicBool::new(false)),
        }
    }

    fn build_input(&self, uri: &str) -> Input {
        let input = Input::new(uri);
        if self.config.rtsp_tcp && uri.starts_with("rtsp://") {
            input.set_input_opts(
                [
                    ("rtsp_transport", "tcp"),
                    ("buffer_size", "67108864"),
                    ("rtsp_flags", "prefer_tcp"),
                ]
                .into(),
            )
        } else {
            input
        }
    }
}

impl Default for FfmpegSource {
    fn default() -> Self {
        Self::new(FfmpegConfig::default())
    }
}

impl VideoSource for FfmpegSource {
    fn open(&mut self, uri: &str) -> anyhow::Result<SourceSpecs> {
        self.stop();

        let (tx, rx) = crossbeam_channel::bounded(self.config.buffer_frames.max(1));
        let filter = RgbDecodeFilter::new(tx);
        let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
        let pipe = pipe.filter("decode", Box::new(filter));
        let out = create_null_output().add_frame_pipeline(pipe);

        let ctx = FfmpegContext::builder()
            .input(self.build_input(uri))
            .filter_desc("format=yuv420p")
            .output(out)
            .build()
            .map_err(|e| anyhow::anyhow!("构建失败: {}", e))?;
        let sch = ctx.start().map_err(|e| anyhow::anyhow!("启动失败: {}", e))?;

        let url = uri.to_string();
        let worker = std::thread::Builder::new()
            .name("ffmpeg-decode".into())
            .spawn(move || match sch.wait() {
                Ok(_) => info!("✅ 解码线程正常退出: {}", url),
                Err(e) => warn!("❌ 解码结束: {} ({})", url, e),
            })?;
        self.worker = Some(worker);

        // 首帧决定分辨率
        let deadline = Instant::now() + Duration::from_millis(self.config.open_timeout_ms);
        let first = loop {
            if self.stop_signal.load(Ordering::Acquire) {
                anyhow::bail!("stopped while waiting for the first frame of {}", uri);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                anyhow::bail!("no frame decoded from {} within timeout", uri);
            }
            match rx.recv_timeout(remaining.min(STOP_POLL_INTERVAL)) {
                Ok(image) => break image,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    anyhow::bail!("decoder for {} exited before the first frame", uri)
                }
            }
        };
        let specs = SourceSpecs {
            width: first.width(),
            height: first.height(),
            frame_rate: self.config.fps,
            frame_count: None,
        };
        info!(
            "🎬 FFmpeg解码器启动: {} ({}x{})",
            uri, specs.width, specs.height
        );
        self.pending = Some(first);
        self.rx = Some(rx);
        Ok(specs)
    }

    fn decode_next(&mut self) -> anyhow::Result<Option<RgbImage>> {
        if let Some(image) = self.pending.take() {
            return Ok(Some(image));
        }
        // 解码线程退出后发送端关闭即流结束; 直播流卡住时由停止信号打断
        Ok(self
            .rx
            .as_ref()
            .and_then(|rx| recv_until_stopped(rx, &self.stop_signal, STOP_POLL_INTERVAL)))
    }

    fn stop(&mut self) {
        self.pending = None;
        // 关闭接收端, 解码过滤器下一次发送失败后结束调度
        self.rx = None;
        let Some(worker) = self.worker.take() else {
            return;
        };
        let deadline = Instant::now() + WORKER_JOIN_TIMEOUT;
        while !worker.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        if !worker.is_finished() {
            warn!("⚠️ 解码线程未响应停止, 不再等待");
            return;
        }
        if worker.join().is_err() {
            error!("❌ 解码线程 panic");
        }
    }

    fn watch_stop(&mut self, signal: Arc<AtomicBool>) {
        self.stop_signal = signal;
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.stop();
    }
}
