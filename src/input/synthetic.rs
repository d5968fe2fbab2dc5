//! 合成视频源: 生成固定数量的纯色帧, 用于测试和演示

use std::time::Duration;

use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{SourceSpecs, VideoSource};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    /// `None` 表示无限流, 直到 `stop`
    pub frame_count: Option<u64>,
    pub fps: f64,
    /// 按帧率节流输出, 模拟实时流
    pub realtime: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            frame_count: Some(100),
            fps: 25.0,
            realtime: false,
        }
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    produced: u64,
    stopped: bool,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, frame_count: u64, fps: f64) -> Self {
        Self::from_config(SyntheticConfig {
            width,
            height,
            frame_count: Some(frame_count),
            fps,
            realtime: false,
        })
    }

    pub fn from_config(config: SyntheticConfig) -> Self {
        Self {
            config,
            produced: 0,
            stopped: false,
        }
    }

    pub fn produced(&self) -> u64 {
        self.produced
    }
}

impl VideoSource for SyntheticSource {
    fn open(&mut self, uri: &str) -> anyhow::Result<SourceSpecs> {
        anyhow::ensure!(
            self.config.width > 0 && self.config.height > 0,
            "synthetic source needs a non-empty frame size"
        );
        self.produced = 0;
        self.stopped = false;
        info!(
            "🧪 合成视频源: {} {}x{} @ {}fps",
            uri, self.config.width, self.config.height, self.config.fps
        );
        Ok(SourceSpecs {
            width: self.config.width,
            height: self.config.height,
            frame_rate: self.config.fps,
            frame_count: self.config.frame_count,
        })
    }

    fn decode_next(&mut self) -> anyhow::Result<Option<RgbImage>> {
        if self.stopped {
            return Ok(None);
        }
        if let Some(total) = self.config.frame_count {
            if self.produced >= total {
                return Ok(None);
            }
        }
        if self.config.realtime && self.config.fps > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(1.0 / self.config.fps));
        }
        self.produced += 1;
        let shade = (self.produced % 256) as u8;
        Ok(Some(RgbImage::from_pixel(
            self.config.width,
            self.config.height,
            Rgb([shade, shade / 2, 255 - shade]),
        )))
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}
