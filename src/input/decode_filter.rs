/// FFmpeg解码过滤器模块
/// FFmpeg decode filter: YUV420P → RGB, 通过有界通道交给采集线程
use std::time::Instant;

use crossbeam_channel::Sender;
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::{AVMediaType, Frame as AvFrame};
use image::RgbImage;
use tracing::{debug, info, warn};

/// 解码过滤器: 每个合法帧转换成 `RgbImage` 后发送; 接收端关闭时停止解码
pub struct RgbDecodeFilter {
    tx: Sender<RgbImage>,
    count: usize,
    last: Instant,
    total_frames: usize,
    dropped_frames: usize,
}

impl RgbDecodeFilter {
    pub fn new(tx: Sender<RgbImage>) -> Self {
        Self {
            tx,
            count: 0,
            last: Instant::now(),
            total_frames: 0,
            dropped_frames: 0,
        }
    }

    fn drop_frame(&mut self, reason: std::fmt::Arguments<'_>) -> Result<Option<AvFrame>, String> {
        self.dropped_frames += 1;
        if self.total_frames <= 10 {
            warn!("⚠️ 丢弃帧 #{}: {}", self.total_frames, reason);
        }
        Ok(None)
    }
}

impl FrameFilter for RgbDecodeFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        info!("✅ 解码线程启动");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: AvFrame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<AvFrame>, String> {
        self.total_frames += 1;

        if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
            return self.drop_frame(format_args!("空帧/损坏帧"));
        }

        // SAFETY: 指针非空, 在本次回调期间由 FFmpeg 持有
        let (w, h, planes, y_stride, uv_stride, error_flags) = unsafe {
            let raw = &*frame.as_ptr();
            (
                raw.width as u32,
                raw.height as u32,
                [raw.data[0], raw.data[1], raw.data[2]],
                raw.linesize[0] as usize,
                raw.linesize[1] as usize,
                raw.decode_error_flags,
            )
        };

        if w == 0 || h == 0 || w > 8192 || h > 8192 {
            return self.drop_frame(format_args!("非法分辨率 {}x{}", w, h));
        }
        // 只丢弃严重错误的帧 (缺少参考帧、无效比特流)
        if error_flags & 0x03 != 0 {
            return self.drop_frame(format_args!("解码错误标志=0x{:02x}", error_flags));
        }
        if planes.iter().any(|p| p.is_null()) {
            return self.drop_frame(format_args!("YUV指针为空"));
        }
        if y_stride < w as usize || uv_stride < (w as usize).div_ceil(2) {
            return self.drop_frame(format_args!(
                "步长异常 y_stride={} uv_stride={}",
                y_stride, uv_stride
            ));
        }

        let mut image = RgbImage::new(w, h);
        // SAFETY: 步长和尺寸已校验, 平面大小由 FFmpeg 保证
        unsafe {
            yuv420p_to_rgb(
                planes[0],
                planes[1],
                planes[2],
                y_stride,
                uv_stride,
                &mut image,
            );
        }
        self.count += 1;

        if self.last.elapsed().as_secs_f64() >= 1.0 {
            let elapsed = self.last.elapsed().as_secs_f64();
            let drop_rate = self.dropped_frames as f64 / self.total_frames as f64 * 100.0;
            debug!(
                "📺 解码统计: 解码{}帧 | 实际{:.1}fps | 总帧{} | 丢弃{} ({:.1}%)",
                self.count,
                self.count as f64 / elapsed,
                self.total_frames,
                self.dropped_frames,
                drop_rate
            );
            self.last = Instant::now();
            self.count = 0;
        }

        // 接收端已关闭 (stop) → 返回错误结束 FFmpeg 调度
        self.tx
            .send(image)
            .map_err(|_| "video source stopped".to_string())?;
        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        info!("✅ 解码线程退出");
    }
}

/// BT.601 定点转换 (系数乘以128)
unsafe fn yuv420p_to_rgb(
    y_plane: *const u8,
    u_plane: *const u8,
    v_plane: *const u8,
    y_stride: usize,
    uv_stride: usize,
    image: &mut RgbImage,
) {
    let width = image.width() as usize;
    let buffer: &mut [u8] = image;
    for (row, line) in buffer.chunks_exact_mut(width * 3).enumerate() {
        let y_row = row * y_stride;
        let uv_row = (row >> 1) * uv_stride;
        for (x, px) in line.chunks_exact_mut(3).enumerate() {
            let y_val = *y_plane.add(y_row + x) as i32;
            let u_val = *u_plane.add(uv_row + (x >> 1)) as i32 - 128;
            let v_val = *v_plane.add(uv_row + (x >> 1)) as i32 - 128;
            px[0] = (y_val + ((v_val * 179) >> 7)).clamp(0, 255) as u8;
            px[1] = (y_val - ((u_val * 44) >> 7) - ((v_val * 91) >> 7)).clamp(0, 255) as u8;
            px[2] = (y_val + ((u_val * 227) >> 7)).clamp(0, 255) as u8;
        }
    }
}
