//! 显示阶段: 分析帧队列 → 调试渲染 / 帧回调

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use tracing::{debug, info, warn};

use super::stats::{PipelineStats, StageMeter};
use super::FrameSink;
use crate::detection::{id_to_color, Frame};
use crate::queue::BoundedQueue;

const LABEL_SCALE: f32 = 16.0;

/// 调试渲染器: 画出检测框和标签, 可选写入 PNG
pub struct DebugRenderer {
    font: Option<FontVec>,
    output_dir: Option<PathBuf>,
}

impl DebugRenderer {
    pub fn new(output_dir: Option<PathBuf>, font_path: Option<&Path>) -> anyhow::Result<Self> {
        let font = match font_path {
            Some(path) => {
                let bytes = fs::read(path)?;
                let font = FontVec::try_from_vec(bytes)
                    .map_err(|e| anyhow::anyhow!("invalid font {}: {}", path.display(), e))?;
                info!("🔤 字体已加载: {}", path.display());
                Some(font)
            }
            None => None,
        };
        if let Some(dir) = &output_dir {
            fs::create_dir_all(dir)?;
        }
        Ok(Self { font, output_dir })
    }

    /// 在副本上绘制, 不修改帧
    pub fn draw(&self, frame: &Frame) -> RgbImage {
        let mut canvas = frame.image().clone();
        for obj in &frame.objects {
            let Some((x, y, w, h)) = obj.bbox.clamp_to(canvas.width(), canvas.height()) else {
                continue;
            };
            let (r, g, b) = if obj.tracking_id == 0 {
                (0, 255, 0)
            } else {
                id_to_color(obj.tracking_id)
            };
            let color = Rgb([r, g, b]);
            draw_hollow_rect_mut(&mut canvas, Rect::at(x as i32, y as i32).of_size(w, h), color);
            if let Some(font) = &self.font {
                let label = format!("{} {:.2}", obj.id(), obj.bbox.confidence);
                let ty = (y as i32 - LABEL_SCALE as i32).max(0);
                draw_text_mut(&mut canvas, color, x as i32, ty, PxScale::from(LABEL_SCALE), font, &label);
            }
        }
        canvas
    }

    pub fn render(&mut self, frame: &Frame) -> anyhow::Result<()> {
        match &self.output_dir {
            Some(dir) => {
                let path = dir.join(format!("{}_{:08}.png", frame.device_id, frame.frame_id));
                self.draw(frame).save(&path)?;
            }
            None => debug!(
                frame = frame.frame_id,
                offset_ms = frame.offset_ms,
                objects = ?frame.object_ids(),
                "🖥️  显示帧"
            ),
        }
        Ok(())
    }
}

pub(crate) struct Display<'a> {
    pub analyzed: &'a BoundedQueue<Arc<Frame>>,
    pub analyze_done: &'a AtomicBool,
    pub renderer: Option<DebugRenderer>,
    pub sink: Option<&'a mut FrameSink>,
    pub stats: &'a PipelineStats,
}

impl Display<'_> {
    /// 分析结束且队列为空时退出
    pub fn run(mut self) {
        info!("🖥️  显示线程启动");
        let mut meter = StageMeter::new("显示");
        loop {
            let finished = self.analyze_done.load(Ordering::Acquire);
            let next = if finished {
                self.analyzed.try_dequeue()
            } else {
                self.analyzed.dequeue()
            };
            let Some(frame) = next else {
                if finished {
                    break;
                }
                continue;
            };

            if let Some(renderer) = self.renderer.as_mut() {
                if let Err(e) = renderer.render(&frame) {
                    warn!(frame = frame.frame_id, "⚠️ 渲染失败: {}", e);
                }
            }
            if let Some(sink) = self.sink.as_deref_mut() {
                sink(Arc::clone(&frame));
            }
            PipelineStats::bump(&self.stats.displayed);
            meter.tick();
        }
        info!("🖥️  显示线程退出 (共 {} 帧)", meter.total());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BBox, DetectedObject};

    fn frame() -> Frame {
        let obj = DetectedObject::new("car", BBox::new(2.0, 2.0, 8.0, 6.0, 0.9, 2)).with_tracking_id(3);
        Frame::new("cam", 5, 200, RgbImage::new(12, 10)).with_objects(vec![obj])
    }

    #[test]
    fn test_draw_leaves_frame_untouched() {
        let renderer = DebugRenderer::new(None, None).unwrap();
        let frame = frame();
        let canvas = renderer.draw(&frame);
        let (r, g, b) = id_to_color(3);
        assert_eq!(canvas.get_pixel(2, 2).0, [r, g, b]);
        assert_eq!(frame.image().get_pixel(2, 2).0, [0, 0, 0]);
    }

    #[test]
    fn test_render_writes_png() {
        let dir = tempfile::tempdir().unwrap();
        let mut renderer = DebugRenderer::new(Some(dir.path().join("debug")), None).unwrap();
        renderer.render(&frame()).unwrap();
        assert!(dir.path().join("debug").join("cam_00000005.png").exists());
    }

    #[test]
    fn test_missing_font_fails() {
        assert!(DebugRenderer::new(None, Some(Path::new("/no/such/font.ttf"))).is_err());
    }

    #[test]
    fn test_display_drains_after_analyze_done() {
        let analyzed = BoundedQueue::new(4);
        for id in 1..=3 {
            analyzed.enqueue(Arc::new(Frame::new("cam", id, 0, RgbImage::new(2, 2))));
        }
        let done = AtomicBool::new(true);
        let stats = PipelineStats::default();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let mut sink: FrameSink = Box::new(move |f: Arc<Frame>| sink_seen.lock().unwrap().push(f.frame_id));
        Display {
            analyzed: &analyzed,
            analyze_done: &done,
            renderer: None,
            sink: Some(&mut sink),
            stats: &stats,
        }
        .run();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(stats.displayed.load(Ordering::Relaxed), 3);
    }
}
