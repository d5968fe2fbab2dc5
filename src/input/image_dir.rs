//! 图片目录视频源: 按文件名字典序逐张解码

use std::fs;
use std::path::{Path, PathBuf};

use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{SourceSpecs, VideoSource};

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "webp"];

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageDirConfig {
    /// 图片序列没有时间信息, 按该帧率计算偏移
    pub fps: f64,
}

impl Default for ImageDirConfig {
    fn default() -> Self {
        Self { fps: 25.0 }
    }
}

#[derive(Default)]
pub struct ImageDirSource {
    config: ImageDirConfig,
    files: Vec<PathBuf>,
    cursor: usize,
}

impl ImageDirSource {
    pub fn new(config: ImageDirConfig) -> Self {
        Self {
            config,
            files: Vec::new(),
            cursor: 0,
        }
    }

    fn list_images(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

impl VideoSource for ImageDirSource {
    fn open(&mut self, uri: &str) -> anyhow::Result<SourceSpecs> {
        let dir = Path::new(uri);
        self.files = Self::list_images(dir)?;
        self.cursor = 0;
        let first = self
            .files
            .first()
            .ok_or_else(|| anyhow::anyhow!("no image files in {}", dir.display()))?;
        let (width, height) = image::image_dimensions(first)?;
        info!("🖼️  图片目录: {} ({} 张, {}x{})", uri, self.files.len(), width, height);
        Ok(SourceSpecs {
            width,
            height,
            frame_rate: self.config.fps,
            frame_count: Some(self.files.len() as u64),
        })
    }

    fn decode_next(&mut self) -> anyhow::Result<Option<RgbImage>> {
        let Some(path) = self.files.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        let image = image::open(path)
            .map_err(|e| anyhow::anyhow!("decode {}: {}", path.display(), e))?;
        Ok(Some(image.to_rgb8()))
    }

    fn stop(&mut self) {
        self.cursor = self.files.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_images_in_lexical_order() {
        let dir = tempfile::tempdir().unwrap();
        for (name, shade) in [("b.png", 20u8), ("a.png", 10u8), ("c.png", 30u8)] {
            RgbImage::from_pixel(4, 3, image::Rgb([shade, 0, 0]))
                .save(dir.path().join(name))
                .unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "skip me").unwrap();

        let mut source = ImageDirSource::default();
        let specs = source.open(dir.path().to_str().unwrap()).unwrap();
        assert_eq!((specs.width, specs.height), (4, 3));
        assert_eq!(specs.frame_count, Some(3));

        let shades: Vec<u8> = std::iter::from_fn(|| source.decode_next().unwrap())
            .map(|img| img.get_pixel(0, 0)[0])
            .collect();
        assert_eq!(shades, vec![10, 20, 30]);
    }

    #[test]
    fn test_corrupt_file_is_a_per_frame_error() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::new(2, 2).save(dir.path().join("0.png")).unwrap();
        fs::write(dir.path().join("1.png"), b"not a png").unwrap();

        let mut source = ImageDirSource::default();
        source.open(dir.path().to_str().unwrap()).unwrap();
        assert!(source.decode_next().unwrap().is_some());
        assert!(source.decode_next().is_err());
        assert!(source.decode_next().unwrap().is_none());
    }

    #[test]
    fn test_empty_directory_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = ImageDirSource::default();
        assert!(source.open(dir.path().to_str().unwrap()).is_err());
    }
}
