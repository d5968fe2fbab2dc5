//! 截图持久化 (Artifact Store)

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use image::RgbImage;
use tracing::debug;

use crate::gen_time_string;

/// 截图存储. 快照缓存在目标过期时调用, 失败只记录日志.
pub trait ArtifactStore: Send + Sync {
    fn save(&self, object_id: &str, image: &RgbImage) -> anyhow::Result<()>;
}

/// 以 PNG 文件保存到目录: `<dir>/<object_id>_<timestamp>.png`
#[derive(Clone, Debug)]
pub struct DirectoryStore {
    dir: PathBuf,
}

impl DirectoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(object_id: &str) -> String {
        let sanitized: String = object_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}_{}.png", sanitized, gen_time_string(""))
    }
}

impl ArtifactStore for DirectoryStore {
    fn save(&self, object_id: &str, image: &RgbImage) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(Self::file_name(object_id));
        image.save(&path)?;
        debug!("💾 截图已保存: {}", path.display());
        Ok(())
    }
}

/// 内存存储 (测试与嵌入使用)
#[derive(Default)]
pub struct MemoryStore {
    saved: Mutex<Vec<(String, RgbImage)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved_ids(&self) -> Vec<String> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn get(&self, object_id: &str) -> Option<RgbImage> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(id, _)| id == object_id)
            .map(|(_, image)| image.clone())
    }

    pub fn len(&self) -> usize {
        self.saved.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactStore for MemoryStore {
    fn save(&self, object_id: &str, image: &RgbImage) -> anyhow::Result<()> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((object_id.to_string(), image.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_store_writes_png() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path().join("snapshots"));
        store.save("car:12", &RgbImage::new(6, 4)).unwrap();

        let files: Vec<_> = fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("car_12_"));
        assert!(files[0].ends_with(".png"));

        let reloaded = image::open(store.dir().join(&files[0])).unwrap();
        assert_eq!((reloaded.width(), reloaded.height()), (6, 4));
    }

    #[test]
    fn test_memory_store_keeps_images() {
        let store = MemoryStore::new();
        assert!(store.is_empty());
        store.save("person:1", &RgbImage::new(3, 3)).unwrap();
        assert_eq!(store.saved_ids(), vec!["person:1"]);
        assert_eq!(store.get("person:1").unwrap().dimensions(), (3, 3));
        assert!(store.get("person:2").is_none());
    }
}
