//! 流水线错误类型
//! Error taxonomy for the analytics pipeline.
//!
//! 致命错误 (打开视频源失败, 组件初始化失败, 配置错误) 会中止本次运行;
//! 单帧的解码/检测失败只记录日志, 不会出现在这里.

use thiserror::Error;

/// Result alias used across the library.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to open video source {uri:?}: {reason}")]
    SourceOpen { uri: String, reason: String },

    #[error("{component} initialization failed: {reason}")]
    CollaboratorInit { component: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no {kind} registered under key {key:?}")]
    UnknownCapability { kind: &'static str, key: String },

    #[error("invalid pipeline transition {from:?} -> {to:?}")]
    InvalidState {
        from: crate::pipeline::PipelineState,
        to: crate::pipeline::PipelineState,
    },

    #[error("pipeline stage {0} panicked")]
    StagePanicked(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl PipelineError {
    /// 将外部组件初始化失败包装为致命错误
    pub fn init(component: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::CollaboratorInit {
            component: component.into(),
            reason: err.to_string(),
        }
    }

    /// 是否为中止运行的致命错误
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Io(_) | Self::Image(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_error_message() {
        let err = PipelineError::init("detector", "model file missing");
        assert_eq!(
            err.to_string(),
            "detector initialization failed: model file missing"
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn test_io_error_is_not_fatal() {
        let err: PipelineError = std::io::Error::other("disk full").into();
        assert!(!err.is_fatal());
    }
}
