use thiserror::Error;
use uuid::Uuid;

use crate::core::job::JobStatus;

/// 错误提示信息的最大长度（字符数），超出部分截断
const MAX_ERROR_LEN: usize = 200;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("无效的URL: {0}")]
    InvalidUrl(String),

    #[error("URL 因安全原因被拒绝")]
    BlockedUrl(String),

    #[error("不支持的平台: {0}")]
    UnsupportedPlatform(String),

    #[error("无效的质量参数: {0}")]
    InvalidQuality(String),

    #[error("Cookie 超过大小限制: {0} 字节")]
    CookiesTooLarge(usize),

    #[error("请求过于频繁，请稍后再试")]
    RateLimited,

    #[error("路径越界访问被拒绝")]
    PathTraversal,

    #[error("任务不存在: {0}")]
    NotFound(String),

    #[error("文件不存在")]
    FileMissing,

    #[error("无效的筛选条件: {0}")]
    InvalidFilter(String),

    #[error("任务不可重试: 当前状态为 {0}")]
    NotRetryable(JobStatus),

    #[error("任务状态冲突: 当前为 {current}，无法{op}")]
    StatusConflict {
        current: JobStatus,
        op: &'static str,
    },

    #[error("下载失败: {0}")]
    AdapterFailed(String),

    #[error("下载超时")]
    Timeout,

    #[error("下载超时（无进度）")]
    StuckJob,

    #[error("下载被取消")]
    Cancelled,

    #[error("磁盘空间不足，暂时无法接收新任务")]
    InsufficientSpace,

    #[error("清理任务正在进行中")]
    CleanupBusy,

    #[error("配置错误: {0}")]
    Config(String),

    #[error("内部错误: {0}")]
    Internal(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("内部通信错误: {0}")]
    Mailbox(#[from] actix::MailboxError),
}

impl DownloadError {
    /// 构造下载引擎错误，消息截断到安全长度
    pub fn adapter(msg: impl Into<String>) -> Self {
        let msg: String = msg.into();
        let truncated: String = msg.chars().take(MAX_ERROR_LEN).collect();
        DownloadError::AdapterFailed(truncated)
    }

    pub fn not_found(job_id: Uuid) -> Self {
        DownloadError::NotFound(job_id.to_string())
    }

    /// 是否属于请求校验类错误（创建任务之前同步返回，不产生任何任务记录）
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DownloadError::InvalidUrl(_)
                | DownloadError::BlockedUrl(_)
                | DownloadError::UnsupportedPlatform(_)
                | DownloadError::InvalidQuality(_)
                | DownloadError::CookiesTooLarge(_)
        )
    }

    /// 对外暴露的消息。内部错误统一脱敏，原因只进服务端日志
    pub fn sanitized(&self) -> String {
        match self {
            DownloadError::Io(_) | DownloadError::Mailbox(_) | DownloadError::Internal(_) => {
                "内部错误".to_string()
            }
            other => other.to_string(),
        }
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;
