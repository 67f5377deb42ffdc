use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 媒体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Audio,
}

impl MediaType {
    /// 输出文件名前缀，同时也是输出模板的一部分
    pub fn prefix(&self) -> &'static str {
        match self {
            MediaType::Video => "video",
            MediaType::Audio => "audio",
        }
    }

    /// 默认容器格式
    pub fn default_format(&self) -> &'static str {
        match self {
            MediaType::Video => "mp4",
            MediaType::Audio => "webm",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// 来源平台，根据URL推断
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Youtube,
    Instagram,
    Tiktok,
    Twitter,
    Facebook,
    Other,
}

impl Platform {
    /// 从URL推断平台，无法识别时归为 Other
    pub fn detect(url: &str) -> Platform {
        let url = url.to_lowercase();
        if url.contains("youtube.com") || url.contains("youtu.be") {
            return Platform::Youtube;
        }
        if url.contains("instagram.com") {
            return Platform::Instagram;
        }
        if url.contains("tiktok.com") {
            return Platform::Tiktok;
        }
        if url.contains("twitter.com") || url.contains("x.com") {
            return Platform::Twitter;
        }
        if url.contains("facebook.com") || url.contains("fb.watch") {
            return Platform::Facebook;
        }
        Platform::Other
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Youtube => "youtube",
            Platform::Instagram => "instagram",
            Platform::Tiktok => "tiktok",
            Platform::Twitter => "twitter",
            Platform::Facebook => "facebook",
            Platform::Other => "other",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "youtube" => Ok(Platform::Youtube),
            "instagram" => Ok(Platform::Instagram),
            "tiktok" => Ok(Platform::Tiktok),
            "twitter" => Ok(Platform::Twitter),
            "facebook" => Ok(Platform::Facebook),
            "other" => Ok(Platform::Other),
            _ => Err(()),
        }
    }
}

/// 任务状态
///
/// 状态机：queued -> running -> done | error | cancelled。
/// running 只能进入一次，终态之后记录冻结。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Error,
    Cancelled,
}

impl JobStatus {
    /// 是否为终态，终态记录不再接受任何变更
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error | JobStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "error" => Ok(JobStatus::Error),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(()),
        }
    }
}

/// 下载任务记录
///
/// 存储层唯一持有该结构，编排器是 status/progress/file_name/error
/// 的唯一写入方，其余组件只读。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub url: String,
    pub platform: Platform,
    #[serde(rename = "type")]
    pub media_type: MediaType,
    pub format: String,
    pub quality: String,
    pub status: JobStatus,
    pub progress: f32,
    pub file_name: String,
    pub error: String,
    pub client_ip: String,
    pub retry_count: u32,
    pub retry_of: Option<Uuid>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// 创建一个新的排队任务
    pub fn new(
        media_type: MediaType,
        url: String,
        platform: Platform,
        quality: String,
        client_ip: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            url,
            platform,
            media_type,
            format: media_type.default_format().to_string(),
            quality,
            status: JobStatus::Queued,
            progress: 0.0,
            file_name: String::new(),
            error: String::new(),
            client_ip,
            retry_count: 0,
            retry_of: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 基于失败任务创建重试任务，参数继承原任务
    pub fn retry_from(original: &Job) -> Self {
        let mut job = Job::new(
            original.media_type,
            original.url.clone(),
            original.platform,
            original.quality.clone(),
            original.client_ip.clone(),
        );
        job.retry_of = Some(original.job_id);
        job.retry_count = original.retry_count + 1;
        job
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_detection() {
        assert_eq!(
            Platform::detect("https://www.youtube.com/watch?v=abc"),
            Platform::Youtube
        );
        assert_eq!(Platform::detect("https://youtu.be/abc"), Platform::Youtube);
        assert_eq!(
            Platform::detect("https://www.instagram.com/reel/xyz/"),
            Platform::Instagram
        );
        assert_eq!(
            Platform::detect("https://vm.tiktok.com/xyz"),
            Platform::Tiktok
        );
        assert_eq!(Platform::detect("https://x.com/a/status/1"), Platform::Twitter);
        assert_eq!(Platform::detect("https://fb.watch/abc"), Platform::Facebook);
        assert_eq!(Platform::detect("https://vimeo.com/123"), Platform::Other);
    }

    #[test]
    fn test_status_terminal() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_status_roundtrip() {
        for s in ["queued", "running", "done", "error", "cancelled"] {
            let parsed: JobStatus = s.parse().expect("状态解析失败");
            assert_eq!(parsed.to_string(), s);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_new_job_defaults() {
        let job = Job::new(
            MediaType::Video,
            "https://youtube.com/watch?v=abc".into(),
            Platform::Youtube,
            "720".into(),
            "127.0.0.1".into(),
        );
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress, 0.0);
        assert_eq!(job.format, "mp4");
        assert!(job.file_name.is_empty());
        assert!(job.retry_of.is_none());
    }

    #[test]
    fn test_retry_from_links_original() {
        let original = Job::new(
            MediaType::Audio,
            "https://youtube.com/watch?v=abc".into(),
            Platform::Youtube,
            "192".into(),
            "127.0.0.1".into(),
        );
        let retry = Job::retry_from(&original);
        assert_ne!(retry.job_id, original.job_id);
        assert_eq!(retry.retry_of, Some(original.job_id));
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.status, JobStatus::Queued);
        assert_eq!(retry.quality, "192");
    }

    #[test]
    fn test_job_serializes_unix_timestamps() {
        let job = Job::new(
            MediaType::Video,
            "https://youtube.com/watch?v=abc".into(),
            Platform::Youtube,
            "720".into(),
            String::new(),
        );
        let value = serde_json::to_value(&job).expect("序列化失败");
        assert!(value["created_at"].is_i64());
        assert_eq!(value["type"], "video");
        assert_eq!(value["status"], "queued");
        assert_eq!(value["platform"], "youtube");
    }
}
