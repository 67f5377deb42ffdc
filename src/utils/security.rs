use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use url::Url;

use crate::config::Config;
use crate::core::error::DownloadError;
use crate::core::job::{MediaType, Platform};

/// URL 最大长度
const MAX_URL_LEN: usize = 2000;
/// Cookie 负载最大字节数
const MAX_COOKIE_BYTES: usize = 100_000;

/// 视频清晰度白名单
pub const VIDEO_QUALITIES: [&str; 4] = ["144", "360", "720", "1080"];
/// 音频码率白名单
pub const AUDIO_QUALITIES: [&str; 3] = ["192", "256", "320"];

/// SSRF 黑名单，对小写化后的完整URL做子串匹配
const BLOCKED_PATTERNS: [&str; 8] = [
    "localhost",
    "127.0",
    "192.168",
    "10.0",
    "172.16",
    "0.0.0",
    "file://",
    "ftp://",
];

/// 支持的站点域名白名单，vimeo/dailymotion 归为 other 平台
const ALLOWED_DOMAINS: [&str; 10] = [
    "youtube.com",
    "youtu.be",
    "instagram.com",
    "tiktok.com",
    "twitter.com",
    "x.com",
    "facebook.com",
    "fb.watch",
    "vimeo.com",
    "dailymotion.com",
];

/// 校验下载URL并推断平台
///
/// 任何校验失败都在任务创建之前同步返回，不留副作用。
pub fn validate_url(url: &str) -> Result<Platform, DownloadError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(DownloadError::InvalidUrl("URL 为空".to_string()));
    }
    if url.len() > MAX_URL_LEN {
        return Err(DownloadError::InvalidUrl("URL 超过最大长度".to_string()));
    }

    let parsed = Url::parse(url).map_err(|_| DownloadError::InvalidUrl("URL 格式错误".to_string()))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(DownloadError::InvalidUrl("仅支持 HTTP/HTTPS".to_string()));
    }

    let lowered = url.to_lowercase();
    for pattern in BLOCKED_PATTERNS {
        if lowered.contains(pattern) {
            log::warn!("拦截可疑URL（命中 {}）", pattern);
            return Err(DownloadError::BlockedUrl(truncate(url, 80)));
        }
    }

    if !ALLOWED_DOMAINS.iter().any(|d| lowered.contains(d)) {
        let host = parsed.host_str().unwrap_or("").to_string();
        log::warn!("不支持的站点: {}", host);
        return Err(DownloadError::UnsupportedPlatform(host));
    }

    Ok(Platform::detect(url))
}

/// 校验清晰度/码率参数
pub fn validate_quality(media_type: MediaType, quality: &str) -> Result<(), DownloadError> {
    let allowed: &[&str] = match media_type {
        MediaType::Video => &VIDEO_QUALITIES,
        MediaType::Audio => &AUDIO_QUALITIES,
    };
    if allowed.contains(&quality) {
        Ok(())
    } else {
        Err(DownloadError::InvalidQuality(truncate(quality, 32)))
    }
}

/// 校验 Cookie 负载大小
pub fn validate_cookies(cookies: &str) -> Result<(), DownloadError> {
    if cookies.len() > MAX_COOKIE_BYTES {
        return Err(DownloadError::CookiesTooLarge(cookies.len()));
    }
    Ok(())
}

/// 把用户可控的文件名解析为下载目录内的绝对路径
///
/// 先做词法拒绝（空、绝对路径、分隔符、".."），再经 canonicalize
/// 确认仍在下载目录之下，符号链接逃逸也在此被拦截。任何越界在
/// 触碰文件系统读写之前返回 PathTraversal。
pub fn resolve_download_path(root: &Path, file_name: &str) -> Result<PathBuf, DownloadError> {
    if file_name.is_empty()
        || file_name.contains('/')
        || file_name.contains('\\')
        || file_name.contains("..")
    {
        log::warn!("拦截路径越界请求: {}", truncate(file_name, 80));
        return Err(DownloadError::PathTraversal);
    }

    let canonical_root = root.canonicalize()?;
    let candidate = canonical_root.join(file_name);
    let resolved = match candidate.canonicalize() {
        Ok(p) => p,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(DownloadError::FileMissing)
        }
        Err(e) => return Err(e.into()),
    };

    if !resolved.starts_with(&canonical_root) {
        log::warn!("拦截符号链接逃逸: {}", truncate(file_name, 80));
        return Err(DownloadError::PathTraversal);
    }
    Ok(resolved)
}

/// 安全删除下载目录内的文件，文件不存在视为成功
pub fn remove_download_file(root: &Path, file_name: &str) -> bool {
    match resolve_download_path(root, file_name) {
        Ok(path) => match std::fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("删除文件失败 {}: {}", file_name, e);
                false
            }
        },
        Err(DownloadError::FileMissing) => true, // 已经不存在
        Err(e) => {
            log::warn!("拒绝删除 {}: {}", truncate(file_name, 80), e);
            false
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// ================== 滑动窗口限流 ==================

/// 接口类别，各自独立限流
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Video,
    Audio,
    Default,
}

struct LimiterInner {
    clients: HashMap<(String, EndpointClass), VecDeque<Instant>>,
    last_compaction: Instant,
}

/// 按IP+接口类别的滑动窗口限流器
///
/// 周期性压缩会删掉窗口外已无请求的IP，保证内存有界。
pub struct RateLimiter {
    window: Duration,
    compaction_interval: Duration,
    video_limit: usize,
    audio_limit: usize,
    default_limit: usize,
    inner: Mutex<LimiterInner>,
}

impl RateLimiter {
    pub fn new(
        video_limit: usize,
        audio_limit: usize,
        default_limit: usize,
        window: Duration,
        compaction_interval: Duration,
    ) -> Self {
        Self {
            window,
            compaction_interval,
            video_limit,
            audio_limit,
            default_limit,
            inner: Mutex::new(LimiterInner {
                clients: HashMap::new(),
                last_compaction: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.video_requests_per_minute as usize,
            config.audio_requests_per_minute as usize,
            config.default_requests_per_minute as usize,
            Duration::from_secs(60),
            Duration::from_secs(300),
        )
    }

    fn limit_for(&self, class: EndpointClass) -> usize {
        match class {
            EndpointClass::Video => self.video_limit,
            EndpointClass::Audio => self.audio_limit,
            EndpointClass::Default => self.default_limit,
        }
    }

    /// 记录一次请求，超出窗口配额返回 RateLimited
    pub fn check(&self, client_ip: &str, class: EndpointClass) -> Result<(), DownloadError> {
        let now = Instant::now();
        let limit = self.limit_for(class);
        let mut inner = self.inner.lock().unwrap();

        // 周期性压缩：淘汰两个窗口内无新请求的IP
        if now.duration_since(inner.last_compaction) >= self.compaction_interval {
            let horizon = self.window * 2;
            inner
                .clients
                .retain(|_, times| times.back().map_or(false, |t| now.duration_since(*t) < horizon));
            inner.last_compaction = now;
        }

        let times = inner
            .clients
            .entry((client_ip.to_string(), class))
            .or_default();
        while let Some(front) = times.front() {
            if now.duration_since(*front) >= self.window {
                times.pop_front();
            } else {
                break;
            }
        }

        if times.len() >= limit {
            log::warn!("[{}] 触发限流 ({:?})", client_ip, class);
            return Err(DownloadError::RateLimited);
        }
        times.push_back(now);
        Ok(())
    }

    /// 当前跟踪的 (IP, 接口) 数量，用于健康信息和内存上界验证
    pub fn tracked_clients(&self) -> usize {
        self.inner.lock().unwrap().clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_url_validation_accepts_known_platforms() {
        assert_eq!(
            validate_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ").unwrap(),
            Platform::Youtube
        );
        assert_eq!(
            validate_url("https://vm.tiktok.com/ZMabc/").unwrap(),
            Platform::Tiktok
        );
        // vimeo 在白名单内但归为 other 平台
        assert_eq!(validate_url("https://vimeo.com/123456").unwrap(), Platform::Other);
    }

    #[test]
    fn test_url_validation_rejects_bad_input() {
        assert!(matches!(validate_url(""), Err(DownloadError::InvalidUrl(_))));
        assert!(matches!(
            validate_url("not a url"),
            Err(DownloadError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_url("ftp://youtube.com/file"),
            Err(DownloadError::InvalidUrl(_))
        ));
        let long = format!("https://youtube.com/watch?v={}", "a".repeat(3000));
        assert!(matches!(validate_url(&long), Err(DownloadError::InvalidUrl(_))));
        assert!(matches!(
            validate_url("https://example.com/video"),
            Err(DownloadError::UnsupportedPlatform(_))
        ));
    }

    #[test]
    fn test_url_validation_blocks_local_targets() {
        for url in [
            "https://localhost/youtube.com",
            "https://127.0.0.1:8000/youtube.com",
            "https://192.168.1.5/youtube.com",
        ] {
            assert!(matches!(validate_url(url), Err(DownloadError::BlockedUrl(_))));
        }
    }

    #[test]
    fn test_quality_whitelists() {
        for q in VIDEO_QUALITIES {
            assert!(validate_quality(MediaType::Video, q).is_ok());
        }
        for q in AUDIO_QUALITIES {
            assert!(validate_quality(MediaType::Audio, q).is_ok());
        }
        assert!(validate_quality(MediaType::Video, "480").is_err());
        assert!(validate_quality(MediaType::Video, "192").is_err());
        assert!(validate_quality(MediaType::Audio, "720").is_err());
        assert!(validate_quality(MediaType::Audio, "128; rm -rf /").is_err());
    }

    #[test]
    fn test_cookie_guard() {
        assert!(validate_cookies(&"a".repeat(100_000)).is_ok());
        assert!(matches!(
            validate_cookies(&"a".repeat(100_001)),
            Err(DownloadError::CookiesTooLarge(_))
        ));
    }

    fn temp_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("mediadown_sec_{}_{}", name, uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("创建测试目录失败");
        dir
    }

    #[test]
    fn test_path_resolution_within_root() {
        let root = temp_root("ok");
        fs::write(root.join("clip.mp4"), b"data").unwrap();
        let resolved = resolve_download_path(&root, "clip.mp4").expect("解析失败");
        assert!(resolved.ends_with("clip.mp4"));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_path_resolution_rejects_traversal() {
        let root = temp_root("traversal");
        for name in ["../etc/passwd", "/etc/passwd", "a/b.mp4", "..", "a\\..\\b"] {
            assert!(matches!(
                resolve_download_path(&root, name),
                Err(DownloadError::PathTraversal)
            ));
        }
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_path_resolution_missing_file() {
        let root = temp_root("missing");
        assert!(matches!(
            resolve_download_path(&root, "nope.mp4"),
            Err(DownloadError::FileMissing)
        ));
        let _ = fs::remove_dir_all(&root);
    }

    #[cfg(unix)]
    #[test]
    fn test_path_resolution_rejects_symlink_escape() {
        let root = temp_root("symlink");
        let outside = temp_root("outside");
        fs::write(outside.join("secret.txt"), b"secret").unwrap();
        std::os::unix::fs::symlink(outside.join("secret.txt"), root.join("link.mp4")).unwrap();

        assert!(matches!(
            resolve_download_path(&root, "link.mp4"),
            Err(DownloadError::PathTraversal)
        ));
        let _ = fs::remove_dir_all(&root);
        let _ = fs::remove_dir_all(&outside);
    }

    #[test]
    fn test_remove_download_file_tolerates_missing() {
        let root = temp_root("remove");
        assert!(remove_download_file(&root, "gone.mp4"));
        assert!(!remove_download_file(&root, "../gone.mp4"));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_rate_limiter_rejects_over_limit() {
        let limiter = RateLimiter::new(2, 10, 10, Duration::from_secs(60), Duration::from_secs(300));
        assert!(limiter.check("1.2.3.4", EndpointClass::Video).is_ok());
        assert!(limiter.check("1.2.3.4", EndpointClass::Video).is_ok());
        assert!(matches!(
            limiter.check("1.2.3.4", EndpointClass::Video),
            Err(DownloadError::RateLimited)
        ));
        // 其它IP和其它接口类别不受影响
        assert!(limiter.check("5.6.7.8", EndpointClass::Video).is_ok());
        assert!(limiter.check("1.2.3.4", EndpointClass::Audio).is_ok());
    }

    #[test]
    fn test_rate_limiter_window_slides() {
        let limiter = RateLimiter::new(1, 1, 1, Duration::from_millis(50), Duration::from_secs(300));
        assert!(limiter.check("1.2.3.4", EndpointClass::Video).is_ok());
        assert!(limiter.check("1.2.3.4", EndpointClass::Video).is_err());
        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.check("1.2.3.4", EndpointClass::Video).is_ok());
    }

    #[test]
    fn test_rate_limiter_evicts_idle_clients() {
        let limiter = RateLimiter::new(5, 5, 5, Duration::from_millis(20), Duration::from_millis(0));
        for i in 0..50 {
            let ip = format!("10.1.1.{}", i);
            limiter.check(&ip, EndpointClass::Video).unwrap();
        }
        assert_eq!(limiter.tracked_clients(), 50);

        // 两个窗口之后所有IP都空闲，下一次请求触发压缩
        std::thread::sleep(Duration::from_millis(50));
        limiter.check("10.2.2.2", EndpointClass::Video).unwrap();
        assert_eq!(limiter.tracked_clients(), 1);
    }
}
