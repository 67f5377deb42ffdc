use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::core::error::DownloadError;

/// 配置结构体
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// 监听地址
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// 下载目录
    pub download_dir: String,
    /// 单个文件的最大下载大小（GB）
    pub max_download_size_gb: f64,
    /// 默认视频清晰度
    pub default_video_quality: String,
    /// 默认音频码率
    pub default_audio_quality: String,
    /// 任务记录保留时间（秒），到期后对外不可见并被清理
    pub job_ttl_secs: u64,
    /// 单个下载任务的硬超时（分钟）
    pub job_timeout_mins: u64,
    /// 单条任务链的最大重试次数
    pub max_retries: u32,
    /// 清理周期（秒）
    pub cleanup_interval_secs: u64,
    /// 下载文件保留天数
    pub cleanup_age_days: u64,
    /// 低于该剩余空间（GB）时触发空间回收
    pub cleanup_min_free_gb: f64,
    /// 低于该剩余空间（GB）时暂停接收新任务
    pub min_free_space_gb: f64,
    /// 视频接口每分钟请求上限（按IP）
    pub video_requests_per_minute: u32,
    /// 音频接口每分钟请求上限（按IP）
    pub audio_requests_per_minute: u32,
    /// 其余接口每分钟请求上限（按IP）
    pub default_requests_per_minute: u32,
    /// 进度流轮询间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 进度无变化判定为卡死的超时（秒）
    pub stuck_timeout_secs: u64,
    /// 单条进度流的最长存活时间（秒）
    pub stream_max_secs: u64,
    /// 历史查询单次返回上限
    pub history_limit: usize,
    /// 下载引擎可执行文件
    pub ytdlp_bin: String,
    /// 默认 Cookie 文件路径，空表示不使用
    pub cookie_file: String,
    /// 日志目录
    pub log_dir: String,
    /// 日志级别
    pub log_level: String,
    /// 单个日志文件最大大小（MB）
    pub log_max_size_mb: u64,
    /// 日志轮转保留份数
    pub log_backup_count: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8001,
            download_dir: "./downloads".to_string(),
            max_download_size_gb: 50.0,
            default_video_quality: "720".to_string(),
            default_audio_quality: "192".to_string(),
            job_ttl_secs: 86400, // 24小时
            job_timeout_mins: 120,
            max_retries: 3,
            cleanup_interval_secs: 3600, // 每小时
            cleanup_age_days: 7,
            cleanup_min_free_gb: 5.0,
            min_free_space_gb: 1.0,
            video_requests_per_minute: 5,
            audio_requests_per_minute: 10,
            default_requests_per_minute: 15,
            poll_interval_ms: 300,
            stuck_timeout_secs: 30,
            stream_max_secs: 600, // 10分钟
            history_limit: 500,
            ytdlp_bin: "yt-dlp".to_string(),
            cookie_file: String::new(),
            log_dir: "logs".to_string(),
            log_level: "info".to_string(),
            log_max_size_mb: 10,
            log_backup_count: 5,
        }
    }
}

impl Config {
    /// 加载配置文件，不存在或格式错误时回退到默认配置并写回
    pub fn load(path: &str) -> Result<Self, DownloadError> {
        if Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            match toml::from_str(&content) {
                Ok(config) => Ok(config),
                Err(e) => {
                    eprintln!("配置文件格式错误: {}，将使用默认配置", e);
                    let config = Config::default();
                    config.save_with_tutorial(path)?;
                    Ok(config)
                }
            }
        } else {
            let config = Config::default();
            config.save_with_tutorial(path)?;
            Ok(config)
        }
    }

    /// 保存带教程的配置文件（唯一写入方法）
    pub fn save_with_tutorial(&self, path: &str) -> Result<(), DownloadError> {
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent)?;
        }
        let tutorial_content = Config::generate_tutorial_content();
        let config_content = toml::to_string_pretty(self)
            .map_err(|e| DownloadError::Config(format!("无法序列化配置: {}", e)))?;
        let full_content = format!("{}\n\n{}", tutorial_content, config_content);
        fs::write(path, full_content)?;
        Ok(())
    }

    /// 生成配置文件教程内容（静态方法）
    fn generate_tutorial_content() -> String {
        r#"# MediaDown 配置文件
# ====================
#
# 这是一个 TOML 格式的配置文件，用于配置 MediaDown 媒体下载服务的行为。
# 修改后重启服务即可生效。
#
# 配置优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
#
# 支持的环境变量（覆盖同名配置项）：
#   API_HOST, API_PORT, DOWNLOAD_DIR, MAX_DOWNLOAD_SIZE_GB,
#   VIDEO_QUALITY, AUDIO_QUALITY, JOB_TTL_SECONDS, JOB_TIMEOUT_MINUTES,
#   MAX_RETRIES, CLEANUP_INTERVAL_SECONDS, CLEANUP_DAYS,
#   CLEANUP_MIN_DISK_SPACE_GB, MIN_DISK_SPACE_GB,
#   VIDEO_REQUESTS_PER_MINUTE, AUDIO_REQUESTS_PER_MINUTE,
#   DOWNLOAD_REQUESTS_PER_MINUTE, PROGRESS_POLL_INTERVAL_MS,
#   STUCK_TIMEOUT_SECONDS, STREAM_MAX_SECONDS, JOB_HISTORY_LIMIT,
#   YTDLP_BIN, COOKIE_FILE, LOG_DIR, LOG_LEVEL, LOG_MAX_SIZE_MB,
#   LOG_BACKUP_COUNT
#
# ==================== 下载设置 ====================
#
# download_dir           下载目录，服务只会读写该目录内的文件
# max_download_size_gb   单个文件的最大下载大小（GB）
# default_video_quality  视频默认清晰度：144 / 360 / 720 / 1080
# default_audio_quality  音频默认码率：192 / 256 / 320
#
# ==================== 任务设置 ====================
#
# job_ttl_secs       任务记录保留时间（秒），默认24小时
# job_timeout_mins   单个下载任务的硬超时（分钟）
# max_retries        失败任务允许的最大重试次数
#
# ==================== 清理设置 ====================
#
# cleanup_interval_secs  清理周期（秒），默认每小时
# cleanup_age_days       下载文件保留天数，默认7天
# cleanup_min_free_gb    剩余空间低于该值（GB）时回收旧文件
# min_free_space_gb      剩余空间低于该值（GB）时暂停接收新任务
#
# ==================== 限流设置 ====================
#
# video_requests_per_minute    视频接口每分钟每IP请求上限
# audio_requests_per_minute    音频接口每分钟每IP请求上限
# default_requests_per_minute  其余接口每分钟每IP请求上限
#
# ==================== 进度流设置 ====================
#
# poll_interval_ms    进度流轮询间隔（毫秒）
# stuck_timeout_secs  进度无变化判定为卡死的超时（秒）
# stream_max_secs     单条进度流的最长存活时间（秒）
#
# ==================== 配置项 ===================="#
            .to_string()
    }

    /// 从环境变量合并配置
    pub fn merge_from_env(&mut self) {
        fn env_override<T: FromStr>(key: &str, slot: &mut T) {
            if let Ok(raw) = std::env::var(key) {
                match raw.trim().parse::<T>() {
                    Ok(v) => *slot = v,
                    Err(_) => eprintln!("环境变量 {} 的值无效: {}", key, raw),
                }
            }
        }

        env_override("API_HOST", &mut self.host);
        env_override("API_PORT", &mut self.port);
        env_override("DOWNLOAD_DIR", &mut self.download_dir);
        env_override("MAX_DOWNLOAD_SIZE_GB", &mut self.max_download_size_gb);
        env_override("VIDEO_QUALITY", &mut self.default_video_quality);
        env_override("AUDIO_QUALITY", &mut self.default_audio_quality);
        env_override("JOB_TTL_SECONDS", &mut self.job_ttl_secs);
        env_override("JOB_TIMEOUT_MINUTES", &mut self.job_timeout_mins);
        env_override("MAX_RETRIES", &mut self.max_retries);
        env_override("CLEANUP_INTERVAL_SECONDS", &mut self.cleanup_interval_secs);
        env_override("CLEANUP_DAYS", &mut self.cleanup_age_days);
        env_override("CLEANUP_MIN_DISK_SPACE_GB", &mut self.cleanup_min_free_gb);
        env_override("MIN_DISK_SPACE_GB", &mut self.min_free_space_gb);
        env_override("VIDEO_REQUESTS_PER_MINUTE", &mut self.video_requests_per_minute);
        env_override("AUDIO_REQUESTS_PER_MINUTE", &mut self.audio_requests_per_minute);
        env_override("DOWNLOAD_REQUESTS_PER_MINUTE", &mut self.default_requests_per_minute);
        env_override("PROGRESS_POLL_INTERVAL_MS", &mut self.poll_interval_ms);
        env_override("STUCK_TIMEOUT_SECONDS", &mut self.stuck_timeout_secs);
        env_override("STREAM_MAX_SECONDS", &mut self.stream_max_secs);
        env_override("JOB_HISTORY_LIMIT", &mut self.history_limit);
        env_override("YTDLP_BIN", &mut self.ytdlp_bin);
        env_override("COOKIE_FILE", &mut self.cookie_file);
        env_override("LOG_DIR", &mut self.log_dir);
        env_override("LOG_LEVEL", &mut self.log_level);
        env_override("LOG_MAX_SIZE_MB", &mut self.log_max_size_mb);
        env_override("LOG_BACKUP_COUNT", &mut self.log_backup_count);
    }

    /// 合并命令行参数到配置
    pub fn merge_from_args(&mut self, args: &crate::cli::Args) {
        // 命令行参数覆盖配置文件和环境变量
        if let Some(host) = &args.host {
            self.host = host.clone();
        }
        if let Some(port) = args.port {
            self.port = port;
        }
        if let Some(download_dir) = &args.download_dir {
            self.download_dir = download_dir.clone();
        }
        if let Some(log_level) = &args.log_level {
            self.log_level = log_level.clone();
        }
    }

    /// 校验配置合法性
    pub fn validate(&self) -> Result<(), DownloadError> {
        if self.port == 0 {
            return Err(DownloadError::Config("端口必须大于0".to_string()));
        }
        if self.download_dir.is_empty() {
            return Err(DownloadError::Config("下载目录不能为空".to_string()));
        }
        if self.job_ttl_secs == 0 {
            return Err(DownloadError::Config("任务保留时间必须大于0".to_string()));
        }
        if self.job_timeout_mins == 0 {
            return Err(DownloadError::Config("任务超时必须大于0".to_string()));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(DownloadError::Config("清理周期必须大于0".to_string()));
        }
        if self.cleanup_age_days == 0 {
            return Err(DownloadError::Config("文件保留天数必须大于0".to_string()));
        }
        if self.video_requests_per_minute == 0
            || self.audio_requests_per_minute == 0
            || self.default_requests_per_minute == 0
        {
            return Err(DownloadError::Config("限流阈值必须大于0".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(DownloadError::Config("轮询间隔必须大于0".to_string()));
        }
        if self.stuck_timeout_secs == 0 {
            return Err(DownloadError::Config("卡死超时必须大于0".to_string()));
        }
        if self.history_limit == 0 {
            return Err(DownloadError::Config("历史查询上限必须大于0".to_string()));
        }
        Ok(())
    }

    /// 获取配置摘要信息
    pub fn get_summary(&self) -> String {
        format!(
            "配置摘要:\n\
            - 监听地址: {}:{}\n\
            - 下载目录: {}\n\
            - 任务保留: {} 秒\n\
            - 文件保留: {} 天\n\
            - 清理周期: {} 秒\n\
            - 限流: 视频 {}/分钟, 音频 {}/分钟, 其它 {}/分钟\n\
            - 进度轮询: {} 毫秒, 卡死超时: {} 秒\n\
            - 下载引擎: {}",
            self.host,
            self.port,
            self.download_dir,
            self.job_ttl_secs,
            self.cleanup_age_days,
            self.cleanup_interval_secs,
            self.video_requests_per_minute,
            self.audio_requests_per_minute,
            self.default_requests_per_minute,
            self.poll_interval_ms,
            self.stuck_timeout_secs,
            self.ytdlp_bin,
        )
    }
}
