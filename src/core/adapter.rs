use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use uuid::Uuid;

use crate::config::Config;
use crate::core::error::DownloadError;
use crate::core::job::MediaType;

/// 进度回调，参数为百分比 0-100
pub type ProgressFn = Arc<dyn Fn(f32) + Send + Sync>;

/// 取消信号轮询间隔
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// 一次下载调用的输入
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub job_id: Uuid,
    pub media_type: MediaType,
    pub url: String,
    pub quality: String,
    pub cookie_file: Option<PathBuf>,
}

/// 下载引擎抽象
///
/// 引擎负责实际的抓取，通过回调上报进度，在检查点响应取消信号，
/// 成功时返回输出文件的确切路径（不允许事后扫描目录猜测）。
#[async_trait]
pub trait MediaAdapter: Send + Sync {
    async fn download(
        &self,
        request: &DownloadRequest,
        progress: ProgressFn,
        cancel: Arc<AtomicBool>,
    ) -> Result<PathBuf, DownloadError>;
}

/// Cookie 临时文件守卫
///
/// 作用域结束（包括任务报错的退出路径）自动删除文件。
pub struct CookieFile {
    path: PathBuf,
}

impl CookieFile {
    pub fn create(contents: &str) -> Result<Self, DownloadError> {
        let path = std::env::temp_dir().join(format!("cookies_{}.txt", Uuid::new_v4()));
        std::fs::write(&path, contents)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CookieFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("清理 Cookie 临时文件失败: {}", e);
            }
        }
    }
}

/// 从引擎输出行里提取进度百分比
fn parse_progress_line(re: &Regex, line: &str) -> Option<f32> {
    re.captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f32>().ok())
}

/// 基于 yt-dlp 子进程的下载引擎
pub struct YtDlpAdapter {
    config: Config,
    progress_re: Regex,
}

impl YtDlpAdapter {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            progress_re: Regex::new(r"(\d+\.\d)%").expect("进度正则无效"),
        }
    }

    /// 组装 yt-dlp 命令行参数
    ///
    /// 输出模板带任务ID前缀，同一个视频的两次下载互不覆盖，
    /// 每个文件只属于一个任务。
    fn build_args(&self, request: &DownloadRequest) -> Vec<String> {
        let output_template = Path::new(&self.config.download_dir).join(format!(
            "{}_{}_%(id)s.%(ext)s",
            request.media_type.prefix(),
            request.job_id.simple()
        ));

        let mut args: Vec<String> = Vec::new();
        match request.media_type {
            MediaType::Video => {
                // 视频+音频合并，按目标分辨率排序
                args.push("-f".into());
                args.push("bv*[ext=mp4]+ba[ext=m4a]/b[ext=mp4]/(bv*+ba/b)".into());
                args.push("-S".into());
                args.push(format!("res:{}", request.quality));
            }
            MediaType::Audio => {
                // 直接取最优音频，不做转码
                args.push("-f".into());
                args.push("bestaudio".into());
            }
        }
        args.push("--no-part".into());
        args.push("--force-overwrites".into());
        args.push("--no-warnings".into());
        args.push("--newline".into());
        args.push("--max-filesize".into());
        args.push(format!("{}G", self.config.max_download_size_gb));
        // 完成后打印最终文件路径，避免靠扫描目录找输出
        args.push("--print".into());
        args.push("after_move:filepath".into());
        args.push("--no-simulate".into());

        let cookie_path = request.cookie_file.clone().or_else(|| {
            if self.config.cookie_file.is_empty() {
                None
            } else {
                let p = PathBuf::from(&self.config.cookie_file);
                p.exists().then_some(p)
            }
        });
        if let Some(path) = cookie_path {
            args.push("--cookies".into());
            args.push(path.to_string_lossy().into_owned());
        }

        args.push(request.url.clone());
        args.push("-o".into());
        args.push(output_template.to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl MediaAdapter for YtDlpAdapter {
    async fn download(
        &self,
        request: &DownloadRequest,
        progress: ProgressFn,
        cancel: Arc<AtomicBool>,
    ) -> Result<PathBuf, DownloadError> {
        let args = self.build_args(request);
        log::debug!("任务 {}: {} {:?}", request.job_id, self.config.ytdlp_bin, args);

        let mut child = Command::new(&self.config.ytdlp_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                log::error!("任务 {}: 无法启动下载引擎: {}", request.job_id, e);
                DownloadError::adapter("无法启动下载引擎")
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DownloadError::adapter("无法读取下载引擎输出"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DownloadError::adapter("无法读取下载引擎输出"))?;
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        let mut reported_path: Option<PathBuf> = None;
        let mut cancel_poll = tokio::time::interval(CANCEL_POLL_INTERVAL);
        let mut stdout_done = false;
        let mut stderr_done = false;

        // 读两路输出：进度行可能出现在任一路，
        // 绝对路径行是 --print 上报的最终输出文件
        while !(stdout_done && stderr_done) {
            tokio::select! {
                line = stderr_lines.next_line(), if !stderr_done => match line {
                    Ok(Some(l)) => {
                        if let Some(p) = parse_progress_line(&self.progress_re, &l) {
                            progress(p);
                        }
                    }
                    _ => stderr_done = true,
                },
                line = stdout_lines.next_line(), if !stdout_done => match line {
                    Ok(Some(l)) => {
                        if let Some(p) = parse_progress_line(&self.progress_re, &l) {
                            progress(p);
                        } else {
                            let trimmed = l.trim();
                            if !trimmed.is_empty() && Path::new(trimmed).is_absolute() {
                                reported_path = Some(PathBuf::from(trimmed));
                            }
                        }
                    }
                    _ => stdout_done = true,
                },
                _ = cancel_poll.tick() => {
                    if cancel.load(Ordering::SeqCst) {
                        log::info!("任务 {}: 收到取消信号，终止下载引擎", request.job_id);
                        let _ = child.kill().await;
                        let _ = child.wait().await;
                        return Err(DownloadError::Cancelled);
                    }
                }
            }
        }

        let status = child.wait().await?;
        if cancel.load(Ordering::SeqCst) {
            return Err(DownloadError::Cancelled);
        }
        if !status.success() {
            log::error!(
                "任务 {}: 下载引擎异常退出，退出码 {:?}",
                request.job_id,
                status.code()
            );
            return Err(DownloadError::adapter(format!(
                "下载引擎退出码 {}",
                status.code().unwrap_or(-1)
            )));
        }

        let path = reported_path.ok_or_else(|| DownloadError::adapter("下载完成但未上报输出文件"))?;
        if !path.is_file() {
            return Err(DownloadError::adapter("下载完成但输出文件不存在"));
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn sample_request(media_type: MediaType, quality: &str) -> DownloadRequest {
        DownloadRequest {
            job_id: Uuid::new_v4(),
            media_type,
            url: "https://youtube.com/watch?v=abc".into(),
            quality: quality.into(),
            cookie_file: None,
        }
    }

    #[test]
    fn test_build_args_video_quality_mapping() {
        let adapter = YtDlpAdapter::new(Config::default());
        let request = sample_request(MediaType::Video, "720");
        let args = adapter.build_args(&request);
        assert!(args.contains(&"res:720".to_string()));
        assert!(args.contains(&"--no-part".to_string()));
        assert!(args.contains(&"after_move:filepath".to_string()));
        assert!(!args.contains(&"--cookies".to_string()));
        // 输出模板带任务ID前缀
        let template = args.last().unwrap();
        assert!(template.contains(&format!("video_{}_", request.job_id.simple())));
        assert!(template.ends_with("%(id)s.%(ext)s"));
    }

    #[test]
    fn test_build_args_audio_uses_bestaudio() {
        let adapter = YtDlpAdapter::new(Config::default());
        let args = adapter.build_args(&sample_request(MediaType::Audio, "192"));
        assert!(args.contains(&"bestaudio".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("res:")));
        assert!(args.iter().any(|a| a.contains("audio_")));
    }

    #[test]
    fn test_build_args_with_cookie_file() {
        let adapter = YtDlpAdapter::new(Config::default());
        let mut request = sample_request(MediaType::Video, "720");
        request.cookie_file = Some(PathBuf::from("/tmp/cookies_test.txt"));
        let args = adapter.build_args(&request);
        assert!(args.contains(&"--cookies".to_string()));
    }

    #[test]
    fn test_parse_progress_line() {
        let re = Regex::new(r"(\d+\.\d)%").unwrap();
        assert_eq!(
            parse_progress_line(&re, "[download]  45.2% of ~10MiB at 2MiB/s"),
            Some(45.2)
        );
        assert_eq!(parse_progress_line(&re, "[download] 100.0% of 10MiB"), Some(100.0));
        assert_eq!(parse_progress_line(&re, "[info] Writing metadata"), None);
    }

    #[test]
    fn test_cookie_file_removed_on_drop() {
        let cookie = CookieFile::create("# Netscape HTTP Cookie File").expect("创建失败");
        let path = cookie.path().to_path_buf();
        assert!(path.exists());
        drop(cookie);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    fn write_fake_engine(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-ytdlp.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[cfg(unix)]
    #[actix_rt::test]
    async fn test_download_reports_progress_and_path() {
        let dir = std::env::temp_dir().join(format!("mediadown_adapter_{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let output = dir.join("video_abc.mp4");
        std::fs::write(&output, b"fake video").unwrap();

        let body = format!(
            "echo '[download]  12.5% of ~3MiB' 1>&2\n\
             echo '[download] 100.0% of ~3MiB' 1>&2\n\
             echo '{}'",
            output.display()
        );
        let engine = write_fake_engine(&dir, &body);

        let mut config = Config::default();
        config.ytdlp_bin = engine.to_string_lossy().into_owned();
        let adapter = YtDlpAdapter::new(config);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let progress: ProgressFn = Arc::new(move |p| seen_cb.lock().unwrap().push(p));

        let path = adapter
            .download(
                &sample_request(MediaType::Video, "720"),
                progress,
                Arc::new(AtomicBool::new(false)),
            )
            .await
            .expect("下载失败");

        assert_eq!(path, output);
        assert_eq!(*seen.lock().unwrap(), vec![12.5, 100.0]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[actix_rt::test]
    async fn test_download_honors_cancel_signal() {
        let dir = std::env::temp_dir().join(format!("mediadown_adapter_{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let engine = write_fake_engine(&dir, "while true; do sleep 1; done");

        let mut config = Config::default();
        config.ytdlp_bin = engine.to_string_lossy().into_owned();
        let adapter = YtDlpAdapter::new(config);

        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_later = cancel.clone();
        actix_rt::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_later.store(true, Ordering::SeqCst);
        });

        let progress: ProgressFn = Arc::new(|_| {});
        let err = adapter
            .download(&sample_request(MediaType::Video, "720"), progress, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Cancelled));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
