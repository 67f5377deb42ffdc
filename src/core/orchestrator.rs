use actix::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::Config;
use crate::core::adapter::{CookieFile, DownloadRequest, MediaAdapter, ProgressFn};
use crate::core::error::DownloadError;
use crate::core::job::{Job, JobStatus, MediaType};
use crate::core::store::{
    ApplyMutation, CreateJob, DeleteJob as StoreDeleteJob, GetJob, JobMutation, JobStoreActor,
};
use crate::utils::security;

/// 下载编排 Actor
///
/// 负责校验请求、创建任务记录、为每个任务派生一个并发下载任务，
/// 并持有各任务的取消信号。任务字段的所有写入都经由存储层的
/// ApplyMutation 单一路径。
pub struct DownloadOrchestrator {
    config: Config,
    store: Addr<JobStoreActor>,
    adapter: Arc<dyn MediaAdapter>,
    /// 磁盘空间闸门，由清理调度器驱动
    accept_gate: Arc<AtomicBool>,
    /// 运行中任务的取消信号
    running: HashMap<Uuid, Arc<AtomicBool>>,
}

impl DownloadOrchestrator {
    pub fn new(
        config: Config,
        store: Addr<JobStoreActor>,
        adapter: Arc<dyn MediaAdapter>,
        accept_gate: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            store,
            adapter,
            accept_gate,
            running: HashMap::new(),
        }
    }

    /// 为任务派生下载执行体并登记取消信号
    fn dispatch(&mut self, ctx: &mut Context<Self>, job: &Job, cookies: Option<String>) {
        let cancel = Arc::new(AtomicBool::new(false));
        self.running.insert(job.job_id, cancel.clone());

        let request = DownloadRequest {
            job_id: job.job_id,
            media_type: job.media_type,
            url: job.url.clone(),
            quality: job.quality.clone(),
            cookie_file: None,
        };
        actix::spawn(run_download(
            self.config.clone(),
            self.store.clone(),
            self.adapter.clone(),
            ctx.address(),
            request,
            cookies,
            cancel,
        ));
    }
}

impl Actor for DownloadOrchestrator {
    type Context = Context<Self>;
}

/// ================== 消息与Handler定义 ==================

/// 发起下载任务
pub struct StartDownload {
    pub media_type: MediaType,
    pub url: String,
    pub quality: Option<String>,
    pub cookies: Option<String>,
    pub client_ip: String,
}
impl Message for StartDownload {
    type Result = Result<Uuid, DownloadError>;
}

impl Handler<StartDownload> for DownloadOrchestrator {
    type Result = ResponseActFuture<Self, Result<Uuid, DownloadError>>;
    fn handle(&mut self, msg: StartDownload, _ctx: &mut Self::Context) -> Self::Result {
        // 空间不足时整体拒绝新任务
        if !self.accept_gate.load(Ordering::SeqCst) {
            return Box::pin(actix::fut::ready(Err(DownloadError::InsufficientSpace)));
        }

        // 安全层校验，任何失败都在创建记录之前返回，无副作用
        let platform = match security::validate_url(&msg.url) {
            Ok(p) => p,
            Err(e) => return Box::pin(actix::fut::ready(Err(e))),
        };
        let quality = msg.quality.filter(|q| !q.is_empty()).unwrap_or_else(|| {
            match msg.media_type {
                MediaType::Video => self.config.default_video_quality.clone(),
                MediaType::Audio => self.config.default_audio_quality.clone(),
            }
        });
        if let Err(e) = security::validate_quality(msg.media_type, &quality) {
            return Box::pin(actix::fut::ready(Err(e)));
        }
        let cookies = msg.cookies.filter(|c| !c.trim().is_empty());
        if let Some(c) = &cookies {
            if let Err(e) = security::validate_cookies(c) {
                return Box::pin(actix::fut::ready(Err(e)));
            }
        }

        let job = Job::new(
            msg.media_type,
            msg.url,
            platform,
            quality,
            msg.client_ip.clone(),
        );
        log::info!(
            "[{}] 新{}任务 {} ({} {})",
            msg.client_ip,
            job.media_type,
            job.job_id,
            job.platform,
            job.quality
        );

        let store = self.store.clone();
        let record = job.clone();
        Box::pin(
            async move { Ok::<Uuid, DownloadError>(store.send(CreateJob(record)).await??) }
                .into_actor(self)
                .map(move |res, act, ctx| {
                    let job_id = res?;
                    act.dispatch(ctx, &job, cookies);
                    Ok(job_id)
                }),
        )
    }
}

/// 重试失败任务，返回新建的任务记录
pub struct RetryJob {
    pub job_id: Uuid,
}
impl Message for RetryJob {
    type Result = Result<Job, DownloadError>;
}

impl Handler<RetryJob> for DownloadOrchestrator {
    type Result = ResponseActFuture<Self, Result<Job, DownloadError>>;
    fn handle(&mut self, msg: RetryJob, _ctx: &mut Self::Context) -> Self::Result {
        if !self.accept_gate.load(Ordering::SeqCst) {
            return Box::pin(actix::fut::ready(Err(DownloadError::InsufficientSpace)));
        }
        let store = self.store.clone();
        let max_retries = self.config.max_retries;
        let job_id = msg.job_id;

        Box::pin(
            async move {
                let original = store
                    .send(GetJob { job_id })
                    .await?
                    .ok_or_else(|| DownloadError::not_found(job_id))?;
                // 只有 error 状态可重试，cancelled 视为用户意图，不再重试
                if original.status != JobStatus::Error {
                    return Err(DownloadError::NotRetryable(original.status));
                }
                if original.retry_count >= max_retries {
                    log::warn!("任务 {} 超过最大重试次数", job_id);
                    return Err(DownloadError::NotRetryable(original.status));
                }
                let job = Job::retry_from(&original);
                store.send(CreateJob(job.clone())).await??;
                log::info!("任务 {} 重试为 {}", job_id, job.job_id);
                Ok(job)
            }
            .into_actor(self)
            .map(|res: Result<Job, DownloadError>, act, ctx| {
                let job = res?;
                act.dispatch(ctx, &job, None);
                Ok(job)
            }),
        )
    }
}

/// 删除任务：运行中的先发取消信号，随后移除记录和文件
pub struct RemoveJob {
    pub job_id: Uuid,
}
impl Message for RemoveJob {
    type Result = Result<(), DownloadError>;
}

impl Handler<RemoveJob> for DownloadOrchestrator {
    type Result = ResponseFuture<Result<(), DownloadError>>;
    fn handle(&mut self, msg: RemoveJob, _ctx: &mut Self::Context) -> Self::Result {
        // 先打取消信号，执行体会在下一个检查点退出并清理临时文件
        if let Some(flag) = self.running.get(&msg.job_id) {
            flag.store(true, Ordering::SeqCst);
        }
        let store = self.store.clone();
        let download_dir = self.config.download_dir.clone();
        let job_id = msg.job_id;

        Box::pin(async move {
            let job = store
                .send(GetJob { job_id })
                .await?
                .ok_or_else(|| DownloadError::not_found(job_id))?;
            // 标记取消（终态任务会被拒绝，忽略即可），然后移除记录
            let _ = store
                .send(ApplyMutation {
                    job_id,
                    mutation: JobMutation::Cancel,
                })
                .await?;
            let _ = store.send(StoreDeleteJob { job_id }).await?;
            if !job.file_name.is_empty() {
                security::remove_download_file(Path::new(&download_dir), &job.file_name);
            }
            log::info!("任务 {} 已删除", job_id);
            Ok(())
        })
    }
}

/// 内部消息：下载执行体结束，注销取消信号
struct TaskFinished {
    job_id: Uuid,
}
impl Message for TaskFinished {
    type Result = ();
}
impl Handler<TaskFinished> for DownloadOrchestrator {
    type Result = ();
    fn handle(&mut self, msg: TaskFinished, _ctx: &mut Self::Context) {
        self.running.remove(&msg.job_id);
    }
}

/// ================== 下载执行体 ==================

/// 单个任务的完整生命周期，结束后向编排器注销
async fn run_download(
    config: Config,
    store: Addr<JobStoreActor>,
    adapter: Arc<dyn MediaAdapter>,
    manager: Addr<DownloadOrchestrator>,
    request: DownloadRequest,
    cookies: Option<String>,
    cancel: Arc<AtomicBool>,
) {
    let job_id = request.job_id;
    match drive_download(&config, &store, adapter, request, cookies, cancel).await {
        Ok(file_name) => log::info!("任务 {}: 下载完成 - {}", job_id, file_name),
        Err(DownloadError::Cancelled) => log::info!("任务 {}: 已取消", job_id),
        Err(e) => log::error!("任务 {}: 结束于错误: {}", job_id, e),
    }
    manager.do_send(TaskFinished { job_id });
}

async fn drive_download(
    config: &Config,
    store: &Addr<JobStoreActor>,
    adapter: Arc<dyn MediaAdapter>,
    request: DownloadRequest,
    cookies: Option<String>,
    cancel: Arc<AtomicBool>,
) -> Result<String, DownloadError> {
    let job_id = request.job_id;

    // queued -> running 只允许成功一次，失败说明记录已被删除
    if let Err(e) = store
        .send(ApplyMutation {
            job_id,
            mutation: JobMutation::Start,
        })
        .await?
    {
        log::debug!("任务 {}: 未能进入运行状态: {}", job_id, e);
        return Err(DownloadError::Cancelled);
    }

    let result = execute_download(config, store, adapter, request, cookies, cancel.clone()).await;

    match result {
        Ok(path) => {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if file_name.is_empty() {
                let _ = store
                    .send(ApplyMutation {
                        job_id,
                        mutation: JobMutation::Fail {
                            message: "下载完成但输出文件名无效".to_string(),
                        },
                    })
                    .await;
                return Err(DownloadError::adapter("输出文件名无效"));
            }
            match store
                .send(ApplyMutation {
                    job_id,
                    mutation: JobMutation::Complete {
                        file_name: file_name.clone(),
                    },
                })
                .await?
            {
                Ok(_) => Ok(file_name),
                Err(e) => {
                    // 完成瞬间任务被删除，输出文件成为孤儿，立即清理
                    log::warn!("任务 {}: 完成时记录已不存在（{}），清理输出文件", job_id, e);
                    let _ = std::fs::remove_file(&path);
                    Err(DownloadError::Cancelled)
                }
            }
        }
        Err(e) => {
            if cancel.load(Ordering::SeqCst) || matches!(e, DownloadError::Cancelled) {
                let _ = store
                    .send(ApplyMutation {
                        job_id,
                        mutation: JobMutation::Cancel,
                    })
                    .await;
                return Err(DownloadError::Cancelled);
            }
            // 原始原因只进服务端日志，任务记录里保存脱敏后的消息
            log::error!("任务 {}: 下载失败: {}", job_id, e);
            let _ = store
                .send(ApplyMutation {
                    job_id,
                    mutation: JobMutation::Fail {
                        message: e.sanitized(),
                    },
                })
                .await;
            Err(e)
        }
    }
}

/// 准备 Cookie 临时文件并在硬超时内驱动下载引擎
async fn execute_download(
    config: &Config,
    store: &Addr<JobStoreActor>,
    adapter: Arc<dyn MediaAdapter>,
    mut request: DownloadRequest,
    cookies: Option<String>,
    cancel: Arc<AtomicBool>,
) -> Result<std::path::PathBuf, DownloadError> {
    // 守卫保证无论成功、报错还是取消，临时文件都会被清理
    let _cookie_guard = match &cookies {
        Some(c) => {
            let guard = CookieFile::create(c)?;
            request.cookie_file = Some(guard.path().to_path_buf());
            Some(guard)
        }
        None => None,
    };

    // 进度回调走消息，由存储层保证单调与终态冻结
    let job_id = request.job_id;
    let progress_store = store.clone();
    let sink: ProgressFn = Arc::new(move |p: f32| {
        progress_store.do_send(ApplyMutation {
            job_id,
            mutation: JobMutation::Progress(p),
        });
    });

    let hard_timeout = Duration::from_secs(config.job_timeout_mins * 60);
    match tokio::time::timeout(hard_timeout, adapter.download(&request, sink, cancel)).await {
        Ok(result) => result,
        Err(_) => Err(DownloadError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::Platform;
    use crate::core::store::CountJobs;
    use async_trait::async_trait;
    use std::path::PathBuf;

    /// 测试用脚本化下载引擎
    enum ScriptedOutcome {
        Produce(PathBuf),
        Fail(String),
        WaitForCancel,
    }

    struct ScriptedAdapter {
        steps: Vec<f32>,
        outcome: ScriptedOutcome,
    }

    #[async_trait]
    impl MediaAdapter for ScriptedAdapter {
        async fn download(
            &self,
            _request: &DownloadRequest,
            progress: ProgressFn,
            cancel: Arc<AtomicBool>,
        ) -> Result<PathBuf, DownloadError> {
            for p in &self.steps {
                if cancel.load(Ordering::SeqCst) {
                    return Err(DownloadError::Cancelled);
                }
                progress(*p);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            match &self.outcome {
                ScriptedOutcome::Produce(path) => Ok(path.clone()),
                ScriptedOutcome::Fail(msg) => Err(DownloadError::adapter(msg.clone())),
                ScriptedOutcome::WaitForCancel => loop {
                    if cancel.load(Ordering::SeqCst) {
                        return Err(DownloadError::Cancelled);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                },
            }
        }
    }

    struct TestRig {
        store: Addr<JobStoreActor>,
        orchestrator: Addr<DownloadOrchestrator>,
        download_dir: PathBuf,
    }

    fn setup(adapter: ScriptedAdapter, tweak: impl FnOnce(&mut Config)) -> TestRig {
        let download_dir =
            std::env::temp_dir().join(format!("mediadown_orch_{}", Uuid::new_v4()));
        std::fs::create_dir_all(&download_dir).expect("创建测试目录失败");

        let mut config = Config::default();
        config.download_dir = download_dir.to_string_lossy().into_owned();
        tweak(&mut config);

        let store = JobStoreActor::new(&config).start();
        let accept_gate = Arc::new(AtomicBool::new(true));
        let orchestrator = DownloadOrchestrator::new(
            config,
            store.clone(),
            Arc::new(adapter),
            accept_gate,
        )
        .start();
        TestRig {
            store,
            orchestrator,
            download_dir,
        }
    }

    fn start_msg(url: &str) -> StartDownload {
        StartDownload {
            media_type: MediaType::Video,
            url: url.into(),
            quality: Some("720".into()),
            cookies: None,
            client_ip: "127.0.0.1".into(),
        }
    }

    async fn wait_for_status(store: &Addr<JobStoreActor>, job_id: Uuid, expected: JobStatus) -> Job {
        for _ in 0..300 {
            if let Some(job) = store.send(GetJob { job_id }).await.unwrap() {
                if job.status == expected {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("等待状态超时: {}", expected);
    }

    #[actix_rt::test]
    async fn test_start_runs_to_completion() {
        let output_name = "clip.mp4";
        let download_dir =
            std::env::temp_dir().join(format!("mediadown_orch_{}", Uuid::new_v4()));
        std::fs::create_dir_all(&download_dir).unwrap();
        let output = download_dir.join(output_name);
        std::fs::write(&output, b"video data").unwrap();

        let rig = {
            let download_dir = download_dir.clone();
            let adapter = ScriptedAdapter {
                steps: vec![0.0, 45.0, 100.0],
                outcome: ScriptedOutcome::Produce(output.clone()),
            };
            let mut config = Config::default();
            config.download_dir = download_dir.to_string_lossy().into_owned();
            let store = JobStoreActor::new(&config).start();
            let orchestrator = DownloadOrchestrator::new(
                config,
                store.clone(),
                Arc::new(adapter),
                Arc::new(AtomicBool::new(true)),
            )
            .start();
            TestRig {
                store,
                orchestrator,
                download_dir,
            }
        };

        let job_id = rig
            .orchestrator
            .send(start_msg("https://www.youtube.com/watch?v=abc"))
            .await
            .unwrap()
            .expect("创建任务失败");

        // 创建成功后立即可见，状态为 queued 或 running
        let job = rig.store.send(GetJob { job_id }).await.unwrap().expect("任务不可见");
        assert!(matches!(job.status, JobStatus::Queued | JobStatus::Running));
        assert_eq!(job.platform, Platform::Youtube);

        let done = wait_for_status(&rig.store, job_id, JobStatus::Done).await;
        assert_eq!(done.file_name, output_name);
        assert_eq!(done.progress, 100.0);
        assert!(done.error.is_empty());

        let _ = std::fs::remove_dir_all(&rig.download_dir);
    }

    #[actix_rt::test]
    async fn test_start_rejects_invalid_input_without_side_effects() {
        let rig = setup(
            ScriptedAdapter {
                steps: vec![],
                outcome: ScriptedOutcome::Fail("不应执行".into()),
            },
            |_| {},
        );

        let err = rig
            .orchestrator
            .send(start_msg("https://example.com/watch?v=abc"))
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_validation());

        let mut msg = start_msg("https://www.youtube.com/watch?v=abc");
        msg.quality = Some("480".into());
        assert!(rig.orchestrator.send(msg).await.unwrap().is_err());

        let mut msg = start_msg("https://www.youtube.com/watch?v=abc");
        msg.cookies = Some("a".repeat(200_000));
        assert!(rig.orchestrator.send(msg).await.unwrap().is_err());

        // 校验失败不留任何任务记录
        assert_eq!(rig.store.send(CountJobs).await.unwrap(), 0);
        let _ = std::fs::remove_dir_all(&rig.download_dir);
    }

    #[actix_rt::test]
    async fn test_accept_gate_blocks_new_jobs() {
        let download_dir =
            std::env::temp_dir().join(format!("mediadown_orch_{}", Uuid::new_v4()));
        std::fs::create_dir_all(&download_dir).unwrap();
        let mut config = Config::default();
        config.download_dir = download_dir.to_string_lossy().into_owned();
        let store = JobStoreActor::new(&config).start();
        let gate = Arc::new(AtomicBool::new(false)); // 闸门关闭
        let orchestrator = DownloadOrchestrator::new(
            config,
            store,
            Arc::new(ScriptedAdapter {
                steps: vec![],
                outcome: ScriptedOutcome::Fail("不应执行".into()),
            }),
            gate,
        )
        .start();

        let err = orchestrator
            .send(start_msg("https://www.youtube.com/watch?v=abc"))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, DownloadError::InsufficientSpace));
        let _ = std::fs::remove_dir_all(&download_dir);
    }

    #[actix_rt::test]
    async fn test_adapter_failure_sets_sanitized_error() {
        let rig = setup(
            ScriptedAdapter {
                steps: vec![10.0],
                outcome: ScriptedOutcome::Fail("视频不可用".into()),
            },
            |_| {},
        );

        let job_id = rig
            .orchestrator
            .send(start_msg("https://www.youtube.com/watch?v=abc"))
            .await
            .unwrap()
            .unwrap();

        let failed = wait_for_status(&rig.store, job_id, JobStatus::Error).await;
        assert!(failed.error.contains("视频不可用"));
        assert!(failed.file_name.is_empty());
        let _ = std::fs::remove_dir_all(&rig.download_dir);
    }

    #[actix_rt::test]
    async fn test_retry_links_original_job() {
        let rig = setup(
            ScriptedAdapter {
                steps: vec![],
                outcome: ScriptedOutcome::Fail("网络中断".into()),
            },
            |_| {},
        );

        let job_id = rig
            .orchestrator
            .send(start_msg("https://www.youtube.com/watch?v=abc"))
            .await
            .unwrap()
            .unwrap();
        wait_for_status(&rig.store, job_id, JobStatus::Error).await;

        let retry = rig
            .orchestrator
            .send(RetryJob { job_id })
            .await
            .unwrap()
            .expect("重试失败");
        assert_eq!(retry.retry_of, Some(job_id));
        assert_eq!(retry.retry_count, 1);
        assert_ne!(retry.job_id, job_id);

        let _ = std::fs::remove_dir_all(&rig.download_dir);
    }

    #[actix_rt::test]
    async fn test_retry_rejected_for_non_error_jobs() {
        let rig = setup(
            ScriptedAdapter {
                steps: vec![],
                outcome: ScriptedOutcome::WaitForCancel,
            },
            |_| {},
        );

        let job_id = rig
            .orchestrator
            .send(start_msg("https://www.youtube.com/watch?v=abc"))
            .await
            .unwrap()
            .unwrap();
        wait_for_status(&rig.store, job_id, JobStatus::Running).await;

        // 运行中的任务不可重试
        let err = rig
            .orchestrator
            .send(RetryJob { job_id })
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, DownloadError::NotRetryable(_)));

        // 不存在的任务同样拒绝
        let err = rig
            .orchestrator
            .send(RetryJob { job_id: Uuid::new_v4() })
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, DownloadError::NotFound(_)));

        rig.orchestrator.send(RemoveJob { job_id }).await.unwrap().unwrap();
        let _ = std::fs::remove_dir_all(&rig.download_dir);
    }

    #[actix_rt::test]
    async fn test_retry_ceiling_enforced() {
        let rig = setup(
            ScriptedAdapter {
                steps: vec![],
                outcome: ScriptedOutcome::Fail("网络中断".into()),
            },
            |c| c.max_retries = 0,
        );

        let job_id = rig
            .orchestrator
            .send(start_msg("https://www.youtube.com/watch?v=abc"))
            .await
            .unwrap()
            .unwrap();
        wait_for_status(&rig.store, job_id, JobStatus::Error).await;

        let err = rig
            .orchestrator
            .send(RetryJob { job_id })
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, DownloadError::NotRetryable(_)));
        let _ = std::fs::remove_dir_all(&rig.download_dir);
    }

    #[actix_rt::test]
    async fn test_remove_cancels_running_job() {
        let rig = setup(
            ScriptedAdapter {
                steps: vec![5.0],
                outcome: ScriptedOutcome::WaitForCancel,
            },
            |_| {},
        );

        let job_id = rig
            .orchestrator
            .send(start_msg("https://www.youtube.com/watch?v=abc"))
            .await
            .unwrap()
            .unwrap();
        wait_for_status(&rig.store, job_id, JobStatus::Running).await;

        rig.orchestrator
            .send(RemoveJob { job_id })
            .await
            .unwrap()
            .expect("删除失败");

        // 记录立即不可见
        assert!(rig.store.send(GetJob { job_id }).await.unwrap().is_none());

        // 第二次删除返回 NotFound（幂等性约定）
        let err = rig
            .orchestrator
            .send(RemoveJob { job_id })
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, DownloadError::NotFound(_)));

        // 执行体观察到取消信号后正常退出
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = std::fs::remove_dir_all(&rig.download_dir);
    }
}
