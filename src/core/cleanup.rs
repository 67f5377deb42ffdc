use actix::prelude::*;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::config::Config;
use crate::core::error::DownloadError;
use crate::core::store::{JobStoreActor, ListJobs, PurgeExpired};

const GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// 单轮清理的结果
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SweepReport {
    pub purged_jobs: usize,
    pub deleted_files: usize,
    pub free_gb: f64,
    pub accepting: bool,
}

/// 清理调度 Actor
///
/// 周期性执行：清除过期任务记录、删除超龄文件、检查剩余空间并
/// 驱动接收闸门。同一时间最多只有一轮清理在跑。
pub struct CleanupActor {
    config: Config,
    store: Addr<JobStoreActor>,
    accept_gate: Arc<AtomicBool>,
    sweeping: Arc<AtomicBool>,
}

impl CleanupActor {
    pub fn new(config: Config, store: Addr<JobStoreActor>, accept_gate: Arc<AtomicBool>) -> Self {
        Self {
            config,
            store,
            accept_gate,
            sweeping: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Actor for CleanupActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let interval = Duration::from_secs(self.config.cleanup_interval_secs);
        log::info!("清理调度已启动，周期 {} 秒", self.config.cleanup_interval_secs);
        ctx.run_interval(interval, |act, ctx| {
            // 上一轮还没结束就跳过，不允许并发清理
            if act.sweeping.swap(true, Ordering::SeqCst) {
                log::debug!("清理仍在进行，跳过本轮");
                return;
            }
            let store = act.store.clone();
            let config = act.config.clone();
            let gate = act.accept_gate.clone();
            let flag = act.sweeping.clone();
            ctx.spawn(
                async move {
                    match sweep(&store, &config, &gate).await {
                        Ok(report) => log::info!(
                            "清理完成: 过期任务 {}，删除文件 {}，剩余空间 {:.1} GB",
                            report.purged_jobs,
                            report.deleted_files,
                            report.free_gb
                        ),
                        Err(e) => log::error!("清理失败: {}", e),
                    }
                    flag.store(false, Ordering::SeqCst);
                }
                .into_actor(act),
            );
        });
    }
}

/// 手动触发一轮清理
pub struct SweepNow;
impl Message for SweepNow {
    type Result = Result<SweepReport, DownloadError>;
}

impl Handler<SweepNow> for CleanupActor {
    type Result = ResponseFuture<Result<SweepReport, DownloadError>>;
    fn handle(&mut self, _msg: SweepNow, _ctx: &mut Self::Context) -> Self::Result {
        if self.sweeping.swap(true, Ordering::SeqCst) {
            return Box::pin(futures::future::ready(Err(DownloadError::CleanupBusy)));
        }
        let store = self.store.clone();
        let config = self.config.clone();
        let gate = self.accept_gate.clone();
        let flag = self.sweeping.clone();
        Box::pin(async move {
            let result = sweep(&store, &config, &gate).await;
            flag.store(false, Ordering::SeqCst);
            result
        })
    }
}

/// 执行一轮完整清理
pub async fn sweep(
    store: &Addr<JobStoreActor>,
    config: &Config,
    accept_gate: &Arc<AtomicBool>,
) -> Result<SweepReport, DownloadError> {
    let mut report = SweepReport::default();

    // 1. 清除过期任务记录
    report.purged_jobs = store.send(PurgeExpired).await?;

    // 2. 删除超龄文件。非终态任务引用的文件不动
    let jobs = store
        .send(ListJobs {
            limit: 1000,
            ..Default::default()
        })
        .await?;
    let protected: HashSet<String> = jobs
        .iter()
        .filter(|j| !j.status.is_terminal())
        .map(|j| j.file_name.clone())
        .filter(|n| !n.is_empty())
        .collect();

    let root = Path::new(&config.download_dir);
    let max_age = Duration::from_secs(config.cleanup_age_days * 86400);
    report.deleted_files = delete_aged_files(root, &protected, max_age);

    // 3. 空间回收与接收闸门
    let mut free_gb = available_gb(root);
    if free_gb < config.cleanup_min_free_gb {
        report.deleted_files += reclaim_space(root, &protected, config, &mut free_gb);
    }
    let accepting = free_gb >= config.min_free_space_gb;
    if !accepting {
        log::warn!(
            "剩余空间 {:.2} GB 低于下限 {:.2} GB，暂停接收新任务",
            free_gb,
            config.min_free_space_gb
        );
    } else if !accept_gate.load(Ordering::SeqCst) {
        log::info!("磁盘空间恢复，重新接收新任务");
    }
    accept_gate.store(accepting, Ordering::SeqCst);

    report.free_gb = free_gb;
    report.accepting = accepting;
    Ok(report)
}

/// 下载目录所在磁盘的剩余空间（GB），读取失败按充足处理
fn available_gb(root: &Path) -> f64 {
    match fs2::available_space(root) {
        Ok(bytes) => bytes as f64 / GB,
        Err(e) => {
            log::warn!("读取磁盘空间失败: {}", e);
            f64::INFINITY
        }
    }
}

/// 删除超过保留期的文件，返回删除数量
fn delete_aged_files(root: &Path, protected: &HashSet<String>, max_age: Duration) -> usize {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("读取下载目录失败: {}", e);
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut deleted = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if protected.contains(&name) {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age >= max_age {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    log::info!("清理超龄文件: {}", name);
                    deleted += 1;
                }
                Err(e) => log::warn!("删除文件失败 {}: {}", name, e),
            }
        }
    }
    deleted
}

/// 空间不足时从最旧的文件开始回收，直到回到水位线以上
fn reclaim_space(
    root: &Path,
    protected: &HashSet<String>,
    config: &Config,
    free_gb: &mut f64,
) -> usize {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("读取下载目录失败: {}", e);
            return 0;
        }
    };

    let mut files: Vec<(SystemTime, std::path::PathBuf, u64)> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if protected.contains(&name) {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((mtime, path, meta.len()));
        }
    }
    files.sort_by_key(|(mtime, _, _)| *mtime);

    let mut deleted = 0;
    for (_, path, size) in files {
        if *free_gb >= config.cleanup_min_free_gb {
            break;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                log::warn!("空间不足，回收文件: {}", path.display());
                *free_gb += size as f64 / GB;
                deleted += 1;
            }
            Err(e) => log::warn!("回收文件失败 {}: {}", path.display(), e),
        }
    }

    // 估算之后用真实值校正
    let real = available_gb(root);
    if real.is_finite() {
        *free_gb = real;
    }
    deleted
}
