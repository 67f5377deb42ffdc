use actix::prelude::*;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::Config;
use crate::core::error::DownloadError;
use crate::core::job::{Job, JobStatus, Platform};

/// list 查询允许返回的最大条数
const LIST_LIMIT_MAX: usize = 1000;

/// 存储层内部记录：任务本体 + 版本号 + 过期时间
///
/// 过期时间在创建时一次性算出（created_at + TTL），更新不续期。
#[derive(Debug, Clone)]
struct StoredJob {
    job: Job,
    version: u64,
    expires_at: DateTime<Utc>,
}

/// 任务存储 Actor
///
/// 所有读写都经过消息，单线程处理天然保证逐记录原子性；
/// 状态变更在 ApplyMutation 里做合法性比对，防止并发回调互相覆盖。
pub struct JobStoreActor {
    jobs: HashMap<Uuid, StoredJob>,
    ttl: ChronoDuration,
}

impl JobStoreActor {
    pub fn new(config: &Config) -> Self {
        Self {
            jobs: HashMap::new(),
            ttl: ChronoDuration::seconds(config.job_ttl_secs as i64),
        }
    }

    fn is_expired(stored: &StoredJob, now: DateTime<Utc>) -> bool {
        stored.expires_at <= now
    }

    /// 读取记录，过期的当场删除并视为不存在
    fn get_live(&mut self, job_id: &Uuid) -> Option<&mut StoredJob> {
        let now = Utc::now();
        if let Some(stored) = self.jobs.get(job_id) {
            if Self::is_expired(stored, now) {
                self.jobs.remove(job_id);
                return None;
            }
        }
        self.jobs.get_mut(job_id)
    }
}

impl Actor for JobStoreActor {
    type Context = Context<Self>;
}

/// ================== 消息与Handler定义 ==================

/// 任务状态变更，存储层的唯一写入路径
#[derive(Debug, Clone)]
pub enum JobMutation {
    /// queued -> running，只允许进入一次
    Start,
    /// 更新进度，只在 queued/running 下合法；非递增值忽略
    Progress(f32),
    /// running -> done，记录输出文件名
    Complete { file_name: String },
    /// 非终态 -> error
    Fail { message: String },
    /// 非终态 -> cancelled
    Cancel,
}

impl JobMutation {
    fn op_name(&self) -> &'static str {
        match self {
            JobMutation::Start => "启动",
            JobMutation::Progress(_) => "更新进度",
            JobMutation::Complete { .. } => "标记完成",
            JobMutation::Fail { .. } => "标记失败",
            JobMutation::Cancel => "取消",
        }
    }
}

/// 创建任务
pub struct CreateJob(pub Job);
impl Message for CreateJob {
    type Result = Result<Uuid, DownloadError>;
}
impl Handler<CreateJob> for JobStoreActor {
    type Result = Result<Uuid, DownloadError>;
    fn handle(&mut self, msg: CreateJob, _ctx: &mut Self::Context) -> Self::Result {
        let job = msg.0;
        let job_id = job.job_id;
        if self.jobs.contains_key(&job_id) {
            // UUID 冲突，理论上不可能发生
            return Err(DownloadError::Internal(format!("任务ID冲突: {}", job_id)));
        }
        let expires_at = job.created_at + self.ttl;
        self.jobs.insert(
            job_id,
            StoredJob {
                job,
                version: 0,
                expires_at,
            },
        );
        Ok(job_id)
    }
}

/// 查询任务
pub struct GetJob {
    pub job_id: Uuid,
}
impl Message for GetJob {
    type Result = Option<Job>;
}
impl Handler<GetJob> for JobStoreActor {
    type Result = Option<Job>;
    fn handle(&mut self, msg: GetJob, _ctx: &mut Self::Context) -> Self::Result {
        self.get_live(&msg.job_id).map(|s| s.job.clone())
    }
}

/// 应用状态变更
pub struct ApplyMutation {
    pub job_id: Uuid,
    pub mutation: JobMutation,
}
impl Message for ApplyMutation {
    type Result = Result<Job, DownloadError>;
}
impl Handler<ApplyMutation> for JobStoreActor {
    type Result = Result<Job, DownloadError>;
    fn handle(&mut self, msg: ApplyMutation, _ctx: &mut Self::Context) -> Self::Result {
        let op = msg.mutation.op_name();
        let stored = self
            .get_live(&msg.job_id)
            .ok_or_else(|| DownloadError::not_found(msg.job_id))?;
        let current = stored.job.status;

        let conflict = || DownloadError::StatusConflict { current, op };

        match msg.mutation {
            JobMutation::Start => {
                if current != JobStatus::Queued {
                    return Err(conflict());
                }
                stored.job.status = JobStatus::Running;
            }
            JobMutation::Progress(p) => {
                if current.is_terminal() {
                    return Err(conflict());
                }
                let p = p.clamp(0.0, 100.0);
                // 进度单调不减，乱序到达的旧回调直接忽略
                if p > stored.job.progress {
                    stored.job.progress = p;
                }
            }
            JobMutation::Complete { file_name } => {
                if current != JobStatus::Running {
                    return Err(conflict());
                }
                stored.job.status = JobStatus::Done;
                stored.job.progress = 100.0;
                stored.job.file_name = file_name;
            }
            JobMutation::Fail { message } => {
                if current.is_terminal() {
                    return Err(conflict());
                }
                stored.job.status = JobStatus::Error;
                stored.job.error = message;
            }
            JobMutation::Cancel => {
                if current.is_terminal() {
                    return Err(conflict());
                }
                stored.job.status = JobStatus::Cancelled;
            }
        }

        stored.version += 1;
        stored.job.updated_at = Utc::now();
        Ok(stored.job.clone())
    }
}

/// 删除任务，返回被删除的记录
pub struct DeleteJob {
    pub job_id: Uuid,
}
impl Message for DeleteJob {
    type Result = Result<Job, DownloadError>;
}
impl Handler<DeleteJob> for JobStoreActor {
    type Result = Result<Job, DownloadError>;
    fn handle(&mut self, msg: DeleteJob, _ctx: &mut Self::Context) -> Self::Result {
        // 过期记录同样视为不存在
        if self.get_live(&msg.job_id).is_none() {
            return Err(DownloadError::not_found(msg.job_id));
        }
        self.jobs
            .remove(&msg.job_id)
            .map(|s| s.job)
            .ok_or_else(|| DownloadError::not_found(msg.job_id))
    }
}

/// 按条件查询任务列表，created_at 倒序
#[derive(Debug, Clone, Default)]
pub struct ListJobs {
    pub status: Option<JobStatus>,
    pub platform: Option<Platform>,
    pub limit: usize,
}
impl Message for ListJobs {
    type Result = Vec<Job>;
}
impl Handler<ListJobs> for JobStoreActor {
    type Result = MessageResult<ListJobs>;
    fn handle(&mut self, msg: ListJobs, _ctx: &mut Self::Context) -> Self::Result {
        let now = Utc::now();
        let limit = msg.limit.clamp(1, LIST_LIMIT_MAX);
        let mut jobs: Vec<Job> = self
            .jobs
            .values()
            .filter(|s| !Self::is_expired(s, now))
            .map(|s| &s.job)
            .filter(|j| msg.status.map_or(true, |st| j.status == st))
            .filter(|j| msg.platform.map_or(true, |p| j.platform == p))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        MessageResult(jobs)
    }
}

/// 任务总数（不含已过期）
pub struct CountJobs;
impl Message for CountJobs {
    type Result = usize;
}
impl Handler<CountJobs> for JobStoreActor {
    type Result = MessageResult<CountJobs>;
    fn handle(&mut self, _msg: CountJobs, _ctx: &mut Self::Context) -> Self::Result {
        let now = Utc::now();
        MessageResult(
            self.jobs
                .values()
                .filter(|s| !Self::is_expired(s, now))
                .count(),
        )
    }
}

/// 任务统计信息
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct JobStatsReport {
    pub total: usize,
    pub by_status: HashMap<String, usize>,
    pub by_platform: HashMap<String, usize>,
    pub by_type: HashMap<String, usize>,
}

pub struct JobStats;
impl Message for JobStats {
    type Result = JobStatsReport;
}
impl Handler<JobStats> for JobStoreActor {
    type Result = MessageResult<JobStats>;
    fn handle(&mut self, _msg: JobStats, _ctx: &mut Self::Context) -> Self::Result {
        let now = Utc::now();
        let mut report = JobStatsReport::default();
        for stored in self.jobs.values().filter(|s| !Self::is_expired(s, now)) {
            report.total += 1;
            *report
                .by_status
                .entry(stored.job.status.to_string())
                .or_insert(0) += 1;
            *report
                .by_platform
                .entry(stored.job.platform.to_string())
                .or_insert(0) += 1;
            *report
                .by_type
                .entry(stored.job.media_type.to_string())
                .or_insert(0) += 1;
        }
        MessageResult(report)
    }
}

/// 物理清除所有已过期记录，返回清除数量
pub struct PurgeExpired;
impl Message for PurgeExpired {
    type Result = usize;
}
impl Handler<PurgeExpired> for JobStoreActor {
    type Result = MessageResult<PurgeExpired>;
    fn handle(&mut self, _msg: PurgeExpired, _ctx: &mut Self::Context) -> Self::Result {
        let now = Utc::now();
        let before = self.jobs.len();
        self.jobs.retain(|_, s| !Self::is_expired(s, now));
        MessageResult(before - self.jobs.len())
    }
}
