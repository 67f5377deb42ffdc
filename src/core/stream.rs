use actix::Addr;
use bytes::Bytes;
use futures::Stream;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::Config;
use crate::core::error::DownloadError;
use crate::core::job::JobStatus;
use crate::core::store::{ApplyMutation, GetJob, JobMutation, JobStoreActor};

/// 进度流参数
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// 轮询存储层的间隔
    pub poll_interval: Duration,
    /// running 状态下进度无变化判定为卡死的超时
    pub stuck_timeout: Duration,
    /// 单条流的最长存活时间
    pub max_duration: Duration,
}

impl StreamSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            stuck_timeout: Duration::from_secs(config.stuck_timeout_secs),
            max_duration: Duration::from_secs(config.stream_max_secs),
        }
    }
}

/// 普通进度事件
pub fn format_progress(progress: f32) -> String {
    format!("data:{:.1}\n\n", progress)
}

/// 终态成功事件，携带输出文件名
pub fn format_done(progress: f32, file_name: &str) -> String {
    format!("data:{:.1}|{}\n\n", progress, file_name)
}

/// 终态失败事件
pub fn format_error(message: &str) -> String {
    format!("data:ERROR:{}\n\n", message)
}

struct PollState {
    store: Addr<JobStoreActor>,
    job_id: Uuid,
    settings: StreamSettings,
    /// 上一次推送的进度，-1 表示还没推送过
    last_progress: f32,
    last_change: Instant,
    deadline: Instant,
    first: bool,
    file_announced: bool,
    closed: bool,
}

/// 构造某个任务的进度事件流
///
/// 惰性轮询存储层，进度有变化才推送；发出终态事件后立即收尾，
/// 任务不存在时推送一条错误事件后关闭。卡死检测是状态机的
/// 显式迁移：超时会把任务置为 error，而不是让流无限挂着。
pub fn progress_events(
    store: Addr<JobStoreActor>,
    job_id: Uuid,
    settings: StreamSettings,
) -> impl Stream<Item = Result<Bytes, DownloadError>> {
    let deadline = Instant::now() + settings.max_duration;
    let state = PollState {
        store,
        job_id,
        settings,
        last_progress: -1.0,
        last_change: Instant::now(),
        deadline,
        first: true,
        file_announced: false,
        closed: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        if st.closed {
            return None;
        }
        loop {
            if !st.first {
                tokio::time::sleep(st.settings.poll_interval).await;
            }
            st.first = false;

            let mut buf = String::new();

            if Instant::now() >= st.deadline {
                log::warn!("任务 {} 的进度流超过最长存活时间", st.job_id);
                buf.push_str(&format_error("进度流超时"));
                st.closed = true;
                return Some((Ok(Bytes::from(buf)), st));
            }

            let job = match st.store.send(GetJob { job_id: st.job_id }).await {
                Ok(job) => job,
                Err(e) => {
                    log::error!("进度流读取失败: {}", e);
                    buf.push_str(&format_error("内部错误"));
                    st.closed = true;
                    return Some((Ok(Bytes::from(buf)), st));
                }
            };
            let job = match job {
                Some(j) => j,
                None => {
                    buf.push_str(&format_error("任务不存在"));
                    st.closed = true;
                    return Some((Ok(Bytes::from(buf)), st));
                }
            };

            // 进度有变化才推送；到达 100 且有文件名时带上文件名
            if job.progress != st.last_progress {
                if job.status == JobStatus::Done && !job.file_name.is_empty() {
                    buf.push_str(&format_done(job.progress, &job.file_name));
                    st.file_announced = true;
                } else {
                    buf.push_str(&format_progress(job.progress));
                }
                st.last_progress = job.progress;
                st.last_change = Instant::now();
            }

            match job.status {
                JobStatus::Error => {
                    let msg = if job.error.is_empty() {
                        "下载失败".to_string()
                    } else {
                        job.error.clone()
                    };
                    buf.push_str(&format_error(&msg));
                    st.closed = true;
                }
                JobStatus::Cancelled => {
                    buf.push_str(&format_error(&DownloadError::Cancelled.to_string()));
                    st.closed = true;
                }
                JobStatus::Done => {
                    // 进度早到 100 的情况下补发带文件名的终态事件
                    if !st.file_announced {
                        buf.push_str(&format_done(100.0, &job.file_name));
                        st.file_announced = true;
                    }
                    st.closed = true;
                }
                JobStatus::Running => {
                    if st.last_change.elapsed() >= st.settings.stuck_timeout {
                        // 卡死是显式的状态机迁移：任务置为 error，流随即收尾
                        let message = DownloadError::StuckJob.to_string();
                        log::warn!("任务 {} 卡死，进度长时间无变化", st.job_id);
                        let _ = st
                            .store
                            .send(ApplyMutation {
                                job_id: st.job_id,
                                mutation: JobMutation::Fail {
                                    message: message.clone(),
                                },
                            })
                            .await;
                        buf.push_str(&format_error(&message));
                        st.closed = true;
                    }
                }
                JobStatus::Queued => {}
            }

            if !buf.is_empty() {
                return Some((Ok(Bytes::from(buf)), st));
            }
            if st.closed {
                return None;
            }
        }
    })
}
