//! API: HTTP 接口层，负责请求解析、限流与错误码映射
//!
//! 业务动作全部转发给编排器/存储层的消息接口，自身不持有任务状态。

use actix::Addr;
use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse, ResponseError};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::config::Config;
use crate::core::cleanup::{CleanupActor, SweepNow};
use crate::core::error::DownloadError;
use crate::core::job::{JobStatus, MediaType};
use crate::core::orchestrator::{DownloadOrchestrator, RemoveJob, StartDownload};
use crate::core::store::{GetJob, JobStats, JobStoreActor};
use crate::core::stream::{self, StreamSettings};
use crate::utils::security::{self, EndpointClass, RateLimiter};

pub mod history;

/// HTTP 层共享状态
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Addr<JobStoreActor>,
    pub orchestrator: Addr<DownloadOrchestrator>,
    pub cleanup: Addr<CleanupActor>,
    pub limiter: Arc<RateLimiter>,
    pub accept_gate: Arc<AtomicBool>,
}

/// 错误分类到HTTP状态码的映射
impl ResponseError for DownloadError {
    fn status_code(&self) -> StatusCode {
        match self {
            DownloadError::InvalidUrl(_)
            | DownloadError::UnsupportedPlatform(_)
            | DownloadError::InvalidQuality(_)
            | DownloadError::CookiesTooLarge(_)
            | DownloadError::InvalidFilter(_) => StatusCode::BAD_REQUEST,
            DownloadError::BlockedUrl(_) | DownloadError::PathTraversal => StatusCode::FORBIDDEN,
            DownloadError::NotFound(_) | DownloadError::FileMissing => StatusCode::NOT_FOUND,
            DownloadError::NotRetryable(_)
            | DownloadError::StatusConflict { .. }
            | DownloadError::CleanupBusy => StatusCode::CONFLICT,
            DownloadError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            DownloadError::InsufficientSpace => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if self.status_code() == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("接口内部错误: {}", self);
        }
        HttpResponse::build(self.status_code()).json(json!({ "error": self.sanitized() }))
    }
}

/// 注册全部路由
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/health/status", web::get().to(health_status))
        .route("/start/video", web::post().to(start_video))
        .route("/start/audio", web::post().to(start_audio))
        .route("/progress/{job_id}", web::get().to(progress))
        .route("/download/{job_id}", web::get().to(download))
        .route("/cleanup", web::post().to(manual_cleanup))
        .route("/api/job/{job_id}", web::delete().to(delete_job))
        .service(history::scope());
}

/// 请求方IP，优先取反向代理填充的真实地址
pub(crate) fn client_ip(req: &HttpRequest) -> String {
    let info = req.connection_info();
    match info.realip_remote_addr() {
        Some(addr) => addr
            .parse::<std::net::SocketAddr>()
            .map(|s| s.ip().to_string())
            .unwrap_or_else(|_| addr.to_string()),
        None => "unknown".to_string(),
    }
}

fn parse_job_id(raw: &str) -> Result<Uuid, DownloadError> {
    raw.parse::<Uuid>()
        .map_err(|_| DownloadError::NotFound(raw.chars().take(64).collect()))
}

/// 下载请求表单
#[derive(Debug, Deserialize)]
pub struct StartForm {
    pub url: String,
    pub quality: Option<String>,
    pub cookies: Option<String>,
}

async fn start(
    state: &AppState,
    media_type: MediaType,
    form: StartForm,
    client_ip: String,
) -> Result<HttpResponse, DownloadError> {
    let job_id = state
        .orchestrator
        .send(StartDownload {
            media_type,
            url: form.url,
            quality: form.quality,
            cookies: form.cookies,
            client_ip,
        })
        .await??;
    Ok(HttpResponse::Ok().json(json!({ "job_id": job_id })))
}

async fn start_video(
    req: HttpRequest,
    state: web::Data<AppState>,
    form: web::Form<StartForm>,
) -> Result<HttpResponse, DownloadError> {
    let ip = client_ip(&req);
    // 限流独立于其它校验，先行判定
    state.limiter.check(&ip, EndpointClass::Video)?;
    start(&state, MediaType::Video, form.into_inner(), ip).await
}

async fn start_audio(
    req: HttpRequest,
    state: web::Data<AppState>,
    form: web::Form<StartForm>,
) -> Result<HttpResponse, DownloadError> {
    let ip = client_ip(&req);
    state.limiter.check(&ip, EndpointClass::Audio)?;
    start(&state, MediaType::Audio, form.into_inner(), ip).await
}

/// 进度事件流（SSE）
async fn progress(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let settings = StreamSettings::from_config(&state.config);
    let mut builder = HttpResponse::Ok();
    builder
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        // 反向代理不要缓冲事件流
        .insert_header(("X-Accel-Buffering", "no"));

    match path.into_inner().parse::<Uuid>() {
        Ok(job_id) => {
            builder.streaming(stream::progress_events(state.store.clone(), job_id, settings))
        }
        Err(_) => builder.streaming(futures::stream::once(async {
            Ok::<_, DownloadError>(bytes::Bytes::from(stream::format_error("任务不存在")))
        })),
    }
}

/// 下载产物文件
async fn download(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, DownloadError> {
    let ip = client_ip(&req);
    state.limiter.check(&ip, EndpointClass::Default)?;

    let job_id = parse_job_id(&path.into_inner())?;
    let job = state
        .store
        .send(GetJob { job_id })
        .await?
        .ok_or_else(|| DownloadError::not_found(job_id))?;
    if job.status != JobStatus::Done || job.file_name.is_empty() {
        return Err(DownloadError::FileMissing);
    }

    // 路径校验在任何文件系统读取之前
    let root = Path::new(&state.config.download_dir);
    let file_path = security::resolve_download_path(root, &job.file_name)?;

    let file = tokio::fs::File::open(&file_path).await?;
    Ok(HttpResponse::Ok()
        .content_type("application/octet-stream")
        .insert_header((
            "Content-Disposition",
            format!("attachment; filename=\"{}\"", job.file_name),
        ))
        .streaming(ReaderStream::new(file)))
}

/// 删除任务（运行中的会先被取消）
async fn delete_job(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, DownloadError> {
    let ip = client_ip(&req);
    state.limiter.check(&ip, EndpointClass::Default)?;

    let job_id = parse_job_id(&path.into_inner())?;
    state.orchestrator.send(RemoveJob { job_id }).await??;
    Ok(HttpResponse::Ok().json(json!({ "status": "deleted", "job_id": job_id })))
}

/// 手动触发一轮清理
async fn manual_cleanup(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, DownloadError> {
    let ip = client_ip(&req);
    state.limiter.check(&ip, EndpointClass::Default)?;
    log::info!("[{}] 手动触发清理", ip);

    let report = state.cleanup.send(SweepNow).await??;
    Ok(HttpResponse::Ok().json(json!({ "status": "success", "report": report })))
}

/// 存活探针，不依赖存储层
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

/// 详细健康状态，存储层不可用时降级而不是失败
async fn health_status(state: web::Data<AppState>) -> HttpResponse {
    let stats = state.store.send(JobStats).await.ok();
    let free_gb = fs2::available_space(Path::new(&state.config.download_dir))
        .map(|b| b as f64 / (1024.0 * 1024.0 * 1024.0))
        .ok();

    HttpResponse::Ok().json(json!({
        "status": if stats.is_some() { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().timestamp(),
        "version": env!("CARGO_PKG_VERSION"),
        "commit": option_env!("VERGEN_GIT_SHA"),
        "storage": {
            "free_gb": free_gb,
            "min_free_gb": state.config.min_free_space_gb,
            "accepting_jobs": state.accept_gate.load(Ordering::SeqCst),
        },
        "jobs": stats,
        "rate_limiter": { "tracked_clients": state.limiter.tracked_clients() },
    }))
}
