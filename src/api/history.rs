//! 下载历史查询与重试接口

use actix_web::{web, HttpRequest, HttpResponse, Scope};
use serde::Deserialize;
use serde_json::json;

use crate::core::error::DownloadError;
use crate::core::job::{JobStatus, Platform};
use crate::core::orchestrator::RetryJob;
use crate::core::store::{GetJob, JobStats, ListJobs};
use crate::utils::security::EndpointClass;

use super::{client_ip, parse_job_id, AppState};

pub fn scope() -> Scope {
    web::scope("/api/history")
        .route("/stats/overview", web::get().to(stats_overview))
        .route("/status/{status}", web::get().to(by_status))
        .route("/platform/{platform}", web::get().to(by_platform))
        .route("/{job_id}/retry", web::post().to(retry_job))
        .route("/{job_id}/retry-info", web::get().to(retry_info))
        .route("/{job_id}", web::get().to(job_details))
        .route("", web::get().to(get_history))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

fn clamp_limit(state: &AppState, limit: Option<usize>) -> usize {
    limit.unwrap_or(50).clamp(1, state.config.history_limit)
}

/// GET /api/history?limit=N — 最近任务，倒序
async fn get_history(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, DownloadError> {
    state.limiter.check(&client_ip(&req), EndpointClass::Default)?;
    let limit = clamp_limit(&state, query.limit);
    let jobs = state
        .store
        .send(ListJobs {
            limit,
            ..Default::default()
        })
        .await?;
    Ok(HttpResponse::Ok().json(json!({
        "items": jobs,
        "total": jobs.len(),
        "limit": limit,
    })))
}

/// GET /api/history/{job_id} — 单个任务详情
async fn job_details(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, DownloadError> {
    state.limiter.check(&client_ip(&req), EndpointClass::Default)?;
    let job_id = parse_job_id(&path.into_inner())?;
    let job = state
        .store
        .send(GetJob { job_id })
        .await?
        .ok_or_else(|| DownloadError::not_found(job_id))?;
    Ok(HttpResponse::Ok().json(job))
}

/// GET /api/history/status/{status} — 按状态筛选
async fn by_status(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, DownloadError> {
    state.limiter.check(&client_ip(&req), EndpointClass::Default)?;
    let raw = path.into_inner();
    let status: JobStatus = raw
        .parse()
        .map_err(|_| DownloadError::InvalidFilter(raw.chars().take(32).collect()))?;
    let limit = clamp_limit(&state, query.limit);
    let jobs = state
        .store
        .send(ListJobs {
            status: Some(status),
            limit,
            ..Default::default()
        })
        .await?;
    Ok(HttpResponse::Ok().json(json!({
        "status": status,
        "items": jobs,
        "total": jobs.len(),
    })))
}

/// GET /api/history/platform/{platform} — 按平台筛选
async fn by_platform(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, DownloadError> {
    state.limiter.check(&client_ip(&req), EndpointClass::Default)?;
    let raw = path.into_inner();
    let platform: Platform = raw
        .parse()
        .map_err(|_| DownloadError::InvalidFilter(raw.chars().take(32).collect()))?;
    let limit = clamp_limit(&state, query.limit);
    let jobs = state
        .store
        .send(ListJobs {
            platform: Some(platform),
            limit,
            ..Default::default()
        })
        .await?;
    Ok(HttpResponse::Ok().json(json!({
        "platform": platform,
        "items": jobs,
        "total": jobs.len(),
    })))
}

/// GET /api/history/stats/overview — 任务统计
async fn stats_overview(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, DownloadError> {
    state.limiter.check(&client_ip(&req), EndpointClass::Default)?;
    let stats = state.store.send(JobStats).await?;
    Ok(HttpResponse::Ok().json(stats))
}

/// POST /api/history/{job_id}/retry — 重试失败任务
async fn retry_job(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, DownloadError> {
    state.limiter.check(&client_ip(&req), EndpointClass::Default)?;
    let job_id = parse_job_id(&path.into_inner())?;
    let job = state.orchestrator.send(RetryJob { job_id }).await??;
    Ok(HttpResponse::Ok().json(json!({
        "job_id": job.job_id,
        "retry_of": job.retry_of,
        "status": job.status,
    })))
}

/// GET /api/history/{job_id}/retry-info — 重试余量信息
async fn retry_info(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, DownloadError> {
    state.limiter.check(&client_ip(&req), EndpointClass::Default)?;
    let job_id = parse_job_id(&path.into_inner())?;
    let job = state
        .store
        .send(GetJob { job_id })
        .await?
        .ok_or_else(|| DownloadError::not_found(job_id))?;

    let max_retries = state.config.max_retries;
    let can_retry = job.status == JobStatus::Error && job.retry_count < max_retries;
    Ok(HttpResponse::Ok().json(json!({
        "job_id": job.job_id,
        "retry_count": job.retry_count,
        "max_retries": max_retries,
        "retries_remaining": max_retries.saturating_sub(job.retry_count),
        "can_retry": can_retry,
        "retry_of": job.retry_of,
    })))
}
