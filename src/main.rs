use actix::Actor;
use actix_web::{web, App, HttpServer};
use anyhow::Context as _;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use mediadown::api::{self, AppState};
use mediadown::cli;
use mediadown::config::Config;
use mediadown::core::adapter::{MediaAdapter, YtDlpAdapter};
use mediadown::core::cleanup::CleanupActor;
use mediadown::core::orchestrator::DownloadOrchestrator;
use mediadown::core::store::JobStoreActor;
use mediadown::utils::logger::{parse_level, LoggerActor, LoggerExt};
use mediadown::utils::security::RateLimiter;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // 解析参数和配置
    let (args, config) = match cli::Args::parse_args() {
        Ok((args, config)) => (args, config),
        Err(e) => {
            eprintln!("参数解析失败: {}", e);
            std::process::exit(1);
        }
    };

    // 控制台日志走 log 宏，文件日志走 LoggerActor
    let level = parse_level(&config.log_level);
    env_logger::Builder::new().filter_level(level).init();

    let log_path = Path::new(&config.log_dir).join("mediadown.log");
    let logger = LoggerActor::new(
        &log_path.to_string_lossy(),
        level,
        config.log_max_size_mb * 1024 * 1024,
        config.log_backup_count,
    )
    .context("无法初始化文件日志")?
    .start();

    logger.info("服务启动");
    logger.info(&format!("配置文件: {}", args.config));
    logger.info(&config.get_summary());
    println!("配置加载成功");
    println!("{}", config.get_summary());

    // 下载目录必须存在
    std::fs::create_dir_all(&config.download_dir)
        .with_context(|| format!("无法创建下载目录: {}", config.download_dir))?;

    // 组装各组件：存储、接收闸门、下载引擎、编排器、清理调度
    let store = JobStoreActor::new(&config).start();
    let accept_gate = Arc::new(AtomicBool::new(true));
    let adapter: Arc<dyn MediaAdapter> = Arc::new(YtDlpAdapter::new(config.clone()));
    let orchestrator = DownloadOrchestrator::new(
        config.clone(),
        store.clone(),
        adapter,
        accept_gate.clone(),
    )
    .start();
    let cleanup = CleanupActor::new(config.clone(), store.clone(), accept_gate.clone()).start();
    let limiter = Arc::new(RateLimiter::from_config(&config));
    logger.info("任务存储与编排器已启动");

    let state = AppState {
        config: config.clone(),
        store,
        orchestrator,
        cleanup,
        limiter,
        accept_gate,
    };

    let bind_addr = (config.host.clone(), config.port);
    println!("服务运行在 http://{}:{}", config.host, config.port);
    logger.info(&format!("监听 {}:{}", config.host, config.port));

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(api::configure)
    })
    .bind(bind_addr)
    .with_context(|| format!("无法监听 {}:{}", config.host, config.port))?
    .run()
    .await?;

    logger.info("服务已停止");
    Ok(())
}
