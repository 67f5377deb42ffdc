//! CLI: 命令行接口和参数解析模块
//!
//! ## 主要功能
//!
//! - 命令行参数解析和验证
//! - 配置文件路径管理
//! - 配置合并：命令行 > 环境变量 > 配置文件 > 默认值
//! - 配置文件编辑器集成
//!
//! ## 支持的命令
//!
//! - 启动服务：`mediadown`
//! - 编辑配置：`mediadown -e`
//! - 指定配置：`mediadown -c config.conf`
//! - 指定端口：`mediadown -p 8080`
//! - 指定下载目录：`mediadown -d /srv/downloads`

use clap::Parser;
use std::env;

use crate::config::Config;
use crate::core::error::DownloadError;

/// 获取平台默认配置文件路径
pub fn default_config_path() -> String {
    #[cfg(target_os = "windows")]
    {
        let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        format!("{}/mediadown/mediadown.conf", appdata)
    }
    #[cfg(target_os = "macos")]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/Library/Application Support/mediadown/mediadown.conf", home)
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/.config/mediadown/mediadown.conf", home)
    }
}

/// 打开配置文件编辑器
pub fn open_config_in_editor(config_path: &str) {
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("notepad").arg(config_path).status().ok();
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg("-e").arg(config_path).status().ok();
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        // 优先 xdg-open，否则 nano
        if std::process::Command::new("xdg-open").arg(config_path).status().is_err() {
            let _ = std::process::Command::new("nano").arg(config_path).status();
        }
    }
}

/// MediaDown 命令行参数
///
/// 示例用法：
///   mediadown
///   mediadown -e  # 编辑配置文件
///   mediadown -c /path/to/config.conf -p 8080
///
/// 更多用法请加 --help 查看
#[derive(Parser, Debug, Clone)]
#[command(
    name = "mediadown",
    author = "panzhifu",
    version = env!("CARGO_PKG_VERSION"),
    about = "一个用 Rust 编写的媒体下载服务后端",
    long_about = "接收媒体URL并在后台异步下载，提供实时进度流、历史查询与自动清理的HTTP服务。\n\n示例：\n  mediadown\n  mediadown -e\n  mediadown -c /path/to/config.conf\n  mediadown -p 8080 -d /srv/downloads\n"
)]
pub struct Args {
    /// 配置文件路径，默认为平台推荐路径
    #[arg(short = 'c', long, default_value_t = default_config_path(), help = "配置文件路径，默认为平台推荐路径。")]
    pub config: String,

    /// 编辑配置文件（-e 或 --edit）
    #[arg(short = 'e', long = "edit", help = "用系统默认编辑器打开配置文件并退出。")]
    pub edit_config: bool,

    /// 监听地址
    #[arg(long, help = "监听地址，覆盖配置文件中的设置。")]
    pub host: Option<String>,

    /// 监听端口
    #[arg(short = 'p', long, help = "监听端口，覆盖配置文件中的设置。")]
    pub port: Option<u16>,

    /// 指定下载目录
    #[arg(short = 'd', long, help = "指定下载目录，覆盖配置文件中的设置。")]
    pub download_dir: Option<String>,

    /// 日志级别
    #[arg(short = 'L', long, help = "日志级别：error/warn/info/debug/trace。")]
    pub log_level: Option<String>,
}

impl Args {
    pub fn parse_args() -> Result<(Self, Config), DownloadError> {
        let args = Args::parse();

        // --edit 逻辑
        if args.edit_config {
            open_config_in_editor(&args.config);
            std::process::exit(0);
        }

        // 加载或创建配置文件，再按优先级合并
        let mut config = Config::load(&args.config)?;
        config.merge_from_env();
        config.merge_from_args(&args);
        config.validate()?;

        Ok((args, config))
    }
}
