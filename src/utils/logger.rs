use actix::prelude::*;
use chrono::Local; // 用于获取本地时间
use log::LevelFilter;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

/// 日志消息
pub struct LogMsg {
    pub level: LevelFilter,
    pub message: String,
}
impl Message for LogMsg {
    type Result = ();
}

/// 解析配置中的日志级别字符串，无法识别时回退到 info
pub fn parse_level(s: &str) -> LevelFilter {
    match s.to_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// 日志Actor
///
/// 负责滚动文件日志，超过大小上限时轮转为 .1 .. .N 编号备份。
pub struct LoggerActor {
    writer: BufWriter<File>,
    level: LevelFilter,
    file_path: String,
    max_size: u64,
    backup_count: u32,
    current_size: u64,
}

impl LoggerActor {
    /// 创建新的日志Actor
    pub fn new(
        file_path: &str,
        level: LevelFilter,
        max_size: u64,
        backup_count: u32,
    ) -> Result<Self, std::io::Error> {
        // 确保日志目录存在
        if let Some(parent) = Path::new(file_path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(file_path)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        let writer = BufWriter::new(file);

        Ok(Self {
            writer,
            level,
            file_path: file_path.to_string(),
            max_size,
            backup_count,
            current_size,
        })
    }

    /// 轮转日志：file.N-1 -> file.N，当前文件 -> file.1，然后重新打开
    fn rotate(&mut self) -> Result<(), std::io::Error> {
        self.writer.flush()?;

        for i in (1..self.backup_count).rev() {
            let from = format!("{}.{}", self.file_path, i);
            let to = format!("{}.{}", self.file_path, i + 1);
            if Path::new(&from).exists() {
                std::fs::rename(&from, &to)?;
            }
        }
        if self.backup_count > 0 {
            std::fs::rename(&self.file_path, format!("{}.1", self.file_path))?;
        } else {
            std::fs::remove_file(&self.file_path)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        self.writer = BufWriter::new(file);
        self.current_size = 0;
        Ok(())
    }

    /// 写入日志并处理轮转
    fn write_log(&mut self, level: LevelFilter, message: &str) -> Result<(), std::io::Error> {
        if level <= self.level {
            let log_entry = format!(
                "{} [{}] - {}\n",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                level,
                message
            );

            if self.current_size > self.max_size {
                self.rotate()?;
            }

            self.writer.write_all(log_entry.as_bytes())?;
            self.current_size += log_entry.len() as u64;
            self.writer.flush()?;
        }
        Ok(())
    }
}

impl Actor for LoggerActor {
    type Context = Context<Self>;
}

impl Handler<LogMsg> for LoggerActor {
    type Result = ();
    fn handle(&mut self, msg: LogMsg, _ctx: &mut Self::Context) {
        if let Err(e) = self.write_log(msg.level, &msg.message) {
            eprintln!("日志写入失败: {}", e);
        }
    }
}

// 便捷的日志方法 - 为Addr<LoggerActor>提供扩展方法
pub trait LoggerExt {
    fn info(&self, message: &str);
    fn error(&self, message: &str);
    fn warn(&self, message: &str);
    fn debug(&self, message: &str);
}

impl LoggerExt for Addr<LoggerActor> {
    fn info(&self, message: &str) {
        self.do_send(LogMsg {
            level: LevelFilter::Info,
            message: message.to_string(),
        });
    }

    fn error(&self, message: &str) {
        self.do_send(LogMsg {
            level: LevelFilter::Error,
            message: message.to_string(),
        });
    }

    fn warn(&self, message: &str) {
        self.do_send(LogMsg {
            level: LevelFilter::Warn,
            message: message.to_string(),
        });
    }

    fn debug(&self, message: &str) {
        self.do_send(LogMsg {
            level: LevelFilter::Debug,
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("info"), LevelFilter::Info);
        assert_eq!(parse_level("DEBUG"), LevelFilter::Debug);
        assert_eq!(parse_level("warn"), LevelFilter::Warn);
        assert_eq!(parse_level("乱写"), LevelFilter::Info);
    }

    #[test]
    fn test_write_and_rotate() {
        let dir = std::env::temp_dir().join(format!("mediadown_log_{}", uuid::Uuid::new_v4()));
        let path = dir.join("test.log");
        let path_str = path.to_string_lossy().to_string();

        // 上限设得很小，第二次写入即触发轮转
        let mut logger = LoggerActor::new(&path_str, LevelFilter::Info, 16, 2).expect("创建日志失败");
        logger.write_log(LevelFilter::Info, "第一条日志，长度超过上限").unwrap();
        logger.write_log(LevelFilter::Info, "第二条日志").unwrap();

        assert!(Path::new(&format!("{}.1", path_str)).exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_level_filtering() {
        let dir = std::env::temp_dir().join(format!("mediadown_log_{}", uuid::Uuid::new_v4()));
        let path = dir.join("filtered.log");
        let path_str = path.to_string_lossy().to_string();

        let mut logger =
            LoggerActor::new(&path_str, LevelFilter::Warn, 1024 * 1024, 2).expect("创建日志失败");
        logger.write_log(LevelFilter::Debug, "不应写入").unwrap();
        logger.write_log(LevelFilter::Error, "应当写入").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("不应写入"));
        assert!(content.contains("应当写入"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
