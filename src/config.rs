//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `WAMON__*` 覆盖（双下划线表示嵌套，如 `WAMON__RECONNECT__BASE_MS=500`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::flags::StaleRequests;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log: LogSection,
    pub storage: StorageSection,
    pub session: SessionSection,
    pub reconnect: ReconnectSection,
    pub flags: FlagsSection,
    pub http: HttpSection,
}

/// [log] 段：RUST_LOG 未设置时使用的级别
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// [storage] 段：SQLite 文件与连接池
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub database_path: PathBuf,
    pub max_connections: u32,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/wa-monitor.db"),
            max_connections: 5,
        }
    }
}

/// [session] 段：二维码有效期、登出超时（秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub qr_ttl_secs: u64,
    pub logout_timeout_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            qr_ttl_secs: 60,
            logout_timeout_secs: 5,
        }
    }
}

/// [reconnect] 段：指数退避参数（毫秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub base_ms: u64,
    pub max_ms: u64,
    pub max_attempts: u32,
    /// 抖动上限（不含）
    pub jitter_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            max_ms: 30_000,
            max_attempts: 5,
            jitter_ms: 500,
        }
    }
}

/// [flags] 段：轮询间隔与重启遗留请求的处理方式
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlagsSection {
    pub poll_ms: u64,
    pub stale_requests: StaleRequests,
}

impl Default for FlagsSection {
    fn default() -> Self {
        Self {
            poll_ms: 2000,
            stale_requests: StaleRequests::Replay,
        }
    }
}

/// [http] 段：健康检查监听地址（需启用 http feature）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub bind: String,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3001".to_string(),
        }
    }
}

impl AppConfig {
    /// 启动前校验；返回第一条不合法的说明
    pub fn validate(&self) -> Result<(), String> {
        if self.flags.poll_ms == 0 {
            return Err("flags.poll_ms must be greater than 0".into());
        }
        if self.reconnect.base_ms == 0 {
            return Err("reconnect.base_ms must be greater than 0".into());
        }
        if self.reconnect.max_ms < self.reconnect.base_ms {
            return Err(format!(
                "reconnect.max_ms ({}) must not be below reconnect.base_ms ({})",
                self.reconnect.max_ms, self.reconnect.base_ms
            ));
        }
        if self.session.qr_ttl_secs == 0 {
            return Err("session.qr_ttl_secs must be greater than 0".into());
        }
        if self.storage.max_connections == 0 {
            return Err("storage.max_connections must be greater than 0".into());
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 WAMON__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 WAMON__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path.filter(|p| p.exists()) {
        builder = builder.add_source(config::File::from(path).required(false));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("WAMON")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
