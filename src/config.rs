//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TRIAGE__*` 覆盖（双下划线表示嵌套，如 `TRIAGE__EXECUTOR__WORKERS=8`）。
//! 配置在进程启动时构建一次，各组件构造时按引用取自己的段，不存在全局可变配置。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub executor: ExecutorSection,
    pub tools: ToolsSection,
    pub cache: CacheSection,
    pub update_log: UpdateLogSection,
    pub store: StoreSection,
    pub gateway: GatewaySection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [executor] 段：工作者数量、租约时长、控制循环步数上限
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// 任务租约（秒）；工作者崩溃后最迟在该时长后任务可被重新领取
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

fn default_workers() -> usize {
    4
}

fn default_lease_secs() -> u64 {
    300
}

fn default_max_iterations() -> usize {
    20
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            lease_secs: default_lease_secs(),
            max_iterations: default_max_iterations(),
        }
    }
}

/// [tools] 段：单次调用超时、超时重试、Shell 白名单
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// 超时后的总尝试次数（含首次）
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub shell: ShellSection,
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            shell: ShellSection::default(),
        }
    }
}

/// [tools.shell] 段：允许执行的命令名（仅首词，如 df、uptime、free）
#[derive(Debug, Clone, Deserialize)]
pub struct ShellSection {
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
}

fn default_allowed_commands() -> Vec<String> {
    vec![
        "df".into(),
        "free".into(),
        "uptime".into(),
        "ps".into(),
        "top".into(),
        "systemctl".into(),
        "journalctl".into(),
        "ss".into(),
    ]
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: default_allowed_commands(),
        }
    }
}

/// [cache] 段：全局默认 TTL 与按操作名覆盖
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// 按顺序匹配，首个命中生效
    #[serde(default)]
    pub overrides: Vec<TtlOverride>,
}

fn default_cache_enabled() -> bool {
    true
}

fn default_ttl_secs() -> u64 {
    60
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            default_ttl_secs: default_ttl_secs(),
            overrides: Vec::new(),
        }
    }
}

/// [[cache.overrides]]：pattern 以子串方式匹配未带作用域的操作名
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TtlOverride {
    pub pattern: String,
    pub ttl_secs: u64,
}

/// [update_log] 段：保留窗口与单线程条数上限
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateLogSection {
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries_per_thread: usize,
}

fn default_retention_secs() -> u64 {
    24 * 3600
}

fn default_max_entries() -> usize {
    10_000
}

impl Default for UpdateLogSection {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            max_entries_per_thread: default_max_entries(),
        }
    }
}

/// [store] 段：未设置 db_path 时使用内存存储
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    pub db_path: Option<PathBuf>,
    /// 终态任务保留时长（小时）
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

fn default_retention_hours() -> u64 {
    168
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            db_path: None,
            retention_hours: default_retention_hours(),
        }
    }
}

/// [gateway] 段：监听地址、心跳、连接上限
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// 单连接待发送消息缓冲
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

fn default_bind_addr() -> String {
    "127.0.0.1:9000".to_string()
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_max_connections() -> usize {
    1000
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_maintenance_interval() -> u64 {
    60
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            max_connections: default_max_connections(),
            outbound_buffer: default_outbound_buffer(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 TRIAGE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TRIAGE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TRIAGE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
