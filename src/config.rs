//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__GATEWAY__COMMAND_TIMEOUT_SECS=10`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::Role;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub cache: CacheSection,
    pub memory: MemorySection,
    pub gateway: GatewaySection,
    pub recovery: RecoverySection,
    pub routing: RoutingSection,
    pub web: WebSection,
}

/// [app] 段：工作目录、并发与单任务超时
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    /// 沙箱根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
    /// 同时运行的子任务上限
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// 工作者任务超时（秒）；动作任务由网关自身的超时约束
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// 审计记录中的执行者名
    #[serde(default = "default_actor")]
    pub actor: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            workspace_root: None,
            max_concurrent_tasks: default_max_concurrent_tasks(),
            task_timeout_secs: default_task_timeout_secs(),
            actor: default_actor(),
        }
    }
}

impl AppSection {
    pub fn workspace(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("workspace"))
    }
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_task_timeout_secs() -> u64 {
    120
}

fn default_actor() -> String {
    "hive".to_string()
}

/// [llm] 段：默认模型、按角色选模型、生成参数
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_model")]
    pub default_model: String,
    /// 角色名 -> 模型 ID，如 code_edit = "coder-7b"
    #[serde(default)]
    pub agent_models: HashMap<String, String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            agent_models: HashMap::new(),
            timeout_secs: default_llm_timeout_secs(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl LlmSection {
    /// 角色对应的模型 ID，未配置时用默认模型
    pub fn model_for(&self, role: Role) -> &str {
        self.agent_models
            .get(role.as_str())
            .map(String::as_str)
            .unwrap_or(&self.default_model)
    }
}

fn default_model() -> String {
    "local-echo".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    60
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f32 {
    0.2
}

/// [cache] 段：空闲淘汰阈值与后台清扫
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    /// 模型句柄空闲多久后卸载（秒）
    #[serde(default = "default_model_idle_secs")]
    pub model_idle_secs: u64,
    /// 租户记忆句柄空闲多久后关闭（秒）
    #[serde(default = "default_memory_idle_secs")]
    pub memory_idle_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// 未命中时先清扫一次过期项
    #[serde(default)]
    pub evict_on_miss: bool,
    /// ResourceUnavailable 重试前的退避（毫秒）
    #[serde(default = "default_resource_retry_backoff_ms")]
    pub resource_retry_backoff_ms: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            model_idle_secs: default_model_idle_secs(),
            memory_idle_secs: default_memory_idle_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            evict_on_miss: false,
            resource_retry_backoff_ms: default_resource_retry_backoff_ms(),
        }
    }
}

fn default_model_idle_secs() -> u64 {
    600
}

fn default_memory_idle_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_resource_retry_backoff_ms() -> u64 {
    250
}

/// [memory] 段
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
    /// 每个租户存储保留的最大条目数
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            search_limit: default_search_limit(),
            max_entries: default_max_entries(),
        }
    }
}

fn default_search_limit() -> usize {
    5
}

fn default_max_entries() -> usize {
    1000
}

/// [gateway] 段：确认超时、执行限制、审计存储、命令策略
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    #[serde(default = "default_admin_confirmation_timeout_secs")]
    pub admin_confirmation_timeout_secs: u64,
    /// admin 级动作必须携带的确认口令
    #[serde(default = "default_admin_phrase")]
    pub admin_phrase: String,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// SQLite 审计库路径；未设置时审计仅保存在内存
    pub audit_db: Option<PathBuf>,
    #[serde(default)]
    pub policy: PolicySection,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            admin_confirmation_timeout_secs: default_admin_confirmation_timeout_secs(),
            admin_phrase: default_admin_phrase(),
            command_timeout_secs: default_command_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            max_file_bytes: default_max_file_bytes(),
            audit_db: None,
            policy: PolicySection::default(),
        }
    }
}

impl GatewaySection {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn admin_confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.admin_confirmation_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

fn default_confirmation_timeout_secs() -> u64 {
    30
}

fn default_admin_confirmation_timeout_secs() -> u64 {
    60
}

fn default_admin_phrase() -> String {
    "CONFIRM".to_string()
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}

/// [gateway.policy] 段：命令规则 `程序` 或 `程序 子命令`，最具体的规则生效；
/// 三个列表的并集即命令白名单
#[derive(Debug, Clone, Deserialize)]
pub struct PolicySection {
    #[serde(default = "default_auto_allowed")]
    pub auto_allowed: Vec<String>,
    #[serde(default = "default_restricted")]
    pub restricted: Vec<String>,
    #[serde(default = "default_admin")]
    pub admin: Vec<String>,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            auto_allowed: default_auto_allowed(),
            restricted: default_restricted(),
            admin: default_admin(),
        }
    }
}

fn default_auto_allowed() -> Vec<String> {
    [
        "ls", "cat", "head", "tail", "wc", "grep", "echo", "pwd",
        "git status", "git diff", "git log", "git show",
        "pytest", "tsc", "eslint", "prettier", "black", "flake8",
        "npm test", "npm run", "npm ls",
        "cargo build", "cargo check", "cargo test", "cargo fmt", "cargo clippy", "rustc",
        "go build", "go test", "go vet",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_restricted() -> Vec<String> {
    [
        "rm", "mv", "cp", "mkdir", "touch",
        "python", "python3", "node",
        "git", "npm", "yarn", "pip", "pip3", "poetry", "cargo", "go", "make", "mvn", "gradle",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_admin() -> Vec<String> {
    ["sudo", "chmod", "chown", "systemctl", "apt-get", "docker", "kill"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// [recovery] 段：尝试上限、熔断与全局安全限额
#[derive(Debug, Clone, Deserialize)]
pub struct RecoverySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 同时进行的恢复会话上限，超出的会话直接 exhausted
    #[serde(default = "default_max_concurrent_recoveries")]
    pub max_concurrent_recoveries: usize,
    /// 单个会话的墙钟上限
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// 滚动一小时内的恢复轮数上限（跨会话）
    #[serde(default = "default_max_attempts_per_hour")]
    pub max_attempts_per_hour: u32,
    /// 滚动一小时内交给代码修改工作者的修复次数上限
    #[serde(default = "default_max_code_edits_per_hour")]
    pub max_code_edits_per_hour: u32,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
    /// 外部分类器结果低于该置信度时视为 Unclassified
    #[serde(default = "default_classifier_min_confidence")]
    pub classifier_min_confidence: f32,
    /// 解释器别名（如 python -> python3），用于参数纠正
    #[serde(default = "default_program_aliases")]
    pub program_aliases: HashMap<String, String>,
}

impl RecoverySection {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_concurrent_recoveries: default_max_concurrent_recoveries(),
            session_timeout_secs: default_session_timeout_secs(),
            max_attempts_per_hour: default_max_attempts_per_hour(),
            max_code_edits_per_hour: default_max_code_edits_per_hour(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
            classifier_min_confidence: default_classifier_min_confidence(),
            program_aliases: default_program_aliases(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_concurrent_recoveries() -> usize {
    3
}

fn default_session_timeout_secs() -> u64 {
    300
}

fn default_max_attempts_per_hour() -> u32 {
    10
}

fn default_max_code_edits_per_hour() -> u32 {
    5
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown_secs() -> u64 {
    300
}

fn default_classifier_min_confidence() -> f32 {
    0.6
}

fn default_program_aliases() -> HashMap<String, String> {
    HashMap::from([
        ("python".to_string(), "python3".to_string()),
        ("pip".to_string(), "pip3".to_string()),
    ])
}

/// 路由步骤：角色 + 与前一步的依赖关系
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RouteStep {
    pub role: Role,
    /// 不依赖前一步
    #[serde(default)]
    pub independent: bool,
    /// 对前一步的依赖为 best-effort
    #[serde(default)]
    pub best_effort: bool,
}

impl RouteStep {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            independent: false,
            best_effort: false,
        }
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub fn independent(mut self) -> Self {
        self.independent = true;
        self
    }
}

/// [routing] 段：意图 -> 步骤表
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingSection {
    /// 分类置信度低于该值时走默认回退
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    /// 关闭后不可路由的意图直接报错
    #[serde(default = "default_fallback_enabled")]
    pub fallback_enabled: bool,
    #[serde(default = "default_fallback_steps")]
    pub fallback: Vec<RouteStep>,
    #[serde(default = "default_intents")]
    pub intents: HashMap<String, Vec<RouteStep>>,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            fallback_enabled: default_fallback_enabled(),
            fallback: default_fallback_steps(),
            intents: default_intents(),
        }
    }
}

fn default_min_confidence() -> f32 {
    0.5
}

fn default_fallback_enabled() -> bool {
    true
}

fn default_fallback_steps() -> Vec<RouteStep> {
    vec![
        RouteStep::new(Role::ContextRetrieval),
        RouteStep::new(Role::Generation).best_effort(),
    ]
}

fn default_intents() -> HashMap<String, Vec<RouteStep>> {
    HashMap::from([
        ("chat".to_string(), vec![RouteStep::new(Role::Generation)]),
        ("file_operation".to_string(), vec![RouteStep::new(Role::Generation)]),
        ("command".to_string(), vec![RouteStep::new(Role::Generation)]),
        (
            "code".to_string(),
            vec![
                RouteStep::new(Role::ContextRetrieval),
                RouteStep::new(Role::CodeEdit).best_effort(),
            ],
        ),
        (
            "research".to_string(),
            vec![
                RouteStep::new(Role::WebResearch),
                RouteStep::new(Role::Generation).best_effort(),
            ],
        ),
    ])
}

/// [web] 段：抓取 URL 的超时、最大字符数、允许的域名白名单
#[derive(Debug, Clone, Deserialize)]
pub struct WebSection {
    #[serde(default = "default_web_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_result_chars")]
    pub max_result_chars: usize,
    #[serde(default = "default_allowed_domains")]
    pub allowed_domains: Vec<String>,
    /// 调研任务无显式 URL 时使用的搜索地址，查询词作为 `q` 参数
    #[serde(default = "default_search_url")]
    pub search_url: String,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_web_timeout_secs(),
            max_result_chars: default_max_result_chars(),
            allowed_domains: default_allowed_domains(),
            search_url: default_search_url(),
        }
    }
}

fn default_web_timeout_secs() -> u64 {
    15
}

fn default_max_result_chars() -> usize {
    8000
}

fn default_allowed_domains() -> Vec<String> {
    [
        "html.duckduckgo.com",
        "en.wikipedia.org",
        "github.com",
        "raw.githubusercontent.com",
        "stackoverflow.com",
        "docs.rs",
        "crates.io",
        "doc.rust-lang.org",
        "docs.python.org",
        "pypi.org",
        "www.npmjs.com",
        "nodejs.org",
        "developer.mozilla.org",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_search_url() -> String {
    "https://html.duckduckgo.com/html/".to_string()
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path.filter(|p| p.exists()) {
        builder = builder.add_source(config::File::from(path).required(false));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.cache.model_idle_secs, 600);
        assert_eq!(cfg.cache.memory_idle_secs, 3600);
        assert_eq!(cfg.gateway.confirmation_timeout_secs, 30);
        assert_eq!(cfg.gateway.admin_phrase, "CONFIRM");
        assert_eq!(cfg.recovery.max_attempts, 3);
        assert_eq!(cfg.recovery.breaker_threshold, 5);
        assert_eq!(cfg.routing.fallback.len(), 2);
        assert!(cfg.routing.intents.contains_key("file_operation"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.toml");
        std::fs::write(
            &path,
            r#"
[app]
max_concurrent_tasks = 2

[gateway]
admin_phrase = "YES-I-MEAN-IT"

[llm.agent_models]
code_edit = "coder"

[[routing.intents.summarize]]
role = "context_retrieval"

[[routing.intents.summarize]]
role = "generation"
best_effort = true
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.app.max_concurrent_tasks, 2);
        assert_eq!(cfg.gateway.admin_phrase, "YES-I-MEAN-IT");
        assert_eq!(cfg.llm.model_for(Role::CodeEdit), "coder");
        assert_eq!(cfg.llm.model_for(Role::Generation), "local-echo");
        let steps = &cfg.routing.intents["summarize"];
        assert_eq!(steps[1], RouteStep::new(Role::Generation).best_effort());
    }
}
