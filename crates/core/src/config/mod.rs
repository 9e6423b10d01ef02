//! 应用配置：TOML文件 + ORCHESTRATOR__ 前缀环境变量覆盖
//!
//! 每个配置段都有可运行的默认值，load之后统一validate，
//! 越界取值在启动期直接失败而不是运行期出错。

use serde::{Deserialize, Serialize};

use crate::errors::{OrchestratorError, OrchestratorResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub http_dispatch: HttpDispatchConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://orchestrator.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// 所有主题的公共前缀，以斜杠结尾
    pub topic_prefix: String,
    pub keep_alive_seconds: u64,
    /// 指令应答的有界等待窗口（毫秒）
    pub reply_timeout_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: "orchestrator".to_string(),
            username: None,
            password: None,
            topic_prefix: "vision/".to_string(),
            keep_alive_seconds: 60,
            reply_timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpDispatchConfig {
    /// 直连节点的请求超时（秒）
    pub request_timeout_seconds: u64,
    /// 经代理转发时的请求超时（秒）
    pub proxy_timeout_seconds: u64,
    pub use_proxy: bool,
}

impl Default for HttpDispatchConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: 30,
            proxy_timeout_seconds: 120,
            use_proxy: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub enabled: bool,
    /// 并发分发上限（计数信号量大小）
    pub max_concurrent_dispatches: usize,
    /// 调度循环空转间隔（毫秒）
    pub tick_interval_ms: u64,
    pub max_retries: i32,
    /// 指数退避基数（秒），序列为 base·2^n
    pub base_retry_delay_seconds: u64,
    /// 心跳静默判定离线的阈值（秒）
    pub heartbeat_timeout_seconds: i64,
    /// 健康检查扫描间隔（秒）
    pub health_check_interval_seconds: u64,
    /// 心跳静默进入SUSPECT的阈值（秒）
    pub suspect_threshold_seconds: i64,
    /// 离线节点清理阈值（秒）
    pub offline_cleanup_threshold_seconds: i64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_dispatches: 3,
            tick_interval_ms: 1000,
            max_retries: 3,
            base_retry_delay_seconds: 5,
            heartbeat_timeout_seconds: 120,
            health_check_interval_seconds: 30,
            suspect_threshold_seconds: 60,
            offline_cleanup_threshold_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

impl AppConfig {
    /// 加载配置：文件可缺省（全默认值），环境变量最高优先级
    pub fn load(path: Option<&str>) -> OrchestratorResult<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path).required(false));
        }
        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("ORCHESTRATOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| OrchestratorError::Configuration(format!("加载配置失败: {e}")))?;

        let app_config: AppConfig = settings
            .try_deserialize()
            .map_err(|e| OrchestratorError::Configuration(format!("解析配置失败: {e}")))?;

        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.database.url.is_empty() {
            return Err(OrchestratorError::Configuration(
                "database.url 不能为空".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(OrchestratorError::Configuration(
                "database.max_connections 必须大于0".to_string(),
            ));
        }
        if !(1..=10).contains(&self.dispatcher.max_concurrent_dispatches) {
            return Err(OrchestratorError::Configuration(format!(
                "dispatcher.max_concurrent_dispatches 必须在1-10之间: {}",
                self.dispatcher.max_concurrent_dispatches
            )));
        }
        if self.dispatcher.tick_interval_ms == 0 {
            return Err(OrchestratorError::Configuration(
                "dispatcher.tick_interval_ms 必须大于0".to_string(),
            ));
        }
        if self.dispatcher.max_retries < 0 {
            return Err(OrchestratorError::Configuration(
                "dispatcher.max_retries 不能为负数".to_string(),
            ));
        }
        if self.dispatcher.suspect_threshold_seconds >= self.dispatcher.heartbeat_timeout_seconds {
            return Err(OrchestratorError::Configuration(
                "dispatcher.suspect_threshold_seconds 必须小于 heartbeat_timeout_seconds"
                    .to_string(),
            ));
        }
        if self.mqtt.topic_prefix.is_empty() || !self.mqtt.topic_prefix.ends_with('/') {
            return Err(OrchestratorError::Configuration(format!(
                "mqtt.topic_prefix 必须以斜杠结尾: {}",
                self.mqtt.topic_prefix
            )));
        }
        if self.mqtt.reply_timeout_ms == 0 {
            return Err(OrchestratorError::Configuration(
                "mqtt.reply_timeout_ms 必须大于0".to_string(),
            ));
        }
        if self.http_dispatch.request_timeout_seconds == 0 {
            return Err(OrchestratorError::Configuration(
                "http_dispatch.request_timeout_seconds 必须大于0".to_string(),
            ));
        }
        if self.api.enabled && self.api.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(OrchestratorError::Configuration(format!(
                "api.bind_address 不是合法的监听地址: {}",
                self.api.bind_address
            )));
        }
        Ok(())
    }
}
