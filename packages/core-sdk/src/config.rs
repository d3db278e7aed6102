use anyhow::{anyhow, Result};

pub const DEFAULT_API_BASE: &str = "https://api.openai.com";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_LOG_DIR: &str = "logs";

/**
 * \brief 服务运行配置，来自环境变量，可被命令行参数覆盖。
 */
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /** \brief 上游 API 基地址 */
    pub api_base: String,
    /** \brief 上游 API 密钥 */
    pub api_key: String,
    /** \brief 助手使用的模型名 */
    pub model: String,
    /** \brief 是否写入本地日志 */
    pub telemetry_enabled: bool,
    /** \brief 日志目录 */
    pub log_dir: String,
}

impl RelayConfig {
    /**
     * \brief 从进程环境读取配置。OPENAI_API_KEY 缺失时报错。
     */
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("OPENAI_API_KEY")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| anyhow!("OPENAI_API_KEY is not set"))?;
        Ok(Self {
            api_base: lookup("FINASS_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            api_key,
            model: lookup("FINASS_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            telemetry_enabled: lookup("FINASS_TELEMETRY")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
            log_dir: lookup("FINASS_LOG_DIR").unwrap_or_else(|| DEFAULT_LOG_DIR.to_string()),
        })
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
