use tokio::sync::OnceCell;

use crate::error::RelayError;
use crate::models::AssistantConfig;
use crate::telemetry;
use crate::upstream::AssistantApi;

/**
 * \brief 助手注册表：进程内懒创建并缓存唯一的助手 ID。
 *
 * 并发的首次调用共享同一次创建；创建失败不写缓存，下次调用重试。
 */
#[derive(Debug)]
pub struct AssistantRegistry {
    config: AssistantConfig,
    assistant_id: OnceCell<String>,
}

impl AssistantRegistry {
    pub fn new(config: AssistantConfig) -> Self {
        Self {
            config,
            assistant_id: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &AssistantConfig {
        &self.config
    }

    /** \brief 当前缓存的助手 ID，不触发上游调用。 */
    pub fn cached(&self) -> Option<&str> {
        self.assistant_id.get().map(|s| s.as_str())
    }

    /**
     * \brief 返回助手 ID，缓存为空时向上游创建。
     * \param api 上游服务
     */
    pub async fn resolve(&self, api: &dyn AssistantApi) -> Result<String, RelayError> {
        let id = self
            .assistant_id
            .get_or_try_init(|| async {
                match api.create_assistant(&self.config).await {
                    Ok(id) => {
                        telemetry::log_event(
                            "registry",
                            &format!("created assistant id={} model={}", id, self.config.model),
                        );
                        Ok(id)
                    }
                    Err(e) => {
                        telemetry::log_error(
                            "registry",
                            &format!("create assistant failed: {}", e),
                        );
                        Err(RelayError::from(e))
                    }
                }
            })
            .await?;
        Ok(id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAssistantApi;
    use std::sync::Arc;
    use std::time::Duration;

    fn registry() -> AssistantRegistry {
        AssistantRegistry::new(AssistantConfig::financial("gpt-4o-mini"))
    }

    #[tokio::test]
    async fn test_resolve_caches_after_first_call() {
        let api = MockAssistantApi::new();
        let reg = registry();
        assert!(reg.cached().is_none());

        let first = reg.resolve(&api).await.unwrap();
        let second = reg.resolve(&api).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(reg.cached(), Some(first.as_str()));
        assert_eq!(api.calls().create_assistant, 1);
    }

    #[tokio::test]
    async fn test_resolve_failure_is_not_cached() {
        let api = MockAssistantApi::new().fail_create_assistant(1);
        let reg = registry();

        let err = reg.resolve(&api).await.unwrap_err();
        assert!(matches!(err, RelayError::UpstreamUnavailable(_)));
        assert!(reg.cached().is_none());

        let id = reg.resolve(&api).await.unwrap();
        assert_eq!(reg.cached(), Some(id.as_str()));
        assert_eq!(api.calls().create_assistant, 2);
    }

    #[tokio::test]
    async fn test_concurrent_cold_resolve_creates_once() {
        let api = Arc::new(MockAssistantApi::new().with_create_delay(Duration::from_millis(50)));
        let reg = Arc::new(registry());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let api = api.clone();
            let reg = reg.clone();
            handles.push(tokio::spawn(async move { reg.resolve(api.as_ref()).await }));
        }

        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap().unwrap());
        }
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(api.calls().create_assistant, 1);
    }

    #[tokio::test]
    async fn test_resolve_passes_fixed_config() {
        let api = MockAssistantApi::new();
        registry().resolve(&api).await.unwrap();
        let created = api.created_configs();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].name, "FinAss");
        assert_eq!(created[0].model, "gpt-4o-mini");
    }
}
