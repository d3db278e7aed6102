use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::UpstreamError;
use crate::models::{AssistantConfig, Attachment, RunEvent};
use crate::upstream::{AssistantApi, RunEvents};

/** \brief 各上游操作的调用次数。 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Calls {
    pub create_assistant: usize,
    pub create_thread: usize,
    pub get_thread: usize,
    pub append_message: usize,
    pub start_run: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendedMessage {
    pub thread_id: String,
    pub content: String,
    pub attachments: Vec<Attachment>,
}

#[derive(Default)]
struct State {
    calls: Calls,
    configs: Vec<AssistantConfig>,
    appended: Vec<AppendedMessage>,
    threads: HashSet<String>,
    create_failures: usize,
}

/**
 * \brief 测试用上游：记录调用并按脚本回放运行事件。
 */
pub struct MockAssistantApi {
    state: Mutex<State>,
    script: Vec<RunEvent>,
    hold_open: bool,
    thread_lookup_down: bool,
    create_delay: Option<Duration>,
    released: Arc<AtomicBool>,
}

impl Default for MockAssistantApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAssistantApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            script: vec![RunEvent::End],
            hold_open: false,
            thread_lookup_down: false,
            create_delay: None,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /** \brief 运行时依次发出的事件。 */
    pub fn with_script(mut self, events: Vec<RunEvent>) -> Self {
        self.script = events;
        self
    }

    /** \brief 脚本发送完后保持通道打开，直到接收端被丢弃。 */
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn with_thread(self, thread_id: &str) -> Self {
        self.state.lock().unwrap().threads.insert(thread_id.to_string());
        self
    }

    pub fn fail_create_assistant(self, times: usize) -> Self {
        self.state.lock().unwrap().create_failures = times;
        self
    }

    pub fn thread_lookup_down(mut self) -> Self {
        self.thread_lookup_down = true;
        self
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Calls {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn appended(&self) -> Vec<AppendedMessage> {
        self.state.lock().unwrap().appended.clone()
    }

    pub fn created_configs(&self) -> Vec<AssistantConfig> {
        self.state.lock().unwrap().configs.clone()
    }

    /** \brief 运行订阅是否已被释放（仅 hold_open 模式下有意义）。 */
    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssistantApi for MockAssistantApi {
    async fn create_assistant(&self, config: &AssistantConfig) -> Result<String, UpstreamError> {
        let n = {
            let mut state = self.state.lock().unwrap();
            state.calls.create_assistant += 1;
            state.configs.push(config.clone());
            if state.create_failures > 0 {
                state.create_failures -= 1;
                return Err(anyhow!("connection refused").into());
            }
            state.calls.create_assistant
        };
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(format!("asst_{}", n))
    }

    async fn create_thread(&self) -> Result<String, UpstreamError> {
        let mut state = self.state.lock().unwrap();
        state.calls.create_thread += 1;
        let id = format!("thread_{}", state.calls.create_thread);
        state.threads.insert(id.clone());
        Ok(id)
    }

    async fn get_thread(&self, thread_id: &str) -> Result<(), UpstreamError> {
        let mut state = self.state.lock().unwrap();
        state.calls.get_thread += 1;
        if self.thread_lookup_down {
            return Err(anyhow!("upstream timed out").into());
        }
        if state.threads.contains(thread_id) {
            Ok(())
        } else {
            Err(UpstreamError::NotFound)
        }
    }

    async fn append_message(
        &self,
        thread_id: &str,
        content: &str,
        attachments: &[Attachment],
    ) -> Result<(), UpstreamError> {
        let mut state = self.state.lock().unwrap();
        state.calls.append_message += 1;
        state.appended.push(AppendedMessage {
            thread_id: thread_id.to_string(),
            content: content.to_string(),
            attachments: attachments.to_vec(),
        });
        Ok(())
    }

    async fn start_run(
        &self,
        _thread_id: &str,
        _assistant_id: &str,
    ) -> Result<RunEvents, UpstreamError> {
        self.state.lock().unwrap().calls.start_run += 1;
        let (tx, rx) = mpsc::channel(16);
        let script = self.script.clone();
        let hold_open = self.hold_open;
        let released = self.released.clone();
        tokio::spawn(async move {
            for event in script {
                if tx.send(event).await.is_err() {
                    released.store(true, Ordering::SeqCst);
                    return;
                }
            }
            if hold_open {
                tx.closed().await;
                released.store(true, Ordering::SeqCst);
            }
        });
        Ok(rx)
    }
}
