use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::error::{RelayError, UpstreamError};
use crate::models::{ChatTurn, RunEvent};
use crate::registry::AssistantRegistry;
use crate::telemetry;
use crate::upstream::{AssistantApi, RunEvents};

/** \brief 流式输出中途失败时追加的提示。 */
pub const STREAM_ERROR_NOTICE: &str = "\nError occurred during streaming";

/** \brief 发往客户端的字节流。 */
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, Infallible>> + Send>>;

/**
 * \brief 一次聊天的结果：线程 ID 与实时输出流。
 */
pub struct RelayResponse {
    pub thread_id: String,
    /** \brief 本次是否新建了线程 */
    pub created_thread: bool,
    pub body: ByteStream,
}

/**
 * \brief 会话中继：解析线程、追加消息、启动运行并转发增量文本。
 */
#[derive(Clone)]
pub struct ConversationRelay {
    api: Arc<dyn AssistantApi>,
    registry: Arc<AssistantRegistry>,
}

impl ConversationRelay {
    pub fn new(api: Arc<dyn AssistantApi>, registry: Arc<AssistantRegistry>) -> Self {
        Self { api, registry }
    }

    pub fn registry(&self) -> &AssistantRegistry {
        &self.registry
    }

    /**
     * \brief 处理一次聊天请求。
     *
     * 返回前的失败以结构化错误返回；开始流式输出后的失败写入输出流末尾。
     */
    pub async fn handle(&self, turn: ChatTurn) -> Result<RelayResponse, RelayError> {
        let last = turn.validate()?;
        let assistant_id = self.registry.resolve(self.api.as_ref()).await?;
        let (thread_id, created_thread) = self.resolve_thread(turn.thread_id.as_deref()).await?;

        let attachments = turn.attachments();
        self.api
            .append_message(&thread_id, &last.content, &attachments)
            .await?;
        let events = self.api.start_run(&thread_id, &assistant_id).await?;

        telemetry::log_event(
            "relay",
            &format!(
                "turn started thread={} created={} attachments={} assistant={}",
                thread_id,
                created_thread,
                attachments.len(),
                assistant_id
            ),
        );

        Ok(RelayResponse {
            body: relay_stream(thread_id.clone(), events),
            thread_id,
            created_thread,
        })
    }

    async fn resolve_thread(&self, thread_id: Option<&str>) -> Result<(String, bool), RelayError> {
        match thread_id.filter(|id| !id.is_empty()) {
            Some(id) => match self.api.get_thread(id).await {
                Ok(()) => Ok((id.to_string(), false)),
                Err(UpstreamError::NotFound) => {
                    telemetry::log_error("relay", &format!("thread not found id={}", id));
                    Err(RelayError::ThreadNotFound(id.to_string()))
                }
                Err(e) => Err(e.into()),
            },
            None => {
                let id = self.api.create_thread().await?;
                Ok((id, true))
            }
        }
    }
}

/** \brief 流被提前丢弃（客户端断开）时记录日志。 */
struct DisconnectGuard {
    thread_id: String,
    finished: bool,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.finished {
            telemetry::log_event(
                "relay",
                &format!("client disconnected thread={}", self.thread_id),
            );
        }
    }
}

fn relay_stream(thread_id: String, mut events: RunEvents) -> ByteStream {
    let s = stream! {
        let mut guard = DisconnectGuard { thread_id, finished: false };
        let mut deltas = 0usize;
        let mut bytes = 0usize;
        loop {
            match events.recv().await {
                Some(RunEvent::TextDelta(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    deltas += 1;
                    bytes += text.len();
                    yield Ok::<Bytes, Infallible>(Bytes::from(text));
                }
                Some(RunEvent::End) => {
                    telemetry::log_event(
                        "relay",
                        &format!(
                            "turn complete thread={} deltas={} bytes={}",
                            guard.thread_id, deltas, bytes
                        ),
                    );
                    break;
                }
                Some(RunEvent::Error(detail)) => {
                    let fault = RelayError::StreamFault(detail);
                    telemetry::log_error(
                        "relay",
                        &format!("thread={} deltas={} {}", guard.thread_id, deltas, fault),
                    );
                    yield Ok(Bytes::from_static(STREAM_ERROR_NOTICE.as_bytes()));
                    break;
                }
                None => {
                    let fault = RelayError::StreamFault("run ended without completion".to_string());
                    telemetry::log_error(
                        "relay",
                        &format!("thread={} deltas={} {}", guard.thread_id, deltas, fault),
                    );
                    yield Ok(Bytes::from_static(STREAM_ERROR_NOTICE.as_bytes()));
                    break;
                }
            }
        }
        guard.finished = true;
    };
    Box::pin(s)
}

/**
 * \brief 读完整个输出流并拼接为字符串。
 */
pub async fn collect_text(mut body: ByteStream) -> String {
    let mut out = Vec::new();
    while let Some(Ok(chunk)) = body.next().await {
        out.extend_from_slice(&chunk);
    }
    String::from_utf8_lossy(&out).into_owned()
}
