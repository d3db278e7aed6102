use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::config::RelayConfig;
use crate::error::UpstreamError;
use crate::models::{AssistantConfig, Attachment, RunEvent};
use crate::telemetry;

const ASSISTANTS_BETA: &str = "assistants=v2";
const RUN_CHANNEL_CAPACITY: usize = 64;

/** \brief 一次运行的事件通道；丢弃接收端即取消订阅。 */
pub type RunEvents = mpsc::Receiver<RunEvent>;

/**
 * \brief 上游助手服务的最小能力集合。
 */
#[async_trait]
pub trait AssistantApi: Send + Sync {
    /** \brief 创建助手，返回其 ID。 */
    async fn create_assistant(&self, config: &AssistantConfig) -> Result<String, UpstreamError>;

    /** \brief 创建空线程，返回其 ID。 */
    async fn create_thread(&self) -> Result<String, UpstreamError>;

    /** \brief 确认线程存在；不存在时返回 NotFound。 */
    async fn get_thread(&self, thread_id: &str) -> Result<(), UpstreamError>;

    /** \brief 以用户身份向线程追加消息及附件。 */
    async fn append_message(
        &self,
        thread_id: &str,
        content: &str,
        attachments: &[Attachment],
    ) -> Result<(), UpstreamError>;

    /** \brief 在线程上启动流式运行。 */
    async fn start_run(&self, thread_id: &str, assistant_id: &str)
        -> Result<RunEvents, UpstreamError>;
}

/**
 * \brief 基于 OpenAI Assistants v2 REST 接口的实现。
 */
#[derive(Debug, Clone)]
pub struct OpenAiAssistants {
    api_base: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiAssistants {
    /**
     * \param api_base API 基地址，如 "https://api.openai.com"
     * \param api_key  API 密钥
     */
    pub fn new(api_base: &str, api_key: &str) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
        })
    }

    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        Self::new(&config.api_base, &config.api_key)
    }

    /**
     * \brief 构建请求；每个路径段单独编码，线程 ID 不会改变路由。
     */
    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))?,
        );
        headers.insert("openai-beta", HeaderValue::from_static(ASSISTANTS_BETA));
        let mut url = Url::parse(&self.api_base)?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("invalid api base: {}", self.api_base))?
            .pop_if_empty()
            .extend(segments);
        Ok(self.client.request(method, url).headers(headers))
    }

    async fn send(&self, req: RequestBuilder) -> Result<reqwest::Response, UpstreamError> {
        let resp = req.send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(UpstreamError::NotFound);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("request failed: {} -> {}", status, text).into());
        }
        Ok(resp)
    }

    async fn send_json(&self, req: RequestBuilder) -> Result<Value, UpstreamError> {
        let resp = self.send(req).await?;
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl AssistantApi for OpenAiAssistants {
    async fn create_assistant(&self, config: &AssistantConfig) -> Result<String, UpstreamError> {
        let req = self.request(Method::POST, &["v1", "assistants"])?.json(config);
        let v = self.send_json(req).await?;
        Ok(extract_id(&v)?)
    }

    async fn create_thread(&self) -> Result<String, UpstreamError> {
        let req = self.request(Method::POST, &["v1", "threads"])?.json(&json!({}));
        let v = self.send_json(req).await?;
        Ok(extract_id(&v)?)
    }

    async fn get_thread(&self, thread_id: &str) -> Result<(), UpstreamError> {
        let req = self.request(Method::GET, &["v1", "threads", thread_id])?;
        self.send_json(req).await?;
        Ok(())
    }

    async fn append_message(
        &self,
        thread_id: &str,
        content: &str,
        attachments: &[Attachment],
    ) -> Result<(), UpstreamError> {
        let body = json!({
            "role": "user",
            "content": content,
            "attachments": attachments,
        });
        let req = self
            .request(Method::POST, &["v1", "threads", thread_id, "messages"])?
            .json(&body);
        self.send_json(req).await?;
        Ok(())
    }

    async fn start_run(
        &self,
        thread_id: &str,
        assistant_id: &str,
    ) -> Result<RunEvents, UpstreamError> {
        let body = json!({
            "assistant_id": assistant_id,
            "stream": true,
        });
        let req = self
            .request(Method::POST, &["v1", "threads", thread_id, "runs"])?
            .json(&body);
        let resp = self.send(req).await?;

        let (tx, rx) = mpsc::channel(RUN_CHANNEL_CAPACITY);
        tokio::spawn(pump_run_events(resp.bytes_stream(), tx));
        Ok(rx)
    }
}

/**
 * \brief 解析上游 SSE 字节流并写入事件通道。
 *
 * 接收端关闭、收到终止事件或传输出错时退出，并随之释放上游响应。
 */
async fn pump_run_events<S>(stream: S, tx: mpsc::Sender<RunEvent>)
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let mut stream = Box::pin(stream);
    let mut buf = Vec::<u8>::new();

    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                telemetry::log_event("upstream", "run receiver dropped, releasing stream");
                return;
            }
            next = stream.next() => next,
        };
        let chunk = match next {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                telemetry::log_error("upstream", &format!("run stream error: {}", e));
                let _ = tx.send(RunEvent::Error(e.to_string())).await;
                return;
            }
            None => break,
        };
        buf.extend_from_slice(&chunk);
        while let Some((pos, len)) = find_block_end(&buf) {
            let block = buf.drain(..pos + len).collect::<Vec<u8>>();
            if !forward(&tx, parse_block(&block)).await {
                return;
            }
        }
    }

    if !buf.is_empty() {
        forward(&tx, parse_block(&buf)).await;
    }
}

/** \brief 转发事件；返回 false 表示应停止读取。 */
async fn forward(tx: &mpsc::Sender<RunEvent>, events: Vec<RunEvent>) -> bool {
    for event in events {
        let terminal = !matches!(event, RunEvent::TextDelta(_));
        if tx.send(event).await.is_err() || terminal {
            return false;
        }
    }
    true
}

/** \brief 查找事件块结尾，兼容 LF 与 CRLF 分隔；返回 (位置, 分隔符长度)。 */
fn find_block_end(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if b.0 < a.0 { b } else { a }),
        (a, b) => a.or(b),
    }
}

fn parse_block(block: &[u8]) -> Vec<RunEvent> {
    let text = String::from_utf8_lossy(block);
    let mut event_name: Option<String> = None;
    let mut data_lines = Vec::new();
    for line in text.lines() {
        let line = line.trim_start();
        if let Some(rest) = line.strip_prefix("event:") {
            event_name = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim().to_string());
        }
    }
    let data = data_lines.join("\n");

    match event_name.as_deref() {
        Some("thread.message.delta") => parse_message_delta(&data)
            .into_iter()
            .map(RunEvent::TextDelta)
            .collect(),
        Some("thread.run.completed") | Some("done") => vec![RunEvent::End],
        Some("thread.run.failed")
        | Some("thread.run.cancelled")
        | Some("thread.run.expired")
        | Some("thread.run.incomplete") => vec![RunEvent::Error(parse_run_failure(&data))],
        Some("error") => vec![RunEvent::Error(parse_error_detail(&data))],
        _ => Vec::new(),
    }
}

fn parse_message_delta(data: &str) -> Vec<String> {
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };
    v.get("delta")
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|p| p.get("text")?.get("value")?.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_run_failure(data: &str) -> String {
    let v: Value = serde_json::from_str(data).unwrap_or(Value::Null);
    if let Some(err) = v.get("last_error").filter(|e| !e.is_null()) {
        let code = err.get("code").and_then(|c| c.as_str()).unwrap_or("error");
        let message = err.get("message").and_then(|m| m.as_str()).unwrap_or("");
        return format!("{}: {}", code, message);
    }
    let status = v.get("status").and_then(|s| s.as_str()).unwrap_or("failed");
    format!("run {}", status)
}

fn parse_error_detail(data: &str) -> String {
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) if !data.is_empty() => return data.to_string(),
        Err(_) => return "unknown upstream error".to_string(),
    };
    v.get("error")
        .and_then(|e| e.get("message"))
        .or_else(|| v.get("message"))
        .and_then(|m| m.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| v.to_string())
}

fn extract_id(v: &Value) -> Result<String> {
    v.get("id")
        .and_then(|id| id.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("unexpected payload without id: {}", v))
}
