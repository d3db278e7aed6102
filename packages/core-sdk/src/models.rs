use axum::http::HeaderValue;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/** \brief 助手固定名称。 */
pub const ASSISTANT_NAME: &str = "FinAss";

/** \brief 助手行为指令。 */
pub const ASSISTANT_INSTRUCTIONS: &str = "You are a fun and comical financial assistant. You are polite and cheerful and you help the user to navigate through their daily life's financial needs. Analyze what the user says, as well as their financial documents if they upload any and give them helpful suggestions to help them understand and improve their situations. If the user is asking something unrelated to finance, you should politely tell them that you are not able to help with that.";

/**
 * \brief 消息角色，仅区分用户与助手。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/**
 * \brief 客户端提交的单条历史消息。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /** \brief 客户端生成的消息 ID */
    pub id: String,
    /** \brief 角色：user/assistant */
    pub role: Role,
    /** \brief 内容 */
    #[serde(default)]
    pub content: String,
}

/**
 * \brief 一次聊天请求：历史消息、可选线程 ID 与附件文件 ID。
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub file_ids: Vec<String>,
}

impl ChatTurn {
    /**
     * \brief 校验请求并返回待提交的最后一条消息。
     * \return 消息序列为空、最后一条消息无内容且未附带文件，
     *         或线程 ID 无法作为响应头回传时返回 MalformedTurn
     */
    pub fn validate(&self) -> Result<&ChatMessage, RelayError> {
        let last = self
            .messages
            .last()
            .ok_or_else(|| RelayError::MalformedTurn("messages must not be empty".to_string()))?;
        if let Some(id) = self.thread_id.as_deref().filter(|id| !id.is_empty()) {
            if HeaderValue::from_str(id).is_err() {
                return Err(RelayError::MalformedTurn(format!(
                    "thread id is not a valid header value: {:?}",
                    id
                )));
            }
        }
        if last.content.trim().is_empty() && self.file_ids.is_empty() {
            return Err(RelayError::MalformedTurn(
                "last message has no content and no files are attached".to_string(),
            ));
        }
        Ok(last)
    }

    /** \brief 将附件 ID 转换为带检索能力标记的附件列表，保持原顺序。 */
    pub fn attachments(&self) -> Vec<Attachment> {
        self.file_ids
            .iter()
            .map(|id| Attachment::retrieval(id.clone()))
            .collect()
    }
}

/**
 * \brief 上传协作方返回的文件描述。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedFile {
    pub file_id: String,
    pub file_name: String,
}

/**
 * \brief 助手能力；检索能力在上游协议中名为 file_search。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Capability {
    #[serde(rename = "file_search")]
    Retrieval,
}

/**
 * \brief 消息附件：文件引用及可使用它的能力。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_id: String,
    pub tools: Vec<Capability>,
}

impl Attachment {
    pub fn retrieval(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            tools: vec![Capability::Retrieval],
        }
    }
}

/**
 * \brief 助手配置，进程内只创建一次。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssistantConfig {
    pub name: String,
    pub instructions: String,
    pub model: String,
    #[serde(rename = "tools")]
    pub capabilities: Vec<Capability>,
}

impl AssistantConfig {
    /**
     * \brief 金融助手的固定配置。
     * \param model 上游模型名
     */
    pub fn financial(model: &str) -> Self {
        Self {
            name: ASSISTANT_NAME.to_string(),
            instructions: ASSISTANT_INSTRUCTIONS.to_string(),
            model: model.to_string(),
            capabilities: vec![Capability::Retrieval],
        }
    }
}

/**
 * \brief 上游运行产生的事件。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    TextDelta(String),
    End,
    Error(String),
}
