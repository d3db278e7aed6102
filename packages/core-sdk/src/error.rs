use thiserror::Error;

/**
 * \brief 对调用方可见的聊天请求错误分类。
 */
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("malformed turn: {0}")]
    MalformedTurn(String),

    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("stream fault: {0}")]
    StreamFault(String),
}

/**
 * \brief 上游适配层错误，区分“资源不存在”与其他失败。
 */
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("resource not found")]
    NotFound,

    #[error(transparent)]
    Unavailable(#[from] anyhow::Error),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        UpstreamError::Unavailable(err.into())
    }
}

impl From<UpstreamError> for RelayError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::NotFound => {
                RelayError::UpstreamUnavailable("upstream resource not found".to_string())
            }
            UpstreamError::Unavailable(e) => RelayError::UpstreamUnavailable(format!("{:#}", e)),
        }
    }
}
