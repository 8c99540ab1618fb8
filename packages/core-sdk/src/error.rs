use thiserror::Error;

/**
 * \brief SDK 统一错误类型，覆盖 Provider 调用与 GitHub 提交两条链路。
 */
#[derive(Debug, Error)]
pub enum CoreError {
    /** \brief 所选 Provider 或 GitHub 所需凭据缺失，发生在任何网络调用之前。 */
    #[error("missing credential: {0}")]
    MissingCredential(String),

    /** \brief 上游返回非成功状态码，保留状态与原始信息。 */
    #[error("upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    /** \brief Provider 返回内容无法按预期结构解码。 */
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /** \brief 提交请求未通过本地字段校验。 */
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /** \brief GitHub 拒绝写入（包括 sha 过期导致的冲突）。 */
    #[error("commit failed: {0}")]
    CommitFailed(String),

    /** \brief 尚未拿到状态码的传输层错误，不含请求 URL。 */
    #[error("http error: {0}")]
    Http(reqwest::Error),
}

impl From<reqwest::Error> for CoreError {
    /**
     * \brief URL 可能携带凭据，转换时一律去掉。
     */
    fn from(err: reqwest::Error) -> Self {
        CoreError::Http(err.without_url())
    }
}

impl CoreError {
    /**
     * \brief 稳定的错误类别标签，用于日志与 JSON 响应。
     */
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::MissingCredential(_) => "missing_credential",
            CoreError::Upstream { .. } => "upstream_error",
            CoreError::MalformedResponse(_) => "malformed_response",
            CoreError::InvalidRequest(_) => "invalid_request",
            CoreError::CommitFailed(_) => "commit_failed",
            CoreError::Http(_) => "http",
        }
    }
}
