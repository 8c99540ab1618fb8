pub mod config;
pub mod db;
pub mod error;
pub mod github;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod parser;
pub mod server;
pub mod telemetry;

/**
 * \brief 单元测试共用的进程内 HTTP 替身：Provider 模拟与 GitHub 内容接口。
 */
#[cfg(test)]
mod test_support;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config::{Config, RepoOverrides};
    pub use crate::error::CoreError;
    pub use crate::github::CommitGateway;
    pub use crate::llm::ProviderClient;
    pub use crate::models::{
        AIResponse, ChangeProposal, CommitRequest, CommitResult, ConversationTurn, ModelConfig,
        RepoCoordinates,
    };
    pub use crate::orchestrator::Orchestrator;
}
