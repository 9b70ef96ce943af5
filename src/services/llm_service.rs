//! LLM 服务 - 业务能力层
//!
//! 只负责"LLM 评分"能力，不关心流程
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 支持自定义 API 端点和模型
//! - 兼容 OpenAI API 的服务（如 Gemini、Azure 等）
//! - 多个 API key 通过 `KeyPool` 轮流独占使用

use std::time::Duration;

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::ScoringError;
use crate::infrastructure::KeyPool;
use crate::services::prompts::build_scoring_messages;
use crate::services::scorer::{OracleScore, ScoringOracle, ScoringRequest};

/// LLM 服务
///
/// 职责：
/// - 调用 LLM API 对单个提交给出部分分数
/// - 把 API 错误区分为可重试 / 不可重试
/// - 不关心重试、不关心进度日志
pub struct LlmService {
    clients: Vec<Client<OpenAIConfig>>,
    keys: KeyPool,
    model_name: String,
    timeout: Duration,
}

impl LlmService {
    /// 创建新的 LLM 服务，没有配置任何 key 时返回 `None`
    pub fn new(config: &Config) -> Option<Self> {
        if config.llm_api_keys.is_empty() {
            return None;
        }

        let clients: Vec<Client<OpenAIConfig>> = config
            .llm_api_keys
            .iter()
            .map(|key| {
                let openai_config = OpenAIConfig::new()
                    .with_api_key(key)
                    .with_api_base(&config.llm_api_base_url);
                Client::with_config(openai_config)
            })
            .collect();

        Some(Self {
            keys: KeyPool::new(clients.len()),
            clients,
            model_name: config.llm_model_name.clone(),
            timeout: config.llm_timeout(),
        })
    }

    /// 通用的 LLM 调用函数
    ///
    /// 独占一个 API key 完成一次调用，返回去掉首尾空白的回复内容。
    pub async fn send_to_llm(
        &self,
        user_message: &str,
        system_message: Option<&str>,
    ) -> Result<String, ScoringError> {
        let lease = self
            .keys
            .acquire()
            .await
            .ok_or_else(|| ScoringError::Permanent("没有可用的 API key".to_string()))?;
        let client = self
            .clients
            .get(lease.index())
            .ok_or_else(|| ScoringError::Permanent("API key 序号越界".to_string()))?;

        debug!(
            "调用 LLM API，模型: {}，key #{}，消息长度: {} 字符",
            self.model_name,
            lease.index(),
            user_message.len()
        );

        let mut messages = Vec::new();
        if let Some(sys_msg) = system_message {
            let system_msg = ChatCompletionRequestSystemMessageArgs::default()
                .content(sys_msg)
                .build()
                .map_err(|e| ScoringError::Permanent(format!("构建系统消息失败: {}", e)))?;
            messages.push(ChatCompletionRequestMessage::System(system_msg));
        }
        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(user_message)
            .build()
            .map_err(|e| ScoringError::Permanent(format!("构建用户消息失败: {}", e)))?;
        messages.push(ChatCompletionRequestMessage::User(user_msg));

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(messages)
            .temperature(0.2)
            .build()
            .map_err(|e| ScoringError::Permanent(format!("构建请求失败: {}", e)))?;

        let response = tokio::time::timeout(self.timeout, client.chat().create(request))
            .await
            .map_err(|_| {
                ScoringError::Transient(format!("LLM 调用超时（{} 秒）", self.timeout.as_secs()))
            })?
            .map_err(|e| {
                warn!("LLM API 调用失败: {}", e);
                classify_api_error(&e.to_string())
            })?;

        debug!("LLM API 调用成功");

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| ScoringError::Transient("LLM 返回内容为空".to_string()))?;

        Ok(content.trim().to_string())
    }
}

#[async_trait]
impl ScoringOracle for LlmService {
    async fn evaluate(&self, request: &ScoringRequest<'_>) -> Result<OracleScore, ScoringError> {
        let (system, user) = build_scoring_messages(request);
        let response = self.send_to_llm(&user, Some(&system)).await?;
        parse_score_response(&response)
    }
}

/// 未配置 API key 时使用：所有混合结果都记为评分失败，等配置后重跑
pub struct UnconfiguredOracle;

#[async_trait]
impl ScoringOracle for UnconfiguredOracle {
    async fn evaluate(&self, _request: &ScoringRequest<'_>) -> Result<OracleScore, ScoringError> {
        Err(ScoringError::Permanent("未配置 LLM_API_KEYS".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct ScoreReply {
    score: i64,
    #[serde(default)]
    reason: String,
}

/// 解析 `{"score": N, "reason": "..."}`，容忍 markdown 代码块和前后多余文字
pub fn parse_score_response(response: &str) -> Result<OracleScore, ScoringError> {
    let body = response.trim();
    let json = match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => &body[start..=end],
        _ => {
            return Err(ScoringError::Transient(format!(
                "无法解析 LLM 响应: '{}'",
                truncate(body)
            )))
        }
    };

    let reply: ScoreReply = serde_json::from_str(json).map_err(|e| {
        ScoringError::Transient(format!("无法解析 LLM 响应 ({}): '{}'", e, truncate(body)))
    })?;

    Ok(OracleScore {
        score: reply.score,
        rationale: reply.reason,
    })
}

/// 按错误信息区分可重试与不可重试
pub fn classify_api_error(message: &str) -> ScoringError {
    let lower = message.to_lowercase();
    let permanent = ["401", "403", "invalid api key", "invalid_api_key", "permission", "unauthorized"];
    if permanent.iter().any(|p| lower.contains(p)) {
        ScoringError::Permanent(message.to_string())
    } else {
        ScoringError::Transient(message.to_string())
    }
}

fn truncate(text: &str) -> String {
    crate::utils::logging::truncate_text(text, 120)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let score = parse_score_response(r#"{"score": 18, "reason": "输出格式错误，扣 6 分"}"#).unwrap();
        assert_eq!(score.score, 18);
        assert_eq!(score.rationale, "输出格式错误，扣 6 分");
    }

    #[test]
    fn test_parse_fenced_json() {
        let response = "好的，评分如下：\n```json\n{\"score\": 3, \"reason\": \"typo\"}\n```";
        let score = parse_score_response(response).unwrap();
        assert_eq!(score.score, 3);
    }

    #[test]
    fn test_parse_failures_are_transient() {
        assert!(parse_score_response("我给 12 分").unwrap_err().is_transient());
        assert!(parse_score_response(r#"{"score": "很多"}"#).unwrap_err().is_transient());
    }

    #[test]
    fn test_classify_api_error() {
        assert!(classify_api_error("429 Too Many Requests: rate limit").is_transient());
        assert!(classify_api_error("error sending request: connection reset").is_transient());
        assert!(!classify_api_error("401 Unauthorized").is_transient());
        assert!(!classify_api_error("Invalid API key provided").is_transient());
    }

    #[test]
    fn test_no_keys_means_no_service() {
        let config = Config::default();
        assert!(LlmService::new(&config).is_none());

        let config = Config {
            llm_api_keys: vec!["k1".into(), "k2".into()],
            ..Config::default()
        };
        let service = LlmService::new(&config).unwrap();
        assert_eq!(service.keys.size(), 2);
        assert_eq!(service.clients.len(), 2);
    }

    #[tokio::test]
    async fn test_unconfigured_oracle_is_permanent() {
        let unit = crate::models::UnitId::new("A1", "1");
        let request = ScoringRequest {
            unit: &unit,
            source_code: "",
            problem_description: None,
            outcomes: &[],
            max_score: 31,
        };
        let err = UnconfiguredOracle.evaluate(&request).await.unwrap_err();
        assert!(!err.is_transient());
    }

    /// 测试 LLM API 连接性（需要 LLM_API_KEYS）
    ///
    /// 运行方式：
    /// ```bash
    /// cargo test test_llm_api_connectivity -- --ignored --nocapture
    /// ```
    #[tokio::test]
    #[ignore]
    async fn test_llm_api_connectivity() {
        let _ = tracing_subscriber::fmt::try_init();
        let config = Config::from_env().unwrap();
        let service = LlmService::new(&config).expect("需要设置 LLM_API_KEYS");

        let response = service
            .send_to_llm("只回复 {\"score\": 1, \"reason\": \"ok\"}", None)
            .await
            .unwrap();
        println!("LLM 响应: {}", response);
        assert!(parse_score_response(&response).is_ok());
    }
}
