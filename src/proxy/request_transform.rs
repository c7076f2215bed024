//! # 出站请求改写
//!
//! 用配置中的默认值补齐调用方省略的字段，调用方没有 system 消息时在最前面插入
//! 系统提示词，并强制关闭流式输出。

use super::fingerprint::FingerprintInput;
use super::types::{ChatMessage, CompletionRequest, UpstreamRequest};
use crate::config::UpstreamDefaults;

const SYSTEM_ROLE: &str = "system";

#[derive(Debug, Clone)]
pub struct RequestTransformer {
    defaults: UpstreamDefaults,
}

impl RequestTransformer {
    #[must_use]
    pub const fn new(defaults: UpstreamDefaults) -> Self {
        Self { defaults }
    }

    #[must_use]
    pub const fn defaults(&self) -> &UpstreamDefaults {
        &self.defaults
    }

    /// 指纹输入：调用方原始消息 + 补齐默认值的模型、温度和 token 上限
    #[must_use]
    pub fn fingerprint_input<'a>(
        &'a self,
        request: &'a CompletionRequest,
        messages: &'a [ChatMessage],
    ) -> FingerprintInput<'a> {
        FingerprintInput {
            messages,
            model: request.model.as_deref().unwrap_or(&self.defaults.model),
            temperature: request.temperature.unwrap_or(self.defaults.temperature),
            max_tokens: request.max_tokens.unwrap_or(self.defaults.max_tokens),
        }
    }

    /// 构造出站请求
    #[must_use]
    pub fn augment(&self, request: &CompletionRequest, messages: &[ChatMessage]) -> UpstreamRequest {
        let d = &self.defaults;

        let mut outbound_messages = Vec::with_capacity(messages.len() + 1);
        let has_system = messages.iter().any(|m| m.role == SYSTEM_ROLE);
        if !has_system && !d.system_prompt.is_empty() {
            outbound_messages.push(ChatMessage::new(SYSTEM_ROLE, d.system_prompt.clone()));
        }
        outbound_messages.extend_from_slice(messages);

        UpstreamRequest {
            model: request.model.clone().unwrap_or_else(|| d.model.clone()),
            messages: outbound_messages,
            max_tokens: request.max_tokens.unwrap_or(d.max_tokens),
            temperature: request.temperature.unwrap_or(d.temperature),
            top_p: request.top_p.unwrap_or(d.top_p),
            return_citations: request.return_citations.unwrap_or(d.return_citations),
            search_domain_filter: request
                .search_domain_filter
                .clone()
                .unwrap_or_else(|| d.search_domain_filter.clone()),
            return_images: request.return_images.unwrap_or(d.return_images),
            return_related_questions: request
                .return_related_questions
                .unwrap_or(d.return_related_questions),
            search_recency_filter: request
                .search_recency_filter
                .clone()
                .unwrap_or_else(|| d.search_recency_filter.clone()),
            top_k: request.top_k.unwrap_or(d.top_k),
            stream: false,
            presence_penalty: request.presence_penalty.unwrap_or(d.presence_penalty),
            frequency_penalty: request.frequency_penalty.unwrap_or(d.frequency_penalty),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_SYSTEM_PROMPT;
    use crate::proxy::fingerprint::RequestFingerprint;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn transformer() -> RequestTransformer {
        RequestTransformer::new(UpstreamDefaults::default())
    }

    fn request(body: serde_json::Value) -> CompletionRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn fills_defaults_and_prepends_system_prompt() {
        let req = request(json!({
            "messages": [{"role": "user", "content": "What is a normal heart rate?"}]
        }));
        let messages = req.messages.clone().unwrap();
        let out = transformer().augment(&req, &messages);

        assert_eq!(
            serde_json::to_value(&out).unwrap(),
            json!({
                "model": "llama-3.1-sonar-large-128k-online",
                "messages": [
                    {"role": "system", "content": DEFAULT_SYSTEM_PROMPT},
                    {"role": "user", "content": "What is a normal heart rate?"}
                ],
                "max_tokens": 4096,
                "temperature": 0.2,
                "top_p": 0.9,
                "return_citations": true,
                "search_domain_filter": ["pubmed.ncbi.nlm.nih.gov", "mayoclinic.org", "webmd.com"],
                "return_images": false,
                "return_related_questions": true,
                "search_recency_filter": "month",
                "top_k": 0,
                "stream": false,
                "presence_penalty": 0.0,
                "frequency_penalty": 1.0
            })
        );
    }

    #[test]
    fn keeps_caller_values_and_system_message() {
        let req = request(json!({
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "system", "content": "be terse"}
            ],
            "model": "sonar-small",
            "max_tokens": 64,
            "temperature": 0.0,
            "search_domain_filter": [],
            "top_k": 5,
            "stream": true
        }));
        let messages = req.messages.clone().unwrap();
        let out = transformer().augment(&req, &messages);

        assert_eq!(out.messages, messages);
        assert_eq!(out.model, "sonar-small");
        assert_eq!(out.max_tokens, 64);
        assert!(out.temperature.abs() < f64::EPSILON);
        assert!(out.search_domain_filter.is_empty());
        assert_eq!(out.top_k, 5);
        assert!(!out.stream);
    }

    #[test]
    fn explicit_defaults_fingerprint_like_omitted_fields() {
        let t = transformer();
        let omitted = request(json!({"messages": [{"role": "user", "content": "hi"}]}));
        let explicit = request(json!({
            "temperature": 0.2,
            "max_tokens": 4096,
            "model": "llama-3.1-sonar-large-128k-online",
            "top_p": 0.5,
            "messages": [{"content": "hi", "role": "user"}]
        }));
        let m1 = omitted.messages.clone().unwrap();
        let m2 = explicit.messages.clone().unwrap();

        assert_eq!(
            RequestFingerprint::compute(&t.fingerprint_input(&omitted, &m1)),
            RequestFingerprint::compute(&t.fingerprint_input(&explicit, &m2))
        );
    }
}
