//! # 请求指纹
//!
//! 对影响上游输出的字段做规范化 JSON 序列化（对象键排序），再取 SHA-256。
//! 消息顺序有语义，保持原样。

use std::fmt;
use std::fmt::Write as _;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::types::ChatMessage;

/// 参与指纹计算的字段，均已补齐默认值
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FingerprintInput<'a> {
    pub messages: &'a [ChatMessage],
    pub model: &'a str,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// 64 位小写十六进制的请求指纹
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    /// 计算指纹
    #[must_use]
    pub fn compute(input: &FingerprintInput<'_>) -> Self {
        // 序列化只会因非字符串键失败，这里的结构不会出现
        let value = serde_json::to_value(input).unwrap_or(Value::Null);
        let mut canonical = String::with_capacity(256);
        write_canonical(&value, &mut canonical);

        Self(hex::encode(Sha256::digest(canonical.as_bytes())))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 紧凑、键有序的 JSON 输出，与 serde_json 是否启用 `preserve_order` 无关
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        Value::Null | Value::Bool(_) | Value::Number(_) => {
            let _ = write!(out, "{value}");
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    // serde_json 的字符串转义即为规范形式
    let _ = write!(out, "{}", Value::String(s.to_owned()));
}
