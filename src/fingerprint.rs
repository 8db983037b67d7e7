//! Request fingerprints for the response cache and single-flight keys.
//!
//! A fingerprint is a 128-bit hash over a canonical serialization of the
//! capability and every backend-visible parameter. Text is normalized
//! (trailing whitespace trimmed, Unicode NFC) and floats are quantized so
//! semantically equivalent requests collide.

use unicode_normalization::UnicodeNormalization;
use xxhash_rust::xxh3::xxh3_128;

use crate::types::{AiRequest, Capability};

/// Quantization step for float parameters. Two temperatures closer than
/// this are the same request as far as caching is concerned.
const FLOAT_PRECISION: f64 = 1000.0;

/// Compute the fingerprint for one request.
pub fn compute(capability: Capability, request: &AiRequest) -> u128 {
    let mut canon = String::new();
    canon.push_str(capability.as_str());
    canon.push('\0');

    match request {
        AiRequest::Completion(r) => {
            push_text(&mut canon, &r.prompt);
            push_opt_text(&mut canon, r.model.as_deref());
            push_opt_u32(&mut canon, r.max_tokens);
            push_opt_float(&mut canon, r.temperature);
        }
        AiRequest::Chat(r) => {
            for m in &r.messages {
                push_text(&mut canon, &m.role);
                push_text(&mut canon, &m.content);
            }
            push_opt_text(&mut canon, r.model.as_deref());
            push_opt_u32(&mut canon, r.max_tokens);
            push_opt_float(&mut canon, r.temperature);
        }
        AiRequest::Vision(r) => {
            push_opt_text(&mut canon, r.image_url.as_deref());
            push_opt_text(&mut canon, r.image_base64.as_deref());
            push_text(&mut canon, &r.task);
            push_json(&mut canon, r.options.as_ref());
        }
        AiRequest::Nlp(r) => {
            push_text(&mut canon, &r.text);
            push_text(&mut canon, &r.task);
        }
        AiRequest::Data(r) => {
            push_text(&mut canon, &r.operation);
            push_json(&mut canon, Some(&r.data));
            push_json(&mut canon, r.options.as_ref());
        }
    }

    xxh3_128(canon.as_bytes())
}

/// Hex form used in job snapshots and logs.
pub fn to_hex(fp: u128) -> String {
    format!("{fp:032x}")
}

fn push_text(canon: &mut String, text: &str) {
    canon.extend(text.trim_end().nfc());
    canon.push('\0');
}

fn push_opt_text(canon: &mut String, text: Option<&str>) {
    if let Some(t) = text {
        push_text(canon, t);
    } else {
        canon.push('\0');
    }
}

fn push_opt_u32(canon: &mut String, value: Option<u32>) {
    if let Some(v) = value {
        canon.push_str(&v.to_string());
    }
    canon.push('\0');
}

fn push_opt_float(canon: &mut String, value: Option<f32>) {
    if let Some(v) = value {
        let quantized = (f64::from(v) * FLOAT_PRECISION).round() / FLOAT_PRECISION;
        canon.push_str(&format!("{quantized:.3}"));
    }
    canon.push('\0');
}

fn push_json(canon: &mut String, value: Option<&serde_json::Value>) {
    if let Some(v) = value {
        // serde_json keeps map ordering stable for a given value, which is
        // enough: the same decoded request always canonicalizes the same way.
        canon.push_str(&v.to_string());
    }
    canon.push('\0');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn completion(body: serde_json::Value) -> AiRequest {
        AiRequest::decode(Capability::LlmCompletion, body).unwrap()
    }

    #[test]
    fn test_identical_requests_collide() {
        let a = completion(json!({"prompt": "hello", "temperature": 0.7}));
        let b = completion(json!({"prompt": "hello", "temperature": 0.7}));
        assert_eq!(
            compute(Capability::LlmCompletion, &a),
            compute(Capability::LlmCompletion, &b)
        );
    }

    #[test]
    fn test_trailing_whitespace_is_normalized() {
        let a = completion(json!({"prompt": "hello"}));
        let b = completion(json!({"prompt": "hello   \n"}));
        assert_eq!(
            compute(Capability::LlmCompletion, &a),
            compute(Capability::LlmCompletion, &b)
        );
    }

    #[test]
    fn test_float_quantization() {
        let a = completion(json!({"prompt": "hi", "temperature": 0.7}));
        let b = completion(json!({"prompt": "hi", "temperature": 0.7000001}));
        let c = completion(json!({"prompt": "hi", "temperature": 0.8}));
        assert_eq!(
            compute(Capability::LlmCompletion, &a),
            compute(Capability::LlmCompletion, &b)
        );
        assert_ne!(
            compute(Capability::LlmCompletion, &a),
            compute(Capability::LlmCompletion, &c)
        );
    }

    #[test]
    fn test_capability_separates_keys() {
        let nlp = AiRequest::decode(
            Capability::NlpAnalyze,
            json!({"text": "hello", "task": "sentiment"}),
        )
        .unwrap();
        let data = AiRequest::decode(
            Capability::DataProcess,
            json!({"operation": "hello", "data": "sentiment"}),
        )
        .unwrap();
        assert_ne!(
            compute(Capability::NlpAnalyze, &nlp),
            compute(Capability::DataProcess, &data)
        );
    }

    #[test]
    fn test_nfc_normalization() {
        // "é" precomposed vs combining sequence.
        let a = completion(json!({"prompt": "caf\u{00e9}"}));
        let b = completion(json!({"prompt": "cafe\u{0301}"}));
        assert_eq!(
            compute(Capability::LlmCompletion, &a),
            compute(Capability::LlmCompletion, &b)
        );
    }

    #[test]
    fn test_hex_width() {
        assert_eq!(to_hex(0).len(), 32);
        assert_eq!(to_hex(u128::MAX).len(), 32);
    }
}
