//! KIE market client.
//!
//! KIE runs every model as an asynchronous task: `createTask` returns a
//! task id and `recordInfo` reports its state. Results arrive as a JSON
//! document embedded in a string field. When a callback URL is configured
//! KIE also pushes the final record there; [`parse_callback`] reads it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stargen_core::{GenerationStatus, OutputRef, ProviderKind};

use crate::client::{build_http, ClientOptions, ProviderClient};
use crate::error::{ProviderError, Result};
use crate::types::{DispatchOutcome, GenerateRequest, PollResult};

/// Default API host.
pub const DEFAULT_BASE_URL: &str = "https://api.kie.ai";

const SUCCESS_CODE: i64 = 200;
const NOT_FOUND_CODE: i64 = 404;

/// KIE API client.
#[derive(Debug, Clone)]
pub struct KieClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    callback_url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskBody<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    call_back_url: Option<&'a str>,
    input: TaskInput<'a>,
}

#[derive(Debug, Serialize)]
struct TaskInput<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_input: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    aspect_ratio: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resolution: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quality: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_format: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sound: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn message(&self) -> String {
        self.msg
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| format!("API error: {}", self.code))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedTask {
    task_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskRecord {
    state: String,
    #[serde(default)]
    result_json: Option<String>,
    #[serde(default)]
    fail_code: Option<String>,
    #[serde(default)]
    fail_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackData {
    #[serde(rename = "taskId", alias = "task_id")]
    task_id: String,
    #[serde(flatten)]
    record: TaskRecord,
}

/// A task update pushed to the callback URL.
#[derive(Debug, Clone)]
pub struct KieCallback {
    /// Task the update is about.
    pub task_id: String,
    /// Normalized task state.
    pub result: PollResult,
}

/// Parse a callback body.
///
/// The body has the same envelope and record shape as `recordInfo`. A
/// non-200 envelope without a terminal state counts as a failure.
///
/// # Errors
///
/// Returns `ProviderError::Serialization` for malformed bodies and
/// `ProviderError::Rejected` when the body carries no task record.
pub fn parse_callback(body: &[u8]) -> Result<KieCallback> {
    let envelope: Envelope<CallbackData> = serde_json::from_slice(body)?;
    let message = envelope.message();
    let data = envelope
        .data
        .ok_or_else(|| ProviderError::Rejected("callback carries no task record".into()))?;

    let mut result = normalize(data.record);
    if envelope.code != SUCCESS_CODE && !result.is_terminal() {
        result = PollResult::failed(message);
    }
    Ok(KieCallback {
        task_id: data.task_id,
        result,
    })
}

impl KieClient {
    /// Create a client against `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Configuration` if the API key is empty or the
    /// HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        options: ClientOptions,
    ) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ProviderError::Configuration("KIE API key is not set".into()));
        }

        Ok(Self {
            client: build_http(&options)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            callback_url: options.callback_url,
        })
    }

    /// Handle API response and unwrap the KIE envelope.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<Envelope<T>> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                code: status.as_u16().to_string(),
                message: if body.is_empty() {
                    format!("HTTP {status}")
                } else {
                    body
                },
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ProviderClient for KieClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Kie
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<DispatchOutcome> {
        let url = format!("{}/api/v1/jobs/createTask", self.base_url);
        let params = &request.params;
        let body = CreateTaskBody {
            model: &request.api_model_id,
            call_back_url: self.callback_url.as_deref(),
            input: TaskInput {
                prompt: &request.prompt,
                image_input: (!params.reference_images.is_empty())
                    .then_some(params.reference_images.as_slice()),
                aspect_ratio: params.aspect_ratio.as_deref(),
                resolution: params.resolution.as_deref(),
                quality: params.quality.as_deref(),
                output_format: params.output_format.as_deref(),
                duration: params.duration_seconds,
                sound: params.audio,
            },
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let envelope: Envelope<CreatedTask> = Self::handle_response(response).await?;

        if envelope.code != SUCCESS_CODE {
            return Err(ProviderError::Rejected(envelope.message()));
        }
        let task = envelope
            .data
            .ok_or_else(|| ProviderError::Rejected("createTask returned no task id".into()))?;

        tracing::debug!(model = %request.api_model_id, task_id = %task.task_id, "KIE task created");
        Ok(DispatchOutcome::Submitted {
            task_id: task.task_id,
        })
    }

    async fn poll_status(&self, task_id: &str) -> Result<PollResult> {
        let url = format!("{}/api/v1/jobs/recordInfo", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[("taskId", task_id)])
            .send()
            .await?;
        let envelope: Envelope<TaskRecord> = Self::handle_response(response).await?;

        if envelope.code == NOT_FOUND_CODE {
            return Err(ProviderError::UnknownTask {
                task_id: task_id.to_string(),
            });
        }
        if envelope.code != SUCCESS_CODE {
            // KIE reports errors in the body with HTTP-like codes.
            return Err(ProviderError::Api {
                status: u16::try_from(envelope.code).unwrap_or(502),
                code: envelope.code.to_string(),
                message: envelope.message(),
            });
        }
        let record = envelope.data.ok_or_else(|| ProviderError::UnknownTask {
            task_id: task_id.to_string(),
        })?;

        Ok(normalize(record))
    }
}

/// Map a KIE state onto the internal status.
#[must_use]
pub fn normalize_state(state: &str) -> GenerationStatus {
    match state.to_ascii_lowercase().as_str() {
        "waiting" | "queuing" | "queued" | "pending" => GenerationStatus::Queued,
        "success" | "completed" => GenerationStatus::Completed,
        "fail" | "failed" | "error" => GenerationStatus::Failed,
        _ => GenerationStatus::Generating,
    }
}

fn normalize(record: TaskRecord) -> PollResult {
    match normalize_state(&record.state) {
        GenerationStatus::Queued => PollResult::queued(),
        GenerationStatus::Generating => PollResult::generating(),
        GenerationStatus::Completed => {
            let urls = record
                .result_json
                .as_deref()
                .map(parse_result_urls)
                .unwrap_or_default();
            if urls.is_empty() {
                PollResult::failed("provider reported success without output URLs")
            } else {
                PollResult::completed(urls.into_iter().map(OutputRef::new).collect())
            }
        }
        GenerationStatus::Failed => {
            let message = match (record.fail_msg, record.fail_code) {
                (Some(msg), Some(code)) => format!("{msg} ({code})"),
                (Some(msg), None) => msg,
                (None, Some(code)) => format!("generation failed ({code})"),
                (None, None) => "generation failed".to_string(),
            };
            PollResult::failed(message)
        }
    }
}

/// Extract output URLs from a `resultJson` string.
///
/// Accepts `{"resultUrls": [...]}`, `{"outputs": [...]}`, a bare array of
/// URLs, or a bare URL string.
#[must_use]
pub fn parse_result_urls(raw: &str) -> Vec<String> {
    fn strings(value: &serde_json::Value) -> Vec<String> {
        match value {
            serde_json::Value::String(s) if !s.is_empty() => vec![s.clone()],
            serde_json::Value::Array(items) => items.iter().flat_map(strings).collect(),
            serde_json::Value::Object(map) => map
                .get("url")
                .map(strings)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    let trimmed = raw.trim();
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Object(map)) => ["resultUrls", "outputs", "urls"]
            .iter()
            .find_map(|key| map.get(*key).map(strings))
            .unwrap_or_default(),
        Ok(value) => strings(&value),
        Err(_) if trimmed.starts_with("http") => vec![trimmed.to_string()],
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_normalize() {
        assert_eq!(normalize_state("waiting"), GenerationStatus::Queued);
        assert_eq!(normalize_state("queuing"), GenerationStatus::Queued);
        assert_eq!(normalize_state("generating"), GenerationStatus::Generating);
        assert_eq!(normalize_state("processing"), GenerationStatus::Generating);
        assert_eq!(normalize_state("SUCCESS"), GenerationStatus::Completed);
        assert_eq!(normalize_state("fail"), GenerationStatus::Failed);
        assert_eq!(normalize_state("something-new"), GenerationStatus::Generating);
    }

    #[test]
    fn result_urls_in_every_shape() {
        assert_eq!(
            parse_result_urls(r#"{"resultUrls":["https://a/1.png","https://a/2.png"]}"#),
            vec!["https://a/1.png", "https://a/2.png"]
        );
        assert_eq!(
            parse_result_urls(r#"{"outputs":[{"url":"https://a/v.mp4"}]}"#),
            vec!["https://a/v.mp4"]
        );
        assert_eq!(parse_result_urls(r#"["https://a/x"]"#), vec!["https://a/x"]);
        assert_eq!(parse_result_urls("https://a/raw.png"), vec!["https://a/raw.png"]);
        assert!(parse_result_urls("{}").is_empty());
        assert!(parse_result_urls("garbage").is_empty());
    }

    #[test]
    fn success_without_urls_is_failure() {
        let result = normalize(TaskRecord {
            state: "success".into(),
            result_json: Some(r#"{"resultUrls":[]}"#.into()),
            fail_code: None,
            fail_msg: None,
        });
        assert_eq!(result.status, GenerationStatus::Failed);
    }

    #[test]
    fn failure_keeps_provider_reason() {
        let result = normalize(TaskRecord {
            state: "fail".into(),
            result_json: None,
            fail_code: Some("500".into()),
            fail_msg: Some("content policy".into()),
        });
        assert_eq!(result.error.as_deref(), Some("content policy (500)"));
    }

    #[test]
    fn callback_with_result_completes() {
        let body = br#"{"code":200,"msg":"success","data":{"taskId":"t-9","state":"success","resultJson":"{\"resultUrls\":[\"https://cdn.test/v.mp4\"]}"}}"#;
        let callback = parse_callback(body).unwrap();
        assert_eq!(callback.task_id, "t-9");
        assert_eq!(callback.result.status, GenerationStatus::Completed);
        assert_eq!(callback.result.outputs[0].url, "https://cdn.test/v.mp4");
    }

    #[test]
    fn callback_error_code_fails_task() {
        let body = br#"{"code":501,"msg":"internal error","data":{"taskId":"t-3","state":"generating"}}"#;
        let callback = parse_callback(body).unwrap();
        assert_eq!(callback.result.status, GenerationStatus::Failed);
        assert_eq!(callback.result.error.as_deref(), Some("internal error"));
    }

    #[test]
    fn callback_without_record_is_rejected() {
        let err = parse_callback(br#"{"code":200,"msg":"ok"}"#).unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(_)));
        assert!(parse_callback(b"not json").is_err());
    }

    #[test]
    fn empty_key_is_rejected() {
        let err = KieClient::new(DEFAULT_BASE_URL, " ", ClientOptions::default()).unwrap_err();
        assert!(matches!(err, ProviderError::Configuration(_)));
    }

    #[test]
    fn client_trims_trailing_slash() {
        let client = KieClient::new("http://localhost:9000/", "k", ClientOptions::default()).unwrap();
        assert_eq!(client.base_url, "http://localhost:9000");
    }
}
