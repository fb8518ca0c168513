//! Mindee custom-endpoint recognizer.
//!
//! Each document type has its own custom endpoint under the configured
//! account. Files are enqueued with `predict_async` and the job queue is
//! polled until the prediction is ready.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use super::{DocumentRecognizer, DocumentType, FetchedFile};
use crate::error::CollaboratorError;

const SERVICE: &str = "mindee";
const API_BASE: &str = "https://api.mindee.net/v1/products";

/// State of an enqueued prediction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Completed,
    Failed(String),
}

/// `DocumentRecognizer` backed by Mindee's custom endpoints.
pub struct MindeeRecognizer {
    api_key: SecretString,
    account_name: String,
    client: reqwest::Client,
    poll_interval: Duration,
    max_polls: u32,
}

impl MindeeRecognizer {
    pub fn new(api_key: SecretString, account_name: String) -> Self {
        Self {
            api_key,
            account_name,
            client: reqwest::Client::new(),
            poll_interval: Duration::from_secs(1),
            max_polls: 30,
        }
    }

    pub fn with_polling(mut self, interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls.max(1);
        self
    }

    fn endpoint_url(&self, doc_type: DocumentType, path: &str) -> String {
        format!(
            "{API_BASE}/{}/{}/v1/{path}",
            self.account_name,
            doc_type.endpoint()
        )
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.api_key.expose_secret())
    }

    async fn enqueue(
        &self,
        doc_type: DocumentType,
        file: &FetchedFile,
    ) -> Result<String, CollaboratorError> {
        let mut part = Part::bytes(file.bytes.clone()).file_name(file.file_name.clone());
        if let Some(mime) = &file.mime_type {
            part = part
                .mime_str(mime)
                .map_err(|e| CollaboratorError::rejected(SERVICE, e))?;
        }
        let form = Form::new().part("document", part);

        let resp = self
            .client
            .post(self.endpoint_url(doc_type, "predict_async"))
            .header("Authorization", self.auth_header())
            .multipart(form)
            .send()
            .await
            .map_err(|e| CollaboratorError::transient(SERVICE, e))?;

        let body = read_json(resp).await?;
        parse_job_id(&body).ok_or_else(|| {
            CollaboratorError::transient(SERVICE, "predict_async response without job id")
        })
    }

    async fn poll(&self, doc_type: DocumentType, job_id: &str) -> Result<Value, CollaboratorError> {
        let url = self.endpoint_url(doc_type, &format!("documents/queue/{job_id}"));
        for attempt in 1..=self.max_polls {
            tokio::time::sleep(self.poll_interval).await;

            let resp = self
                .client
                .get(&url)
                .header("Authorization", self.auth_header())
                .send()
                .await
                .map_err(|e| CollaboratorError::transient(SERVICE, e))?;
            let body = read_json(resp).await?;

            match parse_job_status(&body) {
                JobStatus::Completed => return Ok(body),
                JobStatus::Failed(reason) => {
                    return Err(CollaboratorError::rejected(SERVICE, reason));
                }
                JobStatus::Pending => {
                    tracing::debug!(job_id, attempt, "Mindee job still processing");
                }
            }
        }
        Err(CollaboratorError::transient(
            SERVICE,
            format!("job {job_id} not finished after {} polls", self.max_polls),
        ))
    }
}

#[async_trait]
impl DocumentRecognizer for MindeeRecognizer {
    async fn recognize(
        &self,
        doc_type: DocumentType,
        file: &FetchedFile,
    ) -> Result<BTreeMap<String, String>, CollaboratorError> {
        let job_id = self.enqueue(doc_type, file).await?;
        tracing::debug!(job_id = %job_id, endpoint = doc_type.endpoint(), "Mindee job enqueued");
        let body = self.poll(doc_type, &job_id).await?;
        let fields = flatten_prediction(&body);
        tracing::info!(
            endpoint = doc_type.endpoint(),
            fields = fields.len(),
            "Mindee prediction received"
        );
        Ok(fields)
    }
}

/// Decode a response body, classifying HTTP failures.
async fn read_json(resp: reqwest::Response) -> Result<Value, CollaboratorError> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json()
            .await
            .map_err(|e| CollaboratorError::transient(SERVICE, e));
    }
    let text = resp.text().await.unwrap_or_default();
    let reason = format!("HTTP {status}: {text}");
    if is_retryable_status(status) {
        Err(CollaboratorError::transient(SERVICE, reason))
    } else {
        Err(CollaboratorError::rejected(SERVICE, reason))
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn parse_job_id(body: &Value) -> Option<String> {
    body.pointer("/job/id")
        .and_then(Value::as_str)
        .map(String::from)
}

fn parse_job_status(body: &Value) -> JobStatus {
    match body.pointer("/job/status").and_then(Value::as_str) {
        Some("completed") => JobStatus::Completed,
        Some("failed") => JobStatus::Failed(
            body.pointer("/job/error/message")
                .and_then(Value::as_str)
                .unwrap_or("prediction failed")
                .to_string(),
        ),
        // A finished document without a job wrapper also counts as done.
        None if body.pointer("/document/inference").is_some() => JobStatus::Completed,
        _ => JobStatus::Pending,
    }
}

/// Flatten `document.inference.prediction` into field → text. Fields with
/// a `value` use it; list fields join their `values[].content` with spaces.
fn flatten_prediction(body: &Value) -> BTreeMap<String, String> {
    let Some(prediction) = body
        .pointer("/document/inference/prediction")
        .and_then(Value::as_object)
    else {
        return BTreeMap::new();
    };

    prediction
        .iter()
        .filter_map(|(name, field)| {
            let text = match field.get("value") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::Bool(b)) => b.to_string(),
                _ => field
                    .get("values")
                    .and_then(Value::as_array)
                    .map(|values| {
                        values
                            .iter()
                            .filter_map(|v| v.get("content").and_then(Value::as_str))
                            .collect::<Vec<_>>()
                            .join(" ")
                    })
                    .unwrap_or_default(),
            };
            let text = text.trim().to_string();
            (!text.is_empty()).then(|| (name.clone(), text))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn endpoint_urls_include_account_and_type() {
        let r = MindeeRecognizer::new(SecretString::from("k"), "acme".into());
        assert_eq!(
            r.endpoint_url(DocumentType::Passport, "predict_async"),
            "https://api.mindee.net/v1/products/acme/passport/v1/predict_async"
        );
        assert_eq!(
            r.endpoint_url(DocumentType::VehicleId, "documents/queue/abc"),
            "https://api.mindee.net/v1/products/acme/vehicle_id/v1/documents/queue/abc"
        );
        assert_eq!(r.auth_header(), "Token k");
    }

    #[test]
    fn job_id_and_status() {
        let queued = json!({"job": {"id": "job-1", "status": "waiting"}});
        assert_eq!(parse_job_id(&queued).as_deref(), Some("job-1"));
        assert_eq!(parse_job_status(&queued), JobStatus::Pending);

        let done = json!({"job": {"id": "job-1", "status": "completed"}, "document": {}});
        assert_eq!(parse_job_status(&done), JobStatus::Completed);

        let failed = json!({"job": {"status": "failed", "error": {"message": "bad file"}}});
        assert_eq!(parse_job_status(&failed), JobStatus::Failed("bad file".into()));
    }

    #[test]
    fn flattens_value_and_list_fields() {
        let body = json!({
            "document": {"inference": {"prediction": {
                "name": {"values": [{"content": "John"}, {"content": "Smith"}]},
                "date_of_birth": {"value": "1990-01-01"},
                "owner": {"value": null},
                "empty": {"values": []}
            }}}
        });
        let fields = flatten_prediction(&body);
        assert_eq!(fields.get("name").map(String::as_str), Some("John Smith"));
        assert_eq!(fields.get("date_of_birth").map(String::as_str), Some("1990-01-01"));
        assert!(!fields.contains_key("owner"));
        assert!(!fields.contains_key("empty"));
    }

    #[test]
    fn missing_prediction_is_empty() {
        assert!(flatten_prediction(&json!({"job": {"status": "completed"}})).is_empty());
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
    }
}
