//! Document extraction: turning a flushed batch of attachments into the
//! structured fields a policy needs.
//!
//! A batch must contain one passport and one vehicle identification
//! document. Each attachment is offered to every document type that is not
//! yet satisfied; the first type whose recognizer returns all required
//! fields claims it.

pub mod mindee;

pub use mindee::MindeeRecognizer;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::channels::Attachment;
use crate::error::{ChannelError, CollaboratorError, ExtractionFailure};

/// Downloaded attachment content.
#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub mime_type: Option<String>,
}

/// Resolves an attachment reference to its bytes.
#[async_trait]
pub trait AttachmentFetcher: Send + Sync {
    async fn fetch(&self, attachment: &Attachment) -> Result<FetchedFile, ChannelError>;
}

/// Turns a batch into extracted fields.
#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    async fn extract(
        &self,
        items: &[Attachment],
    ) -> Result<BTreeMap<String, String>, CollaboratorError>;
}

/// Document types a batch must cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DocumentType {
    Passport,
    VehicleId,
}

impl DocumentType {
    pub const ALL: [DocumentType; 2] = [DocumentType::Passport, DocumentType::VehicleId];

    /// Name of the custom recognition endpoint.
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::Passport => "passport",
            Self::VehicleId => "vehicle_id",
        }
    }

    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Passport => &["name", "date_of_birth"],
            Self::VehicleId => &["manufacturer", "model", "owner"],
        }
    }

    /// Prefix used for this type's keys in the merged field map.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Passport => "passport",
            Self::VehicleId => "vehicle",
        }
    }

    pub fn field_key(&self, field: &str) -> String {
        format!("{}_{field}", self.prefix())
    }

    /// Required fields absent (or blank) in `prediction`.
    pub fn missing_fields(&self, prediction: &BTreeMap<String, String>) -> Vec<&'static str> {
        self.required_fields()
            .iter()
            .copied()
            .filter(|f| prediction.get(*f).is_none_or(|v| v.trim().is_empty()))
            .collect()
    }
}

/// Reads one file as one document type.
#[async_trait]
pub trait DocumentRecognizer: Send + Sync {
    /// Raw prediction fields. An empty map means nothing was recognized.
    async fn recognize(
        &self,
        doc_type: DocumentType,
        file: &FetchedFile,
    ) -> Result<BTreeMap<String, String>, CollaboratorError>;
}

/// `DocumentExtractor` that fetches each attachment and matches it against
/// the passport and vehicle-id recognizers.
pub struct InsuranceDocumentExtractor {
    fetcher: Arc<dyn AttachmentFetcher>,
    recognizer: Arc<dyn DocumentRecognizer>,
}

impl InsuranceDocumentExtractor {
    pub fn new(fetcher: Arc<dyn AttachmentFetcher>, recognizer: Arc<dyn DocumentRecognizer>) -> Self {
        Self {
            fetcher,
            recognizer,
        }
    }
}

#[async_trait]
impl DocumentExtractor for InsuranceDocumentExtractor {
    async fn extract(
        &self,
        items: &[Attachment],
    ) -> Result<BTreeMap<String, String>, CollaboratorError> {
        let mut merged = BTreeMap::new();
        let mut satisfied: Vec<DocumentType> = Vec::new();
        // Fewest missing fields seen per unsatisfied type.
        let mut closest: BTreeMap<DocumentType, Vec<&'static str>> = BTreeMap::new();
        let mut unreadable: Option<String> = None;

        for item in items {
            if satisfied.len() == DocumentType::ALL.len() {
                tracing::debug!(file_id = %item.file_id, "Both documents found, skipping extra attachment");
                continue;
            }

            let file = self
                .fetcher
                .fetch(item)
                .await
                .map_err(|e| CollaboratorError::transient("attachment download", e))?;

            for doc_type in DocumentType::ALL {
                if satisfied.contains(&doc_type) {
                    continue;
                }
                let prediction = match self.recognizer.recognize(doc_type, &file).await {
                    Ok(p) => p,
                    Err(CollaboratorError::Rejected { reason, .. }) => {
                        tracing::warn!(file_id = %item.file_id, ?doc_type, %reason, "Document rejected");
                        unreadable = Some(reason);
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                if prediction.is_empty() {
                    continue;
                }

                let missing = doc_type.missing_fields(&prediction);
                if missing.is_empty() {
                    for field in doc_type.required_fields() {
                        if let Some(value) = prediction.get(*field) {
                            merged.insert(doc_type.field_key(field), value.trim().to_string());
                        }
                    }
                    satisfied.push(doc_type);
                    closest.remove(&doc_type);
                    tracing::info!(file_id = %item.file_id, ?doc_type, "Document recognized");
                    break;
                }

                let entry = closest
                    .entry(doc_type)
                    .or_insert_with(|| doc_type.required_fields().to_vec());
                if missing.len() < entry.len() {
                    *entry = missing;
                }
            }
        }

        if satisfied.len() == DocumentType::ALL.len() {
            return Ok(merged);
        }

        let partial = !satisfied.is_empty()
            || closest
                .iter()
                .any(|(t, missing)| missing.len() < t.required_fields().len());
        if !partial {
            if let Some(reason) = unreadable {
                return Err(ExtractionFailure::Unreadable(reason).into());
            }
            if !items.is_empty() {
                return Err(ExtractionFailure::WrongDocumentType(
                    "no passport or vehicle identification document recognized".to_string(),
                )
                .into());
            }
        }

        let missing: Vec<String> = DocumentType::ALL
            .into_iter()
            .filter(|t| !satisfied.contains(t))
            .flat_map(|t| {
                let fields = closest
                    .get(&t)
                    .cloned()
                    .unwrap_or_else(|| t.required_fields().to_vec());
                fields.into_iter().map(move |f| t.field_key(f))
            })
            .collect();
        Err(ExtractionFailure::MissingFields(missing).into())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::channels::AttachmentKind;

    struct BytesFetcher;

    #[async_trait]
    impl AttachmentFetcher for BytesFetcher {
        async fn fetch(&self, attachment: &Attachment) -> Result<FetchedFile, ChannelError> {
            Ok(FetchedFile {
                bytes: attachment.file_id.as_bytes().to_vec(),
                file_name: format!("{}.jpg", attachment.file_id),
                mime_type: Some("image/jpeg".into()),
            })
        }
    }

    /// Recognizes files by their id: "passport*", "vehicle*", "partial-passport", "bad".
    struct NameRecognizer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DocumentRecognizer for NameRecognizer {
        async fn recognize(
            &self,
            doc_type: DocumentType,
            file: &FetchedFile,
        ) -> Result<BTreeMap<String, String>, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let name = String::from_utf8_lossy(&file.bytes).to_string();
            let pairs: Vec<(&str, &str)> = match (doc_type, name.as_str()) {
                (DocumentType::Passport, "passport") => {
                    vec![("name", "John Smith"), ("date_of_birth", "1990-01-01")]
                }
                (DocumentType::Passport, "partial-passport") => vec![("name", "John Smith")],
                (DocumentType::VehicleId, "vehicle") => vec![
                    ("manufacturer", "Toyota"),
                    ("model", "Corolla"),
                    ("owner", "John Smith"),
                ],
                (_, "bad") => return Err(CollaboratorError::rejected("mindee", "unsupported file")),
                _ => vec![],
            };
            Ok(pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect())
        }
    }

    fn extractor() -> (InsuranceDocumentExtractor, Arc<NameRecognizer>) {
        let recognizer = Arc::new(NameRecognizer {
            calls: AtomicUsize::new(0),
        });
        (
            InsuranceDocumentExtractor::new(Arc::new(BytesFetcher), recognizer.clone()),
            recognizer,
        )
    }

    fn item(file_id: &str, message_id: i64) -> Attachment {
        Attachment {
            file_id: file_id.to_string(),
            kind: AttachmentKind::Photo,
            message_id,
            file_name: None,
            mime_type: None,
        }
    }

    #[tokio::test]
    async fn merges_both_documents() {
        let (ex, _) = extractor();
        let fields = ex
            .extract(&[item("vehicle", 1), item("passport", 2)])
            .await
            .unwrap();
        assert_eq!(fields["passport_name"], "John Smith");
        assert_eq!(fields["passport_date_of_birth"], "1990-01-01");
        assert_eq!(fields["vehicle_manufacturer"], "Toyota");
        assert_eq!(fields["vehicle_model"], "Corolla");
        assert_eq!(fields["vehicle_owner"], "John Smith");
        assert_eq!(fields.len(), 5);
    }

    #[tokio::test]
    async fn extra_attachments_are_not_sent_for_recognition() {
        let (ex, rec) = extractor();
        ex.extract(&[item("passport", 1), item("vehicle", 2), item("selfie", 3)])
            .await
            .unwrap();
        // passport: 1 call, vehicle: passport skipped -> 1 call, selfie: skipped
        assert_eq!(rec.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_document_lists_its_fields() {
        let (ex, _) = extractor();
        let err = ex.extract(&[item("passport", 1)]).await.unwrap_err();
        match err {
            CollaboratorError::Extraction(ExtractionFailure::MissingFields(fields)) => {
                assert_eq!(
                    fields,
                    vec!["vehicle_manufacturer", "vehicle_model", "vehicle_owner"]
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn partial_passport_reports_closest_missing_fields() {
        let (ex, _) = extractor();
        let err = ex
            .extract(&[item("partial-passport", 1), item("vehicle", 2)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CollaboratorError::Extraction(ExtractionFailure::MissingFields(ref f))
                if f == &vec!["passport_date_of_birth".to_string()]
        ));
    }

    #[tokio::test]
    async fn unrelated_images_are_wrong_type() {
        let (ex, _) = extractor();
        let err = ex.extract(&[item("cat", 1)]).await.unwrap_err();
        assert!(matches!(
            err,
            CollaboratorError::Extraction(ExtractionFailure::WrongDocumentType(_))
        ));
    }

    #[tokio::test]
    async fn rejected_files_are_unreadable() {
        let (ex, _) = extractor();
        let err = ex.extract(&[item("bad", 1)]).await.unwrap_err();
        assert!(matches!(
            err,
            CollaboratorError::Extraction(ExtractionFailure::Unreadable(_))
        ));
    }

    #[test]
    fn blank_values_count_as_missing() {
        let mut prediction = BTreeMap::new();
        prediction.insert("name".to_string(), "  ".to_string());
        prediction.insert("date_of_birth".to_string(), "1990-01-01".to_string());
        assert_eq!(DocumentType::Passport.missing_fields(&prediction), vec!["name"]);
    }
}
