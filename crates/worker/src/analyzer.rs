//! The external document-analysis service.
//!
//! [`Analyzer`] is the seam the handlers call; [`HttpAnalyzer`] reaches a
//! remote service over HTTP with [`reqwest`].

use std::sync::Arc;

use async_trait::async_trait;
use jokbo_core::mode::{AnalysisMode, ModelTier};
use jokbo_core::types::JobId;
use jokbo_orchestrator::cancellation::CancelProbe;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::documents::Document;

/// Options shared by every analysis call of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOptions {
    pub mode: AnalysisMode,
    pub model_tier: ModelTier,
    pub multi_api: bool,
    pub min_relevance: Option<i32>,
}

/// One primary document analyzed against its counterparts.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub job_id: JobId,
    pub options: AnalysisOptions,
    pub primary: Arc<Document>,
    pub counterparts: Vec<Arc<Document>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalyzerError {
    /// Rate limits, timeouts and unreachable services.
    #[error("Analyzer temporarily unavailable: {0}")]
    Transient(String),

    /// The service refused the input.
    #[error("Analysis rejected: {0}")]
    Rejected(String),

    #[error("Analysis cancelled")]
    Cancelled,
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Analyze one primary document. Implementations consult `probe`
    /// between chunks and stop with [`AnalyzerError::Cancelled`].
    async fn analyze(
        &self,
        request: &AnalysisRequest,
        probe: &CancelProbe,
    ) -> Result<Value, AnalyzerError>;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

pub struct HttpAnalyzer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAnalyzer {
    /// * `base_url` - e.g. `http://analyzer:8080`.
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn form(request: &AnalysisRequest) -> Result<Form, AnalyzerError> {
        let options = serde_json::to_string(&request.options)
            .map_err(|e| AnalyzerError::Rejected(e.to_string()))?;
        let mut form = Form::new()
            .text("job_id", request.job_id.to_string())
            .text("options", options)
            .part("primary", document_part(&request.primary)?);
        for doc in &request.counterparts {
            form = form.part("counterpart", document_part(doc)?);
        }
        Ok(form)
    }
}

fn document_part(doc: &Document) -> Result<Part, AnalyzerError> {
    Part::bytes(doc.bytes.to_vec())
        .file_name(doc.key.clone())
        .mime_str("application/pdf")
        .map_err(|e| AnalyzerError::Rejected(e.to_string()))
}

/// Map a non-success status to the error kind the runtime acts on.
fn status_error(status: StatusCode, body: String) -> AnalyzerError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        AnalyzerError::Transient(format!("{status}: {body}"))
    } else {
        AnalyzerError::Rejected(format!("{status}: {body}"))
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    async fn analyze(
        &self,
        request: &AnalysisRequest,
        probe: &CancelProbe,
    ) -> Result<Value, AnalyzerError> {
        let send = self
            .client
            .post(format!("{}/analyze", self.base_url))
            .multipart(Self::form(request)?)
            .send();

        let response = tokio::select! {
            _ = probe.token().cancelled() => return Err(AnalyzerError::Cancelled),
            result = send => result.map_err(|e| AnalyzerError::Transient(e.to_string()))?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(status_error(status, body));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| AnalyzerError::Rejected(e.to_string()))
    }
}
