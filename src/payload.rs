// Versioned payload schemas for stage context and outbox jobs
//
// Both blobs are stored as JSON but modelled as tagged unions so the command
// handler and the dispatcher can check their shape before touching storage.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Schema version written by this build
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Oldest schema version this build still reads
pub const MIN_SUPPORTED_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Unsupported schema version {found} (supported: {min}..={max})")]
    UnsupportedSchemaVersion { found: u32, min: u32, max: u32 },

    #[error("Job for queue '{queue_name}' carries a payload for queue '{expected}'")]
    QueueMismatch {
        queue_name: String,
        expected: &'static str,
    },
}

fn check_schema_version(found: u32) -> Result<(), PayloadError> {
    if (MIN_SUPPORTED_SCHEMA_VERSION..=CURRENT_SCHEMA_VERSION).contains(&found) {
        Ok(())
    } else {
        Err(PayloadError::UnsupportedSchemaVersion {
            found,
            min: MIN_SUPPORTED_SCHEMA_VERSION,
            max: CURRENT_SCHEMA_VERSION,
        })
    }
}

/// Stage-specific data carried alongside a workflow state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageData {
    /// Transition with nothing stage-specific attached
    Idle,
    DocumentProcessing {
        file_ids: Vec<String>,
    },
    Summarization {
        file_ids: Vec<String>,
    },
    StructureAnalysis {
        #[serde(default)]
        analysis_id: Option<String>,
    },
    StructureGeneration {
        #[serde(default)]
        analysis_id: Option<String>,
        #[serde(default)]
        lesson_count: Option<u32>,
    },
    LessonContent {
        lesson_ids: Vec<String>,
    },
}

/// `contextData` of a workflow state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageContext {
    pub schema_version: u32,
    #[serde(flatten)]
    pub data: StageData,
}

impl StageContext {
    pub fn new(data: StageData) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            data,
        }
    }

    pub fn idle() -> Self {
        Self::new(StageData::Idle)
    }

    pub fn validate(&self) -> Result<(), PayloadError> {
        check_schema_version(self.schema_version)
    }
}

impl Default for StageContext {
    fn default() -> Self {
        Self::idle()
    }
}

/// Work a single outbox entry asks the queue to perform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    DocumentProcessing {
        file_id: String,
    },
    SummaryGeneration {
        file_id: String,
    },
    StructureAnalysis {
        #[serde(default)]
        language: Option<String>,
    },
    StructureGeneration {
        #[serde(default)]
        analysis_id: Option<String>,
    },
    LessonContent {
        lesson_id: String,
    },
}

impl JobKind {
    /// Queue this kind of job belongs on
    pub fn queue_name(&self) -> &'static str {
        match self {
            JobKind::DocumentProcessing { .. } => "document_processing",
            JobKind::SummaryGeneration { .. } => "summary_generation",
            JobKind::StructureAnalysis { .. } => "structure_analysis",
            JobKind::StructureGeneration { .. } => "structure_generation",
            JobKind::LessonContent { .. } => "lesson_content",
        }
    }
}

/// Job `payload` as stored in the outbox and handed to the work queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub schema_version: u32,
    #[serde(flatten)]
    pub job: JobKind,
}

impl JobPayload {
    pub fn new(job: JobKind) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            job,
        }
    }

    /// Check the version and that the payload belongs on `queue_name`
    pub fn validate_for_queue(&self, queue_name: &str) -> Result<(), PayloadError> {
        check_schema_version(self.schema_version)?;
        let expected = self.job.queue_name();
        if expected != queue_name {
            return Err(PayloadError::QueueMismatch {
                queue_name: queue_name.to_string(),
                expected,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stage_context_serializes_flat_with_tag() {
        let ctx = StageContext::new(StageData::StructureGeneration {
            analysis_id: Some("an-1".to_string()),
            lesson_count: Some(12),
        });
        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(
            value,
            json!({
                "schema_version": 1,
                "stage": "structure_generation",
                "analysis_id": "an-1",
                "lesson_count": 12
            })
        );

        let back: StageContext = serde_json::from_value(value).unwrap();
        assert_eq!(back, ctx);
    }

    #[test]
    fn idle_context_round_trips() {
        let value = serde_json::to_value(StageContext::idle()).unwrap();
        assert_eq!(value, json!({"schema_version": 1, "stage": "idle"}));
    }

    #[test]
    fn job_payload_reads_missing_optional_fields() {
        let payload: JobPayload = serde_json::from_value(json!({
            "schema_version": 1,
            "kind": "structure_generation"
        }))
        .unwrap();
        assert_eq!(
            payload.job,
            JobKind::StructureGeneration { analysis_id: None }
        );
    }

    #[test]
    fn job_payload_rejects_wrong_queue() {
        let payload = JobPayload::new(JobKind::LessonContent {
            lesson_id: "l-1".to_string(),
        });
        let err = payload.validate_for_queue("structure_generation").unwrap_err();
        assert_eq!(
            err,
            PayloadError::QueueMismatch {
                queue_name: "structure_generation".to_string(),
                expected: "lesson_content",
            }
        );
        assert!(payload.validate_for_queue("lesson_content").is_ok());
    }

    #[test]
    fn unknown_schema_version_is_rejected() {
        let mut payload = JobPayload::new(JobKind::DocumentProcessing {
            file_id: "f-1".to_string(),
        });
        payload.schema_version = 7;
        assert!(matches!(
            payload.validate_for_queue("document_processing"),
            Err(PayloadError::UnsupportedSchemaVersion { found: 7, .. })
        ));

        let ctx = StageContext {
            schema_version: 0,
            data: StageData::Idle,
        };
        assert!(ctx.validate().is_err());
    }
}
