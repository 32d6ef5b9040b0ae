//! Stream field schemas
//!
//! Entries on the request and response streams are maps of short string
//! fields; structured payloads ride JSON-encoded inside a single field.
//! These types are the only place the field names appear.

use std::collections::HashMap;

use ensemble_transport::Fields;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const FIELD_WORKFLOW_ID: &str = "workflow_id";
pub const FIELD_TO_PERSONA: &str = "to_persona";
pub const FIELD_STEP: &str = "step";
pub const FIELD_INTENT: &str = "intent";
pub const FIELD_CORR_ID: &str = "corr_id";
pub const FIELD_FROM: &str = "from";
pub const FIELD_TASK_ID: &str = "task_id";
pub const FIELD_PAYLOAD: &str = "payload";
pub const FIELD_RESULT: &str = "result";
pub const FIELD_REPO: &str = "repo";
pub const FIELD_BRANCH: &str = "branch";
pub const FIELD_PROJECT_ID: &str = "project_id";

/// A required wire field was missing or malformed
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("missing required field {0:?}")]
    MissingField(&'static str),
}

/// Request published to the shared request stream, addressed to one persona
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaRequest {
    pub workflow_id: String,
    /// Routing target. `None` is tolerated on decode for older producers;
    /// consumers fail open and process the message.
    pub to_persona: Option<String>,
    pub step: String,
    pub intent: String,
    pub corr_id: String,
    pub from: Option<String>,
    pub task_id: Option<String>,
    /// Structured payload, JSON-encoded on the wire
    pub payload: Value,
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub project_id: Option<String>,
}

impl PersonaRequest {
    /// Encode into a stream field map
    pub fn to_fields(&self) -> Fields {
        let mut fields = HashMap::new();
        fields.insert(FIELD_WORKFLOW_ID.to_string(), self.workflow_id.clone());
        if let Some(persona) = &self.to_persona {
            fields.insert(FIELD_TO_PERSONA.to_string(), persona.clone());
        }
        fields.insert(FIELD_STEP.to_string(), self.step.clone());
        fields.insert(FIELD_INTENT.to_string(), self.intent.clone());
        fields.insert(FIELD_CORR_ID.to_string(), self.corr_id.clone());
        fields.insert(
            FIELD_PAYLOAD.to_string(),
            serde_json::to_string(&self.payload).unwrap_or_else(|_| "null".to_string()),
        );
        if let Some(from) = &self.from {
            fields.insert(FIELD_FROM.to_string(), from.clone());
        }
        if let Some(task_id) = &self.task_id {
            fields.insert(FIELD_TASK_ID.to_string(), task_id.clone());
        }
        if let Some(repo) = &self.repo {
            fields.insert(FIELD_REPO.to_string(), repo.clone());
        }
        if let Some(branch) = &self.branch {
            fields.insert(FIELD_BRANCH.to_string(), branch.clone());
        }
        if let Some(project_id) = &self.project_id {
            fields.insert(FIELD_PROJECT_ID.to_string(), project_id.clone());
        }
        fields
    }

    /// Decode from a stream field map. `workflow_id` and `corr_id` are
    /// required; everything else is optional. An unparseable payload is kept
    /// verbatim as a JSON string rather than dropped.
    pub fn from_fields(fields: &Fields) -> Result<Self, ContractError> {
        let workflow_id = fields
            .get(FIELD_WORKFLOW_ID)
            .cloned()
            .ok_or(ContractError::MissingField(FIELD_WORKFLOW_ID))?;
        let corr_id = fields
            .get(FIELD_CORR_ID)
            .cloned()
            .ok_or(ContractError::MissingField(FIELD_CORR_ID))?;

        let payload = fields
            .get(FIELD_PAYLOAD)
            .map(|raw| decode_lenient(raw))
            .unwrap_or(Value::Null);

        Ok(Self {
            workflow_id,
            to_persona: fields.get(FIELD_TO_PERSONA).cloned(),
            step: fields.get(FIELD_STEP).cloned().unwrap_or_default(),
            intent: fields.get(FIELD_INTENT).cloned().unwrap_or_default(),
            corr_id,
            from: fields.get(FIELD_FROM).cloned(),
            task_id: fields.get(FIELD_TASK_ID).cloned(),
            payload,
            repo: fields.get(FIELD_REPO).cloned(),
            branch: fields.get(FIELD_BRANCH).cloned(),
            project_id: fields.get(FIELD_PROJECT_ID).cloned(),
        })
    }
}

/// Completion event published to the response stream by a persona worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaEvent {
    pub workflow_id: String,
    pub corr_id: String,
    /// Persona that produced the result
    pub from: String,
    /// Status + output, JSON-encoded on the wire
    pub result: Value,
}

impl PersonaEvent {
    pub fn to_fields(&self) -> Fields {
        let mut fields = HashMap::new();
        fields.insert(FIELD_WORKFLOW_ID.to_string(), self.workflow_id.clone());
        fields.insert(FIELD_CORR_ID.to_string(), self.corr_id.clone());
        fields.insert(FIELD_FROM.to_string(), self.from.clone());
        fields.insert(
            FIELD_RESULT.to_string(),
            serde_json::to_string(&self.result).unwrap_or_else(|_| "null".to_string()),
        );
        fields
    }

    pub fn from_fields(fields: &Fields) -> Result<Self, ContractError> {
        Ok(Self {
            workflow_id: fields
                .get(FIELD_WORKFLOW_ID)
                .cloned()
                .ok_or(ContractError::MissingField(FIELD_WORKFLOW_ID))?,
            corr_id: fields
                .get(FIELD_CORR_ID)
                .cloned()
                .ok_or(ContractError::MissingField(FIELD_CORR_ID))?,
            from: fields.get(FIELD_FROM).cloned().unwrap_or_default(),
            result: fields
                .get(FIELD_RESULT)
                .map(|raw| decode_lenient(raw))
                .unwrap_or(Value::Null),
        })
    }

    /// Status carried by the event result
    pub fn status(&self) -> PersonaStatus {
        self.result
            .get("status")
            .and_then(Value::as_str)
            .map(PersonaStatus::parse)
            .unwrap_or(PersonaStatus::Unknown)
    }
}

/// Best-effort JSON decode: malformed payloads are preserved as raw strings
/// so downstream parsers can run their own extraction tiers.
pub fn decode_lenient(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Normalized persona outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonaStatus {
    Pass,
    Fail,
    Unknown,
}

impl PersonaStatus {
    /// Fold the accepted wire statuses: `approved` and `ok` count as pass,
    /// `failed` as fail, anything unrecognized as unknown.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pass" | "ok" | "approved" => PersonaStatus::Pass,
            "fail" | "failed" => PersonaStatus::Fail,
            _ => PersonaStatus::Unknown,
        }
    }

    pub fn is_pass(self) -> bool {
        self == PersonaStatus::Pass
    }

    pub fn is_fail(self) -> bool {
        self == PersonaStatus::Fail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_roundtrip() {
        let request = PersonaRequest {
            workflow_id: "wf-1".to_string(),
            to_persona: Some("tester-qa".to_string()),
            step: "qa_check".to_string(),
            intent: "run_qa".to_string(),
            corr_id: "c-1".to_string(),
            from: Some("engine".to_string()),
            task_id: Some("t-9".to_string()),
            payload: json!({"files": ["a.rs"]}),
            repo: Some("git@example.com:acme/app.git".to_string()),
            branch: Some("main".to_string()),
            project_id: Some("p-1".to_string()),
        };
        let decoded = PersonaRequest::from_fields(&request.to_fields()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_request_requires_workflow_and_corr() {
        let mut fields = Fields::new();
        fields.insert(FIELD_CORR_ID.to_string(), "c".to_string());
        assert!(matches!(
            PersonaRequest::from_fields(&fields),
            Err(ContractError::MissingField(FIELD_WORKFLOW_ID))
        ));
    }

    #[test]
    fn test_missing_persona_is_tolerated() {
        let mut fields = Fields::new();
        fields.insert(FIELD_WORKFLOW_ID.to_string(), "wf".to_string());
        fields.insert(FIELD_CORR_ID.to_string(), "c".to_string());
        let decoded = PersonaRequest::from_fields(&fields).unwrap();
        assert!(decoded.to_persona.is_none());
    }

    #[test]
    fn test_malformed_payload_kept_as_string() {
        let mut fields = Fields::new();
        fields.insert(FIELD_WORKFLOW_ID.to_string(), "wf".to_string());
        fields.insert(FIELD_CORR_ID.to_string(), "c".to_string());
        fields.insert(FIELD_PAYLOAD.to_string(), "{not json".to_string());
        let decoded = PersonaRequest::from_fields(&fields).unwrap();
        assert_eq!(decoded.payload, Value::String("{not json".to_string()));
    }

    #[test]
    fn test_status_folding() {
        assert_eq!(PersonaStatus::parse("pass"), PersonaStatus::Pass);
        assert_eq!(PersonaStatus::parse("OK"), PersonaStatus::Pass);
        assert_eq!(PersonaStatus::parse("Approved"), PersonaStatus::Pass);
        assert_eq!(PersonaStatus::parse("fail"), PersonaStatus::Fail);
        assert_eq!(PersonaStatus::parse("failed"), PersonaStatus::Fail);
        assert_eq!(PersonaStatus::parse("wat"), PersonaStatus::Unknown);
    }

    #[test]
    fn test_event_status() {
        let event = PersonaEvent {
            workflow_id: "wf".to_string(),
            corr_id: "c".to_string(),
            from: "code-reviewer".to_string(),
            result: json!({"status": "approved", "output": {}}),
        };
        assert!(event.status().is_pass());
    }
}
