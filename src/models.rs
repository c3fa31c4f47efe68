use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WizardStage {
    Problem,
    Feasibility,
    AgentPattern,
    Specification,
}

impl WizardStage {
    pub const ALL: [WizardStage; 4] = [
        WizardStage::Problem,
        WizardStage::Feasibility,
        WizardStage::AgentPattern,
        WizardStage::Specification,
    ];

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == value)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WizardStage::Problem => "problem",
            WizardStage::Feasibility => "feasibility",
            WizardStage::AgentPattern => "agent-pattern",
            WizardStage::Specification => "specification",
        }
    }

    pub fn env_key(&self) -> &'static str {
        match self {
            WizardStage::Problem => "PROBLEM",
            WizardStage::Feasibility => "FEASIBILITY",
            WizardStage::AgentPattern => "AGENT_PATTERN",
            WizardStage::Specification => "SPECIFICATION",
        }
    }

    pub fn default_timeout(&self) -> Duration {
        match self {
            WizardStage::Problem => Duration::from_secs(60),
            WizardStage::Feasibility | WizardStage::AgentPattern => Duration::from_secs(120),
            WizardStage::Specification => Duration::from_secs(300),
        }
    }

    pub fn required_inputs(&self) -> &'static [&'static str] {
        match self {
            WizardStage::Problem => &["problemStatement"],
            WizardStage::Feasibility => &["problemStatement", "answers"],
            WizardStage::AgentPattern => &["problemStatement", "feasibility"],
            WizardStage::Specification => &["problemStatement", "agentPattern"],
        }
    }
}

/// Inbound body of every wizard stream endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct WizardRequest {
    #[serde(default, rename = "sessionId")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub inputs: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    pub field: String,
    pub reason: String,
}

impl FieldViolation {
    fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ValidationLimits {
    pub max_field_chars: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_field_chars: 20_000,
        }
    }
}

const MAX_SESSION_ID_CHARS: usize = 128;

impl WizardRequest {
    /// Validates the body for `stage` and builds the outbound payload.
    /// All violations are collected, not just the first one.
    pub fn into_stream_request(
        self,
        stage: WizardStage,
        limits: &ValidationLimits,
    ) -> Result<StreamRequest, Vec<FieldViolation>> {
        let mut violations = Vec::new();

        let session_token = match self.session_id {
            Some(session_id) => {
                if let Some(reason) = session_id_violation(&session_id) {
                    violations.push(FieldViolation::new("sessionId", reason));
                }
                Some(session_id)
            }
            None => None,
        };

        let mut inputs = match self.inputs {
            Some(Value::Object(inputs)) => inputs,
            Some(_) => {
                violations.push(FieldViolation::new("inputs", "must be an object"));
                Map::new()
            }
            None => {
                violations.push(FieldViolation::new("inputs", "is required"));
                Map::new()
            }
        };

        for field in stage.required_inputs() {
            match inputs.get(*field) {
                None | Some(Value::Null) => {
                    violations.push(FieldViolation::new(format!("inputs.{field}"), "is required"));
                }
                Some(Value::String(text)) if text.trim().is_empty() => {
                    violations.push(FieldViolation::new(
                        format!("inputs.{field}"),
                        "must not be blank",
                    ));
                }
                Some(_) => {}
            }
        }

        for (field, value) in inputs.iter_mut() {
            if let Value::String(text) = value {
                let trimmed = text.trim();
                if trimmed.len() != text.len() {
                    *text = trimmed.to_owned();
                }
            }
            check_length(&format!("inputs.{field}"), value, limits, &mut violations);
        }

        if !violations.is_empty() {
            return Err(violations);
        }

        let mut payload = Map::new();
        payload.insert("stage".to_owned(), Value::String(stage.as_str().to_owned()));
        payload.insert("inputs".to_owned(), Value::Object(inputs));

        Ok(StreamRequest::new(stage, session_token, payload))
    }
}

fn session_id_violation(session_id: &str) -> Option<&'static str> {
    if session_id.is_empty() {
        return Some("must not be empty");
    }
    if session_id.chars().count() > MAX_SESSION_ID_CHARS {
        return Some("must be at most 128 characters");
    }
    if !session_id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Some("may only contain letters, digits, '-' and '_'");
    }
    None
}

fn check_length(
    path: &str,
    value: &Value,
    limits: &ValidationLimits,
    violations: &mut Vec<FieldViolation>,
) {
    match value {
        Value::String(text) => {
            if text.chars().count() > limits.max_field_chars {
                violations.push(FieldViolation::new(
                    path,
                    format!("must be at most {} characters", limits.max_field_chars),
                ));
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                check_length(&format!("{path}[{index}]"), item, limits, violations);
            }
        }
        Value::Object(fields) => {
            for (key, item) in fields {
                check_length(&format!("{path}.{key}"), item, limits, violations);
            }
        }
        _ => {}
    }
}

/// Validated outbound request. Built once, then only read.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    request_id: String,
    stage: WizardStage,
    session_token: Option<String>,
    payload: Map<String, Value>,
}

impl StreamRequest {
    pub fn new(
        stage: WizardStage,
        session_token: Option<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            request_id: format!("relay_{}", Uuid::new_v4()),
            stage,
            session_token,
            payload,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn stage(&self) -> WizardStage {
        self.stage
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }
}
