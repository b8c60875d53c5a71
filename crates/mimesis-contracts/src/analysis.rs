use std::fmt;

use serde_json::{json, Value};

pub const OUTPUT_ANALYSIS_FIELD: &str = "analysis";

/// Structural violations of the request/response contracts. These replace
/// dynamic schema validation: the two shapes are small enough to check by
/// hand at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaViolation {
    MissingInput,
    MalformedDataUri { detail: String },
    OutputMissing,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaViolation::MissingInput => write!(f, "File data is missing."),
            SchemaViolation::MalformedDataUri { detail } => {
                write!(f, "file data URI is malformed: {detail}")
            }
            SchemaViolation::OutputMissing => {
                write!(f, "provider returned no structured analysis output")
            }
        }
    }
}

impl std::error::Error for SchemaViolation {}

/// The one input the prompt call accepts: a `data:<mime>;base64,<payload>`
/// string, held in parsed form.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisInput {
    mime_type: String,
    payload_base64: String,
}

impl AnalysisInput {
    pub fn parse(raw: &str) -> Result<Self, SchemaViolation> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SchemaViolation::MissingInput);
        }
        let Some(rest) = trimmed.strip_prefix("data:") else {
            return Err(SchemaViolation::MalformedDataUri {
                detail: "expected a 'data:' scheme".to_string(),
            });
        };
        let Some((mime_type, payload)) = rest.split_once(";base64,") else {
            return Err(SchemaViolation::MalformedDataUri {
                detail: "expected ';base64,' between MIME type and payload".to_string(),
            });
        };
        if mime_type.is_empty() || !mime_type.contains('/') {
            return Err(SchemaViolation::MalformedDataUri {
                detail: format!("'{mime_type}' is not a MIME type"),
            });
        }
        if payload.is_empty() {
            return Err(SchemaViolation::MalformedDataUri {
                detail: "empty Base64 payload".to_string(),
            });
        }
        if !payload
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'+' | b'/' | b'='))
        {
            return Err(SchemaViolation::MalformedDataUri {
                detail: "payload contains non-Base64 characters".to_string(),
            });
        }

        Ok(Self {
            mime_type: mime_type.to_string(),
            payload_base64: payload.to_string(),
        })
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn payload_base64(&self) -> &str {
        &self.payload_base64
    }

    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.payload_base64)
    }
}

/// Pull the single `analysis` text field out of a provider's structured
/// output. An absent or non-string field is `OutputMissing` and fatal for
/// the call; an empty string passes through so the request handler can
/// report it as "no result" rather than an error.
pub fn analysis_from_output(output: &Value) -> Result<String, SchemaViolation> {
    output
        .get(OUTPUT_ANALYSIS_FIELD)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(SchemaViolation::OutputMissing)
}

/// Uniform two-variant result of one analysis call. Exactly one variant is
/// ever populated; the wire shape matches the boundary contract
/// `{success, data}` / `{success, error}`.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    Success { analysis: String },
    Failure { error: String },
}

impl AnalysisOutcome {
    pub fn success(analysis: impl Into<String>) -> Self {
        AnalysisOutcome::Success {
            analysis: analysis.into(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        AnalysisOutcome::Failure {
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AnalysisOutcome::Success { .. })
    }

    pub fn analysis(&self) -> Option<&str> {
        match self {
            AnalysisOutcome::Success { analysis } => Some(analysis.as_str()),
            AnalysisOutcome::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            AnalysisOutcome::Success { .. } => None,
            AnalysisOutcome::Failure { error } => Some(error.as_str()),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            AnalysisOutcome::Success { analysis } => json!({
                "success": true,
                "data": analysis,
            }),
            AnalysisOutcome::Failure { error } => json!({
                "success": false,
                "error": error,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{analysis_from_output, AnalysisInput, AnalysisOutcome, SchemaViolation};

    #[test]
    fn parse_accepts_well_formed_data_uri() {
        let input = AnalysisInput::parse("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(input.mime_type(), "image/png");
        assert_eq!(input.payload_base64(), "aGVsbG8=");
        assert_eq!(input.to_data_uri(), "data:image/png;base64,aGVsbG8=");
    }

    #[test]
    fn parse_rejects_empty_and_blank_input() {
        assert_eq!(
            AnalysisInput::parse(""),
            Err(SchemaViolation::MissingInput)
        );
        assert_eq!(
            AnalysisInput::parse("   "),
            Err(SchemaViolation::MissingInput)
        );
    }

    #[test]
    fn parse_rejects_malformed_shapes() {
        assert!(matches!(
            AnalysisInput::parse("image/png;base64,aGVsbG8="),
            Err(SchemaViolation::MalformedDataUri { .. })
        ));
        assert!(matches!(
            AnalysisInput::parse("data:image/png,aGVsbG8="),
            Err(SchemaViolation::MalformedDataUri { .. })
        ));
        assert!(matches!(
            AnalysisInput::parse("data:;base64,aGVsbG8="),
            Err(SchemaViolation::MalformedDataUri { .. })
        ));
        assert!(matches!(
            AnalysisInput::parse("data:image/png;base64,"),
            Err(SchemaViolation::MalformedDataUri { .. })
        ));
        assert!(matches!(
            AnalysisInput::parse("data:image/png;base64,not base64!"),
            Err(SchemaViolation::MalformedDataUri { .. })
        ));
    }

    #[test]
    fn output_field_extraction() {
        assert_eq!(
            analysis_from_output(&json!({"analysis": "resonates with makers"})),
            Ok("resonates with makers".to_string())
        );
        // Present-but-empty passes through; the handler decides what to do.
        assert_eq!(analysis_from_output(&json!({"analysis": ""})), Ok(String::new()));
        assert_eq!(
            analysis_from_output(&json!({})),
            Err(SchemaViolation::OutputMissing)
        );
        assert_eq!(
            analysis_from_output(&json!({"analysis": 7})),
            Err(SchemaViolation::OutputMissing)
        );
    }

    #[test]
    fn outcome_wire_shape() {
        let success = AnalysisOutcome::success("bold palette");
        assert!(success.is_success());
        assert_eq!(success.analysis(), Some("bold palette"));
        assert_eq!(
            success.to_value(),
            json!({"success": true, "data": "bold palette"})
        );

        let failure = AnalysisOutcome::failure("File data is missing.");
        assert!(!failure.is_success());
        assert_eq!(failure.error(), Some("File data is missing."));
        assert_eq!(
            failure.to_value(),
            json!({"success": false, "error": "File data is missing."})
        );
    }
}
