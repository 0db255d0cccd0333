use serde::{Deserialize, Serialize};

use crate::error::ConnectorError;

/// FHIR OperationOutcome returned by the query API on failure
/// See: https://www.hl7.org/fhir/operationoutcome.html
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    pub resource_type: String,
    pub issue: Vec<OperationOutcomeIssue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcomeIssue {
    pub severity: IssueSeverity,
    pub code: IssueType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<CodeableConcept>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Fatal,
    Error,
    Warning,
    Information,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum IssueType {
    Invalid,
    Required,
    Security,
    Login,
    Forbidden,
    Processing,
    NotFound,
    Exception,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeableConcept {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl OperationOutcome {
    pub fn new(severity: IssueSeverity, code: IssueType, diagnostics: impl Into<String>) -> Self {
        Self {
            resource_type: "OperationOutcome".to_string(),
            issue: vec![OperationOutcomeIssue {
                severity,
                code,
                diagnostics: Some(diagnostics.into()),
                details: None,
            }],
        }
    }

    /// Error outcome with code `invalid`, the shape every query API failure uses
    pub fn invalid(diagnostics: impl Into<String>) -> Self {
        Self::new(IssueSeverity::Error, IssueType::Invalid, diagnostics)
    }

    pub fn unauthorized(diagnostics: impl Into<String>) -> Self {
        Self::new(IssueSeverity::Error, IssueType::Login, diagnostics)
    }

    pub fn forbidden(diagnostics: impl Into<String>) -> Self {
        Self::new(IssueSeverity::Error, IssueType::Forbidden, diagnostics)
    }

    pub fn exception(diagnostics: impl Into<String>) -> Self {
        Self::new(IssueSeverity::Error, IssueType::Exception, diagnostics)
    }

    /// Wrap an internal error as "An error has occurred: <error>"
    pub fn from_error(error: &ConnectorError) -> Self {
        Self::invalid(format!("An error has occurred: {}", error))
    }

    /// First diagnostics string, if any
    pub fn diagnostics(&self) -> Option<&str> {
        self.issue.first().and_then(|i| i.diagnostics.as_deref())
    }
}
