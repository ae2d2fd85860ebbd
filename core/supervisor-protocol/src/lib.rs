//! Socket protocol types and validation for the cc-supervisor issue channel.
//!
//! This crate is shared by the supervisor (server side) and its clients (the
//! lifecycle hook, external verifiers) so the newline-delimited JSON schema
//! cannot drift. The supervisor remains the authority on validation; clients
//! reuse the same types to build valid requests.
//!
//! Wire shape, one JSON document per line:
//!
//! ```text
//! → {"id": 7, "method": "reportIssue", "params": {"sessionId": "...", "issueBody": "..."}}
//! ← {"id": 7, "result": {"success": true, "message": "..."}}
//! ← {"id": 7, "error": {"code": -32602, "message": "..."}}
//! ```

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_SESSION_ID_LEN: usize = 128;

pub const ERROR_PARSE: i64 = -32700;
pub const ERROR_INVALID_REQUEST: i64 = -32600;
pub const ERROR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERROR_INVALID_PARAMS: i64 = -32602;
pub const ERROR_INTERNAL: i64 = -32603;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    RegisterSession,
    ReportIssue,
    Ping,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::RegisterSession => "registerSession",
            Method::ReportIssue => "reportIssue",
            Method::Ping => "ping",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "registerSession" => Some(Method::RegisterSession),
            "reportIssue" => Some(Method::ReportIssue),
            "ping" => Some(Method::Ping),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: impl Into<Value>, method: Method, params: Option<Value>) -> Self {
        Self {
            id: Some(id.into()),
            method: method.as_str().to_string(),
            params,
        }
    }

    pub fn method(&self) -> Option<Method> {
        Method::from_name(&self.method)
    }
}

/// One response per request. `id` is always present on the wire (null when the
/// request could not be correlated).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: i64,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<Value>, error: ErrorInfo) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.result.is_some()
    }
}

/// A request that failed to parse, carrying whatever id could be recovered so
/// the error response can still be correlated.
#[derive(Debug, Clone)]
pub struct RejectedRequest {
    pub id: Option<Value>,
    pub error: ErrorInfo,
}

/// Parse one request line (without the trailing newline).
pub fn parse_request(line: &[u8]) -> Result<Request, RejectedRequest> {
    let value: Value = serde_json::from_slice(line).map_err(|err| RejectedRequest {
        id: None,
        error: ErrorInfo::new(ERROR_PARSE, format!("request was not valid JSON: {}", err)),
    })?;

    let id = value.get("id").cloned().filter(|id| !id.is_null());
    if !value.is_object() {
        return Err(RejectedRequest {
            id,
            error: ErrorInfo::new(ERROR_INVALID_REQUEST, "request must be a JSON object"),
        });
    }

    serde_json::from_value(value).map_err(|err| RejectedRequest {
        id,
        error: ErrorInfo::new(
            ERROR_INVALID_REQUEST,
            format!("request is missing required fields: {}", err),
        ),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterSessionParams {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReportIssueParams {
    pub session_id: String,
    #[serde(alias = "issueData")]
    pub issue_body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
}

pub fn parse_register_session(params: Option<Value>) -> Result<RegisterSessionParams, ErrorInfo> {
    let params: RegisterSessionParams = parse_params(params)?;
    validate_session_id(&params.session_id)?;
    if let Some(path) = &params.project_path {
        if path.trim().is_empty() {
            return Err(ErrorInfo::new(
                ERROR_INVALID_PARAMS,
                "projectPath must not be empty when provided",
            ));
        }
    }
    Ok(params)
}

pub fn parse_report_issue(params: Option<Value>) -> Result<ReportIssueParams, ErrorInfo> {
    let params: ReportIssueParams = parse_params(params)?;
    validate_session_id(&params.session_id)?;
    if params.issue_body.trim().is_empty() {
        return Err(ErrorInfo::new(
            ERROR_INVALID_PARAMS,
            "issueBody is required",
        ));
    }
    if let Some(timestamp) = &params.timestamp {
        validate_timestamp(timestamp)?;
    }
    Ok(params)
}

fn parse_params<T: for<'de> Deserialize<'de>>(params: Option<Value>) -> Result<T, ErrorInfo> {
    let params = match params {
        Some(Value::Object(map)) => Value::Object(map),
        Some(_) => {
            return Err(ErrorInfo::new(
                ERROR_INVALID_PARAMS,
                "params must be an object",
            ))
        }
        None => return Err(ErrorInfo::new(ERROR_INVALID_PARAMS, "params are required")),
    };
    serde_json::from_value(params)
        .map_err(|err| ErrorInfo::new(ERROR_INVALID_PARAMS, format!("invalid params: {}", err)))
}

/// Session ids become file name components, so only a conservative character
/// set is accepted.
pub fn validate_session_id(session_id: &str) -> Result<(), ErrorInfo> {
    if session_id.trim().is_empty() {
        return Err(ErrorInfo::new(ERROR_INVALID_PARAMS, "sessionId is required"));
    }
    if session_id.len() > MAX_SESSION_ID_LEN {
        return Err(ErrorInfo::new(
            ERROR_INVALID_PARAMS,
            format!("sessionId must be {} characters or fewer", MAX_SESSION_ID_LEN),
        ));
    }
    let allowed = session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !allowed || session_id.starts_with('.') {
        return Err(ErrorInfo::new(
            ERROR_INVALID_PARAMS,
            "sessionId may only contain letters, digits, '-', '_' and '.'",
        ));
    }
    Ok(())
}

fn validate_timestamp(timestamp: &Value) -> Result<(), ErrorInfo> {
    match timestamp {
        Value::Number(number) if number.as_i64().is_some() || number.as_u64().is_some() => Ok(()),
        Value::String(value) if DateTime::parse_from_rfc3339(value).is_ok() => Ok(()),
        _ => Err(ErrorInfo::new(
            ERROR_INVALID_PARAMS,
            "timestamp must be RFC3339 or epoch milliseconds",
        )),
    }
}
