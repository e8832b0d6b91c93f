//! Turns a scenario's request description into a transport-ready payload

use std::path::PathBuf;

use serde_json::Value;
use tracing::debug;

use crate::error::{RestamentError, RunResult};
use crate::scenario::{Method, RequestFormat, Scenario};

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_FORM: &str = "application/x-www-form-urlencoded";
pub const CONTENT_TYPE_MULTIPART: &str = "multipart/form-data";

/// Body of a prepared request
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    /// Serialized JSON text
    Json(String),
    /// URL-encoded form fields
    Form(Vec<(String, String)>),
    /// Form fields plus file parts read from disk at send time
    Multipart {
        fields: Vec<(String, String)>,
        files: Vec<(String, PathBuf)>,
    },
}

/// Everything the transport needs to send one request
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub method: Method,
    pub uri: String,
    pub body: RequestBody,
    pub content_type: Option<&'static str>,
}

/// Render `scenario`'s request against `endpoint`.
///
/// Fails before any I/O when uploads are combined with the JSON format.
pub fn build_request(endpoint: &str, scenario: &Scenario) -> RunResult<PreparedRequest> {
    let uri = format!("{}{}", endpoint, scenario.url);

    let (body, content_type) = match scenario.reqformat {
        RequestFormat::Json => {
            if !scenario.uploads.is_empty() {
                return Err(RestamentError::UploadsWithJson);
            }
            let body = if scenario.reqdata.is_null() {
                RequestBody::Empty
            } else {
                RequestBody::Json(serde_json::to_string(&scenario.reqdata)?)
            };
            (body, CONTENT_TYPE_JSON)
        }
        RequestFormat::Form => {
            let fields = form_fields(&scenario.reqdata)?;
            let files: Vec<(String, PathBuf)> = if scenario.method.carries_files() {
                scenario
                    .uploads
                    .iter()
                    .map(|(field, path)| (field.clone(), path.clone()))
                    .collect()
            } else {
                Vec::new()
            };

            if files.is_empty() {
                (RequestBody::Form(fields), CONTENT_TYPE_FORM)
            } else {
                (RequestBody::Multipart { fields, files }, CONTENT_TYPE_MULTIPART)
            }
        }
    };

    // GET never carries a body, whatever the format
    let (body, content_type) = if scenario.method == Method::Get {
        (RequestBody::Empty, None)
    } else {
        (body, Some(content_type))
    };

    debug!("Prepared {} {} ({:?})", scenario.method, uri, content_type);

    Ok(PreparedRequest {
        method: scenario.method,
        uri,
        body,
        content_type,
    })
}

/// Flatten request data into form fields.
///
/// Array values are joined with commas, so `{tags: ["a", "b"]}` becomes
/// `tags=a,b`. Servers expecting repeated keys will not see them.
pub fn form_fields(data: &Value) -> RunResult<Vec<(String, String)>> {
    match data {
        Value::Null => Ok(Vec::new()),
        Value::Object(map) => Ok(map
            .iter()
            .map(|(key, value)| {
                let rendered = match value {
                    Value::Array(items) => items
                        .iter()
                        .map(form_scalar)
                        .collect::<Vec<_>>()
                        .join(","),
                    other => form_scalar(other),
                };
                (key.clone(), rendered)
            })
            .collect()),
        other => Err(RestamentError::Config(format!(
            "FORM request data must be a mapping, got {}",
            other
        ))),
    }
}

fn form_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
