//! HTTP transport: sends a [`PreparedRequest`] and returns status plus body text

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use tracing::debug;

use crate::error::{RestamentError, RunResult};
use crate::request::{PreparedRequest, RequestBody};
use crate::scenario::Method;

/// Raw response of the application under test
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Sends requests to the application under test.
///
/// A non-2xx status is a normal response here; only failing to get any
/// response at all is an error.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &PreparedRequest) -> RunResult<HttpResponse>;
}

/// `reqwest`-backed transport
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn with_timeout(timeout: Duration) -> RunResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

async fn multipart_form(
    fields: &[(String, String)],
    files: &[(String, std::path::PathBuf)],
) -> RunResult<Form> {
    let mut form = Form::new();
    for (name, value) in fields {
        form = form.text(name.clone(), value.clone());
    }
    for (name, path) in files {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            RestamentError::Config(format!("cannot read upload {}: {}", path.display(), e))
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());
        form = form.part(name.clone(), Part::bytes(bytes).file_name(file_name));
    }
    Ok(form)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &PreparedRequest) -> RunResult<HttpResponse> {
        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), &request.uri);

        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(text) => builder
                .header(CONTENT_TYPE, request.content_type.unwrap_or("application/json"))
                .body(text.clone()),
            RequestBody::Form(fields) => builder.form(fields),
            // reqwest sets the multipart content type with its boundary
            RequestBody::Multipart { fields, files } => {
                builder.multipart(multipart_form(fields, files).await?)
            }
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        debug!("{} {} -> {} ({} bytes)", request.method, request.uri, status, body.len());
        Ok(HttpResponse { status, body })
    }
}
