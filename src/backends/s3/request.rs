//! HTTP plumbing shared by the REST backends: streaming file bodies and
//! response-to-error translation.

use crate::backends::s3::responses::ErrorResponse;
use crate::retry::BackendError;
use reqwest::{
    Body, Client, Method, Response,
    header::{CONTENT_LENGTH, HeaderMap},
};
use std::{path::Path, time::Duration};
use tokio::fs::File;
use tokio_util::codec::{BytesCodec, FramedRead};
use url::Url;

/// Build the shared HTTP client with the per-request timeout.
///
/// # Errors
/// `Permanent` if the client cannot be constructed.
pub fn build_client(timeout: Duration) -> Result<Client, BackendError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| BackendError::Permanent(format!("http client: {e}")))
}

/// Issue a request streaming `source` as the body.
///
/// The file is re-opened per attempt so a retried upload always starts from
/// byte zero.
///
/// # Errors
/// Classified transport errors; HTTP status is not inspected here.
pub async fn send_file(
    client: &Client,
    method: Method,
    url: Url,
    headers: HeaderMap,
    source: &Path,
    size: u64,
) -> Result<Response, BackendError> {
    let file = File::open(source)
        .await
        .map_err(|e| BackendError::from_io(&e, "open payload"))?;

    let stream = FramedRead::with_capacity(file, BytesCodec::new(), 1024 * 256);

    client
        .request(method, url)
        .headers(headers)
        .header(CONTENT_LENGTH, size)
        .body(Body::wrap_stream(stream))
        .send()
        .await
        .map_err(|e| BackendError::from_reqwest(&e, "upload"))
}

/// Issue a bodyless request.
///
/// # Errors
/// Classified transport errors.
pub async fn send_empty(
    client: &Client,
    method: Method,
    url: Url,
    headers: HeaderMap,
) -> Result<Response, BackendError> {
    client
        .request(method, url)
        .headers(headers)
        .send()
        .await
        .map_err(|e| BackendError::from_reqwest(&e, "request"))
}

/// Turn a non-success response into a classified error, folding in the
/// service's XML error document when one is present.
pub async fn response_error(what: &str, response: Response) -> BackendError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    let detail = quick_xml::de::from_str::<ErrorResponse>(&body).map_or_else(
        |_| {
            let excerpt: String = body.chars().take(200).collect();
            if excerpt.is_empty() {
                String::new()
            } else {
                format!(": {excerpt}")
            }
        },
        |e| format!(": {} ({})", e.message, e.code),
    );

    BackendError::from_status(status, format!("{what}: HTTP {status}{detail}"))
}
