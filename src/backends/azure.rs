//! Azure Blob Storage adapter.
//!
//! SharedKey authorization against the Blob REST API: Put Blob (BlockBlob),
//! Get Blob, List Blobs and Delete Blob. `AZURE_ACCOUNT_NAME` and
//! `AZURE_ACCOUNT_KEY` supply credentials; `AZURE_CUSTOM_ENDPOINT` redirects
//! to a compatible server such as Azurite (note that Azurite rejects `|` in
//! blob names, which is what `--separator` exists for).

use crate::backends::s3::request;
use crate::backends::s3::signature::{encode_key_path, parse_hex};
use crate::backends::{Backend, ObjectReader, ParsedUri, RemoteObject};
use crate::retry::BackendError;
use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use reqwest::{
    Client, Method, StatusCode,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use ring::hmac;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::{collections::BTreeMap, env, path::Path, time::Duration};
use tokio_util::io::StreamReader;
use url::Url;

const API_VERSION: &str = "2021-08-06";

pub struct AzureBackend {
    client: Client,
    endpoint: Url,
    account: String,
    key: SecretString,
    container: String,
}

impl AzureBackend {
    /// # Errors
    /// `Authz` on missing account credentials, `Permanent` on a bad endpoint.
    pub fn open(parsed: &ParsedUri, timeout: Duration) -> Result<Self, BackendError> {
        let account = env::var("AZURE_ACCOUNT_NAME")
            .map_err(|_| BackendError::Authz("AZURE_ACCOUNT_NAME is not set".to_string()))?;
        let key = env::var("AZURE_ACCOUNT_KEY")
            .map_err(|_| BackendError::Authz("AZURE_ACCOUNT_KEY is not set".to_string()))?;

        let endpoint = env::var("AZURE_CUSTOM_ENDPOINT")
            .unwrap_or_else(|_| format!("https://{account}.blob.core.windows.net"));
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| BackendError::Permanent(format!("endpoint {endpoint}: {e}")))?;

        Ok(Self {
            client: request::build_client(timeout)?,
            endpoint,
            account,
            key: SecretString::new(key.into()),
            container: parsed.container.clone(),
        })
    }

    fn blob_url(&self, key: &str, query: Option<&str>) -> Url {
        let mut url = self.endpoint.clone();
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!(
            "{base}/{}/{}",
            self.container,
            encode_key_path(key)
        ));
        url.set_query(query);
        url
    }

    fn container_url(&self, query: &str) -> Url {
        let mut url = self.endpoint.clone();
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base}/{}", self.container));
        url.set_query(Some(query));
        url
    }

    /// SharedKey authorization headers for one request.
    fn authorize(
        &self,
        method: &Method,
        url: &Url,
        content_length: u64,
        content_md5: &str,
        query_params: &BTreeMap<String, String>,
        blob_type: Option<&str>,
    ) -> Result<HeaderMap, BackendError> {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();

        let mut ms_headers: BTreeMap<String, String> = BTreeMap::new();
        ms_headers.insert("x-ms-date".to_string(), date);
        ms_headers.insert("x-ms-version".to_string(), API_VERSION.to_string());
        if let Some(blob_type) = blob_type {
            ms_headers.insert("x-ms-blob-type".to_string(), blob_type.to_string());
        }

        let string_to_sign = string_to_sign(
            method.as_str(),
            content_length,
            content_md5,
            &ms_headers,
            &canonicalized_resource(&self.account, url.path(), query_params),
        );

        let raw_key = Base64::decode_vec(self.key.expose_secret())
            .map_err(|e| BackendError::Authz(format!("AZURE_ACCOUNT_KEY is not base64: {e}")))?;
        let mac = hmac::sign(
            &hmac::Key::new(hmac::HMAC_SHA256, &raw_key),
            string_to_sign.as_bytes(),
        );
        let authorization = format!(
            "SharedKey {}:{}",
            self.account,
            Base64::encode_string(mac.as_ref())
        );

        let mut headers = HeaderMap::new();
        for (name, value) in &ms_headers {
            headers.insert(
                name.parse::<HeaderName>()
                    .map_err(|e| BackendError::Permanent(format!("header {name}: {e}")))?,
                value
                    .parse::<HeaderValue>()
                    .map_err(|e| BackendError::Permanent(format!("header {name}: {e}")))?,
            );
        }
        if !content_md5.is_empty() {
            headers.insert(
                "content-md5",
                content_md5
                    .parse::<HeaderValue>()
                    .map_err(|e| BackendError::Permanent(format!("content-md5: {e}")))?,
            );
        }
        headers.insert(
            "authorization",
            authorization
                .parse::<HeaderValue>()
                .map_err(|e| BackendError::Permanent(format!("authorization: {e}")))?,
        );

        Ok(headers)
    }

    async fn list_page(
        &self,
        prefix: &str,
        marker: Option<&str>,
    ) -> Result<EnumerationResults, BackendError> {
        let mut params: BTreeMap<String, String> = BTreeMap::new();
        params.insert("restype".into(), "container".into());
        params.insert("comp".into(), "list".into());
        if !prefix.is_empty() {
            params.insert("prefix".into(), prefix.into());
        }
        if let Some(marker) = marker {
            params.insert("marker".into(), marker.into());
        }

        let query = params
            .iter()
            .map(|(k, v)| {
                format!(
                    "{k}={}",
                    crate::backends::s3::signature::encode_query_component(v)
                )
            })
            .collect::<Vec<_>>()
            .join("&");

        let url = self.container_url(&query);
        let headers = self.authorize(&Method::GET, &url, 0, "", &params, None)?;

        let response = request::send_empty(&self.client, Method::GET, url, headers).await?;
        if !response.status().is_success() {
            return Err(request::response_error("list", response).await);
        }

        let body = response
            .text()
            .await
            .map_err(|e| BackendError::from_reqwest(&e, "list body"))?;

        // Azurite prepends a BOM
        quick_xml::de::from_str(body.trim_start_matches('\u{feff}'))
            .map_err(|e| BackendError::Permanent(format!("list response: {e}")))
    }
}

#[async_trait]
impl Backend for AzureBackend {
    fn scheme(&self) -> &'static str {
        "azure"
    }

    fn max_parallel_uploads(&self) -> usize {
        4
    }

    fn verifies_md5(&self) -> bool {
        true
    }

    async fn upload(
        &self,
        key: &str,
        source: &Path,
        size: u64,
        md5_hex: Option<&str>,
    ) -> Result<String, BackendError> {
        let md5_b64 = match md5_hex {
            Some(hex) => Base64::encode_string(&parse_hex(hex)?),
            None => String::new(),
        };

        let url = self.blob_url(key, None);
        let headers = self.authorize(
            &Method::PUT,
            &url,
            size,
            &md5_b64,
            &BTreeMap::new(),
            Some("BlockBlob"),
        )?;

        let response =
            request::send_file(&self.client, Method::PUT, url, headers, source, size).await?;
        if !response.status().is_success() {
            return Err(request::response_error("upload", response).await);
        }

        let echoed = response
            .headers()
            .get("content-md5")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if !md5_b64.is_empty() && !echoed.is_empty() && echoed != md5_b64 {
            return Err(BackendError::Transient(format!(
                "upload {key}: Content-MD5 {echoed} does not match {md5_b64}"
            )));
        }

        Ok(echoed)
    }

    async fn download(&self, key: &str) -> Result<ObjectReader, BackendError> {
        let url = self.blob_url(key, None);
        let headers = self.authorize(&Method::GET, &url, 0, "", &BTreeMap::new(), None)?;

        let response = request::send_empty(&self.client, Method::GET, url, headers).await?;
        if !response.status().is_success() {
            return Err(request::response_error(&format!("download {key}"), response).await);
        }

        let stream = response.bytes_stream().map_err(std::io::Error::other);

        Ok(Box::pin(StreamReader::new(stream)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>, BackendError> {
        let mut objects = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let page = self.list_page(prefix, marker.as_deref()).await?;

            for blob in page.blobs.items {
                objects.push(RemoteObject {
                    modified: parse_last_modified(&blob.properties.last_modified)?,
                    key: blob.name,
                    size: blob.properties.content_length,
                });
            }

            match page.next_marker.filter(|m| !m.is_empty()) {
                Some(next) => marker = Some(next),
                None => return Ok(objects),
            }
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<(), BackendError> {
        for key in keys {
            let url = self.blob_url(key, None);
            let headers = self.authorize(&Method::DELETE, &url, 0, "", &BTreeMap::new(), None)?;

            let response =
                request::send_empty(&self.client, Method::DELETE, url, headers).await?;

            if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
                return Err(request::response_error(&format!("delete {key}"), response).await);
            }
        }

        Ok(())
    }
}

fn string_to_sign(
    verb: &str,
    content_length: u64,
    content_md5: &str,
    ms_headers: &BTreeMap<String, String>,
    canonicalized_resource: &str,
) -> String {
    // since API version 2015-02-21 a zero Content-Length is an empty string
    let length = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };

    let canonicalized_headers: String = ms_headers
        .iter()
        .map(|(k, v)| format!("{k}:{v}\n"))
        .collect();

    // twelve signed slots: verb, encoding, language, length, md5, type, date,
    // four conditionals, range
    format!(
        "{verb}\n\n\n{length}\n{content_md5}\n\n\n\n\n\n\n\n{canonicalized_headers}{canonicalized_resource}"
    )
}

fn canonicalized_resource(
    account: &str,
    url_path: &str,
    query_params: &BTreeMap<String, String>,
) -> String {
    let mut resource = format!("/{account}{url_path}");

    for (name, value) in query_params {
        resource.push_str(&format!("\n{name}:{value}"));
    }

    resource
}

fn parse_last_modified(raw: &str) -> Result<DateTime<Utc>, BackendError> {
    DateTime::parse_from_rfc2822(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BackendError::Permanent(format!("bad Last-Modified {raw}: {e}")))
}

#[derive(Deserialize, Debug)]
struct EnumerationResults {
    #[serde(rename = "Blobs", default)]
    blobs: Blobs,
    #[serde(rename = "NextMarker", default)]
    next_marker: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct Blobs {
    #[serde(rename = "Blob", default)]
    items: Vec<Blob>,
}

#[derive(Deserialize, Debug)]
struct Blob {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Properties")]
    properties: Properties,
}

#[derive(Deserialize, Debug)]
struct Properties {
    #[serde(rename = "Last-Modified")]
    last_modified: String,
    #[serde(rename = "Content-Length")]
    content_length: u64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_string_to_sign_layout() {
        let mut ms = BTreeMap::new();
        ms.insert("x-ms-date".to_string(), "Wed, 09 Oct 2019 21:32:00 GMT".to_string());
        ms.insert("x-ms-version".to_string(), API_VERSION.to_string());

        let sts = string_to_sign("GET", 0, "", &ms, "/acct/container");

        assert_eq!(
            sts,
            "GET\n\n\n\n\n\n\n\n\n\n\n\n\
             x-ms-date:Wed, 09 Oct 2019 21:32:00 GMT\n\
             x-ms-version:2021-08-06\n\
             /acct/container"
        );
    }

    #[test]
    fn test_string_to_sign_put_with_length() {
        let ms = BTreeMap::new();
        let sts = string_to_sign("PUT", 1024, "bWQ1", &ms, "/acct/c/blob");
        assert!(sts.starts_with("PUT\n\n\n1024\nbWQ1\n"));
        assert!(sts.ends_with("/acct/c/blob"));
    }

    #[test]
    fn test_canonicalized_resource_with_query() {
        let mut params = BTreeMap::new();
        params.insert("comp".to_string(), "list".to_string());
        params.insert("restype".to_string(), "container".to_string());

        assert_eq!(
            canonicalized_resource("acct", "/container", &params),
            "/acct/container\ncomp:list\nrestype:container"
        );
    }

    #[test]
    fn test_list_xml_parses() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://acct.blob.core.windows.net/" ContainerName="c">
  <Blobs>
    <Blob>
      <Name>tank/data+a+b+0.zst</Name>
      <Properties>
        <Last-Modified>Wed, 09 Oct 2019 21:32:00 GMT</Last-Modified>
        <Content-Length>1456</Content-Length>
        <BlobType>BlockBlob</BlobType>
      </Properties>
    </Blob>
  </Blobs>
  <NextMarker />
</EnumerationResults>"#;

        let parsed: EnumerationResults = quick_xml::de::from_str(xml).unwrap();
        assert_eq!(parsed.blobs.items.len(), 1);
        assert_eq!(parsed.blobs.items[0].name, "tank/data+a+b+0.zst");
        assert_eq!(parsed.blobs.items[0].properties.content_length, 1456);
        assert!(parsed.next_marker.unwrap_or_default().is_empty());
    }

    #[test]
    fn test_parse_last_modified_rfc1123() {
        let dt = parse_last_modified("Wed, 09 Oct 2019 21:32:00 GMT").unwrap();
        assert_eq!(dt.timestamp(), 1_570_656_720);
    }
}
