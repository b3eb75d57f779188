//! XML response documents for the S3-compatible API.

use serde::Deserialize;

/// An individual object in a `ListBucketResult`.
#[derive(Deserialize, Debug, Clone)]
pub struct Object {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "LastModified")]
    pub last_modified: String,
    #[serde(rename = "ETag", default)]
    pub e_tag: Option<String>,
    #[serde(rename = "Size")]
    pub size: u64,
}

/// The parsed result of one `ListObjectsV2` page.
#[derive(Deserialize, Debug, Clone)]
pub struct ListBucketResult {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Prefix", default)]
    pub prefix: String,
    #[serde(rename = "IsTruncated", default)]
    pub is_truncated: bool,
    #[serde(rename = "NextContinuationToken", default)]
    pub next_continuation_token: Option<String>,
    #[serde(rename = "Contents", default)]
    pub contents: Vec<Object>,
}

#[derive(Deserialize, Debug)]
pub struct ErrorResponse {
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(rename = "Message")]
    pub message: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    const LISTING: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>backups</Name>
  <Prefix>tank/</Prefix>
  <KeyCount>2</KeyCount>
  <MaxKeys>1000</MaxKeys>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>token-1</NextContinuationToken>
  <Contents>
    <Key>tank/data|a|b|0.zst</Key>
    <LastModified>2026-07-30T17:50:30.000Z</LastModified>
    <ETag>&quot;fba9dede5f27731c9771645a39863328&quot;</ETag>
    <Size>434234</Size>
    <StorageClass>STANDARD</StorageClass>
  </Contents>
  <Contents>
    <Key>tank/data|a|b.manifest</Key>
    <LastModified>2026-07-30T17:51:00.000Z</LastModified>
    <Size>1201</Size>
  </Contents>
</ListBucketResult>"#;

    #[test]
    fn test_parse_list_bucket_result() {
        let parsed: ListBucketResult = quick_xml::de::from_str(LISTING).unwrap();
        assert_eq!(parsed.name, "backups");
        assert!(parsed.is_truncated);
        assert_eq!(parsed.next_continuation_token.as_deref(), Some("token-1"));
        assert_eq!(parsed.contents.len(), 2);
        assert_eq!(parsed.contents[0].key, "tank/data|a|b|0.zst");
        assert_eq!(parsed.contents[0].size, 434_234);
        assert_eq!(
            parsed.contents[0].e_tag.as_deref(),
            Some("\"fba9dede5f27731c9771645a39863328\"")
        );
        assert!(parsed.contents[1].e_tag.is_none());
    }

    #[test]
    fn test_parse_error_response() {
        let xml = r#"<?xml version="1.0"?>
<Error><Code>SlowDown</Code><Message>Reduce your request rate.</Message></Error>"#;
        let parsed: ErrorResponse = quick_xml::de::from_str(xml).unwrap();
        assert_eq!(parsed.code, "SlowDown");
        assert_eq!(parsed.message, "Reduce your request rate.");
    }
}
