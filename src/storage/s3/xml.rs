//! XML bodies of the S3 wire protocol: ListObjectsV2 and multipart upload.

use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::{Error, Result};

/// One `<Contents>` element of a ListObjectsV2 response.
#[derive(Debug, Clone, PartialEq)]
pub struct ListedObject {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    /// ETag with surrounding quotes stripped. Opaque equality token.
    pub etag: String,
}

/// One page of a ListObjectsV2 response.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ListedObject>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
}

fn malformed(what: &str) -> Error {
    Error::network(format!("malformed S3 response: {what}"))
}

/// Parse a ListObjectsV2 response page.
pub fn parse_list_response(xml: &str) -> Result<ListPage> {
    let mut reader = Reader::from_str(xml);
    let mut page = ListPage::default();

    let mut in_contents = false;
    let mut current_tag: Option<String> = None;
    let mut key = String::new();
    let mut size = 0u64;
    let mut last_modified: Option<DateTime<Utc>> = None;
    let mut etag = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if name == "Contents" {
                    in_contents = true;
                    key.clear();
                    size = 0;
                    last_modified = None;
                    etag.clear();
                } else {
                    current_tag = Some(name);
                }
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|_| malformed("unescapable text"))?
                    .into_owned();
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                match current_tag.as_deref() {
                    Some("Key") if in_contents => key = text.to_string(),
                    Some("Size") if in_contents => {
                        size = text.parse().map_err(|_| malformed("non-numeric Size"))?;
                    }
                    Some("LastModified") if in_contents => {
                        let parsed = DateTime::parse_from_rfc3339(text)
                            .map_err(|_| malformed("bad LastModified timestamp"))?;
                        last_modified = Some(parsed.with_timezone(&Utc));
                    }
                    Some("ETag") if in_contents => {
                        etag = text.trim_matches('"').to_string();
                    }
                    Some("IsTruncated") => page.is_truncated = text == "true",
                    Some("NextContinuationToken") => {
                        page.next_continuation_token = Some(text.to_string());
                    }
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                let name = e.name();
                if name.as_ref() == b"Contents" {
                    in_contents = false;
                    if key.is_empty() {
                        return Err(malformed("Contents without Key"));
                    }
                    page.objects.push(ListedObject {
                        key: std::mem::take(&mut key),
                        size,
                        last_modified: last_modified.take().unwrap_or_else(Utc::now),
                        etag: std::mem::take(&mut etag),
                    });
                }
                current_tag = None;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(malformed(&e.to_string())),
        }
    }

    Ok(page)
}

/// Pull the `<UploadId>` out of an InitiateMultipartUpload response.
pub fn parse_upload_id(xml: &str) -> Result<String> {
    parse_single_field(xml, "UploadId").ok_or_else(|| malformed("missing UploadId"))
}

/// Pull the final `<ETag>` out of a CompleteMultipartUpload response.
pub fn parse_completed_etag(xml: &str) -> Result<String> {
    parse_single_field(xml, "ETag")
        .map(|etag| etag.trim_matches('"').to_string())
        .ok_or_else(|| malformed("missing ETag in completion response"))
}

fn parse_single_field(xml: &str, field: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    let mut in_field = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                in_field = e.name().as_ref() == field.as_bytes();
            }
            Ok(Event::Text(t)) if in_field => {
                let text = t.unescape().ok()?.trim().to_string();
                if !text.is_empty() {
                    return Some(text);
                }
            }
            Ok(Event::End(_)) => in_field = false,
            Ok(Event::Eof) => return None,
            Ok(_) => {}
            Err(_) => return None,
        }
    }
}

/// Compose the CompleteMultipartUpload request body. ETags are listed in
/// part order, 1-based.
pub fn compose_complete_multipart(etags: &[String]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for (idx, etag) in etags.iter().enumerate() {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>\"{}\"</ETag></Part>",
            idx + 1,
            etag.trim_matches('"'),
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}
