//! S3-compatible object storage backend.
//!
//! Talks to the S3 REST API directly over HTTP, with AWS Signature V4
//! request signing implemented in this module. Blob serving hands the
//! client a redirect to a presigned URL with a short TTL (or the public
//! object URL when no credentials are configured), so layer bytes never
//! flow through the registry process.
//!
//! Uploads stream through a bounded channel into either a single PUT
//! (small blobs) or a multipart upload, keeping memory usage capped at a
//! few part buffers regardless of layer size.

use std::io::{self, Write};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use nixery_core::error::{NixeryError, Result};

use super::{Persister, ServeOutcome, StorageBackend};

/// Part size for multipart uploads. Blobs below this go up in a single
/// PUT.
const PART_SIZE: usize = 8 * 1024 * 1024;

/// Validity of presigned blob URLs.
const PRESIGN_TTL_SECS: u64 = 300;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

#[derive(Clone)]
struct Credentials {
    access_key: String,
    secret_key: String,
}

pub struct S3Backend {
    bucket: String,
    region: String,
    endpoint: Option<String>,
    credentials: Option<Credentials>,
    presign: bool,
    client: reqwest::Client,
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .expect("HMAC-SHA256 accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn signature(secret_key: &str, date: &str, region: &str, string_to_sign: &str) -> String {
    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, b"s3");
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()))
}

/// Pull the text content of the first occurrence of an XML tag out of an
/// S3 response. The handful of fields we need does not justify an XML
/// parser dependency.
fn extract_xml_tag<'a>(body: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(&body[start..end])
}

/// Writes bytes into the upload channel; runs on a blocking thread while
/// the async side drains the channel into the S3 API.
struct ChannelWriter {
    tx: mpsc::Sender<Bytes>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Bytes::copy_from_slice(buf))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "upload aborted"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl S3Backend {
    pub fn new(
        bucket: impl Into<String>,
        region: impl Into<String>,
        endpoint: Option<String>,
        access_key: Option<String>,
        secret_key: Option<String>,
        presign: bool,
    ) -> S3Backend {
        let credentials = match (access_key, secret_key) {
            (Some(access_key), Some(secret_key)) => Some(Credentials {
                access_key,
                secret_key,
            }),
            _ => None,
        };

        S3Backend {
            bucket: bucket.into(),
            region: region.into(),
            endpoint,
            credentials,
            presign,
            client: reqwest::Client::new(),
        }
    }

    /// Construct the backend from `S3_BUCKET`, `AWS_REGION`,
    /// `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, `S3_ENDPOINT` and
    /// `S3_USE_PRESIGNED_URLS`.
    pub fn from_env() -> Result<S3Backend> {
        let bucket = std::env::var("S3_BUCKET")
            .ok()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| {
                NixeryError::Config("S3_BUCKET must be configured for S3 storage".to_string())
            })?;

        let region =
            std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string());

        Ok(S3Backend::new(
            bucket,
            region,
            std::env::var("S3_ENDPOINT").ok().filter(|e| !e.is_empty()),
            std::env::var("AWS_ACCESS_KEY_ID").ok().filter(|k| !k.is_empty()),
            std::env::var("AWS_SECRET_ACCESS_KEY").ok().filter(|k| !k.is_empty()),
            std::env::var("S3_USE_PRESIGNED_URLS").as_deref() != Ok("false"),
        ))
    }

    fn scheme(&self) -> &str {
        match &self.endpoint {
            Some(e) if e.starts_with("http://") => "http",
            _ => "https",
        }
    }

    fn host(&self) -> String {
        match &self.endpoint {
            // Custom endpoints (minio and friends) use path-style access
            Some(e) => e
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string(),
            None => format!("{}.s3.{}.amazonaws.com", self.bucket, self.region),
        }
    }

    fn canonical_uri(&self, key: &str) -> String {
        match &self.endpoint {
            Some(_) => format!("/{}/{}", self.bucket, key),
            None => format!("/{}", key),
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}://{}{}", self.scheme(), self.host(), self.canonical_uri(key))
    }

    /// Produce the signing headers for a request, or nothing when no
    /// credentials are configured.
    fn auth_headers(
        &self,
        method: &str,
        key: &str,
        query: &str,
        amz_headers: &[(&str, String)],
        now: DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let creds = match &self.credentials {
            Some(c) => c,
            None => return Vec::new(),
        };

        let timestamp = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let mut headers: Vec<(String, String)> = vec![
            ("host".to_string(), self.host()),
            ("x-amz-content-sha256".to_string(), UNSIGNED_PAYLOAD.to_string()),
            ("x-amz-date".to_string(), timestamp.clone()),
        ];
        for (name, value) in amz_headers {
            headers.push((name.to_string(), value.clone()));
        }
        headers.sort();

        let canonical_headers: String = headers
            .iter()
            .map(|(n, v)| format!("{}:{}\n", n, v))
            .collect();
        let signed_headers = headers
            .iter()
            .map(|(n, _)| n.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method,
            self.canonical_uri(key),
            query,
            canonical_headers,
            signed_headers,
            UNSIGNED_PAYLOAD
        );

        let scope = format!("{}/{}/s3/aws4_request", date, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            timestamp,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let sig = signature(&creds.secret_key, &date, &self.region, &string_to_sign);
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key, scope, signed_headers, sig
        );

        let mut result: Vec<(String, String)> = headers
            .into_iter()
            .filter(|(n, _)| n != "host")
            .collect();
        result.push(("authorization".to_string(), authorization));
        result
    }

    /// Build a presigned GET URL for the given key, valid for
    /// `expires` seconds from `now`.
    fn presign_get(&self, key: &str, expires: u64, now: DateTime<Utc>) -> Option<String> {
        let creds = self.credentials.as_ref()?;

        let timestamp = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let scope = format!("{}/{}/s3/aws4_request", date, self.region);

        // Already in canonical (sorted) parameter order
        let query = format!(
            "X-Amz-Algorithm=AWS4-HMAC-SHA256&X-Amz-Credential={}&X-Amz-Date={}&X-Amz-Expires={}&X-Amz-SignedHeaders=host",
            urlencoding::encode(&format!("{}/{}", creds.access_key, scope)),
            timestamp,
            expires,
        );

        let canonical_request = format!(
            "GET\n{}\n{}\nhost:{}\n\nhost\n{}",
            self.canonical_uri(key),
            query,
            self.host(),
            UNSIGNED_PAYLOAD
        );

        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            timestamp,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let sig = signature(&creds.secret_key, &date, &self.region, &string_to_sign);

        Some(format!(
            "{}?{}&X-Amz-Signature={}",
            self.object_url(key),
            query,
            sig
        ))
    }

    fn request(
        &self,
        method: reqwest::Method,
        key: &str,
        query: &str,
        amz_headers: &[(&str, String)],
    ) -> reqwest::RequestBuilder {
        let url = if query.is_empty() {
            self.object_url(key)
        } else {
            format!("{}?{}", self.object_url(key), query)
        };

        let mut req = self.client.request(method.clone(), url);
        let auth = self.auth_headers(method.as_str(), key, query, amz_headers, Utc::now());
        if auth.is_empty() {
            // Anonymous access: the amz headers still have to go out
            for (name, value) in amz_headers {
                req = req.header(*name, value);
            }
        } else {
            for (name, value) in auth {
                req = req.header(name, value);
            }
        }
        req
    }

    async fn expect_success(
        resp: reqwest::Response,
        action: &str,
        key: &str,
    ) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(NixeryError::Storage(format!(
            "S3 {} for '{}' failed with {}: {}",
            action,
            key,
            status,
            body.chars().take(200).collect::<String>()
        )))
    }

    async fn put_object(&self, key: &str, content_type: &str, body: Bytes) -> Result<()> {
        let resp = self
            .request(reqwest::Method::PUT, key, "", &[])
            .header("content-type", content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| NixeryError::Storage(format!("S3 upload of '{}' failed: {}", key, e)))?;

        Self::expect_success(resp, "upload", key).await?;
        Ok(())
    }

    async fn create_multipart(&self, key: &str, content_type: &str) -> Result<String> {
        let resp = self
            .request(reqwest::Method::POST, key, "uploads=", &[])
            .header("content-type", content_type)
            .send()
            .await
            .map_err(|e| {
                NixeryError::Storage(format!("S3 multipart initiate for '{}' failed: {}", key, e))
            })?;

        let body = Self::expect_success(resp, "multipart initiate", key)
            .await?
            .text()
            .await
            .map_err(|e| NixeryError::Storage(format!("S3 response read failed: {}", e)))?;

        extract_xml_tag(&body, "UploadId")
            .map(|id| id.to_string())
            .ok_or_else(|| {
                NixeryError::Storage(format!(
                    "S3 multipart initiate for '{}' returned no upload id",
                    key
                ))
            })
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String> {
        let query = format!(
            "partNumber={}&uploadId={}",
            part_number,
            urlencoding::encode(upload_id)
        );

        let resp = self
            .request(reqwest::Method::PUT, key, &query, &[])
            .body(body)
            .send()
            .await
            .map_err(|e| {
                NixeryError::Storage(format!(
                    "S3 part {} upload for '{}' failed: {}",
                    part_number, key, e
                ))
            })?;

        let resp = Self::expect_success(resp, "part upload", key).await?;
        resp.headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .ok_or_else(|| {
                NixeryError::Storage(format!(
                    "S3 part {} upload for '{}' returned no etag",
                    part_number, key
                ))
            })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(i32, String)],
    ) -> Result<()> {
        let mut body = String::from("<CompleteMultipartUpload>");
        for (number, etag) in parts {
            body.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
                number, etag
            ));
        }
        body.push_str("</CompleteMultipartUpload>");

        let query = format!("uploadId={}", urlencoding::encode(upload_id));
        let resp = self
            .request(reqwest::Method::POST, key, &query, &[])
            .body(body)
            .send()
            .await
            .map_err(|e| {
                NixeryError::Storage(format!("S3 multipart complete for '{}' failed: {}", key, e))
            })?;

        Self::expect_success(resp, "multipart complete", key).await?;
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) {
        let query = format!("uploadId={}", urlencoding::encode(upload_id));
        let result = self
            .request(reqwest::Method::DELETE, key, &query, &[])
            .send()
            .await;

        if let Err(e) = result {
            tracing::warn!(key = %key, error = %e, "failed to abort S3 multipart upload");
        }
    }

    async fn upload_stream(
        &self,
        key: &str,
        content_type: &str,
        rx: &mut mpsc::Receiver<Bytes>,
    ) -> Result<()> {
        // Fill the first part; if the stream ends before it does, one
        // plain PUT suffices.
        let mut first = Vec::new();
        let closed = loop {
            if first.len() >= PART_SIZE {
                break false;
            }
            match rx.recv().await {
                Some(chunk) => first.extend_from_slice(&chunk),
                None => break true,
            }
        };

        if closed {
            return self.put_object(key, content_type, Bytes::from(first)).await;
        }

        let upload_id = self.create_multipart(key, content_type).await?;

        let upload = async {
            let mut parts = Vec::new();
            let mut part_number = 1i32;
            let mut current = first;

            loop {
                let etag = self
                    .upload_part(key, &upload_id, part_number, Bytes::from(current))
                    .await?;
                parts.push((part_number, etag));
                part_number += 1;

                current = Vec::new();
                let mut closed = false;
                while current.len() < PART_SIZE {
                    match rx.recv().await {
                        Some(chunk) => current.extend_from_slice(&chunk),
                        None => {
                            closed = true;
                            break;
                        }
                    }
                }

                if closed {
                    if !current.is_empty() {
                        let etag = self
                            .upload_part(key, &upload_id, part_number, Bytes::from(current))
                            .await?;
                        parts.push((part_number, etag));
                    }
                    return self.complete_multipart(key, &upload_id, &parts).await;
                }
            }
        };

        match upload.await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Leave no half-assembled object behind
                self.abort_multipart(key, &upload_id).await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> String {
        format!("S3 ({})", self.bucket)
    }

    async fn persist(
        &self,
        path: &str,
        content_type: &str,
        writer: Persister,
    ) -> Result<(String, u64)> {
        let (tx, mut rx) = mpsc::channel::<Bytes>(4);

        let write_task =
            tokio::task::spawn_blocking(move || writer(&mut ChannelWriter { tx }));

        let upload_result = self.upload_stream(path, content_type, &mut rx).await;

        // Closing the receiver unblocks the writer if the upload died
        // before consuming everything.
        drop(rx);

        let writer_result = write_task
            .await
            .map_err(|e| NixeryError::Storage(format!("persist task failed: {}", e)))?;

        match (writer_result, upload_result) {
            (Ok(result), Ok(())) => Ok(result),
            (Err(e), _) => Err(e),
            (_, Err(e)) => Err(e),
        }
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        let resp = self
            .request(reqwest::Method::GET, path, "", &[])
            .send()
            .await
            .map_err(|e| NixeryError::Storage(format!("S3 fetch of '{}' failed: {}", path, e)))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(NixeryError::NotFound {
                path: path.to_string(),
            });
        }

        let resp = Self::expect_success(resp, "fetch", path).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| NixeryError::Storage(format!("S3 read of '{}' failed: {}", path, e)))?;

        Ok(bytes.to_vec())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let source = format!("/{}/{}", self.bucket, from);
        let resp = self
            .request(
                reqwest::Method::PUT,
                to,
                "",
                &[("x-amz-copy-source", source)],
            )
            .send()
            .await
            .map_err(|e| {
                NixeryError::Storage(format!("S3 copy {} -> {} failed: {}", from, to, e))
            })?;

        Self::expect_success(resp, "copy", to).await?;

        // The copy is what matters; a stale staging object only wastes
        // space.
        let delete = self
            .request(reqwest::Method::DELETE, from, "", &[])
            .send()
            .await;
        match delete {
            Ok(resp) if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND => {
                tracing::warn!(from = %from, status = %resp.status(), "failed to delete staging object after copy");
            }
            Err(e) => {
                tracing::warn!(from = %from, error = %e, "failed to delete staging object after copy");
            }
            _ => {}
        }

        Ok(())
    }

    async fn serve(&self, digest: &str) -> Result<ServeOutcome> {
        let key = format!("layers/{}", digest);

        let url = if self.presign {
            self.presign_get(&key, PRESIGN_TTL_SECS, Utc::now())
                .unwrap_or_else(|| self.object_url(&key))
        } else {
            self.object_url(&key)
        };

        tracing::debug!(layer = %digest, "redirecting blob request to S3");
        Ok(ServeOutcome::Redirect(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn backend_with_creds() -> S3Backend {
        S3Backend::new(
            "layer-bucket",
            "eu-central-1",
            None,
            Some("AKIDEXAMPLE".to_string()),
            Some("secret".to_string()),
            true,
        )
    }

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 21, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_virtual_hosted_url() {
        let backend = backend_with_creds();
        assert_eq!(
            backend.object_url("layers/abc"),
            "https://layer-bucket.s3.eu-central-1.amazonaws.com/layers/abc"
        );
    }

    #[test]
    fn test_path_style_url_with_endpoint() {
        let backend = S3Backend::new(
            "layer-bucket",
            "us-east-1",
            Some("http://localhost:9000".to_string()),
            None,
            None,
            false,
        );
        assert_eq!(
            backend.object_url("layers/abc"),
            "http://localhost:9000/layer-bucket/layers/abc"
        );
    }

    #[test]
    fn test_presigned_url_shape() {
        let backend = backend_with_creds();
        let url = backend
            .presign_get("layers/abc", 300, fixed_time())
            .unwrap();

        assert!(url.starts_with(
            "https://layer-bucket.s3.eu-central-1.amazonaws.com/layers/abc?X-Amz-Algorithm=AWS4-HMAC-SHA256"
        ));
        assert!(url.contains("X-Amz-Date=20240521T120000Z"));
        assert!(url.contains("X-Amz-Expires=300"));
        assert!(url.contains("X-Amz-SignedHeaders=host"));

        let sig = url.split("X-Amz-Signature=").nth(1).unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn test_presigning_is_deterministic_for_fixed_time() {
        let backend = backend_with_creds();
        let a = backend.presign_get("layers/abc", 300, fixed_time());
        let b = backend.presign_get("layers/abc", 300, fixed_time());
        assert_eq!(a, b);
    }

    #[test]
    fn test_presign_requires_credentials() {
        let backend = S3Backend::new("bucket", "us-east-1", None, None, None, true);
        assert!(backend.presign_get("layers/abc", 300, fixed_time()).is_none());
    }

    #[test]
    fn test_auth_headers_cover_amz_headers() {
        let backend = backend_with_creds();
        let headers = backend.auth_headers(
            "PUT",
            "layers/new",
            "",
            &[("x-amz-copy-source", "/layer-bucket/staging/old".to_string())],
            fixed_time(),
        );

        let auth = headers
            .iter()
            .find(|(n, _)| n == "authorization")
            .map(|(_, v)| v.as_str())
            .unwrap();

        assert!(auth.contains("Credential=AKIDEXAMPLE/20240521/eu-central-1/s3/aws4_request"));
        assert!(auth.contains(
            "SignedHeaders=host;x-amz-content-sha256;x-amz-copy-source;x-amz-date"
        ));
    }

    #[test]
    fn test_anonymous_requests_are_unsigned() {
        let backend = S3Backend::new("bucket", "us-east-1", None, None, None, false);
        assert!(backend
            .auth_headers("GET", "layers/abc", "", &[], fixed_time())
            .is_empty());
    }

    #[test]
    fn test_extract_xml_tag() {
        let body = r#"<?xml version="1.0"?><InitiateMultipartUploadResult><Bucket>b</Bucket><Key>k</Key><UploadId>abc-123</UploadId></InitiateMultipartUploadResult>"#;
        assert_eq!(extract_xml_tag(body, "UploadId"), Some("abc-123"));
        assert_eq!(extract_xml_tag(body, "Missing"), None);
    }

    #[tokio::test]
    async fn test_serve_without_presigning_uses_public_url() {
        let backend = S3Backend::new(
            "public-bucket",
            "us-east-1",
            None,
            Some("ak".to_string()),
            Some("sk".to_string()),
            false,
        );

        match backend.serve("cafebabe").await.unwrap() {
            ServeOutcome::Redirect(url) => {
                assert_eq!(
                    url,
                    "https://public-bucket.s3.us-east-1.amazonaws.com/layers/cafebabe"
                );
            }
            other => panic!("expected redirect, got {:?}", other),
        }
    }
}
