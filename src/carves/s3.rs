//! S3 object storage.
//!
//! `ObjectStore` is the narrow surface the carve code needs: single puts for
//! blocks, a server-side multipart copy to stitch them, and pre-signed GETs
//! for downloads. `S3Client` implements it over the REST API with SigV4.

use crate::error::{FleetError, FleetResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use regex::Regex;
use reqwest::Method;
use sha2::{Digest, Sha256};
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

pub const PRESIGN_EXPIRY: Duration = Duration::from_secs(300);
const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    async fn put_object(&self, key: &str, body: Vec<u8>) -> FleetResult<()>;

    async fn delete_object(&self, key: &str) -> FleetResult<()>;

    /// Returns the upload id.
    async fn create_multipart_upload(&self, key: &str) -> FleetResult<String>;

    /// Copies `source_key` of the same bucket into part `part_number`. Returns the part ETag.
    async fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        source_key: &str,
    ) -> FleetResult<String>;

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> FleetResult<()>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> FleetResult<()>;

    fn presign_get(&self, key: &str, expires: Duration) -> FleetResult<String>;
}

/// `env:uuid:session:blockid`
pub fn block_key(env: &str, uuid: &str, session_id: &str, block_id: u32) -> String {
    format!("{}:{}:{}:{}", env, uuid, session_id, block_id)
}

/// `env:uuid:session:path.tar[.zst]`
pub fn archive_key(env: &str, uuid: &str, session_id: &str, path: &str, extension: &str) -> String {
    format!("{}:{}:{}:{}{}", env, uuid, session_id, path, extension)
}

pub fn s3_url(bucket: &str, key: &str) -> String {
    format!("s3://{}/{}", bucket, key)
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Path-style endpoint; `https://s3.<region>.amazonaws.com` when absent.
    pub endpoint: Option<String>,
    pub access_key: String,
    pub secret_key: String,
}

/// S3 REST client. Connection failures are retried with backoff; any HTTP
/// error status is returned to the caller as is.
pub struct S3Client {
    http: reqwest::Client,
    config: S3Config,
    endpoint: String,
    host: String,
    attempts: usize,
    timeout: Duration,
}

impl S3Client {
    pub fn new(config: S3Config) -> FleetResult<Self> {
        if config.bucket.is_empty() {
            return Err(FleetError::Malformed("S3 bucket is required".to_string()));
        }
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", config.region))
            .trim_end_matches('/')
            .to_string();
        let url = reqwest::Url::parse(&endpoint)
            .map_err(|e| FleetError::Malformed(format!("S3 endpoint {}: {}", endpoint, e)))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(FleetError::Malformed(format!("S3 endpoint {} has no host", endpoint)))
            }
        };

        Ok(Self {
            http: reqwest::Client::new(),
            config,
            endpoint,
            host,
            attempts: 3,
            timeout: Duration::from_secs(30),
        })
    }

    fn canonical_path(&self, key: &str) -> String {
        format!("/{}/{}", uri_encode(&self.config.bucket, false), uri_encode(key, false))
    }

    fn signer(&self) -> Signer<'_> {
        Signer {
            access_key: &self.config.access_key,
            secret_key: &self.config.secret_key,
            region: &self.config.region,
            host: &self.host,
        }
    }

    /// Signs and sends one request, retrying only when it never reached the server.
    async fn send(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, &str)],
        extra_headers: &[(&str, String)],
        body: Vec<u8>,
    ) -> FleetResult<String> {
        let path = self.canonical_path(key);
        let query_string = canonical_query(query);
        let url = if query_string.is_empty() {
            format!("{}{}", self.endpoint, path)
        } else {
            format!("{}{}?{}", self.endpoint, path, query_string)
        };
        let payload_hash = hex::encode(Sha256::digest(&body));

        let mut delay_ms = 150u64;
        for attempt in 0..self.attempts {
            let now = Utc::now();
            let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
            let mut headers: Vec<(String, String)> = vec![
                ("x-amz-content-sha256".to_string(), payload_hash.clone()),
                ("x-amz-date".to_string(), amz_date),
            ];
            for (name, value) in extra_headers {
                headers.push((name.to_ascii_lowercase(), value.clone()));
            }
            let authorization =
                self.signer()
                    .authorization(method.as_str(), &path, &query_string, &headers, &payload_hash, now);

            let mut request = self
                .http
                .request(method.clone(), &url)
                .timeout(self.timeout)
                .header("authorization", authorization);
            for (name, value) in &headers {
                request = request.header(name.as_str(), value.as_str());
            }

            match request.body(body.clone()).send().await {
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await?;
                    if !status.is_success() {
                        return Err(FleetError::ObjectStore(format!(
                            "{} {} failed: {} {}",
                            method,
                            key,
                            status,
                            extract_tag(&text, "Code").unwrap_or_default()
                        )));
                    }
                    return Ok(text);
                }
                Err(e) => {
                    if attempt + 1 == self.attempts {
                        return Err(e.into());
                    }
                    tracing::warn!("S3 {} {} attempt {} failed: {}", method, key, attempt + 1, e);
                    // Simple jitter to prevent thundering herd
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(FleetError::ObjectStore("retry attempts exhausted".to_string()))
    }

    pub(crate) fn presign_at(&self, key: &str, expires: Duration, now: DateTime<Utc>) -> String {
        let path = self.canonical_path(key);
        let signer = self.signer();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let credential = format!("{}/{}", self.config.access_key, signer.scope(now));
        let expires = expires.as_secs().to_string();
        let params = [
            ("X-Amz-Algorithm", ALGORITHM),
            ("X-Amz-Credential", credential.as_str()),
            ("X-Amz-Date", amz_date.as_str()),
            ("X-Amz-Expires", expires.as_str()),
            ("X-Amz-SignedHeaders", "host"),
        ];
        let query_string = canonical_query(&params);
        let signature = signer.signature("GET", &path, &query_string, &[], UNSIGNED_PAYLOAD, now);
        format!(
            "{}{}?{}&X-Amz-Signature={}",
            self.endpoint, path, query_string, signature
        )
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    fn bucket(&self) -> &str {
        &self.config.bucket
    }

    async fn put_object(&self, key: &str, body: Vec<u8>) -> FleetResult<()> {
        tracing::debug!("S3 put {} ({} bytes)", key, body.len());
        self.send(Method::PUT, key, &[], &[], body).await?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> FleetResult<()> {
        self.send(Method::DELETE, key, &[], &[], Vec::new()).await?;
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> FleetResult<String> {
        let body = self
            .send(Method::POST, key, &[("uploads", "")], &[], Vec::new())
            .await?;
        extract_tag(&body, "UploadId").ok_or_else(|| {
            FleetError::ObjectStore(format!("no UploadId in CreateMultipartUpload response for {}", key))
        })
    }

    async fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        source_key: &str,
    ) -> FleetResult<String> {
        let part = part_number.to_string();
        let source = format!("/{}/{}", uri_encode(&self.config.bucket, false), uri_encode(source_key, false));
        let body = self
            .send(
                Method::PUT,
                key,
                &[("partNumber", part.as_str()), ("uploadId", upload_id)],
                &[("x-amz-copy-source", source)],
                Vec::new(),
            )
            .await?;
        extract_tag(&body, "ETag").ok_or_else(|| {
            FleetError::ObjectStore(format!("no ETag for part {} of {}", part_number, key))
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> FleetResult<()> {
        self.send(
            Method::POST,
            key,
            &[("uploadId", upload_id)],
            &[("content-type", "application/xml".to_string())],
            complete_body(parts).into_bytes(),
        )
        .await?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> FleetResult<()> {
        self.send(Method::DELETE, key, &[("uploadId", upload_id)], &[], Vec::new())
            .await?;
        Ok(())
    }

    fn presign_get(&self, key: &str, expires: Duration) -> FleetResult<String> {
        Ok(self.presign_at(key, expires, Utc::now()))
    }
}

/// SigV4 request signer for the `s3` service.
struct Signer<'a> {
    access_key: &'a str,
    secret_key: &'a str,
    region: &'a str,
    host: &'a str,
}

impl Signer<'_> {
    fn scope(&self, now: DateTime<Utc>) -> String {
        format!("{}/{}/s3/aws4_request", now.format("%Y%m%d"), self.region)
    }

    /// `headers` are lowercase and exclude `host`, which is always signed.
    fn signature(
        &self,
        method: &str,
        path: &str,
        query_string: &str,
        headers: &[(String, String)],
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> String {
        let mut all: Vec<(String, String)> = headers.to_vec();
        all.push(("host".to_string(), self.host.to_string()));
        all.sort();
        let canonical_headers: String = all
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
            .collect();
        let signed_headers = signed_header_names(&all);

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, query_string, canonical_headers, signed_headers, payload_hash
        );
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            now.format("%Y%m%dT%H%M%SZ"),
            self.scope(now),
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let date = now.format("%Y%m%d").to_string();
        let k_date = hmac(format!("AWS4{}", self.secret_key).as_bytes(), date.as_bytes());
        let k_region = hmac(&k_date, self.region.as_bytes());
        let k_service = hmac(&k_region, b"s3");
        let k_signing = hmac(&k_service, b"aws4_request");
        hex::encode(hmac(&k_signing, string_to_sign.as_bytes()))
    }

    fn authorization(
        &self,
        method: &str,
        path: &str,
        query_string: &str,
        headers: &[(String, String)],
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> String {
        let mut all: Vec<(String, String)> = headers.to_vec();
        all.push(("host".to_string(), self.host.to_string()));
        all.sort();
        format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM,
            self.access_key,
            self.scope(now),
            signed_header_names(&all),
            self.signature(method, path, query_string, headers, payload_hash, now)
        )
    }
}

fn signed_header_names(sorted: &[(String, String)]) -> String {
    sorted
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";")
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// RFC 3986 encoding as SigV4 expects it. `/` is kept in paths.
pub(crate) fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

pub(crate) fn canonical_query(params: &[(&str, &str)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (uri_encode(k, true), uri_encode(v, true)))
        .collect();
    encoded.sort();
    encoded
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn complete_body(parts: &[CompletedPart]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for part in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.part_number, part.etag
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

/// Text of the first `<tag>` element, with quote entities unescaped.
pub(crate) fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let re = Regex::new(&format!("<{0}>([^<]*)</{0}>", regex::escape(tag))).ok()?;
    re.captures(xml)
        .map(|c| c[1].replace("&quot;", "\"").replace("&#34;", "\""))
}
