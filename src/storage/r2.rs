//! S3-compatible blob backend for Cloudflare R2.
//!
//! Talks the S3 REST API directly over `reqwest` with SigV4 request
//! signing (region `auto`, service `s3`). Puts always carry an explicit
//! `Content-Length` (reqwest sets it for byte bodies); R2 rejects
//! unsized streaming uploads.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::{BlobStore, KeyPage, StoreError};

type HmacSha256 = Hmac<Sha256>;

const REGION: &str = "auto";
const SERVICE: &str = "s3";

/// Credentials and addressing for one R2 bucket.
#[derive(Debug, Clone)]
pub struct R2Config {
    pub account_id: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
}

impl R2Config {
    fn host(&self) -> String {
        format!("{}.r2.cloudflarestorage.com", self.account_id)
    }
}

pub struct R2BlobStore {
    config: R2Config,
    client: reqwest::Client,
}

impl R2BlobStore {
    pub fn new(config: R2Config, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    fn object_path(&self, key: &str) -> String {
        format!(
            "/{}/{}",
            uri_encode(&self.config.bucket, false),
            uri_encode(key, false)
        )
    }

    /// Issue one signed request and return (status, body).
    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, &str)],
        body: Vec<u8>,
    ) -> Result<(u16, Vec<u8>), StoreError> {
        let host = self.config.host();
        let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let date = &timestamp[..8];
        let payload_hash = hex::encode(Sha256::digest(&body));

        let canonical_query = canonical_query_string(query);
        let canonical_headers = format!(
            "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
            host, payload_hash, timestamp
        );
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            path,
            canonical_query,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let scope = format!("{}/{}/{}/aws4_request", date, REGION, SERVICE);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            timestamp,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signature = hex::encode(signing_key(
            &self.config.secret_access_key,
            date,
            string_to_sign.as_bytes(),
        ));
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.config.access_key_id, scope, signed_headers, signature
        );

        let mut url = format!("https://{}{}", host, path);
        if !canonical_query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query);
        }

        let response = self
            .client
            .request(method, &url)
            .header("x-amz-date", &timestamp)
            .header("x-amz-content-sha256", &payload_hash)
            .header("authorization", &authorization)
            .body(body)
            .send()
            .await
            .map_err(|e| StoreError::Http(e.to_string()))?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| StoreError::Http(e.to_string()))?;
        Ok((status, bytes.to_vec()))
    }
}

#[async_trait]
impl BlobStore for R2BlobStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.object_path(key);
        let (status, body) = self
            .signed_request(reqwest::Method::GET, &path, &[], Vec::new())
            .await?;
        match status {
            200 => Ok(Some(body)),
            404 => Ok(None),
            _ => Err(StoreError::UnexpectedStatus {
                status,
                key: key.to_string(),
            }),
        }
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.object_path(key);
        let (status, _) = self
            .signed_request(reqwest::Method::PUT, &path, &[], bytes.to_vec())
            .await?;
        if status == 200 {
            Ok(())
        } else {
            Err(StoreError::UnexpectedStatus {
                status,
                key: key.to_string(),
            })
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.object_path(key);
        let (status, _) = self
            .signed_request(reqwest::Method::HEAD, &path, &[], Vec::new())
            .await?;
        match status {
            200 => Ok(true),
            404 => Ok(false),
            _ => Err(StoreError::UnexpectedStatus {
                status,
                key: key.to_string(),
            }),
        }
    }

    async fn list_page(
        &self,
        prefix: &str,
        token: Option<&str>,
    ) -> Result<KeyPage, StoreError> {
        let path = format!("/{}", uri_encode(&self.config.bucket, false));
        let mut query: Vec<(&str, &str)> = vec![("list-type", "2"), ("prefix", prefix)];
        if let Some(token) = token {
            query.push(("continuation-token", token));
        }
        let (status, body) = self
            .signed_request(reqwest::Method::GET, &path, &query, Vec::new())
            .await?;
        if status != 200 {
            return Err(StoreError::UnexpectedStatus {
                status,
                key: prefix.to_string(),
            });
        }

        let xml = String::from_utf8_lossy(&body);
        let keys = extract_tag_values(&xml, "Key")
            .into_iter()
            .map(|k| xml_unescape(&k))
            .collect();
        let next_token = extract_tag_values(&xml, "NextContinuationToken")
            .into_iter()
            .next()
            .map(|t| xml_unescape(&t));

        Ok(KeyPage { keys, next_token })
    }
}

/// SigV4 key derivation chain ending in the request signature.
fn signing_key(secret: &str, date: &str, string_to_sign: &[u8]) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, REGION.as_bytes());
    let k_service = hmac_sha256(&k_region, SERVICE.as_bytes());
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    hmac_sha256(&k_signing, string_to_sign)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC-SHA256 accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// RFC 3986 encoding as SigV4 requires: unreserved characters pass
/// through, `/` passes through in paths but not in query values.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Canonical query string: pairs sorted by name, values encoded.
fn canonical_query_string(query: &[(&str, &str)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (uri_encode(k, true), uri_encode(v, true)))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Pull every `<tag>value</tag>` occurrence out of a listing response.
///
/// ListObjectsV2 responses are flat enough that a targeted scan beats
/// pulling in an XML parser for two tag names.
fn extract_tag_values(xml: &str, tag: &str) -> Vec<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut values = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        rest = &rest[start + open.len()..];
        let Some(end) = rest.find(&close) else { break };
        values.push(rest[..end].to_string());
        rest = &rest[end + close.len()..];
    }
    values
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
