//! Scoped S3 credential minting
//!
//! Presigned POST upload policies and presigned list URLs, computed locally
//! with SigV4. Upload credentials are scoped to a single folder prefix via a
//! starts-with policy condition; read credentials are scoped by the list
//! prefix. Both expire after their configured TTL.

use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::config::S3Config;

type HmacSha256 = Hmac<Sha256>;

/// Minimum and maximum accepted upload sizes (bytes)
const MIN_UPLOAD_BYTES: u64 = 1024;
const MAX_UPLOAD_BYTES: u64 = 5_368_709_120;

/// Presigned POST policy a miner uses to upload into its folder
#[derive(Debug, Clone, Serialize)]
pub struct UploadCredential {
    pub url: String,
    pub fields: BTreeMap<String, String>,
    pub expires_at: DateTime<Utc>,
}

/// Presigned list URL scoped to a folder prefix
#[derive(Debug, Clone, Serialize)]
pub struct ReadCredential {
    pub url: String,
    pub prefix: String,
    pub expires_at: DateTime<Utc>,
}

/// Options for read credential minting
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Group keys by this delimiter (folder-style listing)
    pub delimiter: Option<String>,
    pub max_keys: Option<u32>,
}

/// Credential-minting surface consumed by the gateway
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn mint_upload_credential(
        &self,
        path_prefix: &str,
        expiry_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<UploadCredential>;

    async fn mint_read_credential(
        &self,
        path_prefix: &str,
        options: &ReadOptions,
        expiry_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<ReadCredential>;
}

/// Local SigV4 signer for one bucket
pub struct S3CredentialMinter {
    bucket: String,
    region: String,
    access_key: String,
    secret_key: String,
}

impl S3CredentialMinter {
    pub fn new(config: &S3Config, access_key: String, secret_key: String) -> Self {
        Self {
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            access_key,
            secret_key,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn host(&self) -> String {
        format!("{}.s3.{}.amazonaws.com", self.bucket, self.region)
    }

    fn credential_scope(&self, datestamp: &str) -> String {
        format!("{}/{}/s3/aws4_request", datestamp, self.region)
    }

    /// SigV4 signing key: chained HMAC over date, region, service
    fn signing_key(&self, datestamp: &str) -> Vec<u8> {
        let k_date = hmac_sha256(format!("AWS4{}", self.secret_key).as_bytes(), datestamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, b"s3");
        hmac_sha256(&k_service, b"aws4_request")
    }
}

#[async_trait]
impl ObjectStore for S3CredentialMinter {
    /// Presigned POST policy locked to the folder prefix
    async fn mint_upload_credential(
        &self,
        path_prefix: &str,
        expiry_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<UploadCredential> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let datestamp = now.format("%Y%m%d").to_string();
        let credential = format!("{}/{}", self.access_key, self.credential_scope(&datestamp));
        let expires_at = now + chrono::Duration::seconds(expiry_secs as i64);

        let policy = json!({
            "expiration": expires_at.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            "conditions": [
                {"bucket": self.bucket},
                {"acl": "private"},
                ["starts-with", "$key", path_prefix],
                ["content-length-range", MIN_UPLOAD_BYTES, MAX_UPLOAD_BYTES],
                {"x-amz-storage-class": "STANDARD"},
                {"x-amz-algorithm": "AWS4-HMAC-SHA256"},
                {"x-amz-credential": credential},
                {"x-amz-date": amz_date},
            ],
        });
        let policy_b64 = BASE64.encode(policy.to_string());
        let signature = hex::encode(hmac_sha256(
            &self.signing_key(&datestamp),
            policy_b64.as_bytes(),
        ));

        let mut fields = BTreeMap::new();
        fields.insert("key".to_string(), format!("{}${{filename}}", path_prefix));
        fields.insert("acl".to_string(), "private".to_string());
        fields.insert("x-amz-storage-class".to_string(), "STANDARD".to_string());
        fields.insert(
            "x-amz-algorithm".to_string(),
            "AWS4-HMAC-SHA256".to_string(),
        );
        fields.insert("x-amz-credential".to_string(), credential);
        fields.insert("x-amz-date".to_string(), amz_date);
        fields.insert("policy".to_string(), policy_b64);
        fields.insert("x-amz-signature".to_string(), signature);

        Ok(UploadCredential {
            url: format!("https://{}", self.host()),
            fields,
            expires_at,
        })
    }

    /// Presigned list-objects-v2 URL scoped to the prefix
    async fn mint_read_credential(
        &self,
        path_prefix: &str,
        options: &ReadOptions,
        expiry_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<ReadCredential> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let datestamp = now.format("%Y%m%d").to_string();
        let credential = format!("{}/{}", self.access_key, self.credential_scope(&datestamp));

        let mut query: BTreeMap<String, String> = BTreeMap::new();
        query.insert("X-Amz-Algorithm".to_string(), "AWS4-HMAC-SHA256".to_string());
        query.insert("X-Amz-Credential".to_string(), credential);
        query.insert("X-Amz-Date".to_string(), amz_date.clone());
        query.insert("X-Amz-Expires".to_string(), expiry_secs.to_string());
        query.insert("X-Amz-SignedHeaders".to_string(), "host".to_string());
        query.insert("list-type".to_string(), "2".to_string());
        query.insert("prefix".to_string(), path_prefix.to_string());
        if let Some(delimiter) = &options.delimiter {
            query.insert("delimiter".to_string(), delimiter.clone());
        }
        if let Some(max_keys) = options.max_keys {
            query.insert("max-keys".to_string(), max_keys.to_string());
        }

        // Canonical query: keys already sorted by the BTreeMap
        let canonical_query = query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let host = self.host();
        let canonical_request = format!(
            "GET\n/\n{}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
            canonical_query, host
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            self.credential_scope(&datestamp),
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let signature = hex::encode(hmac_sha256(
            &self.signing_key(&datestamp),
            string_to_sign.as_bytes(),
        ));

        Ok(ReadCredential {
            url: format!(
                "https://{}/?{}&X-Amz-Signature={}",
                host, canonical_query, signature
            ),
            prefix: path_prefix.to_string(),
            expires_at: now + chrono::Duration::seconds(expiry_secs as i64),
        })
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn minter() -> S3CredentialMinter {
        let config = crate::config::Config::default().s3;
        S3CredentialMinter::new(&config, "AKIATEST".to_string(), "secret".to_string())
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 30, 15, 58, 0).unwrap()
    }

    #[tokio::test]
    async fn test_upload_credential_shape() {
        let credential = minter()
            .mint_upload_credential("data/hotkey=5F3abc/", 3600, fixed_now())
            .await
            .unwrap();

        assert!(credential.url.starts_with("https://"));
        assert!(credential.url.contains(".s3.us-east-2.amazonaws.com"));
        assert_eq!(
            credential.fields.get("key").unwrap(),
            "data/hotkey=5F3abc/${filename}"
        );
        assert_eq!(credential.fields.get("acl").unwrap(), "private");
        assert_eq!(credential.fields.get("x-amz-date").unwrap(), "20240930T155800Z");
        assert!(credential
            .fields
            .get("x-amz-credential")
            .unwrap()
            .ends_with("/20240930/us-east-2/s3/aws4_request"));
        // 32-byte HMAC as hex
        assert_eq!(credential.fields.get("x-amz-signature").unwrap().len(), 64);

        // Policy embeds the folder scope
        let policy_json = BASE64
            .decode(credential.fields.get("policy").unwrap())
            .unwrap();
        let policy: serde_json::Value = serde_json::from_slice(&policy_json).unwrap();
        let conditions = policy["conditions"].as_array().unwrap();
        assert!(conditions
            .iter()
            .any(|c| c.as_array().map_or(false, |a| a.len() == 3
                && a[0] == "starts-with"
                && a[2] == "data/hotkey=5F3abc/")));
    }

    #[tokio::test]
    async fn test_read_credential_query() {
        let options = ReadOptions {
            delimiter: Some("/".to_string()),
            max_keys: Some(10_000),
        };
        let credential = minter()
            .mint_read_credential("data/hotkey=", &options, 10_800, fixed_now())
            .await
            .unwrap();

        assert!(credential.url.contains("X-Amz-Algorithm=AWS4-HMAC-SHA256"));
        assert!(credential.url.contains("X-Amz-Expires=10800"));
        assert!(credential.url.contains("list-type=2"));
        assert!(credential.url.contains("prefix=data%2Fhotkey%3D"));
        assert!(credential.url.contains("delimiter=%2F"));
        assert!(credential.url.contains("max-keys=10000"));
        assert!(credential.url.contains("&X-Amz-Signature="));
    }

    #[tokio::test]
    async fn test_signatures_deterministic_and_scope_sensitive() {
        let minter = minter();
        let now = fixed_now();
        let options = ReadOptions::default();

        let a = minter
            .mint_read_credential("data/hotkey=a/", &options, 3600, now)
            .await
            .unwrap();
        let b = minter
            .mint_read_credential("data/hotkey=a/", &options, 3600, now)
            .await
            .unwrap();
        let c = minter
            .mint_read_credential("data/hotkey=c/", &options, 3600, now)
            .await
            .unwrap();

        assert_eq!(a.url, b.url);
        assert_ne!(a.url, c.url);
    }
}
