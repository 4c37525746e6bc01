//! Request signature validation.
//!
//! The expected signature is `base64(hex(md5(timestamp + secret)))`, where
//! `timestamp` is the raw text of the timestamp argument.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use md5::{Digest, Md5};
use thiserror::Error;

use crate::value::Args;

/// Argument names, shared secret and freshness window for signed calls.
#[derive(Debug, Clone)]
pub struct SignConfig {
    pub sign_key: String,
    pub time_key: String,
    pub secret: String,
    pub expire: Duration,
}

impl Default for SignConfig {
    fn default() -> Self {
        Self {
            sign_key: "sign".to_string(),
            time_key: "utime".to_string(),
            secret: String::new(),
            expire: Duration::from_secs(300),
        }
    }
}

/// Why a signed request was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignRejection {
    #[error("signature argument missing")]
    MissingSignature,

    #[error("timestamp argument missing or not positive")]
    BadTimestamp,

    #[error("timestamp {0} is outside the freshness window")]
    Expired(i64),

    #[error("signature mismatch")]
    Mismatch,
}

/// Compute the signature a client must send for `timestamp`.
pub fn expected_signature(timestamp: &str, secret: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(timestamp.as_bytes());
    hasher.update(secret.as_bytes());
    let digest = hex::encode(hasher.finalize());
    BASE64_STANDARD.encode(digest.as_bytes())
}

/// Validate the signature arguments against `now_unix` (seconds).
pub fn verify(args: &Args, config: &SignConfig, now_unix: i64) -> Result<(), SignRejection> {
    let sign = args.get_string(&config.sign_key, "");
    if sign.is_empty() {
        return Err(SignRejection::MissingSignature);
    }

    let timestamp = args.get_i64(&config.time_key, 0);
    if timestamp <= 0 {
        return Err(SignRejection::BadTimestamp);
    }
    let expire = i64::try_from(config.expire.as_secs()).unwrap_or(i64::MAX);
    if now_unix.saturating_sub(timestamp) > expire {
        return Err(SignRejection::Expired(timestamp));
    }

    let raw = args.get_string(&config.time_key, "");
    if sign != expected_signature(&raw, &config.secret) {
        return Err(SignRejection::Mismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SignConfig {
        SignConfig {
            secret: "s3cret".into(),
            ..SignConfig::default()
        }
    }

    #[test]
    fn signature_is_base64_of_hex_digest() {
        // md5("") = d41d8cd98f00b204e9800998ecf8427e
        assert_eq!(
            expected_signature("", ""),
            BASE64_STANDARD.encode("d41d8cd98f00b204e9800998ecf8427e")
        );
    }

    #[test]
    fn fresh_correct_signature_passes() {
        let now = 1_700_000_000;
        let ts = (now - 10).to_string();
        let args = Args::new()
            .with("utime", ts.as_str())
            .with("sign", expected_signature(&ts, "s3cret"));
        assert_eq!(verify(&args, &config(), now), Ok(()));
    }

    #[test]
    fn integer_timestamp_argument_is_accepted() {
        let now = 1_700_000_000;
        let ts = now - 1;
        let args = Args::new()
            .with("utime", ts)
            .with("sign", expected_signature(&ts.to_string(), "s3cret"));
        assert_eq!(verify(&args, &config(), now), Ok(()));
    }

    #[test]
    fn expired_timestamp_fails_even_with_matching_hash() {
        let now = 1_700_000_000;
        let ts = (now - 301).to_string();
        let args = Args::new()
            .with("utime", ts.as_str())
            .with("sign", expected_signature(&ts, "s3cret"));
        assert!(matches!(
            verify(&args, &config(), now),
            Err(SignRejection::Expired(_))
        ));
    }

    #[test]
    fn missing_or_bad_arguments_are_rejected() {
        let now = 1_700_000_000;
        assert_eq!(
            verify(&Args::new(), &config(), now),
            Err(SignRejection::MissingSignature)
        );
        let args = Args::new().with("sign", "x").with("utime", "-5");
        assert_eq!(verify(&args, &config(), now), Err(SignRejection::BadTimestamp));
        let args = Args::new().with("sign", "x").with("utime", now.to_string());
        assert_eq!(verify(&args, &config(), now), Err(SignRejection::Mismatch));
    }
}
