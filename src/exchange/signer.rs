use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha512;

type HmacSha512 = Hmac<Sha512>;

/// HMAC-SHA512 request signer. The venue signs
/// `timestamp + METHOD + path + body + subaccount_id`, where `path`
/// includes the query string and absent parts are empty strings.
#[derive(Clone)]
pub struct Signer {
    api_secret: SecretString,
}

impl Signer {
    pub fn new(api_secret: SecretString) -> Self {
        Signer { api_secret }
    }

    pub fn sign(
        &self,
        timestamp_ms: i64,
        method: &str,
        path_and_query: &str,
        body: &str,
        subaccount_id: Option<&str>,
    ) -> Result<String> {
        let payload = format!(
            "{}{}{}{}{}",
            timestamp_ms,
            method,
            path_and_query,
            body,
            subaccount_id.unwrap_or("")
        );
        let mut mac = HmacSha512::new_from_slice(self.api_secret.expose_secret().as_bytes())
            .context("hmac init")?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}
