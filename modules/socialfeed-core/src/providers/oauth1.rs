//! OAuth 1.0a HMAC-SHA1 request signing for the legacy timeline API.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use socialfeed_common::{FeedError, Result};

type HmacSha1 = Hmac<Sha1>;

pub struct OAuth1Keys<'a> {
    pub consumer_key: &'a str,
    pub consumer_secret: &'a str,
    pub token: &'a str,
    pub token_secret: &'a str,
}

fn encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Base64 HMAC-SHA1 signature over the method, URL and every request parameter
/// (query, body and `oauth_*`).
pub fn signature(
    method: &str,
    url: &str,
    params: &[(String, String)],
    consumer_secret: &str,
    token_secret: &str,
) -> Result<String> {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (encode(k), encode(v)))
        .collect();
    encoded.sort();
    let param_string = encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    let base = format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        encode(url),
        encode(&param_string)
    );
    let key = format!("{}&{}", encode(consumer_secret), encode(token_secret));

    let mut mac = HmacSha1::new_from_slice(key.as_bytes())
        .map_err(|e| FeedError::Transient(format!("oauth signing: {e}")))?;
    mac.update(base.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// `Authorization` header value for one request.
pub fn authorization_header(
    keys: &OAuth1Keys<'_>,
    method: &str,
    url: &str,
    query: &[(String, String)],
    nonce: &str,
    timestamp: i64,
) -> Result<String> {
    let mut oauth = vec![
        ("oauth_consumer_key".to_string(), keys.consumer_key.to_string()),
        ("oauth_nonce".to_string(), nonce.to_string()),
        ("oauth_signature_method".to_string(), "HMAC-SHA1".to_string()),
        ("oauth_timestamp".to_string(), timestamp.to_string()),
        ("oauth_token".to_string(), keys.token.to_string()),
        ("oauth_version".to_string(), "1.0".to_string()),
    ];

    let mut all = query.to_vec();
    all.extend(oauth.iter().cloned());
    let signed = signature(method, url, &all, keys.consumer_secret, keys.token_secret)?;
    oauth.push(("oauth_signature".to_string(), signed));

    let fields = oauth
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", encode(k), encode(v)))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(format!("OAuth {fields}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn matches_published_reference_signature() {
        let params = pairs(&[
            ("status", "Hello Ladies + Gentlemen, a signed OAuth request!"),
            ("include_entities", "true"),
            ("oauth_consumer_key", "xvz1evFS4wEEPTGEFPHBog"),
            ("oauth_nonce", "kYjzVBB8Y0ZFabxSWbWovY3uYSQ2pTgmZeNu2VS4cg"),
            ("oauth_signature_method", "HMAC-SHA1"),
            ("oauth_timestamp", "1318622958"),
            ("oauth_token", "370773112-GmHxMAgYyLbNEtIKZeRNFsMKPR9EyMZeS9weJAEb"),
            ("oauth_version", "1.0"),
        ]);

        let signed = signature(
            "POST",
            "https://api.twitter.com/1.1/statuses/update.json",
            &params,
            "kAcSOqF21Fu85e7zjz7ZN2U4ZRhfV3WpwPAoE3Z7kBw",
            "LswwdoUaIvS8ltyTt5jkRh4J50vUPVVHtR2YPi5kE",
        )
        .unwrap();
        assert_eq!(signed, "hCtSmYh+iHYCEqBWrE7C7hYmtUk=");
    }

    #[test]
    fn header_carries_every_oauth_field() {
        let keys = OAuth1Keys {
            consumer_key: "ck",
            consumer_secret: "cs",
            token: "at",
            token_secret: "ats",
        };
        let header = authorization_header(
            &keys,
            "GET",
            "https://api.twitter.com/1.1/statuses/user_timeline.json",
            &pairs(&[("count", "5")]),
            "nonce",
            1_700_000_000,
        )
        .unwrap();

        assert!(header.starts_with("OAuth "));
        for field in [
            "oauth_consumer_key=\"ck\"",
            "oauth_nonce=\"nonce\"",
            "oauth_signature_method=\"HMAC-SHA1\"",
            "oauth_timestamp=\"1700000000\"",
            "oauth_token=\"at\"",
            "oauth_version=\"1.0\"",
            "oauth_signature=\"",
        ] {
            assert!(header.contains(field), "missing {field} in {header}");
        }
    }
}
