use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::Provider;

// Empty strings mean "unset" throughout: that is what override sets carry
// for fields the caller left blank.

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacebookCredential {
    pub app_id: String,
    pub app_secret: String,
    pub user_token: String,
    pub page_name: String,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstagramCredential {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub access_token: String,
    /// Account whose media is listed. Empty means the token owner (`me`).
    pub user_id: String,
    /// When `access_token` was issued, if known.
    pub token_issued_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwitterCredential {
    pub bearer_token: String,
    pub user_id: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub access_token: String,
    pub access_token_secret: String,
}

/// Which timeline protocol a Twitter credential can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineProtocol {
    /// Bearer token + user id, API v2.
    V2,
    /// Four OAuth 1.0a credentials, API v1.1.
    V1,
}

impl TwitterCredential {
    fn has_legacy_keys(&self) -> bool {
        !self.consumer_key.is_empty()
            && !self.consumer_secret.is_empty()
            && !self.access_token.is_empty()
            && !self.access_token_secret.is_empty()
    }

    /// Bearer token wins when both credential sets are complete.
    pub fn protocol(&self) -> Option<TimelineProtocol> {
        if !self.bearer_token.is_empty() && !self.user_id.is_empty() {
            Some(TimelineProtocol::V2)
        } else if self.has_legacy_keys() {
            Some(TimelineProtocol::V1)
        } else {
            None
        }
    }
}

/// A fully resolved, request-scoped credential for one provider.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum Credential {
    Facebook(FacebookCredential),
    Instagram(InstagramCredential),
    Twitter(TwitterCredential),
}

impl Credential {
    /// An all-empty credential, the neutral override set.
    pub fn empty(provider: Provider) -> Self {
        match provider {
            Provider::Facebook => Credential::Facebook(FacebookCredential::default()),
            Provider::Instagram => Credential::Instagram(InstagramCredential::default()),
            Provider::Twitter => Credential::Twitter(TwitterCredential::default()),
        }
    }

    pub fn provider(&self) -> Provider {
        match self {
            Credential::Facebook(_) => Provider::Facebook,
            Credential::Instagram(_) => Provider::Instagram,
            Credential::Twitter(_) => Provider::Twitter,
        }
    }

    /// Fields the provider needs that are empty in this credential.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        match self {
            Credential::Facebook(c) => {
                for (name, value) in [
                    ("app_id", &c.app_id),
                    ("app_secret", &c.app_secret),
                    ("user_token", &c.user_token),
                    ("page_name", &c.page_name),
                ] {
                    if value.is_empty() {
                        missing.push(name);
                    }
                }
            }
            Credential::Instagram(c) => {
                if c.access_token.is_empty() {
                    missing.push("access_token");
                }
            }
            Credential::Twitter(c) => {
                if c.protocol().is_none() {
                    if c.bearer_token.is_empty() {
                        missing.push("bearer_token");
                    }
                    if c.user_id.is_empty() {
                        missing.push("user_id");
                    }
                    if !c.has_legacy_keys() {
                        for (name, value) in [
                            ("consumer_key", &c.consumer_key),
                            ("consumer_secret", &c.consumer_secret),
                            ("access_token", &c.access_token),
                            ("access_token_secret", &c.access_token_secret),
                        ] {
                            if value.is_empty() {
                                missing.push(name);
                            }
                        }
                    }
                }
            }
        }
        missing
    }

    /// Stable SHA-256 over every field. Used in cache and token keys so that
    /// secrets never appear in a key.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.provider().as_str().as_bytes());
        let fields: Vec<&str> = match self {
            Credential::Facebook(c) => vec![&c.app_id, &c.app_secret, &c.user_token, &c.page_name],
            Credential::Instagram(c) => vec![
                &c.client_id,
                &c.client_secret,
                &c.redirect_uri,
                &c.access_token,
                &c.user_id,
            ],
            Credential::Twitter(c) => vec![
                &c.bearer_token,
                &c.user_id,
                &c.consumer_key,
                &c.consumer_secret,
                &c.access_token,
                &c.access_token_secret,
            ],
        };
        for field in fields {
            hasher.update([0x1f]);
            hasher.update(field.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

fn mask(value: &str) -> &'static str {
    if value.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

impl fmt::Debug for FacebookCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FacebookCredential")
            .field("app_id", &self.app_id)
            .field("app_secret", &mask(&self.app_secret))
            .field("user_token", &mask(&self.user_token))
            .field("page_name", &self.page_name)
            .finish()
    }
}

impl fmt::Debug for InstagramCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstagramCredential")
            .field("client_id", &self.client_id)
            .field("client_secret", &mask(&self.client_secret))
            .field("redirect_uri", &self.redirect_uri)
            .field("access_token", &mask(&self.access_token))
            .field("user_id", &self.user_id)
            .field("token_issued_at", &self.token_issued_at)
            .finish()
    }
}

impl fmt::Debug for TwitterCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwitterCredential")
            .field("bearer_token", &mask(&self.bearer_token))
            .field("user_id", &self.user_id)
            .field("consumer_key", &mask(&self.consumer_key))
            .field("consumer_secret", &mask(&self.consumer_secret))
            .field("access_token", &mask(&self.access_token))
            .field("access_token_secret", &mask(&self.access_token_secret))
            .finish()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Facebook(c) => c.fmt(f),
            Credential::Instagram(c) => c.fmt(f),
            Credential::Twitter(c) => c.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy() -> TwitterCredential {
        TwitterCredential {
            consumer_key: "ck".into(),
            consumer_secret: "cs".into(),
            access_token: "at".into(),
            access_token_secret: "ats".into(),
            ..Default::default()
        }
    }

    #[test]
    fn bearer_wins_over_legacy_keys() {
        let both = TwitterCredential {
            bearer_token: "bt".into(),
            user_id: "42".into(),
            ..legacy()
        };
        assert_eq!(both.protocol(), Some(TimelineProtocol::V2));
        assert_eq!(legacy().protocol(), Some(TimelineProtocol::V1));
        assert_eq!(TwitterCredential::default().protocol(), None);
    }

    #[test]
    fn bearer_without_user_id_falls_back_to_legacy() {
        let cred = TwitterCredential {
            bearer_token: "bt".into(),
            ..legacy()
        };
        assert_eq!(cred.protocol(), Some(TimelineProtocol::V1));

        let lonely = Credential::Twitter(TwitterCredential {
            bearer_token: "bt".into(),
            ..Default::default()
        });
        let missing = lonely.missing_fields();
        assert!(missing.contains(&"user_id"));
        assert!(!missing.contains(&"bearer_token"));
    }

    #[test]
    fn facebook_requires_all_four_fields() {
        let cred = Credential::Facebook(FacebookCredential {
            app_id: "app".into(),
            page_name: "page".into(),
            ..Default::default()
        });
        assert_eq!(cred.missing_fields(), vec!["app_secret", "user_token"]);
    }

    #[test]
    fn fingerprint_changes_with_any_field() {
        let a = Credential::Twitter(legacy());
        let b = Credential::Twitter(TwitterCredential {
            access_token: "other".into(),
            ..legacy()
        });
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn debug_output_hides_secrets() {
        let cred = Credential::Twitter(legacy());
        let printed = format!("{cred:?}");
        assert!(!printed.contains("ats"));
        assert!(printed.contains("<redacted>"));
    }
}
