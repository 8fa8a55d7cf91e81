use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use socialfeed_common::{
    Credential, FacebookCredential, FeedError, FetchQuery, InstagramCredential, PostTypeFilter,
    Provider, Result, TwitterCredential,
};
use tracing::warn;

use crate::store::{get_non_empty, ConfigStore};

// ---------------------------------------------------------------------------
// Override resolution
// ---------------------------------------------------------------------------

/// Effective credential for one request.
///
/// With `override_enabled == false` the global set is returned unchanged.
/// Otherwise every non-empty override field wins over the global one, and the
/// merged credential must satisfy the provider's required fields.
pub fn resolve(
    global: &Credential,
    override_set: Option<&Credential>,
    override_enabled: bool,
) -> Result<Credential> {
    if !override_enabled {
        return Ok(global.clone());
    }

    let merged = match (global, override_set) {
        (_, None) => global.clone(),
        (Credential::Facebook(g), Some(Credential::Facebook(o))) => {
            Credential::Facebook(FacebookCredential {
                app_id: pick(&o.app_id, &g.app_id),
                app_secret: pick(&o.app_secret, &g.app_secret),
                user_token: pick(&o.user_token, &g.user_token),
                page_name: pick(&o.page_name, &g.page_name),
            })
        }
        (Credential::Instagram(g), Some(Credential::Instagram(o))) => {
            // The issue date belongs to whichever token wins.
            let token_issued_at = if o.access_token.is_empty() {
                g.token_issued_at
            } else {
                o.token_issued_at
            };
            Credential::Instagram(InstagramCredential {
                client_id: pick(&o.client_id, &g.client_id),
                client_secret: pick(&o.client_secret, &g.client_secret),
                redirect_uri: pick(&o.redirect_uri, &g.redirect_uri),
                access_token: pick(&o.access_token, &g.access_token),
                user_id: pick(&o.user_id, &g.user_id),
                token_issued_at,
            })
        }
        (Credential::Twitter(g), Some(Credential::Twitter(o))) => {
            Credential::Twitter(TwitterCredential {
                bearer_token: pick(&o.bearer_token, &g.bearer_token),
                user_id: pick(&o.user_id, &g.user_id),
                consumer_key: pick(&o.consumer_key, &g.consumer_key),
                consumer_secret: pick(&o.consumer_secret, &g.consumer_secret),
                access_token: pick(&o.access_token, &g.access_token),
                access_token_secret: pick(&o.access_token_secret, &g.access_token_secret),
            })
        }
        (_, Some(other)) => {
            return Err(FeedError::ConfigIncomplete {
                provider: global.provider(),
                missing: vec![other.provider().as_str()],
            })
        }
    };

    validate(&merged)?;
    Ok(merged)
}

/// Fails with `ConfigIncomplete` when a required field is empty.
pub fn validate(credential: &Credential) -> Result<()> {
    let missing = credential.missing_fields();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(FeedError::ConfigIncomplete {
            provider: credential.provider(),
            missing,
        })
    }
}

fn pick(over: &str, global: &str) -> String {
    let value = if over.is_empty() { global } else { over };
    value.to_string()
}

// ---------------------------------------------------------------------------
// Loading from the config store
// ---------------------------------------------------------------------------

async fn text(store: &dyn ConfigStore, key: &str) -> Result<String> {
    Ok(get_non_empty(store, key).await?.unwrap_or_default())
}

/// Global credential for `provider` as stored in the durable config.
pub async fn load_global(store: &dyn ConfigStore, provider: Provider) -> Result<Credential> {
    Ok(match provider {
        Provider::Facebook => Credential::Facebook(FacebookCredential {
            app_id: text(store, "facebook.app_id").await?,
            app_secret: text(store, "facebook.secret_key").await?,
            user_token: text(store, "facebook.user_token").await?,
            page_name: text(store, "facebook.page_name").await?,
        }),
        Provider::Instagram => Credential::Instagram(InstagramCredential {
            client_id: text(store, "instagram.client_id").await?,
            client_secret: text(store, "instagram.app_secret").await?,
            redirect_uri: text(store, "instagram.redirect_uri").await?,
            access_token: text(store, "instagram.access_token").await?,
            user_id: text(store, "instagram.user_id").await?,
            token_issued_at: get_non_empty(store, "instagram.access_token_date")
                .await?
                .and_then(|raw| parse_unix_seconds("instagram.access_token_date", &raw)),
        }),
        Provider::Twitter => Credential::Twitter(TwitterCredential {
            bearer_token: text(store, "twitter.bearer_token").await?,
            user_id: text(store, "twitter.user_id").await?,
            consumer_key: text(store, "twitter.consumer_key").await?,
            consumer_secret: text(store, "twitter.consumer_secret").await?,
            access_token: text(store, "twitter.access_token").await?,
            access_token_secret: text(store, "twitter.access_token_secret").await?,
        }),
    })
}

/// Feed settings for `provider`, falling back to built-in defaults.
pub async fn load_query_defaults(store: &dyn ConfigStore, provider: Provider) -> Result<FetchQuery> {
    let query = match provider {
        Provider::Facebook => {
            let count = number(store, "facebook.no_feeds").await?;
            let all_types = flag(store, "facebook.all_types").await?.unwrap_or(true);
            let filter = match get_non_empty(store, "facebook.post_type").await? {
                Some(post_type) if !all_types => PostTypeFilter::Only(post_type),
                _ => PostTypeFilter::All,
            };
            FetchQuery::new(provider, count.unwrap_or(provider.default_count())).post_type(filter)
        }
        Provider::Instagram => {
            let count = number(store, "instagram.picture_count").await?;
            FetchQuery::new(provider, count.unwrap_or(provider.default_count()))
                .prefer_video_thumbnail(flag(store, "instagram.video_thumbnail").await?.unwrap_or(false))
                .include_permalink(flag(store, "instagram.post_link").await?.unwrap_or(true))
        }
        Provider::Twitter => {
            let count = number(store, "twitter.tweets_count").await?;
            let mut query = FetchQuery::new(provider, count.unwrap_or(provider.default_count()));
            if let Some(minutes) = number(store, "twitter.cache_duration").await? {
                query = query.cache_ttl(Duration::from_secs(u64::from(minutes) * 60));
            }
            query
        }
    };
    Ok(query)
}

async fn number(store: &dyn ConfigStore, key: &str) -> Result<Option<u32>> {
    Ok(get_non_empty(store, key).await?.and_then(|raw| {
        raw.trim()
            .parse()
            .map_err(|_| warn!(key, value = raw.as_str(), "Ignoring non-numeric setting"))
            .ok()
    }))
}

async fn flag(store: &dyn ConfigStore, key: &str) -> Result<Option<bool>> {
    Ok(get_non_empty(store, key)
        .await?
        .map(|raw| matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")))
}

pub(crate) fn parse_unix_seconds(key: &str, raw: &str) -> Option<DateTime<Utc>> {
    let parsed = raw
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
    if parsed.is_none() {
        warn!(key, value = raw, "Ignoring invalid timestamp setting");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryConfigStore;

    fn fb(app_id: &str, secret: &str, token: &str, page: &str) -> Credential {
        Credential::Facebook(FacebookCredential {
            app_id: app_id.into(),
            app_secret: secret.into(),
            user_token: token.into(),
            page_name: page.into(),
        })
    }

    #[test]
    fn disabled_override_returns_global_unchanged() {
        let global = fb("", "", "", "");
        let over = fb("a", "b", "c", "d");
        assert_eq!(resolve(&global, Some(&over), false).unwrap(), global);
    }

    #[test]
    fn non_empty_override_fields_win() {
        let global = fb("g-app", "g-secret", "g-token", "g-page");
        let over = fb("", "o-secret", "", "o-page");

        let resolved = resolve(&global, Some(&over), true).unwrap();
        assert_eq!(resolved, fb("g-app", "o-secret", "g-token", "o-page"));
    }

    #[test]
    fn incomplete_merge_is_rejected() {
        let global = fb("app", "", "", "");
        let over = fb("", "", "token", "page");

        match resolve(&global, Some(&over), true) {
            Err(FeedError::ConfigIncomplete { provider, missing }) => {
                assert_eq!(provider, Provider::Facebook);
                assert_eq!(missing, vec!["app_secret"]);
            }
            other => panic!("expected ConfigIncomplete, got {other:?}"),
        }
    }

    #[test]
    fn mismatched_override_provider_is_rejected() {
        let global = fb("a", "b", "c", "d");
        let over = Credential::empty(Provider::Twitter);
        assert!(matches!(
            resolve(&global, Some(&over), true),
            Err(FeedError::ConfigIncomplete { .. })
        ));
    }

    #[test]
    fn issue_date_follows_the_winning_token() {
        let issued = Utc.timestamp_opt(1_700_000_000, 0).single();
        let global = Credential::Instagram(InstagramCredential {
            access_token: "global".into(),
            token_issued_at: issued,
            ..Default::default()
        });
        let over = Credential::Instagram(InstagramCredential {
            access_token: "override".into(),
            ..Default::default()
        });

        match resolve(&global, Some(&over), true).unwrap() {
            Credential::Instagram(c) => {
                assert_eq!(c.access_token, "override");
                assert_eq!(c.token_issued_at, None);
            }
            other => panic!("unexpected credential {other:?}"),
        }
    }

    #[tokio::test]
    async fn loads_global_credentials_from_store() {
        let store = MemoryConfigStore::new()
            .with("instagram.access_token", "tok")
            .with("instagram.app_secret", "shh")
            .with("instagram.access_token_date", "1700000000");

        match load_global(&store, Provider::Instagram).await.unwrap() {
            Credential::Instagram(c) => {
                assert_eq!(c.access_token, "tok");
                assert_eq!(c.client_secret, "shh");
                assert_eq!(c.token_issued_at.map(|t| t.timestamp()), Some(1_700_000_000));
            }
            other => panic!("unexpected credential {other:?}"),
        }
    }

    #[tokio::test]
    async fn query_defaults_follow_store_settings() {
        let store = MemoryConfigStore::new()
            .with("facebook.no_feeds", "3")
            .with("facebook.all_types", "0")
            .with("facebook.post_type", "added_photos")
            .with("twitter.cache_duration", "30");

        let fb = load_query_defaults(&store, Provider::Facebook).await.unwrap();
        assert_eq!(fb.count, 3);
        assert_eq!(fb.post_type_filter, PostTypeFilter::Only("added_photos".into()));

        let tw = load_query_defaults(&store, Provider::Twitter).await.unwrap();
        assert_eq!(tw.count, 5);
        assert_eq!(tw.cache_ttl, Duration::from_secs(30 * 60));

        let ig = load_query_defaults(&store, Provider::Instagram).await.unwrap();
        assert_eq!(ig.count, 10);
        assert!(ig.include_permalink);
        assert!(!ig.prefer_video_thumbnail);
    }
}
