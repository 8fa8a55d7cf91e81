//! Derived and refreshed provider tokens.
//!
//! Graph pages need a permanent page token derived once from a user token.
//! Media tokens live 60 days and are refreshed once they pass the refresh
//! window. Every derived value is persisted through the [`ConfigStore`].

use std::fmt::Display;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use socialfeed_common::{
    Credential, FacebookCredential, FeedError, InstagramCredential, Provider, Result,
};
use socialfeed_http::{HttpRequest, HttpTransport};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::flight::SingleFlight;
use crate::providers::{check_status, parse_body, Endpoints};
use crate::resolver::load_global;
use crate::store::{get_non_empty, ConfigStore};

/// `/{account}/accounts` pages walked while looking for the page.
const MAX_ACCOUNT_PAGES: usize = 10;

/// Page id and permanent page token for a Graph page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedPage {
    pub page_id: String,
    pub access_token: String,
}

/// A refreshable token as persisted in the config store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    pub value: String,
    pub issued_at: DateTime<Utc>,
    pub ttl_secs: i64,
}

impl TokenState {
    pub fn needs_refresh(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        now >= self.issued_at + window
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + chrono::Duration::seconds(self.ttl_secs)
    }
}

/// A credential ready to build a client from.
#[derive(Debug, Clone)]
pub struct FreshCredential {
    /// The resolved credential, with a refreshed media token swapped in.
    pub credential: Credential,
    /// Graph only.
    pub page: Option<DerivedPage>,
    /// A non-fatal lifecycle failure (`TokenRefresh`).
    pub warning: Option<FeedError>,
}

pub struct TokenLifecycleManager {
    transport: Arc<dyn HttpTransport>,
    store: Arc<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
    endpoints: Endpoints,
    lifetime: chrono::Duration,
    refresh_window: chrono::Duration,
    derivations: SingleFlight<DerivedPage>,
    refreshes: SingleFlight<TokenState>,
}

fn exchange_error(step: &str, err: impl Display) -> FeedError {
    FeedError::TokenExchange(format!("{step}: {err}"))
}

fn refresh_error(err: impl Display) -> FeedError {
    FeedError::TokenRefresh(err.to_string())
}

fn str_field(body: &Value, field: &str) -> Option<String> {
    match body.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl TokenLifecycleManager {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn ConfigStore>,
        clock: Arc<dyn Clock>,
        endpoints: Endpoints,
    ) -> Self {
        Self {
            transport,
            store,
            clock,
            endpoints,
            lifetime: chrono::Duration::days(60),
            refresh_window: chrono::Duration::days(50),
            derivations: SingleFlight::new(),
            refreshes: SingleFlight::new(),
        }
    }

    /// Override the 60-day lifetime and 50-day refresh window.
    pub fn with_policy(mut self, lifetime_days: i64, refresh_window_days: i64) -> Self {
        self.lifetime = chrono::Duration::days(lifetime_days);
        self.refresh_window = chrono::Duration::days(refresh_window_days);
        self
    }

    /// Bring a resolved credential up to date.
    ///
    /// Graph credentials get their page token (`TokenExchange` on failure).
    /// Media credentials get a refreshed token when due; a failed refresh keeps
    /// the current token and is reported in `warning`. Timeline credentials
    /// pass through.
    pub async fn ensure_fresh(&self, credential: &Credential) -> Result<FreshCredential> {
        match credential {
            Credential::Facebook(c) => {
                let page = self.ensure_derived(c).await?;
                Ok(FreshCredential {
                    credential: credential.clone(),
                    page: Some(page),
                    warning: None,
                })
            }
            Credential::Instagram(c) => {
                let (token, warning) = self.refresh_media_token(c).await?;
                Ok(FreshCredential {
                    credential: Credential::Instagram(InstagramCredential {
                        access_token: token,
                        ..c.clone()
                    }),
                    page: None,
                    warning,
                })
            }
            Credential::Twitter(_) => Ok(FreshCredential {
                credential: credential.clone(),
                page: None,
                warning: None,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Graph page token
    // -----------------------------------------------------------------------

    /// The page id and permanent token for `credential.page_name`, deriving
    /// and persisting them on first use.
    pub async fn ensure_derived(&self, credential: &FacebookCredential) -> Result<DerivedPage> {
        let prefix = format!("facebook.derived.{}", credential.page_name);
        if let Some(page) = self.stored_page(&prefix).await? {
            return Ok(page);
        }

        self.derivations
            .run(&prefix, || async {
                if let Some(page) = self.stored_page(&prefix).await? {
                    return Ok(page);
                }
                self.derive_page(credential, &prefix).await
            })
            .await
    }

    async fn stored_page(&self, prefix: &str) -> Result<Option<DerivedPage>> {
        let store = self.store.as_ref();
        let page_id = get_non_empty(store, &format!("{prefix}.page_id")).await?;
        let token = get_non_empty(store, &format!("{prefix}.page_permanent_token")).await?;
        Ok(match (page_id, token) {
            (Some(page_id), Some(access_token)) => Some(DerivedPage {
                page_id,
                access_token,
            }),
            _ => None,
        })
    }

    async fn graph_get(&self, step: &str, request: HttpRequest) -> Result<Value> {
        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| exchange_error(step, e))?;
        check_status(Provider::Facebook, &response, self.clock.now()).map_err(|e| match e {
            FeedError::RateLimited { .. } => e,
            other => exchange_error(step, other),
        })?;
        parse_body(Provider::Facebook, &response).map_err(|e| exchange_error(step, e))
    }

    async fn derive_page(&self, credential: &FacebookCredential, prefix: &str) -> Result<DerivedPage> {
        let base = self.endpoints.graph_versioned();
        info!(page_name = credential.page_name.as_str(), "facebook: deriving page token");

        let body = self
            .graph_get(
                "long-lived token",
                HttpRequest::get(format!("{base}/oauth/access_token"))
                    .query("grant_type", "fb_exchange_token")
                    .query("client_id", &credential.app_id)
                    .query("client_secret", &credential.app_secret)
                    .query("fb_exchange_token", &credential.user_token),
            )
            .await?;
        let long_token = str_field(&body, "access_token")
            .ok_or_else(|| exchange_error("long-lived token", "no access_token in response"))?;

        let body = self
            .graph_get(
                "account id",
                HttpRequest::get(format!("{base}/me")).query("access_token", &long_token),
            )
            .await?;
        let account_id =
            str_field(&body, "id").ok_or_else(|| exchange_error("account id", "no id in response"))?;

        let page_id_key = format!("{prefix}.page_id");
        let page_id = match get_non_empty(self.store.as_ref(), &page_id_key).await? {
            Some(id) => id,
            None => {
                let body = self
                    .graph_get(
                        "page id",
                        HttpRequest::get(format!("{base}/{}", credential.page_name))
                            .query("fields", "id")
                            .query("access_token", &long_token),
                    )
                    .await?;
                let id = str_field(&body, "id")
                    .ok_or_else(|| exchange_error("page id", "no id in response"))?;
                self.store.set(&page_id_key, id.clone()).await?;
                self.store.save().await?;
                id
            }
        };
        debug!(account_id = account_id.as_str(), page_id = page_id.as_str(), "facebook: page resolved");

        let access_token = self.find_page_token(&base, &account_id, &page_id, &long_token).await?;
        self.store
            .set(&format!("{prefix}.page_permanent_token"), access_token.clone())
            .await?;
        self.store.save().await?;
        info!(page_id = page_id.as_str(), "facebook: page token stored");

        Ok(DerivedPage {
            page_id,
            access_token,
        })
    }

    async fn find_page_token(
        &self,
        base: &str,
        account_id: &str,
        page_id: &str,
        long_token: &str,
    ) -> Result<String> {
        let mut request =
            HttpRequest::get(format!("{base}/{account_id}/accounts")).query("access_token", long_token);

        for _ in 0..MAX_ACCOUNT_PAGES {
            let body = self.graph_get("page token", request).await?;
            let found = body
                .get("data")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .find(|account| str_field(account, "id").as_deref() == Some(page_id))
                .and_then(|account| str_field(account, "access_token"));
            if let Some(token) = found {
                return Ok(token);
            }

            match body.pointer("/paging/next").and_then(Value::as_str) {
                Some(next) => request = HttpRequest::get(next),
                None => break,
            }
        }

        Err(exchange_error(
            "page token",
            format!("page {page_id} is not managed by this account"),
        ))
    }

    // -----------------------------------------------------------------------
    // Media token refresh
    // -----------------------------------------------------------------------

    fn state_key(credential: &InstagramCredential) -> String {
        format!(
            "instagram.token_state.{}",
            Credential::Instagram(credential.clone()).fingerprint()
        )
    }

    async fn load_state(&self, key: &str) -> Result<Option<TokenState>> {
        let Some(raw) = get_non_empty(self.store.as_ref(), key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(key, error = %e, "Discarding unreadable token state");
                Ok(None)
            }
        }
    }

    async fn store_state(&self, key: &str, state: &TokenState) -> Result<()> {
        let json = serde_json::to_string(state).map_err(|e| FeedError::Store(e.to_string()))?;
        self.store.set(key, json).await
    }

    /// The token to use now, plus the refresh failure if one happened.
    async fn refresh_media_token(
        &self,
        credential: &InstagramCredential,
    ) -> Result<(String, Option<FeedError>)> {
        let key = Self::state_key(credential);
        let state = match self.load_state(&key).await? {
            Some(state) => state,
            None => {
                let seeded = TokenState {
                    value: credential.access_token.clone(),
                    issued_at: credential.token_issued_at.unwrap_or_else(|| self.clock.now()),
                    ttl_secs: self.lifetime.num_seconds(),
                };
                self.store_state(&key, &seeded).await?;
                self.store.save().await?;
                seeded
            }
        };

        if !state.needs_refresh(self.clock.now(), self.refresh_window) {
            return Ok((state.value, None));
        }

        let refreshed = self
            .refreshes
            .run(&key, || async {
                let current = self.load_state(&key).await?.unwrap_or_else(|| state.clone());
                if !current.needs_refresh(self.clock.now(), self.refresh_window) {
                    return Ok(current);
                }
                self.refresh_state(&key, &current, credential).await
            })
            .await;

        match refreshed {
            Ok(state) => Ok((state.value, None)),
            Err(e @ FeedError::Store(_)) => Err(e),
            Err(e) => {
                warn!(error = %e, expires_at = %state.expires_at(), "instagram: token refresh failed, using current token");
                Ok((state.value, Some(e)))
            }
        }
    }

    async fn refresh_state(
        &self,
        key: &str,
        current: &TokenState,
        credential: &InstagramCredential,
    ) -> Result<TokenState> {
        info!("instagram: refreshing access token");

        let request = HttpRequest::get(format!("{}/refresh_access_token", self.endpoints.media_graph))
            .query("grant_type", "ig_refresh_token")
            .query("access_token", &current.value);
        let response = self.transport.send(request).await.map_err(refresh_error)?;
        check_status(Provider::Instagram, &response, self.clock.now()).map_err(refresh_error)?;
        let body = parse_body(Provider::Instagram, &response).map_err(refresh_error)?;

        let value = str_field(&body, "access_token")
            .ok_or_else(|| refresh_error("no access_token in refresh response"))?;
        let now = self.clock.now();
        let state = TokenState {
            value,
            issued_at: now,
            ttl_secs: body
                .get("expires_in")
                .and_then(Value::as_i64)
                .unwrap_or_else(|| self.lifetime.num_seconds()),
        };

        // Keep the global setting in step when it is the token we just replaced.
        // Its state then moves to the new token's fingerprint.
        let global = get_non_empty(self.store.as_ref(), "instagram.access_token").await?;
        if global.as_deref() == Some(credential.access_token.as_str()) {
            self.store
                .set("instagram.access_token", state.value.clone())
                .await?;
            self.store
                .set("instagram.access_token_date", now.timestamp().to_string())
                .await?;
            let successor = Self::state_key(&InstagramCredential {
                access_token: state.value.clone(),
                ..credential.clone()
            });
            self.store_state(&successor, &state).await?;
            self.store.remove(key).await?;
        } else {
            self.store_state(key, &state).await?;
        }
        self.store.save().await?;

        info!(expires_at = %state.expires_at(), "instagram: access token refreshed");
        Ok(state)
    }

    // -----------------------------------------------------------------------
    // Media authorization
    // -----------------------------------------------------------------------

    /// Exchange an OAuth authorization code for a long-lived media token and
    /// store it as the global `instagram.access_token`.
    pub async fn authorize_media(&self, code: &str) -> Result<TokenState> {
        let Credential::Instagram(app) = load_global(self.store.as_ref(), Provider::Instagram).await?
        else {
            return Err(FeedError::Store("unexpected credential shape".to_string()));
        };
        let missing: Vec<&'static str> = [
            ("client_id", &app.client_id),
            ("client_secret", &app.client_secret),
            ("redirect_uri", &app.redirect_uri),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(name, _)| name)
        .collect();
        if !missing.is_empty() {
            return Err(FeedError::ConfigIncomplete {
                provider: Provider::Instagram,
                missing,
            });
        }

        let request = HttpRequest::post(format!("{}/oauth/access_token", self.endpoints.media_auth))
            .form("client_id", &app.client_id)
            .form("client_secret", &app.client_secret)
            .form("grant_type", "authorization_code")
            .form("redirect_uri", &app.redirect_uri)
            .form("code", code);
        let short_token = self.media_token_call("short-lived token", request).await?.0;

        let request = HttpRequest::get(format!("{}/access_token", self.endpoints.media_graph))
            .query("grant_type", "ig_exchange_token")
            .query("client_secret", &app.client_secret)
            .query("access_token", &short_token);
        let (value, expires_in) = self.media_token_call("long-lived token", request).await?;

        let now = self.clock.now();
        let state = TokenState {
            value,
            issued_at: now,
            ttl_secs: expires_in.unwrap_or_else(|| self.lifetime.num_seconds()),
        };
        self.store
            .set("instagram.access_token", state.value.clone())
            .await?;
        self.store
            .set("instagram.access_token_date", now.timestamp().to_string())
            .await?;
        self.store.save().await?;

        info!(expires_at = %state.expires_at(), "instagram: access token authorized");
        Ok(state)
    }

    async fn media_token_call(
        &self,
        step: &str,
        request: HttpRequest,
    ) -> Result<(String, Option<i64>)> {
        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| exchange_error(step, e))?;
        check_status(Provider::Instagram, &response, self.clock.now())
            .map_err(|e| exchange_error(step, e))?;
        let body = parse_body(Provider::Instagram, &response).map_err(|e| exchange_error(step, e))?;

        let token = str_field(&body, "access_token")
            .ok_or_else(|| exchange_error(step, "no access_token in response"))?;
        Ok((token, body.get("expires_in").and_then(Value::as_i64)))
    }
}
