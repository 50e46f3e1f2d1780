use crate::cache::{CachedToken, TokenCache};
use crate::config::Config;
use crate::error::AuthError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use graph_rs_sdk::oauth::{AccessToken, OAuth};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;
use warp::{Filter, Rejection, Reply};

/// Obtains bearer tokens for the to-do list API.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns a token without user interaction, or `AuthError::NotSignedIn`
    /// when no usable credential is cached.
    async fn acquire_silent(&self, scopes: &[String]) -> Result<String, AuthError>;

    /// Runs the user-facing sign in flow.
    async fn acquire_interactive(&self, scopes: &[String]) -> Result<String, AuthError>;

    async fn clear_cache(&self) -> Result<(), AuthError>;

    /// Drops whatever sign in state lives outside the token cache (browser
    /// cookies and the like).
    async fn clear_session_artifacts(&self) -> Result<(), AuthError>;
}

/// What the cache can do for a silent request.
#[derive(Debug, PartialEq, Eq)]
enum SilentLookup {
    Ready(String),
    Refresh(String),
    NotSignedIn,
}

fn lookup_cached(cached: Option<CachedToken>, scopes: &[String], now: DateTime<Utc>) -> SilentLookup {
    match cached {
        Some(token) if !token.covers(scopes) => SilentLookup::NotSignedIn,
        Some(token) if !token.is_expired_at(now) => SilentLookup::Ready(token.access_token),
        Some(CachedToken {
            refresh_token: Some(refresh_token),
            ..
        }) => SilentLookup::Refresh(refresh_token),
        _ => SilentLookup::NotSignedIn,
    }
}

/// Authorization code flow against the Microsoft identity platform, with a
/// loopback listener catching the redirect.
pub struct GraphTokenProvider {
    oauth_client: OAuth,
    cache: TokenCache,
    redirect_port: u16,
}

impl GraphTokenProvider {
    pub fn new(config: &Config) -> Self {
        GraphTokenProvider {
            oauth_client: Self::new_oauth_client(config),
            cache: TokenCache::new(&config.token_cache_path),
            redirect_port: config.redirect_port,
        }
    }

    pub fn new_oauth_client(config: &Config) -> OAuth {
        let mut oauth = OAuth::new();
        oauth
            .client_id(&config.client_id)
            .redirect_uri(&config.redirect_uri())
            .authorize_url(&config.authorize_url())
            .access_token_url(&config.token_url())
            .refresh_token_url(&config.token_url())
            .response_type("code");
        oauth
    }

    fn scoped_client(&self, scopes: &[String]) -> OAuth {
        let mut oauth = self.oauth_client.clone();
        for scope in scopes {
            oauth.add_scope(scope);
        }
        oauth
    }

    fn remember(&self, token: AccessToken, scopes: &[String]) -> Result<String, AuthError> {
        let access_token = token.bearer_token().to_owned();
        let expires_in = token.expires_in() as i64;
        let cached = CachedToken {
            access_token: access_token.clone(),
            expires_at: Some(Utc::now() + Duration::seconds(expires_in)),
            refresh_token: token.refresh_token(),
            scopes: scopes.to_vec(),
        };
        self.cache.store(&cached).map_err(|err| {
            AuthError::other("Failed to update the token cache").with_inner(format!("{err:#}"))
        })?;
        Ok(access_token)
    }

    async fn refresh(&self, refresh_token: &str, scopes: &[String]) -> Result<String, AuthError> {
        let mut oauth = self.scoped_client(scopes);
        let mut stored = AccessToken::default();
        stored.set_refresh_token(refresh_token);
        oauth.access_token(stored);
        let mut request = oauth.build_async().authorization_code_grant();
        match request.refresh_token().send().await {
            Ok(token) => {
                info!("Access token refreshed");
                self.remember(token, scopes)
            }
            Err(err) => {
                warn!(error = %err, "Refresh was rejected, sign in is required");
                if let Err(err) = self.cache.clear() {
                    warn!(error = %format!("{err:#}"), "Failed to drop the stale token cache");
                }
                Err(AuthError::NotSignedIn)
            }
        }
    }

    /// Serves the redirect endpoint until the browser comes back or the user
    /// presses Ctrl-C.
    ///
    /// Listening for Ctrl-C installs tokio's SIGINT handler, which stays in
    /// place for the rest of the process: after the first interactive sign in
    /// Ctrl-C no longer terminates the program outside of this wait.
    async fn wait_for_redirect(&self, oauth: &mut OAuth) -> Result<RedirectResponse, AuthError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let routes = get_routes(handle_redirect, tx);

        let (addr, server) = warp::serve(routes)
            .try_bind_with_graceful_shutdown(([127, 0, 0, 1], self.redirect_port), async move {
                shutdown_rx.await.ok();
            })
            .map_err(|err| {
                AuthError::other("Failed to start the sign in redirect listener").with_inner(err)
            })?;
        let server = tokio::spawn(server);
        debug!(%addr, "Listening for the sign in redirect");

        // Get the oauth client and request a browser sign in
        let opened = {
            let mut request = oauth.build_async().authorization_code_grant();
            request.browser_authorization().open().map_err(|err| {
                AuthError::other("Failed to open the browser for sign in").with_inner(err)
            })
        };

        let outcome = match opened {
            Ok(_) => {
                tokio::select! {
                    response = rx.recv() => response.ok_or(AuthError::Canceled),
                    _ = tokio::signal::ctrl_c() => {
                        info!("Sign in interrupted from the terminal");
                        Err(AuthError::Canceled)
                    }
                }
            }
            Err(err) => Err(err),
        };

        let _ = shutdown_tx.send(());
        if let Err(err) = server.await {
            warn!(error = %err, "Redirect listener did not shut down cleanly");
        }
        outcome
    }
}

#[async_trait]
impl TokenProvider for GraphTokenProvider {
    async fn acquire_silent(&self, scopes: &[String]) -> Result<String, AuthError> {
        let cached = self.cache.load().map_err(|err| {
            AuthError::other("Failed to read the token cache").with_inner(format!("{err:#}"))
        })?;

        match lookup_cached(cached, scopes, Utc::now()) {
            SilentLookup::Ready(token) => {
                debug!("Using cached access token");
                Ok(token)
            }
            SilentLookup::Refresh(refresh_token) => self.refresh(&refresh_token, scopes).await,
            SilentLookup::NotSignedIn => Err(AuthError::NotSignedIn),
        }
    }

    async fn acquire_interactive(&self, scopes: &[String]) -> Result<String, AuthError> {
        let mut oauth = self.scoped_client(scopes);
        let state = Uuid::new_v4().to_string();
        oauth.state(&state);
        let code = self
            .wait_for_redirect(&mut oauth)
            .await?
            .into_authorization_code(&state)?;

        oauth.access_code(&code);
        let mut request = oauth.build_async().authorization_code_grant();
        let token = request.access_token().send().await.map_err(|err| {
            AuthError::other("Failed to redeem the authorization code").with_inner(err)
        })?;

        info!("Signed in interactively");
        self.remember(token, scopes)
    }

    async fn clear_cache(&self) -> Result<(), AuthError> {
        self.cache.clear().map_err(|err| {
            AuthError::other("Failed to clear the token cache").with_inner(format!("{err:#}"))
        })?;
        info!(path = %self.cache.path().display(), "Token cache cleared");
        Ok(())
    }

    async fn clear_session_artifacts(&self) -> Result<(), AuthError> {
        // The system browser owns its cookies; there is nothing of ours to drop.
        debug!("No local session artifacts to clear");
        Ok(())
    }
}

type RedirectSender = mpsc::UnboundedSender<RedirectResponse>;

/// Query parameters the identity provider appends to the redirect URI.
#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq)]
struct RedirectResponse {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_subcode: Option<String>,
    error_description: Option<String>,
}

impl RedirectResponse {
    /// Extracts the code, refusing redirects whose `state` was not issued by
    /// this sign in attempt.
    fn into_authorization_code(self, expected_state: &str) -> Result<String, AuthError> {
        let state_matches = self.state.as_deref() == Some(expected_state);
        match (self.code, self.error) {
            (_, Some(error))
                if error == "access_denied" || self.error_subcode.as_deref() == Some("cancel") =>
            {
                Err(AuthError::Canceled)
            }
            (_, Some(error)) => {
                let err = AuthError::other(format!("Sign in failed: {error}"));
                Err(match self.error_description {
                    Some(description) => err.with_inner(description),
                    None => err,
                })
            }
            (Some(_), None) if !state_matches => {
                warn!("Sign in redirect carried an unexpected state");
                Err(AuthError::other("Sign in failed: state mismatch"))
            }
            (Some(code), None) => Ok(code),
            (None, None) => Err(AuthError::other(
                "The sign in redirect did not carry an authorization code",
            )),
        }
    }
}

async fn handle_redirect(
    (response, sender): (RedirectResponse, RedirectSender),
) -> Result<Box<dyn Reply>, Rejection> {
    let page = if response.error.is_some() {
        "Sign in did not complete. You can close your browser."
    } else {
        "Successfully Logged In! You can close your browser."
    };

    if sender.send(response).is_err() {
        warn!("Redirect arrived after the sign in flow finished");
        return Err(warp::reject());
    }
    Ok(Box::new(page))
}

/// Sets up the loopback route the identity provider redirects to.
/// [Authorization code flow](https://learn.microsoft.com/en-us/entra/identity-platform/v2-oauth2-auth-code-flow)
fn get_routes<F, R>(
    redirection_handler: F,
    sender: RedirectSender,
) -> impl Filter<Extract = (Box<dyn Reply>,), Error = Rejection> + Clone
where
    F: Fn((RedirectResponse, RedirectSender)) -> R + Clone + Send + Sync + 'static,
    R: Future<Output = Result<Box<dyn Reply>, Rejection>> + Send,
{
    let query = warp::query::<RedirectResponse>()
        .map(move |resp: RedirectResponse| (resp, sender.clone()));

    warp::get()
        .and(warp::path("redirect"))
        .and(query)
        .and_then(redirection_handler)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn echo_redirect(
        (response, _): (RedirectResponse, RedirectSender),
    ) -> Result<Box<dyn Reply>, Rejection> {
        Ok(Box::new(warp::reply::json(&response)))
    }

    fn scopes() -> Vec<String> {
        vec!["abc".to_string(), "offline_access".to_string()]
    }

    fn cached(expires_at: Option<DateTime<Utc>>, refresh_token: Option<&str>) -> CachedToken {
        CachedToken {
            access_token: "access".to_string(),
            refresh_token: refresh_token.map(str::to_string),
            expires_at,
            scopes: scopes(),
        }
    }

    #[tokio::test]
    async fn redirect_query_is_matched() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let routes = get_routes(echo_redirect, tx);
        let response = warp::test::request()
            .method("GET")
            .path("/redirect?code=foo&state=bar")
            .reply(&routes)
            .await;
        let got: RedirectResponse = serde_json::from_slice(response.body()).unwrap();
        let want = RedirectResponse {
            code: Some("foo".to_string()),
            state: Some("bar".to_string()),
            ..Default::default()
        };
        assert_eq!(want, got)
    }

    #[tokio::test]
    async fn redirect_is_forwarded_to_the_waiting_flow() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let routes = get_routes(handle_redirect, tx);
        let response = warp::test::request()
            .method("GET")
            .path("/redirect?code=secret-code&state=issued")
            .reply(&routes)
            .await;

        assert_eq!(response.status(), 200);
        let forwarded = rx.try_recv().unwrap();
        assert_eq!(
            forwarded.into_authorization_code("issued"),
            Ok("secret-code".to_string())
        );
    }

    #[tokio::test]
    async fn redirect_after_flow_finished_is_rejected() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let routes = get_routes(handle_redirect, tx);
        let response = warp::test::request()
            .method("GET")
            .path("/redirect?code=late")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 404);
    }

    #[test]
    fn access_denied_means_canceled() {
        let response = RedirectResponse {
            error: Some("access_denied".to_string()),
            ..Default::default()
        };
        assert_eq!(response.into_authorization_code("issued"), Err(AuthError::Canceled));

        let response = RedirectResponse {
            error: Some("login_required".to_string()),
            error_subcode: Some("cancel".to_string()),
            ..Default::default()
        };
        assert_eq!(response.into_authorization_code("issued"), Err(AuthError::Canceled));
    }

    #[test]
    fn redirect_with_foreign_state_is_refused() {
        let forged = RedirectResponse {
            code: Some("injected-code".to_string()),
            state: Some("someone-else".to_string()),
            ..Default::default()
        };
        let err = forged.into_authorization_code("issued").unwrap_err();
        assert_eq!(err, AuthError::other("Sign in failed: state mismatch"));

        let stateless = RedirectResponse {
            code: Some("injected-code".to_string()),
            ..Default::default()
        };
        assert_eq!(
            stateless.into_authorization_code("issued"),
            Err(AuthError::other("Sign in failed: state mismatch"))
        );
    }

    #[test]
    fn other_redirect_errors_carry_the_description() {
        let response = RedirectResponse {
            error: Some("invalid_request".to_string()),
            error_description: Some("AADSTS50011: redirect mismatch".to_string()),
            ..Default::default()
        };
        let err = response.into_authorization_code("issued").unwrap_err();
        assert_eq!(
            err.describe(),
            "Sign in failed: invalid_request Inner Exception : AADSTS50011: redirect mismatch"
        );
    }

    #[test]
    fn lookup_uses_a_fresh_token() {
        let now = Utc::now();
        let token = cached(Some(now + Duration::hours(1)), Some("refresh"));
        assert_eq!(
            lookup_cached(Some(token), &scopes(), now),
            SilentLookup::Ready("access".to_string())
        );
    }

    #[test]
    fn lookup_refreshes_an_expired_token() {
        let now = Utc::now();
        let token = cached(Some(now - Duration::minutes(1)), Some("refresh"));
        assert_eq!(
            lookup_cached(Some(token), &scopes(), now),
            SilentLookup::Refresh("refresh".to_string())
        );
    }

    #[test]
    fn lookup_without_usable_credential_is_not_signed_in() {
        let now = Utc::now();
        assert_eq!(lookup_cached(None, &scopes(), now), SilentLookup::NotSignedIn);

        let expired = cached(Some(now - Duration::minutes(1)), None);
        assert_eq!(lookup_cached(Some(expired), &scopes(), now), SilentLookup::NotSignedIn);

        let narrow = cached(Some(now + Duration::hours(1)), Some("refresh"));
        let wider = vec!["abc".to_string(), "api://todo/write".to_string()];
        assert_eq!(lookup_cached(Some(narrow), &wider, now), SilentLookup::NotSignedIn);
    }

    fn test_config(dir: &tempfile::TempDir, authority: &str) -> Config {
        Config {
            client_id: "abc".to_string(),
            api_base_url: "http://localhost".to_string(),
            authority: authority.to_string(),
            scopes: scopes(),
            redirect_port: 23456,
            token_cache_path: dir.path().join("token_cache.json"),
        }
    }

    #[tokio::test]
    async fn silent_acquisition_reads_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, "https://login.microsoftonline.com/common");
        let provider = GraphTokenProvider::new(&config);

        assert_eq!(provider.acquire_silent(&scopes()).await, Err(AuthError::NotSignedIn));

        TokenCache::new(&config.token_cache_path)
            .store(&cached(Some(Utc::now() + Duration::hours(1)), None))
            .unwrap();
        assert_eq!(provider.acquire_silent(&scopes()).await, Ok("access".to_string()));

        provider.clear_cache().await.unwrap();
        provider.clear_cache().await.unwrap();
        assert_eq!(provider.acquire_silent(&scopes()).await, Err(AuthError::NotSignedIn));
    }

    #[tokio::test]
    async fn rejected_refresh_drops_the_cache() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth2/v2.0/token")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"invalid_grant","error_description":"refresh token expired"}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, &server.url());
        let cache = TokenCache::new(&config.token_cache_path);
        cache
            .store(&cached(Some(Utc::now() - Duration::minutes(1)), Some("old-refresh")))
            .unwrap();
        let provider = GraphTokenProvider::new(&config);

        assert_eq!(provider.acquire_silent(&scopes()).await, Err(AuthError::NotSignedIn));
        mock.assert_async().await;
        assert!(!config.token_cache_path.exists());
    }

    #[tokio::test]
    async fn successful_refresh_replaces_the_cached_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth2/v2.0/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"token_type":"Bearer","expires_in":3600,"scope":"abc offline_access","access_token":"new-access","refresh_token":"new-refresh"}"#,
            )
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, &server.url());
        let cache = TokenCache::new(&config.token_cache_path);
        cache
            .store(&cached(Some(Utc::now() - Duration::minutes(1)), Some("old-refresh")))
            .unwrap();
        let provider = GraphTokenProvider::new(&config);

        assert_eq!(
            provider.acquire_silent(&scopes()).await,
            Ok("new-access".to_string())
        );
        mock.assert_async().await;

        let stored = cache.load().unwrap().unwrap();
        assert_eq!(stored.access_token, "new-access");
        assert_eq!(stored.refresh_token.as_deref(), Some("new-refresh"));
        assert!(!stored.is_expired_at(Utc::now()));
        assert_eq!(
            provider.acquire_silent(&scopes()).await,
            Ok("new-access".to_string())
        );
    }
}
