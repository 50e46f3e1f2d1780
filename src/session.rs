use crate::auth::TokenProvider;
use crate::error::{AuthError, ClientError};
use crate::todo::{TodoItem, TodoTransport};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const EMPTY_TITLE_MESSAGE: &str = "Please enter a value for the To Do item name";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    SignedOut,
    SignedIn,
}

impl SessionState {
    /// Caption of the sign in button: it doubles as "sign out" once signed in.
    pub fn label(self) -> &'static str {
        match self {
            SessionState::SignedOut => "Sign In",
            SessionState::SignedIn => "Clear Cache",
        }
    }
}

/// Everything the front end renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    pub state: SessionState,
    pub items: Vec<TodoItem>,
    pub input: String,
}

#[derive(Debug)]
struct Inner {
    state: SessionState,
    token: Option<String>,
    items: Vec<TodoItem>,
    input: String,
}

/// Owns the sign in state and the bound to-do list. Each public operation is
/// one user action; overlapping calls are neither serialized nor canceled.
pub struct SessionController {
    provider: Arc<dyn TokenProvider>,
    transport: Arc<dyn TodoTransport>,
    scopes: Vec<String>,
    inner: RwLock<Inner>,
}

impl SessionController {
    pub fn new(
        provider: Arc<dyn TokenProvider>,
        transport: Arc<dyn TodoTransport>,
        scopes: Vec<String>,
    ) -> Self {
        SessionController {
            provider,
            transport,
            scopes,
            inner: RwLock::new(Inner {
                state: SessionState::SignedOut,
                token: None,
                items: Vec::new(),
                input: String::new(),
            }),
        }
    }

    pub async fn snapshot(&self) -> View {
        let inner = self.inner.read().await;
        View {
            state: inner.state,
            items: inner.items.clone(),
            input: inner.input.clone(),
        }
    }

    pub async fn state(&self) -> SessionState {
        self.inner.read().await.state
    }

    pub async fn set_input(&self, text: impl Into<String>) {
        self.inner.write().await.input = text.into();
    }

    /// Startup: picks up a cached sign in if there is one. A missing
    /// credential is not an error here.
    pub async fn initialize(&self) -> Result<(), ClientError> {
        match self.provider.acquire_silent(&self.scopes).await {
            Ok(token) => {
                self.signed_in(token).await;
                self.list_items().await
            }
            Err(AuthError::NotSignedIn) => {
                debug!("No cached credential, starting signed out");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err.describe(), "Silent sign in failed at startup");
                Err(err.into())
            }
        }
    }

    /// Sign in button. Signs out instead when already signed in.
    pub async fn sign_in(&self) -> Result<(), ClientError> {
        if self.state().await == SessionState::SignedIn {
            return self.sign_out().await;
        }

        match self.provider.acquire_interactive(&self.scopes).await {
            Ok(token) => {
                self.signed_in(token).await;
                self.list_items().await
            }
            Err(err) => {
                match &err {
                    AuthError::Canceled => info!("Sign in canceled"),
                    other => warn!(error = %other.describe(), "Interactive sign in failed"),
                }
                Err(err.into())
            }
        }
    }

    /// Clears the list, the token cache and any session artifacts. Safe to
    /// repeat.
    pub async fn sign_out(&self) -> Result<(), ClientError> {
        {
            let mut inner = self.inner.write().await;
            debug!(had_token = inner.token.is_some(), "Clearing session");
            inner.items.clear();
            inner.token = None;
            inner.state = SessionState::SignedOut;
        }
        self.provider.clear_cache().await?;
        self.provider.clear_session_artifacts().await?;
        info!("Signed out");
        Ok(())
    }

    pub async fn list_items(&self) -> Result<(), ClientError> {
        let token = self.resolve_token().await?;
        let items = self.transport.get_items(&token).await.map_err(|err| {
            warn!(error = %err, "Fetching the to-do list failed");
            ClientError::from(err)
        })?;
        debug!(count = items.len(), "To-do list replaced");
        self.inner.write().await.items = items;
        Ok(())
    }

    pub async fn add_item(&self, title: &str) -> Result<(), ClientError> {
        if title.trim().is_empty() {
            return Err(ClientError::ValidationFailure(EMPTY_TITLE_MESSAGE.to_string()));
        }

        let token = self.resolve_token().await?;
        self.transport.post_item(&token, title).await.map_err(|err| {
            warn!(error = %err, "Adding a to-do item failed");
            ClientError::from(err)
        })?;
        info!(title, "To-do item added");

        self.inner.write().await.input.clear();
        self.list_items().await
    }

    /// Adds whatever is currently in the input field.
    pub async fn submit_input(&self) -> Result<(), ClientError> {
        let title = self.inner.read().await.input.clone();
        self.add_item(&title).await
    }

    async fn signed_in(&self, token: String) {
        let mut inner = self.inner.write().await;
        inner.token = Some(token);
        inner.state = SessionState::SignedIn;
        info!("Signed in");
    }

    /// Silent acquisition for an API call. A missing credential forces the
    /// session back to signed out.
    async fn resolve_token(&self) -> Result<String, ClientError> {
        match self.provider.acquire_silent(&self.scopes).await {
            Ok(token) => {
                self.inner.write().await.token = Some(token.clone());
                Ok(token)
            }
            Err(AuthError::NotSignedIn) => {
                let mut inner = self.inner.write().await;
                inner.token = None;
                inner.state = SessionState::SignedOut;
                Err(ClientError::NotSignedIn)
            }
            Err(err) => {
                warn!(error = %err.describe(), "Silent token acquisition failed");
                Err(err.into())
            }
        }
    }
}
