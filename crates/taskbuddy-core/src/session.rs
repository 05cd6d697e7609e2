use std::fs;
use std::path::PathBuf;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::Config;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub uid: String,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
}

impl UserIdentity {
    /// Display name, falling back to the uid.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.uid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Unknown,
    Authenticated(UserIdentity),
    Unauthenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Loading,
    Login,
    TaskBoard,
}

/// The identity service boundary.
pub trait IdentityProvider {
    /// The persisted session, if any.
    fn current_user(&self) -> anyhow::Result<Option<UserIdentity>>;

    fn sign_in(&mut self) -> anyhow::Result<UserIdentity>;

    fn sign_out(&mut self) -> anyhow::Result<()>;
}

/// Signs in the identity named by the `identity.*` config keys and keeps the
/// session in a JSON file.
#[derive(Debug, Clone)]
pub struct ProfileIdentity {
    session_path: PathBuf,
    profile: Option<UserIdentity>,
}

impl ProfileIdentity {
    pub fn new(session_path: PathBuf, profile: Option<UserIdentity>) -> Self {
        Self {
            session_path,
            profile,
        }
    }

    pub fn from_config(cfg: &Config, session_path: PathBuf) -> Self {
        let profile = cfg.get("identity.id").map(|uid| UserIdentity {
            uid,
            display_name: cfg.get("identity.name"),
            photo_url: cfg.get("identity.photo"),
        });
        Self::new(session_path, profile)
    }
}

impl IdentityProvider for ProfileIdentity {
    #[tracing::instrument(skip(self), fields(path = %self.session_path.display()))]
    fn current_user(&self) -> anyhow::Result<Option<UserIdentity>> {
        if !self.session_path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.session_path)
            .with_context(|| format!("failed to read {}", self.session_path.display()))?;
        let user = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse {}", self.session_path.display()))?;
        Ok(Some(user))
    }

    #[tracing::instrument(skip(self), fields(path = %self.session_path.display()))]
    fn sign_in(&mut self) -> anyhow::Result<UserIdentity> {
        let user = self
            .profile
            .clone()
            .ok_or_else(|| anyhow!("sign-in cancelled: identity.id is not configured"))?;

        let body = serde_json::to_string_pretty(&user).context("failed to encode session")?;
        fs::write(&self.session_path, body)
            .with_context(|| format!("failed to write {}", self.session_path.display()))?;
        info!(uid = %user.uid, "session stored");
        Ok(user)
    }

    #[tracing::instrument(skip(self), fields(path = %self.session_path.display()))]
    fn sign_out(&mut self) -> anyhow::Result<()> {
        if self.session_path.exists() {
            fs::remove_file(&self.session_path)
                .with_context(|| format!("failed to remove {}", self.session_path.display()))?;
        }
        Ok(())
    }
}

/// Decides which top-level route is shown. Starts `Unknown` until the
/// provider has been asked.
#[derive(Debug)]
pub struct SessionGate<P> {
    provider: P,
    state: SessionState,
}

impl<P: IdentityProvider> SessionGate<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            state: SessionState::Unknown,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn user(&self) -> Option<&UserIdentity> {
        match &self.state {
            SessionState::Authenticated(user) => Some(user),
            SessionState::Unknown | SessionState::Unauthenticated => None,
        }
    }

    pub fn route(&self) -> Route {
        match self.state {
            SessionState::Unknown => Route::Loading,
            SessionState::Authenticated(_) => Route::TaskBoard,
            SessionState::Unauthenticated => Route::Login,
        }
    }

    /// Asks the provider for an existing session. A provider error counts as
    /// signed out.
    pub fn resolve(&mut self) -> &SessionState {
        self.state = match self.provider.current_user() {
            Ok(Some(user)) => SessionState::Authenticated(user),
            Ok(None) => SessionState::Unauthenticated,
            Err(err) => {
                warn!(error = %err, "could not read session");
                SessionState::Unauthenticated
            }
        };
        &self.state
    }

    pub fn resolve_user(&mut self) -> Option<&UserIdentity> {
        self.resolve();
        self.user()
    }

    /// Failures are logged and leave the gate signed out.
    pub fn sign_in(&mut self) -> Option<&UserIdentity> {
        match self.provider.sign_in() {
            Ok(user) => {
                info!(uid = %user.uid, "signed in");
                self.state = SessionState::Authenticated(user);
            }
            Err(err) => {
                error!(error = %err, "error signing in");
                self.state = SessionState::Unauthenticated;
            }
        }
        self.user()
    }

    pub fn logout(&mut self) -> anyhow::Result<()> {
        self.state = SessionState::Unauthenticated;
        self.provider.sign_out()?;
        info!("signed out");
        Ok(())
    }
}
