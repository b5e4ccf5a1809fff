//! Bearer credential consumed by authenticated backend calls.
//!
//! Session issuance lives elsewhere. This type only carries the token and
//! the "currently authenticated" flag, and makes sure a rejected credential
//! is surfaced once instead of being replayed against the backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::{error, info};
use zeroize::Zeroizing;

use crate::error::{OpsdeckError, Result};

pub struct Session {
    token: RwLock<Option<Zeroizing<String>>>,
    authenticated: AtomicBool,
    rejection_reported: AtomicBool,
}

impl Session {
    pub fn new(token: Option<String>) -> Self {
        let authenticated = token.as_deref().is_some_and(|t| !t.trim().is_empty());
        Self {
            token: RwLock::new(token.map(Zeroizing::new)),
            authenticated: AtomicBool::new(authenticated),
            rejection_reported: AtomicBool::new(false),
        }
    }

    pub fn anonymous() -> Self {
        Self::new(None)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// `Authorization` header value, if a token is held
    pub fn bearer(&self) -> Option<String> {
        let guard = self.token.read().unwrap_or_else(|p| p.into_inner());
        guard.as_ref().map(|t| format!("Bearer {}", t.as_str()))
    }

    /// Fail fast for calls that need a valid credential
    pub fn require(&self) -> Result<()> {
        if self.is_authenticated() {
            Ok(())
        } else {
            Err(OpsdeckError::Unauthenticated(
                "no valid session; sign in again".to_string(),
            ))
        }
    }

    /// Record a 401/403. Returns true only for the first rejection since the
    /// last renewal, which is the one that gets reported.
    pub fn reject(&self, detail: &str) -> bool {
        self.authenticated.store(false, Ordering::SeqCst);
        let first = !self.rejection_reported.swap(true, Ordering::SeqCst);
        if first {
            error!("Backend rejected the session credential: {}", detail);
        }
        first
    }

    /// Install a freshly issued token
    pub fn renew(&self, token: String) {
        let mut guard = self.token.write().unwrap_or_else(|p| p.into_inner());
        *guard = Some(Zeroizing::new(token));
        self.authenticated.store(true, Ordering::SeqCst);
        self.rejection_reported.store(false, Ordering::SeqCst);
        info!("Session credential renewed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("authenticated", &self.is_authenticated())
            .finish_non_exhaustive()
    }
}
