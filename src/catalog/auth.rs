use crate::{MangadexError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Bearer token pair persisted in the token file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session: String,
    pub refresh: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Asks for a username on stdin and a password without echo.
    pub fn prompt() -> Result<Self> {
        print!("Username: ");
        io::stdout().flush()?;
        let mut username = String::new();
        io::stdin().lock().read_line(&mut username)?;
        let password = rpassword::prompt_password("Password: ")?;
        let username = username.trim().to_string();
        if username.is_empty() {
            return Err(MangadexError::Auth(String::from("empty username")));
        }
        Ok(Self { username, password })
    }
}

/// The current session plus the file it is mirrored to.
///
/// Reads are shared; writers replace the whole session and rewrite the file
/// through a temporary sibling so a crash never leaves half a token behind.
#[derive(Debug)]
pub struct SessionStore {
    path: Option<PathBuf>,
    current: RwLock<Option<Session>>,
}

impl SessionStore {
    /// A store that never touches the disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            current: RwLock::new(None),
        }
    }

    /// Loads the token file if present; an unreadable file counts as logged out.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let current = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Session>(&bytes) {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!("ignoring malformed token file {}: {e}", path.display());
                    None
                }
            },
            Err(_) => None,
        };
        Self {
            path: Some(path),
            current: RwLock::new(current),
        }
    }

    pub fn token(&self) -> Option<String> {
        self.current.read().as_ref().map(|s| s.session.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.current.read().as_ref().map(|s| s.refresh.clone())
    }

    pub fn is_logged_in(&self) -> bool {
        self.current.read().is_some()
    }

    pub fn replace(&self, session: Session) -> Result<()> {
        if let Some(path) = &self.path {
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, serde_json::to_vec(&session)?)?;
            fs::rename(&tmp, path)?;
            debug!("saved session to {}", path.display());
        }
        *self.current.write() = Some(session);
        Ok(())
    }

    pub fn clear(&self) {
        *self.current.write() = None;
    }
}
