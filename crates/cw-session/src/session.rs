//! Per-request session value

use std::collections::HashMap;

use crate::token::SessionToken;

/// Key/value state for one client.
///
/// `original` is the snapshot loaded when the request started (`None` for a
/// session minted during this request); `pending` holds values set during the
/// request that have not been persisted yet. Reads prefer `pending`.
#[derive(Debug, Clone)]
pub struct Session {
    token: SessionToken,
    original: Option<HashMap<String, String>>,
    pending: HashMap<String, String>,
}

impl Session {
    /// A session that has no row in the store yet.
    pub fn fresh(token: SessionToken) -> Self {
        Self {
            token,
            original: None,
            pending: HashMap::new(),
        }
    }

    /// A session loaded from the store.
    pub fn existing(token: SessionToken, original: HashMap<String, String>) -> Self {
        Self {
            token,
            original: Some(original),
            pending: HashMap::new(),
        }
    }

    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    /// True if the token row has not been written yet.
    pub fn is_new(&self) -> bool {
        self.original.is_none()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pending
            .get(key)
            .or_else(|| self.original.as_ref().and_then(|o| o.get(key)))
            .map(String::as_str)
    }

    /// Stage a value. Nothing touches the store until the session is persisted.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pending.insert(key.into(), value.into());
    }

    /// True if any value was staged during this request.
    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pending.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
