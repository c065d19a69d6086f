// Copyright 2022 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Weak},
    time::Duration,
};

use time::OffsetDateTime;
use tokio::{
    sync::{RwLock, RwLockMappedWriteGuard, RwLockReadGuard, RwLockWriteGuard},
    task::JoinHandle,
};
use ulid::Ulid;

use crate::{Config, Error, Key};

/// Lower bound of the key generation attempt budget, so that an empty
/// registry still gets a few tries
const MIN_KEY_ATTEMPTS: usize = 8;

type SessionMap = HashMap<Key, Session>;

/// The file currently held by a session
#[derive(Debug)]
pub struct Artifact {
    display_name: String,
    storage_location: PathBuf,
    uploaded_at: OffsetDateTime,
}

impl Artifact {
    #[must_use]
    pub fn new(display_name: impl Into<String>, storage_location: impl Into<PathBuf>) -> Self {
        Self {
            display_name: display_name.into(),
            storage_location: storage_location.into(),
            uploaded_at: OffsetDateTime::now_utc(),
        }
    }

    /// Name under which the file is offered to the reader
    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    #[must_use]
    pub fn storage_location(&self) -> &Path {
        &self.storage_location
    }

    #[must_use]
    pub fn uploaded_at(&self) -> OffsetDateTime {
        self.uploaded_at
    }

    /// Delete the backing file
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArtifactRelease`] if the file could not be deleted
    pub async fn release(self) -> Result<(), Error> {
        tokio::fs::remove_file(&self.storage_location)
            .await
            .map_err(|source| Error::ArtifactRelease {
                path: self.storage_location.clone(),
                source,
            })?;
        tracing::info!(path = %self.storage_location.display(), "Deleted file");
        Ok(())
    }

    /// Delete the backing file without waiting for it, logging failures
    pub fn release_in_background(self) {
        tokio::task::spawn(async move {
            if let Err(e) = self.release().await {
                log_release_failure(&e);
            }
        });
    }
}

fn log_release_failure(error: &Error) {
    tracing::warn!(error = error as &dyn std::error::Error, "Failed to release artifact");
}

/// A scheduled removal. Dropping it cancels the task.
struct Timer {
    id: Ulid,
    handle: JoinHandle<()>,
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct Session {
    id: Ulid,
    key: Key,
    created: OffsetDateTime,
    client_identity: String,
    last_alive: OffsetDateTime,
    expires: OffsetDateTime,
    artifact: Option<Artifact>,
    urls: Vec<String>,
    expiry: Timer,
    // Never rearmed, only held so that removing the session cancels it
    _hard_expiry: Timer,
}

impl Session {
    #[must_use]
    pub fn key(&self) -> &Key {
        &self.key
    }

    #[must_use]
    pub fn created(&self) -> OffsetDateTime {
        self.created
    }

    /// The user agent which created the session
    #[must_use]
    pub fn client_identity(&self) -> &str {
        &self.client_identity
    }

    #[must_use]
    pub fn last_alive(&self) -> OffsetDateTime {
        self.last_alive
    }

    /// When the session will be removed, barring another access
    #[must_use]
    pub fn expires(&self) -> OffsetDateTime {
        self.expires
    }

    #[must_use]
    pub fn artifact(&self) -> Option<&Artifact> {
        self.artifact.as_ref()
    }

    #[must_use]
    pub fn urls(&self) -> &[String] {
        &self.urls
    }
}

/// The pairing registry, mapping keys to their live session
#[derive(Clone)]
pub struct Sessions {
    inner: Arc<RwLock<SessionMap>>,
    expire_delay: Duration,
    max_expire_duration: Duration,
}

/// Pick a key not in use, within an attempt budget proportional to the number
/// of live keys
fn generate_key<V>(sessions: &HashMap<Key, V>) -> Result<(Key, usize), Error> {
    let max_attempts = (sessions.len() * 2).max(MIN_KEY_ATTEMPTS);
    for attempt in 1..=max_attempts {
        let key = Key::generate();
        if !sessions.contains_key(&key) {
            return Ok((key, attempt));
        }
    }

    tracing::error!(
        max_attempts,
        live = sessions.len(),
        "Can't generate more keys, map is full"
    );
    Err(Error::RegistryFull)
}

fn remove_locked(sessions: &mut SessionMap, key: &Key) -> bool {
    if let Some(session) = sessions.remove(key) {
        tracing::info!(%key, "Removed key");
        if let Some(artifact) = session.artifact {
            artifact.release_in_background();
        }
        true
    } else {
        tracing::info!(%key, "Tried to remove non-existing key");
        false
    }
}

/// Remove the session behind `key` if it is still the one a timer was armed
/// for. `timer` is checked against the current short-expiry timer, the
/// hard-expiry timer passes `None`.
fn expire(sessions: &mut SessionMap, key: &Key, session_id: Ulid, timer: Option<Ulid>) -> bool {
    let current = sessions.get(key).map_or(false, |session| {
        session.id == session_id && timer.map_or(true, |timer| session.expiry.id == timer)
    });

    if current {
        tracing::info!(%key, "Removing expired key");
        remove_locked(sessions, key)
    } else {
        false
    }
}

fn spawn_timer(
    sessions: Weak<RwLock<SessionMap>>,
    key: Key,
    session_id: Ulid,
    delay: Duration,
    rearmable: bool,
) -> Timer {
    let id = Ulid::new();
    let handle = tokio::task::spawn(async move {
        tokio::time::sleep(delay).await;

        // Nothing to do if the registry was dropped in the meantime
        if let Some(sessions) = sessions.upgrade() {
            let mut sessions = sessions.write().await;
            expire(&mut sessions, &key, session_id, rearmable.then_some(id));
        }
    });

    Timer { id, handle }
}

impl Sessions {
    /// Create an empty registry
    #[must_use]
    pub fn new(expire_delay: Duration, max_expire_duration: Duration) -> Self {
        Self {
            inner: Arc::default(),
            expire_delay,
            max_expire_duration,
        }
    }

    /// Create an empty registry with the expiry settings of `config`
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.expire_delay, config.max_expire_duration)
    }

    #[must_use]
    pub fn expire_delay(&self) -> Duration {
        self.expire_delay
    }

    /// Create a session for the given client and return its key
    ///
    /// # Errors
    ///
    /// Returns [`Error::RegistryFull`] if no free key was found
    pub async fn create_session(&self, client_identity: impl Into<String>) -> Result<Key, Error> {
        let client_identity = client_identity.into();
        let mut sessions = self.inner.write().await;
        tracing::debug!(live = sessions.len(), agent = %client_identity, "Generating unique key");

        let (key, attempts) = generate_key(&sessions)?;

        let id = Ulid::new();
        let now = OffsetDateTime::now_utc();
        let weak = Arc::downgrade(&self.inner);
        let session = Session {
            id,
            key: key.clone(),
            created: now,
            client_identity,
            last_alive: now,
            expires: now + self.expire_delay.min(self.max_expire_duration),
            artifact: None,
            urls: Vec::new(),
            expiry: spawn_timer(weak.clone(), key.clone(), id, self.expire_delay, true),
            _hard_expiry: spawn_timer(weak, key.clone(), id, self.max_expire_duration, false),
        };
        sessions.insert(key.clone(), session);

        tracing::info!(%key, attempts, "Generated key");
        Ok(key)
    }

    /// Find a session in the registry
    pub async fn get(&self, key: &Key) -> Option<RwLockReadGuard<Session>> {
        let sessions = self.inner.read().await;
        RwLockReadGuard::try_map(sessions, |sessions| sessions.get(key)).ok()
    }

    /// Number of live sessions
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    fn rearm(&self, session: &mut Session) {
        // Replacing the timer drops, and so aborts, the previous one
        session.expiry = spawn_timer(
            Arc::downgrade(&self.inner),
            session.key.clone(),
            session.id,
            self.expire_delay,
            true,
        );
        session.last_alive = OffsetDateTime::now_utc();
        session.expires = (session.last_alive + self.expire_delay)
            .min(session.created + self.max_expire_duration);
    }

    /// Extend the short life of a session. Does nothing if the key is unknown.
    pub async fn touch(&self, key: &Key) {
        if let Some(session) = self.inner.write().await.get_mut(key) {
            self.rearm(session);
        }
    }

    /// Check that `client_identity` is the one which created the session,
    /// touching it on success
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownKey`] if there is no such session, and
    /// [`Error::Forbidden`] if the identity does not match
    pub async fn authorize(
        &self,
        key: &Key,
        client_identity: &str,
    ) -> Result<RwLockMappedWriteGuard<Session>, Error> {
        let sessions = self.inner.write().await;
        let mut session = RwLockWriteGuard::try_map(sessions, |sessions| sessions.get_mut(key))
            .map_err(|_| Error::UnknownKey(key.clone()))?;

        if session.client_identity != client_identity {
            tracing::warn!(
                %key,
                expected = %session.client_identity,
                got = %client_identity,
                "User agent doesn't match"
            );
            return Err(Error::Forbidden);
        }

        self.rearm(&mut session);
        Ok(session)
    }

    /// Remove a session, releasing its file. Returns `false` if there was
    /// nothing to remove.
    pub async fn remove(&self, key: &Key) -> bool {
        remove_locked(&mut *self.inner.write().await, key)
    }

    /// Install the file of a session, deleting the one it replaces first. The
    /// registry owns the file from then on, even if the key is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownKey`] if there is no such session
    pub async fn set_artifact(&self, key: &Key, artifact: Artifact) -> Result<(), Error> {
        let mut sessions = self.inner.write().await;
        let session = if let Some(session) = sessions.get_mut(key) {
            session
        } else {
            artifact.release_in_background();
            return Err(Error::UnknownKey(key.clone()));
        };

        if let Some(previous) = session.artifact.take() {
            if let Err(e) = previous.release().await {
                log_release_failure(&e);
            }
        }

        tracing::info!(%key, name = %artifact.display_name, "Installed file");
        session.artifact = Some(artifact);
        self.rearm(session);
        Ok(())
    }

    /// Forget the file of a session. The file itself is left in place.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownKey`] if there is no such session
    pub async fn clear_artifact(&self, key: &Key) -> Result<(), Error> {
        let mut sessions = self.inner.write().await;
        let session = sessions
            .get_mut(key)
            .ok_or_else(|| Error::UnknownKey(key.clone()))?;
        session.artifact = None;
        Ok(())
    }

    /// Add a URL to a session, unless it is empty or already there
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownKey`] if there is no such session
    pub async fn add_url(&self, key: &Key, url: &str) -> Result<(), Error> {
        let mut sessions = self.inner.write().await;
        let session = sessions
            .get_mut(key)
            .ok_or_else(|| Error::UnknownKey(key.clone()))?;

        let url = url.trim();
        if !url.is_empty() && !session.urls.iter().any(|u| u == url) {
            session.urls.push(url.to_owned());
        }

        self.rearm(session);
        Ok(())
    }

    /// Remove every session, waiting for their files to be deleted
    pub async fn shutdown(&self) {
        let drained: Vec<Session> = {
            let mut sessions = self.inner.write().await;
            sessions.drain().map(|(_, session)| session).collect()
        };

        tracing::info!(count = drained.len(), "Tearing down sessions");
        for session in drained {
            if let Some(artifact) = session.artifact {
                if let Err(e) = artifact.release().await {
                    log_release_failure(&e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::{key::KEY_ALPHABET, tests::advance_time};

    const SHORT: Duration = Duration::from_secs(30);
    const HARD: Duration = Duration::from_secs(60 * 60);

    fn sessions() -> Sessions {
        Sessions::new(SHORT, HARD)
    }

    async fn wait_until_deleted(path: &Path) {
        for _ in 0..200 {
            if !path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} was not deleted", path.display());
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let sessions = sessions();
        let key = sessions.create_session("Kobo").await.unwrap();
        assert_eq!(key.as_str().len(), 4);
        assert!(key.as_str().bytes().all(|c| KEY_ALPHABET.contains(&c)));

        let lowercase = Key::from(key.as_str().to_lowercase());
        let session = sessions.get(&lowercase).await.unwrap();
        assert_eq!(session.key(), &key);
        assert_eq!(session.client_identity(), "Kobo");
        assert!(session.artifact().is_none());
        assert!(session.urls().is_empty());
        drop(session);

        assert!(sessions.get(&Key::from("0000")).await.is_none());
    }

    #[tokio::test]
    async fn test_keys_are_unique_under_concurrent_creation() {
        let sessions = sessions();
        let handles: Vec<_> = (0..1000)
            .map(|_| {
                let sessions = sessions.clone();
                tokio::task::spawn(async move { sessions.create_session("agent").await })
            })
            .collect();

        let mut keys = HashSet::new();
        for handle in handles {
            keys.insert(handle.await.unwrap().unwrap());
        }
        assert_eq!(keys.len(), 1000);
        assert_eq!(sessions.len().await, 1000);
    }

    #[test]
    fn test_generate_key_gives_up_when_full() {
        let mut full = HashMap::new();
        for a in KEY_ALPHABET {
            for b in KEY_ALPHABET {
                for c in KEY_ALPHABET {
                    for d in KEY_ALPHABET {
                        let key = String::from_utf8(vec![*a, *b, *c, *d]).unwrap();
                        full.insert(Key::from(key), ());
                    }
                }
            }
        }
        assert_eq!(full.len(), 30usize.pow(4));
        assert!(matches!(generate_key(&full), Err(Error::RegistryFull)));

        let empty: HashMap<Key, ()> = HashMap::new();
        let (_, attempts) = generate_key(&empty).unwrap();
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_touch_extends_short_expiry() {
        let sessions = sessions();
        let key = sessions.create_session("Kindle").await.unwrap();

        advance_time(Duration::from_secs(29)).await;
        sessions.touch(&key).await;

        // The first timer would have fired here
        advance_time(Duration::from_secs(1)).await;
        assert!(sessions.get(&key).await.is_some());

        advance_time(Duration::from_secs(30)).await;
        assert!(sessions.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_expires_without_access() {
        let sessions = sessions();
        let key = sessions.create_session("Kindle").await.unwrap();

        advance_time(SHORT + Duration::from_secs(1)).await;
        assert!(sessions.get(&key).await.is_none());
        assert!(sessions.is_empty().await);
    }

    #[tokio::test]
    async fn test_hard_expiry_ignores_touches() {
        let sessions = sessions();
        let key = sessions.create_session("Kindle").await.unwrap();
        let step = Duration::from_secs(20);

        // 179 × 20s = 3580s
        for _ in 0..179 {
            advance_time(step).await;
            sessions.touch(&key).await;
            assert!(sessions.get(&key).await.is_some());
        }

        let session = sessions.get(&key).await.unwrap();
        assert!(session.expires() <= session.created() + HARD);
        drop(session);

        // Still short of the 3610s short expiry
        advance_time(step + Duration::from_secs(1)).await;
        assert!(sessions.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_stale_timer_does_not_remove() {
        let sessions = sessions();
        let key = sessions.create_session("Kobo").await.unwrap();
        let (id, timer) = {
            let session = sessions.get(&key).await.unwrap();
            (session.id, session.expiry.id)
        };

        let mut map = sessions.inner.write().await;
        // Another session now sitting on the same key
        assert!(!expire(&mut map, &key, Ulid::new(), None));
        // A timer which was rearmed since
        assert!(!expire(&mut map, &key, id, Some(Ulid::new())));
        assert!(map.contains_key(&key));

        assert!(expire(&mut map, &key, id, Some(timer)));
        assert!(!map.contains_key(&key));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let sessions = sessions();
        let key = sessions.create_session("Kobo").await.unwrap();

        assert!(sessions.remove(&key).await);
        assert!(!sessions.remove(&key).await);
        assert!(!sessions.remove(&key).await);
        assert!(sessions.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_set_artifact_releases_previous() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.epub");
        let b = dir.path().join("b.epub");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();

        let sessions = sessions();
        let key = sessions.create_session("Kobo").await.unwrap();

        sessions
            .set_artifact(&key, Artifact::new("a.epub", &a))
            .await
            .unwrap();
        assert!(a.exists());

        sessions
            .set_artifact(&key, Artifact::new("b.epub", &b))
            .await
            .unwrap();
        // Released before `set_artifact` returned
        assert!(!a.exists());
        assert!(b.exists());

        let session = sessions.get(&key).await.unwrap();
        let artifact = session.artifact().unwrap();
        assert_eq!(artifact.display_name(), "b.epub");
        assert_eq!(artifact.storage_location(), b);
    }

    #[tokio::test]
    async fn test_set_artifact_survives_release_failure() {
        let dir = tempfile::tempdir().unwrap();
        let b = dir.path().join("b.pdf");
        std::fs::write(&b, b"b").unwrap();

        let sessions = sessions();
        let key = sessions.create_session("Kobo").await.unwrap();

        sessions
            .set_artifact(&key, Artifact::new("gone.pdf", dir.path().join("gone.pdf")))
            .await
            .unwrap();
        sessions
            .set_artifact(&key, Artifact::new("b.pdf", &b))
            .await
            .unwrap();

        let session = sessions.get(&key).await.unwrap();
        assert_eq!(session.artifact().unwrap().display_name(), "b.pdf");
    }

    #[tokio::test]
    async fn test_set_artifact_unknown_key_releases_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.epub");
        std::fs::write(&a, b"a").unwrap();

        let sessions = sessions();
        let err = sessions
            .set_artifact(&Key::from("AAAA"), Artifact::new("a.epub", &a))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownKey(_)));
        wait_until_deleted(&a).await;
    }

    #[tokio::test]
    async fn test_remove_releases_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.epub");
        std::fs::write(&a, b"a").unwrap();

        let sessions = sessions();
        let key = sessions.create_session("Kobo").await.unwrap();
        sessions
            .set_artifact(&key, Artifact::new("a.epub", &a))
            .await
            .unwrap();

        assert!(sessions.remove(&key).await);
        wait_until_deleted(&a).await;
    }

    #[tokio::test]
    async fn test_clear_artifact_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.epub");
        std::fs::write(&a, b"a").unwrap();

        let sessions = sessions();
        let key = sessions.create_session("Kobo").await.unwrap();
        sessions
            .set_artifact(&key, Artifact::new("a.epub", &a))
            .await
            .unwrap();

        sessions.clear_artifact(&key).await.unwrap();
        assert!(sessions.get(&key).await.unwrap().artifact().is_none());
        assert!(a.exists());

        let err = sessions.clear_artifact(&Key::from("0000")).await;
        assert!(matches!(err, Err(Error::UnknownKey(_))));
    }

    #[tokio::test]
    async fn test_add_url_deduplicates() {
        let sessions = sessions();
        let key = sessions.create_session("Kobo").await.unwrap();

        sessions.add_url(&key, "http://x").await.unwrap();
        sessions.add_url(&key, " http://x ").await.unwrap();
        sessions.add_url(&key, "   ").await.unwrap();
        sessions.add_url(&key, "http://y").await.unwrap();

        let session = sessions.get(&key).await.unwrap();
        assert_eq!(session.urls(), ["http://x", "http://y"]);
        drop(session);

        let err = sessions.add_url(&Key::from("0000"), "http://x").await;
        assert!(matches!(err, Err(Error::UnknownKey(_))));
    }

    #[tokio::test]
    async fn test_authorize() {
        let sessions = sessions();
        let key = sessions.create_session("Kindle/3.0").await.unwrap();

        assert!(matches!(
            sessions.authorize(&key, "Kindle/3.1").await,
            Err(Error::Forbidden)
        ));
        assert!(matches!(
            sessions.authorize(&Key::from("0000"), "Kindle/3.0").await,
            Err(Error::UnknownKey(_))
        ));

        let session = sessions.authorize(&key, "Kindle/3.0").await.unwrap();
        assert_eq!(session.key(), &key);
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.epub");
        std::fs::write(&a, b"a").unwrap();

        let sessions = sessions();
        let key = sessions.create_session("Kobo").await.unwrap();
        sessions.create_session("Kindle").await.unwrap();
        sessions
            .set_artifact(&key, Artifact::new("a.epub", &a))
            .await
            .unwrap();

        sessions.shutdown().await;
        assert!(sessions.is_empty().await);
        assert!(!a.exists());
    }
}
