/*!
In-memory fakes for the engine's collaborators. Test-only.
*/
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::crypto::TokenCipher;
use crate::error::{Error, Result};
use crate::models::{
    BackupSnapshot, FileRestoreNonce, LinkedAccount, NonceRecord, PlaylistTrack, RefreshedAccess,
    TokenSet,
};
use crate::oauth::{FlowEngine, OauthConfig};
use crate::spotify::SpotifyApi;
use crate::store::{BlobStore, LinkedAccountStore, NonceStore, SnapshotStore};

/// Fake spotify that hands out a fixed token set, serves tracks from an
/// in-memory list and records playlist writes.
pub struct FakeSpotify {
    pub token_set: TokenSet,
    pub tracks: Vec<PlaylistTrack>,
    /// (spotify_user_id, playlist name) per create call
    pub created: Mutex<Vec<(String, String)>>,
    pub batches: Mutex<Vec<Vec<String>>>,
    /// fail add_track_batch once this many batches have landed
    pub fail_batches_after: Option<usize>,
    /// offsets requested from playlist_tracks_page
    pub pages_served: Mutex<Vec<usize>>,
}

impl Default for FakeSpotify {
    fn default() -> Self {
        Self {
            token_set: TokenSet {
                access_token: "access-token".to_string(),
                refresh_token: "refresh-token".to_string(),
                spotify_user_id: "spotify-user".to_string(),
                expires_at: Utc::now() + Duration::minutes(59),
            },
            tracks: vec![],
            created: Mutex::new(vec![]),
            batches: Mutex::new(vec![]),
            fail_batches_after: None,
            pages_served: Mutex::new(vec![]),
        }
    }
}

impl FakeSpotify {
    pub fn with_tracks(n: usize) -> Self {
        let tracks = (0..n)
            .map(|i| PlaylistTrack {
                id: format!("track{}", i),
                name: format!("Track {}", i),
                artist: "Artist".to_string(),
                album: "Album".to_string(),
                added_at: None,
            })
            .collect();
        Self {
            tracks,
            ..Self::default()
        }
    }
}

#[async_trait::async_trait]
impl SpotifyApi for FakeSpotify {
    async fn exchange_code(&self, _code: &str) -> Result<TokenSet> {
        Ok(self.token_set.clone())
    }

    async fn refresh_access(&self, _refresh_token: &str) -> Result<RefreshedAccess> {
        Ok(RefreshedAccess {
            access_token: "refreshed-access".to_string(),
            refresh_token: None,
            expires_in: 3600,
        })
    }

    async fn profile(&self, _access_token: &str) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "id": self.token_set.spotify_user_id }))
    }

    async fn playlists_page(
        &self,
        _access_token: &str,
        offset: usize,
        limit: usize,
    ) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "items": [], "offset": offset, "limit": limit }))
    }

    async fn playlist_tracks_page(
        &self,
        _access_token: &str,
        _playlist_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PlaylistTrack>> {
        self.pages_served.lock().unwrap().push(offset);
        let end = (offset + limit).min(self.tracks.len());
        if offset >= self.tracks.len() {
            return Ok(vec![]);
        }
        Ok(self.tracks[offset..end].to_vec())
    }

    async fn create_playlist(
        &self,
        _access_token: &str,
        spotify_user_id: &str,
        name: &str,
    ) -> Result<String> {
        self.created
            .lock()
            .unwrap()
            .push((spotify_user_id.to_string(), name.to_string()));
        Ok("restored-playlist".to_string())
    }

    async fn add_track_batch(
        &self,
        _access_token: &str,
        _playlist_id: &str,
        uris: &[String],
    ) -> Result<()> {
        let mut batches = self.batches.lock().unwrap();
        if let Some(limit) = self.fail_batches_after {
            if batches.len() >= limit {
                return Err(Error::Provider {
                    status: 502,
                    body: "boom".to_string(),
                });
            }
        }
        batches.push(uris.to_vec());
        Ok(())
    }
}

/// One in-memory store implementing all three relational seams.
#[derive(Default)]
pub struct MemStore {
    pub nonces: Mutex<HashMap<String, NonceRecord>>,
    pub file_nonces: Mutex<HashMap<String, FileRestoreNonce>>,
    pub accounts: Mutex<HashMap<Uuid, LinkedAccount>>,
    pub snapshots: Mutex<HashMap<(Uuid, String), BackupSnapshot>>,
    pub deactivated: Mutex<Vec<Uuid>>,
}

#[async_trait::async_trait]
impl NonceStore for MemStore {
    async fn put(&self, rec: &NonceRecord) -> Result<()> {
        self.nonces
            .lock()
            .unwrap()
            .insert(rec.nonce.clone(), rec.clone());
        Ok(())
    }

    async fn fetch(&self, nonce: &str) -> Result<Option<NonceRecord>> {
        Ok(self.nonces.lock().unwrap().get(nonce).cloned())
    }

    async fn delete(&self, nonce: &str) -> Result<()> {
        self.nonces.lock().unwrap().remove(nonce);
        Ok(())
    }

    async fn put_file(&self, rec: &FileRestoreNonce) -> Result<()> {
        self.file_nonces
            .lock()
            .unwrap()
            .insert(rec.nonce.clone(), rec.clone());
        Ok(())
    }

    async fn fetch_file(&self, nonce: &str) -> Result<Option<FileRestoreNonce>> {
        Ok(self.file_nonces.lock().unwrap().get(nonce).cloned())
    }

    async fn delete_file(&self, nonce: &str) -> Result<()> {
        self.file_nonces.lock().unwrap().remove(nonce);
        Ok(())
    }
}

#[async_trait::async_trait]
impl LinkedAccountStore for MemStore {
    async fn upsert(&self, account: &LinkedAccount) -> Result<()> {
        self.accounts
            .lock()
            .unwrap()
            .insert(account.user_id, account.clone());
        Ok(())
    }

    async fn find_by_spotify_id(&self, spotify_user_id: &str) -> Result<Option<LinkedAccount>> {
        Ok(self
            .accounts
            .lock()
            .unwrap()
            .values()
            .find(|a| a.spotify_user_id == spotify_user_id)
            .cloned())
    }

    async fn find_by_user(&self, user_id: Uuid) -> Result<Option<LinkedAccount>> {
        Ok(self.accounts.lock().unwrap().get(&user_id).cloned())
    }

    async fn update_access_token(
        &self,
        user_id: Uuid,
        encrypted_access: &str,
        expires_at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        if let Some(account) = self.accounts.lock().unwrap().get_mut(&user_id) {
            account.access_token = encrypted_access.to_string();
            account.expires_at = expires_at;
        }
        Ok(())
    }

    async fn delete(&self, user_id: Uuid) -> Result<()> {
        self.accounts.lock().unwrap().remove(&user_id);
        Ok(())
    }
}

#[async_trait::async_trait]
impl SnapshotStore for MemStore {
    async fn fetch(&self, user_id: Uuid, playlist_id: &str) -> Result<Option<BackupSnapshot>> {
        Ok(self
            .snapshots
            .lock()
            .unwrap()
            .get(&(user_id, playlist_id.to_string()))
            .cloned())
    }

    async fn deactivate_all(&self, user_id: Uuid) -> Result<()> {
        self.deactivated.lock().unwrap().push(user_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemBlobStore {
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait::async_trait]
impl BlobStore for MemBlobStore {
    async fn upload_json(&self, path: &str, body: &serde_json::Value) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(path.to_string(), body.to_string().into_bytes());
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Storage(format!("no object at {}", path)))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(path);
        Ok(())
    }
}

/// Cipher that stores tokens as-is, so tests can assert on plaintext.
pub struct IdentityCipher;

impl TokenCipher for IdentityCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        Ok(plaintext.to_string())
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        Ok(ciphertext.to_string())
    }
}

pub fn test_engine(
    spotify: Arc<FakeSpotify>,
    store: Arc<MemStore>,
    blobs: Arc<MemBlobStore>,
) -> FlowEngine {
    FlowEngine::new(
        OauthConfig {
            authorize_url: "https://accounts.spotify.test/authorize".to_string(),
            redirect_uri: "http://localhost:3030/auth".to_string(),
            client_id: "test-client".to_string(),
            scopes: "playlist-read-private playlist-modify-private".to_string(),
        },
        spotify,
        store.clone(),
        store.clone(),
        store,
        blobs,
        Arc::new(IdentityCipher),
    )
}
