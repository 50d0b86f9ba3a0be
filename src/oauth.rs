/*!
The oauth flow engine.

Four distinct authorization purposes run through a single provider
callback: logging in an already-linked user, linking a spotify identity to
an application account, restoring a playlist from a stored backup snapshot,
and restoring from an uploaded track list staged in blob storage. The flow
is multiplexed through the provider `state` parameter, which carries a
json-tagged payload that comes back attacker-controlled and is re-validated
on return.
*/
use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::crypto::{self, TokenCipher};
use crate::error::{Error, Result};
use crate::models::{FileRestoreNonce, LinkedAccount, NonceRecord, PlaylistTrack, TokenSet, UploadDoc};
use crate::restore;
use crate::spotify::{self, SpotifyApi};
use crate::store::{BlobStore, LinkedAccountStore, NonceStore, SnapshotStore};
use crate::LOG;

/// Nonces expire unconsumed after five minutes.
pub const NONCE_TTL_MINUTES: i64 = 5;

/// Provider endpoint and client identity baked in at startup so the engine
/// never reads ambient global state.
#[derive(Debug, Clone)]
pub struct OauthConfig {
    pub authorize_url: String,
    pub redirect_uri: String,
    pub client_id: String,
    pub scopes: String,
}

/// What a caller wants an authorization url for, with the flow-specific
/// context each purpose requires.
#[derive(Debug, Clone)]
pub enum FlowRequest {
    Login,
    Link {
        user_id: Uuid,
    },
    Restore {
        user_id: Uuid,
        playlist_id: String,
    },
    FileRestore {
        user_id: Uuid,
        playlist_name: String,
        track_ids: Vec<String>,
    },
}

/// The tagged payload round-tripped through the provider `state` query
/// parameter. `restore` deliberately carries the playlist id client-side
/// (it is non-sensitive); the file-restore equivalent stays server-side
/// behind the nonce.
#[derive(Debug, Clone, PartialEq)]
pub enum StatePayload {
    Login,
    Link { nonce: String },
    Restore { nonce: String, playlist_id: String },
    FileRestore { nonce: String },
}

impl StatePayload {
    pub fn to_json(&self) -> String {
        match self {
            StatePayload::Login => serde_json::json!({ "flow": "login" }),
            StatePayload::Link { nonce } => serde_json::json!({ "flow": "link", "nonce": nonce }),
            StatePayload::Restore { nonce, playlist_id } => {
                serde_json::json!({ "flow": "restore", "nonce": nonce, "playlistId": playlist_id })
            }
            StatePayload::FileRestore { nonce } => {
                serde_json::json!({ "flow": "fileRestore", "nonce": nonce })
            }
        }
        .to_string()
    }

    /// Parse-then-validate the echoed state. Unknown tags are rejected at
    /// the boundary instead of falling through.
    pub fn parse(raw: &str) -> Result<Self> {
        let v: serde_json::Value = serde_json::from_str(raw).map_err(|_| Error::InvalidState)?;
        let flow = v["flow"].as_str().ok_or(Error::InvalidState)?;
        let nonce = |v: &serde_json::Value| -> Result<String> {
            v["nonce"]
                .as_str()
                .filter(|n| !n.is_empty())
                .map(|n| n.to_string())
                .ok_or(Error::InvalidState)
        };
        match flow {
            "login" => Ok(StatePayload::Login),
            "link" => Ok(StatePayload::Link { nonce: nonce(&v)? }),
            "restore" => Ok(StatePayload::Restore {
                nonce: nonce(&v)?,
                playlist_id: v["playlistId"]
                    .as_str()
                    .filter(|p| !p.is_empty())
                    .map(|p| p.to_string())
                    .ok_or(Error::InvalidState)?,
            }),
            "fileRestore" => Ok(StatePayload::FileRestore { nonce: nonce(&v)? }),
            other => Err(Error::InvalidFlow(other.to_string())),
        }
    }
}

/// Which of the four post-callback actions the caller should take. Session
/// issuance and redirect targets belong to the http layer, not here.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackOutcome {
    LoggedIn { user_id: Uuid },
    Linked { user_id: Uuid },
    Restored,
    FileRestored,
}

pub struct FlowEngine {
    config: OauthConfig,
    spotify: Arc<dyn SpotifyApi>,
    nonces: Arc<dyn NonceStore>,
    accounts: Arc<dyn LinkedAccountStore>,
    snapshots: Arc<dyn SnapshotStore>,
    blobs: Arc<dyn BlobStore>,
    cipher: Arc<dyn TokenCipher>,
}

impl FlowEngine {
    pub fn new(
        config: OauthConfig,
        spotify: Arc<dyn SpotifyApi>,
        nonces: Arc<dyn NonceStore>,
        accounts: Arc<dyn LinkedAccountStore>,
        snapshots: Arc<dyn SnapshotStore>,
        blobs: Arc<dyn BlobStore>,
        cipher: Arc<dyn TokenCipher>,
    ) -> Self {
        Self {
            config,
            spotify,
            nonces,
            accounts,
            snapshots,
            blobs,
            cipher,
        }
    }

    fn nonce_expiry() -> chrono::DateTime<Utc> {
        Utc::now() + Duration::minutes(NONCE_TTL_MINUTES)
    }

    /// Build the provider authorization url for a flow, persisting whatever
    /// correlation state the flow needs before the user leaves for spotify.
    pub async fn authorization_url(&self, request: FlowRequest) -> Result<String> {
        let state = match request {
            FlowRequest::Login => StatePayload::Login,
            FlowRequest::Link { user_id } => {
                let nonce = crypto::new_token();
                self.nonces
                    .put(&NonceRecord {
                        nonce: nonce.clone(),
                        user_id,
                        expires_at: Self::nonce_expiry(),
                    })
                    .await?;
                StatePayload::Link { nonce }
            }
            FlowRequest::Restore {
                user_id,
                playlist_id,
            } => {
                if playlist_id.is_empty() {
                    return Err(Error::MissingParameters("playlist id"));
                }
                let nonce = crypto::new_token();
                self.nonces
                    .put(&NonceRecord {
                        nonce: nonce.clone(),
                        user_id,
                        expires_at: Self::nonce_expiry(),
                    })
                    .await?;
                // the playlist id is non-sensitive, so it rides in the
                // state payload instead of the nonce record
                StatePayload::Restore { nonce, playlist_id }
            }
            FlowRequest::FileRestore {
                user_id,
                playlist_name,
                track_ids,
            } => {
                if playlist_name.is_empty() || track_ids.is_empty() {
                    return Err(Error::MissingParameters(
                        "playlist name and a non-empty track list",
                    ));
                }
                let nonce = crypto::new_token();
                let storage_path = format!("restores/{}.json", nonce);
                let doc = UploadDoc { track_ids };
                self.blobs
                    .upload_json(&storage_path, &serde_json::to_value(&doc).map_err(|e| {
                        Error::Storage(format!("upload doc serialize error: {}", e))
                    })?)
                    .await?;
                self.nonces
                    .put_file(&FileRestoreNonce {
                        nonce: nonce.clone(),
                        user_id,
                        storage_path,
                        playlist_name,
                        expires_at: Self::nonce_expiry(),
                    })
                    .await?;
                StatePayload::FileRestore { nonce }
            }
        };

        let state_json = state.to_json();
        let query = serde_urlencoded::to_string(&[
            ("response_type", "code"),
            ("scope", self.config.scopes.as_str()),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("show_dialog", "true"),
            ("state", state_json.as_str()),
        ])
        .map_err(|e| Error::Http(format!("query encode error: {}", e)))?;
        Ok(format!("{}?{}", self.config.authorize_url, query))
    }

    /// Handle the provider redirect: validate the echoed state, exchange
    /// the code, then dispatch to the flow the state was tagged with.
    pub async fn handle_callback(
        &self,
        code: Option<&str>,
        state: Option<&str>,
    ) -> Result<CallbackOutcome> {
        let code = code
            .filter(|c| !c.is_empty())
            .ok_or(Error::MissingParameters("authorization code"))?;
        let state = state
            .filter(|s| !s.is_empty())
            .ok_or(Error::MissingParameters("oauth state"))?;
        let state = StatePayload::parse(state)?;

        // all-or-nothing: an incomplete token set or a failed identity
        // lookup fails the whole callback before anything is persisted
        let tokens = self.spotify.exchange_code(code).await?;

        match state {
            StatePayload::Login => self.login(&tokens).await,
            StatePayload::Link { nonce } => self.link(&nonce, &tokens).await,
            StatePayload::Restore { nonce, playlist_id } => {
                self.restore(&nonce, &playlist_id, &tokens).await
            }
            StatePayload::FileRestore { nonce } => self.file_restore(&nonce, &tokens).await,
        }
    }

    /// Load, expiry-check and delete a nonce. Deletion happens before any
    /// further work: a consumed nonce is never retried, and a concurrent
    /// callback racing on the same nonce sees "not found" here.
    async fn consume_nonce(&self, nonce: &str) -> Result<NonceRecord> {
        let rec = self
            .nonces
            .fetch(nonce)
            .await?
            .ok_or(Error::InvalidOrExpiredNonce)?;
        if rec.expires_at < Utc::now() {
            return Err(Error::InvalidOrExpiredNonce);
        }
        self.nonces.delete(nonce).await?;
        Ok(rec)
    }

    async fn consume_file_nonce(&self, nonce: &str) -> Result<FileRestoreNonce> {
        let rec = self
            .nonces
            .fetch_file(nonce)
            .await?
            .ok_or(Error::InvalidOrExpiredNonce)?;
        if rec.expires_at < Utc::now() {
            return Err(Error::InvalidOrExpiredNonce);
        }
        self.nonces.delete_file(nonce).await?;
        Ok(rec)
    }

    /// Encrypt and upsert a token set under an application user. Upsert is
    /// idempotent, so a handler failing after this point leaves nothing to
    /// roll back.
    async fn upsert_tokens(&self, user_id: Uuid, tokens: &TokenSet) -> Result<()> {
        let account = LinkedAccount {
            user_id,
            spotify_user_id: tokens.spotify_user_id.clone(),
            access_token: self.cipher.encrypt(&tokens.access_token)?,
            refresh_token: self.cipher.encrypt(&tokens.refresh_token)?,
            expires_at: tokens.expires_at,
        };
        self.accounts.upsert(&account).await
    }

    /// Login never auto-creates a link; linking is its own explicit flow.
    async fn login(&self, tokens: &TokenSet) -> Result<CallbackOutcome> {
        let account = self
            .accounts
            .find_by_spotify_id(&tokens.spotify_user_id)
            .await?
            .ok_or(Error::AccountNotLinked)?;
        self.upsert_tokens(account.user_id, tokens).await?;
        slog::info!(
            LOG, "completing spotify login";
            "user_id" => account.user_id.to_string(),
        );
        Ok(CallbackOutcome::LoggedIn {
            user_id: account.user_id,
        })
    }

    async fn link(&self, nonce: &str, tokens: &TokenSet) -> Result<CallbackOutcome> {
        let rec = self.consume_nonce(nonce).await?;
        self.upsert_tokens(rec.user_id, tokens).await?;
        slog::info!(
            LOG, "linked spotify account";
            "user_id" => rec.user_id.to_string(),
            "spotify_user_id" => &tokens.spotify_user_id,
        );
        Ok(CallbackOutcome::Linked {
            user_id: rec.user_id,
        })
    }

    async fn restore(
        &self,
        nonce: &str,
        playlist_id: &str,
        tokens: &TokenSet,
    ) -> Result<CallbackOutcome> {
        let rec = self.consume_nonce(nonce).await?;
        let snapshot = self
            .snapshots
            .fetch(rec.user_id, playlist_id)
            .await?
            .ok_or(Error::NotFound("no backup found for this playlist"))?;
        let track_ids = snapshot.track_ids();
        restore::create_and_fill(
            self.spotify.as_ref(),
            &tokens.access_token,
            &tokens.spotify_user_id,
            &snapshot.playlist_name,
            &track_ids,
        )
        .await?;
        Ok(CallbackOutcome::Restored)
    }

    async fn file_restore(&self, nonce: &str, tokens: &TokenSet) -> Result<CallbackOutcome> {
        let rec = self.consume_file_nonce(nonce).await?;
        let bytes = self.blobs.download(&rec.storage_path).await?;
        let doc: UploadDoc = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Storage(format!("malformed upload blob: {}", e)))?;
        self.blobs.delete(&rec.storage_path).await?;
        restore::create_and_fill(
            self.spotify.as_ref(),
            &tokens.access_token,
            &tokens.spotify_user_id,
            &rec.playlist_name,
            &doc.track_ids,
        )
        .await?;
        Ok(CallbackOutcome::FileRestored)
    }

    /// Detach the spotify identity and stop the backup job from tracking
    /// this user. A later login flow for the same spotify identity fails
    /// with `AccountNotLinked` until the user re-links.
    pub async fn unlink(&self, user_id: Uuid) -> Result<()> {
        self.accounts.delete(user_id).await?;
        self.snapshots.deactivate_all(user_id).await?;
        slog::info!(LOG, "unlinked spotify account"; "user_id" => user_id.to_string());
        Ok(())
    }

    /// Decrypted access token for a user, refreshing through the provider
    /// first when the stored one has expired. Expired tokens never retry
    /// inside the spotify client; this is the one place refresh happens.
    pub async fn access_token_for(&self, user_id: Uuid) -> Result<String> {
        let account = self
            .accounts
            .find_by_user(user_id)
            .await?
            .ok_or(Error::AccountNotLinked)?;
        if account.expires_at > Utc::now() {
            return self.cipher.decrypt(&account.access_token);
        }

        slog::info!(LOG, "refreshing spotify access token"; "user_id" => user_id.to_string());
        let refresh_token = self.cipher.decrypt(&account.refresh_token)?;
        let fresh = self.spotify.refresh_access(&refresh_token).await?;
        let expires_at = Utc::now() + Duration::seconds(fresh.expires_in as i64 - 60);
        let encrypted = self.cipher.encrypt(&fresh.access_token)?;
        self.accounts
            .update_access_token(user_id, &encrypted, expires_at)
            .await?;
        Ok(fresh.access_token)
    }

    pub async fn playlists(
        &self,
        user_id: Uuid,
        offset: usize,
        limit: usize,
    ) -> Result<serde_json::Value> {
        let token = self.access_token_for(user_id).await?;
        self.spotify.playlists_page(&token, offset, limit).await
    }

    pub async fn playlist_tracks(
        &self,
        user_id: Uuid,
        playlist_id: &str,
    ) -> Result<Vec<PlaylistTrack>> {
        let token = self.access_token_for(user_id).await?;
        spotify::fetch_all_playlist_tracks(self.spotify.as_ref(), &token, playlist_id).await
    }

    pub async fn profile(&self, user_id: Uuid) -> Result<serde_json::Value> {
        let token = self.access_token_for(user_id).await?;
        self.spotify.profile(&token).await
    }
}
