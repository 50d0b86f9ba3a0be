#[derive(sqlx::FromRow, Debug, Clone, serde::Serialize)]
pub struct LinkedAccount {
    // application user this spotify identity is attached to.
    // linking is keyed on this, so re-linking replaces prior tokens.
    pub user_id: uuid::Uuid,
    pub spotify_user_id: String,
    // spotify access token, AES_256_GCM encrypted with the application
    // key and stored as `hex(nonce):hex(ciphertext)`.
    pub access_token: String,
    // refresh token, encrypted and stored the same way.
    pub refresh_token: String,
    // when the current (decrypted) access token stops working
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// Single-use token correlating an outbound authorization url with the
/// inbound callback. Valid only while `now < expires_at`, deleted on first
/// successful use.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct NonceRecord {
    pub nonce: String,
    pub user_id: uuid::Uuid,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// Nonce for the file-restore flow. The uploaded track list stays
/// server-side in blob storage; only the nonce rides in the state payload.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct FileRestoreNonce {
    pub nonce: String,
    pub user_id: uuid::Uuid,
    pub storage_path: String,
    pub playlist_name: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// Last known contents of a tracked playlist, written by the backup job
/// and read-only here.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct BackupSnapshot {
    pub playlist_name: String,
    pub backup_data: serde_json::Value,
}

impl BackupSnapshot {
    /// `backup_data` is the raw track list captured at backup time; restoring
    /// only needs the ids.
    pub fn track_ids(&self) -> Vec<String> {
        self.backup_data
            .as_array()
            .map(|tracks| {
                tracks
                    .iter()
                    .filter_map(|t| t["id"].as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// One playlist item as reported by spotify, reduced to the fields the
/// backup job and the api responses care about.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PlaylistTrack {
    pub id: String,
    pub name: String,
    // all artist names, joined
    pub artist: String,
    pub album: String,
    pub added_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Result of exchanging an authorization code: a full token set plus the
/// spotify identity it belongs to. Incomplete sets are rejected before this
/// struct is ever constructed.
#[derive(Debug, Clone)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub spotify_user_id: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// Provider response to a refresh-token grant. Spotify may or may not
/// rotate the refresh token.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RefreshedAccess {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: u64,
}

/// Shape of the uploaded blob backing a file-restore:
/// `{"trackIds": [...]}` at `restores/<nonce>.json`.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct UploadDoc {
    #[serde(rename = "trackIds")]
    pub track_ids: Vec<String>,
}
