/*!
Persistence seams: nonces, linked accounts, backup snapshots, sessions
(postgres) and the uploaded-track-list blobs (path-addressed object store).

Everything the flow engine touches goes through a trait so tests can run
against in-memory fakes.
*/
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::crypto;
use crate::error::{Error, Result};
use crate::models::{BackupSnapshot, FileRestoreNonce, LinkedAccount, NonceRecord};
use crate::Config;

#[async_trait::async_trait]
pub trait NonceStore: Send + Sync {
    async fn put(&self, rec: &NonceRecord) -> Result<()>;
    async fn fetch(&self, nonce: &str) -> Result<Option<NonceRecord>>;
    async fn delete(&self, nonce: &str) -> Result<()>;

    async fn put_file(&self, rec: &FileRestoreNonce) -> Result<()>;
    async fn fetch_file(&self, nonce: &str) -> Result<Option<FileRestoreNonce>>;
    async fn delete_file(&self, nonce: &str) -> Result<()>;
}

#[async_trait::async_trait]
pub trait LinkedAccountStore: Send + Sync {
    /// Insert-or-replace keyed on the application user id; re-linking
    /// replaces prior tokens.
    async fn upsert(&self, account: &LinkedAccount) -> Result<()>;
    async fn find_by_spotify_id(&self, spotify_user_id: &str) -> Result<Option<LinkedAccount>>;
    async fn find_by_user(&self, user_id: Uuid) -> Result<Option<LinkedAccount>>;
    async fn update_access_token(
        &self,
        user_id: Uuid,
        encrypted_access: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn delete(&self, user_id: Uuid) -> Result<()>;
}

#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Point lookup; `None` is a normal, expected outcome.
    async fn fetch(&self, user_id: Uuid, playlist_id: &str) -> Result<Option<BackupSnapshot>>;
    /// Used by unlink: stop the backup job from tracking this user.
    async fn deactivate_all(&self, user_id: Uuid) -> Result<()>;
}

#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload_json(&self, path: &str, body: &serde_json::Value) -> Result<()>;
    async fn download(&self, path: &str) -> Result<Vec<u8>>;
    async fn delete(&self, path: &str) -> Result<()>;
}

#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Mint a session token for a user. The plaintext goes back to the
    /// client as a cookie; only its hmac is stored.
    async fn create(&self, user_id: Uuid) -> Result<String>;
    async fn user_for(&self, token: &str) -> Result<Option<Uuid>>;
}

/// Postgres-backed nonce, account and snapshot stores.
pub struct Pg {
    pool: PgPool,
}

impl Pg {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl NonceStore for Pg {
    async fn put(&self, rec: &NonceRecord) -> Result<()> {
        sqlx::query(
            "
            insert into spotify_nonces (nonce, user_id, expires_at)
            values ($1, $2, $3)
            on conflict (nonce) do update set
                user_id = excluded.user_id, expires_at = excluded.expires_at
            ",
        )
        .bind(&rec.nonce)
        .bind(rec.user_id)
        .bind(rec.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch(&self, nonce: &str) -> Result<Option<NonceRecord>> {
        Ok(sqlx::query_as::<_, NonceRecord>(
            "select nonce, user_id, expires_at from spotify_nonces where nonce = $1",
        )
        .bind(nonce)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn delete(&self, nonce: &str) -> Result<()> {
        sqlx::query("delete from spotify_nonces where nonce = $1")
            .bind(nonce)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn put_file(&self, rec: &FileRestoreNonce) -> Result<()> {
        sqlx::query(
            "
            insert into file_restore_nonces
                (nonce, user_id, storage_path, playlist_name, expires_at)
            values ($1, $2, $3, $4, $5)
            on conflict (nonce) do update set
                user_id = excluded.user_id, storage_path = excluded.storage_path,
                playlist_name = excluded.playlist_name, expires_at = excluded.expires_at
            ",
        )
        .bind(&rec.nonce)
        .bind(rec.user_id)
        .bind(&rec.storage_path)
        .bind(&rec.playlist_name)
        .bind(rec.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_file(&self, nonce: &str) -> Result<Option<FileRestoreNonce>> {
        Ok(sqlx::query_as::<_, FileRestoreNonce>(
            "
            select nonce, user_id, storage_path, playlist_name, expires_at
            from file_restore_nonces where nonce = $1
            ",
        )
        .bind(nonce)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn delete_file(&self, nonce: &str) -> Result<()> {
        sqlx::query("delete from file_restore_nonces where nonce = $1")
            .bind(nonce)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl LinkedAccountStore for Pg {
    async fn upsert(&self, account: &LinkedAccount) -> Result<()> {
        sqlx::query(
            "
            insert into spotify_accounts
                (user_id, spotify_user_id, access_token, refresh_token, expires_at)
            values ($1, $2, $3, $4, $5)
            on conflict (user_id) do update set
                spotify_user_id = excluded.spotify_user_id,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                modified = now()
            ",
        )
        .bind(account.user_id)
        .bind(&account.spotify_user_id)
        .bind(&account.access_token)
        .bind(&account.refresh_token)
        .bind(account.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_spotify_id(&self, spotify_user_id: &str) -> Result<Option<LinkedAccount>> {
        Ok(sqlx::query_as::<_, LinkedAccount>(
            "
            select user_id, spotify_user_id, access_token, refresh_token, expires_at
            from spotify_accounts where spotify_user_id = $1
            ",
        )
        .bind(spotify_user_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn find_by_user(&self, user_id: Uuid) -> Result<Option<LinkedAccount>> {
        Ok(sqlx::query_as::<_, LinkedAccount>(
            "
            select user_id, spotify_user_id, access_token, refresh_token, expires_at
            from spotify_accounts where user_id = $1
            ",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn update_access_token(
        &self,
        user_id: Uuid,
        encrypted_access: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "
            update spotify_accounts
                set access_token = $1, expires_at = $2, modified = now()
                where user_id = $3
            ",
        )
        .bind(encrypted_access)
        .bind(expires_at)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, user_id: Uuid) -> Result<()> {
        sqlx::query("delete from spotify_accounts where user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl SnapshotStore for Pg {
    async fn fetch(&self, user_id: Uuid, playlist_id: &str) -> Result<Option<BackupSnapshot>> {
        Ok(sqlx::query_as::<_, BackupSnapshot>(
            "
            select playlist_name, backup_data
            from weekly_backups
            where user_id = $1 and playlist_id = $2
            ",
        )
        .bind(user_id)
        .bind(playlist_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn deactivate_all(&self, user_id: Uuid) -> Result<()> {
        sqlx::query(
            "update weekly_backups set active = false, modified = now() where user_id = $1",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Application sessions, teacher-style: the cookie value is an opaque
/// token, the row stores its hmac and an expiry.
pub struct PgSessionStore {
    pool: PgPool,
    hmac_key: String,
    ttl_seconds: i64,
}

impl PgSessionStore {
    pub fn new(pool: PgPool, config: &Config) -> Self {
        Self {
            pool,
            hmac_key: config.enc_key.clone(),
            ttl_seconds: config.session_ttl_seconds,
        }
    }
}

#[async_trait::async_trait]
impl SessionStore for PgSessionStore {
    async fn create(&self, user_id: Uuid) -> Result<String> {
        let token = crypto::new_token();
        let hash = crypto::hmac_sign(&self.hmac_key, &token);
        let expires = Utc::now() + chrono::Duration::seconds(self.ttl_seconds);
        sqlx::query(
            "
            insert into sessions (hash, user_id, expires)
            values ($1, $2, $3)
            ",
        )
        .bind(&hash)
        .bind(user_id)
        .bind(expires)
        .execute(&self.pool)
        .await?;
        Ok(token)
    }

    async fn user_for(&self, token: &str) -> Result<Option<Uuid>> {
        let hash = crypto::hmac_sign(&self.hmac_key, token);
        let user_id = sqlx::query_scalar::<_, Uuid>(
            "select user_id from sessions where hash = $1 and expires > now()",
        )
        .bind(&hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user_id)
    }
}

/// Path-addressed object store over HTTP (supabase-storage style REST:
/// `{base}/object/{bucket}/{path}`).
pub struct HttpBlobStore {
    base_url: String,
    bucket: String,
    service_key: String,
}

impl HttpBlobStore {
    pub fn new(config: &Config) -> Self {
        Self {
            base_url: config.storage_url.clone(),
            bucket: config.storage_bucket.clone(),
            service_key: config.storage_key.clone(),
        }
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/object/{}/{}", self.base_url, self.bucket, path)
    }
}

#[async_trait::async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload_json(&self, path: &str, body: &serde_json::Value) -> Result<()> {
        let mut resp = surf::post(self.object_url(path))
            .header("authorization", format!("Bearer {}", self.service_key))
            .body(
                surf::Body::from_json(body)
                    .map_err(|e| Error::Storage(format!("json body error: {}", e)))?,
            )
            .send()
            .await
            .map_err(|e| Error::Storage(format!("upload error: {}", e)))?;
        if !resp.status().is_success() {
            let body = resp.body_string().await.unwrap_or_default();
            return Err(Error::Storage(format!(
                "upload failed with {}: {}",
                resp.status(),
                body
            )));
        }
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let mut resp = surf::get(self.object_url(path))
            .header("authorization", format!("Bearer {}", self.service_key))
            .send()
            .await
            .map_err(|e| Error::Storage(format!("download error: {}", e)))?;
        if !resp.status().is_success() {
            return Err(Error::Storage(format!(
                "download failed with {}",
                resp.status()
            )));
        }
        resp.body_bytes()
            .await
            .map_err(|e| Error::Storage(format!("download body error: {}", e)))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let resp = surf::delete(self.object_url(path))
            .header("authorization", format!("Bearer {}", self.service_key))
            .send()
            .await
            .map_err(|e| Error::Storage(format!("delete error: {}", e)))?;
        if !resp.status().is_success() {
            return Err(Error::Storage(format!(
                "delete failed with {}",
                resp.status()
            )));
        }
        Ok(())
    }
}
