use crate::error::{Error, Result};
use crate::models::{PlaylistTrack, RefreshedAccess, TokenSet};
use crate::{Config, LOG};

/// Spotify returns playlist tracks in pages of at most 100 items.
pub const TRACK_PAGE_SIZE: usize = 100;
/// Spotify accepts at most 100 uris per add-tracks call.
pub const ADD_BATCH_SIZE: usize = 100;

/// Outbound spotify calls, behind a trait so the flow engine can be
/// exercised with an injected fake.
#[async_trait::async_trait]
pub trait SpotifyApi: Send + Sync {
    /// Exchange an authorization code for a full token set, resolving the
    /// spotify user id via the profile endpoint in the same step.
    async fn exchange_code(&self, code: &str) -> Result<TokenSet>;
    /// `grant_type=refresh_token`; provider errors pass through untouched.
    async fn refresh_access(&self, refresh_token: &str) -> Result<RefreshedAccess>;
    async fn profile(&self, access_token: &str) -> Result<serde_json::Value>;
    /// One page of `/me/playlists`, provider pagination passed through.
    async fn playlists_page(
        &self,
        access_token: &str,
        offset: usize,
        limit: usize,
    ) -> Result<serde_json::Value>;
    async fn playlist_tracks_page(
        &self,
        access_token: &str,
        playlist_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PlaylistTrack>>;
    /// Create a playlist and return its id. The concrete client dates the
    /// name with a `" - Restored MM/DD/YYYY"` suffix at call time.
    async fn create_playlist(
        &self,
        access_token: &str,
        spotify_user_id: &str,
        name: &str,
    ) -> Result<String>;
    async fn add_track_batch(
        &self,
        access_token: &str,
        playlist_id: &str,
        uris: &[String],
    ) -> Result<()>;
}

/// Dated name given to every recreated playlist, using the date of the
/// restore (not the date of the backup).
pub fn restored_name(name: &str, date: chrono::NaiveDate) -> String {
    format!("{} - Restored {}", name, date.format("%m/%d/%Y"))
}

/// Split `track_ids` into sequential batches of `spotify:track:<id>` uris,
/// at most `ADD_BATCH_SIZE` per batch, preserving order.
pub fn track_uri_batches(track_ids: &[String]) -> Vec<Vec<String>> {
    track_ids
        .chunks(ADD_BATCH_SIZE)
        .map(|chunk| {
            chunk
                .iter()
                .map(|id| format!("spotify:track:{}", id))
                .collect()
        })
        .collect()
}

/// Fetch the full ordered track list of a playlist, paging until spotify
/// returns a short page. The whole list is materialized in memory.
pub async fn fetch_all_playlist_tracks(
    api: &dyn SpotifyApi,
    access_token: &str,
    playlist_id: &str,
) -> Result<Vec<PlaylistTrack>> {
    let mut all = vec![];
    let mut offset = 0;
    loop {
        let page = api
            .playlist_tracks_page(access_token, playlist_id, offset, TRACK_PAGE_SIZE)
            .await?;
        let count = page.len();
        all.extend(page);
        if count < TRACK_PAGE_SIZE {
            break;
        }
        offset += TRACK_PAGE_SIZE;
    }
    Ok(all)
}

/// Add tracks in sequential batches. Batch N+1 is not issued until batch N
/// completes; a failing batch aborts immediately and already-inserted
/// batches stay in place.
pub async fn add_tracks(
    api: &dyn SpotifyApi,
    access_token: &str,
    playlist_id: &str,
    track_ids: &[String],
) -> Result<()> {
    for uris in track_uri_batches(track_ids) {
        api.add_track_batch(access_token, playlist_id, &uris).await?;
    }
    Ok(())
}

#[derive(serde::Serialize)]
struct AccessParams {
    grant_type: String,
    code: String,
    redirect_uri: String,
}

#[derive(serde::Serialize)]
struct RefreshParams {
    grant_type: String,
    refresh_token: String,
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

/// surf-backed client for the spotify accounts and web api endpoints.
pub struct SpotifyClient {
    client_id: String,
    client_secret: String,
    token_url: String,
    api_base_url: String,
    redirect_uri: String,
}

impl SpotifyClient {
    pub fn new(config: &Config) -> Self {
        Self {
            client_id: config.spotify_client_id.clone(),
            client_secret: config.spotify_client_secret.clone(),
            token_url: config.spotify_token_url.clone(),
            api_base_url: config.spotify_api_base_url.clone(),
            redirect_uri: config.spotify_redirect_url(),
        }
    }

    fn basic_auth(&self) -> String {
        let auth = base64::encode(format!("{}:{}", self.client_id, self.client_secret).as_bytes());
        format!("Basic {}", auth)
    }

    /// Fail the response if the provider didn't return 2xx, carrying the
    /// status and body. 429 rate-limit signals surface here too; retry
    /// policy belongs to the caller.
    async fn check(mut resp: surf::Response) -> Result<surf::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = u16::from(resp.status());
        let body = resp.body_string().await.unwrap_or_default();
        Err(Error::Provider { status, body })
    }
}

#[async_trait::async_trait]
impl SpotifyApi for SpotifyClient {
    async fn exchange_code(&self, code: &str) -> Result<TokenSet> {
        let params = AccessParams {
            grant_type: "authorization_code".to_string(),
            code: code.to_string(),
            redirect_uri: self.redirect_uri.clone(),
        };
        let mut resp = surf::post(&self.token_url)
            .body(surf::Body::from_form(&params).map_err(|e| Error::Http(format!("form error {}", e)))?)
            .header("authorization", self.basic_auth())
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = u16::from(resp.status());
            let body = resp.body_string().await.unwrap_or_default();
            return Err(Error::TokenExchange(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }
        let token: TokenResponse = resp
            .body_json()
            .await
            .map_err(|e| Error::TokenExchange(format!("token json parse error: {}", e)))?;
        let access_token = token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::TokenExchange("tokens came back empty".to_string()))?;
        let refresh_token = token
            .refresh_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::TokenExchange("tokens came back empty".to_string()))?;
        // shave a minute off the reported lifetime so we refresh before
        // the token actually dies mid-request
        let expires_in = token.expires_in.unwrap_or(3600);
        let expires_at = chrono::Utc::now() + chrono::Duration::seconds(expires_in - 60);

        // resolve the spotify identity right away. A failure here is not a
        // token error - the exchange already succeeded - so it gets its own
        // message and must not be retried as one.
        let profile = self.profile(&access_token).await.map_err(|e| {
            Error::TokenExchange(format!("identity resolution failed after exchange: {}", e))
        })?;
        let spotify_user_id = profile["id"]
            .as_str()
            .ok_or_else(|| {
                Error::TokenExchange("profile response missing user id".to_string())
            })?
            .to_string();

        slog::debug!(LOG, "exchanged code for tokens"; "spotify_user_id" => &spotify_user_id);
        Ok(TokenSet {
            access_token,
            refresh_token,
            spotify_user_id,
            expires_at,
        })
    }

    async fn refresh_access(&self, refresh_token: &str) -> Result<RefreshedAccess> {
        let params = RefreshParams {
            grant_type: "refresh_token".to_string(),
            refresh_token: refresh_token.to_string(),
        };
        let resp = surf::post(&self.token_url)
            .body(surf::Body::from_form(&params).map_err(|e| Error::Http(format!("form error {}", e)))?)
            .header("authorization", self.basic_auth())
            .send()
            .await?;
        let mut resp = Self::check(resp).await?;
        let access: RefreshedAccess = resp
            .body_json()
            .await
            .map_err(|e| Error::Http(format!("refresh json parse error: {}", e)))?;
        Ok(access)
    }

    async fn profile(&self, access_token: &str) -> Result<serde_json::Value> {
        let resp = surf::get(format!("{}/me", self.api_base_url))
            .header("authorization", format!("Bearer {}", access_token))
            .send()
            .await?;
        let mut resp = Self::check(resp).await?;
        Ok(resp
            .body_json()
            .await
            .map_err(|e| Error::Http(format!("profile json error: {}", e)))?)
    }

    async fn playlists_page(
        &self,
        access_token: &str,
        offset: usize,
        limit: usize,
    ) -> Result<serde_json::Value> {
        let resp = surf::get(format!(
            "{}/me/playlists?offset={}&limit={}",
            self.api_base_url, offset, limit
        ))
        .header("authorization", format!("Bearer {}", access_token))
        .send()
        .await?;
        let mut resp = Self::check(resp).await?;
        Ok(resp
            .body_json()
            .await
            .map_err(|e| Error::Http(format!("playlists json error: {}", e)))?)
    }

    async fn playlist_tracks_page(
        &self,
        access_token: &str,
        playlist_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PlaylistTrack>> {
        let resp = surf::get(format!(
            "{}/playlists/{}/tracks?offset={}&limit={}",
            self.api_base_url, playlist_id, offset, limit
        ))
        .header("authorization", format!("Bearer {}", access_token))
        .send()
        .await?;
        let mut resp = Self::check(resp).await?;
        let body: serde_json::Value = resp
            .body_json()
            .await
            .map_err(|e| Error::Http(format!("tracks json error: {}", e)))?;
        let items = body["items"]
            .as_array()
            .ok_or_else(|| Error::Http(format!("items: unexpected shape {:?}", body)))?;
        let mut tracks = Vec::with_capacity(items.len());
        for item in items {
            let track = &item["track"];
            // local files report a null id; they can't be restored anyway
            let id = match track["id"].as_str() {
                Some(id) => id.to_string(),
                None => continue,
            };
            let artist = track["artists"]
                .as_array()
                .map(|artists| {
                    artists
                        .iter()
                        .filter_map(|a| a["name"].as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default();
            tracks.push(PlaylistTrack {
                id,
                name: track["name"].as_str().unwrap_or_default().to_string(),
                artist,
                album: track["album"]["name"].as_str().unwrap_or_default().to_string(),
                added_at: item["added_at"].as_str().and_then(|s| s.parse().ok()),
            });
        }
        Ok(tracks)
    }

    async fn create_playlist(
        &self,
        access_token: &str,
        spotify_user_id: &str,
        name: &str,
    ) -> Result<String> {
        let name = restored_name(name, chrono::Utc::now().date_naive());
        let body = serde_json::json!({
            "name": name,
            "description": "Restored by TuneBacker",
            "public": false,
        });
        let resp = surf::post(format!(
            "{}/users/{}/playlists",
            self.api_base_url, spotify_user_id
        ))
        .header("authorization", format!("Bearer {}", access_token))
        .body(surf::Body::from_json(&body).map_err(|e| Error::Http(format!("json body error {}", e)))?)
        .send()
        .await?;
        let mut resp = Self::check(resp).await?;
        let created: serde_json::Value = resp
            .body_json()
            .await
            .map_err(|e| Error::Http(format!("create playlist json error: {}", e)))?;
        created["id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Http(format!("playlist id: unexpected shape {:?}", created)))
    }

    async fn add_track_batch(
        &self,
        access_token: &str,
        playlist_id: &str,
        uris: &[String],
    ) -> Result<()> {
        let body = serde_json::json!({ "uris": uris });
        let resp = surf::post(format!(
            "{}/playlists/{}/tracks",
            self.api_base_url, playlist_id
        ))
        .header("authorization", format!("Bearer {}", access_token))
        .body(surf::Body::from_json(&body).map_err(|e| Error::Http(format!("json body error {}", e)))?)
        .send()
        .await?;
        Self::check(resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeSpotify;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("track{}", i)).collect()
    }

    #[test]
    fn batches_of_at_most_100_in_order() {
        let batches = track_uri_batches(&ids(250));
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 100);
        assert_eq!(batches[1].len(), 100);
        assert_eq!(batches[2].len(), 50);
        assert_eq!(batches[0][0], "spotify:track:track0");
        assert_eq!(batches[1][0], "spotify:track:track100");
        assert_eq!(batches[2][49], "spotify:track:track249");
    }

    #[test]
    fn short_lists_make_one_batch() {
        let batches = track_uri_batches(&ids(3));
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], vec![
            "spotify:track:track0",
            "spotify:track:track1",
            "spotify:track:track2",
        ]);
    }

    #[test]
    fn restored_name_uses_current_date_format() {
        let date = chrono::NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert_eq!(restored_name("My Mix", date), "My Mix - Restored 03/05/2024");
    }

    #[async_std::test]
    async fn pagination_stops_after_short_page() {
        // 237 tracks come back as pages of 100, 100, 37
        let fake = FakeSpotify::with_tracks(237);
        let all = fetch_all_playlist_tracks(&fake, "token", "playlist")
            .await
            .unwrap();
        assert_eq!(all.len(), 237);
        assert_eq!(all[0].id, "track0");
        assert_eq!(all[236].id, "track236");
        assert_eq!(*fake.pages_served.lock().unwrap(), vec![0, 100, 200]);
    }

    #[async_std::test]
    async fn exact_page_multiple_fetches_one_extra_page() {
        let fake = FakeSpotify::with_tracks(200);
        let all = fetch_all_playlist_tracks(&fake, "token", "playlist")
            .await
            .unwrap();
        assert_eq!(all.len(), 200);
        // the empty third page is what terminates the loop
        assert_eq!(*fake.pages_served.lock().unwrap(), vec![0, 100, 200]);
    }

    #[async_std::test]
    async fn add_tracks_submits_sequential_batches() {
        let fake = FakeSpotify::default();
        add_tracks(&fake, "token", "playlist", &ids(250)).await.unwrap();
        let batches = fake.batches.lock().unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 100);
        assert_eq!(batches[2].len(), 50);
        assert_eq!(batches[0][0], "spotify:track:track0");
    }

    #[async_std::test]
    async fn add_tracks_fails_fast_without_rollback() {
        let mut fake = FakeSpotify::default();
        fake.fail_batches_after = Some(1);
        let err = add_tracks(&fake, "token", "playlist", &ids(250))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider { .. }));
        // the first batch stays in place
        assert_eq!(fake.batches.lock().unwrap().len(), 1);
    }
}
