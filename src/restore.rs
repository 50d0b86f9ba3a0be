use crate::error::{Error, Result};
use crate::spotify::{self, SpotifyApi};
use crate::LOG;

/// Recreate a playlist from a track id sequence: create the dated playlist,
/// then fill it in sequential batches.
///
/// There is no transaction across the two spotify calls. If track insertion
/// fails the playlist stays behind, created but partially filled (or empty),
/// and the error is surfaced to the caller.
pub async fn create_and_fill(
    api: &dyn SpotifyApi,
    access_token: &str,
    spotify_user_id: &str,
    playlist_name: &str,
    track_ids: &[String],
) -> Result<String> {
    if access_token.is_empty()
        || spotify_user_id.is_empty()
        || playlist_name.is_empty()
        || track_ids.is_empty()
    {
        return Err(Error::MissingParameters(
            "access token, spotify user id, playlist name and a non-empty track list",
        ));
    }
    let playlist_id = api
        .create_playlist(access_token, spotify_user_id, playlist_name)
        .await?;
    spotify::add_tracks(api, access_token, &playlist_id, track_ids).await?;
    slog::info!(
        LOG, "playlist restored";
        "playlist_id" => &playlist_id,
        "tracks" => track_ids.len(),
    );
    Ok(playlist_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeSpotify;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("track{}", i)).collect()
    }

    #[async_std::test]
    async fn rejects_missing_parameters() {
        let fake = FakeSpotify::default();
        let err = create_and_fill(&fake, "token", "spotify-user", "", &ids(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingParameters(_)));
        let err = create_and_fill(&fake, "token", "spotify-user", "My Mix", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingParameters(_)));
        assert!(fake.created.lock().unwrap().is_empty());
    }

    #[async_std::test]
    async fn creates_then_fills() {
        let fake = FakeSpotify::default();
        let playlist_id = create_and_fill(&fake, "token", "spotify-user", "My Mix", &ids(150))
            .await
            .unwrap();
        let created = fake.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0], ("spotify-user".to_string(), "My Mix".to_string()));
        let batches = fake.batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 100);
        assert_eq!(batches[1].len(), 50);
        assert_eq!(playlist_id, "restored-playlist");
    }

    #[async_std::test]
    async fn insertion_failure_leaves_created_playlist() {
        let mut fake = FakeSpotify::default();
        fake.fail_batches_after = Some(1);
        let err = create_and_fill(&fake, "token", "spotify-user", "My Mix", &ids(250))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider { .. }));
        // playlist creation is not rolled back; one batch made it in
        assert_eq!(fake.created.lock().unwrap().len(), 1);
        assert_eq!(fake.batches.lock().unwrap().len(), 1);
    }
}
