use std::sync::Arc;

use uuid::Uuid;

use crate::error::Error;
use crate::oauth::{CallbackOutcome, FlowEngine, FlowRequest};
use crate::store::SessionStore;
use crate::{Config, LOG};

#[derive(Clone)]
pub struct Context {
    pub engine: Arc<FlowEngine>,
    pub sessions: Arc<dyn SessionStore>,
    pub config: Arc<Config>,
}

macro_rules! resp {
    (json => $body:expr) => {
        tide::Response::builder(200)
            .body(tide::Body::from_json(&$body)?)
            .build()
    };
    (status => $status:expr, message => $msg:expr) => {
        tide::Response::builder($status)
            .body(serde_json::json!({ "message": $msg }))
            .build()
    };
}

fn error_response(e: &Error) -> tide::Response {
    let status = match e {
        Error::MissingParameters(_)
        | Error::InvalidFlow(_)
        | Error::InvalidState
        | Error::InvalidOrExpiredNonce => 400,
        Error::AccountNotLinked => 401,
        Error::NotFound(_) => 404,
        _ => 500,
    };
    slog::error!(LOG, "request failed: {}", e; "status" => status);
    tide::Response::builder(status)
        .body(serde_json::json!({ "error": e.to_string() }))
        .build()
}

async fn auth_user(req: &tide::Request<Context>) -> Option<Uuid> {
    let cookie = req.cookie("auth_token")?;
    match req.state().sessions.user_for(cookie.value()).await {
        Ok(user) => user,
        Err(e) => {
            slog::error!(LOG, "session lookup failed: {}", e);
            None
        }
    }
}

macro_rules! user_or_unauthorized {
    ($req:expr) => {{
        match auth_user(&$req).await {
            Some(user) => user,
            None => return Ok(resp!(status => 401, message => "missing or invalid session")),
        }
    }};
}

#[derive(serde::Serialize)]
struct Status<'a> {
    ok: &'a str,
    version: &'a str,
}

async fn status(req: tide::Request<Context>) -> tide::Result {
    Ok(resp!(json => Status {
        ok: "ok",
        version: &req.state().config.version,
    }))
}

/// Hand the client an authorization url; identity is established
/// post-callback by matching the spotify id against linked accounts.
async fn login(req: tide::Request<Context>) -> tide::Result {
    match req.state().engine.authorization_url(FlowRequest::Login).await {
        Ok(url) => Ok(resp!(json => serde_json::json!({ "url": url }))),
        Err(e) => Ok(error_response(&e)),
    }
}

async fn link(req: tide::Request<Context>) -> tide::Result {
    let user_id = user_or_unauthorized!(req);
    match req
        .state()
        .engine
        .authorization_url(FlowRequest::Link { user_id })
        .await
    {
        Ok(url) => Ok(resp!(json => serde_json::json!({ "url": url }))),
        Err(e) => Ok(error_response(&e)),
    }
}

async fn restore_playlist(req: tide::Request<Context>) -> tide::Result {
    let user_id = user_or_unauthorized!(req);
    let playlist_id = req.param("playlist_id")?.to_string();
    match req
        .state()
        .engine
        .authorization_url(FlowRequest::Restore {
            user_id,
            playlist_id,
        })
        .await
    {
        Ok(url) => Ok(resp!(json => serde_json::json!({ "url": url }))),
        Err(e) => Ok(error_response(&e)),
    }
}

#[derive(serde::Deserialize)]
struct FileRestoreBody {
    #[serde(rename = "playlistName")]
    playlist_name: String,
    #[serde(rename = "trackIds")]
    track_ids: Vec<String>,
}

async fn file_restore(mut req: tide::Request<Context>) -> tide::Result {
    let user_id = user_or_unauthorized!(req);
    let body: FileRestoreBody = match req.body_json().await {
        Ok(body) => body,
        Err(e) => {
            slog::error!(LOG, "invalid file-restore body: {}", e);
            return Ok(resp!(status => 400, message => "invalid request body"));
        }
    };
    match req
        .state()
        .engine
        .authorization_url(FlowRequest::FileRestore {
            user_id,
            playlist_name: body.playlist_name,
            track_ids: body.track_ids,
        })
        .await
    {
        Ok(url) => Ok(resp!(json => serde_json::json!({ "url": url }))),
        Err(e) => Ok(error_response(&e)),
    }
}

#[derive(serde::Deserialize)]
struct AuthCallback {
    code: Option<String>,
    state: Option<String>,
}

/// The single provider redirect endpoint all four flows come back through.
/// The engine decides what happened; we translate that into a session
/// cookie and/or a redirect back into the client app.
async fn auth_callback(req: tide::Request<Context>) -> tide::Result {
    let ctx = req.state();
    let query: AuthCallback = req.query().map_err(|e| {
        slog::error!(LOG, "callback query parse error: {}", e);
        e
    })?;
    let outcome = ctx
        .engine
        .handle_callback(query.code.as_deref(), query.state.as_deref())
        .await;
    let client_url = &ctx.config.client_url;
    match outcome {
        Ok(CallbackOutcome::LoggedIn { user_id }) => {
            let token = match ctx.sessions.create(user_id).await {
                Ok(token) => token,
                Err(e) => return Ok(error_response(&e)),
            };
            let cookie_str = format!(
                "auth_token={token}; Domain={domain}; Secure; HttpOnly; Max-Age={max_age}; SameSite=Lax",
                token = token,
                domain = ctx.config.domain(),
                max_age = ctx.config.session_ttl_seconds,
            );
            let mut resp: tide::Response =
                tide::Redirect::new(format!("{}/home", client_url)).into();
            resp.insert_header("set-cookie", cookie_str);
            Ok(resp)
        }
        Ok(CallbackOutcome::Linked { .. }) => Ok(tide::Redirect::new(format!(
            "{}/home?firstTimeUser=true",
            client_url
        ))
        .into()),
        Ok(CallbackOutcome::Restored) => Ok(tide::Redirect::new(format!(
            "{}/home?playlistRestored=true",
            client_url
        ))
        .into()),
        Ok(CallbackOutcome::FileRestored) => Ok(tide::Redirect::new(format!(
            "{}/home?fileRestored=true",
            client_url
        ))
        .into()),
        Err(e) => Ok(error_response(&e)),
    }
}

async fn unlink(req: tide::Request<Context>) -> tide::Result {
    let user_id = user_or_unauthorized!(req);
    match req.state().engine.unlink(user_id).await {
        Ok(()) => Ok(resp!(json => serde_json::json!({ "message": "account has been unlinked" }))),
        Err(e) => Ok(error_response(&e)),
    }
}

#[derive(serde::Deserialize)]
struct PageParams {
    offset: Option<usize>,
    limit: Option<usize>,
}

async fn playlists(req: tide::Request<Context>) -> tide::Result {
    let user_id = user_or_unauthorized!(req);
    let params: PageParams = req.query()?;
    match req
        .state()
        .engine
        .playlists(
            user_id,
            params.offset.unwrap_or(0),
            params.limit.unwrap_or(50),
        )
        .await
    {
        Ok(page) => Ok(resp!(json => page)),
        Err(e) => Ok(error_response(&e)),
    }
}

async fn playlist_tracks(req: tide::Request<Context>) -> tide::Result {
    let user_id = user_or_unauthorized!(req);
    let playlist_id = req.param("playlist_id")?.to_string();
    match req
        .state()
        .engine
        .playlist_tracks(user_id, &playlist_id)
        .await
    {
        Ok(tracks) => Ok(resp!(json => serde_json::json!({
            "count": tracks.len(),
            "tracks": tracks,
        }))),
        Err(e) => Ok(error_response(&e)),
    }
}

async fn profile(req: tide::Request<Context>) -> tide::Result {
    let user_id = user_or_unauthorized!(req);
    match req.state().engine.profile(user_id).await {
        Ok(profile) => Ok(resp!(json => profile)),
        Err(e) => Ok(error_response(&e)),
    }
}

pub async fn start(ctx: Context) -> std::io::Result<()> {
    let listen_addr = ctx.config.host();
    let mut app = tide::with_state(ctx);
    app.at("/").get(status);
    app.at("/status").get(status);
    app.at("/login").get(login);
    app.at("/link").get(link);
    app.at("/restore/:playlist_id").get(restore_playlist);
    app.at("/file-restore").post(file_restore);
    app.at("/auth").get(auth_callback);
    app.at("/unlink").post(unlink);
    app.at("/playlists").get(playlists);
    app.at("/playlists/:playlist_id/tracks").get(playlist_tracks);
    app.at("/profile").get(profile);
    app.with(crate::logging::LogMiddleware::new());

    slog::info!(LOG, "running at {}", listen_addr);
    app.listen(listen_addr).await
}
