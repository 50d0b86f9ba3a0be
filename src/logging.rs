use tide::{Middleware, Next, Request};

use crate::LOG;

/// Request logging in our structured format instead of tide's default.
pub struct LogMiddleware;

impl LogMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[tide::utils::async_trait]
impl<State: Clone + Send + Sync + 'static> Middleware<State> for LogMiddleware {
    async fn handle(&self, req: Request<State>, next: Next<'_, State>) -> tide::Result {
        let method = req.method().to_string();
        let path = req.url().path().to_string();
        let start = std::time::Instant::now();
        let resp = next.run(req).await;
        slog::info!(
            LOG, "request";
            "method" => method,
            "path" => path,
            "status" => u16::from(resp.status()),
            "ms" => start.elapsed().as_millis() as u64,
        );
        Ok(resp)
    }
}
