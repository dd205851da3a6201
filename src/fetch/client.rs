use async_trait::async_trait;
use reqwest::{Request, Response};

/// Minimal HTTP seam shared by dataset downloads and the Telegram transport.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}
