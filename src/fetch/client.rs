use async_trait::async_trait;
use reqwest::{Request, Response};

/// Executes feed requests. Wrappers in [`auth`](super::auth) decorate a
/// client with credentials.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}
