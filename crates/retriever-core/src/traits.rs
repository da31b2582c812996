use std::future::Future;

use indexmap::IndexMap;

use crate::error::AppError;

/// Issues HTTP GET requests and returns the raw response body.
///
/// One value is one session: clones share the underlying connection pool.
/// Non-success status codes must be reported as [`AppError::HttpStatus`];
/// connectivity failures as [`AppError::NetworkError`] or
/// [`AppError::Timeout`].
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(
        &self,
        url: &str,
        headers: &IndexMap<String, String>,
    ) -> impl Future<Output = Result<Vec<u8>, AppError>> + Send;

    /// A new session with its own connection pool and the same settings.
    fn new_session(&self) -> Result<Self, AppError>;
}
