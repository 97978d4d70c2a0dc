//! Token collaborators.
//!
//! Tandem does not know where tokens come from. A [`TokenProvider`] fetches
//! fresh ones (from an auth server, a login flow, a test fixture) and a
//! [`TokenStore`] keeps the current one across client restarts.

use std::future::Future;
use std::sync::RwLock;

use futures_util::future::BoxFuture;

/// Fetches a fresh token.
///
/// Implemented for every `Fn() -> impl Future<Output = Result<String, E>>`
/// closure, so an `async` block does the job:
///
/// ```
/// # use tandem::TokenProvider;
/// fn provider() -> impl TokenProvider {
///     || async { Ok::<_, std::io::Error>("secret".to_string()) }
/// }
/// ```
pub trait TokenProvider: Send + Sync + 'static {
    /// Returns a token, or a description of why there is none.
    fn fetch(&self) -> BoxFuture<'static, Result<String, String>>;
}

impl<F, Fut, E> TokenProvider for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, E>> + Send + 'static,
    E: std::fmt::Display,
{
    fn fetch(&self) -> BoxFuture<'static, Result<String, String>> {
        let fut = self();
        Box::pin(async move { fut.await.map_err(|e| e.to_string()) })
    }
}

/// Synchronous storage for a single token.
pub trait TokenStore: Send + Sync + 'static {
    fn load(&self) -> Option<String>;

    fn save(&self, token: &str);

    fn clear(&self);
}

impl<T: TokenStore + ?Sized> TokenStore for std::sync::Arc<T> {
    fn load(&self) -> Option<String> {
        (**self).load()
    }

    fn save(&self, token: &str) {
        (**self).save(token)
    }

    fn clear(&self) {
        (**self).clear()
    }
}

/// A [`TokenStore`] that lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: RwLock<Option<String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `token`.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Option<String> {
        match self.token.read() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn save(&self, token: &str) {
        let mut slot = match self.token.write() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(token.to_owned());
    }

    fn clear(&self) {
        let mut slot = match self.token.write() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = None;
    }
}
