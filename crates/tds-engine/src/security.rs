//! Security collaborators.
//!
//! Token acquisition and key resolution live outside the engine. A session
//! talks to them through [`SecurityProvider`] and [`KeyProvider`]; process
//! wide facts about the security library sit in the [`SecurityContext`]
//! singleton.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tds_protocol::crypto::{CekEntry, CryptoMetadata};
use tds_protocol::token::FedAuthInfo;

use crate::error::{Error, Result};

/// Produces authentication tokens for SSPI and federated authentication.
///
/// Calls are synchronous; the engine blocks its token run on them.
pub trait SecurityProvider: Send + Sync {
    /// Load the security library and report its maximum token length.
    fn load(&self) -> Result<u32>;

    /// Next SSPI blob, given the server's last one (`None` for the first).
    fn sspi_step(&self, received: Option<&[u8]>) -> Result<Bytes>;

    /// Federated authentication token for the advertised endpoints.
    fn fed_auth_token(&self, info: &FedAuthInfo) -> Result<Bytes> {
        let _ = info;
        Err(Error::Security(
            "federated authentication is not supported by this provider".into(),
        ))
    }
}

/// Resolves column encryption keys and transforms encrypted values.
pub trait KeyProvider: Send + Sync {
    /// Decrypt a column encryption key for `server`.
    fn decrypt_key(&self, entry: &CekEntry, server: &str) -> Result<Bytes>;

    /// Decrypt a value with a decrypted key.
    fn decrypt_value(&self, key: &[u8], crypto: &CryptoMetadata, ciphertext: &[u8]) -> Result<Bytes>;

    /// Encrypt a normalized value with a decrypted key.
    fn encrypt_value(&self, key: &[u8], crypto: &CryptoMetadata, plaintext: &[u8]) -> Result<Bytes>;
}

#[derive(Debug, Default)]
struct ContextState {
    library_loaded: bool,
    max_token_len: u32,
    client_network_id: Option<[u8; 6]>,
}

/// Process-wide security facts, initialized once.
pub struct SecurityContext {
    state: Mutex<ContextState>,
}

static CONTEXT: Lazy<SecurityContext> = Lazy::new(SecurityContext::new);

impl SecurityContext {
    /// A private context, for tests and embedders that want isolation.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ContextState::default()),
        }
    }

    /// The process-wide context.
    #[must_use]
    pub fn global() -> &'static Self {
        &CONTEXT
    }

    /// Load the security library through `provider` unless already loaded.
    ///
    /// Returns the maximum token length.
    pub fn ensure_loaded(&self, provider: &dyn SecurityProvider) -> Result<u32> {
        let mut state = self.state.lock();
        if !state.library_loaded {
            state.max_token_len = provider.load()?;
            state.library_loaded = true;
            tracing::debug!(max_token_len = state.max_token_len, "security library loaded");
        }
        Ok(state.max_token_len)
    }

    /// Whether the library has been loaded.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.state.lock().library_loaded
    }

    /// Maximum token length, once loaded.
    #[must_use]
    pub fn max_token_len(&self) -> Option<u32> {
        let state = self.state.lock();
        state.library_loaded.then_some(state.max_token_len)
    }

    /// Client network id sent in LOGIN7, computed on first use.
    pub fn client_network_id(&self) -> [u8; 6] {
        let mut state = self.state.lock();
        *state.client_network_id.get_or_insert_with(|| {
            let random = uuid::Uuid::new_v4();
            let mut id = [0u8; 6];
            id.copy_from_slice(&random.as_bytes()[..6]);
            id
        })
    }
}

impl Default for SecurityContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SecurityContext")
            .field("library_loaded", &state.library_loaded)
            .field("max_token_len", &state.max_token_len)
            .finish_non_exhaustive()
    }
}

/// Providers handed to a session.
#[derive(Clone, Default)]
pub struct Providers {
    /// Token source for SSPI and federated authentication.
    pub security: Option<Arc<dyn SecurityProvider>>,
    /// Key source for encrypted columns.
    pub keys: Option<Arc<dyn KeyProvider>>,
}

impl Providers {
    /// No providers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the security provider.
    #[must_use]
    pub fn with_security(mut self, provider: Arc<dyn SecurityProvider>) -> Self {
        self.security = Some(provider);
        self
    }

    /// Set the key provider.
    #[must_use]
    pub fn with_keys(mut self, provider: Arc<dyn KeyProvider>) -> Self {
        self.keys = Some(provider);
        self
    }

    pub(crate) fn security(&self) -> Result<&dyn SecurityProvider> {
        self.security
            .as_deref()
            .ok_or_else(|| Error::Security("no security provider configured".into()))
    }
}

impl fmt::Debug for Providers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Providers")
            .field("security", &self.security.is_some())
            .field("keys", &self.keys.is_some())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingProvider {
        loads: AtomicUsize,
    }

    impl SecurityProvider for CountingProvider {
        fn load(&self) -> Result<u32> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(12_000)
        }

        fn sspi_step(&self, received: Option<&[u8]>) -> Result<Bytes> {
            Ok(Bytes::copy_from_slice(received.unwrap_or(b"hello")))
        }
    }

    #[test]
    fn library_loads_once() {
        let context = SecurityContext::new();
        let provider = CountingProvider::default();
        assert_eq!(context.max_token_len(), None);
        assert_eq!(context.ensure_loaded(&provider).unwrap(), 12_000);
        assert_eq!(context.ensure_loaded(&provider).unwrap(), 12_000);
        assert_eq!(provider.loads.load(Ordering::SeqCst), 1);
        assert!(context.is_loaded());
    }

    #[test]
    fn network_id_is_stable() {
        let context = SecurityContext::new();
        assert_eq!(context.client_network_id(), context.client_network_id());
        let global = SecurityContext::global();
        assert_eq!(global.client_network_id(), global.client_network_id());
    }

    #[test]
    fn fed_auth_defaults_to_unsupported() {
        let provider = CountingProvider::default();
        let info = FedAuthInfo {
            sts_url: "https://sts".into(),
            spn: "spn".into(),
        };
        assert!(matches!(provider.fed_auth_token(&info), Err(Error::Security(_))));
    }

    #[test]
    fn missing_provider_is_a_security_error() {
        assert!(matches!(Providers::new().security(), Err(Error::Security(_))));
    }
}
