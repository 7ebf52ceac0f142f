//! TLS.

use kestrel_error::{generic_error, GenericError};

/// Installs AWS-LC as the process-wide cryptography provider used by outbound TLS connections.
///
/// Must run before the first HTTPS client is built.
///
/// ## Errors
///
/// If a provider was already installed, an error is returned.
pub fn initialize_tls() -> Result<(), GenericError> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| generic_error!("Failed to install AWS-LC as the default cryptography provider; another provider is already installed."))
}
