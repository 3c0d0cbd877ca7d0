//! Credential resolution collaborator.
//!
//! `apiKeyRef` fields never carry a raw secret; they carry a symbolic
//! reference (`ENV:NAME`, `KEYCHAIN:name`) that a [`CredentialResolver`]
//! turns into a secret at call time. Resolved secrets are never cached in
//! adapter instance fields — only the reference is.

/// Resolves a symbolic credential reference into a secret value.
///
/// Implementors must not log the resolved value. Returning `None` means
/// "no secret available", which is valid for self-hosted loopback backends.
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, reference: &str) -> Option<String>;
}

/// Resolves `ENV:NAME` references via `std::env::var`.
///
/// `KEYCHAIN:` references are recognized but always resolve to `None` with a
/// `tracing` warning — keychain-backed credential storage is an external
/// collaborator, out of scope for this crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentialResolver;

impl CredentialResolver for EnvCredentialResolver {
    fn resolve(&self, reference: &str) -> Option<String> {
        if let Some(name) = reference.strip_prefix("ENV:") {
            return std::env::var(name).ok().filter(|v| !v.is_empty());
        }
        if let Some(name) = reference.strip_prefix("KEYCHAIN:") {
            tracing::warn!(
                keychain_entry = name,
                "KEYCHAIN: credential references are not resolvable by EnvCredentialResolver"
            );
            return None;
        }
        tracing::warn!(reference, "unrecognized credential reference scheme");
        None
    }
}
