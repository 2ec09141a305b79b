//! URL utility functions

/// Normalize a hostname to its ASCII (IDNA/punycode) form before it
/// becomes a certificate subject, a `CertStore` key, or a
/// `{idna-host}.pem` client-cert filename. Falls back to the input
/// unchanged if it isn't valid IDNA (e.g. already-ASCII hostnames with
/// no unicode labels take this path trivially; genuinely malformed
/// input is left for the caller to reject downstream rather than
/// silently dropped here).
pub fn idna_host(host: &str) -> String {
    idna::domain_to_ascii(host).unwrap_or_else(|_| host.to_string())
}
