//! Identity check consulted before an automatic ownership transfer.

use async_trait::async_trait;

/// Decides whether a claimant's verified display identity matches the label
/// recorded for an external account.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn matches(
        &self,
        provider: &str,
        external_account_id: &str,
        claimed_label: Option<&str>,
        recorded_label: Option<&str>,
    ) -> bool;
}

/// Compares the claimed label with the recorded one. Both must be present and
/// equal after trimming surrounding whitespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordedLabelVerifier;

#[async_trait]
impl IdentityVerifier for RecordedLabelVerifier {
    async fn matches(
        &self,
        _provider: &str,
        _external_account_id: &str,
        claimed_label: Option<&str>,
        recorded_label: Option<&str>,
    ) -> bool {
        match (claimed_label.map(str::trim), recorded_label.map(str::trim)) {
            (Some(claimed), Some(recorded)) => !claimed.is_empty() && claimed == recorded,
            _ => false,
        }
    }
}
