use crate::error::Result;
use crate::fed_client::FederationClient;
use crate::hash::HashMethod;
use rand::RngCore;
use tracing::debug;

const SALT_LEN: usize = 64;

/// Challenges `peer` to prove it still holds intact content for the
/// remote block `remote_id`, without transferring the content itself.
/// The peer hashes its copy with a fresh salt; we hash ours and
/// compare digests.
pub async fn check_integrity(
    fed: &dyn FederationClient,
    peer: &str,
    remote_id: &str,
    local_content: &[u8],
) -> Result<bool> {
    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt);

    let method = HashMethod::preferred();
    let remote_hash = fed
        .verify_block(peer, remote_id, method.name(), &salt)
        .await?;
    let local_hash = method.salted_hex(local_content, &salt);

    let matches = remote_hash == local_hash;
    if !matches {
        debug!(peer, remote_id, "replica hash mismatch");
    }
    Ok(matches)
}
