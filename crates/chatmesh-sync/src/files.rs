//! Phase 6: file payload transfer.
//!
//! File metadata replicates like any other entity. The bytes do not: once
//! entities have converged, every `File` whose payload is absent locally is
//! requested from the online peers in turn until one delivers bytes that
//! hash to the recorded `payload_hash`.

use tracing::{debug, info, warn};

use chatmesh_core::{Blake3Hash, EntityKind, File, PeerAddress};
use chatmesh_net::action::FileQuery;
use chatmesh_net::{new_correlation_id, PeerRequest};

use crate::engine::SyncEngine;
use crate::error::{Result, SyncError};
use crate::events::SyncEvent;
use crate::messages::FileReply;

/// Totals of one transfer round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileReport {
    pub fetched: usize,
    /// Files no peer could supply.
    pub unavailable: usize,
}

/// Check received bytes against the metadata.
pub fn verify_payload(file: &File, payload: &[u8]) -> Result<()> {
    let actual = Blake3Hash::hash(payload);
    if actual != file.payload_hash {
        return Err(SyncError::IntegrityMismatch {
            file_id: file.id,
            expected: file.payload_hash,
            actual,
        });
    }
    Ok(())
}

impl SyncEngine {
    /// Fetch every locally missing payload.
    pub async fn transfer_files(&self) -> Result<FileReport> {
        let peers: Vec<PeerAddress> = self
            .registry
            .list_active()
            .into_iter()
            .map(|p| p.address)
            .collect();

        let mut report = FileReport::default();
        for entity in self.entities.list_all_for_sync(EntityKind::File).await? {
            let Some(file) = entity.as_file() else {
                continue;
            };
            if self.files.has_payload(&file.id).await? {
                continue;
            }
            if self.fetch_from_any(file, &peers).await? {
                report.fetched += 1;
            } else {
                report.unavailable += 1;
            }
        }

        if report.fetched > 0 || report.unavailable > 0 {
            info!(fetched = report.fetched, unavailable = report.unavailable, "file transfer done");
        }
        Ok(report)
    }

    async fn fetch_from_any(&self, file: &File, peers: &[PeerAddress]) -> Result<bool> {
        for peer in peers {
            match self.fetch_from(file, peer).await {
                Ok(()) => {
                    self.observers.emit(SyncEvent::FileFetched {
                        file_id: file.id,
                        peer: peer.clone(),
                    });
                    return Ok(true);
                }
                Err(SyncError::Store(e)) => return Err(SyncError::Store(e)),
                Err(e @ SyncError::IntegrityMismatch { .. }) => {
                    warn!(%peer, file = %file.id, error = %e, "rejected file payload");
                }
                Err(e) => {
                    debug!(%peer, file = %file.id, error = %e, "peer could not supply file");
                }
            }
        }
        Ok(false)
    }

    async fn fetch_from(&self, file: &File, peer: &PeerAddress) -> Result<()> {
        let correlation_id = new_correlation_id();
        let request = PeerRequest::SyncFetchFile(FileQuery {
            file_id: file.id,
            correlation_id: correlation_id.clone(),
        });
        let response = self
            .messenger
            .call(peer, request.to_request()?, &correlation_id)
            .await?;
        let reply: FileReply = response.decode_data()?;
        if reply.file_id != file.id {
            return Err(SyncError::InvalidPayload(format!(
                "asked for file {}, got {}",
                file.id, reply.file_id
            )));
        }

        let payload = reply.payload()?;
        verify_payload(file, &payload)?;
        self.files.store_payload(&file.id, payload).await?;
        debug!(%peer, file = %file.id, "stored file payload");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatmesh_core::EntityId;

    fn file(bytes: &[u8]) -> File {
        File {
            id: EntityId::from_bytes([4; 16]),
            name: "notes.txt".into(),
            mime_type: "text/plain".into(),
            size: bytes.len() as u64,
            payload_hash: Blake3Hash::hash(bytes),
            uploaded_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_verify_accepts_matching_bytes() {
        assert!(verify_payload(&file(b"meeting at noon"), b"meeting at noon").is_ok());
    }

    #[test]
    fn test_verify_rejects_tampered_bytes() {
        let meta = file(b"meeting at noon");
        let err = verify_payload(&meta, b"meeting at one").unwrap_err();
        match err {
            SyncError::IntegrityMismatch { file_id, expected, actual } => {
                assert_eq!(file_id, meta.id);
                assert_eq!(expected, meta.payload_hash);
                assert_ne!(actual, expected);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
