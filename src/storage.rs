use anyhow::Result;
use async_trait::async_trait;

use crate::types::Work;

/// Backing store for downloaded episodes. Only the pieces reconciliation needs.
#[async_trait]
pub trait DownloadStorage: Send + Sync {
    async fn is_downloaded(&self, work: &Work, name: &str, scanlator: Option<&str>) -> bool;

    async fn rename(
        &self,
        work: &Work,
        old_name: &str,
        old_scanlator: Option<&str>,
        new_name: &str,
        new_scanlator: Option<&str>,
    ) -> Result<()>;
}

/// Storage with nothing downloaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDownloads;

#[async_trait]
impl DownloadStorage for NoDownloads {
    async fn is_downloaded(&self, _work: &Work, _name: &str, _scanlator: Option<&str>) -> bool {
        false
    }

    async fn rename(&self, _work: &Work, _old: &str, _old_s: Option<&str>, _new: &str, _new_s: Option<&str>) -> Result<()> {
        Ok(())
    }
}
