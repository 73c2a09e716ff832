//! Asset storage: resolves a pre-uploaded file's extracted text for the
//! `asset` node builder. File upload and text extraction themselves are an
//! external collaborator per the specification (§1); this module defines
//! only the lookup trait consumed at node-build/run time, plus an
//! in-memory implementation for tests and default wiring.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::Result;

#[derive(Debug, Clone)]
pub struct AssetRecord {
    pub filename: String,
    pub extracted_text: Option<String>,
}

#[async_trait]
pub trait AssetStorage: Send + Sync {
    async fn get_asset(&self, asset_id: &str) -> Result<Option<AssetRecord>>;
}

#[derive(Default)]
pub struct InMemoryAssetStorage {
    assets: DashMap<String, AssetRecord>,
}

impl InMemoryAssetStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, asset_id: impl Into<String>, record: AssetRecord) {
        self.assets.insert(asset_id.into(), record);
    }
}

#[async_trait]
impl AssetStorage for InMemoryAssetStorage {
    async fn get_asset(&self, asset_id: &str) -> Result<Option<AssetRecord>> {
        Ok(self.assets.get(asset_id).map(|entry| entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_asset_is_none_not_error() {
        let storage = InMemoryAssetStorage::new();
        assert!(storage.get_asset("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stored_asset_round_trips() {
        let storage = InMemoryAssetStorage::new();
        storage.put(
            "a1",
            AssetRecord {
                filename: "report.pdf".into(),
                extracted_text: Some("hello".into()),
            },
        );
        let got = storage.get_asset("a1").await.unwrap().unwrap();
        assert_eq!(got.extracted_text.as_deref(), Some("hello"));
    }
}
