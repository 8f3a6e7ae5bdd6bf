use ::common::api::{BackupCreated, BackupRequest, BackupStatus, GlobalSettings};
use uuid::Uuid;

use crate::error::ApiError;
use crate::transport::ApiClient;

/// Backup endpoints of one collective.
#[derive(Clone)]
pub struct BackupApi {
    api: ApiClient,
}

impl BackupApi {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    pub fn client(&self) -> &ApiClient {
        &self.api
    }

    pub async fn initiate(&self, appliance: Uuid, req: BackupRequest) -> Result<Uuid, ApiError> {
        let created: BackupCreated = self
            .api
            .post_json(&format!("/appliances/{appliance}/backup"), &req)
            .await?;
        Ok(created.id)
    }

    pub async fn status(&self, appliance: Uuid, backup: Uuid) -> Result<BackupStatus, ApiError> {
        self.api
            .get(&format!("/appliances/{appliance}/backup/{backup}/status"))
            .await
    }

    /// Opens the encrypted blob as a stream.
    pub async fn download(&self, appliance: Uuid, backup: Uuid) -> Result<reqwest::Response, ApiError> {
        self.api
            .download(&format!("/appliances/{appliance}/backup/{backup}"))
            .await
    }

    pub async fn delete(&self, appliance: Uuid, backup: Uuid) -> Result<(), ApiError> {
        self.api
            .delete(&format!("/appliances/{appliance}/backup/{backup}"))
            .await
    }

    pub async fn global_settings(&self) -> Result<GlobalSettings, ApiError> {
        self.api.get("/global-settings").await
    }

    pub async fn put_global_settings(&self, settings: &GlobalSettings) -> Result<(), ApiError> {
        self.api.put_json("/global-settings", settings).await
    }
}
