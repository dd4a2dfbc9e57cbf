//! HTTP implementation of the record store interface.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::{RecordStore, StoreError};
use crate::hardware::HardwareInfo;
use crate::task::{
    DatasetId, DeploymentRecord, GeneratedPair, GenerationMetadata, ModelId, NewDeployment,
    RunningTaskMarker, TaskId, TaskPatch, TaskRecord,
};

/// Default per-request timeout for record store calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Response envelope used by every record store endpoint.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct ApiEnvelope<T> {
    status: bool,
    #[serde(default)]
    data: Option<T>,
    #[serde(default)]
    message: Option<String>,
}

/// Record store client over the platform's HTTP API.
///
/// Endpoints follow the platform layout: `/v1/tasks/{id}` (GET/PATCH),
/// `/v1/tasks/{id}/restart`, `/v1/tasks/running_task`,
/// `/v1/datasets/{id}/{metadata,data}`, `/v1/deployments`,
/// `/v1/models/{id}` and `/v1/hardware/info`. The server applies the
/// results-merge policy on PATCH.
#[derive(Debug, Clone)]
pub struct HttpRecordStore {
    base_url: String,
    http_client: Client,
}

impl HttpRecordStore {
    /// Creates a client for the given base URL, e.g. `http://backend:5999`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, StoreError> {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Request(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    /// Returns the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Sends a request with an optional JSON body and unwraps the response
    /// envelope. A `status: false` envelope becomes an API error carrying
    /// the server's message.
    async fn call<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Option<T>, StoreError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let mut request = self.http_client.request(method, self.url(path));
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;

        let code = response.status();
        if code == StatusCode::NOT_FOUND {
            return Err(StoreError::Api {
                code: code.as_u16(),
                message: "not found".to_string(),
            });
        }
        if !code.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Api {
                code: code.as_u16(),
                message,
            });
        }

        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        if !envelope.status {
            return Err(StoreError::Api {
                code: code.as_u16(),
                message: envelope
                    .message
                    .unwrap_or_else(|| "request rejected".to_string()),
            });
        }
        Ok(envelope.data)
    }
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn get_task(&self, id: TaskId) -> Result<TaskRecord, StoreError> {
        let data: Option<TaskRecord> = self
            .call(Method::GET, &format!("/v1/tasks/{id}"), None::<&Value>)
            .await
            .map_err(|e| match e {
                StoreError::Api { code: 404, .. } => StoreError::TaskNotFound(id),
                other => other,
            })?;
        data.ok_or(StoreError::TaskNotFound(id))
    }

    async fn update_task(&self, id: TaskId, patch: &TaskPatch) -> Result<(), StoreError> {
        self.call::<Value, _>(Method::PATCH, &format!("/v1/tasks/{id}"), Some(patch))
            .await?;
        Ok(())
    }

    async fn restart_task(&self, id: TaskId, job_handle: &str) -> Result<(), StoreError> {
        let body = serde_json::json!({ "job_handle": job_handle });
        self.call::<Value, _>(Method::POST, &format!("/v1/tasks/{id}/restart"), Some(&body))
            .await?;
        Ok(())
    }

    async fn running_task(&self) -> Result<RunningTaskMarker, StoreError> {
        let data: Option<RunningTaskMarker> = self
            .call(Method::GET, "/v1/tasks/running_task", None::<&Value>)
            .await?;
        Ok(data.unwrap_or_default())
    }

    async fn set_running_task(&self, marker: &RunningTaskMarker) -> Result<(), StoreError> {
        self.call::<Value, _>(Method::PATCH, "/v1/tasks/running_task", Some(marker))
            .await?;
        Ok(())
    }

    async fn set_generation_metadata(
        &self,
        dataset_id: DatasetId,
        metadata: Option<&GenerationMetadata>,
    ) -> Result<(), StoreError> {
        // The body is the metadata document or an explicit null to clear it.
        let body = match metadata {
            Some(meta) => serde_json::to_value(meta)
                .map_err(|e| StoreError::Decode(e.to_string()))?,
            None => Value::Null,
        };
        self.call::<Value, _>(
            Method::PATCH,
            &format!("/v1/datasets/{dataset_id}/metadata"),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn append_generated_pair(
        &self,
        dataset_id: DatasetId,
        pair: &GeneratedPair,
    ) -> Result<(), StoreError> {
        self.call::<Value, _>(
            Method::POST,
            &format!("/v1/datasets/{dataset_id}/data"),
            Some(pair),
        )
        .await?;
        Ok(())
    }

    async fn list_deployments(&self) -> Result<Vec<DeploymentRecord>, StoreError> {
        let data: Option<Vec<DeploymentRecord>> = self
            .call(Method::GET, "/v1/deployments", None::<&Value>)
            .await?;
        Ok(data.unwrap_or_default())
    }

    async fn create_deployment(
        &self,
        deployment: &NewDeployment,
    ) -> Result<DeploymentRecord, StoreError> {
        let data: Option<DeploymentRecord> = self
            .call(Method::POST, "/v1/deployments", Some(deployment))
            .await?;
        data.ok_or_else(|| StoreError::Decode("missing deployment in response".to_string()))
    }

    async fn delete_deployment_for_model(&self, model_id: TaskId) -> Result<bool, StoreError> {
        match self
            .call::<Value, Value>(
                Method::DELETE,
                &format!("/v1/deployments/model/{model_id}"),
                None,
            )
            .await
        {
            Ok(_) => Ok(true),
            // Absence is not an error for an idempotent delete.
            Err(StoreError::Api { code: 404, .. }) => Ok(false),
            Err(other) => Err(other),
        }
    }

    async fn update_model_record(
        &self,
        model_id: ModelId,
        patch: &Value,
    ) -> Result<(), StoreError> {
        self.call::<Value, _>(Method::PATCH, &format!("/v1/models/{model_id}"), Some(patch))
            .await?;
        Ok(())
    }

    async fn update_hardware_info(&self, info: &HardwareInfo) -> Result<(), StoreError> {
        self.call::<Value, _>(Method::PATCH, "/v1/hardware/info", Some(info))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let store = HttpRecordStore::new("http://backend:5999/").unwrap();
        assert_eq!(store.base_url(), "http://backend:5999");
        assert_eq!(store.url("/v1/tasks/3"), "http://backend:5999/v1/tasks/3");
    }

    #[test]
    fn test_envelope_parses_with_and_without_data() {
        let with_data: ApiEnvelope<Value> =
            serde_json::from_str(r#"{"status": true, "data": {"id": 1}}"#).unwrap();
        assert!(with_data.status);
        assert!(with_data.data.is_some());

        let no_data: ApiEnvelope<Value> =
            serde_json::from_str(r#"{"status": false, "message": "rejected"}"#).unwrap();
        assert!(!no_data.status);
        assert_eq!(no_data.message.as_deref(), Some("rejected"));
    }
}
