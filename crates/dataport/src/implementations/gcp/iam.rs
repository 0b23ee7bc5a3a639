use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::{
    GcpClient, encode,
    policy::{PolicyEdit, edit_policy},
    service_account_member,
};
use crate::service::{
    GatewayError,
    gateways::{IdentityGateway, ServiceAccount, ServiceAccountKey},
};

const IAM_API: &str = "https://iam.googleapis.com/v1";
const RESOURCE_MANAGER_API: &str = "https://cloudresourcemanager.googleapis.com/v1";

/// Cloud IAM service accounts, their keys, and project-level role bindings.
#[derive(Debug, Clone)]
pub struct GcpIdentity {
    client: GcpClient,
}

impl GcpIdentity {
    #[must_use]
    pub fn new(client: GcpClient) -> Self {
        Self { client }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceAccountResource {
    email: String,
    #[serde(default)]
    display_name: String,
}

impl From<ServiceAccountResource> for ServiceAccount {
    fn from(value: ServiceAccountResource) -> Self {
        ServiceAccount {
            email: value.email,
            display_name: value.display_name,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateServiceAccountRequest<'a> {
    account_id: &'a str,
    service_account: CreateServiceAccountBody<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateServiceAccountBody<'a> {
    display_name: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateKeyRequest {}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyResource {
    name: String,
    #[serde(default)]
    key_type: Option<String>,
    /// Base64 of the JSON credential file.
    #[serde(default)]
    private_key_data: Option<String>,
}

impl std::fmt::Debug for KeyResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyResource")
            .field("name", &self.name)
            .field("key_type", &self.key_type)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListKeysResponse {
    #[serde(default)]
    keys: Vec<KeyResource>,
}

impl TryFrom<KeyResource> for ServiceAccountKey {
    type Error = GatewayError;

    fn try_from(value: KeyResource) -> Result<Self, Self::Error> {
        let private_key_data = value
            .private_key_data
            .map(|data| {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(data)
                    .map_err(|e| {
                        GatewayError::unexpected("Service account key is not valid base64")
                            .with_source(e)
                    })?;
                String::from_utf8(decoded).map_err(|e| {
                    GatewayError::unexpected("Service account key is not valid UTF-8")
                        .with_source(e)
                })
            })
            .transpose()?;
        Ok(ServiceAccountKey {
            name: value.name,
            user_managed: value.key_type.as_deref() == Some("USER_MANAGED"),
            private_key_data,
        })
    }
}

fn service_account_url(email: &str) -> String {
    format!("{IAM_API}/projects/-/serviceAccounts/{}", encode(email))
}

fn project_url(project_id: &str) -> String {
    format!("{RESOURCE_MANAGER_API}/projects/{}", encode(project_id))
}

#[async_trait::async_trait]
impl IdentityGateway for GcpIdentity {
    async fn get_service_account(
        &self,
        email: &str,
    ) -> Result<Option<ServiceAccount>, GatewayError> {
        match self
            .client
            .get::<ServiceAccountResource>(&service_account_url(email))
            .await
        {
            Ok(account) => Ok(Some(account.into())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_service_account(
        &self,
        project_id: &str,
        account_id: &str,
        display_name: &str,
    ) -> Result<ServiceAccount, GatewayError> {
        let url = format!("{IAM_API}/projects/{}/serviceAccounts", encode(project_id));
        let account: ServiceAccountResource = self
            .client
            .post(
                &url,
                &CreateServiceAccountRequest {
                    account_id,
                    service_account: CreateServiceAccountBody { display_name },
                },
            )
            .await?;
        Ok(account.into())
    }

    async fn delete_service_account(&self, email: &str) -> Result<(), GatewayError> {
        self.client.delete(&service_account_url(email)).await
    }

    async fn create_key(&self, email: &str) -> Result<ServiceAccountKey, GatewayError> {
        let url = format!("{}/keys", service_account_url(email));
        let key: KeyResource = self.client.post(&url, &CreateKeyRequest {}).await?;
        ServiceAccountKey::try_from(key)
    }

    async fn list_keys(&self, email: &str) -> Result<Vec<ServiceAccountKey>, GatewayError> {
        let url = format!("{}/keys", service_account_url(email));
        let response: ListKeysResponse = self.client.get(&url).await?;
        response
            .keys
            .into_iter()
            .map(ServiceAccountKey::try_from)
            .collect()
    }

    async fn delete_key(&self, key_name: &str) -> Result<(), GatewayError> {
        // Key names are full resource names: projects/{p}/serviceAccounts/{sa}/keys/{id}
        self.client.delete(&format!("{IAM_API}/{key_name}")).await
    }

    async fn grant_project_role(
        &self,
        project_id: &str,
        role: &str,
        member: &str,
    ) -> Result<(), GatewayError> {
        edit_policy(
            &self.client,
            &project_url(project_id),
            PolicyEdit::Add,
            role,
            &service_account_member(member),
        )
        .await
    }

    async fn revoke_project_role(
        &self,
        project_id: &str,
        role: &str,
        member: &str,
    ) -> Result<(), GatewayError> {
        edit_policy(
            &self.client,
            &project_url(project_id),
            PolicyEdit::Remove,
            role,
            &service_account_member(member),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_data_is_decoded() {
        let raw = r#"{
            "name": "projects/p/serviceAccounts/sa@p.iam.gserviceaccount.com/keys/abc",
            "keyType": "USER_MANAGED",
            "privateKeyData": "eyJ0eXBlIjoic2VydmljZV9hY2NvdW50In0="
        }"#;
        let key: KeyResource = serde_json::from_str(raw).unwrap();
        let key = ServiceAccountKey::try_from(key).unwrap();
        assert!(key.user_managed);
        assert_eq!(
            key.private_key_data.as_deref(),
            Some(r#"{"type":"service_account"}"#)
        );
        assert!(!format!("{key:?}").contains("service_account\""));
    }

    #[test]
    fn test_system_managed_keys() {
        let key: KeyResource =
            serde_json::from_str(r#"{"name": "k", "keyType": "SYSTEM_MANAGED"}"#).unwrap();
        let key = ServiceAccountKey::try_from(key).unwrap();
        assert!(!key.user_managed);
        assert!(key.private_key_data.is_none());
    }
}
