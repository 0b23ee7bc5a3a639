use veil::Redact;

use super::GatewayError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccount {
    pub email: String,
    pub display_name: String,
}

#[derive(Clone, PartialEq, Eq, Redact)]
pub struct ServiceAccountKey {
    /// Full resource name of the key.
    pub name: String,
    pub user_managed: bool,
    /// Credential file content. Only returned when the key is created.
    #[redact]
    pub private_key_data: Option<String>,
}

#[async_trait::async_trait]
pub trait IdentityGateway: std::fmt::Debug + Send + Sync + 'static {
    async fn get_service_account(&self, email: &str)
    -> Result<Option<ServiceAccount>, GatewayError>;

    /// `AlreadyExists` if an account with this id exists in `project_id`.
    async fn create_service_account(
        &self,
        project_id: &str,
        account_id: &str,
        display_name: &str,
    ) -> Result<ServiceAccount, GatewayError>;

    async fn delete_service_account(&self, email: &str) -> Result<(), GatewayError>;

    async fn create_key(&self, email: &str) -> Result<ServiceAccountKey, GatewayError>;

    async fn list_keys(&self, email: &str) -> Result<Vec<ServiceAccountKey>, GatewayError>;

    async fn delete_key(&self, key_name: &str) -> Result<(), GatewayError>;

    async fn grant_project_role(
        &self,
        project_id: &str,
        role: &str,
        member: &str,
    ) -> Result<(), GatewayError>;

    /// `NotFound` if the member does not hold the role.
    async fn revoke_project_role(
        &self,
        project_id: &str,
        role: &str,
        member: &str,
    ) -> Result<(), GatewayError>;
}
