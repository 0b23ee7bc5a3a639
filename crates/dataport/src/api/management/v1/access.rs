//! Hooks called by the access-request system after it granted or revoked access.

use axum::{Json, response::IntoResponse};
use serde::{Deserialize, Serialize};

use crate::{
    api::{ApiContext, Result, management::v1::ApiServer},
    service::{
        AccessId, BindingStore, DatasetId, State, SubjectType,
        access_bridge::{self, GrantOutcome, RevokeOutcome},
    },
};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantAccessRequest {
    /// E-mail of a user, group or service account.
    pub subject: String,
    pub subject_type: SubjectType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessChangeResult {
    NotBound,
    TableAccessEnsured,
    MemberAdded,
    MembershipSkipped,
    GrantsRemain,
    TableAccessRevoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessChangeResponse {
    pub result: AccessChangeResult,
    /// Active grants left on the dataset. Only set on revocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_grants: Option<usize>,
}

impl IntoResponse for AccessChangeResponse {
    fn into_response(self) -> axum::response::Response {
        (http::StatusCode::OK, Json(self)).into_response()
    }
}

impl From<GrantOutcome> for AccessChangeResponse {
    fn from(value: GrantOutcome) -> Self {
        let result = match value {
            GrantOutcome::NotBound => AccessChangeResult::NotBound,
            GrantOutcome::TableAccessEnsured => AccessChangeResult::TableAccessEnsured,
            GrantOutcome::MemberAdded => AccessChangeResult::MemberAdded,
            GrantOutcome::MembershipSkipped => AccessChangeResult::MembershipSkipped,
        };
        AccessChangeResponse {
            result,
            remaining_grants: None,
        }
    }
}

impl From<RevokeOutcome> for AccessChangeResponse {
    fn from(value: RevokeOutcome) -> Self {
        match value {
            RevokeOutcome::NotBound => AccessChangeResponse {
                result: AccessChangeResult::NotBound,
                remaining_grants: None,
            },
            RevokeOutcome::GrantsRemain(n) => AccessChangeResponse {
                result: AccessChangeResult::GrantsRemain,
                remaining_grants: Some(n),
            },
            RevokeOutcome::TableAccessRevoked => AccessChangeResponse {
                result: AccessChangeResult::TableAccessRevoked,
                remaining_grants: Some(0),
            },
        }
    }
}

impl<B: BindingStore> AccessService<B> for ApiServer<B> {}

#[async_trait::async_trait]
pub trait AccessService<B: BindingStore> {
    async fn grant_access(
        dataset_id: DatasetId,
        request: GrantAccessRequest,
        context: ApiContext<State<B>>,
    ) -> Result<AccessChangeResponse> {
        let GrantAccessRequest {
            subject,
            subject_type,
        } = request;
        Ok(
            access_bridge::on_grant(dataset_id, &subject, subject_type, &context.v1_state)
                .await?
                .into(),
        )
    }

    async fn revoke_access(
        dataset_id: DatasetId,
        access_id: AccessId,
        context: ApiContext<State<B>>,
    ) -> Result<AccessChangeResponse> {
        Ok(
            access_bridge::on_revoke(dataset_id, access_id, &context.v1_state)
                .await?
                .into(),
        )
    }
}
