use std::time::Duration;

use serde::{Deserialize, Serialize};
use tryhard::RetryPolicy;

use super::GcpClient;
use crate::service::{GatewayError, GatewayErrorKind};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct IamPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) version: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) etag: Option<String>,
    #[serde(default)]
    pub(super) bindings: Vec<IamBinding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(super) struct IamBinding {
    pub(super) role: String,
    #[serde(default)]
    pub(super) members: Vec<String>,
}

impl IamPolicy {
    /// Returns whether the policy changed.
    pub(super) fn add_member(&mut self, role: &str, member: &str) -> bool {
        match self.bindings.iter_mut().find(|b| b.role == role) {
            Some(binding) if binding.members.iter().any(|m| m == member) => false,
            Some(binding) => {
                binding.members.push(member.to_string());
                true
            }
            None => {
                self.bindings.push(IamBinding {
                    role: role.to_string(),
                    members: vec![member.to_string()],
                });
                true
            }
        }
    }

    /// Returns whether the policy changed. Bindings left without members are dropped.
    pub(super) fn remove_member(&mut self, role: &str, member: &str) -> bool {
        let mut changed = false;
        for binding in self.bindings.iter_mut().filter(|b| b.role == role) {
            let before = binding.members.len();
            binding.members.retain(|m| m != member);
            changed |= binding.members.len() != before;
        }
        self.bindings.retain(|b| !b.members.is_empty());
        changed
    }

    pub(super) fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.bindings
            .iter()
            .flat_map(|b| b.members.iter().map(|m| (b.role.as_str(), m.as_str())))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetIamPolicyRequest<'a> {
    policy: &'a IamPolicy,
}

#[derive(Debug, Serialize)]
struct GetIamPolicyRequest {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum PolicyEdit {
    Add,
    Remove,
}

/// Read-modify-write of an IAM policy at `resource` (`{resource}:getIamPolicy` and
/// `{resource}:setIamPolicy`). The write carries the etag of the read, so a concurrent
/// change makes it fail with a conflict, which is retried.
///
/// Removing a member that does not hold the role returns `NotFound`.
pub(super) async fn edit_policy(
    client: &GcpClient,
    resource: &str,
    edit: PolicyEdit,
    role: &str,
    member: &str,
) -> Result<(), GatewayError> {
    tryhard::retry_fn(async || edit_policy_once(client, resource, edit, role, member).await)
        .retries(4)
        .custom_backoff(|attempt: u32, e: &GatewayError| {
            if e.kind == GatewayErrorKind::Unavailable {
                tracing::debug!(attempt, "Retrying IAM policy update on {resource}: {}", e.message);
                RetryPolicy::Delay(Duration::from_millis(200) * 2u32.pow(attempt.min(5)))
            } else {
                RetryPolicy::Break
            }
        })
        .await
}

async fn edit_policy_once(
    client: &GcpClient,
    resource: &str,
    edit: PolicyEdit,
    role: &str,
    member: &str,
) -> Result<(), GatewayError> {
    let mut policy = get_policy(client, resource).await?;
    let changed = match edit {
        PolicyEdit::Add => policy.add_member(role, member),
        PolicyEdit::Remove => policy.remove_member(role, member),
    };

    if !changed {
        return match edit {
            PolicyEdit::Add => Ok(()),
            PolicyEdit::Remove => Err(GatewayError::new(
                GatewayErrorKind::NotFound,
                format!("{member} does not hold {role} on {resource}"),
            )),
        };
    }

    let url = format!("{resource}:setIamPolicy");
    let _: IamPolicy = client
        .post(&url, &SetIamPolicyRequest { policy: &policy })
        .await
        .map_err(|e| match e.kind {
            // Etag mismatch. Surface as transient so the caller's retry applies.
            GatewayErrorKind::AlreadyExists => GatewayError::unavailable(e.message),
            _ => e,
        })?;
    Ok(())
}

pub(super) async fn get_policy(
    client: &GcpClient,
    resource: &str,
) -> Result<IamPolicy, GatewayError> {
    client
        .post(&format!("{resource}:getIamPolicy"), &GetIamPolicyRequest {})
        .await
}
