//! REST client of the BI tool (Metabase API).
//!
//! Authenticates with a session created from username and password. The session is
//! created lazily and renewed once if the BI tool rejects it.

mod models;

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::Context;
use models::{
    BIGQUERY_ENGINE, BigQueryDetails, CollectionGraph, CollectionResource,
    CreateCollectionRequest, CreateDatabaseRequest, CreateGroupRequest, CreateMembershipRequest,
    DataGraph, DatabaseList, DatabaseMetadata, DatabaseResource, GroupResource, MembershipMap,
    SessionRequest, SessionResponse, UpdateCollectionRequest, UserList, grants_query_access,
    granted_permissions, revoked_permissions,
};
use reqwest::{Method, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::RwLock;
use tryhard::RetryPolicy;
use url::Url;
use veil::Redact;

use crate::{
    BiConfig,
    service::{
        BiDatabaseId, CollectionId, GatewayError, GatewayErrorKind, PermissionGroupId,
        gateways::{
            BiDatabase, BiToolGateway, Collection, CollectionAccess, NewDatabase, PermissionGraph,
            PermissionGroup,
        },
    },
};

const SESSION_HEADER: &str = "X-Metabase-Session";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const TABLE_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Redact)]
struct Credentials {
    username: String,
    #[redact]
    password: String,
}

#[derive(Debug, Clone)]
pub struct BiToolClient {
    base_url: Url,
    http: reqwest::Client,
    credentials: Credentials,
    session: Arc<RwLock<Option<String>>>,
}

impl BiToolClient {
    pub fn new(base_url: Url, username: String, password: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url,
            http,
            credentials: Credentials { username, password },
            session: Arc::new(RwLock::new(None)),
        })
    }

    pub fn from_config(config: &BiConfig) -> anyhow::Result<Self> {
        let base_url = config.url.clone().context("bi.url is not set")?;
        Self::new(base_url, config.username.clone(), config.password.clone())
    }

    fn url(&self, path: &str) -> Result<Url, GatewayError> {
        self.base_url.join(path).map_err(|e| {
            GatewayError::unexpected(format!("Invalid BI tool path {path}")).with_source(e)
        })
    }

    async fn session(&self, renew: bool) -> Result<String, GatewayError> {
        if !renew {
            if let Some(session) = self.session.read().await.as_ref() {
                return Ok(session.clone());
            }
        }

        let mut guard = self.session.write().await;
        let response = self
            .http
            .post(self.url("api/session")?)
            .json(&SessionRequest {
                username: &self.credentials.username,
                password: &self.credentials.password,
            })
            .send()
            .await
            .map_err(|e| GatewayError::unavailable("Failed to reach BI tool").with_source(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::new(
                GatewayErrorKind::PermissionDenied,
                format!("BI tool rejected login with {status}"),
            ));
        }
        let SessionResponse { id } = response.json().await.map_err(|e| {
            GatewayError::unexpected("Unexpected BI tool session response").with_source(e)
        })?;
        tracing::debug!("Created new BI tool session");
        *guard = Some(id.clone());
        Ok(id)
    }

    async fn send<B, R>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Option<R>, GatewayError>
    where
        B: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.url(path)?;
        let mut renew = false;
        loop {
            let session = self.session(renew).await?;
            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .header(SESSION_HEADER, session);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await.map_err(|e| {
                GatewayError::unavailable(format!("{method} {path} failed")).with_source(e)
            })?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && !renew {
                renew = true;
                continue;
            }
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(GatewayError::new(
                    error_kind(status),
                    format!("{method} {path} returned {status}: {text}"),
                ));
            }

            let bytes = response.bytes().await.map_err(|e| {
                GatewayError::unavailable(format!("Failed to read response of {method} {path}"))
                    .with_source(e)
            })?;
            if bytes.is_empty() {
                return Ok(None);
            }
            return serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                GatewayError::unexpected(format!("Unexpected response body of {method} {path}"))
                    .with_source(e)
            });
        }
    }

    async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R, GatewayError> {
        self.send::<(), R>(Method::GET, path, None)
            .await?
            .ok_or_else(|| GatewayError::unexpected(format!("Empty response of GET {path}")))
    }

    async fn write<B, R>(&self, method: Method, path: &str, body: &B) -> Result<R, GatewayError>
    where
        B: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        self.send::<B, R>(method.clone(), path, Some(body))
            .await?
            .ok_or_else(|| GatewayError::unexpected(format!("Empty response of {method} {path}")))
    }

    async fn write_discard<B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<(), GatewayError>
    where
        B: Serialize + Sync + ?Sized,
    {
        self.send::<B, serde_json::Value>(method, path, body)
            .await
            .map(|_| ())
    }

    /// Read-modify-write of a permission graph. A concurrent change bumps the revision,
    /// which the BI tool rejects with a conflict; the edit is then replayed on a fresh read.
    async fn edit_graph<G, F>(&self, path: &str, edit: F) -> Result<(), GatewayError>
    where
        G: Serialize + DeserializeOwned + Send + Sync,
        F: Fn(&mut G) -> bool + Send + Sync,
    {
        tryhard::retry_fn(async || {
            let mut graph: G = self.get(path).await?;
            if !edit(&mut graph) {
                return Ok(());
            }
            self.write_discard(Method::PUT, path, Some(&graph)).await
        })
        .retries(3)
        .custom_backoff(|attempt: u32, e: &GatewayError| {
            if matches!(
                e.kind,
                GatewayErrorKind::AlreadyExists | GatewayErrorKind::Unavailable
            ) {
                tracing::debug!(attempt, "Retrying update of {path}: {}", e.message);
                RetryPolicy::Delay(Duration::from_millis(250) * 2u32.pow(attempt.min(4)))
            } else {
                RetryPolicy::Break
            }
        })
        .await
    }

    async fn find_user_id(&self, email: &str) -> Result<i64, GatewayError> {
        let users: UserList = self
            .get(&format!("api/user?query={}", urlencoding::encode(email)))
            .await?;
        users
            .data
            .into_iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .map(|u| u.id)
            .ok_or_else(|| GatewayError::not_found(format!("No BI user with email {email}")))
    }

    async fn list_groups(&self) -> Result<Vec<GroupResource>, GatewayError> {
        self.get("api/permissions/group").await
    }
}

fn error_kind(status: StatusCode) -> GatewayErrorKind {
    match status {
        StatusCode::NOT_FOUND => GatewayErrorKind::NotFound,
        StatusCode::CONFLICT => GatewayErrorKind::AlreadyExists,
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => GatewayErrorKind::PermissionDenied,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            GatewayErrorKind::Unavailable
        }
        s if s.is_server_error() => GatewayErrorKind::Unavailable,
        _ => GatewayErrorKind::Unexpected,
    }
}

#[async_trait::async_trait]
impl BiToolGateway for BiToolClient {
    async fn create_database(&self, database: &NewDatabase) -> Result<BiDatabase, GatewayError> {
        let request = CreateDatabaseRequest {
            engine: BIGQUERY_ENGINE,
            name: &database.name,
            details: BigQueryDetails {
                project_id: &database.table.project_id,
                service_account_json: &database.service_account_key,
                dataset_filters_type: "inclusion",
                dataset_filters_patterns: &database.table.dataset,
            },
            is_full_sync: true,
        };
        let created: DatabaseResource = self.write(Method::POST, "api/database", &request).await?;
        Ok(created.into())
    }

    async fn get_database(&self, id: BiDatabaseId) -> Result<Option<BiDatabase>, GatewayError> {
        match self
            .get::<DatabaseResource>(&format!("api/database/{id}"))
            .await
        {
            Ok(db) => Ok(Some(db.into())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_databases(&self) -> Result<Vec<BiDatabase>, GatewayError> {
        let list: DatabaseList = self.get("api/database").await?;
        Ok(list.into_vec().into_iter().map(Into::into).collect())
    }

    async fn delete_database(&self, id: BiDatabaseId) -> Result<(), GatewayError> {
        self.write_discard::<()>(Method::DELETE, &format!("api/database/{id}"), None)
            .await
    }

    async fn sync_database_schema(&self, id: BiDatabaseId) -> Result<(), GatewayError> {
        self.write_discard::<()>(Method::POST, &format!("api/database/{id}/sync_schema"), None)
            .await
    }

    async fn wait_for_table(
        &self,
        id: BiDatabaseId,
        table: &str,
        timeout: Duration,
    ) -> Result<(), GatewayError> {
        let path = format!("api/database/{id}/metadata");
        let poll = async {
            loop {
                let metadata: DatabaseMetadata = self.get(&path).await?;
                if metadata.tables.iter().any(|t| t.name == table) {
                    return Ok::<_, GatewayError>(());
                }
                tracing::debug!(database_id = %id, "Table {table} not yet synced");
                tokio::time::sleep(TABLE_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.map_err(|_| {
            GatewayError::unavailable(format!(
                "Table {table} did not appear in BI database {id} within {}s",
                timeout.as_secs()
            ))
        })?
    }

    async fn create_collection(
        &self,
        name: &str,
        description: &str,
    ) -> Result<Collection, GatewayError> {
        let created: CollectionResource = self
            .write(
                Method::POST,
                "api/collection",
                &CreateCollectionRequest { name, description },
            )
            .await?;
        created
            .into_collection()
            .ok_or_else(|| GatewayError::unexpected("Created collection has no numeric id"))
    }

    async fn update_collection(
        &self,
        id: CollectionId,
        name: &str,
    ) -> Result<Collection, GatewayError> {
        let updated: CollectionResource = self
            .write(
                Method::PUT,
                &format!("api/collection/{id}"),
                &UpdateCollectionRequest {
                    name: Some(name),
                    archived: None,
                },
            )
            .await?;
        updated
            .into_collection()
            .ok_or_else(|| GatewayError::unexpected("Updated collection has no numeric id"))
    }

    async fn archive_collection(&self, id: CollectionId) -> Result<(), GatewayError> {
        self.write_discard(
            Method::PUT,
            &format!("api/collection/{id}"),
            Some(&UpdateCollectionRequest {
                name: None,
                archived: Some(true),
            }),
        )
        .await
    }

    async fn list_collections(&self) -> Result<Vec<Collection>, GatewayError> {
        let collections: Vec<CollectionResource> = self.get("api/collection").await?;
        Ok(collections
            .into_iter()
            .filter_map(CollectionResource::into_collection)
            .filter(|c| !c.archived)
            .collect())
    }

    async fn find_permission_group(
        &self,
        name: &str,
    ) -> Result<Option<PermissionGroup>, GatewayError> {
        Ok(self
            .list_groups()
            .await?
            .into_iter()
            .find(|g| g.name == name)
            .map(Into::into))
    }

    async fn create_or_get_permission_group(
        &self,
        name: &str,
    ) -> Result<PermissionGroup, GatewayError> {
        if let Some(group) = self.find_permission_group(name).await? {
            return Ok(group);
        }
        let created: GroupResource = self
            .write(
                Method::POST,
                "api/permissions/group",
                &CreateGroupRequest { name },
            )
            .await?;
        Ok(created.into())
    }

    async fn delete_permission_group(&self, id: PermissionGroupId) -> Result<(), GatewayError> {
        self.write_discard::<()>(
            Method::DELETE,
            &format!("api/permissions/group/{id}"),
            None,
        )
        .await
    }

    async fn add_permission_group_member(
        &self,
        group: PermissionGroupId,
        user_email: &str,
    ) -> Result<(), GatewayError> {
        let user_id = self.find_user_id(user_email).await?;
        let memberships: MembershipMap = self.get("api/permissions/membership").await?;
        let already_member = memberships
            .get(&user_id.to_string())
            .is_some_and(|m| m.iter().any(|m| m.group_id == group.get()));
        if already_member {
            return Ok(());
        }
        self.write_discard(
            Method::POST,
            "api/permissions/membership",
            Some(&CreateMembershipRequest {
                group_id: group.get(),
                user_id,
            }),
        )
        .await
    }

    async fn remove_permission_group_member(
        &self,
        group: PermissionGroupId,
        user_email: &str,
    ) -> Result<(), GatewayError> {
        let user_id = self.find_user_id(user_email).await?;
        let memberships: MembershipMap = self.get("api/permissions/membership").await?;
        let membership = memberships
            .get(&user_id.to_string())
            .and_then(|m| m.iter().find(|m| m.group_id == group.get()))
            .ok_or_else(|| {
                GatewayError::not_found(format!("{user_email} is not a member of group {group}"))
            })?;
        self.write_discard::<()>(
            Method::DELETE,
            &format!("api/permissions/membership/{}", membership.membership_id),
            None,
        )
        .await
    }

    async fn set_collection_access(
        &self,
        collection: CollectionId,
        group: PermissionGroupId,
        access: CollectionAccess,
    ) -> Result<(), GatewayError> {
        let (group, collection) = (group.to_string(), collection.to_string());
        self.edit_graph("api/collection/graph", |graph: &mut CollectionGraph| {
            let current = graph
                .groups
                .entry(group.clone())
                .or_default()
                .insert(collection.clone(), access);
            current != Some(access)
        })
        .await
    }

    async fn get_permission_graph(&self) -> Result<PermissionGraph, GatewayError> {
        let graph: DataGraph = self.get("api/permissions/graph").await?;
        let groups = graph
            .groups
            .iter()
            .filter_map(|(group, databases)| {
                let group = PermissionGroupId::new(group.parse().ok()?);
                let databases = databases
                    .iter()
                    .filter(|(_, permissions)| grants_query_access(permissions))
                    .filter_map(|(db, _)| db.parse().ok().map(BiDatabaseId::new))
                    .collect();
                Some((group, databases))
            })
            .collect::<BTreeMap<_, _>>();
        Ok(PermissionGraph {
            revision: graph.revision,
            groups,
        })
    }

    async fn grant_database_access(
        &self,
        group: PermissionGroupId,
        database: BiDatabaseId,
    ) -> Result<(), GatewayError> {
        let (group, database) = (group.to_string(), database.to_string());
        self.edit_graph("api/permissions/graph", |graph: &mut DataGraph| {
            // The BI tool only accepts the changed groups.
            let current = graph
                .groups
                .get(&group)
                .and_then(|dbs| dbs.get(&database))
                .is_some_and(grants_query_access);
            graph.groups.retain(|g, _| g == &group);
            graph
                .groups
                .entry(group.clone())
                .or_default()
                .insert(database.clone(), granted_permissions());
            !current
        })
        .await
    }

    async fn revoke_database_access(
        &self,
        group: PermissionGroupId,
        database: BiDatabaseId,
    ) -> Result<(), GatewayError> {
        let (group, database) = (group.to_string(), database.to_string());
        self.edit_graph("api/permissions/graph", |graph: &mut DataGraph| {
            let current = graph
                .groups
                .get(&group)
                .and_then(|dbs| dbs.get(&database))
                .is_some_and(grants_query_access);
            graph.groups.retain(|g, _| g == &group);
            graph
                .groups
                .entry(group.clone())
                .or_default()
                .insert(database.clone(), revoked_permissions());
            current
        })
        .await
    }
}
