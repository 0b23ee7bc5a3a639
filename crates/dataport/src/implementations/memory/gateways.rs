use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use super::{FaultInjector, lock};
use crate::service::{
    BiDatabaseId, CollectionId, PermissionGroupId, WarehouseTable,
    binding::service_account_email,
    gateways::{
        AclEntry, BiDatabase, BiToolGateway, Collection, CollectionAccess, GatewayError,
        IdentityGateway, METADATA_VIEWER_ROLE, NewDatabase, PermissionGraph, PermissionGroup,
        ServiceAccount, ServiceAccountKey, TABLE_VIEWER_ROLE, WarehouseGateway,
    },
};

// ---------------- Warehouse ----------------

#[derive(Debug, Default)]
struct WarehouseInner {
    tables: HashSet<WarehouseTable>,
    dataset_acls: HashMap<(String, String), HashSet<AclEntry>>,
    table_policies: HashMap<WarehouseTable, HashSet<AclEntry>>,
}

#[derive(Debug, Clone)]
pub struct MemoryWarehouse {
    inner: Arc<Mutex<WarehouseInner>>,
    faults: FaultInjector,
}

impl MemoryWarehouse {
    #[must_use]
    pub fn new(faults: FaultInjector) -> Self {
        Self {
            inner: Arc::default(),
            faults,
        }
    }

    pub fn add_table(&self, table: &WarehouseTable) {
        lock(&self.inner).tables.insert(table.clone());
    }

    pub fn drop_table(&self, table: &WarehouseTable) {
        let mut inner = lock(&self.inner);
        inner.tables.remove(table);
        inner.table_policies.remove(table);
    }

    #[must_use]
    pub fn table_members(&self, table: &WarehouseTable) -> BTreeSet<String> {
        lock(&self.inner)
            .table_policies
            .get(table)
            .map(|entries| entries.iter().map(|e| e.member.clone()).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn dataset_members(&self, table: &WarehouseTable) -> BTreeSet<String> {
        lock(&self.inner)
            .dataset_acls
            .get(&dataset_key(table))
            .map(|entries| entries.iter().map(|e| e.member.clone()).collect())
            .unwrap_or_default()
    }
}

fn dataset_key(table: &WarehouseTable) -> (String, String) {
    (table.project_id.clone(), table.dataset.clone())
}

fn entry(role: &str, member: &str) -> AclEntry {
    AclEntry {
        role: role.to_string(),
        member: member.to_string(),
    }
}

impl WarehouseInner {
    fn require_table(&self, table: &WarehouseTable) -> Result<(), GatewayError> {
        if self.tables.contains(table) {
            Ok(())
        } else {
            Err(GatewayError::not_found(format!("Table {table} not found")))
        }
    }
}

#[async_trait::async_trait]
impl WarehouseGateway for MemoryWarehouse {
    async fn grant_table_viewer(
        &self,
        table: &WarehouseTable,
        member: &str,
    ) -> Result<(), GatewayError> {
        self.faults.check("grant_table_viewer")?;
        let mut inner = lock(&self.inner);
        inner.require_table(table)?;
        inner
            .table_policies
            .entry(table.clone())
            .or_default()
            .insert(entry(TABLE_VIEWER_ROLE, member));
        Ok(())
    }

    async fn revoke_table_viewer(
        &self,
        table: &WarehouseTable,
        member: &str,
    ) -> Result<(), GatewayError> {
        self.faults.check("revoke_table_viewer")?;
        let mut inner = lock(&self.inner);
        inner.require_table(table)?;
        let removed = inner
            .table_policies
            .get_mut(table)
            .is_some_and(|entries| entries.remove(&entry(TABLE_VIEWER_ROLE, member)));
        if removed {
            Ok(())
        } else {
            Err(GatewayError::not_found(format!(
                "{member} is no viewer of {table}"
            )))
        }
    }

    async fn grant_dataset_metadata_viewer(
        &self,
        table: &WarehouseTable,
        member: &str,
    ) -> Result<(), GatewayError> {
        self.faults.check("grant_dataset_metadata_viewer")?;
        lock(&self.inner)
            .dataset_acls
            .entry(dataset_key(table))
            .or_default()
            .insert(entry(METADATA_VIEWER_ROLE, member));
        Ok(())
    }

    async fn revoke_dataset_metadata_viewer(
        &self,
        table: &WarehouseTable,
        member: &str,
    ) -> Result<(), GatewayError> {
        self.faults.check("revoke_dataset_metadata_viewer")?;
        let removed = lock(&self.inner)
            .dataset_acls
            .get_mut(&dataset_key(table))
            .is_some_and(|entries| entries.remove(&entry(METADATA_VIEWER_ROLE, member)));
        if removed {
            Ok(())
        } else {
            Err(GatewayError::not_found(format!(
                "{member} is no metadata viewer of {}.{}",
                table.project_id, table.dataset
            )))
        }
    }

    async fn get_dataset_acl(&self, table: &WarehouseTable) -> Result<Vec<AclEntry>, GatewayError> {
        self.faults.check("get_dataset_acl")?;
        Ok(lock(&self.inner)
            .dataset_acls
            .get(&dataset_key(table))
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_table_policy(
        &self,
        table: &WarehouseTable,
    ) -> Result<Vec<AclEntry>, GatewayError> {
        self.faults.check("get_table_policy")?;
        let inner = lock(&self.inner);
        inner.require_table(table)?;
        Ok(inner
            .table_policies
            .get(table)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default())
    }
}

// ---------------- Identity ----------------

#[derive(Debug, Default)]
struct IdentityInner {
    accounts: HashMap<String, ServiceAccount>,
    keys: HashMap<String, Vec<String>>,
    project_roles: HashSet<(String, String, String)>,
    next_key: u64,
}

#[derive(Debug, Clone)]
pub struct MemoryIdentity {
    inner: Arc<Mutex<IdentityInner>>,
    faults: FaultInjector,
}

impl MemoryIdentity {
    #[must_use]
    pub fn new(faults: FaultInjector) -> Self {
        Self {
            inner: Arc::default(),
            faults,
        }
    }

    #[must_use]
    pub fn account_exists(&self, email: &str) -> bool {
        lock(&self.inner).accounts.contains_key(email)
    }

    #[must_use]
    pub fn key_count(&self, email: &str) -> usize {
        lock(&self.inner).keys.get(email).map_or(0, Vec::len)
    }

    #[must_use]
    pub fn has_project_role(&self, project_id: &str, role: &str, member: &str) -> bool {
        lock(&self.inner).project_roles.contains(&(
            project_id.to_string(),
            role.to_string(),
            member.to_string(),
        ))
    }
}

#[async_trait::async_trait]
impl IdentityGateway for MemoryIdentity {
    async fn get_service_account(
        &self,
        email: &str,
    ) -> Result<Option<ServiceAccount>, GatewayError> {
        self.faults.check("get_service_account")?;
        Ok(lock(&self.inner).accounts.get(email).cloned())
    }

    async fn create_service_account(
        &self,
        project_id: &str,
        account_id: &str,
        display_name: &str,
    ) -> Result<ServiceAccount, GatewayError> {
        self.faults.check("create_service_account")?;
        let email = service_account_email(account_id, project_id);
        let mut inner = lock(&self.inner);
        if inner.accounts.contains_key(&email) {
            return Err(GatewayError::already_exists(format!(
                "Service account {email} exists"
            )));
        }
        let account = ServiceAccount {
            email: email.clone(),
            display_name: display_name.to_string(),
        };
        inner.accounts.insert(email, account.clone());
        Ok(account)
    }

    async fn delete_service_account(&self, email: &str) -> Result<(), GatewayError> {
        self.faults.check("delete_service_account")?;
        let mut inner = lock(&self.inner);
        inner.keys.remove(email);
        inner
            .accounts
            .remove(email)
            .map(|_| ())
            .ok_or_else(|| GatewayError::not_found(format!("Service account {email} not found")))
    }

    async fn create_key(&self, email: &str) -> Result<ServiceAccountKey, GatewayError> {
        self.faults.check("create_key")?;
        let mut inner = lock(&self.inner);
        if !inner.accounts.contains_key(email) {
            return Err(GatewayError::not_found(format!(
                "Service account {email} not found"
            )));
        }
        inner.next_key += 1;
        let name = format!(
            "projects/-/serviceAccounts/{email}/keys/{}",
            inner.next_key
        );
        inner
            .keys
            .entry(email.to_string())
            .or_default()
            .push(name.clone());
        Ok(ServiceAccountKey {
            private_key_data: Some(format!("{{\"client_email\":\"{email}\",\"key\":\"{name}\"}}")),
            name,
            user_managed: true,
        })
    }

    async fn list_keys(&self, email: &str) -> Result<Vec<ServiceAccountKey>, GatewayError> {
        self.faults.check("list_keys")?;
        Ok(lock(&self.inner)
            .keys
            .get(email)
            .into_iter()
            .flatten()
            .map(|name| ServiceAccountKey {
                name: name.clone(),
                user_managed: true,
                private_key_data: None,
            })
            .collect())
    }

    async fn delete_key(&self, key_name: &str) -> Result<(), GatewayError> {
        self.faults.check("delete_key")?;
        let mut inner = lock(&self.inner);
        for keys in inner.keys.values_mut() {
            if let Some(pos) = keys.iter().position(|k| k == key_name) {
                keys.remove(pos);
                return Ok(());
            }
        }
        Err(GatewayError::not_found(format!("Key {key_name} not found")))
    }

    async fn grant_project_role(
        &self,
        project_id: &str,
        role: &str,
        member: &str,
    ) -> Result<(), GatewayError> {
        self.faults.check("grant_project_role")?;
        lock(&self.inner).project_roles.insert((
            project_id.to_string(),
            role.to_string(),
            member.to_string(),
        ));
        Ok(())
    }

    async fn revoke_project_role(
        &self,
        project_id: &str,
        role: &str,
        member: &str,
    ) -> Result<(), GatewayError> {
        self.faults.check("revoke_project_role")?;
        let removed = lock(&self.inner).project_roles.remove(&(
            project_id.to_string(),
            role.to_string(),
            member.to_string(),
        ));
        if removed {
            Ok(())
        } else {
            Err(GatewayError::not_found(format!(
                "{member} does not hold {role} on {project_id}"
            )))
        }
    }
}

// ---------------- BI tool ----------------

#[derive(Debug, Default)]
struct BiInner {
    next_id: i64,
    databases: BTreeMap<BiDatabaseId, (BiDatabase, NewDatabase)>,
    synced: HashSet<BiDatabaseId>,
    collections: BTreeMap<CollectionId, Collection>,
    collection_access: HashMap<(CollectionId, PermissionGroupId), CollectionAccess>,
    groups: BTreeMap<PermissionGroupId, PermissionGroup>,
    members: HashMap<PermissionGroupId, BTreeSet<String>>,
    users: HashSet<String>,
    graph: PermissionGraph,
}

impl BiInner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn require_group(&self, group: PermissionGroupId) -> Result<(), GatewayError> {
        if self.groups.contains_key(&group) {
            Ok(())
        } else {
            Err(GatewayError::not_found(format!(
                "Permission group {group} not found"
            )))
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryBiTool {
    inner: Arc<Mutex<BiInner>>,
    faults: FaultInjector,
}

impl MemoryBiTool {
    #[must_use]
    pub fn new(all_users_group: PermissionGroupId, faults: FaultInjector) -> Self {
        let mut inner = BiInner {
            next_id: all_users_group.get().max(100),
            ..BiInner::default()
        };
        inner.groups.insert(
            all_users_group,
            PermissionGroup {
                id: all_users_group,
                name: "All Users".to_string(),
            },
        );
        Self {
            inner: Arc::new(Mutex::new(inner)),
            faults,
        }
    }

    pub fn add_user(&self, email: &str) {
        lock(&self.inner).users.insert(email.to_string());
    }

    /// Create a database outside of dataport, e.g. one the all-users group already uses.
    pub fn add_foreign_database(&self, name: &str, table: &WarehouseTable) -> BiDatabaseId {
        let mut inner = lock(&self.inner);
        let id = BiDatabaseId::new(inner.next_id());
        inner.databases.insert(
            id,
            (
                BiDatabase {
                    id,
                    name: name.to_string(),
                },
                NewDatabase {
                    name: name.to_string(),
                    table: table.clone(),
                    service_account_key: String::new(),
                },
            ),
        );
        inner.synced.insert(id);
        id
    }

    /// Rename a collection without going through the gateway, like a BI user would.
    pub fn rename_collection(&self, id: CollectionId, name: &str) {
        if let Some(collection) = lock(&self.inner).collections.get_mut(&id) {
            collection.name = name.to_string();
        }
    }

    pub fn set_database_access(&self, group: PermissionGroupId, database: BiDatabaseId) {
        lock(&self.inner)
            .graph
            .groups
            .entry(group)
            .or_default()
            .insert(database);
    }

    #[must_use]
    pub fn databases(&self) -> Vec<BiDatabase> {
        lock(&self.inner)
            .databases
            .values()
            .map(|(db, _)| db.clone())
            .collect()
    }

    /// Key the database was connected with.
    #[must_use]
    pub fn database_key(&self, id: BiDatabaseId) -> Option<String> {
        lock(&self.inner)
            .databases
            .get(&id)
            .map(|(_, new)| new.service_account_key.clone())
    }

    #[must_use]
    pub fn collection(&self, id: CollectionId) -> Option<Collection> {
        lock(&self.inner).collections.get(&id).cloned()
    }

    #[must_use]
    pub fn collection_access(
        &self,
        collection: CollectionId,
        group: PermissionGroupId,
    ) -> Option<CollectionAccess> {
        lock(&self.inner)
            .collection_access
            .get(&(collection, group))
            .copied()
    }

    #[must_use]
    pub fn group_exists(&self, group: PermissionGroupId) -> bool {
        lock(&self.inner).groups.contains_key(&group)
    }

    #[must_use]
    pub fn members(&self, group: PermissionGroupId) -> BTreeSet<String> {
        lock(&self.inner)
            .members
            .get(&group)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn reachable_databases(&self, group: PermissionGroupId) -> BTreeSet<BiDatabaseId> {
        lock(&self.inner).graph.databases_for(group)
    }
}

#[async_trait::async_trait]
impl BiToolGateway for MemoryBiTool {
    async fn create_database(&self, database: &NewDatabase) -> Result<BiDatabase, GatewayError> {
        self.faults.check("create_database")?;
        let mut inner = lock(&self.inner);
        if inner
            .databases
            .values()
            .any(|(db, _)| db.name == database.name)
        {
            return Err(GatewayError::already_exists(format!(
                "Database `{}` exists",
                database.name
            )));
        }
        let id = BiDatabaseId::new(inner.next_id());
        let created = BiDatabase {
            id,
            name: database.name.clone(),
        };
        inner
            .databases
            .insert(id, (created.clone(), database.clone()));
        Ok(created)
    }

    async fn get_database(&self, id: BiDatabaseId) -> Result<Option<BiDatabase>, GatewayError> {
        self.faults.check("get_database")?;
        Ok(lock(&self.inner)
            .databases
            .get(&id)
            .map(|(db, _)| db.clone()))
    }

    async fn list_databases(&self) -> Result<Vec<BiDatabase>, GatewayError> {
        self.faults.check("list_databases")?;
        Ok(self.databases())
    }

    async fn delete_database(&self, id: BiDatabaseId) -> Result<(), GatewayError> {
        self.faults.check("delete_database")?;
        let mut inner = lock(&self.inner);
        if inner.databases.remove(&id).is_none() {
            return Err(GatewayError::not_found(format!("Database {id} not found")));
        }
        inner.synced.remove(&id);
        for databases in inner.graph.groups.values_mut() {
            databases.remove(&id);
        }
        inner.graph.revision += 1;
        Ok(())
    }

    async fn sync_database_schema(&self, id: BiDatabaseId) -> Result<(), GatewayError> {
        self.faults.check("sync_database_schema")?;
        let mut inner = lock(&self.inner);
        if !inner.databases.contains_key(&id) {
            return Err(GatewayError::not_found(format!("Database {id} not found")));
        }
        inner.synced.insert(id);
        Ok(())
    }

    async fn wait_for_table(
        &self,
        id: BiDatabaseId,
        table: &str,
        _timeout: Duration,
    ) -> Result<(), GatewayError> {
        self.faults.check("wait_for_table")?;
        let inner = lock(&self.inner);
        if !inner.databases.contains_key(&id) {
            return Err(GatewayError::not_found(format!("Database {id} not found")));
        }
        if inner.synced.contains(&id) {
            Ok(())
        } else {
            Err(GatewayError::unavailable(format!(
                "Table `{table}` did not appear in database {id}"
            )))
        }
    }

    async fn create_collection(
        &self,
        name: &str,
        description: &str,
    ) -> Result<Collection, GatewayError> {
        self.faults.check("create_collection")?;
        let mut inner = lock(&self.inner);
        let collection = Collection {
            id: CollectionId::new(inner.next_id()),
            name: name.to_string(),
            description: Some(description.to_string()),
            archived: false,
        };
        inner
            .collections
            .insert(collection.id, collection.clone());
        Ok(collection)
    }

    async fn update_collection(
        &self,
        id: CollectionId,
        name: &str,
    ) -> Result<Collection, GatewayError> {
        self.faults.check("update_collection")?;
        let mut inner = lock(&self.inner);
        match inner.collections.get_mut(&id) {
            Some(collection) if !collection.archived => {
                collection.name = name.to_string();
                Ok(collection.clone())
            }
            _ => Err(GatewayError::not_found(format!(
                "Collection {id} not found"
            ))),
        }
    }

    async fn archive_collection(&self, id: CollectionId) -> Result<(), GatewayError> {
        self.faults.check("archive_collection")?;
        let mut inner = lock(&self.inner);
        match inner.collections.get_mut(&id) {
            Some(collection) => {
                collection.archived = true;
                Ok(())
            }
            None => Err(GatewayError::not_found(format!(
                "Collection {id} not found"
            ))),
        }
    }

    async fn list_collections(&self) -> Result<Vec<Collection>, GatewayError> {
        self.faults.check("list_collections")?;
        Ok(lock(&self.inner)
            .collections
            .values()
            .filter(|c| !c.archived)
            .cloned()
            .collect())
    }

    async fn find_permission_group(
        &self,
        name: &str,
    ) -> Result<Option<PermissionGroup>, GatewayError> {
        self.faults.check("find_permission_group")?;
        Ok(lock(&self.inner)
            .groups
            .values()
            .find(|g| g.name == name)
            .cloned())
    }

    async fn create_or_get_permission_group(
        &self,
        name: &str,
    ) -> Result<PermissionGroup, GatewayError> {
        self.faults.check("create_or_get_permission_group")?;
        let mut inner = lock(&self.inner);
        if let Some(group) = inner.groups.values().find(|g| g.name == name) {
            return Ok(group.clone());
        }
        let group = PermissionGroup {
            id: PermissionGroupId::new(inner.next_id()),
            name: name.to_string(),
        };
        inner.groups.insert(group.id, group.clone());
        Ok(group)
    }

    async fn delete_permission_group(&self, id: PermissionGroupId) -> Result<(), GatewayError> {
        self.faults.check("delete_permission_group")?;
        let mut inner = lock(&self.inner);
        inner.require_group(id)?;
        inner.groups.remove(&id);
        inner.members.remove(&id);
        inner.graph.groups.remove(&id);
        inner.collection_access.retain(|(_, group), _| *group != id);
        Ok(())
    }

    async fn add_permission_group_member(
        &self,
        group: PermissionGroupId,
        user_email: &str,
    ) -> Result<(), GatewayError> {
        self.faults.check("add_permission_group_member")?;
        let mut inner = lock(&self.inner);
        inner.require_group(group)?;
        if !inner.users.contains(user_email) {
            return Err(GatewayError::not_found(format!(
                "User {user_email} not found"
            )));
        }
        inner
            .members
            .entry(group)
            .or_default()
            .insert(user_email.to_string());
        Ok(())
    }

    async fn remove_permission_group_member(
        &self,
        group: PermissionGroupId,
        user_email: &str,
    ) -> Result<(), GatewayError> {
        self.faults.check("remove_permission_group_member")?;
        let removed = lock(&self.inner)
            .members
            .get_mut(&group)
            .is_some_and(|members| members.remove(user_email));
        if removed {
            Ok(())
        } else {
            Err(GatewayError::not_found(format!(
                "{user_email} is no member of group {group}"
            )))
        }
    }

    async fn set_collection_access(
        &self,
        collection: CollectionId,
        group: PermissionGroupId,
        access: CollectionAccess,
    ) -> Result<(), GatewayError> {
        self.faults.check("set_collection_access")?;
        let mut inner = lock(&self.inner);
        inner.require_group(group)?;
        if !inner.collections.contains_key(&collection) {
            return Err(GatewayError::not_found(format!(
                "Collection {collection} not found"
            )));
        }
        inner
            .collection_access
            .insert((collection, group), access);
        Ok(())
    }

    async fn get_permission_graph(&self) -> Result<PermissionGraph, GatewayError> {
        self.faults.check("get_permission_graph")?;
        Ok(lock(&self.inner).graph.clone())
    }

    async fn grant_database_access(
        &self,
        group: PermissionGroupId,
        database: BiDatabaseId,
    ) -> Result<(), GatewayError> {
        self.faults.check("grant_database_access")?;
        let mut inner = lock(&self.inner);
        inner.require_group(group)?;
        if !inner.databases.contains_key(&database) {
            return Err(GatewayError::not_found(format!(
                "Database {database} not found"
            )));
        }
        inner.graph.groups.entry(group).or_default().insert(database);
        inner.graph.revision += 1;
        Ok(())
    }

    async fn revoke_database_access(
        &self,
        group: PermissionGroupId,
        database: BiDatabaseId,
    ) -> Result<(), GatewayError> {
        self.faults.check("revoke_database_access")?;
        let mut inner = lock(&self.inner);
        let removed = inner
            .graph
            .groups
            .get_mut(&group)
            .is_some_and(|databases| databases.remove(&database));
        if !removed {
            return Err(GatewayError::not_found(format!(
                "Group {group} has no access to database {database}"
            )));
        }
        inner.graph.revision += 1;
        Ok(())
    }
}
