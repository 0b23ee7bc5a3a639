use std::str::FromStr;

use uuid::Uuid;

use super::{ReadWrite, dbutils::DBErrorHandler};
use crate::service::{
    AccessGrant, AccessId, BackendError, DatabaseIntegrityError, Dataset, DatasetId, SubjectType,
    WarehouseTable,
    catalog::{AccessGrantSource, DatasetCatalog},
};

/// Read side of the platform's catalog tables. The tables are owned by the catalog
/// service; the only write is the removal of a dangling warehouse source.
#[derive(Debug, Clone)]
pub struct PostgresCatalog {
    read_write: ReadWrite,
}

impl PostgresCatalog {
    #[must_use]
    pub fn new(read_write: ReadWrite) -> Self {
        Self { read_write }
    }
}

#[derive(sqlx::FromRow, Debug)]
struct DatasetRow {
    id: Uuid,
    name: String,
    project_id: Option<String>,
    dataset: Option<String>,
    table_name: Option<String>,
}

impl From<DatasetRow> for Dataset {
    fn from(row: DatasetRow) -> Self {
        let warehouse_source = match (row.project_id, row.dataset, row.table_name) {
            (Some(project_id), Some(dataset), Some(table)) => Some(WarehouseTable {
                project_id,
                dataset,
                table,
            }),
            _ => None,
        };
        Dataset {
            id: row.id.into(),
            name: row.name,
            warehouse_source,
        }
    }
}

#[derive(sqlx::FromRow, Debug)]
struct GrantRow {
    id: Uuid,
    dataset_id: Uuid,
    subject: String,
    subject_type: String,
    revoked: bool,
}

impl TryFrom<GrantRow> for AccessGrant {
    type Error = BackendError;

    fn try_from(row: GrantRow) -> Result<Self, Self::Error> {
        let subject_type = SubjectType::from_str(&row.subject_type).map_err(|_| {
            BackendError::new_unexpected(DatabaseIntegrityError::new(format!(
                "Unknown subject type `{}` on access grant {}",
                row.subject_type, row.id
            )))
        })?;
        Ok(AccessGrant {
            access_id: row.id.into(),
            dataset_id: row.dataset_id.into(),
            subject: row.subject,
            subject_type,
            revoked: row.revoked,
        })
    }
}

#[async_trait::async_trait]
impl DatasetCatalog for PostgresCatalog {
    async fn get_dataset(&self, dataset_id: DatasetId) -> Result<Option<Dataset>, BackendError> {
        let row = sqlx::query_as::<_, DatasetRow>(
            r"SELECT d.id, d.name, s.project_id, s.dataset, s.table_name
            FROM dataset d
            LEFT JOIN datasource_bigquery s ON s.dataset_id = d.id
            WHERE d.id = $1",
        )
        .bind(*dataset_id)
        .fetch_optional(&self.read_write.read_pool)
        .await
        .map_err(|e| {
            e.into_backend_error()
                .append_detail(format!("Failed to load dataset {dataset_id}"))
        })?;
        Ok(row.map(Into::into))
    }

    async fn delete_warehouse_source(&self, dataset_id: DatasetId) -> Result<(), BackendError> {
        sqlx::query("DELETE FROM datasource_bigquery WHERE dataset_id = $1")
            .bind(*dataset_id)
            .execute(&self.read_write.write_pool)
            .await
            .map_err(|e| {
                e.into_backend_error().append_detail(format!(
                    "Failed to delete warehouse source of dataset {dataset_id}"
                ))
            })?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl AccessGrantSource for PostgresCatalog {
    async fn get_grant(&self, access_id: AccessId) -> Result<Option<AccessGrant>, BackendError> {
        sqlx::query_as::<_, GrantRow>(
            r"SELECT id, dataset_id, subject, subject_type, revoked
            FROM dataset_access WHERE id = $1",
        )
        .bind(*access_id)
        .fetch_optional(&self.read_write.read_pool)
        .await
        .map_err(|e| {
            e.into_backend_error()
                .append_detail(format!("Failed to load access grant {access_id}"))
        })?
        .map(AccessGrant::try_from)
        .transpose()
    }

    async fn list_active_grants(
        &self,
        dataset_id: DatasetId,
    ) -> Result<Vec<AccessGrant>, BackendError> {
        sqlx::query_as::<_, GrantRow>(
            r"SELECT id, dataset_id, subject, subject_type, revoked
            FROM dataset_access
            WHERE dataset_id = $1 AND NOT revoked
            ORDER BY id",
        )
        .bind(*dataset_id)
        .fetch_all(&self.read_write.read_pool)
        .await
        .map_err(|e| {
            e.into_backend_error()
                .append_detail(format!("Failed to list access grants of {dataset_id}"))
        })?
        .into_iter()
        .map(AccessGrant::try_from)
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use sqlx::PgPool;

    use super::*;

    async fn insert_dataset(name: &str, source: Option<&WarehouseTable>, pool: &PgPool) -> DatasetId {
        let id = DatasetId::new_random();
        sqlx::query("INSERT INTO dataset (id, name) VALUES ($1, $2)")
            .bind(*id)
            .bind(name)
            .execute(pool)
            .await
            .unwrap();
        if let Some(table) = source {
            sqlx::query(
                r"INSERT INTO datasource_bigquery (dataset_id, project_id, dataset, table_name)
                VALUES ($1, $2, $3, $4)",
            )
            .bind(*id)
            .bind(&table.project_id)
            .bind(&table.dataset)
            .bind(&table.table)
            .execute(pool)
            .await
            .unwrap();
        }
        id
    }

    async fn insert_grant(
        dataset_id: DatasetId,
        subject: &str,
        subject_type: &str,
        revoked: bool,
        pool: &PgPool,
    ) -> AccessId {
        let id = AccessId::new_random();
        sqlx::query(
            r"INSERT INTO dataset_access (id, dataset_id, subject, subject_type, revoked)
            VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(*id)
        .bind(*dataset_id)
        .bind(subject)
        .bind(subject_type)
        .bind(revoked)
        .execute(pool)
        .await
        .unwrap();
        id
    }

    fn catalog(pool: &PgPool) -> PostgresCatalog {
        PostgresCatalog::new(ReadWrite::from_pools(pool.clone(), pool.clone()))
    }

    fn orders_table() -> WarehouseTable {
        WarehouseTable {
            project_id: "warehouse-prod".to_string(),
            dataset: "sales".to_string(),
            table: "orders".to_string(),
        }
    }

    #[sqlx::test]
    async fn test_get_dataset_and_delete_source(pool: PgPool) {
        let catalog = catalog(&pool);
        let with_source = insert_dataset("Orders", Some(&orders_table()), &pool).await;
        let without_source = insert_dataset("Drafts", None, &pool).await;

        let dataset = catalog.get_dataset(with_source).await.unwrap().unwrap();
        assert_eq!(dataset.name, "Orders");
        assert_eq!(dataset.warehouse_source, Some(orders_table()));
        let dataset = catalog.get_dataset(without_source).await.unwrap().unwrap();
        assert_eq!(dataset.warehouse_source, None);
        assert!(
            catalog
                .get_dataset(DatasetId::new_random())
                .await
                .unwrap()
                .is_none()
        );

        catalog.delete_warehouse_source(with_source).await.unwrap();
        let dataset = catalog.get_dataset(with_source).await.unwrap().unwrap();
        assert_eq!(dataset.warehouse_source, None);
    }

    #[sqlx::test]
    async fn test_active_grants_skip_revoked(pool: PgPool) {
        let catalog = catalog(&pool);
        let dataset_id = insert_dataset("Orders", Some(&orders_table()), &pool).await;
        let active = insert_grant(dataset_id, "carol@example.com", "user", false, &pool).await;
        let revoked = insert_grant(dataset_id, "dave@example.com", "user", true, &pool).await;
        insert_grant(dataset_id, "analysts@example.com", "group", false, &pool).await;

        let grants = catalog.list_active_grants(dataset_id).await.unwrap();
        assert_eq!(grants.len(), 2);
        assert!(grants.iter().all(|g| !g.revoked));
        let carol = grants.iter().find(|g| g.access_id == active).unwrap();
        assert_eq!(carol.subject_type, SubjectType::User);

        let grant = catalog.get_grant(revoked).await.unwrap().unwrap();
        assert!(grant.revoked);
        assert_eq!(grant.subject, "dave@example.com");
    }

    #[sqlx::test]
    async fn test_unknown_subject_type_is_an_integrity_error(pool: PgPool) {
        let catalog = catalog(&pool);
        let dataset_id = insert_dataset("Orders", None, &pool).await;
        let access_id = insert_grant(dataset_id, "robot", "robot", false, &pool).await;

        let err = catalog.get_grant(access_id).await.unwrap_err();
        assert!(err.to_string().contains("Unknown subject type `robot`"), "{err}");
    }
}
