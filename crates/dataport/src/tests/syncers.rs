use pretty_assertions::assert_eq;

use crate::{
    service::{
        BindingMode, GatewayErrorKind,
        syncers::{sync_collection_markers, sync_missing_datasources},
    },
    tests::{ACCOUNT_PROJECT, RESTRICTED_ROLE, setup},
};

#[tokio::test]
#[tracing_test::traced_test]
async fn test_collection_marker_is_restored() {
    let ctx = setup();
    let (orders, _) = ctx.add_dataset("Orders");
    let (customers, _) = ctx.add_dataset("Customers");
    let renamed = ctx.bind(orders.id, BindingMode::Restricted).await;
    ctx.bind(customers.id, BindingMode::Restricted).await;

    // A BI admin renames the collection and drops the marker
    let collection = renamed.collection_id.unwrap();
    ctx.fakes.bi.rename_collection(collection, "Orders (finance)");

    let report = sync_collection_markers(&ctx.state).await.unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.repaired, vec![orders.id]);
    assert!(report.missing.is_empty());
    assert!(report.failed.is_empty());
    assert_eq!(
        ctx.fakes.bi.collection(collection).unwrap().name,
        "Orders (finance) 🔐"
    );

    let report = sync_collection_markers(&ctx.state).await.unwrap();
    assert!(report.repaired.is_empty());
    assert_eq!(ctx.fakes.faults.calls("update_collection"), 1);
}

#[tokio::test]
async fn test_collection_marker_ignores_open_bindings() {
    let ctx = setup();
    let (dataset, _) = ctx.add_dataset("Orders");
    ctx.bind(dataset.id, BindingMode::Open).await;

    let report = sync_collection_markers(&ctx.state).await.unwrap();
    assert_eq!(report.checked, 0);
}

#[tokio::test]
async fn test_collection_marker_failure_is_reported() {
    let ctx = setup();
    let (dataset, _) = ctx.add_dataset("Orders");
    let binding = ctx.bind(dataset.id, BindingMode::Restricted).await;
    ctx.fakes
        .bi
        .rename_collection(binding.collection_id.unwrap(), "Orders");
    ctx.fakes
        .faults
        .fail("update_collection", GatewayErrorKind::Unavailable, 1);

    let report = sync_collection_markers(&ctx.state).await.unwrap();
    assert!(report.repaired.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].dataset_id, dataset.id);

    // The next pass heals it
    let report = sync_collection_markers(&ctx.state).await.unwrap();
    assert_eq!(report.repaired, vec![dataset.id]);
}

#[tokio::test]
async fn test_missing_datasource_removes_restricted_binding() {
    let ctx = setup();
    let (gone, gone_table) = ctx.add_dataset("Orders");
    let (kept, _) = ctx.add_dataset("Customers");
    let binding = ctx.bind(gone.id, BindingMode::Restricted).await;
    let kept_binding = ctx.bind(kept.id, BindingMode::Open).await;

    ctx.fakes.warehouse.drop_table(&gone_table);
    let report = sync_missing_datasources(&ctx.state).await.unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.removed, vec![gone.id]);
    assert!(report.failed.is_empty());

    assert!(ctx.binding(gone.id).await.is_none());
    assert!(!ctx.fakes.identity.account_exists(&binding.service_account_email));
    assert!(
        !ctx.fakes.identity.has_project_role(
            ACCOUNT_PROJECT,
            RESTRICTED_ROLE,
            &binding.service_account_email
        )
    );
    assert!(!ctx.fakes.bi.group_exists(binding.permission_group_id.unwrap()));
    assert_eq!(ctx.fakes.catalog.dataset(gone.id).unwrap().warehouse_source, None);

    // Bindings whose table still exists are untouched
    assert_eq!(ctx.binding(kept.id).await, Some(kept_binding.clone()));
    assert_eq!(
        ctx.fakes.bi.databases().into_iter().map(|d| d.id).collect::<Vec<_>>(),
        vec![kept_binding.bi_database_id.unwrap()]
    );

    let report = sync_missing_datasources(&ctx.state).await.unwrap();
    assert_eq!(report.checked, 1);
    assert!(report.removed.is_empty());
}

#[tokio::test]
async fn test_missing_datasource_failure_keeps_binding() {
    let ctx = setup();
    let (dataset, table) = ctx.add_dataset("Orders");
    ctx.bind(dataset.id, BindingMode::Open).await;
    ctx.fakes.warehouse.drop_table(&table);
    ctx.fakes
        .faults
        .fail("delete_database", GatewayErrorKind::Unavailable, 1);

    let report = sync_missing_datasources(&ctx.state).await.unwrap();
    assert!(report.removed.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert!(ctx.binding(dataset.id).await.is_some());
    assert!(ctx.fakes.catalog.dataset(dataset.id).unwrap().warehouse_source.is_some());

    let report = sync_missing_datasources(&ctx.state).await.unwrap();
    assert_eq!(report.removed, vec![dataset.id]);
}
