use pretty_assertions::assert_eq;

use crate::{
    api::management::v1::{ApiServer, bindings::Service as _},
    implementations::memory::MemoryStore,
    service::{
        BindingMode, EnqueueOutcome, SubjectType, WarehouseTable,
        access_bridge::{self, GrantOutcome, RevokeOutcome},
        orchestrator::{self, BindingStatus, RequestBindingError},
        syncers::sync_missing_datasources,
    },
    tests::{ALL_USERS_GROUP, SHARED_ACCOUNT, SHARED_KEY, random_request_metadata, setup},
};

#[tokio::test]
#[tracing_test::traced_test]
async fn test_open_binding_end_to_end() {
    let ctx = setup();
    let (dataset, table) = ctx.add_dataset("Orders");

    ApiServer::<MemoryStore>::create_binding(
        dataset.id,
        BindingMode::Open,
        ctx.api_context(),
        random_request_metadata(),
    )
    .await
    .unwrap();

    // Nothing happens before a worker picks the job up
    let status = ctx.status(dataset.id, BindingMode::Open).await;
    assert!(!status.is_completed);
    assert!(!status.has_failed);
    assert!(ctx.fakes.bi.databases().is_empty());

    assert_eq!(ctx.run_pending_jobs().await, 1);
    assert_eq!(
        ctx.status(dataset.id, BindingMode::Open).await,
        BindingStatus {
            is_completed: true,
            has_failed: false,
            error: None,
        }
    );

    let binding = ctx.binding(dataset.id).await.unwrap();
    let database = binding.bi_database_id.unwrap();
    assert_eq!(binding.service_account_email, SHARED_ACCOUNT);
    assert_eq!(binding.permission_group_id, None);
    assert_eq!(binding.collection_id, None);
    assert_eq!(ctx.fakes.bi.database_key(database).as_deref(), Some(SHARED_KEY));
    assert!(ctx.fakes.bi.reachable_databases(ALL_USERS_GROUP).contains(&database));
    assert!(ctx.fakes.warehouse.dataset_members(&table).contains(SHARED_ACCOUNT));

    // Access granted to a group through the access-request system
    ctx.fakes
        .catalog
        .add_grant(dataset.id, "analysts@example.com", SubjectType::Group);
    let outcome =
        access_bridge::on_grant(dataset.id, "analysts@example.com", SubjectType::Group, &ctx.state)
            .await
            .unwrap();
    assert_eq!(outcome, GrantOutcome::TableAccessEnsured);
    assert!(ctx.fakes.warehouse.table_members(&table).contains(SHARED_ACCOUNT));

    // The table is deleted outside of the platform
    ctx.fakes.warehouse.drop_table(&table);
    let report = sync_missing_datasources(&ctx.state).await.unwrap();
    assert_eq!(report.removed, vec![dataset.id]);
    assert!(ctx.binding(dataset.id).await.is_none());
    assert!(ctx.fakes.bi.databases().is_empty());
    assert_eq!(
        ctx.fakes.catalog.dataset(dataset.id).unwrap().warehouse_source,
        None
    );
}

#[tokio::test]
async fn test_all_users_group_keeps_existing_databases() {
    let ctx = setup();
    let sample_table = WarehouseTable {
        project_id: "bi-samples".to_string(),
        dataset: "samples".to_string(),
        table: "people".to_string(),
    };
    let sample = ctx
        .fakes
        .bi
        .add_foreign_database("Sample Database", &sample_table);
    ctx.fakes.bi.set_database_access(ALL_USERS_GROUP, sample);

    let (first, _) = ctx.add_dataset("Orders");
    let (second, _) = ctx.add_dataset("Customers");
    let first = ctx.bind(first.id, BindingMode::Open).await;
    let second = ctx.bind(second.id, BindingMode::Open).await;

    let reachable = ctx.fakes.bi.reachable_databases(ALL_USERS_GROUP);
    assert_eq!(reachable.len(), 3);
    assert!(reachable.contains(&sample));
    assert!(reachable.contains(&first.bi_database_id.unwrap()));
    assert!(reachable.contains(&second.bi_database_id.unwrap()));
}

#[tokio::test]
async fn test_concurrent_requests_enqueue_one_job() {
    let ctx = setup();
    let (dataset, _) = ctx.add_dataset("Orders");

    let (a, b) = tokio::join!(
        orchestrator::request_binding(dataset.id, BindingMode::Open, "alice", &ctx.state),
        orchestrator::request_binding(dataset.id, BindingMode::Open, "bob", &ctx.state),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.job().job_id, b.job().job_id);
    assert_eq!(
        usize::from(a.was_enqueued()) + usize::from(b.was_enqueued()),
        1
    );

    // A third request while the job is still pending returns the same job
    let c = orchestrator::request_binding(dataset.id, BindingMode::Open, "carol", &ctx.state)
        .await
        .unwrap();
    assert!(matches!(c, EnqueueOutcome::InFlight(ref job) if job.job_id == a.job().job_id));

    assert_eq!(ctx.run_pending_jobs().await, 1);
    assert_eq!(ctx.fakes.bi.databases().len(), 1);
    assert_eq!(ctx.fakes.faults.calls("create_database"), 1);
}

#[tokio::test]
async fn test_repeated_create_reuses_database() {
    let ctx = setup();
    let (dataset, _) = ctx.add_dataset("Orders");
    let first = ctx.bind(dataset.id, BindingMode::Open).await;
    let second = ctx.bind(dataset.id, BindingMode::Open).await;

    assert_eq!(first.bi_database_id, second.bi_database_id);
    assert_eq!(ctx.fakes.bi.databases().len(), 1);
    assert_eq!(ctx.fakes.faults.calls("create_database"), 1);
}

#[tokio::test]
async fn test_soft_revoke_and_regrant() {
    let ctx = setup();
    let (dataset, table) = ctx.add_dataset("Orders");
    let binding = ctx.bind(dataset.id, BindingMode::Open).await;

    let access_id = ctx
        .fakes
        .catalog
        .add_grant(dataset.id, "alice@example.com", SubjectType::User);
    access_bridge::on_grant(dataset.id, "alice@example.com", SubjectType::User, &ctx.state)
        .await
        .unwrap();

    ctx.fakes.catalog.revoke_grant(access_id);
    let outcome = access_bridge::on_revoke(dataset.id, access_id, &ctx.state)
        .await
        .unwrap();
    assert_eq!(outcome, RevokeOutcome::TableAccessRevoked);

    // Data access is cut, metadata access and the database survive
    assert!(!ctx.fakes.warehouse.table_members(&table).contains(SHARED_ACCOUNT));
    assert!(ctx.fakes.warehouse.dataset_members(&table).contains(SHARED_ACCOUNT));
    let after_revoke = ctx.binding(dataset.id).await.unwrap();
    assert_eq!(after_revoke.bi_database_id, binding.bi_database_id);
    assert_eq!(ctx.fakes.bi.databases().len(), 1);

    // Re-grant is a pure ACL re-add
    ctx.fakes
        .catalog
        .add_grant(dataset.id, "bob@example.com", SubjectType::User);
    let outcome =
        access_bridge::on_grant(dataset.id, "bob@example.com", SubjectType::User, &ctx.state)
            .await
            .unwrap();
    assert_eq!(outcome, GrantOutcome::TableAccessEnsured);
    assert!(ctx.fakes.warehouse.table_members(&table).contains(SHARED_ACCOUNT));
    assert_eq!(ctx.fakes.faults.calls("create_database"), 1);
    assert_eq!(ctx.binding(dataset.id).await.unwrap().bi_database_id, binding.bi_database_id);
}

#[tokio::test]
async fn test_revoke_keeps_access_while_grants_remain() {
    let ctx = setup();
    let (dataset, table) = ctx.add_dataset("Orders");
    ctx.bind(dataset.id, BindingMode::Open).await;

    let alice = ctx
        .fakes
        .catalog
        .add_grant(dataset.id, "alice@example.com", SubjectType::User);
    ctx.fakes
        .catalog
        .add_grant(dataset.id, "bob@example.com", SubjectType::User);

    let outcome = access_bridge::on_revoke(dataset.id, alice, &ctx.state)
        .await
        .unwrap();
    assert_eq!(outcome, RevokeOutcome::GrantsRemain(1));
    assert!(ctx.fakes.warehouse.table_members(&table).contains(SHARED_ACCOUNT));
}

#[tokio::test]
async fn test_grant_on_unbound_dataset_is_noop() {
    let ctx = setup();
    let (dataset, table) = ctx.add_dataset("Orders");
    let outcome =
        access_bridge::on_grant(dataset.id, "alice@example.com", SubjectType::User, &ctx.state)
            .await
            .unwrap();
    assert_eq!(outcome, GrantOutcome::NotBound);
    assert!(ctx.fakes.warehouse.table_members(&table).is_empty());
}

#[tokio::test]
async fn test_dataset_without_source_is_rejected() {
    let ctx = setup();
    let dataset = ctx.fakes.catalog.add_dataset("Notes", None);

    let err = orchestrator::request_binding(dataset.id, BindingMode::Open, "alice", &ctx.state)
        .await
        .unwrap_err();
    assert!(matches!(err, RequestBindingError::NoWarehouseSource(_)));
    assert!(
        orchestrator::list_jobs(dataset.id, &ctx.state)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_delete_open_binding() {
    let ctx = setup();
    let (first, table) = ctx.add_dataset("Orders");
    let (second, _) = ctx.add_dataset("Customers");
    ctx.bind(first.id, BindingMode::Open).await;
    ctx.bind(second.id, BindingMode::Open).await;

    orchestrator::remove_binding(first.id, BindingMode::Open, "alice", &ctx.state)
        .await
        .unwrap();
    assert!(!ctx.status(first.id, BindingMode::Open).await.is_completed);
    ctx.run_pending_jobs().await;

    // Polling after the delete reaches a terminal state
    assert_eq!(
        ctx.status(first.id, BindingMode::Open).await,
        BindingStatus {
            is_completed: true,
            has_failed: false,
            error: None,
        }
    );
    assert!(ctx.binding(first.id).await.is_none());
    assert_eq!(ctx.fakes.bi.databases().len(), 1);
    assert!(!ctx.fakes.warehouse.table_members(&table).contains(SHARED_ACCOUNT));
    // Still needed by the second binding, which reads from the same warehouse dataset
    assert!(ctx.fakes.warehouse.dataset_members(&table).contains(SHARED_ACCOUNT));

    orchestrator::remove_binding(second.id, BindingMode::Open, "alice", &ctx.state)
        .await
        .unwrap();
    ctx.run_pending_jobs().await;
    assert!(ctx.fakes.bi.databases().is_empty());
    assert!(ctx.fakes.warehouse.dataset_members(&table).is_empty());
}
