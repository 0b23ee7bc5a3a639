use std::collections::BTreeSet;

use pretty_assertions::assert_eq;

use crate::{
    service::{
        BindingMode, GatewayErrorKind, ResourceNames, SubjectType, WarehouseTable,
        access_bridge::{self, GrantOutcome, RevokeOutcome},
        gateways::CollectionAccess,
        orchestrator,
    },
    tests::{ACCOUNT_PROJECT, ALL_USERS_GROUP, RESTRICTED_ROLE, TestContext, setup},
};

fn names(ctx: &TestContext, dataset: &crate::service::Dataset) -> ResourceNames {
    ctx.state.settings.resource_names(dataset)
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_restricted_binding_end_to_end() {
    let ctx = setup();
    let (dataset, table) = ctx.add_dataset("Orders");
    let names = names(&ctx, &dataset);

    ctx.fakes.bi.add_user("alice@example.com");
    ctx.fakes
        .catalog
        .add_grant(dataset.id, "alice@example.com", SubjectType::User);
    ctx.fakes
        .catalog
        .add_grant(dataset.id, "analysts@example.com", SubjectType::Group);
    ctx.fakes
        .catalog
        .add_grant(dataset.id, "ghost@example.com", SubjectType::User);

    let binding = ctx.bind(dataset.id, BindingMode::Restricted).await;
    let account = names.service_account_email.as_str();
    assert_eq!(binding.service_account_email, account);

    // Dedicated identity
    assert!(ctx.fakes.identity.account_exists(account));
    assert_eq!(ctx.fakes.identity.key_count(account), 1);
    assert!(
        ctx.fakes
            .identity
            .has_project_role(ACCOUNT_PROJECT, RESTRICTED_ROLE, account)
    );
    assert!(ctx.fakes.warehouse.table_members(&table).contains(account));
    assert!(ctx.fakes.warehouse.dataset_members(&table).contains(account));

    // Permission group with the known users among the grantees
    let group = binding.permission_group_id.unwrap();
    assert_eq!(
        ctx.fakes.bi.members(group),
        BTreeSet::from(["alice@example.com".to_string()])
    );

    // Marked collection writable by the group only
    let collection = ctx.fakes.bi.collection(binding.collection_id.unwrap()).unwrap();
    assert_eq!(collection.name, "Orders 🔐");
    assert_eq!(
        collection.description.as_deref(),
        Some(names.collection_description.as_str())
    );
    assert_eq!(
        ctx.fakes.bi.collection_access(collection.id, group),
        Some(CollectionAccess::Write)
    );
    assert_eq!(
        ctx.fakes.bi.collection_access(collection.id, ALL_USERS_GROUP),
        Some(CollectionAccess::None)
    );

    // Database connected with the dedicated account, reachable by the group only
    let database = binding.bi_database_id.unwrap();
    assert_eq!(
        ctx.fakes.bi.reachable_databases(group),
        BTreeSet::from([database])
    );
    assert!(!ctx.fakes.bi.reachable_databases(ALL_USERS_GROUP).contains(&database));
    assert!(
        ctx.fakes
            .bi
            .database_key(database)
            .unwrap()
            .contains(account)
    );
}

#[tokio::test]
async fn test_failed_step_resumes_without_duplicates() {
    let ctx = setup();
    let (dataset, _) = ctx.add_dataset("Orders");
    ctx.fakes
        .faults
        .fail("create_database", GatewayErrorKind::Unavailable, 1);

    orchestrator::request_binding(dataset.id, BindingMode::Restricted, "alice", &ctx.state)
        .await
        .unwrap();
    ctx.run_pending_jobs().await;

    let status = ctx.status(dataset.id, BindingMode::Restricted).await;
    assert!(!status.is_completed);
    assert!(status.has_failed);
    assert!(status.error.unwrap().contains("Injected failure"));
    // Steps before the failure are not rolled back
    let partial = ctx.binding(dataset.id).await.unwrap();
    assert!(partial.permission_group_id.is_some());
    assert!(partial.collection_id.is_some());
    assert!(partial.bi_database_id.is_none());
    assert!(partial.last_error.is_some());

    // The caller re-issues the create request
    orchestrator::request_binding(dataset.id, BindingMode::Restricted, "alice", &ctx.state)
        .await
        .unwrap();
    ctx.run_pending_jobs().await;

    let status = ctx.status(dataset.id, BindingMode::Restricted).await;
    assert!(status.is_completed);
    assert!(!status.has_failed);

    let binding = ctx.binding(dataset.id).await.unwrap();
    assert_eq!(binding.permission_group_id, partial.permission_group_id);
    assert_eq!(binding.collection_id, partial.collection_id);
    assert_eq!(binding.last_error, None);
    assert_eq!(ctx.fakes.faults.calls("create_service_account"), 1);
    assert_eq!(ctx.fakes.faults.calls("create_collection"), 1);
    assert_eq!(ctx.fakes.bi.databases().len(), 1);
    // The key of the failed run is replaced, not accumulated
    assert_eq!(ctx.fakes.identity.key_count(&binding.service_account_email), 1);
}

#[tokio::test]
async fn test_restricted_group_reaches_exactly_one_database() {
    let ctx = setup();
    let (dataset, _) = ctx.add_dataset("Orders");
    let binding = ctx.bind(dataset.id, BindingMode::Restricted).await;
    let group = binding.permission_group_id.unwrap();

    // Someone grants the group another database in the BI tool
    let stray = ctx.fakes.bi.add_foreign_database(
        "Finance",
        &WarehouseTable {
            project_id: "finance-prod".to_string(),
            dataset: "ledger".to_string(),
            table: "entries".to_string(),
        },
    );
    ctx.fakes.bi.set_database_access(group, stray);

    let resynced = ctx.bind(dataset.id, BindingMode::Restricted).await;
    assert_eq!(resynced.bi_database_id, binding.bi_database_id);
    assert_eq!(
        ctx.fakes.bi.reachable_databases(group),
        BTreeSet::from([binding.bi_database_id.unwrap()])
    );
    // An existing database is reused, so no new key is issued
    assert_eq!(ctx.fakes.faults.calls("create_key"), 1);
}

#[tokio::test]
async fn test_restricted_grant_and_revoke_manage_membership() {
    let ctx = setup();
    let (dataset, table) = ctx.add_dataset("Orders");
    ctx.fakes.bi.add_user("alice@example.com");
    ctx.fakes.bi.add_user("bob@example.com");
    ctx.fakes
        .catalog
        .add_grant(dataset.id, "alice@example.com", SubjectType::User);
    let binding = ctx.bind(dataset.id, BindingMode::Restricted).await;
    let group = binding.permission_group_id.unwrap();

    let bob = ctx
        .fakes
        .catalog
        .add_grant(dataset.id, "bob@example.com", SubjectType::User);
    let outcome =
        access_bridge::on_grant(dataset.id, "bob@example.com", SubjectType::User, &ctx.state)
            .await
            .unwrap();
    assert_eq!(outcome, GrantOutcome::MemberAdded);
    assert!(ctx.fakes.bi.members(group).contains("bob@example.com"));

    let outcome = access_bridge::on_grant(
        dataset.id,
        "analysts@example.com",
        SubjectType::Group,
        &ctx.state,
    )
    .await
    .unwrap();
    assert_eq!(outcome, GrantOutcome::MembershipSkipped);

    ctx.fakes.catalog.revoke_grant(bob);
    let outcome = access_bridge::on_revoke(dataset.id, bob, &ctx.state)
        .await
        .unwrap();
    assert_eq!(outcome, RevokeOutcome::GrantsRemain(1));
    assert!(!ctx.fakes.bi.members(group).contains("bob@example.com"));
    assert!(
        ctx.fakes
            .warehouse
            .table_members(&table)
            .contains(&binding.service_account_email)
    );
}

#[tokio::test]
async fn test_delete_restricted_binding() {
    let ctx = setup();
    let (dataset, table) = ctx.add_dataset("Orders");
    let binding = ctx.bind(dataset.id, BindingMode::Restricted).await;
    let account = binding.service_account_email.clone();

    orchestrator::remove_binding(dataset.id, BindingMode::Restricted, "alice", &ctx.state)
        .await
        .unwrap();
    ctx.run_pending_jobs().await;

    assert!(ctx.binding(dataset.id).await.is_none());
    assert!(ctx.fakes.bi.databases().is_empty());
    assert!(!ctx.fakes.bi.group_exists(binding.permission_group_id.unwrap()));
    assert!(
        ctx.fakes
            .bi
            .collection(binding.collection_id.unwrap())
            .unwrap()
            .archived
    );
    assert!(!ctx.fakes.identity.account_exists(&account));
    assert!(
        !ctx.fakes
            .identity
            .has_project_role(ACCOUNT_PROJECT, RESTRICTED_ROLE, &account)
    );
    assert!(ctx.fakes.warehouse.table_members(&table).is_empty());
    assert!(ctx.fakes.warehouse.dataset_members(&table).is_empty());

    // Re-binding derives the same identity
    let rebound = ctx.bind(dataset.id, BindingMode::Restricted).await;
    assert_eq!(rebound.service_account_email, account);
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let ctx = setup();
    let (dataset, _) = ctx.add_dataset("Orders");
    ctx.bind(dataset.id, BindingMode::Restricted).await;

    for _ in 0..2 {
        orchestrator::remove_binding(dataset.id, BindingMode::Restricted, "alice", &ctx.state)
            .await
            .unwrap();
        ctx.run_pending_jobs().await;
    }
    let jobs = orchestrator::list_jobs(dataset.id, &ctx.state).await.unwrap();
    assert!(jobs.iter().all(|job| job.last_error.is_none()), "{jobs:#?}");
    assert!(ctx.binding(dataset.id).await.is_none());
}

#[tokio::test]
async fn test_delete_never_creates_a_permission_group() {
    let ctx = setup();
    let (dataset, _) = ctx.add_dataset("Orders");
    ctx.fakes
        .faults
        .fail("create_service_account", GatewayErrorKind::Unavailable, 1);

    // The create fails before any permission group was made
    orchestrator::request_binding(dataset.id, BindingMode::Restricted, "alice", &ctx.state)
        .await
        .unwrap();
    ctx.run_pending_jobs().await;
    assert!(ctx.status(dataset.id, BindingMode::Restricted).await.has_failed);
    assert_eq!(ctx.binding(dataset.id).await.unwrap().permission_group_id, None);

    orchestrator::remove_binding(dataset.id, BindingMode::Restricted, "alice", &ctx.state)
        .await
        .unwrap();
    ctx.run_pending_jobs().await;

    assert!(ctx.binding(dataset.id).await.is_none());
    assert!(ctx.status(dataset.id, BindingMode::Restricted).await.is_completed);
    assert_eq!(ctx.fakes.faults.calls("find_permission_group"), 1);
    assert_eq!(ctx.fakes.faults.calls("create_or_get_permission_group"), 0);
    assert_eq!(ctx.fakes.faults.calls("delete_permission_group"), 0);
}
