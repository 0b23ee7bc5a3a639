use std::sync::Arc;

use dataport::{
    CONFIG,
    implementations::{
        get_default_gateways_from_config,
        postgres::{PostgresBackend, ReadWrite},
    },
    serve::{ServeConfiguration, serve},
    service::{
        BindingSettings, State,
        syncers::{self, CollectionMarkerReport, MissingDatasourceReport},
    },
    tracing,
};

pub(crate) async fn serve_default(bind_addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let read_write = ReadWrite::from_config().await?;
    let gateways = get_default_gateways_from_config(read_write.clone()).await?;

    let config = ServeConfiguration::<PostgresBackend>::builder()
        .bind_addr(bind_addr)
        .store_state(read_write)
        .gateways(gateways)
        .settings(BindingSettings::from_config(&CONFIG))
        .build();

    serve(config).await
}

async fn default_state() -> anyhow::Result<State<PostgresBackend>> {
    let read_write = ReadWrite::from_config().await?;
    let gateways = get_default_gateways_from_config(read_write.clone()).await?;
    Ok(State {
        store: read_write,
        gateways,
        settings: Arc::new(BindingSettings::from_config(&CONFIG)),
    })
}

pub(crate) async fn sync_collection_markers() -> anyhow::Result<()> {
    let state = default_state().await?;
    let report: CollectionMarkerReport = syncers::sync_collection_markers(&state)
        .await
        .map_err(|e| anyhow::anyhow!(e).context("Collection marker sync failed"))?;
    tracing::info!(
        checked = report.checked,
        repaired = report.repaired.len(),
        missing = report.missing.len(),
        failed = report.failed.len(),
        "Collection marker sync finished"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.failed.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} collections could not be repaired", report.failed.len())
    }
}

pub(crate) async fn sync_missing_datasources() -> anyhow::Result<()> {
    let state = default_state().await?;
    let report: MissingDatasourceReport = syncers::sync_missing_datasources(&state)
        .await
        .map_err(|e| anyhow::anyhow!(e).context("Missing datasource sync failed"))?;
    tracing::info!(
        checked = report.checked,
        removed = report.removed.len(),
        failed = report.failed.len(),
        "Missing datasource sync finished"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.failed.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} bindings could not be removed", report.failed.len())
    }
}
