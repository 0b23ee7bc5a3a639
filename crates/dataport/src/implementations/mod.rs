#[cfg(feature = "sqlx-postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlx-postgres")))]
pub mod postgres;

#[cfg(feature = "gcp")]
#[cfg_attr(docsrs, doc(cfg(feature = "gcp")))]
pub mod gcp;

#[cfg(feature = "bi-client")]
#[cfg_attr(docsrs, doc(cfg(feature = "bi-client")))]
pub mod bi_tool;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

#[cfg(all(feature = "sqlx-postgres", feature = "gcp", feature = "bi-client"))]
pub use default_gateways::get_default_gateways_from_config;

#[cfg(all(feature = "sqlx-postgres", feature = "gcp", feature = "bi-client"))]
mod default_gateways {
    use std::sync::Arc;

    use super::{
        bi_tool::BiToolClient,
        gcp::{GcpClient, GcpIdentity, GcpWarehouse},
        postgres::{PostgresCatalog, ReadWrite},
    };
    use crate::{CONFIG, service::Gateways};

    /// Build the production collaborators from [`CONFIG`].
    ///
    /// The catalog and the access-request tables are read through the same pools as
    /// the binding store.
    pub async fn get_default_gateways_from_config(
        read_write: ReadWrite,
    ) -> anyhow::Result<Gateways> {
        let gcp = GcpClient::from_default_credentials().await?;
        let bi = BiToolClient::from_config(&CONFIG.bi)?;
        let catalog = PostgresCatalog::new(read_write);

        Ok(Gateways {
            warehouse: Arc::new(GcpWarehouse::new(gcp.clone())),
            identity: Arc::new(GcpIdentity::new(gcp)),
            bi: Arc::new(bi),
            catalog: Arc::new(catalog.clone()),
            grants: Arc::new(catalog),
        })
    }
}
