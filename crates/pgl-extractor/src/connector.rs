//! Turning a tenant's configuration into live endpoints

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{DestinationConfig, TenantConfig};
use crate::error::{ExtractError, Result};
use crate::source::{SourceDatabase, SqlServerSource};
use crate::upload::{AzureBlobBackend, ObjectBackend, S3Backend};

/// Opens the source and destination of a tenant
///
/// The orchestrator only sees the trait objects, so it never branches on
/// backend kind.
#[async_trait]
pub trait TenantConnector: Send + Sync {
    async fn source(&self, tenant: &TenantConfig, pool_size: u32) -> Result<Arc<dyn SourceDatabase>>;

    /// One backend per configured destination, in configuration order
    async fn backends(&self, tenant: &TenantConfig) -> Result<Vec<Arc<dyn ObjectBackend>>>;
}

/// SQL Server through tiberius, S3 and/or Azure Blob per tenant config
#[derive(Debug, Default, Clone, Copy)]
pub struct LiveConnector;

#[async_trait]
impl TenantConnector for LiveConnector {
    async fn source(&self, tenant: &TenantConfig, pool_size: u32) -> Result<Arc<dyn SourceDatabase>> {
        let source = SqlServerSource::connect(&tenant.source, pool_size).await?;
        Ok(Arc::new(source))
    }

    async fn backends(&self, tenant: &TenantConfig) -> Result<Vec<Arc<dyn ObjectBackend>>> {
        let mut backends: Vec<Arc<dyn ObjectBackend>> = Vec::with_capacity(tenant.destination.len());
        for destination in tenant.destination.iter() {
            let backend: Arc<dyn ObjectBackend> = match destination {
                DestinationConfig::S3(s3) => Arc::new(S3Backend::new(s3).await?),
                DestinationConfig::AzureBlob(azure) => Arc::new(AzureBlobBackend::new(azure)?),
            };
            backends.push(backend);
        }
        Ok(backends)
    }
}

type Endpoints = (Arc<dyn SourceDatabase>, Vec<Arc<dyn ObjectBackend>>);

/// Pre-built endpoints keyed by tenant name
#[derive(Default, Clone)]
pub struct StaticConnector {
    endpoints: HashMap<String, Endpoints>,
}

impl StaticConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(
        mut self,
        tenant: impl Into<String>,
        source: Arc<dyn SourceDatabase>,
        backend: Arc<dyn ObjectBackend>,
    ) -> Self {
        self.endpoints.insert(tenant.into(), (source, vec![backend]));
        self
    }

    /// Add another destination to an already registered tenant
    pub fn with_destination(mut self, tenant: &str, backend: Arc<dyn ObjectBackend>) -> Self {
        if let Some((_, backends)) = self.endpoints.get_mut(tenant) {
            backends.push(backend);
        }
        self
    }

    fn lookup(&self, tenant: &TenantConfig) -> Result<&Endpoints> {
        self.endpoints
            .get(&tenant.name)
            .ok_or_else(|| ExtractError::Config(format!("no endpoints registered for tenant '{}'", tenant.name)))
    }
}

#[async_trait]
impl TenantConnector for StaticConnector {
    async fn source(&self, tenant: &TenantConfig, _pool_size: u32) -> Result<Arc<dyn SourceDatabase>> {
        self.lookup(tenant).map(|(source, _)| Arc::clone(source))
    }

    async fn backends(&self, tenant: &TenantConfig) -> Result<Vec<Arc<dyn ObjectBackend>>> {
        self.lookup(tenant).map(|(_, backends)| backends.clone())
    }
}
