//! Backend selection.
//!
//! The active backend is read from settings once and resolved through a
//! static table. Unknown names fail when the factory is built, not when the
//! first resource is opened.

use crate::config::Settings;
use crate::error::{StorageError, StorageResult};
use crate::local::{parse_codec, LocalOptions, LocalResource};
use crate::lock::{FileLockCoordinator, LockCoordinator};
use crate::resource::{Resource, ResourceSpec};
use crate::warehouse::{BigQueryRestClient, BigQueryTable, WarehouseClient};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// Registered storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    BigQuery,
}

static BACKENDS: &[(&str, BackendKind)] = &[
    ("local", BackendKind::Local),
    ("bigquery", BackendKind::BigQuery),
];

impl BackendKind {
    /// Resolve a `storage.use_storage` value.
    pub fn lookup(name: &str) -> StorageResult<Self> {
        let wanted = name.trim().to_ascii_lowercase();
        BACKENDS
            .iter()
            .find(|(registered, _)| *registered == wanted)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| {
                let known: Vec<&str> = BACKENDS.iter().map(|(n, _)| *n).collect();
                StorageError::config(format!(
                    "Unknown storage backend: '{}'. Expected one of: {}",
                    name,
                    known.join(", ")
                ))
            })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::BigQuery => "bigquery",
        }
    }
}

/// Builds resources for the configured backend.
pub struct ResourceFactory {
    backend: BackendKind,
    local: LocalOptions,
    settings: Settings,
    client: OnceLock<Arc<dyn WarehouseClient>>,
}

impl std::fmt::Debug for ResourceFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceFactory")
            .field("backend", &self.backend)
            .field("local", &self.local)
            .field("client_ready", &self.client.get().is_some())
            .finish()
    }
}

impl ResourceFactory {
    /// Validate the backend selection and local options up front.
    pub fn from_settings(settings: &Settings) -> StorageResult<Self> {
        let backend = BackendKind::lookup(&settings.storage.use_storage)?;
        let local_settings = &settings.storage.local;

        let mut local = LocalOptions::new(settings.local_base_dir())
            .with_format(local_settings.format.parse()?)
            .with_codec(parse_codec(&local_settings.codec)?);
        if local_settings.locking {
            let coordinator: Arc<dyn LockCoordinator> = Arc::new(FileLockCoordinator::new());
            local = local.with_coordinator(coordinator);
        } else {
            local = local.without_locking();
        }

        info!("Storage backend: {}", backend.as_str());
        Ok(Self {
            backend,
            local,
            settings: settings.clone(),
            client: OnceLock::new(),
        })
    }

    /// Use `client` for every table instead of building one from settings.
    ///
    /// The first client wins; later calls are ignored.
    pub fn with_client(self, client: Arc<dyn WarehouseClient>) -> Self {
        if self.client.set(client).is_err() {
            debug!("Warehouse client already set, keeping the existing one");
        }
        self
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn local_options(&self) -> &LocalOptions {
        &self.local
    }

    /// Open a resource on the configured backend.
    pub fn open(&self, spec: ResourceSpec) -> StorageResult<Box<dyn Resource>> {
        match self.backend {
            BackendKind::Local => Ok(Box::new(LocalResource::new(spec, &self.local)?)),
            BackendKind::BigQuery => Ok(Box::new(self.open_table(spec)?)),
        }
    }

    /// Open a warehouse table regardless of the configured backend.
    pub fn open_table(&self, spec: ResourceSpec) -> StorageResult<BigQueryTable> {
        let default_project = self.settings.storage.bigquery.project_id.as_deref();
        BigQueryTable::new(spec, default_project, self.client()?)
    }

    /// Shared warehouse client, built on first use.
    fn client(&self) -> StorageResult<Arc<dyn WarehouseClient>> {
        if let Some(client) = self.client.get() {
            return Ok(Arc::clone(client));
        }
        let built: Arc<dyn WarehouseClient> =
            Arc::new(BigQueryRestClient::from_settings(&self.settings)?);
        Ok(Arc::clone(self.client.get_or_init(|| built)))
    }
}

static FACTORY: OnceLock<ResourceFactory> = OnceLock::new();

/// Process-wide factory from `Settings::load()`, built on first call.
pub fn resource_factory() -> StorageResult<&'static ResourceFactory> {
    if let Some(factory) = FACTORY.get() {
        return Ok(factory);
    }
    let factory = ResourceFactory::from_settings(&Settings::load()?)?;
    Ok(FACTORY.get_or_init(|| factory))
}
