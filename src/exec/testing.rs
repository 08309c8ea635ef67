//! Fixtures shared by the block unit tests.

use std::sync::{Arc, Once};

use serde_json::Value;
use tracing_subscriber::EnvFilter;

use crate::cluster::transport::LocalTransport;
use crate::exec::block::ExecContext;
use crate::primitives::fault::FaultRegistry;
use crate::query::metadata::{CollectionInfo, MetadataProvider, MetadataSnapshot};
use crate::storage::{InMemoryStorage, Storage};

pub(crate) fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("aqueduct=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_test_writer()
            .try_init();
    });
}

pub(crate) fn storage(collections: Vec<(CollectionInfo, Vec<Value>)>) -> InMemoryStorage {
    init_tracing();
    collections
        .into_iter()
        .fold(InMemoryStorage::builder(), |builder, (info, docs)| {
            builder.collection(info, docs)
        })
        .build()
        .expect("fixture storage")
}

pub(crate) fn snapshot(storage: &InMemoryStorage) -> MetadataSnapshot {
    MetadataSnapshot::from_collections(
        storage
            .collection_names()
            .iter()
            .map(|name| storage.collection(name).expect("collection info")),
    )
}

pub(crate) fn context(storage: &InMemoryStorage) -> ExecContext {
    ExecContext::new(
        storage.begin().expect("begin"),
        Arc::new(FaultRegistry::new()),
        Arc::new(snapshot(storage)),
        Arc::new(LocalTransport::new(2)),
    )
}
