//! The server side of the sync engine.
//!
//! `RemoteApi` is the REST-ish contract the gateway and the sync manager talk
//! to. `HttpRemote` speaks it over HTTP; `InMemoryRemote` implements the same
//! contract in-process for tests and demos.

mod error;
mod http;
mod memory;

pub use error::RemoteError;
pub use http::HttpRemote;
pub use memory::{Fault, InMemoryRemote};

use std::future::Future;

use serde_json::Value;

use crate::models::{EntityId, ListFilter, RemoteRecord};

pub trait RemoteApi: Send + Sync + 'static {
    /// `GET /{collection}/{id}`
    fn fetch(
        &self,
        collection: &str,
        id: &EntityId,
    ) -> impl Future<Output = Result<RemoteRecord, RemoteError>> + Send;

    /// `GET /{collection}?field=value`
    fn list(
        &self,
        collection: &str,
        filter: &ListFilter,
    ) -> impl Future<Output = Result<Vec<RemoteRecord>, RemoteError>> + Send;

    /// `POST /{collection}`. A repeated `client_id` fails with
    /// `RemoteError::AlreadyExists` carrying the record created the first time.
    fn create(
        &self,
        collection: &str,
        client_id: &str,
        data: &Value,
    ) -> impl Future<Output = Result<RemoteRecord, RemoteError>> + Send;

    /// `PATCH /{collection}/{id}` with a merge patch. With `expected_version`
    /// set, a newer server record fails with `RemoteError::Conflict`.
    fn update(
        &self,
        collection: &str,
        id: &EntityId,
        patch: &Value,
        expected_version: Option<u64>,
    ) -> impl Future<Output = Result<RemoteRecord, RemoteError>> + Send;

    /// `DELETE /{collection}/{id}`
    fn delete(
        &self,
        collection: &str,
        id: &EntityId,
        expected_version: Option<u64>,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Lightweight reachability check against the API host.
    fn ping(&self) -> impl Future<Output = Result<(), RemoteError>> + Send;
}
