//! Provisioning status codec.
//!
//! The per-endpoint provisioning state lives in a JSON annotation on the
//! endpoint itself, so it survives controller restarts and travels with
//! the object.

use std::sync::Arc;

use crate::api::{self, Status};
use crate::store::{Endpoint, ObjectStore};

use super::EndpointError;

/// Read the provisioning status off the endpoint's annotation. An absent
/// annotation is the zero status; a malformed one is a user error.
pub fn get_status(endpoint: &Endpoint) -> Result<Status, EndpointError> {
    let Some(raw) = endpoint.meta.annotations.get(api::STATUS_ANNOTATION) else {
        return Ok(Status::default());
    };
    serde_json::from_str(raw).map_err(|e| EndpointError::Config {
        key: endpoint.meta.key(),
        reason: format!("can't decode status annotation: {e}"),
    })
}

/// Stamp the observed generation and write the status into the
/// endpoint's annotation.
pub fn set_status(endpoint: &mut Endpoint, status: &mut Status) -> Result<(), EndpointError> {
    status.observed_generation = endpoint.meta.generation;

    let encoded = serde_json::to_string(status).map_err(|e| EndpointError::Config {
        key: endpoint.meta.key(),
        reason: format!("can't encode status annotation: {e}"),
    })?;
    endpoint.meta.set_annotation(api::STATUS_ANNOTATION, &encoded);
    Ok(())
}

/// Write the status back through the store, but only when the object
/// actually changed.
pub async fn update_status(
    store: &Arc<dyn ObjectStore>,
    endpoint: &Endpoint,
    status: &mut Status,
) -> Result<(), EndpointError> {
    let mut updated = endpoint.clone();
    set_status(&mut updated, status)?;

    if updated == *endpoint {
        return Ok(());
    }

    store.update_endpoint(updated).await?;
    Ok(())
}
