//! The single HTTP entry point. Translates the axum request into a
//! `RequestDescriptor` and hands it to `ProxyService`.

use crate::{errors::ProxyError, models::request::RequestDescriptor, services::proxy::ProxyService};
use axum::{
    extract::State,
    http::{HeaderMap, Method, Uri},
    response::Response,
};
use tracing::Instrument;
use uuid::Uuid;

/// Any method, any path.
pub async fn proxy_request(
    State(service): State<ProxyService>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("request", %request_id, %method, path = %uri.path());

    async move {
        let request = RequestDescriptor::from_parts(method, &uri, headers)?;
        let response = service.handle(request).await?;
        tracing::debug!(status = %response.status(), "request complete");
        Ok::<_, ProxyError>(response)
    }
    .instrument(span)
    .await
}
