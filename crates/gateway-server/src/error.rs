//! Canonical error → HTTP response mapping.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use gateway_core::GatewayError;

/// Wraps a canonical error for use as an axum rejection.
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
        GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        GatewayError::ModelNotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::ContentFilter(_) => StatusCode::UNPROCESSABLE_ENTITY,
        GatewayError::Timeout(_) | GatewayError::Unavailable(_) | GatewayError::Network(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        GatewayError::NoProviderAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::Canceled | GatewayError::Configuration(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = Json(json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        }));

        let mut response = (status, body).into_response();
        match &self.0 {
            GatewayError::RateLimited {
                retry_after: Some(retry),
                ..
            } => {
                if let Ok(value) = retry.as_secs().to_string().parse() {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
            }
            GatewayError::NoProviderAvailable { .. } => {
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, header::HeaderValue::from_static("30"));
            }
            _ => {}
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_expected_statuses() {
        assert_eq!(
            status_for(&GatewayError::Auth("x".into())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(&GatewayError::InvalidRequest("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&GatewayError::ContentFilter("x".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&GatewayError::Unavailable("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&GatewayError::NoProviderAvailable { last_tried: None }),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn exhaustion_carries_retry_after() {
        let response =
            ApiError(GatewayError::NoProviderAvailable { last_tried: None }).into_response();
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "30");
    }
}
