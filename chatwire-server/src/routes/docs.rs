use std::sync::Arc;

use axum::{
    Router,
    http::{HeaderValue, header},
    response::IntoResponse,
    routing::get,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    app_state::AppState,
    http::error::{ApiError, AppResult},
    openapi::ApiDoc,
};

const JSON_PATH: &str = "/openapi/chatwire.json";
const YAML_PATH: &str = "/openapi/chatwire.yaml";

async fn document_yaml() -> AppResult<impl IntoResponse> {
    let yaml = ApiDoc::openapi()
        .to_yaml()
        .map_err(|err| ApiError::internal_server_error(format!("failed to render document: {err}")))?;
    Ok((
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/yaml"))],
        yaml,
    ))
}

/// Swagger UI plus the raw document in both formats.
pub fn create_docs_router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url(JSON_PATH, ApiDoc::openapi()))
        .route(YAML_PATH, get(document_yaml))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::create_app_state;
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use shared::config::server::{Config, Profile};
    use tower::ServiceExt;

    async fn fetch(uri: &str) -> (StatusCode, String) {
        let config = Config::default_for_profile(Profile::Test);
        let app = create_docs_router().with_state(create_app_state(&config, None).unwrap());
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn serves_both_document_formats() {
        let (status, yaml) = fetch(YAML_PATH).await;
        assert_eq!(status, StatusCode::OK);
        assert!(yaml.contains("title: Chatwire API"));

        let (status, json) = fetch(JSON_PATH).await;
        assert_eq!(status, StatusCode::OK);
        let doc: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(doc["paths"]["/api/chats"].is_object());
    }
}
