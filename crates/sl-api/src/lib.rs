//! # sl-api
//!
//! HTTP surface of Staffline: event ingestion from the gateway bridge and
//! the operator routes.

pub mod error;
pub mod handlers;
pub mod middleware;

use actix_web::web;

pub use error::ApiError;
pub use handlers::AppState;

/// Configures the routes for the relay.
///
/// # Developer Note
/// We use a scoped configuration to allow the main binary to mount
/// the API under different paths if needed (e.g., /api/v1/).
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .route("/health", web::get().to(handlers::health))
            // Gateway bridge
            .route("/events", web::post().to(handlers::ingest_event))
            // Operators
            .route("/threads/{recipient}/close", web::post().to(handlers::close_thread))
            .route("/threads/{recipient}/close", web::delete().to(handlers::cancel_close))
            .route("/blocks", web::get().to(handlers::list_blocks))
            .route("/blocks/{subject}", web::post().to(handlers::block))
            .route("/blocks/{subject}", web::delete().to(handlers::unblock))
            .route("/whitelist/{subject}", web::post().to(handlers::whitelist))
            .route("/whitelist/{subject}", web::delete().to(handlers::unwhitelist))
            .route("/closures", web::get().to(handlers::pending_closures))
            .route("/logs/search", web::get().to(handlers::search_logs)),
    );
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use secrecy::SecretString;
    use serde_json::{json, Value};
    use sl_core::models::UserId;
    use sl_core::traits::{MockChatTransport, MockOperatorAuth};
    use sl_core::Relay;
    use sl_db_sqlite::SqliteStore;

    use super::*;

    const KEY: &str = "letmein";

    async fn relay(started: bool) -> Arc<Relay> {
        let store = Arc::new(SqliteStore::new("sqlite::memory:").await.unwrap());
        let mut transport = MockChatTransport::new();
        transport.expect_bot_id().return_const(UserId(1));
        let relay = Relay::new(Arc::new(transport), store.clone(), store);
        if started {
            relay.start().await.unwrap();
        }
        relay
    }

    fn state(relay: Arc<Relay>, hash: Option<&str>) -> web::Data<AppState> {
        let mut auth = MockOperatorAuth::new();
        auth.expect_verify_operator_key()
            .returning(|key, hash| key == KEY && hash == "stored-hash");
        web::Data::new(AppState {
            relay,
            auth: Box::new(auth),
            operator_key_hash: hash.map(SecretString::from),
        })
    }

    macro_rules! app {
        ($state:expr) => {
            test::init_service(App::new().app_data($state).configure(configure_routes)).await
        };
    }

    #[actix_web::test]
    async fn test_events_are_refused_until_started() {
        let relay = relay(false).await;
        let app = app!(state(relay.clone(), Some("stored-hash")));
        let event = json!({ "type": "member_joined", "user_id": 42 });

        let req = test::TestRequest::post().uri("/events").set_json(&event).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(resp.headers().contains_key("retry-after"));

        relay.start().await.unwrap();
        let req = test::TestRequest::post().uri("/events").set_json(&event).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::ACCEPTED);

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["ready"], true);
    }

    #[actix_web::test]
    async fn test_malformed_event_is_a_bad_request() {
        let app = app!(state(relay(true).await, Some("stored-hash")));
        let req = test::TestRequest::post()
            .uri("/events")
            .set_json(json!({ "type": "no_such_event" }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_operator_routes_require_a_valid_key() {
        let app = app!(state(relay(true).await, Some("stored-hash")));

        let req = test::TestRequest::get().uri("/closures").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);

        let req = test::TestRequest::get()
            .uri("/closures")
            .insert_header(("X-Operator-Key", "guess"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);

        let req = test::TestRequest::get()
            .uri("/closures")
            .insert_header(("X-Operator-Key", KEY))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, json!([]));
    }

    #[actix_web::test]
    async fn test_operator_routes_are_closed_without_a_configured_hash() {
        let app = app!(state(relay(true).await, None));
        let req = test::TestRequest::get()
            .uri("/blocks")
            .insert_header(("X-Operator-Key", KEY))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn test_block_lifecycle() {
        let app = app!(state(relay(true).await, Some("stored-hash")));

        let req = test::TestRequest::post()
            .uri("/blocks/42")
            .insert_header(("X-Operator-Key", KEY))
            .set_json(json!({ "reason": "  " }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/blocks/42")
            .insert_header(("X-Operator-Key", KEY))
            .set_json(json!({ "reason": "spam" }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CREATED);

        let req = test::TestRequest::get()
            .uri("/blocks")
            .insert_header(("X-Operator-Key", KEY))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body[0]["subject_id"], 42);

        let req = test::TestRequest::delete()
            .uri("/blocks/42")
            .insert_header(("X-Operator-Key", KEY))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["removed"], true);
    }

    #[actix_web::test]
    async fn test_close_of_unknown_thread_is_not_found() {
        let app = app!(state(relay(true).await, Some("stored-hash")));
        let operator = json!({ "id": 7, "name": "moderator" });

        let req = test::TestRequest::post()
            .uri("/threads/99/close")
            .insert_header(("X-Operator-Key", KEY))
            .set_json(json!({ "operator": operator, "after": "soon" }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/threads/99/close")
            .insert_header(("X-Operator-Key", KEY))
            .set_json(json!({ "operator": operator, "after": "PT1H" }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::delete()
            .uri("/threads/99/close")
            .insert_header(("X-Operator-Key", KEY))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["cancelled"], false);
    }

    #[actix_web::test]
    async fn test_log_search_validates_the_query() {
        let app = app!(state(relay(true).await, Some("stored-hash")));

        let req = test::TestRequest::get()
            .uri("/logs/search?q=%20")
            .insert_header(("X-Operator-Key", KEY))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get()
            .uri("/logs/search?q=refund&limit=5")
            .insert_header(("X-Operator-Key", KEY))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, json!([]));
    }
}
