use std::net::SocketAddr;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{MatchedPath, Request};
use axum::middleware::{self, Next, from_fn};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::StatusCode;
use http::header::RETRY_AFTER;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::instrument;

use crate::api::handler::*;
use crate::api::middleware::verify_identity::{IdentityKey, verify_user_ident};
use crate::api::middleware::verify_internal::verify_internal_ident;
use crate::api::middleware::{self as mw, MiddlewareErr};
use crate::constants::RETRY_AFTER_SECS;
use crate::engine::{Engine, EngineError};
use crate::util::env::Env;

pub type JsonResult<T> = core::result::Result<Json<T>, RouteError>;

#[derive(Clone, Debug)]
pub struct AppState {
    pub engine: Engine,
    pub identity: IdentityKey,
    pub internal_token: String,
}

impl AppState {
    pub fn new(engine: Engine, identity_secret: &str, internal_token: &str) -> Result<Self, MiddlewareErr> {
        if internal_token.is_empty() {
            return Err(MiddlewareErr::EmptyToken);
        }

        Ok(Self {
            engine,
            identity: IdentityKey::new(identity_secret)?,
            internal_token: internal_token.to_string(),
        })
    }
}

pub fn router(state: Arc<AppState>, cors: CorsLayer) -> Router {
    let user_routes = Router::new()
        .route("/today", get(today))
        .route("/today/engage", post(engage))
        .route("/today/draw", get(today_draw))
        .route("/today/points", get(points))
        .route("/today/points/convert", post(convert))
        .route_layer(middleware::from_fn_with_state(state.clone(), verify_user_ident));

    let internal_post_routes = Router::new()
        .route("/internal/rollover", post(trigger_rollover))
        .route("/internal/static-credit", post(static_credit))
        .route_layer(middleware::from_fn_with_state(state.clone(), verify_internal_ident));

    Router::new()
        .merge(user_routes)
        .merge(internal_post_routes)
        //
        // general
        .route("/", get(|| async { Response::new(Body::empty()) }))
        //
        // closed-day history
        .route("/draw/{day}", get(draw_by_day))
        .route("/leaderboard/{day}", get(leaderboard_by_day))
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                let method = req.method();
                let uri = req.uri();

                let matched_path = req
                    .extensions()
                    .get::<MatchedPath>()
                    .map(|matched| matched.as_str());

                tracing::debug_span!("api_request", ?method, ?uri, ?matched_path)
            }),
        )
        .layer(from_fn(log_route_errors))
        .layer(cors)
        .with_state(state)
}

/// Logs `RouteError`s that the response marked as server-side failures
#[instrument(skip(request, next), fields(uri = request.uri().to_string()))]
async fn log_route_errors(request: Request, next: Next) -> Response {
    let res = next.run(request).await;
    if let Some(err) = res.extensions().get::<Arc<RouteError>>() {
        tracing::error!(error = ?err, "error occurred inside route handler");
    }

    res
}

#[instrument(skip(env, engine))]
pub async fn start_server(env: &Env, engine: Engine) -> Result<JoinHandle<()>, RouteError> {
    tracing::info!("starting server");

    let state = Arc::new(AppState::new(engine, &env.identity_secret, &env.internal_token)?);
    let app = router(state, mw::cors(&env.cors_allow_origins));

    let socket_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), env.server_api_port);
    let listener = tokio::net::TcpListener::bind(socket_addr).await?;

    tracing::info!(
        server_url = &format!("http://127.0.0.1:{}", socket_addr.port()),
        "server ready"
    );

    Ok(tokio::task::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server exited");
        }
    }))
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Middleware(#[from] MiddlewareErr),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid day '{0}', expected YYYY-MM-DD")]
    InvalidDay(String),

    #[error("nothing recorded for {0}")]
    NotFound(String),
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            message: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            code: Option<&'static str>,
        }

        let message = self.to_string();
        let (status, code, err) = match &self {
            RouteError::Engine(e) if e.is_transient() => (
                StatusCode::SERVICE_UNAVAILABLE,
                Some("temporarily_unavailable"),
                Some(self),
            ),

            RouteError::Engine(e) => match e {
                EngineError::InsufficientDynamicPoints { .. } => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Some("insufficient_dynamic_points"),
                    None,
                ),
                EngineError::ConversionCapExceeded { .. } => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Some("conversion_cap_exceeded"),
                    None,
                ),
                EngineError::InvalidAmount { .. } => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Some("invalid_amount"),
                    None,
                ),
                EngineError::DrawNotClosable(_) => {
                    (StatusCode::CONFLICT, Some("draw_not_closable"), None)
                }
                EngineError::DrawClosed(_) => (StatusCode::CONFLICT, Some("draw_closed"), None),
                EngineError::Storage(_) | EngineError::Contention(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, None, Some(self))
                }
            },

            RouteError::InvalidDay(_) => (StatusCode::BAD_REQUEST, Some("invalid_day"), None),
            RouteError::NotFound(_) => (StatusCode::NOT_FOUND, None, None),

            RouteError::Middleware(_) | RouteError::Io(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, None, Some(self))
            }
        };

        let mut response = (status, Json(ErrorResponse { message, code })).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(RETRY_AFTER, http::HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        if let Some(err) = err {
            response.extensions_mut().insert(Arc::new(err));
        }

        response
    }
}

#[cfg(test)]
mod test {
    use axum::body::to_bytes;
    use http::header::{AUTHORIZATION, CONTENT_TYPE};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::constants::{USER_ID_HEADER, USER_SIGNATURE_HEADER};
    use crate::db::Store;
    use crate::db::memory::MemoryStore;
    use crate::engine::test::engine;

    const SECRET: &str = "identity-secret";
    const TOKEN: &str = "internal-token";

    fn app() -> (Router, Arc<AppState>, Arc<MemoryStore>) {
        let (engine, store) = engine();
        let state = Arc::new(AppState::new(engine, SECRET, TOKEN).unwrap());
        (router(state.clone(), mw::cors("*")), state, store)
    }

    fn as_user(state: &AppState, user: &str, method: &str, uri: &str, body: Option<Value>) -> Request {
        let builder = http::Request::builder()
            .method(method)
            .uri(uri)
            .header(USER_ID_HEADER, user)
            .header(USER_SIGNATURE_HEADER, state.identity.sign(user));

        match body {
            Some(body) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn read(res: Response) -> (StatusCode, Value) {
        let status = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };

        (status, json)
    }

    #[tokio::test]
    async fn test_identity_is_required() {
        let (app, _, _) = app();

        let res = app
            .clone()
            .oneshot(http::Request::builder().uri("/today").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let forged = http::Request::builder()
            .uri("/today")
            .header(USER_ID_HEADER, "mallory")
            .header(USER_SIGNATURE_HEADER, "00".repeat(32))
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.oneshot(forged).await.unwrap().status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_today_and_engage() {
        let (app, state, _) = app();

        let (status, today) = read(
            app.clone()
                .oneshot(as_user(&state, "u1", "GET", "/today", None))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(today["engaged"], false);
        assert_eq!(today["draw_status"], "pending");

        let (status, engaged) = read(
            app.clone()
                .oneshot(as_user(
                    &state,
                    "u1",
                    "POST",
                    "/today/engage",
                    Some(json!({ "event_type": "quiz" })),
                ))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(engaged["engaged"], true);
        assert_eq!(engaged["dynamic_points_today"], 30);
        assert_eq!(engaged["activity"]["applied"], 30);

        let (status, points) = read(
            app.oneshot(as_user(&state, "u1", "GET", "/today/points", None))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(points["dynamic_balance"], 30);
        assert_eq!(points["dynamic_cap"], 100);
    }

    #[tokio::test]
    async fn test_convert_rejections_are_typed() {
        let (app, state, _) = app();

        let (status, body) = read(
            app.oneshot(as_user(
                &state,
                "u1",
                "POST",
                "/today/points/convert",
                Some(json!({ "amount": 10 })),
            ))
            .await
            .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "insufficient_dynamic_points");
    }

    #[tokio::test]
    async fn test_store_outage_is_retryable() {
        let (app, state, store) = app();
        store.set_available(false);

        let res = app
            .oneshot(as_user(&state, "u1", "GET", "/today", None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(res.headers()[RETRY_AFTER], RETRY_AFTER_SECS);
        assert!(res.extensions().get::<Arc<RouteError>>().is_some());
    }

    #[tokio::test]
    async fn test_internal_routes() {
        let (app, _, store) = app();

        let unauthorized = http::Request::builder()
            .method("POST")
            .uri("/internal/rollover")
            .header(AUTHORIZATION, "Bearer nope")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            app.clone().oneshot(unauthorized).await.unwrap().status(),
            StatusCode::UNAUTHORIZED
        );

        let credit = http::Request::builder()
            .method("POST")
            .uri("/internal/static-credit")
            .header(AUTHORIZATION, format!("Bearer {TOKEN}"))
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({ "user_id": "u9", "amount": 25, "source": "signup_bonus" }).to_string(),
            ))
            .unwrap();
        let (status, account) = read(app.clone().oneshot(credit).await.unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(account["static_points"], 25);

        let rollover = http::Request::builder()
            .method("POST")
            .uri("/internal/rollover")
            .header(AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .unwrap();
        let (status, report) = read(app.oneshot(rollover).await.unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["closed"].as_array().map(Vec::len), Some(1));
        assert!(store.latest_closed_day().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_history_routes() {
        let (app, _, _) = app();

        let res = app
            .clone()
            .oneshot(http::Request::builder().uri("/draw/yesterday").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = app
            .oneshot(http::Request::builder().uri("/leaderboard/2020-01-01").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
