use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{FromRequest, Path, Query, Request, State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{delete, get, post, put},
};
use futures::stream::{self, Stream};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use larder_core::db::Database;
use larder_core::error::{LarderError, classify};
use larder_core::models::{
    AddOutcome, Category, Ingredient, NewIngredient, NewRecipe, Recipe, RecipeDetail,
    ShoppingListItem, UpdateShoppingListItem,
};
use larder_core::shopping::{ChangeNotifier, ListEvent, generate_from_selection};

const BODY_LIMIT: usize = 1024 * 1024; // 1 MiB

/// Buffered events per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 64;

/// Fans list change events out to every connected event stream.
#[derive(Clone)]
struct EventBus {
    sender: broadcast::Sender<ListEvent>,
}

impl EventBus {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    fn subscribe(&self) -> broadcast::Receiver<ListEvent> {
        self.sender.subscribe()
    }
}

impl ChangeNotifier for EventBus {
    fn publish(&self, event: ListEvent) {
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }
}

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Database>>,
    api_key: Option<String>,
    events: EventBus,
    shutdown: Arc<watch::Sender<bool>>,
}

impl AppState {
    fn new(db: Database, api_key: Option<String>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            db: Arc::new(Mutex::new(db)),
            api_key,
            events: EventBus::new(),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Never hold the guard across an `.await`.
    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_list_changed(&self) {
        self.events.publish(ListEvent::ShoppingListUpdated);
    }
}

// --- Request / Response types ---

#[derive(Deserialize)]
struct CreateCategoryRequest {
    name: String,
}

#[derive(Deserialize)]
struct ReorderCategoriesRequest {
    #[serde(alias = "orderedIds")]
    ordered_ids: Vec<i64>,
}

#[derive(Deserialize)]
struct GenerateRequest {
    #[serde(rename = "recipeIds", alias = "recipe_ids")]
    recipe_ids: Vec<i64>,
}

#[derive(Serialize)]
struct GenerateResponse {
    message: &'static str,
    recipes: usize,
    ingredients: usize,
}

#[derive(Deserialize)]
struct AddItemRequest {
    ingredient_id: i64,
    amount: Decimal,
    unit: Option<String>,
}

#[derive(Deserialize)]
struct UpdateItemRequest {
    amount: Option<Decimal>,
    is_checked: Option<bool>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    /// Extractor rejection that keeps its own status (e.g. 413).
    Rejected(StatusCode, String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Rejected(status, msg) => (status, msg),
            Self::Internal(err) => {
                error!("internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match classify(&err) {
            Some(LarderError::Validation(msg)) => Self::BadRequest(msg.clone()),
            Some(LarderError::NotFound(msg)) => Self::NotFound(msg.clone()),
            Some(LarderError::Conflict(msg)) => Self::Conflict(msg.clone()),
            None => Self::Internal(err),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        if matches!(rejection, JsonRejection::BytesRejection(_)) {
            Self::Rejected(rejection.status(), rejection.body_text())
        } else {
            Self::BadRequest(rejection.body_text())
        }
    }
}

/// `Json` extractor whose rejections use the API error body.
struct ApiJson<T>(T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

// --- Middleware ---

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: "Invalid or missing API key".to_string(),
        }),
    )
        .into_response()
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        if !bearer_token(&request).is_some_and(|token| token == expected_key) {
            return unauthorized();
        }
    }
    next.run(request).await
}

#[derive(Deserialize)]
struct EventsQuery {
    api_key: Option<String>,
}

/// Browser `EventSource` cannot send headers, so the event stream also
/// takes the key as `?api_key=`.
async fn require_events_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let from_query = Query::<EventsQuery>::try_from_uri(request.uri())
            .ok()
            .and_then(|Query(q)| q.api_key);
        let authorized = bearer_token(&request)
            .or(from_query.as_deref())
            .is_some_and(|token| token == expected_key);
        if !authorized {
            return unauthorized();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Handlers ---

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn list_categories(State(state): State<AppState>) -> Result<Json<Vec<Category>>, ApiError> {
    let categories = state.db().list_categories()?;
    Ok(Json(categories))
}

async fn create_category(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<CreateCategoryRequest>,
) -> Result<(StatusCode, Json<Category>), ApiError> {
    let category = state.db().create_category(&req.name)?;
    Ok((StatusCode::CREATED, Json(category)))
}

async fn reorder_categories(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ReorderCategoriesRequest>,
) -> Result<Json<Vec<Category>>, ApiError> {
    let categories = {
        let db = state.db();
        db.reorder_categories(&req.ordered_ids)?;
        db.list_categories()?
    };
    Ok(Json(categories))
}

async fn delete_category(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.db().delete_category(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_ingredients(
    State(state): State<AppState>,
) -> Result<Json<Vec<Ingredient>>, ApiError> {
    let ingredients = state.db().list_ingredients()?;
    Ok(Json(ingredients))
}

async fn get_ingredient(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Ingredient>, ApiError> {
    let ingredient = state.db().get_ingredient(id)?;
    Ok(Json(ingredient))
}

async fn create_ingredient(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<NewIngredient>,
) -> Result<(StatusCode, Json<Ingredient>), ApiError> {
    let ingredient = state.db().create_ingredient(&req)?;
    Ok((StatusCode::CREATED, Json(ingredient)))
}

async fn update_ingredient(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ApiJson(req): ApiJson<NewIngredient>,
) -> Result<Json<Ingredient>, ApiError> {
    let ingredient = state.db().update_ingredient(id, &req)?;
    // List rows show the ingredient's name and default unit
    state.notify_list_changed();
    Ok(Json(ingredient))
}

async fn delete_ingredient(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.db().delete_ingredient(id)?;
    state.notify_list_changed();
    Ok(StatusCode::NO_CONTENT)
}

async fn list_recipes(State(state): State<AppState>) -> Result<Json<Vec<Recipe>>, ApiError> {
    let recipes = state.db().list_recipes()?;
    Ok(Json(recipes))
}

async fn get_recipe(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<RecipeDetail>, ApiError> {
    let detail = state.db().get_recipe_detail(id)?;
    Ok(Json(detail))
}

async fn create_recipe(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<NewRecipe>,
) -> Result<(StatusCode, Json<RecipeDetail>), ApiError> {
    let detail = state.db().create_recipe(&req)?;
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn update_recipe(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ApiJson(req): ApiJson<NewRecipe>,
) -> Result<Json<RecipeDetail>, ApiError> {
    let detail = state.db().update_recipe(id, &req)?;
    Ok(Json(detail))
}

async fn delete_recipe(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if state.db().delete_recipe(id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Recipe {id} not found")))
    }
}

async fn get_shopping_list(
    State(state): State<AppState>,
) -> Result<Json<Vec<ShoppingListItem>>, ApiError> {
    let items = state.db().list_shopping_list()?;
    Ok(Json(items))
}

async fn add_shopping_list_item(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<AddItemRequest>,
) -> Result<(StatusCode, Json<ShoppingListItem>), ApiError> {
    let added = state
        .db()
        .add_shopping_list_item(req.ingredient_id, req.amount, req.unit.as_deref())?;
    state.notify_list_changed();

    let status = match added.outcome {
        AddOutcome::Created => StatusCode::CREATED,
        AddOutcome::Merged => StatusCode::OK,
    };
    Ok((status, Json(added.item)))
}

async fn generate_shopping_list(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<GenerateRequest>,
) -> Result<(StatusCode, Json<GenerateResponse>), ApiError> {
    let summary = {
        let db = state.db();
        generate_from_selection(&db, &state.events, &req.recipe_ids)?
    };
    Ok((
        StatusCode::CREATED,
        Json(GenerateResponse {
            message: "Shopping list generated",
            recipes: summary.recipes,
            ingredients: summary.ingredients,
        }),
    ))
}

async fn update_shopping_list_item(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ApiJson(req): ApiJson<UpdateItemRequest>,
) -> Result<Json<ShoppingListItem>, ApiError> {
    let update = UpdateShoppingListItem {
        amount: req.amount,
        is_checked: req.is_checked,
    };
    let item = state.db().update_shopping_list_item(id, &update)?;
    state.notify_list_changed();
    Ok(Json(item))
}

async fn delete_shopping_list_item(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if !state.db().delete_shopping_list_item(id)? {
        return Err(ApiError::NotFound(format!(
            "Shopping list item {id} not found"
        )));
    }
    state.notify_list_changed();
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_checked_items(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    let removed = state.db().clear_checked_items()?;
    debug!(removed, "cleared checked shopping list items");
    state.notify_list_changed();
    Ok(StatusCode::NO_CONTENT)
}

/// Server-sent event stream of list changes. Each event only tells the
/// client to refetch, so lagging subscribers skip what they missed.
async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.events.subscribe();
    let shutdown = state.shutdown.subscribe();

    let stream = stream::unfold(
        (receiver, shutdown),
        |(mut receiver, mut shutdown)| async move {
            loop {
                tokio::select! {
                    received = receiver.recv() => match received {
                        Ok(event) => {
                            let frame = Event::default().event(event.name()).data("{}");
                            return Some((Ok(frame), (receiver, shutdown)));
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "event subscriber lagged");
                        }
                        Err(RecvError::Closed) => return None,
                    },
                    _ = shutdown.changed() => return None,
                }
            }
        },
    );

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/categories",
            get(list_categories).post(create_category),
        )
        .route("/api/categories/order", put(reorder_categories))
        .route("/api/categories/{id}", delete(delete_category))
        .route(
            "/api/ingredients",
            get(list_ingredients).post(create_ingredient),
        )
        .route(
            "/api/ingredients/{id}",
            get(get_ingredient)
                .put(update_ingredient)
                .delete(delete_ingredient),
        )
        .route("/api/recipes", get(list_recipes).post(create_recipe))
        .route(
            "/api/recipes/{id}",
            get(get_recipe).put(update_recipe).delete(delete_recipe),
        )
        .route(
            "/api/shopping-list",
            get(get_shopping_list).post(add_shopping_list_item),
        )
        .route(
            "/api/shopping-list/from-recipes",
            post(generate_shopping_list),
        )
        .route("/api/shopping-list/checked", delete(clear_checked_items))
        .route(
            "/api/shopping-list/{id}",
            put(update_shopping_list_item).delete(delete_shopping_list_item),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .merge(
            Router::new()
                .route("/api/events", get(events))
                .route_layer(middleware::from_fn_with_state(
                    state.clone(),
                    require_events_auth,
                )),
        )
        // Added after the auth layer, so it stays public
        .route("/api/health", get(health))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

/// Show only the ends of a key in logs: `abcd...wxyz`.
fn mask_key(key: &str) -> String {
    match (key.get(..4), key.get(key.len().saturating_sub(4)..)) {
        (Some(head), Some(tail)) if key.len() >= 12 => format!("{head}...{tail}"),
        _ => "****".to_string(),
    }
}

// --- Server startup ---

pub async fn start_server(
    db: Database,
    port: u16,
    bind: &str,
    api_key: Option<String>,
) -> anyhow::Result<()> {
    let state = AppState::new(db, api_key.clone());
    let shutdown = Arc::clone(&state.shutdown);
    let app = build_router(state);

    if let Some(ref key) = api_key {
        info!(
            "API key: {} (see api_key file in data directory)",
            mask_key(key)
        );
    } else {
        warn!("Authentication disabled (--no-auth). API is open to anyone.");
    }

    if bind != "127.0.0.1" && bind != "localhost" && api_key.is_none() {
        warn!(
            "Listening on {bind} with no authentication. Any device on your network can access this API."
        );
    }

    let addr = format!("{bind}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    info!("Listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Ends open event streams so the server can drain
            shutdown.send_replace(true);
        })
        .await
        .context("server error")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "unable to install Ctrl+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "unable to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use larder_core::models::NewRecipeLine;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    struct Seeded {
        flour: i64,
        eggs: i64,
        bread: i64,
        omelette: i64,
    }

    fn test_state(api_key: Option<String>) -> AppState {
        AppState::new(Database::open_in_memory().unwrap(), api_key)
    }

    fn test_app(api_key: Option<String>) -> Router {
        build_router(test_state(api_key))
    }

    fn seed(state: &AppState) -> Seeded {
        let db = state.db();
        let ingredient = |name: &str, unit: Option<&str>| {
            db.create_ingredient(&NewIngredient {
                name: name.to_string(),
                unit: unit.map(String::from),
                category_id: None,
            })
            .unwrap()
            .id
        };
        let flour = ingredient("Flour", Some("g"));
        let eggs = ingredient("Eggs", None);

        let recipe = |name: &str, lines: Vec<(i64, i64)>| {
            db.create_recipe(&NewRecipe {
                name: name.to_string(),
                instructions: None,
                image_url: None,
                ingredients: lines
                    .into_iter()
                    .map(|(ingredient_id, amount)| NewRecipeLine {
                        ingredient_id,
                        amount: Decimal::from(amount),
                    })
                    .collect(),
            })
            .unwrap()
            .id
        };
        let bread = recipe("Bread", vec![(flour, 100)]);
        let omelette = recipe("Omelette", vec![(flour, 50), (eggs, 2)]);

        Seeded {
            flour,
            eggs,
            bread,
            omelette,
        }
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = axum::http::Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn item_for<'a>(list: &'a Value, ingredient_id: i64) -> &'a Value {
        list.as_array()
            .unwrap()
            .iter()
            .find(|item| item["ingredient_id"] == ingredient_id)
            .unwrap()
    }

    // --- Auth and middleware ---

    #[tokio::test]
    async fn auth_missing_key_returns_401() {
        let app = test_app(Some("test-key-abc123".to_string()));

        let (status, json) = send(&app, "GET", "/api/recipes", None).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"], "Invalid or missing API key");
    }

    #[tokio::test]
    async fn auth_wrong_key_returns_401() {
        let app = test_app(Some("test-key-abc123".to_string()));

        let response = app
            .oneshot(
                axum::http::Request::get("/api/recipes")
                    .header("Authorization", "Bearer wrong-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn auth_correct_key_succeeds() {
        let app = test_app(Some("test-key-abc123".to_string()));

        let response = app
            .oneshot(
                axum::http::Request::get("/api/recipes")
                    .header("Authorization", "Bearer test-key-abc123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_is_public() {
        let app = test_app(Some("secret".to_string()));

        let (status, json) = send(&app, "GET", "/api/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn security_headers_present() {
        let app = test_app(None);

        let response = app
            .oneshot(
                axum::http::Request::get("/api/shopping-list")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
        assert_eq!(
            response.headers().get("content-security-policy").unwrap(),
            "default-src 'none'"
        );
    }

    #[tokio::test]
    async fn security_headers_on_auth_failure() {
        let app = test_app(Some("secret".to_string()));

        let response = app
            .oneshot(
                axum::http::Request::get("/api/shopping-list")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
    }

    #[tokio::test]
    async fn body_size_limit_rejects_oversized() {
        let app = test_app(None);

        let big_body = vec![b' '; BODY_LIMIT + 1];
        let response = app
            .oneshot(
                axum::http::Request::post("/api/shopping-list/from-recipes")
                    .header("content-type", "application/json")
                    .header("content-length", big_body.len())
                    .body(Body::from(big_body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn internal_error_does_not_leak_details() {
        let error =
            ApiError::Internal(anyhow::anyhow!("secret database path /home/user/.larder/db"));
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Internal server error");
        assert!(!json["error"].as_str().unwrap().contains("secret"));
    }

    #[test]
    fn domain_errors_map_to_statuses() {
        let cases = [
            (LarderError::validation("bad"), StatusCode::BAD_REQUEST),
            (LarderError::not_found("gone"), StatusCode::NOT_FOUND),
            (LarderError::conflict("taken"), StatusCode::CONFLICT),
            (anyhow::anyhow!("disk I/O error"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[test]
    fn mask_key_hides_middle() {
        assert_eq!(mask_key("0123456789abcdef"), "0123...cdef");
        assert_eq!(mask_key("short"), "****");
    }

    // --- Shopping list generation ---

    #[tokio::test]
    async fn generate_merges_selection_and_returns_201() {
        let state = test_state(None);
        let seeded = seed(&state);
        let app = build_router(state.clone());
        let mut events = state.events.subscribe();

        let (status, json) = send(
            &app,
            "POST",
            "/api/shopping-list/from-recipes",
            Some(json!({ "recipeIds": [seeded.bread, seeded.bread, seeded.omelette] })),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["message"], "Shopping list generated");
        assert_eq!(json["recipes"], 2);
        assert_eq!(json["ingredients"], 2);
        assert_eq!(events.try_recv().unwrap(), ListEvent::ShoppingListUpdated);
        assert!(events.try_recv().is_err());

        let (status, list) = send(&app, "GET", "/api/shopping-list", None).await;
        assert_eq!(status, StatusCode::OK);
        let flour = item_for(&list, seeded.flour);
        assert_eq!(flour["amount"], "250.00");
        assert_eq!(flour["unit"], "g");
        assert_eq!(flour["is_checked"], false);
        assert_eq!(item_for(&list, seeded.eggs)["amount"], "2.00");
    }

    #[tokio::test]
    async fn generate_storage_failure_returns_generic_500() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("larder.db");
        let state = AppState::new(Database::open(&path).unwrap(), None);
        let seeded = seed(&state);
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER fail_list_insert BEFORE INSERT ON shopping_list_items
                 BEGIN SELECT RAISE(ABORT, 'secret storage detail'); END;",
            )
            .unwrap();
        let app = build_router(state.clone());
        let mut events = state.events.subscribe();

        let (status, json) = send(
            &app,
            "POST",
            "/api/shopping-list/from-recipes",
            Some(json!({ "recipeIds": [seeded.bread, seeded.omelette] })),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json, json!({ "error": "Internal server error" }));
        assert!(events.try_recv().is_err());

        let (status, list) = send(&app, "GET", "/api/shopping-list", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list, json!([]));
    }

    #[tokio::test]
    async fn generate_past_storable_range_returns_409() {
        let state = test_state(None);
        let seeded = seed(&state);
        state
            .db()
            .add_shopping_list_item(seeded.eggs, "99999999".parse().unwrap(), None)
            .unwrap();
        let app = build_router(state.clone());
        let mut events = state.events.subscribe();

        let (status, json) = send(
            &app,
            "POST",
            "/api/shopping-list/from-recipes",
            Some(json!({ "recipeIds": [seeded.omelette] })),
        )
        .await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert!(json["error"].as_str().unwrap().contains("would exceed"));
        assert!(events.try_recv().is_err());

        let (status, list) = send(&app, "GET", "/api/shopping-list", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(item_for(&list, seeded.eggs)["amount"], "99999999.00");
    }

    #[tokio::test]
    async fn generate_rejects_empty_selection() {
        let state = test_state(None);
        seed(&state);
        let app = build_router(state.clone());
        let mut events = state.events.subscribe();

        let (status, json) = send(
            &app,
            "POST",
            "/api/shopping-list/from-recipes",
            Some(json!({ "recipeIds": [] })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("recipeIds"));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn generate_rejects_non_array_selection() {
        let app = test_app(None);

        for body in [json!({ "recipeIds": 5 }), json!({}), json!({ "recipeIds": ["a"] })] {
            let (status, json) =
                send(&app, "POST", "/api/shopping-list/from-recipes", Some(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(json["error"].is_string());
        }
    }

    #[tokio::test]
    async fn malformed_json_returns_400() {
        let app = test_app(None);

        let response = app
            .oneshot(
                axum::http::Request::post("/api/categories")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn event_stream_delivers_list_updates() {
        let state = test_state(None);
        let app = build_router(state.clone());

        let response = app
            .oneshot(
                axum::http::Request::get("/api/events")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        state.notify_list_changed();

        let mut body = response.into_body();
        let frame = body.frame().await.unwrap().unwrap();
        let text = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
        assert!(text.contains("event: shopping_list_updated"));
    }

    async fn events_status(app: &Router, uri: &str, bearer: Option<&str>) -> StatusCode {
        let mut builder = axum::http::Request::get(uri);
        if let Some(key) = bearer {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }
        let response = app
            .clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        response.status()
    }

    #[tokio::test]
    async fn event_stream_accepts_key_in_query() {
        let app = test_app(Some("test-key-abc123".to_string()));

        assert_eq!(
            events_status(&app, "/api/events?api_key=test-key-abc123", None).await,
            StatusCode::OK
        );
        assert_eq!(
            events_status(&app, "/api/events", Some("test-key-abc123")).await,
            StatusCode::OK
        );
        assert_eq!(
            events_status(&app, "/api/events?api_key=wrong", None).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            events_status(&app, "/api/events", None).await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn query_key_only_accepted_on_event_stream() {
        let app = test_app(Some("test-key-abc123".to_string()));

        let (status, _) = send(&app, "GET", "/api/recipes?api_key=test-key-abc123", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    // --- Manual list maintenance ---    // --- Manual list maintenance ---

    #[tokio::test]
    async fn add_item_creates_then_merges() {
        let state = test_state(None);
        let seeded = seed(&state);
        let app = build_router(state);

        let body = json!({ "ingredient_id": seeded.eggs, "amount": "6" });
        let (status, created) = send(&app, "POST", "/api/shopping-list", Some(body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["amount"], "6.00");

        let (status, merged) = send(&app, "POST", "/api/shopping-list", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(merged["id"], created["id"]);
        assert_eq!(merged["amount"], "12.00");

        let (status, _) = send(
            &app,
            "POST",
            "/api/shopping-list",
            Some(json!({ "ingredient_id": seeded.eggs, "amount": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn update_and_delete_items() {
        let state = test_state(None);
        let seeded = seed(&state);
        let app = build_router(state);

        let (_, item) = send(
            &app,
            "POST",
            "/api/shopping-list",
            Some(json!({ "ingredient_id": seeded.flour, "amount": "500" })),
        )
        .await;
        let id = item["id"].as_i64().unwrap();
        let uri = format!("/api/shopping-list/{id}");

        let (status, updated) = send(&app, "PUT", &uri, Some(json!({ "is_checked": true }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["is_checked"], true);

        let (status, _) = send(&app, "PUT", &uri, Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "PUT",
            "/api/shopping-list/999",
            Some(json!({ "is_checked": true })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "DELETE", "/api/shopping-list/checked", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, list) = send(&app, "GET", "/api/shopping-list", None).await;
        assert!(list.as_array().unwrap().is_empty());

        let (status, _) = send(&app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // --- Catalogue ---

    #[tokio::test]
    async fn category_lifecycle() {
        let app = test_app(None);

        let (status, dairy) =
            send(&app, "POST", "/api/categories", Some(json!({ "name": "Dairy" }))).await;
        assert_eq!(status, StatusCode::CREATED);
        let (_, veg) =
            send(&app, "POST", "/api/categories", Some(json!({ "name": "Vegetables" }))).await;

        let (status, json) =
            send(&app, "POST", "/api/categories", Some(json!({ "name": "dairy" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(json["error"].as_str().unwrap().contains("already exists"));

        let (status, ordered) = send(
            &app,
            "PUT",
            "/api/categories/order",
            Some(json!({ "ordered_ids": [veg["id"], dairy["id"]] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ordered[0]["name"], "Vegetables");

        let (status, _) = send(
            &app,
            "POST",
            "/api/ingredients",
            Some(json!({ "name": "Milk", "unit": "ml", "category_id": dairy["id"] })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let dairy_uri = format!("/api/categories/{}", dairy["id"]);
        let (status, _) = send(&app, "DELETE", &dairy_uri, None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let veg_uri = format!("/api/categories/{}", veg["id"]);
        let (status, _) = send(&app, "DELETE", &veg_uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "DELETE", &veg_uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ingredient_in_use_cannot_be_deleted() {
        let state = test_state(None);
        let seeded = seed(&state);
        let app = build_router(state);

        let uri = format!("/api/ingredients/{}", seeded.flour);
        let (status, json) = send(&app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(json["error"].as_str().unwrap().contains("2 recipe(s)"));

        let (status, _) = send(&app, "GET", "/api/ingredients/999", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn recipe_lifecycle() {
        let state = test_state(None);
        let seeded = seed(&state);
        let app = build_router(state);

        let (status, created) = send(
            &app,
            "POST",
            "/api/recipes",
            Some(json!({
                "name": "Scrambled eggs",
                "instructions": "Stir gently.",
                "ingredients": [{ "ingredient_id": seeded.eggs, "amount": "3" }]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["ingredients"][0]["amount"], "3.00");

        let uri = format!("/api/recipes/{}", created["id"]);
        let (status, detail) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["instructions"], "Stir gently.");

        let (status, _) = send(
            &app,
            "POST",
            "/api/recipes",
            Some(json!({ "name": "  ", "ingredients": [] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, recipes) = send(&app, "GET", "/api/recipes", None).await;
        let ids: Vec<i64> = recipes
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![seeded.bread, seeded.omelette]);
    }
}
