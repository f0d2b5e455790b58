use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request},
    routing::get,
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, Set};
use serde_json::Value;
use storefront_api::{
    config::AppConfig,
    db::{self, DbConfig},
    entities::product,
    errors::ServiceError,
    events::{self, EventSender},
    handlers::AppServices,
    psp::{
        ModificationResponse, PaymentDetailsRequest, PaymentDetailsResponse,
        PaymentMethodsRequest, PaymentRequest, PaymentResponse, PspGateway, RedirectAction,
        ResultCode,
    },
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

/// Hex HMAC key shared by the test config and the webhook signing helpers.
pub const TEST_HMAC_KEY: &str =
    "44782def307f23ca9cde21c2f9f1b2e8f8ad0e348b6ae6a28bcd9f4b3fbd52b7";

/// PSP double. Every call pops the next scripted reply for that endpoint and
/// records the request it saw; an unscripted call fails the test loudly.
#[derive(Default)]
pub struct ScriptedGateway {
    payment_methods_replies: Mutex<VecDeque<Result<Value, ServiceError>>>,
    authorise_replies: Mutex<VecDeque<Result<PaymentResponse, ServiceError>>>,
    details_replies: Mutex<VecDeque<Result<PaymentDetailsResponse, ServiceError>>>,
    modification_replies: Mutex<VecDeque<Result<ModificationResponse, ServiceError>>>,
    pub authorise_seen: Mutex<Vec<PaymentRequest>>,
    pub details_seen: Mutex<Vec<PaymentDetailsRequest>>,
    pub modification_seen: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl ScriptedGateway {
    pub fn push_payment_methods(&self, reply: Result<Value, ServiceError>) {
        self.payment_methods_replies.lock().unwrap().push_back(reply);
    }

    pub fn push_authorise(&self, reply: Result<PaymentResponse, ServiceError>) {
        self.authorise_replies.lock().unwrap().push_back(reply);
    }

    pub fn push_details(&self, reply: Result<PaymentDetailsResponse, ServiceError>) {
        self.details_replies.lock().unwrap().push_back(reply);
    }

    pub fn push_modification(&self, reply: Result<ModificationResponse, ServiceError>) {
        self.modification_replies.lock().unwrap().push_back(reply);
    }

    pub fn last_authorise_request(&self) -> PaymentRequest {
        self.authorise_seen
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no authorise request was recorded")
    }
}

#[async_trait]
impl PspGateway for ScriptedGateway {
    async fn payment_methods(&self, _req: PaymentMethodsRequest) -> Result<Value, ServiceError> {
        self.payment_methods_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(ServiceError::InternalError(
                    "no scripted reply for payment_methods".into(),
                ))
            })
    }

    async fn authorise(&self, req: PaymentRequest) -> Result<PaymentResponse, ServiceError> {
        self.authorise_seen.lock().unwrap().push(req);
        self.authorise_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(ServiceError::InternalError(
                    "no scripted reply for authorise".into(),
                ))
            })
    }

    async fn payment_details(
        &self,
        req: PaymentDetailsRequest,
    ) -> Result<PaymentDetailsResponse, ServiceError> {
        self.details_seen.lock().unwrap().push(req);
        self.details_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(ServiceError::InternalError(
                    "no scripted reply for payment_details".into(),
                ))
            })
    }

    async fn cancel_or_refund(
        &self,
        original_reference: &str,
    ) -> Result<ModificationResponse, ServiceError> {
        self.modification_seen
            .lock()
            .unwrap()
            .push(original_reference.to_string());
        self.modification_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(ServiceError::InternalError(
                    "no scripted reply for cancel_or_refund".into(),
                ))
            })
    }
}

// Scripted reply constructors

#[allow(dead_code)]
pub fn authorised(psp_reference: &str) -> PaymentResponse {
    PaymentResponse {
        result_code: ResultCode::Authorised,
        psp_reference: Some(psp_reference.to_string()),
        action: None,
        payment_data: None,
        refusal_reason: None,
    }
}

#[allow(dead_code)]
pub fn refused(reason: &str) -> PaymentResponse {
    PaymentResponse {
        result_code: ResultCode::Refused,
        psp_reference: None,
        action: None,
        payment_data: None,
        refusal_reason: Some(reason.to_string()),
    }
}

#[allow(dead_code)]
pub fn received() -> PaymentResponse {
    PaymentResponse {
        result_code: ResultCode::Received,
        psp_reference: None,
        action: None,
        payment_data: None,
        refusal_reason: None,
    }
}

#[allow(dead_code)]
pub fn redirect_shopper(url: &str, continuation: &str) -> PaymentResponse {
    PaymentResponse {
        result_code: ResultCode::RedirectShopper,
        psp_reference: None,
        action: Some(RedirectAction {
            action_type: "redirect".to_string(),
            url: Some(url.to_string()),
            method: Some("GET".to_string()),
            payment_data: Some(continuation.to_string()),
            data: None,
        }),
        payment_data: None,
        refusal_reason: None,
    }
}

#[allow(dead_code)]
pub fn details_outcome(code: ResultCode, psp_reference: Option<&str>) -> PaymentDetailsResponse {
    PaymentDetailsResponse {
        result_code: code,
        psp_reference: psp_reference.map(str::to_string),
        refusal_reason: None,
    }
}

/// Helper harness for spinning up an application state backed by an
/// in-memory SQLite database and a scripted PSP gateway.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<ScriptedGateway>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    /// Construct a new test application with fresh database state.
    pub async fn new() -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "test_api_key".to_string(),
            "TestMerchant".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.psp_hmac_key = Some(TEST_HMAC_KEY.to_string());
        cfg.psp_client_key = Some("test_client_key".to_string());

        // One connection keeps the in-memory database alive across queries.
        let pool = db::establish_connection_with_config(&DbConfig {
            url: cfg.database_url.clone(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        })
        .await
        .expect("failed to create test database");

        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let (event_tx, event_rx) = mpsc::channel(64);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = Arc::new(ScriptedGateway::default());
        let cfg = Arc::new(cfg);
        let services = AppServices::new(
            db_arc.clone(),
            Arc::new(event_sender.clone()),
            gateway.clone(),
            cfg.clone(),
        );

        let state = AppState {
            db: db_arc,
            config: cfg,
            event_sender,
            services,
        };

        let router = Router::new()
            .route("/health", get(storefront_api::health_check))
            .nest("/api", storefront_api::api_routes())
            .with_state(state.clone());

        Self {
            router,
            state,
            gateway,
            _event_task: event_task,
        }
    }

    /// Insert a catalog product directly; catalog management is out of scope
    /// for the API surface.
    pub async fn seed_product(&self, name: &str, price: Decimal) -> product::Model {
        let model = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            price: Set(price),
            created_at: Set(Utc::now()),
        };
        model
            .insert(&*self.state.db)
            .await
            .expect("seed product for tests")
    }

    /// Send a request against the router, optionally as a given shopper.
    #[allow(dead_code)]
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        user: Option<Uuid>,
    ) -> axum::response::Response {
        self.request_with_headers(method, uri, body, user, &[]).await
    }

    #[allow(dead_code)]
    pub async fn request_with_headers(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        user: Option<Uuid>,
        headers: &[(&str, &str)],
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(id) = user {
            builder = builder.header("x-user-id", id.to_string());
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Send a request with a raw body and explicit content type, for payloads
    /// that are not JSON (form posts, malformed bodies).
    #[allow(dead_code)]
    pub async fn request_raw(
        &self,
        method: Method,
        uri: &str,
        content_type: &str,
        body: &str,
    ) -> axum::response::Response {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", content_type)
            .body(Body::from(body.to_string()))
            .expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

/// Read a response body as JSON.
#[allow(dead_code)]
pub async fn response_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

/// Read a response body as raw text.
#[allow(dead_code)]
pub async fn response_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    String::from_utf8(bytes.to_vec()).expect("utf-8 response")
}
