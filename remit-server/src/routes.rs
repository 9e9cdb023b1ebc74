use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::body::Bytes;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::header;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::delete;
use axum::routing::get;
use axum::routing::post;
use chrono::DateTime;
use chrono::Utc;
use remit_billing::ensure_no_pci_fields;
use remit_idempotency::IdempotencyRecord;
use remit_idempotency::IdempotencyRegistry;
use remit_idempotency::Lookup;
use remit_idempotency::expiry_for;
use remit_idempotency::request_hash;
use remit_ledger::AllocationType;
use remit_ledger::BillingCycle;
use remit_ledger::BillingInterval;
use remit_ledger::CreditReason;
use remit_webhooks::IngestOutcome;
use remit_webhooks::WebhookStore;
use serde::Deserialize;
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const SIGNATURE_HEADER: &str = "processor-signature";

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/customers", post(create_customer))
        .route(
            "/customers/{id}",
            get(get_customer).put(update_customer).delete(delete_customer),
        )
        .route("/invoices", post(create_invoice).get(list_invoices))
        .route("/invoices/{id}", get(get_invoice))
        .route("/invoices/{id}/issue", post(issue_invoice))
        .route("/invoices/{id}/void", post(void_invoice))
        .route("/invoices/{id}/write-off", post(write_off_invoice))
        .route("/invoices/{id}/apply-payment", post(apply_payment))
        .route("/charges", post(create_charge))
        .route("/charges/{id}", get(get_charge))
        .route("/refunds", post(create_refund))
        .route("/credit-memos", post(create_credit_memo))
        .route("/subscriptions", post(create_subscription))
        .route(
            "/subscriptions/{id}",
            get(get_subscription)
                .put(update_subscription)
                .delete(cancel_subscription),
        )
        .route("/payment-methods", post(attach_payment_method))
        .route("/payment-methods/{id}/default", post(set_default_payment_method))
        .route("/payment-methods/{id}", delete(delete_payment_method))
        .route("/webhooks/{app_id}", post(receive_webhook))
        .route("/admin/webhooks/{event_id}/revive", post(revive_webhook))
        .route("/reports/aging-summary", get(report_aging_summary))
        .route("/reports/open-invoices", get(report_open_invoices))
        .route("/reports/delinquent-customers", get(report_delinquent_customers))
        .route(
            "/reports/gl-reconciliation-queue",
            get(report_gl_reconciliation_queue),
        )
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Tenant comes from the auth context, never from the URL. Unknown keys and
/// missing headers are indistinguishable 401s.
fn tenant_from_headers(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(ApiError::unauthorized)?;
    state
        .config
        .tenant_by_api_key(token)
        .map(|tenant| tenant.tenant_id.clone())
        .ok_or_else(ApiError::unauthorized)
}

/// Every mutating body is scanned for PCI-like fields before the typed
/// deserialize; nothing is stored first.
fn parse_body<T: for<'de> Deserialize<'de>>(
    value: &serde_json::Value,
    production: bool,
) -> Result<T, ApiError> {
    ensure_no_pci_fields(value).map_err(|err| ApiError::from_billing(err, production))?;
    serde_json::from_value(value.clone())
        .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid request: {err}")))
}

fn json_response(status: StatusCode, body: &str) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Idempotency wrapper for the documented-idempotent POSTs. Replays return
/// the stored response byte-for-byte; key reuse with a different payload is
/// a conflict. Only successful responses are recorded, so a failed attempt
/// can be retried with the same key.
async fn run_idempotent<F, Fut>(
    state: &AppState,
    tenant: &str,
    headers: &HeaderMap,
    method: &str,
    path: &str,
    body: &serde_json::Value,
    handler: F,
) -> Result<Response, ApiError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(StatusCode, serde_json::Value), ApiError>>,
{
    let production = state.config.production;
    let key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                format!("{IDEMPOTENCY_KEY_HEADER} header is required"),
            )
        })?;

    let hash = request_hash(method, path, body);
    let now = Utc::now();
    match state
        .idempotency
        .lookup(&tenant.to_string(), key, &hash, now)
        .await
        .map_err(|err| ApiError::from_idempotency(err, production))?
    {
        Lookup::Replay(record) => {
            let status = StatusCode::from_u16(record.status_code)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            return Ok(json_response(status, &record.response_body));
        }
        Lookup::Mismatch => {
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                "idempotency key reused with a different request",
            )
            .with_code("IDEMPOTENCY_KEY_REUSE"));
        }
        Lookup::Miss => {}
    }

    let (status, value) = handler().await?;
    let body_string = value.to_string();
    if status.is_success() {
        let stored = state
            .idempotency
            .store(IdempotencyRecord {
                tenant_id: tenant.to_string(),
                key: key.to_string(),
                request_hash: hash,
                status_code: status.as_u16(),
                response_body: body_string.clone(),
                created_at: now,
                expires_at: expiry_for(now, state.config.idempotency_ttl_days),
            })
            .await
            .map_err(|err| ApiError::from_idempotency(err, production))?;
        // A concurrent racer may have stored first; answer with its bytes.
        return Ok(json_response(
            StatusCode::from_u16(stored.status_code).unwrap_or(status),
            &stored.response_body,
        ));
    }
    Ok(json_response(status, &body_string))
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(value)
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}

// ---------------------------------------------------------------------------
// Customers

#[derive(Debug, Deserialize)]
struct CreateCustomerBody {
    external_id: String,
    email: String,
    display_name: String,
}

async fn create_customer(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(raw): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let production = state.config.production;
    let body: CreateCustomerBody = parse_body(&raw, production)?;
    let customer = state
        .billing
        .create_customer(
            &tenant,
            remit_billing::CreateCustomerRequest {
                external_id: body.external_id,
                email: body.email,
                display_name: body.display_name,
            },
        )
        .await
        .map_err(|err| ApiError::from_billing(err, production))?;
    Ok((StatusCode::CREATED, Json(customer)).into_response())
}

async fn get_customer(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let customer = state
        .billing
        .get_customer(&tenant, &id)
        .await
        .map_err(|err| ApiError::from_billing(err, state.config.production))?;
    Ok(Json(customer).into_response())
}

#[derive(Debug, Deserialize)]
struct UpdateCustomerBody {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

async fn update_customer(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(raw): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let production = state.config.production;
    let body: UpdateCustomerBody = parse_body(&raw, production)?;
    let customer = state
        .billing
        .update_customer(
            &tenant,
            &id,
            remit_billing::UpdateCustomerRequest {
                email: body.email,
                display_name: body.display_name,
                raw_payload: raw,
            },
        )
        .await
        .map_err(|err| ApiError::from_billing(err, production))?;
    Ok(Json(customer).into_response())
}

async fn delete_customer(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let customer = state
        .billing
        .delete_customer(&tenant, &id)
        .await
        .map_err(|err| ApiError::from_billing(err, state.config.production))?;
    Ok(Json(customer).into_response())
}

// ---------------------------------------------------------------------------
// Invoices

#[derive(Debug, Deserialize)]
struct InvoiceLineBody {
    description: String,
    quantity: u32,
    unit_price_cents: i64,
}

#[derive(Debug, Deserialize)]
struct CreateInvoiceBody {
    customer_id: String,
    currency: String,
    lines: Vec<InvoiceLineBody>,
    #[serde(default)]
    tax_cents: i64,
    #[serde(default)]
    due_at: Option<DateTime<Utc>>,
    #[serde(default)]
    period_start: Option<DateTime<Utc>>,
    #[serde(default)]
    period_end: Option<DateTime<Utc>>,
}

async fn create_invoice(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(raw): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let production = state.config.production;
    let body: CreateInvoiceBody = parse_body(&raw, production)?;
    let invoice = state
        .billing
        .create_invoice(
            &tenant,
            remit_billing::CreateInvoiceRequest {
                customer_id: body.customer_id,
                currency: body.currency,
                lines: body
                    .lines
                    .into_iter()
                    .map(|line| remit_billing::InvoiceLineInput {
                        description: line.description,
                        quantity: line.quantity,
                        unit_price_cents: line.unit_price_cents,
                    })
                    .collect(),
                tax_cents: body.tax_cents,
                due_at: body.due_at,
                period_start: body.period_start,
                period_end: body.period_end,
            },
        )
        .await
        .map_err(|err| ApiError::from_billing(err, production))?;
    Ok((StatusCode::CREATED, Json(invoice)).into_response())
}

#[derive(Debug, Deserialize)]
struct InvoiceListQuery {
    #[serde(default)]
    customer_id: Option<String>,
}

async fn list_invoices(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<InvoiceListQuery>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let invoices = state
        .billing
        .list_invoices(&tenant, query.customer_id.as_ref())
        .await
        .map_err(|err| ApiError::from_billing(err, state.config.production))?;
    Ok(Json(invoices).into_response())
}

async fn get_invoice(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let invoice = state
        .billing
        .get_invoice(&tenant, &id)
        .await
        .map_err(|err| ApiError::from_billing(err, state.config.production))?;
    Ok(Json(invoice).into_response())
}

async fn issue_invoice(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let invoice = state
        .billing
        .issue_invoice(&tenant, &id)
        .await
        .map_err(|err| ApiError::from_billing(err, state.config.production))?;
    Ok(Json(invoice).into_response())
}

async fn void_invoice(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let invoice = state
        .billing
        .void_invoice(&tenant, &id)
        .await
        .map_err(|err| ApiError::from_billing(err, state.config.production))?;
    Ok(Json(invoice).into_response())
}

async fn write_off_invoice(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let invoice = state
        .billing
        .write_off_invoice(&tenant, &id)
        .await
        .map_err(|err| ApiError::from_billing(err, state.config.production))?;
    Ok(Json(invoice).into_response())
}

#[derive(Debug, Deserialize)]
struct ApplyPaymentBody {
    processor_payment_id: String,
    amount_cents: i64,
    currency: String,
}

#[derive(Debug, Serialize)]
struct ApplyPaymentResponse {
    application: remit_ledger::PaymentApplication,
    invoice: remit_ledger::Invoice,
}

async fn apply_payment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(raw): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let production = state.config.production;
    let body: ApplyPaymentBody = parse_body(&raw, production)?;
    let (application, invoice) = state
        .billing
        .record_application(
            &tenant,
            &id,
            remit_billing::RecordApplicationRequest {
                processor_payment_id: body.processor_payment_id,
                amount_cents: body.amount_cents,
                currency: body.currency,
                allocation_type: AllocationType::Manual,
            },
        )
        .await
        .map_err(|err| ApiError::from_billing(err, production))?;
    Ok(Json(ApplyPaymentResponse { application, invoice }).into_response())
}

// ---------------------------------------------------------------------------
// Charges and refunds (idempotent POSTs)

#[derive(Debug, Deserialize)]
struct CreateChargeBody {
    reference_id: String,
    customer_id: String,
    amount_cents: i64,
    currency: String,
}

async fn create_charge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(raw): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let production = state.config.production;
    let body: CreateChargeBody = parse_body(&raw, production)?;
    let billing = state.billing.clone();
    let tenant_for_handler = tenant.clone();
    run_idempotent(&state, &tenant, &headers, "POST", "/charges", &raw, move || async move {
        let charge = billing
            .create_charge(
                &tenant_for_handler,
                remit_billing::CreateChargeRequest {
                    reference_id: body.reference_id,
                    customer_id: body.customer_id,
                    amount_cents: body.amount_cents,
                    currency: body.currency,
                },
            )
            .await
            .map_err(|err| ApiError::from_billing(err, production))?;
        Ok((StatusCode::CREATED, to_json(&charge)?))
    })
    .await
}

async fn get_charge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let charge = state
        .billing
        .get_charge(&tenant, &id)
        .await
        .map_err(|err| ApiError::from_billing(err, state.config.production))?;
    Ok(Json(charge).into_response())
}

#[derive(Debug, Deserialize)]
struct CreateRefundBody {
    reference_id: String,
    charge_id: String,
    amount_cents: i64,
    #[serde(default)]
    reason: Option<String>,
}

async fn create_refund(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(raw): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let production = state.config.production;
    let body: CreateRefundBody = parse_body(&raw, production)?;
    let billing = state.billing.clone();
    let tenant_for_handler = tenant.clone();
    run_idempotent(&state, &tenant, &headers, "POST", "/refunds", &raw, move || async move {
        let refund = billing
            .create_refund(
                &tenant_for_handler,
                remit_billing::CreateRefundRequest {
                    reference_id: body.reference_id,
                    charge_id: body.charge_id,
                    amount_cents: body.amount_cents,
                    reason: body.reason,
                },
            )
            .await
            .map_err(|err| ApiError::from_billing(err, production))?;
        Ok((StatusCode::CREATED, to_json(&refund)?))
    })
    .await
}

#[derive(Debug, Deserialize)]
struct CreateCreditMemoBody {
    customer_id: String,
    #[serde(default)]
    invoice_id: Option<String>,
    amount_cents: i64,
    currency: String,
    reason: CreditReason,
    #[serde(default)]
    memo: Option<String>,
}

async fn create_credit_memo(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(raw): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let production = state.config.production;
    let body: CreateCreditMemoBody = parse_body(&raw, production)?;
    let memo = state
        .billing
        .create_credit_memo(
            &tenant,
            remit_billing::CreateCreditMemoRequest {
                customer_id: body.customer_id,
                invoice_id: body.invoice_id,
                amount_cents: body.amount_cents,
                currency: body.currency,
                reason: body.reason,
                memo: body.memo,
            },
        )
        .await
        .map_err(|err| ApiError::from_billing(err, production))?;
    Ok((StatusCode::CREATED, Json(memo)).into_response())
}

// ---------------------------------------------------------------------------
// Subscriptions

#[derive(Debug, Deserialize)]
struct CreateSubscriptionBody {
    customer_id: String,
    plan_code: String,
    #[serde(default)]
    payment_method_id: Option<String>,
    interval: BillingInterval,
    interval_count: u32,
    #[serde(default)]
    metadata: serde_json::Value,
}

async fn create_subscription(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(raw): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let production = state.config.production;
    let body: CreateSubscriptionBody = parse_body(&raw, production)?;

    // Plan gating via the static entitlements map when one is configured.
    if let Some(tenant_config) = state.config.tenant(&tenant) {
        if !tenant_config.allows_plan(&body.plan_code) {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                format!("plan {} is not available for this tenant", body.plan_code),
            ));
        }
    }

    let subscription = state
        .billing
        .create_subscription(
            &tenant,
            remit_billing::CreateSubscriptionRequest {
                customer_id: body.customer_id,
                plan_code: body.plan_code,
                payment_method_id: body.payment_method_id,
                billing_cycle: BillingCycle {
                    interval: body.interval,
                    interval_count: body.interval_count,
                },
                metadata: body.metadata,
                raw_payload: raw,
            },
        )
        .await
        .map_err(|err| ApiError::from_billing(err, production))?;
    Ok((StatusCode::CREATED, Json(subscription)).into_response())
}

async fn get_subscription(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let subscription = state
        .billing
        .get_subscription(&tenant, &id)
        .await
        .map_err(|err| ApiError::from_billing(err, state.config.production))?;
    Ok(Json(subscription).into_response())
}

#[derive(Debug, Deserialize)]
struct UpdateSubscriptionBody {
    #[serde(default)]
    metadata: Option<serde_json::Value>,
    #[serde(default)]
    interval: Option<BillingInterval>,
    #[serde(default)]
    interval_count: Option<u32>,
}

async fn update_subscription(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(raw): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let production = state.config.production;
    let body: UpdateSubscriptionBody = parse_body(&raw, production)?;
    let subscription = state
        .billing
        .update_subscription(
            &tenant,
            &id,
            remit_billing::UpdateSubscriptionRequest {
                metadata: body.metadata,
                interval: body.interval,
                interval_count: body.interval_count,
            },
        )
        .await
        .map_err(|err| ApiError::from_billing(err, production))?;
    Ok(Json(subscription).into_response())
}

#[derive(Debug, Deserialize)]
struct CancelSubscriptionQuery {
    #[serde(default)]
    at_period_end: Option<bool>,
}

async fn cancel_subscription(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<CancelSubscriptionQuery>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let subscription = state
        .billing
        .cancel_subscription(
            &tenant,
            &id,
            remit_billing::CancelSubscriptionRequest {
                at_period_end: query.at_period_end.unwrap_or(false),
            },
        )
        .await
        .map_err(|err| ApiError::from_billing(err, state.config.production))?;
    Ok(Json(subscription).into_response())
}

// ---------------------------------------------------------------------------
// Payment methods

#[derive(Debug, Deserialize)]
struct AttachPaymentMethodBody {
    customer_id: String,
    token: String,
    #[serde(default)]
    set_default: bool,
}

async fn attach_payment_method(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(raw): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let production = state.config.production;
    let body: AttachPaymentMethodBody = parse_body(&raw, production)?;
    let method = state
        .billing
        .attach_payment_method(
            &tenant,
            remit_billing::AttachPaymentMethodRequest {
                customer_id: body.customer_id,
                token: body.token,
                set_default: body.set_default,
                raw_payload: raw,
            },
        )
        .await
        .map_err(|err| ApiError::from_billing(err, production))?;
    Ok((StatusCode::CREATED, Json(method)).into_response())
}

#[derive(Debug, Deserialize)]
struct SetDefaultBody {
    customer_id: String,
}

async fn set_default_payment_method(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(raw): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let production = state.config.production;
    let body: SetDefaultBody = parse_body(&raw, production)?;
    let method = state
        .billing
        .set_default_payment_method(&tenant, &body.customer_id, &id)
        .await
        .map_err(|err| ApiError::from_billing(err, production))?;
    Ok(Json(method).into_response())
}

async fn delete_payment_method(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let method = state
        .billing
        .delete_payment_method(&tenant, &id)
        .await
        .map_err(|err| ApiError::from_billing(err, state.config.production))?;
    Ok(Json(method).into_response())
}

// ---------------------------------------------------------------------------
// Webhooks

#[derive(Debug, Serialize)]
struct WebhookAck {
    received: bool,
    duplicate: bool,
}

/// The webhook path authenticates by signature, not bearer token, and must
/// see the raw request bytes: the body is extracted as `Bytes` and passed
/// untouched to verification.
async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let production = state.config.production;
    let tenant_config = state
        .config
        .tenant(&app_id)
        .ok_or_else(ApiError::unauthorized)?;
    let tenant = tenant_config.tenant_id.clone();
    let webhook_secret = tenant_config.credentials.webhook_secret.clone();

    let signature_header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let outcome = state
        .ingestor
        .ingest(&tenant, &body, signature_header, &webhook_secret, Utc::now())
        .await
        .map_err(|err| ApiError::from_webhook(err, production))?;

    match outcome {
        IngestOutcome::Processed => Ok(Json(WebhookAck {
            received: true,
            duplicate: false,
        })
        .into_response()),
        IngestOutcome::Duplicate => Ok(Json(WebhookAck {
            received: true,
            duplicate: true,
        })
        .into_response()),
        IngestOutcome::InvalidSignature => {
            Err(ApiError::new(StatusCode::UNAUTHORIZED, "invalid signature"))
        }
        IngestOutcome::Failed { error } => {
            let message = if production {
                "event processing failed".to_string()
            } else {
                error
            };
            Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, message))
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReviveWebhookBody {
    actor: String,
}

/// Admin-only revival of a dead-lettered webhook: the one audited backward
/// transition in the system.
async fn revive_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(event_id): Path<String>,
    Json(raw): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let production = state.config.production;
    let body: ReviveWebhookBody = parse_body(&raw, production)?;
    let record = state
        .webhook_store
        .revive(&tenant, &event_id, &body.actor, Utc::now())
        .await
        .map_err(|err| ApiError::from_webhook(err, production))?;
    Ok(Json(record).into_response())
}

// ---------------------------------------------------------------------------
// Reports

async fn report_aging_summary(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let summary = state
        .billing
        .aging_summary(&tenant)
        .await
        .map_err(|err| ApiError::from_billing(err, state.config.production))?;
    Ok(Json(summary).into_response())
}

async fn report_open_invoices(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let invoices = state
        .billing
        .open_invoices(&tenant)
        .await
        .map_err(|err| ApiError::from_billing(err, state.config.production))?;
    Ok(Json(invoices).into_response())
}

async fn report_delinquent_customers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let customers = state
        .billing
        .delinquent_customers(&tenant)
        .await
        .map_err(|err| ApiError::from_billing(err, state.config.production))?;
    Ok(Json(customers).into_response())
}

async fn report_gl_reconciliation_queue(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let tenant = tenant_from_headers(&state, &headers)?;
    let queue = state
        .billing
        .gl_reconciliation_queue(&tenant)
        .await
        .map_err(|err| ApiError::from_billing(err, state.config.production))?;
    Ok(Json(queue).into_response())
}
