//! Daily Value - nutrition label scanning and daily intake tracking server.

mod advice;
mod aggregator;
mod config;
mod error;
mod extractor;
mod feedback;
mod normalize;
mod ocr;
mod openrouter;
mod reference;
mod schema;
mod store;
mod table;
mod validate;

use aggregator::DailyAggregator;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::NaiveDate;
use config::{ConfigStore, NutritionConfig, Settings, StoreBackend};
use error::{AggregateError, ScanError};
use extractor::Extractor;
use feedback::FeedbackGenerator;
use ocr::{OcrImage, OcrProvider, OcrProviderKind};
use openrouter::{Message, OpenRouterClient};
use reference::{ReferenceCalculator, Segment};
use schema::{DailyEntry, DailyReport, LabelScan, NutrientRecord, NutrientReport};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use store::{memory::MemoryStore, supabase::SupabaseStore, DailyStore};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type ApiError = (StatusCode, String);

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    configs: Arc<ConfigStore>,
    /// One extractor per config name.
    extractors: Arc<HashMap<String, Arc<Extractor>>>,
    aggregator: Arc<DailyAggregator>,
    ocr_providers: Arc<HashMap<OcrProviderKind, Arc<dyn OcrProvider>>>,
    default_ocr: OcrProviderKind,
    feedback: Option<Arc<FeedbackGenerator>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "daily_value=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;

    // Load configs from filesystem
    let configs = ConfigStore::load_from_dir(std::path::Path::new(&settings.config_dir))?;
    info!("Loaded {} configs: {:?}", configs.list().len(), configs.list());

    let extractors: HashMap<String, Arc<Extractor>> = configs
        .list()
        .into_iter()
        .filter_map(|name| {
            let config = configs.get(&name)?;
            Some((name, Arc::new(Extractor::new(config))))
        })
        .collect();

    let store: Arc<dyn DailyStore> = match settings.store {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Supabase => Arc::new(SupabaseStore::from_env()?),
    };
    let aggregator = DailyAggregator::new(store, settings.aggregate_max_retries)
        .with_retry_delay(settings.aggregate_retry_delay);
    info!(
        "Daily totals in {} store (max {} conflict retries, {:?} base delay)",
        aggregator.store_name(),
        settings.aggregate_max_retries,
        settings.aggregate_retry_delay
    );

    // Initialize OCR providers
    let http_client = reqwest::Client::new();
    let mut ocr_providers: HashMap<OcrProviderKind, Arc<dyn OcrProvider>> = HashMap::new();
    ocr_providers.insert(
        OcrProviderKind::Sidecar,
        Arc::new(ocr::sidecar::SidecarProvider::new(http_client.clone(), &settings.ocr_sidecar_url)),
    );
    match ocr::mistral::MistralOcrProvider::from_env(http_client.clone()) {
        Ok(provider) => {
            ocr_providers.insert(OcrProviderKind::Mistral, Arc::new(provider));
            info!("Mistral OCR provider registered");
        }
        Err(e) => warn!("Mistral OCR provider not available: {}", e),
    }

    let default_ocr = OcrProviderKind::from_str(&settings.ocr_provider)
        .ok_or_else(|| anyhow::anyhow!("Unknown OCR_PROVIDER '{}'", settings.ocr_provider))?;
    if !ocr_providers.contains_key(&default_ocr) {
        anyhow::bail!("OCR_PROVIDER '{}' is not configured", settings.ocr_provider);
    }

    // Feedback is optional
    let feedback = match OpenRouterClient::from_env() {
        Ok(client) => {
            info!("OpenRouter feedback enabled (model={})", client.model());
            Some(Arc::new(FeedbackGenerator::new(client)))
        }
        Err(e) => {
            warn!("Feedback disabled: {}", e);
            None
        }
    };

    // Build application state
    let state = AppState {
        configs: Arc::new(configs),
        extractors: Arc::new(extractors),
        aggregator: Arc::new(aggregator),
        ocr_providers: Arc::new(ocr_providers),
        default_ocr,
        feedback,
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .route("/configs", get(list_configs))
        .route("/configs/:name", get(get_config))
        .route("/upload", post(upload_label))
        .route("/extract", post(extract_lines))
        .route("/add-nutrients", post(add_nutrients))
        .route("/user-status/:user_id", get(user_status))
        .route("/statistics/:user_id", get(statistics))
        .route("/daily/:user_id/:date/:nutrient", get(daily_total).put(correct_total))
        .route("/users/:user_id/data", axum::routing::delete(erase_user_data))
        .route("/ask-ai", post(ask_ai))
        .layer(DefaultBodyLimit::max(settings.upload_limit_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Run server
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!("Server listening on http://{}", settings.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Deserialize)]
struct ConfigQuery {
    config: Option<String>,
}

#[derive(Deserialize)]
struct UploadQuery {
    config: Option<String>,
    provider: Option<String>,
}

#[derive(Deserialize)]
struct ExtractRequest {
    lines: Vec<String>,
    user_id: Option<String>,
    segment: Option<String>,
    #[serde(default)]
    commit: bool,
}

/// A scanned label, annotated against the requested segment.
#[derive(Serialize)]
struct ScanResponse {
    scan: LabelScan,
    segment: String,
    nutrients: Vec<NutrientReport>,
    warnings: Vec<String>,
    advices: Vec<String>,
    /// Today's totals after committing, when the scan was committed.
    #[serde(skip_serializing_if = "Option::is_none")]
    daily: Option<DailyReport>,
}

#[derive(Deserialize)]
struct AddNutrientsRequest {
    user_id: String,
    segment: Option<String>,
    nutrients: Vec<NutrientRecord>,
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    report: DailyReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    ai_feedback: Option<String>,
}

#[derive(Deserialize)]
struct StatusQuery {
    segment: Option<String>,
    date: Option<NaiveDate>,
    config: Option<String>,
    #[serde(default)]
    feedback: bool,
}

#[derive(Serialize)]
struct StatisticsResponse {
    user_id: String,
    /// ISO date → totals of that day.
    days: BTreeMap<String, Vec<DailyEntry>>,
}

#[derive(Deserialize)]
struct CorrectionRequest {
    value: f64,
    #[serde(default)]
    unit: String,
}

#[derive(Serialize)]
struct EraseResponse {
    user_id: String,
    removed: usize,
}

#[derive(Deserialize)]
struct AskRequest {
    user_id: String,
    question: String,
    #[serde(default)]
    history: Vec<Message>,
    segment: Option<String>,
}

#[derive(Serialize)]
struct AskResponse {
    answer: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

/// List available configs.
async fn list_configs(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.configs.list())
}

/// Get a specific config.
async fn get_config(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<NutritionConfig>, StatusCode> {
    state
        .configs
        .get(&name)
        .map(|config| Json((*config).clone()))
        .ok_or(StatusCode::NOT_FOUND)
}

/// Upload a label photo, recognize it and extract nutrients.
async fn upload_label(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Result<Json<ScanResponse>, ApiError> {
    let extractor = state.extractor(query.config.as_deref())?;
    let provider = state.ocr_provider(query.provider.as_deref())?;

    let mut filename = String::new();
    let mut image_data = Vec::new();
    let mut user_id = None;
    let mut segment = None;
    let mut commit = false;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e))
    })? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                filename = field.file_name().unwrap_or("label").to_string();
                image_data = field.bytes().await.map_err(|e| {
                    (StatusCode::BAD_REQUEST, format!("Failed to read image: {}", e))
                })?.to_vec();
            }
            "user_id" | "segment" | "commit" => {
                let text = field.text().await.map_err(|e| {
                    (StatusCode::BAD_REQUEST, format!("Failed to read field {}: {}", name, e))
                })?;
                match name.as_str() {
                    "user_id" => user_id = Some(text),
                    "segment" => segment = Some(text),
                    _ => commit = matches!(text.trim(), "true" | "1" | "yes" | "on"),
                }
            }
            _ => {}
        }
    }

    if image_data.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No image uploaded".to_string()));
    }

    info!(
        "Received image: {} ({} bytes) via {} with config: {}",
        filename,
        image_data.len(),
        provider.name(),
        extractor.config().name
    );

    let image = OcrImage::new(filename, image_data);
    if let Err(e) = image.mime_type() {
        return Err((StatusCode::BAD_REQUEST, e.to_string()));
    }

    let lines = provider.recognize(&image).await.map_err(|e| {
        error!("OCR failed: {}", e);
        (StatusCode::BAD_GATEWAY, format!("OCR failed: {}", e))
    })?;

    let segment = parse_segment(segment.as_deref())?;
    let response = scan_lines(&state, &extractor, &lines, user_id.as_deref(), segment, commit).await?;
    Ok(Json(response))
}

/// Extract nutrients from already-recognized lines.
async fn extract_lines(
    State(state): State<AppState>,
    Query(query): Query<ConfigQuery>,
    Json(request): Json<ExtractRequest>,
) -> Result<Json<ScanResponse>, ApiError> {
    let extractor = state.extractor(query.config.as_deref())?;
    let segment = parse_segment(request.segment.as_deref())?;
    let response = scan_lines(
        &state,
        &extractor,
        &request.lines,
        request.user_id.as_deref(),
        segment,
        request.commit,
    )
    .await?;
    Ok(Json(response))
}

/// Add user-confirmed values to today's totals.
async fn add_nutrients(
    State(state): State<AppState>,
    Query(query): Query<ConfigQuery>,
    Json(request): Json<AddNutrientsRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let config = state.config(query.config.as_deref())?;
    let segment = parse_segment(request.segment.as_deref())?;
    let today = today();

    state
        .aggregator
        .submit(&config, &request.user_id, today, &request.nutrients)
        .await
        .map_err(aggregate_error)?;

    let report = state
        .aggregator
        .report(&config, &request.user_id, today, segment)
        .await
        .map_err(aggregate_error)?;

    let ai_feedback = state.daily_feedback(&report).await;
    Ok(Json(StatusResponse { report, ai_feedback }))
}

/// Daily status of a user (today unless `date` is given).
async fn user_status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    let config = state.config(query.config.as_deref())?;
    let segment = parse_segment(query.segment.as_deref())?;
    let date = query.date.unwrap_or_else(today);

    let report = state
        .aggregator
        .report(&config, &user_id, date, segment)
        .await
        .map_err(aggregate_error)?;

    let ai_feedback = if query.feedback {
        state.daily_feedback(&report).await
    } else {
        None
    };
    Ok(Json(StatusResponse { report, ai_feedback }))
}

/// Every daily total of a user, grouped by date.
async fn statistics(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<StatisticsResponse>, ApiError> {
    let history = state.aggregator.history(&user_id).await.map_err(aggregate_error)?;
    let days = history
        .into_iter()
        .map(|(date, entries)| (date.to_string(), entries))
        .collect();
    Ok(Json(StatisticsResponse { user_id, days }))
}

/// One daily total, 404 while nothing was added for it.
async fn daily_total(
    State(state): State<AppState>,
    Path((user_id, date, nutrient)): Path<(String, NaiveDate, String)>,
    Query(query): Query<ConfigQuery>,
) -> Result<Json<DailyEntry>, ApiError> {
    let config = state.config(query.config.as_deref())?;
    state
        .aggregator
        .total(&config, &user_id, date, &nutrient)
        .await
        .map_err(aggregate_error)?
        .map(Json)
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("No {} total for {} on {}", nutrient, user_id, date),
            )
        })
}

/// Overwrite one daily total.
async fn correct_total(
    State(state): State<AppState>,
    Path((user_id, date, nutrient)): Path<(String, NaiveDate, String)>,
    Query(query): Query<ConfigQuery>,
    Json(request): Json<CorrectionRequest>,
) -> Result<Json<DailyEntry>, ApiError> {
    let config = state.config(query.config.as_deref())?;
    let record = NutrientRecord::new(nutrient, request.value, request.unit);
    let entry = state
        .aggregator
        .correct(&config, &user_id, date, &record)
        .await
        .map_err(aggregate_error)?;
    Ok(Json(entry))
}

/// Erase every daily total of a user.
async fn erase_user_data(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<EraseResponse>, ApiError> {
    let removed = state.aggregator.erase(&user_id).await.map_err(aggregate_error)?;
    Ok(Json(EraseResponse { user_id, removed }))
}

/// Answer a question about today's intake.
async fn ask_ai(
    State(state): State<AppState>,
    Query(query): Query<ConfigQuery>,
    Json(request): Json<AskRequest>,
) -> Result<Json<AskResponse>, ApiError> {
    let generator = state.feedback.clone().ok_or_else(|| {
        (StatusCode::SERVICE_UNAVAILABLE, "AI feedback is not configured".to_string())
    })?;

    if request.question.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Question is empty".to_string()));
    }

    let config = state.config(query.config.as_deref())?;
    let segment = parse_segment(request.segment.as_deref())?;
    let report = state
        .aggregator
        .report(&config, &request.user_id, today(), segment)
        .await
        .map_err(aggregate_error)?;

    let answer = generator
        .answer(&report, &request.question, &request.history)
        .await
        .map_err(|e| {
            error!("Feedback generation failed: {}", e);
            (StatusCode::BAD_GATEWAY, format!("Feedback generation failed: {}", e))
        })?;

    Ok(Json(AskResponse { answer }))
}

// ============================================================================
// Helper functions
// ============================================================================

impl AppState {
    fn config(&self, name: Option<&str>) -> Result<Arc<NutritionConfig>, ApiError> {
        self.configs.resolve(name).ok_or_else(|| unknown_config(&self.configs, name))
    }

    fn extractor(&self, name: Option<&str>) -> Result<Arc<Extractor>, ApiError> {
        let config = self.config(name)?;
        self.extractors
            .get(&config.name)
            .cloned()
            .ok_or_else(|| unknown_config(&self.configs, name))
    }

    fn ocr_provider(&self, name: Option<&str>) -> Result<Arc<dyn OcrProvider>, ApiError> {
        let kind = match name {
            Some(name) => OcrProviderKind::from_str(name).ok_or_else(|| {
                (StatusCode::BAD_REQUEST, format!("Unknown OCR provider: {}", name))
            })?,
            None => self.default_ocr,
        };
        self.ocr_providers.get(&kind).cloned().ok_or_else(|| {
            (StatusCode::BAD_REQUEST, format!("OCR provider {:?} is not configured", kind))
        })
    }

    /// Feedback is best-effort; failures are logged and dropped.
    async fn daily_feedback(&self, report: &DailyReport) -> Option<String> {
        let generator = self.feedback.as_ref()?;
        match generator.daily_feedback(report).await {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("Daily feedback failed for {}: {}", report.user_id, e);
                None
            }
        }
    }
}

/// Scan, annotate and (optionally) commit to today's totals.
async fn scan_lines(
    state: &AppState,
    extractor: &Extractor,
    lines: &[String],
    user_id: Option<&str>,
    segment: Segment,
    commit: bool,
) -> Result<ScanResponse, ApiError> {
    let config = extractor.config();
    let scan = extractor.scan(lines).map_err(scan_error)?;

    let calc = ReferenceCalculator::new(config, segment);
    let nutrients = reference::annotate(config, &calc, &scan.records);
    let assessment = advice::assess(&nutrients, &calc);

    let daily = match (commit, user_id) {
        (true, Some(user_id)) => {
            let today = today();
            state
                .aggregator
                .submit(config, user_id, today, &scan.records)
                .await
                .map_err(aggregate_error)?;
            Some(
                state
                    .aggregator
                    .report(config, user_id, today, segment)
                    .await
                    .map_err(aggregate_error)?,
            )
        }
        (true, None) => {
            return Err((StatusCode::BAD_REQUEST, "commit requires user_id".to_string()));
        }
        _ => None,
    };

    Ok(ScanResponse {
        scan,
        segment: segment.to_string(),
        nutrients,
        warnings: assessment.warnings,
        advices: assessment.advices,
        daily,
    })
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

fn parse_segment(segment: Option<&str>) -> Result<Segment, ApiError> {
    match segment {
        Some(s) => s.parse::<Segment>().map_err(|e| (StatusCode::BAD_REQUEST, e)),
        None => Ok(Segment::default()),
    }
}

fn unknown_config(configs: &ConfigStore, name: Option<&str>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        format!(
            "Unknown config: {}. Available: {:?}",
            name.unwrap_or("default"),
            configs.list()
        ),
    )
}

fn scan_error(e: ScanError) -> ApiError {
    let status = match e {
        ScanError::NoInput => StatusCode::BAD_REQUEST,
        ScanError::NothingExtracted { .. } => StatusCode::UNPROCESSABLE_ENTITY,
    };
    (status, e.to_string())
}

fn aggregate_error(e: AggregateError) -> ApiError {
    let status = match &e {
        AggregateError::UnknownNutrient(_)
        | AggregateError::InvalidValue { .. }
        | AggregateError::UnitMismatch { .. } => StatusCode::BAD_REQUEST,
        AggregateError::RetriesExhausted { .. } => StatusCode::CONFLICT,
        AggregateError::Store(_) => {
            error!("Store failure: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, e.to_string())
}
