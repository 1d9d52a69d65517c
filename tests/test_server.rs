//! Integration test: prediction endpoint

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use stroke_risk::forest::{ForestParams, StrokeForest};
use stroke_risk::server::{cors_layer, create_router, AppState, NOT_A_PATIENT};
use stroke_risk::{
    ModelError, ModelStore, PatientRecord, Prediction, RiskPredictor, RiskService, TransformState,
};
use tower::ServiceExt;

const SECRET: &str = "test-secret";

#[derive(Default)]
struct CountingModel {
    calls: AtomicUsize,
}

impl RiskService for CountingModel {
    fn assess(&self, record: &PatientRecord) -> Result<Prediction, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        record.validate().map_err(stroke_risk::TransformError::from)?;
        Ok(Prediction::from_probability(0.45))
    }
}

fn token(role: &str) -> String {
    encode(
        &Header::default(),
        &json!({ "sub": "42", "role": role }),
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn patient_body() -> Value {
    json!({
        "gender": "Male",
        "age": 67,
        "hypertension": 0,
        "heart_disease": 1,
        "ever_married": "Yes",
        "work_type": "Private",
        "Residence_type": "Urban",
        "avg_glucose_level": 228.69,
        "bmi": 36.6,
        "smoking_status": "formerly smoked"
    })
}

fn request(auth: Option<String>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/prediction/predict")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = auth {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn call(state: AppState, request: Request<Body>) -> (StatusCode, Value) {
    let response = create_router(Arc::new(state), cors_layer(None)).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_health_endpoint() {
    let state = AppState::new(Arc::new(CountingModel::default()), Some(SECRET));
    let response = create_router(Arc::new(state), cors_layer(None))
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_patient_gets_banded_prediction() {
    let model = Arc::new(CountingModel::default());
    let state = AppState::new(model.clone(), Some(SECRET));
    let (status, body) = call(state, request(Some(token("patient")), &patient_body())).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "success": true,
            "prediction": 0,
            "probability": 0.45,
            "risk_level": "Moderate",
            "message": "Moderate risk of stroke. Consider lifestyle changes and regular check-ups."
        })
    );
    assert_eq!(model.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_doctor_is_rejected_before_model() {
    let model = Arc::new(CountingModel::default());
    let state = AppState::new(model.clone(), Some(SECRET));
    let (status, body) = call(state, request(Some(token("doctor")), &patient_body())).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], NOT_A_PATIENT);
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_or_forged_token_is_unauthorized() {
    let model = Arc::new(CountingModel::default());
    let (status, _) = call(
        AppState::new(model.clone(), Some(SECRET)),
        request(None, &patient_body()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let forged = encode(
        &Header::default(),
        &json!({ "role": "patient" }),
        &EncodingKey::from_secret(b"not-the-secret"),
    )
    .unwrap();
    let (status, _) = call(
        AppState::new(model.clone(), Some(SECRET)),
        request(Some(forged), &patient_body()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_secret_is_configuration_error() {
    let state = AppState::new(Arc::new(CountingModel::default()), None);
    let (status, body) = call(state, request(Some(token("patient")), &patient_body())).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["detail"], "Server configuration error");
}

#[tokio::test]
async fn test_out_of_range_field_is_unprocessable() {
    let mut body = patient_body();
    body["age"] = json!(151);
    let state = AppState::new(Arc::new(CountingModel::default()), Some(SECRET));
    let (status, body) = call(state, request(Some(token("patient")), &body)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["detail"].as_str().unwrap().contains("age"));
}

#[tokio::test]
async fn test_malformed_body_is_unprocessable() {
    let mut body = patient_body();
    body.as_object_mut().unwrap().remove("gender");
    let model = Arc::new(CountingModel::default());
    let (status, _) = call(
        AppState::new(model.clone(), Some(SECRET)),
        request(Some(token("patient")), &body),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_artifact_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ModelStore::open(dir.path().join("stroke_model.json")));
    let state = AppState::new(store, Some(SECRET));
    let (status, body) = call(state, request(Some(token("patient")), &patient_body())).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["detail"]
        .as_str()
        .unwrap()
        .contains("Please train the model first"));
}

fn trained_predictor() -> RiskPredictor {
    let work = ["Private", "Self-employed", "Govt_job"];
    let smoking = ["never smoked", "formerly smoked", "smokes", "Unknown"];
    let mut records = Vec::new();
    let mut labels = Vec::new();
    for i in 0..24 {
        let old = i % 2 == 0;
        records.push(PatientRecord {
            gender: if i % 3 == 0 { "Female" } else { "Male" }.to_string(),
            age: if old { 70.0 + i as f64 } else { 20.0 + i as f64 },
            hypertension: old as i32,
            heart_disease: (i % 4 == 0) as i32,
            ever_married: if i % 5 == 0 { "No" } else { "Yes" }.to_string(),
            work_type: work[i % 3].to_string(),
            residence_type: if i % 2 == 0 { "Urban" } else { "Rural" }.to_string(),
            avg_glucose_level: (if old { 210.0 } else { 90.0 }) + i as f64,
            bmi: if i % 6 == 0 { None } else { Some(22.0 + i as f64 / 2.0) },
            smoking_status: smoking[i % 4].to_string(),
        });
        labels.push(old as i32);
    }
    let df = PatientRecord::to_frame(&records).unwrap();
    let state = TransformState::fit(&df).unwrap();
    let x = state.transform(&df).unwrap();
    let params = ForestParams {
        n_trees: 11,
        max_depth: 4,
        min_samples_split: 2,
        min_samples_leaf: 1,
        ..ForestParams::default()
    };
    RiskPredictor::new(state, StrokeForest::fit(&x, &labels, &params).unwrap())
}

#[tokio::test]
async fn test_unseen_category_is_unprocessable() {
    let state = AppState::new(Arc::new(trained_predictor()), Some(SECRET));
    let mut body = patient_body();
    body["work_type"] = json!("Astronaut");
    let (status, body) = call(state, request(Some(token("patient")), &body)).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let detail = body["detail"].as_str().unwrap();
    assert!(detail.contains("work_type"), "{}", detail);
    assert!(detail.contains("Astronaut"), "{}", detail);
}

#[tokio::test]
async fn test_real_predictor_serves_known_categories() {
    let state = AppState::new(Arc::new(trained_predictor()), Some(SECRET));
    let (status, body) = call(state, request(Some(token("patient")), &patient_body())).await;

    assert_eq!(status, StatusCode::OK);
    let probability = body["probability"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&probability));
}

fn preflight() -> Request<Body> {
    Request::builder()
        .method("OPTIONS")
        .uri("/prediction/predict")
        .header(header::ORIGIN, "http://localhost:3000")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .header(
            header::ACCESS_CONTROL_REQUEST_HEADERS,
            "authorization,content-type",
        )
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_browser_preflight_is_allowed() {
    let model = Arc::new(CountingModel::default());
    let state = AppState::new(model.clone(), Some(SECRET));
    let response = create_router(Arc::new(state), cors_layer(None))
        .oneshot(preflight())
        .await
        .unwrap();

    assert!(response.status().is_success());
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "*"
    );
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_configured_origin_is_echoed() {
    let state = AppState::new(Arc::new(CountingModel::default()), Some(SECRET));
    let response = create_router(Arc::new(state), cors_layer(Some("http://localhost:3000")))
        .oneshot(preflight())
        .await
        .unwrap();

    assert!(response.status().is_success());
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "http://localhost:3000"
    );
}
