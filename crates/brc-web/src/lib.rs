//! Axum HTTP surface for BRC: liveness, manual triggers and ad-hoc classification.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use brc_core::ClassifyError;
use brc_pipeline::{run_reporting_procedure, ClassifyRequest, RunStatus, ServiceContext};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "brc-web";

#[derive(Clone)]
pub struct AppState {
    pub ctx: ServiceContext,
}

impl AppState {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }
}

#[derive(Debug, Deserialize, Default)]
struct CustomRangeQuery {
    start_date: Option<String>,
    end_date: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/run-report", get(run_report_handler))
        .route("/run_classification_for_date", get(run_for_date_handler))
        .route("/run_classification_custom_range", get(run_custom_range_handler))
        .route("/classify", post(classify_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(ctx: ServiceContext, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(ctx))).await?;
    Ok(())
}

async fn index_handler() -> &'static str {
    "The report classification service is running."
}

async fn run_report_handler(State(state): State<Arc<AppState>>) -> &'static str {
    run_reporting_procedure(state.ctx.store.as_ref()).await;
    "Report procedure initiated."
}

async fn run_for_date_handler(State(state): State<Arc<AppState>>) -> Response {
    let summary = state.ctx.driver.run(None).await;
    let status = run_status_code(summary.status);
    (
        status,
        Json(json!({
            "status": summary.status_message(),
            "time_elapsed": summary.time_elapsed(),
        })),
    )
        .into_response()
}

async fn run_custom_range_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CustomRangeQuery>,
) -> Response {
    let window = match state
        .ctx
        .driver
        .resolve_window(query.start_date.as_deref(), query.end_date.as_deref())
    {
        Ok(window) => window,
        Err(err) => return error_response(err),
    };
    let summary = state.ctx.driver.run(Some(window)).await;
    let status = match summary.status {
        RunStatus::Failed => "Custom range classification failed",
        _ => "Custom range classification initiated",
    };
    (run_status_code(summary.status), Json(json!({ "status": status }))).into_response()
}

async fn classify_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ClassifyRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return error_response(ClassifyError::Validation(rejection.body_text())),
    };
    let result = match request.into_inputs() {
        Ok(inputs) => state.ctx.pipeline.classify_and_update(&inputs).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(outcome) => {
            info!(rows = outcome.rows, excluded = outcome.excluded, "ad-hoc classification committed");
            Json(json!({ "status": "success" })).into_response()
        }
        Err(err) => error_response(err),
    }
}

fn run_status_code(status: RunStatus) -> StatusCode {
    match status {
        RunStatus::Failed => StatusCode::INTERNAL_SERVER_ERROR,
        RunStatus::Completed | RunStatus::CompletedWithErrors => StatusCode::OK,
    }
}

fn error_response(err: ClassifyError) -> Response {
    let status = if err.is_validation() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    warn!(error = %err, "request failed");
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use axum::body::Body;
    use axum::http::{header, Request};
    use brc_model::ClusterClassifier;
    use brc_pipeline::DriverSettings;
    use brc_storage::{MemoryReportStore, TableAllowList, DEFAULT_TABLE_LIKE};
    use chrono::{FixedOffset, NaiveDate};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const TABLE: &str = "mo1_brk_cap_ai";

    fn test_app(store: Arc<MemoryReportStore>) -> Router {
        let classifier = ClusterClassifier::from_model_dir(
            Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/models"),
        )
        .unwrap();
        let ctx = ServiceContext::assemble(
            store,
            classifier,
            TableAllowList::default(),
            DriverSettings {
                table_like: DEFAULT_TABLE_LIKE.to_string(),
                batch_size: 100,
                civil_offset: FixedOffset::east_opt(2 * 3600).unwrap(),
                max_window_days: 366,
            },
        );
        app(AppState::new(ctx))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, value: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(value.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn liveness_and_report_trigger_return_plain_text() {
        let store = Arc::new(MemoryReportStore::new());
        let app = test_app(store.clone());

        let resp = app.clone().oneshot(get("/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app.oneshot(get("/run-report")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Report procedure initiated.");
        assert_eq!(store.reporting_calls(), 1);
    }

    #[tokio::test]
    async fn run_for_date_reports_status_and_elapsed_time() {
        let store = Arc::new(MemoryReportStore::new());
        store.create_table(TABLE).await;
        let resp = test_app(store).oneshot(get("/run_classification_for_date")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "Classification process completed");
        assert!(body["time_elapsed"].as_str().unwrap().ends_with('s'));
    }

    #[tokio::test]
    async fn custom_range_classifies_only_rows_in_window() {
        let store = Arc::new(MemoryReportStore::new());
        let jan = |d| NaiveDate::from_ymd_opt(2024, 1, d).unwrap();
        store.insert_report(TABLE, 1, jan(2), Some("hose leak")).await;
        store.insert_report(TABLE, 2, jan(5), Some("hose leak")).await;

        let resp = test_app(store.clone())
            .oneshot(get("/run_classification_custom_range?start_date=2024-01-01&end_date=2024-01-03"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "Custom range classification initiated");
        assert!(store.report(TABLE, 1).await.unwrap().predicted_cluster.is_some());
        assert!(store.report(TABLE, 2).await.unwrap().predicted_cluster.is_none());
    }

    #[tokio::test]
    async fn custom_range_rejects_bad_dates() {
        let store = Arc::new(MemoryReportStore::new());
        let resp = test_app(store)
            .oneshot(get("/run_classification_custom_range?start_date=2024-01-05&end_date=2024-01-01"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["error"].as_str().unwrap().contains("after"));
    }

    #[tokio::test]
    async fn classify_endpoint_writes_rows() {
        let store = Arc::new(MemoryReportStore::new());
        let jan1 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        store.insert_report(TABLE, 1, jan1, Some("engine overheating")).await;
        store.insert_report(TABLE, 2, jan1, Some("extended service check")).await;

        let resp = test_app(store.clone())
            .oneshot(post_json(
                "/classify",
                serde_json::json!({
                    "texts": ["engine overheating", "extended service check"],
                    "ids": [1, 2],
                    "table_names": [TABLE, TABLE],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "success");

        let excluded = store.report(TABLE, 2).await.unwrap();
        assert_eq!(excluded.predicted_cluster, Some(-1));
        assert_eq!(excluded.predicted_label.as_deref(), Some("extended service check"));
        assert_eq!(store.report(TABLE, 1).await.unwrap().predicted_cluster, Some(5));
    }

    #[tokio::test]
    async fn classify_endpoint_rejects_misaligned_arrays() {
        let store = Arc::new(MemoryReportStore::new());
        let resp = test_app(store)
            .oneshot(post_json(
                "/classify",
                serde_json::json!({
                    "texts": ["engine overheating"],
                    "ids": [1, 2],
                    "table_names": [TABLE],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["error"].as_str().unwrap().contains("equal length"));
    }

    #[tokio::test]
    async fn custom_range_rejects_oversized_windows() {
        let store = Arc::new(MemoryReportStore::new());
        store.create_table(TABLE).await;
        let resp = test_app(store.clone())
            .oneshot(get("/run_classification_custom_range?start_date=2000-01-01&end_date=2099-12-31"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["error"].as_str().unwrap().contains("allowed"));
        assert!(store.fetch_calls().await.is_empty());
    }

    #[tokio::test]
    async fn classify_endpoint_answers_undecodable_bodies_with_json_errors() {
        let store = Arc::new(MemoryReportStore::new());
        let app = test_app(store.clone());

        let bad_id = post_json(
            "/classify",
            serde_json::json!({
                "texts": ["hose leak"],
                "ids": ["row-1"],
                "table_names": [TABLE],
            }),
        );
        let malformed = Request::builder()
            .method("POST")
            .uri("/classify")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"texts\": ["))
            .unwrap();
        let no_content_type = Request::builder()
            .method("POST")
            .uri("/classify")
            .body(Body::from(r#"{"texts":[],"ids":[],"table_names":[]}"#))
            .unwrap();

        for req in [bad_id, malformed, no_content_type] {
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            assert_eq!(
                resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
                "application/json"
            );
            assert!(body_json(resp).await["error"].as_str().is_some());
        }
    }

    #[tokio::test]
    async fn classify_endpoint_rejects_non_string_texts_without_writing() {
        let store = Arc::new(MemoryReportStore::new());
        let jan1 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        store.insert_report(TABLE, 1, jan1, Some("hose leak")).await;
        store.insert_report(TABLE, 2, jan1, Some("brake pressure")).await;

        let resp = test_app(store.clone())
            .oneshot(post_json(
                "/classify",
                serde_json::json!({
                    "texts": ["hose leak", 42],
                    "ids": [1, 2],
                    "table_names": [TABLE, TABLE],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["error"].as_str().unwrap().contains("must be a string"));

        for id in [1, 2] {
            let row = store.report(TABLE, id).await.unwrap();
            assert_eq!(row.predicted_cluster, None);
            assert_eq!(row.processed_report, None);
        }
    }

    #[tokio::test]
    async fn classify_endpoint_reports_store_failures() {
        let store = Arc::new(MemoryReportStore::new());
        let resp = test_app(store)
            .oneshot(post_json(
                "/classify",
                serde_json::json!({
                    "texts": ["hose leak"],
                    "ids": [1],
                    "table_names": ["mo7_brk_cap_ai"],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_json(resp).await["error"].as_str().unwrap().contains("does not exist"));
    }
}
