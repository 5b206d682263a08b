//! Axum + Askama web UI: the form-driven presentation layer over the record
//! store, reconciliation pipelines, and remote sync adapter.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Multipart, Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use labstock_core::{InventoryRecord, RecordDraft, RecordUpdate, Status};
use labstock_store::RecordStore;
use labstock_sync::{
    open_tracked_store, run_import, AppConfig, ImportOptions, MergeEngine, MergeOutcome,
    RemoteSync,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::warn;

pub const CRATE_NAME: &str = "labstock-web";

const APP_CSS: &str = include_str!("../assets/app.css");

/// Per-session interaction state: the verbatim key of the record currently
/// being edited, carried between the edit-form GET and its submit.
#[derive(Debug, Default)]
pub struct EditSession {
    pub edit_target: Option<(String, String)>,
}

pub struct AppState {
    pub store: RecordStore,
    pub remote: Option<RemoteSync>,
    pub requesters: Vec<String>,
    pub session: Mutex<EditSession>,
}

impl AppState {
    pub fn new(store: RecordStore, remote: Option<RemoteSync>, requesters: Vec<String>) -> Self {
        Self {
            store,
            remote,
            requesters,
            session: Mutex::new(EditSession::default()),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/inventory", get(inventory_page_handler))
        .route("/inventory/table", get(inventory_table_handler))
        .route("/inventory/facets", get(inventory_facets_handler))
        .route("/items/new", get(new_item_handler))
        .route("/items", post(create_item_handler))
        .route("/items/{id}", get(item_detail_handler))
        .route("/items/{id}/edit", get(edit_item_handler).post(update_item_handler))
        .route("/items/{id}/status", post(status_action_handler))
        .route("/items/{id}/delete", post(delete_item_handler))
        .route("/import", post(import_handler))
        .route("/export.csv", get(export_handler))
        .route("/template.csv", get(template_handler))
        .route("/merge", post(merge_handler))
        .route("/dashboard/chart", get(dashboard_chart_handler))
        .route("/assets/static/app.css", get(app_css_handler))
        .with_state(Arc::new(state))
}

/// Startup flow: remote fetch once, schema ensured, then serve until
/// shutdown.
pub async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let requesters = config.requesters.clone();
    let port = config.web_port;
    let (store, remote) = open_tracked_store(&config).await?;
    let state = AppState::new(store, remote, requesters);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Clone)]
struct RecordRow {
    id: i64,
    requested_by: String,
    catalog_number: String,
    vendor: String,
    name: String,
    url: String,
    quantity: i64,
    unit: String,
    notes: String,
    cost: String,
    status: String,
    order_date: String,
    received_date: String,
}

fn row_view(record: &InventoryRecord) -> RecordRow {
    RecordRow {
        id: record.id,
        requested_by: record.requested_by.clone(),
        catalog_number: record.catalog_number.clone(),
        vendor: record.vendor.clone(),
        name: record.name.clone(),
        url: record.url.clone().unwrap_or_default(),
        quantity: record.quantity,
        unit: record.unit.clone().unwrap_or_default(),
        notes: record.notes.clone().unwrap_or_default(),
        cost: format!("{:.2}", record.cost),
        status: record.status.to_string(),
        order_date: record.order_date.clone().unwrap_or_default(),
        received_date: record.received_date.clone().unwrap_or_default(),
    }
}

fn blank_row() -> RecordRow {
    RecordRow {
        id: 0,
        requested_by: String::new(),
        catalog_number: String::new(),
        vendor: String::new(),
        name: String::new(),
        url: String::new(),
        quantity: 1,
        unit: String::new(),
        notes: String::new(),
        cost: "0.00".to_string(),
        status: Status::Requested.to_string(),
        order_date: String::new(),
        received_date: String::new(),
    }
}

#[derive(Debug, Clone)]
struct FacetCountRow {
    status: String,
    count: usize,
    selected: bool,
}

#[derive(Debug, Deserialize, Default)]
struct InventoryQuery {
    status: Option<String>,
    q: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    total: usize,
    requested: usize,
    ordered: usize,
    received: usize,
    notice: String,
    warning: String,
}

#[derive(Template)]
#[template(path = "inventory.html")]
struct InventoryTemplate {
    selected_status: String,
    query: String,
    page: usize,
    notice: String,
    warning: String,
}

#[derive(Template)]
#[template(path = "inventory_table_partial.html")]
struct InventoryTablePartialTemplate {
    rows: Vec<RecordRow>,
    page: usize,
    total_pages: usize,
}

#[derive(Template)]
#[template(path = "inventory_facets_partial.html")]
struct InventoryFacetsPartialTemplate {
    status_counts: Vec<FacetCountRow>,
    all_selected: bool,
}

#[derive(Template)]
#[template(path = "item_form.html")]
struct ItemFormTemplate {
    heading: String,
    action: String,
    row: RecordRow,
    statuses: Vec<String>,
    requesters: Vec<String>,
    notice: String,
    warning: String,
}

#[derive(Template)]
#[template(path = "item_detail.html")]
struct ItemDetailTemplate {
    row: RecordRow,
    notice: String,
    warning: String,
}

#[derive(Debug, Deserialize)]
struct ItemForm {
    requested_by: String,
    catalog_number: String,
    vendor: String,
    name: String,
    #[serde(default)]
    url: String,
    quantity: i64,
    #[serde(default)]
    unit: String,
    #[serde(default)]
    notes: String,
    cost: f64,
    status: String,
}

impl ItemForm {
    fn status(&self) -> Result<Status, String> {
        self.status
            .parse()
            .map_err(|_| format!("Unknown status {:?}.", self.status))
    }

    fn draft(&self, status: Status) -> RecordDraft {
        RecordDraft {
            requested_by: self.requested_by.clone(),
            catalog_number: self.catalog_number.clone(),
            vendor: self.vendor.clone(),
            name: self.name.clone(),
            url: non_empty(&self.url),
            quantity: self.quantity,
            unit: non_empty(&self.unit),
            notes: non_empty(&self.notes),
            cost: self.cost,
            status,
            order_date: None,
            received_date: None,
        }
    }

    fn update(&self, status: Status) -> RecordUpdate {
        RecordUpdate {
            requested_by: self.requested_by.clone(),
            name: self.name.clone(),
            quantity: self.quantity,
            notes: non_empty(&self.notes),
            status,
            order_date: None,
            received_date: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusActionForm {
    action: String,
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_all().await {
        Ok(records) => {
            let count = |status: Status| {
                records
                    .iter()
                    .filter(|record| record.status == status)
                    .count()
            };
            render_html(IndexTemplate {
                total: records.len(),
                requested: count(Status::Requested),
                ordered: count(Status::Ordered),
                received: count(Status::Received),
                notice: String::new(),
                warning: String::new(),
            })
        }
        Err(err) => server_error(err.into()),
    }
}

async fn inventory_page_handler(Query(query): Query<InventoryQuery>) -> Response {
    render_html(InventoryTemplate {
        selected_status: query.status.unwrap_or_default(),
        query: query.q.unwrap_or_default(),
        page: query.page.unwrap_or(1),
        notice: String::new(),
        warning: String::new(),
    })
}

async fn inventory_table_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InventoryQuery>,
) -> Response {
    match state.store.list_all().await {
        Ok(records) => {
            let (rows, _counts, _selected, page, total_pages) =
                filtered_paginated_rows(&records, &query);
            let mut response = render_html(InventoryTablePartialTemplate {
                rows,
                page,
                total_pages,
            });
            response.headers_mut().insert(
                header::HeaderName::from_static("hx-trigger"),
                header::HeaderValue::from_static("inventoryTableLoaded"),
            );
            response
        }
        Err(err) => server_error(err.into()),
    }
}

async fn inventory_facets_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InventoryQuery>,
) -> Response {
    match state.store.list_all().await {
        Ok(records) => {
            let (_rows, status_counts, selected, _page, _total_pages) =
                filtered_paginated_rows(&records, &query);
            render_html(InventoryFacetsPartialTemplate {
                all_selected: selected.is_empty(),
                status_counts,
            })
        }
        Err(err) => server_error(err.into()),
    }
}

async fn new_item_handler(State(state): State<Arc<AppState>>) -> Response {
    render_html(ItemFormTemplate {
        heading: "Add New Inventory Item".to_string(),
        action: "/items".to_string(),
        row: blank_row(),
        statuses: status_names(),
        requesters: state.requesters.clone(),
        notice: String::new(),
        warning: String::new(),
    })
}

async fn create_item_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<ItemForm>,
) -> Response {
    let status = match form.status() {
        Ok(status) => status,
        Err(message) => return inventory_shell(String::new(), message),
    };

    // Add-form upsert: a submit for an existing verbatim key updates that
    // record instead of inserting a duplicate.
    let existing = match state.store.find_by_key(&form.catalog_number, &form.vendor).await {
        Ok(existing) => existing,
        Err(err) => return server_error(err.into()),
    };

    let notice = if existing.is_some() {
        match state
            .store
            .update_by_key(&form.catalog_number, &form.vendor, &form.update(status))
            .await
        {
            Ok(_) => format!(
                "Updated existing item: {} (Catalog: {})",
                form.name, form.catalog_number
            ),
            Err(err) => return server_error(err.into()),
        }
    } else {
        match state.store.insert(&form.draft(status)).await {
            Ok(_) => format!("Item '{}' added successfully!", form.name),
            Err(err) => return server_error(err.into()),
        }
    };

    let warning = push_after_mutation(&state).await;
    inventory_shell(notice, warning)
}

async fn item_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    match state.store.find_by_id(id).await {
        Ok(Some(record)) => render_html(ItemDetailTemplate {
            row: row_view(&record),
            notice: String::new(),
            warning: String::new(),
        }),
        Ok(None) => (StatusCode::NOT_FOUND, Html("Item not found".to_string())).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn edit_item_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    match state.store.find_by_id(id).await {
        Ok(Some(record)) => {
            let mut session = state.session.lock().await;
            session.edit_target =
                Some((record.catalog_number.clone(), record.vendor.clone()));
            render_html(ItemFormTemplate {
                heading: "Edit Inventory Item".to_string(),
                action: format!("/items/{id}/edit"),
                row: row_view(&record),
                statuses: status_names(),
                requesters: state.requesters.clone(),
                notice: String::new(),
                warning: String::new(),
            })
        }
        Ok(None) => (StatusCode::NOT_FOUND, Html("Item not found".to_string())).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn update_item_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    Form(form): Form<ItemForm>,
) -> Response {
    let status = match form.status() {
        Ok(status) => status,
        Err(message) => return inventory_shell(String::new(), message),
    };

    // Prefer the key captured when the edit form was opened; fall back to the
    // record's current key for direct submits.
    let target = {
        let mut session = state.session.lock().await;
        session.edit_target.take()
    };
    let target = match target {
        Some(target) => Some(target),
        None => match state.store.find_by_id(id).await {
            Ok(found) => found.map(|record| (record.catalog_number, record.vendor)),
            Err(err) => return server_error(err.into()),
        },
    };
    let Some((catalog_number, vendor)) = target else {
        return inventory_shell(
            String::new(),
            "Item not found in inventory; nothing was changed.".to_string(),
        );
    };

    match state
        .store
        .update_by_key(&catalog_number, &vendor, &form.update(status))
        .await
    {
        Ok(0) => inventory_shell(
            String::new(),
            format!("Item not found in inventory: {} (Catalog: {})", form.name, catalog_number),
        ),
        Ok(_) => {
            let warning = push_after_mutation(&state).await;
            inventory_shell(format!("Item '{}' updated successfully!", form.name), warning)
        }
        Err(err) => server_error(err.into()),
    }
}

async fn status_action_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    Form(form): Form<StatusActionForm>,
) -> Response {
    let new_status = match form.action.as_str() {
        "reorder" => Status::Requested,
        "ordered" => Status::Ordered,
        "received" => Status::Received,
        other => {
            return inventory_shell(String::new(), format!("Unknown action {other:?}."));
        }
    };

    let record = match state.store.find_by_id(id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            return inventory_shell(
                String::new(),
                "Item not found in inventory; nothing was changed.".to_string(),
            )
        }
        Err(err) => return server_error(err.into()),
    };

    // Dates pass through unchanged; the store clears them when the new
    // status is Requested. No date stamping happens on Ordered/Received.
    let update = RecordUpdate {
        requested_by: record.requested_by.clone(),
        name: record.name.clone(),
        quantity: record.quantity,
        notes: record.notes.clone(),
        status: new_status,
        order_date: record.order_date.clone(),
        received_date: record.received_date.clone(),
    };
    match state
        .store
        .update_by_key(&record.catalog_number, &record.vendor, &update)
        .await
    {
        Ok(_) => {
            let warning = push_after_mutation(&state).await;
            let notice = match new_status {
                Status::Requested => format!(
                    "Reordered item: {} (Catalog: {})",
                    record.name, record.catalog_number
                ),
                Status::Ordered => format!("Item '{}' marked as Ordered.", record.name),
                Status::Received => format!("Item '{}' marked as Received.", record.name),
            };
            inventory_shell(notice, warning)
        }
        Err(err) => server_error(err.into()),
    }
}

async fn delete_item_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    let record = match state.store.find_by_id(id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            return inventory_shell(
                String::new(),
                "Item not found in inventory; nothing was changed.".to_string(),
            )
        }
        Err(err) => return server_error(err.into()),
    };

    match state
        .store
        .delete_by_key(&record.catalog_number, &record.vendor)
        .await
    {
        Ok(_) => {
            let warning = push_after_mutation(&state).await;
            inventory_shell(
                format!(
                    "Deleted item: {} (Catalog: {})",
                    record.name, record.catalog_number
                ),
                warning,
            )
        }
        Err(err) => server_error(err.into()),
    }
}

async fn import_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Response {
    let mut upload: Option<Vec<u8>> = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => match field.bytes().await {
                Ok(bytes) => {
                    upload = Some(bytes.to_vec());
                    break;
                }
                Err(err) => {
                    return inventory_shell(String::new(), format!("Error reading upload: {err}"))
                }
            },
            Ok(None) => break,
            Err(err) => {
                return inventory_shell(String::new(), format!("Error reading upload: {err}"))
            }
        }
    }
    let Some(bytes) = upload else {
        return inventory_shell(String::new(), "No CSV file was uploaded.".to_string());
    };

    match run_import(&state.store, &bytes, ImportOptions::default()).await {
        Ok(outcome) => {
            let warning = push_after_mutation(&state).await;
            inventory_shell(
                format!(
                    "CSV imported: {} new records, {} duplicates skipped.",
                    outcome.inserted, outcome.skipped
                ),
                warning,
            )
        }
        Err(err) => inventory_shell(String::new(), format!("Error importing CSV: {err}")),
    }
}

async fn export_handler(State(state): State<Arc<AppState>>) -> Response {
    let records = match state.store.list_all().await {
        Ok(records) => records,
        Err(err) => return server_error(err.into()),
    };
    match labstock_csv::export_csv(&records) {
        Ok(text) => (
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"inventory.csv\"",
                ),
            ],
            text,
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn template_handler() -> Response {
    match labstock_csv::template_csv() {
        Ok(text) => (
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"inventory_template.csv\"",
                ),
            ],
            text,
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn merge_handler(State(state): State<Arc<AppState>>) -> Response {
    match MergeEngine::run(&state.store).await {
        Ok(MergeOutcome::NoDuplicates) => {
            inventory_shell("No duplicates found in the database.".to_string(), String::new())
        }
        Ok(MergeOutcome::Merged { groups, removed }) => {
            let warning = push_after_mutation(&state).await;
            inventory_shell(
                format!("Duplicates purged and merged successfully: {groups} groups folded, {removed} rows removed."),
                warning,
            )
        }
        Err(err) => server_error(err.into()),
    }
}

async fn dashboard_chart_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_all().await {
        Ok(records) => {
            let x: Vec<&str> = Status::ALL.iter().map(Status::as_str).collect();
            let y: Vec<usize> = Status::ALL
                .iter()
                .map(|status| {
                    records
                        .iter()
                        .filter(|record| record.status == *status)
                        .count()
                })
                .collect();
            Json(serde_json::json!({
                "data": [{
                    "type": "bar",
                    "x": x,
                    "y": y,
                    "marker": {"color": "#0ea5e9"}
                }],
                "layout": {
                    "title": "Records Per Status",
                    "paper_bgcolor": "#ffffff",
                    "plot_bgcolor": "#f8fafc"
                }
            }))
            .into_response()
        }
        Err(err) => server_error(err.into()),
    }
}

async fn app_css_handler() -> Response {
    ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], APP_CSS).into_response()
}

fn status_names() -> Vec<String> {
    Status::ALL.iter().map(|status| status.to_string()).collect()
}

/// Best-effort push after a committed mutation: a failure becomes a warning
/// banner; the local change stands.
async fn push_after_mutation(state: &AppState) -> String {
    let Some(remote) = &state.remote else {
        return String::new();
    };
    match remote.push(&state.store).await {
        Ok(_) => String::new(),
        Err(err) => {
            warn!(error = %err, "remote push failed");
            format!("Remote sync failed: {err}. The local change was saved.")
        }
    }
}

fn inventory_shell(notice: String, warning: String) -> Response {
    render_html(InventoryTemplate {
        selected_status: String::new(),
        query: String::new(),
        page: 1,
        notice,
        warning,
    })
}

fn filtered_paginated_rows(
    records: &[InventoryRecord],
    query: &InventoryQuery,
) -> (Vec<RecordRow>, Vec<FacetCountRow>, String, usize, usize) {
    let selected_status = query.status.clone().unwrap_or_default();
    let status_counts = Status::ALL
        .iter()
        .map(|status| FacetCountRow {
            status: status.to_string(),
            count: records
                .iter()
                .filter(|record| record.status == *status)
                .count(),
            selected: selected_status == status.as_str(),
        })
        .collect::<Vec<_>>();

    let needle = query.q.clone().unwrap_or_default().to_lowercase();
    let filtered = records
        .iter()
        .filter(|record| {
            selected_status.is_empty()
                || selected_status == "All"
                || record.status.as_str() == selected_status
        })
        .filter(|record| {
            needle.is_empty()
                || record.name.to_lowercase().contains(&needle)
                || record.catalog_number.to_lowercase().contains(&needle)
                || record.vendor.to_lowercase().contains(&needle)
        })
        .collect::<Vec<_>>();

    let per_page = query.per_page.unwrap_or(20).max(1);
    let total_pages = filtered.len().max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let start = (page - 1) * per_page;
    let rows = filtered
        .into_iter()
        .skip(start)
        .take(per_page)
        .map(row_view)
        .collect::<Vec<_>>();

    (rows, status_counts, selected_status, page, total_pages)
}

fn render_html<T: Template>(template: T) -> Response {
    match template.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
