use actix_web::{web, HttpResponse};
use serde::Deserialize;
use vulnscan_core::{validate_target, Job, NewScan, Scan, ScanId, ScanStatus, ScanType, ToolKind};

use super::Caller;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateScanRequest {
    pub target_url: String,
    #[serde(default)]
    pub scan_type: ScanType,
    #[serde(default)]
    pub scan_config: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct AnalyzeQuery {
    #[serde(default)]
    pub overwrite: bool,
}

pub fn configure_scan_routes(cfg: &mut web::ServiceConfig) {
    cfg
        .route("", web::post().to(create_scan))
        .route("", web::get().to(list_scans))
        .route("/{id}", web::get().to(get_scan))
        .route("/{id}", web::delete().to(delete_scan))
        .route("/{id}/results", web::get().to(get_results))
        .route("/{id}/analyze", web::post().to(analyze_scan));
}

/// 取出调用者自己的扫描；别人的扫描一律视为不存在
async fn owned_scan(state: &AppState, caller: Caller, id: ScanId) -> Result<Scan, ApiError> {
    match state.store.get_scan(id).await? {
        Some(scan) if scan.user_id == caller.0 => Ok(scan),
        _ => Err(ApiError::not_found(format!("Scan {} not found", id))),
    }
}

fn check_tool_selection(req: &CreateScanRequest) -> Result<(), ApiError> {
    if req.scan_type != ScanType::Custom {
        return Ok(());
    }
    let Some(tools) = req.scan_config.get("tools") else {
        return Ok(());
    };
    let names = tools
        .as_array()
        .ok_or_else(|| ApiError::validation("scan_config.tools must be a list of tool names"))?;
    if names.is_empty() {
        return Err(ApiError::validation("scan_config.tools must not be empty"));
    }
    for name in names {
        let known = name.as_str().and_then(ToolKind::from_name).is_some();
        if !known {
            return Err(ApiError::validation(format!("unknown tool {}", name)));
        }
    }
    Ok(())
}

pub async fn create_scan(
    state: web::Data<AppState>,
    caller: Caller,
    body: web::Json<CreateScanRequest>,
) -> Result<HttpResponse, ApiError> {
    let req = body.into_inner();
    let target = validate_target(&req.target_url)?;
    check_tool_selection(&req)?;

    let scan = state
        .store
        .create_scan(NewScan {
            user_id: caller.0,
            target_url: target.to_string(),
            scan_type: req.scan_type,
            scan_config: req.scan_config,
        })
        .await?;
    state.queue.enqueue(Job::Scan { scan_id: scan.id })?;

    tracing::info!(
        scan_id = scan.id,
        user_id = caller.0,
        scan_type = %scan.scan_type,
        url = %scan.target_url,
        "Scan submitted"
    );
    Ok(HttpResponse::Created().json(scan))
}

pub async fn list_scans(state: web::Data<AppState>, caller: Caller) -> Result<HttpResponse, ApiError> {
    let scans = state.store.list_scans(caller.0).await?;
    Ok(HttpResponse::Ok().json(scans))
}

pub async fn get_scan(
    state: web::Data<AppState>,
    caller: Caller,
    path: web::Path<ScanId>,
) -> Result<HttpResponse, ApiError> {
    let scan = owned_scan(&state, caller, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(scan))
}

pub async fn delete_scan(
    state: web::Data<AppState>,
    caller: Caller,
    path: web::Path<ScanId>,
) -> Result<HttpResponse, ApiError> {
    let scan = owned_scan(&state, caller, path.into_inner()).await?;
    if scan.status == ScanStatus::Running {
        return Err(ApiError::conflict("Cannot delete a running scan"));
    }

    state.store.delete_scan(scan.id).await?;
    tracing::info!(scan_id = scan.id, "Scan deleted");
    Ok(HttpResponse::Ok().json(serde_json::json!({ "message": "Scan deleted successfully" })))
}

pub async fn get_results(
    state: web::Data<AppState>,
    caller: Caller,
    path: web::Path<ScanId>,
) -> Result<HttpResponse, ApiError> {
    let scan = owned_scan(&state, caller, path.into_inner()).await?;
    let results = state.store.list_tool_results(scan.id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "scan": scan,
        "results": results,
    })))
}

pub async fn analyze_scan(
    state: web::Data<AppState>,
    caller: Caller,
    path: web::Path<ScanId>,
    query: web::Query<AnalyzeQuery>,
) -> Result<HttpResponse, ApiError> {
    let scan = owned_scan(&state, caller, path.into_inner()).await?;
    if !scan.status.is_terminal() {
        return Err(ApiError::conflict(format!(
            "Scan {} is still {}",
            scan.id, scan.status
        )));
    }

    let overwrite = query.overwrite;
    state.queue.enqueue(Job::Analyze {
        scan_id: scan.id,
        overwrite,
    })?;
    Ok(HttpResponse::Accepted().json(serde_json::json!({
        "message": "Analysis queued",
        "scan_id": scan.id,
        "overwrite": overwrite,
    })))
}
