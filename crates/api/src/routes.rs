use crate::state::AppState;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use sigtrade_core::*;
use sigtrade_risk::GuardDecision;
use std::sync::Arc;
use tracing::{error, info};

pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Health
        .route("/health", get(health_check))
        // Terminal
        .route("/account", get(account))
        .route("/positions", get(positions))
        .route("/trade", post(trade))
        .route("/close", post(close))
        // Signal history
        .route("/signals", get(recent_signals))
        .route("/signals/latest", get(latest_signal))
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "success": false,
            "error": message.into(),
        })),
    )
        .into_response()
}

fn broker_failure(e: BrokerError) -> Response {
    error!(error = %e, "Terminal request failed");
    failure(StatusCode::BAD_GATEWAY, e.to_string())
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connected = state.terminal.lock().await.is_connected();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "time": Utc::now(),
        "dry_run": state.config.dry_run,
        "terminal_connected": connected,
    }))
}

// ---------------------------------------------------------------------------
// Terminal
// ---------------------------------------------------------------------------

async fn account(State(state): State<Arc<AppState>>) -> Response {
    let mut terminal = state.terminal.lock().await;
    match terminal.account().await {
        Ok(info) => Json(json!({ "success": true, "account_info": info })).into_response(),
        Err(e) => broker_failure(e),
    }
}

async fn positions(State(state): State<Arc<AppState>>) -> Response {
    let mut terminal = state.terminal.lock().await;
    match terminal.positions(None).await {
        Ok(list) => Json(json!({ "success": true, "positions": list })).into_response(),
        Err(e) => broker_failure(e),
    }
}

#[derive(Debug, Deserialize)]
struct TradeRequest {
    symbol: Option<String>,
    action: Option<String>,
    volume: Option<Decimal>,
    tp: Option<Decimal>,
    sl: Option<Decimal>,
    comment: Option<String>,
}

/// A zero stop level means "not set".
fn level(value: Option<Decimal>) -> Option<Decimal> {
    value.filter(|v| !v.is_zero())
}

async fn trade(State(state): State<Arc<AppState>>, Json(req): Json<TradeRequest>) -> Response {
    let (symbol, action, volume) = match (req.symbol, req.action, req.volume) {
        (Some(symbol), Some(action), Some(volume)) => (symbol.to_uppercase(), action, volume),
        (None, _, _) => return failure(StatusCode::BAD_REQUEST, "missing param: symbol"),
        (_, None, _) => return failure(StatusCode::BAD_REQUEST, "missing param: action"),
        (_, _, None) => return failure(StatusCode::BAD_REQUEST, "missing param: volume"),
    };
    let side = match action.trim().to_ascii_uppercase().as_str() {
        "BUY" => Side::Buy,
        "SELL" => Side::Sell,
        _ => return failure(StatusCode::BAD_REQUEST, "action must be BUY or SELL"),
    };

    let mut guard = state.terminal.lock().await;
    let terminal: &mut dyn TradingTerminal = &mut **guard;

    if let Err(e) = terminal.select_symbol(&symbol).await {
        return failure(
            StatusCode::BAD_REQUEST,
            format!("symbol_select failed for {}: {}", symbol, e),
        );
    }
    let tick = match terminal.tick(&symbol).await {
        Ok(tick) => tick,
        Err(e) => {
            return failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("symbol info/tick unavailable: {}", e),
            )
        }
    };

    let comment = req
        .comment
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| format!("api_{}", Utc::now().format("%Y%m%dT%H%M%S")));
    let request = MarketOrderRequest::open(&symbol, side, volume, tick.entry_price(side))
        .with_stops(level(req.sl), level(req.tp))
        .with_deviation(state.config.deviation)
        .with_tag(state.config.magic, comment);

    match state.config.guards.evaluate(terminal, &request).await {
        Ok(GuardDecision::Approved) => {}
        Ok(GuardDecision::Rejected(violation)) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "success": false,
                    "error": violation.message,
                    "rule": violation.rule,
                })),
            )
                .into_response()
        }
        Err(e) => return broker_failure(e),
    }

    if state.config.dry_run {
        info!(symbol = %request.symbol, side = %side, volume = %request.volume, "[DRY_RUN] would send order");
        return Json(json!({ "simulated": true, "request": request })).into_response();
    }

    Json(send_result(terminal.send_order(&request).await)).into_response()
}

fn send_result(result: Result<TradeResult, BrokerError>) -> Value {
    match result {
        Ok(result) => json!({
            "success": true,
            "retcode": result.retcode,
            "details": result,
        }),
        Err(BrokerError::OrderRejected { retcode, message }) => json!({
            "success": false,
            "retcode": retcode,
            "error": message,
        }),
        Err(e) => json!({
            "success": false,
            "error": e.to_string(),
        }),
    }
}

#[derive(Debug, Deserialize)]
struct CloseRequest {
    ticket: Option<u64>,
    symbol: Option<String>,
}

async fn close(State(state): State<Arc<AppState>>, Json(req): Json<CloseRequest>) -> Response {
    let mut guard = state.terminal.lock().await;
    let terminal: &mut dyn TradingTerminal = &mut **guard;

    if let Some(ticket) = req.ticket {
        let open = match terminal.positions(None).await {
            Ok(list) => list,
            Err(e) => return broker_failure(e),
        };
        return match open.into_iter().find(|p| p.ticket == ticket) {
            Some(position) => Json(close_one(&state, terminal, &position).await).into_response(),
            None => failure(StatusCode::NOT_FOUND, format!("position {} not found", ticket)),
        };
    }

    if let Some(symbol) = req.symbol {
        let symbol = symbol.to_uppercase();
        let open = match terminal.positions(Some(&symbol)).await {
            Ok(list) => list,
            Err(e) => return broker_failure(e),
        };
        if open.is_empty() {
            return failure(StatusCode::NOT_FOUND, format!("no positions for {}", symbol));
        }
        let mut results = Vec::with_capacity(open.len());
        for position in &open {
            let result = close_one(&state, terminal, position).await;
            results.push(json!({ "ticket": position.ticket, "result": result }));
        }
        return Json(json!({ "success": true, "results": results })).into_response();
    }

    failure(StatusCode::BAD_REQUEST, "need ticket or symbol field")
}

async fn close_one(
    state: &AppState,
    terminal: &mut dyn TradingTerminal,
    position: &TerminalPosition,
) -> Value {
    let comment = format!("close_by_ticket_{}", position.ticket);
    if state.config.dry_run {
        let price = match terminal.tick(&position.symbol).await {
            Ok(tick) => tick.exit_price(position.side),
            Err(e) => return json!({ "success": false, "error": e.to_string() }),
        };
        let request = MarketOrderRequest::close(position, price)
            .with_deviation(state.config.deviation)
            .with_tag(position.magic, comment);
        return json!({ "simulated": true, "request": request });
    }

    let result = terminal
        .close_position(position, state.config.deviation, &comment)
        .await;
    if result.is_ok() {
        info!(ticket = position.ticket, "Position closed via API");
    }
    send_result(result)
}

// ---------------------------------------------------------------------------
// Signal history
// ---------------------------------------------------------------------------

async fn latest_signal(State(state): State<Arc<AppState>>) -> Response {
    match state.store.latest().await {
        Ok(Some(record)) => Json(json!({ "success": true, "signal": record })).into_response(),
        Ok(None) => failure(StatusCode::NOT_FOUND, "no signals recorded"),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_limit() -> u32 {
    20
}

async fn recent_signals(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Response {
    match state.store.recent(query.limit).await {
        Ok(records) => Json(json!({ "success": true, "signals": records })).into_response(),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
