use crate::config::{self, EngineConfig};
use crate::db;
use crate::engine::ReportCardEngine;
use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store::{ReportCardStore, SqliteStore};
use log::warn;
use rusqlite::Connection;
use serde_json::json;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    fn bad_params(message: impl Into<String>) -> Self {
        Self {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn handle_recompute(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let (class_id, period_id) = match (
        get_required_str(&req.params, "classId"),
        get_required_str(&req.params, "periodId"),
    ) {
        (Ok(c), Ok(p)) => (c, p),
        (Err(e), _) | (_, Err(e)) => return e.response(&req.id),
    };

    let store = SqliteStore::new(conn);
    let engine = ReportCardEngine::new(&store, &state.config);
    match engine.recompute_class_period(&class_id, &period_id) {
        Ok(result) => ok(&req.id, json!(result)),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let (student_id, period_id) = match (
        get_required_str(&req.params, "studentId"),
        get_required_str(&req.params, "periodId"),
    ) {
        (Ok(s), Ok(p)) => (s, p),
        (Err(e), _) | (_, Err(e)) => return e.response(&req.id),
    };

    let store = SqliteStore::new(conn);
    let engine = ReportCardEngine::new(&store, &state.config);
    match engine.get_or_recompute_student_report_card(&student_id, &period_id) {
        Ok(card) => ok(&req.id, json!({ "reportCard": card })),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let (class_id, period_id) = match (
        get_required_str(&req.params, "classId"),
        get_required_str(&req.params, "periodId"),
    ) {
        (Ok(c), Ok(p)) => (c, p),
        (Err(e), _) | (_, Err(e)) => return e.response(&req.id),
    };

    match SqliteStore::new(conn).list_report_cards(&class_id, &period_id) {
        Ok(cards) => ok(&req.id, json!({ "reportCards": cards })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn set_locked(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let period_id = get_required_str(params, "periodId")?;
    let locked = params
        .get("locked")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr::bad_params("locked must be a boolean"))?;

    let found = SqliteStore::new(conn)
        .set_locked(&student_id, &period_id, locked)
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "report_cards" })),
        })?;
    if !found {
        return Err(HandlerErr {
            code: "not_found",
            message: "report card not found".to_string(),
            details: Some(json!({ "studentId": student_id, "periodId": period_id })),
        });
    }
    Ok(json!({ "ok": true, "locked": locked }))
}

fn handle_set_locked(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match set_locked(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_config_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(resp) = db_conn(state, req) {
        return resp;
    }
    ok(&req.id, json!({ "config": state.config }))
}

fn update_config(
    conn: &Connection,
    current: &EngineConfig,
    params: &serde_json::Value,
) -> Result<EngineConfig, HandlerErr> {
    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("patch must be an object"))?;
    let next = current.with_patch(patch).map_err(HandlerErr::bad_params)?;

    // Saved last: a failure anywhere leaves the stored and live config equal.
    let update_failed = |e: anyhow::Error| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "key": config::SETTINGS_KEY })),
    };
    db::set_busy_timeout(conn, next.busy_timeout_ms).map_err(update_failed)?;
    if let Err(e) = config::save(conn, &next) {
        if let Err(restore) = db::set_busy_timeout(conn, current.busy_timeout_ms) {
            warn!("could not restore busy timeout: {}", restore);
        }
        return Err(update_failed(e));
    }
    Ok(next)
}

fn handle_config_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match update_config(conn, &state.config, &req.params) {
        Ok(next) => {
            state.config = next;
            ok(&req.id, json!({ "config": state.config }))
        }
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reportcards.recompute" => Some(handle_recompute(state, req)),
        "reportcards.get" => Some(handle_get(state, req)),
        "reportcards.list" => Some(handle_list(state, req)),
        "reportcards.setLocked" => Some(handle_set_locked(state, req)),
        "reportcards.config.get" => Some(handle_config_get(state, req)),
        "reportcards.config.update" => Some(handle_config_update(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::memory_db;

    fn busy_timeout_ms(conn: &Connection) -> i64 {
        conn.query_row("PRAGMA busy_timeout", [], |r| r.get(0))
            .expect("busy timeout")
    }

    fn request(method: &str, params: serde_json::Value) -> Request {
        Request {
            id: "1".to_string(),
            method: method.to_string(),
            params,
        }
    }

    #[test]
    fn config_update_applies_timeout_and_saves() {
        let conn = memory_db();
        db::set_busy_timeout(&conn, 5000).expect("timeout");
        let mut state = AppState {
            db: Some(conn),
            ..AppState::default()
        };

        let resp = handle_config_update(
            &mut state,
            &request(
                "reportcards.config.update",
                json!({ "patch": { "busyTimeoutMs": 750 } }),
            ),
        );
        assert_eq!(resp["ok"], json!(true));
        assert_eq!(state.config.busy_timeout_ms, 750);
        let conn = state.db.as_ref().expect("db");
        assert_eq!(busy_timeout_ms(conn), 750);
        assert_eq!(config::load(conn).expect("load").busy_timeout_ms, 750);
    }

    #[test]
    fn failed_save_keeps_live_and_stored_config_in_step() {
        let conn = memory_db();
        db::set_busy_timeout(&conn, 5000).expect("timeout");
        conn.execute_batch("DROP TABLE settings;").expect("drop settings");
        let mut state = AppState {
            db: Some(conn),
            ..AppState::default()
        };

        let resp = handle_config_update(
            &mut state,
            &request(
                "reportcards.config.update",
                json!({ "patch": { "busyTimeoutMs": 750, "passMark": 12.0 } }),
            ),
        );
        assert_eq!(resp["ok"], json!(false));
        assert_eq!(resp["error"]["code"], json!("db_update_failed"));
        assert_eq!(state.config, EngineConfig::default());
        let conn = state.db.as_ref().expect("db");
        assert_eq!(busy_timeout_ms(conn), 5000);
    }
}
