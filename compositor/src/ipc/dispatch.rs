//! IPC message dispatch — parse s-expressions and route to handlers.
//!
//! The UI surface is two toggles and a slider; each maps onto one message:
//! `immersive-space-toggle`, `immersion-style-set` and `cutoff-angle-set`.

use lexpr::Value;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::state::ImmersiveState;
use crate::vr::render_config::ImmersionStyle;

/// Parse an s-expression message and dispatch to the appropriate handler.
/// Returns an optional response string (s-expression).
pub fn handle_message(state: &mut ImmersiveState, client_id: u64, raw: &str) -> Option<String> {
    let value = match lexpr::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(client_id, "malformed s-expression: {}", e);
            return Some(error_response(0, &format!("malformed s-expression: {e}")));
        }
    };

    let msg_type = get_keyword(&value, "type");
    let msg_id = get_int(&value, "id").unwrap_or(0);

    let is_authenticated = state
        .ipc_server
        .clients
        .get(&client_id)
        .map(|c| c.authenticated)
        .unwrap_or(false);

    let response = match msg_type.as_deref() {
        Some("hello") => handle_hello(state, client_id, msg_id, &value),
        _ if !is_authenticated => Some(error_response(msg_id, "hello handshake required")),
        Some("ping") => handle_ping(msg_id, &value),
        Some("immersive-space-toggle") => handle_space_toggle(state, msg_id, &value),
        Some("immersion-style-set") => handle_style_set(state, msg_id, &value),
        Some("cutoff-angle-set") => handle_cutoff_angle_set(state, msg_id, &value),
        Some("immersion-status") => handle_immersion_status(state, msg_id),
        Some("layer-config") => handle_layer_config(state, msg_id),
        Some("render-stats") => handle_render_stats(state, msg_id),
        Some(other) => Some(error_response(
            msg_id,
            &format!("unknown message type: {other}"),
        )),
        None => Some(error_response(msg_id, "missing :type field")),
    };

    // Toggles queue controller events; publish them before replying.
    state.process_controller_events();
    response
}

// ── Handlers ────────────────────────────────────────────────

fn handle_hello(
    state: &mut ImmersiveState,
    client_id: u64,
    msg_id: i64,
    value: &Value,
) -> Option<String> {
    let version = get_int(value, "version").unwrap_or(0);
    if version != 1 {
        return Some(error_response(
            msg_id,
            &format!("unsupported protocol version: {version}"),
        ));
    }

    // Only the compositor's own user may drive the session.
    if let Some(peer_uid) = state
        .ipc_server
        .clients
        .get(&client_id)
        .and_then(|c| c.peer_uid)
    {
        let our_uid = unsafe { libc::getuid() };
        if peer_uid != our_uid {
            warn!(client_id, peer_uid, our_uid, "rejecting client: UID mismatch");
            return Some(error_response(msg_id, "authentication failed: UID mismatch"));
        }
    }

    let client_name = get_string(value, "client").unwrap_or_default();
    debug!(client_id, client_name, "hello handshake (authenticated)");
    if let Some(client) = state.ipc_server.clients.get_mut(&client_id) {
        client.authenticated = true;
    }

    Some(format!(
        "(:type :hello :id {} :version 1 :server \"immersive-compositor\" :phase :{})",
        msg_id,
        state.controller.phase().as_str()
    ))
}

fn handle_ping(msg_id: i64, value: &Value) -> Option<String> {
    let client_ts = get_int(value, "timestamp").unwrap_or(0);
    let server_ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    Some(format!(
        "(:type :response :id {} :status :ok :client-timestamp {} :server-timestamp {})",
        msg_id, client_ts, server_ts
    ))
}

fn handle_space_toggle(state: &mut ImmersiveState, msg_id: i64, value: &Value) -> Option<String> {
    let Some(enable) = get_bool(value, "enable") else {
        return Some(error_response(msg_id, "missing :enable parameter"));
    };
    match state.controller.on_session_toggled(enable, Instant::now()) {
        Ok(()) => Some(format!(
            "(:type :response :id {} :status :ok :phase :{})",
            msg_id,
            state.controller.phase().as_str()
        )),
        Err(e) => Some(error_response(msg_id, &e.to_string())),
    }
}

fn handle_style_set(state: &mut ImmersiveState, msg_id: i64, value: &Value) -> Option<String> {
    match get_keyword(value, "style").as_deref().and_then(ImmersionStyle::from_str) {
        Some(style) => {
            state.controller.on_immersion_style_changed(style);
            Some(ok_response(msg_id))
        }
        None => Some(error_response(msg_id, "invalid :style (use full or mixed)")),
    }
}

fn handle_cutoff_angle_set(state: &mut ImmersiveState, msg_id: i64, value: &Value) -> Option<String> {
    let Some(angle) = get_float(value, "angle") else {
        return Some(error_response(msg_id, "missing or non-numeric :angle"));
    };
    state.controller.on_cutoff_angle_changed(angle);
    Some(format!(
        "(:type :response :id {} :status :ok :angle {:.1})",
        msg_id,
        state.controller.render_configuration().portal_cutoff_angle
    ))
}

fn handle_immersion_status(state: &mut ImmersiveState, msg_id: i64) -> Option<String> {
    Some(format!(
        "(:type :response :id {} :status :ok :immersion {})",
        msg_id,
        state.controller.status_sexp()
    ))
}

fn handle_layer_config(state: &mut ImmersiveState, msg_id: i64) -> Option<String> {
    let layer = state
        .render_session
        .as_ref()
        .map(|s| s.layer().to_sexp())
        .unwrap_or_else(|| "nil".to_string());
    Some(format!(
        "(:type :response :id {} :status :ok :layer {})",
        msg_id, layer
    ))
}

fn handle_render_stats(state: &mut ImmersiveState, msg_id: i64) -> Option<String> {
    let stats = state
        .render_session
        .as_ref()
        .map(|s| s.status_sexp())
        .unwrap_or_else(|| "nil".to_string());
    Some(format!(
        "(:type :response :id {} :status :ok :render {})",
        msg_id, stats
    ))
}

// ── Helpers ────────────────────────────────────────────────

pub fn ok_response(id: i64) -> String {
    format!("(:type :response :id {} :status :ok)", id)
}

pub fn error_response(id: i64, reason: &str) -> String {
    format!(
        "(:type :response :id {} :status :error :reason \"{}\")",
        id,
        escape_string(reason)
    )
}

/// Format an IPC event s-expression.
pub fn format_event(event_type: &str, fields: &[(&str, &str)]) -> String {
    let mut s = format!("(:type :event :event :{}", event_type);
    for (key, val) in fields {
        s.push_str(&format!(" :{} {}", key, val));
    }
    s.push(')');
    s
}

/// Escape a string for s-expression output.
fn escape_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Extract a keyword value from an s-expression plist.
/// Accepts both `Value::Keyword("key")` and `Value::Symbol(":key")` forms.
fn get_keyword(value: &Value, key: &str) -> Option<String> {
    let prefixed = format!(":{}", key);
    let mut current = value;
    while let Value::Cons(pair) = current {
        let is_key = match pair.car() {
            Value::Keyword(k) => k.as_ref() == key,
            Value::Symbol(s) => s.as_ref() == prefixed,
            _ => false,
        };
        if is_key {
            let Value::Cons(next) = pair.cdr() else {
                return None;
            };
            let val = next.car();
            return Some(match val {
                Value::Keyword(v) => v.to_string(),
                Value::Symbol(v) => v.strip_prefix(':').unwrap_or(v).to_string(),
                Value::String(v) => v.to_string(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => if *b { "t" } else { "nil" }.to_string(),
                Value::Null | Value::Nil => "nil".to_string(),
                _ => val.to_string(),
            });
        }
        current = pair.cdr();
    }
    None
}

fn get_int(value: &Value, key: &str) -> Option<i64> {
    get_keyword(value, key).and_then(|s| s.parse().ok())
}

fn get_string(value: &Value, key: &str) -> Option<String> {
    get_keyword(value, key)
}

/// Treats "nil" as false and anything else as true.
fn get_bool(value: &Value, key: &str) -> Option<bool> {
    get_keyword(value, key).map(|s| s != "nil")
}

fn get_float(value: &Value, key: &str) -> Option<f64> {
    get_keyword(value, key).and_then(|s| s.parse().ok())
}
