use qralph_core::error::PhaseError;
use serde::Serialize;
use serde_json::{Map, Value};

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

/// `body`'s fields with a top-level `status`. A non-object body lands under
/// `result`.
pub fn envelope<T: Serialize>(status: &str, body: &T) -> anyhow::Result<Value> {
    let mut map = Map::new();
    match serde_json::to_value(body)? {
        Value::Object(fields) => map.extend(fields),
        Value::Null => {}
        other => {
            map.insert("result".to_string(), other);
        }
    }
    map.insert("status".to_string(), Value::String(status.to_string()));
    Ok(Value::Object(map))
}

/// "refused" when a follow-up transition was refused, else "ok".
pub fn status_for(refused: &Option<PhaseError>) -> &'static str {
    if refused.is_some() {
        "refused"
    } else {
        "ok"
    }
}

pub fn error_body(error: &anyhow::Error) -> Value {
    serde_json::json!({ "status": "error", "error": format!("{error:#}") })
}

pub fn refused_body(error: &PhaseError) -> Value {
    serde_json::json!({ "status": "refused", "refused": error })
}
