// JSON-RPC 2.0 wire types
//
// One JSON object per line in both directions. Requests carry an id; `State`
// notifications carry the intermediate states of a streaming continue.

use loupe_core::types::{
    Breakpoint, DebuggerState, EvalScope, GoroutineFilter, GoroutineGroupBy, LoadConfig,
};
use loupe_core::SubstituteRule;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
/// Any engine-level failure; the session stays usable.
pub const ENGINE_ERROR: i32 = -32000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl From<loupe_core::DebugError> for JsonRpcError {
    fn from(err: loupe_core::DebugError) -> Self {
        JsonRpcError::new(ENGINE_ERROR, err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// An intermediate state of the streaming request `id`.
    pub fn state(id: &Value, state: &DebuggerState) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: "State".to_string(),
            params: Some(serde_json::json!({ "id": id, "state": state })),
        }
    }
}

/// Anything the server writes to a connection.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Outgoing {
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

// Request parameters. Every field has a default so clients may omit it.

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CreateBreakpointParams {
    pub breakpoint: Breakpoint,
    pub loc_expr: String,
    pub substitute_path_rules: Option<Vec<SubstituteRule>>,
    pub suspended: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BreakpointParams {
    pub breakpoint: Breakpoint,
}

/// Selects a breakpoint by name when `name` is set, by id otherwise.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BreakpointRef {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListBreakpointsParams {
    pub all: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StepInstructionParams {
    pub skip_calls: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RestartParams {
    pub position: String,
    pub reset_args: bool,
    pub new_args: Vec<String>,
    pub rerecord: bool,
    pub rebuild: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CallParams {
    pub goroutine_id: i64,
    pub expr: String,
}

impl Default for CallParams {
    fn default() -> Self {
        Self {
            goroutine_id: -1,
            expr: String::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DetachParams {
    pub kill: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DisconnectParams {
    pub cont: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct IdParams {
    pub id: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CheckpointParams {
    pub note: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ThreadRegistersParams {
    pub thread_id: i64,
    pub include_fp: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ScopeRegistersParams {
    pub scope: EvalScope,
    pub include_fp: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListGoroutinesParams {
    pub start: usize,
    pub count: usize,
    pub filters: Vec<GoroutineFilter>,
    pub group_by: GoroutineGroupBy,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StacktraceParams {
    pub id: i64,
    pub depth: i32,
    pub full: bool,
    pub cfg: Option<LoadConfig>,
}

impl Default for StacktraceParams {
    fn default() -> Self {
        Self {
            id: -1,
            depth: 10,
            full: false,
            cfg: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AncestorsParams {
    pub goroutine_id: i64,
    pub num_ancestors: usize,
    pub depth: usize,
}

impl Default for AncestorsParams {
    fn default() -> Self {
        Self {
            goroutine_id: -1,
            num_ancestors: 1,
            depth: 10,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct VariablesParams {
    pub scope: EvalScope,
    pub cfg: LoadConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EvalParams {
    pub scope: EvalScope,
    pub expr: String,
    pub cfg: LoadConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SetVariableParams {
    pub scope: EvalScope,
    pub symbol: String,
    pub value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FilterParams {
    pub filter: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListFunctionsParams {
    pub filter: String,
    pub follow_calls: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FindLocationParams {
    pub scope: EvalScope,
    pub loc: String,
    pub include_non_executable: bool,
    pub substitute_path_rules: Vec<SubstituteRule>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DisassembleParams {
    pub scope: EvalScope,
    pub pc: u64,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExamineMemoryParams {
    pub address: u64,
    pub length: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FunctionParams {
    pub function_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FollowExecParams {
    pub enable: bool,
    pub regex: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoadConfigParams {
    pub cfg: Option<LoadConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_omits_missing_fields() {
        let response = JsonRpcResponse::success(Value::from(1), serde_json::json!({"ok": true}));
        let text = serde_json::to_string(&response).unwrap();
        assert_eq!(text, r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#);
    }

    #[test]
    fn test_engine_errors_map_to_server_code() {
        let err: JsonRpcError = loupe_core::DebugError::NotRecorded.into();
        assert_eq!(err.code, ENGINE_ERROR);
        assert!(!err.message.is_empty());
    }

    #[test]
    fn test_params_default_when_omitted() {
        let params: CallParams = serde_json::from_str(r#"{"expr": "f(1)"}"#).unwrap();
        assert_eq!(params.goroutine_id, -1);
        let params: StacktraceParams = serde_json::from_str("{}").unwrap();
        assert_eq!((params.id, params.depth), (-1, 10));
    }

    #[test]
    fn test_state_notification_shape() {
        let state = DebuggerState {
            pid: 7,
            ..Default::default()
        };
        let note = JsonRpcNotification::state(&Value::from("a"), &state);
        let value = serde_json::to_value(Outgoing::Notification(note)).unwrap();
        assert_eq!(value["method"], "State");
        assert_eq!(value["params"]["id"], "a");
        assert_eq!(value["params"]["state"]["pid"], 7);
    }
}
