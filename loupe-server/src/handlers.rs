// JSON-RPC request handlers
//
// Routes each method to the debugger. Engine calls block, so they run on the
// blocking pool; write commands take the command lock first.

use crate::protocol::*;
use crate::session::{SessionId, SessionManager};
use loupe_core::types::LoadConfig;
use loupe_core::{ContinueStream, DebugError, DebugResult, Debugger, RestartOptions, StepMode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

pub type Outbound = mpsc::UnboundedSender<Outgoing>;

/// What the connection should do once the response is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum After {
    Continue,
    /// Close this connection; the target stays for a later client.
    Close,
    /// End the debugging session and stop the server.
    Shutdown,
}

#[derive(Debug)]
pub struct Reply {
    pub response: JsonRpcResponse,
    pub after: After,
}

type HandlerResult = Result<Value, JsonRpcError>;

#[derive(Clone)]
pub struct RequestHandler {
    debugger: Debugger,
    session_manager: SessionManager,
    command_lock: Arc<Mutex<()>>,
    multi_client: bool,
}

impl RequestHandler {
    pub fn new(debugger: Debugger, multi_client: bool) -> Self {
        Self {
            debugger,
            session_manager: SessionManager::new(),
            command_lock: Arc::new(Mutex::new(())),
            multi_client,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.session_manager
    }

    pub fn debugger(&self) -> &Debugger {
        &self.debugger
    }

    pub fn multi_client(&self) -> bool {
        self.multi_client
    }

    pub async fn handle_request(
        &self,
        session: &SessionId,
        request: JsonRpcRequest,
        out: &Outbound,
    ) -> Reply {
        debug!("Handling {} ({})", request.method, request.id);
        let params = request.params.unwrap_or(Value::Null);
        let mut after = After::Continue;
        let id = &request.id;

        let result = match request.method.as_str() {
            // Breakpoints
            "CreateBreakpoint" | "CreateBreakpointWithExpr" => {
                self.handle_create_breakpoint(params).await
            }
            "AmendBreakpoint" => self.handle_amend_breakpoint(params).await,
            "GetBreakpoint" => self.handle_get_breakpoint(params).await,
            "ClearBreakpoint" => self.handle_clear_breakpoint(params).await,
            "ToggleBreakpoint" => self.handle_toggle_breakpoint(params).await,
            "ListBreakpoints" => self.handle_list_breakpoints(params).await,

            // Execution
            "Continue" => self.handle_continue(id, out, false).await,
            "Rewind" => self.handle_continue(id, out, true).await,
            "Next" => self.handle_step(session, StepMode::Next).await,
            "Step" => self.handle_step(session, StepMode::Step).await,
            "StepOut" => self.handle_step(session, StepMode::StepOut).await,
            "StepInstruction" => self.handle_step_instruction(params).await,
            "Halt" => self.handle_halt().await,
            "Restart" | "RestartFrom" => self.handle_restart(&request.method, params).await,
            "Call" => self.handle_call(session, params).await,
            "SwitchThread" => self.handle_switch_thread(params).await,
            "SwitchGoroutine" => self.handle_switch_goroutine(params).await,
            "Checkpoint" => self.handle_checkpoint(params).await,
            "ListCheckpoints" => self.handle_list_checkpoints().await,
            "ClearCheckpoint" => self.handle_clear_checkpoint(params).await,
            "StopRecording" => self.handle_stop_recording().await,
            "Detach" => {
                let result = self.handle_detach(params).await;
                if result.is_ok() {
                    after = After::Shutdown;
                }
                result
            }
            "Disconnect" => {
                let result = self.handle_disconnect(params).await;
                if result.is_ok() {
                    after = After::Close;
                }
                result
            }

            // Inspection
            "GetState" => self.handle_get_state().await,
            "ProcessPid" => self.handle_process_pid().await,
            "ListThreads" => self.handle_list_threads().await,
            "GetThread" => self.handle_get_thread(params).await,
            "ListThreadRegisters" => self.handle_thread_registers(params).await,
            "ListScopeRegisters" => self.handle_scope_registers(params).await,
            "ListGoroutines" | "ListGoroutinesWithFilter" => {
                self.handle_list_goroutines(params).await
            }
            "Stacktrace" => self.handle_stacktrace(params).await,
            "Ancestors" => self.handle_ancestors(params).await,
            "ListLocalVariables" => self.handle_list_locals(params).await,
            "ListFunctionArgs" => self.handle_list_args(params).await,
            "EvalVariable" => self.handle_eval(params).await,
            "SetVariable" => self.handle_set_variable(params).await,
            "ListTypes" => self.handle_list_types(params).await,
            "ListFunctions" => self.handle_list_functions(params).await,
            "ListSources" => self.handle_list_sources(params).await,
            "FindLocation" => self.handle_find_location(params).await,
            "DisassemblePC" => self.handle_disassemble(params, false).await,
            "DisassembleRange" => self.handle_disassemble(params, true).await,
            "ExamineMemory" => self.handle_examine_memory(params).await,
            "FunctionReturnLocations" => self.handle_return_locations(params).await,
            "ListTargets" => self.handle_list_targets().await,
            "FollowExec" => self.handle_follow_exec(params).await,
            "FollowExecEnabled" => self.handle_follow_exec_enabled().await,
            "SetReturnValuesLoadConfig" => self.handle_set_load_config(session, params).await,
            "IsMulticlient" => Ok(json!({ "is_multiclient": self.multi_client })),

            _ => Err(JsonRpcError::new(
                METHOD_NOT_FOUND,
                format!("unknown method: {}", request.method),
            )),
        };

        let response = match result {
            Ok(value) => JsonRpcResponse::success(request.id, value),
            Err(error) => {
                debug!("{} failed: {}", request.method, error.message);
                JsonRpcResponse::failure(request.id, error)
            }
        };
        Reply { response, after }
    }

    pub async fn handle_notification(&self, notification: JsonRpcNotification) {
        match notification.method.as_str() {
            "Cancel" => {
                info!("Client cancelled, halting");
                if let Err(e) = self.blocking(|d| d.halt()).await {
                    warn!("Halt after cancel failed: {}", e.message);
                }
            }
            _ => {
                warn!("Unknown notification: {}", notification.method);
            }
        }
    }

    /// Run an engine call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, JsonRpcError>
    where
        T: Send + 'static,
        F: FnOnce(&Debugger) -> DebugResult<T> + Send + 'static,
    {
        let debugger = self.debugger.clone();
        tokio::task::spawn_blocking(move || f(&debugger))
            .await
            .map_err(|e| JsonRpcError::new(INTERNAL_ERROR, format!("engine task failed: {}", e)))?
            .map_err(JsonRpcError::from)
    }

    /// Like `blocking`, serialized with other write commands.
    async fn command<T, F>(&self, f: F) -> Result<T, JsonRpcError>
    where
        T: Send + 'static,
        F: FnOnce(&Debugger) -> DebugResult<T> + Send + 'static,
    {
        let _guard = self.command_lock.lock().await;
        self.blocking(f).await
    }

    // Breakpoints

    async fn handle_create_breakpoint(&self, params: Value) -> HandlerResult {
        let p: CreateBreakpointParams = parse_params(params)?;
        let bp = self
            .command(move |d| {
                d.create_breakpoint(&p.breakpoint, &p.loc_expr, p.substitute_path_rules, p.suspended)
            })
            .await?;
        Ok(json!({ "breakpoint": bp }))
    }

    async fn handle_amend_breakpoint(&self, params: Value) -> HandlerResult {
        let p: BreakpointParams = parse_params(params)?;
        let bp = self.command(move |d| d.amend_breakpoint(&p.breakpoint)).await?;
        Ok(json!({ "breakpoint": bp }))
    }

    async fn handle_get_breakpoint(&self, params: Value) -> HandlerResult {
        let p: BreakpointRef = parse_params(params)?;
        let bp = self
            .blocking(move |d| {
                if p.name.is_empty() {
                    d.get_breakpoint(p.id)
                } else {
                    d.get_breakpoint_by_name(&p.name)
                }
            })
            .await?;
        Ok(json!({ "breakpoint": bp }))
    }

    async fn handle_clear_breakpoint(&self, params: Value) -> HandlerResult {
        let p: BreakpointRef = parse_params(params)?;
        let bp = self
            .command(move |d| {
                if p.name.is_empty() {
                    d.clear_breakpoint(p.id)
                } else {
                    d.clear_breakpoint_by_name(&p.name)
                }
            })
            .await?;
        Ok(json!({ "breakpoint": bp }))
    }

    async fn handle_toggle_breakpoint(&self, params: Value) -> HandlerResult {
        let p: BreakpointRef = parse_params(params)?;
        let bp = self
            .command(move |d| {
                let id = if p.name.is_empty() {
                    p.id
                } else {
                    d.get_breakpoint_by_name(&p.name)?.id
                };
                d.toggle_breakpoint(id)
            })
            .await?;
        Ok(json!({ "breakpoint": bp }))
    }

    async fn handle_list_breakpoints(&self, params: Value) -> HandlerResult {
        let p: ListBreakpointsParams = parse_params(params)?;
        let bps = self.blocking(move |d| d.list_breakpoints(p.all)).await?;
        Ok(json!({ "breakpoints": bps }))
    }

    // Execution

    /// Stream a continue (or rewind): every state but the last is a notification.
    async fn handle_continue(&self, id: &Value, out: &Outbound, backwards: bool) -> HandlerResult {
        let _guard = self.command_lock.lock().await;
        let stream = self
            .blocking(move |d| if backwards { d.rewind() } else { d.continue_execution() })
            .await?;
        let state = forward_states(id, stream, out).await?;
        Ok(json!({ "state": state }))
    }

    async fn handle_step(&self, session: &SessionId, mode: StepMode) -> HandlerResult {
        let load = self.session_manager.return_values_load_config(session).await;
        let state = self
            .command(move |d| match mode {
                StepMode::Next => d.next(),
                StepMode::Step => d.step(),
                StepMode::StepOut => d.step_out(load.as_ref()),
            })
            .await?;
        Ok(json!({ "state": state }))
    }

    async fn handle_step_instruction(&self, params: Value) -> HandlerResult {
        let p: StepInstructionParams = parse_params(params)?;
        let state = self.command(move |d| d.step_instruction(p.skip_calls)).await?;
        Ok(json!({ "state": state }))
    }

    async fn handle_halt(&self) -> HandlerResult {
        let state = self.blocking(|d| d.halt()).await?;
        Ok(json!({ "state": state }))
    }

    async fn handle_restart(&self, method: &str, params: Value) -> HandlerResult {
        let p: RestartParams = parse_params(params)?;
        if method == "RestartFrom" && p.position.is_empty() {
            return Err(JsonRpcError::new(INVALID_PARAMS, "RestartFrom requires a position"));
        }
        let opts = RestartOptions {
            position: (!p.position.is_empty()).then_some(p.position),
            reset_args: p.reset_args,
            new_args: p.new_args,
            rerecord: p.rerecord,
            rebuild: p.rebuild,
        };
        let discarded = self.command(move |d| d.restart(opts)).await?;
        Ok(json!({ "discarded_breakpoints": discarded }))
    }

    async fn handle_call(&self, session: &SessionId, params: Value) -> HandlerResult {
        let p: CallParams = parse_params(params)?;
        let load = self.session_manager.return_values_load_config(session).await;
        let state = self
            .command(move |d| d.call_function(p.goroutine_id, &p.expr, load.as_ref()))
            .await?;
        Ok(json!({ "state": state }))
    }

    async fn handle_switch_thread(&self, params: Value) -> HandlerResult {
        let p: IdParams = parse_params(params)?;
        let state = self.command(move |d| d.switch_thread(p.id)).await?;
        Ok(json!({ "state": state }))
    }

    async fn handle_switch_goroutine(&self, params: Value) -> HandlerResult {
        let p: IdParams = parse_params(params)?;
        let state = self.command(move |d| d.switch_goroutine(p.id)).await?;
        Ok(json!({ "state": state }))
    }

    async fn handle_checkpoint(&self, params: Value) -> HandlerResult {
        let p: CheckpointParams = parse_params(params)?;
        let id = self.command(move |d| d.checkpoint(&p.note)).await?;
        Ok(json!({ "id": id }))
    }

    async fn handle_list_checkpoints(&self) -> HandlerResult {
        let checkpoints = self.blocking(|d| d.list_checkpoints()).await?;
        Ok(json!({ "checkpoints": checkpoints }))
    }

    async fn handle_clear_checkpoint(&self, params: Value) -> HandlerResult {
        let p: IdParams = parse_params(params)?;
        let id = i32::try_from(p.id)
            .map_err(|_| JsonRpcError::new(INVALID_PARAMS, format!("invalid checkpoint id {}", p.id)))?;
        self.command(move |d| d.clear_checkpoint(id)).await?;
        Ok(json!({}))
    }

    async fn handle_stop_recording(&self) -> HandlerResult {
        self.command(|d| d.stop_recording()).await?;
        Ok(json!({}))
    }

    async fn handle_detach(&self, params: Value) -> HandlerResult {
        let p: DetachParams = parse_params(params)?;
        info!("Detach requested (kill={})", p.kill);
        self.blocking(move |d| d.detach(p.kill)).await?;
        Ok(json!({}))
    }

    async fn handle_disconnect(&self, params: Value) -> HandlerResult {
        let p: DisconnectParams = parse_params(params)?;
        if p.cont && self.multi_client {
            let resumed = self
                .blocking(|d| match d.continue_detached() {
                    Err(DebugError::TargetRunning) => Ok(()),
                    other => other,
                })
                .await;
            if let Err(e) = resumed {
                warn!("Resume on disconnect failed: {}", e.message);
            }
        }
        Ok(json!({}))
    }

    // Inspection

    async fn handle_get_state(&self) -> HandlerResult {
        let state = self.blocking(|d| d.get_state()).await?;
        Ok(json!({ "state": state }))
    }

    async fn handle_process_pid(&self) -> HandlerResult {
        let pid = self.blocking(|d| d.process_pid()).await?;
        Ok(json!({ "pid": pid }))
    }

    async fn handle_list_threads(&self) -> HandlerResult {
        let threads = self.blocking(|d| d.list_threads()).await?;
        Ok(json!({ "threads": threads }))
    }

    async fn handle_get_thread(&self, params: Value) -> HandlerResult {
        let p: IdParams = parse_params(params)?;
        let thread = self.blocking(move |d| d.get_thread(p.id)).await?;
        Ok(json!({ "thread": thread }))
    }

    async fn handle_thread_registers(&self, params: Value) -> HandlerResult {
        let p: ThreadRegistersParams = parse_params(params)?;
        let regs = self
            .blocking(move |d| d.list_registers(p.thread_id, p.include_fp))
            .await?;
        Ok(json!({ "registers": regs }))
    }

    async fn handle_scope_registers(&self, params: Value) -> HandlerResult {
        let p: ScopeRegistersParams = parse_params(params)?;
        let regs = self
            .blocking(move |d| d.list_scope_registers(p.scope, p.include_fp))
            .await?;
        Ok(json!({ "registers": regs }))
    }

    async fn handle_list_goroutines(&self, params: Value) -> HandlerResult {
        let p: ListGoroutinesParams = parse_params(params)?;
        let page = self
            .blocking(move |d| d.list_goroutines(p.start, p.count, &p.filters, &p.group_by))
            .await?;
        to_value(page)
    }

    async fn handle_stacktrace(&self, params: Value) -> HandlerResult {
        let p: StacktraceParams = parse_params(params)?;
        let cfg = p.full.then(|| p.cfg.unwrap_or_default());
        let frames = self
            .blocking(move |d| d.stacktrace(p.id, p.depth, cfg.as_ref()))
            .await?;
        Ok(json!({ "locations": frames }))
    }

    async fn handle_ancestors(&self, params: Value) -> HandlerResult {
        let p: AncestorsParams = parse_params(params)?;
        let ancestors = self
            .blocking(move |d| d.ancestors(p.goroutine_id, p.num_ancestors, p.depth))
            .await?;
        Ok(json!({ "ancestors": ancestors }))
    }

    async fn handle_list_locals(&self, params: Value) -> HandlerResult {
        let p: VariablesParams = parse_params(params)?;
        let vars = self.blocking(move |d| d.list_locals(p.scope, &p.cfg)).await?;
        Ok(json!({ "variables": vars }))
    }

    async fn handle_list_args(&self, params: Value) -> HandlerResult {
        let p: VariablesParams = parse_params(params)?;
        let args = self.blocking(move |d| d.list_args(p.scope, &p.cfg)).await?;
        Ok(json!({ "args": args }))
    }

    async fn handle_eval(&self, params: Value) -> HandlerResult {
        let p: EvalParams = parse_params(params)?;
        let var = self
            .blocking(move |d| d.eval_variable(p.scope, &p.expr, &p.cfg))
            .await?;
        Ok(json!({ "variable": var }))
    }

    async fn handle_set_variable(&self, params: Value) -> HandlerResult {
        let p: SetVariableParams = parse_params(params)?;
        self.command(move |d| d.set_variable(p.scope, &p.symbol, &p.value))
            .await?;
        Ok(json!({}))
    }

    async fn handle_list_types(&self, params: Value) -> HandlerResult {
        let p: FilterParams = parse_params(params)?;
        let types = self.blocking(move |d| d.list_types(&p.filter)).await?;
        Ok(json!({ "types": types }))
    }

    async fn handle_list_functions(&self, params: Value) -> HandlerResult {
        let p: ListFunctionsParams = parse_params(params)?;
        let funcs = self
            .blocking(move |d| d.list_functions(&p.filter, p.follow_calls))
            .await?;
        Ok(json!({ "funcs": funcs }))
    }

    async fn handle_list_sources(&self, params: Value) -> HandlerResult {
        let p: FilterParams = parse_params(params)?;
        let sources = self.blocking(move |d| d.list_sources(&p.filter)).await?;
        Ok(json!({ "sources": sources }))
    }

    async fn handle_find_location(&self, params: Value) -> HandlerResult {
        let p: FindLocationParams = parse_params(params)?;
        let locs = self
            .blocking(move |d| {
                d.find_location(p.scope, &p.loc, p.include_non_executable, &p.substitute_path_rules)
            })
            .await?;
        Ok(json!({ "locations": locs }))
    }

    async fn handle_disassemble(&self, params: Value, range: bool) -> HandlerResult {
        let p: DisassembleParams = parse_params(params)?;
        let instrs = self
            .blocking(move |d| {
                if range {
                    d.disassemble_range(p.scope, p.start, p.end)
                } else {
                    d.disassemble_pc(p.scope, p.pc)
                }
            })
            .await?;
        Ok(json!({ "disassemble": instrs }))
    }

    async fn handle_examine_memory(&self, params: Value) -> HandlerResult {
        let p: ExamineMemoryParams = parse_params(params)?;
        let address = p.address;
        let mem = self
            .blocking(move |d| d.examine_memory(p.address, p.length))
            .await?;
        Ok(json!({ "address": address, "memory": mem }))
    }

    async fn handle_return_locations(&self, params: Value) -> HandlerResult {
        let p: FunctionParams = parse_params(params)?;
        let addrs = self
            .blocking(move |d| d.function_return_locations(&p.function_name))
            .await?;
        Ok(json!({ "addresses": addrs }))
    }

    async fn handle_list_targets(&self) -> HandlerResult {
        let targets = self.blocking(|d| d.list_targets()).await?;
        Ok(json!({ "targets": targets }))
    }

    async fn handle_follow_exec(&self, params: Value) -> HandlerResult {
        let p: FollowExecParams = parse_params(params)?;
        self.command(move |d| {
            let regex = (!p.regex.is_empty()).then_some(p.regex.as_str());
            d.follow_exec(p.enable, regex)
        })
        .await?;
        Ok(json!({}))
    }

    async fn handle_follow_exec_enabled(&self) -> HandlerResult {
        let (enabled, regex) = self.blocking(|d| d.follow_exec_enabled()).await?;
        Ok(json!({ "enabled": enabled, "regex": regex.unwrap_or_default() }))
    }

    async fn handle_set_load_config(&self, session: &SessionId, params: Value) -> HandlerResult {
        let p: LoadConfigParams = parse_params(params)?;
        let cfg: Option<LoadConfig> = p.cfg;
        self.session_manager
            .set_return_values_load_config(session, cfg)
            .await;
        Ok(json!({}))
    }
}

/// Forward intermediate states as notifications and return the final one.
async fn forward_states(
    id: &Value,
    mut stream: ContinueStream,
    out: &Outbound,
) -> Result<loupe_core::types::DebuggerState, JsonRpcError> {
    let mut last = None;
    let mut closed = false;
    while let Some(state) = stream.recv().await {
        if let Some(previous) = last.replace(state) {
            let note = Outgoing::Notification(JsonRpcNotification::state(id, &previous));
            if out.send(note).is_err() && !closed {
                debug!("Client gone during continue, halting");
                stream.close();
                closed = true;
            }
        }
    }
    last.ok_or_else(|| JsonRpcError::new(INTERNAL_ERROR, "continue ended without a state"))
}

fn parse_params<T: DeserializeOwned + Default>(params: Value) -> Result<T, JsonRpcError> {
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params)
        .map_err(|e| JsonRpcError::new(INVALID_PARAMS, format!("invalid params: {}", e)))
}

fn to_value<T: serde::Serialize>(value: T) -> HandlerResult {
    serde_json::to_value(value)
        .map_err(|e| JsonRpcError::new(INTERNAL_ERROR, format!("encoding result: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use loupe_core::{DebuggerConfig, SimLauncher};

    const PROGRAM: &str = "/src/prog.json";

    const LOOP: &str = r#"{
        "functions": [
            {"name": "main.main", "file": "/src/main.go", "line": 3, "body": [
                {"line": 4, "ops": [{"op": "set", "var": "i", "value": {"int": 0}}]},
                {"line": 5, "ops": [{"op": "call", "func": "main.work", "args": [{"var": "i"}]}]},
                {"line": 6, "ops": [{"op": "set", "var": "i", "value": {"add": ["i", 1]}},
                                    {"op": "jump_if_less", "var": "i", "limit": {"int": 3}, "line": 5}]}
            ]},
            {"name": "main.work", "file": "/src/main.go", "line": 11, "params": ["n"], "body": [
                {"line": 12, "ops": [{"op": "set", "var": "d", "value": {"add": ["n", 10]}}]},
                {"line": 13, "ops": [{"op": "ret", "values": [{"var": "d"}]}]}
            ]}
        ]
    }"#;

    const SPIN: &str = r#"{
        "functions": [
            {"name": "main.main", "file": "/src/main.go", "line": 3, "body": [
                {"line": 4, "ops": [{"op": "nop"}, {"op": "jump", "line": 4}]}
            ]}
        ]
    }"#;

    fn handler(source: &str) -> RequestHandler {
        let launcher = SimLauncher::new();
        launcher.set_source(PROGRAM, source);
        let debugger =
            Debugger::launch(Arc::new(launcher), PROGRAM, Vec::new(), DebuggerConfig::default())
                .unwrap();
        RequestHandler::new(debugger, false)
    }

    fn request(id: i64, method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Value::from(id),
            method: method.to_string(),
            params: Some(params),
        }
    }

    async fn call(handler: &RequestHandler, session: &SessionId, method: &str, params: Value) -> JsonRpcResponse {
        let (out, _rx) = mpsc::unbounded_channel();
        handler
            .handle_request(session, request(1, method, params), &out)
            .await
            .response
    }

    fn result(response: JsonRpcResponse) -> Value {
        assert!(response.error.is_none(), "unexpected error: {:?}", response.error);
        response.result.unwrap()
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let handler = handler(LOOP);
        let session = handler.sessions().create_session("test").await;
        let response = call(&handler, &session, "Frobnicate", Value::Null).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, METHOD_NOT_FOUND);
        assert!(error.message.starts_with("unknown method: "));
    }

    #[tokio::test]
    async fn test_invalid_params_and_engine_errors() {
        let handler = handler(LOOP);
        let session = handler.sessions().create_session("test").await;

        let response = call(&handler, &session, "GetBreakpoint", json!({"id": "one"})).await;
        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);

        let response = call(&handler, &session, "GetBreakpoint", json!({"id": 99})).await;
        assert_eq!(response.error.unwrap().code, ENGINE_ERROR);

        // The session keeps working after an engine error.
        let state = result(call(&handler, &session, "GetState", Value::Null).await);
        assert_eq!(state["state"]["pid"], 1000);
    }

    #[tokio::test]
    async fn test_continue_streams_tracepoints() {
        let handler = handler(LOOP);
        let session = handler.sessions().create_session("test").await;
        let bp = result(
            call(
                &handler,
                &session,
                "CreateBreakpointWithExpr",
                json!({"breakpoint": {"tracepoint": true}, "loc_expr": "main.work"}),
            )
            .await,
        );
        assert_eq!(bp["breakpoint"]["id"], 1);

        let (out, mut rx) = mpsc::unbounded_channel();
        let reply = handler
            .handle_request(&session, request(7, "Continue", Value::Null), &out)
            .await;
        let state = result(reply.response);
        assert_eq!(state["state"]["exited"], true);

        let mut notes = 0;
        while let Ok(Outgoing::Notification(note)) = rx.try_recv() {
            let params = note.params.unwrap();
            assert_eq!(params["id"], 7);
            assert_eq!(params["state"]["current_thread"]["breakpoint"]["id"], 1);
            notes += 1;
        }
        assert_eq!(notes, 3);
    }

    #[tokio::test]
    async fn test_step_out_uses_session_load_config() {
        let handler = handler(LOOP);
        let session = handler.sessions().create_session("test").await;
        result(
            call(&handler, &session, "CreateBreakpoint", json!({"breakpoint": {"function_name": "main.work"}}))
                .await,
        );
        result(call(&handler, &session, "Continue", Value::Null).await);

        let state = result(call(&handler, &session, "StepOut", Value::Null).await);
        assert_eq!(state["state"]["current_thread"]["return_values"], json!([]));

        result(call(&handler, &session, "Continue", Value::Null).await);
        result(call(&handler, &session, "SetReturnValuesLoadConfig", json!({"cfg": {}})).await);
        let state = result(call(&handler, &session, "StepOut", Value::Null).await);
        assert_eq!(state["state"]["current_thread"]["return_values"][0]["value"], "11");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_halt_bypasses_command_lock() {
        let handler = handler(SPIN);
        let session = handler.sessions().create_session("test").await;

        let running = {
            let handler = handler.clone();
            let session = session.clone();
            tokio::spawn(async move {
                let (out, _rx) = mpsc::unbounded_channel();
                handler
                    .handle_request(&session, request(1, "Continue", Value::Null), &out)
                    .await
            })
        };
        while !handler.debugger().is_running() {
            tokio::task::yield_now().await;
        }

        let state = result(call(&handler, &session, "GetState", Value::Null).await);
        assert_eq!(state["state"]["running"], true);
        let halted = result(call(&handler, &session, "Halt", Value::Null).await);
        assert_eq!(halted["state"]["exited"], false);

        let reply = running.await.unwrap();
        let state = result(reply.response);
        assert_eq!(state["state"]["exited"], false);
    }

    #[tokio::test]
    async fn test_process_pid_and_stop_recording() {
        let handler = handler(LOOP);
        let session = handler.sessions().create_session("test").await;
        let pid = result(call(&handler, &session, "ProcessPid", Value::Null).await);
        assert_eq!(pid["pid"], 1000);

        // Live targets have no recording to stop.
        let response = call(&handler, &session, "StopRecording", Value::Null).await;
        assert_eq!(response.error.unwrap().code, ENGINE_ERROR);
    }

    #[tokio::test]
    async fn test_detach_requests_shutdown() {
        let handler = handler(LOOP);
        let session = handler.sessions().create_session("test").await;
        let (out, _rx) = mpsc::unbounded_channel();
        let reply = handler
            .handle_request(&session, request(1, "Detach", json!({"kill": true})), &out)
            .await;
        assert_eq!(reply.after, After::Shutdown);
        let reply = handler
            .handle_request(&session, request(2, "Disconnect", Value::Null), &out)
            .await;
        assert_eq!(reply.after, After::Close);
    }
}
