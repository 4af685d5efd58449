// Connection serving
//
// Newline-delimited JSON-RPC over any async byte stream. Requests of one
// connection run concurrently so `Halt` can reach a running `Continue`;
// responses and notifications go through a single writer task.

use crate::config::{ServerConfig, Transport};
use crate::handlers::{After, RequestHandler};
use crate::protocol::*;
use anyhow::Result;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// The client closed the stream or sent `Disconnect`.
    Closed,
    /// `Detach` ended the debugging session.
    Shutdown,
}

pub async fn serve_connection<R, W>(
    handler: RequestHandler,
    reader: R,
    writer: W,
    peer: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<ConnectionEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let session = handler.sessions().create_session(peer).await;
    info!(
        "Client connected: {} ({}), {} sessions open",
        peer,
        session,
        handler.sessions().count().await
    );

    let (out, mut rx) = mpsc::unbounded_channel::<Outgoing>();
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    error!("Encoding response failed: {}", e);
                    continue;
                }
            };
            debug!("Sending: {}", text);
            if writer.write_all(text.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
                || writer.flush().await.is_err()
            {
                warn!("Client stream closed while writing");
                break;
            }
        }
    });

    let (end_tx, mut end_rx) = watch::channel(None::<ConnectionEnd>);
    let mut lines = BufReader::new(reader).lines();
    let end = loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break ConnectionEnd::Closed,
                    Err(e) => {
                        error!("Read error: {}", e);
                        break ConnectionEnd::Closed;
                    }
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                debug!("Received: {}", line);
                dispatch(&handler, &session, line, &out, &end_tx);
            }
            _ = end_rx.changed() => {
                if let Some(end) = *end_rx.borrow() {
                    break end;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break ConnectionEnd::Shutdown;
                }
            }
        }
    };

    let remaining = handler.sessions().remove_session(&session).await;
    info!("Client {} gone ({:?}), {} sessions remain", session, end, remaining);
    drop(out);
    // Requests still in flight hold the writer open; give them a moment to flush.
    match tokio::time::timeout(WRITER_DRAIN, writer_task).await {
        Ok(Err(e)) => warn!("Writer task failed: {}", e),
        Err(_) => debug!("Writer for {} still busy, leaving it behind", session),
        Ok(Ok(())) => {}
    }
    Ok(end)
}

/// Parse one line and run it; requests are answered from their own task.
fn dispatch(
    handler: &RequestHandler,
    session: &str,
    line: &str,
    out: &mpsc::UnboundedSender<Outgoing>,
    end_tx: &watch::Sender<Option<ConnectionEnd>>,
) {
    let value = match serde_json::from_str::<Value>(line) {
        Ok(value) => value,
        Err(e) => {
            error!("Parse error: {}", e);
            let error = JsonRpcError::new(PARSE_ERROR, "Parse error");
            let _ = out.send(Outgoing::Response(JsonRpcResponse::failure(Value::Null, error)));
            return;
        }
    };

    // Discriminate by id field
    if value.get("id").is_none() {
        match serde_json::from_value::<JsonRpcNotification>(value) {
            Ok(notification) => {
                let handler = handler.clone();
                tokio::spawn(async move { handler.handle_notification(notification).await });
            }
            Err(e) => error!("Invalid notification: {}", e),
        }
        return;
    }

    let request = match serde_json::from_value::<JsonRpcRequest>(value) {
        Ok(request) => request,
        Err(e) => {
            error!("Invalid request: {}", e);
            let error = JsonRpcError::new(INVALID_REQUEST, "Invalid request");
            let _ = out.send(Outgoing::Response(JsonRpcResponse::failure(Value::Null, error)));
            return;
        }
    };

    let handler = handler.clone();
    let session = session.to_string();
    let out = out.clone();
    let end_tx = end_tx.clone();
    tokio::spawn(async move {
        let reply = handler.handle_request(&session, request, &out).await;
        let _ = out.send(Outgoing::Response(reply.response));
        match reply.after {
            After::Continue => {}
            After::Close => {
                let _ = end_tx.send(Some(ConnectionEnd::Closed));
            }
            After::Shutdown => {
                let _ = end_tx.send(Some(ConnectionEnd::Shutdown));
            }
        }
    });
}

/// Halt and kill the target once no client will come back for it.
async fn end_session(handler: &RequestHandler) {
    let debugger = handler.debugger().clone();
    let result = tokio::task::spawn_blocking(move || debugger.detach(true)).await;
    match result {
        Ok(Ok(())) => info!("Target killed"),
        Ok(Err(e)) => warn!("Killing target failed: {}", e),
        Err(e) => warn!("Detach task failed: {}", e),
    }
}

/// Serve the configured transport until the debugging session ends.
pub async fn run(config: &ServerConfig, handler: RequestHandler) -> Result<()> {
    match config.transport {
        Transport::Stdio => {
            let (_tx, shutdown) = watch::channel(false);
            let end = serve_connection(
                handler.clone(),
                tokio::io::stdin(),
                tokio::io::stdout(),
                "stdio",
                shutdown,
            )
            .await?;
            debug!("Stdio session ended: {:?}", end);
            end_session(&handler).await;
            Ok(())
        }
        Transport::Tcp => {
            let listener = TcpListener::bind(&config.listen).await?;
            info!("Listening on {}", listener.local_addr()?);
            serve_tcp(listener, handler).await
        }
    }
}

pub async fn serve_tcp(listener: TcpListener, handler: RequestHandler) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut shutdown = shutdown_rx.clone();

    loop {
        let (stream, addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };
        let peer = addr.to_string();
        let (reader, writer) = stream.into_split();

        if !handler.multi_client() {
            // One client: the session ends with the connection.
            serve_connection(handler.clone(), reader, writer, &peer, shutdown_rx.clone()).await?;
            break;
        }

        let handler = handler.clone();
        let shutdown_tx = shutdown_tx.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            match serve_connection(handler, reader, writer, &peer, shutdown_rx).await {
                Ok(ConnectionEnd::Shutdown) => {
                    let _ = shutdown_tx.send(true);
                }
                Ok(ConnectionEnd::Closed) => {}
                Err(e) => error!("Connection {} failed: {}", peer, e),
            }
        });
    }

    end_session(&handler).await;
    info!("Server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use loupe_core::{Debugger, DebuggerConfig, SimLauncher};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    const PROGRAM: &str = r#"{
        "functions": [
            {"name": "main.main", "file": "/src/main.go", "line": 3, "body": [
                {"line": 4, "ops": [{"op": "nop"}]}
            ]}
        ]
    }"#;

    fn handler(multi_client: bool) -> RequestHandler {
        let launcher = SimLauncher::new();
        launcher.set_source("/src/prog.json", PROGRAM);
        let debugger = Debugger::launch(
            Arc::new(launcher),
            "/src/prog.json",
            Vec::new(),
            DebuggerConfig::default(),
        )
        .unwrap();
        RequestHandler::new(debugger, multi_client)
    }

    async fn exchange<S>(lines: &mut tokio::io::Lines<BufReader<S>>, writer: &mut (impl AsyncWrite + Unpin), message: Value) -> Value
    where
        S: AsyncRead + Unpin,
    {
        let text = format!("{}\n", message);
        writer.write_all(text.as_bytes()).await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_stream_roundtrip_and_protocol_errors() {
        let handler = handler(false);
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (_tx, shutdown) = watch::channel(false);
        let serving = tokio::spawn(serve_connection(
            handler,
            server_read,
            server_write,
            "test",
            shutdown,
        ));

        let (client_read, mut client_write) = tokio::io::split(client);
        let mut lines = BufReader::new(client_read).lines();

        let response = exchange(
            &mut lines,
            &mut client_write,
            json!({"jsonrpc": "2.0", "id": 1, "method": "GetState"}),
        )
        .await;
        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["state"]["pid"], 1000);

        client_write.write_all(b"{not json\n").await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["error"]["code"], PARSE_ERROR);

        let response = exchange(
            &mut lines,
            &mut client_write,
            json!({"jsonrpc": "2.0", "id": 2, "method": "Disconnect"}),
        )
        .await;
        assert_eq!(response["id"], 2);
        assert_eq!(serving.await.unwrap().unwrap(), ConnectionEnd::Closed);
    }

    #[tokio::test]
    async fn test_tcp_single_client_kills_target_on_close() {
        let handler = handler(false);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let debugger = handler.debugger().clone();
        let serving = tokio::spawn(serve_tcp(listener, handler));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let response = exchange(
            &mut lines,
            &mut write,
            json!({"jsonrpc": "2.0", "id": "a", "method": "IsMulticlient"}),
        )
        .await;
        assert_eq!(response["result"]["is_multiclient"], false);
        drop(write);
        drop(lines);

        serving.await.unwrap().unwrap();
        assert!(debugger.continue_execution().is_err());
    }

    #[tokio::test]
    async fn test_tcp_multi_client_detach_stops_server() {
        let handler = handler(true);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = tokio::spawn(serve_tcp(listener, handler));

        // First client leaves; the target stays for the next one.
        let first = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = first.into_split();
        let mut lines = BufReader::new(read).lines();
        exchange(
            &mut lines,
            &mut write,
            json!({"jsonrpc": "2.0", "id": 1, "method": "CreateBreakpoint", "params": {"loc_expr": "main.go:4"}}),
        )
        .await;
        exchange(
            &mut lines,
            &mut write,
            json!({"jsonrpc": "2.0", "id": 2, "method": "Disconnect"}),
        )
        .await;

        let second = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = second.into_split();
        let mut lines = BufReader::new(read).lines();
        let response = exchange(
            &mut lines,
            &mut write,
            json!({"jsonrpc": "2.0", "id": 3, "method": "ListBreakpoints"}),
        )
        .await;
        assert_eq!(response["result"]["breakpoints"].as_array().unwrap().len(), 1);

        exchange(
            &mut lines,
            &mut write,
            json!({"jsonrpc": "2.0", "id": 4, "method": "Detach", "params": {"kill": true}}),
        )
        .await;
        serving.await.unwrap().unwrap();
    }
}
