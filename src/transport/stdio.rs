//! Newline-delimited JSON bridge.
//!
//! Reads one `CommandEnvelope` per line and writes `ResponseEnvelope`s, one
//! per line, in the order they are produced. One connection is one UI
//! instance: it is resolved when the connection opens and disposed when the
//! input closes, which releases every request it still owns.
//!
//! Stdout is reserved for the protocol; diagnostics go to stderr.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::controller::Controller;
use crate::error::{BridgeError, Result};
use crate::rpc::contract::{CommandEnvelope, ResponseEnvelope};
use crate::rpc::registry::bounded_push_fn;

/// Request id used for lines that carry no usable request id.
pub const PARSE_ERROR_ID: &str = "parse-error";

/// Serve the protocol over stdin/stdout until stdin closes.
pub async fn run_stdio_bridge(controller: Arc<Controller>, config: &BridgeConfig) -> Result<()> {
    let instance_id = format!("stdio-{}", uuid::Uuid::new_v4());
    serve_connection(
        controller,
        &instance_id,
        tokio::io::stdin(),
        tokio::io::stdout(),
        config,
    )
    .await
}

/// Serve the protocol over an arbitrary byte stream pair.
///
/// Each command runs on its own task, so a slow stream never blocks the
/// reader. At most `request_capacity` commands are dispatched concurrently.
pub async fn serve_connection<R, W>(
    controller: Arc<Controller>,
    instance_id: &str,
    reader: R,
    writer: W,
    config: &BridgeConfig,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.response_capacity.max(1));
    let shutdown = CancellationToken::new();
    let writer_handle = tokio::spawn(run_writer(BufWriter::new(writer), rx, shutdown.clone()));

    controller.resolve_instance(instance_id);
    let permits = Arc::new(Semaphore::new(config.request_capacity.max(1)));
    let reader_result = run_reader(
        &controller,
        instance_id,
        BufReader::new(reader),
        &tx,
        &permits,
    )
    .await;

    controller.dispose_instance(instance_id);
    drop(tx);
    shutdown.cancel();
    match writer_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "response writer failed"),
        Err(e) => tracing::warn!(error = %e, "response writer task panicked"),
    }
    reader_result
}

async fn run_reader<R>(
    controller: &Arc<Controller>,
    instance_id: &str,
    mut reader: BufReader<R>,
    tx: &mpsc::Sender<ResponseEnvelope>,
    permits: &Arc<Semaphore>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let bytes_read = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| BridgeError::Channel(format!("failed to read command line: {e}")))?;
        if bytes_read == 0 {
            tracing::info!(instance_id = %instance_id, "input closed; shutting down connection");
            return Ok(());
        }

        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }

        let envelope = match CommandEnvelope::decode(trimmed) {
            Ok(envelope) => envelope,
            Err(e) => {
                let request_id = e.request_id.as_deref().unwrap_or(PARSE_ERROR_ID);
                tracing::warn!(
                    request_id = %request_id,
                    error = %e,
                    raw_line = %String::from_utf8_lossy(trimmed),
                    "rejecting undecodable command line"
                );
                if tx.send(ResponseEnvelope::error(request_id, e.message)).await.is_err() {
                    return Err(BridgeError::Channel("response writer is gone".to_owned()));
                }
                continue;
            }
        };

        let permit = Arc::clone(permits)
            .acquire_owned()
            .await
            .map_err(|e| BridgeError::Channel(format!("command limiter closed: {e}")))?;
        let controller = Arc::clone(controller);
        let instance_id = instance_id.to_owned();
        let push = bounded_push_fn(tx.clone());
        tokio::spawn(async move {
            let _permit = permit;
            controller.handle_command(&instance_id, envelope, push).await;
        });
    }
}

async fn run_writer<W>(
    mut writer: BufWriter<W>,
    mut rx: mpsc::Receiver<ResponseEnvelope>,
    shutdown: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let response = tokio::select! {
            biased;
            response = rx.recv() => response,
            () = shutdown.cancelled() => break,
        };
        match response {
            Some(response) => write_response(&mut writer, &response).await?,
            None => return Ok(()),
        }
    }

    // Connection is closing: write whatever is already queued, then stop.
    while let Ok(response) = rx.try_recv() {
        write_response(&mut writer, &response).await?;
    }
    Ok(())
}

async fn write_response<W>(writer: &mut BufWriter<W>, response: &ResponseEnvelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_string(response)
        .map_err(|e| BridgeError::Contract(format!("failed to serialize response: {e}")))?;
    write_line(writer, &json).await
}

/// Write a single JSON line and flush.
async fn write_line<W>(writer: &mut BufWriter<W>, json: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| BridgeError::Channel(format!("failed to write response: {e}")))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| BridgeError::Channel(format!("failed to write newline: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| BridgeError::Channel(format!("failed to flush output: {e}")))?;
    Ok(())
}
