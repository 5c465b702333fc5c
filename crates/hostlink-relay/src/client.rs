//! Observer-side subcommands: one-shot submit/reset and a reconnecting watch.

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use hostlink_core::args::parse_scalar;
use hostlink_core::protocol::{
    decode_envelope, encode_message, ErrorPayload, ResetPayload, SubmitPayload, WireEnvelope,
    WireMsg, DEFAULT_MAX_FRAME_BYTES,
};
use hostlink_core::{next_backoff, GapTracker, Observation, INITIAL_BACKOFF};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLIENT_SENDER_ID: &str = "hostlink-cli";

async fn connect(url: &Url) -> Result<WsStream> {
    let (ws, _) = connect_async(url.clone())
        .await
        .with_context(|| format!("connect to {url}"))?;
    Ok(ws)
}

async fn send(ws: &mut WsStream, msg: WireMsg, request_id: Option<String>) -> Result<()> {
    let envelope = WireEnvelope::new(CLIENT_SENDER_ID, msg).with_request_id(request_id);
    let text = encode_message(&envelope, DEFAULT_MAX_FRAME_BYTES)?;
    ws.send(Message::Text(text)).await.context("send frame")?;
    Ok(())
}

/// Next decodable envelope, or `None` once the relay closes the socket.
async fn next_envelope(ws: &mut WsStream) -> Result<Option<WireEnvelope>> {
    while let Some(frame) = ws.next().await {
        let data = match frame.context("read frame")? {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => return Ok(None),
            _ => continue,
        };
        match decode_envelope(&data) {
            Ok(envelope) => return Ok(Some(envelope)),
            Err(err) => warn!(event = "message_invalid", error = %err),
        }
    }
    Ok(None)
}

fn request_id(prefix: &str) -> String {
    format!(
        "{prefix}-{}-{}",
        std::process::id(),
        chrono::Utc::now().timestamp_millis()
    )
}

/// Submits one command and returns the seq the relay assigned to it.
pub async fn run_submit(
    url: &Url,
    cmd: &str,
    raw_params: &[String],
    wait: Duration,
) -> Result<u64> {
    let params = raw_params.iter().map(|raw| parse_scalar(raw)).collect();
    let mut ws = connect(url).await?;
    let request_id = request_id("submit");
    send(
        &mut ws,
        WireMsg::Submit(SubmitPayload {
            cmd: cmd.to_string(),
            params,
        }),
        Some(request_id.clone()),
    )
    .await?;

    let answer = tokio::time::timeout(wait, await_answer(&mut ws, &request_id)).await;
    let _ = ws.close(None).await;
    match answer {
        Ok(result) => result,
        Err(_) => bail!("no answer from relay within {}ms", wait.as_millis()),
    }
}

async fn await_answer(ws: &mut WsStream, request_id: &str) -> Result<u64> {
    loop {
        let Some(envelope) = next_envelope(ws).await? else {
            bail!("relay closed the connection");
        };
        if envelope.request_id.as_deref() != Some(request_id) {
            continue;
        }
        match envelope.msg {
            WireMsg::Accepted(payload) => return Ok(payload.seq),
            WireMsg::Rejected(payload) => bail!("rejected: {}", payload.reason.as_str()),
            WireMsg::Error(payload) => bail!("{}: {}", payload.code, payload.message),
            _ => {}
        }
    }
}

async fn await_refusal(ws: &mut WsStream, request_id: &str) -> Result<Option<ErrorPayload>> {
    while let Some(envelope) = next_envelope(ws).await? {
        if envelope.request_id.as_deref() != Some(request_id) {
            continue;
        }
        if let WireMsg::Error(payload) = envelope.msg {
            return Ok(Some(payload));
        }
    }
    Ok(None)
}

/// Asks the agent to resynchronize. Only a `no_agent` refusal is reported;
/// completion shows up as a status with `lastAck` -1.
pub async fn run_reset(url: &Url, wait: Duration) -> Result<()> {
    let mut ws = connect(url).await?;
    let request_id = request_id("reset");
    send(
        &mut ws,
        WireMsg::Reset(ResetPayload::default()),
        Some(request_id.clone()),
    )
    .await?;

    let refusal = tokio::time::timeout(wait, await_refusal(&mut ws, &request_id)).await;
    let _ = ws.close(None).await;
    if let Ok(result) = refusal {
        if let Some(payload) = result? {
            bail!("{}: {}", payload.code, payload.message);
        }
    }
    Ok(())
}

/// Prints every broadcast as one line until the process is stopped.
pub async fn run_watch(url: &Url) -> Result<()> {
    let mut tracker = GapTracker::new();
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let mut ws = match connect(url).await {
            Ok(ws) => ws,
            Err(err) => {
                warn!(
                    event = "relay_connect_error",
                    error = %err,
                    retry_ms = backoff.as_millis() as u64
                );
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff);
                continue;
            }
        };
        backoff = INITIAL_BACKOFF;
        info!(event = "watch_connected", url = %url);

        loop {
            match next_envelope(&mut ws).await {
                Ok(Some(envelope)) => {
                    if let WireMsg::Output(payload) = &envelope.msg {
                        report_observation(payload.seq, tracker.observe(payload.seq));
                    }
                    println!("{}", render_line(&envelope.msg));
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(event = "watch_read_error", error = %err);
                    break;
                }
            }
        }
        warn!(event = "watch_disconnected", retry_ms = backoff.as_millis() as u64);
        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff);
    }
}

fn report_observation(seq: u64, observation: Observation) {
    match observation {
        Observation::InOrder => {}
        Observation::Gap { from, to } => warn!(event = "output_gap", from = from, to = to),
        Observation::Duplicate => warn!(event = "output_duplicate", seq = seq),
        Observation::OutOfOrder => warn!(event = "output_out_of_order", seq = seq),
        Observation::Restart => info!(event = "output_restart"),
    }
}

/// `"<type> <payload json>"`
pub fn render_line(msg: &WireMsg) -> String {
    match serde_json::to_value(msg) {
        Ok(value) => format!("{} {}", msg.kind(), value["payload"]),
        Err(_) => msg.kind().to_string(),
    }
}
