//! `switchboard run`: worker pool plus a line-delimited JSON ingress on stdin.
//!
//! Each stdin line is an inbound event:
//!
//! ```json
//! {"external_id":"msg-1","sender_id":"5511987654321@s.whatsapp.net","payload":{"kind":"text","text":"oi"}}
//! ```
//!
//! Replies are written to stdout as `{"to": ..., "text": ...}` lines.

use std::{sync::Arc, time::Duration};

use {
    anyhow::Context,
    async_trait::async_trait,
    clap::Args,
    switchboard_common::{InboundEvent, MessagePayload, now_ms},
    switchboard_config::{SwitchboardConfig, validate},
    switchboard_metrics::{MetricsRecorderConfig, init_metrics},
    switchboard_pipeline::{
        Admission, Ingress, Processor, ReplySender, Services, WorkerOptions, WorkerPool,
    },
    tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    tracing::{debug, info, warn},
};

#[derive(Args)]
pub struct RunArgs {
    /// Text prepended to every echoed reply.
    #[arg(long, default_value = "")]
    reply_prefix: String,

    /// Exit once stdin is closed and no job is pending or active.
    #[arg(long)]
    exit_when_idle: bool,
}

/// Replies with the message text (or media caption).
struct EchoProcessor {
    prefix: String,
}

#[async_trait]
impl Processor for EchoProcessor {
    async fn process(&self, _sender_id: &str, payload: &MessagePayload) -> anyhow::Result<String> {
        Ok(match payload.as_text() {
            Some(text) if !text.trim().is_empty() => format!("{}{text}", self.prefix),
            _ => String::new(),
        })
    }
}

struct StdoutSender;

#[async_trait]
impl ReplySender for StdoutSender {
    async fn send(&self, destination_id: &str, text: &str) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(&serde_json::json!({ "to": destination_id, "text": text }))?;
        line.push(b'\n');
        let mut stdout = tokio::io::stdout();
        stdout.write_all(&line).await?;
        stdout.flush().await?;
        Ok(())
    }
}

pub async fn run(config: &SwitchboardConfig, args: RunArgs) -> anyhow::Result<()> {
    let validation = validate(config);
    for d in &validation.diagnostics {
        warn!(path = %d.path, severity = %d.severity, "{}", d.message);
    }
    if validation.has_errors() {
        anyhow::bail!("configuration has errors, see `switchboard config check`");
    }

    let metrics = init_metrics(MetricsRecorderConfig {
        enabled: config.metrics.enabled,
        global_labels: config.metrics.labels.clone().into_iter().collect(),
    })?;

    let services = Services::open_sqlite(config)
        .await
        .context("failed to open the shared store")?;
    let handle = WorkerPool::new(
        services.clone(),
        Arc::new(EchoProcessor {
            prefix: args.reply_prefix,
        }),
        Arc::new(StdoutSender),
        WorkerOptions::from(config),
    )
    .start();
    let ingress = services.ingress();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut idle_check = tokio::time::interval(Duration::from_millis(250));
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            _ = &mut interrupt => {
                info!("interrupt received, shutting down");
                break;
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => ingest(&ingress, &line).await,
                Ok(None) => {
                    debug!("stdin closed");
                    stdin_open = false;
                },
                Err(e) => {
                    warn!(error = %e, "stdin read failed, no more events will be admitted");
                    stdin_open = false;
                },
            },
            _ = idle_check.tick(), if args.exit_when_idle && !stdin_open => {
                if services.queue.counts().await?.in_flight() == 0 {
                    info!("stdin closed and queue drained");
                    break;
                }
            },
        }
    }

    handle.shutdown().await;
    if config.metrics.enabled {
        let rendered = metrics.render();
        if !rendered.is_empty() {
            eprintln!("{rendered}");
        }
    }
    services.close().await;
    Ok(())
}

async fn ingest(ingress: &Ingress, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let event = match parse_event(line) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "ignoring malformed event line");
            return;
        },
    };
    match ingress.admit(&event).await {
        Ok(Admission::Admitted(job_id)) => {
            debug!(external_id = %event.external_id, job_id = %job_id, "event queued");
        },
        Ok(Admission::Duplicate) => {},
        Ok(Admission::Rejected(reason)) => {
            warn!(external_id = %event.external_id, reason = %reason, "event rejected");
        },
        Err(e) => warn!(external_id = %event.external_id, error = %e, "event admission failed"),
    }
}

/// Parse one stdin line. `received_at_ms` defaults to now.
fn parse_event(line: &str) -> anyhow::Result<InboundEvent> {
    let mut value: serde_json::Value = serde_json::from_str(line)?;
    if let Some(fields) = value.as_object_mut() {
        fields
            .entry("received_at_ms")
            .or_insert_with(|| serde_json::json!(now_ms()));
    }
    Ok(serde_json::from_value(value)?)
}
