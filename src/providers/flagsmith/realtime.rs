//! Flagsmith realtime updates.
//!
//! The realtime service pushes `{"updated_at": <epoch seconds>}` whenever the environment changes.
//! The listener keeps an SSE connection open, reconnecting with jittered exponential backoff, and
//! asks its [`RealtimeSink`] to refetch whenever a newer timestamp arrives.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use eventsource_stream::{Event, Eventsource};
use futures::StreamExt;
use rand::{thread_rng, Rng};
use reqwest::{header, Url};
use serde::Deserialize;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{Error, Result};

/// Receives refetch requests from the listener.
pub(crate) trait RealtimeSink: Send + Sync + 'static {
    fn refetch(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

#[derive(Debug, Clone)]
pub(crate) struct RealtimeConfig {
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_jitter: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        RealtimeConfig {
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_jitter: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EnvironmentUpdated {
    updated_at: f64,
}

/// A running realtime subscription. Dropping it stops the background task.
pub(crate) struct RealtimeListener {
    task_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

/// `{realtime_url}sse/environments/{environment_key}/stream`
pub(crate) fn stream_url(realtime_url: &str, environment_key: &str) -> Result<Url> {
    crate::document::directory_url(realtime_url)?
        .join(&format!("sse/environments/{}/stream", environment_key))
        .map_err(Error::InvalidBaseUrl)
}

impl RealtimeListener {
    /// Spawn the listener on the current tokio runtime.
    pub fn start(stream_url: Url, sink: Arc<dyn RealtimeSink>, config: RealtimeConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let task_handle = tokio::spawn(run_loop(stream_url, sink, config, shutdown_rx));
        RealtimeListener {
            task_handle: Some(task_handle),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Stop the listener and wait for the task to exit.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            // The task may have exited already, in which case nobody is listening.
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for RealtimeListener {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

async fn run_loop(
    stream_url: Url,
    sink: Arc<dyn RealtimeSink>,
    config: RealtimeConfig,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let client = reqwest::Client::new();
    let mut last_updated_at: Option<f64> = None;
    let mut consecutive_failures: u32 = 0;

    loop {
        log::debug!(target: "flagswitch", url:display = stream_url; "connecting to Flagsmith realtime");

        let connection = connect_and_process(&client, &stream_url, sink.as_ref(), &mut last_updated_at);
        let outcome = tokio::select! {
            outcome = connection => outcome,
            _ = shutdown_rx.recv() => {
                log::debug!(target: "flagswitch", "realtime listener received stop command");
                return;
            }
        };

        match outcome {
            Ok(()) => {
                log::debug!(target: "flagswitch", "realtime stream ended");
                consecutive_failures = 0;
            }
            Err(err) => {
                log::warn!(target: "flagswitch", "realtime connection failed: {}", err);
                consecutive_failures = consecutive_failures.saturating_add(1);
            }
        }

        let delay = backoff(&config, consecutive_failures);
        log::debug!(target: "flagswitch", delay_ms = delay.as_millis() as u64; "reconnecting to Flagsmith realtime");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.recv() => {
                log::debug!(target: "flagswitch", "realtime listener received stop command");
                return;
            }
        }
    }
}

async fn connect_and_process(
    client: &reqwest::Client,
    stream_url: &Url,
    sink: &dyn RealtimeSink,
    last_updated_at: &mut Option<f64>,
) -> Result<()> {
    let response = client
        .get(stream_url.clone())
        .header(header::ACCEPT, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::UnexpectedStatus {
            service: "flagsmith realtime",
            status: status.as_u16(),
        });
    }

    let mut events = response.bytes_stream().eventsource();
    while let Some(event) = events.next().await {
        let event = event.map_err(|err| Error::Stream(err.to_string()))?;
        if is_newer(&event, last_updated_at) {
            sink.refetch().await;
        }
    }

    Ok(())
}

/// Whether `event` announces an update newer than `last_updated_at`, recording it if so.
fn is_newer(event: &Event, last_updated_at: &mut Option<f64>) -> bool {
    if event.data.trim().is_empty() {
        return false;
    }
    let updated_at = match serde_json::from_str::<EnvironmentUpdated>(&event.data) {
        Ok(update) => update.updated_at,
        Err(err) => {
            log::debug!(target: "flagswitch", "ignoring realtime message: {:?}", err);
            return false;
        }
    };
    match *last_updated_at {
        Some(last) if updated_at <= last => false,
        _ => {
            *last_updated_at = Some(updated_at);
            true
        }
    }
}

fn backoff(config: &RealtimeConfig, consecutive_failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(consecutive_failures.min(10));
    let delay = config
        .reconnect_base_delay
        .saturating_mul(factor)
        .min(config.reconnect_max_delay);
    jitter(delay, config.reconnect_jitter)
}

/// Apply a random jitter to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    interval + thread_rng().gen_range(Duration::ZERO..jitter)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use eventsource_stream::Event;

    use super::{backoff, is_newer, stream_url, RealtimeConfig};

    fn event(data: &str) -> Event {
        Event {
            event: "message".to_owned(),
            data: data.to_owned(),
            id: String::new(),
            retry: None,
        }
    }

    #[test]
    fn builds_stream_url() {
        assert_eq!(
            stream_url("https://realtime.flagsmith.com", "ser.abc").unwrap().as_str(),
            "https://realtime.flagsmith.com/sse/environments/ser.abc/stream"
        );
    }

    #[test]
    fn only_newer_updates_trigger_refetch() {
        let mut last = None;
        assert!(is_newer(&event(r#"{"updated_at": 100.5}"#), &mut last));
        assert!(!is_newer(&event(r#"{"updated_at": 100.5}"#), &mut last));
        assert!(!is_newer(&event(r#"{"updated_at": 99}"#), &mut last));
        assert!(!is_newer(&event("ping"), &mut last));
        assert!(!is_newer(&event(""), &mut last));
        assert!(is_newer(&event(r#"{"updated_at": 101}"#), &mut last));
        assert_eq!(last, Some(101.0));
    }

    #[test]
    fn backoff_is_capped() {
        let config = RealtimeConfig {
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_jitter: Duration::ZERO,
        };
        assert_eq!(backoff(&config, 0), Duration::from_secs(1));
        assert_eq!(backoff(&config, 3), Duration::from_secs(8));
        assert_eq!(backoff(&config, 40), Duration::from_secs(30));
    }
}
