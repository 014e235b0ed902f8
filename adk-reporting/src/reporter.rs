// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The reporter: one instance per reporting sink. Owns the DSN-derived
//! endpoint, the per-instance tag list, the captured system metrics and
//! the send queue; [Reporter::tick] drains the queue into HTTP POSTs.

use crate::client::HttpClient;
use crate::event::{append_exception, append_message, contexts_from_metrics, EventLevel};
use crate::send_queue::{epoch_secs, FlushMode, SendQueue};
use adk_common::crypto::{generate_uuid, uuid_simple_string};
use adk_common::metrics::SystemMetrics;
use adk_common::url::{parse_href, UrlParseError};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Client identifier reported in the auth header.
pub const SENTRY_CLIENT: &str = "adk_reporting_sentry";
pub const SENTRY_VERSION: &str = "7";
pub const SENTRY_PLATFORM: &str = "native";

/// 429 responses asking for a longer delay than this are not retried.
const MAX_RETRY_DELAY_SECS: u64 = 60 * 5;

const X_SENTRY_AUTH: HeaderName = HeaderName::from_static("x-sentry-auth");

#[derive(Debug, Error)]
pub enum ReporterError {
    #[error("invalid reporting dsn: {0}")]
    InvalidDsn(#[from] UrlParseError),
    #[error("reporting dsn is missing the public key")]
    DsnMissingKey,
    #[error("reporting dsn is missing the project id")]
    DsnMissingProject,
}

/// Call-site information carried into the event's `transaction` field,
/// usually captured with the [crate::origin!] macro.
#[derive(Clone, Copy, Debug)]
pub struct EventOrigin {
    pub file: &'static str,
    pub function: &'static str,
    pub line: u32,
}

pub struct ReporterOptions {
    /// `scheme://public_key@host[:port]/project_id`.
    pub dsn: String,
    /// Uploaded as the event's `logger` field.
    pub reporter_name: String,
    pub min_report_level: EventLevel,
    pub send_queue_size: usize,
    /// Release identifier, e.g. `adk-core@1.0.0`.
    pub release: String,
}

/// Observes every terminal event outcome; test and embedder seam.
pub type SentStatusHook = Box<dyn Fn(bool, Option<&str>) + Send + Sync>;

/// Replaces the HTTP client entirely: receives the endpoint, the
/// prepared headers and the serialized body.
pub type SendOverride = Box<dyn Fn(&str, &HeaderMap, &[u8]) + Send + Sync>;

pub struct Reporter {
    client: Arc<dyn HttpClient>,
    send_queue: SendQueue,
    endpoint: String,
    hostname: String,
    auth_header: String,
    reporter_name: String,
    release: String,
    min_report_level: EventLevel,
    metrics: SystemMetrics,
    contexts: Value,
    tags: Mutex<Vec<(String, String)>>,
    sent_status: Option<SentStatusHook>,
    override_send: Option<SendOverride>,
}

impl Reporter {
    pub fn new(
        options: ReporterOptions,
        client: Arc<dyn HttpClient>,
        metrics: SystemMetrics,
    ) -> Result<Self, ReporterError> {
        let dsn = parse_href(&options.dsn)?;
        let public_key = dsn.auth.joined.clone().ok_or(ReporterError::DsnMissingKey)?;
        let project = dsn
            .path
            .pathname
            .clone()
            .filter(|path| path.len() > 1)
            .ok_or(ReporterError::DsnMissingProject)?;

        // {origin}/api/{project_id}/store/
        let endpoint = format!("{}/api{}/store/", dsn.origin, project);
        let auth_header = format!(
            "Sentry sentry_key={public_key},sentry_version={SENTRY_VERSION},sentry_client={SENTRY_CLIENT}"
        );

        let reporter = Self {
            client,
            send_queue: SendQueue::new(options.send_queue_size),
            endpoint,
            hostname: dsn.host.joined.clone(),
            auth_header,
            reporter_name: options.reporter_name,
            release: options.release,
            min_report_level: options.min_report_level,
            contexts: contexts_from_metrics(&metrics),
            metrics,
            tags: Mutex::new(Vec::new()),
            sent_status: None,
            override_send: None,
        };
        reporter.push_tag("partner", &reporter.metrics.partner.clone());
        reporter.push_tag("config", &reporter.metrics.config.clone());
        Ok(reporter)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn auth_header(&self) -> &str {
        &self.auth_header
    }

    /// Observe send outcomes (delivered / dropped / requeued / skipped).
    pub fn set_sent_status_hook(&mut self, hook: SentStatusHook) {
        self.sent_status = Some(hook);
    }

    /// Intercept fully built requests instead of posting them.
    pub fn set_override_send(&mut self, hook: SendOverride) {
        self.override_send = Some(hook);
    }

    fn tags(&self) -> MutexGuard<'_, Vec<(String, String)>> {
        self.tags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets an instance tag. Pushing an existing key replaces its value;
    /// new keys append to the tail of the list.
    pub fn push_tag(&self, key: &str, value: &str) {
        let mut tags = self.tags();
        match tags.iter_mut().find(|(existing, _)| existing == key) {
            Some((_, existing_value)) => *existing_value = value.to_owned(),
            None => tags.push((key.to_owned(), value.to_owned())),
        }
    }

    fn notify_sent_status(&self, success: bool, message: Option<&str>) {
        if let Some(hook) = &self.sent_status {
            hook(success, message);
        }
    }

    fn build_event(
        &self,
        origin: EventOrigin,
        level: EventLevel,
        call_tags: &[(&str, &str)],
    ) -> Value {
        let mut event = json!({
            "event_id": uuid_simple_string(&generate_uuid()),
            "release": self.release,
            "environment": self.metrics.tenancy,
            "platform": SENTRY_PLATFORM,
            "logger": self.reporter_name,
            "level": level.as_str(),
            "timestamp": epoch_secs(),
            "transaction": format!("{}::{}.{}", origin.file, origin.function, origin.line),
            "contexts": self.contexts.clone(),
        });

        let instance_tags = self.tags();
        if !instance_tags.is_empty() || !call_tags.is_empty() {
            let mut tags = serde_json::Map::new();
            for (key, value) in instance_tags.iter() {
                tags.insert(key.clone(), Value::String(value.clone()));
            }
            for (key, value) in call_tags {
                tags.insert((*key).to_owned(), Value::String((*value).to_owned()));
            }
            event["tags"] = Value::Object(tags);
        }
        event
    }

    /// Builds and enqueues a message event. Events below the configured
    /// minimum level are dropped here.
    pub fn report_msg(
        &self,
        origin: EventOrigin,
        level: EventLevel,
        call_tags: &[(&str, &str)],
        message: &str,
    ) {
        if level < self.min_report_level {
            self.notify_sent_status(false, Some("level below minimum report level, skipping upload"));
            return;
        }
        let mut event = self.build_event(origin, level, call_tags);
        append_message(&mut event, message);
        if self.send_queue.enqueue(event).is_some() {
            debug!("send queue full, evicted the oldest event");
        }
    }

    /// Builds and enqueues an exception event with an optional stack of
    /// instruction addresses.
    #[allow(clippy::too_many_arguments)]
    pub fn report_exception(
        &self,
        origin: EventOrigin,
        level: EventLevel,
        call_tags: &[(&str, &str)],
        error_type: &str,
        error_message: &str,
        stacktrace: &[usize],
    ) {
        if level < self.min_report_level {
            self.notify_sent_status(false, Some("level below minimum report level, skipping upload"));
            return;
        }
        let mut event = self.build_event(origin, level, call_tags);
        append_exception(&mut event, error_type, error_message, stacktrace);
        if self.send_queue.enqueue(event).is_some() {
            debug!("send queue full, evicted the oldest event");
        }
    }

    /// Drains the send queue (unless paused) and posts each event.
    /// Returns whether events are still pending.
    pub fn tick(&self) -> bool {
        for event in self.send_queue.flush(FlushMode::RegardPause) {
            self.post_event(event);
        }
        !self.send_queue.is_empty()
    }

    pub fn is_send_queue_empty(&self) -> bool {
        self.send_queue.is_empty()
    }

    fn post_event(&self, event: Value) {
        let body = match serde_json::to_vec(&event) {
            Ok(body) => body,
            Err(err) => {
                // Serialization failures are swallowed after logging.
                error!(%err, "failed to serialize event, dropping it");
                self.notify_sent_status(false, Some("failed to serialize event"));
                return;
            }
        };

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(&body.len().to_string()) {
            headers.insert(CONTENT_LENGTH, value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.auth_header) {
            headers.insert(X_SENTRY_AUTH, value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.hostname) {
            headers.insert(HOST, value);
        }

        if let Some(hook) = &self.override_send {
            hook(&self.endpoint, &headers, &body);
            self.notify_sent_status(true, Some("override send hook was used"));
            return;
        }

        match self.client.post(&self.endpoint, &headers, &body) {
            Err(err) => {
                error!(%err, endpoint = %self.endpoint, "event upload failed in transport, dropping event");
                self.notify_sent_status(false, Some("event upload failed in transport"));
            }
            Ok(response) if response.status == 200 => {
                self.notify_sent_status(true, None);
            }
            Ok(response) if response.status == 429 => match retry_delay_secs(&response.headers) {
                Some(delay) => {
                    warn!(delay, "server rate limited the reporter, requeueing event");
                    self.send_queue.pause_for(delay);
                    self.send_queue.enqueue(event);
                    self.notify_sent_status(
                        false,
                        Some("server is rate limited, event requeued"),
                    );
                }
                None => {
                    warn!("rate limited without a usable Retry-After, dropping event");
                    self.notify_sent_status(
                        false,
                        Some("rate limited without a usable retry delay, event dropped"),
                    );
                }
            },
            Ok(response) => {
                error!(
                    status = response.status,
                    "event upload failed, the event will not be resent"
                );
                let message = format!(
                    "event upload failed with HTTP code {}, the event will not be resent",
                    response.status
                );
                self.notify_sent_status(false, Some(message.as_str()));
            }
        }
    }
}

/// Extracts an acceptable retry delay from a 429 response. Delays beyond
/// [MAX_RETRY_DELAY_SECS] disqualify the retry.
fn retry_delay_secs(headers: &HeaderMap) -> Option<u64> {
    let delay: u64 = headers
        .get(http::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;
    (delay <= MAX_RETRY_DELAY_SECS).then_some(delay)
}
