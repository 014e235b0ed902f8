// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event levels and the JSON fragments shared by every event: the
//! device/os/gpu contexts derived from system metrics, and the message
//! and exception payload shapes.

use adk_common::metrics::SystemMetrics;
use serde_json::{json, Value};

/// Severity, ascending. Events below a reporter's configured minimum are
/// dropped before they reach the send queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventLevel {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Debug => "debug",
            EventLevel::Info => "info",
            EventLevel::Warning => "warning",
            EventLevel::Error => "error",
            EventLevel::Fatal => "fatal",
        }
    }
}

impl core::fmt::Display for EventLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The shared `contexts` object: device, os and gpu sections built from
/// the host-provided metrics.
pub fn contexts_from_metrics(metrics: &SystemMetrics) -> Value {
    json!({
        "device": {
            "name": metrics.device,
            "model": metrics.device_class.label(),
            "model_id": metrics.device_id,
            "arch": metrics.cpu,
            "memory_size": metrics.main_memory_mbytes,
            "num_cores": metrics.num_cores,
            "num_threads": metrics.num_hardware_threads,
        },
        "os": {
            "name": metrics.software,
            "version": metrics.revision,
        },
        "gpu": {
            "name": metrics.gpu,
            "memory_size": metrics.video_memory_mbytes,
        },
    })
}

/// Adds `{message: {formatted: <text>}}` to an event.
pub fn append_message(event: &mut Value, message: &str) {
    event["message"] = json!({ "formatted": message });
}

/// Adds the exception payload: one value with a type, a message, and an
/// optional stack of instruction addresses.
pub fn append_exception(
    event: &mut Value,
    error_type: &str,
    error_message: &str,
    stacktrace: &[usize],
) {
    let mut value = json!({
        "type": error_type,
        "value": error_message,
    });
    if !stacktrace.is_empty() {
        let frames: Vec<Value> = stacktrace
            .iter()
            .map(|addr| json!({ "instruction_addr": format!("{addr:#x}") }))
            .collect();
        value["stacktrace"] = json!({ "frames": frames });
    }
    event["exception"] = json!({ "values": [value] });
}
