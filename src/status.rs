// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Derives a [`StatusSummary`] from a resource snapshot.
//!
//! Classification is table-driven: one rule function per kind,
//! defaulting to [`Status::Unknown`] for kinds without a rule.

use crate::event::{Status, StatusSummary};
use serde_json::Value;

type Rule = fn(&Value) -> StatusSummary;

/// Kind → rule table.
///
/// Rules are pure functions of the snapshot payload.
static RULES: &[(&str, Rule)] = &[
    ("Pod", pod_rule),
    ("Deployment", deployment_rule),
    ("StatefulSet", replicas_rule),
    ("DaemonSet", daemon_set_rule),
    ("ReplicaSet", replicas_rule),
    ("Node", node_rule),
    ("Job", job_rule),
    ("Event", event_rule),
    ("PersistentVolumeClaim", pvc_rule),
];

/// Derives the status summary of a snapshot.
///
/// Unknown kinds and unparsable payloads yield [`Status::Unknown`].
#[must_use]
pub fn classify(kind: &str, payload: &[u8]) -> StatusSummary {
    let Some((_, rule)) = RULES.iter().find(|(k, _)| *k == kind) else {
        return StatusSummary::new(Status::Unknown, "no classification rule");
    };

    let Ok(doc) = serde_json::from_slice::<Value>(payload) else {
        return StatusSummary::new(Status::Unknown, "unparsable snapshot");
    };

    rule(&doc)
}

fn str_at<'a>(doc: &'a Value, pointer: &str) -> Option<&'a str> {
    doc.pointer(pointer).and_then(Value::as_str)
}

fn u64_at(doc: &Value, pointer: &str) -> u64 {
    doc.pointer(pointer).and_then(Value::as_u64).unwrap_or(0)
}

/// Finds a condition object by its `type` field.
fn condition<'a>(doc: &'a Value, cond_type: &str) -> Option<&'a Value> {
    doc.pointer("/status/conditions")?
        .as_array()?
        .iter()
        .find(|c| c.pointer("/type").and_then(Value::as_str) == Some(cond_type))
}

fn pod_rule(doc: &Value) -> StatusSummary {
    // Waiting containers take precedence over the phase
    if let Some(statuses) = doc
        .pointer("/status/containerStatuses")
        .and_then(Value::as_array)
    {
        for cs in statuses {
            if let Some(reason) = cs.pointer("/state/waiting/reason").and_then(Value::as_str) {
                let status = match reason {
                    "ContainerCreating" | "PodInitializing" => Status::Warning,
                    _ => Status::Error,
                };
                return StatusSummary::new(status, reason);
            }
        }
    }

    match str_at(doc, "/status/phase") {
        Some(phase @ ("Running" | "Succeeded")) => StatusSummary::new(Status::Healthy, phase),
        Some(phase @ "Pending") => StatusSummary::new(Status::Warning, phase),
        Some(phase @ "Failed") => StatusSummary::new(Status::Error, phase),
        Some(phase) => StatusSummary::new(Status::Unknown, phase),
        None => StatusSummary::new(Status::Unknown, "no phase"),
    }
}

fn deployment_rule(doc: &Value) -> StatusSummary {
    if let Some(progressing) = condition(doc, "Progressing") {
        if progressing.pointer("/reason").and_then(Value::as_str)
            == Some("ProgressDeadlineExceeded")
        {
            return StatusSummary::new(Status::Error, "progress deadline exceeded");
        }
    }

    match condition(doc, "Available").and_then(|c| c.pointer("/status")).and_then(Value::as_str) {
        Some("True") => StatusSummary::new(Status::Healthy, "available"),
        Some(_) => StatusSummary::new(Status::Warning, "not available"),
        None => replicas_rule(doc),
    }
}

fn replicas_rule(doc: &Value) -> StatusSummary {
    let desired = u64_at(doc, "/spec/replicas");
    let ready = u64_at(doc, "/status/readyReplicas");

    if ready >= desired {
        StatusSummary::new(Status::Healthy, format!("{ready}/{desired} ready"))
    } else {
        StatusSummary::new(Status::Warning, format!("{ready}/{desired} ready"))
    }
}

fn daemon_set_rule(doc: &Value) -> StatusSummary {
    let desired = u64_at(doc, "/status/desiredNumberScheduled");
    let ready = u64_at(doc, "/status/numberReady");

    if ready >= desired {
        StatusSummary::new(Status::Healthy, format!("{ready}/{desired} ready"))
    } else {
        StatusSummary::new(Status::Warning, format!("{ready}/{desired} ready"))
    }
}

fn node_rule(doc: &Value) -> StatusSummary {
    match condition(doc, "Ready").and_then(|c| c.pointer("/status")).and_then(Value::as_str) {
        Some("True") => StatusSummary::new(Status::Healthy, "ready"),
        Some("False") => StatusSummary::new(Status::Error, "not ready"),
        Some(_) => StatusSummary::new(Status::Warning, "readiness unknown"),
        None => StatusSummary::new(Status::Unknown, "no ready condition"),
    }
}

fn job_rule(doc: &Value) -> StatusSummary {
    if u64_at(doc, "/status/failed") > 0 {
        return StatusSummary::new(Status::Error, "failed pods");
    }

    if u64_at(doc, "/status/succeeded") > 0 {
        return StatusSummary::new(Status::Healthy, "succeeded");
    }

    StatusSummary::new(Status::Healthy, "active")
}

fn event_rule(doc: &Value) -> StatusSummary {
    let reason = str_at(doc, "/reason").unwrap_or("event");

    match str_at(doc, "/type") {
        Some("Normal") => StatusSummary::new(Status::Healthy, reason),
        Some("Warning") => StatusSummary::new(Status::Warning, reason),
        _ => StatusSummary::new(Status::Unknown, reason),
    }
}

fn pvc_rule(doc: &Value) -> StatusSummary {
    match str_at(doc, "/status/phase") {
        Some(phase @ "Bound") => StatusSummary::new(Status::Healthy, phase),
        Some(phase @ "Pending") => StatusSummary::new(Status::Warning, phase),
        Some(phase @ "Lost") => StatusSummary::new(Status::Error, phase),
        Some(phase) => StatusSummary::new(Status::Unknown, phase),
        None => StatusSummary::new(Status::Unknown, "no phase"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn classify_pod_phases() {
        let healthy = br#"{"status":{"phase":"Running"}}"#;
        assert_eq!(Status::Healthy, classify("Pod", healthy).status);

        let pending = br#"{"status":{"phase":"Pending"}}"#;
        assert_eq!(Status::Warning, classify("Pod", pending).status);

        let failed = br#"{"status":{"phase":"Failed"}}"#;
        assert_eq!(Status::Error, classify("Pod", failed).status);
    }

    #[test]
    fn classify_pod_crash_loop() {
        let payload = br#"{
            "status": {
                "phase": "Running",
                "containerStatuses": [
                    {"state": {"waiting": {"reason": "CrashLoopBackOff"}}}
                ]
            }
        }"#;

        let summary = classify("Pod", payload);
        assert_eq!(Status::Error, summary.status);
        assert_eq!("CrashLoopBackOff", summary.message);
    }

    #[test]
    fn classify_node_conditions() {
        let ready = br#"{"status":{"conditions":[{"type":"Ready","status":"True"}]}}"#;
        assert_eq!(Status::Healthy, classify("Node", ready).status);

        let not_ready = br#"{"status":{"conditions":[{"type":"Ready","status":"False"}]}}"#;
        assert_eq!(Status::Error, classify("Node", not_ready).status);
    }

    #[test]
    fn classify_deployment_available() {
        let available =
            br#"{"status":{"conditions":[{"type":"Available","status":"True"}]}}"#;
        assert_eq!(Status::Healthy, classify("Deployment", available).status);

        let stalled = br#"{"status":{"conditions":[
            {"type":"Available","status":"False"},
            {"type":"Progressing","status":"False","reason":"ProgressDeadlineExceeded"}
        ]}}"#;
        assert_eq!(Status::Error, classify("Deployment", stalled).status);
    }

    #[test]
    fn classify_event_type() {
        let warning = br#"{"type":"Warning","reason":"FailedScheduling"}"#;
        let summary = classify("Event", warning);
        assert_eq!(Status::Warning, summary.status);
        assert_eq!("FailedScheduling", summary.message);
    }

    #[test]
    fn classify_unknown_kind() {
        assert_eq!(Status::Unknown, classify("FluxCapacitor", b"{}").status);
    }

    #[test]
    fn classify_garbage_payload() {
        assert_eq!(Status::Unknown, classify("Pod", b"not json").status);
    }
}
