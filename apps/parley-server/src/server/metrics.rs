use std::{collections::HashMap, fmt::Write as _, hash::Hash, sync::Mutex};

use super::core::{MetricsState, METRICS_STATE};

pub(crate) const GATEWAY_DROP_REASON_FULL_QUEUE: &str = "full_queue";
pub(crate) const GATEWAY_DROP_REASON_CLOSED: &str = "closed";
pub(crate) const GATEWAY_DROP_REASON_OVERSIZED_OUTBOUND: &str = "oversized_outbound";
pub(crate) const GATEWAY_DROP_REASON_SERIALIZE_ERROR: &str = "serialize_error";

pub(crate) fn metrics_state() -> &'static MetricsState {
    METRICS_STATE.get_or_init(MetricsState::default)
}

fn snapshot<K: Clone + Eq + Hash>(counters: &Mutex<HashMap<K, u64>>) -> HashMap<K, u64> {
    counters
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone())
}

fn bump<K: Eq + Hash>(counters: &Mutex<HashMap<K, u64>>, key: K) {
    if let Ok(mut guard) = counters.lock() {
        let entry = guard.entry(key).or_insert(0);
        *entry += 1;
    }
}

fn write_header(output: &mut String, name: &str, help: &str) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
}

pub(crate) fn render_metrics() -> String {
    let state = metrics_state();
    let mut output = String::new();

    write_header(
        &mut output,
        "parley_auth_failures_total",
        "Count of auth-related failures by reason",
    );
    let mut auth_entries: Vec<_> = snapshot(&state.auth_failures).into_iter().collect();
    auth_entries.sort_by_key(|(reason, _)| *reason);
    for (reason, value) in auth_entries {
        let _ = writeln!(
            output,
            "parley_auth_failures_total{{reason=\"{reason}\"}} {value}"
        );
    }

    write_header(
        &mut output,
        "parley_rate_limit_hits_total",
        "Count of rate-limit rejections by surface",
    );
    let mut rate_entries: Vec<_> = snapshot(&state.rate_limit_hits).into_iter().collect();
    rate_entries.sort_by_key(|((surface, reason), _)| (*surface, *reason));
    for ((surface, reason), value) in rate_entries {
        let _ = writeln!(
            output,
            "parley_rate_limit_hits_total{{surface=\"{surface}\",reason=\"{reason}\"}} {value}"
        );
    }

    write_header(
        &mut output,
        "parley_ws_disconnects_total",
        "Count of websocket disconnect events by reason",
    );
    let mut ws_entries: Vec<_> = snapshot(&state.ws_disconnects).into_iter().collect();
    ws_entries.sort_by_key(|(reason, _)| *reason);
    for (reason, value) in ws_entries {
        let _ = writeln!(
            output,
            "parley_ws_disconnects_total{{reason=\"{reason}\"}} {value}"
        );
    }

    write_header(
        &mut output,
        "parley_gateway_events_emitted_total",
        "Count of gateway events emitted by scope and event type",
    );
    let mut emitted: Vec<_> = snapshot(&state.gateway_events_emitted)
        .into_iter()
        .collect();
    emitted.sort_by(|a, b| a.0.cmp(&b.0));
    for ((scope, event_type), value) in emitted {
        let _ = writeln!(
            output,
            "parley_gateway_events_emitted_total{{scope=\"{scope}\",event_type=\"{event_type}\"}} {value}"
        );
    }

    write_header(
        &mut output,
        "parley_gateway_events_dropped_total",
        "Count of gateway events dropped by scope, event type and reason",
    );
    let mut dropped: Vec<_> = snapshot(&state.gateway_events_dropped)
        .into_iter()
        .collect();
    dropped.sort_by(|a, b| a.0.cmp(&b.0));
    for ((scope, event_type, reason), value) in dropped {
        let _ = writeln!(
            output,
            "parley_gateway_events_dropped_total{{scope=\"{scope}\",event_type=\"{event_type}\",reason=\"{reason}\"}} {value}"
        );
    }

    write_header(
        &mut output,
        "parley_gateway_ingress_rejected_total",
        "Count of client gateway events ignored by event type and reason",
    );
    let mut rejected: Vec<_> = snapshot(&state.gateway_ingress_rejected)
        .into_iter()
        .collect();
    rejected.sort_by(|a, b| a.0.cmp(&b.0));
    for ((event_type, reason), value) in rejected {
        let _ = writeln!(
            output,
            "parley_gateway_ingress_rejected_total{{event_type=\"{event_type}\",reason=\"{reason}\"}} {value}"
        );
    }

    output
}

pub(crate) fn record_auth_failure(reason: &'static str) {
    bump(&metrics_state().auth_failures, reason);
}

pub(crate) fn record_rate_limit_hit(surface: &'static str, reason: &'static str) {
    bump(&metrics_state().rate_limit_hits, (surface, reason));
}

pub(crate) fn record_ws_disconnect(reason: &'static str) {
    bump(&metrics_state().ws_disconnects, reason);
}

pub(crate) fn record_gateway_event_emitted(scope: &str, event_type: &str) {
    bump(
        &metrics_state().gateway_events_emitted,
        (scope.to_owned(), event_type.to_owned()),
    );
}

pub(crate) fn record_gateway_event_dropped(scope: &str, event_type: &str, reason: &str) {
    bump(
        &metrics_state().gateway_events_dropped,
        (scope.to_owned(), event_type.to_owned(), reason.to_owned()),
    );
}

pub(crate) fn record_gateway_ingress_rejected(event_type: &str, reason: &str) {
    bump(
        &metrics_state().gateway_ingress_rejected,
        (event_type.to_owned(), reason.to_owned()),
    );
}
