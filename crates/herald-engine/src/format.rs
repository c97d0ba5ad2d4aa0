use herald_core::{AccessState, SourceEvent, SourceName};

use crate::pending::Admission;

/// Destination message size limit, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4000;

#[derive(Clone, Debug)]
pub struct FormatOptions {
    pub show_timestamp: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            show_timestamp: true,
        }
    }
}

/// Render an event as the multi-line message posted into its thread.
pub fn format_event(event: &SourceEvent, opts: &FormatOptions) -> String {
    let mut lines = Vec::with_capacity(4);
    if !event.channel_name.trim().is_empty() {
        lines.push(format!("📢 #{}", sanitize(&event.channel_name)));
    }
    if opts.show_timestamp {
        lines.push(format!("📅 {}", event.timestamp.format("%Y-%m-%d %H:%M:%S")));
    }
    lines.push(format!("👤 {}", sanitize(&event.author)));
    lines.push(format!("💬 {}", sanitize(&event.content)));
    lines.join("\n")
}

/// Drop control characters other than newline and tab.
pub fn sanitize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Split `text` into pieces of at most `max` characters. A piece ends at
/// its last newline only when that keeps at least half of `max`; otherwise
/// it is cut at the limit.
pub fn chunk_text(text: &str, max: usize) -> Vec<String> {
    if max == 0 {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.chars().count() > max {
        let hard = rest
            .char_indices()
            .nth(max)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let cut = match rest[..hard].rfind('\n') {
            Some(nl) if rest[..=nl].chars().count() >= max / 2 => nl + 1,
            _ => hard,
        };
        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// Operator notice posted into a freshly admitted source's thread.
pub fn admission_notice(admission: &Admission) -> String {
    let mut lines = vec![format!(
        "🔔 Monitoring started for {} ({} of {} channels reachable)",
        display(&admission.source),
        admission.reachable(),
        admission.channels.len()
    )];
    for (id, name) in &admission.channels {
        let state = admission
            .access
            .get(id)
            .copied()
            .unwrap_or(AccessState::Unknown);
        lines.push(format!("  #{} · {}", sanitize(name), state.label()));
    }
    lines.join("\n")
}

fn display(source: &SourceName) -> String {
    sanitize(source.as_str())
}
