//! Alert report construction.
//!
//! Pure: takes a [`Detection`] plus whatever control-plane context could be
//! resolved and produces a webhook body. Missing context degrades fields to
//! `unknown` rather than failing.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

use crate::config::MAX_RECENT_ACCOUNT_DAYS;
use crate::detect::signatures::is_startup_noise;
use crate::detect::Detection;
use crate::platform::{Node, Server, User};

/// Embed colour for reports on recently created accounts.
pub const COLOR_NEW_ACCOUNT: u32 = 0xE7_4C_3C;
pub const COLOR_DEFAULT: u32 = 0xE6_7E_22;

/// Evidence entries shown per list.
const MAX_EVIDENCE: usize = 5;
/// Trailing log lines included in the excerpt.
const EXCERPT_LINES: usize = 15;
/// Webhook embed field values are capped at this many characters.
const FIELD_LIMIT: usize = 1024;

/// Control-plane context for the scanned server. Every part is optional.
#[derive(Debug, Clone, Default)]
pub struct ReportContext {
    pub server: Option<Server>,
    pub user: Option<User>,
    pub node: Option<Node>,
}

#[derive(Debug, Clone)]
pub struct AlertReport {
    pub title: String,
    pub color: u32,
    pub new_account: bool,
    pub fields: Vec<(String, String)>,
    pub footer: String,
    pub timestamp: DateTime<Utc>,
}

impl AlertReport {
    pub fn build(
        detection: &Detection,
        context: &ReportContext,
        recent_account_days: i64,
        now: DateTime<Utc>,
    ) -> Self {
        let new_account = context
            .user
            .as_ref()
            .is_some_and(|u| is_recent_account(u, recent_account_days, now));

        let server_name = context
            .server
            .as_ref()
            .map(|s| s.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| detection.volume_id.clone());
        let title = if new_account {
            format!("[NEW ACCOUNT] Abuse detected on {}", server_name)
        } else {
            format!("Abuse detected on {}", server_name)
        };

        let mut fields = vec![
            ("Server".to_string(), server_field(detection, context.server.as_ref())),
            ("Owner".to_string(), owner_field(context.user.as_ref(), now)),
            (
                "Node".to_string(),
                context
                    .node
                    .as_ref()
                    .map(|n| n.name.clone())
                    .unwrap_or_else(|| "unknown".to_string()),
            ),
            ("Container".to_string(), format!("`{}`", detection.container_id)),
            ("Detection Types".to_string(), types_field(detection)),
            ("Metrics".to_string(), metrics_field(detection)),
        ];

        push_evidence(&mut fields, "Processes", &detection.processes, |p| {
            format!("`{}` {} (matched `{}`)", p.pid, p.command, p.pattern)
        });
        push_evidence(&mut fields, "Files", &detection.files, |f| {
            format!("`{}`: {} ({} bytes)", f.path, f.reason, f.size)
        });
        push_evidence(&mut fields, "Package Manager Artifacts", &detection.cache, |c| {
            format!("`{}`: {}", c.path, c.reason)
        });
        push_evidence(&mut fields, "Bot Dependencies", &detection.npm, |n| {
            format!("`{}` in `{}`", n.package, n.path)
        });
        push_evidence(&mut fields, "Network", &detection.network, |n| {
            format!("{}: {} bytes (threshold {})", n.reason, n.bytes, n.threshold)
        });
        push_evidence(&mut fields, "Suspicious Content", &detection.suspicious_content, |c| {
            format!("`{}`: {}", c.path, c.matches.join(", "))
        });
        push_evidence(&mut fields, "Hash Matches", &detection.hash_matches, |h| {
            format!("`{}`: {} ({})", h.path, h.detection_type, short_hash(&h.hash))
        });

        if let Some(excerpt) = log_excerpt(&detection.logs) {
            fields.push(("Log Excerpt".to_string(), excerpt));
        }

        for (_, value) in fields.iter_mut() {
            clip(value, FIELD_LIMIT);
        }

        Self {
            title,
            color: if new_account { COLOR_NEW_ACCOUNT } else { COLOR_DEFAULT },
            new_account,
            fields,
            footer: format!("Detection {}", detection.id),
            timestamp: detection.created_at,
        }
    }

    /// Webhook body with a single embed.
    pub fn to_webhook_payload(&self) -> Value {
        let fields: Vec<Value> = self
            .fields
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value, "inline": false }))
            .collect();
        json!({
            "embeds": [{
                "title": self.title,
                "color": self.color,
                "fields": fields,
                "footer": { "text": self.footer },
                "timestamp": self.timestamp.to_rfc3339(),
            }]
        })
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Whether the account was created less than `days` days before `now`.
pub fn is_recent_account(user: &User, days: i64, now: DateTime<Utc>) -> bool {
    match user.created_at {
        Some(created) => {
            let window = Duration::days(days.clamp(0, MAX_RECENT_ACCOUNT_DAYS));
            now.signed_duration_since(created) < window
        }
        None => false,
    }
}

/// Distinct types with their occurrence counts, first-seen order.
pub fn type_counts(detection: &Detection) -> Vec<(&str, usize)> {
    detection
        .distinct_types()
        .into_iter()
        .map(|t| (t, detection.types.iter().filter(|x| *x == t).count()))
        .collect()
}

/// The last lines of the log tail, or `None` when it is empty or looks like
/// ordinary server startup.
pub fn log_excerpt(logs: &str) -> Option<String> {
    if logs.trim().is_empty() || is_startup_noise(logs) {
        return None;
    }
    let lines: Vec<&str> = logs.lines().collect();
    let start = lines.len().saturating_sub(EXCERPT_LINES);
    Some(format!("```\n{}\n```", lines[start..].join("\n")))
}

fn server_field(detection: &Detection, server: Option<&Server>) -> String {
    match server {
        Some(s) => format!("{} (`{}`, id {})", s.name, s.identifier, s.id),
        None => format!("unknown (volume `{}`)", detection.volume_id),
    }
}

fn owner_field(user: Option<&User>, now: DateTime<Utc>) -> String {
    let Some(user) = user else {
        return "unknown".to_string();
    };
    let age = match user.created_at {
        Some(created) => format!("{} days", now.signed_duration_since(created).num_days()),
        None => "unknown".to_string(),
    };
    format!("{} <{}>\nAccount age: {}", user.username, user.email, age)
}

fn types_field(detection: &Detection) -> String {
    if detection.types.is_empty() {
        return "none".to_string();
    }
    type_counts(detection)
        .into_iter()
        .map(|(t, n)| if n > 1 { format!("- {} (x{})", t, n) } else { format!("- {}", t) })
        .collect::<Vec<_>>()
        .join("\n")
}

fn metrics_field(detection: &Detection) -> String {
    let m = &detection.metrics;
    format!(
        "CPU: {:.1}%\nMemory: {:.1} MB\nNetwork: {:.1} MB\nVolume: {:.1} MB",
        m.cpu_percent, m.memory_mb, m.network_mb, detection.volume_size
    )
}

fn push_evidence<T>(
    fields: &mut Vec<(String, String)>,
    name: &str,
    items: &[T],
    render: impl Fn(&T) -> String,
) {
    if items.is_empty() {
        return;
    }
    let mut lines: Vec<String> = items.iter().take(MAX_EVIDENCE).map(render).collect();
    if items.len() > MAX_EVIDENCE {
        lines.push(format!("... and {} more", items.len() - MAX_EVIDENCE));
    }
    fields.push((name.to_string(), lines.join("\n")));
}

fn short_hash(hash: &str) -> &str {
    hash.get(..16).unwrap_or(hash)
}

fn clip(value: &mut String, max_chars: usize) {
    if value.chars().count() <= max_chars {
        return;
    }
    let cut: String = value.chars().take(max_chars - 3).collect();
    *value = format!("{}...", cut);
}
