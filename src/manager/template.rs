//! Template token expander (§4.10, §9).
//!
//! Shared substitution engine for announcement, auto-ack, and
//! auto-welcome messages. Per the redesign note against stringly-typed
//! tokens, this takes an enumerated token list (well, the lookup is a
//! match on a fixed set of names) and a context record; unknown tokens
//! are preserved verbatim rather than silently dropped.

use chrono::{DateTime, Utc};

use crate::config::{Config, DistanceUnit};
use crate::store::MeshStore;

/// Everything a template token might need. Callers only populate the
/// fields relevant to the message being composed (e.g. an announcement
/// has no sender identity; an auto-ack reply does).
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub version: String,
    pub uptime_seconds: i64,
    pub enabled_features: Vec<String>,
    pub node_count: usize,
    pub direct_count: usize,
    pub node_id: String,
    pub long_name: String,
    pub short_name: String,
    pub hop_start: Option<u32>,
    pub hop_limit: Option<u32>,
    pub packet_timestamp: Option<DateTime<Utc>>,
    pub distance_unit: DistanceUnit,
}

/// `{DURATION}`: `{d}d {h}h` / `{h}h {m}m` / `{m}m` / `{s}s` (§4.10).
fn render_duration(total_seconds: i64) -> String {
    let total_seconds = total_seconds.max(0);
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m")
    } else {
        format!("{seconds}s")
    }
}

/// `{NUMBER_HOPS}`: `hopStart - hopLimit` when both valid and
/// `hopStart >= hopLimit`, else 0 (§4.10).
fn render_number_hops(hop_start: Option<u32>, hop_limit: Option<u32>) -> u32 {
    match (hop_start, hop_limit) {
        (Some(start), Some(limit)) if start >= limit => start - limit,
        _ => 0,
    }
}

/// `{RABBIT_HOPS}`: 🎯 when 0, else that many 🐇 (§4.10).
fn render_rabbit_hops(hops: u32) -> String {
    if hops == 0 {
        "🎯".to_string()
    } else {
        "🐇".repeat(hops as usize)
    }
}

fn render_token(token: &str, ctx: &TemplateContext) -> Option<String> {
    match token {
        "VERSION" => Some(ctx.version.clone()),
        "DURATION" => Some(render_duration(ctx.uptime_seconds)),
        "FEATURES" => Some(ctx.enabled_features.join(" ")),
        "NODECOUNT" => Some(ctx.node_count.to_string()),
        "DIRECTCOUNT" => Some(ctx.direct_count.to_string()),
        "NODE_ID" => Some(ctx.node_id.clone()),
        "LONG_NAME" => Some(ctx.long_name.clone()),
        "SHORT_NAME" => Some(ctx.short_name.clone()),
        "NUMBER_HOPS" => Some(render_number_hops(ctx.hop_start, ctx.hop_limit).to_string()),
        "RABBIT_HOPS" => {
            Some(render_rabbit_hops(render_number_hops(ctx.hop_start, ctx.hop_limit)))
        }
        "DATE" => Some(
            ctx.packet_timestamp
                .unwrap_or_else(Utc::now)
                .format("%Y-%m-%d")
                .to_string(),
        ),
        "TIME" => Some(
            ctx.packet_timestamp
                .unwrap_or_else(Utc::now)
                .format("%H:%M:%S")
                .to_string(),
        ),
        _ => None,
    }
}

/// Builds the sender-independent half of a [`TemplateContext`]
/// (`{NODECOUNT}`/`{DIRECTCOUNT}` need the active-node window from the
/// store; everything else is supplied by the caller). Shared by the
/// dispatch loop and both scheduler tasks so `{NODECOUNT}` means the
/// same thing in an auto-ack reply as it does in an announcement.
pub async fn build_context(
    store: &dyn MeshStore,
    max_node_age_hours: u32,
    distance_unit: DistanceUnit,
    version: String,
    uptime_seconds: i64,
    enabled_features: Vec<String>,
) -> TemplateContext {
    let mut ctx = TemplateContext {
        version,
        uptime_seconds,
        enabled_features,
        distance_unit,
        ..Default::default()
    };
    if let Ok(nodes) = store.get_active_nodes(max_node_age_hours).await {
        ctx.node_count = nodes.len();
        ctx.direct_count = nodes.iter().filter(|n| n.hops_away == Some(0)).count();
    }
    ctx
}

/// `{FEATURES}`: one emoji per enabled engine, in a fixed order.
/// Shared by the dispatch loop and the announcement scheduler so an
/// announcement and an auto-ack reply agree on what "enabled" means.
pub fn enabled_feature_emojis(config: &Config) -> Vec<String> {
    let mut features = Vec::new();
    if config.scheduler.traceroute.interval_minutes > 0 {
        features.push("\u{1F6F0}".to_string()); // satellite
    }
    if config.scheduler.announce.enabled {
        features.push("\u{1F4E2}".to_string()); // loudspeaker
    }
    if config.autoack.enabled {
        features.push("\u{1F916}".to_string()); // robot
    }
    if config.autowelcome.enabled {
        features.push("\u{1F44B}".to_string()); // wave
    }
    features
}

/// Expand every `{TOKEN}` occurrence in `template`. Tokens not in the
/// known set are left in the output verbatim (§9: "explicit, not a
/// silent bug").
pub fn expand(template: &str, ctx: &TemplateContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        match after_open.find('}') {
            Some(close) => {
                let token = &after_open[..close];
                match render_token(token, ctx) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(token);
                        out.push('}');
                    }
                }
                rest = &after_open[close + 1..];
            }
            None => {
                out.push('{');
                rest = after_open;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_only_template_round_trips_on_identical_inputs() {
        let ctx = TemplateContext {
            version: "1.2.3".to_string(),
            ..Default::default()
        };
        let rendered_once = expand("build {VERSION}", &ctx);
        let rendered_again = expand("build {VERSION}", &ctx);
        assert_eq!(rendered_once, rendered_again);
        assert_eq!(rendered_once, "build 1.2.3");
    }

    #[test]
    fn unknown_tokens_are_preserved_verbatim() {
        let ctx = TemplateContext::default();
        assert_eq!(expand("hello {NOT_A_TOKEN}!", &ctx), "hello {NOT_A_TOKEN}!");
    }

    #[test]
    fn duration_renders_largest_applicable_unit() {
        assert_eq!(render_duration(5), "5s");
        assert_eq!(render_duration(125), "2m");
        assert_eq!(render_duration(3 * 3600 + 61), "3h 1m");
        assert_eq!(render_duration(2 * 86_400 + 3661), "2d 1h");
    }

    #[test]
    fn number_hops_zero_when_start_before_limit() {
        assert_eq!(render_number_hops(Some(2), Some(5)), 0);
        assert_eq!(render_number_hops(Some(5), Some(2)), 3);
        assert_eq!(render_number_hops(None, Some(2)), 0);
    }

    #[test]
    fn rabbit_hops_uses_target_emoji_at_zero() {
        assert_eq!(render_rabbit_hops(0), "🎯");
        assert_eq!(render_rabbit_hops(3), "🐇🐇🐇");
    }
}
