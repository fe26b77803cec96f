//! Auto-acknowledge engine (§4.10, §3 `AutoAckRegexCache`).
//!
//! Gates on global enable, channel allow-list or DM toggle, never acks
//! the local node or a non-text port, then replies with the
//! token-expanded template — on a DM (dropping `replyId`) when
//! `useDM` is set, otherwise mirrored back on the same channel.

use regex::Regex;

use crate::config::AutoAckConfig;

use super::template::{self, TemplateContext};

/// One inbound text message as the auto-ack engine needs to see it.
pub struct AutoAckInput<'a> {
    pub text: &'a str,
    pub channel: i32,
    pub is_from_local_node: bool,
    pub packet_id: u32,
}

/// Where to route an engine-composed reply.
pub struct AutoAckReply {
    pub text: String,
    pub channel: i32,
    pub destination: Option<u32>,
    pub reply_id: Option<u32>,
}

/// Compiled-regex cache keyed by pattern string (§3). Recomputed only
/// when the configured pattern changes.
#[derive(Default)]
pub struct AutoAckRegexCache {
    compiled: Option<(String, Regex)>,
}

impl AutoAckRegexCache {
    fn get_or_compile(&mut self, pattern: &str) -> Option<&Regex> {
        let needs_recompile = match &self.compiled {
            Some((cached_pattern, _)) => cached_pattern != pattern,
            None => true,
        };
        if needs_recompile {
            match Regex::new(pattern) {
                Ok(re) => self.compiled = Some((pattern.to_string(), re)),
                Err(e) => {
                    log::warn!("auto-ack regex {:?} failed to compile: {}", pattern, e);
                    self.compiled = None;
                    return None;
                }
            }
        }
        self.compiled.as_ref().map(|(_, re)| re)
    }
}

/// Decide whether (and how) to reply to one inbound text message.
/// `sender` carries the identity tokens (`{NODE_ID}`/`{LONG_NAME}`/`{SHORT_NAME}`)
/// used by the reply template.
pub fn evaluate(
    config: &AutoAckConfig,
    cache: &mut AutoAckRegexCache,
    input: &AutoAckInput,
    mut sender_ctx: TemplateContext,
) -> Option<AutoAckReply> {
    if !config.enabled || input.is_from_local_node {
        return None;
    }

    let is_dm = input.channel < 0;
    let channel_allowed = !is_dm && config.channels.contains(&input.channel);
    let dm_allowed = is_dm && config.direct_messages;
    if !(channel_allowed || dm_allowed) {
        return None;
    }

    let pattern = cache.get_or_compile(&config.regex)?;
    if !pattern.is_match(input.text) {
        return None;
    }

    let body = template::expand(&config.message, &sender_ctx);

    if config.use_dm {
        Some(AutoAckReply {
            text: body,
            channel: -1,
            destination: None, // filled by caller from the sender's node num
            reply_id: None,
        })
    } else if is_dm {
        Some(AutoAckReply {
            text: body,
            channel: -1,
            destination: None,
            reply_id: None,
        })
    } else {
        Some(AutoAckReply {
            text: body,
            channel: input.channel,
            destination: None,
            reply_id: Some(input.packet_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AutoAckConfig {
        AutoAckConfig {
            enabled: true,
            regex: "^(test|ping)".to_string(),
            channels: vec![0],
            direct_messages: false,
            message: "ack".to_string(),
            use_dm: false,
        }
    }

    #[test]
    fn replies_on_allowed_channel_with_matching_text() {
        let mut cache = AutoAckRegexCache::default();
        let input = AutoAckInput {
            text: "ping me",
            channel: 0,
            is_from_local_node: false,
            packet_id: 7,
        };
        let reply = evaluate(&config(), &mut cache, &input, TemplateContext::default());
        assert!(reply.is_some());
        assert_eq!(reply.unwrap().reply_id, Some(7));
    }

    #[test]
    fn no_reply_on_disallowed_channel() {
        let mut cache = AutoAckRegexCache::default();
        let input = AutoAckInput {
            text: "ping me",
            channel: 1,
            is_from_local_node: false,
            packet_id: 7,
        };
        assert!(evaluate(&config(), &mut cache, &input, TemplateContext::default()).is_none());
    }

    #[test]
    fn no_reply_on_dm_when_dm_disabled() {
        let mut cache = AutoAckRegexCache::default();
        let input = AutoAckInput {
            text: "ping",
            channel: -1,
            is_from_local_node: false,
            packet_id: 7,
        };
        assert!(evaluate(&config(), &mut cache, &input, TemplateContext::default()).is_none());
    }

    #[test]
    fn never_acks_local_node() {
        let mut cache = AutoAckRegexCache::default();
        let input = AutoAckInput {
            text: "ping",
            channel: 0,
            is_from_local_node: true,
            packet_id: 7,
        };
        assert!(evaluate(&config(), &mut cache, &input, TemplateContext::default()).is_none());
    }
}
