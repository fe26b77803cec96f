//! Auto-welcome engine (§4.10, I8).
//!
//! On first genuine `NodeInfo` from a previously unseen or unnamed
//! node, emits a one-shot templated welcome and marks the node
//! welcomed. Idempotent: `welcomedAt` gates every subsequent call.

use crate::config::{AutoWelcomeConfig, WelcomeTarget};

use super::template::{self, TemplateContext};

pub struct AutoWelcomeInput {
    pub is_local_node: bool,
    pub already_welcomed: bool,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
}

pub struct AutoWelcomeReply {
    pub text: String,
    pub target: WelcomeTarget,
}

fn is_placeholder_name(name: &Option<String>) -> bool {
    match name {
        None => true,
        Some(value) => value.trim().is_empty(),
    }
}

/// Decide whether to send a welcome for this `NodeInfo`. Returns `None`
/// when gating fails; callers that get `Some` are responsible for
/// sending the reply and then calling the store's `upsertNode` with
/// `welcomedAt` set (idempotency lives in the store row, not here).
pub fn evaluate(
    config: &AutoWelcomeConfig,
    input: &AutoWelcomeInput,
    mut ctx: TemplateContext,
) -> Option<AutoWelcomeReply> {
    if !config.enabled || input.is_local_node || input.already_welcomed {
        return None;
    }

    if config.wait_for_name
        && (is_placeholder_name(&input.long_name) || is_placeholder_name(&input.short_name))
    {
        return None;
    }

    ctx.long_name = input.long_name.clone().unwrap_or_default();
    ctx.short_name = input.short_name.clone().unwrap_or_default();
    let text = template::expand(&config.message, &ctx);

    Some(AutoWelcomeReply {
        text,
        target: config.target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AutoWelcomeConfig {
        AutoWelcomeConfig {
            enabled: true,
            wait_for_name: true,
            message: "welcome {LONG_NAME}".to_string(),
            target: WelcomeTarget::Channel,
        }
    }

    #[test]
    fn welcomes_once_when_name_is_present() {
        let input = AutoWelcomeInput {
            is_local_node: false,
            already_welcomed: false,
            long_name: Some("Alice".to_string()),
            short_name: Some("AL".to_string()),
        };
        let reply = evaluate(&config(), &input, TemplateContext::default());
        assert_eq!(reply.unwrap().text, "welcome Alice");
    }

    #[test]
    fn idempotent_once_already_welcomed() {
        let input = AutoWelcomeInput {
            is_local_node: false,
            already_welcomed: true,
            long_name: Some("Alice".to_string()),
            short_name: Some("AL".to_string()),
        };
        assert!(evaluate(&config(), &input, TemplateContext::default()).is_none());
    }

    #[test]
    fn waits_for_non_placeholder_name_when_configured() {
        let input = AutoWelcomeInput {
            is_local_node: false,
            already_welcomed: false,
            long_name: None,
            short_name: None,
        };
        assert!(evaluate(&config(), &input, TemplateContext::default()).is_none());
    }

    #[test]
    fn never_welcomes_local_node() {
        let input = AutoWelcomeInput {
            is_local_node: true,
            already_welcomed: false,
            long_name: Some("Me".to_string()),
            short_name: Some("ME".to_string()),
        };
        assert!(evaluate(&config(), &input, TemplateContext::default()).is_none());
    }
}
