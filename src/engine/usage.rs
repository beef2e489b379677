//! Context-window usage extraction

use serde_json::Value;

use crate::agent::TurnResult;
use crate::types::session::{ContextUsage, UsageSource};

/// Rough characters-per-token ratio used when nothing was reported
const CHARS_PER_TOKEN: u64 = 4;

/// Work out context-window consumption for a finished turn
///
/// Preference order: the per-model entry for `model`, the first per-model
/// entry, the aggregate usage block, and finally an estimate from
/// `prompt_chars` and `response_chars`. The first-entry fallback exists for
/// providers that report a different model id than the one requested; it is
/// tagged [`UsageSource::FirstModelEntry`] and logged so it is never mistaken
/// for an exact figure.
#[must_use]
pub fn extract_context_usage(
    result: &TurnResult,
    model: Option<&str>,
    default_window: u64,
    prompt_chars: usize,
    response_chars: usize,
) -> ContextUsage {
    if let Some(entries) = result.model_usage.as_ref().and_then(Value::as_object)
        && let Some((first_key, first_entry)) = entries.iter().next()
    {
        let (entry, source) = match model.and_then(|m| entries.get(m)) {
            Some(entry) => (entry, UsageSource::ExactModel),
            None => {
                log::warn!(
                    "No usage entry for model {}; using entry for {first_key} instead",
                    model.unwrap_or("<unknown>")
                );
                (first_entry, UsageSource::FirstModelEntry)
            }
        };
        let input = field(entry, "inputTokens")
            + field(entry, "cacheReadInputTokens")
            + field(entry, "cacheCreationInputTokens");
        let window = entry
            .get("contextWindow")
            .and_then(Value::as_u64)
            .filter(|w| *w > 0)
            .unwrap_or(default_window);
        return build(input, field(entry, "outputTokens"), window, source);
    }

    if let Some(usage) = result.usage.as_ref().filter(|u| u.is_object()) {
        let input = field(usage, "input_tokens")
            + field(usage, "cache_read_input_tokens")
            + field(usage, "cache_creation_input_tokens");
        return build(
            input,
            field(usage, "output_tokens"),
            default_window,
            UsageSource::Aggregate,
        );
    }

    let prompt = estimate_tokens(prompt_chars);
    let response = estimate_tokens(response_chars);
    build(
        prompt + response,
        response,
        default_window,
        UsageSource::Estimated,
    )
}

fn field(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn estimate_tokens(chars: usize) -> u64 {
    (chars as u64).div_ceil(CHARS_PER_TOKEN)
}

fn build(input_tokens: u64, output_tokens: u64, context_window: u64, source: UsageSource) -> ContextUsage {
    let context_percentage = if context_window == 0 {
        0.0
    } else {
        (input_tokens as f64 * 1000.0 / context_window as f64).round() / 10.0
    };
    ContextUsage {
        input_tokens,
        output_tokens,
        context_window,
        context_percentage,
        source,
    }
}
