//! Trade narratives with a deterministic fallback.

use tracing::warn;

use crate::ports::{NarrativeContext, NarrativePort};
use crate::retry::{retry, RetryPolicy};

/// Templated narrative used whenever the generator is unavailable
pub fn fallback_narrative(context: &NarrativeContext) -> String {
    let risk = (context.entry.as_decimal() - context.stop.as_decimal()).abs();
    let reward = (context.target.as_decimal() - context.entry.as_decimal()).abs();
    let ratio = reward.checked_div(risk).map_or(reward, |ratio| ratio.round_dp(2));

    format!(
        "{} {} {} on the {} timeframe: entry {}, stop {}, target {} (reward/risk {}).",
        context.side, context.quantity, context.symbol, context.timeframe,
        context.entry, context.stop, context.target, ratio
    )
}

/// Ask the generator for a narrative, retrying transient failures under
/// `policy`; fall back to the template on any remaining error, empty text
/// or deadline. Never fails.
pub async fn narrate_or_fallback(
    narrator: &dyn NarrativePort,
    context: &NarrativeContext,
    policy: &RetryPolicy,
) -> String {
    match retry(policy, "narrate", |_| narrator.narrate(context)).await {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => {
            warn!(symbol = %context.symbol, "Narrative generator returned empty text, using template");
            fallback_narrative(context)
        }
        Err(e) => {
            warn!(symbol = %context.symbol, error = %e, "Narrative generator unavailable, using template");
            fallback_narrative(context)
        }
    }
}
