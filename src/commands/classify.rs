use anyhow::Result;

use claimfleet::models::ErrorKind;
use claimfleet::resilience::{ErrorClassifier, FailureSignal, RecoveryDelay, RecoveryPolicy};
use claimfleet::utils::format_secs;

/// Run the classifier on a hand-written failure signal and show the plan
pub fn classify(
    status: Option<u16>,
    message: Option<String>,
    content: Option<String>,
    retry_count: u32,
) -> Result<()> {
    if status.is_none() && message.is_none() && content.is_none() {
        anyhow::bail!("Provide at least one of --status, --message or --content");
    }

    let signal = FailureSignal {
        http_status: status,
        message: message.as_deref(),
        page_content: content.as_deref(),
    };
    let kind = ErrorClassifier::new().classify(&signal);

    println!("{}", describe(kind, retry_count));
    Ok(())
}

fn describe(kind: ErrorKind, retry_count: u32) -> String {
    let plan = RecoveryPolicy::default().delay_for(kind, retry_count);
    let delay = match plan.delay {
        RecoveryDelay::Never => "never".to_string(),
        RecoveryDelay::RetryAfter(d) => format_secs(d.num_seconds()),
    };
    let effect = match plan.effect {
        Some(effect) => format!("{effect:?}"),
        None => "none".to_string(),
    };
    format!(
        "kind:   {kind}\naction: {}\ndelay:  {delay} (before jitter)\neffect: {effect}",
        plan.action
    )
}
