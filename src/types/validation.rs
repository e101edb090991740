//! Validation functions for subscription names.

use crate::error::ValidationError;
use crate::Result;

/// Validate a full subscription name: `projects/{project}/subscriptions/{subscription}`.
pub fn validate_subscription_name(name: &str) -> Result<()> {
    let parts: Vec<&str> = name.split('/').collect();
    match parts.as_slice() {
        ["projects", project, "subscriptions", subscription] => {
            if project.is_empty() {
                return Err(ValidationError::InvalidSubscriptionName(
                    "Project must not be empty".to_string(),
                )
                .into());
            }
            validate_subscription_id(subscription)
        }
        _ => Err(ValidationError::InvalidSubscriptionName(format!(
            "Expected projects/{{project}}/subscriptions/{{subscription}}, got '{}'",
            name
        ))
        .into()),
    }
}

/// Subscription ID validation (3-255 chars, must start with letter).
pub fn validate_subscription_id(subscription_id: &str) -> Result<()> {
    if subscription_id.len() < 3 || subscription_id.len() > 255 {
        return Err(ValidationError::InvalidSubscriptionName(format!(
            "Subscription ID must be 3-255 characters, got {}",
            subscription_id.len()
        ))
        .into());
    }

    if !subscription_id
        .chars()
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic())
    {
        return Err(ValidationError::InvalidSubscriptionName(
            "Subscription ID must start with a letter".to_string(),
        )
        .into());
    }

    for ch in subscription_id.chars() {
        if !ch.is_alphanumeric() && !matches!(ch, '-' | '_' | '.' | '~' | '+' | '%') {
            return Err(ValidationError::InvalidSubscriptionName(format!(
                "Subscription ID contains invalid character: '{}'",
                ch
            ))
            .into());
        }
    }

    Ok(())
}
