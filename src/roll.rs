//! Dice-roll engine collaborator interface.
//!
//! The expression engine itself lives outside this crate; the ingress path
//! only needs `process_roll` to resolve a `/roll` command into display text
//! before persisting it as a dice-roll message.

use async_trait::async_trait;

use crate::error::Result;

/// A resolved dice roll.
#[derive(Debug, Clone)]
pub struct RollResult {
    /// The expression as submitted (e.g. `2d6+3`).
    pub expression: String,
    /// Evaluated total, when the engine resolved the expression.
    pub total: Option<i64>,
    /// Human-readable breakdown for the transcript.
    pub detail: String,
}

impl RollResult {
    /// Transcript rendering of the roll.
    #[must_use]
    pub fn render(&self, user: &str) -> String {
        match self.total {
            Some(total) => format!("{user} rolls {}: {} = {total}", self.expression, self.detail),
            None => format!("{user} rolls {}: {}", self.expression, self.detail),
        }
    }
}

/// Dice expression engine contract.
#[async_trait]
pub trait RollEngine: Send + Sync {
    /// Evaluate `expr` for `user` under the named ruleset.
    async fn process_roll(&self, expr: &str, user: &str, ruleset: &str) -> Result<RollResult>;
}

/// Engine used when no real expression engine is wired in: echoes the
/// expression unresolved so the transcript still records the intent.
pub struct PassthroughRollEngine;

#[async_trait]
impl RollEngine for PassthroughRollEngine {
    async fn process_roll(&self, expr: &str, _user: &str, _ruleset: &str) -> Result<RollResult> {
        let expression = expr.trim().to_owned();
        Ok(RollResult {
            detail: "(unresolved)".to_owned(),
            total: None,
            expression,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[tokio::test]
    async fn passthrough_echoes_expression() {
        let result = PassthroughRollEngine
            .process_roll(" 2d6+3 ", "Ayla", "5e")
            .await
            .unwrap();
        assert_eq!(result.expression, "2d6+3");
        assert!(result.total.is_none());
        assert_eq!(result.render("Ayla"), "Ayla rolls 2d6+3: (unresolved)");
    }

    #[test]
    fn resolved_roll_renders_total() {
        let result = RollResult {
            expression: "1d20".to_owned(),
            total: Some(17),
            detail: "[17]".to_owned(),
        };
        assert_eq!(result.render("Ayla"), "Ayla rolls 1d20: [17] = 17");
    }
}
