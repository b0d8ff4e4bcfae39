// src/core/conflict.rs
use crate::config::{ConflictSettings, ReversePolicy, SameDirectionPolicy, UpgradePolicy};
use crate::types::{Alert, OpeningLock, Position, Tier};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    Reverse,
    Upgrade,
    SameDirection,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    Reject,
    CloseAndOpen,
    Ignore,
    Upgrade,
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConflictType::Reverse => "REVERSE",
            ConflictType::Upgrade => "UPGRADE",
            ConflictType::SameDirection => "SAME_DIRECTION",
            ConflictType::None => "NONE",
        })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Resolution::Reject => "REJECT",
            Resolution::CloseAndOpen => "CLOSE_AND_OPEN",
            Resolution::Ignore => "IGNORE",
            Resolution::Upgrade => "UPGRADE",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictAnalysis {
    pub has_conflict: bool,
    pub conflict_type: ConflictType,
    pub resolution: Resolution,
    pub reason: String,
    pub should_proceed: bool,
}

impl ConflictAnalysis {
    fn no_conflict() -> Self {
        Self {
            has_conflict: false,
            conflict_type: ConflictType::None,
            resolution: Resolution::Ignore,
            reason: "no open position on symbol".to_string(),
            should_proceed: true,
        }
    }

    fn decide(conflict_type: ConflictType, resolution: Resolution, reason: impl Into<String>) -> Self {
        Self {
            has_conflict: conflict_type != ConflictType::None,
            conflict_type,
            resolution,
            reason: reason.into(),
            should_proceed: matches!(resolution, Resolution::CloseAndOpen | Resolution::Upgrade),
        }
    }

    fn reject(conflict_type: ConflictType, reason: impl Into<String>) -> Self {
        let mut analysis = Self::decide(conflict_type, Resolution::Reject, reason);
        analysis.has_conflict = true;
        analysis
    }
}

/// What the resolver knows about the symbol when the alert arrives.
#[derive(Debug, Clone, Default)]
pub struct ConflictContext<'a> {
    pub banned: bool,
    /// Live opening lock for the alert's (symbol, side).
    pub lock: Option<&'a OpeningLock>,
    pub existing: Option<&'a Position>,
    /// Unrealized P&L of `existing` as a fraction of its margin.
    pub existing_pnl_ratio: Option<Decimal>,
}

pub fn classify(alert: &Alert, existing: &Position) -> ConflictType {
    if alert.side != existing.side {
        ConflictType::Reverse
    } else if alert.tier > existing.tier {
        ConflictType::Upgrade
    } else {
        ConflictType::SameDirection
    }
}

pub fn resolve(alert: &Alert, ctx: &ConflictContext<'_>, policy: &ConflictSettings) -> ConflictAnalysis {
    if ctx.banned {
        return ConflictAnalysis::reject(ConflictType::None, format!("{} is banned", alert.symbol));
    }
    if let Some(lock) = ctx.lock {
        return ConflictAnalysis::reject(
            ConflictType::None,
            format!(
                "{} {} is already being opened (lock {} since {})",
                alert.side, alert.symbol, lock.id, lock.created_at
            ),
        );
    }
    let Some(existing) = ctx.existing else {
        return ConflictAnalysis::no_conflict();
    };

    match classify(alert, existing) {
        ConflictType::Reverse => resolve_reverse(alert, existing, ctx.existing_pnl_ratio, policy),
        ConflictType::Upgrade => match policy.upgrade_policy {
            UpgradePolicy::Reject => {
                ConflictAnalysis::reject(ConflictType::Upgrade, "upgrade policy is reject")
            }
            UpgradePolicy::TrackConfirmation => ConflictAnalysis::decide(
                ConflictType::Upgrade,
                Resolution::Ignore,
                format!("{:?} alert tracked as confirmation of {:?} position", alert.tier, existing.tier),
            ),
            UpgradePolicy::Upgrade => ConflictAnalysis::decide(
                ConflictType::Upgrade,
                Resolution::Upgrade,
                format!("upgrading {:?} position to {:?}", existing.tier, alert.tier),
            ),
        },
        ConflictType::SameDirection => match policy.same_direction_policy {
            SameDirectionPolicy::Reject => ConflictAnalysis::reject(
                ConflictType::SameDirection,
                "same-direction policy is reject",
            ),
            SameDirectionPolicy::TrackConfirmation => ConflictAnalysis::decide(
                ConflictType::SameDirection,
                Resolution::Ignore,
                "same-direction alert tracked as confirmation",
            ),
            SameDirectionPolicy::Ignore => ConflictAnalysis::decide(
                ConflictType::SameDirection,
                Resolution::Ignore,
                "position already open in this direction",
            ),
        },
        ConflictType::None => ConflictAnalysis::no_conflict(),
    }
}

fn resolve_reverse(
    alert: &Alert,
    existing: &Position,
    pnl_ratio: Option<Decimal>,
    policy: &ConflictSettings,
) -> ConflictAnalysis {
    let kind = ConflictType::Reverse;
    if policy.reverse_policy == ReversePolicy::Reject {
        return ConflictAnalysis::reject(kind, "reverse policy is reject");
    }
    if policy.block_emergency_reversal && alert.tier == Tier::Emergency {
        return ConflictAnalysis::reject(kind, "emergency tier may not reverse a position");
    }
    if alert.strength < policy.reversal_min_strength {
        return ConflictAnalysis::reject(
            kind,
            format!(
                "strength {:.2} below reversal minimum {:.2}",
                alert.strength, policy.reversal_min_strength
            ),
        );
    }
    // A weaker tier may only override a position that is already in profit.
    if alert.tier < existing.tier {
        let ratio = pnl_ratio.unwrap_or(Decimal::ZERO);
        if ratio < policy.override_min_profit_pct {
            return ConflictAnalysis::reject(
                kind,
                format!(
                    "override needs {}% profit, existing at {:.2}%",
                    policy.override_min_profit_pct * Decimal::ONE_HUNDRED,
                    ratio * Decimal::ONE_HUNDRED
                ),
            );
        }
    }
    ConflictAnalysis::decide(
        kind,
        Resolution::CloseAndOpen,
        format!(
            "market reversal {} -> {} (strength {:.2})",
            existing.side, alert.side, alert.strength
        ),
    )
}
