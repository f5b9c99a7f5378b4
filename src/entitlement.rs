use serde::{Deserialize, Serialize};

/// key: entitlement-tiers -> free,pro,premium
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Premium,
}

impl Tier {
    /// Strict parse for caller-supplied tier names.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "free" => Some(Tier::Free),
            "pro" => Some(Tier::Pro),
            "premium" => Some(Tier::Premium),
            _ => None,
        }
    }

    /// Stored tier values normalize here, at the decode boundary. An
    /// unrecognized value resolves to `free`, never to an error.
    pub fn from_db(raw: &str) -> Self {
        Tier::parse(raw).unwrap_or(Tier::Free)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Premium => "premium",
        }
    }
}

/// key: entitlement-plan -> per-tier quota ceilings
#[derive(Debug, Clone)]
pub struct QuotaPlan {
    pub free: i64,
    pub pro: i64,
    pub premium: i64,
}

impl QuotaPlan {
    pub fn ceiling(&self, tier: Tier) -> i64 {
        match tier {
            Tier::Free => self.free,
            Tier::Pro => self.pro,
            Tier::Premium => self.premium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied { used: i64, ceiling: i64 },
}

/// Pure admission predicate. Charging is the ledger's job and happens only
/// after the gateway call succeeds, so a denied or failed attempt consumes
/// nothing.
pub fn admit(used: i64, requested_cost: i64, ceiling: i64) -> Admission {
    // Saturating: an absurd requested cost denies instead of wrapping.
    if used.saturating_add(requested_cost) <= ceiling {
        Admission::Allowed
    } else {
        Admission::Denied { used, ceiling }
    }
}

/// Deterministic pre-call cost estimate: the prompt's input-side share plus
/// the requested output budget. Must be computed before the gateway call
/// since the true cost is unknowable until after the fact.
pub fn estimate_cost(prompt: &str, max_output_units: i64) -> i64 {
    (prompt.chars().count() as i64 / 4).saturating_add(max_output_units)
}
