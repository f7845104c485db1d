use chrono::NaiveDate;
use std::fmt;
use tracing::debug;

use crate::store::{decode_set, decode_usage, StateStore, StoreError, Table, UsageRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub requester_id: String,
    pub chat_id: String,
    pub target_id: String,
    pub region: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    GroupNotAllowed,
    TargetAlreadyUsed,
    DailyLimitReached,
    NotAuthorized,
    MissingTarget,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DenyReason::GroupNotAllowed => "group not allowed",
            DenyReason::TargetAlreadyUsed => "target already used today",
            DenyReason::DailyLimitReached => "daily limit reached",
            DenyReason::NotAuthorized => "not authorized",
            DenyReason::MissingTarget => "target id missing",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow { vip: bool },
    Deny(DenyReason),
}

/// The configured owner identity. Every privileged comparison goes through
/// [`Owner::is_owner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner(String);

impl Owner {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    pub fn id(&self) -> &str {
        &self.0
    }

    pub fn is_owner(&self, id: &str) -> bool {
        !self.0.is_empty() && self.0 == id.trim()
    }
}

pub struct AuthorizationGate {
    owner: Owner,
    daily_limit: usize,
}

impl AuthorizationGate {
    pub fn new(owner: Owner, daily_limit: usize) -> Self {
        Self { owner, daily_limit }
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn daily_limit(&self) -> usize {
        self.daily_limit
    }

    /// Decide whether `req` may be dispatched on `today`.
    ///
    /// `in_flight` holds targets of this requester that were authorized but
    /// whose upstream call has not settled yet; they count as used. Tables
    /// are only read when a check needs them. Nothing is written here.
    pub fn authorize(
        &self,
        store: &dyn StateStore,
        req: &Request,
        today: NaiveDate,
        in_flight: &[String],
    ) -> Result<Decision, StoreError> {
        if !self.owner.is_owner(&req.requester_id) {
            let groups = decode_set(&store.get(Table::Groups)?);
            if !groups.contains(&req.chat_id) {
                debug!(chat = %req.chat_id, "chat is not in the allowed groups");
                return Ok(Decision::Deny(DenyReason::GroupNotAllowed));
            }
        }

        if req.target_id.trim().is_empty() {
            return Ok(Decision::Deny(DenyReason::MissingTarget));
        }

        let vips = decode_set(&store.get(Table::Vip)?);
        if vips.contains(&req.requester_id) {
            return Ok(Decision::Allow { vip: true });
        }

        let usage = decode_usage(&store.get(Table::Usage)?);
        let record = usage
            .get(&req.requester_id)
            .map(|r| r.rolled_over(today))
            .unwrap_or_else(|| UsageRecord::new(today));

        if record.contains(&req.target_id) || in_flight.iter().any(|t| t == &req.target_id) {
            return Ok(Decision::Deny(DenyReason::TargetAlreadyUsed));
        }
        if record.target_ids.len() + in_flight.len() >= self.daily_limit {
            return Ok(Decision::Deny(DenyReason::DailyLimitReached));
        }
        Ok(Decision::Allow { vip: false })
    }
}
