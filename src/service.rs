//! Entry points handed to the chat transport.

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::QuotaPolicy;
use crate::gate::{AuthorizationGate, Decision, DenyReason, Owner, Request};
use crate::ledger::QuotaLedger;
use crate::store::{decode_set, encode_set, StateStore, Table};
use crate::upstream::{Dispatcher, LikeReceipt, UpstreamResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// `remaining` is `None` when usage is not tracked (VIP) or could not
    /// be persisted.
    Granted {
        receipt: LikeReceipt,
        remaining: Option<usize>,
    },
    Denied {
        reason: DenyReason,
    },
    UpstreamRejected {
        detail: String,
    },
    TransportError {
        detail: String,
    },
    StorageUnavailable {
        detail: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminOutcome {
    Added,
    AlreadyPresent,
    Removed,
    NotPresent,
    Listed(Vec<String>),
    Denied(DenyReason),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaStatus {
    Vip,
    Remaining {
        used: usize,
        remaining: usize,
        limit: usize,
    },
    Unavailable(String),
}

/// Targets authorized but not yet settled, per requester, with the date
/// they were authorized for.
type Reservations = DashMap<String, Vec<(NaiveDate, String)>>;

/// Holds one target against a requester's quota until dropped.
struct Reservation<'a> {
    pending: &'a Reservations,
    requester_id: String,
    date: NaiveDate,
    target_id: String,
}

impl<'a> Reservation<'a> {
    fn take(pending: &'a Reservations, req: &Request, date: NaiveDate) -> Self {
        pending
            .entry(req.requester_id.clone())
            .or_default()
            .push((date, req.target_id.clone()));
        Self {
            pending,
            requester_id: req.requester_id.clone(),
            date,
            target_id: req.target_id.clone(),
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let emptied = match self.pending.get_mut(&self.requester_id) {
            Some(mut targets) => {
                if let Some(pos) = targets
                    .iter()
                    .position(|(d, t)| *d == self.date && *t == self.target_id)
                {
                    targets.remove(pos);
                }
                targets.is_empty()
            }
            None => false,
        };
        if emptied {
            self.pending.remove_if(&self.requester_id, |_, targets| targets.is_empty());
        }
    }
}

pub struct LikeService {
    store: Arc<dyn StateStore>,
    gate: AuthorizationGate,
    ledger: QuotaLedger,
    dispatcher: Dispatcher,
    quota: QuotaPolicy,
    // Serializes every state check/update. Never held across the upstream call.
    state: Mutex<()>,
    pending: Reservations,
}

impl LikeService {
    pub fn new(
        store: Arc<dyn StateStore>,
        owner: Owner,
        quota: QuotaPolicy,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            store,
            gate: AuthorizationGate::new(owner, quota.daily_limit),
            ledger: QuotaLedger::new(quota.daily_limit),
            dispatcher,
            quota,
            state: Mutex::new(()),
            pending: DashMap::new(),
        }
    }

    pub fn is_owner(&self, id: &str) -> bool {
        self.gate.owner().is_owner(id)
    }

    pub fn daily_limit(&self) -> usize {
        self.quota.daily_limit
    }

    pub async fn handle_like_request(&self, req: &Request, now: DateTime<Utc>) -> Outcome {
        let today = self.quota.today(now);

        let reservation = {
            let _guard = self.state.lock().await;
            let in_flight = self.in_flight(&req.requester_id, today);
            match self
                .gate
                .authorize(self.store.as_ref(), req, today, &in_flight)
            {
                Err(e) => {
                    error!("refusing like request from {}: {}", req.requester_id, e);
                    return Outcome::StorageUnavailable {
                        detail: e.to_string(),
                    };
                }
                Ok(Decision::Deny(reason)) => {
                    info!(
                        requester = %req.requester_id,
                        chat = %req.chat_id,
                        target = %req.target_id,
                        "denied: {}",
                        reason
                    );
                    return Outcome::Denied { reason };
                }
                Ok(Decision::Allow { vip: true }) => None,
                Ok(Decision::Allow { vip: false }) => {
                    Some(Reservation::take(&self.pending, req, today))
                }
            }
        };
        let vip = reservation.is_none();

        let result = self.dispatcher.dispatch(&req.target_id, &req.region).await;

        let remaining = match reservation {
            None => None,
            Some(reservation) => {
                let _guard = self.state.lock().await;
                let remaining = match &result {
                    UpstreamResult::Success(_) => match self.ledger.record_success(
                        self.store.as_ref(),
                        &req.requester_id,
                        &req.target_id,
                        today,
                    ) {
                        Ok(left) => left,
                        Err(e) => {
                            error!(
                                "like for {} succeeded but usage of {} was not saved: {}",
                                req.target_id, req.requester_id, e
                            );
                            None
                        }
                    },
                    _ => None,
                };
                drop(reservation);
                remaining
            }
        };

        match result {
            UpstreamResult::Success(receipt) => {
                info!(
                    requester = %req.requester_id,
                    target = %receipt.target_id,
                    added = receipt.added,
                    vip,
                    "like granted"
                );
                Outcome::Granted { receipt, remaining }
            }
            UpstreamResult::Rejected { reason } => {
                info!(target = %req.target_id, "upstream rejected: {}", reason);
                Outcome::UpstreamRejected { detail: reason }
            }
            UpstreamResult::TransportFailure { error } => Outcome::TransportError { detail: error },
        }
    }

    fn in_flight(&self, requester_id: &str, today: NaiveDate) -> Vec<String> {
        self.pending
            .get(requester_id)
            .map(|targets| {
                targets
                    .iter()
                    .filter(|(date, _)| *date == today)
                    .map(|(_, target)| target.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn quota_status(&self, requester_id: &str, now: DateTime<Utc>) -> QuotaStatus {
        let today = self.quota.today(now);
        let _guard = self.state.lock().await;

        let vips = match self.store.get(Table::Vip) {
            Ok(m) => decode_set(&m),
            Err(e) => return QuotaStatus::Unavailable(e.to_string()),
        };
        if vips.contains(requester_id) {
            return QuotaStatus::Vip;
        }
        match self.ledger.usage(self.store.as_ref(), requester_id, today) {
            Ok((used, remaining)) => QuotaStatus::Remaining {
                used,
                remaining,
                limit: self.ledger.daily_limit(),
            },
            Err(e) => QuotaStatus::Unavailable(e.to_string()),
        }
    }

    pub async fn add_allowed_group(&self, caller: &str, chat_id: &str) -> AdminOutcome {
        // The owner is allowed implicitly and never stored.
        if self.is_owner(caller) && self.is_owner(chat_id) {
            return AdminOutcome::AlreadyPresent;
        }
        self.update_set(caller, Table::Groups, chat_id, true).await
    }

    pub async fn remove_allowed_group(&self, caller: &str, chat_id: &str) -> AdminOutcome {
        self.update_set(caller, Table::Groups, chat_id, false).await
    }

    pub async fn add_vip(&self, caller: &str, requester_id: &str) -> AdminOutcome {
        self.update_set(caller, Table::Vip, requester_id, true).await
    }

    pub async fn remove_vip(&self, caller: &str, requester_id: &str) -> AdminOutcome {
        self.update_set(caller, Table::Vip, requester_id, false).await
    }

    pub async fn list_vips(&self, caller: &str) -> AdminOutcome {
        self.list_set(caller, Table::Vip).await
    }

    pub async fn list_allowed_groups(&self, caller: &str) -> AdminOutcome {
        self.list_set(caller, Table::Groups).await
    }

    async fn update_set(&self, caller: &str, table: Table, id: &str, insert: bool) -> AdminOutcome {
        if !self.is_owner(caller) {
            warn!("admin change on {} table refused for {}", table, caller);
            return AdminOutcome::Denied(DenyReason::NotAuthorized);
        }
        let id = id.trim();
        if id.is_empty() {
            return AdminOutcome::Failed("id is empty".into());
        }

        let _guard = self.state.lock().await;
        let mut set = match self.store.get(table) {
            Ok(m) => decode_set(&m),
            Err(e) => return AdminOutcome::Failed(e.to_string()),
        };

        let changed = if insert {
            set.insert(id.to_string())
        } else {
            set.remove(id)
        };
        if !changed {
            return if insert {
                AdminOutcome::AlreadyPresent
            } else {
                AdminOutcome::NotPresent
            };
        }

        if let Err(e) = self.store.put(table, &encode_set(&set)) {
            return AdminOutcome::Failed(e.to_string());
        }
        info!("{} {} {} table", if insert { "added" } else { "removed" }, id, table);
        if insert {
            AdminOutcome::Added
        } else {
            AdminOutcome::Removed
        }
    }

    async fn list_set(&self, caller: &str, table: Table) -> AdminOutcome {
        if !self.is_owner(caller) {
            return AdminOutcome::Denied(DenyReason::NotAuthorized);
        }
        let _guard = self.state.lock().await;
        match self.store.get(table) {
            Ok(m) => AdminOutcome::Listed(decode_set(&m).into_iter().collect()),
            Err(e) => AdminOutcome::Failed(e.to_string()),
        }
    }
}
