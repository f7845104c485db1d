use chrono::NaiveDate;
use tracing::{debug, info};

use crate::store::{decode_usage, encode_usage, StateStore, StoreError, Table, UsageRecord};

/// Charges quota after a confirmed upstream success.
pub struct QuotaLedger {
    daily_limit: usize,
}

impl QuotaLedger {
    pub fn new(daily_limit: usize) -> Self {
        Self { daily_limit }
    }

    /// Add `target_id` to the requester's record for `today` and persist
    /// the usage table. Returns how many targets are left today, or `None`
    /// when the stored record already belongs to a later date; that record
    /// is left untouched.
    pub fn record_success(
        &self,
        store: &dyn StateStore,
        requester_id: &str,
        target_id: &str,
        today: NaiveDate,
    ) -> Result<Option<usize>, StoreError> {
        let mut usage = decode_usage(&store.get(Table::Usage)?);
        let mut record = match usage.get(requester_id) {
            Some(r) if r.date > today => {
                info!(
                    requester = requester_id,
                    target = target_id,
                    "like from {} settled after the day rolled over to {}; not charged",
                    today,
                    r.date
                );
                return Ok(None);
            }
            Some(r) => r.rolled_over(today),
            None => UsageRecord::new(today),
        };
        record.insert(target_id);
        let used = record.target_ids.len();
        usage.insert(requester_id.to_string(), record);

        store.put(Table::Usage, &encode_usage(&usage))?;
        debug!(requester = requester_id, target = target_id, used, "quota charged");
        Ok(Some(self.daily_limit.saturating_sub(used)))
    }

    /// `(used, remaining)` for `today`, without writing.
    pub fn usage(
        &self,
        store: &dyn StateStore,
        requester_id: &str,
        today: NaiveDate,
    ) -> Result<(usize, usize), StoreError> {
        let usage = decode_usage(&store.get(Table::Usage)?);
        let used = usage
            .get(requester_id)
            .map(|r| r.rolled_over(today).target_ids.len())
            .unwrap_or(0);
        Ok((used, self.daily_limit.saturating_sub(used)))
    }

    pub fn daily_limit(&self) -> usize {
        self.daily_limit
    }
}
