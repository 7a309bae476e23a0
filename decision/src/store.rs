use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use herdid_graph::NodeId;
use herdid_kv::KVStore;

use crate::keys::{
    archive_key, archive_prefix, log_key, log_pair_prefix, log_prefix, pair_id_of, pair_key,
    pair_prefix,
};
use crate::types::{
    AuditEntry, Claim, ClusterPair, Decision, EnqueueOutcome, Outcome, PairStatus, Stats, pair_id,
};
use crate::DecisionError;

/// Rows fetched per page by [`PendingIter`].
pub const DEFAULT_PAGE_SIZE: usize = 64;

fn decode(bytes: &[u8]) -> Result<ClusterPair, DecisionError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Durable queue of ambiguous cluster pairs and their decisions.
///
/// Rows are JSON, so any client holding the same store can read and write
/// them. Nothing is ever deleted: rows move through
/// `pending → resolved → applied`, or to `stale` when a cluster they name
/// is gone. Every row change is a compare-and-swap against the bytes last
/// read, so concurrent writers never overwrite each other.
pub struct DecisionStore {
    kv: Arc<dyn KVStore>,
    prefix: String,
    page_size: usize,
}

impl DecisionStore {
    pub fn new(kv: Arc<dyn KVStore>, prefix: impl Into<String>) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn load(&self, pair_id: &str) -> Result<Option<(Vec<u8>, ClusterPair)>, DecisionError> {
        match self.kv.get(&pair_key(&self.prefix, pair_id))? {
            Some(raw) => {
                let row = decode(&raw)?;
                Ok(Some((raw, row)))
            }
            None => Ok(None),
        }
    }

    pub fn get(&self, pair_id: &str) -> Result<Option<ClusterPair>, DecisionError> {
        Ok(self.load(pair_id)?.map(|(_, row)| row))
    }

    /// The row for clusters `a` and `b`, in either order.
    pub fn find(&self, a: NodeId, b: NodeId) -> Result<Option<ClusterPair>, DecisionError> {
        self.get(&pair_id(a, b))
    }

    /// Queues a pair as `pending`.
    ///
    /// Re-enqueuing the same question is a no-op. A `stale` row, or one
    /// applied as `defer` whose question has changed, is archived and
    /// replaced. Any other existing row with different content is an error.
    pub fn enqueue(&self, pair: ClusterPair) -> Result<EnqueueOutcome, DecisionError> {
        let mut row = pair;
        row.status = PairStatus::Pending;
        row.decision = None;
        row.claim = None;
        let key = pair_key(&self.prefix, &row.pair_id);
        let bytes = serde_json::to_vec(&row)?;

        loop {
            match self.load(&row.pair_id)? {
                None => {
                    let log = self.log_entry(&row.pair_id, None, PairStatus::Pending, None, None)?;
                    if self.swap(&key, None, &bytes, &[log])? {
                        debug!(pair_id = %row.pair_id, "decision: pair queued");
                        return Ok(EnqueueOutcome::Inserted);
                    }
                }
                Some((raw, existing)) => {
                    let deferred = existing.status == PairStatus::Applied
                        && existing.outcome() == Some(Outcome::Defer);
                    if existing.status != PairStatus::Stale {
                        if existing.same_request(&row) {
                            return Ok(EnqueueOutcome::Unchanged);
                        }
                        if !deferred {
                            return Err(DecisionError::ConflictingEnqueue(row.pair_id));
                        }
                    }
                    let extra = [
                        self.archive_entry(&row.pair_id, &raw)?,
                        self.log_entry(&row.pair_id, Some(existing.status), PairStatus::Pending, None, None)?,
                    ];
                    if self.swap(&key, Some(&raw), &bytes, &extra)? {
                        info!(pair_id = %row.pair_id, previous = %existing.status, "decision: pair requeued");
                        return Ok(EnqueueOutcome::Requeued);
                    }
                }
            }
        }
    }

    /// Records a reviewer's decision on a pending pair.
    ///
    /// Submitting the outcome a pair already carries is a no-op; a
    /// different outcome fails with `AlreadyResolved`. A pair claimed by
    /// another reviewer cannot be resolved.
    pub fn resolve(&self, pair_id: &str, decision: Decision) -> Result<ClusterPair, DecisionError> {
        let (row, changed) = self.modify(pair_id, Some(decision.decided_by.as_str()), |row| match row.status {
            PairStatus::Pending => {
                if let Some(claim) = row.claim.as_ref().filter(|c| c.by != decision.decided_by) {
                    return Err(DecisionError::ClaimedByOther {
                        pair_id: row.pair_id.clone(),
                        by: claim.by.clone(),
                    });
                }
                let mut next = row.clone();
                next.status = PairStatus::Resolved;
                next.decision = Some(Decision {
                    pair_id: row.pair_id.clone(),
                    ..decision.clone()
                });
                next.claim = None;
                Ok(Some(next))
            }
            PairStatus::Resolved | PairStatus::Applied => match row.outcome() {
                Some(existing) if existing == decision.outcome => Ok(None),
                Some(existing) => Err(DecisionError::AlreadyResolved {
                    pair_id: row.pair_id.clone(),
                    existing,
                }),
                None => Err(DecisionError::StaleTransition {
                    pair_id: row.pair_id.clone(),
                    expected: PairStatus::Pending,
                    actual: row.status,
                }),
            },
            PairStatus::Stale => Err(DecisionError::StaleTransition {
                pair_id: row.pair_id.clone(),
                expected: PairStatus::Pending,
                actual: row.status,
            }),
        })?;
        if changed {
            info!(pair_id, outcome = %decision.outcome, by = %decision.decided_by, "decision: pair resolved");
        }
        Ok(row)
    }

    /// `resolved → applied`. Repeating it is a no-op.
    pub fn mark_applied(&self, pair_id: &str) -> Result<ClusterPair, DecisionError> {
        let (row, _) = self.modify(pair_id, None, |row| match row.status {
            PairStatus::Resolved => {
                let mut next = row.clone();
                next.status = PairStatus::Applied;
                Ok(Some(next))
            }
            PairStatus::Applied => Ok(None),
            actual => Err(DecisionError::StaleTransition {
                pair_id: row.pair_id.clone(),
                expected: PairStatus::Resolved,
                actual,
            }),
        })?;
        Ok(row)
    }

    /// `pending | resolved → stale`. Repeating it is a no-op.
    pub fn mark_stale(&self, pair_id: &str) -> Result<ClusterPair, DecisionError> {
        let (row, changed) = self.modify(pair_id, None, |row| match row.status {
            PairStatus::Pending | PairStatus::Resolved => {
                let mut next = row.clone();
                next.status = PairStatus::Stale;
                next.claim = None;
                Ok(Some(next))
            }
            PairStatus::Stale => Ok(None),
            actual => Err(DecisionError::StaleTransition {
                pair_id: row.pair_id.clone(),
                expected: PairStatus::Pending,
                actual,
            }),
        })?;
        if changed {
            debug!(pair_id, "decision: pair marked stale");
        }
        Ok(row)
    }

    /// Reserves the first unclaimed pending pair for `reviewer`. A pair the
    /// reviewer already holds is returned again.
    pub fn claim_next(&self, reviewer: &str) -> Result<Option<ClusterPair>, DecisionError> {
        let pending: Vec<ClusterPair> = self.list_pending().collect::<Result<_, _>>()?;
        if let Some(held) = pending
            .iter()
            .find(|p| p.claim.as_ref().is_some_and(|c| c.by == reviewer))
        {
            return Ok(Some(held.clone()));
        }

        for candidate in pending.iter().filter(|p| p.claim.is_none()) {
            let (row, changed) = self.modify(&candidate.pair_id, None, |row| {
                if row.status != PairStatus::Pending || row.claim.is_some() {
                    return Ok(None);
                }
                let now = Utc::now();
                let mut next = row.clone();
                next.claim = Some(Claim {
                    by: reviewer.to_string(),
                    claimed_at: now,
                    heartbeat: now,
                });
                Ok(Some(next))
            })?;
            if changed {
                debug!(pair_id = %row.pair_id, reviewer, "decision: pair claimed");
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    /// Keeps `reviewer`'s claim on a pending pair alive.
    pub fn heartbeat(&self, pair_id: &str, reviewer: &str) -> Result<(), DecisionError> {
        self.modify(pair_id, None, |row| {
            match &row.claim {
                Some(c) if c.by == reviewer && row.status == PairStatus::Pending => {}
                _ => {
                    return Err(DecisionError::NotClaimed {
                        pair_id: row.pair_id.clone(),
                        reviewer: reviewer.to_string(),
                    });
                }
            }
            let mut next = row.clone();
            if let Some(c) = next.claim.as_mut() {
                c.heartbeat = Utc::now();
            }
            Ok(Some(next))
        })?;
        Ok(())
    }

    /// Drops `reviewer`'s claim. Returns whether a claim was dropped.
    pub fn release(&self, pair_id: &str, reviewer: &str) -> Result<bool, DecisionError> {
        let (_, changed) = self.modify(pair_id, None, |row| {
            if row.claim.as_ref().is_some_and(|c| c.by == reviewer) {
                let mut next = row.clone();
                next.claim = None;
                Ok(Some(next))
            } else {
                Ok(None)
            }
        })?;
        Ok(changed)
    }

    /// Drops every claim `reviewer` holds, e.g. when a review client exits.
    pub fn release_all(&self, reviewer: &str) -> Result<usize, DecisionError> {
        let held: Vec<String> = self
            .list_pending()
            .filter_map(|row| match row {
                Ok(p) if p.claim.as_ref().is_some_and(|c| c.by == reviewer) => Some(Ok(p.pair_id)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
            .collect::<Result<_, _>>()?;
        let mut released = 0;
        for id in held {
            if self.release(&id, reviewer)? {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Returns claims without a heartbeat for longer than `timeout` to the
    /// pool.
    pub fn reset_expired_claims(&self, timeout: Duration) -> Result<usize, DecisionError> {
        self.reset_expired_claims_at(timeout, Utc::now())
    }

    pub fn reset_expired_claims_at(&self, timeout: Duration, now: DateTime<Utc>) -> Result<usize, DecisionError> {
        let expired = |claim: &Option<Claim>| claim.as_ref().is_some_and(|c| c.heartbeat + timeout < now);
        let candidates: Vec<String> = self
            .list_pending()
            .filter_map(|row| match row {
                Ok(p) if expired(&p.claim) => Some(Ok(p.pair_id)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
            .collect::<Result<_, _>>()?;

        let mut reset = 0;
        for id in candidates {
            let (_, changed) = self.modify(&id, None, |row| {
                if !expired(&row.claim) {
                    return Ok(None);
                }
                let mut next = row.clone();
                next.claim = None;
                Ok(Some(next))
            })?;
            if changed {
                reset += 1;
            }
        }
        if reset > 0 {
            info!(reset, "decision: expired claims returned to the queue");
        }
        Ok(reset)
    }

    /// Pending pairs in pair-id order, fetched one page at a time.
    pub fn list_pending(&self) -> PendingIter<'_> {
        PendingIter::new(self, None)
    }

    /// Like [`DecisionStore::list_pending`], starting after the pair
    /// `cursor` (see [`PendingIter::cursor`]).
    pub fn list_pending_after(&self, cursor: &str) -> PendingIter<'_> {
        PendingIter::new(self, Some(pair_key(&self.prefix, cursor)))
    }

    pub fn pending_count(&self) -> Result<usize, DecisionError> {
        self.list_pending().try_fold(0, |n, row| row.map(|_| n + 1))
    }

    /// Every row in pair-id order.
    pub fn pairs(&self) -> Result<Vec<ClusterPair>, DecisionError> {
        self.kv
            .scan(&pair_prefix(&self.prefix))?
            .iter()
            .map(|(_, v)| decode(v))
            .collect()
    }

    pub fn with_status(&self, status: PairStatus) -> Result<Vec<ClusterPair>, DecisionError> {
        Ok(self
            .pairs()?
            .into_iter()
            .filter(|p| p.status == status)
            .collect())
    }

    pub fn stats(&self) -> Result<Stats, DecisionError> {
        let mut stats = Stats::default();
        for p in self.pairs()? {
            match p.status {
                PairStatus::Pending => {
                    stats.pending += 1;
                    if let Some(c) = &p.claim {
                        stats.claimed += 1;
                        *stats.reviewers.entry(c.by.clone()).or_default() += 1;
                    }
                }
                PairStatus::Resolved => stats.resolved += 1,
                PairStatus::Applied => stats.applied += 1,
                PairStatus::Stale => stats.stale += 1,
            }
        }
        Ok(stats)
    }

    /// Every transition, oldest first.
    pub fn audit_log(&self) -> Result<Vec<AuditEntry>, DecisionError> {
        let mut entries: Vec<AuditEntry> = self
            .kv
            .scan(&log_prefix(&self.prefix))?
            .iter()
            .map(|(_, v)| serde_json::from_slice(v).map_err(DecisionError::from))
            .collect::<Result<_, _>>()?;
        entries.sort_by(|x, y| {
            x.at.cmp(&y.at)
                .then_with(|| x.pair_id.cmp(&y.pair_id))
                .then(x.seq.cmp(&y.seq))
        });
        Ok(entries)
    }

    /// Transitions of one pair in order.
    pub fn audit_log_for(&self, pair_id: &str) -> Result<Vec<AuditEntry>, DecisionError> {
        self.kv
            .scan(&log_pair_prefix(&self.prefix, pair_id))?
            .iter()
            .map(|(_, v)| serde_json::from_slice(v).map_err(DecisionError::from))
            .collect()
    }

    /// Rows replaced by requeues, oldest first.
    pub fn archived(&self, pair_id: &str) -> Result<Vec<ClusterPair>, DecisionError> {
        self.kv
            .scan(&archive_prefix(&self.prefix, pair_id))?
            .iter()
            .map(|(_, v)| decode(v))
            .collect()
    }

    /// Reads the row, lets `f` compute its replacement, and swaps it in
    /// together with the audit entry of a status change. `f` returning
    /// `None` means there is nothing to do.
    ///
    /// If the swap loses to a writer that changed the row's status while
    /// this call was changing it too, the call fails with
    /// `StaleTransition`. Any other lost race, such as a claim heartbeat,
    /// is retried against the fresh row.
    fn modify<F>(&self, pair_id: &str, by: Option<&str>, f: F) -> Result<(ClusterPair, bool), DecisionError>
    where
        F: Fn(&ClusterPair) -> Result<Option<ClusterPair>, DecisionError>,
    {
        let key = pair_key(&self.prefix, pair_id);
        loop {
            let (raw, row) = self
                .load(pair_id)?
                .ok_or_else(|| DecisionError::NotFound(pair_id.to_string()))?;
            let Some(mut next) = f(&row)? else {
                return Ok((row, false));
            };
            next.updated_at = Utc::now();
            let bytes = serde_json::to_vec(&next)?;
            let mut extra = Vec::new();
            if next.status != row.status {
                extra.push(self.log_entry(pair_id, Some(row.status), next.status, next.outcome(), by)?);
            }
            if self.swap(&key, Some(&raw), &bytes, &extra)? {
                return Ok((next, true));
            }
            if next.status == row.status {
                continue;
            }
            if let Some((_, current)) = self.load(pair_id)? {
                if current.status != row.status {
                    return Err(DecisionError::StaleTransition {
                        pair_id: pair_id.to_string(),
                        expected: row.status,
                        actual: current.status,
                    });
                }
            }
        }
    }

    /// Compare-and-swap of a row plus the entries written with it.
    fn swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
        extra: &[(String, Vec<u8>)],
    ) -> Result<bool, DecisionError> {
        let extra: Vec<(&str, &[u8])> = extra
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
            .collect();
        Ok(self.kv.compare_and_swap_with(key, expected, new, &extra)?)
    }

    /// The next audit entry of `pair_id`.
    ///
    /// Must be built after the row it transitions was read: entries are
    /// only written in the same swap as a row change, so a sequence number
    /// taken before a competing transition belongs to a swap that fails.
    fn log_entry(
        &self,
        pair_id: &str,
        from: Option<PairStatus>,
        to: PairStatus,
        outcome: Option<Outcome>,
        by: Option<&str>,
    ) -> Result<(String, Vec<u8>), DecisionError> {
        let seq = self.kv.scan(&log_pair_prefix(&self.prefix, pair_id))?.len() as u64;
        let entry = AuditEntry {
            pair_id: pair_id.to_string(),
            seq,
            from,
            to,
            outcome,
            by: by.map(str::to_string),
            at: Utc::now(),
        };
        Ok((log_key(&self.prefix, pair_id, seq), serde_json::to_vec(&entry)?))
    }

    /// Archive slot for the row `raw` that a requeue replaces.
    fn archive_entry(&self, pair_id: &str, raw: &[u8]) -> Result<(String, Vec<u8>), DecisionError> {
        let n = self.kv.scan(&archive_prefix(&self.prefix, pair_id))?.len();
        Ok((archive_key(&self.prefix, pair_id, n), raw.to_vec()))
    }
}

/// Lazy, restartable iterator over pending pairs.
///
/// Each page is a fresh scan, so rows written by other clients between
/// pages are seen. Rows that stop being pending before their page is
/// fetched are skipped.
pub struct PendingIter<'s> {
    store: &'s DecisionStore,
    after: Option<String>,
    page: VecDeque<ClusterPair>,
    last: Option<String>,
    done: bool,
}

impl<'s> PendingIter<'s> {
    fn new(store: &'s DecisionStore, after: Option<String>) -> Self {
        Self {
            store,
            after,
            page: VecDeque::new(),
            last: None,
            done: false,
        }
    }

    /// Pair id of the last row returned. Pass it to
    /// [`DecisionStore::list_pending_after`] to resume.
    pub fn cursor(&self) -> Option<&str> {
        self.last.as_deref()
    }

    fn fetch(&mut self) -> Result<(), DecisionError> {
        let prefix = pair_prefix(&self.store.prefix);
        let entries = self
            .store
            .kv
            .scan_page(&prefix, self.after.as_deref(), self.store.page_size)?;
        if entries.len() < self.store.page_size {
            self.done = true;
        }
        if let Some((k, _)) = entries.last() {
            self.after = Some(k.clone());
        }
        for (k, v) in entries {
            if pair_id_of(&self.store.prefix, &k).is_none() {
                continue;
            }
            let row = decode(&v)?;
            if row.status == PairStatus::Pending {
                self.page.push_back(row);
            }
        }
        Ok(())
    }
}

impl Iterator for PendingIter<'_> {
    type Item = Result<ClusterPair, DecisionError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.page.pop_front() {
                self.last = Some(row.pair_id.clone());
                return Some(Ok(row));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.fetch() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}
