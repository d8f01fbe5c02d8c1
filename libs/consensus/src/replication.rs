//! Log replication
//!
//! Leader-side append pipelining and batching, follower-side consistency
//! checking, commit advancement, and snapshot-based catch-up for
//! followers that have fallen behind the compaction boundary.
//!
//! Appends to one follower are pipelined up to a small bound and batched
//! by payload size. A failed consistency check backs `next_index` up
//! linearly, helped by the follower's conflict hint, until leader and
//! follower logs agree.

use crate::cluster::MemberStatus;
use crate::node::{RaftEvent, RaftInner, StateMachine};
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
};
use crate::state::Role;
use crate::types::{LogIndex, NodeId, Snapshot, Term};
use crate::Result;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Cap on entries fetched per batch before the byte bound is applied.
const BATCH_FETCH_LIMIT: u64 = 1024;

impl<SM: StateMachine> RaftInner<SM> {
    /// Drive replication to every remote member. With `heartbeat` set an
    /// empty append is sent even when the follower is up to date, which
    /// asserts leadership and carries the current read round.
    pub(crate) fn replicate(&mut self, heartbeat: bool) {
        if self.state.role != Role::Leader {
            return;
        }
        for peer in self.view.remote_ids() {
            self.replicate_to(peer, heartbeat);
        }
    }

    fn replicate_to(&mut self, peer: NodeId, heartbeat: bool) {
        let term = self.state.persistent.current_term;
        let (next_index, in_flight, snapshotting) = {
            let leader = match &mut self.state.leader {
                Some(l) => l,
                None => return,
            };
            let progress = match leader.progress_mut(peer) {
                Some(p) => p,
                None => return,
            };
            (
                progress.next_index,
                progress.in_flight,
                progress.snapshot_offset.is_some(),
            )
        };

        if in_flight >= self.config.max_appends_per_follower {
            return;
        }

        if snapshotting || next_index < self.log.first_index() {
            self.send_snapshot_chunk(peer);
            return;
        }

        let prev_log_index = next_index - 1;
        let prev_log_term = if prev_log_index == LogIndex::ZERO {
            Term(0)
        } else {
            match self.log.term_of(prev_log_index) {
                Ok(Some(term)) => term,
                // Compacted past the follower's position.
                _ => {
                    self.send_snapshot_chunk(peer);
                    return;
                }
            }
        };

        let raw = match self
            .log
            .get_range(next_index, next_index + BATCH_FETCH_LIMIT)
        {
            Ok(entries) => entries,
            Err(e) => {
                warn!("{} replication read failed: {e}", self.state.id);
                return;
            }
        };

        // Byte-bounded batch; always at least one entry so a single
        // oversized entry still makes progress.
        let mut entries = Vec::new();
        let mut bytes = 0usize;
        for entry in raw {
            bytes += entry.approx_size();
            if !entries.is_empty() && bytes > self.config.max_append_batch_size {
                break;
            }
            entries.push(entry);
        }

        if entries.is_empty() && !heartbeat {
            return;
        }

        let round = self.state.leader.as_ref().map(|l| l.round).unwrap_or(0);
        let request = AppendEntriesRequest {
            term,
            leader_id: self.state.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.state.volatile.commit_index,
            round,
        };

        if let Some(progress) = self
            .state
            .leader
            .as_mut()
            .and_then(|l| l.progress_mut(peer))
        {
            progress.in_flight += 1;
            progress.next_index = request
                .entries
                .last()
                .map(|e| e.index + 1)
                .unwrap_or(progress.next_index);
        }

        trace!(
            "{} appending {} entries to {peer} at {prev_log_index}",
            self.state.id,
            request.entries.len()
        );

        let protocol = self.protocol.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let reply = protocol.append_entries(peer, request).await;
            let _ = events.send(RaftEvent::AppendReply {
                from: peer,
                sent_term: term,
                reply,
            });
        });
    }

    pub(crate) fn handle_append_reply(
        &mut self,
        from: NodeId,
        sent_term: Term,
        reply: Result<AppendEntriesResponse>,
    ) {
        if self.state.role != Role::Leader || sent_term != self.state.persistent.current_term {
            return;
        }

        if let Some(progress) = self
            .state
            .leader
            .as_mut()
            .and_then(|l| l.progress_mut(from))
        {
            progress.in_flight = progress.in_flight.saturating_sub(1);
        }

        let response = match reply {
            Ok(response) => response,
            Err(e) => {
                debug!("{} append to {from} failed: {e}", self.state.id);
                self.view.set_status(from, MemberStatus::Unavailable);
                return;
            }
        };

        if self.observe_term(response.term, None) {
            return;
        }

        self.view.set_status(from, MemberStatus::Available);
        let now = Instant::now();
        let last_index = self.log.last_index();
        let mut resend = false;

        if let Some(progress) = self
            .state
            .leader
            .as_mut()
            .and_then(|l| l.progress_mut(from))
        {
            progress.last_contact = Some(now);
            progress.acked_round = progress.acked_round.max(response.round);

            if response.success {
                if response.match_index > progress.match_index {
                    progress.match_index = response.match_index;
                }
                progress.next_index = progress.next_index.max(progress.match_index + 1);
                resend = progress.next_index <= last_index;
            } else {
                // Back up past the divergence; the conflict hint skips
                // ahead of pure decrement when the follower's log is
                // short.
                let before = progress.next_index;
                let mut next = progress.next_index - 1;
                if let Some(hint) = response.conflict_index {
                    next = next.min(hint);
                }
                progress.next_index = next.max(LogIndex(1)).max(progress.match_index + 1);                // Rejections that no longer move next_index wait for
                // the next heartbeat tick; an immediate resend would
                // spin against a peer that refuses every append.
                resend = progress.next_index < before;
            }
        }

        self.maybe_commit();
        self.try_complete_reads();

        if resend {
            self.replicate_to(from, false);
        }
    }

    /// Advance the commit index to the highest quorum-replicated index
    /// whose entry carries the current term. Entries from earlier terms
    /// commit only transitively.
    pub(crate) fn maybe_commit(&mut self) {
        let leader = match &self.state.leader {
            Some(l) => l,
            None => return,
        };
        let candidate = leader.quorum_match_index(&self.view, self.log.last_index());
        if candidate <= self.state.volatile.commit_index {
            return;
        }

        match self.log.term_of(candidate) {
            Ok(Some(term)) if term == self.state.persistent.current_term => {
                if self.state.volatile.advance_commit(candidate) {
                    trace!("{} committed through {candidate}", self.state.id);
                    self.apply_committed();
                }
            }
            _ => {}
        }
    }

    /// Follower side of append-entries: term bookkeeping, consistency
    /// check against the previous entry, divergent-suffix truncation,
    /// and commit index advancement.
    pub(crate) fn handle_append_entries(
        &mut self,
        req: AppendEntriesRequest,
    ) -> AppendEntriesResponse {
        self.observe_term(req.term, Some(req.leader_id));
        let current = self.state.persistent.current_term;

        let reject = |conflict: Option<LogIndex>| AppendEntriesResponse {
            term: current,
            success: false,
            match_index: LogIndex::ZERO,
            conflict_index: conflict,
            round: req.round,
        };

        if req.term < current || !self.state.role.accepts_appends() {
            return reject(None);
        }

        // A valid append from the leader of our term ends any candidacy.
        if self.state.role == Role::Candidate {
            self.state.become_follower(current, Some(req.leader_id));
            self.publish_role();
        }
        self.state.leader_id = Some(req.leader_id);
        self.reset_election_timer();

        // Consistency check at the previous index.
        if req.prev_log_index > LogIndex::ZERO {
            match self.log.term_of(req.prev_log_index) {
                Ok(Some(term)) if term == req.prev_log_term => {}
                Ok(Some(_)) => {
                    // Term mismatch: our entry at prev is from a dead
                    // leader's line of history.
                    return reject(Some(req.prev_log_index));
                }
                Ok(None) => {
                    // Our log is too short; point the leader at our end.
                    return reject(Some(self.log.last_index() + 1));
                }
                Err(e) => {
                    warn!("{} consistency check failed: {e}", self.state.id);
                    return reject(None);
                }
            }
        }

        // Skip entries we already hold; truncate at the first conflict.
        let requested_last = req.prev_log_index + req.entries.len() as u64;
        let mut to_append = Vec::new();
        for entry in req.entries {
            if !to_append.is_empty() {
                to_append.push(entry);
                continue;
            }
            match self.log.term_of(entry.index) {
                Ok(Some(term)) if term == entry.term => continue,
                Ok(Some(_)) => {
                    if let Err(e) = self.log.truncate_from(entry.index) {
                        warn!("{} truncation failed: {e}", self.state.id);
                        return reject(None);
                    }
                    to_append.push(entry);
                }
                Ok(None) => to_append.push(entry),
                Err(e) => {
                    warn!("{} lookup failed: {e}", self.state.id);
                    return reject(None);
                }
            }
        }

        if !to_append.is_empty() {
            if let Err(e) = self.log.append(to_append) {
                warn!("{} append failed: {e}", self.state.id);
                return reject(None);
            }
        }

        // Commit up to what the leader confirmed, bounded by the prefix
        // this request verified. Anything beyond it may be an
        // unreconciled tail from an older leader.
        let commit_to = req.leader_commit.min(requested_last);
        if self.state.volatile.advance_commit(commit_to) {
            self.apply_committed();
        }

        AppendEntriesResponse {
            term: current,
            success: true,
            match_index: requested_last,
            conflict_index: None,
            round: req.round,
        }
    }

    // ---- snapshot transfer (leader side) ---------------------------------

    fn send_snapshot_chunk(&mut self, peer: NodeId) {
        let snapshot = match self.log.snapshot() {
            Some(s) => s,
            None => {
                warn!(
                    "{} cannot catch {peer} up: log compacted but no snapshot",
                    self.state.id
                );
                return;
            }
        };

        let offset = {
            let progress = match self
                .state
                .leader
                .as_mut()
                .and_then(|l| l.progress_mut(peer))
            {
                Some(p) => p,
                None => return,
            };
            // One chunk outstanding at a time. A second send at the
            // same offset would arrive out of sequence and make the
            // follower discard its partial transfer.
            if progress.in_flight > 0 {
                return;
            }
            *progress.snapshot_offset.get_or_insert(0)
        };

        let Snapshot { metadata, data } = snapshot;
        let end = (offset as usize + self.config.snapshot_chunk_size).min(data.len());
        let done = end == data.len();
        let chunk = data[offset as usize..end].to_vec();
        let term = self.state.persistent.current_term;

        if let Some(progress) = self
            .state
            .leader
            .as_mut()
            .and_then(|l| l.progress_mut(peer))
        {
            progress.in_flight += 1;
        }

        debug!(
            "{} sending snapshot chunk to {peer}: offset {offset}, {} bytes, done={done}",
            self.state.id,
            chunk.len()
        );

        let request = InstallSnapshotRequest {
            term,
            leader_id: self.state.id,
            last_included_index: metadata.last_included_index,
            last_included_term: metadata.last_included_term,
            offset,
            data: chunk,
            done,
        };

        let protocol = self.protocol.clone();
        let events = self.events.clone();
        let last_included = metadata.last_included_index;
        tokio::spawn(async move {
            let reply = protocol.install_snapshot(peer, request).await;
            let _ = events.send(RaftEvent::SnapshotReply {
                from: peer,
                sent_term: term,
                last_included,
                next_offset: end as u64,
                done,
                reply,
            });
        });
    }

    pub(crate) fn handle_snapshot_reply(
        &mut self,
        from: NodeId,
        sent_term: Term,
        last_included: LogIndex,
        next_offset: u64,
        done: bool,
        reply: Result<InstallSnapshotResponse>,
    ) {
        if self.state.role != Role::Leader || sent_term != self.state.persistent.current_term {
            return;
        }

        if let Some(progress) = self
            .state
            .leader
            .as_mut()
            .and_then(|l| l.progress_mut(from))
        {
            progress.in_flight = progress.in_flight.saturating_sub(1);
        }

        let response = match reply {
            Ok(response) => response,
            Err(e) => {
                debug!("{} snapshot chunk to {from} failed: {e}", self.state.id);
                self.view.set_status(from, MemberStatus::Unavailable);
                // The transfer restarts from the beginning; the follower
                // drops a broken sequence.
                if let Some(progress) = self
                    .state
                    .leader
                    .as_mut()
                    .and_then(|l| l.progress_mut(from))
                {
                    progress.snapshot_offset = Some(0);
                }
                return;
            }
        };

        if self.observe_term(response.term, None) {
            return;
        }
        self.view.set_status(from, MemberStatus::Available);

        if let Some(progress) = self
            .state
            .leader
            .as_mut()
            .and_then(|l| l.progress_mut(from))
        {
            progress.last_contact = Some(Instant::now());
            if done {
                progress.snapshot_offset = None;
                progress.match_index = progress.match_index.max(last_included);
                progress.next_index = last_included + 1;
            } else {
                progress.snapshot_offset = Some(next_offset);
            }
        }

        // Keep the transfer moving, or switch back to appends.
        self.replicate_to(from, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Entry, EntryPayload};

    fn inner_for_follower() -> AppendEntriesRequest {
        AppendEntriesRequest {
            term: Term(1),
            leader_id: NodeId(1),
            prev_log_index: LogIndex::ZERO,
            prev_log_term: Term(0),
            entries: vec![Entry::new(Term(1), LogIndex(1), EntryPayload::Noop)],
            leader_commit: LogIndex::ZERO,
            round: 0,
        }
    }

    #[test]
    fn test_append_request_shapes() {
        // Batching always sends contiguous entries from prev + 1.
        let req = inner_for_follower();
        assert_eq!(req.entries[0].index, req.prev_log_index + 1);
        assert!(!req.is_heartbeat());
    }
}
