//! Leader election
//!
//! Candidacy, vote granting, and the transition to leadership. The vote
//! tuple (term, voted-for) is persisted through the meta store before a
//! vote request is sent or a grant is returned; a crash between the two
//! could otherwise produce a double vote in the same term.

use crate::node::{RaftEvent, RaftInner, StateMachine};
use crate::rpc::{RequestVoteRequest, RequestVoteResponse};
use crate::state::Role;
use crate::types::{EntryPayload, NodeId, Term};
use crate::Result;
use tracing::{debug, info, warn};

impl<SM: StateMachine> RaftInner<SM> {
    /// Start a new election: advance the term, vote for self, solicit
    /// votes from every other voter.
    pub(crate) fn start_election(&mut self) {
        if !self.view.is_voter(self.state.id) {
            return;
        }

        self.state.become_candidate();
        if let Err(e) = self.persist() {
            warn!("{} aborting candidacy, persist failed: {e}", self.state.id);
            let term = self.state.persistent.current_term;
            self.state.become_follower(term, None);
            return;
        }

        self.reset_election_timer();
        self.publish_role();

        let term = self.state.persistent.current_term;
        info!("{} starting election for term {term}", self.state.id);

        let request = RequestVoteRequest {
            term,
            candidate_id: self.state.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };

        for peer in self.view.voter_ids() {
            if peer == self.state.id {
                continue;
            }
            let protocol = self.protocol.clone();
            let events = self.events.clone();
            let request = request.clone();
            tokio::spawn(async move {
                let reply = protocol.request_vote(peer, request).await;
                let _ = events.send(RaftEvent::VoteReply {
                    from: peer,
                    sent_term: term,
                    reply,
                });
            });
        }

        // A single-voter cluster wins immediately.
        self.check_election_won();
    }

    /// Vote-granting rule: reject lower terms and already-spent votes,
    /// and never elect a candidate whose log is behind ours.
    pub(crate) fn handle_request_vote(&mut self, req: RequestVoteRequest) -> RequestVoteResponse {
        self.observe_term(req.term, None);
        let current = self.state.persistent.current_term;

        let reject = RequestVoteResponse {
            term: current,
            vote_granted: false,
        };

        if req.term < current {
            return reject;
        }
        if !self.state.role.is_voting() || !self.view.is_voter(self.state.id) {
            return reject;
        }

        match self.state.persistent.voted_for {
            Some(candidate) if candidate != req.candidate_id => return reject,
            _ => {}
        }

        // Log up-to-date check: higher last term wins; equal terms
        // compare by length.
        let our_last_term = self.log.last_term();
        let our_last_index = self.log.last_index();
        let candidate_current = req.last_log_term > our_last_term
            || (req.last_log_term == our_last_term && req.last_log_index >= our_last_index);
        if !candidate_current {
            debug!(
                "{} refusing vote for {}: log behind ({}/{} < {our_last_index}/{our_last_term})",
                self.state.id, req.candidate_id, req.last_log_index, req.last_log_term
            );
            return reject;
        }

        self.state.persistent.voted_for = Some(req.candidate_id);
        if let Err(e) = self.persist() {
            warn!("{} refusing vote, persist failed: {e}", self.state.id);
            self.state.persistent.voted_for = None;
            return reject;
        }

        debug!(
            "{} granting vote to {} in term {current}",
            self.state.id, req.candidate_id
        );
        self.reset_election_timer();
        RequestVoteResponse {
            term: current,
            vote_granted: true,
        }
    }

    pub(crate) fn handle_vote_reply(
        &mut self,
        from: NodeId,
        sent_term: Term,
        reply: Result<RequestVoteResponse>,
    ) {
        if self.state.role != Role::Candidate || sent_term != self.state.persistent.current_term {
            return;
        }

        let response = match reply {
            Ok(response) => response,
            Err(e) => {
                debug!("{} vote request to {from} failed: {e}", self.state.id);
                return;
            }
        };

        if self.observe_term(response.term, None) {
            return;
        }
        if !response.vote_granted {
            return;
        }

        if let Some(candidate) = self.state.candidate.as_mut() {
            candidate.record_vote(from);
        }
        self.check_election_won();
    }

    fn check_election_won(&mut self) {
        let won = self
            .state
            .candidate
            .as_ref()
            .map(|c| c.has_majority(&self.view))
            .unwrap_or(false);
        if !won {
            return;
        }

        let term = self.state.persistent.current_term;
        info!("{} won election for term {term}", self.state.id);

        let remotes = self.view.remote_ids();
        self.state.become_leader(&remotes, self.log.last_index());
        self.publish_role();

        // A no-op entry under the new term lets earlier-term entries
        // commit through the current-term rule without waiting for a
        // client command.
        if let Err(e) = self.append_as_leader(EntryPayload::Noop) {
            warn!("{} failed to append no-op: {e}", self.state.id);
        }

        self.replicate(true);
        self.maybe_commit();
    }
}
