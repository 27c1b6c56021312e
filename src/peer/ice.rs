use tracing::{debug, warn};

use crate::peer::engine::PeerLink;
use crate::peer::state::{CandidateAction, PeerSlot};
use crate::peer::types::IceCandidate;

/// Применяет ICE кандидат от удалённой стороны или откладывает его,
/// если remote description ещё не установлен
pub async fn deliver_remote_candidate(
    slot: &mut PeerSlot,
    link: &dyn PeerLink,
    candidate: IceCandidate,
) {
    match slot.admit_candidate(candidate) {
        CandidateAction::Apply(candidate) => {
            if let Err(e) = link.add_ice_candidate(candidate).await {
                warn!(link = link.label(), error = %e, "failed to add ICE candidate");
            }
        }
        CandidateAction::Queued => {
            debug!(
                link = link.label(),
                pending = slot.pending_len(),
                "remote description not set yet, queuing candidate"
            );
        }
        CandidateAction::Duplicate => {
            debug!(link = link.label(), "remote candidate already admitted, skipping");
        }
        CandidateAction::Dropped => {
            warn!(
                link = link.label(),
                state = %slot.state(),
                "dropping remote candidate: queue full or connection closed"
            );
        }
    }
}

/// Применяет все отложенные кандидаты после установки remote description
pub async fn apply_pending_candidates(slot: &mut PeerSlot, link: &dyn PeerLink) -> usize {
    let candidates = slot.take_pending();
    let count = candidates.len();

    for candidate in candidates {
        debug!(link = link.label(), candidate = %candidate.candidate, "applying pending candidate");
        if let Err(e) = link.add_ice_candidate(candidate).await {
            warn!(link = link.label(), error = %e, "failed to apply pending candidate");
        }
    }
    count
}

/// Сводка по типам кандидатов
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(label: &str, candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            summary.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            summary.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            summary.relay += 1;
        }
    }

    debug!(
        link = label,
        host = summary.host,
        srflx = summary.srflx,
        relay = summary.relay,
        "candidate analysis"
    );

    if summary.relay == 0 && !candidates.is_empty() {
        debug!(link = label, "no TURN relay candidates; connection through symmetric NAT may fail");
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::engine::PeerEngine;
    use crate::peer::state::Role;
    use crate::peer::types::SessionDescription;
    use crate::testing::FakeEngine;

    #[tokio::test]
    async fn redelivered_candidate_reaches_engine_once() {
        let engine = FakeEngine::new();
        let (link, _events) = engine.new_link("v").await.unwrap();
        let mut slot = PeerSlot::new(Role::Viewer, 8);
        let cand = IceCandidate::new("candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host");

        deliver_remote_candidate(&mut slot, link.as_ref(), cand.clone()).await;
        deliver_remote_candidate(&mut slot, link.as_ref(), cand.clone()).await;

        link.set_remote_description(SessionDescription::offer("v=0 offer"))
            .await
            .unwrap();
        slot.remote_description_applied().unwrap();
        assert_eq!(apply_pending_candidates(&mut slot, link.as_ref()).await, 1);

        deliver_remote_candidate(&mut slot, link.as_ref(), cand.clone()).await;
        let fake = engine.link("v").unwrap();
        assert_eq!(fake.applied_candidates(), vec![cand]);
        assert!(fake.premature_candidates().is_empty());
    }

    #[test]
    fn analysis_counts_by_type() {
        let cands = vec![
            IceCandidate::new("candidate:1 1 udp 2122260223 192.168.1.2 50000 typ host"),
            IceCandidate::new("candidate:2 1 udp 1686052607 203.0.113.7 50001 typ srflx raddr 192.168.1.2 rport 50000"),
            IceCandidate::new("candidate:3 1 udp 41885439 198.51.100.1 3478 typ relay raddr 203.0.113.7 rport 50001"),
            IceCandidate::new("candidate:4 1 udp 2122260223 10.0.0.2 50002 typ host"),
        ];
        let summary = analyze_candidates("t", &cands);
        assert_eq!(
            summary,
            CandidateSummary {
                host: 2,
                srflx: 1,
                relay: 1
            }
        );
    }
}
