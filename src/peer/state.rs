use std::collections::{HashSet, VecDeque};
use std::fmt;

use crate::error::{Result, SignalError};
use crate::peer::types::IceCandidate;

/// Сторона соединения
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Viewer,
}

/// ========== STATE MACHINE ==========
///
/// Хост:    Init → OfferSent → Answered → Connected → Closed
/// Зритель: Init → OfferReceived → Answered → Connected → Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Init,
    OfferSent,
    OfferReceived,
    Answered,
    Connected,
    Closed,
}

impl NegotiationState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::OfferSent => "OFFER_SENT",
            Self::OfferReceived => "OFFER_RECEIVED",
            Self::Answered => "ANSWERED",
            Self::Connected => "CONNECTED",
            Self::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Что делать с пришедшим удалённым кандидатом
#[derive(Debug, PartialEq, Eq)]
pub enum CandidateAction {
    /// remote description уже есть, применяем сразу
    Apply(IceCandidate),
    /// ждём remote description
    Queued,
    /// очередь переполнена или соединение закрыто
    Dropped,
    /// такой кандидат уже принят (канал доставляет at-least-once)
    Duplicate,
}

type CandidateKey = (String, Option<String>, Option<u16>);

fn candidate_key(candidate: &IceCandidate) -> CandidateKey {
    (
        candidate.candidate.clone(),
        candidate.sdp_mid.clone(),
        candidate.sdp_mline_index,
    )
}

/// Кандидаты, полученные до установки remote description.
/// Порядок поступления сохраняется, размер ограничен.
#[derive(Debug)]
pub struct PendingCandidates {
    queue: VecDeque<IceCandidate>,
    limit: usize,
}

impl PendingCandidates {
    pub fn new(limit: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            limit,
        }
    }

    /// false если очередь заполнена
    pub fn push(&mut self, candidate: IceCandidate) -> bool {
        if self.queue.len() >= self.limit {
            return false;
        }
        self.queue.push_back(candidate);
        true
    }

    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Состояние одного соединения (одна пара session/viewer) на одной стороне
#[derive(Debug)]
pub struct PeerSlot {
    role: Role,
    state: NegotiationState,
    remote_description_set: bool,
    pending: PendingCandidates,
    admitted: HashSet<CandidateKey>,
}

impl PeerSlot {
    pub fn new(role: Role, max_pending: usize) -> Self {
        Self {
            role,
            state: NegotiationState::Init,
            remote_description_set: false,
            pending: PendingCandidates::new(max_pending),
            admitted: HashSet::new(),
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state == NegotiationState::Closed
    }

    /// Хост записал offer
    pub fn offer_sent(&mut self) -> Result<()> {
        self.transition(
            Role::Host,
            NegotiationState::Init,
            NegotiationState::OfferSent,
            "offer_sent",
        )
    }

    /// Хост принимает только первый answer, пока remote description нет
    pub fn accepts_answer(&self) -> bool {
        self.role == Role::Host
            && self.state == NegotiationState::OfferSent
            && !self.remote_description_set
    }

    /// Зритель принимает только первый offer
    pub fn accepts_offer(&self) -> bool {
        self.role == Role::Viewer
            && self.state == NegotiationState::Init
            && !self.remote_description_set
    }

    /// Remote description установлен: хост переходит в Answered,
    /// зритель в OfferReceived
    pub fn remote_description_applied(&mut self) -> Result<()> {
        match self.role {
            Role::Host => self.transition(
                Role::Host,
                NegotiationState::OfferSent,
                NegotiationState::Answered,
                "answer_applied",
            )?,
            Role::Viewer => self.transition(
                Role::Viewer,
                NegotiationState::Init,
                NegotiationState::OfferReceived,
                "offer_applied",
            )?,
        }
        self.remote_description_set = true;
        Ok(())
    }

    /// Зритель записал answer
    pub fn answer_sent(&mut self) -> Result<()> {
        self.transition(
            Role::Viewer,
            NegotiationState::OfferReceived,
            NegotiationState::Answered,
            "answer_sent",
        )
    }

    /// Движок сообщил connected. Возвращает true при первом переходе.
    pub fn connected(&mut self) -> bool {
        match self.state {
            NegotiationState::Answered => {
                self.state = NegotiationState::Connected;
                true
            }
            _ => false,
        }
    }

    /// Закрытие допустимо из любого состояния и идемпотентно
    pub fn close(&mut self) -> bool {
        if self.state == NegotiationState::Closed {
            return false;
        }
        self.state = NegotiationState::Closed;
        self.pending.clear();
        true
    }

    /// Решает судьбу удалённого кандидата: применить сразу или
    /// отложить до remote description
    pub fn admit_candidate(&mut self, candidate: IceCandidate) -> CandidateAction {
        if self.is_closed() {
            return CandidateAction::Dropped;
        }
        let key = candidate_key(&candidate);
        if self.admitted.contains(&key) {
            return CandidateAction::Duplicate;
        }
        if self.remote_description_set {
            self.admitted.insert(key);
            return CandidateAction::Apply(candidate);
        }
        // переполнение не запоминаем: повторная доставка получит ещё шанс
        if self.pending.push(candidate) {
            self.admitted.insert(key);
            CandidateAction::Queued
        } else {
            CandidateAction::Dropped
        }
    }

    /// Забирает отложенные кандидаты в порядке поступления.
    /// До remote description ничего не отдаёт.
    pub fn take_pending(&mut self) -> Vec<IceCandidate> {
        if !self.remote_description_set || self.is_closed() {
            return Vec::new();
        }
        self.pending.drain()
    }

    fn transition(
        &mut self,
        role: Role,
        from: NegotiationState,
        to: NegotiationState,
        event: &'static str,
    ) -> Result<()> {
        if self.role != role || self.state != from {
            return Err(SignalError::InvalidTransition {
                from: self.state.name(),
                event,
            });
        }
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"))
    }

    #[test]
    fn host_walks_full_lifecycle() {
        let mut slot = PeerSlot::new(Role::Host, 8);
        assert!(!slot.accepts_answer());
        slot.offer_sent().unwrap();
        assert!(slot.accepts_answer());
        slot.remote_description_applied().unwrap();
        assert_eq!(slot.state(), NegotiationState::Answered);
        assert!(!slot.accepts_answer());
        assert!(slot.connected());
        assert!(!slot.connected());
        assert!(slot.close());
        assert!(!slot.close());
    }

    #[test]
    fn viewer_walks_full_lifecycle() {
        let mut slot = PeerSlot::new(Role::Viewer, 8);
        assert!(slot.accepts_offer());
        slot.remote_description_applied().unwrap();
        assert_eq!(slot.state(), NegotiationState::OfferReceived);
        assert!(!slot.accepts_offer());
        slot.answer_sent().unwrap();
        assert_eq!(slot.state(), NegotiationState::Answered);
        assert!(slot.connected());
    }

    #[test]
    fn out_of_order_transitions_are_rejected() {
        let mut host = PeerSlot::new(Role::Host, 8);
        assert!(host.remote_description_applied().is_err());
        assert!(host.answer_sent().is_err());

        let mut viewer = PeerSlot::new(Role::Viewer, 8);
        assert!(viewer.offer_sent().is_err());
        assert!(!viewer.accepts_answer());
        assert!(!viewer.connected());
    }

    #[test]
    fn candidates_queue_until_remote_description_then_flush_in_order() {
        let mut slot = PeerSlot::new(Role::Viewer, 8);
        assert_eq!(slot.admit_candidate(cand(1)), CandidateAction::Queued);
        assert_eq!(slot.admit_candidate(cand(2)), CandidateAction::Queued);
        assert!(slot.take_pending().is_empty());
        assert_eq!(slot.pending_len(), 2);

        slot.remote_description_applied().unwrap();
        assert_eq!(slot.take_pending(), vec![cand(1), cand(2)]);
        assert!(slot.take_pending().is_empty());

        assert_eq!(slot.admit_candidate(cand(3)), CandidateAction::Apply(cand(3)));
    }

    #[test]
    fn redelivered_candidate_is_admitted_once() {
        let mut slot = PeerSlot::new(Role::Viewer, 8);
        assert!(!slot.has_remote_description());
        assert_eq!(slot.admit_candidate(cand(1)), CandidateAction::Queued);
        assert_eq!(slot.admit_candidate(cand(1)), CandidateAction::Duplicate);
        assert_eq!(slot.pending_len(), 1);

        slot.remote_description_applied().unwrap();
        assert!(slot.has_remote_description());
        assert_eq!(slot.take_pending(), vec![cand(1)]);
        assert_eq!(slot.admit_candidate(cand(1)), CandidateAction::Duplicate);
        assert_eq!(slot.admit_candidate(cand(2)), CandidateAction::Apply(cand(2)));
        assert_eq!(slot.admit_candidate(cand(2)), CandidateAction::Duplicate);

        // тот же текст, но другая m-line: отдельный кандидат
        let mut other_line = cand(2);
        other_line.sdp_mline_index = Some(1);
        assert_eq!(
            slot.admit_candidate(other_line.clone()),
            CandidateAction::Apply(other_line)
        );
    }

    #[test]
    fn overflowed_candidate_can_be_redelivered() {
        let mut slot = PeerSlot::new(Role::Host, 1);
        slot.offer_sent().unwrap();
        assert_eq!(slot.admit_candidate(cand(1)), CandidateAction::Queued);
        assert_eq!(slot.admit_candidate(cand(2)), CandidateAction::Dropped);
        slot.remote_description_applied().unwrap();
        assert_eq!(slot.take_pending(), vec![cand(1)]);
        assert_eq!(slot.admit_candidate(cand(2)), CandidateAction::Apply(cand(2)));
    }

    #[test]
    fn pending_queue_is_bounded() {
        let mut slot = PeerSlot::new(Role::Host, 2);
        assert_eq!(slot.admit_candidate(cand(1)), CandidateAction::Queued);
        assert_eq!(slot.admit_candidate(cand(2)), CandidateAction::Queued);
        assert_eq!(slot.admit_candidate(cand(3)), CandidateAction::Dropped);
        assert_eq!(slot.pending_len(), 2);
    }

    #[test]
    fn closed_slot_drops_everything() {
        let mut slot = PeerSlot::new(Role::Host, 4);
        slot.admit_candidate(cand(1));
        slot.close();
        assert_eq!(slot.pending_len(), 0);
        assert_eq!(slot.admit_candidate(cand(2)), CandidateAction::Dropped);
    }
}
