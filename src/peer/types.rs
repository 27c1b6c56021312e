use serde::{Deserialize, Serialize};

use crate::error::{Result, SignalError};

/// Тип SDP в терминах документа: `offer` или `answer`
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description в том виде, в котором она лежит в документе
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE кандидат: стандартный набор полей RTCIceCandidateInit
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

/// Подколлекция кандидатов под записью зрителя
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateDirection {
    /// Пишет хост
    #[serde(rename = "creatorCandidates")]
    Creator,
    /// Пишет зритель
    #[serde(rename = "viewerCandidates")]
    Viewer,
}

impl CandidateDirection {
    pub fn collection(self) -> &'static str {
        match self {
            Self::Creator => "creatorCandidates",
            Self::Viewer => "viewerCandidates",
        }
    }
}

/// Состояние записи зрителя. Ответ без offer не выражается типом.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerRecord {
    Empty,
    Joined,
    Offered {
        joined: bool,
        offer: SessionDescription,
    },
    Answered {
        joined: bool,
        offer: SessionDescription,
        answer: SessionDescription,
    },
}

/// Частичная запись (merge) в документ зрителя
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerPatch {
    /// `joined = true`, пишет зритель
    Join,
    /// `offer`, пишет хост
    Offer(SessionDescription),
    /// `answer`, пишет зритель
    Answer(SessionDescription),
}

impl ViewerPatch {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join => "joined",
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
        }
    }
}

impl ViewerRecord {
    pub fn is_joined(&self) -> bool {
        match self {
            Self::Empty => false,
            Self::Joined => true,
            Self::Offered { joined, .. } | Self::Answered { joined, .. } => *joined,
        }
    }

    pub fn offer(&self) -> Option<&SessionDescription> {
        match self {
            Self::Offered { offer, .. } | Self::Answered { offer, .. } => Some(offer),
            _ => None,
        }
    }

    pub fn answer(&self) -> Option<&SessionDescription> {
        match self {
            Self::Answered { answer, .. } => Some(answer),
            _ => None,
        }
    }

    /// Применяет merge-запись. Каждое поле пишется один раз; повторный
    /// join идемпотентен.
    pub fn apply(&self, patch: ViewerPatch) -> Result<ViewerRecord> {
        match (self, patch) {
            (Self::Empty, ViewerPatch::Join) => Ok(Self::Joined),
            (Self::Offered { offer, .. }, ViewerPatch::Join) => Ok(Self::Offered {
                joined: true,
                offer: offer.clone(),
            }),
            (Self::Answered { offer, answer, .. }, ViewerPatch::Join) => Ok(Self::Answered {
                joined: true,
                offer: offer.clone(),
                answer: answer.clone(),
            }),
            (Self::Joined, ViewerPatch::Join) => Ok(Self::Joined),

            (Self::Empty | Self::Joined, ViewerPatch::Offer(offer)) => {
                check_kind(&offer, SdpKind::Offer)?;
                Ok(Self::Offered {
                    joined: self.is_joined(),
                    offer,
                })
            }
            (Self::Offered { .. } | Self::Answered { .. }, ViewerPatch::Offer(_)) => Err(
                SignalError::RecordConflict("offer already written".into()),
            ),

            (Self::Offered { joined, offer }, ViewerPatch::Answer(answer)) => {
                check_kind(&answer, SdpKind::Answer)?;
                Ok(Self::Answered {
                    joined: *joined,
                    offer: offer.clone(),
                    answer,
                })
            }
            (Self::Answered { .. }, ViewerPatch::Answer(_)) => Err(SignalError::RecordConflict(
                "answer already written".into(),
            )),
            (Self::Empty | Self::Joined, ViewerPatch::Answer(_)) => Err(
                SignalError::RecordConflict("answer without offer".into()),
            ),
        }
    }
}

fn check_kind(desc: &SessionDescription, expected: SdpKind) -> Result<()> {
    if desc.kind != expected {
        return Err(SignalError::RecordConflict(format!(
            "expected {:?} description, got {:?}",
            expected, desc.kind
        )));
    }
    Ok(())
}

/// Плоская форма документа зрителя, как её хранит документная БД
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewerDocument {
    #[serde(default)]
    pub joined: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
}

impl From<&ViewerRecord> for ViewerDocument {
    fn from(record: &ViewerRecord) -> Self {
        ViewerDocument {
            joined: record.is_joined(),
            offer: record.offer().cloned(),
            answer: record.answer().cloned(),
        }
    }
}

impl TryFrom<ViewerDocument> for ViewerRecord {
    type Error = SignalError;

    fn try_from(doc: ViewerDocument) -> Result<Self> {
        match (doc.offer, doc.answer) {
            (None, None) if doc.joined => Ok(ViewerRecord::Joined),
            (None, None) => Ok(ViewerRecord::Empty),
            (Some(offer), None) => Ok(ViewerRecord::Offered {
                joined: doc.joined,
                offer,
            }),
            (Some(offer), Some(answer)) => Ok(ViewerRecord::Answered {
                joined: doc.joined,
                offer,
                answer,
            }),
            (None, Some(_)) => Err(SignalError::RecordConflict(
                "answer present without offer".into(),
            )),
        }
    }
}

/// Тип ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IceServerKind {
    Stun,
    Turn,
}

/// Конфигурация ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: IceServerKind,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_walks_join_offer_answer() {
        let rec = ViewerRecord::Empty.apply(ViewerPatch::Join).unwrap();
        assert_eq!(rec, ViewerRecord::Joined);

        let rec = rec
            .apply(ViewerPatch::Offer(SessionDescription::offer("o")))
            .unwrap();
        assert!(rec.is_joined());
        assert_eq!(rec.offer().map(|d| d.sdp.as_str()), Some("o"));
        assert!(rec.answer().is_none());

        let rec = rec
            .apply(ViewerPatch::Answer(SessionDescription::answer("a")))
            .unwrap();
        assert_eq!(rec.answer().map(|d| d.sdp.as_str()), Some("a"));

        // повторный join не затирает offer/answer
        let again = rec.apply(ViewerPatch::Join).unwrap();
        assert_eq!(again, rec);
    }

    #[test]
    fn record_rejects_second_offer_and_orphan_answer() {
        let offered = ViewerRecord::Joined
            .apply(ViewerPatch::Offer(SessionDescription::offer("o")))
            .unwrap();
        assert!(matches!(
            offered.apply(ViewerPatch::Offer(SessionDescription::offer("o2"))),
            Err(SignalError::RecordConflict(_))
        ));
        assert!(matches!(
            ViewerRecord::Joined.apply(ViewerPatch::Answer(SessionDescription::answer("a"))),
            Err(SignalError::RecordConflict(_))
        ));
        assert!(matches!(
            ViewerRecord::Joined.apply(ViewerPatch::Offer(SessionDescription::answer("x"))),
            Err(SignalError::RecordConflict(_))
        ));
    }

    #[test]
    fn document_schema_matches_store_layout() {
        let rec = ViewerRecord::Offered {
            joined: true,
            offer: SessionDescription::offer("v=0"),
        };
        let json = serde_json::to_value(ViewerDocument::from(&rec)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"joined": true, "offer": {"type": "offer", "sdp": "v=0"}})
        );

        let back: ViewerDocument = serde_json::from_value(json).unwrap();
        assert_eq!(ViewerRecord::try_from(back).unwrap(), rec);
    }

    #[test]
    fn document_with_answer_but_no_offer_is_rejected() {
        let doc: ViewerDocument = serde_json::from_value(serde_json::json!({
            "joined": true,
            "answer": {"type": "answer", "sdp": "v=0"}
        }))
        .unwrap();
        assert!(ViewerRecord::try_from(doc).is_err());

        let empty: ViewerDocument = serde_json::from_str("{}").unwrap();
        assert_eq!(ViewerRecord::try_from(empty).unwrap(), ViewerRecord::Empty);
    }

    #[test]
    fn candidate_uses_browser_field_names() {
        let candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host");
        let json = serde_json::to_value(candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        assert!(json.get("usernameFragment").is_none());
    }
}
