use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::IceCandidate;

/// Progress of one side of an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "error", rename_all = "snake_case")]
pub enum SidePhase {
    Active,
    Done,
    Failed(String),
}

impl SidePhase {
    pub fn is_active(&self) -> bool {
        matches!(self, SidePhase::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerSide {
    pub sdp: String,
    pub disable_trickle: bool,
    pub candidates: Vec<IceCandidate>,
    pub phase: SidePhase,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AnswererSide {
    Unanswered,
    /// The answerer gave up before producing an SDP.
    Failed { error: String },
    Answered {
        sdp: String,
        candidates: Vec<IceCandidate>,
        phase: SidePhase,
    },
}

/// Persisted record of one offer/answer negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeDocument {
    pub id: String,
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub caller: CallerSide,
    pub answerer: AnswererSide,
}

/// A single mutation of an [`ExchangeDocument`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DocumentUpdate {
    CallerCandidate { candidate: IceCandidate },
    CallerDone,
    CallerError { error: String },
    AnswererInit { sdp: String },
    AnswererCandidate { candidate: IceCandidate },
    AnswererDone,
    AnswererError { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IllegalTransition {
    #[error("caller already finished")]
    CallerFinished,
    #[error("answerer already finished")]
    AnswererFinished,
    #[error("answerer already answered")]
    AlreadyAnswered,
    #[error("answerer has not answered yet")]
    NotAnswered,
}

impl ExchangeDocument {
    pub fn new(
        id: String,
        host: String,
        sdp: String,
        disable_trickle: bool,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            host,
            started_at,
            caller: CallerSide {
                sdp,
                disable_trickle,
                candidates: Vec::new(),
                // complete SDPs never trickle
                phase: if disable_trickle {
                    SidePhase::Done
                } else {
                    SidePhase::Active
                },
            },
            answerer: AnswererSide::Unanswered,
        }
    }

    pub fn is_unanswered(&self) -> bool {
        matches!(self.answerer, AnswererSide::Unanswered)
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: std::time::Duration) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => self.started_at + ttl <= now,
            Err(_) => false,
        }
    }

    pub fn apply(&mut self, update: DocumentUpdate) -> Result<(), IllegalTransition> {
        match update {
            DocumentUpdate::CallerCandidate { candidate } => {
                self.caller_active()?;
                self.caller.candidates.push(candidate);
            }
            DocumentUpdate::CallerDone => {
                self.caller_active()?;
                self.caller.phase = SidePhase::Done;
            }
            DocumentUpdate::CallerError { error } => {
                self.caller_active()?;
                self.caller.phase = SidePhase::Failed(error);
            }
            DocumentUpdate::AnswererInit { sdp } => {
                match &self.answerer {
                    AnswererSide::Unanswered => {}
                    AnswererSide::Failed { .. } => return Err(IllegalTransition::AnswererFinished),
                    AnswererSide::Answered { .. } => return Err(IllegalTransition::AlreadyAnswered),
                }
                self.answerer = AnswererSide::Answered {
                    sdp,
                    candidates: Vec::new(),
                    phase: SidePhase::Active,
                };
            }
            DocumentUpdate::AnswererCandidate { candidate } => match &mut self.answerer {
                AnswererSide::Answered {
                    candidates, phase, ..
                } if phase.is_active() => candidates.push(candidate),
                AnswererSide::Unanswered => return Err(IllegalTransition::NotAnswered),
                _ => return Err(IllegalTransition::AnswererFinished),
            },
            DocumentUpdate::AnswererDone => match &mut self.answerer {
                AnswererSide::Answered { phase, .. } if phase.is_active() => {
                    *phase = SidePhase::Done;
                }
                AnswererSide::Unanswered => return Err(IllegalTransition::NotAnswered),
                _ => return Err(IllegalTransition::AnswererFinished),
            },
            DocumentUpdate::AnswererError { error } => {
                if self.is_unanswered() {
                    self.answerer = AnswererSide::Failed { error };
                    return Ok(());
                }
                match &mut self.answerer {
                    AnswererSide::Answered { phase, .. } if phase.is_active() => {
                        *phase = SidePhase::Failed(error);
                    }
                    _ => return Err(IllegalTransition::AnswererFinished),
                }
            }
        }
        Ok(())
    }

    fn caller_active(&self) -> Result<(), IllegalTransition> {
        if self.caller.phase.is_active() {
            Ok(())
        } else {
            Err(IllegalTransition::CallerFinished)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(disable_trickle: bool) -> ExchangeDocument {
        ExchangeDocument::new(
            "id".into(),
            "host".into(),
            "offer".into(),
            disable_trickle,
            Utc::now(),
        )
    }

    fn candidate() -> IceCandidate {
        IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: None,
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test_timeout::timeout]
    fn complete_offers_start_with_caller_done() {
        let mut doc = doc(true);
        assert_eq!(doc.caller.phase, SidePhase::Done);
        assert_eq!(
            doc.apply(DocumentUpdate::CallerCandidate {
                candidate: candidate()
            }),
            Err(IllegalTransition::CallerFinished)
        );
    }

    #[test_timeout::timeout]
    fn answerer_walks_through_its_phases() {
        let mut doc = doc(false);
        assert_eq!(
            doc.apply(DocumentUpdate::AnswererDone),
            Err(IllegalTransition::NotAnswered)
        );
        doc.apply(DocumentUpdate::AnswererInit {
            sdp: "answer".into(),
        })
        .unwrap();
        doc.apply(DocumentUpdate::AnswererCandidate {
            candidate: candidate(),
        })
        .unwrap();
        assert_eq!(
            doc.apply(DocumentUpdate::AnswererInit { sdp: "again".into() }),
            Err(IllegalTransition::AlreadyAnswered)
        );
        doc.apply(DocumentUpdate::AnswererDone).unwrap();
        assert_eq!(
            doc.apply(DocumentUpdate::AnswererError {
                error: "late".into()
            }),
            Err(IllegalTransition::AnswererFinished)
        );
        match &doc.answerer {
            AnswererSide::Answered {
                sdp,
                candidates,
                phase,
            } => {
                assert_eq!(sdp, "answer");
                assert_eq!(candidates.len(), 1);
                assert_eq!(*phase, SidePhase::Done);
            }
            other => panic!("unexpected answerer state {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn unanswered_error_marks_the_answerer_failed() {
        let mut doc = doc(false);
        doc.apply(DocumentUpdate::AnswererError {
            error: "whoops".into(),
        })
        .unwrap();
        assert_eq!(
            doc.answerer,
            AnswererSide::Failed {
                error: "whoops".into()
            }
        );
        assert!(!doc.is_unanswered());
    }

    #[test_timeout::timeout]
    fn documents_expire_after_ttl() {
        let mut doc = doc(true);
        doc.started_at = Utc::now() - chrono::Duration::seconds(30);
        assert!(doc.is_expired(Utc::now(), std::time::Duration::from_secs(10)));
        assert!(!doc.is_expired(Utc::now(), std::time::Duration::from_secs(60)));
    }
}
