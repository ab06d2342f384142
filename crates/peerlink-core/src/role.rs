use std::fmt;

use thiserror::Error;

use crate::model::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionRole {
    #[default]
    Undetermined,
    Offering,
    Answering,
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRole::Undetermined => f.write_str("undetermined"),
            SessionRole::Offering => f.write_str("offering"),
            SessionRole::Answering => f.write_str("answering"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoleError {
    #[error("session role already assigned as {role} with remote {remote}")]
    AlreadyAssigned { role: SessionRole, remote: PeerId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleRejection {
    /// Offer from a peer other than the one this session negotiates with.
    CrossTalk { active: PeerId, sender: PeerId },
    /// Both sides offered to each other; the local offer stands.
    Glare { remote: PeerId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferDecision {
    /// First inbound offer: role is now Answering with `remote` set.
    Accepted,
    /// Repeat offer from the current remote, e.g. after an ICE restart.
    Renegotiate,
    Rejected(RoleRejection),
}

/// Decides which side offers and tracks who the remote is. The role is set
/// once; the remote is only ever replaced as a whole.
#[derive(Debug, Default)]
pub struct RoleCoordinator {
    role: SessionRole,
    remote: Option<PeerId>,
}

impl RoleCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn remote(&self) -> Option<&PeerId> {
        self.remote.as_ref()
    }

    fn assigned(&self) -> Option<RoleError> {
        match (self.role, &self.remote) {
            (SessionRole::Undetermined, _) | (_, None) => None,
            (role, Some(remote)) => Some(RoleError::AlreadyAssigned {
                role,
                remote: remote.clone(),
            }),
        }
    }

    pub fn begin_as_initiator(&mut self, remote: PeerId) -> Result<(), RoleError> {
        if let Some(err) = self.assigned() {
            return Err(err);
        }
        self.role = SessionRole::Offering;
        self.remote = Some(remote);
        Ok(())
    }

    pub fn on_inbound_offer(&mut self, sender: &PeerId) -> OfferDecision {
        match (self.role, &self.remote) {
            (SessionRole::Answering, Some(active)) if active == sender => OfferDecision::Renegotiate,
            (SessionRole::Offering, Some(active)) if active == sender => {
                OfferDecision::Rejected(RoleRejection::Glare {
                    remote: active.clone(),
                })
            }
            (_, Some(active)) => OfferDecision::Rejected(RoleRejection::CrossTalk {
                active: active.clone(),
                sender: sender.clone(),
            }),
            (_, None) => {
                self.role = SessionRole::Answering;
                self.remote = Some(sender.clone());
                OfferDecision::Accepted
            }
        }
    }

    pub fn accepts_answer_from(&self, sender: &PeerId) -> bool {
        self.role == SessionRole::Offering && self.remote.as_ref() == Some(sender)
    }
}
