//! Multi-user chat occupant tracking
//!
//! The adapter is a MUC *client*: it joins rooms, observes occupant
//! presence, and surfaces membership changes as an ordered event stream.
//! Room-server semantics live on the chat service.

use crate::jid::Jid;
use crate::stanza::{Message, Presence};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;

/// Bare JID of a chat room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomJid(Jid);

impl RoomJid {
    /// Wrap a JID as a room address. The resource, if any, is stripped.
    pub fn new(jid: Jid) -> Self {
        Self(jid.to_bare())
    }

    pub fn parse(s: &str) -> Result<Self, crate::error::XmppError> {
        Ok(Self::new(Jid::parse(s)?))
    }

    pub fn jid(&self) -> &Jid {
        &self.0
    }

    /// The full JID of an occupant with the given nick.
    pub fn occupant(&self, nick: &str) -> OccupantJid {
        OccupantJid(self.0.with_resource(nick))
    }
}

impl fmt::Display for RoomJid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Full JID of a room occupant (`room@service/nick`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OccupantJid(Jid);

impl OccupantJid {
    /// Wrap a full JID. Returns `None` when the resource is missing.
    pub fn new(jid: Jid) -> Option<Self> {
        if jid.is_bare() {
            None
        } else {
            Some(Self(jid))
        }
    }

    pub fn jid(&self) -> &Jid {
        &self.0
    }

    pub fn room(&self) -> RoomJid {
        RoomJid(self.0.to_bare())
    }

    /// The occupant's nick (the resource component).
    pub fn nick(&self) -> &str {
        self.0.resource().expect("occupant jid always has a resource")
    }
}

impl fmt::Display for OccupantJid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Membership and traffic events for one joined room, in observation order.
#[derive(Debug, Clone)]
pub enum MucEvent {
    /// A new occupant appeared (includes our own join confirmation).
    MemberJoined {
        occupant: OccupantJid,
        presence: Presence,
    },
    /// An occupant's presence payload changed.
    PresenceUpdated {
        occupant: OccupantJid,
        presence: Presence,
    },
    /// An occupant left or was removed.
    MemberLeft { occupant: OccupantJid },
    /// A groupchat or directed message from an occupant.
    Message { from: OccupantJid, message: Message },
}

/// Per-room state held by the adapter.
pub(crate) struct RoomState {
    occupants: HashMap<String, ()>,
    events: mpsc::UnboundedSender<MucEvent>,
}

impl RoomState {
    pub fn new(events: mpsc::UnboundedSender<MucEvent>) -> Self {
        Self {
            occupants: HashMap::new(),
            events,
        }
    }

    /// Fold an occupant presence into the membership view, emitting the
    /// corresponding event. Events keep the order presences were observed.
    pub fn on_presence(&mut self, occupant: OccupantJid, presence: Presence) {
        use crate::stanza::PresenceType;
        let nick = occupant.nick().to_string();
        match presence.presence_type {
            PresenceType::Available => {
                if self.occupants.insert(nick, ()).is_none() {
                    self.emit(MucEvent::MemberJoined { occupant, presence });
                } else {
                    self.emit(MucEvent::PresenceUpdated { occupant, presence });
                }
            }
            PresenceType::Unavailable => {
                if self.occupants.remove(&nick).is_some() {
                    self.emit(MucEvent::MemberLeft { occupant });
                }
            }
        }
    }

    pub fn on_message(&self, from: OccupantJid, message: Message) {
        self.emit(MucEvent::Message { from, message });
    }

    pub fn occupant_count(&self) -> usize {
        self.occupants.len()
    }

    fn emit(&self, event: MucEvent) {
        // Receiver dropped means the consumer is gone; nothing to do.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::Presence;

    fn occupant(s: &str) -> OccupantJid {
        OccupantJid::new(Jid::parse(s).unwrap()).unwrap()
    }

    #[test]
    fn join_update_leave_sequence() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut room = RoomState::new(tx);
        let alice = occupant("r@conf.example/alice");

        room.on_presence(alice.clone(), Presence::available(alice.jid().clone()));
        room.on_presence(alice.clone(), Presence::available(alice.jid().clone()));
        room.on_presence(alice.clone(), Presence::unavailable(alice.jid().clone()));

        assert!(matches!(rx.try_recv().unwrap(), MucEvent::MemberJoined { .. }));
        assert!(matches!(rx.try_recv().unwrap(), MucEvent::PresenceUpdated { .. }));
        assert!(matches!(rx.try_recv().unwrap(), MucEvent::MemberLeft { .. }));
        assert_eq!(room.occupant_count(), 0);
    }

    #[test]
    fn leave_without_join_is_silent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut room = RoomState::new(tx);
        let bob = occupant("r@conf.example/bob");
        room.on_presence(bob.clone(), Presence::unavailable(bob.jid().clone()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn occupant_jid_requires_resource() {
        assert!(OccupantJid::new(Jid::parse("r@conf.example").unwrap()).is_none());
        let occ = occupant("r@conf.example/alice");
        assert_eq!(occ.nick(), "alice");
        assert_eq!(occ.room().to_string(), "r@conf.example");
    }
}
