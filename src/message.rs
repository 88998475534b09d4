// Copyright 2021-2022 Farcaster Devs
//
// This library is free software; you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public
// License as published by the Free Software Foundation; either
// version 3 of the License, or (at your option) any later version.
//
// This library is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this library; if not, write to the Free Software
// Foundation, Inc., 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301, USA

//! Messages produced by state transitions. The networking layer owns their framing and
//! delivery; each transition returns the list of messages the caller must relay.

use bitcoin::PublicKey;

use crate::escrow::Deposit;
use crate::peer::PeerId;
use crate::role::Role;
use crate::schedule::{Address, FeePolicy, PayoutSchedule};
use crate::session::SessionId;

/// Content exchanged between the three participants.
#[derive(Debug, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[display(Debug)]
pub enum PeerMessage {
    /// The Sender invites a node to play `role` for the given schedule and fees.
    Invite {
        session_id: SessionId,
        role: Role,
        schedule: PayoutSchedule,
        fees: FeePolicy,
    },
    /// Payout address and escrow key of the emitting role.
    AddressAndKey {
        session_id: SessionId,
        role: Role,
        address: Address,
        pubkey: PublicKey,
    },
    /// The emitting role paid its share into the escrow.
    DepositNotice {
        session_id: SessionId,
        role: Role,
        deposit: Deposit,
    },
    /// The distribution transaction after `round`.
    SignatureRound {
        session_id: SessionId,
        round: u8,
        candidate_tx: Vec<u8>,
    },
    /// The distribution transaction was broadcast.
    Commit {
        session_id: SessionId,
        final_tx: Vec<u8>,
    },
    /// The emitting node reset the session.
    Cancel { session_id: SessionId },
}

impl PeerMessage {
    pub fn session_id(&self) -> SessionId {
        match self {
            PeerMessage::Invite { session_id, .. }
            | PeerMessage::AddressAndKey { session_id, .. }
            | PeerMessage::DepositNotice { session_id, .. }
            | PeerMessage::SignatureRound { session_id, .. }
            | PeerMessage::Commit { session_id, .. }
            | PeerMessage::Cancel { session_id } => *session_id,
        }
    }
}

/// A message to deliver to the peer playing `role`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outbound {
    pub role: Role,
    pub peer: PeerId,
    pub message: PeerMessage,
}

impl Outbound {
    /// The same message addressed to every target.
    pub fn to_all(targets: &[(Role, PeerId)], message: PeerMessage) -> Vec<Outbound> {
        targets
            .iter()
            .map(|(role, peer)| Outbound {
                role: *role,
                peer: *peer,
                message: message.clone(),
            })
            .collect()
    }
}
