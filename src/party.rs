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

//! Registry of the three participants: which role this node plays, and per role the payout
//! address, the public key used in the escrow policy and the peer connection acting in it.

use bitcoin::PublicKey;
use thiserror::Error;

use std::io;

use crate::consensus::{self, Decodable, Encodable};
use crate::peer::PeerId;
use crate::role::{Role, RoleMap};
use crate::schedule::Address;

/// Registry misuse, always a protocol violation from the caller.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// This node already plays another role in the session.
    #[error("Already playing {current}, cannot become {requested}")]
    RoleAlreadySet { current: Role, requested: Role },
    /// The role of this node is not known yet.
    #[error("The local role is not set")]
    RoleUnset,
    /// No key is registered for the role yet.
    #[error("No key registered for {0}")]
    MissingKey(Role),
    /// A different key or address was already registered for the role.
    #[error("Address and key already registered for {0}")]
    KeyAlreadySet(Role),
}

/// What is known about one participant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Party {
    pub address: Option<Address>,
    pub pubkey: Option<PublicKey>,
    pub peer: Option<PeerId>,
}

/// The three participants of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartyRegistry {
    local: Option<Role>,
    parties: RoleMap<Party>,
}

impl PartyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the role played by this node. Setting the same role twice is accepted.
    pub fn set_role(&mut self, role: Role) -> Result<(), Error> {
        match self.local {
            Some(current) if current != role => Err(Error::RoleAlreadySet {
                current,
                requested: role,
            }),
            _ => {
                self.local = Some(role);
                Ok(())
            }
        }
    }

    pub fn role(&self) -> Option<Role> {
        self.local
    }

    /// The local role, or [`Error::RoleUnset`].
    pub fn local_role(&self) -> Result<Role, Error> {
        self.local.ok_or(Error::RoleUnset)
    }

    pub fn set_peer(&mut self, role: Role, peer: PeerId) {
        self.parties[role].peer = Some(peer);
    }

    pub fn peer(&self, role: Role) -> Option<PeerId> {
        self.parties[role].peer
    }

    /// Check whether `set_address_and_key` would be accepted, without mutating.
    pub fn check_address_and_key(
        &self,
        role: Role,
        address: &Address,
        pubkey: &PublicKey,
    ) -> Result<bool, Error> {
        let party = &self.parties[role];
        match (&party.address, &party.pubkey) {
            (None, None) => Ok(true),
            (Some(a), Some(k)) if a == address && k == pubkey => Ok(false),
            _ => Err(Error::KeyAlreadySet(role)),
        }
    }

    /// Register the payout address and public key of a role. Returns `false` when the exact same
    /// values were already registered, an error if different ones were.
    pub fn set_address_and_key(
        &mut self,
        role: Role,
        address: Address,
        pubkey: PublicKey,
    ) -> Result<bool, Error> {
        let fresh = self.check_address_and_key(role, &address, &pubkey)?;
        if fresh {
            let party = &mut self.parties[role];
            party.address = Some(address);
            party.pubkey = Some(pubkey);
        }
        Ok(fresh)
    }

    pub fn address(&self, role: Role) -> Option<&Address> {
        self.parties[role].address.as_ref()
    }

    pub fn pubkey(&self, role: Role) -> Option<&PublicKey> {
        self.parties[role].pubkey.as_ref()
    }

    pub fn party(&self, role: Role) -> &Party {
        &self.parties[role]
    }

    /// Returns true iff the three roles have a public key, required to derive the escrow.
    pub fn all_keys_present(&self) -> bool {
        self.parties.all(|party| party.pubkey.is_some())
    }

    /// The three public keys in signing order, once all are known.
    pub fn keys(&self) -> Option<[PublicKey; 3]> {
        Some([
            *self.pubkey(Role::Sender)?,
            *self.pubkey(Role::Mixer)?,
            *self.pubkey(Role::Guarantor)?,
        ])
    }

    /// Known payout addresses in signing order.
    pub fn all_addresses_for_payout(&self) -> Vec<Address> {
        self.parties
            .values()
            .filter_map(|party| party.address.clone())
            .collect()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// Peer handles are connection scoped and never persisted.
impl Encodable for PartyRegistry {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = self.local.consensus_encode(writer)?;
        for party in self.parties.values() {
            len += party.address.consensus_encode(writer)?;
            len += party.pubkey.consensus_encode(writer)?;
        }
        Ok(len)
    }
}

impl Decodable for PartyRegistry {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        let local = Decodable::consensus_decode(d)?;
        let mut parties = RoleMap::<Party>::default();
        for (_, party) in parties.iter_mut() {
            party.address = Decodable::consensus_decode(d)?;
            party.pubkey = Decodable::consensus_decode(d)?;
        }
        Ok(Self { local, parties })
    }
}
