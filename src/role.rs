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

//! Roles played by the three participants of an anonymous transaction and a small map indexed
//! by role, used wherever the protocol keeps one value per participant.

use std::io;
use std::ops::{Index, IndexMut};
use std::str::FromStr;

use crate::consensus::{self, Decodable, Encodable};

/// The three roles of an anonymous transaction. Each node plays exactly one role per session.
#[derive(Display, Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[display(Debug)]
pub enum Role {
    /// Wants to break the link between its source coins and its destination addresses.
    Sender,
    /// Pays the destinations with its own coins and receives the Sender's escrowed coins.
    Mixer,
    /// Adds collateral and the signature weight needed to settle disputes.
    Guarantor,
}

impl Role {
    /// All roles, in signing order.
    pub const ALL: [Role; 3] = [Role::Sender, Role::Mixer, Role::Guarantor];

    /// Position of the role in [`Self::ALL`].
    pub fn index(self) -> usize {
        match self {
            Role::Sender => 0,
            Role::Mixer => 1,
            Role::Guarantor => 2,
        }
    }

    /// The distribution round this role produces: the Sender builds the transaction in round
    /// 0, the Mixer and the Guarantor add the first and second signature.
    pub fn signing_round(self) -> u8 {
        self.index() as u8
    }

    /// The role expected to produce the given distribution round, if any.
    pub fn for_round(round: u8) -> Option<Role> {
        Role::ALL.get(round as usize).copied()
    }

    /// The two roles that are not `self`.
    pub fn others(self) -> [Role; 2] {
        match self {
            Role::Sender => [Role::Mixer, Role::Guarantor],
            Role::Mixer => [Role::Sender, Role::Guarantor],
            Role::Guarantor => [Role::Sender, Role::Mixer],
        }
    }
}

impl Encodable for Role {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            Role::Sender => 0x01u8.consensus_encode(writer),
            Role::Mixer => 0x02u8.consensus_encode(writer),
            Role::Guarantor => 0x03u8.consensus_encode(writer),
        }
    }
}

impl Decodable for Role {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        match Decodable::consensus_decode(d)? {
            0x01u8 => Ok(Role::Sender),
            0x02u8 => Ok(Role::Mixer),
            0x03u8 => Ok(Role::Guarantor),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

impl_strict_encoding!(Role);

impl FromStr for Role {
    type Err = consensus::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Sender" | "sender" => Ok(Role::Sender),
            "Mixer" | "mixer" => Ok(Role::Mixer),
            "Guarantor" | "guarantor" => Ok(Role::Guarantor),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

/// One value per [`Role`], stored in a fixed array indexed by the role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleMap<T>([T; 3]);

impl<T> RoleMap<T> {
    /// Build a map by calling `f` once per role.
    pub fn from_fn(mut f: impl FnMut(Role) -> T) -> Self {
        RoleMap([f(Role::Sender), f(Role::Mixer), f(Role::Guarantor)])
    }

    /// Iterate over `(role, value)` pairs in signing order.
    pub fn iter(&self) -> impl Iterator<Item = (Role, &T)> {
        Role::ALL.into_iter().zip(self.0.iter())
    }

    /// Mutably iterate over `(role, value)` pairs in signing order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Role, &mut T)> {
        Role::ALL.into_iter().zip(self.0.iter_mut())
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.0.iter()
    }

    /// Returns true if `pred` holds for every role.
    pub fn all(&self, pred: impl FnMut(&T) -> bool) -> bool {
        self.0.iter().all(pred)
    }

    /// Returns true if `pred` holds for at least one role.
    pub fn any(&self, pred: impl FnMut(&T) -> bool) -> bool {
        self.0.iter().any(pred)
    }
}

impl<T> Index<Role> for RoleMap<T> {
    type Output = T;

    fn index(&self, role: Role) -> &T {
        &self.0[role.index()]
    }
}

impl<T> IndexMut<Role> for RoleMap<T> {
    fn index_mut(&mut self, role: Role) -> &mut T {
        &mut self.0[role.index()]
    }
}

impl<T> Encodable for RoleMap<T>
where
    T: Encodable,
{
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = 0;
        for value in self.values() {
            len += value.consensus_encode(writer)?;
        }
        Ok(len)
    }
}

impl<T> Decodable for RoleMap<T>
where
    T: Decodable,
{
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(RoleMap([
            Decodable::consensus_decode(d)?,
            Decodable::consensus_decode(d)?,
            Decodable::consensus_decode(d)?,
        ]))
    }
}
