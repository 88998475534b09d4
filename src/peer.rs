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

//! Handles on network peers. Connections are owned by the networking layer; the protocol only
//! keeps their identifiers and asks the layer whether they are still alive.

/// Stable identifier of a peer connection, assigned by the networking layer.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[display("peer#{0}")]
pub struct PeerId(pub u64);

/// Lookup table maintained by the networking layer.
pub trait Peers {
    /// Returns true while the connection identified by `peer` is open.
    fn is_connected(&self, peer: PeerId) -> bool;
}

impl<F> Peers for F
where
    F: Fn(PeerId) -> bool,
{
    fn is_connected(&self, peer: PeerId) -> bool {
        self(peer)
    }
}
