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

//! Wallet primitives the protocol relies on: building, signing and broadcasting the distribution
//! transaction, and deriving the 2-of-3 escrow from the participants' keys.

use bitcoin::{PublicKey, Script};
use thiserror::Error;

use std::error;
use std::io;

use crate::consensus::{self, Decodable, Encodable};
use crate::escrow::Deposit;
use crate::schedule::{Address, Payout};

/// A list specifying general categories of wallet error.
#[derive(Error, Debug)]
pub enum Error {
    /// The wallet is locked and cannot sign.
    #[error("Wallet is locked")]
    Locked,
    /// The private key for the public key is not in the wallet.
    #[error("Missing private key for {0}")]
    MissingKey(PublicKey),
    /// The transaction given to the wallet cannot be parsed or does not spend the escrow.
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    /// The network refused the transaction.
    #[error("Broadcast rejected: {0}")]
    BroadcastRejected(String),
    /// Any wallet error not part of this list.
    #[error("Wallet error: {0}")]
    Other(Box<dyn error::Error + Send + Sync>),
}

impl Error {
    /// Creates a new wallet error of type other with an arbitrary payload.
    pub fn new<E>(error: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }

    /// Consumes the `Error`, returning its inner error (if any).
    ///
    /// If this [`enum@Error`] was constructed via [`new`] then this function will return [`Some`],
    /// otherwise it will return [`None`].
    ///
    /// [`new`]: Error::new
    ///
    pub fn into_inner(self) -> Option<Box<dyn error::Error + Send + Sync>> {
        match self {
            Self::Other(error) => Some(error),
            _ => None,
        }
    }
}

/// Coin selection constraints, opaque to the protocol and handed back to the wallet untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoinConstraints(pub Vec<u8>);

impl Encodable for CoinConstraints {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.0.consensus_encode(writer)
    }
}

impl Decodable for CoinConstraints {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(Self(Decodable::consensus_decode(d)?))
    }
}

/// The escrow address and the script encoding its 2-of-3 spending policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MultisigEscrow {
    pub address: Address,
    pub script: Script,
}

impl Encodable for MultisigEscrow {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        Ok(self.address.consensus_encode(writer)? + self.script.consensus_encode(writer)?)
    }
}

impl Decodable for MultisigEscrow {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(Self {
            address: Decodable::consensus_decode(d)?,
            script: Decodable::consensus_decode(d)?,
        })
    }
}

/// The node wallet. Transactions are exchanged as serialized bytes, partially signed
/// transactions included.
pub trait Wallet {
    /// Build the unsigned distribution transaction spending `inputs` to `outputs`.
    fn build_transaction(
        &self,
        inputs: &[Deposit],
        outputs: &[Payout],
        constraints: &CoinConstraints,
    ) -> Result<Vec<u8>, Error>;

    /// Returns true if `candidate` spends exactly `inputs` to exactly `outputs`, whatever the
    /// signatures it already carries.
    fn verify_distribution(
        &self,
        candidate: &[u8],
        inputs: &[Deposit],
        outputs: &[Payout],
    ) -> Result<bool, Error>;

    /// Add the signature of the private key matching `key`, returns the new transaction and the
    /// number of signatures it now carries.
    fn sign(&self, candidate: &[u8], key: &PublicKey) -> Result<(Vec<u8>, u8), Error>;

    /// Relay a fully signed transaction to the network.
    fn broadcast(&self, final_tx: &[u8]) -> Result<(), Error>;

    /// Derive the escrow address requiring `threshold` signatures out of `pubkeys`.
    fn derive_multisig(&self, pubkeys: &[PublicKey; 3], threshold: u8)
        -> Result<MultisigEscrow, Error>;
}
