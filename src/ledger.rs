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

//! Read access to the validated chain state, used to check escrow deposits before anyone signs
//! the distribution transaction.

use bitcoin::{Amount, Script, Txid};
use thiserror::Error;

use std::error;

use crate::schedule::Address;

/// Errors returned by the chain validation backend. [`Self::Other`] can carry out errors from
/// external sources.
#[derive(Error, Debug)]
pub enum Error {
    /// The backend is not synchronized or not reachable.
    #[error("Chain state unavailable")]
    Unavailable,
    /// Any validation backend error not part of this list.
    #[error("Ledger error: {0}")]
    Other(Box<dyn error::Error + Send + Sync>),
}

impl Error {
    /// Creates a new ledger error of type other with an arbitrary payload.
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

/// An unspent output as seen by the validation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub amount: Amount,
    pub script: Script,
}

/// Validation and storage backend of the node.
pub trait Ledger {
    /// Number of confirmations of a transaction, zero if unknown or in the mempool.
    fn confirmations(&self, txid: &Txid) -> Result<u32, Error>;

    /// The unspent output `txid:vout`, if any.
    fn get_output(&self, txid: &Txid, vout: u32) -> Result<Option<TxOutput>, Error>;

    /// Returns true if `txid:vout` is confirmed and pays at least `min_amount` to `address`.
    fn is_confirmed_paying(
        &self,
        txid: &Txid,
        vout: u32,
        address: &Address,
        min_amount: Amount,
    ) -> Result<bool, Error>;
}
