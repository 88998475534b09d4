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

//! Record of the escrow deposits and of the distribution transaction spending them.
//!
//! Deposits are write-once per role. The distribution transaction is built in round 0 and
//! collects one signature per following round until [`SIGNATURE_THRESHOLD`] is reached; a round
//! can never be replayed or skipped.

use bitcoin::{OutPoint, Script, Txid};
use thiserror::Error;

use std::io;

use crate::consensus::{self, Decodable, Encodable};
use crate::role::{Role, RoleMap};

/// Signatures required to spend the 2-of-3 escrow.
pub const SIGNATURE_THRESHOLD: u8 = 2;

/// Escrow record errors, all of them protocol violations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// A deposit was already recorded for the role.
    #[error("A deposit is already recorded for {0}")]
    DuplicateDeposit(Role),
    /// The output announced by `role` is already the deposit of `holder`.
    #[error("Deposit of {role} spends the output already announced by {holder}")]
    DuplicateOutpoint { role: Role, holder: Role },
    /// No deposit is recorded for the role.
    #[error("No deposit recorded for {0}")]
    MissingDeposit(Role),
    /// No distribution transaction was built yet.
    #[error("No distribution transaction yet")]
    NoCandidate,
    /// The candidate carries fewer signatures than the current one, or replays the current round.
    #[error("Stale distribution transaction: {given} signature(s) while holding {current}")]
    StaleSignatureRegression { current: u8, given: u8 },
    /// The candidate skips at least one signature round.
    #[error("Distribution transaction skips rounds: {given} signature(s) while holding {current}")]
    SignatureGap { current: u8, given: u8 },
    /// More signatures than the escrow policy requires.
    #[error("{0} signatures exceed the escrow threshold")]
    ThresholdExceeded(u8),
}

/// Reference to a deposit paying the escrow address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Deposit {
    pub txid: Txid,
    pub vout: u32,
    pub script: Script,
}

impl Deposit {
    pub fn new(txid: Txid, vout: u32, script: Script) -> Self {
        Self { txid, vout, script }
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }
}

impl Encodable for Deposit {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = self.txid.consensus_encode(writer)?;
        len += self.vout.consensus_encode(writer)?;
        Ok(len + self.script.consensus_encode(writer)?)
    }
}

impl Decodable for Deposit {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(Deposit {
            txid: Decodable::consensus_decode(d)?,
            vout: Decodable::consensus_decode(d)?,
            script: Decodable::consensus_decode(d)?,
        })
    }
}

/// Escrow deposits and the cooperatively built distribution transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EscrowRecord {
    candidate: Option<Vec<u8>>,
    signed_count: u8,
    deposits: RoleMap<Option<Deposit>>,
    // set once a recovery path exists for the deposit (refund observed)
    reclaimable: RoleMap<bool>,
}

impl EscrowRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether `deposit` can be recorded for `role`, without mutating. Each role funds
    /// its share with its own output.
    pub fn check_deposit(&self, role: Role, deposit: &Deposit) -> Result<(), Error> {
        if self.deposits[role].is_some() {
            return Err(Error::DuplicateDeposit(role));
        }
        let outpoint = deposit.outpoint();
        match Role::ALL.into_iter().find(|holder| {
            self.deposits[*holder]
                .as_ref()
                .map(|d| d.outpoint() == outpoint)
                .unwrap_or(false)
        }) {
            Some(holder) => Err(Error::DuplicateOutpoint { role, holder }),
            None => Ok(()),
        }
    }

    pub fn record_deposit(&mut self, role: Role, deposit: Deposit) -> Result<(), Error> {
        self.check_deposit(role, &deposit)?;
        self.deposits[role] = Some(deposit);
        Ok(())
    }

    pub fn deposit(&self, role: Role) -> Option<&Deposit> {
        self.deposits[role].as_ref()
    }

    /// All three deposits, once recorded.
    pub fn deposits(&self) -> Option<[Deposit; 3]> {
        Some([
            self.deposit(Role::Sender)?.clone(),
            self.deposit(Role::Mixer)?.clone(),
            self.deposit(Role::Guarantor)?.clone(),
        ])
    }

    pub fn all_deposits_recorded(&self) -> bool {
        self.deposits.all(Option::is_some)
    }

    pub fn any_deposit_recorded(&self) -> bool {
        self.deposits.any(Option::is_some)
    }

    /// Check whether a candidate with `signed_count` signatures is the next expected one.
    pub fn check_candidate(&self, signed_count: u8) -> Result<(), Error> {
        let current = self.signed_count;
        if signed_count > SIGNATURE_THRESHOLD {
            return Err(Error::ThresholdExceeded(signed_count));
        }
        if signed_count < current || (signed_count == current && self.candidate.is_some()) {
            return Err(Error::StaleSignatureRegression {
                current,
                given: signed_count,
            });
        }
        if signed_count > current + 1 {
            return Err(Error::SignatureGap {
                current,
                given: signed_count,
            });
        }
        Ok(())
    }

    /// Replace the candidate distribution transaction by the next round.
    pub fn set_candidate_tx(&mut self, tx: Vec<u8>, signed_count: u8) -> Result<(), Error> {
        self.check_candidate(signed_count)?;
        self.candidate = Some(tx);
        self.signed_count = signed_count;
        Ok(())
    }

    pub fn candidate_tx(&self) -> Option<&[u8]> {
        self.candidate.as_deref()
    }

    pub fn signed_count(&self) -> u8 {
        self.signed_count
    }

    /// The candidate carries enough signatures to be broadcast.
    pub fn is_fully_signed(&self) -> bool {
        self.candidate.is_some() && self.signed_count == SIGNATURE_THRESHOLD
    }

    /// Mark the deposit of `role` as recoverable without the cooperation of the other parties.
    pub fn mark_reclaimable(&mut self, role: Role) -> Result<(), Error> {
        if self.deposits[role].is_none() {
            return Err(Error::MissingDeposit(role));
        }
        self.reclaimable[role] = true;
        Ok(())
    }

    pub fn is_reclaimable(&self, role: Role) -> bool {
        self.reclaimable[role]
    }

    /// Roles with a recorded deposit that has no recovery path.
    pub fn unreclaimed(&self) -> Vec<Role> {
        Role::ALL
            .into_iter()
            .filter(|role| self.deposits[*role].is_some() && !self.reclaimable[*role])
            .collect()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl Encodable for EscrowRecord {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = self.candidate.consensus_encode(writer)?;
        len += self.signed_count.consensus_encode(writer)?;
        len += self.deposits.consensus_encode(writer)?;
        Ok(len + self.reclaimable.consensus_encode(writer)?)
    }
}

impl Decodable for EscrowRecord {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        let record = EscrowRecord {
            candidate: Decodable::consensus_decode(d)?,
            signed_count: Decodable::consensus_decode(d)?,
            deposits: Decodable::consensus_decode(d)?,
            reclaimable: Decodable::consensus_decode(d)?,
        };
        if record.signed_count > SIGNATURE_THRESHOLD {
            return Err(consensus::Error::ParseFailed("signature count above threshold"));
        }
        Ok(record)
    }
}
