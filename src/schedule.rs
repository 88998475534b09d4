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

//! Payout schedule of an anonymous transaction and the fee policy used to derive how much each
//! role must place into escrow.
//!
//! With `total` the sum of the scheduled payouts, the escrow is funded as follows:
//!
//! ```text
//! Sender:    total + mixer fee + guarantor fee + fee per party
//! Mixer:     total + fee per party
//! Guarantor: total + fee per party
//! ```
//!
//! and the distribution transaction pays the scheduled destinations, `total + mixer fee` to the
//! Mixer, `total + guarantor fee` to the Guarantor, leaving three times the fee per party to the
//! network.

use bitcoin::Amount;
use serde::ser::{Serialize, Serializer};
use thiserror::Error;
use tiny_keccak::{Hasher, Keccak};

use std::io;
use std::str::FromStr;

use crate::consensus::{self, serialize, Decodable, Encodable};
use crate::role::Role;

/// Basis points in one unit.
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Errors raised while building schedules or computing escrow amounts.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// An address cannot be empty.
    #[error("Empty address")]
    EmptyAddress,
    /// A payout must move a strictly positive amount.
    #[error("Payout to {0} has a zero amount")]
    ZeroAmount(Address),
    /// A schedule used to start a session must contain at least one payout.
    #[error("The payout schedule is empty")]
    EmptySchedule,
    /// The amounts do not fit in a 64 bits satoshi value.
    #[error("Amount overflow")]
    AmountOverflow,
    /// A payout address required to build the distribution is unknown.
    #[error("Missing payout address for {0}")]
    MissingPayoutAddress(Role),
}

/// A payout address on the chain. Addresses are opaque to the protocol, only non-emptiness is
/// enforced here; the wallet validates the format.
#[derive(Display, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[display(inner)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::EmptyAddress);
        }
        Ok(Address(s.to_string()))
    }
}

impl Encodable for Address {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.0.consensus_encode(writer)
    }
}

impl Decodable for Address {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        let s: String = Decodable::consensus_decode(d)?;
        Address::from_str(&s).map_err(consensus::Error::new)
    }
}

/// One output of the distribution transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Payout {
    pub address: Address,
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub amount: Amount,
}

impl Payout {
    pub fn new(address: Address, amount: Amount) -> Self {
        Self { address, amount }
    }
}

impl Encodable for Payout {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        Ok(self.address.consensus_encode(writer)? + self.amount.consensus_encode(writer)?)
    }
}

impl Decodable for Payout {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(Payout {
            address: Decodable::consensus_decode(d)?,
            amount: Decodable::consensus_decode(d)?,
        })
    }
}

fixed_hash::construct_fixed_hash!(
    /// Identify a payout schedule by its content. All three parties must agree on the same
    /// fingerprint before escrowing anything.
    pub struct ScheduleFingerprint(32);
);

impl Serialize for ScheduleFingerprint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(format!("{:#x}", self).as_ref())
    }
}

/// Ordered list of destination payouts, the economic purpose of the mix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayoutSchedule(Vec<Payout>);

impl PayoutSchedule {
    /// Create a schedule, every payout must have a positive amount.
    pub fn new(payouts: Vec<Payout>) -> Result<Self, Error> {
        if let Some(payout) = payouts.iter().find(|p| p.amount == Amount::ZERO) {
            return Err(Error::ZeroAmount(payout.address.clone()));
        }
        let schedule = Self(payouts);
        schedule.total()?;
        Ok(schedule)
    }

    /// The same amount sent to every destination.
    pub fn uniform(destinations: Vec<Address>, amount_each: Amount) -> Result<Self, Error> {
        Self::new(
            destinations
                .into_iter()
                .map(|address| Payout::new(address, amount_each))
                .collect(),
        )
    }

    pub fn payouts(&self) -> &[Payout] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Sum of all scheduled payouts.
    pub fn total(&self) -> Result<Amount, Error> {
        self.0.iter().try_fold(Amount::ZERO, |acc, payout| {
            acc.checked_add(payout.amount).ok_or(Error::AmountOverflow)
        })
    }

    /// Keccak-256 of the consensus encoded schedule.
    pub fn fingerprint(&self) -> ScheduleFingerprint {
        keccak_256(&[&serialize(self)])
    }

    /// Keccak-256 of the consensus encoded schedule followed by the fee policy: the terms the
    /// three parties of a session agree on.
    pub fn terms_fingerprint(&self, fees: &FeePolicy) -> ScheduleFingerprint {
        keccak_256(&[&serialize(self), &serialize(fees)])
    }
}

fn keccak_256(chunks: &[&[u8]]) -> ScheduleFingerprint {
    let mut keccak = Keccak::v256();
    let mut out = [0u8; 32];
    for chunk in chunks {
        keccak.update(chunk);
    }
    keccak.finalize(&mut out);
    ScheduleFingerprint(out)
}

impl Encodable for PayoutSchedule {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.0.consensus_encode(writer)
    }
}

impl Decodable for PayoutSchedule {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        PayoutSchedule::new(Decodable::consensus_decode(d)?).map_err(consensus::Error::new)
    }
}

/// Fees applied to an anonymous transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeePolicy {
    /// Network fee contributed by each escrow input.
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub fee_per_party: Amount,
    /// Service fee paid by the Sender to the Mixer, in basis points of the payout total.
    pub mixer_fee_bps: u16,
    /// Service fee paid by the Sender to the Guarantor, in basis points of the payout total.
    pub guarantor_fee_bps: u16,
}

impl FeePolicy {
    fn share(total: Amount, bps: u16) -> Result<Amount, Error> {
        let fee = total.as_sat() as u128 * bps as u128 / BPS_DENOMINATOR as u128;
        u64::try_from(fee)
            .map(Amount::from_sat)
            .map_err(|_| Error::AmountOverflow)
    }

    /// Fee owed by the Sender to the Mixer for the given schedule.
    pub fn mixer_fee(&self, schedule: &PayoutSchedule) -> Result<Amount, Error> {
        Self::share(schedule.total()?, self.mixer_fee_bps)
    }

    /// Fee owed by the Sender to the Guarantor for the given schedule.
    pub fn guarantor_fee(&self, schedule: &PayoutSchedule) -> Result<Amount, Error> {
        Self::share(schedule.total()?, self.guarantor_fee_bps)
    }

    /// Amount the given role must place into escrow. An empty schedule only requires the
    /// per-party protocol fee.
    pub fn required_coins(&self, role: Role, schedule: &PayoutSchedule) -> Result<Amount, Error> {
        let total = schedule.total()?;
        let base = match role {
            Role::Sender => [
                total,
                self.mixer_fee(schedule)?,
                self.guarantor_fee(schedule)?,
            ]
            .into_iter()
            .try_fold(Amount::ZERO, |acc, a| acc.checked_add(a))
            .ok_or(Error::AmountOverflow)?,
            Role::Mixer | Role::Guarantor => total,
        };
        base.checked_add(self.fee_per_party)
            .ok_or(Error::AmountOverflow)
    }

    /// Outputs of the distribution transaction spending the three escrowed deposits.
    pub fn distribution_outputs(
        &self,
        schedule: &PayoutSchedule,
        mixer: Option<&Address>,
        guarantor: Option<&Address>,
    ) -> Result<Vec<Payout>, Error> {
        let mixer = mixer.ok_or(Error::MissingPayoutAddress(Role::Mixer))?;
        let guarantor = guarantor.ok_or(Error::MissingPayoutAddress(Role::Guarantor))?;
        let total = schedule.total()?;
        let mut outputs = schedule.payouts().to_vec();
        outputs.push(Payout::new(
            mixer.clone(),
            total
                .checked_add(self.mixer_fee(schedule)?)
                .ok_or(Error::AmountOverflow)?,
        ));
        outputs.push(Payout::new(
            guarantor.clone(),
            total
                .checked_add(self.guarantor_fee(schedule)?)
                .ok_or(Error::AmountOverflow)?,
        ));
        Ok(outputs)
    }
}

impl Encodable for FeePolicy {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = self.fee_per_party.consensus_encode(writer)?;
        len += self.mixer_fee_bps.consensus_encode(writer)?;
        Ok(len + self.guarantor_fee_bps.consensus_encode(writer)?)
    }
}

impl Decodable for FeePolicy {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(FeePolicy {
            fee_per_party: Decodable::consensus_decode(d)?,
            mixer_fee_bps: Decodable::consensus_decode(d)?,
            guarantor_fee_bps: Decodable::consensus_decode(d)?,
        })
    }
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            fee_per_party: Amount::from_sat(10_000),
            mixer_fee_bps: 50,
            guarantor_fee_bps: 25,
        }
    }
}
