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

//! Escrow deposit verification. A [`VerificationPlan`] is captured from the session under its
//! lock and executed against the [`Ledger`] without holding it.

use bitcoin::Amount;
use thiserror::Error;

use std::io;

use crate::consensus::{self, Decodable, Encodable};
use crate::escrow::Deposit;
use crate::ledger::{self, Ledger};
use crate::role::Role;
use crate::schedule::Address;

/// Reasons a deposit does not secure its share of the escrow.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowFailure {
    /// The deposit does not have enough confirmations yet.
    #[error("Deposit of {role} has {confirmations} confirmation(s), {required} required")]
    InsufficientConfirmations {
        role: Role,
        confirmations: u32,
        required: u32,
    },
    /// The announced output does not exist or is already spent.
    #[error("Deposit output of {0} not found")]
    MissingOutput(Role),
    /// The output's locking script differs from the announced one.
    #[error("Deposit of {0} does not match the announced locking script")]
    ScriptMismatch(Role),
    /// The deposit is below the role's share.
    #[error("Deposit of {role} is underpaid: {actual} sat, {required} sat required")]
    Underpaid {
        role: Role,
        #[serde(with = "bitcoin::util::amount::serde::as_sat")]
        required: Amount,
        #[serde(with = "bitcoin::util::amount::serde::as_sat")]
        actual: Amount,
    },
    /// The deposit does not pay the escrow address.
    #[error("Deposit of {0} does not pay the escrow address")]
    WrongAddress(Role),
    /// The deposit of `role` is the same output as the deposit of `holder`.
    #[error("Deposit of {role} is the output already funding {holder}")]
    SharedOutput { role: Role, holder: Role },
}

impl EscrowFailure {
    /// The role whose deposit failed.
    pub fn role(&self) -> Role {
        match self {
            EscrowFailure::InsufficientConfirmations { role, .. }
            | EscrowFailure::Underpaid { role, .. }
            | EscrowFailure::SharedOutput { role, .. } => *role,
            EscrowFailure::MissingOutput(role)
            | EscrowFailure::ScriptMismatch(role)
            | EscrowFailure::WrongAddress(role) => *role,
        }
    }
}

impl Encodable for EscrowFailure {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            EscrowFailure::InsufficientConfirmations {
                role,
                confirmations,
                required,
            } => {
                let mut len = 0x01u8.consensus_encode(writer)?;
                len += role.consensus_encode(writer)?;
                len += confirmations.consensus_encode(writer)?;
                Ok(len + required.consensus_encode(writer)?)
            }
            EscrowFailure::MissingOutput(role) => {
                Ok(0x02u8.consensus_encode(writer)? + role.consensus_encode(writer)?)
            }
            EscrowFailure::ScriptMismatch(role) => {
                Ok(0x03u8.consensus_encode(writer)? + role.consensus_encode(writer)?)
            }
            EscrowFailure::Underpaid {
                role,
                required,
                actual,
            } => {
                let mut len = 0x04u8.consensus_encode(writer)?;
                len += role.consensus_encode(writer)?;
                len += required.consensus_encode(writer)?;
                Ok(len + actual.consensus_encode(writer)?)
            }
            EscrowFailure::WrongAddress(role) => {
                Ok(0x05u8.consensus_encode(writer)? + role.consensus_encode(writer)?)
            }
            EscrowFailure::SharedOutput { role, holder } => {
                let mut len = 0x06u8.consensus_encode(writer)?;
                len += role.consensus_encode(writer)?;
                Ok(len + holder.consensus_encode(writer)?)
            }
        }
    }
}

impl Decodable for EscrowFailure {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        match Decodable::consensus_decode(d)? {
            0x01u8 => Ok(EscrowFailure::InsufficientConfirmations {
                role: Decodable::consensus_decode(d)?,
                confirmations: Decodable::consensus_decode(d)?,
                required: Decodable::consensus_decode(d)?,
            }),
            0x02u8 => Ok(EscrowFailure::MissingOutput(Decodable::consensus_decode(d)?)),
            0x03u8 => Ok(EscrowFailure::ScriptMismatch(Decodable::consensus_decode(d)?)),
            0x04u8 => Ok(EscrowFailure::Underpaid {
                role: Decodable::consensus_decode(d)?,
                required: Decodable::consensus_decode(d)?,
                actual: Decodable::consensus_decode(d)?,
            }),
            0x05u8 => Ok(EscrowFailure::WrongAddress(Decodable::consensus_decode(d)?)),
            0x06u8 => Ok(EscrowFailure::SharedOutput {
                role: Decodable::consensus_decode(d)?,
                holder: Decodable::consensus_decode(d)?,
            }),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

/// Outcome of a verification run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected(EscrowFailure),
}

/// One deposit to check and the amount it must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositCheck {
    pub role: Role,
    pub deposit: Deposit,
    pub required: Amount,
}

/// Everything needed to verify the escrow deposits of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationPlan {
    pub escrow_address: Address,
    pub min_confirmations: u32,
    pub checks: Vec<DepositCheck>,
}

impl VerificationPlan {
    /// Query the ledger for every deposit, stops on the first failing one. Ledger errors are
    /// returned as is and say nothing about the deposits.
    pub fn run<L: Ledger + ?Sized>(&self, ledger: &L) -> Result<Verdict, ledger::Error> {
        if let Some(failure) = self.shared_output() {
            return Ok(Verdict::Rejected(failure));
        }
        for check in &self.checks {
            if let Some(failure) = self.check_one(ledger, check)? {
                return Ok(Verdict::Rejected(failure));
            }
        }
        Ok(Verdict::Accepted)
    }

    // An output counts toward a single share.
    fn shared_output(&self) -> Option<EscrowFailure> {
        self.checks.iter().enumerate().find_map(|(i, check)| {
            self.checks[..i]
                .iter()
                .find(|other| other.deposit.outpoint() == check.deposit.outpoint())
                .map(|other| EscrowFailure::SharedOutput {
                    role: check.role,
                    holder: other.role,
                })
        })
    }

    fn check_one<L: Ledger + ?Sized>(
        &self,
        ledger: &L,
        check: &DepositCheck,
    ) -> Result<Option<EscrowFailure>, ledger::Error> {
        let DepositCheck {
            role,
            deposit,
            required,
        } = check;
        let confirmations = ledger.confirmations(&deposit.txid)?;
        if confirmations < self.min_confirmations {
            return Ok(Some(EscrowFailure::InsufficientConfirmations {
                role: *role,
                confirmations,
                required: self.min_confirmations,
            }));
        }
        let output = match ledger.get_output(&deposit.txid, deposit.vout)? {
            Some(output) => output,
            None => return Ok(Some(EscrowFailure::MissingOutput(*role))),
        };
        if output.script != deposit.script {
            return Ok(Some(EscrowFailure::ScriptMismatch(*role)));
        }
        if output.amount < *required {
            return Ok(Some(EscrowFailure::Underpaid {
                role: *role,
                required: *required,
                actual: output.amount,
            }));
        }
        if !ledger.is_confirmed_paying(
            &deposit.txid,
            deposit.vout,
            &self.escrow_address,
            *required,
        )? {
            return Ok(Some(EscrowFailure::WrongAddress(*role)));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TxOutput;

    use bitcoin::hashes::Hash;
    use bitcoin::{Script, Txid};

    use std::collections::HashMap;
    use std::str::FromStr;

    struct Chain {
        outputs: HashMap<(Txid, u32), (TxOutput, u32, Address)>,
    }

    impl Ledger for Chain {
        fn confirmations(&self, txid: &Txid) -> Result<u32, ledger::Error> {
            Ok(self
                .outputs
                .iter()
                .find(|((id, _), _)| id == txid)
                .map(|(_, (_, conf, _))| *conf)
                .unwrap_or(0))
        }

        fn get_output(&self, txid: &Txid, vout: u32) -> Result<Option<TxOutput>, ledger::Error> {
            Ok(self.outputs.get(&(*txid, vout)).map(|(o, _, _)| o.clone()))
        }

        fn is_confirmed_paying(
            &self,
            txid: &Txid,
            vout: u32,
            address: &Address,
            min_amount: Amount,
        ) -> Result<bool, ledger::Error> {
            Ok(self
                .outputs
                .get(&(*txid, vout))
                .map(|(o, conf, a)| *conf > 0 && a == address && o.amount >= min_amount)
                .unwrap_or(false))
        }
    }

    fn escrow() -> Address {
        Address::from_str("Sescrow").unwrap()
    }

    fn setup(amount: u64, conf: u32, to: &str) -> (Chain, VerificationPlan) {
        let deposit = Deposit::new(Txid::from_inner([7; 32]), 1, Script::from(vec![0xa9]));
        let mut outputs = HashMap::new();
        outputs.insert(
            (deposit.txid, deposit.vout),
            (
                TxOutput {
                    amount: Amount::from_sat(amount),
                    script: deposit.script.clone(),
                },
                conf,
                Address::from_str(to).unwrap(),
            ),
        );
        let plan = VerificationPlan {
            escrow_address: escrow(),
            min_confirmations: 1,
            checks: vec![DepositCheck {
                role: Role::Guarantor,
                deposit,
                required: Amount::from_sat(1_000),
            }],
        };
        (Chain { outputs }, plan)
    }

    #[test]
    fn accepts_a_sufficient_deposit() {
        let (chain, plan) = setup(1_000, 2, "Sescrow");
        assert_eq!(plan.run(&chain).unwrap(), Verdict::Accepted);
    }

    #[test]
    fn rejects_an_underpaid_deposit() {
        let (chain, plan) = setup(999, 2, "Sescrow");
        assert_eq!(
            plan.run(&chain).unwrap(),
            Verdict::Rejected(EscrowFailure::Underpaid {
                role: Role::Guarantor,
                required: Amount::from_sat(1_000),
                actual: Amount::from_sat(999),
            })
        );
    }

    #[test]
    fn rejects_one_output_funding_several_shares() {
        let (chain, mut plan) = setup(10_000, 2, "Sescrow");
        let shared = plan.checks[0].deposit.clone();
        for role in [Role::Sender, Role::Mixer] {
            plan.checks.push(DepositCheck {
                role,
                deposit: shared.clone(),
                required: Amount::from_sat(1_000),
            });
        }
        assert_eq!(
            plan.run(&chain).unwrap(),
            Verdict::Rejected(EscrowFailure::SharedOutput {
                role: Role::Sender,
                holder: Role::Guarantor,
            })
        );
        let failure = EscrowFailure::SharedOutput {
            role: Role::Mixer,
            holder: Role::Sender,
        };
        assert_eq!(failure.role(), Role::Mixer);
        assert_eq!(
            consensus::deserialize::<EscrowFailure>(&consensus::serialize(&failure)).unwrap(),
            failure
        );
    }

    #[test]
    fn rejects_unconfirmed_and_misdirected_deposits() {
        let (chain, plan) = setup(1_000, 0, "Sescrow");
        assert!(matches!(
            plan.run(&chain).unwrap(),
            Verdict::Rejected(EscrowFailure::InsufficientConfirmations { confirmations: 0, .. })
        ));
        let (chain, plan) = setup(1_000, 3, "Selsewhere");
        assert_eq!(
            plan.run(&chain).unwrap(),
            Verdict::Rejected(EscrowFailure::WrongAddress(Role::Guarantor))
        );
    }
}
