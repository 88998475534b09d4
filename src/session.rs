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

//! The protocol session: one end-to-end run of an anonymous transaction between a Sender, a
//! Mixer and a Guarantor.
//!
//! The session is a state machine over [`Status`]. Every transition checks its guards before
//! touching any field, so a failing call leaves the session exactly as it was. Transitions that
//! depend on an external collaborator (wallet or ledger) are split in two: a `claim_*` method
//! captures what the collaborator needs and hands out a [`Ticket`], the caller performs the
//! external call without holding the session lock, then redeems the ticket with the matching
//! `complete_*` method. While a ticket is outstanding every other mutation fails with
//! [`Error::ConcurrentTransition`].
//!
//! ```text
//! None -> Reserved -> InitData -> PubKey -> MultisigAddr -> DepositsObserved
//!      -> DepositsVerified -> DistTxRound0 -> DistTxRound1 -> DistTxComplete -> Complete
//! ```

use bitcoin::{Amount, PublicKey};
use log::{debug, error, info, warn};
use uuid::Uuid;

use std::io;
use std::str::FromStr;

use crate::consensus::{self, deserialize, serialize, Decodable, Encodable};
use crate::escrow::{self, Deposit, EscrowRecord, SIGNATURE_THRESHOLD};
use crate::party::{self, PartyRegistry};
use crate::peer::PeerId;
use crate::role::Role;
use crate::schedule::{self, Address, FeePolicy, Payout, PayoutSchedule, ScheduleFingerprint};
use crate::verification::{DepositCheck, EscrowFailure, VerificationPlan, Verdict};
use crate::wallet::{CoinConstraints, MultisigEscrow, Wallet};
use crate::{Error, Res};

/// Magic bytes prefixing a session snapshot.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"ATXS";
/// Current snapshot encoding version.
pub const SNAPSHOT_VERSION: u16 = 1;

/// The correlation token shared by the three parties of a session. This is a wrapper around a
/// random [`Uuid`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize,
)]
#[serde(transparent)]
#[display(inner)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// A new random session identifier.
    pub fn random() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl From<Uuid> for SessionId {
    fn from(u: Uuid) -> Self {
        SessionId(u)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SessionId(Uuid::parse_str(s)?))
    }
}

impl Encodable for SessionId {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.0.as_bytes().consensus_encode(writer)
    }
}

impl Decodable for SessionId {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        let bytes: [u8; 16] = Decodable::consensus_decode(d)?;
        Ok(SessionId(Uuid::from_bytes(bytes)))
    }
}

impl_strict_encoding!(SessionId);

/// Progress of a session. The order of the variants is the protocol order, the status never
/// moves backward except through a reset to [`Status::None`].
#[derive(Display, Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[display(Debug)]
pub enum Status {
    None,
    /// Role and counterparts are known.
    Reserved,
    /// The local address and key are set.
    InitData,
    /// All three public keys are known.
    PubKey,
    /// The escrow address is derived.
    MultisigAddr,
    /// All three deposits are recorded.
    DepositsObserved,
    /// All three deposits are confirmed on chain with the right amounts.
    DepositsVerified,
    /// The Sender built the distribution transaction.
    DistTxRound0,
    /// The Mixer signed it.
    DistTxRound1,
    /// The Guarantor signed it, the threshold is reached.
    DistTxComplete,
    /// The distribution transaction was broadcast.
    Complete,
}

impl Status {
    /// A session is in progress between its start and its completion.
    pub fn is_in_progress(self) -> bool {
        !matches!(self, Status::None | Status::Complete)
    }

    /// The status reached once the given distribution round is recorded.
    fn after_round(round: u8) -> Status {
        match round {
            0 => Status::DistTxRound0,
            1 => Status::DistTxRound1,
            _ => Status::DistTxComplete,
        }
    }
}

impl Encodable for Status {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        (*self as u8).consensus_encode(writer)
    }
}

impl Decodable for Status {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        match Decodable::consensus_decode(d)? {
            0u8 => Ok(Status::None),
            1u8 => Ok(Status::Reserved),
            2u8 => Ok(Status::InitData),
            3u8 => Ok(Status::PubKey),
            4u8 => Ok(Status::MultisigAddr),
            5u8 => Ok(Status::DepositsObserved),
            6u8 => Ok(Status::DepositsVerified),
            7u8 => Ok(Status::DistTxRound0),
            8u8 => Ok(Status::DistTxRound1),
            9u8 => Ok(Status::DistTxComplete),
            10u8 => Ok(Status::Complete),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Unix time in seconds.
    pub time: u64,
    pub event: String,
}

impl Encodable for LogEntry {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        Ok(self.time.consensus_encode(writer)? + self.event.consensus_encode(writer)?)
    }
}

impl Decodable for LogEntry {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(LogEntry {
            time: Decodable::consensus_decode(d)?,
            event: Decodable::consensus_decode(d)?,
        })
    }
}

/// Transitions that need a collaborator call between their guard and their effect.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
#[display(Debug)]
pub enum Transition {
    DeriveMultisig,
    VerifyDeposits,
    Signature(u8),
    Commit,
}

/// Exclusive right to complete a collaborator-backed transition. Redeeming fails if the session
/// changed since the ticket was handed out.
#[derive(Debug, PartialEq, Eq)]
pub struct Ticket {
    transition: Transition,
    epoch: u64,
}

impl Ticket {
    pub fn transition(&self) -> Transition {
        self.transition
    }
}

/// The wallet call producing the local distribution round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningPlan {
    /// Round 0: build the unsigned distribution transaction.
    Build {
        inputs: Vec<Deposit>,
        outputs: Vec<Payout>,
        constraints: CoinConstraints,
    },
    /// Rounds 1 and 2: add our signature to the candidate, once it is checked to spend the
    /// deposits to the expected outputs.
    Sign {
        candidate: Vec<u8>,
        key: PublicKey,
        inputs: Vec<Deposit>,
        outputs: Vec<Payout>,
    },
}

impl SigningPlan {
    /// Execute the plan, returns the new candidate and the number of signatures it carries. A
    /// candidate not matching the escrow deposits and the schedule is never signed.
    pub fn run<W: Wallet + ?Sized>(&self, wallet: &W) -> Res<(Vec<u8>, u8)> {
        match self {
            SigningPlan::Build {
                inputs,
                outputs,
                constraints,
            } => Ok((wallet.build_transaction(inputs, outputs, constraints)?, 0)),
            SigningPlan::Sign {
                candidate,
                key,
                inputs,
                outputs,
            } => {
                if !wallet.verify_distribution(candidate, inputs, outputs)? {
                    return Err(Error::InconsistentData(
                        "distribution transaction does not match the escrow and the schedule"
                            .to_string(),
                    ));
                }
                Ok(wallet.sign(candidate, key)?)
            }
        }
    }
}

/// What a user interface shows about a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub session_id: SessionId,
    pub status: Status,
    pub role: Option<Role>,
    /// Fingerprint of the schedule and fees, identical on the three nodes of a session.
    pub terms: ScheduleFingerprint,
    pub escrow_address: Option<Address>,
    pub signed_count: u8,
    pub escrow_failure: Option<EscrowFailure>,
    pub needs_intervention: bool,
    pub can_reset: bool,
    pub log: Vec<LogEntry>,
}

/// State of one anonymous transaction as seen by this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: SessionId,
    status: Status,
    last_activity: u64,
    schedule: PayoutSchedule,
    constraints: CoinConstraints,
    fees: FeePolicy,
    escrow: Option<MultisigEscrow>,
    parties: PartyRegistry,
    record: EscrowRecord,
    escrow_failure: Option<EscrowFailure>,
    needs_intervention: bool,
    log: Vec<LogEntry>,
    // bumped on every committed mutation, never persisted
    epoch: u64,
    pending: Option<Transition>,
}

impl Session {
    pub fn new(id: SessionId, fees: FeePolicy, now: u64) -> Self {
        Session {
            id,
            status: Status::None,
            last_activity: now,
            schedule: PayoutSchedule::default(),
            constraints: CoinConstraints::default(),
            fees,
            escrow: None,
            parties: PartyRegistry::new(),
            record: EscrowRecord::new(),
            escrow_failure: None,
            needs_intervention: false,
            log: vec![],
            epoch: 0,
            pending: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// The role played by this node, once the session began.
    pub fn role(&self) -> Option<Role> {
        self.parties.role()
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity
    }

    pub fn schedule(&self) -> &PayoutSchedule {
        &self.schedule
    }

    pub fn constraints(&self) -> &CoinConstraints {
        &self.constraints
    }

    pub fn fees(&self) -> &FeePolicy {
        &self.fees
    }

    /// The schedule and fees the three parties agree on.
    pub fn terms_fingerprint(&self) -> ScheduleFingerprint {
        self.schedule.terms_fingerprint(&self.fees)
    }

    pub fn escrow(&self) -> Option<&MultisigEscrow> {
        self.escrow.as_ref()
    }

    pub fn parties(&self) -> &PartyRegistry {
        &self.parties
    }

    pub fn record(&self) -> &EscrowRecord {
        &self.record
    }

    /// The last deposit verification failure, cleared by a successful verification.
    pub fn escrow_failure(&self) -> Option<&EscrowFailure> {
        self.escrow_failure.as_ref()
    }

    pub fn needs_intervention(&self) -> bool {
        self.needs_intervention
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    pub fn is_in_progress(&self) -> bool {
        self.status.is_in_progress()
    }

    /// A collaborator-backed transition is outstanding.
    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    fn ensure_idle(&self) -> Res<()> {
        match self.pending {
            Some(_) => Err(Error::ConcurrentTransition),
            None => Ok(()),
        }
    }

    fn ensure_status(&self, allowed: &[Status], operation: &'static str) -> Res<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(Error::OutOfOrderTransition {
                status: self.status,
                operation,
            })
        }
    }

    fn ensure_peer_role(&self, role: Role) -> Res<Role> {
        let local = self.parties.local_role()?;
        if role == local {
            return Err(Error::UnexpectedRole(role));
        }
        Ok(local)
    }

    fn record_event(&mut self, now: u64, event: String) {
        debug!("{} | {}", self.id, event);
        self.log.push(LogEntry { time: now, event });
    }

    fn touch(&mut self, now: u64) {
        self.last_activity = now;
        self.epoch += 1;
    }

    fn advance(&mut self, to: Status, now: u64) {
        info!("{} | {} -> {}", self.id, self.status, to);
        self.record_event(now, format!("{} -> {}", self.status, to));
        self.status = to;
    }

    // Guards are checks over accumulated state: data received ahead of time is kept and the
    // status catches up as soon as the next guard holds.
    fn promote(&mut self, now: u64) {
        loop {
            let next = match self.status {
                Status::InitData if self.parties.all_keys_present() => Status::PubKey,
                Status::MultisigAddr if self.record.all_deposits_recorded() => {
                    Status::DepositsObserved
                }
                _ => break,
            };
            self.advance(next, now);
        }
    }

    fn claim(&mut self, transition: Transition) -> Ticket {
        debug!("{} | claimed {}", self.id, transition);
        self.pending = Some(transition);
        Ticket {
            transition,
            epoch: self.epoch,
        }
    }

    fn redeem(&mut self, ticket: &Ticket) -> Res<()> {
        if self.pending != Some(ticket.transition) || self.epoch != ticket.epoch {
            warn!("{} | stale ticket for {}", self.id, ticket.transition);
            return Err(Error::ConcurrentTransition);
        }
        self.pending = None;
        Ok(())
    }

    /// Give a ticket back after a failed collaborator call, the session is left untouched.
    pub fn release(&mut self, ticket: Ticket) {
        if self.pending == Some(ticket.transition) && self.epoch == ticket.epoch {
            debug!("{} | released {}", self.id, ticket.transition);
            self.pending = None;
        }
    }

    /// Start a session as the Sender, inviting the given peers as Mixer and Guarantor.
    pub fn begin_as_sender(
        &mut self,
        schedule: PayoutSchedule,
        constraints: CoinConstraints,
        mixer: PeerId,
        guarantor: PeerId,
        now: u64,
    ) -> Res<()> {
        self.ensure_idle()?;
        self.ensure_status(&[Status::None], "begin")?;
        if schedule.is_empty() {
            return Err(schedule::Error::EmptySchedule.into());
        }
        self.parties.set_role(Role::Sender)?;
        self.parties.set_peer(Role::Mixer, mixer);
        self.parties.set_peer(Role::Guarantor, guarantor);
        self.record_event(
            now,
            format!(
                "begin as Sender, {} payout(s), terms {:#x}",
                schedule.len(),
                schedule.terms_fingerprint(&self.fees)
            ),
        );
        self.schedule = schedule;
        self.constraints = constraints;
        self.advance(Status::Reserved, now);
        self.touch(now);
        Ok(())
    }

    /// Join a session after an invitation from the Sender, under the fees it offered.
    pub fn begin_invited(
        &mut self,
        role: Role,
        sender: PeerId,
        schedule: PayoutSchedule,
        fees: FeePolicy,
        constraints: CoinConstraints,
        now: u64,
    ) -> Res<()> {
        self.ensure_idle()?;
        self.ensure_status(&[Status::None], "begin")?;
        if role == Role::Sender {
            return Err(Error::UnexpectedRole(role));
        }
        if schedule.is_empty() {
            return Err(schedule::Error::EmptySchedule.into());
        }
        self.parties.set_role(role)?;
        self.parties.set_peer(Role::Sender, sender);
        self.record_event(
            now,
            format!(
                "invited as {} by {}, terms {:#x}",
                role,
                sender,
                schedule.terms_fingerprint(&fees)
            ),
        );
        self.schedule = schedule;
        self.fees = fees;
        self.constraints = constraints;
        self.advance(Status::Reserved, now);
        self.touch(now);
        Ok(())
    }

    /// Set the payout address and escrow key of this node. Returns `false` if the same values
    /// were already set.
    pub fn set_self_address_and_key(
        &mut self,
        address: Address,
        pubkey: PublicKey,
        now: u64,
    ) -> Res<bool> {
        self.ensure_idle()?;
        let role = self.parties.local_role()?;
        self.ensure_status(
            &[Status::Reserved, Status::InitData, Status::PubKey],
            "set_self_address_and_key",
        )?;
        if !self.parties.check_address_and_key(role, &address, &pubkey)? {
            self.last_activity = now;
            return Ok(false);
        }
        self.record_event(now, format!("own address {} and key {}", address, pubkey));
        self.parties.set_address_and_key(role, address, pubkey)?;
        if self.status == Status::Reserved {
            self.advance(Status::InitData, now);
        }
        self.promote(now);
        self.touch(now);
        Ok(true)
    }

    /// Register the address and key announced by the peer playing `role`. Re-announcing the
    /// same values only refreshes the activity timestamp. Returns `false` in that case.
    pub fn receive_peer_address_and_key(
        &mut self,
        role: Role,
        address: Address,
        pubkey: PublicKey,
        peer: Option<PeerId>,
        now: u64,
    ) -> Res<bool> {
        self.ensure_idle()?;
        self.ensure_peer_role(role)?;
        if self.status == Status::None {
            return Err(Error::OutOfOrderTransition {
                status: self.status,
                operation: "receive_peer_address_and_key",
            });
        }
        if !self.parties.check_address_and_key(role, &address, &pubkey)? {
            self.last_activity = now;
            return Ok(false);
        }
        self.ensure_status(
            &[Status::Reserved, Status::InitData, Status::PubKey],
            "receive_peer_address_and_key",
        )?;
        self.record_event(
            now,
            format!("{} announced address {} and key {}", role, address, pubkey),
        );
        self.parties.set_address_and_key(role, address, pubkey)?;
        if let (Some(peer), None) = (peer, self.parties.peer(role)) {
            self.parties.set_peer(role, peer);
        }
        self.promote(now);
        self.touch(now);
        Ok(true)
    }

    /// Claim the escrow derivation, returns the three keys in signing order.
    pub fn claim_multisig(&mut self) -> Res<(Ticket, [PublicKey; 3])> {
        self.ensure_idle()?;
        self.ensure_status(&[Status::PubKey], "derive_multisig_address")?;
        let keys = self.parties.keys().ok_or(Error::OutOfOrderTransition {
            status: self.status,
            operation: "derive_multisig_address",
        })?;
        Ok((self.claim(Transition::DeriveMultisig), keys))
    }

    pub fn complete_multisig(
        &mut self,
        ticket: Ticket,
        escrow: MultisigEscrow,
        now: u64,
    ) -> Res<()> {
        self.redeem(&ticket)?;
        self.record_event(now, format!("escrow address {}", escrow.address));
        self.escrow = Some(escrow);
        self.advance(Status::MultisigAddr, now);
        self.promote(now);
        self.touch(now);
        Ok(())
    }

    /// Record the deposit this node made into the escrow.
    pub fn record_own_deposit(&mut self, deposit: Deposit, now: u64) -> Res<()> {
        self.ensure_idle()?;
        let role = self.parties.local_role()?;
        self.record.check_deposit(role, &deposit)?;
        self.ensure_status(&[Status::MultisigAddr], "record_own_deposit")?;
        self.record_event(
            now,
            format!("own deposit {}:{}", deposit.txid, deposit.vout),
        );
        self.record.record_deposit(role, deposit)?;
        self.promote(now);
        self.touch(now);
        Ok(())
    }

    /// Record the deposit announced by the peer playing `role`. Notices may arrive before this
    /// node derived the escrow address itself.
    pub fn receive_deposit_notice(&mut self, role: Role, deposit: Deposit, now: u64) -> Res<()> {
        self.ensure_idle()?;
        self.ensure_peer_role(role)?;
        self.record.check_deposit(role, &deposit)?;
        self.ensure_status(
            &[
                Status::Reserved,
                Status::InitData,
                Status::PubKey,
                Status::MultisigAddr,
            ],
            "receive_deposit_notice",
        )?;
        self.record_event(
            now,
            format!("{} deposit {}:{}", role, deposit.txid, deposit.vout),
        );
        self.record.record_deposit(role, deposit)?;
        self.promote(now);
        self.touch(now);
        Ok(())
    }

    /// Claim the verification of the three deposits.
    pub fn claim_verification(
        &mut self,
        min_confirmations: u32,
    ) -> Res<(Ticket, VerificationPlan)> {
        self.ensure_idle()?;
        self.ensure_status(&[Status::DepositsObserved], "verify_deposits")?;
        let escrow_address = self
            .escrow
            .as_ref()
            .map(|escrow| escrow.address.clone())
            .ok_or(Error::OutOfOrderTransition {
                status: self.status,
                operation: "verify_deposits",
            })?;
        let mut checks = Vec::with_capacity(3);
        for role in Role::ALL {
            let deposit = self
                .record
                .deposit(role)
                .ok_or(escrow::Error::MissingDeposit(role))?;
            checks.push(DepositCheck {
                role,
                deposit: deposit.clone(),
                required: self.fees.required_coins(role, &self.schedule)?,
            });
        }
        let plan = VerificationPlan {
            escrow_address,
            min_confirmations,
            checks,
        };
        Ok((self.claim(Transition::VerifyDeposits), plan))
    }

    /// Apply the verdict of the ledger. A rejection keeps the session in
    /// [`Status::DepositsObserved`], flags the failure and is returned as an error.
    pub fn complete_verification(
        &mut self,
        ticket: Ticket,
        verdict: Verdict,
        now: u64,
    ) -> Res<()> {
        self.redeem(&ticket)?;
        match verdict {
            Verdict::Accepted => {
                self.escrow_failure = None;
                self.record_event(now, "deposits verified".to_string());
                self.advance(Status::DepositsVerified, now);
                self.touch(now);
                Ok(())
            }
            Verdict::Rejected(failure) => {
                warn!("{} | deposit verification failed: {}", self.id, failure);
                self.record_event(now, format!("deposit verification failed: {}", failure));
                self.escrow_failure = Some(failure.clone());
                self.touch(now);
                Err(Error::EscrowVerification(failure))
            }
        }
    }

    /// The distribution round expected next, if the session is signing.
    pub fn expected_round(&self) -> Option<u8> {
        match self.status {
            Status::DepositsVerified => Some(0),
            Status::DistTxRound0 => Some(1),
            Status::DistTxRound1 => Some(2),
            _ => None,
        }
    }

    /// Claim the production of the next distribution round, only when this node is the
    /// expected signer.
    pub fn claim_signature(&mut self) -> Res<(Ticket, SigningPlan)> {
        self.ensure_idle()?;
        let local = self.parties.local_role()?;
        let (round, signer) = self
            .expected_round()
            .and_then(|round| Some((round, Role::for_round(round)?)))
            .ok_or(Error::OutOfOrderTransition {
                status: self.status,
                operation: "contribute_signature",
            })?;
        if signer != local {
            return Err(Error::NotOurTurn {
                round,
                expected: signer,
            });
        }
        let inputs = Role::ALL
            .into_iter()
            .map(|role| {
                self.record
                    .deposit(role)
                    .cloned()
                    .ok_or(escrow::Error::MissingDeposit(role))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = self.fees.distribution_outputs(
            &self.schedule,
            self.parties.address(Role::Mixer),
            self.parties.address(Role::Guarantor),
        )?;
        let plan = if round == 0 {
            SigningPlan::Build {
                inputs,
                outputs,
                constraints: self.constraints.clone(),
            }
        } else {
            SigningPlan::Sign {
                candidate: self
                    .record
                    .candidate_tx()
                    .ok_or(escrow::Error::NoCandidate)?
                    .to_vec(),
                key: *self
                    .parties
                    .pubkey(local)
                    .ok_or(party::Error::MissingKey(local))?,
                inputs,
                outputs,
            }
        };
        Ok((self.claim(Transition::Signature(round)), plan))
    }

    /// Record the round produced by the local wallet. A wallet returning a signature count
    /// other than the round it was asked for breaks the escrow invariants: the session is
    /// forcibly reset and [`Error::Fatal`] returned.
    pub fn complete_signature(
        &mut self,
        ticket: Ticket,
        candidate_tx: Vec<u8>,
        signed_count: u8,
        now: u64,
    ) -> Res<u8> {
        let round = match ticket.transition {
            Transition::Signature(round) => round,
            _ => return Err(Error::ConcurrentTransition),
        };
        self.redeem(&ticket)?;
        if signed_count != round {
            let reason = format!(
                "wallet returned {} signature(s) for round {}",
                signed_count, round
            );
            self.force_reset(&reason, now);
            return Err(Error::Fatal(reason));
        }
        self.record.set_candidate_tx(candidate_tx, round)?;
        self.record_event(now, format!("produced distribution round {}", round));
        self.advance(Status::after_round(round), now);
        self.touch(now);
        Ok(round)
    }

    /// Record a distribution round produced by a peer. Rounds already seen are stale, rounds
    /// ahead of the expected one are out of order.
    pub fn receive_signature_round(
        &mut self,
        round: u8,
        candidate_tx: Vec<u8>,
        now: u64,
    ) -> Res<()> {
        self.ensure_idle()?;
        let local = self.parties.local_role()?;
        let expected = match self.status {
            Status::DistTxComplete | Status::Complete => SIGNATURE_THRESHOLD + 1,
            _ => self.expected_round().ok_or(Error::OutOfOrderTransition {
                status: self.status,
                operation: "receive_signature_round",
            })?,
        };
        if round < expected {
            return Err(escrow::Error::StaleSignatureRegression {
                current: self.record.signed_count(),
                given: round,
            }
            .into());
        }
        if round > expected {
            return Err(Error::OutOfOrderTransition {
                status: self.status,
                operation: "receive_signature_round",
            });
        }
        if Role::for_round(round) == Some(local) {
            return Err(Error::UnexpectedRole(local));
        }
        if candidate_tx.is_empty() {
            return Err(Error::InconsistentData(format!(
                "empty distribution transaction in round {}",
                round
            )));
        }
        self.record.set_candidate_tx(candidate_tx, round)?;
        self.record_event(now, format!("received distribution round {}", round));
        self.advance(Status::after_round(round), now);
        self.touch(now);
        Ok(())
    }

    /// Claim the broadcast of the fully signed distribution transaction. When `final_tx` is
    /// given it must be the candidate this node holds. Returns the transaction to broadcast.
    pub fn claim_commit(&mut self, final_tx: Option<&[u8]>) -> Res<(Ticket, Vec<u8>)> {
        self.ensure_idle()?;
        self.ensure_status(&[Status::DistTxComplete], "commit")?;
        let candidate = self
            .record
            .candidate_tx()
            .ok_or(escrow::Error::NoCandidate)?;
        if let Some(final_tx) = final_tx {
            if final_tx != candidate {
                return Err(Error::InconsistentData(
                    "final transaction differs from the signed candidate".to_string(),
                ));
            }
        }
        let tx = candidate.to_vec();
        Ok((self.claim(Transition::Commit), tx))
    }

    pub fn complete_commit(&mut self, ticket: Ticket, now: u64) -> Res<()> {
        self.redeem(&ticket)?;
        self.record_event(now, "distribution transaction broadcast".to_string());
        self.advance(Status::Complete, now);
        self.touch(now);
        Ok(())
    }

    /// Mark the deposit of `role` as recoverable without the other parties, e.g. once its
    /// refund is observed.
    pub fn mark_reclaimable(&mut self, role: Role, now: u64) -> Res<()> {
        self.ensure_idle()?;
        self.record.mark_reclaimable(role)?;
        self.record_event(now, format!("deposit of {} is reclaimable", role));
        self.touch(now);
        Ok(())
    }

    /// Returns true if resetting cannot strand escrowed coins: nothing was committed on chain
    /// and every recorded deposit has a recovery path.
    pub fn can_reset(&self) -> bool {
        match self.status {
            Status::DistTxComplete | Status::Complete => false,
            _ => self.record.unreclaimed().is_empty(),
        }
    }

    /// Return to [`Status::None`], optionally keeping the audit log. Refused when
    /// [`Self::can_reset`] does not hold.
    pub fn reset(&mut self, keep_log: bool, now: u64) -> Res<()> {
        if !self.can_reset() {
            warn!("{} | reset refused in {}", self.id, self.status);
            return Err(Error::ResetRefused {
                status: self.status,
                unreclaimed: self.record.unreclaimed(),
            });
        }
        info!("{} | reset from {}", self.id, self.status);
        if keep_log {
            self.record_event(now, format!("reset from {}", self.status));
        }
        self.clear(keep_log, now);
        Ok(())
    }

    /// Reset regardless of [`Self::can_reset`]. The audit log is kept and records the deposits
    /// that may need a manual recovery.
    pub fn force_reset(&mut self, reason: &str, now: u64) {
        error!("{} | forced reset from {}: {}", self.id, self.status, reason);
        self.record_event(
            now,
            format!("forced reset from {}: {}", self.status, reason),
        );
        let stranded: Vec<String> = Role::ALL
            .into_iter()
            .filter_map(|role| {
                self.record
                    .deposit(role)
                    .filter(|_| !self.record.is_reclaimable(role))
                    .map(|d| format!("{} deposit {}:{}", role, d.txid, d.vout))
            })
            .collect();
        for deposit in stranded {
            self.record_event(now, format!("manual recovery needed for {}", deposit));
        }
        self.clear(true, now);
    }

    fn clear(&mut self, keep_log: bool, now: u64) {
        let log = if keep_log {
            std::mem::take(&mut self.log)
        } else {
            vec![]
        };
        let epoch = self.epoch + 1;
        *self = Session {
            log,
            epoch,
            ..Session::new(self.id, self.fees, now)
        };
    }

    /// Flag an idle session that cannot be reset for operator attention.
    pub fn flag_for_intervention(&mut self, now: u64) {
        if !self.needs_intervention {
            warn!("{} | idle in {}, needs intervention", self.id, self.status);
            self.record_event(now, format!("idle in {}, needs intervention", self.status));
            self.needs_intervention = true;
        }
    }

    /// Amount `role` must place into escrow, `None` for the local role.
    pub fn required_coins(&self, role: Option<Role>) -> Res<Amount> {
        let role = match role {
            Some(role) => role,
            None => self.parties.local_role()?,
        };
        Ok(self.fees.required_coins(role, &self.schedule)?)
    }

    /// The two other roles and their connection, if known, in signing order.
    pub fn counterparts(&self) -> Vec<(Role, Option<PeerId>)> {
        match self.parties.role() {
            Some(local) => local
                .others()
                .into_iter()
                .map(|role| (role, self.parties.peer(role)))
                .collect(),
            None => vec![],
        }
    }

    /// Attach the connection acting for `role`, replacing a previous one. Connections are not
    /// part of the protocol state and are lost on restart.
    pub fn set_peer(&mut self, role: Role, peer: PeerId) -> Res<()> {
        self.ensure_peer_role(role)?;
        debug!("{} | {} is {}", self.id, role, peer);
        self.parties.set_peer(role, peer);
        Ok(())
    }

    pub fn report(&self) -> StatusReport {
        StatusReport {
            session_id: self.id,
            status: self.status,
            role: self.parties.role(),
            terms: self.terms_fingerprint(),
            escrow_address: self.escrow.as_ref().map(|escrow| escrow.address.clone()),
            signed_count: self.record.signed_count(),
            escrow_failure: self.escrow_failure.clone(),
            needs_intervention: self.needs_intervention,
            can_reset: self.can_reset(),
            log: self.log.clone(),
        }
    }

    /// Consensus encoded snapshot of the session, without peer connections.
    pub fn to_snapshot(&self) -> Vec<u8> {
        serialize(self)
    }

    pub fn from_snapshot(bytes: &[u8]) -> Res<Self> {
        Ok(deserialize(bytes)?)
    }
}

impl Encodable for Session {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = SNAPSHOT_MAGIC.consensus_encode(writer)?;
        len += SNAPSHOT_VERSION.consensus_encode(writer)?;
        len += self.id.consensus_encode(writer)?;
        len += self.status.consensus_encode(writer)?;
        len += self.last_activity.consensus_encode(writer)?;
        len += self.schedule.consensus_encode(writer)?;
        len += self.constraints.consensus_encode(writer)?;
        len += self.fees.consensus_encode(writer)?;
        len += self.escrow.consensus_encode(writer)?;
        len += self.parties.consensus_encode(writer)?;
        len += self.record.consensus_encode(writer)?;
        len += self.escrow_failure.consensus_encode(writer)?;
        len += self.needs_intervention.consensus_encode(writer)?;
        Ok(len + self.log.consensus_encode(writer)?)
    }
}

impl Decodable for Session {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        let magic: [u8; 4] = Decodable::consensus_decode(d)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(consensus::Error::IncorrectMagicBytes);
        }
        let version: u16 = Decodable::consensus_decode(d)?;
        if version != SNAPSHOT_VERSION {
            return Err(consensus::Error::UnsupportedVersion(version));
        }
        let session = Session {
            id: Decodable::consensus_decode(d)?,
            status: Decodable::consensus_decode(d)?,
            last_activity: Decodable::consensus_decode(d)?,
            schedule: Decodable::consensus_decode(d)?,
            constraints: Decodable::consensus_decode(d)?,
            fees: Decodable::consensus_decode(d)?,
            escrow: Decodable::consensus_decode(d)?,
            parties: Decodable::consensus_decode(d)?,
            record: Decodable::consensus_decode(d)?,
            escrow_failure: Decodable::consensus_decode(d)?,
            needs_intervention: Decodable::consensus_decode(d)?,
            log: Decodable::consensus_decode(d)?,
            epoch: 0,
            pending: None,
        };
        if session.status >= Status::MultisigAddr && session.escrow.is_none() {
            return Err(consensus::Error::ParseFailed("escrow missing past key exchange"));
        }
        if session.status >= Status::Reserved && session.parties.role().is_none() {
            return Err(consensus::Error::ParseFailed("local role missing"));
        }
        Ok(session)
    }
}
