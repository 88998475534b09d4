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

//! Anonymous transaction core library
//!
//! Coordination protocol letting three mutually distrustful nodes, a Sender, a Mixer and a
//! Guarantor, jointly fund a 2-of-3 escrow and co-sign a single distribution transaction that
//! breaks the on-chain link between the Sender's coins and its destination addresses.
//!
//! The protocol core is the [`session::Session`] state machine; the [`coordinator::Coordinator`]
//! wires it to the wallet, the validation backend, the peer connections and the session store,
//! and returns the [`message::Outbound`] messages the networking layer must relay.

use thiserror::Error;

#[macro_use]
extern crate amplify;
#[macro_use]
extern crate serde;

#[macro_use]
pub mod consensus;

pub mod config;
pub mod coordinator;
pub mod directory;
pub mod escrow;
pub mod ledger;
pub mod message;
pub mod party;
pub mod peer;
pub mod role;
pub mod schedule;
pub mod session;
pub mod store;
pub mod verification;
pub mod wallet;

use crate::role::Role;
use crate::session::{SessionId, Status};
use crate::verification::EscrowFailure;

/// Categories of failure, deciding what the caller does next.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[display(Debug)]
pub enum ErrorKind {
    /// A guard refused the call, the session is unchanged and usable.
    ProtocolViolation,
    /// A peer is gone or sent inconsistent data, retry later or let the session time out.
    PeerFault,
    /// A deposit does not secure its share of the escrow, the session may be aborted.
    EscrowVerificationFailure,
    /// The wallet, the validation backend or the store failed, the transition was not applied.
    CollaboratorFailure,
    /// Another transition won the race, retry against the current state.
    Concurrency,
    /// An invariant broke, the session was forcibly reset.
    Fatal,
}

/// A list of possible errors returned by the anonymous transaction protocol.
#[derive(Error, Debug)]
pub enum Error {
    /// A consensus error during encoding/decoding operation.
    #[error("Consensus error: {0}")]
    Consensus(#[from] consensus::Error),
    /// Invalid payout schedule or fee computation.
    #[error("Schedule error: {0}")]
    Schedule(#[from] schedule::Error),
    /// Misuse of the party registry.
    #[error("Party error: {0}")]
    Party(#[from] party::Error),
    /// Misuse of the escrow record, e.g. a duplicate deposit or a stale signature round.
    #[error("Escrow error: {0}")]
    Escrow(#[from] escrow::Error),
    /// A deposit failed verification against the ledger.
    #[error("Escrow verification failed: {0}")]
    EscrowVerification(#[from] EscrowFailure),
    /// The validation backend failed.
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger::Error),
    /// The wallet failed.
    #[error("Wallet error: {0}")]
    Wallet(#[from] wallet::Error),
    /// The session store failed.
    #[error("Store error: {0}")]
    Store(#[from] store::Error),
    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] config::Error),
    /// The operation is not allowed in the current status.
    #[error("{operation} is not allowed in status {status}")]
    OutOfOrderTransition {
        status: Status,
        operation: &'static str,
    },
    /// The role given does not fit the operation, e.g. a peer speaking for the local role.
    #[error("Unexpected role {0}")]
    UnexpectedRole(Role),
    /// Another role must produce the next distribution round.
    #[error("Round {round} must be produced by {expected}")]
    NotOurTurn { round: u8, expected: Role },
    /// Another transition is in flight or completed first.
    #[error("Concurrent transition, retry against the current state")]
    ConcurrentTransition,
    /// This node already runs another session that cannot be reset.
    #[error("Session {0} is already active")]
    SessionAlreadyActive(SessionId),
    /// No such session on this node.
    #[error("Unknown session {0}")]
    UnknownSession(SessionId),
    /// Resetting would abandon escrowed coins or a broadcast transaction.
    #[error("Reset refused in status {status}, unreclaimed deposits: {unreclaimed:?}")]
    ResetRefused {
        status: Status,
        unreclaimed: Vec<Role>,
    },
    /// The peer acting in the role is not connected.
    #[error("Peer playing {0} is disconnected")]
    PeerDisconnected(Role),
    /// A peer sent data contradicting the session.
    #[error("Inconsistent data: {0}")]
    InconsistentData(String),
    /// An invariant broke and the session was forcibly reset.
    #[error("Fatal error, session reset: {0}")]
    Fatal(String),
}

impl Error {
    /// The category of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Consensus(_)
            | Error::Schedule(_)
            | Error::Party(_)
            | Error::Escrow(_)
            | Error::Config(_)
            | Error::OutOfOrderTransition { .. }
            | Error::UnexpectedRole(_)
            | Error::NotOurTurn { .. }
            | Error::SessionAlreadyActive(_)
            | Error::UnknownSession(_)
            | Error::ResetRefused { .. } => ErrorKind::ProtocolViolation,
            Error::PeerDisconnected(_) | Error::InconsistentData(_) => ErrorKind::PeerFault,
            Error::EscrowVerification(_) => ErrorKind::EscrowVerificationFailure,
            Error::Ledger(_) | Error::Wallet(_) | Error::Store(_) => {
                ErrorKind::CollaboratorFailure
            }
            Error::ConcurrentTransition => ErrorKind::Concurrency,
            Error::Fatal(_) => ErrorKind::Fatal,
        }
    }
}

/// Result of an high level computation such as in the coordinator and the session.
pub type Res<T> = Result<T, Error>;
