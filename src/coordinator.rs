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

//! Entry point of the protocol for a node. The [`Coordinator`] receives the peer messages
//! delivered by the networking layer and the commands of the local user, applies them to the
//! active session and returns the messages to relay.
//!
//! Collaborator calls (wallet and ledger) never run under the session lock: the coordinator
//! claims a transition ticket, releases the lock, calls the collaborator, then re-locks to
//! complete or release the ticket. Every committed transition is saved to the session store.

use bitcoin::{Amount, PublicKey};
use log::{debug, error, info, warn};

use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::MixConfig;
use crate::directory::{Eviction, SessionDirectory, SessionHandle, SweepOutcome};
use crate::escrow::{Deposit, SIGNATURE_THRESHOLD};
use crate::ledger::Ledger;
use crate::message::{Outbound, PeerMessage};
use crate::peer::{PeerId, Peers};
use crate::role::Role;
use crate::schedule::{self, Address, FeePolicy, PayoutSchedule};
use crate::session::{Session, SessionId, Status, StatusReport};
use crate::store::SessionStore;
use crate::wallet::{CoinConstraints, Wallet};
use crate::{Error, Res};

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// Runs the anonymous transaction protocol of one node.
pub struct Coordinator<W, L, P, S> {
    config: MixConfig,
    directory: SessionDirectory,
    wallet: W,
    ledger: L,
    peers: P,
    store: S,
    clock: Box<dyn Fn() -> u64 + Send + Sync>,
}

impl<W, L, P, S> Coordinator<W, L, P, S>
where
    W: Wallet,
    L: Ledger,
    P: Peers,
    S: SessionStore,
{
    pub fn new(config: MixConfig, wallet: W, ledger: L, peers: P, store: S) -> Res<Self> {
        config.validate()?;
        Ok(Self {
            directory: SessionDirectory::new(config.fee_policy()),
            config,
            wallet,
            ledger,
            peers,
            store,
            clock: Box::new(unix_now),
        })
    }

    /// Replace the wall clock, in unix seconds.
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn config(&self) -> &MixConfig {
        &self.config
    }

    pub fn directory(&self) -> &SessionDirectory {
        &self.directory
    }

    pub fn wallet(&self) -> &W {
        &self.wallet
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn now(&self) -> u64 {
        (self.clock)()
    }

    fn session(&self, id: SessionId) -> Res<SessionHandle> {
        self.directory.get(id)
    }

    // Every counterpart must be reachable before the transition is applied.
    fn connected_targets(&self, session: &Session) -> Res<Vec<(Role, PeerId)>> {
        session
            .counterparts()
            .into_iter()
            .map(|(role, peer)| match peer {
                Some(peer) if self.peers.is_connected(peer) => Ok((role, peer)),
                _ => {
                    warn!("{} | {} is not reachable", session.id(), role);
                    Err(Error::PeerDisconnected(role))
                }
            })
            .collect()
    }

    // Counterparts currently reachable, for advisory messages.
    fn reachable_targets(&self, session: &Session) -> Vec<(Role, PeerId)> {
        session
            .counterparts()
            .into_iter()
            .filter_map(|(role, peer)| match peer {
                Some(peer) if self.peers.is_connected(peer) => Some((role, peer)),
                _ => None,
            })
            .collect()
    }

    fn persist(&self, session: &Session) {
        let id = session.id();
        let res = if session.status() == Status::None {
            self.store.remove(id)
        } else {
            self.store.save(id, session.to_snapshot())
        };
        if let Err(e) = res {
            error!("{} | cannot persist session: {}", id, e);
        }
    }

    // Forget the snapshot of a replaced session and cancel it with its reachable counterparts.
    fn evict(&self, eviction: Option<Eviction>) -> Vec<Outbound> {
        let Eviction { id, counterparts } = match eviction {
            Some(eviction) => eviction,
            None => return vec![],
        };
        if let Err(e) = self.store.remove(id) {
            error!("{} | cannot remove replaced session: {}", id, e);
        }
        let targets: Vec<(Role, PeerId)> = counterparts
            .into_iter()
            .filter_map(|(role, peer)| match peer {
                Some(peer) if self.peers.is_connected(peer) => Some((role, peer)),
                _ => None,
            })
            .collect();
        Outbound::to_all(&targets, PeerMessage::Cancel { session_id: id })
    }

    // Drop a session that never began, e.g. after a refused invitation.
    fn discard_if_unused(&self, handle: &SessionHandle, id: SessionId) {
        let unused = handle.lock().status() == Status::None;
        if unused {
            self.directory.remove(id);
        }
    }

    /// Start sending `amount_each` to every destination through the given Mixer and Guarantor.
    /// Returns the new session and the messages to relay: the cancellation of a replaced
    /// session, if any, then the invitations.
    pub fn begin_send(
        &self,
        destinations: Vec<Address>,
        amount_each: Amount,
        constraints: CoinConstraints,
        mixer: PeerId,
        guarantor: PeerId,
    ) -> Res<(SessionId, Vec<Outbound>)> {
        let schedule = PayoutSchedule::uniform(destinations, amount_each)?;
        if schedule.is_empty() {
            return Err(schedule::Error::EmptySchedule.into());
        }
        let targets = [(Role::Mixer, mixer), (Role::Guarantor, guarantor)];
        if let Some((role, _)) = targets
            .iter()
            .find(|(_, peer)| !self.peers.is_connected(*peer))
        {
            return Err(Error::PeerDisconnected(*role));
        }
        let id = SessionId::random();
        let now = self.now();
        let (handle, evicted) = self.directory.get_or_create(id, now)?;
        let mut outbound = self.evict(evicted);
        let fees = {
            let mut session = handle.lock();
            let res = session.begin_as_sender(schedule.clone(), constraints, mixer, guarantor, now);
            if let Err(e) = res {
                drop(session);
                self.discard_if_unused(&handle, id);
                return Err(e);
            }
            self.persist(&session);
            *session.fees()
        };
        info!("{} | sending {} payout(s) as Sender", id, schedule.len());
        outbound.extend(targets.iter().map(|(role, peer)| Outbound {
            role: *role,
            peer: *peer,
            message: PeerMessage::Invite {
                session_id: id,
                role: *role,
                schedule: schedule.clone(),
                fees,
            },
        }));
        Ok((id, outbound))
    }

    /// Invitation from the Sender to play `role` under the offered fees. The invitation is
    /// checked before it can replace the active session; the cancellation of a replaced session
    /// is returned for relay.
    pub fn on_invite(
        &self,
        from: PeerId,
        session_id: SessionId,
        role: Role,
        schedule: PayoutSchedule,
        fees: FeePolicy,
        constraints: CoinConstraints,
    ) -> Res<Vec<Outbound>> {
        if !self.peers.is_connected(from) {
            return Err(Error::PeerDisconnected(Role::Sender));
        }
        if role == Role::Sender {
            return Err(Error::UnexpectedRole(role));
        }
        if schedule.is_empty() {
            return Err(schedule::Error::EmptySchedule.into());
        }
        if let Err(e) = self.config.check_offer(role, &fees) {
            warn!("{} | refusing invitation as {}: {}", session_id, role, e);
            return Err(e.into());
        }
        let now = self.now();
        let (handle, evicted) = self.directory.get_or_create(session_id, now)?;
        let outbound = self.evict(evicted);
        let res = handle
            .lock()
            .begin_invited(role, from, schedule, fees, constraints, now);
        if let Err(e) = res {
            self.discard_if_unused(&handle, session_id);
            return Err(e);
        }
        self.persist(&handle.lock());
        info!("{} | joined as {}", session_id, role);
        Ok(outbound)
    }

    /// Tell which connection acts for `role`, e.g. after a reconnection or a restart.
    pub fn attach_peer(&self, session_id: SessionId, role: Role, peer: PeerId) -> Res<()> {
        self.session(session_id)?.lock().set_peer(role, peer)
    }

    /// Set the payout address and escrow key of this node and announce them.
    pub fn set_own_address_and_key(
        &self,
        session_id: SessionId,
        address: Address,
        pubkey: PublicKey,
    ) -> Res<Vec<Outbound>> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock();
        let targets = self.connected_targets(&session)?;
        let role = session.parties().local_role()?;
        if session.set_self_address_and_key(address.clone(), pubkey, self.now())? {
            self.persist(&session);
        }
        Ok(Outbound::to_all(
            &targets,
            PeerMessage::AddressAndKey {
                session_id,
                role,
                address,
                pubkey,
            },
        ))
    }

    pub fn on_address_and_key(
        &self,
        from: PeerId,
        session_id: SessionId,
        role: Role,
        address: Address,
        pubkey: PublicKey,
    ) -> Res<Vec<Outbound>> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock();
        if session.receive_peer_address_and_key(role, address, pubkey, Some(from), self.now())? {
            self.persist(&session);
        }
        Ok(vec![])
    }

    /// Derive the escrow address once the three keys are known.
    pub fn derive_multisig_address(&self, session_id: SessionId) -> Res<Vec<Outbound>> {
        let handle = self.session(session_id)?;
        let (ticket, keys) = handle.lock().claim_multisig()?;
        let derived = self.wallet.derive_multisig(&keys, SIGNATURE_THRESHOLD);
        let mut session = handle.lock();
        match derived {
            Ok(escrow) => {
                session.complete_multisig(ticket, escrow, self.now())?;
                self.persist(&session);
                Ok(vec![])
            }
            Err(e) => {
                warn!("{} | escrow derivation failed: {}", session_id, e);
                session.release(ticket);
                Err(e.into())
            }
        }
    }

    /// Record the deposit this node paid into the escrow and announce it.
    pub fn record_own_deposit(
        &self,
        session_id: SessionId,
        deposit: Deposit,
    ) -> Res<Vec<Outbound>> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock();
        let targets = self.connected_targets(&session)?;
        let role = session.parties().local_role()?;
        session.record_own_deposit(deposit.clone(), self.now())?;
        self.persist(&session);
        Ok(Outbound::to_all(
            &targets,
            PeerMessage::DepositNotice {
                session_id,
                role,
                deposit,
            },
        ))
    }

    pub fn on_deposit_notice(
        &self,
        session_id: SessionId,
        role: Role,
        deposit: Deposit,
    ) -> Res<Vec<Outbound>> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock();
        session.receive_deposit_notice(role, deposit, self.now())?;
        self.persist(&session);
        Ok(vec![])
    }

    /// Check the three deposits against the ledger.
    pub fn verify_deposits(&self, session_id: SessionId) -> Res<Vec<Outbound>> {
        let handle = self.session(session_id)?;
        let (ticket, plan) = handle
            .lock()
            .claim_verification(self.config.min_confirmations)?;
        let verdict = plan.run(&self.ledger);
        let mut session = handle.lock();
        match verdict {
            Ok(verdict) => {
                let res = session.complete_verification(ticket, verdict, self.now());
                self.persist(&session);
                res.map(|_| vec![])
            }
            Err(e) => {
                warn!("{} | deposit verification interrupted: {}", session_id, e);
                session.release(ticket);
                Err(e.into())
            }
        }
    }

    /// Produce the next distribution round if this node is the expected signer, and relay it.
    pub fn contribute_signature(&self, session_id: SessionId) -> Res<Vec<Outbound>> {
        let handle = self.session(session_id)?;
        let (ticket, plan, targets) = {
            let mut session = handle.lock();
            let targets = self.connected_targets(&session)?;
            let (ticket, plan) = session.claim_signature()?;
            (ticket, plan, targets)
        };
        let signed = plan.run(&self.wallet);
        let mut session = handle.lock();
        let (candidate_tx, signed_count) = match signed {
            Ok(signed) => signed,
            Err(e) => {
                warn!("{} | cannot produce the next round: {}", session_id, e);
                session.release(ticket);
                return Err(e);
            }
        };
        let res =
            session.complete_signature(ticket, candidate_tx.clone(), signed_count, self.now());
        if let Err(Error::Fatal(_)) = res {
            self.persist(&session);
        }
        let round = res?;
        self.persist(&session);
        Ok(Outbound::to_all(
            &targets,
            PeerMessage::SignatureRound {
                session_id,
                round,
                candidate_tx,
            },
        ))
    }

    pub fn on_signature_round(
        &self,
        session_id: SessionId,
        round: u8,
        candidate_tx: Vec<u8>,
    ) -> Res<Vec<Outbound>> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock();
        session.receive_signature_round(round, candidate_tx, self.now())?;
        self.persist(&session);
        Ok(vec![])
    }

    fn broadcast(&self, handle: &SessionHandle, final_tx: Option<Vec<u8>>) -> Res<Vec<u8>> {
        let (ticket, tx) = handle.lock().claim_commit(final_tx.as_deref())?;
        let broadcast = self.wallet.broadcast(&tx);
        let mut session = handle.lock();
        match broadcast {
            Ok(()) => {
                session.complete_commit(ticket, self.now())?;
                self.persist(&session);
                Ok(tx)
            }
            Err(e) => {
                warn!("{} | broadcast failed: {}", session.id(), e);
                session.release(ticket);
                Err(e.into())
            }
        }
    }

    /// Broadcast the fully signed distribution transaction and notify the reachable peers.
    pub fn commit(&self, session_id: SessionId) -> Res<Vec<Outbound>> {
        let handle = self.session(session_id)?;
        let final_tx = self.broadcast(&handle, None)?;
        info!("{} | distribution transaction broadcast", session_id);
        let targets = self.reachable_targets(&handle.lock());
        Ok(Outbound::to_all(
            &targets,
            PeerMessage::Commit {
                session_id,
                final_tx,
            },
        ))
    }

    /// A peer broadcast the distribution transaction; relay it as well and complete.
    pub fn on_commit(&self, session_id: SessionId, final_tx: Vec<u8>) -> Res<Vec<Outbound>> {
        let handle = self.session(session_id)?;
        {
            let session = handle.lock();
            if session.status() == Status::Complete {
                return match session.record().candidate_tx() {
                    Some(tx) if tx == final_tx.as_slice() => Ok(vec![]),
                    _ => Err(Error::InconsistentData(
                        "final transaction differs from the broadcast one".to_string(),
                    )),
                };
            }
        }
        self.broadcast(&handle, Some(final_tx))?;
        info!("{} | completed by peer commit", session_id);
        Ok(vec![])
    }

    /// Mark the deposit of `role` as recoverable, e.g. once its refund is observed.
    pub fn mark_reclaimable(&self, session_id: SessionId, role: Role) -> Res<Vec<Outbound>> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock();
        session.mark_reclaimable(role, self.now())?;
        self.persist(&session);
        Ok(vec![])
    }

    /// Amount `role` must escrow, the local role if `None`.
    pub fn required_coins(&self, session_id: SessionId, role: Option<Role>) -> Res<Amount> {
        self.session(session_id)?.lock().required_coins(role)
    }

    pub fn status(&self, session_id: SessionId) -> Res<StatusReport> {
        Ok(self.session(session_id)?.lock().report())
    }

    /// Abandon the session if it can be reset, and notify the reachable peers.
    pub fn cancel(&self, session_id: SessionId) -> Res<Vec<Outbound>> {
        let handle = self.session(session_id)?;
        let targets = {
            let mut session = handle.lock();
            let targets = self.reachable_targets(&session);
            session.reset(true, self.now())?;
            self.persist(&session);
            targets
        };
        self.directory.remove(session_id);
        info!("{} | cancelled", session_id);
        Ok(Outbound::to_all(
            &targets,
            PeerMessage::Cancel { session_id },
        ))
    }

    /// A peer abandoned the session. The local session follows unless it cannot be reset.
    pub fn on_cancel(&self, session_id: SessionId) -> Res<Vec<Outbound>> {
        let handle = self.session(session_id)?;
        {
            let mut session = handle.lock();
            session.reset(true, self.now())?;
            self.persist(&session);
        }
        self.directory.remove(session_id);
        info!("{} | cancelled by peer", session_id);
        Ok(vec![])
    }

    /// Reset or flag the sessions idle for longer than the configured threshold.
    pub fn sweep(&self) -> Vec<SweepOutcome> {
        let outcomes = self
            .directory
            .sweep_stale(self.now(), self.config.max_idle_secs);
        for outcome in &outcomes {
            match outcome {
                SweepOutcome::Reset(id) => {
                    if let Err(e) = self.store.remove(*id) {
                        error!("{} | cannot remove swept session: {}", id, e);
                    }
                }
                SweepOutcome::Flagged(id) => {
                    if let Ok(handle) = self.session(*id) {
                        self.persist(&handle.lock());
                    }
                }
            }
        }
        outcomes
    }

    /// Reload the session in progress from the store, after a restart. Peer connections must be
    /// attached again with [`Self::attach_peer`].
    pub fn restore(&self) -> Res<Option<SessionId>> {
        let mut restored = None;
        for id in self.store.list()? {
            let bytes = match self.store.load(id)? {
                Some(bytes) => bytes,
                None => continue,
            };
            let session = Session::from_snapshot(&bytes)?;
            if !session.is_in_progress() {
                debug!("{} | dropping finished session from the store", id);
                self.store.remove(id)?;
                continue;
            }
            if let Some(active) = restored {
                warn!("{} | ignored, session {} already restored", id, active);
                continue;
            }
            info!("{} | restored in {}", id, session.status());
            let (_, evicted) = self.directory.install(session, self.now())?;
            // only the replaced snapshot goes, restore has nothing to relay
            self.evict(evicted);
            restored = Some(id);
        }
        Ok(restored)
    }
}
