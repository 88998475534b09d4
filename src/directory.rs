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

//! Directory of the sessions run by this node. A node takes part in at most one session at a
//! time; a new session only replaces the active one once it completed or can be reset.
//!
//! Lock order is directory first, then session. Callers holding a session lock must release it
//! before calling into the directory.

use log::{info, warn};
use parking_lot::Mutex;

use std::sync::Arc;

use crate::peer::PeerId;
use crate::role::Role;
use crate::schedule::FeePolicy;
use crate::session::{Session, SessionId};
use crate::{Error, Res};

/// Shared handle on a session, the lock covers a whole state transition.
pub type SessionHandle = Arc<Mutex<Session>>;

/// What a sweep did to an idle session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display(Debug)]
pub enum SweepOutcome {
    /// The session was reset and dropped from the directory.
    Reset(SessionId),
    /// The session cannot be reset and waits for an operator.
    Flagged(SessionId),
}

/// A session replaced by a new one. Its snapshot is obsolete and the counterparts it was still
/// running with must be told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub id: SessionId,
    /// Counterparts of the session if it was reset while in progress, empty otherwise.
    pub counterparts: Vec<(Role, Option<PeerId>)>,
}

#[derive(Debug)]
pub struct SessionDirectory {
    fees: FeePolicy,
    active: Mutex<Option<(SessionId, SessionHandle)>>,
}

impl SessionDirectory {
    pub fn new(fees: FeePolicy) -> Self {
        Self {
            fees,
            active: Mutex::new(None),
        }
    }

    /// The session with the given identifier, created if no other session is in progress. An
    /// in-progress session that can be reset is reset and replaced, and returned as evicted.
    pub fn get_or_create(
        &self,
        id: SessionId,
        now: u64,
    ) -> Res<(SessionHandle, Option<Eviction>)> {
        self.admit(Session::new(id, self.fees, now), false, now)
    }

    /// Make a restored session the active one, same rules as [`Self::get_or_create`].
    pub fn install(
        &self,
        session: Session,
        now: u64,
    ) -> Res<(SessionHandle, Option<Eviction>)> {
        self.admit(session, true, now)
    }

    fn admit(
        &self,
        session: Session,
        replace: bool,
        now: u64,
    ) -> Res<(SessionHandle, Option<Eviction>)> {
        let id = session.id();
        let mut active = self.active.lock();
        let mut evicted = None;
        if let Some((current_id, handle)) = active.as_ref() {
            if *current_id == id {
                if replace {
                    *handle.lock() = session;
                }
                return Ok((Arc::clone(handle), None));
            }
            let mut current = handle.lock();
            let mut counterparts = vec![];
            if current.is_in_progress() {
                if current.is_busy() || !current.can_reset() {
                    warn!("{} | refusing session {}, still active", current_id, id);
                    return Err(Error::SessionAlreadyActive(*current_id));
                }
                counterparts = current.counterparts();
                current.reset(true, now)?;
            }
            info!("{} | replaced by session {}", current_id, id);
            evicted = Some(Eviction {
                id: *current_id,
                counterparts,
            });
        }
        let handle = Arc::new(Mutex::new(session));
        *active = Some((id, Arc::clone(&handle)));
        Ok((handle, evicted))
    }

    pub fn get(&self, id: SessionId) -> Res<SessionHandle> {
        match self.active.lock().as_ref() {
            Some((current_id, handle)) if *current_id == id => Ok(Arc::clone(handle)),
            _ => Err(Error::UnknownSession(id)),
        }
    }

    pub fn active_session(&self) -> Option<SessionHandle> {
        self.active
            .lock()
            .as_ref()
            .map(|(_, handle)| Arc::clone(handle))
    }

    pub fn active_id(&self) -> Option<SessionId> {
        self.active.lock().as_ref().map(|(id, _)| *id)
    }

    /// Drop the session from the directory, returns false if it was not the active one.
    pub fn remove(&self, id: SessionId) -> bool {
        let mut active = self.active.lock();
        match active.as_ref() {
            Some((current_id, _)) if *current_id == id => {
                *active = None;
                true
            }
            _ => false,
        }
    }

    /// Reset sessions idle for more than `max_idle` seconds when possible, flag them for
    /// intervention otherwise. Sessions with a transition in flight are skipped.
    pub fn sweep_stale(&self, now: u64, max_idle: u64) -> Vec<SweepOutcome> {
        let mut active = self.active.lock();
        let mut outcomes = vec![];
        let mut evict = false;
        if let Some((id, handle)) = active.as_ref() {
            if let Some(mut session) = handle.try_lock() {
                let idle = now.saturating_sub(session.last_activity());
                if session.is_in_progress() && !session.is_busy() && idle > max_idle {
                    if session.can_reset() {
                        match session.reset(true, now) {
                            Ok(()) => {
                                info!("{} | idle for {}s, reset", id, idle);
                                outcomes.push(SweepOutcome::Reset(*id));
                                evict = true;
                            }
                            Err(e) => warn!("{} | sweep reset failed: {}", id, e),
                        }
                    } else {
                        session.flag_for_intervention(now);
                        outcomes.push(SweepOutcome::Flagged(*id));
                    }
                }
            }
        }
        if evict {
            *active = None;
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::Deposit;
    use crate::schedule::{Address, PayoutSchedule};
    use crate::session::Status;
    use crate::wallet::CoinConstraints;

    use bitcoin::hashes::Hash;
    use bitcoin::{Amount, Script, Txid};

    use std::str::FromStr;

    fn begin(handle: &SessionHandle, now: u64) {
        let schedule = PayoutSchedule::uniform(
            vec![Address::from_str("Sdestination").unwrap()],
            Amount::from_sat(100_000),
        )
        .unwrap();
        handle
            .lock()
            .begin_as_sender(schedule, CoinConstraints::default(), PeerId(1), PeerId(2), now)
            .unwrap();
    }

    fn escrow_deposit(handle: &SessionHandle) {
        let deposit = Deposit::new(Txid::from_inner([1; 32]), 0, Script::new());
        handle
            .lock()
            .receive_deposit_notice(Role::Mixer, deposit, 5)
            .unwrap();
    }

    #[test]
    fn same_identifier_returns_the_same_session() {
        let directory = SessionDirectory::new(FeePolicy::default());
        let id = SessionId::random();
        let a = directory.get_or_create(id, 0).unwrap().0;
        let b = directory.get_or_create(id, 1).unwrap().0;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&directory.get(id).unwrap(), &a));
        assert!(matches!(
            directory.get(SessionId::random()),
            Err(Error::UnknownSession(_))
        ));
    }

    #[test]
    fn one_active_session_per_node() {
        let directory = SessionDirectory::new(FeePolicy::default());
        let first = SessionId::random();
        let handle = directory.get_or_create(first, 0).unwrap().0;
        begin(&handle, 0);
        escrow_deposit(&handle);
        let res = directory.get_or_create(SessionId::random(), 1);
        assert!(matches!(res, Err(Error::SessionAlreadyActive(id)) if id == first));
        assert_eq!(directory.active_id(), Some(first));
    }

    #[test]
    fn resettable_session_is_replaced() {
        let directory = SessionDirectory::new(FeePolicy::default());
        let first = SessionId::random();
        let handle = directory.get_or_create(first, 0).unwrap().0;
        begin(&handle, 0);
        let second = SessionId::random();
        let (_, evicted) = directory.get_or_create(second, 1).unwrap();
        assert_eq!(
            evicted,
            Some(Eviction {
                id: first,
                counterparts: vec![
                    (Role::Mixer, Some(PeerId(1))),
                    (Role::Guarantor, Some(PeerId(2)))
                ],
            })
        );
        assert_eq!(directory.active_id(), Some(second));
        assert_eq!(handle.lock().status(), Status::None);

        // a session that never began is replaced without anyone to notify
        let (_, evicted) = directory.get_or_create(SessionId::random(), 2).unwrap();
        assert_eq!(
            evicted,
            Some(Eviction {
                id: second,
                counterparts: vec![],
            })
        );
    }

    #[test]
    fn sweep_resets_idle_sessions_only() {
        let directory = SessionDirectory::new(FeePolicy::default());
        let id = SessionId::random();
        let handle = directory.get_or_create(id, 0).unwrap().0;
        begin(&handle, 100);
        assert!(directory.sweep_stale(150, 60).is_empty());
        assert_eq!(directory.sweep_stale(161, 60), vec![SweepOutcome::Reset(id)]);
        assert!(directory.active_session().is_none());
        assert_eq!(handle.lock().status(), Status::None);
    }

    #[test]
    fn sweep_flags_sessions_holding_deposits() {
        let directory = SessionDirectory::new(FeePolicy::default());
        let id = SessionId::random();
        let handle = directory.get_or_create(id, 0).unwrap().0;
        begin(&handle, 0);
        escrow_deposit(&handle);
        assert_eq!(directory.sweep_stale(1_000, 60), vec![SweepOutcome::Flagged(id)]);
        let session = handle.lock();
        assert_eq!(session.status(), Status::Reserved);
        assert!(session.needs_intervention());
        assert!(session.report().needs_intervention);
    }

    #[test]
    fn sweep_skips_locked_sessions() {
        let directory = SessionDirectory::new(FeePolicy::default());
        let handle = directory.get_or_create(SessionId::random(), 0).unwrap().0;
        begin(&handle, 0);
        let _guard = handle.lock();
        assert!(directory.sweep_stale(1_000, 60).is_empty());
    }
}
