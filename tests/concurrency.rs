use anontx_core::role::Role;
use anontx_core::session::Status;
use anontx_core::{Error, ErrorKind};

use std::sync::Arc;
use std::thread;

mod common;

use common::Network;

#[test]
fn second_contribution_loses_the_race() {
    let net = Arc::new(Network::new());
    let id = net.run_until_verified();
    let (entered, release) = net.node(Role::Sender).wallet.block_next_call();

    let first = {
        let net = Arc::clone(&net);
        thread::spawn(move || net.coordinator(Role::Sender).contribute_signature(id))
    };
    // The wallet is building the distribution transaction, the ticket is held.
    entered.recv().unwrap();
    assert!(net
        .coordinator(Role::Sender)
        .directory()
        .get(id)
        .unwrap()
        .lock()
        .is_busy());

    let second = {
        let net = Arc::clone(&net);
        thread::spawn(move || net.coordinator(Role::Sender).contribute_signature(id))
    }
    .join()
    .unwrap();
    assert!(matches!(second, Err(Error::ConcurrentTransition)));
    assert_eq!(second.unwrap_err().kind(), ErrorKind::Concurrency);

    // Other mutations are refused as well while the wallet runs.
    let res = net.coordinator(Role::Sender).mark_reclaimable(id, Role::Mixer);
    assert!(matches!(res, Err(Error::ConcurrentTransition)));
    assert_eq!(net.status(Role::Sender, id), Status::DepositsVerified);

    release.send(()).unwrap();
    let out = first.join().unwrap().unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(net.status(Role::Sender, id), Status::DistTxRound0);
    assert_eq!(
        net.coordinator(Role::Sender).status(id).unwrap().signed_count,
        0
    );
    net.deliver(Role::Sender, out).unwrap();
    assert_eq!(net.status(Role::Mixer, id), Status::DistTxRound0);
}

#[test]
fn inbound_round_waits_for_the_local_transition() {
    let net = Arc::new(Network::new());
    let id = net.run_until_deposited();
    let (entered, release) = net.node(Role::Mixer).wallet.block_next_call();

    // The Sender verified and signs round 0 while the Mixer is still verifying.
    net.coordinator(Role::Sender).verify_deposits(id).unwrap();
    let round0 = net
        .coordinator(Role::Sender)
        .contribute_signature(id)
        .unwrap()
        .into_iter()
        .find(|o| o.role == Role::Mixer)
        .map(|o| vec![o])
        .unwrap();

    net.coordinator(Role::Mixer).verify_deposits(id).unwrap();
    let mixer_sign = {
        let net = Arc::clone(&net);
        thread::spawn(move || net.coordinator(Role::Mixer).contribute_signature(id))
    };
    // Not the Mixer's turn: the call fails before reaching the wallet.
    assert!(matches!(
        mixer_sign.join().unwrap(),
        Err(Error::NotOurTurn { round: 0, .. })
    ));

    net.deliver(Role::Sender, round0).unwrap();
    let mixer_sign = {
        let net = Arc::clone(&net);
        thread::spawn(move || net.coordinator(Role::Mixer).contribute_signature(id))
    };
    entered.recv().unwrap();
    let res = net
        .coordinator(Role::Mixer)
        .on_signature_round(id, 1, vec![1, 0xaa]);
    assert!(matches!(res, Err(Error::ConcurrentTransition)));

    release.send(()).unwrap();
    mixer_sign.join().unwrap().unwrap();
    assert_eq!(net.status(Role::Mixer, id), Status::DistTxRound1);
}
