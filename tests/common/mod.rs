#![allow(dead_code)]

use anontx_core::config::MixConfig;
use anontx_core::consensus::serialize;
use anontx_core::coordinator::Coordinator;
use anontx_core::escrow::Deposit;
use anontx_core::ledger::{self, Ledger, TxOutput};
use anontx_core::message::{Outbound, PeerMessage};
use anontx_core::peer::{PeerId, Peers};
use anontx_core::role::Role;
use anontx_core::schedule::{Address, Payout};
use anontx_core::session::{SessionId, Status};
use anontx_core::store::MemoryStore;
use anontx_core::wallet::{self, CoinConstraints, MultisigEscrow, Wallet};
use anontx_core::Res;

use bitcoin::hashes::Hash;
use bitcoin::{Amount, PublicKey, Script, Txid};
use lazy_static::lazy_static;
use parking_lot::Mutex;

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

lazy_static! {
    pub static ref KEYS: [PublicKey; 3] = [
        PublicKey::from_str("02c66e7d8966b5c555af5805989da9fbf8db95e15631ce358c3a1710c962679063")
            .unwrap(),
        PublicKey::from_str("0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798")
            .unwrap(),
        PublicKey::from_str("02f9308a019258c31049344f85f89d5229b531c845836f99b08601f113bce036f9")
            .unwrap(),
    ];
    pub static ref DESTINATIONS: Vec<Address> = vec![
        Address::from_str("mvXfDjR1Fb8SrRjSgvS5V3EN8Yg7X1x1Ad").unwrap(),
        Address::from_str("mzLmA1BxTjknEXC3wQ7e9m3tdEi4dLKjsh").unwrap(),
    ];
}

pub const AMOUNT_EACH: u64 = 1_000_000;
pub const START: u64 = 1_650_000_000;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn key(role: Role) -> PublicKey {
    KEYS[role.index()]
}

pub fn payout_address(role: Role) -> Address {
    Address::from_str(&format!("payout-{}", role).to_lowercase()).unwrap()
}

pub fn peer(role: Role) -> PeerId {
    PeerId(role.index() as u64)
}

pub fn deposit(role: Role, escrow: &MultisigEscrow) -> Deposit {
    Deposit::new(
        Txid::from_inner([role.index() as u8 + 0x10; 32]),
        1,
        escrow.script.clone(),
    )
}

/// Signatures are counted in the first byte of the serialized mock transaction.
#[derive(Default)]
pub struct WalletState {
    pub broadcasts: Mutex<Vec<Vec<u8>>>,
    pub fail_sign: AtomicBool,
    pub fail_broadcast: AtomicBool,
    pub extra_signature: AtomicBool,
    gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

#[derive(Clone, Default)]
pub struct MockWallet(Arc<WalletState>);

impl Deref for MockWallet {
    type Target = WalletState;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl MockWallet {
    /// Block the next build or sign call until released. The first receiver fires once the call
    /// is blocked, the sender releases it.
    pub fn block_next_call(&self) -> (Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = channel();
        let (release_tx, release_rx) = channel();
        *self.gate.lock() = Some((entered_tx, release_rx));
        (entered_rx, release_tx)
    }

    fn wait_at_gate(&self) {
        let gate = self.gate.lock().take();
        if let Some((entered, release)) = gate {
            let _ = entered.send(());
            let _ = release.recv();
        }
    }
}

impl Wallet for MockWallet {
    fn build_transaction(
        &self,
        inputs: &[Deposit],
        outputs: &[Payout],
        constraints: &CoinConstraints,
    ) -> Result<Vec<u8>, wallet::Error> {
        self.wait_at_gate();
        let mut tx = vec![0u8];
        tx.extend(serialize(&inputs.to_vec()));
        tx.extend(serialize(&outputs.to_vec()));
        tx.extend(serialize(constraints));
        Ok(tx)
    }

    fn verify_distribution(
        &self,
        candidate: &[u8],
        inputs: &[Deposit],
        outputs: &[Payout],
    ) -> Result<bool, wallet::Error> {
        let mut expected = serialize(&inputs.to_vec());
        expected.extend(serialize(&outputs.to_vec()));
        Ok(candidate
            .get(1..)
            .map(|body| body.starts_with(&expected))
            .unwrap_or(false))
    }

    fn sign(&self, candidate: &[u8], key: &PublicKey) -> Result<(Vec<u8>, u8), wallet::Error> {
        self.wait_at_gate();
        if self.fail_sign.load(Ordering::SeqCst) {
            return Err(wallet::Error::Locked);
        }
        let mut tx = candidate.to_vec();
        match tx.first_mut() {
            Some(count) => *count += 1,
            None => return Err(wallet::Error::InvalidTransaction("empty".to_string())),
        }
        tx.extend(key.to_bytes());
        let mut count = tx[0];
        if self.extra_signature.load(Ordering::SeqCst) {
            count += 1;
        }
        Ok((tx, count))
    }

    fn broadcast(&self, final_tx: &[u8]) -> Result<(), wallet::Error> {
        if self.fail_broadcast.load(Ordering::SeqCst) {
            return Err(wallet::Error::BroadcastRejected("mempool full".to_string()));
        }
        self.broadcasts.lock().push(final_tx.to_vec());
        Ok(())
    }

    fn derive_multisig(
        &self,
        pubkeys: &[PublicKey; 3],
        threshold: u8,
    ) -> Result<MultisigEscrow, wallet::Error> {
        let mut script = vec![0x50 + threshold];
        for key in pubkeys {
            script.extend(key.to_bytes());
        }
        script.extend([0x53, 0xae]);
        let address = Address::from_str(&format!("2of3-{}", hex::encode(&script[1..9])))
            .map_err(wallet::Error::new)?;
        Ok(MultisigEscrow {
            address,
            script: Script::from(script),
        })
    }
}

#[derive(Default)]
pub struct LedgerState {
    outputs: Mutex<HashMap<(Txid, u32), (TxOutput, Address)>>,
    confirmations: Mutex<HashMap<Txid, u32>>,
    pub unavailable: AtomicBool,
}

/// Chain state shared by the three nodes.
#[derive(Clone, Default)]
pub struct MockLedger(Arc<LedgerState>);

impl Deref for MockLedger {
    type Target = LedgerState;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl MockLedger {
    pub fn pay(&self, deposit: &Deposit, amount: Amount, to: &Address, confirmations: u32) {
        self.outputs.lock().insert(
            (deposit.txid, deposit.vout),
            (
                TxOutput {
                    amount,
                    script: deposit.script.clone(),
                },
                to.clone(),
            ),
        );
        self.confirmations.lock().insert(deposit.txid, confirmations);
    }

    fn check(&self) -> Result<(), ledger::Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ledger::Error::Unavailable);
        }
        Ok(())
    }
}

impl Ledger for MockLedger {
    fn confirmations(&self, txid: &Txid) -> Result<u32, ledger::Error> {
        self.check()?;
        Ok(self.confirmations.lock().get(txid).copied().unwrap_or(0))
    }

    fn get_output(&self, txid: &Txid, vout: u32) -> Result<Option<TxOutput>, ledger::Error> {
        self.check()?;
        Ok(self
            .outputs
            .lock()
            .get(&(*txid, vout))
            .map(|(output, _)| output.clone()))
    }

    fn is_confirmed_paying(
        &self,
        txid: &Txid,
        vout: u32,
        address: &Address,
        min_amount: Amount,
    ) -> Result<bool, ledger::Error> {
        let confirmed = self.confirmations(txid)? > 0;
        Ok(confirmed
            && self
                .outputs
                .lock()
                .get(&(*txid, vout))
                .map(|(output, to)| to == address && output.amount >= min_amount)
                .unwrap_or(false))
    }
}

/// Connectivity as seen by every node.
#[derive(Clone, Default)]
pub struct MockPeers(Arc<Mutex<HashSet<PeerId>>>);

impl MockPeers {
    pub fn disconnect(&self, peer: PeerId) {
        self.0.lock().insert(peer);
    }

    pub fn reconnect(&self, peer: PeerId) {
        self.0.lock().remove(&peer);
    }
}

impl Peers for MockPeers {
    fn is_connected(&self, peer: PeerId) -> bool {
        !self.0.lock().contains(&peer)
    }
}

pub type NodeCoordinator = Coordinator<MockWallet, MockLedger, MockPeers, Arc<MemoryStore>>;

pub struct Node {
    pub role: Role,
    pub coordinator: NodeCoordinator,
    pub wallet: MockWallet,
    pub store: Arc<MemoryStore>,
}

/// Three nodes, one per role, wired through an in-memory message router.
pub struct Network {
    pub nodes: Vec<Node>,
    pub ledger: MockLedger,
    pub peers: MockPeers,
    pub clock: Arc<AtomicU64>,
    pub config: MixConfig,
}

impl Network {
    pub fn new() -> Self {
        init_logger();
        let ledger = MockLedger::default();
        let peers = MockPeers::default();
        let clock = Arc::new(AtomicU64::new(START));
        let config = MixConfig::default();
        let mut network = Network {
            nodes: vec![],
            ledger,
            peers,
            clock,
            config,
        };
        for role in Role::ALL {
            let config = network.config.clone();
            let store = Arc::new(MemoryStore::new());
            let node = network.spawn(role, config, MockWallet::default(), store);
            network.nodes.push(node);
        }
        network
    }

    fn spawn(
        &self,
        role: Role,
        config: MixConfig,
        wallet: MockWallet,
        store: Arc<MemoryStore>,
    ) -> Node {
        let clock = Arc::clone(&self.clock);
        let coordinator = Coordinator::new(
            config,
            wallet.clone(),
            self.ledger.clone(),
            self.peers.clone(),
            Arc::clone(&store),
        )
        .unwrap()
        .with_clock(move || clock.load(Ordering::SeqCst));
        Node {
            role,
            coordinator,
            wallet,
            store,
        }
    }

    /// Replace the node by a fresh process sharing the same configuration, wallet and store.
    pub fn restart(&mut self, role: Role) {
        let config = self.coordinator(role).config().clone();
        self.respawn(role, config);
    }

    /// Restart the node under another configuration.
    pub fn reconfigure(&mut self, role: Role, config: MixConfig) {
        self.respawn(role, config);
    }

    fn respawn(&mut self, role: Role, config: MixConfig) {
        let (wallet, store) = {
            let node = self.node(role);
            (node.wallet.clone(), Arc::clone(&node.store))
        };
        let node = self.spawn(role, config, wallet, store);
        self.nodes[role.index()] = node;
    }

    pub fn node(&self, role: Role) -> &Node {
        &self.nodes[role.index()]
    }

    pub fn coordinator(&self, role: Role) -> &NodeCoordinator {
        &self.node(role).coordinator
    }

    pub fn advance_clock(&self, secs: u64) {
        self.clock.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn status(&self, role: Role, id: SessionId) -> Status {
        self.coordinator(role).status(id).unwrap().status
    }

    /// Deliver the messages emitted by `from`, stops at the first handler error.
    pub fn deliver(&self, from: Role, outbound: Vec<Outbound>) -> Res<()> {
        for out in outbound {
            assert_eq!(out.peer, peer(out.role));
            let target = self.coordinator(out.role);
            let sender = peer(from);
            let relayed = match out.message {
                PeerMessage::Invite {
                    session_id,
                    role,
                    schedule,
                    fees,
                } => target.on_invite(
                    sender,
                    session_id,
                    role,
                    schedule,
                    fees,
                    CoinConstraints::default(),
                )?,
                PeerMessage::AddressAndKey {
                    session_id,
                    role,
                    address,
                    pubkey,
                } => target.on_address_and_key(sender, session_id, role, address, pubkey)?,
                PeerMessage::DepositNotice {
                    session_id,
                    role,
                    deposit,
                } => target.on_deposit_notice(session_id, role, deposit)?,
                PeerMessage::SignatureRound {
                    session_id,
                    round,
                    candidate_tx,
                } => target.on_signature_round(session_id, round, candidate_tx)?,
                PeerMessage::Commit {
                    session_id,
                    final_tx,
                } => target.on_commit(session_id, final_tx)?,
                PeerMessage::Cancel { session_id } => target.on_cancel(session_id)?,
            };
            assert!(relayed.is_empty());
        }
        Ok(())
    }

    /// The Sender starts a session and the invited nodes learn about each other.
    pub fn start(&self) -> SessionId {
        let (id, invites) = self
            .coordinator(Role::Sender)
            .begin_send(
                DESTINATIONS.clone(),
                Amount::from_sat(AMOUNT_EACH),
                CoinConstraints::default(),
                peer(Role::Mixer),
                peer(Role::Guarantor),
            )
            .unwrap();
        assert_eq!(invites.len(), 2);
        self.deliver(Role::Sender, invites).unwrap();
        self.introduce(id);
        id
    }

    pub fn introduce(&self, id: SessionId) {
        self.coordinator(Role::Mixer)
            .attach_peer(id, Role::Guarantor, peer(Role::Guarantor))
            .unwrap();
        self.coordinator(Role::Guarantor)
            .attach_peer(id, Role::Mixer, peer(Role::Mixer))
            .unwrap();
    }

    pub fn exchange_keys(&self, id: SessionId) {
        for role in Role::ALL {
            let out = self
                .coordinator(role)
                .set_own_address_and_key(id, payout_address(role), key(role))
                .unwrap();
            self.deliver(role, out).unwrap();
        }
    }

    pub fn derive_escrow(&self, id: SessionId) -> MultisigEscrow {
        for role in Role::ALL {
            self.coordinator(role).derive_multisig_address(id).unwrap();
        }
        let handle = self.coordinator(Role::Sender).directory().get(id).unwrap();
        let escrow = handle.lock().escrow().cloned().unwrap();
        escrow
    }

    /// Pay and announce the deposit of `role`, `shortfall` satoshis below its share.
    pub fn deposit(&self, id: SessionId, role: Role, escrow: &MultisigEscrow, shortfall: u64) {
        let required = self
            .coordinator(role)
            .required_coins(id, None)
            .unwrap()
            .as_sat();
        let deposit = deposit(role, escrow);
        self.ledger.pay(
            &deposit,
            Amount::from_sat(required - shortfall),
            &escrow.address,
            6,
        );
        let out = self
            .coordinator(role)
            .record_own_deposit(id, deposit)
            .unwrap();
        self.deliver(role, out).unwrap();
    }

    pub fn run_until_deposited(&self) -> SessionId {
        let id = self.start();
        self.exchange_keys(id);
        let escrow = self.derive_escrow(id);
        for role in Role::ALL {
            self.deposit(id, role, &escrow, 0);
        }
        id
    }

    pub fn run_until_verified(&self) -> SessionId {
        let id = self.run_until_deposited();
        for role in Role::ALL {
            self.coordinator(role).verify_deposits(id).unwrap();
        }
        id
    }

    pub fn sign_all(&self, id: SessionId) {
        for role in Role::ALL {
            let out = self.coordinator(role).contribute_signature(id).unwrap();
            self.deliver(role, out).unwrap();
        }
    }
}
