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

//! Node level parameters of the protocol. [`MixConfig`] deserializes from a configuration file
//! and can be flattened into a node's command line.

use bitcoin::Amount;
use clap::Parser;
use thiserror::Error;

use crate::role::Role;
use crate::schedule::{FeePolicy, BPS_DENOMINATOR};

/// Invalid configuration values.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// A fee rate above 100%.
    #[error("Fee rate of {0} bps exceeds 100%")]
    FeeRateTooHigh(u16),
    /// Deposits must be confirmed before anyone signs.
    #[error("At least one confirmation is required")]
    NoConfirmation,
    /// The Sender offers a service fee below the minimum of this node.
    #[error("{role} fee of {offered} bps offered, {minimum} bps required")]
    FeeBelowMinimum {
        role: Role,
        offered: u16,
        minimum: u16,
    },
    /// The Sender offers a network fee per party below the minimum of this node.
    #[error("Network fee of {offered} sat per party offered, {minimum} sat required")]
    NetworkFeeTooLow { offered: u64, minimum: u64 },
}

/// Parameters of the anonymous transaction protocol.
#[derive(Parser, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[clap(about = "Anonymous transaction protocol parameters")]
#[serde(default)]
pub struct MixConfig {
    /// Confirmations a deposit needs before it is accepted
    #[clap(long, default_value_t = 1)]
    pub min_confirmations: u32,

    /// Network fee contributed by each escrow input, in satoshis
    #[clap(long, default_value_t = 10_000)]
    pub fee_per_party: u64,

    /// Fee paid by the Sender to the Mixer, in basis points of the payout total
    #[clap(long, default_value_t = 50)]
    pub mixer_fee_bps: u16,

    /// Fee paid by the Sender to the Guarantor, in basis points of the payout total
    #[clap(long, default_value_t = 25)]
    pub guarantor_fee_bps: u16,

    /// Seconds without activity after which a session is swept
    #[clap(long, default_value_t = 600)]
    pub max_idle_secs: u64,
}

impl MixConfig {
    pub fn validate(&self) -> Result<(), Error> {
        for bps in [self.mixer_fee_bps, self.guarantor_fee_bps] {
            if bps as u64 > BPS_DENOMINATOR {
                return Err(Error::FeeRateTooHigh(bps));
            }
        }
        if self.min_confirmations == 0 {
            return Err(Error::NoConfirmation);
        }
        Ok(())
    }

    /// Check the fees offered by a Sender to this node playing `role`. The configured rates
    /// are the minimums this node accepts.
    pub fn check_offer(&self, role: Role, offered: &FeePolicy) -> Result<(), Error> {
        for bps in [offered.mixer_fee_bps, offered.guarantor_fee_bps] {
            if bps as u64 > BPS_DENOMINATOR {
                return Err(Error::FeeRateTooHigh(bps));
            }
        }
        let (offered_bps, minimum) = match role {
            Role::Sender => return Ok(()),
            Role::Mixer => (offered.mixer_fee_bps, self.mixer_fee_bps),
            Role::Guarantor => (offered.guarantor_fee_bps, self.guarantor_fee_bps),
        };
        if offered_bps < minimum {
            return Err(Error::FeeBelowMinimum {
                role,
                offered: offered_bps,
                minimum,
            });
        }
        if offered.fee_per_party.as_sat() < self.fee_per_party {
            return Err(Error::NetworkFeeTooLow {
                offered: offered.fee_per_party.as_sat(),
                minimum: self.fee_per_party,
            });
        }
        Ok(())
    }

    pub fn fee_policy(&self) -> FeePolicy {
        FeePolicy {
            fee_per_party: Amount::from_sat(self.fee_per_party),
            mixer_fee_bps: self.mixer_fee_bps,
            guarantor_fee_bps: self.guarantor_fee_bps,
        }
    }
}

impl Default for MixConfig {
    fn default() -> Self {
        Self {
            min_confirmations: 1,
            fee_per_party: 10_000,
            mixer_fee_bps: 50,
            guarantor_fee_bps: 25,
            max_idle_secs: 600,
        }
    }
}
