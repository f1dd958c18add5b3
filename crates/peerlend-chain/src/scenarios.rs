use alloy_primitives::U256;
use peerlend_types::Address;

use crate::mock_chain::{MockChain, SharedMockChain};
use crate::signing::{address_of, SigningError};

pub const ALICE_KEY: [u8; 32] = [0x11; 32];
pub const BOB_KEY: [u8; 32] = [0x22; 32];
pub const CAROL_KEY: [u8; 32] = [0x33; 32];

/// Settlement contract the demo envelopes are addressed to.
pub const LOAN_CONTRACT: Address = Address::new([0xc0; 20]);

/// 100 ether per funded account.
pub fn starting_balance() -> U256 {
    U256::from(100u64) * U256::from(10u64).pow(U256::from(18u64))
}

#[derive(Debug, Clone, Copy)]
pub struct DemoAccounts {
    pub alice: Address,
    pub bob: Address,
    pub carol: Address,
}

#[derive(Debug, Clone)]
pub struct DemoScenario {
    pub accounts: DemoAccounts,
    pub contract: Address,
    pub chain: SharedMockChain,
}

impl DemoScenario {
    pub fn new(chain_id: u64) -> Result<Self, SigningError> {
        let accounts = DemoAccounts {
            alice: address_of(ALICE_KEY)?,
            bob: address_of(BOB_KEY)?,
            carol: address_of(CAROL_KEY)?,
        };
        let mut chain = MockChain::new(chain_id);
        for address in [accounts.alice, accounts.bob, accounts.carol] {
            chain.fund(address, starting_balance());
        }
        Ok(Self {
            accounts,
            contract: LOAN_CONTRACT,
            chain: SharedMockChain::new(chain),
        })
    }

    pub fn key_for(&self, address: Address) -> Option<[u8; 32]> {
        if address == self.accounts.alice {
            Some(ALICE_KEY)
        } else if address == self.accounts.bob {
            Some(BOB_KEY)
        } else if address == self.accounts.carol {
            Some(CAROL_KEY)
        } else {
            None
        }
    }
}
