//! Block reward schedule and payout split helpers.

use crate::money::{Amount, COIN};
use crate::params::Network;

/// Halving period for the proof-of-stake subsidy, roughly two years.
const REWARD_HALVING_PERIOD: i32 = 1_000_000;

/// Fraction of block value paid to the developer fund, in COIN units.
const DEVELOPER_PAYMENT_RATE: Amount = 5 * COIN / 100;

/// Coinbase reward ceiling for a proof-of-work block.
pub fn proof_of_work_reward(fees: Amount, height: i32, network: Network) -> Amount {
    if network != Network::Mainnet {
        if height == 1 {
            return 50_000_000 * COIN;
        }
        return 5_000 * COIN + fees;
    }

    // Anti-instamine ramp, tailing to zero once staking carries the chain.
    let subsidy: Amount = if height < 120 {
        0
    } else if height < 950 {
        750 * COIN
    } else if height < 1_400 {
        550 * COIN
    } else if height < 1_900 {
        425 * COIN
    } else if height < 2_400 {
        325 * COIN
    } else if height < 2_850 {
        251 * COIN
    } else if height < 3_500 {
        190 * COIN
    } else if height < 4_000 {
        105 * COIN
    } else {
        0
    };

    subsidy + fees
}

/// Coinstake reward ceiling. The schedule is purely height-stepped; the
/// staked coin age only gates the kernel, not the payout.
pub fn proof_of_stake_reward(fees: Amount, height: i32) -> Amount {
    let subsidy: Amount = if height < 5_000 {
        30 * COIN
    } else if height < 7_000 {
        45 * COIN
    } else if height < 7_250 {
        190 * COIN
    } else if height < 8_500 {
        80 * COIN
    } else if height < 10_000 {
        15 * COIN
    } else if height < 13_500 {
        30 * COIN
    } else {
        let halvings = height / REWARD_HALVING_PERIOD;
        let mut subsidy = if halvings >= 64 {
            0
        } else {
            (40 * COIN) >> halvings
        };
        // Linear interpolation toward the next halving step.
        subsidy -=
            subsidy * ((height % REWARD_HALVING_PERIOD) as Amount) / (2 * REWARD_HALVING_PERIOD as Amount);
        subsidy
    };

    subsidy + fees
}

pub fn developer_payment(block_value: Amount) -> Amount {
    block_value * DEVELOPER_PAYMENT_RATE / COIN
}

pub fn masternode_payment(_height: i32, block_value: Amount) -> Amount {
    let developer = developer_payment(block_value);
    (block_value - developer) * 66 / 100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pow_schedule_steps() {
        assert_eq!(proof_of_work_reward(0, 1, Network::Mainnet), 0);
        assert_eq!(proof_of_work_reward(0, 119, Network::Mainnet), 0);
        assert_eq!(proof_of_work_reward(0, 120, Network::Mainnet), 750 * COIN);
        assert_eq!(proof_of_work_reward(0, 949, Network::Mainnet), 750 * COIN);
        assert_eq!(proof_of_work_reward(0, 950, Network::Mainnet), 550 * COIN);
        assert_eq!(proof_of_work_reward(0, 3_999, Network::Mainnet), 105 * COIN);
        assert_eq!(proof_of_work_reward(0, 4_000, Network::Mainnet), 0);
        assert_eq!(
            proof_of_work_reward(12_345, 4_000, Network::Mainnet),
            12_345
        );
    }

    #[test]
    fn pow_schedule_testnet() {
        assert_eq!(
            proof_of_work_reward(0, 1, Network::Testnet),
            50_000_000 * COIN
        );
        assert_eq!(proof_of_work_reward(0, 2, Network::Testnet), 5_000 * COIN);
    }

    #[test]
    fn pos_schedule_steps() {
        assert_eq!(proof_of_stake_reward(0, 1_000), 30 * COIN);
        assert_eq!(proof_of_stake_reward(0, 5_000), 45 * COIN);
        assert_eq!(proof_of_stake_reward(0, 7_100), 190 * COIN);
        assert_eq!(proof_of_stake_reward(0, 8_000), 80 * COIN);
        assert_eq!(proof_of_stake_reward(0, 9_000), 15 * COIN);
        assert_eq!(proof_of_stake_reward(0, 13_000), 30 * COIN);
    }

    #[test]
    fn pos_schedule_interpolates_between_halvings() {
        let at_start = proof_of_stake_reward(0, 13_500);
        assert_eq!(
            at_start,
            40 * COIN - (40 * COIN) * 13_500 / (2 * REWARD_HALVING_PERIOD as Amount)
        );

        // Midway through the first period half of the step has been shed.
        let midway = proof_of_stake_reward(0, REWARD_HALVING_PERIOD / 2);
        assert_eq!(midway, 40 * COIN - 40 * COIN / 4);

        // The period boundary starts the next halving step cleanly.
        let second_period = proof_of_stake_reward(0, REWARD_HALVING_PERIOD);
        assert_eq!(second_period, 20 * COIN);
    }

    #[test]
    fn pos_schedule_exhausts_after_64_halvings() {
        assert_eq!(proof_of_stake_reward(0, 64 * REWARD_HALVING_PERIOD), 0);
        assert_eq!(proof_of_stake_reward(77, 64 * REWARD_HALVING_PERIOD), 77);
    }

    #[test]
    fn payout_split() {
        let reward = 40 * COIN;
        let dev = developer_payment(reward);
        assert_eq!(dev, 2 * COIN);
        let mn = masternode_payment(20_000, reward);
        assert_eq!(mn, (reward - dev) * 66 / 100);
        assert!(mn + dev < reward);
    }
}
