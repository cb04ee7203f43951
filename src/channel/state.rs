//! Parameters, balances and states of a two-party ledger channel.

use core::fmt;

use sha3::{Digest, Keccak256, Sha3_256};
use thiserror::Error;

use super::{NonceShare, PartIdx, PARTICIPANTS};
use crate::{Address, Hash, U256};

/// Balances of the channel's single asset, indexed by participant.
///
/// In a proposal index 0 is the proposer, so the vector reads `(self, peer)`
/// from the proposer's point of view.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct BalanceVector(pub [U256; PARTICIPANTS]);

impl BalanceVector {
    pub fn new(mine: impl Into<U256>, theirs: impl Into<U256>) -> Self {
        Self([mine.into(), theirs.into()])
    }

    pub fn balance(&self, idx: PartIdx) -> U256 {
        self.0[idx % PARTICIPANTS]
    }

    /// Sum of both balances, or `None` on overflow.
    pub fn total(&self) -> Option<U256> {
        self.0[0].checked_add(self.0[1])
    }

    /// The same balances seen from the other participant.
    pub fn swapped(&self) -> Self {
        Self([self.0[1], self.0[0]])
    }
}

impl fmt::Display for BalanceVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0[0], self.0[1])
    }
}

/// Parameters fixed when the channel is opened.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Params {
    pub challenge_duration: u64,
    pub nonce: U256,
    pub participants: [Address; PARTICIPANTS],
}

impl Params {
    /// Combines the nonce shares of all participants into the channel nonce.
    ///
    /// Like go-perun this uses SHA3-256 rather than Keccak-256 here.
    pub fn new(
        challenge_duration: u64,
        nonce_shares: [NonceShare; PARTICIPANTS],
        participants: [Address; PARTICIPANTS],
    ) -> Self {
        let mut hasher = Sha3_256::new();
        for share in nonce_shares {
            hasher.update(share.0);
        }
        Params {
            challenge_duration,
            nonce: U256::from_big_endian(hasher.finalize().as_slice()),
            participants,
        }
    }

    /// Keccak-256 over the 32-byte slots of all fields, addresses right
    /// aligned like in the on-chain encoding.
    pub fn channel_id(&self) -> Hash {
        let mut hasher = Keccak256::new();
        hasher.update(U256::from(self.challenge_duration).to_be_bytes());
        hasher.update(self.nonce.to_be_bytes());
        for part in self.participants {
            let mut slot = [0u8; 32];
            slot[32 - 20..].copy_from_slice(&part.0);
            hasher.update(slot);
        }
        Hash(hasher.finalize().into())
    }
}

/// Why a proposed state cannot follow the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidTransition {
    #[error("state belongs to another channel")]
    InvalidChannelID,
    #[error("current state is final")]
    CurrentStateIsFinal,
    #[error("version {proposed} does not increase current version {current}")]
    StaleVersion { current: u64, proposed: u64 },
    #[error("total balance changed")]
    TotalAllocationAmountMismatch,
}

/// Complete off-chain state of a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct State {
    id: Hash,
    version: u64,
    pub balances: BalanceVector,
    pub is_final: bool,
}

impl State {
    pub fn new(params: &Params, init_bals: BalanceVector) -> Self {
        State {
            id: params.channel_id(),
            version: 0,
            balances: init_bals,
            is_final: false,
        }
    }

    pub fn channel_id(&self) -> Hash {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Create a new state that will replace this state.
    ///
    /// Id and version stay private so callers cannot write garbage into them;
    /// this is the only way to get a state with a higher version.
    pub fn make_next_state(&self) -> Self {
        State {
            version: self.version + 1,
            ..*self
        }
    }

    /// Checks that `next` may replace `self`.
    ///
    /// Versions only have to increase strictly; the client decides whether
    /// gaps are acceptable.
    pub fn check_transition(&self, next: &State) -> Result<(), InvalidTransition> {
        if next.id != self.id {
            Err(InvalidTransition::InvalidChannelID)
        } else if self.is_final {
            Err(InvalidTransition::CurrentStateIsFinal)
        } else if next.version <= self.version {
            Err(InvalidTransition::StaleVersion {
                current: self.version,
                proposed: next.version,
            })
        } else if next.balances.total() != self.balances.total() {
            Err(InvalidTransition::TotalAllocationAmountMismatch)
        } else {
            Ok(())
        }
    }

    #[cfg(test)]
    pub(crate) fn with_version(self, version: u64) -> Self {
        State { version, ..self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Bytes32;

    fn params() -> Params {
        Params::new(
            300,
            [Bytes32([1; 32]), Bytes32([2; 32])],
            [Address([0xaa; 20]), Address([0xbb; 20])],
        )
    }

    #[test]
    fn channel_id_depends_on_all_params() {
        let p = params();
        let mut q = p;
        q.challenge_duration = 301;
        let mut r = p;
        r.participants.swap(0, 1);

        assert_eq!(p.channel_id(), params().channel_id());
        assert_ne!(p.channel_id(), q.channel_id());
        assert_ne!(p.channel_id(), r.channel_id());
    }

    #[test]
    fn nonce_combines_both_shares() {
        let a = Params::new(1, [Bytes32([1; 32]), Bytes32([2; 32])], [Address::default(); 2]);
        let b = Params::new(1, [Bytes32([2; 32]), Bytes32([1; 32])], [Address::default(); 2]);
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn next_state_is_valid_transition() {
        let s = State::new(&params(), BalanceVector::new(2000, 1000));
        let mut next = s.make_next_state();
        next.balances = BalanceVector::new(1900, 1100);
        assert_eq!(next.version(), 1);
        assert_eq!(s.check_transition(&next), Ok(()));
    }

    #[test]
    fn stale_version_rejected() {
        let s = State::new(&params(), BalanceVector::new(2000, 1000)).with_version(3);
        assert_eq!(
            s.check_transition(&s),
            Err(InvalidTransition::StaleVersion {
                current: 3,
                proposed: 3
            })
        );
        assert!(s.check_transition(&s.with_version(2)).is_err());
        assert_eq!(s.check_transition(&s.with_version(5)), Ok(()));
    }

    #[test]
    fn final_and_mismatched_states_rejected() {
        let s = State::new(&params(), BalanceVector::new(2000, 1000));

        let mut more = s.make_next_state();
        more.balances = BalanceVector::new(2000, 1001);
        assert_eq!(
            s.check_transition(&more),
            Err(InvalidTransition::TotalAllocationAmountMismatch)
        );

        let mut fin = s.make_next_state();
        fin.is_final = true;
        assert_eq!(
            fin.check_transition(&fin.make_next_state()),
            Err(InvalidTransition::CurrentStateIsFinal)
        );

        let other = State::new(
            &Params::new(1, [Bytes32([9; 32]); 2], [Address::default(); 2]),
            s.balances,
        );
        assert_eq!(
            s.check_transition(&other.make_next_state()),
            Err(InvalidTransition::InvalidChannelID)
        );
    }

    #[test]
    fn balance_vector_views() {
        let b = BalanceVector::new(2000, 1000);
        assert_eq!(b.swapped(), BalanceVector::new(1000, 2000));
        assert_eq!(b.total(), Some(U256::from(3000)));
        assert_eq!(b.to_string(), "2000:1000");
        assert_eq!(BalanceVector([U256::MAX, U256::one()]).total(), None);
    }
}
