//! Foundational types for the RBFT ordering kernel.
//!
//! This crate provides the types shared by every layer of the consensus
//! implementation:
//!
//! - **Identifiers**: [`ReplicaId`], view / sequence / epoch scalars
//! - **Digests**: [`Digest`] (batch digest) and [`Hash`] (Keccak-256)
//! - **Crypto**: [`KeyPair`], [`PublicKey`], [`Signature`]
//! - **Batches**: the [`Transaction`] trait and [`RequestBatch`]
//! - **Epochs**: [`EpochInfo`], [`ConsensusParams`], [`ValidatorInfo`]
//! - **Service state**: [`MetaState`], [`ServiceState`], [`NodeStatus`]
//!
//! # Design Philosophy
//!
//! This crate is self-contained and does not depend on any other workspace
//! crate, making it the foundation layer.

mod batch;
mod crypto;
mod digest;
mod epoch;
mod ids;
mod state;

pub use batch::{RequestBatch, RequestSet, Transaction};
pub use crypto::{CryptoError, KeyPair, PublicKey, Signature};
pub use digest::{Digest, Hash, HexError};
pub use epoch::{
    ConsensusParams, EpochInfo, ProposerElectionType, ValidatorInfo, DEFAULT_CHECKPOINT_PERIOD,
    DEFAULT_HIGH_WATERMARK_MULTIPLIER,
};
pub use ids::{Epoch, Height, MsgId, ReplicaId, SeqNo, View};
pub use state::{MetaState, NodeStatus, ServiceState, StatusType};
