// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Grain state store.
//!
//! Persistence interface used by the activation catalog to load grain state
//! when an activation is created and to write it back when the activation is
//! torn down. The payload is an opaque byte blob; its encoding belongs to the
//! grain.
//!

pub mod error;
pub mod memory;
pub mod storage;

pub use error::Error;
pub use memory::MemoryStorage;
pub use storage::GrainStorage;
