// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Wire codec
//!
//! `bincode` encoding of every type that crosses a silo boundary.
//!

use crate::error::Error;

use serde::{Serialize, de::DeserializeOwned};

/// Encodes a value.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    bincode::serialize(value).map_err(|e| Error::Codec(e.to_string()))
}

/// Decodes a value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    bincode::deserialize(bytes).map_err(|e| Error::Codec(e.to_string()))
}

/// Encodes and decodes a value, as a network hop would.
pub fn round_trip<T: Serialize + DeserializeOwned>(value: &T) -> Result<T, Error> {
    decode(&encode(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{ActivationAddress, ActivationId, GrainId, SiloAddress};

    #[test]
    fn test_decode_garbage_fails() {
        let result: Result<ActivationAddress, Error> = decode(&[1, 2, 3]);
        assert!(matches!(result, Err(Error::Codec(_))));
    }

    #[test]
    fn test_errors_travel_through_codec() {
        let address = ActivationAddress::new(
            SiloAddress::new("127.0.0.1", 1000, 1),
            GrainId::new("counter", "a"),
            ActivationId::from("0001"),
        );
        let error = Error::AlreadyRegistered { existing: address };
        assert_eq!(round_trip(&error).unwrap(), error);
    }
}
