// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

use num_enum::TryFromPrimitive;

use crate::error::ProtocolError;

/// Daemon protocol operations. Numbering is fixed by the wider
/// ecosystem; gaps are obsolete operations this store refuses.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum OpCode {
    IsValidPath = 1,
    QueryReferrers = 6,
    AddToStore = 7,
    BuildPaths = 9,
    EnsurePath = 10,
    AddTempRoot = 11,
    AddIndirectRoot = 12,
    FindRoots = 14,
    SetOptions = 19,
    CollectGarbage = 20,
    QueryAllValidPaths = 23,
    QueryPathInfo = 26,
    QueryPathFromHashPart = 29,
    QueryValidPaths = 31,
    QueryValidDerivers = 33,
    BuildDerivation = 36,
    AddSignatures = 37,
    NarFromPath = 38,
    AddToStoreNar = 39,
    QueryMissing = 40,
    QueryDerivationOutputMap = 41,
    RegisterDrvOutput = 42,
    QueryRealisation = 43,
    AddPermRoot = 47,
}

impl OpCode {
    pub fn decode(value: u64) -> Result<Self, ProtocolError> {
        OpCode::try_from(value).map_err(|_| ProtocolError::InvalidOpCode(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_decode() {
        assert_eq!(OpCode::decode(1).unwrap(), OpCode::IsValidPath);
        assert_eq!(OpCode::decode(38).unwrap(), OpCode::NarFromPath);
        assert_eq!(OpCode::decode(47).unwrap(), OpCode::AddPermRoot);
    }

    #[test]
    fn obsolete_codes_rejected() {
        // 8 was AddTextToStore, long gone.
        assert!(matches!(
            OpCode::decode(8),
            Err(ProtocolError::InvalidOpCode(8))
        ));
        assert!(OpCode::decode(999).is_err());
    }
}
