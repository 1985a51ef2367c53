//! Strongly typed identifiers.
//!
//! Every identifier is a UUID newtype so a `UserId` can never be passed where
//! a `TenantId` is expected. All of them serialize transparently as the bare
//! UUID string, which keeps the camelCase wire contracts unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Wrap an existing UUID.
            #[must_use]
            pub const fn new(id: Uuid) -> Self {
                Self(id)
            }

            /// Consume and return the underlying UUID.
            #[must_use]
            pub const fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Tenant (merchant) owning a points economy.
    TenantId
);
uuid_id!(
    /// End customer holding a balance. Appears as `customerId` on the wire.
    UserId
);
uuid_id!(
    /// Catalog reward.
    RewardId
);
uuid_id!(
    /// Saga instance.
    RedemptionId
);
uuid_id!(
    /// Immutable ledger entry. Appears as `transactionId` on the wire.
    LedgerEntryId
);

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_through_display() {
        let raw = Uuid::new_v4();
        let tenant = TenantId::new(raw);
        let parsed: TenantId = tenant.to_string().parse().unwrap();
        assert_eq!(parsed, tenant);
        assert_eq!(parsed.into_inner(), raw);
    }

    #[test]
    fn ids_serialize_as_bare_uuid() {
        let raw = Uuid::new_v4();
        let json = serde_json::to_string(&UserId::new(raw)).unwrap();
        assert_eq!(json, format!("\"{raw}\""));
    }

    #[test]
    fn invalid_id_is_rejected() {
        assert!("not-a-uuid".parse::<RedemptionId>().is_err());
    }
}
