//! Lease and write-enabler secrets.
//!
//! All three secret kinds are 32-byte opaque values. They are never logged
//! or displayed in full; `Debug` prints a redacted placeholder so a stray
//! `{:?}` in a log line doesn't leak a renewal or write capability.

use std::fmt;

macro_rules! secret_type {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy)]
        pub struct $name([u8; 32]);

        impl $name {
            pub fn new(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Generates a fresh random secret, for test fixtures and
            /// one-off clients exercising the server without real capability
            /// derivation.
            pub fn random() -> Self {
                Self(rand::random())
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.0 == other.0
            }
        }

        impl Eq for $name {}

        impl std::hash::Hash for $name {
            fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
                self.0.hash(state)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "(<redacted>)"))
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }
    };
}

secret_type!(
    RenewSecret,
    "Identifies a lease holder. Two leases on the same share with equal \
     renew secrets are the same lease."
);
secret_type!(
    CancelSecret,
    "Legacy wire-compatibility field. Accepted, persisted and echoed back, \
     but never consulted for authorization (SPEC_FULL.md §9)."
);
secret_type!(
    WriteEnablerSecret,
    "Per-(slot, server) secret that must be presented to mutate a slot."
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_bytes_compare_equal() {
        let a = RenewSecret::new([7u8; 32]);
        let b = RenewSecret::new([7u8; 32]);
        assert_eq!(a, b);
    }

    #[test]
    fn debug_does_not_leak_bytes() {
        let s = WriteEnablerSecret::new([0xAB; 32]);
        let rendered = format!("{s:?}");
        assert!(!rendered.contains("ab"));
        assert!(!rendered.contains("171"));
    }
}
